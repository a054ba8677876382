//! Provider discovery.
//!
//! A [`Discover`] implementation tells listeners which providers currently
//! serve a `(group, app, protocol)` triple. The client feeds these lists
//! into [`App::set_providers`](crate::App::set_providers).

use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;
use tracing::debug;
use wirerpc_common::Result;

use crate::provider::Provider;

/// Receives the full provider list on every change.
pub type ProviderListener = Box<dyn Fn(Vec<Provider>) + Send + Sync>;

/// Identifies the provider set a listener is interested in.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DiscoverKey {
    pub group: String,
    pub app: String,
    pub protocol: String,
}

impl DiscoverKey {
    pub fn new(group: impl Into<String>, app: impl Into<String>, protocol: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            app: app.into(),
            protocol: protocol.into(),
        }
    }
}

/// Source of provider lists.
pub trait Discover: Send + Sync {
    /// Connects to the registry.
    fn init(&self, registry_addresses: &[String]) -> Result<()>;

    /// Subscribes `listener` to `key`. Implementations deliver the current
    /// list right away if they have one.
    fn add_listener(&self, key: DiscoverKey, listener: ProviderListener) -> Result<()>;

    fn close(&self);
}

/// In-memory discovery whose lists are pushed with [`update`](Self::update).
#[derive(Default)]
pub struct StaticDiscover {
    state: Mutex<StaticState>,
}

#[derive(Default)]
struct StaticState {
    providers: HashMap<DiscoverKey, Vec<Provider>>,
    listeners: Vec<(DiscoverKey, ProviderListener)>,
    closed: bool,
}

impl StaticDiscover {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the provider list of `key` and notifies its listeners.
    pub fn update(&self, key: DiscoverKey, providers: Vec<Provider>) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        debug!(group = %key.group, app = %key.app, providers = providers.len(), "provider list updated");
        for (listening, listener) in &state.listeners {
            if *listening == key {
                listener(providers.clone());
            }
        }
        state.providers.insert(key, providers);
    }

    pub fn providers(&self, key: &DiscoverKey) -> Option<Vec<Provider>> {
        self.state.lock().providers.get(key).cloned()
    }
}

impl Discover for StaticDiscover {
    fn init(&self, _registry_addresses: &[String]) -> Result<()> {
        Ok(())
    }

    fn add_listener(&self, key: DiscoverKey, listener: ProviderListener) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(providers) = state.providers.get(&key) {
            listener(providers.clone());
        }
        state.listeners.push((key, listener));
        Ok(())
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.listeners.clear();
    }
}

impl fmt::Debug for StaticDiscover {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("StaticDiscover")
            .field("keys", &state.providers.len())
            .field("listeners", &state.listeners.len())
            .finish()
    }
}
