//! Provider announcement.
//!
//! A running server announces itself through a [`Register`] when it starts
//! accepting and withdraws when it stops.

use std::fmt;

use parking_lot::Mutex;
use tracing::info;
use wirerpc_common::{Result, WireRpcError};

/// What a server announces about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub group: String,
    pub app: String,
    pub protocol: String,
    pub address: String,
    pub weight: i32,
}

impl fmt::Display for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{} at {} (weight {})",
            self.group, self.app, self.protocol, self.address, self.weight
        )
    }
}

pub trait Register: Send + Sync {
    fn init(&self, registry_addresses: &[String]) -> Result<()>;

    fn register(&self, registration: &Registration) -> Result<()>;

    fn unregister(&self, registration: &Registration) -> Result<()>;

    fn close(&self);
}

/// In-memory register, mostly for tests and single-host setups.
#[derive(Debug, Default)]
pub struct StaticRegister {
    state: Mutex<(Vec<Registration>, bool)>,
}

impl StaticRegister {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registrations(&self) -> Vec<Registration> {
        self.state.lock().0.clone()
    }
}

impl Register for StaticRegister {
    fn init(&self, _registry_addresses: &[String]) -> Result<()> {
        Ok(())
    }

    fn register(&self, registration: &Registration) -> Result<()> {
        let mut state = self.state.lock();
        if state.1 {
            return Err(WireRpcError::Closed);
        }
        info!("Registered {}", registration);
        state.0.retain(|r| r.address != registration.address || r.protocol != registration.protocol);
        state.0.push(registration.clone());
        Ok(())
    }

    fn unregister(&self, registration: &Registration) -> Result<()> {
        let mut state = self.state.lock();
        state.0.retain(|r| r != registration);
        info!("Unregistered {}", registration);
        Ok(())
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.0.clear();
        state.1 = true;
    }
}
