use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Reference-counted transport shared by several clients.
///
/// Every client takes a [`TransportLease`]; connections opened under a lease
/// stop when the shared shutdown token is cancelled, which happens as soon
/// as the last lease is dropped. Acquiring again after that starts a fresh
/// generation with a new token.
///
/// The handle is passed explicitly to whoever needs it; cloning it shares
/// the same count.
#[derive(Clone, Default)]
pub struct SharedTransport {
    inner: Arc<Mutex<SharedState>>,
}

#[derive(Default)]
struct SharedState {
    leases: usize,
    token: CancellationToken,
}

impl SharedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self) -> TransportLease {
        let mut state = self.inner.lock();
        if state.leases == 0 && state.token.is_cancelled() {
            debug!("starting new shared transport generation");
            state.token = CancellationToken::new();
        }
        state.leases += 1;
        TransportLease {
            shared: self.inner.clone(),
            token: state.token.clone(),
        }
    }

    /// Number of live leases.
    pub fn lease_count(&self) -> usize {
        self.inner.lock().leases
    }

    /// Whether the current generation has been torn down.
    pub fn is_shut_down(&self) -> bool {
        self.inner.lock().token.is_cancelled()
    }
}

impl fmt::Debug for SharedTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("SharedTransport")
            .field("leases", &state.leases)
            .field("shut_down", &state.token.is_cancelled())
            .finish()
    }
}

/// An owned share of a [`SharedTransport`]. Released on drop.
pub struct TransportLease {
    shared: Arc<Mutex<SharedState>>,
    token: CancellationToken,
}

impl TransportLease {
    /// A lease that shares nothing, for a client that owns its transport
    /// outright.
    pub fn standalone() -> Self {
        SharedTransport::new().acquire()
    }

    /// Cancelled when the last lease of this generation is released.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Clone for TransportLease {
    fn clone(&self) -> Self {
        SharedTransport {
            inner: self.shared.clone(),
        }
        .acquire()
    }
}

impl Drop for TransportLease {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.leases = state.leases.saturating_sub(1);
        if state.leases == 0 {
            info!("last transport lease released, shutting down shared transport");
            state.token.cancel();
        }
    }
}

impl fmt::Debug for TransportLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportLease")
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}
