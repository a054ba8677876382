//! Correlation of in-flight calls.
//!
//! Every call registered in a [`PendingCallTable`] is resolved exactly once:
//! by its response, by the expiry sweep, or by the connection draining on
//! close. Resolution always starts with `DashMap::remove`, so whichever path
//! removes the entry owns it and every later attempt finds nothing.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace};
use wirerpc_common::{CallError, CallOutcome, RequestId, Response, ServiceId};
use wirerpc_metrics::CallMetrics;

/// Entries scanned between two budget checks in a sweep.
const SWEEP_CLOCK_STRIDE: usize = 64;

/// Write-once result slot of a call.
#[derive(Debug)]
pub struct CallSlot {
    tx: Option<oneshot::Sender<CallOutcome>>,
}

impl CallSlot {
    /// Creates a slot and the future that observes it.
    pub fn new() -> (CallSlot, ResponseFuture) {
        let (tx, rx) = oneshot::channel();
        (CallSlot { tx: Some(tx) }, ResponseFuture { rx })
    }

    /// Delivers `outcome`. Returns `false` if the slot was already resolved.
    pub fn resolve(&mut self, outcome: CallOutcome) -> bool {
        match self.tx.take() {
            // The caller may have stopped waiting; the call still counts as resolved.
            Some(tx) => {
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Whether nothing can observe this slot any more: it was resolved, or
    /// the caller dropped its [`ResponseFuture`].
    pub fn is_resolved(&self) -> bool {
        self.tx.as_ref().map_or(true, |tx| tx.is_closed())
    }
}

/// Future of a submitted call. Always completes.
#[derive(Debug)]
pub struct ResponseFuture {
    rx: oneshot::Receiver<CallOutcome>,
}

impl ResponseFuture {
    /// A future that is already resolved with `outcome`.
    pub fn ready(outcome: CallOutcome) -> Self {
        let (mut slot, future) = CallSlot::new();
        slot.resolve(outcome);
        future
    }
}

impl Future for ResponseFuture {
    type Output = CallOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<CallOutcome> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(CallError::ConnectionClosed)))
    }
}

/// A registered call awaiting its response.
#[derive(Debug)]
pub struct PendingCall {
    pub request_id: RequestId,
    pub service_id: ServiceId,
    pub expire_at: Instant,
    registered_at: Instant,
    slot: CallSlot,
}

impl PendingCall {
    pub fn new(request_id: RequestId, service_id: ServiceId, slot: CallSlot, expire_at: Instant) -> Self {
        Self {
            request_id,
            service_id,
            expire_at,
            registered_at: Instant::now(),
            slot,
        }
    }
}

/// Counts reported by [`PendingCallTable::drain_on_close`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub expired: usize,
    pub closed: usize,
}

/// Outstanding calls of one connection, keyed by request id.
///
/// Registration happens on caller tasks, completion on the connection
/// driver, and the sweep on the driver's timer. No lock spans those paths;
/// the map is sharded and each entry is removed exactly once.
#[derive(Debug, Default)]
pub struct PendingCallTable {
    calls: DashMap<RequestId, PendingCall>,
    closed: AtomicBool,
    metrics: Option<Arc<CallMetrics>>,
}

impl PendingCallTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a table that reports every resolution to `metrics`.
    pub fn with_metrics(metrics: Arc<CallMetrics>) -> Self {
        Self {
            metrics: Some(metrics),
            ..Self::default()
        }
    }

    /// Inserts `call` unless its slot is already resolved.
    ///
    /// Returns whether the call is now tracked. A call registered after the
    /// table was drained is resolved with [`CallError::ConnectionClosed`]
    /// right away and is not tracked.
    pub fn register(&self, call: PendingCall) -> bool {
        if call.slot.is_resolved() {
            trace!(request_id = call.request_id, "skipping resolved call");
            return false;
        }

        let request_id = call.request_id;
        if let Some(mut displaced) = self.calls.insert(request_id, call) {
            // Ids are unique among live calls; reaching this is a caller bug,
            // but the displaced call must still be resolved.
            debug!(request_id, "request id reused while in flight");
            self.finish(&mut displaced, Err(CallError::ConnectionClosed));
        }

        // A drain that ran between the insert and this check would miss the
        // entry, so take it back out ourselves.
        if self.closed.load(Ordering::Acquire) {
            self.fail(request_id, CallError::ConnectionClosed);
            return false;
        }
        true
    }

    /// Resolves the call with its response. A miss is a silent no-op.
    pub fn complete(&self, request_id: RequestId, response: Response) -> bool {
        match self.calls.remove(&request_id) {
            Some((_, mut call)) => {
                self.finish(&mut call, Ok(response));
                true
            }
            None => {
                trace!(request_id, "response for unknown or resolved call");
                false
            }
        }
    }

    /// Resolves the call with a local failure. A miss is a silent no-op.
    pub fn fail(&self, request_id: RequestId, error: CallError) -> bool {
        match self.calls.remove(&request_id) {
            Some((_, mut call)) => {
                self.finish(&mut call, Err(error));
                true
            }
            None => false,
        }
    }

    /// Expires a single call regardless of its deadline.
    pub fn expire_one(&self, request_id: RequestId) -> bool {
        self.fail(request_id, CallError::Timeout)
    }

    /// Resolves every call whose deadline has passed with
    /// [`CallError::Timeout`], stopping once `budget` has been spent.
    ///
    /// Returns the number of calls expired. Calls left over because the
    /// budget ran out are picked up by the next sweep.
    pub fn sweep_expired(&self, budget: Duration) -> usize {
        let started = Instant::now();
        let now = started;

        let mut overdue = Vec::new();
        for (scanned, entry) in self.calls.iter().enumerate() {
            if scanned % SWEEP_CLOCK_STRIDE == SWEEP_CLOCK_STRIDE - 1 && started.elapsed() > budget {
                break;
            }
            if entry.expire_at <= now {
                overdue.push(*entry.key());
            }
        }

        let mut expired = 0;
        for request_id in overdue {
            if expired % SWEEP_CLOCK_STRIDE == SWEEP_CLOCK_STRIDE - 1 && started.elapsed() > budget {
                break;
            }
            if let Some((_, mut call)) = self.calls.remove_if(&request_id, |_, call| call.expire_at <= now) {
                self.finish(&mut call, Err(CallError::Timeout));
                expired += 1;
            }
        }

        if expired > 0 {
            debug!(expired, remaining = self.calls.len(), "expired pending calls");
        }
        expired
    }

    /// Two-phase drain run when the connection goes away.
    ///
    /// A bounded expiry sweep first lets calls that are past their deadline
    /// resolve as timeouts; everything still pending after that is resolved
    /// with [`CallError::ConnectionClosed`]. The table refuses new calls
    /// from here on.
    pub fn drain_on_close(&self, sweep_budget: Duration) -> DrainReport {
        self.closed.store(true, Ordering::Release);

        let expired = self.sweep_expired(sweep_budget);

        let remaining: Vec<RequestId> = self.calls.iter().map(|entry| *entry.key()).collect();
        let mut closed = 0;
        for request_id in remaining {
            if self.fail(request_id, CallError::ConnectionClosed) {
                closed += 1;
            }
        }

        DrainReport { expired, closed }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn contains(&self, request_id: RequestId) -> bool {
        self.calls.contains_key(&request_id)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    fn finish(&self, call: &mut PendingCall, outcome: CallOutcome) {
        if let Some(metrics) = &self.metrics {
            metrics.record_outcome(call.service_id, &outcome, call.registered_at.elapsed());
        }
        call.slot.resolve(outcome);
    }
}
