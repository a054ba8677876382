use std::net::SocketAddr;
use std::time::Instant;

use super::requests::{ServiceId, Tracer};

/// Per-call context handed to filters and handlers.
///
/// Carries what a handler may want to know about the call in progress
/// (peer addresses, target service, deadline). It travels with the call as
/// an explicit argument.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub local_addr: Option<SocketAddr>,
    pub remote_addr: Option<SocketAddr>,
    pub service_id: ServiceId,
    pub deadline: Option<Instant>,
    pub tracer: Option<Tracer>,
}

impl CallContext {
    pub fn new(service_id: ServiceId) -> Self {
        Self {
            local_addr: None,
            remote_addr: None,
            service_id,
            deadline: None,
            tracer: None,
        }
    }

    pub fn with_addrs(mut self, local: Option<SocketAddr>, remote: Option<SocketAddr>) -> Self {
        self.local_addr = local;
        self.remote_addr = remote;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_tracer(mut self, tracer: Option<Tracer>) -> Self {
        self.tracer = tracer;
        self
    }

    /// Whether the deadline (if any) has already passed.
    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }
}

/// Verdict of a client or server filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterDecision {
    Continue,
    Deny(String),
}

impl FilterDecision {
    pub fn deny(reason: impl Into<String>) -> Self {
        FilterDecision::Deny(reason.into())
    }

    pub fn is_deny(&self) -> bool {
        matches!(self, FilterDecision::Deny(_))
    }
}
