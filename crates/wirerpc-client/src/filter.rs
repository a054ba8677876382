use std::fmt;
use std::sync::Arc;

use wirerpc_common::{CallContext, FilterDecision, Request};

/// Policy consulted before a call is dispatched.
///
/// A denial resolves the call at once with
/// [`CallError::Denied`](wirerpc_common::CallError::Denied); the call is
/// never registered and nothing is written to the wire.
pub trait ClientFilter: Send + Sync {
    fn before(&self, ctx: &CallContext, request: &Request) -> FilterDecision;
}

impl<F> ClientFilter for F
where
    F: Fn(&CallContext, &Request) -> FilterDecision + Send + Sync,
{
    fn before(&self, ctx: &CallContext, request: &Request) -> FilterDecision {
        self(ctx, request)
    }
}

/// Ordered list of filters; the first denial wins.
#[derive(Clone, Default)]
pub struct FilterChain {
    filters: Vec<Arc<dyn ClientFilter>>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, filter: Arc<dyn ClientFilter>) {
        self.filters.push(filter);
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn apply(&self, ctx: &CallContext, request: &Request) -> FilterDecision {
        for filter in &self.filters {
            if let deny @ FilterDecision::Deny(_) = filter.before(ctx, request) {
                return deny;
            }
        }
        FilterDecision::Continue
    }
}

impl fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterChain")
            .field("filters", &self.filters.len())
            .finish()
    }
}
