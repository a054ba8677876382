use std::sync::Arc;

use wirerpc_common::{CallContext, FilterDecision, Request};

/// Policy consulted after a request is decoded and before its handler runs.
///
/// A denial is answered with SERVER_FILTER_DENY and the handler is skipped.
pub trait ServerFilter: Send + Sync {
    fn before(&self, ctx: &CallContext, request: &Request) -> FilterDecision;
}

impl<F> ServerFilter for F
where
    F: Fn(&CallContext, &Request) -> FilterDecision + Send + Sync,
{
    fn before(&self, ctx: &CallContext, request: &Request) -> FilterDecision {
        self(ctx, request)
    }
}

/// Runs `filters` in order and returns the first denial.
pub(crate) fn first_denial(
    filters: &[Arc<dyn ServerFilter>],
    ctx: &CallContext,
    request: &Request,
) -> Option<String> {
    filters.iter().find_map(|filter| match filter.before(ctx, request) {
        FilterDecision::Deny(reason) => Some(reason),
        FilterDecision::Continue => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_denial() {
        let filters: Vec<Arc<dyn ServerFilter>> = vec![
            Arc::new(|_: &CallContext, _: &Request| FilterDecision::Continue),
            Arc::new(|ctx: &CallContext, _: &Request| {
                if ctx.remote_addr.is_none() {
                    FilterDecision::deny("anonymous peer")
                } else {
                    FilterDecision::Continue
                }
            }),
        ];

        let request = Request::new(1, &b""[..]);
        assert_eq!(
            first_denial(&filters, &CallContext::new(1), &request).as_deref(),
            Some("anonymous peer")
        );

        let known = CallContext::new(1).with_addrs(None, Some("127.0.0.1:9".parse().unwrap()));
        assert_eq!(first_denial(&filters, &known, &request), None);
        assert_eq!(first_denial(&[], &known, &request), None);
    }
}
