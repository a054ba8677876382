//! WireRPC Metrics
//!
//! Call statistics shared by the client and the server. Everything on the
//! recording path is a relaxed atomic increment; the only lock is taken when
//! a service id or provider is seen for the first time.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use wirerpc_common::{CallError, Response};
//! use wirerpc_metrics::CallMetrics;
//!
//! let metrics = CallMetrics::new();
//! metrics.record_outcome(8, &Ok(Response::ok(1, &b"pong"[..])), Duration::from_micros(250));
//! metrics.record_outcome(8, &Err(CallError::Timeout), Duration::from_millis(3000));
//!
//! let snapshot = metrics.snapshot();
//! assert_eq!(snapshot.total_calls, 2);
//! assert_eq!(snapshot.timeouts, 1);
//! assert_eq!(snapshot.services[&8].call_count, 2);
//! ```

mod registry;
mod snapshot;

pub use registry::{CallMetrics, MetricsConfig};
pub use snapshot::{MetricsSnapshot, ProviderMetrics, ServiceMetrics};
