//! WireRPC Client
//!
//! Asynchronous call dispatch over multiplexed TCP connections.
//!
//! # Architecture
//!
//! - [`App`] owns one or more [`Connection`]s per provider and routes each
//!   call through a [`LoadBalancer`] over a [`WeightableGroup`] snapshot
//! - each connection correlates in-flight calls in a [`PendingCallTable`]
//!   and writes through a [`CallSender`] (single or batched)
//! - every call resolves exactly once: response, timeout, or connection
//!   closed, as a [`CallOutcome`](wirerpc_common::CallOutcome) value
//!
//! # Example
//!
//! ```no_run
//! use wirerpc_client::{App, CallOptions, Provider, SharedTransport};
//! use wirerpc_common::ClientConfig;
//!
//! # async fn run() -> wirerpc_common::Result<()> {
//! let transport = SharedTransport::new();
//! let app = App::connect(
//!     ClientConfig::new("payments", "checkout"),
//!     transport.acquire(),
//!     vec![Provider::new("127.0.0.1:7000", 100)],
//! )
//! .await?;
//!
//! match app.call(1, &b"ping"[..], CallOptions::new()).await {
//!     Ok(response) => println!("{} bytes back", response.result.len()),
//!     Err(e) => eprintln!("call failed: {}", e),
//! }
//! app.close().await;
//! # Ok(())
//! # }
//! ```

pub mod app;
pub mod balance;
pub mod connection;
pub mod discover;
pub mod filter;
pub mod health;
pub mod pending;
pub mod provider;
pub mod sender;
pub mod shared;

pub use app::{App, AppBuilder, CallOptions};
pub use balance::{
    Balancer, LoadBalancer, RandomLoadBalancer, RoundRobinLoadBalancer, WeightableGroup, Weighted,
};
pub use connection::{Connection, ConnectionEvent, ConnectionId, ConnectionOptions};
pub use discover::{Discover, DiscoverKey, StaticDiscover};
pub use filter::{ClientFilter, FilterChain};
pub use health::{AlwaysHealthy, ErrorThresholdPolicy, HealthPolicy, HealthPolicyFactory};
pub use pending::{CallSlot, DrainReport, PendingCall, PendingCallTable, ResponseFuture};
pub use provider::Provider;
pub use sender::{CallSender, RequestEncoder, SendDriver};
pub use shared::{SharedTransport, TransportLease};
