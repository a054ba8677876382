//! WireRPC Server
//!
//! Serves registered handlers over multiplexed TCP connections.
//!
//! # Architecture
//!
//! - [`ServiceRegistry`]: explicit table from service id to [`Handler`]
//! - [`DispatchHandler`]: decode, run [`ServerFilter`]s, look up, invoke,
//!   and encode the response with the matching status code
//! - [`TcpServer`]: accept loop with a concurrent reader and a coalescing
//!   writer per connection, shut down through a `CancellationToken`
//! - [`Register`]: announces the server while it is serving
//!
//! # Example
//!
//! ```no_run
//! use wirerpc_common::{Codec, ServerConfig};
//! use wirerpc_server::{DispatchHandler, ServiceRegistry, TcpServer};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> wirerpc_common::Result<()> {
//! let mut registry = ServiceRegistry::new();
//! registry.register_fn(1, |_, params| async move { Ok(params) });
//!
//! let dispatch = DispatchHandler::new(registry, Codec::binary());
//! let server = TcpServer::bind(ServerConfig::new("127.0.0.1:7000"), dispatch).await?;
//! server.serve(CancellationToken::new()).await
//! # }
//! ```

pub mod dispatch;
pub mod filter;
pub mod register;
pub mod registry;
pub mod server;

pub use dispatch::{Decoded, DispatchHandler, Peer};
pub use filter::ServerFilter;
pub use register::{Register, Registration, StaticRegister};
pub use registry::{Handler, HandlerError, HandlerResult, ServiceRegistry};
pub use server::{TcpServer, PROTOCOL};
