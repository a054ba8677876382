//! WireRPC Common Types and Transport
//!
//! This crate provides the core protocol definitions, the pluggable payload
//! serializers, the length-prefixed frame codec and the configuration types
//! shared by the WireRPC client and server.
//!
//! # Overview
//!
//! WireRPC is a binary RPC framework built for low-latency service-to-service
//! calls. Many calls are multiplexed over a single TCP connection and matched
//! to their responses by a per-connection request id:
//!
//! - **Protocol Layer**: [`Request`], [`Response`], [`StatusCode`], errors and
//!   the explicit [`CallContext`]
//! - **Transport Layer**: the [`Serializer`] family and the [`FrameCodec`]
//! - **Configuration**: [`ClientConfig`] and [`ServerConfig`]
//!
//! # Architecture
//!
//! The wire protocol is deliberately small:
//! - **Transport**: TCP, one long-lived multiplexed connection per provider slot
//! - **Serialization**: pluggable (binary, JSON or postcard)
//! - **Frame Format**: `[4-byte length prefix as u32 big-endian] + [payload]`
//! - **Max Frame Size**: 8 MiB (oversized frames are a protocol error)
//!
//! # Example
//!
//! ```
//! use wirerpc_common::{Codec, Request, Response, Serializer, StatusCode};
//! use bytes::BytesMut;
//!
//! let codec = Codec::binary();
//! let request = Request::new(8, &b"ping"[..]).with_request_id(123);
//!
//! let mut buf = BytesMut::new();
//! codec.write_request(&mut buf, &request).unwrap();
//! let decoded = codec.read_request(buf.freeze()).unwrap();
//! assert_eq!(decoded.request_id, 123);
//!
//! let response = Response::ok(decoded.request_id, &b"pong"[..]);
//! assert_eq!(response.status, StatusCode::Ok);
//! ```

pub mod config;
pub mod protocol;
pub mod transport;

pub use config::{
    ClientConfig, DiscoverKind, LoadBalanceKind, SenderKind, SerializerKind, ServerConfig,
};
pub use protocol::*;
pub use transport::{Codec, FrameCodec, Serializer, MAX_FRAME_SIZE};
