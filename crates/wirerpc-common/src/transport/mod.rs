//! WireRPC Transport Layer
//!
//! This module provides the payload serializers and the frame codec used to
//! move requests and responses over TCP.
//!
//! # Architecture
//!
//! - **Serializer**: turns a [`Request`](crate::Request) or
//!   [`Response`](crate::Response) into payload bytes and back
//! - **Frame Codec**: wraps each payload as
//!   `[4-byte length prefix as u32 big-endian] + [payload]`
//!
//! # Components
//!
//! - **[`Serializer`]** / **[`Codec`]**: pluggable payload encodings
//!   ([`BinarySerializer`], [`JsonSerializer`], [`PostcardSerializer`])
//! - **[`FrameCodec`]**: tokio-util `Decoder`/`Encoder` for length-prefixed frames
//! - **[`tcp`]**: connect helper and async single-frame read/write
//!
//! # Frame Size Limits
//!
//! Payloads larger than [`MAX_FRAME_SIZE`] (8 MiB) are rejected on both the
//! encode and decode side. The connection is torn down instead of trying to
//! resynchronize.

pub mod codec;
pub mod frame;
pub mod tcp;

pub use codec::{BinarySerializer, Codec, JsonSerializer, PostcardSerializer, Serializer};
pub use frame::{FrameCodec, LENGTH_FIELD_LEN, MAX_FRAME_SIZE};
pub use tcp::{connect, read_frame, write_frame};
