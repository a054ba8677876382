use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::protocol::error::{Result, WireRpcError};

/// Maximum payload size of a single frame (8 MiB)
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// Size of the big-endian length prefix
pub const LENGTH_FIELD_LEN: usize = 4;

/// Length-prefixed frame codec.
///
/// Wire format: `[4-byte length as u32 big-endian] + [payload]`, where the
/// length counts payload bytes only. The decoder yields exactly one payload
/// per frame; what the payload means is up to the [`Serializer`](super::Serializer).
///
/// A frame whose declared length exceeds the ceiling is a protocol error.
/// Nothing is truncated and the caller is expected to drop the connection.
///
/// # Example
///
/// ```
/// use bytes::{Bytes, BytesMut};
/// use tokio_util::codec::{Decoder, Encoder};
/// use wirerpc_common::FrameCodec;
///
/// let mut codec = FrameCodec::new();
/// let mut wire = BytesMut::new();
/// codec.encode(Bytes::from_static(b"hello"), &mut wire).unwrap();
/// assert_eq!(&wire[..4], &5u32.to_be_bytes());
///
/// let payload = codec.decode(&mut wire).unwrap().unwrap();
/// assert_eq!(&payload[..], b"hello");
/// ```
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Creates a codec with a lower ceiling. Values above [`MAX_FRAME_SIZE`]
    /// are clamped to it.
    pub fn with_max(max_frame_size: usize) -> Self {
        Self {
            max_frame_size: max_frame_size.min(MAX_FRAME_SIZE),
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Appends one frame to `dst`, letting `write` produce the payload in place.
    ///
    /// The length prefix is reserved first and patched once the payload size
    /// is known, so the payload is never copied. On error `dst` is restored
    /// to its previous length.
    pub fn encode_with<F>(&self, dst: &mut BytesMut, write: F) -> Result<usize>
    where
        F: FnOnce(&mut BytesMut) -> Result<()>,
    {
        let start = dst.len();
        dst.put_u32(0);

        if let Err(e) = write(dst) {
            dst.truncate(start);
            return Err(e);
        }

        let payload_len = dst.len() - start - LENGTH_FIELD_LEN;
        if payload_len > self.max_frame_size {
            dst.truncate(start);
            return Err(WireRpcError::FrameTooLarge {
                size: payload_len,
                max: self.max_frame_size,
            });
        }

        dst[start..start + LENGTH_FIELD_LEN].copy_from_slice(&(payload_len as u32).to_be_bytes());
        Ok(payload_len + LENGTH_FIELD_LEN)
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = WireRpcError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>> {
        if src.len() < LENGTH_FIELD_LEN {
            return Ok(None);
        }

        let mut len_buf = [0u8; LENGTH_FIELD_LEN];
        len_buf.copy_from_slice(&src[..LENGTH_FIELD_LEN]);
        let len = u32::from_be_bytes(len_buf) as usize;

        // Validate length before allocating for it
        if len > self.max_frame_size {
            return Err(WireRpcError::FrameTooLarge {
                size: len,
                max: self.max_frame_size,
            });
        }

        let frame_len = LENGTH_FIELD_LEN + len;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_FIELD_LEN);
        Ok(Some(src.split_to(len)))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = WireRpcError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<()> {
        if item.len() > self.max_frame_size {
            return Err(WireRpcError::FrameTooLarge {
                size: item.len(),
                max: self.max_frame_size,
            });
        }
        dst.reserve(LENGTH_FIELD_LEN + item.len());
        dst.put_u32(item.len() as u32);
        dst.extend_from_slice(&item);
        Ok(())
    }
}
