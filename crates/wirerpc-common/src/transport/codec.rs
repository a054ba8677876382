use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::config::SerializerKind;
use crate::protocol::error::{Result, WireRpcError};
use crate::protocol::{Request, RequestId, Response, StatusCode, Tracer};

/// Turns protocol messages into payload bytes and back.
///
/// Implementations must be deterministic and must preserve `request_id`
/// bit-exactly on the response path, since it is the only correlation key.
pub trait Serializer: Send + Sync + 'static {
    /// Short name used in logs and configuration.
    fn name(&self) -> &'static str;

    /// Appends the encoded request to `buf`.
    fn write_request(&self, buf: &mut BytesMut, request: &Request) -> Result<()>;

    /// Decodes one request from a complete payload.
    fn read_request(&self, buf: Bytes) -> Result<Request>;

    /// Appends the encoded response to `buf`.
    fn write_response(&self, buf: &mut BytesMut, response: &Response) -> Result<()>;

    /// Decodes one response from a complete payload.
    fn read_response(&self, buf: Bytes) -> Result<Response>;

    /// Extracts the request id from a response payload without decoding the
    /// rest. Lets the client fail a single call when the body is unreadable.
    fn peek_request_id(&self, _buf: &[u8]) -> Option<RequestId> {
        None
    }
}

/// Serializer selected by configuration.
///
/// The enum keeps dispatch static for the built-in encodings; a custom
/// encoding can still be plugged in anywhere a `dyn Serializer` is accepted.
///
/// # Example
///
/// ```
/// use wirerpc_common::{Codec, Request, Serializer};
/// use bytes::BytesMut;
///
/// let codec = Codec::new();
/// let request = Request::new(42, &b"args"[..]).with_request_id(7);
///
/// let mut buf = BytesMut::new();
/// codec.write_request(&mut buf, &request).unwrap();
///
/// let decoded = codec.read_request(buf.freeze()).unwrap();
/// assert_eq!(decoded, request);
/// ```
#[derive(Debug, Clone, Copy)]
pub enum Codec {
    Binary(BinarySerializer),
    Json(JsonSerializer),
    Postcard(PostcardSerializer),
}

impl Codec {
    /// Create the default codec (binary)
    pub fn new() -> Self {
        Codec::binary()
    }

    pub fn binary() -> Self {
        Codec::Binary(BinarySerializer)
    }

    pub fn json() -> Self {
        Codec::Json(JsonSerializer)
    }

    pub fn postcard() -> Self {
        Codec::Postcard(PostcardSerializer)
    }

    pub fn from_kind(kind: SerializerKind) -> Self {
        match kind {
            SerializerKind::Binary => Codec::binary(),
            SerializerKind::Json => Codec::json(),
            SerializerKind::Postcard => Codec::postcard(),
        }
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new()
    }
}

impl Serializer for Codec {
    fn name(&self) -> &'static str {
        match self {
            Codec::Binary(s) => s.name(),
            Codec::Json(s) => s.name(),
            Codec::Postcard(s) => s.name(),
        }
    }

    fn write_request(&self, buf: &mut BytesMut, request: &Request) -> Result<()> {
        match self {
            Codec::Binary(s) => s.write_request(buf, request),
            Codec::Json(s) => s.write_request(buf, request),
            Codec::Postcard(s) => s.write_request(buf, request),
        }
    }

    fn read_request(&self, buf: Bytes) -> Result<Request> {
        match self {
            Codec::Binary(s) => s.read_request(buf),
            Codec::Json(s) => s.read_request(buf),
            Codec::Postcard(s) => s.read_request(buf),
        }
    }

    fn write_response(&self, buf: &mut BytesMut, response: &Response) -> Result<()> {
        match self {
            Codec::Binary(s) => s.write_response(buf, response),
            Codec::Json(s) => s.write_response(buf, response),
            Codec::Postcard(s) => s.write_response(buf, response),
        }
    }

    fn read_response(&self, buf: Bytes) -> Result<Response> {
        match self {
            Codec::Binary(s) => s.read_response(buf),
            Codec::Json(s) => s.read_response(buf),
            Codec::Postcard(s) => s.read_response(buf),
        }
    }

    fn peek_request_id(&self, buf: &[u8]) -> Option<RequestId> {
        match self {
            Codec::Binary(s) => s.peek_request_id(buf),
            Codec::Json(s) => s.peek_request_id(buf),
            Codec::Postcard(s) => s.peek_request_id(buf),
        }
    }
}

/// Fixed big-endian layout.
///
/// ```text
/// request:  i32 request_id | i32 service_id | u8 has_tracer | [i64 trace_id | i64 span_id] | params...
/// response: i32 request_id | i8 status      | u8 has_tracer | [i64 trace_id | i64 span_id] | result...
/// ```
///
/// The trailing bytes are sliced out of the payload without copying.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinarySerializer;

const REQUEST_HEADER_LEN: usize = 4 + 4 + 1;
const RESPONSE_HEADER_LEN: usize = 4 + 1 + 1;
const TRACER_LEN: usize = 8 + 8;

impl BinarySerializer {
    fn put_tracer(buf: &mut BytesMut, tracer: &Option<Tracer>) {
        match tracer {
            Some(tracer) => {
                buf.put_u8(1);
                buf.put_i64(tracer.trace_id);
                buf.put_i64(tracer.span_id);
            }
            None => buf.put_u8(0),
        }
    }

    fn get_tracer(buf: &mut Bytes) -> Result<Option<Tracer>> {
        match buf.get_u8() {
            0 => Ok(None),
            1 => {
                if buf.remaining() < TRACER_LEN {
                    return Err(WireRpcError::Malformed(format!(
                        "tracer needs {} bytes, {} left",
                        TRACER_LEN,
                        buf.remaining()
                    )));
                }
                Ok(Some(Tracer::new(buf.get_i64(), buf.get_i64())))
            }
            flag => Err(WireRpcError::Malformed(format!("invalid tracer flag {}", flag))),
        }
    }
}

impl Serializer for BinarySerializer {
    fn name(&self) -> &'static str {
        "binary"
    }

    fn write_request(&self, buf: &mut BytesMut, request: &Request) -> Result<()> {
        buf.reserve(REQUEST_HEADER_LEN + TRACER_LEN + request.params.len());
        buf.put_i32(request.request_id);
        buf.put_i32(request.service_id);
        Self::put_tracer(buf, &request.tracer);
        buf.extend_from_slice(&request.params);
        Ok(())
    }

    fn read_request(&self, mut buf: Bytes) -> Result<Request> {
        if buf.len() < REQUEST_HEADER_LEN {
            return Err(WireRpcError::Malformed(format!(
                "request payload too short: {} bytes",
                buf.len()
            )));
        }
        let request_id = buf.get_i32();
        let service_id = buf.get_i32();
        let tracer = Self::get_tracer(&mut buf)?;
        Ok(Request {
            request_id,
            service_id,
            tracer,
            params: buf,
        })
    }

    fn write_response(&self, buf: &mut BytesMut, response: &Response) -> Result<()> {
        buf.reserve(RESPONSE_HEADER_LEN + TRACER_LEN + response.result.len());
        buf.put_i32(response.request_id);
        buf.put_i8(response.status.as_i8());
        Self::put_tracer(buf, &response.tracer);
        buf.extend_from_slice(&response.result);
        Ok(())
    }

    fn read_response(&self, mut buf: Bytes) -> Result<Response> {
        if buf.len() < RESPONSE_HEADER_LEN {
            return Err(WireRpcError::Malformed(format!(
                "response payload too short: {} bytes",
                buf.len()
            )));
        }
        let request_id = buf.get_i32();
        let status = StatusCode::try_from(buf.get_i8())?;
        let tracer = Self::get_tracer(&mut buf)?;
        Ok(Response {
            request_id,
            status,
            tracer,
            result: buf,
        })
    }

    fn peek_request_id(&self, buf: &[u8]) -> Option<RequestId> {
        let head: [u8; 4] = buf.get(..4)?.try_into().ok()?;
        Some(i32::from_be_bytes(head))
    }
}

/// JSON encoding via serde.
///
/// Human-readable and handy for debugging; byte fields become number arrays.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn name(&self) -> &'static str {
        "json"
    }

    fn write_request(&self, buf: &mut BytesMut, request: &Request) -> Result<()> {
        serde_json::to_writer(buf.writer(), request)?;
        Ok(())
    }

    fn read_request(&self, buf: Bytes) -> Result<Request> {
        Ok(serde_json::from_slice(&buf)?)
    }

    fn write_response(&self, buf: &mut BytesMut, response: &Response) -> Result<()> {
        serde_json::to_writer(buf.writer(), response)?;
        Ok(())
    }

    fn read_response(&self, buf: Bytes) -> Result<Response> {
        Ok(serde_json::from_slice(&buf)?)
    }

    fn peek_request_id(&self, buf: &[u8]) -> Option<RequestId> {
        #[derive(serde::Deserialize)]
        struct Head {
            request_id: RequestId,
        }
        serde_json::from_slice::<Head>(buf).ok().map(|head| head.request_id)
    }
}

/// Compact postcard encoding via serde.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostcardSerializer;

impl Serializer for PostcardSerializer {
    fn name(&self) -> &'static str {
        "postcard"
    }

    fn write_request(&self, buf: &mut BytesMut, request: &Request) -> Result<()> {
        let encoded = postcard::to_allocvec(request)?;
        buf.extend_from_slice(&encoded);
        Ok(())
    }

    fn read_request(&self, buf: Bytes) -> Result<Request> {
        Ok(postcard::from_bytes(&buf)?)
    }

    fn write_response(&self, buf: &mut BytesMut, response: &Response) -> Result<()> {
        let encoded = postcard::to_allocvec(response)?;
        buf.extend_from_slice(&encoded);
        Ok(())
    }

    fn read_response(&self, buf: Bytes) -> Result<Response> {
        Ok(postcard::from_bytes(&buf)?)
    }

    fn peek_request_id(&self, buf: &[u8]) -> Option<RequestId> {
        // request_id is the first field of the struct
        postcard::take_from_bytes::<RequestId>(buf).ok().map(|(id, _)| id)
    }
}
