use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Correlation key linking an outbound call to its response.
///
/// Assigned by the client per connection and echoed verbatim by the server.
pub type RequestId = i32;

/// Stable numeric identifier of a remote service method.
pub type ServiceId = i32;

/// Opaque distributed-tracing identifiers carried alongside a call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Tracer {
    pub trace_id: i64,
    pub span_id: i64,
}

impl Tracer {
    pub fn new(trace_id: i64, span_id: i64) -> Self {
        Self { trace_id, span_id }
    }
}

/// An RPC request sent from a client to a provider.
///
/// `params` holds the already-marshalled arguments; how application values
/// are turned into bytes is up to the caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Request {
    pub request_id: RequestId,
    pub service_id: ServiceId,
    pub tracer: Option<Tracer>,
    pub params: Bytes,
}

impl Request {
    /// Creates a request for `service_id`. The request id is left at zero
    /// until the connection that carries the call assigns one.
    pub fn new(service_id: ServiceId, params: impl Into<Bytes>) -> Self {
        Request {
            request_id: 0,
            service_id,
            tracer: None,
            params: params.into(),
        }
    }

    pub fn with_request_id(mut self, request_id: RequestId) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn with_tracer(mut self, tracer: Tracer) -> Self {
        self.tracer = Some(tracer);
        self
    }
}
