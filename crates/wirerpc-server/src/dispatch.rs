//! Request dispatch: decode, filter, look up, invoke, answer.

use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use futures_util::FutureExt;
use tracing::{debug, warn};
use wirerpc_common::{
    CallContext, Codec, FrameCodec, Request, Response, Result, Serializer, StatusCode,
};
use wirerpc_metrics::CallMetrics;

use crate::filter::{first_denial, ServerFilter};
use crate::registry::ServiceRegistry;

/// Message of the SERVER_ERROR sent in place of an unencodable response.
pub const ENCODE_FAILED: &str = "failed to encode response";

/// Peer addresses of the connection a frame arrived on.
#[derive(Debug, Clone, Copy, Default)]
pub struct Peer {
    pub local: Option<SocketAddr>,
    pub remote: Option<SocketAddr>,
}

/// Result of decoding a request frame.
#[derive(Debug)]
pub enum Decoded {
    Request(Request),
    /// Answer to send back without dispatching.
    Rejected(Response),
}

/// Turns request frames into response frames.
///
/// Every decodable request gets exactly one response carrying its request
/// id, whatever happens in between.
#[derive(Clone)]
pub struct DispatchHandler {
    registry: Arc<ServiceRegistry>,
    filters: Vec<Arc<dyn ServerFilter>>,
    codec: Codec,
    frames: FrameCodec,
    metrics: Option<Arc<CallMetrics>>,
}

impl DispatchHandler {
    pub fn new(registry: ServiceRegistry, codec: Codec) -> Self {
        Self {
            registry: Arc::new(registry),
            filters: Vec::new(),
            codec,
            frames: FrameCodec::new(),
            metrics: None,
        }
    }

    pub fn with_filter(mut self, filter: Arc<dyn ServerFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<CallMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_frames(mut self, frames: FrameCodec) -> Self {
        self.frames = frames;
        self
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    pub fn frames(&self) -> FrameCodec {
        self.frames
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> Option<&Arc<CallMetrics>> {
        self.metrics.as_ref()
    }

    /// Decodes one frame payload.
    ///
    /// A payload that does not decode but still exposes its request id is
    /// rejected with a BAD_REQUEST response. One without a readable id is a
    /// protocol error and the caller should drop the connection.
    pub fn decode(&self, payload: Bytes) -> Result<Decoded> {
        match self.codec.read_request(payload.clone()) {
            Ok(request) => Ok(Decoded::Request(request)),
            Err(e) => match self.codec.peek_request_id(&payload) {
                Some(request_id) => {
                    debug!(request_id, "Undecodable request: {}", e);
                    Ok(Decoded::Rejected(Response::error(
                        request_id,
                        StatusCode::BadRequest,
                        e.to_string(),
                    )))
                }
                None => Err(e),
            },
        }
    }

    /// Decodes and dispatches one frame payload.
    pub async fn handle_frame(&self, peer: Peer, payload: Bytes) -> Result<Response> {
        match self.decode(payload)? {
            Decoded::Request(request) => Ok(self.dispatch(peer, request).await),
            Decoded::Rejected(response) => Ok(response),
        }
    }

    /// Runs a decoded request through filters and its handler.
    pub async fn dispatch(&self, peer: Peer, request: Request) -> Response {
        let started = Instant::now();
        let request_id = request.request_id;
        let service_id = request.service_id;
        let tracer = request.tracer.clone();

        let ctx = CallContext::new(service_id)
            .with_addrs(peer.local, peer.remote)
            .with_tracer(tracer.clone());

        let response = if let Some(reason) = first_denial(&self.filters, &ctx, &request) {
            debug!(request_id, service_id, "Request denied by server filter: {}", reason);
            Response::error(request_id, StatusCode::ServerFilterDeny, reason)
        } else if let Some(handler) = self.registry.get(service_id) {
            let invocation = AssertUnwindSafe(handler.call(ctx, request.params)).catch_unwind();
            match invocation.await {
                Ok(Ok(result)) => Response::ok(request_id, result),
                Ok(Err(e)) => Response::error(request_id, e.status(), e.to_string()),
                Err(_) => {
                    warn!(request_id, service_id, "Handler panicked");
                    Response::error(request_id, StatusCode::ServerError, "handler panicked")
                }
            }
        } else {
            Response::error(
                request_id,
                StatusCode::NotFound,
                format!("no handler registered for service {}", service_id),
            )
        };

        if let Some(metrics) = &self.metrics {
            metrics.record(service_id, response.status, started.elapsed());
        }
        response.with_tracer(tracer)
    }

    /// Appends the framed response to `dst`.
    ///
    /// A response that cannot be encoded within the frame ceiling is
    /// replaced by a SERVER_ERROR response for the same request id. The
    /// replacement carries a fixed message so its size does not depend on
    /// the failed response. `dst` is left untouched if even that fails.
    pub fn encode(&self, dst: &mut BytesMut, response: &Response) -> Result<()> {
        match self
            .frames
            .encode_with(dst, |buf| self.codec.write_response(buf, response))
        {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(request_id = response.request_id, "Failed to encode response: {}", e);
                let fallback = Response::error(response.request_id, StatusCode::ServerError, ENCODE_FAILED)
                    .with_tracer(response.tracer);
                self.frames
                    .encode_with(dst, |buf| self.codec.write_response(buf, &fallback))
                    .map(|_| ())
            }
        }
    }
}

impl std::fmt::Debug for DispatchHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchHandler")
            .field("registry", &self.registry)
            .field("filters", &self.filters.len())
            .field("codec", &self.codec.name())
            .finish()
    }
}
