//! Explicit dispatch table from numeric service ids to handlers.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use wirerpc_common::{CallContext, ServiceId, StatusCode};

/// Failure reported by a handler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The parameters could not be understood. Answered with BAD_REQUEST.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Anything else. Answered with SERVER_ERROR.
    #[error("{0}")]
    Internal(String),
}

impl HandlerError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        HandlerError::BadRequest(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        HandlerError::Internal(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            HandlerError::BadRequest(_) => StatusCode::BadRequest,
            HandlerError::Internal(_) => StatusCode::ServerError,
        }
    }
}

pub type HandlerResult = Result<Bytes, HandlerError>;

/// A service implementation.
pub trait Handler: Send + Sync {
    fn call(&self, ctx: CallContext, params: Bytes) -> BoxFuture<'static, HandlerResult>;
}

struct FnHandler<F>(F);

impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(CallContext, Bytes) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, ctx: CallContext, params: Bytes) -> BoxFuture<'static, HandlerResult> {
        (self.0)(ctx, params).boxed()
    }
}

/// Registration table consulted by the dispatcher.
///
/// Filled in before the server starts and read-only afterwards.
#[derive(Default, Clone)]
pub struct ServiceRegistry {
    handlers: HashMap<ServiceId, Arc<dyn Handler>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `service_id`, replacing any previous one.
    pub fn register(&mut self, service_id: ServiceId, handler: Arc<dyn Handler>) -> &mut Self {
        self.handlers.insert(service_id, handler);
        self
    }

    /// Registers an async function over raw parameter bytes.
    pub fn register_fn<F, Fut>(&mut self, service_id: ServiceId, f: F) -> &mut Self
    where
        F: Fn(CallContext, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(service_id, Arc::new(FnHandler(f)))
    }

    /// Registers a typed handler whose parameters and result travel as JSON.
    ///
    /// Parameters that do not deserialize are answered with BAD_REQUEST
    /// before `f` is called.
    pub fn register_json<Req, Resp, F, Fut>(&mut self, service_id: ServiceId, f: F) -> &mut Self
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(CallContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, HandlerError>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.register_fn(service_id, move |ctx, params: Bytes| {
            let f = f.clone();
            async move {
                let req: Req = serde_json::from_slice(&params)
                    .map_err(|e| HandlerError::bad_request(e.to_string()))?;
                let resp = f(ctx, req).await?;
                serde_json::to_vec(&resp)
                    .map(Bytes::from)
                    .map_err(|e| HandlerError::internal(format!("failed to encode result: {}", e)))
            }
        })
    }

    pub fn get(&self, service_id: ServiceId) -> Option<&Arc<dyn Handler>> {
        self.handlers.get(&service_id)
    }

    pub fn contains(&self, service_id: ServiceId) -> bool {
        self.handlers.contains_key(&service_id)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn service_ids(&self) -> Vec<ServiceId> {
        let mut ids: Vec<_> = self.handlers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &self.service_ids())
            .finish()
    }
}
