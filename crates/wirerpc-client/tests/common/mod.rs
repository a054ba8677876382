//! Test servers for the client integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use wirerpc_common::{Codec, Result, SerializerKind, ServerConfig};
use wirerpc_metrics::CallMetrics;
use wirerpc_server::{DispatchHandler, HandlerError, ServerFilter, ServiceRegistry, TcpServer};

pub const ECHO: i32 = 1;
/// Sleeps 300ms, then echoes.
pub const SLOW: i32 = 2;
/// Always answers SERVER_ERROR.
pub const FAIL: i32 = 3;
/// Answers with the server's name.
pub const WHOAMI: i32 = 4;

pub struct TestServer {
    pub addr: String,
    pub metrics: Arc<CallMetrics>,
    token: CancellationToken,
    handle: JoinHandle<Result<()>>,
}

impl TestServer {
    pub async fn start(name: &str) -> Self {
        Self::builder(name).start().await
    }

    pub fn builder(name: &str) -> TestServerBuilder {
        TestServerBuilder {
            name: name.to_string(),
            bind: "127.0.0.1:0".to_string(),
            serializer: SerializerKind::Binary,
            filter: None,
        }
    }

    /// Stops accepting, answers in-flight requests and waits for the
    /// server to finish.
    pub async fn stop(self) {
        self.token.cancel();
        self.handle.await.unwrap().unwrap();
    }
}

pub struct TestServerBuilder {
    name: String,
    bind: String,
    serializer: SerializerKind,
    filter: Option<Arc<dyn ServerFilter>>,
}

impl TestServerBuilder {
    pub fn bind(mut self, addr: &str) -> Self {
        self.bind = addr.to_string();
        self
    }

    pub fn serializer(mut self, serializer: SerializerKind) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn filter(mut self, filter: Arc<dyn ServerFilter>) -> Self {
        self.filter = Some(filter);
        self
    }

    pub async fn start(self) -> TestServer {
        let name = Bytes::from(self.name);
        let mut registry = ServiceRegistry::new();
        registry
            .register_fn(ECHO, |_, params| async move { Ok(params) })
            .register_fn(SLOW, |_, params| async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok(params)
            })
            .register_fn(FAIL, |_, _| async move { Err(HandlerError::internal("always fails")) })
            .register_fn(WHOAMI, move |_, _| {
                let name = name.clone();
                async move { Ok(name) }
            });

        let metrics = Arc::new(CallMetrics::new());
        let mut dispatch = DispatchHandler::new(registry, Codec::from_kind(self.serializer))
            .with_metrics(metrics.clone());
        if let Some(filter) = self.filter {
            dispatch = dispatch.with_filter(filter);
        }

        let config = ServerConfig::new(self.bind).with_serializer(self.serializer);
        let server = TcpServer::bind(config, dispatch).await.unwrap();
        let addr = server.local_addr().unwrap().to_string();
        let token = CancellationToken::new();
        let handle = tokio::spawn(server.serve(token.clone()));

        TestServer {
            addr,
            metrics,
            token,
            handle,
        }
    }
}

/// Polls `condition` until it holds or two seconds pass.
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}
