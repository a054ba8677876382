//! A single multiplexed connection to a provider.
//!
//! Each connection is driven by one spawned task that owns both socket
//! halves. It reads response frames, writes whatever the sender has queued,
//! and runs the periodic expiry sweep. Callers never touch the socket; they
//! register a pending call and hand the request to the sender.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use wirerpc_common::transport::connect;
use wirerpc_common::{
    CallError, ClientConfig, Codec, FrameCodec, Request, RequestId, Result, SenderKind, Serializer,
    WireRpcError,
};
use wirerpc_metrics::CallMetrics;

use crate::balance::Weighted;
use crate::health::{ErrorThresholdPolicy, HealthPolicy};
use crate::pending::{CallSlot, PendingCall, PendingCallTable, ResponseFuture};
use crate::provider::Provider;
use crate::sender::{self, CallSender, RequestEncoder, SendDriver};

pub type ConnectionId = u64;

/// State changes a connection reports to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Closed { id: ConnectionId, addr: String },
    Unhealthy { id: ConnectionId },
    Healthy { id: ConnectionId },
}

/// Collaborators handed to [`Connection::open`].
pub struct ConnectionOptions {
    pub health: Box<dyn HealthPolicy>,
    pub metrics: Option<Arc<CallMetrics>>,
    pub events: Option<mpsc::UnboundedSender<ConnectionEvent>>,
    /// Cancelling this token closes the connection.
    pub shutdown: CancellationToken,
}

impl ConnectionOptions {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            health: Box::new(ErrorThresholdPolicy::from_config(config)),
            metrics: None,
            events: None,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_health(mut self, health: Box<dyn HealthPolicy>) -> Self {
        self.health = health;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<CallMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<ConnectionEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }
}

/// Hands out request ids, wrapping around `i32` and skipping ids that are
/// still in flight.
#[derive(Debug, Default)]
struct RequestIdAllocator {
    next: AtomicI32,
}

impl RequestIdAllocator {
    #[cfg(test)]
    fn starting_at(start: RequestId) -> Self {
        Self {
            next: AtomicI32::new(start),
        }
    }

    fn allocate(&self, in_use: impl Fn(RequestId) -> bool) -> RequestId {
        loop {
            let id = self.next.fetch_add(1, Ordering::Relaxed);
            if !in_use(id) {
                return id;
            }
        }
    }
}

/// Handle to a live connection. Cheap to share behind an `Arc`.
pub struct Connection {
    id: ConnectionId,
    provider: Provider,
    weight: AtomicI32,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
    sender: CallSender,
    pending: Arc<PendingCallTable>,
    health: Arc<dyn HealthPolicy>,
    request_ids: RequestIdAllocator,
    token: CancellationToken,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Dials `provider` and spawns the connection's driver task.
    pub async fn open(
        id: ConnectionId,
        provider: Provider,
        config: &ClientConfig,
        options: ConnectionOptions,
    ) -> Result<Arc<Connection>> {
        let stream = connect(&provider.addr, config.connect_timeout()).await?;
        let local_addr = stream.local_addr().ok();
        let remote_addr = stream.peer_addr().ok();
        let (read_half, write_half) = stream.into_split();

        let codec = Codec::from_kind(config.serializer);
        let (sender, sends) = sender::channel(config);
        let pending = Arc::new(match &options.metrics {
            Some(metrics) => PendingCallTable::with_metrics(metrics.clone()),
            None => PendingCallTable::new(),
        });
        let health: Arc<dyn HealthPolicy> = Arc::from(options.health);
        let token = options.shutdown.child_token();

        if let Some(metrics) = &options.metrics {
            metrics.connection_opened();
        }

        let driver = Driver {
            id,
            addr: provider.addr.clone(),
            reader: FramedRead::new(read_half, FrameCodec::new()),
            writer: BufWriter::new(write_half),
            sends,
            encoder: RequestEncoder::new(codec),
            codec,
            pending: pending.clone(),
            health: health.clone(),
            metrics: options.metrics,
            events: options.events,
            token: token.clone(),
            sweep_interval: config.sweep_interval(),
            sweep_budget: config.sweep_budget(),
            close_sweep_budget: config.close_sweep_budget(),
        };
        let handle = tokio::spawn(driver.run());

        debug!(conn_id = id, addr = %provider.addr, serializer = codec.name(), "connection established");

        Ok(Arc::new(Connection {
            id,
            weight: AtomicI32::new(provider.weight),
            provider,
            local_addr,
            remote_addr,
            sender,
            pending,
            health,
            request_ids: RequestIdAllocator::default(),
            token,
            driver: Mutex::new(Some(handle)),
        }))
    }

    /// Sends `request` and returns the future of its outcome.
    ///
    /// The request id is assigned here. The call is resolved by its response,
    /// by the expiry sweep once `expire_at` has passed, or with
    /// [`CallError::ConnectionClosed`] if the connection goes away first.
    pub async fn submit(&self, request: Request, expire_at: Instant) -> ResponseFuture {
        let (slot, future) = CallSlot::new();
        self.dispatch(request, slot, expire_at).await;
        future
    }

    /// Like [`submit`](Self::submit) for a slot the caller already holds.
    pub async fn dispatch(&self, mut request: Request, slot: CallSlot, expire_at: Instant) {
        let request_id = self.request_ids.allocate(|id| self.pending.contains(id));
        request.request_id = request_id;

        let call = PendingCall::new(request_id, request.service_id, slot, expire_at);
        if !self.pending.register(call) {
            return;
        }

        trace!(conn_id = self.id, request_id, service_id = request.service_id, "dispatching call");
        if let Err(e) = self.sender.send(request).await {
            self.pending.fail(request_id, e);
        }
    }

    /// Closes the connection and waits until every pending call is resolved.
    pub async fn close(&self) {
        self.token.cancel();
        let handle = self.driver.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(conn_id = self.id, "connection driver failed: {}", e);
            }
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn provider(&self) -> &Provider {
        &self.provider
    }

    pub fn addr(&self) -> &str {
        &self.provider.addr
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Changes the selection weight used by snapshots built from now on.
    pub fn set_weight(&self, weight: i32) {
        self.weight.store(weight, Ordering::Relaxed);
    }

    pub fn sender_kind(&self) -> SenderKind {
        self.sender.kind()
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_healthy(&self) -> bool {
        self.health.is_healthy()
    }

    /// Whether the balancer should offer this connection.
    pub fn is_available(&self) -> bool {
        !self.is_closed() && self.is_healthy()
    }

    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }
}

impl Weighted for Connection {
    fn weight(&self) -> i32 {
        self.weight.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("provider", &self.provider)
            .field("weight", &self.weight())
            .field("closed", &self.is_closed())
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[derive(Debug)]
enum CloseReason {
    Shutdown,
    PeerClosed,
    Failed(WireRpcError),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Shutdown => write!(f, "shutdown"),
            CloseReason::PeerClosed => write!(f, "closed by peer"),
            CloseReason::Failed(e) => write!(f, "{}", e),
        }
    }
}

struct Driver {
    id: ConnectionId,
    addr: String,
    reader: FramedRead<OwnedReadHalf, FrameCodec>,
    writer: BufWriter<OwnedWriteHalf>,
    sends: SendDriver,
    encoder: RequestEncoder,
    codec: Codec,
    pending: Arc<PendingCallTable>,
    health: Arc<dyn HealthPolicy>,
    metrics: Option<Arc<CallMetrics>>,
    events: Option<mpsc::UnboundedSender<ConnectionEvent>>,
    token: CancellationToken,
    sweep_interval: Duration,
    sweep_budget: Duration,
    close_sweep_budget: Duration,
}

impl Driver {
    async fn run(mut self) {
        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut healthy = self.health.is_healthy();

        let reason = loop {
            tokio::select! {
                _ = self.token.cancelled() => break CloseReason::Shutdown,

                frame = self.reader.next() => match frame {
                    Some(Ok(frame)) => {
                        if let Err(e) = self.on_frame(frame) {
                            break CloseReason::Failed(e);
                        }
                    }
                    Some(Err(e)) => break CloseReason::Failed(e),
                    None => break CloseReason::PeerClosed,
                },

                more = self.sends.ready() => {
                    if !more {
                        break CloseReason::Shutdown;
                    }
                    let pending = &self.pending;
                    let id = self.id;
                    let flushed = self
                        .sends
                        .flush(&mut self.writer, &self.encoder, |request_id, e| {
                            warn!(conn_id = id, request_id, "failed to encode request: {}", e);
                            pending.fail(request_id, CallError::Encode(e.to_string()));
                        })
                        .await;
                    if let Err(e) = flushed {
                        break CloseReason::Failed(e);
                    }
                }

                _ = sweep.tick() => {
                    let expired = self.pending.sweep_expired(self.sweep_budget);
                    for _ in 0..expired {
                        self.health.on_failure();
                    }
                }
            }

            healthy = self.report_health(healthy);
        };

        self.shutdown(reason).await;
    }

    fn on_frame(&self, frame: BytesMut) -> Result<()> {
        let payload = frame.freeze();
        match self.codec.read_response(payload.clone()) {
            Ok(response) => {
                if self.pending.complete(response.request_id, response) {
                    self.health.on_success();
                }
                Ok(())
            }
            // A bad payload with a readable id only costs that one call.
            Err(e) => match self.codec.peek_request_id(&payload) {
                Some(request_id) => {
                    warn!(conn_id = self.id, request_id, "failed to decode response: {}", e);
                    self.pending.fail(request_id, CallError::Decode(e.to_string()));
                    Ok(())
                }
                None => Err(e),
            },
        }
    }

    fn report_health(&self, was_healthy: bool) -> bool {
        let healthy = self.health.is_healthy();
        if healthy != was_healthy {
            let event = if healthy {
                info!(conn_id = self.id, addr = %self.addr, "connection healthy again");
                ConnectionEvent::Healthy { id: self.id }
            } else {
                warn!(conn_id = self.id, addr = %self.addr, "connection marked unhealthy");
                ConnectionEvent::Unhealthy { id: self.id }
            };
            self.emit(event);
        }
        healthy
    }

    async fn shutdown(mut self, reason: CloseReason) {
        self.token.cancel();
        self.sends.close();
        if let Err(e) = self.writer.shutdown().await {
            trace!(conn_id = self.id, "socket shutdown failed: {}", e);
        }

        let report = self.pending.drain_on_close(self.close_sweep_budget);
        match &reason {
            CloseReason::Failed(e) => warn!(
                conn_id = self.id,
                addr = %self.addr,
                expired = report.expired,
                closed = report.closed,
                "connection failed: {}",
                e
            ),
            _ => info!(
                conn_id = self.id,
                addr = %self.addr,
                expired = report.expired,
                closed = report.closed,
                "connection closed: {}",
                reason
            ),
        }

        if let Some(metrics) = &self.metrics {
            metrics.connection_closed();
        }
        self.emit(ConnectionEvent::Closed {
            id: self.id,
            addr: self.addr.clone(),
        });
    }

    fn emit(&self, event: ConnectionEvent) {
        if let Some(events) = &self.events {
            // The owner may already be gone.
            let _ = events.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use tokio::net::{TcpListener, TcpStream};
    use wirerpc_common::transport::{read_frame, write_frame};
    use wirerpc_common::{Response, StatusCode};

    async fn spawn_peer<F, Fut>(peer: F) -> Provider
    where
        F: FnOnce(TcpStream) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            peer(stream).await;
        });
        Provider::new(addr, 100)
    }

    async fn read_request(stream: &mut TcpStream) -> Option<Request> {
        let frame = read_frame(stream).await.ok()?;
        Codec::binary().read_request(frame.freeze()).ok()
    }

    async fn write_response(stream: &mut TcpStream, response: &Response) {
        let mut buf = BytesMut::new();
        Codec::binary().write_response(&mut buf, response).unwrap();
        write_frame(stream, &buf).await.unwrap();
    }

    fn test_config() -> ClientConfig {
        ClientConfig::default().with_sweep(10, 10)
    }

    fn deadline(ms: u64) -> Instant {
        Instant::now() + Duration::from_millis(ms)
    }

    #[test]
    fn test_request_ids_wrap_and_skip_in_flight() {
        let ids = RequestIdAllocator::starting_at(i32::MAX);
        assert_eq!(ids.allocate(|_| false), i32::MAX);
        assert_eq!(ids.allocate(|id| id == i32::MIN), i32::MIN + 1);
        assert_eq!(ids.allocate(|_| false), i32::MIN + 2);
    }

    #[tokio::test]
    async fn test_echo_round_trip() {
        let provider = spawn_peer(|mut stream| async move {
            while let Some(request) = read_request(&mut stream).await {
                write_response(&mut stream, &Response::ok(request.request_id, request.params)).await;
            }
        })
        .await;

        let config = test_config();
        let conn = Connection::open(1, provider, &config, ConnectionOptions::new(&config))
            .await
            .unwrap();
        assert!(conn.local_addr().is_some());

        let response = conn
            .submit(Request::new(8, &b"ping"[..]), deadline(1_000))
            .await
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::Ok);
        assert_eq!(&response.result[..], b"ping");
        assert_eq!(conn.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_responses_correlate_out_of_order() {
        let provider = spawn_peer(|mut stream| async move {
            let first = read_request(&mut stream).await.unwrap();
            let second = read_request(&mut stream).await.unwrap();
            write_response(&mut stream, &Response::ok(second.request_id, second.params)).await;
            write_response(&mut stream, &Response::ok(first.request_id, first.params)).await;
            let _ = read_request(&mut stream).await;
        })
        .await;

        let config = test_config().with_sender(SenderKind::Single);
        let conn = Connection::open(1, provider, &config, ConnectionOptions::new(&config))
            .await
            .unwrap();

        let a = conn.submit(Request::new(1, &b"a"[..]), deadline(1_000)).await;
        let b = conn.submit(Request::new(1, &b"b"[..]), deadline(1_000)).await;
        assert_eq!(&a.await.unwrap().result[..], b"a");
        assert_eq!(&b.await.unwrap().result[..], b"b");
    }

    #[tokio::test]
    async fn test_unanswered_call_times_out() {
        let provider = spawn_peer(|mut stream| async move {
            while read_request(&mut stream).await.is_some() {}
        })
        .await;

        let config = test_config();
        let options = ConnectionOptions::new(&config).with_health(Box::new(ErrorThresholdPolicy::new(1)));
        let conn = Connection::open(1, provider, &config, options).await.unwrap();

        let started = Instant::now();
        let outcome = conn.submit(Request::new(8, &b""[..]), deadline(50)).await.await;
        let elapsed = started.elapsed();
        assert_eq!(outcome, Err(CallError::Timeout));
        assert!(elapsed >= Duration::from_millis(50));
        // Resolved by the first sweep after the deadline, plus scheduling slack.
        assert!(elapsed < Duration::from_millis(50) + config.sweep_interval() + Duration::from_millis(150));
        assert!(!conn.is_healthy());
        assert!(!conn.is_available());
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_peer_close_drains_pending_calls() {
        let provider = spawn_peer(|mut stream| async move {
            let _ = read_request(&mut stream).await;
        })
        .await;

        let config = test_config();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let options = ConnectionOptions::new(&config).with_events(events_tx);
        let conn = Connection::open(7, provider.clone(), &config, options).await.unwrap();

        let outcome = conn.submit(Request::new(8, &b""[..]), deadline(10_000)).await.await;
        assert_eq!(outcome, Err(CallError::ConnectionClosed));
        assert_eq!(
            events_rx.recv().await,
            Some(ConnectionEvent::Closed {
                id: 7,
                addr: provider.addr
            })
        );
        assert!(conn.is_closed());

        let late = conn.submit(Request::new(8, &b""[..]), deadline(10_000)).await.await;
        assert_eq!(late, Err(CallError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_close_resolves_every_outstanding_call() {
        let provider = spawn_peer(|mut stream| async move {
            while read_request(&mut stream).await.is_some() {}
        })
        .await;

        let config = test_config();
        let metrics = Arc::new(CallMetrics::new());
        let options = ConnectionOptions::new(&config).with_metrics(metrics.clone());
        let conn = Connection::open(1, provider, &config, options).await.unwrap();

        let mut futures = Vec::new();
        for _ in 0..5 {
            futures.push(conn.submit(Request::new(8, &b""[..]), deadline(10_000)).await);
        }
        conn.close().await;

        for future in futures {
            assert_eq!(future.await, Err(CallError::ConnectionClosed));
        }
        assert_eq!(conn.pending_calls(), 0);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connection_closed, 5);
        assert_eq!(snapshot.active_connections, 0);
    }

    #[tokio::test]
    async fn test_undecodable_response_fails_only_that_call() {
        let provider = spawn_peer(|mut stream| async move {
            let first = read_request(&mut stream).await.unwrap();
            let mut garbage = BytesMut::new();
            garbage.extend_from_slice(&first.request_id.to_be_bytes());
            garbage.extend_from_slice(&[99, 0]);
            write_frame(&mut stream, &garbage).await.unwrap();

            let second = read_request(&mut stream).await.unwrap();
            write_response(&mut stream, &Response::ok(second.request_id, second.params)).await;
            let _ = read_request(&mut stream).await;
        })
        .await;

        let config = test_config().with_sender(SenderKind::Single);
        let conn = Connection::open(1, provider, &config, ConnectionOptions::new(&config))
            .await
            .unwrap();

        let first = conn.submit(Request::new(8, &b"1"[..]), deadline(1_000)).await.await;
        assert!(matches!(first, Err(CallError::Decode(_))));

        let second = conn.submit(Request::new(8, &b"2"[..]), deadline(1_000)).await.await;
        assert_eq!(&second.unwrap().result[..], b"2");
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_oversized_request_fails_with_encode_error() {
        let provider = spawn_peer(|mut stream| async move {
            while read_request(&mut stream).await.is_some() {}
        })
        .await;

        let config = test_config();
        let conn = Connection::open(1, provider, &config, ConnectionOptions::new(&config))
            .await
            .unwrap();

        let params = vec![0u8; wirerpc_common::MAX_FRAME_SIZE];
        let outcome = conn.submit(Request::new(8, params), deadline(5_000)).await.await;
        assert!(matches!(outcome, Err(CallError::Encode(_))));
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_shutdown_token_closes_connection() {
        let provider = spawn_peer(|mut stream| async move {
            while read_request(&mut stream).await.is_some() {}
        })
        .await;

        let config = test_config();
        let shutdown = CancellationToken::new();
        let options = ConnectionOptions::new(&config).with_shutdown(shutdown.clone());
        let conn = Connection::open(1, provider, &config, options).await.unwrap();

        let pending = conn.submit(Request::new(8, &b""[..]), deadline(10_000)).await;
        shutdown.cancel();
        assert_eq!(pending.await, Err(CallError::ConnectionClosed));
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_open_unreachable_provider_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let config = test_config();
        let result = Connection::open(1, Provider::new(addr, 100), &config, ConnectionOptions::new(&config)).await;
        assert!(result.is_err());
    }
}
