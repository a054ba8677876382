use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wirerpc_common::{Response, Result, Serializer, ServerConfig, WireRpcError};

use crate::dispatch::{Decoded, DispatchHandler, Peer};
use crate::register::{Register, Registration};

/// Protocol name announced to registers.
pub const PROTOCOL: &str = "wirerpc";

/// Responses buffered before the writer forces a write.
const WRITE_HIGH_WATER: usize = 64 * 1024;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Multiplexing TCP server.
///
/// Each connection gets a reader that decodes frames and dispatches them
/// concurrently, up to `max_in_flight` at a time, and a writer that
/// coalesces finished responses into as few writes as possible. Responses
/// go out in completion order, not arrival order.
pub struct TcpServer {
    listener: TcpListener,
    dispatch: Arc<DispatchHandler>,
    config: ServerConfig,
    register: Option<Arc<dyn Register>>,
}

impl TcpServer {
    /// Binds the listener described by `config`.
    pub async fn bind(config: ServerConfig, dispatch: DispatchHandler) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(&config.bind).await.map_err(|e| {
            WireRpcError::Connection(format!("Failed to bind to {}: {}", config.bind, e))
        })?;

        Ok(Self {
            listener,
            dispatch: Arc::new(dispatch),
            config,
            register: None,
        })
    }

    /// Announces the server through `register` while it serves.
    pub fn with_register(mut self, register: Arc<dyn Register>) -> Self {
        self.register = Some(register);
        self
    }

    /// Gets the actual bound address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| WireRpcError::Connection(format!("Failed to get local addr: {}", e)))
    }

    pub fn registration(&self) -> Result<Registration> {
        Ok(Registration {
            group: self.config.group.clone(),
            app: self.config.app.clone(),
            protocol: PROTOCOL.to_string(),
            address: self.local_addr()?.to_string(),
            weight: self.config.weight,
        })
    }

    /// Accepts connections until `shutdown` fires.
    ///
    /// On shutdown the server withdraws its registration, stops accepting,
    /// stops reading new requests, and waits for in-flight requests to be
    /// answered before returning.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        let registration = self.registration()?;
        if let Some(register) = &self.register {
            register.register(&registration)?;
        }
        info!(
            addr = %registration.address,
            serializer = self.dispatch.codec().name(),
            "Server listening"
        );

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        debug!("Connection established from {}", remote);
                        connections.spawn(handle_connection(
                            stream,
                            self.dispatch.clone(),
                            self.config.max_in_flight,
                            shutdown.child_token(),
                        ));
                    }
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        if let Some(register) = &self.register {
            if let Err(e) = register.unregister(&registration) {
                warn!("Failed to unregister {}: {}", registration, e);
            }
        }
        drop(self.listener);

        while connections.join_next().await.is_some() {}
        info!(addr = %registration.address, "Server stopped");
        Ok(())
    }
}

impl std::fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpServer")
            .field("local_addr", &self.listener.local_addr().ok())
            .field("dispatch", &self.dispatch)
            .finish()
    }
}

async fn handle_connection(
    stream: TcpStream,
    dispatch: Arc<DispatchHandler>,
    max_in_flight: usize,
    shutdown: CancellationToken,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY: {}", e);
    }
    let peer = Peer {
        local: stream.local_addr().ok(),
        remote: stream.peer_addr().ok(),
    };
    if let Some(metrics) = dispatch.metrics() {
        metrics.connection_opened();
    }

    let (read_half, write_half) = stream.into_split();
    let (responses, outbox) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_responses(write_half, outbox, dispatch.clone()));

    match read_requests(read_half, peer, &dispatch, responses, max_in_flight, &shutdown).await {
        Ok(()) => debug!(remote = ?peer.remote, "Connection closed"),
        Err(e) => warn!(remote = ?peer.remote, "Dropping connection: {}", e),
    }

    // The writer ends once every in-flight request has answered.
    match writer.await {
        Ok(Err(e)) => debug!(remote = ?peer.remote, "Failed to write responses: {}", e),
        Err(e) => warn!(remote = ?peer.remote, "Writer task failed: {}", e),
        Ok(Ok(())) => {}
    }
    if let Some(metrics) = dispatch.metrics() {
        metrics.connection_closed();
    }
}

async fn read_requests(
    read_half: tokio::net::tcp::OwnedReadHalf,
    peer: Peer,
    dispatch: &Arc<DispatchHandler>,
    responses: mpsc::UnboundedSender<Response>,
    max_in_flight: usize,
    shutdown: &CancellationToken,
) -> Result<()> {
    let mut frames = FramedRead::new(read_half, dispatch.frames());
    let permits = Arc::new(Semaphore::new(max_in_flight));

    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            frame = frames.next() => frame,
        };
        let payload = match frame {
            None => return Ok(()),
            Some(frame) => frame?.freeze(),
        };

        let request = match dispatch.decode(payload)? {
            Decoded::Request(request) => request,
            Decoded::Rejected(response) => {
                let _ = responses.send(response);
                continue;
            }
        };

        let permit = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return Ok(()),
            },
        };

        let dispatch = dispatch.clone();
        let responses = responses.clone();
        tokio::spawn(async move {
            let response = dispatch.dispatch(peer, request).await;
            let _ = responses.send(response);
            drop(permit);
        });
    }
}

async fn write_responses(
    mut writer: OwnedWriteHalf,
    mut outbox: mpsc::UnboundedReceiver<Response>,
    dispatch: Arc<DispatchHandler>,
) -> Result<()> {
    let mut buf = BytesMut::with_capacity(8 * 1024);

    while let Some(response) = outbox.recv().await {
        append_response(&dispatch, &mut buf, &response);
        while buf.len() < WRITE_HIGH_WATER {
            match outbox.try_recv() {
                Ok(response) => append_response(&dispatch, &mut buf, &response),
                Err(_) => break,
            }
        }
        writer.write_all(&buf).await?;
        buf.clear();
    }

    writer.shutdown().await?;
    Ok(())
}

/// One response that cannot be framed must not cost the others on the
/// connection, so it is dropped and its caller left to time out.
fn append_response(dispatch: &DispatchHandler, buf: &mut BytesMut, response: &Response) {
    if let Err(e) = dispatch.encode(buf, response) {
        warn!(request_id = response.request_id, "Dropping response: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register::StaticRegister;
    use crate::registry::ServiceRegistry;
    use wirerpc_common::transport::{read_frame, write_frame};
    use bytes::Bytes;
    use wirerpc_common::{Codec, FrameCodec, Request, StatusCode};

    fn echo_dispatch() -> DispatchHandler {
        let mut registry = ServiceRegistry::new();
        registry.register_fn(1, |_, params| async move { Ok(params) });
        registry.register_fn(2, |_, params| async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(params)
        });
        DispatchHandler::new(registry, Codec::binary())
    }

    async fn start() -> (SocketAddr, CancellationToken, tokio::task::JoinHandle<Result<()>>) {
        let server = TcpServer::bind(ServerConfig::new("127.0.0.1:0"), echo_dispatch())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let token = CancellationToken::new();
        let handle = tokio::spawn(server.serve(token.clone()));
        (addr, token, handle)
    }

    async fn send(stream: &mut TcpStream, request: &Request) {
        let mut buf = BytesMut::new();
        Codec::binary().write_request(&mut buf, request).unwrap();
        write_frame(stream, &buf).await.unwrap();
    }

    async fn recv(stream: &mut TcpStream) -> Response {
        let payload = read_frame(stream).await.unwrap();
        Codec::binary().read_response(payload.freeze()).unwrap()
    }

    #[tokio::test]
    async fn test_echo_round_trip() {
        let (addr, token, handle) = start().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        send(&mut stream, &Request::new(1, &b"ping"[..]).with_request_id(42)).await;
        let response = recv(&mut stream).await;
        assert_eq!(response.request_id, 42);
        assert_eq!(&response.result[..], b"ping");

        send(&mut stream, &Request::new(77, &b""[..]).with_request_id(43)).await;
        assert_eq!(recv(&mut stream).await.status, StatusCode::NotFound);

        token.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_responses_complete_out_of_order() {
        let (addr, token, _handle) = start().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        send(&mut stream, &Request::new(2, &b"slow"[..]).with_request_id(1)).await;
        send(&mut stream, &Request::new(1, &b"fast"[..]).with_request_id(2)).await;

        assert_eq!(recv(&mut stream).await.request_id, 2);
        assert_eq!(recv(&mut stream).await.request_id, 1);
        token.cancel();
    }

    #[tokio::test]
    async fn test_oversized_response_keeps_connection_open() {
        let mut registry = ServiceRegistry::new();
        registry.register_fn(1, |_, params| async move { Ok(params) });
        registry.register_fn(9, |_, _| async move { Ok(Bytes::from(vec![7u8; 1024])) });
        let dispatch = DispatchHandler::new(registry, Codec::binary()).with_frames(FrameCodec::with_max(64));

        let server = TcpServer::bind(ServerConfig::new("127.0.0.1:0"), dispatch)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let token = CancellationToken::new();
        let _handle = tokio::spawn(server.serve(token.clone()));
        let mut stream = TcpStream::connect(addr).await.unwrap();

        send(&mut stream, &Request::new(9, &b""[..]).with_request_id(1)).await;
        let response = recv(&mut stream).await;
        assert_eq!(response.request_id, 1);
        assert_eq!(response.status, StatusCode::ServerError);

        send(&mut stream, &Request::new(1, &b"still here"[..]).with_request_id(2)).await;
        let response = recv(&mut stream).await;
        assert_eq!(response.request_id, 2);
        assert_eq!(&response.result[..], b"still here");
        token.cancel();
    }

    #[tokio::test]
    async fn test_oversized_frame_closes_connection() {
        let (addr, token, _handle) = start().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        stream
            .write_all(&(wirerpc_common::MAX_FRAME_SIZE as u32 + 1).to_be_bytes())
            .await
            .unwrap();
        assert!(read_frame(&mut stream).await.is_err());
        token.cancel();
    }

    #[tokio::test]
    async fn test_shutdown_answers_in_flight_requests() {
        let (addr, token, handle) = start().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        send(&mut stream, &Request::new(2, &b"slow"[..]).with_request_id(5)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();

        let response = recv(&mut stream).await;
        assert_eq!(response.request_id, 5);
        assert!(response.is_ok());
        assert!(read_frame(&mut stream).await.is_err());
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_register_and_withdraw() {
        let register = Arc::new(StaticRegister::new());
        let server = TcpServer::bind(ServerConfig::new("127.0.0.1:0").with_weight(30), echo_dispatch())
            .await
            .unwrap()
            .with_register(register.clone());
        let addr = server.local_addr().unwrap();
        let token = CancellationToken::new();
        let handle = tokio::spawn(server.serve(token.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let registered = register.registrations();
        assert_eq!(registered.len(), 1);
        assert_eq!(registered[0].address, addr.to_string());
        assert_eq!(registered[0].weight, 30);

        token.cancel();
        handle.await.unwrap().unwrap();
        assert!(register.registrations().is_empty());
    }

    #[tokio::test]
    async fn test_bind_rejects_invalid_config() {
        let config = ServerConfig::new("127.0.0.1:0").with_weight(500);
        assert!(TcpServer::bind(config, echo_dispatch()).await.is_err());
    }
}
