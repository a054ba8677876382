use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::protocol::error::{Result, WireRpcError};
use crate::transport::frame::{LENGTH_FIELD_LEN, MAX_FRAME_SIZE};

/// Connects to a remote endpoint.
///
/// Resolves the address (which may yield several socket addresses) and tries
/// each until one accepts within `timeout`. Nagle is disabled on the
/// returned stream since callers do their own batching.
///
/// # Errors
///
/// Returns [`WireRpcError::Connection`] if the address cannot be resolved or
/// no resolved address accepts the connection.
pub async fn connect(addr: &str, timeout: Duration) -> Result<TcpStream> {
    let socket_addrs = tokio::net::lookup_host(addr)
        .await
        .map_err(|e| WireRpcError::Connection(format!("Invalid address '{}': {}", addr, e)))?;

    // Try each resolved address until one succeeds
    let mut last_err = None;
    for socket_addr in socket_addrs {
        match tokio::time::timeout(timeout, TcpStream::connect(socket_addr)).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true).map_err(|e| {
                    WireRpcError::Connection(format!("Failed to set TCP_NODELAY: {}", e))
                })?;
                return Ok(stream);
            }
            Ok(Err(e)) => last_err = Some(e.to_string()),
            Err(_) => last_err = Some(format!("timed out after {}ms", timeout.as_millis())),
        }
    }

    Err(WireRpcError::Connection(format!(
        "Failed to connect to {}: {}",
        addr,
        last_err.unwrap_or_else(|| "no addresses resolved".to_string())
    )))
}

/// Writes one length-prefixed frame and flushes.
///
/// Wire format: `[4-byte length as u32 big-endian] + [payload]`
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_SIZE {
        return Err(WireRpcError::FrameTooLarge {
            size: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    writer
        .write_all(&(payload.len() as u32).to_be_bytes())
        .await
        .map_err(|e| map_io_error(e, "writing length prefix"))?;
    writer
        .write_all(payload)
        .await
        .map_err(|e| map_io_error(e, "writing payload"))?;
    writer
        .flush()
        .await
        .map_err(|e| map_io_error(e, "flushing stream"))?;

    Ok(())
}

/// Reads exactly one length-prefixed frame.
///
/// # Errors
///
/// Returns an error if:
/// - Reading the length prefix fails
/// - The frame exceeds [`MAX_FRAME_SIZE`]
/// - Reading the payload fails
pub async fn read_frame<R>(reader: &mut R) -> Result<BytesMut>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; LENGTH_FIELD_LEN];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| map_io_error(e, "reading length prefix"))?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(WireRpcError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut buf = BytesMut::zeroed(len);
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| map_io_error(e, "reading payload"))?;

    Ok(buf)
}

/// Map IO errors to WireRpcError variants
///
/// - Peer went away -> `Connection`
/// - Other IO errors -> `Io`
fn map_io_error(err: std::io::Error, context: &str) -> WireRpcError {
    match err.kind() {
        std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::NotConnected
        | std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::UnexpectedEof => {
            WireRpcError::Connection(format!("{}: Connection lost", context))
        }
        _ => WireRpcError::Io(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_frame_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(64);

        write_frame(&mut client, b"ping").await.unwrap();
        let frame = read_frame(&mut server).await.unwrap();
        assert_eq!(&frame[..], b"ping");
    }

    #[tokio::test]
    async fn test_read_frame_rejects_oversized_length() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(&((MAX_FRAME_SIZE + 1) as u32).to_be_bytes())
            .await
            .unwrap();

        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, WireRpcError::FrameTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_read_frame_reports_eof_as_connection_lost() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);

        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, WireRpcError::Connection(_)));
    }

    #[tokio::test]
    async fn test_connect_to_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let stream = connect(&addr, Duration::from_secs(1)).await.unwrap();
        assert!(stream.nodelay().unwrap());
    }

    #[tokio::test]
    async fn test_connect_invalid_address_fails() {
        let result = connect("not-an-address", Duration::from_millis(100)).await;
        assert!(matches!(result, Err(WireRpcError::Connection(_))));
    }
}
