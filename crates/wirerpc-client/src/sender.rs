//! Outbound call delivery.
//!
//! A sender is split in two halves. [`CallSender`] lives with the callers
//! and hands requests over; [`SendDriver`] lives in the connection's driver
//! task, which owns the socket, and is the only place requests are encoded
//! and written.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use crossbeam_queue::ArrayQueue;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tracing::trace;
use wirerpc_common::{
    CallError, ClientConfig, Codec, FrameCodec, Request, RequestId, Result, SenderKind, Serializer,
    WireRpcError,
};

/// Frames requests with the connection's serializer.
#[derive(Debug, Clone, Copy)]
pub struct RequestEncoder {
    codec: Codec,
    frames: FrameCodec,
}

impl RequestEncoder {
    pub fn new(codec: Codec) -> Self {
        Self {
            codec,
            frames: FrameCodec::new(),
        }
    }

    pub fn with_frames(codec: Codec, frames: FrameCodec) -> Self {
        Self { codec, frames }
    }

    /// Appends one framed request to `buf`, leaving it untouched on error.
    pub fn encode(&self, buf: &mut BytesMut, request: &Request) -> Result<usize> {
        self.frames
            .encode_with(buf, |dst| self.codec.write_request(dst, request))
    }
}

/// Creates both halves of a sender of the configured kind.
pub fn channel(config: &ClientConfig) -> (CallSender, SendDriver) {
    match config.sender {
        SenderKind::Single => {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                CallSender::Single(SingleSender { tx }),
                SendDriver::Single(SingleDriver {
                    rx,
                    next: None,
                    buf: BytesMut::with_capacity(4096),
                }),
            )
        }
        SenderKind::Batch => {
            let queue = Arc::new(BatchQueue {
                items: ArrayQueue::new(config.queue_capacity.max(1)),
                ready: Notify::new(),
                drained: Notify::new(),
                closed: AtomicBool::new(false),
            });
            (
                CallSender::Batch(BatchSender {
                    queue: queue.clone(),
                }),
                SendDriver::Batch(BatchDriver {
                    queue,
                    batch_size: config.batch_size.max(1),
                    batch_passes: config.batch_passes.max(1),
                    buf: BytesMut::with_capacity(64 * 1024),
                }),
            )
        }
    }
}

/// Caller-side half of a sender.
#[derive(Debug, Clone)]
pub enum CallSender {
    Single(SingleSender),
    Batch(BatchSender),
}

impl CallSender {
    /// Hands `request` to the connection.
    ///
    /// Fails with [`CallError::ConnectionClosed`] once the driver has shut
    /// the sender down. The request is consumed either way.
    pub async fn send(&self, request: Request) -> std::result::Result<(), CallError> {
        match self {
            CallSender::Single(sender) => sender.send(request),
            CallSender::Batch(sender) => sender.send(request).await,
        }
    }

    pub fn kind(&self) -> SenderKind {
        match self {
            CallSender::Single(_) => SenderKind::Single,
            CallSender::Batch(_) => SenderKind::Batch,
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            CallSender::Single(sender) => sender.tx.is_closed(),
            CallSender::Batch(sender) => sender.queue.closed.load(Ordering::Acquire),
        }
    }
}

/// Hands each request straight to the driver, which writes and flushes it
/// on its own.
#[derive(Debug, Clone)]
pub struct SingleSender {
    tx: mpsc::UnboundedSender<Request>,
}

impl SingleSender {
    fn send(&self, request: Request) -> std::result::Result<(), CallError> {
        self.tx
            .send(request)
            .map_err(|_| CallError::ConnectionClosed)
    }
}

#[derive(Debug)]
struct BatchQueue {
    items: ArrayQueue<Request>,
    /// Signals the driver that a flush is due
    ready: Notify,
    /// Signals producers that a flush made room
    drained: Notify,
    closed: AtomicBool,
}

/// Queues requests in a bounded lock-free queue for the driver to flush in
/// batches.
#[derive(Debug, Clone)]
pub struct BatchSender {
    queue: Arc<BatchQueue>,
}

impl BatchSender {
    /// Enqueues `request`. When the queue is full the driver is told to
    /// flush now, and the push is retried once that flush has made room.
    async fn send(&self, mut request: Request) -> std::result::Result<(), CallError> {
        loop {
            let drained = self.queue.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();

            if self.queue.closed.load(Ordering::Acquire) {
                return Err(CallError::ConnectionClosed);
            }

            match self.queue.items.push(request) {
                Ok(()) => {
                    self.queue.ready.notify_one();
                    return Ok(());
                }
                Err(rejected) => {
                    request = rejected;
                    trace!("outbound queue full, forcing flush");
                    self.queue.ready.notify_one();
                    drained.await;
                }
            }
        }
    }
}

/// Driver-side half of a sender.
#[derive(Debug)]
pub enum SendDriver {
    Single(SingleDriver),
    Batch(BatchDriver),
}

impl SendDriver {
    /// Waits until there is something to write.
    ///
    /// Returns `false` once no more requests can arrive. Cancel safe, so it
    /// can sit in a `select!` next to the socket reader.
    pub async fn ready(&mut self) -> bool {
        match self {
            SendDriver::Single(driver) => driver.ready().await,
            SendDriver::Batch(driver) => driver.ready().await,
        }
    }

    /// Writes whatever is ready and flushes `writer`.
    ///
    /// Requests that fail to encode are reported through `on_encode_error`
    /// and skipped; only write errors are returned. Returns the number of
    /// requests written.
    pub async fn flush<W, F>(
        &mut self,
        writer: &mut W,
        encoder: &RequestEncoder,
        on_encode_error: F,
    ) -> Result<usize>
    where
        W: AsyncWrite + Unpin,
        F: FnMut(RequestId, WireRpcError),
    {
        match self {
            SendDriver::Single(driver) => driver.flush(writer, encoder, on_encode_error).await,
            SendDriver::Batch(driver) => driver.flush(writer, encoder, on_encode_error).await,
        }
    }

    /// Stops accepting requests and wakes producers waiting for room.
    pub fn close(&mut self) {
        match self {
            SendDriver::Single(driver) => driver.rx.close(),
            SendDriver::Batch(driver) => {
                driver.queue.closed.store(true, Ordering::Release);
                driver.queue.drained.notify_waiters();
            }
        }
    }
}

#[derive(Debug)]
pub struct SingleDriver {
    rx: mpsc::UnboundedReceiver<Request>,
    next: Option<Request>,
    buf: BytesMut,
}

impl SingleDriver {
    async fn ready(&mut self) -> bool {
        if self.next.is_some() {
            return true;
        }
        match self.rx.recv().await {
            Some(request) => {
                self.next = Some(request);
                true
            }
            None => false,
        }
    }

    async fn flush<W, F>(
        &mut self,
        writer: &mut W,
        encoder: &RequestEncoder,
        mut on_encode_error: F,
    ) -> Result<usize>
    where
        W: AsyncWrite + Unpin,
        F: FnMut(RequestId, WireRpcError),
    {
        let Some(request) = self.next.take() else {
            return Ok(0);
        };

        self.buf.clear();
        if let Err(e) = encoder.encode(&mut self.buf, &request) {
            on_encode_error(request.request_id, e);
            return Ok(0);
        }
        drop(request);

        writer.write_all(&self.buf).await?;
        writer.flush().await?;
        Ok(1)
    }
}

#[derive(Debug)]
pub struct BatchDriver {
    queue: Arc<BatchQueue>,
    batch_size: usize,
    batch_passes: usize,
    buf: BytesMut,
}

impl BatchDriver {
    async fn ready(&mut self) -> bool {
        if !self.queue.items.is_empty() {
            return true;
        }
        if self.queue.closed.load(Ordering::Acquire) {
            return false;
        }
        self.queue.ready.notified().await;
        true
    }

    /// Drains up to `batch_size` requests per pass for up to `batch_passes`
    /// passes, writing each pass without flushing, then flushes once.
    async fn flush<W, F>(
        &mut self,
        writer: &mut W,
        encoder: &RequestEncoder,
        mut on_encode_error: F,
    ) -> Result<usize>
    where
        W: AsyncWrite + Unpin,
        F: FnMut(RequestId, WireRpcError),
    {
        let mut written = 0;

        for _ in 0..self.batch_passes {
            self.buf.clear();
            let mut popped = 0;
            let mut encoded = 0;

            while popped < self.batch_size {
                let Some(request) = self.queue.items.pop() else {
                    break;
                };
                popped += 1;
                match encoder.encode(&mut self.buf, &request) {
                    Ok(_) => encoded += 1,
                    Err(e) => on_encode_error(request.request_id, e),
                }
            }

            if !self.buf.is_empty() {
                writer.write_all(&self.buf).await?;
            }
            written += encoded;

            if popped < self.batch_size {
                break;
            }
        }

        if written > 0 {
            writer.flush().await?;
            trace!(written, "flushed batch");
        }

        self.queue.drained.notify_waiters();
        if !self.queue.items.is_empty() {
            self.queue.ready.notify_one();
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::DuplexStream;
    use wirerpc_common::transport::read_frame;

    fn config(sender: SenderKind) -> ClientConfig {
        ClientConfig::default()
            .with_sender(sender)
            .with_batch(4, 2, 4)
    }

    fn request(id: RequestId) -> Request {
        Request::new(8, vec![id as u8; 16]).with_request_id(id)
    }

    async fn read_ids(reader: &mut DuplexStream, n: usize) -> Vec<RequestId> {
        let codec = Codec::binary();
        let mut ids = Vec::new();
        for _ in 0..n {
            let frame = read_frame(reader).await.unwrap();
            ids.push(codec.read_request(frame.freeze()).unwrap().request_id);
        }
        ids
    }

    #[tokio::test]
    async fn test_single_writes_one_request_per_flush() {
        let (sender, mut driver) = channel(&config(SenderKind::Single));
        let encoder = RequestEncoder::new(Codec::binary());
        let (mut writer, mut reader) = tokio::io::duplex(64 * 1024);

        sender.send(request(1)).await.unwrap();
        sender.send(request(2)).await.unwrap();

        assert!(driver.ready().await);
        let n = driver.flush(&mut writer, &encoder, |_, _| panic!()).await.unwrap();
        assert_eq!(n, 1);
        assert_eq!(read_ids(&mut reader, 1).await, vec![1]);

        assert!(driver.ready().await);
        driver.flush(&mut writer, &encoder, |_, _| panic!()).await.unwrap();
        assert_eq!(read_ids(&mut reader, 1).await, vec![2]);
    }

    #[tokio::test]
    async fn test_batch_flush_respects_size_and_passes() {
        let (sender, mut driver) = channel(&config(SenderKind::Batch).with_batch(2, 2, 16));
        let encoder = RequestEncoder::new(Codec::binary());
        let (mut writer, mut reader) = tokio::io::duplex(64 * 1024);

        for id in 0..7 {
            sender.send(request(id)).await.unwrap();
        }

        assert!(driver.ready().await);
        let n = driver.flush(&mut writer, &encoder, |_, _| panic!()).await.unwrap();
        assert_eq!(n, 4);
        assert_eq!(read_ids(&mut reader, 4).await, vec![0, 1, 2, 3]);

        // Leftovers reschedule the flush on their own.
        assert!(driver.ready().await);
        let n = driver.flush(&mut writer, &encoder, |_, _| panic!()).await.unwrap();
        assert_eq!(n, 3);
        assert_eq!(read_ids(&mut reader, 3).await, vec![4, 5, 6]);
    }

    #[tokio::test]
    async fn test_batch_full_queue_waits_for_flush() {
        let (sender, mut driver) = channel(&config(SenderKind::Batch).with_batch(8, 1, 2));
        let encoder = RequestEncoder::new(Codec::binary());
        let (mut writer, mut reader) = tokio::io::duplex(64 * 1024);

        sender.send(request(1)).await.unwrap();
        sender.send(request(2)).await.unwrap();

        let blocked = {
            let sender = sender.clone();
            tokio::spawn(async move { sender.send(request(3)).await })
        };
        tokio::task::yield_now().await;
        assert!(!blocked.is_finished());

        assert!(driver.ready().await);
        driver.flush(&mut writer, &encoder, |_, _| panic!()).await.unwrap();
        blocked.await.unwrap().unwrap();

        assert!(driver.ready().await);
        driver.flush(&mut writer, &encoder, |_, _| panic!()).await.unwrap();
        assert_eq!(read_ids(&mut reader, 3).await, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_batch_close_releases_blocked_producer() {
        let (sender, mut driver) = channel(&config(SenderKind::Batch).with_batch(8, 1, 1));
        sender.send(request(1)).await.unwrap();

        let blocked = {
            let sender = sender.clone();
            tokio::spawn(async move { sender.send(request(2)).await })
        };
        tokio::task::yield_now().await;

        driver.close();
        let result = tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Err(CallError::ConnectionClosed));
        assert!(sender.is_closed());
        assert_eq!(sender.send(request(3)).await, Err(CallError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_single_close_rejects_sends() {
        let (sender, mut driver) = channel(&config(SenderKind::Single));
        driver.close();
        assert_eq!(sender.send(request(1)).await, Err(CallError::ConnectionClosed));
        assert!(!driver.ready().await);
    }

    #[tokio::test]
    async fn test_encode_error_skips_only_that_request() {
        let (sender, mut driver) = channel(&config(SenderKind::Batch));
        let encoder = RequestEncoder::with_frames(Codec::binary(), FrameCodec::with_max(64));
        let (mut writer, mut reader) = tokio::io::duplex(64 * 1024);

        sender.send(request(1)).await.unwrap();
        sender
            .send(Request::new(8, vec![0u8; 1024]).with_request_id(2))
            .await
            .unwrap();
        sender.send(request(3)).await.unwrap();

        let mut failed = Vec::new();
        assert!(driver.ready().await);
        let n = driver
            .flush(&mut writer, &encoder, |id, e| {
                assert!(matches!(e, WireRpcError::FrameTooLarge { .. }));
                failed.push(id);
            })
            .await
            .unwrap();

        assert_eq!(n, 2);
        assert_eq!(failed, vec![2]);
        assert_eq!(read_ids(&mut reader, 2).await, vec![1, 3]);
    }
}
