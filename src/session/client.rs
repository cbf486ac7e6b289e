//! Per-client send path
//!
//! Every connection owns a [`ClientHandle`] shared by whoever needs to write
//! to that peer (its own session, the delivery tasks of its subscriptions).
//! Buffers are queued on an unbounded channel and written in order by a
//! single [`OutboundQueue`] task.
//!
//! ```text
//!  session ──┐
//!  delivery ─┼─► ClientHandle::send ─► mpsc ─► OutboundQueue::run ─► socket
//!  delivery ─┘      (MessageWriter                  (callback with
//!                    under mutex)                    real outcome)
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::protocol::message::{ControlMessage, RtmpMessage};
use crate::protocol::writer::MessageWriter;

/// Connection identifier, unique per server
pub type ClientId = u64;

/// Completion callback: `true` once the buffer was written to the transport,
/// `false` if it never will be
pub type SendCallback = Box<dyn FnOnce(bool) + Send + 'static>;

struct PendingSend {
    buf: Bytes,
    callback: Option<SendCallback>,
}

impl PendingSend {
    fn complete(self, ok: bool) {
        if let Some(callback) = self.callback {
            callback(ok);
        }
    }
}

/// Shared handle for writing to one peer
pub struct ClientHandle {
    id: ClientId,
    peer_addr: SocketAddr,
    /// Write-side chunk state; held while a message is encoded and queued
    writer: Mutex<MessageWriter>,
    queue: mpsc::UnboundedSender<PendingSend>,
    outstanding: Arc<AtomicUsize>,
    cancel: CancellationToken,
}

impl ClientHandle {
    /// Create a handle and the queue that must be driven with
    /// [`OutboundQueue::run`]
    pub fn new(
        id: ClientId,
        peer_addr: SocketAddr,
        cancel: CancellationToken,
    ) -> (Arc<Self>, OutboundQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        let outstanding = Arc::new(AtomicUsize::new(0));

        let handle = Arc::new(Self {
            id,
            peer_addr,
            writer: Mutex::new(MessageWriter::new()),
            queue: tx,
            outstanding: outstanding.clone(),
            cancel: cancel.clone(),
        });

        let queue = OutboundQueue {
            client_id: id,
            rx,
            outstanding,
            cancel,
        };

        (handle, queue)
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Token cancelled when the connection goes away
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Buffers queued but not yet written
    pub fn outstanding_sends(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn is_disconnected(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Tear down the connection; queued sends complete with `false`
    pub fn disconnect(&self) {
        self.cancel.cancel();
    }

    /// Queue a raw buffer for sending
    pub fn send(&self, buf: Bytes, callback: Option<SendCallback>) {
        let pending = PendingSend { buf, callback };
        if self.cancel.is_cancelled() {
            pending.complete(false);
            return;
        }

        self.outstanding.fetch_add(1, Ordering::AcqRel);
        if let Err(mpsc::error::SendError(pending)) = self.queue.send(pending) {
            self.outstanding.fetch_sub(1, Ordering::AcqRel);
            pending.complete(false);
        }
    }

    /// Queue a raw buffer and wait until it has been written
    pub async fn send_async(&self, buf: Bytes) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(
            buf,
            Some(Box::new(move |ok| {
                let _ = tx.send(ok);
            })),
        );
        match rx.await {
            Ok(true) => Ok(()),
            _ => Err(Error::SendFailed),
        }
    }

    /// Chunk a message and queue it as a single buffer.
    ///
    /// The writer lock is held across encoding and queueing, so chunks of
    /// concurrent messages never interleave and queue order matches
    /// chunk-state order.
    pub async fn send_message(
        &self,
        message: &RtmpMessage,
        callback: Option<SendCallback>,
    ) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let mut buf = BytesMut::new();
        if let Err(e) = writer.encode(message, &mut buf) {
            if let Some(callback) = callback {
                callback(false);
            }
            return Err(e);
        }
        self.send(buf.freeze(), callback);
        Ok(())
    }

    /// Send Set Chunk Size and switch the writer to the new size
    pub async fn set_out_chunk_size(&self, size: u32) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let mut buf = BytesMut::new();
        writer.encode(&ControlMessage::SetChunkSize(size).encode(), &mut buf)?;
        writer.set_chunk_size(size)?;
        self.send(buf.freeze(), None);
        Ok(())
    }

    /// Current outbound chunk size
    pub async fn out_chunk_size(&self) -> u32 {
        self.writer.lock().await.chunk_size()
    }
}

impl std::fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandle")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("outstanding", &self.outstanding_sends())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Receiving end of a client's send queue
pub struct OutboundQueue {
    client_id: ClientId,
    rx: mpsc::UnboundedReceiver<PendingSend>,
    outstanding: Arc<AtomicUsize>,
    cancel: CancellationToken,
}

impl OutboundQueue {
    /// Write queued buffers to `writer` until cancelled or every handle is
    /// dropped.
    ///
    /// Buffers already queued are written in batches with one flush per
    /// batch. When the token is cancelled or a write fails, every remaining
    /// send completes with `false`. A write failure also cancels the token.
    pub async fn run<W>(mut self, mut writer: W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut result = Ok(());
        let mut batch = Vec::new();

        loop {
            let first = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                item = self.rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };

            batch.push(first);
            while let Ok(next) = self.rx.try_recv() {
                batch.push(next);
            }

            // Callbacks are not `Sync`, so only the buffers cross the await
            let bufs: Vec<Bytes> = batch.iter().map(|p| p.buf.clone()).collect();
            let written = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                r = write_batch(&mut writer, &bufs) => Some(r),
            };

            let ok = matches!(written, Some(Ok(())));
            for pending in batch.drain(..) {
                self.outstanding.fetch_sub(1, Ordering::AcqRel);
                pending.complete(ok);
            }

            match written {
                Some(Ok(())) => {}
                Some(Err(e)) => {
                    tracing::debug!(session_id = self.client_id, error = %e, "Write failed");
                    self.cancel.cancel();
                    result = Err(e.into());
                    break;
                }
                None => break,
            }
        }

        self.fail_remaining();
        result
    }

    fn fail_remaining(&mut self) {
        self.rx.close();
        let mut failed = 0usize;
        while let Ok(pending) = self.rx.try_recv() {
            self.outstanding.fetch_sub(1, Ordering::AcqRel);
            pending.complete(false);
            failed += 1;
        }
        if failed > 0 {
            tracing::debug!(
                session_id = self.client_id,
                failed = failed,
                "Send queue closed with pending buffers"
            );
        }
    }
}

async fn write_batch<W>(writer: &mut W, bufs: &[Bytes]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    for buf in bufs {
        writer.write_all(buf).await?;
    }
    writer.flush().await
}
