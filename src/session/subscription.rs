//! Stream subscription context
//!
//! A subscription is created when a client starts playing a stream. Media
//! for it is pushed onto its delivery queue by the broadcaster and drained
//! by one delivery task, which encodes each packet onto the subscriber's
//! connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::client::{ClientHandle, ClientId, SendCallback};
use crate::media::MediaType;
use crate::protocol::constants::*;
use crate::protocol::message::{ControlMessage, RtmpMessage, UserControlEvent};

/// Payload kind of a delivered packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Audio,
    Video,
    /// Stream metadata, sent as an AMF0 data message
    Metadata,
}

impl From<MediaType> for PacketKind {
    fn from(media_type: MediaType) -> Self {
        match media_type {
            MediaType::Audio => PacketKind::Audio,
            MediaType::Video => PacketKind::Video,
        }
    }
}

/// A packet waiting for delivery to one subscriber
#[derive(Debug, Clone)]
pub struct MediaPacket {
    pub kind: PacketKind,
    pub timestamp: u32,
    pub payload: Bytes,
    /// May be dropped when the subscriber falls behind
    pub skippable: bool,
}

impl MediaPacket {
    pub fn new(kind: PacketKind, timestamp: u32, payload: Bytes, skippable: bool) -> Self {
        Self {
            kind,
            timestamp,
            payload,
            skippable,
        }
    }

    fn to_message(&self, stream_id: u32) -> RtmpMessage {
        let (csid, type_id) = match self.kind {
            PacketKind::Audio => (CSID_AUDIO, MSG_AUDIO),
            PacketKind::Video => (CSID_VIDEO, MSG_VIDEO),
            PacketKind::Metadata => (CSID_DATA, MSG_DATA_AMF0),
        };
        RtmpMessage::new(csid, self.timestamp, type_id, stream_id, self.payload.clone())
    }
}

#[derive(Debug)]
enum DeliveryItem {
    Packet(MediaPacket),
    /// Publisher went away; send Stream EOF and stop
    EndOfStream,
}

/// Delivery counters
#[derive(Debug, Default)]
struct DeliveryCounters {
    delivered: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

/// Snapshot of a subscription's delivery counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    /// Packets written to the transport
    pub delivered: u64,
    /// Skippable packets dropped under backpressure
    pub dropped: u64,
    /// Packets the transport failed to write
    pub failed: u64,
}

/// A client's subscription to one published stream
pub struct StreamSubscription {
    client: Arc<ClientHandle>,
    stream_id: u32,
    path: String,
    args: HashMap<String, String>,
    receiving_audio: AtomicBool,
    receiving_video: AtomicBool,
    initialized: watch::Sender<bool>,
    queue: mpsc::UnboundedSender<DeliveryItem>,
    ended: AtomicBool,
    cancel: CancellationToken,
    counters: Arc<DeliveryCounters>,
}

impl StreamSubscription {
    /// Create a subscription and its delivery queue.
    ///
    /// The subscription's token is a child of the client's, so it is
    /// cancelled with the connection.
    pub fn new(
        client: Arc<ClientHandle>,
        stream_id: u32,
        path: impl Into<String>,
        args: HashMap<String, String>,
    ) -> (Arc<Self>, DeliveryQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (initialized, _) = watch::channel(false);
        let cancel = client.cancel_token().child_token();

        let subscription = Arc::new(Self {
            client,
            stream_id,
            path: path.into(),
            args,
            receiving_audio: AtomicBool::new(true),
            receiving_video: AtomicBool::new(true),
            initialized,
            queue: tx,
            ended: AtomicBool::new(false),
            cancel,
            counters: Arc::new(DeliveryCounters::default()),
        });

        let queue = DeliveryQueue {
            subscription: subscription.clone(),
            rx,
        };
        (subscription, queue)
    }

    pub fn client(&self) -> &Arc<ClientHandle> {
        &self.client
    }

    pub fn client_id(&self) -> ClientId {
        self.client.id()
    }

    /// Subscriber-side message stream id
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn args(&self) -> &HashMap<String, String> {
        &self.args
    }

    pub fn is_receiving_audio(&self) -> bool {
        self.receiving_audio.load(Ordering::Relaxed)
    }

    pub fn is_receiving_video(&self) -> bool {
        self.receiving_video.load(Ordering::Relaxed)
    }

    /// Toggle audio delivery (receiveAudio)
    pub fn set_receiving_audio(&self, enabled: bool) {
        self.receiving_audio.store(enabled, Ordering::Relaxed);
    }

    /// Toggle video delivery (receiveVideo)
    pub fn set_receiving_video(&self, enabled: bool) {
        self.receiving_video.store(enabled, Ordering::Relaxed);
    }

    /// Release the delivery task. Called once the play response is sent.
    pub fn complete_initialization(&self) {
        self.initialized.send_replace(true);
    }

    pub fn is_initialized(&self) -> bool {
        *self.initialized.borrow()
    }

    /// Wait until initialization completes; `false` if the subscription was
    /// detached first
    pub async fn until_initialization_complete(&self) -> bool {
        let mut rx = self.initialized.subscribe();
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            r = rx.wait_for(|ready| *ready) => r.is_ok(),
        }
    }

    /// Queue a packet for delivery
    pub fn enqueue(&self, packet: MediaPacket) {
        if self.ended.load(Ordering::Acquire) || self.cancel.is_cancelled() {
            return;
        }
        let _ = self.queue.send(DeliveryItem::Packet(packet));
    }

    /// Queue Stream EOF after everything already queued; later packets are
    /// ignored
    pub fn end_of_stream(&self) {
        if !self.ended.swap(true, Ordering::AcqRel) {
            let _ = self.queue.send(DeliveryItem::EndOfStream);
        }
    }

    /// Stop delivery immediately, discarding anything still queued
    pub fn detach(&self) {
        self.cancel.cancel();
    }

    pub fn is_detached(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn stats(&self) -> DeliveryStats {
        DeliveryStats {
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    fn completion_callback(&self, packet: &MediaPacket) -> SendCallback {
        let counters = self.counters.clone();
        let skippable = packet.skippable;
        let kind = packet.kind;
        let client_id = self.client.id();
        Box::new(move |ok| {
            if ok {
                counters.delivered.fetch_add(1, Ordering::Relaxed);
            } else {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                if !skippable {
                    tracing::warn!(
                        session_id = client_id,
                        kind = ?kind,
                        "Failed to deliver non-skippable packet"
                    );
                }
            }
        })
    }
}

impl std::fmt::Debug for StreamSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSubscription")
            .field("client_id", &self.client.id())
            .field("stream_id", &self.stream_id)
            .field("path", &self.path)
            .field("initialized", &self.is_initialized())
            .field("detached", &self.is_detached())
            .finish()
    }
}

/// Receiving end of a subscription's delivery queue
pub struct DeliveryQueue {
    subscription: Arc<StreamSubscription>,
    rx: mpsc::UnboundedReceiver<DeliveryItem>,
}

impl DeliveryQueue {
    /// Drain the queue into the subscriber's connection.
    ///
    /// Nothing is written before initialization completes. Skippable
    /// packets are dropped while the client has `max_outstanding_sends` or
    /// more buffers queued.
    pub async fn run(mut self, max_outstanding_sends: usize) {
        let sub = self.subscription.clone();
        if !sub.until_initialization_complete().await {
            return;
        }

        loop {
            let item = tokio::select! {
                biased;
                _ = sub.cancel.cancelled() => break,
                item = self.rx.recv() => item,
            };

            match item {
                Some(DeliveryItem::Packet(packet)) => {
                    self.deliver(packet, max_outstanding_sends).await;
                }
                Some(DeliveryItem::EndOfStream) => {
                    let eof = ControlMessage::UserControl(UserControlEvent::StreamEof(sub.stream_id))
                        .encode();
                    if let Err(e) = sub.client.send_message(&eof, None).await {
                        tracing::debug!(session_id = sub.client_id(), error = %e, "Stream EOF not sent");
                    }
                    break;
                }
                None => break,
            }
        }

        tracing::debug!(
            session_id = sub.client_id(),
            stream = %sub.path,
            "Delivery stopped"
        );
    }

    async fn deliver(&self, packet: MediaPacket, max_outstanding_sends: usize) {
        let sub = &self.subscription;

        match packet.kind {
            PacketKind::Audio if !sub.is_receiving_audio() => return,
            PacketKind::Video if !sub.is_receiving_video() => return,
            _ => {}
        }

        if packet.skippable && sub.client.outstanding_sends() >= max_outstanding_sends {
            let dropped = sub.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped == 1 || dropped % 100 == 0 {
                tracing::warn!(
                    session_id = sub.client_id(),
                    stream = %sub.path,
                    dropped = dropped,
                    "Subscriber lagging, dropping frames"
                );
            }
            return;
        }

        let message = packet.to_message(sub.stream_id);
        let callback = sub.completion_callback(&packet);
        if let Err(e) = sub.client.send_message(&message, Some(callback)).await {
            tracing::debug!(session_id = sub.client_id(), error = %e, "Failed to encode packet");
        }
    }
}
