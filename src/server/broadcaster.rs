//! Media fan-out
//!
//! The broadcaster sits between publishing sessions and the registry. For
//! every inbound audio/video message it updates the publish context's caches
//! and queues the payload on each subscriber's delivery queue, choosing the
//! locking mode by what the message is:
//!
//! | Message                   | Registry access               | Skippable |
//! |---------------------------|-------------------------------|-----------|
//! | sequence header, metadata | locked for the whole fan-out  | no        |
//! | frame, GOP cache enabled  | locked for the cache update   | yes       |
//! | frame, GOP cache disabled | unlocked snapshot             | yes       |

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

use super::config::ServerConfig;
use super::events::EventDispatcher;
use crate::media::{FlvClassifier, FrameClass, MediaClassifier, MediaType};
use crate::registry::{RegistryError, StreamRegistry};
use crate::session::{
    ClientHandle, ClientId, MediaPacket, PacketKind, PublishStreamContext, StreamSubscription,
};

/// Routes published media to subscribers
pub struct MediaBroadcaster {
    registry: Arc<StreamRegistry>,
    classifier: Arc<dyn MediaClassifier>,
    events: Arc<EventDispatcher>,
    gop_cache_enabled: bool,
    gop_cache_max_size: usize,
    max_outstanding_sends: usize,
}

impl MediaBroadcaster {
    pub fn new(
        registry: Arc<StreamRegistry>,
        events: Arc<EventDispatcher>,
        config: &ServerConfig,
    ) -> Self {
        Self {
            registry,
            classifier: Arc::new(FlvClassifier),
            events,
            gop_cache_enabled: config.gop_cache_enabled,
            gop_cache_max_size: config.gop_cache_max_size,
            max_outstanding_sends: config.max_outstanding_sends,
        }
    }

    /// Replace the default FLV classifier
    pub fn with_classifier(mut self, classifier: Arc<dyn MediaClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn registry(&self) -> &Arc<StreamRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &Arc<EventDispatcher> {
        &self.events
    }

    /// Register `publisher` as the source of `path`
    pub async fn publish(
        &self,
        publisher: ClientId,
        stream_id: u32,
        path: &str,
        args: HashMap<String, String>,
    ) -> Result<(), RegistryError> {
        let context = PublishStreamContext::new(path, publisher, stream_id, args)
            .with_gop_cache(self.gop_cache_enabled, self.gop_cache_max_size);
        let args = context.args().clone();

        self.registry.start_publishing(context).await?;
        self.events.stream_published(publisher, path, &args).await;
        Ok(())
    }

    /// Remove the publisher of `path`.
    ///
    /// Every attached subscriber gets Stream EOF after whatever it already
    /// has queued. Returns how many subscribers were attached.
    pub async fn unpublish(&self, publisher: ClientId, path: &str) -> Result<usize, RegistryError> {
        let subscribers = self.registry.stop_publishing(path).await?;
        for sub in &subscribers {
            sub.end_of_stream();
        }
        self.events.stream_unpublished(publisher, path).await;
        for sub in &subscribers {
            self.events.stream_unsubscribed(sub.client_id(), path).await;
        }
        Ok(subscribers.len())
    }

    /// Subscribe `client` to `path`.
    ///
    /// Cached metadata, sequence headers and the current GOP are queued
    /// under the path lock before the subscription joins, and its delivery
    /// task is started. Nothing is written until the caller releases the
    /// subscription with [`StreamSubscription::complete_initialization`].
    pub async fn subscribe(
        &self,
        client: Arc<ClientHandle>,
        stream_id: u32,
        path: &str,
        args: HashMap<String, String>,
    ) -> Result<Arc<StreamSubscription>, RegistryError> {
        let (subscription, delivery) = StreamSubscription::new(client, stream_id, path, args);

        self.registry
            .start_subscribing(subscription.clone(), catch_up)
            .await?;

        tokio::spawn(delivery.run(self.max_outstanding_sends));

        self.events
            .stream_subscribed(subscription.client_id(), path, subscription.args())
            .await;
        Ok(subscription)
    }

    /// Detach a subscription and stop its delivery
    pub async fn unsubscribe(&self, subscription: &Arc<StreamSubscription>) -> bool {
        let removed = self.registry.stop_subscribing(subscription.client_id()).await;
        subscription.detach();
        if removed {
            self.events
                .stream_unsubscribed(subscription.client_id(), subscription.path())
                .await;
        }
        removed
    }

    /// Cache and fan out one audio or video message from the publisher of
    /// `path`
    pub async fn handle_media(
        &self,
        path: &str,
        media_type: MediaType,
        timestamp: u32,
        payload: Bytes,
    ) {
        let class = self.classifier.classify(media_type, &payload);
        let kind = PacketKind::from(media_type);

        if class == FrameClass::SequenceHeader {
            if let Some(mut locked) = self.registry.get_subscribers_locked(path).await {
                locked
                    .publish_context_mut()
                    .cache_sequence_header(media_type, payload.clone());
                for sub in locked.subscribers() {
                    sub.enqueue(MediaPacket::new(kind, timestamp, payload.clone(), false));
                }
                tracing::debug!(
                    stream = %path,
                    media = %media_type,
                    size = payload.len(),
                    "Cached sequence header"
                );
            }
        } else {
            let subscribers = if self.gop_cache_enabled {
                match self.registry.get_subscribers_locked(path).await {
                    Some(mut locked) => {
                        locked
                            .publish_context_mut()
                            .cache_picture(media_type, class, timestamp, &payload);
                        locked.into_snapshot()
                    }
                    None => Vec::new(),
                }
            } else {
                self.registry.get_subscribers(path).await
            };

            for sub in &subscribers {
                sub.enqueue(MediaPacket::new(kind, timestamp, payload.clone(), true));
            }
        }

        self.events
            .media_received(path, media_type, timestamp, &payload)
            .await;
    }

    /// Replace the cached metadata of `path` and send it to every subscriber
    pub async fn handle_metadata(&self, publisher: ClientId, path: &str, metadata: Bytes) {
        if let Some(mut locked) = self.registry.get_subscribers_locked(path).await {
            locked.publish_context_mut().set_metadata(metadata.clone());
            for sub in locked.subscribers() {
                sub.enqueue(MediaPacket::new(PacketKind::Metadata, 0, metadata.clone(), false));
            }
        }
        self.events.metadata_received(publisher, path, &metadata).await;
    }
}

/// Queue everything a late joiner needs, in decode order
fn catch_up(publish: &PublishStreamContext, subscription: &Arc<StreamSubscription>) {
    if let Some(metadata) = publish.metadata() {
        subscription.enqueue(MediaPacket::new(PacketKind::Metadata, 0, metadata.clone(), false));
    }
    if let Some(header) = publish.video_sequence_header() {
        subscription.enqueue(MediaPacket::new(PacketKind::Video, 0, header.clone(), false));
    }
    if let Some(header) = publish.audio_sequence_header() {
        subscription.enqueue(MediaPacket::new(PacketKind::Audio, 0, header.clone(), false));
    }
    for picture in publish.gop().entries() {
        subscription.enqueue(MediaPacket::new(
            picture.media_type.into(),
            picture.timestamp,
            picture.payload.clone(),
            false,
        ));
    }

    tracing::debug!(
        stream = %publish.path(),
        session_id = subscription.client_id(),
        gop_frames = publish.gop().len(),
        gop_span_ms = publish.gop().duration().unwrap_or(0),
        "Queued catch-up"
    );
}

impl std::fmt::Debug for MediaBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaBroadcaster")
            .field("gop_cache_enabled", &self.gop_cache_enabled)
            .field("gop_cache_max_size", &self.gop_cache_max_size)
            .field("max_outstanding_sends", &self.max_outstanding_sends)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::assembler::MessageAssembler;
    use crate::protocol::constants::*;
    use crate::protocol::message::{ControlMessage, RtmpMessage, UserControlEvent};
    use crate::session::OutboundQueue;
    use bytes::BytesMut;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};
    use tokio_util::sync::CancellationToken;

    const VIDEO_HEADER: &[u8] = &[0x17, 0x00, 0x00, 0x00, 0x00, 0x01];
    const AUDIO_HEADER: &[u8] = &[0xAF, 0x00, 0x12, 0x10];
    const KEYFRAME: &[u8] = &[0x17, 0x01, 0x00, 0x00, 0x00, 0xAA];
    const INTER: &[u8] = &[0x27, 0x01, 0x00, 0x00, 0x00, 0xBB];
    const AUDIO: &[u8] = &[0xAF, 0x01, 0xCC];

    fn broadcaster(config: &ServerConfig) -> MediaBroadcaster {
        MediaBroadcaster::new(
            Arc::new(StreamRegistry::new()),
            Arc::new(EventDispatcher::new()),
            config,
        )
    }

    fn connected_client(id: ClientId) -> (Arc<ClientHandle>, DuplexStream) {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 41000);
        let (client, queue): (Arc<ClientHandle>, OutboundQueue) =
            ClientHandle::new(id, addr, CancellationToken::new());
        let (ours, theirs) = duplex(256 * 1024);
        tokio::spawn(queue.run(ours));
        (client, theirs)
    }

    async fn read_messages(peer: &mut DuplexStream, count: usize) -> Vec<RtmpMessage> {
        let mut assembler = MessageAssembler::new();
        let mut buf = BytesMut::new();
        let mut out = Vec::new();
        loop {
            while let Some(msg) = assembler.decode(&mut buf).unwrap() {
                out.push(msg);
            }
            if out.len() >= count {
                return out;
            }
            let n = tokio::time::timeout(Duration::from_secs(2), peer.read_buf(&mut buf))
                .await
                .expect("timed out waiting for messages")
                .unwrap();
            assert!(n > 0, "peer closed");
        }
    }

    async fn media(b: &MediaBroadcaster, media_type: MediaType, timestamp: u32, payload: &'static [u8]) {
        b.handle_media("live/a", media_type, timestamp, Bytes::from_static(payload))
            .await;
    }

    #[tokio::test]
    async fn test_late_joiner_gets_headers_then_gop_then_live() {
        crate::test_util::init_tracing();
        let b = broadcaster(&ServerConfig::default());
        b.publish(1, 1, "live/a", HashMap::new()).await.unwrap();
        b.handle_metadata(1, "live/a", Bytes::from_static(b"onMetaData")).await;

        media(&b, MediaType::Video, 0, INTER).await; // before any keyframe
        media(&b, MediaType::Video, 0, VIDEO_HEADER).await;
        media(&b, MediaType::Audio, 0, AUDIO_HEADER).await;
        media(&b, MediaType::Video, 100, KEYFRAME).await;
        media(&b, MediaType::Audio, 110, AUDIO).await;
        media(&b, MediaType::Video, 133, INTER).await;

        let (client, mut peer) = connected_client(2);
        let sub = b
            .subscribe(client, 5, "live/a", HashMap::new())
            .await
            .unwrap();

        // Live frame arrives before the subscriber is released
        media(&b, MediaType::Video, 166, INTER).await;
        sub.complete_initialization();

        let messages = read_messages(&mut peer, 7).await;
        let summary: Vec<(u8, u32, u8)> = messages
            .iter()
            .map(|m| (m.type_id, m.timestamp, m.payload[1]))
            .collect();
        assert_eq!(
            summary,
            vec![
                (MSG_DATA_AMF0, 0, b'n'),
                (MSG_VIDEO, 0, 0x00),
                (MSG_AUDIO, 0, 0x00),
                (MSG_VIDEO, 100, 0x01),
                (MSG_AUDIO, 110, 0x01),
                (MSG_VIDEO, 133, 0x01),
                (MSG_VIDEO, 166, 0x01),
            ]
        );
        assert!(messages.iter().all(|m| m.stream_id == 5));
        assert_eq!(messages[0].csid, CSID_DATA);
    }

    #[tokio::test]
    async fn test_gop_disabled_sends_only_headers_on_join() {
        let b = broadcaster(&ServerConfig::default().disable_gop_cache());
        b.publish(1, 1, "live/a", HashMap::new()).await.unwrap();

        media(&b, MediaType::Video, 0, VIDEO_HEADER).await;
        media(&b, MediaType::Video, 40, KEYFRAME).await;

        let (client, mut peer) = connected_client(2);
        let sub = b
            .subscribe(client, 1, "live/a", HashMap::new())
            .await
            .unwrap();
        sub.complete_initialization();
        media(&b, MediaType::Video, 80, INTER).await;

        let messages = read_messages(&mut peer, 2).await;
        assert_eq!(messages[0].payload, Bytes::from_static(VIDEO_HEADER));
        assert_eq!(messages[1].timestamp, 80);
    }

    #[tokio::test]
    async fn test_new_keyframe_resets_catch_up() {
        let b = broadcaster(&ServerConfig::default());
        b.publish(1, 1, "live/a", HashMap::new()).await.unwrap();

        media(&b, MediaType::Video, 0, KEYFRAME).await;
        media(&b, MediaType::Video, 33, INTER).await;
        media(&b, MediaType::Video, 66, KEYFRAME).await;

        let locked = b.registry().get_subscribers_locked("live/a").await.unwrap();
        let entries = locked.publish_context().gop().entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].timestamp, 66);
    }

    #[tokio::test]
    async fn test_unpublish_sends_stream_eof() {
        let b = broadcaster(&ServerConfig::default());
        b.publish(1, 1, "live/a", HashMap::new()).await.unwrap();

        let (client, mut peer) = connected_client(2);
        let sub = b
            .subscribe(client, 3, "live/a", HashMap::new())
            .await
            .unwrap();
        sub.complete_initialization();

        media(&b, MediaType::Video, 0, KEYFRAME).await;
        assert_eq!(b.unpublish(1, "live/a").await.unwrap(), 1);
        // Ignored after the stream ended
        media(&b, MediaType::Video, 33, INTER).await;

        let messages = read_messages(&mut peer, 2).await;
        assert_eq!(messages[0].type_id, MSG_VIDEO);
        assert_eq!(
            ControlMessage::parse(&messages[1]).unwrap(),
            Some(ControlMessage::UserControl(UserControlEvent::StreamEof(3)))
        );
        assert!(!b.registry().is_publishing("live/a").await);
        assert_eq!(
            b.unpublish(1, "live/a").await.unwrap_err(),
            RegistryError::NotFound("live/a".into())
        );
    }

    #[tokio::test]
    async fn test_subscribe_errors_do_not_spawn_delivery() {
        let b = broadcaster(&ServerConfig::default());
        let (client, _peer) = connected_client(2);
        let err = b
            .subscribe(client.clone(), 1, "live/none", HashMap::new())
            .await
            .unwrap_err();
        assert_eq!(err, RegistryError::StreamDoesntExist("live/none".into()));

        b.publish(1, 1, "live/a", HashMap::new()).await.unwrap();
        let sub = b
            .subscribe(client.clone(), 1, "live/a", HashMap::new())
            .await
            .unwrap();
        let err = b
            .subscribe(client, 1, "live/a", HashMap::new())
            .await
            .unwrap_err();
        assert_eq!(err, RegistryError::AlreadySubscribing("live/a".into()));

        assert!(b.unsubscribe(&sub).await);
        assert!(sub.is_detached());
        assert!(!b.unsubscribe(&sub).await);
    }

    #[tokio::test]
    async fn test_media_for_unknown_path_is_ignored() {
        let b = broadcaster(&ServerConfig::default());
        media(&b, MediaType::Video, 0, VIDEO_HEADER).await;
        media(&b, MediaType::Video, 0, KEYFRAME).await;
        b.handle_metadata(1, "live/a", Bytes::from_static(b"meta")).await;
        assert_eq!(b.registry().stream_count().await, 0);
    }
}
