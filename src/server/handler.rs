//! Command handler trait
//!
//! The extension point for RTMP applications. The core never decodes AMF:
//! command messages (types 17/20) and data messages (types 15/18) reach a
//! [`CommandHandler`] as complete messages, and the handler drives the
//! connection through a [`CommandContext`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use super::broadcaster::MediaBroadcaster;
use super::config::ServerConfig;
use crate::error::{Error, ProtocolError, Result};
use crate::protocol::constants::BANDWIDTH_LIMIT_DYNAMIC;
use crate::protocol::message::{ControlMessage, RtmpMessage, UserControlEvent};
use crate::session::{ClientContext, ClientHandle, ClientId, StreamSubscription};

/// Handler trait for RTMP applications
///
/// All methods default to ignoring the message.
///
/// # Example
///
/// ```ignore
/// use rtmp_relay::server::{CommandContext, CommandHandler};
/// use rtmp_relay::protocol::RtmpMessage;
///
/// struct MyHandler;
///
/// #[async_trait::async_trait]
/// impl CommandHandler for MyHandler {
///     async fn on_command(
///         &self,
///         ctx: &mut CommandContext<'_>,
///         message: &RtmpMessage,
///     ) -> rtmp_relay::Result<()> {
///         let command = my_amf::decode(&message.payload)?;
///         match command.name.as_str() {
///             "createStream" => {
///                 let id = ctx.create_stream();
///                 ctx.send_message(&my_amf::result(command.transaction_id, id)).await
///             }
///             "publish" => ctx.publish(&command.stream_key, command.args).await,
///             _ => Ok(()),
///         }
///     }
/// }
/// ```
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    /// Called for every AMF0/AMF3 command message
    ///
    /// An error closes the connection.
    async fn on_command(&self, _ctx: &mut CommandContext<'_>, message: &RtmpMessage) -> Result<()> {
        tracing::trace!(type_id = message.type_id, size = message.payload.len(), "Command ignored");
        Ok(())
    }

    /// Called for every AMF0/AMF3 data message (e.g. @setDataFrame)
    async fn on_data(&self, _ctx: &mut CommandContext<'_>, message: &RtmpMessage) -> Result<()> {
        tracing::trace!(type_id = message.type_id, size = message.payload.len(), "Data message ignored");
        Ok(())
    }
}

/// Operations available to a [`CommandHandler`] while it handles one
/// message of one connection
pub struct CommandContext<'a> {
    context: &'a mut ClientContext,
    client: &'a Arc<ClientHandle>,
    broadcaster: &'a MediaBroadcaster,
    config: &'a ServerConfig,
}

impl<'a> CommandContext<'a> {
    pub fn new(
        context: &'a mut ClientContext,
        client: &'a Arc<ClientHandle>,
        broadcaster: &'a MediaBroadcaster,
        config: &'a ServerConfig,
    ) -> Self {
        Self {
            context,
            client,
            broadcaster,
            config,
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.context.id
    }

    pub fn context(&self) -> &ClientContext {
        self.context
    }

    pub fn client(&self) -> &Arc<ClientHandle> {
        self.client
    }

    /// Record the application name and fire the connected event
    pub async fn notify_connected(&mut self, app: &str) {
        self.context.app_name = Some(app.to_string());
        self.broadcaster
            .events()
            .client_connected(self.context.id, app)
            .await;
    }

    /// Send Window Acknowledgement Size and Set Peer Bandwidth, as expected
    /// in response to connect
    pub async fn negotiate_bandwidth(&mut self) -> Result<()> {
        let window = self.config.window_ack_size;
        self.send_message(&ControlMessage::WindowAckSize(window).encode())
            .await?;
        self.send_message(
            &ControlMessage::SetPeerBandwidth {
                size: self.config.peer_bandwidth,
                limit_type: BANDWIDTH_LIMIT_DYNAMIC,
            }
            .encode(),
        )
        .await?;
        self.context.out_window_ack_size = window;
        Ok(())
    }

    /// Allocate a message stream id
    pub fn create_stream(&mut self) -> u32 {
        let stream_id = self.context.create_stream();
        tracing::debug!(session_id = self.context.id, stream_id = stream_id, "Created stream");
        stream_id
    }

    /// Close a message stream, ending any publish or play on it
    pub async fn delete_stream(&mut self, stream_id: u32) -> Result<()> {
        if self.context.stream_id() == Some(stream_id) {
            self.unpublish().await?;
            self.stop_playing().await;
        }
        self.context.delete_stream(stream_id);
        Ok(())
    }

    fn active_stream_id(&self, operation: &str) -> Result<u32> {
        self.context.stream_id().ok_or_else(|| {
            ProtocolError::UnexpectedMessage(format!("{} before createStream", operation)).into()
        })
    }

    /// Publish the current message stream at `path`
    pub async fn publish(&mut self, path: &str, args: HashMap<String, String>) -> Result<()> {
        let stream_id = self.active_stream_id("publish")?;
        if let Some(current) = &self.context.publish_path {
            return Err(Error::Rejected(format!("already publishing {}", current)));
        }

        self.broadcaster
            .publish(self.context.id, stream_id, path, args)
            .await?;
        self.context.publish_path = Some(path.to_string());

        self.send_message(&ControlMessage::UserControl(UserControlEvent::StreamBegin(stream_id)).encode())
            .await
    }

    /// Stop publishing; returns whether the connection was publishing
    pub async fn unpublish(&mut self) -> Result<bool> {
        let Some(path) = self.context.publish_path.take() else {
            return Ok(false);
        };
        self.broadcaster.unpublish(self.context.id, &path).await?;
        Ok(true)
    }

    /// Subscribe the current message stream to `path`.
    ///
    /// Sends Stream Begin. The returned subscription holds its delivery
    /// until [`StreamSubscription::complete_initialization`] is called, so
    /// the handler can send its play responses first.
    pub async fn play(
        &mut self,
        path: &str,
        args: HashMap<String, String>,
    ) -> Result<Arc<StreamSubscription>> {
        let stream_id = self.active_stream_id("play")?;
        let subscription = self
            .broadcaster
            .subscribe(self.client.clone(), stream_id, path, args)
            .await?;
        self.context.subscription = Some(subscription.clone());

        self.send_message(&ControlMessage::UserControl(UserControlEvent::StreamBegin(stream_id)).encode())
            .await?;
        Ok(subscription)
    }

    /// Stop playing; returns whether the connection was playing
    pub async fn stop_playing(&mut self) -> bool {
        match self.context.subscription.take() {
            Some(subscription) => {
                self.broadcaster.unsubscribe(&subscription).await;
                true
            }
            None => false,
        }
    }

    /// receiveAudio
    pub fn set_receive_audio(&self, enabled: bool) {
        if let Some(subscription) = &self.context.subscription {
            subscription.set_receiving_audio(enabled);
        }
    }

    /// receiveVideo
    pub fn set_receive_video(&self, enabled: bool) {
        if let Some(subscription) = &self.context.subscription {
            subscription.set_receiving_video(enabled);
        }
    }

    /// Cache metadata on the published stream and forward it to subscribers
    pub async fn set_metadata(&self, metadata: Bytes) -> Result<()> {
        let Some(path) = &self.context.publish_path else {
            return Err(ProtocolError::UnexpectedMessage("metadata without publish".into()).into());
        };
        self.broadcaster
            .handle_metadata(self.context.id, path, metadata)
            .await;
        Ok(())
    }

    /// Send a message on this connection
    pub async fn send_message(&self, message: &RtmpMessage) -> Result<()> {
        self.client.send_message(message, None).await
    }

    /// Close the connection after this message
    pub fn disconnect(&self) {
        self.client.disconnect();
    }
}

impl std::fmt::Debug for CommandContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandContext")
            .field("client_id", &self.context.id)
            .field("stream_id", &self.context.stream_id())
            .field("publish_path", &self.context.publish_path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{RegistryError, StreamRegistry};
    use crate::server::events::EventDispatcher;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        context: ClientContext,
        client: Arc<ClientHandle>,
        broadcaster: MediaBroadcaster,
        config: ServerConfig,
    }

    impl Fixture {
        fn new(id: ClientId) -> Self {
            Self::with_broadcaster(id, Arc::new(StreamRegistry::new()))
        }

        fn with_broadcaster(id: ClientId, registry: Arc<StreamRegistry>) -> Self {
            let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 42000);
            let (client, _queue) = ClientHandle::new(id, addr, CancellationToken::new());
            let config = ServerConfig::default();
            let broadcaster =
                MediaBroadcaster::new(registry, Arc::new(EventDispatcher::new()), &config);
            Self {
                context: ClientContext::new(id, addr),
                client,
                broadcaster,
                config,
            }
        }

        fn ctx(&mut self) -> CommandContext<'_> {
            CommandContext::new(&mut self.context, &self.client, &self.broadcaster, &self.config)
        }
    }

    #[tokio::test]
    async fn test_publish_requires_stream() {
        let mut f = Fixture::new(1);
        let err = f.ctx().publish("live/a", HashMap::new()).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::UnexpectedMessage(_))
        ));
    }

    #[tokio::test]
    async fn test_publish_and_unpublish() {
        let mut f = Fixture::new(1);
        let mut ctx = f.ctx();
        assert_eq!(ctx.create_stream(), 1);
        ctx.publish("live/a", HashMap::new()).await.unwrap();
        assert!(ctx.context().is_publishing());

        let err = ctx.publish("live/b", HashMap::new()).await.unwrap_err();
        assert!(matches!(err, Error::Rejected(_)));

        assert!(ctx.unpublish().await.unwrap());
        assert!(!ctx.unpublish().await.unwrap());
        assert!(!f.broadcaster.registry().is_publishing("live/a").await);
    }

    #[tokio::test]
    async fn test_second_publisher_rejected() {
        let registry = Arc::new(StreamRegistry::new());
        let mut first = Fixture::with_broadcaster(1, registry.clone());
        let mut second = Fixture::with_broadcaster(2, registry);

        let mut ctx = first.ctx();
        ctx.create_stream();
        ctx.publish("live/a", HashMap::new()).await.unwrap();

        let mut ctx = second.ctx();
        ctx.create_stream();
        let err = ctx.publish("live/a", HashMap::new()).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Registry(RegistryError::AlreadyExists(_))
        ));
        assert!(!ctx.context().is_publishing());
    }

    #[tokio::test]
    async fn test_play_toggles_and_delete_stream() {
        let registry = Arc::new(StreamRegistry::new());
        let mut publisher = Fixture::with_broadcaster(1, registry.clone());
        let mut player = Fixture::with_broadcaster(2, registry.clone());

        let mut ctx = publisher.ctx();
        ctx.create_stream();
        ctx.publish("live/a", HashMap::new()).await.unwrap();

        let mut ctx = player.ctx();
        let stream_id = ctx.create_stream();
        let sub = ctx.play("live/a", HashMap::new()).await.unwrap();
        assert_eq!(sub.stream_id(), stream_id);
        assert!(!sub.is_initialized());

        ctx.set_receive_video(false);
        assert!(!sub.is_receiving_video());
        assert!(sub.is_receiving_audio());

        ctx.delete_stream(stream_id).await.unwrap();
        assert!(!ctx.context().is_playing());
        assert!(sub.is_detached());
        assert_eq!(registry.subscriber_count("live/a").await, 0);
    }

    #[tokio::test]
    async fn test_metadata_requires_publish() {
        let mut f = Fixture::new(1);
        let ctx = f.ctx();
        assert!(ctx.set_metadata(Bytes::from_static(b"meta")).await.is_err());
    }
}
