//! Message dispatch for one connection
//!
//! A [`Session`] owns the read side of a connection after the handshake:
//! it reassembles messages, handles protocol control in-core, routes audio
//! and video to the broadcaster and hands commands and data messages to the
//! application's [`CommandHandler`].

use std::sync::Arc;

use bytes::BytesMut;

use super::broadcaster::MediaBroadcaster;
use super::config::ServerConfig;
use super::handler::{CommandContext, CommandHandler};
use crate::error::{ProtocolError, Result};
use crate::media::MediaType;
use crate::protocol::assembler::MessageAssembler;
use crate::protocol::constants::*;
use crate::protocol::message::{ControlMessage, RtmpMessage, UserControlEvent};
use crate::session::{ClientContext, ClientHandle};

/// Read-side state of a connection
pub struct Session<C: CommandHandler> {
    context: ClientContext,
    client: Arc<ClientHandle>,
    assembler: MessageAssembler,
    broadcaster: Arc<MediaBroadcaster>,
    commands: Arc<C>,
    config: Arc<ServerConfig>,
}

impl<C: CommandHandler> Session<C> {
    pub fn new(
        context: ClientContext,
        client: Arc<ClientHandle>,
        broadcaster: Arc<MediaBroadcaster>,
        commands: Arc<C>,
        config: Arc<ServerConfig>,
    ) -> Self {
        Self {
            context,
            client,
            assembler: MessageAssembler::with_max_message_size(config.max_message_size),
            broadcaster,
            commands,
            config,
        }
    }

    pub fn context(&self) -> &ClientContext {
        &self.context
    }

    pub fn client(&self) -> &Arc<ClientHandle> {
        &self.client
    }

    /// Announce our outbound chunk size
    pub async fn start(&mut self) -> Result<()> {
        self.client.set_out_chunk_size(self.config.chunk_size).await?;
        self.context.out_chunk_size = self.config.chunk_size;
        Ok(())
    }

    /// Count bytes read off the wire, acknowledging when the peer's window
    /// is reached
    pub async fn record_received(&mut self, bytes: usize) -> Result<()> {
        if self.context.add_bytes_received(bytes) {
            let sequence = self.context.mark_acknowledged();
            tracing::trace!(session_id = self.context.id, sequence = sequence, "Sending acknowledgement");
            self.client
                .send_message(&ControlMessage::Acknowledgement { sequence }.encode(), None)
                .await?;
        }
        Ok(())
    }

    /// Handle every complete message in `buf`
    pub async fn process(&mut self, buf: &mut BytesMut) -> Result<()> {
        while let Some(message) = self.assembler.decode(buf)? {
            self.handle_message(message).await?;
        }
        Ok(())
    }

    async fn handle_message(&mut self, message: RtmpMessage) -> Result<()> {
        if let Some(control) = ControlMessage::parse(&message)? {
            return self.handle_control(control).await;
        }

        match message.type_id {
            MSG_AUDIO => self.handle_media(MediaType::Audio, message).await,
            MSG_VIDEO => self.handle_media(MediaType::Video, message).await,
            _ if message.is_command() => {
                let mut ctx = CommandContext::new(
                    &mut self.context,
                    &self.client,
                    &self.broadcaster,
                    &self.config,
                );
                self.commands.on_command(&mut ctx, &message).await
            }
            _ if message.is_data() => {
                let mut ctx = CommandContext::new(
                    &mut self.context,
                    &self.client,
                    &self.broadcaster,
                    &self.config,
                );
                self.commands.on_data(&mut ctx, &message).await
            }
            _ => {
                tracing::trace!(
                    session_id = self.context.id,
                    type_id = message.type_id,
                    "Unhandled message"
                );
                Ok(())
            }
        }
    }

    async fn handle_control(&mut self, control: ControlMessage) -> Result<()> {
        match control {
            ControlMessage::SetChunkSize(size) => {
                tracing::debug!(session_id = self.context.id, size = size, "Peer set chunk size");
                self.assembler.set_chunk_size(size)?;
                self.context.in_chunk_size = self.assembler.chunk_size();
            }

            ControlMessage::Abort { csid } => {
                self.assembler.abort(csid);
            }

            ControlMessage::Acknowledgement { sequence } => {
                self.context.peer_acknowledged = sequence;
            }

            ControlMessage::WindowAckSize(size) => {
                self.context.in_window_ack_size = size;
            }

            ControlMessage::SetPeerBandwidth { size, .. } => {
                if size != self.context.out_window_ack_size {
                    self.client
                        .send_message(&ControlMessage::WindowAckSize(size).encode(), None)
                        .await?;
                    self.context.out_window_ack_size = size;
                }
            }

            ControlMessage::UserControl(UserControlEvent::PingRequest(timestamp)) => {
                let pong = ControlMessage::UserControl(UserControlEvent::PingResponse(timestamp));
                self.client.send_message(&pong.encode(), None).await?;
            }

            ControlMessage::UserControl(event) => {
                tracing::trace!(session_id = self.context.id, event = ?event, "User control event");
            }
        }
        Ok(())
    }

    async fn handle_media(&mut self, media_type: MediaType, message: RtmpMessage) -> Result<()> {
        let Some(path) = &self.context.publish_path else {
            return Err(ProtocolError::UnexpectedMessage(format!(
                "{} message from a client that is not publishing",
                media_type
            ))
            .into());
        };

        self.broadcaster
            .handle_media(path, media_type, message.timestamp, message.payload)
            .await;
        Ok(())
    }

    /// End any publish or play this connection still holds
    pub async fn close(&mut self) {
        let mut ctx = CommandContext::new(
            &mut self.context,
            &self.client,
            &self.broadcaster,
            &self.config,
        );
        if ctx.stop_playing().await {
            tracing::debug!(session_id = ctx.client_id(), "Stopped playback on disconnect");
        }
        match ctx.unpublish().await {
            Ok(true) => {
                tracing::debug!(session_id = ctx.client_id(), "Stopped publishing on disconnect");
            }
            Ok(false) => {}
            Err(e) => {
                tracing::debug!(session_id = ctx.client_id(), error = %e, "Unpublish on disconnect failed");
            }
        }
    }
}
