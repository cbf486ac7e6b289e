//! Per-connection driver
//!
//! Manages the lifecycle of a single RTMP connection:
//! 1. Handshake (bounded by the connection timeout)
//! 2. Send task started on the write half
//! 3. Read loop feeding the session (bounded by the idle timeout)
//! 4. Cleanup: publish/play released, queued sends failed, disposed event

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, BufWriter};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::broadcaster::MediaBroadcaster;
use super::config::ServerConfig;
use super::handler::CommandHandler;
use super::session::Session;
use crate::error::{Error, Result};
use crate::protocol::handshake;
use crate::session::{ClientContext, ClientHandle, ClientId};

/// Minimum free space kept in the read buffer before each read
const MIN_READ_SPACE: usize = 4096;

/// One accepted connection
pub struct Connection<S, C: CommandHandler> {
    session_id: ClientId,
    io: S,
    peer_addr: SocketAddr,
    config: Arc<ServerConfig>,
    broadcaster: Arc<MediaBroadcaster>,
    commands: Arc<C>,
    shutdown: CancellationToken,
}

impl<S, C> Connection<S, C>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    C: CommandHandler,
{
    pub fn new(
        session_id: ClientId,
        io: S,
        peer_addr: SocketAddr,
        config: Arc<ServerConfig>,
        broadcaster: Arc<MediaBroadcaster>,
        commands: Arc<C>,
    ) -> Self {
        Self {
            session_id,
            io,
            peer_addr,
            config,
            broadcaster,
            commands,
            shutdown: CancellationToken::new(),
        }
    }

    /// Close the connection when `token` is cancelled
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Run the connection to completion
    pub async fn run(self) -> Result<()> {
        let Self {
            session_id,
            mut io,
            peer_addr,
            config,
            broadcaster,
            commands,
            shutdown,
        } = self;
        let events = broadcaster.events().clone();

        events.client_created(session_id, peer_addr).await;

        let mut read_buf = BytesMut::with_capacity(config.read_buffer_size);
        let handshake = tokio::select! {
            biased;
            _ = shutdown.cancelled() => None,
            r = timeout(config.connection_timeout, handshake::accept(&mut io, &mut read_buf)) => {
                Some(r.map_err(|_| Error::Timeout).and_then(|r| r))
            }
        };

        let Some(handshake) = handshake else {
            tracing::debug!(session_id = session_id, "Shutdown during handshake");
            events.client_disposed(session_id).await;
            return Ok(());
        };
        if let Err(e) = handshake {
            tracing::debug!(session_id = session_id, error = %e, "Handshake failed");
            events.client_disposed(session_id).await;
            return Err(e);
        }
        tracing::debug!(session_id = session_id, "Handshake complete");
        events.handshake_complete(session_id).await;

        let (mut reader, writer) = tokio::io::split(io);
        let cancel = shutdown.child_token();
        let (client, queue) = ClientHandle::new(session_id, peer_addr, cancel.clone());
        let send_task = tokio::spawn(
            queue.run(BufWriter::with_capacity(config.write_buffer_size, writer)),
        );

        let mut session = Session::new(
            ClientContext::new(session_id, peer_addr),
            client,
            broadcaster,
            commands,
            config.clone(),
        );

        let result = read_loop(&mut session, &mut reader, read_buf, &config, &cancel).await;

        session.close().await;
        cancel.cancel();
        if let Ok(Err(e)) = send_task.await {
            tracing::trace!(session_id = session_id, error = %e, "Send task ended with error");
        }

        match &result {
            Ok(()) => tracing::debug!(session_id = session_id, "Connection closed"),
            Err(e) => tracing::debug!(session_id = session_id, error = %e, "Connection closed with error"),
        }
        events.client_disposed(session_id).await;
        result
    }
}

async fn read_loop<R, C>(
    session: &mut Session<C>,
    reader: &mut R,
    mut buf: BytesMut,
    config: &ServerConfig,
    cancel: &CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    C: CommandHandler,
{
    session.start().await?;

    // Anything that arrived right behind C2 (usually connect)
    if !buf.is_empty() {
        session.record_received(buf.len()).await?;
        session.process(&mut buf).await?;
    }

    loop {
        if buf.capacity() - buf.len() < MIN_READ_SPACE {
            buf.reserve(config.read_buffer_size.max(MIN_READ_SPACE));
        }

        let n = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            read = timeout(config.idle_timeout, reader.read_buf(&mut buf)) => match read {
                Ok(read) => read?,
                Err(_) => {
                    tracing::debug!(session_id = session.context().id, "Idle timeout");
                    return Err(Error::Timeout);
                }
            },
        };

        if n == 0 {
            return Ok(());
        }

        session.record_received(n).await?;
        session.process(&mut buf).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::assembler::MessageAssembler;
    use crate::protocol::constants::*;
    use crate::protocol::message::{ControlMessage, RtmpMessage};
    use crate::protocol::writer::MessageWriter;
    use crate::registry::StreamRegistry;
    use crate::server::events::{ConnectionEventHandler, EventDispatcher, HandlerResult};
    use crate::server::handler::CommandContext;
    use async_trait::async_trait;
    use bytes::{BufMut, Bytes};
    use std::collections::HashMap;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream};

    struct PublishOnCommand;

    #[async_trait]
    impl CommandHandler for PublishOnCommand {
        async fn on_command(&self, ctx: &mut CommandContext<'_>, message: &RtmpMessage) -> Result<()> {
            let path = String::from_utf8_lossy(&message.payload).to_string();
            ctx.create_stream();
            ctx.publish(&path, HashMap::new()).await
        }
    }

    #[derive(Default)]
    struct Lifecycle(Mutex<Vec<&'static str>>);

    #[async_trait]
    impl ConnectionEventHandler for Lifecycle {
        async fn on_client_created(&self, _id: ClientId, _addr: SocketAddr) -> HandlerResult {
            self.0.lock().unwrap().push("created");
            Ok(())
        }

        async fn on_handshake_complete(&self, _id: ClientId) -> HandlerResult {
            self.0.lock().unwrap().push("handshake");
            Ok(())
        }

        async fn on_client_disposed(&self, _id: ClientId) -> HandlerResult {
            self.0.lock().unwrap().push("disposed");
            Ok(())
        }
    }

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 44000)
    }

    fn setup(
        config: ServerConfig,
        lifecycle: Arc<Lifecycle>,
    ) -> (Arc<MediaBroadcaster>, Arc<ServerConfig>) {
        let events = EventDispatcher::new().with_connection_handler(lifecycle);
        let broadcaster = Arc::new(MediaBroadcaster::new(
            Arc::new(StreamRegistry::new()),
            Arc::new(events),
            &config,
        ));
        (broadcaster, Arc::new(config))
    }

    async fn client_handshake(peer: &mut DuplexStream) {
        let mut c0c1 = BytesMut::with_capacity(1 + HANDSHAKE_SIZE);
        c0c1.put_u8(RTMP_VERSION);
        c0c1.put_bytes(0x42, HANDSHAKE_SIZE);
        peer.write_all(&c0c1).await.unwrap();

        let mut s0s1s2 = vec![0u8; 1 + 2 * HANDSHAKE_SIZE];
        peer.read_exact(&mut s0s1s2).await.unwrap();
        assert_eq!(s0s1s2[0], RTMP_VERSION);

        // C2 echoes S1
        peer.write_all(&s0s1s2[1..1 + HANDSHAKE_SIZE]).await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_over_connection() {
        crate::test_util::init_tracing();
        let lifecycle = Arc::new(Lifecycle::default());
        let (broadcaster, config) = setup(ServerConfig::default(), lifecycle.clone());
        let (server_io, mut peer) = duplex(64 * 1024);

        let conn = Connection::new(
            1,
            server_io,
            addr(),
            config,
            broadcaster.clone(),
            Arc::new(PublishOnCommand),
        );
        let task = tokio::spawn(conn.run());

        client_handshake(&mut peer).await;

        let mut writer = MessageWriter::new();
        let mut buf = BytesMut::new();
        writer
            .encode(
                &RtmpMessage::new(CSID_COMMAND, 0, MSG_COMMAND_AMF0, 0, Bytes::from_static(b"live/a")),
                &mut buf,
            )
            .unwrap();
        peer.write_all(&buf).await.unwrap();

        // Set Chunk Size, then Stream Begin once publish went through
        let mut assembler = MessageAssembler::new();
        let mut read = BytesMut::new();
        let mut messages = Vec::new();
        while messages.len() < 2 {
            peer.read_buf(&mut read).await.unwrap();
            while let Some(msg) = assembler.decode(&mut read).unwrap() {
                messages.push(msg);
            }
        }
        assert_eq!(
            ControlMessage::parse(&messages[0]).unwrap(),
            Some(ControlMessage::SetChunkSize(RECOMMENDED_CHUNK_SIZE))
        );
        assert!(broadcaster.registry().is_publishing("live/a").await);

        drop(peer);
        task.await.unwrap().unwrap();
        assert!(!broadcaster.registry().is_publishing("live/a").await);
        assert_eq!(
            *lifecycle.0.lock().unwrap(),
            vec!["created", "handshake", "disposed"]
        );
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let lifecycle = Arc::new(Lifecycle::default());
        let config = ServerConfig::default().connection_timeout(Duration::from_millis(20));
        let (broadcaster, config) = setup(config, lifecycle.clone());
        let (server_io, _peer) = duplex(1024);

        let result = Connection::new(1, server_io, addr(), config, broadcaster, Arc::new(PublishOnCommand))
            .run()
            .await;
        assert!(matches!(result, Err(Error::Timeout)));
        assert_eq!(*lifecycle.0.lock().unwrap(), vec!["created", "disposed"]);
    }

    #[tokio::test]
    async fn test_shutdown_during_handshake_is_clean() {
        let lifecycle = Arc::new(Lifecycle::default());
        let (broadcaster, config) = setup(ServerConfig::default(), lifecycle.clone());
        let (server_io, _peer) = duplex(1024);
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        Connection::new(1, server_io, addr(), config, broadcaster, Arc::new(PublishOnCommand))
            .with_shutdown(shutdown)
            .run()
            .await
            .unwrap();
        assert_eq!(*lifecycle.0.lock().unwrap(), vec!["created", "disposed"]);
    }

    #[tokio::test]
    async fn test_shutdown_token_closes_connection() {
        let lifecycle = Arc::new(Lifecycle::default());
        let (broadcaster, config) = setup(ServerConfig::default(), lifecycle);
        let (server_io, mut peer) = duplex(64 * 1024);
        let shutdown = CancellationToken::new();

        let conn = Connection::new(1, server_io, addr(), config, broadcaster, Arc::new(PublishOnCommand))
            .with_shutdown(shutdown.clone());
        let task = tokio::spawn(conn.run());

        client_handshake(&mut peer).await;
        shutdown.cancel();
        task.await.unwrap().unwrap();
    }
}
