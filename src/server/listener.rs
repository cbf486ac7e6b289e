//! RTMP server listener
//!
//! Handles the TCP accept loop and spawns a task per connection.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::media::MediaClassifier;
use crate::registry::StreamRegistry;
use crate::server::broadcaster::MediaBroadcaster;
use crate::server::config::ServerConfig;
use crate::server::connection::Connection;
use crate::server::events::EventDispatcher;
use crate::server::handler::CommandHandler;

/// RTMP server
pub struct RtmpServer<C: CommandHandler> {
    config: Arc<ServerConfig>,
    commands: Arc<C>,
    registry: Arc<StreamRegistry>,
    events: Arc<EventDispatcher>,
    broadcaster: Arc<MediaBroadcaster>,
    next_session_id: AtomicU64,
    connection_semaphore: Option<Arc<Semaphore>>,
    shutdown: CancellationToken,
}

impl<C: CommandHandler> RtmpServer<C> {
    /// Create a server; fails if the configuration is invalid
    pub fn new(config: ServerConfig, commands: C, events: EventDispatcher) -> Result<Self> {
        config.validate()?;

        let connection_semaphore = if config.max_connections > 0 {
            Some(Arc::new(Semaphore::new(config.max_connections)))
        } else {
            None
        };

        let registry = Arc::new(StreamRegistry::new());
        let events = Arc::new(events);
        let broadcaster = Arc::new(MediaBroadcaster::new(registry.clone(), events.clone(), &config));

        Ok(Self {
            config: Arc::new(config),
            commands: Arc::new(commands),
            registry,
            events,
            broadcaster,
            next_session_id: AtomicU64::new(1),
            connection_semaphore,
            shutdown: CancellationToken::new(),
        })
    }

    /// Use a custom media classifier instead of the FLV one
    pub fn with_classifier(mut self, classifier: Arc<dyn MediaClassifier>) -> Self {
        self.broadcaster = Arc::new(
            MediaBroadcaster::new(self.registry.clone(), self.events.clone(), &self.config)
                .with_classifier(classifier),
        );
        self
    }

    /// Shared stream registry
    pub fn registry(&self) -> &Arc<StreamRegistry> {
        &self.registry
    }

    /// Get the bind address
    pub fn bind_addr(&self) -> SocketAddr {
        self.config.bind_addr
    }

    /// Run the server
    ///
    /// This method blocks until the listener fails.
    pub async fn run(&self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Run the server with graceful shutdown
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Accept connections on an already bound listener until `shutdown`
    /// resolves. Open connections are closed on shutdown.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let addr = listener.local_addr()?;
        tracing::info!(addr = %addr, "RTMP server listening");

        let result = tokio::select! {
            _ = shutdown => {
                tracing::info!("Shutdown signal received");
                Ok(())
            }
            result = self.accept_loop(&listener) => result,
        };

        self.shutdown.cancel();
        result
    }

    async fn accept_loop(&self, listener: &TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    self.handle_connection(socket, peer_addr);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        // Check connection limit
        let permit: Option<OwnedSemaphorePermit> = match &self.connection_semaphore {
            Some(sem) => match sem.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    tracing::warn!(peer = %peer_addr, "Connection rejected: limit reached");
                    return;
                }
            },
            None => None,
        };

        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(
            session_id = session_id,
            peer = %peer_addr,
            "New connection"
        );

        if let Err(e) = self.configure_socket(&socket) {
            tracing::error!(error = %e, "Failed to configure socket");
            return;
        }

        let connection = Connection::new(
            session_id,
            socket,
            peer_addr,
            self.config.clone(),
            self.broadcaster.clone(),
            self.commands.clone(),
        )
        .with_shutdown(self.shutdown.child_token());

        tokio::spawn(async move {
            // Held for the lifetime of the connection
            let _permit = permit;

            if let Err(e) = connection.run().await {
                tracing::debug!(
                    session_id = session_id,
                    error = %e,
                    "Connection error"
                );
            }
        });
    }

    fn configure_socket(&self, socket: &TcpStream) -> std::io::Result<()> {
        if self.config.tcp_nodelay {
            socket.set_nodelay(true)?;
        }
        Ok(())
    }
}

impl<C: CommandHandler> std::fmt::Debug for RtmpServer<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtmpServer")
            .field("bind_addr", &self.config.bind_addr)
            .field("max_connections", &self.config.max_connections)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::protocol::constants::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::oneshot;

    struct NoCommands;

    impl CommandHandler for NoCommands {}

    #[test]
    fn test_invalid_config_rejected() {
        let config = ServerConfig::default().max_outstanding_sends(0);
        let result = RtmpServer::new(config, NoCommands, EventDispatcher::new());
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_serve_accepts_and_shuts_down() {
        crate::test_util::init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(
            RtmpServer::new(ServerConfig::default().max_connections(4), NoCommands, EventDispatcher::new())
                .unwrap(),
        );

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = {
            let server = server.clone();
            tokio::spawn(async move {
                server
                    .serve(listener, async {
                        let _ = stop_rx.await;
                    })
                    .await
            })
        };

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut c0c1 = vec![0u8; 1 + HANDSHAKE_SIZE];
        c0c1[0] = RTMP_VERSION;
        stream.write_all(&c0c1).await.unwrap();

        let mut s0s1s2 = vec![0u8; 1 + 2 * HANDSHAKE_SIZE];
        stream.read_exact(&mut s0s1s2).await.unwrap();
        assert_eq!(s0s1s2[0], RTMP_VERSION);
        // S2 echoes C1 apart from the read timestamp
        assert_eq!(&s0s1s2[1 + HANDSHAKE_SIZE + 8..], &c0c1[9..]);

        stop_tx.send(()).unwrap();
        task.await.unwrap().unwrap();

        // Open connections are closed on shutdown
        let mut rest = Vec::new();
        let closed = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            stream.read_to_end(&mut rest),
        )
        .await;
        assert!(closed.is_ok());
    }
}
