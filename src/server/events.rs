//! Server event handlers
//!
//! Downstream consumers (recorders, remuxers, dashboards) observe the server
//! through three handler traits. All methods have no-op defaults. Handlers
//! are registered on an [`EventDispatcher`] at startup and invoked in
//! registration order; a handler that fails or panics is logged and the
//! remaining handlers still run.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;

use crate::media::MediaType;
use crate::session::ClientId;

/// Error type returned by event handlers
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Result type returned by event handlers
pub type HandlerResult = std::result::Result<(), HandlerError>;

/// Connection lifecycle events
#[async_trait]
pub trait ConnectionEventHandler: Send + Sync + 'static {
    /// TCP connection accepted
    async fn on_client_created(&self, _client_id: ClientId, _peer_addr: SocketAddr) -> HandlerResult {
        Ok(())
    }

    /// Handshake completed; the client context now exists
    async fn on_handshake_complete(&self, _client_id: ClientId) -> HandlerResult {
        Ok(())
    }

    /// Client connected to an application
    async fn on_client_connected(&self, _client_id: ClientId, _app: &str) -> HandlerResult {
        Ok(())
    }

    /// Connection closed and cleaned up
    async fn on_client_disposed(&self, _client_id: ClientId) -> HandlerResult {
        Ok(())
    }
}

/// Publish/play events
#[async_trait]
pub trait StreamEventHandler: Send + Sync + 'static {
    async fn on_stream_published(
        &self,
        _client_id: ClientId,
        _path: &str,
        _args: &HashMap<String, String>,
    ) -> HandlerResult {
        Ok(())
    }

    async fn on_stream_unpublished(&self, _client_id: ClientId, _path: &str) -> HandlerResult {
        Ok(())
    }

    async fn on_stream_subscribed(
        &self,
        _client_id: ClientId,
        _path: &str,
        _args: &HashMap<String, String>,
    ) -> HandlerResult {
        Ok(())
    }

    async fn on_stream_unsubscribed(&self, _client_id: ClientId, _path: &str) -> HandlerResult {
        Ok(())
    }

    async fn on_stream_metadata_received(
        &self,
        _client_id: ClientId,
        _path: &str,
        _metadata: &Bytes,
    ) -> HandlerResult {
        Ok(())
    }
}

/// Media events, for consumers such as remuxers
#[async_trait]
pub trait MediaEventHandler: Send + Sync + 'static {
    async fn on_media_received(
        &self,
        _path: &str,
        _media_type: MediaType,
        _timestamp: u32,
        _payload: &Bytes,
    ) -> HandlerResult {
        Ok(())
    }

    async fn on_metadata_received(&self, _path: &str, _metadata: &Bytes) -> HandlerResult {
        Ok(())
    }
}

/// Ordered set of event handlers
#[derive(Clone, Default)]
pub struct EventDispatcher {
    connection: Vec<Arc<dyn ConnectionEventHandler>>,
    stream: Vec<Arc<dyn StreamEventHandler>>,
    media: Vec<Arc<dyn MediaEventHandler>>,
}

/// Run one handler call, logging an error or a panic
async fn guarded<F>(event: &'static str, index: usize, call: F)
where
    F: Future<Output = HandlerResult>,
{
    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::warn!(event = event, handler = index, error = %e, "Event handler failed");
        }
        Err(panic) => {
            tracing::error!(
                event = event,
                handler = index,
                panic = %panic_message(panic.as_ref()),
                "Event handler panicked"
            );
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connection_handler(mut self, handler: Arc<dyn ConnectionEventHandler>) -> Self {
        self.connection.push(handler);
        self
    }

    pub fn with_stream_handler(mut self, handler: Arc<dyn StreamEventHandler>) -> Self {
        self.stream.push(handler);
        self
    }

    pub fn with_media_handler(mut self, handler: Arc<dyn MediaEventHandler>) -> Self {
        self.media.push(handler);
        self
    }

    /// Register one handler for all three event kinds
    pub fn with_handler<H>(self, handler: Arc<H>) -> Self
    where
        H: ConnectionEventHandler + StreamEventHandler + MediaEventHandler,
    {
        self.with_connection_handler(handler.clone())
            .with_stream_handler(handler.clone())
            .with_media_handler(handler)
    }

    pub async fn client_created(&self, client_id: ClientId, peer_addr: SocketAddr) {
        for (i, h) in self.connection.iter().enumerate() {
            guarded("client_created", i, h.on_client_created(client_id, peer_addr)).await;
        }
    }

    pub async fn handshake_complete(&self, client_id: ClientId) {
        for (i, h) in self.connection.iter().enumerate() {
            guarded("handshake_complete", i, h.on_handshake_complete(client_id)).await;
        }
    }

    pub async fn client_connected(&self, client_id: ClientId, app: &str) {
        for (i, h) in self.connection.iter().enumerate() {
            guarded("client_connected", i, h.on_client_connected(client_id, app)).await;
        }
    }

    pub async fn client_disposed(&self, client_id: ClientId) {
        for (i, h) in self.connection.iter().enumerate() {
            guarded("client_disposed", i, h.on_client_disposed(client_id)).await;
        }
    }

    pub async fn stream_published(
        &self,
        client_id: ClientId,
        path: &str,
        args: &HashMap<String, String>,
    ) {
        for (i, h) in self.stream.iter().enumerate() {
            guarded("stream_published", i, h.on_stream_published(client_id, path, args)).await;
        }
    }

    pub async fn stream_unpublished(&self, client_id: ClientId, path: &str) {
        for (i, h) in self.stream.iter().enumerate() {
            guarded("stream_unpublished", i, h.on_stream_unpublished(client_id, path)).await;
        }
    }

    pub async fn stream_subscribed(
        &self,
        client_id: ClientId,
        path: &str,
        args: &HashMap<String, String>,
    ) {
        for (i, h) in self.stream.iter().enumerate() {
            guarded("stream_subscribed", i, h.on_stream_subscribed(client_id, path, args)).await;
        }
    }

    pub async fn stream_unsubscribed(&self, client_id: ClientId, path: &str) {
        for (i, h) in self.stream.iter().enumerate() {
            guarded("stream_unsubscribed", i, h.on_stream_unsubscribed(client_id, path)).await;
        }
    }

    pub async fn metadata_received(&self, client_id: ClientId, path: &str, metadata: &Bytes) {
        for (i, h) in self.stream.iter().enumerate() {
            guarded(
                "stream_metadata_received",
                i,
                h.on_stream_metadata_received(client_id, path, metadata),
            )
            .await;
        }
        for (i, h) in self.media.iter().enumerate() {
            guarded("metadata_received", i, h.on_metadata_received(path, metadata)).await;
        }
    }

    pub async fn media_received(
        &self,
        path: &str,
        media_type: MediaType,
        timestamp: u32,
        payload: &Bytes,
    ) {
        for (i, h) in self.media.iter().enumerate() {
            guarded(
                "media_received",
                i,
                h.on_media_received(path, media_type, timestamp, payload),
            )
            .await;
        }
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("connection_handlers", &self.connection.len())
            .field("stream_handlers", &self.stream.len())
            .field("media_handlers", &self.media.len())
            .finish()
    }
}

/// A handler that logs connection and stream events
pub struct LoggingHandler;

#[async_trait]
impl ConnectionEventHandler for LoggingHandler {
    async fn on_client_created(&self, client_id: ClientId, peer_addr: SocketAddr) -> HandlerResult {
        tracing::info!(session_id = client_id, peer = %peer_addr, "New connection");
        Ok(())
    }

    async fn on_client_connected(&self, client_id: ClientId, app: &str) -> HandlerResult {
        tracing::info!(session_id = client_id, app = %app, "Client connected");
        Ok(())
    }

    async fn on_client_disposed(&self, client_id: ClientId) -> HandlerResult {
        tracing::info!(session_id = client_id, "Connection closed");
        Ok(())
    }
}

#[async_trait]
impl StreamEventHandler for LoggingHandler {
    async fn on_stream_published(
        &self,
        client_id: ClientId,
        path: &str,
        _args: &HashMap<String, String>,
    ) -> HandlerResult {
        tracing::info!(session_id = client_id, stream = %path, "Stream published");
        Ok(())
    }

    async fn on_stream_unpublished(&self, client_id: ClientId, path: &str) -> HandlerResult {
        tracing::info!(session_id = client_id, stream = %path, "Stream unpublished");
        Ok(())
    }

    async fn on_stream_subscribed(
        &self,
        client_id: ClientId,
        path: &str,
        _args: &HashMap<String, String>,
    ) -> HandlerResult {
        tracing::info!(session_id = client_id, stream = %path, "Stream subscribed");
        Ok(())
    }

    async fn on_stream_unsubscribed(&self, client_id: ClientId, path: &str) -> HandlerResult {
        tracing::info!(session_id = client_id, stream = %path, "Stream unsubscribed");
        Ok(())
    }

    async fn on_stream_metadata_received(
        &self,
        client_id: ClientId,
        path: &str,
        metadata: &Bytes,
    ) -> HandlerResult {
        tracing::debug!(
            session_id = client_id,
            stream = %path,
            size = metadata.len(),
            "Received metadata"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        name: &'static str,
        fail: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl StreamEventHandler for Recorder {
        async fn on_stream_published(
            &self,
            _client_id: ClientId,
            path: &str,
            _args: &HashMap<String, String>,
        ) -> HandlerResult {
            self.log.lock().unwrap().push(format!("{}:{}", self.name, path));
            if self.fail {
                Err("recorder unavailable".into())
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl MediaEventHandler for Recorder {
        async fn on_media_received(
            &self,
            path: &str,
            media_type: MediaType,
            timestamp: u32,
            _payload: &Bytes,
        ) -> HandlerResult {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:{}:{}:{}", self.name, path, media_type, timestamp));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_stop_dispatch() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let first = Arc::new(Recorder {
            name: "first",
            fail: true,
            log: log.clone(),
        });
        let second = Arc::new(Recorder {
            name: "second",
            fail: false,
            log: log.clone(),
        });

        let dispatcher = EventDispatcher::new()
            .with_stream_handler(first)
            .with_stream_handler(second);
        dispatcher
            .stream_published(1, "live/a", &HashMap::new())
            .await;

        assert_eq!(
            *log.lock().unwrap(),
            vec!["first:live/a".to_string(), "second:live/a".to_string()]
        );
    }

    struct Panicker;

    #[async_trait]
    impl StreamEventHandler for Panicker {
        async fn on_stream_published(
            &self,
            _client_id: ClientId,
            _path: &str,
            _args: &HashMap<String, String>,
        ) -> HandlerResult {
            panic!("recorder crashed");
        }
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_stop_dispatch() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::new(Recorder {
            name: "after",
            fail: false,
            log: log.clone(),
        });

        let dispatcher = EventDispatcher::new()
            .with_stream_handler(Arc::new(Panicker))
            .with_stream_handler(recorder);
        dispatcher
            .stream_published(1, "live/a", &HashMap::new())
            .await;

        assert_eq!(*log.lock().unwrap(), vec!["after:live/a".to_string()]);
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new(String::from("boom"));
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(7u32);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }

    #[tokio::test]
    async fn test_media_dispatch() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::new(Recorder {
            name: "rec",
            fail: false,
            log: log.clone(),
        });

        let dispatcher = EventDispatcher::new().with_media_handler(recorder);
        dispatcher
            .media_received("live/a", MediaType::Video, 40, &Bytes::from_static(b"x"))
            .await;
        // No connection handlers registered
        dispatcher.client_disposed(1).await;

        assert_eq!(*log.lock().unwrap(), vec!["rec:live/a:video:40".to_string()]);
    }

    #[tokio::test]
    async fn test_logging_handler_accepts_everything() {
        let dispatcher = EventDispatcher::new()
            .with_connection_handler(Arc::new(LoggingHandler))
            .with_stream_handler(Arc::new(LoggingHandler));
        dispatcher.client_connected(1, "live").await;
        dispatcher.stream_unpublished(1, "live/a").await;
        assert!(format!("{:?}", dispatcher).contains("connection_handlers: 1"));
    }
}
