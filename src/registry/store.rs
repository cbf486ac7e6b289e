//! Stream registry implementation
//!
//! Publish/subscribe bookkeeping for every path on the server.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use super::entry::{LockedSubscribers, StreamEntry};
use super::error::RegistryError;
use crate::session::{ClientId, PublishStreamContext, StreamSubscription};

/// Registry of published streams and their subscribers
///
/// Thread-safe: designed to be wrapped in `Arc` and shared across all
/// connection tasks. The path map is only write-locked to add or remove a
/// path; everything else happens under the per-path mutex.
#[derive(Debug, Default)]
pub struct StreamRegistry {
    /// Published paths
    streams: RwLock<HashMap<String, Arc<Mutex<StreamEntry>>>>,
    /// Path each subscribing client is attached to
    subscriptions: RwLock<HashMap<ClientId, String>>,
}

impl StreamRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    async fn entry(&self, path: &str) -> Option<Arc<Mutex<StreamEntry>>> {
        self.streams.read().await.get(path).cloned()
    }

    /// Register a publish context for its path.
    ///
    /// Fails with `AlreadyExists` if the path is taken; the existing
    /// publisher is never replaced.
    pub async fn start_publishing(&self, context: PublishStreamContext) -> Result<(), RegistryError> {
        let mut streams = self.streams.write().await;
        let path = context.path().to_string();

        if streams.contains_key(&path) {
            tracing::debug!(
                stream = %path,
                session_id = context.publisher_id(),
                "Publish rejected, path already published"
            );
            return Err(RegistryError::AlreadyExists(path));
        }

        tracing::info!(
            stream = %path,
            session_id = context.publisher_id(),
            "Publisher registered"
        );
        streams.insert(path, Arc::new(Mutex::new(StreamEntry::new(context))));
        Ok(())
    }

    /// Remove the publish context of a path.
    ///
    /// Returns the subscribers that were attached (possibly none). The
    /// caller is responsible for notifying and detaching them. Cached
    /// buffers are dropped.
    pub async fn stop_publishing(
        &self,
        path: &str,
    ) -> Result<Vec<Arc<StreamSubscription>>, RegistryError> {
        let entry = self
            .streams
            .write()
            .await
            .remove(path)
            .ok_or_else(|| RegistryError::NotFound(path.to_string()))?;

        let mut entry = entry.lock().await;
        entry.closed = true;
        entry.publish.clear_caches();
        let subscribers = std::mem::take(&mut entry.subscribers);

        let mut subscriptions = self.subscriptions.write().await;
        for sub in &subscribers {
            if subscriptions.get(&sub.client_id()).map(String::as_str) == Some(path) {
                subscriptions.remove(&sub.client_id());
            }
        }

        tracing::info!(
            stream = %path,
            session_id = entry.publish.publisher_id(),
            subscribers = subscribers.len(),
            uptime_ms = entry.publish.uptime().as_millis() as u64,
            "Publisher unregistered"
        );
        Ok(subscribers)
    }

    /// Attach a subscription to its path.
    ///
    /// `catch_up` runs under the path lock before the subscription is added,
    /// so whatever it enqueues precedes every live packet broadcast after
    /// the join.
    pub async fn start_subscribing<F>(
        &self,
        subscription: Arc<StreamSubscription>,
        catch_up: F,
    ) -> Result<(), RegistryError>
    where
        F: FnOnce(&PublishStreamContext, &Arc<StreamSubscription>),
    {
        let path = subscription.path().to_string();
        let client_id = subscription.client_id();

        if let Some(existing) = self.subscriptions.read().await.get(&client_id) {
            return Err(RegistryError::AlreadySubscribing(existing.clone()));
        }

        let entry = self
            .entry(&path)
            .await
            .ok_or_else(|| RegistryError::StreamDoesntExist(path.clone()))?;
        let mut entry = entry.lock().await;
        if entry.closed {
            return Err(RegistryError::StreamDoesntExist(path));
        }

        let mut subscriptions = self.subscriptions.write().await;
        if let Some(existing) = subscriptions.get(&client_id) {
            return Err(RegistryError::AlreadySubscribing(existing.clone()));
        }

        catch_up(&entry.publish, &subscription);
        entry.subscribers.push(subscription);
        subscriptions.insert(client_id, path.clone());

        tracing::info!(
            stream = %path,
            session_id = client_id,
            subscribers = entry.subscribers.len(),
            "Subscriber added"
        );
        Ok(())
    }

    /// Detach a client's subscription; returns whether one was found
    pub async fn stop_subscribing(&self, client_id: ClientId) -> bool {
        let Some(path) = self.subscriptions.write().await.remove(&client_id) else {
            return false;
        };
        let Some(entry) = self.entry(&path).await else {
            return false;
        };

        let mut entry = entry.lock().await;
        let before = entry.subscribers.len();
        entry.subscribers.retain(|s| s.client_id() != client_id);
        let removed = entry.subscribers.len() != before;

        if removed {
            tracing::debug!(
                stream = %path,
                session_id = client_id,
                subscribers = entry.subscribers.len(),
                "Subscriber removed"
            );
        }
        removed
    }

    /// Point-in-time copy of a path's subscribers; the lock is released
    /// before returning
    pub async fn get_subscribers(&self, path: &str) -> Vec<Arc<StreamSubscription>> {
        match self.entry(path).await {
            Some(entry) => {
                let entry = entry.lock().await;
                if entry.closed {
                    Vec::new()
                } else {
                    entry.subscribers.clone()
                }
            }
            None => Vec::new(),
        }
    }

    /// Lock a path and return its subscribers with the lock held.
    ///
    /// `None` if nothing is published at the path.
    pub async fn get_subscribers_locked(&self, path: &str) -> Option<LockedSubscribers> {
        let entry = self.entry(path).await?;
        let guard = entry.lock_owned().await;
        if guard.closed {
            return None;
        }
        Some(LockedSubscribers::new(guard))
    }

    /// Check if a path has a publisher
    pub async fn is_publishing(&self, path: &str) -> bool {
        self.streams.read().await.contains_key(path)
    }

    /// Path the client is subscribed to, if any
    pub async fn subscription_of(&self, client_id: ClientId) -> Option<String> {
        self.subscriptions.read().await.get(&client_id).cloned()
    }

    /// All published paths
    pub async fn stream_paths(&self) -> Vec<String> {
        self.streams.read().await.keys().cloned().collect()
    }

    /// Number of published paths
    pub async fn stream_count(&self) -> usize {
        self.streams.read().await.len()
    }

    /// Number of subscribers attached to a path
    pub async fn subscriber_count(&self, path: &str) -> usize {
        self.get_subscribers(path).await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ClientHandle;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn publisher(path: &str, client_id: ClientId) -> PublishStreamContext {
        PublishStreamContext::new(path, client_id, 1, HashMap::new())
    }

    fn subscription(path: &str, client_id: ClientId) -> Arc<StreamSubscription> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 40000);
        let (client, _queue) = ClientHandle::new(client_id, addr, CancellationToken::new());
        let (sub, _delivery) = StreamSubscription::new(client, 1, path, HashMap::new());
        sub
    }

    #[tokio::test]
    async fn test_double_publish_keeps_first() {
        let registry = StreamRegistry::new();
        registry.start_publishing(publisher("/live/a", 1)).await.unwrap();

        let err = registry
            .start_publishing(publisher("/live/a", 2))
            .await
            .unwrap_err();
        assert_eq!(err, RegistryError::AlreadyExists("/live/a".into()));

        let locked = registry.get_subscribers_locked("/live/a").await.unwrap();
        assert_eq!(locked.publish_context().publisher_id(), 1);
        assert_eq!(registry.stream_count().await, 1);
    }

    #[tokio::test]
    async fn test_stop_publishing() {
        let registry = StreamRegistry::new();
        registry.start_publishing(publisher("live/a", 1)).await.unwrap();
        registry
            .start_subscribing(subscription("live/a", 2), |_, _| {})
            .await
            .unwrap();

        let subscribers = registry.stop_publishing("live/a").await.unwrap();
        assert_eq!(subscribers.len(), 1);
        assert!(!registry.is_publishing("live/a").await);
        assert_eq!(registry.subscription_of(2).await, None);

        assert_eq!(
            registry.stop_publishing("live/a").await.unwrap_err(),
            RegistryError::NotFound("live/a".into())
        );

        // The path can be published again
        registry.start_publishing(publisher("live/a", 3)).await.unwrap();
        assert!(registry.stop_publishing("live/a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_errors() {
        let registry = StreamRegistry::new();
        let err = registry
            .start_subscribing(subscription("live/missing", 2), |_, _| {})
            .await
            .unwrap_err();
        assert_eq!(err, RegistryError::StreamDoesntExist("live/missing".into()));

        registry.start_publishing(publisher("live/a", 1)).await.unwrap();
        registry.start_publishing(publisher("live/b", 9)).await.unwrap();
        registry
            .start_subscribing(subscription("live/a", 2), |_, _| {})
            .await
            .unwrap();

        let err = registry
            .start_subscribing(subscription("live/b", 2), |_, _| {})
            .await
            .unwrap_err();
        assert_eq!(err, RegistryError::AlreadySubscribing("live/a".into()));
        assert_eq!(registry.subscriber_count("live/b").await, 0);
    }

    #[tokio::test]
    async fn test_catch_up_runs_before_join() {
        let registry = StreamRegistry::new();
        registry.start_publishing(publisher("live/a", 1)).await.unwrap();

        let mut seen = None;
        registry
            .start_subscribing(subscription("live/a", 2), |publish, sub| {
                seen = Some((publish.path().to_string(), sub.client_id()));
            })
            .await
            .unwrap();
        assert_eq!(seen, Some(("live/a".to_string(), 2)));
        assert_eq!(registry.subscriber_count("live/a").await, 1);
    }

    #[tokio::test]
    async fn test_stop_subscribing() {
        let registry = StreamRegistry::new();
        registry.start_publishing(publisher("live/a", 1)).await.unwrap();
        registry
            .start_subscribing(subscription("live/a", 2), |_, _| {})
            .await
            .unwrap();
        registry
            .start_subscribing(subscription("live/a", 3), |_, _| {})
            .await
            .unwrap();

        assert!(registry.stop_subscribing(2).await);
        assert!(!registry.stop_subscribing(2).await);
        assert!(!registry.stop_subscribing(42).await);

        let remaining = registry.get_subscribers("live/a").await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].client_id(), 3);
    }

    #[tokio::test]
    async fn test_locked_snapshot_blocks_joins() {
        let registry = Arc::new(StreamRegistry::new());
        registry.start_publishing(publisher("live/a", 1)).await.unwrap();

        let locked = registry.get_subscribers_locked("live/a").await.unwrap();
        assert!(locked.subscribers().is_empty());

        let join = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .start_subscribing(subscription("live/a", 2), |_, _| {})
                    .await
            })
        };

        // The join cannot complete while the path is locked
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!join.is_finished());
        assert!(locked.subscribers().is_empty());

        let snapshot = locked.into_snapshot();
        assert!(snapshot.is_empty());

        join.await.unwrap().unwrap();
        assert_eq!(registry.get_subscribers("live/a").await.len(), 1);
        // Earlier snapshot is unaffected
        assert!(snapshot.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_path() {
        let registry = StreamRegistry::new();
        assert!(registry.get_subscribers("live/x").await.is_empty());
        assert!(registry.get_subscribers_locked("live/x").await.is_none());
        assert!(registry.stream_paths().await.is_empty());
    }
}
