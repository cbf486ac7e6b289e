//! Stream entry and lock guard types
//!
//! Each published path owns one entry behind its own mutex. Holding that
//! mutex is what serializes joins and leaves against cache-bearing
//! broadcasts of the same path.

use std::sync::Arc;

use tokio::sync::OwnedMutexGuard;

use crate::session::{PublishStreamContext, StreamSubscription};

/// Entry for a single published path
#[derive(Debug)]
pub struct StreamEntry {
    pub(super) publish: PublishStreamContext,
    pub(super) subscribers: Vec<Arc<StreamSubscription>>,
    /// Set when the publisher stops; late lockers must treat the entry as gone
    pub(super) closed: bool,
}

impl StreamEntry {
    pub(super) fn new(publish: PublishStreamContext) -> Self {
        Self {
            publish,
            subscribers: Vec::new(),
            closed: false,
        }
    }
}

/// Subscriber list of one path with the path lock held.
///
/// Joins, leaves and unpublish of the path wait until this guard is dropped
/// or converted with [`into_snapshot`](Self::into_snapshot).
pub struct LockedSubscribers {
    guard: OwnedMutexGuard<StreamEntry>,
}

impl LockedSubscribers {
    pub(super) fn new(guard: OwnedMutexGuard<StreamEntry>) -> Self {
        Self { guard }
    }

    pub fn subscribers(&self) -> &[Arc<StreamSubscription>] {
        &self.guard.subscribers
    }

    pub fn publish_context(&self) -> &PublishStreamContext {
        &self.guard.publish
    }

    /// Mutable access for cache updates made under the lock
    pub fn publish_context_mut(&mut self) -> &mut PublishStreamContext {
        &mut self.guard.publish
    }

    /// Copy the subscriber list and release the lock
    pub fn into_snapshot(self) -> Vec<Arc<StreamSubscription>> {
        self.guard.subscribers.clone()
    }
}

impl std::fmt::Debug for LockedSubscribers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockedSubscribers")
            .field("path", &self.guard.publish.path())
            .field("subscribers", &self.guard.subscribers.len())
            .finish()
    }
}
