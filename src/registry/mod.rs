//! Stream registry for pub/sub bookkeeping
//!
//! The registry maps each published path to its publish context and the
//! subscriptions attached to it. Every path has its own mutex; broadcasters
//! take either a point-in-time copy of the subscriber list or hold the lock
//! while they update caches and fan out.
//!
//! # Architecture
//!
//! ```text
//!                     Arc<StreamRegistry>
//!              ┌──────────────────────────────┐
//!              │ streams: RwLock<HashMap<     │
//!              │   path, Arc<Mutex<           │
//!              │     StreamEntry {            │
//!              │       publish context,       │
//!              │       subscribers,           │
//!              │     }>>>>                    │
//!              └──────────────┬───────────────┘
//!                             │
//!     ┌───────────────────────┼───────────────────────┐
//!     ▼                       ▼                       ▼
//! [Publisher]           [Subscriber]            [Subscriber]
//! lock path, update     delivery queue          delivery queue
//! cache, enqueue ──────────► │ ─────────────────────► │
//! ```
//!
//! # Zero-Copy Design
//!
//! Payloads are `bytes::Bytes`, so the cache and every subscriber queue share
//! one allocation per message.

pub mod entry;
pub mod error;
pub mod store;

pub use entry::{LockedSubscribers, StreamEntry};
pub use error::RegistryError;
pub use store::StreamRegistry;
