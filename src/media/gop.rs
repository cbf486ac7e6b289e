//! GOP (Group of Pictures) cache for late-joiner support
//!
//! A newly joining subscriber receives the cached sequence headers and then
//! every frame since the most recent keyframe, so its decoder can start
//! immediately instead of waiting for the next keyframe.
//!
//! The cache itself only stores entries and tracks their size. When to
//! clear it and when to stop appending is decided by the owning publish
//! context.

use bytes::Bytes;

use super::classify::MediaType;

/// One cached media message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PictureCache {
    pub media_type: MediaType,
    pub timestamp: u32,
    pub payload: Bytes,
}

impl PictureCache {
    pub fn new(media_type: MediaType, timestamp: u32, payload: Bytes) -> Self {
        Self {
            media_type,
            timestamp,
            payload,
        }
    }
}

/// Frames received since the last keyframe, in arrival order
#[derive(Debug, Default)]
pub struct GopCache {
    entries: Vec<PictureCache>,
    /// Total payload bytes held
    size: usize,
}

impl GopCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry
    pub fn add(&mut self, entry: PictureCache) {
        self.size += entry.payload.len();
        self.entries.push(entry);
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        self.entries.clear();
        self.size = 0;
    }

    /// Cached entries in arrival order
    pub fn entries(&self) -> &[PictureCache] {
        &self.entries
    }

    /// Total payload bytes held
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Timestamp span covered by the cache
    pub fn duration(&self) -> Option<u32> {
        let first = self.entries.first()?.timestamp;
        let last = self.entries.last()?.timestamp;
        Some(last.wrapping_sub(first))
    }
}
