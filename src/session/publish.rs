//! Publish stream context
//!
//! One context exists per published path. Besides identifying the publisher
//! it holds everything a late joiner needs: metadata, sequence headers and
//! the GOP cache.

use std::collections::HashMap;
use std::time::Instant;

use bytes::Bytes;

use super::client::ClientId;
use crate::media::{FrameClass, GopCache, MediaType, PictureCache};

/// Default GOP cache limit (4MB)
pub const DEFAULT_GOP_CACHE_MAX_SIZE: usize = 4 * 1024 * 1024;

/// Whether the GOP cache is currently collecting frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GopState {
    /// Waiting for a keyframe
    Unactivated,
    /// Collecting every frame since the last keyframe
    Activated,
}

/// State of a stream being published
#[derive(Debug)]
pub struct PublishStreamContext {
    path: String,
    publisher_id: ClientId,
    /// Publisher-side message stream id
    stream_id: u32,
    args: HashMap<String, String>,
    metadata: Option<Bytes>,
    video_sequence_header: Option<Bytes>,
    audio_sequence_header: Option<Bytes>,
    gop_cache_enabled: bool,
    gop_cache_max_size: usize,
    gop_state: GopState,
    gop: GopCache,
    started_at: Instant,
}

impl PublishStreamContext {
    pub fn new(
        path: impl Into<String>,
        publisher_id: ClientId,
        stream_id: u32,
        args: HashMap<String, String>,
    ) -> Self {
        Self {
            path: path.into(),
            publisher_id,
            stream_id,
            args,
            metadata: None,
            video_sequence_header: None,
            audio_sequence_header: None,
            gop_cache_enabled: true,
            gop_cache_max_size: DEFAULT_GOP_CACHE_MAX_SIZE,
            gop_state: GopState::Unactivated,
            gop: GopCache::new(),
            started_at: Instant::now(),
        }
    }

    /// Configure GOP caching
    pub fn with_gop_cache(mut self, enabled: bool, max_size: usize) -> Self {
        self.gop_cache_enabled = enabled;
        self.gop_cache_max_size = max_size;
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn publisher_id(&self) -> ClientId {
        self.publisher_id
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub fn args(&self) -> &HashMap<String, String> {
        &self.args
    }

    pub fn metadata(&self) -> Option<&Bytes> {
        self.metadata.as_ref()
    }

    pub fn set_metadata(&mut self, metadata: Bytes) {
        self.metadata = Some(metadata);
    }

    pub fn video_sequence_header(&self) -> Option<&Bytes> {
        self.video_sequence_header.as_ref()
    }

    pub fn audio_sequence_header(&self) -> Option<&Bytes> {
        self.audio_sequence_header.as_ref()
    }

    pub fn gop_cache_enabled(&self) -> bool {
        self.gop_cache_enabled
    }

    pub fn gop_state(&self) -> GopState {
        self.gop_state
    }

    pub fn gop(&self) -> &GopCache {
        &self.gop
    }

    /// Time since publishing started
    pub fn uptime(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }

    /// Replace the cached sequence header for a media type
    pub fn cache_sequence_header(&mut self, media_type: MediaType, payload: Bytes) {
        match media_type {
            MediaType::Video => self.video_sequence_header = Some(payload),
            MediaType::Audio => self.audio_sequence_header = Some(payload),
        }
    }

    /// Feed a classified frame to the GOP cache.
    ///
    /// A video keyframe clears the cache and activates it; while activated
    /// every frame is appended. If appending would exceed the size limit the
    /// cache is cleared and stays inactive until the next keyframe.
    pub fn cache_picture(
        &mut self,
        media_type: MediaType,
        class: FrameClass,
        timestamp: u32,
        payload: &Bytes,
    ) {
        if !self.gop_cache_enabled {
            return;
        }

        if media_type == MediaType::Video && class == FrameClass::Keyframe {
            self.gop.clear();
            self.gop_state = GopState::Activated;
        }

        if self.gop_state != GopState::Activated {
            return;
        }

        if self.gop.size() + payload.len() > self.gop_cache_max_size {
            tracing::warn!(
                stream = %self.path,
                cached = self.gop.size(),
                limit = self.gop_cache_max_size,
                "GOP cache limit exceeded, waiting for next keyframe"
            );
            self.gop.clear();
            self.gop_state = GopState::Unactivated;
            return;
        }

        self.gop
            .add(PictureCache::new(media_type, timestamp, payload.clone()));
    }

    /// Drop every cached buffer
    pub fn clear_caches(&mut self) {
        self.metadata = None;
        self.video_sequence_header = None;
        self.audio_sequence_header = None;
        self.gop.clear();
        self.gop_state = GopState::Unactivated;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> PublishStreamContext {
        PublishStreamContext::new("live/a", 1, 1, HashMap::new())
    }

    fn payload(size: usize) -> Bytes {
        Bytes::from(vec![0u8; size])
    }

    #[test]
    fn test_uptime_advances() {
        let ctx = context();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(ctx.uptime() >= std::time::Duration::from_millis(5));
    }

    #[test]
    fn test_frames_before_keyframe_not_cached() {
        let mut ctx = context();
        ctx.cache_picture(MediaType::Video, FrameClass::Frame, 0, &payload(10));
        ctx.cache_picture(MediaType::Audio, FrameClass::Frame, 5, &payload(10));
        assert!(ctx.gop().is_empty());
        assert_eq!(ctx.gop_state(), GopState::Unactivated);
    }

    #[test]
    fn test_keyframe_clears_and_activates() {
        let mut ctx = context();
        ctx.cache_picture(MediaType::Video, FrameClass::Keyframe, 0, &payload(100));
        ctx.cache_picture(MediaType::Audio, FrameClass::Frame, 10, &payload(10));
        ctx.cache_picture(MediaType::Video, FrameClass::Frame, 33, &payload(50));
        assert_eq!(ctx.gop().len(), 3);
        assert_eq!(ctx.gop_state(), GopState::Activated);

        ctx.cache_picture(MediaType::Video, FrameClass::Keyframe, 66, &payload(100));
        assert_eq!(ctx.gop().len(), 1);
        assert_eq!(ctx.gop().entries()[0].timestamp, 66);
        assert_eq!(ctx.gop().size(), 100);
    }

    #[test]
    fn test_overflow_deactivates_until_keyframe() {
        let mut ctx = context().with_gop_cache(true, 250);
        ctx.cache_picture(MediaType::Video, FrameClass::Keyframe, 0, &payload(100));
        ctx.cache_picture(MediaType::Video, FrameClass::Frame, 33, &payload(100));
        ctx.cache_picture(MediaType::Video, FrameClass::Frame, 66, &payload(100));
        assert!(ctx.gop().is_empty());
        assert_eq!(ctx.gop_state(), GopState::Unactivated);

        ctx.cache_picture(MediaType::Video, FrameClass::Frame, 99, &payload(10));
        assert!(ctx.gop().is_empty());

        ctx.cache_picture(MediaType::Video, FrameClass::Keyframe, 132, &payload(100));
        assert_eq!(ctx.gop().len(), 1);
    }

    #[test]
    fn test_disabled_cache_keeps_headers_only() {
        let mut ctx = context().with_gop_cache(false, DEFAULT_GOP_CACHE_MAX_SIZE);
        ctx.cache_sequence_header(MediaType::Video, Bytes::from_static(&[0x17, 0x00]));
        ctx.cache_picture(MediaType::Video, FrameClass::Keyframe, 0, &payload(100));
        assert!(ctx.gop().is_empty());
        assert!(ctx.video_sequence_header().is_some());
        assert!(ctx.audio_sequence_header().is_none());
    }

    #[test]
    fn test_sequence_header_replaced() {
        let mut ctx = context();
        ctx.cache_sequence_header(MediaType::Audio, Bytes::from_static(&[0xAF, 0x00, 1]));
        ctx.cache_sequence_header(MediaType::Audio, Bytes::from_static(&[0xAF, 0x00, 2]));
        assert_eq!(ctx.audio_sequence_header().unwrap()[2], 2);

        ctx.set_metadata(Bytes::from_static(b"meta"));
        ctx.clear_caches();
        assert!(ctx.audio_sequence_header().is_none());
        assert!(ctx.metadata().is_none());
    }
}
