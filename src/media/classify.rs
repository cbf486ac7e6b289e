//! Media frame classification
//!
//! The broadcaster only needs to know whether a frame is a sequence header,
//! a keyframe or anything else. Codec knowledge stays behind
//! [`MediaClassifier`] so other containers can be plugged in.

use std::fmt;

use super::flv;

/// Kind of media carried by a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaType {
    Audio,
    Video,
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaType::Audio => write!(f, "audio"),
            MediaType::Video => write!(f, "video"),
        }
    }
}

/// What a frame means for caching and delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameClass {
    /// Decoder configuration; cached and never dropped
    SequenceHeader,
    /// Starts a new group of pictures
    Keyframe,
    Frame,
}

/// Classifies media payloads
pub trait MediaClassifier: Send + Sync {
    fn classify(&self, media_type: MediaType, payload: &[u8]) -> FrameClass;
}

/// Classifier for FLV tag bodies (legacy AVC/HEVC/AAC and Enhanced RTMP)
#[derive(Debug, Clone, Copy, Default)]
pub struct FlvClassifier;

impl MediaClassifier for FlvClassifier {
    fn classify(&self, media_type: MediaType, payload: &[u8]) -> FrameClass {
        match media_type {
            MediaType::Video => {
                if flv::is_video_sequence_header(payload) {
                    FrameClass::SequenceHeader
                } else if flv::is_keyframe(payload) {
                    FrameClass::Keyframe
                } else {
                    FrameClass::Frame
                }
            }
            MediaType::Audio => {
                if flv::is_audio_sequence_header(payload) {
                    FrameClass::SequenceHeader
                } else {
                    FrameClass::Frame
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flv_classifier() {
        let c = FlvClassifier;
        assert_eq!(
            c.classify(MediaType::Video, &[0x17, 0x00, 0, 0, 0]),
            FrameClass::SequenceHeader
        );
        assert_eq!(c.classify(MediaType::Video, &[0x17, 0x01]), FrameClass::Keyframe);
        assert_eq!(c.classify(MediaType::Video, &[0x27, 0x01]), FrameClass::Frame);
        assert_eq!(c.classify(MediaType::Video, &[0x91, b'a', b'v', b'0', b'1']), FrameClass::Keyframe);
        assert_eq!(c.classify(MediaType::Video, &[]), FrameClass::Frame);

        assert_eq!(c.classify(MediaType::Audio, &[0xAF, 0x00, 0x12]), FrameClass::SequenceHeader);
        assert_eq!(c.classify(MediaType::Audio, &[0xAF, 0x01, 0xFF]), FrameClass::Frame);
        // Audio frames are never keyframes
        assert_eq!(c.classify(MediaType::Audio, &[0x17, 0x01]), FrameClass::Frame);
    }
}
