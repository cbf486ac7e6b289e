//! Media handling
//!
//! This module provides:
//! - FLV tag header inspection (legacy and Enhanced RTMP)
//! - Frame classification for caching decisions
//! - The GOP cache used for late-joiner support

pub mod classify;
pub mod flv;
pub mod gop;

pub use classify::{FlvClassifier, FrameClass, MediaClassifier, MediaType};
pub use gop::{GopCache, PictureCache};
