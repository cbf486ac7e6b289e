//! FLV tag header bits
//!
//! Each RTMP audio/video message body is an FLV tag body. Only the first one
//! or two bytes are inspected here:
//!
//! RTMP Video Data:
//! ```text
//! +----------+----------+-----------------+
//! | FrameType| CodecID  | AVCPacketType   | ...
//! | (4 bits) | (4 bits) | (8 bits, AVC)   |
//! +----------+----------+-----------------+
//!
//! Enhanced RTMP (IsExHeader bit set):
//! +----------+-----------+------------+-----------+
//! |IsExHeader| FrameType | PacketType | FourCC(4) | ...
//! | (1 bit)  | (3 bits)  | (4 bits)   |           |
//! +----------+-----------+------------+-----------+
//! ```
//!
//! RTMP Audio Data:
//! ```text
//! +-----------+---------+---------+---------+----------------+
//! |SoundFormat|SoundRate|SoundSize|SoundType| AACPacketType  | ...
//! | (4 bits)  | (2 bits)| (1 bit) | (1 bit) | (8 bits, AAC)  |
//! +-----------+---------+---------+---------+----------------+
//! ```

/// IsExHeader flag of an Enhanced RTMP video tag
pub const VIDEO_EX_HEADER: u8 = 0x80;

/// Sound format value marking an Enhanced RTMP audio tag
pub const AUDIO_EX_HEADER_FORMAT: u8 = 9;

/// AVC/HEVC/AAC packet type of a sequence header
pub const LEGACY_SEQUENCE_HEADER: u8 = 0;

/// Enhanced RTMP PacketTypeSequenceStart (video and audio)
pub const EX_SEQUENCE_START: u8 = 0;

/// Video frame type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoFrameType {
    /// Keyframe (for AVC, a seekable frame)
    Keyframe = 1,
    /// Inter frame (for AVC, a non-seekable frame)
    InterFrame = 2,
    /// Disposable inter frame (H.263 only)
    DisposableInterFrame = 3,
    /// Generated keyframe (reserved for server use)
    GeneratedKeyframe = 4,
    /// Video info/command frame
    VideoInfoFrame = 5,
}

impl VideoFrameType {
    fn from_value(v: u8) -> Option<Self> {
        match v {
            1 => Some(VideoFrameType::Keyframe),
            2 => Some(VideoFrameType::InterFrame),
            3 => Some(VideoFrameType::DisposableInterFrame),
            4 => Some(VideoFrameType::GeneratedKeyframe),
            5 => Some(VideoFrameType::VideoInfoFrame),
            _ => None,
        }
    }

    /// Frame type of a video tag, legacy or enhanced
    pub fn from_byte(b: u8) -> Option<Self> {
        if b & VIDEO_EX_HEADER != 0 {
            Self::from_value((b >> 4) & 0x07)
        } else {
            Self::from_value((b >> 4) & 0x0F)
        }
    }

    pub fn is_keyframe(&self) -> bool {
        matches!(self, VideoFrameType::Keyframe | VideoFrameType::GeneratedKeyframe)
    }
}

/// Legacy video codec ID (lower 4 bits of first byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    SorensonH263 = 2,
    ScreenVideo = 3,
    Vp6 = 4,
    Vp6Alpha = 5,
    ScreenVideoV2 = 6,
    /// AVC (H.264)
    Avc = 7,
    /// HEVC (H.265), common non-standard extension
    Hevc = 12,
}

impl VideoCodec {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b & 0x0F {
            2 => Some(VideoCodec::SorensonH263),
            3 => Some(VideoCodec::ScreenVideo),
            4 => Some(VideoCodec::Vp6),
            5 => Some(VideoCodec::Vp6Alpha),
            6 => Some(VideoCodec::ScreenVideoV2),
            7 => Some(VideoCodec::Avc),
            12 => Some(VideoCodec::Hevc),
            _ => None,
        }
    }

    /// Codecs whose second byte is a packet type with 0 = sequence header
    pub fn has_sequence_header(&self) -> bool {
        matches!(self, VideoCodec::Avc | VideoCodec::Hevc)
    }
}

/// Audio format (upper 4 bits of first byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    LinearPcmPlatform = 0,
    Adpcm = 1,
    Mp3 = 2,
    LinearPcmLe = 3,
    Nellymoser16kMono = 4,
    Nellymoser8kMono = 5,
    Nellymoser = 6,
    G711ALaw = 7,
    G711MuLaw = 8,
    /// Enhanced RTMP audio (FourCC follows)
    ExHeader = 9,
    Aac = 10,
    Speex = 11,
    Mp38k = 14,
    DeviceSpecific = 15,
}

impl AudioFormat {
    pub fn from_byte(b: u8) -> Option<Self> {
        match (b >> 4) & 0x0F {
            0 => Some(AudioFormat::LinearPcmPlatform),
            1 => Some(AudioFormat::Adpcm),
            2 => Some(AudioFormat::Mp3),
            3 => Some(AudioFormat::LinearPcmLe),
            4 => Some(AudioFormat::Nellymoser16kMono),
            5 => Some(AudioFormat::Nellymoser8kMono),
            6 => Some(AudioFormat::Nellymoser),
            7 => Some(AudioFormat::G711ALaw),
            8 => Some(AudioFormat::G711MuLaw),
            AUDIO_EX_HEADER_FORMAT => Some(AudioFormat::ExHeader),
            10 => Some(AudioFormat::Aac),
            11 => Some(AudioFormat::Speex),
            14 => Some(AudioFormat::Mp38k),
            15 => Some(AudioFormat::DeviceSpecific),
            _ => None,
        }
    }
}

/// Check if video data is a keyframe
pub fn is_keyframe(data: &[u8]) -> bool {
    data.first()
        .and_then(|b| VideoFrameType::from_byte(*b))
        .map(|t| t.is_keyframe())
        .unwrap_or(false)
}

/// Check if video data is a sequence header (legacy AVC/HEVC or enhanced)
pub fn is_video_sequence_header(data: &[u8]) -> bool {
    let Some(&first) = data.first() else {
        return false;
    };
    if first & VIDEO_EX_HEADER != 0 {
        return first & 0x0F == EX_SEQUENCE_START;
    }
    VideoCodec::from_byte(first)
        .map(|c| c.has_sequence_header())
        .unwrap_or(false)
        && data.get(1) == Some(&LEGACY_SEQUENCE_HEADER)
}

/// Check if audio data is a sequence header (AAC or enhanced)
pub fn is_audio_sequence_header(data: &[u8]) -> bool {
    let Some(&first) = data.first() else {
        return false;
    };
    match AudioFormat::from_byte(first) {
        Some(AudioFormat::Aac) => data.get(1) == Some(&LEGACY_SEQUENCE_HEADER),
        Some(AudioFormat::ExHeader) => first & 0x0F == EX_SEQUENCE_START,
        _ => false,
    }
}
