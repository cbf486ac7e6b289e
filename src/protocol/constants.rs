//! RTMP protocol constants
//!
//! Reference: Adobe RTMP Specification (December 2012)

/// RTMP version number (always 3 for plain RTMP)
pub const RTMP_VERSION: u8 = 3;

/// Default RTMP port
pub const RTMP_PORT: u16 = 1935;

/// Handshake packet size (C1/C2/S1/S2)
pub const HANDSHAKE_SIZE: usize = 1536;

/// Chunk size in effect until a Set Chunk Size message is received
pub const DEFAULT_CHUNK_SIZE: u32 = 128;

/// Outbound chunk size the server announces after the handshake
pub const RECOMMENDED_CHUNK_SIZE: u32 = 4096;

/// Largest chunk size a peer may request (31 bits)
pub const MAX_CHUNK_SIZE: u32 = 0x7FFF_FFFF;

/// Default upper bound on a single reassembled message
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Timestamps >= this value are carried in the extended timestamp field
pub const EXTENDED_TIMESTAMP_THRESHOLD: u32 = 0xFFFFFF;

/// Smallest chunk stream id usable for messages
pub const MIN_CHUNK_STREAM_ID: u32 = 2;

/// Largest chunk stream id the basic header can express
pub const MAX_CHUNK_STREAM_ID: u32 = 65599;

// Chunk stream ids used for outbound traffic

/// Protocol control messages (Set Chunk Size, Abort, etc.)
pub const CSID_PROTOCOL_CONTROL: u32 = 2;

/// Command messages
pub const CSID_COMMAND: u32 = 3;

/// Audio data
pub const CSID_AUDIO: u32 = 4;

/// Data messages (metadata)
pub const CSID_DATA: u32 = 5;

/// Video data
pub const CSID_VIDEO: u32 = 6;

// Message type ids

pub const MSG_SET_CHUNK_SIZE: u8 = 1;
pub const MSG_ABORT: u8 = 2;
pub const MSG_ACKNOWLEDGEMENT: u8 = 3;
pub const MSG_USER_CONTROL: u8 = 4;
pub const MSG_WINDOW_ACK_SIZE: u8 = 5;
pub const MSG_SET_PEER_BANDWIDTH: u8 = 6;
pub const MSG_AUDIO: u8 = 8;
pub const MSG_VIDEO: u8 = 9;
/// AMF3 data message (@setDataFrame, onMetaData)
pub const MSG_DATA_AMF3: u8 = 15;
/// AMF3 command message
pub const MSG_COMMAND_AMF3: u8 = 17;
/// AMF0 data message (@setDataFrame, onMetaData)
pub const MSG_DATA_AMF0: u8 = 18;
/// AMF0 command message (connect, play, publish, etc.)
pub const MSG_COMMAND_AMF0: u8 = 20;

// User control event types

/// Stream Begin - server sends when a stream becomes functional
pub const UC_STREAM_BEGIN: u16 = 0;

/// Stream EOF - server sends when playback ends
pub const UC_STREAM_EOF: u16 = 1;

/// Set Buffer Length - client tells server its buffer size
pub const UC_SET_BUFFER_LENGTH: u16 = 3;

/// Ping Request - server pings client
pub const UC_PING_REQUEST: u16 = 6;

/// Ping Response - client responds to ping
pub const UC_PING_RESPONSE: u16 = 7;

// Peer bandwidth limit types

pub const BANDWIDTH_LIMIT_HARD: u8 = 0;
pub const BANDWIDTH_LIMIT_SOFT: u8 = 1;
pub const BANDWIDTH_LIMIT_DYNAMIC: u8 = 2;

/// Default window acknowledgement size
pub const DEFAULT_WINDOW_ACK_SIZE: u32 = 2_500_000;

/// Default peer bandwidth
pub const DEFAULT_PEER_BANDWIDTH: u32 = 2_500_000;
