//! Unified error types for rtmp-relay

use std::fmt;
use std::io;

pub use crate::registry::RegistryError;

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for all relay operations
#[derive(Debug)]
pub enum Error {
    /// I/O error during network operations
    Io(io::Error),
    /// RTMP protocol violation (fatal to the connection)
    Protocol(ProtocolError),
    /// Handshake failure
    Handshake(HandshakeError),
    /// Publish/subscribe state conflict
    Registry(RegistryError),
    /// A message or cache exceeded a configured limit
    ResourceExhausted {
        what: &'static str,
        size: usize,
        limit: usize,
    },
    /// Buffer could not be written to the peer
    SendFailed,
    /// Connection rejected by a handler
    Rejected(String),
    /// Operation timed out
    Timeout,
    /// Connection was closed
    ConnectionClosed,
    /// Invalid configuration
    Config(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Protocol(e) => write!(f, "Protocol error: {}", e),
            Error::Handshake(e) => write!(f, "Handshake error: {}", e),
            Error::Registry(e) => write!(f, "Registry error: {}", e),
            Error::ResourceExhausted { what, size, limit } => {
                write!(f, "Resource exhausted: {} of {} bytes (limit {})", what, size, limit)
            }
            Error::SendFailed => write!(f, "Failed to send buffer"),
            Error::Rejected(msg) => write!(f, "Connection rejected: {}", msg),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::ConnectionClosed => write!(f, "Connection closed"),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Registry(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error::Protocol(err)
    }
}

impl From<HandshakeError> for Error {
    fn from(err: HandshakeError) -> Self {
        Error::Handshake(err)
    }
}

impl From<RegistryError> for Error {
    fn from(err: RegistryError) -> Self {
        Error::Registry(err)
    }
}

/// Protocol-level errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Chunk header bytes could not be interpreted
    InvalidChunkHeader,
    /// Type 1/2/3 chunk arrived before any type 0 chunk on this chunk stream
    MissingChunkStreamState { csid: u32 },
    /// Chunk stream id outside the encodable range
    InvalidChunkStreamId(u32),
    /// A continuation chunk declared a different message length mid-message
    MessageLengthMismatch { csid: u32, expected: u32, declared: u32 },
    /// A type 0/1/2 header arrived before the current message was complete
    InterruptedMessage { csid: u32, fmt: u8 },
    /// Peer requested an unusable chunk size
    InvalidChunkSize(u32),
    /// Control message payload too short for its type
    TruncatedMessage { type_id: u8, len: usize },
    /// Message not valid in the connection's current state
    UnexpectedMessage(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::InvalidChunkHeader => write!(f, "Invalid chunk header"),
            ProtocolError::MissingChunkStreamState { csid } => {
                write!(f, "No type 0 header seen on chunk stream {}", csid)
            }
            ProtocolError::InvalidChunkStreamId(id) => write!(f, "Invalid chunk stream ID: {}", id),
            ProtocolError::MessageLengthMismatch {
                csid,
                expected,
                declared,
            } => write!(
                f,
                "Chunk stream {} declared length {} while {} bytes were expected",
                csid, declared, expected
            ),
            ProtocolError::InterruptedMessage { csid, fmt } => write!(
                f,
                "Type {} header on chunk stream {} before its message was complete",
                fmt, csid
            ),
            ProtocolError::InvalidChunkSize(size) => write!(f, "Invalid chunk size: {}", size),
            ProtocolError::TruncatedMessage { type_id, len } => {
                write!(f, "Truncated message of type {} ({} bytes)", type_id, len)
            }
            ProtocolError::UnexpectedMessage(msg) => write!(f, "Unexpected message: {}", msg),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Handshake-specific errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    InvalidVersion(u8),
    InvalidState,
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeError::InvalidVersion(v) => write!(f, "Invalid RTMP version: {}", v),
            HandshakeError::InvalidState => write!(f, "Invalid handshake state"),
        }
    }
}

impl std::error::Error for HandshakeError {}
