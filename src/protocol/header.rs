//! Chunk header codec
//!
//! Every chunk starts with a basic header followed by one of four message
//! header layouts:
//!
//! ```text
//! Basic Header:
//! - 1 byte:  fmt(2) + csid(6)            for csid 2-63
//! - 2 bytes: fmt(2) + 0 + (csid - 64)    for csid 64-319
//! - 3 bytes: fmt(2) + 1 + (csid - 64)LE  for csid 64-65599
//!
//! Message Header (by fmt):
//! - Type 0 (11 bytes): timestamp(3) + length(3) + type(1) + stream_id(4, LE)
//! - Type 1 (7 bytes):  timestamp_delta(3) + length(3) + type(1)
//! - Type 2 (3 bytes):  timestamp_delta(3)
//! - Type 3 (0 bytes):  everything inherited
//!
//! A 4-byte extended timestamp follows when the 24-bit field is 0xFFFFFF,
//! and on type 3 chunks whose predecessor carried one.
//! ```
//!
//! The functions here are stateless. Inheritance is resolved by
//! [`ChunkStreamState`], which the assembler and writer keep per chunk stream.

use bytes::{BufMut, BytesMut};

use crate::error::{ProtocolError, Result};
use crate::protocol::constants::{
    EXTENDED_TIMESTAMP_THRESHOLD, MAX_CHUNK_STREAM_ID, MIN_CHUNK_STREAM_ID,
};

/// Basic header: format and chunk stream id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BasicHeader {
    pub fmt: u8,
    pub csid: u32,
}

/// Message header variants.
///
/// Timestamp and delta fields hold the raw 24-bit value as it appears on the
/// wire, so `0xFFFFFF` means the real value is in the extended field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageHeader {
    Type0 {
        timestamp: u32,
        length: u32,
        type_id: u8,
        stream_id: u32,
    },
    Type1 {
        delta: u32,
        length: u32,
        type_id: u8,
    },
    Type2 {
        delta: u32,
    },
    Type3,
}

impl MessageHeader {
    /// Format number (0-3)
    pub fn fmt(&self) -> u8 {
        match self {
            MessageHeader::Type0 { .. } => 0,
            MessageHeader::Type1 { .. } => 1,
            MessageHeader::Type2 { .. } => 2,
            MessageHeader::Type3 => 3,
        }
    }

    /// Size of the message header on the wire, excluding any extended timestamp
    pub fn encoded_len(fmt: u8) -> usize {
        match fmt {
            0 => 11,
            1 => 7,
            2 => 3,
            _ => 0,
        }
    }

    fn timestamp_field(&self) -> Option<u32> {
        match *self {
            MessageHeader::Type0 { timestamp, .. } => Some(timestamp),
            MessageHeader::Type1 { delta, .. } | MessageHeader::Type2 { delta } => Some(delta),
            MessageHeader::Type3 => None,
        }
    }
}

/// A fully decoded chunk header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub csid: u32,
    pub message: MessageHeader,
    /// Extended timestamp field, when one follows the message header
    pub extended_timestamp: Option<u32>,
}

impl ChunkHeader {
    /// Type 0 header for an absolute timestamp
    pub fn type0(csid: u32, timestamp: u32, length: u32, type_id: u8, stream_id: u32) -> Self {
        let (field, extended_timestamp) = split_timestamp(timestamp);
        Self {
            csid,
            message: MessageHeader::Type0 {
                timestamp: field,
                length,
                type_id,
                stream_id,
            },
            extended_timestamp,
        }
    }

    /// Type 1 header for a timestamp delta
    pub fn type1(csid: u32, delta: u32, length: u32, type_id: u8) -> Self {
        let (field, extended_timestamp) = split_timestamp(delta);
        Self {
            csid,
            message: MessageHeader::Type1 {
                delta: field,
                length,
                type_id,
            },
            extended_timestamp,
        }
    }

    /// Type 2 header for a timestamp delta
    pub fn type2(csid: u32, delta: u32) -> Self {
        let (field, extended_timestamp) = split_timestamp(delta);
        Self {
            csid,
            message: MessageHeader::Type2 { delta: field },
            extended_timestamp,
        }
    }

    /// Type 3 header; `extended_timestamp` must repeat the previous chunk's
    /// extended field when it had one
    pub fn type3(csid: u32, extended_timestamp: Option<u32>) -> Self {
        Self {
            csid,
            message: MessageHeader::Type3,
            extended_timestamp,
        }
    }

    /// Timestamp (type 0) or delta (types 1/2) carried by this header
    pub fn timestamp_value(&self) -> Option<u32> {
        let field = self.message.timestamp_field()?;
        Some(match self.extended_timestamp {
            Some(ext) if field >= EXTENDED_TIMESTAMP_THRESHOLD => ext,
            _ => field,
        })
    }
}

fn split_timestamp(value: u32) -> (u32, Option<u32>) {
    if value >= EXTENDED_TIMESTAMP_THRESHOLD {
        (EXTENDED_TIMESTAMP_THRESHOLD, Some(value))
    } else {
        (value, None)
    }
}

/// Decoder/encoder state of one chunk stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkStreamState {
    /// Absolute timestamp of the current message
    pub timestamp: u32,
    /// Last timestamp delta (0 after a type 0 header)
    pub timestamp_delta: u32,
    pub message_length: u32,
    pub type_id: u8,
    pub stream_id: u32,
    /// Whether the previous chunk carried an extended timestamp
    pub extended: bool,
}

impl ChunkStreamState {
    /// State established by a type 0 header
    pub fn from_type0(header: &ChunkHeader) -> Option<Self> {
        match header.message {
            MessageHeader::Type0 {
                length,
                type_id,
                stream_id,
                ..
            } => Some(Self {
                timestamp: header.timestamp_value().unwrap_or_default(),
                timestamp_delta: 0,
                message_length: length,
                type_id,
                stream_id,
                extended: header.extended_timestamp.is_some(),
            }),
            _ => None,
        }
    }

    /// Fold a decoded header into this state.
    ///
    /// `starts_message` is false for type 3 chunks continuing a partially
    /// received message; those leave the timestamp untouched.
    pub fn apply(&mut self, header: &ChunkHeader, starts_message: bool) {
        match header.message {
            MessageHeader::Type0 {
                length,
                type_id,
                stream_id,
                ..
            } => {
                self.timestamp = header.timestamp_value().unwrap_or_default();
                self.timestamp_delta = 0;
                self.message_length = length;
                self.type_id = type_id;
                self.stream_id = stream_id;
            }
            MessageHeader::Type1 { length, type_id, .. } => {
                self.timestamp_delta = header.timestamp_value().unwrap_or_default();
                self.timestamp = self.timestamp.wrapping_add(self.timestamp_delta);
                self.message_length = length;
                self.type_id = type_id;
            }
            MessageHeader::Type2 { .. } => {
                self.timestamp_delta = header.timestamp_value().unwrap_or_default();
                self.timestamp = self.timestamp.wrapping_add(self.timestamp_delta);
            }
            MessageHeader::Type3 => {
                if starts_message {
                    self.timestamp = self.timestamp.wrapping_add(self.timestamp_delta);
                }
            }
        }
        self.extended = header.extended_timestamp.is_some();
    }
}

/// Decode a basic header.
///
/// Returns the header and its encoded length, or `None` if more bytes are needed.
pub fn decode_basic_header(buf: &[u8]) -> Option<(BasicHeader, usize)> {
    let first = *buf.first()?;
    let fmt = (first >> 6) & 0x03;

    match first & 0x3F {
        0 => {
            let second = *buf.get(1)?;
            Some((
                BasicHeader {
                    fmt,
                    csid: 64 + second as u32,
                },
                2,
            ))
        }
        1 => {
            if buf.len() < 3 {
                return None;
            }
            let csid = 64 + u16::from_le_bytes([buf[1], buf[2]]) as u32;
            Some((BasicHeader { fmt, csid }, 3))
        }
        low => Some((
            BasicHeader {
                fmt,
                csid: low as u32,
            },
            1,
        )),
    }
}

/// Encode a basic header in its shortest form
pub fn encode_basic_header(header: BasicHeader, buf: &mut BytesMut) -> Result<()> {
    let BasicHeader { fmt, csid } = header;
    if !(MIN_CHUNK_STREAM_ID..=MAX_CHUNK_STREAM_ID).contains(&csid) {
        return Err(ProtocolError::InvalidChunkStreamId(csid).into());
    }

    let fmt_bits = (fmt & 0x03) << 6;
    if csid < 64 {
        buf.put_u8(fmt_bits | csid as u8);
    } else if csid < 320 {
        buf.put_u8(fmt_bits);
        buf.put_u8((csid - 64) as u8);
    } else {
        buf.put_u8(fmt_bits | 1);
        buf.put_u16_le((csid - 64) as u16);
    }
    Ok(())
}

/// Decode a complete chunk header (basic header, message header and any
/// extended timestamp).
///
/// `lookup` is called with the csid once it is known and returns the state
/// of that chunk stream, if any. Types 1-3 without prior state are a
/// protocol violation.
///
/// Returns the header and the number of bytes it occupies, or `None` if the
/// buffer does not yet hold the whole header.
pub fn decode_chunk_header<F>(buf: &[u8], lookup: F) -> Result<Option<(ChunkHeader, usize)>>
where
    F: FnOnce(u32) -> Option<ChunkStreamState>,
{
    let (basic, basic_len) = match decode_basic_header(buf) {
        Some(v) => v,
        None => return Ok(None),
    };
    let csid = basic.csid;

    let previous = lookup(csid);
    if basic.fmt != 0 && previous.is_none() {
        return Err(ProtocolError::MissingChunkStreamState { csid }.into());
    }

    let header_len = MessageHeader::encoded_len(basic.fmt);
    if buf.len() < basic_len + header_len {
        return Ok(None);
    }
    let h = &buf[basic_len..basic_len + header_len];

    let message = match basic.fmt {
        0 => MessageHeader::Type0 {
            timestamp: read_u24(&h[0..3]),
            length: read_u24(&h[3..6]),
            type_id: h[6],
            stream_id: u32::from_le_bytes([h[7], h[8], h[9], h[10]]),
        },
        1 => MessageHeader::Type1 {
            delta: read_u24(&h[0..3]),
            length: read_u24(&h[3..6]),
            type_id: h[6],
        },
        2 => MessageHeader::Type2 {
            delta: read_u24(&h[0..3]),
        },
        _ => MessageHeader::Type3,
    };

    let has_extended = match message.timestamp_field() {
        Some(field) => field >= EXTENDED_TIMESTAMP_THRESHOLD,
        None => previous.map(|s| s.extended).unwrap_or(false),
    };

    let mut consumed = basic_len + header_len;
    let extended_timestamp = if has_extended {
        if buf.len() < consumed + 4 {
            return Ok(None);
        }
        let ext = &buf[consumed..consumed + 4];
        consumed += 4;
        Some(u32::from_be_bytes([ext[0], ext[1], ext[2], ext[3]]))
    } else {
        None
    };

    Ok(Some((
        ChunkHeader {
            csid,
            message,
            extended_timestamp,
        },
        consumed,
    )))
}

/// Encode a complete chunk header
pub fn encode_chunk_header(header: &ChunkHeader, buf: &mut BytesMut) -> Result<()> {
    encode_basic_header(
        BasicHeader {
            fmt: header.message.fmt(),
            csid: header.csid,
        },
        buf,
    )?;

    match header.message {
        MessageHeader::Type0 {
            timestamp,
            length,
            type_id,
            stream_id,
        } => {
            write_u24(timestamp, buf);
            write_u24(length, buf);
            buf.put_u8(type_id);
            buf.put_u32_le(stream_id);
        }
        MessageHeader::Type1 {
            delta,
            length,
            type_id,
        } => {
            write_u24(delta, buf);
            write_u24(length, buf);
            buf.put_u8(type_id);
        }
        MessageHeader::Type2 { delta } => write_u24(delta, buf),
        MessageHeader::Type3 => {}
    }

    if let Some(ext) = header.extended_timestamp {
        buf.put_u32(ext);
    }
    Ok(())
}

fn read_u24(b: &[u8]) -> u32 {
    ((b[0] as u32) << 16) | ((b[1] as u32) << 8) | b[2] as u32
}

/// Write 24-bit big-endian value
fn write_u24(value: u32, buf: &mut BytesMut) {
    buf.put_u8(((value >> 16) & 0xFF) as u8);
    buf.put_u8(((value >> 8) & 0xFF) as u8);
    buf.put_u8((value & 0xFF) as u8);
}
