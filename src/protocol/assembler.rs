//! Message reassembly
//!
//! RTMP messages arrive split into chunks, and chunks of different chunk
//! streams may interleave. The assembler keeps per-chunk-stream header state
//! and a partial payload buffer, and yields each message once its last chunk
//! has been read.

use bytes::{Buf, BufMut, BytesMut};
use std::collections::HashMap;

use crate::error::{Error, ProtocolError, Result};
use crate::protocol::constants::*;
use crate::protocol::header::{decode_chunk_header, ChunkStreamState, MessageHeader};
use crate::protocol::message::RtmpMessage;

#[derive(Debug, Default)]
struct InboundChunkStream {
    state: ChunkStreamState,
    /// Payload received so far for the in-progress message
    partial: BytesMut,
    /// Bytes still missing from the in-progress message; 0 when idle
    remaining: u32,
}

/// Per-connection message assembler (read side of the chunk stream)
#[derive(Debug)]
pub struct MessageAssembler {
    /// Maximum incoming chunk size
    chunk_size: u32,
    /// Maximum message size (sanity limit)
    max_message_size: u32,
    streams: HashMap<u32, InboundChunkStream>,
}

impl MessageAssembler {
    /// Create an assembler with the default chunk size
    pub fn new() -> Self {
        Self::with_max_message_size(MAX_MESSAGE_SIZE)
    }

    pub fn with_max_message_size(max_message_size: u32) -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_message_size,
            streams: HashMap::new(),
        }
    }

    /// Set the chunk size (called when receiving SetChunkSize)
    pub fn set_chunk_size(&mut self, size: u32) -> Result<()> {
        if size == 0 {
            return Err(ProtocolError::InvalidChunkSize(size).into());
        }
        self.chunk_size = size.min(MAX_CHUNK_SIZE);
        Ok(())
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Discard the partially received message on a chunk stream (Abort)
    pub fn abort(&mut self, csid: u32) {
        if let Some(stream) = self.streams.get_mut(&csid) {
            stream.partial.clear();
            stream.remaining = 0;
        }
    }

    /// Number of chunk streams with a partially received message
    pub fn pending_messages(&self) -> usize {
        self.streams.values().filter(|s| s.remaining > 0).count()
    }

    /// Consume chunks from `buf` until a message completes or more data is
    /// needed.
    ///
    /// Returns `Ok(Some(message))` for each completed message and `Ok(None)`
    /// once the buffer holds no complete chunk. Bytes of an incomplete chunk
    /// are left in `buf`. Errors are fatal to the connection.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<RtmpMessage>> {
        loop {
            match self.decode_chunk(buf)? {
                ChunkOutcome::NeedMore => return Ok(None),
                ChunkOutcome::Partial => continue,
                ChunkOutcome::Complete(message) => return Ok(Some(message)),
            }
        }
    }

    fn decode_chunk(&mut self, buf: &mut BytesMut) -> Result<ChunkOutcome> {
        let streams = &self.streams;
        let (header, header_len) =
            match decode_chunk_header(buf, |csid| streams.get(&csid).map(|s| s.state))? {
                Some(v) => v,
                None => return Ok(ChunkOutcome::NeedMore),
            };
        let csid = header.csid;

        // Work out the state this chunk produces without committing it, so a
        // chunk whose payload has not fully arrived can be re-read later.
        let existing = self.streams.get(&csid);
        let in_progress = existing.map(|s| s.remaining > 0).unwrap_or(false);
        let mut state = match existing {
            Some(s) => s.state,
            None => ChunkStreamState::from_type0(&header)
                .ok_or(ProtocolError::MissingChunkStreamState { csid })?,
        };
        let starts_message = !in_progress;

        // Only type 3 chunks may continue a message
        if in_progress {
            let expected = existing.map(|s| s.state.message_length).unwrap_or_default();
            match header.message {
                MessageHeader::Type3 => {}
                MessageHeader::Type0 { length, .. } | MessageHeader::Type1 { length, .. }
                    if length != expected =>
                {
                    return Err(ProtocolError::MessageLengthMismatch {
                        csid,
                        expected,
                        declared: length,
                    }
                    .into());
                }
                _ => {
                    return Err(ProtocolError::InterruptedMessage {
                        csid,
                        fmt: header.message.fmt(),
                    }
                    .into());
                }
            }
        }
        state.apply(&header, starts_message);

        let message_length = state.message_length;
        if message_length > self.max_message_size {
            return Err(Error::ResourceExhausted {
                what: "message",
                size: message_length as usize,
                limit: self.max_message_size as usize,
            });
        }

        let remaining = if starts_message {
            message_length
        } else {
            existing.map(|s| s.remaining).unwrap_or_default()
        };
        let data_len = remaining.min(self.chunk_size) as usize;

        if buf.len() < header_len + data_len {
            return Ok(ChunkOutcome::NeedMore);
        }

        buf.advance(header_len);
        let stream = self.streams.entry(csid).or_default();
        stream.state = state;
        if starts_message {
            stream.partial = BytesMut::with_capacity(message_length as usize);
        }
        stream.partial.put_slice(&buf[..data_len]);
        buf.advance(data_len);
        stream.remaining = remaining - data_len as u32;

        tracing::trace!(
            csid = csid,
            fmt = header.message.fmt(),
            chunk_len = data_len,
            remaining = stream.remaining,
            "Chunk read"
        );

        if stream.remaining > 0 {
            return Ok(ChunkOutcome::Partial);
        }

        let payload = stream.partial.split().freeze();
        Ok(ChunkOutcome::Complete(RtmpMessage {
            csid,
            timestamp: stream.state.timestamp,
            type_id: stream.state.type_id,
            stream_id: stream.state.stream_id,
            payload,
        }))
    }
}

impl Default for MessageAssembler {
    fn default() -> Self {
        Self::new()
    }
}

enum ChunkOutcome {
    NeedMore,
    Partial,
    Complete(RtmpMessage),
}
