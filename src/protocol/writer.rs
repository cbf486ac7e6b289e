//! Message fragmentation (write side of the chunk stream)

use bytes::{BufMut, BytesMut};
use std::collections::HashMap;

use crate::error::{ProtocolError, Result};
use crate::protocol::constants::*;
use crate::protocol::header::{encode_chunk_header, ChunkHeader, ChunkStreamState};
use crate::protocol::message::RtmpMessage;

/// Splits outbound messages into chunks.
///
/// Each message is written as one type 0 chunk followed by type 3 chunks on
/// the same chunk stream, so every chunk boundary falls on a multiple of the
/// outbound chunk size.
#[derive(Debug)]
pub struct MessageWriter {
    /// Outgoing chunk size
    chunk_size: u32,
    /// Last header written on each chunk stream
    streams: HashMap<u32, ChunkStreamState>,
}

impl MessageWriter {
    /// Create a writer with the default chunk size
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            streams: HashMap::new(),
        }
    }

    /// Set the chunk size; must match the Set Chunk Size sent to the peer
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

    /// Last state written on a chunk stream
    pub fn stream_state(&self, csid: u32) -> Option<&ChunkStreamState> {
        self.streams.get(&csid)
    }

    /// Encode a message into chunks, appending them to `buf`
    pub fn encode(&mut self, message: &RtmpMessage, buf: &mut BytesMut) -> Result<()> {
        let csid = message.csid;
        let payload = &message.payload;
        let chunk_size = self.chunk_size as usize;

        let first = ChunkHeader::type0(
            csid,
            message.timestamp,
            payload.len() as u32,
            message.type_id,
            message.stream_id,
        );

        let chunk_count = payload.len().div_ceil(chunk_size).max(1);
        buf.reserve(payload.len() + 16 + (chunk_count - 1) * 7);

        encode_chunk_header(&first, buf)?;
        let first_len = payload.len().min(chunk_size);
        buf.put_slice(&payload[..first_len]);

        let continuation = ChunkHeader::type3(csid, first.extended_timestamp);
        let mut offset = first_len;
        while offset < payload.len() {
            let len = (payload.len() - offset).min(chunk_size);
            encode_chunk_header(&continuation, buf)?;
            buf.put_slice(&payload[offset..offset + len]);
            offset += len;
        }

        let state = ChunkStreamState::from_type0(&first).unwrap_or_default();
        self.streams.insert(csid, state);
        Ok(())
    }
}

impl Default for MessageWriter {
    fn default() -> Self {
        Self::new()
    }
}
