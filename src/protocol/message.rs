//! RTMP messages
//!
//! RTMP messages are classified into:
//! - Protocol Control Messages (types 1-6): chunk/flow control, handled here
//! - Command Messages (types 17, 20) and Data Messages (types 15, 18):
//!   forwarded opaque to the command handler
//! - Audio/Video Messages (types 8, 9): media data
//!
//! Reference: RTMP Specification Section 5.4

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ProtocolError, Result};
use crate::protocol::constants::*;

/// A complete RTMP message, reassembled from (or to be split into) chunks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtmpMessage {
    /// Chunk stream ID (for multiplexing)
    pub csid: u32,
    /// Message timestamp (milliseconds)
    pub timestamp: u32,
    /// Message type ID
    pub type_id: u8,
    /// Message stream ID
    pub stream_id: u32,
    /// Message payload
    pub payload: Bytes,
}

impl RtmpMessage {
    pub fn new(csid: u32, timestamp: u32, type_id: u8, stream_id: u32, payload: Bytes) -> Self {
        Self {
            csid,
            timestamp,
            type_id,
            stream_id,
            payload,
        }
    }

    /// Whether this is a protocol control message (types 1-6)
    pub fn is_control(&self) -> bool {
        (MSG_SET_CHUNK_SIZE..=MSG_SET_PEER_BANDWIDTH).contains(&self.type_id)
    }

    /// Whether this is an AMF command message
    pub fn is_command(&self) -> bool {
        matches!(self.type_id, MSG_COMMAND_AMF0 | MSG_COMMAND_AMF3)
    }

    /// Whether this is an AMF data message (e.g. @setDataFrame)
    pub fn is_data(&self) -> bool {
        matches!(self.type_id, MSG_DATA_AMF0 | MSG_DATA_AMF3)
    }
}

/// Protocol control message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Set Chunk Size (type 1)
    SetChunkSize(u32),
    /// Abort Message (type 2)
    Abort { csid: u32 },
    /// Acknowledgement (type 3)
    Acknowledgement { sequence: u32 },
    /// User Control Message (type 4)
    UserControl(UserControlEvent),
    /// Window Acknowledgement Size (type 5)
    WindowAckSize(u32),
    /// Set Peer Bandwidth (type 6)
    SetPeerBandwidth { size: u32, limit_type: u8 },
}

/// User Control Event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserControlEvent {
    StreamBegin(u32),
    StreamEof(u32),
    SetBufferLength { stream_id: u32, buffer_ms: u32 },
    PingRequest(u32),
    PingResponse(u32),
    Unknown { event_type: u16, data: Bytes },
}

impl ControlMessage {
    /// Parse a protocol control message.
    ///
    /// Returns `Ok(None)` when the message is not a control message.
    pub fn parse(message: &RtmpMessage) -> Result<Option<Self>> {
        if !message.is_control() {
            return Ok(None);
        }

        let type_id = message.type_id;
        let mut payload = message.payload.clone();
        let need = |n: usize, payload: &Bytes| -> Result<()> {
            if payload.len() < n {
                Err(ProtocolError::TruncatedMessage {
                    type_id,
                    len: payload.len(),
                }
                .into())
            } else {
                Ok(())
            }
        };

        let parsed = match type_id {
            MSG_SET_CHUNK_SIZE => {
                need(4, &payload)?;
                // MSB is reserved
                ControlMessage::SetChunkSize(payload.get_u32() & 0x7FFF_FFFF)
            }
            MSG_ABORT => {
                need(4, &payload)?;
                ControlMessage::Abort {
                    csid: payload.get_u32(),
                }
            }
            MSG_ACKNOWLEDGEMENT => {
                need(4, &payload)?;
                ControlMessage::Acknowledgement {
                    sequence: payload.get_u32(),
                }
            }
            MSG_USER_CONTROL => {
                need(6, &payload)?;
                let event_type = payload.get_u16();
                let event = match event_type {
                    UC_STREAM_BEGIN => UserControlEvent::StreamBegin(payload.get_u32()),
                    UC_STREAM_EOF => UserControlEvent::StreamEof(payload.get_u32()),
                    UC_SET_BUFFER_LENGTH => {
                        need(8, &payload)?;
                        UserControlEvent::SetBufferLength {
                            stream_id: payload.get_u32(),
                            buffer_ms: payload.get_u32(),
                        }
                    }
                    UC_PING_REQUEST => UserControlEvent::PingRequest(payload.get_u32()),
                    UC_PING_RESPONSE => UserControlEvent::PingResponse(payload.get_u32()),
                    _ => UserControlEvent::Unknown {
                        event_type,
                        data: payload,
                    },
                };
                ControlMessage::UserControl(event)
            }
            MSG_WINDOW_ACK_SIZE => {
                need(4, &payload)?;
                ControlMessage::WindowAckSize(payload.get_u32())
            }
            _ => {
                need(5, &payload)?;
                ControlMessage::SetPeerBandwidth {
                    size: payload.get_u32(),
                    limit_type: payload.get_u8(),
                }
            }
        };

        Ok(Some(parsed))
    }

    /// Encode into a message on the protocol control chunk stream
    pub fn encode(&self) -> RtmpMessage {
        let mut buf = BytesMut::with_capacity(10);
        let type_id = match self {
            ControlMessage::SetChunkSize(size) => {
                buf.put_u32(*size & 0x7FFF_FFFF);
                MSG_SET_CHUNK_SIZE
            }
            ControlMessage::Abort { csid } => {
                buf.put_u32(*csid);
                MSG_ABORT
            }
            ControlMessage::Acknowledgement { sequence } => {
                buf.put_u32(*sequence);
                MSG_ACKNOWLEDGEMENT
            }
            ControlMessage::UserControl(event) => {
                match event {
                    UserControlEvent::StreamBegin(id) => {
                        buf.put_u16(UC_STREAM_BEGIN);
                        buf.put_u32(*id);
                    }
                    UserControlEvent::StreamEof(id) => {
                        buf.put_u16(UC_STREAM_EOF);
                        buf.put_u32(*id);
                    }
                    UserControlEvent::SetBufferLength {
                        stream_id,
                        buffer_ms,
                    } => {
                        buf.put_u16(UC_SET_BUFFER_LENGTH);
                        buf.put_u32(*stream_id);
                        buf.put_u32(*buffer_ms);
                    }
                    UserControlEvent::PingRequest(ts) => {
                        buf.put_u16(UC_PING_REQUEST);
                        buf.put_u32(*ts);
                    }
                    UserControlEvent::PingResponse(ts) => {
                        buf.put_u16(UC_PING_RESPONSE);
                        buf.put_u32(*ts);
                    }
                    UserControlEvent::Unknown { event_type, data } => {
                        buf.put_u16(*event_type);
                        buf.put_slice(data);
                    }
                }
                MSG_USER_CONTROL
            }
            ControlMessage::WindowAckSize(size) => {
                buf.put_u32(*size);
                MSG_WINDOW_ACK_SIZE
            }
            ControlMessage::SetPeerBandwidth { size, limit_type } => {
                buf.put_u32(*size);
                buf.put_u8(*limit_type);
                MSG_SET_PEER_BANDWIDTH
            }
        };

        RtmpMessage::new(CSID_PROTOCOL_CONTROL, 0, type_id, 0, buf.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_control_roundtrip() {
        let messages = [
            ControlMessage::SetChunkSize(4096),
            ControlMessage::Abort { csid: 6 },
            ControlMessage::Acknowledgement { sequence: 2_500_000 },
            ControlMessage::WindowAckSize(5_000_000),
            ControlMessage::SetPeerBandwidth {
                size: 5_000_000,
                limit_type: BANDWIDTH_LIMIT_DYNAMIC,
            },
            ControlMessage::UserControl(UserControlEvent::StreamBegin(1)),
            ControlMessage::UserControl(UserControlEvent::StreamEof(1)),
            ControlMessage::UserControl(UserControlEvent::SetBufferLength {
                stream_id: 1,
                buffer_ms: 3000,
            }),
            ControlMessage::UserControl(UserControlEvent::PingRequest(123)),
        ];

        for msg in messages {
            let encoded = msg.encode();
            assert_eq!(encoded.csid, CSID_PROTOCOL_CONTROL);
            assert_eq!(encoded.stream_id, 0);
            assert_eq!(ControlMessage::parse(&encoded).unwrap(), Some(msg));
        }
    }

    #[test]
    fn test_set_chunk_size_ignores_msb() {
        let msg = RtmpMessage::new(
            2,
            0,
            MSG_SET_CHUNK_SIZE,
            0,
            Bytes::from_static(&[0x80, 0x00, 0x10, 0x00]),
        );
        assert_eq!(
            ControlMessage::parse(&msg).unwrap(),
            Some(ControlMessage::SetChunkSize(4096))
        );
    }

    #[test]
    fn test_truncated_control_message() {
        let msg = RtmpMessage::new(2, 0, MSG_WINDOW_ACK_SIZE, 0, Bytes::from_static(&[0, 1]));
        let err = ControlMessage::parse(&msg).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::TruncatedMessage { type_id: 5, len: 2 })
        ));
    }

    #[test]
    fn test_non_control_message() {
        let msg = RtmpMessage::new(6, 0, MSG_VIDEO, 1, Bytes::from_static(&[0x17, 0x01]));
        assert!(!msg.is_control());
        assert_eq!(ControlMessage::parse(&msg).unwrap(), None);

        let cmd = RtmpMessage::new(3, 0, MSG_COMMAND_AMF0, 0, Bytes::new());
        assert!(cmd.is_command());
        let data = RtmpMessage::new(5, 0, MSG_DATA_AMF0, 1, Bytes::new());
        assert!(data.is_data());
    }
}
