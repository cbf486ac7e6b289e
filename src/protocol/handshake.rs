//! RTMP server handshake
//!
//! ```text
//! Client                                   Server
//!   |------- C0 (1 byte: version) --------->|
//!   |------- C1 (1536 bytes: time+random) ->|
//!   |<------ S0 (1 byte: version) ----------|
//!   |<------ S1 (1536 bytes: time+random) --|
//!   |<------ S2 (1536 bytes: echo C1) ------|
//!   |------- C2 (1536 bytes: echo S1) ----->|
//! ```
//!
//! Only the "simple" handshake is implemented (no HMAC digest). C2 is not
//! checked against S1 since several encoders do not echo it faithfully.
//!
//! Reference: RTMP Specification Section 5.2

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, HandshakeError, Result};
use crate::protocol::constants::{HANDSHAKE_SIZE, RTMP_VERSION};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeState {
    /// Waiting for C0+C1
    WaitingForC0C1,
    /// S0+S1+S2 sent, waiting for C2
    WaitingForC2,
    Done,
}

/// Server side of the simple handshake
#[derive(Debug)]
pub struct ServerHandshake {
    state: HandshakeState,
}

impl ServerHandshake {
    pub fn new() -> Self {
        Self {
            state: HandshakeState::WaitingForC0C1,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == HandshakeState::Done
    }

    /// Bytes required before the next state transition
    pub fn bytes_needed(&self) -> usize {
        match self.state {
            HandshakeState::WaitingForC0C1 => 1 + HANDSHAKE_SIZE,
            HandshakeState::WaitingForC2 => HANDSHAKE_SIZE,
            HandshakeState::Done => 0,
        }
    }

    /// Consume handshake bytes from `data`.
    ///
    /// Returns S0+S1+S2 once C0+C1 has arrived, and `None` when more data is
    /// needed or after C2 completes the handshake. Bytes following C2 are left
    /// in `data`; they are the first chunks of the session.
    pub fn process(&mut self, data: &mut BytesMut) -> Result<Option<Bytes>> {
        match self.state {
            HandshakeState::WaitingForC0C1 => {
                if data.len() < 1 + HANDSHAKE_SIZE {
                    return Ok(None);
                }

                // Accept 3-31; some encoders send values other than 3
                let version = data.get_u8();
                if version < RTMP_VERSION {
                    return Err(HandshakeError::InvalidVersion(version).into());
                }

                let mut c1 = [0u8; HANDSHAKE_SIZE];
                data.copy_to_slice(&mut c1);

                let mut response = BytesMut::with_capacity(1 + HANDSHAKE_SIZE * 2);
                response.put_u8(RTMP_VERSION);
                response.put_slice(&generate_packet());
                response.put_slice(&generate_echo(&c1));

                self.state = HandshakeState::WaitingForC2;
                Ok(Some(response.freeze()))
            }
            HandshakeState::WaitingForC2 => {
                if data.len() < HANDSHAKE_SIZE {
                    return Ok(None);
                }
                data.advance(HANDSHAKE_SIZE);
                self.state = HandshakeState::Done;
                Ok(None)
            }
            HandshakeState::Done => Err(HandshakeError::InvalidState.into()),
        }
    }
}

impl Default for ServerHandshake {
    fn default() -> Self {
        Self::new()
    }
}

/// Run the server handshake over `io`.
///
/// `read_buf` receives everything read from the peer; on success it holds
/// any bytes that arrived after C2.
pub async fn accept<S>(io: &mut S, read_buf: &mut BytesMut) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut handshake = ServerHandshake::new();

    while !handshake.is_done() {
        if let Some(response) = handshake.process(read_buf)? {
            io.write_all(&response).await?;
            io.flush().await?;
            continue;
        }
        if handshake.is_done() {
            break;
        }

        read_buf.reserve(handshake.bytes_needed().max(4096));
        let n = io.read_buf(read_buf).await?;
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }
    }

    Ok(())
}

fn now_millis() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u32)
        .unwrap_or(0)
}

/// Generate S1
///
/// Format (1536 bytes):
/// - Bytes 0-3: Timestamp (32-bit, big-endian)
/// - Bytes 4-7: Zero
/// - Bytes 8-1535: Random data
fn generate_packet() -> [u8; HANDSHAKE_SIZE] {
    let mut packet = [0u8; HANDSHAKE_SIZE];
    let timestamp = now_millis();
    packet[0..4].copy_from_slice(&timestamp.to_be_bytes());

    // LCG filler; the handshake does not need cryptographic randomness
    let mut seed = timestamp as u64 | 1;
    for chunk in packet[8..].chunks_mut(8) {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let bytes = seed.to_le_bytes();
        chunk.copy_from_slice(&bytes[..chunk.len()]);
    }

    packet
}

/// Generate S2: C1 with bytes 4-7 replaced by our receive time
fn generate_echo(peer_packet: &[u8; HANDSHAKE_SIZE]) -> [u8; HANDSHAKE_SIZE] {
    let mut echo = *peer_packet;
    echo[4..8].copy_from_slice(&now_millis().to_be_bytes());
    echo
}
