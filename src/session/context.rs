//! Client context
//!
//! Per-connection protocol state that is not owned by the chunk layer:
//! negotiated sizes, acknowledgement bookkeeping, the application name and
//! the connection's publish/play roles.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use super::client::ClientId;
use super::subscription::StreamSubscription;
use crate::protocol::constants::{DEFAULT_CHUNK_SIZE, DEFAULT_WINDOW_ACK_SIZE};

/// State of one connected client
#[derive(Debug)]
pub struct ClientContext {
    /// Unique session ID
    pub id: ClientId,

    /// Remote peer address
    pub peer_addr: SocketAddr,

    /// Application name (from connect)
    pub app_name: Option<String>,

    /// Negotiated chunk size (incoming)
    pub in_chunk_size: u32,

    /// Negotiated chunk size (outgoing)
    pub out_chunk_size: u32,

    /// Window announced by the peer; we acknowledge every this many bytes
    pub in_window_ack_size: u32,

    /// Window we announced to the peer
    pub out_window_ack_size: u32,

    /// Total bytes received
    pub bytes_received: u64,

    /// `bytes_received` at the last acknowledgement we sent
    pub last_acknowledged: u64,

    /// Last sequence number the peer acknowledged
    pub peer_acknowledged: u32,

    /// Path this client is publishing to
    pub publish_path: Option<String>,

    /// Active play subscription
    pub subscription: Option<Arc<StreamSubscription>>,

    /// Active message stream id
    stream_id: Option<u32>,

    next_stream_id: u32,

    /// Time the handshake completed
    pub connected_at: Instant,
}

impl ClientContext {
    pub fn new(id: ClientId, peer_addr: SocketAddr) -> Self {
        Self {
            id,
            peer_addr,
            app_name: None,
            in_chunk_size: DEFAULT_CHUNK_SIZE,
            out_chunk_size: DEFAULT_CHUNK_SIZE,
            in_window_ack_size: DEFAULT_WINDOW_ACK_SIZE,
            out_window_ack_size: DEFAULT_WINDOW_ACK_SIZE,
            bytes_received: 0,
            last_acknowledged: 0,
            peer_acknowledged: 0,
            publish_path: None,
            subscription: None,
            stream_id: None,
            next_stream_id: 1, // Stream 0 is reserved for NetConnection
            connected_at: Instant::now(),
        }
    }

    /// Current message stream id
    pub fn stream_id(&self) -> Option<u32> {
        self.stream_id
    }

    /// Allocate a message stream id and make it current
    pub fn create_stream(&mut self) -> u32 {
        let id = self.next_stream_id;
        self.next_stream_id += 1;
        self.stream_id = Some(id);
        id
    }

    /// Forget the current stream if it matches `stream_id`
    pub fn delete_stream(&mut self, stream_id: u32) -> bool {
        if self.stream_id == Some(stream_id) {
            self.stream_id = None;
            true
        } else {
            false
        }
    }

    pub fn is_publishing(&self) -> bool {
        self.publish_path.is_some()
    }

    pub fn is_playing(&self) -> bool {
        self.subscription.is_some()
    }

    /// Record received bytes; returns true when an acknowledgement is due
    pub fn add_bytes_received(&mut self, bytes: usize) -> bool {
        self.bytes_received += bytes as u64;
        self.in_window_ack_size > 0
            && self.bytes_received - self.last_acknowledged >= self.in_window_ack_size as u64
    }

    /// Mark an acknowledgement sent; returns its sequence number
    pub fn mark_acknowledged(&mut self) -> u32 {
        self.last_acknowledged = self.bytes_received;
        // Sequence numbers wrap at 32 bits
        self.bytes_received as u32
    }
}
