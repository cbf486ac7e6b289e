//! Server configuration

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::protocol::constants::*;
use crate::session::publish::DEFAULT_GOP_CACHE_MAX_SIZE;

/// Server configuration options
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,

    /// Maximum concurrent connections (0 = unlimited)
    pub max_connections: usize,

    /// Outbound chunk size announced to clients after the handshake
    pub chunk_size: u32,

    /// Window acknowledgement size announced to clients
    pub window_ack_size: u32,

    /// Peer bandwidth limit announced to clients
    pub peer_bandwidth: u32,

    /// Connection timeout (handshake must complete within this time)
    pub connection_timeout: Duration,

    /// Idle timeout (disconnect if no data received)
    pub idle_timeout: Duration,

    /// Enable TCP_NODELAY (disable Nagle's algorithm)
    pub tcp_nodelay: bool,

    /// Application-level read buffer size
    pub read_buffer_size: usize,

    /// Application-level write buffer size
    pub write_buffer_size: usize,

    /// Enable GOP caching for late-joiner support
    pub gop_cache_enabled: bool,

    /// Maximum GOP cache size in bytes per stream
    pub gop_cache_max_size: usize,

    /// Largest message the assembler accepts
    pub max_message_size: u32,

    /// Queued sends per subscriber above which skippable frames are dropped
    pub max_outstanding_sends: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, RTMP_PORT)),
            max_connections: 0, // Unlimited
            chunk_size: RECOMMENDED_CHUNK_SIZE,
            window_ack_size: DEFAULT_WINDOW_ACK_SIZE,
            peer_bandwidth: DEFAULT_PEER_BANDWIDTH,
            connection_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(60),
            tcp_nodelay: true, // Important for low latency
            read_buffer_size: 64 * 1024, // 64KB
            write_buffer_size: 64 * 1024,
            gop_cache_enabled: true,
            gop_cache_max_size: DEFAULT_GOP_CACHE_MAX_SIZE,
            max_message_size: MAX_MESSAGE_SIZE,
            max_outstanding_sends: 256,
        }
    }
}

impl ServerConfig {
    /// Create a new config with custom bind address
    pub fn with_addr(addr: SocketAddr) -> Self {
        Self {
            bind_addr: addr,
            ..Default::default()
        }
    }

    /// Set the bind address
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set maximum connections
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set chunk size
    pub fn chunk_size(mut self, size: u32) -> Self {
        self.chunk_size = size.min(MAX_CHUNK_SIZE);
        self
    }

    /// Set window acknowledgement size
    pub fn window_ack_size(mut self, size: u32) -> Self {
        self.window_ack_size = size;
        self
    }

    pub fn peer_bandwidth(mut self, bandwidth: u32) -> Self {
        self.peer_bandwidth = bandwidth;
        self
    }

    /// Disable GOP caching (sequence headers are still cached)
    pub fn disable_gop_cache(mut self) -> Self {
        self.gop_cache_enabled = false;
        self
    }

    /// Set the GOP cache limit in bytes
    pub fn gop_cache_max_size(mut self, size: usize) -> Self {
        self.gop_cache_max_size = size;
        self
    }

    /// Set the maximum accepted message size
    pub fn max_message_size(mut self, size: u32) -> Self {
        self.max_message_size = size;
        self
    }

    /// Set the per-subscriber backlog at which skippable frames are dropped
    pub fn max_outstanding_sends(mut self, count: usize) -> Self {
        self.max_outstanding_sends = count;
        self
    }

    /// Set connection timeout
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set idle timeout
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Enable or disable TCP_NODELAY
    pub fn tcp_nodelay(mut self, enabled: bool) -> Self {
        self.tcp_nodelay = enabled;
        self
    }

    /// Check the configuration for values the server cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(Error::Config(format!("invalid chunk size {}", self.chunk_size)));
        }
        if self.max_message_size == 0 {
            return Err(Error::Config("max_message_size must be positive".into()));
        }
        if self.max_outstanding_sends == 0 {
            return Err(Error::Config("max_outstanding_sends must be positive".into()));
        }
        if self.read_buffer_size == 0 || self.write_buffer_size == 0 {
            return Err(Error::Config("buffer sizes must be positive".into()));
        }
        if self.connection_timeout.is_zero() {
            return Err(Error::Config("connection_timeout must be positive".into()));
        }
        Ok(())
    }
}
