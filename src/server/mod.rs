//! RTMP server implementation
//!
//! This module provides the server-side RTMP implementation:
//! - TCP listener for accepting connections
//! - Per-connection driver and message dispatch
//! - Media fan-out with GOP caching
//! - Command handler trait for application callbacks
//! - Event handlers for downstream consumers

pub mod broadcaster;
pub mod config;
pub mod connection;
pub mod events;
pub mod handler;
pub mod listener;
pub mod session;

pub use broadcaster::MediaBroadcaster;
pub use config::ServerConfig;
pub use connection::Connection;
pub use events::{
    ConnectionEventHandler, EventDispatcher, HandlerError, HandlerResult, LoggingHandler,
    MediaEventHandler, StreamEventHandler,
};
pub use handler::{CommandContext, CommandHandler};
pub use listener::RtmpServer;
pub use session::Session;
