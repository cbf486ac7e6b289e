//! rtmp-relay: RTMP relay server library
//!
//! This library implements the core of an RTMP relay:
//! - Chunk stream codec (basic/message headers, extended timestamps)
//! - Message reassembly and fragmentation with per-chunk-stream state
//! - Stream registry with per-path locking for publish/play
//! - GOP caching and sequence header replay for late joiners
//! - Media fan-out with per-subscriber backpressure
//! - Event handlers for downstream consumers (recorders, remuxers)
//!
//! AMF is not decoded here. Command and data messages are handed, whole, to
//! a [`CommandHandler`], which drives publish and play through a
//! [`CommandContext`](server::CommandContext).
//!
//! # Example: Simple Server
//!
//! ```no_run
//! use rtmp_relay::{CommandHandler, EventDispatcher, LoggingHandler, RtmpServer, ServerConfig};
//! use std::sync::Arc;
//!
//! struct MyCommands;
//!
//! // A real handler decodes AMF commands and calls `ctx.publish` / `ctx.play`
//! impl CommandHandler for MyCommands {}
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let events = EventDispatcher::new()
//!         .with_connection_handler(Arc::new(LoggingHandler))
//!         .with_stream_handler(Arc::new(LoggingHandler));
//!     let server = RtmpServer::new(ServerConfig::default(), MyCommands, events)?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod media;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;

// Re-export main types for convenience
pub use error::{Error, Result};
pub use registry::{RegistryError, StreamRegistry};
pub use server::config::ServerConfig;
pub use server::events::{
    ConnectionEventHandler, EventDispatcher, LoggingHandler, MediaEventHandler, StreamEventHandler,
};
pub use server::handler::CommandHandler;
pub use server::listener::RtmpServer;
