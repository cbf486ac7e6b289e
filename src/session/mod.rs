//! Per-client session state
//!
//! This module holds the state attached to a connected client:
//! - Client context (negotiated sizes, acknowledgement window, roles)
//! - The send path shared by everything that writes to the client
//! - Publish and subscription contexts used by the registry

pub mod client;
pub mod context;
pub mod publish;
pub mod subscription;

pub use client::{ClientHandle, ClientId, OutboundQueue, SendCallback};
pub use context::ClientContext;
pub use publish::{GopState, PublishStreamContext};
pub use subscription::{DeliveryQueue, DeliveryStats, MediaPacket, PacketKind, StreamSubscription};
