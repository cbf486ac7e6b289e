//! RTMP protocol layer
//!
//! Chunk header codec, message reassembly and fragmentation, protocol
//! control messages and the server handshake.

pub mod assembler;
pub mod constants;
pub mod handshake;
pub mod header;
pub mod message;
pub mod writer;

pub use assembler::MessageAssembler;
pub use header::{ChunkHeader, ChunkStreamState, MessageHeader};
pub use message::{ControlMessage, RtmpMessage, UserControlEvent};
pub use writer::MessageWriter;
