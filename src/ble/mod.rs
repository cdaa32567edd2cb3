//! BLE streaming components.
//!
//! This module contains the chunk wire format, viewer commands and the
//! transport adapter that owns the BLE link.

mod chunker;
mod command;
mod sim;
mod transport;

#[cfg(feature = "esp32")]
mod gatt;

pub use chunker::{
    Chunk, ChunkError, ChunkId, ChunkIter, Chunker, FINAL_FLAG, MAX_CHUNKS_PER_FRAME,
    PROTOCOL_OVERHEAD,
};
pub use command::{CommandError, ViewerCommand, MAX_COMMAND_LEN};
pub use sim::{SimulatedLink, SimulatedPeer};
pub use transport::{
    BleLink, ConnectionState, LinkError, LinkEvent, SendError, TransportAdapter, TransportEvent,
};

#[cfg(feature = "esp32")]
pub use gatt::GattLink;
