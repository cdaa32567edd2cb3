//! ESP32-CAM BLE streaming firmware library.
//!
//! Captures JPEG frames and streams them to a viewer over an MTU-limited BLE
//! link, throttling on backpressure and low battery. Every hardware
//! capability sits behind a trait with a simulated implementation, so the
//! whole pipeline can be tested on the host machine without ESP32 hardware.

pub mod ble;
pub mod camera;
pub mod config;
pub mod network;
pub mod power;
pub mod stats;
pub mod stream;

// Re-export commonly used items
pub use ble::{Chunk, ChunkError, Chunker, ConnectionState, SendError, ViewerCommand};
pub use camera::{CaptureError, Frame};
pub use config::{ConfigError, FrameSize, StreamConfig};
pub use power::PowerState;
pub use stats::StreamStats;
pub use stream::{PauseReason, StreamController, StreamState};
