//! Streaming control.
//!
//! This module contains:
//! - [`FrameScheduler`]: capture vs skip on every frame tick
//! - [`StreamSession`]: the single frame-in-flight slot
//! - [`StreamController`]: the state machine and control loop tying the
//!   camera, battery monitor, chunker and transport together
//!
//! # Example
//!
//! ```
//! use esp32_cam_ble::ble::SimulatedLink;
//! use esp32_cam_ble::camera::SimulatedCamera;
//! use esp32_cam_ble::config::StreamConfig;
//! use esp32_cam_ble::power::SimulatedBattery;
//! use esp32_cam_ble::stats::StreamStats;
//! use esp32_cam_ble::stream::{StreamController, StreamState};
//! use std::sync::Arc;
//!
//! let config = StreamConfig::default();
//! let (link, _peer, events) = SimulatedLink::pair();
//! let controller = StreamController::new(
//!     &config,
//!     SimulatedCamera::new(config.frame_size, config.jpeg_quality),
//!     SimulatedBattery::new(3.9),
//!     link,
//!     events,
//!     Arc::new(StreamStats::new()),
//! )
//! .unwrap();
//!
//! assert_eq!(controller.state(), StreamState::Idle);
//! ```

mod controller;
mod scheduler;
mod session;

pub use controller::{PauseReason, StreamController, StreamState};
pub use scheduler::{FrameScheduler, SchedulerDecision, SchedulerInputs, SkipReason};
pub use session::StreamSession;
