//! Frame source.
//!
//! This module contains:
//! - [`Frame`]: one captured JPEG image with its sequence number
//! - [`Camera`]: the sensor capability (simulated on host, esp32-camera on ESP32)
//! - [`FrameSource`]: stamps frames and bounds every capture by a timeout
//!
//! # Example
//!
//! ```
//! use esp32_cam_ble::camera::{FrameSource, SimulatedCamera};
//! use esp32_cam_ble::config::FrameSize;
//! use std::time::Duration;
//!
//! # tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(async {
//! let camera = SimulatedCamera::new(FrameSize::Qvga, 12);
//! let mut source = FrameSource::new(camera, Duration::from_millis(200));
//!
//! let frame = source.capture().await.unwrap();
//! assert_eq!(frame.seq(), 0);
//! assert!(frame.data().starts_with(&[0xFF, 0xD8]));
//! # });
//! ```

mod sim;

#[cfg(feature = "esp32")]
mod esp;

pub use sim::SimulatedCamera;

#[cfg(feature = "esp32")]
pub use esp::EspCamera;

use log::{debug, warn};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// One captured JPEG frame.
///
/// Immutable once captured. Ownership moves from the source to the chunker;
/// nothing else keeps a reference.
#[derive(Debug, PartialEq, Eq)]
pub struct Frame {
    seq: u32,
    captured_at: Instant,
    data: Vec<u8>,
}

impl Frame {
    /// Create a frame.
    pub fn new(seq: u32, captured_at: Instant, data: Vec<u8>) -> Self {
        Self {
            seq,
            captured_at,
            data,
        }
    }

    /// Sequence number within the current session.
    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// When the sensor delivered the frame.
    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    /// JPEG bitstream.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Size of the JPEG bitstream in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if the sensor returned no data.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Errors from the camera capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureError {
    /// The sensor returned a bad or missing buffer. Retry next tick.
    SensorFault,
    /// The sensor is busy or did not answer in time.
    Unavailable,
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SensorFault => write!(f, "camera sensor fault"),
            Self::Unavailable => write!(f, "camera unavailable"),
        }
    }
}

impl std::error::Error for CaptureError {}

/// Camera sensor capability.
///
/// Implementations return one JPEG-encoded buffer per call. Resolution and
/// quality are fixed when the implementation is created.
#[allow(async_fn_in_trait)]
pub trait Camera {
    /// Expose and encode one frame.
    async fn grab(&mut self) -> Result<Vec<u8>, CaptureError>;
}

/// Produces sequenced frames from a [`Camera`].
pub struct FrameSource<C> {
    camera: C,
    timeout: Duration,
    next_seq: u32,
}

impl<C: Camera> FrameSource<C> {
    /// Wrap a camera. Each capture fails with `Unavailable` after `timeout`.
    pub fn new(camera: C, timeout: Duration) -> Self {
        Self {
            camera,
            timeout,
            next_seq: 0,
        }
    }

    /// Capture one frame.
    ///
    /// The sequence number only advances on success, so the viewer sees
    /// gaps only when a frame is dropped after capture.
    pub async fn capture(&mut self) -> Result<Frame, CaptureError> {
        let data = match tokio::time::timeout(self.timeout, self.camera.grab()).await {
            Ok(result) => result?,
            Err(_) => {
                warn!("Camera did not deliver within {:?}", self.timeout);
                return Err(CaptureError::Unavailable);
            }
        };

        let frame = Frame::new(self.next_seq, Instant::now(), data);
        self.next_seq = self.next_seq.wrapping_add(1);
        debug!("Captured frame {}: {} bytes", frame.seq(), frame.len());
        Ok(frame)
    }

    /// Restart numbering at 0 for a new session.
    pub fn reset_sequence(&mut self) {
        self.next_seq = 0;
    }

    /// Sequence number the next frame will get.
    pub fn next_seq(&self) -> u32 {
        self.next_seq
    }

    /// Get a reference to the camera.
    pub fn camera(&self) -> &C {
        &self.camera
    }
}
