//! Simulated camera for host runs and tests.

use super::{Camera, CaptureError};
use crate::config::FrameSize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// JPEG start-of-image marker.
const SOI: [u8; 2] = [0xFF, 0xD8];

/// JPEG end-of-image marker.
const EOI: [u8; 2] = [0xFF, 0xD9];

#[derive(Debug)]
struct Inner {
    frame_size: FrameSize,
    jpeg_quality: u8,
    /// Scripted results, consumed before falling back to synthetic frames.
    /// `Ok(n)` yields an `n`-byte frame.
    outcomes: VecDeque<Result<usize, CaptureError>>,
    latency: Duration,
    grabs: u64,
}

/// Camera that synthesises JPEG-shaped buffers.
///
/// Clones share state, so a test can keep a handle and script failures while
/// the controller owns the camera.
#[derive(Debug, Clone)]
pub struct SimulatedCamera {
    inner: Arc<Mutex<Inner>>,
}

impl SimulatedCamera {
    /// Create a camera producing frames sized for the given resolution and quality.
    pub fn new(frame_size: FrameSize, jpeg_quality: u8) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                frame_size,
                jpeg_quality,
                outcomes: VecDeque::new(),
                latency: Duration::ZERO,
                grabs: 0,
            })),
        }
    }

    /// Queue the result of a future grab.
    pub fn push_outcome(&self, outcome: Result<usize, CaptureError>) {
        self.lock().outcomes.push_back(outcome);
    }

    /// Simulated exposure and encode time.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Number of grabs performed so far.
    pub fn grabs(&self) -> u64 {
        self.lock().grabs
    }

    /// Size of an unscripted frame.
    ///
    /// Rough OV2640 figure: higher quality values compress harder.
    pub fn nominal_frame_len(&self) -> usize {
        let inner = self.lock();
        let (w, h) = inner.frame_size.dimensions();
        usize::from(w) * usize::from(h) / (8 + usize::from(inner.jpeg_quality))
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panicking test thread must not wedge every later grab
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Camera for SimulatedCamera {
    async fn grab(&mut self) -> Result<Vec<u8>, CaptureError> {
        let nominal = self.nominal_frame_len();
        let (outcome, latency, grab) = {
            let mut inner = self.lock();
            inner.grabs += 1;
            let outcome = inner.outcomes.pop_front().unwrap_or(Ok(nominal));
            (outcome, inner.latency, inner.grabs)
        };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        outcome.map(|len| synthetic_jpeg(len, grab))
    }
}

/// Build a buffer of exactly `len` bytes framed by SOI/EOI markers.
fn synthetic_jpeg(len: usize, salt: u64) -> Vec<u8> {
    if len < SOI.len() + EOI.len() {
        return vec![0; len];
    }
    let mut data = Vec::with_capacity(len);
    data.extend_from_slice(&SOI);
    let body = len - SOI.len() - EOI.len();
    // Never emit 0xFF inside the body so no spurious markers appear
    data.extend((0..body).map(|i| ((i as u64 + salt) % 0xFF) as u8));
    data.extend_from_slice(&EOI);
    data
}
