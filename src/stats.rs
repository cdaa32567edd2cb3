//! Stream statistics.
//!
//! Shared between the control loop and the stats server. All fields use
//! atomic types so the server thread can read them without locking.
//!
//! # Example Response
//!
//! ```json
//! {
//!   "uptime_secs": 3600,
//!   "state": "streaming",
//!   "power": "normal",
//!   "battery_millivolts": 3912,
//!   "mtu": 244,
//!   "capture_degraded": false,
//!   "frames": { "captured": 5120, "sent": 5101, "dropped": 19 },
//!   "chunks_sent": 332150,
//!   "send_timeouts": 41,
//!   "backpressure_skips": 880,
//!   "capture_failures": 3
//! }
//! ```

use crate::power::PowerState;
use crate::stream::StreamState;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU8, Ordering};
use std::time::Instant;

/// Frame counters.
#[derive(Debug, Default)]
pub struct FrameCounters {
    /// Frames delivered by the camera.
    pub captured: AtomicU32,
    /// Frames whose final chunk was confirmed.
    pub sent: AtomicU32,
    /// Frames discarded before completion.
    pub dropped: AtomicU32,
}

/// Live stream statistics.
#[derive(Debug)]
pub struct StreamStats {
    start_time: Instant,
    /// Frame counters.
    pub frames: FrameCounters,
    /// Chunks confirmed by the link.
    pub chunks_sent: AtomicU32,
    /// Chunk writes that timed out.
    pub send_timeouts: AtomicU32,
    /// Ticks skipped because a frame was still in flight.
    pub backpressure_skips: AtomicU32,
    /// Failed captures of any kind.
    pub capture_failures: AtomicU32,
    /// Set while captures keep returning `Unavailable`.
    pub capture_degraded: AtomicBool,
    /// Last valid battery reading.
    pub battery_millivolts: AtomicU32,
    /// Negotiated MTU, 0 when disconnected.
    pub mtu: AtomicU16,
    state: AtomicU8,
    power: AtomicU8,
}

/// Point-in-time copy of [`StreamStats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Seconds since start.
    pub uptime_secs: u64,
    /// Controller state name.
    pub state: &'static str,
    /// Power state name.
    pub power: &'static str,
    /// Last valid battery reading.
    pub battery_millivolts: u32,
    /// Negotiated MTU.
    pub mtu: u16,
    /// Capture degraded flag.
    pub capture_degraded: bool,
    /// Frame counters.
    pub frames: FrameSnapshot,
    /// Chunks confirmed by the link.
    pub chunks_sent: u32,
    /// Chunk writes that timed out.
    pub send_timeouts: u32,
    /// Backpressure skips.
    pub backpressure_skips: u32,
    /// Failed captures.
    pub capture_failures: u32,
}

/// Frame counters in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FrameSnapshot {
    /// Frames captured.
    pub captured: u32,
    /// Frames sent.
    pub sent: u32,
    /// Frames dropped.
    pub dropped: u32,
}

const STATE_NAMES: [&str; 4] = ["idle", "connected", "streaming", "paused"];
const POWER_NAMES: [&str; 3] = ["normal", "low", "critical"];

fn state_code(state: StreamState) -> u8 {
    match state {
        StreamState::Idle => 0,
        StreamState::Connected => 1,
        StreamState::Streaming => 2,
        StreamState::Paused(_) => 3,
    }
}

fn power_code(power: PowerState) -> u8 {
    match power {
        PowerState::Normal => 0,
        PowerState::Low => 1,
        PowerState::Critical => 2,
    }
}

impl StreamStats {
    /// Create zeroed statistics.
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            frames: FrameCounters::default(),
            chunks_sent: AtomicU32::new(0),
            send_timeouts: AtomicU32::new(0),
            backpressure_skips: AtomicU32::new(0),
            capture_failures: AtomicU32::new(0),
            capture_degraded: AtomicBool::new(false),
            battery_millivolts: AtomicU32::new(0),
            mtu: AtomicU16::new(0),
            state: AtomicU8::new(state_code(StreamState::Idle)),
            power: AtomicU8::new(power_code(PowerState::Normal)),
        }
    }

    /// Increment a counter.
    pub fn bump(counter: &AtomicU32) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the controller state.
    pub fn set_state(&self, state: StreamState) {
        self.state.store(state_code(state), Ordering::Relaxed);
    }

    /// Record the power state.
    pub fn set_power(&self, power: PowerState) {
        self.power.store(power_code(power), Ordering::Relaxed);
    }

    /// Record a battery reading.
    pub fn set_battery_volts(&self, volts: f32) {
        let mv = (volts * 1000.0).round().max(0.0) as u32;
        self.battery_millivolts.store(mv, Ordering::Relaxed);
    }

    /// Get uptime in seconds.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Copy all fields.
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU32| c.load(Ordering::Relaxed);
        StatsSnapshot {
            uptime_secs: self.uptime_secs(),
            state: STATE_NAMES[usize::from(self.state.load(Ordering::Relaxed))],
            power: POWER_NAMES[usize::from(self.power.load(Ordering::Relaxed))],
            battery_millivolts: self.battery_millivolts.load(Ordering::Relaxed),
            mtu: self.mtu.load(Ordering::Relaxed),
            capture_degraded: self.capture_degraded.load(Ordering::Relaxed),
            frames: FrameSnapshot {
                captured: load(&self.frames.captured),
                sent: load(&self.frames.sent),
                dropped: load(&self.frames.dropped),
            },
            chunks_sent: load(&self.chunks_sent),
            send_timeouts: load(&self.send_timeouts),
            backpressure_skips: load(&self.backpressure_skips),
            capture_failures: load(&self.capture_failures),
        }
    }

    /// Serialize all statistics to JSON.
    pub fn to_json(&self) -> String {
        // Serializing plain integers, strings and bools cannot fail
        serde_json::to_string(&self.snapshot()).unwrap_or_default()
    }
}

impl Default for StreamStats {
    fn default() -> Self {
        Self::new()
    }
}
