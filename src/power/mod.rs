//! Battery monitoring.
//!
//! Classifies the supply voltage into a [`PowerState`] with hysteresis so a
//! reading hovering around a threshold does not flip the state back and forth.
//!
//! # Transitions
//!
//! ```text
//! Normal --v < low--> Low --v < critical--> Critical
//! Normal <--v > low + margin-- Low <--v > critical + margin-- Critical
//! ```
//!
//! A reading exactly at a threshold never moves the state down.
//!
//! # Example
//!
//! ```
//! use esp32_cam_ble::power::{BatteryMonitor, BatteryThresholds, PowerState, SimulatedBattery};
//!
//! let battery = SimulatedBattery::new(3.3);
//! let mut monitor = BatteryMonitor::new(battery.clone(), BatteryThresholds::new(3.3, 3.1, 0.1));
//!
//! assert_eq!(monitor.sample(), None);
//! assert_eq!(monitor.current_state(), PowerState::Normal);
//!
//! battery.set_volts(3.29);
//! assert_eq!(monitor.sample().map(|t| t.to), Some(PowerState::Low));
//! ```

mod sim;

#[cfg(feature = "esp32")]
mod adc;

pub use sim::SimulatedBattery;

#[cfg(feature = "esp32")]
pub use adc::AdcBattery;

use crate::config::StreamConfig;
use log::{info, warn};
use std::fmt;

/// Supply classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    /// Full frame rate.
    Normal,
    /// Frame rate halved.
    Low,
    /// Streaming suspended.
    Critical,
}

impl PowerState {
    /// Lowercase name for logs and stats.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Low => "low",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors reading the supply voltage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SampleError {
    /// The ADC read failed.
    Adc(String),
    /// The reading is not a usable voltage.
    InvalidReading,
}

impl fmt::Display for SampleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Adc(msg) => write!(f, "ADC read failed: {}", msg),
            Self::InvalidReading => write!(f, "invalid voltage reading"),
        }
    }
}

impl std::error::Error for SampleError {}

/// Supply voltage sensor capability.
pub trait VoltageSensor {
    /// Read the battery voltage in volts.
    fn read_volts(&mut self) -> Result<f32, SampleError>;
}

/// Voltage thresholds with a shared recovery margin.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatteryThresholds {
    /// Normal/Low boundary (exclusive lower bound of Normal).
    pub low_volts: f32,
    /// Low/Critical boundary.
    pub critical_volts: f32,
    /// How far above a threshold a reading must rise to recover.
    pub hysteresis_volts: f32,
}

impl BatteryThresholds {
    /// Create thresholds.
    pub fn new(low_volts: f32, critical_volts: f32, hysteresis_volts: f32) -> Self {
        Self {
            low_volts,
            critical_volts,
            hysteresis_volts,
        }
    }

    /// Thresholds from the firmware configuration.
    pub fn from_config(config: &StreamConfig) -> Self {
        Self::new(
            config.low_battery_threshold_volts,
            config.critical_battery_threshold_volts,
            config.battery_hysteresis_volts,
        )
    }

    /// Next state for a reading, given the current state.
    pub fn classify(&self, current: PowerState, volts: f32) -> PowerState {
        if volts < self.critical_volts {
            return PowerState::Critical;
        }
        match current {
            PowerState::Critical if volts <= self.critical_volts + self.hysteresis_volts => {
                PowerState::Critical
            }
            PowerState::Critical | PowerState::Low => {
                if volts > self.low_volts + self.hysteresis_volts {
                    PowerState::Normal
                } else {
                    PowerState::Low
                }
            }
            PowerState::Normal => {
                if volts < self.low_volts {
                    PowerState::Low
                } else {
                    PowerState::Normal
                }
            }
        }
    }
}

/// A change of power state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerTransition {
    /// Previous state.
    pub from: PowerState,
    /// New state.
    pub to: PowerState,
    /// Reading that caused the change.
    pub volts: f32,
}

/// Periodically sampled battery state.
pub struct BatteryMonitor<S> {
    sensor: S,
    thresholds: BatteryThresholds,
    state: PowerState,
    last_volts: Option<f32>,
    failed_samples: u32,
}

impl<S: VoltageSensor> BatteryMonitor<S> {
    /// Create a monitor. The state starts at Normal until the first sample.
    pub fn new(sensor: S, thresholds: BatteryThresholds) -> Self {
        Self {
            sensor,
            thresholds,
            state: PowerState::Normal,
            last_volts: None,
            failed_samples: 0,
        }
    }

    /// Take one reading and update the state.
    ///
    /// Returns the transition if the state changed. A failed read keeps the
    /// last known state.
    pub fn sample(&mut self) -> Option<PowerTransition> {
        let volts = match self.sensor.read_volts() {
            Ok(v) if v.is_finite() && v >= 0.0 => v,
            Ok(_) => {
                self.record_failure(&SampleError::InvalidReading);
                return None;
            }
            Err(e) => {
                self.record_failure(&e);
                return None;
            }
        };

        self.failed_samples = 0;
        self.last_volts = Some(volts);

        let next = self.thresholds.classify(self.state, volts);
        if next == self.state {
            return None;
        }

        let transition = PowerTransition {
            from: self.state,
            to: next,
            volts,
        };
        self.state = next;
        info!(
            "Battery {} -> {} at {:.2} V",
            transition.from, transition.to, volts
        );
        Some(transition)
    }

    /// Current power state.
    pub fn current_state(&self) -> PowerState {
        self.state
    }

    /// Most recent valid reading.
    pub fn last_volts(&self) -> Option<f32> {
        self.last_volts
    }

    /// Consecutive failed reads.
    pub fn failed_samples(&self) -> u32 {
        self.failed_samples
    }

    /// Get the thresholds.
    pub fn thresholds(&self) -> &BatteryThresholds {
        &self.thresholds
    }

    fn record_failure(&mut self, error: &SampleError) {
        self.failed_samples += 1;
        warn!(
            "Battery sample failed ({}), keeping {} state",
            error, self.state
        );
    }
}
