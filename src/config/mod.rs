//! Firmware configuration.
//!
//! All settings are fixed at boot. Defaults mirror the device's shipped
//! configuration; on host a JSON file can override any of them.
//!
//! # Components
//!
//! - `stream`: Camera, BLE, cadence and power settings (host-testable)
//! - `wifi`: WiFi credentials for the optional diagnostics channel

mod stream;
mod wifi;

pub use stream::{
    FrameSize, StreamConfig, BATTERY_CHECK_INTERVAL_MS, BATTERY_HYSTERESIS_VOLTS,
    BLE_DEVICE_NAME, BLE_MAX_MTU, CPU_FREQUENCY_MHZ, CRITICAL_BATTERY_THRESHOLD_VOLTS,
    DEBUG_MODE, FRAME_RATE, JPEG_QUALITY, LOW_BATTERY_THRESHOLD_VOLTS, MAX_JPEG_QUALITY,
    SERIAL_BAUD_RATE, STREAMING_INTERVAL_MS,
};
pub use wifi::{Secret, WifiConfig, MAX_PASSWORD_LEN, MAX_SSID_LEN, MIN_PASSWORD_LEN};

use std::fmt;

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// SSID is empty.
    SsidEmpty,
    /// SSID exceeds maximum length.
    SsidTooLong { len: usize, max: usize },
    /// Password is too short for WPA2.
    PasswordTooShort { len: usize, min: usize },
    /// Password exceeds maximum length.
    PasswordTooLong { len: usize, max: usize },
    /// A numeric setting is outside its accepted range.
    OutOfRange {
        field: &'static str,
        reason: &'static str,
    },
    /// BLE device name is empty or too long to advertise.
    InvalidDeviceName(String),
    /// Config file could not be read.
    Io(String),
    /// Config file is not valid JSON for [`StreamConfig`].
    Parse(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SsidEmpty => write!(f, "SSID cannot be empty"),
            Self::SsidTooLong { len, max } => {
                write!(f, "SSID too long: {} bytes (max {})", len, max)
            }
            Self::PasswordTooShort { len, min } => {
                write!(f, "password too short: {} bytes (min {})", len, min)
            }
            Self::PasswordTooLong { len, max } => {
                write!(f, "password too long: {} bytes (max {})", len, max)
            }
            Self::OutOfRange { field, reason } => write!(f, "invalid {}: {}", field, reason),
            Self::InvalidDeviceName(name) => write!(f, "invalid BLE device name: {:?}", name),
            Self::Io(msg) => write!(f, "cannot read config: {}", msg),
            Self::Parse(msg) => write!(f, "cannot parse config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}
