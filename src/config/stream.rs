//! Streaming configuration.
//!
//! # Example
//!
//! ```
//! use esp32_cam_ble::config::{FrameSize, StreamConfig};
//!
//! let config = StreamConfig::from_json_str(r#"{ "frame_rate": 5, "frame_size": "QVGA" }"#).unwrap();
//! assert_eq!(config.frame_size, FrameSize::Qvga);
//! assert_eq!(config.frame_period().as_millis(), 200);
//! ```

use super::wifi::{Secret, WifiConfig};
use super::ConfigError;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

// ==================== Device Defaults ====================

/// JPEG quality (0-63, lower means better quality and larger frames).
pub const JPEG_QUALITY: u8 = 12;

/// Highest value the JPEG encoder accepts.
pub const MAX_JPEG_QUALITY: u8 = 63;

/// Target frames per second.
pub const FRAME_RATE: u32 = 15;

/// Advertised BLE name.
pub const BLE_DEVICE_NAME: &str = "ESP32-CAM";

/// MTU requested during negotiation.
pub const BLE_MAX_MTU: u16 = 512;

/// Minimum spacing between frame ticks (ms).
pub const STREAMING_INTERVAL_MS: u64 = 50;

/// Battery sampling period (ms).
pub const BATTERY_CHECK_INTERVAL_MS: u64 = 60_000;

/// Below this voltage the device runs in low-power mode.
pub const LOW_BATTERY_THRESHOLD_VOLTS: f32 = 3.3;

/// Below this voltage streaming is suspended.
pub const CRITICAL_BATTERY_THRESHOLD_VOLTS: f32 = 3.1;

/// Voltage a reading must recover above a threshold before the state improves.
pub const BATTERY_HYSTERESIS_VOLTS: f32 = 0.1;

/// CPU clock (MHz).
pub const CPU_FREQUENCY_MHZ: u32 = 160;

/// Console baud rate.
pub const SERIAL_BAUD_RATE: u32 = 115_200;

/// Verbose logging.
pub const DEBUG_MODE: bool = true;

/// Smallest ATT MTU every BLE central must support.
const MIN_BLE_MTU: u16 = 23;

/// Largest ATT MTU allowed by Bluetooth LE.
const MAX_BLE_MTU: u16 = 517;

/// Longest name that fits a legacy advertising packet next to the flags field.
const MAX_DEVICE_NAME_LEN: usize = 29;

/// Capture budget at the reference clock (ms).
const CAPTURE_TIMEOUT_BASE_MS: u64 = 200;

/// Reference clock for [`CAPTURE_TIMEOUT_BASE_MS`].
const CAPTURE_TIMEOUT_REFERENCE_MHZ: u64 = 240;

/// Camera resolution presets supported by the OV2640 sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum FrameSize {
    /// 160x120
    #[serde(rename = "QQVGA")]
    Qqvga,
    /// 320x240
    #[serde(rename = "QVGA")]
    Qvga,
    /// 400x296
    #[serde(rename = "CIF")]
    Cif,
    /// 640x480
    #[serde(rename = "VGA")]
    Vga,
    /// 800x600
    #[serde(rename = "SVGA")]
    Svga,
    /// 1024x768
    #[serde(rename = "XGA")]
    Xga,
    /// 1280x1024
    #[serde(rename = "SXGA")]
    Sxga,
    /// 1600x1200
    #[serde(rename = "UXGA")]
    Uxga,
}

impl FrameSize {
    /// Frame dimensions as (width, height) in pixels.
    pub fn dimensions(self) -> (u16, u16) {
        match self {
            Self::Qqvga => (160, 120),
            Self::Qvga => (320, 240),
            Self::Cif => (400, 296),
            Self::Vga => (640, 480),
            Self::Svga => (800, 600),
            Self::Xga => (1024, 768),
            Self::Sxga => (1280, 1024),
            Self::Uxga => (1600, 1200),
        }
    }

    /// Short name as used in config files.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Qqvga => "QQVGA",
            Self::Qvga => "QVGA",
            Self::Cif => "CIF",
            Self::Vga => "VGA",
            Self::Svga => "SVGA",
            Self::Xga => "XGA",
            Self::Sxga => "SXGA",
            Self::Uxga => "UXGA",
        }
    }
}

impl Default for FrameSize {
    fn default() -> Self {
        Self::Vga
    }
}

/// Complete boot-time configuration of the streaming firmware.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// WiFi network for the diagnostics channel (empty disables WiFi).
    pub wifi_ssid: String,
    /// WiFi password.
    pub wifi_password: Secret,
    /// Capture resolution.
    pub frame_size: FrameSize,
    /// JPEG quality, 0-63 (lower = better quality, more chunks per frame).
    pub jpeg_quality: u8,
    /// Target captures per second.
    pub frame_rate: u32,
    /// Advertised BLE name.
    pub ble_device_name: String,
    /// Upper bound requested during MTU negotiation.
    pub ble_max_mtu: u16,
    /// Minimum spacing between frame ticks.
    pub streaming_interval_ms: u64,
    /// Battery sampling period.
    pub battery_check_interval_ms: u64,
    /// Normal/Low boundary.
    pub low_battery_threshold_volts: f32,
    /// Low/Critical boundary.
    pub critical_battery_threshold_volts: f32,
    /// Recovery margin above each threshold.
    pub battery_hysteresis_volts: f32,
    /// CPU clock; scales the capture latency budget.
    pub cpu_frequency_mhz: u32,
    /// Console baud rate (diagnostics only).
    pub serial_baud_rate: u32,
    /// Verbose logging (diagnostics only).
    pub debug_mode: bool,
    /// Maximum wait for one BLE write to complete.
    pub send_timeout_ms: u64,
    /// Consecutive write timeouts that pause the stream.
    pub max_consecutive_send_timeouts: u32,
    /// Consecutive unavailable captures that raise the degraded flag.
    pub max_consecutive_unavailable: u32,
    /// Delay before retrying a stream paused by write timeouts.
    pub link_retry_backoff_ms: u64,
    /// Chunks pre-built ahead of the radio.
    pub pending_chunk_capacity: usize,
    /// Start streaming as soon as a viewer connects.
    pub auto_start: bool,
    /// Port of the HTTP stats endpoint.
    pub stats_port: u16,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_password: Secret::default(),
            frame_size: FrameSize::Vga,
            jpeg_quality: JPEG_QUALITY,
            frame_rate: FRAME_RATE,
            ble_device_name: BLE_DEVICE_NAME.to_string(),
            ble_max_mtu: BLE_MAX_MTU,
            streaming_interval_ms: STREAMING_INTERVAL_MS,
            battery_check_interval_ms: BATTERY_CHECK_INTERVAL_MS,
            low_battery_threshold_volts: LOW_BATTERY_THRESHOLD_VOLTS,
            critical_battery_threshold_volts: CRITICAL_BATTERY_THRESHOLD_VOLTS,
            battery_hysteresis_volts: BATTERY_HYSTERESIS_VOLTS,
            cpu_frequency_mhz: CPU_FREQUENCY_MHZ,
            serial_baud_rate: SERIAL_BAUD_RATE,
            debug_mode: DEBUG_MODE,
            send_timeout_ms: 500,
            max_consecutive_send_timeouts: 2,
            max_consecutive_unavailable: 5,
            link_retry_backoff_ms: 2_000,
            pending_chunk_capacity: 4,
            auto_start: true,
            stats_port: crate::network::DEFAULT_STATS_PORT,
        }
    }
}

impl StreamConfig {
    /// Parse and validate a JSON config. Missing fields keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&json)
    }

    /// Validate all settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.jpeg_quality > MAX_JPEG_QUALITY {
            return Err(ConfigError::OutOfRange {
                field: "jpeg_quality",
                reason: "must be 0-63",
            });
        }
        if self.frame_rate == 0 || self.frame_rate > 60 {
            return Err(ConfigError::OutOfRange {
                field: "frame_rate",
                reason: "must be 1-60",
            });
        }
        if !(MIN_BLE_MTU..=MAX_BLE_MTU).contains(&self.ble_max_mtu) {
            return Err(ConfigError::OutOfRange {
                field: "ble_max_mtu",
                reason: "must be 23-517",
            });
        }
        if self.ble_device_name.is_empty() || self.ble_device_name.len() > MAX_DEVICE_NAME_LEN {
            return Err(ConfigError::InvalidDeviceName(self.ble_device_name.clone()));
        }
        if self.streaming_interval_ms == 0 {
            return Err(ConfigError::OutOfRange {
                field: "streaming_interval_ms",
                reason: "must be > 0",
            });
        }
        if self.battery_check_interval_ms == 0 {
            return Err(ConfigError::OutOfRange {
                field: "battery_check_interval_ms",
                reason: "must be > 0",
            });
        }
        if !(self.low_battery_threshold_volts > 0.0 && self.low_battery_threshold_volts < 5.5) {
            return Err(ConfigError::OutOfRange {
                field: "low_battery_threshold_volts",
                reason: "must be between 0 and 5.5 V",
            });
        }
        if !(self.critical_battery_threshold_volts > 0.0
            && self.critical_battery_threshold_volts < self.low_battery_threshold_volts)
        {
            return Err(ConfigError::OutOfRange {
                field: "critical_battery_threshold_volts",
                reason: "must be positive and below the low threshold",
            });
        }
        if !(self.battery_hysteresis_volts > 0.0 && self.battery_hysteresis_volts < 1.0) {
            return Err(ConfigError::OutOfRange {
                field: "battery_hysteresis_volts",
                reason: "must be between 0 and 1 V",
            });
        }
        if ![80, 160, 240].contains(&self.cpu_frequency_mhz) {
            return Err(ConfigError::OutOfRange {
                field: "cpu_frequency_mhz",
                reason: "must be 80, 160 or 240",
            });
        }
        if self.serial_baud_rate == 0 {
            return Err(ConfigError::OutOfRange {
                field: "serial_baud_rate",
                reason: "must be > 0",
            });
        }
        if self.send_timeout_ms == 0 {
            return Err(ConfigError::OutOfRange {
                field: "send_timeout_ms",
                reason: "must be > 0",
            });
        }
        if self.max_consecutive_send_timeouts == 0 {
            return Err(ConfigError::OutOfRange {
                field: "max_consecutive_send_timeouts",
                reason: "must be > 0",
            });
        }
        if self.max_consecutive_unavailable == 0 {
            return Err(ConfigError::OutOfRange {
                field: "max_consecutive_unavailable",
                reason: "must be > 0",
            });
        }
        if self.pending_chunk_capacity == 0 {
            return Err(ConfigError::OutOfRange {
                field: "pending_chunk_capacity",
                reason: "must be > 0",
            });
        }
        self.wifi()?;
        Ok(())
    }

    /// WiFi credentials, or `None` when the diagnostics channel is disabled.
    pub fn wifi(&self) -> Result<Option<WifiConfig>, ConfigError> {
        if self.wifi_ssid.is_empty() {
            return Ok(None);
        }
        WifiConfig::new(self.wifi_ssid.clone(), self.wifi_password.expose()).map(Some)
    }

    /// Scheduler tick period: the target frame interval, never shorter than
    /// `streaming_interval_ms`.
    pub fn frame_period(&self) -> Duration {
        let from_rate = Duration::from_micros(1_000_000 / u64::from(self.frame_rate.max(1)));
        from_rate.max(Duration::from_millis(self.streaming_interval_ms))
    }

    /// Maximum time a single capture may take, scaled by CPU clock.
    pub fn capture_timeout(&self) -> Duration {
        let mhz = u64::from(self.cpu_frequency_mhz.max(1));
        let ms = CAPTURE_TIMEOUT_BASE_MS * CAPTURE_TIMEOUT_REFERENCE_MHZ / mhz;
        Duration::from_millis(ms.clamp(100, 1_000))
    }

    /// Battery sampling period.
    pub fn battery_check_interval(&self) -> Duration {
        Duration::from_millis(self.battery_check_interval_ms)
    }

    /// Maximum wait for one BLE write.
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    /// Delay before a stalled link is retried.
    pub fn link_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.link_retry_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_device_header() {
        let config = StreamConfig::default();
        assert_eq!(config.frame_size, FrameSize::Vga);
        assert_eq!(config.frame_size.dimensions(), (640, 480));
        assert_eq!(config.jpeg_quality, 12);
        assert_eq!(config.frame_rate, 15);
        assert_eq!(config.ble_device_name, "ESP32-CAM");
        assert_eq!(config.ble_max_mtu, 512);
        assert_eq!(config.streaming_interval_ms, 50);
        assert_eq!(config.battery_check_interval_ms, 60_000);
        assert_eq!(config.low_battery_threshold_volts, 3.3);
        assert_eq!(config.cpu_frequency_mhz, 160);
        assert_eq!(config.serial_baud_rate, 115_200);
        assert!(config.debug_mode);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_frame_period_uses_rate_when_slower() {
        let config = StreamConfig::default();
        // 15 fps = 66.666 ms, longer than the 50 ms floor
        assert_eq!(config.frame_period(), Duration::from_micros(66_666));
    }

    #[test]
    fn test_frame_period_respects_streaming_interval() {
        let config = StreamConfig {
            frame_rate: 60,
            streaming_interval_ms: 50,
            ..Default::default()
        };
        assert_eq!(config.frame_period(), Duration::from_millis(50));
    }

    #[test]
    fn test_capture_timeout_scales_with_cpu() {
        let fast = StreamConfig {
            cpu_frequency_mhz: 240,
            ..Default::default()
        };
        let slow = StreamConfig {
            cpu_frequency_mhz: 80,
            ..Default::default()
        };
        assert_eq!(fast.capture_timeout(), Duration::from_millis(200));
        assert_eq!(StreamConfig::default().capture_timeout(), Duration::from_millis(300));
        assert_eq!(slow.capture_timeout(), Duration::from_millis(600));
    }

    #[test]
    fn test_json_overrides_keep_defaults() {
        let config = StreamConfig::from_json_str(
            r#"{ "frame_size": "QVGA", "jpeg_quality": 20, "ble_device_name": "Porch-Cam" }"#,
        )
        .unwrap();
        assert_eq!(config.frame_size, FrameSize::Qvga);
        assert_eq!(config.jpeg_quality, 20);
        assert_eq!(config.ble_device_name, "Porch-Cam");
        assert_eq!(config.frame_rate, FRAME_RATE);
        assert_eq!(config.ble_max_mtu, BLE_MAX_MTU);
    }

    #[test]
    fn test_json_rejects_unknown_frame_size() {
        let result = StreamConfig::from_json_str(r#"{ "frame_size": "8K" }"#);
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_jpeg_quality_range() {
        let config = StreamConfig {
            jpeg_quality: 64,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange {
                field: "jpeg_quality",
                ..
            })
        ));
    }

    #[test]
    fn test_mtu_range() {
        for mtu in [0, 22, 518] {
            let config = StreamConfig {
                ble_max_mtu: mtu,
                ..Default::default()
            };
            assert!(config.validate().is_err(), "mtu {} accepted", mtu);
        }
    }

    #[test]
    fn test_critical_must_be_below_low() {
        let config = StreamConfig {
            critical_battery_threshold_volts: 3.4,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_device_name_length() {
        let config = StreamConfig {
            ble_device_name: "x".repeat(30),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidDeviceName(_))
        ));
    }

    #[test]
    fn test_wifi_disabled_when_ssid_empty() {
        let config = StreamConfig::default();
        assert_eq!(config.wifi(), Ok(None));
    }

    #[test]
    fn test_wifi_credentials_validated() {
        let config = StreamConfig::from_json_str(
            r#"{ "wifi_ssid": "HomeNet", "wifi_password": "password123" }"#,
        )
        .unwrap();
        let wifi = config.wifi().unwrap().unwrap();
        assert_eq!(wifi.ssid, "HomeNet");

        let result = StreamConfig::from_json_str(r#"{ "wifi_ssid": "HomeNet", "wifi_password": "short" }"#);
        assert!(matches!(result, Err(ConfigError::PasswordTooShort { .. })));
    }

    #[test]
    fn test_debug_output_redacts_password() {
        let config = StreamConfig::from_json_str(
            r#"{ "wifi_ssid": "HomeNet", "wifi_password": "hunter2hunter2" }"#,
        )
        .unwrap();
        let debug = format!("{:?}", config);
        assert!(!debug.contains("hunter2hunter2"));
    }
}
