//! Network abstraction for the diagnostics channel.
//!
//! Streaming runs over BLE only. The network is used for the `/stats`
//! endpoint and works on:
//! - **ESP32** (`esp32` feature): WiFi station using the configured credentials
//! - **Host**: native OS networking
//!
//! # Example
//!
//! ```no_run
//! use esp32_cam_ble::network::{HostNetwork, NetworkProvider, StatsServer};
//! use esp32_cam_ble::stats::StreamStats;
//! use std::sync::Arc;
//!
//! let mut network = HostNetwork::new();
//! network.connect().unwrap();
//! let _server = StatsServer::start(network.ip_addr(), 8080, Arc::new(StreamStats::new())).unwrap();
//! ```

use std::net::IpAddr;

#[cfg(feature = "esp32")]
mod wifi;

#[cfg(not(feature = "esp32"))]
mod host;

mod stats_server;

#[cfg(feature = "esp32")]
pub use wifi::{WifiError, WifiNetwork};

#[cfg(not(feature = "esp32"))]
pub use host::HostNetwork;

pub use stats_server::{StatsServer, DEFAULT_STATS_PORT};

/// Network provider abstraction.
///
/// Lets the binary bring up the diagnostics channel the same way on ESP32
/// (WiFi) and host (native).
pub trait NetworkProvider {
    /// Connect to the network.
    fn connect(&mut self) -> Result<(), NetworkError>;

    /// Check if the network is connected.
    fn is_connected(&self) -> bool;

    /// Local IP address to bind servers to. `None` if not connected.
    fn ip_addr(&self) -> Option<IpAddr>;
}

/// Network errors.
#[derive(Debug)]
pub enum NetworkError {
    /// WiFi connection failed.
    #[cfg(feature = "esp32")]
    Wifi(WifiError),
    /// Generic I/O error.
    Io(std::io::Error),
}

impl std::fmt::Display for NetworkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            #[cfg(feature = "esp32")]
            Self::Wifi(e) => write!(f, "WiFi error: {}", e),
            Self::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for NetworkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            #[cfg(feature = "esp32")]
            Self::Wifi(e) => Some(e),
            Self::Io(e) => Some(e),
        }
    }
}

impl From<std::io::Error> for NetworkError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

#[cfg(feature = "esp32")]
impl From<WifiError> for NetworkError {
    fn from(e: WifiError) -> Self {
        Self::Wifi(e)
    }
}

#[cfg(feature = "esp32")]
impl From<esp_idf_sys::EspError> for NetworkError {
    fn from(e: esp_idf_sys::EspError) -> Self {
        Self::Wifi(WifiError::Esp(e))
    }
}
