//! ESP32 WiFi network provider.
//!
//! Joins the access point named in the firmware configuration so the stats
//! server is reachable. Streaming itself never depends on WiFi.

use super::{NetworkError, NetworkProvider};
use crate::config::WifiConfig;
use esp_idf_hal::modem::Modem;
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use esp_idf_svc::wifi::{AuthMethod, BlockingWifi, ClientConfiguration, Configuration, EspWifi};
use esp_idf_sys::EspError;
use log::{info, warn};
use std::fmt;
use std::net::IpAddr;

/// Errors that can occur during WiFi operations.
#[derive(Debug)]
pub enum WifiError {
    /// SSID does not fit the driver's buffer.
    InvalidSsid,
    /// Password does not fit the driver's buffer.
    InvalidPassword,
    /// Failed to associate with the access point.
    ConnectionFailed(EspError),
    /// Failed to obtain an IP address via DHCP.
    DhcpFailed(EspError),
    /// ESP-IDF error.
    Esp(EspError),
}

impl From<EspError> for WifiError {
    fn from(e: EspError) -> Self {
        Self::Esp(e)
    }
}

impl fmt::Display for WifiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidSsid => write!(f, "invalid SSID"),
            Self::InvalidPassword => write!(f, "invalid password"),
            Self::ConnectionFailed(e) => write!(f, "connection failed: {:?}", e),
            Self::DhcpFailed(e) => write!(f, "DHCP failed: {:?}", e),
            Self::Esp(e) => write!(f, "ESP error: {:?}", e),
        }
    }
}

impl std::error::Error for WifiError {}

/// WiFi station for the diagnostics channel.
pub struct WifiNetwork<'a> {
    wifi: BlockingWifi<EspWifi<'a>>,
    config: WifiConfig,
    ip_addr: Option<IpAddr>,
}

impl<'a> WifiNetwork<'a> {
    /// Bring up the WiFi driver (not yet associated).
    pub fn new(
        modem: Modem,
        sysloop: EspSystemEventLoop,
        nvs: Option<EspDefaultNvsPartition>,
        config: WifiConfig,
    ) -> Result<Self, NetworkError> {
        let esp_wifi = EspWifi::new(modem, sysloop.clone(), nvs)?;
        let wifi = BlockingWifi::wrap(esp_wifi, sysloop)?;
        Ok(Self {
            wifi,
            config,
            ip_addr: None,
        })
    }

    fn join(&mut self) -> Result<IpAddr, WifiError> {
        let auth_method = if self.config.is_open() {
            AuthMethod::None
        } else {
            AuthMethod::WPA2Personal
        };

        let client = Configuration::Client(ClientConfiguration {
            ssid: self
                .config
                .ssid
                .as_str()
                .try_into()
                .map_err(|_| WifiError::InvalidSsid)?,
            password: self
                .config
                .password
                .expose()
                .try_into()
                .map_err(|_| WifiError::InvalidPassword)?,
            auth_method,
            ..Default::default()
        });

        self.wifi.set_configuration(&client)?;
        self.wifi.start()?;
        self.wifi.connect().map_err(WifiError::ConnectionFailed)?;
        self.wifi.wait_netif_up().map_err(WifiError::DhcpFailed)?;

        let ip_info = self.wifi.wifi().sta_netif().get_ip_info()?;
        Ok(IpAddr::V4(ip_info.ip))
    }
}

impl NetworkProvider for WifiNetwork<'_> {
    fn connect(&mut self) -> Result<(), NetworkError> {
        info!("Connecting to WiFi: {}", self.config.ssid);
        match self.join() {
            Ok(ip) => {
                info!("WiFi connected, IP: {}", ip);
                self.ip_addr = Some(ip);
                Ok(())
            }
            Err(e) => {
                warn!("WiFi connection failed: {}", e);
                self.ip_addr = None;
                Err(e.into())
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.wifi.is_connected().unwrap_or(false)
    }

    fn ip_addr(&self) -> Option<IpAddr> {
        if self.is_connected() {
            self.ip_addr
        } else {
            None
        }
    }
}
