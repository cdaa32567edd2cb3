//! Host network provider.
//!
//! On host systems the OS owns networking; this provider only chooses the
//! address the diagnostics server binds to.

use super::{NetworkError, NetworkProvider};
use log::info;
use std::net::{IpAddr, Ipv4Addr};

/// Host network provider.
pub struct HostNetwork {
    bind: IpAddr,
    up: bool,
}

impl HostNetwork {
    /// Serve on loopback only.
    pub fn new() -> Self {
        Self::with_bind(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    /// Serve on a specific local address (e.g. 0.0.0.0 for every interface).
    pub fn with_bind(bind: IpAddr) -> Self {
        Self { bind, up: false }
    }
}

impl Default for HostNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkProvider for HostNetwork {
    fn connect(&mut self) -> Result<(), NetworkError> {
        self.up = true;
        info!("Host network ready, binding to {}", self.bind);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.up
    }

    fn ip_addr(&self) -> Option<IpAddr> {
        self.up.then_some(self.bind)
    }
}
