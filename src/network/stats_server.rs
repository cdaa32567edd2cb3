//! HTTP stats server for stream monitoring.
//!
//! Provides a simple `/stats` endpoint that returns [`StreamStats`] as JSON.
//! Uses `tiny_http` which works on both host and ESP32 (via std::net).

use crate::stats::StreamStats;
use log::{error, info, warn};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tiny_http::{Header, Method, Response, Server};

/// Default port for the stats server.
pub const DEFAULT_STATS_PORT: u16 = 8080;

/// How often the server thread checks for shutdown.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// HTTP stats server.
///
/// Runs in a background thread and serves stream statistics as JSON.
pub struct StatsServer {
    handle: Option<thread::JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    addr: Option<SocketAddr>,
}

impl StatsServer {
    /// Start the stats server.
    ///
    /// Binds to `bind_addr` (or 0.0.0.0) on `port`; port 0 picks a free port.
    /// Drop the returned handle to stop the server.
    pub fn start(
        bind_addr: Option<IpAddr>,
        port: u16,
        stats: Arc<StreamStats>,
    ) -> Result<Self, std::io::Error> {
        let addr = match bind_addr {
            Some(ip) => format!("{}:{}", ip, port),
            None => format!("0.0.0.0:{}", port),
        };

        let server = Server::http(&addr)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::AddrInUse, format!("{}", e)))?;
        let local = server.server_addr().to_ip();

        info!("Stats server listening on http://{}/stats", addr);

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();

        let handle = thread::Builder::new()
            .name("stats-http".to_string())
            .spawn(move || Self::run_server(server, stats, shutdown_clone))?;

        Ok(Self {
            handle: Some(handle),
            shutdown,
            addr: local,
        })
    }

    /// Address the server is bound to.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    fn run_server(server: Server, stats: Arc<StreamStats>, shutdown: Arc<AtomicBool>) {
        // Static ASCII headers always parse
        let (Ok(content_type), Ok(location), Ok(allow_get)) = (
            Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]),
            Header::from_bytes(&b"Location"[..], &b"/stats"[..]),
            Header::from_bytes(&b"Allow"[..], &b"GET"[..]),
        ) else {
            error!("Failed to build response headers");
            return;
        };

        loop {
            if shutdown.load(Ordering::Acquire) {
                info!("Stats server shutting down");
                break;
            }

            let request = match server.recv_timeout(POLL_INTERVAL) {
                Ok(Some(request)) => request,
                Ok(None) => continue,
                Err(e) => {
                    error!("Server error: {}", e);
                    break;
                }
            };

            let response = if request.method() != &Method::Get {
                Response::from_string("Method Not Allowed")
                    .with_status_code(405)
                    .with_header(allow_get.clone())
            } else {
                match request.url() {
                    "/stats" | "/stats/" => Response::from_string(stats.to_json())
                        .with_header(content_type.clone())
                        .with_status_code(200),
                    "/" => Response::from_string("See /stats for stream statistics")
                        .with_status_code(302)
                        .with_header(location.clone()),
                    _ => Response::from_string("Not Found").with_status_code(404),
                }
            };

            if let Err(e) = request.respond(response) {
                warn!("Failed to send response: {}", e);
            }
        }
    }

    /// Stop the server.
    ///
    /// May take up to one poll interval.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for StatsServer {
    fn drop(&mut self) {
        self.stop();
    }
}
