//! Camera streaming node.
//!
//! Runs on both ESP32 and host platforms:
//! - **Host**: `cargo run --bin camera-node -- [--config path.json]`
//!   Simulated camera, battery and viewer; useful for watching the control
//!   loop and the stats endpoint.
//! - **ESP32**: `cargo espflash flash --bin camera-node --features esp32 --release`
//!   OV2640 camera, ADC battery sense, NimBLE GATT server.
//!
//! ## Endpoints
//!
//! - Stats: http://localhost:8080/stats (ESP32: only when WiFi credentials
//!   are configured)

use esp32_cam_ble::config::StreamConfig;
use esp32_cam_ble::stats::StreamStats;
use esp32_cam_ble::stream::StreamController;
use log::{error, info, LevelFilter};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

type BoxError = Box<dyn std::error::Error>;

fn log_level(config: &StreamConfig) -> LevelFilter {
    if config.debug_mode {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal: {}", e);
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

// ==================== Host ====================

#[cfg(not(feature = "esp32"))]
fn parse_args() -> Result<StreamConfig, BoxError> {
    let args: Vec<String> = std::env::args().collect();
    let mut config = StreamConfig::default();

    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = iter.next().ok_or("--config needs a path")?;
                config = StreamConfig::from_file(path)?;
            }
            "--help" | "-h" => {
                println!("ESP32-CAM BLE streaming node (host simulation)");
                println!();
                println!("Usage:");
                println!("  {} [OPTIONS]", args[0]);
                println!();
                println!("Options:");
                println!("  --config, -c <FILE>  Load settings from a JSON file");
                println!("  --help, -h           Show this help");
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument: {}", other).into()),
        }
    }

    config.validate()?;
    Ok(config)
}

#[cfg(not(feature = "esp32"))]
async fn run() -> Result<(), BoxError> {
    use esp32_cam_ble::ble::SimulatedLink;
    use esp32_cam_ble::camera::SimulatedCamera;
    use esp32_cam_ble::network::{HostNetwork, NetworkProvider, StatsServer};
    use esp32_cam_ble::power::SimulatedBattery;
    use log::warn;
    use std::time::Duration;

    /// Battery drop per sample, so a long host run walks through the power states.
    const SIM_DRAIN_VOLTS: f32 = 0.01;
    /// Per-notification radio time at a 7.5 ms connection interval.
    const SIM_WRITE_LATENCY: Duration = Duration::from_millis(2);

    let config = parse_args()?;
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(log_level(&config).as_str()),
    )
    .init();

    info!("=== ESP32-CAM BLE node starting (host) ===");
    info!(
        "{} @ quality {}, {} fps, device {:?}, max MTU {}",
        config.frame_size.as_str(),
        config.jpeg_quality,
        config.frame_rate,
        config.ble_device_name,
        config.ble_max_mtu
    );

    let stats = Arc::new(StreamStats::new());

    let mut network = HostNetwork::new();
    network.connect()?;
    let _stats_server = match StatsServer::start(network.ip_addr(), config.stats_port, stats.clone())
    {
        Ok(server) => Some(server),
        Err(e) => {
            warn!("Failed to start stats server: {}", e);
            None
        }
    };

    let camera = SimulatedCamera::new(config.frame_size, config.jpeg_quality);
    let battery = SimulatedBattery::draining(4.1, SIM_DRAIN_VOLTS);
    let (link, viewer, events) = SimulatedLink::pair();
    viewer.set_latency(SIM_WRITE_LATENCY);

    let mut controller = StreamController::new(&config, camera, battery, link, events, stats)?;

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down...");
        }
        ctrl_c.cancel();
    });

    // Simulated viewer connects after a short delay
    let viewer_mtu = config.ble_max_mtu;
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        viewer.connect(viewer_mtu);
        // Keep the viewer (and its side of the link) alive
        std::future::pending::<()>().await;
    });

    controller.run(cancel).await;
    info!("Stopped: {}", controller.stats().to_json());
    Ok(())
}

// ==================== ESP32 ====================

#[cfg(feature = "esp32")]
fn configure_cpu(mhz: u32) -> Result<(), esp_idf_sys::EspError> {
    // Dynamic frequency scaling between 80 MHz and the configured maximum
    let pm = esp_idf_sys::esp_pm_config_t {
        max_freq_mhz: mhz as i32,
        min_freq_mhz: mhz.min(80) as i32,
        light_sleep_enable: false,
    };
    // SAFETY: pm outlives the call; the driver copies the struct
    esp_idf_sys::esp!(unsafe {
        esp_idf_sys::esp_pm_configure(&pm as *const esp_idf_sys::esp_pm_config_t as *const _)
    })
}

#[cfg(feature = "esp32")]
async fn run() -> Result<(), BoxError> {
    use esp32_cam_ble::ble::GattLink;
    use esp32_cam_ble::camera::EspCamera;
    use esp32_cam_ble::network::{NetworkProvider, StatsServer, WifiNetwork};
    use esp32_cam_ble::power::AdcBattery;
    use esp_idf_hal::peripherals::Peripherals;
    use esp_idf_svc::eventloop::EspSystemEventLoop;
    use esp_idf_svc::nvs::EspDefaultNvsPartition;
    use log::warn;

    esp_idf_sys::link_patches();
    esp_idf_svc::log::EspLogger::initialize_default();

    let config = StreamConfig::default();
    config.validate()?;
    log::set_max_level(log_level(&config));

    info!("=== ESP32-CAM BLE node starting ===");
    configure_cpu(config.cpu_frequency_mhz)?;
    info!("CPU up to {} MHz", config.cpu_frequency_mhz);

    let peripherals = Peripherals::take()?;
    let sysloop = EspSystemEventLoop::take()?;
    let nvs = EspDefaultNvsPartition::take().ok();

    let camera = EspCamera::new(config.frame_size, config.jpeg_quality)?;
    // Battery divider on GPIO33 (ADC1)
    let battery = AdcBattery::new(peripherals.adc1, peripherals.pins.gpio33)?;
    let (link, events) = GattLink::start(&config.ble_device_name, config.ble_max_mtu)?;

    let stats = Arc::new(StreamStats::new());

    // Optional diagnostics over WiFi; streaming does not depend on it
    let mut _network = None;
    let mut _stats_server = None;
    if let Some(wifi) = config.wifi()? {
        let mut network = WifiNetwork::new(peripherals.modem, sysloop, nvs, wifi)?;
        match network.connect() {
            Ok(()) => {
                match StatsServer::start(network.ip_addr(), config.stats_port, stats.clone()) {
                    Ok(server) => _stats_server = Some(server),
                    Err(e) => warn!("Failed to start stats server: {}", e),
                }
            }
            Err(e) => warn!("Continuing without stats server: {}", e),
        }
        _network = Some(network);
    } else {
        info!("No WiFi credentials, stats server disabled");
    }

    let mut controller = StreamController::new(&config, camera, battery, link, events, stats)?;
    controller.run(CancellationToken::new()).await;
    Ok(())
}
