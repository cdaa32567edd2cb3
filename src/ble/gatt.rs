//! NimBLE GATT server exposing the camera stream.
//!
//! # GATT Service Structure
//!
//! ```text
//! Service: Camera Stream
//! ├── Frame (Notify) - chunked JPEG frames
//! └── Command (Write) - start / pause / resume / stop
//! ```
//!
//! The viewer connects, negotiates an MTU and subscribes to the frame
//! characteristic; the subscription is reported as
//! [`LinkEvent::Connected`]. NimBLE callbacks run on the host task, so they
//! only push events into the channel.

use super::command::MAX_COMMAND_LEN;
use super::transport::{BleLink, LinkError, LinkEvent};
use esp32_nimble::utilities::mutex::Mutex as NimbleMutex;
use esp32_nimble::utilities::BleUuid;
use esp32_nimble::{
    uuid128, BLEAdvertisementData, BLECharacteristic, BLEDevice, NimbleProperties,
    NotifyTxStatus,
};
use log::{info, warn};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

/// Camera stream service.
const STREAM_SERVICE_UUID: BleUuid = uuid128!("6e400001-b5a3-f393-e0a9-e50e24dcca9e");

/// Frame chunk notifications.
const FRAME_CHAR_UUID: BleUuid = uuid128!("6e400003-b5a3-f393-e0a9-e50e24dcca9e");

/// Viewer commands.
const COMMAND_CHAR_UUID: BleUuid = uuid128!("6e400002-b5a3-f393-e0a9-e50e24dcca9e");

/// ATT notification header (opcode + handle).
const ATT_NOTIFY_OVERHEAD: u16 = 3;

/// Tokens of notifications handed to the stack, oldest first.
type TokenQueue = Arc<Mutex<VecDeque<u32>>>;

fn lock(tokens: &Mutex<VecDeque<u32>>) -> MutexGuard<'_, VecDeque<u32>> {
    tokens.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// BLE link backed by the NimBLE GATT server.
pub struct GattLink {
    frame_char: Arc<NimbleMutex<BLECharacteristic>>,
    subscribed: Arc<AtomicBool>,
    /// NimBLE reports notify outcomes in submission order.
    in_flight: TokenQueue,
}

impl GattLink {
    /// Register the service, start advertising and return the link with its
    /// event stream.
    pub fn start(
        device_name: &str,
        preferred_mtu: u16,
    ) -> Result<(Self, mpsc::UnboundedReceiver<LinkEvent>), LinkError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let device = BLEDevice::take();

        BLEDevice::set_device_name(device_name).map_err(driver)?;
        device.set_preferred_mtu(preferred_mtu).map_err(driver)?;

        let server = device.get_server();
        server.advertise_on_disconnect(true);

        let subscribed = Arc::new(AtomicBool::new(false));
        let in_flight: TokenQueue = Arc::new(Mutex::new(VecDeque::new()));

        let disconnect_tx = tx.clone();
        let disconnect_subscribed = subscribed.clone();
        let disconnect_tokens = in_flight.clone();
        server.on_disconnect(move |_desc, reason| {
            info!("BLE peer disconnected: {:?}", reason);
            disconnect_subscribed.store(false, Ordering::SeqCst);
            lock(&disconnect_tokens).clear();
            let _ = disconnect_tx.send(LinkEvent::Disconnected);
        });

        let service = server.create_service(STREAM_SERVICE_UUID);

        // Frame characteristic (Notify)
        let frame_char = service
            .lock()
            .create_characteristic(FRAME_CHAR_UUID, NimbleProperties::NOTIFY);

        let subscribe_tx = tx.clone();
        let subscribe_flag = subscribed.clone();
        let subscribe_tokens = in_flight.clone();
        frame_char.lock().on_subscribe(move |_char, desc, sub| {
            let mtu = desc.mtu().saturating_sub(ATT_NOTIFY_OVERHEAD);
            if sub.is_empty() {
                subscribe_flag.store(false, Ordering::SeqCst);
                lock(&subscribe_tokens).clear();
                let _ = subscribe_tx.send(LinkEvent::Disconnected);
            } else if subscribe_flag.swap(true, Ordering::SeqCst) {
                let _ = subscribe_tx.send(LinkEvent::MtuChanged { mtu });
            } else {
                let _ = subscribe_tx.send(LinkEvent::Connected { mtu });
            }
        });

        let notify_tx = tx.clone();
        let notify_tokens = in_flight.clone();
        frame_char.lock().on_notify_tx(move |notify| {
            let Some(token) = lock(&notify_tokens).pop_front() else {
                warn!("Notify outcome with no write outstanding");
                return;
            };
            let event = match notify.status() {
                NotifyTxStatus::SuccessNotify | NotifyTxStatus::SuccessIndicate => {
                    LinkEvent::WriteComplete { token }
                }
                status => {
                    warn!("Notification failed: {:?}", status);
                    LinkEvent::WriteFailed { token }
                }
            };
            let _ = notify_tx.send(event);
        });

        // Command characteristic (Write)
        let command_char = service
            .lock()
            .create_characteristic(COMMAND_CHAR_UUID, NimbleProperties::WRITE);
        command_char.lock().on_write(move |args| {
            let data = args.recv_data();
            // Reject oversized data before allocating
            if data.len() > MAX_COMMAND_LEN {
                warn!("Rejected oversized command: {} bytes", data.len());
                return;
            }
            let _ = tx.send(LinkEvent::Command(data.to_vec()));
        });

        let advertising = device.get_advertising();
        advertising
            .lock()
            .set_data(
                BLEAdvertisementData::new()
                    .name(device_name)
                    .add_service_uuid(STREAM_SERVICE_UUID),
            )
            .map_err(driver)?;
        advertising.lock().start().map_err(driver)?;
        info!("Advertising as {:?} (preferred MTU {})", device_name, preferred_mtu);

        Ok((
            Self {
                frame_char,
                subscribed,
                in_flight,
            },
            rx,
        ))
    }
}

impl BleLink for GattLink {
    fn start_write(&mut self, token: u32, data: &[u8]) -> Result<(), LinkError> {
        if !self.subscribed.load(Ordering::SeqCst) {
            return Err(LinkError::Driver("no subscriber".to_string()));
        }
        lock(&self.in_flight).push_back(token);
        self.frame_char.lock().set_value(data).notify();
        Ok(())
    }
}

fn driver(e: impl std::fmt::Debug) -> LinkError {
    LinkError::Driver(format!("{:?}", e))
}
