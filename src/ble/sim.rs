//! Simulated BLE link for host runs and tests.
//!
//! [`SimulatedLink::pair`] returns the link half (given to the transport
//! adapter), a [`SimulatedPeer`] handle that plays the viewer, and the event
//! receiver the adapter consumes.

use super::chunker::Chunk;
use super::transport::{BleLink, LinkError, LinkEvent};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Default)]
struct Shared {
    written: Vec<Vec<u8>>,
    latency: Duration,
    stall_next: u32,
    stalled_tokens: Vec<u32>,
    reject_next: u32,
    disconnect_after: Option<usize>,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Link half handed to the transport adapter.
#[derive(Debug)]
pub struct SimulatedLink {
    shared: Arc<Mutex<Shared>>,
    events: mpsc::UnboundedSender<LinkEvent>,
}

/// Viewer half used to drive the link.
#[derive(Debug, Clone)]
pub struct SimulatedPeer {
    shared: Arc<Mutex<Shared>>,
    events: mpsc::UnboundedSender<LinkEvent>,
}

impl SimulatedLink {
    /// Create a connected link/peer pair.
    pub fn pair() -> (
        SimulatedLink,
        SimulatedPeer,
        mpsc::UnboundedReceiver<LinkEvent>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Mutex::new(Shared::default()));
        let link = SimulatedLink {
            shared: shared.clone(),
            events: tx.clone(),
        };
        let peer = SimulatedPeer { shared, events: tx };
        (link, peer, rx)
    }
}

impl BleLink for SimulatedLink {
    fn start_write(&mut self, token: u32, data: &[u8]) -> Result<(), LinkError> {
        let mut shared = lock(&self.shared);

        if shared.reject_next > 0 {
            shared.reject_next -= 1;
            let _ = self.events.send(LinkEvent::WriteFailed { token });
            return Ok(());
        }

        shared.written.push(data.to_vec());

        if let Some(remaining) = shared.disconnect_after.as_mut() {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                shared.disconnect_after = None;
                let _ = self.events.send(LinkEvent::Disconnected);
                return Ok(());
            }
        }

        if shared.stall_next > 0 {
            shared.stall_next -= 1;
            shared.stalled_tokens.push(token);
            return Ok(());
        }

        if shared.latency.is_zero() {
            let _ = self.events.send(LinkEvent::WriteComplete { token });
        } else {
            let latency = shared.latency;
            let events = self.events.clone();
            tokio::spawn(async move {
                tokio::time::sleep(latency).await;
                let _ = events.send(LinkEvent::WriteComplete { token });
            });
        }
        Ok(())
    }
}

impl SimulatedPeer {
    fn emit(&self, event: LinkEvent) {
        let _ = self.events.send(event);
    }

    /// Connect with the given usable MTU.
    pub fn connect(&self, mtu: u16) {
        self.emit(LinkEvent::Connected { mtu });
    }

    /// Renegotiate the MTU.
    pub fn change_mtu(&self, mtu: u16) {
        self.emit(LinkEvent::MtuChanged { mtu });
    }

    /// Drop the connection.
    pub fn disconnect(&self) {
        self.emit(LinkEvent::Disconnected);
    }

    /// Write a command to the command characteristic.
    pub fn send_command(&self, command: &str) {
        self.emit(LinkEvent::Command(command.as_bytes().to_vec()));
    }

    /// Delay every write completion by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        lock(&self.shared).latency = latency;
    }

    /// Accept the next `count` writes but never confirm them.
    pub fn stall_next_writes(&self, count: u32) {
        lock(&self.shared).stall_next = count;
    }

    /// Confirm every stalled write now.
    pub fn release_stalled(&self) {
        let tokens = std::mem::take(&mut lock(&self.shared).stalled_tokens);
        for token in tokens {
            self.emit(LinkEvent::WriteComplete { token });
        }
    }

    /// Report every stalled write as failed now.
    pub fn fail_stalled(&self) {
        let tokens = std::mem::take(&mut lock(&self.shared).stalled_tokens);
        for token in tokens {
            self.emit(LinkEvent::WriteFailed { token });
        }
    }

    /// Reject the next `count` writes.
    pub fn reject_next_writes(&self, count: u32) {
        lock(&self.shared).reject_next = count;
    }

    /// Disconnect while the `count`-th write from now is in flight.
    pub fn disconnect_after_writes(&self, count: usize) {
        lock(&self.shared).disconnect_after = Some(count);
    }

    /// Raw bytes of every accepted write, in order.
    pub fn written(&self) -> Vec<Vec<u8>> {
        lock(&self.shared).written.clone()
    }

    /// Accepted writes decoded as chunks. Undecodable writes are skipped.
    pub fn chunks(&self) -> Vec<Chunk> {
        lock(&self.shared)
            .written
            .iter()
            .filter_map(|bytes| Chunk::from_bytes(bytes).ok())
            .collect()
    }

    /// Forget recorded writes.
    pub fn clear_written(&self) {
        lock(&self.shared).written.clear();
    }
}
