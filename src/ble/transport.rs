//! BLE transport adapter.
//!
//! The only component that touches the BLE link. It owns the connection
//! state, keeps at most one write outstanding, and bounds every write by a
//! timeout so a stalled radio cannot wedge the control loop.
//!
//! # Event Flow
//!
//! ```text
//! BleLink impl --LinkEvent (mpsc)--> TransportAdapter --TransportEvent--> controller
//!                                        |
//!                  send(chunk) <---------+  (awaits WriteComplete for its token)
//! ```
//!
//! Each write carries a token. A write that timed out stays unconfirmed
//! until the link reports its outcome, and no new write starts before then.
//! If the late outcome is a completion for the chunk being sent again, that
//! chunk counts as sent without a second write. Completions for any other
//! token are discarded, so a late completion is never credited to the next
//! chunk.
//!
//! Link events that arrive while a send is waiting (MTU change, viewer
//! commands) are queued and returned by [`TransportAdapter::next_event`] in
//! arrival order.

use super::chunker::{Chunk, ChunkId};
use super::command::ViewerCommand;
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Raw notifications from the BLE link implementation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A viewer connected and subscribed. `mtu` is the largest write it accepts.
    Connected {
        /// Usable write size in bytes.
        mtu: u16,
    },
    /// The viewer renegotiated the MTU.
    MtuChanged {
        /// Usable write size in bytes.
        mtu: u16,
    },
    /// The write with this token left the radio.
    WriteComplete {
        /// Token passed to [`BleLink::start_write`].
        token: u32,
    },
    /// The write with this token was rejected by the stack.
    WriteFailed {
        /// Token passed to [`BleLink::start_write`].
        token: u32,
    },
    /// The viewer went away.
    Disconnected,
    /// The viewer wrote to the command characteristic.
    Command(Vec<u8>),
}

/// Errors reported by a link implementation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// The stack refused the write.
    WriteRejected,
    /// The write is larger than the negotiated MTU.
    Oversized {
        /// Write length in bytes.
        len: usize,
        /// Negotiated MTU.
        mtu: u16,
    },
    /// Driver-level failure.
    Driver(String),
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WriteRejected => write!(f, "write rejected by BLE stack"),
            Self::Oversized { len, mtu } => {
                write!(f, "write of {} bytes exceeds MTU {}", len, mtu)
            }
            Self::Driver(msg) => write!(f, "BLE driver error: {}", msg),
        }
    }
}

impl std::error::Error for LinkError {}

/// BLE link capability.
///
/// `start_write` hands one notification to the radio and returns at once.
/// The outcome arrives later as [`LinkEvent::WriteComplete`] or
/// [`LinkEvent::WriteFailed`] carrying the same token.
pub trait BleLink {
    /// Queue `data` for transmission.
    fn start_write(&mut self, token: u32, data: &[u8]) -> Result<(), LinkError>;
}

/// Connection state as seen by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No viewer.
    Disconnected,
    /// Viewer connected, not streaming.
    Connected {
        /// Usable write size in bytes.
        mtu: u16,
    },
    /// Frames are flowing.
    Streaming {
        /// Usable write size in bytes.
        mtu: u16,
    },
    /// Viewer connected, streaming suspended.
    Paused {
        /// Usable write size in bytes.
        mtu: u16,
    },
}

impl ConnectionState {
    /// Negotiated MTU, if connected.
    pub fn mtu(&self) -> Option<u16> {
        match *self {
            Self::Disconnected => None,
            Self::Connected { mtu } | Self::Streaming { mtu } | Self::Paused { mtu } => Some(mtu),
        }
    }

    /// Check if a viewer is connected.
    pub fn is_connected(&self) -> bool {
        !matches!(self, Self::Disconnected)
    }

    /// Check if frames may be sent.
    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::Streaming { .. })
    }

    fn with_mtu(self, mtu: u16) -> Self {
        match self {
            Self::Disconnected => Self::Disconnected,
            Self::Connected { .. } => Self::Connected { mtu },
            Self::Streaming { .. } => Self::Streaming { mtu },
            Self::Paused { .. } => Self::Paused { mtu },
        }
    }

    /// Lowercase name for logs and stats.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connected { .. } => "connected",
            Self::Streaming { .. } => "streaming",
            Self::Paused { .. } => "paused",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mtu() {
            Some(mtu) => write!(f, "{} (mtu {})", self.as_str(), mtu),
            None => f.write_str(self.as_str()),
        }
    }
}

/// Events surfaced to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A viewer connected or the MTU changed.
    ConnectionChanged(ConnectionState),
    /// The viewer disconnected.
    Disconnected,
    /// A viewer command.
    Command(ViewerCommand),
}

/// Errors from [`TransportAdapter::send`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// No completion within the write timeout.
    Timeout,
    /// The viewer disconnected (or the link went away) during the send.
    LinkLost,
    /// No viewer is connected.
    NotConnected,
    /// The link refused the write.
    Link(LinkError),
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "write timed out"),
            Self::LinkLost => write!(f, "link lost during write"),
            Self::NotConnected => write!(f, "not connected"),
            Self::Link(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for SendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Link(e) => Some(e),
            _ => None,
        }
    }
}

impl From<LinkError> for SendError {
    fn from(e: LinkError) -> Self {
        Self::Link(e)
    }
}

/// Outcome of one write as reported by the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteOutcome {
    Complete,
    Failed,
}

/// A write that timed out and has not been resolved by the link yet.
#[derive(Debug, Clone, Copy)]
struct Unconfirmed {
    token: u32,
    id: ChunkId,
}

/// Owns the link and its connection state.
pub struct TransportAdapter<L> {
    link: L,
    events: mpsc::UnboundedReceiver<LinkEvent>,
    state: ConnectionState,
    pending: VecDeque<TransportEvent>,
    write_timeout: Duration,
    next_token: u32,
    unconfirmed: Option<Unconfirmed>,
    /// Reused serialization buffer.
    buf: Vec<u8>,
}

impl<L: BleLink> TransportAdapter<L> {
    /// Create an adapter over `link`, consuming its event stream.
    pub fn new(
        link: L,
        events: mpsc::UnboundedReceiver<LinkEvent>,
        write_timeout: Duration,
    ) -> Self {
        Self {
            link,
            events,
            state: ConnectionState::Disconnected,
            pending: VecDeque::new(),
            write_timeout,
            next_token: 0,
            unconfirmed: None,
            buf: Vec::new(),
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Get a reference to the link.
    pub fn link(&self) -> &L {
        &self.link
    }

    /// Write one chunk and wait for the radio to confirm it.
    ///
    /// The whole call, including any wait for an earlier unconfirmed write,
    /// is bounded by the write timeout.
    ///
    /// Not cancel-safe: dropping the future leaves the write unconfirmed.
    pub async fn send(&mut self, chunk: &Chunk) -> Result<ChunkId, SendError> {
        let mtu = self.state.mtu().ok_or(SendError::NotConnected)?;
        let len = chunk.wire_len();
        if len > usize::from(mtu) {
            return Err(LinkError::Oversized { len, mtu }.into());
        }

        let deadline = Instant::now() + self.write_timeout;

        if let Some(previous) = self.unconfirmed {
            match self.wait_for(previous.token, deadline).await {
                Ok(outcome) => {
                    self.unconfirmed = None;
                    if outcome == WriteOutcome::Complete && previous.id == chunk.id() {
                        debug!("Chunk {} confirmed late", chunk.id());
                        return Ok(chunk.id());
                    }
                }
                Err(SendError::Timeout) => {
                    warn!("Chunk {} still unconfirmed, not writing {}", previous.id, chunk.id());
                    return Err(SendError::Timeout);
                }
                Err(e) => return Err(e),
            }
        }

        self.buf.resize(len, 0);
        // Cannot fail: the buffer was sized to wire_len()
        let _ = chunk.write_to(&mut self.buf);

        let token = self.next_token;
        self.next_token = self.next_token.wrapping_add(1);
        self.link.start_write(token, &self.buf)?;

        match self.wait_for(token, deadline).await {
            Ok(WriteOutcome::Complete) => {
                debug!("Chunk {} sent ({} bytes)", chunk.id(), len);
                Ok(chunk.id())
            }
            Ok(WriteOutcome::Failed) => Err(SendError::Link(LinkError::WriteRejected)),
            Err(SendError::Timeout) => {
                warn!("Chunk {} not confirmed within {:?}", chunk.id(), self.write_timeout);
                self.unconfirmed = Some(Unconfirmed {
                    token,
                    id: chunk.id(),
                });
                Err(SendError::Timeout)
            }
            Err(e) => Err(e),
        }
    }

    /// Wait for the outcome of `token`, queueing other events.
    async fn wait_for(&mut self, token: u32, deadline: Instant) -> Result<WriteOutcome, SendError> {
        loop {
            let event = match tokio::time::timeout_at(deadline, self.events.recv()).await {
                Err(_) => return Err(SendError::Timeout),
                Ok(None) => {
                    self.state = ConnectionState::Disconnected;
                    self.unconfirmed = None;
                    return Err(SendError::LinkLost);
                }
                Ok(Some(event)) => event,
            };

            match event {
                LinkEvent::WriteComplete { token: t } if t == token => {
                    return Ok(WriteOutcome::Complete);
                }
                LinkEvent::WriteFailed { token: t } if t == token => {
                    return Ok(WriteOutcome::Failed);
                }
                other => {
                    let lost = other == LinkEvent::Disconnected;
                    if let Some(event) = self.apply(other) {
                        self.pending.push_back(event);
                    }
                    if lost {
                        return Err(SendError::LinkLost);
                    }
                }
            }
        }
    }

    /// Next connection change or viewer command.
    ///
    /// Cancel-safe. Returns `None` once the link implementation has gone away.
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            let raw = self.events.recv().await?;
            if let Some(event) = self.apply(raw) {
                return Some(event);
            }
        }
    }

    /// Mark the connection as streaming. No effect when disconnected.
    pub fn mark_streaming(&mut self) {
        if let Some(mtu) = self.state.mtu() {
            self.state = ConnectionState::Streaming { mtu };
        }
    }

    /// Mark the connection as paused. No effect when disconnected.
    pub fn mark_paused(&mut self) {
        if let Some(mtu) = self.state.mtu() {
            self.state = ConnectionState::Paused { mtu };
        }
    }

    /// Mark the connection as connected but idle. No effect when disconnected.
    pub fn mark_connected(&mut self) {
        if let Some(mtu) = self.state.mtu() {
            self.state = ConnectionState::Connected { mtu };
        }
    }

    /// Fold a link event into the connection state.
    fn apply(&mut self, event: LinkEvent) -> Option<TransportEvent> {
        match event {
            LinkEvent::Connected { mtu } => {
                if self.state.is_connected() {
                    // Resubscribe from the same viewer: keep streaming/paused
                    self.state = self.state.with_mtu(mtu);
                    info!("Viewer subscribed again, MTU {}", mtu);
                } else {
                    self.state = ConnectionState::Connected { mtu };
                    self.unconfirmed = None;
                    info!("Viewer connected, MTU {}", mtu);
                }
                Some(TransportEvent::ConnectionChanged(self.state))
            }
            LinkEvent::MtuChanged { mtu } => {
                if !self.state.is_connected() {
                    debug!("Ignoring MTU change while disconnected");
                    return None;
                }
                self.state = self.state.with_mtu(mtu);
                info!("MTU renegotiated to {}", mtu);
                Some(TransportEvent::ConnectionChanged(self.state))
            }
            LinkEvent::Disconnected => {
                let was_connected = self.state.is_connected();
                self.state = ConnectionState::Disconnected;
                self.unconfirmed = None;
                if was_connected {
                    info!("Viewer disconnected");
                    Some(TransportEvent::Disconnected)
                } else {
                    None
                }
            }
            LinkEvent::Command(bytes) => {
                if !self.state.is_connected() {
                    debug!("Ignoring command while disconnected");
                    return None;
                }
                match ViewerCommand::from_bytes(&bytes) {
                    Ok(cmd) => Some(TransportEvent::Command(cmd)),
                    Err(e) => {
                        warn!("Viewer command rejected: {}", e);
                        None
                    }
                }
            }
            LinkEvent::WriteComplete { token } | LinkEvent::WriteFailed { token } => {
                if self.unconfirmed.is_some_and(|u| u.token == token) {
                    debug!("Late outcome for unconfirmed write (token {})", token);
                    self.unconfirmed = None;
                } else {
                    debug!("Discarding stale write completion (token {})", token);
                }
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::sim::{SimulatedLink, SimulatedPeer};

    const TIMEOUT: Duration = Duration::from_millis(500);

    fn adapter() -> (TransportAdapter<SimulatedLink>, SimulatedPeer) {
        let (link, peer, events) = SimulatedLink::pair();
        (TransportAdapter::new(link, events, TIMEOUT), peer)
    }

    fn chunk(seq: u32, index: u16, count: u16) -> Chunk {
        Chunk::new(seq, index, count, vec![0xAB; 10])
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_reports_mtu() {
        let (mut adapter, peer) = adapter();
        peer.connect(185);
        assert_eq!(
            adapter.next_event().await,
            Some(TransportEvent::ConnectionChanged(ConnectionState::Connected { mtu: 185 }))
        );
        assert_eq!(adapter.state().mtu(), Some(185));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_while_disconnected() {
        let (mut adapter, peer) = adapter();
        assert_eq!(adapter.send(&chunk(0, 0, 1)).await, Err(SendError::NotConnected));
        assert!(peer.written().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_completes() {
        let (mut adapter, peer) = adapter();
        peer.connect(100);
        adapter.next_event().await;

        let id = adapter.send(&chunk(3, 0, 1)).await.unwrap();
        assert_eq!(id, ChunkId { frame_seq: 3, index: 0 });

        let written = peer.chunks();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0], chunk(3, 0, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_timeout_and_stale_completion() {
        let (mut adapter, peer) = adapter();
        peer.connect(100);
        adapter.next_event().await;

        peer.stall_next_writes(1);
        let start = Instant::now();
        assert_eq!(adapter.send(&chunk(0, 0, 2)).await, Err(SendError::Timeout));
        assert!(start.elapsed() >= TIMEOUT);

        // The stalled write finally completes; it must not confirm the next one
        peer.release_stalled();
        peer.stall_next_writes(1);
        assert_eq!(adapter.send(&chunk(0, 1, 2)).await, Err(SendError::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_new_write_while_previous_unconfirmed() {
        let (mut adapter, peer) = adapter();
        peer.connect(100);
        adapter.next_event().await;

        peer.stall_next_writes(1);
        assert_eq!(adapter.send(&chunk(0, 0, 2)).await, Err(SendError::Timeout));
        // The first write is still with the radio: the next chunk must wait
        assert_eq!(adapter.send(&chunk(0, 1, 2)).await, Err(SendError::Timeout));
        assert_eq!(peer.written().len(), 1);

        peer.release_stalled();
        adapter.send(&chunk(0, 1, 2)).await.unwrap();
        let indices: Vec<u16> = peer.chunks().iter().map(Chunk::index).collect();
        assert_eq!(indices, vec![0, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_completion_confirms_same_chunk() {
        let (mut adapter, peer) = adapter();
        peer.connect(100);
        adapter.next_event().await;

        peer.stall_next_writes(1);
        assert_eq!(adapter.send(&chunk(7, 0, 1)).await, Err(SendError::Timeout));

        peer.release_stalled();
        let id = adapter.send(&chunk(7, 0, 1)).await.unwrap();
        assert_eq!(id, ChunkId { frame_seq: 7, index: 0 });
        assert_eq!(peer.written().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_failure_rewrites_chunk() {
        let (mut adapter, peer) = adapter();
        peer.connect(100);
        adapter.next_event().await;

        peer.stall_next_writes(1);
        assert_eq!(adapter.send(&chunk(7, 0, 1)).await, Err(SendError::Timeout));

        peer.fail_stalled();
        adapter.send(&chunk(7, 0, 1)).await.unwrap();
        assert_eq!(peer.written().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_clears_unconfirmed_write() {
        let (mut adapter, peer) = adapter();
        peer.connect(100);
        adapter.next_event().await;

        peer.stall_next_writes(1);
        assert_eq!(adapter.send(&chunk(0, 0, 1)).await, Err(SendError::Timeout));

        peer.disconnect();
        peer.connect(100);
        assert_eq!(adapter.next_event().await, Some(TransportEvent::Disconnected));
        adapter.next_event().await;

        adapter.send(&chunk(0, 0, 1)).await.unwrap();
        assert_eq!(peer.written().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_connect_keeps_streaming() {
        let (mut adapter, peer) = adapter();
        peer.connect(100);
        adapter.next_event().await;
        adapter.mark_streaming();

        peer.connect(150);
        assert_eq!(
            adapter.next_event().await,
            Some(TransportEvent::ConnectionChanged(ConnectionState::Streaming { mtu: 150 }))
        );
        assert!(adapter.state().is_streaming());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_during_send() {
        let (mut adapter, peer) = adapter();
        peer.connect(100);
        adapter.next_event().await;

        peer.disconnect_after_writes(1);
        assert_eq!(adapter.send(&chunk(0, 0, 2)).await, Err(SendError::LinkLost));
        assert_eq!(adapter.state(), ConnectionState::Disconnected);
        assert_eq!(adapter.next_event().await, Some(TransportEvent::Disconnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_rejected() {
        let (mut adapter, peer) = adapter();
        peer.connect(100);
        adapter.next_event().await;

        peer.reject_next_writes(1);
        assert_eq!(
            adapter.send(&chunk(0, 0, 1)).await,
            Err(SendError::Link(LinkError::WriteRejected))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_write_refused() {
        let (mut adapter, peer) = adapter();
        peer.connect(12);
        adapter.next_event().await;

        let err = adapter.send(&chunk(0, 0, 1)).await.unwrap_err();
        assert_eq!(err, SendError::Link(LinkError::Oversized { len: 18, mtu: 12 }));
        assert!(peer.written().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_during_send_are_queued() {
        let (mut adapter, peer) = adapter();
        peer.connect(100);
        adapter.next_event().await;
        adapter.mark_streaming();

        peer.set_latency(Duration::from_millis(50));
        peer.send_command("pause");
        peer.change_mtu(200);
        adapter.send(&chunk(0, 0, 1)).await.unwrap();

        assert_eq!(
            adapter.next_event().await,
            Some(TransportEvent::Command(ViewerCommand::Pause))
        );
        assert_eq!(
            adapter.next_event().await,
            Some(TransportEvent::ConnectionChanged(ConnectionState::Streaming { mtu: 200 }))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_command_dropped() {
        let (mut adapter, peer) = adapter();
        peer.connect(100);
        adapter.next_event().await;

        peer.send_command("explode");
        peer.send_command("start");
        assert_eq!(
            adapter.next_event().await,
            Some(TransportEvent::Command(ViewerCommand::Start))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_marks() {
        let (mut adapter, peer) = adapter();
        adapter.mark_streaming();
        assert_eq!(adapter.state(), ConnectionState::Disconnected);

        peer.connect(64);
        adapter.next_event().await;
        adapter.mark_streaming();
        assert_eq!(adapter.state(), ConnectionState::Streaming { mtu: 64 });
        adapter.mark_paused();
        assert_eq!(adapter.state(), ConnectionState::Paused { mtu: 64 });
        adapter.mark_connected();
        assert_eq!(adapter.state(), ConnectionState::Connected { mtu: 64 });
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Disconnected.to_string(), "disconnected");
        assert_eq!(
            ConnectionState::Streaming { mtu: 244 }.to_string(),
            "streaming (mtu 244)"
        );
    }
}
