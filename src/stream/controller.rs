//! Stream controller: the state machine and control loop.
//!
//! # States
//!
//! ```text
//!            connect              start / auto-start
//!   Idle ─────────────▶ Connected ─────────────────▶ Streaming ◀──┐
//!    ▲                     ▲  ▲        stop              │        │ resume /
//!    │                     │  └──────────────────────────┤        │ power recovers /
//!    │ disconnect (any)    │           stop              ▼        │ backoff elapsed
//!    └─────────────────────┴────────────────────────── Paused ────┘
//! ```
//!
//! `Streaming` pauses on critical power, a viewer `pause`, or repeated send
//! timeouts. Entering `Paused`, `Connected` or `Idle` drops the frame in
//! flight.
//!
//! # Control Loop
//!
//! One `tokio::select!` (biased) serves, in priority order: cancellation,
//! battery ticks, transport events, frame ticks, and chunk transmission.
//! Chunk transmission is only enabled while streaming with a frame in flight,
//! so a single frame drains one chunk per loop turn while events still get
//! through between chunks.

use super::scheduler::{FrameScheduler, SchedulerDecision, SchedulerInputs, SkipReason};
use super::session::StreamSession;
use crate::ble::{
    BleLink, ChunkError, Chunker, ConnectionState, LinkEvent, SendError, TransportAdapter,
    TransportEvent, ViewerCommand,
};
use crate::camera::{Camera, CaptureError, FrameSource};
use crate::config::{ConfigError, StreamConfig};
use crate::power::{BatteryMonitor, BatteryThresholds, PowerState, VoltageSensor};
use crate::stats::StreamStats;
use log::{debug, error, info, warn};
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Why streaming is suspended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseReason {
    /// Battery is critical.
    CriticalPower,
    /// The viewer asked to pause.
    Viewer,
    /// Writes kept timing out; retry after the backoff.
    LinkStalled,
}

impl fmt::Display for PauseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::CriticalPower => "critical power",
            Self::Viewer => "viewer request",
            Self::LinkStalled => "link stalled",
        };
        f.write_str(s)
    }
}

/// Controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// No viewer.
    Idle,
    /// Viewer connected, waiting for `start`.
    Connected,
    /// Capturing and sending frames.
    Streaming,
    /// Viewer connected, streaming suspended.
    Paused(PauseReason),
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connected => write!(f, "connected"),
            Self::Streaming => write!(f, "streaming"),
            Self::Paused(reason) => write!(f, "paused ({})", reason),
        }
    }
}

/// Tunables taken from [`StreamConfig`].
#[derive(Debug, Clone)]
struct Limits {
    max_mtu: u16,
    max_send_timeouts: u32,
    max_unavailable: u32,
    link_retry_backoff: Duration,
    battery_check_interval: Duration,
    auto_start: bool,
}

/// Owns every streaming component and drives them from one loop.
pub struct StreamController<C, S, L> {
    source: FrameSource<C>,
    battery: BatteryMonitor<S>,
    transport: TransportAdapter<L>,
    chunker: Chunker,
    scheduler: FrameScheduler,
    session: StreamSession,
    state: StreamState,
    limits: Limits,
    stats: Arc<StreamStats>,
    consecutive_unavailable: u32,
    capture_degraded: bool,
    retry_at: Option<Instant>,
}

impl<C: Camera, S: VoltageSensor, L: BleLink> StreamController<C, S, L> {
    /// Build a controller from validated configuration and the three
    /// capabilities.
    pub fn new(
        config: &StreamConfig,
        camera: C,
        sensor: S,
        link: L,
        link_events: mpsc::UnboundedReceiver<LinkEvent>,
        stats: Arc<StreamStats>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let chunker = Chunker::try_new(usize::from(config.ble_max_mtu)).map_err(|_| {
            ConfigError::OutOfRange {
                field: "ble_max_mtu",
                reason: "cannot carry the chunk header",
            }
        })?;

        let battery = BatteryMonitor::new(sensor, BatteryThresholds::from_config(config));
        stats.set_state(StreamState::Idle);
        stats.set_power(battery.current_state());

        Ok(Self {
            source: FrameSource::new(camera, config.capture_timeout()),
            battery,
            transport: TransportAdapter::new(link, link_events, config.send_timeout()),
            chunker,
            scheduler: FrameScheduler::new(config.frame_period()),
            session: StreamSession::new(config.pending_chunk_capacity),
            state: StreamState::Idle,
            limits: Limits {
                max_mtu: config.ble_max_mtu,
                max_send_timeouts: config.max_consecutive_send_timeouts,
                max_unavailable: config.max_consecutive_unavailable,
                link_retry_backoff: config.link_retry_backoff(),
                battery_check_interval: config.battery_check_interval(),
                auto_start: config.auto_start,
            },
            stats,
            consecutive_unavailable: 0,
            capture_degraded: false,
            retry_at: None,
        })
    }

    /// Current state.
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Current power state.
    pub fn power_state(&self) -> PowerState {
        self.battery.current_state()
    }

    /// Check if captures keep returning `Unavailable`.
    pub fn is_capture_degraded(&self) -> bool {
        self.capture_degraded
    }

    /// Check if a frame is being sent.
    pub fn frame_in_flight(&self) -> bool {
        self.session.is_in_flight()
    }

    /// Connection state as held by the transport.
    pub fn connection(&self) -> ConnectionState {
        self.transport.state()
    }

    /// Shared statistics.
    pub fn stats(&self) -> &Arc<StreamStats> {
        &self.stats
    }

    /// Run until cancelled or the BLE link goes away.
    pub async fn run(&mut self, cancel: CancellationToken) {
        info!(
            "Stream controller running: frame period {:?}, battery check every {:?}",
            self.scheduler.period(),
            self.limits.battery_check_interval
        );

        let mut battery_tick = tokio::time::interval(self.limits.battery_check_interval);
        battery_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut frame_tick = tokio::time::interval(self.scheduler.period());
        frame_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let pumping = self.state == StreamState::Streaming && self.session.is_in_flight();

            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!("Stream controller cancelled");
                    break;
                }
                _ = battery_tick.tick() => self.on_battery_tick(),
                event = self.transport.next_event() => match event {
                    Some(event) => self.handle_transport_event(event),
                    None => {
                        warn!("BLE link closed, stopping stream controller");
                        break;
                    }
                },
                _ = frame_tick.tick() => self.on_frame_tick(Instant::now()).await,
                _ = std::future::ready(()), if pumping => self.pump_chunk().await,
            }
        }

        self.drop_in_flight();
    }

    /// Apply a connection change or viewer command.
    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::ConnectionChanged(connection) => {
                let Some(mtu) = connection.mtu() else {
                    return;
                };
                let effective = mtu.min(self.limits.max_mtu);
                if let Err(e) = self.chunker.set_mtu(usize::from(effective)) {
                    warn!("Unusable MTU {}: {}", effective, e);
                }
                self.stats.mtu.store(effective, Ordering::Relaxed);

                if self.state == StreamState::Idle {
                    self.set_state(StreamState::Connected);
                    if self.limits.auto_start {
                        self.start_streaming();
                    }
                }
            }
            TransportEvent::Disconnected => self.on_disconnect(),
            TransportEvent::Command(cmd) => self.handle_command(cmd),
        }
    }

    /// Apply a viewer command.
    pub fn handle_command(&mut self, cmd: ViewerCommand) {
        debug!("Viewer command: {} in state {}", cmd, self.state);
        match (cmd, self.state) {
            (_, StreamState::Idle) => {}
            (ViewerCommand::Start, StreamState::Connected)
            | (ViewerCommand::Start | ViewerCommand::Resume, StreamState::Paused(_)) => {
                self.start_streaming();
            }
            (ViewerCommand::Pause, StreamState::Streaming | StreamState::Paused(_)) => {
                self.pause(PauseReason::Viewer);
            }
            (ViewerCommand::Stop, StreamState::Streaming | StreamState::Paused(_)) => {
                self.drop_in_flight();
                self.retry_at = None;
                self.transport.mark_connected();
                self.set_state(StreamState::Connected);
            }
            (cmd, state) => debug!("Ignoring {} in state {}", cmd, state),
        }
    }

    /// Sample the battery and react to a power state change.
    pub fn on_battery_tick(&mut self) {
        let transition = self.battery.sample();
        if let Some(volts) = self.battery.last_volts() {
            self.stats.set_battery_volts(volts);
        }
        let Some(transition) = transition else {
            return;
        };
        self.stats.set_power(transition.to);

        match (transition.to, self.state) {
            (PowerState::Critical, StreamState::Streaming)
            | (PowerState::Critical, StreamState::Paused(PauseReason::LinkStalled)) => {
                warn!("Battery critical at {:.2} V, pausing stream", transition.volts);
                self.pause(PauseReason::CriticalPower);
            }
            (PowerState::Normal | PowerState::Low, StreamState::Paused(PauseReason::CriticalPower)) => {
                info!("Battery recovered to {}, resuming stream", transition.to);
                self.start_streaming();
            }
            _ => {}
        }
    }

    /// Frame tick: maybe capture and load a frame.
    pub async fn on_frame_tick(&mut self, now: Instant) {
        if self.state == StreamState::Paused(PauseReason::LinkStalled)
            && self.retry_at.is_some_and(|at| now >= at)
        {
            info!("Link backoff elapsed, resuming stream");
            self.start_streaming();
        }

        let inputs = SchedulerInputs {
            frame_in_flight: self.session.is_in_flight(),
            power: self.battery.current_state(),
            connection: self.transport.state(),
        };
        match self.scheduler.tick(now, &inputs) {
            SchedulerDecision::Capture => self.capture_frame().await,
            SchedulerDecision::Skip(SkipReason::FrameInFlight) => {
                StreamStats::bump(&self.stats.backpressure_skips);
            }
            SchedulerDecision::Skip(_) => {}
        }
    }

    async fn capture_frame(&mut self) {
        match self.source.capture().await {
            Ok(frame) => {
                self.consecutive_unavailable = 0;
                if self.capture_degraded {
                    info!("Camera recovered");
                    self.capture_degraded = false;
                    self.stats.capture_degraded.store(false, Ordering::Relaxed);
                }
                StreamStats::bump(&self.stats.frames.captured);

                let seq = frame.seq();
                match self.chunker.begin(frame) {
                    Ok(chunks) => {
                        if let Err(chunks) = self.session.load(chunks) {
                            warn!("Frame {} captured while another is in flight", chunks.frame_seq());
                            StreamStats::bump(&self.stats.frames.dropped);
                        }
                    }
                    Err(ChunkError::EmptyFrame) => debug!("Frame {} is empty, skipping", seq),
                    Err(e) => {
                        warn!("Cannot chunk frame {}: {}", seq, e);
                        StreamStats::bump(&self.stats.frames.dropped);
                    }
                }
            }
            Err(CaptureError::SensorFault) => {
                warn!("Camera sensor fault, retrying next tick");
                StreamStats::bump(&self.stats.capture_failures);
            }
            Err(CaptureError::Unavailable) => {
                StreamStats::bump(&self.stats.capture_failures);
                self.consecutive_unavailable += 1;
                if self.consecutive_unavailable >= self.limits.max_unavailable
                    && !self.capture_degraded
                {
                    error!(
                        "Camera unavailable for {} consecutive captures, capture degraded",
                        self.consecutive_unavailable
                    );
                    self.capture_degraded = true;
                    self.stats.capture_degraded.store(true, Ordering::Relaxed);
                }
            }
        }
    }

    /// Send the head chunk of the frame in flight and handle the outcome.
    pub async fn pump_chunk(&mut self) {
        let Some(chunk) = self.session.front() else {
            return;
        };
        let result = self.transport.send(chunk).await;

        match result {
            Ok(id) => {
                StreamStats::bump(&self.stats.chunks_sent);
                if let Some(seq) = self.session.ack(id) {
                    StreamStats::bump(&self.stats.frames.sent);
                    debug!("Frame {} delivered", seq);
                }
            }
            Err(SendError::Timeout) => {
                StreamStats::bump(&self.stats.send_timeouts);
                let timeouts = self.session.record_timeout();
                if timeouts >= self.limits.max_send_timeouts {
                    error!(
                        "{} consecutive send timeouts, pausing for {:?}",
                        timeouts, self.limits.link_retry_backoff
                    );
                    self.pause(PauseReason::LinkStalled);
                    self.retry_at = Some(Instant::now() + self.limits.link_retry_backoff);
                } else {
                    warn!("Send timeout, retrying chunk");
                }
            }
            Err(SendError::LinkLost) | Err(SendError::NotConnected) => {
                // The disconnect event that follows moves the state to Idle
                self.drop_in_flight();
            }
            Err(SendError::Link(e)) => {
                warn!("Link refused chunk: {}", e);
                self.drop_in_flight();
            }
        }
    }

    /// Enter Streaming, or Paused(CriticalPower) if the battery forbids it.
    fn start_streaming(&mut self) {
        self.retry_at = None;
        if self.battery.current_state() == PowerState::Critical {
            if self.state != StreamState::Paused(PauseReason::CriticalPower) {
                warn!("Battery critical, not starting stream");
                self.pause(PauseReason::CriticalPower);
            }
            return;
        }
        self.transport.mark_streaming();
        self.set_state(StreamState::Streaming);
    }

    fn pause(&mut self, reason: PauseReason) {
        self.drop_in_flight();
        if reason != PauseReason::LinkStalled {
            self.retry_at = None;
        }
        self.transport.mark_paused();
        self.set_state(StreamState::Paused(reason));
    }

    fn on_disconnect(&mut self) {
        self.drop_in_flight();
        self.session.reset();
        self.source.reset_sequence();
        self.scheduler.reset();
        self.retry_at = None;
        self.stats.mtu.store(0, Ordering::Relaxed);
        self.set_state(StreamState::Idle);
    }

    fn drop_in_flight(&mut self) {
        if let Some(seq) = self.session.drop_frame() {
            info!("Dropped frame {} in flight", seq);
            StreamStats::bump(&self.stats.frames.dropped);
        }
    }

    fn set_state(&mut self, state: StreamState) {
        if self.state != state {
            info!("Stream {} -> {}", self.state, state);
            self.state = state;
            self.stats.set_state(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::{Chunk, SimulatedLink, SimulatedPeer};
    use crate::camera::SimulatedCamera;
    use crate::config::FrameSize;
    use crate::power::SimulatedBattery;

    type TestController = StreamController<SimulatedCamera, SimulatedBattery, SimulatedLink>;

    struct Harness {
        controller: TestController,
        camera: SimulatedCamera,
        battery: SimulatedBattery,
        peer: SimulatedPeer,
    }

    fn config() -> StreamConfig {
        StreamConfig {
            frame_size: FrameSize::Qqvga,
            ..StreamConfig::default()
        }
    }

    fn harness(config: StreamConfig) -> Harness {
        let camera = SimulatedCamera::new(config.frame_size, config.jpeg_quality);
        let battery = SimulatedBattery::new(3.9);
        let (link, peer, events) = SimulatedLink::pair();
        let controller = StreamController::new(
            &config,
            camera.clone(),
            battery.clone(),
            link,
            events,
            Arc::new(StreamStats::new()),
        )
        .unwrap();
        Harness {
            controller,
            camera,
            battery,
            peer,
        }
    }

    impl Harness {
        /// Feed every queued transport event to the controller.
        async fn drain_events(&mut self) {
            while let Ok(Some(event)) = tokio::time::timeout(
                Duration::from_millis(1),
                self.controller.transport.next_event(),
            )
            .await
            {
                self.controller.handle_transport_event(event);
            }
        }

        async fn connect(&mut self, mtu: u16) {
            self.peer.connect(mtu);
            self.drain_events().await;
        }

        async fn pump_all(&mut self) {
            while self.controller.state == StreamState::Streaming
                && self.controller.session.is_in_flight()
            {
                self.controller.pump_chunk().await;
            }
        }

        async fn tick(&mut self) {
            self.controller.on_frame_tick(Instant::now()).await;
        }
    }

    fn assert_no_interleaving(chunks: &[Chunk]) {
        let mut finished: Vec<u32> = Vec::new();
        let mut current: Option<(u32, u16)> = None;
        for chunk in chunks {
            assert!(
                !finished.contains(&chunk.frame_seq()),
                "frame {} resumed after another frame started",
                chunk.frame_seq()
            );
            match current {
                Some((seq, _)) if seq != chunk.frame_seq() => {
                    finished.push(seq);
                }
                _ => {}
            }
            current = Some((chunk.frame_seq(), chunk.index()));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_auto_starts() {
        let mut h = harness(config());
        assert_eq!(h.controller.state(), StreamState::Idle);
        h.connect(100).await;
        assert_eq!(h.controller.state(), StreamState::Streaming);
        assert_eq!(h.controller.connection(), ConnectionState::Streaming { mtu: 100 });
        assert_eq!(h.controller.stats().snapshot().mtu, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_command_without_auto_start() {
        let mut h = harness(StreamConfig {
            auto_start: false,
            ..config()
        });
        h.connect(100).await;
        assert_eq!(h.controller.state(), StreamState::Connected);

        h.tick().await;
        assert_eq!(h.camera.grabs(), 0);

        h.peer.send_command("start");
        h.drain_events().await;
        assert_eq!(h.controller.state(), StreamState::Streaming);
    }

    #[tokio::test(start_paused = true)]
    async fn test_frame_is_chunked_and_sent_in_order() {
        let mut h = harness(config());
        h.connect(100).await;

        h.tick().await;
        assert!(h.controller.frame_in_flight());
        h.pump_all().await;
        assert!(!h.controller.frame_in_flight());

        let chunks = h.peer.chunks();
        let expected = h.camera.nominal_frame_len().div_ceil(92);
        assert_eq!(chunks.len(), expected);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.frame_seq(), 0);
            assert_eq!(usize::from(chunk.index()), i);
            assert!(chunk.payload().len() <= 92);
        }
        assert!(chunks.last().unwrap().is_final());

        let snapshot = h.controller.stats().snapshot();
        assert_eq!(snapshot.frames.captured, 1);
        assert_eq!(snapshot.frames.sent, 1);
        assert_eq!(snapshot.chunks_sent as usize, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backpressure_skips_capture() {
        let mut h = harness(config());
        h.connect(100).await;

        h.tick().await;
        assert_eq!(h.camera.grabs(), 1);
        // Frame still in flight: further ticks must not capture
        h.tick().await;
        h.tick().await;
        assert_eq!(h.camera.grabs(), 1);
        assert_eq!(h.controller.stats().snapshot().backpressure_skips, 2);

        h.pump_all().await;
        h.tick().await;
        assert_eq!(h.camera.grabs(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_interleaving_across_frames() {
        let mut h = harness(config());
        h.connect(64).await;

        for _ in 0..4 {
            h.tick().await;
            // Half the frame, then a tick that must be refused
            for _ in 0..3 {
                h.controller.pump_chunk().await;
            }
            h.tick().await;
            h.pump_all().await;
        }

        let chunks = h.peer.chunks();
        assert_no_interleaving(&chunks);
        let seqs: Vec<u32> = chunks.iter().filter(|c| c.is_final()).map(Chunk::frame_seq).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_timeouts_pause_and_drop_frame() {
        let mut h = harness(config());
        h.connect(100).await;
        h.tick().await;

        h.controller.pump_chunk().await;
        h.peer.stall_next_writes(1);
        h.controller.pump_chunk().await;
        assert_eq!(h.controller.state(), StreamState::Streaming);
        assert!(h.controller.frame_in_flight());

        h.controller.pump_chunk().await;
        assert_eq!(h.controller.state(), StreamState::Paused(PauseReason::LinkStalled));
        assert!(!h.controller.frame_in_flight());

        // Chunk 1 never left the radio, so it was not written again
        let indices: Vec<u16> = h.peer.chunks().iter().map(Chunk::index).collect();
        assert_eq!(indices, vec![0, 1]);

        let snapshot = h.controller.stats().snapshot();
        assert_eq!(snapshot.send_timeouts, 2);
        assert_eq!(snapshot.frames.dropped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_timeout_confirmed_late() {
        let mut h = harness(config());
        h.connect(100).await;
        h.tick().await;

        h.peer.stall_next_writes(1);
        h.controller.pump_chunk().await;
        h.peer.release_stalled();
        h.pump_all().await;

        assert_eq!(h.controller.state(), StreamState::Streaming);
        let indices: Vec<u16> = h.peer.chunks().iter().map(Chunk::index).collect();
        assert_eq!(&indices[..2], &[0, 1]);
        let snapshot = h.controller.stats().snapshot();
        assert_eq!(snapshot.send_timeouts, 1);
        assert_eq!(snapshot.frames.sent, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_timeout_then_failure_rewrites_chunk() {
        let mut h = harness(config());
        h.connect(100).await;
        h.tick().await;

        h.peer.stall_next_writes(1);
        h.controller.pump_chunk().await;
        h.peer.fail_stalled();
        h.pump_all().await;

        assert_eq!(h.controller.state(), StreamState::Streaming);
        let indices: Vec<u16> = h.peer.chunks().iter().map(Chunk::index).collect();
        assert_eq!(&indices[..3], &[0, 0, 1]);
        assert_eq!(h.controller.stats().snapshot().frames.sent, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_stall_retries_after_backoff() {
        let mut h = harness(config());
        h.connect(100).await;
        h.tick().await;
        h.peer.stall_next_writes(2);
        h.controller.pump_chunk().await;
        h.controller.pump_chunk().await;
        assert_eq!(h.controller.state(), StreamState::Paused(PauseReason::LinkStalled));

        h.tick().await;
        assert_eq!(h.controller.state(), StreamState::Paused(PauseReason::LinkStalled));

        tokio::time::advance(Duration::from_millis(2000)).await;
        h.tick().await;
        assert_eq!(h.controller.state(), StreamState::Streaming);
        assert!(h.controller.frame_in_flight());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_resets_session() {
        let mut h = harness(config());
        h.connect(100).await;
        h.tick().await;
        h.pump_all().await;
        h.tick().await;
        h.controller.pump_chunk().await;
        assert!(h.controller.frame_in_flight());

        h.peer.disconnect();
        h.drain_events().await;
        assert_eq!(h.controller.state(), StreamState::Idle);
        assert!(!h.controller.frame_in_flight());
        assert_eq!(h.controller.connection(), ConnectionState::Disconnected);

        h.peer.clear_written();
        h.connect(100).await;
        h.tick().await;
        h.pump_all().await;
        let chunks = h.peer.chunks();
        assert!(!chunks.is_empty());
        assert!(chunks.iter().all(|c| c.frame_seq() == 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_during_send() {
        let mut h = harness(config());
        h.connect(100).await;
        h.tick().await;

        h.peer.disconnect_after_writes(2);
        h.controller.pump_chunk().await;
        h.controller.pump_chunk().await;
        assert!(!h.controller.frame_in_flight());

        h.drain_events().await;
        assert_eq!(h.controller.state(), StreamState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_power_pauses_and_recovers() {
        let mut h = harness(config());
        h.connect(100).await;
        h.controller.on_battery_tick();
        h.tick().await;
        assert!(h.controller.frame_in_flight());

        h.battery.set_volts(3.0);
        h.controller.on_battery_tick();
        assert_eq!(h.controller.state(), StreamState::Paused(PauseReason::CriticalPower));
        assert!(!h.controller.frame_in_flight());

        let grabs = h.camera.grabs();
        h.tick().await;
        assert_eq!(h.camera.grabs(), grabs);

        // Inside the recovery margin
        h.battery.set_volts(3.15);
        h.controller.on_battery_tick();
        assert_eq!(h.controller.state(), StreamState::Paused(PauseReason::CriticalPower));

        h.battery.set_volts(3.25);
        h.controller.on_battery_tick();
        assert_eq!(h.controller.state(), StreamState::Streaming);
        assert_eq!(h.controller.power_state(), PowerState::Low);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_refused_on_critical_power() {
        let mut h = harness(config());
        h.battery.set_volts(3.0);
        h.controller.on_battery_tick();
        h.connect(100).await;
        assert_eq!(h.controller.state(), StreamState::Paused(PauseReason::CriticalPower));
    }

    #[tokio::test(start_paused = true)]
    async fn test_low_power_halves_capture_rate() {
        let mut h = harness(config());
        h.connect(244).await;
        h.battery.set_volts(3.2);
        h.controller.on_battery_tick();
        assert_eq!(h.controller.power_state(), PowerState::Low);

        let period = h.controller.scheduler.period();
        for _ in 0..6 {
            h.tick().await;
            h.pump_all().await;
            tokio::time::advance(period).await;
        }
        assert_eq!(h.camera.grabs(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_viewer_pause_resume_stop() {
        let mut h = harness(config());
        h.connect(100).await;
        h.tick().await;

        h.controller.handle_command(ViewerCommand::Pause);
        assert_eq!(h.controller.state(), StreamState::Paused(PauseReason::Viewer));
        assert!(!h.controller.frame_in_flight());

        // Power recovery does not override a viewer pause
        h.battery.set_volts(3.0);
        h.controller.on_battery_tick();
        h.battery.set_volts(3.9);
        h.controller.on_battery_tick();
        assert_eq!(h.controller.state(), StreamState::Paused(PauseReason::Viewer));

        h.controller.handle_command(ViewerCommand::Resume);
        assert_eq!(h.controller.state(), StreamState::Streaming);

        h.tick().await;
        h.controller.handle_command(ViewerCommand::Stop);
        assert_eq!(h.controller.state(), StreamState::Connected);
        assert!(!h.controller.frame_in_flight());
        assert_eq!(h.controller.connection(), ConnectionState::Connected { mtu: 100 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_mtu_renegotiation_applies_to_next_frame() {
        let mut h = harness(config());
        h.connect(100).await;
        h.tick().await;
        h.controller.pump_chunk().await;

        h.peer.change_mtu(200);
        h.drain_events().await;
        h.pump_all().await;
        let first: Vec<Chunk> = h.peer.chunks();
        assert!(first.iter().all(|c| c.frame_seq() == 0 && c.payload().len() <= 92));

        h.peer.clear_written();
        h.tick().await;
        h.pump_all().await;
        let second = h.peer.chunks();
        assert!(second.iter().any(|c| c.payload().len() > 92));
        assert!(second.iter().all(|c| c.payload().len() <= 192));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mtu_shrink_drops_frame_in_flight() {
        let mut h = harness(config());
        h.connect(200).await;
        h.tick().await;
        h.controller.pump_chunk().await;

        h.peer.change_mtu(50);
        h.drain_events().await;
        // The remaining chunks no longer fit
        h.controller.pump_chunk().await;
        assert!(!h.controller.frame_in_flight());
        assert_eq!(h.controller.state(), StreamState::Streaming);
        assert_eq!(h.controller.stats().snapshot().frames.dropped, 1);

        h.peer.clear_written();
        h.tick().await;
        h.pump_all().await;
        let chunks = h.peer.chunks();
        assert!(!chunks.is_empty());
        assert!(chunks.iter().all(|c| c.frame_seq() == 1 && c.payload().len() <= 42));
        assert_eq!(h.controller.stats().snapshot().frames.sent, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_connect_keeps_streaming() {
        let mut h = harness(config());
        h.connect(100).await;
        h.connect(100).await;
        assert_eq!(h.controller.state(), StreamState::Streaming);
        assert_eq!(h.controller.connection(), ConnectionState::Streaming { mtu: 100 });

        for _ in 0..3 {
            h.tick().await;
            h.pump_all().await;
        }
        assert_eq!(h.camera.grabs(), 3);
        assert_eq!(h.controller.stats().snapshot().frames.sent, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mtu_capped_by_config() {
        let mut h = harness(StreamConfig {
            ble_max_mtu: 64,
            ..config()
        });
        h.connect(500).await;
        h.tick().await;
        h.pump_all().await;
        assert!(h.peer.chunks().iter().all(|c| c.payload().len() <= 56));
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_degraded_after_repeated_unavailable() {
        let mut h = harness(config());
        h.connect(100).await;
        for _ in 0..5 {
            h.camera.push_outcome(Err(CaptureError::Unavailable));
        }

        for _ in 0..4 {
            h.tick().await;
        }
        assert!(!h.controller.is_capture_degraded());
        h.tick().await;
        assert!(h.controller.is_capture_degraded());
        assert!(h.controller.stats().snapshot().capture_degraded);
        assert_eq!(h.controller.state(), StreamState::Streaming);

        h.tick().await;
        assert!(!h.controller.is_capture_degraded());
        assert!(h.controller.frame_in_flight());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sensor_fault_does_not_escalate() {
        let mut h = harness(config());
        h.connect(100).await;
        for _ in 0..8 {
            h.camera.push_outcome(Err(CaptureError::SensorFault));
        }
        for _ in 0..8 {
            h.tick().await;
        }
        assert!(!h.controller.is_capture_degraded());
        assert_eq!(h.controller.stats().snapshot().capture_failures, 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_frame_is_skipped() {
        let mut h = harness(config());
        h.connect(100).await;
        h.camera.push_outcome(Ok(0));
        h.tick().await;
        assert!(!h.controller.frame_in_flight());
        assert!(h.peer.written().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_streams_until_cancelled() {
        let h = harness(config());
        let Harness {
            mut controller,
            peer,
            ..
        } = h;
        let cancel = CancellationToken::new();

        peer.connect(244);
        let stop = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            stop.cancel();
        });
        controller.run(cancel).await;

        let chunks = peer.chunks();
        assert!(!chunks.is_empty());
        assert_no_interleaving(&chunks);
        let snapshot = controller.stats().snapshot();
        assert!(snapshot.frames.sent >= 2);
        assert!(!controller.frame_in_flight());
    }
}
