//! Capture cadence.
//!
//! The scheduler is asked once per frame period whether to capture. It holds
//! only the time of the last capture; everything else comes in through
//! [`SchedulerInputs`] so the decision is a pure function of its arguments.

use crate::ble::ConnectionState;
use crate::power::PowerState;
use log::trace;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Why a tick did not capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Connection is not in the Streaming state.
    NotStreaming,
    /// Battery is critical.
    CriticalPower,
    /// The previous frame is still being sent (backpressure).
    FrameInFlight,
    /// Low battery halves the frame rate.
    LowPowerThrottle,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotStreaming => "not streaming",
            Self::CriticalPower => "critical power",
            Self::FrameInFlight => "frame in flight",
            Self::LowPowerThrottle => "low power throttle",
        };
        f.write_str(s)
    }
}

/// Outcome of a scheduler tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerDecision {
    /// Capture a frame now.
    Capture,
    /// Do nothing this tick.
    Skip(SkipReason),
}

/// State the scheduler decides on.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerInputs {
    /// A frame is still being chunked and sent.
    pub frame_in_flight: bool,
    /// Current battery classification.
    pub power: PowerState,
    /// Current connection state.
    pub connection: ConnectionState,
}

/// Decides capture vs skip on every frame tick.
#[derive(Debug)]
pub struct FrameScheduler {
    period: Duration,
    last_capture: Option<Instant>,
}

impl FrameScheduler {
    /// Create a scheduler ticking every `period`.
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            last_capture: None,
        }
    }

    /// Nominal tick period.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Spacing between captures for a power state.
    pub fn effective_period(&self, power: PowerState) -> Duration {
        match power {
            PowerState::Low => self.period * 2,
            _ => self.period,
        }
    }

    /// Decide what to do on the tick at `now`.
    pub fn tick(&mut self, now: Instant, inputs: &SchedulerInputs) -> SchedulerDecision {
        let decision = self.decide(now, inputs);
        if decision == SchedulerDecision::Capture {
            self.last_capture = Some(now);
        }
        trace!("Scheduler tick: {:?}", decision);
        decision
    }

    fn decide(&self, now: Instant, inputs: &SchedulerInputs) -> SchedulerDecision {
        if !inputs.connection.is_streaming() {
            return SchedulerDecision::Skip(SkipReason::NotStreaming);
        }
        if inputs.power == PowerState::Critical {
            return SchedulerDecision::Skip(SkipReason::CriticalPower);
        }
        if inputs.frame_in_flight {
            return SchedulerDecision::Skip(SkipReason::FrameInFlight);
        }
        if inputs.power == PowerState::Low {
            if let Some(last) = self.last_capture {
                // Half a period of slack absorbs tick jitter
                let min_gap = self.effective_period(PowerState::Low) - self.period / 2;
                if now.saturating_duration_since(last) < min_gap {
                    return SchedulerDecision::Skip(SkipReason::LowPowerThrottle);
                }
            }
        }
        SchedulerDecision::Capture
    }

    /// Forget the last capture (new session).
    pub fn reset(&mut self) {
        self.last_capture = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PERIOD: Duration = Duration::from_millis(100);

    fn inputs(frame_in_flight: bool, power: PowerState) -> SchedulerInputs {
        SchedulerInputs {
            frame_in_flight,
            power,
            connection: ConnectionState::Streaming { mtu: 100 },
        }
    }

    #[test]
    fn test_captures_every_tick_when_normal() {
        let mut scheduler = FrameScheduler::new(PERIOD);
        let start = Instant::now();
        for i in 0..5 {
            assert_eq!(
                scheduler.tick(start + PERIOD * i, &inputs(false, PowerState::Normal)),
                SchedulerDecision::Capture
            );
        }
    }

    #[test]
    fn test_never_captures_with_frame_in_flight() {
        let mut scheduler = FrameScheduler::new(PERIOD);
        let start = Instant::now();
        for power in [PowerState::Normal, PowerState::Low] {
            for i in 0..4 {
                assert_eq!(
                    scheduler.tick(start + PERIOD * i, &inputs(true, power)),
                    SchedulerDecision::Skip(SkipReason::FrameInFlight)
                );
            }
        }
    }

    #[test]
    fn test_skips_when_not_streaming() {
        let mut scheduler = FrameScheduler::new(PERIOD);
        for connection in [
            ConnectionState::Disconnected,
            ConnectionState::Connected { mtu: 100 },
            ConnectionState::Paused { mtu: 100 },
        ] {
            let inputs = SchedulerInputs {
                frame_in_flight: false,
                power: PowerState::Normal,
                connection,
            };
            assert_eq!(
                scheduler.tick(Instant::now(), &inputs),
                SchedulerDecision::Skip(SkipReason::NotStreaming)
            );
        }
    }

    #[test]
    fn test_skips_on_critical_power() {
        let mut scheduler = FrameScheduler::new(PERIOD);
        assert_eq!(
            scheduler.tick(Instant::now(), &inputs(false, PowerState::Critical)),
            SchedulerDecision::Skip(SkipReason::CriticalPower)
        );
    }

    #[test]
    fn test_low_power_halves_rate() {
        let mut scheduler = FrameScheduler::new(PERIOD);
        let start = Instant::now();
        let decisions: Vec<SchedulerDecision> = (0..6)
            .map(|i| scheduler.tick(start + PERIOD * i, &inputs(false, PowerState::Low)))
            .collect();

        let captures = decisions
            .iter()
            .filter(|d| **d == SchedulerDecision::Capture)
            .count();
        assert_eq!(captures, 3);
        assert_eq!(decisions[0], SchedulerDecision::Capture);
        assert_eq!(
            decisions[1],
            SchedulerDecision::Skip(SkipReason::LowPowerThrottle)
        );
        assert_eq!(decisions[2], SchedulerDecision::Capture);
    }

    #[test]
    fn test_low_power_tolerates_jitter() {
        let mut scheduler = FrameScheduler::new(PERIOD);
        let start = Instant::now();
        scheduler.tick(start, &inputs(false, PowerState::Low));
        // Tick arrives slightly early
        let early = start + PERIOD * 2 - Duration::from_millis(5);
        assert_eq!(
            scheduler.tick(early, &inputs(false, PowerState::Low)),
            SchedulerDecision::Capture
        );
    }

    #[test]
    fn test_reset_forgets_last_capture() {
        let mut scheduler = FrameScheduler::new(PERIOD);
        let start = Instant::now();
        scheduler.tick(start, &inputs(false, PowerState::Low));
        scheduler.reset();
        assert_eq!(
            scheduler.tick(start + PERIOD, &inputs(false, PowerState::Low)),
            SchedulerDecision::Capture
        );
    }

    #[test]
    fn test_effective_period() {
        let scheduler = FrameScheduler::new(PERIOD);
        assert_eq!(scheduler.effective_period(PowerState::Normal), PERIOD);
        assert_eq!(scheduler.effective_period(PowerState::Low), PERIOD * 2);
    }
}
