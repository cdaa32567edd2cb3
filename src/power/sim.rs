//! Simulated battery for host runs and tests.

use super::{SampleError, VoltageSensor};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug)]
struct Inner {
    volts: f32,
    /// Voltage lost per reading (models discharge on host runs).
    drain_per_sample: f32,
    fail_next: u32,
}

/// Battery whose voltage is set by the test or drains linearly.
///
/// Clones share state.
#[derive(Debug, Clone)]
pub struct SimulatedBattery {
    inner: Arc<Mutex<Inner>>,
}

impl SimulatedBattery {
    /// Battery holding a constant voltage.
    pub fn new(volts: f32) -> Self {
        Self::draining(volts, 0.0)
    }

    /// Battery that loses `drain_per_sample` volts on every reading.
    pub fn draining(volts: f32, drain_per_sample: f32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                volts,
                drain_per_sample,
                fail_next: 0,
            })),
        }
    }

    /// Set the voltage returned by subsequent readings.
    pub fn set_volts(&self, volts: f32) {
        self.lock().volts = volts;
    }

    /// Make the next `count` readings fail.
    pub fn fail_next(&self, count: u32) {
        self.lock().fail_next = count;
    }

    /// Current simulated voltage.
    pub fn volts(&self) -> f32 {
        self.lock().volts
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl VoltageSensor for SimulatedBattery {
    fn read_volts(&mut self) -> Result<f32, SampleError> {
        let mut inner = self.lock();
        if inner.fail_next > 0 {
            inner.fail_next -= 1;
            return Err(SampleError::Adc("simulated glitch".to_string()));
        }
        let volts = inner.volts;
        inner.volts = (inner.volts - inner.drain_per_sample).max(0.0);
        Ok(volts)
    }
}
