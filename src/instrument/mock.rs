//! Simulated instruments for tests and the `simulated` bench backend.
//!
//! - `NoisySource` - a reader returning a fixed mean plus uniform noise
//! - `SimulatedPlant` - an actuator whose output feeds a response function
//!   that a paired reader observes, for closing leveling loops offline
//!
//! Latency uses `tokio::time::sleep` so paused-clock tests stay deterministic.

use crate::error::{AppResult, BenchError};
use crate::instrument::capabilities::{Actuator, MeasurementSource};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::trace;

fn uniform_noise(amplitude: f64) -> f64 {
    if amplitude > 0.0 {
        rand::thread_rng().gen_range(-amplitude..=amplitude)
    } else {
        0.0
    }
}

/// Reader returning `mean ± noise` after an optional latency.
pub struct NoisySource {
    mean: Mutex<f64>,
    noise: f64,
    latency: Duration,
    reads: AtomicUsize,
    should_fail_next: AtomicBool,
}

impl NoisySource {
    /// Reads `mean` plus uniform noise in `+/- noise`, instantly.
    pub fn new(mean: f64, noise: f64) -> Self {
        Self {
            mean: Mutex::new(mean),
            noise,
            latency: Duration::ZERO,
            reads: AtomicUsize::new(0),
            should_fail_next: AtomicBool::new(false),
        }
    }

    /// Simulated time each read takes.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Move the reading's center.
    pub fn set_mean(&self, mean: f64) {
        *self.mean.lock() = mean;
    }

    /// Number of completed reads.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Make the next read fail.
    pub fn inject_next_failure(&self) {
        self.should_fail_next.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl MeasurementSource for NoisySource {
    async fn read(&self) -> AppResult<f64> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.should_fail_next.swap(false, Ordering::SeqCst) {
            return Err(BenchError::Measurement("injected failure".to_string()));
        }
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(*self.mean.lock() + uniform_noise(self.noise))
    }
}

type Response = Box<dyn Fn(f64) -> f64 + Send + Sync>;

/// Actuator + reader pair: `read()` returns `response(output) ± noise`.
pub struct SimulatedPlant {
    output: Mutex<f64>,
    range: (f64, f64),
    response: Response,
    noise: f64,
    writes: Mutex<Vec<f64>>,
}

impl SimulatedPlant {
    /// Plant accepting outputs in `range`, starting at its lower end.
    pub fn new(range: (f64, f64), response: impl Fn(f64) -> f64 + Send + Sync + 'static) -> Self {
        Self {
            output: Mutex::new(range.0),
            range,
            response: Box::new(response),
            noise: 0.0,
            writes: Mutex::new(Vec::new()),
        }
    }

    /// Add uniform noise of `+/- noise` to every reading.
    pub fn with_noise(mut self, noise: f64) -> Self {
        self.noise = noise;
        self
    }

    /// Last accepted output.
    pub fn output(&self) -> f64 {
        *self.output.lock()
    }

    /// Every value written through `set_output`, in order.
    pub fn writes(&self) -> Vec<f64> {
        self.writes.lock().clone()
    }
}

#[async_trait]
impl Actuator for SimulatedPlant {
    async fn set_output(&self, value: f64) -> AppResult<()> {
        let (min, max) = self.range;
        if !(min..=max).contains(&value) {
            return Err(BenchError::Actuator(format!(
                "output {} outside {}..={}",
                value, min, max
            )));
        }
        trace!(value, "plant output set");
        *self.output.lock() = value;
        self.writes.lock().push(value);
        Ok(())
    }
}

#[async_trait]
impl MeasurementSource for SimulatedPlant {
    async fn read(&self) -> AppResult<f64> {
        let output = *self.output.lock();
        Ok((self.response)(output) + uniform_noise(self.noise))
    }
}
