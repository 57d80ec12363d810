//! Multi-mode averaging read.
//!
//! `averaging_read` draws scalar samples from a [`MeasurementSource`] until
//! the stop rule of the selected [`UseCase`] fires, then reports the mean,
//! standard error and 95% confidence interval. The use case is a pure
//! function of which `SamplingConfig` fields are zero:
//!
//! | std_err | timeout | max_s | use case       |
//! |---------|---------|-------|----------------|
//! | 0       | 0       | any   | MinSamples     |
//! | 0       | > 0     | any   | Timeout        |
//! | > 0     | 0       | any   | MaxSamples     |
//! | > 0     | > 0     | 0     | MinToTimeout   |
//! | > 0     | > 0     | > 0   | MovingWindow   |
//!
//! Sampling never sleeps on its own; the pace is set by the source latency.

use crate::error::AppResult;
use crate::instrument::MeasurementSource;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, instrument};

/// z-value for a two-sided 95% interval.
pub const Z_95: f64 = 1.96;

/// Stop rule configuration for [`averaging_read`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Minimum number of samples.
    #[serde(default = "default_min_s")]
    pub min_s: usize,
    /// Maximum samples (MaxSamples) or window size (MovingWindow).
    #[serde(default)]
    pub max_s: usize,
    /// Target standard error; 0 disables the statistical stop rules.
    #[serde(default)]
    pub std_err: f64,
    /// Time budget; zero disables the time-based stop rules.
    #[serde(default, with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_min_s() -> usize {
    1
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            min_s: default_min_s(),
            max_s: 0,
            std_err: 0.0,
            timeout: Duration::ZERO,
        }
    }
}

impl SamplingConfig {
    /// Exactly `min_s` samples, no statistics.
    pub fn min_samples(min_s: usize) -> Self {
        Self {
            min_s,
            ..Default::default()
        }
    }

    /// Stop rule implied by which fields are zero.
    pub fn use_case(&self) -> UseCase {
        UseCase::select(self)
    }
}

/// Stop rule for [`averaging_read`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UseCase {
    /// Stop after `min_s` samples.
    MinSamples,
    /// Stop once the standard error is small enough, fail at `max_s`.
    MaxSamples,
    /// Sample for the whole timeout, then judge the standard error.
    MinToTimeout,
    /// Judge the first `max_s` samples, fail at timeout.
    MovingWindow,
    /// Sample for the whole timeout, always succeed.
    Timeout,
}

impl UseCase {
    /// Pick the rule from the zero pattern of `std_err`, `timeout` and `max_s`.
    pub fn select(config: &SamplingConfig) -> Self {
        let has_std_err = config.std_err > 0.0;
        let has_timeout = !config.timeout.is_zero();
        match (has_std_err, has_timeout) {
            (false, false) => UseCase::MinSamples,
            (false, true) => UseCase::Timeout,
            (true, false) => UseCase::MaxSamples,
            (true, true) if config.max_s == 0 => UseCase::MinToTimeout,
            (true, true) => UseCase::MovingWindow,
        }
    }
}

impl fmt::Display for UseCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UseCase::MinSamples => "MIN_SAMPLES",
            UseCase::MaxSamples => "MAX_SAMPLES",
            UseCase::MinToTimeout => "MIN_TO_TIMEOUT",
            UseCase::MovingWindow => "MOVING_WINDOW",
            UseCase::Timeout => "TIMEOUT",
        };
        f.write_str(name)
    }
}

/// Outcome of one averaging read.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StdErrResult {
    /// The stop rule was met, rather than a limit reached.
    pub success: bool,
    /// Samples taken.
    pub n: usize,
    /// Mean of the samples.
    pub mean: f64,
    /// Standard error of the mean; 0 for fewer than two samples.
    pub std_err: f64,
    /// `mean + 1.96 std_err`
    pub ci95_upper: f64,
    /// `mean - 1.96 std_err`
    pub ci95_lower: f64,
    /// Wall time of the read.
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
}

impl StdErrResult {
    fn from_samples(samples: &[f64], success: bool, elapsed: Duration) -> Self {
        let mean = mean(samples);
        let std_err = std_err(samples);
        Self {
            success,
            n: samples.len(),
            mean,
            std_err,
            ci95_upper: mean + Z_95 * std_err,
            ci95_lower: mean - Z_95 * std_err,
            elapsed,
        }
    }
}

/// Arithmetic mean; 0 for no samples.
pub fn mean(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().sum::<f64>() / samples.len() as f64
}

/// Sample standard deviation over √N; 0 for N ≤ 1.
pub fn std_err(samples: &[f64]) -> f64 {
    let n = samples.len();
    if n <= 1 {
        return 0.0;
    }
    let m = mean(samples);
    let var = samples.iter().map(|s| (s - m).powi(2)).sum::<f64>() / (n - 1) as f64;
    var.sqrt() / (n as f64).sqrt()
}

/// Samples gathered by one call to [`averaging_read`].
struct SamplingSession<'a> {
    config: &'a SamplingConfig,
    use_case: UseCase,
    samples: Vec<f64>,
}

impl<'a> SamplingSession<'a> {
    fn new(config: &'a SamplingConfig) -> Self {
        Self {
            config,
            use_case: config.use_case(),
            samples: Vec::new(),
        }
    }

    /// Samples the statistics are judged on.
    fn judged(&self) -> &[f64] {
        match self.use_case {
            // The window is the first `max_s` samples and never slides.
            UseCase::MovingWindow if self.samples.len() >= self.config.max_s => {
                &self.samples[..self.config.max_s]
            }
            _ => &self.samples,
        }
    }

    /// `Some(success)` once the use case's stop rule fires.
    fn evaluate(&self, elapsed: Duration) -> Option<bool> {
        let cfg = self.config;
        let n = self.samples.len();
        let within = |samples: &[f64]| std_err(samples) <= cfg.std_err;
        match self.use_case {
            UseCase::MinSamples => (n >= cfg.min_s.max(1)).then_some(true),
            UseCase::MaxSamples => {
                if n < cfg.min_s {
                    None
                } else if within(&self.samples) {
                    Some(true)
                } else if n >= cfg.max_s.max(cfg.min_s) {
                    Some(false)
                } else {
                    None
                }
            }
            UseCase::MinToTimeout => {
                (n >= cfg.min_s && elapsed >= cfg.timeout).then(|| within(&self.samples))
            }
            UseCase::MovingWindow => {
                if n < cfg.max_s {
                    None
                } else if within(self.judged()) {
                    Some(true)
                } else if elapsed >= cfg.timeout {
                    Some(false)
                } else {
                    None
                }
            }
            UseCase::Timeout => (elapsed >= cfg.timeout).then_some(true),
        }
    }
}

/// Read `source` repeatedly until the configured stop rule fires.
///
/// A read error aborts the whole call. Statistics in the result cover every
/// sample taken, except in MovingWindow where they cover the judged window.
#[instrument(level = "debug", skip(source), fields(use_case = %config.use_case()))]
pub async fn averaging_read<S>(config: &SamplingConfig, source: &S) -> AppResult<StdErrResult>
where
    S: MeasurementSource + ?Sized,
{
    let mut session = SamplingSession::new(config);
    let start = Instant::now();
    loop {
        let value = source.read().await?;
        session.samples.push(value);
        let elapsed = start.elapsed();
        if let Some(success) = session.evaluate(elapsed) {
            let result = StdErrResult::from_samples(session.judged(), success, elapsed);
            debug!(
                success,
                n = session.samples.len(),
                mean = result.mean,
                std_err = result.std_err,
                "averaging read finished"
            );
            return Ok(result);
        }
    }
}
