//! Probabilistic bisection set-point search.
//!
//! The controller keeps a belief density over the output range. Every
//! measurement tells it, with probability `p`, on which side of the current
//! output the answer lies; the side the error points to is multiplied by
//! `2p` and the other by `2q = 2(1 - p)`. The next output is the median of the
//! updated density. Because the update is soft, a single noisy reading on the
//! wrong side does not lose the target the way a hard bisection would.

use super::state::ControllerState;
use super::{validate_common, SetpointController, Slope};
use crate::error::{AppResult, BenchError};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// Probability that a measurement points the right way.
pub const DEFAULT_P: f64 = 0.65;

/// Settings for [`PbaController`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PbaConfig {
    /// Target measured value.
    pub setpoint: f64,
    /// Converged once `|measured - setpoint|` is within this.
    pub tolerance: f64,
    /// Search domain, `(min, max)`.
    pub output_range: (f64, f64),
    /// Smallest output change worth making.
    #[serde(default = "default_min_resolution")]
    pub min_resolution: f64,
    /// Measurements before giving up.
    #[serde(default = "default_max_iter")]
    pub max_iter: u32,
    /// Plant direction. Attenuator-style by default.
    #[serde(default = "default_slope")]
    pub slope: Slope,
    /// Probability a reading points the right way, in `(0.5, 1)`.
    #[serde(default = "default_p")]
    pub p: f64,
}

fn default_min_resolution() -> f64 {
    1e-3
}

fn default_max_iter() -> u32 {
    25
}

fn default_slope() -> Slope {
    Slope::Decreasing
}

fn default_p() -> f64 {
    DEFAULT_P
}

impl PbaConfig {
    /// Defaults for everything but the target and the domain.
    pub fn new(setpoint: f64, tolerance: f64, output_range: (f64, f64)) -> Self {
        Self {
            setpoint,
            tolerance,
            output_range,
            min_resolution: default_min_resolution(),
            max_iter: default_max_iter(),
            slope: default_slope(),
            p: default_p(),
        }
    }

    /// Give up after `max_iter` measurements.
    pub fn with_max_iter(mut self, max_iter: u32) -> Self {
        self.max_iter = max_iter;
        self
    }

    /// Skip output changes smaller than this.
    pub fn with_min_resolution(mut self, min_resolution: f64) -> Self {
        self.min_resolution = min_resolution;
        self
    }

    /// Override the plant direction.
    pub fn with_slope(mut self, slope: Slope) -> Self {
        self.slope = slope;
        self
    }

    /// Reject settings the update rule cannot work with.
    pub fn validate(&self) -> AppResult<()> {
        validate_common(self.output_range, self.tolerance, self.max_iter)?;
        if !(self.p > 0.5 && self.p < 1.0) {
            return Err(BenchError::Configuration(format!(
                "PBA p must be in (0.5, 1), got {}",
                self.p
            )));
        }
        if self.min_resolution < 0.0 {
            return Err(BenchError::Configuration(format!(
                "min_resolution must not be negative, got {}",
                self.min_resolution
            )));
        }
        Ok(())
    }
}

/// Piecewise-constant density over the output domain.
///
/// `pdf[i]` is the weight on the open interval `(limits[i], limits[i + 1])`.
/// Limits are strictly increasing and weights never negative; the total mass
/// is not normalized.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbabilityDistribution {
    limits: Vec<f64>,
    pdf: Vec<f64>,
}

impl ProbabilityDistribution {
    /// Flat density over `[min, max]`.
    pub fn uniform(min: f64, max: f64) -> Self {
        Self {
            limits: vec![min, max],
            pdf: vec![1.0 / (max - min)],
        }
    }

    /// Breakpoints, strictly increasing.
    pub fn limits(&self) -> &[f64] {
        &self.limits
    }

    /// Weight on each interval between consecutive limits.
    pub fn pdf(&self) -> &[f64] {
        &self.pdf
    }

    /// Integral of the density.
    pub fn total_mass(&self) -> f64 {
        self.masses().sum()
    }

    fn masses(&self) -> impl Iterator<Item = f64> + '_ {
        self.pdf
            .iter()
            .zip(self.limits.windows(2))
            .map(|(w, lim)| w * (lim[1] - lim[0]))
    }

    /// Insert a breakpoint at `x` (if it falls strictly inside an interval)
    /// and scale the weights below `x` by `below` and above it by `above`.
    pub fn split_at(&mut self, x: f64, below: f64, above: f64) {
        if let Some(i) = self
            .limits
            .windows(2)
            .position(|lim| lim[0] < x && x < lim[1])
        {
            self.limits.insert(i + 1, x);
            self.pdf.insert(i + 1, self.pdf[i]);
        }
        for (weight, lim) in self.pdf.iter_mut().zip(self.limits.windows(2)) {
            *weight *= if lim[1] <= x { below } else { above };
        }
    }

    /// Inverse of the piecewise-linear cumulative distribution at 0.5.
    pub fn median(&self) -> f64 {
        let half = self.total_mass() * 0.5;
        let mut cumulative = 0.0;
        for (i, mass) in self.masses().enumerate() {
            if self.pdf[i] > 0.0 && cumulative + mass >= half {
                return self.limits[i] + (half - cumulative) / self.pdf[i];
            }
            cumulative += mass;
        }
        // Only reachable with zero total mass.
        (self.limits[0] + self.limits[self.limits.len() - 1]) * 0.5
    }
}

/// Probabilistic bisection controller.
pub struct PbaController {
    config: PbaConfig,
    state: ControllerState,
    distribution: ProbabilityDistribution,
}

impl PbaController {
    /// Validate `config` and start at the median of a flat density.
    pub fn new(config: PbaConfig) -> AppResult<Self> {
        config.validate()?;
        let (min, max) = config.output_range;
        let distribution = ProbabilityDistribution::uniform(min, max);
        let state = ControllerState::new(
            config.setpoint,
            config.tolerance,
            config.output_range,
            config.max_iter,
            distribution.median(),
        );
        Ok(Self {
            config,
            state,
            distribution,
        })
    }

    /// Settings the controller was built with.
    pub fn config(&self) -> &PbaConfig {
        &self.config
    }

    /// Current belief density.
    pub fn distribution(&self) -> &ProbabilityDistribution {
        &self.distribution
    }
}

impl SetpointController for PbaController {
    fn process(&mut self, measured: f64) -> f64 {
        let error = measured - self.state.setpoint;
        self.state.record(error);

        if error.abs() < self.state.tolerance {
            self.state.done = true;
        } else if self.state.iter > self.state.max_iter {
            // Oscillating around the target is good enough.
            self.state.done = true;
            self.state.fail = self.state.mean_recent_error().abs() >= self.state.tolerance;
        } else {
            let p = self.config.p;
            let q = 1.0 - p;
            let output = self.state.output;
            if self.config.slope.correction(error) > 0.0 {
                self.distribution.split_at(output, 2.0 * q, 2.0 * p);
            } else {
                self.distribution.split_at(output, 2.0 * p, 2.0 * q);
            }
            let median = self.distribution.median();
            trace!(iter = self.state.iter, error, median, "pba update");
            if (median - output).abs() < self.config.min_resolution {
                self.state.done = true;
            } else {
                self.state.output = self.state.clamp(median);
            }
        }

        if self.state.done {
            if error.abs() > self.state.best_error {
                self.state.output = self.state.best_output;
            }
            debug!(
                iter = self.state.iter,
                output = self.state.output,
                error,
                fail = self.state.fail,
                "pba finished"
            );
        }
        self.state.iter += 1;
        self.state.output
    }

    fn reset(&mut self) {
        let (min, max) = self.config.output_range;
        self.distribution = ProbabilityDistribution::uniform(min, max);
        self.state.reset(self.distribution.median());
    }

    fn state(&self) -> &ControllerState {
        &self.state
    }
}
