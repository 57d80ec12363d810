//! Step-halving search for monotonic plants.

use super::state::ControllerState;
use super::{validate_common, SetpointController, Slope};
use crate::error::{AppResult, BenchError};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Settings for [`BinarySearchController`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinarySearchConfig {
    /// Allowed actuator output, `(min, max)`.
    pub output_range: (f64, f64),
    /// First step is half of this.
    pub initial_step: f64,
    /// Output before the first measurement.
    pub initial_output: f64,
    /// Target measured value.
    pub setpoint: f64,
    /// Converged once `|measured - setpoint|` is within this.
    pub tolerance: f64,
    /// Measurements before the search gives up.
    pub max_iter: u32,
    /// Whether more output raises or lowers the reading.
    #[serde(default = "default_slope")]
    pub slope: Slope,
}

fn default_slope() -> Slope {
    Slope::Increasing
}

impl BinarySearchConfig {
    /// Search over `output_range` starting at its midpoint with a step of half
    /// the range.
    pub fn new(setpoint: f64, tolerance: f64, output_range: (f64, f64), max_iter: u32) -> Self {
        let (min, max) = output_range;
        Self {
            output_range,
            initial_step: (max - min) * 0.5,
            initial_output: (min + max) * 0.5,
            setpoint,
            tolerance,
            max_iter,
            slope: default_slope(),
        }
    }

    /// Override the plant direction.
    pub fn with_slope(mut self, slope: Slope) -> Self {
        self.slope = slope;
        self
    }

    /// Reject ranges, tolerances or steps the search cannot work with.
    pub fn validate(&self) -> AppResult<()> {
        validate_common(self.output_range, self.tolerance, self.max_iter)?;
        if !(self.initial_step > 0.0) {
            return Err(BenchError::Configuration(format!(
                "initial_step must be positive, got {}",
                self.initial_step
            )));
        }
        Ok(())
    }
}

/// Halves its step on every measurement and moves toward the set point.
#[derive(Debug)]
pub struct BinarySearchController {
    config: BinarySearchConfig,
    state: ControllerState,
    step: f64,
}

impl BinarySearchController {
    /// Validate `config` and start at `initial_output`.
    pub fn new(config: BinarySearchConfig) -> AppResult<Self> {
        config.validate()?;
        let state = ControllerState::new(
            config.setpoint,
            config.tolerance,
            config.output_range,
            config.max_iter,
            config.initial_output,
        );
        let step = config.initial_step;
        Ok(Self {
            config,
            state,
            step,
        })
    }

    /// Step size of the last move.
    pub fn step(&self) -> f64 {
        self.step
    }
}

impl SetpointController for BinarySearchController {
    fn process(&mut self, measured: f64) -> f64 {
        let error = measured - self.state.setpoint;
        self.state.record(error);

        if error.abs() <= self.state.tolerance {
            self.state.done = true;
        } else if self.state.iter >= self.state.max_iter {
            self.state.done = true;
            self.state.fail = true;
        } else {
            self.step *= 0.5;
            let next = self.state.output + self.config.slope.correction(error) * self.step;
            self.state.output = self.state.clamp(next);
        }

        if self.state.done {
            debug!(
                iter = self.state.iter,
                output = self.state.output,
                error,
                fail = self.state.fail,
                "binary search finished"
            );
        }
        self.state.iter += 1;
        self.state.output
    }

    fn reset(&mut self) {
        self.step = self.config.initial_step;
        self.state.reset(self.config.initial_output);
    }

    fn state(&self) -> &ControllerState {
        &self.state
    }
}
