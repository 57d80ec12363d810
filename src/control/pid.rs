//! Positional PID for power-leveling loops.
//!
//! Unlike a time-based servo, the loop runs once per settled measurement, so
//! the integral and derivative terms are per-iteration sums and differences.

use super::state::ControllerState;
use super::{validate_common, SetpointController, Slope};
use crate::error::AppResult;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// Builder for [`PidController`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PidConfig {
    /// Proportional gain.
    pub kp: f64,
    /// Integral gain, per iteration.
    pub ki: f64,
    /// Derivative gain, per iteration.
    pub kd: f64,
    /// Lower output clamp.
    pub output_min: f64,
    /// Upper output clamp.
    pub output_max: f64,
    /// Clamp on the accumulated error sum.
    pub integral_limit: f64,
    /// Target measured value.
    pub setpoint: f64,
    /// Converged once `|measured - setpoint|` is within this.
    pub tolerance: f64,
    /// Measurements before giving up.
    pub max_iter: u32,
    /// Plant direction; flips the sign of the correction.
    pub slope: Slope,
    /// Output before the first measurement.
    pub initial_output: f64,
}

impl PidConfig {
    /// Gains only. Output in `[0, 1]`, no integral clamp, target 0 +/- 0.1.
    pub fn new(kp: f64, ki: f64, kd: f64) -> Self {
        Self {
            kp,
            ki,
            kd,
            output_min: 0.0,
            output_max: 1.0,
            integral_limit: f64::INFINITY,
            setpoint: 0.0,
            tolerance: 0.1,
            max_iter: 50,
            slope: Slope::Increasing,
            initial_output: 0.0,
        }
    }

    /// Clamp the output to `[min, max]`.
    pub fn with_output_limits(mut self, min: f64, max: f64) -> Self {
        self.output_min = min;
        self.output_max = max;
        self
    }

    /// Clamp the error sum to `+/- limit`.
    pub fn with_integral_limit(mut self, limit: f64) -> Self {
        self.integral_limit = limit.abs();
        self
    }

    /// Set point and tolerance.
    pub fn with_target(mut self, setpoint: f64, tolerance: f64) -> Self {
        self.setpoint = setpoint;
        self.tolerance = tolerance;
        self
    }

    /// Give up after `max_iter` measurements.
    pub fn with_max_iter(mut self, max_iter: u32) -> Self {
        self.max_iter = max_iter;
        self
    }

    /// Override the plant direction.
    pub fn with_slope(mut self, slope: Slope) -> Self {
        self.slope = slope;
        self
    }

    /// Output before the first measurement.
    pub fn with_initial_output(mut self, output: f64) -> Self {
        self.initial_output = output;
        self
    }

    /// Validate and build the controller.
    pub fn build(self) -> AppResult<PidController> {
        PidController::new(self)
    }
}

/// Positional PID evaluated once per measurement.
#[derive(Debug)]
pub struct PidController {
    config: PidConfig,
    state: ControllerState,
    integral: f64,
    prev_error: Option<f64>,
}

impl PidController {
    /// Validate `config` and start at its initial output.
    pub fn new(config: PidConfig) -> AppResult<Self> {
        let range = (config.output_min, config.output_max);
        validate_common(range, config.tolerance, config.max_iter)?;
        let state = ControllerState::new(
            config.setpoint,
            config.tolerance,
            range,
            config.max_iter,
            config.initial_output,
        );
        Ok(Self {
            config,
            state,
            integral: 0.0,
            prev_error: None,
        })
    }

    /// Accumulated error sum, after clamping.
    pub fn integral(&self) -> f64 {
        self.integral
    }
}

impl SetpointController for PidController {
    fn process(&mut self, measured: f64) -> f64 {
        let error = measured - self.state.setpoint;
        self.state.record(error);

        if error.abs() <= self.state.tolerance {
            self.state.done = true;
        } else if self.state.iter >= self.state.max_iter {
            self.state.done = true;
            self.state.fail = true;
        } else {
            let cfg = &self.config;
            let sign = cfg.slope.correction(1.0);
            let previous_integral = self.integral;
            self.integral =
                (self.integral + error).clamp(-cfg.integral_limit, cfg.integral_limit);
            let derivative = self.prev_error.map_or(0.0, |prev| error - prev);

            let mut raw = cfg.initial_output
                + sign * (cfg.kp * error + cfg.ki * self.integral + cfg.kd * derivative);
            let clamped = self.state.clamp(raw);
            if clamped != raw {
                // saturated: freeze the integral
                self.integral = previous_integral;
                raw = cfg.initial_output
                    + sign * (cfg.kp * error + cfg.ki * self.integral + cfg.kd * derivative);
            }
            self.state.output = self.state.clamp(raw);
            self.prev_error = Some(error);
            trace!(
                iter = self.state.iter,
                error,
                integral = self.integral,
                output = self.state.output,
                "pid update"
            );
        }

        if self.state.done {
            debug!(
                iter = self.state.iter,
                output = self.state.output,
                error,
                fail = self.state.fail,
                "pid finished"
            );
        }
        self.state.iter += 1;
        self.state.output
    }

    fn reset(&mut self) {
        self.integral = 0.0;
        self.prev_error = None;
        self.state.reset(self.config.initial_output);
    }

    fn state(&self) -> &ControllerState {
        &self.state
    }
}
