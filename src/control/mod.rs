//! Iterative set-point controllers.
//!
//! A controller consumes one scalar measurement per iteration and answers with
//! the next actuator output, until it reports itself complete (success) or
//! failed (out of iterations). Three strategies share the same shape:
//!
//! - [`PbaController`] - probabilistic bisection over the output range
//! - [`BinarySearchController`] - monotonic step-halving search
//! - [`PidController`] - positional PID for power-leveling loops
//!
//! [`leveling::level`] closes the loop against an [`Actuator`](crate::instrument::Actuator)
//! and a [`MeasurementSource`](crate::instrument::MeasurementSource).
//!
//! Controllers are single-threaded by construction: `process()` takes
//! `&mut self` and all state lives in [`ControllerState`].

pub mod binary;
pub mod leveling;
pub mod pba;
pub mod pid;
pub mod state;

pub use binary::{BinarySearchConfig, BinarySearchController};
pub use leveling::{level, LevelingOutcome};
pub use pba::{PbaConfig, PbaController, ProbabilityDistribution};
pub use pid::{PidConfig, PidController};
pub use state::ControllerState;

use crate::error::{AppResult, BenchError};
use serde::{Deserialize, Serialize};

/// How the measured value responds to a larger actuator output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Slope {
    /// More output, larger reading (RF source power %, bias voltage).
    Increasing,
    /// More output, smaller reading (attenuators).
    Decreasing,
}

impl Slope {
    /// Direction the output should move to cancel `error = measured - setpoint`.
    pub fn correction(self, error: f64) -> f64 {
        let toward = match self {
            Slope::Increasing => -1.0,
            Slope::Decreasing => 1.0,
        };
        if error > 0.0 {
            toward
        } else if error < 0.0 {
            -toward
        } else {
            0.0
        }
    }
}

/// Iterative controller fed one measurement at a time.
pub trait SetpointController: Send {
    /// Feed one measurement, get the next actuator output.
    fn process(&mut self, measured: f64) -> f64;

    /// Return to the initial state before a new convergence run.
    fn reset(&mut self);

    /// Shared bookkeeping: iteration count, output, best error and flags.
    fn state(&self) -> &ControllerState;

    /// Current actuator output.
    fn output(&self) -> f64 {
        self.state().output
    }

    /// Converged, or gave up; see [`failed`](Self::failed).
    fn is_complete(&self) -> bool {
        self.state().done
    }

    /// Ran out of iterations without converging.
    fn failed(&self) -> bool {
        self.state().fail
    }
}

pub(crate) fn validate_common(
    output_range: (f64, f64),
    tolerance: f64,
    max_iter: u32,
) -> AppResult<()> {
    let (min, max) = output_range;
    if !(min.is_finite() && max.is_finite()) || min >= max {
        return Err(BenchError::Configuration(format!(
            "output range [{}, {}] must be finite and increasing",
            min, max
        )));
    }
    if !(tolerance > 0.0) {
        return Err(BenchError::Configuration(format!(
            "tolerance must be positive, got {}",
            tolerance
        )));
    }
    if max_iter == 0 {
        return Err(BenchError::Configuration(
            "max_iter must be at least 1".to_string(),
        ));
    }
    Ok(())
}
