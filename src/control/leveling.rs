//! Closed-loop driver shared by the IF, LO and RF leveling procedures.

use super::SetpointController;
use crate::cancel::StopSignal;
use crate::error::AppResult;
use crate::instrument::{Actuator, MeasurementSource};
use crate::sampling::{averaging_read, SamplingConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Timing and averaging for [`level`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelingOptions {
    /// Wait after each output write before reading.
    #[serde(with = "humantime_serde", default = "default_settle")]
    pub settle: Duration,
    /// Average each reading instead of taking a single sample.
    #[serde(default)]
    pub sampling: Option<SamplingConfig>,
}

fn default_settle() -> Duration {
    Duration::from_millis(200)
}

impl Default for LevelingOptions {
    fn default() -> Self {
        Self {
            settle: default_settle(),
            sampling: None,
        }
    }
}

/// How a leveling run ended.
#[derive(Debug, Clone, PartialEq)]
pub struct LevelingOutcome {
    /// The controller converged.
    pub success: bool,
    /// Actuator output left in place.
    pub output: f64,
    /// Last reading, if any was taken.
    pub last_measured: Option<f64>,
    /// Measurements fed to the controller.
    pub iterations: u32,
    /// The stop signal ended the run early.
    pub stopped: bool,
}

/// Drive `actuator` until `controller` is complete or `stop` is raised.
#[instrument(skip_all, fields(settle = ?options.settle))]
pub async fn level<C, A, S>(
    controller: &mut C,
    actuator: &A,
    source: &S,
    options: &LevelingOptions,
    stop: &StopSignal,
) -> AppResult<LevelingOutcome>
where
    C: SetpointController + ?Sized,
    A: Actuator + ?Sized,
    S: MeasurementSource + ?Sized,
{
    controller.reset();
    let mut last_measured = None;
    let mut stopped = false;

    while !controller.is_complete() {
        if stop.is_raised() {
            stopped = true;
            break;
        }
        actuator.set_output(controller.output()).await?;

        tokio::select! {
            _ = tokio::time::sleep(options.settle) => {}
            _ = stop.raised() => {
                stopped = true;
                break;
            }
        }

        let reading = match &options.sampling {
            Some(sampling) => averaging_read(sampling, source).await?.mean,
            None => source.read().await?,
        };
        last_measured = Some(reading);
        controller.process(reading);
    }

    // Completion may have reverted to the best output seen.
    if controller.is_complete() {
        actuator.set_output(controller.output()).await?;
    }

    let outcome = LevelingOutcome {
        success: controller.is_complete() && !controller.failed(),
        output: controller.output(),
        last_measured,
        iterations: controller.state().iter,
        stopped,
    };
    if outcome.success {
        info!(output = outcome.output, iterations = outcome.iterations, "leveling converged");
    } else {
        warn!(
            output = outcome.output,
            iterations = outcome.iterations,
            stopped,
            "leveling did not converge"
        );
    }
    Ok(outcome)
}
