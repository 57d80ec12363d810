//! Item preparation and center-power checks the scan worker calls out to.

use super::plan::ScanItem;
use crate::cancel::StopSignal;
use crate::error::{AppResult, BenchError};
use crate::instrument::MeasurementSource;
use crate::motion::{MotionDevice, MotorPosition};
use crate::sampling::{averaging_read, SamplingConfig, StdErrResult};
use async_trait::async_trait;
use tracing::{info, warn};

/// Per-item and periodic work the orchestrator delegates.
#[async_trait]
pub trait ScanHooks: Send + Sync {
    /// Called once before an item's first sub-scan, e.g. to tune RF and LO.
    async fn prepare_item(&self, index: usize, item: &ScanItem) -> AppResult<()>;

    /// Reference measurement at the beam center. `Ok(None)` means the check
    /// was interrupted by `stop`.
    async fn center_power_check(
        &self,
        motion: &dyn MotionDevice,
        stop: &StopSignal,
    ) -> AppResult<Option<StdErrResult>>;
}

/// Moves to a fixed reference position and averages a power reading there.
pub struct CenterPowerCheck<S> {
    source: S,
    center: MotorPosition,
    sampling: SamplingConfig,
}

impl<S: MeasurementSource> CenterPowerCheck<S> {
    /// Average `source` at `center` with `sampling`.
    pub fn new(source: S, center: MotorPosition, sampling: SamplingConfig) -> Self {
        Self {
            source,
            center,
            sampling,
        }
    }
}

#[async_trait]
impl<S: MeasurementSource> ScanHooks for CenterPowerCheck<S> {
    async fn prepare_item(&self, index: usize, item: &ScanItem) -> AppResult<()> {
        info!(index, rf_ghz = item.rf_ghz, lo_ghz = item.lo_ghz, "preparing scan item");
        Ok(())
    }

    async fn center_power_check(
        &self,
        motion: &dyn MotionDevice,
        stop: &StopSignal,
    ) -> AppResult<Option<StdErrResult>> {
        let status = motion.move_to(self.center, false, stop).await?;
        if status.stop_signal {
            return Ok(None);
        }
        if !status.success {
            return Err(BenchError::Scan(format!(
                "move to center {}: {}",
                self.center,
                status.describe()
            )));
        }
        let result = averaging_read(&self.sampling, &self.source).await?;
        if !result.success {
            warn!(n = result.n, std_err = result.std_err, "center power did not settle");
        }
        info!(mean = result.mean, std_err = result.std_err, n = result.n, "center power");
        Ok(Some(result))
    }
}
