//! Scan worker: sequences sub-scans, raster lines and center-power checks.

use super::hooks::ScanHooks;
use super::plan::{ScanGeometry, ScanItem, SubScan};
use super::status::ScanStatus;
use crate::cancel::StopSignal;
use crate::error::{AppResult, BenchError};
use crate::motion::{MotionDevice, MotorPosition};
use crate::sampling::StdErrResult;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// A center-power reading and where in the plan it was taken.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CenterPowerRecord {
    /// When the reading finished.
    pub timestamp: DateTime<Utc>,
    /// Plan item index.
    pub item: usize,
    /// Sub-scan index within the item.
    pub sub_scan: usize,
    /// Averaged reading.
    pub result: StdErrResult,
}

/// Delivered once when a run ends, however it ends.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanReport {
    /// Every enabled item finished.
    pub completed: bool,
    /// Why the run ended early.
    pub error: Option<String>,
    /// Lines finished.
    pub lines_completed: usize,
    /// Center-power readings, in order.
    pub center_power: Vec<CenterPowerRecord>,
}

enum Abort {
    Stopped,
    Failed(String),
}

impl From<BenchError> for Abort {
    fn from(err: BenchError) -> Self {
        Abort::Failed(err.to_string())
    }
}

/// Owns the scan worker: at most one run at a time.
pub struct ScanOrchestrator {
    motion: Arc<dyn MotionDevice>,
    hooks: Arc<dyn ScanHooks>,
    geometry: ScanGeometry,
    status: Arc<ScanStatus>,
    stop: StopSignal,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ScanOrchestrator {
    /// Fails if `geometry` does not validate.
    pub fn new(
        motion: Arc<dyn MotionDevice>,
        hooks: Arc<dyn ScanHooks>,
        geometry: ScanGeometry,
    ) -> AppResult<Self> {
        geometry.validate()?;
        Ok(Self {
            motion,
            hooks,
            geometry,
            status: Arc::new(ScanStatus::new()),
            stop: StopSignal::new(),
            worker: Mutex::new(None),
        })
    }

    /// Shared progress, updated by the worker.
    pub fn status(&self) -> Arc<ScanStatus> {
        Arc::clone(&self.status)
    }

    /// Raster every sub-scan uses.
    pub fn geometry(&self) -> &ScanGeometry {
        &self.geometry
    }

    /// A worker exists and has not finished.
    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Spawn the worker for `plan`.
    ///
    /// Returns `Ok(None)` without doing anything if a run is already in
    /// progress. Must be called from within a tokio runtime.
    pub fn start(&self, plan: Vec<ScanItem>) -> AppResult<Option<oneshot::Receiver<ScanReport>>> {
        let mut worker = self.worker.lock();
        if worker.as_ref().is_some_and(|handle| !handle.is_finished()) {
            warn!("scan already running, start ignored");
            return Ok(None);
        }
        if !plan.iter().any(|item| item.enable) {
            return Err(BenchError::Scan("plan has no enabled items".to_string()));
        }

        self.stop.clear();
        self.status.begin_run();
        let (tx, rx) = oneshot::channel();
        let run = ScanRun {
            motion: Arc::clone(&self.motion),
            hooks: Arc::clone(&self.hooks),
            geometry: self.geometry.clone(),
            status: Arc::clone(&self.status),
            stop: self.stop.clone(),
            last_center_check: None,
            center_power: Vec::new(),
        };
        info!(items = plan.len(), "scan starting");
        *worker = Some(tokio::spawn(async move {
            let report = run.execute(plan).await;
            // The receiver may have been dropped; the status still has the outcome.
            let _ = tx.send(report);
        }));
        Ok(Some(rx))
    }

    /// Raise the stop signal, halt the stage and wait for the worker to exit.
    ///
    /// Does nothing if no run is in progress.
    pub async fn stop(&self) -> AppResult<()> {
        let handle = self.worker.lock().take();
        let Some(handle) = handle else {
            return Ok(());
        };
        if handle.is_finished() {
            let _ = handle.await;
            return Ok(());
        }
        self.stop.raise();
        let halted = self.motion.stop().await;
        if let Err(e) = handle.await {
            error!(error = %e, "scan worker panicked");
        }
        halted
    }
}

struct ScanRun {
    motion: Arc<dyn MotionDevice>,
    hooks: Arc<dyn ScanHooks>,
    geometry: ScanGeometry,
    status: Arc<ScanStatus>,
    stop: StopSignal,
    last_center_check: Option<Instant>,
    center_power: Vec<CenterPowerRecord>,
}

impl ScanRun {
    async fn execute(mut self, plan: Vec<ScanItem>) -> ScanReport {
        let outcome = self.run_plan(&plan).await;
        let error = match outcome {
            Ok(()) => {
                self.status.set_message("scan complete");
                info!(lines = self.status.lines_completed(), "scan complete");
                None
            }
            Err(Abort::Stopped) => Some("scan stopped by request".to_string()),
            Err(Abort::Failed(message)) => Some(message),
        };
        if let Some(message) = &error {
            warn!(%message, "scan aborted");
            self.status.fail(message.clone());
        }
        self.status.finish(error.is_none());
        ScanReport {
            completed: error.is_none(),
            error,
            lines_completed: self.status.lines_completed(),
            center_power: self.center_power,
        }
    }

    fn checkpoint(&self) -> Result<(), Abort> {
        if self.stop.is_raised() {
            Err(Abort::Stopped)
        } else {
            Ok(())
        }
    }

    async fn run_plan(&mut self, plan: &[ScanItem]) -> Result<(), Abort> {
        for (index, item) in plan.iter().enumerate() {
            if !item.enable {
                continue;
            }
            self.checkpoint()?;
            self.status.begin_item(index);
            self.status.set_message(format!(
                "item {}: RF {} GHz, LO {} GHz",
                index, item.rf_ghz, item.lo_ghz
            ));
            self.hooks.prepare_item(index, item).await?;
            for sub in item.expand() {
                self.run_sub_scan(index, &sub).await?;
            }
        }
        Ok(())
    }

    async fn run_sub_scan(&mut self, item: usize, sub: &SubScan) -> Result<(), Abort> {
        self.checkpoint()?;
        self.status.begin_sub_scan(sub.index);
        self.status.set_message(format!("item {} sub-scan {}", item, sub));
        let z = sub.angle(self.geometry.pol_angles);
        debug!(%sub, z, "starting sub-scan");

        let here = self.motion.position().await?;
        self.move_to(MotorPosition { z, ..here }, false, "rotate probe")
            .await?;

        let ys = self.geometry.line_ys();
        for (line, y) in ys.iter().copied().enumerate() {
            self.checkpoint()?;
            if self.center_check_due() {
                self.center_power(item, sub).await?;
            }
            self.move_to(self.geometry.line_start(y, z), false, "line start")
                .await?;
            self.move_to(self.geometry.line_end(y, z), true, "line end")
                .await?;
            self.status.line_done();
            debug!(line, y, "line done");
        }
        // Every sub-scan ends with a reference reading, periodic or not.
        self.center_power(item, sub).await?;
        self.status.sub_scan_done();
        Ok(())
    }

    fn center_check_due(&self) -> bool {
        match (self.geometry.center_power_interval, self.last_center_check) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(interval), Some(last)) => last.elapsed() >= interval,
        }
    }

    async fn center_power(&mut self, item: usize, sub: &SubScan) -> Result<(), Abort> {
        let result = self
            .hooks
            .center_power_check(self.motion.as_ref(), &self.stop)
            .await?
            .ok_or(Abort::Stopped)?;
        self.last_center_check = Some(Instant::now());
        self.center_power.push(CenterPowerRecord {
            timestamp: Utc::now(),
            item,
            sub_scan: sub.index,
            result,
        });
        Ok(())
    }

    async fn move_to(&self, target: MotorPosition, trigger: bool, what: &str) -> Result<(), Abort> {
        let status = self.motion.move_to(target, trigger, &self.stop).await?;
        if status.success {
            Ok(())
        } else if status.stop_signal {
            Err(Abort::Stopped)
        } else {
            error!(%target, status = status.describe(), "{} failed", what);
            Err(Abort::Failed(format!(
                "{} to {}: {}",
                what,
                target,
                status.describe()
            )))
        }
    }
}
