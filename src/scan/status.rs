//! Shared, lock-light progress of a scan run.

use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

const NONE: usize = usize::MAX;

/// Progress of the running scan.
///
/// Written only by the scan worker; any task may read it. Scalars are
/// independent atomics, so a reader can see a snapshot that mixes two
/// consecutive updates.
#[derive(Debug)]
pub struct ScanStatus {
    running: AtomicBool,
    item: AtomicUsize,
    sub_scan: AtomicUsize,
    lines_completed: AtomicUsize,
    sub_scan_complete: AtomicBool,
    all_complete: AtomicBool,
    error: AtomicBool,
    message: RwLock<String>,
}

/// Point-in-time copy of [`ScanStatus`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanStatusSnapshot {
    /// A worker is executing the plan.
    pub running: bool,
    /// Index of the current plan item.
    pub item: Option<usize>,
    /// Index of the current sub-scan within the item.
    pub sub_scan: Option<usize>,
    /// Lines finished since the run started.
    pub lines_completed: usize,
    /// The current sub-scan finished.
    pub sub_scan_complete: bool,
    /// The whole plan finished.
    pub all_complete: bool,
    /// The run ended with an error or a stop.
    pub error: bool,
    /// Latest progress or error message.
    pub message: String,
}

fn optional(v: usize) -> Option<usize> {
    (v != NONE).then_some(v)
}

impl Default for ScanStatus {
    fn default() -> Self {
        Self {
            running: AtomicBool::new(false),
            item: AtomicUsize::new(NONE),
            sub_scan: AtomicUsize::new(NONE),
            lines_completed: AtomicUsize::new(0),
            sub_scan_complete: AtomicBool::new(false),
            all_complete: AtomicBool::new(false),
            error: AtomicBool::new(false),
            message: RwLock::new(String::new()),
        }
    }
}

impl ScanStatus {
    /// Idle status.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every field.
    pub fn snapshot(&self) -> ScanStatusSnapshot {
        ScanStatusSnapshot {
            running: self.running.load(Ordering::Acquire),
            item: optional(self.item.load(Ordering::Acquire)),
            sub_scan: optional(self.sub_scan.load(Ordering::Acquire)),
            lines_completed: self.lines_completed.load(Ordering::Acquire),
            sub_scan_complete: self.sub_scan_complete.load(Ordering::Acquire),
            all_complete: self.all_complete.load(Ordering::Acquire),
            error: self.error.load(Ordering::Acquire),
            message: self.message.read().clone(),
        }
    }

    /// A worker is executing the plan.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// The last run ended with an error or a stop.
    pub fn has_error(&self) -> bool {
        self.error.load(Ordering::Acquire)
    }

    /// Lines finished since the run started.
    pub fn lines_completed(&self) -> usize {
        self.lines_completed.load(Ordering::Acquire)
    }

    /// Latest progress or error message.
    pub fn message(&self) -> String {
        self.message.read().clone()
    }

    pub(crate) fn begin_run(&self) {
        self.item.store(NONE, Ordering::Release);
        self.sub_scan.store(NONE, Ordering::Release);
        self.lines_completed.store(0, Ordering::Release);
        self.sub_scan_complete.store(false, Ordering::Release);
        self.all_complete.store(false, Ordering::Release);
        self.error.store(false, Ordering::Release);
        self.set_message("scan started");
        self.running.store(true, Ordering::Release);
    }

    pub(crate) fn begin_item(&self, index: usize) {
        self.item.store(index, Ordering::Release);
        self.sub_scan.store(NONE, Ordering::Release);
    }

    pub(crate) fn begin_sub_scan(&self, index: usize) {
        self.sub_scan.store(index, Ordering::Release);
        self.sub_scan_complete.store(false, Ordering::Release);
    }

    pub(crate) fn line_done(&self) {
        self.lines_completed.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn sub_scan_done(&self) {
        self.sub_scan_complete.store(true, Ordering::Release);
    }

    pub(crate) fn fail(&self, message: impl Into<String>) {
        self.set_message(message);
        self.error.store(true, Ordering::Release);
    }

    pub(crate) fn finish(&self, all_complete: bool) {
        self.all_complete.store(all_complete, Ordering::Release);
        self.running.store(false, Ordering::Release);
    }

    pub(crate) fn set_message(&self, message: impl Into<String>) {
        *self.message.write() = message.into();
    }
}
