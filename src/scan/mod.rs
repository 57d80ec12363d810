//! Raster beam scans.
//!
//! [`ScanOrchestrator`] runs a plan on one tokio task. For every enabled
//! [`ScanItem`] and each of its sub-scans it rotates the probe, then sweeps
//! the raster line by line: an untriggered move to the line start, a
//! triggered move to the line end. A [`ScanHooks`] implementation is called
//! to prepare each item and to take center-power readings, periodically and
//! at the end of every sub-scan.
//!
//! Progress is published through [`ScanStatus`]; the final [`ScanReport`]
//! arrives on the `oneshot` receiver returned by
//! [`start`](ScanOrchestrator::start).

pub mod hooks;
pub mod orchestrator;
pub mod plan;
pub mod status;

pub use hooks::{CenterPowerCheck, ScanHooks};
pub use orchestrator::{CenterPowerRecord, ScanOrchestrator, ScanReport};
pub use plan::{ScanGeometry, ScanItem, SubScan, SubScanKind, SubScanOptions};
pub use status::{ScanStatus, ScanStatusSnapshot};
