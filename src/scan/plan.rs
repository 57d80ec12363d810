//! Scan plans and raster geometry.
//!
//! A plan is an ordered list of [`ScanItem`]s, one per RF/LO frequency pair.
//! Each enabled item expands into up to six [`SubScan`]s: for each
//! polarization a co-polar, a cross-polar and a 180°-rotated co-polar beam
//! map, in that order.

use crate::error::{AppResult, BenchError};
use crate::motion::MotorPosition;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Slack when deciding whether the last stepped line reached the boundary.
const LINE_EPSILON: f64 = 1e-9;

/// Probe orientation of a sub-scan relative to its polarization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubScanKind {
    /// Aligned with the polarization.
    Copol,
    /// Turned 90°.
    Xpol,
    /// Turned 180°.
    Copol180,
}

impl SubScanKind {
    const ORDER: [SubScanKind; 3] = [SubScanKind::Copol, SubScanKind::Xpol, SubScanKind::Copol180];

    /// Probe rotation relative to the polarization angle.
    pub fn angle_offset(&self) -> f64 {
        match self {
            SubScanKind::Copol => 0.0,
            SubScanKind::Xpol => 90.0,
            SubScanKind::Copol180 => 180.0,
        }
    }

    fn slot(&self) -> usize {
        match self {
            SubScanKind::Copol => 0,
            SubScanKind::Xpol => 1,
            SubScanKind::Copol180 => 2,
        }
    }
}

/// Which sub-scans an item runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubScanOptions {
    /// Run polarization 0.
    pub pol0: bool,
    /// Run polarization 1.
    pub pol1: bool,
    /// Co-polar map per polarization.
    pub copol: bool,
    /// Cross-polar map per polarization.
    pub xpol: bool,
    /// Extra co-polar map with the probe turned 180°.
    pub copol180: bool,
}

impl Default for SubScanOptions {
    fn default() -> Self {
        Self {
            pol0: true,
            pol1: true,
            copol: true,
            xpol: true,
            copol180: false,
        }
    }
}

impl SubScanOptions {
    fn includes(&self, kind: SubScanKind) -> bool {
        match kind {
            SubScanKind::Copol => self.copol,
            SubScanKind::Xpol => self.xpol,
            SubScanKind::Copol180 => self.copol180,
        }
    }
}

/// One RF/LO frequency pair and the sub-scans to run at it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanItem {
    /// Disabled items are skipped.
    #[serde(default = "default_enable")]
    pub enable: bool,
    /// RF frequency.
    pub rf_ghz: f64,
    /// LO frequency.
    pub lo_ghz: f64,
    /// Which sub-scans to run.
    #[serde(default)]
    pub sub_scans: SubScanOptions,
}

fn default_enable() -> bool {
    true
}

impl ScanItem {
    /// Enabled item with the default sub-scans.
    pub fn new(rf_ghz: f64, lo_ghz: f64) -> Self {
        Self {
            enable: true,
            rf_ghz,
            lo_ghz,
            sub_scans: SubScanOptions::default(),
        }
    }

    /// Ordered sub-scans. An index depends only on polarization and kind, so
    /// disabling one sub-scan does not renumber the others.
    pub fn expand(&self) -> Vec<SubScan> {
        let opts = &self.sub_scans;
        let mut subs = Vec::new();
        for (pol, enabled) in [(0u8, opts.pol0), (1u8, opts.pol1)] {
            if !enabled {
                continue;
            }
            for kind in SubScanKind::ORDER {
                if opts.includes(kind) {
                    subs.push(SubScan {
                        index: pol as usize * SubScanKind::ORDER.len() + kind.slot(),
                        pol,
                        kind,
                    });
                }
            }
        }
        subs
    }
}

/// One beam map within an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SubScan {
    /// Position in the six-slot order, stable when some are disabled.
    pub index: usize,
    /// Polarization, 0 or 1.
    pub pol: u8,
    /// Co-polar, cross-polar or rotated.
    pub kind: SubScanKind,
}

impl SubScan {
    /// Co-polar, including the 180° variant.
    pub fn is_copol(&self) -> bool {
        self.kind != SubScanKind::Xpol
    }

    /// The 180° co-polar variant.
    pub fn rotated_180(&self) -> bool {
        self.kind == SubScanKind::Copol180
    }

    /// Z angle for this sub-scan given the polarization angles.
    pub fn angle(&self, pol_angles: [f64; 2]) -> f64 {
        pol_angles[self.pol as usize] + self.kind.angle_offset()
    }
}

impl fmt::Display for SubScan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            SubScanKind::Copol => "copol",
            SubScanKind::Xpol => "xpol",
            SubScanKind::Copol180 => "copol180",
        };
        write!(f, "#{} pol{} {}", self.index, self.pol, kind)
    }
}

/// Raster extent shared by every sub-scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanGeometry {
    /// X of every line start, and the first line's Y.
    pub scan_start: (f64, f64),
    /// X of every line end, and the last line's Y.
    pub scan_stop: (f64, f64),
    /// Line spacing in mm.
    pub resolution: f64,
    /// Probe angles (degrees) for polarizations 0 and 1.
    #[serde(default = "default_pol_angles")]
    pub pol_angles: [f64; 2],
    /// Center-power reference position.
    pub center: MotorPosition,
    /// Period of the center-power check during a sub-scan; `None` disables
    /// the periodic checks. The check at the end of each sub-scan always runs.
    #[serde(default, with = "humantime_serde")]
    pub center_power_interval: Option<Duration>,
}

fn default_pol_angles() -> [f64; 2] {
    [0.0, 90.0]
}

impl Default for ScanGeometry {
    fn default() -> Self {
        Self {
            scan_start: (-40.0, -40.0),
            scan_stop: (40.0, 40.0),
            resolution: 0.5,
            pol_angles: default_pol_angles(),
            center: MotorPosition::default(),
            center_power_interval: Some(Duration::from_secs(600)),
        }
    }
}

impl ScanGeometry {
    /// Positive resolution and `scan_stop.1 >= scan_start.1`.
    pub fn validate(&self) -> AppResult<()> {
        if !(self.resolution > 0.0) {
            return Err(BenchError::Configuration(format!(
                "scan resolution must be positive, got {}",
                self.resolution
            )));
        }
        if self.scan_stop.1 < self.scan_start.1 {
            return Err(BenchError::Configuration(format!(
                "scan stop y {} is below start y {}",
                self.scan_stop.1, self.scan_start.1
            )));
        }
        Ok(())
    }

    /// Line Y values from start to stop in `resolution` steps. The stop value
    /// is always the last line, even when it is less than a full step away.
    pub fn line_ys(&self) -> Vec<f64> {
        let (y0, y1) = (self.scan_start.1, self.scan_stop.1);
        if !(self.resolution > 0.0) || y1 < y0 {
            return Vec::new();
        }
        let steps = ((y1 - y0) / self.resolution + LINE_EPSILON).floor() as usize;
        let mut ys: Vec<f64> = (0..=steps)
            .map(|i| y0 + i as f64 * self.resolution)
            .collect();
        if let Some(last) = ys.last_mut() {
            if y1 - *last > LINE_EPSILON {
                ys.push(y1);
            } else {
                *last = y1;
            }
        }
        ys
    }

    /// Untriggered start of the line at `y`.
    pub fn line_start(&self, y: f64, z: f64) -> MotorPosition {
        MotorPosition::new(self.scan_start.0, y, z)
    }

    /// Triggered end of the line at `y`.
    pub fn line_end(&self, y: f64, z: f64) -> MotorPosition {
        MotorPosition::new(self.scan_stop.0, y, z)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_default_order_and_indices() {
        let subs = ScanItem::new(100.0, 95.0).expand();
        let ids: Vec<(usize, u8, SubScanKind)> =
            subs.iter().map(|s| (s.index, s.pol, s.kind)).collect();
        assert_eq!(
            ids,
            vec![
                (0, 0, SubScanKind::Copol),
                (1, 0, SubScanKind::Xpol),
                (3, 1, SubScanKind::Copol),
                (4, 1, SubScanKind::Xpol),
            ]
        );
    }

    #[test]
    fn test_expand_with_180_and_single_pol() {
        let mut item = ScanItem::new(100.0, 95.0);
        item.sub_scans = SubScanOptions {
            pol0: false,
            pol1: true,
            copol: true,
            xpol: false,
            copol180: true,
        };
        let subs = item.expand();
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[0].index, 3);
        assert_eq!(subs[1].index, 5);
        assert!(subs[1].rotated_180());
        assert!(subs[1].is_copol());
        assert_eq!(subs[1].angle([0.0, 90.0]), 270.0);
    }

    #[test]
    fn test_line_ys_includes_partial_last_step() {
        let geometry = ScanGeometry {
            scan_start: (-1.0, 0.0),
            scan_stop: (1.0, 1.25),
            resolution: 0.5,
            ..ScanGeometry::default()
        };
        assert_eq!(geometry.line_ys(), vec![0.0, 0.5, 1.0, 1.25]);
    }

    #[test]
    fn test_line_ys_exact_multiple() {
        let geometry = ScanGeometry {
            scan_start: (0.0, -0.3),
            scan_stop: (0.0, 0.3),
            resolution: 0.1,
            ..ScanGeometry::default()
        };
        let ys = geometry.line_ys();
        assert_eq!(ys.len(), 7);
        assert_eq!(*ys.last().unwrap(), 0.3);
    }

    #[test]
    fn test_single_line_when_start_equals_stop() {
        let geometry = ScanGeometry {
            scan_start: (0.0, 2.0),
            scan_stop: (5.0, 2.0),
            resolution: 1.0,
            ..ScanGeometry::default()
        };
        assert_eq!(geometry.line_ys(), vec![2.0]);
    }

    #[test]
    fn test_validate() {
        assert!(ScanGeometry::default().validate().is_ok());
        let geometry = ScanGeometry {
            resolution: 0.0,
            ..ScanGeometry::default()
        };
        assert!(geometry.validate().is_err());
        let geometry = ScanGeometry {
            scan_start: (0.0, 1.0),
            scan_stop: (0.0, 0.0),
            ..ScanGeometry::default()
        };
        assert!(geometry.validate().is_err());
    }

    #[test]
    fn test_item_from_toml() {
        let item: ScanItem = toml::from_str(
            r#"
            rf_ghz = 231.0
            lo_ghz = 225.0
            [sub_scans]
            copol180 = true
            pol1 = false
            "#,
        )
        .unwrap();
        assert!(item.enable);
        assert_eq!(item.expand().len(), 3);
    }
}
