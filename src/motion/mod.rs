//! Three-axis motion stage: two linear axes (X, Y in mm) and one rotation (Z in degrees).
//!
//! [`MotionDevice`] is the capability the scan orchestrator drives. Two
//! implementations exist behind it:
//!
//! - [`MotionController`] - the real controller, spoken to through a
//!   [`Transport`] with the colon-acknowledged text protocol in [`protocol`]
//! - [`SimulatedMotion`] - an in-process stage moving on tokio time
//!
//! The backend is selected from configuration when the bench is wired up.

pub mod controller;
pub mod protocol;
pub mod simulated;
pub mod transport;

pub use controller::{MotionController, MotionSettings};
pub use simulated::SimulatedMotion;
pub use transport::{MockTransport, TcpTransport, Transport};

use crate::cancel::StopSignal;
use crate::config::{MotionBackend, MotionConfig};
use crate::error::{AppResult, BenchError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Positions closer than this in Z (degrees) compare equal.
pub const Z_EQUALITY_TOLERANCE: f64 = 0.1;

/// Stage position: x and y in mm, z in degrees.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MotorPosition {
    /// mm
    pub x: f64,
    /// mm
    pub y: f64,
    /// degrees
    pub z: f64,
}

impl MotorPosition {
    /// Position from its three coordinates.
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// No NaN or infinite coordinate.
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }

    /// Straight-line XY distance, ignoring Z.
    pub fn xy_distance(&self, other: &MotorPosition) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }

    /// Equality with an XY tolerance, for encoder readback after a move.
    pub fn approx_eq(&self, other: &MotorPosition, xy_tolerance: f64) -> bool {
        (self.x - other.x).abs() <= xy_tolerance
            && (self.y - other.y).abs() <= xy_tolerance
            && (self.z - other.z).abs() < Z_EQUALITY_TOLERANCE
    }
}

// Z readback is rounded to encoder steps, X and Y are compared exactly.
impl PartialEq for MotorPosition {
    fn eq(&self, other: &Self) -> bool {
        self.x == other.x && self.y == other.y && (self.z - other.z).abs() < Z_EQUALITY_TOLERANCE
    }
}

impl fmt::Display for MotorPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.3} mm, {:.3} mm, {:.2} deg)", self.x, self.y, self.z)
    }
}

/// Per-axis power and motion flags from one status query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MotorStatus {
    /// X amplifier on.
    pub x_power: bool,
    /// Y amplifier on.
    pub y_power: bool,
    /// Z amplifier on.
    pub z_power: bool,
    /// X moving.
    pub x_motion: bool,
    /// Y moving.
    pub y_motion: bool,
    /// Z moving.
    pub z_motion: bool,
}

impl MotorStatus {
    /// Every axis has power.
    pub fn all_powered(&self) -> bool {
        self.x_power && self.y_power && self.z_power
    }

    /// Any axis moving.
    pub fn in_motion(&self) -> bool {
        self.x_motion || self.y_motion || self.z_motion
    }
}

/// Subset of axes for homing and zeroing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Axes {
    /// Include X.
    pub x: bool,
    /// Include Y.
    pub y: bool,
    /// Include Z.
    pub z: bool,
}

impl Axes {
    /// X only.
    pub const X: Axes = Axes { x: true, y: false, z: false };
    /// Y only.
    pub const Y: Axes = Axes { x: false, y: true, z: false };
    /// Z only.
    pub const Z: Axes = Axes { x: false, y: false, z: true };
    /// Both linear axes.
    pub const XY: Axes = Axes { x: true, y: true, z: false };
    /// Every axis.
    pub const ALL: Axes = Axes { x: true, y: true, z: true };

    /// No axis selected.
    pub fn is_empty(&self) -> bool {
        !(self.x || self.y || self.z)
    }

    /// Controller axis letters, in A, B, C order.
    pub fn letters(&self) -> Vec<char> {
        [(self.x, 'A'), (self.y, 'B'), (self.z, 'C')]
            .into_iter()
            .filter_map(|(on, letter)| on.then_some(letter))
            .collect()
    }
}

impl std::str::FromStr for Axes {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut axes = Axes { x: false, y: false, z: false };
        for c in s.chars() {
            match c.to_ascii_lowercase() {
                'x' => axes.x = true,
                'y' => axes.y = true,
                'z' => axes.z = true,
                other => return Err(format!("unknown axis '{}'", other)),
            }
        }
        if axes.is_empty() {
            return Err("no axes given".to_string());
        }
        Ok(axes)
    }
}

/// Outcome of waiting for a move. Exactly one flag is set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MoveStatus {
    /// Target reached.
    pub success: bool,
    /// An axis lost power.
    pub power_fail: bool,
    /// Still not there when the timeout elapsed.
    pub timed_out: bool,
    /// Interrupted by the stop signal.
    pub stop_signal: bool,
}

impl MoveStatus {
    /// Only `success` set.
    pub fn arrived() -> Self {
        Self { success: true, ..Self::default() }
    }

    /// Only `power_fail` set.
    pub fn power_fail() -> Self {
        Self { power_fail: true, ..Self::default() }
    }

    /// Only `timed_out` set.
    pub fn timed_out() -> Self {
        Self { timed_out: true, ..Self::default() }
    }

    /// Only `stop_signal` set.
    pub fn stopped() -> Self {
        Self { stop_signal: true, ..Self::default() }
    }

    /// Short description of whichever flag is set.
    pub fn describe(&self) -> &'static str {
        if self.success {
            "arrived"
        } else if self.power_fail {
            "axis power fault"
        } else if self.timed_out {
            "timed out"
        } else {
            "stopped"
        }
    }
}

/// Capability the scan orchestrator drives.
///
/// Methods take `&self` so a device can be shared as `Arc<dyn MotionDevice>`
/// between the scan worker and whoever may call [`stop`](Self::stop).
#[async_trait]
pub trait MotionDevice: Send + Sync {
    /// Power and motion flags for every axis.
    async fn status(&self) -> AppResult<MotorStatus>;

    /// Current position in bench units.
    async fn position(&self) -> AppResult<MotorPosition>;

    /// Run the homing sequence on `axes`.
    async fn home(&self, axes: Axes) -> AppResult<()>;

    /// Redefine the current position of `axes` as zero.
    async fn set_zero(&self, axes: Axes) -> AppResult<()>;

    /// Stage the target of the next [`start_move`](Self::start_move).
    fn set_next_pos(&self, pos: MotorPosition);

    /// Target staged by [`set_next_pos`](Self::set_next_pos), if any.
    fn next_pos(&self) -> Option<MotorPosition>;

    /// Start moving to the staged target, optionally emitting triggers.
    async fn start_move(&self, trigger: bool) -> AppResult<()>;

    /// Halt all axes immediately.
    async fn stop(&self) -> AppResult<()>;

    /// Expected travel time between two positions.
    fn estimate_move_time(&self, from: &MotorPosition, to: &MotorPosition) -> Duration;

    /// Period of the status polling in [`wait_for_arrival`](Self::wait_for_arrival).
    fn poll_interval(&self) -> Duration;

    /// Readback distance (mm) at which an XY target counts as reached.
    fn arrival_tolerance(&self) -> f64;

    /// Poll status and position until the staged target is reached, an axis
    /// loses power, `timeout` elapses or `stop` is raised.
    ///
    /// A raised `stop` halts the axes before returning, so a move started after
    /// someone else's [`stop`](Self::stop) does not keep running.
    async fn wait_for_arrival(&self, timeout: Duration, stop: &StopSignal) -> AppResult<MoveStatus> {
        let started = Instant::now();
        loop {
            if stop.is_raised() {
                return Ok(self.halt().await);
            }
            let status = self.status().await?;
            if !status.all_powered() {
                warn!(?status, "axis power fault while waiting for arrival");
                return Ok(MoveStatus::power_fail());
            }
            let position = self.position().await?;
            let arrived = match self.next_pos() {
                Some(target) => {
                    !status.in_motion() && position.approx_eq(&target, self.arrival_tolerance())
                }
                None => !status.in_motion(),
            };
            if arrived {
                debug!(%position, elapsed = ?started.elapsed(), "arrived");
                return Ok(MoveStatus::arrived());
            }
            if started.elapsed() > timeout {
                warn!(%position, ?timeout, "move timed out");
                return Ok(MoveStatus::timed_out());
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval()) => {}
                _ = stop.raised() => return Ok(self.halt().await),
            }
        }
    }

    /// Send a stop and report the move as stopped. A failed stop is logged;
    /// the caller is already unwinding.
    async fn halt(&self) -> MoveStatus {
        if let Err(e) = self.stop().await {
            warn!(error = %e, "stop after stop signal failed");
        }
        MoveStatus::stopped()
    }

    /// Stage `target`, start the move and wait for it with a timeout derived
    /// from the estimated travel time.
    async fn move_to(
        &self,
        target: MotorPosition,
        trigger: bool,
        stop: &StopSignal,
    ) -> AppResult<MoveStatus> {
        if !target.is_finite() {
            return Err(BenchError::Configuration(format!(
                "move target {:?} is not finite",
                target
            )));
        }
        let from = self.position().await?;
        // The position query may have raced a stop; never start a new move after it.
        if stop.is_raised() {
            return Ok(MoveStatus::stopped());
        }
        self.set_next_pos(target);
        self.start_move(trigger).await?;
        let timeout = self.estimate_move_time(&from, &target) * 2 + Duration::from_secs(2);
        self.wait_for_arrival(timeout, stop).await
    }
}

/// Build the configured backend. The TCP controller gets its speeds,
/// accelerations and decelerations pushed before it is returned.
pub async fn connect(config: &MotionConfig) -> AppResult<Arc<dyn MotionDevice>> {
    match config.backend {
        MotionBackend::Tcp => {
            let transport = TcpTransport::new(config.address.clone(), config.io_timeout);
            let controller = MotionController::new(transport, config.kinematics.clone())?;
            controller.configure().await?;
            info!(address = %config.address, "motion controller connected");
            Ok(Arc::new(controller))
        }
        MotionBackend::Simulated => {
            info!("using simulated motion stage");
            Ok(Arc::new(SimulatedMotion::new(config.kinematics.clone())?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_simulated() {
        let config = MotionConfig {
            backend: MotionBackend::Simulated,
            ..MotionConfig::default()
        };
        let stage = connect(&config).await.unwrap();
        assert_eq!(stage.position().await.unwrap(), MotorPosition::default());
    }

    #[test]
    fn test_position_equality_z_tolerance() {
        let a = MotorPosition::new(1.0, 2.0, 90.0);
        assert_eq!(a, MotorPosition::new(1.0, 2.0, 90.05));
        assert_eq!(a, MotorPosition::new(1.0, 2.0, 89.95));
        assert_ne!(a, MotorPosition::new(1.0, 2.0, 90.15));
        assert_ne!(a, MotorPosition::new(1.0, 2.0, 90.2));
        assert_ne!(a, MotorPosition::new(1.0001, 2.0, 90.0));
    }

    #[test]
    fn test_position_equality_z_boundary() {
        let origin = MotorPosition::new(0.0, 0.0, 0.0);
        // exactly one tolerance apart is not equal
        assert_ne!(origin, MotorPosition::new(0.0, 0.0, 0.1));
        assert_ne!(MotorPosition::new(0.0, 0.0, 0.1), origin);
        assert_eq!(origin, MotorPosition::new(0.0, 0.0, 0.0999));
        assert_eq!(origin, MotorPosition::new(0.0, 0.0, -0.0999));
    }

    #[test]
    fn test_approx_eq_uses_xy_tolerance() {
        let a = MotorPosition::new(10.0, -5.0, 0.0);
        assert!(a.approx_eq(&MotorPosition::new(10.0015, -5.001, 0.05), 0.002));
        assert!(!a.approx_eq(&MotorPosition::new(10.01, -5.0, 0.0), 0.002));
    }

    #[test]
    fn test_status_helpers() {
        let status = MotorStatus {
            x_power: true,
            y_power: true,
            z_power: false,
            ..MotorStatus::default()
        };
        assert!(!status.all_powered());
        assert!(!status.in_motion());
    }

    #[test]
    fn test_axes_letters_and_parse() {
        assert_eq!(Axes::XY.letters(), vec!['A', 'B']);
        assert_eq!(Axes::Z.letters(), vec!['C']);
        assert_eq!("xz".parse::<Axes>().unwrap(), Axes { x: true, y: false, z: true });
        assert!("q".parse::<Axes>().is_err());
        assert!("".parse::<Axes>().is_err());
    }

    #[test]
    fn test_move_status_constructors_set_one_flag() {
        for status in [
            MoveStatus::arrived(),
            MoveStatus::power_fail(),
            MoveStatus::timed_out(),
            MoveStatus::stopped(),
        ] {
            let flags = [
                status.success,
                status.power_fail,
                status.timed_out,
                status.stop_signal,
            ];
            assert_eq!(flags.iter().filter(|f| **f).count(), 1);
        }
    }
}
