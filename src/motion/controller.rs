//! Driver for the three-axis stage controller.

use super::protocol::{self, Command, ReplyShape};
use super::transport::Transport;
use super::{Axes, MotionDevice, MotorPosition, MotorStatus};
use crate::error::{AppResult, BenchError};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Hardware limit on XY speed, mm/s.
pub const MAX_XY_SPEED: f64 = 40.0;
/// Hardware limit on XY acceleration and deceleration, mm/s².
pub const MAX_XY_ACCEL: f64 = 200.0;
/// Hardware limit on Z speed, deg/s.
pub const MAX_Z_SPEED: f64 = 20.0;
/// Hardware limit on Z acceleration and deceleration, deg/s².
pub const MAX_Z_ACCEL: f64 = 50.0;

/// Margin applied to the kinematic travel time estimate.
const MOVE_TIME_MARGIN: f64 = 1.25;

/// Unit conversion and kinematics for the stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionSettings {
    /// Encoder steps per mm on X and Y.
    pub xy_steps_per_mm: f64,
    /// Encoder steps per degree on Z.
    pub z_steps_per_deg: f64,
    /// mm/s
    pub xy_speed: f64,
    /// mm/s²
    pub xy_accel: f64,
    /// mm/s²
    pub xy_decel: f64,
    /// deg/s
    pub z_speed: f64,
    /// deg/s²
    pub z_accel: f64,
    /// deg/s²
    pub z_decel: f64,
    /// Status polling period while waiting for arrival.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// mm
    pub arrival_tolerance: f64,
}

impl Default for MotionSettings {
    fn default() -> Self {
        Self {
            xy_steps_per_mm: 5000.0,
            z_steps_per_deg: 225.0,
            xy_speed: 20.0,
            xy_accel: 100.0,
            xy_decel: 100.0,
            z_speed: 10.0,
            z_accel: 20.0,
            z_decel: 20.0,
            poll_interval: Duration::from_millis(100),
            arrival_tolerance: 0.005,
        }
    }
}

/// The staged target, if there is one and it can be converted to steps.
pub(crate) fn staged_target(next_pos: Option<MotorPosition>) -> AppResult<MotorPosition> {
    match next_pos {
        None => Err(BenchError::Configuration(
            "start_move without a staged target".to_string(),
        )),
        Some(target) if !target.is_finite() => Err(BenchError::Configuration(format!(
            "staged target {:?} is not finite",
            target
        ))),
        Some(target) => Ok(target),
    }
}

fn check_bound(what: &'static str, value: f64, max: f64) -> AppResult<()> {
    if value > 0.0 && value <= max {
        Ok(())
    } else {
        Err(BenchError::OutOfRange {
            what,
            value,
            min: 0.0,
            max,
        })
    }
}

impl MotionSettings {
    /// Every speed, acceleration and deceleration within the hardware limits,
    /// and a non-zero poll interval.
    pub fn validate(&self) -> AppResult<()> {
        if !(self.xy_steps_per_mm > 0.0 && self.z_steps_per_deg > 0.0) {
            return Err(BenchError::Configuration(
                "steps per unit must be positive".to_string(),
            ));
        }
        check_bound("XY speed", self.xy_speed, MAX_XY_SPEED)?;
        check_bound("XY acceleration", self.xy_accel, MAX_XY_ACCEL)?;
        check_bound("XY deceleration", self.xy_decel, MAX_XY_ACCEL)?;
        check_bound("Z speed", self.z_speed, MAX_Z_SPEED)?;
        check_bound("Z acceleration", self.z_accel, MAX_Z_ACCEL)?;
        check_bound("Z deceleration", self.z_decel, MAX_Z_ACCEL)?;
        if self.poll_interval.is_zero() {
            return Err(BenchError::Configuration(
                "poll_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    fn xy_steps(&self, mm: f64) -> i64 {
        (mm * self.xy_steps_per_mm).round() as i64
    }

    fn z_steps(&self, deg: f64) -> i64 {
        (deg * self.z_steps_per_deg).round() as i64
    }

    /// Kinematic travel time of the slower of XY and Z, with margin.
    pub fn estimate_move_time(&self, from: &MotorPosition, to: &MotorPosition) -> Duration {
        let xy = from.xy_distance(to) / self.xy_speed;
        let z = (to.z - from.z).abs() / self.z_speed;
        Duration::from_secs_f64(xy.max(z) * MOVE_TIME_MARGIN)
    }
}

/// Stage controller reached through `T`.
///
/// The controller's positive X and Y run opposite to the bench frame, so
/// readback and relative moves are negated on those axes. Z is absolute and
/// not negated.
pub struct MotionController<T> {
    transport: T,
    settings: Mutex<MotionSettings>,
    next_pos: Mutex<Option<MotorPosition>>,
}

impl<T: Transport> MotionController<T> {
    /// Wrap `transport`. Fails if `settings` are outside the hardware bounds.
    pub fn new(transport: T, settings: MotionSettings) -> AppResult<Self> {
        settings.validate()?;
        Ok(Self {
            transport,
            settings: Mutex::new(settings),
            next_pos: Mutex::new(None),
        })
    }

    /// Underlying link.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Current settings, including speeds changed since construction.
    pub fn settings(&self) -> MotionSettings {
        self.settings.lock().clone()
    }

    async fn send(&self, command: Command) -> AppResult<String> {
        let reply = self.transport.exchange(&command).await?;
        protocol::check_rejected(&command.text, &reply)?;
        if let ReplyShape::Acks(n) = command.reply {
            if reply.len() != n || reply.bytes().any(|b| b != b':') {
                return Err(BenchError::Protocol(format!(
                    "expected {} acknowledgements to '{}', got {:?}",
                    n, command.text, reply
                )));
            }
        }
        Ok(reply)
    }

    /// Push every speed, acceleration and deceleration from the settings.
    pub async fn configure(&self) -> AppResult<()> {
        let s = self.settings();
        self.set_xy_speed(s.xy_speed).await?;
        self.set_xy_accel(s.xy_accel).await?;
        self.set_xy_decel(s.xy_decel).await?;
        self.set_z_speed(s.z_speed).await?;
        self.set_z_accel(s.z_accel).await?;
        self.set_z_decel(s.z_decel).await?;
        info!(?s, "motion controller configured");
        Ok(())
    }

    /// Set the XY speed in mm/s. The cached value changes only if the
    /// controller accepts it.
    pub async fn set_xy_speed(&self, mm_per_s: f64) -> AppResult<()> {
        check_bound("XY speed", mm_per_s, MAX_XY_SPEED)?;
        let steps = self.settings.lock().xy_steps(mm_per_s);
        self.send(protocol::xy_speed(steps)).await?;
        self.settings.lock().xy_speed = mm_per_s;
        Ok(())
    }

    /// Set the XY acceleration in mm/s².
    pub async fn set_xy_accel(&self, mm_per_s2: f64) -> AppResult<()> {
        check_bound("XY acceleration", mm_per_s2, MAX_XY_ACCEL)?;
        let steps = self.settings.lock().xy_steps(mm_per_s2);
        self.send(protocol::xy_accel(steps)).await?;
        self.settings.lock().xy_accel = mm_per_s2;
        Ok(())
    }

    /// Set the XY deceleration in mm/s².
    pub async fn set_xy_decel(&self, mm_per_s2: f64) -> AppResult<()> {
        check_bound("XY deceleration", mm_per_s2, MAX_XY_ACCEL)?;
        let steps = self.settings.lock().xy_steps(mm_per_s2);
        self.send(protocol::xy_decel(steps)).await?;
        self.settings.lock().xy_decel = mm_per_s2;
        Ok(())
    }

    /// Set the Z speed in deg/s.
    pub async fn set_z_speed(&self, deg_per_s: f64) -> AppResult<()> {
        check_bound("Z speed", deg_per_s, MAX_Z_SPEED)?;
        let steps = self.settings.lock().z_steps(deg_per_s);
        self.send(protocol::z_speed(steps)).await?;
        self.settings.lock().z_speed = deg_per_s;
        Ok(())
    }

    /// Set the Z acceleration in deg/s².
    pub async fn set_z_accel(&self, deg_per_s2: f64) -> AppResult<()> {
        check_bound("Z acceleration", deg_per_s2, MAX_Z_ACCEL)?;
        let steps = self.settings.lock().z_steps(deg_per_s2);
        self.send(protocol::z_accel(steps)).await?;
        self.settings.lock().z_accel = deg_per_s2;
        Ok(())
    }

    /// Set the Z deceleration in deg/s².
    pub async fn set_z_decel(&self, deg_per_s2: f64) -> AppResult<()> {
        check_bound("Z deceleration", deg_per_s2, MAX_Z_ACCEL)?;
        let steps = self.settings.lock().z_steps(deg_per_s2);
        self.send(protocol::z_decel(steps)).await?;
        self.settings.lock().z_decel = deg_per_s2;
        Ok(())
    }

    /// Run a routine stored on the controller.
    pub async fn run_routine(&self, name: &str) -> AppResult<()> {
        self.send(protocol::execute(name)).await?;
        Ok(())
    }
}

#[async_trait]
impl<T: Transport> MotionDevice for MotionController<T> {
    async fn status(&self) -> AppResult<MotorStatus> {
        let reply = self.send(protocol::tell_status()).await?;
        let words = protocol::parse_integers(&reply, 3)?;
        protocol::decode_status(&words)
    }

    async fn position(&self) -> AppResult<MotorPosition> {
        let reply = self.send(protocol::report_position()).await?;
        let counts = protocol::parse_integers(&reply, 3)?;
        let s = self.settings.lock();
        Ok(MotorPosition {
            x: -(counts[0] as f64) / s.xy_steps_per_mm,
            y: -(counts[1] as f64) / s.xy_steps_per_mm,
            z: counts[2] as f64 / s.z_steps_per_deg,
        })
    }

    #[instrument(skip(self))]
    async fn home(&self, axes: Axes) -> AppResult<()> {
        if axes.is_empty() {
            return Ok(());
        }
        let letters = axes.letters();
        self.send(protocol::home(&letters)).await?;
        self.send(protocol::begin(&letters)).await?;
        Ok(())
    }

    async fn set_zero(&self, axes: Axes) -> AppResult<()> {
        if axes.is_empty() {
            return Ok(());
        }
        self.send(protocol::define_zero(axes.x, axes.y, axes.z)).await?;
        Ok(())
    }

    fn set_next_pos(&self, pos: MotorPosition) {
        *self.next_pos.lock() = Some(pos);
    }

    fn next_pos(&self) -> Option<MotorPosition> {
        *self.next_pos.lock()
    }

    #[instrument(skip(self))]
    async fn start_move(&self, trigger: bool) -> AppResult<()> {
        let target = staged_target(self.next_pos())?;
        let current = self.position().await?;
        let (dx, dy, z_abs) = {
            let s = self.settings.lock();
            (
                -s.xy_steps(target.x - current.x),
                -s.xy_steps(target.y - current.y),
                s.z_steps(target.z),
            )
        };
        debug!(%current, %target, dx, dy, z_abs, "starting move");
        self.send(protocol::stage_move(z_abs, dx, dy)).await?;
        if trigger {
            self.send(protocol::execute(protocol::TRIGGERED_MOVE_ROUTINE)).await?;
        } else {
            self.send(protocol::begin_all()).await?;
        }
        Ok(())
    }

    async fn stop(&self) -> AppResult<()> {
        self.send(protocol::stop()).await?;
        info!("motion stopped");
        Ok(())
    }

    fn estimate_move_time(&self, from: &MotorPosition, to: &MotorPosition) -> Duration {
        self.settings.lock().estimate_move_time(from, to)
    }

    fn poll_interval(&self) -> Duration {
        self.settings.lock().poll_interval
    }

    fn arrival_tolerance(&self) -> f64 {
        self.settings.lock().arrival_tolerance
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::StopSignal;
    use crate::motion::MockTransport;

    fn controller() -> MotionController<MockTransport> {
        MotionController::new(MockTransport::new(), MotionSettings::default()).unwrap()
    }

    #[tokio::test]
    async fn test_speed_bounds_rejected_before_send() {
        let mc = controller();
        let err = mc.set_xy_speed(40.5).await.unwrap_err();
        assert!(matches!(err, BenchError::OutOfRange { what: "XY speed", .. }));
        assert!(mc.set_xy_speed(0.0).await.is_err());
        assert!(mc.set_z_accel(51.0).await.is_err());
        assert!(mc.transport().calls().is_empty());
    }

    #[tokio::test]
    async fn test_speed_commands_in_steps() {
        let mc = controller();
        mc.set_xy_speed(40.0).await.unwrap();
        mc.set_xy_accel(2.5).await.unwrap();
        mc.set_z_speed(20.0).await.unwrap();
        mc.set_z_decel(1.0).await.unwrap();
        assert_eq!(
            mc.transport().calls(),
            vec!["SP 200000,200000;", "AC 12500,12500;", "SPC=4500;", "DCC=225;"]
        );
        assert_eq!(mc.settings().xy_speed, 40.0);
    }

    #[tokio::test]
    async fn test_rejected_command_is_protocol_error() {
        let mc = controller();
        mc.transport().push_reply("SP 100000,100000;", "?");
        let err = mc.set_xy_speed(20.0).await.unwrap_err();
        assert!(matches!(err, BenchError::Protocol(_)));
        // speed left unchanged
        assert_eq!(mc.settings().xy_speed, 20.0);
    }

    #[tokio::test]
    async fn test_short_ack_is_protocol_error() {
        let mc = controller();
        mc.transport().push_reply("HMA;HMB;", ":");
        assert!(matches!(
            mc.home(Axes::XY).await,
            Err(BenchError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_home_and_zero() {
        let mc = controller();
        mc.home(Axes::XY).await.unwrap();
        assert_eq!(mc.transport().calls(), vec!["HMA;HMB;", "BGAB;"]);
        mc.transport().clear_calls();
        mc.set_zero(Axes::Y).await.unwrap();
        assert_eq!(mc.transport().calls(), vec!["DP ,0;"]);
    }

    #[tokio::test]
    async fn test_status_decoding() {
        let mc = controller();
        mc.transport().set_reply("TS;", " 64, 0, 16\r\n:");
        let status = mc.status().await.unwrap();
        assert!(status.x_motion);
        assert!(!status.z_power);
        assert!(status.y_power && !status.y_motion);
    }

    #[tokio::test]
    async fn test_position_negates_xy_only() {
        let mc = controller();
        mc.transport()
            .set_reply("RPX;RPY;TPZ;", " 50000\r\n: -25000\r\n: 20250\r\n:");
        let pos = mc.position().await.unwrap();
        assert_eq!(pos, MotorPosition::new(-10.0, 5.0, 90.0));
    }

    #[tokio::test]
    async fn test_position_wrong_token_count() {
        let mc = controller();
        mc.transport().set_reply("RPX;RPY;TPZ;", " 1\r\n: 2\r\n:");
        assert!(matches!(mc.position().await, Err(BenchError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_start_move_relative_xy_absolute_z() {
        let mc = controller();
        // current (-10, 5, 90)
        mc.transport()
            .set_reply("RPX;RPY;TPZ;", " 50000\r\n: -25000\r\n: 20250\r\n:");
        mc.set_next_pos(MotorPosition::new(-8.0, 5.5, 180.0));
        mc.start_move(true).await.unwrap();
        mc.start_move(false).await.unwrap();
        let calls = mc.transport().calls();
        assert_eq!(
            calls,
            vec![
                "RPX;RPY;TPZ;",
                "PAC=40500;PR -10000,-2500;",
                "XQ#TRIGMV;",
                "RPX;RPY;TPZ;",
                "PAC=40500;PR -10000,-2500;",
                "BGABC;",
            ]
        );
    }

    #[tokio::test]
    async fn test_start_move_needs_target() {
        let mc = controller();
        assert!(mc.start_move(false).await.is_err());
    }

    #[tokio::test]
    async fn test_stop_and_routine() {
        let mc = controller();
        mc.stop().await.unwrap();
        mc.run_routine("SETUP").await.unwrap();
        assert_eq!(mc.transport().calls(), vec!["ST;", "XQ#SETUP;"]);
    }

    #[test]
    fn test_estimate_move_time() {
        let settings = MotionSettings::default();
        let from = MotorPosition::new(0.0, 0.0, 0.0);
        // 40 mm at 20 mm/s = 2 s, 5 deg at 10 deg/s = 0.5 s
        let t = settings.estimate_move_time(&from, &MotorPosition::new(0.0, 40.0, 5.0));
        assert!((t.as_secs_f64() - 2.5).abs() < 1e-9);
        // rotation dominated
        let t = settings.estimate_move_time(&from, &MotorPosition::new(0.0, 0.0, 90.0));
        assert!((t.as_secs_f64() - 11.25).abs() < 1e-9);
    }

    #[test]
    fn test_estimate_move_time_is_symmetric() {
        let settings = MotionSettings::default();
        let pairs = [
            (MotorPosition::new(-40.0, 1.0, 0.0), MotorPosition::new(40.0, 1.0, 0.0)),
            (MotorPosition::new(3.0, -7.5, 90.0), MotorPosition::new(-12.0, 4.0, 0.0)),
            (MotorPosition::new(0.0, 0.0, 45.0), MotorPosition::new(0.0, 0.0, 45.0)),
        ];
        for (a, b) in pairs {
            assert_eq!(
                settings.estimate_move_time(&a, &b),
                settings.estimate_move_time(&b, &a),
                "{a} <-> {b}"
            );
        }
        assert_eq!(
            settings.estimate_move_time(&pairs[2].0, &pairs[2].1),
            Duration::ZERO
        );
    }

    #[test]
    fn test_new_rejects_invalid_settings() {
        for settings in [
            MotionSettings { xy_speed: 0.0, ..MotionSettings::default() },
            MotionSettings { z_speed: f64::NAN, ..MotionSettings::default() },
            MotionSettings { poll_interval: Duration::ZERO, ..MotionSettings::default() },
        ] {
            let err = MotionController::new(MockTransport::new(), settings).err();
            assert!(err.is_some());
        }
    }

    #[tokio::test]
    async fn test_start_move_rejects_non_finite_target() {
        let mc = controller();
        mc.set_next_pos(MotorPosition::new(f64::INFINITY, 0.0, 0.0));
        let err = mc.start_move(false).await.unwrap_err();
        assert!(matches!(err, BenchError::Configuration(_)));
        assert!(mc.transport().calls().is_empty());
    }

    #[test]
    fn test_settings_validation() {
        assert!(MotionSettings::default().validate().is_ok());
        let settings = MotionSettings {
            z_speed: 25.0,
            ..MotionSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_arrival_success() {
        let mc = controller();
        mc.set_next_pos(MotorPosition::new(-10.0, 5.0, 90.0));
        mc.transport().push_reply("TS;", "64, 64, 0\r\n:");
        mc.transport().push_reply("RPX;RPY;TPZ;", " 40000\r\n: -20000\r\n: 20250\r\n:");
        mc.transport().set_reply("TS;", "0, 0, 0\r\n:");
        mc.transport()
            .set_reply("RPX;RPY;TPZ;", " 50000\r\n: -25000\r\n: 20250\r\n:");
        let status = mc
            .wait_for_arrival(Duration::from_secs(5), &StopSignal::new())
            .await
            .unwrap();
        assert!(status.success);
        assert_eq!(mc.transport().calls().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_arrival_power_fail() {
        let mc = controller();
        mc.set_next_pos(MotorPosition::new(1.0, 1.0, 0.0));
        mc.transport().set_reply("TS;", "64, 80, 0\r\n:");
        let status = mc
            .wait_for_arrival(Duration::from_secs(5), &StopSignal::new())
            .await
            .unwrap();
        assert_eq!(status, crate::motion::MoveStatus::power_fail());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_arrival_timeout() {
        let mc = controller();
        mc.set_next_pos(MotorPosition::new(1.0, 1.0, 0.0));
        mc.transport().set_reply("TS;", "64, 64, 0\r\n:");
        mc.transport().set_reply("RPX;RPY;TPZ;", " 0\r\n: 0\r\n: 0\r\n:");
        let status = mc
            .wait_for_arrival(Duration::from_secs(1), &StopSignal::new())
            .await
            .unwrap();
        assert_eq!(status, crate::motion::MoveStatus::timed_out());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_arrival_stop_interrupts_poll() {
        let mc = controller();
        mc.set_next_pos(MotorPosition::new(1.0, 1.0, 0.0));
        mc.settings.lock().poll_interval = Duration::from_secs(60);
        mc.transport().set_reply("TS;", "64, 64, 0\r\n:");
        mc.transport().set_reply("RPX;RPY;TPZ;", " 0\r\n: 0\r\n: 0\r\n:");
        let stop = StopSignal::new();
        let raiser = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            raiser.raise();
        });
        let started = tokio::time::Instant::now();
        let status = mc
            .wait_for_arrival(Duration::from_secs(600), &stop)
            .await
            .unwrap();
        assert!(status.stop_signal);
        assert!(started.elapsed() < Duration::from_secs(2));
        // the interrupted wait halts the axes itself
        assert_eq!(mc.transport().calls().last().map(String::as_str), Some("ST;"));
    }

    #[tokio::test]
    async fn test_move_to_after_stop_sends_no_move() {
        let mc = controller();
        mc.transport()
            .set_reply("RPX;RPY;TPZ;", " 0\r\n: 0\r\n: 0\r\n:");
        let stop = StopSignal::new();
        stop.raise();
        let status = mc
            .move_to(MotorPosition::new(5.0, 0.0, 0.0), false, &stop)
            .await
            .unwrap();
        assert!(status.stop_signal);
        assert_eq!(mc.transport().calls(), vec!["RPX;RPY;TPZ;"]);
    }
}
