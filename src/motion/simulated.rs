//! In-process stage for offline runs and tests.
//!
//! Moves are linear interpolations on tokio time at the configured XY and Z
//! speeds, so a paused-clock test sees the same polling behavior as the real
//! controller without any sockets.

use super::controller::{staged_target, MotionSettings};
use super::{Axes, MotionDevice, MotorPosition, MotorStatus};
use crate::error::AppResult;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy)]
struct Travel {
    from: MotorPosition,
    to: MotorPosition,
    started: Instant,
    duration: Duration,
}

impl Travel {
    fn at_rest(pos: MotorPosition) -> Self {
        Self {
            from: pos,
            to: pos,
            started: Instant::now(),
            duration: Duration::ZERO,
        }
    }

    fn position(&self, now: Instant) -> MotorPosition {
        let elapsed = now.saturating_duration_since(self.started);
        if elapsed >= self.duration {
            return self.to;
        }
        let f = elapsed.as_secs_f64() / self.duration.as_secs_f64();
        MotorPosition {
            x: self.from.x + (self.to.x - self.from.x) * f,
            y: self.from.y + (self.to.y - self.from.y) * f,
            z: self.from.z + (self.to.z - self.from.z) * f,
        }
    }

    fn moving(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.started) < self.duration
    }
}

/// A started move, as recorded by [`SimulatedMotion::moves`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulatedMove {
    /// Where the stage was when the move started.
    pub from: MotorPosition,
    /// Staged target.
    pub to: MotorPosition,
    /// Triggered sweep rather than a plain move.
    pub trigger: bool,
}

/// Stage that interpolates linearly between positions on tokio time.
pub struct SimulatedMotion {
    settings: MotionSettings,
    travel: Mutex<Travel>,
    next_pos: Mutex<Option<MotorPosition>>,
    power: Mutex<[bool; 3]>,
    moves: Mutex<Vec<SimulatedMove>>,
    stops: Mutex<usize>,
}

impl SimulatedMotion {
    /// A stage at the origin. Fails if `settings` are outside the hardware
    /// bounds, since travel times are derived from them.
    pub fn new(settings: MotionSettings) -> AppResult<Self> {
        settings.validate()?;
        Ok(Self::with_valid_settings(settings))
    }

    fn with_valid_settings(settings: MotionSettings) -> Self {
        Self {
            settings,
            travel: Mutex::new(Travel::at_rest(MotorPosition::default())),
            next_pos: Mutex::new(None),
            power: Mutex::new([true; 3]),
            moves: Mutex::new(Vec::new()),
            stops: Mutex::new(0),
        }
    }

    /// Cut (or restore) power on the axes in `axes`.
    pub fn set_power(&self, axes: Axes, on: bool) {
        let mut power = self.power.lock();
        for (i, selected) in [axes.x, axes.y, axes.z].into_iter().enumerate() {
            if selected {
                power[i] = on;
            }
        }
    }

    /// Every move started so far.
    pub fn moves(&self) -> Vec<SimulatedMove> {
        self.moves.lock().clone()
    }

    /// Times [`stop`](MotionDevice::stop) was called.
    pub fn stop_count(&self) -> usize {
        *self.stops.lock()
    }

    fn travel_time(&self, from: &MotorPosition, to: &MotorPosition) -> Duration {
        let xy = from.xy_distance(to) / self.settings.xy_speed;
        let z = (to.z - from.z).abs() / self.settings.z_speed;
        Duration::from_secs_f64(xy.max(z))
    }

    fn place(&self, pos: MotorPosition) {
        *self.travel.lock() = Travel::at_rest(pos);
    }
}

impl Default for SimulatedMotion {
    fn default() -> Self {
        Self::with_valid_settings(MotionSettings::default())
    }
}

#[async_trait]
impl MotionDevice for SimulatedMotion {
    async fn status(&self) -> AppResult<MotorStatus> {
        let power = *self.power.lock();
        let travel = *self.travel.lock();
        // An unpowered axis coasts to a halt immediately.
        let moving = travel.moving(Instant::now());
        Ok(MotorStatus {
            x_power: power[0],
            y_power: power[1],
            z_power: power[2],
            x_motion: moving && power[0] && travel.from.x != travel.to.x,
            y_motion: moving && power[1] && travel.from.y != travel.to.y,
            z_motion: moving && power[2] && travel.from.z != travel.to.z,
        })
    }

    async fn position(&self) -> AppResult<MotorPosition> {
        Ok(self.travel.lock().position(Instant::now()))
    }

    async fn home(&self, axes: Axes) -> AppResult<()> {
        self.set_zero(axes).await
    }

    async fn set_zero(&self, axes: Axes) -> AppResult<()> {
        let mut pos = self.travel.lock().position(Instant::now());
        if axes.x {
            pos.x = 0.0;
        }
        if axes.y {
            pos.y = 0.0;
        }
        if axes.z {
            pos.z = 0.0;
        }
        self.place(pos);
        debug!(?axes, "simulated axes zeroed");
        Ok(())
    }

    fn set_next_pos(&self, pos: MotorPosition) {
        *self.next_pos.lock() = Some(pos);
    }

    fn next_pos(&self) -> Option<MotorPosition> {
        *self.next_pos.lock()
    }

    async fn start_move(&self, trigger: bool) -> AppResult<()> {
        let to = staged_target(self.next_pos())?;
        let now = Instant::now();
        let from = self.travel.lock().position(now);
        let duration = self.travel_time(&from, &to);
        *self.travel.lock() = Travel {
            from,
            to,
            started: now,
            duration,
        };
        self.moves.lock().push(SimulatedMove { from, to, trigger });
        debug!(%from, %to, ?duration, trigger, "simulated move started");
        Ok(())
    }

    async fn stop(&self) -> AppResult<()> {
        let here = self.travel.lock().position(Instant::now());
        self.place(here);
        *self.stops.lock() += 1;
        info!(position = %here, "simulated stage stopped");
        Ok(())
    }

    fn estimate_move_time(&self, from: &MotorPosition, to: &MotorPosition) -> Duration {
        self.settings.estimate_move_time(from, to)
    }

    fn poll_interval(&self) -> Duration {
        self.settings.poll_interval
    }

    fn arrival_tolerance(&self) -> f64 {
        self.settings.arrival_tolerance
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::StopSignal;
    use crate::error::BenchError;

    #[tokio::test(start_paused = true)]
    async fn test_move_takes_travel_time() {
        let stage = SimulatedMotion::default();
        let started = Instant::now();
        let status = stage
            .move_to(MotorPosition::new(0.0, 40.0, 0.0), false, &StopSignal::new())
            .await
            .unwrap();
        assert!(status.success);
        // 40 mm at 20 mm/s, plus at most one poll interval
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(2));
        assert!(elapsed <= Duration::from_millis(2100));
        assert_eq!(stage.position().await.unwrap(), MotorPosition::new(0.0, 40.0, 0.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interpolates_while_moving() {
        let stage = SimulatedMotion::default();
        stage.set_next_pos(MotorPosition::new(20.0, 0.0, 0.0));
        stage.start_move(true).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        let pos = stage.position().await.unwrap();
        assert!((pos.x - 10.0).abs() < 1e-6);
        assert!(stage.status().await.unwrap().x_motion);
        assert!(stage.moves()[0].trigger);
    }

    #[tokio::test(start_paused = true)]
    async fn test_power_fault_reported() {
        let stage = SimulatedMotion::default();
        stage.set_power(Axes::Z, false);
        let status = stage
            .move_to(MotorPosition::new(1.0, 0.0, 0.0), false, &StopSignal::new())
            .await
            .unwrap();
        assert!(status.power_fail);
        assert!(!status.success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_freezes_position() {
        let stage = SimulatedMotion::default();
        stage.set_next_pos(MotorPosition::new(0.0, 20.0, 0.0));
        stage.start_move(false).await.unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        stage.stop().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        let pos = stage.position().await.unwrap();
        assert!((pos.y - 5.0).abs() < 1e-6);
        assert!(!stage.status().await.unwrap().in_motion());
        assert_eq!(stage.stop_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_home_zeroes_axes() {
        let stage = SimulatedMotion::default();
        stage
            .move_to(MotorPosition::new(3.0, 4.0, 10.0), false, &StopSignal::new())
            .await
            .unwrap();
        stage.home(Axes::XY).await.unwrap();
        assert_eq!(stage.position().await.unwrap(), MotorPosition::new(0.0, 0.0, 10.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_move_after_stop_raised_does_not_start() {
        let stage = SimulatedMotion::default();
        let stop = StopSignal::new();
        stop.raise();
        let status = stage
            .move_to(MotorPosition::new(10.0, 0.0, 0.0), false, &stop)
            .await
            .unwrap();
        assert!(status.stop_signal);
        assert!(stage.moves().is_empty());
        assert_eq!(stage.position().await.unwrap(), MotorPosition::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_signal_mid_move_halts_stage() {
        let stage = SimulatedMotion::default();
        let stop = StopSignal::new();
        let raiser = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            raiser.raise();
        });
        let status = stage
            .move_to(MotorPosition::new(40.0, 0.0, 0.0), false, &stop)
            .await
            .unwrap();
        assert!(status.stop_signal);
        // Nobody else called stop; the wait itself halted the axes.
        assert_eq!(stage.stop_count(), 1);
        let here = stage.position().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(stage.position().await.unwrap(), here);
        assert!(here.x < 40.0);
        assert!(!stage.status().await.unwrap().in_motion());
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_finite_target_rejected() {
        let stage = SimulatedMotion::default();
        let stop = StopSignal::new();
        for target in [
            MotorPosition::new(f64::NAN, 0.0, 0.0),
            MotorPosition::new(0.0, f64::INFINITY, 0.0),
            MotorPosition::new(0.0, 0.0, f64::NEG_INFINITY),
        ] {
            let err = stage.move_to(target, false, &stop).await.unwrap_err();
            assert!(matches!(err, BenchError::Configuration(_)), "{err}");
        }
        stage.set_next_pos(MotorPosition::new(f64::NAN, 0.0, 0.0));
        assert!(stage.start_move(false).await.is_err());
        assert!(stage.moves().is_empty());
    }

    #[test]
    fn test_new_rejects_zero_speed() {
        let settings = MotionSettings {
            xy_speed: 0.0,
            ..MotionSettings::default()
        };
        assert!(matches!(
            SimulatedMotion::new(settings),
            Err(BenchError::OutOfRange { what: "XY speed", .. })
        ));
        assert!(SimulatedMotion::new(MotionSettings::default()).is_ok());
    }
}
