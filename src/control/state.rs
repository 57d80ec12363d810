//! Iteration bookkeeping common to every set-point controller.

use ringbuf::{HeapRb, Rb};
use std::fmt;

/// Number of recent errors kept for the oscillation check.
pub const ERROR_HISTORY: usize = 6;

/// Mutable state shared by every set-point controller.
///
/// Owned by exactly one controller and only changed from its `process()` and
/// `reset()`.
pub struct ControllerState {
    /// Target measured value.
    pub setpoint: f64,
    /// Allowed `|measured - setpoint|` for convergence.
    pub tolerance: f64,
    /// Output clamp, `(min, max)`.
    pub output_range: (f64, f64),
    /// Iteration limit.
    pub max_iter: u32,
    /// Measurements processed since the last reset.
    pub iter: u32,
    /// Current output.
    pub output: f64,
    /// Output that produced [`best_error`](Self::best_error).
    pub best_output: f64,
    /// Smallest `|error|` seen.
    pub best_error: f64,
    /// Converged or gave up.
    pub done: bool,
    /// Gave up without converging.
    pub fail: bool,
    last_errors: HeapRb<f64>,
}

impl ControllerState {
    /// Fresh state at `initial_output`, clamped to the range.
    pub fn new(
        setpoint: f64,
        tolerance: f64,
        output_range: (f64, f64),
        max_iter: u32,
        initial_output: f64,
    ) -> Self {
        let mut state = Self {
            setpoint,
            tolerance,
            output_range,
            max_iter,
            iter: 0,
            output: 0.0,
            best_output: 0.0,
            best_error: f64::INFINITY,
            done: false,
            fail: false,
            last_errors: HeapRb::new(ERROR_HISTORY),
        };
        state.reset(initial_output);
        state
    }

    /// Back to `initial_output` with counters and history cleared.
    pub fn reset(&mut self, initial_output: f64) {
        self.iter = 0;
        self.output = self.clamp(initial_output);
        self.best_output = self.output;
        self.best_error = f64::INFINITY;
        self.done = false;
        self.fail = false;
        self.last_errors.clear();
    }

    /// Track the best output so far and push `error` into the history.
    pub fn record(&mut self, error: f64) {
        if error.abs() < self.best_error {
            self.best_error = error.abs();
            self.best_output = self.output;
        }
        self.last_errors.push_overwrite(error);
    }

    /// Signed errors, oldest first.
    pub fn recent_errors(&self) -> Vec<f64> {
        self.last_errors.iter().copied().collect()
    }

    /// Mean of the last (up to six) signed errors; 0 if none were recorded.
    pub fn mean_recent_error(&self) -> f64 {
        let len = self.last_errors.len();
        if len == 0 {
            return 0.0;
        }
        self.last_errors.iter().sum::<f64>() / len as f64
    }

    /// `value` limited to the output range.
    pub fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.output_range.0, self.output_range.1)
    }
}

impl fmt::Debug for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerState")
            .field("setpoint", &self.setpoint)
            .field("tolerance", &self.tolerance)
            .field("output_range", &self.output_range)
            .field("max_iter", &self.max_iter)
            .field("iter", &self.iter)
            .field("output", &self.output)
            .field("best_output", &self.best_output)
            .field("best_error", &self.best_error)
            .field("last_errors", &self.recent_errors())
            .field("done", &self.done)
            .field("fail", &self.fail)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_is_bounded() {
        let mut state = ControllerState::new(0.0, 0.1, (0.0, 1.0), 10, 0.5);
        for e in 1..=8 {
            state.record(e as f64);
        }
        assert_eq!(state.recent_errors(), vec![3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
        assert!((state.mean_recent_error() - 5.5).abs() < 1e-12);
    }

    #[test]
    fn test_best_tracks_smallest_magnitude() {
        let mut state = ControllerState::new(0.0, 0.1, (0.0, 10.0), 10, 2.0);
        state.record(-3.0);
        state.output = 4.0;
        state.record(1.0);
        state.output = 6.0;
        state.record(-2.0);
        assert_eq!(state.best_output, 4.0);
        assert_eq!(state.best_error, 1.0);
    }

    #[test]
    fn test_reset_clamps_and_clears() {
        let mut state = ControllerState::new(0.0, 0.1, (0.0, 1.0), 10, 0.5);
        state.record(0.3);
        state.iter = 4;
        state.done = true;
        state.reset(7.0);
        assert_eq!(state.output, 1.0);
        assert_eq!(state.iter, 0);
        assert!(!state.done);
        assert!(state.recent_errors().is_empty());
        assert_eq!(state.mean_recent_error(), 0.0);
    }
}
