//! Custom error types for the bench control engine.
//!
//! `BenchError` is the single error type returned by the library. Using the
//! `thiserror` crate, it gives a consistent shape to every failure that can
//! escape the core, from transport problems on the motion controller link to
//! configuration mistakes.
//!
//! ## Error Hierarchy
//!
//! - **`Connection`**: the motion controller transport wrote or read nothing,
//!   or the socket could not be opened. Fatal for the call, never retried here.
//! - **`Protocol`**: the controller answered, but the reply had the wrong
//!   token count or format, or the controller rejected the command (`?`).
//! - **`OutOfRange`**: a commanded speed/accel/decel is outside the
//!   hardware-safe bounds. Raised before anything is sent.
//! - **`Measurement`** / **`Actuator`**: errors surfaced by the external
//!   instrument collaborators.
//! - **`Config`** / **`Configuration`**: loading and semantic validation of the
//!   bench configuration.
//! - **`Scan`**: a scan could not be started (for example an empty plan).
//!
//! Convergence failure, power faults and timeouts are *not* errors: they are
//! reported through result flags (`ControllerState::fail`, `MoveStatus`,
//! `StdErrResult::success`) so the calling procedure decides what to do.

use thiserror::Error;

/// Convenience alias for results using the bench error type.
pub type AppResult<T> = std::result::Result<T, BenchError>;

/// Every failure the library returns.
#[derive(Error, Debug)]
pub enum BenchError {
    /// The controller link could not be opened, or an exchange timed out.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The controller replied with something that does not parse, or `?`.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A commanded value outside its hardware-safe bounds.
    #[error("{what} {value} out of range [{min}, {max}]")]
    OutOfRange {
        /// Name of the quantity.
        what: &'static str,
        /// Rejected value.
        value: f64,
        /// Exclusive lower bound.
        min: f64,
        /// Inclusive upper bound.
        max: f64,
    },

    /// A measurement source failed to produce a reading.
    #[error("Measurement error: {0}")]
    Measurement(String),

    /// An actuator refused or failed a write.
    #[error("Actuator error: {0}")]
    Actuator(String),

    /// Loading or validating the configuration file.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// A value that is invalid for the operation it was given to.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A scan could not be started.
    #[error("Scan error: {0}")]
    Scan(String),
}

impl BenchError {
    /// True for failures of the motion controller link itself.
    pub fn is_transport(&self) -> bool {
        matches!(self, BenchError::Connection(_) | BenchError::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BenchError::Protocol("expected 3 tokens, got 2".to_string());
        assert_eq!(err.to_string(), "Protocol error: expected 3 tokens, got 2");
    }

    #[test]
    fn test_out_of_range_display() {
        let err = BenchError::OutOfRange {
            what: "XY speed",
            value: 80.0,
            min: 0.0,
            max: 40.0,
        };
        assert_eq!(err.to_string(), "XY speed 80 out of range [0, 40]");
    }

    #[test]
    fn test_transport_classification() {
        assert!(BenchError::Connection("refused".into()).is_transport());
        assert!(!BenchError::Scan("empty plan".into()).is_transport());
    }
}
