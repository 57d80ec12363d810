//! Core library for the cryogenic receiver test bench.
//!
//! This library contains the convergence and motion control engine used by
//! the bench procedures:
//!
//! - [`control`]: set-point controllers (probabilistic bisection, binary
//!   search, PID) and the leveling loop that closes them over an actuator
//! - [`sampling`]: the multi-mode averaging read
//! - [`motion`]: the three-axis stage, its wire protocol and a simulated stage
//! - [`scan`]: the raster-scan orchestrator
//!
//! Instruments are reached through the narrow capabilities in
//! [`instrument`]; concrete drivers are wired in by the application.

pub mod cancel;
pub mod config;
pub mod control;
pub mod error;
pub mod instrument;
pub mod logging;
pub mod motion;
pub mod sampling;
pub mod scan;

pub use cancel::StopSignal;
pub use config::BenchConfig;
pub use error::{AppResult, BenchError};
