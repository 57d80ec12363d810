//! Narrow capability interfaces for the instruments the control engine talks to.
//!
//! Instrument drivers live outside this crate; the engine only needs to read a
//! scalar or write one. `mock` provides simulated implementations selected at
//! wiring time for tests and the simulated bench backend.

pub mod capabilities;
pub mod mock;

pub use capabilities::{Actuator, MeasurementSource};
pub use mock::{NoisySource, SimulatedPlant};
