//! Read-a-scalar and write-a-scalar instrument capabilities.

use crate::error::AppResult;
use async_trait::async_trait;
use std::sync::Arc;

/// Capability for instruments that produce one scalar reading per call.
///
/// Power meters, network analyzer amplitude markers, SIS current monitors and
/// similar readers all look like this to the control engine. Units, averaging
/// and trigger mode are configured by whoever wires the instrument in.
#[async_trait]
pub trait MeasurementSource: Send + Sync {
    /// Take one reading.
    async fn read(&self) -> AppResult<f64>;
}

/// Capability for instruments with a single settable output.
///
/// Attenuators, bias supplies, RF source power percentage, LO PA drain voltage.
#[async_trait]
pub trait Actuator: Send + Sync {
    /// Write the output. Fails without side effects if the value is refused.
    async fn set_output(&self, value: f64) -> AppResult<()>;
}

#[async_trait]
impl<T: MeasurementSource + ?Sized> MeasurementSource for Arc<T> {
    async fn read(&self) -> AppResult<f64> {
        (**self).read().await
    }
}

#[async_trait]
impl<T: Actuator + ?Sized> Actuator for Arc<T> {
    async fn set_output(&self, value: f64) -> AppResult<()> {
        (**self).set_output(value).await
    }
}
