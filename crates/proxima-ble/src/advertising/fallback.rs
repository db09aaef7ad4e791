//! Peripheral role for platforms without a supported GATT server

use std::sync::Arc;

use async_trait::async_trait;
use proxima_core::CharacteristicMap;
use tracing::warn;
use uuid::Uuid;

use crate::error::{RadioError, RadioResult};
use crate::radio::Peripheral;

/// Peripheral that refuses every request
///
/// Scanning still works on these platforms; only publishing is unavailable.
#[derive(Debug, Default)]
pub struct UnsupportedPeripheral;

impl UnsupportedPeripheral {
    pub fn new() -> Self {
        Self
    }

    fn unavailable() -> RadioError {
        RadioError::Unavailable("BLE peripheral mode is not supported on this platform".into())
    }
}

#[async_trait]
impl Peripheral for UnsupportedPeripheral {
    async fn register_service(
        &self,
        service: Uuid,
        _characteristics: Arc<CharacteristicMap>,
    ) -> RadioResult<()> {
        warn!("Cannot serve {}: peripheral mode unsupported", service);
        Err(Self::unavailable())
    }

    async fn unregister_service(&self, _service: Uuid) -> RadioResult<()> {
        Ok(())
    }

    async fn start_broadcast(&self, _manufacturer_id: u16, _payload: Vec<u8>) -> RadioResult<()> {
        Err(Self::unavailable())
    }

    async fn stop_broadcast(&self) -> RadioResult<()> {
        Ok(())
    }
}
