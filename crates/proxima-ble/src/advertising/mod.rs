//! Advertiser and platform peripheral backends

pub mod fallback;
#[cfg(target_os = "linux")]
pub mod linux;
pub mod manager;

pub use fallback::UnsupportedPeripheral;
#[cfg(target_os = "linux")]
pub use linux::BluezPeripheral;
pub use manager::Advertiser;

use std::sync::Arc;

use crate::error::RadioResult;
use crate::radio::Peripheral;

// ----------------------------------------------------------------------------
// Platform Detection and Factory
// ----------------------------------------------------------------------------

/// Open the peripheral backend for the current platform
pub async fn open_peripheral() -> RadioResult<Arc<dyn Peripheral>> {
    #[cfg(target_os = "linux")]
    {
        Ok(Arc::new(linux::BluezPeripheral::new().await?))
    }
    #[cfg(not(target_os = "linux"))]
    {
        tracing::warn!("BLE peripheral mode unsupported; publishing is disabled");
        Ok(Arc::new(fallback::UnsupportedPeripheral::new()))
    }
}
