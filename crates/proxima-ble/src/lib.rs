//! Bluetooth Low Energy proximity discovery for Proxima
//!
//! Devices publish small key/value advertisements as read-only GATT services
//! and announce them with a random stamp in their broadcast manufacturer
//! data. Scanners only connect when they see a stamp they have not fetched
//! yet, read the services one characteristic at a time and report the
//! decoded advertisements to subscribers.
//!
//! ## Architecture
//!
//! - [`engine`] - The [`DiscoveryEngine`] facade
//! - [`advertising`] - Stamp rotation and the platform GATT server backends
//! - [`scanner`] - The single-flight scan and fetch pipeline
//! - [`radio`] - Traits the engine drives, implemented per platform
//! - [`discovery`] / [`connection`] - btleplug central backend
//! - [`gatt`] - Offset-aware read path of the GATT server
//! - [`protocol`] - Manufacturer data and reserved service constants
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use proxima_ble::{Advertisement, AdId, DiscoveryConfig, DiscoveryEngine, Handler};
//! use uuid::Uuid;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = DiscoveryEngine::new(DiscoveryConfig::default()).await;
//!
//! let lamp = Advertisement::new(AdId::new([7; 16]), "lamp").with_attribute("room", "42");
//! engine.publish(Uuid::from_u128(1), lamp).await?;
//!
//! let handler: Handler = Arc::new(|ad: &Advertisement| {
//!     println!("{} {}", if ad.lost { "lost" } else { "found" }, ad.id);
//! });
//! engine.start_scan("lamp", handler.clone()).await?;
//!
//! // Discovered advertisements arrive on `handler` until:
//! engine.stop_scan(&handler).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Platform Support
//!
//! Scanning uses btleplug everywhere it runs. Publishing needs a GATT server
//! and is only supported on Linux through `bluer` and BlueZ; elsewhere
//! publishing is logged and ignored.

pub mod advertising;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod gatt;
pub mod peer;
pub mod protocol;
pub mod radio;
pub mod scanner;
pub mod status;

// Public API exports
pub use advertising::{open_peripheral, Advertiser, UnsupportedPeripheral};
#[cfg(target_os = "linux")]
pub use advertising::BluezPeripheral;
pub use config::DiscoveryConfig;
pub use connection::BtleplugLink;
pub use discovery::BtleplugCentral;
pub use engine::DiscoveryEngine;
pub use error::{DiscoveryError, RadioError, RadioResult, Result};
pub use peer::{PendingFetch, ScanPhase};
pub use protocol::{stamp_payload, DEFAULT_MANUFACTURER_ID};
pub use radio::{Central, GattLink, Peripheral, RemoteCharacteristic, RemoteService, Sighting};
pub use scanner::ScanConnector;
pub use status::{AdvertiserStatus, DiscoveryStatus, ScanCounters, ScannerStatus};

// Re-export the core model for convenience
pub use proxima_core::{
    AdHash, AdId, Advertisement, CharacteristicMap, Handler, RadioId, ScanHandler, Stamp,
    TimeSource, Timestamp,
};
