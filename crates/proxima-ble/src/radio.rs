//! Radio capabilities the engine drives
//!
//! The engine never talks to a BLE stack directly. It consumes these traits,
//! implemented by the btleplug/bluer backends for real hardware and by mocks
//! in tests.

use std::sync::Arc;

use async_trait::async_trait;
use proxima_core::{CharacteristicMap, RadioId};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::RadioResult;

// ----------------------------------------------------------------------------
// Values Crossing the Radio Boundary
// ----------------------------------------------------------------------------

/// One received advertisement packet carrying our manufacturer id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sighting {
    /// Radio identifier of the sender
    pub peer: RadioId,
    /// Manufacturer payload stored under the filtered manufacturer id
    pub manufacturer_data: Vec<u8>,
}

/// A characteristic found on a remote GATT server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCharacteristic {
    pub uuid: Uuid,
    /// Whether the characteristic permits reads
    pub readable: bool,
}

/// A service found on a remote GATT server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteService {
    pub uuid: Uuid,
    pub characteristics: Vec<RemoteCharacteristic>,
}

// ----------------------------------------------------------------------------
// Central Role
// ----------------------------------------------------------------------------

/// Scanning and GATT client side of the radio
#[async_trait]
pub trait Central: Send + Sync {
    /// Start scanning, delivering every advertisement that carries
    /// `manufacturer_id` to `sink`
    async fn start_scan(
        &self,
        manufacturer_id: u16,
        sink: mpsc::UnboundedSender<Sighting>,
    ) -> RadioResult<()>;

    /// Stop scanning
    async fn stop_scan(&self) -> RadioResult<()>;

    /// Open a GATT connection to a sighted peer
    async fn connect(&self, peer: &RadioId) -> RadioResult<Arc<dyn GattLink>>;

    /// Tear down a connection attempt whose `connect` future was dropped
    ///
    /// The stack may finish such an attempt in the background, leaving a
    /// connection no [`GattLink`] owns.
    async fn cancel_connect(&self, peer: &RadioId) -> RadioResult<()>;
}

/// An open GATT client connection
#[async_trait]
pub trait GattLink: Send + Sync {
    /// Enumerate the remote services and their characteristics
    async fn discover(&self) -> RadioResult<Vec<RemoteService>>;

    /// Read one characteristic; callers issue one read at a time
    async fn read(&self, service: Uuid, characteristic: Uuid) -> RadioResult<Vec<u8>>;

    /// Close the connection
    async fn disconnect(&self) -> RadioResult<()>;
}

// ----------------------------------------------------------------------------
// Peripheral Role
// ----------------------------------------------------------------------------

/// Broadcasting and GATT server side of the radio
#[async_trait]
pub trait Peripheral: Send + Sync {
    /// Serve a read-only service; an existing service with the same id is
    /// replaced
    async fn register_service(
        &self,
        service: Uuid,
        characteristics: Arc<CharacteristicMap>,
    ) -> RadioResult<()>;

    /// Stop serving a service
    async fn unregister_service(&self, service: Uuid) -> RadioResult<()>;

    /// Start a connectable broadcast carrying `payload` under
    /// `manufacturer_id`
    async fn start_broadcast(&self, manufacturer_id: u16, payload: Vec<u8>) -> RadioResult<()>;

    /// Stop broadcasting
    async fn stop_broadcast(&self) -> RadioResult<()>;
}
