//! Error types for the BLE discovery engine

use proxima_core::{AdId, CacheError, CodecError};
use thiserror::Error;
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Errors reported by the radio stack
///
/// Apart from `Unavailable`, which only occurs while opening the radio, all
/// of these are transient: they are logged and the pipeline moves on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RadioError {
    #[error("BLE adapter not available: {0}")]
    Unavailable(String),

    #[error("Failed to connect to peer {peer}: {reason}")]
    ConnectFailed { peer: String, reason: String },

    #[error("Peer not found: {peer}")]
    PeerNotFound { peer: String },

    #[error("Failed to discover services: {0}")]
    ServiceDiscoveryFailed(String),

    #[error("Failed to read characteristic {characteristic}: {reason}")]
    ReadFailed { characteristic: Uuid, reason: String },

    #[error("Link to peer dropped")]
    Disconnected,

    #[error("Fetch timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    #[error("Failed to control BLE scan: {0}")]
    Scan(String),

    #[error("Failed to control BLE broadcast: {0}")]
    Broadcast(String),

    #[error("GATT server error: {0}")]
    GattServer(String),
}

impl RadioError {
    /// True for read errors that end the whole fetch rather than skipping
    /// one characteristic
    pub fn is_link_loss(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Timeout { .. })
    }
}

/// Errors returned to callers of the discovery engine
///
/// These are caller bugs; environmental failures never surface here.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error(transparent)]
    Encode(#[from] CodecError),

    #[error("Scan handler is already subscribed")]
    DuplicateSubscription,

    #[error("Advertisement {ad_id} is already published as service {service_id}")]
    DuplicateAdvertisement { ad_id: AdId, service_id: Uuid },
}

impl From<CacheError> for DiscoveryError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::DuplicateSubscription => DiscoveryError::DuplicateSubscription,
        }
    }
}

pub type Result<T> = std::result::Result<T, DiscoveryError>;

pub type RadioResult<T> = std::result::Result<T, RadioError>;
