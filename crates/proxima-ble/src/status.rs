//! Operational status snapshots

use proxima_core::{CacheStats, RadioId, Stamp};
use serde::{Deserialize, Serialize};

use crate::peer::ScanPhase;

/// Advertiser side of the engine
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertiserStatus {
    /// Number of published services
    pub published: usize,
    /// Stamp currently announced, if anything is published
    pub stamp: Option<Stamp>,
    /// Whether the radio is broadcasting
    pub broadcasting: bool,
    /// Radio failures while updating the GATT server or broadcast
    pub broadcast_failures: u64,
}

/// Counters kept by the scan pipeline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanCounters {
    /// Sightings with a well-formed stamp
    pub sightings: u64,
    /// Sightings dropped because the stamp was already cached
    pub sightings_known: u64,
    /// Sightings dropped because the peer already had a fetch pending
    pub sightings_deduped: u64,
    pub fetches_started: u64,
    pub fetches_succeeded: u64,
    pub fetches_failed: u64,
    /// Subset of `fetches_failed` caused by the fetch timeout
    pub fetches_timed_out: u64,
    pub fetches_cancelled: u64,
}

/// Scanner side of the engine
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannerStatus {
    /// At least one subscription is registered
    pub active: bool,
    /// The radio scan is running (it pauses during fetches)
    pub scanning: bool,
    pub phase: ScanPhase,
    /// Peer currently being fetched
    pub in_flight: Option<RadioId>,
    /// Fetches waiting behind the in-flight one
    pub queued: usize,
    pub counters: ScanCounters,
}

/// Debug snapshot of the whole engine
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryStatus {
    pub enabled: bool,
    /// Why the engine is disabled, if it is
    pub disabled_reason: Option<String>,
    pub advertiser: AdvertiserStatus,
    pub scanner: ScannerStatus,
    pub cache: CacheStats,
}
