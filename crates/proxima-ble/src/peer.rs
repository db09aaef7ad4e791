//! Fetch bookkeeping for sighted peers

use proxima_core::{RadioId, Stamp};
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Scan Pipeline Phases
// ----------------------------------------------------------------------------

/// Where the scan pipeline currently is
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanPhase {
    /// No subscriptions; the radio scan is stopped
    #[default]
    Idle,
    /// Waiting for sightings
    Scanning,
    /// Opening a GATT connection to the in-flight peer
    Connecting,
    /// Enumerating the in-flight peer's services
    Discovering,
    /// Reading characteristics one at a time
    Reading,
}

// ----------------------------------------------------------------------------
// Pending Fetches
// ----------------------------------------------------------------------------

/// A peer whose advertisements need to be read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingFetch {
    pub peer: RadioId,
    /// Stamp the peer announced when it was sighted
    pub stamp: Stamp,
}

impl PendingFetch {
    pub fn new(peer: RadioId, stamp: Stamp) -> Self {
        Self { peer, stamp }
    }
}
