//! Discovery engine configuration

use std::time::Duration;

use proxima_core::CacheConfig;

use crate::protocol::DEFAULT_MANUFACTURER_ID;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Configuration for the discovery engine
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DiscoveryConfig {
    /// Manufacturer id carrying the stamp; must match across implementations
    pub manufacturer_id: u16,
    /// Upper bound on one fetch, from connect through the last read
    pub fetch_timeout: Duration,
    /// Stop scanning while a fetch is in flight
    pub pause_scan_during_fetch: bool,
    /// Peer cache settings
    pub cache: CacheConfig,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            manufacturer_id: DEFAULT_MANUFACTURER_ID,
            fetch_timeout: Duration::from_secs(10),
            pause_scan_during_fetch: true,
            cache: CacheConfig::default(),
        }
    }
}

impl DiscoveryConfig {
    /// Create a new configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the manufacturer id
    pub fn with_manufacturer_id(mut self, manufacturer_id: u16) -> Self {
        self.manufacturer_id = manufacturer_id;
        self
    }

    /// Set fetch timeout
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Enable or disable pausing the scan during fetches
    pub fn with_scan_pause(mut self, enabled: bool) -> Self {
        self.pause_scan_during_fetch = enabled;
        self
    }

    /// Set the cache freshness window
    pub fn with_freshness_window(mut self, window: Duration) -> Self {
        self.cache = self.cache.with_freshness_window(window);
        self
    }
}
