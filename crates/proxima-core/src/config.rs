//! Peer cache configuration

use core::time::Duration;

// ----------------------------------------------------------------------------
// Cache Configuration
// ----------------------------------------------------------------------------

/// Configuration for the peer cache
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CacheConfig {
    /// Maximum time a peer may go unseen before its advertisements are
    /// reported lost
    pub freshness_window: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            freshness_window: Duration::from_secs(90),
        }
    }
}

impl CacheConfig {
    /// Create a new configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the freshness window
    pub fn with_freshness_window(mut self, window: Duration) -> Self {
        self.freshness_window = window;
        self
    }

    /// Period of the eviction sweep, half the freshness window
    pub fn sweep_period(&self) -> Duration {
        self.freshness_window / 2
    }
}
