//! Test utilities for deterministic testing of the discovery core
//!
//! Provides a controllable clock and a recording subscriber.

use proxima_core::{AdId, Advertisement, Handler, TimeSource, Timestamp};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

// ----------------------------------------------------------------------------
// Mock Time Source
// ----------------------------------------------------------------------------

/// Mock time source for deterministic testing
///
/// This allows tests to control the flow of time precisely, making
/// freshness-dependent tests deterministic and fast.
#[derive(Debug, Clone)]
pub struct MockTimeSource {
    current_time: Arc<AtomicU64>,
}

impl MockTimeSource {
    /// Create a new mock time source starting at a specific time
    pub fn new_at(start_time: u64) -> Self {
        Self {
            current_time: Arc::new(AtomicU64::new(start_time)),
        }
    }

    /// Advance time by the specified number of milliseconds
    #[allow(dead_code)]
    pub fn advance(&self, millis: u64) {
        self.current_time.fetch_add(millis, Ordering::SeqCst);
    }

    /// Set the time to a specific value
    #[allow(dead_code)]
    pub fn set_time(&self, millis: u64) {
        self.current_time.store(millis, Ordering::SeqCst);
    }
}

impl TimeSource for MockTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp::new(self.current_time.load(Ordering::SeqCst))
    }
}

// ----------------------------------------------------------------------------
// Recording Subscriber
// ----------------------------------------------------------------------------

/// Subscriber that records every event it receives
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<Advertisement>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handler that appends to this recorder
    pub fn handler(&self) -> Handler {
        let events = self.events.clone();
        Arc::new(move |ad: &Advertisement| {
            events.lock().unwrap().push(ad.clone());
        })
    }

    pub fn events(&self) -> Vec<Advertisement> {
        self.events.lock().unwrap().clone()
    }

    #[allow(dead_code)]
    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

// ----------------------------------------------------------------------------
// Fixtures
// ----------------------------------------------------------------------------

/// Advertisement with a distinct id and a computed hash
pub fn test_ad(n: u8, interface_name: &str) -> Advertisement {
    Advertisement::new(AdId::new([n; 16]), interface_name)
        .with_attribute("n", n.to_string())
        .with_computed_hash()
}
