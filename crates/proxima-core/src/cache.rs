//! Time-bounded cache of advertisements fetched from peers
//!
//! Entries are keyed by the stamp a peer broadcast when its advertisements
//! were fetched, with a secondary index by radio id. Every change to the
//! cached state is fanned out to subscribers as per-advertisement events:
//! additions as-is, removals with `lost` set.
//!
//! Two locks guard the cache. `state` holds entries and subscriptions and is
//! only ever held briefly. `delivery` is held from the moment a change is
//! applied until its events have been handed to every handler, so events
//! reach handlers in the order the changes happened and no callback fires
//! after [`PeerCache::remove_subscription`] returns. Handlers run with only
//! `delivery` held: they may read the cache ([`PeerCache::stats`],
//! [`PeerCache::cached_advertisements`]) but must not change it.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::advertisement::Advertisement;
use crate::config::CacheConfig;
use crate::errors::CacheError;
use crate::types::{AdHash, AdId, RadioId, Stamp, SystemTimeSource, TimeSource, Timestamp};

// ----------------------------------------------------------------------------
// Subscriber Callbacks
// ----------------------------------------------------------------------------

/// Receives advertisement events from the cache
pub trait ScanHandler: Send + Sync {
    /// Called for every added advertisement and, with `lost` set, for every
    /// removed one
    fn on_advertisement(&self, ad: &Advertisement);
}

impl<F> ScanHandler for F
where
    F: Fn(&Advertisement) + Send + Sync,
{
    fn on_advertisement(&self, ad: &Advertisement) {
        self(ad)
    }
}

/// Shared handle to a subscriber; identity is the allocation it points to
pub type Handler = Arc<dyn ScanHandler>;

fn same_handler(a: &Handler, b: &Handler) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

struct Subscription {
    interface_filter: String,
    handler: Handler,
}

/// One advertisement event and the handlers it is owed to
struct Delivery {
    handlers: Vec<Handler>,
    ad: Advertisement,
}

fn deliver(deliveries: Vec<Delivery>) {
    for delivery in deliveries {
        for handler in &delivery.handlers {
            handler.on_advertisement(&delivery.ad);
        }
    }
}

// ----------------------------------------------------------------------------
// Cache State
// ----------------------------------------------------------------------------

struct CacheEntry {
    peer: RadioId,
    advertisements: Vec<Advertisement>,
    last_seen: Timestamp,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<Stamp, CacheEntry>,
    by_peer: HashMap<RadioId, Stamp>,
    subscriptions: Vec<Subscription>,
}

impl CacheState {
    /// Queue `ad` for every subscription whose filter it matches
    fn notify(&self, ad: Advertisement, out: &mut Vec<Delivery>) {
        let handlers: Vec<Handler> = self
            .subscriptions
            .iter()
            .filter(|s| ad.matches(&s.interface_filter))
            .map(|s| s.handler.clone())
            .collect();
        if !handlers.is_empty() {
            out.push(Delivery { handlers, ad });
        }
    }

    /// Drop an entry and its index, if the index still points at it
    fn take_entry(&mut self, stamp: &Stamp) -> Option<CacheEntry> {
        let entry = self.entries.remove(stamp)?;
        if self.by_peer.get(&entry.peer) == Some(stamp) {
            self.by_peer.remove(&entry.peer);
        }
        Some(entry)
    }
}

/// Number of events produced by applying a fetch result
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheDelta {
    pub added: usize,
    pub removed: usize,
}

/// Point-in-time cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub peers: usize,
    pub advertisements: usize,
    pub subscriptions: usize,
}

// ----------------------------------------------------------------------------
// Peer Cache
// ----------------------------------------------------------------------------

/// Cache of peer advertisements with subscriber fan-out and freshness eviction
pub struct PeerCache<T: TimeSource = SystemTimeSource> {
    config: CacheConfig,
    time_source: T,
    state: Mutex<CacheState>,
    delivery: Mutex<()>,
}

impl PeerCache<SystemTimeSource> {
    /// Create a cache driven by the wall clock
    pub fn new(config: CacheConfig) -> Self {
        Self::with_time_source(config, SystemTimeSource)
    }
}

impl<T: TimeSource> PeerCache<T> {
    /// Create a cache driven by the given time source
    pub fn with_time_source(config: CacheConfig, time_source: T) -> Self {
        Self {
            config,
            time_source,
            state: Mutex::new(CacheState::default()),
            delivery: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Always taken before `state`
    fn delivery(&self) -> MutexGuard<'_, ()> {
        self.delivery.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply a successful fetch of `peer`'s advertisements under `stamp`
    ///
    /// Advertisements are compared by id and content hash, so unchanged
    /// content produces no events. Removals are emitted before additions.
    pub fn on_fetch_success(
        &self,
        stamp: Stamp,
        peer: RadioId,
        advertisements: Vec<Advertisement>,
    ) -> CacheDelta {
        let now = self.time_source.now();
        let _delivery = self.delivery();
        let mut state = self.state();

        let mut previous = Vec::new();
        if let Some(old_stamp) = state.by_peer.get(&peer).copied() {
            if let Some(entry) = state.take_entry(&old_stamp) {
                previous = entry.advertisements;
            }
        }
        // The same stamp may still be filed under the peer's previous address
        if let Some(entry) = state.take_entry(&stamp) {
            debug!("Re-keying stamp {} from {} to {}", stamp, entry.peer, peer);
            previous.extend(entry.advertisements);
        }

        let new_keys: HashSet<(AdId, AdHash)> = advertisements.iter().map(|a| a.key()).collect();
        let mut old_keys: HashSet<(AdId, AdHash)> = HashSet::new();

        let mut deliveries = Vec::new();
        let mut delta = CacheDelta::default();
        for ad in &previous {
            if !old_keys.insert(ad.key()) || new_keys.contains(&ad.key()) {
                continue;
            }
            state.notify(ad.as_lost(), &mut deliveries);
            delta.removed += 1;
        }
        for ad in advertisements.iter().filter(|a| !old_keys.contains(&a.key())) {
            state.notify(ad.clone(), &mut deliveries);
            delta.added += 1;
        }

        debug!(
            "Cached {} advertisements from {} under stamp {} (+{} -{})",
            advertisements.len(),
            peer,
            stamp,
            delta.added,
            delta.removed
        );

        state.by_peer.insert(peer.clone(), stamp);
        state.entries.insert(
            stamp,
            CacheEntry {
                peer,
                advertisements,
                last_seen: now,
            },
        );
        drop(state);

        deliver(deliveries);
        delta
    }

    /// Record a failed fetch; cached state is left untouched
    pub fn on_fetch_failure(&self, peer: &RadioId, reason: &str) {
        debug!("Fetch from {} failed: {}", peer, reason);
    }

    /// Check whether advertisements under `stamp` are already cached
    ///
    /// A hit refreshes the entry's last-seen time and files it under `peer`
    /// when the peer's radio id rotated but its stamp did not. An entry the
    /// new address held under another stamp is evicted and reported lost.
    pub fn have_seen(&self, stamp: Stamp, peer: &RadioId) -> bool {
        let now = self.time_source.now();
        let _delivery = self.delivery();
        let mut state = self.state();

        let Some(entry) = state.entries.get_mut(&stamp) else {
            return false;
        };
        entry.last_seen = now;
        if entry.peer == *peer {
            return true;
        }

        let old_peer = std::mem::replace(&mut entry.peer, peer.clone());
        if state.by_peer.get(&old_peer) == Some(&stamp) {
            state.by_peer.remove(&old_peer);
        }
        trace!("Peer {} rotated to {} under stamp {}", old_peer, peer, stamp);

        let mut deliveries = Vec::new();
        if let Some(stale) = state.by_peer.insert(peer.clone(), stamp) {
            if stale != stamp {
                if let Some(entry) = state.entries.remove(&stale) {
                    debug!("Evicting stamp {} superseded at {}", stale, peer);
                    for ad in &entry.advertisements {
                        state.notify(ad.as_lost(), &mut deliveries);
                    }
                }
            }
        }
        drop(state);

        deliver(deliveries);
        true
    }

    /// Register a subscriber and replay every cached match to it
    pub fn add_subscription(
        &self,
        interface_filter: impl Into<String>,
        handler: Handler,
    ) -> Result<(), CacheError> {
        let _delivery = self.delivery();
        let mut state = self.state();
        if state
            .subscriptions
            .iter()
            .any(|s| same_handler(&s.handler, &handler))
        {
            return Err(CacheError::DuplicateSubscription);
        }

        let interface_filter = interface_filter.into();
        let replay: Vec<Advertisement> = state
            .entries
            .values()
            .flat_map(|entry| entry.advertisements.iter())
            .filter(|a| a.matches(&interface_filter))
            .cloned()
            .collect();

        state.subscriptions.push(Subscription {
            interface_filter,
            handler: handler.clone(),
        });
        drop(state);

        for ad in &replay {
            handler.on_advertisement(ad);
        }
        Ok(())
    }

    /// Deregister a subscriber; returns false if it was not registered
    ///
    /// Waits for any delivery in progress, so the handler is never called
    /// once this returns.
    pub fn remove_subscription(&self, handler: &Handler) -> bool {
        let _delivery = self.delivery();
        let mut state = self.state();
        let before = state.subscriptions.len();
        state
            .subscriptions
            .retain(|s| !same_handler(&s.handler, handler));
        state.subscriptions.len() != before
    }

    pub fn subscription_count(&self) -> usize {
        self.state().subscriptions.len()
    }

    /// Evict entries not seen within the freshness window
    ///
    /// Every advertisement an evicted entry held is reported lost. Returns
    /// the number of evicted peers.
    pub fn sweep(&self) -> usize {
        let now = self.time_source.now();
        let window = self.config.freshness_window.as_millis() as u64;
        let _delivery = self.delivery();
        let mut state = self.state();

        let stale: Vec<Stamp> = state
            .entries
            .iter()
            .filter(|(_, entry)| now - entry.last_seen > window)
            .map(|(stamp, _)| *stamp)
            .collect();

        let mut deliveries = Vec::new();
        for stamp in &stale {
            if let Some(entry) = state.take_entry(stamp) {
                debug!(
                    "Evicting {} advertisements from {} (stamp {})",
                    entry.advertisements.len(),
                    entry.peer,
                    stamp
                );
                for ad in &entry.advertisements {
                    state.notify(ad.as_lost(), &mut deliveries);
                }
            }
        }
        drop(state);

        deliver(deliveries);
        stale.len()
    }

    /// Snapshot of every cached advertisement
    pub fn cached_advertisements(&self) -> Vec<Advertisement> {
        self.state()
            .entries
            .values()
            .flat_map(|entry| entry.advertisements.iter().cloned())
            .collect()
    }

    /// Number of peers with a cached entry
    pub fn peer_count(&self) -> usize {
        self.state().entries.len()
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state();
        CacheStats {
            peers: state.entries.len(),
            advertisements: state.entries.values().map(|e| e.advertisements.len()).sum(),
            subscriptions: state.subscriptions.len(),
        }
    }

    /// Drop every cached entry without notifying anyone
    pub fn clear(&self) {
        let _delivery = self.delivery();
        let mut state = self.state();
        state.entries.clear();
        state.by_peer.clear();
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
