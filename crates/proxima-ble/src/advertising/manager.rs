//! Publishing local advertisements
//!
//! [`Advertiser`] owns the set of published services. Every change draws a
//! fresh random stamp and hands the desired radio state to a single driver
//! task, which reconciles the GATT server and restarts the broadcast. Callers
//! wait until the driver has applied their change, but no lock is held while
//! the radio works.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use proxima_core::{codec, AdId, Advertisement, CharacteristicMap, Stamp};
use rand_core::{OsRng, RngCore};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{DiscoveryError, Result};
use crate::protocol::stamp_payload;
use crate::radio::Peripheral;
use crate::status::AdvertiserStatus;

// ----------------------------------------------------------------------------
// Advertiser State
// ----------------------------------------------------------------------------

#[derive(Clone)]
struct Published {
    ad_id: AdId,
    characteristics: Arc<CharacteristicMap>,
}

#[derive(Default)]
struct AdvertiserState {
    published: BTreeMap<Uuid, Published>,
    stamp: Option<Stamp>,
    generation: u64,
}

/// What the radio should look like after a change
#[derive(Clone, Default)]
struct DesiredState {
    generation: u64,
    stamp: Option<Stamp>,
    services: BTreeMap<Uuid, Arc<CharacteristicMap>>,
}

#[derive(Default)]
struct BroadcastFlags {
    broadcasting: AtomicBool,
    failures: AtomicU64,
}

// ----------------------------------------------------------------------------
// Advertiser
// ----------------------------------------------------------------------------

/// Publishes advertisements as GATT services behind a rotating stamp
pub struct Advertiser {
    state: Mutex<AdvertiserState>,
    desired_tx: watch::Sender<DesiredState>,
    applied_rx: watch::Receiver<u64>,
    flags: Arc<BroadcastFlags>,
    driver: JoinHandle<()>,
}

impl Advertiser {
    /// Create an advertiser and spawn its radio driver
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(peripheral: Arc<dyn Peripheral>, manufacturer_id: u16) -> Self {
        let (desired_tx, desired_rx) = watch::channel(DesiredState::default());
        let (applied_tx, applied_rx) = watch::channel(0u64);
        let flags = Arc::new(BroadcastFlags::default());

        let driver = RadioDriver {
            peripheral,
            manufacturer_id,
            installed: BTreeMap::new(),
            flags: flags.clone(),
        };
        let driver = tokio::spawn(driver.run(desired_rx, applied_tx));

        Self {
            state: Mutex::new(AdvertiserState::default()),
            desired_tx,
            applied_rx,
            flags,
            driver,
        }
    }

    fn state(&self) -> MutexGuard<'_, AdvertiserState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish `advertisement` as service `service_id`
    ///
    /// Publishing an existing service id replaces its content. Publishing an
    /// advertisement id that another service already carries is rejected.
    /// A zero content hash is replaced by the computed one.
    pub async fn publish(&self, service_id: Uuid, mut advertisement: Advertisement) -> Result<()> {
        if advertisement.hash.is_zero() {
            advertisement.hash = advertisement.compute_hash();
        }
        advertisement.lost = false;
        let characteristics = Arc::new(codec::encode(&advertisement)?);

        let generation = {
            let mut state = self.state();
            if let Some((other, _)) = state
                .published
                .iter()
                .find(|(id, p)| **id != service_id && p.ad_id == advertisement.id)
            {
                return Err(DiscoveryError::DuplicateAdvertisement {
                    ad_id: advertisement.id,
                    service_id: *other,
                });
            }
            state.published.insert(
                service_id,
                Published {
                    ad_id: advertisement.id,
                    characteristics,
                },
            );
            self.republish(&mut state)
        };

        info!(
            "Published {} ({}) as service {}",
            advertisement.id, advertisement.interface_name, service_id
        );
        self.wait_applied(generation).await;
        Ok(())
    }

    /// Stop publishing service `service_id`; unknown ids are ignored
    pub async fn unpublish(&self, service_id: Uuid) {
        let generation = {
            let mut state = self.state();
            if state.published.remove(&service_id).is_none() {
                debug!("Service {} is not published", service_id);
                return;
            }
            self.republish(&mut state)
        };

        info!("Unpublished service {}", service_id);
        self.wait_applied(generation).await;
    }

    /// Withdraw everything, leaving the radio idle
    pub async fn clear(&self) {
        let generation = {
            let mut state = self.state();
            if state.published.is_empty() {
                return;
            }
            state.published.clear();
            self.republish(&mut state)
        };
        self.wait_applied(generation).await;
    }

    /// Rotate the stamp and hand the new state to the driver
    fn republish(&self, state: &mut AdvertiserState) -> u64 {
        state.generation += 1;
        state.stamp = if state.published.is_empty() {
            None
        } else {
            Some(next_stamp(state.stamp))
        };

        let desired = DesiredState {
            generation: state.generation,
            stamp: state.stamp,
            services: state
                .published
                .iter()
                .map(|(id, p)| (*id, p.characteristics.clone()))
                .collect(),
        };
        self.desired_tx.send_replace(desired);
        state.generation
    }

    async fn wait_applied(&self, generation: u64) {
        let mut applied = self.applied_rx.clone();
        if applied.wait_for(|g| *g >= generation).await.is_err() {
            warn!("Advertiser driver stopped before applying generation {}", generation);
        }
    }

    pub fn status(&self) -> AdvertiserStatus {
        let state = self.state();
        AdvertiserStatus {
            published: state.published.len(),
            stamp: state.stamp,
            broadcasting: self.flags.broadcasting.load(Ordering::SeqCst),
            broadcast_failures: self.flags.failures.load(Ordering::SeqCst),
        }
    }
}

impl Drop for Advertiser {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// Draw a random stamp different from the current one
fn next_stamp(current: Option<Stamp>) -> Stamp {
    loop {
        let stamp = Stamp::new(OsRng.next_u64());
        if Some(stamp) != current {
            return stamp;
        }
    }
}

// ----------------------------------------------------------------------------
// Radio Driver
// ----------------------------------------------------------------------------

/// Single task applying desired states to the peripheral, in order
struct RadioDriver {
    peripheral: Arc<dyn Peripheral>,
    manufacturer_id: u16,
    installed: BTreeMap<Uuid, Arc<CharacteristicMap>>,
    flags: Arc<BroadcastFlags>,
}

impl RadioDriver {
    async fn run(
        mut self,
        mut desired_rx: watch::Receiver<DesiredState>,
        applied_tx: watch::Sender<u64>,
    ) {
        while desired_rx.changed().await.is_ok() {
            // Intermediate states that were overwritten are never applied
            let desired = desired_rx.borrow_and_update().clone();
            self.apply(&desired).await;
            applied_tx.send_replace(desired.generation);
        }
        debug!("Advertiser driver stopped");
    }

    async fn apply(&mut self, desired: &DesiredState) {
        if self.flags.broadcasting.swap(false, Ordering::SeqCst) {
            if let Err(e) = self.peripheral.stop_broadcast().await {
                self.failed("stop broadcast", &e);
            }
        }

        let stale: Vec<Uuid> = self
            .installed
            .iter()
            .filter(|(id, chars)| desired.services.get(*id) != Some(*chars))
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            self.installed.remove(&id);
            if let Err(e) = self.peripheral.unregister_service(id).await {
                self.failed("unregister service", &e);
            }
        }

        for (id, chars) in &desired.services {
            if self.installed.contains_key(id) {
                continue;
            }
            match self.peripheral.register_service(*id, chars.clone()).await {
                Ok(()) => {
                    self.installed.insert(*id, chars.clone());
                }
                Err(e) => self.failed("register service", &e),
            }
        }

        if let Some(stamp) = desired.stamp {
            match self
                .peripheral
                .start_broadcast(self.manufacturer_id, stamp_payload(stamp))
                .await
            {
                Ok(()) => {
                    self.flags.broadcasting.store(true, Ordering::SeqCst);
                    debug!(
                        "Broadcasting stamp {} for {} services",
                        stamp,
                        self.installed.len()
                    );
                }
                Err(e) => self.failed("start broadcast", &e),
            }
        }
    }

    fn failed(&self, action: &str, error: &crate::error::RadioError) {
        self.flags.failures.fetch_add(1, Ordering::SeqCst);
        warn!("Advertiser failed to {}: {}", action, error);
    }
}
