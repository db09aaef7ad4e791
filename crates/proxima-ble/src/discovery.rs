//! Central role on top of btleplug
//!
//! Scanning forwards every advertisement carrying our manufacturer id to the
//! scan pipeline, and remembers the btleplug id behind each radio id so that
//! the pipeline can later connect by radio id alone.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use btleplug::api::{Central as _, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, PeripheralId};
use futures::stream::StreamExt;
use proxima_core::RadioId;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::connection::BtleplugLink;
use crate::error::{RadioError, RadioResult};
use crate::radio::{Central, GattLink, Sighting};

type KnownPeers = Arc<Mutex<HashMap<RadioId, PeripheralId>>>;

fn lock_known(peers: &KnownPeers) -> MutexGuard<'_, HashMap<RadioId, PeripheralId>> {
    peers.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Radio id under which a btleplug peripheral is reported
pub fn radio_id(id: &PeripheralId) -> RadioId {
    RadioId::new(format!("{:?}", id))
}

/// Manufacturer payload btleplug last recorded for a peripheral
async fn stored_payload(adapter: &Adapter, id: &PeripheralId, manufacturer_id: u16) -> Option<Vec<u8>> {
    let peripheral = adapter.peripheral(id).await.ok()?;
    let properties = peripheral.properties().await.ok()??;
    properties.manufacturer_data.get(&manufacturer_id).cloned()
}

// ----------------------------------------------------------------------------
// Btleplug Central
// ----------------------------------------------------------------------------

/// Scanner and GATT client backed by the first btleplug adapter
pub struct BtleplugCentral {
    adapter: Adapter,
    known: KnownPeers,
    scan_task: Mutex<Option<JoinHandle<()>>>,
}

impl BtleplugCentral {
    /// Open the first available BLE adapter
    pub async fn new() -> RadioResult<Self> {
        let manager = Manager::new()
            .await
            .map_err(|e| RadioError::Unavailable(format!("Failed to create BLE manager: {}", e)))?;

        let adapters = manager
            .adapters()
            .await
            .map_err(|e| RadioError::Unavailable(format!("Failed to get BLE adapters: {}", e)))?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or_else(|| RadioError::Unavailable("No BLE adapters available".to_string()))?;

        info!("BLE adapter initialized");
        Ok(Self {
            adapter,
            known: Arc::new(Mutex::new(HashMap::new())),
            scan_task: Mutex::new(None),
        })
    }

    fn take_scan_task(&self) -> Option<JoinHandle<()>> {
        self.scan_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

#[async_trait]
impl Central for BtleplugCentral {
    async fn start_scan(
        &self,
        manufacturer_id: u16,
        sink: mpsc::UnboundedSender<Sighting>,
    ) -> RadioResult<()> {
        if let Some(task) = self.take_scan_task() {
            task.abort();
        }

        let mut events = self
            .adapter
            .events()
            .await
            .map_err(|e| RadioError::Scan(format!("Failed to get adapter events: {}", e)))?;

        // Manufacturer data cannot be filtered on by every backend, so the
        // scan is unfiltered and payloads are matched here
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| RadioError::Scan(format!("Failed to start BLE scan: {}", e)))?;

        let adapter = self.adapter.clone();
        let known = self.known.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let (id, payload) = match event {
                    CentralEvent::ManufacturerDataAdvertisement {
                        id,
                        manufacturer_data,
                    } => {
                        let payload = manufacturer_data.get(&manufacturer_id).cloned();
                        (id, payload)
                    }
                    // Repeat broadcasts of an unchanged payload only show up as updates
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                        let payload = stored_payload(&adapter, &id, manufacturer_id).await;
                        (id, payload)
                    }
                    _ => continue,
                };
                let Some(payload) = payload else {
                    continue;
                };

                let peer = radio_id(&id);
                trace!("Sighting from {}", peer);
                lock_known(&known).insert(peer.clone(), id);

                let sighting = Sighting {
                    peer,
                    manufacturer_data: payload,
                };
                if sink.send(sighting).is_err() {
                    break;
                }
            }
            debug!("BLE event stream ended");
        });
        *self.scan_task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);

        info!("Started BLE scan for manufacturer id {:#06x}", manufacturer_id);
        Ok(())
    }

    async fn stop_scan(&self) -> RadioResult<()> {
        if let Some(task) = self.take_scan_task() {
            task.abort();
        }
        self.adapter
            .stop_scan()
            .await
            .map_err(|e| RadioError::Scan(format!("Failed to stop BLE scan: {}", e)))?;
        debug!("Stopped BLE scan");
        Ok(())
    }

    async fn connect(&self, peer: &RadioId) -> RadioResult<Arc<dyn GattLink>> {
        let id = lock_known(&self.known)
            .get(peer)
            .cloned()
            .ok_or_else(|| RadioError::PeerNotFound {
                peer: peer.to_string(),
            })?;

        let peripheral = self.adapter.peripheral(&id).await.map_err(|e| {
            warn!("Peripheral {} vanished: {}", peer, e);
            RadioError::PeerNotFound {
                peer: peer.to_string(),
            }
        })?;

        peripheral
            .connect()
            .await
            .map_err(|e| RadioError::ConnectFailed {
                peer: peer.to_string(),
                reason: e.to_string(),
            })?;

        debug!("Connected to {}", peer);
        Ok(Arc::new(BtleplugLink::new(peer.clone(), peripheral)))
    }

    async fn cancel_connect(&self, peer: &RadioId) -> RadioResult<()> {
        let Some(id) = lock_known(&self.known).get(peer).cloned() else {
            return Ok(());
        };
        let Ok(peripheral) = self.adapter.peripheral(&id).await else {
            return Ok(());
        };
        // BlueZ also aborts a pending connect on disconnect
        peripheral.disconnect().await.map_err(|e| RadioError::ConnectFailed {
            peer: peer.to_string(),
            reason: format!("cancel failed: {}", e),
        })?;
        debug!("Cancelled connection attempt to {}", peer);
        Ok(())
    }
}

impl Drop for BtleplugCentral {
    fn drop(&mut self) {
        if let Some(task) = self.take_scan_task() {
            task.abort();
        }
    }
}
