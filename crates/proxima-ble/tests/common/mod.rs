//! In-memory radios for driving the discovery engine in tests
//!
//! [`MockPeripheral`] records what an engine publishes. [`MockCentral`]
//! resolves peers to mock peripherals, so one engine can fetch exactly what
//! another published without any hardware.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use proxima_ble::protocol::GENERIC_ACCESS_UUID;
use proxima_ble::{
    stamp_payload, Central, DiscoveryConfig, DiscoveryEngine, GattLink, Peripheral, RadioError,
    RadioResult, RemoteCharacteristic, RemoteService, Sighting,
};
use proxima_core::{codec, AdId, Advertisement, CharacteristicMap, Handler, RadioId, Stamp, TimeSource, Timestamp};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Device name characteristic of the Generic Access service
pub const DEVICE_NAME_UUID: Uuid = Uuid::from_u128(0x00002A00_0000_1000_8000_00805F9B34FB);

/// Let background tasks run until they are idle or `duration` of paused
/// time has elapsed
pub async fn settle(duration: Duration) {
    tokio::time::sleep(duration).await;
}

pub fn lamp(n: u8) -> Advertisement {
    Advertisement::new(AdId::new([n; 16]), "lamp").with_attribute("room", n.to_string())
}

pub fn service_id(n: u128) -> Uuid {
    Uuid::from_u128(0x5e41_0000 + n)
}

// ----------------------------------------------------------------------------
// Clock Following Tokio Time
// ----------------------------------------------------------------------------

/// Time source that advances with tokio's (possibly paused) clock
#[derive(Debug, Clone)]
pub struct TokioClock {
    origin: tokio::time::Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
        }
    }
}

impl TimeSource for TokioClock {
    fn now(&self) -> Timestamp {
        Timestamp::new(self.origin.elapsed().as_millis() as u64)
    }
}

// ----------------------------------------------------------------------------
// Recording Subscriber
// ----------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<Advertisement>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handler(&self) -> Handler {
        let events = self.events.clone();
        Arc::new(move |ad: &Advertisement| {
            events.lock().unwrap().push(ad.clone());
        })
    }

    pub fn events(&self) -> Vec<Advertisement> {
        self.events.lock().unwrap().clone()
    }

    pub fn added(&self) -> Vec<Advertisement> {
        self.events().into_iter().filter(|ad| !ad.lost).collect()
    }

    pub fn lost(&self) -> Vec<Advertisement> {
        self.events().into_iter().filter(|ad| ad.lost).collect()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

// ----------------------------------------------------------------------------
// Mock Peripheral
// ----------------------------------------------------------------------------

#[derive(Debug, Default, Clone)]
pub struct PeripheralState {
    pub services: BTreeMap<Uuid, Arc<CharacteristicMap>>,
    pub broadcast: Option<Vec<u8>>,
    /// Every payload ever broadcast, in order
    pub broadcasts: Vec<Vec<u8>>,
    pub manufacturer_id: Option<u16>,
}

#[derive(Debug, Default)]
pub struct MockPeripheral {
    state: Mutex<PeripheralState>,
}

impl MockPeripheral {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A peripheral already serving `advertisements` under `stamp`
    pub fn serving(stamp: Stamp, advertisements: &[(Uuid, Advertisement)]) -> Arc<Self> {
        let peripheral = Self::default();
        {
            let mut state = peripheral.lock();
            for (service, ad) in advertisements {
                let ad = ad.clone().with_computed_hash();
                let map = codec::encode(&ad).expect("test advertisement encodes");
                state.services.insert(*service, Arc::new(map));
            }
            state.broadcast = Some(stamp_payload(stamp));
        }
        Arc::new(peripheral)
    }

    fn lock(&self) -> MutexGuard<'_, PeripheralState> {
        self.state.lock().unwrap()
    }

    pub fn snapshot(&self) -> PeripheralState {
        self.lock().clone()
    }

    /// Stamp currently broadcast, decoded from the payload
    pub fn broadcast_stamp(&self) -> Option<Stamp> {
        self.lock()
            .broadcast
            .as_ref()
            .and_then(|payload| codec::decode_stamp(payload))
    }
}

#[async_trait]
impl Peripheral for MockPeripheral {
    async fn register_service(
        &self,
        service: Uuid,
        characteristics: Arc<CharacteristicMap>,
    ) -> RadioResult<()> {
        self.lock().services.insert(service, characteristics);
        Ok(())
    }

    async fn unregister_service(&self, service: Uuid) -> RadioResult<()> {
        self.lock().services.remove(&service);
        Ok(())
    }

    async fn start_broadcast(&self, manufacturer_id: u16, payload: Vec<u8>) -> RadioResult<()> {
        let mut state = self.lock();
        state.manufacturer_id = Some(manufacturer_id);
        state.broadcast = Some(payload.clone());
        state.broadcasts.push(payload);
        Ok(())
    }

    async fn stop_broadcast(&self) -> RadioResult<()> {
        self.lock().broadcast = None;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Mock Central
// ----------------------------------------------------------------------------

/// How a peer's GATT server behaves once connected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behaviour {
    Normal,
    RefuseConnect,
    /// The link drops on the first read
    DropDuringRead,
    /// Reads never complete
    HangOnRead,
    /// Connecting never completes, though the radio holds a connection
    /// until the attempt is cancelled
    HangOnConnect,
    /// Reads of this one characteristic fail
    FailRead(Uuid),
    /// Every characteristic is discovered as not readable
    WriteOnly,
}

/// What the central observed
#[derive(Debug, Default, Clone)]
pub struct CentralCounters {
    pub scanning: bool,
    pub scan_starts: usize,
    pub scan_stops: usize,
    pub connects: Vec<RadioId>,
    pub open_links: usize,
    pub max_open_links: usize,
    pub disconnects: usize,
    pub connect_cancels: usize,
    /// `(service, characteristic)` of every read issued
    pub reads: Vec<(Uuid, Uuid)>,
    pub active_reads: usize,
    pub max_active_reads: usize,
}

struct Device {
    peripheral: Arc<MockPeripheral>,
    behaviour: Behaviour,
}

#[derive(Default)]
struct CentralState {
    devices: HashMap<RadioId, Device>,
    sink: Option<mpsc::UnboundedSender<Sighting>>,
    /// Peers with a connection nobody holds a link for
    half_open: HashSet<RadioId>,
    manufacturer_id: u16,
    counters: CentralCounters,
}

#[derive(Clone, Default)]
pub struct MockCentral {
    state: Arc<Mutex<CentralState>>,
}

impl MockCentral {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, CentralState> {
        self.state.lock().unwrap()
    }

    /// Make `peripheral` reachable as `peer`
    pub fn add_device(&self, peer: &str, peripheral: Arc<MockPeripheral>, behaviour: Behaviour) {
        self.lock().devices.insert(
            RadioId::from(peer),
            Device {
                peripheral,
                behaviour,
            },
        );
    }

    pub fn set_behaviour(&self, peer: &str, behaviour: Behaviour) {
        if let Some(device) = self.lock().devices.get_mut(&RadioId::from(peer)) {
            device.behaviour = behaviour;
        }
    }

    /// Deliver `peer`'s current broadcast to the scanner
    ///
    /// Returns false if the scan is stopped or the peer is not broadcasting.
    pub fn sight(&self, peer: &str) -> bool {
        let payload = {
            let state = self.lock();
            let Some(device) = state.devices.get(&RadioId::from(peer)) else {
                return false;
            };
            let payload = device.peripheral.lock().broadcast.clone();
            payload
        };
        match payload {
            Some(payload) => self.sight_raw(peer, payload),
            None => false,
        }
    }

    /// Deliver an arbitrary manufacturer payload from `peer`
    pub fn sight_raw(&self, peer: &str, payload: Vec<u8>) -> bool {
        let state = self.lock();
        let Some(sink) = state.sink.as_ref().filter(|_| state.counters.scanning) else {
            return false;
        };
        sink.send(Sighting {
            peer: RadioId::from(peer),
            manufacturer_data: payload,
        })
        .is_ok()
    }

    pub fn counters(&self) -> CentralCounters {
        self.lock().counters.clone()
    }

    pub fn manufacturer_id(&self) -> u16 {
        self.lock().manufacturer_id
    }
}

#[async_trait]
impl Central for MockCentral {
    async fn start_scan(
        &self,
        manufacturer_id: u16,
        sink: mpsc::UnboundedSender<Sighting>,
    ) -> RadioResult<()> {
        let mut state = self.lock();
        state.sink = Some(sink);
        state.manufacturer_id = manufacturer_id;
        state.counters.scanning = true;
        state.counters.scan_starts += 1;
        Ok(())
    }

    async fn stop_scan(&self) -> RadioResult<()> {
        let mut state = self.lock();
        state.sink = None;
        state.counters.scanning = false;
        state.counters.scan_stops += 1;
        Ok(())
    }

    async fn connect(&self, peer: &RadioId) -> RadioResult<Arc<dyn GattLink>> {
        let hang = {
            let mut state = self.lock();
            state.counters.connects.push(peer.clone());

            let device = state
                .devices
                .get(peer)
                .ok_or_else(|| RadioError::PeerNotFound {
                    peer: peer.to_string(),
                })?;
            let behaviour = device.behaviour;
            if behaviour == Behaviour::RefuseConnect {
                return Err(RadioError::ConnectFailed {
                    peer: peer.to_string(),
                    reason: "refused".to_string(),
                });
            }
            let services = device.peripheral.lock().services.clone();

            let counters = &mut state.counters;
            counters.open_links += 1;
            counters.max_open_links = counters.max_open_links.max(counters.open_links);

            if behaviour == Behaviour::HangOnConnect {
                state.half_open.insert(peer.clone());
                None
            } else {
                Some(MockLink {
                    services,
                    behaviour,
                    central: self.state.clone(),
                    closed: AtomicBool::new(false),
                })
            }
        };

        match hang {
            Some(link) => Ok(Arc::new(link)),
            None => std::future::pending().await,
        }
    }

    async fn cancel_connect(&self, peer: &RadioId) -> RadioResult<()> {
        let mut state = self.lock();
        state.counters.connect_cancels += 1;
        if state.half_open.remove(peer) {
            state.counters.open_links -= 1;
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Mock Link
// ----------------------------------------------------------------------------

struct MockLink {
    services: BTreeMap<Uuid, Arc<CharacteristicMap>>,
    behaviour: Behaviour,
    central: Arc<Mutex<CentralState>>,
    closed: AtomicBool,
}

/// Counts a read as active until dropped, including when cancelled
struct ActiveRead(Arc<Mutex<CentralState>>);

impl ActiveRead {
    fn start(central: &Arc<Mutex<CentralState>>, service: Uuid, characteristic: Uuid) -> Self {
        let mut state = central.lock().unwrap();
        let counters = &mut state.counters;
        counters.reads.push((service, characteristic));
        counters.active_reads += 1;
        counters.max_active_reads = counters.max_active_reads.max(counters.active_reads);
        Self(central.clone())
    }
}

impl Drop for ActiveRead {
    fn drop(&mut self) {
        self.0.lock().unwrap().counters.active_reads -= 1;
    }
}

#[async_trait]
impl GattLink for MockLink {
    async fn discover(&self) -> RadioResult<Vec<RemoteService>> {
        let mut services = vec![RemoteService {
            uuid: GENERIC_ACCESS_UUID,
            characteristics: vec![RemoteCharacteristic {
                uuid: DEVICE_NAME_UUID,
                readable: true,
            }],
        }];
        for (uuid, characteristics) in &self.services {
            services.push(RemoteService {
                uuid: *uuid,
                characteristics: characteristics
                    .keys()
                    .map(|c| RemoteCharacteristic {
                        uuid: *c,
                        readable: self.behaviour != Behaviour::WriteOnly,
                    })
                    .collect(),
            });
        }
        Ok(services)
    }

    async fn read(&self, service: Uuid, characteristic: Uuid) -> RadioResult<Vec<u8>> {
        let _active = ActiveRead::start(&self.central, service, characteristic);

        match self.behaviour {
            Behaviour::DropDuringRead => return Err(RadioError::Disconnected),
            Behaviour::HangOnRead => std::future::pending::<()>().await,
            Behaviour::FailRead(failing) if failing == characteristic => {
                return Err(RadioError::ReadFailed {
                    characteristic,
                    reason: "attribute not found".to_string(),
                })
            }
            Behaviour::WriteOnly => {
                return Err(RadioError::ReadFailed {
                    characteristic,
                    reason: "read not permitted".to_string(),
                })
            }
            _ => {}
        }

        tokio::time::sleep(Duration::from_millis(5)).await;
        self.services
            .get(&service)
            .and_then(|chars| chars.get(&characteristic))
            .cloned()
            .ok_or(RadioError::ReadFailed {
                characteristic,
                reason: "no such characteristic".to_string(),
            })
    }

    async fn disconnect(&self) -> RadioResult<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let mut state = self.central.lock().unwrap();
            state.counters.open_links -= 1;
            state.counters.disconnects += 1;
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Engines
// ----------------------------------------------------------------------------

pub fn engine(
    config: DiscoveryConfig,
    central: Arc<MockCentral>,
    peripheral: Arc<MockPeripheral>,
) -> DiscoveryEngine<TokioClock> {
    DiscoveryEngine::with_time_source(config, central, peripheral, TokioClock::new())
}

/// Engine that only publishes, with its peripheral
pub fn publisher() -> (DiscoveryEngine<TokioClock>, Arc<MockPeripheral>) {
    let peripheral = MockPeripheral::new();
    let engine = engine(DiscoveryConfig::default(), MockCentral::new(), peripheral.clone());
    (engine, peripheral)
}

/// Engine that only scans, with its central
pub fn scanner(config: DiscoveryConfig) -> (DiscoveryEngine<TokioClock>, Arc<MockCentral>) {
    let central = MockCentral::new();
    let engine = engine(config, central.clone(), MockPeripheral::new());
    (engine, central)
}
