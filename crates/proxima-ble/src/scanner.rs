//! Scan and fetch pipeline
//!
//! A single driver task owns all pipeline state: whether scanning is active,
//! the queue of peers waiting to be fetched and the one fetch in flight.
//! Everything reaches it as a message: commands from the engine, sightings
//! from the radio and progress reports from the fetch task. Because only the
//! driver starts fetches, at most one GATT connection is ever open.
//!
//! A fetch runs as a spawned task bounded by the fetch timeout. When it
//! expires the link is disconnected and the fetch fails exactly as if the
//! radio had reported an error. Stopping the pipeline bumps an epoch so that
//! reports from a cancelled fetch are discarded.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use proxima_core::{codec, Advertisement, CharacteristicMap, PeerCache, RadioId, TimeSource};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::DiscoveryConfig;
use crate::error::{RadioError, RadioResult};
use crate::peer::{PendingFetch, ScanPhase};
use crate::protocol::{is_reserved_service, sighting_stamp};
use crate::radio::{Central, GattLink, Sighting};
use crate::status::{ScanCounters, ScannerStatus};

/// Upper bound on closing a link
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Characteristics read from one peer, grouped by owning service
type PeerCharacteristics = BTreeMap<Uuid, CharacteristicMap>;

// ----------------------------------------------------------------------------
// Driver Messages
// ----------------------------------------------------------------------------

enum ScanCommand {
    /// Reconcile scanning with the cache's subscriptions
    Sync { ack: oneshot::Sender<()> },
    /// Cancel everything and exit
    Shutdown { ack: oneshot::Sender<()> },
    /// The fetch of `epoch` moved to a new phase
    Phase { epoch: u64, phase: ScanPhase },
    /// The fetch of `epoch` finished
    FetchDone {
        epoch: u64,
        outcome: RadioResult<PeerCharacteristics>,
    },
}

// ----------------------------------------------------------------------------
// Link Slot
// ----------------------------------------------------------------------------

/// The open link of the in-flight fetch, shared so that whoever ends the
/// fetch can close it
#[derive(Clone, Default)]
struct LinkSlot(Arc<Mutex<Option<Arc<dyn GattLink>>>>);

impl LinkSlot {
    fn lock(&self) -> MutexGuard<'_, Option<Arc<dyn GattLink>>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn put(&self, link: Arc<dyn GattLink>) {
        *self.lock() = Some(link);
    }

    fn take(&self) -> Option<Arc<dyn GattLink>> {
        self.lock().take()
    }

    /// Close the link; when the fetch was `abandoned` before connect
    /// returned, cancel the connection attempt instead
    async fn close(&self, central: &dyn Central, peer: &RadioId, abandoned: bool) {
        let result = match self.take() {
            Some(link) => timeout(DISCONNECT_TIMEOUT, link.disconnect()).await,
            None if abandoned => timeout(DISCONNECT_TIMEOUT, central.cancel_connect(peer)).await,
            None => return,
        };
        match result {
            Ok(Ok(())) => trace!("Disconnected from {}", peer),
            Ok(Err(e)) => debug!("Disconnect from {} failed: {}", peer, e),
            Err(_) => warn!("Disconnect from {} timed out", peer),
        }
    }
}

// ----------------------------------------------------------------------------
// Scan Connector
// ----------------------------------------------------------------------------

/// Handle to the scan pipeline driver
pub struct ScanConnector {
    commands: mpsc::UnboundedSender<ScanCommand>,
    status: Arc<Mutex<ScannerStatus>>,
    driver: JoinHandle<()>,
}

impl ScanConnector {
    /// Spawn the pipeline driver
    ///
    /// The pipeline stays idle until [`sync`](Self::sync) finds at least one
    /// subscription in `cache`.
    pub fn spawn<T>(config: DiscoveryConfig, central: Arc<dyn Central>, cache: Arc<PeerCache<T>>) -> Self
    where
        T: TimeSource + 'static,
    {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (sightings_tx, sightings_rx) = mpsc::unbounded_channel();
        let status = Arc::new(Mutex::new(ScannerStatus::default()));

        let driver = ScanDriver {
            config,
            central,
            cache,
            events: commands_tx.clone(),
            sightings: sightings_tx,
            status: status.clone(),
            active: false,
            scanning: false,
            phase: ScanPhase::Idle,
            queue: VecDeque::new(),
            in_flight: None,
            epoch: 0,
            counters: ScanCounters::default(),
        };
        let driver = tokio::spawn(driver.run(commands_rx, sightings_rx));

        Self {
            commands: commands_tx,
            status,
            driver,
        }
    }

    /// Start or stop the pipeline to match the cache's subscriptions
    ///
    /// Returns once the driver has applied the change. When no subscription
    /// is left the in-flight fetch has been cancelled and its link closed.
    pub async fn sync(&self) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(ScanCommand::Sync { ack }).is_ok() {
            let _ = done.await;
        }
    }

    /// Cancel all work and stop the driver
    pub async fn shutdown(&self) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(ScanCommand::Shutdown { ack }).is_ok() {
            let _ = done.await;
        }
    }

    pub fn status(&self) -> ScannerStatus {
        self.status.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl Drop for ScanConnector {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

// ----------------------------------------------------------------------------
// Scan Driver
// ----------------------------------------------------------------------------

struct InFlight {
    pending: PendingFetch,
    link: LinkSlot,
    task: JoinHandle<()>,
}

struct ScanDriver<T: TimeSource> {
    config: DiscoveryConfig,
    central: Arc<dyn Central>,
    cache: Arc<PeerCache<T>>,
    events: mpsc::UnboundedSender<ScanCommand>,
    sightings: mpsc::UnboundedSender<Sighting>,
    status: Arc<Mutex<ScannerStatus>>,
    active: bool,
    scanning: bool,
    phase: ScanPhase,
    queue: VecDeque<PendingFetch>,
    in_flight: Option<InFlight>,
    epoch: u64,
    counters: ScanCounters,
}

impl<T: TimeSource + 'static> ScanDriver<T> {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<ScanCommand>,
        mut sightings: mpsc::UnboundedReceiver<Sighting>,
    ) {
        loop {
            tokio::select! {
                Some(command) = commands.recv() => {
                    if let ScanCommand::Shutdown { ack } = command {
                        self.deactivate().await;
                        self.publish_status();
                        let _ = ack.send(());
                        break;
                    }
                    self.handle(command).await;
                }
                Some(sighting) = sightings.recv() => {
                    self.on_sighting(sighting).await;
                }
                else => break,
            }
            self.publish_status();
        }
        debug!("Scan driver stopped");
    }

    async fn handle(&mut self, command: ScanCommand) {
        match command {
            ScanCommand::Sync { ack } => {
                if self.cache.subscription_count() > 0 {
                    self.activate().await;
                } else {
                    self.deactivate().await;
                }
                self.publish_status();
                let _ = ack.send(());
            }
            ScanCommand::Phase { epoch, phase } => {
                if epoch == self.epoch && self.in_flight.is_some() {
                    self.phase = phase;
                }
            }
            ScanCommand::FetchDone { epoch, outcome } => {
                if epoch != self.epoch {
                    debug!("Discarding result of cancelled fetch");
                    return;
                }
                self.on_fetch_done(outcome).await;
            }
            ScanCommand::Shutdown { .. } => {}
        }
    }

    // ------------------------------------------------------------------------
    // Activation
    // ------------------------------------------------------------------------

    async fn activate(&mut self) {
        if self.active {
            return;
        }
        self.active = true;
        self.phase = ScanPhase::Scanning;
        info!("Scan pipeline started");
        self.resume_scan().await;
    }

    async fn deactivate(&mut self) {
        if !self.active && self.in_flight.is_none() {
            return;
        }
        self.active = false;
        self.epoch += 1;
        self.queue.clear();

        if let Some(in_flight) = self.in_flight.take() {
            in_flight.task.abort();
            // The task may be mid-poll elsewhere; once it is gone the slot
            // can no longer change
            let _ = in_flight.task.await;
            in_flight
                .link
                .close(&*self.central, &in_flight.pending.peer, true)
                .await;
            self.counters.fetches_cancelled += 1;
            debug!("Cancelled fetch from {}", in_flight.pending.peer);
        }

        self.pause_scan().await;
        self.phase = ScanPhase::Idle;
        info!("Scan pipeline stopped");
    }

    async fn resume_scan(&mut self) {
        if self.scanning {
            return;
        }
        match self
            .central
            .start_scan(self.config.manufacturer_id, self.sightings.clone())
            .await
        {
            Ok(()) => self.scanning = true,
            Err(e) => warn!("Failed to start scan: {}", e),
        }
    }

    async fn pause_scan(&mut self) {
        if !self.scanning {
            return;
        }
        self.scanning = false;
        if let Err(e) = self.central.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }
    }

    // ------------------------------------------------------------------------
    // Sightings
    // ------------------------------------------------------------------------

    async fn on_sighting(&mut self, sighting: Sighting) {
        if !self.active {
            return;
        }
        let Some(stamp) = sighting_stamp(&sighting) else {
            trace!("Ignoring malformed payload from {}", sighting.peer);
            return;
        };
        self.counters.sightings += 1;

        if self.cache.have_seen(stamp, &sighting.peer) {
            self.counters.sightings_known += 1;
            return;
        }

        if let Some(in_flight) = &self.in_flight {
            if in_flight.pending.peer == sighting.peer {
                self.counters.sightings_deduped += 1;
                return;
            }
        }
        if let Some(queued) = self.queue.iter_mut().find(|p| p.peer == sighting.peer) {
            // Fetch whatever the peer announces by the time its turn comes
            queued.stamp = stamp;
            self.counters.sightings_deduped += 1;
            return;
        }

        debug!("Queueing fetch from {} for stamp {}", sighting.peer, stamp);
        self.queue.push_back(PendingFetch::new(sighting.peer, stamp));
        self.advance().await;
    }

    // ------------------------------------------------------------------------
    // Fetches
    // ------------------------------------------------------------------------

    /// Start the next queued fetch if nothing is in flight
    async fn advance(&mut self) {
        if self.in_flight.is_some() || !self.active {
            return;
        }
        let Some(pending) = self.queue.pop_front() else {
            self.phase = ScanPhase::Scanning;
            self.resume_scan().await;
            return;
        };

        if self.config.pause_scan_during_fetch {
            self.pause_scan().await;
        }

        self.counters.fetches_started += 1;
        self.phase = ScanPhase::Connecting;
        debug!("Fetching from {}", pending.peer);

        let link = LinkSlot::default();
        let task = tokio::spawn(run_fetch(
            self.central.clone(),
            pending.peer.clone(),
            link.clone(),
            self.config.fetch_timeout,
            self.epoch,
            self.events.clone(),
        ));
        self.in_flight = Some(InFlight {
            pending,
            link,
            task,
        });
    }

    async fn on_fetch_done(&mut self, outcome: RadioResult<PeerCharacteristics>) {
        let Some(in_flight) = self.in_flight.take() else {
            return;
        };
        let timed_out = matches!(outcome, Err(RadioError::Timeout { .. }));
        in_flight
            .link
            .close(&*self.central, &in_flight.pending.peer, timed_out)
            .await;
        let PendingFetch { peer, stamp } = in_flight.pending;

        match outcome {
            Ok(services) => {
                let advertisements = decode_services(&peer, services);
                let delta = self
                    .cache
                    .on_fetch_success(stamp, peer.clone(), advertisements);
                self.counters.fetches_succeeded += 1;
                debug!(
                    "Fetched {} under stamp {}: {} added, {} removed",
                    peer, stamp, delta.added, delta.removed
                );
            }
            Err(e) => {
                self.counters.fetches_failed += 1;
                if timed_out {
                    self.counters.fetches_timed_out += 1;
                }
                warn!("Fetch from {} failed: {}", peer, e);
                self.cache.on_fetch_failure(&peer, &e.to_string());
            }
        }

        self.advance().await;
    }

    fn publish_status(&self) {
        let snapshot = ScannerStatus {
            active: self.active,
            scanning: self.scanning,
            phase: self.phase,
            in_flight: self.in_flight.as_ref().map(|f| f.pending.peer.clone()),
            queued: self.queue.len(),
            counters: self.counters,
        };
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = snapshot;
    }
}

/// Decode each service into an advertisement, dropping services that carry
/// no identifier
fn decode_services(peer: &RadioId, services: PeerCharacteristics) -> Vec<Advertisement> {
    services
        .into_iter()
        .filter_map(|(service, characteristics)| {
            let advertisement = codec::decode(&characteristics);
            if advertisement.id.is_zero() {
                warn!("Service {} on {} has no advertisement id", service, peer);
                return None;
            }
            Some(advertisement)
        })
        .collect()
}

// ----------------------------------------------------------------------------
// Fetch Task
// ----------------------------------------------------------------------------

async fn run_fetch(
    central: Arc<dyn Central>,
    peer: RadioId,
    link: LinkSlot,
    fetch_timeout: Duration,
    epoch: u64,
    events: mpsc::UnboundedSender<ScanCommand>,
) {
    let outcome = match timeout(
        fetch_timeout,
        read_peer(&*central, &peer, &link, epoch, &events),
    )
    .await
    {
        Ok(outcome) => outcome,
        Err(_) => Err(RadioError::Timeout {
            duration_ms: fetch_timeout.as_millis() as u64,
        }),
    };
    let _ = events.send(ScanCommand::FetchDone { epoch, outcome });
}

async fn read_peer(
    central: &dyn Central,
    peer: &RadioId,
    slot: &LinkSlot,
    epoch: u64,
    events: &mpsc::UnboundedSender<ScanCommand>,
) -> RadioResult<PeerCharacteristics> {
    let report = |phase| {
        let _ = events.send(ScanCommand::Phase { epoch, phase });
    };

    let link = central.connect(peer).await?;
    slot.put(link.clone());

    report(ScanPhase::Discovering);
    let services = link.discover().await?;
    let work: Vec<(Uuid, Uuid)> = services
        .iter()
        .filter(|service| !is_reserved_service(&service.uuid))
        .flat_map(|service| {
            service
                .characteristics
                .iter()
                .filter(|c| c.readable)
                .map(move |c| (service.uuid, c.uuid))
        })
        .collect();

    report(ScanPhase::Reading);
    trace!("Reading {} characteristics from {}", work.len(), peer);
    let mut result = PeerCharacteristics::new();
    for (service, characteristic) in work {
        match link.read(service, characteristic).await {
            Ok(value) => {
                result.entry(service).or_default().insert(characteristic, value);
            }
            Err(e) if e.is_link_loss() => return Err(e),
            Err(e) => warn!("Skipping {} on {}: {}", characteristic, peer, e),
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proxima_core::AdId;

    #[test]
    fn test_services_without_id_are_dropped() {
        let ad = Advertisement::new(AdId::new([3; 16]), "lamp").with_computed_hash();
        let mut services = PeerCharacteristics::new();
        services.insert(Uuid::from_u128(1), codec::encode(&ad).unwrap());

        let mut stray = CharacteristicMap::new();
        stray.insert(codec::attribute_uuid("room"), b"room=42".to_vec());
        services.insert(Uuid::from_u128(2), stray);

        let decoded = decode_services(&RadioId::new("peer"), services);
        assert_eq!(decoded, vec![ad]);
    }
}
