//! Discovery engine facade
//!
//! [`DiscoveryEngine`] wires the advertiser, the scan pipeline and the peer
//! cache together and runs the freshness sweep. When the radio cannot be
//! opened the engine is constructed disabled instead: every operation then
//! succeeds without doing anything, so callers never need to check for a
//! missing radio themselves.

use std::sync::Arc;
use std::time::Duration;

use proxima_core::{Advertisement, Handler, PeerCache, SystemTimeSource, TimeSource};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::advertising::{open_peripheral, Advertiser};
use crate::config::DiscoveryConfig;
use crate::discovery::BtleplugCentral;
use crate::error::Result;
use crate::radio::{Central, Peripheral};
use crate::scanner::ScanConnector;
use crate::status::DiscoveryStatus;

// ----------------------------------------------------------------------------
// Engine State
// ----------------------------------------------------------------------------

struct Running<T: TimeSource> {
    cache: Arc<PeerCache<T>>,
    advertiser: Advertiser,
    scanner: ScanConnector,
    sweeper: JoinHandle<()>,
}

enum EngineState<T: TimeSource> {
    Enabled(Box<Running<T>>),
    Disabled { reason: String },
}

// ----------------------------------------------------------------------------
// Discovery Engine
// ----------------------------------------------------------------------------

/// Proximity discovery over BLE
///
/// Must be created within a tokio runtime.
pub struct DiscoveryEngine<T: TimeSource = SystemTimeSource> {
    state: EngineState<T>,
}

impl DiscoveryEngine<SystemTimeSource> {
    /// Open the platform radios, falling back to a disabled engine
    pub async fn new(config: DiscoveryConfig) -> Self {
        let central = match BtleplugCentral::new().await {
            Ok(central) => central,
            Err(e) => {
                error!("BLE discovery disabled: {}", e);
                return Self::disabled(e.to_string());
            }
        };
        let peripheral = match open_peripheral().await {
            Ok(peripheral) => peripheral,
            Err(e) => {
                error!("BLE discovery disabled: {}", e);
                return Self::disabled(e.to_string());
            }
        };
        Self::with_radio(config, Arc::new(central), peripheral)
    }

    /// Build an engine on the given radios with the wall clock
    pub fn with_radio(
        config: DiscoveryConfig,
        central: Arc<dyn Central>,
        peripheral: Arc<dyn Peripheral>,
    ) -> Self {
        Self::with_time_source(config, central, peripheral, SystemTimeSource)
    }
}

impl<T: TimeSource + 'static> DiscoveryEngine<T> {
    /// Build an engine on the given radios and clock
    pub fn with_time_source(
        config: DiscoveryConfig,
        central: Arc<dyn Central>,
        peripheral: Arc<dyn Peripheral>,
        time_source: T,
    ) -> Self {
        let cache = Arc::new(PeerCache::with_time_source(config.cache.clone(), time_source));
        let advertiser = Advertiser::spawn(peripheral, config.manufacturer_id);
        let scanner = ScanConnector::spawn(config.clone(), central, cache.clone());
        let sweeper = tokio::spawn(run_sweep(cache.clone()));

        info!(
            "BLE discovery enabled (manufacturer id {:#06x})",
            config.manufacturer_id
        );
        Self {
            state: EngineState::Enabled(Box::new(Running {
                cache,
                advertiser,
                scanner,
                sweeper,
            })),
        }
    }

    /// An engine whose operations are all no-ops
    pub fn disabled(reason: impl Into<String>) -> Self {
        Self {
            state: EngineState::Disabled {
                reason: reason.into(),
            },
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self.state, EngineState::Enabled(_))
    }

    fn running(&self) -> Option<&Running<T>> {
        match &self.state {
            EngineState::Enabled(running) => Some(running),
            EngineState::Disabled { .. } => None,
        }
    }

    /// Publish `advertisement` as GATT service `service_id`
    ///
    /// Re-publishing a service id replaces its content. Either way the
    /// broadcast stamp rotates so that peers re-fetch.
    pub async fn publish(&self, service_id: Uuid, advertisement: Advertisement) -> Result<()> {
        let Some(running) = self.running() else {
            debug!("Ignoring publish of {}: discovery disabled", service_id);
            return Ok(());
        };
        running.advertiser.publish(service_id, advertisement).await
    }

    /// Withdraw service `service_id`
    pub async fn unpublish(&self, service_id: Uuid) -> Result<()> {
        if let Some(running) = self.running() {
            running.advertiser.unpublish(service_id).await;
        }
        Ok(())
    }

    /// Subscribe `handler` to advertisements whose interface name equals
    /// `interface_filter`
    ///
    /// Cached matches are replayed to `handler` before this returns. Adding
    /// the first subscription starts scanning.
    ///
    /// Later events are delivered from the scan pipeline's task. The handler
    /// may call [`status`](Self::status) and
    /// [`cached_advertisements`](Self::cached_advertisements), but must not
    /// block.
    pub async fn start_scan(&self, interface_filter: impl Into<String>, handler: Handler) -> Result<()> {
        let Some(running) = self.running() else {
            debug!("Ignoring scan subscription: discovery disabled");
            return Ok(());
        };
        running.cache.add_subscription(interface_filter, handler)?;
        running.scanner.sync().await;
        Ok(())
    }

    /// Unsubscribe `handler`
    ///
    /// No callback reaches `handler` after this returns. Removing the last
    /// subscription cancels any fetch in flight and stops scanning.
    pub async fn stop_scan(&self, handler: &Handler) -> Result<()> {
        let Some(running) = self.running() else {
            return Ok(());
        };
        if !running.cache.remove_subscription(handler) {
            debug!("Handler was not subscribed");
            return Ok(());
        }
        running.scanner.sync().await;
        Ok(())
    }

    /// Advertisements currently known from peers
    pub fn cached_advertisements(&self) -> Vec<Advertisement> {
        self.running()
            .map(|running| running.cache.cached_advertisements())
            .unwrap_or_default()
    }

    pub fn status(&self) -> DiscoveryStatus {
        match &self.state {
            EngineState::Enabled(running) => DiscoveryStatus {
                enabled: true,
                disabled_reason: None,
                advertiser: running.advertiser.status(),
                scanner: running.scanner.status(),
                cache: running.cache.stats(),
            },
            EngineState::Disabled { reason } => DiscoveryStatus {
                enabled: false,
                disabled_reason: Some(reason.clone()),
                ..Default::default()
            },
        }
    }

    /// Withdraw everything and stop all background work
    ///
    /// The engine is disabled afterwards.
    pub async fn shutdown(&mut self) {
        let previous = std::mem::replace(
            &mut self.state,
            EngineState::Disabled {
                reason: "shut down".to_string(),
            },
        );
        let EngineState::Enabled(running) = previous else {
            return;
        };

        running.sweeper.abort();
        running.scanner.shutdown().await;
        running.advertiser.clear().await;
        running.cache.clear();
        info!("BLE discovery shut down");
    }
}

impl<T: TimeSource> Drop for DiscoveryEngine<T> {
    fn drop(&mut self) {
        if let EngineState::Enabled(running) = &self.state {
            running.sweeper.abort();
        }
    }
}

async fn run_sweep<T: TimeSource>(cache: Arc<PeerCache<T>>) {
    let period = cache.config().sweep_period().max(Duration::from_millis(1));
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let evicted = cache.sweep();
        if evicted > 0 {
            debug!("Freshness sweep evicted {} peers", evicted);
        }
    }
}
