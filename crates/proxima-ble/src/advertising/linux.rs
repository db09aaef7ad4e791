//! Linux peripheral role using bluer (BlueZ)

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bluer::adv::{Advertisement as BluezAdvertisement, AdvertisementHandle, Type};
use bluer::gatt::local::{
    Application, ApplicationHandle, Characteristic, CharacteristicRead, Service,
};
use futures::FutureExt;
use proxima_core::CharacteristicMap;
use tokio::sync::Mutex;
use tracing::{debug, info, trace};
use uuid::Uuid;

use crate::error::{RadioError, RadioResult};
use crate::gatt::read_slice;
use crate::radio::Peripheral;

// ----------------------------------------------------------------------------
// BlueZ Peripheral
// ----------------------------------------------------------------------------

#[derive(Default)]
struct ServerState {
    services: BTreeMap<Uuid, Arc<CharacteristicMap>>,
    application: Option<ApplicationHandle>,
    broadcast: Option<AdvertisementHandle>,
}

/// GATT server and broadcaster backed by the default BlueZ adapter
///
/// BlueZ registers services per application, so every change re-serves the
/// whole application. Dropping a handle unregisters it.
pub struct BluezPeripheral {
    _session: bluer::Session,
    adapter: bluer::Adapter,
    state: Mutex<ServerState>,
}

impl BluezPeripheral {
    pub async fn new() -> RadioResult<Self> {
        let session = bluer::Session::new()
            .await
            .map_err(|e| RadioError::Unavailable(format!("BlueZ session: {}", e)))?;

        let adapter = session
            .default_adapter()
            .await
            .map_err(|e| RadioError::Unavailable(format!("BLE adapter: {}", e)))?;

        if !adapter.is_powered().await.unwrap_or(false) {
            adapter
                .set_powered(true)
                .await
                .map_err(|e| RadioError::Unavailable(format!("Failed to power on adapter: {}", e)))?;
        }

        info!("Linux BLE adapter {} initialized for advertising", adapter.name());
        Ok(Self {
            _session: session,
            adapter,
            state: Mutex::new(ServerState::default()),
        })
    }

    async fn serve(&self, state: &mut ServerState) -> RadioResult<()> {
        // Unregister before registering so ids never clash
        state.application = None;
        if state.services.is_empty() {
            return Ok(());
        }

        let application = Application {
            services: state
                .services
                .iter()
                .map(|(uuid, characteristics)| build_service(*uuid, characteristics))
                .collect(),
            ..Default::default()
        };

        let handle = self
            .adapter
            .serve_gatt_application(application)
            .await
            .map_err(|e| RadioError::GattServer(format!("Failed to register GATT services: {}", e)))?;
        state.application = Some(handle);
        debug!("Serving {} GATT services", state.services.len());
        Ok(())
    }
}

fn build_service(uuid: Uuid, characteristics: &CharacteristicMap) -> Service {
    Service {
        uuid,
        primary: true,
        characteristics: characteristics
            .iter()
            .map(|(char_uuid, value)| build_characteristic(*char_uuid, Arc::new(value.clone())))
            .collect(),
        ..Default::default()
    }
}

fn build_characteristic(uuid: Uuid, value: Arc<Vec<u8>>) -> Characteristic {
    Characteristic {
        uuid,
        read: Some(CharacteristicRead {
            read: true,
            fun: Box::new(move |request| {
                let value = value.clone();
                async move {
                    trace!(
                        "Read of {} at offset {} (mtu {})",
                        uuid,
                        request.offset,
                        request.mtu
                    );
                    Ok(read_slice(&value, request.offset as usize, request.mtu as usize))
                }
                .boxed()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[async_trait]
impl Peripheral for BluezPeripheral {
    async fn register_service(
        &self,
        service: Uuid,
        characteristics: Arc<CharacteristicMap>,
    ) -> RadioResult<()> {
        let mut state = self.state.lock().await;
        state.services.insert(service, characteristics);
        self.serve(&mut state).await
    }

    async fn unregister_service(&self, service: Uuid) -> RadioResult<()> {
        let mut state = self.state.lock().await;
        if state.services.remove(&service).is_none() {
            return Ok(());
        }
        self.serve(&mut state).await
    }

    async fn start_broadcast(&self, manufacturer_id: u16, payload: Vec<u8>) -> RadioResult<()> {
        let mut state = self.state.lock().await;
        state.broadcast = None;

        let mut manufacturer_data = BTreeMap::new();
        manufacturer_data.insert(manufacturer_id, payload);

        let advertisement = BluezAdvertisement {
            advertisement_type: Type::Peripheral,
            manufacturer_data,
            discoverable: Some(true),
            ..Default::default()
        };

        let handle = self
            .adapter
            .advertise(advertisement)
            .await
            .map_err(|e| RadioError::Broadcast(format!("Failed to start advertising: {}", e)))?;
        state.broadcast = Some(handle);
        debug!("Started BLE broadcast");
        Ok(())
    }

    async fn stop_broadcast(&self) -> RadioResult<()> {
        if self.state.lock().await.broadcast.take().is_some() {
            debug!("Stopped BLE broadcast");
        }
        Ok(())
    }
}
