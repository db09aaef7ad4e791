//! GATT client link on top of btleplug

use async_trait::async_trait;
use btleplug::api::{CharPropFlags, Peripheral as _};
use btleplug::platform::Peripheral;
use proxima_core::RadioId;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::{RadioError, RadioResult};
use crate::radio::{GattLink, RemoteCharacteristic, RemoteService};

// ----------------------------------------------------------------------------
// Btleplug Link
// ----------------------------------------------------------------------------

/// An open connection to a remote GATT server
pub struct BtleplugLink {
    peer: RadioId,
    peripheral: Peripheral,
}

impl BtleplugLink {
    pub fn new(peer: RadioId, peripheral: Peripheral) -> Self {
        Self { peer, peripheral }
    }

    fn read_error(&self, characteristic: Uuid, error: btleplug::Error) -> RadioError {
        match error {
            btleplug::Error::NotConnected => RadioError::Disconnected,
            other => RadioError::ReadFailed {
                characteristic,
                reason: other.to_string(),
            },
        }
    }
}

#[async_trait]
impl GattLink for BtleplugLink {
    async fn discover(&self) -> RadioResult<Vec<RemoteService>> {
        self.peripheral
            .discover_services()
            .await
            .map_err(|e| RadioError::ServiceDiscoveryFailed(e.to_string()))?;

        let services: Vec<RemoteService> = self
            .peripheral
            .services()
            .into_iter()
            .map(|service| RemoteService {
                uuid: service.uuid,
                characteristics: service
                    .characteristics
                    .iter()
                    .map(|c| RemoteCharacteristic {
                        uuid: c.uuid,
                        readable: c.properties.contains(CharPropFlags::READ),
                    })
                    .collect(),
            })
            .collect();

        debug!("Discovered {} services on {}", services.len(), self.peer);
        Ok(services)
    }

    async fn read(&self, service: Uuid, characteristic: Uuid) -> RadioResult<Vec<u8>> {
        let target = self
            .peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.service_uuid == service && c.uuid == characteristic)
            .ok_or_else(|| RadioError::ReadFailed {
                characteristic,
                reason: format!("not found in service {}", service),
            })?;

        let value = self
            .peripheral
            .read(&target)
            .await
            .map_err(|e| self.read_error(characteristic, e))?;
        trace!("Read {} bytes of {} from {}", value.len(), characteristic, self.peer);
        Ok(value)
    }

    async fn disconnect(&self) -> RadioResult<()> {
        self.peripheral
            .disconnect()
            .await
            .map_err(|e| RadioError::ConnectFailed {
                peer: self.peer.to_string(),
                reason: format!("disconnect: {}", e),
            })
    }
}
