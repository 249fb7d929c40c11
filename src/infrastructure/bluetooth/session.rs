//! GATT session manager.
//!
//! Owns the per-device connection handles, serializes the hardware
//! operations the collection layer needs, and republishes every hardware
//! callback as a typed [`GattEvent`] on the internal bus.
//!
//! A disconnected handle is retired instead of destroyed so that a later
//! reconnect can resume it; handles are only closed at teardown. Every
//! non-success hardware status is logged and swallowed here: upstream
//! components detect failure by the absence of the success event, never by
//! an error value.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::domain::models::{ConnectionState, GattEvent};
use crate::domain::settings::CollectionSettings;

use super::driver::{
    GattCharacteristic, GattConnection, GattDriver, HardwareEvent, GATT_SUCCESS,
};
use super::protocol;

/// Tunables for session-level waits.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Attempts made while waiting for a service list to populate.
    pub service_list_tries: u32,
    /// Pause between those attempts.
    pub service_list_poll: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            service_list_tries: 15,
            service_list_poll: Duration::from_millis(10),
        }
    }
}

impl SessionConfig {
    pub fn from_settings(settings: &CollectionSettings) -> Self {
        Self {
            service_list_tries: settings.service_list_tries,
            service_list_poll: Duration::from_millis(settings.service_list_poll_ms),
        }
    }
}

/// Per-address connection handles. An address appears in at most one of
/// `live` and `retired`; `pending` is transitional while a connect attempt
/// awaits its hardware confirmation.
#[derive(Default)]
struct SessionTable {
    pending: HashMap<String, Arc<dyn GattConnection>>,
    live: HashMap<String, Arc<dyn GattConnection>>,
    retired: HashMap<String, Arc<dyn GattConnection>>,
}

pub struct GattSessionManager {
    driver: Arc<dyn GattDriver>,
    table: Mutex<SessionTable>,
    bus: mpsc::UnboundedSender<GattEvent>,
    config: SessionConfig,
}

impl GattSessionManager {
    pub fn new(
        driver: Arc<dyn GattDriver>,
        bus: mpsc::UnboundedSender<GattEvent>,
        config: SessionConfig,
    ) -> Self {
        Self {
            driver,
            table: Mutex::new(SessionTable::default()),
            bus,
            config,
        }
    }

    fn table(&self) -> MutexGuard<'_, SessionTable> {
        self.table.lock().expect("session table lock poisoned")
    }

    fn live(&self, address: &str) -> Option<Arc<dyn GattConnection>> {
        self.table().live.get(address).cloned()
    }

    fn publish(&self, event: GattEvent) {
        let _ = self.bus.send(event);
    }

    /// Requests a connection to the device. Returns whether the attempt was
    /// submitted; the result always arrives asynchronously as a
    /// connection-state event, never synchronously.
    pub async fn connect(&self, address: &str) -> bool {
        if !self.driver.is_initialized() || address.is_empty() {
            warn!("bluetooth adapter not initialized or unspecified address");
            return false;
        }

        if self.table().live.contains_key(address) {
            return false;
        }

        // previously connected device: try to reconnect on the old handle
        let retired = self.table().retired.get(address).cloned();
        if let Some(existing) = retired {
            debug!(%address, "reusing retired gatt session for reconnect");
            return existing.connect().await;
        }

        let Some(connection) = self.driver.open_connection(address).await else {
            warn!(%address, "device not found, unable to connect");
            return false;
        };
        self.table()
            .pending
            .insert(address.to_string(), connection.clone());
        debug!(%address, "waiting for a connection to device");
        connection.connect().await
    }

    /// Requests a disconnect of an existing connection; a no-op unless a
    /// live session exists. Completion is asynchronous.
    pub async fn disconnect(&self, address: &str) -> bool {
        match self.live(address) {
            Some(connection) => connection.disconnect().await,
            None => false,
        }
    }

    /// Starts service discovery, or synthesizes the success event right
    /// away when the handle's service list is already populated.
    pub async fn discover_services(&self, address: &str) {
        let Some(connection) = self.live(address) else {
            return;
        };
        if connection.services().is_empty() {
            info!(%address, "starting service discovery");
            if !connection.discover_services().await {
                error!(%address, "service discovery could not be started");
            }
        } else {
            debug!(%address, "services have already been discovered");
            self.publish(GattEvent::ServicesDiscovered {
                address: address.to_string(),
            });
        }
    }

    /// Whether the connected device exposes the characteristic.
    pub async fn supports_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
        address: &str,
    ) -> bool {
        match self.live(address) {
            Some(connection) => self
                .resolve_characteristic(service, characteristic, &connection)
                .await
                .is_some(),
            None => false,
        }
    }

    /// Looks the characteristic up, first waiting for the handle's service
    /// list to come up (it is not instantly available after discovery).
    /// `None` after the attempt budget is exhausted; this is a local retry,
    /// never an error.
    async fn resolve_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
        connection: &Arc<dyn GattConnection>,
    ) -> Option<GattCharacteristic> {
        let mut tries = self.config.service_list_tries;
        let mut services = connection.services();
        while services.is_empty() && tries > 0 {
            tokio::time::sleep(self.config.service_list_poll).await;
            tries -= 1;
            services = connection.services();
        }
        if services.is_empty() {
            warn!("no GATT services found");
            return None;
        }

        let Some(found_service) = services.iter().find(|s| s.uuid == service) else {
            warn!(service = %service, "service not found");
            return None;
        };
        let found = found_service
            .characteristics
            .iter()
            .find(|c| c.uuid == characteristic)
            .cloned();
        if found.is_none() {
            warn!(characteristic = %characteristic, "characteristic not found");
        }
        found
    }

    /// Requests a read; the value arrives asynchronously as a
    /// data-available event.
    pub async fn read_characteristic(&self, service: Uuid, characteristic: Uuid, address: &str) {
        let Some(connection) = self.live(address) else {
            return;
        };
        if self
            .resolve_characteristic(service, characteristic, &connection)
            .await
            .is_some()
        {
            connection.read_characteristic(service, characteristic).await;
        }
    }

    /// Requests a write; completion arrives asynchronously as a
    /// data-written event.
    pub async fn write_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
        address: &str,
        value: &[u8],
    ) -> bool {
        let Some(connection) = self.live(address) else {
            return false;
        };
        if self
            .resolve_characteristic(service, characteristic, &connection)
            .await
            .is_none()
        {
            return false;
        }
        connection
            .write_characteristic(service, characteristic, value)
            .await
    }

    /// Arms notifications or indications for the characteristic: local
    /// delivery first, then the client-characteristic-configuration
    /// descriptor write. The boolean reflects request submission only;
    /// confirmation arrives as a descriptor-written event.
    pub async fn enable_notification(
        &self,
        service: Uuid,
        characteristic: Uuid,
        address: &str,
        is_indication: bool,
    ) -> bool {
        let Some(connection) = self.live(address) else {
            return false;
        };
        if self
            .resolve_characteristic(service, characteristic, &connection)
            .await
            .is_none()
        {
            return false;
        }

        debug!(
            characteristic = %characteristic,
            kind = if is_indication { "indications" } else { "notifications" },
            "activating value reports for characteristic"
        );
        if !connection
            .set_characteristic_notification(service, characteristic, true)
            .await
        {
            return false;
        }

        let value = if is_indication {
            protocol::ENABLE_INDICATION_VALUE
        } else {
            protocol::ENABLE_NOTIFICATION_VALUE
        };
        connection
            .write_ccc_descriptor(service, characteristic, &value)
            .await
    }

    /// Contacts the record access control point to trigger the submission
    /// of all stored records.
    pub async fn request_all_records(
        &self,
        service: Uuid,
        characteristic: Uuid,
        address: &str,
    ) -> bool {
        self.write_characteristic(
            service,
            characteristic,
            address,
            &protocol::RACP_REPORT_ALL_RECORDS,
        )
        .await
    }

    /// Best-effort device name lookup across live and retired handles.
    pub async fn device_name(&self, address: &str) -> String {
        let connection = {
            let table = self.table();
            table
                .live
                .get(address)
                .or_else(|| table.retired.get(address))
                .cloned()
        };
        match connection {
            Some(connection) => connection.device_name().await,
            None => String::new(),
        }
    }

    pub fn is_connected(&self, address: &str) -> bool {
        self.table().live.contains_key(address)
    }

    /// Releases every handle. Called once when the owning process tears
    /// down.
    pub async fn close(&self) {
        let connections: Vec<Arc<dyn GattConnection>> = {
            let mut table = self.table();
            let table = &mut *table;
            table
                .pending
                .drain()
                .chain(table.live.drain())
                .chain(table.retired.drain())
                .map(|(_, connection)| connection)
                .collect()
        };
        for connection in connections {
            connection.close().await;
        }
    }

    /// Consumes hardware callbacks until the driver channel closes,
    /// maintaining the session table and republishing bus events.
    pub async fn run(self: Arc<Self>, mut hardware: mpsc::UnboundedReceiver<HardwareEvent>) {
        while let Some(event) = hardware.recv().await {
            self.process_hardware_event(event);
        }
        debug!("hardware event channel closed, session manager stopping");
    }

    fn process_hardware_event(&self, event: HardwareEvent) {
        match event {
            HardwareEvent::ConnectionStateChanged { address, state, .. } => {
                self.process_connection_state_change(address, state);
            }
            HardwareEvent::ServicesDiscovered { address, status } => {
                if status == GATT_SUCCESS {
                    info!(%address, "services discovered");
                    self.publish(GattEvent::ServicesDiscovered { address });
                } else {
                    warn!(%address, status, "service discovery was not successful");
                }
            }
            HardwareEvent::CharacteristicRead {
                address,
                characteristic,
                status,
            } => {
                if status == GATT_SUCCESS {
                    info!(
                        %address,
                        characteristic = %characteristic.uuid,
                        "new characteristic read data available"
                    );
                    self.publish(GattEvent::DataAvailable {
                        address,
                        characteristic,
                    });
                } else {
                    warn!(status, "characteristic read callback was not successful");
                }
            }
            HardwareEvent::CharacteristicWritten {
                address,
                characteristic,
                status,
            } => {
                if status == GATT_SUCCESS {
                    debug!(characteristic = %characteristic.uuid, "characteristic has been written");
                    self.publish(GattEvent::DataWritten {
                        address,
                        characteristic,
                    });
                } else {
                    warn!(
                        characteristic = %characteristic.uuid,
                        status,
                        "characteristic write was not successful"
                    );
                }
            }
            HardwareEvent::CharacteristicChanged {
                address,
                characteristic,
            } => {
                debug!(
                    %address,
                    characteristic = %characteristic.uuid,
                    "characteristic value changed"
                );
                self.publish(GattEvent::DataAvailable {
                    address,
                    characteristic,
                });
            }
            HardwareEvent::DescriptorWritten {
                address,
                descriptor,
                status,
            } => {
                if status == GATT_SUCCESS {
                    debug!(descriptor = %descriptor.uuid, "descriptor has been written");
                    self.publish(GattEvent::DescriptorWritten {
                        address,
                        descriptor,
                    });
                } else {
                    warn!(
                        descriptor = %descriptor.uuid,
                        status,
                        "descriptor write was not successful"
                    );
                }
            }
        }
    }

    fn process_connection_state_change(&self, address: String, state: ConnectionState) {
        match state {
            ConnectionState::Connected => {
                let mut table = self.table();
                if table.live.contains_key(&address) {
                    return;
                }
                let handle = table
                    .pending
                    .remove(&address)
                    .or_else(|| table.retired.remove(&address));
                match handle {
                    Some(connection) => {
                        info!(%address, "connected to GATT server on device");
                        table.live.insert(address.clone(), connection);
                        drop(table);
                        self.publish(GattEvent::Connected { address });
                    }
                    None => {
                        warn!(%address, "connection reported for unknown device");
                    }
                }
            }
            ConnectionState::Disconnected => {
                let mut table = self.table();
                let handle = table
                    .live
                    .remove(&address)
                    .or_else(|| table.pending.remove(&address));
                if let Some(connection) = handle {
                    table.retired.insert(address.clone(), connection);
                }
                drop(table);
                info!(%address, "disconnected from GATT server");
                self.publish(GattEvent::Disconnected { address });
            }
            ConnectionState::Connecting | ConnectionState::Disconnecting => {}
        }
    }
}
