//! Production driver over the `btleplug` BLE central.
//!
//! `btleplug` exposes a future-based API while the session manager expects
//! the callback-event model of a classic GATT stack, so every completed
//! operation here is translated into a [`HardwareEvent`] on the driver
//! channel. Connection state changes come from the adapter's central event
//! stream, value-change reports from a per-connection notification pump.

use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::models::{CharacteristicValue, ConnectionState, DescriptorValue};

use super::driver::{
    GattCharacteristic, GattConnection, GattDriver, GattService, HardwareEvent, PairedDevice,
    GATT_FAILURE, GATT_SUCCESS,
};
use super::protocol;

/// [`GattDriver`] backed by the first available system Bluetooth adapter.
pub struct BtleplugDriver {
    adapter: Adapter,
    events: mpsc::UnboundedSender<HardwareEvent>,
}

impl BtleplugDriver {
    /// Creates the driver and starts the adapter event pump. Scanning is
    /// kept running so known peripherals stay resolvable by address.
    pub async fn new(events: mpsc::UnboundedSender<HardwareEvent>) -> anyhow::Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("no bluetooth adapter found"))?;

        if let Err(error) = adapter.start_scan(ScanFilter::default()).await {
            warn!(?error, "could not start scanning, relying on cached peripherals");
        }

        let driver = Self {
            adapter: adapter.clone(),
            events: events.clone(),
        };
        tokio::spawn(pump_central_events(adapter, events));
        Ok(driver)
    }

    async fn find_peripheral(&self, address: &str) -> Option<Peripheral> {
        let peripherals = match self.adapter.peripherals().await {
            Ok(peripherals) => peripherals,
            Err(error) => {
                warn!(?error, "could not list peripherals");
                return None;
            }
        };
        peripherals
            .into_iter()
            .find(|peripheral| peripheral.address().to_string().eq_ignore_ascii_case(address))
    }
}

/// Forwards adapter connection events onto the driver channel.
async fn pump_central_events(adapter: Adapter, events: mpsc::UnboundedSender<HardwareEvent>) {
    let mut stream = match adapter.events().await {
        Ok(stream) => stream,
        Err(error) => {
            warn!(?error, "could not open adapter event stream");
            return;
        }
    };
    while let Some(event) = stream.next().await {
        let (id, state) = match event {
            CentralEvent::DeviceConnected(id) => (id, ConnectionState::Connected),
            CentralEvent::DeviceDisconnected(id) => (id, ConnectionState::Disconnected),
            _ => continue,
        };
        let Ok(peripheral) = adapter.peripheral(&id).await else {
            continue;
        };
        let address = peripheral.address().to_string();
        debug!(%address, ?state, "adapter reported connection state change");
        let _ = events.send(HardwareEvent::ConnectionStateChanged {
            address,
            state,
            status: GATT_SUCCESS,
        });
    }
    info!("adapter event stream ended");
}

#[async_trait]
impl GattDriver for BtleplugDriver {
    fn is_initialized(&self) -> bool {
        true
    }

    async fn paired_devices(&self) -> Vec<PairedDevice> {
        // btleplug has no bond-list API; every named known peripheral counts
        let mut result = Vec::new();
        let Ok(peripherals) = self.adapter.peripherals().await else {
            return result;
        };
        for peripheral in peripherals {
            if let Ok(Some(properties)) = peripheral.properties().await {
                if let Some(name) = properties.local_name {
                    result.push(PairedDevice {
                        address: peripheral.address().to_string(),
                        name,
                    });
                }
            }
        }
        result
    }

    async fn open_connection(&self, address: &str) -> Option<Arc<dyn GattConnection>> {
        let peripheral = self.find_peripheral(address).await?;
        Some(Arc::new(BtleplugConnection {
            address: address.to_string(),
            peripheral,
            events: self.events.clone(),
            notification_pump_running: AtomicBool::new(false),
        }))
    }
}

struct BtleplugConnection {
    address: String,
    peripheral: Peripheral,
    events: mpsc::UnboundedSender<HardwareEvent>,
    notification_pump_running: AtomicBool,
}

impl BtleplugConnection {
    fn emit(&self, event: HardwareEvent) {
        let _ = self.events.send(event);
    }

    fn find_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Option<btleplug::api::Characteristic> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic && c.service_uuid == service)
    }

    /// Starts the notification pump once per connection.
    async fn ensure_notification_pump(&self) {
        if self.notification_pump_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let peripheral = self.peripheral.clone();
        let address = self.address.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let mut notifications = match peripheral.notifications().await {
                Ok(stream) => stream,
                Err(error) => {
                    warn!(?error, %address, "could not open notification stream");
                    return;
                }
            };
            while let Some(notification) = notifications.next().await {
                let _ = events.send(HardwareEvent::CharacteristicChanged {
                    address: address.clone(),
                    characteristic: CharacteristicValue {
                        uuid: notification.uuid,
                        value: notification.value,
                        properties: 0,
                        permissions: 0,
                    },
                });
            }
            debug!(%address, "notification stream closed");
        });
    }
}

#[async_trait]
impl GattConnection for BtleplugConnection {
    fn address(&self) -> String {
        self.address.clone()
    }

    async fn device_name(&self) -> String {
        match self.peripheral.properties().await {
            Ok(Some(properties)) => properties.local_name.unwrap_or_default(),
            _ => String::new(),
        }
    }

    async fn connect(&self) -> bool {
        // completion is reported by the adapter event pump
        match self.peripheral.connect().await {
            Ok(()) => true,
            Err(error) => {
                warn!(?error, address = %self.address, "connect submission failed");
                false
            }
        }
    }

    async fn disconnect(&self) -> bool {
        match self.peripheral.disconnect().await {
            Ok(()) => true,
            Err(error) => {
                warn!(?error, address = %self.address, "disconnect submission failed");
                false
            }
        }
    }

    async fn discover_services(&self) -> bool {
        match self.peripheral.discover_services().await {
            Ok(()) => {
                self.emit(HardwareEvent::ServicesDiscovered {
                    address: self.address.clone(),
                    status: GATT_SUCCESS,
                });
                true
            }
            Err(error) => {
                warn!(?error, address = %self.address, "service discovery failed");
                false
            }
        }
    }

    fn services(&self) -> Vec<GattService> {
        self.peripheral
            .services()
            .into_iter()
            .map(|service| GattService {
                uuid: service.uuid,
                characteristics: service
                    .characteristics
                    .into_iter()
                    .map(|c| GattCharacteristic {
                        uuid: c.uuid,
                        properties: u32::from(c.properties.bits()),
                        permissions: 0,
                    })
                    .collect(),
            })
            .collect()
    }

    async fn read_characteristic(&self, service: Uuid, characteristic: Uuid) -> bool {
        let Some(target) = self.find_characteristic(service, characteristic) else {
            return false;
        };
        match self.peripheral.read(&target).await {
            Ok(value) => {
                self.emit(HardwareEvent::CharacteristicRead {
                    address: self.address.clone(),
                    characteristic: CharacteristicValue {
                        uuid: characteristic,
                        value,
                        properties: u32::from(target.properties.bits()),
                        permissions: 0,
                    },
                    status: GATT_SUCCESS,
                });
                true
            }
            Err(error) => {
                warn!(?error, %characteristic, "characteristic read failed");
                self.emit(HardwareEvent::CharacteristicRead {
                    address: self.address.clone(),
                    characteristic: CharacteristicValue {
                        uuid: characteristic,
                        value: Vec::new(),
                        properties: 0,
                        permissions: 0,
                    },
                    status: GATT_FAILURE,
                });
                true
            }
        }
    }

    async fn write_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
    ) -> bool {
        let Some(target) = self.find_characteristic(service, characteristic) else {
            return false;
        };
        match self
            .peripheral
            .write(&target, value, WriteType::WithResponse)
            .await
        {
            Ok(()) => {
                self.emit(HardwareEvent::CharacteristicWritten {
                    address: self.address.clone(),
                    characteristic: CharacteristicValue {
                        uuid: characteristic,
                        value: value.to_vec(),
                        properties: u32::from(target.properties.bits()),
                        permissions: 0,
                    },
                    status: GATT_SUCCESS,
                });
                true
            }
            Err(error) => {
                warn!(?error, %characteristic, "characteristic write failed");
                false
            }
        }
    }

    async fn set_characteristic_notification(
        &self,
        _service: Uuid,
        _characteristic: Uuid,
        enabled: bool,
    ) -> bool {
        // local delivery only; btleplug performs the peripheral-side arming
        // during the CCC write step
        if enabled {
            self.ensure_notification_pump().await;
        }
        true
    }

    async fn write_ccc_descriptor(
        &self,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
    ) -> bool {
        let Some(target) = self.find_characteristic(service, characteristic) else {
            return false;
        };
        let arming = *value == protocol::ENABLE_NOTIFICATION_VALUE
            || *value == protocol::ENABLE_INDICATION_VALUE;
        let result = if arming {
            self.peripheral.subscribe(&target).await
        } else {
            self.peripheral.unsubscribe(&target).await
        };
        match result {
            Ok(()) => {
                self.emit(HardwareEvent::DescriptorWritten {
                    address: self.address.clone(),
                    descriptor: DescriptorValue {
                        uuid: protocol::CLIENT_CHARACTERISTIC_CONFIGURATION,
                        characteristic,
                        value: value.to_vec(),
                    },
                    status: GATT_SUCCESS,
                });
                true
            }
            Err(error) => {
                warn!(?error, %characteristic, "descriptor write failed");
                false
            }
        }
    }

    async fn close(&self) {
        if let Err(error) = self.peripheral.disconnect().await {
            debug!(?error, address = %self.address, "close: disconnect failed");
        }
    }
}
