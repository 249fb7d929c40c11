//! Scriptable driver used by tests and non-hardware environments.
//!
//! The fake records every submitted operation for assertions and lets the
//! test inject [`HardwareEvent`]s directly. A few completions are
//! acknowledged automatically because the real stack always confirms them
//! promptly: characteristic reads (served from configured values),
//! characteristic writes, CCC descriptor writes (unless withheld) and
//! disconnects. Connection establishment is never auto-acknowledged; tests
//! inject the connected event themselves.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::domain::models::{CharacteristicValue, ConnectionState, DescriptorValue};

use super::driver::{
    GattCharacteristic, GattConnection, GattDriver, GattService, HardwareEvent, PairedDevice,
    GATT_SUCCESS,
};
use super::protocol;

/// A submitted driver operation, recorded for assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeOp {
    Connect {
        address: String,
    },
    Reconnect {
        address: String,
    },
    Disconnect {
        address: String,
    },
    DiscoverServices {
        address: String,
    },
    Read {
        address: String,
        characteristic: Uuid,
    },
    Write {
        address: String,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    SetNotification {
        address: String,
        characteristic: Uuid,
        enabled: bool,
    },
    WriteCcc {
        address: String,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    Close {
        address: String,
    },
}

#[derive(Debug, Default)]
struct FakeDevice {
    name: String,
    services: Vec<GattService>,
    /// Values served on characteristic reads.
    values: HashMap<Uuid, Vec<u8>>,
    /// Services stay invisible until discovery ran.
    revealed: bool,
    /// When set, the service list never populates.
    withhold_services: bool,
}

struct FakeShared {
    events: mpsc::UnboundedSender<HardwareEvent>,
    devices: Mutex<HashMap<String, FakeDevice>>,
    ops: Mutex<Vec<FakeOp>>,
    withheld_ccc_acks: Mutex<HashSet<Uuid>>,
    initialized: AtomicBool,
}

impl FakeShared {
    fn record(&self, op: FakeOp) {
        self.ops.lock().expect("fake op log poisoned").push(op);
    }

    fn emit(&self, event: HardwareEvent) {
        let _ = self.events.send(event);
    }

    fn with_device<T>(&self, address: &str, f: impl FnOnce(&mut FakeDevice) -> T) -> Option<T> {
        let mut devices = self.devices.lock().expect("fake device table poisoned");
        devices.get_mut(address).map(f)
    }
}

/// In-process [`GattDriver`] with scriptable peripherals.
pub struct FakeDriver {
    shared: Arc<FakeShared>,
}

impl FakeDriver {
    pub fn new(events: mpsc::UnboundedSender<HardwareEvent>) -> Self {
        Self {
            shared: Arc::new(FakeShared {
                events,
                devices: Mutex::new(HashMap::new()),
                ops: Mutex::new(Vec::new()),
                withheld_ccc_acks: Mutex::new(HashSet::new()),
                initialized: AtomicBool::new(true),
            }),
        }
    }

    /// Registers a paired peripheral with the given services.
    pub fn add_device(&self, address: &str, name: &str, services: Vec<GattService>) {
        let mut devices = self
            .shared
            .devices
            .lock()
            .expect("fake device table poisoned");
        devices.insert(
            address.to_string(),
            FakeDevice {
                name: name.to_string(),
                services,
                ..FakeDevice::default()
            },
        );
    }

    /// Sets the value served when the characteristic is read.
    pub fn set_characteristic_value(&self, address: &str, characteristic: Uuid, value: Vec<u8>) {
        self.shared.with_device(address, |device| {
            device.values.insert(characteristic, value);
        });
    }

    /// The device's service list never populates, not even after discovery.
    pub fn withhold_services(&self, address: &str) {
        self.shared.with_device(address, |device| {
            device.withhold_services = true;
        });
    }

    /// CCC writes for the characteristic are accepted but never confirmed.
    pub fn withhold_ccc_ack(&self, characteristic: Uuid) {
        self.shared
            .withheld_ccc_acks
            .lock()
            .expect("fake ccc set poisoned")
            .insert(characteristic);
    }

    pub fn set_initialized(&self, initialized: bool) {
        self.shared.initialized.store(initialized, Ordering::SeqCst);
    }

    /// Injects a hardware event, as the radio stack would.
    pub fn emit(&self, event: HardwareEvent) {
        self.shared.emit(event);
    }

    pub fn emit_connected(&self, address: &str) {
        self.emit(HardwareEvent::ConnectionStateChanged {
            address: address.to_string(),
            state: ConnectionState::Connected,
            status: GATT_SUCCESS,
        });
    }

    pub fn emit_disconnected(&self, address: &str) {
        self.emit(HardwareEvent::ConnectionStateChanged {
            address: address.to_string(),
            state: ConnectionState::Disconnected,
            status: GATT_SUCCESS,
        });
    }

    pub fn emit_services_discovered(&self, address: &str) {
        self.emit(HardwareEvent::ServicesDiscovered {
            address: address.to_string(),
            status: GATT_SUCCESS,
        });
    }

    /// Injects a value-changed report for the characteristic.
    pub fn emit_characteristic_changed(&self, address: &str, characteristic: Uuid, value: Vec<u8>) {
        self.emit(HardwareEvent::CharacteristicChanged {
            address: address.to_string(),
            characteristic: CharacteristicValue {
                uuid: characteristic,
                value,
                properties: 0,
                permissions: 0,
            },
        });
    }

    /// Snapshot of all recorded operations.
    pub fn ops(&self) -> Vec<FakeOp> {
        self.shared.ops.lock().expect("fake op log poisoned").clone()
    }

    /// Convenience service builder.
    pub fn service(uuid: Uuid, characteristics: &[Uuid]) -> GattService {
        GattService {
            uuid,
            characteristics: characteristics
                .iter()
                .map(|&uuid| GattCharacteristic {
                    uuid,
                    properties: 0,
                    permissions: 0,
                })
                .collect(),
        }
    }
}

#[async_trait]
impl GattDriver for FakeDriver {
    fn is_initialized(&self) -> bool {
        self.shared.initialized.load(Ordering::SeqCst)
    }

    async fn paired_devices(&self) -> Vec<PairedDevice> {
        let devices = self
            .shared
            .devices
            .lock()
            .expect("fake device table poisoned");
        devices
            .iter()
            .map(|(address, device)| PairedDevice {
                address: address.clone(),
                name: device.name.clone(),
            })
            .collect()
    }

    async fn open_connection(&self, address: &str) -> Option<Arc<dyn GattConnection>> {
        let devices = self
            .shared
            .devices
            .lock()
            .expect("fake device table poisoned");
        if !devices.contains_key(address) {
            return None;
        }
        Some(Arc::new(FakeConnection {
            address: address.to_string(),
            shared: self.shared.clone(),
            connected_before: AtomicBool::new(false),
        }))
    }
}

struct FakeConnection {
    address: String,
    shared: Arc<FakeShared>,
    connected_before: AtomicBool,
}

#[async_trait]
impl GattConnection for FakeConnection {
    fn address(&self) -> String {
        self.address.clone()
    }

    async fn device_name(&self) -> String {
        self.shared
            .with_device(&self.address, |device| device.name.clone())
            .unwrap_or_default()
    }

    async fn connect(&self) -> bool {
        let op = if self.connected_before.swap(true, Ordering::SeqCst) {
            FakeOp::Reconnect {
                address: self.address.clone(),
            }
        } else {
            FakeOp::Connect {
                address: self.address.clone(),
            }
        };
        self.shared.record(op);
        true
    }

    async fn disconnect(&self) -> bool {
        self.shared.record(FakeOp::Disconnect {
            address: self.address.clone(),
        });
        self.shared.emit(HardwareEvent::ConnectionStateChanged {
            address: self.address.clone(),
            state: ConnectionState::Disconnected,
            status: GATT_SUCCESS,
        });
        true
    }

    async fn discover_services(&self) -> bool {
        self.shared.record(FakeOp::DiscoverServices {
            address: self.address.clone(),
        });
        self.shared.with_device(&self.address, |device| {
            if !device.withhold_services {
                device.revealed = true;
            }
        });
        true
    }

    fn services(&self) -> Vec<GattService> {
        self.shared
            .with_device(&self.address, |device| {
                if device.revealed {
                    device.services.clone()
                } else {
                    Vec::new()
                }
            })
            .unwrap_or_default()
    }

    async fn read_characteristic(&self, _service: Uuid, characteristic: Uuid) -> bool {
        self.shared.record(FakeOp::Read {
            address: self.address.clone(),
            characteristic,
        });
        let value = self
            .shared
            .with_device(&self.address, |device| {
                device.values.get(&characteristic).cloned()
            })
            .flatten()
            .unwrap_or_default();
        self.shared.emit(HardwareEvent::CharacteristicRead {
            address: self.address.clone(),
            characteristic: CharacteristicValue {
                uuid: characteristic,
                value,
                properties: 0,
                permissions: 0,
            },
            status: GATT_SUCCESS,
        });
        true
    }

    async fn write_characteristic(
        &self,
        _service: Uuid,
        characteristic: Uuid,
        value: &[u8],
    ) -> bool {
        self.shared.record(FakeOp::Write {
            address: self.address.clone(),
            characteristic,
            value: value.to_vec(),
        });
        self.shared.emit(HardwareEvent::CharacteristicWritten {
            address: self.address.clone(),
            characteristic: CharacteristicValue {
                uuid: characteristic,
                value: value.to_vec(),
                properties: 0,
                permissions: 0,
            },
            status: GATT_SUCCESS,
        });
        true
    }

    async fn set_characteristic_notification(
        &self,
        _service: Uuid,
        characteristic: Uuid,
        enabled: bool,
    ) -> bool {
        self.shared.record(FakeOp::SetNotification {
            address: self.address.clone(),
            characteristic,
            enabled,
        });
        true
    }

    async fn write_ccc_descriptor(
        &self,
        _service: Uuid,
        characteristic: Uuid,
        value: &[u8],
    ) -> bool {
        self.shared.record(FakeOp::WriteCcc {
            address: self.address.clone(),
            characteristic,
            value: value.to_vec(),
        });
        let withheld = self
            .shared
            .withheld_ccc_acks
            .lock()
            .expect("fake ccc set poisoned")
            .contains(&characteristic);
        if !withheld {
            self.shared.emit(HardwareEvent::DescriptorWritten {
                address: self.address.clone(),
                descriptor: DescriptorValue {
                    uuid: protocol::CLIENT_CHARACTERISTIC_CONFIGURATION,
                    characteristic,
                    value: value.to_vec(),
                },
                status: GATT_SUCCESS,
            });
        }
        true
    }

    async fn close(&self) {
        self.shared.record(FakeOp::Close {
            address: self.address.clone(),
        });
    }
}
