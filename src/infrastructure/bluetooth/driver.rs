//! External BLE driver boundary.
//!
//! The collector never talks to a Bluetooth stack directly: it goes through
//! the [`GattDriver`] / [`GattConnection`] traits, and every hardware
//! callback comes back as a flat [`HardwareEvent`] record on an mpsc
//! channel. Native stack objects cannot cross that channel, so events carry
//! only primitive fields (addresses, UUIDs, byte buffers, status codes).
//!
//! All connection operations are submissions: the returned boolean says
//! whether the request was accepted, the outcome arrives later as a
//! [`HardwareEvent`].

use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::models::{CharacteristicValue, ConnectionState, DescriptorValue};

/// GATT status code as reported by hardware callbacks. Zero is success.
pub type GattStatus = i32;
pub const GATT_SUCCESS: GattStatus = 0;
/// Catch-all failure code, mirroring the usual stack value.
pub const GATT_FAILURE: GattStatus = 0x101;

/// Raw hardware callback, dismantled into primitive fields at the driver
/// boundary.
#[derive(Debug, Clone)]
pub enum HardwareEvent {
    ConnectionStateChanged {
        address: String,
        state: ConnectionState,
        status: GattStatus,
    },
    ServicesDiscovered {
        address: String,
        status: GattStatus,
    },
    CharacteristicRead {
        address: String,
        characteristic: CharacteristicValue,
        status: GattStatus,
    },
    CharacteristicWritten {
        address: String,
        characteristic: CharacteristicValue,
        status: GattStatus,
    },
    CharacteristicChanged {
        address: String,
        characteristic: CharacteristicValue,
    },
    DescriptorWritten {
        address: String,
        descriptor: DescriptorValue,
        status: GattStatus,
    },
}

/// A device from the adapter's pairing list.
#[derive(Debug, Clone)]
pub struct PairedDevice {
    pub address: String,
    pub name: String,
}

/// Snapshot of one discovered GATT service.
#[derive(Debug, Clone)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharacteristic>,
}

#[derive(Debug, Clone)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub properties: u32,
    pub permissions: u32,
}

/// The radio adapter capability the session manager is built on.
#[async_trait]
pub trait GattDriver: Send + Sync {
    /// Whether the underlying radio adapter is usable at all.
    fn is_initialized(&self) -> bool;

    /// The adapter's known (paired/bonded) devices, for name-to-address
    /// resolution.
    async fn paired_devices(&self) -> Vec<PairedDevice>;

    /// Resolves the address to a fresh connection handle; `None` when the
    /// device cannot be resolved.
    async fn open_connection(&self, address: &str) -> Option<Arc<dyn GattConnection>>;
}

/// One low-level connection handle, live or retired. Retired handles can be
/// reconnected via [`GattConnection::connect`] without re-resolving the
/// device.
#[async_trait]
pub trait GattConnection: Send + Sync {
    fn address(&self) -> String;

    /// Advertised device name, empty when unknown.
    async fn device_name(&self) -> String;

    /// Opens (or re-opens) the connection, auto-reconnect disabled.
    async fn connect(&self) -> bool;

    async fn disconnect(&self) -> bool;

    async fn discover_services(&self) -> bool;

    /// Snapshot of the discovered services. Empty until discovery has
    /// populated it; not guaranteed non-empty immediately after the
    /// discovery event either.
    fn services(&self) -> Vec<GattService>;

    async fn read_characteristic(&self, service: Uuid, characteristic: Uuid) -> bool;

    async fn write_characteristic(&self, service: Uuid, characteristic: Uuid, value: &[u8])
        -> bool;

    /// Toggles local delivery of value-change reports. The descriptor write
    /// that arms the peripheral side is a separate step.
    async fn set_characteristic_notification(
        &self,
        service: Uuid,
        characteristic: Uuid,
        enabled: bool,
    ) -> bool;

    /// Writes the client-characteristic-configuration descriptor of the
    /// given characteristic.
    async fn write_ccc_descriptor(&self, service: Uuid, characteristic: Uuid, value: &[u8])
        -> bool;

    /// Releases the underlying handle. Called once at supervisor teardown.
    async fn close(&self);
}
