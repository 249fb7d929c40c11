//! Core model types shared between the session manager, the collection
//! handlers and the supervisor.
//!
//! Native driver objects cannot cross the internal event channels, so every
//! event type here carries only primitive fields (addresses, UUIDs, byte
//! buffers).

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Connection lifecycle of a single peripheral. The session manager is the
/// sole writer of this state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// Kind of collection a handler performs for one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CollectionType {
    Weight,
    Glucose,
}

impl fmt::Display for CollectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectionType::Weight => write!(f, "weight"),
            CollectionType::Glucose => write!(f, "glucose"),
        }
    }
}

/// Flattened characteristic data as reported by a hardware callback.
#[derive(Debug, Clone)]
pub struct CharacteristicValue {
    pub uuid: Uuid,
    pub value: Vec<u8>,
    pub properties: u32,
    pub permissions: u32,
}

/// Flattened descriptor data as reported by a hardware callback.
#[derive(Debug, Clone)]
pub struct DescriptorValue {
    pub uuid: Uuid,
    /// Characteristic the descriptor belongs to.
    pub characteristic: Uuid,
    pub value: Vec<u8>,
}

/// Event republished on the internal bus once the session manager has
/// processed the underlying hardware callback. Collection handlers consume
/// these.
#[derive(Debug, Clone)]
pub enum GattEvent {
    Connected {
        address: String,
    },
    Disconnected {
        address: String,
    },
    ServicesDiscovered {
        address: String,
    },
    DataAvailable {
        address: String,
        characteristic: CharacteristicValue,
    },
    DataWritten {
        address: String,
        characteristic: CharacteristicValue,
    },
    DescriptorWritten {
        address: String,
        descriptor: DescriptorValue,
    },
}

impl GattEvent {
    /// Device address the event belongs to.
    pub fn address(&self) -> &str {
        match self {
            GattEvent::Connected { address }
            | GattEvent::Disconnected { address }
            | GattEvent::ServicesDiscovered { address }
            | GattEvent::DataAvailable { address, .. }
            | GattEvent::DataWritten { address, .. }
            | GattEvent::DescriptorWritten { address, .. } => address,
        }
    }
}

/// Events published to external subscribers (shell, uploader, tests).
#[derive(Debug, Clone)]
pub enum CollectorEvent {
    ConnectionEstablished { address: String, name: String },
    ConnectionLost { address: String, name: String },
    MeasurementCollected,
    DeviceInfoCollected,
    CollectorStopped { address: String },
    StatusMessage(String),
}
