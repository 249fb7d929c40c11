//! GATT Health Profiles
//!
//! This module contains the profile definitions for the supported BLE
//! health devices: the Weight Scale and Glucose profiles plus the Device
//! Information service the harvester enumerates.

use uuid::Uuid;

/// Builds a full 128-bit UUID from a 16-bit Bluetooth SIG short id
/// (`0000xxxx-0000-1000-8000-00805f9b34fb`).
pub const fn sig_uuid(short: u16) -> Uuid {
    Uuid::from_u128(0x0000_0000_0000_1000_8000_00805f_9b34fb_u128 | ((short as u128) << 96))
}

/// Weight Scale service
pub const WEIGHT_SCALE_SERVICE: Uuid = sig_uuid(0x181d);
/// Weight Measurement characteristic - indicated measurement records
pub const WEIGHT_MEASUREMENT: Uuid = sig_uuid(0x2a9d);
/// Weight Scale Feature characteristic - read-only capability bits
pub const WEIGHT_SCALE_FEATURE: Uuid = sig_uuid(0x2a9e);

/// Glucose service
pub const GLUCOSE_SERVICE: Uuid = sig_uuid(0x1808);
/// Glucose Measurement characteristic - notified measurement records
pub const GLUCOSE_MEASUREMENT: Uuid = sig_uuid(0x2a18);
/// Glucose Measurement Context characteristic - notified context records
pub const GLUCOSE_MEASUREMENT_CONTEXT: Uuid = sig_uuid(0x2a34);
/// Record Access Control Point - indicated, triggers bulk record transfer
pub const RECORD_ACCESS_CONTROL_POINT: Uuid = sig_uuid(0x2a52);

/// Device Information service
pub const DEVICE_INFORMATION_SERVICE: Uuid = sig_uuid(0x180a);

/// Client Characteristic Configuration descriptor
pub const CLIENT_CHARACTERISTIC_CONFIGURATION: Uuid = sig_uuid(0x2902);

/// Descriptor value arming unacknowledged notifications.
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];
/// Descriptor value arming acknowledged indications.
pub const ENABLE_INDICATION_VALUE: [u8; 2] = [0x02, 0x00];

/// Record Access Control Point command: report stored records, all records.
pub const RACP_REPORT_ALL_RECORDS: [u8; 2] = [0x01, 0x01];

/// The device-information characteristics the harvester pulls, in the order
/// they are requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InformationField {
    ManufacturerName,
    ModelNumber,
    SerialNumber,
    HardwareRevision,
    FirmwareRevision,
    SoftwareRevision,
    SystemId,
    RegulatoryCertData,
}

impl InformationField {
    pub const ALL: [InformationField; 8] = [
        InformationField::ManufacturerName,
        InformationField::ModelNumber,
        InformationField::SerialNumber,
        InformationField::HardwareRevision,
        InformationField::FirmwareRevision,
        InformationField::SoftwareRevision,
        InformationField::SystemId,
        InformationField::RegulatoryCertData,
    ];

    pub const fn uuid(self) -> Uuid {
        match self {
            InformationField::ManufacturerName => sig_uuid(0x2a29),
            InformationField::ModelNumber => sig_uuid(0x2a24),
            InformationField::SerialNumber => sig_uuid(0x2a25),
            InformationField::HardwareRevision => sig_uuid(0x2a27),
            InformationField::FirmwareRevision => sig_uuid(0x2a26),
            InformationField::SoftwareRevision => sig_uuid(0x2a28),
            InformationField::SystemId => sig_uuid(0x2a23),
            InformationField::RegulatoryCertData => sig_uuid(0x2a2a),
        }
    }

    /// Maps a characteristic UUID back to its field, if it is one of the
    /// device-information set.
    pub fn find(uuid: Uuid) -> Option<InformationField> {
        Self::ALL.into_iter().find(|field| field.uuid() == uuid)
    }
}
