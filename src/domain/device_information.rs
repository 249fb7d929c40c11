//! Representation of the 0x180A "Device Information" GATT service.

use serde::Serialize;
use std::fmt;

/// Identification data read from a peripheral's device-information service.
///
/// Created empty and filled incrementally as fields arrive; peripherals
/// exposing only a subset leave the remaining fields at their defaults.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInformation {
    /// Manufacturer Name String - 0x2A29
    pub manufacturer_name: String,
    /// Model Number String - 0x2A24
    pub model_number: String,
    /// Serial Number String - 0x2A25
    pub serial_number: String,
    /// Hardware Revision String - 0x2A27
    pub hardware_revision: String,
    /// Firmware Revision String - 0x2A26
    pub firmware_revision: String,
    /// Software Revision String - 0x2A28
    pub software_revision: String,
    /// System ID - 0x2A23
    pub system_id: Vec<u8>,
    /// IEEE 11073-20601 Regulatory Certification Data List - 0x2A2A
    pub regulatory_cert_data: Vec<u8>,
}

impl Default for DeviceInformation {
    fn default() -> Self {
        Self {
            manufacturer_name: String::new(),
            model_number: String::new(),
            serial_number: String::new(),
            hardware_revision: String::new(),
            firmware_revision: String::new(),
            software_revision: String::new(),
            system_id: vec![0],
            regulatory_cert_data: vec![0],
        }
    }
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

impl fmt::Display for DeviceInformation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Manufacturer Name: {}", self.manufacturer_name)?;
        writeln!(f, "Model Number: {}", self.model_number)?;
        writeln!(f, "Serial Number: {}", self.serial_number)?;
        writeln!(f, "Hardware Revision: {}", self.hardware_revision)?;
        writeln!(f, "Firmware Revision: {}", self.firmware_revision)?;
        writeln!(f, "Software Revision: {}", self.software_revision)?;
        writeln!(f, "System ID: {}", hex_string(&self.system_id))?;
        write!(
            f,
            "Regulatory Cert Data List: {}",
            hex_string(&self.regulatory_cert_data)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_empty_strings_and_single_zero_bytes() {
        let info = DeviceInformation::default();
        assert_eq!(info.manufacturer_name, "");
        assert_eq!(info.software_revision, "");
        assert_eq!(info.system_id, vec![0]);
        assert_eq!(info.regulatory_cert_data, vec![0]);
    }

    #[test]
    fn display_lists_every_field() {
        let info = DeviceInformation {
            manufacturer_name: "ACME".to_string(),
            system_id: vec![0xde, 0xad],
            ..DeviceInformation::default()
        };
        let text = info.to_string();
        assert!(text.contains("Manufacturer Name: ACME"));
        assert!(text.contains("System ID: dead"));
    }
}
