//! Device information harvester.
//!
//! Pulls the fixed set of identification characteristics from a connected
//! peripheral, one read at a time, tolerating peripherals that support only
//! a subset. Runs on its own task so that event dispatch never blocks on
//! the per-field waits.

use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::domain::device_information::DeviceInformation;
use crate::domain::models::CharacteristicValue;
use crate::infrastructure::bluetooth::protocol::{InformationField, DEVICE_INFORMATION_SERVICE};
use crate::infrastructure::bluetooth::session::GattSessionManager;

pub struct DeviceInformationHarvester {
    address: String,
    sessions: Arc<GattSessionManager>,
    intake: mpsc::Receiver<CharacteristicValue>,
    stop: watch::Receiver<bool>,
}

impl DeviceInformationHarvester {
    pub fn new(
        address: String,
        sessions: Arc<GattSessionManager>,
        intake: mpsc::Receiver<CharacteristicValue>,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self {
            address,
            sessions,
            intake,
            stop,
        }
    }

    /// Requests the device-information fields one after the other, waiting
    /// for each value on the intake channel. Returns the possibly partial
    /// aggregate, or `None` when cancelled mid-harvest.
    pub async fn run(mut self) -> Option<DeviceInformation> {
        let mut information = DeviceInformation::default();

        for field in InformationField::ALL {
            if *self.stop.borrow() {
                debug!(address = %self.address, "harvest cancelled");
                return None;
            }
            let supported = self
                .sessions
                .supports_characteristic(DEVICE_INFORMATION_SERVICE, field.uuid(), &self.address)
                .await;
            if !supported {
                // non-supported characteristics are skipped, not retried
                continue;
            }

            self.sessions
                .read_characteristic(DEVICE_INFORMATION_SERVICE, field.uuid(), &self.address)
                .await;

            tokio::select! {
                received = self.intake.recv() => match received {
                    Some(value) => feed(&mut information, &value),
                    None => return None, // handler went away
                },
                _ = super::cancelled(&mut self.stop) => {
                    debug!(address = %self.address, "harvest cancelled while waiting");
                    return None;
                }
            }
        }

        Some(information)
    }
}

/// Stores a received value into the field it belongs to.
fn feed(information: &mut DeviceInformation, value: &CharacteristicValue) {
    let Some(field) = InformationField::find(value.uuid) else {
        return;
    };
    match field {
        InformationField::ManufacturerName => {
            information.manufacturer_name = string_value(&value.value);
        }
        InformationField::ModelNumber => information.model_number = string_value(&value.value),
        InformationField::SerialNumber => information.serial_number = string_value(&value.value),
        InformationField::HardwareRevision => {
            information.hardware_revision = string_value(&value.value);
        }
        InformationField::FirmwareRevision => {
            information.firmware_revision = string_value(&value.value);
        }
        InformationField::SoftwareRevision => {
            information.software_revision = string_value(&value.value);
        }
        InformationField::SystemId => information.system_id = value.value.clone(),
        InformationField::RegulatoryCertData => {
            information.regulatory_cert_data = value.value.clone();
        }
    }
}

fn string_value(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches('\0')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::fake::{FakeDriver, FakeOp};
    use crate::infrastructure::bluetooth::session::SessionConfig;
    use std::time::Duration;
    use uuid::Uuid;

    const ADDRESS: &str = "11:22:33:44:55:66";

    struct Fixture {
        driver: Arc<FakeDriver>,
        sessions: Arc<GattSessionManager>,
    }

    async fn fixture(fields: &[InformationField]) -> Fixture {
        let (hardware_tx, hardware_rx) = mpsc::unbounded_channel();
        let (bus_tx, _bus_rx) = mpsc::unbounded_channel();
        let driver = Arc::new(FakeDriver::new(hardware_tx));
        let uuids: Vec<Uuid> = fields.iter().map(|f| f.uuid()).collect();
        driver.add_device(
            ADDRESS,
            "Glucose Meter",
            vec![FakeDriver::service(DEVICE_INFORMATION_SERVICE, &uuids)],
        );
        let sessions = Arc::new(GattSessionManager::new(
            driver.clone(),
            bus_tx,
            SessionConfig::default(),
        ));
        // the harvester tests feed their intake channel directly, but the
        // session manager still needs its hardware pump for the table
        tokio::spawn(sessions.clone().run(hardware_rx));

        sessions.connect(ADDRESS).await;
        driver.emit_connected(ADDRESS);
        // wait for the session to go live
        for _ in 0..100 {
            if sessions.is_connected(ADDRESS) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        Fixture { driver, sessions }
    }

    #[tokio::test]
    async fn partial_subset_still_terminates_and_reports() {
        let fields = [
            InformationField::ManufacturerName,
            InformationField::ModelNumber,
        ];
        let fx = fixture(&fields).await;
        // populate the visible service list
        fx.sessions.discover_services(ADDRESS).await;

        let (intake_tx, intake_rx) = mpsc::channel(1);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let harvester = DeviceInformationHarvester::new(
            ADDRESS.to_string(),
            fx.sessions.clone(),
            intake_rx,
            stop_rx,
        );
        let task = tokio::spawn(harvester.run());

        // answer each issued read in order
        let answers = [
            (InformationField::ManufacturerName, b"ACME".to_vec()),
            (InformationField::ModelNumber, b"Scale-1".to_vec()),
        ];
        for (field, value) in answers {
            for _ in 0..500 {
                let issued = fx.driver.ops().iter().any(|op| {
                    matches!(op, FakeOp::Read { characteristic, .. } if *characteristic == field.uuid())
                });
                if issued {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            intake_tx
                .send(CharacteristicValue {
                    uuid: field.uuid(),
                    value,
                    properties: 0,
                    permissions: 0,
                })
                .await
                .expect("harvester dropped its intake");
        }

        let information = task
            .await
            .expect("harvester task panicked")
            .expect("harvest was cancelled");
        assert_eq!(information.manufacturer_name, "ACME");
        assert_eq!(information.model_number, "Scale-1");
        // the rest stays at the documented defaults
        assert_eq!(information.serial_number, "");
        assert_eq!(information.system_id, vec![0]);
    }

    #[tokio::test]
    async fn stop_signal_unblocks_a_stalled_harvest() {
        let fields = [InformationField::ManufacturerName];
        let fx = fixture(&fields).await;
        fx.sessions.discover_services(ADDRESS).await;

        let (_intake_tx, intake_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = watch::channel(false);
        let harvester = DeviceInformationHarvester::new(
            ADDRESS.to_string(),
            fx.sessions.clone(),
            intake_rx,
            stop_rx,
        );
        let task = tokio::spawn(harvester.run());

        // never answer the read; the stop signal must end the harvest
        tokio::time::sleep(Duration::from_millis(20)).await;
        stop_tx.send(true).expect("stop receiver dropped");

        let result = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("harvester did not unblock")
            .expect("harvester task panicked");
        assert!(result.is_none());
    }
}
