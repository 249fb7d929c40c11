//! End-to-end collection scenarios driven through the fake driver.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use vitalink::collection::Collector;
use vitalink::domain::measurement::Measurement;
use vitalink::domain::models::{CollectionType, CollectorEvent};
use vitalink::domain::settings::CollectionSettings;
use vitalink::infrastructure::bluetooth::fake::{FakeDriver, FakeOp};
use vitalink::infrastructure::bluetooth::protocol::{self as gatt, InformationField};

const SCALE: &str = "AA:BB:CC:DD:EE:FF";
const METER: &str = "11:22:33:44:55:66";

struct Rig {
    driver: Arc<FakeDriver>,
    collector: Arc<Collector>,
}

fn rig() -> Rig {
    let (hardware_tx, hardware_rx) = mpsc::unbounded_channel();
    let driver = Arc::new(FakeDriver::new(hardware_tx));
    let collector = Collector::start(driver.clone(), hardware_rx, CollectionSettings::default());
    Rig { driver, collector }
}

fn weight_scale(driver: &FakeDriver) {
    driver.add_device(
        SCALE,
        "Beurer BF700-1234",
        vec![FakeDriver::service(
            gatt::WEIGHT_SCALE_SERVICE,
            &[gatt::WEIGHT_MEASUREMENT],
        )],
    );
}

fn glucose_meter(driver: &FakeDriver) {
    driver.add_device(
        METER,
        "Accu-Chek Guide",
        vec![FakeDriver::service(
            gatt::GLUCOSE_SERVICE,
            &[
                gatt::GLUCOSE_MEASUREMENT,
                gatt::GLUCOSE_MEASUREMENT_CONTEXT,
                gatt::RECORD_ACCESS_CONTROL_POINT,
            ],
        )],
    );
}

async fn eventually(mut predicate: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    predicate()
}

fn racp_request_sent(driver: &FakeDriver) -> bool {
    driver.ops().iter().any(|op| {
        matches!(
            op,
            FakeOp::Write { characteristic, value, .. }
                if *characteristic == gatt::RECORD_ACCESS_CONTROL_POINT
                    && *value == vec![0x01, 0x01]
        )
    })
}

#[tokio::test(start_paused = true)]
async fn weight_collection_end_to_end() {
    let rig = rig();
    weight_scale(&rig.driver);

    rig.collector
        .start_collection(SCALE, CollectionType::Weight)
        .await;
    assert_eq!(
        rig.collector.collection_state(SCALE),
        Some(CollectionType::Weight)
    );

    rig.driver.emit_connected(SCALE);
    // after the settle delay, a discovery request must go out
    assert!(
        eventually(|| rig
            .driver
            .ops()
            .iter()
            .any(|op| matches!(op, FakeOp::DiscoverServices { .. })))
        .await
    );

    rig.driver.emit_services_discovered(SCALE);
    // the weight-measurement indication gets armed
    assert!(
        eventually(|| rig.driver.ops().contains(&FakeOp::WriteCcc {
            address: SCALE.to_string(),
            characteristic: gatt::WEIGHT_MEASUREMENT,
            value: gatt::ENABLE_INDICATION_VALUE.to_vec(),
        }))
        .await
    );

    // flags 0x00, raw weight 400 -> 2.0 kg
    rig.driver
        .emit_characteristic_changed(SCALE, gatt::WEIGHT_MEASUREMENT, vec![0x00, 0x90, 0x01]);
    assert!(eventually(|| rig.collector.data_count() == 1).await);

    let store = rig.collector.measurement_map();
    let record = store.get(&0).expect("record with id 0");
    let Measurement::Weight(measurement) = record else {
        panic!("expected a weight measurement, got {record:?}");
    };
    assert_eq!(measurement.weight(), 2.0);
    assert_eq!(measurement.weight_unit(), "kg");
    assert!(measurement.device_time.is_none());
    assert!(measurement.bmi().is_none());
    assert!(measurement.height().is_none());
    assert_eq!(rig.collector.data_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn device_information_is_harvested_before_arming() {
    let rig = rig();
    rig.driver.add_device(
        SCALE,
        "Beurer BF700-1234",
        vec![
            FakeDriver::service(
                gatt::DEVICE_INFORMATION_SERVICE,
                &[
                    InformationField::ManufacturerName.uuid(),
                    InformationField::SerialNumber.uuid(),
                ],
            ),
            FakeDriver::service(gatt::WEIGHT_SCALE_SERVICE, &[gatt::WEIGHT_MEASUREMENT]),
        ],
    );
    rig.driver.set_characteristic_value(
        SCALE,
        InformationField::ManufacturerName.uuid(),
        b"ACME Health".to_vec(),
    );
    rig.driver.set_characteristic_value(
        SCALE,
        InformationField::SerialNumber.uuid(),
        b"SN-0042".to_vec(),
    );

    rig.collector
        .start_collection(SCALE, CollectionType::Weight)
        .await;
    rig.driver.emit_connected(SCALE);
    assert!(
        eventually(|| rig
            .driver
            .ops()
            .iter()
            .any(|op| matches!(op, FakeOp::DiscoverServices { .. })))
        .await
    );
    rig.driver.emit_services_discovered(SCALE);

    // the partial aggregate must be reported with defaults for the rest
    assert!(
        eventually(|| rig.collector.device_information_map().contains_key(SCALE)).await
    );
    let information = rig
        .collector
        .device_information_map()
        .remove(SCALE)
        .expect("device information for the scale");
    assert_eq!(information.manufacturer_name, "ACME Health");
    assert_eq!(information.serial_number, "SN-0042");
    assert_eq!(information.model_number, "");
    assert_eq!(information.system_id, vec![0]);

    // arming follows the harvest
    assert!(
        eventually(|| rig.driver.ops().iter().any(|op| {
            matches!(op, FakeOp::WriteCcc { characteristic, .. }
                if *characteristic == gatt::WEIGHT_MEASUREMENT)
        }))
        .await
    );
}

#[tokio::test(start_paused = true)]
async fn glucose_collection_requests_records_after_arming() {
    let rig = rig();
    glucose_meter(&rig.driver);

    rig.collector
        .start_collection(METER, CollectionType::Glucose)
        .await;
    rig.driver.emit_connected(METER);
    assert!(
        eventually(|| rig
            .driver
            .ops()
            .iter()
            .any(|op| matches!(op, FakeOp::DiscoverServices { .. })))
        .await
    );
    rig.driver.emit_services_discovered(METER);

    // context + measurement notifications, then the control-point indication
    assert!(eventually(|| racp_request_sent(&rig.driver)).await);
    let ccc_writes: Vec<_> = rig
        .driver
        .ops()
        .iter()
        .filter_map(|op| match op {
            FakeOp::WriteCcc {
                characteristic,
                value,
                ..
            } => Some((*characteristic, value.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(
        ccc_writes,
        vec![
            (
                gatt::GLUCOSE_MEASUREMENT_CONTEXT,
                gatt::ENABLE_NOTIFICATION_VALUE.to_vec()
            ),
            (
                gatt::GLUCOSE_MEASUREMENT,
                gatt::ENABLE_NOTIFICATION_VALUE.to_vec()
            ),
            (
                gatt::RECORD_ACCESS_CONTROL_POINT,
                gatt::ENABLE_INDICATION_VALUE.to_vec()
            ),
        ]
    );

    // a streamed record lands in the store
    let mut payload = vec![0x02, 0x01, 0x00, 0xe0, 0x07, 7, 4, 8, 15, 0];
    payload.extend_from_slice(&0xb052u16.to_le_bytes());
    payload.push(0x11);
    rig.driver
        .emit_characteristic_changed(METER, gatt::GLUCOSE_MEASUREMENT, payload);
    assert!(eventually(|| rig.collector.data_count() == 1).await);

    let store = rig.collector.measurement_map();
    let Some(Measurement::Glucose(measurement)) = store.get(&0) else {
        panic!("expected a glucose measurement");
    };
    assert_eq!(measurement.sequence_number, 1);
    assert_eq!(measurement.unit(), "kg/L");
    assert!(measurement.concentration().is_some());
}

#[tokio::test(start_paused = true)]
async fn glucose_record_request_is_fail_closed_on_arming_timeout() {
    let rig = rig();
    glucose_meter(&rig.driver);
    // the control-point indication never gets its confirmation
    rig.driver.withhold_ccc_ack(gatt::RECORD_ACCESS_CONTROL_POINT);

    rig.collector
        .start_collection(METER, CollectionType::Glucose)
        .await;
    rig.driver.emit_connected(METER);
    assert!(
        eventually(|| rig
            .driver
            .ops()
            .iter()
            .any(|op| matches!(op, FakeOp::DiscoverServices { .. })))
        .await
    );
    rig.driver.emit_services_discovered(METER);

    // the sequence reaches the control point...
    assert!(
        eventually(|| rig.driver.ops().iter().any(|op| {
            matches!(op, FakeOp::WriteCcc { characteristic, .. }
                if *characteristic == gatt::RECORD_ACCESS_CONTROL_POINT)
        }))
        .await
    );
    // ...but the confirmation never arrives, so waiting past the timeout
    // must never produce a record request
    tokio::time::sleep(Duration::from_secs(12)).await;
    assert!(!racp_request_sent(&rig.driver));
    assert_eq!(rig.collector.data_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn switching_collection_type_stops_the_old_handler_first() {
    let rig = rig();
    rig.driver.add_device(
        SCALE,
        "Combo Device",
        vec![
            FakeDriver::service(gatt::WEIGHT_SCALE_SERVICE, &[gatt::WEIGHT_MEASUREMENT]),
            FakeDriver::service(
                gatt::GLUCOSE_SERVICE,
                &[
                    gatt::GLUCOSE_MEASUREMENT,
                    gatt::GLUCOSE_MEASUREMENT_CONTEXT,
                    gatt::RECORD_ACCESS_CONTROL_POINT,
                ],
            ),
        ],
    );
    let mut events = rig.collector.subscribe();

    rig.collector
        .start_collection(SCALE, CollectionType::Weight)
        .await;
    rig.driver.emit_connected(SCALE);
    assert!(eventually(|| rig.collector.is_device_connected(SCALE)).await);

    // same type again is a no-op
    rig.collector
        .start_collection(SCALE, CollectionType::Weight)
        .await;
    let connects = rig
        .driver
        .ops()
        .iter()
        .filter(|op| matches!(op, FakeOp::Connect { .. }))
        .count();
    assert_eq!(connects, 1);

    rig.collector
        .start_collection(SCALE, CollectionType::Glucose)
        .await;
    assert_eq!(
        rig.collector.collection_state(SCALE),
        Some(CollectionType::Glucose)
    );

    // the old handler was stopped (and announced) before the switch
    let stopped = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            match events.recv().await {
                Ok(CollectorEvent::CollectorStopped { address }) if address == SCALE => {
                    break true;
                }
                Ok(_) => continue,
                Err(_) => break false,
            }
        }
    })
    .await
    .unwrap_or(false);
    assert!(stopped);
    assert!(rig
        .driver
        .ops()
        .iter()
        .any(|op| matches!(op, FakeOp::Disconnect { .. })));
}

#[tokio::test(start_paused = true)]
async fn restarting_a_collection_reuses_the_retired_session() {
    let rig = rig();
    weight_scale(&rig.driver);

    rig.collector
        .start_collection(SCALE, CollectionType::Weight)
        .await;
    rig.driver.emit_connected(SCALE);
    assert!(eventually(|| rig.collector.is_device_connected(SCALE)).await);

    rig.collector.stop_collection(SCALE).await;
    assert!(eventually(|| !rig.collector.is_device_connected(SCALE)).await);
    assert_eq!(rig.collector.collection_state(SCALE), None);

    rig.collector
        .start_collection(SCALE, CollectionType::Weight)
        .await;
    assert!(
        eventually(|| rig
            .driver
            .ops()
            .iter()
            .any(|op| matches!(op, FakeOp::Reconnect { .. })))
        .await
    );
    // the fresh handle was allocated exactly once
    let connects = rig
        .driver
        .ops()
        .iter()
        .filter(|op| matches!(op, FakeOp::Connect { .. }))
        .count();
    assert_eq!(connects, 1);
}

#[tokio::test(start_paused = true)]
async fn preferences_reconcile_running_collectors() {
    let rig = rig();
    weight_scale(&rig.driver);
    glucose_meter(&rig.driver);

    rig.collector
        .apply_device_preferences(CollectionType::Weight, "Beurer\n")
        .await;
    assert_eq!(
        rig.collector.collection_state(SCALE),
        Some(CollectionType::Weight)
    );
    assert_eq!(rig.collector.collection_state(METER), None);

    // the desired list changed: the scale is no longer wanted, the meter is
    rig.collector
        .apply_device_preferences(CollectionType::Weight, "Accu-Chek\n")
        .await;
    assert_eq!(rig.collector.collection_state(SCALE), None);
    assert_eq!(
        rig.collector.collection_state(METER),
        Some(CollectionType::Weight)
    );

    // a glucose list with an unpaired name starts nothing
    rig.collector
        .apply_device_preferences(CollectionType::Glucose, "Contour\n")
        .await;
    assert_eq!(rig.collector.collection_situation().len(), 1);
}
