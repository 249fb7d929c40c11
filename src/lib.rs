//! vitalink collects physiological measurements (body weight, blood
//! glucose) from BLE health peripherals.
//!
//! The crate decodes the standardized GATT measurement characteristics into
//! typed records and hands them to an in-memory ordered store. The
//! interesting part is the per-device asynchronous protocol: connect,
//! discover services, read identification data, arm notifications, request
//! historical records and consume the streamed measurements, with several
//! devices in different protocol stages concurrently.
//!
//! Embedders construct a [`Collector`] over a
//! [`infrastructure::bluetooth::driver::GattDriver`] (the production
//! `btleplug` backend or the scriptable fake) and subscribe to its progress
//! events.

pub mod collection;
pub mod domain;
pub mod infrastructure;

pub use collection::{CollectionPhase, Collector};
pub use domain::device_information::DeviceInformation;
pub use domain::measurement::{DecodeError, GlucoseMeasurement, Measurement, WeightMeasurement};
pub use domain::models::{CollectionType, CollectorEvent};
