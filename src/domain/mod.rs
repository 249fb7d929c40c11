//! Domain layer: measurement codecs, device identification data, event
//! model types and user settings. No I/O happens here.

pub mod device_information;
pub mod measurement;
pub mod models;
pub mod settings;
