//! Infrastructure layer: the Bluetooth stack boundary and logging setup.

pub mod bluetooth;
pub mod logging;
