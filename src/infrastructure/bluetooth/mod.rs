//! Bluetooth Module
//!
//! Provides BLE communication with the supported health peripherals.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                   GattSessionManager                     │
//! │  (owns the connection handles, republishes callbacks     │
//! │   as typed bus events)                                   │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼─────────────┐
//!         │             │             │
//!         ▼             ▼             ▼
//! ┌───────────┐  ┌────────────┐  ┌──────────┐
//! │  driver   │  │  backend / │  │ protocol │
//! │           │  │  fake      │  │          │
//! │ - trait   │  │ - btleplug │  │ - UUIDs  │
//! │   boundary│  │   central  │  │ - CCC    │
//! │ - events  │  │ - test rig │  │   values │
//! └───────────┘  └────────────┘  └──────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - profile UUIDs, descriptor values, control-point commands
//! - [`driver`] - the external BLE capability boundary and its event records
//! - [`backend`] - production driver over the `btleplug` central
//! - [`fake`] - scriptable driver for tests and non-hardware environments
//! - [`session`] - session manager coordinating it all

pub mod backend;
pub mod driver;
pub mod fake;
pub mod protocol;
pub mod session;

// Re-export the manager for convenience
pub use session::{GattSessionManager, SessionConfig};
