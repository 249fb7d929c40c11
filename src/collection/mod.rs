//! Collection orchestration.
//!
//! One [`Collector`] supervises a set of per-device collection handlers,
//! routes the session manager's bus events to them and owns the in-memory
//! measurement store. Each handler drives a single peripheral through
//! connect → discovery → device-information harvest → notification arming →
//! record streaming → disconnect.

pub mod collector;
pub mod handler;
pub mod harvester;
pub mod preferences;

pub use collector::Collector;
pub use handler::CollectionPhase;

use tokio::sync::watch;

/// Resolves once the stop signal turns true (or its sender is gone).
pub(crate) async fn cancelled(stop: &mut watch::Receiver<bool>) {
    while !*stop.borrow_and_update() {
        if stop.changed().await.is_err() {
            return;
        }
    }
}
