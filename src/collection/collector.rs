//! Collection supervisor.
//!
//! Owns the per-device handlers, the append-only measurement store and the
//! device-information map, and broadcasts progress events to external
//! subscribers. Incoming bus events are routed to the handler owning the
//! device address; events for a given device arrive in hardware order.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error};

use crate::domain::device_information::DeviceInformation;
use crate::domain::measurement::Measurement;
use crate::domain::models::{CollectionType, CollectorEvent, GattEvent};
use crate::domain::settings::CollectionSettings;
use crate::infrastructure::bluetooth::driver::{GattDriver, HardwareEvent};
use crate::infrastructure::bluetooth::session::{GattSessionManager, SessionConfig};

use super::handler::CollectionHandler;
use super::preferences;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Default)]
struct MeasurementStore {
    records: BTreeMap<u64, Measurement>,
    /// Monotonic revision counter; also the next record id.
    counter: u64,
}

/// Store-and-broadcast core the handlers report into.
pub(crate) struct CollectorCore {
    measurements: Mutex<MeasurementStore>,
    device_information: Mutex<HashMap<String, DeviceInformation>>,
    events: broadcast::Sender<CollectorEvent>,
}

impl CollectorCore {
    fn measurements(&self) -> MutexGuard<'_, MeasurementStore> {
        self.measurements
            .lock()
            .expect("measurement store lock poisoned")
    }

    fn broadcast(&self, event: CollectorEvent) {
        // no live subscriber is fine
        let _ = self.events.send(event);
    }

    pub(crate) fn broadcast_device_message(&self, message: &str) {
        self.broadcast(CollectorEvent::StatusMessage(message.to_string()));
    }

    pub(crate) fn broadcast_connection_established(&self, address: &str, name: &str) {
        self.broadcast(CollectorEvent::ConnectionEstablished {
            address: address.to_string(),
            name: name.to_string(),
        });
    }

    pub(crate) fn broadcast_connection_lost(&self, address: &str, name: &str) {
        self.broadcast(CollectorEvent::ConnectionLost {
            address: address.to_string(),
            name: name.to_string(),
        });
    }

    /// Appends a decoded measurement; ids grow monotonically in arrival
    /// order and records are never mutated afterwards.
    pub(crate) fn receive_measurement(&self, measurement: Measurement, address: &str) {
        debug!(%address, %measurement, "received measurement");
        {
            let mut store = self.measurements();
            let id = store.counter;
            store.records.insert(id, measurement);
            store.counter += 1;
        }
        self.broadcast(CollectorEvent::MeasurementCollected);
    }

    pub(crate) fn receive_device_information(
        &self,
        information: DeviceInformation,
        address: &str,
    ) {
        debug!(%address, %information, "received device information");
        self.device_information
            .lock()
            .expect("device information lock poisoned")
            .insert(address.to_string(), information);
        self.broadcast(CollectorEvent::DeviceInfoCollected);
    }
}

/// Process-wide registry of active per-device collectors.
pub struct Collector {
    core: Arc<CollectorCore>,
    sessions: Arc<GattSessionManager>,
    driver: Arc<dyn GattDriver>,
    handlers: Mutex<HashMap<String, Arc<CollectionHandler>>>,
    settings: CollectionSettings,
}

impl Collector {
    /// Wires the session manager and the dispatch loop on top of the given
    /// driver and returns the running supervisor.
    pub fn start(
        driver: Arc<dyn GattDriver>,
        hardware: mpsc::UnboundedReceiver<HardwareEvent>,
        settings: CollectionSettings,
    ) -> Arc<Self> {
        let (bus_tx, bus_rx) = mpsc::unbounded_channel();
        let sessions = Arc::new(GattSessionManager::new(
            driver.clone(),
            bus_tx,
            SessionConfig::from_settings(&settings),
        ));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let collector = Arc::new(Self {
            core: Arc::new(CollectorCore {
                measurements: Mutex::new(MeasurementStore::default()),
                device_information: Mutex::new(HashMap::new()),
                events,
            }),
            sessions: sessions.clone(),
            driver,
            handlers: Mutex::new(HashMap::new()),
            settings,
        });

        tokio::spawn(sessions.run(hardware));
        tokio::spawn(Arc::clone(&collector).dispatch(bus_rx));
        collector
    }

    fn handlers(&self) -> MutexGuard<'_, HashMap<String, Arc<CollectionHandler>>> {
        self.handlers.lock().expect("handler registry lock poisoned")
    }

    /// Routes bus events to the handler owning the device address.
    async fn dispatch(self: Arc<Self>, mut bus: mpsc::UnboundedReceiver<GattEvent>) {
        while let Some(event) = bus.recv().await {
            let address = event.address().to_string();
            let handler = self.handlers().get(&address).cloned();
            match handler {
                Some(handler) => handler.process_event(event).await,
                None => error!(%address, "collection handler for address not found"),
            }
        }
        debug!("bus closed, dispatch stopping");
    }

    /// Subscribes to collector progress events.
    pub fn subscribe(&self) -> broadcast::Receiver<CollectorEvent> {
        self.core.events.subscribe()
    }

    /// Starts a collection for the device, first stopping a running
    /// collection of a different type. A running collection of the same
    /// type is left untouched.
    pub async fn start_collection(&self, address: &str, wanted: CollectionType) {
        let current = self.collection_state(address);
        if current == Some(wanted) {
            return;
        }
        if current.is_some() {
            self.stop_collection(address).await;
        }

        let handler = CollectionHandler::new(
            address,
            wanted,
            self.sessions.clone(),
            self.core.clone(),
            &self.settings,
        );
        self.handlers().insert(address.to_string(), handler.clone());
        handler.start().await;
    }

    /// Stops and unregisters the collection handler for the device.
    pub async fn stop_collection(&self, address: &str) {
        debug!(%address, "sending stop signal to collection handler");
        let handler = self.handlers().get(address).cloned();
        if let Some(handler) = handler {
            handler.stop().await;
        }
        self.unregister(address);
    }

    fn unregister(&self, address: &str) {
        self.handlers().remove(address);
        self.core
            .broadcast_device_message(&format!("Collector handler for {address} unregistered."));
        self.core.broadcast(CollectorEvent::CollectorStopped {
            address: address.to_string(),
        });
    }

    /// All currently collected device addresses with their collection type.
    pub fn collection_situation(&self) -> HashMap<String, CollectionType> {
        self.handlers()
            .values()
            .map(|handler| (handler.address().to_string(), handler.collection_type()))
            .collect()
    }

    /// Whether a live session exists for the device.
    pub fn is_device_connected(&self, address: &str) -> bool {
        self.sessions.is_connected(address)
    }

    /// The collection type running for the address, if any.
    pub fn collection_state(&self, address: &str) -> Option<CollectionType> {
        self.handlers()
            .get(address)
            .map(|handler| handler.collection_type())
    }

    /// Snapshot of the collected measurements keyed by their integer ids.
    pub fn measurement_map(&self) -> BTreeMap<u64, Measurement> {
        self.core.measurements().records.clone()
    }

    /// Monotonic revision counter for cheap change detection; not the
    /// current store size.
    pub fn data_count(&self) -> u64 {
        self.core.measurements().counter
    }

    /// Snapshot of the collected device information keyed by address.
    pub fn device_information_map(&self) -> HashMap<String, DeviceInformation> {
        self.core
            .device_information
            .lock()
            .expect("device information lock poisoned")
            .clone()
    }

    /// Applies a newline-separated desired-device-name list for one
    /// collection type: resolves the names against the pairing list and
    /// reconciles running collectors (stop unwanted, start missing).
    pub async fn apply_device_preferences(&self, wanted: CollectionType, names: &str) {
        let device_names = preferences::parse_device_names(names);
        let paired = self.driver.paired_devices().await;
        let resolution = preferences::resolve_addresses(&device_names, &paired);

        for name in &resolution.missing {
            self.core
                .broadcast_device_message(&format!("Error: Device \"{name}\" not paired."));
        }
        for (name, address) in &resolution.found {
            self.core
                .broadcast_device_message(&format!("Device \"{name}\" found."));
            self.core
                .broadcast_device_message(&format!("Device address {address} for collection."));
        }

        let plan = preferences::reconcile(
            &self.collection_situation(),
            &resolution.addresses(),
            wanted,
        );
        for address in &plan.stop {
            self.stop_collection(address).await;
        }
        for address in &plan.start {
            self.start_collection(address, wanted).await;
        }
        debug!(%wanted, "collector preferences applied");
    }

    /// Stops every collection and releases all session handles.
    pub async fn shutdown(&self) {
        let addresses: Vec<String> = self.handlers().keys().cloned().collect();
        for address in addresses {
            self.stop_collection(&address).await;
        }
        self.sessions.close().await;
    }
}
