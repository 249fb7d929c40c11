//! Per-device collection workflow.
//!
//! One handler drives a single peripheral through the full collection
//! protocol, reacting to the typed bus events the session manager
//! republishes. The weight and glucose behaviors are a closed set of
//! variants dispatched inside the one state machine.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::domain::measurement::{GlucoseMeasurement, Measurement, WeightMeasurement};
use crate::domain::models::{CharacteristicValue, CollectionType, DescriptorValue, GattEvent};
use crate::domain::settings::CollectionSettings;
use crate::infrastructure::bluetooth::protocol::{self, InformationField};
use crate::infrastructure::bluetooth::session::GattSessionManager;

use super::collector::CollectorCore;
use super::harvester::DeviceInformationHarvester;

/// Protocol phase of one collection workflow, distinct from the session's
/// connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CollectionPhase {
    #[default]
    Idle,
    Connecting,
    AwaitingServices,
    HarvestingDeviceInfo,
    ArmingNotifications,
    AwaitingData,
    Done,
}

/// Variant-specific behavior; a closed set instead of open inheritance.
#[derive(Debug)]
enum ProfileState {
    Weight,
    Glucose {
        context_armed: bool,
        measurement_armed: bool,
        racp_armed: bool,
    },
}

#[derive(Debug)]
struct HandlerState {
    phase: CollectionPhase,
    started: bool,
    notifications_armed: bool,
    data_requested: bool,
    data_received: bool,
    done: bool,
    profile: ProfileState,
}

pub struct CollectionHandler {
    address: String,
    collection_type: CollectionType,
    sessions: Arc<GattSessionManager>,
    collector: Arc<CollectorCore>,
    state: Mutex<HandlerState>,
    /// Feeds the harvester task while one is running.
    info_intake: Mutex<Option<mpsc::Sender<CharacteristicValue>>>,
    /// Feeds the arming task's descriptor gate while one is running.
    descriptor_gate: Mutex<Option<mpsc::Sender<DescriptorValue>>>,
    stop: watch::Sender<bool>,
    settle_delay: Duration,
    arming_timeout: Duration,
}

impl CollectionHandler {
    pub fn new(
        address: &str,
        collection_type: CollectionType,
        sessions: Arc<GattSessionManager>,
        collector: Arc<CollectorCore>,
        settings: &CollectionSettings,
    ) -> Arc<Self> {
        let profile = match collection_type {
            CollectionType::Weight => ProfileState::Weight,
            CollectionType::Glucose => ProfileState::Glucose {
                context_armed: false,
                measurement_armed: false,
                racp_armed: false,
            },
        };
        Arc::new(Self {
            address: address.to_string(),
            collection_type,
            sessions,
            collector,
            state: Mutex::new(HandlerState {
                phase: CollectionPhase::Idle,
                started: false,
                notifications_armed: false,
                data_requested: false,
                data_received: false,
                done: false,
                profile,
            }),
            info_intake: Mutex::new(None),
            descriptor_gate: Mutex::new(None),
            stop: watch::channel(false).0,
            settle_delay: Duration::from_millis(settings.settle_delay_ms),
            arming_timeout: Duration::from_secs(settings.arming_timeout_secs),
        })
    }

    fn state(&self) -> MutexGuard<'_, HandlerState> {
        self.state.lock().expect("handler state lock poisoned")
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn collection_type(&self) -> CollectionType {
        self.collection_type
    }

    pub fn phase(&self) -> CollectionPhase {
        self.state().phase
    }

    pub fn is_done(&self) -> bool {
        self.state().done
    }

    pub fn notifications_armed(&self) -> bool {
        self.state().notifications_armed
    }

    pub fn data_requested(&self) -> bool {
        self.state().data_requested
    }

    pub fn data_received(&self) -> bool {
        self.state().data_received
    }

    /// Arming progress of the glucose variant: context, measurement and
    /// control-point attributes. `None` for the weight variant.
    pub fn glucose_arming_state(&self) -> Option<(bool, bool, bool)> {
        match &self.state().profile {
            ProfileState::Glucose {
                context_armed,
                measurement_armed,
                racp_armed,
            } => Some((*context_armed, *measurement_armed, *racp_armed)),
            ProfileState::Weight => None,
        }
    }

    /// Starts the workflow by requesting a connection; everything after is
    /// driven by bus events.
    pub async fn start(self: &Arc<Self>) {
        {
            let mut state = self.state();
            if state.started {
                return;
            }
            state.started = true;
            state.phase = CollectionPhase::Connecting;
        }
        if !self.sessions.connect(&self.address).await {
            warn!(
                address = %self.address,
                "connection request was not accepted"
            );
        }
    }

    /// Requests disconnection and proactively unblocks any in-flight waits.
    /// Idempotent.
    pub async fn stop(&self) {
        self.stop.send_replace(true);
        self.sessions.disconnect(&self.address).await;
    }

    /// Single dispatch entry for all bus events of this device.
    pub async fn process_event(self: &Arc<Self>, event: GattEvent) {
        match event {
            GattEvent::Connected { .. } => self.process_connected().await,
            GattEvent::Disconnected { .. } => self.process_disconnected().await,
            GattEvent::ServicesDiscovered { .. } => self.process_services_discovered(),
            GattEvent::DataAvailable { characteristic, .. } => {
                self.process_data(characteristic).await;
            }
            GattEvent::DataWritten { .. } => self.publish_status("Information written."),
            GattEvent::DescriptorWritten { descriptor, .. } => {
                self.process_descriptor_written(descriptor);
            }
        }
    }

    async fn process_connected(self: &Arc<Self>) {
        self.publish_status("Connection established. Waiting for service readiness.");
        self.publish_connection_established().await;

        {
            let mut state = self.state();
            state.phase = CollectionPhase::AwaitingServices;
            // a fresh connection invalidates any previous arming state
            if let ProfileState::Glucose {
                context_armed,
                measurement_armed,
                racp_armed,
            } = &mut state.profile
            {
                *context_armed = false;
                *measurement_armed = false;
                *racp_armed = false;
            }
        }

        // the radio stack needs a moment before service discovery succeeds
        // reliably, so wait off the dispatch path
        let handler = Arc::clone(self);
        let mut stop = self.stop.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(handler.settle_delay) => {
                    handler.sessions.discover_services(&handler.address).await;
                }
                _ = super::cancelled(&mut stop) => {}
            }
        });
    }

    fn process_services_discovered(self: &Arc<Self>) {
        debug!(address = %self.address, "device services successfully discovered");
        self.publish_status("Services discovered.");
        self.state().phase = CollectionPhase::HarvestingDeviceInfo;

        // harvest on a separate task; its completion drives the
        // variant-specific arming step
        let (intake_tx, intake_rx) = mpsc::channel(1);
        *self
            .info_intake
            .lock()
            .expect("info intake lock poisoned") = Some(intake_tx);

        let harvester = DeviceInformationHarvester::new(
            self.address.clone(),
            self.sessions.clone(),
            intake_rx,
            self.stop.subscribe(),
        );
        let handler = Arc::clone(self);
        tokio::spawn(async move {
            if let Some(information) = harvester.run().await {
                handler
                    .collector
                    .receive_device_information(information, &handler.address);
                handler.after_harvest().await;
            }
        });
    }

    /// Variant continuation once the device information has been reported.
    async fn after_harvest(self: &Arc<Self>) {
        self.state().phase = CollectionPhase::ArmingNotifications;
        match self.collection_type {
            CollectionType::Weight => self.arm_weight_indication().await,
            CollectionType::Glucose => self.spawn_glucose_arming(),
        }
    }

    async fn arm_weight_indication(&self) {
        let armed = self
            .sessions
            .enable_notification(
                protocol::WEIGHT_SCALE_SERVICE,
                protocol::WEIGHT_MEASUREMENT,
                &self.address,
                true,
            )
            .await;
        if !armed {
            error!(address = %self.address, "could not arm the weight indication");
        }
        let mut state = self.state();
        state.notifications_armed = armed;
        state.phase = CollectionPhase::AwaitingData;
    }

    fn spawn_glucose_arming(self: &Arc<Self>) {
        let (gate_tx, gate_rx) = mpsc::channel(1);
        *self
            .descriptor_gate
            .lock()
            .expect("descriptor gate lock poisoned") = Some(gate_tx);

        let handler = Arc::clone(self);
        let stop = self.stop.subscribe();
        tokio::spawn(async move { handler.run_glucose_arming(gate_rx, stop).await });
    }

    /// Arms the three glucose attributes in sequence. Each step submits the
    /// request and then waits, bounded, for the descriptor-written
    /// confirmation; any miss is fail-closed and the record request is
    /// never issued.
    async fn run_glucose_arming(
        &self,
        mut gate: mpsc::Receiver<DescriptorValue>,
        mut stop: watch::Receiver<bool>,
    ) {
        let context_armed = self
            .arm_step(
                protocol::GLUCOSE_MEASUREMENT_CONTEXT,
                false,
                &mut gate,
                &mut stop,
            )
            .await;
        let measurement_armed = self
            .arm_step(protocol::GLUCOSE_MEASUREMENT, false, &mut gate, &mut stop)
            .await;
        let racp_armed = self
            .arm_step(
                protocol::RECORD_ACCESS_CONTROL_POINT,
                true,
                &mut gate,
                &mut stop,
            )
            .await;

        let all_armed = context_armed && measurement_armed && racp_armed;
        {
            let mut state = self.state();
            if let ProfileState::Glucose {
                context_armed: ctx,
                measurement_armed: meas,
                racp_armed: racp,
            } = &mut state.profile
            {
                *ctx = context_armed;
                *meas = measurement_armed;
                *racp = racp_armed;
            }
            state.notifications_armed = all_armed;
            if all_armed {
                state.phase = CollectionPhase::AwaitingData;
            }
        }

        if all_armed {
            let requested = self
                .sessions
                .request_all_records(
                    protocol::GLUCOSE_SERVICE,
                    protocol::RECORD_ACCESS_CONTROL_POINT,
                    &self.address,
                )
                .await;
            self.state().data_requested = requested;
            if !requested {
                error!(
                    address = %self.address,
                    "could not request records (request not sent)"
                );
            }
        }
    }

    async fn arm_step(
        &self,
        characteristic: Uuid,
        is_indication: bool,
        gate: &mut mpsc::Receiver<DescriptorValue>,
        stop: &mut watch::Receiver<bool>,
    ) -> bool {
        let submitted = self
            .sessions
            .enable_notification(
                protocol::GLUCOSE_SERVICE,
                characteristic,
                &self.address,
                is_indication,
            )
            .await;
        if !submitted {
            error!(
                characteristic = %characteristic,
                "could not enable value reports (request returned false)"
            );
            return false;
        }

        tokio::select! {
            confirmation = tokio::time::timeout(self.arming_timeout, gate.recv()) => {
                match confirmation {
                    Ok(Some(_descriptor)) => true,
                    Ok(None) => false,
                    Err(_elapsed) => {
                        error!(
                            characteristic = %characteristic,
                            "descriptor confirmation timed out"
                        );
                        false
                    }
                }
            }
            _ = super::cancelled(stop) => false,
        }
    }

    async fn process_data(&self, characteristic: CharacteristicValue) {
        // device-information values belong to the harvester
        if InformationField::find(characteristic.uuid).is_some() {
            self.publish_status("Device Information Part received.");
            let intake = self
                .info_intake
                .lock()
                .expect("info intake lock poisoned")
                .clone();
            if let Some(intake) = intake {
                match intake.try_send(characteristic) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(
                            address = %self.address,
                            "device information intake full, dropping value"
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        debug!(
                            address = %self.address,
                            "no active harvest for device information value"
                        );
                    }
                }
            }
            return;
        }

        self.publish_status("Data received.");
        self.state().data_received = true;

        match self.collection_type {
            CollectionType::Weight => {
                if characteristic.uuid == protocol::WEIGHT_MEASUREMENT {
                    match WeightMeasurement::decode(&characteristic.value) {
                        Ok(measurement) => self
                            .collector
                            .receive_measurement(Measurement::Weight(measurement), &self.address),
                        Err(error) => warn!(
                            address = %self.address,
                            %error,
                            "dropping malformed weight measurement"
                        ),
                    }
                }
            }
            CollectionType::Glucose => {
                if characteristic.uuid == protocol::GLUCOSE_MEASUREMENT {
                    match GlucoseMeasurement::decode(&characteristic.value) {
                        Ok(measurement) => self
                            .collector
                            .receive_measurement(Measurement::Glucose(measurement), &self.address),
                        Err(error) => warn!(
                            address = %self.address,
                            %error,
                            "dropping malformed glucose measurement"
                        ),
                    }
                }
            }
        }
    }

    fn process_descriptor_written(&self, descriptor: DescriptorValue) {
        let gate = self
            .descriptor_gate
            .lock()
            .expect("descriptor gate lock poisoned")
            .clone();
        if let Some(gate) = gate {
            let _ = gate.try_send(descriptor);
        }
    }

    /// Losing the connection ends the workflow; restarts are an external
    /// decision.
    async fn process_disconnected(&self) {
        self.publish_status("Connection lost.");
        self.publish_connection_lost().await;
        {
            let mut state = self.state();
            state.done = true;
            state.phase = CollectionPhase::Done;
        }
        // unblock a stalled harvester or arming sequence right away
        self.stop.send_replace(true);
    }

    fn publish_status(&self, message: &str) {
        self.collector
            .broadcast_device_message(&format!("({})> {}", self.address, message));
    }

    async fn publish_connection_established(&self) {
        let name = self.sessions.device_name(&self.address).await;
        self.collector
            .broadcast_connection_established(&self.address, &name);
    }

    async fn publish_connection_lost(&self) {
        let name = self.sessions.device_name(&self.address).await;
        self.collector
            .broadcast_connection_lost(&self.address, &name);
    }
}
