//! Connection Session
//!
//! Owns the lifecycle of one GATT link, from connect request to teardown.
//!
//! ## Sequencing
//!
//! ```text
//! Idle ─connect─► Connecting ─link up─► Connected ─► DiscoveringServices
//!                                                          │ services
//!                                                          ▼
//!        Ready ◄── SubscribingHeartRate ◄── SubscribingSteps ◄── Unlocking
//! ```
//!
//! After discovery the session enqueues `[Unlock, Subscribe(Steps),
//! Subscribe(HeartRate)]` and keeps exactly one of them in flight. The next
//! operation is issued only once the previous one has completed, optionally
//! after a settle delay. Every wait is bounded by a timeout.
//!
//! Inputs arrive through a single queue ([`SessionInput`]), so transitions
//! never overlap. Timers and transport callbacks carry the epoch they were
//! created under and are dropped once the session has moved on.

use crate::domain::error::{BandError, ErrorKind};
use crate::domain::events::EventSink;
use crate::domain::models::{
    CharacteristicRef, ConnectionState, FailureReason, PeripheralHandle, RawNotification,
};
use crate::infrastructure::bluetooth::protocol::{
    self, Telemetry, TelemetrySource, CCCD_UUID, ENABLE_NOTIFICATION_VALUE, UNLOCK_CHAR,
    UNLOCK_COMMAND,
};
use crate::infrastructure::bluetooth::transport::{
    lookup, DiscoveredService, GattEvent, GattEventSender, GattTransport, Lookup,
};
use crate::infrastructure::scheduler::{Epoch, Scheduler, TimerKind, TimerToken};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Everything that can advance a session
#[derive(Debug)]
pub enum SessionInput {
    Connect(PeripheralHandle),
    Disconnect,
    Gatt { epoch: Epoch, event: GattEvent },
    Timer(TimerToken),
    /// Tear down and leave the event loop
    Shutdown,
}

/// Timing configuration for a session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub connect_timeout: Duration,
    pub operation_timeout: Duration,
    /// Pause between a completed operation and the next one; zero disables it
    pub settle_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            operation_timeout: Duration::from_secs(5),
            settle_delay: Duration::from_millis(500),
        }
    }
}

/// A queued GATT write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GattOperation {
    Unlock,
    Subscribe(TelemetrySource),
}

impl GattOperation {
    fn state(&self) -> ConnectionState {
        match self {
            Self::Unlock => ConnectionState::Unlocking,
            Self::Subscribe(TelemetrySource::Steps) => ConnectionState::SubscribingSteps,
            Self::Subscribe(TelemetrySource::HeartRate) => ConnectionState::SubscribingHeartRate,
        }
    }
}

impl fmt::Display for GattOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unlock => f.write_str("unlock write"),
            Self::Subscribe(TelemetrySource::Steps) => f.write_str("step notification enable"),
            Self::Subscribe(TelemetrySource::HeartRate) => {
                f.write_str("heart rate notification enable")
            }
        }
    }
}

/// What the session is currently waiting on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    Link,
    Discovery,
    Operation(GattOperation),
    Settle,
}

impl fmt::Display for Pending {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Link => f.write_str("connection"),
            Self::Discovery => f.write_str("service discovery"),
            Self::Operation(op) => op.fmt(f),
            Self::Settle => f.write_str("settle delay"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Waiting {
    id: u64,
    what: Pending,
    since: Instant,
}

pub struct ConnectionSession<T: GattTransport, S: Scheduler> {
    transport: T,
    scheduler: S,
    sink: Arc<dyn EventSink>,
    config: SessionConfig,
    inputs: mpsc::UnboundedSender<SessionInput>,

    state: ConnectionState,
    epoch: Epoch,
    peripheral: Option<PeripheralHandle>,
    services: Vec<DiscoveredService>,
    queue: VecDeque<GattOperation>,
    waiting: Option<Waiting>,
    next_wait_id: u64,
}

impl<T: GattTransport, S: Scheduler> ConnectionSession<T, S> {
    /// `inputs` is the sending half of the queue this session is driven from
    pub fn new(
        transport: T,
        scheduler: S,
        sink: Arc<dyn EventSink>,
        config: SessionConfig,
        inputs: mpsc::UnboundedSender<SessionInput>,
    ) -> Self {
        Self {
            transport,
            scheduler,
            sink,
            config,
            inputs,
            state: ConnectionState::Idle,
            epoch: 0,
            peripheral: None,
            services: Vec::new(),
            queue: VecDeque::new(),
            waiting: None,
            next_wait_id: 0,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn peripheral(&self) -> Option<&PeripheralHandle> {
        self.peripheral.as_ref()
    }

    /// Drive the session until the queue closes or `Shutdown` arrives
    pub async fn run(mut self, mut inputs: mpsc::UnboundedReceiver<SessionInput>) {
        while let Some(input) = inputs.recv().await {
            if matches!(input, SessionInput::Shutdown) {
                break;
            }
            self.handle(input);
        }
        self.disconnect();
        debug!("Session loop finished");
    }

    /// Apply one input
    pub fn handle(&mut self, input: SessionInput) {
        match input {
            SessionInput::Connect(peripheral) => self.connect(peripheral),
            SessionInput::Disconnect | SessionInput::Shutdown => self.disconnect(),
            SessionInput::Gatt { epoch, event } => {
                if epoch != self.epoch {
                    debug!(
                        "Dropping {:?} from stale link (epoch {} != {})",
                        event, epoch, self.epoch
                    );
                    return;
                }
                self.on_gatt_event(event);
            }
            SessionInput::Timer(token) => {
                if token.epoch != self.epoch {
                    debug!("Ignoring stale timer {:?}", token);
                    return;
                }
                self.on_timer(token.kind);
            }
        }
    }

    /// Open a link to `peripheral`, tearing down any active one first
    pub fn connect(&mut self, peripheral: PeripheralHandle) {
        if self.state.is_active() {
            info!(
                "Closing link to {} before connecting to {}",
                self.peripheral
                    .as_ref()
                    .map(|p| p.display_name())
                    .unwrap_or("?"),
                peripheral
            );
            self.teardown(ConnectionState::Disconnected);
        }

        self.epoch += 1;
        self.services.clear();
        self.queue.clear();
        self.waiting = None;

        info!("Connecting to {}", peripheral);
        self.peripheral = Some(peripheral.clone());
        self.set_state(ConnectionState::Connecting);

        let events = GattEventSender::new(self.epoch, self.inputs.clone());
        match self.transport.connect(&peripheral, events) {
            Ok(()) => self.wait_for(Pending::Link, self.config.connect_timeout),
            Err(e) => self.fail(FailureReason::LinkFailure(e.to_string())),
        }
    }

    /// User-initiated teardown
    pub fn disconnect(&mut self) {
        if !self.state.is_active() {
            return;
        }
        info!("Disconnecting");
        self.teardown(ConnectionState::Disconnected);
    }

    fn on_gatt_event(&mut self, event: GattEvent) {
        if !self.state.is_active() {
            debug!("Ignoring {:?} in state {}", event, self.state);
            return;
        }

        match event {
            GattEvent::LinkEstablished => self.on_link_established(),
            GattEvent::LinkFailed(reason) => {
                error!("Link failed: {}", reason);
                self.fail(FailureReason::LinkFailure(reason));
            }
            GattEvent::ServicesDiscovered(services) => self.on_services_discovered(services),
            GattEvent::DiscoveryFailed(reason) => {
                if self.is_waiting_for(Pending::Discovery) {
                    error!("Service discovery failed: {}", reason);
                    self.fail(FailureReason::LinkFailure(format!(
                        "service discovery failed: {}",
                        reason
                    )));
                }
            }
            GattEvent::DescriptorWritten {
                characteristic,
                success,
            } => {
                let expected = match self.waiting {
                    Some(Waiting {
                        what: Pending::Operation(GattOperation::Subscribe(source)),
                        ..
                    }) => source.characteristic() == characteristic,
                    _ => false,
                };
                if !expected {
                    debug!("Unexpected descriptor write result for {}", characteristic);
                    return;
                }
                if !success {
                    self.report(BandError::LinkFailure(format!(
                        "enabling notifications on {} was not acknowledged",
                        characteristic
                    )));
                }
                self.complete_operation();
            }
            GattEvent::Notification(notification) => self.on_notification(notification),
            GattEvent::LinkDropped(reason) => {
                let context = reason.unwrap_or_else(|| "peer closed the link".to_string());
                warn!("Link dropped while {}: {}", self.state, context);
                self.teardown(ConnectionState::Disconnected);
                self.sink.on_error(ErrorKind::Disconnected, &context);
            }
        }
    }

    fn on_link_established(&mut self) {
        if !self.is_waiting_for(Pending::Link) {
            debug!("Duplicate link established callback");
            return;
        }
        self.waiting = None;

        info!("Link established");
        self.set_state(ConnectionState::Connected);

        match self.transport.discover_services() {
            Ok(()) => {
                self.set_state(ConnectionState::DiscoveringServices);
                self.wait_for(Pending::Discovery, self.config.operation_timeout);
            }
            Err(e) => self.fail(FailureReason::LinkFailure(format!(
                "service discovery request rejected: {}",
                e
            ))),
        }
    }

    fn on_services_discovered(&mut self, services: Vec<DiscoveredService>) {
        if !self.is_waiting_for(Pending::Discovery) {
            debug!("Ignoring service discovery result in state {}", self.state);
            return;
        }
        self.waiting = None;

        info!("Discovered {} services", services.len());
        for service in &services {
            debug!(
                "Service {} with {} characteristics",
                service.uuid,
                service.characteristics.len()
            );
        }
        self.services = services;

        self.queue = VecDeque::from([
            GattOperation::Unlock,
            GattOperation::Subscribe(TelemetrySource::Steps),
            GattOperation::Subscribe(TelemetrySource::HeartRate),
        ]);
        self.advance();
    }

    /// Issue queued operations until one needs to be waited on
    fn advance(&mut self) {
        while let Some(op) = self.queue.pop_front() {
            self.set_state(op.state());

            match self.issue(op) {
                Issued::Waiting => {
                    self.wait_for(Pending::Operation(op), self.config.operation_timeout);
                    return;
                }
                Issued::Done => {
                    if self.pause_before_next() {
                        return;
                    }
                }
                Issued::Skipped => {}
            }
        }

        info!("Session ready");
        self.set_state(ConnectionState::Ready);
    }

    fn issue(&mut self, op: GattOperation) -> Issued {
        match op {
            GattOperation::Unlock => {
                if let Err(what) = self.require(&UNLOCK_CHAR, "unlock characteristic", None) {
                    self.report(BandError::CharacteristicNotFound(what));
                    return Issued::Skipped;
                }
                match self
                    .transport
                    .write_without_response(&UNLOCK_CHAR, UNLOCK_COMMAND)
                {
                    Ok(()) => info!("Unlock command written"),
                    Err(e) => self.report(BandError::LinkFailure(format!(
                        "unlock write rejected: {}",
                        e
                    ))),
                }
                // No response is expected either way
                Issued::Done
            }
            GattOperation::Subscribe(source) => {
                let target = source.characteristic();
                let label = match source {
                    TelemetrySource::Steps => "step characteristic",
                    TelemetrySource::HeartRate => "heart rate characteristic",
                };
                if let Err(what) = self.require(&target, label, Some(CCCD_UUID)) {
                    self.report(BandError::CharacteristicNotFound(what));
                    return Issued::Skipped;
                }
                match self
                    .transport
                    .write_descriptor(&target, CCCD_UUID, ENABLE_NOTIFICATION_VALUE)
                {
                    Ok(()) => {
                        debug!("Notification enable requested for {}", label);
                        Issued::Waiting
                    }
                    Err(e) => {
                        self.report(BandError::LinkFailure(format!(
                            "descriptor write on {} rejected: {}",
                            label, e
                        )));
                        Issued::Done
                    }
                }
            }
        }
    }

    /// Check `target` (and optionally one of its descriptors) was discovered
    fn require(
        &self,
        target: &CharacteristicRef,
        label: &str,
        descriptor: Option<Uuid>,
    ) -> Result<(), String> {
        match lookup(&self.services, target) {
            Lookup::ServiceMissing => Err(format!("service {} for {}", target.service, label)),
            Lookup::CharacteristicMissing => Err(format!("{} {}", label, target.characteristic)),
            Lookup::Found(characteristic) => match descriptor {
                Some(d) if !characteristic.descriptors.contains(&d) => {
                    Err(format!("descriptor {} on {}", d, label))
                }
                _ => Ok(()),
            },
        }
    }

    /// Log and report a problem that does not end the session
    fn report(&self, error: BandError) {
        warn!("{}", error);
        if let Some(kind) = error.kind() {
            self.sink.on_error(kind, &error.to_string());
        }
    }

    fn complete_operation(&mut self) {
        if let Some(waiting) = self.waiting.take() {
            debug!(
                "{} completed after {:?}",
                waiting.what,
                self.scheduler.now().saturating_duration_since(waiting.since)
            );
        }
        if !self.pause_before_next() {
            self.advance();
        }
    }

    /// Schedule the settle delay if more work is queued; true if paused
    fn pause_before_next(&mut self) -> bool {
        if self.config.settle_delay.is_zero() || self.queue.is_empty() {
            return false;
        }
        let id = self.begin_wait(Pending::Settle);
        self.scheduler.schedule(
            self.config.settle_delay,
            TimerToken {
                epoch: self.epoch,
                kind: TimerKind::Settle(id),
            },
        );
        true
    }

    fn on_timer(&mut self, kind: TimerKind) {
        let Some(waiting) = self.waiting else {
            debug!("Timer {:?} fired with nothing pending", kind);
            return;
        };

        match kind {
            TimerKind::Settle(id) if id == waiting.id && waiting.what == Pending::Settle => {
                self.waiting = None;
                self.advance();
            }
            TimerKind::Timeout(id) if id == waiting.id => {
                error!("Timed out waiting for {}", waiting.what);
                self.fail(FailureReason::OperationTimeout(waiting.what.to_string()));
            }
            _ => debug!("Timer {:?} no longer relevant", kind),
        }
    }

    fn on_notification(&mut self, notification: RawNotification) {
        match protocol::decode(&notification) {
            Ok(Telemetry::Steps(measurement)) => {
                debug!("Steps: {:?}", measurement);
                self.sink.on_step_measurement(&measurement);
            }
            Ok(Telemetry::HeartRate(measurement)) => {
                debug!("Heart rate: {} bpm", measurement.bpm);
                self.sink.on_heart_rate_measurement(&measurement);
            }
            Err(BandError::UnknownCharacteristic(source)) => {
                debug!("Ignoring notification from {}", source);
            }
            Err(e) => self.report(e),
        }
    }

    fn is_waiting_for(&self, what: Pending) -> bool {
        matches!(self.waiting, Some(w) if w.what == what)
    }

    fn begin_wait(&mut self, what: Pending) -> u64 {
        self.next_wait_id += 1;
        self.waiting = Some(Waiting {
            id: self.next_wait_id,
            what,
            since: self.scheduler.now(),
        });
        self.next_wait_id
    }

    fn wait_for(&mut self, what: Pending, timeout: Duration) {
        let id = self.begin_wait(what);
        self.scheduler.schedule(
            timeout,
            TimerToken {
                epoch: self.epoch,
                kind: TimerKind::Timeout(id),
            },
        );
    }

    fn fail(&mut self, reason: FailureReason) {
        let kind = reason.kind();
        let context = reason.to_string();
        self.teardown(ConnectionState::Failed(reason));
        self.sink.on_error(kind, &context);
    }

    /// Release the link and invalidate everything scheduled against it
    fn teardown(&mut self, terminal: ConnectionState) {
        self.transport.disconnect();
        self.scheduler.cancel_all();
        self.queue.clear();
        self.waiting = None;
        self.services.clear();
        self.epoch += 1;
        self.set_state(terminal);
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        debug!("State: {} -> {}", self.state, state);
        self.state = state;
        self.sink.on_connection_state_changed(&self.state);
    }
}

enum Issued {
    /// Completion arrives as a later event
    Waiting,
    /// Completed on issue
    Done,
    Skipped,
}
