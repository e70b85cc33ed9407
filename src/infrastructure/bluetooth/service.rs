//! Bluetooth Service Module
//!
//! Main service that coordinates scanning and the single connection session
//! for the band.

use crate::domain::error::{BandError, Result};
use crate::domain::events::EventSink;
use crate::domain::models::PeripheralHandle;
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::{
    scanner::{ScanGate, ScanStream},
    session::{ConnectionSession, SessionConfig, SessionInput},
    transport::{GattTransport, RadioScanner},
};
use crate::infrastructure::scheduler::TokioScheduler;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

impl From<&Settings> for SessionConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            connect_timeout: settings.connect_timeout(),
            operation_timeout: settings.operation_timeout(),
            settle_delay: settings.settle_delay(),
        }
    }
}

/// Main Bluetooth service coordinating all BLE operations
///
/// The session runs on its own task and is only reached through its input
/// queue, so every GATT callback, timer and command is applied in order.
pub struct BandService<R: RadioScanner> {
    scanner: ScanGate<R>,
    scan_timeout: Duration,
    inputs: mpsc::UnboundedSender<SessionInput>,
    session_task: JoinHandle<()>,
}

impl<R: RadioScanner> BandService<R> {
    /// Create the service and spawn its session loop on the current runtime
    pub fn start<T>(radio: R, transport: T, sink: Arc<dyn EventSink>, settings: &Settings) -> Self
    where
        T: GattTransport + 'static,
    {
        let (inputs, input_rx) = mpsc::unbounded_channel();
        let session = ConnectionSession::new(
            transport,
            TokioScheduler::new(inputs.clone()),
            Arc::clone(&sink),
            SessionConfig::from(settings),
            inputs.clone(),
        );
        let session_task = tokio::spawn(session.run(input_rx));

        let scanner = ScanGate::new(radio)
            .with_sink(sink)
            .with_name_prefix(settings.target_name_prefix.clone());

        Self {
            scanner,
            scan_timeout: settings.scan_timeout(),
            inputs,
            session_task,
        }
    }

    /// Start scanning for the configured scan window
    pub fn start_scan(&mut self) -> Result<ScanStream<R>> {
        self.scanner.start_scan(self.scan_timeout)
    }

    /// Stop scanning
    pub fn stop_scan(&mut self) {
        self.scanner.stop_scan();
    }

    pub fn is_scanning(&self) -> bool {
        self.scanner.is_scanning()
    }

    /// Connect to a peripheral, replacing any current connection
    pub fn connect(&self, peripheral: PeripheralHandle) -> Result<()> {
        info!("Requesting connection to {}", peripheral);
        self.send(SessionInput::Connect(peripheral))
    }

    /// Disconnect from the current peripheral
    pub fn disconnect(&self) -> Result<()> {
        self.send(SessionInput::Disconnect)
    }

    /// Tear down the link and wait for the session loop to finish
    pub async fn shutdown(mut self) {
        self.scanner.stop_scan();
        let _ = self.inputs.send(SessionInput::Shutdown);
        if let Err(e) = (&mut self.session_task).await {
            error!("Session task ended abnormally: {}", e);
        }
    }

    fn send(&self, input: SessionInput) -> Result<()> {
        self.inputs
            .send(input)
            .map_err(|_| BandError::Transport("session loop is not running".into()))
    }
}

impl<R: RadioScanner> Drop for BandService<R> {
    fn drop(&mut self) {
        // The loop closes the link and exits; a no-op after `shutdown`
        let _ = self.inputs.send(SessionInput::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::ErrorKind;
    use crate::domain::events::ChannelSink;
    use crate::domain::models::{AppEvent, ConnectionState};
    use crate::infrastructure::bluetooth::simulator::{
        SimulatedRadio, SimulatedTransport, SimulatorConfig,
    };
    use tokio::time::timeout;

    fn settings() -> Settings {
        Settings {
            scan_timeout_ms: 1_000,
            settle_delay_ms: 100,
            ..Settings::default()
        }
    }

    async fn wait_for(
        events: &mut mpsc::UnboundedReceiver<AppEvent>,
        mut predicate: impl FnMut(&AppEvent) -> bool,
    ) -> Vec<AppEvent> {
        let mut seen = Vec::new();
        let found = timeout(Duration::from_secs(30), async {
            while let Some(event) = events.recv().await {
                let done = predicate(&event);
                seen.push(event);
                if done {
                    return;
                }
            }
        })
        .await;
        assert!(found.is_ok(), "event never arrived, saw {:?}", seen);
        seen
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_connect_and_stream_telemetry() {
        let config = SimulatorConfig::default();
        let (sink, mut events) = ChannelSink::channel();
        let mut service = BandService::start(
            SimulatedRadio::new(config.clone()),
            SimulatedTransport::new(config.clone()),
            Arc::new(sink),
            &settings(),
        );

        let found = service.start_scan().unwrap().collect().await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].address, config.address);
        assert!(!service.is_scanning());

        service.connect(found[0].clone()).unwrap();
        let seen = wait_for(&mut events, |e| {
            *e == AppEvent::ConnectionState(ConnectionState::Ready)
        })
        .await;
        assert!(!seen
            .iter()
            .any(|e| matches!(e, AppEvent::Error { .. })));

        wait_for(&mut events, |e| matches!(e, AppEvent::Steps(_))).await;
        wait_for(&mut events, |e| matches!(e, AppEvent::HeartRate(_))).await;

        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_band_without_heart_rate_service() {
        let config = SimulatorConfig {
            heart_rate_service: false,
            legacy_steps: true,
            ..SimulatorConfig::default()
        };
        let (sink, mut events) = ChannelSink::channel();
        let service = BandService::start(
            SimulatedRadio::new(config.clone()),
            SimulatedTransport::new(config.clone()),
            Arc::new(sink),
            &settings(),
        );

        service
            .connect(PeripheralHandle::new(config.address.clone(), None))
            .unwrap();
        let seen = wait_for(&mut events, |e| {
            *e == AppEvent::ConnectionState(ConnectionState::Ready)
        })
        .await;
        assert!(seen.iter().any(|e| matches!(
            e,
            AppEvent::Error {
                kind: ErrorKind::CharacteristicNotFound,
                ..
            }
        )));

        let seen = wait_for(&mut events, |e| matches!(e, AppEvent::Steps(_))).await;
        assert!(matches!(seen.last(), Some(AppEvent::Steps(m)) if m.is_partial()));

        service.disconnect().unwrap();
        wait_for(&mut events, |e| {
            *e == AppEvent::ConnectionState(ConnectionState::Disconnected)
        })
        .await;
        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_peripheral_fails() {
        let config = SimulatorConfig::default();
        let (sink, mut events) = ChannelSink::channel();
        let service = BandService::start(
            SimulatedRadio::new(config.clone()),
            SimulatedTransport::new(config),
            Arc::new(sink),
            &settings(),
        );

        service
            .connect(PeripheralHandle::new("11:22:33:44:55:66", None))
            .unwrap();
        let seen = wait_for(&mut events, |e| {
            matches!(e, AppEvent::ConnectionState(ConnectionState::Failed(_)))
        })
        .await;
        assert_eq!(seen[0], AppEvent::ConnectionState(ConnectionState::Connecting));

        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_service_closes_link() {
        let config = SimulatorConfig::default();
        let (sink, mut events) = ChannelSink::channel();
        let service = BandService::start(
            SimulatedRadio::new(config.clone()),
            SimulatedTransport::new(config.clone()),
            Arc::new(sink),
            &settings(),
        );

        service
            .connect(PeripheralHandle::new(config.address.clone(), None))
            .unwrap();
        wait_for(&mut events, |e| matches!(e, AppEvent::Steps(_))).await;
        drop(service);

        let seen = wait_for(&mut events, |e| {
            *e == AppEvent::ConnectionState(ConnectionState::Disconnected)
        })
        .await;
        assert!(!seen.iter().any(|e| matches!(e, AppEvent::Error { .. })));

        // Telemetry stops and every sink handle is released
        tokio::time::sleep(Duration::from_secs(5)).await;
        let mut after = Vec::new();
        while let Ok(event) = events.try_recv() {
            after.push(event);
        }
        assert!(after.is_empty(), "events after teardown: {:?}", after);
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_commands_after_shutdown_are_rejected() {
        let config = SimulatorConfig::default();
        let (sink, _events) = ChannelSink::channel();
        let service = BandService::start(
            SimulatedRadio::new(config.clone()),
            SimulatedTransport::new(config),
            Arc::new(sink),
            &settings(),
        );
        let inputs = service.inputs.clone();
        service.shutdown().await;
        assert!(inputs.send(SessionInput::Disconnect).is_err());
    }
}
