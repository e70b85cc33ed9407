//! Simulated Band
//!
//! An in-process peripheral that answers the same requests as a real band.
//! Telemetry only flows after the unlock command, and only for the
//! characteristics whose notifications were enabled.

use crate::domain::error::{BandError, Result};
use crate::domain::models::{CharacteristicRef, PeripheralHandle, RawNotification};
use crate::infrastructure::bluetooth::protocol::{
    CCCD_UUID, ENABLE_NOTIFICATION_VALUE, HEART_RATE_CHAR, HEART_RATE_CHAR_UUID,
    HEART_RATE_SERVICE_UUID, STEP_CHAR, STEP_CHAR_UUID, STEP_SERVICE_UUID, UNLOCK_CHAR,
    UNLOCK_CHAR_UUID, UNLOCK_COMMAND,
};
use crate::infrastructure::bluetooth::transport::{
    Advertisement, DiscoveredCharacteristic, DiscoveredService, GattEvent, GattEventSender,
    GattTransport, RadioScanner,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    pub address: String,
    pub name: String,
    /// Expose the standard heart rate service
    pub heart_rate_service: bool,
    /// Send the 2-byte legacy step payload instead of the 9-byte one
    pub legacy_steps: bool,
    pub notify_interval: Duration,
    /// Delay before each GATT callback
    pub latency: Duration,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            address: "C4:7C:8D:6A:11:02".to_string(),
            name: "BeatXP Vega (sim)".to_string(),
            heart_rate_service: true,
            legacy_steps: false,
            notify_interval: Duration::from_secs(1),
            latency: Duration::from_millis(20),
        }
    }
}

impl SimulatorConfig {
    fn services(&self) -> Vec<DiscoveredService> {
        let with_cccd = |uuid: Uuid| DiscoveredCharacteristic {
            uuid,
            descriptors: vec![CCCD_UUID],
        };

        let mut services = vec![DiscoveredService {
            uuid: STEP_SERVICE_UUID,
            characteristics: vec![
                with_cccd(STEP_CHAR_UUID),
                DiscoveredCharacteristic {
                    uuid: UNLOCK_CHAR_UUID,
                    descriptors: Vec::new(),
                },
            ],
        }];
        if self.heart_rate_service {
            services.push(DiscoveredService {
                uuid: HEART_RATE_SERVICE_UUID,
                characteristics: vec![with_cccd(HEART_RATE_CHAR_UUID)],
            });
        }
        services
    }
}

/// Advertises the simulated band plus an unnamed neighbour
pub struct SimulatedRadio {
    config: SimulatorConfig,
    task: Option<JoinHandle<()>>,
}

impl SimulatedRadio {
    pub fn new(config: SimulatorConfig) -> Self {
        Self { config, task: None }
    }
}

impl RadioScanner for SimulatedRadio {
    fn start(&mut self, sightings: mpsc::UnboundedSender<Advertisement>) -> Result<()> {
        self.stop();

        let band = Advertisement {
            address: self.config.address.clone(),
            name: Some(self.config.name.clone()),
            rssi: Some(-58),
        };
        let neighbour = Advertisement {
            address: "00:1A:7D:DA:71:13".to_string(),
            name: None,
            rssi: Some(-81),
        };

        self.task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(250));
            loop {
                interval.tick().await;
                if sightings.send(neighbour.clone()).is_err()
                    || sightings.send(band.clone()).is_err()
                {
                    break;
                }
            }
        }));
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    fn is_scanning(&self) -> bool {
        self.task.is_some()
    }
}

impl Drop for SimulatedRadio {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Telemetry state shared with the notifier task
#[derive(Default)]
struct BandState {
    unlocked: AtomicBool,
    subscriptions: Mutex<Vec<CharacteristicRef>>,
}

pub struct SimulatedTransport {
    config: SimulatorConfig,
    events: Option<GattEventSender>,
    state: Arc<BandState>,
    tasks: Vec<JoinHandle<()>>,
    notifier: Option<JoinHandle<()>>,
}

impl SimulatedTransport {
    pub fn new(config: SimulatorConfig) -> Self {
        Self {
            config,
            events: None,
            state: Arc::new(BandState::default()),
            tasks: Vec::new(),
            notifier: None,
        }
    }

    fn events(&self) -> Result<GattEventSender> {
        self.events
            .clone()
            .ok_or_else(|| BandError::Transport("not connected".into()))
    }

    /// Deliver `event` after the configured latency
    fn reply(&mut self, event: GattEvent) -> Result<()> {
        let events = self.events()?;
        let latency = self.config.latency;
        self.tasks.retain(|t| !t.is_finished());
        self.tasks.push(tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            events.send(event);
        }));
        Ok(())
    }

    fn start_notifier(&mut self) -> Result<()> {
        if self.notifier.is_some() {
            return Ok(());
        }
        let events = self.events()?;
        let state = Arc::clone(&self.state);
        let interval = self.config.notify_interval;
        let legacy = self.config.legacy_steps;

        self.notifier = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut tick: u16 = 0;
            loop {
                ticker.tick().await;
                if !state.unlocked.load(Ordering::SeqCst) {
                    continue;
                }
                tick = tick.wrapping_add(1);
                let subscriptions = match state.subscriptions.lock() {
                    Ok(subs) => subs.clone(),
                    Err(_) => break,
                };
                for source in subscriptions {
                    let payload = if source == STEP_CHAR {
                        step_payload(tick, legacy)
                    } else {
                        heart_rate_payload(tick)
                    };
                    let delivered = events.send(GattEvent::Notification(RawNotification {
                        source,
                        payload,
                        received_at: Instant::now(),
                    }));
                    if !delivered {
                        return;
                    }
                }
            }
        }));
        Ok(())
    }
}

fn step_payload(tick: u16, legacy: bool) -> Vec<u8> {
    let steps = tick.wrapping_mul(12);
    if legacy {
        return steps.to_le_bytes().to_vec();
    }
    let distance = (u32::from(steps) * 7 / 10) as u16;
    let calories = (steps / 25) as u8;
    let [s0, s1] = steps.to_le_bytes();
    let [d0, d1] = distance.to_le_bytes();
    vec![s0, s1, 0x00, d0, d1, 0x00, calories, 0x00, 0x00]
}

fn heart_rate_payload(tick: u16) -> Vec<u8> {
    let bpm = 68 + (tick % 12) as u8;
    vec![0x00, bpm]
}

impl GattTransport for SimulatedTransport {
    fn connect(&mut self, peripheral: &PeripheralHandle, events: GattEventSender) -> Result<()> {
        self.disconnect();
        self.events = Some(events);
        if peripheral.address != self.config.address {
            return self.reply(GattEvent::LinkFailed(format!(
                "no simulated peripheral at {}",
                peripheral.address
            )));
        }
        info!("Simulated band accepting connection");
        self.reply(GattEvent::LinkEstablished)
    }

    fn discover_services(&mut self) -> Result<()> {
        let services = self.config.services();
        self.reply(GattEvent::ServicesDiscovered(services))
    }

    fn write_without_response(&mut self, target: &CharacteristicRef, value: &[u8]) -> Result<()> {
        self.events()?;
        if *target == UNLOCK_CHAR && value == UNLOCK_COMMAND {
            debug!("Simulated band unlocked");
            self.state.unlocked.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    fn write_descriptor(
        &mut self,
        target: &CharacteristicRef,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<()> {
        let known = *target == STEP_CHAR
            || (*target == HEART_RATE_CHAR && self.config.heart_rate_service);
        let success = known && descriptor == CCCD_UUID && value == ENABLE_NOTIFICATION_VALUE;

        if success {
            if let Ok(mut subs) = self.state.subscriptions.lock() {
                if !subs.contains(target) {
                    subs.push(*target);
                }
            }
            self.start_notifier()?;
        }

        self.reply(GattEvent::DescriptorWritten {
            characteristic: *target,
            success,
        })
    }

    fn disconnect(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(notifier) = self.notifier.take() {
            notifier.abort();
        }
        self.events = None;
        self.state = Arc::new(BandState::default());
    }
}

impl Drop for SimulatedTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::protocol::{decode_heart_rate, decode_steps};
    use crate::infrastructure::bluetooth::session::SessionInput;

    #[test]
    fn test_generated_payloads_decode() {
        let full = decode_steps(&step_payload(10, false)).unwrap();
        assert_eq!(full.steps(), 120);
        assert_eq!(full.distance_meters(), Some(84));
        assert_eq!(full.calories(), Some(4));

        let legacy = decode_steps(&step_payload(10, true)).unwrap();
        assert!(legacy.is_partial());

        let hr = decode_heart_rate(&heart_rate_payload(3)).unwrap();
        assert_eq!(hr.bpm, 71);
    }

    #[tokio::test(start_paused = true)]
    async fn test_telemetry_requires_unlock() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut transport = SimulatedTransport::new(SimulatorConfig::default());
        let band = PeripheralHandle::new("C4:7C:8D:6A:11:02", None);

        transport.connect(&band, GattEventSender::new(1, tx)).unwrap();
        transport
            .write_descriptor(&STEP_CHAR, CCCD_UUID, ENABLE_NOTIFICATION_VALUE)
            .unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;
        let mut notifications = 0;
        while let Ok(input) = rx.try_recv() {
            if let SessionInput::Gatt {
                event: GattEvent::Notification(_),
                ..
            } = input
            {
                notifications += 1;
            }
        }
        assert_eq!(notifications, 0);

        transport
            .write_without_response(&UNLOCK_CHAR, UNLOCK_COMMAND)
            .unwrap();
        let input = rx.recv().await.unwrap();
        assert!(matches!(
            input,
            SessionInput::Gatt {
                event: GattEvent::Notification(RawNotification { source, .. }),
                ..
            } if source == STEP_CHAR
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_address_fails_link() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut transport = SimulatedTransport::new(SimulatorConfig::default());
        let stranger = PeripheralHandle::new("11:22:33:44:55:66", None);

        transport.connect(&stranger, GattEventSender::new(1, tx)).unwrap();
        assert!(matches!(
            rx.recv().await,
            Some(SessionInput::Gatt {
                event: GattEvent::LinkFailed(_),
                ..
            })
        ));
    }

    #[test]
    fn test_requests_without_link_are_rejected() {
        let mut transport = SimulatedTransport::new(SimulatorConfig::default());
        assert!(transport.discover_services().is_err());
        assert!(transport
            .write_without_response(&UNLOCK_CHAR, UNLOCK_COMMAND)
            .is_err());
    }
}
