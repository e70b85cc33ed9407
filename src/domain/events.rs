//! Event Sink
//!
//! The output surface of the core. The host (UI, console, tests) implements
//! [`EventSink`] or consumes [`AppEvent`]s from a [`ChannelSink`].

use crate::domain::error::ErrorKind;
use crate::domain::models::{
    AppEvent, ConnectionState, HeartRateMeasurement, PeripheralHandle, StepMeasurement,
};
use tokio::sync::mpsc;

/// Observer for everything the core reports
///
/// Calls are made from whichever task drives the core; marshalling onto a
/// UI thread is the implementor's job.
pub trait EventSink: Send + Sync {
    fn on_peripherals_updated(&self, peripherals: &[PeripheralHandle]);
    fn on_connection_state_changed(&self, state: &ConnectionState);
    fn on_step_measurement(&self, measurement: &StepMeasurement);
    fn on_heart_rate_measurement(&self, measurement: &HeartRateMeasurement);
    fn on_error(&self, kind: ErrorKind, context: &str);
}

/// Forwards every call as an [`AppEvent`] over an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<AppEvent>,
}

impl ChannelSink {
    pub fn new(sender: mpsc::UnboundedSender<AppEvent>) -> Self {
        Self { sender }
    }

    /// Create a sink together with its receiving end
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<AppEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    fn send(&self, event: AppEvent) {
        // Receiver gone means the host is shutting down
        let _ = self.sender.send(event);
    }
}

impl EventSink for ChannelSink {
    fn on_peripherals_updated(&self, peripherals: &[PeripheralHandle]) {
        self.send(AppEvent::PeripheralsUpdated(peripherals.to_vec()));
    }

    fn on_connection_state_changed(&self, state: &ConnectionState) {
        self.send(AppEvent::ConnectionState(state.clone()));
    }

    fn on_step_measurement(&self, measurement: &StepMeasurement) {
        self.send(AppEvent::Steps(*measurement));
    }

    fn on_heart_rate_measurement(&self, measurement: &HeartRateMeasurement) {
        self.send(AppEvent::HeartRate(*measurement));
    }

    fn on_error(&self, kind: ErrorKind, context: &str) {
        self.send(AppEvent::Error {
            kind,
            context: context.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::HeartRateFormat;

    #[test]
    fn test_channel_sink_forwards_events() {
        let (sink, mut rx) = ChannelSink::channel();

        sink.on_connection_state_changed(&ConnectionState::Connecting);
        sink.on_heart_rate_measurement(&HeartRateMeasurement {
            bpm: 72,
            format: HeartRateFormat::U8,
        });
        sink.on_error(ErrorKind::MalformedPayload, "short packet");

        assert_eq!(
            rx.try_recv().unwrap(),
            AppEvent::ConnectionState(ConnectionState::Connecting)
        );
        assert!(matches!(rx.try_recv().unwrap(), AppEvent::HeartRate(m) if m.bpm == 72));
        assert_eq!(
            rx.try_recv().unwrap(),
            AppEvent::Error {
                kind: ErrorKind::MalformedPayload,
                context: "short packet".to_string(),
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_channel_sink_ignores_closed_receiver() {
        let (sink, rx) = ChannelSink::channel();
        drop(rx);
        sink.on_step_measurement(&StepMeasurement::Partial { steps: 1 });
    }
}
