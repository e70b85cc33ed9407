use crate::domain::error::ErrorKind;
use std::fmt;
use std::time::Instant;
use uuid::Uuid;

/// A peripheral seen during a scan
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeripheralHandle {
    /// Stable platform identifier (MAC address on Windows/Linux)
    pub address: String,
    pub name: Option<String>,
}

impl PeripheralHandle {
    pub fn new(address: impl Into<String>, name: Option<String>) -> Self {
        Self {
            address: address.into(),
            name,
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.address)
    }
}

impl fmt::Display for PeripheralHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", name, self.address),
            None => f.write_str(&self.address),
        }
    }
}

/// Why a session ended in [`ConnectionState::Failed`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    LinkFailure(String),
    OperationTimeout(String),
}

impl FailureReason {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::LinkFailure(_) => ErrorKind::LinkFailure,
            Self::OperationTimeout(_) => ErrorKind::OperationTimeout,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LinkFailure(msg) => write!(f, "link failure: {}", msg),
            Self::OperationTimeout(op) => write!(f, "timed out waiting for {}", op),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    DiscoveringServices,
    Unlocking,
    SubscribingSteps,
    SubscribingHeartRate,
    Ready,
    Disconnected,
    Failed(FailureReason),
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed(_))
    }

    /// True while a GATT link is held (or being opened)
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Idle) && !self.is_terminal()
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Connecting => f.write_str("connecting"),
            Self::Connected => f.write_str("connected"),
            Self::DiscoveringServices => f.write_str("discovering services"),
            Self::Unlocking => f.write_str("unlocking"),
            Self::SubscribingSteps => f.write_str("subscribing to steps"),
            Self::SubscribingHeartRate => f.write_str("subscribing to heart rate"),
            Self::Ready => f.write_str("ready"),
            Self::Disconnected => f.write_str("disconnected"),
            Self::Failed(reason) => write!(f, "failed ({})", reason),
        }
    }
}

/// A (service, characteristic) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicRef {
    pub service: Uuid,
    pub characteristic: Uuid,
}

impl fmt::Display for CharacteristicRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.characteristic)
    }
}

/// A notification as delivered by the transport, before decoding
#[derive(Debug, Clone)]
pub struct RawNotification {
    pub source: CharacteristicRef,
    pub payload: Vec<u8>,
    pub received_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepMeasurement {
    Full {
        steps: u16,
        distance_meters: u16,
        calories: u8,
    },
    /// Legacy short payload: only the step counter is known
    Partial { steps: u16 },
}

impl StepMeasurement {
    pub fn steps(&self) -> u16 {
        match self {
            Self::Full { steps, .. } | Self::Partial { steps } => *steps,
        }
    }

    pub fn distance_meters(&self) -> Option<u16> {
        match self {
            Self::Full {
                distance_meters, ..
            } => Some(*distance_meters),
            Self::Partial { .. } => None,
        }
    }

    pub fn calories(&self) -> Option<u8> {
        match self {
            Self::Full { calories, .. } => Some(*calories),
            Self::Partial { .. } => None,
        }
    }

    pub fn is_partial(&self) -> bool {
        matches!(self, Self::Partial { .. })
    }
}

/// Width of the heart rate value on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartRateFormat {
    U8,
    U16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartRateMeasurement {
    pub bpm: u16,
    pub format: HeartRateFormat,
}

/// Everything the core reports to its host
#[derive(Debug, Clone, PartialEq)]
pub enum AppEvent {
    PeripheralsUpdated(Vec<PeripheralHandle>),
    ConnectionState(ConnectionState),
    Steps(StepMeasurement),
    HeartRate(HeartRateMeasurement),
    Error { kind: ErrorKind, context: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(ConnectionState::Disconnected.is_terminal());
        assert!(
            ConnectionState::Failed(FailureReason::LinkFailure("gone".into())).is_terminal()
        );
        assert!(!ConnectionState::Ready.is_terminal());
        assert!(!ConnectionState::Idle.is_active());
        assert!(ConnectionState::SubscribingSteps.is_active());
    }

    #[test]
    fn test_partial_steps_have_unknown_extras() {
        let partial = StepMeasurement::Partial { steps: 12 };
        assert_eq!(partial.steps(), 12);
        assert!(partial.is_partial());
        assert_eq!(partial.distance_meters(), None);
        assert_eq!(partial.calories(), None);

        let full = StepMeasurement::Full {
            steps: 1,
            distance_meters: 0,
            calories: 0,
        };
        assert_eq!(full.distance_meters(), Some(0));
        assert_eq!(full.calories(), Some(0));
    }

    #[test]
    fn test_peripheral_display_name() {
        let named = PeripheralHandle::new("AA:BB", Some("BeatXP".into()));
        assert_eq!(named.display_name(), "BeatXP");
        assert_eq!(named.to_string(), "BeatXP (AA:BB)");

        let unnamed = PeripheralHandle::new("AA:BB", None);
        assert_eq!(unnamed.display_name(), "AA:BB");
    }
}
