//! BeatXP Band Protocol
//!
//! Well-known GATT identifiers for the band and the decoders for its two
//! telemetry payloads.

use crate::domain::error::BandError;
use crate::domain::models::{
    CharacteristicRef, HeartRateFormat, HeartRateMeasurement, RawNotification, StepMeasurement,
};
use tracing::trace;
use uuid::{uuid, Uuid};

/// Vendor service carrying the step counter and the unlock characteristic
pub const STEP_SERVICE_UUID: Uuid = uuid!("0000feea-0000-1000-8000-00805f9b34fb");

/// Step/distance/calorie notification characteristic
pub const STEP_CHAR_UUID: Uuid = uuid!("0000fee1-0000-1000-8000-00805f9b34fb");

/// Unlock characteristic - must be written before telemetry flows
pub const UNLOCK_CHAR_UUID: Uuid = uuid!("0000fee2-0000-1000-8000-00805f9b34fb");

/// Standard Heart Rate service (0x180D)
pub const HEART_RATE_SERVICE_UUID: Uuid = uuid!("0000180d-0000-1000-8000-00805f9b34fb");

/// Standard Heart Rate Measurement characteristic (0x2A37)
pub const HEART_RATE_CHAR_UUID: Uuid = uuid!("00002a37-0000-1000-8000-00805f9b34fb");

/// Client Characteristic Configuration descriptor (0x2902)
pub const CCCD_UUID: Uuid = uuid!("00002902-0000-1000-8000-00805f9b34fb");

/// Step telemetry source
pub const STEP_CHAR: CharacteristicRef = CharacteristicRef {
    service: STEP_SERVICE_UUID,
    characteristic: STEP_CHAR_UUID,
};

/// Unlock command target
pub const UNLOCK_CHAR: CharacteristicRef = CharacteristicRef {
    service: STEP_SERVICE_UUID,
    characteristic: UNLOCK_CHAR_UUID,
};

/// Heart rate telemetry source
pub const HEART_RATE_CHAR: CharacteristicRef = CharacteristicRef {
    service: HEART_RATE_SERVICE_UUID,
    characteristic: HEART_RATE_CHAR_UUID,
};

/// Unlock command, written without response
pub const UNLOCK_COMMAND: &[u8] = &[0x01];

/// CCCD value enabling notifications (little-endian 0x0001)
pub const ENABLE_NOTIFICATION_VALUE: &[u8] = &[0x01, 0x00];

/// Minimum length of the full step payload
pub const STEP_PAYLOAD_LEN: usize = 9;

/// Minimum length of the legacy step payload (steps only)
pub const LEGACY_STEP_PAYLOAD_LEN: usize = 2;

/// Heart Rate Measurement flags, bit 0: value format is UINT16
const HR_FLAG_VALUE_U16: u8 = 0x01;

/// The telemetry sources this client knows how to decode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetrySource {
    Steps,
    HeartRate,
}

impl TelemetrySource {
    /// Resolve a characteristic to a known source
    pub fn from_ref(source: &CharacteristicRef) -> Option<Self> {
        if *source == STEP_CHAR {
            Some(Self::Steps)
        } else if *source == HEART_RATE_CHAR {
            Some(Self::HeartRate)
        } else {
            None
        }
    }

    pub fn characteristic(&self) -> CharacteristicRef {
        match self {
            Self::Steps => STEP_CHAR,
            Self::HeartRate => HEART_RATE_CHAR,
        }
    }
}

/// A decoded notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Telemetry {
    Steps(StepMeasurement),
    HeartRate(HeartRateMeasurement),
}

/// Decode a step characteristic payload
///
/// # Payload Structure
///
/// ```text
/// Full layout (>= 9 bytes):
/// [0-1] : Steps (u16 little-endian)
/// [2]   : Reserved
/// [3-4] : Distance in meters (u16 little-endian)
/// [5]   : Reserved
/// [6]   : Calories (u8, kcal)
/// [7-8] : Reserved
///
/// Legacy layout (2..=8 bytes):
/// [0-1] : Steps (u16 little-endian)
/// ```
pub fn decode_steps(payload: &[u8]) -> Result<StepMeasurement, BandError> {
    if payload.len() >= STEP_PAYLOAD_LEN {
        return Ok(StepMeasurement::Full {
            steps: u16::from_le_bytes([payload[0], payload[1]]),
            distance_meters: u16::from_le_bytes([payload[3], payload[4]]),
            calories: payload[6],
        });
    }

    if payload.len() >= LEGACY_STEP_PAYLOAD_LEN {
        return Ok(StepMeasurement::Partial {
            steps: u16::from_le_bytes([payload[0], payload[1]]),
        });
    }

    Err(BandError::MalformedPayload(format!(
        "step payload is {} bytes, need at least {}",
        payload.len(),
        LEGACY_STEP_PAYLOAD_LEN
    )))
}

/// Decode a standard Heart Rate Measurement payload
///
/// Only the flags byte and the heart rate value are read; energy expended
/// and RR intervals are ignored.
pub fn decode_heart_rate(payload: &[u8]) -> Result<HeartRateMeasurement, BandError> {
    let (flags, rest) = match payload {
        [flags, rest @ ..] if !rest.is_empty() => (*flags, rest),
        _ => {
            return Err(BandError::MalformedPayload(format!(
                "heart rate payload is {} bytes, need at least 2",
                payload.len()
            )))
        }
    };

    if flags & HR_FLAG_VALUE_U16 == 0 {
        return Ok(HeartRateMeasurement {
            bpm: u16::from(rest[0]),
            format: HeartRateFormat::U8,
        });
    }

    match rest {
        [lo, hi, ..] => Ok(HeartRateMeasurement {
            bpm: u16::from_le_bytes([*lo, *hi]),
            format: HeartRateFormat::U16,
        }),
        _ => Err(BandError::MalformedPayload(format!(
            "heart rate payload flags UINT16 but is {} bytes, need at least 3",
            payload.len()
        ))),
    }
}

/// Route a notification to its decoder
pub fn decode(notification: &RawNotification) -> Result<Telemetry, BandError> {
    trace!(
        "Raw packet from {}: {:02X?}",
        notification.source.characteristic,
        notification.payload
    );

    match TelemetrySource::from_ref(&notification.source) {
        Some(TelemetrySource::Steps) => decode_steps(&notification.payload).map(Telemetry::Steps),
        Some(TelemetrySource::HeartRate) => {
            decode_heart_rate(&notification.payload).map(Telemetry::HeartRate)
        }
        None => Err(BandError::UnknownCharacteristic(notification.source)),
    }
}
