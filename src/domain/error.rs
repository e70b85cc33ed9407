use crate::domain::models::CharacteristicRef;
use std::fmt;
use thiserror::Error;

/// Error categories reported to the host through the event sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    PermissionDenied,
    LinkFailure,
    OperationTimeout,
    Disconnected,
    MalformedPayload,
    /// Non-fatal: a sub-step was skipped
    CharacteristicNotFound,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PermissionDenied => "permission denied",
            Self::LinkFailure => "link failure",
            Self::OperationTimeout => "operation timeout",
            Self::Disconnected => "disconnected",
            Self::MalformedPayload => "malformed payload",
            Self::CharacteristicNotFound => "characteristic not found",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum BandError {
    #[error("Bluetooth permission denied: {0}")]
    PermissionDenied(String),

    #[error("Link failure: {0}")]
    LinkFailure(String),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Not found: {0}")]
    CharacteristicNotFound(String),

    #[error("Scan timeout must be greater than zero")]
    InvalidScanTimeout,

    #[error("Notification from unknown characteristic {0}")]
    UnknownCharacteristic(CharacteristicRef),

    #[error("Bluetooth transport error: {0}")]
    Transport(String),
}

impl BandError {
    /// The reportable category, if this error maps to one
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::PermissionDenied(_) => Some(ErrorKind::PermissionDenied),
            Self::LinkFailure(_) => Some(ErrorKind::LinkFailure),
            Self::MalformedPayload(_) => Some(ErrorKind::MalformedPayload),
            Self::CharacteristicNotFound(_) => Some(ErrorKind::CharacteristicNotFound),
            Self::InvalidScanTimeout | Self::UnknownCharacteristic(_) | Self::Transport(_) => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, BandError>;
