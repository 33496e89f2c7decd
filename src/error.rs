// MIT License - Copyright (c) 2021 TJForc
// Daikin BR LAN client

use std::fmt;

/// Why a TCP connection to the unit could not be established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectReason {
    Unreachable,
    Timeout,
    Refused,
}

impl ConnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unreachable => "unreachable",
            Self::Timeout => "timeout",
            Self::Refused => "refused",
        }
    }
}

impl fmt::Display for ConnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the unit refused the session handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthReason {
    InvalidKey,
}

impl fmt::Display for AuthReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidKey => f.write_str("invalid_key"),
        }
    }
}

/// Failure of a request on an established session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportReason {
    Timeout,
    Disconnected,
    ProtocolViolation,
}

impl TransportReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Disconnected => "disconnected",
            Self::ProtocolViolation => "protocol_violation",
        }
    }
}

impl fmt::Display for TransportReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Malformed bytes received from the unit.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("Frame truncated ({len} bytes)")]
    Truncated { len: usize },

    #[error("Missing STX/ETX delimiter")]
    MissingDelimiter,

    #[error("Invalid DLE escape sequence")]
    BadEscape,

    #[error("Length mismatch: declared {declared}, actual {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("Checksum mismatch: expected {expected:04X}, got {actual:04X}")]
    ChecksumMismatch { expected: u16, actual: u16 },

    #[error("Unknown frame type 0x{0:02X}")]
    UnknownFrameType(u8),

    #[error("Payload too large ({len} bytes)")]
    Oversized { len: usize },

    #[error("Malformed payload: {0}")]
    Payload(String),

    #[error("Field {field} out of range: {value}")]
    FieldOutOfRange { field: &'static str, value: String },
}

/// A requested change the unit cannot accept.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("Temperature {value} outside {min}..={max}")]
    TemperatureOutOfRange { value: f64, min: f64, max: f64 },

    #[error("Temperature {0} is not a whole degree")]
    TemperatureStep(f64),

    #[error("Temperature cannot be changed in {0} mode")]
    TemperatureNotAdjustable(&'static str),

    #[error("Fan speed cannot be changed in {0} mode")]
    FanNotAdjustable(&'static str),

    #[error("Preset requires the unit to be on")]
    DeviceOff,

    #[error("Preset is not supported")]
    UnsupportedPreset,

    #[error("Conflicting request: {0}")]
    Conflict(&'static str),

    #[error("Nothing to change")]
    EmptyIntent,

    #[error("Payload too large ({0} bytes)")]
    PayloadTooLarge(usize),

    #[error("Unknown hvac mode: {0}")]
    UnknownHvacMode(String),

    #[error("Unknown fan mode: {0}")]
    UnknownFanMode(String),

    #[error("Unknown swing mode: {0}")]
    UnknownSwingMode(String),

    #[error("Unknown preset: {0}")]
    UnknownPreset(String),
}

/// All errors that can occur in the daikin-br library.
#[derive(Debug, thiserror::Error)]
pub enum DaikinError {
    #[error("Cannot connect: {reason}")]
    Connect { reason: ConnectReason },

    #[error("Authentication failed: {reason}")]
    Auth { reason: AuthReason },

    #[error("Transport error ({reason}): {detail}")]
    Transport {
        reason: TransportReason,
        detail: String,
    },

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Invalid request: {0}")]
    Validation(#[from] ValidationError),

    #[error("Unique id mismatch: expected {expected}, device reported {actual}")]
    UniqueIdMismatch { expected: String, actual: String },

    #[error("Device {hostname} not found")]
    NotFound { hostname: String },

    #[error("Discovery failed: {reason}")]
    Discovery { reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Coordinator stopped")]
    Stopped,
}

impl DaikinError {
    pub fn connect(reason: ConnectReason) -> Self {
        Self::Connect { reason }
    }

    pub fn transport(reason: TransportReason, detail: impl Into<String>) -> Self {
        Self::Transport {
            reason,
            detail: detail.into(),
        }
    }

    /// Whether the failure may clear up on its own and polling should continue.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DaikinError::Connect { .. }
                | DaikinError::Transport { .. }
                | DaikinError::Decode(_)
                | DaikinError::NotFound { .. }
                | DaikinError::Discovery { .. }
        )
    }

    /// Whether the session should be torn down and the connection retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DaikinError::Connect { .. } | DaikinError::Transport { .. } | DaikinError::Decode(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, DaikinError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(DaikinError::connect(ConnectReason::Timeout).is_transient());
        assert!(DaikinError::transport(TransportReason::Disconnected, "eof").is_retryable());
        assert!(DaikinError::from(DecodeError::MissingDelimiter).is_retryable());

        let auth = DaikinError::Auth {
            reason: AuthReason::InvalidKey,
        };
        assert!(!auth.is_transient());
        assert!(!auth.is_retryable());
        assert!(!DaikinError::from(ValidationError::EmptyIntent).is_transient());
        assert!(
            !DaikinError::UniqueIdMismatch {
                expected: "a".into(),
                actual: "b".into()
            }
            .is_transient()
        );
    }

    #[test]
    fn test_error_display() {
        let err = DaikinError::transport(TransportReason::Timeout, "no reply to seq 4");
        assert_eq!(err.to_string(), "Transport error (timeout): no reply to seq 4");
        let err = DaikinError::connect(ConnectReason::Refused);
        assert_eq!(err.to_string(), "Cannot connect: refused");
    }
}
