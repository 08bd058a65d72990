//! Error types and result definitions for the tuya-dp crate.
//! One enum per component, folded into [`TuyaDpError`] for callers that do not
//! care which layer failed.

use crate::protocol::DpType;
use thiserror::Error;

/// A frame whose type tag is outside the known range.
///
/// The payload is kept so the caller can still forward or record it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownFrame {
    pub dp_id: u8,
    pub type_tag: u8,
    pub payload: Vec<u8>,
}

/// Errors raised while decoding or constructing a datapoint frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Fewer bytes were available than the header (or the declared length) requires
    #[error("Truncated frame (dp {dp_id:?}): need {needed} bytes, have {available}")]
    Truncated {
        dp_id: Option<u8>,
        needed: usize,
        available: usize,
    },

    /// The type tag is not one of the six known datapoint types
    #[error("Unknown datapoint type 0x{:02X} for dp {}", .0.type_tag, .0.dp_id)]
    UnknownType(UnknownFrame),

    /// A fixed-width type carried a payload of the wrong width
    #[error("Invalid payload width {len} for {dp_type:?} (dp {dp_id})")]
    LengthMismatch { dp_id: u8, dp_type: DpType, len: usize },

    /// Payload cannot be described by the 16-bit length field
    #[error("Payload too long: {len} bytes")]
    PayloadTooLong { len: usize },
}

impl DecodeError {
    /// The dp id the failing frame belonged to, when the header got that far.
    pub fn dp_id(&self) -> Option<u8> {
        match self {
            DecodeError::Truncated { dp_id, .. } => *dp_id,
            DecodeError::UnknownType(frame) => Some(frame.dp_id),
            DecodeError::LengthMismatch { dp_id, .. } => Some(*dp_id),
            DecodeError::PayloadTooLong { .. } => None,
        }
    }
}

/// Errors raised by the type converters.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConvertError {
    #[error("Invalid payload width {len} for {dp_type:?}")]
    Width { dp_type: DpType, len: usize },

    #[error("Payload is not valid UTF-8")]
    InvalidUtf8,

    #[error("Converter '{converter}' cannot be applied to {dp_type:?}")]
    Incompatible {
        converter: &'static str,
        dp_type: DpType,
    },

    #[error("Value {value} does not fit the wire range of {dp_type:?}")]
    OutOfRange { dp_type: DpType, value: String },

    #[error("Invalid scale {multiplier}/{divisor}")]
    InvalidScale { multiplier: i32, divisor: i32 },

    #[error("Frame type {found:?} does not match declared {expected:?}")]
    TypeMismatch { expected: DpType, found: DpType },

    #[error("Unknown enum label '{0}'")]
    UnknownLabel(String),

    #[error("Value {value} has no entry in the lookup table")]
    NoLookupEntry { value: i64 },

    #[error("Expected a {expected} value, got {found}")]
    WrongKind {
        expected: &'static str,
        found: &'static str,
    },
}

/// Errors raised while loading or consulting a device schema.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchemaError {
    /// Non-fatal: the device reported a dp the schema does not know
    #[error("Unmapped dp {dp_id} (type {type_tag:#04x})")]
    UnmappedDp { dp_id: u8, type_tag: u8 },

    #[error("Duplicate dp {0} in schema")]
    DuplicateDp(u8),

    #[error("Duplicate field '{0}' in schema")]
    DuplicateField(String),

    #[error("Unknown converter '{0}'")]
    UnknownConverter(String),

    #[error("Field '{field}': {source}")]
    Converter {
        field: String,
        #[source]
        source: ConvertError,
    },

    #[error("Field '{0}': array multiplicity needs a fixed-width element type")]
    InvalidArray(String),

    #[error("Schema JSON error: {0}")]
    Json(String),

    #[error("No schema registered for model '{0}'")]
    UnknownModel(String),
}

impl From<serde_json::Error> for SchemaError {
    fn from(err: serde_json::Error) -> Self {
        SchemaError::Json(err.to_string())
    }
}

/// Errors surfaced to callers issuing commands.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommandError {
    /// No acknowledgment after every transmission in the budget
    #[error("Command for dp {dp_id} timed out after {attempts} attempt(s)")]
    Timeout { dp_id: u8, attempts: u32 },

    /// Informational: the device never acknowledges, delivery is not guaranteed
    #[error("Device does not acknowledge commands; delivery is unconfirmed")]
    NoAckSupport,

    #[error("All transaction ids are in flight")]
    Saturated,

    #[error("Device was torn down before the command resolved")]
    Cancelled,

    #[error("Unknown field '{0}'")]
    UnknownField(String),

    #[error("Unknown dp {0}")]
    UnknownDp(u8),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Convert(#[from] ConvertError),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// Errors reported by a capability state store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Capability '{0}' is not available on this device")]
    UnknownCapability(String),

    #[error("Store rejected '{field}': {reason}")]
    Rejected { field: String, reason: String },
}

/// Crate-wide error covering every component.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TuyaDpError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Convert(#[from] ConvertError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Device already managed: {0}")]
    DuplicateDevice(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),
}

/// A specialized Result type for adapter operations.
pub type Result<T> = std::result::Result<T, TuyaDpError>;

// Device health codes surfaced to the hosting application
define_health_codes! {
    HEALTH_OK = 0 => "Device Healthy",
    HEALTH_COMMAND_FAILED = 950 => "Command Retries Exhausted",
    HEALTH_FRAME_CORRUPTION = 951 => "Repeated Truncated Frames",
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_error_exposes_dp_id() {
        let truncated = DecodeError::Truncated {
            dp_id: Some(7),
            needed: 8,
            available: 5,
        };
        assert_eq!(truncated.dp_id(), Some(7));

        let header_only = DecodeError::Truncated {
            dp_id: None,
            needed: 4,
            available: 1,
        };
        assert_eq!(header_only.dp_id(), None);
    }

    #[test]
    fn errors_fold_into_crate_error() {
        let err: TuyaDpError = CommandError::Timeout {
            dp_id: 4,
            attempts: 2,
        }
        .into();
        assert_eq!(
            err.to_string(),
            "Command for dp 4 timed out after 2 attempt(s)"
        );

        let err: TuyaDpError = SchemaError::UnmappedDp {
            dp_id: 99,
            type_tag: 2,
        }
        .into();
        assert!(matches!(err, TuyaDpError::Schema(_)));
    }

    #[test]
    fn health_messages() {
        assert_eq!(
            get_health_message(HEALTH_COMMAND_FAILED),
            "Command Retries Exhausted"
        );
        assert_eq!(get_health_message(12345), "Unknown Health Code");
    }
}
