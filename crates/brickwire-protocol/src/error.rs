//! Protocol error types.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while encoding or decoding packets and payloads.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Packet bytes do not form a valid packet.
    #[error("malformed packet: {reason}")]
    MalformedPacket { reason: String },

    /// Packet exceeds the protocol maximum.
    #[error("packet too large: {size} bytes (max: {max})")]
    PacketTooLarge { size: usize, max: usize },

    /// Sequence number does not fit the header field.
    #[error("invalid sequence number: {0}")]
    InvalidSequenceNumber(u8),

    /// Format descriptor could not be parsed.
    #[error("invalid format `{spec}`: {reason}")]
    InvalidFormat { spec: String, reason: String },

    /// Number of values does not match the number of format fields.
    #[error("expected {expected} values, got {received}")]
    ValueCount { expected: usize, received: usize },

    /// A value does not fit the field it is packed into.
    #[error("value {value} does not fit field `{field}`")]
    ValueMismatch { field: String, value: String },

    /// Payload length differs from the size the format describes.
    #[error("payload length mismatch: expected {expected} bytes, got {received}")]
    PayloadLength { expected: usize, received: usize },

    /// UID string is not valid base58 or does not denote a device.
    #[error("invalid UID `{0}`")]
    InvalidUid(String),
}

impl ProtocolError {
    /// Creates a malformed packet error.
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedPacket {
            reason: reason.into(),
        }
    }

    /// Creates an invalid format error.
    pub fn invalid_format(spec: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidFormat {
            spec: spec.into(),
            reason: reason.into(),
        }
    }

    /// Creates a value mismatch error.
    pub fn value_mismatch(field: impl ToString, value: impl ToString) -> Self {
        Self::ValueMismatch {
            field: field.to_string(),
            value: value.to_string(),
        }
    }
}
