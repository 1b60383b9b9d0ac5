//! Client error types.

use std::io;
use std::time::Duration;

use brickwire_protocol::{ErrorCode, ProtocolError, Uid};
use thiserror::Error;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors returned by connection and device operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// TCP connect failed.
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },

    /// Operation needs an established connection.
    #[error("not connected")]
    NotConnected,

    /// `connect` was called while a connection is active or in progress.
    #[error("already connected")]
    AlreadyConnected,

    /// No response arrived before the deadline.
    #[error("request {function_id} to {uid} timed out")]
    Timeout { uid: Uid, function_id: u8 },

    /// The connection was torn down while the request was outstanding.
    #[error("connection lost")]
    ConnectionLost,

    /// Chunk offsets of a streamed value were not contiguous.
    #[error("stream `{stream}` is out of sync")]
    StreamOutOfSync { stream: String },

    /// The daemon rejected the secret, or the handshake failed.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The device answered with a nonzero error code.
    #[error("device {uid} rejected function {function_id}: {code}")]
    Device {
        uid: Uid,
        function_id: u8,
        code: ErrorCode,
    },

    /// A successful response had an unexpected payload size.
    #[error(
        "function {function_id} returned {received} bytes, expected {expected}"
    )]
    WrongResponseLength {
        function_id: u8,
        expected: usize,
        received: usize,
    },

    /// Automatic reconnect gave up after repeated disconnects.
    #[error("reconnect abandoned after {disconnects} disconnects within {window:?}")]
    ReconnectAbandoned { disconnects: usize, window: Duration },

    /// A value passed by the caller is out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Packet or payload encoding failed.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Socket error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Configuration could not be loaded or resolved.
    #[error("configuration error: {0}")]
    Config(String),
}

impl ClientError {
    /// Creates a timeout error.
    pub fn timeout(uid: u32, function_id: u8) -> Self {
        Self::Timeout {
            uid: Uid::new(uid),
            function_id,
        }
    }

    /// Creates a device error.
    pub fn device(uid: u32, function_id: u8, code: ErrorCode) -> Self {
        Self::Device {
            uid: Uid::new(uid),
            function_id,
            code,
        }
    }

    /// Creates a stream out of sync error.
    pub fn stream_out_of_sync(stream: impl Into<String>) -> Self {
        Self::StreamOutOfSync {
            stream: stream.into(),
        }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Returns true for errors caused by the link rather than the request.
    ///
    /// Only these are worth a reconnect.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. } | Self::ConnectionLost | Self::Io(_) | Self::NotConnected
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_device() {
        let err = ClientError::device(58, 7, ErrorCode::InvalidParameter);
        assert_eq!(
            err.to_string(),
            "device 21 rejected function 7: invalid parameter"
        );

        let err = ClientError::timeout(1, 255);
        assert_eq!(err.to_string(), "request 255 to 2 timed out");
    }

    #[test]
    fn device_and_auth_errors_are_not_transport_errors() {
        assert!(ClientError::ConnectionLost.is_transport());
        assert!(!ClientError::device(1, 1, ErrorCode::Unknown).is_transport());
        assert!(!ClientError::AuthenticationFailed("nope".into()).is_transport());
        assert!(!ClientError::stream_out_of_sync("spectrum").is_transport());
    }
}
