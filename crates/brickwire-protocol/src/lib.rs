//! Packet codec, payload formats and UIDs for the Brick wire protocol.
//!
//! Every exchange between a host and a Brick Daemon (or a Brick directly)
//! is a packet with a fixed 8-byte little-endian header followed by an
//! opaque payload:
//!
//! ```text
//! +---------+------------+-----------------+----------------+-----------+
//! | uid (4) | length (1) | function_id (1) | seq|resp (1)   | flags (1) |
//! +---------+------------+-----------------+----------------+-----------+
//! ```
//!
//! This crate performs no I/O. It encodes and decodes packets, splits a byte
//! stream into packets with [`PacketBuffer`], and translates payloads to
//! typed values with a [`Format`] descriptor.
//!
//! # Example
//!
//! ```rust
//! use brickwire_protocol::{Format, Packet, Value};
//!
//! let format: Format = "I".parse().unwrap();
//! let payload = format.pack(&[Value::U32(7)]).unwrap();
//!
//! let packet = Packet::new(42, 1, 3, true, payload).unwrap();
//! let bytes = packet.encode();
//! let decoded = Packet::decode(&bytes).unwrap();
//!
//! assert_eq!(decoded, packet);
//! assert_eq!(format.unpack(&decoded.payload).unwrap(), vec![Value::U32(7)]);
//! ```

mod error;
mod format;
mod framing;
mod packet;
mod types;
mod uid;

pub use error::{ProtocolError, ProtocolResult};
pub use format::{Field, FieldKind, Format, Value};
pub use framing::PacketBuffer;
pub use packet::{ErrorCode, Header, Packet};
pub use types::{EnumerateEvent, EnumerationType, Identity};
pub use uid::{Uid, base58_decode, base58_encode};

/// Size of the fixed packet header in bytes.
pub const HEADER_SIZE: usize = 8;

/// Maximum total packet length (header + payload).
pub const MAX_PACKET_LENGTH: usize = 80;

/// Maximum payload length.
pub const MAX_PAYLOAD_LENGTH: usize = MAX_PACKET_LENGTH - HEADER_SIZE;

/// Highest sequence number that fits in the 4-bit header field.
pub const MAX_SEQUENCE_NUMBER: u8 = 15;

/// UID used for broadcast requests such as enumeration.
pub const BROADCAST_UID: u32 = 0;

/// UID of the Brick Daemon pseudo-device that handles authentication.
pub const BRICK_DAEMON_UID: u32 = 1;

/// Reserved function IDs shared by every connection.
pub mod function {
    /// Local pseudo-callback fired after a connection is established.
    pub const CALLBACK_CONNECTED: u8 = 0;
    /// Local pseudo-callback fired after a connection is closed.
    pub const CALLBACK_DISCONNECTED: u8 = 1;
    /// Brick Daemon: request a server nonce for authentication.
    pub const GET_AUTHENTICATION_NONCE: u8 = 1;
    /// Brick Daemon: submit the authentication digest.
    pub const AUTHENTICATE: u8 = 2;
    /// Keep-alive packet used to detect dead peers.
    pub const DISCONNECT_PROBE: u8 = 128;
    /// Enumerate callback sent by every device in response to a broadcast.
    pub const CALLBACK_ENUMERATE: u8 = 253;
    /// Broadcast request asking all devices to announce themselves.
    pub const ENUMERATE: u8 = 254;
    /// Identity getter implemented by every device.
    pub const GET_IDENTITY: u8 = 255;
}
