//! Fixed-header packet codec.
//!
//! The header is 8 bytes, little-endian:
//!
//! ```text
//! byte 0..4  uid
//! byte 4     total length (header + payload)
//! byte 5     function id
//! byte 6     bits 7-4: sequence number, bit 3: response expected, bits 2-0: reserved
//! byte 7     bits 7-6: error code, bits 5-0: reserved
//! ```

use std::fmt;

use bytes::Bytes;

use crate::error::{ProtocolError, ProtocolResult};
use crate::{HEADER_SIZE, MAX_PACKET_LENGTH, MAX_PAYLOAD_LENGTH, MAX_SEQUENCE_NUMBER};

const RESPONSE_EXPECTED_BIT: u8 = 0b0000_1000;

/// Status reported by the peer in the header of a response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Request succeeded.
    #[default]
    Ok,
    /// A request parameter was out of range.
    InvalidParameter,
    /// The device does not implement the function.
    FunctionNotSupported,
    /// Any other device-side failure.
    Unknown,
}

impl ErrorCode {
    /// Decodes the 2-bit error code field.
    pub fn from_bits(bits: u8) -> ProtocolResult<Self> {
        match bits {
            0 => Ok(Self::Ok),
            1 => Ok(Self::InvalidParameter),
            2 => Ok(Self::FunctionNotSupported),
            3 => Ok(Self::Unknown),
            other => Err(ProtocolError::malformed(format!(
                "undefined error code {other}"
            ))),
        }
    }

    /// Returns the 2-bit wire value.
    pub fn bits(self) -> u8 {
        match self {
            Self::Ok => 0,
            Self::InvalidParameter => 1,
            Self::FunctionNotSupported => 2,
            Self::Unknown => 3,
        }
    }

    /// Returns true for [`ErrorCode::Ok`].
    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::FunctionNotSupported => write!(f, "function not supported"),
            Self::Unknown => write!(f, "unknown error"),
        }
    }
}

/// Decoded packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Device the packet targets or originates from.
    pub uid: u32,
    /// Total packet length in bytes.
    pub length: u8,
    /// Operation or callback identifier.
    pub function_id: u8,
    /// Correlation number, 0 for callbacks and fire-and-forget requests.
    pub sequence_number: u8,
    /// Whether the sender expects a response.
    pub response_expected: bool,
    /// Status reported by the peer.
    pub error_code: ErrorCode,
}

impl Header {
    /// Encodes the header to its 8-byte wire form.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.uid.to_le_bytes());
        buf[4] = self.length;
        buf[5] = self.function_id;
        buf[6] = (self.sequence_number << 4)
            | if self.response_expected {
                RESPONSE_EXPECTED_BIT
            } else {
                0
            };
        buf[7] = self.error_code.bits() << 6;
        buf
    }

    /// Decodes a header from the first 8 bytes of `data`.
    pub fn decode(data: &[u8]) -> ProtocolResult<Self> {
        if data.len() < HEADER_SIZE {
            return Err(ProtocolError::malformed(format!(
                "truncated header: {} bytes",
                data.len()
            )));
        }

        let uid = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        Ok(Self {
            uid,
            length: data[4],
            function_id: data[5],
            sequence_number: data[6] >> 4,
            response_expected: data[6] & RESPONSE_EXPECTED_BIT != 0,
            error_code: ErrorCode::from_bits(data[7] >> 6)?,
        })
    }
}

/// A complete packet: header plus opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Packet header.
    pub header: Header,
    /// Payload bytes, interpreted by a caller-supplied format.
    pub payload: Bytes,
}

impl Packet {
    /// Creates a request packet.
    ///
    /// Fails if the sequence number does not fit the 4-bit field or the
    /// payload exceeds [`MAX_PAYLOAD_LENGTH`].
    pub fn new(
        uid: u32,
        function_id: u8,
        sequence_number: u8,
        response_expected: bool,
        payload: impl Into<Bytes>,
    ) -> ProtocolResult<Self> {
        let payload = payload.into();

        if sequence_number > MAX_SEQUENCE_NUMBER {
            return Err(ProtocolError::InvalidSequenceNumber(sequence_number));
        }

        if payload.len() > MAX_PAYLOAD_LENGTH {
            return Err(ProtocolError::PacketTooLarge {
                size: HEADER_SIZE + payload.len(),
                max: MAX_PACKET_LENGTH,
            });
        }

        Ok(Self {
            header: Header {
                uid,
                length: (HEADER_SIZE + payload.len()) as u8,
                function_id,
                sequence_number,
                response_expected,
                error_code: ErrorCode::Ok,
            },
            payload,
        })
    }

    /// Returns a copy of this packet carrying the given error code.
    pub fn with_error_code(mut self, error_code: ErrorCode) -> Self {
        self.header.error_code = error_code;
        self
    }

    /// Device UID.
    pub fn uid(&self) -> u32 {
        self.header.uid
    }

    /// Function ID.
    pub fn function_id(&self) -> u8 {
        self.header.function_id
    }

    /// Sequence number.
    pub fn sequence_number(&self) -> u8 {
        self.header.sequence_number
    }

    /// Peer-reported status.
    pub fn error_code(&self) -> ErrorCode {
        self.header.error_code
    }

    /// Total packet length in bytes.
    pub fn len(&self) -> usize {
        self.header.length as usize
    }

    /// Returns true if the packet carries no payload.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Returns true for unsolicited packets (sequence number 0).
    pub fn is_callback(&self) -> bool {
        self.header.sequence_number == 0
    }

    /// Encodes the packet to bytes ready for transmission.
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        buffer.extend_from_slice(&self.header.encode());
        buffer.extend_from_slice(&self.payload);
        buffer
    }

    /// Decodes a packet from a buffer holding exactly one packet.
    pub fn decode(data: &[u8]) -> ProtocolResult<Self> {
        Self::decode_bytes(Bytes::copy_from_slice(data))
    }

    /// Decodes a packet without copying the payload.
    pub fn decode_bytes(data: Bytes) -> ProtocolResult<Self> {
        let header = Header::decode(&data)?;
        let declared = header.length as usize;

        if declared < HEADER_SIZE {
            return Err(ProtocolError::malformed(format!(
                "declared length {declared} is shorter than the header"
            )));
        }

        if declared > MAX_PACKET_LENGTH {
            return Err(ProtocolError::PacketTooLarge {
                size: declared,
                max: MAX_PACKET_LENGTH,
            });
        }

        if declared != data.len() {
            return Err(ProtocolError::malformed(format!(
                "declared length {declared} but {} bytes available",
                data.len()
            )));
        }

        Ok(Self {
            header,
            payload: data.slice(HEADER_SIZE..),
        })
    }
}
