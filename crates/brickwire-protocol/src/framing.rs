//! Reassembly of packets from a byte stream.
//!
//! TCP delivers bytes, not packets. [`PacketBuffer`] accumulates whatever a
//! read returned and hands out complete packets once the length byte of the
//! header says enough data has arrived.

use bytes::{Buf, BytesMut};

use crate::error::{ProtocolError, ProtocolResult};
use crate::packet::Packet;
use crate::{HEADER_SIZE, MAX_PACKET_LENGTH};

/// Offset of the length byte inside the header.
const LENGTH_OFFSET: usize = 4;

/// Accumulates partial reads and yields complete packets.
///
/// # Example
///
/// ```rust
/// use brickwire_protocol::{Packet, PacketBuffer};
///
/// let bytes = Packet::new(5, 1, 2, true, vec![1, 2, 3]).unwrap().encode();
/// let mut buffer = PacketBuffer::new();
///
/// buffer.extend(&bytes[..4]);
/// assert!(buffer.next_packet().unwrap().is_none());
///
/// buffer.extend(&bytes[4..]);
/// let packet = buffer.next_packet().unwrap().unwrap();
/// assert_eq!(packet.uid(), 5);
/// ```
#[derive(Debug, Default)]
pub struct PacketBuffer {
    buffer: BytesMut,
}

impl PacketBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(MAX_PACKET_LENGTH * 4),
        }
    }

    /// Appends freshly read bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Extracts the next complete packet, if one is buffered.
    ///
    /// Returns `Ok(None)` when more bytes are needed. A header declaring an
    /// impossible length leaves no way to find the next packet boundary, so
    /// the buffer is cleared before the error is returned.
    pub fn next_packet(&mut self) -> ProtocolResult<Option<Packet>> {
        if self.buffer.len() < HEADER_SIZE {
            return Ok(None);
        }

        let declared = self.buffer[LENGTH_OFFSET] as usize;
        if !(HEADER_SIZE..=MAX_PACKET_LENGTH).contains(&declared) {
            self.buffer.clear();
            return Err(ProtocolError::malformed(format!(
                "declared length {declared} outside {HEADER_SIZE}..={MAX_PACKET_LENGTH}"
            )));
        }

        if self.buffer.len() < declared {
            return Ok(None);
        }

        let frame = self.buffer.split_to(declared).freeze();
        Packet::decode_bytes(frame).map(Some)
    }

    /// Number of buffered bytes not yet consumed.
    pub fn len(&self) -> usize {
        self.buffer.remaining()
    }

    /// Returns true if no bytes are buffered.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Discards all buffered bytes.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
