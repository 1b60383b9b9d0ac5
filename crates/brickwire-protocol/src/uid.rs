//! Base58 device UIDs.
//!
//! Devices print their UID in base58. On the wire the UID is a `u32`; older
//! 64-bit UIDs are folded into 32 bits before use.

use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Serializer};

use crate::error::{ProtocolError, ProtocolResult};

const ALPHABET: &[u8; 58] = b"123456789abcdefghijkmnopqrstuvwxyzABCDEFGHJKLMNPQRSTUVWXYZ";

/// Encodes a number in base58.
pub fn base58_encode(mut value: u64) -> String {
    let mut digits = Vec::new();
    while value >= 58 {
        digits.push(ALPHABET[(value % 58) as usize]);
        value /= 58;
    }
    digits.push(ALPHABET[value as usize]);
    digits.iter().rev().map(|&b| char::from(b)).collect()
}

/// Decodes a base58 string.
pub fn base58_decode(encoded: &str) -> ProtocolResult<u64> {
    if encoded.is_empty() {
        return Err(ProtocolError::InvalidUid(String::new()));
    }

    encoded.chars().try_fold(0u64, |value, ch| {
        let digit = ALPHABET
            .iter()
            .position(|&b| char::from(b) == ch)
            .ok_or_else(|| ProtocolError::InvalidUid(encoded.to_string()))?;
        value
            .checked_mul(58)
            .and_then(|v| v.checked_add(digit as u64))
            .ok_or_else(|| ProtocolError::InvalidUid(encoded.to_string()))
    })
}

/// A 32-bit device UID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uid(u32);

impl Uid {
    /// Wraps a raw UID.
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Converts a decoded UID to its 32-bit wire form.
    ///
    /// Values above `u32::MAX` are 64-bit UIDs and are folded.
    pub fn from_u64(value: u64) -> Self {
        if value <= u64::from(u32::MAX) {
            return Self(value as u32);
        }

        let v1 = (value & 0xFFFF_FFFF) as u32;
        let v2 = (value >> 32) as u32;
        Self(
            (v1 & 0x0000_0FFF)
                | ((v1 & 0x0F00_0000) >> 12)
                | ((v2 & 0x0000_003F) << 16)
                | ((v2 & 0x000F_0000) << 6)
                | ((v2 & 0x3F00_0000) << 2),
        )
    }
}

impl FromStr for Uid {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uid = Self::from_u64(base58_decode(s.trim())?);
        if uid.0 == 0 {
            return Err(ProtocolError::InvalidUid(s.to_string()));
        }
        Ok(uid)
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&base58_encode(u64::from(self.0)))
    }
}

impl Serialize for Uid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl From<u32> for Uid {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Uid> for u32 {
    fn from(uid: Uid) -> Self {
        uid.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_small_values() {
        assert_eq!(base58_encode(0), "1");
        assert_eq!(base58_encode(1), "2");
        assert_eq!(base58_encode(57), "Z");
        assert_eq!(base58_encode(58), "21");
    }

    #[test]
    fn decode_small_values() {
        assert_eq!(base58_decode("2").unwrap(), 1);
        assert_eq!(base58_decode("21").unwrap(), 58);
        assert_eq!(base58_decode("Z").unwrap(), 57);
    }

    #[test]
    fn decode_rejects_foreign_characters() {
        // 0, O, I and l are not part of the alphabet
        for text in ["0", "O", "I", "l", "ab-c", ""] {
            assert!(base58_decode(text).is_err(), "{text} should be rejected");
        }
    }

    #[test]
    fn decode_rejects_overflow() {
        assert!(base58_decode("zzzzzzzzzzzzzzzz").is_err());
    }

    #[test]
    fn roundtrip_u32_range() {
        for value in [1u32, 42, 0xdead_beef, u32::MAX] {
            let uid = Uid::new(value);
            assert_eq!(uid.to_string().parse::<Uid>().unwrap(), uid);
        }
    }

    #[test]
    fn folds_64_bit_uids() {
        let value = (1u64 << 32) | 0x0000_0FFF;
        assert_eq!(Uid::from_u64(value).get(), 0x0001_0FFF);

        let value = (0x3F00_0000u64 << 32) | 0x0F00_0000;
        assert_eq!(Uid::from_u64(value).get(), 0xFC00_0000 | 0x0000_F000);
    }

    #[test]
    fn zero_is_not_a_device() {
        assert!("1".parse::<Uid>().is_err());
    }

    #[test]
    fn serializes_as_base58() {
        let json = serde_json::to_string(&Uid::new(58)).unwrap();
        assert_eq!(json, r#""21""#);
    }
}
