//! Payloads shared by every device: enumeration and identity.

use serde::Serialize;

use crate::error::{ProtocolError, ProtocolResult};
use crate::format::{Format, Value};

const ENUMERATE_FORMAT: &str = "8s 8s c 3B 3B H B";
const IDENTITY_FORMAT: &str = "8s 8s c 3B 3B H";

/// Why a device announced itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnumerationType {
    /// Answer to an enumeration broadcast.
    Available,
    /// Device was newly attached or restarted.
    Connected,
    /// Device was removed.
    Disconnected,
}

impl EnumerationType {
    /// Decodes the wire value.
    pub fn from_u8(value: u8) -> ProtocolResult<Self> {
        match value {
            0 => Ok(Self::Available),
            1 => Ok(Self::Connected),
            2 => Ok(Self::Disconnected),
            other => Err(ProtocolError::malformed(format!(
                "unknown enumeration type {other}"
            ))),
        }
    }

    /// Returns the wire value.
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Available => 0,
            Self::Connected => 1,
            Self::Disconnected => 2,
        }
    }
}

/// Payload of the enumerate callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnumerateEvent {
    /// Base58 UID of the device.
    pub uid: String,
    /// Base58 UID of the device it is attached to.
    pub connected_uid: String,
    /// Port or slot position on the parent device.
    pub position: char,
    pub hardware_version: [u8; 3],
    pub firmware_version: [u8; 3],
    /// Numeric device type.
    pub device_identifier: u16,
    pub enumeration_type: EnumerationType,
}

impl EnumerateEvent {
    /// Parses an enumerate callback payload.
    pub fn from_payload(payload: &[u8]) -> ProtocolResult<Self> {
        let values = Format::parse(ENUMERATE_FORMAT)?.unpack(payload)?;
        let [uid, connected_uid, position, hardware, firmware, identifier, kind] =
            <[Value; 7]>::try_from(values).map_err(|_| ProtocolError::malformed("enumerate"))?;

        Ok(Self {
            uid: string(uid)?,
            connected_uid: string(connected_uid)?,
            position: character(&position)?,
            hardware_version: version(hardware)?,
            firmware_version: version(firmware)?,
            device_identifier: integer(&identifier)?,
            enumeration_type: EnumerationType::from_u8(integer(&kind)?)?,
        })
    }

    /// Encodes the event as an enumerate callback payload.
    pub fn to_payload(&self) -> ProtocolResult<Vec<u8>> {
        Format::parse(ENUMERATE_FORMAT)?.pack(&[
            Value::from(self.uid.as_str()),
            Value::from(self.connected_uid.as_str()),
            Value::Char(self.position),
            Value::from(self.hardware_version.to_vec()),
            Value::from(self.firmware_version.to_vec()),
            Value::U16(self.device_identifier),
            Value::U8(self.enumeration_type.as_u8()),
        ])
    }
}

/// Response of the identity getter every device implements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub uid: String,
    pub connected_uid: String,
    pub position: char,
    pub hardware_version: [u8; 3],
    pub firmware_version: [u8; 3],
    pub device_identifier: u16,
}

impl Identity {
    /// Response format of the identity getter.
    pub fn format() -> Format {
        // constant input, parsing cannot fail
        Format::parse(IDENTITY_FORMAT).unwrap_or_default()
    }

    /// Parses an identity response payload.
    pub fn from_payload(payload: &[u8]) -> ProtocolResult<Self> {
        let values = Format::parse(IDENTITY_FORMAT)?.unpack(payload)?;
        let [uid, connected_uid, position, hardware, firmware, identifier] =
            <[Value; 6]>::try_from(values).map_err(|_| ProtocolError::malformed("identity"))?;

        Ok(Self {
            uid: string(uid)?,
            connected_uid: string(connected_uid)?,
            position: character(&position)?,
            hardware_version: version(hardware)?,
            firmware_version: version(firmware)?,
            device_identifier: integer(&identifier)?,
        })
    }
}

fn string(value: Value) -> ProtocolResult<String> {
    match value {
        Value::Str(s) => Ok(s),
        other => Err(ProtocolError::value_mismatch("s", other)),
    }
}

fn character(value: &Value) -> ProtocolResult<char> {
    match value {
        Value::Char(c) => Ok(*c),
        other => Err(ProtocolError::value_mismatch("c", other)),
    }
}

fn integer<T: TryFrom<i128>>(value: &Value) -> ProtocolResult<T> {
    value
        .as_i128()
        .and_then(|v| T::try_from(v).ok())
        .ok_or_else(|| ProtocolError::value_mismatch("integer", value))
}

fn version(value: Value) -> ProtocolResult<[u8; 3]> {
    let items = value
        .into_array()
        .ok_or_else(|| ProtocolError::malformed("version is not an array"))?;
    let mut out = [0u8; 3];
    for (slot, item) in out.iter_mut().zip(&items) {
        *slot = integer(item)?;
    }
    Ok(out)
}
