//! Typed payload descriptors.
//!
//! A [`Format`] is an ordered list of [`Field`]s, each a primitive kind with
//! an optional repeat count. Its textual form is compact:
//!
//! ```text
//! "8s 8s c 3B 3B H B"
//! ```
//!
//! | code | kind          | width                     |
//! |------|---------------|---------------------------|
//! | `b`  | `i8`          | 1                         |
//! | `B`  | `u8`          | 1                         |
//! | `h`  | `i16`         | 2                         |
//! | `H`  | `u16`         | 2                         |
//! | `i`  | `i32`         | 4                         |
//! | `I`  | `u32`         | 4                         |
//! | `q`  | `i64`         | 8                         |
//! | `Q`  | `u64`         | 8                         |
//! | `f`  | `f32`         | 4                         |
//! | `!`  | bool          | 1, or ceil(n/8) for `n!`  |
//! | `c`  | char          | 1                         |
//! | `s`  | string        | n for `ns`                |
//!
//! A count in front of any kind except `s` turns the field into an array.
//! Bool arrays are bit-packed, least significant bit first. Strings are
//! zero padded on pack and cut at the first NUL on unpack.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::MAX_PAYLOAD_LENGTH;
use crate::error::{ProtocolError, ProtocolResult};

/// Primitive kind of a format field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    Bool,
    Char,
    Str,
}

impl FieldKind {
    /// Parses a single format code.
    pub fn from_code(code: char) -> Option<Self> {
        Some(match code {
            'b' => Self::I8,
            'B' => Self::U8,
            'h' => Self::I16,
            'H' => Self::U16,
            'i' => Self::I32,
            'I' => Self::U32,
            'q' => Self::I64,
            'Q' => Self::U64,
            'f' => Self::F32,
            '!' => Self::Bool,
            'c' => Self::Char,
            's' => Self::Str,
            _ => return None,
        })
    }

    /// Returns the format code.
    pub fn code(self) -> char {
        match self {
            Self::I8 => 'b',
            Self::U8 => 'B',
            Self::I16 => 'h',
            Self::U16 => 'H',
            Self::I32 => 'i',
            Self::U32 => 'I',
            Self::I64 => 'q',
            Self::U64 => 'Q',
            Self::F32 => 'f',
            Self::Bool => '!',
            Self::Char => 'c',
            Self::Str => 's',
        }
    }

    /// Width of one element in bytes.
    pub fn width(self) -> usize {
        match self {
            Self::I8 | Self::U8 | Self::Bool | Self::Char | Self::Str => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::I64 | Self::U64 => 8,
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// One field of a [`Format`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Field {
    /// Element kind.
    pub kind: FieldKind,
    /// Repeat count; `None` for a scalar.
    pub count: Option<usize>,
}

impl Field {
    /// Creates a scalar field.
    pub fn scalar(kind: FieldKind) -> Self {
        Self { kind, count: None }
    }

    /// Creates an array field (or a string of `count` bytes for `s`).
    pub fn array(kind: FieldKind, count: usize) -> Self {
        Self {
            kind,
            count: Some(count),
        }
    }

    /// Encoded size in bytes, saturating at `usize::MAX`.
    pub fn size(&self) -> usize {
        let count = self.count.unwrap_or(1);
        match self.kind {
            FieldKind::Bool if self.count.is_some() => count.div_ceil(8),
            kind => kind.width().saturating_mul(count),
        }
    }

    /// Parses a value for this field from text.
    ///
    /// Array elements are separated by commas. Strings are taken verbatim.
    pub fn parse_value(&self, text: &str) -> ProtocolResult<Value> {
        match (self.kind, self.count) {
            (FieldKind::Str, _) => Ok(Value::Str(text.to_string())),
            (kind, None) => parse_scalar(kind, text.trim()),
            (kind, Some(_)) => text
                .split(',')
                .map(|item| parse_scalar(kind, item.trim()))
                .collect::<ProtocolResult<Vec<_>>>()
                .map(Value::Array),
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.count {
            Some(count) => write!(f, "{count}{}", self.kind),
            None => write!(f, "{}", self.kind),
        }
    }
}

/// Ordered list of fields describing a payload layout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Format {
    fields: Vec<Field>,
}

impl Format {
    /// Creates a format from fields.
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    /// Format describing an empty payload.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parses the compact textual form, e.g. `"H H 30H"`.
    ///
    /// Formats that would not fit into one packet payload are rejected.
    pub fn parse(spec: &str) -> ProtocolResult<Self> {
        let mut fields = Vec::new();
        let mut digits = String::new();
        let mut size = 0usize;

        for ch in spec.chars() {
            if ch.is_ascii_digit() {
                digits.push(ch);
            } else if ch.is_whitespace() {
                if !digits.is_empty() {
                    return Err(ProtocolError::invalid_format(
                        spec,
                        format!("count {digits} is not followed by a field code"),
                    ));
                }
            } else {
                let kind = FieldKind::from_code(ch).ok_or_else(|| {
                    ProtocolError::invalid_format(spec, format!("unknown field code `{ch}`"))
                })?;

                let count = if digits.is_empty() {
                    None
                } else {
                    let count: usize = digits.parse().map_err(|_| {
                        ProtocolError::invalid_format(spec, format!("invalid count {digits}"))
                    })?;
                    if count == 0 {
                        return Err(ProtocolError::invalid_format(spec, "zero count"));
                    }
                    digits.clear();
                    Some(count)
                };

                let field = Field { kind, count };
                size = size.saturating_add(field.size());
                if size > MAX_PAYLOAD_LENGTH {
                    return Err(ProtocolError::invalid_format(
                        spec,
                        format!("payload exceeds {MAX_PAYLOAD_LENGTH} bytes"),
                    ));
                }
                fields.push(field);
            }
        }

        if !digits.is_empty() {
            return Err(ProtocolError::invalid_format(
                spec,
                "trailing count without field code",
            ));
        }

        Ok(Self { fields })
    }

    /// Fields in payload order.
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Total encoded size in bytes, saturating at `usize::MAX`.
    pub fn size(&self) -> usize {
        self.fields
            .iter()
            .fold(0usize, |total, field| total.saturating_add(field.size()))
    }

    /// Returns true if the format has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Packs one value per field into a payload.
    pub fn pack(&self, values: &[Value]) -> ProtocolResult<Vec<u8>> {
        if values.len() != self.fields.len() {
            return Err(ProtocolError::ValueCount {
                expected: self.fields.len(),
                received: values.len(),
            });
        }

        let mut out = Vec::with_capacity(self.size().min(MAX_PAYLOAD_LENGTH));
        for (field, value) in self.fields.iter().zip(values) {
            pack_field(field, value, &mut out)?;
        }
        Ok(out)
    }

    /// Unpacks a payload into one value per field.
    pub fn unpack(&self, data: &[u8]) -> ProtocolResult<Vec<Value>> {
        let expected = self.size();
        if data.len() != expected {
            return Err(ProtocolError::PayloadLength {
                expected,
                received: data.len(),
            });
        }

        let mut offset = 0;
        let mut values = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            let size = field.size();
            values.push(unpack_field(field, &data[offset..offset + size]));
            offset += size;
        }
        Ok(values)
    }
}

impl FromStr for Format {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, field) in self.fields.iter().enumerate() {
            if index > 0 {
                write!(f, " ")?;
            }
            write!(f, "{field}")?;
        }
        Ok(())
    }
}

/// A typed payload value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    Bool(bool),
    Char(char),
    Str(String),
    Array(Vec<Value>),
}

impl Value {
    /// Returns any integer variant widened to `i128`.
    pub fn as_i128(&self) -> Option<i128> {
        Some(match *self {
            Self::I8(v) => v.into(),
            Self::U8(v) => v.into(),
            Self::I16(v) => v.into(),
            Self::U16(v) => v.into(),
            Self::I32(v) => v.into(),
            Self::U32(v) => v.into(),
            Self::I64(v) => v.into(),
            Self::U64(v) => v.into(),
            _ => return None,
        })
    }

    /// Returns the value as `u64` if it is a non-negative integer.
    pub fn as_u64(&self) -> Option<u64> {
        self.as_i128().and_then(|v| u64::try_from(v).ok())
    }

    /// Returns the value as `i64` if it is an integer in range.
    pub fn as_i64(&self) -> Option<i64> {
        self.as_i128().and_then(|v| i64::try_from(v).ok())
    }

    /// Returns the value as `usize` if it is a non-negative integer.
    pub fn as_usize(&self) -> Option<usize> {
        self.as_i128().and_then(|v| usize::try_from(v).ok())
    }

    /// Returns the float payload.
    pub fn as_f32(&self) -> Option<f32> {
        match *self {
            Self::F32(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the bool payload.
    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Self::Bool(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the string payload.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the array elements.
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Self::Array(v) => Some(v),
            _ => None,
        }
    }

    /// Consumes the value and returns the array elements.
    pub fn into_array(self) -> Option<Vec<Value>> {
        match self {
            Self::Array(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::I8(v) => write!(f, "{v}"),
            Self::U8(v) => write!(f, "{v}"),
            Self::I16(v) => write!(f, "{v}"),
            Self::U16(v) => write!(f, "{v}"),
            Self::I32(v) => write!(f, "{v}"),
            Self::U32(v) => write!(f, "{v}"),
            Self::I64(v) => write!(f, "{v}"),
            Self::U64(v) => write!(f, "{v}"),
            Self::F32(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Char(v) => write!(f, "{v:?}"),
            Self::Str(v) => write!(f, "{v:?}"),
            Self::Array(items) => {
                write!(f, "[")?;
                for (index, item) in items.iter().enumerate() {
                    if index > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<i8> for Value {
    fn from(v: i8) -> Self {
        Self::I8(v)
    }
}

impl From<u8> for Value {
    fn from(v: u8) -> Self {
        Self::U8(v)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Self::I16(v)
    }
}

impl From<u16> for Value {
    fn from(v: u16) -> Self {
        Self::U16(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::I32(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Self::U32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::I64(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Self::U64(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Self::F32(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<char> for Value {
    fn from(v: char) -> Self {
        Self::Char(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Self::Array(v.into_iter().map(Into::into).collect())
    }
}

fn parse_scalar(kind: FieldKind, text: &str) -> ProtocolResult<Value> {
    let mismatch = || ProtocolError::value_mismatch(kind, text);
    Ok(match kind {
        FieldKind::I8 => Value::I8(text.parse().map_err(|_| mismatch())?),
        FieldKind::U8 => Value::U8(text.parse().map_err(|_| mismatch())?),
        FieldKind::I16 => Value::I16(text.parse().map_err(|_| mismatch())?),
        FieldKind::U16 => Value::U16(text.parse().map_err(|_| mismatch())?),
        FieldKind::I32 => Value::I32(text.parse().map_err(|_| mismatch())?),
        FieldKind::U32 => Value::U32(text.parse().map_err(|_| mismatch())?),
        FieldKind::I64 => Value::I64(text.parse().map_err(|_| mismatch())?),
        FieldKind::U64 => Value::U64(text.parse().map_err(|_| mismatch())?),
        FieldKind::F32 => Value::F32(text.parse().map_err(|_| mismatch())?),
        FieldKind::Bool => match text {
            "true" | "1" => Value::Bool(true),
            "false" | "0" => Value::Bool(false),
            _ => return Err(mismatch()),
        },
        FieldKind::Char => {
            let mut chars = text.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => Value::Char(c),
                _ => return Err(mismatch()),
            }
        }
        FieldKind::Str => Value::Str(text.to_string()),
    })
}

fn pack_field(field: &Field, value: &Value, out: &mut Vec<u8>) -> ProtocolResult<()> {
    match (field.kind, field.count) {
        (FieldKind::Str, count) => {
            let text = value
                .as_str()
                .ok_or_else(|| ProtocolError::value_mismatch(field, value))?;
            let width = count.unwrap_or(1);
            let bytes = latin1_bytes(text).ok_or_else(|| ProtocolError::value_mismatch(field, value))?;
            if bytes.len() > width {
                return Err(ProtocolError::value_mismatch(field, value));
            }
            out.extend_from_slice(&bytes);
            out.resize(out.len() + width - bytes.len(), 0);
        }
        (FieldKind::Bool, Some(count)) => {
            let items = array_items(field, value, count)?;
            let mut packed = vec![0u8; count.div_ceil(8)];
            for (index, item) in items.iter().enumerate() {
                let bit = item
                    .as_bool()
                    .ok_or_else(|| ProtocolError::value_mismatch(field, item))?;
                if bit {
                    packed[index / 8] |= 1 << (index % 8);
                }
            }
            out.extend_from_slice(&packed);
        }
        (kind, Some(count)) => {
            for item in array_items(field, value, count)? {
                pack_scalar(kind, item, out)?;
            }
        }
        (kind, None) => pack_scalar(kind, value, out)?,
    }
    Ok(())
}

fn array_items<'a>(field: &Field, value: &'a Value, count: usize) -> ProtocolResult<&'a [Value]> {
    let items = value
        .as_array()
        .ok_or_else(|| ProtocolError::value_mismatch(field, value))?;
    if items.len() != count {
        return Err(ProtocolError::ValueCount {
            expected: count,
            received: items.len(),
        });
    }
    Ok(items)
}

fn pack_scalar(kind: FieldKind, value: &Value, out: &mut Vec<u8>) -> ProtocolResult<()> {
    let mismatch = || ProtocolError::value_mismatch(kind, value);
    let integer = || value.as_i128().ok_or_else(mismatch);

    match kind {
        FieldKind::I8 => out.extend(i8::try_from(integer()?).map_err(|_| mismatch())?.to_le_bytes()),
        FieldKind::U8 => out.extend(u8::try_from(integer()?).map_err(|_| mismatch())?.to_le_bytes()),
        FieldKind::I16 => {
            out.extend(i16::try_from(integer()?).map_err(|_| mismatch())?.to_le_bytes())
        }
        FieldKind::U16 => {
            out.extend(u16::try_from(integer()?).map_err(|_| mismatch())?.to_le_bytes())
        }
        FieldKind::I32 => {
            out.extend(i32::try_from(integer()?).map_err(|_| mismatch())?.to_le_bytes())
        }
        FieldKind::U32 => {
            out.extend(u32::try_from(integer()?).map_err(|_| mismatch())?.to_le_bytes())
        }
        FieldKind::I64 => {
            out.extend(i64::try_from(integer()?).map_err(|_| mismatch())?.to_le_bytes())
        }
        FieldKind::U64 => {
            out.extend(u64::try_from(integer()?).map_err(|_| mismatch())?.to_le_bytes())
        }
        FieldKind::F32 => {
            let v = match value {
                Value::F32(v) => *v,
                other => other.as_i128().ok_or_else(mismatch)? as f32,
            };
            out.extend(v.to_le_bytes());
        }
        FieldKind::Bool => out.push(u8::from(value.as_bool().ok_or_else(mismatch)?)),
        FieldKind::Char => match value {
            Value::Char(c) => out.push(u8::try_from(u32::from(*c)).map_err(|_| mismatch())?),
            _ => return Err(mismatch()),
        },
        FieldKind::Str => return Err(mismatch()),
    }
    Ok(())
}

fn unpack_field(field: &Field, data: &[u8]) -> Value {
    match (field.kind, field.count) {
        (FieldKind::Str, _) => {
            let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
            Value::Str(data[..end].iter().map(|&b| char::from(b)).collect())
        }
        (FieldKind::Bool, Some(count)) => Value::Array(
            (0..count)
                .map(|index| Value::Bool(data[index / 8] & (1 << (index % 8)) != 0))
                .collect(),
        ),
        (kind, Some(_)) => Value::Array(
            data.chunks_exact(kind.width())
                .map(|chunk| unpack_scalar(kind, chunk))
                .collect(),
        ),
        (kind, None) => unpack_scalar(kind, data),
    }
}

fn unpack_scalar(kind: FieldKind, data: &[u8]) -> Value {
    let mut raw = [0u8; 8];
    raw[..data.len()].copy_from_slice(data);

    match kind {
        FieldKind::I8 => Value::I8(i8::from_le_bytes([raw[0]])),
        FieldKind::U8 => Value::U8(raw[0]),
        FieldKind::I16 => Value::I16(i16::from_le_bytes([raw[0], raw[1]])),
        FieldKind::U16 => Value::U16(u16::from_le_bytes([raw[0], raw[1]])),
        FieldKind::I32 => Value::I32(i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])),
        FieldKind::U32 => Value::U32(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])),
        FieldKind::I64 => Value::I64(i64::from_le_bytes(raw)),
        FieldKind::U64 => Value::U64(u64::from_le_bytes(raw)),
        FieldKind::F32 => Value::F32(f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])),
        FieldKind::Bool => Value::Bool(raw[0] != 0),
        FieldKind::Char | FieldKind::Str => Value::Char(char::from(raw[0])),
    }
}

fn latin1_bytes(text: &str) -> Option<Vec<u8>> {
    text.chars().map(|c| u8::try_from(u32::from(c)).ok()).collect()
}
