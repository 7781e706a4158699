//! Values flowing through the encryption layers, and their encodings.

use std::fmt;

use crate::error::{Error, Result};
use crate::onions::FieldType;

/// A plaintext or ciphertext value.
///
/// Integer layers work on `u64`s: plaintext integers enter them through
/// [`encode_signed`], ciphertexts travel as `UInt`. Byte-oriented layers
/// accept both `Text` and `Blob`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Value {
    Null,
    Int(i64),
    UInt(u64),
    Text(String),
    Blob(Vec<u8>),
}

/// Encodes a signed integer into a `u64` by inverting the MSB, so that the
/// order of the encodings matches the order of the integers.
pub fn encode_signed<T>(u: T) -> u64
where
    T: Into<i64>,
{
    (<T as Into<i64>>::into(u) as u64) ^ (1 << 63)
}

/// Inverse of [`encode_signed`].
pub fn decode_signed(u: u64) -> i64 {
    (u ^ (1 << 63)) as i64
}

/// Packs the first four bytes of `bytes` into a big-endian `u32`, padding
/// with zeros. Comparing packed prefixes agrees with comparing the strings
/// whenever the prefixes differ.
pub fn pack_prefix(bytes: &[u8]) -> u32 {
    let get_or_zero = |j: usize| bytes.get(j).copied().unwrap_or(0) as u32;
    (get_or_zero(0) << 24) + (get_or_zero(1) << 16) + (get_or_zero(2) << 8) + get_or_zero(3)
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Integer view of the value, as consumed by the integer layers.
    pub fn to_u64(&self) -> Result<u64> {
        match self {
            Value::Int(i) => Ok(encode_signed(*i)),
            Value::UInt(u) => Ok(*u),
            other => Err(Error::Crypto(format!("expected an integer, got {other}"))),
        }
    }

    /// Byte view of the value, as consumed by the byte layers.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        match self {
            Value::Text(s) => Ok(s.as_bytes().to_vec()),
            Value::Blob(b) => Ok(b.clone()),
            other => Err(Error::Crypto(format!("expected bytes, got {other}"))),
        }
    }

    /// The plaintext type a literal belongs to, if any.
    pub fn field_type(&self) -> Option<FieldType> {
        match self {
            Value::Int(_) | Value::UInt(_) => Some(FieldType::Int),
            Value::Text(_) | Value::Blob(_) => Some(FieldType::Str),
            Value::Null => None,
        }
    }

    /// Renders the value as a SQL literal.
    pub fn to_sql(&self) -> String {
        match self {
            Value::Null => "NULL".into(),
            Value::Int(i) => i.to_string(),
            Value::UInt(u) => u.to_string(),
            Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
            Value::Blob(b) => format!("X'{}'", hex::encode_upper(b)),
        }
    }

    /// Parses a plaintext cell, e.g. from a CSV file.
    pub fn parse(text: &str, field_type: FieldType) -> Result<Value> {
        match field_type {
            FieldType::Int => text
                .trim()
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| Error::text(format!("`{text}` is not an integer"))),
            FieldType::Str => Ok(Value::Text(text.to_string())),
        }
    }

    /// Turns the output of the innermost layer of an onion back into a
    /// plaintext value of type `field_type`.
    pub fn into_plain(self, field_type: FieldType) -> Result<Value> {
        match (field_type, self) {
            (_, Value::Null) => Ok(Value::Null),
            (FieldType::Int, Value::UInt(u)) => Ok(Value::Int(decode_signed(u))),
            (FieldType::Int, Value::Int(i)) => Ok(Value::Int(i)),
            (FieldType::Str, Value::Blob(b)) => String::from_utf8(b)
                .map(Value::Text)
                .map_err(|e| Error::Crypto(format!("decrypted text is not UTF-8: {e}"))),
            (FieldType::Str, Value::Text(s)) => Ok(Value::Text(s)),
            (t, v) => Err(Error::Crypto(format!("cannot read {v} as {t}"))),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Text(s) => f.write_str(s),
            other => f.write_str(&other.to_sql()),
        }
    }
}
