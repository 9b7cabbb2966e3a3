// (c) 2025 Ross Younger

//! CBOR payload model
//!
//! SMP payloads are CBOR maps with text keys. Devices only ever use a small
//! slice of CBOR (integers, byte and text strings, booleans, arrays and
//! nested maps), so rather than drag a reflection-style serializer into the
//! hot path we model exactly that subset as [`Value`] and hand-roll the
//! [`minicbor`] encode/decode for it.
//!
//! Key order on encode is deterministic (lexicographic, courtesy of
//! `BTreeMap`); the protocol does not require canonical CBOR and devices do
//! not care about key order on receive.

use std::collections::BTreeMap;

use minicbor::data::Type;
use minicbor::decode::Error as DecodeError;
use minicbor::encode::{Error as EncodeError, Write};
use minicbor::{CborLen, Decode, Decoder, Encode, Encoder};

use crate::{Error, Result};

/// A payload: the top-level CBOR map of an SMP message
pub type PayloadMap = BTreeMap<String, Value>;

/// One CBOR item from the subset SMP uses
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Major type 0. Anything a device counts: offsets, lengths, slots.
    Unsigned(u64),
    /// Major type 1; the contained value is always negative
    Negative(i64),
    /// Boolean
    Bool(bool),
    /// Byte string (chunk data, hashes)
    Bytes(Vec<u8>),
    /// Text string
    Text(String),
    /// Array
    Array(Vec<Value>),
    /// Nested map with text keys
    Map(PayloadMap),
}

impl Value {
    /// The item as an unsigned integer, if it is one
    #[must_use]
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Unsigned(u) => Some(*u),
            _ => None,
        }
    }

    /// The item as a signed integer, if it fits
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Unsigned(u) => i64::try_from(*u).ok(),
            Value::Negative(i) => Some(*i),
            _ => None,
        }
    }

    /// The item as a byte slice, if it is a byte string
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// The item as a string slice, if it is text
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// The item as a bool, if it is one
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// The item as an array, if it is one
    #[must_use]
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    /// The item as a map, if it is one
    #[must_use]
    pub fn as_map(&self) -> Option<&PayloadMap> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Unsigned(v)
    }
}
impl From<usize> for Value {
    fn from(v: usize) -> Self {
        Value::Unsigned(v as u64)
    }
}
impl From<i64> for Value {
    #[allow(clippy::cast_sign_loss)]
    fn from(v: i64) -> Self {
        if v < 0 {
            Value::Negative(v)
        } else {
            Value::Unsigned(v as u64)
        }
    }
}
impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}
impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}
impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}
impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(v.to_vec())
    }
}
impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

/////////////////////////////////////////////////////////////////////////////////////////////
// WIRE CODEC

impl<C> Encode<C> for Value {
    fn encode<W: Write>(
        &self,
        e: &mut Encoder<W>,
        ctx: &mut C,
    ) -> std::result::Result<(), EncodeError<W::Error>> {
        match self {
            Value::Unsigned(u) => e.u64(*u)?,
            Value::Negative(i) => e.i64(*i)?,
            Value::Bool(b) => e.bool(*b)?,
            Value::Bytes(b) => e.bytes(b)?,
            Value::Text(s) => e.str(s)?,
            Value::Array(items) => {
                let _ = e.array(items.len() as u64)?;
                for item in items {
                    item.encode(e, ctx)?;
                }
                e
            }
            Value::Map(map) => {
                let _ = e.map(map.len() as u64)?;
                for (key, value) in map {
                    let _ = e.str(key)?;
                    value.encode(e, ctx)?;
                }
                e
            }
        };
        Ok(())
    }
}

impl<'b, C> Decode<'b, C> for Value {
    fn decode(d: &mut Decoder<'b>, ctx: &mut C) -> std::result::Result<Self, DecodeError> {
        let ty = d.datatype()?;
        Ok(match ty {
            Type::U8 | Type::U16 | Type::U32 | Type::U64 => Value::Unsigned(d.u64()?),
            Type::I8 | Type::I16 | Type::I32 | Type::I64 => Value::Negative(d.i64()?),
            Type::Bool => Value::Bool(d.bool()?),
            Type::Bytes => Value::Bytes(d.bytes()?.to_vec()),
            Type::String => Value::Text(d.str()?.to_string()),
            Type::Array => {
                let Some(n) = d.array()? else {
                    return Err(DecodeError::message("indefinite-length array"));
                };
                let mut items = Vec::with_capacity(usize::try_from(n).unwrap_or(0));
                for _ in 0..n {
                    items.push(Value::decode(d, ctx)?);
                }
                Value::Array(items)
            }
            Type::Map => {
                let Some(n) = d.map()? else {
                    return Err(DecodeError::message("indefinite-length map"));
                };
                let mut map = PayloadMap::new();
                for _ in 0..n {
                    let key = d.str()?.to_string();
                    let value = Value::decode(d, ctx)?;
                    let _ = map.insert(key, value);
                }
                Value::Map(map)
            }
            other => {
                return Err(DecodeError::message(format!(
                    "unsupported CBOR item {other:?}"
                )));
            }
        })
    }
}

impl<C> CborLen<C> for Value {
    fn cbor_len(&self, ctx: &mut C) -> usize {
        match self {
            Value::Unsigned(u) => head_len(*u),
            Value::Negative(i) => head_len((-1 - i) as u64),
            Value::Bool(_) => 1,
            Value::Bytes(b) => head_len(b.len() as u64) + b.len(),
            Value::Text(s) => head_len(s.len() as u64) + s.len(),
            Value::Array(items) => {
                head_len(items.len() as u64)
                    + items.iter().map(|i| i.cbor_len(ctx)).sum::<usize>()
            }
            Value::Map(map) => head_len(map.len() as u64) + map_body_len(map, ctx),
        }
    }
}

/// Size of a CBOR item head carrying the argument `n` (the value itself for
/// integers; the length for strings, arrays and maps).
fn head_len(n: u64) -> usize {
    match n {
        0..=0x17 => 1,
        0x18..=0xFF => 2,
        0x100..=0xFFFF => 3,
        0x1_0000..=0xFFFF_FFFF => 5,
        _ => 9,
    }
}

fn map_body_len<C>(map: &PayloadMap, ctx: &mut C) -> usize {
    map.iter()
        .map(|(k, v)| head_len(k.len() as u64) + k.len() + v.cbor_len(ctx))
        .sum()
}

/// Encoded size of a payload map, without encoding it.
///
/// This is what the uploader's chunk budgeting runs on, so it must agree
/// byte-for-byte with [`payload_to_vec`].
#[must_use]
pub fn payload_len(map: &PayloadMap) -> usize {
    head_len(map.len() as u64) + map_body_len(map, &mut ())
}

/// Encodes a payload map to its CBOR byte representation
pub fn payload_to_vec(map: &PayloadMap) -> Result<Vec<u8>> {
    fn bad<E: std::fmt::Display>(err: E) -> Error {
        Error::MalformedFrame(err.to_string())
    }
    let mut e = Encoder::new(Vec::with_capacity(payload_len(map)));
    let _ = e.map(map.len() as u64).map_err(bad)?;
    for (key, value) in map {
        let _ = e.str(key).map_err(bad)?;
        value.encode(&mut e, &mut ()).map_err(bad)?;
    }
    Ok(e.into_writer())
}

/// Decodes a CBOR payload.
///
/// An empty slice is accepted as the empty map, since some responses carry
/// no payload at all. Trailing bytes after the map are an error.
pub fn payload_from_slice(bytes: &[u8]) -> Result<PayloadMap> {
    if bytes.is_empty() {
        return Ok(PayloadMap::new());
    }
    let mut d = Decoder::new(bytes);
    let value =
        Value::decode(&mut d, &mut ()).map_err(|err| Error::MalformedFrame(err.to_string()))?;
    if d.position() != bytes.len() {
        return Err(Error::MalformedFrame(format!(
            "{} trailing bytes after payload",
            bytes.len() - d.position()
        )));
    }
    match value {
        Value::Map(map) => Ok(map),
        other => Err(Error::MalformedFrame(format!(
            "payload is not a map: {other:?}"
        ))),
    }
}

/////////////////////////////////////////////////////////////////////////////////////////////
// TYPED FIELD ACCESS

/// Typed accessors over a [`PayloadMap`].
///
/// Missing-but-required and present-but-mistyped both surface as
/// [`Error::UnexpectedPayload`]; the `opt_` variants only fail on a type
/// mismatch.
pub trait PayloadExt {
    /// The raw value for a key
    fn field(&self, key: &str) -> Result<&Value>;
    /// Required unsigned integer field
    fn u64_field(&self, key: &str) -> Result<u64>;
    /// Optional unsigned integer field
    fn opt_u64_field(&self, key: &str) -> Result<Option<u64>>;
    /// Required byte-string field
    fn bytes_field(&self, key: &str) -> Result<&[u8]>;
    /// Required text field
    fn str_field(&self, key: &str) -> Result<&str>;
    /// Boolean field with a default for absence
    fn bool_field_or(&self, key: &str, default: bool) -> Result<bool>;
    /// Required array field
    fn array_field(&self, key: &str) -> Result<&[Value]>;
    /// The device result code, if present
    fn rc(&self) -> Result<Option<i64>>;
    /// Succeeds iff the payload carries no `rc`, or `rc == 0`
    fn check_rc(&self) -> Result<()>;
}

fn mistyped(key: &str, wanted: &str, got: &Value) -> Error {
    Error::UnexpectedPayload(format!("field '{key}' is not {wanted}: {got:?}"))
}

impl PayloadExt for PayloadMap {
    fn field(&self, key: &str) -> Result<&Value> {
        self.get(key)
            .ok_or_else(|| Error::UnexpectedPayload(format!("missing field '{key}'")))
    }

    fn u64_field(&self, key: &str) -> Result<u64> {
        let v = self.field(key)?;
        v.as_u64().ok_or_else(|| mistyped(key, "an unsigned int", v))
    }

    fn opt_u64_field(&self, key: &str) -> Result<Option<u64>> {
        match self.get(key) {
            None => Ok(None),
            Some(v) => v
                .as_u64()
                .map(Some)
                .ok_or_else(|| mistyped(key, "an unsigned int", v)),
        }
    }

    fn bytes_field(&self, key: &str) -> Result<&[u8]> {
        let v = self.field(key)?;
        v.as_bytes().ok_or_else(|| mistyped(key, "a byte string", v))
    }

    fn str_field(&self, key: &str) -> Result<&str> {
        let v = self.field(key)?;
        v.as_str().ok_or_else(|| mistyped(key, "text", v))
    }

    fn bool_field_or(&self, key: &str, default: bool) -> Result<bool> {
        match self.get(key) {
            None => Ok(default),
            Some(v) => v.as_bool().ok_or_else(|| mistyped(key, "a bool", v)),
        }
    }

    fn array_field(&self, key: &str) -> Result<&[Value]> {
        let v = self.field(key)?;
        v.as_array().ok_or_else(|| mistyped(key, "an array", v))
    }

    fn rc(&self) -> Result<Option<i64>> {
        match self.get("rc") {
            None => Ok(None),
            Some(v) => v
                .as_i64()
                .map(Some)
                .ok_or_else(|| mistyped("rc", "an integer", v)),
        }
    }

    fn check_rc(&self) -> Result<()> {
        match self.rc()? {
            None | Some(0) => Ok(()),
            #[allow(clippy::cast_possible_truncation)]
            Some(rc) => Err(Error::Device(rc as i32)),
        }
    }
}

/// Convenience constructor for payload maps
#[macro_export]
macro_rules! payload {
    () => { $crate::protocol::PayloadMap::new() };
    ($($key:literal => $value:expr),+ $(,)?) => {{
        let mut map = $crate::protocol::PayloadMap::new();
        $( let _ = map.insert($key.to_string(), $crate::protocol::Value::from($value)); )+
        map
    }};
}

/////////////////////////////////////////////////////////////////////////////////////////////
