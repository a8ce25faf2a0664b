// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Typed payload values and their binary codec.
//!
//! Every value is serialized as `tag | length | body`, big-endian
//! throughout. Values nested inside container bodies carry a 2-byte
//! length; the outermost value of a stored record carries a 3-byte
//! length. Container bodies hold the concatenated encodings of their
//! elements with no element count; decoding consumes the body until it
//! is exhausted.
//!
//! The tag space is fixed: it is shared with databases written by other
//! implementations, so portable data stays bit-compatible. Tags for
//! runtime-bound objects (live streams, weak references, functions and
//! the like) are reserved but refused with [`Error::Unsupported`].

pub mod json;

use std::path::PathBuf;

use bigdecimal::BigDecimal;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use num_bigint::BigInt;
use num_rational::BigRational;
use uuid::Uuid;

use crate::Error;

/// Length-field width for values nested inside container bodies.
pub const INNER_LEN_BYTES: usize = 2;
/// Length-field width for the outermost value of a record.
pub const OUTER_LEN_BYTES: usize = 3;

const DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";
const TIME_FORMAT: &str = "%H:%M:%S%.f";
const DATE_FORMAT: &str = "%Y-%m-%d";

mod tag {
    pub const STR: u8 = 0x01;
    pub const INT: u8 = 0x02;
    pub const FLOAT: u8 = 0x03;
    pub const BOOL: u8 = 0x04;
    pub const MAP: u8 = 0x05;
    pub const LIST: u8 = 0x06;
    pub const TUPLE: u8 = 0x07;
    pub const SET: u8 = 0x08;
    pub const FROZEN_SET: u8 = 0x09;
    pub const BYTES: u8 = 0x0A;
    pub const BYTE_BUF: u8 = 0x0B;
    pub const COMPLEX: u8 = 0x0C;
    pub const NULL: u8 = 0x0D;
    pub const DEQUE: u8 = 0x0E;
    pub const DEFAULT_MAP: u8 = 0x0F;
    pub const ORDERED_MAP: u8 = 0x10;
    pub const COUNTER: u8 = 0x11;
    pub const MAP_CHAIN: u8 = 0x12;
    pub const BYTE_ARRAY: u8 = 0x13;
    pub const DATE: u8 = 0x14;
    pub const DATETIME: u8 = 0x15;
    pub const TIME: u8 = 0x16;
    pub const DURATION: u8 = 0x17;
    pub const DECIMAL: u8 = 0x18;
    pub const UUID: u8 = 0x19;
    pub const PATH: u8 = 0x1E;
    pub const RATIONAL: u8 = 0x21;
}

/// Returns a description for reserved tags that cannot cross a process
/// boundary, `None` for anything else.
fn non_portable(tag: u8) -> Option<&'static str> {
    let name = match tag {
        0x1A => "regex pattern",
        0x1B => "regex match",
        0x1C => "string stream",
        0x1D => "byte stream",
        0x1F => "enum",
        0x20 => "flag",
        0x22 => "memory view",
        0x23 => "weak reference",
        0x24 => "weak proxy",
        0x25 => "function",
        0x26 => "generator",
        0x27 => "coroutine",
        0x28 => "module",
        _ => return None,
    };
    Some(name)
}

/// A single typed payload.
///
/// Map-like variants preserve entry order as written; set-like variants
/// are plain element sequences (membership semantics belong to the
/// producer, not the codec).
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    /// Arbitrary-precision signed integer.
    Int(BigInt),
    Float(f64),
    Bool(bool),
    Map(Vec<(Value, Value)>),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    Set(Vec<Value>),
    FrozenSet(Vec<Value>),
    Bytes(Vec<u8>),
    ByteBuf(Vec<u8>),
    Complex { re: f64, im: f64 },
    Null,
    Deque(Vec<Value>),
    DefaultMap(Vec<(Value, Value)>),
    OrderedMap(Vec<(Value, Value)>),
    Counter(Vec<(Value, Value)>),
    /// A chain of mappings, consulted front to back.
    MapChain(Vec<Vec<(Value, Value)>>),
    ByteArray(Vec<u8>),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    Time(NaiveTime),
    /// Seconds.
    Duration(f64),
    Decimal(BigDecimal),
    Uuid(Uuid),
    Path(PathBuf),
    Rational(BigRational),
}

impl Value {
    pub fn tag(&self) -> u8 {
        match self {
            Value::Str(_) => tag::STR,
            Value::Int(_) => tag::INT,
            Value::Float(_) => tag::FLOAT,
            Value::Bool(_) => tag::BOOL,
            Value::Map(_) => tag::MAP,
            Value::List(_) => tag::LIST,
            Value::Tuple(_) => tag::TUPLE,
            Value::Set(_) => tag::SET,
            Value::FrozenSet(_) => tag::FROZEN_SET,
            Value::Bytes(_) => tag::BYTES,
            Value::ByteBuf(_) => tag::BYTE_BUF,
            Value::Complex { .. } => tag::COMPLEX,
            Value::Null => tag::NULL,
            Value::Deque(_) => tag::DEQUE,
            Value::DefaultMap(_) => tag::DEFAULT_MAP,
            Value::OrderedMap(_) => tag::ORDERED_MAP,
            Value::Counter(_) => tag::COUNTER,
            Value::MapChain(_) => tag::MAP_CHAIN,
            Value::ByteArray(_) => tag::BYTE_ARRAY,
            Value::Date(_) => tag::DATE,
            Value::DateTime(_) => tag::DATETIME,
            Value::Time(_) => tag::TIME,
            Value::Duration(_) => tag::DURATION,
            Value::Decimal(_) => tag::DECIMAL,
            Value::Uuid(_) => tag::UUID,
            Value::Path(_) => tag::PATH,
            Value::Rational(_) => tag::RATIONAL,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Str(_) => "str",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Bool(_) => "bool",
            Value::Map(_) => "map",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Set(_) => "set",
            Value::FrozenSet(_) => "frozenset",
            Value::Bytes(_) => "bytes",
            Value::ByteBuf(_) => "bytebuf",
            Value::Complex { .. } => "complex",
            Value::Null => "null",
            Value::Deque(_) => "deque",
            Value::DefaultMap(_) => "defaultmap",
            Value::OrderedMap(_) => "orderedmap",
            Value::Counter(_) => "counter",
            Value::MapChain(_) => "mapchain",
            Value::ByteArray(_) => "bytearray",
            Value::Date(_) => "date",
            Value::DateTime(_) => "datetime",
            Value::Time(_) => "time",
            Value::Duration(_) => "duration",
            Value::Decimal(_) => "decimal",
            Value::Uuid(_) => "uuid",
            Value::Path(_) => "path",
            Value::Rational(_) => "rational",
        }
    }

    /// Serializes with the 2-byte length framing used inside containers.
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let mut out = Vec::new();
        write_framed(&mut out, self, INNER_LEN_BYTES)?;
        Ok(out)
    }

    /// Decodes a buffer holding exactly one 2-byte-framed value.
    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        let (value, used) = read_framed(buf, INNER_LEN_BYTES)?;
        if used != buf.len() {
            return Err(Error::Malformed(format!(
                "{} trailing bytes after value",
                buf.len() - used
            )));
        }
        Ok(value)
    }
}

/// Appends `tag | length | body` to `out`.
pub(crate) fn write_framed(
    out: &mut Vec<u8>,
    value: &Value,
    len_bytes: usize,
) -> Result<(), Error> {
    let body = encode_body(value)?;
    let max = (1u64 << (len_bytes * 8)) - 1;
    if body.len() as u64 > max {
        return Err(Error::Malformed(format!(
            "{} body of {} bytes exceeds the {}-byte length field",
            value.type_name(),
            body.len(),
            len_bytes
        )));
    }
    out.push(value.tag());
    out.write_uint::<BigEndian>(body.len() as u64, len_bytes)?;
    out.extend_from_slice(&body);
    Ok(())
}

/// Reads one framed value from the head of `buf`, returning it together
/// with the number of bytes consumed.
pub(crate) fn read_framed(buf: &[u8], len_bytes: usize) -> Result<(Value, usize), Error> {
    let tag = *buf
        .first()
        .ok_or_else(|| Error::Malformed("empty value buffer".into()))?;
    if buf.len() < 1 + len_bytes {
        return Err(Error::Malformed("value header overruns buffer".into()));
    }
    let mut len_field = &buf[1..1 + len_bytes];
    let len = len_field.read_uint::<BigEndian>(len_bytes)? as usize;
    let body = buf
        .get(1 + len_bytes..1 + len_bytes + len)
        .ok_or_else(|| Error::Malformed("value length overruns buffer".into()))?;
    let value = decode_body(tag, body)?;
    Ok((value, 1 + len_bytes + len))
}

fn encode_body(value: &Value) -> Result<Vec<u8>, Error> {
    let mut body = Vec::new();
    match value {
        Value::Str(s) => body.extend_from_slice(s.as_bytes()),
        Value::Int(i) => body = int_bytes(i),
        Value::Float(f) => body.write_f64::<BigEndian>(*f)?,
        Value::Bool(b) => body.push(*b as u8),
        Value::Bytes(b) | Value::ByteBuf(b) | Value::ByteArray(b) => body.extend_from_slice(b),
        Value::Complex { re, im } => {
            body.write_f64::<BigEndian>(*re)?;
            body.write_f64::<BigEndian>(*im)?;
        }
        Value::Null => {}
        Value::List(items)
        | Value::Tuple(items)
        | Value::Set(items)
        | Value::FrozenSet(items)
        | Value::Deque(items) => {
            for item in items {
                write_framed(&mut body, item, INNER_LEN_BYTES)?;
            }
        }
        Value::Map(entries)
        | Value::DefaultMap(entries)
        | Value::OrderedMap(entries)
        | Value::Counter(entries) => write_map_body(&mut body, entries)?,
        Value::MapChain(maps) => {
            // The body is one complete list-of-maps encoding.
            let mut items = Vec::new();
            for entries in maps {
                let mut map_body = Vec::new();
                write_map_body(&mut map_body, entries)?;
                if map_body.len() > u16::MAX as usize {
                    return Err(Error::Malformed(format!(
                        "map body of {} bytes exceeds the 2-byte length field",
                        map_body.len()
                    )));
                }
                items.push(tag::MAP);
                items.write_uint::<BigEndian>(map_body.len() as u64, INNER_LEN_BYTES)?;
                items.extend_from_slice(&map_body);
            }
            if items.len() > u16::MAX as usize {
                return Err(Error::Malformed(format!(
                    "map chain of {} bytes exceeds the 2-byte length field",
                    items.len()
                )));
            }
            body.push(tag::LIST);
            body.write_uint::<BigEndian>(items.len() as u64, INNER_LEN_BYTES)?;
            body.extend_from_slice(&items);
        }
        Value::Date(d) => body.extend_from_slice(d.format(DATE_FORMAT).to_string().as_bytes()),
        Value::DateTime(dt) => {
            body.extend_from_slice(dt.format(DATETIME_FORMAT).to_string().as_bytes())
        }
        Value::Time(t) => body.extend_from_slice(t.format(TIME_FORMAT).to_string().as_bytes()),
        Value::Duration(secs) => body.write_f64::<BigEndian>(*secs)?,
        Value::Decimal(d) => body.extend_from_slice(d.to_string().as_bytes()),
        Value::Uuid(u) => body.extend_from_slice(u.as_bytes()),
        Value::Path(p) => {
            let text = p.to_str().ok_or_else(|| {
                Error::Unsupported("path with non-UTF-8 components".into())
            })?;
            body.extend_from_slice(text.as_bytes());
        }
        Value::Rational(r) => {
            // Two self-delimiting integer encodings back to back.
            write_framed(&mut body, &Value::Int(r.numer().clone()), INNER_LEN_BYTES)?;
            write_framed(&mut body, &Value::Int(r.denom().clone()), INNER_LEN_BYTES)?;
        }
    }
    Ok(body)
}

fn decode_body(tag_byte: u8, body: &[u8]) -> Result<Value, Error> {
    let value = match tag_byte {
        tag::STR => Value::Str(utf8(body)?),
        tag::INT => Value::Int(BigInt::from_signed_bytes_be(body)),
        tag::FLOAT => Value::Float(read_f64(body)?),
        tag::BOOL => match body {
            [0x00] => Value::Bool(false),
            [0x01] => Value::Bool(true),
            _ => return Err(Error::Malformed("boolean body must be one 0x00/0x01 byte".into())),
        },
        tag::BYTES => Value::Bytes(body.to_vec()),
        tag::BYTE_BUF => Value::ByteBuf(body.to_vec()),
        tag::BYTE_ARRAY => Value::ByteArray(body.to_vec()),
        tag::COMPLEX => {
            if body.len() != 16 {
                return Err(Error::Malformed("complex body must be 16 bytes".into()));
            }
            let mut rdr = body;
            Value::Complex {
                re: rdr.read_f64::<BigEndian>()?,
                im: rdr.read_f64::<BigEndian>()?,
            }
        }
        tag::NULL => {
            if !body.is_empty() {
                return Err(Error::Malformed("null body must be empty".into()));
            }
            Value::Null
        }
        tag::LIST => Value::List(read_sequence(body)?),
        tag::TUPLE => Value::Tuple(read_sequence(body)?),
        tag::SET => Value::Set(read_sequence(body)?),
        tag::FROZEN_SET => Value::FrozenSet(read_sequence(body)?),
        tag::DEQUE => Value::Deque(read_sequence(body)?),
        tag::MAP => Value::Map(read_map(body)?),
        tag::DEFAULT_MAP => Value::DefaultMap(read_map(body)?),
        tag::ORDERED_MAP => Value::OrderedMap(read_map(body)?),
        tag::COUNTER => Value::Counter(read_map(body)?),
        tag::MAP_CHAIN => {
            let (list, used) = read_framed(body, INNER_LEN_BYTES)?;
            if used != body.len() {
                return Err(Error::Malformed("trailing bytes after map chain".into()));
            }
            let Value::List(items) = list else {
                return Err(Error::Malformed("map chain body must hold a list".into()));
            };
            let mut maps = Vec::with_capacity(items.len());
            for item in items {
                let Value::Map(entries) = item else {
                    return Err(Error::Malformed("map chain elements must be maps".into()));
                };
                maps.push(entries);
            }
            Value::MapChain(maps)
        }
        tag::DATE => {
            let text = utf8(body)?;
            Value::Date(
                NaiveDate::parse_from_str(&text, DATE_FORMAT)
                    .map_err(|e| Error::Malformed(format!("bad date {text:?}: {e}")))?,
            )
        }
        tag::DATETIME => {
            let text = utf8(body)?;
            Value::DateTime(
                NaiveDateTime::parse_from_str(&text, DATETIME_FORMAT)
                    .map_err(|e| Error::Malformed(format!("bad datetime {text:?}: {e}")))?,
            )
        }
        tag::TIME => {
            let text = utf8(body)?;
            Value::Time(
                NaiveTime::parse_from_str(&text, TIME_FORMAT)
                    .map_err(|e| Error::Malformed(format!("bad time {text:?}: {e}")))?,
            )
        }
        tag::DURATION => Value::Duration(read_f64(body)?),
        tag::DECIMAL => {
            let text = utf8(body)?;
            Value::Decimal(
                text.parse::<BigDecimal>()
                    .map_err(|e| Error::Malformed(format!("bad decimal {text:?}: {e}")))?,
            )
        }
        tag::UUID => Value::Uuid(
            Uuid::from_slice(body)
                .map_err(|_| Error::Malformed("uuid body must be 16 bytes".into()))?,
        ),
        tag::PATH => Value::Path(PathBuf::from(utf8(body)?)),
        tag::RATIONAL => {
            let (numer, used) = read_framed(body, INNER_LEN_BYTES)?;
            let (denom, used2) = read_framed(&body[used..], INNER_LEN_BYTES)?;
            if used + used2 != body.len() {
                return Err(Error::Malformed("trailing bytes after rational".into()));
            }
            let (Value::Int(n), Value::Int(d)) = (numer, denom) else {
                return Err(Error::Malformed("rational parts must be integers".into()));
            };
            if d == BigInt::from(0) {
                return Err(Error::Malformed("rational with zero denominator".into()));
            }
            Value::Rational(BigRational::new(n, d))
        }
        other => {
            if let Some(name) = non_portable(other) {
                return Err(Error::Unsupported(name.into()));
            }
            return Err(Error::Malformed(format!("unknown type tag 0x{other:02X}")));
        }
    };
    Ok(value)
}

/// Minimum-length two's-complement, big-endian; zero is a single 0x00.
fn int_bytes(i: &BigInt) -> Vec<u8> {
    i.to_signed_bytes_be()
}

fn write_map_body(body: &mut Vec<u8>, entries: &[(Value, Value)]) -> Result<(), Error> {
    for (key, value) in entries {
        write_framed(body, key, INNER_LEN_BYTES)?;
        write_framed(body, value, INNER_LEN_BYTES)?;
    }
    Ok(())
}

fn read_sequence(mut body: &[u8]) -> Result<Vec<Value>, Error> {
    let mut items = Vec::new();
    while !body.is_empty() {
        let (item, used) = read_framed(body, INNER_LEN_BYTES)?;
        items.push(item);
        body = &body[used..];
    }
    Ok(items)
}

fn read_map(mut body: &[u8]) -> Result<Vec<(Value, Value)>, Error> {
    let mut entries = Vec::new();
    while !body.is_empty() {
        let (key, used) = read_framed(body, INNER_LEN_BYTES)?;
        body = &body[used..];
        if body.is_empty() {
            return Err(Error::Malformed("map body holds a key with no value".into()));
        }
        let (value, used) = read_framed(body, INNER_LEN_BYTES)?;
        body = &body[used..];
        entries.push((key, value));
    }
    Ok(entries)
}

fn utf8(body: &[u8]) -> Result<String, Error> {
    String::from_utf8(body.to_vec())
        .map_err(|e| Error::Malformed(format!("invalid UTF-8 in value body: {e}")))
}

fn read_f64(body: &[u8]) -> Result<f64, Error> {
    if body.len() != 8 {
        return Err(Error::Malformed("float body must be 8 bytes".into()));
    }
    let mut rdr = body;
    Ok(rdr.read_f64::<BigEndian>()?)
}
