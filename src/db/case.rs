// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! On-disk framing of one record:
//!
//! ```text
//! 0xF8 | cord block (arity x i16, BE) | tag | value len (3B, BE) | value body | 0x00 * reserve
//! ```
//!
//! The trailing zero reserve lets a later write at the same coordinates
//! grow slightly without relocating the record.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::value::{self, Value, OUTER_LEN_BYTES};
use crate::Error;

pub const CASE_MARKER: u8 = 0xF8;
/// Zero bytes appended after the value.
pub const RESERVE_LEN: usize = 10;

/// A decoded record frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Case {
    pub cords: Vec<i16>,
    pub value: Value,
    /// Zero bytes that survived after the value body.
    pub reserve: usize,
}

/// Encodes one record with the default reserve.
pub fn encode_case(cords: &[i16], value: &Value) -> Result<Vec<u8>, Error> {
    let mut out = Vec::with_capacity(1 + cords.len() * 2 + RESERVE_LEN);
    out.push(CASE_MARKER);
    for cord in cords {
        out.write_i16::<BigEndian>(*cord)?;
    }
    value::write_framed(&mut out, value, OUTER_LEN_BYTES)?;
    out.resize(out.len() + RESERVE_LEN, 0);
    Ok(out)
}

/// Decodes a record frame of the given arity. A leading marker byte is
/// tolerated but not required, matching what older writers produced.
pub fn decode_case(buf: &[u8], arity: usize) -> Result<Case, Error> {
    let mut rest = buf;
    if rest.first() == Some(&CASE_MARKER) {
        rest = &rest[1..];
    }
    if rest.len() < arity * 2 {
        return Err(Error::Malformed("case shorter than its cord block".into()));
    }
    let mut cords = Vec::with_capacity(arity);
    for _ in 0..arity {
        cords.push(rest.read_i16::<BigEndian>()?);
    }
    let (value, used) = value::read_framed(rest, OUTER_LEN_BYTES)?;
    rest = &rest[used..];
    let reserve = rest.iter().take_while(|byte| **byte == 0).count();
    Ok(Case {
        cords,
        value,
        reserve,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_layout() {
        let encoded = encode_case(&[123, 2, -1], &Value::Str("TEST1".into())).unwrap();
        assert_eq!(encoded[0], CASE_MARKER);
        assert_eq!(&encoded[1..7], b"\x00\x7B\x00\x02\xFF\xFF");
        // tag and the 3-byte value length
        assert_eq!(&encoded[7..11], b"\x01\x00\x00\x05");
        assert_eq!(&encoded[11..16], b"TEST1");
        assert_eq!(&encoded[16..], [0u8; RESERVE_LEN]);
    }

    #[test]
    fn decode_reverses_encode() {
        let encoded = encode_case(&[-32768, 32767], &Value::Bool(true)).unwrap();
        let case = decode_case(&encoded, 2).unwrap();
        assert_eq!(case.cords, vec![-32768, 32767]);
        assert_eq!(case.value, Value::Bool(true));
        assert_eq!(case.reserve, RESERVE_LEN);
    }

    #[test]
    fn reserve_stops_at_first_non_zero() {
        let mut encoded = encode_case(&[1], &Value::Null).unwrap();
        let tail = encoded.len() - 4;
        encoded[tail] = 0xAB;
        let case = decode_case(&encoded, 1).unwrap();
        assert_eq!(case.reserve, RESERVE_LEN - 4);
    }

    #[test]
    fn marker_is_optional_on_decode() {
        let encoded = encode_case(&[5], &Value::Str("x".into())).unwrap();
        let case = decode_case(&encoded[1..], 1).unwrap();
        assert_eq!(case.cords, vec![5]);
    }

    #[test]
    fn arity_overrun_is_malformed() {
        let err = decode_case(&[CASE_MARKER, 0, 1], 4).unwrap_err();
        assert!(matches!(err, Error::Malformed(_)), "{err}");
    }
}
