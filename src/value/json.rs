// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Conversions between [`Value`] and the JSON carried by the server
//! protocol.
//!
//! The mapping is deliberately asymmetric. Outbound, every portable
//! variant has a JSON rendering (binary as standard base64, oversized
//! integers as decimal strings, map keys stringified). Inbound, clients
//! can only express the plain JSON subset — null, booleans, numbers,
//! strings, arrays and objects — which is everything the wire format
//! itself can say.

use base64::{prelude::BASE64_STANDARD, Engine};
use num_bigint::BigInt;
use num_traits::ToPrimitive;
use serde_json::{json, Map, Number, Value as JsonValue};

use super::Value;

/// Renders a value for a response payload.
pub fn to_json(value: &Value) -> JsonValue {
    match value {
        Value::Str(s) => JsonValue::String(s.clone()),
        Value::Int(i) => match i.to_i64() {
            Some(n) => JsonValue::from(n),
            None => JsonValue::String(i.to_string()),
        },
        Value::Float(f) | Value::Duration(f) => match Number::from_f64(*f) {
            Some(n) => JsonValue::Number(n),
            // JSON has no NaN/infinity
            None => JsonValue::Null,
        },
        Value::Bool(b) => JsonValue::Bool(*b),
        Value::Bytes(b) | Value::ByteBuf(b) | Value::ByteArray(b) => {
            JsonValue::String(BASE64_STANDARD.encode(b))
        }
        Value::Complex { re, im } => json!({ "re": re, "im": im }),
        Value::Null => JsonValue::Null,
        Value::List(items)
        | Value::Tuple(items)
        | Value::Set(items)
        | Value::FrozenSet(items)
        | Value::Deque(items) => JsonValue::Array(items.iter().map(to_json).collect()),
        Value::Map(entries)
        | Value::DefaultMap(entries)
        | Value::OrderedMap(entries)
        | Value::Counter(entries) => entries_to_json(entries),
        Value::MapChain(maps) => JsonValue::Array(maps.iter().map(|m| entries_to_json(m)).collect()),
        Value::Date(d) => JsonValue::String(d.format(super::DATE_FORMAT).to_string()),
        Value::DateTime(dt) => JsonValue::String(dt.format(super::DATETIME_FORMAT).to_string()),
        Value::Time(t) => JsonValue::String(t.format(super::TIME_FORMAT).to_string()),
        Value::Decimal(d) => JsonValue::String(d.to_string()),
        Value::Uuid(u) => JsonValue::String(u.to_string()),
        Value::Path(p) => JsonValue::String(p.to_string_lossy().into_owned()),
        Value::Rational(r) => JsonValue::Array(vec![
            to_json(&Value::Int(r.numer().clone())),
            to_json(&Value::Int(r.denom().clone())),
        ]),
    }
}

fn entries_to_json(entries: &[(Value, Value)]) -> JsonValue {
    let mut out = Map::with_capacity(entries.len());
    for (key, value) in entries {
        out.insert(key_string(key), to_json(value));
    }
    JsonValue::Object(out)
}

fn key_string(key: &Value) -> String {
    match key {
        Value::Str(s) => s.clone(),
        other => to_json(other).to_string(),
    }
}

/// Interprets an inbound JSON payload as a value to store.
pub fn from_json(json: &JsonValue) -> Value {
    match json {
        JsonValue::Null => Value::Null,
        JsonValue::Bool(b) => Value::Bool(*b),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(BigInt::from(i))
            } else if let Some(u) = n.as_u64() {
                Value::Int(BigInt::from(u))
            } else {
                Value::Float(n.as_f64().unwrap_or_default())
            }
        }
        JsonValue::String(s) => Value::Str(s.clone()),
        JsonValue::Array(items) => Value::List(items.iter().map(from_json).collect()),
        JsonValue::Object(entries) => Value::Map(
            entries
                .iter()
                .map(|(k, v)| (Value::Str(k.clone()), from_json(v)))
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalars_cross_the_wire() {
        assert_eq!(to_json(&Value::Str("hi".into())), json!("hi"));
        assert_eq!(to_json(&Value::Int(BigInt::from(-3))), json!(-3));
        assert_eq!(to_json(&Value::Bool(true)), json!(true));
        assert_eq!(to_json(&Value::Null), JsonValue::Null);
    }

    #[test]
    fn wide_int_becomes_a_string() {
        let wide = BigInt::from(u64::MAX) * BigInt::from(4);
        assert_eq!(
            to_json(&Value::Int(wide.clone())),
            JsonValue::String(wide.to_string())
        );
    }

    #[test]
    fn bytes_render_as_base64() {
        assert_eq!(to_json(&Value::Bytes(vec![0, 1, 2])), json!("AAEC"));
    }

    #[test]
    fn json_subset_maps_back() {
        let v = from_json(&json!({"k": [1, 2.5, null, "s"]}));
        assert_eq!(
            v,
            Value::Map(vec![(
                Value::Str("k".into()),
                Value::List(vec![
                    Value::Int(BigInt::from(1)),
                    Value::Float(2.5),
                    Value::Null,
                    Value::Str("s".into()),
                ]),
            )])
        );
    }
}
