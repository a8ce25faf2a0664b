// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Wire protocol of the cache server: each message is a 4-byte
//! big-endian length followed by that many bytes of UTF-8 JSON.
//! Requests are `{command, args}`; responses carry `status` plus
//! `data` on success or `message` on error.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::value::json::from_json;
use crate::{Error, Value};

/// Upper bound on a single frame.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Deserialize)]
pub struct Request {
    pub command: String,
    #[serde(default)]
    pub args: Map<String, JsonValue>,
}

#[derive(Debug, Serialize)]
pub struct Response {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Response {
    pub fn success(data: Option<JsonValue>) -> Self {
        Self {
            status: "success",
            data,
            message: None,
        }
    }

    pub fn error(message: impl ToString) -> Self {
        Self {
            status: "error",
            data: None,
            message: Some(message.to_string()),
        }
    }
}

/// Reads one frame. `None` means the peer closed the connection before
/// a new frame started.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, Error>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::Protocol(format!("frame of {len} bytes is too large")));
    }
    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame).await?;
    Ok(Some(frame))
}

pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&(frame.len() as u32).to_be_bytes()).await?;
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

pub fn str_arg<'a>(args: &'a Map<String, JsonValue>, name: &str) -> Result<&'a str, Error> {
    args.get(name)
        .and_then(JsonValue::as_str)
        .ok_or_else(|| Error::Protocol(format!("missing argument: {name}")))
}

pub fn opt_str_arg<'a>(args: &'a Map<String, JsonValue>, name: &str) -> Option<&'a str> {
    args.get(name).and_then(JsonValue::as_str)
}

/// Cord tuples arrive as JSON arrays of integers; anything outside the
/// signed 16-bit range cannot address a slot.
pub fn cords_arg(args: &Map<String, JsonValue>) -> Result<Vec<i16>, Error> {
    let raw = args
        .get("cords")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| Error::Protocol("missing argument: cords".into()))?;
    raw.iter()
        .map(|item| {
            item.as_i64()
                .and_then(|n| i16::try_from(n).ok())
                .ok_or_else(|| Error::Malformed(format!("cord {item} is not a 16-bit integer")))
        })
        .collect()
}

pub fn axes_arg(args: &Map<String, JsonValue>) -> Result<Vec<String>, Error> {
    let raw = args
        .get("axes")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| Error::Protocol("missing argument: axes".into()))?;
    raw.iter()
        .map(|item| {
            item.as_str()
                .map(str::to_string)
                .ok_or_else(|| Error::Protocol("axes must be strings".into()))
        })
        .collect()
}

pub fn value_arg(args: &Map<String, JsonValue>) -> Result<Value, Error> {
    let raw = args
        .get("data")
        .ok_or_else(|| Error::Protocol("missing argument: data".into()))?;
    Ok(from_json(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_roundtrip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"{\"command\":\"x\"}").await.unwrap();
        assert_eq!(&buf[..4], &[0, 0, 0, 15]);
        let mut rdr = buf.as_slice();
        let frame = read_frame(&mut rdr).await.unwrap().unwrap();
        assert_eq!(frame, b"{\"command\":\"x\"}");
        assert!(read_frame(&mut rdr).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let mut buf = u32::MAX.to_be_bytes().to_vec();
        buf.extend_from_slice(b"junk");
        let mut rdr = buf.as_slice();
        let err = read_frame(&mut rdr).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)), "{err}");
    }

    #[test]
    fn cords_range_is_enforced() {
        let args: Map<String, JsonValue> =
            serde_json::from_str(r#"{"cords": [1, -32768, 32767]}"#).unwrap();
        assert_eq!(cords_arg(&args).unwrap(), vec![1, -32768, 32767]);
        let args: Map<String, JsonValue> = serde_json::from_str(r#"{"cords": [70000]}"#).unwrap();
        assert!(matches!(cords_arg(&args).unwrap_err(), Error::Malformed(_)));
    }

    #[test]
    fn error_response_shape() {
        let body = serde_json::to_value(Response::error("boom")).unwrap();
        assert_eq!(body, serde_json::json!({"status": "error", "message": "boom"}));
    }
}
