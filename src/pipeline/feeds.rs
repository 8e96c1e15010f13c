use crate::error::AggregatorError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Decides whether a downloaded payload is a usable feed snapshot and, if so,
/// returns the feed-reported Unix timestamp.
///
/// Returning an error or a negative timestamp marks the payload corrupt.
pub trait Validator: Send + Sync {
    fn extract(&self, payload: &[u8]) -> Result<i64>;

    fn name(&self) -> &str;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ValidatorSpec {
    #[default]
    GtfsRealtime,
    JsonPointer { pointer: String },
}

impl ValidatorSpec {
    pub fn build(&self) -> Arc<dyn Validator> {
        match self {
            Self::GtfsRealtime => Arc::new(GtfsRealtimeValidator),
            Self::JsonPointer { pointer } => Arc::new(JsonPointerValidator {
                pointer: pointer.clone(),
            }),
        }
    }
}

#[derive(Clone)]
pub struct FeedDescriptor {
    pub id: String,
    pub url: String,
    pub ext: String,
    pub validator: Arc<dyn Validator>,
}

impl FeedDescriptor {
    pub fn new(
        id: impl Into<String>,
        url: impl Into<String>,
        ext: impl Into<String>,
        validator: Arc<dyn Validator>,
    ) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            ext: ext.into(),
            validator,
        }
    }
}

impl fmt::Debug for FeedDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedDescriptor")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("ext", &self.ext)
            .field("validator", &self.validator.name())
            .finish()
    }
}

pub fn is_valid_feed_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub fn is_valid_extension(ext: &str) -> bool {
    !ext.is_empty() && !ext.contains('/') && !ext.starts_with('.')
}

/// Reads `FeedMessage.header.timestamp` straight off the protobuf wire.
///
/// Only the header is inspected; entity payloads are skipped by length.
pub struct GtfsRealtimeValidator;

const WIRE_VARINT: u64 = 0;
const WIRE_FIXED64: u64 = 1;
const WIRE_LEN: u64 = 2;
const WIRE_FIXED32: u64 = 5;

const FEED_MESSAGE_HEADER: u64 = 1;
const FEED_HEADER_VERSION: u64 = 1;
const FEED_HEADER_TIMESTAMP: u64 = 3;

struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn done(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn varint(&mut self) -> Result<u64> {
        let mut value = 0u64;
        for shift in (0..64).step_by(7) {
            let Some(byte) = self.buf.get(self.pos).copied() else {
                return Err(AggregatorError::InvalidPayload("truncated varint".into()).into());
            };
            self.pos += 1;
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(AggregatorError::InvalidPayload("varint longer than 10 bytes".into()).into())
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| AggregatorError::InvalidPayload("field overruns message".into()))?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    /// Returns `(field_number, wire_type)`.
    fn key(&mut self) -> Result<(u64, u64)> {
        let key = self.varint()?;
        let field = key >> 3;
        if field == 0 {
            return Err(AggregatorError::InvalidPayload("field number 0".into()).into());
        }
        Ok((field, key & 0x7))
    }

    fn skip(&mut self, wire_type: u64) -> Result<()> {
        match wire_type {
            WIRE_VARINT => {
                self.varint()?;
            }
            WIRE_FIXED64 => {
                self.take(8)?;
            }
            WIRE_LEN => {
                let len = self.varint()? as usize;
                self.take(len)?;
            }
            WIRE_FIXED32 => {
                self.take(4)?;
            }
            other => {
                return Err(AggregatorError::InvalidPayload(format!(
                    "unsupported wire type {other}"
                ))
                .into());
            }
        }
        Ok(())
    }
}

fn header_timestamp(header: &[u8]) -> Result<i64> {
    let mut reader = WireReader::new(header);
    let mut version_seen = false;
    let mut timestamp = None;
    while !reader.done() {
        let (field, wire_type) = reader.key()?;
        match (field, wire_type) {
            (FEED_HEADER_VERSION, WIRE_LEN) => {
                let len = reader.varint()? as usize;
                let raw = reader.take(len)?;
                std::str::from_utf8(raw).map_err(|_| {
                    AggregatorError::InvalidPayload("gtfs_realtime_version is not utf-8".into())
                })?;
                version_seen = true;
            }
            (FEED_HEADER_TIMESTAMP, WIRE_VARINT) => {
                timestamp = Some(reader.varint()?);
            }
            (_, other) => reader.skip(other)?,
        }
    }
    if !version_seen {
        return Err(
            AggregatorError::InvalidPayload("header missing gtfs_realtime_version".into()).into(),
        );
    }
    match timestamp {
        None | Some(0) => {
            Err(AggregatorError::InvalidPayload("header timestamp missing or zero".into()).into())
        }
        Some(ts) => i64::try_from(ts)
            .map_err(|_| AggregatorError::InvalidPayload("header timestamp overflow".into()).into()),
    }
}

impl Validator for GtfsRealtimeValidator {
    fn extract(&self, payload: &[u8]) -> Result<i64> {
        let mut reader = WireReader::new(payload);
        let mut header = None;
        while !reader.done() {
            let (field, wire_type) = reader.key()?;
            if field == FEED_MESSAGE_HEADER && wire_type == WIRE_LEN {
                let len = reader.varint()? as usize;
                header = Some(reader.take(len)?);
            } else {
                reader.skip(wire_type)?;
            }
        }
        let header = header
            .ok_or_else(|| AggregatorError::InvalidPayload("feed message has no header".into()))?;
        header_timestamp(header)
    }

    fn name(&self) -> &str {
        "gtfs-realtime"
    }
}

/// Reads the timestamp at a JSON pointer, e.g. `/header/timestamp`.
pub struct JsonPointerValidator {
    pub pointer: String,
}

impl Validator for JsonPointerValidator {
    fn extract(&self, payload: &[u8]) -> Result<i64> {
        let root: Value = serde_json::from_slice(payload).context("payload is not valid json")?;
        let value = root.pointer(&self.pointer).ok_or_else(|| {
            AggregatorError::InvalidPayload(format!("no value at {}", self.pointer))
        })?;
        let ts = match value {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        };
        ts.ok_or_else(|| {
            AggregatorError::InvalidPayload(format!("value at {} is not an integer", self.pointer))
                .into()
        })
    }

    fn name(&self) -> &str {
        "json-pointer"
    }
}
