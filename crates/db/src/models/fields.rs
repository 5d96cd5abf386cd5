//! Encoding helpers shared by the hash-field codecs.

use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, Utc};
use widgetry_core::types::Timestamp;

use crate::error::StoreError;

pub(crate) fn encode_timestamp(ts: &Timestamp) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn decode_timestamp(entity: &'static str, raw: &str) -> Result<Timestamp, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| decode_error(entity, format!("bad timestamp '{raw}': {e}")))
}

pub(crate) fn encode_bool(value: bool) -> String {
    if value { "1" } else { "0" }.to_string()
}

pub(crate) fn decode_bool(entity: &'static str, raw: &str) -> Result<bool, StoreError> {
    match raw {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        other => Err(decode_error(entity, format!("bad boolean '{other}'"))),
    }
}

pub(crate) fn required<'a>(
    entity: &'static str,
    fields: &'a HashMap<String, String>,
    name: &str,
) -> Result<&'a str, StoreError> {
    fields
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| decode_error(entity, format!("missing field '{name}'")))
}

/// Counter fields default to zero when absent.
pub(crate) fn counter(
    entity: &'static str,
    fields: &HashMap<String, String>,
    name: &str,
) -> Result<u64, StoreError> {
    match fields.get(name) {
        None => Ok(0),
        Some(raw) => raw
            .parse::<i64>()
            .map(|n| n.max(0) as u64)
            .map_err(|_| decode_error(entity, format!("bad counter {name}='{raw}'"))),
    }
}

pub(crate) fn decode_error(entity: &'static str, reason: String) -> StoreError {
    StoreError::Decode { entity, reason }
}
