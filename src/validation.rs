//! Record validation and in-batch deduplication shared by the scraper and loader.

use crate::envelope::{LEGACY_ALIASES, LEGACY_MEDIA_PREFIXES, LEGACY_RECORD_VERSION, RECORD_VERSION};
use crate::error::ValidationError;
use crate::types::{MediaType, RawMessageRecord, RawPayload};
use chrono::{DateTime, NaiveDateTime, Utc};
use jsonschema::JSONSchema;
use once_cell::sync::Lazy;
use serde_json::{Map, Value};
use std::collections::HashMap;

static SCHEMA_JSON: Lazy<Option<Value>> =
    Lazy::new(|| serde_json::from_str(include_str!("../schemas/raw_message.v1.json")).ok());

static SCHEMA: Lazy<Option<JSONSchema>> = Lazy::new(|| {
    SCHEMA_JSON
        .as_ref()
        .and_then(|schema| JSONSchema::options().compile(schema).ok())
});

/// Check an encoded record against the bundled JSON schema.
pub fn check_schema(instance: &Value) -> Result<(), ValidationError> {
    let compiled = SCHEMA
        .as_ref()
        .ok_or_else(|| ValidationError::Schema("bundled record schema failed to compile".into()))?;
    if let Err(errors) = compiled.validate(instance) {
        let reasons: Vec<String> = errors
            .map(|e| format!("{} at {}", e, e.instance_path))
            .collect();
        return Err(ValidationError::Schema(reasons.join("; ")));
    }
    Ok(())
}

/// Parse one NDJSON line into a record.
pub fn decode_line(line: &str) -> Result<RawMessageRecord, ValidationError> {
    let value: Value =
        serde_json::from_str(line).map_err(|e| ValidationError::Unparseable(e.to_string()))?;
    let obj = value
        .as_object()
        .ok_or_else(|| ValidationError::MalformedPayload("record is not a JSON object".into()))?;
    let version = match obj.get("record_version") {
        Some(Value::Number(n)) => n.as_u64().map(|v| v as u32).ok_or_else(|| {
            ValidationError::InvalidField {
                field: "record_version",
                reason: n.to_string(),
            }
        })?,
        Some(_) | None => return Err(ValidationError::MissingField("record_version")),
    };
    if version != RECORD_VERSION {
        return Err(ValidationError::UnsupportedVersion(version));
    }
    record_from_object(obj)
}

/// Map one element of a legacy JSON-array partition onto the current record shape.
pub fn decode_legacy(value: &Value) -> Result<RawMessageRecord, ValidationError> {
    let obj = value
        .as_object()
        .ok_or_else(|| ValidationError::MalformedPayload("record is not a JSON object".into()))?;

    let mut mapped = Map::new();
    for (field, aliases) in LEGACY_ALIASES {
        if let Some(v) = aliases
            .iter()
            .filter_map(|alias| obj.get(*alias))
            .find(|v| !v.is_null())
        {
            mapped.insert((*field).to_string(), v.clone());
        }
    }
    let media_path = mapped
        .get("media_path")
        .and_then(Value::as_str)
        .map(legacy_media_path);
    match media_path {
        Some(Some(path)) => {
            mapped.insert("media_path".into(), Value::from(path));
        }
        Some(None) => {
            mapped.remove("media_path");
        }
        None => {}
    }
    if !mapped.contains_key("scraped_at") {
        if let Some(posted) = mapped.get("posted_at").cloned() {
            mapped.insert("scraped_at".into(), posted);
        }
    }
    let payload = match obj.get("raw_data") {
        Some(Value::Object(raw)) => Value::Object(raw.clone()),
        Some(Value::Null) | None => value.clone(),
        Some(_) => {
            return Err(ValidationError::MalformedPayload(
                "raw_data is not an object".into(),
            ))
        }
    };
    mapped.insert("raw_payload".into(), payload);
    mapped.insert("record_version".into(), Value::from(LEGACY_RECORD_VERSION));
    record_from_object(&mapped)
}

/// Media path relative to the media root, or `None` for remote URLs.
fn legacy_media_path(path: &str) -> Option<String> {
    if path.contains("://") {
        return None;
    }
    let path = path.trim().replace('\\', "/");
    let mut path = path.trim_start_matches("./");
    for prefix in LEGACY_MEDIA_PREFIXES {
        if let Some(rest) = path.strip_prefix(prefix) {
            path = rest;
            break;
        }
    }
    if path.is_empty() {
        None
    } else {
        Some(path.to_string())
    }
}

fn record_from_object(obj: &Map<String, Value>) -> Result<RawMessageRecord, ValidationError> {
    let external_id = match obj.get("external_id") {
        None | Some(Value::Null) => return Err(ValidationError::MissingField("external_id")),
        Some(v) => parse_external_id(v)?,
    };

    let channel = match obj.get("channel") {
        Some(Value::String(s)) if !s.trim().is_empty() => crate::types::normalize_channel_name(s),
        None | Some(Value::Null) | Some(Value::String(_)) => {
            return Err(ValidationError::MissingField("channel"))
        }
        Some(other) => {
            return Err(ValidationError::InvalidField {
                field: "channel",
                reason: format!("expected string, got {other}"),
            })
        }
    };

    let posted_at = required_timestamp(obj, "posted_at")?;
    let scraped_at = required_timestamp(obj, "scraped_at")?;
    let text = optional_string(obj, "text")?;
    let media_path = optional_string(obj, "media_path")?;

    let media_type = match optional_string(obj, "media_type")? {
        None => None,
        Some(s) => Some(MediaType::parse(&s).ok_or(ValidationError::InvalidField {
            field: "media_type",
            reason: s.clone(),
        })?),
    };

    let raw_payload = match obj.get("raw_payload") {
        Some(Value::Object(map)) => RawPayload(Value::Object(map.clone())),
        None | Some(Value::Null) => return Err(ValidationError::MissingField("raw_payload")),
        Some(other) => {
            return Err(ValidationError::MalformedPayload(format!(
                "raw_payload must be an object, got {other}"
            )))
        }
    };

    Ok(RawMessageRecord {
        external_id,
        channel,
        text,
        posted_at,
        media_path,
        media_type,
        raw_payload,
        scraped_at,
    })
}

fn parse_external_id(v: &Value) -> Result<i64, ValidationError> {
    let id = match v {
        Value::Number(n) => n.as_i64(),
        // Legacy exports occasionally quote ids
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    match id {
        Some(id) if id > 0 => Ok(id),
        _ => Err(ValidationError::InvalidField {
            field: "external_id",
            reason: v.to_string(),
        }),
    }
}

fn optional_string(
    obj: &Map<String, Value>,
    field: &'static str,
) -> Result<Option<String>, ValidationError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(ValidationError::InvalidField {
            field,
            reason: format!("expected string, got {other}"),
        }),
    }
}

fn required_timestamp(
    obj: &Map<String, Value>,
    field: &'static str,
) -> Result<DateTime<Utc>, ValidationError> {
    match obj.get(field) {
        None | Some(Value::Null) => Err(ValidationError::MissingField(field)),
        Some(Value::String(s)) => parse_timestamp(s),
        Some(other) => Err(ValidationError::BadTimestamp(other.to_string())),
    }
}

/// Accepts RFC 3339 timestamps and naive ISO timestamps (taken as UTC).
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, ValidationError> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(naive.and_utc());
        }
    }
    Err(ValidationError::BadTimestamp(s.to_string()))
}

/// Collapse records sharing a (channel, external id) key, keeping the last
/// occurrence. Returns the unique records and how many were dropped.
pub fn dedup_latest(records: Vec<RawMessageRecord>) -> (Vec<RawMessageRecord>, usize) {
    let mut index: HashMap<(String, i64), usize> = HashMap::new();
    let mut unique: Vec<RawMessageRecord> = Vec::with_capacity(records.len());
    let mut dropped = 0;
    for record in records {
        let key = (record.channel.clone(), record.external_id);
        match index.get(&key) {
            Some(&pos) => {
                unique[pos] = record;
                dropped += 1;
            }
            None => {
                index.insert(key, unique.len());
                unique.push(record);
            }
        }
    }
    (unique, dropped)
}
