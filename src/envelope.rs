//! On-disk shape of raw store records.
//!
//! Every NDJSON line carries a `record_version` so readers can tell a new-format
//! line from an older one. Version 0 is reserved for the legacy JSON-array files.

use crate::types::RawMessageRecord;
use serde::{Deserialize, Serialize};

pub const RECORD_VERSION: u32 = 1;
pub const LEGACY_RECORD_VERSION: u32 = 0;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StampedRecordV1 {
    pub record_version: u32,
    #[serde(flatten)]
    pub record: RawMessageRecord,
}

impl StampedRecordV1 {
    pub fn new(record: RawMessageRecord) -> Self {
        Self {
            record_version: RECORD_VERSION,
            record,
        }
    }
}

pub fn to_value(record: &RawMessageRecord) -> serde_json::Result<serde_json::Value> {
    serde_json::to_value(StampedRecordV1::new(record.clone()))
}

/// Serialize a batch as newline-terminated lines, ready to append to a partition.
pub fn encode_batch(records: &[RawMessageRecord]) -> serde_json::Result<String> {
    let mut out = String::new();
    for record in records {
        let stamped = StampedRecordV1::new(record.clone());
        out.push_str(&serde_json::to_string(&stamped)?);
        out.push('\n');
    }
    Ok(out)
}

/// Field aliases used by legacy JSON-array partitions, first match wins.
pub const LEGACY_ALIASES: &[(&str, &[&str])] = &[
    ("external_id", &["message_id", "id"]),
    ("channel", &["channel_name", "channel"]),
    ("text", &["message_text", "text"]),
    ("posted_at", &["message_date", "date"]),
    ("media_path", &["media_path"]),
    ("media_type", &["media_type"]),
    ("scraped_at", &["scraped_at"]),
];

/// Prefixes the old scraper wrote in front of media paths, relative to its working directory.
pub const LEGACY_MEDIA_PREFIXES: &[&str] = &["data/raw/media/", "raw/media/"];
