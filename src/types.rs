use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A configured external channel to ingest from
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Channel {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Channel {
    pub fn new(name: &str) -> Self {
        Self {
            name: normalize_channel_name(name),
            enabled: true,
        }
    }
}

/// Strip the leading `@` some handles are configured with.
pub fn normalize_channel_name(name: &str) -> String {
    name.trim().trim_start_matches('@').to_string()
}

/// Ingestion progress marker: the external id of the newest message durably scraped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(pub i64);

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub channel: String,
    pub cursor: Cursor,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Photo,
    Document,
    Other,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Photo => "photo",
            MediaType::Document => "document",
            MediaType::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "photo" => Some(MediaType::Photo),
            "document" => Some(MediaType::Document),
            "other" => Some(MediaType::Other),
            _ => None,
        }
    }
}

/// Source payload kept verbatim for the transformation layer; never interpreted here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct RawPayload(pub serde_json::Value);

/// One scraped message as stored in the raw store and loaded into `raw.messages`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMessageRecord {
    pub external_id: i64,
    pub channel: String,
    pub text: Option<String>,
    pub posted_at: DateTime<Utc>,
    pub media_path: Option<String>,
    pub media_type: Option<MediaType>,
    pub raw_payload: RawPayload,
    pub scraped_at: DateTime<Utc>,
}

impl RawMessageRecord {
    pub fn key(&self) -> (&str, i64) {
        (self.channel.as_str(), self.external_id)
    }
}

/// Identifies one partition file: all records scraped for a channel on one day.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey {
    pub date: NaiveDate,
    pub channel: String,
    pub format: PartitionFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PartitionFormat {
    /// One versioned JSON record per line
    Ndjson,
    /// Whole-file JSON array written by the earlier scraper generation
    LegacyJsonArray,
}

impl PartitionKey {
    pub fn ndjson(date: NaiveDate, channel: &str) -> Self {
        Self {
            date,
            channel: channel.to_string(),
            format: PartitionFormat::Ndjson,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self.format {
            PartitionFormat::Ndjson => "ndjson",
            PartitionFormat::LegacyJsonArray => "json",
        }
    }

    /// Stable identifier used in the load manifest and reports, e.g. `2025-07-14/clinic_a.ndjson`.
    pub fn id(&self) -> String {
        format!(
            "{}/{}.{}",
            self.date.format("%Y-%m-%d"),
            self.channel,
            self.extension()
        )
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id())
    }
}

/// Raw label/confidence pair as returned by the detection model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    pub confidence: f64,
}

/// One detected object instance tied to a message's media
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub channel: String,
    pub external_id: i64,
    pub label: String,
    pub confidence: f64,
    pub detected_at: DateTime<Utc>,
}

/// A warehouse message row awaiting enrichment
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMedia {
    pub channel: String,
    pub external_id: i64,
    pub media_path: String,
    pub media_type: Option<MediaType>,
}
