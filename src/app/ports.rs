use crate::error::{Result, SourceError};
use crate::types::{Checkpoint, Cursor, Detection, PartitionKey, RawMessageRecord};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

// Source-side ports

/// Media attachment as described by the source
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceMedia {
    /// `photo`, `document` or anything else
    pub kind: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    pub url: String,
}

/// One message as returned by the source's paginated read API
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceMessage {
    pub id: i64,
    pub date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub media: Option<SourceMedia>,
    #[serde(default)]
    pub views: Option<i64>,
    #[serde(default)]
    pub forwards: Option<i64>,
    #[serde(default)]
    pub replies: Option<i64>,
    #[serde(default)]
    pub grouped_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SourcePage {
    pub messages: Vec<SourceMessage>,
    #[serde(default)]
    pub next_cursor: Option<i64>,
}

/// Paginated read access to the external source.
///
/// `fetch_page` returns messages with ids strictly greater than `after`, oldest first.
#[async_trait]
pub trait MessageSource: Send + Sync {
    async fn fetch_page(
        &self,
        channel: &str,
        after: Option<Cursor>,
        limit: usize,
    ) -> std::result::Result<SourcePage, SourceError>;

    async fn fetch_media(&self, media: &SourceMedia) -> std::result::Result<Vec<u8>, SourceError>;
}

// Storage-side ports

#[derive(Debug, Clone)]
pub struct PartitionContents {
    pub key: PartitionKey,
    /// sha256 of the raw bytes, used to detect partitions that changed since their last load
    pub content_sha256: String,
    /// One entry per line (or array element for legacy files); `Err` for lines that did not parse or validate
    pub records: Vec<std::result::Result<RawMessageRecord, crate::error::ValidationError>>,
}

#[async_trait]
pub trait RawStore: Send + Sync {
    /// Append a batch to the (date, channel) partition, all-or-nothing.
    async fn write_batch(
        &self,
        date: NaiveDate,
        channel: &str,
        records: &[RawMessageRecord],
    ) -> Result<PartitionKey>;

    async fn list_partitions(&self) -> Result<Vec<PartitionKey>>;

    async fn read_partition(&self, key: &PartitionKey) -> Result<PartitionContents>;
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn get_checkpoint(&self, channel: &str) -> Result<Option<Checkpoint>>;

    /// Move the cursor forward. Regressions fail with `InvalidCursor` unless `force` is set.
    async fn advance_checkpoint(&self, channel: &str, cursor: Cursor, force: bool) -> Result<Checkpoint>;

    async fn reset_checkpoint(&self, channel: &str) -> Result<()>;
}

// Enrichment-side ports

/// The object detection model, called synchronously per image.
pub trait ObjectDetector: Send + Sync {
    fn detect(&self, image: &Path) -> Result<Vec<Detection>>;
}
