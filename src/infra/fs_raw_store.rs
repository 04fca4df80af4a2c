use crate::app::ports::{PartitionContents, RawStore};
use crate::envelope::encode_batch;
use crate::error::{IngestError, Result, ValidationError};
use crate::idempotency::sha256_hex;
use crate::types::{PartitionFormat, PartitionKey, RawMessageRecord};
use crate::validation::{decode_legacy, decode_line};
use async_trait::async_trait;
use chrono::NaiveDate;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Partitioned raw store on the local filesystem.
///
/// Layout: `<root>/messages/<YYYY-MM-DD>/<channel>.ndjson`. Legacy
/// `<channel>.json` array files in the same date directories are read too.
pub struct FsRawStore {
    root: PathBuf,
}

impl FsRawStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    /// Store rooted at `<data_root>/raw`.
    pub fn at_data_root<P: AsRef<Path>>(data_root: P) -> Self {
        Self::new(data_root.as_ref().join("raw"))
    }

    fn messages_dir(&self) -> PathBuf {
        self.root.join("messages")
    }

    pub fn partition_path(&self, key: &PartitionKey) -> PathBuf {
        self.messages_dir()
            .join(key.date.format("%Y-%m-%d").to_string())
            .join(format!("{}.{}", key.channel, key.extension()))
    }
}

#[async_trait]
impl RawStore for FsRawStore {
    async fn write_batch(
        &self,
        date: NaiveDate,
        channel: &str,
        records: &[RawMessageRecord],
    ) -> Result<PartitionKey> {
        let key = PartitionKey::ndjson(date, channel);
        let path = self.partition_path(&key);
        let dir = path
            .parent()
            .ok_or_else(|| IngestError::Config(format!("bad partition path {}", path.display())))?;
        fs::create_dir_all(dir)?;

        // Rewrite existing lines plus the new batch into a temp file in the same
        // directory, then rename over the partition. Readers see either the old
        // file or the complete new one.
        let mut contents = if path.exists() {
            fs::read(&path)?
        } else {
            Vec::new()
        };
        if contents.last().is_some_and(|b| *b != b'\n') {
            contents.push(b'\n');
        }
        contents.extend_from_slice(encode_batch(records)?.as_bytes());

        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&contents)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| IngestError::Io(e.error))?;

        debug!(
            "Committed {} records to partition {}",
            records.len(),
            key.id()
        );
        Ok(key)
    }

    async fn list_partitions(&self) -> Result<Vec<PartitionKey>> {
        let dir = self.messages_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut keys = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let dir_name = entry.file_name().to_string_lossy().to_string();
            let date = match NaiveDate::parse_from_str(&dir_name, "%Y-%m-%d") {
                Ok(d) => d,
                Err(_) => {
                    warn!("Ignoring non-date directory in raw store: {}", dir_name);
                    continue;
                }
            };
            for file in fs::read_dir(entry.path())? {
                let path = file?.path();
                let format = match path.extension().and_then(|s| s.to_str()) {
                    Some("ndjson") => PartitionFormat::Ndjson,
                    Some("json") => PartitionFormat::LegacyJsonArray,
                    // temp files from in-flight or crashed writes have no known extension
                    _ => continue,
                };
                let Some(channel) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                keys.push(PartitionKey {
                    date,
                    channel: channel.to_string(),
                    format,
                });
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn read_partition(&self, key: &PartitionKey) -> Result<PartitionContents> {
        let bytes = fs::read(self.partition_path(key))?;
        parse_partition(key, &bytes)
    }
}

/// Decode partition bytes; shared with the in-memory store.
pub fn parse_partition(key: &PartitionKey, bytes: &[u8]) -> Result<PartitionContents> {
    let content_sha256 = sha256_hex(bytes);
    let records = match key.format {
        PartitionFormat::Ndjson => {
            let text = String::from_utf8_lossy(bytes);
            text.lines()
                .filter(|line| !line.trim().is_empty())
                .map(decode_line)
                .collect()
        }
        PartitionFormat::LegacyJsonArray => {
            let value: serde_json::Value = serde_json::from_slice(bytes).map_err(|e| {
                IngestError::Validation(ValidationError::Unparseable(format!(
                    "legacy partition {}: {}",
                    key.id(),
                    e
                )))
            })?;
            let items = value.as_array().ok_or_else(|| {
                IngestError::Validation(ValidationError::MalformedPayload(format!(
                    "legacy partition {} is not a JSON array",
                    key.id()
                )))
            })?;
            items.iter().map(decode_legacy).collect()
        }
    };
    Ok(PartitionContents {
        key: key.clone(),
        content_sha256,
        records,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RawPayload;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use tempfile::tempdir;

    fn record(id: i64) -> RawMessageRecord {
        RawMessageRecord {
            external_id: id,
            channel: "clinic_a".into(),
            text: Some(format!("message {id}")),
            posted_at: Utc.with_ymd_and_hms(2025, 7, 14, 9, 0, 0).unwrap(),
            media_path: None,
            media_type: None,
            raw_payload: RawPayload(json!({})),
            scraped_at: Utc.with_ymd_and_hms(2025, 7, 15, 0, 0, 0).unwrap(),
        }
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 7, 15).unwrap()
    }

    #[tokio::test]
    async fn batches_append_to_one_partition() {
        let dir = tempdir().unwrap();
        let store = FsRawStore::new(dir.path());
        store.write_batch(day(), "clinic_a", &[record(1), record(2)]).await.unwrap();
        let key = store.write_batch(day(), "clinic_a", &[record(3)]).await.unwrap();

        assert_eq!(store.list_partitions().await.unwrap(), vec![key.clone()]);
        let contents = store.read_partition(&key).await.unwrap();
        let ids: Vec<i64> = contents
            .records
            .iter()
            .map(|r| r.as_ref().unwrap().external_id)
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn leftover_temp_files_are_not_partitions() {
        let dir = tempdir().unwrap();
        let store = FsRawStore::new(dir.path());
        let key = store.write_batch(day(), "clinic_a", &[record(1)]).await.unwrap();
        let date_dir = store.partition_path(&key).parent().unwrap().to_path_buf();
        fs::write(date_dir.join(".tmpXYZ123"), b"{\"record_version\":1,\"exter").unwrap();

        assert_eq!(store.list_partitions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn torn_tail_is_isolated_to_one_line() {
        let dir = tempdir().unwrap();
        let store = FsRawStore::new(dir.path());
        let key = store.write_batch(day(), "clinic_a", &[record(1)]).await.unwrap();
        let path = store.partition_path(&key);
        let mut f = fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"{\"record_version\":1,\"external_id\":2,\"chan").unwrap();
        drop(f);

        // the next batch starts on a fresh line instead of gluing onto the torn one
        store.write_batch(day(), "clinic_a", &[record(3)]).await.unwrap();
        let contents = store.read_partition(&key).await.unwrap();
        assert_eq!(contents.records.len(), 3);
        assert!(contents.records[0].is_ok());
        assert!(matches!(
            contents.records[1],
            Err(ValidationError::Unparseable(_))
        ));
        assert_eq!(contents.records[2].as_ref().unwrap().external_id, 3);
    }

    #[tokio::test]
    async fn legacy_array_partitions_are_listed_and_read() {
        let dir = tempdir().unwrap();
        let store = FsRawStore::new(dir.path());
        let date_dir = dir.path().join("messages").join("2025-07-10");
        fs::create_dir_all(&date_dir).unwrap();
        let legacy = json!([{
            "message_id": 11,
            "channel_name": "CheMed123",
            "message_text": "Vitamin C",
            "message_date": "2025-07-10T08:00:00+00:00",
            "scraped_at": "2025-07-10T12:00:00",
            "raw_data": {"views": 2}
        }]);
        fs::write(date_dir.join("CheMed123.json"), legacy.to_string()).unwrap();

        let keys = store.list_partitions().await.unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].format, PartitionFormat::LegacyJsonArray);
        let contents = store.read_partition(&keys[0]).await.unwrap();
        assert_eq!(contents.records[0].as_ref().unwrap().external_id, 11);
    }

    #[tokio::test]
    async fn unreadable_legacy_partition_is_an_error_not_a_panic() {
        let dir = tempdir().unwrap();
        let store = FsRawStore::new(dir.path());
        let date_dir = dir.path().join("messages").join("2025-07-10");
        fs::create_dir_all(&date_dir).unwrap();
        fs::write(date_dir.join("CheMed123.json"), b"[{\"message_id\": 1,").unwrap();

        let keys = store.list_partitions().await.unwrap();
        assert!(store.read_partition(&keys[0]).await.is_err());
    }
}
