use crate::app::ports::RawStore;
use crate::error::{IngestError, Result};
use crate::infra::warehouse::Warehouse;
use crate::metrics::LoadMetrics;
use crate::types::PartitionKey;
use crate::validation::dedup_latest;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    pub partition: String,
    pub inserted: usize,
    pub updated: usize,
    pub skipped_duplicate: usize,
    pub skipped_invalid: usize,
    /// One entry per rejected record: line number and reason
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct LoadRunReport {
    pub run_id: Uuid,
    pub partitions: Vec<LoadReport>,
    /// Partitions skipped because their checksum matches the manifest
    pub unchanged: usize,
    /// Partition id and error for partitions that were rolled back
    pub failed: Vec<(String, String)>,
}

/// Moves raw store partitions into `raw.messages`.
pub struct LoaderEngine {
    raw_store: Arc<dyn RawStore>,
    warehouse: Arc<Warehouse>,
}

impl LoaderEngine {
    pub fn new(raw_store: Arc<dyn RawStore>, warehouse: Arc<Warehouse>) -> Self {
        Self {
            raw_store,
            warehouse,
        }
    }

    /// Load one partition in a single transaction.
    ///
    /// Invalid records are counted and logged; only storage failures abort the
    /// partition, surfacing as `LoadFailure`.
    #[instrument(skip(self, key), fields(partition = %key))]
    pub async fn load_partition(&self, key: &PartitionKey) -> Result<LoadReport> {
        let partition = key.id();
        let contents = self
            .raw_store
            .read_partition(key)
            .await
            .map_err(|e| load_failure(&partition, e))?;

        let mut report = LoadReport {
            partition: partition.clone(),
            ..Default::default()
        };
        let mut valid = Vec::with_capacity(contents.records.len());
        for (idx, record) in contents.records.into_iter().enumerate() {
            match record {
                Ok(r) => valid.push(r),
                Err(reason) => {
                    let line = idx + 1;
                    warn!("Skipping record {} of {}: {}", line, partition, reason);
                    report.skipped_invalid += 1;
                    report.errors.push(format!("line {line}: {reason}"));
                }
            }
        }
        let (records, collapsed) = dedup_latest(valid);

        let counts = self
            .warehouse
            .upsert_partition(&partition, &contents.content_sha256, &records, report.skipped_invalid)
            .map_err(|e| load_failure(&partition, e))?;
        report.inserted = counts.inserted;
        report.updated = counts.updated;
        report.skipped_duplicate = counts.skipped_duplicate + collapsed;

        LoadMetrics::record_partition(
            report.inserted,
            report.updated,
            report.skipped_duplicate,
            report.skipped_invalid,
        );
        info!(
            "Loaded {}: {} inserted, {} updated, {} duplicate, {} invalid",
            partition, report.inserted, report.updated, report.skipped_duplicate, report.skipped_invalid
        );
        Ok(report)
    }

    /// Load every partition whose contents changed since its last load, or all of them with `force`.
    pub async fn load_pending(&self, force: bool) -> Result<LoadRunReport> {
        let mut run = LoadRunReport {
            run_id: Uuid::new_v4(),
            ..Default::default()
        };
        for key in self.raw_store.list_partitions().await? {
            if !force && self.is_unchanged(&key).await? {
                run.unchanged += 1;
                continue;
            }
            match self.load_partition(&key).await {
                Ok(report) => run.partitions.push(report),
                Err(e) => {
                    warn!("Partition {} failed to load: {}", key, e);
                    LoadMetrics::record_partition_failure();
                    run.failed.push((key.id(), e.to_string()));
                }
            }
        }
        info!(
            run_id = %run.run_id,
            "Load finished: {} loaded, {} unchanged, {} failed",
            run.partitions.len(),
            run.unchanged,
            run.failed.len()
        );
        Ok(run)
    }

    async fn is_unchanged(&self, key: &PartitionKey) -> Result<bool> {
        let Some(loaded) = self.warehouse.manifest_checksum(&key.id())? else {
            return Ok(false);
        };
        // An unreadable partition counts as changed so its failure gets reported.
        match self.raw_store.read_partition(key).await {
            Ok(contents) => Ok(contents.content_sha256 == loaded),
            Err(_) => Ok(false),
        }
    }
}

fn load_failure(partition: &str, err: IngestError) -> IngestError {
    IngestError::LoadFailure {
        partition: partition.to_string(),
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::in_memory::InMemoryRawStore;
    use crate::types::{PartitionFormat, RawMessageRecord, RawPayload};
    use chrono::{NaiveDate, TimeZone, Utc};
    use serde_json::json;

    fn record(id: i64, text: &str) -> RawMessageRecord {
        RawMessageRecord {
            external_id: id,
            channel: "clinic_a".into(),
            text: Some(text.into()),
            posted_at: Utc.with_ymd_and_hms(2025, 7, 14, 9, 0, 0).unwrap(),
            media_path: None,
            media_type: None,
            raw_payload: RawPayload(json!({"id": id})),
            scraped_at: Utc.with_ymd_and_hms(2025, 7, 15, 0, 0, 0).unwrap(),
        }
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 7, 15).unwrap()
    }

    fn engine() -> (Arc<InMemoryRawStore>, Arc<Warehouse>, LoaderEngine) {
        let raw = Arc::new(InMemoryRawStore::new());
        let wh = Arc::new(Warehouse::open_in_memory().unwrap());
        let loader = LoaderEngine::new(raw.clone(), wh.clone());
        (raw, wh, loader)
    }

    #[tokio::test]
    async fn duplicates_within_a_partition_keep_the_last() {
        let (raw, wh, loader) = engine();
        let key = raw
            .write_batch(day(), "clinic_a", &[record(1, "old"), record(2, "b"), record(1, "new")])
            .await
            .unwrap();
        let report = loader.load_partition(&key).await.unwrap();

        assert_eq!(report.inserted, 2);
        assert_eq!(report.skipped_duplicate, 1);
        assert_eq!(wh.message_count().unwrap(), 2);
    }

    #[tokio::test]
    async fn unchanged_partitions_are_skipped_unless_forced() {
        let (raw, _wh, loader) = engine();
        raw.write_batch(day(), "clinic_a", &[record(1, "a")]).await.unwrap();

        let first = loader.load_pending(false).await.unwrap();
        assert_eq!(first.partitions.len(), 1);
        let second = loader.load_pending(false).await.unwrap();
        assert_eq!(second.unchanged, 1);
        assert!(second.partitions.is_empty());

        let forced = loader.load_pending(true).await.unwrap();
        assert_eq!(forced.partitions[0].skipped_duplicate, 1);
    }

    #[tokio::test]
    async fn appended_partition_is_loaded_again() {
        let (raw, wh, loader) = engine();
        raw.write_batch(day(), "clinic_a", &[record(1, "a")]).await.unwrap();
        loader.load_pending(false).await.unwrap();
        raw.write_batch(day(), "clinic_a", &[record(2, "b")]).await.unwrap();

        let run = loader.load_pending(false).await.unwrap();
        assert_eq!(run.partitions[0].inserted, 1);
        assert_eq!(run.partitions[0].skipped_duplicate, 1);
        assert_eq!(wh.message_count().unwrap(), 2);
    }

    #[tokio::test]
    async fn forced_reload_of_an_older_partition_keeps_the_newer_row() {
        let (raw, wh, loader) = engine();
        raw.write_batch(day(), "clinic_a", &[record(1, "draft")]).await.unwrap();
        let edited = RawMessageRecord {
            scraped_at: Utc.with_ymd_and_hms(2025, 7, 16, 0, 0, 0).unwrap(),
            ..record(1, "edited")
        };
        let next_day = NaiveDate::from_ymd_opt(2025, 7, 16).unwrap();
        raw.write_batch(next_day, "clinic_a", &[edited]).await.unwrap();

        loader.load_pending(false).await.unwrap();
        let settled = wh.message_fingerprints().unwrap();
        let forced = loader.load_pending(true).await.unwrap();

        assert!(forced.partitions.iter().all(|p| p.updated == 0));
        assert_eq!(wh.message_fingerprints().unwrap(), settled);
    }

    #[tokio::test]
    async fn broken_partition_fails_alone() {
        let (raw, wh, loader) = engine();
        raw.write_batch(day(), "clinic_a", &[record(1, "a")]).await.unwrap();
        raw.insert_raw(
            PartitionKey {
                date: day(),
                channel: "clinic_b".into(),
                format: PartitionFormat::LegacyJsonArray,
            },
            b"{not an array".to_vec(),
        )
        .unwrap();

        let run = loader.load_pending(false).await.unwrap();
        assert_eq!(run.partitions.len(), 1);
        assert_eq!(run.failed.len(), 1);
        assert!(run.failed[0].0.contains("clinic_b"));
        assert_eq!(wh.message_count().unwrap(), 1);
    }
}
