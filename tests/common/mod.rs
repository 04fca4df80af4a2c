#![allow(dead_code)]

use channel_ingest::app::load_use_case::LoaderEngine;
use channel_ingest::app::ports::{ObjectDetector, SourceMedia, SourceMessage};
use channel_ingest::app::scrape_use_case::{ScrapeSettings, ScraperEngine};
use channel_ingest::error::Result;
use channel_ingest::infra::fs_raw_store::FsRawStore;
use channel_ingest::infra::in_memory::InMemorySource;
use channel_ingest::infra::ingest_meta::IngestMeta;
use channel_ingest::infra::media_store::MediaStore;
use channel_ingest::infra::warehouse::Warehouse;
use channel_ingest::retry::{RecordingSleeper, RetryPolicy};
use channel_ingest::types::Detection;
use chrono::{TimeZone, Utc};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

/// On-disk stores under a temp data root, fed by a scripted source.
pub struct Harness {
    pub dir: TempDir,
    pub source: Arc<InMemorySource>,
    pub raw: Arc<FsRawStore>,
    pub meta: Arc<IngestMeta>,
    pub warehouse: Arc<Warehouse>,
    pub media: MediaStore,
    pub sleeper: RecordingSleeper,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let raw = Arc::new(FsRawStore::at_data_root(dir.path()));
        let meta = Arc::new(IngestMeta::open_at_root(dir.path()).unwrap());
        let warehouse = Arc::new(Warehouse::open(dir.path().join("warehouse.db")).unwrap());
        let media = MediaStore::at_data_root(dir.path());
        Self {
            dir,
            source: Arc::new(InMemorySource::new()),
            raw,
            meta,
            warehouse,
            media,
            sleeper: RecordingSleeper::new(),
        }
    }

    pub fn data_root(&self) -> &Path {
        self.dir.path()
    }

    pub fn scraper(&self) -> ScraperEngine {
        ScraperEngine::new(self.source.clone(), self.raw.clone(), self.meta.clone())
            .with_media_store(self.media.clone())
            .with_sleeper(Arc::new(self.sleeper.clone()))
            .with_retry_policy(RetryPolicy {
                max_attempts: 3,
                base_delay_ms: 1_000,
                max_delay_ms: 8_000,
                multiplier: 2.0,
                jitter: 0.0,
            })
            .with_settings(ScrapeSettings {
                page_size: 2,
                max_pages: None,
                concurrency: 2,
            })
    }

    pub fn loader(&self) -> LoaderEngine {
        LoaderEngine::new(self.raw.clone(), self.warehouse.clone())
    }
}

pub fn message(id: i64) -> SourceMessage {
    SourceMessage {
        id,
        date: Some(Utc.with_ymd_and_hms(2025, 7, 14, 9, 0, 0).unwrap()),
        text: Some(format!("Paracetamol 500mg, post {id}")),
        media: None,
        views: Some(100 + id),
        forwards: Some(1),
        replies: None,
        grouped_id: None,
    }
}

pub fn photo_message(id: i64, url: &str) -> SourceMessage {
    SourceMessage {
        media: Some(SourceMedia {
            kind: "photo".into(),
            mime_type: Some("image/jpeg".into()),
            url: url.into(),
        }),
        ..message(id)
    }
}

/// Detector returning the same detections for every image.
pub struct FixedDetector(pub Vec<Detection>);

impl ObjectDetector for FixedDetector {
    fn detect(&self, _image: &Path) -> Result<Vec<Detection>> {
        Ok(self.0.clone())
    }
}

pub fn detection(label: &str, confidence: f64) -> Detection {
    Detection {
        label: label.into(),
        confidence,
    }
}
