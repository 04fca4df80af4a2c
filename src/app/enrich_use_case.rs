use crate::app::ports::ObjectDetector;
use crate::error::{IngestError, Result};
use crate::infra::media_store::MediaStore;
use crate::infra::warehouse::Warehouse;
use crate::metrics::EnrichMetrics;
use crate::types::{DetectionRecord, MediaType, PendingMedia};
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp"];

#[derive(Debug, Clone, Default)]
pub struct EnrichmentReport {
    pub processed: usize,
    pub enriched: usize,
    pub detections: usize,
    pub failed: usize,
    /// Media that is not an image; marked enriched with no detections
    pub skipped: usize,
    /// Outcomes that could not be written to the warehouse
    pub errors: Vec<String>,
}

/// Runs object detection over loaded messages that carry media.
pub struct EnrichmentWorker {
    warehouse: Arc<Warehouse>,
    detector: Arc<dyn ObjectDetector>,
    media: MediaStore,
    timeout: Option<Duration>,
}

impl EnrichmentWorker {
    pub fn new(warehouse: Arc<Warehouse>, detector: Arc<dyn ObjectDetector>, media: MediaStore) -> Self {
        Self {
            warehouse,
            detector,
            media,
            timeout: None,
        }
    }

    /// Give up on a single image after `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Detections for one message's media. Does not touch the warehouse.
    pub async fn enrich(&self, message: &PendingMedia) -> Result<Vec<DetectionRecord>> {
        let failure = |message_text: String| IngestError::EnrichmentFailure {
            channel: message.channel.clone(),
            external_id: message.external_id,
            message: message_text,
        };

        if !is_image(message) {
            debug!(
                "Media of {}/{} is not an image, nothing to detect",
                message.channel, message.external_id
            );
            return Ok(Vec::new());
        }

        let path = self
            .media
            .resolve(&message.media_path)
            .map_err(|e| failure(e.to_string()))?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| failure(format!("media file {} unavailable: {}", path.display(), e)))?;
        if meta.len() == 0 {
            return Err(failure(format!("media file {} is empty", path.display())));
        }

        let detector = self.detector.clone();
        let task = tokio::task::spawn_blocking(move || detector.detect(&path));
        let joined = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, task)
                .await
                .map_err(|_| failure(format!("detector timed out after {limit:?}")))?,
            None => task.await,
        };
        let raw = joined
            .map_err(|e| failure(format!("detector task failed: {e}")))?
            .map_err(|e| failure(e.to_string()))?;

        let detected_at = Utc::now();
        let mut out = Vec::with_capacity(raw.len());
        for d in raw {
            if !(0.0..=1.0).contains(&d.confidence) {
                warn!(
                    "Dropping detection {} with confidence {} for {}/{}",
                    d.label, d.confidence, message.channel, message.external_id
                );
                continue;
            }
            out.push(DetectionRecord {
                channel: message.channel.clone(),
                external_id: message.external_id,
                label: d.label,
                confidence: d.confidence,
                detected_at,
            });
        }
        Ok(out)
    }

    /// Enrich up to `limit` pending messages, recording outcomes in the warehouse.
    pub async fn run(&self, limit: usize) -> Result<EnrichmentReport> {
        let pending = self.warehouse.pending_media(limit)?;
        let mut report = EnrichmentReport::default();
        info!("Enriching {} messages with media", pending.len());

        for message in &pending {
            report.processed += 1;
            let started = Instant::now();
            let outcome = match self.enrich(message).await {
                Ok(detections) => self
                    .warehouse
                    .record_detections(&message.channel, message.external_id, &detections)
                    .map(|()| detections.len()),
                Err(e) => Err(e),
            };
            match outcome {
                Ok(detected) => {
                    if !is_image(message) {
                        report.skipped += 1;
                    }
                    report.enriched += 1;
                    report.detections += detected;
                    EnrichMetrics::record_success(detected, started.elapsed().as_secs_f64());
                }
                Err(e) => {
                    warn!("{}", e);
                    report.failed += 1;
                    EnrichMetrics::record_failure();
                    if let Err(store_err) = self.warehouse.record_enrichment_failure(
                        &message.channel,
                        message.external_id,
                        &e.to_string(),
                    ) {
                        warn!(
                            "Could not record failure for {}/{}: {}",
                            message.channel, message.external_id, store_err
                        );
                        report
                            .errors
                            .push(format!("{}/{}: {}", message.channel, message.external_id, store_err));
                    }
                }
            }
        }
        info!(
            "Enrichment finished: {} enriched, {} failed, {} detections",
            report.enriched, report.failed, report.detections
        );
        Ok(report)
    }
}

fn is_image(message: &PendingMedia) -> bool {
    if message.media_type == Some(MediaType::Photo) {
        return true;
    }
    std::path::Path::new(&message.media_path)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}
