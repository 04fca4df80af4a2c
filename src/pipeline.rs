//! Wiring of the ingestion components and the scrape → load → enrich run.

use crate::app::enrich_use_case::{EnrichmentReport, EnrichmentWorker};
use crate::app::load_use_case::{LoadRunReport, LoaderEngine};
use crate::app::ports::{CheckpointStore, MessageSource, ObjectDetector, RawStore};
use crate::app::scrape_use_case::{ScrapeRunReport, ScrapeSettings, ScraperEngine};
use crate::config::AppConfig;
use crate::error::{IngestError, Result};
use crate::infra::command_detector::CommandDetector;
use crate::infra::fs_raw_store::FsRawStore;
use crate::infra::http_source::HttpMessageSource;
use crate::infra::ingest_meta::IngestMeta;
use crate::infra::media_store::MediaStore;
use crate::infra::warehouse::Warehouse;
use crate::rate_limiter::RateLimiter;
use crate::types::Channel;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Everything a run needs, built once from configuration.
pub struct Components {
    pub config: AppConfig,
    pub source: Arc<dyn MessageSource>,
    pub raw_store: Arc<dyn RawStore>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub meta: Arc<IngestMeta>,
    pub warehouse: Arc<Warehouse>,
    pub media: MediaStore,
    pub detector: Option<Arc<dyn ObjectDetector>>,
    pub limiter: RateLimiter,
    pub shutdown: Arc<AtomicBool>,
}

impl Components {
    /// Production wiring: HTTP source, filesystem raw store, SQLite checkpoints and warehouse.
    ///
    /// A missing source token is only fatal to commands that scrape; see `AppConfig::source_token`.
    pub fn from_config(config: AppConfig) -> Result<Self> {
        let token = config.source_token().ok();
        let source = HttpMessageSource::new(&config.source.base_url, token, config.source_timeout())?;
        let meta = Arc::new(IngestMeta::open_at_root(&config.data_root)?);
        let warehouse = Arc::new(Warehouse::open(config.warehouse_path())?);
        let detector = config.enrichment.command.as_ref().map(|program| {
            Arc::new(
                CommandDetector::new(program.clone(), config.enrichment.args.clone())
                    .with_timeout(config.detector_timeout()),
            ) as Arc<dyn ObjectDetector>
        });
        Ok(Self {
            source: Arc::new(source),
            raw_store: Arc::new(FsRawStore::at_data_root(&config.data_root)),
            checkpoints: meta.clone(),
            meta,
            warehouse,
            media: MediaStore::at_data_root(&config.data_root),
            detector,
            limiter: RateLimiter::new(config.rate_limits.limits()),
            shutdown: Arc::new(AtomicBool::new(false)),
            config,
        })
    }

    pub fn scraper(&self) -> ScraperEngine {
        let settings = ScrapeSettings {
            page_size: self.config.scrape.page_size,
            max_pages: self.config.scrape.max_pages,
            concurrency: self.config.rate_limits.concurrency.max(1) as usize,
        };
        let engine = ScraperEngine::new(
            self.source.clone(),
            self.raw_store.clone(),
            self.checkpoints.clone(),
        )
        .with_rate_limiter(self.limiter.clone())
        .with_retry_policy(self.config.retry.clone())
        .with_settings(settings)
        .with_shutdown(self.shutdown.clone());
        if self.config.scrape.download_media {
            engine.with_media_store(self.media.clone())
        } else {
            engine
        }
    }

    pub fn loader(&self) -> LoaderEngine {
        LoaderEngine::new(self.raw_store.clone(), self.warehouse.clone())
    }

    /// Fails when no detector command is configured.
    pub fn enricher(&self) -> Result<EnrichmentWorker> {
        let detector = self.detector.clone().ok_or_else(|| {
            IngestError::Config("enrichment.command is not configured".into())
        })?;
        Ok(EnrichmentWorker::new(
            self.warehouse.clone(),
            detector,
            self.media.clone(),
        )
        .with_timeout(self.config.detector_timeout()))
    }
}

#[derive(Debug)]
pub struct PipelineReport {
    pub scrape: ScrapeRunReport,
    pub load: LoadRunReport,
    /// `None` when no detector is configured
    pub enrich: Option<EnrichmentReport>,
}

pub struct Pipeline;

impl Pipeline {
    /// Scrape the given channels, load every pending partition, then enrich.
    ///
    /// Channel and partition failures are reported, not returned; a later stage
    /// still runs on whatever the earlier one committed.
    #[instrument(skip_all)]
    pub async fn run(components: &Components, channels: &[Channel]) -> Result<PipelineReport> {
        let scrape = components.scraper().scrape_all(channels).await;
        if scrape.failed_channels() > 0 {
            warn!("{} channel(s) failed to scrape", scrape.failed_channels());
        }

        let load = components.loader().load_pending(false).await?;

        let enrich = match components.enricher() {
            Ok(worker) => Some(worker.run(components.config.enrichment.batch_size).await?),
            Err(e) => {
                info!("Skipping enrichment: {}", e);
                None
            }
        };
        Ok(PipelineReport { scrape, load, enrich })
    }
}
