use crate::app::ports::{CheckpointStore, MessageSource, RawStore, SourceMessage, SourcePage};
use crate::envelope::to_value;
use crate::error::{IngestError, Result};
use crate::infra::media_store::MediaStore;
use crate::metrics::ScrapeMetrics;
use crate::rate_limiter::RateLimiter;
use crate::retry::{RetryPolicy, Sleeper, TokioSleeper};
use crate::types::{Channel, Cursor, MediaType, RawMessageRecord, RawPayload};
use crate::validation::check_schema;
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream, StreamExt, TryStreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ScrapeSettings {
    pub page_size: usize,
    /// Upper bound on pages fetched per channel per run
    pub max_pages: Option<usize>,
    /// Channels scraped at the same time
    pub concurrency: usize,
}

impl Default for ScrapeSettings {
    fn default() -> Self {
        Self {
            page_size: 100,
            max_pages: None,
            concurrency: 3,
        }
    }
}

/// One page worth of records, ready to be written as a unit.
#[derive(Debug, Clone)]
pub struct ScrapedBatch {
    pub records: Vec<RawMessageRecord>,
    /// Newest external id seen in the page, valid or not
    pub cursor: Cursor,
    pub invalid: usize,
    pub media_failures: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ChannelScrapeReport {
    pub channel: String,
    pub batches: usize,
    pub records_written: usize,
    pub invalid: usize,
    pub media_failures: usize,
    pub checkpoint: Option<Cursor>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ScrapeRunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub channels: Vec<ChannelScrapeReport>,
}

impl ScrapeRunReport {
    pub fn failed_channels(&self) -> usize {
        self.channels.iter().filter(|c| c.error.is_some()).count()
    }
}

struct PageState {
    after: Option<Cursor>,
    pages: usize,
    exhausted: bool,
}

/// Pulls channel history newer than each channel's checkpoint into the raw store.
pub struct ScraperEngine {
    source: Arc<dyn MessageSource>,
    raw_store: Arc<dyn RawStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    media: Option<MediaStore>,
    limiter: RateLimiter,
    retry: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    settings: ScrapeSettings,
    shutdown: Arc<AtomicBool>,
}

impl ScraperEngine {
    pub fn new(
        source: Arc<dyn MessageSource>,
        raw_store: Arc<dyn RawStore>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            source,
            raw_store,
            checkpoints,
            media: None,
            limiter: RateLimiter::unlimited(),
            retry: RetryPolicy::default(),
            sleeper: Arc::new(TokioSleeper),
            settings: ScrapeSettings::default(),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_media_store(mut self, media: MediaStore) -> Self {
        self.media = Some(media);
        self
    }

    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_settings(mut self, settings: ScrapeSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_shutdown(mut self, shutdown: Arc<AtomicBool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    fn stopping(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Lazy stream of batches newer than `from`, oldest first.
    ///
    /// Ends when the source has nothing newer, `max_pages` is reached or shutdown
    /// is requested. Restarting from any cursor resumes where that cursor points.
    pub fn batches<'a>(
        &'a self,
        channel: &'a str,
        from: Option<Cursor>,
    ) -> impl Stream<Item = Result<ScrapedBatch>> + 'a {
        let state = PageState {
            after: from,
            pages: 0,
            exhausted: false,
        };
        stream::try_unfold(state, move |state| async move {
            if state.exhausted || self.stopping() {
                return Ok::<_, IngestError>(None);
            }
            if self.settings.max_pages.is_some_and(|max| state.pages >= max) {
                debug!("Reached max pages for {}", channel);
                return Ok(None);
            }

            let page = self.fetch_page(channel, state.after).await?;
            let mut messages: Vec<SourceMessage> = page
                .messages
                .into_iter()
                .filter(|m| state.after.map_or(true, |c| m.id > c.0))
                .collect();
            if messages.is_empty() {
                return Ok(None);
            }
            messages.sort_by_key(|m| m.id);
            let cursor = Cursor(messages.last().map_or(0, |m| m.id));

            let batch = self.build_batch(channel, messages, cursor).await;
            let next = PageState {
                after: Some(cursor),
                pages: state.pages + 1,
                exhausted: page.next_cursor.is_none(),
            };
            Ok(Some((batch, next)))
        })
    }

    async fn fetch_page(&self, channel: &str, after: Option<Cursor>) -> Result<SourcePage> {
        let source = &self.source;
        let limiter = &self.limiter;
        let limit = self.settings.page_size;
        self.retry
            .run(self.sleeper.as_ref(), "fetch_page", move || async move {
                let _permit = limiter.acquire().await;
                source.fetch_page(channel, after, limit).await
            })
            .await
            .map_err(|e| IngestError::ScrapeFailure {
                channel: channel.to_string(),
                attempts: e.attempts,
                message: e.last_error.to_string(),
            })
    }

    async fn build_batch(&self, channel: &str, messages: Vec<SourceMessage>, cursor: Cursor) -> ScrapedBatch {
        let scraped_at = Utc::now();
        let mut batch = ScrapedBatch {
            records: Vec::with_capacity(messages.len()),
            cursor,
            invalid: 0,
            media_failures: 0,
        };
        for msg in messages {
            let Some(posted_at) = msg.date else {
                warn!("Message {} in {} has no date, skipping", msg.id, channel);
                batch.invalid += 1;
                continue;
            };
            let (media_path, media_type) = match self.capture_media(channel, &msg, posted_at).await {
                Ok(media) => media,
                Err(e) => {
                    warn!("Media for {}/{} not stored: {}", channel, msg.id, e);
                    ScrapeMetrics::record_media_failure(channel);
                    batch.media_failures += 1;
                    (None, msg.media.as_ref().map(|m| media_type_of(&m.kind)))
                }
            };
            let raw_payload = match serde_json::to_value(&msg) {
                Ok(v) => RawPayload(v),
                Err(e) => {
                    warn!("Message {} in {} could not be captured: {}", msg.id, channel, e);
                    batch.invalid += 1;
                    continue;
                }
            };
            let record = RawMessageRecord {
                external_id: msg.id,
                channel: channel.to_string(),
                text: msg.text.clone(),
                posted_at,
                media_path,
                media_type,
                raw_payload,
                scraped_at,
            };
            let checked = to_value(&record)
                .map_err(|e| e.to_string())
                .and_then(|v| check_schema(&v).map_err(|e| e.to_string()));
            match checked {
                Ok(()) => batch.records.push(record),
                Err(reason) => {
                    warn!("Message {} in {} failed validation: {}", msg.id, channel, reason);
                    batch.invalid += 1;
                }
            }
        }
        batch
    }

    /// Download a message's media unless it is already on disk.
    async fn capture_media(
        &self,
        channel: &str,
        msg: &SourceMessage,
        posted_at: DateTime<Utc>,
    ) -> Result<(Option<String>, Option<MediaType>)> {
        let Some(media) = &msg.media else {
            return Ok((None, None));
        };
        let media_type = Some(media_type_of(&media.kind));
        let Some(store) = &self.media else {
            return Ok((None, media_type));
        };
        let relative = MediaStore::relative_path(
            channel,
            msg.id,
            posted_at,
            &media.kind,
            media.mime_type.as_deref(),
        );
        if store.exists(&relative) {
            debug!("Reusing media {}", relative);
            return Ok((Some(relative), media_type));
        }

        let source = &self.source;
        let limiter = &self.limiter;
        let bytes = self
            .retry
            .run(self.sleeper.as_ref(), "fetch_media", move || async move {
                let _permit = limiter.acquire().await;
                source.fetch_media(media).await
            })
            .await
            .map_err(|e| IngestError::TransientSource {
                channel: channel.to_string(),
                message: e.last_error.to_string(),
            })?;
        self.limiter.record_bytes(bytes.len() as u64).await;
        store.store(&relative, &bytes)?;
        Ok((Some(relative), media_type))
    }

    /// Scrape one channel from its checkpoint; failures are captured in the report.
    #[instrument(skip(self, channel), fields(channel = %channel.name))]
    pub async fn scrape_channel(&self, channel: &Channel) -> ChannelScrapeReport {
        let mut report = ChannelScrapeReport {
            channel: channel.name.clone(),
            ..Default::default()
        };
        if let Err(e) = self.run_channel(&channel.name, &mut report).await {
            warn!("Channel {} failed: {}", channel.name, e);
            ScrapeMetrics::record_channel_failure(&channel.name);
            report.error = Some(e.to_string());
        }
        report
    }

    async fn run_channel(&self, channel: &str, report: &mut ChannelScrapeReport) -> Result<()> {
        let start = self
            .checkpoints
            .get_checkpoint(channel)
            .await?
            .map(|cp| cp.cursor);
        report.checkpoint = start;
        info!("Scraping {} from cursor {:?}", channel, start);

        let batches = self.batches(channel, start);
        futures::pin_mut!(batches);
        while let Some(batch) = batches.try_next().await? {
            // The batch is durable before the cursor moves; a crash in between
            // only causes a re-scrape that the loader deduplicates.
            if !batch.records.is_empty() {
                let day = Utc::now().date_naive();
                self.raw_store.write_batch(day, channel, &batch.records).await?;
            }
            let cp = self
                .checkpoints
                .advance_checkpoint(channel, batch.cursor, false)
                .await?;

            report.batches += 1;
            report.records_written += batch.records.len();
            report.invalid += batch.invalid;
            report.media_failures += batch.media_failures;
            report.checkpoint = Some(cp.cursor);
            ScrapeMetrics::record_batch(channel, batch.records.len(), batch.invalid);
            ScrapeMetrics::record_cursor(channel, cp.cursor.0);

            if self.stopping() {
                info!("Shutdown requested, stopping {} at {}", channel, cp.cursor);
                break;
            }
        }
        info!(
            "Finished {}: {} records in {} batches",
            channel, report.records_written, report.batches
        );
        Ok(())
    }

    /// Scrape every enabled channel with bounded concurrency.
    pub async fn scrape_all(&self, channels: &[Channel]) -> ScrapeRunReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, "Starting scrape of {} channels", channels.len());

        let mut reports: Vec<ChannelScrapeReport> = stream::iter(channels.iter().filter(|c| c.enabled))
            .map(|c| self.scrape_channel(c))
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await;
        reports.sort_by(|a, b| a.channel.cmp(&b.channel));

        ScrapeRunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            channels: reports,
        }
    }
}

fn media_type_of(kind: &str) -> MediaType {
    match kind {
        "photo" => MediaType::Photo,
        "document" => MediaType::Document,
        _ => MediaType::Other,
    }
}
