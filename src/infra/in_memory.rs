//! In-memory adapters for development and tests.

use crate::app::ports::{
    CheckpointStore, MessageSource, PartitionContents, RawStore, SourceMedia, SourceMessage,
    SourcePage,
};
use crate::envelope::encode_batch;
use crate::error::{IngestError, Result, SourceError};
use crate::infra::fs_raw_store::parse_partition;
use crate::types::{Checkpoint, Cursor, PartitionKey, RawMessageRecord};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

fn lock<'a, T>(m: &'a Mutex<T>, what: &'static str) -> Result<MutexGuard<'a, T>> {
    m.lock().map_err(|_| IngestError::LockPoisoned(what))
}

/// Raw store keeping partition bytes in a map. Can be told to fail the next write.
#[derive(Default)]
pub struct InMemoryRawStore {
    partitions: Mutex<BTreeMap<PartitionKey, Vec<u8>>>,
    fail_next_write: AtomicBool,
}

impl InMemoryRawStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_write(&self) {
        self.fail_next_write.store(true, Ordering::SeqCst);
    }

    /// Put raw bytes under a key as-is, e.g. a legacy array or a torn line.
    pub fn insert_raw(&self, key: PartitionKey, bytes: Vec<u8>) -> Result<()> {
        lock(&self.partitions, "raw store")?.insert(key, bytes);
        Ok(())
    }

    pub fn record_count(&self) -> Result<usize> {
        let parts = lock(&self.partitions, "raw store")?;
        Ok(parts
            .values()
            .map(|b| b.split(|c| *c == b'\n').filter(|l| !l.is_empty()).count())
            .sum())
    }
}

#[async_trait]
impl RawStore for InMemoryRawStore {
    async fn write_batch(
        &self,
        date: NaiveDate,
        channel: &str,
        records: &[RawMessageRecord],
    ) -> Result<PartitionKey> {
        if self.fail_next_write.swap(false, Ordering::SeqCst) {
            return Err(IngestError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "simulated write failure",
            )));
        }
        let key = PartitionKey::ndjson(date, channel);
        let encoded = encode_batch(records)?;
        let mut parts = lock(&self.partitions, "raw store")?;
        let bytes = parts.entry(key.clone()).or_default();
        if bytes.last().is_some_and(|b| *b != b'\n') {
            bytes.push(b'\n');
        }
        bytes.extend_from_slice(encoded.as_bytes());
        Ok(key)
    }

    async fn list_partitions(&self) -> Result<Vec<PartitionKey>> {
        Ok(lock(&self.partitions, "raw store")?.keys().cloned().collect())
    }

    async fn read_partition(&self, key: &PartitionKey) -> Result<PartitionContents> {
        let parts = lock(&self.partitions, "raw store")?;
        let bytes = parts.get(key).ok_or_else(|| {
            IngestError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no partition {key}"),
            ))
        })?;
        parse_partition(key, bytes)
    }
}

/// Checkpoint store with the same monotonic rules as the SQLite one.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: Mutex<HashMap<String, Checkpoint>>,
    fail_next_advance: AtomicBool,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates a crash between a committed batch write and the checkpoint advance.
    pub fn fail_next_advance(&self) {
        self.fail_next_advance.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn get_checkpoint(&self, channel: &str) -> Result<Option<Checkpoint>> {
        Ok(lock(&self.checkpoints, "checkpoints")?.get(channel).cloned())
    }

    async fn advance_checkpoint(&self, channel: &str, cursor: Cursor, force: bool) -> Result<Checkpoint> {
        if self.fail_next_advance.swap(false, Ordering::SeqCst) {
            return Err(IngestError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "simulated checkpoint failure",
            )));
        }
        let mut cps = lock(&self.checkpoints, "checkpoints")?;
        if let Some(stored) = cps.get(channel) {
            if cursor == stored.cursor {
                return Ok(stored.clone());
            }
            if cursor < stored.cursor && !force {
                return Err(IngestError::InvalidCursor {
                    channel: channel.to_string(),
                    stored: stored.cursor.0,
                    attempted: cursor.0,
                });
            }
        }
        let cp = Checkpoint {
            channel: channel.to_string(),
            cursor,
            updated_at: Utc::now(),
        };
        cps.insert(channel.to_string(), cp.clone());
        Ok(cp)
    }

    async fn reset_checkpoint(&self, channel: &str) -> Result<()> {
        lock(&self.checkpoints, "checkpoints")?.remove(channel);
        Ok(())
    }
}

/// Scripted message source: serves configured messages oldest first and can
/// inject failures per channel.
#[derive(Default)]
pub struct InMemorySource {
    messages: Mutex<HashMap<String, Vec<SourceMessage>>>,
    media: Mutex<HashMap<String, Vec<u8>>>,
    failures: Mutex<HashMap<String, VecDeque<SourceError>>>,
    always_fail: Mutex<HashMap<String, SourceError>>,
    page_calls: AtomicUsize,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_messages(&self, channel: &str, msgs: Vec<SourceMessage>) {
        if let Ok(mut m) = self.messages.lock() {
            let entry = m.entry(channel.to_string()).or_default();
            entry.extend(msgs);
            entry.sort_by_key(|m| m.id);
        }
    }

    pub fn put_media(&self, url: &str, bytes: Vec<u8>) {
        if let Ok(mut m) = self.media.lock() {
            m.insert(url.to_string(), bytes);
        }
    }

    /// Queue errors returned by the next page requests for a channel, in order.
    pub fn fail_next(&self, channel: &str, errors: Vec<SourceError>) {
        if let Ok(mut f) = self.failures.lock() {
            f.entry(channel.to_string()).or_default().extend(errors);
        }
    }

    pub fn fail_always(&self, channel: &str, error: SourceError) {
        if let Ok(mut f) = self.always_fail.lock() {
            f.insert(channel.to_string(), error);
        }
    }

    pub fn page_calls(&self) -> usize {
        self.page_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageSource for InMemorySource {
    async fn fetch_page(
        &self,
        channel: &str,
        after: Option<Cursor>,
        limit: usize,
    ) -> std::result::Result<SourcePage, SourceError> {
        self.page_calls.fetch_add(1, Ordering::SeqCst);
        let poisoned = || SourceError::Permanent("source state poisoned".into());
        if let Some(err) = self.always_fail.lock().map_err(|_| poisoned())?.get(channel) {
            return Err(err.clone());
        }
        if let Some(err) = self
            .failures
            .lock()
            .map_err(|_| poisoned())?
            .get_mut(channel)
            .and_then(|q| q.pop_front())
        {
            return Err(err);
        }

        let msgs = self.messages.lock().map_err(|_| poisoned())?;
        let Some(all) = msgs.get(channel) else {
            return Err(SourceError::Permanent(format!("channel {channel} not found")));
        };
        let newer: Vec<&SourceMessage> = all
            .iter()
            .filter(|m| after.map_or(true, |c| m.id > c.0))
            .collect();
        let page: Vec<SourceMessage> = newer.iter().take(limit).map(|m| (*m).clone()).collect();
        let next_cursor = if newer.len() > page.len() {
            page.last().map(|m| m.id)
        } else {
            None
        };
        Ok(SourcePage {
            messages: page,
            next_cursor,
        })
    }

    async fn fetch_media(&self, media: &SourceMedia) -> std::result::Result<Vec<u8>, SourceError> {
        self.media
            .lock()
            .map_err(|_| SourceError::Permanent("source state poisoned".into()))?
            .get(&media.url)
            .cloned()
            .ok_or_else(|| SourceError::Permanent(format!("media {} not found", media.url)))
    }
}
