//! SQLite warehouse holding the `raw.*` tables consumed by the transformation layer.

use crate::error::{IngestError, Result};
use crate::idempotency::record_checksum;
use crate::types::{DetectionRecord, MediaType, PendingMedia, RawMessageRecord};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS raw.messages (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        channel         TEXT NOT NULL,
        external_id     INTEGER NOT NULL,
        text            TEXT,
        media_path      TEXT,
        media_type      TEXT,
        posted_at       TEXT NOT NULL,
        scraped_at      TEXT NOT NULL,
        raw_payload     TEXT NOT NULL,
        content_sha256  TEXT NOT NULL,
        loaded_at       TEXT NOT NULL,
        UNIQUE (channel, external_id)
    );
    CREATE TABLE IF NOT EXISTS raw.detections (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        channel      TEXT NOT NULL,
        external_id  INTEGER NOT NULL,
        label        TEXT NOT NULL,
        confidence   REAL NOT NULL CHECK (confidence >= 0.0 AND confidence <= 1.0),
        detected_at  TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS raw.idx_detections_message ON detections (channel, external_id);
    CREATE TABLE IF NOT EXISTS raw.enrichment_state (
        channel      TEXT NOT NULL,
        external_id  INTEGER NOT NULL,
        enriched_at  TEXT,
        attempts     INTEGER NOT NULL DEFAULT 0,
        last_error   TEXT,
        PRIMARY KEY (channel, external_id)
    );
    CREATE TABLE IF NOT EXISTS raw.load_manifest (
        partition          TEXT PRIMARY KEY,
        content_sha256     TEXT NOT NULL,
        loaded_at          TEXT NOT NULL,
        inserted           INTEGER NOT NULL,
        updated            INTEGER NOT NULL,
        skipped_duplicate  INTEGER NOT NULL,
        skipped_invalid    INTEGER NOT NULL
    );
"#;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UpsertCounts {
    pub inserted: usize,
    pub updated: usize,
    pub skipped_duplicate: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnrichmentState {
    pub enriched_at: Option<String>,
    pub attempts: i64,
    pub last_error: Option<String>,
}

/// One warehouse connection shared by the loader and the enrichment worker.
/// Every public method runs in its own short transaction.
pub struct Warehouse {
    conn: Mutex<Connection>,
}

impl Warehouse {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let location = path
            .to_str()
            .ok_or_else(|| IngestError::Config(format!("non UTF-8 warehouse path {}", path.display())))?;
        Self::attach(location)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::attach(":memory:")
    }

    fn attach(location: &str) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("ATTACH DATABASE ?1 AS raw", params![location])?;
        conn.execute_batch("PRAGMA raw.journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| IngestError::LockPoisoned("warehouse"))
    }

    /// Checksum of the partition contents last loaded, if any.
    pub fn manifest_checksum(&self, partition: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT content_sha256 FROM raw.load_manifest WHERE partition = ?1",
                params![partition],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Upsert one partition's records and its manifest entry in a single transaction.
    ///
    /// Rows are keyed by (channel, external_id). A row is rewritten only when the
    /// incoming version is newer: later `scraped_at`, ties broken by checksum. Older
    /// or identical versions count as duplicates, so load order does not matter.
    pub fn upsert_partition(
        &self,
        partition: &str,
        content_sha256: &str,
        records: &[RawMessageRecord],
        skipped_invalid: usize,
    ) -> Result<UpsertCounts> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut counts = UpsertCounts::default();
        let now = Utc::now().to_rfc3339();
        {
            let mut existing = tx.prepare_cached(
                "SELECT content_sha256, media_path, scraped_at FROM raw.messages WHERE channel = ?1 AND external_id = ?2",
            )?;
            let mut insert = tx.prepare_cached(
                "INSERT INTO raw.messages
                    (channel, external_id, text, media_path, media_type, posted_at, scraped_at, raw_payload, content_sha256, loaded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT (channel, external_id) DO NOTHING",
            )?;
            let mut update = tx.prepare_cached(
                "UPDATE raw.messages
                    SET text = ?3, media_path = ?4, media_type = ?5, posted_at = ?6, scraped_at = ?7,
                        raw_payload = ?8, content_sha256 = ?9, loaded_at = ?10
                  WHERE channel = ?1 AND external_id = ?2",
            )?;
            let mut clear_enrichment = tx.prepare_cached(
                "DELETE FROM raw.enrichment_state WHERE channel = ?1 AND external_id = ?2",
            )?;

            for record in records {
                let checksum = record_checksum(record);
                let current: Option<(String, Option<String>, String)> = existing
                    .query_row(params![record.channel, record.external_id], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                    })
                    .optional()?;
                let values = params![
                    record.channel,
                    record.external_id,
                    record.text,
                    record.media_path,
                    record.media_type.map(|m| m.as_str()),
                    record.posted_at.to_rfc3339(),
                    record.scraped_at.to_rfc3339(),
                    record.raw_payload.0.to_string(),
                    checksum,
                    now,
                ];
                match current {
                    None => {
                        insert.execute(values)?;
                        counts.inserted += 1;
                    }
                    Some((stored, _, stored_scraped))
                        if !supersedes(record.scraped_at, &checksum, &stored_scraped, &stored) =>
                    {
                        counts.skipped_duplicate += 1;
                    }
                    Some((_, stored_media, _)) => {
                        update.execute(values)?;
                        if stored_media != record.media_path {
                            // detections belong to the old media; make the message eligible again
                            clear_enrichment.execute(params![record.channel, record.external_id])?;
                        }
                        counts.updated += 1;
                    }
                }
            }
        }
        tx.execute(
            "INSERT INTO raw.load_manifest
                (partition, content_sha256, loaded_at, inserted, updated, skipped_duplicate, skipped_invalid)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (partition) DO UPDATE SET
                content_sha256 = excluded.content_sha256, loaded_at = excluded.loaded_at,
                inserted = excluded.inserted, updated = excluded.updated,
                skipped_duplicate = excluded.skipped_duplicate, skipped_invalid = excluded.skipped_invalid",
            params![
                partition,
                content_sha256,
                now,
                counts.inserted as i64,
                counts.updated as i64,
                counts.skipped_duplicate as i64,
                skipped_invalid as i64,
            ],
        )?;
        tx.commit()?;
        debug!(
            "Partition {} committed: {} inserted, {} updated, {} unchanged",
            partition, counts.inserted, counts.updated, counts.skipped_duplicate
        );
        Ok(counts)
    }

    /// Messages with media and no successful enrichment yet, least-attempted first.
    pub fn pending_media(&self, limit: usize) -> Result<Vec<PendingMedia>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT m.channel, m.external_id, m.media_path, m.media_type
               FROM raw.messages m
               LEFT JOIN raw.enrichment_state e
                 ON e.channel = m.channel AND e.external_id = m.external_id
              WHERE m.media_path IS NOT NULL AND e.enriched_at IS NULL
              ORDER BY COALESCE(e.attempts, 0), m.posted_at, m.channel, m.external_id
              LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            let media_type: Option<String> = row.get(3)?;
            Ok(PendingMedia {
                channel: row.get(0)?,
                external_id: row.get(1)?,
                media_path: row.get(2)?,
                media_type: media_type.as_deref().and_then(MediaType::parse),
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Replace the message's detections and mark it enriched.
    pub fn record_detections(
        &self,
        channel: &str,
        external_id: i64,
        detections: &[DetectionRecord],
    ) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM raw.detections WHERE channel = ?1 AND external_id = ?2",
            params![channel, external_id],
        )?;
        {
            let mut insert = tx.prepare_cached(
                "INSERT INTO raw.detections (channel, external_id, label, confidence, detected_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for d in detections {
                insert.execute(params![
                    d.channel,
                    d.external_id,
                    d.label,
                    d.confidence,
                    d.detected_at.to_rfc3339()
                ])?;
            }
        }
        tx.execute(
            "INSERT INTO raw.enrichment_state (channel, external_id, enriched_at, attempts, last_error)
             VALUES (?1, ?2, ?3, 1, NULL)
             ON CONFLICT (channel, external_id) DO UPDATE SET
                enriched_at = excluded.enriched_at, attempts = attempts + 1, last_error = NULL",
            params![channel, external_id, Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Count a failed attempt without setting the enrichment marker.
    pub fn record_enrichment_failure(&self, channel: &str, external_id: i64, error: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO raw.enrichment_state (channel, external_id, enriched_at, attempts, last_error)
             VALUES (?1, ?2, NULL, 1, ?3)
             ON CONFLICT (channel, external_id) DO UPDATE SET
                attempts = attempts + 1, last_error = excluded.last_error",
            params![channel, external_id, error],
        )?;
        Ok(())
    }

    pub fn enrichment_state(&self, channel: &str, external_id: i64) -> Result<Option<EnrichmentState>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT enriched_at, attempts, last_error FROM raw.enrichment_state
                  WHERE channel = ?1 AND external_id = ?2",
                params![channel, external_id],
                |row| {
                    Ok(EnrichmentState {
                        enriched_at: row.get(0)?,
                        attempts: row.get(1)?,
                        last_error: row.get(2)?,
                    })
                },
            )
            .optional()?)
    }

    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn()?.execute_batch(sql)?;
        Ok(())
    }

    pub fn message_count(&self) -> Result<i64> {
        let conn = self.conn()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM raw.messages", [], |row| row.get(0))?)
    }

    pub fn detection_count(&self, channel: &str, external_id: i64) -> Result<i64> {
        let conn = self.conn()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM raw.detections WHERE channel = ?1 AND external_id = ?2",
            params![channel, external_id],
            |row| row.get(0),
        )?)
    }

    /// (channel, external_id, content checksum) for every row, ordered; used to compare warehouse states.
    pub fn message_fingerprints(&self) -> Result<Vec<(String, i64, String)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT channel, external_id, content_sha256 FROM raw.messages ORDER BY channel, external_id",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

/// Whether an incoming version replaces the stored one.
fn supersedes(scraped_at: DateTime<Utc>, checksum: &str, stored_scraped: &str, stored_checksum: &str) -> bool {
    if checksum == stored_checksum {
        return false;
    }
    match DateTime::parse_from_rfc3339(stored_scraped) {
        Ok(stored) => {
            let stored = stored.with_timezone(&Utc);
            scraped_at > stored || (scraped_at == stored && checksum > stored_checksum)
        }
        Err(_) => true,
    }
}
