use crate::app::ports::CheckpointStore;
use crate::error::{IngestError, Result};
use crate::types::{Checkpoint, Cursor};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

/// SQLite-backed ingest metadata: per-channel checkpoints.
pub struct IngestMeta {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = r#"
    PRAGMA journal_mode=WAL;
    PRAGMA synchronous=FULL;
    CREATE TABLE IF NOT EXISTS channel_checkpoints (
        channel     TEXT PRIMARY KEY,
        cursor      INTEGER NOT NULL,
        updated_at  TEXT NOT NULL
    );
"#;

impl IngestMeta {
    pub fn open_at_root<P: AsRef<Path>>(data_root: P) -> Result<Self> {
        let db_path = data_root.as_ref().join("ingest_meta.db");
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(Connection::open(db_path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| IngestError::LockPoisoned("ingest meta"))
    }

    pub fn list_checkpoints(&self) -> Result<Vec<Checkpoint>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT channel, cursor, updated_at FROM channel_checkpoints ORDER BY channel",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (channel, cursor, updated_at) = row?;
            out.push(to_checkpoint(channel, cursor, &updated_at));
        }
        Ok(out)
    }
}

fn to_checkpoint(channel: String, cursor: i64, updated_at: &str) -> Checkpoint {
    let updated_at = DateTime::parse_from_rfc3339(updated_at)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| {
            warn!("Unparseable checkpoint timestamp for {}: {}", channel, updated_at);
            DateTime::<Utc>::UNIX_EPOCH
        });
    Checkpoint {
        channel,
        cursor: Cursor(cursor),
        updated_at,
    }
}

#[async_trait]
impl CheckpointStore for IngestMeta {
    async fn get_checkpoint(&self, channel: &str) -> Result<Option<Checkpoint>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT cursor, updated_at FROM channel_checkpoints WHERE channel = ?1",
                params![channel],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;
        Ok(row.map(|(cursor, updated_at)| to_checkpoint(channel.to_string(), cursor, &updated_at)))
    }

    async fn advance_checkpoint(&self, channel: &str, cursor: Cursor, force: bool) -> Result<Checkpoint> {
        let mut conn = self.conn()?;
        // IMMEDIATE takes the write lock up front so the compare and the set
        // cannot interleave with another process advancing the same channel.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let stored = tx
            .query_row(
                "SELECT cursor, updated_at FROM channel_checkpoints WHERE channel = ?1",
                params![channel],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;

        if let Some((stored_cursor, updated_at)) = stored {
            if cursor.0 == stored_cursor {
                return Ok(to_checkpoint(channel.to_string(), stored_cursor, &updated_at));
            }
            if cursor.0 < stored_cursor && !force {
                return Err(IngestError::InvalidCursor {
                    channel: channel.to_string(),
                    stored: stored_cursor,
                    attempted: cursor.0,
                });
            }
            if cursor.0 < stored_cursor {
                warn!(
                    "Force-resetting checkpoint for {} from {} to {}",
                    channel, stored_cursor, cursor
                );
            }
        }

        let now = Utc::now();
        tx.execute(
            "INSERT INTO channel_checkpoints (channel, cursor, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(channel) DO UPDATE SET cursor=excluded.cursor, updated_at=excluded.updated_at",
            params![channel, cursor.0, now.to_rfc3339()],
        )?;
        tx.commit()?;
        debug!("Checkpoint for {} advanced to {}", channel, cursor);
        Ok(Checkpoint {
            channel: channel.to_string(),
            cursor,
            updated_at: now,
        })
    }

    async fn reset_checkpoint(&self, channel: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM channel_checkpoints WHERE channel = ?1",
            params![channel],
        )?;
        warn!("Checkpoint for {} reset", channel);
        Ok(())
    }
}
