//! Durable state: channel directory, per-channel checkpoints, and the
//! insert-if-absent message/reaction sink.
//!
//! A single SQLite connection sits behind a mutex, so concurrent ingestors
//! share it with serialized access. Every call runs on the blocking pool.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};

use crate::model::{
    ChannelInfo, ChannelStatus, MessageRecord, Position, ProcessingStatus, ProgressCheckpoint,
    ProgressUpdate, ReactionRecord,
};
use crate::{AppError, Result};

const MIGRATIONS: &[&str] = &[r#"
    CREATE TABLE IF NOT EXISTS channels (
      channel_id TEXT PRIMARY KEY,
      channel_name TEXT,
      is_private INTEGER NOT NULL DEFAULT 0,
      is_archived INTEGER NOT NULL DEFAULT 0,
      created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
      updated_at TEXT
    );

    CREATE TABLE IF NOT EXISTS progress (
      channel_id TEXT PRIMARY KEY,
      last_message_ts TEXT,
      last_thread_ts TEXT,
      is_completed INTEGER NOT NULL DEFAULT 0,
      started_at TEXT,
      updated_at TEXT
    );

    CREATE TABLE IF NOT EXISTS messages (
      message_id TEXT PRIMARY KEY,
      channel_id TEXT NOT NULL,
      user_id TEXT,
      ts TEXT NOT NULL,
      is_reply INTEGER NOT NULL DEFAULT 0,
      parent_message_id TEXT,
      created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
      UNIQUE (channel_id, ts)
    );

    CREATE INDEX IF NOT EXISTS idx_messages_channel ON messages(channel_id);

    CREATE TABLE IF NOT EXISTS reactions (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      message_id TEXT NOT NULL REFERENCES messages(message_id),
      reaction_name TEXT NOT NULL,
      user_id TEXT NOT NULL,
      ts TEXT,
      created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
      UNIQUE (message_id, reaction_name, user_id)
    );
"#];

/// Durable per-channel resume markers.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    async fn read(&self, channel_id: &str) -> Result<Option<ProgressCheckpoint>>;

    /// Upsert; fields left `None` in `update` keep their stored value.
    async fn write(&self, channel_id: &str, update: ProgressUpdate) -> Result<()>;
}

/// Idempotent batch writer for harvested rows.
#[async_trait]
pub trait ReactionSink: Send + Sync {
    /// Insert rows whose keys are absent, all-or-nothing per call.
    async fn write_batch(
        &self,
        messages: &[MessageRecord],
        reactions: &[ReactionRecord],
    ) -> Result<()>;

    /// Record a channel id so status reporting can join on it.
    async fn ensure_channel(&self, channel_id: &str) -> Result<()>;
}

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(10))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL; \
             PRAGMA synchronous = NORMAL; \
             PRAGMA foreign_keys = ON;",
        )?;
        apply_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        apply_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .map_err(|e| AppError::Join(e.to_string()))?
    }

    /// Full-refresh upsert of the channel directory.
    pub async fn upsert_channels(&self, channels: Vec<ChannelInfo>) -> Result<usize> {
        self.with_conn(move |conn| {
            let now = Utc::now().to_rfc3339();
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO channels \
                     (channel_id, channel_name, is_private, is_archived, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5) \
                     ON CONFLICT(channel_id) DO UPDATE SET \
                       channel_name = excluded.channel_name, \
                       is_private = excluded.is_private, \
                       is_archived = excluded.is_archived, \
                       updated_at = excluded.updated_at",
                )?;
                for channel in &channels {
                    stmt.execute(params![
                        channel.id,
                        channel.name,
                        channel.is_private,
                        channel.is_archived,
                        now
                    ])?;
                }
            }
            tx.commit()?;
            Ok(channels.len())
        })
        .await
    }

    /// Synced, non-archived channels ordered by name.
    pub async fn list_channels(&self) -> Result<Vec<ChannelInfo>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT channel_id, COALESCE(channel_name, 'unknown'), is_private, is_archived \
                 FROM channels \
                 WHERE is_archived = 0 AND channel_name IS NOT NULL \
                 ORDER BY channel_name",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(ChannelInfo {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    is_private: row.get(2)?,
                    is_archived: row.get(3)?,
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    /// Forget a channel's checkpoint so the next run fetches it again.
    pub async fn reset_progress(&self, channel_id: &str) -> Result<bool> {
        let channel_id = channel_id.to_string();
        self.with_conn(move |conn| {
            let removed = conn.execute("DELETE FROM progress WHERE channel_id = ?1", [channel_id])?;
            Ok(removed > 0)
        })
        .await
    }

    pub async fn get_processing_status(&self) -> Result<ProcessingStatus> {
        self.with_conn(|conn| {
            let completed = query_status(conn, true)?;
            let in_progress = query_status(conn, false)?;
            Ok(ProcessingStatus {
                completed,
                in_progress,
            })
        })
        .await
    }

    pub async fn message_count(&self, channel_id: &str) -> Result<u64> {
        let channel_id = channel_id.to_string();
        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE channel_id = ?1",
                [channel_id],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
        .await
    }

    pub async fn reaction_count(&self, channel_id: &str) -> Result<u64> {
        let channel_id = channel_id.to_string();
        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM reactions r \
                 JOIN messages m ON m.message_id = r.message_id \
                 WHERE m.channel_id = ?1",
                [channel_id],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
        .await
    }
}

fn apply_migrations(conn: &Connection) -> Result<()> {
    let current_version: i64 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
    let mut version = current_version as usize;
    for (idx, sql) in MIGRATIONS.iter().enumerate() {
        let next_version = idx + 1;
        if next_version <= version {
            continue;
        }
        conn.execute_batch(sql)?;
        conn.execute_batch(&format!("PRAGMA user_version = {};", next_version))?;
        version = next_version;
    }
    Ok(())
}

fn query_status(conn: &Connection, completed: bool) -> Result<Vec<ChannelStatus>> {
    let order = if completed {
        "reaction_count DESC"
    } else {
        "p.updated_at DESC"
    };
    let sql = format!(
        "SELECT p.channel_id, c.channel_name, COUNT(DISTINCT r.id) AS reaction_count, p.updated_at \
         FROM progress p \
         LEFT JOIN channels c ON c.channel_id = p.channel_id \
         LEFT JOIN messages m ON m.channel_id = p.channel_id \
         LEFT JOIN reactions r ON r.message_id = m.message_id \
         WHERE p.is_completed = ?1 \
         GROUP BY p.channel_id \
         ORDER BY {}",
        order
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([completed], |row| {
        let name: Option<String> = row.get(1)?;
        let count: i64 = row.get(2)?;
        Ok(ChannelStatus {
            channel_id: row.get(0)?,
            display_name: name.unwrap_or_else(|| "Unknown".to_string()),
            reaction_row_count: count as u64,
            last_updated: row.get(3)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

#[async_trait]
impl ProgressStore for SqliteStore {
    async fn read(&self, channel_id: &str) -> Result<Option<ProgressCheckpoint>> {
        let channel_id = channel_id.to_string();
        self.with_conn(move |conn| {
            let checkpoint = conn
                .query_row(
                    "SELECT channel_id, last_message_ts, last_thread_ts, is_completed, \
                     started_at, updated_at \
                     FROM progress WHERE channel_id = ?1",
                    [&channel_id],
                    |row| {
                        let message: Option<String> = row.get(1)?;
                        let thread: Option<String> = row.get(2)?;
                        Ok(ProgressCheckpoint {
                            channel_id: row.get(0)?,
                            last_message_position: message.map(Position::new),
                            last_thread_position: thread.map(Position::new),
                            completed: row.get(3)?,
                            started_at: row.get(4)?,
                            updated_at: row.get(5)?,
                        })
                    },
                )
                .optional()?;
            Ok(checkpoint)
        })
        .await
    }

    async fn write(&self, channel_id: &str, update: ProgressUpdate) -> Result<()> {
        let channel_id = channel_id.to_string();
        self.with_conn(move |conn| {
            let now = Utc::now().to_rfc3339();
            let message = update.last_message_position.map(|p| p.as_str().to_string());
            let thread = update.last_thread_position.map(|p| p.as_str().to_string());
            conn.execute(
                "INSERT INTO progress \
                 (channel_id, last_message_ts, last_thread_ts, is_completed, \
                 started_at, updated_at) \
                 VALUES (?1, ?2, ?3, COALESCE(?4, 0), ?5, ?5) \
                 ON CONFLICT(channel_id) DO UPDATE SET \
                   last_message_ts = COALESCE(excluded.last_message_ts, progress.last_message_ts), \
                   last_thread_ts = COALESCE(excluded.last_thread_ts, progress.last_thread_ts), \
                   is_completed = COALESCE(?4, progress.is_completed), \
                   updated_at = excluded.updated_at",
                params![channel_id, message, thread, update.completed, now],
            )?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl ReactionSink for SqliteStore {
    async fn write_batch(
        &self,
        messages: &[MessageRecord],
        reactions: &[ReactionRecord],
    ) -> Result<()> {
        if messages.is_empty() && reactions.is_empty() {
            return Ok(());
        }
        let messages = messages.to_vec();
        let reactions = reactions.to_vec();
        self.with_conn(move |conn| {
            // Dropping the transaction on an early return rolls it back.
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT OR IGNORE INTO messages \
                     (message_id, channel_id, user_id, ts, is_reply, parent_message_id) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )?;
                for message in &messages {
                    stmt.execute(params![
                        message.id,
                        message.channel_id,
                        message.author_id,
                        message.position.as_str(),
                        message.is_reply,
                        message.parent_message_id,
                    ])?;
                }

                let mut stmt = tx.prepare_cached(
                    "INSERT OR IGNORE INTO reactions (message_id, reaction_name, user_id, ts) \
                     VALUES (?1, ?2, ?3, ?4)",
                )?;
                for reaction in &reactions {
                    stmt.execute(params![
                        reaction.message_id,
                        reaction.emoji_name,
                        reaction.user_id,
                        reaction.position.as_str(),
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn ensure_channel(&self, channel_id: &str) -> Result<()> {
        let channel_id = channel_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO channels (channel_id) VALUES (?1)",
                [channel_id],
            )?;
            Ok(())
        })
        .await
    }
}
