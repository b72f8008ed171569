//! SQLite-backed conversation store.
//!
//! Messages and metadata are stored as JSON rows via [`rusqlite`],
//! bridged to async through [`tokio::task::spawn_blocking`]. WAL journal
//! mode and a composite index on `(thread_id, id)` keep concurrent reads
//! efficient; a partial unique index on `(thread_id, message_id)` gives
//! the append path its idempotency.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{Connection, params};

use super::{ConversationStore, PersistedMessage, ThreadMetadata};
use crate::error::{AgentError, Result};

/// SQLite-backed [`ConversationStore`].
///
/// Cloneable via `Arc<Mutex<Connection>>`; multiple handles may share a
/// single database. Schema is auto-created on construction; all blocking
/// I/O runs on the tokio blocking thread pool.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Opens (or creates) a database at `path` and initializes the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| AgentError::store(format!("open: {e}")))?;
        Self::from_connection(conn)
    }

    /// Opens an ephemeral in-memory database (data lost on drop).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| AgentError::store(format!("open: {e}")))?;
        Self::from_connection(conn)
    }

    /// Wraps an existing [`Connection`], applying pragmas and schema setup.
    pub fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;\
             PRAGMA foreign_keys = ON;\
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(|e| AgentError::store(format!("pragma: {e}")))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS threads (
                thread_id  TEXT PRIMARY KEY,
                metadata   TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS messages (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                thread_id  TEXT NOT NULL,
                message_id TEXT,
                payload    TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_messages_thread
            ON messages (thread_id, id);

            CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_thread_message
            ON messages (thread_id, message_id)
            WHERE message_id IS NOT NULL;",
        )
        .map_err(|e| AgentError::store(format!("schema: {e}")))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Bridges a synchronous closure onto the tokio blocking thread pool.
    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> std::result::Result<T, rusqlite::Error> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|e| AgentError::store(format!("lock: {e}")))?;
            f(&guard).map_err(|e| AgentError::store(e.to_string()))
        })
        .await
        .map_err(|e| AgentError::store(format!("task: {e}")))?
    }
}

#[async_trait]
impl ConversationStore for SqliteStore {
    async fn append_messages(
        &self,
        thread_id: &str,
        messages: Vec<PersistedMessage>,
    ) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let thread_id = thread_id.to_owned();
        let rows: Vec<(Option<String>, String)> = messages
            .into_iter()
            .map(|stored| {
                let payload = serde_json::to_string(&stored.message)?;
                Ok((stored.message_id, payload))
            })
            .collect::<Result<_>>()?;

        self.blocking(move |conn| {
            let mut stmt = conn.prepare_cached(
                "INSERT OR IGNORE INTO messages (thread_id, message_id, payload) \
                 VALUES (?1, ?2, ?3)",
            )?;
            for (message_id, payload) in rows {
                stmt.execute(params![thread_id, message_id, payload])?;
            }
            Ok(())
        })
        .await
    }

    async fn load_messages(&self, thread_id: &str) -> Result<Vec<PersistedMessage>> {
        let thread_id = thread_id.to_owned();
        let rows = self
            .blocking(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT message_id, payload FROM messages \
                     WHERE thread_id = ?1 ORDER BY id ASC",
                )?;
                let rows = stmt
                    .query_map(params![thread_id], |row| {
                        Ok((
                            row.get::<_, Option<String>>(0)?,
                            row.get::<_, String>(1)?,
                        ))
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter()
            .map(|(message_id, payload)| {
                let message = serde_json::from_str(&payload)?;
                Ok(PersistedMessage {
                    message_id,
                    message,
                })
            })
            .collect()
    }

    async fn load_metadata(&self, thread_id: &str) -> Result<Option<ThreadMetadata>> {
        let thread_id = thread_id.to_owned();
        let row = self
            .blocking(move |conn| {
                let mut stmt =
                    conn.prepare_cached("SELECT metadata FROM threads WHERE thread_id = ?1")?;
                let mut rows = stmt.query(params![thread_id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row.get::<_, String>(0)?)),
                    None => Ok(None),
                }
            })
            .await?;

        row.map(|json| serde_json::from_str(&json).map_err(Into::into))
            .transpose()
    }

    async fn save_metadata(&self, thread_id: &str, metadata: ThreadMetadata) -> Result<()> {
        let thread_id = thread_id.to_owned();
        let json = serde_json::to_string(&metadata)?;
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO threads (thread_id, metadata, updated_at) \
                 VALUES (?1, ?2, datetime('now')) \
                 ON CONFLICT(thread_id) DO UPDATE SET \
                     metadata = excluded.metadata, \
                     updated_at = excluded.updated_at",
                params![thread_id, json],
            )?;
            Ok(())
        })
        .await
    }
}
