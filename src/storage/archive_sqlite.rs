/*!
SQLite archive

Durable implementation of the [`ArchiveStore`] trait over `sqlx`.

## Behavior

- On connect, the database file is created when missing, and embedded
  migrations (`sqlx::migrate!("./migrations")`) run when the default
  `sqlite-migrations` feature is enabled; disabling the feature assumes
  external migration orchestration.
- Message appends run in one transaction per batch: `INSERT OR IGNORE`
  against the unique `(session_id, content, timestamp)` index gives
  idempotency, then the session row's `message_count` is recomputed from
  the table and `last_activity_at` advanced.

## Schema

- `sessions(session_id PK, title, created_at, last_activity_at,
  message_count, metadata)`
- `messages(id PK, session_id FK, role CHECK IN ('user','model'),
  content, timestamp, tokens)` with the dedup unique index.

Timestamps are stored as RFC 3339 text except `messages.timestamp`, which
is the i64 nanosecond dedup component.
*/

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};
use tracing::instrument;

use super::archive::{ArchiveError, ArchiveStore, ArchivedMessage, Result, SessionRecord};
use crate::message::MessageRole;

/// SQLite-backed archive.
pub struct SqliteArchive {
    pool: Arc<SqlitePool>,
}

impl std::fmt::Debug for SqliteArchive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteArchive").finish()
    }
}

impl SqliteArchive {
    /// Connect (or create) a SQLite database at `database_url`, e.g.
    /// `sqlite://taskweft.db`.
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str) -> Result<Self> {
        // Ensure the underlying file exists before sqlx opens it.
        if let Some(path) = database_url.strip_prefix("sqlite://") {
            let path = path.trim();
            if !path.is_empty() && path != ":memory:" {
                let p = std::path::Path::new(path);
                if let Some(parent) = p.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                if !p.exists() {
                    // Ignore the result; sqlx will surface real problems.
                    let _ = std::fs::File::create_new(p);
                }
            }
        }
        let pool = SqlitePool::connect(database_url)
            .await
            .map_err(|e| ArchiveError::Backend {
                message: format!("connect error: {e}"),
            })?;
        #[cfg(feature = "sqlite-migrations")]
        {
            if let Err(e) = sqlx::migrate!("./migrations").run(&pool).await {
                return Err(ArchiveError::Backend {
                    message: format!("migration failure: {e}"),
                });
            }
        }
        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    fn backend<E: std::fmt::Display>(context: &str, e: E) -> ArchiveError {
        ArchiveError::Backend {
            message: format!("{context}: {e}"),
        }
    }

    fn session_from_row(row: &SqliteRow) -> Result<SessionRecord> {
        let created_at: String = row
            .try_get("created_at")
            .map_err(|e| Self::backend("read created_at", e))?;
        let last_activity_at: String = row
            .try_get("last_activity_at")
            .map_err(|e| Self::backend("read last_activity_at", e))?;
        Ok(SessionRecord {
            session_id: row
                .try_get("session_id")
                .map_err(|e| Self::backend("read session_id", e))?,
            title: row
                .try_get("title")
                .map_err(|e| Self::backend("read title", e))?,
            created_at: parse_timestamp(&created_at)?,
            last_activity_at: parse_timestamp(&last_activity_at)?,
            message_count: row
                .try_get("message_count")
                .map_err(|e| Self::backend("read message_count", e))?,
        })
    }

    fn message_from_row(row: &SqliteRow) -> Result<ArchivedMessage> {
        let role: String = row
            .try_get("role")
            .map_err(|e| Self::backend("read role", e))?;
        let role = match role.as_str() {
            "user" => MessageRole::User,
            "model" => MessageRole::Model,
            other => {
                return Err(ArchiveError::Backend {
                    message: format!("unknown role in archive: {other}"),
                });
            }
        };
        Ok(ArchivedMessage {
            session_id: row
                .try_get("session_id")
                .map_err(|e| Self::backend("read session_id", e))?,
            role,
            content: row
                .try_get("content")
                .map_err(|e| Self::backend("read content", e))?,
            timestamp: row
                .try_get("timestamp")
                .map_err(|e| Self::backend("read timestamp", e))?,
            tokens: row
                .try_get("tokens")
                .map_err(|e| Self::backend("read tokens", e))?,
        })
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ArchiveError::Backend {
            message: format!("bad timestamp '{raw}': {e}"),
        })
}

#[async_trait]
impl ArchiveStore for SqliteArchive {
    #[instrument(skip(self), err)]
    async fn ensure_session(
        &self,
        session_id: &str,
        title: Option<&str>,
    ) -> Result<SessionRecord> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO sessions (session_id, title, created_at, last_activity_at, message_count)
            VALUES (?1, ?2, ?3, ?3, 0)
            "#,
        )
        .bind(session_id)
        .bind(title.unwrap_or("Untitled session"))
        .bind(&now)
        .execute(&*self.pool)
        .await
        .map_err(|e| Self::backend("insert session", e))?;

        let row = sqlx::query("SELECT * FROM sessions WHERE session_id = ?1")
            .bind(session_id)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| Self::backend("fetch session", e))?;
        Self::session_from_row(&row)
    }

    #[instrument(skip(self, batch), fields(batch = batch.len()), err)]
    async fn append_messages(&self, batch: &[ArchivedMessage]) -> Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Self::backend("tx begin", e))?;

        let now = Utc::now().to_rfc3339();
        let mut inserted = 0usize;
        for message in batch {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO sessions (session_id, title, created_at, last_activity_at, message_count)
                VALUES (?1, 'Untitled session', ?2, ?2, 0)
                "#,
            )
            .bind(&message.session_id)
            .bind(&now)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::backend("ensure session", e))?;

            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO messages (session_id, role, content, timestamp, tokens)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
            )
            .bind(&message.session_id)
            .bind(message.role.as_str())
            .bind(&message.content)
            .bind(message.timestamp)
            .bind(message.tokens)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::backend("insert message", e))?;
            inserted += result.rows_affected() as usize;

            sqlx::query(
                r#"
                UPDATE sessions
                SET message_count = (SELECT COUNT(*) FROM messages WHERE session_id = ?1),
                    last_activity_at = ?2
                WHERE session_id = ?1
                "#,
            )
            .bind(&message.session_id)
            .bind(&now)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::backend("update session counters", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| Self::backend("tx commit", e))?;
        Ok(inserted)
    }

    async fn messages(&self, session_id: &str) -> Result<Vec<ArchivedMessage>> {
        let rows = sqlx::query(
            "SELECT session_id, role, content, timestamp, tokens
             FROM messages WHERE session_id = ?1 ORDER BY timestamp ASC, id ASC",
        )
        .bind(session_id)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| Self::backend("fetch messages", e))?;
        rows.iter().map(Self::message_from_row).collect()
    }

    async fn sessions(&self) -> Result<Vec<SessionRecord>> {
        let rows = sqlx::query("SELECT * FROM sessions ORDER BY last_activity_at DESC")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| Self::backend("fetch sessions", e))?;
        rows.iter().map(Self::session_from_row).collect()
    }

    async fn session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let row = sqlx::query("SELECT * FROM sessions WHERE session_id = ?1")
            .bind(session_id)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| Self::backend("fetch session", e))?;
        row.as_ref().map(Self::session_from_row).transpose()
    }

    async fn rename_session(&self, session_id: &str, title: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE sessions SET title = ?2 WHERE session_id = ?1")
            .bind(session_id)
            .bind(title)
            .execute(&*self.pool)
            .await
            .map_err(|e| Self::backend("rename session", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_session(&self, session_id: &str) -> Result<bool> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Self::backend("tx begin", e))?;
        sqlx::query("DELETE FROM messages WHERE session_id = ?1")
            .bind(session_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::backend("delete messages", e))?;
        let result = sqlx::query("DELETE FROM sessions WHERE session_id = ?1")
            .bind(session_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::backend("delete session", e))?;
        tx.commit()
            .await
            .map_err(|e| Self::backend("tx commit", e))?;
        Ok(result.rows_affected() > 0)
    }
}
