//! SQLite-backed state ledger for folder checkpoints and per-message lifecycle
//! (spec.md §4.3). Grounded on the teacher's `SqlitePool`/`QueryBuilder` idiom
//! and original `storage/state_db.py` for exact columns, pragmas, and the
//! CASE-based status-reset-on-upsert rule.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use crate::types::{now_ts, FolderRow, MessageRow, MessageStatus};

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    path: PathBuf,
}

impl Database {
    pub async fn open(sqlite_path: &Path) -> Result<Self> {
        if let Some(parent) = sqlite_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating data directory {}", parent.display()))?;
        }
        let url = format!("sqlite://{}?mode=rwc", sqlite_path.display());

        let pool = SqlitePool::connect(&url)
            .await
            .with_context(|| format!("connecting to sqlite at {}", sqlite_path.display()))?;

        let db = Database {
            pool,
            path: sqlite_path.to_path_buf(),
        };
        db.migrate().await?;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query("PRAGMA journal_mode = WAL;")
            .execute(&self.pool)
            .await
            .context("enabling WAL journal mode")?;
        sqlx::query("PRAGMA synchronous = NORMAL;")
            .execute(&self.pool)
            .await
            .context("setting synchronous=NORMAL")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS folders (
                name TEXT PRIMARY KEY,
                uidvalidity INTEGER,
                last_uid_seen INTEGER,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("creating folders table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                folder TEXT NOT NULL,
                uid INTEGER NOT NULL,
                uidvalidity INTEGER,
                status TEXT NOT NULL,
                message_id_norm TEXT,
                fingerprint TEXT NOT NULL,
                eml_path TEXT,
                eml_sha256 TEXT,
                size_bytes INTEGER,
                sink_message_id TEXT,
                sink_thread_id TEXT,
                labels_json TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                last_error_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(folder, uid, uidvalidity)
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("creating messages table")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_status ON messages(status);")
            .execute(&self.pool)
            .await
            .context("creating status index")?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_msgid ON messages(message_id_norm);")
            .execute(&self.pool)
            .await
            .context("creating message-id index")?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_fingerprint ON messages(fingerprint);",
        )
        .execute(&self.pool)
        .await
        .context("creating fingerprint index")?;

        sqlx::query("PRAGMA user_version = 1;")
            .execute(&self.pool)
            .await
            .context("setting schema version")?;

        Ok(())
    }

    pub async fn upsert_folder(
        &self,
        name: &str,
        uidvalidity: Option<u32>,
        last_uid_seen: Option<u32>,
    ) -> Result<FolderRow> {
        let now = now_ts();
        sqlx::query(
            r#"
            INSERT INTO folders(name, uidvalidity, last_uid_seen, created_at, updated_at)
            VALUES(?, ?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
              uidvalidity=excluded.uidvalidity,
              last_uid_seen=excluded.last_uid_seen,
              updated_at=excluded.updated_at
            "#,
        )
        .bind(name)
        .bind(uidvalidity.map(|v| v as i64))
        .bind(last_uid_seen.map(|v| v as i64))
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("upserting folder")?;

        self.get_folder(name)
            .await?
            .context("folder row missing immediately after upsert")
    }

    pub async fn get_folder(&self, name: &str) -> Result<Option<FolderRow>> {
        let row = sqlx::query(
            "SELECT name, uidvalidity, last_uid_seen, created_at, updated_at FROM folders WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .context("fetching folder")?;

        Ok(row.map(|row| FolderRow {
            name: row.get::<String, _>(0),
            uidvalidity: row.get::<Option<i64>, _>(1).map(|v| v as u32),
            last_uid_seen: row.get::<Option<i64>, _>(2).map(|v| v as u32),
            created_at: parse_dt(&row.get::<String, _>(3)),
            updated_at: parse_dt(&row.get::<String, _>(4)),
        }))
    }

    pub async fn update_folder_checkpoint(
        &self,
        name: &str,
        uidvalidity: Option<u32>,
        last_uid_seen: Option<u32>,
    ) -> Result<()> {
        self.upsert_folder(name, uidvalidity, last_uid_seen).await?;
        Ok(())
    }

    /// Insert a newly discovered message, or touch an existing row. A prior
    /// `skipped_filtered` or `failed` status resets to `discovered` (a retry
    /// opportunity); any other status (including `imported`) is preserved.
    pub async fn upsert_message_discovered(
        &self,
        folder: &str,
        uid: u32,
        uidvalidity: Option<u32>,
        message_id_norm: Option<&str>,
        fingerprint: &str,
        size_bytes: Option<u32>,
    ) -> Result<MessageRow> {
        let now = now_ts();
        sqlx::query(
            r#"
            INSERT INTO messages(
              folder, uid, uidvalidity, status, message_id_norm, fingerprint,
              size_bytes, created_at, updated_at
            )
            VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(folder, uid, uidvalidity) DO UPDATE SET
              message_id_norm=excluded.message_id_norm,
              fingerprint=excluded.fingerprint,
              size_bytes=excluded.size_bytes,
              updated_at=excluded.updated_at,
              status=CASE
                WHEN status IN ('skipped_filtered', 'failed') THEN 'discovered'
                ELSE status
              END
            "#,
        )
        .bind(folder)
        .bind(uid as i64)
        .bind(uidvalidity.map(|v| v as i64))
        .bind(MessageStatus::Discovered.as_str())
        .bind(message_id_norm)
        .bind(fingerprint)
        .bind(size_bytes.map(|v| v as i64))
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("upserting discovered message")?;

        self.get_message_by_identity(folder, uid, uidvalidity)
            .await?
            .context("message row missing immediately after upsert")
    }

    async fn get_message_by_identity(
        &self,
        folder: &str,
        uid: u32,
        uidvalidity: Option<u32>,
    ) -> Result<Option<MessageRow>> {
        let row = sqlx::query(
            "SELECT * FROM messages WHERE folder = ? AND uid = ? AND uidvalidity IS ?",
        )
        .bind(folder)
        .bind(uid as i64)
        .bind(uidvalidity.map(|v| v as i64))
        .fetch_optional(&self.pool)
        .await
        .context("fetching message by identity")?;

        Ok(row.map(|r| row_to_message(&r)))
    }

    pub async fn get_message(&self, message_id: i64) -> Result<Option<MessageRow>> {
        let row = sqlx::query("SELECT * FROM messages WHERE id = ?")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await
            .context("fetching message by id")?;
        Ok(row.map(|r| row_to_message(&r)))
    }

    pub async fn mark_downloaded(
        &self,
        message_id: i64,
        eml_path: &Path,
        eml_sha256: &str,
    ) -> Result<()> {
        let now = now_ts();
        sqlx::query(
            "UPDATE messages SET status = ?, eml_path = ?, eml_sha256 = ?, updated_at = ? WHERE id = ?",
        )
        .bind(MessageStatus::Downloaded.as_str())
        .bind(eml_path.to_string_lossy().to_string())
        .bind(eml_sha256)
        .bind(now.to_rfc3339())
        .bind(message_id)
        .execute(&self.pool)
        .await
        .context("marking message downloaded")?;
        Ok(())
    }

    pub async fn mark_imported(
        &self,
        message_id: i64,
        sink_message_id: &str,
        sink_thread_id: Option<&str>,
        label_ids: &[String],
    ) -> Result<()> {
        let now = now_ts();
        let labels_json = serde_json::to_string(label_ids).unwrap_or_else(|_| "[]".to_string());
        sqlx::query(
            r#"
            UPDATE messages
            SET status = ?, sink_message_id = ?, sink_thread_id = ?, labels_json = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(MessageStatus::Imported.as_str())
        .bind(sink_message_id)
        .bind(sink_thread_id)
        .bind(labels_json)
        .bind(now.to_rfc3339())
        .bind(message_id)
        .execute(&self.pool)
        .await
        .context("marking message imported")?;
        Ok(())
    }

    pub async fn mark_failed(&self, message_id: i64, error: &str) -> Result<()> {
        let now = now_ts();
        sqlx::query(
            r#"
            UPDATE messages
            SET status = ?, attempts = attempts + 1, last_error = ?, last_error_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(MessageStatus::Failed.as_str())
        .bind(error)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(message_id)
        .execute(&self.pool)
        .await
        .context("marking message failed")?;
        Ok(())
    }

    pub async fn mark_skipped_duplicate(&self, message_id: i64, reason: &str) -> Result<()> {
        self.mark_skipped(message_id, MessageStatus::SkippedDuplicate, reason)
            .await
    }

    pub async fn mark_skipped_filtered(&self, message_id: i64, reason: &str) -> Result<()> {
        self.mark_skipped(message_id, MessageStatus::SkippedFiltered, reason)
            .await
    }

    async fn mark_skipped(
        &self,
        message_id: i64,
        status: MessageStatus,
        reason: &str,
    ) -> Result<()> {
        let now = now_ts();
        sqlx::query(
            "UPDATE messages SET status = ?, last_error = ?, last_error_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(reason)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(message_id)
        .execute(&self.pool)
        .await
        .context("marking message skipped")?;
        Ok(())
    }

    /// Look up an already-imported message by normalized Message-ID first,
    /// falling back to fingerprint (spec.md §4.1/§4.3 duplicate detection).
    pub async fn find_existing_imported(
        &self,
        message_id_norm: Option<&str>,
        fingerprint: &str,
    ) -> Result<Option<i64>> {
        if let Some(mid) = message_id_norm {
            let row = sqlx::query(
                "SELECT id FROM messages WHERE sink_message_id IS NOT NULL AND message_id_norm = ? LIMIT 1",
            )
            .bind(mid)
            .fetch_optional(&self.pool)
            .await
            .context("looking up existing imported message by message-id")?;
            if let Some(row) = row {
                return Ok(Some(row.get::<i64, _>(0)));
            }
        }

        let row = sqlx::query(
            "SELECT id FROM messages WHERE sink_message_id IS NOT NULL AND fingerprint = ? LIMIT 1",
        )
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await
        .context("looking up existing imported message by fingerprint")?;
        Ok(row.map(|row| row.get::<i64, _>(0)))
    }

    pub async fn count_folder_messages(&self, folder: &str) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) FROM messages WHERE status = 'imported' AND folder = ?")
            .bind(folder)
            .fetch_one(&self.pool)
            .await
            .context("counting folder messages")?;
        Ok(row.get::<i64, _>(0))
    }

    /// Reset `skipped_filtered`/`failed`/`skipped_duplicate` rows back to
    /// `discovered` and zero every folder checkpoint, so the next run
    /// rescans from the start (spec.md §6 `--reset`).
    pub async fn reset_skipped_and_failed(&self) -> Result<u64> {
        sqlx::query("UPDATE folders SET last_uid_seen = 0")
            .execute(&self.pool)
            .await
            .context("resetting folder checkpoints")?;

        let result = sqlx::query(
            r#"
            UPDATE messages SET status = 'discovered'
            WHERE status IN ('skipped_filtered', 'failed', 'skipped_duplicate')
            "#,
        )
        .execute(&self.pool)
        .await
        .context("resetting skipped/failed messages")?;

        Ok(result.rows_affected())
    }

    pub async fn counts_by_status(&self) -> Result<BTreeMap<String, i64>> {
        let rows = sqlx::query("SELECT status, COUNT(*) FROM messages GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .context("counting messages by status")?;

        let mut out = BTreeMap::new();
        for row in rows {
            out.insert(row.get::<String, _>(0), row.get::<i64, _>(1));
        }
        Ok(out)
    }

    pub async fn iter_messages(&self, status: Option<MessageStatus>) -> Result<Vec<MessageRow>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM messages");
        if let Some(status) = status {
            qb.push(" WHERE status = ");
            qb.push_bind(status.as_str());
        }
        qb.push(" ORDER BY id");

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .context("iterating messages")?;

        Ok(rows.iter().map(row_to_message).collect())
    }
}

fn parse_dt(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> MessageRow {
    MessageRow {
        id: row.get::<i64, _>("id"),
        folder: row.get::<String, _>("folder"),
        uid: row.get::<i64, _>("uid") as u32,
        uidvalidity: row.get::<Option<i64>, _>("uidvalidity").map(|v| v as u32),
        status: MessageStatus::from_str(&row.get::<String, _>("status"))
            .unwrap_or(MessageStatus::Discovered),
        message_id_norm: row.get::<Option<String>, _>("message_id_norm"),
        fingerprint: row.get::<String, _>("fingerprint"),
        eml_path: row.get::<Option<String>, _>("eml_path"),
        eml_sha256: row.get::<Option<String>, _>("eml_sha256"),
        size_bytes: row.get::<Option<i64>, _>("size_bytes").map(|v| v as u32),
        sink_message_id: row.get::<Option<String>, _>("sink_message_id"),
        sink_thread_id: row.get::<Option<String>, _>("sink_thread_id"),
        attempts: row.get::<i64, _>("attempts"),
        last_error: row.get::<Option<String>, _>("last_error"),
        last_error_at: row
            .get::<Option<String>, _>("last_error_at")
            .map(|s| parse_dt(&s)),
        created_at: parse_dt(&row.get::<String, _>("created_at")),
        updated_at: parse_dt(&row.get::<String, _>("updated_at")),
    }
}

// Lifecycle transitions, reset-on-rediscovery, and duplicate lookup are
// covered in tests/state_db_lifecycle.rs.
#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> Database {
        let url = format!("sqlite::memory:");
        let pool = SqlitePool::connect(&url).await.unwrap();
        let db = Database {
            pool,
            path: PathBuf::from(":memory:"),
        };
        db.migrate().await.unwrap();
        db
    }

    #[tokio::test]
    async fn discovered_message_round_trips() {
        let db = test_db().await;
        db.upsert_folder("INBOX", Some(7), Some(0)).await.unwrap();
        let msg = db
            .upsert_message_discovered("INBOX", 1, Some(7), Some("<a@b>"), "fp1", Some(100))
            .await
            .unwrap();
        assert_eq!(msg.status, MessageStatus::Discovered);
        assert_eq!(msg.fingerprint, "fp1");
    }
}
