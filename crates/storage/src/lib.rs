use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::debug;

use shared::domain::{ItemId, SendStatus, SourceId, UserId, UserProfile};

/// Local persistence consumed by the session coordinator.
///
/// Every mutation commits before the call returns, so a caller may publish a
/// notification that triggers a read of the data it just wrote.
#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn get_sources(&self) -> Result<Vec<StoredSource>>;
    async fn get_source(&self, uuid: &SourceId) -> Result<Option<StoredSource>>;
    async fn get_message(&self, uuid: &ItemId) -> Result<Option<StoredMessage>>;
    async fn get_reply(&self, uuid: &ItemId) -> Result<Option<StoredReply>>;
    async fn get_file(&self, uuid: &ItemId) -> Result<Option<StoredFile>>;
    async fn find_new_messages(&self) -> Result<Vec<StoredMessage>>;
    async fn find_new_replies(&self) -> Result<Vec<StoredReply>>;
    async fn mark_all_pending_drafts_as_failed(&self) -> Result<u64>;
    /// Marks every downloaded file whose decrypted copy is gone from
    /// `data_dir` as not downloaded and returns the affected uuids.
    async fn update_missing_files(&self, data_dir: &Path) -> Result<Vec<ItemId>>;
    async fn delete_source(&self, uuid: &SourceId) -> Result<()>;
    async fn update_and_get_user(&self, profile: &UserProfile) -> Result<StoredUser>;
    async fn insert_draft_reply(&self, draft: &NewDraftReply) -> Result<()>;
    async fn set_draft_reply_status(&self, uuid: &ItemId, status: SendStatus) -> Result<bool>;
}

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredSource {
    pub uuid: SourceId,
    pub designation: String,
    pub is_starred: bool,
    pub last_updated: DateTime<Utc>,
    pub interaction_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredMessage {
    pub uuid: ItemId,
    pub source_uuid: SourceId,
    pub filename: String,
    pub file_counter: i64,
    pub size: i64,
    pub is_downloaded: bool,
    pub is_decrypted: Option<bool>,
    pub content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredReply {
    pub uuid: ItemId,
    pub source_uuid: SourceId,
    pub author_uuid: Option<UserId>,
    pub filename: String,
    pub file_counter: i64,
    pub size: i64,
    pub is_downloaded: bool,
    pub is_decrypted: Option<bool>,
    pub content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredFile {
    pub uuid: ItemId,
    pub source_uuid: SourceId,
    pub filename: String,
    pub file_counter: i64,
    pub size: i64,
    pub is_downloaded: bool,
    pub is_decrypted: Option<bool>,
}

impl StoredFile {
    /// Location of the decrypted copy: the server filename with up to two
    /// extensions (`.gz.gpg`) removed.
    pub fn decrypted_path(&self, data_dir: &Path) -> PathBuf {
        data_dir.join(decrypted_file_stem(&self.filename))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredUser {
    pub uuid: UserId,
    pub username: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredDraftReply {
    pub uuid: ItemId,
    pub source_uuid: SourceId,
    pub author_uuid: UserId,
    pub file_counter: i64,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub send_status: SendStatus,
}

#[derive(Debug, Clone)]
pub struct NewDraftReply {
    pub uuid: ItemId,
    pub source_uuid: SourceId,
    pub author_uuid: UserId,
    pub file_counter: i64,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub send_status: SendStatus,
}

/// Server metadata for a message, reply or file row, as written by the
/// metadata sync job.
#[derive(Debug, Clone)]
pub struct ItemMetadata {
    pub uuid: ItemId,
    pub source_uuid: SourceId,
    pub filename: String,
    pub file_counter: i64,
    pub size: i64,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        // Every pooled connection to `sqlite::memory:` would open its own
        // empty database.
        let pool = if is_memory_url(database_url) {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(connect_options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(5)
                .connect_with(connect_options)
                .await?
        };
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn upsert_source(
        &self,
        uuid: &SourceId,
        designation: &str,
        is_starred: bool,
        last_updated: DateTime<Utc>,
        interaction_count: i64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO sources (uuid, designation, is_starred, last_updated, interaction_count)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(uuid) DO UPDATE SET
                designation = excluded.designation,
                is_starred = excluded.is_starred,
                last_updated = excluded.last_updated,
                interaction_count = excluded.interaction_count",
        )
        .bind(uuid.as_str())
        .bind(designation)
        .bind(is_starred)
        .bind(last_updated)
        .bind(interaction_count)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to upsert source {uuid}"))?;
        Ok(())
    }

    pub async fn upsert_message(&self, metadata: &ItemMetadata) -> Result<()> {
        sqlx::query(
            "INSERT INTO messages (uuid, source_uuid, filename, file_counter, size)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(uuid) DO UPDATE SET
                filename = excluded.filename,
                file_counter = excluded.file_counter,
                size = excluded.size",
        )
        .bind(metadata.uuid.as_str())
        .bind(metadata.source_uuid.as_str())
        .bind(&metadata.filename)
        .bind(metadata.file_counter)
        .bind(metadata.size)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to upsert message {}", metadata.uuid))?;
        Ok(())
    }

    pub async fn upsert_reply(
        &self,
        metadata: &ItemMetadata,
        author_uuid: Option<&UserId>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO replies (uuid, source_uuid, author_uuid, filename, file_counter, size)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(uuid) DO UPDATE SET
                author_uuid = excluded.author_uuid,
                filename = excluded.filename,
                file_counter = excluded.file_counter,
                size = excluded.size",
        )
        .bind(metadata.uuid.as_str())
        .bind(metadata.source_uuid.as_str())
        .bind(author_uuid.map(|uuid| uuid.as_str()))
        .bind(&metadata.filename)
        .bind(metadata.file_counter)
        .bind(metadata.size)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to upsert reply {}", metadata.uuid))?;
        Ok(())
    }

    pub async fn upsert_file(&self, metadata: &ItemMetadata) -> Result<()> {
        sqlx::query(
            "INSERT INTO files (uuid, source_uuid, filename, file_counter, size)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(uuid) DO UPDATE SET
                filename = excluded.filename,
                file_counter = excluded.file_counter,
                size = excluded.size",
        )
        .bind(metadata.uuid.as_str())
        .bind(metadata.source_uuid.as_str())
        .bind(&metadata.filename)
        .bind(metadata.file_counter)
        .bind(metadata.size)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to upsert file {}", metadata.uuid))?;
        Ok(())
    }

    pub async fn store_message_content(&self, uuid: &ItemId, content: &str) -> Result<()> {
        sqlx::query(
            "UPDATE messages SET is_downloaded = 1, is_decrypted = 1, content = ? WHERE uuid = ?",
        )
        .bind(content)
        .bind(uuid.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn store_reply_content(&self, uuid: &ItemId, content: &str) -> Result<()> {
        sqlx::query(
            "UPDATE replies SET is_downloaded = 1, is_decrypted = 1, content = ? WHERE uuid = ?",
        )
        .bind(content)
        .bind(uuid.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_file_downloaded(&self, uuid: &ItemId) -> Result<()> {
        sqlx::query("UPDATE files SET is_downloaded = 1, is_decrypted = 1 WHERE uuid = ?")
            .bind(uuid.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_draft_reply(&self, uuid: &ItemId) -> Result<Option<StoredDraftReply>> {
        let row = sqlx::query(
            "SELECT uuid, source_uuid, author_uuid, file_counter, content, timestamp, send_status
             FROM draft_replies
             WHERE uuid = ?",
        )
        .bind(uuid.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| draft_from_row(&r)).transpose()
    }

    pub async fn list_draft_replies(&self) -> Result<Vec<StoredDraftReply>> {
        let rows = sqlx::query(
            "SELECT uuid, source_uuid, author_uuid, file_counter, content, timestamp, send_status
             FROM draft_replies
             ORDER BY timestamp ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(draft_from_row).collect()
    }
}

#[async_trait]
impl LocalStore for Storage {
    async fn get_sources(&self) -> Result<Vec<StoredSource>> {
        let rows = sqlx::query(
            "SELECT uuid, designation, is_starred, last_updated, interaction_count
             FROM sources
             ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(source_from_row).collect())
    }

    async fn get_source(&self, uuid: &SourceId) -> Result<Option<StoredSource>> {
        let row = sqlx::query(
            "SELECT uuid, designation, is_starred, last_updated, interaction_count
             FROM sources
             WHERE uuid = ?",
        )
        .bind(uuid.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(source_from_row))
    }

    async fn get_message(&self, uuid: &ItemId) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(
            "SELECT uuid, source_uuid, filename, file_counter, size, is_downloaded, is_decrypted, content
             FROM messages
             WHERE uuid = ?",
        )
        .bind(uuid.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(message_from_row))
    }

    async fn get_reply(&self, uuid: &ItemId) -> Result<Option<StoredReply>> {
        let row = sqlx::query(
            "SELECT uuid, source_uuid, author_uuid, filename, file_counter, size, is_downloaded, is_decrypted, content
             FROM replies
             WHERE uuid = ?",
        )
        .bind(uuid.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(reply_from_row))
    }

    async fn get_file(&self, uuid: &ItemId) -> Result<Option<StoredFile>> {
        let row = sqlx::query(
            "SELECT uuid, source_uuid, filename, file_counter, size, is_downloaded, is_decrypted
             FROM files
             WHERE uuid = ?",
        )
        .bind(uuid.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(file_from_row))
    }

    async fn find_new_messages(&self) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(
            "SELECT uuid, source_uuid, filename, file_counter, size, is_downloaded, is_decrypted, content
             FROM messages
             WHERE is_downloaded = 0 OR is_decrypted = 0 OR is_decrypted IS NULL
             ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(message_from_row).collect())
    }

    async fn find_new_replies(&self) -> Result<Vec<StoredReply>> {
        let rows = sqlx::query(
            "SELECT uuid, source_uuid, author_uuid, filename, file_counter, size, is_downloaded, is_decrypted, content
             FROM replies
             WHERE is_downloaded = 0 OR is_decrypted = 0 OR is_decrypted IS NULL
             ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(reply_from_row).collect())
    }

    async fn mark_all_pending_drafts_as_failed(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE draft_replies SET send_status = 'FAILED' WHERE send_status = 'PENDING'",
        )
        .execute(&self.pool)
        .await
        .context("failed to mark pending drafts as failed")?;
        Ok(result.rows_affected())
    }

    async fn update_missing_files(&self, data_dir: &Path) -> Result<Vec<ItemId>> {
        let rows = sqlx::query(
            "SELECT uuid, source_uuid, filename, file_counter, size, is_downloaded, is_decrypted
             FROM files
             WHERE is_downloaded = 1",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut missing = Vec::new();
        for file in rows.iter().map(file_from_row) {
            let path = file.decrypted_path(data_dir);
            if path.exists() {
                continue;
            }
            debug!(file = %file.uuid, path = %path.display(), "downloaded file is missing");
            sqlx::query("UPDATE files SET is_downloaded = 0, is_decrypted = NULL WHERE uuid = ?")
                .bind(file.uuid.as_str())
                .execute(&self.pool)
                .await?;
            missing.push(file.uuid);
        }
        Ok(missing)
    }

    async fn delete_source(&self, uuid: &SourceId) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for table in ["messages", "replies", "files", "draft_replies"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE source_uuid = ?"))
                .bind(uuid.as_str())
                .execute(&mut *tx)
                .await
                .with_context(|| format!("failed to delete {table} for source {uuid}"))?;
        }
        sqlx::query("DELETE FROM sources WHERE uuid = ?")
            .bind(uuid.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn update_and_get_user(&self, profile: &UserProfile) -> Result<StoredUser> {
        let row = sqlx::query(
            "INSERT INTO users (uuid, username, first_name, last_name)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(uuid) DO UPDATE SET
                username = excluded.username,
                first_name = excluded.first_name,
                last_name = excluded.last_name
             RETURNING uuid, username, first_name, last_name",
        )
        .bind(profile.uuid.as_str())
        .bind(&profile.username)
        .bind(profile.first_name.as_deref())
        .bind(profile.last_name.as_deref())
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("failed to update user {}", profile.uuid))?;

        Ok(StoredUser {
            uuid: UserId(row.get::<String, _>(0)),
            username: row.get::<String, _>(1),
            first_name: row.get::<Option<String>, _>(2),
            last_name: row.get::<Option<String>, _>(3),
        })
    }

    async fn insert_draft_reply(&self, draft: &NewDraftReply) -> Result<()> {
        sqlx::query(
            "INSERT INTO draft_replies (uuid, source_uuid, author_uuid, file_counter, content, timestamp, send_status)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(draft.uuid.as_str())
        .bind(draft.source_uuid.as_str())
        .bind(draft.author_uuid.as_str())
        .bind(draft.file_counter)
        .bind(&draft.content)
        .bind(draft.timestamp)
        .bind(draft.send_status.as_str())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to insert draft reply {}", draft.uuid))?;
        Ok(())
    }

    async fn set_draft_reply_status(&self, uuid: &ItemId, status: SendStatus) -> Result<bool> {
        let result = sqlx::query("UPDATE draft_replies SET send_status = ? WHERE uuid = ?")
            .bind(status.as_str())
            .bind(uuid.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// `1-report.pdf.gz.gpg` becomes `1-report.pdf`; names with fewer extensions
/// lose only what they have.
pub fn decrypted_file_stem(filename: &str) -> &str {
    let mut stem = filename;
    for _ in 0..2 {
        match Path::new(stem).file_stem().and_then(|s| s.to_str()) {
            Some(next) if !next.is_empty() => stem = next,
            _ => break,
        }
    }
    stem
}

fn source_from_row(r: &SqliteRow) -> StoredSource {
    StoredSource {
        uuid: SourceId(r.get::<String, _>(0)),
        designation: r.get::<String, _>(1),
        is_starred: r.get::<bool, _>(2),
        last_updated: r.get::<DateTime<Utc>, _>(3),
        interaction_count: r.get::<i64, _>(4),
    }
}

fn message_from_row(r: &SqliteRow) -> StoredMessage {
    StoredMessage {
        uuid: ItemId(r.get::<String, _>(0)),
        source_uuid: SourceId(r.get::<String, _>(1)),
        filename: r.get::<String, _>(2),
        file_counter: r.get::<i64, _>(3),
        size: r.get::<i64, _>(4),
        is_downloaded: r.get::<bool, _>(5),
        is_decrypted: r.get::<Option<bool>, _>(6),
        content: r.get::<Option<String>, _>(7),
    }
}

fn reply_from_row(r: &SqliteRow) -> StoredReply {
    StoredReply {
        uuid: ItemId(r.get::<String, _>(0)),
        source_uuid: SourceId(r.get::<String, _>(1)),
        author_uuid: r.get::<Option<String>, _>(2).map(UserId),
        filename: r.get::<String, _>(3),
        file_counter: r.get::<i64, _>(4),
        size: r.get::<i64, _>(5),
        is_downloaded: r.get::<bool, _>(6),
        is_decrypted: r.get::<Option<bool>, _>(7),
        content: r.get::<Option<String>, _>(8),
    }
}

fn file_from_row(r: &SqliteRow) -> StoredFile {
    StoredFile {
        uuid: ItemId(r.get::<String, _>(0)),
        source_uuid: SourceId(r.get::<String, _>(1)),
        filename: r.get::<String, _>(2),
        file_counter: r.get::<i64, _>(3),
        size: r.get::<i64, _>(4),
        is_downloaded: r.get::<bool, _>(5),
        is_decrypted: r.get::<Option<bool>, _>(6),
    }
}

fn draft_from_row(r: &SqliteRow) -> Result<StoredDraftReply> {
    let raw_status = r.get::<String, _>(6);
    let send_status = SendStatus::parse(&raw_status)
        .with_context(|| format!("unknown draft send status '{raw_status}'"))?;
    Ok(StoredDraftReply {
        uuid: ItemId(r.get::<String, _>(0)),
        source_uuid: SourceId(r.get::<String, _>(1)),
        author_uuid: UserId(r.get::<String, _>(2)),
        file_counter: r.get::<i64, _>(3),
        content: r.get::<String, _>(4),
        timestamp: r.get::<DateTime<Utc>, _>(5),
        send_status,
    })
}

fn is_memory_url(database_url: &str) -> bool {
    database_url.starts_with("sqlite::memory:") || database_url.contains("mode=memory")
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if is_memory_url(database_url) || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
