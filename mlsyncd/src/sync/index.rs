use std::collections::HashMap;
use std::{fs, path::PathBuf};

use async_trait::async_trait;
use mlsync_core::{IndexingError, ItemId, ItemMetadata, MediaKind};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool, migrate::Migrator, sqlite::SqliteConnectOptions};
use thiserror::Error;
use time::OffsetDateTime;

use super::collaborators::{LocalItemSource, ProcessingRecord, ProcessingStore, StoreError};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
    #[error("invalid media kind: {0}")]
    InvalidMediaKind(String),
    #[error("item not found after upsert")]
    MissingItem,
}

/// A local file as discovered by the media scanner.
#[derive(Debug, Clone)]
pub struct LocalItemInput {
    pub owner_id: i64,
    pub title: String,
    pub kind: MediaKind,
    pub local_path: PathBuf,
    pub size: Option<i64>,
    pub modified: Option<i64>,
}

pub struct IndexStore {
    pool: SqlitePool,
}

impl IndexStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn open(db_path: Option<PathBuf>) -> Result<Self, IndexError> {
        let db_path = match db_path {
            Some(path) => path,
            None => default_db_path()?,
        };
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), IndexError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn upsert_local_item(
        &self,
        item: &LocalItemInput,
    ) -> Result<ItemMetadata, IndexError> {
        let local_path = item.local_path.to_string_lossy().into_owned();
        sqlx::query(
            "INSERT INTO local_items (owner_id, title, media_kind, local_path, size, modified)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(local_path) DO UPDATE SET
                owner_id = excluded.owner_id,
                title = excluded.title,
                media_kind = excluded.media_kind,
                size = excluded.size,
                modified = excluded.modified",
        )
        .bind(item.owner_id)
        .bind(&item.title)
        .bind(item.kind.as_str())
        .bind(&local_path)
        .bind(item.size)
        .bind(item.modified)
        .execute(&self.pool)
        .await?;

        self.get_local_item_by_path(&local_path)
            .await?
            .ok_or(IndexError::MissingItem)
    }

    pub async fn get_local_item_by_path(
        &self,
        local_path: &str,
    ) -> Result<Option<ItemMetadata>, IndexError> {
        let row = sqlx::query(
            "SELECT id, owner_id, title, media_kind, local_path, size, modified
             FROM local_items WHERE local_path = ?1",
        )
        .bind(local_path)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(item_from_row).transpose()
    }

    pub async fn get_local_item(&self, id: ItemId) -> Result<Option<ItemMetadata>, IndexError> {
        let row = sqlx::query(
            "SELECT id, owner_id, title, media_kind, local_path, size, modified
             FROM local_items WHERE id = ?1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(item_from_row).transpose()
    }

    pub async fn list_local_items(&self, owner_id: i64) -> Result<Vec<ItemMetadata>, IndexError> {
        let rows = sqlx::query(
            "SELECT id, owner_id, title, media_kind, local_path, size, modified
             FROM local_items WHERE owner_id = ?1 ORDER BY id ASC",
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(item_from_row).collect()
    }

    /// Removes a local item together with its processing record.
    pub async fn delete_local_item(&self, id: ItemId) -> Result<(), IndexError> {
        sqlx::query("DELETE FROM ml_files WHERE item_id = ?1")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM local_items WHERE id = ?1")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Forgets the processing state of an item so the next run reindexes it.
    pub async fn reset_processing(&self, id: ItemId) -> Result<(), IndexError> {
        sqlx::query("DELETE FROM ml_files WHERE item_id = ?1")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_out_of_sync(
        &self,
        owner_id: i64,
        batch_size: usize,
        current_version: i64,
        max_error_count: u32,
    ) -> Result<Vec<ItemId>, IndexError> {
        let limit = i64::try_from(batch_size).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            "SELECT li.id
             FROM local_items li
             LEFT JOIN ml_files mf ON mf.item_id = li.id
             WHERE li.owner_id = ?4
               AND (mf.item_id IS NULL
                    OR (mf.ml_version < ?1 AND mf.error_count < ?2))
             ORDER BY li.id ASC
             LIMIT ?3",
        )
        .bind(current_version)
        .bind(i64::from(max_error_count))
        .bind(limit)
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(ItemId(row.try_get("id")?));
        }
        Ok(out)
    }

    pub async fn get_processing_record(
        &self,
        id: ItemId,
    ) -> Result<Option<ProcessingRecord>, IndexError> {
        let row = sqlx::query(
            "SELECT item_id, ml_version, error_count, last_error FROM ml_files WHERE item_id = ?1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let error_count: i64 = row.try_get("error_count")?;
        Ok(Some(ProcessingRecord {
            item_id: ItemId(row.try_get("item_id")?),
            schema_version: row.try_get("ml_version")?,
            error_count: u32::try_from(error_count).unwrap_or(u32::MAX),
            last_error: row.try_get("last_error")?,
        }))
    }

    pub async fn set_indexed(&self, id: ItemId, version: i64) -> Result<(), IndexError> {
        sqlx::query(
            "INSERT INTO ml_files (item_id, ml_version, error_count, last_error, last_error_kind, updated_at)
             VALUES (?1, ?2, 0, NULL, NULL, ?3)
             ON CONFLICT(item_id) DO UPDATE SET
                ml_version = MAX(ml_files.ml_version, excluded.ml_version),
                last_error = NULL,
                last_error_kind = NULL,
                updated_at = excluded.updated_at",
        )
        .bind(id.0)
        .bind(version)
        .bind(now_unix())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn add_failure(&self, id: ItemId, failure: &IndexingError) -> Result<(), IndexError> {
        let kind = failure.kind().map(|kind| kind.as_str());
        sqlx::query(
            "INSERT INTO ml_files (item_id, ml_version, error_count, last_error, last_error_kind, updated_at)
             VALUES (?1, 0, 1, ?2, ?3, ?4)
             ON CONFLICT(item_id) DO UPDATE SET
                error_count = ml_files.error_count + 1,
                last_error = excluded.last_error,
                last_error_kind = excluded.last_error_kind,
                updated_at = excluded.updated_at",
        )
        .bind(id.0)
        .bind(failure.to_string())
        .bind(kind)
        .bind(now_unix())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn bump_index_version(&self, scope: &str) -> Result<i64, IndexError> {
        let row = sqlx::query(
            "INSERT INTO index_versions (scope, version) VALUES (?1, 1)
             ON CONFLICT(scope) DO UPDATE SET version = index_versions.version + 1
             RETURNING version",
        )
        .bind(scope)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("version")?)
    }

    pub async fn get_index_version(&self, scope: &str) -> Result<i64, IndexError> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT version FROM index_versions WHERE scope = ?1")
                .bind(scope)
                .fetch_optional(&self.pool)
                .await?;
        Ok(version.unwrap_or(0))
    }
}

#[async_trait]
impl LocalItemSource for IndexStore {
    async fn local_items(
        &self,
        user_id: i64,
    ) -> Result<HashMap<ItemId, ItemMetadata>, StoreError> {
        let items = self.list_local_items(user_id).await?;
        Ok(items.into_iter().map(|item| (item.id, item)).collect())
    }
}

#[async_trait]
impl ProcessingStore for IndexStore {
    async fn out_of_sync_ids(
        &self,
        owner_id: i64,
        batch_size: usize,
        current_version: i64,
        max_error_count: u32,
    ) -> Result<Vec<ItemId>, StoreError> {
        Ok(self
            .list_out_of_sync(owner_id, batch_size, current_version, max_error_count)
            .await?)
    }

    async fn processing_record(
        &self,
        id: ItemId,
    ) -> Result<Option<ProcessingRecord>, StoreError> {
        Ok(self.get_processing_record(id).await?)
    }

    async fn increment_index_version(&self, scope: &str) -> Result<i64, StoreError> {
        Ok(self.bump_index_version(scope).await?)
    }

    async fn mark_indexed(&self, id: ItemId, version: i64) -> Result<(), StoreError> {
        Ok(self.set_indexed(id, version).await?)
    }

    async fn record_failure(
        &self,
        id: ItemId,
        failure: &IndexingError,
    ) -> Result<(), StoreError> {
        Ok(self.add_failure(id, failure).await?)
    }
}

fn item_from_row(row: &SqliteRow) -> Result<ItemMetadata, IndexError> {
    let kind: String = row.try_get("media_kind")?;
    let local_path: Option<String> = row.try_get("local_path")?;
    Ok(ItemMetadata {
        id: ItemId(row.try_get("id")?),
        owner_id: row.try_get("owner_id")?,
        title: row.try_get("title")?,
        kind: MediaKind::parse(&kind).ok_or(IndexError::InvalidMediaKind(kind))?,
        local_path: local_path.map(PathBuf::from),
        size: row.try_get("size")?,
        modified: row.try_get("modified")?,
    })
}

fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

pub fn default_db_path() -> Result<PathBuf, IndexError> {
    let mut path = dirs::data_dir().ok_or(IndexError::MissingDataDir)?;
    path.push("mlsync");
    path.push("index.db");
    Ok(path)
}

#[cfg(test)]
#[path = "index_tests.rs"]
mod tests;
