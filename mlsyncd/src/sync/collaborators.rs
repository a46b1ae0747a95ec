//! Seams between the sync engine and the outside world.
//!
//! The engine never talks to SQLite or HTTP directly; it is handed these
//! traits so the daemon can plug in [`IndexStore`](super::index::IndexStore)
//! and [`IndexerClient`] while tests use in-memory fakes.

use std::collections::HashMap;

use async_trait::async_trait;
use mlsync_core::{IndexerClient, IndexingError, ItemId, ItemMetadata};
use thiserror::Error;

use super::index::IndexError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("index store error: {0}")]
    Index(#[from] IndexError),
    #[error("storage backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    pub fn backend(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        StoreError::Backend(Box::new(err))
    }
}

/// Persisted per-item processing state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingRecord {
    pub item_id: ItemId,
    pub schema_version: i64,
    pub error_count: u32,
    pub last_error: Option<String>,
}

#[async_trait]
pub trait LocalItemSource: Send + Sync {
    async fn local_items(&self, user_id: i64)
    -> Result<HashMap<ItemId, ItemMetadata>, StoreError>;
}

#[async_trait]
pub trait ProcessingStore: Send + Sync {
    /// Up to `batch_size` ids owned by `owner_id` that are unprocessed, or
    /// stale and still under the retry ceiling. Order is unspecified.
    async fn out_of_sync_ids(
        &self,
        owner_id: i64,
        batch_size: usize,
        current_version: i64,
        max_error_count: u32,
    ) -> Result<Vec<ItemId>, StoreError>;

    async fn processing_record(&self, id: ItemId)
    -> Result<Option<ProcessingRecord>, StoreError>;

    /// Atomically bumps the counter for `scope` and returns the new value.
    async fn increment_index_version(&self, scope: &str) -> Result<i64, StoreError>;

    async fn mark_indexed(&self, id: ItemId, version: i64) -> Result<(), StoreError>;

    async fn record_failure(&self, id: ItemId, failure: &IndexingError)
    -> Result<(), StoreError>;
}

#[async_trait]
pub trait Indexer: Send + Sync {
    async fn index(
        &self,
        item: &ItemMetadata,
        raw_bytes: Option<Vec<u8>>,
        user_agent: &str,
    ) -> Result<(), IndexingError>;
}

#[async_trait]
impl Indexer for IndexerClient {
    async fn index(
        &self,
        item: &ItemMetadata,
        raw_bytes: Option<Vec<u8>>,
        user_agent: &str,
    ) -> Result<(), IndexingError> {
        IndexerClient::index(self, item, raw_bytes, user_agent).await
    }
}
