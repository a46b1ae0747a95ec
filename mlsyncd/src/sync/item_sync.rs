use std::sync::Arc;

use mlsync_core::{IndexingError, ItemMetadata, translate_upload_error};
use thiserror::Error;

use super::collaborators::{Indexer, ProcessingStore, StoreError};

#[derive(Debug, Error)]
pub enum ItemError {
    #[error("indexing failed: {0}")]
    Indexing(#[from] IndexingError),
    #[error("processing store failed: {0}")]
    Store(#[from] StoreError),
}

impl ItemError {
    /// Passes transport-status failures through the upload error mapping.
    pub fn translated(self) -> Self {
        match self {
            ItemError::Indexing(err) => ItemError::Indexing(translate_upload_error(err)),
            other => other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemSyncStatus {
    Indexed,
    AlreadyCurrent,
}

/// The per-item unit of work shared by batch and foreground syncs.
pub struct ItemSyncer {
    store: Arc<dyn ProcessingStore>,
    indexer: Arc<dyn Indexer>,
    current_version: i64,
}

impl ItemSyncer {
    pub fn new(
        store: Arc<dyn ProcessingStore>,
        indexer: Arc<dyn Indexer>,
        current_version: i64,
    ) -> Self {
        Self {
            store,
            indexer,
            current_version,
        }
    }

    pub fn store(&self) -> &Arc<dyn ProcessingStore> {
        &self.store
    }

    pub async fn sync_item(
        &self,
        item: &ItemMetadata,
        raw_bytes: Option<Vec<u8>>,
        user_agent: &str,
    ) -> Result<ItemSyncStatus, ItemError> {
        if let Some(record) = self.store.processing_record(item.id).await?
            && record.schema_version >= self.current_version
        {
            tracing::trace!(item_id = %item.id, "item already indexed at current version");
            return Ok(ItemSyncStatus::AlreadyCurrent);
        }

        self.indexer.index(item, raw_bytes, user_agent).await?;
        self.store.mark_indexed(item.id, self.current_version).await?;
        tracing::debug!(item_id = %item.id, version = self.current_version, "item indexed");
        Ok(ItemSyncStatus::Indexed)
    }
}
