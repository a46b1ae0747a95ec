use mlsync_core::{FailureKind, ItemMetadata};
use serde::Serialize;
use thiserror::Error;

use super::context::SyncContext;
use super::item_sync::{ItemError, ItemSyncStatus, ItemSyncer};

/// Failures that make the rest of a run pointless.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FatalRunError {
    #[error("session expired")]
    SessionExpired,
    #[error("network unreachable")]
    NetworkError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Absorb,
    Abort(FatalRunError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    Indexed,
    AlreadyCurrent,
    /// The item failed but the run carries on.
    Absorbed(FailureKind),
}

/// Decides whether a translated per-item failure aborts the run.
pub fn classify(err: &ItemError) -> Verdict {
    let kind = match err {
        ItemError::Indexing(failure) => failure.kind().unwrap_or(FailureKind::Unknown),
        ItemError::Store(_) => return Verdict::Absorb,
    };
    match kind {
        FailureKind::SessionExpired => Verdict::Abort(FatalRunError::SessionExpired),
        FailureKind::NetworkError => Verdict::Abort(FatalRunError::NetworkError),
        FailureKind::TokenExpired
        | FailureKind::SubscriptionExpired
        | FailureKind::StorageQuotaExceeded
        | FailureKind::FileTooLarge
        | FailureKind::TooManyRequests
        | FailureKind::UnsupportedFormat
        | FailureKind::Unknown => Verdict::Absorb,
    }
}

/// Runs the per-item operation and applies the absorb/abort policy.
///
/// Every item that completes, successfully or with an absorbed failure, bumps
/// the context's processed count exactly once. Aborted items are not counted.
pub async fn sync_with_classifier(
    context: &SyncContext,
    syncer: &ItemSyncer,
    item: &ItemMetadata,
    raw_bytes: Option<Vec<u8>>,
) -> Result<ItemOutcome, FatalRunError> {
    let err = match syncer
        .sync_item(item, raw_bytes, context.user_agent())
        .await
    {
        Ok(status) => {
            context.record_processed();
            return Ok(match status {
                ItemSyncStatus::Indexed => ItemOutcome::Indexed,
                ItemSyncStatus::AlreadyCurrent => ItemOutcome::AlreadyCurrent,
            });
        }
        Err(err) => err.translated(),
    };

    match classify(&err) {
        Verdict::Abort(fatal) => {
            tracing::warn!(
                context_id = context.id(),
                item_id = %item.id,
                error = %err,
                "fatal error while syncing item"
            );
            Err(fatal)
        }
        Verdict::Absorb => {
            let kind = match &err {
                ItemError::Indexing(failure) => {
                    if let Err(store_err) = syncer.store().record_failure(item.id, failure).await {
                        tracing::warn!(item_id = %item.id, error = %store_err, "failed to record item failure");
                    }
                    failure.kind().unwrap_or(FailureKind::Unknown)
                }
                ItemError::Store(_) => FailureKind::Unknown,
            };
            tracing::warn!(item_id = %item.id, error = %err, "item sync failed, continuing");
            context.record_processed();
            Ok(ItemOutcome::Absorbed(kind))
        }
    }
}
