use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use futures_util::FutureExt;
use mlsync_core::{Identity, IdentityError, ItemId, ItemMetadata};
use thiserror::Error;
use tokio::sync::Mutex;

use super::classifier::{FatalRunError, ItemOutcome, sync_with_classifier};
use super::collaborators::{Indexer, LocalItemSource, ProcessingStore, StoreError};
use super::context::SyncContext;
use super::item_sync::ItemSyncer;
use super::queue::{Job, default_concurrency};

pub const DEFAULT_BATCH_SIZE: usize = 200;
pub const DEFAULT_SCHEMA_VERSION: i64 = 1;
pub const MAX_SYNC_ERROR_COUNT: u32 = 1;
pub const FILES_VERSION_SCOPE: &str = "files";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid identity: {0}")]
    InvalidIdentity(#[from] IdentityError),
    #[error("sync run aborted: {0}")]
    Fatal(#[from] FatalRunError),
    #[error("out-of-sync item {0} has no local metadata")]
    MissingLocalItem(ItemId),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub batch_size: usize,
    pub current_version: i64,
    pub max_sync_error_count: u32,
    pub concurrency: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            current_version: DEFAULT_SCHEMA_VERSION,
            max_sync_error_count: MAX_SYNC_ERROR_COUNT,
            concurrency: default_concurrency(),
        }
    }
}

/// What one batch run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub context_id: u64,
    pub pending: usize,
    pub processed: usize,
    pub run_error: Option<FatalRunError>,
    /// Index version after this run; `None` when nothing was pending.
    pub index_version: Option<i64>,
}

impl RunReport {
    /// True when items were pending and the run was not aborted, meaning
    /// another run may find more work.
    pub fn made_progress(&self) -> bool {
        self.run_error.is_none() && self.pending > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContextKind {
    Batch,
    Foreground,
}

impl ContextKind {
    fn as_str(&self) -> &'static str {
        match self {
            ContextKind::Batch => "batch",
            ContextKind::Foreground => "foreground",
        }
    }
}

struct SyncingGuard<'a>(&'a AtomicBool);

impl<'a> SyncingGuard<'a> {
    fn set(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for SyncingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Long-lived coordinator for batch and foreground item syncs.
///
/// Holds at most one batch context and one foreground context. Each slot is
/// guarded by an async mutex so concurrent first callers end up sharing a
/// single context.
pub struct SyncOrchestrator {
    items: Arc<dyn LocalItemSource>,
    store: Arc<dyn ProcessingStore>,
    syncer: Arc<ItemSyncer>,
    settings: SyncSettings,
    batch: Mutex<Option<Arc<SyncContext>>>,
    foreground: Mutex<Option<Arc<SyncContext>>>,
    batch_run: Mutex<()>,
    is_syncing: AtomicBool,
}

impl SyncOrchestrator {
    pub fn new(
        items: Arc<dyn LocalItemSource>,
        store: Arc<dyn ProcessingStore>,
        indexer: Arc<dyn Indexer>,
        settings: SyncSettings,
    ) -> Self {
        let syncer = Arc::new(ItemSyncer::new(
            Arc::clone(&store),
            indexer,
            settings.current_version,
        ));
        Self {
            items,
            store,
            syncer,
            settings,
            batch: Mutex::new(None),
            foreground: Mutex::new(None),
            batch_run: Mutex::new(()),
            is_syncing: AtomicBool::new(false),
        }
    }

    pub fn is_syncing(&self) -> bool {
        self.is_syncing.load(Ordering::SeqCst)
    }

    /// Runs one batch and reports whether useful progress was made without
    /// hitting a fatal error.
    pub async fn sync(&self, identity: &Identity) -> Result<bool, SyncError> {
        Ok(self.sync_report(identity).await?.made_progress())
    }

    /// Like [`SyncOrchestrator::sync`] but returns the full run report.
    pub async fn sync_report(&self, identity: &Identity) -> Result<RunReport, SyncError> {
        identity.validate()?;
        let _run = self.batch_run.lock().await;
        let context = self.context_for(ContextKind::Batch, identity).await?;

        let local_items = self.items.local_items(identity.user_id).await?;
        context.install_local_items(local_items);

        let pending = self.out_of_sync_items(&context).await?;
        let pending_count = pending.len();
        let processed_before = context.processed_count();
        let mut index_version: Result<Option<i64>, StoreError> = Ok(None);
        if pending_count > 0 {
            self.sync_pending(&context, pending).await;
            index_version = self
                .store
                .increment_index_version(FILES_VERSION_SCOPE)
                .await
                .map(Some);
        }
        if context.run_error().is_some() {
            self.retire(ContextKind::Batch, &context).await;
        }
        let index_version = index_version?;

        let report = RunReport {
            context_id: context.id(),
            pending: pending_count,
            processed: context.processed_count() - processed_before,
            run_error: context.run_error(),
            index_version,
        };
        tracing::info!(
            context_id = report.context_id,
            pending = report.pending,
            processed = report.processed,
            aborted = report.run_error.is_some(),
            "batch sync finished"
        );
        Ok(report)
    }

    async fn out_of_sync_items(
        &self,
        context: &SyncContext,
    ) -> Result<Vec<ItemMetadata>, SyncError> {
        let started = Instant::now();
        let ids = self
            .store
            .out_of_sync_ids(
                context.identity().user_id,
                self.settings.batch_size,
                self.settings.current_version,
                self.settings.max_sync_error_count,
            )
            .await?;
        tracing::debug!(count = ids.len(), ?ids, "out-of-sync item ids");

        let pending = context
            .resolve_pending(&ids)
            .map_err(SyncError::MissingLocalItem)?;
        tracing::info!(
            pending = pending.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "computed out-of-sync items"
        );
        Ok(pending)
    }

    async fn sync_pending(&self, context: &Arc<SyncContext>, pending: Vec<ItemMetadata>) {
        let _syncing = SyncingGuard::set(&self.is_syncing);
        let jobs = pending.into_iter().map(|item| -> Job<FatalRunError> {
            let context = Arc::clone(context);
            let syncer = Arc::clone(&self.syncer);
            async move {
                sync_with_classifier(&context, &syncer, &item, None)
                    .await
                    .map(|_| ())
                    .inspect_err(|fatal| {
                        context.set_run_error(*fatal);
                    })
            }
            .boxed()
        });

        context.queue().submit_all(jobs);
        if let Err(fatal) = context.queue().await_idle().await {
            tracing::error!(context_id = context.id(), error = %fatal, "batch sync aborted");
            context.set_run_error(fatal);
        }
    }

    /// Syncs a single item on the foreground context.
    ///
    /// Errors are logged and returned to the caller; they never poison the
    /// batch path. The foreground context is recycled once it has processed a
    /// full batch worth of items.
    pub async fn sync_one(
        &self,
        identity: &Identity,
        item: &ItemMetadata,
        raw_bytes: Option<Vec<u8>>,
    ) -> Result<ItemOutcome, SyncError> {
        let context = match self.context_for(ContextKind::Foreground, identity).await {
            Ok(context) => context,
            Err(err) => {
                tracing::error!(item_id = %item.id, error = %err, "cannot sync local item");
                return Err(err);
            }
        };

        let result = sync_with_classifier(&context, &self.syncer, item, raw_bytes).await;

        if context.processed_count() >= self.settings.batch_size {
            self.retire(ContextKind::Foreground, &context).await;
        }

        result.map_err(|fatal| {
            tracing::error!(item_id = %item.id, error = %fatal, "error while syncing local item");
            SyncError::Fatal(fatal)
        })
    }

    pub async fn close_foreground_context(&self) {
        let context = self.foreground.lock().await.take();
        if let Some(context) = context {
            tracing::info!(context_id = context.id(), "closing foreground sync context");
            context.dispose().await;
        }
    }

    /// Disposes both contexts. New calls after shutdown start fresh contexts.
    pub async fn shutdown(&self) {
        self.close_foreground_context().await;
        let context = self.batch.lock().await.take();
        if let Some(context) = context {
            context.dispose().await;
        }
    }

    pub async fn batch_context_id(&self) -> Option<u64> {
        self.batch.lock().await.as_ref().map(|context| context.id())
    }

    pub async fn foreground_context_id(&self) -> Option<u64> {
        self.foreground.lock().await.as_ref().map(|context| context.id())
    }

    fn slot(&self, kind: ContextKind) -> &Mutex<Option<Arc<SyncContext>>> {
        match kind {
            ContextKind::Batch => &self.batch,
            ContextKind::Foreground => &self.foreground,
        }
    }

    async fn context_for(
        &self,
        kind: ContextKind,
        identity: &Identity,
    ) -> Result<Arc<SyncContext>, SyncError> {
        identity.validate()?;
        let mut slot = self.slot(kind).lock().await;
        if let Some(context) = slot.as_ref() {
            if !context.is_disposed() && context.identity() == identity {
                tracing::debug!(context_id = context.id(), kind = kind.as_str(), "reusing sync context");
                return Ok(Arc::clone(context));
            }
            tracing::info!(
                context_id = context.id(),
                kind = kind.as_str(),
                "identity changed, replacing sync context"
            );
            context.dispose().await;
        }

        let context = Arc::new(SyncContext::new(
            identity.clone(),
            self.settings.concurrency,
        )?);
        tracing::info!(context_id = context.id(), kind = kind.as_str(), "created sync context");
        *slot = Some(Arc::clone(&context));
        Ok(context)
    }

    /// Drops `context` from its slot if it is still the live one.
    async fn retire(&self, kind: ContextKind, context: &Arc<SyncContext>) {
        let mut slot = self.slot(kind).lock().await;
        if slot
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, context))
        {
            slot.take();
            drop(slot);
            tracing::info!(context_id = context.id(), kind = kind.as_str(), "retiring sync context");
            context.dispose().await;
        }
    }
}

#[cfg(test)]
#[path = "orchestrator_tests.rs"]
mod tests;
