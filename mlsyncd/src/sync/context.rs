use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use mlsync_core::{Identity, IdentityError, ItemId, ItemMetadata};
use parking_lot::{Mutex, RwLock};

use super::classifier::FatalRunError;
use super::queue::WorkQueue;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Mutable state for one sync session.
///
/// A context owns its work queue and local item snapshot exclusively. Once
/// disposed it must not be reused; callers create a fresh one instead.
pub struct SyncContext {
    id: u64,
    identity: Identity,
    local_items: RwLock<Option<Arc<HashMap<ItemId, ItemMetadata>>>>,
    pending: Mutex<Vec<ItemMetadata>>,
    processed: AtomicUsize,
    run_error: OnceLock<FatalRunError>,
    queue: WorkQueue<FatalRunError>,
    disposed: AtomicBool,
}

impl SyncContext {
    pub fn new(identity: Identity, concurrency: usize) -> Result<Self, IdentityError> {
        identity.validate()?;
        Ok(Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            identity,
            local_items: RwLock::new(None),
            pending: Mutex::new(Vec::new()),
            processed: AtomicUsize::new(0),
            run_error: OnceLock::new(),
            queue: WorkQueue::new(concurrency),
            disposed: AtomicBool::new(false),
        })
    }

    /// Process-unique serial number, used to tell context instances apart.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn user_agent(&self) -> &str {
        &self.identity.user_agent
    }

    pub fn queue(&self) -> &WorkQueue<FatalRunError> {
        &self.queue
    }

    pub fn install_local_items(&self, items: HashMap<ItemId, ItemMetadata>) {
        *self.local_items.write() = Some(Arc::new(items));
    }

    pub fn local_item_count(&self) -> usize {
        self.local_items
            .read()
            .as_ref()
            .map(|items| items.len())
            .unwrap_or(0)
    }

    /// Maps out-of-sync ids to their local metadata and stores the result as
    /// the pending set. Fails with the first id that has no local item.
    pub fn resolve_pending(&self, ids: &[ItemId]) -> Result<Vec<ItemMetadata>, ItemId> {
        let snapshot = self.local_items.read().clone();
        let mut pending = Vec::with_capacity(ids.len());
        for id in ids {
            let item = snapshot
                .as_ref()
                .and_then(|items| items.get(id))
                .ok_or(*id)?;
            pending.push(item.clone());
        }
        *self.pending.lock() = pending.clone();
        Ok(pending)
    }

    pub fn pending_items(&self) -> Vec<ItemMetadata> {
        self.pending.lock().clone()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn processed_count(&self) -> usize {
        self.processed.load(Ordering::SeqCst)
    }

    pub(crate) fn record_processed(&self) -> usize {
        self.processed.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn run_error(&self) -> Option<FatalRunError> {
        self.run_error.get().copied()
    }

    /// Stores the run error unless one is already set. Returns whether this
    /// call won.
    pub fn set_run_error(&self, err: FatalRunError) -> bool {
        self.run_error.set(err).is_ok()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Releases the snapshot and waits for queued work to settle. Safe to call
    /// more than once.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.local_items.write().take();
        self.pending.lock().clear();
        self.queue.wait_settled().await;
        tracing::debug!(context_id = self.id, "sync context disposed");
    }
}
