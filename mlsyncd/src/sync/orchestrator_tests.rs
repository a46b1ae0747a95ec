use super::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::time::Duration;

use async_trait::async_trait;
use mlsync_core::{FailureKind, IndexingError, MediaKind};
use parking_lot::Mutex as SyncMutex;
use tokio::sync::Notify;

use crate::sync::collaborators::ProcessingRecord;

#[derive(Debug, Clone, Copy)]
enum Failure {
    Status(u16),
    Kind(FailureKind),
    Network,
}

impl Failure {
    fn to_error(self) -> IndexingError {
        match self {
            Failure::Status(code) => IndexingError::Http {
                status: code.try_into().unwrap(),
                body: String::new(),
            },
            Failure::Kind(kind) => IndexingError::failed(kind, "indexer failure"),
            Failure::Network => IndexingError::Network("connection reset".into()),
        }
    }
}

struct FakeLibrary {
    items: HashMap<ItemId, ItemMetadata>,
}

#[async_trait]
impl LocalItemSource for FakeLibrary {
    async fn local_items(
        &self,
        _user_id: i64,
    ) -> Result<HashMap<ItemId, ItemMetadata>, StoreError> {
        Ok(self.items.clone())
    }
}

#[derive(Default)]
struct FakeStore {
    out_of_sync: SyncMutex<Vec<ItemId>>,
    records: SyncMutex<HashMap<ItemId, ProcessingRecord>>,
    failures: SyncMutex<Vec<ItemId>>,
    queried_owners: SyncMutex<Vec<i64>>,
    version: SyncMutex<i64>,
    increments: AtomicUsize,
    fail_increment: AtomicBool,
}

impl FakeStore {
    fn with_out_of_sync(ids: &[i64]) -> Self {
        let store = Self::default();
        *store.out_of_sync.lock() = ids.iter().copied().map(ItemId).collect();
        store
    }

    fn set_record(&self, id: i64, version: i64) {
        self.records.lock().insert(
            ItemId(id),
            ProcessingRecord {
                item_id: ItemId(id),
                schema_version: version,
                error_count: 0,
                last_error: None,
            },
        );
    }

    fn increments(&self) -> usize {
        self.increments.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProcessingStore for FakeStore {
    async fn out_of_sync_ids(
        &self,
        owner_id: i64,
        batch_size: usize,
        _current_version: i64,
        _max_error_count: u32,
    ) -> Result<Vec<ItemId>, StoreError> {
        self.queried_owners.lock().push(owner_id);
        Ok(self
            .out_of_sync
            .lock()
            .iter()
            .copied()
            .take(batch_size)
            .collect())
    }

    async fn processing_record(
        &self,
        id: ItemId,
    ) -> Result<Option<ProcessingRecord>, StoreError> {
        Ok(self.records.lock().get(&id).cloned())
    }

    async fn increment_index_version(&self, _scope: &str) -> Result<i64, StoreError> {
        self.increments.fetch_add(1, Ordering::SeqCst);
        if self.fail_increment.load(Ordering::SeqCst) {
            return Err(StoreError::backend(std::io::Error::other("disk full")));
        }
        let mut version = self.version.lock();
        *version += 1;
        Ok(*version)
    }

    async fn mark_indexed(&self, id: ItemId, version: i64) -> Result<(), StoreError> {
        self.set_record(id.0, version);
        Ok(())
    }

    async fn record_failure(
        &self,
        id: ItemId,
        _failure: &IndexingError,
    ) -> Result<(), StoreError> {
        self.failures.lock().push(id);
        Ok(())
    }
}

#[derive(Default)]
struct FakeIndexer {
    fail_all: Option<Failure>,
    failures: HashMap<ItemId, Failure>,
    delay: Option<Duration>,
    gate: Option<(Notify, Notify)>,
    calls: SyncMutex<Vec<ItemId>>,
    user_agents: SyncMutex<Vec<String>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl FakeIndexer {
    fn failing_all(failure: Failure) -> Self {
        Self {
            fail_all: Some(failure),
            ..Self::default()
        }
    }

    fn failing(ids: &[(i64, Failure)]) -> Self {
        Self {
            failures: ids.iter().map(|(id, f)| (ItemId(*id), *f)).collect(),
            ..Self::default()
        }
    }

    fn calls(&self) -> Vec<ItemId> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Indexer for FakeIndexer {
    async fn index(
        &self,
        item: &ItemMetadata,
        _raw_bytes: Option<Vec<u8>>,
        user_agent: &str,
    ) -> Result<(), IndexingError> {
        self.calls.lock().push(item.id);
        self.user_agents.lock().push(user_agent.to_string());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        if let Some((started, release)) = &self.gate {
            started.notify_one();
            release.notified().await;
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(failure) = self.fail_all.or_else(|| self.failures.get(&item.id).copied()) {
            return Err(failure.to_error());
        }
        Ok(())
    }
}

struct Harness {
    orchestrator: Arc<SyncOrchestrator>,
    store: Arc<FakeStore>,
    indexer: Arc<FakeIndexer>,
}

fn identity() -> Identity {
    Identity::new("session-token", 7, "mlsync-test/1.0")
}

fn item(id: i64) -> ItemMetadata {
    ItemMetadata {
        id: ItemId(id),
        owner_id: 7,
        title: format!("IMG_{id:04}.jpg"),
        kind: MediaKind::Image,
        local_path: None,
        size: Some(1024),
        modified: None,
    }
}

fn settings(concurrency: usize) -> SyncSettings {
    SyncSettings {
        batch_size: DEFAULT_BATCH_SIZE,
        current_version: DEFAULT_SCHEMA_VERSION,
        max_sync_error_count: MAX_SYNC_ERROR_COUNT,
        concurrency,
    }
}

fn harness_with(
    local: &[i64],
    store: FakeStore,
    indexer: FakeIndexer,
    settings: SyncSettings,
) -> Harness {
    let library = Arc::new(FakeLibrary {
        items: local.iter().map(|id| (ItemId(*id), item(*id))).collect(),
    });
    let store = Arc::new(store);
    let indexer = Arc::new(indexer);
    let orchestrator = Arc::new(SyncOrchestrator::new(
        library,
        Arc::clone(&store) as Arc<dyn ProcessingStore>,
        Arc::clone(&indexer) as Arc<dyn Indexer>,
        settings,
    ));
    Harness {
        orchestrator,
        store,
        indexer,
    }
}

fn harness(ids: &[i64], indexer: FakeIndexer) -> Harness {
    harness_with(ids, FakeStore::with_out_of_sync(ids), indexer, settings(2))
}

#[tokio::test]
async fn batch_run_processes_each_item_once_and_bumps_version_once() {
    let h = harness(&[1, 2, 3, 4, 5], FakeIndexer::default());

    let report = h.orchestrator.sync_report(&identity()).await.unwrap();

    assert_eq!(report.pending, 5);
    assert_eq!(report.processed, 5);
    assert_eq!(report.run_error, None);
    assert_eq!(report.index_version, Some(1));
    assert_eq!(h.store.increments(), 1);
    let mut calls = h.indexer.calls();
    calls.sort();
    assert_eq!(calls, (1..=5).map(ItemId).collect::<Vec<_>>());
    assert!(report.made_progress());
}

#[tokio::test]
async fn out_of_sync_query_is_scoped_to_the_callers_user() {
    let h = harness(&[1], FakeIndexer::default());

    h.orchestrator.sync(&identity()).await.unwrap();

    assert_eq!(h.store.queried_owners.lock().clone(), vec![7]);
}

#[tokio::test]
async fn sync_returns_true_only_when_work_was_pending() {
    let h = harness(&[1, 2], FakeIndexer::default());
    assert!(h.orchestrator.sync(&identity()).await.unwrap());

    let idle = harness_with(
        &[1, 2],
        FakeStore::default(),
        FakeIndexer::default(),
        settings(2),
    );
    assert!(!idle.orchestrator.sync(&identity()).await.unwrap());
    assert!(idle.indexer.calls().is_empty());
    assert_eq!(idle.store.increments(), 0);
}

#[tokio::test]
async fn indexer_receives_the_callers_user_agent() {
    let h = harness(&[1], FakeIndexer::default());

    h.orchestrator.sync(&identity()).await.unwrap();

    assert_eq!(
        h.indexer.user_agents.lock().clone(),
        vec!["mlsync-test/1.0".to_string()]
    );
}

#[tokio::test]
async fn session_expiry_aborts_the_rest_of_the_run() {
    let h = harness(
        &[1, 2, 3, 4, 5, 6],
        FakeIndexer::failing_all(Failure::Kind(FailureKind::SessionExpired)),
    );

    let report = h.orchestrator.sync_report(&identity()).await.unwrap();

    assert!(h.indexer.calls().len() <= 2, "calls: {:?}", h.indexer.calls());
    assert_eq!(report.processed, 0);
    assert_eq!(report.run_error, Some(FatalRunError::SessionExpired));
    assert!(!report.made_progress());
    assert_eq!(h.store.increments(), 1);
    assert!(h.store.failures.lock().is_empty());
}

#[tokio::test]
async fn sync_returns_false_after_fatal_error() {
    let h = harness(
        &[1, 2, 3],
        FakeIndexer::failing_all(Failure::Kind(FailureKind::SessionExpired)),
    );

    assert!(!h.orchestrator.sync(&identity()).await.unwrap());
}

#[tokio::test]
async fn unauthorized_status_is_fatal_after_translation() {
    let h = harness(&[1, 2, 3], FakeIndexer::failing_all(Failure::Status(401)));

    let report = h.orchestrator.sync_report(&identity()).await.unwrap();

    assert_eq!(report.run_error, Some(FatalRunError::SessionExpired));
}

#[tokio::test]
async fn network_failure_is_fatal() {
    let h = harness(&[1, 2, 3], FakeIndexer::failing_all(Failure::Network));

    let report = h.orchestrator.sync_report(&identity()).await.unwrap();

    assert_eq!(report.run_error, Some(FatalRunError::NetworkError));
}

#[tokio::test]
async fn item_failures_are_absorbed_and_the_run_completes() {
    let h = harness(
        &[1, 2, 3, 4],
        FakeIndexer::failing(&[
            (2, Failure::Status(500)),
            (3, Failure::Kind(FailureKind::UnsupportedFormat)),
        ]),
    );

    let report = h.orchestrator.sync_report(&identity()).await.unwrap();

    assert_eq!(h.indexer.calls().len(), 4);
    assert_eq!(report.processed, 4);
    assert_eq!(report.run_error, None);
    assert!(report.made_progress());
    assert_eq!(h.store.increments(), 1);
    let mut failures = h.store.failures.lock().clone();
    failures.sort();
    assert_eq!(failures, vec![ItemId(2), ItemId(3)]);
    assert!(h.store.records.lock().contains_key(&ItemId(1)));
    assert!(!h.store.records.lock().contains_key(&ItemId(2)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn in_flight_items_never_exceed_concurrency() {
    let ids: Vec<i64> = (1..=20).collect();
    let indexer = FakeIndexer {
        delay: Some(Duration::from_millis(5)),
        ..FakeIndexer::default()
    };
    let h = harness_with(&ids, FakeStore::with_out_of_sync(&ids), indexer, settings(3));

    let report = h.orchestrator.sync_report(&identity()).await.unwrap();

    assert_eq!(report.processed, 20);
    let peak = h.indexer.peak.load(Ordering::SeqCst);
    assert!(peak <= 3, "peak concurrency was {peak}");
}

#[tokio::test]
async fn items_at_current_version_are_not_reindexed() {
    let store = FakeStore::with_out_of_sync(&[1, 2, 3]);
    store.set_record(2, DEFAULT_SCHEMA_VERSION);
    let h = harness_with(&[1, 2, 3], store, FakeIndexer::default(), settings(2));

    let report = h.orchestrator.sync_report(&identity()).await.unwrap();

    let calls = h.indexer.calls();
    assert_eq!(calls.len(), 2);
    assert!(!calls.contains(&ItemId(2)));
    assert_eq!(report.processed, 3);
}

#[tokio::test]
async fn out_of_sync_id_without_local_item_fails_the_run() {
    let h = harness_with(
        &[1, 3],
        FakeStore::with_out_of_sync(&[1, 2, 3]),
        FakeIndexer::default(),
        settings(2),
    );

    let err = h.orchestrator.sync(&identity()).await.unwrap_err();

    assert!(matches!(err, SyncError::MissingLocalItem(ItemId(2))));
    assert!(h.indexer.calls().is_empty());
    assert_eq!(h.store.increments(), 0);
    assert!(!h.orchestrator.is_syncing());
}

#[tokio::test]
async fn missing_token_is_rejected_before_any_context_exists() {
    let h = harness(&[1], FakeIndexer::default());

    let err = h
        .orchestrator
        .sync(&Identity::new("", 7, "ua"))
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::InvalidIdentity(_)));
    assert_eq!(h.orchestrator.batch_context_id().await, None);
    assert!(h.indexer.calls().is_empty());
}

#[tokio::test]
async fn batch_context_is_reused_between_runs() {
    let h = harness(&[1, 2], FakeIndexer::default());

    let first = h.orchestrator.sync_report(&identity()).await.unwrap();
    let second = h.orchestrator.sync_report(&identity()).await.unwrap();

    assert_eq!(first.context_id, second.context_id);
    assert_eq!(
        h.orchestrator.batch_context_id().await,
        Some(first.context_id)
    );
    assert_eq!(h.store.increments(), 2);
}

#[tokio::test]
async fn aborted_batch_context_is_replaced_on_next_run() {
    let h = harness(
        &[1, 2],
        FakeIndexer::failing_all(Failure::Kind(FailureKind::NetworkError)),
    );

    let first = h.orchestrator.sync_report(&identity()).await.unwrap();
    assert_eq!(h.orchestrator.batch_context_id().await, None);
    let second = h.orchestrator.sync_report(&identity()).await.unwrap();

    assert_ne!(first.context_id, second.context_id);
}

#[tokio::test]
async fn identity_change_replaces_batch_context() {
    let h = harness(&[1], FakeIndexer::default());

    let first = h.orchestrator.sync_report(&identity()).await.unwrap();
    let refreshed = Identity::new("refreshed-token", 7, "mlsync-test/1.0");
    let second = h.orchestrator.sync_report(&refreshed).await.unwrap();

    assert_ne!(first.context_id, second.context_id);
}

#[tokio::test]
async fn is_syncing_is_set_while_jobs_run() {
    let indexer = FakeIndexer {
        gate: Some((Notify::new(), Notify::new())),
        ..FakeIndexer::default()
    };
    let h = harness(&[1], indexer);
    assert!(!h.orchestrator.is_syncing());

    let orchestrator = Arc::clone(&h.orchestrator);
    let run = tokio::spawn(async move { orchestrator.sync(&identity()).await });
    let (started, release) = h.indexer.gate.as_ref().unwrap();
    started.notified().await;
    assert!(h.orchestrator.is_syncing());
    release.notify_one();

    assert!(run.await.unwrap().unwrap());
    assert!(!h.orchestrator.is_syncing());
}

#[tokio::test]
async fn sync_one_reuses_the_foreground_context() {
    let h = harness(&[], FakeIndexer::default());

    h.orchestrator
        .sync_one(&identity(), &item(1), None)
        .await
        .unwrap();
    let first = h.orchestrator.foreground_context_id().await;
    h.orchestrator
        .sync_one(&identity(), &item(2), Some(b"raw".to_vec()))
        .await
        .unwrap();

    assert!(first.is_some());
    assert_eq!(h.orchestrator.foreground_context_id().await, first);
    assert_eq!(h.orchestrator.batch_context_id().await, None);
    assert_eq!(h.indexer.calls(), vec![ItemId(1), ItemId(2)]);
}

#[tokio::test]
async fn foreground_context_is_recycled_after_a_full_batch() {
    let h = harness(&[], FakeIndexer::default());

    let mut first_id = None;
    for id in 1..=DEFAULT_BATCH_SIZE as i64 {
        let outcome = h
            .orchestrator
            .sync_one(&identity(), &item(id), None)
            .await
            .unwrap();
        assert_eq!(outcome, ItemOutcome::Indexed);
        if id == 1 {
            first_id = h.orchestrator.foreground_context_id().await;
        }
    }
    assert!(first_id.is_some());
    assert_eq!(h.orchestrator.foreground_context_id().await, None);

    h.orchestrator
        .sync_one(&identity(), &item(10_000), None)
        .await
        .unwrap();
    let next_id = h.orchestrator.foreground_context_id().await;
    assert!(next_id.is_some());
    assert_ne!(next_id, first_id);
}

#[tokio::test]
async fn sync_one_skips_items_already_at_current_version() {
    let store = FakeStore::default();
    store.set_record(5, DEFAULT_SCHEMA_VERSION);
    let h = harness_with(&[], store, FakeIndexer::default(), settings(2));

    let outcome = h
        .orchestrator
        .sync_one(&identity(), &item(5), None)
        .await
        .unwrap();

    assert_eq!(outcome, ItemOutcome::AlreadyCurrent);
    assert!(h.indexer.calls().is_empty());
}

#[tokio::test]
async fn sync_one_reports_absorbed_failures_as_outcomes() {
    let h = harness(&[], FakeIndexer::failing(&[(4, Failure::Status(413))]));

    let outcome = h
        .orchestrator
        .sync_one(&identity(), &item(4), None)
        .await
        .unwrap();

    assert_eq!(outcome, ItemOutcome::Absorbed(FailureKind::FileTooLarge));
    assert_eq!(h.store.failures.lock().clone(), vec![ItemId(4)]);
}

#[tokio::test]
async fn sync_one_returns_fatal_errors_to_the_caller() {
    let h = harness(
        &[],
        FakeIndexer::failing_all(Failure::Kind(FailureKind::SessionExpired)),
    );

    let err = h
        .orchestrator
        .sync_one(&identity(), &item(1), None)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        SyncError::Fatal(FatalRunError::SessionExpired)
    ));
    assert!(h.orchestrator.foreground_context_id().await.is_some());
    assert!(h.store.failures.lock().is_empty());
}

#[tokio::test]
async fn sync_one_rejects_missing_token() {
    let h = harness(&[], FakeIndexer::default());

    let err = h
        .orchestrator
        .sync_one(&Identity::new("", 7, "ua"), &item(1), None)
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::InvalidIdentity(_)));
    assert_eq!(h.orchestrator.foreground_context_id().await, None);
}

#[tokio::test]
async fn close_foreground_context_tears_it_down() {
    let h = harness(&[], FakeIndexer::default());
    h.orchestrator
        .sync_one(&identity(), &item(1), None)
        .await
        .unwrap();

    h.orchestrator.close_foreground_context().await;
    assert_eq!(h.orchestrator.foreground_context_id().await, None);

    h.orchestrator.close_foreground_context().await;
    assert_eq!(h.orchestrator.foreground_context_id().await, None);
}

#[tokio::test]
async fn shutdown_disposes_both_contexts() {
    let h = harness(&[1], FakeIndexer::default());
    h.orchestrator.sync(&identity()).await.unwrap();
    h.orchestrator
        .sync_one(&identity(), &item(1), None)
        .await
        .unwrap();

    h.orchestrator.shutdown().await;

    assert_eq!(h.orchestrator.batch_context_id().await, None);
    assert_eq!(h.orchestrator.foreground_context_id().await, None);
}

#[tokio::test]
async fn concurrent_first_sync_one_calls_share_one_foreground_context() {
    let indexer = FakeIndexer {
        delay: Some(Duration::from_millis(20)),
        ..FakeIndexer::default()
    };
    let h = harness(&[], indexer);
    let identity = identity();
    let item1 = item(1);
    let item2 = item(2);

    let (first, second, during) = tokio::join!(
        h.orchestrator.sync_one(&identity, &item1, None),
        h.orchestrator.sync_one(&identity, &item2, None),
        async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            h.orchestrator.foreground_context_id().await
        }
    );

    assert_eq!(first.unwrap(), ItemOutcome::Indexed);
    assert_eq!(second.unwrap(), ItemOutcome::Indexed);
    assert!(during.is_some());
    assert_eq!(h.orchestrator.foreground_context_id().await, during);
    assert_eq!(h.indexer.calls().len(), 2);
}

#[tokio::test]
async fn concurrent_batch_runs_share_one_batch_context() {
    let h = harness(&[1, 2], FakeIndexer::default());
    let identity = identity();

    let (first, second) = tokio::join!(
        h.orchestrator.sync_report(&identity),
        h.orchestrator.sync_report(&identity)
    );
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_eq!(first.context_id, second.context_id);
    assert_eq!(first.run_error, None);
    assert_eq!(second.run_error, None);
    assert_eq!(h.orchestrator.batch_context_id().await, Some(first.context_id));
}

#[tokio::test]
async fn shutdown_during_a_batch_run_keeps_its_run_error() {
    let indexer = FakeIndexer {
        fail_all: Some(Failure::Network),
        gate: Some((Notify::new(), Notify::new())),
        ..FakeIndexer::default()
    };
    let h = harness(&[1], indexer);

    let orchestrator = Arc::clone(&h.orchestrator);
    let run = tokio::spawn(async move { orchestrator.sync_report(&identity()).await });
    let (started, release) = h.indexer.gate.as_ref().unwrap();
    started.notified().await;
    let orchestrator = Arc::clone(&h.orchestrator);
    let shutdown = tokio::spawn(async move { orchestrator.shutdown().await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    release.notify_one();

    shutdown.await.unwrap();
    let report = run.await.unwrap().unwrap();

    assert_eq!(report.run_error, Some(FatalRunError::NetworkError));
    assert!(!report.made_progress());
    assert_eq!(h.orchestrator.batch_context_id().await, None);
}

#[tokio::test]
async fn failed_version_bump_still_retires_an_aborted_context() {
    let store = FakeStore::with_out_of_sync(&[1]);
    store.fail_increment.store(true, Ordering::SeqCst);
    let h = harness_with(
        &[1],
        store,
        FakeIndexer::failing_all(Failure::Status(401)),
        settings(2),
    );

    let err = h.orchestrator.sync_report(&identity()).await.unwrap_err();

    assert!(matches!(err, SyncError::Store(_)), "got {err:?}");
    assert_eq!(h.orchestrator.batch_context_id().await, None);

    h.store.fail_increment.store(false, Ordering::SeqCst);
    let report = h.orchestrator.sync_report(&identity()).await.unwrap();
    assert_eq!(report.run_error, Some(FatalRunError::SessionExpired));
    assert_eq!(report.index_version, Some(1));
}
