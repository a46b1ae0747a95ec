use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;

/// A zero-argument unit of work. Returning `Err` aborts the rest of the queue.
pub type Job<E> = BoxFuture<'static, Result<(), E>>;

/// Concurrency used for a machine with `parallelism` hardware threads: half of
/// them, rounded up, and never fewer than two.
pub fn concurrency_for(parallelism: usize) -> usize {
    parallelism.div_ceil(2).max(2)
}

pub fn default_concurrency() -> usize {
    let parallelism = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    concurrency_for(parallelism)
}

struct QueueState<E> {
    // Bumped by `clear`; jobs submitted under an older generation never start.
    generation: AtomicU64,
    first_error: Mutex<Option<E>>,
}

impl<E> QueueState<E> {
    fn clear(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    fn record_error(&self, err: E) {
        let mut slot = self.first_error.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
        drop(slot);
        self.clear();
    }
}

/// Bounded-concurrency runner for [`Job`]s.
///
/// Up to `concurrency` jobs run at once. The first job error is kept and
/// clears every job that has not started yet; running jobs are left to
/// finish. The error is handed back by the next [`WorkQueue::await_idle`].
pub struct WorkQueue<E> {
    permits: Arc<Semaphore>,
    concurrency: usize,
    tracker: TaskTracker,
    state: Arc<QueueState<E>>,
}

impl<E: Send + 'static> WorkQueue<E> {
    pub fn new(concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            permits: Arc::new(Semaphore::new(concurrency)),
            concurrency,
            tracker: TaskTracker::new(),
            state: Arc::new(QueueState {
                generation: AtomicU64::new(0),
                first_error: Mutex::new(None),
            }),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn is_empty(&self) -> bool {
        self.tracker.is_empty()
    }

    pub fn submit_all<I>(&self, jobs: I)
    where
        I: IntoIterator<Item = Job<E>>,
    {
        for job in jobs {
            let permits = Arc::clone(&self.permits);
            let state = Arc::clone(&self.state);
            let generation = state.generation.load(Ordering::SeqCst);
            self.tracker.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return;
                };
                if state.generation.load(Ordering::SeqCst) != generation {
                    return;
                }
                if let Err(err) = job.await {
                    state.record_error(err);
                }
            });
        }
    }

    /// Drops every job that has not started yet.
    pub fn clear(&self) {
        self.state.clear();
    }

    /// Waits until every submitted job has settled. Any job error stays queued
    /// for the next [`WorkQueue::await_idle`].
    pub async fn wait_settled(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Waits until every submitted job has settled and returns the first job
    /// error seen since the previous call.
    pub async fn await_idle(&self) -> Result<(), E> {
        self.wait_settled().await;
        match self.state.first_error.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
