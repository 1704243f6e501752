use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::core::queue::{Queue, QueueError, Runner};
use crate::core::Utc;

/// How long `close` waits for workers after cancelling in-flight jobs before aborting them.
const ABORT_GRACE: Duration = Duration::from_secs(1);

/// Options for [`WorkerPool`].
#[derive(Debug, Clone)]
pub struct WorkerPoolOptions {
    pub(crate) size: usize,
    pub(crate) error_backoff: Duration,
}

impl WorkerPoolOptions {
    pub fn new(size: usize) -> Self {
        Self {
            size: size.max(1),
            ..Self::default()
        }
    }

    /// How long a worker sleeps after the queue returned an error.
    pub fn with_error_backoff(mut self, error_backoff: Duration) -> Self {
        self.error_backoff = error_backoff;
        self
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl Default for WorkerPoolOptions {
    fn default() -> Self {
        Self {
            size: 1,
            error_backoff: Duration::from_secs(1),
        }
    }
}

/// A fixed-size pool of tokio workers pulling jobs from one queue.
///
/// Each worker claims a job with [`Queue::next`], runs it, and hands it back with
/// [`Queue::complete`]. Closing first stops intake and lets running jobs finish; once the drain
/// timeout elapses the jobs' cancellation token fires, and workers that still do not exit are
/// aborted.
///
/// ```rust,no_run
/// use proving_ground::runner::worker_pool::{WorkerPool, WorkerPoolOptions};
/// use proving_ground::core::queue::Runner;
///
/// # async fn example() {
/// let pool = WorkerPool::new(WorkerPoolOptions::new(4));
/// assert!(!pool.started());
/// pool.close(std::time::Duration::from_millis(500)).await;
/// # }
/// ```
pub struct WorkerPool {
    options: WorkerPoolOptions,
    started: AtomicBool,
    active: Arc<AtomicUsize>,
    state: Mutex<Option<PoolState>>,
}

struct PoolState {
    intake: CancellationToken,
    jobs: CancellationToken,
    workers: JoinSet<()>,
}

impl WorkerPool {
    pub fn new(options: WorkerPoolOptions) -> Self {
        Self {
            options,
            started: AtomicBool::new(false),
            active: Arc::new(AtomicUsize::new(0)),
            state: Mutex::new(None),
        }
    }

    pub fn size(&self) -> usize {
        self.options.size
    }
}

#[async_trait]
impl Runner for WorkerPool {
    fn started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn active_workers(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    #[instrument(skip_all, err, fields(queue = %queue.id(), size = self.options.size))]
    async fn start(
        &self,
        queue: Arc<dyn Queue>,
        cancellation_token: CancellationToken,
    ) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Err(QueueError::AlreadyStarted(queue.id().to_string()));
        }

        let intake = cancellation_token.child_token();
        let jobs = cancellation_token.child_token();
        let mut workers = JoinSet::new();
        for worker_id in 0..self.options.size {
            self.active.fetch_add(1, Ordering::SeqCst);
            workers.spawn(worker_loop(
                worker_id,
                Arc::clone(&queue),
                intake.clone(),
                jobs.clone(),
                self.options.error_backoff,
                ActiveGuard(Arc::clone(&self.active)),
            ));
        }

        *state = Some(PoolState {
            intake,
            jobs,
            workers,
        });
        self.started.store(true, Ordering::SeqCst);
        tracing::debug!("Worker pool started");
        Ok(())
    }

    #[instrument(skip_all, fields(size = self.options.size))]
    async fn close(&self, drain_timeout: Duration) {
        let Some(mut state) = self.state.lock().await.take() else {
            return;
        };

        state.intake.cancel();
        if tokio::time::timeout(drain_timeout, join_all(&mut state.workers))
            .await
            .is_err()
        {
            tracing::info!(
                "Workers did not drain within {:?}, cancelling in-flight jobs",
                drain_timeout
            );
            state.jobs.cancel();
            if tokio::time::timeout(ABORT_GRACE, join_all(&mut state.workers))
                .await
                .is_err()
            {
                tracing::warn!("Aborting {} unresponsive workers", state.workers.len());
                state.workers.shutdown().await;
            }
        }
        state.jobs.cancel();
        self.started.store(false, Ordering::SeqCst);
        tracing::debug!("Worker pool closed");
    }
}

async fn join_all(workers: &mut JoinSet<()>) {
    while let Some(result) = workers.join_next().await {
        if let Err(e) = result {
            if e.is_panic() {
                tracing::error!("Worker panicked: {}", e);
            }
        }
    }
}

/// Decrements the active worker count when a worker exits, including by abort.
struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[instrument(skip_all, fields(worker_id = worker_id, queue = %queue.id()))]
async fn worker_loop(
    worker_id: usize,
    queue: Arc<dyn Queue>,
    intake: CancellationToken,
    jobs: CancellationToken,
    error_backoff: Duration,
    _guard: ActiveGuard,
) {
    loop {
        if intake.is_cancelled() {
            break;
        }
        match queue.next(intake.clone()).await {
            Ok(Some(mut job)) => {
                job.base_mut().status.in_progress = true;
                job.base_mut().time_info.start = Some(Utc::now());
                tracing::trace!(jid = %job.id(), "Running job");
                job.run(jobs.child_token()).await;
                if let Err(e) = queue.complete(job.as_ref()).await {
                    tracing::error!(jid = %job.id(), "Failed to complete job: {}", e);
                }
            }
            Ok(None) => {
                // A queue may return without a job before intake closes; do not spin on it.
                tokio::select! {
                    _ = tokio::time::sleep(error_backoff) => {}
                    _ = intake.cancelled() => {}
                }
            }
            Err(e) => {
                tracing::error!("Encountered QueueError: {}", e);
                tokio::select! {
                    _ = tokio::time::sleep(error_backoff) => {}
                    _ = intake.cancelled() => {}
                }
            }
        }
    }
    tracing::trace!("Worker stopped");
}
