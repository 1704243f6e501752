use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use uuid::Uuid;

use crate::core::job::Job;
use crate::core::job_registry::{JobInterchange, JobRegistry, RegistryError};
use crate::core::queue::{Queue, QueueError, QueueParams, QueueStats, Runner};
use crate::core::Utc;
use crate::local::store::{JobKey, LocalStore, StoreState, StoredJob};
use crate::runner::worker_pool::{WorkerPool, WorkerPoolOptions};

/// Options for [`LocalQueue`].
#[derive(Debug, Clone)]
pub struct LocalQueueOptions {
    pub(crate) poll_interval: Duration,
    pub(crate) error_backoff: Duration,
}

impl LocalQueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// How long `next` sleeps when no job is dispatchable.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_error_backoff(mut self, error_backoff: Duration) -> Self {
        self.error_backoff = error_backoff;
        self
    }
}

impl Default for LocalQueueOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
            error_backoff: WorkerPoolOptions::default().error_backoff,
        }
    }
}

/// A queue persisted in a [`LocalStore`].
///
/// Jobs are kept as encoded [`JobInterchange`] documents, so everything read back goes through
/// the registry exactly like it would with a database. Any number of `LocalQueue`s may share one
/// store; claiming happens under the store lock, which makes a job visible to exactly one
/// claimant. A queue built with a group only sees jobs put into that group.
pub struct LocalQueue {
    id: String,
    group: Option<String>,
    store: LocalStore,
    registry: Arc<JobRegistry>,
    options: LocalQueueOptions,
    runner: Arc<WorkerPool>,
    this: Weak<LocalQueue>,
}

impl LocalQueue {
    pub fn new(store: LocalStore, params: &QueueParams, options: LocalQueueOptions) -> Arc<Self> {
        let pool_options =
            WorkerPoolOptions::new(params.pool_size()).with_error_backoff(options.error_backoff);
        Arc::new_cyclic(|this| Self {
            id: format!("local-{}", Uuid::now_v7()),
            group: params.group().map(str::to_string),
            store,
            registry: params.registry(),
            options,
            runner: Arc::new(WorkerPool::new(pool_options)),
            this: this.clone(),
        })
    }

    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    fn key(&self, id: &str) -> JobKey {
        (self.group.clone(), id.to_string())
    }

    fn in_scope(&self, key: &JobKey) -> bool {
        key.0 == self.group
    }

    fn check_open(&self, state: &StoreState) -> Result<(), QueueError> {
        if state.dropped {
            Err(QueueError::Closed(self.id.clone()))
        } else {
            Ok(())
        }
    }

    /// Claim the oldest dispatchable job in scope, if any.
    ///
    /// A stored job that cannot be rebuilt is marked poisoned and passed over, so it never holds
    /// up the jobs queued behind it.
    async fn claim(&self) -> Result<Option<Box<dyn Job>>, QueueError> {
        let mut state = self.store.state.lock().await;
        self.check_open(&state)?;

        let now = Utc::now();
        let mut candidates: Vec<(u64, JobKey)> = state
            .jobs
            .iter()
            .filter(|(key, job)| {
                self.in_scope(key)
                    && !job.poisoned
                    && !job.status.in_progress
                    && !job.status.completed
                    && job.time_info.is_dispatchable(now)
            })
            .map(|(key, job)| (job.seq, key.clone()))
            .collect();
        candidates.sort_unstable_by_key(|(seq, _)| *seq);

        for (_, key) in candidates {
            let Some(stored) = state.jobs.get_mut(&key) else {
                continue;
            };
            match self.rebuild_claimed(&stored.payload) {
                Ok((job, payload)) => {
                    stored.status.in_progress = true;
                    stored.payload = payload;
                    tracing::trace!(jid = %key.1, "Claimed job");
                    return Ok(Some(job));
                }
                Err(error) => {
                    tracing::warn!(jid = %key.1, "Skipping job that cannot be rebuilt: {}", error);
                    stored.poisoned = true;
                }
            }
        }
        Ok(None)
    }

    fn rebuild_claimed(&self, payload: &[u8]) -> Result<(Box<dyn Job>, Bytes), RegistryError> {
        let mut interchange = JobInterchange::from_bytes(payload)?;
        interchange.base.status.in_progress = true;
        let payload = interchange.to_bytes()?;
        let job = self.registry.rebuild(interchange)?;
        Ok((job, payload))
    }
}

#[async_trait]
impl Queue for LocalQueue {
    fn id(&self) -> &str {
        &self.id
    }

    #[instrument(skip_all, err, fields(queue = %self.id, jid = %job.id()))]
    async fn put(&self, job: Box<dyn Job>) -> Result<(), QueueError> {
        self.registry.check(job.job_type())?;
        let interchange = JobInterchange::from_job(job.as_ref())?;
        let payload = interchange.to_bytes()?;

        let mut state = self.store.state.lock().await;
        self.check_open(&state)?;
        let key = self.key(job.id());
        if state.jobs.contains_key(&key) {
            return Err(QueueError::duplicate_job(&self.id, job.id()));
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.jobs.insert(
            key,
            StoredJob {
                payload,
                status: interchange.base.status,
                time_info: interchange.base.time_info,
                seq,
                poisoned: false,
            },
        );
        Ok(())
    }

    #[instrument(skip_all, err, fields(queue = %self.id, jid = id))]
    async fn get(&self, id: &str) -> Result<Option<Box<dyn Job>>, QueueError> {
        let payload = {
            let state = self.store.state.lock().await;
            self.check_open(&state)?;
            match state.jobs.get(&self.key(id)) {
                Some(stored) => stored.payload.clone(),
                None => return Ok(None),
            }
        };
        Ok(Some(self.registry.rebuild_from_bytes(&payload)?))
    }

    async fn next(
        &self,
        cancellation_token: CancellationToken,
    ) -> Result<Option<Box<dyn Job>>, QueueError> {
        loop {
            if cancellation_token.is_cancelled() {
                return Ok(None);
            }
            if let Some(job) = self.claim().await? {
                return Ok(Some(job));
            }
            tokio::select! {
                _ = cancellation_token.cancelled() => return Ok(None),
                _ = tokio::time::sleep(self.options.poll_interval) => {}
            }
        }
    }

    #[instrument(skip_all, err, fields(queue = %self.id, jid = %job.id()))]
    async fn complete(&self, job: &dyn Job) -> Result<(), QueueError> {
        let interchange = JobInterchange::from_job(job)?;
        let payload = interchange.to_bytes()?;

        let mut state = self.store.state.lock().await;
        self.check_open(&state)?;
        let stored = state
            .jobs
            .get_mut(&self.key(job.id()))
            .ok_or_else(|| QueueError::job_not_found(&self.id, job.id()))?;
        stored.payload = payload;
        stored.status = interchange.base.status;
        stored.time_info = interchange.base.time_info;
        Ok(())
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let state = self.store.state.lock().await;
        self.check_open(&state)?;
        let mut stats = QueueStats::default();
        for job in state
            .jobs
            .iter()
            .filter(|(key, _)| self.in_scope(key))
            .map(|(_, job)| job)
        {
            stats.total += 1;
            if job.status.completed {
                stats.completed += 1;
            } else if job.status.in_progress {
                stats.running += 1;
            } else {
                stats.pending += 1;
            }
        }
        Ok(stats)
    }

    async fn start(&self, cancellation_token: CancellationToken) -> Result<(), QueueError> {
        let this = self
            .this
            .upgrade()
            .ok_or_else(|| QueueError::Closed(self.id.clone()))?;
        self.runner.start(this, cancellation_token).await
    }

    fn runner(&self) -> Arc<dyn Runner> {
        self.runner.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::StoreAdmin;
    use crate::core::Duration as ChronoDuration;
    use crate::local::store::MemoryAdmin;
    use crate::mock::{register_mock_jobs, CounterJob, ExecutionCounter, SleepJob};
    use std::time::Instant;

    async fn setup(pool_size: usize) -> (MemoryAdmin, LocalStore, ExecutionCounter, QueueParams) {
        let admin = MemoryAdmin::new();
        admin.create_store("s").await.unwrap();
        let store = admin.connect_store("s").await.unwrap();
        let counter = ExecutionCounter::new();
        let mut registry = JobRegistry::default();
        register_mock_jobs(&mut registry, &counter);
        let params = QueueParams::new("s", pool_size, Arc::new(registry));
        (admin, store, counter, params)
    }

    async fn wait_for_completed(queue: &LocalQueue, expected: usize) {
        let deadline = Instant::now() + std::time::Duration::from_secs(5);
        while queue.stats().await.unwrap().completed < expected {
            assert!(Instant::now() < deadline, "jobs did not complete in time");
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn put_then_get_returns_equal_job() {
        let (_admin, store, counter, params) = setup(1).await;
        let queue = LocalQueue::new(store, &params, LocalQueueOptions::default());

        let job = CounterJob::with_id("a", counter.clone());
        let expected = JobInterchange::from_job(&job).unwrap();
        queue.put(Box::new(job)).await.unwrap();

        let fetched = queue.get("a").await.unwrap().unwrap();
        assert_eq!(JobInterchange::from_job(fetched.as_ref()).unwrap(), expected);
        assert!(queue.get("b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_put_is_rejected() {
        let (_admin, store, counter, params) = setup(1).await;
        let queue = LocalQueue::new(store, &params, LocalQueueOptions::default());
        queue
            .put(Box::new(CounterJob::with_id("a", counter.clone())))
            .await
            .unwrap();
        let result = queue.put(Box::new(CounterJob::with_id("a", counter))).await;
        assert!(matches!(result, Err(QueueError::DuplicateJob { .. })));
    }

    #[tokio::test]
    async fn unregistered_job_type_is_rejected() {
        let (_admin, store, _counter, _) = setup(1).await;
        let params = QueueParams::new("s", 1, Arc::new(JobRegistry::default()));
        let queue = LocalQueue::new(store, &params, LocalQueueOptions::default());
        let result = queue.put(Box::new(SleepJob::new(Duration::ZERO))).await;
        assert!(matches!(result, Err(QueueError::Registry(_))));
    }

    #[tokio::test]
    async fn next_claims_each_job_once() {
        let (_admin, store, counter, params) = setup(1).await;
        let queue = LocalQueue::new(store, &params, LocalQueueOptions::default());
        queue
            .put(Box::new(CounterJob::with_id("a", counter)))
            .await
            .unwrap();

        let token = CancellationToken::new();
        let claimed = queue.next(token.clone()).await.unwrap().unwrap();
        assert_eq!(claimed.id(), "a");
        assert!(claimed.status().in_progress);
        assert_eq!(queue.stats().await.unwrap().running, 1);

        token.cancel();
        assert!(queue.next(token).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn next_waits_for_cancellation_when_empty() {
        let (_admin, store, _counter, params) = setup(1).await;
        let queue = LocalQueue::new(store, &params, LocalQueueOptions::default());
        let token = CancellationToken::new();
        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                token.cancel();
            })
        };
        assert!(queue.next(token).await.unwrap().is_none());
        canceller.await.unwrap();
    }

    #[tokio::test]
    async fn deferred_and_expired_jobs_are_not_claimed() {
        let (_admin, store, _counter, params) = setup(1).await;
        let queue = LocalQueue::new(store, &params, LocalQueueOptions::default());

        let mut deferred = SleepJob::new(Duration::ZERO);
        deferred.base_mut().time_info.wait_until = Some(Utc::now() + ChronoDuration::hours(1));
        let mut expired = SleepJob::new(Duration::ZERO);
        expired.base_mut().time_info.dispatch_by = Some(Utc::now() - ChronoDuration::seconds(1));
        queue.put(Box::new(deferred)).await.unwrap();
        queue.put(Box::new(expired)).await.unwrap();

        assert!(queue.claim().await.unwrap().is_none());
        assert_eq!(queue.stats().await.unwrap().pending, 2);
    }

    #[tokio::test]
    async fn mismatched_version_is_rejected_on_put() {
        let (_admin, store, counter, params) = setup(1).await;
        let queue = LocalQueue::new(store, &params, LocalQueueOptions::default());
        let mut job = CounterJob::with_id("v7", counter);
        job.base_mut().job_type.version = 7;

        let result = queue.put(Box::new(job)).await;
        assert!(matches!(
            result,
            Err(QueueError::Registry(RegistryError::VersionMismatch { .. }))
        ));
        assert_eq!(queue.stats().await.unwrap().total, 0);
    }

    async fn insert_raw(queue: &LocalQueue, id: &str, payload: Bytes) {
        let mut state = queue.store().state.lock().await;
        let seq = state.next_seq;
        state.next_seq += 1;
        state.jobs.insert(
            (None, id.to_string()),
            StoredJob {
                payload,
                status: Default::default(),
                time_info: Default::default(),
                seq,
                poisoned: false,
            },
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn unrebuildable_jobs_do_not_block_the_queue() {
        let (_admin, store, counter, params) = setup(4).await;
        let queue = LocalQueue::new(store, &params, LocalQueueOptions::default());

        let mut stale = CounterJob::with_id("stale", counter.clone());
        stale.base_mut().job_type.version = 7;
        let stale = JobInterchange::from_job(&stale).unwrap().to_bytes().unwrap();
        insert_raw(&queue, "stale", stale).await;
        insert_raw(&queue, "garbage", Bytes::from_static(b"{not json")).await;
        for _ in 0..5 {
            queue
                .put(Box::new(CounterJob::new(counter.clone())))
                .await
                .unwrap();
        }

        queue.start(CancellationToken::new()).await.unwrap();
        wait_for_completed(&queue, 5).await;
        queue.runner().close(std::time::Duration::from_millis(500)).await;

        assert_eq!(counter.count(), 5);
        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.completed, 5);
        assert_eq!(stats.pending, 2);
    }

    #[tokio::test]
    async fn complete_is_visible_to_get() {
        let (_admin, store, counter, params) = setup(1).await;
        let queue = LocalQueue::new(store, &params, LocalQueueOptions::default());
        queue
            .put(Box::new(CounterJob::with_id("a", counter.clone())))
            .await
            .unwrap();

        let mut job = queue.next(CancellationToken::new()).await.unwrap().unwrap();
        job.run(CancellationToken::new()).await;
        queue.complete(job.as_ref()).await.unwrap();

        let fetched = queue.get("a").await.unwrap().unwrap();
        assert!(fetched.status().completed);
        assert!(!fetched.status().in_progress);
        assert_eq!(counter.count(), 1);
        assert_eq!(queue.stats().await.unwrap().completed, 1);
    }

    #[tokio::test]
    async fn completing_unknown_job_fails() {
        let (_admin, store, counter, params) = setup(1).await;
        let queue = LocalQueue::new(store, &params, LocalQueueOptions::default());
        let job = CounterJob::with_id("ghost", counter);
        let result = queue.complete(&job).await;
        assert!(matches!(result, Err(QueueError::JobNotFound { .. })));
    }

    #[tokio::test]
    async fn groups_share_a_store_but_not_jobs() {
        let (_admin, store, counter, params) = setup(1).await;
        let a = LocalQueue::new(
            store.clone(),
            &params.clone().with_group("a"),
            LocalQueueOptions::default(),
        );
        let b = LocalQueue::new(store, &params.with_group("b"), LocalQueueOptions::default());

        a.put(Box::new(CounterJob::with_id("x", counter.clone())))
            .await
            .unwrap();
        assert!(b.get("x").await.unwrap().is_none());
        assert_eq!(b.stats().await.unwrap().total, 0);

        // The same id may exist once per group.
        b.put(Box::new(CounterJob::with_id("x", counter))).await.unwrap();
        assert_eq!(a.stats().await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn dropped_store_closes_queue() {
        let (admin, store, _counter, params) = setup(1).await;
        let queue = LocalQueue::new(store.clone(), &params, LocalQueueOptions::default());
        admin.disconnect(&store).await.unwrap();
        admin.drop_store("s").await.unwrap();
        assert!(matches!(
            queue.stats().await,
            Err(QueueError::Closed(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn pool_runs_every_job_exactly_once() {
        let (_admin, store, counter, params) = setup(4).await;
        let queue = LocalQueue::new(store, &params, LocalQueueOptions::default());
        for _ in 0..10 {
            queue
                .put(Box::new(CounterJob::new(counter.clone())))
                .await
                .unwrap();
        }

        queue.start(CancellationToken::new()).await.unwrap();
        assert!(queue.runner().started());
        wait_for_completed(&queue, 10).await;

        queue.runner().close(std::time::Duration::from_millis(500)).await;
        assert_eq!(counter.count(), 10);
        assert_eq!(queue.runner().active_workers(), 0);
    }

    #[tokio::test]
    async fn second_start_fails() {
        let (_admin, store, _counter, params) = setup(1).await;
        let queue = LocalQueue::new(store, &params, LocalQueueOptions::default());
        let token = CancellationToken::new();
        queue.start(token.clone()).await.unwrap();
        let result = queue.start(token).await;
        assert!(matches!(result, Err(QueueError::AlreadyStarted(_))));
        queue.runner().close(std::time::Duration::from_millis(100)).await;
    }
}
