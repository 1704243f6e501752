//! Deterministic jobs whose executions the harness can observe.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::job::{Job, JobBase, JobError, JobType};
use crate::core::job_registry::JobRegistry;

/// Counts how many times counter job bodies actually ran.
///
/// Cloning yields another handle to the same cell. Every scenario creates its own counter and
/// injects it into the job factories, so concurrent scenarios never share one.
#[derive(Debug, Clone, Default)]
pub struct ExecutionCounter {
    count: Arc<AtomicUsize>,
}

impl ExecutionCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.count.store(0, Ordering::SeqCst);
    }
}

/// Register [`CounterJob`] and [`SleepJob`]. Counter jobs built by the registry increment `counter`.
pub fn register_mock_jobs(registry: &mut JobRegistry, counter: &ExecutionCounter) {
    let counter = counter.clone();
    registry.add_job_type(CounterJob::job_type(), move || {
        Box::new(CounterJob::new(counter.clone())) as Box<dyn Job>
    });
    registry.add_job_type(SleepJob::job_type(), || {
        Box::new(SleepJob::new(Duration::ZERO)) as Box<dyn Job>
    });
}

/// Increments the execution counter, then marks itself complete.
pub struct CounterJob {
    base: JobBase,
    counter: ExecutionCounter,
}

impl CounterJob {
    pub const TYPE_NAME: &'static str = "mock";

    pub fn job_type() -> JobType {
        JobType::new(Self::TYPE_NAME, 0)
    }

    pub fn new(counter: ExecutionCounter) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), counter)
    }

    pub fn with_id(id: impl Into<String>, counter: ExecutionCounter) -> Self {
        Self {
            base: JobBase::new(id, Self::job_type()),
            counter,
        }
    }
}

#[async_trait]
impl Job for CounterJob {
    fn base(&self) -> &JobBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut JobBase {
        &mut self.base
    }

    async fn run(&mut self, _cancellation_token: CancellationToken) {
        self.counter.inc();
        self.mark_complete();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct SleepBody {
    sleep_ms: u64,
}

/// Sleeps for its duration or until cancelled, whichever comes first, then marks itself complete.
pub struct SleepJob {
    base: JobBase,
    sleep: Duration,
}

impl SleepJob {
    pub const TYPE_NAME: &'static str = "sleep";

    pub fn job_type() -> JobType {
        JobType::new(Self::TYPE_NAME, 0)
    }

    pub fn new(sleep: Duration) -> Self {
        Self {
            base: JobBase::new(Uuid::new_v4().to_string(), Self::job_type()),
            sleep,
        }
    }

    pub fn sleep(&self) -> Duration {
        self.sleep
    }
}

#[async_trait]
impl Job for SleepJob {
    fn base(&self) -> &JobBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut JobBase {
        &mut self.base
    }

    async fn run(&mut self, cancellation_token: CancellationToken) {
        if !self.sleep.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.sleep) => {}
                _ = cancellation_token.cancelled() => {}
            }
        }
        self.mark_complete();
    }

    fn body(&self) -> Result<serde_json::Value, JobError> {
        let body = SleepBody {
            sleep_ms: u64::try_from(self.sleep.as_millis()).unwrap_or(u64::MAX),
        };
        serde_json::to_value(body).map_err(|error| JobError::EncodeBody {
            job_id: self.base.id.clone(),
            error,
        })
    }

    fn restore_body(&mut self, body: serde_json::Value) -> Result<(), JobError> {
        let body: SleepBody =
            serde_json::from_value(body).map_err(|error| JobError::DecodeBody {
                job_id: self.base.id.clone(),
                error,
            })?;
        self.sleep = Duration::from_millis(body.sleep_ms);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn counter_reset_zeroes() {
        let counter = ExecutionCounter::new();
        counter.inc();
        counter.inc();
        assert_eq!(counter.count(), 2);
        counter.reset();
        assert_eq!(counter.count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn counter_has_no_lost_updates() {
        let counter = ExecutionCounter::new();
        let tasks = (0..16).map(|_| {
            let counter = counter.clone();
            tokio::spawn(async move {
                for _ in 0..1000 {
                    counter.inc();
                }
            })
        });
        for result in futures::future::join_all(tasks).await {
            result.unwrap();
        }
        assert_eq!(counter.count(), 16_000);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn counter_jobs_count_exactly_once_each() {
        let counter = ExecutionCounter::new();
        let tasks = (0..50).map(|_| {
            let mut job = CounterJob::new(counter.clone());
            tokio::spawn(async move {
                job.run(CancellationToken::new()).await;
                job.status().completed
            })
        });
        let completed = futures::future::join_all(tasks).await;
        assert!(completed.into_iter().all(|r| r.unwrap()));
        assert_eq!(counter.count(), 50);
    }

    #[test]
    fn counter_job_keeps_explicit_id() {
        let job = CounterJob::with_id("explicit", ExecutionCounter::new());
        assert_eq!(job.id(), "explicit");
        assert_eq!(job.job_type(), &CounterJob::job_type());
        assert!(job.base().dependency.is_ready());
    }

    #[test]
    fn sleep_jobs_get_fresh_ids() {
        let a = SleepJob::new(Duration::from_secs(1));
        let b = SleepJob::new(Duration::from_secs(1));
        assert_ne!(a.id(), b.id());
        assert!(a.base().dependency.is_ready());
    }

    #[tokio::test]
    async fn zero_sleep_returns_immediately() {
        let mut job = SleepJob::new(Duration::ZERO);
        let started = Instant::now();
        job.run(CancellationToken::new()).await;
        assert!(job.status().completed);
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn sleep_runs_for_its_duration() {
        let mut job = SleepJob::new(Duration::from_millis(50));
        let started = Instant::now();
        job.run(CancellationToken::new()).await;
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(job.status().completed);
    }

    #[tokio::test]
    async fn cancellation_interrupts_sleep() {
        let mut job = SleepJob::new(Duration::from_secs(3600));
        let token = CancellationToken::new();
        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                token.cancel();
            })
        };

        let started = Instant::now();
        job.run(token).await;
        canceller.await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(job.status().completed);
    }

    #[tokio::test]
    async fn already_cancelled_token_returns_immediately() {
        let mut job = SleepJob::new(Duration::from_secs(3600));
        let token = CancellationToken::new();
        token.cancel();
        let started = Instant::now();
        job.run(token).await;
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(job.status().completed);
    }

    #[test]
    fn sleep_body_round_trips_duration() {
        let job = SleepJob::new(Duration::from_millis(1234));
        let body = job.body().unwrap();
        assert_eq!(body, serde_json::json!({"sleep_ms": 1234}));

        let mut restored = SleepJob::new(Duration::ZERO);
        restored.restore_body(body).unwrap();
        assert_eq!(restored.sleep(), Duration::from_millis(1234));
    }

    #[test]
    fn sleep_body_rejects_wrong_shape() {
        let mut job = SleepJob::new(Duration::ZERO);
        let result = job.restore_body(serde_json::json!({"seconds": 3}));
        assert!(matches!(result, Err(JobError::DecodeBody { .. })));
    }
}
