use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::core::job::{Job, JobError};
use crate::core::job_registry::{JobRegistry, RegistryError};

/// Parameters a queue constructor receives from the conformance runner.
///
/// ```rust
/// use proving_ground::core::job_registry::JobRegistry;
/// use proving_ground::core::queue::QueueParams;
/// use std::sync::Arc;
///
/// let params = QueueParams::new("abc123", 4, Arc::new(JobRegistry::default())).with_group("kip");
/// assert_eq!(params.pool_size(), 4);
/// assert_eq!(params.group(), Some("kip"));
/// ```
#[derive(Clone)]
pub struct QueueParams {
    pub(crate) name: String,
    pub(crate) pool_size: usize,
    pub(crate) group: Option<String>,
    pub(crate) registry: Arc<JobRegistry>,
}

impl QueueParams {
    pub fn new(name: impl Into<String>, pool_size: usize, registry: Arc<JobRegistry>) -> Self {
        Self {
            name: name.into(),
            pool_size,
            group: None,
            registry,
        }
    }

    /// Scope the queue to a group. Queues in different groups must not see each other's jobs.
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Name shared by every queue instance of one scenario; backends derive the store name from it.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// `Some` iff the queue runs in group mode.
    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    pub fn registry(&self) -> Arc<JobRegistry> {
        Arc::clone(&self.registry)
    }
}

/// Job counts as seen by one queue instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub running: usize,
    pub completed: usize,
    pub pending: usize,
    pub total: usize,
}

/// The contract a queue under test exposes to the harness.
///
/// Jobs are identified by their string id. Completion written through [`Queue::complete`] must be
/// visible to any later [`Queue::get`] of the same id. No dispatch order is assumed.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Identifier of this queue instance (not of the store behind it).
    fn id(&self) -> &str;

    /// Enqueue a job. Fails with [`QueueError::DuplicateJob`] if the id already exists in this
    /// queue's scope.
    async fn put(&self, job: Box<dyn Job>) -> Result<(), QueueError>;

    /// Fetch a job by id. `Ok(None)` when it was never put into this queue's scope.
    async fn get(&self, id: &str) -> Result<Option<Box<dyn Job>>, QueueError>;

    /// Claim the next dispatchable job. Waits for one to become available and returns `Ok(None)`
    /// once `cancellation_token` is cancelled.
    async fn next(
        &self,
        cancellation_token: CancellationToken,
    ) -> Result<Option<Box<dyn Job>>, QueueError>;

    /// Persist the final state of a job previously returned by [`Queue::next`].
    async fn complete(&self, job: &dyn Job) -> Result<(), QueueError>;

    async fn stats(&self) -> Result<QueueStats, QueueError>;

    /// Start the runner against this queue. Cancelling `cancellation_token` stops the workers and
    /// interrupts running jobs.
    async fn start(&self, cancellation_token: CancellationToken) -> Result<(), QueueError>;

    fn runner(&self) -> Arc<dyn Runner>;
}

/// Worker pool controller returned by [`Queue::runner`].
#[async_trait]
pub trait Runner: Send + Sync {
    fn started(&self) -> bool;

    /// Number of worker tasks that have not exited yet.
    fn active_workers(&self) -> usize;

    async fn start(
        &self,
        queue: Arc<dyn Queue>,
        cancellation_token: CancellationToken,
    ) -> Result<(), QueueError>;

    /// Stop pulling new work, wait up to `drain_timeout` for in-flight jobs, then cancel them.
    /// Safe to call on a runner that never started or was already closed.
    async fn close(&self, drain_timeout: Duration);
}

/// Errors related to queue operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum QueueError {
    /// A job with this id already exists.
    #[error("Job '{job_id}' already exists in queue '{queue}'")]
    DuplicateJob { queue: String, job_id: String },

    /// Job not known to this queue.
    #[error("Job '{job_id}' not found in queue '{queue}'")]
    JobNotFound { queue: String, job_id: String },

    #[error("Runner for queue '{0}' is already started")]
    AlreadyStarted(String),

    #[error("Queue '{0}' is closed")]
    Closed(String),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Database or other backend error.
    #[error("Backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl QueueError {
    pub fn duplicate_job(queue: impl Into<String>, job_id: impl Into<String>) -> Self {
        Self::DuplicateJob {
            queue: queue.into(),
            job_id: job_id.into(),
        }
    }

    pub fn job_not_found(queue: impl Into<String>, job_id: impl Into<String>) -> Self {
        Self::JobNotFound {
            queue: queue.into(),
            job_id: job_id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_default_to_ungrouped() {
        let params = QueueParams::new("q", 2, Arc::new(JobRegistry::default()));
        assert_eq!(params.name(), "q");
        assert_eq!(params.group(), None);
    }

    #[test]
    fn duplicate_job_message_names_queue_and_job() {
        let msg = QueueError::duplicate_job("local-1", "job-9").to_string();
        assert!(msg.contains("local-1"));
        assert!(msg.contains("job-9"));
        assert!(msg.contains("already exists"));
    }

    #[test]
    fn job_not_found_message() {
        let msg = QueueError::job_not_found("local-1", "job-9").to_string();
        assert!(msg.contains("not found"));
    }

    #[test]
    fn backend_error_preserves_source() {
        use std::error::Error;

        let error = QueueError::Backend(anyhow::anyhow!("connection reset"));
        assert!(error.to_string().contains("connection reset"));
        assert!(error.source().is_some());
    }
}
