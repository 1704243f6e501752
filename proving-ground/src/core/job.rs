use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::core::{DateTime, Utc};

/// Type tag of a job. Backends persist it next to the job body so the job can be rebuilt
/// through a [`JobRegistry`](crate::core::job_registry::JobRegistry).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobType {
    pub name: String,
    pub version: u32,
}

impl JobType {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

/// Declares when a job becomes eligible for dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Dependency {
    /// Ready as soon as it is enqueued.
    #[default]
    Always,
}

impl Dependency {
    pub fn is_ready(&self) -> bool {
        match self {
            Dependency::Always => true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub in_progress: bool,
    pub completed: bool,
    /// Bumped on every state change persisted by the queue.
    pub mod_count: u32,
}

/// Timestamps and scheduling constraints of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTimeInfo {
    pub created: DateTime,
    pub start: Option<DateTime>,
    pub end: Option<DateTime>,
    /// Earliest instant the job may be handed to a worker.
    pub wait_until: Option<DateTime>,
    /// Latest instant the job may be handed to a worker.
    pub dispatch_by: Option<DateTime>,
}

impl Default for JobTimeInfo {
    fn default() -> Self {
        Self {
            created: Utc::now(),
            start: None,
            end: None,
            wait_until: None,
            dispatch_by: None,
        }
    }
}

impl JobTimeInfo {
    /// Whether the scheduling window allows dispatch at `now`.
    pub fn is_dispatchable(&self, now: DateTime) -> bool {
        if matches!(self.wait_until, Some(wait_until) if now < wait_until) {
            return false;
        }
        !matches!(self.dispatch_by, Some(dispatch_by) if now > dispatch_by)
    }
}

/// State every job carries regardless of its variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobBase {
    pub id: String,
    pub job_type: JobType,
    pub dependency: Dependency,
    pub status: JobStatus,
    pub time_info: JobTimeInfo,
}

impl JobBase {
    pub fn new(id: impl Into<String>, job_type: JobType) -> Self {
        Self {
            id: id.into(),
            job_type,
            dependency: Dependency::Always,
            status: JobStatus::default(),
            time_info: JobTimeInfo::default(),
        }
    }
}

/// A unit of work the queue under test dispatches.
///
/// Implementations keep their shared state in [`JobBase`] and expose the variant-specific part
/// as a JSON body, which is what allows a backend to persist the job and rebuild it later.
///
/// ## Example
/// ```rust
/// use proving_ground::core::job::{Job, JobBase, JobType};
/// use proving_ground::core::CancellationToken;
/// use async_trait::async_trait;
///
/// struct Noop {
///     base: JobBase,
/// }
///
/// #[async_trait]
/// impl Job for Noop {
///     fn base(&self) -> &JobBase {
///         &self.base
///     }
///
///     fn base_mut(&mut self) -> &mut JobBase {
///         &mut self.base
///     }
///
///     async fn run(&mut self, _cancellation_token: CancellationToken) {
///         self.mark_complete();
///     }
/// }
///
/// let job = Noop { base: JobBase::new("noop-1", JobType::new("noop", 0)) };
/// assert_eq!(job.id(), "noop-1");
/// ```
#[async_trait]
pub trait Job: Send + Sync {
    fn base(&self) -> &JobBase;

    fn base_mut(&mut self) -> &mut JobBase;

    /// Execute the job. Should listen for `cancellation_token.cancelled()` so that closing a
    /// runner interrupts in-flight work.
    async fn run(&mut self, cancellation_token: CancellationToken);

    /// Variant-specific state. Jobs without any return `Value::Null`.
    fn body(&self) -> Result<serde_json::Value, JobError> {
        Ok(serde_json::Value::Null)
    }

    /// Inverse of [`Job::body`].
    fn restore_body(&mut self, _body: serde_json::Value) -> Result<(), JobError> {
        Ok(())
    }

    fn id(&self) -> &str {
        &self.base().id
    }

    fn job_type(&self) -> &JobType {
        &self.base().job_type
    }

    fn status(&self) -> &JobStatus {
        &self.base().status
    }

    fn time_info(&self) -> &JobTimeInfo {
        &self.base().time_info
    }

    fn set_time_info(&mut self, time_info: JobTimeInfo) {
        self.base_mut().time_info = time_info;
    }

    fn mark_complete(&mut self) {
        let base = self.base_mut();
        base.status.completed = true;
        base.status.in_progress = false;
        base.status.mod_count += 1;
        base.time_info.end = Some(Utc::now());
    }
}

/// Error types for job state handling.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("Failed to encode body of job '{job_id}': {error}")]
    EncodeBody {
        job_id: String,
        #[source]
        error: serde_json::Error,
    },

    #[error("Failed to decode body of job '{job_id}': {error}")]
    DecodeBody {
        job_id: String,
        #[source]
        error: serde_json::Error,
    },
}
