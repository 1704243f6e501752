//! Job type registry.
//!
//! Backends that persist jobs store them as a [`JobInterchange`] and rebuild them by type name
//! through a [`JobRegistry`]. The registry is an explicit object populated before any queue is
//! constructed and shared with the queue as `Arc<JobRegistry>`.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::job::{Job, JobBase, JobError, JobType};

/// Shorthand for a factory producing an empty job of one type.
pub type JobFactory = Arc<dyn Fn() -> Box<dyn Job> + Send + Sync>;

/// Serialized form of a job: the shared base plus the variant body.
///
/// Two jobs are deep-equal when their interchange forms are equal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInterchange {
    pub base: JobBase,
    pub body: serde_json::Value,
}

impl JobInterchange {
    pub fn from_job(job: &dyn Job) -> Result<Self, JobError> {
        Ok(Self {
            base: job.base().clone(),
            body: job.body()?,
        })
    }

    pub fn id(&self) -> &str {
        &self.base.id
    }

    pub fn job_type(&self) -> &JobType {
        &self.base.job_type
    }

    pub fn to_bytes(&self) -> Result<Bytes, RegistryError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|error| RegistryError::Encode {
                job_id: self.base.id.clone(),
                error,
            })
    }

    /// Decode an interchange document, keeping a sample of the payload for debugging.
    pub fn from_bytes(payload: &[u8]) -> Result<Self, RegistryError> {
        serde_json::from_slice(payload).map_err(|error| RegistryError::Decode {
            payload_sample: String::from_utf8_lossy(payload).chars().take(500).collect(),
            error,
        })
    }
}

/// Maps job type names to job factories.
///
/// ## Example
/// ```rust
/// use proving_ground::core::job_registry::{JobInterchange, JobRegistry};
/// use proving_ground::mock::{register_mock_jobs, CounterJob, ExecutionCounter};
///
/// let counter = ExecutionCounter::new();
/// let mut registry = JobRegistry::default();
/// register_mock_jobs(&mut registry, &counter);
///
/// let job = CounterJob::with_id("job-1", counter.clone());
/// let interchange = JobInterchange::from_job(&job).unwrap();
/// let rebuilt = registry.rebuild(interchange.clone()).unwrap();
/// assert_eq!(JobInterchange::from_job(rebuilt.as_ref()).unwrap(), interchange);
/// ```
#[derive(Default, Clone)]
pub struct JobRegistry {
    factories: HashMap<String, (u32, JobFactory)>,
}

impl JobRegistry {
    /// Register a factory for `job_type`. If a factory for that name is already present it is kept.
    pub fn add_job_type<F>(&mut self, job_type: JobType, factory: F)
    where
        F: Fn() -> Box<dyn Job> + Send + Sync + 'static,
    {
        self.factories
            .entry(job_type.name)
            .or_insert((job_type.version, Arc::new(factory)));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Produce an empty job of the named type.
    pub fn new_job(&self, name: &str) -> Result<Box<dyn Job>, RegistryError> {
        self.factories
            .get(name)
            .map(|(_, factory)| factory())
            .ok_or_else(|| RegistryError::UnknownJobType {
                type_name: name.to_string(),
            })
    }

    /// Check that `job_type` is registered under exactly this version.
    pub fn check(&self, job_type: &JobType) -> Result<&JobFactory, RegistryError> {
        let (version, factory) =
            self.factories
                .get(&job_type.name)
                .ok_or_else(|| RegistryError::UnknownJobType {
                    type_name: job_type.name.clone(),
                })?;

        if *version != job_type.version {
            return Err(RegistryError::VersionMismatch {
                type_name: job_type.name.clone(),
                registered: *version,
                found: job_type.version,
            });
        }
        Ok(factory)
    }

    /// Rebuild a job from its interchange form.
    pub fn rebuild(&self, interchange: JobInterchange) -> Result<Box<dyn Job>, RegistryError> {
        let JobInterchange { base, body } = interchange;
        let factory = self.check(&base.job_type)?;

        let mut job = factory();
        job.restore_body(body)?;
        *job.base_mut() = base;
        Ok(job)
    }

    pub fn rebuild_from_bytes(&self, payload: &[u8]) -> Result<Box<dyn Job>, RegistryError> {
        self.rebuild(JobInterchange::from_bytes(payload)?)
    }
}

/// Errors returned by the registry.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Job type '{type_name}' is not registered")]
    UnknownJobType { type_name: String },

    #[error("Job type '{type_name}' is registered with version {registered}, found version {found}")]
    VersionMismatch {
        type_name: String,
        registered: u32,
        found: u32,
    },

    #[error("Failed to encode job '{job_id}': {error}")]
    Encode {
        job_id: String,
        #[source]
        error: serde_json::Error,
    },

    #[error("Failed to decode job: {error}\nPayload sample: {payload_sample}")]
    Decode {
        #[source]
        error: serde_json::Error,
        payload_sample: String,
    },

    #[error(transparent)]
    Job(#[from] JobError),
}
