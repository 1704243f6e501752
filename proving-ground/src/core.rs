//! Contracts a queue under test implements: jobs, the registry that rebuilds them, the queue and
//! runner traits, and the administrative interface of a backing store.
//!
//! Third party types that show up in those signatures are re-exported here, so backends do not
//! need to pin matching versions themselves.

/// Timestamps on [`job::JobTimeInfo`].
pub type DateTime = chrono::DateTime<chrono::Utc>;
/// Encoded job documents.
pub use bytes::Bytes;
/// Offsets for `wait_until` and `dispatch_by`.
pub use chrono::{Duration, Utc};
/// Job bodies are JSON values.
pub use serde_json;
pub use tokio_util::sync::CancellationToken;

pub mod job;
pub mod job_registry;
pub mod queue;
pub mod store;
