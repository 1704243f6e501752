#![doc = include_str!("../README.md")]

pub mod core;

/// Conformance matrix, scenarios and reports.
pub mod conformance;

/// In-process store administrator and reference queue.
pub mod local;

/// Counter and sleep jobs used by every scenario.
pub mod mock;

/// Ephemeral store provisioning and teardown.
pub mod provision;

/// Worker pool usable as the runner of any queue.
pub mod runner {
    pub mod worker_pool;
}

/// Re-exports to simplify importing this crate types.
pub mod prelude {
    pub use super::conformance::{
        run_matrix, run_scenario, run_smoke_test, CaseReport, ConformanceOptions, MatrixReport,
        Outcome, Scenario, ScenarioFailure, TestCase, TestCloser,
    };
    pub use super::core::{
        job::{Job, JobBase, JobError, JobType},
        job_registry::{JobInterchange, JobRegistry, RegistryError},
        queue::{Queue, QueueError, QueueParams, QueueStats, Runner},
        store::{StoreAdmin, StoreError, StoreErrorKind, StoreOperation},
        CancellationToken, Duration, Utc,
    };
    pub use super::mock::{register_mock_jobs, CounterJob, ExecutionCounter, SleepJob};
    pub use super::provision::{
        EphemeralStore, ProvisionError, ProvisionerOptions, TeardownError,
    };
    pub use super::runner::worker_pool::{WorkerPool, WorkerPoolOptions};
}

#[doc(hidden)]
pub mod __private {
    pub use paste::paste;
}

#[cfg(test)]
pub(crate) fn setup_logger() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("proving_ground=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
