//! Conformance matrix for [`Queue`](crate::core::queue::Queue) implementations.
//!
//! A backend describes itself with one or more [`TestCase`]s: a constructor plus capability
//! flags. The runner drives every applicable [`Scenario`] against each case, giving every
//! scenario run its own store, counter and registry, and reports contract violations, timeouts,
//! provisioning failures and teardown failures separately.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::instrument;

mod case;
mod report;
mod scenarios;

pub use case::{
    closer, noop_closer, ConstructedQueue, QueueConstructor, TestCase, TestCloser,
    POOL_SIZE_LADDER,
};
pub use report::{CaseReport, MatrixReport, Outcome, ScenarioFailure, ScenarioReport};
pub use scenarios::Scenario;

/// Timing and sizing knobs of the conformance runner.
///
/// ```rust
/// use proving_ground::conformance::ConformanceOptions;
/// use std::time::Duration;
///
/// let opts = ConformanceOptions::new()
///     .with_job_count(25)
///     .with_completion_deadline(Duration::from_secs(10));
/// assert_eq!(opts.job_count(), 25);
/// ```
#[derive(Debug, Clone)]
pub struct ConformanceOptions {
    pub(crate) job_count: usize,
    pub(crate) completion_deadline: Duration,
    pub(crate) drain_timeout: Duration,
    pub(crate) settle_window: Duration,
    pub(crate) short_delay: Duration,
    pub(crate) close_grace: Duration,
    pub(crate) duplicate_tolerance: usize,
}

impl ConformanceOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of counter jobs submitted by fan-out scenarios.
    pub fn with_job_count(mut self, job_count: usize) -> Self {
        self.job_count = job_count;
        self
    }

    /// How long to wait for submitted jobs to complete before reporting a timeout.
    pub fn with_completion_deadline(mut self, completion_deadline: Duration) -> Self {
        self.completion_deadline = completion_deadline;
        self
    }

    /// Drain timeout passed to [`Runner::close`](crate::core::queue::Runner::close).
    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    /// Extra time given to a queue to run something it must not, before asserting it did not.
    pub fn with_settle_window(mut self, settle_window: Duration) -> Self {
        self.settle_window = settle_window;
        self
    }

    /// Deferral used for the job that must start no earlier than its `wait_until`.
    pub fn with_short_delay(mut self, short_delay: Duration) -> Self {
        self.short_delay = short_delay;
        self
    }

    /// How much longer than the drain timeout a runner close may take.
    pub fn with_close_grace(mut self, close_grace: Duration) -> Self {
        self.close_grace = close_grace;
        self
    }

    /// Extra executions tolerated on top of the number of jobs. Zero means exactly once.
    pub fn with_duplicate_tolerance(mut self, duplicate_tolerance: usize) -> Self {
        self.duplicate_tolerance = duplicate_tolerance;
        self
    }

    pub fn job_count(&self) -> usize {
        self.job_count
    }

    pub fn completion_deadline(&self) -> Duration {
        self.completion_deadline
    }

    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    pub fn duplicate_tolerance(&self) -> usize {
        self.duplicate_tolerance
    }
}

impl Default for ConformanceOptions {
    fn default() -> Self {
        Self {
            job_count: 10,
            completion_deadline: Duration::from_secs(5),
            drain_timeout: Duration::from_millis(500),
            settle_window: Duration::from_millis(250),
            short_delay: Duration::from_millis(200),
            close_grace: Duration::from_secs(2),
            duplicate_tolerance: 0,
        }
    }
}

/// Run every scenario that applies to `case`.
pub async fn run_smoke_test(
    case: &TestCase,
    options: &ConformanceOptions,
    cancellation_token: &CancellationToken,
) -> CaseReport {
    run_case(case, &Scenario::ALL, options, cancellation_token).await
}

/// Run a single scenario against `case`, at every pool size it calls for.
pub async fn run_scenario(
    case: &TestCase,
    scenario: Scenario,
    options: &ConformanceOptions,
    cancellation_token: &CancellationToken,
) -> CaseReport {
    run_case(case, &[scenario], options, cancellation_token).await
}

/// Run cases one after another. A failing case never stops the ones after it.
pub async fn run_matrix(
    cases: &[TestCase],
    options: &ConformanceOptions,
    cancellation_token: &CancellationToken,
) -> MatrixReport {
    let mut report = MatrixReport::default();
    for case in cases {
        report
            .cases
            .push(run_smoke_test(case, options, cancellation_token).await);
    }
    tracing::info!("{}", report);
    report
}

#[instrument(skip_all, fields(case = case.name()))]
async fn run_case(
    case: &TestCase,
    scenarios: &[Scenario],
    options: &ConformanceOptions,
    cancellation_token: &CancellationToken,
) -> CaseReport {
    let mut report = CaseReport::new(case.name());
    if case.is_skipped() {
        tracing::info!("Skipping case");
        report.skipped = true;
        return report;
    }

    let sizes = case.pool_sizes();
    let smallest = sizes.first().copied().unwrap_or(1);
    for &scenario in scenarios {
        if !scenario.applies_to(case) {
            report.scenarios.push(ScenarioReport::skipped(
                scenario,
                smallest,
                "not supported by this case",
            ));
            continue;
        }

        let run_sizes = if scenario.is_fan_out() {
            sizes.as_slice()
        } else {
            &sizes[..1]
        };
        for &pool_size in run_sizes {
            if report.provision_error.is_some() {
                report.scenarios.push(ScenarioReport::skipped(
                    scenario,
                    pool_size,
                    "an earlier queue could not be built",
                ));
                continue;
            }
            if cancellation_token.is_cancelled() {
                report
                    .scenarios
                    .push(ScenarioReport::skipped(scenario, pool_size, "cancelled"));
                continue;
            }

            let run =
                scenarios::execute(case, scenario, pool_size, options, cancellation_token).await;
            if run.provision_error.is_some() {
                report.provision_error = run.provision_error;
            }
            report.scenarios.push(run.report);
        }
    }

    tracing::info!(
        "Case finished: {} of {} scenario runs passed",
        report.passed(),
        report.scenarios.len()
    );
    report
}

/// Run one scenario with default options and panic unless it passed. Used by
/// [`generate_conformance_tests!`](crate::generate_conformance_tests).
pub async fn check_scenario(case: TestCase, scenario: Scenario) {
    run_scenario(
        &case,
        scenario,
        &ConformanceOptions::default(),
        &CancellationToken::new(),
    )
    .await
    .assert_passed();
}

/// Generate one test per conformance scenario for a backend.
///
/// # Usage
///
/// ```ignore
/// proving_ground::generate_conformance_tests! {
///     backend = "local_single",
///     test_attr = tokio::test(flavor = "multi_thread", worker_threads = 4),
///     case = TestCase::new("single", local_constructor(MemoryAdmin::new(), Default::default()))
/// }
/// ```
///
/// Scenarios a case does not support are reported as skipped, so their tests pass.
#[macro_export]
macro_rules! generate_conformance_tests {
    (
        backend = $backend:literal,
        test_attr = $test_attr:meta,
        case = $case:expr
    ) => {
        $crate::__private::paste! {
            #[$test_attr]
            async fn [<put_get_round_trip_ $backend>]() {
                $crate::conformance::check_scenario(
                    $case,
                    $crate::conformance::Scenario::PutGetRoundTrip,
                )
                .await;
            }

            #[$test_attr]
            async fn [<get_missing_ $backend>]() {
                $crate::conformance::check_scenario(
                    $case,
                    $crate::conformance::Scenario::GetMissing,
                )
                .await;
            }

            #[$test_attr]
            async fn [<duplicate_put_ $backend>]() {
                $crate::conformance::check_scenario(
                    $case,
                    $crate::conformance::Scenario::DuplicatePut,
                )
                .await;
            }

            #[$test_attr]
            async fn [<exactly_once_ $backend>]() {
                $crate::conformance::check_scenario(
                    $case,
                    $crate::conformance::Scenario::ExactlyOnce,
                )
                .await;
            }

            #[$test_attr]
            async fn [<shared_store_fan_out_ $backend>]() {
                $crate::conformance::check_scenario(
                    $case,
                    $crate::conformance::Scenario::SharedStoreFanOut,
                )
                .await;
            }

            #[$test_attr]
            async fn [<group_isolation_ $backend>]() {
                $crate::conformance::check_scenario(
                    $case,
                    $crate::conformance::Scenario::GroupIsolation,
                )
                .await;
            }

            #[$test_attr]
            async fn [<wait_until_ $backend>]() {
                $crate::conformance::check_scenario(
                    $case,
                    $crate::conformance::Scenario::WaitUntil,
                )
                .await;
            }

            #[$test_attr]
            async fn [<dispatch_before_ $backend>]() {
                $crate::conformance::check_scenario(
                    $case,
                    $crate::conformance::Scenario::DispatchBefore,
                )
                .await;
            }

            #[$test_attr]
            async fn [<close_cancels_in_flight_ $backend>]() {
                $crate::conformance::check_scenario(
                    $case,
                    $crate::conformance::Scenario::CloseCancelsInFlight,
                )
                .await;
            }
        }
    };
}
