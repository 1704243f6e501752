use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::instrument;
use uuid::Uuid;

use crate::conformance::report::{Outcome, ScenarioFailure, ScenarioReport};
use crate::conformance::{ConformanceOptions, TestCase, TestCloser};
use crate::core::job::Job;
use crate::core::job_registry::{JobInterchange, JobRegistry};
use crate::core::queue::{Queue, QueueError, QueueParams, QueueStats};
use crate::core::{Duration as ChronoDuration, Utc};
use crate::mock::{register_mock_jobs, CounterJob, ExecutionCounter, SleepJob};
use crate::provision::{unique_suffix, ProvisionError, TeardownError};

/// How often the harness polls queue stats while waiting.
const WAIT_POLL: Duration = Duration::from_millis(10);

/// One behavior asserted against a queue configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scenario {
    /// A job fetched back by id is deep-equal to the one put.
    PutGetRoundTrip,
    /// Fetching an id that was never put finds nothing.
    GetMissing,
    /// Putting an id twice is rejected.
    DuplicatePut,
    /// Every job runs exactly once, whatever the pool size.
    ExactlyOnce,
    /// Two queue instances on one store split the work without running anything twice.
    SharedStoreFanOut,
    /// Queues in different groups never see or run each other's jobs.
    GroupIsolation,
    /// Jobs are not dispatched before their `wait_until`.
    WaitUntil,
    /// Jobs are not dispatched after their `dispatch_by`.
    DispatchBefore,
    /// Closing the runner interrupts jobs still running after the drain timeout.
    CloseCancelsInFlight,
}

impl Scenario {
    pub const ALL: [Scenario; 9] = [
        Scenario::PutGetRoundTrip,
        Scenario::GetMissing,
        Scenario::DuplicatePut,
        Scenario::ExactlyOnce,
        Scenario::SharedStoreFanOut,
        Scenario::GroupIsolation,
        Scenario::WaitUntil,
        Scenario::DispatchBefore,
        Scenario::CloseCancelsInFlight,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Scenario::PutGetRoundTrip => "put_get_round_trip",
            Scenario::GetMissing => "get_missing",
            Scenario::DuplicatePut => "duplicate_put",
            Scenario::ExactlyOnce => "exactly_once",
            Scenario::SharedStoreFanOut => "shared_store_fan_out",
            Scenario::GroupIsolation => "group_isolation",
            Scenario::WaitUntil => "wait_until",
            Scenario::DispatchBefore => "dispatch_before",
            Scenario::CloseCancelsInFlight => "close_cancels_in_flight",
        }
    }

    /// Whether the capability flags of `case` call for this scenario.
    pub fn applies_to(&self, case: &TestCase) -> bool {
        match self {
            Scenario::PutGetRoundTrip
            | Scenario::GetMissing
            | Scenario::DuplicatePut
            | Scenario::CloseCancelsInFlight => true,
            Scenario::ExactlyOnce => case.multi_supported(),
            Scenario::SharedStoreFanOut => case.is_remote() && case.multi_supported(),
            Scenario::GroupIsolation => case.use_groups(),
            Scenario::WaitUntil => case.wait_until_supported(),
            Scenario::DispatchBefore => case.dispatch_before_supported(),
        }
    }

    /// Fan-out scenarios run at every pool size of a case; the rest only at the smallest.
    pub fn is_fan_out(&self) -> bool {
        matches!(self, Scenario::ExactlyOnce | Scenario::SharedStoreFanOut)
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Either the queue failed the scenario, or the harness could not build it in the first place.
#[derive(Debug)]
enum Interrupted {
    Failed(ScenarioFailure),
    Provision(ProvisionError),
}

impl From<ScenarioFailure> for Interrupted {
    fn from(failure: ScenarioFailure) -> Self {
        Interrupted::Failed(failure)
    }
}

impl From<QueueError> for Interrupted {
    fn from(error: QueueError) -> Self {
        Interrupted::Failed(ScenarioFailure::Queue(error))
    }
}

impl From<ProvisionError> for Interrupted {
    fn from(error: ProvisionError) -> Self {
        Interrupted::Provision(error)
    }
}

type ScenarioResult = Result<(), Interrupted>;

fn ensure(condition: bool, detail: impl FnOnce() -> String) -> Result<(), ScenarioFailure> {
    if condition {
        Ok(())
    } else {
        Err(ScenarioFailure::ContractViolation(detail()))
    }
}

/// Result of [`execute`]: the report, plus the provisioning error if a queue could not be built.
pub(crate) struct ScenarioRun {
    pub(crate) report: ScenarioReport,
    pub(crate) provision_error: Option<ProvisionError>,
}

/// Run one scenario at one pool size with a fresh store, counter and registry, then tear down.
#[instrument(skip_all, fields(case = case.name(), scenario = %scenario, pool_size = pool_size))]
pub(crate) async fn execute(
    case: &TestCase,
    scenario: Scenario,
    pool_size: usize,
    options: &ConformanceOptions,
    cancellation_token: &CancellationToken,
) -> ScenarioRun {
    let started = Instant::now();
    let mut ctx = ScenarioContext::new(case, options, pool_size, cancellation_token);

    let result = match scenario {
        Scenario::PutGetRoundTrip => put_get_round_trip(&mut ctx).await,
        Scenario::GetMissing => get_missing(&mut ctx).await,
        Scenario::DuplicatePut => duplicate_put(&mut ctx).await,
        Scenario::ExactlyOnce => exactly_once(&mut ctx).await,
        Scenario::SharedStoreFanOut => shared_store_fan_out(&mut ctx).await,
        Scenario::GroupIsolation => group_isolation(&mut ctx).await,
        Scenario::WaitUntil => wait_until(&mut ctx).await,
        Scenario::DispatchBefore => dispatch_before(&mut ctx).await,
        Scenario::CloseCancelsInFlight => close_cancels_in_flight(&mut ctx).await,
    };
    let teardown = ctx.teardown().await;
    let elapsed = started.elapsed();

    let (outcome, provision_error) = match result {
        Ok(()) => {
            tracing::info!("Scenario passed in {:?}", elapsed);
            (Outcome::Passed, None)
        }
        Err(Interrupted::Failed(failure)) => {
            tracing::info!("Scenario failed: {}", failure);
            (Outcome::Failed(failure), None)
        }
        Err(Interrupted::Provision(error)) => {
            tracing::error!("Could not build queue: {}", error);
            let reason = format!("provisioning failed: {}", error);
            (Outcome::Skipped(reason), Some(error))
        }
    };
    for error in &teardown {
        tracing::error!("{}", error);
    }

    ScenarioRun {
        report: ScenarioReport {
            scenario,
            pool_size,
            outcome,
            teardown,
            elapsed,
        },
        provision_error,
    }
}

/// Everything one scenario run owns.
struct ScenarioContext<'a> {
    case: &'a TestCase,
    options: &'a ConformanceOptions,
    pool_size: usize,
    name: String,
    counter: ExecutionCounter,
    registry: Arc<JobRegistry>,
    cancellation_token: CancellationToken,
    queues: Vec<Arc<dyn Queue>>,
    closers: Vec<TestCloser>,
}

impl<'a> ScenarioContext<'a> {
    fn new(
        case: &'a TestCase,
        options: &'a ConformanceOptions,
        pool_size: usize,
        parent: &CancellationToken,
    ) -> Self {
        let counter = ExecutionCounter::new();
        let mut registry = JobRegistry::default();
        register_mock_jobs(&mut registry, &counter);
        Self {
            case,
            options,
            pool_size,
            name: unique_suffix(),
            counter,
            registry: Arc::new(registry),
            cancellation_token: parent.child_token(),
            queues: Vec::new(),
            closers: Vec::new(),
        }
    }

    /// Build another queue instance on this scenario's store.
    async fn build(&mut self, group: Option<String>) -> Result<Arc<dyn Queue>, Interrupted> {
        let mut params =
            QueueParams::new(self.name.clone(), self.pool_size, Arc::clone(&self.registry));
        if let Some(group) = group {
            params = params.with_group(group);
        }
        let (queue, closer) = self
            .case
            .construct(self.cancellation_token.clone(), params)
            .await?;
        self.queues.push(Arc::clone(&queue));
        self.closers.push(closer);
        Ok(queue)
    }

    /// A queue in the case's own group, if it has one.
    async fn primary(&mut self) -> Result<Arc<dyn Queue>, Interrupted> {
        let group = self.case.group_name().map(str::to_string);
        self.build(group).await
    }

    fn counter_job(&self) -> Box<dyn Job> {
        Box::new(CounterJob::new(self.counter.clone()))
    }

    async fn put_counter_jobs(
        &self,
        queue: &dyn Queue,
        count: usize,
    ) -> Result<Vec<String>, Interrupted> {
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            let job = self.counter_job();
            ids.push(job.id().to_string());
            queue.put(job).await?;
        }
        Ok(ids)
    }

    /// Poll `queue` until `done` holds for its stats or the completion deadline passes.
    async fn wait_for(
        &self,
        queue: &dyn Queue,
        what: &str,
        done: impl Fn(&QueueStats) -> bool,
    ) -> Result<QueueStats, Interrupted> {
        let deadline = self.options.completion_deadline;
        let started = Instant::now();
        loop {
            let stats = queue.stats().await?;
            if done(&stats) {
                return Ok(stats);
            }
            let waited = started.elapsed();
            if waited >= deadline || self.cancellation_token.is_cancelled() {
                return Err(ScenarioFailure::Timeout {
                    waited,
                    detail: format!(
                        "waiting for {} on queue '{}': {} completed, {} running, {} pending of {} (runner started: {}, cancelled: {})",
                        what,
                        queue.id(),
                        stats.completed,
                        stats.running,
                        stats.pending,
                        stats.total,
                        queue.runner().started(),
                        self.cancellation_token.is_cancelled(),
                    ),
                }
                .into());
            }
            tokio::select! {
                _ = tokio::time::sleep(WAIT_POLL) => {}
                _ = self.cancellation_token.cancelled() => {}
            }
        }
    }

    async fn wait_for_completed(
        &self,
        queue: &dyn Queue,
        expected: usize,
    ) -> Result<QueueStats, Interrupted> {
        let what = format!("{} completed jobs", expected);
        self.wait_for(queue, &what, |stats| stats.completed >= expected)
            .await
    }

    /// Give a queue time to misbehave, e.g. to run a job twice or dispatch one it must not.
    async fn settle(&self) {
        tokio::select! {
            _ = tokio::time::sleep(self.options.settle_window) => {}
            _ = self.cancellation_token.cancelled() => {}
        }
    }

    async fn fetch(&self, queue: &dyn Queue, id: &str) -> Result<Box<dyn Job>, Interrupted> {
        match queue.get(id).await? {
            Some(job) => Ok(job),
            None => Err(ScenarioFailure::violation(format!(
                "job '{}' was put but get on queue '{}' found nothing",
                id,
                queue.id()
            ))
            .into()),
        }
    }

    fn check_counter(&self, expected: usize) -> Result<(), ScenarioFailure> {
        let count = self.counter.count();
        let max = expected + self.options.duplicate_tolerance;
        ensure(count >= expected && count <= max, || {
            if count < expected {
                format!("{} of {} counter jobs ran", count, expected)
            } else {
                format!(
                    "counter jobs ran {} times for {} jobs (tolerance {})",
                    count, expected, self.options.duplicate_tolerance
                )
            }
        })
    }

    /// Close every runner, then every closer, newest first. Errors are collected, not raised.
    async fn teardown(self) -> Vec<TeardownError> {
        for queue in self.queues.iter().rev() {
            queue.runner().close(self.options.drain_timeout).await;
        }
        self.cancellation_token.cancel();

        let mut errors = Vec::new();
        for closer in self.closers.into_iter().rev() {
            if let Err(e) = closer().await {
                errors.push(e);
            }
        }
        errors
    }
}

async fn put_get_round_trip(ctx: &mut ScenarioContext<'_>) -> ScenarioResult {
    let queue = ctx.primary().await?;

    let jobs: Vec<Box<dyn Job>> = vec![
        Box::new(CounterJob::with_id(
            format!("round-trip-{}", Uuid::new_v4()),
            ctx.counter.clone(),
        )),
        Box::new(SleepJob::new(Duration::from_millis(250))),
    ];
    for job in jobs {
        let expected = JobInterchange::from_job(job.as_ref()).map_err(QueueError::from)?;
        queue.put(job).await?;

        let fetched = ctx.fetch(queue.as_ref(), expected.id()).await?;
        let actual = JobInterchange::from_job(fetched.as_ref()).map_err(QueueError::from)?;
        ensure(actual == expected, || {
            format!(
                "job '{}' changed in round trip: put {:?}, got {:?}",
                expected.id(),
                expected,
                actual
            )
        })?;
    }
    Ok(())
}

async fn get_missing(ctx: &mut ScenarioContext<'_>) -> ScenarioResult {
    let queue = ctx.primary().await?;
    queue.put(ctx.counter_job()).await?;

    let id = Uuid::new_v4().to_string();
    let found = queue.get(&id).await?;
    ensure(found.is_none(), || {
        format!("get of never-put id '{}' returned a job", id)
    })?;
    Ok(())
}

async fn duplicate_put(ctx: &mut ScenarioContext<'_>) -> ScenarioResult {
    let queue = ctx.primary().await?;
    let id = format!("duplicate-{}", Uuid::new_v4());

    queue
        .put(Box::new(CounterJob::with_id(id.clone(), ctx.counter.clone())))
        .await?;
    match queue
        .put(Box::new(CounterJob::with_id(id.clone(), ctx.counter.clone())))
        .await
    {
        Err(QueueError::DuplicateJob { .. }) => {}
        Ok(()) => {
            return Err(ScenarioFailure::violation(format!(
                "second put of job '{}' was accepted",
                id
            ))
            .into())
        }
        Err(e) => {
            return Err(ScenarioFailure::violation(format!(
                "second put of job '{}' failed with an unexpected error: {}",
                id, e
            ))
            .into())
        }
    }
    ctx.fetch(queue.as_ref(), &id).await?;
    Ok(())
}

async fn exactly_once(ctx: &mut ScenarioContext<'_>) -> ScenarioResult {
    let queue = ctx.primary().await?;
    let count = ctx.options.job_count;
    let ids = ctx.put_counter_jobs(queue.as_ref(), count).await?;

    queue.start(ctx.cancellation_token.clone()).await?;
    ctx.wait_for_completed(queue.as_ref(), count).await?;
    ctx.settle().await;

    ctx.check_counter(count)?;
    for id in &ids {
        let job = ctx.fetch(queue.as_ref(), id).await?;
        ensure(job.status().completed, || {
            format!("job '{}' ran but get does not report it complete", id)
        })?;
    }
    Ok(())
}

async fn shared_store_fan_out(ctx: &mut ScenarioContext<'_>) -> ScenarioResult {
    let first = ctx.primary().await?;
    let second = ctx.primary().await?;
    let count = ctx.options.job_count;

    let ids = ctx.put_counter_jobs(first.as_ref(), count).await?;
    for id in &ids {
        ctx.fetch(second.as_ref(), id).await?;
    }

    first.start(ctx.cancellation_token.clone()).await?;
    second.start(ctx.cancellation_token.clone()).await?;
    ctx.wait_for_completed(first.as_ref(), count).await?;
    ctx.settle().await;

    ctx.check_counter(count)?;
    for id in &ids {
        let job = ctx.fetch(second.as_ref(), id).await?;
        ensure(job.status().completed, || {
            format!("job '{}' is not complete as seen by the second queue", id)
        })?;
    }
    Ok(())
}

async fn group_isolation(ctx: &mut ScenarioContext<'_>) -> ScenarioResult {
    let group = ctx.case.group_name().unwrap_or("group").to_string();
    let other_group = format!("{}_other", group);
    let ours = ctx.build(Some(group.clone())).await?;
    let theirs = ctx.build(Some(other_group.clone())).await?;

    let count = ctx.options.job_count.max(1);
    let ids = ctx.put_counter_jobs(ours.as_ref(), count).await?;
    let foreign: Box<dyn Job> = Box::new(SleepJob::new(Duration::ZERO));
    let foreign_id = foreign.id().to_string();
    theirs.put(foreign).await?;

    let crossings = ids
        .iter()
        .map(|id| (id, &group, &theirs, &other_group))
        .chain([(&foreign_id, &other_group, &ours, &group)]);
    for (id, owner, viewer, viewer_group) in crossings {
        ensure(viewer.get(id).await?.is_none(), || {
            format!(
                "job '{}' of group '{}' is visible from group '{}'",
                id, owner, viewer_group
            )
        })?;
    }

    // The other group's pool must run its own job and nothing of ours.
    theirs.start(ctx.cancellation_token.clone()).await?;
    ctx.wait_for_completed(theirs.as_ref(), 1).await?;
    ctx.settle().await;
    ensure(ctx.counter.count() == 0, || {
        format!(
            "{} jobs of group '{}' were run by a queue in group '{}'",
            ctx.counter.count(),
            group,
            other_group
        )
    })?;
    let stats = ours.stats().await?;
    ensure(stats.pending == count, || {
        format!(
            "expected {} pending jobs in group '{}', found {:?}",
            count, group, stats
        )
    })?;

    ours.start(ctx.cancellation_token.clone()).await?;
    ctx.wait_for_completed(ours.as_ref(), count).await?;
    ctx.check_counter(count)?;
    Ok(())
}

async fn wait_until(ctx: &mut ScenarioContext<'_>) -> ScenarioResult {
    let queue = ctx.primary().await?;
    let now = Utc::now();

    let sentinel = ctx.counter_job();
    let mut deferred = ctx.counter_job();
    let mut delayed: Box<dyn Job> = Box::new(SleepJob::new(Duration::ZERO));
    deferred.base_mut().time_info.wait_until = Some(now + ChronoDuration::hours(1));
    let short = ChronoDuration::from_std(ctx.options.short_delay)
        .unwrap_or_else(|_| ChronoDuration::zero());
    let not_before = now + short;
    delayed.base_mut().time_info.wait_until = Some(not_before);

    let deferred_id = deferred.id().to_string();
    let delayed_id = delayed.id().to_string();
    queue.put(sentinel).await?;
    queue.put(deferred).await?;
    queue.put(delayed).await?;

    queue.start(ctx.cancellation_token.clone()).await?;
    ctx.wait_for_completed(queue.as_ref(), 2).await?;
    ctx.settle().await;

    let deferred = ctx.fetch(queue.as_ref(), &deferred_id).await?;
    ensure(
        !deferred.status().completed && !deferred.status().in_progress,
        || format!("job '{}' deferred by an hour was dispatched", deferred_id),
    )?;
    ensure(ctx.counter.count() == 1, || {
        format!(
            "expected only the ready job to run, counter is {}",
            ctx.counter.count()
        )
    })?;

    let delayed = ctx.fetch(queue.as_ref(), &delayed_id).await?;
    let time_info = delayed.time_info();
    ensure(delayed.status().completed, || {
        format!("job '{}' never ran after its wait_until passed", delayed_id)
    })?;
    if let Some(dispatched) = time_info.start.or(time_info.end) {
        ensure(dispatched >= not_before, || {
            format!(
                "job '{}' was dispatched at {} before its wait_until {}",
                delayed_id, dispatched, not_before
            )
        })?;
    }
    Ok(())
}

async fn dispatch_before(ctx: &mut ScenarioContext<'_>) -> ScenarioResult {
    let queue = ctx.primary().await?;
    let now = Utc::now();

    let mut expired = ctx.counter_job();
    let mut live = ctx.counter_job();
    expired.base_mut().time_info.dispatch_by = Some(now - ChronoDuration::seconds(1));
    live.base_mut().time_info.dispatch_by = Some(now + ChronoDuration::hours(1));
    let expired_id = expired.id().to_string();
    let live_id = live.id().to_string();
    queue.put(expired).await?;
    queue.put(live).await?;

    queue.start(ctx.cancellation_token.clone()).await?;
    ctx.wait_for_completed(queue.as_ref(), 1).await?;
    ctx.settle().await;

    let expired = ctx.fetch(queue.as_ref(), &expired_id).await?;
    ensure(!expired.status().completed, || {
        format!("job '{}' ran after its dispatch deadline", expired_id)
    })?;
    let live = ctx.fetch(queue.as_ref(), &live_id).await?;
    ensure(live.status().completed, || {
        format!("job '{}' with a future deadline did not complete", live_id)
    })?;
    ensure(ctx.counter.count() == 1, || {
        format!("expected exactly one run, counter is {}", ctx.counter.count())
    })?;
    Ok(())
}

async fn close_cancels_in_flight(ctx: &mut ScenarioContext<'_>) -> ScenarioResult {
    let queue = ctx.primary().await?;
    let job: Box<dyn Job> = Box::new(SleepJob::new(Duration::from_secs(3600)));
    let id = job.id().to_string();
    queue.put(job).await?;

    queue.start(ctx.cancellation_token.clone()).await?;
    ctx.wait_for(queue.as_ref(), "the sleep job to start", |stats| {
        stats.running >= 1
    })
    .await?;

    let runner = queue.runner();
    let bound = ctx.options.drain_timeout + ctx.options.close_grace;
    let started = Instant::now();
    runner.close(ctx.options.drain_timeout).await;
    let took = started.elapsed();

    ensure(took <= bound, || {
        format!("runner close took {:?}, bound is {:?}", took, bound)
    })?;
    ensure(runner.active_workers() == 0, || {
        format!("{} workers still active after close", runner.active_workers())
    })?;
    let job = ctx.fetch(queue.as_ref(), &id).await?;
    ensure(job.status().completed, || {
        format!("interrupted job '{}' was not marked complete", id)
    })?;
    Ok(())
}
