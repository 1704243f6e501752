use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::core::queue::{Queue, QueueParams};
use crate::provision::{ProvisionError, TeardownError};

/// Pool sizes a multi-worker case is exercised with, clipped to its `[min_size, max_size]`.
pub const POOL_SIZE_LADDER: [usize; 6] = [1, 2, 4, 8, 16, 32];

/// Releases everything a queue constructor acquired, usually the ephemeral store.
pub type TestCloser = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), TeardownError>> + Send>;

/// Output of a [`QueueConstructor`].
pub type ConstructedQueue = (Arc<dyn Queue>, TestCloser);

/// Builds one queue instance for a scenario.
///
/// Called with the scenario's cancellation token and its [`QueueParams`]. Constructors that
/// receive the same name must hand back queues backed by the same store.
pub type QueueConstructor = Arc<
    dyn Fn(CancellationToken, QueueParams) -> BoxFuture<'static, Result<ConstructedQueue, ProvisionError>>
        + Send
        + Sync,
>;

/// Wrap an async teardown function into a [`TestCloser`].
pub fn closer<F, Fut>(f: F) -> TestCloser
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), TeardownError>> + Send + 'static,
{
    Box::new(move || f().boxed())
}

/// A closer with nothing to release, for purely in-memory queues.
pub fn noop_closer() -> TestCloser {
    closer(|| async { Ok(()) })
}

/// One queue configuration of the conformance matrix.
///
/// Capability flags decide which scenarios apply. By default a case is local, multi-worker
/// (pool sizes 1 through 8), ungrouped, and supports neither scheduling constraint.
///
/// ```rust
/// use proving_ground::conformance::TestCase;
/// use proving_ground::local::{local_constructor, LocalQueueOptions, MemoryAdmin};
///
/// let case = TestCase::new("group", local_constructor(MemoryAdmin::new(), LocalQueueOptions::default()))
///     .with_pool_sizes(4, 8)
///     .with_group("kip");
/// assert_eq!(case.pool_sizes(), vec![4, 8]);
/// assert_eq!(case.group_name(), Some("kip"));
/// ```
#[derive(Clone)]
pub struct TestCase {
    name: String,
    constructor: QueueConstructor,
    min_size: usize,
    max_size: usize,
    is_remote: bool,
    single_worker: bool,
    multi_supported: bool,
    wait_until_supported: bool,
    dispatch_before_supported: bool,
    group_name: Option<String>,
    skip: bool,
}

impl fmt::Debug for TestCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestCase")
            .field("name", &self.name)
            .field("min_size", &self.min_size)
            .field("max_size", &self.max_size)
            .field("is_remote", &self.is_remote)
            .field("single_worker", &self.single_worker)
            .field("multi_supported", &self.multi_supported)
            .field("wait_until_supported", &self.wait_until_supported)
            .field("dispatch_before_supported", &self.dispatch_before_supported)
            .field("group_name", &self.group_name)
            .field("skip", &self.skip)
            .finish()
    }
}

impl TestCase {
    pub fn new<F, Fut>(name: impl Into<String>, constructor: F) -> Self
    where
        F: Fn(CancellationToken, QueueParams) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ConstructedQueue, ProvisionError>> + Send + 'static,
    {
        Self::with_constructor(
            name,
            Arc::new(move |token, params| constructor(token, params).boxed()),
        )
    }

    pub fn with_constructor(name: impl Into<String>, constructor: QueueConstructor) -> Self {
        Self {
            name: name.into(),
            constructor,
            min_size: 1,
            max_size: 8,
            is_remote: false,
            single_worker: false,
            multi_supported: true,
            wait_until_supported: false,
            dispatch_before_supported: false,
            group_name: None,
            skip: false,
        }
    }

    pub fn with_pool_sizes(mut self, min_size: usize, max_size: usize) -> Self {
        self.min_size = min_size;
        self.max_size = max_size;
        self
    }

    /// Every queue instance built by the constructor runs one worker.
    pub fn single_worker(mut self) -> Self {
        self.single_worker = true;
        self
    }

    /// Several queue instances of one scenario share the backing store.
    pub fn remote(mut self) -> Self {
        self.is_remote = true;
        self
    }

    pub fn with_multi_supported(mut self, supported: bool) -> Self {
        self.multi_supported = supported;
        self
    }

    pub fn with_wait_until_supported(mut self, supported: bool) -> Self {
        self.wait_until_supported = supported;
        self
    }

    pub fn with_dispatch_before_supported(mut self, supported: bool) -> Self {
        self.dispatch_before_supported = supported;
        self
    }

    /// Run the case in group mode. Its queues are scoped to `group_name`.
    pub fn with_group(mut self, group_name: impl Into<String>) -> Self {
        self.group_name = Some(group_name.into());
        self
    }

    pub fn skip(mut self) -> Self {
        self.skip = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn min_size(&self) -> usize {
        self.min_size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn is_remote(&self) -> bool {
        self.is_remote
    }

    pub fn is_single_worker(&self) -> bool {
        self.single_worker
    }

    pub fn multi_supported(&self) -> bool {
        self.multi_supported
    }

    pub fn wait_until_supported(&self) -> bool {
        self.wait_until_supported
    }

    pub fn dispatch_before_supported(&self) -> bool {
        self.dispatch_before_supported
    }

    pub fn use_groups(&self) -> bool {
        self.group_name.is_some()
    }

    pub fn group_name(&self) -> Option<&str> {
        self.group_name.as_deref()
    }

    pub fn is_skipped(&self) -> bool {
        self.skip
    }

    /// Pool sizes to exercise, smallest first. Never empty.
    pub fn pool_sizes(&self) -> Vec<usize> {
        if self.single_worker {
            return vec![1];
        }
        let min = self.min_size.max(1);
        let max = self.max_size.max(min);
        let sizes: Vec<usize> = POOL_SIZE_LADDER
            .iter()
            .copied()
            .filter(|size| (min..=max).contains(size))
            .collect();
        if sizes.is_empty() {
            vec![min]
        } else {
            sizes
        }
    }

    pub(crate) async fn construct(
        &self,
        cancellation_token: CancellationToken,
        params: QueueParams,
    ) -> Result<ConstructedQueue, ProvisionError> {
        (self.constructor)(cancellation_token, params).await
    }
}
