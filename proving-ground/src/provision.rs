//! Ephemeral, uniquely named backing stores.
//!
//! [`EphemeralStore::provision`] creates a store that cannot collide with any other test running
//! at the same time and hands back a connection scoped to it. [`EphemeralStore::close`] tears
//! the store down and reports every failure it ran into, not only the first.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use uuid::Uuid;

use crate::core::store::{StoreAdmin, StoreError, StoreErrorKind, StoreOperation};

/// PostgreSQL truncates identifiers longer than this.
pub const MAX_STORE_NAME_LEN: usize = 63;

const SUFFIX_LEN: usize = 12;

/// Random suffix for store names: the first 12 hex characters of a v4 UUID.
pub fn unique_suffix() -> String {
    let mut suffix = Uuid::new_v4().simple().to_string();
    suffix.truncate(SUFFIX_LEN);
    suffix
}

/// Store names must be valid unquoted identifiers on every backend: lowercase ASCII letters,
/// digits and underscores, not starting with a digit.
pub fn is_valid_store_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_STORE_NAME_LEN
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Options for provisioning ephemeral stores.
///
/// ```rust
/// use proving_ground::provision::ProvisionerOptions;
/// use std::time::Duration;
///
/// let opts = ProvisionerOptions::new()
///     .with_prefix("queue_tests_")
///     .with_admin_timeout(Duration::from_secs(3));
/// assert_eq!(opts.store_name("abc1234"), "queue_tests_abc1234");
/// ```
#[derive(Debug, Clone)]
pub struct ProvisionerOptions {
    pub(crate) prefix: String,
    pub(crate) admin_timeout: Duration,
}

impl ProvisionerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Upper bound for every administrative call made while provisioning or closing.
    pub fn with_admin_timeout(mut self, admin_timeout: Duration) -> Self {
        self.admin_timeout = admin_timeout;
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn admin_timeout(&self) -> Duration {
        self.admin_timeout
    }

    pub fn store_name(&self, suffix: &str) -> String {
        format!("{}{}", self.prefix, suffix)
    }
}

impl Default for ProvisionerOptions {
    fn default() -> Self {
        Self {
            prefix: "proving_ground_".to_string(),
            admin_timeout: Duration::from_secs(10),
        }
    }
}

/// A disposable store owned by one test.
///
/// Dropping the handle does not remove the store; call [`EphemeralStore::close`].
pub struct EphemeralStore<A: StoreAdmin> {
    name: String,
    connection: A::Connection,
    cancellation_token: CancellationToken,
    admin: Arc<A>,
    admin_timeout: Duration,
    closed: AtomicBool,
}

impl<A: StoreAdmin> fmt::Debug for EphemeralStore<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeralStore")
            .field("name", &self.name)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl<A: StoreAdmin> EphemeralStore<A> {
    /// Provision a store named `prefix + suffix`, with a fresh [`unique_suffix`] when `suffix` is
    /// `None`.
    ///
    /// Creation is best effort: a store that already exists is reused, which is how several queue
    /// instances of one scenario end up sharing a store. Failing to connect is fatal.
    #[instrument(skip_all, err, fields(store))]
    pub async fn provision(
        admin: A,
        options: &ProvisionerOptions,
        suffix: Option<&str>,
        parent: &CancellationToken,
    ) -> Result<Self, ProvisionError> {
        let suffix = suffix.map_or_else(unique_suffix, str::to_string);
        let name = options.store_name(&suffix);
        tracing::Span::current().record("store", name.as_str());

        if !is_valid_store_name(&name) {
            return Err(ProvisionError::InvalidName(name));
        }

        let admin = Arc::new(admin);
        let timeout = options.admin_timeout;

        let created = admin.create_store(&name);
        let created_here = match bounded(timeout, StoreOperation::Create, &name, created).await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("Ignoring failure to create store: {}", e);
                false
            }
        };

        let connected = admin.connect_store(&name);
        let connection = match bounded(timeout, StoreOperation::Connect, &name, connected).await {
            Ok(connection) => connection,
            Err(e) => {
                if created_here {
                    discard(&*admin, timeout, &name).await;
                }
                let shutdown = admin.shutdown();
                let shutdown = bounded(timeout, StoreOperation::Shutdown, &name, shutdown).await;
                if let Err(shutdown_error) = shutdown {
                    tracing::warn!("{}", shutdown_error);
                }
                return Err(ProvisionError::Connect(e));
            }
        };

        tracing::debug!("Provisioned store");
        Ok(Self {
            name,
            connection,
            cancellation_token: parent.child_token(),
            admin,
            admin_timeout: timeout,
            closed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connection(&self) -> &A::Connection {
        &self.connection
    }

    /// Cancelled when the store is closed or the parent token is cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    pub fn admin(&self) -> &A {
        &self.admin
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Tear the store down.
    ///
    /// Cancels the store's token, closes the scoped connection, terminates sessions still attached
    /// to the store, drops it, and shuts the admin connection down. Every step runs even when an
    /// earlier one failed; all failures come back together in one [`TeardownError`]. A store that
    /// is already gone is logged as a warning and not reported. Calling `close` again returns
    /// `Ok(())` without touching the backend.
    #[instrument(skip_all, err, fields(store = %self.name))]
    pub async fn close(&self) -> Result<(), TeardownError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!("Store already closed");
            return Ok(());
        }

        self.cancellation_token.cancel();
        let name = self.name.as_str();
        let timeout = self.admin_timeout;
        let mut errors = Vec::new();

        if let Err(e) = bounded(
            timeout,
            StoreOperation::Disconnect,
            name,
            self.admin.disconnect(&self.connection),
        )
        .await
        {
            errors.push(e);
        }

        match bounded(
            timeout,
            StoreOperation::TerminateSessions,
            name,
            self.admin.terminate_sessions(name),
        )
        .await
        {
            Ok(terminated) if terminated > 0 => {
                tracing::debug!("Terminated {} lingering sessions", terminated);
            }
            Ok(_) => {}
            Err(e) => errors.push(e),
        }

        let dropped = self.admin.drop_store(name);
        match bounded(timeout, StoreOperation::Drop, name, dropped).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                tracing::warn!("Store was already removed: {}", e);
            }
            Err(e) => errors.push(e),
        }

        let shutdown = self.admin.shutdown();
        if let Err(e) = bounded(timeout, StoreOperation::Shutdown, name, shutdown).await {
            errors.push(e);
        }

        if errors.is_empty() {
            tracing::debug!("Store removed");
            Ok(())
        } else {
            Err(TeardownError {
                store: self.name.clone(),
                errors,
            })
        }
    }
}

/// Remove a store this provisioner created but could not connect to. Failures are only logged;
/// the connect error is what the caller gets to see.
async fn discard<A: StoreAdmin>(admin: &A, timeout: Duration, name: &str) {
    let terminated = admin.terminate_sessions(name);
    if let Err(e) = bounded(timeout, StoreOperation::TerminateSessions, name, terminated).await {
        tracing::warn!("{}", e);
    }
    let dropped = admin.drop_store(name);
    match bounded(timeout, StoreOperation::Drop, name, dropped).await {
        Ok(()) => tracing::debug!("Removed store after failed connect"),
        Err(e) if e.is_not_found() => tracing::warn!("Store was already removed: {}", e),
        Err(e) => tracing::warn!("Failed to remove store after failed connect: {}", e),
    }
}

/// Run an admin operation, turning an elapsed bound into a [`StoreErrorKind::Timeout`] error.
async fn bounded<T, F>(
    timeout: Duration,
    operation: StoreOperation,
    store: &str,
    fut: F,
) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::timeout(operation, store, timeout)),
    }
}

/// Failure to hand a test its store or its queue.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProvisionError {
    #[error("Invalid store name '{0}'")]
    InvalidName(String),

    #[error("Failed to connect to provisioned store: {0}")]
    Connect(#[source] StoreError),

    #[error("Failed to reach the control database: {0}")]
    Admin(#[source] StoreError),

    /// The queue constructor of a test case failed.
    #[error("Failed to construct queue: {0}")]
    Queue(#[source] anyhow::Error),
}

/// Every failure that occurred while tearing one store down.
#[derive(Error, Debug)]
pub struct TeardownError {
    pub store: String,
    pub errors: Vec<StoreError>,
}

impl TeardownError {
    /// Whether any of the collected failures is of `kind`.
    pub fn contains(&self, kind: StoreErrorKind) -> bool {
        self.errors.iter().any(|e| e.kind == kind)
    }
}

impl fmt::Display for TeardownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} problem(s) cleaning up store '{}'",
            self.errors.len(),
            self.store
        )?;
        for error in &self.errors {
            write!(f, "\n  - {}", error)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::{AdminFault, MemoryAdmin};
    use std::collections::HashSet;
    use std::time::Instant;

    #[test]
    fn suffix_is_twelve_hex_chars() {
        let suffix = unique_suffix();
        assert_eq!(suffix.len(), 12);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn suffixes_do_not_collide() {
        let suffixes: HashSet<_> = (0..10_000).map(|_| unique_suffix()).collect();
        assert_eq!(suffixes.len(), 10_000);
    }

    #[test]
    fn store_name_validation() {
        assert!(is_valid_store_name("proving_ground_abc123"));
        assert!(!is_valid_store_name(""));
        assert!(!is_valid_store_name("Upper"));
        assert!(!is_valid_store_name("has-dash"));
        assert!(!is_valid_store_name("1starts_with_digit"));
        assert!(!is_valid_store_name("x; DROP DATABASE postgres"));
        assert!(!is_valid_store_name(&"a".repeat(64)));
        assert!(is_valid_store_name(&"a".repeat(63)));
    }

    #[tokio::test]
    async fn provision_creates_and_connects() {
        let admin = MemoryAdmin::new();
        let store = EphemeralStore::provision(
            admin.clone(),
            &ProvisionerOptions::default(),
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(store.name().starts_with("proving_ground_"));
        assert!(admin.exists(store.name()).await);
        assert_eq!(admin.sessions(store.name()).await, 1);

        store.close().await.unwrap();
        assert!(!admin.exists(store.name()).await);
        assert!(store.is_closed());
        assert!(store.cancellation_token().is_cancelled());
    }

    #[tokio::test]
    async fn existing_store_is_reused() {
        let admin = MemoryAdmin::new();
        let opts = ProvisionerOptions::default();
        let token = CancellationToken::new();
        let first = EphemeralStore::provision(admin.clone(), &opts, Some("shared"), &token)
            .await
            .unwrap();
        let second = EphemeralStore::provision(admin.clone(), &opts, Some("shared"), &token)
            .await
            .unwrap();

        assert_eq!(first.name(), second.name());
        assert_eq!(admin.sessions(first.name()).await, 2);

        second.close().await.unwrap();
        // The second close found the store gone; only a warning.
        first.close().await.unwrap();
    }

    #[tokio::test]
    async fn invalid_prefix_is_rejected() {
        let result = EphemeralStore::provision(
            MemoryAdmin::new(),
            &ProvisionerOptions::new().with_prefix("Bad-Prefix"),
            None,
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(result, Err(ProvisionError::InvalidName(_))));
    }

    #[tokio::test]
    async fn connect_failure_is_fatal() {
        let admin = MemoryAdmin::new();
        admin.inject_fault(AdminFault::Connect).await;
        let result = EphemeralStore::provision(
            admin,
            &ProvisionerOptions::default(),
            None,
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(result, Err(ProvisionError::Connect(_))));
    }

    #[tokio::test]
    async fn connect_failure_removes_store_it_created() {
        let admin = MemoryAdmin::new();
        admin.inject_fault(AdminFault::Connect).await;
        let result = EphemeralStore::provision(
            admin.clone(),
            &ProvisionerOptions::default(),
            Some("half_built"),
            &CancellationToken::new(),
        )
        .await;

        assert!(matches!(result, Err(ProvisionError::Connect(_))));
        assert!(admin.store_names().await.is_empty());
    }

    #[tokio::test]
    async fn connect_failure_keeps_store_it_did_not_create() {
        let admin = MemoryAdmin::new();
        admin.create("proving_ground_shared").await;
        admin.inject_fault(AdminFault::Connect).await;
        let result = EphemeralStore::provision(
            admin.clone(),
            &ProvisionerOptions::default(),
            Some("shared"),
            &CancellationToken::new(),
        )
        .await;

        assert!(matches!(result, Err(ProvisionError::Connect(_))));
        assert!(admin.exists("proving_ground_shared").await);
    }

    #[tokio::test]
    async fn create_failure_is_tolerated() {
        let admin = MemoryAdmin::new();
        admin.inject_fault(AdminFault::Create).await;
        let store = EphemeralStore::provision(
            admin.clone(),
            &ProvisionerOptions::default(),
            Some("precreated"),
            &CancellationToken::new(),
        )
        .await;
        // Create failed and nothing exists, so connecting fails.
        assert!(matches!(store, Err(ProvisionError::Connect(_))));

        admin.create("proving_ground_precreated").await;
        admin.inject_fault(AdminFault::Create).await;
        let store = EphemeralStore::provision(
            admin.clone(),
            &ProvisionerOptions::default(),
            Some("precreated"),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn second_close_is_ok() {
        let store = EphemeralStore::provision(
            MemoryAdmin::new(),
            &ProvisionerOptions::default(),
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        store.close().await.unwrap();
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_after_out_of_band_drop_only_warns() {
        let admin = MemoryAdmin::new();
        let store = EphemeralStore::provision(
            admin.clone(),
            &ProvisionerOptions::default(),
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        admin.terminate_sessions(store.name()).await.unwrap();
        admin.drop_store(store.name()).await.unwrap();

        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn failures_are_accumulated_not_short_circuited() {
        let admin = MemoryAdmin::new();
        let store = EphemeralStore::provision(
            admin.clone(),
            &ProvisionerOptions::default(),
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        admin.inject_fault(AdminFault::Disconnect).await;
        admin.inject_fault(AdminFault::TerminateSessions).await;

        let error = store.close().await.unwrap_err();

        // Disconnect and terminate failed; the drop was still attempted and, with a session left
        // attached, refused.
        assert_eq!(error.errors.len(), 3);
        let ops: Vec<_> = error.errors.iter().map(|e| e.operation).collect();
        assert_eq!(
            ops,
            vec![
                StoreOperation::Disconnect,
                StoreOperation::TerminateSessions,
                StoreOperation::Drop
            ]
        );
        assert!(error.contains(StoreErrorKind::Other));
        let msg = error.to_string();
        assert!(msg.contains("3 problem(s)"));
        assert!(msg.contains(store.name()));
    }

    #[tokio::test]
    async fn hung_admin_is_bounded() {
        let admin = MemoryAdmin::new();
        let store = EphemeralStore::provision(
            admin.clone(),
            &ProvisionerOptions::default().with_admin_timeout(Duration::from_millis(50)),
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        admin.inject_fault(AdminFault::HangDrop).await;

        let started = Instant::now();
        let error = store.close().await.unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(error.errors.len(), 1);
        assert_eq!(error.errors[0].kind, StoreErrorKind::Timeout);
        assert_eq!(error.errors[0].operation, StoreOperation::Drop);
    }

    #[tokio::test]
    async fn parent_cancellation_reaches_store_token() {
        let parent = CancellationToken::new();
        let store = EphemeralStore::provision(
            MemoryAdmin::new(),
            &ProvisionerOptions::default(),
            None,
            &parent,
        )
        .await
        .unwrap();
        parent.cancel();
        assert!(store.cancellation_token().is_cancelled());
        store.close().await.unwrap();
    }
}
