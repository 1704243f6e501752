use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

/// Administrative interface to the control database of a backing store.
///
/// Implementations issue the lifecycle commands the provisioner needs: create a store, open a
/// connection scoped to it, terminate lingering sessions, and drop it. Every failure is reported
/// as a [`StoreError`] classified by [`StoreErrorKind`], so the provisioner can tell a store that
/// is already gone apart from a genuine fault without looking at driver-specific codes.
#[async_trait]
pub trait StoreAdmin: Send + Sync + 'static {
    /// Connection scoped to one store, handed to the queue under test.
    type Connection: Clone + Send + Sync + 'static;

    async fn create_store(&self, name: &str) -> Result<(), StoreError>;

    async fn connect_store(&self, name: &str) -> Result<Self::Connection, StoreError>;

    async fn disconnect(&self, connection: &Self::Connection) -> Result<(), StoreError>;

    /// Forcibly end every session attached to `name`. Returns how many were terminated.
    /// Terminating sessions of a store that does not exist is not an error.
    async fn terminate_sessions(&self, name: &str) -> Result<u64, StoreError>;

    async fn drop_store(&self, name: &str) -> Result<(), StoreError>;

    /// Release the administrative connection itself.
    async fn shutdown(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Classification of store administration failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum StoreErrorKind {
    /// The store does not exist (anymore).
    NotFound,
    /// The store already exists.
    AlreadyExists,
    /// The operation did not finish within its bound.
    Timeout,
    Other,
}

impl fmt::Display for StoreErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StoreErrorKind::NotFound => "not found",
            StoreErrorKind::AlreadyExists => "already exists",
            StoreErrorKind::Timeout => "timed out",
            StoreErrorKind::Other => "failed",
        };
        f.write_str(s)
    }
}

/// Administrative operation that produced a [`StoreError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOperation {
    Create,
    Connect,
    Disconnect,
    TerminateSessions,
    Drop,
    Shutdown,
}

impl fmt::Display for StoreOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StoreOperation::Create => "create store",
            StoreOperation::Connect => "connect to store",
            StoreOperation::Disconnect => "close store connection",
            StoreOperation::TerminateSessions => "terminate store sessions",
            StoreOperation::Drop => "drop store",
            StoreOperation::Shutdown => "close admin connection",
        };
        f.write_str(s)
    }
}

/// Error returned by [`StoreAdmin`] operations.
#[derive(Error, Debug)]
#[error("Failed to {operation} '{store}' ({kind}): {source}")]
pub struct StoreError {
    pub kind: StoreErrorKind,
    pub operation: StoreOperation,
    pub store: String,
    #[source]
    pub source: anyhow::Error,
}

impl StoreError {
    pub fn new(
        kind: StoreErrorKind,
        operation: StoreOperation,
        store: impl Into<String>,
        source: impl Into<anyhow::Error>,
    ) -> Self {
        Self {
            kind,
            operation,
            store: store.into(),
            source: source.into(),
        }
    }

    pub fn not_found(
        operation: StoreOperation,
        store: impl Into<String>,
        source: impl Into<anyhow::Error>,
    ) -> Self {
        Self::new(StoreErrorKind::NotFound, operation, store, source)
    }

    pub fn other(
        operation: StoreOperation,
        store: impl Into<String>,
        source: impl Into<anyhow::Error>,
    ) -> Self {
        Self::new(StoreErrorKind::Other, operation, store, source)
    }

    pub fn timeout(
        operation: StoreOperation,
        store: impl Into<String>,
        after: std::time::Duration,
    ) -> Self {
        Self::new(
            StoreErrorKind::Timeout,
            operation,
            store,
            anyhow::anyhow!("no response after {:?}", after),
        )
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == StoreErrorKind::NotFound
    }
}
