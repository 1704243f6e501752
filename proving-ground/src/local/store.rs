use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;

use crate::core::job::{JobStatus, JobTimeInfo};
use crate::core::store::{StoreAdmin, StoreError, StoreErrorKind, StoreOperation};

/// Administrative operation of [`MemoryAdmin`] that can be made to fail once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminFault {
    Create,
    Connect,
    Disconnect,
    TerminateSessions,
    Drop,
    /// The next drop never returns.
    HangDrop,
}

/// An in-process stand-in for a database server.
///
/// Stores live as long as any handle to the admin. Clones share the same stores, so the admin
/// handed to the provisioner and the one a test keeps for inspection see the same state. Like a
/// real server it refuses to drop a store that still has sessions attached.
#[derive(Debug, Clone, Default)]
pub struct MemoryAdmin {
    inner: Arc<Mutex<AdminState>>,
}

#[derive(Debug, Default)]
struct AdminState {
    stores: HashMap<String, LocalStore>,
    faults: Vec<AdminFault>,
}

impl AdminState {
    fn take_fault(&mut self, fault: AdminFault) -> bool {
        if let Some(pos) = self.faults.iter().position(|f| *f == fault) {
            self.faults.remove(pos);
            true
        } else {
            false
        }
    }
}

impl MemoryAdmin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `fault` operation fail.
    pub async fn inject_fault(&self, fault: AdminFault) {
        self.inner.lock().await.faults.push(fault);
    }

    /// Create a store directly, bypassing fault injection.
    pub async fn create(&self, name: &str) {
        self.inner
            .lock()
            .await
            .stores
            .entry(name.to_string())
            .or_insert_with(|| LocalStore::new(name));
    }

    pub async fn exists(&self, name: &str) -> bool {
        self.inner.lock().await.stores.contains_key(name)
    }

    pub async fn sessions(&self, name: &str) -> u64 {
        match self.inner.lock().await.stores.get(name) {
            Some(store) => store.state.lock().await.sessions,
            None => 0,
        }
    }

    pub async fn store_names(&self) -> Vec<String> {
        self.inner.lock().await.stores.keys().cloned().collect()
    }
}

fn injected(operation: StoreOperation, store: &str) -> StoreError {
    StoreError::other(operation, store, anyhow::anyhow!("injected fault"))
}

#[async_trait]
impl StoreAdmin for MemoryAdmin {
    type Connection = LocalStore;

    async fn create_store(&self, name: &str) -> Result<(), StoreError> {
        let mut admin = self.inner.lock().await;
        if admin.take_fault(AdminFault::Create) {
            return Err(injected(StoreOperation::Create, name));
        }
        if admin.stores.contains_key(name) {
            return Err(StoreError::new(
                StoreErrorKind::AlreadyExists,
                StoreOperation::Create,
                name,
                anyhow::anyhow!("store \"{}\" already exists", name),
            ));
        }
        admin.stores.insert(name.to_string(), LocalStore::new(name));
        Ok(())
    }

    async fn connect_store(&self, name: &str) -> Result<LocalStore, StoreError> {
        let mut admin = self.inner.lock().await;
        if admin.take_fault(AdminFault::Connect) {
            return Err(injected(StoreOperation::Connect, name));
        }
        let store = admin.stores.get(name).cloned().ok_or_else(|| {
            StoreError::not_found(
                StoreOperation::Connect,
                name,
                anyhow::anyhow!("store \"{}\" does not exist", name),
            )
        })?;
        store.state.lock().await.sessions += 1;
        Ok(store)
    }

    async fn disconnect(&self, connection: &LocalStore) -> Result<(), StoreError> {
        if self.inner.lock().await.take_fault(AdminFault::Disconnect) {
            return Err(injected(StoreOperation::Disconnect, &connection.name));
        }
        let mut state = connection.state.lock().await;
        state.sessions = state.sessions.saturating_sub(1);
        Ok(())
    }

    async fn terminate_sessions(&self, name: &str) -> Result<u64, StoreError> {
        let mut admin = self.inner.lock().await;
        if admin.take_fault(AdminFault::TerminateSessions) {
            return Err(injected(StoreOperation::TerminateSessions, name));
        }
        match admin.stores.get(name) {
            Some(store) => {
                let mut state = store.state.lock().await;
                Ok(std::mem::take(&mut state.sessions))
            }
            None => Ok(0),
        }
    }

    async fn drop_store(&self, name: &str) -> Result<(), StoreError> {
        let hang = {
            let mut admin = self.inner.lock().await;
            if admin.take_fault(AdminFault::Drop) {
                return Err(injected(StoreOperation::Drop, name));
            }
            admin.take_fault(AdminFault::HangDrop)
        };
        if hang {
            std::future::pending::<()>().await;
        }

        let mut admin = self.inner.lock().await;
        let store = admin.stores.get(name).cloned().ok_or_else(|| {
            StoreError::not_found(
                StoreOperation::Drop,
                name,
                anyhow::anyhow!("store \"{}\" does not exist", name),
            )
        })?;
        let mut state = store.state.lock().await;
        if state.sessions > 0 {
            return Err(StoreError::other(
                StoreOperation::Drop,
                name,
                anyhow::anyhow!(
                    "store \"{}\" is being accessed by {} other sessions",
                    name,
                    state.sessions
                ),
            ));
        }
        state.dropped = true;
        state.jobs.clear();
        drop(state);
        admin.stores.remove(name);
        Ok(())
    }
}

/// Connection to one in-process store. Cloning yields another handle to the same store.
#[derive(Debug, Clone)]
pub struct LocalStore {
    name: String,
    pub(crate) state: Arc<Mutex<StoreState>>,
}

impl LocalStore {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Arc::new(Mutex::new(StoreState::default())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Jobs are keyed by `(group, id)`; ungrouped queues use the `None` group.
pub(crate) type JobKey = (Option<String>, String);

#[derive(Debug, Default)]
pub(crate) struct StoreState {
    pub(crate) jobs: HashMap<JobKey, StoredJob>,
    pub(crate) sessions: u64,
    pub(crate) dropped: bool,
    pub(crate) next_seq: u64,
}

/// A persisted job: the encoded interchange document plus the columns dispatch filters on.
#[derive(Debug, Clone)]
pub(crate) struct StoredJob {
    pub(crate) payload: Bytes,
    pub(crate) status: JobStatus,
    pub(crate) time_info: JobTimeInfo,
    pub(crate) seq: u64,
    /// Set once the job failed to decode or rebuild; it is never offered for dispatch again.
    pub(crate) poisoned: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_twice_reports_already_exists() {
        let admin = MemoryAdmin::new();
        admin.create_store("s").await.unwrap();
        let error = admin.create_store("s").await.unwrap_err();
        assert_eq!(error.kind, StoreErrorKind::AlreadyExists);
    }

    #[tokio::test]
    async fn connect_to_missing_store_is_not_found() {
        let error = MemoryAdmin::new().connect_store("nope").await.unwrap_err();
        assert!(error.is_not_found());
    }

    #[tokio::test]
    async fn drop_refused_while_sessions_attached() {
        let admin = MemoryAdmin::new();
        admin.create_store("s").await.unwrap();
        let connection = admin.connect_store("s").await.unwrap();

        let error = admin.drop_store("s").await.unwrap_err();
        assert_eq!(error.kind, StoreErrorKind::Other);
        assert!(error.to_string().contains("1 other sessions"));

        assert_eq!(admin.terminate_sessions("s").await.unwrap(), 1);
        admin.drop_store("s").await.unwrap();
        assert!(!admin.exists("s").await);
        assert!(connection.state.lock().await.dropped);
    }

    #[tokio::test]
    async fn drop_missing_store_is_not_found() {
        let error = MemoryAdmin::new().drop_store("gone").await.unwrap_err();
        assert!(error.is_not_found());
    }

    #[tokio::test]
    async fn terminate_on_missing_store_is_noop() {
        assert_eq!(MemoryAdmin::new().terminate_sessions("gone").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn faults_fire_once() {
        let admin = MemoryAdmin::new();
        admin.inject_fault(AdminFault::Create).await;
        assert!(admin.create_store("s").await.is_err());
        admin.create_store("s").await.unwrap();
        assert_eq!(admin.store_names().await, vec!["s".to_string()]);
    }

    #[tokio::test]
    async fn disconnect_releases_session() {
        let admin = MemoryAdmin::new();
        admin.create_store("s").await.unwrap();
        let connection = admin.connect_store("s").await.unwrap();
        assert_eq!(admin.sessions("s").await, 1);
        admin.disconnect(&connection).await.unwrap();
        assert_eq!(admin.sessions("s").await, 0);
    }
}
