//! In-process reference backend.
//!
//! [`MemoryAdmin`] plays the control database and [`LocalQueue`] the queue under test. Together
//! they let the provisioner, the worker pool and the conformance matrix run without any server.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::conformance::{closer, ConstructedQueue};
use crate::core::queue::{Queue, QueueParams};
use crate::provision::{EphemeralStore, ProvisionError, ProvisionerOptions};

mod queue;
mod store;

pub use queue::{LocalQueue, LocalQueueOptions};
pub use store::{AdminFault, LocalStore, MemoryAdmin};

/// Queue constructor backed by ephemeral stores on `admin`.
///
/// Each call provisions the store named after [`QueueParams::name`], reusing it when it already
/// exists, and returns a closer that tears it down.
pub fn local_constructor(
    admin: MemoryAdmin,
    options: LocalQueueOptions,
) -> impl Fn(CancellationToken, QueueParams) -> BoxFuture<'static, Result<ConstructedQueue, ProvisionError>>
       + Send
       + Sync
       + Clone
       + 'static {
    move |cancellation_token, params| {
        construct(admin.clone(), options.clone(), cancellation_token, params).boxed()
    }
}

fn construct(
    admin: MemoryAdmin,
    options: LocalQueueOptions,
    cancellation_token: CancellationToken,
    params: QueueParams,
) -> impl Future<Output = Result<ConstructedQueue, ProvisionError>> + Send + 'static {
    async move {
        let store = EphemeralStore::provision(
            admin,
            &ProvisionerOptions::default(),
            Some(params.name()),
            &cancellation_token,
        )
        .await?;
        let queue: Arc<dyn Queue> = LocalQueue::new(store.connection().clone(), &params, options);
        let closer = closer(move || async move { store.close().await });
        Ok((queue, closer))
    }
}
