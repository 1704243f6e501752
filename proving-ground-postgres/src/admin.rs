use anyhow::Context;
use async_trait::async_trait;
use proving_ground::core::store::{StoreAdmin, StoreError, StoreErrorKind, StoreOperation};
use sqlx::PgPool;
use tracing::instrument;

use crate::options::PostgresOptions;

/// SQLSTATE `invalid_catalog_name`: the database does not exist.
pub const INVALID_CATALOG_NAME: &str = "3D000";

/// SQLSTATE `duplicate_database`.
pub const DUPLICATE_DATABASE: &str = "42P04";

/// Map a PostgreSQL SQLSTATE to a store error kind.
pub fn classify_code(code: Option<&str>) -> StoreErrorKind {
    match code {
        Some(INVALID_CATALOG_NAME) => StoreErrorKind::NotFound,
        Some(DUPLICATE_DATABASE) => StoreErrorKind::AlreadyExists,
        _ => StoreErrorKind::Other,
    }
}

fn store_error(operation: StoreOperation, store: &str, error: anyhow::Error) -> StoreError {
    let kind = match error.downcast_ref::<sqlx::Error>() {
        Some(sqlx::Error::PoolTimedOut) => StoreErrorKind::Timeout,
        Some(e) => {
            let code = e.as_database_error().and_then(|db| db.code());
            classify_code(code.as_deref())
        }
        None => StoreErrorKind::Other,
    };
    StoreError::new(kind, operation, store, error)
}

/// Quote `name` as an SQL identifier. Database names cannot be bound as parameters.
pub(crate) fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Creates, terminates and drops databases through a connection to the control database.
///
/// Connections handed out by [`StoreAdmin::connect_store`] are pools scoped to the provisioned
/// database, sized like the control pool.
#[derive(Clone)]
pub struct PostgresAdmin {
    pool: PgPool,
    options: PostgresOptions,
}

impl PostgresAdmin {
    /// Connect to the control database named in `options`.
    #[instrument(skip_all, err)]
    pub async fn connect(options: PostgresOptions) -> Result<Self, StoreError> {
        let control = "control database";
        let connect_options = options
            .connect_options()
            .context("Failed to parse control database URL")
            .map_err(|e| store_error(StoreOperation::Connect, control, e))?;
        let pool = options
            .pool_options()
            .connect_with(connect_options)
            .await
            .context("Failed to connect to control database")
            .map_err(|e| store_error(StoreOperation::Connect, control, e))?;
        Ok(Self::with_pool(pool, options))
    }

    pub fn with_pool(pool: PgPool, options: PostgresOptions) -> Self {
        Self { pool, options }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Whether a database called `name` exists.
    pub async fn database_exists(&self, name: &str) -> Result<bool, StoreError> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM pg_database WHERE datname = $1)",
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .context("Failed to look up database")
        .map_err(|e| store_error(StoreOperation::Connect, name, e))
    }
}

#[async_trait]
impl StoreAdmin for PostgresAdmin {
    type Connection = PgPool;

    #[instrument(skip(self), err)]
    async fn create_store(&self, name: &str) -> Result<(), StoreError> {
        sqlx::query(&format!("CREATE DATABASE {}", quote_identifier(name)))
            .execute(&self.pool)
            .await
            .context("Failed to create database")
            .map_err(|e| store_error(StoreOperation::Create, name, e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn connect_store(&self, name: &str) -> Result<PgPool, StoreError> {
        let connect_options = self
            .options
            .connect_options()
            .context("Failed to parse control database URL")
            .map_err(|e| store_error(StoreOperation::Connect, name, e))?
            .database(name);
        self.options
            .pool_options()
            .connect_with(connect_options)
            .await
            .context("Failed to connect to database")
            .map_err(|e| store_error(StoreOperation::Connect, name, e))
    }

    async fn disconnect(&self, connection: &PgPool) -> Result<(), StoreError> {
        connection.close().await;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn terminate_sessions(&self, name: &str) -> Result<u64, StoreError> {
        let terminated = sqlx::query_scalar::<_, bool>(
            "SELECT pg_terminate_backend(pid) FROM pg_stat_activity WHERE datname = $1 AND pid <> pg_backend_pid()",
        )
        .bind(name)
        .fetch_all(&self.pool)
        .await
        .context("Failed to terminate sessions")
        .map_err(|e| store_error(StoreOperation::TerminateSessions, name, e))?;
        Ok(terminated.into_iter().filter(|t| *t).count() as u64)
    }

    #[instrument(skip(self), err)]
    async fn drop_store(&self, name: &str) -> Result<(), StoreError> {
        sqlx::query(&format!("DROP DATABASE {}", quote_identifier(name)))
            .execute(&self.pool)
            .await
            .context("Failed to drop database")
            .map_err(|e| store_error(StoreOperation::Drop, name, e))?;
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), StoreError> {
        self.pool.close().await;
        Ok(())
    }
}
