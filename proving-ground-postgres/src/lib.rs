//! PostgreSQL store administration for proving-ground
//!
//! Every scenario gets its own database, created through the control database named by
//! `DATABASE_URL` and dropped again on teardown after its lingering sessions are terminated.

pub mod admin;
pub mod options;

pub use admin::{classify_code, PostgresAdmin};
pub use options::PostgresOptions;

use proving_ground::core::CancellationToken;
use proving_ground::provision::{EphemeralStore, ProvisionError, ProvisionerOptions};

/// Connect to the control database and provision a fresh database on it.
///
/// With `suffix` set, an existing database of that name is reused.
pub async fn provision_database(
    options: &PostgresOptions,
    provisioner: &ProvisionerOptions,
    suffix: Option<&str>,
    parent: &CancellationToken,
) -> Result<EphemeralStore<PostgresAdmin>, ProvisionError> {
    let admin = PostgresAdmin::connect(options.clone())
        .await
        .map_err(ProvisionError::Admin)?;
    EphemeralStore::provision(admin, provisioner, suffix, parent).await
}

#[cfg(test)]
mod test {
    use super::*;
    use proving_ground::core::store::StoreAdmin;
    use sqlx::PgPool;

    #[allow(dead_code)]
    pub fn setup_logger() {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    }

    async fn control() -> PostgresAdmin {
        PostgresAdmin::connect(PostgresOptions::from_env())
            .await
            .unwrap()
    }

    #[tokio::test]
    #[ignore = "needs a PostgreSQL server at DATABASE_URL"]
    async fn provision_and_close_removes_database() {
        setup_logger();
        let store = provision_database(
            &PostgresOptions::from_env(),
            &ProvisionerOptions::default(),
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let pool: &PgPool = store.connection();
        sqlx::query("CREATE TABLE jobs (id TEXT PRIMARY KEY)")
            .execute(pool)
            .await
            .unwrap();
        let admin = control().await;
        assert!(admin.database_exists(store.name()).await.unwrap());

        store.close().await.unwrap();
        assert!(!admin.database_exists(store.name()).await.unwrap());
        admin.shutdown().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "needs a PostgreSQL server at DATABASE_URL"]
    async fn lingering_sessions_do_not_block_drop() {
        setup_logger();
        let store = provision_database(
            &PostgresOptions::from_env(),
            &ProvisionerOptions::default(),
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        // A second pool the provisioner knows nothing about.
        let admin = control().await;
        let lingering = admin.connect_store(store.name()).await.unwrap();
        sqlx::query("SELECT 1").execute(&lingering).await.unwrap();

        store.close().await.unwrap();
        assert!(!admin.database_exists(store.name()).await.unwrap());
        lingering.close().await;
        admin.shutdown().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "needs a PostgreSQL server at DATABASE_URL"]
    async fn close_is_idempotent_and_tolerates_out_of_band_drop() {
        setup_logger();
        let store = provision_database(
            &PostgresOptions::from_env(),
            &ProvisionerOptions::default(),
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let admin = control().await;
        store.connection().close().await;
        admin.terminate_sessions(store.name()).await.unwrap();
        admin.drop_store(store.name()).await.unwrap();

        store.close().await.unwrap();
        store.close().await.unwrap();
        admin.shutdown().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "needs a PostgreSQL server at DATABASE_URL"]
    async fn sqlstates_are_classified() {
        let admin = control().await;
        let name = format!("proving_ground_{}", proving_ground::provision::unique_suffix());

        let missing = admin.drop_store(&name).await.unwrap_err();
        assert!(missing.is_not_found());

        admin.create_store(&name).await.unwrap();
        let duplicate = admin.create_store(&name).await.unwrap_err();
        assert_eq!(
            duplicate.kind,
            proving_ground::core::store::StoreErrorKind::AlreadyExists
        );

        admin.drop_store(&name).await.unwrap();
        admin.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_control_database_is_an_admin_error() {
        // 192.0.2.0/24 is reserved for documentation and never routed.
        let options = PostgresOptions::new("postgres://nobody@192.0.2.1:5432/postgres")
            .with_acquire_timeout(std::time::Duration::from_millis(200));
        let result = provision_database(
            &options,
            &ProvisionerOptions::default(),
            None,
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(result, Err(ProvisionError::Admin(_))));
    }
}
