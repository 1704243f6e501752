use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};

/// Environment variable holding the URL of the control database.
pub const DATABASE_URL_VAR: &str = "DATABASE_URL";

pub const DEFAULT_DATABASE_URL: &str = "postgres://postgres@localhost/postgres";

/// Where the control database lives and how pools to it and to provisioned databases are sized.
///
/// ```rust
/// use proving_ground_postgres::PostgresOptions;
/// use std::time::Duration;
///
/// let opts = PostgresOptions::new("postgres://ci@db/postgres")
///     .with_max_connections(8)
///     .with_acquire_timeout(Duration::from_secs(2));
/// assert_eq!(opts.url(), "postgres://ci@db/postgres");
/// assert_eq!(opts.max_connections(), 8);
/// ```
#[derive(Debug, Clone)]
pub struct PostgresOptions {
    url: String,
    max_connections: u32,
    acquire_timeout: Duration,
}

impl PostgresOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 4,
            acquire_timeout: Duration::from_secs(5),
        }
    }

    /// Read the control URL from `DATABASE_URL`, falling back to a local superuser connection.
    pub fn from_env() -> Self {
        Self::from_env_value(std::env::var(DATABASE_URL_VAR).ok())
    }

    pub(crate) fn from_env_value(value: Option<String>) -> Self {
        match value {
            Some(url) if !url.trim().is_empty() => Self::new(url.trim()),
            _ => Self::new(DEFAULT_DATABASE_URL),
        }
    }

    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections.max(1);
        self
    }

    pub fn with_acquire_timeout(mut self, acquire_timeout: Duration) -> Self {
        self.acquire_timeout = acquire_timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn max_connections(&self) -> u32 {
        self.max_connections
    }

    pub fn acquire_timeout(&self) -> Duration {
        self.acquire_timeout
    }

    pub(crate) fn connect_options(&self) -> Result<PgConnectOptions, sqlx::Error> {
        self.url.parse()
    }

    pub(crate) fn pool_options(&self) -> PgPoolOptions {
        PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.acquire_timeout)
    }
}

impl Default for PostgresOptions {
    fn default() -> Self {
        Self::new(DEFAULT_DATABASE_URL)
    }
}
