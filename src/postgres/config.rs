use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use bb8::{ManageConnection, Pool};
use serde::Deserialize;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, warn};

use crate::error::SqlBlockError;

fn default_pool_size() -> u32 {
    10
}

/// Connection settings for the Postgres backend.
///
/// Either `dsn` or the discrete `host`/`port`/`dbname`/`user`/`password`
/// fields must be supplied. Deserializable from any serde source:
///
/// ```rust
/// use sql_block::postgres::PgSettings;
///
/// let settings: PgSettings = serde_json::from_str(
///     r#"{"host":"localhost","port":5432,"dbname":"app","user":"app","password":"secret","max_size":4}"#,
/// ).unwrap();
/// assert_eq!(settings.min_size, 10);
/// assert_eq!(settings.max_size, 4);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PgSettings {
    #[serde(default)]
    pub dsn: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub dbname: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Idle connections the pool tries to keep open.
    #[serde(default = "default_pool_size")]
    pub min_size: u32,
    /// Upper bound on open connections.
    #[serde(default = "default_pool_size")]
    pub max_size: u32,
}

impl Default for PgSettings {
    fn default() -> Self {
        Self {
            dsn: None,
            host: None,
            port: None,
            dbname: None,
            user: None,
            password: None,
            min_size: default_pool_size(),
            max_size: default_pool_size(),
        }
    }
}

impl PgSettings {
    #[must_use]
    pub fn from_dsn(dsn: impl Into<String>) -> Self {
        Self {
            dsn: Some(dsn.into()),
            ..Self::default()
        }
    }

    /// Validate and convert into a driver configuration.
    ///
    /// # Errors
    /// Returns `SqlBlockError::ConfigError` if a required field is missing,
    /// the DSN does not parse, or the pool bounds are inconsistent.
    pub fn to_pg_config(&self) -> Result<tokio_postgres::Config, SqlBlockError> {
        if self.max_size == 0 {
            return Err(SqlBlockError::ConfigError(
                "max_size must be at least 1".to_string(),
            ));
        }
        if self.min_size > self.max_size {
            return Err(SqlBlockError::ConfigError(format!(
                "min_size ({}) exceeds max_size ({})",
                self.min_size, self.max_size
            )));
        }

        if let Some(dsn) = &self.dsn {
            return dsn
                .parse::<tokio_postgres::Config>()
                .map_err(|e| SqlBlockError::ConfigError(format!("invalid dsn: {e}")));
        }

        let Some(dbname) = &self.dbname else {
            return Err(SqlBlockError::ConfigError(
                "dbname is required".to_string(),
            ));
        };
        let Some(host) = &self.host else {
            return Err(SqlBlockError::ConfigError(
                "host is required".to_string(),
            ));
        };
        let Some(port) = self.port else {
            return Err(SqlBlockError::ConfigError(
                "port is required".to_string(),
            ));
        };
        let Some(user) = &self.user else {
            return Err(SqlBlockError::ConfigError(
                "user is required".to_string(),
            ));
        };
        let Some(password) = &self.password else {
            return Err(SqlBlockError::ConfigError(
                "password is required".to_string(),
            ));
        };

        let mut config = tokio_postgres::Config::new();
        config
            .host(host)
            .port(port)
            .dbname(dbname)
            .user(user)
            .password(password);
        Ok(config)
    }

    /// Build a bb8 pool sized by `min_size`/`max_size`.
    ///
    /// # Errors
    /// Returns `SqlBlockError::ConfigError` for invalid settings or
    /// `SqlBlockError::ConnectionError` if pool creation fails.
    pub async fn build_pool(&self) -> Result<Pool<PgManager>, SqlBlockError> {
        let manager = PgManager::new(self.to_pg_config()?);
        Pool::builder()
            .max_size(self.max_size)
            .min_idle(Some(self.min_size))
            .build(manager)
            .await
            .map_err(|e| SqlBlockError::ConnectionError(format!("postgres pool error: {e}")))
    }
}

/// A pooled client tagged with a process-local identity.
pub struct PgClient {
    id: u64,
    client: Client,
    cursors: AtomicU64,
}

impl PgClient {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Fresh cursor name, unique on this connection.
    pub(crate) fn next_cursor_name(&self) -> String {
        let n = self.cursors.fetch_add(1, Ordering::Relaxed);
        format!("sql_block_cursor_{n}")
    }
}

/// bb8 manager for Postgres clients.
pub struct PgManager {
    config: tokio_postgres::Config,
    next_id: AtomicU64,
}

impl PgManager {
    #[must_use]
    pub fn new(config: tokio_postgres::Config) -> Self {
        Self {
            config,
            next_id: AtomicU64::new(1),
        }
    }
}

impl ManageConnection for PgManager {
    type Connection = PgClient;
    type Error = tokio_postgres::Error;

    #[allow(clippy::manual_async_fn)]
    fn connect(&self) -> impl Future<Output = Result<Self::Connection, Self::Error>> + Send {
        let cfg = self.config.clone();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        async move {
            debug!(
                hosts = ?cfg.get_hosts(),
                db = ?cfg.get_dbname(),
                user = ?cfg.get_user(),
                connection = id,
                "postgres connect start"
            );
            let (client, connection) = cfg.connect(NoTls).await?;
            debug!(connection = id, "postgres connect established");
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    warn!(connection = id, error = %e, "postgres connection closed with error");
                }
            });
            Ok(PgClient {
                id,
                client,
                cursors: AtomicU64::new(1),
            })
        }
    }

    #[allow(clippy::manual_async_fn)]
    fn is_valid(
        &self,
        conn: &mut Self::Connection,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        async move { conn.client.simple_query("SELECT 1").await.map(|_| ()) }
    }

    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        conn.client.is_closed()
    }
}
