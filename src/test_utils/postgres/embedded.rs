use postgresql_embedded::PostgreSQL;
use tokio_postgres::NoTls;
use tracing::debug;

use super::super::SHARED_RUNTIME;
use crate::postgres::PgSettings;

/// Represents a running embedded `PostgreSQL` instance.
pub struct EmbeddedPostgres {
    pub postgresql: PostgreSQL,
    pub port: u16,
    pub database_url: String,
    /// Settings that reach the freshly created database
    pub settings: PgSettings,
}

/// Set up an embedded `PostgreSQL` instance with a database named `dbname`.
///
/// The returned settings use small pool bounds (`min_size` 1, `max_size` 4)
/// so tests do not hold ten idle connections each.
///
/// # Errors
/// Returns an error if the embedded server cannot be set up or started, the
/// database cannot be created, or the post-start connectivity check fails.
pub fn setup_postgres_embedded(
    dbname: &str,
) -> Result<EmbeddedPostgres, Box<dyn std::error::Error>> {
    SHARED_RUNTIME.block_on(async {
        let mut postgresql = PostgreSQL::default();

        // bundled binaries, so no download
        postgresql.setup().await?;
        postgresql.start().await?;

        let port = postgresql.settings().port;
        let host = postgresql.settings().host.clone();
        let user = postgresql.settings().username.clone();
        let password = postgresql.settings().password.clone();

        postgresql.create_database(dbname).await?;

        let database_url = format!("postgres://{user}:{password}@{host}:{port}/{dbname}");
        debug!(port, %database_url, "embedded postgres started");

        let settings = PgSettings {
            host: Some(host),
            port: Some(port),
            dbname: Some(dbname.to_string()),
            user: Some(user),
            password: Some(password),
            min_size: 1,
            max_size: 4,
            ..PgSettings::default()
        };

        // Quick connection test
        let (client, connection) = settings.to_pg_config()?.connect(NoTls).await?;
        let handle = tokio::spawn(connection);
        client.simple_query("SELECT 1").await?;
        drop(client);
        let _ = handle.await;

        Ok(EmbeddedPostgres {
            postgresql,
            port,
            database_url,
            settings,
        })
    })
}

/// Stop a previously started embedded `PostgreSQL` instance.
pub fn stop_postgres_embedded(postgres: EmbeddedPostgres) {
    let EmbeddedPostgres { postgresql, .. } = postgres;
    SHARED_RUNTIME.block_on(async move {
        let _ = postgresql.stop().await;
    });
}
