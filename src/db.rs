use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Pool, Postgres};

/// Shared Postgres connection pool.
pub type DbPool = Pool<Postgres>;

/// Connect to Postgres with the configured pool size.
///
/// Connections are created lazily; the pool is the main throughput knob for
/// the proxy, since every request path acquires a connection for the key
/// lookup and (on miss) the cache write.
pub async fn connect(database_url: &str, max_conns: u32) -> Result<DbPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_conns)
        .connect(database_url)
        .await
        .context("failed to connect to Postgres")?;
    tracing::info!(max_conns, "Postgres pool initialised");
    Ok(pool)
}

/// Apply embedded migrations. Each file under `migrations/` runs once,
/// tracked in `_sqlx_migrations`.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("failed to run database migrations")?;
    Ok(())
}
