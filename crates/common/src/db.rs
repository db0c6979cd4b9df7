use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Create a PostgreSQL connection pool for the durable notification store.
///
/// Pass `AppConfig::db_max_connections` for the user-configured pool size (default 20).
/// The worker only needs a handful of connections; the CRUD layer sizes its own pool.
pub async fn create_pool(database_url: &str, max_connections: u32) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
        .map_err(|e| anyhow::anyhow!("failed to connect to PostgreSQL: {}", e))?;

    tracing::info!(max_connections, "Connected to PostgreSQL");
    Ok(pool)
}
