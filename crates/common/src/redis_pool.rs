use std::time::Duration;

use redis::Client;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};

/// Create a Redis connection manager for the notification queue.
///
/// The manager reconnects on its own after transient failures; `timeout_secs`
/// bounds both connecting and each individual response.
pub async fn create_redis_pool(redis_url: &str, timeout_secs: u64) -> anyhow::Result<ConnectionManager> {
    let client = Client::open(redis_url)?;
    let timeout = Duration::from_secs(timeout_secs);
    let config = ConnectionManagerConfig::new()
        .set_connection_timeout(timeout)
        .set_response_timeout(timeout);
    let manager = ConnectionManager::new_with_config(client, config).await?;

    tracing::info!(timeout_secs, "Connected to Redis");
    Ok(manager)
}
