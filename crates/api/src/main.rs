//! AxionSync operator API server binary entrypoint.

use std::net::SocketAddr;
use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use axion_common::config::AppConfig;
use axion_common::redis_pool::create_redis_pool;
use axion_notifier::clock::SystemClock;
use axion_notifier::queue::{JobQueue, QueueKeys, RedisQueue};

use axion_api::routes::create_router;
use axion_api::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("axion_api=debug,axion_notifier=info,tower_http=debug")
        }))
        .init();

    tracing::info!("Starting AxionSync operator API...");

    let config = AppConfig::from_env()?;

    let redis = create_redis_pool(&config.redis_url, config.redis_timeout_secs).await?;
    let queue: Arc<dyn JobQueue> = Arc::new(RedisQueue::new(
        redis,
        QueueKeys::new(&config.queue_key_prefix),
        Arc::new(SystemClock),
    ));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.api_port));
    let state = AppState::new(queue.clone(), config);

    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    tracing::info!("API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Received shutdown signal, stopping API server...");
        })
        .await?;

    queue.close().await;
    Ok(())
}
