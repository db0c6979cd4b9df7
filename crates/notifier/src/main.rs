use std::sync::Arc;

use axion_common::config::AppConfig;
use axion_common::types::Channel;
use axion_common::{db, redis_pool};
use axion_notifier::channels::{
    ChannelRegistry, EmailHandler, HttpPushGateway, InAppHandler, PushHandler,
};
use axion_notifier::clock::SystemClock;
use axion_notifier::dispatcher::{Dispatcher, DispatcherConfig};
use axion_notifier::queue::{JobQueue, QueueKeys, RedisQueue};
use axion_notifier::store::PgNotificationStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "axion_notifier=info".into()),
        )
        .json()
        .init();

    tracing::info!("AxionSync notification worker starting...");

    let config = AppConfig::from_env()?;

    let pool = db::create_pool(config.require_database_url()?, config.db_max_connections).await?;
    let redis = redis_pool::create_redis_pool(&config.redis_url, config.redis_timeout_secs).await?;

    let clock = Arc::new(SystemClock);
    let keys = QueueKeys::new(&config.queue_key_prefix);
    let queue: Arc<dyn JobQueue> = Arc::new(RedisQueue::new(redis.clone(), keys.clone(), clock.clone()));
    let store = Arc::new(PgNotificationStore::new(pool));

    let mut channels = ChannelRegistry::new(Arc::new(InAppHandler::new(redis, keys, clock.clone())));

    match &config.resend_api_key {
        Some(api_key) => {
            let email = EmailHandler::new(api_key.clone(), config.email_from.clone(), store.clone())?;
            channels = channels.with_handler(Channel::Email, Arc::new(email));
        }
        None => tracing::warn!("RESEND_API_KEY not set, email notifications fall back to in-app"),
    }

    match &config.push_gateway_url {
        Some(url) => {
            let gateway = HttpPushGateway::new(url.clone(), config.push_gateway_token.clone())?;
            let push = PushHandler::new(Arc::new(gateway), store.clone());
            channels = channels.with_handler(Channel::Push, Arc::new(push));
        }
        None => tracing::warn!("PUSH_GATEWAY_URL not set, push notifications fall back to in-app"),
    }

    let dispatcher = Dispatcher::new(
        queue.clone(),
        store,
        channels,
        DispatcherConfig::from(&config),
        clock,
    );

    let shutdown = dispatcher.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received shutdown signal, finishing current job...");
            shutdown.cancel();
        }
    });

    let result = dispatcher.run().await;
    queue.close().await;

    if let Err(e) = result {
        tracing::error!(error = %e, "Notification worker exited with error");
        return Err(e.into());
    }

    tracing::info!("AxionSync notification worker stopped.");
    Ok(())
}
