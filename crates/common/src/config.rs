use serde::Deserialize;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string. Only the worker and the CRUD layer need it.
    pub database_url: Option<String>,

    /// Redis connection string
    pub redis_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Connect and response timeout for Redis in seconds (default: 5)
    pub redis_timeout_secs: u64,

    /// Prefix shared by every queue key in Redis
    pub queue_key_prefix: String,

    /// Seconds between dispatcher polls (default: 10)
    pub worker_poll_interval_secs: u64,

    /// Maximum jobs fetched per poll (default: 100)
    pub worker_batch_size: usize,

    /// Base delay for retry backoff in seconds (default: 60)
    pub worker_retry_delay_secs: u64,

    /// Delivery attempts before a job is dead-lettered (default: 3)
    pub worker_max_retries: u32,

    /// Upper bound for a single backoff delay. Unset means uncapped.
    pub worker_max_retry_delay_secs: Option<u64>,

    /// Processing entries older than this are requeued each poll. Unset disables the sweep.
    pub worker_stale_after_secs: Option<u64>,

    /// Port the operator API listens on (default: 3000)
    pub api_port: u16,

    /// Resend API key for email delivery
    pub resend_api_key: Option<String>,

    /// Email sender address
    pub email_from: String,

    /// Push gateway endpoint
    pub push_gateway_url: Option<String>,

    /// Bearer token sent to the push gateway
    pub push_gateway_token: Option<String>,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: parse_optional_var("DATABASE_URL")?,
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            db_max_connections: parse_var("DB_MAX_CONNECTIONS", "20")?,
            redis_timeout_secs: parse_var("REDIS_TIMEOUT_SECS", "5")?,
            queue_key_prefix: std::env::var("QUEUE_KEY_PREFIX")
                .unwrap_or_else(|_| "axionsync:notifications".to_string()),
            worker_poll_interval_secs: parse_var("WORKER_POLL_INTERVAL", "10")?,
            worker_batch_size: parse_var("WORKER_BATCH_SIZE", "100")?,
            worker_retry_delay_secs: parse_var("WORKER_RETRY_DELAY", "60")?,
            worker_max_retries: parse_var("WORKER_MAX_RETRIES", "3")?,
            worker_max_retry_delay_secs: parse_optional_var("WORKER_MAX_RETRY_DELAY")?,
            worker_stale_after_secs: parse_optional_var("WORKER_STALE_AFTER")?,
            api_port: parse_var("API_PORT", "3000")?,
            resend_api_key: std::env::var("RESEND_API_KEY").ok(),
            email_from: std::env::var("EMAIL_FROM")
                .unwrap_or_else(|_| "AxionSync <noreply@axionsync.app>".to_string()),
            push_gateway_url: std::env::var("PUSH_GATEWAY_URL").ok(),
            push_gateway_token: std::env::var("PUSH_GATEWAY_TOKEN").ok(),
        })
    }

    /// The PostgreSQL connection string, for processes that open the pool.
    pub fn require_database_url(&self) -> anyhow::Result<&str> {
        self.database_url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("DATABASE_URL environment variable is required"))
    }
}

/// The values `from_env` falls back to when nothing is set.
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            redis_url: "redis://localhost:6379".to_string(),
            db_max_connections: 20,
            redis_timeout_secs: 5,
            queue_key_prefix: "axionsync:notifications".to_string(),
            worker_poll_interval_secs: 10,
            worker_batch_size: 100,
            worker_retry_delay_secs: 60,
            worker_max_retries: 3,
            worker_max_retry_delay_secs: None,
            worker_stale_after_secs: None,
            api_port: 3000,
            resend_api_key: None,
            email_from: "AxionSync <noreply@axionsync.app>".to_string(),
            push_gateway_url: None,
            push_gateway_token: None,
        }
    }
}

/// Read `name` from the environment, falling back to `default`, and parse it.
fn parse_var<T: std::str::FromStr>(name: &str, default: &str) -> anyhow::Result<T> {
    std::env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| anyhow::anyhow!("{} must be a valid {}", name, std::any::type_name::<T>()))
}

/// Like [`parse_var`] but an unset or empty variable yields `None`.
fn parse_optional_var<T: std::str::FromStr>(name: &str) -> anyhow::Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow::anyhow!("{} must be a valid {}", name, std::any::type_name::<T>())),
        _ => Ok(None),
    }
}
