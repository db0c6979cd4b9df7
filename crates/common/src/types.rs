use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Message used when a notification carries no custom text.
pub const DEFAULT_REMINDER_MESSAGE: &str = "Todo reminder";

/// Delivery attempts allowed before a job is dead-lettered.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Notification delivery channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum Channel {
    InApp,
    Email,
    Push,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::InApp, Channel::Email, Channel::Push];
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::InApp => write!(f, "in_app"),
            Channel::Email => write!(f, "email"),
            Channel::Push => write!(f, "push"),
        }
    }
}

impl std::str::FromStr for Channel {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_app" => Ok(Channel::InApp),
            "email" => Ok(Channel::Email),
            "push" => Ok(Channel::Push),
            other => Err(AppError::Validation(format!(
                "Invalid channel '{}'. Must be one of: in_app, email, push",
                other
            ))),
        }
    }
}

/// Platform a push device token belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum DevicePlatform {
    Ios,
    Android,
    Web,
}

impl std::fmt::Display for DevicePlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DevicePlatform::Ios => write!(f, "ios"),
            DevicePlatform::Android => write!(f, "android"),
            DevicePlatform::Web => write!(f, "web"),
        }
    }
}

/// A todo reminder as persisted in the relational store.
///
/// This is the source of truth for whether a notification is still pending.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TodoNotification {
    pub id: i64,
    pub todo_id: i64,
    pub user_id: i64,
    pub notify_time: DateTime<Utc>,
    pub is_sent: bool,
    pub channel: Channel,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A registered push device.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeviceToken {
    pub id: i64,
    pub user_id: i64,
    pub device_token: String,
    pub platform: DevicePlatform,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

/// Queue-resident job for a single notification.
///
/// Serialized as JSON into the payload key; the queue score (next due time)
/// is kept separately and may drift from `scheduled_at` after retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationJob {
    pub notification_id: i64,
    pub todo_id: i64,
    #[serde(alias = "user_id")]
    pub owner_id: i64,
    pub channel: Channel,
    #[serde(default)]
    pub message: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
}

impl NotificationJob {
    pub fn new(
        notification_id: i64,
        todo_id: i64,
        owner_id: i64,
        channel: Channel,
        message: Option<String>,
        scheduled_at: DateTime<Utc>,
    ) -> Self {
        Self {
            notification_id,
            todo_id,
            owner_id,
            channel,
            message,
            scheduled_at,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            created_at: Utc::now(),
        }
    }

    /// Build the job for a durable record, due at its `notify_time`.
    pub fn from_record(record: &TodoNotification) -> Self {
        Self::new(
            record.id,
            record.todo_id,
            record.user_id,
            record.channel,
            record.message.clone(),
            record.notify_time,
        )
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Parse and validate a stored payload.
    pub fn from_json(raw: &str) -> Result<Self, AppError> {
        let job: NotificationJob = serde_json::from_str(raw)
            .map_err(|e| AppError::Decode(format!("malformed notification job: {}", e)))?;

        if job.retry_count > job.max_retries {
            return Err(AppError::Decode(format!(
                "notification job {} has retry_count {} above max_retries {}",
                job.notification_id, job.retry_count, job.max_retries
            )));
        }

        Ok(job)
    }

    pub fn to_json(&self) -> Result<String, AppError> {
        Ok(serde_json::to_string(self)?)
    }

    /// The text to deliver: the custom message, or the generic reminder.
    pub fn display_message(&self) -> &str {
        self.message
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or(DEFAULT_REMINDER_MESSAGE)
    }
}

/// Member counts of the three queue sets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub scheduled: u64,
    pub processing: u64,
    pub dead_letter: u64,
}

/// A job parked in the dead-letter set, with the time it got there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub job: NotificationJob,
    pub dead_lettered_at: DateTime<Utc>,
}
