//! Notification service: CRUD for todo reminders and push device tokens.
//!
//! Writes go to Postgres first; the matching queue change is made afterwards
//! through [`NotificationScheduler`] and never fails the call.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::PgPool;

use axion_common::error::AppError;
use axion_common::types::{Channel, DevicePlatform, DeviceToken, TodoNotification};
use axion_notifier::scheduler::NotificationScheduler;

/// Longest custom message accepted.
pub const MAX_MESSAGE_LEN: usize = 500;

#[derive(Debug, Clone, Deserialize)]
pub struct CreateNotificationParams {
    pub todo_id: i64,
    pub notify_time: DateTime<Utc>,
    #[serde(default = "default_channel")]
    pub channel: Channel,
    pub message: Option<String>,
}

fn default_channel() -> Channel {
    Channel::InApp
}

/// Fields left as `None` keep their stored value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateNotificationParams {
    pub notify_time: Option<DateTime<Utc>>,
    pub channel: Option<Channel>,
    pub message: Option<String>,
}

#[derive(Clone)]
pub struct NotificationService {
    pool: PgPool,
    scheduler: NotificationScheduler,
}

impl NotificationService {
    pub fn new(pool: PgPool, scheduler: NotificationScheduler) -> Self {
        Self { pool, scheduler }
    }

    /// Create a reminder for a todo and queue it for `notify_time`.
    pub async fn create(
        &self,
        user_id: i64,
        params: &CreateNotificationParams,
    ) -> Result<TodoNotification, AppError> {
        validate_notify_time(params.notify_time, Utc::now())?;
        validate_message(params.message.as_deref())?;

        let notification: TodoNotification = sqlx::query_as(
            r#"
            INSERT INTO todo_notification (todo_id, user_id, notify_time, channel, message)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(params.todo_id)
        .bind(user_id)
        .bind(params.notify_time)
        .bind(params.channel)
        .bind(&params.message)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(
            notification_id = notification.id,
            user_id,
            channel = %notification.channel,
            notify_time = %notification.notify_time,
            "Notification created"
        );

        self.scheduler.schedule_record(&notification).await;
        Ok(notification)
    }

    /// Fetch a notification owned by `user_id`.
    pub async fn get(&self, user_id: i64, notification_id: i64) -> Result<TodoNotification, AppError> {
        let notification: TodoNotification =
            sqlx::query_as("SELECT * FROM todo_notification WHERE id = $1")
                .bind(notification_id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| {
                    AppError::NotFound(format!("Notification {} not found", notification_id))
                })?;

        if notification.user_id != user_id {
            return Err(AppError::Auth(
                "Not authorized to access this notification".to_string(),
            ));
        }

        Ok(notification)
    }

    /// Upcoming first. Delivered reminders only when `include_sent`.
    pub async fn list_by_user(
        &self,
        user_id: i64,
        include_sent: bool,
    ) -> Result<Vec<TodoNotification>, AppError> {
        let notifications: Vec<TodoNotification> = sqlx::query_as(
            r#"
            SELECT * FROM todo_notification
            WHERE user_id = $1 AND ($2 OR is_sent = false)
            ORDER BY notify_time ASC
            "#,
        )
        .bind(user_id)
        .bind(include_sent)
        .fetch_all(&self.pool)
        .await?;

        Ok(notifications)
    }

    /// Edit a pending reminder and replace its queued job.
    pub async fn update(
        &self,
        user_id: i64,
        notification_id: i64,
        params: &UpdateNotificationParams,
    ) -> Result<TodoNotification, AppError> {
        let existing = self.get(user_id, notification_id).await?;
        if existing.is_sent {
            return Err(AppError::Validation(
                "Cannot update a notification that has already been sent".to_string(),
            ));
        }
        if let Some(notify_time) = params.notify_time {
            validate_notify_time(notify_time, Utc::now())?;
        }
        validate_message(params.message.as_deref())?;

        let updated: TodoNotification = sqlx::query_as(
            r#"
            UPDATE todo_notification
            SET notify_time = COALESCE($2, notify_time),
                channel = COALESCE($3, channel),
                message = COALESCE($4, message)
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(notification_id)
        .bind(params.notify_time)
        .bind(params.channel)
        .bind(&params.message)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(notification_id, user_id, "Notification updated");

        // The payload carries channel and message too, so any change needs a new job.
        self.scheduler.reschedule(&updated).await;
        Ok(updated)
    }

    pub async fn delete(&self, user_id: i64, notification_id: i64) -> Result<(), AppError> {
        self.get(user_id, notification_id).await?;

        sqlx::query("DELETE FROM todo_notification WHERE id = $1")
            .bind(notification_id)
            .execute(&self.pool)
            .await?;

        tracing::info!(notification_id, user_id, "Notification deleted");

        self.scheduler.cancel(notification_id).await;
        Ok(())
    }

    /// Register a push device, taking it over if another user had it.
    pub async fn register_device_token(
        &self,
        user_id: i64,
        device_token: &str,
        platform: DevicePlatform,
    ) -> Result<DeviceToken, AppError> {
        let device_token = device_token.trim();
        if device_token.is_empty() {
            return Err(AppError::Validation("device_token must not be empty".to_string()));
        }

        let token: DeviceToken = sqlx::query_as(
            r#"
            INSERT INTO user_device_token (user_id, device_token, platform, is_active)
            VALUES ($1, $2, $3, true)
            ON CONFLICT (device_token) DO UPDATE
            SET user_id = EXCLUDED.user_id,
                platform = EXCLUDED.platform,
                is_active = true,
                updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(device_token)
        .bind(platform)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(user_id, platform = %platform, "Device token registered");
        Ok(token)
    }

    pub async fn list_device_tokens(
        &self,
        user_id: i64,
        active_only: bool,
    ) -> Result<Vec<DeviceToken>, AppError> {
        let tokens: Vec<DeviceToken> = sqlx::query_as(
            r#"
            SELECT * FROM user_device_token
            WHERE user_id = $1 AND (NOT $2 OR is_active = true)
            ORDER BY created_at DESC
            "#,
        )
        .bind(user_id)
        .bind(active_only)
        .fetch_all(&self.pool)
        .await?;

        Ok(tokens)
    }

    /// Returns `false` when the token was unknown or already inactive.
    pub async fn deactivate_device_token(&self, device_token: &str) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE user_device_token
            SET is_active = false, updated_at = NOW()
            WHERE device_token = $1 AND is_active = true
            "#,
        )
        .bind(device_token)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

fn validate_notify_time(notify_time: DateTime<Utc>, now: DateTime<Utc>) -> Result<(), AppError> {
    if notify_time <= now {
        return Err(AppError::Validation("notify_time must be in the future".to_string()));
    }
    Ok(())
}

fn validate_message(message: Option<&str>) -> Result<(), AppError> {
    match message {
        Some(m) if m.chars().count() > MAX_MESSAGE_LEN => Err(AppError::Validation(format!(
            "message must be at most {} characters",
            MAX_MESSAGE_LEN
        ))),
        _ => Ok(()),
    }
}
