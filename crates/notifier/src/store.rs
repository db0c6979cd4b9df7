//! Durable notification records and recipient lookups.
//!
//! The relational store is the source of truth for whether a notification is
//! still pending; the queue only carries scheduling state.

use async_trait::async_trait;
use sqlx::PgPool;

use axion_common::error::AppError;
use axion_common::types::{DeviceToken, TodoNotification};

/// Read/flag access to durable notification records.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// `None` when the record was deleted.
    async fn load(&self, notification_id: i64) -> Result<Option<TodoNotification>, AppError>;

    /// Flag the record as delivered. Idempotent.
    async fn mark_delivered(&self, notification_id: i64) -> Result<(), AppError>;
}

/// Where to reach a user on the out-of-app channels.
#[async_trait]
pub trait RecipientDirectory: Send + Sync {
    async fn owner_email(&self, user_id: i64) -> Result<Option<String>, AppError>;

    async fn active_device_tokens(&self, user_id: i64) -> Result<Vec<DeviceToken>, AppError>;

    /// Returns whether an active token was switched off.
    async fn deactivate_device_token(&self, device_token: &str) -> Result<bool, AppError>;
}

/// Postgres-backed implementation of both store traits.
#[derive(Clone)]
pub struct PgNotificationStore {
    pool: PgPool,
}

impl PgNotificationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PgNotificationStore {
    async fn load(&self, notification_id: i64) -> Result<Option<TodoNotification>, AppError> {
        let record: Option<TodoNotification> =
            sqlx::query_as("SELECT * FROM todo_notification WHERE id = $1")
                .bind(notification_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(record)
    }

    async fn mark_delivered(&self, notification_id: i64) -> Result<(), AppError> {
        sqlx::query("UPDATE todo_notification SET is_sent = true WHERE id = $1")
            .bind(notification_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl RecipientDirectory for PgNotificationStore {
    async fn owner_email(&self, user_id: i64) -> Result<Option<String>, AppError> {
        let email: Option<Option<String>> =
            sqlx::query_scalar(r#"SELECT email FROM "user" WHERE id = $1"#)
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(email.flatten().filter(|e| !e.trim().is_empty()))
    }

    async fn active_device_tokens(&self, user_id: i64) -> Result<Vec<DeviceToken>, AppError> {
        let tokens: Vec<DeviceToken> = sqlx::query_as(
            r#"
            SELECT * FROM user_device_token
            WHERE user_id = $1 AND is_active = true
            ORDER BY created_at
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(tokens)
    }

    async fn deactivate_device_token(&self, device_token: &str) -> Result<bool, AppError> {
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

        if result.rows_affected() > 0 {
            tracing::info!(device_token = %device_token, "Device token deactivated");
        }

        Ok(result.rows_affected() > 0)
    }
}
