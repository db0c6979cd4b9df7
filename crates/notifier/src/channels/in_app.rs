//! In-app delivery: append to the owner's inbox list in Redis.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};

use axion_common::error::AppError;
use axion_common::types::{NotificationJob, TodoNotification};

use super::ChannelHandler;
use crate::clock::Clock;
use crate::queue::QueueKeys;

/// Entries kept per inbox; older ones are trimmed.
pub const INBOX_CAPACITY: isize = 100;

/// One inbox entry as the app reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboxEntry {
    pub notification_id: i64,
    pub todo_id: i64,
    pub message: String,
    pub delivered_at: DateTime<Utc>,
}

pub struct InAppHandler {
    conn: ConnectionManager,
    keys: QueueKeys,
    clock: Arc<dyn Clock>,
}

impl InAppHandler {
    pub fn new(conn: ConnectionManager, keys: QueueKeys, clock: Arc<dyn Clock>) -> Self {
        Self { conn, keys, clock }
    }
}

#[async_trait]
impl ChannelHandler for InAppHandler {
    async fn deliver(&self, record: &TodoNotification, job: &NotificationJob) -> Result<bool, AppError> {
        let entry = InboxEntry {
            notification_id: record.id,
            todo_id: record.todo_id,
            message: job.display_message().to_string(),
            delivered_at: self.clock.now(),
        };
        let key = self.keys.inbox(record.user_id);

        let mut conn = self.conn.clone();
        let (): () = redis::pipe()
            .atomic()
            .lpush(&key, serde_json::to_string(&entry)?)
            .ignore()
            .ltrim(&key, 0, INBOX_CAPACITY - 1)
            .ignore()
            .query_async(&mut conn)
            .await?;

        tracing::debug!(
            notification_id = record.id,
            user_id = record.user_id,
            "In-app notification stored"
        );

        Ok(true)
    }
}
