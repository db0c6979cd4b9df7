//! Scheduling boundary used by the CRUD layer.
//!
//! Every call is fire-and-forget: a queue failure is logged as a warning and
//! reported as `false`, never raised. The durable record stays the source of
//! truth.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use axion_common::config::AppConfig;
use axion_common::types::{Channel, DEFAULT_MAX_RETRIES, NotificationJob, TodoNotification};

use crate::queue::JobQueue;

#[derive(Clone)]
pub struct NotificationScheduler {
    queue: Arc<dyn JobQueue>,
    max_retries: u32,
}

impl NotificationScheduler {
    pub fn new(queue: Arc<dyn JobQueue>) -> Self {
        Self {
            queue,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Jobs get the `WORKER_MAX_RETRIES` ceiling from the config.
    pub fn from_config(queue: Arc<dyn JobQueue>, config: &AppConfig) -> Self {
        Self::new(queue).with_max_retries(config.worker_max_retries)
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    /// Queue delivery at `due_at`. A time in the past is delivered on the
    /// next poll.
    pub async fn schedule(
        &self,
        notification_id: i64,
        todo_id: i64,
        owner_id: i64,
        channel: Channel,
        message: Option<String>,
        due_at: DateTime<Utc>,
    ) -> bool {
        let job = NotificationJob::new(notification_id, todo_id, owner_id, channel, message, due_at)
            .with_max_retries(self.max_retries);
        self.enqueue(&job, due_at).await
    }

    pub async fn schedule_record(&self, record: &TodoNotification) -> bool {
        let job = NotificationJob::from_record(record).with_max_retries(self.max_retries);
        self.enqueue(&job, record.notify_time).await
    }

    /// Drop any queued job for the id. `false` when nothing was queued or
    /// the queue failed.
    pub async fn cancel(&self, notification_id: i64) -> bool {
        match self.queue.cancel(notification_id).await {
            Ok(removed) => {
                tracing::debug!(notification_id, removed, "Notification job cancelled");
                removed
            }
            Err(e) => {
                tracing::warn!(notification_id, error = %e, "Failed to cancel notification job");
                false
            }
        }
    }

    /// Replace the queued job with one built from the current record.
    pub async fn reschedule(&self, record: &TodoNotification) -> bool {
        self.cancel(record.id).await;
        self.schedule_record(record).await
    }

    async fn enqueue(&self, job: &NotificationJob, due_at: DateTime<Utc>) -> bool {
        match self.queue.schedule(job, due_at).await {
            Ok(()) => {
                tracing::info!(
                    notification_id = job.notification_id,
                    channel = %job.channel,
                    due_at = %due_at,
                    "Notification job scheduled"
                );
                true
            }
            Err(e) => {
                tracing::warn!(
                    notification_id = job.notification_id,
                    error = %e,
                    "Failed to schedule notification job"
                );
                false
            }
        }
    }
}
