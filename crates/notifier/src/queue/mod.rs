//! Delayed notification queue.
//!
//! Three time-ordered sets hold every live or parked job:
//! - **scheduled**: score = next due time
//! - **processing**: score = claim time
//! - **dead_letter**: score = time the job was given up on
//!
//! A notification id is a member of at most one of them at any instant. The
//! job payload lives beside the sets and is deleted on completion or
//! cancellation, but retained for dead-lettered jobs.

pub mod memory;
pub mod redis_queue;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use axion_common::error::AppError;
use axion_common::types::{DeadLetterEntry, NotificationJob, QueueStats};

pub use memory::MemoryQueue;
pub use redis_queue::RedisQueue;

/// Result of asking the queue to retry a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Back in the scheduled set with a new score.
    Rescheduled {
        retry_count: u32,
        due_at: DateTime<Utc>,
    },
    /// The retry budget is spent; the job is parked in the dead-letter set.
    DeadLettered,
    /// Nothing live to retry: cancelled, completed, or already dead-lettered.
    NotLive,
}

/// Which set a notification id currently belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobLocation {
    Scheduled,
    Processing,
    DeadLetter,
}

/// Contract shared by the Redis-backed queue and the in-memory queue.
///
/// All mutation is scoped to a single notification id; operations on
/// different ids never contend.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Insert or replace the job for `job.notification_id`, due at `due_at`.
    ///
    /// Any previous membership of the id (processing or dead-letter) is
    /// dropped so the id ends up in the scheduled set only.
    async fn schedule(&self, job: &NotificationJob, due_at: DateTime<Utc>) -> Result<(), AppError>;

    /// Remove the id from every set and delete its payload.
    ///
    /// Returns whether anything was removed. Unknown ids are a no-op.
    async fn cancel(&self, notification_id: i64) -> Result<bool, AppError>;

    /// Up to `limit` jobs whose score is at or before now, earliest first.
    ///
    /// Read-only for well-formed jobs: they stay scheduled until claimed or
    /// cancelled.
    async fn due(&self, limit: usize) -> Result<Vec<NotificationJob>, AppError>;

    /// Atomically move the id from scheduled to processing.
    ///
    /// Returns `false` if the id was not scheduled (lost a race, cancelled).
    async fn claim(&self, notification_id: i64) -> Result<bool, AppError>;

    /// Drop the id from processing and delete its payload.
    async fn complete(&self, notification_id: i64) -> Result<bool, AppError>;

    /// Count a failed attempt and either reschedule after `delay` or
    /// dead-letter once `max_retries` is reached.
    async fn retry(&self, notification_id: i64, delay: Duration) -> Result<RetryOutcome, AppError>;

    /// Park a live job in the dead-letter set, keeping its payload.
    async fn dead_letter(&self, notification_id: i64) -> Result<bool, AppError>;

    async fn stats(&self) -> Result<QueueStats, AppError>;

    /// Oldest dead-lettered jobs first.
    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, AppError>;

    /// Move a dead-lettered job back to scheduled, due now, with a fresh
    /// retry budget.
    async fn requeue_dead_letter(&self, notification_id: i64) -> Result<bool, AppError>;

    /// Move processing entries claimed at or before `older_than` back to
    /// scheduled, due now. Returns how many moved.
    async fn requeue_stale(&self, older_than: DateTime<Utc>, limit: usize) -> Result<usize, AppError>;

    async fn location(&self, notification_id: i64) -> Result<Option<JobLocation>, AppError>;

    async fn ping(&self) -> Result<(), AppError>;

    /// Tear down the queue. Every later call fails.
    async fn close(&self);
}

/// Redis key layout for one queue namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    prefix: String,
    pub scheduled: String,
    pub processing: String,
    pub dead_letter: String,
}

impl QueueKeys {
    pub fn new(prefix: &str) -> Self {
        let prefix = prefix.trim_end_matches(':').to_string();
        Self {
            scheduled: format!("{}:scheduled", prefix),
            processing: format!("{}:processing", prefix),
            dead_letter: format!("{}:dead_letter", prefix),
            prefix,
        }
    }

    /// Set member for a notification id.
    pub fn member(notification_id: i64) -> String {
        format!("notification:{}", notification_id)
    }

    pub fn parse_member(member: &str) -> Option<i64> {
        member.strip_prefix("notification:")?.parse().ok()
    }

    /// Key holding the JSON payload for a notification id.
    pub fn payload(&self, notification_id: i64) -> String {
        format!("{}:job:{}", self.prefix, Self::member(notification_id))
    }

    /// Per-user in-app inbox list.
    pub fn inbox(&self, user_id: i64) -> String {
        format!("{}:inbox:{}", self.prefix, user_id)
    }
}

impl Default for QueueKeys {
    fn default() -> Self {
        Self::new("axionsync:notifications")
    }
}

/// Sorted-set score for a point in time (epoch milliseconds).
pub(crate) fn score(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_score(score: f64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(score as i64).unwrap_or_default()
}

/// `now + delay`, saturating at the latest representable instant.
pub(crate) fn offset(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `now - delay`, saturating at the earliest representable instant.
pub(crate) fn offset_back(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Bump the retry counter, clamped to the ceiling.
///
/// Returns `true` when the job has reached `max_retries` and must be
/// dead-lettered instead of rescheduled.
pub(crate) fn count_attempt(job: &mut NotificationJob) -> bool {
    job.retry_count = job.retry_count.saturating_add(1).min(job.max_retries);
    job.retry_count >= job.max_retries
}

#[cfg(test)]
mod tests {
    use super::*;
    use axion_common::types::Channel;

    #[test]
    fn test_keys_layout() {
        let keys = QueueKeys::new("axionsync:notifications:");
        assert_eq!(keys.scheduled, "axionsync:notifications:scheduled");
        assert_eq!(keys.processing, "axionsync:notifications:processing");
        assert_eq!(keys.dead_letter, "axionsync:notifications:dead_letter");
        assert_eq!(keys.payload(9), "axionsync:notifications:job:notification:9");
        assert_eq!(keys.inbox(4), "axionsync:notifications:inbox:4");
    }

    #[test]
    fn test_member_round_trip() {
        assert_eq!(QueueKeys::parse_member(&QueueKeys::member(42)), Some(42));
        assert_eq!(QueueKeys::parse_member("job:42"), None);
        assert_eq!(QueueKeys::parse_member("notification:abc"), None);
    }

    #[test]
    fn test_offset_saturates() {
        let now = Utc::now();
        assert_eq!(offset(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
        assert_eq!(offset(now, Duration::from_secs(2)), now + chrono::Duration::seconds(2));
        assert_eq!(offset_back(now, Duration::MAX), DateTime::<Utc>::MIN_UTC);
        assert_eq!(offset_back(now, Duration::from_secs(2)), now - chrono::Duration::seconds(2));
    }

    #[test]
    fn test_count_attempt_clamps_at_ceiling() {
        let mut job = NotificationJob::new(1, 1, 1, Channel::InApp, None, Utc::now()).with_max_retries(2);
        assert!(!count_attempt(&mut job));
        assert_eq!(job.retry_count, 1);
        assert!(count_attempt(&mut job));
        assert_eq!(job.retry_count, 2);
        assert!(count_attempt(&mut job));
        assert_eq!(job.retry_count, 2);

        let mut zero = NotificationJob::new(2, 1, 1, Channel::InApp, None, Utc::now()).with_max_retries(0);
        assert!(count_attempt(&mut zero));
        assert_eq!(zero.retry_count, 0);
    }
}
