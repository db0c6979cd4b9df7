//! Redis-backed notification queue.
//!
//! Sorted sets hold membership (member `notification:{id}`, score in epoch
//! milliseconds) and a plain string key holds each JSON payload. Every
//! transition that reads membership before writing runs as a Lua script so
//! it is atomic on the server. `retry` reads the payload first and the script
//! only writes it back if it is unchanged; the remaining writes go through `MULTI`
//! pipelines with the sorted-set write last.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use axion_common::error::AppError;
use axion_common::types::{DeadLetterEntry, NotificationJob, QueueStats};

use super::{JobLocation, JobQueue, QueueKeys, RetryOutcome, count_attempt, from_score, offset, score};
use crate::clock::Clock;

/// Move a member between two sets if, and only if, it is in the source set.
///
/// KEYS: source, destination, payload. ARGV: member, score, payload or ''.
const MOVE_SCRIPT: &str = r#"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then
  return 0
end
if ARGV[3] ~= '' then
  redis.call('SET', KEYS[3], ARGV[3])
end
redis.call('ZADD', KEYS[2], ARGV[2], ARGV[1])
return 1
"#;

/// Move a live member (scheduled or processing) into a destination set.
///
/// KEYS: scheduled, processing, destination, payload. ARGV: member, score, payload or ''.
const TRANSITION_SCRIPT: &str = r#"
local scheduled = redis.call('ZREM', KEYS[1], ARGV[1])
local processing = redis.call('ZREM', KEYS[2], ARGV[1])
if scheduled + processing == 0 then
  return 0
end
if ARGV[3] ~= '' then
  redis.call('SET', KEYS[4], ARGV[3])
end
redis.call('ZADD', KEYS[3], ARGV[2], ARGV[1])
return 1
"#;

/// Move a claimed member out of processing, rewriting its payload, provided
/// the stored payload is still the one the caller read.
///
/// KEYS: processing, destination, payload. ARGV: member, score, expected payload, new payload.
/// Returns 1 when moved, 0 when not in processing, -1 when the payload changed.
const RETRY_SCRIPT: &str = r#"
if not redis.call('ZSCORE', KEYS[1], ARGV[1]) then
  return 0
end
if redis.call('GET', KEYS[3]) ~= ARGV[3] then
  return -1
end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('SET', KEYS[3], ARGV[4])
redis.call('ZADD', KEYS[2], ARGV[2], ARGV[1])
return 1
"#;

/// Leave processing. The payload survives if the id was re-scheduled meanwhile.
///
/// KEYS: processing, scheduled, payload. ARGV: member.
const COMPLETE_SCRIPT: &str = r#"
local removed = redis.call('ZREM', KEYS[1], ARGV[1])
if removed == 1 and not redis.call('ZSCORE', KEYS[2], ARGV[1]) then
  redis.call('DEL', KEYS[3])
end
return removed
"#;

pub struct RedisQueue {
    conn: ConnectionManager,
    keys: QueueKeys,
    clock: Arc<dyn Clock>,
    closed: AtomicBool,
    move_script: Script,
    transition_script: Script,
    retry_script: Script,
    complete_script: Script,
}

impl RedisQueue {
    pub fn new(conn: ConnectionManager, keys: QueueKeys, clock: Arc<dyn Clock>) -> Self {
        Self {
            conn,
            keys,
            clock,
            closed: AtomicBool::new(false),
            move_script: Script::new(MOVE_SCRIPT),
            transition_script: Script::new(TRANSITION_SCRIPT),
            retry_script: Script::new(RETRY_SCRIPT),
            complete_script: Script::new(COMPLETE_SCRIPT),
        }
    }

    /// A handle on the shared connection, or an error once closed.
    fn connection(&self) -> Result<ConnectionManager, AppError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AppError::Internal("notification queue is closed".to_string()));
        }
        Ok(self.conn.clone())
    }

    async fn move_member(
        &self,
        conn: &mut ConnectionManager,
        from: &str,
        to: &str,
        notification_id: i64,
        at: DateTime<Utc>,
        payload: Option<&str>,
    ) -> Result<bool, AppError> {
        let moved: i64 = self
            .move_script
            .key(from)
            .key(to)
            .key(self.keys.payload(notification_id))
            .arg(QueueKeys::member(notification_id))
            .arg(score(at))
            .arg(payload.unwrap_or(""))
            .invoke_async(conn)
            .await?;
        Ok(moved == 1)
    }

    /// Move a live job into `destination`, optionally rewriting its payload.
    async fn transition(
        &self,
        conn: &mut ConnectionManager,
        destination: &str,
        notification_id: i64,
        at: DateTime<Utc>,
        payload: Option<&str>,
    ) -> Result<bool, AppError> {
        let moved: i64 = self
            .transition_script
            .key(&self.keys.scheduled)
            .key(&self.keys.processing)
            .key(destination)
            .key(self.keys.payload(notification_id))
            .arg(QueueKeys::member(notification_id))
            .arg(score(at))
            .arg(payload.unwrap_or(""))
            .invoke_async(conn)
            .await?;
        Ok(moved == 1)
    }

    /// Swap the payload of a claimed job and move it to `destination`.
    ///
    /// `false` when the id is no longer in processing or its payload was
    /// replaced since `expected` was read.
    async fn settle_claim(
        &self,
        conn: &mut ConnectionManager,
        destination: &str,
        notification_id: i64,
        at: DateTime<Utc>,
        expected: &str,
        payload: &str,
    ) -> Result<bool, AppError> {
        let moved: i64 = self
            .retry_script
            .key(&self.keys.processing)
            .key(destination)
            .key(self.keys.payload(notification_id))
            .arg(QueueKeys::member(notification_id))
            .arg(score(at))
            .arg(expected)
            .arg(payload)
            .invoke_async(conn)
            .await?;
        if moved < 0 {
            tracing::debug!(notification_id, "Payload replaced while in flight, leaving job alone");
        }
        Ok(moved == 1)
    }

    /// Fetch payloads for a list of members, preserving order.
    async fn payloads(
        &self,
        conn: &mut ConnectionManager,
        ids: &[i64],
    ) -> Result<Vec<Option<String>>, AppError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = ids.iter().map(|id| self.keys.payload(*id)).collect();
        let raw: Vec<Option<String>> = redis::cmd("MGET").arg(&keys).query_async(conn).await?;
        Ok(raw)
    }

    /// Deal with a scheduled member whose payload cannot be used.
    ///
    /// A member without payload is dropped; a malformed payload is parked in
    /// the dead-letter set untouched so an operator can inspect it.
    async fn quarantine(
        &self,
        conn: &mut ConnectionManager,
        member: &str,
        notification_id: Option<i64>,
        payload: Option<&str>,
        reason: &str,
    ) -> Result<(), AppError> {
        match (notification_id, payload) {
            (Some(id), Some(_)) => {
                self.transition(conn, &self.keys.dead_letter, id, self.clock.now(), None)
                    .await?;
                tracing::warn!(notification_id = id, reason, "Quarantined malformed job in dead letter");
            }
            _ => {
                let (): () = conn.zrem(&self.keys.scheduled, member).await?;
                tracing::warn!(member, reason, "Dropped scheduled member without usable payload");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl JobQueue for RedisQueue {
    async fn schedule(&self, job: &NotificationJob, due_at: DateTime<Utc>) -> Result<(), AppError> {
        let mut conn = self.connection()?;
        let member = QueueKeys::member(job.notification_id);
        let payload = job.to_json()?;

        let (): () = redis::pipe()
            .atomic()
            .set(self.keys.payload(job.notification_id), &payload)
            .ignore()
            .zrem(&self.keys.processing, &member)
            .ignore()
            .zrem(&self.keys.dead_letter, &member)
            .ignore()
            .zadd(&self.keys.scheduled, &member, score(due_at))
            .ignore()
            .query_async(&mut conn)
            .await?;

        tracing::debug!(
            notification_id = job.notification_id,
            channel = %job.channel,
            due_at = %due_at,
            "Job scheduled"
        );
        Ok(())
    }

    async fn cancel(&self, notification_id: i64) -> Result<bool, AppError> {
        let mut conn = self.connection()?;
        let member = QueueKeys::member(notification_id);

        let (scheduled, processing, dead, payload): (i64, i64, i64, i64) = redis::pipe()
            .atomic()
            .zrem(&self.keys.scheduled, &member)
            .zrem(&self.keys.processing, &member)
            .zrem(&self.keys.dead_letter, &member)
            .del(self.keys.payload(notification_id))
            .query_async(&mut conn)
            .await?;

        Ok(scheduled + processing + dead + payload > 0)
    }

    async fn due(&self, limit: usize) -> Result<Vec<NotificationJob>, AppError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.connection()?;

        let members: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&self.keys.scheduled)
            .arg("-inf")
            .arg(score(self.clock.now()))
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut conn)
            .await?;

        if members.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<Option<i64>> = members.iter().map(|m| QueueKeys::parse_member(m)).collect();
        let known: Vec<i64> = ids.iter().flatten().copied().collect();
        let mut payloads = self.payloads(&mut conn, &known).await?.into_iter();

        let mut jobs = Vec::with_capacity(members.len());
        for (member, id) in members.iter().zip(ids) {
            let Some(id) = id else {
                self.quarantine(&mut conn, member, None, None, "unparseable member")
                    .await?;
                continue;
            };
            let Some(raw) = payloads.next().flatten() else {
                self.quarantine(&mut conn, member, Some(id), None, "missing payload")
                    .await?;
                continue;
            };
            match NotificationJob::from_json(&raw) {
                Ok(job) if job.notification_id == id => jobs.push(job),
                Ok(_) => {
                    self.quarantine(&mut conn, member, Some(id), Some(&raw), "payload id mismatch")
                        .await?;
                }
                Err(e) => {
                    self.quarantine(&mut conn, member, Some(id), Some(&raw), &e.to_string())
                        .await?;
                }
            }
        }

        Ok(jobs)
    }

    async fn claim(&self, notification_id: i64) -> Result<bool, AppError> {
        let mut conn = self.connection()?;
        self.move_member(
            &mut conn,
            &self.keys.scheduled,
            &self.keys.processing,
            notification_id,
            self.clock.now(),
            None,
        )
        .await
    }

    async fn complete(&self, notification_id: i64) -> Result<bool, AppError> {
        let mut conn = self.connection()?;
        let removed: i64 = self
            .complete_script
            .key(&self.keys.processing)
            .key(&self.keys.scheduled)
            .key(self.keys.payload(notification_id))
            .arg(QueueKeys::member(notification_id))
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    async fn retry(&self, notification_id: i64, delay: Duration) -> Result<RetryOutcome, AppError> {
        let mut conn = self.connection()?;
        let raw: Option<String> = conn.get(self.keys.payload(notification_id)).await?;
        let Some(raw) = raw else {
            return Ok(RetryOutcome::NotLive);
        };

        let now = self.clock.now();
        let mut job = match NotificationJob::from_json(&raw) {
            Ok(job) => job,
            Err(e) => {
                tracing::warn!(notification_id, error = %e, "Cannot retry malformed job, dead-lettering");
                let moved = self
                    .settle_claim(&mut conn, &self.keys.dead_letter, notification_id, now, &raw, &raw)
                    .await?;
                return Ok(if moved { RetryOutcome::DeadLettered } else { RetryOutcome::NotLive });
            }
        };

        let exhausted = count_attempt(&mut job);
        let payload = job.to_json()?;

        if exhausted {
            let moved = self
                .settle_claim(&mut conn, &self.keys.dead_letter, notification_id, now, &raw, &payload)
                .await?;
            return Ok(if moved { RetryOutcome::DeadLettered } else { RetryOutcome::NotLive });
        }

        let due_at = offset(now, delay);
        let moved = self
            .settle_claim(&mut conn, &self.keys.scheduled, notification_id, due_at, &raw, &payload)
            .await?;
        if !moved {
            return Ok(RetryOutcome::NotLive);
        }

        Ok(RetryOutcome::Rescheduled {
            retry_count: job.retry_count,
            due_at,
        })
    }

    async fn dead_letter(&self, notification_id: i64) -> Result<bool, AppError> {
        let mut conn = self.connection()?;
        self.transition(&mut conn, &self.keys.dead_letter, notification_id, self.clock.now(), None)
            .await
    }

    async fn stats(&self) -> Result<QueueStats, AppError> {
        let mut conn = self.connection()?;
        let (scheduled, processing, dead_letter): (u64, u64, u64) = redis::pipe()
            .zcard(&self.keys.scheduled)
            .zcard(&self.keys.processing)
            .zcard(&self.keys.dead_letter)
            .query_async(&mut conn)
            .await?;

        Ok(QueueStats {
            scheduled,
            processing,
            dead_letter,
        })
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, AppError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.connection()?;

        let members: Vec<(String, f64)> = redis::cmd("ZRANGE")
            .arg(&self.keys.dead_letter)
            .arg(0)
            .arg(limit - 1)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await?;

        let parked: Vec<(i64, f64)> = members
            .iter()
            .filter_map(|(member, at)| QueueKeys::parse_member(member).map(|id| (id, *at)))
            .collect();
        let ids: Vec<i64> = parked.iter().map(|(id, _)| *id).collect();
        let payloads = self.payloads(&mut conn, &ids).await?;

        let mut entries = Vec::with_capacity(parked.len());
        for ((id, at), raw) in parked.into_iter().zip(payloads) {
            match raw.as_deref().map(NotificationJob::from_json) {
                Some(Ok(job)) => entries.push(DeadLetterEntry {
                    job,
                    dead_lettered_at: from_score(at),
                }),
                Some(Err(e)) => {
                    tracing::warn!(notification_id = id, error = %e, "Skipping malformed dead letter")
                }
                None => tracing::warn!(notification_id = id, "Dead letter without payload"),
            }
        }

        Ok(entries)
    }

    async fn requeue_dead_letter(&self, notification_id: i64) -> Result<bool, AppError> {
        let mut conn = self.connection()?;
        let raw: Option<String> = conn.get(self.keys.payload(notification_id)).await?;
        let Some(raw) = raw else {
            return Ok(false);
        };

        let mut job = NotificationJob::from_json(&raw)?;
        job.retry_count = 0;
        let payload = job.to_json()?;

        self.move_member(
            &mut conn,
            &self.keys.dead_letter,
            &self.keys.scheduled,
            notification_id,
            self.clock.now(),
            Some(&payload),
        )
        .await
    }

    async fn requeue_stale(&self, older_than: DateTime<Utc>, limit: usize) -> Result<usize, AppError> {
        if limit == 0 {
            return Ok(0);
        }
        let mut conn = self.connection()?;

        let members: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&self.keys.processing)
            .arg("-inf")
            .arg(score(older_than))
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut conn)
            .await?;

        let now = self.clock.now();
        let mut requeued = 0;
        for id in members.iter().filter_map(|m| QueueKeys::parse_member(m)) {
            if self
                .move_member(&mut conn, &self.keys.processing, &self.keys.scheduled, id, now, None)
                .await?
            {
                tracing::info!(notification_id = id, "Requeued stale processing job");
                requeued += 1;
            }
        }

        Ok(requeued)
    }

    async fn location(&self, notification_id: i64) -> Result<Option<JobLocation>, AppError> {
        let mut conn = self.connection()?;
        let member = QueueKeys::member(notification_id);

        let (scheduled, processing, dead): (Option<f64>, Option<f64>, Option<f64>) = redis::pipe()
            .zscore(&self.keys.scheduled, &member)
            .zscore(&self.keys.processing, &member)
            .zscore(&self.keys.dead_letter, &member)
            .query_async(&mut conn)
            .await?;

        Ok(match (scheduled, processing, dead) {
            (Some(_), _, _) => Some(JobLocation::Scheduled),
            (_, Some(_), _) => Some(JobLocation::Processing),
            (_, _, Some(_)) => Some(JobLocation::DeadLetter),
            _ => None,
        })
    }

    async fn ping(&self) -> Result<(), AppError> {
        let mut conn = self.connection()?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::info!("Notification queue closed");
        }
    }
}
