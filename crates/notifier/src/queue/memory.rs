//! In-process queue with the same semantics as [`RedisQueue`](super::RedisQueue).
//!
//! Useful for tests and single-process development; nothing survives a restart.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use axion_common::error::AppError;
use axion_common::types::{DeadLetterEntry, NotificationJob, QueueStats};

use super::{JobLocation, JobQueue, RetryOutcome, count_attempt, offset, score};
use crate::clock::{Clock, SystemClock};

#[derive(Debug, Default)]
struct State {
    scheduled: HashMap<i64, i64>,
    processing: HashMap<i64, i64>,
    dead_letter: HashMap<i64, i64>,
    payloads: HashMap<i64, NotificationJob>,
}

impl State {
    /// Drop the id from both live sets; true if it was in either.
    fn take_live(&mut self, id: i64) -> bool {
        let scheduled = self.scheduled.remove(&id).is_some();
        let processing = self.processing.remove(&id).is_some();
        scheduled || processing
    }

    /// Ids of `set` with score at or before `cutoff`, earliest first (ties by id).
    fn range(set: &HashMap<i64, i64>, cutoff: i64, limit: usize) -> Vec<i64> {
        let mut hits: Vec<(i64, i64)> = set
            .iter()
            .filter(|(_, at)| **at <= cutoff)
            .map(|(id, at)| (*at, *id))
            .collect();
        hits.sort_unstable();
        hits.into_iter().take(limit).map(|(_, id)| id).collect()
    }
}

pub struct MemoryQueue {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
    closed: AtomicBool,
}

impl MemoryQueue {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock,
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<(), AppError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AppError::Internal("notification queue is closed".to_string()));
        }
        Ok(())
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn schedule(&self, job: &NotificationJob, due_at: DateTime<Utc>) -> Result<(), AppError> {
        self.ensure_open()?;
        let id = job.notification_id;
        let mut state = self.state.lock().await;
        state.payloads.insert(id, job.clone());
        state.processing.remove(&id);
        state.dead_letter.remove(&id);
        state.scheduled.insert(id, score(due_at));
        Ok(())
    }

    async fn cancel(&self, notification_id: i64) -> Result<bool, AppError> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        let live = state.take_live(notification_id);
        let dead = state.dead_letter.remove(&notification_id).is_some();
        let payload = state.payloads.remove(&notification_id).is_some();
        Ok(live || dead || payload)
    }

    async fn due(&self, limit: usize) -> Result<Vec<NotificationJob>, AppError> {
        self.ensure_open()?;
        let now = score(self.clock.now());
        let mut state = self.state.lock().await;

        let ids = State::range(&state.scheduled, now, limit);
        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            let job = state.payloads.get(&id).cloned();
            match job {
                Some(job) => jobs.push(job),
                None => {
                    state.scheduled.remove(&id);
                    tracing::warn!(notification_id = id, "Dropped scheduled member without usable payload");
                }
            }
        }
        Ok(jobs)
    }

    async fn claim(&self, notification_id: i64) -> Result<bool, AppError> {
        self.ensure_open()?;
        let now = score(self.clock.now());
        let mut state = self.state.lock().await;
        if state.scheduled.remove(&notification_id).is_none() {
            return Ok(false);
        }
        state.processing.insert(notification_id, now);
        Ok(true)
    }

    async fn complete(&self, notification_id: i64) -> Result<bool, AppError> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        let removed = state.processing.remove(&notification_id).is_some();
        if removed && !state.scheduled.contains_key(&notification_id) {
            state.payloads.remove(&notification_id);
        }
        Ok(removed)
    }

    async fn retry(&self, notification_id: i64, delay: Duration) -> Result<RetryOutcome, AppError> {
        self.ensure_open()?;
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        // Only the claimed incarnation is retried; a re-scheduled id belongs to the CRUD layer.
        let in_flight = state.processing.contains_key(&notification_id);
        let Some(mut job) = state.payloads.get(&notification_id).cloned().filter(|_| in_flight) else {
            return Ok(RetryOutcome::NotLive);
        };

        let exhausted = count_attempt(&mut job);
        state.processing.remove(&notification_id);
        let retry_count = job.retry_count;
        state.payloads.insert(notification_id, job);

        if exhausted {
            state.dead_letter.insert(notification_id, score(now));
            return Ok(RetryOutcome::DeadLettered);
        }

        let due_at = offset(now, delay);
        state.scheduled.insert(notification_id, score(due_at));
        Ok(RetryOutcome::Rescheduled { retry_count, due_at })
    }

    async fn dead_letter(&self, notification_id: i64) -> Result<bool, AppError> {
        self.ensure_open()?;
        let now = score(self.clock.now());
        let mut state = self.state.lock().await;
        if !state.take_live(notification_id) {
            return Ok(false);
        }
        state.dead_letter.insert(notification_id, now);
        Ok(true)
    }

    async fn stats(&self) -> Result<QueueStats, AppError> {
        self.ensure_open()?;
        let state = self.state.lock().await;
        Ok(QueueStats {
            scheduled: state.scheduled.len() as u64,
            processing: state.processing.len() as u64,
            dead_letter: state.dead_letter.len() as u64,
        })
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, AppError> {
        self.ensure_open()?;
        let state = self.state.lock().await;
        let ids = State::range(&state.dead_letter, i64::MAX, limit);
        Ok(ids
            .into_iter()
            .filter_map(|id| {
                let job = state.payloads.get(&id)?.clone();
                let at = *state.dead_letter.get(&id)?;
                Some(DeadLetterEntry {
                    job,
                    dead_lettered_at: DateTime::from_timestamp_millis(at).unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn requeue_dead_letter(&self, notification_id: i64) -> Result<bool, AppError> {
        self.ensure_open()?;
        let now = score(self.clock.now());
        let mut state = self.state.lock().await;
        if !state.dead_letter.contains_key(&notification_id) {
            return Ok(false);
        }
        let Some(job) = state.payloads.get_mut(&notification_id) else {
            return Ok(false);
        };
        job.retry_count = 0;
        state.dead_letter.remove(&notification_id);
        state.scheduled.insert(notification_id, now);
        Ok(true)
    }

    async fn requeue_stale(&self, older_than: DateTime<Utc>, limit: usize) -> Result<usize, AppError> {
        self.ensure_open()?;
        let now = score(self.clock.now());
        let mut state = self.state.lock().await;
        let stale = State::range(&state.processing, score(older_than), limit);
        for id in &stale {
            state.processing.remove(id);
            state.scheduled.insert(*id, now);
        }
        Ok(stale.len())
    }

    async fn location(&self, notification_id: i64) -> Result<Option<JobLocation>, AppError> {
        self.ensure_open()?;
        let state = self.state.lock().await;
        Ok(if state.scheduled.contains_key(&notification_id) {
            Some(JobLocation::Scheduled)
        } else if state.processing.contains_key(&notification_id) {
            Some(JobLocation::Processing)
        } else if state.dead_letter.contains_key(&notification_id) {
            Some(JobLocation::DeadLetter)
        } else {
            None
        })
    }

    async fn ping(&self) -> Result<(), AppError> {
        self.ensure_open()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axion_common::types::Channel;

    use crate::clock::ManualClock;

    fn setup() -> (Arc<ManualClock>, MemoryQueue) {
        let start = "2026-03-02T09:00:00Z".parse().unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let queue = MemoryQueue::new(clock.clone());
        (clock, queue)
    }

    fn job(id: i64) -> NotificationJob {
        NotificationJob::new(id, 100 + id, 7, Channel::InApp, Some(format!("todo {}", id)), Utc::now())
    }

    /// Count how many sets hold the id.
    async fn memberships(queue: &MemoryQueue, id: i64) -> usize {
        let state = queue.state.lock().await;
        [&state.scheduled, &state.processing, &state.dead_letter]
            .iter()
            .filter(|set| set.contains_key(&id))
            .count()
    }

    #[tokio::test]
    async fn test_schedule_then_due_returns_payload() {
        let (clock, queue) = setup();
        let original = job(1);
        queue.schedule(&original, clock.now() + chrono::Duration::seconds(30)).await.unwrap();

        assert!(queue.due(10).await.unwrap().is_empty());

        clock.advance(chrono::Duration::seconds(30));
        let due = queue.due(10).await.unwrap();
        assert_eq!(due, vec![original]);
        assert_eq!(due[0].retry_count, 0);
        // due() does not consume
        assert_eq!(queue.due(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_due_orders_by_score_and_respects_limit() {
        let (clock, queue) = setup();
        let now = clock.now();
        queue.schedule(&job(3), now - chrono::Duration::seconds(1)).await.unwrap();
        queue.schedule(&job(1), now - chrono::Duration::seconds(5)).await.unwrap();
        queue.schedule(&job(2), now - chrono::Duration::seconds(3)).await.unwrap();

        let ids: Vec<i64> = queue.due(10).await.unwrap().iter().map(|j| j.notification_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(queue.due(2).await.unwrap().len(), 2);
        assert!(queue.due(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_same_due_time_drains_one_per_call() {
        let (clock, queue) = setup();
        let at = clock.now();
        queue.schedule(&job(2), at).await.unwrap();
        queue.schedule(&job(1), at).await.unwrap();

        let first = queue.due(1).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].notification_id, 1);
        assert!(queue.claim(1).await.unwrap());

        let second = queue.due(1).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].notification_id, 2);
        assert!(queue.claim(2).await.unwrap());

        assert!(queue.due(1).await.unwrap().is_empty());
        assert_eq!(queue.stats().await.unwrap().processing, 2);
    }

    #[tokio::test]
    async fn test_reschedule_replaces_previous_job() {
        let (clock, queue) = setup();
        let now = clock.now();
        queue.schedule(&job(1), now).await.unwrap();
        let mut replacement = job(1);
        replacement.message = Some("moved".to_string());
        queue.schedule(&replacement, now + chrono::Duration::hours(1)).await.unwrap();

        assert!(queue.due(10).await.unwrap().is_empty());
        assert_eq!(queue.stats().await.unwrap().scheduled, 1);
        clock.advance(chrono::Duration::hours(1));
        assert_eq!(queue.due(10).await.unwrap(), vec![replacement]);
    }

    #[tokio::test]
    async fn test_schedule_clears_processing_and_dead_letter() {
        let (clock, queue) = setup();
        queue.schedule(&job(1), clock.now()).await.unwrap();
        assert!(queue.claim(1).await.unwrap());
        queue.schedule(&job(1), clock.now()).await.unwrap();
        assert_eq!(memberships(&queue, 1).await, 1);
        assert_eq!(queue.location(1).await.unwrap(), Some(JobLocation::Scheduled));

        queue.dead_letter(1).await.unwrap();
        queue.schedule(&job(1), clock.now()).await.unwrap();
        assert_eq!(memberships(&queue, 1).await, 1);
        assert_eq!(queue.location(1).await.unwrap(), Some(JobLocation::Scheduled));
    }

    #[tokio::test]
    async fn test_cancel_removes_everything_and_is_idempotent() {
        let (clock, queue) = setup();
        queue.schedule(&job(1), clock.now()).await.unwrap();
        assert!(queue.cancel(1).await.unwrap());
        assert!(queue.due(10).await.unwrap().is_empty());
        assert_eq!(queue.location(1).await.unwrap(), None);
        assert!(!queue.cancel(1).await.unwrap());
        assert!(!queue.cancel(999).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_reaches_claimed_job() {
        let (clock, queue) = setup();
        queue.schedule(&job(1), clock.now()).await.unwrap();
        queue.claim(1).await.unwrap();
        assert!(queue.cancel(1).await.unwrap());
        assert_eq!(queue.stats().await.unwrap(), QueueStats::default());
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let (clock, queue) = setup();
        queue.schedule(&job(1), clock.now()).await.unwrap();
        assert!(queue.claim(1).await.unwrap());
        assert!(!queue.claim(1).await.unwrap());
        assert_eq!(queue.location(1).await.unwrap(), Some(JobLocation::Processing));
        assert!(queue.due(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_complete_deletes_payload() {
        let (clock, queue) = setup();
        queue.schedule(&job(1), clock.now()).await.unwrap();
        queue.claim(1).await.unwrap();
        assert!(queue.complete(1).await.unwrap());
        assert_eq!(queue.location(1).await.unwrap(), None);
        assert!(queue.state.lock().await.payloads.is_empty());
        assert!(!queue.complete(1).await.unwrap());
    }

    #[tokio::test]
    async fn test_complete_keeps_payload_rescheduled_in_flight() {
        let (clock, queue) = setup();
        queue.schedule(&job(1), clock.now()).await.unwrap();
        queue.claim(1).await.unwrap();
        // CRUD layer reschedules while the dispatcher is delivering
        queue.schedule(&job(1), clock.now() + chrono::Duration::minutes(5)).await.unwrap();
        assert!(!queue.complete(1).await.unwrap());
        assert_eq!(queue.location(1).await.unwrap(), Some(JobLocation::Scheduled));
        assert!(queue.state.lock().await.payloads.contains_key(&1));
    }

    #[tokio::test]
    async fn test_retry_until_dead_letter_then_noop() {
        let (clock, queue) = setup();
        queue.schedule(&job(1).with_max_retries(3), clock.now()).await.unwrap();

        for expected in 1..3 {
            assert!(queue.claim(1).await.unwrap());
            match queue.retry(1, Duration::from_secs(10)).await.unwrap() {
                RetryOutcome::Rescheduled { retry_count, due_at } => {
                    assert_eq!(retry_count, expected);
                    assert_eq!(due_at, clock.now() + chrono::Duration::seconds(10));
                }
                other => panic!("unexpected outcome {:?}", other),
            }
            assert_eq!(memberships(&queue, 1).await, 1);
        }

        assert!(queue.claim(1).await.unwrap());
        assert_eq!(queue.retry(1, Duration::from_secs(10)).await.unwrap(), RetryOutcome::DeadLettered);
        assert_eq!(queue.location(1).await.unwrap(), Some(JobLocation::DeadLetter));
        assert_eq!(queue.retry(1, Duration::from_secs(10)).await.unwrap(), RetryOutcome::NotLive);
        assert_eq!(queue.location(1).await.unwrap(), Some(JobLocation::DeadLetter));

        let parked = queue.dead_letters(10).await.unwrap();
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].job.retry_count, 3);
        assert_eq!(parked[0].dead_lettered_at, clock.now());
    }

    #[tokio::test]
    async fn test_retry_unknown_is_not_live() {
        let (_clock, queue) = setup();
        assert_eq!(queue.retry(5, Duration::from_secs(1)).await.unwrap(), RetryOutcome::NotLive);
    }

    #[tokio::test]
    async fn test_retry_requires_claim() {
        let (clock, queue) = setup();
        queue.schedule(&job(1), clock.now()).await.unwrap();
        assert_eq!(queue.retry(1, Duration::from_secs(1)).await.unwrap(), RetryOutcome::NotLive);
        assert_eq!(queue.due(10).await.unwrap()[0].retry_count, 0);
    }

    #[tokio::test]
    async fn test_retry_leaves_job_rescheduled_in_flight() {
        let (clock, queue) = setup();
        queue.schedule(&job(1), clock.now()).await.unwrap();
        queue.claim(1).await.unwrap();

        // CRUD layer moves the reminder an hour out while delivery is failing
        let mut fresh = job(1);
        fresh.message = Some("fresh".to_string());
        queue.schedule(&fresh, clock.now() + chrono::Duration::hours(1)).await.unwrap();

        assert_eq!(queue.retry(1, Duration::from_secs(60)).await.unwrap(), RetryOutcome::NotLive);

        clock.advance(chrono::Duration::seconds(60));
        assert!(queue.due(10).await.unwrap().is_empty());

        clock.advance(chrono::Duration::hours(1));
        assert_eq!(queue.due(10).await.unwrap(), vec![fresh]);
    }

    #[tokio::test]
    async fn test_dead_letter_retains_payload() {
        let (clock, queue) = setup();
        queue.schedule(&job(1), clock.now()).await.unwrap();
        queue.claim(1).await.unwrap();
        assert!(queue.dead_letter(1).await.unwrap());
        assert!(!queue.dead_letter(1).await.unwrap());
        assert_eq!(
            queue.stats().await.unwrap(),
            QueueStats { scheduled: 0, processing: 0, dead_letter: 1 }
        );
        assert_eq!(queue.dead_letters(10).await.unwrap()[0].job.notification_id, 1);
    }

    #[tokio::test]
    async fn test_requeue_dead_letter_resets_budget() {
        let (clock, queue) = setup();
        queue.schedule(&job(1).with_max_retries(1), clock.now()).await.unwrap();
        queue.claim(1).await.unwrap();
        assert_eq!(queue.retry(1, Duration::from_secs(1)).await.unwrap(), RetryOutcome::DeadLettered);

        assert!(queue.requeue_dead_letter(1).await.unwrap());
        assert!(!queue.requeue_dead_letter(1).await.unwrap());
        let due = queue.due(10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].retry_count, 0);
    }

    #[tokio::test]
    async fn test_requeue_stale_moves_old_claims_only() {
        let (clock, queue) = setup();
        queue.schedule(&job(1), clock.now()).await.unwrap();
        queue.schedule(&job(2), clock.now()).await.unwrap();
        queue.claim(1).await.unwrap();
        clock.advance(chrono::Duration::minutes(10));
        queue.claim(2).await.unwrap();

        let moved = queue
            .requeue_stale(clock.now() - chrono::Duration::minutes(5), 100)
            .await
            .unwrap();
        assert_eq!(moved, 1);
        assert_eq!(queue.location(1).await.unwrap(), Some(JobLocation::Scheduled));
        assert_eq!(queue.location(2).await.unwrap(), Some(JobLocation::Processing));
    }

    #[tokio::test]
    async fn test_closed_queue_rejects_calls() {
        let (_clock, queue) = setup();
        queue.close().await;
        assert!(queue.ping().await.is_err());
        assert!(queue.stats().await.is_err());
    }
}
