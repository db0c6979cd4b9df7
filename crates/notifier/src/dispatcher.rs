//! Notification dispatcher.
//!
//! Polls the queue at a fixed interval and walks each due job through
//! `scheduled → processing → {completed | scheduled (retry) | dead_letter}`:
//! 1. Claim the job (atomic move to processing)
//! 2. Re-load the durable record; gone or already sent → complete
//! 3. Deliver through the channel handler
//! 4. Mark the record delivered, then complete
//! 5. On failure, retry with exponential backoff until the budget is spent

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use axion_common::config::AppConfig;
use axion_common::error::AppError;
use axion_common::types::{NotificationJob, QueueStats};

use crate::channels::ChannelRegistry;
use crate::clock::Clock;
use crate::queue::{JobQueue, RetryOutcome, offset_back};
use crate::store::JobStore;

/// How many stale processing entries one sweep may move.
const STALE_SWEEP_LIMIT: usize = 500;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub base_retry_delay: Duration,
    pub max_retry_delay: Option<Duration>,
    /// Requeue processing entries older than this on every poll.
    pub stale_after: Option<Duration>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            batch_size: 100,
            base_retry_delay: Duration::from_secs(60),
            max_retry_delay: None,
            stale_after: None,
        }
    }
}

impl From<&AppConfig> for DispatcherConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            poll_interval: Duration::from_secs(config.worker_poll_interval_secs),
            batch_size: config.worker_batch_size,
            base_retry_delay: Duration::from_secs(config.worker_retry_delay_secs),
            max_retry_delay: config.worker_max_retry_delay_secs.map(Duration::from_secs),
            stale_after: config.worker_stale_after_secs.map(Duration::from_secs),
        }
    }
}

/// Delay before the next attempt: `base * 2^retry_count`, saturating,
/// optionally capped.
pub fn backoff_delay(base: Duration, retry_count: u32, cap: Option<Duration>) -> Duration {
    let delay = 2u32
        .checked_pow(retry_count)
        .and_then(|factor| base.checked_mul(factor))
        .unwrap_or(Duration::MAX);

    match cap {
        Some(cap) => delay.min(cap),
        None => delay,
    }
}

/// What happened to one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Delivered,
    /// Record deleted or already sent; completed without delivering.
    AlreadyHandled,
    /// Claim lost (another worker, or cancelled in between).
    Skipped,
    Retried,
    DeadLettered,
}

/// Tally of one poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub fetched: usize,
    pub delivered: usize,
    pub already_handled: usize,
    pub skipped: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    pub requeued_stale: usize,
}

impl BatchReport {
    fn record(&mut self, outcome: JobOutcome) {
        match outcome {
            JobOutcome::Delivered => self.delivered += 1,
            JobOutcome::AlreadyHandled => self.already_handled += 1,
            JobOutcome::Skipped => self.skipped += 1,
            JobOutcome::Retried => self.retried += 1,
            JobOutcome::DeadLettered => self.dead_lettered += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStats {
    pub running: bool,
    pub poll_interval_secs: u64,
    pub batch_size: usize,
    pub queues: QueueStats,
}

pub struct Dispatcher {
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn JobStore>,
    channels: ChannelRegistry,
    config: DispatcherConfig,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
    running: AtomicBool,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        store: Arc<dyn JobStore>,
        channels: ChannelRegistry,
        config: DispatcherConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            queue,
            store,
            channels,
            config,
            clock,
            shutdown: CancellationToken::new(),
            running: AtomicBool::new(false),
        }
    }

    /// Token that stops the loop when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Ask the loop to stop. The job in flight finishes; the rest of the
    /// batch stays scheduled.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Run until stopped. Fails only if the queue is unreachable at start.
    pub async fn run(&self) -> Result<(), AppError> {
        self.queue.ping().await?;
        self.running.store(true, Ordering::Release);

        tracing::info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            batch_size = self.config.batch_size,
            base_retry_delay_secs = self.config.base_retry_delay.as_secs(),
            "Notification dispatcher started"
        );

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            match self.poll_once().await {
                Ok(report) if report.fetched > 0 || report.requeued_stale > 0 => {
                    tracing::info!(
                        fetched = report.fetched,
                        delivered = report.delivered,
                        already_handled = report.already_handled,
                        skipped = report.skipped,
                        retried = report.retried,
                        dead_lettered = report.dead_lettered,
                        requeued_stale = report.requeued_stale,
                        "Poll complete"
                    );
                }
                Ok(_) => {}
                Err(e) if e.is_transient() => {
                    tracing::warn!(error = %e, "Queue unavailable, retrying next interval");
                }
                Err(e) => {
                    tracing::error!(error = %e, "Poll failed, retrying next interval");
                }
            }

            tokio::select! {
                () = tokio::time::sleep(self.config.poll_interval) => {}
                () = self.shutdown.cancelled() => break,
            }
        }

        self.running.store(false, Ordering::Release);
        tracing::info!("Notification dispatcher stopped");
        Ok(())
    }

    /// One poll: optional stale sweep, then every due job in order.
    ///
    /// Queue errors on a single job are logged and the batch moves on; only
    /// a failure to fetch the batch aborts the poll.
    pub async fn poll_once(&self) -> Result<BatchReport, AppError> {
        let mut report = BatchReport::default();

        if let Some(stale_after) = self.config.stale_after {
            let cutoff = offset_back(self.clock.now(), stale_after);
            report.requeued_stale = self.queue.requeue_stale(cutoff, STALE_SWEEP_LIMIT).await?;
            if report.requeued_stale > 0 {
                tracing::warn!(
                    count = report.requeued_stale,
                    "Requeued stale processing entries"
                );
            }
        }

        let jobs = self.queue.due(self.config.batch_size).await?;
        report.fetched = jobs.len();

        for job in jobs {
            if self.shutdown.is_cancelled() {
                tracing::info!("Stop requested, leaving rest of batch scheduled");
                break;
            }

            match self.process_job(&job).await {
                Ok(outcome) => report.record(outcome),
                Err(e) => {
                    tracing::error!(
                        notification_id = job.notification_id,
                        error = %e,
                        "Queue error while processing job"
                    );
                }
            }
        }

        Ok(report)
    }

    /// Drive one job to its next state. `Err` means the queue itself failed.
    pub async fn process_job(&self, job: &NotificationJob) -> Result<JobOutcome, AppError> {
        let id = job.notification_id;

        if !self.queue.claim(id).await? {
            tracing::debug!(notification_id = id, "Job no longer scheduled, skipping");
            return Ok(JobOutcome::Skipped);
        }

        match self.deliver(job).await {
            Ok(Some(true)) => {
                self.queue.complete(id).await?;
                tracing::info!(notification_id = id, channel = %job.channel, "Notification delivered");
                Ok(JobOutcome::Delivered)
            }
            Ok(None) => {
                self.queue.complete(id).await?;
                tracing::info!(notification_id = id, "Notification already handled, dropping job");
                Ok(JobOutcome::AlreadyHandled)
            }
            Ok(Some(false)) => {
                tracing::warn!(notification_id = id, channel = %job.channel, "Delivery failed");
                self.retry(job).await
            }
            Err(e) => {
                tracing::warn!(
                    notification_id = id,
                    channel = %job.channel,
                    error = %e,
                    "Delivery errored"
                );
                self.retry(job).await
            }
        }
    }

    /// `None` when there is nothing left to deliver for this job.
    async fn deliver(&self, job: &NotificationJob) -> Result<Option<bool>, AppError> {
        let Some(record) = self.store.load(job.notification_id).await? else {
            return Ok(None);
        };
        if record.is_sent {
            return Ok(None);
        }

        let delivered = self
            .channels
            .handler_for(job.channel)
            .deliver(&record, job)
            .await?;

        if delivered {
            self.store.mark_delivered(record.id).await?;
        }
        Ok(Some(delivered))
    }

    async fn retry(&self, job: &NotificationJob) -> Result<JobOutcome, AppError> {
        let delay = backoff_delay(
            self.config.base_retry_delay,
            job.retry_count,
            self.config.max_retry_delay,
        );

        match self.queue.retry(job.notification_id, delay).await? {
            RetryOutcome::Rescheduled { retry_count, due_at } => {
                tracing::info!(
                    notification_id = job.notification_id,
                    retry_count,
                    max_retries = job.max_retries,
                    due_at = %due_at,
                    "Delivery rescheduled"
                );
                Ok(JobOutcome::Retried)
            }
            RetryOutcome::DeadLettered => {
                tracing::error!(
                    notification_id = job.notification_id,
                    max_retries = job.max_retries,
                    "Retries exhausted, job dead-lettered"
                );
                Ok(JobOutcome::DeadLettered)
            }
            RetryOutcome::NotLive => {
                tracing::debug!(
                    notification_id = job.notification_id,
                    "Job cancelled or rescheduled during delivery, not retrying"
                );
                Ok(JobOutcome::Skipped)
            }
        }
    }

    pub async fn stats(&self) -> Result<WorkerStats, AppError> {
        Ok(WorkerStats {
            running: self.is_running(),
            poll_interval_secs: self.config.poll_interval.as_secs(),
            batch_size: self.config.batch_size,
            queues: self.queue.stats().await?,
        })
    }
}
