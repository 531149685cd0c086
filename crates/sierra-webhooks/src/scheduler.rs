//! Retry scheduler.
//!
//! A single coordinator loop ticks every `poll_interval`, drains due attempt
//! ids from the [`RetryQueue`] and hands each to the [`AttemptExecutor`] on a
//! semaphore-bounded pool of tokio tasks. Stopping ends the loop; executions
//! already running are left to finish and persist.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::config::SchedulerConfig;
use crate::error::WebhookResult;
use crate::executor::{AttemptExecutor, AttemptOutcome};
use crate::metrics::MetricsRecorder;
use crate::queue::RetryQueue;
use crate::rate_limiter::RateLimiter;
use crate::store::DeliveryStore;

struct Running {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct SchedulerInner {
    executor: Arc<AttemptExecutor>,
    deliveries: Arc<dyn DeliveryStore>,
    queue: Arc<RetryQueue>,
    rate_limiter: Arc<RateLimiter>,
    metrics: Arc<MetricsRecorder>,
    config: SchedulerConfig,
    metrics_retention_days: u32,
    semaphore: Arc<Semaphore>,
    running: Mutex<Option<Running>>,
}

/// Periodic coordinator for due delivery attempts. Cheap to clone.
#[derive(Clone)]
pub struct RetryScheduler {
    inner: Arc<SchedulerInner>,
}

impl RetryScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        executor: Arc<AttemptExecutor>,
        deliveries: Arc<dyn DeliveryStore>,
        queue: Arc<RetryQueue>,
        rate_limiter: Arc<RateLimiter>,
        metrics: Arc<MetricsRecorder>,
        config: SchedulerConfig,
        metrics_retention_days: u32,
    ) -> Self {
        let concurrency = config.concurrency.max(1);
        Self {
            inner: Arc::new(SchedulerInner {
                executor,
                deliveries,
                queue,
                rate_limiter,
                metrics,
                config,
                metrics_retention_days,
                semaphore: Arc::new(Semaphore::new(concurrency)),
                running: Mutex::new(None),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Start the coordinator loop. Returns false if it was already running.
    pub fn start(&self) -> bool {
        let mut running = self.lock_running();
        if running.is_some() {
            return false;
        }

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let scheduler = self.clone();
        let poll_interval = self.inner.config.poll_interval;

        tracing::info!(
            target: "webhook_scheduler",
            concurrency = self.inner.config.concurrency,
            batch_size = self.inner.config.batch_size,
            poll_interval_ms = poll_interval.as_millis() as u64,
            "Starting webhook retry scheduler"
        );

        let handle = tokio::spawn(async move {
            let mut ticker = interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        scheduler.tick().await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!(target: "webhook_scheduler", "Webhook retry scheduler loop stopped");
        });

        *running = Some(Running { shutdown, handle });
        true
    }

    /// Stop future ticks and wait for the loop to exit. In-flight executions
    /// keep running; use [`wait_idle`](Self::wait_idle) to wait for them.
    /// Returns false if the scheduler was not running.
    pub async fn stop(&self) -> bool {
        let Some(running) = self.lock_running().take() else {
            return false;
        };

        tracing::info!(target: "webhook_scheduler", "Shutdown requested");
        let _ = running.shutdown.send(true);
        if let Err(e) = running.handle.await {
            tracing::error!(
                target: "webhook_scheduler",
                error = %e,
                "Scheduler loop terminated abnormally"
            );
        }
        true
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.lock_running().is_some()
    }

    /// Executions currently holding a worker slot.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner
            .config
            .concurrency
            .max(1)
            .saturating_sub(self.inner.semaphore.available_permits())
    }

    /// Wait until no execution is in flight.
    pub async fn wait_idle(&self) {
        let permits = u32::try_from(self.inner.config.concurrency.max(1)).unwrap_or(u32::MAX);
        let _ = self.inner.semaphore.acquire_many(permits).await;
    }

    /// Run one coordinator tick: drain due attempts and dispatch them to the
    /// worker pool, waiting for free slots as needed. Returns how many
    /// attempts were dispatched.
    pub async fn tick(&self) -> usize {
        let inner = &self.inner;
        let now = Utc::now();

        inner.rate_limiter.purge_expired();
        let retention = chrono::Duration::days(i64::from(inner.metrics_retention_days));
        if let Some(cutoff) = now.date_naive().checked_sub_signed(retention) {
            inner.metrics.prune(cutoff).await;
        }

        let due = inner.queue.drain_due(now, inner.config.batch_size);
        if due.is_empty() {
            return 0;
        }

        tracing::debug!(
            target: "webhook_scheduler",
            count = due.len(),
            queue_depth = inner.queue.len(),
            "Dispatching due delivery attempts"
        );

        let mut dispatched = 0;
        for attempt_id in due {
            let permit = match Arc::clone(&inner.semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    inner.queue.push(attempt_id, Utc::now());
                    continue;
                }
            };

            let scheduler = self.clone();
            tokio::spawn(async move {
                let _permit = permit;
                scheduler.run_attempt(attempt_id).await;
            });
            dispatched += 1;
        }

        dispatched
    }

    async fn run_attempt(&self, attempt_id: sierra_core::AttemptId) {
        let inner = &self.inner;
        match inner.executor.execute(attempt_id).await {
            Ok(AttemptOutcome::Skipped) => {}
            Ok(outcome) => {
                tracing::debug!(
                    target: "webhook_scheduler",
                    attempt_id = %attempt_id,
                    terminal = outcome.is_terminal(),
                    "Delivery attempt executed"
                );
            }
            Err(e) => {
                let retry_at = Utc::now()
                    + chrono::Duration::from_std(inner.config.poll_interval)
                        .unwrap_or_else(|_| chrono::Duration::seconds(10));
                // A retry already scheduled by the executor keeps its due time.
                let requeued = inner.queue.push_if_absent(attempt_id, retry_at);
                tracing::error!(
                    target: "webhook_scheduler",
                    attempt_id = %attempt_id,
                    error = %e,
                    requeued,
                    retry_at = %retry_at,
                    "Delivery attempt failed with store error"
                );
            }
        }
    }

    /// Load pending attempts from the store into the queue. Returns how many
    /// were queued.
    ///
    /// # Errors
    ///
    /// Returns the store error if pending attempts cannot be listed.
    pub async fn recover_pending(&self) -> WebhookResult<usize> {
        let pending = self.inner.deliveries.list_pending(usize::MAX).await?;
        let now = Utc::now();
        let mut queued = 0;
        for attempt in pending {
            if self
                .inner
                .queue
                .push(attempt.id, attempt.next_attempt_at.unwrap_or(now))
            {
                queued += 1;
            }
        }

        tracing::info!(
            target: "webhook_scheduler",
            recovered = queued,
            "Recovered pending delivery attempts"
        );
        Ok(queued)
    }

    fn lock_running(&self) -> MutexGuard<'_, Option<Running>> {
        self.inner
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
