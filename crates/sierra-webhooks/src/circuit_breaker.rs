//! Circuit breaker for outbound webhook calls.
//!
//! One breaker exists per destination host. While a host keeps failing its
//! breaker opens and calls are rejected without touching the network until
//! `reset_timeout` has passed. A limited number of probe calls then decide
//! whether the breaker closes again.
//!
//! State lives behind a single mutex so concurrent outcomes are applied
//! atomically. The wrapped operation itself never runs under the lock.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::error::{WebhookError, WebhookResult};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, calls proceed.
    #[default]
    Closed,
    /// Tripped, calls rejected immediately.
    Open,
    /// Probing recovery with a limited number of calls.
    HalfOpen,
}

impl CircuitState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "closed" => Some(Self::Closed),
            "open" => Some(Self::Open),
            "half_open" => Some(Self::HalfOpen),
            _ => None,
        }
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Upper bound for a single wrapped call; elapsing counts as a failure.
    pub timeout: Duration,
    /// Consecutive failures that trip the breaker.
    pub error_threshold: u32,
    /// Failure rate (0-100) over the current window that trips the breaker.
    pub error_threshold_percentage: f64,
    /// Time spent open before probing.
    pub reset_timeout: Duration,
    /// Length of the rolling window used for rates and latencies.
    pub monitoring_period: Duration,
    /// Samples required in the window before the breaker may open.
    pub minimum_requests: u32,
    /// Successful probes needed to close from half-open.
    pub half_open_max_attempts: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            error_threshold: 5,
            error_threshold_percentage: 50.0,
            reset_timeout: Duration::from_secs(60),
            monitoring_period: Duration::from_secs(60),
            minimum_requests: 20,
            half_open_max_attempts: 3,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new configuration with custom call timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Create a new configuration with custom consecutive failure threshold.
    #[must_use]
    pub fn with_error_threshold(mut self, threshold: u32) -> Self {
        self.error_threshold = threshold;
        self
    }

    /// Create a new configuration with custom failure rate threshold.
    #[must_use]
    pub fn with_error_threshold_percentage(mut self, percentage: f64) -> Self {
        self.error_threshold_percentage = percentage;
        self
    }

    /// Create a new configuration with custom reset timeout.
    #[must_use]
    pub fn with_reset_timeout(mut self, reset_timeout: Duration) -> Self {
        self.reset_timeout = reset_timeout;
        self
    }

    /// Create a new configuration with custom monitoring window.
    #[must_use]
    pub fn with_monitoring_period(mut self, period: Duration) -> Self {
        self.monitoring_period = period;
        self
    }

    /// Create a new configuration with custom minimum window size.
    #[must_use]
    pub fn with_minimum_requests(mut self, minimum: u32) -> Self {
        self.minimum_requests = minimum;
        self
    }

    /// Create a new configuration with custom probe count.
    #[must_use]
    pub fn with_half_open_max_attempts(mut self, attempts: u32) -> Self {
        self.half_open_max_attempts = attempts;
        self
    }
}

/// Error returned by a guarded call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BreakerError<E> {
    /// Rejected without invoking the operation.
    #[error("Circuit breaker {name} is open")]
    Open {
        name: String,
        retry_at: Option<DateTime<Utc>>,
    },

    /// The operation did not finish within the breaker timeout.
    #[error("Circuit breaker {name} timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    /// The operation's own error.
    #[error("{0}")]
    Inner(E),
}

impl<E> BreakerError<E> {
    /// True when the call was rejected without running.
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub timeouts: u64,
    pub rejected_requests: u64,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub window_requests: usize,
    pub failure_rate: f64,
    pub average_latency_ms: f64,
    pub p95_latency_ms: u64,
    pub p99_latency_ms: u64,
    pub half_open_attempts: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    duration: Duration,
    success: bool,
}

#[derive(Debug, Default)]
struct Counters {
    total: u64,
    success: u64,
    failure: u64,
    timeout: u64,
    rejected: u64,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    samples: VecDeque<Sample>,
    consecutive_failures: u32,
    consecutive_successes: u32,
    next_attempt_at: Option<Instant>,
    next_attempt_wall: Option<DateTime<Utc>>,
    opened_at: Option<DateTime<Utc>>,
    half_open_used: u32,
    half_open_in_flight: u32,
    last_prune: Instant,
    counters: Counters,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            samples: VecDeque::new(),
            consecutive_failures: 0,
            consecutive_successes: 0,
            next_attempt_at: None,
            next_attempt_wall: None,
            opened_at: None,
            half_open_used: 0,
            half_open_in_flight: 0,
            last_prune: Instant::now(),
            counters: Counters::default(),
        }
    }

    fn window(&self, period: Duration, now: Instant) -> impl Iterator<Item = &Sample> {
        self.samples
            .iter()
            .filter(move |s| now.saturating_duration_since(s.at) <= period)
    }
}

enum Admission {
    Allowed { probe: bool },
    Rejected { retry_at: Option<DateTime<Utc>> },
}

/// Circuit breaker guarding calls to one destination host.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a closed breaker for `name`.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState::new()),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, without advancing an expired open breaker.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Run `operation` through the breaker. Every error counts as a failure.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run(operation, |_| true, self.config.timeout).await
    }

    /// Like [`execute_filtered`](Self::execute_filtered), but bounds the call
    /// by `timeout` instead of the breaker-wide timeout.
    pub async fn execute_filtered_with_timeout<F, Fut, T, E, P>(
        &self,
        operation: F,
        is_error: P,
        timeout: Duration,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        self.run(operation, is_error, timeout).await
    }

    /// Run `operation`; only errors for which `is_error` returns true count
    /// as failures. Other errors pass through without touching the stats.
    pub async fn execute_filtered<F, Fut, T, E, P>(
        &self,
        operation: F,
        is_error: P,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        self.run(operation, is_error, self.config.timeout).await
    }

    /// Run `operation`, answering with `fallback()` when the breaker rejects
    /// the call.
    pub async fn execute_or_fallback<F, Fut, T, E, FB>(
        &self,
        operation: F,
        fallback: FB,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        FB: FnOnce() -> T,
    {
        match self.run(operation, |_| true, self.config.timeout).await {
            Err(BreakerError::Open { .. }) => Ok(fallback()),
            other => other,
        }
    }

    async fn run<F, Fut, T, E, P>(
        &self,
        operation: F,
        is_error: P,
        timeout: Duration,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let probe = match self.admit() {
            Admission::Allowed { probe } => probe,
            Admission::Rejected { retry_at } => {
                return Err(BreakerError::Open {
                    name: self.name.clone(),
                    retry_at,
                });
            }
        };

        let mut guard = ProbeGuard {
            breaker: self,
            armed: probe,
        };

        let started = Instant::now();
        let result = tokio::time::timeout(timeout, operation()).await;
        let elapsed = started.elapsed();
        guard.armed = false;

        match result {
            Ok(Ok(value)) => {
                self.on_success(elapsed, probe);
                Ok(value)
            }
            Ok(Err(err)) => {
                if is_error(&err) {
                    self.on_failure(elapsed, probe, false);
                } else {
                    self.release_probe(probe);
                }
                Err(BreakerError::Inner(err))
            }
            Err(_) => {
                self.on_failure(elapsed, probe, true);
                Err(BreakerError::Timeout {
                    name: self.name.clone(),
                    timeout,
                })
            }
        }
    }

    fn admit(&self) -> Admission {
        let mut s = self.lock();
        let now = Instant::now();

        if s.state == CircuitState::Open {
            match s.next_attempt_at {
                Some(at) if now < at => {
                    s.counters.rejected += 1;
                    return Admission::Rejected {
                        retry_at: s.next_attempt_wall,
                    };
                }
                _ => {
                    s.state = CircuitState::HalfOpen;
                    s.half_open_used = 0;
                    s.half_open_in_flight = 0;
                    tracing::info!(
                        target: "circuit_breaker",
                        breaker = %self.name,
                        "Circuit breaker half-open, probing destination"
                    );
                }
            }
        }

        if s.state == CircuitState::HalfOpen {
            let max = self.config.half_open_max_attempts.max(1);
            if s.half_open_used >= max {
                self.open(&mut s, now, "half-open attempts exhausted");
                s.counters.rejected += 1;
                return Admission::Rejected {
                    retry_at: s.next_attempt_wall,
                };
            }
            if s.half_open_used + s.half_open_in_flight >= max {
                s.counters.rejected += 1;
                return Admission::Rejected { retry_at: None };
            }
            s.half_open_in_flight += 1;
            return Admission::Allowed { probe: true };
        }

        Admission::Allowed { probe: false }
    }

    fn on_success(&self, duration: Duration, probe: bool) {
        let mut s = self.lock();
        let now = Instant::now();
        if probe {
            s.half_open_in_flight = s.half_open_in_flight.saturating_sub(1);
        }

        self.record_sample(&mut s, now, duration, true);
        s.counters.success += 1;
        s.consecutive_successes += 1;
        s.consecutive_failures = 0;

        if probe && s.state == CircuitState::HalfOpen {
            s.half_open_used += 1;
            if s.half_open_used >= self.config.half_open_max_attempts.max(1) {
                self.close(&mut s, now);
            }
        }
    }

    fn on_failure(&self, duration: Duration, probe: bool, timed_out: bool) {
        let mut s = self.lock();
        let now = Instant::now();
        if probe {
            s.half_open_in_flight = s.half_open_in_flight.saturating_sub(1);
        }

        self.record_sample(&mut s, now, duration, false);
        s.counters.failure += 1;
        if timed_out {
            s.counters.timeout += 1;
        }
        s.consecutive_failures += 1;
        s.consecutive_successes = 0;

        match s.state {
            CircuitState::HalfOpen if probe => {
                self.open(&mut s, now, "probe failed");
            }
            CircuitState::Closed => {
                let window: Vec<bool> = s
                    .window(self.config.monitoring_period, now)
                    .map(|sample| sample.success)
                    .collect();
                let requests = window.len();
                if requests >= self.config.minimum_requests as usize {
                    let failures = window.iter().filter(|ok| !**ok).count();
                    let rate = failures as f64 * 100.0 / requests as f64;
                    if s.consecutive_failures >= self.config.error_threshold
                        || rate >= self.config.error_threshold_percentage
                    {
                        self.open(&mut s, now, "failure threshold reached");
                    }
                }
            }
            _ => {}
        }
    }

    fn release_probe(&self, probe: bool) {
        if probe {
            let mut s = self.lock();
            s.half_open_in_flight = s.half_open_in_flight.saturating_sub(1);
        }
    }

    fn record_sample(&self, s: &mut BreakerState, now: Instant, duration: Duration, success: bool) {
        s.counters.total += 1;
        s.samples.push_back(Sample {
            at: now,
            duration,
            success,
        });

        if now.saturating_duration_since(s.last_prune) >= self.config.monitoring_period {
            let horizon = self.config.monitoring_period * 2;
            while s
                .samples
                .front()
                .is_some_and(|sample| now.saturating_duration_since(sample.at) > horizon)
            {
                s.samples.pop_front();
            }
            s.last_prune = now;
        }
    }

    fn open(&self, s: &mut BreakerState, now: Instant, reason: &str) {
        s.state = CircuitState::Open;
        s.next_attempt_at = Some(now + self.config.reset_timeout);
        let wall_now = Utc::now();
        s.next_attempt_wall = chrono::Duration::from_std(self.config.reset_timeout)
            .ok()
            .map(|d| wall_now + d);
        s.opened_at = Some(wall_now);
        s.half_open_used = 0;
        tracing::warn!(
            target: "circuit_breaker",
            breaker = %self.name,
            consecutive_failures = s.consecutive_failures,
            reset_timeout_ms = self.config.reset_timeout.as_millis() as u64,
            reason,
            "Circuit breaker opened"
        );
    }

    fn close(&self, s: &mut BreakerState, now: Instant) {
        s.state = CircuitState::Closed;
        s.samples.clear();
        s.consecutive_failures = 0;
        s.consecutive_successes = 0;
        s.next_attempt_at = None;
        s.next_attempt_wall = None;
        s.opened_at = None;
        s.half_open_used = 0;
        s.last_prune = now;
        s.counters = Counters::default();
        tracing::info!(
            target: "circuit_breaker",
            breaker = %self.name,
            "Circuit breaker closed after successful probes"
        );
    }

    /// Force the breaker closed and clear all statistics.
    pub fn reset(&self) {
        let mut s = self.lock();
        let previous = s.state;
        *s = BreakerState::new();
        tracing::info!(
            target: "circuit_breaker",
            breaker = %self.name,
            previous_state = previous.as_str(),
            "Circuit breaker reset"
        );
    }

    /// Counters and rolling-window statistics.
    #[must_use]
    pub fn stats(&self) -> CircuitBreakerStats {
        let s = self.lock();
        let now = Instant::now();

        let mut latencies: Vec<u64> = Vec::new();
        let mut failures = 0usize;
        for sample in s.window(self.config.monitoring_period, now) {
            latencies.push(sample.duration.as_millis() as u64);
            if !sample.success {
                failures += 1;
            }
        }
        latencies.sort_unstable();

        let window_requests = latencies.len();
        let (failure_rate, average_latency_ms) = if window_requests == 0 {
            (0.0, 0.0)
        } else {
            (
                failures as f64 * 100.0 / window_requests as f64,
                latencies.iter().sum::<u64>() as f64 / window_requests as f64,
            )
        };

        CircuitBreakerStats {
            name: self.name.clone(),
            state: s.state,
            total_requests: s.counters.total,
            successful_requests: s.counters.success,
            failed_requests: s.counters.failure,
            timeouts: s.counters.timeout,
            rejected_requests: s.counters.rejected,
            consecutive_failures: s.consecutive_failures,
            consecutive_successes: s.consecutive_successes,
            window_requests,
            failure_rate,
            average_latency_ms,
            p95_latency_ms: percentile(&latencies, 0.95),
            p99_latency_ms: percentile(&latencies, 0.99),
            half_open_attempts: s.half_open_used,
            opened_at: s.opened_at,
            next_attempt_at: s.next_attempt_wall,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases a half-open probe slot if the guarded future is dropped early.
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.release_probe(true);
        }
    }
}

/// Nearest-rank percentile over sorted values.
fn percentile(sorted: &[u64], p: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (p * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// Named breakers, one per destination host.
#[derive(Clone)]
pub struct CircuitBreakerRegistry {
    breakers: Arc<RwLock<HashMap<String, Arc<CircuitBreaker>>>>,
    defaults: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    #[must_use]
    pub fn new(defaults: CircuitBreakerConfig) -> Self {
        Self {
            breakers: Arc::new(RwLock::new(HashMap::new())),
            defaults,
        }
    }

    #[must_use]
    pub fn defaults(&self) -> &CircuitBreakerConfig {
        &self.defaults
    }

    /// Return the breaker for `name`, creating it with `options` (or the
    /// registry defaults) on first use. Options are ignored for existing
    /// breakers.
    pub async fn get_or_create(
        &self,
        name: &str,
        options: Option<CircuitBreakerConfig>,
    ) -> Arc<CircuitBreaker> {
        {
            let breakers = self.breakers.read().await;
            if let Some(cb) = breakers.get(name) {
                return Arc::clone(cb);
            }
        }

        let mut breakers = self.breakers.write().await;

        // Double-check after acquiring write lock
        if let Some(cb) = breakers.get(name) {
            return Arc::clone(cb);
        }

        let config = options.unwrap_or_else(|| self.defaults.clone());
        let cb = Arc::new(CircuitBreaker::new(name, config));
        breakers.insert(name.to_string(), Arc::clone(&cb));
        tracing::debug!(target: "circuit_breaker", breaker = %name, "Circuit breaker created");
        cb
    }

    pub async fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().await.get(name).cloned()
    }

    /// Stats for every breaker, sorted by name.
    pub async fn statuses(&self) -> Vec<CircuitBreakerStats> {
        let breakers = self.breakers.read().await;
        let mut stats: Vec<CircuitBreakerStats> = breakers.values().map(|cb| cb.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Force-close a breaker.
    pub async fn reset(&self, name: &str) -> WebhookResult<CircuitBreakerStats> {
        let cb = self
            .get(name)
            .await
            .ok_or_else(|| WebhookError::CircuitBreakerNotFound(name.to_string()))?;
        cb.reset();
        Ok(cb.stats())
    }

    pub async fn remove(&self, name: &str) -> bool {
        self.breakers.write().await.remove(name).is_some()
    }

    pub async fn len(&self) -> usize {
        self.breakers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.breakers.read().await.is_empty()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
