//! Engine configuration.
//!
//! Every tunable has a typed field with a named default. Configuration can
//! be built in code with the `with_*` methods or loaded from `SIERRA_WEBHOOK_*`
//! environment variables.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::WebhookError;
use crate::rate_limiter::RateLimitConfig;

/// Default user agent sent with every delivery.
pub const DEFAULT_USER_AGENT: &str = "Sierra-Webhooks/1.0";

/// Default per-request timeout when a destination does not set one.
pub const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Default maximum delivery attempts (initial + 4 retries).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default backoff schedule in seconds: 1min, 5min, 30min, 2hr, 24hr.
pub const DEFAULT_RETRY_DELAYS_SECS: [u64; 5] = [60, 300, 1800, 7200, 86400];

/// Default jitter applied to retry delays (±25%).
pub const DEFAULT_JITTER_RATIO: f64 = 0.25;

/// Default number of response body characters kept on an attempt.
pub const DEFAULT_RESPONSE_EXCERPT_LIMIT: usize = 1024;

/// Default retention for in-memory daily metrics.
pub const DEFAULT_METRICS_RETENTION_DAYS: u32 = 90;

/// Upper bound for metrics retention.
pub const MAX_METRICS_RETENTION_DAYS: u32 = 3650;

/// Retry scheduler settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Time between coordinator ticks.
    pub poll_interval: Duration,
    /// Maximum attempts drained per tick.
    pub batch_size: usize,
    /// Maximum attempts executing at once.
    pub concurrency: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            batch_size: 10,
            concurrency: 4,
        }
    }
}

impl SchedulerConfig {
    /// Set the time between scheduler ticks.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the maximum attempts drained per tick.
    #[must_use]
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Set the worker pool size.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }
}

/// Per-delivery defaults and retry policy knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryConfig {
    /// `User-Agent` header value.
    pub user_agent: String,
    /// Timeout used when a destination has none.
    pub default_timeout: Duration,
    /// Max attempts used when a destination has none.
    pub default_max_attempts: u32,
    /// Retry delays used when a destination has none.
    pub default_retry_delays: Vec<Duration>,
    /// Jitter ratio; delays are scaled by a uniform factor in `1 ± ratio`.
    pub jitter_ratio: f64,
    /// Response body characters kept on the attempt record.
    pub response_excerpt_limit: usize,
    /// Whether a circuit-open rejection consumes a retry slot.
    ///
    /// When `false` the attempt is re-queued for the breaker's retry time
    /// with the same attempt number.
    pub circuit_open_consumes_attempt: bool,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            default_timeout: DEFAULT_DELIVERY_TIMEOUT,
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
            default_retry_delays: DEFAULT_RETRY_DELAYS_SECS
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
            jitter_ratio: DEFAULT_JITTER_RATIO,
            response_excerpt_limit: DEFAULT_RESPONSE_EXCERPT_LIMIT,
            circuit_open_consumes_attempt: true,
        }
    }
}

impl DeliveryConfig {
    /// Set the `User-Agent` header value.
    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Set the request timeout for destinations without one.
    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Set the maximum attempts for destinations without one.
    #[must_use]
    pub fn with_default_max_attempts(mut self, max: u32) -> Self {
        self.default_max_attempts = max;
        self
    }

    /// Set the backoff schedule for destinations without one.
    #[must_use]
    pub fn with_default_retry_delays(mut self, delays: Vec<Duration>) -> Self {
        self.default_retry_delays = delays;
        self
    }

    /// Set the jitter ratio applied to retry delays.
    #[must_use]
    pub fn with_jitter_ratio(mut self, ratio: f64) -> Self {
        self.jitter_ratio = ratio;
        self
    }

    /// Set how many response body characters are kept.
    #[must_use]
    pub fn with_response_excerpt_limit(mut self, limit: usize) -> Self {
        self.response_excerpt_limit = limit;
        self
    }

    /// Set whether a circuit-open rejection uses up an attempt.
    #[must_use]
    pub fn with_circuit_open_consumes_attempt(mut self, consumes: bool) -> Self {
        self.circuit_open_consumes_attempt = consumes;
        self
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookConfig {
    pub scheduler: SchedulerConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub rate_limit: RateLimitConfig,
    pub delivery: DeliveryConfig,
    /// Days of daily metrics kept in memory.
    pub metrics_retention_days: u32,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            rate_limit: RateLimitConfig::default(),
            delivery: DeliveryConfig::default(),
            metrics_retention_days: DEFAULT_METRICS_RETENTION_DAYS,
        }
    }
}

impl WebhookConfig {
    /// Set the retry scheduler settings.
    #[must_use]
    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Set the circuit breaker settings.
    #[must_use]
    pub fn with_circuit_breaker(mut self, circuit_breaker: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = circuit_breaker;
        self
    }

    /// Set the rate limit settings.
    #[must_use]
    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    /// Set the delivery defaults.
    #[must_use]
    pub fn with_delivery(mut self, delivery: DeliveryConfig) -> Self {
        self.delivery = delivery;
        self
    }

    /// Set how many days of metrics are kept in memory.
    #[must_use]
    pub fn with_metrics_retention_days(mut self, days: u32) -> Self {
        self.metrics_retention_days = days;
        self
    }

    /// Load configuration from environment variables.
    ///
    /// All variables are optional; unset variables keep their defaults.
    ///
    /// - `SIERRA_WEBHOOK_POLL_INTERVAL_MS`, `SIERRA_WEBHOOK_BATCH_SIZE`, `SIERRA_WEBHOOK_CONCURRENCY`
    /// - `SIERRA_WEBHOOK_CB_TIMEOUT_MS`, `SIERRA_WEBHOOK_CB_ERROR_THRESHOLD`,
    ///   `SIERRA_WEBHOOK_CB_ERROR_PERCENTAGE`, `SIERRA_WEBHOOK_CB_RESET_TIMEOUT_MS`,
    ///   `SIERRA_WEBHOOK_CB_MONITORING_PERIOD_MS`, `SIERRA_WEBHOOK_CB_MINIMUM_REQUESTS`,
    ///   `SIERRA_WEBHOOK_CB_HALF_OPEN_MAX_ATTEMPTS`
    /// - `SIERRA_WEBHOOK_RATE_LIMIT_ENABLED`, `SIERRA_WEBHOOK_RATE_LIMIT_MAX`,
    ///   `SIERRA_WEBHOOK_RATE_LIMIT_WINDOW_MS`
    /// - `SIERRA_WEBHOOK_USER_AGENT`, `SIERRA_WEBHOOK_TIMEOUT_MS`, `SIERRA_WEBHOOK_MAX_ATTEMPTS`,
    ///   `SIERRA_WEBHOOK_RETRY_DELAYS` (comma-separated seconds), `SIERRA_WEBHOOK_JITTER_RATIO`,
    ///   `SIERRA_WEBHOOK_RESPONSE_EXCERPT_LIMIT`, `SIERRA_WEBHOOK_CIRCUIT_OPEN_CONSUMES_ATTEMPT`
    /// - `SIERRA_WEBHOOK_METRICS_RETENTION_DAYS`
    ///
    /// # Errors
    ///
    /// Returns `WebhookError::ConfigInvalid` if a variable cannot be parsed or
    /// the resulting configuration fails validation.
    pub fn from_env() -> Result<Self, WebhookError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, WebhookError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(&lookup);
        let mut config = Self::default();

        if let Some(ms) = vars.parse::<u64>("SIERRA_WEBHOOK_POLL_INTERVAL_MS")? {
            config.scheduler.poll_interval = Duration::from_millis(ms);
        }
        if let Some(v) = vars.parse("SIERRA_WEBHOOK_BATCH_SIZE")? {
            config.scheduler.batch_size = v;
        }
        if let Some(v) = vars.parse("SIERRA_WEBHOOK_CONCURRENCY")? {
            config.scheduler.concurrency = v;
        }

        let cb = &mut config.circuit_breaker;
        if let Some(ms) = vars.parse::<u64>("SIERRA_WEBHOOK_CB_TIMEOUT_MS")? {
            cb.timeout = Duration::from_millis(ms);
        }
        if let Some(v) = vars.parse("SIERRA_WEBHOOK_CB_ERROR_THRESHOLD")? {
            cb.error_threshold = v;
        }
        if let Some(v) = vars.parse("SIERRA_WEBHOOK_CB_ERROR_PERCENTAGE")? {
            cb.error_threshold_percentage = v;
        }
        if let Some(ms) = vars.parse::<u64>("SIERRA_WEBHOOK_CB_RESET_TIMEOUT_MS")? {
            cb.reset_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = vars.parse::<u64>("SIERRA_WEBHOOK_CB_MONITORING_PERIOD_MS")? {
            cb.monitoring_period = Duration::from_millis(ms);
        }
        if let Some(v) = vars.parse("SIERRA_WEBHOOK_CB_MINIMUM_REQUESTS")? {
            cb.minimum_requests = v;
        }
        if let Some(v) = vars.parse("SIERRA_WEBHOOK_CB_HALF_OPEN_MAX_ATTEMPTS")? {
            cb.half_open_max_attempts = v;
        }

        if let Some(v) = vars.parse("SIERRA_WEBHOOK_RATE_LIMIT_ENABLED")? {
            config.rate_limit.enabled = v;
        }
        if let Some(v) = vars.parse("SIERRA_WEBHOOK_RATE_LIMIT_MAX")? {
            config.rate_limit.max_per_window = v;
        }
        if let Some(ms) = vars.parse::<u64>("SIERRA_WEBHOOK_RATE_LIMIT_WINDOW_MS")? {
            config.rate_limit.window = Duration::from_millis(ms);
        }

        let delivery = &mut config.delivery;
        if let Some(v) = vars.get("SIERRA_WEBHOOK_USER_AGENT") {
            delivery.user_agent = v;
        }
        if let Some(ms) = vars.parse::<u64>("SIERRA_WEBHOOK_TIMEOUT_MS")? {
            delivery.default_timeout = Duration::from_millis(ms);
        }
        if let Some(v) = vars.parse("SIERRA_WEBHOOK_MAX_ATTEMPTS")? {
            delivery.default_max_attempts = v;
        }
        if let Some(delays) = vars.seconds_list("SIERRA_WEBHOOK_RETRY_DELAYS")? {
            delivery.default_retry_delays = delays;
        }
        if let Some(v) = vars.parse("SIERRA_WEBHOOK_JITTER_RATIO")? {
            delivery.jitter_ratio = v;
        }
        if let Some(v) = vars.parse("SIERRA_WEBHOOK_RESPONSE_EXCERPT_LIMIT")? {
            delivery.response_excerpt_limit = v;
        }
        if let Some(v) = vars.parse("SIERRA_WEBHOOK_CIRCUIT_OPEN_CONSUMES_ATTEMPT")? {
            delivery.circuit_open_consumes_attempt = v;
        }

        if let Some(v) = vars.parse("SIERRA_WEBHOOK_METRICS_RETENTION_DAYS")? {
            config.metrics_retention_days = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), WebhookError> {
        fn invalid(var: &str, reason: &str) -> Result<(), WebhookError> {
            Err(WebhookError::ConfigInvalid {
                var: var.to_string(),
                reason: reason.to_string(),
            })
        }

        if self.scheduler.batch_size == 0 {
            return invalid("SIERRA_WEBHOOK_BATCH_SIZE", "must be at least 1");
        }
        if self.scheduler.concurrency == 0 {
            return invalid("SIERRA_WEBHOOK_CONCURRENCY", "must be at least 1");
        }
        if self.scheduler.poll_interval.is_zero() {
            return invalid("SIERRA_WEBHOOK_POLL_INTERVAL_MS", "must be positive");
        }
        if !(0.0..=100.0).contains(&self.circuit_breaker.error_threshold_percentage) {
            return invalid("SIERRA_WEBHOOK_CB_ERROR_PERCENTAGE", "must be within 0..=100");
        }
        if self.circuit_breaker.half_open_max_attempts == 0 {
            return invalid("SIERRA_WEBHOOK_CB_HALF_OPEN_MAX_ATTEMPTS", "must be at least 1");
        }
        if self.circuit_breaker.timeout.is_zero() {
            return invalid("SIERRA_WEBHOOK_CB_TIMEOUT_MS", "must be positive");
        }
        if self.rate_limit.window.is_zero() {
            return invalid("SIERRA_WEBHOOK_RATE_LIMIT_WINDOW_MS", "must be positive");
        }
        if self.delivery.default_max_attempts == 0 {
            return invalid("SIERRA_WEBHOOK_MAX_ATTEMPTS", "must be at least 1");
        }
        if self.delivery.default_retry_delays.is_empty() {
            return invalid("SIERRA_WEBHOOK_RETRY_DELAYS", "must contain at least one delay");
        }
        if !(0.0..1.0).contains(&self.delivery.jitter_ratio) {
            return invalid("SIERRA_WEBHOOK_JITTER_RATIO", "must be within 0..1");
        }
        if !(1..=MAX_METRICS_RETENTION_DAYS).contains(&self.metrics_retention_days) {
            return invalid(
                "SIERRA_WEBHOOK_METRICS_RETENTION_DAYS",
                "must be within 1..=3650",
            );
        }
        Ok(())
    }
}

struct Vars<'a, F>(&'a F);

impl<F> Vars<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, var: &str) -> Option<String> {
        (self.0)(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, var: &str) -> Result<Option<T>, WebhookError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(var)
            .map(|raw| {
                raw.parse::<T>().map_err(|e| WebhookError::ConfigInvalid {
                    var: var.to_string(),
                    reason: format!("{raw:?}: {e}"),
                })
            })
            .transpose()
    }

    fn seconds_list(&self, var: &str) -> Result<Option<Vec<Duration>>, WebhookError> {
        let Some(raw) = self.get(var) else {
            return Ok(None);
        };
        raw.split(',')
            .map(|part| {
                part.trim()
                    .parse::<u64>()
                    .map(Duration::from_secs)
                    .map_err(|e| WebhookError::ConfigInvalid {
                        var: var.to_string(),
                        reason: format!("{part:?}: {e}"),
                    })
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }
}
