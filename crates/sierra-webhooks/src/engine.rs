//! Wiring for the delivery engine.
//!
//! [`WebhookEngine`] owns one instance of every component and shares them
//! between the dispatcher, the executor, the scheduler and the operator API.

use std::sync::Arc;

use axum::Router;
use sierra_core::{DestinationId, OrganizationId};

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::config::WebhookConfig;
use crate::dispatcher::{DispatchSummary, WebhookDispatcher};
use crate::error::{WebhookError, WebhookResult};
use crate::events::DeliveryNotifier;
use crate::executor::AttemptExecutor;
use crate::metrics::MetricsRecorder;
use crate::queue::RetryQueue;
use crate::rate_limiter::RateLimiter;
use crate::router::{webhooks_router, WebhooksState};
use crate::scheduler::RetryScheduler;
use crate::store::{DeliveryStore, DestinationStore, MetricsSink};
use crate::transport::{HttpTransport, Transport};

/// Builder for [`WebhookEngine`].
pub struct WebhookEngineBuilder {
    config: WebhookConfig,
    destinations: Option<Arc<dyn DestinationStore>>,
    deliveries: Option<Arc<dyn DeliveryStore>>,
    metrics_sink: Option<Arc<dyn MetricsSink>>,
    transport: Option<Arc<dyn Transport>>,
}

impl WebhookEngineBuilder {
    /// Use one backend for destinations, attempts and durable metrics.
    pub fn with_store<S>(mut self, store: Arc<S>) -> Self
    where
        S: DestinationStore + DeliveryStore + MetricsSink + 'static,
    {
        self.destinations = Some(store.clone() as Arc<dyn DestinationStore>);
        self.deliveries = Some(store.clone() as Arc<dyn DeliveryStore>);
        self.metrics_sink = Some(store as Arc<dyn MetricsSink>);
        self
    }

    pub fn with_destinations(mut self, store: Arc<dyn DestinationStore>) -> Self {
        self.destinations = Some(store);
        self
    }

    pub fn with_deliveries(mut self, store: Arc<dyn DeliveryStore>) -> Self {
        self.deliveries = Some(store);
        self
    }

    pub fn with_metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics_sink = Some(sink);
        self
    }

    /// Replace the default reqwest transport.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Validate the configuration and wire every component.
    ///
    /// # Errors
    ///
    /// Fails on invalid configuration, a missing store or if the HTTP client
    /// cannot be built.
    pub fn build(self) -> WebhookResult<WebhookEngine> {
        let config = self.config;
        config.validate()?;

        let destinations = self
            .destinations
            .ok_or_else(|| WebhookError::Internal("destination store not configured".into()))?;
        let deliveries = self
            .deliveries
            .ok_or_else(|| WebhookError::Internal("delivery store not configured".into()))?;

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(
                &config.delivery.user_agent,
                config.delivery.response_excerpt_limit,
            )?),
        };

        let registry = CircuitBreakerRegistry::new(config.circuit_breaker.clone());
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        let queue = Arc::new(RetryQueue::new());
        let notifier = DeliveryNotifier::default();
        let metrics = Arc::new(match self.metrics_sink {
            Some(sink) => MetricsRecorder::new().with_sink(sink),
            None => MetricsRecorder::new(),
        });

        let executor = Arc::new(AttemptExecutor::new(
            deliveries.clone(),
            destinations.clone(),
            transport,
            registry.clone(),
            queue.clone(),
            metrics.clone(),
            notifier.clone(),
            config.delivery.clone(),
        ));

        let dispatcher = WebhookDispatcher::new(
            destinations,
            deliveries.clone(),
            rate_limiter.clone(),
            queue.clone(),
            metrics.clone(),
            notifier.clone(),
            config.delivery.clone(),
        );

        let scheduler = RetryScheduler::new(
            executor.clone(),
            deliveries.clone(),
            queue.clone(),
            rate_limiter.clone(),
            metrics.clone(),
            config.scheduler.clone(),
            config.metrics_retention_days,
        );

        Ok(WebhookEngine {
            config,
            dispatcher,
            executor,
            scheduler,
            registry,
            rate_limiter,
            queue,
            metrics,
            notifier,
            deliveries,
        })
    }
}

/// The assembled delivery engine.
pub struct WebhookEngine {
    config: WebhookConfig,
    dispatcher: WebhookDispatcher,
    executor: Arc<AttemptExecutor>,
    scheduler: RetryScheduler,
    registry: CircuitBreakerRegistry,
    rate_limiter: Arc<RateLimiter>,
    queue: Arc<RetryQueue>,
    metrics: Arc<MetricsRecorder>,
    notifier: DeliveryNotifier,
    deliveries: Arc<dyn DeliveryStore>,
}

impl WebhookEngine {
    #[must_use]
    pub fn builder(config: WebhookConfig) -> WebhookEngineBuilder {
        WebhookEngineBuilder {
            config,
            destinations: None,
            deliveries: None,
            metrics_sink: None,
            transport: None,
        }
    }

    /// Schedule delivery of an event. See [`WebhookDispatcher::send`].
    ///
    /// # Errors
    ///
    /// Fails if destinations cannot be resolved or the payload cannot be
    /// serialized.
    pub async fn send(
        &self,
        organization_id: OrganizationId,
        event_type: &str,
        data: serde_json::Value,
        destination_id: Option<DestinationId>,
    ) -> WebhookResult<DispatchSummary> {
        self.dispatcher
            .send(organization_id, event_type, data, destination_id)
            .await
    }

    /// Re-queue stored pending attempts and start the scheduler. Returns
    /// false if the scheduler was already running.
    ///
    /// # Errors
    ///
    /// Returns the store error if pending attempts cannot be loaded.
    pub async fn start(&self) -> WebhookResult<bool> {
        if self.scheduler.is_running() {
            return Ok(false);
        }
        self.scheduler.recover_pending().await?;
        Ok(self.scheduler.start())
    }

    /// Stop the scheduler and wait for in-flight deliveries to finish.
    pub async fn shutdown(&self) {
        self.scheduler.stop().await;
        self.scheduler.wait_idle().await;
    }

    /// Operator API router over this engine's state.
    pub fn router(&self) -> Router {
        webhooks_router(WebhooksState::new(
            self.registry.clone(),
            self.deliveries.clone(),
            self.metrics.clone(),
            self.queue.clone(),
        ))
    }

    #[must_use]
    pub fn config(&self) -> &WebhookConfig {
        &self.config
    }

    #[must_use]
    pub fn dispatcher(&self) -> &WebhookDispatcher {
        &self.dispatcher
    }

    #[must_use]
    pub fn executor(&self) -> &Arc<AttemptExecutor> {
        &self.executor
    }

    #[must_use]
    pub fn scheduler(&self) -> &RetryScheduler {
        &self.scheduler
    }

    #[must_use]
    pub fn registry(&self) -> &CircuitBreakerRegistry {
        &self.registry
    }

    #[must_use]
    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    #[must_use]
    pub fn queue(&self) -> &Arc<RetryQueue> {
        &self.queue
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<MetricsRecorder> {
        &self.metrics
    }

    #[must_use]
    pub fn notifier(&self) -> &DeliveryNotifier {
        &self.notifier
    }
}
