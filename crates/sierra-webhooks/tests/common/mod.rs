//! Common test utilities for sierra-webhooks integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sierra_core::{AttemptId, OrganizationId};
use sierra_webhooks::config::{DeliveryConfig, SchedulerConfig, WebhookConfig};
use sierra_webhooks::{AttemptOutcome, InMemoryStore, WebhookDestination, WebhookEngine};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

pub const HOOK_PATH: &str = "/hook";
pub const EVENT_TYPE: &str = "contact.updated";

/// A request as seen by the mock endpoint.
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl CapturedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap()
    }
}

/// Records every request and answers 200.
#[derive(Clone, Default)]
pub struct CaptureResponder {
    captured: Arc<Mutex<Vec<CapturedRequest>>>,
}

impl CaptureResponder {
    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.captured.lock().unwrap().clone()
    }
}

impl Respond for CaptureResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let headers = request
            .headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    value.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect();
        self.captured.lock().unwrap().push(CapturedRequest {
            headers,
            body: request.body.clone(),
        });
        ResponseTemplate::new(200).set_body_string("ok")
    }
}

/// Answers a fixed status and counts calls.
#[derive(Clone)]
pub struct CountingResponder {
    status: u16,
    calls: Arc<AtomicUsize>,
}

impl CountingResponder {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Respond for CountingResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        self.calls.fetch_add(1, Ordering::SeqCst);
        ResponseTemplate::new(self.status).set_body_string("upstream says no")
    }
}

/// Fails with `status` for the first `failures` calls, then answers 200.
#[derive(Clone)]
pub struct FailingResponder {
    failures: usize,
    status: u16,
    calls: Arc<AtomicUsize>,
}

impl FailingResponder {
    pub fn fail_times(failures: usize) -> Self {
        Self {
            failures,
            status: 503,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Respond for FailingResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            ResponseTemplate::new(self.status)
        } else {
            ResponseTemplate::new(200)
        }
    }
}

/// Answers 200 after `delay`.
#[derive(Clone)]
pub struct DelayedResponder {
    delay: Duration,
    calls: Arc<AtomicUsize>,
}

impl DelayedResponder {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Respond for DelayedResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        self.calls.fetch_add(1, Ordering::SeqCst);
        ResponseTemplate::new(200).set_delay(self.delay)
    }
}

/// Mount `responder` on `POST /hook`.
pub async fn mount<R: Respond + 'static>(server: &MockServer, responder: R) {
    Mock::given(method("POST"))
        .and(path(HOOK_PATH))
        .respond_with(responder)
        .mount(server)
        .await;
}

/// Config with immediate retries, no jitter and a fast scheduler.
pub fn fast_config() -> WebhookConfig {
    WebhookConfig::default()
        .with_scheduler(
            SchedulerConfig::default()
                .with_poll_interval(Duration::from_millis(20))
                .with_concurrency(4),
        )
        .with_delivery(
            DeliveryConfig::default()
                .with_default_retry_delays(vec![Duration::ZERO])
                .with_jitter_ratio(0.0)
                .with_default_timeout(Duration::from_secs(2)),
        )
}

/// Route engine logs to the test harness. `RUST_LOG` narrows the output.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("sierra_webhooks=debug")),
        )
        .try_init();
}

pub fn build_engine(store: &Arc<InMemoryStore>, config: WebhookConfig) -> WebhookEngine {
    init_test_logging();
    WebhookEngine::builder(config)
        .with_store(store.clone())
        .build()
        .unwrap()
}

/// Destination on the mock server subscribed to [`EVENT_TYPE`].
pub fn destination_for(server: &MockServer, organization_id: OrganizationId) -> WebhookDestination {
    WebhookDestination::new(organization_id, format!("{}{}", server.uri(), HOOK_PATH))
        .with_event_type(EVENT_TYPE)
}

/// Breaker name the engine uses for the mock server.
pub fn breaker_name(server: &MockServer) -> String {
    let address = server.address();
    format!("{}:{}", address.ip(), address.port())
}

/// Send one event and return the single scheduled attempt id.
pub async fn send_one(engine: &WebhookEngine, organization_id: OrganizationId) -> AttemptId {
    let summary = engine
        .send(
            organization_id,
            EVENT_TYPE,
            serde_json::json!({"contact_id": 42, "email": "ada@example.com"}),
            None,
        )
        .await
        .unwrap();
    assert_eq!(summary.scheduled.len(), 1, "expected one scheduled attempt");
    summary.scheduled[0]
}

/// Execute `attempt_id` until it reaches a terminal outcome.
pub async fn drive(engine: &WebhookEngine, attempt_id: AttemptId) -> Vec<AttemptOutcome> {
    let mut outcomes = Vec::new();
    for _ in 0..20 {
        let outcome = engine.executor().execute(attempt_id).await.unwrap();
        let done = outcome.is_terminal() || outcome == AttemptOutcome::Skipped;
        outcomes.push(outcome);
        if done {
            return outcomes;
        }
    }
    panic!("attempt {attempt_id} did not finish: {outcomes:?}");
}
