//! Outbound HTTP transport.
//!
//! The executor talks to destinations through the [`Transport`] trait so the
//! delivery logic can be exercised without a network. [`HttpTransport`] is
//! the production implementation on top of `reqwest`.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;

use crate::error::{DeliveryError, WebhookError};

/// A single POST to a destination.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
    pub timeout: Duration,
}

/// Any HTTP response, successful or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

impl TransportResponse {
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Sends webhook requests.
///
/// Implementations return `Ok` for every HTTP response regardless of status
/// and reserve `Err` for requests that got no response.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post(&self, request: OutboundRequest) -> Result<TransportResponse, DeliveryError>;
}

/// `reqwest` transport with redirects disabled.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    max_body_chars: usize,
}

impl HttpTransport {
    /// Build a transport with its own HTTP client.
    ///
    /// # Errors
    ///
    /// Returns `WebhookError::Internal` if the HTTP client cannot be built.
    pub fn new(user_agent: &str, max_body_chars: usize) -> Result<Self, WebhookError> {
        let client = Client::builder()
            .user_agent(user_agent)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| WebhookError::Internal(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self::with_client(client, max_body_chars))
    }

    /// Use an existing client.
    #[must_use]
    pub fn with_client(client: Client, max_body_chars: usize) -> Self {
        Self {
            client,
            max_body_chars,
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(&self, request: OutboundRequest) -> Result<TransportResponse, DeliveryError> {
        let headers = to_header_map(&request.headers);
        let timeout_ms = request.timeout.as_millis() as u64;

        let response = self
            .client
            .post(&request.url)
            .headers(headers)
            .timeout(request.timeout)
            .body(request.body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DeliveryError::Timeout { timeout_ms }
                } else if e.is_connect() {
                    DeliveryError::Network(format!("Connection failed: {e}"))
                } else {
                    DeliveryError::Network(format!("Request error: {e}"))
                }
            })?;

        let status = response.status().as_u16();
        let body = read_excerpt(response, self.max_body_chars).await;

        Ok(TransportResponse { status, body })
    }
}

/// Read at most `max_chars` characters of the body. Streaming stops once
/// enough bytes for `max_chars` UTF-8 characters have arrived; a body that
/// fails mid-stream keeps what was read.
async fn read_excerpt(mut response: reqwest::Response, max_chars: usize) -> String {
    let byte_limit = max_chars.saturating_mul(4);
    let mut bytes: Vec<u8> = Vec::new();
    while bytes.len() < byte_limit {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                let take = chunk.len().min(byte_limit - bytes.len());
                bytes.extend_from_slice(&chunk[..take]);
            }
            Ok(None) | Err(_) => break,
        }
    }
    String::from_utf8_lossy(&bytes)
        .chars()
        .take(max_chars)
        .collect()
}

/// Convert a header snapshot into a `HeaderMap`, skipping entries that are
/// not valid HTTP headers.
fn to_header_map(headers: &BTreeMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                map.insert(name, value);
            }
            _ => {
                tracing::warn!(
                    target: "webhook_delivery",
                    header = %name,
                    "Skipping invalid header"
                );
            }
        }
    }
    map
}
