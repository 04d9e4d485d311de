//! Outbound POST of event envelopes to destination URLs.
//!
//! The client reports every HTTP response, including non-2xx ones, as a
//! [`DeliveryResponse`]; only transport failures become errors. Deciding
//! whether a status counts as a failed attempt is left to the caller, which
//! also needs the response for the audit trail.

use std::{collections::HashMap, time::Duration};

use hookline_core::EventId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info_span, Instrument};

use crate::error::{DeliveryError, Result};

/// Header carrying the event id on outbound requests.
pub const EVENT_ID_HEADER: &str = "X-Hookline-Event-Id";

/// Header carrying the 1-based attempt number on outbound requests.
pub const ATTEMPT_HEADER: &str = "X-Hookline-Delivery-Attempt";

/// Largest response body read into memory.
const MAX_RESPONSE_BODY_SIZE: usize = 64 * 1024;

/// Timeout, user agent and redirect policy for destination calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Timeout for one HTTP request.
    pub timeout: Duration,
    /// Sent as `User-Agent` on every delivery.
    pub user_agent: String,
    /// Redirects followed before the attempt fails.
    pub max_redirects: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(crate::DEFAULT_TIMEOUT_SECONDS),
            user_agent: concat!("hookline/", env!("CARGO_PKG_VERSION")).to_string(),
            max_redirects: 3,
        }
    }
}

/// One outbound delivery.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    /// Event being delivered.
    pub event_id: EventId,
    /// Destination URL.
    pub url: String,
    /// 1-based attempt number.
    pub attempt_number: u32,
    /// JSON body, usually the event envelope.
    pub body: Value,
}

impl DeliveryRequest {
    /// Headers sent with this request, as recorded in the audit trail.
    pub fn headers(&self) -> HashMap<String, String> {
        HashMap::from([
            ("Content-Type".to_string(), "application/json".to_string()),
            (EVENT_ID_HEADER.to_string(), self.event_id.to_string()),
            (ATTEMPT_HEADER.to_string(), self.attempt_number.to_string()),
        ])
    }
}

/// Response from a delivery attempt.
#[derive(Debug, Clone)]
pub struct DeliveryResponse {
    /// HTTP status code.
    pub status_code: u16,
    /// Canonical reason phrase for the status.
    pub status_text: String,
    /// Response body, lossily decoded.
    pub body: String,
    /// Total duration of the request.
    pub duration: Duration,
    /// Whether the status was 2xx.
    pub is_success: bool,
}

/// HTTP client used by dispatchers and dead-letter retries.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
    config: ClientConfig,
}

impl DeliveryClient {
    /// Builds the underlying reqwest client from `config`.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the HTTP client cannot
    /// be built.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects as usize))
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config })
    }

    /// Client with the 30 second default timeout.
    ///
    /// # Errors
    ///
    /// See [`DeliveryClient::new`].
    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    /// POSTs the request body to its destination.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` when the request exceeds the configured timeout and
    /// `NetworkError` for any other transport failure.
    pub async fn deliver(&self, request: &DeliveryRequest) -> Result<DeliveryResponse> {
        let span = info_span!(
            "webhook_delivery",
            event_id = %request.event_id,
            url = %request.url,
            attempt = request.attempt_number
        );

        async move {
            let start_time = std::time::Instant::now();

            let response = self
                .client
                .post(&request.url)
                .header(EVENT_ID_HEADER, request.event_id.to_string())
                .header(ATTEMPT_HEADER, request.attempt_number.to_string())
                .json(&request.body)
                .send()
                .await
                .map_err(|e| {
                    tracing::warn!(
                        duration_ms = start_time.elapsed().as_millis(),
                        error = %e,
                        "request failed"
                    );
                    if e.is_timeout() {
                        DeliveryError::timeout(self.config.timeout.as_secs())
                    } else {
                        DeliveryError::network(e.to_string())
                    }
                })?;

            let status = response.status();
            let body = match read_capped(response, MAX_RESPONSE_BODY_SIZE).await {
                Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to read response body");
                    String::new()
                },
            };
            let duration = start_time.elapsed();

            if status.is_success() {
                tracing::debug!(
                    status = status.as_u16(),
                    duration_ms = duration.as_millis(),
                    "webhook delivered"
                );
            } else {
                tracing::warn!(
                    status = status.as_u16(),
                    duration_ms = duration.as_millis(),
                    "destination rejected delivery"
                );
            }

            Ok(DeliveryResponse {
                status_code: status.as_u16(),
                status_text: status.canonical_reason().unwrap_or_default().to_string(),
                body,
                duration,
                is_success: status.is_success(),
            })
        }
        .instrument(span)
        .await
    }
}

/// Reads at most `limit` bytes of the body. The rest is never pulled off the
/// connection.
async fn read_capped(mut response: reqwest::Response, limit: usize) -> reqwest::Result<Vec<u8>> {
    let mut body = Vec::new();
    while body.len() < limit {
        let Some(chunk) = response.chunk().await? else {
            break;
        };
        let take = chunk.len().min(limit - body.len());
        body.extend_from_slice(&chunk[..take]);
    }
    Ok(body)
}
