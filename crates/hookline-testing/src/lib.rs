//! Test infrastructure for deterministic hookline tests.
//!
//! [`TestEnv`] wires the real router and delivery engine to an in-memory
//! store and a [`TestClock`], so ingress, dispatch and admin flows run end to
//! end without a database and without waiting on real time.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    body::{to_bytes, Body},
    http::{HeaderMap, Request, StatusCode},
    Router,
};
use hookline_api::{crypto, create_router, ApiConfig, AppState, Environment};
use hookline_core::{storage::memory::MemoryStore, Metrics, Storage, TestClock};
use hookline_delivery::{DeliveryConfig, DeliveryEngine, DispatchOutcome};
use serde_json::Value;
use tower::ServiceExt;

pub mod fixtures;

pub use fixtures::WebhookRequest;

/// Shared secret used by environments unless overridden.
pub const TEST_SECRET: &str = "whsec_test_secret";

/// Worker id used for dispatches driven from tests.
pub const TEST_WORKER: &str = "worker-test";

/// Builder for configuring a [`TestEnv`].
#[derive(Debug, Clone)]
pub struct TestEnvBuilder {
    secret: String,
    environment: Environment,
    lock_timeout: Duration,
    delivery: DeliveryConfig,
}

impl Default for TestEnvBuilder {
    fn default() -> Self {
        Self {
            secret: TEST_SECRET.to_string(),
            environment: Environment::Development,
            lock_timeout: hookline_core::idempotency::DEFAULT_LOCK_TIMEOUT,
            delivery: DeliveryConfig::default(),
        }
    }
}

impl TestEnvBuilder {
    /// Creates a builder with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the webhook secret.
    #[must_use]
    pub fn secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = secret.into();
        self
    }

    /// Sets the deployment environment.
    #[must_use]
    pub fn environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    /// Sets the idempotency lock timeout.
    #[must_use]
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Sets the retry budget of the delivery engine.
    #[must_use]
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.delivery.max_retries = max_retries;
        self
    }

    /// Builds the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the delivery engine rejects its configuration.
    pub fn build(self) -> Result<TestEnv> {
        let clock = TestClock::new();
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        let storage = Storage::in_memory(store.clone());
        let metrics = Arc::new(Metrics::new());

        let engine = DeliveryEngine::new(
            storage.clone(),
            self.delivery,
            metrics.clone(),
            Arc::new(clock.clone()),
        )
        .context("create delivery engine")?;

        let state = AppState::new(
            storage.clone(),
            engine.dead_letters(),
            metrics.clone(),
            Arc::new(clock.clone()),
            ApiConfig {
                webhook_secret: self.secret.clone(),
                environment: self.environment,
                request_timeout: Duration::from_secs(30),
                idempotency_lock_timeout: self.lock_timeout,
            },
        );

        Ok(TestEnv { clock, store, storage, metrics, secret: self.secret, state, engine })
    }
}

/// Complete in-memory service for integration tests.
pub struct TestEnv {
    /// Virtual time shared by storage, dispatchers and handlers.
    pub clock: TestClock,
    /// The backing store, for outage simulation and counts.
    pub store: Arc<MemoryStore>,
    /// Store handles.
    pub storage: Storage,
    /// Metrics registry shared by router and engine.
    pub metrics: Arc<Metrics>,
    /// Webhook secret.
    pub secret: String,
    /// Router state.
    pub state: AppState,
    engine: DeliveryEngine,
}

/// Response captured from the router.
#[derive(Debug)]
pub struct TestResponse {
    /// Status code.
    pub status: StatusCode,
    /// Headers.
    pub headers: HeaderMap,
    /// Body parsed as JSON, or `Null` when empty or not JSON.
    pub body: Value,
    /// Raw body as text.
    pub text: String,
}

impl TestEnv {
    /// Environment with default settings.
    ///
    /// # Errors
    ///
    /// Returns an error if setup fails.
    pub fn new() -> Result<Self> {
        TestEnvBuilder::new().build()
    }

    /// Starts configuring an environment.
    pub fn builder() -> TestEnvBuilder {
        TestEnvBuilder::new()
    }

    /// Router over this environment's state.
    pub fn router(&self) -> Router {
        create_router(self.state.clone())
    }

    /// Hex signature of `body` under the environment secret.
    pub fn sign(&self, body: &[u8]) -> String {
        crypto::sign(self.secret.as_bytes(), body).expect("HMAC accepts any key length")
    }

    /// Signed ingest request for `body`.
    pub fn signed_request(&self, key: &str, destination: &str, body: &Value) -> Request<Body> {
        WebhookRequest::new(body).key(key).destination(destination).build(&self.secret)
    }

    /// Sends a request through the router.
    ///
    /// # Errors
    ///
    /// Returns an error if the body cannot be read.
    pub async fn send(&self, request: Request<Body>) -> Result<TestResponse> {
        let response = self.router().oneshot(request).await?;
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.context("read body")?;
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        let text = String::from_utf8_lossy(&bytes).into_owned();

        Ok(TestResponse { status, headers, body, text })
    }

    /// Sends a request with no body.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be built or sent.
    pub async fn call(&self, method: &str, uri: &str) -> Result<TestResponse> {
        let request = Request::builder().method(method).uri(uri).body(Body::empty())?;
        self.send(request).await
    }

    /// Sends a JSON body.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be built or sent.
    pub async fn call_json(&self, method: &str, uri: &str, body: &Value) -> Result<TestResponse> {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))?;
        self.send(request).await
    }

    /// Runs one dispatcher iteration on virtual time.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn dispatch_next(&self) -> Result<Option<DispatchOutcome>> {
        Ok(self.engine.dispatcher(TEST_WORKER).process_next().await?)
    }

    /// Dispatches until the queue is empty and returns every outcome.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn drain(&self) -> Result<Vec<DispatchOutcome>> {
        let mut outcomes = Vec::new();
        while let Some(outcome) = self.dispatch_next().await? {
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Starts a wiremock server for destinations.
    pub async fn destination(&self) -> wiremock::MockServer {
        wiremock::MockServer::start().await
    }
}
