//! Poll loop that claims events and drives them to a terminal state.
//!
//! A [`Dispatcher`] claims one event at a time, waits for a rate-limit token,
//! runs the delivery under the retry engine and then either marks the event
//! delivered or parks it in the dead-letter queue. The idempotency key of the
//! event is finalized last so replays see the terminal outcome.

use std::{sync::Arc, time::Duration};

use hookline_core::{
    metrics::names, Clock, CoreError, DeadLetterId, Event, FailureLedger, IdempotencyCoordinator,
    KeyOutcome, Metrics, Storage,
};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    attempt_log::{AttemptLogger, AttemptRequest, AttemptResult},
    client::{DeliveryClient, DeliveryRequest, DeliveryResponse},
    dead_letter::DeadLetterManager,
    error::{DeliveryError, Result},
    rate_limit::TokenBucket,
    retry::RetryEngine,
};

/// Pause after a loop iteration failed outside the retry engine.
pub const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Everything a dispatcher needs, shared by all dispatchers of an engine.
pub struct DispatchContext {
    /// Stores.
    pub storage: Storage,
    /// Outbound HTTP client.
    pub client: Arc<DeliveryClient>,
    /// Process-wide token bucket.
    pub rate_limiter: Arc<TokenBucket>,
    /// Retry policy for one event.
    pub retry: RetryEngine,
    /// Finalizes idempotency keys.
    pub idempotency: IdempotencyCoordinator,
    /// Parks exhausted events.
    pub dead_letters: DeadLetterManager,
    /// Audit trail.
    pub attempts: AttemptLogger,
    /// Process metrics.
    pub metrics: Arc<Metrics>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
    /// Idle wait between empty polls.
    pub poll_interval: Duration,
    /// Age after which another worker's claim may be taken over.
    pub claim_stale_after: Duration,
}

impl std::fmt::Debug for DispatchContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchContext")
            .field("retry", &self.retry)
            .field("poll_interval", &self.poll_interval)
            .field("claim_stale_after", &self.claim_stale_after)
            .finish_non_exhaustive()
    }
}

/// How one claimed event ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The destination accepted the event.
    Delivered,
    /// Retries ran out and the event was dead-lettered.
    DeadLettered(DeadLetterId),
    /// The claim was taken over by another worker before the event could be
    /// marked; that worker owns the outcome.
    ClaimLost,
}

/// Sequential claim-and-deliver loop.
#[derive(Debug)]
pub struct Dispatcher {
    worker_id: String,
    ctx: Arc<DispatchContext>,
    cancel: CancellationToken,
}

impl Dispatcher {
    /// Creates a dispatcher identified by `worker_id` in claims.
    pub fn new(
        worker_id: impl Into<String>,
        ctx: Arc<DispatchContext>,
        cancel: CancellationToken,
    ) -> Self {
        Self { worker_id: worker_id.into(), ctx, cancel }
    }

    /// Identifier written to `locked_by`.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Polls until cancelled. An event in flight when cancellation arrives is
    /// finished first.
    ///
    /// # Errors
    ///
    /// Never fails; errors from single events are logged and the loop backs
    /// off before polling again.
    pub async fn run(&self) -> Result<()> {
        info!(worker_id = %self.worker_id, "dispatcher starting");

        loop {
            if self.cancel.is_cancelled() {
                info!(worker_id = %self.worker_id, "dispatcher received shutdown signal");
                break;
            }

            match self.process_next().await {
                Ok(Some(_)) => {},
                Ok(None) => {
                    tokio::select! {
                        () = self.ctx.clock.sleep(self.ctx.poll_interval) => {}
                        () = self.cancel.cancelled() => break,
                    }
                },
                Err(error) => {
                    error!(
                        worker_id = %self.worker_id,
                        error = %error,
                        "dispatcher iteration failed"
                    );
                    tokio::select! {
                        () = self.ctx.clock.sleep(ERROR_BACKOFF) => {}
                        () = self.cancel.cancelled() => break,
                    }
                },
            }
        }

        info!(worker_id = %self.worker_id, "dispatcher stopped");
        Ok(())
    }

    /// Claims and processes at most one event. Returns `None` when nothing
    /// was claimable.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Storage` if claiming or recording the outcome
    /// fails.
    pub async fn process_next(&self) -> Result<Option<DispatchOutcome>> {
        let claimed = self
            .ctx
            .storage
            .events
            .claim_next(self.worker_id.clone(), self.ctx.claim_stale_after)
            .await?;

        match claimed {
            None => Ok(None),
            Some(event) => self.process_event(event).await.map(Some),
        }
    }

    /// Delivers a claimed event and records its terminal state.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Storage` if the outcome cannot be persisted.
    pub async fn process_event(&self, event: Event) -> Result<DispatchOutcome> {
        let span = info_span!(
            "dispatch",
            worker_id = %self.worker_id,
            event_id = %event.id,
            idempotency_key = %event.idempotency_key
        );

        async move {
            let started = self.ctx.clock.now();
            debug!(destination = %event.destination_url, "event claimed");

            self.ctx.rate_limiter.acquire().await;

            let body = serde_json::to_value(event.envelope()).map_err(CoreError::from)?;
            let outcome = self
                .ctx
                .retry
                .execute(|attempt| self.attempt(&event, attempt, body.clone()))
                .await;

            let result = if outcome.succeeded() {
                self.complete(&event).await?
            } else {
                self.dead_letter(&event, outcome.ledger).await?
            };

            let elapsed = self.ctx.clock.now().saturating_duration_since(started);
            match result {
                DispatchOutcome::Delivered => {
                    self.ctx.metrics.record_event_processed("delivered", elapsed);
                    info!(attempts = outcome.attempts, "event delivered");
                },
                DispatchOutcome::DeadLettered(dead_letter_id) => {
                    self.ctx.metrics.record_event_processed("failed", elapsed);
                    warn!(
                        attempts = outcome.attempts,
                        %dead_letter_id,
                        "event failed after exhausting retries"
                    );
                },
                DispatchOutcome::ClaimLost => {
                    self.ctx.metrics.increment(names::EVENTS_PROCESSED_TOTAL, &[(
                        "outcome",
                        "claim_lost",
                    )]);
                },
            }

            Ok(result)
        }
        .instrument(span)
        .await
    }

    /// One POST, logged to the audit trail. Non-2xx responses become errors
    /// so the retry engine counts them as failures.
    async fn attempt(
        &self,
        event: &Event,
        attempt_number: u32,
        body: Value,
    ) -> Result<DeliveryResponse> {
        let request = DeliveryRequest {
            event_id: event.id,
            url: event.destination_url.clone(),
            attempt_number,
            body,
        };
        let started_at = self.ctx.clock.now_utc();
        let result = self.ctx.client.deliver(&request).await;

        let logged = match &result {
            Ok(response) if response.body.is_empty() => {
                AttemptResult::Response {
                    status_code: response.status_code,
                    body: format!("Status: {} {}", response.status_code, response.status_text),
                }
            },
            Ok(response) => AttemptResult::Response {
                status_code: response.status_code,
                body: response.body.clone(),
            },
            Err(error) => AttemptResult::TransportError { message: error.to_string() },
        };
        let audit = AttemptRequest {
            event_id: event.id,
            attempt_number,
            destination_url: request.url.clone(),
            headers: request.headers(),
            body: request.body,
            started_at,
        };
        if let Err(error) = self.ctx.attempts.log(audit, logged).await {
            warn!(attempt = attempt_number, error = %error, "failed to record delivery attempt");
        }

        let response = result?;
        if response.is_success {
            Ok(response)
        } else {
            Err(DeliveryError::http_status(response.status_code, response.status_text))
        }
    }

    async fn complete(&self, event: &Event) -> Result<DispatchOutcome> {
        let marked =
            self.ctx.storage.events.mark_delivered(event.id, self.worker_id.clone()).await?;
        if !marked {
            warn!("claim lost before the event could be marked delivered");
            return Ok(DispatchOutcome::ClaimLost);
        }

        self.ctx.idempotency.complete(KeyOutcome::Processed, &event.idempotency_key).await?;
        Ok(DispatchOutcome::Delivered)
    }

    async fn dead_letter(&self, event: &Event, ledger: FailureLedger) -> Result<DispatchOutcome> {
        let entry = self.ctx.dead_letters.move_to_dead_letter(event, ledger.clone()).await?;

        let marked =
            self.ctx.storage.events.mark_failed(event.id, self.worker_id.clone(), ledger).await?;
        if !marked {
            warn!("claim lost before the event could be marked failed");
            return Ok(DispatchOutcome::ClaimLost);
        }

        self.ctx.idempotency.complete(KeyOutcome::Failed, &event.idempotency_key).await?;
        Ok(DispatchOutcome::DeadLettered(entry.id))
    }
}
