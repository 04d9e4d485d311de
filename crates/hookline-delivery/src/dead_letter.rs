//! Dead-letter queue operations.
//!
//! Events whose retry budget ran out are parked here with their failure
//! ledger. Operators list them, retry them once at a time against the
//! original or a replacement destination, or close them by hand. A manual
//! retry that fails counts against a separate budget; once that budget is
//! spent the entry is abandoned and only an operator can close it.
//!
//! A retry claims its entry by moving it to RETRYING. If the outcome is
//! never written, for example because storage failed mid-retry, the claim
//! expires after [`DEFAULT_RETRY_RECLAIM_AFTER`] and the entry can be
//! retried again.

use std::{sync::Arc, time::Duration};

use hookline_core::{
    models::NewDeadLetter,
    storage::{DeadLetterStore, EventStore},
    DeadLetterEntry, DeadLetterId, DeadLetterStatus, Event, EventId, FailureLedger,
};
use serde::Serialize;
use tracing::{info, warn};

use crate::{
    client::{DeliveryClient, DeliveryRequest},
    error::{DeliveryError, Result},
};

/// Default number of failed manual retries before an entry is abandoned.
pub const DEFAULT_DLQ_MAX_RETRIES: i32 = 3;

/// Age after which an unfinished RETRYING claim may be taken over.
pub const DEFAULT_RETRY_RECLAIM_AFTER: Duration = Duration::from_secs(5 * 60);

/// Outcome of a manual retry.
#[derive(Debug, Clone, Serialize)]
pub struct ManualRetry {
    /// Whether the destination accepted the payload.
    pub success: bool,
    /// Failure description when it did not.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Entry after the retry.
    pub entry: DeadLetterEntry,
}

/// Manages dead-letter entries.
#[derive(Clone)]
pub struct DeadLetterManager {
    dead_letters: Arc<dyn DeadLetterStore>,
    events: Arc<dyn EventStore>,
    client: Arc<DeliveryClient>,
    max_retries: i32,
    reclaim_after: Duration,
}

impl DeadLetterManager {
    /// Creates a manager with the default manual retry budget.
    pub fn new(
        dead_letters: Arc<dyn DeadLetterStore>,
        events: Arc<dyn EventStore>,
        client: Arc<DeliveryClient>,
    ) -> Self {
        Self {
            dead_letters,
            events,
            client,
            max_retries: DEFAULT_DLQ_MAX_RETRIES,
            reclaim_after: DEFAULT_RETRY_RECLAIM_AFTER,
        }
    }

    /// Overrides the manual retry budget.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    /// Overrides how long a RETRYING claim is honoured before another
    /// retry may take it over.
    #[must_use]
    pub fn with_reclaim_after(mut self, reclaim_after: Duration) -> Self {
        self.reclaim_after = reclaim_after;
        self
    }

    /// Parks a failed event. Calling this twice for the same event returns
    /// the entry created the first time.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Storage` if the entry cannot be written.
    pub async fn move_to_dead_letter(
        &self,
        event: &Event,
        ledger: FailureLedger,
    ) -> Result<DeadLetterEntry> {
        let entry = self
            .dead_letters
            .insert(NewDeadLetter {
                original_event_id: event.id,
                idempotency_key: event.idempotency_key.clone(),
                payload: event.envelope().clone(),
                error_details: ledger,
            })
            .await?;

        warn!(
            event_id = %event.id,
            dead_letter_id = %entry.id,
            idempotency_key = %event.idempotency_key,
            "event moved to dead-letter queue"
        );
        Ok(entry)
    }

    /// PENDING entries, oldest failure first.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Storage` on read failure.
    pub async fn pending(&self) -> Result<Vec<DeadLetterEntry>> {
        Ok(self.dead_letters.list_pending().await?)
    }

    /// Loads one entry.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::NotFound` for unknown ids.
    pub async fn get(&self, id: DeadLetterId) -> Result<DeadLetterEntry> {
        self.dead_letters
            .find_by_id(id)
            .await?
            .ok_or_else(|| DeliveryError::not_found(format!("dead-letter entry {id} not found")))
    }

    /// The entry created for an event, if any.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Storage` on read failure.
    pub async fn for_event(&self, event_id: EventId) -> Result<Option<DeadLetterEntry>> {
        Ok(self.dead_letters.find_by_event(event_id).await?)
    }

    /// Makes one delivery attempt for a PENDING entry, or for a RETRYING
    /// entry whose claim is older than the reclaim window.
    ///
    /// Without `destination_url` the original event's destination is used.
    /// Success resolves the entry. Failure returns it to PENDING with one
    /// more failed retry, or abandons it once the budget is spent.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown ids, `InvalidState` if the entry is
    /// closed or another retry holds a live claim, and `Storage` on
    /// persistence failure.
    pub async fn retry(
        &self,
        id: DeadLetterId,
        destination_url: Option<String>,
    ) -> Result<ManualRetry> {
        let entry = self.get(id).await?;
        if matches!(entry.status, DeadLetterStatus::Resolved | DeadLetterStatus::Abandoned) {
            return Err(DeliveryError::invalid_state(format!(
                "dead-letter entry {id} is {} and cannot be retried",
                entry.status
            )));
        }

        let destination = match destination_url {
            Some(url) => url,
            None => self.original_destination(&entry).await?,
        };

        let entry =
            self.dead_letters.begin_retry(id, self.reclaim_after).await?.ok_or_else(|| {
                DeliveryError::invalid_state(format!(
                    "dead-letter entry {id} is already being retried"
                ))
            })?;

        let request = DeliveryRequest {
            event_id: entry.original_event_id,
            url: destination,
            attempt_number: u32::try_from(entry.retry_count + 1).unwrap_or(1),
            body: serde_json::to_value(&entry.payload.0)
                .map_err(|e| DeliveryError::Storage(e.into()))?,
        };

        let failure = match self.client.deliver(&request).await {
            Ok(response) if response.is_success => None,
            Ok(response) => Some(format!("HTTP {}", response.status_code)),
            Err(error) => Some(error.to_string()),
        };

        match failure {
            None => {
                let entry = self.dead_letters.complete_retry(id).await?.ok_or_else(|| {
                    DeliveryError::invalid_state(format!("dead-letter entry {id} left RETRYING"))
                })?;
                info!(dead_letter_id = %id, "dead-letter retry delivered");
                Ok(ManualRetry { success: true, error: None, entry })
            },
            Some(error) => {
                let entry = self.dead_letters.fail_retry(id, self.max_retries).await?.ok_or_else(
                    || DeliveryError::invalid_state(format!("dead-letter entry {id} left RETRYING")),
                )?;
                warn!(
                    dead_letter_id = %id,
                    retry_count = entry.retry_count,
                    status = %entry.status,
                    error = %error,
                    "dead-letter retry failed"
                );
                Ok(ManualRetry { success: false, error: Some(error), entry })
            },
        }
    }

    /// Marks an entry RESOLVED regardless of its status.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown ids.
    pub async fn resolve(&self, id: DeadLetterId) -> Result<DeadLetterEntry> {
        let entry = self
            .dead_letters
            .resolve(id)
            .await?
            .ok_or_else(|| DeliveryError::not_found(format!("dead-letter entry {id} not found")))?;
        info!(dead_letter_id = %id, "dead-letter entry resolved");
        Ok(entry)
    }

    /// Marks an entry ABANDONED regardless of its status.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown ids.
    pub async fn abandon(&self, id: DeadLetterId) -> Result<DeadLetterEntry> {
        let entry = self
            .dead_letters
            .abandon(id)
            .await?
            .ok_or_else(|| DeliveryError::not_found(format!("dead-letter entry {id} not found")))?;
        info!(dead_letter_id = %id, "dead-letter entry abandoned");
        Ok(entry)
    }

    async fn original_destination(&self, entry: &DeadLetterEntry) -> Result<String> {
        let event = self.events.find_by_id(entry.original_event_id).await?.ok_or_else(|| {
            DeliveryError::not_found(format!("event {} not found", entry.original_event_id))
        })?;
        Ok(event.destination_url)
    }
}

impl std::fmt::Debug for DeadLetterManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterManager")
            .field("max_retries", &self.max_retries)
            .field("reclaim_after", &self.reclaim_after)
            .finish_non_exhaustive()
    }
}
