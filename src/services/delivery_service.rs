//! Delivery pipeline.
//!
//! Writes each classified message to the search index and, for high-value
//! messages, dispatches the notification. Progress is recorded in the
//! delivery ledger so a repeated delivery only performs the half that has
//! not completed yet.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::DeliverySettings;
use crate::domain::{ClassificationResult, MessageKey, NormalizedMessage, NotificationRequest};
use crate::providers::index::{IndexDocument, IndexError, SearchIndex};
use crate::providers::notify::Notifier;
use crate::storage::queries::deliveries;
use crate::storage::{Database, DatabaseError};

/// Errors returned by [`DeliveryService::deliver`].
#[derive(Debug, Error)]
pub enum DeliverError {
    /// The index write failed after every attempt.
    #[error("indexing {key} failed after {attempts} attempt(s): {source}")]
    Index {
        key: MessageKey,
        attempts: u32,
        #[source]
        source: IndexError,
    },

    /// The delivery ledger could not be read or written.
    #[error("delivery ledger error: {0}")]
    Ledger(#[from] DatabaseError),
}

impl DeliverError {
    /// Both variants stop the delivery of this message.
    pub fn is_fatal(&self) -> bool {
        true
    }
}

/// What a call to [`DeliveryService::deliver`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryOutcome {
    /// The index write happened during this call.
    pub indexed_now: bool,
    /// The notification was sent during this call.
    pub notified_now: bool,
    /// Non-fatal problems, e.g. a notification that could not be sent.
    pub warnings: Vec<String>,
}

impl DeliveryOutcome {
    /// Nothing was left to do.
    pub fn was_noop(&self) -> bool {
        !self.indexed_now && !self.notified_now && self.warnings.is_empty()
    }
}

/// Result of a pending-notification sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSweep {
    pub attempted: usize,
    pub sent: usize,
    pub failed: usize,
}

/// Idempotent index writes plus notification dispatch.
pub struct DeliveryService {
    db: Database,
    index: Arc<dyn SearchIndex>,
    notifier: Arc<dyn Notifier>,
    settings: DeliverySettings,
}

impl DeliveryService {
    pub fn new(
        db: Database,
        index: Arc<dyn SearchIndex>,
        notifier: Arc<dyn Notifier>,
        settings: DeliverySettings,
    ) -> Self {
        Self {
            db,
            index,
            notifier,
            settings,
        }
    }

    /// Delivers one classified message.
    ///
    /// Safe to call any number of times for the same message: the index write
    /// is keyed by the message identity and the ledger skips completed halves.
    ///
    /// # Errors
    ///
    /// Returns [`DeliverError::Index`] when the index write keeps failing.
    /// Notification failures never fail delivery; they are reported in
    /// [`DeliveryOutcome::warnings`] and kept pending for a later sweep.
    pub async fn deliver(
        &self,
        message: &NormalizedMessage,
        classification: &ClassificationResult,
    ) -> Result<DeliveryOutcome, DeliverError> {
        let key = message.key();
        let record = deliveries::begin_attempt(&self.db, &key).await?;
        let mut outcome = DeliveryOutcome::default();

        if !record.indexed {
            let document = IndexDocument::from_message(message, classification.category);
            if let Err((attempts, source)) = self.index_with_retry(&document).await {
                deliveries::record_error(&self.db, &key, &source.to_string()).await?;
                tracing::error!(
                    message_key = %key,
                    attempts,
                    error = %source,
                    alert = true,
                    "Index write failed, message not delivered"
                );
                return Err(DeliverError::Index {
                    key,
                    attempts,
                    source,
                });
            }
            deliveries::mark_indexed(&self.db, &key).await?;
            outcome.indexed_now = true;
        }

        if record.notified {
            return Ok(outcome);
        }

        // Keep the stored request so receivers see a stable notification id.
        let notification = match (record.pending_notification, &classification.notification) {
            (Some(stored), _) => Some(stored),
            (None, Some(fresh)) => {
                deliveries::set_pending_notification(&self.db, &key, fresh).await?;
                Some(fresh.clone())
            }
            (None, None) => None,
        };

        if let Some(notification) = notification {
            match self.notify_with_retry(&notification).await {
                Ok(()) => {
                    deliveries::mark_notified(&self.db, &key).await?;
                    outcome.notified_now = true;
                }
                Err(e) => {
                    deliveries::record_error(&self.db, &key, &e).await?;
                    tracing::warn!(
                        message_key = %key,
                        notification_id = %notification.id,
                        error = %e,
                        "Notification failed, kept pending"
                    );
                    outcome.warnings.push(format!("notification failed: {}", e));
                }
            }
        }

        tracing::debug!(
            message_key = %key,
            category = %classification.category,
            indexed_now = outcome.indexed_now,
            notified_now = outcome.notified_now,
            "Delivery finished"
        );
        Ok(outcome)
    }

    /// Re-sends notifications left pending by earlier deliveries.
    pub async fn retry_pending_notifications(&self) -> Result<PendingSweep, DeliverError> {
        let pending =
            deliveries::list_pending_notifications(&self.db, self.settings.pending_sweep_batch)
                .await?;

        let mut sweep = PendingSweep::default();
        for record in pending {
            let Some(notification) = record.pending_notification else {
                continue;
            };
            sweep.attempted += 1;

            match self.notify_with_retry(&notification).await {
                Ok(()) => {
                    deliveries::mark_notified(&self.db, &record.message_key).await?;
                    sweep.sent += 1;
                }
                Err(e) => {
                    deliveries::record_error(&self.db, &record.message_key, &e).await?;
                    sweep.failed += 1;
                }
            }
        }

        if sweep.attempted > 0 {
            tracing::info!(
                attempted = sweep.attempted,
                sent = sweep.sent,
                failed = sweep.failed,
                "Pending notification sweep finished"
            );
        }
        Ok(sweep)
    }

    /// Returns the number of attempts used, or the attempts and final error.
    async fn index_with_retry(&self, document: &IndexDocument) -> Result<u32, (u32, IndexError)> {
        let max_attempts = self.settings.index_max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result =
                match tokio::time::timeout(self.settings.index_timeout(), self.index.upsert(document))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(IndexError::Timeout),
                };

            match result {
                Ok(()) => return Ok(attempt),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = backoff(self.settings.index_retry_base(), attempt);
                    tracing::debug!(
                        id = %document.id,
                        attempt,
                        error = %e,
                        "Index write failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err((attempt, e)),
            }
        }
    }

    async fn notify_with_retry(&self, notification: &NotificationRequest) -> Result<(), String> {
        let max_attempts = self.settings.notify_max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            let call = self.notifier.notify(notification);
            match tokio::time::timeout(self.settings.notify_timeout(), call).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = "notification timed out".to_string(),
            }

            if attempt < max_attempts {
                tokio::time::sleep(backoff(self.settings.notify_retry_base(), attempt)).await;
            }
        }

        Err(last_error)
    }
}

fn backoff(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1 << attempt.saturating_sub(1).min(16))
}
