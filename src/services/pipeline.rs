//! Message hand-off from the supervisor to the processing stages.
//!
//! The supervisor only knows about [`MessageSink`]; [`MessagePipeline`]
//! chains normalization, classification and delivery behind it.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{MessageKey, RawMessage};

use super::classification_service::ClassificationService;
use super::delivery_service::{DeliverError, DeliveryOutcome, DeliveryService};
use super::normalizer::{normalize, ParseError};

/// What happened to a message handed to the sink.
#[derive(Debug, Clone, PartialEq)]
pub enum HandoffOutcome {
    /// The message went through classification and delivery.
    Delivered(DeliveryOutcome),
    /// The message could not be parsed and was skipped.
    Dropped(ParseError),
}

/// The message could not be delivered; the cursor must not advance past it.
#[derive(Debug, Error)]
#[error("hand-off of {key} failed: {source}")]
pub struct HandoffError {
    pub key: MessageKey,
    #[source]
    pub source: DeliverError,
}

/// Receives fetched messages in UID order.
///
/// Returning `Ok` means the message is durably handled and the caller may
/// advance its cursor past it.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn accept(&self, raw: RawMessage) -> Result<HandoffOutcome, HandoffError>;
}

/// Normalize, classify, deliver.
pub struct MessagePipeline {
    classifier: Arc<ClassificationService>,
    delivery: Arc<DeliveryService>,
}

impl MessagePipeline {
    pub fn new(classifier: Arc<ClassificationService>, delivery: Arc<DeliveryService>) -> Self {
        Self {
            classifier,
            delivery,
        }
    }
}

#[async_trait]
impl MessageSink for MessagePipeline {
    async fn accept(&self, raw: RawMessage) -> Result<HandoffOutcome, HandoffError> {
        let key = raw.key();

        let message = match normalize(&raw) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(message_key = %key, error = %e, "Dropping unparseable message");
                return Ok(HandoffOutcome::Dropped(e));
            }
        };

        let classification = self.classifier.classify_or_fallback(&message).await;
        tracing::debug!(
            message_key = %key,
            category = %classification.category,
            cached = classification.cached,
            "Message classified"
        );

        self.delivery
            .deliver(&message, &classification)
            .await
            .map(HandoffOutcome::Delivered)
            .map_err(|source| HandoffError { key, source })
    }
}
