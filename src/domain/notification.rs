//! Notification requests produced for high-value messages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Category, MessageKey, NormalizedMessage};

/// Maximum number of body characters carried in a notification.
const SNIPPET_CHARS: usize = 280;

/// A request to tell the outside world about a message.
///
/// Built during classification, dispatched during delivery, and persisted in
/// the delivery ledger until it has been sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRequest {
    /// Unique identifier, useful for receiver-side deduplication.
    pub id: String,
    /// Message this notification is about.
    pub message_key: MessageKey,
    /// Category that triggered the notification.
    pub category: Category,
    /// Sender display string.
    pub from: String,
    /// Subject line.
    pub subject: String,
    /// Start of the plain body.
    pub snippet: String,
    /// Date the message was sent.
    pub sent_at: DateTime<Utc>,
}

impl NotificationRequest {
    /// Creates a notification describing `message`.
    pub fn for_message(message: &NormalizedMessage, category: Category) -> Self {
        Self {
            id: format!("notif-{}", uuid::Uuid::new_v4()),
            message_key: message.key(),
            category,
            from: message.sender.display(),
            subject: message.subject.clone(),
            snippet: message.snippet(SNIPPET_CHARS),
            sent_at: message.sent_at,
        }
    }

    /// One-line summary used by chat-style notifiers.
    pub fn headline(&self) -> String {
        let subject = if self.subject.is_empty() {
            "(no subject)"
        } else {
            self.subject.as_str()
        };
        format!(
            "[{}] {} - {} ({})",
            self.category, self.from, subject, self.message_key.account_id
        )
    }
}
