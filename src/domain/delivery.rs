//! Delivery ledger records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{MessageKey, NotificationRequest};

/// Partial-completion state of delivering one message.
///
/// A retry consults the record and performs only the half that has not
/// completed yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub message_key: MessageKey,
    /// The index write has succeeded.
    pub indexed: bool,
    /// The notification has been dispatched.
    pub notified: bool,
    /// Notification still waiting to be sent, if any.
    pub pending_notification: Option<NotificationRequest>,
    /// Number of delivery attempts made.
    pub attempts: u32,
    /// Last failure recorded for this message.
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl DeliveryRecord {
    /// A record for a message that has not been delivered yet.
    pub fn new(message_key: MessageKey) -> Self {
        Self {
            message_key,
            indexed: false,
            notified: false,
            pending_notification: None,
            attempts: 0,
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    /// Whether nothing remains to be done for this message.
    pub fn is_complete(&self) -> bool {
        self.indexed && self.pending_notification.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::AccountId;

    #[test]
    fn new_record_is_incomplete() {
        let record = DeliveryRecord::new(MessageKey::new(AccountId::from("a"), "INBOX", 1));
        assert!(!record.indexed);
        assert!(!record.notified);
        assert!(!record.is_complete());
    }

    #[test]
    fn indexed_without_pending_notification_is_complete() {
        let mut record = DeliveryRecord::new(MessageKey::new(AccountId::from("a"), "INBOX", 1));
        record.indexed = true;
        assert!(record.is_complete());
    }
}
