//! Per-folder synchronization cursors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::AccountId;

/// High-water mark for one (account, folder) stream.
///
/// `last_uid` is the highest UID handed downstream. It only moves forward
/// for a given `uid_validity`; a new UIDVALIDITY starts a new epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub account_id: AccountId,
    pub folder: String,
    /// IMAP UIDVALIDITY the UIDs belong to.
    pub uid_validity: u32,
    /// Highest UID handed off so far.
    pub last_uid: u32,
    pub updated_at: DateTime<Utc>,
}

impl SyncCursor {
    /// Whether `uid` has already been handed off under this cursor.
    pub fn covers(&self, uid_validity: u32, uid: u32) -> bool {
        self.uid_validity == uid_validity && uid <= self.last_uid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn covers_respects_epoch() {
        let cursor = SyncCursor {
            account_id: AccountId::from("a"),
            folder: "INBOX".to_string(),
            uid_validity: 10,
            last_uid: 50,
            updated_at: Utc::now(),
        };
        assert!(cursor.covers(10, 50));
        assert!(cursor.covers(10, 1));
        assert!(!cursor.covers(10, 51));
        assert!(!cursor.covers(11, 1));
    }
}
