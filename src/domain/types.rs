//! Core identifier types for domain entities.
//!
//! These newtype wrappers provide type safety for entity identifiers,
//! preventing accidental mixing of different ID types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a mailbox account (its email address).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId(pub String);

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for AccountId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for AccountId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Identity key of a message: (account, folder, server UID).
///
/// Used as the document id for idempotent index writes and as the primary
/// key of the delivery ledger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageKey {
    pub account_id: AccountId,
    pub folder: String,
    pub uid: u32,
}

impl MessageKey {
    pub fn new(account_id: AccountId, folder: impl Into<String>, uid: u32) -> Self {
        Self {
            account_id,
            folder: folder.into(),
            uid,
        }
    }

    /// Stable string form, `account/folder/uid`.
    pub fn as_document_id(&self) -> String {
        format!("{}/{}/{}", self.account_id, self.folder, self.uid)
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_document_id())
    }
}

/// SHA-256 content hash of a message's subject and plain body.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub String);

impl Fingerprint {
    /// Computes the fingerprint of `subject` and `body`.
    pub fn of(subject: &str, body: &str) -> Self {
        let mut ctx = ring::digest::Context::new(&ring::digest::SHA256);
        ctx.update(subject.as_bytes());
        ctx.update(b"\n");
        ctx.update(body.as_bytes());
        let digest = ctx.finish();

        let hex = digest
            .as_ref()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<String>();
        Self(hex)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
