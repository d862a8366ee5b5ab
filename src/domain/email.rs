//! Email domain types.
//!
//! A [`RawMessage`] is what the IMAP session hands over; a
//! [`NormalizedMessage`] is the canonical record the rest of the pipeline
//! works with.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AccountId, MessageKey};

/// An unparsed message as fetched from the server.
#[derive(Debug, Clone)]
pub struct RawMessage {
    /// Account the message was fetched for.
    pub account_id: AccountId,
    /// Folder the message lives in.
    pub folder: String,
    /// Server-assigned UID within the folder.
    pub uid: u32,
    /// Server arrival time (IMAP INTERNALDATE).
    pub internal_date: Option<DateTime<Utc>>,
    /// Full RFC 5322 source.
    pub source: Vec<u8>,
}

impl RawMessage {
    pub fn key(&self) -> MessageKey {
        MessageKey::new(self.account_id.clone(), self.folder.clone(), self.uid)
    }
}

/// A parsed, canonical email record. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedMessage {
    /// Account this message belongs to.
    pub account_id: AccountId,
    /// Folder the message was fetched from.
    pub folder: String,
    /// Server-assigned UID.
    pub server_uid: u32,
    /// RFC 5322 Message-ID header, when present.
    pub message_id: Option<String>,
    /// Subject line, empty when absent.
    pub subject: String,
    /// Sender address.
    pub sender: Address,
    /// To and Cc recipients.
    pub recipients: Vec<Address>,
    /// Date header, or the server arrival time when the header is missing.
    pub sent_at: DateTime<Utc>,
    /// Plain text body.
    pub plain_body: Option<String>,
    /// HTML body.
    pub html_body: Option<String>,
    /// Attachment metadata. Content is not retained.
    pub attachment_refs: Vec<AttachmentRef>,
}

impl NormalizedMessage {
    /// Identity key used for idempotent downstream writes.
    pub fn key(&self) -> MessageKey {
        MessageKey::new(self.account_id.clone(), self.folder.clone(), self.server_uid)
    }

    /// Body text used for classification and fingerprinting.
    pub fn body_text(&self) -> &str {
        self.plain_body.as_deref().unwrap_or_default()
    }

    /// First `max_chars` characters of the plain body.
    pub fn snippet(&self, max_chars: usize) -> String {
        self.body_text().chars().take(max_chars).collect()
    }
}

/// An email address with optional display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    /// Email address.
    pub email: String,
    /// Display name (e.g., "John Doe").
    pub name: Option<String>,
}

impl Address {
    /// Creates a new address with just an email.
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: None,
        }
    }

    /// Creates a new address with email and display name.
    pub fn with_name(email: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: Some(name.into()),
        }
    }

    /// Returns the display representation of this address.
    ///
    /// If a name is present, returns "Name <email>", otherwise just the email.
    pub fn display(&self) -> String {
        match &self.name {
            Some(name) => format!("{} <{}>", name, self.email),
            None => self.email.clone(),
        }
    }
}

/// Metadata about an attachment on a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    /// Original filename, if the part named one.
    pub filename: Option<String>,
    /// MIME content type.
    pub content_type: String,
    /// Decoded size in bytes.
    pub size_bytes: u64,
}
