//! Search index trait and document types.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{AccountId, Category, MessageKey, NormalizedMessage};

/// Errors returned by a search index.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("index returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("index request timed out")]
    Timeout,

    #[error("index unavailable: {0}")]
    Unavailable(String),

    #[error("invalid index response: {0}")]
    InvalidResponse(String),

    #[error("invalid index configuration: {0}")]
    Config(String),
}

impl IndexError {
    /// Returns true when retrying the same write may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            IndexError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            IndexError::Status { status, .. } => *status == 429 || *status >= 500,
            IndexError::Timeout | IndexError::Unavailable(_) => true,
            IndexError::InvalidResponse(_) | IndexError::Config(_) => false,
        }
    }
}

/// Result type for index operations.
pub type IndexResult<T> = Result<T, IndexError>;

/// The searchable representation of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDocument {
    /// Document id, `account/folder/uid`.
    pub id: String,
    pub account_id: String,
    pub folder: String,
    pub uid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub subject: String,
    pub from: String,
    #[serde(default)]
    pub to: Vec<String>,
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    pub category: Category,
    #[serde(default)]
    pub attachments: Vec<String>,
}

impl IndexDocument {
    /// Builds the document for a classified message.
    pub fn from_message(message: &NormalizedMessage, category: Category) -> Self {
        Self {
            id: message.key().as_document_id(),
            account_id: message.account_id.0.clone(),
            folder: message.folder.clone(),
            uid: message.server_uid,
            message_id: message.message_id.clone(),
            subject: message.subject.clone(),
            from: message.sender.display(),
            to: message.recipients.iter().map(|a| a.display()).collect(),
            date: message.sent_at,
            text: message.body_text().to_string(),
            html: message.html_body.clone(),
            category,
            attachments: message
                .attachment_refs
                .iter()
                .filter_map(|a| a.filename.clone())
                .collect(),
        }
    }

    /// Identity key of the indexed message.
    pub fn key(&self) -> MessageKey {
        MessageKey::new(AccountId(self.account_id.clone()), self.folder.clone(), self.uid)
    }
}

/// A search over indexed messages. Empty filters match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    /// Full-text query over subject, body and sender.
    pub text: Option<String>,
    pub account_id: Option<AccountId>,
    pub folder: Option<String>,
    pub category: Option<Category>,
    /// Maximum number of hits; the index default applies when `None`.
    pub size: Option<usize>,
}

impl SearchQuery {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn in_account(mut self, account_id: impl Into<AccountId>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }

    pub fn in_folder(mut self, folder: impl Into<String>) -> Self {
        self.folder = Some(folder.into());
        self
    }

    pub fn with_category(mut self, category: Category) -> Self {
        self.category = Some(category);
        self
    }

    pub fn limit(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    /// Whether a document satisfies the query's filters and text terms.
    ///
    /// Text matching is a case-insensitive substring test over subject, body
    /// and sender; full-text indexes apply their own analysis instead.
    pub fn matches(&self, doc: &IndexDocument) -> bool {
        if let Some(ref account_id) = self.account_id {
            if doc.account_id != account_id.0 {
                return false;
            }
        }
        if let Some(ref folder) = self.folder {
            if &doc.folder != folder {
                return false;
            }
        }
        if let Some(category) = self.category {
            if doc.category != category {
                return false;
            }
        }
        match self.text.as_deref().map(str::trim) {
            None | Some("") => true,
            Some(text) => {
                let needle = text.to_lowercase();
                [&doc.subject, &doc.text, &doc.from]
                    .iter()
                    .any(|field| field.to_lowercase().contains(&needle))
            }
        }
    }
}

/// A searchable message store with idempotent writes.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Creates the index and its mapping when missing.
    async fn ensure_index(&self) -> IndexResult<()>;

    /// Writes a document under its id, replacing any earlier version.
    async fn upsert(&self, document: &IndexDocument) -> IndexResult<()>;

    /// Runs a search, newest messages first.
    async fn query(&self, query: &SearchQuery) -> IndexResult<Vec<IndexDocument>>;
}
