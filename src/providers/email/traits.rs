//! Mailbox connector trait definitions.
//!
//! This module defines the [`MailConnector`] and [`MailSession`] traits which
//! abstract over the mailbox server. The account supervisor drives every
//! session through these traits, so tests can substitute scripted sessions
//! for a real IMAP server.

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::domain::{Account, AccountId, RawMessage};

/// Result type alias for mailbox connection operations.
pub type Result<T> = std::result::Result<T, ConnectError>;

/// Errors that can occur while connecting to or talking with a mailbox server.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// The server rejected the credentials. Never retried.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// TCP or TLS failure.
    #[error("network error: {0}")]
    Network(String),

    /// The server sent something unexpected or refused a command.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An operation did not finish within its deadline.
    #[error("timed out during {0}")]
    Timeout(String),

    /// A live connection already exists for the account.
    #[error("account {0} is already connected")]
    AlreadyConnected(AccountId),

    /// The reconnect ceiling was reached.
    #[error("gave up after {attempts} connection attempts: {last_error}")]
    RetriesExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// The error returned by the final attempt.
        last_error: String,
    },

    /// The session was used after it had been closed or lost.
    #[error("session closed")]
    SessionClosed,
}

impl ConnectError {
    /// Returns true when a reconnect may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ConnectError::Network(_)
                | ConnectError::Protocol(_)
                | ConnectError::Timeout(_)
                | ConnectError::SessionClosed
        )
    }

    /// Returns true when the account must not be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ConnectError::Auth(_) | ConnectError::RetriesExhausted { .. }
        )
    }
}

/// Folder metadata reported by SELECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderStatus {
    /// UIDVALIDITY epoch of the folder.
    pub uid_validity: u32,
    /// Predicted UID of the next message to arrive.
    pub uid_next: u32,
    /// Number of messages in the folder.
    pub exists: u32,
}

impl FolderStatus {
    /// Highest UID the folder may currently contain.
    pub fn highest_uid(&self) -> u32 {
        self.uid_next.saturating_sub(1)
    }
}

/// Outcome of waiting on a folder for server push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleEvent {
    /// The server reported a change in the folder.
    NewData,
    /// The wait ran out without any change.
    Timeout,
}

/// Opens authenticated sessions against a mailbox server.
#[async_trait]
pub trait MailConnector: Send + Sync {
    /// Connects and logs in with the account's credentials.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError::Auth`] when the credentials are rejected and
    /// [`ConnectError::Network`] or [`ConnectError::Timeout`] when the server
    /// cannot be reached.
    async fn connect(&self, account: &Account) -> Result<Box<dyn MailSession>>;
}

/// An authenticated mailbox session.
///
/// Methods take the folder they operate on; implementations select it when it
/// is not already the selected folder.
#[async_trait]
pub trait MailSession: Send {
    /// Selects a folder and reports its status.
    async fn select(&mut self, folder: &str) -> Result<FolderStatus>;

    /// Fetches every message with a UID strictly greater than `after_uid`,
    /// in ascending UID order.
    async fn fetch_after(&mut self, folder: &str, after_uid: u32) -> Result<Vec<RawMessage>>;

    /// Fetches every message that arrived on or after `since`, in ascending
    /// UID order.
    async fn fetch_since(&mut self, folder: &str, since: NaiveDate) -> Result<Vec<RawMessage>>;

    /// Waits for the server to report new data on `folder`, up to `timeout`.
    async fn wait_for_change(&mut self, folder: &str, timeout: Duration) -> Result<IdleEvent>;

    /// Liveness probe.
    async fn noop(&mut self) -> Result<()>;

    /// Closes the session.
    async fn logout(&mut self) -> Result<()>;
}
