//! Account domain types.
//!
//! Represents mailbox accounts and the IMAP endpoint they connect to.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::AccountId;

/// Folder watched when an account does not name any.
pub const DEFAULT_FOLDER: &str = "INBOX";

/// A mailbox account registered for continuous synchronization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    /// Account identity (the mailbox email address).
    pub id: AccountId,
    /// Login credentials.
    pub credentials: Credentials,
    /// IMAP server endpoint.
    pub endpoint: ServerEndpoint,
    /// Folders to synchronize. The first one is used for IDLE.
    #[serde(default = "default_folders")]
    pub folders: Vec<String>,
}

fn default_folders() -> Vec<String> {
    vec![DEFAULT_FOLDER.to_string()]
}

impl Account {
    /// Creates an account that logs in with its own address and watches INBOX.
    pub fn new(
        email: impl Into<String>,
        password: impl Into<String>,
        endpoint: ServerEndpoint,
    ) -> Self {
        let email = email.into();
        Self {
            id: AccountId::from(email.clone()),
            credentials: Credentials {
                username: email,
                password: password.into(),
            },
            endpoint,
            folders: default_folders(),
        }
    }

    /// Replaces the watched folder list.
    pub fn with_folders<I, S>(mut self, folders: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let folders: Vec<String> = folders.into_iter().map(Into::into).collect();
        self.folders = if folders.is_empty() {
            default_folders()
        } else {
            folders
        };
        self
    }

    /// The folder kept open in IDLE while listening.
    pub fn primary_folder(&self) -> &str {
        self.folders
            .first()
            .map(String::as_str)
            .unwrap_or(DEFAULT_FOLDER)
    }
}

/// IMAP login credentials.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Login name (usually the email address).
    pub username: String,
    /// Password or app-specific password.
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// IMAP server endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEndpoint {
    /// Server hostname.
    pub host: String,
    /// Server port (typically 993 for TLS, 143 for plaintext).
    pub port: u16,
    /// Whether to wrap the connection in TLS.
    pub use_tls: bool,
}

impl ServerEndpoint {
    /// Creates an endpoint for implicit TLS on port 993.
    pub fn tls(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 993,
            use_tls: true,
        }
    }

    /// Creates a plaintext endpoint on port 143.
    pub fn plain(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 143,
            use_tls: false,
        }
    }

    /// Overrides the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// `host:port` address string.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
