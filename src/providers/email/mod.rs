//! Mailbox server access.
//!
//! This module contains the [`MailConnector`] and [`MailSession`] traits and
//! the IMAP implementation used in production:
//!
//! - [`ImapConnector`] - IMAP4rev1 over implicit TLS or plain TCP
//!
//! # Architecture
//!
//! The account supervisor never talks IMAP directly. It asks a connector for
//! a session and then drives the session through select, fetch, idle and
//! probe calls. Each session handles:
//!
//! - Authentication (username/password login)
//! - Folder selection and UIDVALIDITY reporting
//! - Fetching raw messages by UID range or arrival date
//! - Waiting for server push with IDLE

mod imap;
mod traits;

pub use imap::{ImapConnector, ImapSession};
pub use traits::{ConnectError, FolderStatus, IdleEvent, MailConnector, MailSession, Result};
