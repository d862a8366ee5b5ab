//! External service adapters.
//!
//! This module contains the traits and implementations for everything the
//! pipeline talks to over the network:
//!
//! - [`email`] - Mailbox servers (IMAP)
//! - [`ai`] - LLM providers behind the categorization oracle (OpenAI-compatible)
//! - [`index`] - Search index (Elasticsearch)
//! - [`notify`] - Notification webhooks (generic JSON, Slack)

pub mod ai;
pub mod email;
pub mod index;
pub mod notify;
