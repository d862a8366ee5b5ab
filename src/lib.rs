//! onebox - multi-account email sync, categorization and search indexing
//!
//! This crate keeps a live IMAP session per registered mailbox, normalizes
//! fetched messages, classifies them with an LLM oracle, indexes them into
//! Elasticsearch and notifies webhooks about high-value messages.

pub mod app;
pub mod config;
pub mod domain;
pub mod providers;
pub mod services;
pub mod storage;

pub use app::App;
