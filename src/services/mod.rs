//! Business services layer.
//!
//! Services sit between the application facade and the infrastructure layer:
//!
//! ```text
//! Application (App)
//!          |
//!          v
//!    Services Layer  <-- You are here
//!          |
//!          v
//! Infrastructure (Providers, Storage)
//! ```
//!
//! # Services Overview
//!
//! - [`AccountSupervisor`]: one long-lived mailbox session per account
//! - [`normalize`]: raw message source to [`crate::domain::NormalizedMessage`]
//! - [`ClassificationService`]: cached, deduplicated oracle calls
//! - [`DeliveryService`]: idempotent indexing and notification dispatch
//! - [`MessagePipeline`]: the hand-off chaining the three stages above

mod classification_service;
mod delivery_service;
mod normalizer;
mod oracle;
mod pipeline;
mod supervisor;

pub use classification_service::{ClassificationService, ClassifierStats, ClassifyError};
pub use delivery_service::{DeliverError, DeliveryOutcome, DeliveryService, PendingSweep};
pub use normalizer::{normalize, ParseError};
pub use oracle::{CategoryOracle, LlmCategoryOracle, OracleAnswer, OracleError};
pub use pipeline::{HandoffError, HandoffOutcome, MessagePipeline, MessageSink};
pub use supervisor::{AccountSupervisor, ConnectionState};
