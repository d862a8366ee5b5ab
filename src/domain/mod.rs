//! Domain layer types for the onebox pipeline.
//!
//! This module contains the core domain types shared by the supervisor,
//! normalizer, classification and delivery stages.

mod account;
mod category;
mod cursor;
mod delivery;
mod email;
mod notification;
mod types;

pub use account::{Account, Credentials, ServerEndpoint, DEFAULT_FOLDER};
pub use category::{Category, ClassificationResult, UnknownCategory};
pub use cursor::SyncCursor;
pub use delivery::DeliveryRecord;
pub use email::{Address, AttachmentRef, NormalizedMessage, RawMessage};
pub use notification::NotificationRequest;
pub use types::{AccountId, Fingerprint, MessageKey};
