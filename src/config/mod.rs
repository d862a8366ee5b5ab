//! Configuration and settings management.
//!
//! This module provides service settings types and persistence.
//! Settings are stored in the user's config directory as JSON.

mod settings;

pub use settings::{
    ClassifierSettings, DeliverySettings, IndexSettings, NotificationSettings, Settings,
    SettingsError, StorageSettings, SyncSettings, SETTINGS_FILE,
};
