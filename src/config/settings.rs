//! Service settings and configuration types.
//!
//! Settings are persisted to `<config dir>/onebox/settings.json` (XDG or
//! platform equivalent) and loaded at startup. Every section has defaults, so
//! a partial file only needs to name the values it overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Name of the settings file inside the config directory.
pub const SETTINGS_FILE: &str = "settings.json";

/// Errors that can occur while loading or saving settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid settings file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid setting: {0}")]
    Invalid(String),

    #[error("no configuration directory available on this platform")]
    NoConfigDir,
}

/// Top-level service settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Mailbox connection and sync behavior.
    pub sync: SyncSettings,
    /// Categorization oracle configuration.
    pub classifier: ClassifierSettings,
    /// Search index endpoint.
    pub index: IndexSettings,
    /// Delivery retry policy.
    pub delivery: DeliverySettings,
    /// Notification targets.
    pub notifications: NotificationSettings,
    /// Local state storage.
    pub storage: StorageSettings,
}

impl Settings {
    /// Default location of the settings file.
    pub fn default_path() -> Result<PathBuf, SettingsError> {
        project_dirs()
            .map(|dirs| dirs.config_dir().join(SETTINGS_FILE))
            .ok_or(SettingsError::NoConfigDir)
    }

    /// Loads settings from the default location.
    pub fn load() -> Result<Self, SettingsError> {
        Self::load_from(Self::default_path()?)
    }

    /// Loads settings from `path`. A missing file yields the defaults.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref();

        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "No settings file, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(SettingsError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let settings: Settings =
            serde_json::from_str(&contents).map_err(|source| SettingsError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Writes settings to `path` as pretty-printed JSON.
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<(), SettingsError> {
        let path = path.as_ref();
        let io_err = |source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, json).map_err(io_err)
    }

    /// Checks cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.sync.max_connect_attempts == 0 {
            return Err(SettingsError::Invalid(
                "sync.max_connect_attempts must be at least 1".to_string(),
            ));
        }
        if self.sync.lookback_days > MAX_LOOKBACK_DAYS {
            return Err(SettingsError::Invalid(format!(
                "sync.lookback_days must be at most {}",
                MAX_LOOKBACK_DAYS
            )));
        }
        if !(0.0..1.0).contains(&self.sync.backoff_jitter) {
            return Err(SettingsError::Invalid(
                "sync.backoff_jitter must be in [0, 1)".to_string(),
            ));
        }
        if self.classifier.max_concurrent == 0 {
            return Err(SettingsError::Invalid(
                "classifier.max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.classifier.max_attempts == 0
            || self.delivery.index_max_attempts == 0
            || self.delivery.notify_max_attempts == 0
        {
            return Err(SettingsError::Invalid(
                "retry ceilings must be at least 1".to_string(),
            ));
        }
        url::Url::parse(&self.index.url)
            .map_err(|e| SettingsError::Invalid(format!("index.url: {}", e)))?;
        for hook in self
            .notifications
            .webhook_urls
            .iter()
            .chain(self.notifications.slack_webhook_url.iter())
        {
            url::Url::parse(hook)
                .map_err(|e| SettingsError::Invalid(format!("webhook url {}: {}", hook, e)))?;
        }
        Ok(())
    }
}

/// Upper bound for `sync.lookback_days`.
pub const MAX_LOOKBACK_DAYS: u32 = 3650;

pub(crate) fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("dev", "onebox", "onebox")
}

/// Mailbox connection and sync configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// First reconnect delay in milliseconds.
    pub backoff_base_ms: u64,
    /// Upper bound for the reconnect delay in milliseconds.
    pub backoff_cap_ms: u64,
    /// Relative jitter applied to each delay (0.2 = ±20%).
    pub backoff_jitter: f64,
    /// Connection attempts before an account is given up on.
    pub max_connect_attempts: u32,
    /// How far back to backfill when a folder has no cursor.
    pub lookback_days: u32,
    /// Interval between liveness probes; also the IDLE timeout.
    pub health_check_interval_secs: u64,
    /// Timeout for TCP connect, TLS handshake and login.
    pub connect_timeout_secs: u64,
    /// Timeout for a SELECT, SEARCH or FETCH round-trip.
    pub fetch_timeout_secs: u64,
    /// Timeout for the NOOP liveness probe.
    pub probe_timeout_secs: u64,
    /// How long startup waits for a restored account's first session.
    /// Accounts still connecting afterwards keep retrying in the background.
    pub restore_timeout_secs: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            backoff_base_ms: 1_000,
            backoff_cap_ms: 60_000,
            backoff_jitter: 0.2,
            max_connect_attempts: 8,
            lookback_days: 30,
            health_check_interval_secs: 300,
            connect_timeout_secs: 30,
            fetch_timeout_secs: 120,
            probe_timeout_secs: 30,
            restore_timeout_secs: 15,
        }
    }
}

impl SyncSettings {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn restore_timeout(&self) -> Duration {
        Duration::from_secs(self.restore_timeout_secs)
    }
}

/// Categorization oracle configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierSettings {
    /// OpenAI-compatible endpoint base URL.
    pub base_url: String,
    /// Model identifier.
    pub model: String,
    /// Keychain entry holding the API key, if any.
    pub api_key_keychain_id: Option<String>,
    /// Environment variable consulted when the keychain has no key.
    pub api_key_env: String,
    /// Sampling temperature.
    pub temperature: f32,
    /// Maximum number of oracle calls in flight across all accounts.
    pub max_concurrent: usize,
    /// Attempts per message before the oracle is treated as unavailable.
    pub max_attempts: u32,
    /// Base delay between attempts in milliseconds.
    pub retry_base_ms: u64,
    /// Timeout for a single oracle call.
    pub call_timeout_secs: u64,
    /// Number of fingerprints kept in the verdict cache.
    pub cache_capacity: usize,
    /// Body characters sent to the oracle.
    pub max_body_chars: usize,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o".to_string(),
            api_key_keychain_id: None,
            api_key_env: "OPENAI_API_KEY".to_string(),
            temperature: 0.0,
            max_concurrent: 4,
            max_attempts: 3,
            retry_base_ms: 500,
            call_timeout_secs: 30,
            cache_capacity: 10_000,
            max_body_chars: 4_000,
        }
    }
}

impl ClassifierSettings {
    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

/// Search index endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexSettings {
    /// Elasticsearch base URL.
    pub url: String,
    /// Index name.
    pub index: String,
    /// Optional basic-auth user.
    pub username: Option<String>,
    /// Keychain entry holding the basic-auth password.
    pub password_keychain_id: Option<String>,
    /// Timeout for a single index request.
    pub request_timeout_secs: u64,
    /// Default number of hits returned by a search.
    pub default_search_size: usize,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            url: "http://localhost:9200".to_string(),
            index: "emails".to_string(),
            username: None,
            password_keychain_id: None,
            request_timeout_secs: 10,
            default_search_size: 50,
        }
    }
}

impl IndexSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Delivery retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliverySettings {
    /// Index write attempts before the delivery fails.
    pub index_max_attempts: u32,
    /// Base delay between index attempts in milliseconds.
    pub index_retry_base_ms: u64,
    /// Timeout for a single index write.
    pub index_timeout_secs: u64,
    /// Notification attempts per delivery.
    pub notify_max_attempts: u32,
    /// Base delay between notification attempts in milliseconds.
    pub notify_retry_base_ms: u64,
    /// Timeout for a single notifier call.
    pub notify_timeout_secs: u64,
    /// Interval of the pending-notification sweep.
    pub pending_sweep_interval_secs: u64,
    /// Records retried per sweep.
    pub pending_sweep_batch: u32,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            index_max_attempts: 5,
            index_retry_base_ms: 500,
            index_timeout_secs: 15,
            notify_max_attempts: 3,
            notify_retry_base_ms: 500,
            notify_timeout_secs: 10,
            pending_sweep_interval_secs: 60,
            pending_sweep_batch: 50,
        }
    }
}

impl DeliverySettings {
    pub fn index_retry_base(&self) -> Duration {
        Duration::from_millis(self.index_retry_base_ms)
    }

    pub fn index_timeout(&self) -> Duration {
        Duration::from_secs(self.index_timeout_secs)
    }

    pub fn notify_retry_base(&self) -> Duration {
        Duration::from_millis(self.notify_retry_base_ms)
    }

    pub fn notify_timeout(&self) -> Duration {
        Duration::from_secs(self.notify_timeout_secs)
    }

    pub fn pending_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.pending_sweep_interval_secs)
    }
}

/// Notification targets for high-value messages.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationSettings {
    /// Generic webhooks receiving the notification as JSON.
    pub webhook_urls: Vec<String>,
    /// Slack incoming webhook URL.
    pub slack_webhook_url: Option<String>,
}

/// Local state storage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// SQLite database path. Defaults to `<data dir>/onebox.db`.
    pub database_path: Option<PathBuf>,
}

impl StorageSettings {
    /// Resolves the database path, falling back to the platform data dir.
    pub fn resolve_database_path(&self) -> Result<PathBuf, SettingsError> {
        match &self.database_path {
            Some(path) => Ok(path.clone()),
            None => project_dirs()
                .map(|dirs| dirs.data_dir().join("onebox.db"))
                .ok_or(SettingsError::NoConfigDir),
        }
    }
}
