//! Keychain access for secure credential storage.
//!
//! Wraps the keyring crate to provide OS-native credential storage for
//! mailbox passwords and oracle API keys. An in-process backend is available
//! for tests and ephemeral runs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;

/// Errors that can occur during keychain operations.
#[derive(Debug, Error)]
pub enum KeychainError {
    #[error("Keychain error: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("Credential not found: {0}")]
    NotFound(String),

    #[error("Failed to spawn blocking task: {0}")]
    TaskFailed(String),
}

/// Result type for keychain operations.
pub type Result<T> = std::result::Result<T, KeychainError>;

#[derive(Debug, Clone)]
enum Backend {
    Os,
    Memory(Arc<Mutex<HashMap<String, String>>>),
}

/// Provides access to the OS keychain for credential storage.
///
/// Credentials are stored using the service name as a namespace,
/// allowing multiple credentials to be stored per account.
#[derive(Debug, Clone)]
pub struct KeychainAccess {
    service_name: String,
    backend: Backend,
}

impl KeychainAccess {
    /// Default service name for onebox credentials.
    pub const DEFAULT_SERVICE: &'static str = "dev.onebox.sync";

    /// Creates a new KeychainAccess with the default service name.
    pub fn new() -> Self {
        Self::with_service(Self::DEFAULT_SERVICE)
    }

    /// Creates a new KeychainAccess with a custom service name.
    pub fn with_service(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            backend: Backend::Os,
        }
    }

    /// Creates a keychain that keeps credentials in process memory only.
    pub fn in_memory(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            backend: Backend::Memory(Arc::new(Mutex::new(HashMap::new()))),
        }
    }

    /// Stores a credential in the keychain.
    ///
    /// If a credential with the same key already exists, it is overwritten.
    pub async fn store(&self, key: &str, value: &str) -> Result<()> {
        if let Backend::Memory(map) = &self.backend {
            lock(map).insert(key.to_string(), value.to_string());
            return Ok(());
        }

        let service = self.service_name.clone();
        let key = key.to_string();
        let value = value.to_string();

        tokio::task::spawn_blocking(move || {
            let entry = keyring::Entry::new(&service, &key)?;
            entry.set_password(&value)?;
            Ok(())
        })
        .await
        .map_err(|e| KeychainError::TaskFailed(e.to_string()))?
    }

    /// Retrieves a credential from the keychain.
    ///
    /// Returns `None` if no credential exists for the key.
    pub async fn retrieve(&self, key: &str) -> Result<Option<String>> {
        if let Backend::Memory(map) = &self.backend {
            return Ok(lock(map).get(key).cloned());
        }

        let service = self.service_name.clone();
        let key = key.to_string();

        tokio::task::spawn_blocking(move || {
            let entry = keyring::Entry::new(&service, &key)?;
            match entry.get_password() {
                Ok(password) => Ok(Some(password)),
                Err(keyring::Error::NoEntry) => Ok(None),
                Err(e) => Err(KeychainError::Keyring(e)),
            }
        })
        .await
        .map_err(|e| KeychainError::TaskFailed(e.to_string()))?
    }

    /// Deletes a credential from the keychain.
    ///
    /// Returns an error if the credential does not exist.
    pub async fn delete(&self, key: &str) -> Result<()> {
        if let Backend::Memory(map) = &self.backend {
            return match lock(map).remove(key) {
                Some(_) => Ok(()),
                None => Err(KeychainError::NotFound(key.to_string())),
            };
        }

        let service = self.service_name.clone();
        let key = key.to_string();

        tokio::task::spawn_blocking(move || {
            let entry = keyring::Entry::new(&service, &key)?;
            match entry.delete_credential() {
                Ok(()) => Ok(()),
                Err(keyring::Error::NoEntry) => Err(KeychainError::NotFound(key)),
                Err(e) => Err(KeychainError::Keyring(e)),
            }
        })
        .await
        .map_err(|e| KeychainError::TaskFailed(e.to_string()))?
    }

    /// Checks if a credential exists in the keychain.
    pub async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.retrieve(key).await?.is_some())
    }

    /// Returns the service name used for this keychain access.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Generates a keychain key for an account's IMAP password.
    pub fn imap_password_key(account_id: &str) -> String {
        format!("imap.password.{}", account_id)
    }

    /// Generates a keychain key for an AI provider's API key.
    pub fn ai_api_key(provider: &str) -> String {
        format!("ai.api_key.{}", provider)
    }
}

impl Default for KeychainAccess {
    fn default() -> Self {
        Self::new()
    }
}

fn lock(map: &Mutex<HashMap<String, String>>) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
    // A poisoned map still holds valid strings.
    map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
