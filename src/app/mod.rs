//! Application facade and lifecycle management.
//!
//! [`App`] wires the services together from [`Settings`] and exposes the
//! control surface: account registration, search, state inspection and
//! shutdown.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::domain::{Account, AccountId};
use crate::providers::email::{ImapConnector, MailConnector};
use crate::providers::index::{ElasticsearchIndex, IndexDocument, SearchIndex, SearchQuery};
use crate::providers::notify::{Notifier, NotifierSet};
use crate::services::{
    AccountSupervisor, CategoryOracle, ClassificationService, ClassifierStats, ConnectionState,
    DeliveryService, LlmCategoryOracle, MessagePipeline,
};
use crate::storage::queries::accounts::{self, StoredAccount};
use crate::storage::{KeychainAccess, StorageLayer};

/// External collaborators the services are built on.
///
/// [`App::new`] builds the production set from settings; tests pass fakes to
/// [`App::with_components`].
pub struct Components {
    pub connector: Arc<dyn MailConnector>,
    pub oracle: Arc<dyn CategoryOracle>,
    pub index: Arc<dyn SearchIndex>,
    pub notifier: Arc<dyn Notifier>,
}

struct Sweeper {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Main application entry point.
pub struct App {
    settings: Settings,
    storage: StorageLayer,
    supervisor: AccountSupervisor,
    classifier: Arc<ClassificationService>,
    delivery: Arc<DeliveryService>,
    index: Arc<dyn SearchIndex>,
    sweeper: Mutex<Option<Sweeper>>,
}

impl App {
    /// Builds the production application: IMAP over TLS, the LLM oracle,
    /// Elasticsearch and the configured notifiers.
    pub async fn new(settings: Settings, storage: StorageLayer) -> Result<Self> {
        settings.validate()?;

        let connector = ImapConnector::new(
            settings.sync.connect_timeout(),
            settings.sync.fetch_timeout(),
        );

        let api_key = resolve_api_key(&settings, storage.keychain()).await?;
        if api_key.is_none() {
            tracing::warn!(
                base_url = %settings.classifier.base_url,
                "No oracle API key configured, requests are sent unauthenticated"
            );
        }
        let oracle = LlmCategoryOracle::from_settings(&settings.classifier, api_key)
            .context("Failed to configure categorization oracle")?;

        let index_password = match settings.index.password_keychain_id {
            Some(ref key) => storage.keychain().retrieve(key).await?,
            None => None,
        };
        let index = ElasticsearchIndex::new(&settings.index, index_password)
            .context("Failed to configure search index")?;

        let notifier =
            NotifierSet::from_settings(&settings.notifications, settings.delivery.notify_timeout())
                .context("Failed to configure notifiers")?;
        if notifier.is_empty() {
            tracing::info!("No notifiers configured");
        }

        let components = Components {
            connector: Arc::new(connector),
            oracle: Arc::new(oracle),
            index: Arc::new(index),
            notifier: Arc::new(notifier),
        };
        Ok(Self::with_components(settings, storage, components))
    }

    /// Builds the application around the given collaborators.
    pub fn with_components(settings: Settings, storage: StorageLayer, components: Components) -> Self {
        let classifier = Arc::new(ClassificationService::new(
            components.oracle,
            &settings.classifier,
        ));
        let delivery = Arc::new(DeliveryService::new(
            storage.db().clone(),
            Arc::clone(&components.index),
            components.notifier,
            settings.delivery.clone(),
        ));
        let pipeline = MessagePipeline::new(Arc::clone(&classifier), Arc::clone(&delivery));
        let supervisor = AccountSupervisor::new(
            components.connector,
            Arc::new(pipeline),
            storage.db().clone(),
            settings.sync.clone(),
        );

        Self {
            settings,
            storage,
            supervisor,
            classifier,
            delivery,
            index: components.index,
            sweeper: Mutex::new(None),
        }
    }

    /// Prepares the index, restores persisted accounts and starts the
    /// pending-notification sweeper. Returns the number of restored accounts
    /// whose first session came up within `sync.restore_timeout_secs`.
    pub async fn start(&self) -> Result<usize> {
        if let Err(e) = self.index.ensure_index().await {
            tracing::warn!(error = %e, "Could not prepare search index, continuing");
        }

        self.start_sweeper();

        let stored = accounts::list(self.storage.db()).await?;
        let mut restorable = Vec::with_capacity(stored.len());
        for account in stored {
            let key = KeychainAccess::imap_password_key(&account.id.0);
            match self.storage.keychain().retrieve(&key).await? {
                Some(password) => restorable.push(account.into_account(password)),
                None => tracing::warn!(
                    account_id = %account.id,
                    "No password in keychain, account not restored"
                ),
            }
        }

        // A registration that outlives the deadline keeps retrying in its
        // own task; only the wait for its first session is abandoned.
        let deadline = self.settings.sync.restore_timeout();
        let results = futures::future::join_all(restorable.into_iter().map(|account| {
            let id = account.id.clone();
            let register = self.supervisor.register_account(account);
            async move { (id, tokio::time::timeout(deadline, register).await) }
        }))
        .await;

        let mut restored = 0;
        for (id, result) in results {
            match result {
                Ok(Ok(())) => restored += 1,
                Ok(Err(e)) => tracing::error!(account_id = %id, error = %e, "Failed to restore account"),
                Err(_) => tracing::warn!(account_id = %id, "Account still connecting, continuing startup"),
            }
        }
        tracing::info!(restored, "Application started");
        Ok(restored)
    }

    /// Registers an account, connects it and persists it for restarts.
    ///
    /// The account is only persisted once its first session is up; if saving
    /// it fails the account is stopped again. The error wraps a
    /// [`crate::providers::email::ConnectError`] when connecting fails.
    pub async fn register_account(&self, account: Account) -> Result<()> {
        let stored = StoredAccount::from(&account);
        let password = account.credentials.password.clone();
        let id = account.id.clone();

        self.supervisor.register_account(account).await?;

        if let Err(e) = self.persist_account(&stored, &password).await {
            self.supervisor.deregister_account(&id).await;
            let key = KeychainAccess::imap_password_key(&id.0);
            if let Err(cleanup) = self.storage.keychain().delete(&key).await {
                tracing::warn!(account_id = %id, error = %cleanup, "Failed to delete account password");
            }
            return Err(e);
        }
        Ok(())
    }

    async fn persist_account(&self, stored: &StoredAccount, password: &str) -> Result<()> {
        let key = KeychainAccess::imap_password_key(&stored.id.0);
        self.storage
            .keychain()
            .store(&key, password)
            .await
            .context("Failed to store account password")?;
        accounts::upsert(self.storage.db(), stored)
            .await
            .context("Failed to save account")?;
        Ok(())
    }

    /// Stops syncing an account and forgets it. Sync cursors are kept so a
    /// later registration resumes where this one stopped.
    pub async fn deregister_account(&self, account_id: &AccountId) -> Result<bool> {
        let was_running = self.supervisor.deregister_account(account_id).await;
        let was_stored = accounts::delete(self.storage.db(), account_id).await?;

        let key = KeychainAccess::imap_password_key(&account_id.0);
        if let Err(e) = self.storage.keychain().delete(&key).await {
            tracing::warn!(account_id = %account_id, error = %e, "Failed to delete account password");
        }
        Ok(was_running || was_stored)
    }

    /// Searches indexed messages.
    pub async fn search(&self, query: &SearchQuery) -> Result<Vec<IndexDocument>> {
        Ok(self.index.query(query).await?)
    }

    /// Registered accounts and their connection states.
    pub async fn accounts(&self) -> Vec<(AccountId, ConnectionState)> {
        self.supervisor.accounts().await
    }

    pub async fn account_state(&self, account_id: &AccountId) -> Option<ConnectionState> {
        self.supervisor.state(account_id).await
    }

    pub fn classifier_stats(&self) -> ClassifierStats {
        self.classifier.stats()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Stops every account task and the sweeper.
    pub async fn shutdown(&self) {
        let sweeper = self.sweeper.lock().ok().and_then(|mut s| s.take());
        if let Some(sweeper) = sweeper {
            sweeper.cancel.cancel();
            let _ = sweeper.task.await;
        }
        self.supervisor.shutdown().await;
    }

    fn start_sweeper(&self) {
        let Ok(mut slot) = self.sweeper.lock() else {
            return;
        };
        if slot.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let delivery = Arc::clone(&self.delivery);
        let period = self.settings.delivery.pending_sweep_interval();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {}
                }
                if let Err(e) = delivery.retry_pending_notifications().await {
                    tracing::warn!(error = %e, "Pending notification sweep failed");
                }
            }
        });

        *slot = Some(Sweeper { cancel, task });
    }
}

/// Looks up the oracle API key: keychain entry first, then the environment.
async fn resolve_api_key(settings: &Settings, keychain: &KeychainAccess) -> Result<Option<String>> {
    if let Some(ref key) = settings.classifier.api_key_keychain_id {
        if let Some(value) = keychain.retrieve(key).await? {
            return Ok(Some(value));
        }
    }
    Ok(std::env::var(&settings.classifier.api_key_env)
        .ok()
        .filter(|v| !v.trim().is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn api_key_prefers_keychain() {
        let keychain = KeychainAccess::in_memory("dev.onebox.test");
        keychain
            .store(&KeychainAccess::ai_api_key("openai"), "sk-keychain")
            .await
            .unwrap();

        let mut settings = Settings::default();
        settings.classifier.api_key_keychain_id = Some(KeychainAccess::ai_api_key("openai"));
        settings.classifier.api_key_env = "ONEBOX_TEST_UNSET_KEY".to_string();

        let key = resolve_api_key(&settings, &keychain).await.unwrap();
        assert_eq!(key.as_deref(), Some("sk-keychain"));
    }

    #[tokio::test]
    async fn api_key_missing_everywhere_is_none() {
        let keychain = KeychainAccess::in_memory("dev.onebox.test");
        let mut settings = Settings::default();
        settings.classifier.api_key_env = "ONEBOX_TEST_UNSET_KEY".to_string();

        assert_eq!(resolve_api_key(&settings, &keychain).await.unwrap(), None);
    }

    #[tokio::test]
    async fn builds_from_default_settings() {
        let storage = StorageLayer::in_memory().await.unwrap();
        let app = App::new(Settings::default(), storage).await.unwrap();
        assert!(app.accounts().await.is_empty());
        app.shutdown().await;
    }
}
