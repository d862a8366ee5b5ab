//! Account connection supervisor.
//!
//! The [`AccountSupervisor`] keeps one long-lived task per registered account.
//! Each task owns its mailbox session and walks the connection state machine:
//!
//! ```text
//! Disconnected -> Connecting -> Syncing -> Listening
//!                     ^                        |
//!                     +----- Reconnecting <----+
//!
//! Connecting -> Failed (bad credentials or retry ceiling)
//! ```
//!
//! Messages are handed to a [`MessageSink`] one at a time in ascending UID
//! order, and the folder cursor advances only after the sink accepted the
//! message. Deregistration cancels the task at its next suspension point; a
//! hand-off already in progress is allowed to finish.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{oneshot, watch, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SyncSettings;
use crate::domain::{Account, AccountId};
use crate::providers::email::{ConnectError, IdleEvent, MailConnector, MailSession};
use crate::storage::queries::cursors;
use crate::storage::{Database, DatabaseError};

use super::pipeline::{HandoffError, HandoffOutcome, MessageSink};

/// Connection state of one account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Backfilling folders from their cursors.
    Syncing,
    /// Waiting for server push on the primary folder.
    Listening,
    /// Waiting out the backoff before the next connection attempt.
    Reconnecting,
    /// Gave up. The account has to be registered again.
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Syncing => "syncing",
            ConnectionState::Listening => "listening",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session pass ended.
#[derive(Debug, Error)]
enum SyncError {
    #[error(transparent)]
    Connection(#[from] ConnectError),

    #[error(transparent)]
    Handoff(#[from] HandoffError),

    #[error("cursor store error: {0}")]
    Cursor(#[from] DatabaseError),

    #[error("cancelled")]
    Cancelled,
}

struct AccountHandle {
    state: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl AccountHandle {
    fn is_live(&self) -> bool {
        !self.task.is_finished() && *self.state.borrow() != ConnectionState::Failed
    }
}

/// Registry of account tasks.
pub struct AccountSupervisor {
    connector: Arc<dyn MailConnector>,
    sink: Arc<dyn MessageSink>,
    db: Database,
    settings: SyncSettings,
    accounts: RwLock<HashMap<AccountId, AccountHandle>>,
}

impl AccountSupervisor {
    pub fn new(
        connector: Arc<dyn MailConnector>,
        sink: Arc<dyn MessageSink>,
        db: Database,
        settings: SyncSettings,
    ) -> Self {
        Self {
            connector,
            sink,
            db,
            settings,
            accounts: RwLock::new(HashMap::new()),
        }
    }

    /// Starts supervising an account.
    ///
    /// Returns once the first session is established, or with the error that
    /// ended the first connection phase. Failures after that are handled by
    /// the account task and only show up in its state.
    ///
    /// # Errors
    ///
    /// - [`ConnectError::AlreadyConnected`] if the account is already live
    /// - [`ConnectError::Auth`] if the server rejects the credentials
    /// - [`ConnectError::RetriesExhausted`] if the server stayed unreachable
    pub async fn register_account(&self, account: Account) -> Result<(), ConnectError> {
        let first_session = {
            let mut accounts = self.accounts.write().await;
            if accounts.get(&account.id).is_some_and(AccountHandle::is_live) {
                return Err(ConnectError::AlreadyConnected(account.id));
            }

            let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
            let (first_tx, first_rx) = oneshot::channel();
            let cancel = CancellationToken::new();

            let id = account.id.clone();
            let worker = AccountWorker {
                account,
                connector: Arc::clone(&self.connector),
                sink: Arc::clone(&self.sink),
                db: self.db.clone(),
                settings: self.settings.clone(),
                state: state_tx,
                cancel: cancel.clone(),
            };
            let task = tokio::spawn(worker.run(first_tx));

            tracing::info!(account_id = %id, "Account registered");
            accounts.insert(
                id,
                AccountHandle {
                    state: state_rx,
                    cancel,
                    task,
                },
            );
            first_rx
        };

        // The sender is dropped without a value when the account is
        // deregistered before its first session.
        first_session.await.unwrap_or(Err(ConnectError::SessionClosed))
    }

    /// Stops supervising an account and waits for its task to finish.
    ///
    /// Returns false when the account was not registered.
    pub async fn deregister_account(&self, account_id: &AccountId) -> bool {
        let handle = self.accounts.write().await.remove(account_id);
        let Some(handle) = handle else {
            return false;
        };

        handle.cancel.cancel();
        if let Err(e) = handle.task.await {
            tracing::error!(account_id = %account_id, error = %e, "Account task panicked");
        }
        tracing::info!(account_id = %account_id, "Account deregistered");
        true
    }

    /// Current state of an account.
    pub async fn state(&self, account_id: &AccountId) -> Option<ConnectionState> {
        let accounts = self.accounts.read().await;
        accounts.get(account_id).map(|h| *h.state.borrow())
    }

    /// Subscribes to state changes of an account.
    pub async fn subscribe(&self, account_id: &AccountId) -> Option<watch::Receiver<ConnectionState>> {
        let accounts = self.accounts.read().await;
        accounts.get(account_id).map(|h| h.state.clone())
    }

    /// Registered accounts and their states.
    pub async fn accounts(&self) -> Vec<(AccountId, ConnectionState)> {
        let accounts = self.accounts.read().await;
        let mut list: Vec<_> = accounts
            .iter()
            .map(|(id, h)| (id.clone(), *h.state.borrow()))
            .collect();
        list.sort_by(|a, b| a.0 .0.cmp(&b.0 .0));
        list
    }

    /// Cancels every account task and waits for all of them.
    pub async fn shutdown(&self) {
        let handles: Vec<_> = self.accounts.write().await.drain().collect();
        for (_, handle) in &handles {
            handle.cancel.cancel();
        }
        for (id, handle) in handles {
            if let Err(e) = handle.task.await {
                tracing::error!(account_id = %id, error = %e, "Account task panicked");
            }
        }
        tracing::info!("Supervisor stopped");
    }
}

/// State owned by one account task.
struct AccountWorker {
    account: Account,
    connector: Arc<dyn MailConnector>,
    sink: Arc<dyn MessageSink>,
    db: Database,
    settings: SyncSettings,
    state: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
}

impl AccountWorker {
    async fn run(self, first_session: oneshot::Sender<Result<(), ConnectError>>) {
        let mut first_session = Some(first_session);
        // Consecutive attempts that never reached `Listening`.
        let mut failures: u32 = 0;

        loop {
            self.set_state(ConnectionState::Connecting);
            let connected = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.connector.connect(&self.account) => result,
            };

            let error = match connected {
                Ok(mut session) => {
                    if let Some(tx) = first_session.take() {
                        let _ = tx.send(Ok(()));
                    }

                    let (ended, listened) = self.drive(session.as_mut()).await;
                    self.close(session.as_mut()).await;
                    if matches!(ended, SyncError::Cancelled) {
                        break;
                    }
                    if listened {
                        failures = 0;
                    }
                    ended.to_string()
                }
                Err(e) if e.is_fatal() => {
                    self.fail(e, &mut first_session);
                    return;
                }
                Err(e) => e.to_string(),
            };

            failures += 1;
            if failures >= self.settings.max_connect_attempts {
                let e = ConnectError::RetriesExhausted {
                    attempts: failures,
                    last_error: error,
                };
                self.fail(e, &mut first_session);
                return;
            }

            let delay = backoff(&self.settings, failures);
            tracing::warn!(
                account_id = %self.account.id,
                attempt = failures,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Connection lost, reconnecting"
            );
            self.set_state(ConnectionState::Reconnecting);
            if !self.pause(delay).await {
                break;
            }
        }

        self.set_state(ConnectionState::Disconnected);
    }

    /// Runs one session until it is lost or cancelled. The flag tells
    /// whether the session got as far as listening.
    async fn drive(&self, session: &mut dyn MailSession) -> (SyncError, bool) {
        self.set_state(ConnectionState::Syncing);
        for folder in &self.account.folders {
            if let Err(e) = self.sync_folder(session, folder).await {
                return (e, false);
            }
        }

        self.set_state(ConnectionState::Listening);
        let primary = self.account.primary_folder().to_string();
        loop {
            let event = self
                .interruptible(session.wait_for_change(&primary, self.settings.health_check_interval()))
                .await;

            let result = match event {
                Ok(IdleEvent::NewData) => self.sync_folder(session, &primary).await.map(|_| ()),
                Ok(IdleEvent::Timeout) => self.health_check(session, &primary).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                return (e, true);
            }
        }
    }

    /// Probes the connection, then polls the folders not covered by IDLE.
    async fn health_check(&self, session: &mut dyn MailSession, primary: &str) -> Result<(), SyncError> {
        let probe = async {
            tokio::time::timeout(self.settings.probe_timeout(), session.noop())
                .await
                .unwrap_or_else(|_| Err(ConnectError::Timeout("NOOP".to_string())))
        };
        self.interruptible(probe).await?;
        tracing::trace!(account_id = %self.account.id, "Liveness probe ok");

        for folder in self.account.folders.iter().filter(|f| f.as_str() != primary) {
            self.sync_folder(session, folder).await?;
        }
        Ok(())
    }

    /// Hands off every message past the folder cursor and returns how many
    /// were handed off.
    async fn sync_folder(&self, session: &mut dyn MailSession, folder: &str) -> Result<usize, SyncError> {
        let account_id = &self.account.id;
        let status = self.interruptible(session.select(folder)).await?;

        let mut cursor = cursors::get(&self.db, account_id, folder).await?;
        if let Some(ref stale) = cursor {
            if stale.uid_validity != status.uid_validity {
                tracing::warn!(
                    account_id = %account_id,
                    folder,
                    old = stale.uid_validity,
                    new = status.uid_validity,
                    "UIDVALIDITY changed, discarding cursor"
                );
                cursors::reset(&self.db, account_id, folder).await?;
                cursor = None;
            }
        }

        let mut messages = match cursor {
            Some(ref c) => self.interruptible(session.fetch_after(folder, c.last_uid)).await?,
            None => {
                let lookback = chrono::Duration::days(i64::from(self.settings.lookback_days));
                let since = Utc::now()
                    .checked_sub_signed(lookback)
                    .unwrap_or(DateTime::<Utc>::MIN_UTC)
                    .date_naive();
                tracing::info!(account_id = %account_id, folder, %since, "Backfilling folder");
                self.interruptible(session.fetch_since(folder, since)).await?
            }
        };
        messages.sort_by_key(|m| m.uid);

        if cursor.is_none() && messages.is_empty() {
            cursors::advance(&self.db, account_id, folder, status.uid_validity, status.highest_uid())
                .await?;
            return Ok(0);
        }

        let mut handed_off = 0;
        for raw in messages {
            if cursor.as_ref().is_some_and(|c| c.covers(status.uid_validity, raw.uid)) {
                continue;
            }

            let uid = raw.uid;
            match self.sink.accept(raw).await? {
                HandoffOutcome::Delivered(outcome) => {
                    for warning in &outcome.warnings {
                        tracing::debug!(account_id = %account_id, folder, uid, warning = %warning, "Delivery warning");
                    }
                }
                HandoffOutcome::Dropped(_) => {}
            }
            cursors::advance(&self.db, account_id, folder, status.uid_validity, uid).await?;
            handed_off += 1;

            if self.cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
        }

        if handed_off > 0 {
            tracing::info!(account_id = %account_id, folder, count = handed_off, "Messages handed off");
        }
        Ok(handed_off)
    }

    async fn interruptible<T>(
        &self,
        fut: impl Future<Output = Result<T, ConnectError>>,
    ) -> Result<T, SyncError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(SyncError::Cancelled),
            result = fut => result.map_err(SyncError::from),
        }
    }

    /// Sleeps unless cancelled first. Returns false on cancellation.
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn close(&self, session: &mut dyn MailSession) {
        let logout = tokio::time::timeout(self.settings.probe_timeout(), session.logout());
        if let Ok(Err(e)) = logout.await {
            tracing::debug!(account_id = %self.account.id, error = %e, "Logout failed");
        }
    }

    fn fail(
        &self,
        error: ConnectError,
        first_session: &mut Option<oneshot::Sender<Result<(), ConnectError>>>,
    ) {
        tracing::error!(account_id = %self.account.id, error = %error, "Giving up on account");
        self.set_state(ConnectionState::Failed);
        if let Some(tx) = first_session.take() {
            let _ = tx.send(Err(error));
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::info!(
                account_id = %self.account.id,
                state = %next,
                from = %previous,
                "Account state changed"
            );
        }
    }
}

/// Delay after the `attempt`-th consecutive failure: exponential from the
/// base, capped, then jittered.
fn backoff(settings: &SyncSettings, attempt: u32) -> Duration {
    let base = Duration::from_millis(settings.backoff_base_ms);
    let cap = Duration::from_millis(settings.backoff_cap_ms);
    let delay = base
        .saturating_mul(1 << attempt.saturating_sub(1).min(16))
        .min(cap);

    let jitter = settings.backoff_jitter;
    if jitter <= 0.0 {
        return delay;
    }
    let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
    delay.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MessageKey, RawMessage, ServerEndpoint};
    use crate::providers::email::FolderStatus;
    use crate::services::delivery_service::{DeliverError, DeliveryOutcome};
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::collections::{HashSet, VecDeque};
    use std::sync::Mutex;

    type Shared<T> = Arc<Mutex<T>>;

    #[derive(Default)]
    struct Folder {
        uid_validity: u32,
        messages: Vec<RawMessage>,
    }

    /// Server-side state shared by the fake connector and its sessions.
    #[derive(Default)]
    struct Mailbox {
        folders: HashMap<String, Folder>,
        connect_errors: VecDeque<ConnectError>,
        sessions_opened: u32,
        connected_at: Vec<tokio::time::Instant>,
        new_data: bool,
        fail_next_probe: bool,
        select_error: Option<String>,
    }

    impl Mailbox {
        fn deliver(&mut self, folder: &str, uid: u32, age_days: i64) {
            let entry = self.folders.entry(folder.to_string()).or_insert_with(|| Folder {
                uid_validity: 1,
                messages: vec![],
            });
            entry.messages.push(RawMessage {
                account_id: AccountId::from("a@example.com"),
                folder: folder.to_string(),
                uid,
                internal_date: Some(Utc::now() - chrono::Duration::days(age_days)),
                source: format!("From: x@y.com\r\nSubject: {}\r\n\r\nbody\r\n", uid).into_bytes(),
            });
        }
    }

    struct FakeConnector(Shared<Mailbox>);

    #[async_trait]
    impl MailConnector for FakeConnector {
        async fn connect(&self, _: &Account) -> Result<Box<dyn MailSession>, ConnectError> {
            let mut mailbox = self.0.lock().unwrap();
            if let Some(e) = mailbox.connect_errors.pop_front() {
                return Err(e);
            }
            mailbox.sessions_opened += 1;
            mailbox.connected_at.push(tokio::time::Instant::now());
            Ok(Box::new(FakeSession(Arc::clone(&self.0))))
        }
    }

    struct FakeSession(Shared<Mailbox>);

    impl FakeSession {
        fn messages(&self, folder: &str, keep: impl Fn(&RawMessage) -> bool) -> Vec<RawMessage> {
            let mailbox = self.0.lock().unwrap();
            mailbox
                .folders
                .get(folder)
                .map(|f| f.messages.iter().filter(|m| keep(m)).cloned().collect())
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl MailSession for FakeSession {
        async fn select(&mut self, folder: &str) -> Result<FolderStatus, ConnectError> {
            let mailbox = self.0.lock().unwrap();
            if let Some(ref reason) = mailbox.select_error {
                return Err(ConnectError::Protocol(reason.clone()));
            }
            let (uid_validity, uid_next, exists) = match mailbox.folders.get(folder) {
                Some(f) => (
                    f.uid_validity,
                    f.messages.iter().map(|m| m.uid).max().unwrap_or(0) + 1,
                    f.messages.len() as u32,
                ),
                None => (1, 1, 0),
            };
            Ok(FolderStatus {
                uid_validity,
                uid_next,
                exists,
            })
        }

        async fn fetch_after(&mut self, folder: &str, after_uid: u32) -> Result<Vec<RawMessage>, ConnectError> {
            Ok(self.messages(folder, |m| m.uid > after_uid))
        }

        async fn fetch_since(&mut self, folder: &str, since: NaiveDate) -> Result<Vec<RawMessage>, ConnectError> {
            Ok(self.messages(folder, |m| {
                m.internal_date
                    .map(|d: DateTime<Utc>| d.date_naive() >= since)
                    .unwrap_or(true)
            }))
        }

        async fn wait_for_change(&mut self, _: &str, _: Duration) -> Result<IdleEvent, ConnectError> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let mut mailbox = self.0.lock().unwrap();
            if std::mem::take(&mut mailbox.new_data) {
                Ok(IdleEvent::NewData)
            } else {
                Ok(IdleEvent::Timeout)
            }
        }

        async fn noop(&mut self) -> Result<(), ConnectError> {
            let mut mailbox = self.0.lock().unwrap();
            if std::mem::take(&mut mailbox.fail_next_probe) {
                return Err(ConnectError::Network("connection reset".to_string()));
            }
            Ok(())
        }

        async fn logout(&mut self) -> Result<(), ConnectError> {
            Ok(())
        }
    }

    /// Records hand-offs; fails each UID in `fail_once` the first time.
    #[derive(Default)]
    struct RecordingSink {
        accepted: Mutex<Vec<(String, u32)>>,
        fail_once: Mutex<HashSet<u32>>,
    }

    impl RecordingSink {
        fn uids(&self, folder: &str) -> Vec<u32> {
            self.accepted
                .lock()
                .unwrap()
                .iter()
                .filter(|(f, _)| f == folder)
                .map(|(_, uid)| *uid)
                .collect()
        }
    }

    #[async_trait]
    impl MessageSink for RecordingSink {
        async fn accept(&self, raw: RawMessage) -> Result<HandoffOutcome, HandoffError> {
            if self.fail_once.lock().unwrap().remove(&raw.uid) {
                return Err(HandoffError {
                    key: MessageKey::new(raw.account_id.clone(), raw.folder.clone(), raw.uid),
                    source: DeliverError::Ledger(DatabaseError::InvalidData("disk full".to_string())),
                });
            }
            self.accepted.lock().unwrap().push((raw.folder, raw.uid));
            Ok(HandoffOutcome::Delivered(DeliveryOutcome::default()))
        }
    }

    struct Harness {
        supervisor: AccountSupervisor,
        mailbox: Shared<Mailbox>,
        sink: Arc<RecordingSink>,
        db: Database,
    }

    async fn harness(mailbox: Mailbox) -> Harness {
        harness_with(mailbox, SyncSettings {
            backoff_base_ms: 1,
            backoff_cap_ms: 5,
            max_connect_attempts: 3,
            ..Default::default()
        })
        .await
    }

    async fn harness_with(mailbox: Mailbox, settings: SyncSettings) -> Harness {
        let mailbox = Arc::new(Mutex::new(mailbox));
        let sink = Arc::new(RecordingSink::default());
        let db = Database::open_in_memory().await.unwrap();
        let supervisor = AccountSupervisor::new(
            Arc::new(FakeConnector(Arc::clone(&mailbox))),
            sink.clone(),
            db.clone(),
            settings,
        );
        Harness {
            supervisor,
            mailbox,
            sink,
            db,
        }
    }

    fn account() -> Account {
        Account::new("a@example.com", "secret", ServerEndpoint::tls("imap.example.com"))
    }

    fn id() -> AccountId {
        AccountId::from("a@example.com")
    }

    async fn wait_until(h: &Harness, expected: ConnectionState) {
        let mut rx = h.supervisor.subscribe(&id()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == expected))
            .await
            .expect("state not reached in time")
            .unwrap();
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met in time");
    }

    async fn cursor(h: &Harness, folder: &str) -> Option<crate::domain::SyncCursor> {
        cursors::get(&h.db, &id(), folder).await.unwrap()
    }

    #[tokio::test]
    async fn backfills_lookback_window_in_uid_order() {
        let mut mailbox = Mailbox::default();
        mailbox.deliver("INBOX", 12, 2);
        mailbox.deliver("INBOX", 3, 45);
        mailbox.deliver("INBOX", 10, 5);
        mailbox.deliver("INBOX", 7, 29);
        let h = harness(mailbox).await;

        h.supervisor.register_account(account()).await.unwrap();
        wait_until(&h, ConnectionState::Listening).await;

        assert_eq!(h.sink.uids("INBOX"), vec![7, 10, 12]);
        let cursor = cursor(&h, "INBOX").await.unwrap();
        assert_eq!(cursor.last_uid, 12);
        assert_eq!(cursor.uid_validity, 1);

        h.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn empty_folder_seeds_cursor() {
        let mut mailbox = Mailbox::default();
        mailbox.deliver("INBOX", 40, 90);
        let h = harness(mailbox).await;

        h.supervisor.register_account(account()).await.unwrap();
        wait_until(&h, ConnectionState::Listening).await;

        assert!(h.sink.uids("INBOX").is_empty());
        assert_eq!(cursor(&h, "INBOX").await.unwrap().last_uid, 40);

        h.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn resumes_after_stored_cursor() {
        let mut mailbox = Mailbox::default();
        for uid in [1, 2, 3, 4] {
            mailbox.deliver("INBOX", uid, 1);
        }
        let h = harness(mailbox).await;
        cursors::advance(&h.db, &id(), "INBOX", 1, 2).await.unwrap();

        h.supervisor.register_account(account()).await.unwrap();
        wait_until(&h, ConnectionState::Listening).await;

        assert_eq!(h.sink.uids("INBOX"), vec![3, 4]);
        h.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn uid_validity_change_discards_cursor() {
        let mut mailbox = Mailbox::default();
        mailbox.deliver("INBOX", 1, 1);
        mailbox.deliver("INBOX", 2, 1);
        mailbox.folders.get_mut("INBOX").unwrap().uid_validity = 9;
        let h = harness(mailbox).await;
        cursors::advance(&h.db, &id(), "INBOX", 1, 500).await.unwrap();

        h.supervisor.register_account(account()).await.unwrap();
        wait_until(&h, ConnectionState::Listening).await;

        assert_eq!(h.sink.uids("INBOX"), vec![1, 2]);
        let cursor = cursor(&h, "INBOX").await.unwrap();
        assert_eq!((cursor.uid_validity, cursor.last_uid), (9, 2));
        h.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let h = harness(Mailbox::default()).await;

        h.supervisor.register_account(account()).await.unwrap();
        let err = h.supervisor.register_account(account()).await.unwrap_err();
        assert!(matches!(err, ConnectError::AlreadyConnected(ref a) if *a == id()));
        assert_eq!(h.mailbox.lock().unwrap().sessions_opened, 1);

        assert!(h.supervisor.deregister_account(&id()).await);
        assert!(!h.supervisor.deregister_account(&id()).await);
        h.supervisor.register_account(account()).await.unwrap();
        assert_eq!(h.mailbox.lock().unwrap().sessions_opened, 2);

        h.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn auth_failure_is_terminal() {
        let mut mailbox = Mailbox::default();
        mailbox
            .connect_errors
            .push_back(ConnectError::Auth("invalid credentials".to_string()));
        let h = harness(mailbox).await;

        let err = h.supervisor.register_account(account()).await.unwrap_err();
        assert!(matches!(err, ConnectError::Auth(_)));
        assert_eq!(h.supervisor.state(&id()).await, Some(ConnectionState::Failed));
        assert_eq!(h.mailbox.lock().unwrap().sessions_opened, 0);

        // A failed account may be registered again.
        h.supervisor.register_account(account()).await.unwrap();
        h.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn transient_connect_errors_are_retried() {
        let mut mailbox = Mailbox::default();
        mailbox
            .connect_errors
            .push_back(ConnectError::Network("refused".to_string()));
        mailbox
            .connect_errors
            .push_back(ConnectError::Timeout("connect".to_string()));
        let h = harness(mailbox).await;

        h.supervisor.register_account(account()).await.unwrap();
        assert_eq!(h.mailbox.lock().unwrap().sessions_opened, 1);
        h.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn gives_up_after_retry_ceiling() {
        let mut mailbox = Mailbox::default();
        for _ in 0..5 {
            mailbox
                .connect_errors
                .push_back(ConnectError::Network("refused".to_string()));
        }
        let h = harness(mailbox).await;

        let err = h.supervisor.register_account(account()).await.unwrap_err();
        assert!(matches!(err, ConnectError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(h.supervisor.state(&id()).await, Some(ConnectionState::Failed));
    }

    #[tokio::test(start_paused = true)]
    async fn sessions_lost_before_listening_back_off_to_the_ceiling() {
        let mailbox = Mailbox {
            select_error: Some("NO [NONEXISTENT] no such mailbox".to_string()),
            ..Default::default()
        };
        let h = harness_with(mailbox, SyncSettings {
            backoff_base_ms: 1_000,
            backoff_cap_ms: 60_000,
            backoff_jitter: 0.0,
            max_connect_attempts: 4,
            ..Default::default()
        })
        .await;

        h.supervisor.register_account(account()).await.unwrap();
        let mut rx = h.supervisor.subscribe(&id()).await.unwrap();
        tokio::time::timeout(
            Duration::from_secs(600),
            rx.wait_for(|s| *s == ConnectionState::Failed),
        )
        .await
        .expect("account never failed")
        .unwrap();

        let mailbox = h.mailbox.lock().unwrap();
        assert_eq!(mailbox.sessions_opened, 4);
        let gaps: Vec<Duration> = mailbox
            .connected_at
            .windows(2)
            .map(|w| w[1] - w[0])
            .collect();
        for (gap, expected) in gaps.iter().zip([1, 2, 4]) {
            let expected = Duration::from_secs(expected);
            assert!(
                *gap >= expected && *gap < expected + Duration::from_millis(100),
                "gap {:?}, expected {:?}",
                gap,
                expected
            );
        }
        assert_eq!(gaps.len(), 3);
        assert!(h.sink.uids("INBOX").is_empty());
    }

    #[tokio::test]
    async fn reaching_listening_resets_the_retry_count() {
        let h = harness(Mailbox::default()).await;
        h.supervisor.register_account(account()).await.unwrap();
        wait_until(&h, ConnectionState::Listening).await;

        // More probe failures than the ceiling allows, each after listening.
        for sessions in 2..=5 {
            h.mailbox.lock().unwrap().fail_next_probe = true;
            eventually(|| h.mailbox.lock().unwrap().sessions_opened == sessions).await;
            wait_until(&h, ConnectionState::Listening).await;
        }

        assert_eq!(h.supervisor.state(&id()).await, Some(ConnectionState::Listening));
        h.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn new_data_is_handed_off_while_listening() {
        let mut mailbox = Mailbox::default();
        mailbox.deliver("INBOX", 1, 1);
        let h = harness(mailbox).await;

        h.supervisor.register_account(account()).await.unwrap();
        wait_until(&h, ConnectionState::Listening).await;
        {
            let mut mailbox = h.mailbox.lock().unwrap();
            mailbox.deliver("INBOX", 2, 0);
            mailbox.new_data = true;
        }

        eventually(|| h.sink.uids("INBOX") == vec![1, 2]).await;
        h.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn secondary_folders_are_polled_on_idle_timeout() {
        let mut mailbox = Mailbox::default();
        mailbox.deliver("Sales", 5, 1);
        let h = harness(mailbox).await;

        let account = account().with_folders(["INBOX", "Sales"]);
        h.supervisor.register_account(account).await.unwrap();
        wait_until(&h, ConnectionState::Listening).await;
        assert_eq!(h.sink.uids("Sales"), vec![5]);

        h.mailbox.lock().unwrap().deliver("Sales", 6, 0);
        eventually(|| h.sink.uids("Sales") == vec![5, 6]).await;
        h.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn probe_failure_reconnects_and_keeps_cursor() {
        let mut mailbox = Mailbox::default();
        mailbox.deliver("INBOX", 1, 1);
        let h = harness(mailbox).await;

        h.supervisor.register_account(account()).await.unwrap();
        wait_until(&h, ConnectionState::Listening).await;
        h.mailbox.lock().unwrap().fail_next_probe = true;

        eventually(|| h.mailbox.lock().unwrap().sessions_opened == 2).await;
        wait_until(&h, ConnectionState::Listening).await;

        assert_eq!(h.sink.uids("INBOX"), vec![1]);
        assert_eq!(cursor(&h, "INBOX").await.unwrap().last_uid, 1);
        h.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn failed_handoff_is_retried_after_reconnect() {
        let mut mailbox = Mailbox::default();
        for uid in [1, 2, 3] {
            mailbox.deliver("INBOX", uid, 1);
        }
        let h = harness(mailbox).await;
        h.sink.fail_once.lock().unwrap().insert(2);

        h.supervisor.register_account(account()).await.unwrap();
        eventually(|| h.sink.uids("INBOX") == vec![1, 2, 3]).await;

        assert!(h.mailbox.lock().unwrap().sessions_opened >= 2);
        wait_until(&h, ConnectionState::Listening).await;
        assert_eq!(cursor(&h, "INBOX").await.unwrap().last_uid, 3);
        h.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn deregistration_stops_the_task() {
        let h = harness(Mailbox::default()).await;
        h.supervisor.register_account(account()).await.unwrap();
        wait_until(&h, ConnectionState::Listening).await;

        assert_eq!(
            h.supervisor.accounts().await,
            vec![(id(), ConnectionState::Listening)]
        );
        assert!(h.supervisor.deregister_account(&id()).await);
        assert_eq!(h.supervisor.state(&id()).await, None);
        assert!(h.supervisor.accounts().await.is_empty());
    }

    #[test]
    fn backoff_is_capped_and_jittered() {
        let exact = SyncSettings {
            backoff_jitter: 0.0,
            ..Default::default()
        };
        assert_eq!(backoff(&exact, 1), Duration::from_secs(1));
        assert_eq!(backoff(&exact, 3), Duration::from_secs(4));
        assert_eq!(backoff(&exact, 20), Duration::from_secs(60));

        let jittered = SyncSettings::default();
        for _ in 0..50 {
            let delay = backoff(&jittered, 2);
            assert!(delay >= Duration::from_millis(1600) && delay <= Duration::from_millis(2400));
        }
    }
}
