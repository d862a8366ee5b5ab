//! IMAP connector implementation.
//!
//! This module provides the [`MailConnector`] used in production. It opens an
//! IMAP4rev1 session over implicit TLS (or plain TCP for local test servers),
//! logs in with the account credentials and exposes the handful of commands
//! the supervisor needs: SELECT, UID SEARCH, UID FETCH, IDLE and NOOP.
//!
//! # Protocol Details
//!
//! - Uses IMAP4rev1 (RFC 3501) via `async-imap`
//! - IDLE (RFC 2177) for push notifications on the primary folder, polling
//!   when the server does not advertise it
//! - Message bodies are fetched with `BODY.PEEK[]` so `\Seen` is never set

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_imap::extensions::idle::IdleResponse;
use async_imap::types::Fetch;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use futures::io::{AsyncRead, AsyncWrite};
use futures::TryStreamExt;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};

use super::{ConnectError, FolderStatus, IdleEvent, MailConnector, MailSession, Result};
use crate::domain::{Account, AccountId, RawMessage};

/// Fetch items requested for every message.
const FETCH_ITEMS: &str = "(UID INTERNALDATE BODY.PEEK[])";

/// Maximum number of UIDs named in a single UID FETCH.
const FETCH_CHUNK: usize = 200;

/// Opens IMAP sessions.
#[derive(Clone)]
pub struct ImapConnector {
    tls: TlsConnector,
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl fmt::Debug for ImapConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImapConnector")
            .field("connect_timeout", &self.connect_timeout)
            .field("command_timeout", &self.command_timeout)
            .finish()
    }
}

impl ImapConnector {
    /// Creates a connector trusting the webpki root certificates.
    ///
    /// `connect_timeout` bounds TCP connect, TLS handshake and login;
    /// `command_timeout` bounds every later command except IDLE.
    pub fn new(connect_timeout: Duration, command_timeout: Duration) -> Self {
        // Errs when a process-wide provider is already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Self {
            tls: TlsConnector::from(Arc::new(config)),
            connect_timeout,
            command_timeout,
        }
    }

    /// Establishes TLS connection to the IMAP server with futures compat wrapper.
    async fn connect_tls(&self, host: &str, port: u16) -> Result<Compat<TlsStream<TcpStream>>> {
        let tcp_stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| ConnectError::Network(format!("TCP connect failed: {}", e)))?;

        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| ConnectError::Network(format!("invalid server name: {}", e)))?;

        let tls_stream = self
            .tls
            .connect(server_name, tcp_stream)
            .await
            .map_err(|e| ConnectError::Network(format!("TLS handshake failed: {}", e)))?;

        Ok(tls_stream.compat())
    }

    async fn connect_plain(&self, host: &str, port: u16) -> Result<Compat<TcpStream>> {
        let tcp_stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| ConnectError::Network(format!("TCP connect failed: {}", e)))?;
        Ok(tcp_stream.compat())
    }

    async fn open(&self, account: &Account) -> Result<Box<dyn MailSession>> {
        let endpoint = &account.endpoint;

        let session: Box<dyn MailSession> = if endpoint.use_tls {
            let stream = self.connect_tls(&endpoint.host, endpoint.port).await?;
            Box::new(self.login(account, stream).await?)
        } else {
            tracing::warn!(
                account_id = %account.id,
                host = %endpoint.host,
                "Connecting without TLS"
            );
            let stream = self.connect_plain(&endpoint.host, endpoint.port).await?;
            Box::new(self.login(account, stream).await?)
        };

        Ok(session)
    }

    async fn login<S>(&self, account: &Account, stream: S) -> Result<ImapSession<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin + fmt::Debug + Send + 'static,
    {
        let client = async_imap::Client::new(stream);
        let credentials = &account.credentials;

        let session = client
            .login(&credentials.username, &credentials.password)
            .await
            .map_err(|(e, _client)| login_error(e))?;

        Ok(ImapSession {
            account_id: account.id.clone(),
            session: Some(session),
            selected: None,
            idle_supported: None,
            command_timeout: self.command_timeout,
        })
    }
}

#[async_trait]
impl MailConnector for ImapConnector {
    async fn connect(&self, account: &Account) -> Result<Box<dyn MailSession>> {
        match tokio::time::timeout(self.connect_timeout, self.open(account)).await {
            Ok(result) => {
                if result.is_ok() {
                    tracing::debug!(
                        account_id = %account.id,
                        address = %account.endpoint.address(),
                        "IMAP session established"
                    );
                }
                result
            }
            Err(_) => Err(ConnectError::Timeout("connect".to_string())),
        }
    }
}

/// A logged-in IMAP session over any async byte stream.
pub struct ImapSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + fmt::Debug + Send + 'static,
{
    account_id: AccountId,
    /// Taken while IDLE is running; `None` afterwards means the session is lost.
    session: Option<async_imap::Session<S>>,
    selected: Option<String>,
    /// CAPABILITY answer for IDLE, asked once per session.
    idle_supported: Option<bool>,
    command_timeout: Duration,
}

impl<S> ImapSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + fmt::Debug + Send + 'static,
{
    fn session(&mut self) -> Result<&mut async_imap::Session<S>> {
        self.session.as_mut().ok_or(ConnectError::SessionClosed)
    }

    async fn supports_idle(&mut self) -> Result<bool> {
        if let Some(supported) = self.idle_supported {
            return Ok(supported);
        }

        let timeout = self.command_timeout;
        let capabilities = run_command(timeout, "CAPABILITY", self.session()?.capabilities()).await?;
        let supported = capabilities.has_str("IDLE");
        if !supported {
            tracing::info!(account_id = %self.account_id, "Server lacks IDLE, polling instead");
        }
        self.idle_supported = Some(supported);
        Ok(supported)
    }

    async fn ensure_selected(&mut self, folder: &str) -> Result<()> {
        if self.selected.as_deref() != Some(folder) {
            self.select(folder).await?;
        }
        Ok(())
    }

    async fn fetch_uids(&mut self, folder: &str, sequence: &str) -> Result<Vec<RawMessage>> {
        let account_id = self.account_id.clone();
        let timeout = self.command_timeout;
        let session = self.session()?;

        let fetches: Vec<Fetch> = run_command(timeout, "UID FETCH", async {
            let stream = session.uid_fetch(sequence, FETCH_ITEMS).await?;
            stream.try_collect().await
        })
        .await?;

        Ok(fetches
            .iter()
            .filter_map(|fetch| to_raw_message(&account_id, folder, fetch))
            .collect())
    }
}

#[async_trait]
impl<S> MailSession for ImapSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + fmt::Debug + Send + 'static,
{
    async fn select(&mut self, folder: &str) -> Result<FolderStatus> {
        let timeout = self.command_timeout;
        let mailbox = run_command(timeout, "SELECT", self.session()?.select(folder)).await?;
        self.selected = Some(folder.to_string());

        let uid_validity = mailbox.uid_validity.ok_or_else(|| {
            ConnectError::Protocol(format!("no UIDVALIDITY reported for {}", folder))
        })?;

        Ok(FolderStatus {
            uid_validity,
            uid_next: mailbox.uid_next.unwrap_or(0),
            exists: mailbox.exists,
        })
    }

    async fn fetch_after(&mut self, folder: &str, after_uid: u32) -> Result<Vec<RawMessage>> {
        self.ensure_selected(folder).await?;
        if after_uid == u32::MAX {
            return Ok(Vec::new());
        }

        // `n:*` always matches the newest message, even when its UID is below n.
        let mut messages = self
            .fetch_uids(folder, &format!("{}:*", after_uid + 1))
            .await?;
        messages.retain(|m| m.uid > after_uid);
        messages.sort_by_key(|m| m.uid);
        Ok(messages)
    }

    async fn fetch_since(&mut self, folder: &str, since: NaiveDate) -> Result<Vec<RawMessage>> {
        self.ensure_selected(folder).await?;

        let timeout = self.command_timeout;
        let query = format!("SINCE {}", since.format("%d-%b-%Y"));
        let uids: HashSet<u32> =
            run_command(timeout, "UID SEARCH", self.session()?.uid_search(&query)).await?;

        let mut messages = Vec::with_capacity(uids.len());
        for sequence in uid_sequences(uids, FETCH_CHUNK) {
            messages.extend(self.fetch_uids(folder, &sequence).await?);
        }
        messages.sort_by_key(|m| m.uid);
        Ok(messages)
    }

    async fn wait_for_change(&mut self, folder: &str, timeout: Duration) -> Result<IdleEvent> {
        if !self.supports_idle().await? {
            // The caller polls every folder on timeout.
            tokio::time::sleep(timeout).await;
            return Ok(IdleEvent::Timeout);
        }
        self.ensure_selected(folder).await?;

        let session = self.session.take().ok_or(ConnectError::SessionClosed)?;
        let mut handle = session.idle();

        if let Err(e) = handle.init().await {
            if let Ok(session) = handle.done().await {
                self.session = Some(session);
            }
            return Err(imap_error("IDLE", e));
        }

        let outcome = {
            let (idle_wait, _stop) = handle.wait();
            tokio::time::timeout(timeout, idle_wait).await
        };

        let session = handle.done().await.map_err(|e| imap_error("DONE", e))?;
        self.session = Some(session);

        match outcome {
            Ok(Ok(IdleResponse::NewData(_))) => Ok(IdleEvent::NewData),
            Ok(Ok(_)) | Err(_) => Ok(IdleEvent::Timeout),
            Ok(Err(e)) => Err(imap_error("IDLE", e)),
        }
    }

    async fn noop(&mut self) -> Result<()> {
        let timeout = self.command_timeout;
        run_command(timeout, "NOOP", self.session()?.noop()).await
    }

    async fn logout(&mut self) -> Result<()> {
        self.selected = None;
        match self.session.take() {
            Some(mut session) => {
                run_command(self.command_timeout, "LOGOUT", session.logout()).await
            }
            None => Ok(()),
        }
    }
}

/// Runs an IMAP command under a deadline, mapping both failure kinds.
async fn run_command<T, F>(timeout: Duration, op: &str, command: F) -> Result<T>
where
    F: Future<Output = async_imap::error::Result<T>>,
{
    match tokio::time::timeout(timeout, command).await {
        Ok(result) => result.map_err(|e| imap_error(op, e)),
        Err(_) => Err(ConnectError::Timeout(op.to_string())),
    }
}

fn imap_error(op: &str, err: async_imap::error::Error) -> ConnectError {
    use async_imap::error::Error;

    match err {
        Error::Io(e) => ConnectError::Network(format!("{} failed: {}", op, e)),
        Error::ConnectionLost => ConnectError::Network(format!("{} failed: connection lost", op)),
        other => ConnectError::Protocol(format!("{} failed: {}", op, other)),
    }
}

fn login_error(err: async_imap::error::Error) -> ConnectError {
    use async_imap::error::Error;

    match err {
        Error::No(msg) | Error::Bad(msg) => ConnectError::Auth(msg.to_string()),
        other => imap_error("LOGIN", other),
    }
}

/// Splits a UID set into ascending comma-separated sequences of at most
/// `chunk` UIDs each.
fn uid_sequences(uids: HashSet<u32>, chunk: usize) -> Vec<String> {
    let mut sorted: Vec<u32> = uids.into_iter().collect();
    sorted.sort_unstable();

    sorted
        .chunks(chunk.max(1))
        .map(|part| {
            part.iter()
                .map(|uid| uid.to_string())
                .collect::<Vec<_>>()
                .join(",")
        })
        .collect()
}

fn to_raw_message(account_id: &AccountId, folder: &str, fetch: &Fetch) -> Option<RawMessage> {
    let uid = fetch.uid?;
    let source = fetch.body()?.to_vec();

    Some(RawMessage {
        account_id: account_id.clone(),
        folder: folder.to_string(),
        uid,
        internal_date: fetch.internal_date().map(|d| d.with_timezone(&Utc)),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn uid_sequences_are_sorted_and_chunked() {
        let uids: HashSet<u32> = [9, 3, 7, 1, 5].into_iter().collect();

        assert_eq!(uid_sequences(uids.clone(), 2), vec!["1,3", "5,7", "9"]);
        assert_eq!(uid_sequences(uids, 10), vec!["1,3,5,7,9"]);
        assert!(uid_sequences(HashSet::new(), 10).is_empty());
    }

    #[test]
    fn io_errors_map_to_network() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = imap_error("FETCH", async_imap::error::Error::Io(io));
        assert!(matches!(err, ConnectError::Network(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn rejected_login_is_auth() {
        let err = login_error(async_imap::error::Error::No(
            "[AUTHENTICATIONFAILED] Invalid credentials".into(),
        ));
        assert!(matches!(err, ConnectError::Auth(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn connector_debug_omits_tls_state() {
        let connector = ImapConnector::new(Duration::from_secs(5), Duration::from_secs(10));
        let debug = format!("{:?}", connector);
        assert!(debug.contains("connect_timeout"));
    }

    fn detached_session(idle_supported: Option<bool>) -> ImapSession<Compat<tokio::io::DuplexStream>> {
        ImapSession {
            account_id: AccountId::from("a@example.com"),
            session: None,
            selected: None,
            idle_supported,
            command_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn without_idle_waits_out_the_poll_interval() {
        let mut session = detached_session(Some(false));
        let started = tokio::time::Instant::now();

        let event = session
            .wait_for_change("INBOX", Duration::from_secs(300))
            .await
            .unwrap();

        assert_eq!(event, IdleEvent::Timeout);
        assert!(started.elapsed() >= Duration::from_secs(300));
    }

    #[tokio::test]
    async fn capability_check_needs_a_live_session() {
        let mut session = detached_session(None);
        let err = session
            .wait_for_change("INBOX", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::SessionClosed));
        assert_eq!(session.idle_supported, None);
    }

    #[tokio::test]
    async fn unreachable_server_is_network_error() {
        let connector = ImapConnector::new(Duration::from_secs(5), Duration::from_secs(5));
        let account = Account::new(
            "a@example.com",
            "pw",
            crate::domain::ServerEndpoint::plain("127.0.0.1").with_port(1),
        );

        let result = connector.connect(&account).await;
        assert!(matches!(
            result,
            Err(ConnectError::Network(_)) | Err(ConnectError::Timeout(_))
        ));
    }
}
