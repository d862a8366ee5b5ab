//! Outbound notifications for high-value messages.
//!
//! - [`WebhookNotifier`] - POSTs the notification as JSON
//! - [`SlackNotifier`] - posts a one-line message to a Slack incoming webhook
//! - [`NotifierSet`] - fans a notification out to several notifiers

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use url::Url;

use crate::config::NotificationSettings;
use crate::domain::NotificationRequest;

/// Errors returned by notifiers. Never fatal to delivery.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{target} returned {status}")]
    Status { target: String, status: u16 },

    #[error("invalid notifier configuration: {0}")]
    Config(String),

    #[error("{failed} of {total} notifiers failed: {first_error}")]
    Partial {
        failed: usize,
        total: usize,
        first_error: String,
    },
}

pub type NotifyResult<T> = Result<T, NotifyError>;

/// Delivers a notification to one destination.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Sends the notification.
    async fn notify(&self, request: &NotificationRequest) -> NotifyResult<()>;
}

fn parse_target(raw: &str) -> NotifyResult<Url> {
    Url::parse(raw).map_err(|e| NotifyError::Config(format!("invalid webhook url {}: {}", raw, e)))
}

fn http_client(timeout: Duration) -> NotifyResult<reqwest::Client> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}

async fn post_json(
    client: &reqwest::Client,
    target: &Url,
    body: &impl serde::Serialize,
) -> NotifyResult<()> {
    let response = client.post(target.clone()).json(body).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(NotifyError::Status {
            target: target.host_str().unwrap_or("webhook").to_string(),
            status: status.as_u16(),
        });
    }
    Ok(())
}

/// Sends the full notification as a JSON body.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    target: Url,
}

impl WebhookNotifier {
    pub fn new(target: &str, timeout: Duration) -> NotifyResult<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            target: parse_target(target)?,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn notify(&self, request: &NotificationRequest) -> NotifyResult<()> {
        post_json(&self.client, &self.target, request).await
    }
}

/// Posts to a Slack incoming webhook.
#[derive(Debug, Clone)]
pub struct SlackNotifier {
    client: reqwest::Client,
    target: Url,
}

impl SlackNotifier {
    pub fn new(webhook_url: &str, timeout: Duration) -> NotifyResult<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            target: parse_target(webhook_url)?,
        })
    }

    fn payload(request: &NotificationRequest) -> serde_json::Value {
        let mut text = request.headline();
        if !request.snippet.is_empty() {
            text.push_str("\n>");
            text.push_str(&request.snippet.replace('\n', "\n>"));
        }
        serde_json::json!({ "text": text })
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    fn name(&self) -> &str {
        "slack"
    }

    async fn notify(&self, request: &NotificationRequest) -> NotifyResult<()> {
        post_json(&self.client, &self.target, &Self::payload(request)).await
    }
}

/// Sends every notification to all member notifiers.
///
/// Succeeds only when every member succeeds. Members are always all tried.
#[derive(Clone, Default)]
pub struct NotifierSet {
    notifiers: Vec<Arc<dyn Notifier>>,
}

impl NotifierSet {
    pub fn new(notifiers: Vec<Arc<dyn Notifier>>) -> Self {
        Self { notifiers }
    }

    /// Builds the configured notifiers.
    pub fn from_settings(settings: &NotificationSettings, timeout: Duration) -> NotifyResult<Self> {
        let mut notifiers: Vec<Arc<dyn Notifier>> = Vec::new();
        for url in &settings.webhook_urls {
            notifiers.push(Arc::new(WebhookNotifier::new(url, timeout)?));
        }
        if let Some(ref url) = settings.slack_webhook_url {
            notifiers.push(Arc::new(SlackNotifier::new(url, timeout)?));
        }
        Ok(Self { notifiers })
    }

    pub fn push(&mut self, notifier: Arc<dyn Notifier>) {
        self.notifiers.push(notifier);
    }

    pub fn len(&self) -> usize {
        self.notifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notifiers.is_empty()
    }
}

#[async_trait]
impl Notifier for NotifierSet {
    fn name(&self) -> &str {
        "set"
    }

    async fn notify(&self, request: &NotificationRequest) -> NotifyResult<()> {
        let results =
            futures::future::join_all(self.notifiers.iter().map(|n| n.notify(request))).await;

        let mut failed = 0;
        let mut first_error = None;
        for (notifier, result) in self.notifiers.iter().zip(results) {
            if let Err(e) = result {
                tracing::debug!(
                    notifier = notifier.name(),
                    notification_id = %request.id,
                    error = %e,
                    "Notifier failed"
                );
                failed += 1;
                first_error.get_or_insert_with(|| format!("{}: {}", notifier.name(), e));
            }
        }

        match first_error {
            None => Ok(()),
            Some(first_error) => Err(NotifyError::Partial {
                failed,
                total: self.notifiers.len(),
                first_error,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AccountId, Address, Category, NormalizedMessage};
    use chrono::Utc;

    fn request() -> NotificationRequest {
        let message = NormalizedMessage {
            account_id: AccountId::from("a@example.com"),
            folder: "INBOX".to_string(),
            server_uid: 7,
            message_id: None,
            subject: "Let's move forward".to_string(),
            sender: Address::new("lead@corp.com"),
            recipients: vec![],
            sent_at: Utc::now(),
            plain_body: Some("Line one\nLine two".to_string()),
            html_body: None,
            attachment_refs: vec![],
        };
        NotificationRequest::for_message(&message, Category::Interested)
    }

    fn mock(name: &'static str, ok: bool) -> MockNotifier {
        let mut mock = MockNotifier::new();
        mock.expect_name().return_const(name.to_string());
        mock.expect_notify().times(1).returning(move |_| {
            if ok {
                Ok(())
            } else {
                Err(NotifyError::Status {
                    target: name.to_string(),
                    status: 502,
                })
            }
        });
        mock
    }

    #[test]
    fn slack_payload_quotes_snippet() {
        let payload = SlackNotifier::payload(&request());
        let text = payload["text"].as_str().unwrap();
        assert!(text.starts_with("[Interested] lead@corp.com - Let's move forward"));
        assert!(text.ends_with("\n>Line one\n>Line two"));
    }

    #[test]
    fn rejects_invalid_urls() {
        let timeout = Duration::from_secs(1);
        assert!(matches!(
            WebhookNotifier::new("not a url", timeout),
            Err(NotifyError::Config(_))
        ));

        let settings = NotificationSettings {
            webhook_urls: vec!["https://example.com/hook".to_string()],
            slack_webhook_url: Some("https://hooks.slack.com/services/T/B/X".to_string()),
        };
        let set = NotifierSet::from_settings(&settings, timeout).unwrap();
        assert_eq!(set.len(), 2);
    }

    #[tokio::test]
    async fn set_succeeds_when_all_succeed() {
        let set = NotifierSet::new(vec![
            Arc::new(mock("a", true)),
            Arc::new(mock("b", true)),
        ]);
        tokio_test::assert_ok!(set.notify(&request()).await);
    }

    #[tokio::test]
    async fn set_tries_every_member_and_reports_failures() {
        let set = NotifierSet::new(vec![
            Arc::new(mock("a", false)),
            Arc::new(mock("b", true)),
            Arc::new(mock("c", false)),
        ]);

        let err = set.notify(&request()).await.unwrap_err();
        match err {
            NotifyError::Partial {
                failed,
                total,
                first_error,
            } => {
                assert_eq!(failed, 2);
                assert_eq!(total, 3);
                assert!(first_error.starts_with("a:"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn empty_set_is_a_no_op() {
        let set = NotifierSet::default();
        assert!(set.is_empty());
        tokio_test::assert_ok!(set.notify(&request()).await);
    }
}
