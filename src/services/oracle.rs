//! Categorization oracle.
//!
//! The oracle answers one question: which category label fits this subject
//! and body. [`LlmCategoryOracle`] asks a chat-completion model; tests plug in
//! their own [`CategoryOracle`].

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::ClassifierSettings;
use crate::domain::Category;
use crate::providers::ai::{
    CompletionRequest, LlmError, LlmProvider, LlmResult, Message, OpenAiCompatibleProvider,
};

/// Raw answer from the oracle, before it is mapped onto the category set.
#[derive(Debug, Clone, PartialEq)]
pub struct OracleAnswer {
    pub label: String,
    pub confidence: Option<f32>,
}

impl OracleAnswer {
    pub fn label(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            confidence: None,
        }
    }
}

/// Errors returned by an oracle call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OracleError {
    #[error("oracle call timed out")]
    Timeout,

    #[error("oracle rate limited, retry after {retry_after_secs:?}s")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("oracle unavailable: {0}")]
    Unavailable(String),

    #[error("oracle rejected the request: {0}")]
    Rejected(String),
}

impl OracleError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, OracleError::Rejected(_))
    }
}

impl From<LlmError> for OracleError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::Timeout => OracleError::Timeout,
            LlmError::RateLimited { retry_after_secs } => {
                OracleError::RateLimited { retry_after_secs }
            }
            other if other.is_transient() => OracleError::Unavailable(other.to_string()),
            other => OracleError::Rejected(other.to_string()),
        }
    }
}

/// Something that can assign a category label to message text.
#[async_trait]
pub trait CategoryOracle: Send + Sync {
    async fn classify_text(&self, subject: &str, body: &str) -> Result<OracleAnswer, OracleError>;
}

/// Oracle backed by an LLM chat completion.
pub struct LlmCategoryOracle {
    provider: Arc<dyn LlmProvider>,
    temperature: f32,
    max_body_chars: usize,
}

impl LlmCategoryOracle {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            provider,
            temperature: 0.0,
            max_body_chars: 4_000,
        }
    }

    /// Builds the oracle over an OpenAI-compatible endpoint.
    pub fn from_settings(settings: &ClassifierSettings, api_key: Option<String>) -> LlmResult<Self> {
        let provider = OpenAiCompatibleProvider::custom(&settings.base_url, api_key, &settings.model)?
            .with_timeout(settings.call_timeout())?;

        Ok(Self {
            provider: Arc::new(provider),
            temperature: settings.temperature,
            max_body_chars: settings.max_body_chars,
        })
    }

    pub fn with_max_body_chars(mut self, max_body_chars: usize) -> Self {
        self.max_body_chars = max_body_chars;
        self
    }

    fn system_prompt() -> String {
        let labels: Vec<&str> = Category::ASSIGNABLE.iter().map(|c| c.label()).collect();
        format!(
            "You sort incoming email for a sales inbox. Reply with exactly one of \
             these categories and nothing else: {}.",
            labels.join(", ")
        )
    }

    fn build_request(&self, subject: &str, body: &str) -> CompletionRequest {
        let body: String = body.chars().take(self.max_body_chars).collect();
        let content = format!("Subject: {}\n\n{}", subject, body);

        CompletionRequest::new(vec![Message::user(content)])
            .with_system_prompt(Self::system_prompt())
            .with_temperature(self.temperature)
            .with_max_tokens(10)
    }
}

#[async_trait]
impl CategoryOracle for LlmCategoryOracle {
    async fn classify_text(&self, subject: &str, body: &str) -> Result<OracleAnswer, OracleError> {
        let request = self.build_request(subject, body);
        let response = self.provider.complete(&request).await?;

        let label = response.text.lines().next().unwrap_or_default().trim();
        tracing::trace!(model = self.provider.model(), label, "Oracle answered");

        Ok(OracleAnswer::label(label))
    }
}
