//! OpenAI-compatible provider implementation.
//!
//! Works with OpenAI, Ollama, vLLM, LM Studio, and other compatible endpoints.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use url::Url;

use super::traits::{
    CompletionRequest, CompletionResponse, LlmError, LlmProvider, LlmResult, Message, Role,
    TokenUsage,
};

/// Default base URL for OpenAI API.
pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// OpenAI API request format.
#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiMessage {
    role: &'static str,
    content: String,
}

impl From<&Message> for OpenAiMessage {
    fn from(msg: &Message) -> Self {
        Self {
            role: match msg.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
            },
            content: msg.content.clone(),
        }
    }
}

/// OpenAI API response format.
#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiResponseMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: usize,
    completion_tokens: usize,
    total_tokens: usize,
}

/// OpenAI API error response.
#[derive(Debug, Deserialize)]
struct OpenAiError {
    error: OpenAiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct OpenAiErrorDetail {
    message: String,
    code: Option<String>,
}

/// Provider for OpenAI-compatible chat completion APIs.
///
/// Works with:
/// - OpenAI API (api.openai.com)
/// - Ollama (localhost:11434/v1)
/// - vLLM
/// - LM Studio
pub struct OpenAiCompatibleProvider {
    client: reqwest::Client,
    endpoint: Url,
    api_key: Option<String>,
    model: String,
}

impl OpenAiCompatibleProvider {
    /// Creates a provider for OpenAI's API.
    pub fn openai(api_key: impl Into<String>, model: impl Into<String>) -> LlmResult<Self> {
        Self::custom(OPENAI_BASE_URL, Some(api_key.into()), model)
    }

    /// Creates a provider for a custom endpoint.
    ///
    /// `base_url` is the API root, e.g. `http://localhost:11434/v1`.
    pub fn custom(
        base_url: &str,
        api_key: Option<String>,
        model: impl Into<String>,
    ) -> LlmResult<Self> {
        let root = format!("{}/", base_url.trim_end_matches('/'));
        let endpoint = Url::parse(&root)
            .and_then(|base| base.join("chat/completions"))
            .map_err(|e| LlmError::Config(format!("invalid base url {}: {}", base_url, e)))?;

        Ok(Self {
            client: reqwest::Client::new(),
            endpoint,
            api_key,
            model: model.into(),
        })
    }

    /// Sets a whole-request timeout on the HTTP client.
    pub fn with_timeout(mut self, timeout: Duration) -> LlmResult<Self> {
        self.client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(self)
    }

    /// Overrides the HTTP client (useful for custom timeouts or proxies).
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    /// The chat completions URL requests are sent to.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn build_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(ref api_key) = self.api_key {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", api_key)) {
                headers.insert(AUTHORIZATION, value);
            }
        }

        headers
    }

    fn build_request(&self, request: &CompletionRequest) -> OpenAiRequest {
        let mut messages: Vec<OpenAiMessage> = Vec::with_capacity(request.messages.len() + 1);

        if let Some(ref system) = request.system_prompt {
            messages.push(OpenAiMessage {
                role: "system",
                content: system.clone(),
            });
        }
        messages.extend(request.messages.iter().map(OpenAiMessage::from));

        OpenAiRequest {
            model: self.model.clone(),
            messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        }
    }

    async fn handle_error_response(&self, response: reqwest::Response) -> LlmError {
        let status = response.status().as_u16();

        if status == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());

            return LlmError::RateLimited {
                retry_after_secs: retry_after,
            };
        }

        match response.json::<OpenAiError>().await {
            Ok(error) if status == 401 || error.error.code.as_deref() == Some("invalid_api_key") => {
                LlmError::AuthenticationError(error.error.message)
            }
            Ok(error) => LlmError::ApiError {
                status,
                message: error.error.message,
            },
            Err(_) => LlmError::ApiError {
                status,
                message: format!("HTTP {}", status),
            },
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        "openai-compatible"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &CompletionRequest) -> LlmResult<CompletionResponse> {
        let body = self.build_request(request);

        let response = self
            .client
            .post(self.endpoint.clone())
            .headers(self.build_headers())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout
                } else if e.is_connect() {
                    LlmError::Unavailable(e.to_string())
                } else {
                    LlmError::HttpError(e)
                }
            })?;

        if !response.status().is_success() {
            return Err(self.handle_error_response(response).await);
        }

        let api_response: OpenAiResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(format!("Failed to parse response: {}", e)))?;

        let choice = api_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse("No choices in response".to_string()))?;

        let tokens_used = api_response
            .usage
            .map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            })
            .unwrap_or_default();

        tracing::trace!(
            model = %self.model,
            total_tokens = tokens_used.total_tokens,
            "Completion finished"
        );

        Ok(CompletionResponse {
            text: choice.message.content.unwrap_or_default(),
            tokens_used,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_puts_system_prompt_first() {
        let request = CompletionRequest::new(vec![Message::user("Subject: hi")])
            .with_system_prompt("Pick one label")
            .with_max_tokens(10);

        let provider = OpenAiCompatibleProvider::openai("test-key", "gpt-4o").unwrap();
        let body = serde_json::to_value(provider.build_request(&request)).unwrap();

        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "Subject: hi");
        assert_eq!(body["temperature"], 0.0);
        assert_eq!(body["max_tokens"], 10);
    }

    #[test]
    fn response_parsing() {
        let json = r#"{
            "choices": [{
                "message": {"content": "Interested"},
                "finish_reason": "stop"
            }],
            "usage": {
                "prompt_tokens": 10,
                "completion_tokens": 1,
                "total_tokens": 11
            }
        }"#;

        let response: OpenAiResponse = serde_json::from_str(json).unwrap();
        assert_eq!(
            response.choices[0].message.content.as_deref(),
            Some("Interested")
        );
        assert_eq!(response.usage.as_ref().unwrap().total_tokens, 11);
    }

    #[test]
    fn endpoint_keeps_api_prefix() {
        let provider = OpenAiCompatibleProvider::openai("k", "gpt-4o").unwrap();
        assert_eq!(
            provider.endpoint().as_str(),
            "https://api.openai.com/v1/chat/completions"
        );

        let local =
            OpenAiCompatibleProvider::custom("http://localhost:11434/v1/", None, "llama3").unwrap();
        assert_eq!(
            local.endpoint().as_str(),
            "http://localhost:11434/v1/chat/completions"
        );
        assert!(local.api_key.is_none());
        assert_eq!(local.model(), "llama3");
    }

    #[test]
    fn invalid_base_url_is_config_error() {
        let result = OpenAiCompatibleProvider::custom("not a url", None, "m");
        assert!(matches!(result, Err(LlmError::Config(_))));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_transient() {
        let provider = OpenAiCompatibleProvider::custom("http://127.0.0.1:1/v1", None, "m")
            .unwrap()
            .with_timeout(Duration::from_secs(5))
            .unwrap();

        let err = provider
            .complete(&CompletionRequest::new(vec![Message::user("hi")]))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
