//! LLM provider implementations.
//!
//! This module provides the chat-completion interface the categorization
//! oracle talks to.
//!
//! # Supported Providers
//!
//! - **OpenAI-compatible**: Works with OpenAI, Ollama, vLLM, LM Studio, and other compatible endpoints
//!
//! # Example
//!
//! ```rust,no_run
//! use onebox::providers::ai::{CompletionRequest, LlmProvider, Message, OpenAiCompatibleProvider};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let openai = OpenAiCompatibleProvider::openai("sk-...", "gpt-4o")?;
//!
//! let request = CompletionRequest::new(vec![Message::user("Subject: Re: pricing")])
//!     .with_system_prompt("Answer with one category label.");
//!
//! let response = openai.complete(&request).await?;
//! println!("Label: {}", response.text);
//! # Ok(())
//! # }
//! ```

mod openai;
mod traits;

pub use openai::{OpenAiCompatibleProvider, OPENAI_BASE_URL};
pub use traits::{
    CompletionRequest, CompletionResponse, LlmError, LlmProvider, LlmResult, Message, Role,
    TokenUsage,
};
