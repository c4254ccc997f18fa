//! Pluggable LLM provider trait and request/response types.
//!
//! Implementations translate provider-agnostic [`CompletionRequest`]s into
//! provider-specific SDK calls. This keeps all research logic decoupled from
//! any particular LLM vendor.

mod openai;
pub mod retry;
pub mod schema;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::LlmError;

pub use openai::{OpenAiConfig, OpenAiProvider};

/// Default bound on concurrent synthesis-class LLM calls.
pub const DEFAULT_SYNTHESIS_CONCURRENCY: usize = 5;

/// Token usage reported by a provider for one call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens in the prompt.
    pub prompt_tokens: u32,
    /// Tokens in the completion.
    pub completion_tokens: u32,
    /// Total tokens billed.
    pub total_tokens: u32,
}

/// A plain completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// User prompt.
    pub prompt: String,
    /// Optional system prompt.
    pub system: Option<String>,
    /// Maximum completion tokens (includes reasoning for thinking models).
    pub max_completion_tokens: u32,
    /// Optional per-request deadline.
    pub timeout: Option<Duration>,
}

impl CompletionRequest {
    /// Creates a request with just a prompt and an output budget.
    #[must_use]
    pub fn new(prompt: impl Into<String>, max_completion_tokens: u32) -> Self {
        Self {
            prompt: prompt.into(),
            system: None,
            max_completion_tokens,
            timeout: None,
        }
    }

    /// Attaches a system prompt.
    #[must_use]
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Attaches a deadline.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Completion returned by a provider.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    /// Generated text.
    pub content: String,
    /// Token usage for this call.
    pub usage: TokenUsage,
    /// Why the model stopped (e.g. `"stop"`, `"length"`).
    pub finish_reason: Option<String>,
}

/// A structured-output request with an enforced JSON schema.
#[derive(Debug, Clone)]
pub struct StructuredRequest {
    /// User prompt.
    pub prompt: String,
    /// Optional system prompt.
    pub system: Option<String>,
    /// JSON schema the completion must satisfy. The provider implementation
    /// passes it through [`schema::enforce_no_additional_properties`] before
    /// sending, since some providers reject anything else.
    pub json_schema: serde_json::Value,
    /// Maximum completion tokens.
    pub max_completion_tokens: u32,
}

impl StructuredRequest {
    /// Creates a structured request.
    #[must_use]
    pub fn new(
        prompt: impl Into<String>,
        json_schema: serde_json::Value,
        max_completion_tokens: u32,
    ) -> Self {
        Self {
            prompt: prompt.into(),
            system: None,
            json_schema,
            max_completion_tokens,
        }
    }

    /// Attaches a system prompt.
    #[must_use]
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

/// Trait for LLM provider backends.
///
/// Implementations handle the transport layer (HTTP, SDK calls, retries)
/// while presenting a uniform interface to the research pipeline.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name (e.g. `"openai"`).
    fn name(&self) -> &'static str;

    /// Model identifier used for completions.
    fn model(&self) -> &str;

    /// Executes a completion request.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError`] on API failures, timeouts, or empty content.
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError>;

    /// Executes a structured completion and returns the parsed JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError`] on API failures or schema/JSON violations.
    async fn complete_structured(
        &self,
        request: &StructuredRequest,
    ) -> Result<serde_json::Value, LlmError>;

    /// Estimates the token count of a text.
    ///
    /// The default heuristic is one token per four characters, which is
    /// accurate enough for budget arithmetic.
    fn estimate_tokens(&self, text: &str) -> usize {
        text.len().div_ceil(4)
    }

    /// Maximum concurrent synthesis-class calls this provider tolerates.
    fn synthesis_concurrency(&self) -> usize {
        DEFAULT_SYNTHESIS_CONCURRENCY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullProvider;

    #[async_trait]
    impl LlmProvider for NullProvider {
        fn name(&self) -> &'static str {
            "null"
        }

        fn model(&self) -> &str {
            "null-model"
        }

        async fn complete(&self, _request: &CompletionRequest) -> Result<Completion, LlmError> {
            Ok(Completion::default())
        }

        async fn complete_structured(
            &self,
            _request: &StructuredRequest,
        ) -> Result<serde_json::Value, LlmError> {
            Ok(serde_json::Value::Null)
        }
    }

    #[test]
    fn test_estimate_tokens_default() {
        let provider = NullProvider;
        assert_eq!(provider.estimate_tokens(""), 0);
        assert_eq!(provider.estimate_tokens("abcd"), 1);
        assert_eq!(provider.estimate_tokens("abcde"), 2);
        assert_eq!(provider.estimate_tokens(&"x".repeat(400)), 100);
    }

    #[test]
    fn test_default_synthesis_concurrency() {
        assert_eq!(NullProvider.synthesis_concurrency(), 5);
    }

    #[test]
    fn test_completion_request_builder() {
        let req = CompletionRequest::new("hello", 1024)
            .with_system("be terse")
            .with_timeout(Duration::from_secs(30));
        assert_eq!(req.prompt, "hello");
        assert_eq!(req.system.as_deref(), Some("be terse"));
        assert_eq!(req.max_completion_tokens, 1024);
        assert_eq!(req.timeout, Some(Duration::from_secs(30)));
    }
}
