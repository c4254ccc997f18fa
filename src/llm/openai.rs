//! `OpenAI` provider implementation using the `async-openai` crate.
//!
//! Supports any `OpenAI`-compatible API (`OpenAI`, Azure, local proxies)
//! via the base URL override in [`OpenAiConfig`]. Structured outputs use
//! JSON-schema response formats with `additionalProperties: false` enforced
//! recursively, since the API rejects anything else in strict mode.

use std::time::Duration;

use async_openai::Client;
use async_openai::config::OpenAIConfig;
use async_openai::types::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessage,
    ChatCompletionRequestSystemMessageContent, ChatCompletionRequestUserMessage,
    ChatCompletionRequestUserMessageContent, CreateChatCompletionRequest, ResponseFormat,
    ResponseFormatJsonSchema,
};
use async_trait::async_trait;

use super::retry::RetryPolicy;
use super::schema::enforce_no_additional_properties;
use super::{Completion, CompletionRequest, LlmProvider, StructuredRequest, TokenUsage};
use crate::error::{LlmError, LlmErrorKind};

/// Configuration for the `OpenAI`-compatible provider.
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    /// API key.
    pub api_key: String,
    /// Optional base URL override (for proxies or compatible APIs).
    pub base_url: Option<String>,
    /// Model identifier.
    pub model: String,
    /// Maximum concurrent synthesis-class calls.
    pub synthesis_concurrency: usize,
    /// Transport retry policy.
    pub retry: RetryPolicy,
}

impl OpenAiConfig {
    /// Builds configuration from environment variables.
    ///
    /// Reads `OPENAI_API_KEY` (or `QUARRY_API_KEY`), `OPENAI_BASE_URL`, and
    /// `QUARRY_LLM_MODEL`.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError`] with [`LlmErrorKind::MissingConfig`] when no API
    /// key is present.
    pub fn from_env() -> Result<Self, LlmError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .or_else(|_| std::env::var("QUARRY_API_KEY"))
            .map_err(|_| {
                LlmError::new(
                    LlmErrorKind::MissingConfig,
                    "no API key found (set OPENAI_API_KEY or QUARRY_API_KEY)",
                )
            })?;
        Ok(Self {
            api_key,
            base_url: std::env::var("OPENAI_BASE_URL").ok(),
            model: std::env::var("QUARRY_LLM_MODEL")
                .unwrap_or_else(|_| "gpt-5.2-2025-12-11".to_string()),
            synthesis_concurrency: super::DEFAULT_SYNTHESIS_CONCURRENCY,
            retry: RetryPolicy::default(),
        })
    }
}

/// `OpenAI`-compatible LLM provider.
pub struct OpenAiProvider {
    client: Client<OpenAIConfig>,
    model: String,
    synthesis_concurrency: usize,
    retry: RetryPolicy,
}

impl OpenAiProvider {
    /// Creates a new provider from configuration.
    #[must_use]
    pub fn new(config: &OpenAiConfig) -> Self {
        let mut openai_config = OpenAIConfig::new().with_api_key(&config.api_key);
        if let Some(ref base_url) = config.base_url {
            openai_config = openai_config.with_api_base(base_url);
        }
        Self {
            client: Client::with_config(openai_config),
            model: config.model.clone(),
            synthesis_concurrency: config.synthesis_concurrency,
            retry: config.retry,
        }
    }

    fn build_messages(
        system: Option<&str>,
        prompt: &str,
    ) -> Vec<ChatCompletionRequestMessage> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = system {
            messages.push(ChatCompletionRequestMessage::System(
                ChatCompletionRequestSystemMessage {
                    content: ChatCompletionRequestSystemMessageContent::Text(system.to_string()),
                    name: None,
                },
            ));
        }
        messages.push(ChatCompletionRequestMessage::User(
            ChatCompletionRequestUserMessage {
                content: ChatCompletionRequestUserMessageContent::Text(prompt.to_string()),
                name: None,
            },
        ));
        messages
    }

    async fn execute(
        &self,
        request: CreateChatCompletionRequest,
        timeout: Option<Duration>,
    ) -> Result<Completion, LlmError> {
        let chat = self.client.chat();
        let call = chat.create(request);
        let response = match timeout {
            Some(deadline) => tokio::time::timeout(deadline, call)
                .await
                .map_err(|_| LlmError::timeout(format!("request exceeded {deadline:?}")))?,
            None => call.await,
        }
        .map_err(|e| LlmError::api(e.to_string()))?;

        let choice = response.choices.first();

        let content = choice
            .and_then(|c| c.message.content.as_ref())
            .cloned()
            .unwrap_or_default();

        let finish_reason = choice.and_then(|c| {
            c.finish_reason
                .as_ref()
                .map(|fr| format!("{fr:?}").to_lowercase())
        });

        let usage = response
            .usage
            .map_or_else(TokenUsage::default, |u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            });

        if content.trim().is_empty() {
            let kind = match finish_reason.as_deref() {
                Some("length") => LlmErrorKind::Truncated,
                Some("contentfilter" | "content_filter") => LlmErrorKind::ContentFilter,
                _ => LlmErrorKind::EmptyContent,
            };
            return Err(LlmError::new(
                kind,
                format!("llm returned empty response (finish_reason={finish_reason:?})"),
            ));
        }

        Ok(Completion {
            content,
            usage,
            finish_reason,
        })
    }
}

impl std::fmt::Debug for OpenAiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiProvider")
            .field("model", &self.model)
            .field("synthesis_concurrency", &self.synthesis_concurrency)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError> {
        let openai_request = CreateChatCompletionRequest {
            model: self.model.clone(),
            messages: Self::build_messages(request.system.as_deref(), &request.prompt),
            max_completion_tokens: Some(request.max_completion_tokens),
            ..Default::default()
        };

        self.retry
            .run("openai complete", || {
                self.execute(openai_request.clone(), request.timeout)
            })
            .await
    }

    async fn complete_structured(
        &self,
        request: &StructuredRequest,
    ) -> Result<serde_json::Value, LlmError> {
        let schema = enforce_no_additional_properties(request.json_schema.clone());
        let response_format = ResponseFormat::JsonSchema {
            json_schema: ResponseFormatJsonSchema {
                description: None,
                name: "structured_output".to_string(),
                schema: Some(schema),
                strict: Some(true),
            },
        };

        let openai_request = CreateChatCompletionRequest {
            model: self.model.clone(),
            messages: Self::build_messages(request.system.as_deref(), &request.prompt),
            max_completion_tokens: Some(request.max_completion_tokens),
            response_format: Some(response_format),
            ..Default::default()
        };

        let completion = self
            .retry
            .run("openai complete_structured", || {
                self.execute(openai_request.clone(), None)
            })
            .await?;

        let value: serde_json::Value = serde_json::from_str(&completion.content)
            .map_err(|e| LlmError::invalid(format!("llm structured completion failed: {e}")))?;
        Ok(value)
    }

    fn synthesis_concurrency(&self) -> usize {
        self.synthesis_concurrency
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> OpenAiConfig {
        OpenAiConfig {
            api_key: "test-key".to_string(),
            base_url: None,
            model: "gpt-5.2-2025-12-11".to_string(),
            synthesis_concurrency: 5,
            retry: RetryPolicy::default(),
        }
    }

    #[test]
    fn test_provider_identity() {
        let provider = OpenAiProvider::new(&config());
        assert_eq!(provider.name(), "openai");
        assert_eq!(provider.model(), "gpt-5.2-2025-12-11");
        assert_eq!(provider.synthesis_concurrency(), 5);
    }

    #[test]
    fn test_build_messages_with_system() {
        let messages = OpenAiProvider::build_messages(Some("be terse"), "hello");
        assert_eq!(messages.len(), 2);
        assert!(matches!(
            messages[0],
            ChatCompletionRequestMessage::System(_)
        ));
        assert!(matches!(messages[1], ChatCompletionRequestMessage::User(_)));
    }

    #[test]
    fn test_build_messages_without_system() {
        let messages = OpenAiProvider::build_messages(None, "hello");
        assert_eq!(messages.len(), 1);
        assert!(matches!(messages[0], ChatCompletionRequestMessage::User(_)));
    }
}
