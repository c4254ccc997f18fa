//! Query expansion and follow-up question generation.
//!
//! Both operations are structured LLM calls that carry the root query to
//! prevent drift. Failures degrade gracefully: expansion falls back to the
//! original query, question generation to an empty list.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::core::{Chunk, ResearchContext};
use crate::llm::schema::string_array_schema;
use crate::llm::{LlmProvider, StructuredRequest};
use crate::research::models::{
    MAX_FOLLOWUP_QUESTIONS, QUERY_EXPANSION_TOKENS, QUESTION_SYNTHESIS_TOKENS,
};

/// Expands a query into multiple diverse semantic search queries.
pub struct QueryExpander {
    llm: Arc<dyn LlmProvider>,
    num_expanded_queries: usize,
}

impl QueryExpander {
    /// Creates an expander generating `num_expanded_queries` extra queries.
    #[must_use]
    pub fn new(llm: Arc<dyn LlmProvider>, num_expanded_queries: usize) -> Self {
        Self {
            llm,
            num_expanded_queries,
        }
    }

    /// Expands `query` into `[query, expansion...]`, prepending the original
    /// so embedding position bias favors the user's phrasing.
    ///
    /// Falls back to `[query]` when the LLM fails or returns too few
    /// queries.
    pub async fn expand(&self, query: &str, context: &ResearchContext) -> Vec<String> {
        let num_queries = self.num_expanded_queries;
        let schema = string_array_schema(
            "queries",
            "expanded search queries (semantically complete sentences)",
        );

        let context_str = if context.ancestors.is_empty() {
            String::new()
        } else {
            let start = context.ancestors.len().saturating_sub(2);
            format!("\nPrior: {}", context.ancestors[start..].join(" → "))
        };

        let prompt = format!(
            "Generate exactly {num_queries} alternative search queries for code \
             retrieval. Each must be a complete sentence approaching the question \
             from a different angle (data flow, naming conventions, error paths, \
             configuration).\n\n\
             ROOT QUERY: {}\n\
             CURRENT QUERY: {query}{context_str}",
            context.root_query
        );

        let request = StructuredRequest::new(prompt, schema, QUERY_EXPANSION_TOKENS)
            .with_system("You write diverse code-search queries. Output JSON only.");

        match self.llm.complete_structured(&request).await {
            Ok(value) => {
                let expanded: Vec<String> = value
                    .get("queries")
                    .and_then(|v| v.as_array())
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(|q| q.as_str())
                            .map(str::trim)
                            .filter(|q| !q.is_empty())
                            .map(ToString::to_string)
                            .collect()
                    })
                    .unwrap_or_default();

                if expanded.len() < num_queries {
                    warn!(
                        "query expansion returned {} queries, expected {num_queries}; \
                         using original query only",
                        expanded.len()
                    );
                    return vec![query.to_string()];
                }

                let mut queries = vec![query.to_string()];
                for candidate in expanded.into_iter().take(num_queries) {
                    if !queries.contains(&candidate) {
                        queries.push(candidate);
                    }
                }
                debug!("expanded query into {} variations", queries.len());
                queries
            }
            Err(e) => {
                warn!("query expansion failed: {e}, using original query only");
                vec![query.to_string()]
            }
        }
    }
}

/// Generates follow-up questions for BFS exploration.
pub struct QuestionGenerator {
    llm: Arc<dyn LlmProvider>,
}

impl QuestionGenerator {
    /// Creates a question generator.
    #[must_use]
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }

    /// Generates up to [`MAX_FOLLOWUP_QUESTIONS`] follow-up questions from a
    /// node's discoveries.
    ///
    /// The prompt carries the root query, an explored-files summary so the
    /// model avoids re-asking about saturated files, short chunk previews,
    /// and the constants context. Failures yield an empty list.
    pub async fn follow_up_questions(
        &self,
        query: &str,
        context: &ResearchContext,
        chunks: &[Chunk],
        exploration_gist: Option<&str>,
        followup_output_tokens: u32,
        constants_context: &str,
    ) -> Vec<String> {
        let schema = string_array_schema("questions", "follow-up research questions");

        let mut previews: Vec<String> = Vec::new();
        for chunk in chunks.iter().take(10) {
            let preview: String = chunk.content.chars().take(200).collect();
            previews.push(format!(
                "{}:{}-{}\n{preview}",
                chunk.file_path, chunk.start_line, chunk.end_line
            ));
        }

        let gist = exploration_gist.unwrap_or("");
        let constants_section = if constants_context.is_empty() {
            String::new()
        } else {
            format!("\n{constants_context}\n")
        };

        let prompt = format!(
            "ROOT QUERY: {}\n{constants_section}\
             CURRENT QUESTION: {query}\n\n{gist}\n\n\
             DISCOVERED CHUNKS ({} total, previews):\n{}\n\n\
             Generate at most {MAX_FOLLOWUP_QUESTIONS} follow-up questions that \
             would uncover code the ROOT QUERY needs but the chunks above do not \
             show. Skip questions about files already fully explored. Output JSON \
             with a questions array; return an empty array when nothing useful \
             remains.",
            context.root_query,
            chunks.len(),
            previews.join("\n---\n"),
        );

        let request = StructuredRequest::new(prompt, schema, followup_output_tokens);
        match self.llm.complete_structured(&request).await {
            Ok(value) => {
                let questions: Vec<String> = value
                    .get("questions")
                    .and_then(|v| v.as_array())
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(|q| q.as_str())
                            .map(str::trim)
                            .filter(|q| !q.is_empty())
                            .map(ToString::to_string)
                            .take(MAX_FOLLOWUP_QUESTIONS)
                            .collect()
                    })
                    .unwrap_or_default();
                debug!("generated {} follow-up questions", questions.len());
                questions
            }
            Err(e) => {
                warn!("follow-up generation failed: {e}");
                Vec::new()
            }
        }
    }

    /// Collapses an oversized question set down to `target_count` questions,
    /// each covering a distinct unexplored aspect.
    ///
    /// Falls back to truncation when the LLM fails.
    pub async fn synthesize_questions(
        &self,
        questions: Vec<String>,
        context: &ResearchContext,
        target_count: usize,
    ) -> Vec<String> {
        if questions.len() <= target_count {
            return questions;
        }

        let schema = string_array_schema(
            "questions",
            "synthesized research questions, each exploring a distinct aspect",
        );
        let listing: String = questions
            .iter()
            .map(|q| format!("- {q}"))
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = format!(
            "ROOT QUERY: {}\n\n\
             The following {} candidate questions overlap. Merge them into exactly \
             {target_count} questions that together cover the distinct aspects \
             relevant to the ROOT QUERY:\n{listing}\n\nOutput JSON with a questions array.",
            context.root_query,
            questions.len(),
        );

        let request = StructuredRequest::new(prompt, schema, QUESTION_SYNTHESIS_TOKENS);
        match self.llm.complete_structured(&request).await {
            Ok(value) => {
                let synthesized: Vec<String> = value
                    .get("questions")
                    .and_then(|v| v.as_array())
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(|q| q.as_str())
                            .map(str::trim)
                            .filter(|q| !q.is_empty())
                            .map(ToString::to_string)
                            .take(target_count)
                            .collect()
                    })
                    .unwrap_or_default();
                if synthesized.is_empty() {
                    let mut fallback = questions;
                    fallback.truncate(target_count);
                    fallback
                } else {
                    synthesized
                }
            }
            Err(e) => {
                warn!("question synthesis failed: {e}, truncating instead");
                let mut fallback = questions;
                fallback.truncate(target_count);
                fallback
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::llm::{Completion, CompletionRequest};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    /// Scripted structured-output provider.
    struct ScriptedLlm {
        responses: Mutex<Vec<Result<serde_json::Value, LlmError>>>,
    }

    impl ScriptedLlm {
        fn new(responses: Vec<Result<serde_json::Value, LlmError>>) -> Self {
            Self {
                responses: Mutex::new(responses),
            }
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedLlm {
        fn name(&self) -> &'static str {
            "scripted"
        }
        fn model(&self) -> &str {
            "scripted"
        }
        async fn complete(&self, _request: &CompletionRequest) -> Result<Completion, LlmError> {
            Ok(Completion::default())
        }
        async fn complete_structured(
            &self,
            _request: &StructuredRequest,
        ) -> Result<serde_json::Value, LlmError> {
            self.responses
                .lock()
                .unwrap_or_else(|_| unreachable!())
                .pop()
                .unwrap_or(Ok(serde_json::Value::Null))
        }
    }

    #[tokio::test]
    async fn test_expand_prepends_original() {
        let llm = Arc::new(ScriptedLlm::new(vec![Ok(json!({
            "queries": ["where is backoff configured", "what errors trigger retries"],
        }))]));
        let expander = QueryExpander::new(llm, 2);
        let context = ResearchContext::new("how does retry work");
        let queries = expander.expand("how does retry work", &context).await;
        assert_eq!(queries.len(), 3);
        assert_eq!(queries[0], "how does retry work");
    }

    #[tokio::test]
    async fn test_expand_too_few_falls_back() {
        let llm = Arc::new(ScriptedLlm::new(vec![Ok(json!({"queries": ["only one"]}))]));
        let expander = QueryExpander::new(llm, 2);
        let context = ResearchContext::new("root");
        let queries = expander.expand("root", &context).await;
        assert_eq!(queries, vec!["root".to_string()]);
    }

    #[tokio::test]
    async fn test_expand_error_falls_back() {
        let llm = Arc::new(ScriptedLlm::new(vec![Err(LlmError::empty("nothing"))]));
        let expander = QueryExpander::new(llm, 2);
        let context = ResearchContext::new("root");
        assert_eq!(expander.expand("root", &context).await, vec!["root"]);
    }

    #[tokio::test]
    async fn test_expand_dedupes_repeated_expansion() {
        let llm = Arc::new(ScriptedLlm::new(vec![Ok(json!({
            "queries": ["root", "different angle"],
        }))]));
        let expander = QueryExpander::new(llm, 2);
        let context = ResearchContext::new("root");
        let queries = expander.expand("root", &context).await;
        assert_eq!(queries, vec!["root", "different angle"]);
    }

    #[tokio::test]
    async fn test_follow_ups_capped() {
        let llm = Arc::new(ScriptedLlm::new(vec![Ok(json!({
            "questions": ["q1", "q2", "q3", "q4", "q5"],
        }))]));
        let generator = QuestionGenerator::new(llm);
        let context = ResearchContext::new("root");
        let questions = generator
            .follow_up_questions("root", &context, &[], None, 8_000, "")
            .await;
        assert_eq!(questions.len(), MAX_FOLLOWUP_QUESTIONS);
    }

    #[tokio::test]
    async fn test_follow_ups_empty_on_error() {
        let llm = Arc::new(ScriptedLlm::new(vec![Err(LlmError::empty("boom"))]));
        let generator = QuestionGenerator::new(llm);
        let context = ResearchContext::new("root");
        let questions = generator
            .follow_up_questions("root", &context, &[], None, 8_000, "")
            .await;
        assert!(questions.is_empty());
    }

    #[tokio::test]
    async fn test_synthesize_passthrough_when_under_target() {
        let llm = Arc::new(ScriptedLlm::new(vec![]));
        let generator = QuestionGenerator::new(llm);
        let context = ResearchContext::new("root");
        let input = vec!["a".to_string(), "b".to_string()];
        let result = generator.synthesize_questions(input.clone(), &context, 3).await;
        assert_eq!(result, input);
    }

    #[tokio::test]
    async fn test_synthesize_collapses() {
        let llm = Arc::new(ScriptedLlm::new(vec![Ok(json!({
            "questions": ["merged one", "merged two"],
        }))]));
        let generator = QuestionGenerator::new(llm);
        let context = ResearchContext::new("root");
        let input: Vec<String> = (0..6).map(|i| format!("q{i}")).collect();
        let result = generator.synthesize_questions(input, &context, 2).await;
        assert_eq!(result, vec!["merged one", "merged two"]);
    }

    #[tokio::test]
    async fn test_synthesize_truncates_on_error() {
        let llm = Arc::new(ScriptedLlm::new(vec![Err(LlmError::empty("boom"))]));
        let generator = QuestionGenerator::new(llm);
        let context = ResearchContext::new("root");
        let input: Vec<String> = (0..6).map(|i| format!("q{i}")).collect();
        let result = generator.synthesize_questions(input, &context, 2).await;
        assert_eq!(result, vec!["q0", "q1"]);
    }
}
