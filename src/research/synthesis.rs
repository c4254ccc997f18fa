//! Synthesis engine: single-pass and map-reduce answer generation.
//!
//! Single-pass builds one prompt from the reference table, evidence
//! contexts, and per-file code sections, and calls the synthesis LLM with a
//! fixed output budget. Map-reduce synthesizes each cluster independently
//! under a concurrency semaphore with cluster-local reference maps and
//! proportional output budgets, then remaps citations to a global map and
//! reduces. The sources footer is appended after synthesis, outside the LLM
//! output budget.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::citations::{CitationManager, ReferenceMap};
use super::evidence::EvidenceLedger;
use super::models::{
    MIN_SYNTHESIS_LENGTH, OUTPUT_TOKENS_WITH_REASONING, SINGLE_PASS_TIMEOUT_SECONDS,
    TARGET_OUTPUT_TOKENS,
};
use crate::core::Chunk;
use crate::error::{Error, ResearchError};
use crate::llm::{CompletionRequest, LlmProvider};
use crate::research::clustering::ClusterGroup;

const CITATION_REQUIREMENTS: &str = "Cite sources with bracketed reference numbers [N] \
from the Source References table. Every claim about specific code must carry at least \
one citation. Do not invent reference numbers.";

/// One cluster's map-phase output.
struct ClusterSummary {
    cluster_id: usize,
    summary: String,
    file_paths: Vec<String>,
    reference_map: ReferenceMap,
}

/// Synthesizes research results into cited answers.
pub struct SynthesisEngine {
    llm: Arc<dyn LlmProvider>,
}

impl SynthesisEngine {
    /// Creates a synthesis engine.
    #[must_use]
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }

    /// Builds per-file code sections: chunk excerpts with line markers when
    /// chunks exist for the file, full content otherwise.
    fn build_code_context(chunks: &[Chunk], files: &BTreeMap<String, String>) -> String {
        let mut chunks_by_file: BTreeMap<&str, Vec<&Chunk>> = BTreeMap::new();
        for chunk in chunks {
            chunks_by_file.entry(&chunk.file_path).or_default().push(chunk);
        }

        let separator = "=".repeat(80);
        let mut sections = Vec::with_capacity(files.len());
        for (file_path, content) in files {
            let file_content = chunks_by_file.get(file_path.as_str()).map_or_else(
                || content.clone(),
                |file_chunks| {
                    let mut sorted: Vec<&&Chunk> = file_chunks.iter().collect();
                    sorted.sort_by_key(|c| c.start_line);
                    sorted
                        .iter()
                        .map(|c| format!("# Lines {}-{}\n{}", c.start_line, c.end_line, c.content))
                        .collect::<Vec<_>>()
                        .join("\n\n")
                },
            );
            sections.push(format!("### {file_path}\n{separator}\n{file_content}\n{separator}"));
        }
        sections.join("\n\n")
    }

    /// Single-pass synthesis over the full filtered chunk/file set.
    ///
    /// # Errors
    ///
    /// Returns [`ResearchError::ShortAnswer`] when the answer falls below
    /// the minimum length, or the LLM error on call failure. An empty
    /// `files` map is a bug upstream and raises [`ResearchError::DataLoss`].
    pub async fn single_pass(
        &self,
        root_query: &str,
        chunks: &[Chunk],
        files: &BTreeMap<String, String>,
        ledger: &EvidenceLedger,
    ) -> Result<String, Error> {
        if files.is_empty() {
            return Err(ResearchError::DataLoss {
                chunk_count: chunks.len(),
                file_count: 0,
                base_dir: String::new(),
            }
            .into());
        }

        // Filter chunks to budgeted files so the reference map, citations,
        // and footer all describe the same set
        let budgeted_chunks = CitationManager::filter_chunks_to_files(chunks, files);
        info!(
            "starting single-pass synthesis with {} files, {} chunks \
             (filtered from {})",
            files.len(),
            budgeted_chunks.len(),
            chunks.len()
        );

        let reference_map = CitationManager::build_reference_map(&budgeted_chunks, files);
        let reference_table = CitationManager::format_reference_table(&reference_map);
        let code_context = Self::build_code_context(&budgeted_chunks, files);

        let constants_context = ledger.constants_prompt_context(50);
        let facts_context = ledger.facts_reduce_prompt_context();
        let mut query_with_context = root_query.to_string();
        if !constants_context.is_empty() {
            query_with_context.push_str("\n\n");
            query_with_context.push_str(&constants_context);
        }
        if !facts_context.is_empty() {
            query_with_context.push_str("\n\n");
            query_with_context.push_str(&facts_context);
        }

        let system = format!(
            "You are a code research assistant producing a comprehensive, \
             accurate answer grounded in the provided code.\n\n\
             {CITATION_REQUIREMENTS}\n\n\
             Target output: ~{TARGET_OUTPUT_TOKENS} tokens (includes reasoning)."
        );
        let prompt = format!(
            "Query: {query_with_context}\n\n{reference_table}\n\n\
             Analyze the following code and answer the query comprehensively:\n\n\
             {code_context}"
        );

        let request = CompletionRequest::new(prompt, OUTPUT_TOKENS_WITH_REASONING)
            .with_system(system)
            .with_timeout(Duration::from_secs(SINGLE_PASS_TIMEOUT_SECONDS));
        let response = self.llm.complete(&request).await.map_err(Error::Llm)?;

        let mut answer = response.content;
        let length = answer.trim().len();
        if length < MIN_SYNTHESIS_LENGTH {
            return Err(ResearchError::ShortAnswer {
                length,
                minimum: MIN_SYNTHESIS_LENGTH,
                finish_reason: response.finish_reason,
            }
            .into());
        }

        let unknown = CitationManager::validate_citation_references(&answer, &reference_map);
        if !unknown.is_empty() {
            warn!("answer contains {} unknown citations: {unknown:?}", unknown.len());
        }

        let footer = CitationManager::build_sources_footer(&budgeted_chunks, files, &reference_map);
        if !footer.is_empty() {
            answer = format!("{answer}\n\n{footer}");
        }

        info!("single-pass synthesis complete: {} chars generated", answer.len());
        Ok(answer)
    }

    /// Map-reduce synthesis across clusters.
    ///
    /// # Errors
    ///
    /// Returns the reduce call's error, or [`ResearchError::ShortAnswer`]
    /// for an under-length final answer. Per-cluster map failures degrade to
    /// a skipped cluster with a warning.
    pub async fn map_reduce(
        &self,
        root_query: &str,
        clusters: &[ClusterGroup],
        chunks: &[Chunk],
        all_files: &BTreeMap<String, String>,
        ledger: &EvidenceLedger,
    ) -> Result<String, Error> {
        let max_concurrency = self.llm.synthesis_concurrency();
        let total_input_tokens: usize = clusters.iter().map(|c| c.total_tokens).sum();
        info!(
            "map-reduce synthesis: {} clusters, {total_input_tokens} input tokens, \
             concurrency {max_concurrency}",
            clusters.len()
        );

        // Map phase: synthesize each cluster under the semaphore
        let semaphore = Arc::new(Semaphore::new(max_concurrency));
        let map_tasks = clusters.iter().map(|cluster| {
            let semaphore = Arc::clone(&semaphore);
            async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return None;
                };
                self.map_cluster(root_query, cluster, chunks, total_input_tokens, ledger)
                    .await
            }
        });
        let cluster_summaries: Vec<ClusterSummary> =
            join_all(map_tasks).await.into_iter().flatten().collect();

        if cluster_summaries.is_empty() {
            return Err(ResearchError::ShortAnswer {
                length: 0,
                minimum: MIN_SYNTHESIS_LENGTH,
                finish_reason: Some("all cluster syntheses failed".to_string()),
            }
            .into());
        }

        // Reduce phase: global reference map, remapped citations
        let budgeted_chunks = CitationManager::filter_chunks_to_files(chunks, all_files);
        let global_map = CitationManager::build_reference_map(&budgeted_chunks, all_files);
        let reference_table = CitationManager::format_reference_table(&global_map);

        info!("remapping cluster-local citations to global references");
        let mut combined = Vec::with_capacity(cluster_summaries.len());
        for (i, cluster) in cluster_summaries.iter().enumerate() {
            let remapped = CitationManager::remap_cluster_citations(
                &cluster.summary,
                &cluster.reference_map,
                &global_map,
            );
            let mut files_line = cluster.file_paths.iter().take(5).cloned().collect::<Vec<_>>().join(", ");
            if cluster.file_paths.len() > 5 {
                files_line.push_str(&format!(", ... (+{} more)", cluster.file_paths.len() - 5));
            }
            combined.push(format!(
                "## Cluster {} Analysis\n**Files**: {files_line}\n\n{remapped}",
                i + 1
            ));
        }
        let combined_summaries = combined.join("\n\n");

        let summary_tokens: usize = cluster_summaries
            .iter()
            .map(|c| self.llm.estimate_tokens(&c.summary))
            .sum();
        let constants_context = ledger.constants_prompt_context(50);
        let facts_context = ledger.facts_reduce_prompt_context();

        let system = format!(
            "You are integrating {} cluster analyses (~{summary_tokens} tokens) into a \
             final answer.\n\n\
             Your task:\n\
             1. Integrate insights from all cluster analyses\n\
             2. Eliminate redundancy and contradictions\n\
             3. Maintain focus on the original query\n\
             4. PRESERVE ALL reference number citations [N]; they have already been \
             remapped to the global table. Do NOT generate new citations.\n\n\
             Target output: ~{TARGET_OUTPUT_TOKENS} tokens (includes reasoning).",
            cluster_summaries.len()
        );
        let mut prompt = format!("Query: {root_query}\n");
        if !constants_context.is_empty() {
            prompt.push_str(&format!("\n{constants_context}\n"));
        }
        if !facts_context.is_empty() {
            prompt.push_str(&format!("\n{facts_context}\n"));
        }
        prompt.push_str(&format!(
            "\n{reference_table}\n\
             Synthesize the following cluster analyses into a comprehensive, \
             well-organized answer to the query. Citation numbers [N] already match \
             the global Source References table above.\n\n{combined_summaries}"
        ));

        let request = CompletionRequest::new(prompt, OUTPUT_TOKENS_WITH_REASONING)
            .with_system(system)
            .with_timeout(Duration::from_secs(SINGLE_PASS_TIMEOUT_SECONDS));
        let response = self.llm.complete(&request).await.map_err(Error::Llm)?;

        let mut answer = response.content;
        let length = answer.trim().len();
        if length < MIN_SYNTHESIS_LENGTH {
            return Err(ResearchError::ShortAnswer {
                length,
                minimum: MIN_SYNTHESIS_LENGTH,
                finish_reason: response.finish_reason,
            }
            .into());
        }

        let unknown = CitationManager::validate_citation_references(&answer, &global_map);
        if !unknown.is_empty() {
            warn!(
                "found {} invalid citation references after reduce: {:?}",
                unknown.len(),
                &unknown[..unknown.len().min(10)]
            );
        }

        let footer =
            CitationManager::build_sources_footer(&budgeted_chunks, all_files, &global_map);
        if !footer.is_empty() {
            answer = format!("{answer}\n\n{footer}");
        }

        info!("reduce synthesis complete: {} chars generated", answer.len());
        Ok(answer)
    }

    /// Map phase for one cluster. Returns `None` on failure (logged).
    async fn map_cluster(
        &self,
        root_query: &str,
        cluster: &ClusterGroup,
        chunks: &[Chunk],
        total_input_tokens: usize,
        ledger: &EvidenceLedger,
    ) -> Option<ClusterSummary> {
        let cluster_chunks =
            CitationManager::filter_chunks_to_files(chunks, &cluster.files_content);
        debug!(
            "synthesizing cluster {} ({} files, {} chunks, {} tokens)",
            cluster.cluster_id,
            cluster.file_paths.len(),
            cluster_chunks.len(),
            cluster.total_tokens
        );

        let reference_map =
            CitationManager::build_reference_map(&cluster_chunks, &cluster.files_content);
        let reference_table = CitationManager::format_reference_table(&reference_map);
        let code_context = Self::build_code_context(&cluster_chunks, &cluster.files_content);

        // Proportional output budget: each cluster's output share mirrors
        // its input share, floored at 5k and capped at half the final target
        #[allow(
            clippy::cast_precision_loss,
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss
        )]
        let cluster_output_tokens = {
            let proportion = if total_input_tokens > 0 {
                cluster.total_tokens as f64 / total_input_tokens as f64
            } else {
                1.0
            };
            let proportional = (total_input_tokens as f64 * proportion) as u32;
            proportional.max(5_000)
        };
        let cluster_target =
            (cluster_output_tokens as usize).min(TARGET_OUTPUT_TOKENS / 2);

        let cluster_files: Vec<&str> =
            cluster.file_paths.iter().map(String::as_str).collect();
        let facts_context = ledger.facts_map_prompt_context(&cluster_files);
        let constants_context = ledger.constants_prompt_context(50);

        let system = format!(
            "You are analyzing a subset of code files as part of a larger codebase \
             analysis.\n\nFocus on:\n\
             1. Key architectural patterns and components in these files\n\
             2. Important implementation details and relationships\n\
             3. How these files contribute to answering the query\n\n\
             {CITATION_REQUIREMENTS}\n\n\
             Be thorough but concise - your analysis will be combined with other \
             clusters. Target output: ~{cluster_target} tokens (includes reasoning)."
        );
        let mut prompt = format!("Query: {root_query}\n");
        if !constants_context.is_empty() {
            prompt.push_str(&format!("\n{constants_context}\n"));
        }
        if !facts_context.is_empty() {
            prompt.push_str(&format!("\n{facts_context}\n"));
        }
        prompt.push_str(&format!(
            "\n{reference_table}\n\
             Analyze the following code files and provide insights relevant to the \
             query above:\n\n{code_context}\n\n\
             Provide a comprehensive analysis focusing on the query."
        ));

        let request = CompletionRequest::new(prompt, cluster_output_tokens)
            .with_system(system)
            .with_timeout(Duration::from_secs(SINGLE_PASS_TIMEOUT_SECONDS));
        match self.llm.complete(&request).await {
            Ok(response) => Some(ClusterSummary {
                cluster_id: cluster.cluster_id,
                summary: response.content,
                file_paths: cluster.file_paths.clone(),
                reference_map,
            }),
            Err(e) => {
                warn!("cluster {} synthesis failed: {e}", cluster.cluster_id);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::llm::{Completion, StructuredRequest};
    use async_trait::async_trait;

    /// Provider echoing a canned answer.
    struct CannedLlm {
        answer: String,
    }

    #[async_trait]
    impl LlmProvider for CannedLlm {
        fn name(&self) -> &'static str {
            "canned"
        }
        fn model(&self) -> &str {
            "canned"
        }
        async fn complete(&self, _r: &CompletionRequest) -> Result<Completion, LlmError> {
            Ok(Completion {
                content: self.answer.clone(),
                usage: crate::llm::TokenUsage::default(),
                finish_reason: Some("stop".to_string()),
            })
        }
        async fn complete_structured(
            &self,
            _r: &StructuredRequest,
        ) -> Result<serde_json::Value, LlmError> {
            Ok(serde_json::Value::Null)
        }
    }

    fn chunk(id: i64, path: &str, start: u32, end: u32) -> Chunk {
        Chunk::new(id, 1, path, start, end, "fn body() {}")
    }

    fn files(paths: &[&str]) -> BTreeMap<String, String> {
        paths
            .iter()
            .map(|p| ((*p).to_string(), "full file content".to_string()))
            .collect()
    }

    fn long_answer() -> String {
        format!("This module implements the retry loop [1]. {}", "x".repeat(200))
    }

    #[tokio::test]
    async fn test_single_pass_appends_footer() {
        let engine = SynthesisEngine::new(Arc::new(CannedLlm {
            answer: long_answer(),
        }));
        let chunks = vec![chunk(1, "src/a.rs", 1, 10)];
        let files = files(&["src/a.rs"]);
        let answer = engine
            .single_pass("query", &chunks, &files, &EvidenceLedger::default())
            .await
            .unwrap_or_else(|_| unreachable!());
        assert!(answer.contains("## Sources"));
        assert!(answer.contains("[1] src/a.rs:1-10"));
    }

    #[tokio::test]
    async fn test_single_pass_rejects_short_answer() {
        let engine = SynthesisEngine::new(Arc::new(CannedLlm {
            answer: "too short".to_string(),
        }));
        let chunks = vec![chunk(1, "src/a.rs", 1, 10)];
        let files = files(&["src/a.rs"]);
        let result = engine
            .single_pass("query", &chunks, &files, &EvidenceLedger::default())
            .await;
        assert!(matches!(
            result,
            Err(Error::Research(ResearchError::ShortAnswer { .. }))
        ));
    }

    #[tokio::test]
    async fn test_single_pass_empty_files_is_data_loss() {
        let engine = SynthesisEngine::new(Arc::new(CannedLlm {
            answer: long_answer(),
        }));
        let chunks = vec![chunk(1, "src/a.rs", 1, 10)];
        let result = engine
            .single_pass("query", &chunks, &BTreeMap::new(), &EvidenceLedger::default())
            .await;
        assert!(matches!(
            result,
            Err(Error::Research(ResearchError::DataLoss { .. }))
        ));
    }

    #[tokio::test]
    async fn test_map_reduce_produces_cited_answer() {
        let engine = SynthesisEngine::new(Arc::new(CannedLlm {
            answer: long_answer(),
        }));
        let files_a = files(&["src/a.rs"]);
        let files_b = files(&["src/b.rs"]);
        let clusters = vec![
            ClusterGroup {
                cluster_id: 0,
                file_paths: vec!["src/a.rs".to_string()],
                files_content: files_a.clone(),
                total_tokens: 100,
            },
            ClusterGroup {
                cluster_id: 1,
                file_paths: vec!["src/b.rs".to_string()],
                files_content: files_b,
                total_tokens: 100,
            },
        ];
        let all_files = files(&["src/a.rs", "src/b.rs"]);
        let chunks = vec![chunk(1, "src/a.rs", 1, 10), chunk(2, "src/b.rs", 5, 15)];

        let answer = engine
            .map_reduce("query", &clusters, &chunks, &all_files, &EvidenceLedger::default())
            .await
            .unwrap_or_else(|_| unreachable!());
        assert!(answer.contains("## Sources"));
        assert!(answer.contains("src/a.rs"));
        assert!(answer.contains("src/b.rs"));
    }

    #[test]
    fn test_build_code_context_with_chunk_markers() {
        let chunks = vec![chunk(1, "src/a.rs", 5, 9)];
        let files = files(&["src/a.rs", "src/whole.rs"]);
        let context = SynthesisEngine::build_code_context(&chunks, &files);
        // Chunked file carries line markers; chunkless file is included whole
        assert!(context.contains("# Lines 5-9"));
        assert!(context.contains("### src/whole.rs"));
        assert!(context.contains("full file content"));
    }
}
