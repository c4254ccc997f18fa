//! Depth exploration (Phase 1.5).
//!
//! Gap detection hunts for missing external references; depth exploration
//! instead generates queries targeting OTHER ASPECTS of files already in
//! coverage. Steps: pick the top-K files by average rerank score, generate
//! aspect queries per file (parallel, bounded by synthesis concurrency),
//! fan out one unified search per query with compound reranking, filter
//! each by `max(phase1_threshold, elbow)`, then globally dedup and merge.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use super::dedup::{deduplicate_chunks, merge_chunk_lists};
use super::elbow::compute_elbow_threshold;
use super::imports::ImportResolver;
use super::models::IMPORT_DEFAULT_SCORE;
use super::search::UnifiedSearch;
use crate::config::ResearchConfig;
use crate::core::{Chunk, ResearchContext};
use crate::llm::schema::string_array_schema;
use crate::llm::{LlmProvider, StructuredRequest};

/// Statistics from one depth exploration pass.
#[derive(Debug, Clone, Default)]
pub struct DepthStats {
    /// Files selected for aspect exploration.
    pub files_explored: usize,
    /// Aspect queries generated.
    pub queries_generated: usize,
    /// Files whose query generation failed.
    pub generation_failures: usize,
    /// Chunks found across all aspect searches (pre-dedup).
    pub exploration_chunks_found: usize,
    /// Unique exploration chunks after global dedup.
    pub exploration_chunks_unique: usize,
    /// Net new chunks after merging with coverage.
    pub chunks_added: usize,
    /// Chunks attached by import resolution.
    pub import_chunks_added: usize,
}

/// Explores already-covered files from multiple angles.
pub struct DepthExploration {
    llm: Arc<dyn LlmProvider>,
    unified_search: Arc<UnifiedSearch>,
    import_resolver: Option<Arc<ImportResolver>>,
    config: ResearchConfig,
}

impl DepthExploration {
    /// Creates a depth exploration service.
    #[must_use]
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        unified_search: Arc<UnifiedSearch>,
        import_resolver: Option<Arc<ImportResolver>>,
        config: ResearchConfig,
    ) -> Self {
        Self {
            llm,
            unified_search,
            import_resolver,
            config,
        }
    }

    /// Runs depth exploration over the covered chunks.
    pub async fn explore_coverage_depth(
        &self,
        root_query: &str,
        covered_chunks: Vec<Chunk>,
        phase1_threshold: f32,
        path_filter: Option<&str>,
        constants_context: &str,
    ) -> (Vec<Chunk>, DepthStats) {
        if covered_chunks.is_empty() {
            warn!("no covered chunks to explore");
            return (covered_chunks, DepthStats::default());
        }

        info!(
            "phase 1.5: depth exploration starting with {} chunks",
            covered_chunks.len()
        );

        // Step 1: group by file, select top-K by average rerank score
        let file_to_chunks = group_chunks_by_file(&covered_chunks);
        let top_files = select_top_files(&file_to_chunks, self.config.max_exploration_files);
        info!("selected {} top files for exploration", top_files.len());

        if top_files.is_empty() {
            return (covered_chunks, DepthStats::default());
        }

        // Step 2: generate aspect queries per file, bounded concurrency
        let semaphore = Arc::new(Semaphore::new(self.llm.synthesis_concurrency()));
        let generation_tasks = top_files.iter().map(|file_path| {
            let semaphore = Arc::clone(&semaphore);
            let chunks = file_to_chunks.get(file_path).cloned().unwrap_or_default();
            async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return None;
                };
                self.generate_aspect_queries(root_query, file_path, &chunks, constants_context)
                    .await
            }
        });

        let mut aspect_queries: Vec<String> = Vec::new();
        let mut generation_failures = 0;
        for result in join_all(generation_tasks).await {
            match result {
                Some(queries) => aspect_queries.extend(queries),
                None => generation_failures += 1,
            }
        }
        info!(
            "generated {} exploration queries across {} files ({generation_failures} failures)",
            aspect_queries.len(),
            top_files.len()
        );

        if aspect_queries.is_empty() {
            return (
                covered_chunks,
                DepthStats {
                    files_explored: top_files.len(),
                    generation_failures,
                    ..DepthStats::default()
                },
            );
        }

        // Step 3: one unified search per aspect query, parallel
        let search_tasks = aspect_queries.iter().map(|aspect| {
            self.run_aspect_search(root_query, aspect, phase1_threshold, path_filter)
        });
        let results: Vec<Vec<Chunk>> = join_all(search_tasks).await;
        let total_found: usize = results.iter().map(Vec::len).sum();

        // Step 4: global dedup (sync point after all searches completed)
        let unique = deduplicate_chunks(results, "exploration dedup");
        info!(
            "global dedup: {total_found} → {} unique exploration chunks",
            unique.len()
        );

        // Step 5: merge with coverage
        let covered_count = covered_chunks.len();
        let unique_count = unique.len();
        let mut expanded = merge_chunk_lists(covered_chunks, unique, "exploration merge");
        let chunks_added = expanded.len() - covered_count.min(expanded.len());

        // Step 6: optional import resolution
        let mut import_chunks_added = 0;
        if self.config.import_resolution_enabled
            && let Some(resolver) = &self.import_resolver
        {
            let imports = resolver
                .resolve_and_fetch(&expanded, path_filter, IMPORT_DEFAULT_SCORE)
                .await;
            if !imports.is_empty() {
                import_chunks_added = imports.len();
                expanded = merge_chunk_lists(expanded, imports, "exploration import merge");
            }
        }

        let stats = DepthStats {
            files_explored: top_files.len(),
            queries_generated: aspect_queries.len(),
            generation_failures,
            exploration_chunks_found: total_found,
            exploration_chunks_unique: unique_count,
            chunks_added,
            import_chunks_added,
        };

        (expanded, stats)
    }

    /// Generates aspect queries for one file. `None` marks a hard failure
    /// (for the failure metrics); an empty list is a valid "nothing to ask".
    async fn generate_aspect_queries(
        &self,
        root_query: &str,
        file_path: &str,
        file_chunks: &[Chunk],
        constants_context: &str,
    ) -> Option<Vec<String>> {
        let num_queries = self.config.exploration_queries_per_file;
        let schema = string_array_schema("queries", "aspect exploration queries");

        let imports_context = file_chunks
            .first()
            .map(|c| ImportResolver::imports_header(&c.content))
            .unwrap_or_default();

        let mut summaries = Vec::new();
        for chunk in file_chunks.iter().take(5) {
            let preview: String = chunk.content.chars().take(300).collect();
            summaries.push(format!(
                "lines {}-{}: {preview}",
                chunk.start_line, chunk.end_line
            ));
        }

        let constants_section = if constants_context.is_empty() {
            String::new()
        } else {
            format!("\n{constants_context}\n")
        };

        let prompt = format!(
            "RESEARCH QUERY: {root_query}\n{constants_section}\
             FILE: {file_path}\n{imports_context}CHUNKS FOUND ({} total):\n{}\n\n\
             Generate {num_queries} specific queries to explore DIFFERENT ASPECTS of \
             this file that would help answer the RESEARCH QUERY.\n\n\
             Focus on:\n\
             1. Component interactions and data flow not yet covered\n\
             2. Implementation patterns or algorithms in this file\n\
             3. How this file relates to other parts of the system\n\n\
             Target aspects WITHIN THIS FILE, not external dependencies. Each query \
             explores a different angle and is specific enough to find new chunks.\n\n\
             Output JSON with a queries array.",
            file_chunks.len(),
            summaries.join("\n"),
        );

        let request = StructuredRequest::new(prompt, schema, 512);
        match self.llm.complete_structured(&request).await {
            Ok(value) => {
                let queries = value
                    .get("queries")
                    .and_then(|v| v.as_array())
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(|q| q.as_str())
                            .map(str::trim)
                            .filter(|q| !q.is_empty())
                            .map(ToString::to_string)
                            .take(num_queries)
                            .collect()
                    })
                    .unwrap_or_default();
                Some(queries)
            }
            Err(e) => {
                warn!("aspect query generation failed for {file_path}: {e}");
                None
            }
        }
    }

    /// One unified search with compound reranking and elbow-floored
    /// filtering.
    async fn run_aspect_search(
        &self,
        root_query: &str,
        aspect_query: &str,
        phase1_threshold: f32,
        path_filter: Option<&str>,
    ) -> Vec<Chunk> {
        let context = ResearchContext::new(root_query);
        let rerank_queries = vec![root_query.to_string(), aspect_query.to_string()];

        let mut chunks = self
            .unified_search
            .search(aspect_query, &context, None, Some(&rerank_queries), path_filter)
            .await;

        if self.config.window_expansion_enabled {
            chunks = self
                .unified_search
                .expand_chunk_windows(chunks, self.config.window_expansion_lines)
                .await;
        }

        let threshold = if chunks.is_empty() {
            phase1_threshold
        } else {
            let scores: Vec<f32> = chunks
                .iter()
                .map(|c| c.rerank_score.unwrap_or(0.0))
                .collect();
            compute_elbow_threshold(&scores)
        };
        let effective = phase1_threshold.max(threshold);

        chunks
            .into_iter()
            .filter(|c| c.rerank_score.unwrap_or(0.0) >= effective)
            .collect()
    }
}

/// Groups chunks by file path.
fn group_chunks_by_file(chunks: &[Chunk]) -> BTreeMap<String, Vec<Chunk>> {
    let mut grouped: BTreeMap<String, Vec<Chunk>> = BTreeMap::new();
    for chunk in chunks {
        if !chunk.file_path.is_empty() {
            grouped
                .entry(chunk.file_path.clone())
                .or_default()
                .push(chunk.clone());
        }
    }
    grouped
}

/// Top `max_files` file paths by average rerank score.
fn select_top_files(
    file_to_chunks: &BTreeMap<String, Vec<Chunk>>,
    max_files: usize,
) -> Vec<String> {
    #[allow(clippy::cast_precision_loss)]
    let mut scored: Vec<(&str, f32)> = file_to_chunks
        .iter()
        .map(|(path, chunks)| {
            let sum: f32 = chunks.iter().map(|c| c.rerank_score.unwrap_or(0.0)).sum();
            (path.as_str(), sum / chunks.len().max(1) as f32)
        })
        .collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored
        .into_iter()
        .take(max_files)
        .map(|(path, _)| path.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scored_chunk(id: i64, path: &str, score: f32) -> Chunk {
        let mut c = Chunk::new(id, 1, path, 1, 10, "code");
        c.rerank_score = Some(score);
        c
    }

    #[test]
    fn test_group_chunks_by_file() {
        let chunks = vec![
            scored_chunk(1, "a.rs", 0.9),
            scored_chunk(2, "b.rs", 0.5),
            scored_chunk(3, "a.rs", 0.7),
        ];
        let grouped = group_chunks_by_file(&chunks);
        assert_eq!(grouped["a.rs"].len(), 2);
        assert_eq!(grouped["b.rs"].len(), 1);
    }

    #[test]
    fn test_select_top_files_by_average() {
        let chunks = vec![
            scored_chunk(1, "high.rs", 0.9),
            scored_chunk(2, "high.rs", 0.8),
            scored_chunk(3, "mid.rs", 0.6),
            scored_chunk(4, "low.rs", 0.1),
        ];
        let grouped = group_chunks_by_file(&chunks);
        let top = select_top_files(&grouped, 2);
        assert_eq!(top, vec!["high.rs".to_string(), "mid.rs".to_string()]);
    }

    #[test]
    fn test_select_top_files_handles_fewer_than_max() {
        let chunks = vec![scored_chunk(1, "only.rs", 0.5)];
        let grouped = group_chunks_by_file(&chunks);
        assert_eq!(select_top_files(&grouped, 5).len(), 1);
    }

    #[test]
    fn test_chunks_without_path_skipped() {
        let chunks = vec![scored_chunk(1, "", 0.9)];
        assert!(group_chunks_by_file(&chunks).is_empty());
    }
}
