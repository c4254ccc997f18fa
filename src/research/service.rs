//! Deep research orchestrator.
//!
//! Glues the phases together: unified search with query expansion, evidence
//! ledger construction, strategy exploration, aggregation, clustering with
//! fact extraction, single-pass or map-reduce synthesis, and citation
//! validation. The exploration strategy is injected, so v1/v2/v3 swap
//! without touching the synthesis pipeline.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use super::clustering::ClusteringService;
use super::evidence::{EvidenceLedger, extract_facts_with_clustering};
use super::explore::{ExplorationStats, ExplorationStrategy};
use super::progress::{NullSink, ProgressEvent, ProgressSink};
use super::questions::QueryExpander;
use super::search::UnifiedSearch;
use super::synthesis::SynthesisEngine;
use crate::config::ResearchConfig;
use crate::core::{Chunk, ResearchContext};
use crate::embedding::EmbeddingProvider;
use crate::error::Error;
use crate::llm::LlmProvider;
use crate::store::ChunkStore;

/// Result of one deep research call.
#[derive(Debug, Clone)]
pub struct ResearchResult {
    /// The cited answer (with `## Evidence` and `## Sources` sections).
    pub answer: String,
    /// Run metadata.
    pub metadata: ResearchMetadata,
}

/// Metadata describing one research run.
#[derive(Debug, Clone, Default)]
pub struct ResearchMetadata {
    /// Deepest exploration level reached.
    pub depth_reached: usize,
    /// Exploration nodes visited.
    pub nodes_explored: usize,
    /// Chunks analyzed after exploration.
    pub chunks_analyzed: usize,
    /// Files handed to synthesis.
    pub files_analyzed: usize,
    /// Clusters synthesized (1 = single-pass).
    pub clusters: usize,
    /// Facts extracted into the evidence ledger.
    pub facts_extracted: usize,
    /// Constants collected into the evidence ledger.
    pub constants_collected: usize,
    /// True when synthesis was skipped for lack of context.
    pub skipped_synthesis: bool,
    /// Files referenced by the answer (for coverage accounting).
    pub referenced_files: Vec<String>,
}

/// Deep research service with a pluggable exploration strategy.
pub struct DeepResearchService {
    llm: Arc<dyn LlmProvider>,
    strategy: Arc<dyn ExplorationStrategy>,
    unified_search: UnifiedSearch,
    query_expander: QueryExpander,
    synthesis: SynthesisEngine,
    clustering: ClusteringService,
    config: ResearchConfig,
    progress: Arc<dyn ProgressSink>,
    progress_lock: Mutex<()>,
    path_filter: Option<String>,
}

impl DeepResearchService {
    /// Creates a research service.
    #[must_use]
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(
        store: Arc<dyn ChunkStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        llm: Arc<dyn LlmProvider>,
        strategy: Arc<dyn ExplorationStrategy>,
        config: ResearchConfig,
        progress: Option<Arc<dyn ProgressSink>>,
        path_filter: Option<String>,
    ) -> Self {
        let unified_search = UnifiedSearch::new(store, Arc::clone(&embedder), config.clone());
        let query_expander = QueryExpander::new(Arc::clone(&llm), config.num_expanded_queries);
        let synthesis = SynthesisEngine::new(Arc::clone(&llm));
        let clustering = ClusteringService::new(Arc::clone(&embedder), Arc::clone(&llm));
        Self {
            llm,
            strategy,
            unified_search,
            query_expander,
            synthesis,
            clustering,
            config,
            progress: progress.unwrap_or_else(|| Arc::new(NullSink)),
            progress_lock: Mutex::new(()),
            path_filter,
        }
    }

    /// Emits a progress event under the emission lock so event order
    /// reflects logical order.
    async fn emit(&self, event: ProgressEvent) {
        let _guard = self.progress_lock.lock().await;
        self.progress.emit(event).await;
    }

    /// Runs deep research for a query and returns the cited answer.
    ///
    /// # Errors
    ///
    /// Returns [`Error`] on terminal failures: exploration strategy
    /// failures, synthesis failures, or data loss between retrieval and
    /// file reading.
    pub async fn deep_research(&self, query: &str) -> Result<ResearchResult, Error> {
        info!("starting deep research for query: '{query}'");
        self.emit(ProgressEvent::new(
            "main_start",
            format!("Starting deep research: {}", truncate(query, 60)),
        ))
        .await;

        // Phase 1: initial unified search with query expansion
        let context = ResearchContext::new(query);
        self.emit(ProgressEvent::new("depth_start", "Phase 1: Initial search").with_depth(0))
            .await;

        let expanded_queries = if self.config.query_expansion_enabled {
            let expanded = self.query_expander.expand(query, &context).await;
            self.emit(ProgressEvent::new(
                "query_expand_complete",
                format!("Expanded to {} queries", expanded.len()),
            ))
            .await;
            Some(expanded)
        } else {
            None
        };

        let initial_chunks = self
            .unified_search
            .search(
                query,
                &context,
                expanded_queries.as_deref(),
                None,
                self.path_filter.as_deref(),
            )
            .await;
        info!("initial search found {} chunks", initial_chunks.len());
        self.emit(
            ProgressEvent::new(
                "search_complete",
                format!("Found {} chunks", initial_chunks.len()),
            )
            .with_depth(0),
        )
        .await;

        // Constants ledger from initial coverage, used in exploration prompts
        let initial_ledger = EvidenceLedger::from_chunks(&initial_chunks);
        let constants_context = initial_ledger.constants_prompt_context(50);
        if initial_ledger.constants_count() > 0 {
            self.emit(ProgressEvent::new(
                "evidence_ledger",
                format!(
                    "Initial evidence: {} constants",
                    initial_ledger.constants_count()
                ),
            ))
            .await;
        }

        // Phase 2: exploration via the injected strategy
        self.emit(
            ProgressEvent::new(
                "depth_start",
                format!("Phase 2: Exploration ({})", self.strategy.name()),
            )
            .with_depth(1),
        )
        .await;

        let phase1_threshold = 0.0;
        let exploration = self
            .strategy
            .explore(
                query,
                initial_chunks,
                phase1_threshold,
                self.path_filter.as_deref(),
                &constants_context,
            )
            .await?;
        info!(
            "exploration complete: {} chunks, {} files read",
            exploration.chunks.len(),
            exploration.file_contents.len()
        );

        // Aggregate (first occurrence wins; strategies already deduped by
        // score where it matters)
        let (unique_chunks, files) = Self::aggregate(exploration.chunks, exploration.file_contents);

        // Empty coverage: friendly guidance instead of a scary synthesis error
        if unique_chunks.is_empty() && files.is_empty() {
            info!("no chunks or files aggregated; skipping synthesis");
            self.emit(ProgressEvent::new(
                "synthesis_skip",
                "No code context found; skipping synthesis",
            ))
            .await;
            return Ok(Self::empty_result(query, &exploration.stats));
        }

        self.emit(ProgressEvent::new(
            "synthesis_start",
            format!(
                "Synthesizing final answer ({} files, {} chunks)",
                files.len(),
                unique_chunks.len()
            ),
        ))
        .await;

        // Cluster files and extract facts in one pass
        self.emit(ProgressEvent::new(
            "fact_extraction",
            format!("Clustering and extracting facts from {} files", files.len()),
        ))
        .await;
        let extraction = extract_facts_with_clustering(
            &files,
            query,
            Arc::clone(&self.llm),
            &self.clustering,
        )
        .await?;
        let ledger = initial_ledger.merge(&extraction.evidence_ledger);
        if !ledger.is_empty() {
            self.emit(ProgressEvent::new(
                "evidence_ledger",
                format!(
                    "Evidence: {} constants, {} facts",
                    ledger.constants_count(),
                    ledger.facts_count()
                ),
            ))
            .await;
        }

        // Synthesis: single-pass for one cluster, map-reduce beyond
        let num_clusters = extraction.cluster_groups.len().max(1);
        let answer = if num_clusters == 1 {
            info!("single cluster detected - using single-pass synthesis");
            self.synthesis
                .single_pass(query, &unique_chunks, &files, &ledger)
                .await?
        } else {
            info!("using map-reduce synthesis with {num_clusters} clusters");
            self.emit(ProgressEvent::new(
                "synthesis_map",
                format!("Synthesizing {num_clusters} clusters in parallel"),
            ))
            .await;
            self.synthesis
                .map_reduce(
                    query,
                    &extraction.cluster_groups,
                    &unique_chunks,
                    &files,
                    &ledger,
                )
                .await?
        };

        // Evidence section slots in before Sources
        let answer = ledger.insert_into_report(&answer);

        self.emit(ProgressEvent::new("main_complete", "Deep research complete"))
            .await;

        let metadata = ResearchMetadata {
            depth_reached: exploration.stats.depth_reached,
            nodes_explored: exploration.stats.nodes_explored,
            chunks_analyzed: unique_chunks.len(),
            files_analyzed: files.len(),
            clusters: num_clusters,
            facts_extracted: ledger.facts_count(),
            constants_collected: ledger.constants_count(),
            skipped_synthesis: false,
            referenced_files: files.keys().cloned().collect(),
        };
        info!("deep research completed: {metadata:?}");

        Ok(ResearchResult { answer, metadata })
    }

    fn aggregate(
        chunks: Vec<Chunk>,
        files: BTreeMap<String, String>,
    ) -> (Vec<Chunk>, BTreeMap<String, String>) {
        let mut chunks_map: HashMap<i64, Chunk> = HashMap::new();
        let mut order: Vec<i64> = Vec::new();
        for chunk in chunks {
            if chunk.id <= 0 {
                continue;
            }
            if let std::collections::hash_map::Entry::Vacant(entry) = chunks_map.entry(chunk.id) {
                order.push(chunk.id);
                entry.insert(chunk);
            }
        }
        let unique: Vec<Chunk> = order
            .into_iter()
            .filter_map(|id| chunks_map.remove(&id))
            .collect();
        info!("aggregation complete: {} unique chunks, {} files", unique.len(), files.len());
        (unique, files)
    }

    fn empty_result(query: &str, stats: &ExplorationStats) -> ResearchResult {
        let answer = format!(
            "No relevant code context found for: '{query}'.\n\n\
             Try a more code-specific question. Helpful patterns:\n\
             - Name files or modules (e.g., 'src/research/service.rs')\n\
             - Mention types or functions (e.g., 'DeepResearchService::deep_research')\n\
             - Include keywords that appear in code (constants, config keys)\n"
        );
        ResearchResult {
            answer,
            metadata: ResearchMetadata {
                depth_reached: stats.depth_reached,
                nodes_explored: stats.nodes_explored,
                skipped_synthesis: true,
                ..ResearchMetadata::default()
            },
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{cut}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("exactly ten", 11), "exactly ten");
        assert_eq!(truncate("this is too long", 7), "this is...");
    }

    #[test]
    fn test_aggregate_first_occurrence_wins() {
        let mut first = Chunk::new(1, 1, "a.rs", 1, 5, "first");
        first.rerank_score = Some(0.2);
        let mut dup = Chunk::new(1, 1, "a.rs", 1, 5, "dup");
        dup.rerank_score = Some(0.9);
        let idless = Chunk::new(0, 1, "a.rs", 6, 9, "no id");

        let (unique, _) = DeepResearchService::aggregate(
            vec![first, dup, idless],
            BTreeMap::new(),
        );
        assert_eq!(unique.len(), 1);
        assert_eq!(unique[0].content, "first");
    }

    #[test]
    fn test_empty_result_mentions_query() {
        let result = DeepResearchService::empty_result("what is foo", &ExplorationStats::default());
        assert!(result.answer.contains("what is foo"));
        assert!(result.metadata.skipped_synthesis);
    }
}
