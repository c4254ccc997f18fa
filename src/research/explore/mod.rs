//! Exploration strategies.
//!
//! Three interchangeable strategies behind one trait: BFS follow-up
//! exploration (v1), wide coverage via depth exploration + gap detection
//! (v2), and the parallel composite of both (v3). The factory builds the
//! configured strategy from the research collaborators.

mod bfs;
mod parallel;
mod wide;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::depth::{DepthExploration, DepthStats};
use super::elbow::ElbowFilterStats;
use super::gaps::{GapDetection, GapStats};
use super::imports::ImportResolver;
use super::reader::FileReader;
use super::search::UnifiedSearch;
use crate::config::{Algorithm, ResearchConfig};
use crate::core::Chunk;
use crate::embedding::EmbeddingProvider;
use crate::error::{Error, ResearchError};
use crate::llm::LlmProvider;
use crate::store::ChunkStore;

pub use bfs::BfsStrategy;
pub use parallel::ParallelStrategy;
pub use wide::WideCoverageStrategy;

/// Statistics from one exploration run.
#[derive(Debug, Clone, Default)]
pub struct ExplorationStats {
    /// Nodes visited (BFS strategies).
    pub nodes_explored: usize,
    /// Deepest level reached.
    pub depth_reached: usize,
    /// Input chunk count.
    pub chunks_before: usize,
    /// Output chunk count after filtering.
    pub chunks_after: usize,
    /// Files read for synthesis.
    pub files_read: usize,
    /// Elbow filtering metadata, when the strategy filtered.
    pub elbow: Option<ElbowFilterStats>,
    /// Depth exploration sub-stats (wide coverage).
    pub depth_stats: Option<DepthStats>,
    /// Gap detection sub-stats (wide coverage).
    pub gap_stats: Option<GapStats>,
    /// Errors from sub-strategies that were tolerated (parallel mode).
    pub strategy_errors: Vec<String>,
}

/// Output of a full exploration: filtered chunks, stats, and the file
/// contents already read for synthesis.
#[derive(Debug, Default)]
pub struct Exploration {
    /// Elbow-filtered chunks, sorted by score.
    pub chunks: Vec<Chunk>,
    /// Run statistics.
    pub stats: ExplorationStats,
    /// Pre-read file contents (`path -> content`).
    pub file_contents: BTreeMap<String, String>,
}

/// Strategy contract for exploring the codebase beyond initial coverage.
#[async_trait]
pub trait ExplorationStrategy: Send + Sync {
    /// Strategy identifier (`"bfs"`, `"wide_coverage"`, `"parallel"`).
    fn name(&self) -> &'static str;

    /// Full exploration: expand coverage, elbow-filter, read files.
    ///
    /// # Errors
    ///
    /// Returns [`Error`] on terminal failures (e.g. file reading found
    /// nothing despite chunks, or both parallel sub-strategies failing).
    async fn explore(
        &self,
        root_query: &str,
        initial_chunks: Vec<Chunk>,
        phase1_threshold: f32,
        path_filter: Option<&str>,
        constants_context: &str,
    ) -> Result<Exploration, Error>;

    /// Exploration without elbow filtering or file reading, for parallel
    /// composition. The caller applies one unified filter over the merged
    /// result.
    ///
    /// # Errors
    ///
    /// Returns [`Error`] on terminal failures inside the strategy.
    async fn explore_raw(
        &self,
        root_query: &str,
        initial_chunks: Vec<Chunk>,
        phase1_threshold: f32,
        path_filter: Option<&str>,
        constants_context: &str,
    ) -> Result<(Vec<Chunk>, ExplorationStats), Error>;
}

/// Collaborators the factory wires into strategies.
pub struct StrategyDeps {
    /// Chunk store.
    pub store: Arc<dyn ChunkStore>,
    /// Embedding provider.
    pub embedder: Arc<dyn EmbeddingProvider>,
    /// LLM provider.
    pub llm: Arc<dyn LlmProvider>,
    /// Research configuration.
    pub config: ResearchConfig,
}

/// Builds the exploration strategy selected by `config.algorithm`.
///
/// # Errors
///
/// Returns [`ResearchError::RerankRequired`] when the configured strategy
/// depends on reranking but the embedding provider does not support it.
pub fn build_strategy(deps: &StrategyDeps) -> Result<Arc<dyn ExplorationStrategy>, Error> {
    // Wide coverage and the parallel composite rerank at every fill; fail
    // up front instead of degrading mid-research.
    if matches!(deps.config.algorithm, Algorithm::V2 | Algorithm::V3)
        && !deps.embedder.supports_reranking()
    {
        return Err(ResearchError::RerankRequired {
            strategy: deps.config.algorithm.to_string(),
        }
        .into());
    }

    let unified_search = Arc::new(UnifiedSearch::new(
        Arc::clone(&deps.store),
        Arc::clone(&deps.embedder),
        deps.config.clone(),
    ));
    let import_resolver = deps.config.import_resolution_enabled.then(|| {
        Arc::new(ImportResolver::new(
            Arc::clone(&deps.store),
            deps.config.clone(),
        ))
    });
    let file_reader = Arc::new(FileReader::new(
        Arc::clone(&deps.store),
        Arc::clone(&deps.llm),
        deps.config.max_boundary_expansion_lines,
    ));

    let bfs = || {
        Arc::new(BfsStrategy::new(
            Arc::clone(&deps.llm),
            Arc::clone(&deps.embedder),
            Arc::clone(&unified_search),
            Arc::clone(&file_reader),
            deps.config.clone(),
        ))
    };
    let wide = || {
        let depth = DepthExploration::new(
            Arc::clone(&deps.llm),
            Arc::clone(&unified_search),
            import_resolver.clone(),
            deps.config.clone(),
        );
        let gaps = GapDetection::new(
            Arc::clone(&deps.llm),
            Arc::clone(&deps.embedder),
            Arc::clone(&unified_search),
            import_resolver.clone(),
            deps.config.clone(),
        );
        Arc::new(WideCoverageStrategy::new(
            depth,
            gaps,
            Arc::clone(&file_reader),
            deps.config.clone(),
        ))
    };

    Ok(match deps.config.algorithm {
        Algorithm::V1 => bfs(),
        Algorithm::V2 => wide(),
        Algorithm::V3 => Arc::new(ParallelStrategy::new(
            bfs(),
            wide(),
            Arc::clone(&file_reader),
        )),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{HashEmbedder, RerankResult};
    use crate::error::{EmbeddingError, LlmError};
    use crate::llm::{Completion, CompletionRequest, StructuredRequest};
    use crate::store::SqliteChunkStore;

    struct NullLlm;

    #[async_trait]
    impl LlmProvider for NullLlm {
        fn name(&self) -> &'static str {
            "null"
        }
        fn model(&self) -> &str {
            "none"
        }
        async fn complete(&self, _r: &CompletionRequest) -> Result<Completion, LlmError> {
            Ok(Completion::default())
        }
        async fn complete_structured(
            &self,
            _r: &StructuredRequest,
        ) -> Result<serde_json::Value, LlmError> {
            Ok(serde_json::Value::Null)
        }
    }

    /// Embedder advertising no rerank support.
    struct NoRerank;

    #[async_trait]
    impl EmbeddingProvider for NoRerank {
        fn name(&self) -> &'static str {
            "no-rerank"
        }
        fn dimensions(&self) -> usize {
            4
        }
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            Ok(texts.iter().map(|_| vec![0.0; 4]).collect())
        }
        async fn rerank(
            &self,
            _query: &str,
            _documents: &[String],
        ) -> Result<Vec<RerankResult>, EmbeddingError> {
            Err(EmbeddingError::RerankUnsupported {
                provider: "no-rerank".to_string(),
            })
        }
    }

    fn deps(algorithm: Algorithm, embedder: Arc<dyn EmbeddingProvider>) -> StrategyDeps {
        let store = Arc::new(
            SqliteChunkStore::open_in_memory("/repo", Arc::clone(&embedder))
                .unwrap_or_else(|_| unreachable!()),
        );
        StrategyDeps {
            store,
            embedder,
            llm: Arc::new(NullLlm),
            config: ResearchConfig {
                algorithm,
                ..ResearchConfig::default()
            },
        }
    }

    #[test]
    fn test_factory_builds_each_algorithm() {
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(HashEmbedder::default());
        for (algorithm, expected) in [
            (Algorithm::V1, "bfs"),
            (Algorithm::V2, "wide_coverage"),
            (Algorithm::V3, "parallel"),
        ] {
            let strategy = build_strategy(&deps(algorithm, Arc::clone(&embedder)))
                .unwrap_or_else(|_| unreachable!());
            assert_eq!(strategy.name(), expected);
        }
    }

    #[test]
    fn test_factory_rejects_rerankless_provider_for_v2_v3() {
        for algorithm in [Algorithm::V2, Algorithm::V3] {
            let result = build_strategy(&deps(algorithm, Arc::new(NoRerank)));
            assert!(matches!(
                result,
                Err(Error::Research(ResearchError::RerankRequired { .. }))
            ));
        }
        // V1 tolerates it
        assert!(build_strategy(&deps(Algorithm::V1, Arc::new(NoRerank))).is_ok());
    }
}
