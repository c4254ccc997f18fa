//! Wide coverage exploration strategy (v2).
//!
//! Composes depth exploration (Phase 1.5, when enabled) and gap detection
//! (Phase 2, always) into one `explore()` call, then elbow-filters the
//! result and reads files for the survivors.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::{Exploration, ExplorationStats, ExplorationStrategy};
use crate::config::ResearchConfig;
use crate::core::Chunk;
use crate::error::Error;
use crate::research::depth::DepthExploration;
use crate::research::elbow::{ScoreKey, filter_chunks_by_elbow};
use crate::research::gaps::GapDetection;
use crate::research::reader::FileReader;

/// Wide coverage exploration strategy.
pub struct WideCoverageStrategy {
    depth: DepthExploration,
    gaps: GapDetection,
    file_reader: Arc<FileReader>,
    config: ResearchConfig,
}

impl WideCoverageStrategy {
    /// Creates a wide coverage strategy.
    #[must_use]
    pub fn new(
        depth: DepthExploration,
        gaps: GapDetection,
        file_reader: Arc<FileReader>,
        config: ResearchConfig,
    ) -> Self {
        Self {
            depth,
            gaps,
            file_reader,
            config,
        }
    }
}

#[async_trait]
impl ExplorationStrategy for WideCoverageStrategy {
    fn name(&self) -> &'static str {
        "wide_coverage"
    }

    async fn explore(
        &self,
        root_query: &str,
        initial_chunks: Vec<Chunk>,
        phase1_threshold: f32,
        path_filter: Option<&str>,
        constants_context: &str,
    ) -> Result<Exploration, Error> {
        let chunks_before = initial_chunks.len();
        let (all_chunks, mut stats) = self
            .explore_raw(
                root_query,
                initial_chunks,
                phase1_threshold,
                path_filter,
                constants_context,
            )
            .await?;

        // Elbow filter on rerank scores (every wide-coverage phase reranks)
        let (mut filtered, elbow_stats) = filter_chunks_by_elbow(all_chunks, ScoreKey::Rerank);
        info!(
            "wide_coverage: elbow filter kept {}/{} chunks",
            elbow_stats.filtered_count, elbow_stats.original_count
        );
        stats.elbow = Some(elbow_stats);

        // Read files for the filtered set; no token budget beyond the filter
        let file_contents = if filtered.is_empty() {
            BTreeMap::new()
        } else {
            self.file_reader
                .read_files_with_budget(&mut filtered, None)
                .await?
        };
        info!("wide_coverage: read {} files", file_contents.len());

        stats.chunks_before = chunks_before;
        stats.chunks_after = filtered.len();
        stats.files_read = file_contents.len();

        Ok(Exploration {
            chunks: filtered,
            stats,
            file_contents,
        })
    }

    async fn explore_raw(
        &self,
        root_query: &str,
        initial_chunks: Vec<Chunk>,
        phase1_threshold: f32,
        path_filter: Option<&str>,
        constants_context: &str,
    ) -> Result<(Vec<Chunk>, ExplorationStats), Error> {
        let chunks_before = initial_chunks.len();
        let mut stats = ExplorationStats {
            chunks_before,
            ..ExplorationStats::default()
        };
        let mut current_chunks = initial_chunks;

        // Phase 1.5: depth exploration (if enabled)
        if self.config.depth_exploration_enabled {
            info!(
                "wide_coverage: starting depth exploration with {} chunks",
                current_chunks.len()
            );
            let (expanded, depth_stats) = self
                .depth
                .explore_coverage_depth(
                    root_query,
                    current_chunks,
                    phase1_threshold,
                    path_filter,
                    constants_context,
                )
                .await;
            current_chunks = expanded;
            stats.depth_stats = Some(depth_stats);
        }

        // Phase 2: gap detection (always)
        info!(
            "wide_coverage: starting gap detection with {} chunks",
            current_chunks.len()
        );
        let (all_chunks, gap_stats) = self
            .gaps
            .detect_and_fill_gaps(
                root_query,
                current_chunks,
                phase1_threshold,
                path_filter,
                constants_context,
            )
            .await;
        stats.gap_stats = Some(gap_stats);
        stats.chunks_after = all_chunks.len();

        info!(
            "wide_coverage: exploration complete, {} chunks",
            all_chunks.len()
        );
        Ok((all_chunks, stats))
    }
}
