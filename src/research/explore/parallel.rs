//! Parallel exploration strategy (v3).
//!
//! Runs BFS and wide coverage concurrently in raw mode, merges by chunk id
//! (higher unified score wins), applies one unified elbow pass over the
//! merged set, and reads files. One sub-strategy failing is tolerated and
//! recorded; both failing is terminal.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};

use super::{Exploration, ExplorationStats, ExplorationStrategy};
use crate::core::Chunk;
use crate::error::{Error, ResearchError};
use crate::research::elbow::{ScoreKey, filter_chunks_by_elbow};
use crate::research::reader::FileReader;

/// Parallel composite of BFS and wide coverage.
pub struct ParallelStrategy {
    bfs: Arc<dyn ExplorationStrategy>,
    wide: Arc<dyn ExplorationStrategy>,
    file_reader: Arc<FileReader>,
}

impl ParallelStrategy {
    /// Creates the parallel strategy over its two sub-strategies.
    #[must_use]
    pub fn new(
        bfs: Arc<dyn ExplorationStrategy>,
        wide: Arc<dyn ExplorationStrategy>,
        file_reader: Arc<FileReader>,
    ) -> Self {
        Self {
            bfs,
            wide,
            file_reader,
        }
    }

    /// Merges chunks from both strategies, dedupes by id keeping the higher
    /// unified score. Deterministic for a given `(chunk_id, score)` set.
    fn merge_and_dedupe(bfs_chunks: Vec<Chunk>, wide_chunks: Vec<Chunk>) -> Vec<Chunk> {
        let mut chunk_map: HashMap<i64, Chunk> = HashMap::new();
        for chunk in bfs_chunks.into_iter().chain(wide_chunks) {
            if chunk.id <= 0 {
                warn!("skipping chunk without id during merge");
                continue;
            }
            match chunk_map.get(&chunk.id) {
                Some(existing) if existing.unified_score() >= chunk.unified_score() => {}
                _ => {
                    chunk_map.insert(chunk.id, chunk);
                }
            }
        }
        let mut merged: Vec<Chunk> = chunk_map.into_values().collect();
        merged.sort_by(|a, b| {
            b.unified_score()
                .partial_cmp(&a.unified_score())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        merged
    }
}

#[async_trait]
impl ExplorationStrategy for ParallelStrategy {
    fn name(&self) -> &'static str {
        "parallel"
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
        let (merged, mut stats) = self
            .explore_raw(
                root_query,
                initial_chunks,
                phase1_threshold,
                path_filter,
                constants_context,
            )
            .await?;

        if merged.is_empty() {
            return Ok(Exploration {
                chunks: Vec::new(),
                stats,
                file_contents: BTreeMap::new(),
            });
        }

        // One unified elbow pass over the merged set
        let (mut filtered, elbow_stats) = filter_chunks_by_elbow(merged, ScoreKey::Unified);
        info!(
            "parallel: elbow filter kept {}/{} chunks",
            elbow_stats.filtered_count, elbow_stats.original_count
        );
        stats.elbow = Some(elbow_stats);

        let file_contents = self
            .file_reader
            .read_files_with_budget(&mut filtered, None)
            .await?;
        info!("parallel: read {} files", file_contents.len());

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
        if initial_chunks.is_empty() {
            warn!("parallel: no initial chunks to explore");
            return Ok((Vec::new(), ExplorationStats::default()));
        }

        let chunks_before = initial_chunks.len();
        info!("parallel: starting parallel exploration with {chunks_before} initial chunks");

        let bfs_task = self.bfs.explore_raw(
            root_query,
            initial_chunks.clone(),
            phase1_threshold,
            path_filter,
            constants_context,
        );
        let wide_task = self.wide.explore_raw(
            root_query,
            initial_chunks,
            phase1_threshold,
            path_filter,
            constants_context,
        );

        let (bfs_result, wide_result) = tokio::join!(bfs_task, wide_task);

        let mut stats = ExplorationStats {
            chunks_before,
            ..ExplorationStats::default()
        };

        let (bfs_chunks, wide_chunks) = match (bfs_result, wide_result) {
            (Ok((bfs_chunks, bfs_stats)), Ok((wide_chunks, wide_stats))) => {
                stats.nodes_explored = bfs_stats.nodes_explored;
                stats.depth_reached = bfs_stats.depth_reached;
                stats.depth_stats = wide_stats.depth_stats;
                stats.gap_stats = wide_stats.gap_stats;
                (bfs_chunks, wide_chunks)
            }
            (Ok((bfs_chunks, bfs_stats)), Err(wide_err)) => {
                error!("wide coverage exploration failed: {wide_err}");
                stats.nodes_explored = bfs_stats.nodes_explored;
                stats.depth_reached = bfs_stats.depth_reached;
                stats.strategy_errors.push(format!("wide: {wide_err}"));
                (bfs_chunks, Vec::new())
            }
            (Err(bfs_err), Ok((wide_chunks, wide_stats))) => {
                error!("bfs exploration failed: {bfs_err}");
                stats.depth_stats = wide_stats.depth_stats;
                stats.gap_stats = wide_stats.gap_stats;
                stats.strategy_errors.push(format!("bfs: {bfs_err}"));
                (Vec::new(), wide_chunks)
            }
            (Err(bfs_err), Err(wide_err)) => {
                return Err(ResearchError::BothStrategiesFailed {
                    bfs: bfs_err.to_string(),
                    wide: wide_err.to_string(),
                }
                .into());
            }
        };

        info!(
            "parallel: bfs found {} chunks, wide found {} chunks",
            bfs_chunks.len(),
            wide_chunks.len()
        );

        let merged = Self::merge_and_dedupe(bfs_chunks, wide_chunks);
        info!("parallel: merged to {} unique chunks", merged.len());
        stats.chunks_after = merged.len();

        Ok((merged, stats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: i64, rerank: Option<f32>, semantic: Option<f32>) -> Chunk {
        let mut c = Chunk::new(id, 1, "src/a.rs", 1, 10, "code");
        c.rerank_score = rerank;
        c.score = semantic;
        c
    }

    #[test]
    fn test_merge_keeps_higher_unified_score() {
        let bfs = vec![chunk(1, None, Some(0.4)), chunk(2, None, Some(0.8))];
        let wide = vec![chunk(1, Some(0.9), None), chunk(3, Some(0.5), None)];
        let merged = ParallelStrategy::merge_and_dedupe(bfs, wide);
        assert_eq!(merged.len(), 3);
        let one = merged.iter().find(|c| c.id == 1).unwrap_or_else(|| unreachable!());
        assert_eq!(one.rerank_score, Some(0.9));
    }

    #[test]
    fn test_merge_is_deterministic_on_id_and_score() {
        let a = vec![chunk(3, Some(0.5), None), chunk(1, Some(0.5), None)];
        let b = vec![chunk(2, Some(0.7), None)];
        let first = ParallelStrategy::merge_and_dedupe(a.clone(), b.clone());
        let second = ParallelStrategy::merge_and_dedupe(a, b);
        let first_ids: Vec<i64> = first.iter().map(|c| c.id).collect();
        let second_ids: Vec<i64> = second.iter().map(|c| c.id).collect();
        assert_eq!(first_ids, second_ids);
        // Sorted by score desc, ties broken by id
        assert_eq!(first_ids, vec![2, 1, 3]);
    }

    #[test]
    fn test_merge_skips_idless() {
        let merged = ParallelStrategy::merge_and_dedupe(vec![chunk(0, Some(0.9), None)], vec![]);
        assert!(merged.is_empty());
    }
}
