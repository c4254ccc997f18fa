//! BFS exploration strategy (v1).
//!
//! Treats the initial chunks as the root node, generates up to three
//! follow-up questions per node, and explores each follow-up with a unified
//! search at a fixed depth of one. A global explored structure (per-file
//! line coverage plus expanded chunk ranges) terminates branches that stop
//! discovering new information. After traversal the chunk set is elbow
//! filtered and files are reranked against the root query by representative
//! documents before reading.
//!
//! Nodes live in an arena and refer to each other by index, which keeps the
//! tree cycle-free and makes deduplication cheap.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use tracing::{debug, info, warn};

use super::{Exploration, ExplorationStats, ExplorationStrategy};
use crate::config::ResearchConfig;
use crate::core::{Chunk, ResearchContext};
use crate::embedding::EmbeddingProvider;
use crate::error::Error;
use crate::llm::LlmProvider;
use crate::research::budget::BudgetCalculator;
use crate::research::elbow::{ScoreKey, filter_chunks_by_elbow};
use crate::research::models::{
    MAX_CHUNKS_PER_FILE_REPR, MAX_FOLLOWUP_QUESTIONS, MAX_TOKENS_PER_FILE_REPR,
};
use crate::research::questions::QuestionGenerator;
use crate::research::reader::FileReader;
use crate::research::search::UnifiedSearch;

/// Fixed BFS depth. Shallow exploration with comprehensive synthesis
/// empirically outperforms deep traversal.
const MAX_DEPTH: usize = 1;

/// A file is considered fully explored once this many distinct lines of it
/// have been covered by discovered chunks.
const FILE_SATURATION_LINES: usize = 50;

/// Node in the BFS exploration arena.
#[derive(Debug, Clone)]
struct BfsNode {
    query: String,
    #[allow(dead_code)]
    parent: Option<usize>,
    depth: usize,
    chunks: Vec<Chunk>,
    terminated: bool,
}

/// Global explored state shared across the traversal.
///
/// Line coverage only grows, so file saturation is monotone: once a file
/// crosses the threshold it stays "explored" for the rest of the call.
#[derive(Debug, Default)]
struct ExploredState {
    files_explored: HashSet<String>,
    line_coverage: HashMap<String, HashSet<u32>>,
    chunk_ranges: HashMap<String, Vec<(u32, u32)>>,
    chunks: Vec<Chunk>,
}

impl ExploredState {
    fn record(&mut self, chunks: &[Chunk]) {
        for chunk in chunks {
            if chunk.file_path.is_empty() {
                continue;
            }
            let coverage = self
                .line_coverage
                .entry(chunk.file_path.clone())
                .or_default();
            coverage.extend(chunk.start_line..=chunk.end_line);
            if coverage.len() > FILE_SATURATION_LINES {
                self.files_explored.insert(chunk.file_path.clone());
            }

            self.chunk_ranges
                .entry(chunk.file_path.clone())
                .or_default()
                .push(chunk.expanded_range());
            self.chunks.push(chunk.clone());
        }
    }

    /// A chunk duplicates prior work when its file is saturated or its
    /// expanded range is fully contained in a previously recorded range.
    fn is_duplicate(&self, chunk: &Chunk) -> bool {
        if chunk.file_path.is_empty() {
            return false;
        }
        if self.files_explored.contains(&chunk.file_path) {
            return true;
        }
        let (start, end) = chunk.expanded_range();
        self.chunk_ranges
            .get(&chunk.file_path)
            .is_some_and(|ranges| {
                ranges
                    .iter()
                    .any(|(prev_start, prev_end)| start >= *prev_start && end <= *prev_end)
            })
    }

    fn gist(&self) -> Option<String> {
        if self.chunks.is_empty() {
            return None;
        }
        let mut files: Vec<&str> = self
            .chunks
            .iter()
            .map(|c| c.file_path.as_str())
            .filter(|p| !p.is_empty())
            .collect();
        files.sort_unstable();
        files.dedup();
        if files.is_empty() {
            return None;
        }
        let listing: String = files
            .iter()
            .take(20)
            .map(|f| format!("- {f}"))
            .collect::<Vec<_>>()
            .join("\n");
        Some(format!("## Already Explored\n{listing}"))
    }
}

/// BFS tree exploration strategy.
pub struct BfsStrategy {
    embedder: Arc<dyn EmbeddingProvider>,
    unified_search: Arc<UnifiedSearch>,
    question_generator: QuestionGenerator,
    file_reader: Arc<FileReader>,
    budget: BudgetCalculator,
    config: ResearchConfig,
}

impl BfsStrategy {
    /// Creates a BFS strategy.
    #[must_use]
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        embedder: Arc<dyn EmbeddingProvider>,
        unified_search: Arc<UnifiedSearch>,
        file_reader: Arc<FileReader>,
        config: ResearchConfig,
    ) -> Self {
        let budget = BudgetCalculator {
            adaptive_enabled: config.adaptive_budgets_enabled,
            synthesis_input_cap: config.synthesis_input_cap,
        };
        Self {
            embedder,
            unified_search,
            question_generator: QuestionGenerator::new(llm),
            file_reader,
            budget,
            config,
        }
    }

    /// Traverses the BFS tree level by level, processing siblings
    /// concurrently and updating the explored state at each sync point.
    async fn traverse(
        &self,
        root_query: &str,
        initial_chunks: Vec<Chunk>,
        path_filter: Option<&str>,
        constants_context: &str,
    ) -> Vec<BfsNode> {
        let mut arena: Vec<BfsNode> = vec![BfsNode {
            query: root_query.to_string(),
            parent: None,
            depth: 0,
            chunks: initial_chunks,
            terminated: false,
        }];
        let mut state = ExploredState::default();
        state.record(&arena[0].chunks);

        let mut context = ResearchContext::new(root_query);
        let mut current_level: Vec<usize> = vec![0];

        for depth in 0..=MAX_DEPTH {
            if current_level.is_empty() {
                break;
            }
            info!(
                "bfs: processing depth {depth}/{MAX_DEPTH}, nodes: {}",
                current_level.len()
            );

            // Search child nodes concurrently (the root already has chunks)
            let search_tasks: Vec<_> = current_level
                .iter()
                .map(|&node_idx| {
                    let node_query = arena[node_idx].query.clone();
                    let needs_search = arena[node_idx].chunks.is_empty() && depth > 0;
                    let context = context.clone();
                    async move {
                        if !needs_search {
                            return (node_idx, None);
                        }
                        let search_query = context.build_search_query(&node_query);
                        let chunks = self
                            .unified_search
                            .search(&search_query, &context, None, None, path_filter)
                            .await;
                        (node_idx, Some(chunks))
                    }
                })
                .collect();

            // Sync point: fold search results back into the arena and the
            // global explored state before generating follow-ups.
            let mut active_nodes: Vec<usize> = Vec::new();
            for (node_idx, found) in join_all(search_tasks).await {
                if let Some(chunks) = found {
                    if chunks.is_empty() {
                        debug!("no chunks for '{}'", arena[node_idx].query);
                        arena[node_idx].terminated = true;
                        continue;
                    }
                    let new_count = chunks.iter().filter(|c| !state.is_duplicate(c)).count();
                    arena[node_idx].chunks = chunks;
                    if new_count == 0 {
                        info!(
                            "bfs termination: '{}' found 0 new chunks",
                            arena[node_idx].query
                        );
                        arena[node_idx].terminated = true;
                        continue;
                    }
                    state.record(&arena[node_idx].chunks);
                }
                active_nodes.push(node_idx);
            }

            if depth >= MAX_DEPTH {
                break;
            }

            // Generate follow-ups for surviving nodes
            let gist = state.gist();
            let followup_tokens =
                u32::try_from(self.budget.node_budgets(depth, MAX_DEPTH, false).followup_output_tokens)
                    .unwrap_or(8_000);
            let followup_tasks: Vec<_> = active_nodes
                .iter()
                .map(|&node_idx| {
                    let node_query = arena[node_idx].query.clone();
                    let chunks = arena[node_idx].chunks.clone();
                    let gist = gist.clone();
                    let context = context.clone();
                    async move {
                        let questions = self
                            .question_generator
                            .follow_up_questions(
                                &node_query,
                                &context,
                                &chunks,
                                gist.as_deref(),
                                followup_tokens,
                                constants_context,
                            )
                            .await;
                        (node_idx, questions)
                    }
                })
                .collect();

            let mut pending_questions: Vec<(usize, String)> = Vec::new();
            for (node_idx, questions) in join_all(followup_tasks).await {
                for question in questions {
                    pending_questions.push((node_idx, question));
                }
            }

            // Update global context with this level's queries
            for &node_idx in &current_level {
                let query = arena[node_idx].query.clone();
                if !context.ancestors.contains(&query) {
                    context.ancestors.push(query);
                }
            }

            // Synthesize down when too many questions were generated
            let questions_only: Vec<String> =
                pending_questions.iter().map(|(_, q)| q.clone()).collect();
            let next_questions = if questions_only.len() > MAX_FOLLOWUP_QUESTIONS {
                self.question_generator
                    .synthesize_questions(questions_only, &context, MAX_FOLLOWUP_QUESTIONS)
                    .await
                    .into_iter()
                    .map(|q| (current_level[0], q))
                    .collect()
            } else {
                pending_questions
            };

            let mut next_level = Vec::new();
            for (parent_idx, question) in next_questions {
                let child_idx = arena.len();
                arena.push(BfsNode {
                    query: question,
                    parent: Some(parent_idx),
                    depth: depth + 1,
                    chunks: Vec::new(),
                    terminated: false,
                });
                next_level.push(child_idx);
            }
            current_level = next_level;
        }

        arena
    }

    /// Aggregates chunks across the tree, deduped by id, highest unified
    /// score winning.
    fn aggregate_chunks(arena: &[BfsNode]) -> Vec<Chunk> {
        let mut chunks_map: HashMap<i64, Chunk> = HashMap::new();
        for node in arena {
            for chunk in &node.chunks {
                if chunk.id <= 0 {
                    continue;
                }
                match chunks_map.get(&chunk.id) {
                    Some(existing) if existing.unified_score() >= chunk.unified_score() => {}
                    _ => {
                        chunks_map.insert(chunk.id, chunk.clone());
                    }
                }
            }
        }
        chunks_map.into_values().collect()
    }

    /// Reranks files by representative documents against the root query to
    /// set synthesis priority, falling back to accumulated chunk scores.
    async fn rank_files(
        &self,
        root_query: &str,
        file_to_chunks: &BTreeMap<String, Vec<&Chunk>>,
    ) -> Vec<(String, f32)> {
        let mut file_paths: Vec<String> = Vec::new();
        let mut documents: Vec<String> = Vec::new();

        for (path, chunks) in file_to_chunks {
            let mut sorted: Vec<&&Chunk> = chunks.iter().collect();
            sorted.sort_by(|a, b| {
                b.unified_score()
                    .partial_cmp(&a.unified_score())
                    .unwrap_or(std::cmp::Ordering::Equal)
            });

            let parts: Vec<String> = sorted
                .iter()
                .take(MAX_CHUNKS_PER_FILE_REPR)
                .map(|c| format!("Lines {}-{}:\n{}", c.start_line, c.end_line, c.content))
                .collect();
            let mut document = format!("{path}\n\n{}", parts.join("\n\n"));
            crate::core::text::truncate_chars(&mut document, MAX_TOKENS_PER_FILE_REPR * 4);

            file_paths.push(path.clone());
            documents.push(document);
        }

        if self.embedder.supports_reranking() {
            match self.unified_search.rerank_batched(root_query, &documents).await {
                Ok(results) if !results.is_empty() => {
                    let mut ranked: Vec<(String, f32)> = results
                        .into_iter()
                        .filter(|r| r.index < file_paths.len())
                        .map(|r| (file_paths[r.index].clone(), r.score))
                        .collect();
                    ranked.sort_by(|a, b| {
                        b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal)
                    });
                    return ranked;
                }
                Ok(_) => warn!("file reranking returned no results, falling back to chunk scores"),
                Err(e) => warn!("file reranking failed: {e}, falling back to chunk scores"),
            }
        }

        let mut ranked: Vec<(String, f32)> = file_to_chunks
            .iter()
            .map(|(path, chunks)| {
                let total: f32 = chunks.iter().map(|c| c.unified_score()).sum();
                (path.clone(), total)
            })
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked
    }
}

#[async_trait]
impl ExplorationStrategy for BfsStrategy {
    fn name(&self) -> &'static str {
        "bfs"
    }

    async fn explore(
        &self,
        root_query: &str,
        initial_chunks: Vec<Chunk>,
        phase1_threshold: f32,
        path_filter: Option<&str>,
        constants_context: &str,
    ) -> Result<Exploration, Error> {
        let (all_chunks, mut stats) = self
            .explore_raw(
                root_query,
                initial_chunks,
                phase1_threshold,
                path_filter,
                constants_context,
            )
            .await?;

        if all_chunks.is_empty() {
            return Ok(Exploration {
                chunks: Vec::new(),
                stats,
                file_contents: BTreeMap::new(),
            });
        }

        // Elbow filter on the unified score
        let (mut filtered, elbow_stats) = filter_chunks_by_elbow(all_chunks, ScoreKey::Unified);
        info!(
            "bfs: elbow filter kept {}/{} chunks",
            elbow_stats.filtered_count, elbow_stats.original_count
        );
        stats.elbow = Some(elbow_stats);

        // Rank files against the root query to set synthesis priority
        let file_to_chunks: BTreeMap<String, Vec<&Chunk>> = {
            let mut grouped: BTreeMap<String, Vec<&Chunk>> = BTreeMap::new();
            for chunk in &filtered {
                if !chunk.file_path.is_empty() {
                    grouped.entry(chunk.file_path.clone()).or_default().push(chunk);
                }
            }
            grouped
        };
        let ranked = self.rank_files(root_query, &file_to_chunks).await;
        let priority: HashMap<&str, usize> = ranked
            .iter()
            .enumerate()
            .map(|(i, (path, _))| (path.as_str(), i))
            .collect();
        filtered.sort_by_key(|c| priority.get(c.file_path.as_str()).copied().unwrap_or(usize::MAX));

        // Read files for the filtered set (no token budget; elbow already
        // bounded the input)
        let file_contents = self
            .file_reader
            .read_files_with_budget(&mut filtered, None)
            .await?;

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
        _phase1_threshold: f32,
        path_filter: Option<&str>,
        constants_context: &str,
    ) -> Result<(Vec<Chunk>, ExplorationStats), Error> {
        if initial_chunks.is_empty() {
            warn!("bfs: no initial chunks to explore");
            return Ok((Vec::new(), ExplorationStats::default()));
        }

        let chunks_before = initial_chunks.len();
        info!(
            "bfs: starting exploration with {chunks_before} initial chunks, \
             max_depth={MAX_DEPTH}"
        );

        let arena = self
            .traverse(root_query, initial_chunks, path_filter, constants_context)
            .await;
        let all_chunks = Self::aggregate_chunks(&arena);

        let stats = ExplorationStats {
            nodes_explored: arena.len(),
            depth_reached: arena.iter().map(|n| n.depth).max().unwrap_or(0),
            chunks_before,
            chunks_after: all_chunks.len(),
            ..ExplorationStats::default()
        };

        info!(
            "bfs: complete; explored {} nodes ({} terminated), {} total chunks",
            stats.nodes_explored,
            arena.iter().filter(|n| n.terminated).count(),
            stats.chunks_after
        );

        Ok((all_chunks, stats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: i64, path: &str, start: u32, end: u32) -> Chunk {
        Chunk::new(id, 1, path, start, end, "code")
    }

    #[test]
    fn test_saturation_marks_file_explored() {
        let mut state = ExploredState::default();
        // 60 lines of coverage crosses the 50-line saturation threshold
        state.record(&[chunk(1, "src/big.rs", 1, 60)]);
        assert!(state.files_explored.contains("src/big.rs"));
        assert!(state.is_duplicate(&chunk(2, "src/big.rs", 200, 210)));
    }

    #[test]
    fn test_saturation_is_monotone() {
        let mut state = ExploredState::default();
        state.record(&[chunk(1, "src/a.rs", 1, 30)]);
        assert!(!state.files_explored.contains("src/a.rs"));
        state.record(&[chunk(2, "src/a.rs", 25, 55)]);
        assert!(state.files_explored.contains("src/a.rs"));
        // Coverage never shrinks: still explored after unrelated records
        state.record(&[chunk(3, "src/b.rs", 1, 5)]);
        assert!(state.files_explored.contains("src/a.rs"));
    }

    #[test]
    fn test_containment_duplicate() {
        let mut state = ExploredState::default();
        state.record(&[chunk(1, "src/a.rs", 10, 40)]);
        // Fully contained in 10-40
        assert!(state.is_duplicate(&chunk(2, "src/a.rs", 15, 30)));
        // Overlapping but not contained
        assert!(!state.is_duplicate(&chunk(3, "src/a.rs", 30, 60)));
        // Different file
        assert!(!state.is_duplicate(&chunk(4, "src/b.rs", 15, 30)));
    }

    #[test]
    fn test_containment_uses_expanded_range() {
        let mut state = ExploredState::default();
        let mut wide = chunk(1, "src/a.rs", 10, 12);
        wide.expanded_start_line = Some(1);
        wide.expanded_end_line = Some(45);
        state.record(&[wide]);
        // The raw range 10-12 would not contain 20-30, the expanded one does
        assert!(state.is_duplicate(&chunk(2, "src/a.rs", 20, 30)));
    }

    #[test]
    fn test_gist_lists_files() {
        let mut state = ExploredState::default();
        state.record(&[chunk(1, "src/b.rs", 1, 5), chunk(2, "src/a.rs", 1, 5)]);
        let gist = state.gist().unwrap_or_default();
        assert!(gist.starts_with("## Already Explored"));
        assert!(gist.contains("- src/a.rs"));
        assert!(gist.contains("- src/b.rs"));
    }

    #[test]
    fn test_gist_empty_state() {
        assert!(ExploredState::default().gist().is_none());
    }

    #[test]
    fn test_aggregate_keeps_highest_score() {
        let mut low = chunk(1, "src/a.rs", 1, 5);
        low.score = Some(0.2);
        let mut high = chunk(1, "src/a.rs", 1, 5);
        high.rerank_score = Some(0.9);

        let arena = vec![
            BfsNode {
                query: "root".to_string(),
                parent: None,
                depth: 0,
                chunks: vec![low],
                terminated: false,
            },
            BfsNode {
                query: "child".to_string(),
                parent: Some(0),
                depth: 1,
                chunks: vec![high],
                terminated: false,
            },
        ];
        let aggregated = BfsStrategy::aggregate_chunks(&arena);
        assert_eq!(aggregated.len(), 1);
        assert_eq!(aggregated[0].rerank_score, Some(0.9));
    }

    #[test]
    fn test_aggregate_skips_idless() {
        let arena = vec![BfsNode {
            query: "root".to_string(),
            parent: None,
            depth: 0,
            chunks: vec![chunk(0, "src/a.rs", 1, 5)],
            terminated: false,
        }];
        assert!(BfsStrategy::aggregate_chunks(&arena).is_empty());
    }
}
