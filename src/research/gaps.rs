//! Gap detection and filling (Phase 2).
//!
//! Pipeline: cluster covered chunks with k-means, shard by token budget,
//! detect gaps per shard via structured LLM calls, embed and cluster the
//! candidate queries to group near-duplicates, unify each cluster into one
//! refined query, select gaps at the score elbow, fill each selected gap
//! with an independent unified search, then globally dedup and merge.
//!
//! Invariants: the root query appears in every LLM prompt; gap fills share
//! no mutable state; global dedup happens only after all fills complete;
//! each fill's threshold never drops below the phase-1 floor.

use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::dedup::{deduplicate_chunks, merge_chunk_lists};
use super::elbow::{compute_elbow_threshold, find_elbow_kneedle};
use super::imports::ImportResolver;
use super::models::{
    GAP_CLUSTER_TOKEN_BUDGET, GapCandidate, IMPORT_DEFAULT_SCORE, KMEANS_N_INIT, UnifiedGap,
    gap_score,
};
use super::search::UnifiedSearch;
use crate::config::ResearchConfig;
use crate::core::{Chunk, ResearchContext};
use crate::embedding::{EmbeddingProvider, cosine_distance};
use crate::llm::schema::{gap_detection_schema, gap_unification_schema};
use crate::llm::{LlmProvider, StructuredRequest};
use crate::research::clustering::kmeans;

/// Statistics from one gap detection pass.
///
/// Monotone by construction: `gaps_found >= gaps_unified >= gaps_selected
/// >= gaps_filled`.
#[derive(Debug, Clone, Default)]
pub struct GapStats {
    /// Raw candidates across all shards.
    pub gaps_found: usize,
    /// Unified gap queries after clustering.
    pub gaps_unified: usize,
    /// Gaps selected for filling.
    pub gaps_selected: usize,
    /// Gap fills that returned at least one chunk.
    pub gaps_filled: usize,
    /// Unique chunks added by gap filling.
    pub chunks_added: usize,
    /// Chunks attached by import resolution.
    pub import_chunks_added: usize,
    /// Final chunk count after merging.
    pub total_chunks: usize,
    /// The selected gap queries (for compound context downstream).
    pub gap_queries: Vec<String>,
}

/// Detects and fills semantic gaps in coverage.
pub struct GapDetection {
    llm: Arc<dyn LlmProvider>,
    embedder: Arc<dyn EmbeddingProvider>,
    unified_search: Arc<UnifiedSearch>,
    import_resolver: Option<Arc<ImportResolver>>,
    config: ResearchConfig,
}

impl GapDetection {
    /// Creates a gap detection service.
    #[must_use]
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        embedder: Arc<dyn EmbeddingProvider>,
        unified_search: Arc<UnifiedSearch>,
        import_resolver: Option<Arc<ImportResolver>>,
        config: ResearchConfig,
    ) -> Self {
        Self {
            llm,
            embedder,
            unified_search,
            import_resolver,
            config,
        }
    }

    /// Detects and fills gaps; returns the merged chunk set and statistics.
    pub async fn detect_and_fill_gaps(
        &self,
        root_query: &str,
        covered_chunks: Vec<Chunk>,
        phase1_threshold: f32,
        path_filter: Option<&str>,
        constants_context: &str,
    ) -> (Vec<Chunk>, GapStats) {
        if covered_chunks.is_empty() {
            warn!("no covered chunks to analyze for gaps");
            return (covered_chunks, GapStats::default());
        }

        info!(
            "phase 2: gap detection starting with {} covered chunks",
            covered_chunks.len()
        );

        // Step 2.1: cluster chunks (token-driven k)
        let cluster_groups = self.cluster_chunks_kmeans(&covered_chunks).await;
        info!("clustered into {} semantic groups", cluster_groups.len());

        // Step 2.2: shard by token budget
        let shards = self.shard_by_tokens(cluster_groups);
        info!("created {} shards", shards.len());

        // Step 2.3: detect gaps per shard in parallel
        let raw_gaps = self
            .detect_gaps_parallel(root_query, &shards, constants_context)
            .await;
        info!("detected {} raw gap candidates", raw_gaps.len());

        if raw_gaps.is_empty() {
            return (covered_chunks, GapStats::default());
        }

        // Steps 2.4-2.5: embed, cluster, unify
        let labels = self.cluster_gap_queries(&raw_gaps).await;
        let unified_gaps = self.unify_gap_clusters(root_query, &raw_gaps, &labels).await;
        info!("unified to {} gap queries", unified_gaps.len());

        // Step 2.6: elbow selection
        let selected = self.select_gaps_by_elbow(unified_gaps.clone());
        info!("selected {} gaps to fill", selected.len());

        if selected.is_empty() {
            return (
                covered_chunks,
                GapStats {
                    gaps_found: raw_gaps.len(),
                    gaps_unified: unified_gaps.len(),
                    ..GapStats::default()
                },
            );
        }

        // Step 2.7: fill gaps in parallel (independent, no shared state)
        let fill_tasks = selected.iter().map(|gap| {
            self.fill_single_gap(root_query, gap, phase1_threshold, path_filter)
        });
        let gap_results: Vec<Vec<Chunk>> = join_all(fill_tasks).await;
        let gaps_filled = gap_results.iter().filter(|r| !r.is_empty()).count();

        // Step 2.8: global dedup (sync point)
        let total_before = gap_results.iter().map(Vec::len).sum::<usize>();
        let unique_gap_chunks = deduplicate_chunks(gap_results, "gap dedup");
        info!(
            "global dedup: {total_before} → {} unique chunks",
            unique_gap_chunks.len()
        );

        // Step 2.9: merge coverage + gap chunks
        let chunks_added = unique_gap_chunks.len();
        let mut all_chunks =
            merge_chunk_lists(covered_chunks, unique_gap_chunks, "gap coverage merge");

        // Step 2.10: optional import resolution
        let mut import_chunks_added = 0;
        if self.config.import_resolution_enabled
            && let Some(resolver) = &self.import_resolver
        {
            let imports = resolver
                .resolve_and_fetch(&all_chunks, path_filter, IMPORT_DEFAULT_SCORE)
                .await;
            if !imports.is_empty() {
                import_chunks_added = imports.len();
                all_chunks = merge_chunk_lists(all_chunks, imports, "gap import merge");
            }
        }

        let stats = GapStats {
            gaps_found: raw_gaps.len(),
            gaps_unified: unified_gaps.len(),
            gaps_selected: selected.len(),
            gaps_filled,
            chunks_added,
            import_chunks_added,
            total_chunks: all_chunks.len(),
            gap_queries: selected.into_iter().map(|g| g.query).collect(),
        };

        (all_chunks, stats)
    }

    /// Step 2.1: k-means over chunk embeddings with `k = ceil(tokens/50k)`.
    /// Skipped entirely when the content fits a single cluster budget.
    async fn cluster_chunks_kmeans(&self, chunks: &[Chunk]) -> Vec<Vec<Chunk>> {
        if chunks.len() < 2 {
            return vec![chunks.to_vec()];
        }

        let total_tokens: usize = chunks
            .iter()
            .map(|c| self.llm.estimate_tokens(&c.content))
            .sum();
        if total_tokens <= GAP_CLUSTER_TOKEN_BUDGET {
            debug!(
                "k-means: {} chunks ({total_tokens} tokens) fit in a single cluster, skipping",
                chunks.len()
            );
            return vec![chunks.to_vec()];
        }

        let texts: Vec<String> = chunks.iter().map(Chunk::document_text).collect();
        let embeddings = match self.embedder.embed_batch(&texts).await {
            Ok(embeddings) => embeddings,
            Err(e) => {
                warn!("failed to generate embeddings for clustering: {e}");
                return vec![chunks.to_vec()];
            }
        };

        let num_clusters = total_tokens
            .div_ceil(GAP_CLUSTER_TOKEN_BUDGET)
            .min(chunks.len());
        let labels = kmeans(&embeddings, num_clusters, 42, KMEANS_N_INIT);

        let mut clusters: Vec<Vec<Chunk>> = vec![Vec::new(); num_clusters];
        for (chunk, label) in chunks.iter().zip(&labels) {
            clusters[*label].push(chunk.clone());
        }
        clusters.retain(|cluster| !cluster.is_empty());
        clusters
    }

    /// Step 2.2: partition cluster contents into token-bounded shards.
    fn shard_by_tokens(&self, cluster_groups: Vec<Vec<Chunk>>) -> Vec<Vec<Chunk>> {
        let shard_budget = self.config.shard_budget;
        let mut shards: Vec<Vec<Chunk>> = Vec::new();
        let mut current: Vec<Chunk> = Vec::new();
        let mut current_tokens = 0usize;

        for cluster in cluster_groups {
            for chunk in cluster {
                let chunk_tokens = self.llm.estimate_tokens(&chunk.content);
                if current_tokens + chunk_tokens > shard_budget && !current.is_empty() {
                    shards.push(std::mem::take(&mut current));
                    current_tokens = 0;
                }
                current.push(chunk);
                current_tokens += chunk_tokens;
            }
        }
        if !current.is_empty() {
            shards.push(current);
        }
        shards
    }

    /// Step 2.3: structured gap detection per shard, bounded by synthesis
    /// concurrency. Shard failures are logged and skipped.
    async fn detect_gaps_parallel(
        &self,
        root_query: &str,
        shards: &[Vec<Chunk>],
        constants_context: &str,
    ) -> Vec<GapCandidate> {
        let semaphore = Arc::new(Semaphore::new(self.llm.synthesis_concurrency()));

        let tasks = shards.iter().enumerate().map(|(shard_idx, shard)| {
            let semaphore = Arc::clone(&semaphore);
            async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return Vec::new();
                };
                self.detect_gaps_in_shard(root_query, shard_idx, shard, constants_context)
                    .await
            }
        });

        join_all(tasks).await.into_iter().flatten().collect()
    }

    async fn detect_gaps_in_shard(
        &self,
        root_query: &str,
        shard_idx: usize,
        shard: &[Chunk],
        constants_context: &str,
    ) -> Vec<GapCandidate> {
        let mut code_context = String::new();
        let mut budget = self.config.shard_budget * 4; // chars
        for chunk in shard {
            let section = format!(
                "### {}:{}-{}\n{}\n\n",
                chunk.file_path, chunk.start_line, chunk.end_line, chunk.content
            );
            if section.len() > budget {
                break;
            }
            budget -= section.len();
            code_context.push_str(&section);
        }

        let constants_section = if constants_context.is_empty() {
            String::new()
        } else {
            format!("\n{constants_context}\n")
        };

        let prompt = format!(
            "RESEARCH QUERY: {root_query}\n{constants_section}\
             Given the research query above, identify semantic gaps in this code \
             coverage. Gaps: missing dependencies, incomplete flows, \
             referenced-but-unfound components that would help answer the RESEARCH \
             QUERY. For each gap, assess confidence (0.0-1.0) based on relevance to \
             the query.\n\nCODE COVERAGE:\n{code_context}\n\
             Output JSON with a gaps array."
        );

        let request = StructuredRequest::new(prompt, gap_detection_schema(), 2048);
        match self.llm.complete_structured(&request).await {
            Ok(value) => {
                let candidates: Vec<GapCandidate> = value
                    .get("gaps")
                    .and_then(|v| v.as_array())
                    .map(|gaps| {
                        gaps.iter()
                            .filter_map(|g| {
                                let query = g.get("query")?.as_str()?.trim().to_string();
                                if query.is_empty() {
                                    return None;
                                }
                                #[allow(clippy::cast_possible_truncation)]
                                Some(GapCandidate {
                                    query,
                                    rationale: g
                                        .get("rationale")?
                                        .as_str()
                                        .unwrap_or_default()
                                        .to_string(),
                                    confidence: (g.get("confidence")?.as_f64()? as f32)
                                        .clamp(0.0, 1.0),
                                    source_shard: shard_idx,
                                })
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                debug!("shard {shard_idx}: detected {} gaps", candidates.len());
                candidates
            }
            Err(e) => {
                warn!("gap detection failed for shard {shard_idx}: {e}");
                Vec::new()
            }
        }
    }

    /// Steps 2.4a/2.4b: embed candidate queries and cluster them by cosine
    /// distance with average-linkage agglomerative clustering.
    async fn cluster_gap_queries(&self, gaps: &[GapCandidate]) -> Vec<usize> {
        if gaps.len() < 2 {
            return vec![0; gaps.len()];
        }

        let queries: Vec<String> = gaps.iter().map(|g| g.query.clone()).collect();
        match self.embedder.embed_batch(&queries).await {
            Ok(embeddings) => {
                agglomerative_cosine(&embeddings, self.config.gap_similarity_threshold)
            }
            Err(e) => {
                warn!("gap query embedding failed: {e}, treating all gaps as distinct");
                (0..gaps.len()).collect()
            }
        }
    }

    /// Step 2.5: unify each cluster into one refined query.
    async fn unify_gap_clusters(
        &self,
        root_query: &str,
        gaps: &[GapCandidate],
        labels: &[usize],
    ) -> Vec<UnifiedGap> {
        let mut cluster_map: std::collections::BTreeMap<usize, Vec<&GapCandidate>> =
            std::collections::BTreeMap::new();
        for (gap, label) in gaps.iter().zip(labels) {
            cluster_map.entry(*label).or_default().push(gap);
        }

        let mut unified = Vec::with_capacity(cluster_map.len());
        for cluster_gaps in cluster_map.into_values() {
            let vote_count = cluster_gaps.len();
            #[allow(clippy::cast_precision_loss)]
            let avg_confidence =
                cluster_gaps.iter().map(|g| g.confidence).sum::<f32>() / vote_count as f32;
            let min_shard = cluster_gaps
                .iter()
                .map(|g| g.source_shard)
                .min()
                .unwrap_or(0);
            let score = gap_score(vote_count, avg_confidence, min_shard);

            let query = if vote_count == 1 {
                cluster_gaps[0].query.clone()
            } else {
                self.unify_with_llm(root_query, &cluster_gaps)
                    .await
                    .unwrap_or_else(|| cluster_gaps[0].query.clone())
            };

            unified.push(UnifiedGap {
                query,
                sources: cluster_gaps.into_iter().cloned().collect(),
                vote_count,
                avg_confidence,
                score,
            });
        }
        unified
    }

    async fn unify_with_llm(
        &self,
        root_query: &str,
        cluster_gaps: &[&GapCandidate],
    ) -> Option<String> {
        let gap_list: String = cluster_gaps
            .iter()
            .map(|g| format!("- {} (confidence: {:.2})", g.query, g.confidence))
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = format!(
            "RESEARCH QUERY: {root_query}\n\n\
             Merge these similar gap queries into ONE refined query that best \
             addresses the research query above:\n\n{gap_list}\n\n\
             Output a single unified query that captures the essential information need."
        );

        let request = StructuredRequest::new(prompt, gap_unification_schema(), 512);
        match self.llm.complete_structured(&request).await {
            Ok(value) => value
                .get("unified_query")
                .and_then(|v| v.as_str())
                .map(str::trim)
                .filter(|q| !q.is_empty())
                .map(ToString::to_string),
            Err(e) => {
                warn!("gap unification failed: {e}");
                None
            }
        }
    }

    /// Step 2.6: select gaps by elbow detection on scores, clamped to
    /// `[min_gaps, max_gaps]`, with a ≥50%-of-top post-filter and a
    /// near-zero-top guard.
    fn select_gaps_by_elbow(&self, unified_gaps: Vec<UnifiedGap>) -> Vec<UnifiedGap> {
        if unified_gaps.is_empty() {
            return unified_gaps;
        }

        let mut sorted = unified_gaps;
        sorted.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

        let min_gaps = self.config.min_gaps;
        let max_gaps = self.config.max_gaps;

        if sorted.len() <= min_gaps {
            return sorted;
        }

        let top_score = sorted[0].score;
        let near_zero_top = top_score < 1e-9;

        let candidate_count = sorted.len().min(max_gaps);
        let scores: Vec<f32> = sorted[..candidate_count].iter().map(|g| g.score).collect();

        if near_zero_top {
            debug!("gap selection: near-zero top score, keeping min_gaps");
            sorted.truncate(min_gaps.max(1));
            return sorted;
        }

        // Elbow within the clamp; the elbow point itself is included
        if let Some(elbow_idx) = find_elbow_kneedle(&scores) {
            let selected_count = elbow_idx + 1;
            if selected_count >= min_gaps {
                let mut selected: Vec<UnifiedGap> =
                    sorted.iter().take(selected_count).cloned().collect();
                // ≥50% of top post-filter, but never below min_gaps
                let threshold = 0.5 * top_score;
                let filtered: Vec<UnifiedGap> = selected
                    .iter()
                    .filter(|g| g.score >= threshold)
                    .cloned()
                    .collect();
                if filtered.len() >= min_gaps {
                    selected = filtered;
                }
                debug!(
                    "gap selection: {} candidates → {} selected (kneedle elbow at {elbow_idx})",
                    sorted.len(),
                    selected.len()
                );
                return selected;
            }
        }

        if sorted.len() <= max_gaps {
            // Fallback heuristic: keep while score >= 50% of top
            let mut selected: Vec<UnifiedGap> = sorted.iter().take(min_gaps).cloned().collect();
            for gap in sorted.iter().skip(min_gaps) {
                if gap.score < 0.5 * top_score {
                    break;
                }
                selected.push(gap.clone());
            }
            debug!(
                "gap selection: {} candidates → {} selected (50% heuristic)",
                sorted.len(),
                selected.len()
            );
            return selected;
        }

        debug!(
            "gap selection: {} candidates → {max_gaps} selected (max_gaps fallback)",
            sorted.len()
        );
        sorted.truncate(max_gaps);
        sorted
    }

    /// Step 2.7: fill one gap with a complete unified search. Independent:
    /// no shared mutable state with other fills.
    async fn fill_single_gap(
        &self,
        root_query: &str,
        gap: &UnifiedGap,
        phase1_threshold: f32,
        path_filter: Option<&str>,
    ) -> Vec<Chunk> {
        let context = ResearchContext::new(root_query);
        let rerank_queries = vec![root_query.to_string(), gap.query.clone()];

        let mut chunks = self
            .unified_search
            .search(&gap.query, &context, None, Some(&rerank_queries), path_filter)
            .await;

        if self.config.window_expansion_enabled {
            chunks = self
                .unified_search
                .expand_chunk_windows(chunks, self.config.window_expansion_lines)
                .await;
        }

        let gap_threshold = if chunks.is_empty() {
            phase1_threshold
        } else {
            let scores: Vec<f32> = chunks
                .iter()
                .map(|c| c.rerank_score.unwrap_or(0.0))
                .collect();
            compute_elbow_threshold(&scores)
        };
        let effective = phase1_threshold.max(gap_threshold);

        let filtered: Vec<Chunk> = chunks
            .into_iter()
            .filter(|c| c.rerank_score.unwrap_or(0.0) >= effective)
            .collect();

        debug!(
            "gap fill '{}': {} chunks kept (threshold {effective:.3})",
            &gap.query.chars().take(60).collect::<String>(),
            filtered.len()
        );
        filtered
    }
}

/// Average-linkage agglomerative clustering over cosine distance with a
/// merge threshold. Returns a cluster label per input.
#[must_use]
pub fn agglomerative_cosine(embeddings: &[Vec<f32>], distance_threshold: f32) -> Vec<usize> {
    let n = embeddings.len();
    if n == 0 {
        return Vec::new();
    }

    // Pairwise distances, computed once
    let mut distances = vec![vec![0.0f32; n]; n];
    for i in 0..n {
        for j in (i + 1)..n {
            let d = cosine_distance(&embeddings[i], &embeddings[j]);
            distances[i][j] = d;
            distances[j][i] = d;
        }
    }

    let mut clusters: Vec<Vec<usize>> = (0..n).map(|i| vec![i]).collect();

    loop {
        let mut best: Option<(usize, usize, f32)> = None;
        for a in 0..clusters.len() {
            for b in (a + 1)..clusters.len() {
                // Average linkage: mean pairwise distance between members
                let mut sum = 0.0f32;
                let mut count = 0usize;
                for &i in &clusters[a] {
                    for &j in &clusters[b] {
                        sum += distances[i][j];
                        count += 1;
                    }
                }
                #[allow(clippy::cast_precision_loss)]
                let avg = sum / count.max(1) as f32;
                if avg <= distance_threshold
                    && best.is_none_or(|(_, _, best_avg)| avg < best_avg)
                {
                    best = Some((a, b, avg));
                }
            }
        }

        match best {
            Some((a, b, _)) => {
                let absorbed = clusters.remove(b);
                clusters[a].extend(absorbed);
            }
            None => break,
        }
    }

    let mut labels = vec![0usize; n];
    for (label, members) in clusters.iter().enumerate() {
        for &member in members {
            labels[member] = label;
        }
    }
    labels
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;
    use crate::store::SqliteChunkStore;
    use crate::llm::{Completion, CompletionRequest};
    use crate::error::LlmError;
    use async_trait::async_trait;
    use serde_json::json;

    struct NoGapsLlm;

    #[async_trait]
    impl LlmProvider for NoGapsLlm {
        fn name(&self) -> &'static str {
            "no-gaps"
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
            Ok(json!({"gaps": []}))
        }
    }

    fn gap(query: &str, confidence: f32, shard: usize) -> GapCandidate {
        GapCandidate {
            query: query.to_string(),
            rationale: "r".to_string(),
            confidence,
            source_shard: shard,
        }
    }

    fn unified(query: &str, score: f32) -> UnifiedGap {
        UnifiedGap {
            query: query.to_string(),
            sources: vec![gap(query, score, 0)],
            vote_count: 1,
            avg_confidence: score,
            score,
        }
    }

    fn detection(config: ResearchConfig) -> GapDetection {
        let embedder = Arc::new(HashEmbedder::default());
        let store = Arc::new(
            SqliteChunkStore::open_in_memory("/repo", Arc::clone(&embedder) as Arc<dyn EmbeddingProvider>)
                .unwrap_or_else(|_| unreachable!()),
        );
        let search = Arc::new(UnifiedSearch::new(
            store,
            Arc::clone(&embedder) as Arc<dyn EmbeddingProvider>,
            config.clone(),
        ));
        GapDetection::new(
            Arc::new(NoGapsLlm),
            embedder,
            search,
            None,
            config,
        )
    }

    #[test]
    fn test_agglomerative_groups_identical() {
        let e = vec![
            vec![1.0, 0.0],
            vec![1.0, 0.0],
            vec![0.0, 1.0],
        ];
        let labels = agglomerative_cosine(&e, 0.25);
        assert_eq!(labels[0], labels[1]);
        assert_ne!(labels[0], labels[2]);
    }

    #[test]
    fn test_agglomerative_all_distinct_when_threshold_tight() {
        let e = vec![vec![1.0, 0.0], vec![0.7, 0.7], vec![0.0, 1.0]];
        let labels = agglomerative_cosine(&e, 0.0001);
        let distinct: std::collections::HashSet<usize> = labels.iter().copied().collect();
        assert_eq!(distinct.len(), 3);
    }

    #[test]
    fn test_agglomerative_empty() {
        assert!(agglomerative_cosine(&[], 0.25).is_empty());
    }

    #[test]
    fn test_select_gaps_fewer_than_min_pass_through() {
        let d = detection(ResearchConfig::default());
        let selected = d.select_gaps_by_elbow(vec![unified("only", 0.4)]);
        assert_eq!(selected.len(), 1);
    }

    #[test]
    fn test_select_gaps_fifty_percent_heuristic() {
        let config = ResearchConfig {
            min_gaps: 1,
            max_gaps: 10,
            ..ResearchConfig::default()
        };
        let d = detection(config);
        // Linear slope defeats the elbow; 50% rule keeps 2.0 and 1.9 only
        let gaps = vec![
            unified("a", 2.0),
            unified("b", 1.9),
            unified("c", 0.5),
            unified("d", 0.4),
        ];
        let selected = d.select_gaps_by_elbow(gaps);
        assert!(selected.len() >= 1);
        assert!(selected.iter().all(|g| g.score >= 0.5 * 2.0 || selected.len() == 1));
    }

    #[test]
    fn test_select_gaps_near_zero_guard() {
        let config = ResearchConfig {
            min_gaps: 1,
            max_gaps: 10,
            ..ResearchConfig::default()
        };
        let d = detection(config);
        let gaps = vec![unified("a", 0.0), unified("b", 0.0), unified("c", 0.0)];
        let selected = d.select_gaps_by_elbow(gaps);
        assert_eq!(selected.len(), 1);
    }

    #[test]
    fn test_select_gaps_clamped_to_max() {
        let config = ResearchConfig {
            min_gaps: 1,
            max_gaps: 3,
            ..ResearchConfig::default()
        };
        let d = detection(config);
        // Uniform scores: no elbow, more than max
        let gaps: Vec<UnifiedGap> = (0..8).map(|i| unified(&format!("g{i}"), 1.0)).collect();
        let selected = d.select_gaps_by_elbow(gaps);
        assert!(selected.len() <= 3);
    }

    #[tokio::test]
    async fn test_detect_and_fill_empty_coverage() {
        let d = detection(ResearchConfig::default());
        let (chunks, stats) = d
            .detect_and_fill_gaps("query", Vec::new(), 0.0, None, "")
            .await;
        assert!(chunks.is_empty());
        assert_eq!(stats.gaps_found, 0);
    }

    #[tokio::test]
    async fn test_detect_and_fill_no_gaps_returns_coverage() {
        let d = detection(ResearchConfig::default());
        let covered = vec![Chunk::new(1, 1, "src/a.rs", 1, 5, "code")];
        let (chunks, stats) = d
            .detect_and_fill_gaps("query", covered.clone(), 0.0, None, "")
            .await;
        assert_eq!(chunks.len(), covered.len());
        assert_eq!(stats.gaps_found, 0);
        assert_eq!(stats.gaps_selected, 0);
    }

    #[test]
    fn test_shard_by_tokens_respects_budget() {
        let config = ResearchConfig {
            shard_budget: 100,
            ..ResearchConfig::default()
        };
        let d = detection(config);
        // Each chunk ~75 tokens (300 chars): two chunks exceed one shard
        let cluster: Vec<Chunk> = (0..4)
            .map(|i| Chunk::new(i, 1, "a.rs", 1, 5, "x".repeat(300)))
            .collect();
        let shards = d.shard_by_tokens(vec![cluster]);
        assert!(shards.len() >= 2);
        for shard in &shards {
            let tokens: usize = shard.iter().map(|c| c.content.len() / 4).sum();
            // a single chunk may exceed, but multi-chunk shards stay within
            if shard.len() > 1 {
                assert!(tokens <= 100 + 75);
            }
        }
    }

    #[test]
    fn test_gap_stats_monotonicity_fields() {
        let stats = GapStats {
            gaps_found: 6,
            gaps_unified: 4,
            gaps_selected: 2,
            gaps_filled: 2,
            ..GapStats::default()
        };
        assert!(stats.gaps_found >= stats.gaps_unified);
        assert!(stats.gaps_unified >= stats.gaps_selected);
        assert!(stats.gaps_selected >= stats.gaps_filled);
    }
}
