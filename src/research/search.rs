//! Unified search: hybrid semantic + symbol-regex retrieval.
//!
//! The retrieval primitive every exploration phase builds on. Fixed step
//! order: parallel semantic search over the (optionally expanded) query set,
//! symbol extraction from the semantic results, parallel regex backfill for
//! the top symbols, unification by chunk id with semantic-first priority,
//! rerank against the root query (or a compound of queries), and idempotent
//! window expansion.
//!
//! Any single expanded query or symbol scan may fail; it is logged and the
//! rest continue. If no semantic query succeeds the search returns empty.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures_util::future::join_all;
use tracing::{debug, warn};

use crate::config::ResearchConfig;
use crate::core::{Chunk, ChunkKind, ResearchContext};
use crate::embedding::{EmbeddingProvider, RERANK_DOCUMENT_TOKEN_CAP, RerankResult};
use crate::store::{ChunkStore, SemanticQuery};

/// Hard cap on pages fetched per symbol during regex backfill.
const MAX_REGEX_PAGES: usize = 20;

/// Symbol tokens never worth searching.
const SYMBOL_STOPWORDS: &[&str] = &["self", "cls", "this"];

/// Orchestrates unified semantic + symbol-based regex search.
pub struct UnifiedSearch {
    store: Arc<dyn ChunkStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    config: ResearchConfig,
}

impl UnifiedSearch {
    /// Creates a unified search over the given collaborators.
    #[must_use]
    pub fn new(
        store: Arc<dyn ChunkStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        config: ResearchConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            config,
        }
    }

    /// Runs the unified search.
    ///
    /// * `expanded_queries`: pre-expanded query set; the original query is
    ///   searched alone when absent.
    /// * `rerank_queries`: queries for compound reranking; defaults to the
    ///   root query alone.
    #[must_use = "the search result carries the discovered chunks"]
    pub async fn search(
        &self,
        query: &str,
        context: &ResearchContext,
        expanded_queries: Option<&[String]>,
        rerank_queries: Option<&[String]>,
        path_filter: Option<&str>,
    ) -> Vec<Chunk> {
        // Step 2: parallel semantic search over the query set
        let queries: Vec<String> = match expanded_queries {
            Some(expanded) if !expanded.is_empty() => {
                debug!(
                    "running {} parallel semantic searches (query expansion)",
                    expanded.len()
                );
                expanded.to_vec()
            }
            _ => vec![query.to_string()],
        };

        let semantic_results = self.parallel_semantic_search(&queries, path_filter).await;
        debug!("semantic search unified to {} chunks", semantic_results.len());

        // Steps 3-5: symbol extraction and regex backfill
        let mut regex_results = Vec::new();
        if !semantic_results.is_empty() {
            let symbols = extract_symbols_from_chunks(&semantic_results);
            let top_symbols: Vec<String> =
                symbols.into_iter().take(self.config.max_symbols).collect();

            if !top_symbols.is_empty() {
                #[allow(clippy::cast_precision_loss, clippy::cast_sign_loss)]
                let target_count = self.config.regex_min_results.max(
                    (semantic_results.len() as f32 * self.config.regex_augmentation_ratio).ceil()
                        as usize,
                );
                let target_per_symbol = (target_count / top_symbols.len()).max(1);

                debug!(
                    "regex backfill for {} symbols (target {target_count}, \
                     {target_per_symbol} per symbol)",
                    top_symbols.len()
                );

                let exclude_ids: HashSet<i64> = semantic_results.iter().map(|c| c.id).collect();
                regex_results = self
                    .search_by_symbols(&top_symbols, target_per_symbol, path_filter, &exclude_ids)
                    .await;
                debug!("regex backfill found {} additional chunks", regex_results.len());
            }
        }

        // Step 6: unify at the chunk level, semantic first
        let mut unified: HashMap<i64, Chunk> = HashMap::new();
        let mut order: Vec<i64> = Vec::new();
        for chunk in semantic_results.into_iter().chain(regex_results) {
            if let std::collections::hash_map::Entry::Vacant(entry) = unified.entry(chunk.id) {
                order.push(chunk.id);
                entry.insert(chunk);
            }
        }
        let mut pool: Vec<Chunk> = order
            .into_iter()
            .filter_map(|id| unified.remove(&id))
            .collect();
        debug!("unified to {} unique chunks", pool.len());

        // Step 7: rerank against the root query (or compound queries)
        if self.embedder.supports_reranking() && pool.len() > 1 {
            let queries: Vec<&str> = rerank_queries.map_or_else(
                || vec![context.root_query.as_str()],
                |qs| qs.iter().map(String::as_str).collect(),
            );
            if let Err(e) = self.rerank_pool(&mut pool, &queries).await {
                warn!("unified rerank failed, keeping semantic-priority order: {e}");
            }
        }

        pool
    }

    async fn parallel_semantic_search(
        &self,
        queries: &[String],
        path_filter: Option<&str>,
    ) -> Vec<Chunk> {
        let searches = queries.iter().map(|q| {
            let mut request = SemanticQuery::new(q.clone(), self.config.initial_page_size);
            request.path_filter = path_filter.map(ToString::to_string);
            request.time_limit = Some(self.config.effective_time_limit());
            request.result_limit = self.config.effective_result_limit();
            async move { self.store.search_semantic(&request).await }
        });

        let mut merged: HashMap<i64, Chunk> = HashMap::new();
        let mut order: Vec<i64> = Vec::new();
        for result in join_all(searches).await {
            match result {
                Ok((chunks, _)) => {
                    for chunk in chunks {
                        if let std::collections::hash_map::Entry::Vacant(entry) =
                            merged.entry(chunk.id)
                        {
                            order.push(chunk.id);
                            entry.insert(chunk);
                        }
                    }
                }
                Err(e) => warn!("semantic search failed for one expanded query: {e}"),
            }
        }

        order.into_iter().filter_map(|id| merged.remove(&id)).collect()
    }

    /// Searches the index for the top-ranked symbols via parallel regex
    /// scans, paginating each symbol until it yields `target_per_symbol`
    /// undiscovered chunks or pages run out.
    pub async fn search_by_symbols(
        &self,
        symbols: &[String],
        target_per_symbol: usize,
        path_filter: Option<&str>,
        exclude_ids: &HashSet<i64>,
    ) -> Vec<Chunk> {
        if symbols.is_empty() {
            return Vec::new();
        }

        let scans = symbols.iter().map(|symbol| {
            let pattern = format!(r"\b{}\b", regex::escape(symbol));
            async move {
                let mut results: Vec<Chunk> = Vec::new();
                let mut seen: HashSet<i64> = exclude_ids.clone();
                let mut offset = 0;
                let page_size = self.config.regex_scan_page_size;

                for _ in 0..MAX_REGEX_PAGES {
                    if results.len() >= target_per_symbol {
                        break;
                    }
                    let page = match self
                        .store
                        .search_regex(&pattern, page_size, offset, path_filter)
                        .await
                    {
                        Ok((page, _)) => page,
                        Err(e) => {
                            warn!("regex search failed for symbol '{symbol}': {e}");
                            break;
                        }
                    };
                    if page.is_empty() {
                        break;
                    }
                    for chunk in page {
                        if seen.insert(chunk.id) {
                            results.push(chunk);
                            if results.len() >= target_per_symbol {
                                break;
                            }
                        }
                    }
                    offset += page_size;
                }

                debug!(
                    "found {} undiscovered chunks for symbol '{symbol}' \
                     (target {target_per_symbol})",
                    results.len()
                );
                results
            }
        });

        join_all(scans).await.into_iter().flatten().collect()
    }

    /// Reranks the pool in place against one or more queries.
    ///
    /// With multiple queries the compound score is the mean of the per-query
    /// scores; out-of-range indices from the provider are skipped.
    async fn rerank_pool(
        &self,
        pool: &mut [Chunk],
        queries: &[&str],
    ) -> Result<(), crate::error::EmbeddingError> {
        let documents: Vec<String> = pool
            .iter()
            .map(|c| {
                let mut doc = c.document_text();
                crate::core::text::truncate_chars(&mut doc, RERANK_DOCUMENT_TOKEN_CAP * 4);
                doc
            })
            .collect();

        let mut accumulated: Vec<f32> = vec![0.0; pool.len()];
        for query in queries {
            let results = self.rerank_batched(query, &documents).await?;
            for result in results {
                if result.index < pool.len() {
                    accumulated[result.index] += result.score;
                } else {
                    warn!(
                        "reranker returned out-of-range index {} (pool size {})",
                        result.index,
                        pool.len()
                    );
                }
            }
        }

        #[allow(clippy::cast_precision_loss)]
        let divisor = queries.len().max(1) as f32;
        for (chunk, sum) in pool.iter_mut().zip(&accumulated) {
            chunk.rerank_score = Some(sum / divisor);
        }
        pool.sort_by(|a, b| {
            b.rerank_score
                .partial_cmp(&a.rerank_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(())
    }

    /// Reranks documents in provider-sized batches, adjusting indices back
    /// to the full document list.
    pub async fn rerank_batched(
        &self,
        query: &str,
        documents: &[String],
    ) -> Result<Vec<RerankResult>, crate::error::EmbeddingError> {
        let max_batch = self.embedder.max_rerank_batch_size().max(1);
        if documents.len() <= max_batch {
            return self.embedder.rerank(query, documents).await;
        }

        let mut all_results = Vec::with_capacity(documents.len());
        for (batch_idx, batch) in documents.chunks(max_batch).enumerate() {
            let offset = batch_idx * max_batch;
            match self.embedder.rerank(query, batch).await {
                Ok(results) => {
                    for result in results {
                        if result.index < batch.len() {
                            all_results.push(RerankResult {
                                index: offset + result.index,
                                score: result.score,
                            });
                        } else {
                            warn!(
                                "batch {batch_idx} returned invalid index {}, skipping",
                                result.index
                            );
                        }
                    }
                }
                Err(e) => {
                    warn!("rerank batch {batch_idx} failed: {e}, continuing with remaining batches");
                }
            }
        }
        Ok(all_results)
    }

    /// Expands retrieved chunks with neighboring chunks whose line ranges
    /// fall within `window_lines` of the retrieved ranges, per file.
    ///
    /// Idempotent: chunks already flagged `window_expanded` are preserved
    /// but not re-expanded, and every chunk in the output carries the flag.
    pub async fn expand_chunk_windows(&self, chunks: Vec<Chunk>, window_lines: u32) -> Vec<Chunk> {
        if chunks.is_empty() {
            return chunks;
        }

        let to_expand: Vec<&Chunk> = chunks.iter().filter(|c| !c.window_expanded).collect();
        if to_expand.is_empty() {
            debug!(
                "all {} chunks already expanded, skipping window expansion",
                chunks.len()
            );
            return chunks;
        }

        // Group unexpanded chunks by file
        let mut by_file: HashMap<i64, (u32, u32)> = HashMap::new();
        for chunk in &to_expand {
            let entry = by_file
                .entry(chunk.file_id)
                .or_insert((chunk.start_line, chunk.end_line));
            entry.0 = entry.0.min(chunk.start_line);
            entry.1 = entry.1.max(chunk.end_line);
        }

        let original_count = chunks.len();
        let mut expanded = chunks;
        let mut existing_ids: HashSet<i64> = expanded.iter().map(|c| c.id).collect();

        for (file_id, (min_start, max_end)) in by_file {
            let range_start = min_start.saturating_sub(window_lines).max(1);
            let range_end = max_end.saturating_add(window_lines);
            match self
                .store
                .get_chunks_in_range(file_id, range_start, range_end)
                .await
            {
                Ok(neighbors) => {
                    for neighbor in neighbors {
                        if existing_ids.insert(neighbor.id) {
                            expanded.push(neighbor);
                        }
                    }
                }
                Err(e) => warn!("window expansion failed for file {file_id}: {e}"),
            }
        }

        for chunk in &mut expanded {
            chunk.window_expanded = true;
        }

        debug!(
            "window expansion: {original_count} → {} chunks (+{} neighbors)",
            expanded.len(),
            expanded.len() - original_count
        );
        expanded
    }
}

/// Extracts searchable symbols from already-parsed chunks.
///
/// Prefers the primary `symbol`, then the metadata `name` for chunks whose
/// kind is specific enough, then parameter names. Drops single-character
/// tokens, purely numeric tokens, and `self`/`cls`/`this`.
#[must_use]
pub fn extract_symbols_from_chunks(chunks: &[Chunk]) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut symbols: Vec<String> = Vec::new();

    let mut push = |candidate: &str| {
        let trimmed = candidate.trim();
        if trimmed.len() <= 1
            || trimmed.chars().all(|c| c.is_ascii_digit())
            || SYMBOL_STOPWORDS.contains(&trimmed.to_lowercase().as_str())
        {
            return;
        }
        if seen.insert(trimmed.to_string()) {
            symbols.push(trimmed.to_string());
        }
    };

    for chunk in chunks {
        if let Some(symbol) = &chunk.symbol {
            push(symbol);
        }
        if let Some(name) = &chunk.metadata.name
            && !matches!(
                chunk.kind,
                Some(ChunkKind::Block | ChunkKind::Comment | ChunkKind::Unknown) | None
            )
        {
            push(name);
        }
        for parameter in &chunk.metadata.parameters {
            push(parameter);
        }
    }

    debug!("extracted {} symbols from {} chunks", symbols.len(), chunks.len());
    symbols
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;
    use crate::store::SqliteChunkStore;

    fn chunk_with(
        id: i64,
        symbol: Option<&str>,
        name: Option<&str>,
        kind: Option<ChunkKind>,
        params: &[&str],
    ) -> Chunk {
        let mut c = Chunk::new(id, 1, "src/a.rs", 1, 10, "code");
        c.symbol = symbol.map(ToString::to_string);
        c.metadata.name = name.map(ToString::to_string);
        c.kind = kind;
        c.metadata.parameters = params.iter().map(|p| (*p).to_string()).collect();
        c
    }

    #[test]
    fn test_symbol_extraction_prefers_symbol() {
        let chunks = vec![chunk_with(
            1,
            Some("retry_loop"),
            None,
            Some(ChunkKind::Function),
            &[],
        )];
        assert_eq!(extract_symbols_from_chunks(&chunks), vec!["retry_loop"]);
    }

    #[test]
    fn test_symbol_extraction_name_requires_specific_kind() {
        let specific = vec![chunk_with(
            1,
            None,
            Some("Backoff"),
            Some(ChunkKind::Struct),
            &[],
        )];
        assert_eq!(extract_symbols_from_chunks(&specific), vec!["Backoff"]);

        let generic = vec![chunk_with(
            1,
            None,
            Some("Backoff"),
            Some(ChunkKind::Block),
            &[],
        )];
        assert!(extract_symbols_from_chunks(&generic).is_empty());
    }

    #[test]
    fn test_symbol_extraction_filters_noise() {
        let chunks = vec![chunk_with(
            1,
            Some("f"),
            None,
            None,
            &["self", "42", "timeout_ms", "x"],
        )];
        assert_eq!(extract_symbols_from_chunks(&chunks), vec!["timeout_ms"]);
    }

    #[test]
    fn test_symbol_extraction_dedupes_preserving_order() {
        let chunks = vec![
            chunk_with(1, Some("alpha"), None, None, &[]),
            chunk_with(2, Some("beta"), None, None, &["alpha"]),
        ];
        assert_eq!(extract_symbols_from_chunks(&chunks), vec!["alpha", "beta"]);
    }

    fn test_store() -> Arc<SqliteChunkStore> {
        let store = SqliteChunkStore::open_in_memory("/repo", Arc::new(HashEmbedder::default()))
            .unwrap_or_else(|_| unreachable!());
        let file_id = store
            .insert_file("src/retry.rs", "h1", 100)
            .unwrap_or_else(|_| unreachable!());
        for i in 0..6u32 {
            let mut c = Chunk::new(
                0,
                file_id,
                "src/retry.rs",
                i * 10 + 1,
                i * 10 + 9,
                format!("fn segment_{i}() {{ retry backoff attempt {i} }}"),
            );
            c.symbol = Some(format!("segment_{i}"));
            store.insert_chunk(&c).unwrap_or_else(|_| unreachable!());
        }
        Arc::new(store)
    }

    fn unified(store: Arc<SqliteChunkStore>) -> UnifiedSearch {
        UnifiedSearch::new(
            store,
            Arc::new(HashEmbedder::default()),
            ResearchConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_search_returns_reranked_chunks() {
        let search = unified(test_store());
        let context = ResearchContext::new("how does retry backoff work");
        let results = search
            .search("how does retry backoff work", &context, None, None, None)
            .await;
        assert!(!results.is_empty());
        assert!(results.iter().all(|c| c.rerank_score.is_some()));
        for pair in results.windows(2) {
            assert!(pair[0].rerank_score >= pair[1].rerank_score);
        }
    }

    #[tokio::test]
    async fn test_window_expansion_adds_neighbors_and_flags() {
        let store = test_store();
        let search = unified(Arc::clone(&store));

        // Fetch one chunk, then expand: neighbors in range appear
        use crate::store::ChunkStore;
        let file = store
            .get_file_by_path("src/retry.rs")
            .await
            .unwrap_or_else(|_| unreachable!())
            .unwrap_or_else(|| unreachable!());
        let one = store
            .get_chunks_in_range(file.id, 1, 9)
            .await
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(one.len(), 1);

        let expanded = search.expand_chunk_windows(one, 25).await;
        assert!(expanded.len() > 1);
        assert!(expanded.iter().all(|c| c.window_expanded));
    }

    #[tokio::test]
    async fn test_window_expansion_idempotent() {
        let store = test_store();
        let search = unified(Arc::clone(&store));

        use crate::store::ChunkStore;
        let file = store
            .get_file_by_path("src/retry.rs")
            .await
            .unwrap_or_else(|_| unreachable!())
            .unwrap_or_else(|| unreachable!());
        let one = store
            .get_chunks_in_range(file.id, 1, 9)
            .await
            .unwrap_or_else(|_| unreachable!());

        let once = search.expand_chunk_windows(one, 25).await;
        let once_ids: HashSet<i64> = once.iter().map(|c| c.id).collect();
        let twice = search.expand_chunk_windows(once, 25).await;
        let twice_ids: HashSet<i64> = twice.iter().map(|c| c.id).collect();
        assert_eq!(once_ids, twice_ids);
    }

    #[tokio::test]
    async fn test_search_by_symbols_excludes_known_ids() {
        let store = test_store();
        let search = unified(Arc::clone(&store));

        // Exclude everything: no results can come back
        let exclude: HashSet<i64> = (1..=6).collect();
        let results = search
            .search_by_symbols(&["retry".to_string()], 5, None, &exclude)
            .await;
        assert!(results.is_empty());

        // Exclude nothing: symbol matches arrive
        let results = search
            .search_by_symbols(&["retry".to_string()], 5, None, &HashSet::new())
            .await;
        assert!(!results.is_empty());
        assert!(results.len() <= 5);
    }

    #[tokio::test]
    async fn test_empty_store_returns_empty() {
        let store = Arc::new(
            SqliteChunkStore::open_in_memory("/repo", Arc::new(HashEmbedder::default()))
                .unwrap_or_else(|_| unreachable!()),
        );
        let search = unified(store);
        let context = ResearchContext::new("anything");
        let results = search.search("anything", &context, None, None, None).await;
        assert!(results.is_empty());
    }
}
