//! Chunk deduplication utilities.
//!
//! Parallel research phases (depth exploration queries, gap fills, strategy
//! merges) deduplicate at sync points after all sibling tasks complete. The
//! pattern everywhere is: key by chunk id, keep the highest `rerank_score`
//! on collisions, skip id-less chunks with a debug log.

use std::collections::HashMap;

use tracing::debug;

use crate::core::Chunk;

fn rerank(chunk: &Chunk) -> f32 {
    chunk.rerank_score.unwrap_or(0.0)
}

/// Deduplicates chunks across multiple result lists, keeping the highest
/// rerank score on id collisions.
#[must_use]
pub fn deduplicate_chunks(chunk_lists: Vec<Vec<Chunk>>, log_prefix: &str) -> Vec<Chunk> {
    let total_input: usize = chunk_lists.iter().map(Vec::len).sum();
    let mut chunk_map: HashMap<i64, Chunk> = HashMap::new();

    for chunk in chunk_lists.into_iter().flatten() {
        if chunk.id <= 0 {
            debug!("{log_prefix}: skipping chunk without id ({})", chunk.file_path);
            continue;
        }
        match chunk_map.get(&chunk.id) {
            Some(existing) if rerank(existing) >= rerank(&chunk) => {}
            _ => {
                chunk_map.insert(chunk.id, chunk);
            }
        }
    }

    let deduplicated: Vec<Chunk> = chunk_map.into_values().collect();
    debug!("{log_prefix}: {total_input} → {} unique", deduplicated.len());
    deduplicated
}

/// Merges two chunk lists with deduplication.
///
/// Base chunks go in first; new chunks overwrite only when their rerank
/// score is strictly higher.
#[must_use]
pub fn merge_chunk_lists(
    base_chunks: Vec<Chunk>,
    new_chunks: Vec<Chunk>,
    log_prefix: &str,
) -> Vec<Chunk> {
    let base_len = base_chunks.len();
    let new_len = new_chunks.len();
    let mut chunk_map: HashMap<i64, Chunk> = HashMap::new();

    for chunk in base_chunks {
        if chunk.id > 0 {
            chunk_map.insert(chunk.id, chunk);
        }
    }

    for chunk in new_chunks {
        if chunk.id <= 0 {
            continue;
        }
        match chunk_map.get(&chunk.id) {
            Some(existing) if rerank(existing) >= rerank(&chunk) => {}
            _ => {
                chunk_map.insert(chunk.id, chunk);
            }
        }
    }

    let merged: Vec<Chunk> = chunk_map.into_values().collect();
    debug!("{log_prefix}: {base_len} + {new_len} → {} total", merged.len());
    merged
}
