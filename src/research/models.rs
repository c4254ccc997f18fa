//! Shared constants and small data models for the research pipeline.

use serde::{Deserialize, Serialize};

// Search
/// Default minimum rerank score for chunk inclusion.
pub const RELEVANCE_THRESHOLD: f32 = 0.5;
/// Maximum follow-up questions generated per BFS node.
pub const MAX_FOLLOWUP_QUESTIONS: usize = 3;

// Import resolution default scores. Import-resolved chunks carry no rerank
// score, so they get conservative defaults that never outrank real results.
/// Default score for imports attached during phases 1.5 and 2.
pub const IMPORT_DEFAULT_SCORE: f32 = 0.3;
/// Default score for imports discovered at synthesis time.
pub const IMPORT_SYNTHESIS_SCORE: f32 = 0.2;

// Utility operation output budgets. Reasoning models consume thinking tokens
// before producing a short answer, so budgets are far above the visible
// output size.
/// Output budget for query expansion calls.
pub const QUERY_EXPANSION_TOKENS: u32 = 10_000;
/// Output budget for question synthesis calls.
pub const QUESTION_SYNTHESIS_TOKENS: u32 = 15_000;
/// Output budget for follow-up generation floor.
pub const FOLLOWUP_OUTPUT_TOKENS_MIN: u32 = 8_000;
/// Output budget for follow-up generation ceiling.
pub const FOLLOWUP_OUTPUT_TOKENS_MAX: u32 = 15_000;

// Single-pass synthesis
/// Fixed output budget for synthesis calls (output + reasoning headroom).
pub const OUTPUT_TOKENS_WITH_REASONING: u32 = 30_000;
/// Prompt template overhead budget.
pub const SINGLE_PASS_OVERHEAD_TOKENS: usize = 5_000;
/// Timeout for large synthesis calls.
pub const SINGLE_PASS_TIMEOUT_SECONDS: u64 = 600;
/// Target visible output length, steered via prompt instructions.
pub const TARGET_OUTPUT_TOKENS: usize = 15_000;
/// Minimum characters for a valid synthesis answer.
pub const MIN_SYNTHESIS_LENGTH: usize = 100;

// Fact extraction
/// Output budget per fact-extraction cluster call.
pub const FACT_EXTRACTION_TOKENS: u32 = 8_000;
/// Maximum facts accepted per cluster.
pub const MAX_FACTS_PER_CLUSTER: usize = 30;
/// Hard limit on fact statement length, enforced at extraction.
pub const MAX_FACT_STATEMENT_CHARS: usize = 100;

// Gap detection
/// Token budget per gap-detection k-means cluster.
pub const GAP_CLUSTER_TOKEN_BUDGET: usize = 50_000;
/// Number of k-means initialization runs for reproducibility.
pub const KMEANS_N_INIT: usize = 10;

// File representative documents for synthesis-priority reranking
/// Top chunks included in a file representative document.
pub const MAX_CHUNKS_PER_FILE_REPR: usize = 5;
/// Token limit for a file representative document.
pub const MAX_TOKENS_PER_FILE_REPR: usize = 2000;

/// A gap candidate proposed by one detection shard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GapCandidate {
    /// Search query that would fill the gap.
    pub query: String,
    /// Why the shard believes this is missing.
    pub rationale: String,
    /// Shard-assessed confidence in `[0, 1]`.
    pub confidence: f32,
    /// Index of the shard that proposed this candidate.
    pub source_shard: usize,
}

/// A unified gap after near-duplicate candidates are merged.
#[derive(Debug, Clone)]
pub struct UnifiedGap {
    /// Refined query covering all merged candidates.
    pub query: String,
    /// The candidates that voted for this gap.
    pub sources: Vec<GapCandidate>,
    /// Number of candidates merged.
    pub vote_count: usize,
    /// Mean confidence across candidates.
    pub avg_confidence: f32,
    /// Selection score; see [`gap_score`].
    pub score: f32,
}

/// Gap selection score: `votes · avg_confidence · (1 + 0.3 · shard_bonus)`
/// where `shard_bonus = 1 / (1 + min_source_shard)`.
///
/// Early shards hold the highest-scoring coverage, so gaps they report get a
/// small boost.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn gap_score(vote_count: usize, avg_confidence: f32, min_source_shard: usize) -> f32 {
    let shard_bonus = 1.0 / (1.0 + min_source_shard as f32);
    vote_count as f32 * avg_confidence * 0.3f32.mul_add(shard_bonus, 1.0)
}
