//! Elbow detection for threshold computation.
//!
//! Implements the Kneedle algorithm (Satopaa et al. 2011) for finding elbow
//! points in descending score curves. Research phases use the elbow as a
//! data-driven relevance cutoff instead of fixed thresholds.

use tracing::debug;

use crate::core::Chunk;

/// Default threshold when no scores are available.
const DEFAULT_THRESHOLD: f32 = 0.5;

/// Minimum normalized perpendicular distance for an elbow to count.
const MIN_ELBOW_DISTANCE: f64 = 0.01;

/// Which score field elbow filtering reads from a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScoreKey {
    /// Semantic search score.
    Semantic,
    /// Rerank score.
    Rerank,
    /// Prefer rerank over semantic (cross-strategy merges).
    #[default]
    Unified,
}

impl ScoreKey {
    fn get(self, chunk: &Chunk) -> f32 {
        match self {
            Self::Semantic => chunk.score.unwrap_or(0.0),
            Self::Rerank => chunk.rerank_score.unwrap_or(0.0),
            Self::Unified => chunk.unified_score(),
        }
    }
}

/// Statistics describing one elbow filtering pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ElbowFilterStats {
    /// `"elbow"` or `"passthrough"`.
    pub method: &'static str,
    /// Why this method was used.
    pub reason: &'static str,
    /// Input chunk count.
    pub original_count: usize,
    /// Output chunk count.
    pub filtered_count: usize,
    /// Score at the elbow point, when one was found.
    pub cutoff_score: Option<f32>,
    /// Elbow index, when one was found.
    pub elbow_index: Option<usize>,
}

/// Finds the elbow point in a descending score curve.
///
/// Normalizes scores to `[0, 1]`, draws the chord from the first to the last
/// point, and returns the index of maximum perpendicular distance to that
/// chord when the distance is significant (> 1% of the normalized range).
///
/// Returns `None` for fewer than 3 points or uniform scores.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn find_elbow_kneedle(sorted_scores: &[f32]) -> Option<usize> {
    if sorted_scores.len() < 3 {
        debug!("kneedle: too few points (<3), cannot detect elbow");
        return None;
    }

    let min_score = sorted_scores.iter().copied().fold(f32::INFINITY, f32::min);
    let max_score = sorted_scores
        .iter()
        .copied()
        .fold(f32::NEG_INFINITY, f32::max);
    if (max_score - min_score).abs() < f32::EPSILON {
        debug!("kneedle: all scores identical, no elbow");
        return None;
    }

    let n = sorted_scores.len();
    let range = f64::from(max_score - min_score);
    let normalized: Vec<f64> = sorted_scores
        .iter()
        .map(|&s| f64::from(s - min_score) / range)
        .collect();

    // Chord from the first point (x=0) to the last (x=1)
    let y1 = normalized[0];
    let y2 = normalized[n - 1];
    let m = y2 - y1;
    let b = y1;

    // Perpendicular distance: |m*x - y + b| / sqrt(m^2 + 1)
    let denominator = m.mul_add(m, 1.0).sqrt();
    let mut best_idx = 0;
    let mut best_distance = 0.0;
    for (i, &y) in normalized.iter().enumerate() {
        let x = i as f64 / (n - 1) as f64;
        let distance = (m.mul_add(x, b) - y).abs() / denominator;
        if distance > best_distance {
            best_distance = distance;
            best_idx = i;
        }
    }

    if best_distance < MIN_ELBOW_DISTANCE {
        debug!("kneedle: elbow not significant (distance={best_distance:.4})");
        return None;
    }

    debug!(
        "kneedle: found elbow at index {best_idx} (distance={best_distance:.4}, \
         score={:.3})",
        sorted_scores[best_idx]
    );
    Some(best_idx)
}

/// Computes a threshold from raw scores: the score at the Kneedle elbow, or
/// the median when no significant elbow exists.
///
/// Empty input yields the default threshold of 0.5.
#[must_use]
pub fn compute_elbow_threshold(scores: &[f32]) -> f32 {
    if scores.is_empty() {
        return DEFAULT_THRESHOLD;
    }

    let mut sorted: Vec<f32> = scores.to_vec();
    sorted.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));

    if let Some(elbow_idx) = find_elbow_kneedle(&sorted) {
        let threshold = sorted[elbow_idx];
        debug!(
            "elbow threshold: {threshold:.3} (kneedle at index {elbow_idx} of {} scores)",
            scores.len()
        );
        return threshold;
    }

    let threshold = sorted[sorted.len() / 2];
    debug!(
        "elbow threshold: {threshold:.3} (median fallback over {} scores)",
        scores.len()
    );
    threshold
}

/// Filters chunks to those at or above the elbow point of their score curve.
///
/// Chunks are sorted descending by the selected score. When no elbow exists
/// (uniform scores, fewer than 3 chunks, empty input) all chunks pass
/// through sorted.
#[must_use]
pub fn filter_chunks_by_elbow(
    chunks: Vec<Chunk>,
    score_key: ScoreKey,
) -> (Vec<Chunk>, ElbowFilterStats) {
    let original_count = chunks.len();

    if chunks.is_empty() {
        return (
            chunks,
            ElbowFilterStats {
                method: "passthrough",
                reason: "empty_input",
                original_count: 0,
                filtered_count: 0,
                cutoff_score: None,
                elbow_index: None,
            },
        );
    }

    if chunks.len() < 3 {
        return (
            chunks,
            ElbowFilterStats {
                method: "passthrough",
                reason: "too_few_chunks",
                original_count,
                filtered_count: original_count,
                cutoff_score: None,
                elbow_index: None,
            },
        );
    }

    let mut sorted = chunks;
    sorted.sort_by(|a, b| {
        score_key
            .get(b)
            .partial_cmp(&score_key.get(a))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let scores: Vec<f32> = sorted.iter().map(|c| score_key.get(c)).collect();

    let Some(elbow_idx) = find_elbow_kneedle(&scores) else {
        debug!(
            "elbow filter: no elbow detected in {original_count} chunks, keeping all"
        );
        return (
            sorted,
            ElbowFilterStats {
                method: "passthrough",
                reason: "no_elbow_detected",
                original_count,
                filtered_count: original_count,
                cutoff_score: None,
                elbow_index: None,
            },
        );
    };

    let cutoff_score = scores[elbow_idx];
    sorted.truncate(elbow_idx + 1);

    (
        sorted,
        ElbowFilterStats {
            method: "elbow",
            reason: "elbow_detected",
            original_count,
            filtered_count: elbow_idx + 1,
            cutoff_score: Some(cutoff_score),
            elbow_index: Some(elbow_idx),
        },
    )
}
