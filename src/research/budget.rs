//! Token budget calculation for research synthesis.
//!
//! Two budget families: synthesis budgets scale INPUT tokens with repository
//! size (output stays fixed for reasoning-model headroom), and adaptive
//! per-node budgets scale both directions with tree depth. All calculations
//! are pure functions of their inputs.

use tracing::debug;

use super::models::{OUTPUT_TOKENS_WITH_REASONING, SINGLE_PASS_OVERHEAD_TOKENS};

/// Rough estimate: one chunk ≈ 20 lines of code.
const CHUNKS_TO_LOC_ESTIMATE: usize = 20;
const LOC_THRESHOLD_TINY: usize = 10_000;
const LOC_THRESHOLD_SMALL: usize = 100_000;
const LOC_THRESHOLD_MEDIUM: usize = 1_000_000;

const SYNTHESIS_INPUT_TOKENS_TINY: usize = 30_000;
const SYNTHESIS_INPUT_TOKENS_SMALL: usize = 50_000;
const SYNTHESIS_INPUT_TOKENS_MEDIUM: usize = 80_000;
const SYNTHESIS_INPUT_TOKENS_LARGE: usize = 150_000;

// Adaptive budget ranges (depth-dependent)
const FILE_CONTENT_TOKENS_MIN: usize = 10_000;
const FILE_CONTENT_TOKENS_MAX: usize = 50_000;
const LLM_INPUT_TOKENS_MIN: usize = 15_000;
const LLM_INPUT_TOKENS_MAX: usize = 60_000;
const LEAF_ANSWER_TOKENS_BASE: usize = 18_000;
const LEAF_ANSWER_TOKENS_BONUS: usize = 3_000;
const INTERNAL_ROOT_TARGET: usize = 11_000;
const INTERNAL_MAX_TOKENS: usize = 19_000;
const FOLLOWUP_OUTPUT_TOKENS_MIN: usize = 8_000;
const FOLLOWUP_OUTPUT_TOKENS_MAX: usize = 15_000;

// Legacy fixed budgets (adaptive disabled)
const MAX_FILE_CONTENT_TOKENS: usize = 3_000;
const MAX_LLM_INPUT_TOKENS: usize = 5_000;
const MAX_LEAF_ANSWER_TOKENS: usize = 400;
const MAX_SYNTHESIS_TOKENS: usize = 600;
const LEGACY_FOLLOWUP_TOKENS: usize = 8_000;

/// Synthesis token budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SynthesisBudgets {
    /// Input context budget (scales with repo size).
    pub input_tokens: usize,
    /// Output budget, fixed for reasoning headroom.
    pub output_tokens: usize,
    /// Prompt template overhead.
    pub overhead_tokens: usize,
    /// Sum of the above.
    pub total_tokens: usize,
}

/// Per-node adaptive budgets for tree exploration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeBudgets {
    /// File content the node may read.
    pub file_content_tokens: usize,
    /// Total LLM input (query + context + code).
    pub llm_input_tokens: usize,
    /// Answer output budget.
    pub answer_tokens: usize,
    /// Follow-up question generation output budget.
    pub followup_output_tokens: usize,
}

/// Calculates token budgets for research operations.
#[derive(Debug, Clone, Copy)]
pub struct BudgetCalculator {
    /// Depth-adaptive budgets; legacy fixed budgets when false.
    pub adaptive_enabled: bool,
    /// Optional absolute cap on synthesis input tokens.
    pub synthesis_input_cap: Option<usize>,
}

impl Default for BudgetCalculator {
    fn default() -> Self {
        Self {
            adaptive_enabled: true,
            synthesis_input_cap: None,
        }
    }
}

impl BudgetCalculator {
    /// Synthesis budgets from the repository's chunk count.
    ///
    /// Estimated LOC = 20 · chunks; input budget steps through
    /// 30k/50k/80k/150k at the tiny/small/medium/large boundaries. Output is
    /// fixed at 30k, overhead at 5k. An optional absolute cap from
    /// configuration clamps the input budget.
    #[must_use]
    pub fn synthesis_budgets(&self, total_chunks: usize) -> SynthesisBudgets {
        let estimated_loc = total_chunks.saturating_mul(CHUNKS_TO_LOC_ESTIMATE);

        let mut input_tokens = if estimated_loc < LOC_THRESHOLD_TINY {
            SYNTHESIS_INPUT_TOKENS_TINY
        } else if estimated_loc < LOC_THRESHOLD_SMALL {
            SYNTHESIS_INPUT_TOKENS_SMALL
        } else if estimated_loc < LOC_THRESHOLD_MEDIUM {
            SYNTHESIS_INPUT_TOKENS_MEDIUM
        } else {
            SYNTHESIS_INPUT_TOKENS_LARGE
        };

        if let Some(cap) = self.synthesis_input_cap
            && cap > 0
        {
            input_tokens = input_tokens.min(cap);
        }

        let output_tokens = OUTPUT_TOKENS_WITH_REASONING as usize;
        let overhead_tokens = SINGLE_PASS_OVERHEAD_TOKENS;
        let total_tokens = input_tokens + output_tokens + overhead_tokens;

        debug!(
            "synthesis budgets for ~{estimated_loc} LOC: input={input_tokens}, \
             output={output_tokens}, total={total_tokens}"
        );

        SynthesisBudgets {
            input_tokens,
            output_tokens,
            overhead_tokens,
            total_tokens,
        }
    }

    /// Adaptive per-node budgets from tree position.
    ///
    /// Leaves analyze raw code and get the large end of the input ranges;
    /// the root synthesizes and gets the small end. Output budgets follow
    /// the same pyramid: leaves `18k + 3k·ratio`, internal `11k + 8k·ratio`.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn node_budgets(&self, depth: usize, max_depth: usize, is_leaf: bool) -> NodeBudgets {
        if !self.adaptive_enabled {
            return NodeBudgets {
                file_content_tokens: MAX_FILE_CONTENT_TOKENS,
                llm_input_tokens: MAX_LLM_INPUT_TOKENS,
                answer_tokens: if is_leaf {
                    MAX_LEAF_ANSWER_TOKENS
                } else {
                    MAX_SYNTHESIS_TOKENS
                },
                followup_output_tokens: LEGACY_FOLLOWUP_TOKENS,
            };
        }

        let depth_ratio = depth as f64 / max_depth.max(1) as f64;
        let lerp = |min: usize, max: usize| -> usize {
            (min as f64 + (max as f64 - min as f64) * depth_ratio) as usize
        };

        let file_content_tokens = lerp(FILE_CONTENT_TOKENS_MIN, FILE_CONTENT_TOKENS_MAX);
        let llm_input_tokens = lerp(LLM_INPUT_TOKENS_MIN, LLM_INPUT_TOKENS_MAX);
        let answer_tokens = if is_leaf {
            (LEAF_ANSWER_TOKENS_BASE as f64 + LEAF_ANSWER_TOKENS_BONUS as f64 * depth_ratio) as usize
        } else {
            lerp(INTERNAL_ROOT_TARGET, INTERNAL_MAX_TOKENS)
        };
        let followup_output_tokens = lerp(FOLLOWUP_OUTPUT_TOKENS_MIN, FOLLOWUP_OUTPUT_TOKENS_MAX);

        debug!(
            "adaptive budgets for depth {depth}/{max_depth} \
             ({}): file={file_content_tokens}, input={llm_input_tokens}, \
             output={answer_tokens}, followup={followup_output_tokens}",
            if is_leaf { "leaf" } else { "internal" }
        );

        NodeBudgets {
            file_content_tokens,
            llm_input_tokens,
            answer_tokens,
            followup_output_tokens,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    // LOC = 20 * chunks; boundaries at 10k/100k/1M LOC = 500/5k/50k chunks
    #[test_case(0, 30_000; "empty repo is tiny")]
    #[test_case(499, 30_000; "just under tiny boundary")]
    #[test_case(500, 50_000; "at small boundary")]
    #[test_case(4_999, 50_000; "just under small boundary")]
    #[test_case(5_000, 80_000; "at medium boundary")]
    #[test_case(49_999, 80_000; "just under medium boundary")]
    #[test_case(50_000, 150_000; "at large boundary")]
    #[test_case(1_000_000, 150_000; "very large repo")]
    fn test_synthesis_input_by_size(chunks: usize, expected_input: usize) {
        let budgets = BudgetCalculator::default().synthesis_budgets(chunks);
        assert_eq!(budgets.input_tokens, expected_input);
    }

    #[test]
    fn test_synthesis_fixed_output_and_overhead() {
        let budgets = BudgetCalculator::default().synthesis_budgets(1_000);
        assert_eq!(budgets.output_tokens, 30_000);
        assert_eq!(budgets.overhead_tokens, 5_000);
        assert_eq!(
            budgets.total_tokens,
            budgets.input_tokens + budgets.output_tokens + budgets.overhead_tokens
        );
    }

    #[test]
    fn test_synthesis_input_cap() {
        let calculator = BudgetCalculator {
            adaptive_enabled: true,
            synthesis_input_cap: Some(40_000),
        };
        let budgets = calculator.synthesis_budgets(100_000);
        assert_eq!(budgets.input_tokens, 40_000);

        // Cap above the computed value is a no-op
        let loose = BudgetCalculator {
            adaptive_enabled: true,
            synthesis_input_cap: Some(500_000),
        };
        assert_eq!(loose.synthesis_budgets(100).input_tokens, 30_000);
    }

    #[test]
    fn test_node_budgets_root() {
        let budgets = BudgetCalculator::default().node_budgets(0, 5, false);
        assert_eq!(budgets.file_content_tokens, 10_000);
        assert_eq!(budgets.llm_input_tokens, 15_000);
        assert_eq!(budgets.answer_tokens, 11_000);
        assert_eq!(budgets.followup_output_tokens, 8_000);
    }

    #[test]
    fn test_node_budgets_deep_leaf() {
        let budgets = BudgetCalculator::default().node_budgets(5, 5, true);
        assert_eq!(budgets.file_content_tokens, 50_000);
        assert_eq!(budgets.llm_input_tokens, 60_000);
        assert_eq!(budgets.answer_tokens, 21_000);
        assert_eq!(budgets.followup_output_tokens, 15_000);
    }

    #[test]
    fn test_node_budgets_midpoint() {
        let budgets = BudgetCalculator::default().node_budgets(1, 2, false);
        assert_eq!(budgets.file_content_tokens, 30_000);
        assert_eq!(budgets.llm_input_tokens, 37_500);
        assert_eq!(budgets.answer_tokens, 15_000);
    }

    #[test]
    fn test_node_budgets_zero_max_depth() {
        // max_depth is clamped to 1; depth 0 behaves like the root
        let budgets = BudgetCalculator::default().node_budgets(0, 0, true);
        assert_eq!(budgets.answer_tokens, 18_000);
    }

    #[test]
    fn test_legacy_budgets_flag() {
        let calculator = BudgetCalculator {
            adaptive_enabled: false,
            synthesis_input_cap: None,
        };
        let leaf = calculator.node_budgets(3, 5, true);
        assert_eq!(leaf.file_content_tokens, 3_000);
        assert_eq!(leaf.llm_input_tokens, 5_000);
        assert_eq!(leaf.answer_tokens, 400);

        let internal = calculator.node_budgets(3, 5, false);
        assert_eq!(internal.answer_tokens, 600);
    }

    #[test]
    fn test_leaf_budget_monotone_in_depth() {
        let calc = BudgetCalculator::default();
        let shallow = calc.node_budgets(1, 5, true).answer_tokens;
        let deep = calc.node_budgets(4, 5, true).answer_tokens;
        assert!(deep > shallow);
    }
}
