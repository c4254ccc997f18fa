//! Research and code-mapper configuration.
//!
//! Configuration is resolved in order: explicit values → environment
//! variables (`QUARRY_RESEARCH_*`) → defaults. Boolean environment values
//! accept `1`/`true`/`yes`/`on` (case-insensitive); invalid numeric values
//! fall back silently to the default.

use std::time::Duration;

/// Exploration algorithm selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Algorithm {
    /// BFS exploration with follow-up questions.
    V1,
    /// Wide coverage: depth exploration + gap detection.
    V2,
    /// Parallel composite of BFS and wide coverage.
    #[default]
    V3,
}

impl Algorithm {
    /// Parses `v1`/`v2`/`v3` (case-insensitive). Unknown values yield `None`.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "v1" => Some(Self::V1),
            "v2" => Some(Self::V2),
            "v3" => Some(Self::V3),
            _ => None,
        }
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::V1 => write!(f, "v1"),
            Self::V2 => write!(f, "v2"),
            Self::V3 => write!(f, "v3"),
        }
    }
}

/// Parses a boolean environment value: `1`, `true`, `yes`, `on` are true.
fn parse_env_bool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Reads an environment variable through a parser, keeping the current value
/// on absence or parse failure.
fn env_override<T, F>(name: &str, current: T, parse: F) -> T
where
    F: FnOnce(&str) -> Option<T>,
{
    match std::env::var(name) {
        Ok(raw) => parse(&raw).unwrap_or(current),
        Err(_) => current,
    }
}

/// Configuration for the deep research pipeline.
///
/// Field defaults mirror the validated ranges the research algorithm was
/// tuned with; see [`ResearchConfig::from_env`] for the environment surface.
#[derive(Debug, Clone)]
pub struct ResearchConfig {
    /// Exploration strategy selector.
    pub algorithm: Algorithm,

    // Phase 1: coverage
    /// Enable LLM-based query expansion for broader coverage.
    pub query_expansion_enabled: bool,
    /// Number of additional queries to generate from the input query.
    pub num_expanded_queries: usize,
    /// Results per semantic query page.
    pub initial_page_size: usize,
    /// Minimum rerank score for chunk inclusion.
    pub relevance_threshold: f32,
    /// Maximum symbols to extract for regex augmentation.
    pub max_symbols: usize,
    /// Regex target as a fraction of the semantic result count.
    pub regex_augmentation_ratio: f32,
    /// Minimum regex results regardless of the ratio.
    pub regex_min_results: usize,
    /// Internal pagination batch size for regex exclusion scanning.
    pub regex_scan_page_size: usize,
    /// Maximum duration for multi-hop semantic expansion.
    pub multi_hop_time_limit: Duration,
    /// Maximum chunks accumulated during multi-hop expansion.
    pub multi_hop_result_limit: usize,

    // Phase 1.5: depth exploration
    /// Enable aspect-based exploration of already-covered files.
    pub depth_exploration_enabled: bool,
    /// Top-K files (by average rerank score) to explore.
    pub max_exploration_files: usize,
    /// Aspect queries generated per file.
    pub exploration_queries_per_file: usize,

    // Phase 2: gap detection
    /// Minimum gaps to fill after selection.
    pub min_gaps: usize,
    /// Maximum gaps to fill after selection.
    pub max_gaps: usize,
    /// Cosine distance threshold for clustering similar gap queries.
    pub gap_similarity_threshold: f32,
    /// Token budget per gap-detection shard.
    pub shard_budget: usize,
    /// Minimum cluster size for HDBSCAN clustering.
    pub min_cluster_size: usize,

    // Phase 3: synthesis
    /// Output token budget for final synthesis.
    pub target_tokens: usize,
    /// Maximum compression loop iterations.
    pub max_compression_iterations: usize,
    /// Maximum lines to expand for complete functions/classes.
    pub max_boundary_expansion_lines: usize,
    /// Top chunks per file for the representative document.
    pub max_chunks_per_file_repr: usize,
    /// Token limit per file representative document.
    pub max_tokens_per_file_repr: usize,
    /// Maximum tokens for the LLM context window.
    pub context_window: usize,
    /// Maximum recursion depth for hierarchical compression.
    pub compression_max_depth: usize,
    /// Maximum tokens for the final synthesis call.
    pub final_synthesis_threshold: usize,
    /// Optional absolute cap on synthesis input tokens.
    pub synthesis_input_cap: Option<usize>,
    /// Depth-adaptive token budgets (legacy fixed budgets when false).
    pub adaptive_budgets_enabled: bool,

    // Context enhancement
    /// Enable neighboring chunk expansion for context.
    pub window_expansion_enabled: bool,
    /// Lines to expand before/after retrieved chunks.
    pub window_expansion_lines: u32,
    /// Automatically fetch source files for imports in retrieved chunks.
    pub import_resolution_enabled: bool,
    /// Maximum import source files to fetch per phase.
    pub import_resolution_max_files: usize,

    // Exhaustive mode
    /// Lift time/result caps for exhaustive retrieval.
    pub exhaustive_mode: bool,
    /// Safety timeout for exhaustive mode.
    pub exhaustive_time_limit: Duration,
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::V3,
            query_expansion_enabled: true,
            num_expanded_queries: 2,
            initial_page_size: 30,
            relevance_threshold: 0.5,
            max_symbols: 5,
            regex_augmentation_ratio: 0.3,
            regex_min_results: 20,
            regex_scan_page_size: 100,
            multi_hop_time_limit: Duration::from_secs_f64(5.0),
            multi_hop_result_limit: 500,
            depth_exploration_enabled: true,
            max_exploration_files: 5,
            exploration_queries_per_file: 2,
            min_gaps: 1,
            max_gaps: 10,
            gap_similarity_threshold: 0.25,
            shard_budget: 40_000,
            min_cluster_size: 5,
            target_tokens: 20_000,
            max_compression_iterations: 5,
            max_boundary_expansion_lines: 300,
            max_chunks_per_file_repr: 5,
            max_tokens_per_file_repr: 2000,
            context_window: 150_000,
            compression_max_depth: 10,
            final_synthesis_threshold: 75_000,
            synthesis_input_cap: None,
            adaptive_budgets_enabled: true,
            window_expansion_enabled: true,
            window_expansion_lines: 50,
            import_resolution_enabled: true,
            import_resolution_max_files: 10,
            exhaustive_mode: false,
            exhaustive_time_limit: Duration::from_secs_f64(600.0),
        }
    }
}

impl ResearchConfig {
    /// Builds a configuration from defaults overlaid with `QUARRY_RESEARCH_*`
    /// environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Applies `QUARRY_RESEARCH_*` environment overrides to `self`.
    ///
    /// Invalid values are ignored (the current value is kept).
    #[must_use]
    #[allow(clippy::too_many_lines)]
    pub fn with_env_overrides(mut self) -> Self {
        self.algorithm = env_override("QUARRY_RESEARCH_ALGORITHM", self.algorithm, |v| {
            Algorithm::parse(v)
        });
        self.query_expansion_enabled = env_override(
            "QUARRY_RESEARCH_QUERY_EXPANSION_ENABLED",
            self.query_expansion_enabled,
            |v| Some(parse_env_bool(v)),
        );
        self.num_expanded_queries = env_override(
            "QUARRY_RESEARCH_NUM_EXPANDED_QUERIES",
            self.num_expanded_queries,
            |v| v.trim().parse().ok(),
        );
        self.initial_page_size = env_override(
            "QUARRY_RESEARCH_INITIAL_PAGE_SIZE",
            self.initial_page_size,
            |v| v.trim().parse().ok(),
        );
        self.relevance_threshold = env_override(
            "QUARRY_RESEARCH_RELEVANCE_THRESHOLD",
            self.relevance_threshold,
            |v| v.trim().parse().ok(),
        );
        self.max_symbols = env_override("QUARRY_RESEARCH_MAX_SYMBOLS", self.max_symbols, |v| {
            v.trim().parse().ok()
        });
        self.regex_augmentation_ratio = env_override(
            "QUARRY_RESEARCH_REGEX_AUGMENTATION_RATIO",
            self.regex_augmentation_ratio,
            |v| v.trim().parse().ok(),
        );
        self.regex_min_results = env_override(
            "QUARRY_RESEARCH_REGEX_MIN_RESULTS",
            self.regex_min_results,
            |v| v.trim().parse().ok(),
        );
        self.regex_scan_page_size = env_override(
            "QUARRY_RESEARCH_REGEX_SCAN_PAGE_SIZE",
            self.regex_scan_page_size,
            |v| v.trim().parse().ok(),
        );
        self.multi_hop_time_limit = env_override(
            "QUARRY_RESEARCH_MULTI_HOP_TIME_LIMIT",
            self.multi_hop_time_limit,
            |v| v.trim().parse().ok().map(Duration::from_secs_f64),
        );
        self.multi_hop_result_limit = env_override(
            "QUARRY_RESEARCH_MULTI_HOP_RESULT_LIMIT",
            self.multi_hop_result_limit,
            |v| v.trim().parse().ok(),
        );
        self.depth_exploration_enabled = env_override(
            "QUARRY_RESEARCH_DEPTH_EXPLORATION_ENABLED",
            self.depth_exploration_enabled,
            |v| Some(parse_env_bool(v)),
        );
        self.max_exploration_files = env_override(
            "QUARRY_RESEARCH_MAX_EXPLORATION_FILES",
            self.max_exploration_files,
            |v| v.trim().parse().ok(),
        );
        self.exploration_queries_per_file = env_override(
            "QUARRY_RESEARCH_EXPLORATION_QUERIES_PER_FILE",
            self.exploration_queries_per_file,
            |v| v.trim().parse().ok(),
        );
        self.min_gaps = env_override("QUARRY_RESEARCH_MIN_GAPS", self.min_gaps, |v| {
            v.trim().parse().ok()
        });
        self.max_gaps = env_override("QUARRY_RESEARCH_MAX_GAPS", self.max_gaps, |v| {
            v.trim().parse().ok()
        });
        self.gap_similarity_threshold = env_override(
            "QUARRY_RESEARCH_GAP_SIMILARITY_THRESHOLD",
            self.gap_similarity_threshold,
            |v| v.trim().parse().ok(),
        );
        self.shard_budget = env_override("QUARRY_RESEARCH_SHARD_BUDGET", self.shard_budget, |v| {
            v.trim().parse().ok()
        });
        self.min_cluster_size = env_override(
            "QUARRY_RESEARCH_MIN_CLUSTER_SIZE",
            self.min_cluster_size,
            |v| v.trim().parse().ok(),
        );
        self.target_tokens = env_override(
            "QUARRY_RESEARCH_TARGET_TOKENS",
            self.target_tokens,
            |v| v.trim().parse().ok(),
        );
        self.max_compression_iterations = env_override(
            "QUARRY_RESEARCH_MAX_COMPRESSION_ITERATIONS",
            self.max_compression_iterations,
            |v| v.trim().parse().ok(),
        );
        self.max_boundary_expansion_lines = env_override(
            "QUARRY_RESEARCH_MAX_BOUNDARY_EXPANSION_LINES",
            self.max_boundary_expansion_lines,
            |v| v.trim().parse().ok(),
        );
        self.max_chunks_per_file_repr = env_override(
            "QUARRY_RESEARCH_MAX_CHUNKS_PER_FILE_REPR",
            self.max_chunks_per_file_repr,
            |v| v.trim().parse().ok(),
        );
        self.max_tokens_per_file_repr = env_override(
            "QUARRY_RESEARCH_MAX_TOKENS_PER_FILE_REPR",
            self.max_tokens_per_file_repr,
            |v| v.trim().parse().ok(),
        );
        self.context_window = env_override(
            "QUARRY_RESEARCH_CONTEXT_WINDOW",
            self.context_window,
            |v| v.trim().parse().ok(),
        );
        self.compression_max_depth = env_override(
            "QUARRY_RESEARCH_COMPRESSION_MAX_DEPTH",
            self.compression_max_depth,
            |v| v.trim().parse().ok(),
        );
        self.final_synthesis_threshold = env_override(
            "QUARRY_RESEARCH_FINAL_SYNTHESIS_THRESHOLD",
            self.final_synthesis_threshold,
            |v| v.trim().parse().ok(),
        );
        self.synthesis_input_cap = env_override(
            "QUARRY_RESEARCH_SYNTHESIS_INPUT_CAP",
            self.synthesis_input_cap,
            |v| v.trim().parse().ok().filter(|cap| *cap > 0).map(Some),
        );
        self.adaptive_budgets_enabled = env_override(
            "QUARRY_RESEARCH_ADAPTIVE_BUDGETS_ENABLED",
            self.adaptive_budgets_enabled,
            |v| Some(parse_env_bool(v)),
        );
        self.window_expansion_enabled = env_override(
            "QUARRY_RESEARCH_WINDOW_EXPANSION_ENABLED",
            self.window_expansion_enabled,
            |v| Some(parse_env_bool(v)),
        );
        self.window_expansion_lines = env_override(
            "QUARRY_RESEARCH_WINDOW_EXPANSION_LINES",
            self.window_expansion_lines,
            |v| v.trim().parse().ok(),
        );
        self.import_resolution_enabled = env_override(
            "QUARRY_RESEARCH_IMPORT_RESOLUTION_ENABLED",
            self.import_resolution_enabled,
            |v| Some(parse_env_bool(v)),
        );
        self.import_resolution_max_files = env_override(
            "QUARRY_RESEARCH_IMPORT_RESOLUTION_MAX_FILES",
            self.import_resolution_max_files,
            |v| v.trim().parse().ok(),
        );
        self.exhaustive_mode = env_override(
            "QUARRY_RESEARCH_EXHAUSTIVE_MODE",
            self.exhaustive_mode,
            |v| Some(parse_env_bool(v)),
        );
        self.exhaustive_time_limit = env_override(
            "QUARRY_RESEARCH_EXHAUSTIVE_TIME_LIMIT",
            self.exhaustive_time_limit,
            |v| v.trim().parse().ok().map(Duration::from_secs_f64),
        );
        self
    }

    /// Effective semantic search time limit based on exhaustive mode.
    #[must_use]
    pub const fn effective_time_limit(&self) -> Duration {
        if self.exhaustive_mode {
            self.exhaustive_time_limit
        } else {
            self.multi_hop_time_limit
        }
    }

    /// Effective result limit, or `None` in exhaustive mode (no cap).
    #[must_use]
    pub const fn effective_result_limit(&self) -> Option<usize> {
        if self.exhaustive_mode {
            None
        } else {
            Some(self.multi_hop_result_limit)
        }
    }
}

/// How thorough the code mapper's planning pass should be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Comprehensiveness {
    /// Smallest planning context; one operational PoI.
    Minimal,
    /// Light planning context.
    Low,
    /// Balanced default.
    #[default]
    Medium,
    /// Large planning context.
    High,
    /// Maximum planning context.
    Ultra,
}

impl Comprehensiveness {
    /// Parses a comprehensiveness level (case-insensitive).
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "minimal" => Some(Self::Minimal),
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "ultra" => Some(Self::Ultra),
            _ => None,
        }
    }

    /// Hard cap on the number of scope files listed in the HyDE prompt.
    #[must_use]
    pub const fn scope_file_cap(self) -> usize {
        match self {
            Self::Minimal => 200,
            Self::Low => 500,
            Self::Medium => 2000,
            Self::High => 3000,
            Self::Ultra => 5000,
        }
    }

    /// Token budget for sampled code snippets in the HyDE prompt.
    #[must_use]
    pub const fn snippet_token_budget(self) -> usize {
        match self {
            Self::Minimal => 2_000,
            Self::Low => 10_000,
            Self::Medium => 20_000,
            Self::High => 35_000,
            Self::Ultra => 50_000,
        }
    }

    /// Maximum operational points of interest.
    #[must_use]
    pub const fn operational_poi_budget(self) -> usize {
        match self {
            Self::Minimal => 1,
            Self::Low => 2,
            Self::Medium => 3,
            Self::High => 4,
            Self::Ultra => 5,
        }
    }
}

impl std::fmt::Display for Comprehensiveness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Minimal => write!(f, "minimal"),
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Ultra => write!(f, "ultra"),
        }
    }
}

/// Configuration for the code-mapper pipeline.
#[derive(Debug, Clone)]
pub struct MapperConfig {
    /// Planning thoroughness level.
    pub comprehensiveness: Comprehensiveness,
    /// Maximum architectural points of interest.
    pub max_points: usize,
    /// Requested PoI research concurrency; `None` auto-selects `min(4, N)`.
    pub poi_jobs: Option<usize>,
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self {
            comprehensiveness: Comprehensiveness::Medium,
            max_points: 10,
            poi_jobs: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_defaults() {
        let cfg = ResearchConfig::default();
        assert_eq!(cfg.algorithm, Algorithm::V3);
        assert!(cfg.query_expansion_enabled);
        assert_eq!(cfg.num_expanded_queries, 2);
        assert_eq!(cfg.initial_page_size, 30);
        assert_eq!(cfg.max_symbols, 5);
        assert_eq!(cfg.regex_min_results, 20);
        assert_eq!(cfg.shard_budget, 40_000);
        assert_eq!(cfg.window_expansion_lines, 50);
        assert!(cfg.synthesis_input_cap.is_none());
    }

    #[test]
    fn test_effective_limits_normal_mode() {
        let cfg = ResearchConfig::default();
        assert_eq!(cfg.effective_time_limit(), Duration::from_secs(5));
        assert_eq!(cfg.effective_result_limit(), Some(500));
    }

    #[test]
    fn test_effective_limits_exhaustive_mode() {
        let cfg = ResearchConfig {
            exhaustive_mode: true,
            ..ResearchConfig::default()
        };
        assert_eq!(cfg.effective_time_limit(), Duration::from_secs(600));
        assert_eq!(cfg.effective_result_limit(), None);
    }

    #[test_case("1", true; "one")]
    #[test_case("true", true; "lowercase true")]
    #[test_case("YES", true; "uppercase yes")]
    #[test_case("On", true; "mixed case on")]
    #[test_case("0", false; "zero")]
    #[test_case("false", false; "false value")]
    #[test_case("off", false; "off value")]
    #[test_case("banana", false; "garbage")]
    fn test_parse_env_bool(input: &str, expected: bool) {
        assert_eq!(parse_env_bool(input), expected);
    }

    #[test]
    fn test_algorithm_parse() {
        assert_eq!(Algorithm::parse("v1"), Some(Algorithm::V1));
        assert_eq!(Algorithm::parse(" V2 "), Some(Algorithm::V2));
        assert_eq!(Algorithm::parse("v3"), Some(Algorithm::V3));
        assert_eq!(Algorithm::parse("v4"), None);
    }

    #[test]
    fn test_env_override_ignores_invalid() {
        // env_override keeps the current value on parse failure
        let kept = env_override("QUARRY_TEST_UNSET_VARIABLE", 42_usize, |v| {
            v.trim().parse().ok()
        });
        assert_eq!(kept, 42);
    }

    #[test]
    fn test_comprehensiveness_tables() {
        assert_eq!(Comprehensiveness::Minimal.scope_file_cap(), 200);
        assert_eq!(Comprehensiveness::Medium.scope_file_cap(), 2000);
        assert_eq!(Comprehensiveness::Ultra.scope_file_cap(), 5000);
        assert_eq!(Comprehensiveness::Minimal.snippet_token_budget(), 2_000);
        assert_eq!(Comprehensiveness::Ultra.snippet_token_budget(), 50_000);
        assert_eq!(Comprehensiveness::Medium.operational_poi_budget(), 3);
        assert_eq!(Comprehensiveness::High.operational_poi_budget(), 4);
    }

    #[test]
    fn test_comprehensiveness_parse() {
        assert_eq!(
            Comprehensiveness::parse("medium"),
            Some(Comprehensiveness::Medium)
        );
        assert_eq!(
            Comprehensiveness::parse("ULTRA"),
            Some(Comprehensiveness::Ultra)
        );
        assert_eq!(Comprehensiveness::parse("extreme"), None);
    }
}
