//! The deep research core.
//!
//! Composes hybrid retrieval, adaptive exploration, evidence accumulation,
//! and map-reduce synthesis into a pipeline that answers natural-language
//! questions about an indexed repository with cited sources.
//!
//! Data flow: query → expansion → unified search → exploration strategy
//! (BFS | wide | parallel) → elbow filter → file read → cluster → fact
//! extract → synthesis → citation validation → answer.

pub mod budget;
pub mod citations;
pub mod clustering;
pub mod dedup;
pub mod depth;
pub mod elbow;
pub mod evidence;
pub mod explore;
pub mod gaps;
pub mod imports;
pub mod models;
pub mod progress;
pub mod questions;
pub mod reader;
pub mod search;
pub mod service;
pub mod synthesis;

pub use budget::{BudgetCalculator, NodeBudgets, SynthesisBudgets};
pub use citations::{CitationManager, ReferenceMap};
pub use clustering::{ClusterFlags, ClusterGroup, ClusterSummary, ClusteringService};
pub use elbow::{ScoreKey, compute_elbow_threshold, filter_chunks_by_elbow, find_elbow_kneedle};
pub use evidence::{
    ConfidenceLevel, ConstantEntry, EntityLink, EvidenceLedger, FactConflict, FactEntry,
};
pub use explore::{
    BfsStrategy, Exploration, ExplorationStats, ExplorationStrategy, ParallelStrategy,
    StrategyDeps, WideCoverageStrategy, build_strategy,
};
pub use models::{GapCandidate, UnifiedGap};
pub use progress::{NullSink, OffsetSink, ProgressEvent, ProgressSink, TracingSink};
pub use search::UnifiedSearch;
pub use service::{DeepResearchService, ResearchMetadata, ResearchResult};
pub use synthesis::SynthesisEngine;
