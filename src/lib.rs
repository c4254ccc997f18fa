//! # Quarry
//!
//! Deep code research engine. Given a natural-language query over an
//! indexed repository, quarry produces a comprehensive, cited answer by
//! combining hybrid retrieval (dense + sparse with reranking), adaptive
//! exploration strategies, evidence accumulation, and map-reduce LLM
//! synthesis.
//!
//! ## Features
//!
//! - **Unified search**: multi-query semantic search, symbol-regex
//!   backfill, compound reranking, window expansion
//! - **Exploration strategies**: BFS follow-up questions, wide coverage
//!   (depth exploration + gap detection), and their parallel composite
//! - **Evidence ledger**: repo constants and LLM-extracted facts with
//!   conflict detection
//! - **Map-reduce synthesis**: cluster-bounded parallel synthesis with
//!   numbered citations
//! - **Code mapper**: HyDE-planned per-topic documentation over a scope

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
#![warn(unsafe_code)]

pub mod cli;
pub mod config;
pub mod core;
pub mod embedding;
pub mod error;
pub mod llm;
pub mod mapper;
pub mod research;
pub mod store;

// Re-export commonly used types at crate root
pub use error::{Error, Result};

// Re-export core domain types
pub use crate::core::{Chunk, ChunkKind, ChunkMetadata, FileRecord, ResearchContext};

// Re-export configuration
pub use config::{Algorithm, Comprehensiveness, MapperConfig, ResearchConfig};

// Re-export provider traits
pub use embedding::{EmbeddingProvider, HashEmbedder, RerankResult, cosine_similarity};
pub use llm::{Completion, CompletionRequest, LlmProvider, StructuredRequest, TokenUsage};
pub use store::{ChunkStore, ScopeStats, SearchStats, SemanticQuery, SqliteChunkStore};

// Re-export the research pipeline surface
pub use research::{
    DeepResearchService, EvidenceLedger, ExplorationStrategy, ResearchResult, StrategyDeps,
    build_strategy,
};

// Re-export the code mapper surface
pub use mapper::{CodeMapperPipeline, MapperRun, render_run, write_docs};
