//! Chunk store interface.
//!
//! The research pipeline is read-only against the store (the realtime
//! indexer is the single writer). [`ChunkStore`] captures exactly the
//! surface the pipeline consumes; [`SqliteChunkStore`] is the bundled
//! adapter.

mod sqlite;

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::core::{Chunk, FileRecord};
use crate::error::StoreError;

pub use sqlite::SqliteChunkStore;

/// Parameters for a semantic search call.
#[derive(Debug, Clone, Default)]
pub struct SemanticQuery {
    /// Natural-language query text.
    pub query: String,
    /// Maximum results per page.
    pub page_size: usize,
    /// Optional minimum similarity score.
    pub threshold: Option<f32>,
    /// Optional path prefix filter.
    pub path_filter: Option<String>,
    /// Optional scoring time budget.
    pub time_limit: Option<Duration>,
    /// Optional cap on candidates accumulated before paging.
    pub result_limit: Option<usize>,
}

impl SemanticQuery {
    /// Creates a query with the given text and page size.
    #[must_use]
    pub fn new(query: impl Into<String>, page_size: usize) -> Self {
        Self {
            query: query.into(),
            page_size,
            ..Self::default()
        }
    }
}

/// Statistics returned alongside search results.
#[derive(Debug, Clone, Copy, Default)]
pub struct SearchStats {
    /// Candidates considered before paging.
    pub total_candidates: usize,
    /// Time spent inside the store.
    pub elapsed: Duration,
}

/// File and chunk counts for a scope prefix.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScopeStats {
    /// Indexed files under the prefix.
    pub files: usize,
    /// Indexed chunks under the prefix.
    pub chunks: usize,
}

/// Read-only store surface consumed by the research pipeline.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Semantic (dense vector) search.
    async fn search_semantic(
        &self,
        query: &SemanticQuery,
    ) -> Result<(Vec<Chunk>, SearchStats), StoreError>;

    /// Regex search over chunk content with pagination.
    async fn search_regex(
        &self,
        pattern: &str,
        page_size: usize,
        offset: usize,
        path_filter: Option<&str>,
    ) -> Result<(Vec<Chunk>, SearchStats), StoreError>;

    /// Chunks of a file whose line range intersects `[start_line, end_line]`.
    async fn get_chunks_in_range(
        &self,
        file_id: i64,
        start_line: u32,
        end_line: u32,
    ) -> Result<Vec<Chunk>, StoreError>;

    /// Looks up a file record by relative path.
    async fn get_file_by_path(&self, path: &str) -> Result<Option<FileRecord>, StoreError>;

    /// All chunks of a file.
    async fn get_chunks_by_file_id(&self, file_id: i64) -> Result<Vec<Chunk>, StoreError>;

    /// Relative paths of indexed files under a scope prefix (empty prefix =
    /// whole index), sorted.
    async fn get_scope_file_paths(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// File/chunk counts under a scope prefix.
    async fn get_scope_stats(&self, prefix: &str) -> Result<ScopeStats, StoreError>;

    /// Base directory relative paths resolve against.
    fn base_directory(&self) -> &Path;
}
