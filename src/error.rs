//! Error types for quarry operations.
//!
//! This module provides a comprehensive error hierarchy using `thiserror` for
//! all quarry operations including the chunk store, embedding and LLM
//! providers, the research pipeline, and the code mapper.

use thiserror::Error;

/// Result type alias for quarry operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Comprehensive error types for quarry operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Chunk store errors (database operations).
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Embedding provider errors.
    #[error("embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    /// LLM provider errors.
    #[error("llm error: {0}")]
    Llm(#[from] LlmError),

    /// Research pipeline errors.
    #[error("research error: {0}")]
    Research(#[from] ResearchError),

    /// Code mapper errors.
    #[error("mapper error: {0}")]
    Mapper(#[from] MapperError),

    /// Configuration errors.
    #[error("configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },
}

/// Chunk-store-specific errors for database operations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Database connection or query error.
    #[error("database error: {0}")]
    Database(String),

    /// File record not found by path.
    #[error("file not found: {path}")]
    FileNotFound {
        /// Relative path that was not found.
        path: String,
    },

    /// Invalid regex pattern supplied to a scan.
    #[error("invalid pattern: {0}")]
    InvalidPattern(String),

    /// Serialization/deserialization error for stored metadata.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Embedding provider errors.
#[derive(Error, Debug)]
pub enum EmbeddingError {
    /// Batch embedding request failed.
    #[error("embed batch failed: {0}")]
    Embed(String),

    /// Rerank request failed.
    #[error("rerank failed: {0}")]
    Rerank(String),

    /// Provider does not support reranking but the pipeline requires it.
    #[error("provider '{provider}' does not support reranking")]
    RerankUnsupported {
        /// Provider name.
        provider: String,
    },
}

/// Classified LLM failure kinds.
///
/// The kind drives the retry policy: transient transport conditions are
/// retried, validation and configuration problems are not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmErrorKind {
    /// Request exceeded its deadline.
    Timeout,
    /// Provider rate limit (HTTP 429 or equivalent).
    RateLimit,
    /// Connection-level failure.
    Network,
    /// Provider returned an empty completion.
    EmptyContent,
    /// Completion was cut off before finishing.
    Truncated,
    /// Provider content filter suppressed the completion.
    ContentFilter,
    /// Other transport-layer failure.
    Transport,
    /// Non-retryable API error (auth, bad request).
    Api,
    /// Structured output failed schema validation or JSON parsing.
    InvalidResponse,
    /// Provider is not configured.
    MissingConfig,
}

/// Case-insensitive substrings that mark an error message as retryable
/// even when the kind classification missed it.
const RETRYABLE_MESSAGE_SUBSTRINGS: &[&str] = &[
    "llm completion failed",
    "llm structured completion failed",
    "llm returned empty response",
    "llm response truncated",
    "token limit",
    "rate limit",
    "429",
    "timeout",
    "timed out",
    "overloaded",
    "content filter",
    "responses api",
];

/// Whether an arbitrary error message matches a known transient pattern
/// (case-insensitive). Used by the PoI orchestrator, which sees errors that
/// already lost their kind classification.
#[must_use]
pub fn is_retryable_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    RETRYABLE_MESSAGE_SUBSTRINGS
        .iter()
        .any(|token| lower.contains(token))
}

/// LLM provider errors.
#[derive(Error, Debug)]
#[error("{message}")]
pub struct LlmError {
    /// Classified failure kind.
    pub kind: LlmErrorKind,
    /// Human-readable message from the provider or transport.
    pub message: String,
}

impl LlmError {
    /// Creates an error with the given kind and message.
    pub fn new(kind: LlmErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Creates a [`LlmErrorKind::Timeout`] error.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::Timeout, message)
    }

    /// Creates a [`LlmErrorKind::EmptyContent`] error.
    pub fn empty(message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::EmptyContent, message)
    }

    /// Creates a [`LlmErrorKind::InvalidResponse`] error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::InvalidResponse, message)
    }

    /// Creates a [`LlmErrorKind::Api`] error, upgrading the kind when the
    /// message matches a known transient pattern.
    pub fn api(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        let kind = if lower.contains("rate limit") || lower.contains("429") {
            LlmErrorKind::RateLimit
        } else if lower.contains("timeout") || lower.contains("timed out") {
            LlmErrorKind::Timeout
        } else if lower.contains("connection") || lower.contains("network") {
            LlmErrorKind::Network
        } else {
            LlmErrorKind::Api
        };
        Self::new(kind, message)
    }

    /// Whether the retry policy should attempt this request again.
    ///
    /// Retryable kinds cover transient transport conditions; on top of that
    /// a case-insensitive substring screen catches providers that surface
    /// transient failures as generic API errors.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self.kind {
            LlmErrorKind::Timeout
            | LlmErrorKind::RateLimit
            | LlmErrorKind::Network
            | LlmErrorKind::EmptyContent
            | LlmErrorKind::Truncated
            | LlmErrorKind::ContentFilter
            | LlmErrorKind::Transport => true,
            LlmErrorKind::Api | LlmErrorKind::InvalidResponse | LlmErrorKind::MissingConfig => {
                let lower = self.message.to_lowercase();
                RETRYABLE_MESSAGE_SUBSTRINGS
                    .iter()
                    .any(|token| lower.contains(token))
            }
        }
    }
}

/// Research-pipeline-specific errors.
#[derive(Error, Debug)]
pub enum ResearchError {
    /// Chunks were retrieved but no file content could be read for synthesis.
    #[error(
        "data loss detected: found {chunk_count} chunks across {file_count} files \
         but failed to read any file contents (base directory: {base_dir})"
    )]
    DataLoss {
        /// Number of chunks that were retrieved.
        chunk_count: usize,
        /// Number of distinct files the chunks reference.
        file_count: usize,
        /// Base directory file reads were resolved against.
        base_dir: String,
    },

    /// Synthesis produced an answer below the minimum length.
    #[error(
        "synthesis produced only {length} characters (minimum: {minimum}), \
         finish_reason={finish_reason:?}"
    )]
    ShortAnswer {
        /// Length of the trimmed answer in characters.
        length: usize,
        /// Minimum acceptable length.
        minimum: usize,
        /// Finish reason reported by the provider.
        finish_reason: Option<String>,
    },

    /// Both strategies of a parallel exploration failed.
    #[error("both exploration strategies failed; bfs: {bfs}; wide: {wide}")]
    BothStrategiesFailed {
        /// Error from the BFS strategy.
        bfs: String,
        /// Error from the wide-coverage strategy.
        wide: String,
    },

    /// The selected strategy requires reranking support.
    #[error("exploration strategy '{strategy}' requires an embedding provider with reranking")]
    RerankRequired {
        /// Strategy name.
        strategy: String,
    },

    /// Clustering received invalid input.
    #[error("clustering error: {0}")]
    Clustering(String),
}

/// Code-mapper-specific errors.
#[derive(Error, Debug)]
pub enum MapperError {
    /// HyDE planning failed outright (distinct from an empty PoI list).
    #[error("hyde planning failed: {0}")]
    HydePlanning(String),

    /// The overview pass produced no points of interest.
    #[error("overview produced no points of interest")]
    NoPointsOfInterest,

    /// Invalid PoI concurrency configuration.
    #[error("invalid poi concurrency: {0}")]
    InvalidConcurrency(String),

    /// Output document write failed.
    #[error("failed to write {path}: {reason}")]
    WriteFailed {
        /// Output path.
        path: String,
        /// Reason for failure.
        reason: String,
    },
}

// Implement From traits for standard library and dependency errors

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Store(StoreError::Database(err.to_string()))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::Store(StoreError::Database(err.to_string()))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<regex::Error> for StoreError {
    fn from(err: regex::Error) -> Self {
        Self::InvalidPattern(err.to_string())
    }
}

impl From<serde_json::Error> for LlmError {
    fn from(err: serde_json::Error) -> Self {
        Self::invalid(format!("json parse failed: {err}"))
    }
}
