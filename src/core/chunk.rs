//! Core chunk and file record types.
//!
//! A [`Chunk`] is a contiguous, indexed fragment of source with a stable id,
//! file path, 1-indexed inclusive line range, and parser metadata. Retrieval
//! phases annotate chunks with scores; those annotations travel with the
//! chunk through deduplication, elbow filtering, and synthesis.

use serde::{Deserialize, Serialize};

/// Structural kind of an indexed chunk, as reported by the indexer's parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChunkKind {
    /// Free function.
    Function,
    /// Method on a type.
    Method,
    /// Class definition.
    Class,
    /// Interface or trait definition.
    Interface,
    /// Struct definition.
    Struct,
    /// Enum definition.
    Enum,
    /// Import / use declaration.
    Import,
    /// Generic code block.
    Block,
    /// Key-value pair (config formats).
    KeyValue,
    /// Array literal (config formats).
    Array,
    /// Comment block.
    Comment,
    /// Anything the parser could not classify.
    Unknown,
}

impl ChunkKind {
    /// Whether this kind represents a complete, self-contained definition
    /// (used by natural boundary expansion to skip re-scanning).
    #[must_use]
    pub const fn is_complete_definition(self) -> bool {
        matches!(
            self,
            Self::Function
                | Self::Method
                | Self::Class
                | Self::Interface
                | Self::Struct
                | Self::Enum
        )
    }
}

/// A named language constant captured by the indexer from chunk content.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConstantMeta {
    /// Constant name.
    pub name: String,
    /// Literal value when the parser could capture one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Declared or inferred type.
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "type")]
    pub type_name: Option<String>,
}

/// Parser metadata attached to a chunk at indexing time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// Secondary symbol name (used when `symbol` is absent and the chunk
    /// kind is specific enough to matter).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Parameter names for function-like chunks.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<String>,
    /// Language constants declared in this chunk.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constants: Vec<ConstantMeta>,
}

/// A contiguous, indexed fragment of source code.
///
/// Invariants: `start_line <= end_line` (1-indexed, inclusive), `file_path`
/// is stable for the chunk's lifetime, and `id` is unique within the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Stable identifier, unique within the store.
    pub id: i64,
    /// Id of the owning file record.
    pub file_id: i64,
    /// Path relative to the store's base directory, forward-slash separated.
    pub file_path: String,
    /// First line of the chunk (1-indexed).
    pub start_line: u32,
    /// Last line of the chunk (1-indexed, inclusive).
    pub end_line: u32,
    /// Chunk text.
    pub content: String,
    /// Primary symbol name (function/class/method name) when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    /// Structural kind when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ChunkKind>,
    /// Parser metadata.
    #[serde(default)]
    pub metadata: ChunkMetadata,

    // Retrieval annotations. These are not stored; they are attached by the
    // research pipeline as the chunk moves through search and filtering.
    /// Semantic similarity score from vector search.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
    /// Rerank score against the root query (or a compound of queries).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rerank_score: Option<f32>,
    /// Start of the natural-boundary-expanded range, once computed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expanded_start_line: Option<u32>,
    /// End of the natural-boundary-expanded range, once computed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expanded_end_line: Option<u32>,
    /// Idempotence flag for window expansion.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub window_expanded: bool,
}

impl Chunk {
    /// Creates a chunk with the required identity fields and no annotations.
    #[must_use]
    pub fn new(
        id: i64,
        file_id: i64,
        file_path: impl Into<String>,
        start_line: u32,
        end_line: u32,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id,
            file_id,
            file_path: file_path.into(),
            start_line,
            end_line,
            content: content.into(),
            symbol: None,
            kind: None,
            metadata: ChunkMetadata::default(),
            score: None,
            rerank_score: None,
            expanded_start_line: None,
            expanded_end_line: None,
            window_expanded: false,
        }
    }

    /// Unified score for cross-strategy comparisons.
    ///
    /// Prefers `rerank_score` (wide-coverage phases) over `score` (plain
    /// semantic search), defaulting to 0.0 when neither is set.
    #[must_use]
    pub fn unified_score(&self) -> f32 {
        self.rerank_score.or(self.score).unwrap_or(0.0)
    }

    /// Expanded line range when boundary expansion has run, otherwise the
    /// original range.
    #[must_use]
    pub fn expanded_range(&self) -> (u32, u32) {
        (
            self.expanded_start_line.unwrap_or(self.start_line),
            self.expanded_end_line.unwrap_or(self.end_line),
        )
    }

    /// Text used for embedding and rerank documents: the symbol header (when
    /// present) followed by the chunk content.
    #[must_use]
    pub fn document_text(&self) -> String {
        match &self.symbol {
            Some(symbol) => format!("{}\n{}", symbol, self.content),
            None => self.content.clone(),
        }
    }
}

/// Indexed file record.
///
/// Paths are stored relative to the store's base directory with
/// forward-slash separators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Stable identifier.
    pub id: i64,
    /// Relative path, forward-slash separated.
    pub path: String,
    /// Content hash at indexing time.
    pub content_hash: String,
    /// Byte length at indexing time.
    pub size_bytes: u64,
    /// Creation timestamp (RFC 3339).
    pub created_at: String,
    /// Modification timestamp (RFC 3339).
    pub modified_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk() -> Chunk {
        Chunk::new(1, 1, "src/lib.rs", 10, 20, "fn main() {}")
    }

    #[test]
    fn test_unified_score_prefers_rerank() {
        let mut c = chunk();
        c.score = Some(0.4);
        c.rerank_score = Some(0.9);
        assert!((c.unified_score() - 0.9).abs() < f32::EPSILON);
    }

    #[test]
    fn test_unified_score_falls_back_to_semantic() {
        let mut c = chunk();
        c.score = Some(0.4);
        assert!((c.unified_score() - 0.4).abs() < f32::EPSILON);
    }

    #[test]
    fn test_unified_score_default_zero() {
        assert!(chunk().unified_score().abs() < f32::EPSILON);
    }

    #[test]
    fn test_expanded_range_falls_back_to_original() {
        let c = chunk();
        assert_eq!(c.expanded_range(), (10, 20));

        let mut c = chunk();
        c.expanded_start_line = Some(5);
        c.expanded_end_line = Some(30);
        assert_eq!(c.expanded_range(), (5, 30));
    }

    #[test]
    fn test_document_text_includes_symbol() {
        let mut c = chunk();
        c.symbol = Some("main".to_string());
        assert!(c.document_text().starts_with("main\n"));
    }

    #[test]
    fn test_complete_definition_kinds() {
        assert!(ChunkKind::Function.is_complete_definition());
        assert!(ChunkKind::Struct.is_complete_definition());
        assert!(!ChunkKind::Block.is_complete_definition());
        assert!(!ChunkKind::Comment.is_complete_definition());
        assert!(!ChunkKind::Import.is_complete_definition());
    }

    #[test]
    fn test_chunk_serde_round_trip() {
        let mut c = chunk();
        c.kind = Some(ChunkKind::Function);
        c.rerank_score = Some(0.7);
        c.metadata.constants.push(ConstantMeta {
            name: "MAX_RETRIES".to_string(),
            value: Some("3".to_string()),
            type_name: Some("u32".to_string()),
        });
        let json = serde_json::to_string(&c).unwrap_or_else(|_| unreachable!());
        let back: Chunk = serde_json::from_str(&json).unwrap_or_else(|_| unreachable!());
        assert_eq!(c, back);
    }

    #[test]
    fn test_window_expanded_flag_omitted_when_false() {
        let json = serde_json::to_string(&chunk()).unwrap_or_else(|_| unreachable!());
        assert!(!json.contains("window_expanded"));
    }
}
