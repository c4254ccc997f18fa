//! File reading with natural boundary expansion.
//!
//! Synthesis wants full files when the budget allows and chunk excerpts
//! otherwise. Excerpts expand to natural code boundaries: chunks whose kind
//! already marks a complete definition get a few lines of padding, Python
//! chunks scan backward for `def`/`class` and forward to the dedent, and
//! brace-family chunks balance braces and walk back to the signature.
//! Expansion is capped and memoized on the chunk so downstream
//! deduplication can detect containment.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::core::Chunk;
use crate::error::ResearchError;
use crate::llm::LlmProvider;
use crate::store::ChunkStore;

/// Padding for chunks whose metadata already marks a complete definition.
const COMPLETE_DEFINITION_PADDING: u32 = 3;
/// How far backward/forward boundary scans look.
const BOUNDARY_SCAN_LINES: usize = 200;
/// Per-chunk token budget multiplier when deciding full-file vs excerpts.
const TOKEN_BUDGET_PER_FILE: usize = 4000;

/// Reads files for chunk sets, with budgets and boundary expansion.
pub struct FileReader {
    store: Arc<dyn ChunkStore>,
    llm: Arc<dyn LlmProvider>,
    /// Maximum lines a boundary expansion may span.
    max_expansion_lines: usize,
}

impl FileReader {
    /// Creates a reader.
    #[must_use]
    pub fn new(
        store: Arc<dyn ChunkStore>,
        llm: Arc<dyn LlmProvider>,
        max_expansion_lines: usize,
    ) -> Self {
        Self {
            store,
            llm,
            max_expansion_lines,
        }
    }

    fn resolve_path(&self, file_path: &str) -> PathBuf {
        let path = Path::new(file_path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.store.base_directory().join(path)
        }
    }

    /// Reads files containing `chunks` within an optional token budget.
    ///
    /// `None` reads everything (used after elbow filtering, which already
    /// bounded the input). Files too large for their per-chunk budget fall
    /// back to boundary-expanded excerpts joined with `\n\n...\n\n`; the
    /// expansion is memoized onto the chunks.
    ///
    /// # Errors
    ///
    /// Returns [`ResearchError::DataLoss`] when chunks were supplied but no
    /// file content could be read at all.
    pub async fn read_files_with_budget(
        &self,
        chunks: &mut [Chunk],
        max_tokens: Option<usize>,
    ) -> Result<BTreeMap<String, String>, ResearchError> {
        let mut files_to_chunks: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (i, chunk) in chunks.iter().enumerate() {
            if !chunk.file_path.is_empty() {
                files_to_chunks
                    .entry(chunk.file_path.clone())
                    .or_default()
                    .push(i);
            }
        }

        let mut file_contents: BTreeMap<String, String> = BTreeMap::new();
        let mut total_tokens = 0usize;

        'files: for (file_path, chunk_indices) in &files_to_chunks {
            if let Some(budget) = max_tokens
                && total_tokens >= budget
            {
                debug!("reached token limit ({budget}), stopping file reading");
                break;
            }

            let path = self.resolve_path(file_path);
            let content = match tokio::fs::read_to_string(&path).await {
                Ok(content) => content,
                Err(e) => {
                    warn!("failed to read file {file_path}: {e}");
                    continue;
                }
            };

            let estimated = self.llm.estimate_tokens(&content);
            let per_file_budget = TOKEN_BUDGET_PER_FILE * chunk_indices.len();

            if max_tokens.is_none() || estimated <= per_file_budget {
                // Full file, within the overall limit when one is set
                match max_tokens {
                    None => {
                        file_contents.insert(file_path.clone(), content);
                        total_tokens += estimated;
                    }
                    Some(budget) if total_tokens + estimated <= budget => {
                        file_contents.insert(file_path.clone(), content);
                        total_tokens += estimated;
                    }
                    Some(budget) => {
                        let remaining = budget - total_tokens;
                        if remaining > 500 {
                            let truncated: String = content.chars().take(remaining * 4).collect();
                            file_contents.insert(file_path.clone(), truncated);
                            total_tokens = budget;
                        }
                        break 'files;
                    }
                }
            } else {
                // File too large: boundary-expanded excerpts
                let lines: Vec<&str> = content.lines().collect();
                let mut excerpts: Vec<String> = Vec::new();
                for &idx in chunk_indices {
                    let chunk = &mut chunks[idx];
                    let (expanded_start, expanded_end) = expand_to_natural_boundaries(
                        &lines,
                        chunk,
                        self.max_expansion_lines,
                    );
                    if expanded_start == 0 && expanded_end == 0 {
                        warn!(
                            "skipping chunk with invalid boundaries: {file_path}:{}-{}",
                            chunk.start_line, chunk.end_line
                        );
                        continue;
                    }
                    chunk.expanded_start_line = Some(expanded_start);
                    chunk.expanded_end_line = Some(expanded_end);

                    let start_idx = expanded_start.saturating_sub(1) as usize;
                    let end_idx = (expanded_end as usize).min(lines.len());
                    excerpts.push(lines[start_idx..end_idx].join("\n"));
                }

                let combined = excerpts.join("\n\n...\n\n");
                let excerpt_tokens = self.llm.estimate_tokens(&combined);
                match max_tokens {
                    Some(budget) if total_tokens + excerpt_tokens > budget => {
                        let remaining = budget - total_tokens;
                        if remaining > 500 {
                            let truncated: String = combined.chars().take(remaining * 4).collect();
                            file_contents.insert(file_path.clone(), truncated);
                            total_tokens = budget;
                        }
                        break 'files;
                    }
                    _ => {
                        file_contents.insert(file_path.clone(), combined);
                        total_tokens += excerpt_tokens;
                    }
                }
            }
        }

        // Fail fast: chunks exist but nothing was readable. Silent loss here
        // would hand synthesis an empty context and produce a useless answer.
        if !chunks.is_empty() && file_contents.is_empty() {
            return Err(ResearchError::DataLoss {
                chunk_count: chunks.len(),
                file_count: files_to_chunks.len(),
                base_dir: self.store.base_directory().display().to_string(),
            });
        }

        debug!(
            "file reading complete: {} files, {total_tokens} tokens",
            file_contents.len()
        );
        Ok(file_contents)
    }
}

/// Expands a chunk's line range to natural code boundaries.
///
/// Returns the expanded 1-indexed inclusive range, or `(0, 0)` when the
/// input range is invalid for the file.
#[must_use]
pub fn expand_to_natural_boundaries(
    lines: &[&str],
    chunk: &Chunk,
    max_expansion_lines: usize,
) -> (u32, u32) {
    let start_line = chunk.start_line as usize;
    let end_line = chunk.end_line as usize;

    if start_line < 1
        || end_line < 1
        || start_line > end_line
        || start_line > lines.len()
        || end_line > lines.len()
    {
        return (0, 0);
    }

    // A chunk the parser marked as a complete definition only needs a little
    // padding for decorators and doc comments.
    if chunk.kind.is_some_and(crate::core::ChunkKind::is_complete_definition) {
        let padded_start = chunk.start_line.saturating_sub(COMPLETE_DEFINITION_PADDING).max(1);
        let padded_end = (chunk.end_line + COMPLETE_DEFINITION_PADDING).min(lines.len() as u32);
        return (padded_start, padded_end);
    }

    let lower_path = chunk.file_path.to_lowercase();
    let is_python = lower_path.ends_with(".py") || lower_path.ends_with(".pyw");
    let is_brace_lang = [
        ".c", ".cpp", ".cc", ".cxx", ".h", ".hpp", ".rs", ".go", ".java", ".js", ".ts", ".tsx",
        ".jsx", ".cs", ".swift", ".kt", ".scala",
    ]
    .iter()
    .any(|ext| lower_path.ends_with(ext));

    let start_idx = start_line - 1;
    let end_idx = end_line - 1;

    let mut expanded_start = start_idx;
    let mut expanded_end = end_idx;

    if is_python {
        // Backward: nearest def/class at or above the chunk
        let scan_floor = start_idx.saturating_sub(BOUNDARY_SCAN_LINES);
        for i in (scan_floor..start_idx).rev() {
            let trimmed = lines[i].trim_start();
            if trimmed.starts_with("def ")
                || trimmed.starts_with("class ")
                || trimmed.starts_with("async def ")
            {
                expanded_start = i;
                break;
            }
            // Module boundary: blank line followed by a top-level statement
            if lines[i].trim().is_empty()
                && lines
                    .get(i + 1)
                    .is_some_and(|next| !next.is_empty() && !next.starts_with([' ', '\t']))
            {
                break;
            }
        }

        // Forward: dedent back to the definition's indentation ends the block
        let start_indent = indent_of(lines[expanded_start]);
        let scan_ceil = (end_idx + 1 + BOUNDARY_SCAN_LINES).min(lines.len());
        let mut found_end = false;
        for (i, line) in lines.iter().enumerate().take(scan_ceil).skip(end_idx + 1) {
            if !line.trim().is_empty() && indent_of(line) <= start_indent {
                expanded_end = i - 1;
                found_end = true;
                break;
            }
        }
        if !found_end {
            expanded_end = (end_idx + 50).min(lines.len() - 1);
        }
    } else if is_brace_lang {
        // Backward: find the opening brace of the enclosing block, then walk
        // back to the signature line
        let mut brace_depth: i32 = 0;
        let scan_floor = start_idx.saturating_sub(BOUNDARY_SCAN_LINES);
        'backward: for i in (scan_floor..=start_idx).rev() {
            let line = lines[i];
            let opens = line.matches('{').count() as i32;
            let closes = line.matches('}').count() as i32;
            brace_depth += closes - opens;

            if brace_depth < 0 {
                for j in (i.saturating_sub(10)..=i).rev() {
                    let sig = lines[j].trim();
                    if sig.contains('(') && (sig.contains(')') || j < i) {
                        expanded_start = j;
                        break 'backward;
                    }
                }
                expanded_start = i;
                break;
            }
        }

        // Forward: matching closing brace
        let mut depth: i32 = 0;
        let scan_ceil = (end_idx + 1 + BOUNDARY_SCAN_LINES).min(lines.len());
        for (i, line) in lines.iter().enumerate().take(scan_ceil).skip(expanded_start) {
            depth += line.matches('{').count() as i32;
            depth -= line.matches('}').count() as i32;
            if depth == 0 && i > expanded_start && line.contains('}') {
                expanded_end = i;
                break;
            }
        }
    }

    // Cap runaway expansions
    if expanded_end - expanded_start > max_expansion_lines {
        debug!(
            "boundary expansion too large ({} lines), limiting to {max_expansion_lines}",
            expanded_end - expanded_start
        );
        expanded_end = expanded_start + max_expansion_lines;
    }

    #[allow(clippy::cast_possible_truncation)]
    ((expanded_start + 1) as u32, (expanded_end + 1) as u32)
}

fn indent_of(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ChunkKind;
    use crate::embedding::HashEmbedder;
    use crate::llm::{Completion, CompletionRequest, LlmProvider, StructuredRequest};
    use crate::store::SqliteChunkStore;
    use async_trait::async_trait;
    use crate::error::LlmError;

    struct TokenCounter;

    #[async_trait]
    impl LlmProvider for TokenCounter {
        fn name(&self) -> &'static str {
            "counter"
        }
        fn model(&self) -> &str {
            "none"
        }
        async fn complete(&self, _r: &CompletionRequest) -> Result<Completion, LlmError> {
            Ok(Completion::default())
        }
        async fn complete_structured(
            &self,
            _r: &StructuredRequest,
        ) -> Result<serde_json::Value, LlmError> {
            Ok(serde_json::Value::Null)
        }
    }

    fn chunk_in(path: &str, start: u32, end: u32) -> Chunk {
        Chunk::new(1, 1, path, start, end, "body")
    }

    #[test]
    fn test_invalid_range_rejected() {
        let lines = vec!["a", "b", "c"];
        let chunk = chunk_in("src/x.py", 5, 9);
        assert_eq!(expand_to_natural_boundaries(&lines, &chunk, 300), (0, 0));

        let inverted = chunk_in("src/x.py", 3, 1);
        assert_eq!(expand_to_natural_boundaries(&lines, &inverted, 300), (0, 0));
    }

    #[test]
    fn test_complete_definition_gets_padding() {
        let lines: Vec<&str> = (0..30).map(|_| "line").collect();
        let mut chunk = chunk_in("src/x.rs", 10, 15);
        chunk.kind = Some(ChunkKind::Function);
        assert_eq!(expand_to_natural_boundaries(&lines, &chunk, 300), (7, 18));
    }

    #[test]
    fn test_complete_definition_padding_clamps_at_file_edges() {
        let lines: Vec<&str> = (0..10).map(|_| "line").collect();
        let mut chunk = chunk_in("src/x.rs", 1, 10);
        chunk.kind = Some(ChunkKind::Struct);
        assert_eq!(expand_to_natural_boundaries(&lines, &chunk, 300), (1, 10));
    }

    #[test]
    fn test_python_expansion_finds_def_and_dedent() {
        let lines = vec![
            "import os",            // 1
            "",                     // 2
            "def handler(event):",  // 3
            "    a = 1",            // 4
            "    b = 2",            // 5
            "    return a + b",     // 6
            "",                     // 7
            "def other():",         // 8
            "    pass",             // 9
        ];
        // Chunk covers only the middle of handler
        let chunk = chunk_in("src/app.py", 4, 5);
        let (start, end) = expand_to_natural_boundaries(&lines, &chunk, 300);
        assert_eq!(start, 3);
        // Expansion stops before `def other()` dedents back to column 0
        assert!(end >= 6 && end < 8, "end was {end}");
    }

    #[test]
    fn test_brace_expansion_balances_braces() {
        let lines = vec![
            "fn outer() {",      // 1
            "    let x = 1;",    // 2
            "    let y = 2;",    // 3
            "    x + y",         // 4
            "}",                 // 5
            "",                  // 6
            "fn next() {}",      // 7
        ];
        let chunk = chunk_in("src/lib.rs", 3, 3);
        let (start, end) = expand_to_natural_boundaries(&lines, &chunk, 300);
        assert_eq!(start, 1);
        assert_eq!(end, 5);
    }

    #[test]
    fn test_expansion_capped() {
        let lines: Vec<&str> = (0..1000).map(|_| "    x = 1").collect();
        let chunk = chunk_in("src/big.py", 500, 510);
        let (start, end) = expand_to_natural_boundaries(&lines, &chunk, 100);
        assert!((end - start) as usize <= 100);
    }

    async fn reader_with_files() -> (FileReader, tempfile::TempDir, Vec<Chunk>) {
        let dir = tempfile::tempdir().unwrap_or_else(|_| unreachable!());
        let file_path = dir.path().join("main.py");
        let content = "def main():\n    run()\n    return 0\n";
        tokio::fs::write(&file_path, content)
            .await
            .unwrap_or_else(|_| unreachable!());

        let store = SqliteChunkStore::open_in_memory(
            dir.path().to_path_buf(),
            Arc::new(HashEmbedder::default()),
        )
        .unwrap_or_else(|_| unreachable!());
        let reader = FileReader::new(Arc::new(store), Arc::new(TokenCounter), 300);
        let chunks = vec![Chunk::new(1, 1, "main.py", 1, 3, content)];
        (reader, dir, chunks)
    }

    #[tokio::test]
    async fn test_read_files_unlimited() {
        let (reader, _dir, mut chunks) = reader_with_files().await;
        let files = reader
            .read_files_with_budget(&mut chunks, None)
            .await
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(files.len(), 1);
        assert!(files["main.py"].contains("def main()"));
    }

    #[tokio::test]
    async fn test_read_files_data_loss_detected() {
        let (reader, _dir, _) = reader_with_files().await;
        // Chunks referencing a file that does not exist on disk
        let mut chunks = vec![Chunk::new(9, 9, "ghost.py", 1, 3, "x")];
        let result = reader.read_files_with_budget(&mut chunks, None).await;
        assert!(matches!(result, Err(ResearchError::DataLoss { .. })));
    }

    #[tokio::test]
    async fn test_read_files_empty_chunks_ok() {
        let (reader, _dir, _) = reader_with_files().await;
        let files = reader
            .read_files_with_budget(&mut [], None)
            .await
            .unwrap_or_else(|_| unreachable!());
        assert!(files.is_empty());
    }
}
