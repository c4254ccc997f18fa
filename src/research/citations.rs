//! Numbered file citations.
//!
//! Synthesis prompts carry a reference table mapping each file to a small
//! integer; answers cite sources as `[N]` tokens. Everything here keeps the
//! reference map, the citations, and the sources footer mutually consistent:
//! the map is built only over files that appear in both the chunk set and
//! the file set, and chunks are filtered to the same set before any prompt
//! is assembled.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::core::Chunk;

static CITATION_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[(\d+)\]").unwrap_or_else(|_| unreachable!()));

/// Discovery-ordered mapping from file path to citation number.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceMap {
    order: Vec<String>,
    index: HashMap<String, usize>,
}

impl ReferenceMap {
    /// Citation number for a path, when assigned.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<usize> {
        self.index.get(path).copied()
    }

    /// Path for a citation number.
    #[must_use]
    pub fn path_for(&self, number: usize) -> Option<&str> {
        number
            .checked_sub(1)
            .and_then(|i| self.order.get(i))
            .map(String::as_str)
    }

    /// Number of referenced files.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether the map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Paths in citation order.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    fn insert(&mut self, path: &str) {
        if !self.index.contains_key(path) {
            self.order.push(path.to_string());
            self.index.insert(path.to_string(), self.order.len());
        }
    }
}

/// Citation manager: builds reference maps and renders/validates citations.
#[derive(Debug, Clone, Copy, Default)]
pub struct CitationManager;

impl CitationManager {
    /// Builds a reference map over files that appear in both the chunk set
    /// and the files mapping, numbering them in discovery order (chunk order
    /// first, then any remaining files).
    #[must_use]
    pub fn build_reference_map(
        chunks: &[Chunk],
        files: &BTreeMap<String, String>,
    ) -> ReferenceMap {
        let mut map = ReferenceMap::default();
        for chunk in chunks {
            if files.contains_key(&chunk.file_path) {
                map.insert(&chunk.file_path);
            }
        }
        for path in files.keys() {
            map.insert(path);
        }
        map
    }

    /// Renders a compact, prompt-ready reference table.
    #[must_use]
    pub fn format_reference_table(map: &ReferenceMap) -> String {
        if map.is_empty() {
            return String::new();
        }
        let mut table = String::from("Source References:\n");
        for (i, path) in map.paths().enumerate() {
            let _ = writeln!(table, "[{}] {path}", i + 1);
        }
        table
    }

    /// Retains chunks whose file appears in the files mapping.
    ///
    /// Run before building the reference map so the map, the citations, and
    /// the sources footer all describe the same file set.
    #[must_use]
    pub fn filter_chunks_to_files(chunks: &[Chunk], files: &BTreeMap<String, String>) -> Vec<Chunk> {
        chunks
            .iter()
            .filter(|c| files.contains_key(&c.file_path))
            .cloned()
            .collect()
    }

    /// Rewrites `[N]` tokens from a cluster's local numbering to the global
    /// reference map. Tokens with no local assignment are left untouched.
    #[must_use]
    pub fn remap_cluster_citations(
        text: &str,
        local_map: &ReferenceMap,
        global_map: &ReferenceMap,
    ) -> String {
        CITATION_PATTERN
            .replace_all(text, |caps: &regex::Captures<'_>| {
                let original = caps[0].to_string();
                caps[1]
                    .parse::<usize>()
                    .ok()
                    .and_then(|local| local_map.path_for(local))
                    .and_then(|path| global_map.get(path))
                    .map_or(original, |global| format!("[{global}]"))
            })
            .into_owned()
    }

    /// Returns `[N]` tokens in the text that are absent from the map.
    ///
    /// Callers warn on the result; unknown citations never fail the call.
    #[must_use]
    pub fn validate_citation_references(text: &str, map: &ReferenceMap) -> Vec<String> {
        let mut unknown = Vec::new();
        for caps in CITATION_PATTERN.captures_iter(text) {
            if let Ok(number) = caps[1].parse::<usize>()
                && map.path_for(number).is_none()
                && !unknown.contains(&caps[0].to_string())
            {
                unknown.push(caps[0].to_string());
            }
        }
        if !unknown.is_empty() {
            debug!("found {} unknown citation references", unknown.len());
        }
        unknown
    }

    /// Builds the deterministic `## Sources` footer listing each referenced
    /// file with its chunk line ranges. Appended after synthesis, outside
    /// the LLM output token budget.
    #[must_use]
    pub fn build_sources_footer(
        chunks: &[Chunk],
        files: &BTreeMap<String, String>,
        map: &ReferenceMap,
    ) -> String {
        if map.is_empty() {
            return String::new();
        }

        let mut ranges_by_file: HashMap<&str, Vec<(u32, u32)>> = HashMap::new();
        for chunk in chunks {
            if files.contains_key(&chunk.file_path) {
                ranges_by_file
                    .entry(chunk.file_path.as_str())
                    .or_default()
                    .push((chunk.start_line, chunk.end_line));
            }
        }

        let mut footer = String::from("## Sources\n");
        for (i, path) in map.paths().enumerate() {
            let mut line = format!("[{}] {path}", i + 1);
            if let Some(ranges) = ranges_by_file.get_mut(path) {
                ranges.sort_unstable();
                ranges.dedup();
                let rendered: Vec<String> = ranges
                    .iter()
                    .map(|(start, end)| format!("{start}-{end}"))
                    .collect();
                let _ = write!(line, ":{}", rendered.join(", "));
            }
            footer.push_str(&line);
            footer.push('\n');
        }
        footer
    }
}
