//! Import extraction and resolution.
//!
//! Retrieved chunks often reference modules whose definitions the searches
//! never surfaced. This module extracts import statements from chunk
//! content with line-based heuristics per language family, resolves them to
//! indexed files in scope, and attaches those files' chunks at a
//! conservative default score. The resolution cache lives per instance and
//! is never shared across research calls.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::config::ResearchConfig;
use crate::core::Chunk;
use crate::store::ChunkStore;

/// Resolves imports in retrieved chunks to indexed in-scope files.
pub struct ImportResolver {
    store: Arc<dyn ChunkStore>,
    config: ResearchConfig,
    // module token -> resolved paths; per research call
    cache: Mutex<HashMap<String, Vec<String>>>,
}

impl ImportResolver {
    /// Creates a resolver.
    #[must_use]
    pub fn new(store: Arc<dyn ChunkStore>, config: ResearchConfig) -> Self {
        Self {
            store,
            config,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolves imports across `chunks` and fetches the chunks of up to
    /// `import_resolution_max_files` referenced files, each annotated with
    /// `default_score`. Files already present in `chunks` are skipped.
    pub async fn resolve_and_fetch(
        &self,
        chunks: &[Chunk],
        path_filter: Option<&str>,
        default_score: f32,
    ) -> Vec<Chunk> {
        let known_files: HashSet<&str> = chunks.iter().map(|c| c.file_path.as_str()).collect();

        let mut modules: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for chunk in chunks {
            for import in extract_import_modules(&chunk.content) {
                if seen.insert(import.clone()) {
                    modules.push(import);
                }
            }
        }
        if modules.is_empty() {
            return Vec::new();
        }

        let scope_paths = match self
            .store
            .get_scope_file_paths(path_filter.unwrap_or(""))
            .await
        {
            Ok(paths) => paths,
            Err(e) => {
                debug!("import resolution skipped, scope listing failed: {e}");
                return Vec::new();
            }
        };

        let mut resolved_paths: Vec<String> = Vec::new();
        {
            let mut cache = self.cache.lock().await;
            for module in &modules {
                let paths = cache
                    .entry(module.clone())
                    .or_insert_with(|| resolve_module_to_paths(module, &scope_paths));
                for path in paths.iter() {
                    if !known_files.contains(path.as_str()) && !resolved_paths.contains(path) {
                        resolved_paths.push(path.clone());
                    }
                }
            }
        }
        resolved_paths.truncate(self.config.import_resolution_max_files);

        let mut import_chunks = Vec::new();
        for path in &resolved_paths {
            let Ok(Some(file)) = self.store.get_file_by_path(path).await else {
                continue;
            };
            if let Ok(chunks) = self.store.get_chunks_by_file_id(file.id).await {
                for mut chunk in chunks {
                    chunk.rerank_score = Some(default_score);
                    import_chunks.push(chunk);
                }
            }
        }

        debug!(
            "import resolution: {} modules → {} files → {} chunks",
            modules.len(),
            resolved_paths.len(),
            import_chunks.len()
        );
        import_chunks
    }

    /// Renders the `IMPORTS:` header block used in exploration prompts, or
    /// an empty string when the content has no imports.
    #[must_use]
    pub fn imports_header(content: &str) -> String {
        let lines = extract_import_lines(content);
        if lines.is_empty() {
            return String::new();
        }
        format!("IMPORTS:\n{}\n\n", lines.join("\n"))
    }
}

/// Extracts raw import statement lines from source text.
#[must_use]
pub fn extract_import_lines(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| {
            line.starts_with("use ")
                || line.starts_with("pub use ")
                || line.starts_with("mod ")
                || line.starts_with("pub mod ")
                || line.starts_with("import ")
                || line.starts_with("from ")
                || line.contains("require(")
        })
        .map(ToString::to_string)
        .collect()
}

/// Extracts candidate module tokens from import lines: the last path segment
/// of each imported module, lowercased.
#[must_use]
pub fn extract_import_modules(content: &str) -> Vec<String> {
    let mut modules = Vec::new();
    for line in extract_import_lines(content) {
        let token = if let Some(rest) = line
            .strip_prefix("pub use ")
            .or_else(|| line.strip_prefix("use "))
        {
            // `use crate::research::elbow::find_elbow;` → elbow (the module,
            // not the imported item when the path is deep enough)
            let path = rest.trim_end_matches(';');
            let segments: Vec<&str> = path.split("::").collect();
            match segments.len() {
                0 | 1 => segments.first().copied(),
                2 => segments.last().copied(),
                _ => segments.get(segments.len() - 2).copied(),
            }
        } else if let Some(rest) = line
            .strip_prefix("pub mod ")
            .or_else(|| line.strip_prefix("mod "))
        {
            Some(rest.trim_end_matches(';'))
        } else if let Some(rest) = line.strip_prefix("from ") {
            rest.split_whitespace().next().and_then(|m| m.split('.').next_back())
        } else if let Some(rest) = line.strip_prefix("import ") {
            rest.split_whitespace()
                .next()
                .map(|m| m.trim_end_matches(';'))
                .and_then(|m| m.split('.').next_back())
        } else if let Some(start) = line.find("require(") {
            line[start + 8..]
                .trim_start_matches(['"', '\''])
                .split(['"', '\''])
                .next()
                .and_then(|m| m.rsplit('/').next())
        } else {
            None
        };

        if let Some(token) = token {
            let cleaned: String = token
                .chars()
                .take_while(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
                .collect();
            if cleaned.len() > 1 {
                modules.push(cleaned.to_lowercase());
            }
        }
    }
    modules
}

/// Maps a module token to scope files whose stem matches it.
fn resolve_module_to_paths(module: &str, scope_paths: &[String]) -> Vec<String> {
    scope_paths
        .iter()
        .filter(|path| {
            let stem = std::path::Path::new(path)
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("");
            stem.eq_ignore_ascii_case(module)
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;
    use crate::store::SqliteChunkStore;

    #[test]
    fn test_extract_rust_imports() {
        let content = "use crate::research::elbow::find_elbow;\nfn main() {}\nmod retry;\n";
        let modules = extract_import_modules(content);
        assert!(modules.contains(&"elbow".to_string()));
        assert!(modules.contains(&"retry".to_string()));
    }

    #[test]
    fn test_extract_python_imports() {
        let content = "import os\nfrom pkg.retry import backoff\nx = 1\n";
        let modules = extract_import_modules(content);
        assert!(modules.contains(&"os".to_string()));
        assert!(modules.contains(&"retry".to_string()));
    }

    #[test]
    fn test_extract_js_require() {
        let content = "const retry = require('./lib/retry');\n";
        let modules = extract_import_modules(content);
        assert!(modules.contains(&"retry".to_string()));
    }

    #[test]
    fn test_extract_no_imports() {
        assert!(extract_import_modules("fn main() { let x = 1; }").is_empty());
    }

    #[test]
    fn test_imports_header_format() {
        let header = ImportResolver::imports_header("use foo::bar;\nfn x() {}");
        assert!(header.starts_with("IMPORTS:\n"));
        assert!(header.contains("use foo::bar;"));
        assert!(ImportResolver::imports_header("fn x() {}").is_empty());
    }

    #[test]
    fn test_resolve_module_to_paths() {
        let scope = vec![
            "src/retry.rs".to_string(),
            "src/other.rs".to_string(),
            "lib/retry.py".to_string(),
        ];
        let resolved = resolve_module_to_paths("retry", &scope);
        assert_eq!(resolved.len(), 2);
    }

    fn seeded_store() -> Arc<SqliteChunkStore> {
        let store = SqliteChunkStore::open_in_memory("/repo", Arc::new(HashEmbedder::default()))
            .unwrap_or_else(|_| unreachable!());
        let retry_id = store
            .insert_file("src/retry.rs", "h", 10)
            .unwrap_or_else(|_| unreachable!());
        store
            .insert_chunk(&Chunk::new(0, retry_id, "src/retry.rs", 1, 5, "fn retry() {}"))
            .unwrap_or_else(|_| unreachable!());
        let main_id = store
            .insert_file("src/main.rs", "h", 10)
            .unwrap_or_else(|_| unreachable!());
        store
            .insert_chunk(&Chunk::new(
                0,
                main_id,
                "src/main.rs",
                1,
                5,
                "mod retry;\nfn main() {}",
            ))
            .unwrap_or_else(|_| unreachable!());
        Arc::new(store)
    }

    #[tokio::test]
    async fn test_resolve_and_fetch_attaches_default_score() {
        let store = seeded_store();
        let resolver = ImportResolver::new(Arc::clone(&store) as Arc<dyn ChunkStore>, ResearchConfig::default());

        let mut source = Chunk::new(2, 2, "src/main.rs", 1, 5, "mod retry;\nfn main() {}");
        source.rerank_score = Some(0.9);

        let imported = resolver.resolve_and_fetch(&[source], None, 0.3).await;
        assert_eq!(imported.len(), 1);
        assert_eq!(imported[0].file_path, "src/retry.rs");
        assert_eq!(imported[0].rerank_score, Some(0.3));
    }

    #[tokio::test]
    async fn test_resolve_skips_already_known_files() {
        let store = seeded_store();
        let resolver = ImportResolver::new(Arc::clone(&store) as Arc<dyn ChunkStore>, ResearchConfig::default());

        // The chunk imports retry but retry.rs is already in the set
        let importer = Chunk::new(2, 2, "src/main.rs", 1, 5, "mod retry;");
        let known = Chunk::new(1, 1, "src/retry.rs", 1, 5, "fn retry() {}");

        let imported = resolver.resolve_and_fetch(&[importer, known], None, 0.3).await;
        assert!(imported.is_empty());
    }
}
