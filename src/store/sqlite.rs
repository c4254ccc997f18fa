//! `SQLite` chunk store adapter.
//!
//! A read-mostly adapter over the index database the realtime indexer
//! maintains. Semantic search embeds the query through the configured
//! embedding provider and ranks chunks by cosine similarity against stored
//! (or lazily computed and cached) chunk embeddings. The embedding cache is
//! per store instance and never shared across research calls.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;

use super::{ChunkStore, ScopeStats, SearchStats, SemanticQuery};
use crate::core::{Chunk, ChunkKind, ChunkMetadata, FileRecord};
use crate::embedding::{EmbeddingProvider, cosine_similarity};
use crate::error::StoreError;

/// `SQLite`-backed chunk store.
pub struct SqliteChunkStore {
    conn: Mutex<Connection>,
    embedder: Arc<dyn EmbeddingProvider>,
    base_dir: PathBuf,
    // chunk_id -> embedding, computed on demand; per-instance by design
    embedding_cache: Mutex<HashMap<i64, Vec<f32>>>,
}

impl SqliteChunkStore {
    /// Opens an existing index database.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] when the database cannot be opened.
    pub fn open(
        db_path: &Path,
        base_dir: impl Into<PathBuf>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self, StoreError> {
        let conn = Connection::open(db_path)?;
        Ok(Self::with_connection(conn, base_dir, embedder))
    }

    /// Opens an in-memory database (used by tests and the seeding CLI).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] when the database cannot be created.
    pub fn open_in_memory(
        base_dir: impl Into<PathBuf>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self::with_connection(conn, base_dir, embedder);
        store.ensure_schema()?;
        Ok(store)
    }

    fn with_connection(
        conn: Connection,
        base_dir: impl Into<PathBuf>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        Self {
            conn: Mutex::new(conn),
            embedder,
            base_dir: base_dir.into(),
            embedding_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Creates the index schema when missing.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on DDL failure.
    pub fn ensure_schema(&self) -> Result<(), StoreError> {
        let conn = self.lock_conn()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS files (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                path TEXT NOT NULL UNIQUE,
                content_hash TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                created_at TEXT NOT NULL DEFAULT '',
                modified_at TEXT NOT NULL DEFAULT ''
            );
            CREATE TABLE IF NOT EXISTS chunks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                file_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
                start_line INTEGER NOT NULL,
                end_line INTEGER NOT NULL,
                content TEXT NOT NULL,
                symbol TEXT,
                kind TEXT,
                metadata TEXT,
                embedding BLOB
            );
            CREATE INDEX IF NOT EXISTS idx_chunks_file_id ON chunks(file_id);",
        )?;
        Ok(())
    }

    /// Inserts a file record (indexer-side seeding surface).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on insert failure.
    pub fn insert_file(
        &self,
        path: &str,
        content_hash: &str,
        size_bytes: u64,
    ) -> Result<i64, StoreError> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO files (path, content_hash, size_bytes) VALUES (?1, ?2, ?3)",
            params![path, content_hash, i64::try_from(size_bytes).unwrap_or(i64::MAX)],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Inserts a chunk (indexer-side seeding surface).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on insert or metadata serialization failure.
    pub fn insert_chunk(&self, chunk: &Chunk) -> Result<i64, StoreError> {
        let metadata = serde_json::to_string(&chunk.metadata)?;
        let kind = chunk
            .kind
            .map(|k| serde_json::to_string(&k))
            .transpose()?
            .map(|s| s.trim_matches('"').to_string());
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO chunks (file_id, start_line, end_line, content, symbol, kind, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                chunk.file_id,
                chunk.start_line,
                chunk.end_line,
                chunk.content,
                chunk.symbol,
                kind,
                metadata,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|e| StoreError::Database(format!("connection lock poisoned: {e}")))
    }

    fn row_to_chunk(row: &rusqlite::Row<'_>) -> rusqlite::Result<(Chunk, Option<Vec<f32>>)> {
        let metadata_json: Option<String> = row.get("metadata")?;
        let metadata = metadata_json
            .as_deref()
            .and_then(|json| serde_json::from_str::<ChunkMetadata>(json).ok())
            .unwrap_or_default();
        let kind_text: Option<String> = row.get("kind")?;
        let kind = kind_text
            .as_deref()
            .and_then(|k| serde_json::from_str::<ChunkKind>(&format!("\"{k}\"")).ok());
        let embedding_blob: Option<Vec<u8>> = row.get("embedding")?;
        let embedding = embedding_blob.map(|blob| {
            blob.chunks_exact(4)
                .map(|bytes| f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
                .collect()
        });

        let mut chunk = Chunk::new(
            row.get("id")?,
            row.get("file_id")?,
            row.get::<_, String>("file_path")?,
            row.get("start_line")?,
            row.get("end_line")?,
            row.get::<_, String>("content")?,
        );
        chunk.symbol = row.get("symbol")?;
        chunk.kind = kind;
        chunk.metadata = metadata;
        Ok((chunk, embedding))
    }

    const SELECT_CHUNKS: &'static str =
        "SELECT c.id, c.file_id, f.path AS file_path, c.start_line, c.end_line,
                c.content, c.symbol, c.kind, c.metadata, c.embedding
         FROM chunks c JOIN files f ON f.id = c.file_id";

    fn load_chunks(
        &self,
        path_filter: Option<&str>,
    ) -> Result<Vec<(Chunk, Option<Vec<f32>>)>, StoreError> {
        let conn = self.lock_conn()?;
        let (sql, pattern);
        if let Some(prefix) = path_filter {
            pattern = format!("{}%", like_escape(prefix));
            sql = format!(
                "{} WHERE f.path LIKE ?1 ESCAPE '\\' ORDER BY c.id",
                Self::SELECT_CHUNKS
            );
        } else {
            pattern = String::new();
            sql = format!("{} ORDER BY c.id", Self::SELECT_CHUNKS);
        }

        let mut stmt = conn.prepare(&sql)?;
        let rows = if path_filter.is_some() {
            stmt.query_map(params![pattern], Self::row_to_chunk)?
                .collect::<rusqlite::Result<Vec<_>>>()?
        } else {
            stmt.query_map([], Self::row_to_chunk)?
                .collect::<rusqlite::Result<Vec<_>>>()?
        };
        Ok(rows)
    }

    /// Resolves embeddings for the given chunks, computing and caching any
    /// that are missing from both the database and the cache.
    async fn resolve_embeddings(
        &self,
        chunks: &[(Chunk, Option<Vec<f32>>)],
    ) -> Result<Vec<Vec<f32>>, StoreError> {
        let mut resolved: Vec<Option<Vec<f32>>> = Vec::with_capacity(chunks.len());
        let mut missing: Vec<(usize, String)> = Vec::new();
        {
            let cache = self
                .embedding_cache
                .lock()
                .map_err(|e| StoreError::Database(format!("embedding cache poisoned: {e}")))?;
            for (i, (chunk, stored)) in chunks.iter().enumerate() {
                if let Some(embedding) = stored.clone().or_else(|| cache.get(&chunk.id).cloned()) {
                    resolved.push(Some(embedding));
                } else {
                    resolved.push(None);
                    missing.push((i, chunk.document_text()));
                }
            }
        }

        if !missing.is_empty() {
            let texts: Vec<String> = missing.iter().map(|(_, text)| text.clone()).collect();
            let computed = self
                .embedder
                .embed_batch(&texts)
                .await
                .map_err(|e| StoreError::Database(format!("embedding failed: {e}")))?;
            let mut cache = self
                .embedding_cache
                .lock()
                .map_err(|e| StoreError::Database(format!("embedding cache poisoned: {e}")))?;
            for ((slot, _), embedding) in missing.iter().zip(computed) {
                cache.insert(chunks[*slot].0.id, embedding.clone());
                resolved[*slot] = Some(embedding);
            }
        }

        Ok(resolved.into_iter().map(Option::unwrap_or_default).collect())
    }
}

/// Escapes `%` and `_` for a LIKE pattern with `\` as the escape character.
fn like_escape(prefix: &str) -> String {
    prefix
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

#[async_trait]
impl ChunkStore for SqliteChunkStore {
    async fn search_semantic(
        &self,
        query: &SemanticQuery,
    ) -> Result<(Vec<Chunk>, SearchStats), StoreError> {
        let start = Instant::now();
        let rows = self.load_chunks(query.path_filter.as_deref())?;
        if rows.is_empty() {
            return Ok((
                Vec::new(),
                SearchStats {
                    total_candidates: 0,
                    elapsed: start.elapsed(),
                },
            ));
        }

        let query_embedding = self
            .embedder
            .embed_batch(std::slice::from_ref(&query.query))
            .await
            .map_err(|e| StoreError::Database(format!("query embedding failed: {e}")))?
            .into_iter()
            .next()
            .unwrap_or_default();

        let embeddings = self.resolve_embeddings(&rows).await?;

        let mut scored: Vec<Chunk> = Vec::with_capacity(rows.len());
        for ((mut chunk, _), embedding) in rows.into_iter().zip(embeddings) {
            if let Some(limit) = query.time_limit
                && start.elapsed() > limit
            {
                debug!("semantic search time limit reached after {} chunks", scored.len());
                break;
            }
            let score = cosine_similarity(&query_embedding, &embedding);
            if let Some(threshold) = query.threshold
                && score < threshold
            {
                continue;
            }
            chunk.score = Some(score);
            scored.push(chunk);
            if let Some(limit) = query.result_limit
                && scored.len() >= limit
            {
                break;
            }
        }

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let total_candidates = scored.len();
        scored.truncate(query.page_size);

        Ok((
            scored,
            SearchStats {
                total_candidates,
                elapsed: start.elapsed(),
            },
        ))
    }

    async fn search_regex(
        &self,
        pattern: &str,
        page_size: usize,
        offset: usize,
        path_filter: Option<&str>,
    ) -> Result<(Vec<Chunk>, SearchStats), StoreError> {
        let start = Instant::now();
        let re = regex::Regex::new(pattern)?;
        let rows = self.load_chunks(path_filter)?;

        let matching: Vec<Chunk> = rows
            .into_iter()
            .map(|(chunk, _)| chunk)
            .filter(|chunk| {
                re.is_match(&chunk.content)
                    || chunk.symbol.as_deref().is_some_and(|s| re.is_match(s))
            })
            .collect();

        let total_candidates = matching.len();
        let page: Vec<Chunk> = matching.into_iter().skip(offset).take(page_size).collect();

        Ok((
            page,
            SearchStats {
                total_candidates,
                elapsed: start.elapsed(),
            },
        ))
    }

    async fn get_chunks_in_range(
        &self,
        file_id: i64,
        start_line: u32,
        end_line: u32,
    ) -> Result<Vec<Chunk>, StoreError> {
        let conn = self.lock_conn()?;
        let sql = format!(
            "{} WHERE c.file_id = ?1 AND c.start_line <= ?3 AND c.end_line >= ?2 ORDER BY c.start_line",
            Self::SELECT_CHUNKS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![file_id, start_line, end_line], Self::row_to_chunk)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows.into_iter().map(|(chunk, _)| chunk).collect())
    }

    async fn get_file_by_path(&self, path: &str) -> Result<Option<FileRecord>, StoreError> {
        let conn = self.lock_conn()?;
        let record = conn
            .query_row(
                "SELECT id, path, content_hash, size_bytes, created_at, modified_at
                 FROM files WHERE path = ?1",
                params![path],
                |row| {
                    Ok(FileRecord {
                        id: row.get(0)?,
                        path: row.get(1)?,
                        content_hash: row.get(2)?,
                        size_bytes: row.get::<_, i64>(3)?.try_into().unwrap_or(0),
                        created_at: row.get(4)?,
                        modified_at: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    async fn get_chunks_by_file_id(&self, file_id: i64) -> Result<Vec<Chunk>, StoreError> {
        let conn = self.lock_conn()?;
        let sql = format!(
            "{} WHERE c.file_id = ?1 ORDER BY c.start_line",
            Self::SELECT_CHUNKS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![file_id], Self::row_to_chunk)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows.into_iter().map(|(chunk, _)| chunk).collect())
    }

    async fn get_scope_file_paths(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let conn = self.lock_conn()?;
        let pattern = format!("{}%", like_escape(prefix));
        let mut stmt = conn.prepare(
            "SELECT path FROM files WHERE path LIKE ?1 ESCAPE '\\' ORDER BY path",
        )?;
        let rows = stmt
            .query_map(params![pattern], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(rows)
    }

    async fn get_scope_stats(&self, prefix: &str) -> Result<ScopeStats, StoreError> {
        let conn = self.lock_conn()?;
        let pattern = format!("{}%", like_escape(prefix));
        let files: usize = conn.query_row(
            "SELECT COUNT(*) FROM files WHERE path LIKE ?1 ESCAPE '\\'",
            params![pattern],
            |row| row.get::<_, i64>(0),
        )?
        .try_into()
        .unwrap_or(0);
        let chunks: usize = conn.query_row(
            "SELECT COUNT(*) FROM chunks c JOIN files f ON f.id = c.file_id
             WHERE f.path LIKE ?1 ESCAPE '\\'",
            params![pattern],
            |row| row.get::<_, i64>(0),
        )?
        .try_into()
        .unwrap_or(0);
        Ok(ScopeStats { files, chunks })
    }

    fn base_directory(&self) -> &Path {
        &self.base_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;

    fn seeded_store() -> SqliteChunkStore {
        let store = SqliteChunkStore::open_in_memory("/repo", Arc::new(HashEmbedder::default()))
            .unwrap_or_else(|_| unreachable!());
        let file_id = store
            .insert_file("src/retry.rs", "abc123", 512)
            .unwrap_or_else(|_| unreachable!());
        let mut c1 = Chunk::new(
            0,
            file_id,
            "src/retry.rs",
            1,
            10,
            "fn retry_with_backoff() { exponential backoff retry loop }",
        );
        c1.symbol = Some("retry_with_backoff".to_string());
        c1.kind = Some(ChunkKind::Function);
        store.insert_chunk(&c1).unwrap_or_else(|_| unreachable!());

        let c2 = Chunk::new(
            0,
            file_id,
            "src/retry.rs",
            11,
            25,
            "fn parse_config() { yaml parsing here }",
        );
        store.insert_chunk(&c2).unwrap_or_else(|_| unreachable!());

        let other_file = store
            .insert_file("docs/guide.md", "def456", 100)
            .unwrap_or_else(|_| unreachable!());
        let c3 = Chunk::new(0, other_file, "docs/guide.md", 1, 5, "# usage guide");
        store.insert_chunk(&c3).unwrap_or_else(|_| unreachable!());
        store
    }

    #[tokio::test]
    async fn test_semantic_search_ranks_relevant_first() {
        let store = seeded_store();
        let (results, stats) = store
            .search_semantic(&SemanticQuery::new("exponential backoff retry", 10))
            .await
            .unwrap_or_else(|_| unreachable!());
        assert!(!results.is_empty());
        assert!(stats.total_candidates >= results.len());
        assert_eq!(results[0].file_path, "src/retry.rs");
        assert!(results[0].score.is_some());
        // Scores descend
        for pair in results.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[tokio::test]
    async fn test_semantic_search_path_filter() {
        let store = seeded_store();
        let mut query = SemanticQuery::new("guide", 10);
        query.path_filter = Some("docs/".to_string());
        let (results, _) = store
            .search_semantic(&query)
            .await
            .unwrap_or_else(|_| unreachable!());
        assert!(results.iter().all(|c| c.file_path.starts_with("docs/")));
    }

    #[tokio::test]
    async fn test_regex_search_with_pagination() {
        let store = seeded_store();
        let (page1, stats) = store
            .search_regex(r"\bfn\b", 1, 0, None)
            .await
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(page1.len(), 1);
        assert_eq!(stats.total_candidates, 2);

        let (page2, _) = store
            .search_regex(r"\bfn\b", 1, 1, None)
            .await
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(page2.len(), 1);
        assert_ne!(page1[0].id, page2[0].id);
    }

    #[tokio::test]
    async fn test_regex_invalid_pattern() {
        let store = seeded_store();
        let result = store.search_regex("[invalid", 10, 0, None).await;
        assert!(matches!(result, Err(StoreError::InvalidPattern(_))));
    }

    #[tokio::test]
    async fn test_chunks_in_range_overlap_semantics() {
        let store = seeded_store();
        let file = store
            .get_file_by_path("src/retry.rs")
            .await
            .unwrap_or_else(|_| unreachable!())
            .unwrap_or_else(|| unreachable!());
        // Range [5, 15] overlaps both chunks (1-10 and 11-25)
        let chunks = store
            .get_chunks_in_range(file.id, 5, 15)
            .await
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(chunks.len(), 2);
        // Range [26, 30] overlaps nothing
        let none = store
            .get_chunks_in_range(file.id, 26, 30)
            .await
            .unwrap_or_else(|_| unreachable!());
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_scope_queries() {
        let store = seeded_store();
        let paths = store
            .get_scope_file_paths("src/")
            .await
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(paths, vec!["src/retry.rs".to_string()]);

        let stats = store
            .get_scope_stats("src/")
            .await
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(stats, ScopeStats { files: 1, chunks: 2 });

        let all = store
            .get_scope_stats("")
            .await
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(all, ScopeStats { files: 2, chunks: 3 });
    }

    #[tokio::test]
    async fn test_get_file_by_path_missing() {
        let store = seeded_store();
        let missing = store
            .get_file_by_path("src/nope.rs")
            .await
            .unwrap_or_else(|_| unreachable!());
        assert!(missing.is_none());
    }

    #[test]
    fn test_like_escape() {
        assert_eq!(like_escape("a_b%c"), "a\\_b\\%c");
        assert_eq!(like_escape("plain/path"), "plain/path");
    }
}
