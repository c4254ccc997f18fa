//! Rendering and writing of code-mapper documents.
//!
//! Each run produces a combined document, a per-scope index, one markdown
//! file per PoI (failures as placeholders), and an unreferenced-files
//! listing. Every markdown document starts with the `agent_doc_metadata`
//! HTML-comment block.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use tracing::info;

use super::models::{DocMetadata, slugify};
use super::pipeline::MapperRun;
use crate::error::MapperError;

/// File names and contents of one rendered run.
#[derive(Debug, Clone)]
pub struct RenderedDocs {
    /// `{scope}_code_mapper.md`.
    pub combined: (String, String),
    /// `{scope}_code_mapper_index.md`.
    pub index: (String, String),
    /// `{scope}_{arch|ops}_topic_{NN}_{slug}.md`, one per PoI.
    pub topics: Vec<(String, String)>,
    /// `{scope}_scope_unreferenced_files.txt`, when any file went
    /// unreferenced.
    pub unreferenced: Option<(String, String)>,
}

/// Normalizes a scope label into a file-name-safe prefix.
#[must_use]
pub fn safe_scope_label(scope: &str) -> String {
    let cleaned = slugify(scope).replace('-', "_");
    if cleaned == "topic" {
        "scope".to_string()
    } else {
        cleaned
    }
}

/// Renders all documents for a mapper run.
#[must_use]
pub fn render_run(run: &MapperRun, scope: &str, meta: &DocMetadata) -> RenderedDocs {
    let label = safe_scope_label(scope);
    let metadata_block = meta.html_comment_block();

    // Topic files
    let mut topics = Vec::with_capacity(run.sections.len());
    for section in &run.sections {
        let name = format!(
            "{label}_{}_topic_{:02}_{}.md",
            section.poi.mode.tag(),
            section.index,
            slugify(&section.heading)
        );
        let body = if section.body.starts_with('#') {
            format!("{metadata_block}\n{}\n", section.body.trim_end())
        } else {
            format!(
                "{metadata_block}\n# {}\n\n{}\n",
                section.heading,
                section.body.trim_end()
            )
        };
        topics.push((name, body));
    }

    // Combined document
    let mut combined = format!("{metadata_block}\n# Code Map: {scope}\n\n{}\n", run.overview);
    for section in &run.sections {
        let marker = if section.failed { " (failed)" } else { "" };
        let _ = write!(
            combined,
            "\n\n---\n\n## {}. {}{marker}\n\n{}",
            section.index,
            section.heading,
            section.body.trim_end()
        );
    }
    combined.push('\n');

    // Index document
    let mut index = format!("{metadata_block}\n# Code Map Index: {scope}\n\n");
    let _ = writeln!(
        index,
        "{} points of interest ({} failed).\n",
        run.total_points,
        run.sections.iter().filter(|s| s.failed).count()
    );
    for (section, (topic_name, _)) in run.sections.iter().zip(&topics) {
        let marker = if section.failed { " — FAILED" } else { "" };
        let _ = writeln!(
            index,
            "{}. [{}]({topic_name}){marker}",
            section.index, section.heading
        );
    }

    // Unreferenced listing
    let unreferenced = if run.unreferenced_files.is_empty() {
        None
    } else {
        let mut listing = String::new();
        for file in &run.unreferenced_files {
            let _ = writeln!(listing, "{file}");
        }
        Some((format!("{label}_scope_unreferenced_files.txt"), listing))
    };

    RenderedDocs {
        combined: (format!("{label}_code_mapper.md"), combined),
        index: (format!("{label}_code_mapper_index.md"), index),
        topics,
        unreferenced,
    }
}

/// Writes rendered documents to `out_dir`, creating it when missing.
///
/// # Errors
///
/// Returns [`MapperError::WriteFailed`] on the first failing write.
pub async fn write_docs(docs: &RenderedDocs, out_dir: &Path) -> Result<Vec<PathBuf>, MapperError> {
    tokio::fs::create_dir_all(out_dir)
        .await
        .map_err(|e| MapperError::WriteFailed {
            path: out_dir.display().to_string(),
            reason: e.to_string(),
        })?;

    let mut written = Vec::new();
    let mut all: Vec<&(String, String)> = vec![&docs.combined, &docs.index];
    all.extend(docs.topics.iter());
    if let Some(unreferenced) = &docs.unreferenced {
        all.push(unreferenced);
    }

    for (name, content) in all {
        let path = out_dir.join(name);
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| MapperError::WriteFailed {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        written.push(path);
    }

    info!("wrote {} code-mapper documents to {}", written.len(), out_dir.display());
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::models::{Poi, PoiMode};
    use crate::mapper::pipeline::PoiSection;

    fn meta() -> DocMetadata {
        DocMetadata {
            created_from_sha: "deadbeef".to_string(),
            generated_at: "2026-08-01T00:00:00Z".to_string(),
            llm_config: serde_json::json!({"model": "m"}),
            generation_stats: serde_json::json!({}),
        }
    }

    fn run() -> MapperRun {
        MapperRun {
            overview: "## Architectural Map (HyDE)\n\n1. **Engine**".to_string(),
            sections: vec![
                PoiSection {
                    index: 1,
                    poi: Poi {
                        mode: PoiMode::Architectural,
                        text: "**Engine** — core".to_string(),
                    },
                    heading: "Engine".to_string(),
                    body: "The engine does things [1].\n\n## Sources\n[1] src/a.rs:1-5".to_string(),
                    failed: false,
                    referenced_files: vec!["src/a.rs".to_string()],
                },
                PoiSection {
                    index: 2,
                    poi: Poi {
                        mode: PoiMode::Operational,
                        text: "**Quickstart**".to_string(),
                    },
                    heading: "Quickstart".to_string(),
                    body: "# Quickstart (failed)\n\nThis point of interest failed.".to_string(),
                    failed: true,
                    referenced_files: Vec::new(),
                },
            ],
            scope_files: vec!["src/a.rs".to_string(), "src/b.rs".to_string()],
            unreferenced_files: vec!["src/b.rs".to_string()],
            total_points: 2,
            serialized: false,
        }
    }

    #[test]
    fn test_safe_scope_label() {
        assert_eq!(safe_scope_label("src/engine"), "src_engine");
        assert_eq!(safe_scope_label(""), "scope");
    }

    #[test]
    fn test_render_topic_file_names() {
        let docs = render_run(&run(), "src/engine", &meta());
        assert_eq!(docs.topics.len(), 2);
        assert_eq!(docs.topics[0].0, "src_engine_arch_topic_01_engine.md");
        assert_eq!(docs.topics[1].0, "src_engine_ops_topic_02_quickstart.md");
    }

    #[test]
    fn test_render_metadata_block_everywhere() {
        let docs = render_run(&run(), "src/engine", &meta());
        assert!(docs.combined.1.starts_with("<!--\nagent_doc_metadata:"));
        assert!(docs.index.1.starts_with("<!--\nagent_doc_metadata:"));
        for (_, content) in &docs.topics {
            assert!(content.starts_with("<!--\nagent_doc_metadata:"));
        }
    }

    #[test]
    fn test_render_index_marks_failures() {
        let docs = render_run(&run(), "src/engine", &meta());
        assert!(docs.index.1.contains("2 points of interest (1 failed)"));
        assert!(docs.index.1.contains("FAILED"));
    }

    #[test]
    fn test_render_unreferenced_listing() {
        let docs = render_run(&run(), "src/engine", &meta());
        let (name, content) = docs.unreferenced.unwrap_or_else(|| unreachable!());
        assert_eq!(name, "src_engine_scope_unreferenced_files.txt");
        assert_eq!(content.trim(), "src/b.rs");
    }

    #[tokio::test]
    async fn test_write_docs_creates_all_files() {
        let dir = tempfile::tempdir().unwrap_or_else(|_| unreachable!());
        let docs = render_run(&run(), "src/engine", &meta());
        let written = write_docs(&docs, dir.path())
            .await
            .unwrap_or_else(|_| unreachable!());
        // combined + index + 2 topics + unreferenced
        assert_eq!(written.len(), 5);
        for path in written {
            assert!(path.exists());
        }
    }
}
