//! Code-mapper data models.

use serde::{Deserialize, Serialize};

/// Whether a point of interest is architectural or operational.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoiMode {
    /// Structural areas of the codebase.
    Architectural,
    /// Setup, local run, and troubleshooting workflows.
    Operational,
}

impl PoiMode {
    /// Short tag used in output file names.
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Architectural => "arch",
            Self::Operational => "ops",
        }
    }
}

/// One point of interest the mapper will research.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Poi {
    /// Architectural or operational.
    pub mode: PoiMode,
    /// The PoI text as planned (may include markdown emphasis and key
    /// files).
    pub text: String,
}

/// Metadata block stamped at the top of every generated document as an
/// HTML-comment YAML block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocMetadata {
    /// Commit the documents were generated from.
    pub created_from_sha: String,
    /// Generation timestamp (RFC 3339).
    pub generated_at: String,
    /// LLM configuration used.
    pub llm_config: serde_json::Value,
    /// Free-form generation statistics.
    pub generation_stats: serde_json::Value,
}

impl DocMetadata {
    /// Renders the `agent_doc_metadata` HTML-comment YAML block.
    #[must_use]
    pub fn html_comment_block(&self) -> String {
        let llm_config = serde_json::to_string(&self.llm_config).unwrap_or_default();
        let stats = serde_json::to_string(&self.generation_stats).unwrap_or_default();
        format!(
            "<!--\nagent_doc_metadata:\n  created_from_sha: {}\n  generated_at: {}\n  \
             llm_config: {llm_config}\n  generation_stats: {stats}\n-->\n",
            self.created_from_sha, self.generated_at
        )
    }
}

/// Derives a short heading from a PoI line: the bold span when present,
/// otherwise the text up to the first sentence break.
#[must_use]
pub fn derive_heading_from_point(text: &str) -> String {
    if let Some(start) = text.find("**")
        && let Some(len) = text[start + 2..].find("**")
    {
        let heading = text[start + 2..start + 2 + len].trim();
        if !heading.is_empty() {
            return heading.to_string();
        }
    }

    let cut = text
        .find([':', '—', '.'])
        .map_or(text.len(), |i| i.min(text.len()));
    let heading = text[..cut].trim();
    let heading = heading.trim_start_matches(['-', '*', ' ']);
    if heading.is_empty() {
        "Untitled".to_string()
    } else {
        heading.chars().take(80).collect()
    }
}

/// Lowercase, hyphen-separated slug for output file names.
#[must_use]
pub fn slugify(text: &str) -> String {
    let mut slug = String::new();
    let mut last_was_dash = true;
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_was_dash = false;
        } else if !last_was_dash {
            slug.push('-');
            last_was_dash = true;
        }
        if slug.len() >= 48 {
            break;
        }
    }
    let trimmed = slug.trim_matches('-');
    if trimmed.is_empty() {
        "topic".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heading_from_bold_span() {
        assert_eq!(
            derive_heading_from_point("**Retry Pipeline** — how retries flow. Key files: `a.rs`"),
            "Retry Pipeline"
        );
    }

    #[test]
    fn test_heading_from_plain_text() {
        assert_eq!(
            derive_heading_from_point("Indexing loop: watches the filesystem"),
            "Indexing loop"
        );
    }

    #[test]
    fn test_heading_fallback() {
        assert_eq!(derive_heading_from_point("****"), "Untitled");
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Retry Pipeline"), "retry-pipeline");
        assert_eq!(slugify("Quickstart / Local run"), "quickstart-local-run");
        assert_eq!(slugify("___"), "topic");
    }

    #[test]
    fn test_slugify_caps_length() {
        let long = "word ".repeat(40);
        assert!(slugify(&long).len() <= 48);
    }

    #[test]
    fn test_metadata_block_shape() {
        let meta = DocMetadata {
            created_from_sha: "abc123".to_string(),
            generated_at: "2026-01-01T00:00:00Z".to_string(),
            llm_config: serde_json::json!({"model": "m"}),
            generation_stats: serde_json::json!({"pois": 3}),
        };
        let block = meta.html_comment_block();
        assert!(block.starts_with("<!--\nagent_doc_metadata:"));
        assert!(block.contains("created_from_sha: abc123"));
        assert!(block.trim_end().ends_with("-->"));
    }

    #[test]
    fn test_poi_mode_tags() {
        assert_eq!(PoiMode::Architectural.tag(), "arch");
        assert_eq!(PoiMode::Operational.tag(), "ops");
    }
}
