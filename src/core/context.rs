//! Research traversal context.
//!
//! The root query is fixed at creation and injected into every LLM prompt so
//! exploration cannot drift away from the user's question. Ancestors record
//! the BFS path that led to the current node.

/// Context carried through a single research call.
#[derive(Debug, Clone, Default)]
pub struct ResearchContext {
    /// The user's original question. Never mutated after creation.
    pub root_query: String,
    /// Ordered ancestor queries on the BFS path to the current node.
    pub ancestors: Vec<String>,
    /// Human-readable traversal path for diagnostics.
    pub traversal_path: Vec<String>,
}

impl ResearchContext {
    /// Creates a context for a fresh research call.
    #[must_use]
    pub fn new(root_query: impl Into<String>) -> Self {
        Self {
            root_query: root_query.into(),
            ancestors: Vec::new(),
            traversal_path: Vec::new(),
        }
    }

    /// Builds a search query combining the input with minimal parent context.
    ///
    /// The current query goes first (embedding models weight the beginning
    /// of the text more heavily); the last one or two ancestors follow after
    /// a separator for disambiguation.
    #[must_use]
    pub fn build_search_query(&self, query: &str) -> String {
        if self.ancestors.is_empty() {
            return query.to_string();
        }

        let start = self.ancestors.len().saturating_sub(2);
        let context_str = self.ancestors[start..].join(" → ");
        format!("{query} | Context: {context_str}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_query_passthrough() {
        let ctx = ResearchContext::new("how does retry work");
        assert_eq!(
            ctx.build_search_query("how does retry work"),
            "how does retry work"
        );
    }

    #[test]
    fn test_single_ancestor_context() {
        let mut ctx = ResearchContext::new("root");
        ctx.ancestors.push("parent question".to_string());
        assert_eq!(
            ctx.build_search_query("child"),
            "child | Context: parent question"
        );
    }

    #[test]
    fn test_only_last_two_ancestors_used() {
        let mut ctx = ResearchContext::new("root");
        ctx.ancestors = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        assert_eq!(ctx.build_search_query("q"), "q | Context: b → c");
    }
}
