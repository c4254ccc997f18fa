//! HyDE-style planning for the code mapper.
//!
//! Before any retrieval happens, the planner drafts two points-of-interest
//! lists (architectural and operational) from the scope's file listing and a
//! budgeted sample of its code. The scope file list is capped and the
//! snippet budget scaled by the comprehensiveness level; when the
//! operational list lacks a quickstart-like item, a canonical Quickstart PoI
//! is injected at position one.

use std::sync::Arc;

use tracing::{debug, warn};

use super::models::{Poi, PoiMode};
use crate::config::{Comprehensiveness, MapperConfig};
use crate::error::MapperError;
use crate::llm::{CompletionRequest, LlmProvider};
use crate::store::ChunkStore;

/// Output budget for each planning call.
const PLANNING_OUTPUT_TOKENS: u32 = 8_000;

/// Phrases that mark an operational item as quickstart-like.
const QUICKSTART_PHRASES: &[&str] = &["quickstart", "getting started", "local run", "run locally"];

/// The canonical quickstart PoI injected when the planner omitted one.
const QUICKSTART_POI: &str = "**Quickstart / Local run**: How to install, configure, and run \
                              this project end-to-end in a local development environment.";

/// Result of the planning pass.
#[derive(Debug, Clone)]
pub struct HydePlan {
    /// Combined overview markdown (both maps).
    pub overview: String,
    /// Planned points of interest, architectural first.
    pub points_of_interest: Vec<Poi>,
    /// Scope files listed in the prompt (for coverage accounting).
    pub scope_files: Vec<String>,
}

/// Plans points of interest for a scope.
///
/// # Errors
///
/// Returns [`MapperError::HydePlanning`] when a planning call fails and
/// [`MapperError::NoPointsOfInterest`] when both lists come back empty.
pub async fn plan_points_of_interest(
    store: &Arc<dyn ChunkStore>,
    llm: &Arc<dyn LlmProvider>,
    scope: &str,
    config: &MapperConfig,
) -> Result<HydePlan, MapperError> {
    let comprehensiveness = config.comprehensiveness;

    let mut scope_files = store
        .get_scope_file_paths(scope)
        .await
        .map_err(|e| MapperError::HydePlanning(format!("scope listing failed: {e}")))?;
    let total_scope_files = scope_files.len();
    scope_files.truncate(comprehensiveness.scope_file_cap());
    debug!(
        "hyde planning over {} scope files (of {total_scope_files} total)",
        scope_files.len()
    );

    let snippets = sample_code_snippets(store, &scope_files, comprehensiveness).await;
    let scope_prompt = build_scope_prompt(scope, &scope_files, total_scope_files, &snippets);

    let ops_budget = comprehensiveness.operational_poi_budget();

    let arch_prompt = build_overview_prompt(&scope_prompt, PoiMode::Architectural, config.max_points);
    let ops_prompt = build_overview_prompt(&scope_prompt, PoiMode::Operational, ops_budget);

    let arch_answer = run_planning_call(llm, &arch_prompt).await?;
    let ops_answer = run_planning_call(llm, &ops_prompt).await?;

    let arch_points = extract_points_of_interest(&arch_answer, config.max_points);
    let mut ops_points = extract_points_of_interest(&ops_answer, ops_budget);
    ops_points = ensure_operational_quickstart(ops_points, ops_budget);

    let overview = format!(
        "## Architectural Map (HyDE)\n\n{}\n\n## Operational Map (HyDE)\n\n{}\n",
        arch_answer.trim(),
        ops_answer.trim()
    );

    let points_of_interest: Vec<Poi> = arch_points
        .into_iter()
        .map(|text| Poi {
            mode: PoiMode::Architectural,
            text,
        })
        .chain(ops_points.into_iter().map(|text| Poi {
            mode: PoiMode::Operational,
            text,
        }))
        .collect();

    if points_of_interest.is_empty() {
        return Err(MapperError::NoPointsOfInterest);
    }

    Ok(HydePlan {
        overview,
        points_of_interest,
        scope_files,
    })
}

async fn run_planning_call(
    llm: &Arc<dyn LlmProvider>,
    prompt: &str,
) -> Result<String, MapperError> {
    let request = CompletionRequest::new(prompt, PLANNING_OUTPUT_TOKENS);
    llm.complete(&request)
        .await
        .map(|completion| completion.content)
        .map_err(|e| MapperError::HydePlanning(e.to_string()))
}

/// Samples chunk content across scope files within the snippet budget.
async fn sample_code_snippets(
    store: &Arc<dyn ChunkStore>,
    scope_files: &[String],
    comprehensiveness: Comprehensiveness,
) -> String {
    let mut budget_chars = comprehensiveness.snippet_token_budget() * 4;
    let mut snippets: Vec<String> = Vec::new();

    for path in scope_files {
        if budget_chars == 0 {
            break;
        }
        let Ok(Some(file)) = store.get_file_by_path(path).await else {
            continue;
        };
        let Ok(chunks) = store.get_chunks_by_file_id(file.id).await else {
            continue;
        };
        let Some(chunk) = chunks.first() else {
            continue;
        };

        let mut snippet = format!("### {path}\n{}", chunk.content);
        if snippet.chars().count() > budget_chars {
            crate::core::text::truncate_chars(&mut snippet, budget_chars);
        }
        budget_chars = budget_chars.saturating_sub(snippet.chars().count());
        snippets.push(snippet);
    }

    snippets.join("\n\n")
}

fn build_scope_prompt(
    scope: &str,
    scope_files: &[String],
    total_scope_files: usize,
    snippets: &str,
) -> String {
    let file_listing: String = scope_files
        .iter()
        .map(|f| format!("- {f}"))
        .collect::<Vec<_>>()
        .join("\n");
    let truncation_note = if total_scope_files > scope_files.len() {
        format!(
            "\n(listing capped at {} of {total_scope_files} files)",
            scope_files.len()
        )
    } else {
        String::new()
    };
    let snippet_section = if snippets.is_empty() {
        String::new()
    } else {
        format!("\n\nSampled code:\n{snippets}")
    };

    format!(
        "Scope: '{scope}'\n\nFiles in scope:\n{file_listing}{truncation_note}{snippet_section}"
    )
}

fn build_overview_prompt(scope_prompt: &str, mode: PoiMode, budget: usize) -> String {
    let focus = match mode {
        PoiMode::Architectural => "architectural areas first",
        PoiMode::Operational => "operational workflows (setup, local run, troubleshooting) first",
    };
    format!(
        "{scope_prompt}\n\n\
         Planning objective:\n\
         - Do a concise planning pass for deep code research over this scope.\n\
         - Identify up to {budget} points of interest. Prioritize the most \
         important {focus}, but you may include slightly less critical topics to \
         use the full budget when appropriate.\n\n\
         Output format:\n\
         - Produce ONLY a numbered markdown list (1., 2., 3., ...).\n\
         - Each item MUST follow this exact shape:\n\
         `N. **Short Title** — 1-2 sentences. Key files: `path`, `path` (optional).`\n\
         - Short titles are 3-8 words, human-readable, no file paths or extensions.\n\
         - Include at most 3 key files per item, each in backticks.\n\
         - Do not include any other sections or prose; just the numbered list."
    )
}

/// Extracts up to `max_points` PoI lines from a numbered or bulleted
/// markdown list, deduplicating.
#[must_use]
pub fn extract_points_of_interest(text: &str, max_points: usize) -> Vec<String> {
    let mut seen: Vec<String> = Vec::new();

    for line in text.lines() {
        let stripped = line.trim();
        if stripped.is_empty() {
            continue;
        }

        let mut candidate = "";
        // Numbered list: "1. heading" or "1) heading"
        if stripped.chars().next().is_some_and(|c| c.is_ascii_digit()) {
            if let Some(idx) = stripped.find(['.', ')']) {
                candidate = stripped[idx + 1..].trim();
            }
        }
        // Bullet list: "- text" or "* text"
        if candidate.is_empty()
            && let Some(rest) = stripped.strip_prefix("- ").or_else(|| stripped.strip_prefix("* "))
        {
            candidate = rest.trim();
        }

        if candidate.is_empty() {
            continue;
        }
        if !seen.iter().any(|s| s == candidate) {
            seen.push(candidate.to_string());
        }
        if seen.len() >= max_points {
            break;
        }
    }

    seen
}

/// Ensures the operational list contains a quickstart-like item, injecting
/// the canonical one at position 1 when absent. Matching uses a small closed
/// phrase set over the normalized items.
#[must_use]
pub fn ensure_operational_quickstart(points: Vec<String>, max_points: usize) -> Vec<String> {
    let has_quickstart = points.iter().any(|p| {
        let normalized = p.trim().to_lowercase();
        QUICKSTART_PHRASES
            .iter()
            .any(|phrase| normalized.contains(phrase))
    });

    let mut result = points;
    if !has_quickstart {
        warn!("operational plan lacks a quickstart item, injecting the canonical one");
        result.insert(0, QUICKSTART_POI.to_string());
    }
    result.truncate(max_points.max(1));
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_extract_numbered_list() {
        let text = "1. **First Topic** — about things.\n2. **Second Topic** — more.\n";
        let points = extract_points_of_interest(text, 10);
        assert_eq!(points.len(), 2);
        assert!(points[0].starts_with("**First Topic**"));
    }

    #[test]
    fn test_extract_paren_numbered_and_bullets() {
        let text = "1) first\n- second\n* third\nprose line\n";
        let points = extract_points_of_interest(text, 10);
        assert_eq!(points, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_extract_dedupes_and_caps() {
        let text = "1. same\n2. same\n3. other\n4. fourth\n";
        let points = extract_points_of_interest(text, 2);
        assert_eq!(points, vec!["same", "other"]);
    }

    #[test]
    fn test_extract_ignores_prose() {
        assert!(extract_points_of_interest("no list here at all", 5).is_empty());
    }

    #[test_case("**Quickstart** — run it"; "quickstart")]
    #[test_case("Getting Started with the CLI"; "getting started")]
    #[test_case("Local run and debugging"; "local run")]
    #[test_case("How to run locally"; "run locally")]
    fn test_quickstart_detected(item: &str) {
        let points = vec![item.to_string(), "Other topic".to_string()];
        let result = ensure_operational_quickstart(points.clone(), 5);
        assert_eq!(result, points);
    }

    #[test]
    fn test_quickstart_injected_at_front() {
        let points = vec!["Troubleshooting".to_string(), "Deployment".to_string()];
        let result = ensure_operational_quickstart(points, 3);
        assert_eq!(result.len(), 3);
        assert!(result[0].contains("Quickstart"));
        assert_eq!(result[1], "Troubleshooting");
    }

    #[test]
    fn test_quickstart_injection_respects_budget() {
        let points = vec!["A".to_string(), "B".to_string(), "C".to_string()];
        let result = ensure_operational_quickstart(points, 3);
        assert_eq!(result.len(), 3);
        assert!(result[0].contains("Quickstart"));
        assert_eq!(&result[1..], &["A".to_string(), "B".to_string()]);
    }

    #[test]
    fn test_overview_prompt_mentions_budget() {
        let prompt = build_overview_prompt("scope text", PoiMode::Architectural, 10);
        assert!(prompt.contains("up to 10 points of interest"));
        assert!(prompt.contains("numbered markdown list"));
    }

    #[test]
    fn test_scope_prompt_truncation_note() {
        let files = vec!["a.rs".to_string()];
        let prompt = build_scope_prompt("src/", &files, 100, "");
        assert!(prompt.contains("listing capped at 1 of 100 files"));
    }
}
