//! Clustered fact extraction.
//!
//! Clusters synthesis files with k-means (~50k tokens per cluster) and runs
//! one structured extraction call per cluster, bounded by the provider's
//! synthesis concurrency. Invalid facts are skipped individually; a failed
//! cluster contributes nothing but never fails the phase.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::{ConfidenceLevel, EvidenceLedger, FactEntry};
use crate::error::ResearchError;
use crate::llm::schema::fact_extraction_schema;
use crate::llm::{LlmProvider, StructuredRequest};
use crate::research::clustering::{ClusterGroup, ClusterSummary, ClusteringService};
use crate::research::models::{
    FACT_EXTRACTION_TOKENS, GAP_CLUSTER_TOKEN_BUDGET, MAX_FACT_STATEMENT_CHARS,
    MAX_FACTS_PER_CLUSTER,
};

/// Output of clustered fact extraction.
pub struct FactExtraction {
    /// The clusters the files were grouped into (reused by map-reduce
    /// synthesis).
    pub cluster_groups: Vec<ClusterGroup>,
    /// Clustering summary metadata.
    pub cluster_summary: ClusterSummary,
    /// Ledger holding the extracted facts and their detected conflicts.
    pub evidence_ledger: EvidenceLedger,
}

/// Clusters `files` and extracts facts from each cluster.
///
/// Cluster count is `ceil(total_tokens / 50k)` capped by the file count.
/// Every extraction prompt carries the root query so facts stay on topic.
///
/// # Errors
///
/// Returns [`ResearchError::Clustering`] when clustering itself fails;
/// extraction failures inside a cluster are logged and skipped.
pub async fn extract_facts_with_clustering(
    files: &BTreeMap<String, String>,
    root_query: &str,
    llm: Arc<dyn LlmProvider>,
    clustering: &ClusteringService,
) -> Result<FactExtraction, ResearchError> {
    if files.is_empty() {
        return Ok(FactExtraction {
            cluster_groups: Vec::new(),
            cluster_summary: ClusterSummary::default(),
            evidence_ledger: EvidenceLedger::default(),
        });
    }

    let total_tokens: usize = files
        .values()
        .map(|content| llm.estimate_tokens(content))
        .sum();
    let n_clusters = total_tokens
        .div_ceil(GAP_CLUSTER_TOKEN_BUDGET)
        .clamp(1, files.len());

    let (cluster_groups, cluster_summary) = clustering.cluster_files(files, n_clusters).await?;

    let semaphore = Arc::new(Semaphore::new(llm.synthesis_concurrency()));
    let extraction_tasks = cluster_groups.iter().map(|cluster| {
        let llm = Arc::clone(&llm);
        let semaphore = Arc::clone(&semaphore);
        async move {
            let Ok(_permit) = semaphore.acquire().await else {
                return Vec::new();
            };
            extract_cluster_facts(&llm, root_query, cluster).await
        }
    });

    let mut ledger = EvidenceLedger::default();
    for facts in join_all(extraction_tasks).await {
        for fact in facts {
            ledger.add_fact(fact);
        }
    }

    for conflict in ledger.detect_conflicts() {
        ledger.add_conflict(conflict);
    }

    debug!(
        "fact extraction complete: {} facts from {} clusters, {} conflicts",
        ledger.facts_count(),
        cluster_groups.len(),
        ledger.conflicts().len()
    );

    Ok(FactExtraction {
        cluster_groups,
        cluster_summary,
        evidence_ledger: ledger,
    })
}

async fn extract_cluster_facts(
    llm: &Arc<dyn LlmProvider>,
    root_query: &str,
    cluster: &ClusterGroup,
) -> Vec<FactEntry> {
    let mut code_sections = Vec::with_capacity(cluster.files_content.len());
    for (path, content) in &cluster.files_content {
        code_sections.push(format!("### {path}\n{content}"));
    }

    let prompt = format!(
        "RESEARCH QUERY: {root_query}\n\n\
         Extract atomic, verifiable facts from the code below that help answer \
         the RESEARCH QUERY. Each fact is one claim of at most \
         {MAX_FACT_STATEMENT_CHARS} characters with its exact source lines, a \
         category (architecture, behavior, configuration, data-flow, error-handling), \
         a confidence label, and the code entities it references. Extract at most \
         {MAX_FACTS_PER_CLUSTER} facts; prefer precision over coverage.\n\n\
         CODE:\n{}",
        code_sections.join("\n\n")
    );

    let request = StructuredRequest::new(prompt, fact_extraction_schema(), FACT_EXTRACTION_TOKENS);
    let value = match llm.complete_structured(&request).await {
        Ok(value) => value,
        Err(e) => {
            warn!(
                "fact extraction failed for cluster {}: {e}",
                cluster.cluster_id
            );
            return Vec::new();
        }
    };

    let Some(raw_facts) = value.get("facts").and_then(|v| v.as_array()) else {
        warn!(
            "fact extraction for cluster {} returned no facts array",
            cluster.cluster_id
        );
        return Vec::new();
    };

    let mut facts = Vec::new();
    for raw in raw_facts.iter().take(MAX_FACTS_PER_CLUSTER) {
        match parse_fact(raw, cluster) {
            Some(fact) => facts.push(fact),
            None => debug!("skipping malformed fact candidate: {raw}"),
        }
    }
    facts
}

/// Parses one fact object, rejecting malformed candidates instead of
/// failing the cluster.
fn parse_fact(value: &serde_json::Value, cluster: &ClusterGroup) -> Option<FactEntry> {
    let mut statement = value.get("statement")?.as_str()?.trim().to_string();
    if statement.is_empty() {
        return None;
    }
    crate::core::text::truncate_chars(&mut statement, MAX_FACT_STATEMENT_CHARS);

    let file_path = value.get("file_path")?.as_str()?.to_string();
    // The model must cite a file actually present in the cluster
    if !cluster.files_content.contains_key(&file_path) {
        return None;
    }

    let start_line = u32::try_from(value.get("start_line")?.as_i64()?).ok()?;
    let end_line = u32::try_from(value.get("end_line")?.as_i64()?).ok()?;
    if start_line == 0 || end_line < start_line {
        return None;
    }

    let category = value.get("category")?.as_str()?.to_string();
    let confidence = ConfidenceLevel::parse(value.get("confidence")?.as_str()?)?;
    let entities: Vec<String> = value
        .get("entities")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|e| e.as_str())
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default();

    Some(FactEntry {
        fact_id: FactEntry::generate_id(&statement, &file_path, start_line, end_line),
        statement,
        file_path,
        start_line,
        end_line,
        category,
        confidence,
        entities,
        cluster_id: cluster.cluster_id,
    })
}
