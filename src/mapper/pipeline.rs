//! Per-PoI deep research pipeline with bounded concurrency and pessimistic
//! backoff.
//!
//! PoIs drain from an async work queue. The first retryable failure flips a
//! shared serialize flag: in-flight work finishes, then worker 0 alone runs
//! the remainder. Empty research results and retryable failures get one
//! pipeline-level retry with a random 0-1 s jitter; terminal failures become
//! placeholder sections so the final index stays dense and deterministic.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::hyde::{HydePlan, plan_points_of_interest};
use super::models::{Poi, derive_heading_from_point};
use crate::config::MapperConfig;
use crate::error::{Error, MapperError, is_retryable_message};
use crate::llm::LlmProvider;
use crate::research::{DeepResearchService, ResearchResult};
use crate::store::ChunkStore;

/// PoI concurrency at or above this triggers a warning.
const HIGH_CONCURRENCY_WARNING: usize = 8;

/// One finished (or failed) PoI section.
#[derive(Debug, Clone)]
pub struct PoiSection {
    /// 1-based PoI index.
    pub index: usize,
    /// The planned point of interest.
    pub poi: Poi,
    /// Section heading derived from the PoI text.
    pub heading: String,
    /// Section markdown (research answer, or the failure placeholder).
    pub body: String,
    /// True when this section is a failure placeholder.
    pub failed: bool,
    /// Files the research referenced.
    pub referenced_files: Vec<String>,
}

/// Output of one full mapper run.
#[derive(Debug, Clone)]
pub struct MapperRun {
    /// The HyDE overview markdown.
    pub overview: String,
    /// One section per PoI, ordered by index; placeholders included.
    pub sections: Vec<PoiSection>,
    /// Scope files listed during planning.
    pub scope_files: Vec<String>,
    /// Scope files never referenced by any research call.
    pub unreferenced_files: Vec<String>,
    /// Total planned PoIs (`sections.len()` equals this).
    pub total_points: usize,
    /// Whether the run degraded to serial execution.
    pub serialized: bool,
}

/// Outcome of a single research attempt.
enum Attempt {
    Success(Box<ResearchResult>),
    /// Retryable: error summary, whether to flip the serialize flag.
    Retry(String, bool),
}

struct QueueState {
    pending: VecDeque<(usize, Poi, String)>,
    in_flight: usize,
    serialize: bool,
}

/// Runs HyDE planning and per-PoI deep research for a scope.
pub struct CodeMapperPipeline {
    store: Arc<dyn ChunkStore>,
    llm: Arc<dyn LlmProvider>,
    research: Arc<DeepResearchService>,
    config: MapperConfig,
}

impl CodeMapperPipeline {
    /// Creates a pipeline.
    #[must_use]
    pub fn new(
        store: Arc<dyn ChunkStore>,
        llm: Arc<dyn LlmProvider>,
        research: Arc<DeepResearchService>,
        config: MapperConfig,
    ) -> Self {
        Self {
            store,
            llm,
            research,
            config,
        }
    }

    /// Runs the full pipeline for `scope`.
    ///
    /// # Errors
    ///
    /// Returns [`MapperError`] on planning failures or invalid concurrency
    /// configuration. PoI research failures never fail the run; they become
    /// placeholder sections.
    pub async fn run(&self, scope: &str) -> Result<MapperRun, Error> {
        let plan = plan_points_of_interest(&self.store, &self.llm, scope, &self.config).await?;
        self.run_with_plan(scope, plan).await
    }

    /// Runs per-PoI research for an existing plan.
    ///
    /// # Errors
    ///
    /// Returns [`MapperError::InvalidConcurrency`] for a zero jobs setting.
    pub async fn run_with_plan(&self, scope: &str, plan: HydePlan) -> Result<MapperRun, Error> {
        let total_points = plan.points_of_interest.len();
        let concurrency = resolve_poi_concurrency(self.config.poi_jobs, total_points)?;
        if concurrency > 1 {
            info!("running PoI deep research with concurrency={concurrency}");
        }
        if concurrency >= HIGH_CONCURRENCY_WARNING {
            warn!("high PoI concurrency may overwhelm the LLM provider: jobs={concurrency}");
        }

        let state = Arc::new(Mutex::new(QueueState {
            pending: plan
                .points_of_interest
                .iter()
                .enumerate()
                .map(|(i, poi)| (i + 1, poi.clone(), derive_heading_from_point(&poi.text)))
                .collect(),
            in_flight: 0,
            serialize: false,
        }));
        let sections = Arc::new(Mutex::new(Vec::<PoiSection>::new()));
        let retry_candidates = Arc::new(Mutex::new(Vec::<(usize, Poi, String, String)>::new()));

        let workers = (0..concurrency).map(|worker_id| {
            let state = Arc::clone(&state);
            let sections = Arc::clone(&sections);
            let retry_candidates = Arc::clone(&retry_candidates);
            async move {
                loop {
                    let Some((idx, poi, heading)) = next_pending(&state, worker_id).await
                    else {
                        return;
                    };

                    let attempt = self.run_point_once(scope, idx, &poi, &heading, total_points).await;
                    match attempt {
                        Attempt::Success(result) => {
                            sections.lock().await.push(section_from_result(
                                idx, &poi, &heading, &result,
                            ));
                        }
                        Attempt::Retry(summary, backoff) => {
                            if backoff {
                                let mut guard = state.lock().await;
                                if !guard.serialize {
                                    warn!(
                                        "retryable PoI failure, draining and serializing \
                                         remaining work"
                                    );
                                    guard.serialize = true;
                                }
                            }
                            retry_candidates.lock().await.push((idx, poi, heading, summary));
                        }
                    }

                    state.lock().await.in_flight -= 1;
                }
            }
        });
        futures_util::future::join_all(workers).await;

        // Pipeline-level retry with jitter, then placeholders for the rest
        let mut sections = sections.lock().await.clone();
        let mut candidates = retry_candidates.lock().await.clone();
        candidates.sort_by_key(|(idx, ..)| *idx);

        for (idx, poi, heading, first_error) in candidates {
            let jitter = {
                let mut rng = rand::rng();
                Duration::from_secs_f64(rng.random_range(0.0..1.0))
            };
            tokio::time::sleep(jitter).await;

            match self.run_point_once(scope, idx, &poi, &heading, total_points).await {
                Attempt::Success(result) => {
                    sections.push(section_from_result(idx, &poi, &heading, &result));
                }
                Attempt::Retry(retry_error, _) => {
                    warn!("PoI {idx} failed after retry: {retry_error}");
                    sections.push(PoiSection {
                        index: idx,
                        heading: heading.clone(),
                        body: failure_markdown(idx, total_points, &poi, &heading, &first_error, &retry_error),
                        failed: true,
                        referenced_files: Vec::new(),
                        poi,
                    });
                }
            }
        }

        sections.sort_by_key(|s| s.index);
        debug_assert_eq!(sections.len(), total_points);

        // Unreferenced listing: scope files minus the union of referenced files
        let mut referenced: Vec<&str> = sections
            .iter()
            .flat_map(|s| s.referenced_files.iter().map(String::as_str))
            .collect();
        referenced.sort_unstable();
        referenced.dedup();
        let unreferenced_files: Vec<String> = plan
            .scope_files
            .iter()
            .filter(|f| referenced.binary_search(&f.as_str()).is_err())
            .cloned()
            .collect();

        let serialized = state.lock().await.serialize;
        Ok(MapperRun {
            overview: plan.overview,
            sections,
            scope_files: plan.scope_files,
            unreferenced_files,
            total_points,
            serialized,
        })
    }

    /// One research attempt for one PoI.
    async fn run_point_once(
        &self,
        scope: &str,
        idx: usize,
        poi: &Poi,
        heading: &str,
        total_points: usize,
    ) -> Attempt {
        info!("processing point of interest {idx}/{total_points}: {heading}");
        let query = build_section_query(scope, poi);

        match self.research.deep_research(&query).await {
            Ok(result) => {
                if is_empty_research_result(&result) {
                    warn!("point of interest {idx} returned no usable content (will retry)");
                    Attempt::Retry("empty result".to_string(), false)
                } else {
                    Attempt::Success(Box::new(result))
                }
            }
            Err(e) => {
                let retryable = match &e {
                    Error::Llm(llm_err) => llm_err.is_retryable(),
                    other => is_retryable_message(&other.to_string()),
                };
                if retryable {
                    warn!("deep research failed for point {idx}: {e}");
                    Attempt::Retry(format!("{e}"), true)
                } else {
                    // Non-retryable failures also become placeholders; a
                    // single broken PoI must not sink the whole document set
                    warn!("deep research failed terminally for point {idx}: {e}");
                    Attempt::Retry(format!("{e}"), false)
                }
            }
        }
    }
}

/// Pops the next pending PoI. Returns `None` when the queue is empty or the
/// serialize flag retired this worker. Worker 0 waits for in-flight work to
/// drain before continuing serially.
async fn next_pending(
    state: &Arc<Mutex<QueueState>>,
    worker_id: usize,
) -> Option<(usize, Poi, String)> {
    loop {
        {
            let mut guard = state.lock().await;
            if guard.pending.is_empty() {
                return None;
            }
            if !guard.serialize || (worker_id == 0 && guard.in_flight == 0) {
                let item = guard.pending.pop_front();
                if item.is_some() {
                    guard.in_flight += 1;
                }
                return item;
            }
            if guard.serialize && worker_id != 0 {
                return None;
            }
        }
        // Worker 0 under the serialize flag: wait for in-flight work to drain
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Resolves PoI concurrency: explicit jobs clamp to the PoI count, auto mode
/// picks `min(4, N)`.
///
/// # Errors
///
/// Returns [`MapperError::InvalidConcurrency`] for `jobs = 0`.
pub fn resolve_poi_concurrency(
    jobs: Option<usize>,
    total_points: usize,
) -> Result<usize, MapperError> {
    match jobs {
        Some(0) => Err(MapperError::InvalidConcurrency(
            "poi jobs must be >= 1".to_string(),
        )),
        Some(requested) => Ok(requested.min(total_points.max(1))),
        None if total_points <= 1 => Ok(1),
        None => Ok(4.min(total_points)),
    }
}

/// Whether a research result is unusable despite succeeding.
#[must_use]
pub fn is_empty_research_result(result: &ResearchResult) -> bool {
    result.metadata.skipped_synthesis || result.answer.trim().is_empty()
}

fn build_section_query(scope: &str, poi: &Poi) -> String {
    match poi.mode {
        super::models::PoiMode::Operational => format!(
            "Expand the following OPERATIONAL point of interest into a detailed, \
             operator/runbook-style documentation section for the scoped folder \
             '{scope}'.\n\n\
             Focus on step-by-step workflows and 'how to run this end-to-end' \
             guidance grounded in the code:\n\
             - Setup and local run path (commands only when supported by repo evidence)\n\
             - Configuration (env vars, config files) only when supported by repo evidence\n\
             - Common workflows/recipes\n\
             - Troubleshooting/common failure modes and fixes\n\n\
             Point of interest:\n{}\n\n\
             Use markdown headings and bullet lists as needed. It is acceptable for \
             this section to be long and detailed as long as it remains grounded in \
             the code.",
            poi.text
        ),
        super::models::PoiMode::Architectural => format!(
            "Expand the following ARCHITECTURAL point of interest into a detailed, \
             agent-facing documentation section for the scoped folder '{scope}'. \
             Explain how the relevant code and configuration implement this behavior, \
             including responsibilities, key types, important flows, and operational \
             constraints.\n\n\
             Point of interest:\n{}\n\n\
             Use markdown headings and bullet lists as needed. It is acceptable for \
             this section to be long and detailed as long as it remains grounded in \
             the code.",
            poi.text
        ),
    }
}

fn section_from_result(
    idx: usize,
    poi: &Poi,
    heading: &str,
    result: &ResearchResult,
) -> PoiSection {
    PoiSection {
        index: idx,
        poi: poi.clone(),
        heading: heading.to_string(),
        body: result.answer.clone(),
        failed: false,
        referenced_files: result.metadata.referenced_files.clone(),
    }
}

fn failure_markdown(
    idx: usize,
    total: usize,
    poi: &Poi,
    heading: &str,
    first_error: &str,
    retry_error: &str,
) -> String {
    format!(
        "# {heading} (failed)\n\n\
         This point of interest failed to generate content after a retry.\n\n\
         - Point of interest ({idx}/{total}): {}\n\
         - First attempt: {first_error}\n\
         - Retry attempt: {retry_error}\n",
        poi.text
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::models::PoiMode;
    use crate::research::ResearchMetadata;

    #[test]
    fn test_resolve_concurrency_auto() {
        assert_eq!(resolve_poi_concurrency(None, 1).unwrap_or(0), 1);
        assert_eq!(resolve_poi_concurrency(None, 3).unwrap_or(0), 3);
        assert_eq!(resolve_poi_concurrency(None, 13).unwrap_or(0), 4);
    }

    #[test]
    fn test_resolve_concurrency_explicit_clamped() {
        assert_eq!(resolve_poi_concurrency(Some(10), 4).unwrap_or(0), 4);
        assert_eq!(resolve_poi_concurrency(Some(2), 13).unwrap_or(0), 2);
    }

    #[test]
    fn test_resolve_concurrency_zero_rejected() {
        assert!(resolve_poi_concurrency(Some(0), 5).is_err());
    }

    #[test]
    fn test_empty_result_detection() {
        let empty = ResearchResult {
            answer: "   ".to_string(),
            metadata: ResearchMetadata::default(),
        };
        assert!(is_empty_research_result(&empty));

        let skipped = ResearchResult {
            answer: "guidance text".to_string(),
            metadata: ResearchMetadata {
                skipped_synthesis: true,
                ..ResearchMetadata::default()
            },
        };
        assert!(is_empty_research_result(&skipped));

        let real = ResearchResult {
            answer: "a real answer [1]".to_string(),
            metadata: ResearchMetadata::default(),
        };
        assert!(!is_empty_research_result(&real));
    }

    #[test]
    fn test_failure_markdown_contents() {
        let poi = Poi {
            mode: PoiMode::Architectural,
            text: "**Topic** — details".to_string(),
        };
        let md = failure_markdown(2, 13, &poi, "Topic", "timeout", "rate limit");
        assert!(md.starts_with("# Topic (failed)"));
        assert!(md.contains("(2/13)"));
        assert!(md.contains("First attempt: timeout"));
        assert!(md.contains("Retry attempt: rate limit"));
    }

    #[test]
    fn test_section_query_modes() {
        let ops = Poi {
            mode: PoiMode::Operational,
            text: "Quickstart".to_string(),
        };
        assert!(build_section_query("src/", &ops).contains("OPERATIONAL"));
        let arch = Poi {
            mode: PoiMode::Architectural,
            text: "Core engine".to_string(),
        };
        assert!(build_section_query("src/", &arch).contains("ARCHITECTURAL"));
    }

    #[tokio::test]
    async fn test_queue_serialize_retires_nonzero_workers() {
        let state = Arc::new(Mutex::new(QueueState {
            pending: VecDeque::from([(
                1,
                Poi {
                    mode: PoiMode::Architectural,
                    text: "t".to_string(),
                },
                "t".to_string(),
            )]),
            in_flight: 0,
            serialize: true,
        }));

        // Worker 1 must retire immediately under the serialize flag
        assert!(next_pending(&state, 1).await.is_none());
        // Worker 0 picks the item since nothing is in flight
        assert!(next_pending(&state, 0).await.is_some());
    }

    #[tokio::test]
    async fn test_queue_empty_returns_none() {
        let state = Arc::new(Mutex::new(QueueState {
            pending: VecDeque::new(),
            in_flight: 0,
            serialize: false,
        }));
        assert!(next_pending(&state, 0).await.is_none());
    }
}
