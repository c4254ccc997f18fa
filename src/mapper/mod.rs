//! Code mapper: HyDE-planned, per-PoI deep research over a scope.
//!
//! Two stages: a planning pass drafts architectural and operational points
//! of interest from the scope's file list and sampled code; a bounded work
//! queue then runs one deep research call per PoI, degrading to serial
//! execution on retryable provider failures. Outputs are a combined
//! document, an index, one topic file per PoI, and an unreferenced-files
//! listing.

mod hyde;
mod models;
mod pipeline;
mod render;

pub use hyde::{HydePlan, ensure_operational_quickstart, extract_points_of_interest,
    plan_points_of_interest};
pub use models::{DocMetadata, Poi, PoiMode, derive_heading_from_point, slugify};
pub use pipeline::{
    CodeMapperPipeline, MapperRun, PoiSection, is_empty_research_result, resolve_poi_concurrency,
};
pub use render::{RenderedDocs, render_run, safe_scope_label, write_docs};
