//! Multi-agent code review: schema types, output normalisation,
//! consolidation and the parallel orchestrator.

pub mod consolidate;
pub mod normalize;
pub mod orchestrator;
pub mod types;

pub use consolidate::consolidate;
pub use normalize::{extract_json_object, normalize_output, parse_error_payload};
pub use orchestrator::{ReviewOrchestrator, ReviewRun};
pub use types::{
    ConsolidatedReview, Finding, ReviewPayload, ReviewStats, Severity, Verdict, SCHEMA_VERSION,
};
