//! Pipeline services
//!
//! These coordinate the adapters and the store:
//! - search: query resolution past the result-window cap
//! - extraction: full-text fallback chain and content-quality gate
//! - enrichment: citation-graph lookups, single and batched
//! - orchestrator: the batch run itself

pub mod enrichment;
pub mod extraction;
pub mod orchestrator;
pub mod search;

pub use enrichment::EnrichmentClient;
pub use extraction::{assess_content, ExtractedText, ExtractionChain, Verdict};
pub use orchestrator::{BatchOrchestrator, Services};
pub use search::PaginatedSearch;
