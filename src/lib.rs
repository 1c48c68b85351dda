//! Literature-review corpus harvester
//!
//! Resolves a PubMed query to its full identifier list, then collects
//! metadata, PMC full text and OpenAlex enrichment for every hit into a
//! local SQLite store that can be re-run and resumed safely.

pub mod adapters;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod services;
pub mod storage;
pub mod utils;

pub use config::HarvestConfig;
pub use error::{GatewayError, HarvestError};
pub use models::{Record, RunReport, RunStatistics};
pub use services::{BatchOrchestrator, Services};
pub use storage::{RecordStore, ResultCache};
