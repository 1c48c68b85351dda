use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One invocation of the pipeline against one query; immutable once created
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CollectionRun {
    pub id: i64,
    pub query_text: String,
    pub description: Option<String>,
    pub max_results: Option<usize>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "completed" => RunStatus::Completed,
            "failed" => RunStatus::Failed,
            _ => RunStatus::Running,
        }
    }
}

/// Aggregate counters for one run
///
/// `processed`, `incomplete`, `skipped` and `failed` are disjoint and cover
/// every identifier found. `with_full_text` and `with_enrichment` describe
/// the persisted records; `enriched_existing` counts re-fetches of records
/// that were already stored.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunStatistics {
    pub found: u64,
    pub processed: u64,
    pub with_full_text: u64,
    pub with_enrichment: u64,
    pub incomplete: u64,
    pub failed: u64,
    pub skipped: u64,
    pub enriched_existing: u64,
}

impl RunStatistics {
    /// Add another set of counters; order of application does not matter
    pub fn absorb(&mut self, other: &RunStatistics) {
        self.found += other.found;
        self.processed += other.processed;
        self.with_full_text += other.with_full_text;
        self.with_enrichment += other.with_enrichment;
        self.incomplete += other.incomplete;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.enriched_existing += other.enriched_existing;
    }

    pub fn accounted(&self) -> u64 {
        self.processed + self.incomplete + self.skipped + self.failed
    }
}

/// A persisted record that ended up without full text
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IncompleteRecord {
    pub run_id: i64,
    pub primary_id: String,
    pub secondary_id: Option<String>,
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
}

/// Outcome of a completed run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run: CollectionRun,
    pub statistics: RunStatistics,
    pub incomplete: Vec<IncompleteRecord>,
    /// Input DOIs that did not resolve to a primary id
    pub unresolved: Vec<String>,
    pub duration: Duration,
}

impl RunReport {
    pub fn summary(&self) -> String {
        let s = &self.statistics;
        let mut line = format!(
            "run {}: found {}, processed {}, skipped {}, incomplete {}, failed {} \
             (full text {}, enriched {}, re-fetched {}) in {:.1}s",
            self.run.id,
            s.found,
            s.processed,
            s.skipped,
            s.incomplete,
            s.failed,
            s.with_full_text,
            s.with_enrichment,
            s.enriched_existing,
            self.duration.as_secs_f64()
        );
        if !self.unresolved.is_empty() {
            line.push_str(&format!(", {} DOIs unresolved", self.unresolved.len()));
        }
        line
    }
}
