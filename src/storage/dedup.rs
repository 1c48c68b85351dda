//! Resolution of records that share a secondary identifier
//!
//! Every strategy first builds a plan per group. In dry-run mode the plan is
//! only reported. In apply mode each group is re-read inside a transaction
//! and the plan is refused with [`DatabaseError::Conflict`] if the group
//! changed since it was planned.

use chrono::Utc;
use rusqlite::Connection;
use serde::Serialize;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

use crate::models::{merge, Record};
use super::db::format_timestamp;
use super::record_repo::{refresh_duplicate_candidate, write_record, RecordRepo};
use super::DatabaseError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DedupStrategy {
    /// Keep the most recently collected record
    KeepRecent,
    /// Keep the record with full text, falling back to the most recent
    KeepMostComplete,
    /// Keep the most recent record with empty fields filled from the rest
    Merge,
    /// Report only
    ExportForReview,
}

impl DedupStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DedupStrategy::KeepRecent => "keep-recent",
            DedupStrategy::KeepMostComplete => "keep-most-complete",
            DedupStrategy::Merge => "merge",
            DedupStrategy::ExportForReview => "export-for-review",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "keep-recent" => Some(DedupStrategy::KeepRecent),
            "keep-most-complete" | "keep-fulltext" => Some(DedupStrategy::KeepMostComplete),
            "merge" => Some(DedupStrategy::Merge),
            "export-for-review" | "export" => Some(DedupStrategy::ExportForReview),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DedupMode {
    #[default]
    DryRun,
    Apply,
}

/// What a strategy intends to do with one group
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupPlan {
    pub secondary_id: String,
    /// Members newest first, as they were when planned
    pub members: Vec<String>,
    /// `None` for export-for-review
    pub keep: Option<String>,
    pub remove: Vec<String>,
    #[serde(skip)]
    pub merged: Option<Record>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DedupReport {
    pub strategy: DedupStrategy,
    pub mode: DedupMode,
    pub groups: usize,
    pub records_removed: usize,
    pub records_merged: usize,
    pub plans: Vec<GroupPlan>,
}

/// Pick the record to keep from a group ordered newest first
pub fn choose_keeper(strategy: DedupStrategy, members: &[Record]) -> Option<usize> {
    if members.is_empty() {
        return None;
    }
    match strategy {
        DedupStrategy::KeepRecent | DedupStrategy::Merge => Some(0),
        DedupStrategy::KeepMostComplete => {
            // members are newest first, so the first hit is the most recent
            Some(members.iter().position(Record::has_full_text).unwrap_or(0))
        }
        DedupStrategy::ExportForReview => None,
    }
}

/// Build the plan for one group
pub fn plan_group(strategy: DedupStrategy, secondary_id: &str, members: &[Record]) -> GroupPlan {
    let ids: Vec<String> = members.iter().map(|r| r.primary_id.clone()).collect();
    let keeper = choose_keeper(strategy, members);

    let merged = match (strategy, keeper) {
        (DedupStrategy::Merge, Some(k)) => Some(
            members
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != k)
                .fold(members[k].clone(), |acc, (_, other)| merge(&acc, other)),
        ),
        _ => None,
    };

    GroupPlan {
        secondary_id: secondary_id.to_string(),
        keep: keeper.map(|k| ids[k].clone()),
        remove: match keeper {
            Some(k) => ids.iter().enumerate().filter(|(i, _)| *i != k).map(|(_, id)| id.clone()).collect(),
            None => Vec::new(),
        },
        members: ids,
        merged,
    }
}

/// Plan (and in apply mode, execute) a strategy over every duplicate group
pub fn resolve_duplicates(
    conn: &Connection,
    strategy: DedupStrategy,
    mode: DedupMode,
) -> Result<DedupReport, DatabaseError> {
    let repo = RecordRepo::new(conn);
    let groups = repo.duplicate_groups()?;
    info!(
        "Resolving {} duplicate group(s) with {} ({:?})",
        groups.len(),
        strategy.as_str(),
        mode
    );

    let mut plans = Vec::with_capacity(groups.len());
    for group in &groups {
        let members = repo.get_by_secondary(&group.secondary_id)?;
        plans.push(plan_group(strategy, &group.secondary_id, &members));
    }

    let report = DedupReport {
        strategy,
        mode,
        groups: plans.len(),
        records_removed: plans.iter().map(|p| p.remove.len()).sum(),
        records_merged: plans.iter().filter(|p| p.merged.is_some()).count(),
        plans,
    };

    if mode == DedupMode::Apply && strategy != DedupStrategy::ExportForReview {
        for plan in &report.plans {
            apply_plan(conn, plan)?;
        }
        info!(
            "Removed {} record(s) across {} group(s)",
            report.records_removed, report.groups
        );
    }

    Ok(report)
}

fn apply_plan(conn: &Connection, plan: &GroupPlan) -> Result<(), DatabaseError> {
    let Some(keep) = plan.keep.as_deref() else {
        return Ok(());
    };

    let tx = conn.unchecked_transaction()?;
    let current: Vec<String> = RecordRepo::new(&tx)
        .get_by_secondary(&plan.secondary_id)?
        .into_iter()
        .map(|r| r.primary_id)
        .collect();

    if current != plan.members {
        warn!(
            "Duplicate group {} changed since planning: {:?} -> {:?}",
            plan.secondary_id, plan.members, current
        );
        return Err(DatabaseError::Conflict(format!(
            "duplicate group {} changed since it was planned",
            plan.secondary_id
        )));
    }

    if let Some(merged) = &plan.merged {
        if merged.primary_id != keep {
            return Err(DatabaseError::Conflict(format!(
                "merge target {} does not match kept record {}",
                merged.primary_id, keep
            )));
        }
        write_record(&tx, merged)?;
    }

    let repo = RecordRepo::new(&tx);
    for id in &plan.remove {
        repo.delete(id)?;
    }
    refresh_duplicate_candidate(&tx, &plan.secondary_id)?;
    tx.commit()?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct ReviewRecord<'a> {
    primary_id: &'a str,
    title: Option<&'a str>,
    journal: Option<&'a str>,
    year: Option<i32>,
    archive_id: Option<&'a str>,
    has_abstract: bool,
    has_full_text: bool,
    enrichment_retrieved: bool,
    collection_run_id: Option<i64>,
    collected_at: String,
}

#[derive(Debug, Serialize)]
struct ReviewGroup<'a> {
    secondary_id: &'a str,
    count: usize,
    records: Vec<ReviewRecord<'a>>,
}

#[derive(Debug, Serialize)]
struct ReviewExport<'a> {
    export_date: String,
    total_duplicate_groups: usize,
    total_duplicate_entries: usize,
    groups: Vec<ReviewGroup<'a>>,
}

/// Write every duplicate group to `path` for manual inspection
///
/// Returns the number of groups written. Nothing in the store changes.
pub fn export_for_review(conn: &Connection, path: &Path) -> Result<usize, DatabaseError> {
    let repo = RecordRepo::new(conn);
    let mut loaded: Vec<(String, Vec<Record>)> = Vec::new();
    for group in repo.duplicate_groups()? {
        let members = repo.get_by_secondary(&group.secondary_id)?;
        loaded.push((group.secondary_id, members));
    }

    let groups: Vec<ReviewGroup> = loaded
        .iter()
        .map(|(secondary_id, members)| ReviewGroup {
            secondary_id,
            count: members.len(),
            records: members
                .iter()
                .map(|r| ReviewRecord {
                    primary_id: &r.primary_id,
                    title: r.title.as_deref(),
                    journal: r.journal.as_deref(),
                    year: r.year,
                    archive_id: r.archive_id.as_deref(),
                    has_abstract: r.has_abstract(),
                    has_full_text: r.has_full_text(),
                    enrichment_retrieved: r.enrichment_retrieved,
                    collection_run_id: r.collection_run_id,
                    collected_at: format_timestamp(&r.collected_at),
                })
                .collect(),
        })
        .collect();

    let export = ReviewExport {
        export_date: format_timestamp(&Utc::now()),
        total_duplicate_groups: groups.len(),
        total_duplicate_entries: groups.iter().map(|g| g.count).sum(),
        groups,
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| DatabaseError::QueryFailed(format!("Failed to create {:?}: {}", parent, e)))?;
    }
    let json = serde_json::to_string_pretty(&export)?;
    fs::write(path, json)
        .map_err(|e| DatabaseError::QueryFailed(format!("Failed to write {:?}: {}", path, e)))?;

    info!("Exported {} duplicate group(s) to {:?}", export.total_duplicate_groups, path);
    Ok(export.total_duplicate_groups)
}
