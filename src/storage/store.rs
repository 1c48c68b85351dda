//! Thread-safe record store shared by the pipeline workers
//!
//! Wraps one SQLite connection in a mutex so every write is serialized.
//! The repositories do the actual SQL.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, OpenFlags};
use tracing::info;

use crate::models::{CollectionRun, IncompleteRecord, Record, RunStatistics, RunStatus};
use super::dedup::{self, DedupMode, DedupReport, DedupStrategy};
use super::record_repo::{DuplicateGroup, MergeReport, RecordRepo, StoreStatistics};
use super::run_repo::RunRepo;
use super::{open_database, DatabaseError};

pub struct RecordStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl RecordStore {
    /// Open (creating and migrating if needed) the store at `path`
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        let db = open_database(path)?;
        Ok(Self {
            conn: Mutex::new(db.conn),
            path: db.path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn exists(&self, primary_id: &str) -> Result<bool, DatabaseError> {
        RecordRepo::new(&self.conn()).exists(primary_id)
    }

    /// `(needs_enrichment, record)` looked up by primary then secondary id
    pub fn needs_enrichment(&self, key: &str) -> Result<(bool, Option<Record>), DatabaseError> {
        RecordRepo::new(&self.conn()).needs_enrichment(key)
    }

    /// Insert or replace; returns `true` when the row is new
    pub fn upsert(&self, record: &Record) -> Result<bool, DatabaseError> {
        RecordRepo::new(&self.conn()).upsert(record)
    }

    pub fn get(&self, primary_id: &str) -> Result<Option<Record>, DatabaseError> {
        RecordRepo::new(&self.conn()).get(primary_id)
    }

    pub fn get_by_secondary(&self, secondary_id: &str) -> Result<Vec<Record>, DatabaseError> {
        RecordRepo::new(&self.conn()).get_by_secondary(secondary_id)
    }

    pub fn records_without_full_text(&self, limit: i64) -> Result<Vec<Record>, DatabaseError> {
        RecordRepo::new(&self.conn()).without_full_text(limit)
    }

    /// Records last written by `run_id`, oldest first
    pub fn records_for_run(&self, run_id: i64) -> Result<Vec<Record>, DatabaseError> {
        RecordRepo::new(&self.conn()).for_run(run_id)
    }

    pub fn count_for_run(&self, run_id: i64) -> Result<u64, DatabaseError> {
        RecordRepo::new(&self.conn()).count_for_run(run_id)
    }

    /// Fold every record of the store at `source` into this one
    ///
    /// The source is opened read-only and left untouched. The whole merge is
    /// one transaction, so a failure leaves this store as it was.
    pub fn merge_from(&self, source: &Path) -> Result<MergeReport, DatabaseError> {
        if !source.exists() {
            return Err(DatabaseError::ConnectionFailed(format!(
                "No record store at {}",
                source.display()
            )));
        }
        if let (Ok(a), Ok(b)) = (source.canonicalize(), self.path.canonicalize()) {
            if a == b {
                return Err(DatabaseError::Conflict("Cannot merge a store into itself".into()));
            }
        }

        let other = Connection::open_with_flags(source, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?;
        let incoming = RecordRepo::new(&other).all()?;
        info!("Merging {} records from {}", incoming.len(), source.display());

        let report = RecordRepo::new(&self.conn()).merge_records(incoming)?;
        info!("Merge finished: {} inserted, {} merged", report.inserted, report.merged);
        Ok(report)
    }

    pub fn statistics(&self) -> Result<StoreStatistics, DatabaseError> {
        RecordRepo::new(&self.conn()).statistics()
    }

    pub fn duplicate_groups(&self) -> Result<Vec<DuplicateGroup>, DatabaseError> {
        RecordRepo::new(&self.conn()).duplicate_groups()
    }

    pub fn create_run(
        &self,
        query_text: &str,
        description: Option<&str>,
        max_results: Option<usize>,
    ) -> Result<CollectionRun, DatabaseError> {
        RunRepo::new(&self.conn()).create(query_text, description, max_results)
    }

    pub fn list_runs(&self, limit: i64) -> Result<Vec<(CollectionRun, RunStatus)>, DatabaseError> {
        RunRepo::new(&self.conn()).list(limit)
    }

    pub fn checkpoint_run(&self, run_id: i64, stats: &RunStatistics) -> Result<(), DatabaseError> {
        RunRepo::new(&self.conn()).save_statistics(run_id, stats)
    }

    pub fn finalize_run(
        &self,
        run_id: i64,
        stats: &RunStatistics,
        status: RunStatus,
    ) -> Result<(), DatabaseError> {
        RunRepo::new(&self.conn()).finalize(run_id, stats, status)
    }

    pub fn run_statistics(&self, run_id: i64) -> Result<Option<(RunStatistics, RunStatus)>, DatabaseError> {
        RunRepo::new(&self.conn()).statistics(run_id)
    }

    pub fn record_incomplete(&self, entry: &IncompleteRecord) -> Result<(), DatabaseError> {
        RunRepo::new(&self.conn()).record_incomplete(entry)
    }

    pub fn incomplete_records(&self, run_id: i64) -> Result<Vec<IncompleteRecord>, DatabaseError> {
        RunRepo::new(&self.conn()).incomplete(run_id)
    }

    /// Run a duplicate-resolution strategy; dry-run unless `mode` says apply
    pub fn resolve_duplicates(
        &self,
        strategy: DedupStrategy,
        mode: DedupMode,
    ) -> Result<DedupReport, DatabaseError> {
        dedup::resolve_duplicates(&self.conn(), strategy, mode)
    }

    pub fn export_duplicates(&self, path: &Path) -> Result<usize, DatabaseError> {
        dedup::export_for_review(&self.conn(), path)
    }
}
