//! Collection runs, their statistics and incomplete-record lists

use chrono::{SubsecRound, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::models::{CollectionRun, IncompleteRecord, RunStatistics, RunStatus};
use super::db::{format_timestamp, parse_timestamp};
use super::DatabaseError;

/// Repository for CollectionRun operations
pub struct RunRepo<'a> {
    conn: &'a Connection,
}

impl<'a> RunRepo<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Create a run and its zeroed statistics row
    pub fn create(
        &self,
        query_text: &str,
        description: Option<&str>,
        max_results: Option<usize>,
    ) -> Result<CollectionRun, DatabaseError> {
        // stored with microsecond precision
        let created_at = Utc::now().trunc_subsecs(6);
        let tx = self.conn.unchecked_transaction()?;

        tx.execute(
            "INSERT INTO collection_runs (query_text, description, max_results, created_at)
             VALUES (?, ?, ?, ?)",
            params![
                query_text,
                description,
                max_results.map(|m| m as i64),
                format_timestamp(&created_at),
            ],
        )?;
        let id = tx.last_insert_rowid();

        tx.execute(
            "INSERT INTO run_statistics (run_id, status, updated_at) VALUES (?, ?, ?)",
            params![id, RunStatus::Running.as_str(), format_timestamp(&created_at)],
        )?;
        tx.commit()?;

        Ok(CollectionRun {
            id,
            query_text: query_text.to_string(),
            description: description.map(String::from),
            max_results,
            created_at,
        })
    }

    pub fn get(&self, id: i64) -> Result<Option<CollectionRun>, DatabaseError> {
        let run = self
            .conn
            .query_row(
                "SELECT id, query_text, description, max_results, created_at
                 FROM collection_runs WHERE id = ?",
                [id],
                |row| row_to_run(row),
            )
            .optional()?;
        Ok(run)
    }

    /// Most recent runs first
    pub fn list(&self, limit: i64) -> Result<Vec<(CollectionRun, RunStatus)>, DatabaseError> {
        let mut stmt = self.conn.prepare(
            "SELECT r.id, r.query_text, r.description, r.max_results, r.created_at,
                    COALESCE(s.status, 'running') AS status
             FROM collection_runs r LEFT JOIN run_statistics s ON s.run_id = r.id
             ORDER BY r.id DESC LIMIT ?",
        )?;
        let rows = stmt.query_map([limit], |row| {
            let status: String = row.get("status")?;
            Ok((row_to_run(row)?, RunStatus::from_str(&status)))
        })?;

        let mut runs = Vec::new();
        for row in rows {
            runs.push(row?);
        }
        Ok(runs)
    }

    /// Checkpoint the counters of a running run
    pub fn save_statistics(&self, run_id: i64, stats: &RunStatistics) -> Result<(), DatabaseError> {
        self.write_statistics(run_id, stats, RunStatus::Running)
    }

    /// Persist final counters; afterwards the run is immutable
    pub fn finalize(
        &self,
        run_id: i64,
        stats: &RunStatistics,
        status: RunStatus,
    ) -> Result<(), DatabaseError> {
        self.write_statistics(run_id, stats, status)
    }

    fn write_statistics(
        &self,
        run_id: i64,
        stats: &RunStatistics,
        status: RunStatus,
    ) -> Result<(), DatabaseError> {
        let now = format_timestamp(&Utc::now());
        let finished_at = (status != RunStatus::Running).then(|| now.clone());

        let updated = self.conn.execute(
            "UPDATE run_statistics SET
                status = ?, found = ?, processed = ?, with_full_text = ?, with_enrichment = ?,
                incomplete = ?, failed = ?, skipped = ?, enriched_existing = ?,
                updated_at = ?, finished_at = ?
             WHERE run_id = ? AND status = 'running'",
            params![
                status.as_str(),
                stats.found as i64,
                stats.processed as i64,
                stats.with_full_text as i64,
                stats.with_enrichment as i64,
                stats.incomplete as i64,
                stats.failed as i64,
                stats.skipped as i64,
                stats.enriched_existing as i64,
                now,
                finished_at,
                run_id,
            ],
        )?;

        if updated == 0 {
            return Err(DatabaseError::Conflict(format!(
                "run {} is not running; its statistics are final",
                run_id
            )));
        }
        Ok(())
    }

    pub fn statistics(&self, run_id: i64) -> Result<Option<(RunStatistics, RunStatus)>, DatabaseError> {
        let result = self
            .conn
            .query_row(
                "SELECT * FROM run_statistics WHERE run_id = ?",
                [run_id],
                |row| {
                    let status: String = row.get("status")?;
                    let get = |col: &str| -> rusqlite::Result<u64> { Ok(row.get::<_, i64>(col)? as u64) };
                    Ok((
                        RunStatistics {
                            found: get("found")?,
                            processed: get("processed")?,
                            with_full_text: get("with_full_text")?,
                            with_enrichment: get("with_enrichment")?,
                            incomplete: get("incomplete")?,
                            failed: get("failed")?,
                            skipped: get("skipped")?,
                            enriched_existing: get("enriched_existing")?,
                        },
                        RunStatus::from_str(&status),
                    ))
                },
            )
            .optional()?;
        Ok(result)
    }

    /// Record that a persisted record ended up without full text
    pub fn record_incomplete(&self, entry: &IncompleteRecord) -> Result<(), DatabaseError> {
        self.conn.execute(
            "INSERT INTO incomplete_records (run_id, primary_id, secondary_id, reason, recorded_at)
             VALUES (?, ?, ?, ?, ?)",
            params![
                entry.run_id,
                entry.primary_id,
                entry.secondary_id,
                entry.reason,
                format_timestamp(&entry.recorded_at),
            ],
        )?;
        Ok(())
    }

    pub fn incomplete(&self, run_id: i64) -> Result<Vec<IncompleteRecord>, DatabaseError> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, primary_id, secondary_id, reason, recorded_at
             FROM incomplete_records WHERE run_id = ? ORDER BY id",
        )?;
        let rows = stmt.query_map([run_id], |row| {
            let recorded_at: String = row.get(4)?;
            Ok(IncompleteRecord {
                run_id: row.get(0)?,
                primary_id: row.get(1)?,
                secondary_id: row.get(2)?,
                reason: row.get(3)?,
                recorded_at: parse_timestamp(&recorded_at),
            })
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }
}

fn row_to_run(row: &Row) -> rusqlite::Result<CollectionRun> {
    let created_at: String = row.get("created_at")?;
    let max_results: Option<i64> = row.get("max_results")?;
    Ok(CollectionRun {
        id: row.get("id")?,
        query_text: row.get("query_text")?,
        description: row.get("description")?,
        max_results: max_results.map(|m| m as usize),
        created_at: parse_timestamp(&created_at),
    })
}
