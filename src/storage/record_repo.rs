//! Record repository for database operations on harvested records

use chrono::Utc;
use indexmap::IndexMap;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use crate::models::{merge, EnrichmentFields, Record, Topic};
use super::db::{format_timestamp, parse_timestamp};
use super::DatabaseError;

const RECORD_COLUMNS: &str = "primary_id, secondary_id, archive_id, title, abstract, full_text,
    full_text_sections_json, has_full_text, authors_json, mesh_terms_json, keywords_json,
    journal, year, date_published, source, cited_by_count, citation_normalized_percentile,
    fwci, oa_url, primary_topic_json, enrichment_retrieved, collection_run_id, collected_at";

/// Store-wide counters
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct StoreStatistics {
    pub total_records: u64,
    pub with_full_text: u64,
    pub with_abstract: u64,
    pub with_enrichment: u64,
    pub distinct_secondary_ids: u64,
    pub duplicate_groups: u64,
    pub incomplete_entries: u64,
    pub runs: u64,
}

/// Outcome of folding another store's records into this one
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct MergeReport {
    /// Records that were not present before
    pub inserted: u64,
    /// Existing records combined with an incoming copy
    pub merged: u64,
}

/// A secondary identifier shared by several records
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateGroup {
    pub secondary_id: String,
    pub count: u64,
}

/// Repository for Record operations
pub struct RecordRepo<'a> {
    conn: &'a Connection,
}

impl<'a> RecordRepo<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Get a record by primary identifier
    pub fn get(&self, primary_id: &str) -> Result<Option<Record>, DatabaseError> {
        let sql = format!("SELECT {} FROM records WHERE primary_id = ?", RECORD_COLUMNS);
        let record = self
            .conn
            .query_row(&sql, [primary_id], |row| row_to_record(row))
            .optional()?;
        Ok(record)
    }

    /// All records sharing a secondary identifier, newest first
    ///
    /// Ties on `collected_at` are broken by primary identifier so the order
    /// is deterministic.
    pub fn get_by_secondary(&self, secondary_id: &str) -> Result<Vec<Record>, DatabaseError> {
        let sql = format!(
            "SELECT {} FROM records WHERE secondary_id = ? ORDER BY collected_at DESC, primary_id",
            RECORD_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([secondary_id], |row| row_to_record(row))?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    /// Check if a record exists
    pub fn exists(&self, primary_id: &str) -> Result<bool, DatabaseError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM records WHERE primary_id = ?",
            [primary_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Look a record up by primary identifier, falling back to secondary
    ///
    /// Returns whether the record needs enrichment (exists but lacks an
    /// abstract or full text) together with the stored record.
    pub fn needs_enrichment(&self, key: &str) -> Result<(bool, Option<Record>), DatabaseError> {
        let record = match self.get(key)? {
            Some(record) => Some(record),
            None => self.get_by_secondary(key)?.into_iter().next(),
        };
        Ok(match record {
            Some(record) => (record.needs_enrichment(), Some(record)),
            None => (false, None),
        })
    }

    /// Insert or replace a record keyed by primary identifier
    ///
    /// Runs in one transaction: either the whole row (and duplicate
    /// bookkeeping) is written or the previous row is left untouched.
    /// Returns `true` if the row did not exist before.
    pub fn upsert(&self, record: &Record) -> Result<bool, DatabaseError> {
        let tx = self.conn.unchecked_transaction()?;
        let previous = stored_secondary_id(&tx, &record.primary_id)?;

        write_record(&tx, record)?;
        refresh_secondary_ids(
            &tx,
            previous.as_ref().and_then(|p| p.as_deref()),
            record.secondary_id.as_deref(),
        )?;

        tx.commit()?;
        Ok(previous.is_none())
    }

    /// Fold `incoming` records into this store in one transaction
    ///
    /// A record already present is combined with its incoming copy through
    /// [`merge`], the stored copy taking precedence for identifiers. Run ids
    /// refer to the other store's runs and are dropped.
    pub fn merge_records(&self, incoming: Vec<Record>) -> Result<MergeReport, DatabaseError> {
        let tx = self.conn.unchecked_transaction()?;
        let repo = RecordRepo::new(&tx);
        let mut report = MergeReport::default();

        for mut record in incoming {
            record.collection_run_id = None;
            let existing = repo.get(&record.primary_id)?;
            let folded = match existing.as_ref() {
                Some(stored) => {
                    report.merged += 1;
                    merge(stored, &record)
                }
                None => {
                    report.inserted += 1;
                    record
                }
            };
            write_record(&tx, &folded)?;
            refresh_secondary_ids(
                &tx,
                existing.as_ref().and_then(|r| r.secondary_id.as_deref()),
                folded.secondary_id.as_deref(),
            )?;
        }

        tx.commit()?;
        Ok(report)
    }

    /// Every record, ordered by primary identifier
    pub fn all(&self) -> Result<Vec<Record>, DatabaseError> {
        let sql = format!("SELECT {} FROM records ORDER BY primary_id", RECORD_COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| row_to_record(row))?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    /// Records last written by one collection run
    pub fn for_run(&self, run_id: i64) -> Result<Vec<Record>, DatabaseError> {
        let sql = format!(
            "SELECT {} FROM records WHERE collection_run_id = ? ORDER BY collected_at, primary_id",
            RECORD_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([run_id], |row| row_to_record(row))?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    pub fn count_for_run(&self, run_id: i64) -> Result<u64, DatabaseError> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM records WHERE collection_run_id = ?",
            [run_id],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    /// Delete a record by primary identifier
    pub fn delete(&self, primary_id: &str) -> Result<bool, DatabaseError> {
        let deleted = self
            .conn
            .execute("DELETE FROM records WHERE primary_id = ?", [primary_id])?;
        Ok(deleted > 0)
    }

    /// Records stored without full text, oldest first
    pub fn without_full_text(&self, limit: i64) -> Result<Vec<Record>, DatabaseError> {
        let sql = format!(
            "SELECT {} FROM records WHERE has_full_text = 0 ORDER BY collected_at, primary_id LIMIT ?",
            RECORD_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([limit], |row| row_to_record(row))?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    /// Secondary identifiers shared by more than one record, largest group first
    pub fn duplicate_groups(&self) -> Result<Vec<DuplicateGroup>, DatabaseError> {
        let mut stmt = self.conn.prepare(
            "SELECT secondary_id, COUNT(*) AS n FROM records
             WHERE secondary_id IS NOT NULL AND secondary_id != ''
             GROUP BY secondary_id HAVING n > 1
             ORDER BY n DESC, secondary_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(DuplicateGroup {
                secondary_id: row.get(0)?,
                count: row.get::<_, i64>(1)? as u64,
            })
        })?;

        let mut groups = Vec::new();
        for row in rows {
            groups.push(row?);
        }
        Ok(groups)
    }

    pub fn statistics(&self) -> Result<StoreStatistics, DatabaseError> {
        let count = |sql: &str| -> Result<u64, DatabaseError> {
            let n: i64 = self.conn.query_row(sql, [], |row| row.get(0))?;
            Ok(n as u64)
        };

        Ok(StoreStatistics {
            total_records: count("SELECT COUNT(*) FROM records")?,
            with_full_text: count("SELECT COUNT(*) FROM records WHERE has_full_text = 1")?,
            with_abstract: count(
                "SELECT COUNT(*) FROM records WHERE abstract IS NOT NULL AND TRIM(abstract) != ''",
            )?,
            with_enrichment: count("SELECT COUNT(*) FROM records WHERE enrichment_retrieved = 1")?,
            distinct_secondary_ids: count(
                "SELECT COUNT(DISTINCT secondary_id) FROM records WHERE secondary_id IS NOT NULL AND secondary_id != ''",
            )?,
            duplicate_groups: count(
                "SELECT COUNT(*) FROM (SELECT secondary_id FROM records
                 WHERE secondary_id IS NOT NULL AND secondary_id != ''
                 GROUP BY secondary_id HAVING COUNT(*) > 1)",
            )?,
            incomplete_entries: count("SELECT COUNT(*) FROM incomplete_records")?,
            runs: count("SELECT COUNT(*) FROM collection_runs")?,
        })
    }
}

/// INSERT OR REPLACE one row; callers own the transaction
pub(crate) fn write_record(conn: &Connection, record: &Record) -> Result<(), DatabaseError> {
    let sections_json = serde_json::to_string(&record.full_text_sections)?;
    let authors_json = serde_json::to_string(&record.authors)?;
    let mesh_json = serde_json::to_string(&record.mesh_terms)?;
    let keywords_json = serde_json::to_string(&record.keywords)?;
    let enrichment = record.enrichment.clone().unwrap_or_default();
    let topic_json = enrichment
        .primary_topic
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO records ({}) VALUES
             (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            RECORD_COLUMNS
        ),
        params![
            record.primary_id,
            record.secondary_id,
            record.archive_id,
            record.title,
            record.abstract_text,
            record.full_text,
            sections_json,
            record.has_full_text(),
            authors_json,
            mesh_json,
            keywords_json,
            record.journal,
            record.year,
            record.date_published,
            record.source,
            enrichment.cited_by_count,
            enrichment.citation_normalized_percentile,
            enrichment.fwci,
            enrichment.oa_url,
            topic_json,
            record.enrichment_retrieved,
            record.collection_run_id,
            format_timestamp(&record.collected_at),
        ],
    )?;
    Ok(())
}

/// `Some(secondary_id)` of the stored row, `None` if there is no row
fn stored_secondary_id(conn: &Connection, primary_id: &str) -> Result<Option<Option<String>>, DatabaseError> {
    let previous = conn
        .query_row(
            "SELECT secondary_id FROM records WHERE primary_id = ?",
            [primary_id],
            |row| row.get::<_, Option<String>>(0),
        )
        .optional()?;
    Ok(previous)
}

/// Refresh the side table for a row's old and new secondary ids
fn refresh_secondary_ids(
    conn: &Connection,
    previous: Option<&str>,
    current: Option<&str>,
) -> Result<(), DatabaseError> {
    let current = current.filter(|s| !s.is_empty());
    if let Some(previous) = previous.filter(|s| !s.is_empty() && Some(*s) != current) {
        refresh_duplicate_candidate(conn, previous)?;
    }
    if let Some(current) = current {
        refresh_duplicate_candidate(conn, current)?;
    }
    Ok(())
}

/// Keep the duplicate side table in step with the records table
pub(crate) fn refresh_duplicate_candidate(
    conn: &Connection,
    secondary_id: &str,
) -> Result<(), DatabaseError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM records WHERE secondary_id = ?",
        [secondary_id],
        |row| row.get(0),
    )?;

    if count > 1 {
        let now = format_timestamp(&Utc::now());
        conn.execute(
            "INSERT INTO duplicate_candidates (secondary_id, record_count, first_seen_at, last_seen_at)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(secondary_id) DO UPDATE SET
                record_count = excluded.record_count,
                last_seen_at = excluded.last_seen_at",
            params![secondary_id, count, now],
        )?;
    } else {
        conn.execute(
            "DELETE FROM duplicate_candidates WHERE secondary_id = ?",
            [secondary_id],
        )?;
    }
    Ok(())
}

fn row_to_record(row: &Row) -> rusqlite::Result<Record> {
    let sections_json: String = row.get("full_text_sections_json")?;
    let full_text_sections: IndexMap<String, String> =
        serde_json::from_str(&sections_json).unwrap_or_default();

    let list = |col: &str| -> rusqlite::Result<Vec<String>> {
        let json: String = row.get(col)?;
        Ok(serde_json::from_str(&json).unwrap_or_default())
    };

    let enrichment_retrieved: bool = row.get("enrichment_retrieved")?;
    let enrichment = if enrichment_retrieved {
        let primary_topic: Option<Topic> = row
            .get::<_, Option<String>>("primary_topic_json")?
            .and_then(|j| serde_json::from_str(&j).ok());
        Some(EnrichmentFields {
            cited_by_count: row.get("cited_by_count")?,
            citation_normalized_percentile: row.get("citation_normalized_percentile")?,
            fwci: row.get("fwci")?,
            oa_url: row.get("oa_url")?,
            primary_topic,
        })
    } else {
        None
    };

    let collected_at: String = row.get("collected_at")?;

    Ok(Record {
        primary_id: row.get("primary_id")?,
        secondary_id: row.get("secondary_id")?,
        archive_id: row.get("archive_id")?,
        title: row.get("title")?,
        abstract_text: row.get("abstract")?,
        full_text: row.get("full_text")?,
        full_text_sections,
        authors: list("authors_json")?,
        mesh_terms: list("mesh_terms_json")?,
        keywords: list("keywords_json")?,
        journal: row.get("journal")?,
        year: row.get("year")?,
        date_published: row.get("date_published")?,
        source: row.get("source")?,
        enrichment,
        enrichment_retrieved,
        collection_run_id: row.get("collection_run_id")?,
        collected_at: parse_timestamp(&collected_at),
    })
}
