//! Database connection management and migrations

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Database error type
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Migration failed: {0}")]
    MigrationFailed(String),
    #[error("Query failed: {0}")]
    QueryFailed(String),
    #[error("JSON parse error: {0}")]
    JsonParseError(String),
    /// Stored state contradicts what an operation expected to find
    #[error("Persistence conflict: {0}")]
    Conflict(String),
}

impl From<rusqlite::Error> for DatabaseError {
    fn from(err: rusqlite::Error) -> Self {
        DatabaseError::QueryFailed(err.to_string())
    }
}

impl From<serde_json::Error> for DatabaseError {
    fn from(err: serde_json::Error) -> Self {
        DatabaseError::JsonParseError(err.to_string())
    }
}

const CURRENT_SCHEMA_VERSION: i32 = 1;

/// Wrapper around a SQLite connection and the file it lives in
pub struct Database {
    pub conn: Connection,
    pub path: PathBuf,
}

/// Open or create the record database at `path`
pub fn open_database(path: &Path) -> Result<Database, DatabaseError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::ConnectionFailed(format!("Failed to create {:?}: {}", parent, e))
            })?;
        }
    }

    info!("Opening database at {:?}", path);

    let conn = Connection::open(path).map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?;

    conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL;")
        .map_err(|e| DatabaseError::MigrationFailed(format!("Failed to set pragmas: {}", e)))?;
    conn.busy_timeout(Duration::from_secs(10))
        .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?;

    run_migrations(&conn)?;

    Ok(Database {
        conn,
        path: path.to_path_buf(),
    })
}

/// Fixed-width RFC 3339 so stored timestamps sort lexicographically
pub fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

pub fn schema_version(conn: &Connection) -> i32 {
    conn.query_row(
        "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
        [],
        |row| row.get(0),
    )
    .unwrap_or(0)
}

/// Run database schema migrations
fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    let current_version = schema_version(conn);
    info!("Current schema version: {}", current_version);

    if current_version < 1 {
        info!("Applying migration v1: Initial schema");
        conn.execute_batch(include_str!("schema.sql"))
            .map_err(|e| DatabaseError::MigrationFailed(format!("Failed to apply v1 schema: {}", e)))?;
    }

    if current_version > CURRENT_SCHEMA_VERSION {
        return Err(DatabaseError::MigrationFailed(format!(
            "Database schema v{} is newer than supported v{}",
            current_version, CURRENT_SCHEMA_VERSION
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_new_database() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data").join("papers.db");
        let result = open_database(&path);
        assert!(result.is_ok());
        assert!(path.exists());
    }

    #[test]
    fn test_schema_version() {
        let dir = tempdir().unwrap();
        let db = open_database(&dir.path().join("papers.db")).unwrap();
        assert_eq!(schema_version(&db.conn), 1);
    }

    #[test]
    fn test_reopen_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("papers.db");
        drop(open_database(&path).unwrap());
        let db = open_database(&path).unwrap();

        let versions: i32 = db
            .conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(versions, 1);
    }
}
