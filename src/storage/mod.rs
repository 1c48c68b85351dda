//! Storage module for SQLite persistence and the query cache
//!
//! This module provides:
//! - Database connection management and schema migrations
//! - Repositories for records and collection runs
//! - Duplicate resolution over shared secondary identifiers
//! - The thread-safe `RecordStore` the pipeline writes through, and merging
//!   another store into it
//! - The JSON-backed `ResultCache` for resolved searches

pub mod db;
pub mod dedup;
pub mod query_cache;
pub mod record_repo;
pub mod run_repo;
pub mod store;

pub use db::{open_database, Database, DatabaseError};
pub use dedup::{DedupMode, DedupReport, DedupStrategy};
pub use query_cache::{CacheError, CacheInfo, ResultCache};
pub use record_repo::{DuplicateGroup, MergeReport, RecordRepo, StoreStatistics};
pub use run_repo::RunRepo;
pub use store::RecordStore;
