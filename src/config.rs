//! Harvest configuration
//!
//! One [`HarvestConfig`] value describes a run variant. It is read from an
//! optional JSON settings file and then overridden from the environment.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::HarvestError;
use crate::utils::http::{Identity, RetryPolicy};

const APP_DIR: &str = "lit-harvest";

/// Per-service gateway settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    pub name: String,
    pub max_requests_per_sec: f64,
    pub max_concurrent: usize,
    pub timeout_secs: u64,
    /// Rotated round-robin when the service throttles us
    pub identities: Vec<Identity>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::ncbi()
    }
}

impl GatewayConfig {
    /// NCBI E-utilities: 10 req/s with a key, kept a little under
    pub fn ncbi() -> Self {
        Self {
            name: "ncbi".into(),
            max_requests_per_sec: 8.0,
            max_concurrent: 8,
            timeout_secs: 30,
            identities: Vec::new(),
        }
    }

    pub fn openalex() -> Self {
        Self {
            name: "openalex".into(),
            max_requests_per_sec: 3.0,
            max_concurrent: 4,
            timeout_secs: 30,
            identities: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SearchConfig {
    /// Hard per-query retrieval limit of the search service
    pub window_cap: usize,
    pub page_size: usize,
    pub page_delay_ms: u64,
    pub partition_delay_ms: u64,
    /// Oldest publication year visited when partitioning by date
    pub earliest_year: i32,
    pub use_cache: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            window_cap: 10_000,
            page_size: 5_000,
            page_delay_ms: 750,
            partition_delay_ms: 500,
            earliest_year: 1950,
            use_cache: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunConfig {
    pub batch_size: usize,
    /// Primary pool: chunks processed concurrently
    pub workers: usize,
    /// Secondary pool: full-text and enrichment fetches per chunk
    pub fulltext_workers: usize,
    pub checkpoint_every: usize,
    pub metadata_batch_size: usize,
    pub enrichment_batch_size: usize,
    /// DOIs per OR-query when collecting from a DOI list
    pub doi_batch_size: usize,
    pub batch_enrichment: bool,
    /// Re-fetch records that exist but lack an abstract or full text
    pub enrich_existing: bool,
    /// Proactively rotate identities after this many completed chunks
    pub rotate_identity_every: Option<usize>,
    /// Refuse to run when the search resolves at least this many ids
    pub check_max: Option<usize>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            batch_size: 30,
            workers: 2,
            fulltext_workers: 2,
            checkpoint_every: 10,
            metadata_batch_size: 200,
            enrichment_batch_size: 50,
            doi_batch_size: 10,
            batch_enrichment: true,
            enrich_existing: false,
            rotate_identity_every: Some(10),
            check_max: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CleaningConfig {
    pub clean_full_text: bool,
    pub remove_references: bool,
    pub clean_abstract: bool,
}

impl Default for CleaningConfig {
    fn default() -> Self {
        Self {
            clean_full_text: true,
            remove_references: true,
            clean_abstract: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HarvestConfig {
    pub data_dir: PathBuf,
    pub ncbi: GatewayConfig,
    pub openalex: GatewayConfig,
    pub retry: RetryPolicy,
    pub search: SearchConfig,
    pub run: RunConfig,
    pub cleaning: CleaningConfig,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            ncbi: GatewayConfig::ncbi(),
            openalex: GatewayConfig::openalex(),
            retry: RetryPolicy::default(),
            search: SearchConfig::default(),
            run: RunConfig::default(),
            cleaning: CleaningConfig::default(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

/// Default location of the JSON settings file
pub fn default_settings_path() -> PathBuf {
    default_data_dir().join("settings.json")
}

impl HarvestConfig {
    /// Load settings from `path` (or the default location) and apply
    /// environment overrides
    ///
    /// A missing file is not an error; defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self, HarvestError> {
        let settings_path = path.map(Path::to_path_buf).unwrap_or_else(default_settings_path);

        let mut config = if settings_path.exists() {
            info!("Loading settings from {:?}", settings_path);
            let content = fs::read_to_string(&settings_path)?;
            serde_json::from_str(&content)
                .map_err(|e| HarvestError::Config(format!("Failed to parse settings: {}", e)))?
        } else if path.is_some() {
            return Err(HarvestError::Config(format!(
                "Settings file not found: {}",
                settings_path.display()
            )));
        } else {
            debug!("No settings file at {:?}, using defaults", settings_path);
            HarvestConfig::default()
        };

        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from an environment lookup
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("LIT_HARVEST_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }

        let email = lookup("NCBI_EMAIL");
        let api_key = lookup("NCBI_API_KEY");
        if email.is_some() || api_key.is_some() {
            let identity = Identity { email, api_key };
            // env credentials go first so they are used before any rotation
            self.ncbi.identities.retain(|i| i != &identity);
            self.ncbi.identities.insert(0, identity);
        }

        if let Some(mailto) = lookup("OPENALEX_MAILTO") {
            self.openalex.identities = vec![Identity {
                email: Some(mailto),
                api_key: None,
            }];
        }
    }

    pub fn validate(&self) -> Result<(), HarvestError> {
        let run = &self.run;
        if run.batch_size == 0 || run.workers == 0 || run.fulltext_workers == 0 {
            return Err(HarvestError::Config(
                "batch_size and worker counts must be positive".into(),
            ));
        }
        if run.metadata_batch_size == 0 || run.enrichment_batch_size == 0 || run.doi_batch_size == 0 {
            return Err(HarvestError::Config("sub-batch sizes must be positive".into()));
        }
        if self.search.window_cap == 0 || self.search.page_size == 0 {
            return Err(HarvestError::Config(
                "window_cap and page_size must be positive".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(HarvestError::Config("retry.max_attempts must be at least 1".into()));
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("data").join("papers.db")
    }

    pub fn cache_path(&self) -> PathBuf {
        self.data_dir.join("cache").join("query_cache.json")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn duplicates_export_path(&self) -> PathBuf {
        self.data_dir.join("data").join("doi_duplicates_export.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = HarvestConfig::default();
        assert_eq!(config.run.batch_size, 30);
        assert_eq!(config.run.checkpoint_every, 10);
        assert_eq!(config.search.window_cap, 10_000);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.ncbi.max_requests_per_sec, 8.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_settings_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"run": {"batch_size": 12}, "data_dir": "/tmp/harvest"}"#).unwrap();

        let config = HarvestConfig::load(Some(&path)).unwrap();
        assert_eq!(config.run.batch_size, 12);
        assert_eq!(config.run.workers, 2);
        assert_eq!(config.database_path(), PathBuf::from("/tmp/harvest/data/papers.db"));
    }

    #[test]
    fn test_missing_explicit_settings_file() {
        let dir = tempdir().unwrap();
        let result = HarvestConfig::load(Some(&dir.path().join("nope.json")));
        assert!(matches!(result, Err(HarvestError::Config(_))));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("NCBI_EMAIL", "me@example.org"),
            ("NCBI_API_KEY", "abc"),
            ("OPENALEX_MAILTO", "polite@example.org"),
        ]
        .into_iter()
        .collect();

        let mut config = HarvestConfig::default();
        config.ncbi.identities.push(Identity::new("other@example.org", None));
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.ncbi.identities.len(), 2);
        assert_eq!(config.ncbi.identities[0].email.as_deref(), Some("me@example.org"));
        assert_eq!(config.ncbi.identities[0].api_key.as_deref(), Some("abc"));
        assert_eq!(
            config.openalex.identities[0].email.as_deref(),
            Some("polite@example.org")
        );
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut config = HarvestConfig::default();
        config.run.workers = 0;
        assert!(config.validate().is_err());
    }
}
