//! Upstream service adapters
//!
//! The pipeline talks to three external services through the traits below:
//! - PubMed (NCBI E-utilities): search and bibliographic metadata
//! - PMC: structured full text and rendered article pages
//! - OpenAlex: citation-graph enrichment
//!
//! Tests swap in in-memory implementations of the same traits.

pub mod openalex;
pub mod pmc;
pub mod pubmed;

use async_trait::async_trait;
use chrono::NaiveDate;
use indexmap::IndexMap;
use std::collections::HashMap;

use crate::error::GatewayError;
use crate::models::{EnrichmentFields, Record};

pub use openalex::OpenAlexClient;
pub use pmc::PmcClient;
pub use pubmed::PubMedClient;

/// Inclusive publication-date window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

/// An opaque query string, optionally restricted to a date window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub text: String,
    pub date_range: Option<DateRange>,
}

impl SearchQuery {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            date_range: None,
        }
    }

    pub fn within(&self, range: DateRange) -> Self {
        Self {
            text: self.text.clone(),
            date_range: Some(range),
        }
    }
}

/// Full text as returned by the archive, before quality checks
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArchiveContent {
    pub abstract_text: Option<String>,
    pub sections: IndexMap<String, String>,
    pub flat_text: String,
}

#[async_trait]
pub trait SearchService: Send + Sync {
    /// Total hits for the query
    async fn count(&self, query: &SearchQuery) -> Result<usize, GatewayError>;

    /// Identifiers at `offset..offset + limit`
    async fn page(
        &self,
        query: &SearchQuery,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<String>, GatewayError>;

    /// Primary ids for one batch of DOIs, keyed by normalized DOI
    ///
    /// DOIs the service does not know are absent from the map.
    async fn ids_for_dois(&self, dois: &[String]) -> Result<HashMap<String, String>, GatewayError>;
}

#[async_trait]
pub trait MetadataService: Send + Sync {
    /// Records for as many of `ids` as the service returns, keyed by primary id
    async fn fetch_bulk(&self, ids: &[String]) -> Result<HashMap<String, Record>, GatewayError>;

    async fn fetch_one(&self, id: &str) -> Result<Option<Record>, GatewayError>;
}

#[async_trait]
pub trait ArchiveService: Send + Sync {
    async fn fetch_structured(&self, archive_id: &str) -> Result<Option<ArchiveContent>, GatewayError>;

    /// Raw HTML of the archive's rendered article page
    async fn rendered_page(&self, archive_id: &str) -> Result<Option<String>, GatewayError>;

    /// Resolve an archive identifier from a DOI
    async fn lookup_by_persistent_id(&self, doi: &str) -> Result<Option<String>, GatewayError>;

    /// Pull sections out of a rendered page
    fn parse_rendered_page(&self, html: &str) -> ArchiveContent {
        pmc::parse_article_html(html)
    }
}

#[async_trait]
pub trait EnrichmentService: Send + Sync {
    async fn lookup_one(&self, doi: &str) -> Result<Option<EnrichmentFields>, GatewayError>;

    /// Fields for every DOI the service knows, keyed by normalized DOI
    async fn lookup_batch(
        &self,
        dois: &[String],
    ) -> Result<HashMap<String, EnrichmentFields>, GatewayError>;
}

/// Canonical DOI form used for matching: no resolver prefix, lowercase
pub fn normalize_doi(doi: &str) -> String {
    let trimmed = doi.trim();
    let lower = trimmed.to_lowercase();
    let stripped = ["https://doi.org/", "http://doi.org/", "https://dx.doi.org/", "http://dx.doi.org/", "doi:"]
        .iter()
        .find_map(|prefix| lower.strip_prefix(prefix))
        .unwrap_or(&lower);
    stripped.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_doi() {
        assert_eq!(normalize_doi("https://doi.org/10.1000/ABC"), "10.1000/abc");
        assert_eq!(normalize_doi(" doi:10.5/x "), "10.5/x");
        assert_eq!(normalize_doi("10.1/Y"), "10.1/y");
    }

    #[test]
    fn test_search_query_within() {
        let range = DateRange {
            start: NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2020, 12, 31).unwrap(),
        };
        let q = SearchQuery::new("cancer").within(range);
        assert_eq!(q.text, "cancer");
        assert_eq!(q.date_range, Some(range));
    }
}
