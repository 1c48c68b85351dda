//! OpenAlex client for citation-graph enrichment
//!
//! See: https://docs.openalex.org/api-entities/works

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{normalize_doi, EnrichmentService};
use crate::error::GatewayError;
use crate::models::{EnrichmentFields, Topic};
use crate::utils::http::{read_body, Identity, RateLimitedGateway};

pub const OPENALEX_BASE_URL: &str = "https://api.openalex.org";
const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Deserialize)]
struct WorksResponse {
    #[serde(default)]
    results: Vec<Work>,
}

#[derive(Debug, Deserialize)]
struct Work {
    doi: Option<String>,
    cited_by_count: Option<i64>,
    citation_normalized_percentile: Option<Percentile>,
    fwci: Option<f64>,
    open_access: Option<OpenAccess>,
    primary_topic: Option<PrimaryTopic>,
}

/// Older responses carry a bare number, newer ones an object
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Percentile {
    Value(f64),
    Detailed { value: Option<f64> },
}

#[derive(Debug, Deserialize)]
struct OpenAccess {
    oa_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PrimaryTopic {
    display_name: Option<String>,
    subfield: Option<Named>,
    field: Option<Named>,
    domain: Option<Named>,
}

#[derive(Debug, Deserialize)]
struct Named {
    display_name: Option<String>,
}

impl From<Work> for EnrichmentFields {
    fn from(work: Work) -> Self {
        let name = |n: Option<Named>| n.and_then(|n| n.display_name);
        EnrichmentFields {
            cited_by_count: work.cited_by_count,
            citation_normalized_percentile: work.citation_normalized_percentile.and_then(|p| match p {
                Percentile::Value(v) => Some(v),
                Percentile::Detailed { value } => value,
            }),
            fwci: work.fwci,
            oa_url: work.open_access.and_then(|oa| oa.oa_url),
            primary_topic: work.primary_topic.map(|t| Topic {
                name: t.display_name,
                subfield: name(t.subfield),
                field: name(t.field),
                domain: name(t.domain),
            }),
        }
    }
}

fn mailto_params(identity: &Identity) -> Vec<(&'static str, String)> {
    identity
        .email
        .as_ref()
        .map(|email| vec![("mailto", email.clone())])
        .unwrap_or_default()
}

/// Client for the OpenAlex works API
pub struct OpenAlexClient {
    client: Client,
    gateway: Arc<RateLimitedGateway>,
    base_url: String,
}

impl OpenAlexClient {
    pub fn new(gateway: Arc<RateLimitedGateway>) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(|e| GatewayError::Transient(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self::with_client(client, gateway))
    }

    pub fn with_client(client: Client, gateway: Arc<RateLimitedGateway>) -> Self {
        Self {
            client,
            gateway,
            base_url: OPENALEX_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn get(
        &self,
        operation: &str,
        url: &str,
        params: &[(&'static str, String)],
    ) -> Result<Option<String>, GatewayError> {
        self.gateway
            .call(operation, |identity| {
                let request = self
                    .client
                    .get(url)
                    .query(params)
                    .query(&mailto_params(&identity));
                async move { read_body(request.send().await?).await }
            })
            .await
    }
}

#[async_trait]
impl EnrichmentService for OpenAlexClient {
    async fn lookup_one(&self, doi: &str) -> Result<Option<EnrichmentFields>, GatewayError> {
        let url = format!("{}/works/https://doi.org/{}", self.base_url, normalize_doi(doi));
        debug!("OpenAlex lookup: {}", doi);

        let Some(body) = self.get("work lookup", &url, &[]).await? else {
            return Ok(None);
        };
        let work: Work = serde_json::from_str(&body)?;
        Ok(Some(work.into()))
    }

    async fn lookup_batch(
        &self,
        dois: &[String],
    ) -> Result<HashMap<String, EnrichmentFields>, GatewayError> {
        if dois.is_empty() {
            return Ok(HashMap::new());
        }
        let filter = dois.iter().map(|d| normalize_doi(d)).collect::<Vec<_>>().join("|");
        let params = vec![
            ("filter", format!("doi:{}", filter)),
            ("per-page", dois.len().to_string()),
        ];
        let url = format!("{}/works", self.base_url);

        let Some(body) = self.get("work batch", &url, &params).await? else {
            return Ok(HashMap::new());
        };
        Ok(parse_works(&body)?)
    }
}

/// Index a `/works` listing by normalized DOI; works without a DOI are dropped
fn parse_works(body: &str) -> Result<HashMap<String, EnrichmentFields>, serde_json::Error> {
    let response: WorksResponse = serde_json::from_str(body)?;
    Ok(response
        .results
        .into_iter()
        .filter_map(|work| {
            let doi = normalize_doi(work.doi.as_deref()?);
            Some((doi, EnrichmentFields::from(work)))
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_work_with_detailed_percentile() {
        let body = r#"{
            "doi": "https://doi.org/10.1000/X1",
            "cited_by_count": 12,
            "citation_normalized_percentile": {"value": 0.87, "is_in_top_1_percent": false},
            "fwci": 1.4,
            "open_access": {"is_oa": true, "oa_url": "https://example.org/x1.pdf"},
            "primary_topic": {
                "display_name": "Sleep and Memory",
                "subfield": {"display_name": "Cognitive Neuroscience"},
                "field": {"display_name": "Neuroscience"},
                "domain": {"display_name": "Life Sciences"}
            }
        }"#;
        let work: Work = serde_json::from_str(body).unwrap();
        let fields = EnrichmentFields::from(work);
        assert_eq!(fields.cited_by_count, Some(12));
        assert_eq!(fields.citation_normalized_percentile, Some(0.87));
        assert_eq!(fields.oa_url.as_deref(), Some("https://example.org/x1.pdf"));
        let topic = fields.primary_topic.unwrap();
        assert_eq!(topic.name.as_deref(), Some("Sleep and Memory"));
        assert_eq!(topic.domain.as_deref(), Some("Life Sciences"));
    }

    #[test]
    fn test_parse_work_with_bare_percentile_and_nulls() {
        let body = r#"{"doi": null, "cited_by_count": 0, "citation_normalized_percentile": 0.5,
                       "fwci": null, "open_access": null, "primary_topic": null}"#;
        let fields = EnrichmentFields::from(serde_json::from_str::<Work>(body).unwrap());
        assert_eq!(fields.citation_normalized_percentile, Some(0.5));
        assert!(fields.primary_topic.is_none());
    }

    #[test]
    fn test_parse_works_indexes_by_normalized_doi() {
        let body = r#"{"meta": {"count": 2}, "results": [
            {"doi": "https://doi.org/10.1/AA", "cited_by_count": 1},
            {"doi": null, "cited_by_count": 2},
            {"doi": "https://doi.org/10.1/bb", "cited_by_count": 3}
        ]}"#;
        let works = parse_works(body).unwrap();
        assert_eq!(works.len(), 2);
        assert_eq!(works["10.1/aa"].cited_by_count, Some(1));
        assert_eq!(works["10.1/bb"].cited_by_count, Some(3));
    }
}
