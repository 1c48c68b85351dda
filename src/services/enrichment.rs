//! Citation-graph enrichment, one record at a time or in DOI batches

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::adapters::{normalize_doi, EnrichmentService};
use crate::models::Record;

pub struct EnrichmentClient {
    service: Arc<dyn EnrichmentService>,
    batch_size: usize,
}

impl EnrichmentClient {
    pub fn new(service: Arc<dyn EnrichmentService>, batch_size: usize) -> Self {
        Self {
            service,
            batch_size: batch_size.max(1),
        }
    }

    /// Look up one record by DOI; returns whether a match was applied
    ///
    /// Records without a DOI are left untouched. Lookup failures are logged
    /// and leave the record unenriched.
    pub async fn enrich(&self, record: &mut Record) -> bool {
        let Some(doi) = record
            .secondary_id
            .clone()
            .filter(|d| !d.trim().is_empty())
        else {
            return false;
        };
        match self.service.lookup_one(&doi).await {
            Ok(Some(fields)) => {
                record.apply_enrichment(fields);
                true
            }
            Ok(None) => {
                debug!("No enrichment match for DOI {}", doi);
                false
            }
            Err(e) => {
                warn!("Enrichment lookup failed for DOI {}: {}", doi, e);
                false
            }
        }
    }

    /// Enrich many records with one OR-filter request per batch of DOIs
    ///
    /// Anything a batch does not return (or a failed batch) falls back to
    /// individual lookups. Returns the number of records enriched.
    pub async fn enrich_batch(&self, records: &mut [Record]) -> usize {
        let mut by_doi: HashMap<String, Vec<usize>> = HashMap::new();
        let mut order: Vec<String> = Vec::new();
        for (idx, record) in records.iter().enumerate() {
            let Some(doi) = record.secondary_id.as_deref().filter(|d| !d.trim().is_empty()) else {
                continue;
            };
            let key = normalize_doi(doi);
            if !by_doi.contains_key(&key) {
                order.push(key.clone());
            }
            by_doi.entry(key).or_default().push(idx);
        }

        let mut enriched = 0;
        let mut misses: Vec<usize> = Vec::new();

        for chunk in order.chunks(self.batch_size) {
            let found = match self.service.lookup_batch(chunk).await {
                Ok(found) => found,
                Err(e) => {
                    warn!("Batch enrichment of {} DOIs failed: {}", chunk.len(), e);
                    HashMap::new()
                }
            };
            debug!("Batch enrichment matched {} of {} DOIs", found.len(), chunk.len());

            for doi in chunk {
                let indices = by_doi.get(doi).map(Vec::as_slice).unwrap_or_default();
                match found.get(doi) {
                    Some(fields) => {
                        for &idx in indices {
                            records[idx].apply_enrichment(fields.clone());
                            enriched += 1;
                        }
                    }
                    None => misses.extend_from_slice(indices),
                }
            }
        }

        for idx in misses {
            if self.enrich(&mut records[idx]).await {
                enriched += 1;
            }
        }
        enriched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;
    use crate::models::EnrichmentFields;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Knows a fixed set of DOIs; batch lookups can be told to omit some
    struct FakeEnrichment {
        known: HashMap<String, i64>,
        batch_omits: Vec<String>,
        batch_fails: bool,
        batches: Mutex<Vec<usize>>,
        singles: Mutex<Vec<String>>,
    }

    impl FakeEnrichment {
        fn new(known: &[(&str, i64)]) -> Self {
            Self {
                known: known.iter().map(|(d, c)| (d.to_string(), *c)).collect(),
                batch_omits: Vec::new(),
                batch_fails: false,
                batches: Mutex::new(Vec::new()),
                singles: Mutex::new(Vec::new()),
            }
        }

        fn fields(&self, doi: &str) -> Option<EnrichmentFields> {
            self.known.get(doi).map(|count| EnrichmentFields {
                cited_by_count: Some(*count),
                ..Default::default()
            })
        }
    }

    #[async_trait]
    impl EnrichmentService for FakeEnrichment {
        async fn lookup_one(&self, doi: &str) -> Result<Option<EnrichmentFields>, GatewayError> {
            self.singles.lock().unwrap().push(doi.to_string());
            Ok(self.fields(&normalize_doi(doi)))
        }

        async fn lookup_batch(&self, dois: &[String]) -> Result<HashMap<String, EnrichmentFields>, GatewayError> {
            self.batches.lock().unwrap().push(dois.len());
            if self.batch_fails {
                return Err(GatewayError::Transient("timeout".into()));
            }
            Ok(dois
                .iter()
                .filter(|d| !self.batch_omits.contains(d))
                .filter_map(|d| Some((d.clone(), self.fields(d)?)))
                .collect())
        }
    }

    fn record(id: &str, doi: Option<&str>) -> Record {
        let mut r = Record::new(id);
        r.secondary_id = doi.map(String::from);
        r
    }

    #[tokio::test]
    async fn test_enrich_individual() {
        let client = EnrichmentClient::new(Arc::new(FakeEnrichment::new(&[("10.1/a", 5)])), 50);

        let mut hit = record("1", Some("10.1/A"));
        assert!(client.enrich(&mut hit).await);
        assert!(hit.enrichment_retrieved);
        assert_eq!(hit.enrichment.unwrap().cited_by_count, Some(5));

        let mut miss = record("2", Some("10.1/zzz"));
        assert!(!client.enrich(&mut miss).await);
        assert!(!miss.enrichment_retrieved);

        let mut none = record("3", None);
        assert!(!client.enrich(&mut none).await);
    }

    #[tokio::test]
    async fn test_batch_matches_individual_results() {
        let mut fake = FakeEnrichment::new(&[("10.1/a", 1), ("10.1/b", 2), ("10.1/c", 3)]);
        fake.batch_omits = vec!["10.1/c".into()];
        let fake = Arc::new(fake);
        let client = EnrichmentClient::new(fake.clone(), 2);

        let mut records = vec![
            record("1", Some("10.1/a")),
            record("2", Some("https://doi.org/10.1/B")),
            record("3", Some("10.1/c")),
            record("4", Some("10.1/unknown")),
            record("5", None),
            record("6", Some("10.1/a")),
        ];
        let enriched = client.enrich_batch(&mut records).await;

        assert_eq!(enriched, 4);
        let counts: Vec<Option<i64>> = records
            .iter()
            .map(|r| r.enrichment.as_ref().and_then(|e| e.cited_by_count))
            .collect();
        assert_eq!(counts, vec![Some(1), Some(2), Some(3), None, None, Some(1)]);

        // four unique DOIs in batches of two, then two individual fallbacks
        assert_eq!(*fake.batches.lock().unwrap(), vec![2, 2]);
        assert_eq!(fake.singles.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_batch_falls_back_to_individual() {
        let mut fake = FakeEnrichment::new(&[("10.1/a", 7)]);
        fake.batch_fails = true;
        let client = EnrichmentClient::new(Arc::new(fake), 50);

        let mut records = vec![record("1", Some("10.1/a"))];
        assert_eq!(client.enrich_batch(&mut records).await, 1);
        assert!(records[0].has_enrichment());
    }
}
