//! Top-level harvesting run
//!
//! `Init -> Search -> chunks -> {classify, fetch, persist} per chunk -> Finalize`.
//! Chunks run concurrently on a bounded task pool; inside a chunk, full-text
//! and enrichment fetches fan out over a smaller pool. A failing chunk is
//! counted and logged, never fatal to the run.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::enrichment::EnrichmentClient;
use super::extraction::ExtractionChain;
use super::search::PaginatedSearch;
use crate::adapters::{
    normalize_doi, ArchiveService, EnrichmentService, MetadataService, OpenAlexClient, PmcClient,
    PubMedClient, SearchService,
};
use crate::config::{HarvestConfig, RunConfig};
use crate::error::HarvestError;
use crate::models::{
    merge, CollectionRun, IncompleteRecord, Record, RunReport, RunStatistics, RunStatus,
};
use crate::storage::{RecordStore, ResultCache};
use crate::utils::http::RateLimitedGateway;

pub const NO_FULL_TEXT_REASON: &str = "No full text available";

/// The upstream services a run talks to
#[derive(Clone)]
pub struct Services {
    pub search: Arc<dyn SearchService>,
    pub metadata: Arc<dyn MetadataService>,
    pub archive: Arc<dyn ArchiveService>,
    pub enrichment: Arc<dyn EnrichmentService>,
}

pub struct BatchOrchestrator {
    config: HarvestConfig,
    store: Arc<RecordStore>,
    search: PaginatedSearch,
    /// Used directly for DOI lookups, which bypass pagination
    search_service: Arc<dyn SearchService>,
    metadata: Arc<dyn MetadataService>,
    extraction: Arc<ExtractionChain>,
    enrichment: Arc<EnrichmentClient>,
    /// Rotated proactively every `rotate_identity_every` chunks
    gateways: Vec<Arc<RateLimitedGateway>>,
}

impl BatchOrchestrator {
    pub fn new(
        config: HarvestConfig,
        store: Arc<RecordStore>,
        cache: Option<Arc<ResultCache>>,
        services: Services,
    ) -> Self {
        let search_service = services.search.clone();
        let search = PaginatedSearch::new(services.search, cache, config.search.clone());
        let extraction = Arc::new(ExtractionChain::new(services.archive, config.cleaning.clone()));
        let enrichment = Arc::new(EnrichmentClient::new(
            services.enrichment,
            config.run.enrichment_batch_size,
        ));

        Self {
            config,
            store,
            search,
            search_service,
            metadata: services.metadata,
            extraction,
            enrichment,
            gateways: Vec::new(),
        }
    }

    pub fn with_gateways(mut self, gateways: Vec<Arc<RateLimitedGateway>>) -> Self {
        self.gateways = gateways;
        self
    }

    /// Wire up the NCBI and OpenAlex clients, the store and the cache
    pub fn from_config(config: HarvestConfig) -> Result<Self, HarvestError> {
        config.validate()?;
        let ncbi = Arc::new(RateLimitedGateway::new(&config.ncbi, config.retry.clone()));
        let openalex = Arc::new(RateLimitedGateway::new(&config.openalex, config.retry.clone()));

        let pubmed = Arc::new(PubMedClient::new(ncbi.clone(), config.cleaning.clone())?);
        let services = Services {
            search: pubmed.clone(),
            metadata: pubmed,
            archive: Arc::new(PmcClient::new(ncbi.clone())?),
            enrichment: Arc::new(OpenAlexClient::new(openalex.clone())?),
        };

        let store = Arc::new(RecordStore::open(&config.database_path())?);
        let cache = config
            .search
            .use_cache
            .then(|| Arc::new(ResultCache::open(config.cache_path())));

        Ok(Self::new(config, store, cache, services).with_gateways(vec![ncbi, openalex]))
    }

    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    /// Harvest everything `query` resolves to
    ///
    /// Only failing to create the run or to resolve the query is fatal.
    /// Per-chunk and per-record problems end up in the statistics.
    pub async fn run(
        &self,
        query: &str,
        max_results: Option<usize>,
        description: Option<&str>,
    ) -> Result<RunReport, HarvestError> {
        let started = Instant::now();
        let run = self.store.create_run(query, description, max_results)?;
        info!("Started collection run {}", run.id);

        let ids = match self.search.resolve(query, max_results).await {
            Ok(ids) => ids,
            Err(e) => {
                error!("Search failed for run {}: {}", run.id, e);
                self.store.finalize_run(run.id, &RunStatistics::default(), RunStatus::Failed)?;
                return Err(e);
            }
        };

        let stats = RunStatistics {
            found: ids.len() as u64,
            ..Default::default()
        };
        info!("Found {} records to process", ids.len());
        self.process(run, ids, stats, Vec::new(), started).await
    }

    /// Harvest the records behind a list of DOIs
    ///
    /// DOIs are resolved to primary ids in OR-batches. The ones the search
    /// service does not know count as failed and are listed in the report.
    pub async fn run_from_dois(
        &self,
        dois: &[String],
        description: Option<&str>,
    ) -> Result<RunReport, HarvestError> {
        let started = Instant::now();
        let mut seen = HashSet::new();
        let wanted: Vec<String> = dois
            .iter()
            .map(|doi| normalize_doi(doi))
            .filter(|doi| !doi.is_empty() && seen.insert(doi.clone()))
            .collect();

        let query_text = format!("DOI list ({} DOIs)", wanted.len());
        let run = self.store.create_run(&query_text, description, None)?;
        info!("Started DOI collection run {} for {} DOIs", run.id, wanted.len());

        let (ids, unresolved) = self.resolve_dois(&wanted).await;
        let stats = RunStatistics {
            found: (ids.len() + unresolved.len()) as u64,
            failed: unresolved.len() as u64,
            ..Default::default()
        };
        info!("Resolved {} of {} DOIs", ids.len(), wanted.len());
        self.process(run, ids, stats, unresolved, started).await
    }

    /// Primary ids for `dois` in input order, plus the DOIs left unresolved
    ///
    /// A failed batch leaves all of its DOIs unresolved.
    async fn resolve_dois(&self, dois: &[String]) -> (Vec<String>, Vec<String>) {
        let mut ids = Vec::new();
        let mut seen = HashSet::new();
        let mut unresolved = Vec::new();

        for batch in dois.chunks(self.config.run.doi_batch_size) {
            let found = match self.search_service.ids_for_dois(batch).await {
                Ok(found) => found,
                Err(e) => {
                    warn!("DOI lookup for {} DOIs failed: {}", batch.len(), e);
                    HashMap::new()
                }
            };
            for doi in batch {
                match found.get(doi) {
                    Some(id) => {
                        if seen.insert(id.clone()) {
                            ids.push(id.clone());
                        }
                    }
                    None => unresolved.push(doi.clone()),
                }
            }
        }

        if !unresolved.is_empty() {
            warn!(
                "{} DOIs not found: {}",
                unresolved.len(),
                unresolved.iter().take(10).cloned().collect::<Vec<_>>().join(", ")
            );
        }
        (ids, unresolved)
    }

    /// Chunk, fetch and persist `ids`, then finalize the run
    async fn process(
        &self,
        run: CollectionRun,
        ids: Vec<String>,
        mut stats: RunStatistics,
        unresolved: Vec<String>,
        started: Instant,
    ) -> Result<RunReport, HarvestError> {
        if let Some(limit) = self.config.run.check_max {
            if ids.len() >= limit {
                self.store.finalize_run(run.id, &stats, RunStatus::Failed)?;
                return Err(HarvestError::Search(format!(
                    "query resolved {} ids, at or above the limit of {}",
                    ids.len(),
                    limit
                )));
            }
        }

        let worker = Arc::new(ChunkWorker {
            run_id: run.id,
            run: self.config.run.clone(),
            store: self.store.clone(),
            metadata: self.metadata.clone(),
            extraction: self.extraction.clone(),
            enrichment: self.enrichment.clone(),
        });

        let chunks: Vec<Vec<String>> = ids
            .chunks(self.config.run.batch_size)
            .map(|c| c.to_vec())
            .collect();
        let total_chunks = chunks.len();
        info!(
            "Processing {} chunks of up to {} with {} workers",
            total_chunks, self.config.run.batch_size, self.config.run.workers
        );

        let permits = Arc::new(Semaphore::new(self.config.run.workers));
        let mut tasks = JoinSet::new();
        let mut chunk_sizes = HashMap::new();
        for (index, chunk) in chunks.into_iter().enumerate() {
            let worker = worker.clone();
            let permits = permits.clone();
            let size = chunk.len() as u64;
            let handle = tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                (index, worker.process_chunk(chunk).await)
            });
            chunk_sizes.insert(handle.id(), size);
        }

        let mut completed = 0;
        while let Some(joined) = tasks.join_next_with_id().await {
            completed += 1;
            match joined {
                Ok((task_id, (index, Ok(chunk_stats)))) => {
                    chunk_sizes.remove(&task_id);
                    debug!("Chunk {} done: {:?}", index + 1, chunk_stats);
                    stats.absorb(&chunk_stats);
                }
                Ok((task_id, (index, Err(e)))) => {
                    let size = chunk_sizes.remove(&task_id).unwrap_or(0);
                    error!("Chunk {} failed, counting {} ids as failed: {}", index + 1, size, e);
                    stats.failed += size;
                }
                Err(join_error) => {
                    let size = chunk_sizes.remove(&join_error.id()).unwrap_or(0);
                    error!("Chunk task aborted, counting {} ids as failed: {}", size, join_error);
                    stats.failed += size;
                }
            }

            let checkpoint_every = self.config.run.checkpoint_every.max(1);
            if completed % checkpoint_every == 0 || completed == total_chunks {
                self.checkpoint(run.id, &stats, completed, total_chunks);
            }
            if let Some(every) = self.config.run.rotate_identity_every.filter(|n| *n > 0) {
                if completed % every == 0 && completed < total_chunks {
                    self.rotate_identities().await;
                }
            }
        }

        self.store.finalize_run(run.id, &stats, RunStatus::Completed)?;
        let incomplete = self.store.incomplete_records(run.id)?;
        let report = RunReport {
            run,
            statistics: stats,
            incomplete,
            unresolved,
            duration: started.elapsed(),
        };
        if report.statistics.accounted() != report.statistics.found {
            warn!(
                "Accounted for {} of {} ids",
                report.statistics.accounted(),
                report.statistics.found
            );
        }
        info!("{}", report.summary());
        Ok(report)
    }

    fn checkpoint(&self, run_id: i64, stats: &RunStatistics, completed: usize, total: usize) {
        info!(
            "Progress {}/{} chunks: processed {}, skipped {}, incomplete {}, failed {}",
            completed, total, stats.processed, stats.skipped, stats.incomplete, stats.failed
        );
        if let Err(e) = self.store.checkpoint_run(run_id, stats) {
            warn!("Failed to checkpoint run {}: {}", run_id, e);
        }
    }

    async fn rotate_identities(&self) {
        for gateway in &self.gateways {
            if gateway.identity_count().await > 1 {
                gateway.rotate_identity().await;
            }
        }
    }
}

/// Everything a chunk task needs, shared across tasks
struct ChunkWorker {
    run_id: i64,
    run: RunConfig,
    store: Arc<RecordStore>,
    metadata: Arc<dyn MetadataService>,
    extraction: Arc<ExtractionChain>,
    enrichment: Arc<EnrichmentClient>,
}

impl ChunkWorker {
    async fn process_chunk(self: Arc<Self>, chunk: Vec<String>) -> Result<RunStatistics, HarvestError> {
        let mut stats = RunStatistics::default();

        // classify
        let mut new_ids = Vec::new();
        let mut existing: HashMap<String, Record> = HashMap::new();
        for id in chunk {
            if !self.store.exists(&id)? {
                new_ids.push(id);
                continue;
            }
            if self.run.enrich_existing {
                if let (true, Some(record)) = self.store.needs_enrichment(&id)? {
                    existing.insert(id, record);
                    continue;
                }
            }
            stats.skipped += 1;
        }
        if new_ids.is_empty() && existing.is_empty() {
            return Ok(stats);
        }

        let wanted: Vec<String> = new_ids.iter().chain(existing.keys()).cloned().collect();
        let (mut fetched, failed_ids) = self.fetch_metadata(&wanted).await;

        for id in failed_ids {
            match existing.get(&id) {
                // keep working with what is already stored
                Some(record) => {
                    fetched.insert(id, record.clone());
                }
                None => stats.failed += 1,
            }
        }

        let refetched: HashSet<String> = existing.keys().cloned().collect();
        let mut records: Vec<Record> = wanted
            .iter()
            .filter_map(|id| {
                let fresh = fetched.remove(id)?;
                Some(match existing.get(id) {
                    Some(stored) => merge(&fresh, stored),
                    None => fresh,
                })
            })
            .collect();

        let before = records.len();
        records = self.clone().fetch_content(records).await;
        stats.failed += (before - records.len()) as u64;

        if self.run.batch_enrichment {
            self.enrichment.enrich_batch(&mut records).await;
        }

        for mut record in records {
            record.collection_run_id = Some(self.run_id);
            record.collected_at = Utc::now();
            if let Err(e) = self.store.upsert(&record) {
                warn!("Failed to store record {}: {}", record.primary_id, e);
                stats.failed += 1;
                continue;
            }

            if refetched.contains(&record.primary_id) {
                stats.enriched_existing += 1;
            }
            if record.has_enrichment() {
                stats.with_enrichment += 1;
            }
            if record.has_full_text() {
                stats.processed += 1;
                stats.with_full_text += 1;
            } else {
                stats.incomplete += 1;
                self.store.record_incomplete(&IncompleteRecord {
                    run_id: self.run_id,
                    primary_id: record.primary_id.clone(),
                    secondary_id: record.secondary_id.clone(),
                    reason: NO_FULL_TEXT_REASON.to_string(),
                    recorded_at: Utc::now(),
                })?;
            }
        }
        Ok(stats)
    }

    /// Bulk metadata in sub-batches, with individual retries for stragglers
    ///
    /// Returns the records found and the ids that could not be fetched.
    async fn fetch_metadata(&self, ids: &[String]) -> (HashMap<String, Record>, Vec<String>) {
        let mut found = HashMap::new();
        let mut missing = Vec::new();

        for batch in ids.chunks(self.run.metadata_batch_size) {
            match self.metadata.fetch_bulk(batch).await {
                Ok(mut records) => {
                    for id in batch {
                        match records.remove(id) {
                            Some(record) => {
                                found.insert(id.clone(), record);
                            }
                            None => missing.push(id.clone()),
                        }
                    }
                }
                Err(e) => {
                    warn!("Bulk metadata fetch of {} ids failed: {}", batch.len(), e);
                    missing.extend(batch.iter().cloned());
                }
            }
        }

        let mut failed = Vec::new();
        for id in missing {
            match self.metadata.fetch_one(&id).await {
                Ok(Some(record)) => {
                    found.insert(id, record);
                }
                Ok(None) => {
                    warn!("No metadata for {}", id);
                    failed.push(id);
                }
                Err(e) => {
                    warn!("Metadata fetch failed for {}: {}", id, e);
                    failed.push(id);
                }
            }
        }
        (found, failed)
    }

    /// Full text (and individual enrichment) on the secondary pool
    ///
    /// Records whose task dies are dropped from the result.
    async fn fetch_content(self: Arc<Self>, records: Vec<Record>) -> Vec<Record> {
        let permits = Arc::new(Semaphore::new(self.run.fulltext_workers));
        let mut tasks = JoinSet::new();
        let mut owners = HashMap::new();

        for (position, mut record) in records.into_iter().enumerate() {
            let worker = self.clone();
            let permits = permits.clone();
            let primary_id = record.primary_id.clone();
            let handle = tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                if !record.has_full_text() {
                    if let Some(extracted) = worker.extraction.extract(&record).await {
                        record.full_text = Some(extracted.full_text);
                        record.full_text_sections = extracted.sections;
                        record.archive_id.get_or_insert(extracted.archive_id);
                    }
                }
                if !worker.run.batch_enrichment && !record.has_enrichment() {
                    worker.enrichment.enrich(&mut record).await;
                }
                (position, record)
            });
            owners.insert(handle.id(), primary_id);
        }

        let mut done = Vec::with_capacity(owners.len());
        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((_, result)) => done.push(result),
                Err(join_error) => {
                    let id = owners.get(&join_error.id()).map(String::as_str).unwrap_or("?");
                    error!("Content fetch for {} aborted: {}", id, join_error);
                }
            }
        }
        done.sort_by_key(|(position, _)| *position);
        done.into_iter().map(|(_, record)| record).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{ArchiveContent, SearchQuery};
    use crate::error::GatewayError;
    use crate::models::EnrichmentFields;
    use async_trait::async_trait;
    use indexmap::IndexMap;
    use std::sync::Mutex;
    use tempfile::tempdir;

    struct Fixed(Vec<String>);

    #[async_trait]
    impl SearchService for Fixed {
        async fn count(&self, _query: &SearchQuery) -> Result<usize, GatewayError> {
            Ok(self.0.len())
        }
        async fn page(&self, _query: &SearchQuery, offset: usize, limit: usize) -> Result<Vec<String>, GatewayError> {
            Ok(self.0.iter().skip(offset).take(limit).cloned().collect())
        }
        /// `10.1/<id>` resolves for every id in the list
        async fn ids_for_dois(&self, dois: &[String]) -> Result<HashMap<String, String>, GatewayError> {
            Ok(dois
                .iter()
                .filter_map(|doi| {
                    let id = doi.strip_prefix("10.1/")?;
                    self.0.iter().any(|known| known == id).then(|| (doi.clone(), id.to_string()))
                })
                .collect())
        }
    }

    /// Metadata with a DOI and archive id for even ids only
    #[derive(Default)]
    struct Catalog {
        bulk_calls: Mutex<Vec<usize>>,
        /// Missing from bulk responses and failing on its own
        unreachable: Option<String>,
    }

    fn catalog_record(id: &str) -> Record {
        let mut r = Record::new(id);
        r.title = Some(format!("Title {}", id));
        r.abstract_text = Some("Abstract".into());
        if id.parse::<u32>().map_or(false, |n| n % 2 == 0) {
            r.archive_id = Some(format!("PMC{}", id));
            r.secondary_id = Some(format!("10.1/{}", id));
        }
        r
    }

    #[async_trait]
    impl MetadataService for Catalog {
        async fn fetch_bulk(&self, ids: &[String]) -> Result<HashMap<String, Record>, GatewayError> {
            self.bulk_calls.lock().unwrap().push(ids.len());
            Ok(ids
                .iter()
                .filter(|id| self.unreachable.as_ref() != Some(*id))
                .map(|id| (id.clone(), catalog_record(id)))
                .collect())
        }
        async fn fetch_one(&self, id: &str) -> Result<Option<Record>, GatewayError> {
            if self.unreachable.as_deref() == Some(id) {
                return Err(GatewayError::Transient("connection reset".into()));
            }
            Ok(Some(catalog_record(id)))
        }
    }

    struct Archive;

    #[async_trait]
    impl ArchiveService for Archive {
        async fn fetch_structured(&self, _archive_id: &str) -> Result<Option<ArchiveContent>, GatewayError> {
            let mut sections = IndexMap::new();
            sections.insert("Introduction".to_string(), "word ".repeat(150));
            Ok(Some(ArchiveContent {
                abstract_text: None,
                flat_text: "word ".repeat(150),
                sections,
            }))
        }
        async fn rendered_page(&self, _archive_id: &str) -> Result<Option<String>, GatewayError> {
            Ok(None)
        }
        async fn lookup_by_persistent_id(&self, _doi: &str) -> Result<Option<String>, GatewayError> {
            Ok(None)
        }
    }

    struct Citations;

    #[async_trait]
    impl EnrichmentService for Citations {
        async fn lookup_one(&self, _doi: &str) -> Result<Option<EnrichmentFields>, GatewayError> {
            Ok(Some(EnrichmentFields { cited_by_count: Some(1), ..Default::default() }))
        }
        async fn lookup_batch(&self, dois: &[String]) -> Result<HashMap<String, EnrichmentFields>, GatewayError> {
            Ok(dois
                .iter()
                .map(|d| (d.clone(), EnrichmentFields { cited_by_count: Some(2), ..Default::default() }))
                .collect())
        }
    }

    fn orchestrator(dir: &std::path::Path, ids: usize, config: HarvestConfig) -> (BatchOrchestrator, Arc<Catalog>) {
        with_catalog(dir, ids, config, Catalog::default())
    }

    fn with_catalog(
        dir: &std::path::Path,
        ids: usize,
        config: HarvestConfig,
        catalog: Catalog,
    ) -> (BatchOrchestrator, Arc<Catalog>) {
        let catalog = Arc::new(catalog);
        let services = Services {
            search: Arc::new(Fixed((1..=ids).map(|i| i.to_string()).collect())),
            metadata: catalog.clone(),
            archive: Arc::new(Archive),
            enrichment: Arc::new(Citations),
        };
        let store = Arc::new(RecordStore::open(&dir.join("papers.db")).unwrap());
        (BatchOrchestrator::new(config, store, None, services), catalog)
    }

    fn test_config() -> HarvestConfig {
        let mut config = HarvestConfig::default();
        config.run.batch_size = 4;
        config.run.metadata_batch_size = 3;
        config.run.checkpoint_every = 1;
        config.search.page_delay_ms = 0;
        config
    }

    #[tokio::test]
    async fn test_run_accounts_for_every_id() {
        let dir = tempdir().unwrap();
        let (orchestrator, catalog) = orchestrator(dir.path(), 10, test_config());

        let report = orchestrator.run("q", None, Some("test")).await.unwrap();
        let s = &report.statistics;
        assert_eq!(s.found, 10);
        assert_eq!(s.processed, 5);
        assert_eq!(s.incomplete, 5);
        assert_eq!(s.with_enrichment, 5);
        assert_eq!(s.accounted(), 10);
        assert_eq!(report.incomplete.len(), 5);
        assert!(report.incomplete.iter().all(|e| e.reason == NO_FULL_TEXT_REASON));

        // chunks of 4 split into metadata sub-batches of at most 3
        assert!(catalog.bulk_calls.lock().unwrap().iter().all(|n| *n <= 3));

        let stored = orchestrator.store().get("2").unwrap().unwrap();
        assert_eq!(stored.collection_run_id, Some(report.run.id));
        assert!(stored.full_text.unwrap().starts_with("ABSTRACT:"));
        assert_eq!(
            orchestrator.store().run_statistics(report.run.id).unwrap().unwrap().1,
            RunStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_enrich_existing_refetches_incomplete_records() {
        let dir = tempdir().unwrap();
        let (first, _) = orchestrator(dir.path(), 4, test_config());
        first.run("q", None, None).await.unwrap();
        drop(first);

        let mut config = test_config();
        config.run.enrich_existing = true;
        let (second, _) = orchestrator(dir.path(), 4, config);
        let report = second.run("q", None, None).await.unwrap();

        // odd ids never get full text, so they are re-fetched
        assert_eq!(report.statistics.skipped, 2);
        assert_eq!(report.statistics.enriched_existing, 2);
        assert_eq!(report.statistics.incomplete, 2);
    }

    #[tokio::test]
    async fn test_rerun_skips_everything_stored() {
        let dir = tempdir().unwrap();
        let (first, _) = orchestrator(dir.path(), 6, test_config());
        first.run("q", None, None).await.unwrap();
        drop(first);

        let (second, catalog) = orchestrator(dir.path(), 6, test_config());
        let report = second.run("q", None, None).await.unwrap();
        assert_eq!(report.statistics.skipped, 6);
        assert_eq!(report.statistics.processed, 0);
        assert_eq!(report.statistics.incomplete, 0);
        assert!(catalog.bulk_calls.lock().unwrap().is_empty());
        assert_eq!(second.store().statistics().unwrap().total_records, 6);
    }

    #[tokio::test]
    async fn test_one_failing_id_does_not_sink_its_chunk() {
        let dir = tempdir().unwrap();
        let catalog = Catalog {
            unreachable: Some("3".into()),
            ..Default::default()
        };
        let (orchestrator, _) = with_catalog(dir.path(), 8, test_config(), catalog);

        let report = orchestrator.run("q", None, None).await.unwrap();
        assert_eq!(report.statistics.failed, 1);
        assert_eq!(report.statistics.accounted(), 8);
        assert!(orchestrator.store().get("3").unwrap().is_none());
        for id in ["1", "2", "4"] {
            assert!(orchestrator.store().exists(id).unwrap(), "{} missing", id);
        }
    }

    #[tokio::test]
    async fn test_run_from_dois_counts_unresolved_as_failed() {
        let dir = tempdir().unwrap();
        let mut config = test_config();
        config.run.doi_batch_size = 2;
        let (orchestrator, _) = orchestrator(dir.path(), 6, config);

        let dois: Vec<String> = ["10.1/2", "10.1/404", "https://doi.org/10.1/2", "10.1/4"]
            .iter()
            .map(|d| d.to_string())
            .collect();
        let report = orchestrator.run_from_dois(&dois, Some("doi list")).await.unwrap();

        let s = &report.statistics;
        assert_eq!(s.found, 3);
        assert_eq!(s.failed, 1);
        assert_eq!(s.processed, 2);
        assert_eq!(s.accounted(), 3);
        assert_eq!(report.unresolved, vec!["10.1/404".to_string()]);
        assert_eq!(report.run.query_text, "DOI list (3 DOIs)");
        assert!(orchestrator.store().exists("2").unwrap());
        assert!(orchestrator.store().exists("4").unwrap());
        assert!(report.summary().ends_with("1 DOIs unresolved"));
    }

    #[tokio::test]
    async fn test_check_max_stops_the_run() {
        let dir = tempdir().unwrap();
        let mut config = test_config();
        config.run.check_max = Some(5);
        let (orchestrator, _) = orchestrator(dir.path(), 5, config);

        let err = orchestrator.run("q", None, None).await.unwrap_err();
        assert!(matches!(err, HarvestError::Search(_)));
        let runs = orchestrator.store().list_runs(1).unwrap();
        assert_eq!(runs[0].1, RunStatus::Failed);
    }
}
