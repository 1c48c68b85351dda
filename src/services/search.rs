//! Query resolution past the search service's result-window cap
//!
//! A query whose hit count fits under the cap is paged directly. Larger ones
//! are split into publication-date partitions (year, then month, then day),
//! each small enough to page on its own. Partitions are kept on an explicit
//! work stack, most recent first.

use chrono::{Datelike, Months, NaiveDate, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::adapters::{DateRange, SearchQuery, SearchService};
use crate::config::SearchConfig;
use crate::error::HarvestError;
use crate::storage::ResultCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Granularity {
    Year,
    Month,
    Day,
}

#[derive(Debug, Clone, Copy)]
struct Partition {
    range: DateRange,
    granularity: Granularity,
}

/// Insertion-ordered identifier set
#[derive(Default)]
struct Collector {
    ids: Vec<String>,
    seen: HashSet<String>,
}

impl Collector {
    fn extend(&mut self, ids: Vec<String>, target: usize) -> usize {
        let before = self.ids.len();
        for id in ids {
            if self.ids.len() >= target {
                break;
            }
            if self.seen.insert(id.clone()) {
                self.ids.push(id);
            }
        }
        self.ids.len() - before
    }

    fn len(&self) -> usize {
        self.ids.len()
    }
}

/// Resolves a query to its complete identifier list
pub struct PaginatedSearch {
    service: Arc<dyn SearchService>,
    cache: Option<Arc<ResultCache>>,
    config: SearchConfig,
}

impl PaginatedSearch {
    pub fn new(service: Arc<dyn SearchService>, cache: Option<Arc<ResultCache>>, config: SearchConfig) -> Self {
        Self { service, cache, config }
    }

    /// Every identifier matching `query`, up to `max_results`, without duplicates
    pub async fn resolve(&self, query: &str, max_results: Option<usize>) -> Result<Vec<String>, HarvestError> {
        let limit = max_results.unwrap_or(usize::MAX);

        if self.config.use_cache {
            if let Some(mut cached) = self.cache.as_ref().and_then(|c| c.get(query)) {
                cached.truncate(limit);
                return Ok(cached);
            }
        }

        let base = SearchQuery::new(query);
        let total = self.service.count(&base).await?;
        info!("Search reports {} total results", total);

        let mut failed = Vec::new();
        let ids = if total == 0 {
            Vec::new()
        } else {
            let target = total.min(limit);
            if target <= self.config.window_cap {
                let mut collector = Collector::default();
                self.fetch_pages(&base, target, target, &mut collector).await?;
                collector.ids
            } else {
                info!(
                    "{} results exceed the window cap of {}; partitioning by date",
                    target, self.config.window_cap
                );
                let (ids, failed_partitions) = self.partitioned(&base, target).await;
                failed = failed_partitions;
                ids
            }
        };

        if ids.len() < total.min(limit) {
            debug!("Resolved {} of {} reported results", ids.len(), total.min(limit));
        }
        if failed.is_empty() {
            self.store(query, &ids);
        } else {
            warn!(
                "{} date partitions failed; returning {} ids without caching them",
                failed.len(),
                ids.len()
            );
        }
        Ok(ids)
    }

    fn store(&self, query: &str, ids: &[String]) {
        let Some(cache) = self.cache.as_ref() else { return };
        if let Err(e) = cache.set(query, ids) {
            warn!("Failed to cache search results: {}", e);
        }
    }

    /// Page through one (sub)query, collecting at most `limit` hits
    async fn fetch_pages(
        &self,
        query: &SearchQuery,
        limit: usize,
        target: usize,
        collector: &mut Collector,
    ) -> Result<(), HarvestError> {
        let limit = limit.min(self.config.window_cap);
        let mut offset = 0;

        while offset < limit && collector.len() < target {
            let size = self.config.page_size.min(limit - offset);
            let page = self.service.page(query, offset, size).await?;
            if page.is_empty() {
                break;
            }
            let returned = page.len();
            let added = collector.extend(page, target);
            debug!(
                "Page at offset {}: {} ids, {} new ({} total)",
                offset,
                returned,
                added,
                collector.len()
            );

            offset += returned;
            if offset < limit && collector.len() < target {
                sleep_ms(self.config.page_delay_ms).await;
            }
        }
        Ok(())
    }

    /// Collect across date partitions
    ///
    /// A partition whose count or pages fail is skipped and returned in the
    /// second list; ids it contributed before failing are kept.
    async fn partitioned(&self, base: &SearchQuery, target: usize) -> (Vec<String>, Vec<DateRange>) {
        let latest = Utc::now().year();
        let earliest = self.config.earliest_year.min(latest);

        // oldest pushed first so the most recent year is popped first
        let mut stack: Vec<Partition> = (earliest..=latest)
            .filter_map(|year| {
                Some(Partition {
                    range: DateRange {
                        start: NaiveDate::from_ymd_opt(year, 1, 1)?,
                        end: NaiveDate::from_ymd_opt(year, 12, 31)?,
                    },
                    granularity: Granularity::Year,
                })
            })
            .collect();

        let mut collector = Collector::default();
        let mut failed = Vec::new();
        while let Some(partition) = stack.pop() {
            if collector.len() >= target {
                break;
            }

            let scoped = base.within(partition.range);
            let count = match self.service.count(&scoped).await {
                Ok(count) => count,
                Err(e) => {
                    warn!(
                        "Count failed for {} to {}, skipping partition: {}",
                        partition.range.start, partition.range.end, e
                    );
                    failed.push(partition.range);
                    continue;
                }
            };
            sleep_ms(self.config.partition_delay_ms).await;
            if count == 0 {
                continue;
            }

            if count > self.config.window_cap {
                if let Some(children) = split(partition) {
                    debug!(
                        "{} results in {} to {}; splitting into {} partitions",
                        count,
                        partition.range.start,
                        partition.range.end,
                        children.len()
                    );
                    stack.extend(children);
                    continue;
                }
                warn!(
                    "{} results on {} exceed the window cap; keeping the first {}",
                    count, partition.range.start, self.config.window_cap
                );
            }

            let before = collector.len();
            if let Err(e) = self.fetch_pages(&scoped, count, target, &mut collector).await {
                warn!(
                    "Paging failed for {} to {} after {} ids: {}",
                    partition.range.start,
                    partition.range.end,
                    collector.len() - before,
                    e
                );
                failed.push(partition.range);
                continue;
            }
            debug!(
                "Partition {} to {}: {} new ids ({} of {})",
                partition.range.start,
                partition.range.end,
                collector.len() - before,
                collector.len(),
                target
            );
        }

        if collector.len() < target {
            info!(
                "Date partitioning found {} unique ids (search reported {})",
                collector.len(),
                target
            );
        }
        (collector.ids, failed)
    }
}

/// Finer partitions covering `partition`, ordered so the latest pops first
fn split(partition: Partition) -> Option<Vec<Partition>> {
    let DateRange { start, end } = partition.range;
    let (granularity, ranges) = match partition.granularity {
        Granularity::Year => {
            let ranges = (0..12)
                .filter_map(|m| {
                    let first = start.checked_add_months(Months::new(m))?;
                    let last = first.checked_add_months(Months::new(1))?.pred_opt()?;
                    Some(DateRange {
                        start: first,
                        end: last.min(end),
                    })
                })
                .collect::<Vec<_>>();
            (Granularity::Month, ranges)
        }
        Granularity::Month => {
            let ranges = start
                .iter_days()
                .take_while(|day| *day <= end)
                .map(|day| DateRange { start: day, end: day })
                .collect::<Vec<_>>();
            (Granularity::Day, ranges)
        }
        Granularity::Day => return None,
    };

    Some(
        ranges
            .into_iter()
            .map(|range| Partition { range, granularity })
            .collect(),
    )
}

async fn sleep_ms(ms: u64) {
    if ms > 0 {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    /// In-memory index of (id, publication date) pairs
    struct FakeSearch {
        entries: Vec<(String, NaiveDate)>,
        counts: AtomicUsize,
    }

    impl FakeSearch {
        fn new(entries: Vec<(String, NaiveDate)>) -> Self {
            Self {
                entries,
                counts: AtomicUsize::new(0),
            }
        }

        fn matching(&self, query: &SearchQuery) -> Vec<String> {
            self.entries
                .iter()
                .filter(|(_, date)| {
                    query
                        .date_range
                        .map_or(true, |r| *date >= r.start && *date <= r.end)
                })
                .map(|(id, _)| id.clone())
                .collect()
        }
    }

    #[async_trait]
    impl SearchService for FakeSearch {
        async fn count(&self, query: &SearchQuery) -> Result<usize, GatewayError> {
            self.counts.fetch_add(1, Ordering::SeqCst);
            Ok(self.matching(query).len())
        }

        async fn page(&self, query: &SearchQuery, offset: usize, limit: usize) -> Result<Vec<String>, GatewayError> {
            Ok(self.matching(query).into_iter().skip(offset).take(limit).collect())
        }

        async fn ids_for_dois(&self, _dois: &[String]) -> Result<HashMap<String, String>, GatewayError> {
            Ok(HashMap::new())
        }
    }

    /// Fails every count scoped to `year`, or every count when `year` is None
    struct Outage {
        inner: FakeSearch,
        year: Option<i32>,
    }

    #[async_trait]
    impl SearchService for Outage {
        async fn count(&self, query: &SearchQuery) -> Result<usize, GatewayError> {
            let hit = match (self.year, query.date_range) {
                (None, _) => true,
                (Some(year), Some(range)) => range.start.year() == year,
                (Some(_), None) => false,
            };
            if hit {
                return Err(GatewayError::Transient("connection reset".into()));
            }
            self.inner.count(query).await
        }

        async fn page(&self, query: &SearchQuery, offset: usize, limit: usize) -> Result<Vec<String>, GatewayError> {
            self.inner.page(query, offset, limit).await
        }

        async fn ids_for_dois(&self, dois: &[String]) -> Result<HashMap<String, String>, GatewayError> {
            self.inner.ids_for_dois(dois).await
        }
    }

    fn config(window_cap: usize) -> SearchConfig {
        SearchConfig {
            window_cap,
            page_size: 4,
            page_delay_ms: 0,
            partition_delay_ms: 0,
            earliest_year: Utc::now().year() - 3,
            use_cache: true,
        }
    }

    /// `per_year` ids in each of the last three years, spread over the months
    fn corpus(per_year: usize) -> Vec<(String, NaiveDate)> {
        let this_year = Utc::now().year();
        let mut entries = Vec::new();
        for (y, year) in (this_year - 2..=this_year).enumerate() {
            for i in 0..per_year {
                let month = (i % 12) as u32 + 1;
                let date = NaiveDate::from_ymd_opt(year, month, 1 + (i % 28) as u32).unwrap();
                entries.push((format!("{}-{}", y, i), date));
            }
        }
        entries
    }

    #[tokio::test]
    async fn test_direct_paging_under_cap() {
        let service = Arc::new(FakeSearch::new(corpus(3)));
        let search = PaginatedSearch::new(service, None, config(100));

        let ids = search.resolve("q", None).await.unwrap();
        assert_eq!(ids.len(), 9);

        let limited = search.resolve("q", Some(5)).await.unwrap();
        assert_eq!(limited.len(), 5);
    }

    #[tokio::test]
    async fn test_partitioning_is_complete_and_unique() {
        let mut entries = corpus(30);
        // the same id indexed under two dates is counted twice by the service
        let duplicate = entries[0].clone();
        entries.push((duplicate.0, NaiveDate::from_ymd_opt(Utc::now().year() - 2, 6, 15).unwrap()));
        let unique = entries.len() - 1;

        let service = Arc::new(FakeSearch::new(entries));
        let search = PaginatedSearch::new(service, None, config(10));

        let ids = search.resolve("q", None).await.unwrap();
        assert_eq!(ids.len(), unique);
        let distinct: HashSet<&String> = ids.iter().collect();
        assert_eq!(distinct.len(), ids.len());
    }

    #[tokio::test]
    async fn test_partitioning_stops_at_target() {
        let service = Arc::new(FakeSearch::new(corpus(30)));
        let search = PaginatedSearch::new(service, None, config(10));

        let ids = search.resolve("q", Some(25)).await.unwrap();
        assert_eq!(ids.len(), 25);
        // most recent year first
        assert!(ids[0].starts_with("2-"));
    }

    #[tokio::test]
    async fn test_day_level_split() {
        let day = NaiveDate::from_ymd_opt(Utc::now().year() - 1, 3, 9).unwrap();
        let mut entries: Vec<(String, NaiveDate)> = (0..8).map(|i| (format!("d{}", i), day)).collect();
        entries.extend((0..8).map(|i| (format!("e{}", i), day.succ_opt().unwrap())));

        let service = Arc::new(FakeSearch::new(entries));
        let search = PaginatedSearch::new(service, None, config(10));
        assert_eq!(search.resolve("q", None).await.unwrap().len(), 16);
    }

    #[tokio::test]
    async fn test_results_are_cached_including_empty() {
        let dir = tempdir().unwrap();
        let cache = Arc::new(ResultCache::open(dir.path().join("cache.json")));
        let service = Arc::new(FakeSearch::new(corpus(2)));
        let search = PaginatedSearch::new(service.clone(), Some(cache.clone()), config(100));

        let first = search.resolve("sleep  AND memory", None).await.unwrap();
        let calls = service.counts.load(Ordering::SeqCst);
        let second = search.resolve("sleep AND memory", Some(3)).await.unwrap();

        assert_eq!(service.counts.load(Ordering::SeqCst), calls);
        assert_eq!(second, first[..3].to_vec());

        let empty = PaginatedSearch::new(Arc::new(FakeSearch::new(Vec::new())), Some(cache.clone()), config(100));
        assert!(empty.resolve("nothing", None).await.unwrap().is_empty());
        assert_eq!(cache.get("nothing"), Some(Vec::new()));
    }

    #[tokio::test]
    async fn test_failed_year_is_skipped_and_not_cached() {
        let dir = tempdir().unwrap();
        let cache = Arc::new(ResultCache::open(dir.path().join("cache.json")));
        let service = Arc::new(Outage {
            inner: FakeSearch::new(corpus(30)),
            year: Some(Utc::now().year() - 2),
        });
        let search = PaginatedSearch::new(service, Some(cache.clone()), config(10));

        let ids = search.resolve("q", None).await.unwrap();
        assert_eq!(ids.len(), 60);
        assert!(ids.iter().all(|id| !id.starts_with("0-")));
        assert_eq!(cache.get("q"), None);
    }

    #[tokio::test]
    async fn test_failed_total_count_is_an_error() {
        let dir = tempdir().unwrap();
        let cache = Arc::new(ResultCache::open(dir.path().join("cache.json")));
        let service = Arc::new(Outage {
            inner: FakeSearch::new(corpus(3)),
            year: None,
        });
        let search = PaginatedSearch::new(service, Some(cache.clone()), config(100));

        let err = search.resolve("q", None).await.unwrap_err();
        assert!(matches!(err, HarvestError::Gateway(GatewayError::Transient(_))));
        assert_eq!(cache.get("q"), None);
    }

    #[test]
    fn test_split_year_into_months() {
        let year = Partition {
            range: DateRange {
                start: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                end: NaiveDate::from_ymd_opt(2024, 12, 31).unwrap(),
            },
            granularity: Granularity::Year,
        };
        let months = split(year).unwrap();
        assert_eq!(months.len(), 12);
        assert_eq!(months[1].range.end, NaiveDate::from_ymd_opt(2024, 2, 29).unwrap());
        assert_eq!(months[11].range.end, NaiveDate::from_ymd_opt(2024, 12, 31).unwrap());

        let days = split(months[1]).unwrap();
        assert_eq!(days.len(), 29);
        assert!(split(days[0]).is_none());
    }
}
