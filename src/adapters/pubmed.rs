//! PubMed client (NCBI E-utilities)
//!
//! Search goes through `esearch` with JSON output; metadata comes from
//! `efetch` PubMed XML. Every request runs through the shared NCBI gateway,
//! which supplies the identity (email and API key) it is issued under.
//! See: https://www.ncbi.nlm.nih.gov/books/NBK25499/

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{normalize_doi, MetadataService, SearchQuery, SearchService};
use crate::config::CleaningConfig;
use crate::error::GatewayError;
use crate::models::Record;
use crate::utils::http::{read_body, Identity, RateLimitedGateway};
use crate::utils::text::clean_abstract;
use crate::utils::xml::{self, Element};

pub const EUTILS_BASE_URL: &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils";
const TOOL_NAME: &str = "lit-harvest";
const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Deserialize)]
struct ESearchResponse {
    esearchresult: ESearchResult,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ESearchResult {
    #[serde(default)]
    pub(crate) count: Option<String>,
    #[serde(default)]
    pub(crate) idlist: Vec<String>,
    #[serde(rename = "ERROR", default)]
    error: Option<String>,
}

/// Query parameters identifying the caller to NCBI
pub(crate) fn identity_params(identity: &Identity) -> Vec<(&'static str, String)> {
    let mut params = vec![("tool", TOOL_NAME.to_string())];
    if let Some(ref email) = identity.email {
        params.push(("email", email.clone()));
    }
    if let Some(ref key) = identity.api_key {
        params.push(("api_key", key.clone()));
    }
    params
}

/// GET an E-utilities endpoint through the gateway and return the body
pub(crate) async fn eutils_get(
    client: &Client,
    gateway: &RateLimitedGateway,
    url: &str,
    operation: &str,
    params: &[(&'static str, String)],
) -> Result<Option<String>, GatewayError> {
    gateway
        .call(operation, |identity| {
            let request = client
                .get(url)
                .query(params)
                .query(&identity_params(&identity));
            async move { read_body(request.send().await?).await }
        })
        .await
}

/// Full esearch term, with the publication-date window when present
pub fn search_term(query: &SearchQuery) -> String {
    match query.date_range {
        Some(range) => format!(
            "({}) AND (\"{}\"[pdat] : \"{}\"[pdat])",
            query.text,
            range.start.format("%Y/%m/%d"),
            range.end.format("%Y/%m/%d")
        ),
        None => query.text.clone(),
    }
}

/// esearch term matching any of `dois`
pub fn doi_term(dois: &[String]) -> String {
    dois.iter()
        .map(|doi| format!("\"{}\"[DOI]", doi.trim()))
        .collect::<Vec<_>>()
        .join(" OR ")
}

/// Map the records in an efetch body back to the DOIs that were asked for
///
/// The first record carrying a wanted DOI wins.
pub fn match_dois(body: &str, wanted: &HashSet<String>, cleaning: &CleaningConfig) -> HashMap<String, String> {
    let mut found = HashMap::new();
    for record in parse_pubmed_xml(body, cleaning) {
        let Some(doi) = record.secondary_id.as_deref().map(normalize_doi) else { continue };
        if wanted.contains(&doi) {
            found.entry(doi).or_insert(record.primary_id);
        }
    }
    found
}

pub(crate) fn parse_esearch(body: &str) -> Result<ESearchResult, GatewayError> {
    let response: ESearchResponse = serde_json::from_str(body)?;
    if let Some(error) = response.esearchresult.error.as_deref() {
        return Err(GatewayError::Http {
            status: 400,
            message: error.to_string(),
        });
    }
    Ok(response.esearchresult)
}

/// Client for PubMed search and metadata
pub struct PubMedClient {
    client: Client,
    gateway: Arc<RateLimitedGateway>,
    base_url: String,
    cleaning: CleaningConfig,
}

impl PubMedClient {
    /// Create a new PubMed client bound to the NCBI gateway
    pub fn new(gateway: Arc<RateLimitedGateway>, cleaning: CleaningConfig) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(|e| GatewayError::Transient(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self::with_client(client, gateway, cleaning))
    }

    /// Create a new client with an existing reqwest client
    pub fn with_client(client: Client, gateway: Arc<RateLimitedGateway>, cleaning: CleaningConfig) -> Self {
        Self {
            client,
            gateway,
            base_url: EUTILS_BASE_URL.to_string(),
            cleaning,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn esearch(&self, params: Vec<(&'static str, String)>) -> Result<Option<ESearchResult>, GatewayError> {
        let url = format!("{}/esearch.fcgi", self.base_url);
        match eutils_get(&self.client, &self.gateway, &url, "esearch", &params).await? {
            Some(body) => parse_esearch(&body).map(Some),
            None => Ok(None),
        }
    }

    async fn efetch(&self, ids: &[String]) -> Result<Option<String>, GatewayError> {
        let url = format!("{}/efetch.fcgi", self.base_url);
        let params = vec![
            ("db", "pubmed".to_string()),
            ("id", ids.join(",")),
            ("retmode", "xml".to_string()),
        ];
        eutils_get(&self.client, &self.gateway, &url, "efetch", &params).await
    }
}

#[async_trait]
impl SearchService for PubMedClient {
    async fn count(&self, query: &SearchQuery) -> Result<usize, GatewayError> {
        let params = vec![
            ("db", "pubmed".to_string()),
            ("term", search_term(query)),
            ("retmax", "0".to_string()),
            ("retmode", "json".to_string()),
        ];
        let Some(result) = self.esearch(params).await? else {
            return Ok(0);
        };
        let count = result
            .count
            .as_deref()
            .unwrap_or("0")
            .parse::<usize>()
            .map_err(|e| GatewayError::Decode(format!("bad esearch count: {}", e)))?;
        debug!("PubMed count for {:?}: {}", query.date_range, count);
        Ok(count)
    }

    async fn page(
        &self,
        query: &SearchQuery,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<String>, GatewayError> {
        let params = vec![
            ("db", "pubmed".to_string()),
            ("term", search_term(query)),
            ("retstart", offset.to_string()),
            ("retmax", limit.to_string()),
            ("sort", "relevance".to_string()),
            ("retmode", "json".to_string()),
        ];
        Ok(self.esearch(params).await?.map(|r| r.idlist).unwrap_or_default())
    }

    async fn ids_for_dois(&self, dois: &[String]) -> Result<HashMap<String, String>, GatewayError> {
        if dois.is_empty() {
            return Ok(HashMap::new());
        }
        let params = vec![
            ("db", "pubmed".to_string()),
            ("term", doi_term(dois)),
            ("retmax", dois.len().to_string()),
            ("retmode", "json".to_string()),
        ];
        let pmids = self.esearch(params).await?.map(|r| r.idlist).unwrap_or_default();
        if pmids.is_empty() {
            return Ok(HashMap::new());
        }

        // esearch does not say which DOI produced which PMID
        let Some(body) = self.efetch(&pmids).await? else {
            return Ok(HashMap::new());
        };
        let wanted: HashSet<String> = dois.iter().map(|d| normalize_doi(d)).collect();
        let found = match_dois(&body, &wanted, &self.cleaning);
        debug!("{} of {} DOIs resolved to PMIDs", found.len(), dois.len());
        Ok(found)
    }
}

#[async_trait]
impl MetadataService for PubMedClient {
    async fn fetch_bulk(&self, ids: &[String]) -> Result<HashMap<String, Record>, GatewayError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let Some(body) = self.efetch(ids).await? else {
            return Ok(HashMap::new());
        };

        let records: HashMap<String, Record> = parse_pubmed_xml(&body, &self.cleaning)
            .into_iter()
            .map(|r| (r.primary_id.clone(), r))
            .collect();

        let missing: Vec<&str> = ids
            .iter()
            .filter(|id| !records.contains_key(id.as_str()))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            warn!(
                "{} of {} PMIDs not returned in batch: {}",
                missing.len(),
                ids.len(),
                missing.iter().take(10).copied().collect::<Vec<_>>().join(", ")
            );
        }
        Ok(records)
    }

    async fn fetch_one(&self, id: &str) -> Result<Option<Record>, GatewayError> {
        let ids = [id.to_string()];
        let Some(body) = self.efetch(&ids).await? else {
            return Ok(None);
        };
        Ok(parse_pubmed_xml(&body, &self.cleaning)
            .into_iter()
            .find(|r| r.primary_id == id))
    }
}

/// Parse an efetch PubMed XML document into records
///
/// Handles both journal articles and book chapters. Entries without a PMID
/// are dropped.
pub fn parse_pubmed_xml(body: &str, cleaning: &CleaningConfig) -> Vec<Record> {
    let doc = xml::parse(body);
    let mut records = Vec::new();

    for article in doc.find_all("PubmedArticle") {
        match parse_journal_article(article, cleaning) {
            Some(record) => records.push(record),
            None => warn!("Skipping PubmedArticle without a PMID"),
        }
    }
    for book in doc.find_all("PubmedBookArticle") {
        match parse_book_article(book, cleaning) {
            Some(record) => records.push(record),
            None => warn!("Skipping PubmedBookArticle without a PMID"),
        }
    }
    records
}

fn parse_journal_article(article: &Element, cleaning: &CleaningConfig) -> Option<Record> {
    let citation = article.child("MedlineCitation")?;
    let pmid = citation.child("PMID")?.trimmed_text()?;
    let mut record = Record::new(pmid);
    record.source = Some("pubmed".into());

    if let Some(ids) = article.path("PubmedData/ArticleIdList") {
        for id in ids.children_named("ArticleId") {
            let Some(value) = id.trimmed_text() else { continue };
            if value.starts_with("PMC") && record.archive_id.is_none() {
                record.archive_id = Some(value);
            } else if id.attr("IdType") == Some("doi") && record.secondary_id.is_none() {
                record.secondary_id = Some(value);
            }
        }
    }

    if let Some(art) = citation.child("Article") {
        record.title = art.child("ArticleTitle").and_then(Element::trimmed_text);
        record.abstract_text = art.child("Abstract").and_then(|a| abstract_text(a, cleaning));
        record.authors = art.child("AuthorList").map(authors).unwrap_or_default();
        if let Some(journal) = art.child("Journal") {
            record.journal = journal.child("Title").and_then(Element::trimmed_text);
            if let Some(pub_date) = journal.path("JournalIssue/PubDate") {
                let (year, date) = publication_date(pub_date);
                record.year = year;
                record.date_published = date;
            }
        }
    }

    if let Some(mesh) = citation.child("MeshHeadingList") {
        record.mesh_terms = mesh
            .children_named("MeshHeading")
            .filter_map(|h| h.child("DescriptorName").and_then(Element::trimmed_text))
            .collect();
    }
    if let Some(keywords) = citation.child("KeywordList") {
        record.keywords = keywords
            .children_named("Keyword")
            .filter_map(Element::trimmed_text)
            .collect();
    }

    Some(record)
}

fn parse_book_article(book: &Element, cleaning: &CleaningConfig) -> Option<Record> {
    let document = book.child("BookDocument")?;

    let pubmed_id = book.path("PubmedBookData/ArticleIdList").and_then(|list| {
        list.children_named("ArticleId")
            .find(|id| id.attr("IdType") == Some("pubmed"))
            .or_else(|| list.child("ArticleId"))
            .and_then(Element::trimmed_text)
    });
    let pmid = pubmed_id.or_else(|| document.child("PMID").and_then(Element::trimmed_text))?;

    let mut record = Record::new(pmid);
    record.source = Some("pubmed".into());
    record.title = document
        .child("ArticleTitle")
        .or_else(|| document.path("Book/BookTitle"))
        .and_then(Element::trimmed_text);
    record.abstract_text = document.child("Abstract").and_then(|a| abstract_text(a, cleaning));
    record.authors = document.child("AuthorList").map(authors).unwrap_or_default();
    record.journal = document.path("Book/BookTitle").and_then(Element::trimmed_text);

    let pub_date = document
        .path("Book/PubDate")
        .or_else(|| book.path("PubmedBookData/History/PubMedPubDate"));
    if let Some(pub_date) = pub_date {
        let (year, date) = publication_date(pub_date);
        record.year = year;
        record.date_published = date;
    }

    if let Some(ids) = document.child("ArticleIdList") {
        record.secondary_id = ids
            .children_named("ArticleId")
            .find(|id| id.attr("IdType") == Some("doi"))
            .and_then(Element::trimmed_text);
    }
    Some(record)
}

/// Abstract parts joined with their labels ("Methods: ...")
fn abstract_text(abstract_el: &Element, cleaning: &CleaningConfig) -> Option<String> {
    let parts: Vec<String> = abstract_el
        .children_named("AbstractText")
        .filter_map(|part| {
            let text = part.trimmed_text()?;
            Some(match part.attr("Label") {
                Some(label) if !label.is_empty() => format!("{}: {}", label, text),
                _ => text,
            })
        })
        .collect();
    if parts.is_empty() {
        return None;
    }
    let joined = parts.join(" ");
    Some(if cleaning.clean_abstract {
        clean_abstract(&joined)
    } else {
        joined
    })
}

fn authors(list: &Element) -> Vec<String> {
    list.children_named("Author")
        .filter_map(|author| {
            if let Some(last) = author.child("LastName").and_then(Element::trimmed_text) {
                return Some(match author.child("Initials").and_then(Element::trimmed_text) {
                    Some(initials) => format!("{} {}", last, initials),
                    None => last,
                });
            }
            author.child("CollectiveName").and_then(Element::trimmed_text)
        })
        .collect()
}

/// `(year, "YYYY-MM-DD")` from a PubDate-like element
///
/// Missing month or day default to 01. `MedlineDate` values such as
/// "1998 Dec-1999 Jan" contribute only their year.
fn publication_date(pub_date: &Element) -> (Option<i32>, Option<String>) {
    let year = pub_date
        .child("Year")
        .and_then(Element::trimmed_text)
        .or_else(|| {
            pub_date
                .child("MedlineDate")
                .and_then(Element::trimmed_text)
                .and_then(|d| d.get(..4).map(str::to_string))
        })
        .and_then(|y| y.parse::<i32>().ok());

    let Some(year) = year else {
        return (None, None);
    };
    let month = pub_date
        .child("Month")
        .and_then(Element::trimmed_text)
        .and_then(|m| month_number(&m))
        .unwrap_or(1);
    let day = pub_date
        .child("Day")
        .and_then(Element::trimmed_text)
        .and_then(|d| d.parse::<u32>().ok())
        .filter(|d| (1..=31).contains(d))
        .unwrap_or(1);

    (Some(year), Some(format!("{:04}-{:02}-{:02}", year, month, day)))
}

fn month_number(month: &str) -> Option<u32> {
    if let Ok(n) = month.parse::<u32>() {
        return (1..=12).contains(&n).then_some(n);
    }
    const MONTHS: [&str; 12] = [
        "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
    ];
    let prefix = month.get(..3)?.to_lowercase();
    MONTHS.iter().position(|m| *m == prefix).map(|i| i as u32 + 1)
}
