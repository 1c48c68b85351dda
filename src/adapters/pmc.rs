//! PubMed Central full-text client
//!
//! Structured full text comes from JATS XML (`efetch db=pmc`). When that is
//! thin, the rendered article page can be scraped instead. Both paths only
//! extract content here; quality checks and cleaning belong to the
//! extraction chain.

use async_trait::async_trait;
use indexmap::IndexMap;
use reqwest::Client;
use scraper::{ElementRef, Html, Selector};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::pubmed::{eutils_get, parse_esearch, EUTILS_BASE_URL};
use super::{ArchiveContent, ArchiveService};
use crate::error::GatewayError;
use crate::utils::http::{read_body, RateLimitedGateway};
use crate::utils::text::normalize_whitespace;
use crate::utils::xml::{self, Element};

pub const ARTICLE_PAGE_BASE_URL: &str = "https://www.ncbi.nlm.nih.gov/pmc/articles";
const DEFAULT_TIMEOUT_SECS: u64 = 60;
const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

/// Paragraphs shorter than this are treated as captions or furniture
const MIN_PARAGRAPH_CHARS: usize = 30;
/// Scraped pages with less text than this are discarded
const MIN_SCRAPED_CHARS: usize = 500;

/// Client for PMC structured full text and article pages
pub struct PmcClient {
    client: Client,
    gateway: Arc<RateLimitedGateway>,
    eutils_url: String,
    page_url: String,
}

/// Numeric part of a PMCID ("PMC123" -> "123")
pub fn pmc_number(archive_id: &str) -> &str {
    let trimmed = archive_id.trim();
    trimmed
        .strip_prefix("PMC")
        .or_else(|| trimmed.strip_prefix("pmc"))
        .unwrap_or(trimmed)
}

impl PmcClient {
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
            eutils_url: EUTILS_BASE_URL.to_string(),
            page_url: ARTICLE_PAGE_BASE_URL.to_string(),
        }
    }

    pub fn with_base_urls(mut self, eutils_url: impl Into<String>, page_url: impl Into<String>) -> Self {
        self.eutils_url = eutils_url.into();
        self.page_url = page_url.into();
        self
    }
}

#[async_trait]
impl ArchiveService for PmcClient {
    async fn fetch_structured(&self, archive_id: &str) -> Result<Option<ArchiveContent>, GatewayError> {
        let url = format!("{}/efetch.fcgi", self.eutils_url);
        let params = vec![
            ("db", "pmc".to_string()),
            ("id", pmc_number(archive_id).to_string()),
            ("rettype", "full".to_string()),
            ("retmode", "xml".to_string()),
        ];
        let Some(body) = eutils_get(&self.client, &self.gateway, &url, "pmc efetch", &params).await? else {
            return Ok(None);
        };

        let content = parse_jats(&body);
        if content.is_none() {
            debug!("No <article> element in PMC XML for {}", archive_id);
        }
        Ok(content)
    }

    async fn rendered_page(&self, archive_id: &str) -> Result<Option<String>, GatewayError> {
        let url = format!("{}/PMC{}/", self.page_url, pmc_number(archive_id));
        debug!("Fetching rendered article page {}", url);

        self.gateway
            .call("pmc page", |_identity| {
                let request = self
                    .client
                    .get(&url)
                    .header(reqwest::header::USER_AGENT, BROWSER_USER_AGENT);
                async move { read_body(request.send().await?).await }
            })
            .await
    }

    async fn lookup_by_persistent_id(&self, doi: &str) -> Result<Option<String>, GatewayError> {
        let url = format!("{}/esearch.fcgi", self.eutils_url);
        let params = vec![
            ("db", "pmc".to_string()),
            ("term", format!("\"{}\"[DOI]", doi)),
            ("retmax", "1".to_string()),
            ("retmode", "json".to_string()),
        ];
        let Some(body) = eutils_get(&self.client, &self.gateway, &url, "pmc doi lookup", &params).await? else {
            return Ok(None);
        };

        let found = parse_esearch(&body)?
            .idlist
            .into_iter()
            .next()
            .map(|id| format!("PMC{}", pmc_number(&id)));
        debug!("DOI {} resolved to {:?}", doi, found);
        Ok(found)
    }
}

/// Extract abstract and sections from a JATS document
///
/// Nested sections are keyed `Parent/Child`; untitled ones become
/// `Section <depth>`. Paragraphs sitting directly in `<body>` are gathered
/// under `Main`. Documents without recognizable structure fall back to the
/// raw text of `<body>`, then `<front>`/`<back>`, then the whole article.
/// Returns `None` when there is no `<article>` element at all.
pub fn parse_jats(body: &str) -> Option<ArchiveContent> {
    let doc = xml::parse(body);
    let article = doc.find("article")?;
    let abstract_text = article.find("abstract").and_then(Element::trimmed_text);

    let mut sections = IndexMap::new();
    let mut flat = String::new();

    if let Some(body) = article.find("body") {
        for sec in body.children_named("sec") {
            collect_section(sec, 1, "", &mut sections, &mut flat);
        }
        let main = direct_paragraphs(body, 0);
        if !main.is_empty() {
            flat.push_str(&main);
            flat.push_str("\n\n");
            sections.insert("Main".to_string(), main);
        }
    } else {
        let mut top_level = Vec::new();
        outermost(article, "sec", &mut top_level);
        for sec in top_level {
            collect_section(sec, 1, "", &mut sections, &mut flat);
        }

        let mut loose = Vec::new();
        loose_paragraphs(article, &mut loose);
        for text in loose {
            flat.push_str(&text);
            flat.push_str("\n\n");
        }
    }

    if flat.trim().is_empty() {
        fallback_content(article, abstract_text.as_deref(), &mut sections, &mut flat);
    }

    Some(ArchiveContent {
        abstract_text,
        sections,
        flat_text: flat.trim().to_string(),
    })
}

fn collect_section(
    sec: &Element,
    depth: usize,
    parent_path: &str,
    sections: &mut IndexMap<String, String>,
    flat: &mut String,
) {
    let title = sec.child("title").and_then(Element::trimmed_text);
    let name = title.clone().unwrap_or_else(|| format!("Section {}", depth));
    let path = if parent_path.is_empty() {
        name.clone()
    } else {
        format!("{}/{}", parent_path, name)
    };

    if let Some(ref title) = title {
        flat.push_str(&format!("{} {}\n\n", "#".repeat(depth), title));
    }

    let content = direct_paragraphs(sec, 0);
    if !content.is_empty() {
        flat.push_str(&content);
        flat.push_str("\n\n");
        sections.insert(path.clone(), content);
    }

    for child in sec.children_named("sec") {
        collect_section(child, depth + 1, &path, sections, flat);
    }
}

/// Text of the direct `<p>` children longer than `min_chars`, blank-line separated
fn direct_paragraphs(el: &Element, min_chars: usize) -> String {
    el.children_named("p")
        .filter_map(Element::trimmed_text)
        .filter(|text| text.chars().count() > min_chars)
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Outermost descendants named `name`; matches inside a match are skipped
fn outermost<'a>(el: &'a Element, name: &str, out: &mut Vec<&'a Element>) {
    for child in el.elements() {
        if child.name == name {
            out.push(child);
        } else {
            outermost(child, name, out);
        }
    }
}

/// Substantial paragraphs outside the abstract and outside any section
fn loose_paragraphs(el: &Element, out: &mut Vec<String>) {
    for child in el.elements() {
        match child.name.as_str() {
            "abstract" | "sec" => continue,
            "p" => {
                if let Some(text) = child.trimmed_text() {
                    if text.chars().count() > MIN_PARAGRAPH_CHARS {
                        out.push(text);
                    }
                }
            }
            _ => loose_paragraphs(child, out),
        }
    }
}

fn fallback_content(
    article: &Element,
    abstract_text: Option<&str>,
    sections: &mut IndexMap<String, String>,
    flat: &mut String,
) {
    if let Some(text) = article.find("body").and_then(Element::trimmed_text) {
        if text.chars().count() > 100 {
            flat.push_str(&text);
            sections.insert("Body".to_string(), text);
            return;
        }
    }

    let mut found = false;
    for (tag, label) in [("front", "Front"), ("back", "Back")] {
        if let Some(text) = article.find(tag).and_then(Element::trimmed_text) {
            if text.chars().count() > 100 {
                flat.push_str(&format!("\n\n## {}\n{}", tag.to_uppercase(), text));
                sections.insert(label.to_string(), text);
                found = true;
            }
        }
    }
    if found {
        return;
    }

    let mut all = normalize_whitespace(&article.text());
    if let Some(abstract_text) = abstract_text.filter(|a| !a.is_empty()) {
        all = all.replace(abstract_text, "").trim().to_string();
    }
    if all.chars().count() > 200 {
        flat.push_str(&all);
        sections.insert("Content".to_string(), all);
    }
}

/// Extract titled sections from a rendered PMC article page
///
/// Pages with under 500 characters of paragraph text yield empty content.
pub fn parse_article_html(html: &str) -> ArchiveContent {
    let document = Html::parse_document(html);
    let Some(body) = article_root(&document) else {
        debug!("Could not find article body in HTML");
        return ArchiveContent::default();
    };

    let mut sections = IndexMap::new();
    let mut flat = String::new();

    if let (Ok(containers), Ok(headings)) = (Selector::parse("div, section"), Selector::parse("h2, h3, h4, title")) {
        for section in body.select(&containers) {
            let title = section
                .select(&headings)
                .next()
                .map(|h| normalize_whitespace(&h.text().collect::<String>()))
                .filter(|t| !t.is_empty() && t.chars().count() < 200);
            if let Some(ref title) = title {
                flat.push_str(&format!("\n## {}\n\n", title));
            }

            let paragraphs: Vec<String> = section
                .children()
                .filter_map(ElementRef::wrap)
                .filter(|child| child.value().name() == "p")
                .map(|p| normalize_whitespace(&p.text().collect::<String>()))
                .filter(|text| text.chars().count() > MIN_PARAGRAPH_CHARS)
                .collect();
            for text in &paragraphs {
                flat.push_str(text);
                flat.push_str("\n\n");
            }

            if let Some(title) = title {
                if !paragraphs.is_empty() {
                    sections.insert(title, paragraphs.join("\n\n"));
                }
            }
        }
    }

    if paragraph_text_is_empty(&flat) {
        flat.clear();
        if let Ok(p_selector) = Selector::parse("p") {
            for p in body.select(&p_selector) {
                let text = normalize_whitespace(&p.text().collect::<String>());
                if text.chars().count() > MIN_PARAGRAPH_CHARS {
                    flat.push_str(&text);
                    flat.push_str("\n\n");
                }
            }
        }
    }

    let flat_text = flat.trim().to_string();
    if flat_text.chars().count() <= MIN_SCRAPED_CHARS {
        return ArchiveContent::default();
    }
    ArchiveContent {
        abstract_text: None,
        sections,
        flat_text,
    }
}

fn article_root(document: &Html) -> Option<ElementRef<'_>> {
    ["div.jig-ncbiinpagenav", "article", "div.article", "div#article"]
        .iter()
        .filter_map(|s| Selector::parse(s).ok())
        .find_map(|selector| document.select(&selector).next())
}

/// True when only headings were collected
fn paragraph_text_is_empty(flat: &str) -> bool {
    flat.lines()
        .map(str::trim)
        .all(|line| line.is_empty() || line.starts_with("## "))
}
