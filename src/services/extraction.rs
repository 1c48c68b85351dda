//! Full-text resolution with a content-quality gate
//!
//! Strategies are tried in order and the first one that yields meaningful
//! content wins:
//! 1. structured archive XML by archive id (looked up from the DOI if needed)
//! 2. the archive's rendered HTML page, when the XML was thin
//!
//! Finding nothing is a normal outcome, so upstream errors are logged and
//! reported as "no full text" instead of being propagated.

use indexmap::IndexMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::adapters::{ArchiveContent, ArchiveService};
use crate::config::CleaningConfig;
use crate::models::Record;
use crate::utils::text::{clean_sections, clean_text};

/// Sections with at least this many characters count as substantial
const SUBSTANTIAL_CHARS: usize = 500;
/// Unsectioned text must exceed this to be accepted
const MIN_FLAT_CHARS: usize = 2_000;

const BOILERPLATE_SECTIONS: &[&str] = &[
    "conflict of interest",
    "conflicts of interest",
    "competing interest",
    "acknowledgment",
    "acknowledgement",
    "funding",
    "financial disclosure",
    "author contributions",
    "data availability",
    "supplementary material",
    "supporting information",
    "abbreviations",
    "keywords",
    "copyright",
    "license",
    "author information",
    "correspondence",
    "ethics",
    "consent",
];

const SUBSTANTIVE_SECTIONS: &[&str] = &[
    "introduction",
    "background",
    "methods",
    "methodology",
    "materials",
    "results",
    "discussion",
    "conclusion",
    "analysis",
    "findings",
    "literature review",
    "theory",
    "hypothesis",
    "experiment",
    "case study",
    "data",
    "implementation",
    "evaluation",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    Boilerplate,
    Substantive,
    Unclassified,
}

pub fn classify_section(name: &str) -> SectionKind {
    let lower = name.to_lowercase();
    if BOILERPLATE_SECTIONS.iter().any(|b| lower.contains(b)) {
        SectionKind::Boilerplate
    } else if SUBSTANTIVE_SECTIONS.iter().any(|s| lower.contains(s)) {
        SectionKind::Substantive
    } else {
        SectionKind::Unclassified
    }
}

/// Result of the content-quality check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accepted,
    Rejected { reason: String },
}

impl Verdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accepted)
    }

    fn rejected(reason: impl Into<String>) -> Self {
        Verdict::Rejected { reason: reason.into() }
    }
}

/// Decide whether extracted content is a real article body
///
/// Abstract sections are ignored. Accepts when a substantive section
/// (introduction, methods, ...) is longer than 500 characters, or when at
/// least three sections are that long and boilerplate is a minority of
/// them. Without any sections, the flat text must exceed 2000 characters.
pub fn assess_content(sections: &IndexMap<String, String>, flat_text: &str) -> Verdict {
    let mut considered = 0;
    let mut substantial = 0;
    let mut substantial_boilerplate = 0;

    for (name, content) in sections {
        if name.to_lowercase().contains("abstract") {
            continue;
        }
        considered += 1;

        let kind = classify_section(name);
        if content.trim().chars().count() <= SUBSTANTIAL_CHARS {
            continue;
        }
        if kind == SectionKind::Substantive {
            return Verdict::Accepted;
        }
        substantial += 1;
        if kind == SectionKind::Boilerplate {
            substantial_boilerplate += 1;
        }
    }

    if considered == 0 {
        let length = flat_text.trim().chars().count();
        return if length > MIN_FLAT_CHARS {
            Verdict::Accepted
        } else {
            Verdict::rejected(format!("no sections and only {} characters of text", length))
        };
    }

    if substantial >= 3 && substantial_boilerplate * 2 < substantial {
        return Verdict::Accepted;
    }
    Verdict::rejected(format!(
        "{} substantial of {} sections ({} boilerplate)",
        substantial, considered, substantial_boilerplate
    ))
}

/// Where accepted full text came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionSource {
    StructuredXml,
    RenderedPage,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedText {
    pub archive_id: String,
    pub full_text: String,
    pub sections: IndexMap<String, String>,
    pub source: ExtractionSource,
}

/// Ordered full-text fallback over one archive service
pub struct ExtractionChain {
    archive: Arc<dyn ArchiveService>,
    cleaning: CleaningConfig,
}

impl ExtractionChain {
    pub fn new(archive: Arc<dyn ArchiveService>, cleaning: CleaningConfig) -> Self {
        Self { archive, cleaning }
    }

    /// Meaningful full text for `record`, or `None`
    pub async fn extract(&self, record: &Record) -> Option<ExtractedText> {
        let archive_id = self.resolve_archive_id(record).await?;

        let structured = match self.archive.fetch_structured(&archive_id).await {
            Ok(content) => content?,
            Err(e) => {
                warn!("Structured full text failed for {}: {}", archive_id, e);
                return None;
            }
        };

        let abstract_text = structured
            .abstract_text
            .clone()
            .or_else(|| record.abstract_text.clone());

        match assess_content(&structured.sections, &structured.flat_text) {
            Verdict::Accepted => {
                return Some(self.finish(archive_id, structured, abstract_text, ExtractionSource::StructuredXml));
            }
            Verdict::Rejected { reason } => {
                debug!("Structured content for {} rejected: {}", archive_id, reason);
            }
        }

        let scraped = self.scrape(&archive_id).await?;
        Some(self.finish(archive_id, scraped, abstract_text, ExtractionSource::RenderedPage))
    }

    async fn resolve_archive_id(&self, record: &Record) -> Option<String> {
        if let Some(id) = record.archive_id.as_deref().filter(|id| !id.trim().is_empty()) {
            return Some(id.to_string());
        }
        let doi = record.secondary_id.as_deref().filter(|d| !d.trim().is_empty())?;
        match self.archive.lookup_by_persistent_id(doi).await {
            Ok(found) => found,
            Err(e) => {
                warn!("Archive id lookup failed for DOI {}: {}", doi, e);
                None
            }
        }
    }

    async fn scrape(&self, archive_id: &str) -> Option<ArchiveContent> {
        let html = match self.archive.rendered_page(archive_id).await {
            Ok(html) => html?,
            Err(e) => {
                warn!("Rendered page failed for {}: {}", archive_id, e);
                return None;
            }
        };

        let content = self.archive.parse_rendered_page(&html);
        match assess_content(&content.sections, &content.flat_text) {
            Verdict::Accepted => Some(content),
            Verdict::Rejected { reason } => {
                debug!("Rendered page for {} rejected: {}", archive_id, reason);
                None
            }
        }
    }

    /// Prepend the abstract and clean
    fn finish(
        &self,
        archive_id: String,
        content: ArchiveContent,
        abstract_text: Option<String>,
        source: ExtractionSource,
    ) -> ExtractedText {
        let mut sections = content.sections;
        let mut full_text = content.flat_text;
        if let Some(abstract_text) = abstract_text.filter(|a| !a.trim().is_empty()) {
            full_text = format!("ABSTRACT:\n{}\n\n{}", abstract_text, full_text);
            sections.insert("Abstract".to_string(), abstract_text);
        }

        if self.cleaning.clean_full_text {
            full_text = clean_text(&full_text, self.cleaning.remove_references);
            sections = clean_sections(&sections);
        }

        debug!(
            "Extracted {} chars in {} sections for {} ({:?})",
            full_text.len(),
            sections.len(),
            archive_id,
            source
        );
        ExtractedText {
            archive_id,
            full_text,
            sections,
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn text(n: usize) -> String {
        "x".repeat(n)
    }

    fn sections(entries: &[(&str, usize)]) -> IndexMap<String, String> {
        entries.iter().map(|(name, len)| (name.to_string(), text(*len))).collect()
    }

    #[test]
    fn test_only_acknowledgments_is_rejected() {
        let map = sections(&[("Acknowledgments", 50), ("Abstract", 800)]);
        assert!(!assess_content(&map, &text(850)).is_accepted());
    }

    #[test]
    fn test_substantive_section_is_accepted() {
        let map = sections(&[("Introduction", 600), ("Abstract", 300)]);
        assert!(assess_content(&map, &text(900)).is_accepted());
    }

    #[test]
    fn test_three_unclassified_sections_are_accepted() {
        let map = sections(&[("Part one", 600), ("Part two", 600), ("Part three", 600)]);
        assert!(assess_content(&map, &text(1800)).is_accepted());
    }

    #[test]
    fn test_flat_text_thresholds() {
        let empty = IndexMap::new();
        assert!(assess_content(&empty, &text(2_500)).is_accepted());
        assert!(!assess_content(&empty, &text(1_000)).is_accepted());
    }

    #[test]
    fn test_boilerplate_majority_is_rejected() {
        let map = sections(&[
            ("Funding", 600),
            ("Conflicts of Interest", 600),
            ("Part one", 600),
        ]);
        assert!(!assess_content(&map, "").is_accepted());
    }

    #[test]
    fn test_short_substantive_section_is_rejected() {
        let map = sections(&[("Methods", 400)]);
        assert!(!assess_content(&map, &text(5_000)).is_accepted());
    }

    #[test]
    fn test_classify_section() {
        assert_eq!(classify_section("2. Materials and Methods"), SectionKind::Substantive);
        assert_eq!(classify_section("Acknowledgements"), SectionKind::Boilerplate);
        // boilerplate wins over an embedded substantive keyword
        assert_eq!(classify_section("Data availability"), SectionKind::Boilerplate);
        assert_eq!(classify_section("Figure legends"), SectionKind::Unclassified);
    }

    /// Archive with canned responses per archive id
    #[derive(Default)]
    struct FakeArchive {
        structured: HashMap<String, ArchiveContent>,
        pages: HashMap<String, String>,
        dois: HashMap<String, String>,
        page_requests: AtomicUsize,
        fail_structured: bool,
    }

    #[async_trait]
    impl ArchiveService for FakeArchive {
        async fn fetch_structured(&self, archive_id: &str) -> Result<Option<ArchiveContent>, GatewayError> {
            if self.fail_structured {
                return Err(GatewayError::Transient("boom".into()));
            }
            Ok(self.structured.get(archive_id).cloned())
        }

        async fn rendered_page(&self, archive_id: &str) -> Result<Option<String>, GatewayError> {
            self.page_requests.fetch_add(1, Ordering::SeqCst);
            Ok(self.pages.get(archive_id).cloned())
        }

        async fn lookup_by_persistent_id(&self, doi: &str) -> Result<Option<String>, GatewayError> {
            Ok(self.dois.get(doi).cloned())
        }
    }

    fn good_content() -> ArchiveContent {
        let sections = sections(&[("Introduction", 700), ("Results", 700)]);
        ArchiveContent {
            abstract_text: Some("An abstract.".into()),
            flat_text: sections.values().cloned().collect::<Vec<_>>().join("\n\n"),
            sections,
        }
    }

    fn thin_content() -> ArchiveContent {
        ArchiveContent {
            abstract_text: Some("An abstract.".into()),
            sections: sections(&[("Funding", 80)]),
            flat_text: text(80),
        }
    }

    fn article_page() -> String {
        let para = "Participants slept in the laboratory for two nights while we recorded them. ".repeat(5);
        format!(
            "<html><body><article><section><h2>Introduction</h2><p>{p}</p><p>{p}</p></section>\
             <section><h2>Results</h2><p>{p}</p></section></article></body></html>",
            p = para
        )
    }

    fn chain(archive: FakeArchive) -> (ExtractionChain, Arc<FakeArchive>) {
        let archive = Arc::new(archive);
        (ExtractionChain::new(archive.clone(), CleaningConfig::default()), archive)
    }

    #[tokio::test]
    async fn test_structured_text_by_archive_id() {
        let mut archive = FakeArchive::default();
        archive.structured.insert("PMC1".into(), good_content());
        let (chain, archive) = chain(archive);

        let mut record = Record::new("1");
        record.archive_id = Some("PMC1".into());
        let extracted = chain.extract(&record).await.unwrap();

        assert_eq!(extracted.source, ExtractionSource::StructuredXml);
        assert!(extracted.full_text.starts_with("ABSTRACT:\nAn abstract."));
        assert_eq!(extracted.sections.get("Abstract").map(String::as_str), Some("An abstract."));
        assert_eq!(archive.page_requests.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_doi_lookup_then_html_fallback() {
        let mut archive = FakeArchive::default();
        archive.dois.insert("10.1/x".into(), "PMC2".into());
        archive.structured.insert("PMC2".into(), thin_content());
        archive.pages.insert("PMC2".into(), article_page());
        let (chain, _) = chain(archive);

        let mut record = Record::new("2");
        record.secondary_id = Some("10.1/x".into());
        let extracted = chain.extract(&record).await.unwrap();

        assert_eq!(extracted.archive_id, "PMC2");
        assert_eq!(extracted.source, ExtractionSource::RenderedPage);
        assert!(extracted.sections.contains_key("Introduction"));
        assert!(extracted.sections.contains_key("Abstract"));
    }

    #[tokio::test]
    async fn test_thin_content_without_page_yields_nothing() {
        let mut archive = FakeArchive::default();
        archive.structured.insert("PMC3".into(), thin_content());
        let (chain, archive) = chain(archive);

        let mut record = Record::new("3");
        record.archive_id = Some("PMC3".into());
        assert!(chain.extract(&record).await.is_none());
        assert_eq!(archive.page_requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_errors_and_missing_ids_are_not_fatal() {
        let (chain, _) = chain(FakeArchive {
            fail_structured: true,
            ..Default::default()
        });
        let mut record = Record::new("4");
        assert!(chain.extract(&record).await.is_none());

        record.archive_id = Some("PMC4".into());
        assert!(chain.extract(&record).await.is_none());
    }
}
