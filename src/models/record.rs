use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Topic classification from the enrichment service
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Topic {
    pub name: Option<String>,
    pub subfield: Option<String>,
    pub field: Option<String>,
    pub domain: Option<String>,
}

/// Citation-graph fields; only meaningful when `enrichment_retrieved` is set
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EnrichmentFields {
    pub cited_by_count: Option<i64>,
    pub citation_normalized_percentile: Option<f64>,
    pub fwci: Option<f64>,
    pub oa_url: Option<String>,
    pub primary_topic: Option<Topic>,
}

impl EnrichmentFields {
    /// Field-wise non-null-wins combination, `self` taking precedence
    pub fn or(&self, other: &EnrichmentFields) -> EnrichmentFields {
        EnrichmentFields {
            cited_by_count: self.cited_by_count.or(other.cited_by_count),
            citation_normalized_percentile: self
                .citation_normalized_percentile
                .or(other.citation_normalized_percentile),
            fwci: self.fwci.or(other.fwci),
            oa_url: first_non_empty(&self.oa_url, &other.oa_url),
            primary_topic: self.primary_topic.clone().or_else(|| other.primary_topic.clone()),
        }
    }
}

/// One bibliographic item
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Record {
    /// Stable key within the originating search service (a PMID)
    pub primary_id: String,
    /// Persistent cross-service identifier (a DOI); not unique in the store
    pub secondary_id: Option<String>,
    /// Identifier in the full-text archive (a PMCID)
    pub archive_id: Option<String>,
    pub title: Option<String>,
    #[serde(rename = "abstract")]
    pub abstract_text: Option<String>,
    pub full_text: Option<String>,
    #[serde(default)]
    pub full_text_sections: IndexMap<String, String>,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub mesh_terms: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    pub journal: Option<String>,
    pub year: Option<i32>,
    pub date_published: Option<String>,
    pub source: Option<String>,
    pub enrichment: Option<EnrichmentFields>,
    #[serde(default)]
    pub enrichment_retrieved: bool,
    pub collection_run_id: Option<i64>,
    #[serde(default = "Utc::now")]
    pub collected_at: DateTime<Utc>,
}

impl Record {
    pub fn new(primary_id: impl Into<String>) -> Self {
        Self {
            primary_id: primary_id.into(),
            secondary_id: None,
            archive_id: None,
            title: None,
            abstract_text: None,
            full_text: None,
            full_text_sections: IndexMap::new(),
            authors: Vec::new(),
            mesh_terms: Vec::new(),
            keywords: Vec::new(),
            journal: None,
            year: None,
            date_published: None,
            source: None,
            enrichment: None,
            enrichment_retrieved: false,
            collection_run_id: None,
            collected_at: Utc::now(),
        }
    }

    /// True iff flat text or any section is present
    ///
    /// Only content that passed the meaningfulness check is ever stored, so
    /// this also means "has meaningful full text".
    pub fn has_full_text(&self) -> bool {
        self.full_text.as_deref().is_some_and(|t| !t.trim().is_empty())
            || !self.full_text_sections.is_empty()
    }

    pub fn has_abstract(&self) -> bool {
        self.abstract_text.as_deref().is_some_and(|t| !t.trim().is_empty())
    }

    /// Present records missing either an abstract or full text
    pub fn needs_enrichment(&self) -> bool {
        !self.has_abstract() || !self.has_full_text()
    }

    pub fn has_enrichment(&self) -> bool {
        self.enrichment_retrieved && self.enrichment.is_some()
    }

    /// Combined length of flat text and sections
    pub fn content_len(&self) -> usize {
        self.full_text.as_ref().map_or(0, |t| t.len())
            + self.full_text_sections.values().map(|s| s.len()).sum::<usize>()
    }

    /// Record a confirmed enrichment match
    pub fn apply_enrichment(&mut self, fields: EnrichmentFields) {
        self.enrichment = Some(fields);
        self.enrichment_retrieved = true;
    }

    /// Count of populated optional fields, used to rank duplicates
    pub fn completeness(&self) -> usize {
        let options = [
            self.secondary_id.is_some(),
            self.archive_id.is_some(),
            self.title.is_some(),
            self.has_abstract(),
            self.has_full_text(),
            self.journal.is_some(),
            self.year.is_some(),
            self.date_published.is_some(),
            self.has_enrichment(),
        ];
        options.iter().filter(|set| **set).count()
            + usize::from(!self.authors.is_empty())
            + usize::from(!self.mesh_terms.is_empty())
            + usize::from(!self.keywords.is_empty())
    }
}

/// Merge two records describing the same work
///
/// The result keeps `primary`'s identifier, which never changes. Identifier
/// and scalar fields are non-null-wins with `primary` first. Text fields take
/// the longest non-empty value. List fields are the ordered union. Sections
/// come from whichever record carries more section content.
pub fn merge(primary: &Record, other: &Record) -> Record {
    let full_text_sections = if section_len(&other.full_text_sections) > section_len(&primary.full_text_sections) {
        other.full_text_sections.clone()
    } else {
        primary.full_text_sections.clone()
    };

    let enrichment = match (&primary.enrichment, &other.enrichment) {
        (Some(a), Some(b)) => Some(a.or(b)),
        (a, b) => a.clone().or_else(|| b.clone()),
    };

    Record {
        primary_id: primary.primary_id.clone(),
        secondary_id: first_non_empty(&primary.secondary_id, &other.secondary_id),
        archive_id: first_non_empty(&primary.archive_id, &other.archive_id),
        title: longest(&primary.title, &other.title),
        abstract_text: longest(&primary.abstract_text, &other.abstract_text),
        full_text: longest(&primary.full_text, &other.full_text),
        full_text_sections,
        authors: union(&primary.authors, &other.authors),
        mesh_terms: union(&primary.mesh_terms, &other.mesh_terms),
        keywords: union(&primary.keywords, &other.keywords),
        journal: first_non_empty(&primary.journal, &other.journal),
        year: primary.year.or(other.year),
        date_published: first_non_empty(&primary.date_published, &other.date_published),
        source: first_non_empty(&primary.source, &other.source),
        enrichment,
        enrichment_retrieved: primary.enrichment_retrieved || other.enrichment_retrieved,
        collection_run_id: primary.collection_run_id.or(other.collection_run_id),
        collected_at: primary.collected_at.max(other.collected_at),
    }
}

fn section_len(sections: &IndexMap<String, String>) -> usize {
    sections.values().map(|s| s.len()).sum()
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}

fn first_non_empty(a: &Option<String>, b: &Option<String>) -> Option<String> {
    if !is_blank(a) {
        a.clone()
    } else if !is_blank(b) {
        b.clone()
    } else {
        None
    }
}

/// Longest non-empty value; ties keep `a`
fn longest(a: &Option<String>, b: &Option<String>) -> Option<String> {
    match (is_blank(a), is_blank(b)) {
        (true, true) => None,
        (false, true) => a.clone(),
        (true, false) => b.clone(),
        (false, false) => {
            let (la, lb) = (a.as_ref().map_or(0, |s| s.len()), b.as_ref().map_or(0, |s| s.len()));
            if lb > la {
                b.clone()
            } else {
                a.clone()
            }
        }
    }
}

fn union(a: &[String], b: &[String]) -> Vec<String> {
    let mut out = a.to_vec();
    for item in b {
        if !out.contains(item) {
            out.push(item.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(id: &str) -> Record {
        Record::new(id)
    }

    #[test]
    fn test_has_full_text() {
        let mut r = record("1");
        assert!(!r.has_full_text());
        r.full_text = Some("   ".into());
        assert!(!r.has_full_text());
        r.full_text_sections.insert("Introduction".into(), "text".into());
        assert!(r.has_full_text());
    }

    #[test]
    fn test_needs_enrichment() {
        let mut r = record("1");
        r.abstract_text = Some("An abstract".into());
        assert!(r.needs_enrichment());
        r.full_text = Some("Body".into());
        assert!(!r.needs_enrichment());
        r.abstract_text = None;
        assert!(r.needs_enrichment());
    }

    #[test]
    fn test_merge_keeps_primary_identifier() {
        let mut primary = record("100");
        primary.secondary_id = Some("10.1/x".into());
        primary.title = Some("Short".into());
        primary.authors = vec!["A".into(), "B".into()];
        primary.collected_at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        let mut other = record("200");
        other.secondary_id = Some("10.1/x".into());
        other.title = Some("A longer title".into());
        other.abstract_text = Some("Only here".into());
        other.authors = vec!["B".into(), "C".into()];
        other.journal = Some("J".into());
        other.collected_at = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();

        let merged = merge(&primary, &other);
        assert_eq!(merged.primary_id, "100");
        assert_eq!(merged.title.as_deref(), Some("A longer title"));
        assert_eq!(merged.abstract_text.as_deref(), Some("Only here"));
        assert_eq!(merged.authors, vec!["A", "B", "C"]);
        assert_eq!(merged.journal.as_deref(), Some("J"));
        assert_eq!(merged.collected_at, other.collected_at);
    }

    #[test]
    fn test_merge_non_null_wins() {
        let mut primary = record("1");
        primary.year = Some(2020);
        primary.archive_id = Some("".into());
        let mut other = record("2");
        other.year = Some(1999);
        other.archive_id = Some("PMC9".into());

        let merged = merge(&primary, &other);
        assert_eq!(merged.year, Some(2020));
        assert_eq!(merged.archive_id.as_deref(), Some("PMC9"));
    }

    #[test]
    fn test_merge_enrichment_fieldwise() {
        let mut primary = record("1");
        primary.apply_enrichment(EnrichmentFields {
            cited_by_count: Some(5),
            ..Default::default()
        });
        let mut other = record("2");
        other.apply_enrichment(EnrichmentFields {
            cited_by_count: Some(9),
            fwci: Some(1.5),
            ..Default::default()
        });

        let merged = merge(&primary, &other);
        let fields = merged.enrichment.unwrap();
        assert_eq!(fields.cited_by_count, Some(5));
        assert_eq!(fields.fwci, Some(1.5));
        assert!(merged.enrichment_retrieved);
    }

    #[test]
    fn test_merge_prefers_richer_sections() {
        let mut primary = record("1");
        primary.full_text_sections.insert("Main".into(), "short".into());
        let mut other = record("2");
        other.full_text_sections.insert("Introduction".into(), "much longer content".into());
        other.full_text_sections.insert("Methods".into(), "more".into());

        let merged = merge(&primary, &other);
        assert_eq!(merged.full_text_sections.len(), 2);
        assert!(merged.full_text_sections.contains_key("Introduction"));
    }
}
