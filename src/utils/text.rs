//! Text normalization and cleanup for abstracts and full text

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

static LATEX_DOCUMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)\\documentclass(?:\[[^\]]*\])?\{[^}]*\}.*?\\begin\{document\}(.*?)\\end\{document\}")
        .unwrap()
});
static LATEX_PREAMBLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\\documentclass(?:\[[^\]]*\])?\{[^}]*\}|\\usepackage(?:\[[^\]]*\])?\{[^}]*\}|\\setlength\{[^}]*\}\{[^}]*\}|\\(?:begin|end)\{document\}",
    )
    .unwrap()
});
static LATEX_WITH_ARG: Lazy<Regex> = Lazy::new(|| Regex::new(r"\\[a-zA-Z]+\{([^}]*)\}").unwrap());
static LATEX_BARE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\\[a-zA-Z]+").unwrap());
static DOLLARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$+").unwrap());
static TABS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\t+").unwrap());
static RUN_OF_SPACES: Lazy<Regex> = Lazy::new(|| Regex::new(r" {3,}").unwrap());
static SYMBOL_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[\W_]+$").unwrap());
static REFERENCES_HEADING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?im)^\s*(?:#{1,3}\s*)?references\s*$").unwrap());

const GREEK: &[(&str, &str)] = &[
    ("alpha", "α"),
    ("beta", "β"),
    ("gamma", "γ"),
    ("delta", "δ"),
    ("mu", "μ"),
    ("sigma", "σ"),
    ("lambda", "λ"),
    ("theta", "θ"),
    ("pi", "π"),
    ("omega", "ω"),
];

const REFERENCE_SECTION_NAMES: &[&str] = &["references", "bibliography", "literature cited"];

/// Collapse every whitespace run to one space and trim
pub fn normalize_whitespace(text: &str) -> String {
    WHITESPACE.replace_all(text.trim(), " ").into_owned()
}

pub fn clean_abstract(text: &str) -> String {
    normalize_whitespace(text)
}

/// Strip LaTeX residue and layout noise from extracted article text
pub fn clean_full_text(text: &str) -> String {
    if text.trim().is_empty() {
        return String::new();
    }

    let mut out = LATEX_DOCUMENT.replace_all(text, "$1").into_owned();
    out = LATEX_PREAMBLE.replace_all(&out, "").into_owned();

    for (name, symbol) in GREEK {
        let re = Regex::new(&format!(r"\$*\\{}\b\$*", name));
        if let Ok(re) = re {
            out = re.replace_all(&out, *symbol).into_owned();
        }
    }

    out = LATEX_WITH_ARG.replace_all(&out, "$1").into_owned();
    out = LATEX_BARE.replace_all(&out, "").into_owned();
    out = DOLLARS.replace_all(&out, "").into_owned();
    out = TABS.replace_all(&out, " ").into_owned();
    out = RUN_OF_SPACES.replace_all(&out, " ").into_owned();

    let mut lines: Vec<&str> = Vec::new();
    let mut blank_run = false;
    for line in out.lines().map(str::trim) {
        if line.is_empty() {
            if !blank_run && !lines.is_empty() {
                lines.push("");
            }
            blank_run = true;
            continue;
        }
        if line.chars().count() <= 1 || SYMBOL_LINE.is_match(line) {
            continue;
        }
        blank_run = false;
        lines.push(line);
    }

    lines.join("\n").trim().to_string()
}

/// Drop everything from a "References" heading onwards
pub fn remove_references_section(text: &str) -> String {
    match REFERENCES_HEADING.find(text) {
        // a heading on the very first line means the whole text is references
        Some(m) => text[..m.start()].trim_end().to_string(),
        None => text.to_string(),
    }
}

pub fn clean_text(text: &str, remove_references: bool) -> String {
    let cleaned = clean_full_text(text);
    if remove_references {
        remove_references_section(&cleaned)
    } else {
        cleaned
    }
}

/// Clean every section, dropping those left empty
///
/// References are only stripped inside sections that are themselves a
/// reference list, so a "References" heading quoted in a discussion
/// section does not truncate it.
pub fn clean_sections(sections: &IndexMap<String, String>) -> IndexMap<String, String> {
    sections
        .iter()
        .filter(|(_, content)| !content.trim().is_empty())
        .filter_map(|(name, content)| {
            let is_reference_list = REFERENCE_SECTION_NAMES.contains(&name.to_lowercase().as_str());
            let cleaned = clean_text(content, is_reference_list);
            if cleaned.is_empty() {
                None
            } else {
                Some((name.clone(), cleaned))
            }
        })
        .collect()
}

/// Truncate to at most `max_chars` characters
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
