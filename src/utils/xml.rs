//! Minimal lenient XML reader for E-utilities and JATS documents
//!
//! Builds a small element tree with regex tokenization, the same way the
//! adapters already pick apart feed responses. It tolerates the mismatched
//! and unknown tags publisher XML is full of, and never fails: garbage in
//! produces a shallow tree.

use once_cell::sync::Lazy;
use regex::Regex;

static TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?s)<!--.*?-->|<!\[CDATA\[(?P<cdata>.*?)\]\]>|<\?.*?\?>|<![A-Za-z][^>]*>|</\s*(?P<close>[^\s>]+)\s*>|<(?P<open>[A-Za-z_][\w:.\-]*)(?P<attrs>(?:\s+[^\s=/>]+\s*=\s*(?:"[^"]*"|'[^']*'))*)\s*(?P<selfclose>/?)>|(?P<text>[^<]+)"#,
    )
    .unwrap()
});

static ATTR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([^\s=/>]+)\s*=\s*(?:"([^"]*)"|'([^']*)')"#).unwrap());

static ENTITY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"&(#[xX][0-9a-fA-F]+|#[0-9]+|[a-zA-Z]+);").unwrap());

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Element(Element),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Element {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Node>,
}

impl Element {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Direct child elements
    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(el) => Some(el),
            Node::Text(_) => None,
        })
    }

    /// Direct child elements with the given tag name
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.elements().filter(move |el| el.name == name)
    }

    pub fn child(&self, name: &str) -> Option<&Element> {
        self.elements().find(|el| el.name == name)
    }

    /// First descendant with the given name, depth-first
    pub fn find(&self, name: &str) -> Option<&Element> {
        for el in self.elements() {
            if el.name == name {
                return Some(el);
            }
            if let Some(found) = el.find(name) {
                return Some(found);
            }
        }
        None
    }

    /// All descendants with the given name, in document order
    ///
    /// Matches nested inside a match are included.
    pub fn find_all<'a>(&'a self, name: &str) -> Vec<&'a Element> {
        let mut found = Vec::new();
        self.collect(name, &mut found);
        found
    }

    fn collect<'a>(&'a self, name: &str, out: &mut Vec<&'a Element>) {
        for el in self.elements() {
            if el.name == name {
                out.push(el);
            }
            el.collect(name, out);
        }
    }

    /// Follow a `/`-separated path of child names
    pub fn path(&self, path: &str) -> Option<&Element> {
        path.split('/')
            .filter(|p| !p.is_empty())
            .try_fold(self, |el, part| el.child(part))
    }

    /// Concatenated text of this element and all descendants
    pub fn text(&self) -> String {
        let mut out = String::new();
        self.push_text(&mut out);
        out
    }

    fn push_text(&self, out: &mut String) {
        for node in &self.children {
            match node {
                Node::Text(t) => out.push_str(t),
                Node::Element(el) => el.push_text(out),
            }
        }
    }

    /// Text with whitespace collapsed, `None` when empty
    pub fn trimmed_text(&self) -> Option<String> {
        let text = crate::utils::text::normalize_whitespace(&self.text());
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }
}

/// Parse a document into a synthetic `#document` root element
pub fn parse(input: &str) -> Element {
    let mut stack: Vec<Element> = vec![Element::new("#document")];

    for caps in TOKEN.captures_iter(input) {
        if let Some(name) = caps.name("open") {
            let mut el = Element::new(name.as_str());
            if let Some(attrs) = caps.name("attrs") {
                el.attrs = parse_attrs(attrs.as_str());
            }
            let self_closing = caps.name("selfclose").is_some_and(|m| !m.as_str().is_empty());
            if self_closing {
                push_child(&mut stack, Node::Element(el));
            } else {
                stack.push(el);
            }
        } else if let Some(name) = caps.name("close") {
            close(&mut stack, name.as_str());
        } else if let Some(text) = caps.name("text") {
            push_child(&mut stack, Node::Text(decode_entities(text.as_str())));
        } else if let Some(cdata) = caps.name("cdata") {
            push_child(&mut stack, Node::Text(cdata.as_str().to_string()));
        }
        // comments, processing instructions and doctypes are dropped
    }

    while stack.len() > 1 {
        if let Some(el) = stack.pop() {
            push_child(&mut stack, Node::Element(el));
        }
    }
    stack.pop().unwrap_or_else(|| Element::new("#document"))
}

fn push_child(stack: &mut [Element], node: Node) {
    if let Some(top) = stack.last_mut() {
        top.children.push(node);
    }
}

/// Close the nearest open element called `name`; stray closers are ignored
fn close(stack: &mut Vec<Element>, name: &str) {
    let Some(pos) = stack.iter().rposition(|el| el.name == name) else {
        return;
    };
    if pos == 0 {
        return;
    }
    while stack.len() > pos {
        if let Some(el) = stack.pop() {
            push_child(stack, Node::Element(el));
        }
    }
}

fn parse_attrs(raw: &str) -> Vec<(String, String)> {
    ATTR.captures_iter(raw)
        .map(|c| {
            let value = c.get(2).or_else(|| c.get(3)).map_or("", |m| m.as_str());
            (c[1].to_string(), decode_entities(value))
        })
        .collect()
}

pub fn decode_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    ENTITY
        .replace_all(text, |caps: &regex::Captures| {
            let entity = &caps[1];
            let decoded = if let Some(hex) = entity.strip_prefix("#x").or_else(|| entity.strip_prefix("#X")) {
                u32::from_str_radix(hex, 16).ok().and_then(char::from_u32)
            } else if let Some(dec) = entity.strip_prefix('#') {
                dec.parse::<u32>().ok().and_then(char::from_u32)
            } else {
                match entity {
                    "lt" => Some('<'),
                    "gt" => Some('>'),
                    "amp" => Some('&'),
                    "quot" => Some('"'),
                    "apos" => Some('\''),
                    "nbsp" => Some('\u{a0}'),
                    _ => None,
                }
            };
            decoded.map_or_else(|| caps[0].to_string(), |c| c.to_string())
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nested_elements() {
        let doc = parse(
            r#"<?xml version="1.0"?><!DOCTYPE x><root a="1"><item id='x'>Hello <b>world</b></item><item/></root>"#,
        );
        let root = doc.child("root").unwrap();
        assert_eq!(root.attr("a"), Some("1"));
        let items: Vec<_> = root.children_named("item").collect();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].attr("id"), Some("x"));
        assert_eq!(items[0].text(), "Hello world");
        assert!(items[1].children.is_empty());
    }

    #[test]
    fn test_entities_and_cdata() {
        let doc = parse("<t>a &lt; b &amp; &#x3B1;&#946; <![CDATA[<raw>]]></t>");
        assert_eq!(doc.find("t").unwrap().text(), "a < b & αβ <raw>");
    }

    #[test]
    fn test_lenient_mismatched_tags() {
        let doc = parse("<a><b>one</a><c>two</c></x>");
        let a = doc.child("a").unwrap();
        assert_eq!(a.child("b").unwrap().text(), "one");
        assert_eq!(doc.child("c").unwrap().text(), "two");
    }

    #[test]
    fn test_find_all_and_path() {
        let doc = parse("<r><s><title>A</title><s><title>B</title></s></s></r>");
        let titles: Vec<String> = doc.find_all("title").iter().map(|t| t.text()).collect();
        assert_eq!(titles, vec!["A", "B"]);
        assert_eq!(doc.path("r/s/s/title").unwrap().text(), "B");
        assert!(doc.path("r/missing").is_none());
    }

    #[test]
    fn test_trimmed_text() {
        let doc = parse("<p>\n   spaced \n out </p><e>  </e>");
        assert_eq!(doc.find("p").unwrap().trimmed_text().as_deref(), Some("spaced out"));
        assert_eq!(doc.find("e").unwrap().trimmed_text(), None);
    }
}
