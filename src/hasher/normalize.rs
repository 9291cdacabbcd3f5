//! Canonical serialization of HTML documents
//!
//! The canonical form drops everything that changes between fetches without
//! the page content changing: comments, insignificant whitespace, attribute
//! order, per-request tokens and embedded timestamps.

use regex::Regex;
use scraper::{ElementRef, Html, Node};
use std::collections::HashSet;

/// Elements whose text is ignored when script content is excluded
const SCRIPT_ELEMENTS: &[&str] = &["script", "style", "noscript"];

pub(crate) struct NormalizationRules {
    pub ignore_script_content: bool,
    /// Lowercase attribute names that are always dropped
    pub volatile_attributes: HashSet<String>,
    pub volatile_patterns: Vec<Regex>,
}

impl NormalizationRules {
    fn drops_attribute(&self, element: &str, name: &str, value: &str, csrf_meta: bool) -> bool {
        let name = name.to_ascii_lowercase();
        if name.contains("csrf") || self.volatile_attributes.contains(&name) {
            return true;
        }
        if csrf_meta && element == "meta" && name == "content" {
            return true;
        }
        self.volatile_patterns.iter().any(|p| p.is_match(value))
    }
}

/// Canonical serialization and tag skeleton of one document
pub(crate) struct Canonical {
    pub content: String,
    pub skeleton: String,
}

/// Walks the document once, producing both canonical forms
pub(crate) fn canonicalize(document: &Html, rules: &NormalizationRules) -> Canonical {
    let mut out = Canonical {
        content: String::new(),
        skeleton: String::new(),
    };
    write_element(document.root_element(), rules, false, &mut out);
    out
}

fn write_element(
    element: ElementRef<'_>,
    rules: &NormalizationRules,
    in_script: bool,
    out: &mut Canonical,
) {
    let name = element.value().name();

    // <meta name="csrf-token" content="..."> carries the token in `content`
    let csrf_meta = name == "meta"
        && element
            .value()
            .attr("name")
            .map(|n| n.to_ascii_lowercase().contains("csrf"))
            .unwrap_or(false);

    let mut attrs: Vec<(&str, &str)> = element
        .value()
        .attrs()
        .filter(|(attr, value)| !rules.drops_attribute(name, attr, value, csrf_meta))
        .collect();
    attrs.sort();

    out.content.push('<');
    out.content.push_str(name);
    for (attr, value) in attrs {
        out.content.push(' ');
        out.content.push_str(attr);
        out.content.push_str("=\"");
        out.content.push_str(&collapse_whitespace(value));
        out.content.push('"');
    }
    out.content.push('>');

    out.skeleton.push('<');
    out.skeleton.push_str(name);
    out.skeleton.push('>');

    let skip_text = in_script
        || (rules.ignore_script_content && SCRIPT_ELEMENTS.contains(&name));

    for child in element.children() {
        match child.value() {
            Node::Element(_) => {
                if let Some(child_element) = ElementRef::wrap(child) {
                    write_element(child_element, rules, skip_text, out);
                }
            }
            Node::Text(text) if !skip_text => {
                let collapsed = collapse_whitespace(text);
                if !collapsed.is_empty() {
                    out.content.push_str(&collapsed);
                    // Separates adjacent text from the next tag
                    out.content.push('\n');
                }
            }
            // Comments, doctype and processing instructions
            _ => {}
        }
    }

    out.content.push_str("</");
    out.content.push_str(name);
    out.content.push('>');

    out.skeleton.push_str("</");
    out.skeleton.push_str(name);
    out.skeleton.push('>');
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
