//! DOM text extraction.
//!
//! Reduces a fetched HTML body to the plain text that should be chunked and
//! embedded: block elements in document order, page chrome (navigation,
//! headers, footers, scripts) removed, whitespace collapsed.

use quarry_core::Error;
use scraper::{ElementRef, Html, Selector};

/// Extracted document content ready for chunking.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    /// Document title from `<title>`, falling back to the first `h1`.
    pub title: Option<String>,
    /// Normalized text, one block element per paragraph.
    pub text: String,
}

/// Turns a fetched HTML body into plain text plus a title.
pub trait Extractor: Send + Sync {
    fn extract(&self, html: &str) -> Result<Extraction, Error>;
}

/// Block elements that carry the readable text of a page.
const BLOCK_TAGS: &[&str] = &[
    "h1", "h2", "h3", "h4", "h5", "h6", "p", "li", "pre", "blockquote", "td", "dt", "dd",
];

const BLOCK_SELECTOR: &str = "h1, h2, h3, h4, h5, h6, p, li, pre, blockquote, td, dt, dd";

/// Elements whose subtrees are page chrome, not content.
const CHROME_TAGS: &[&str] =
    &["nav", "header", "footer", "aside", "script", "style", "noscript", "template"];

/// DOM-walking extractor.
///
/// The content root is the first `<article>`, else `<main>`, else `<body>`.
/// Within it, block elements contribute one paragraph each; a block that
/// wraps further blocks (a list item holding a sublist, say) contributes
/// only its direct content so nothing is counted twice.
#[derive(Debug, Default)]
pub struct DomExtractor;

fn collapse(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn in_chrome(el: &ElementRef) -> bool {
    el.ancestors()
        .filter_map(ElementRef::wrap)
        .any(|ancestor| CHROME_TAGS.contains(&ancestor.value().name()))
}

/// Full text of an element's subtree.
fn subtree_text(el: &ElementRef) -> String {
    el.text().collect::<Vec<_>>().join(" ")
}

/// Text belonging to the element itself: direct text nodes plus inline
/// children, excluding anything that holds nested block elements.
fn own_text(el: &ElementRef, block_sel: &Selector) -> String {
    let mut raw = String::new();
    for child in el.children() {
        if let Some(text) = child.value().as_text() {
            raw.push_str(text);
            raw.push(' ');
        } else if let Some(child_el) = ElementRef::wrap(child) {
            let name = child_el.value().name();
            let is_block = BLOCK_TAGS.contains(&name);
            let holds_blocks = child_el.select(block_sel).next().is_some();
            if !is_block && !holds_blocks {
                raw.push_str(&subtree_text(&child_el));
                raw.push(' ');
            }
        }
    }
    raw
}

fn first_text(doc: &Html, selector: &str) -> Option<String> {
    let sel = Selector::parse(selector).expect("invalid selector");
    doc.select(&sel).map(|el| collapse(&subtree_text(&el))).find(|text| !text.is_empty())
}

impl Extractor for DomExtractor {
    fn extract(&self, html: &str) -> Result<Extraction, Error> {
        if html.trim().is_empty() {
            return Err(Error::InvalidInput("empty HTML".to_string()));
        }

        let doc = Html::parse_document(html);

        let title = first_text(&doc, "title").or_else(|| first_text(&doc, "h1"));

        let root = ["article", "main", "body"]
            .iter()
            .find_map(|name| {
                let sel = Selector::parse(name).expect("invalid selector");
                doc.select(&sel).next()
            })
            .ok_or_else(|| Error::ExtractFailed("no document root".to_string()))?;

        let block_sel = Selector::parse(BLOCK_SELECTOR).expect("invalid selector");

        let mut parts = Vec::new();
        for el in root.select(&block_sel) {
            if in_chrome(&el) {
                continue;
            }
            let raw = if el.select(&block_sel).next().is_some() {
                own_text(&el, &block_sel)
            } else {
                subtree_text(&el)
            };
            let text = collapse(&raw);
            if !text.is_empty() {
                parts.push(text);
            }
        }

        if parts.is_empty() {
            return Err(Error::ExtractFailed("no textual content".to_string()));
        }

        Ok(Extraction { title, text: parts.join("\n\n") })
    }
}
