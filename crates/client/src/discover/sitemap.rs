//! Sitemap XML parsing.
//!
//! Minimal scanner for the sitemap vocabulary (`<urlset>`, `<url>`, `<loc>`,
//! `<lastmod>`, `<sitemapindex>`, `<sitemap>`). Handles the attribute-free
//! element forms sitemap generators emit; unrecognized or malformed content
//! is skipped rather than failing the whole document.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};

/// One `<url>` entry from a urlset.
#[derive(Debug, Clone, PartialEq)]
pub struct SitemapEntry {
    /// Entity-decoded `<loc>` value, not yet canonicalized.
    pub loc: String,
    /// Parsed `<lastmod>` value; None when absent or unparseable.
    pub last_modified: Option<DateTime<Utc>>,
}

/// A parsed sitemap document.
#[derive(Debug, Clone, PartialEq)]
pub enum Sitemap {
    /// A urlset listing resources directly.
    UrlSet(Vec<SitemapEntry>),
    /// A sitemap index listing child sitemap URLs.
    Index(Vec<String>),
}

/// Parse a sitemap document, detecting urlset vs. index form.
pub fn parse_sitemap(xml: &str) -> Sitemap {
    if xml.contains("<sitemapindex") {
        let children = blocks(xml, "sitemap")
            .into_iter()
            .filter_map(|block| tag_text(block, "loc"))
            .map(decode_entities)
            .filter(|loc| !loc.is_empty())
            .collect();
        return Sitemap::Index(children);
    }

    let entries = blocks(xml, "url")
        .into_iter()
        .filter_map(|block| {
            let loc = decode_entities(tag_text(block, "loc")?);
            if loc.is_empty() {
                return None;
            }
            let last_modified = tag_text(block, "lastmod").and_then(parse_lastmod);
            Some(SitemapEntry { loc, last_modified })
        })
        .collect();
    Sitemap::UrlSet(entries)
}

/// Parse a `<lastmod>` value. Accepts full W3C datetimes (RFC 3339) and the
/// date-only form, which maps to midnight UTC.
pub fn parse_lastmod(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }

    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        let midnight = date.and_hms_opt(0, 0, 0)?;
        return Some(Utc.from_utc_datetime(&midnight));
    }

    None
}

/// Contents of every `<tag>...</tag>` occurrence, in document order.
fn blocks<'a>(xml: &'a str, tag: &str) -> Vec<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let mut out = Vec::new();
    let mut cursor = 0;

    while let Some(start) = xml[cursor..].find(&open) {
        let body_start = cursor + start + open.len();
        match xml[body_start..].find(&close) {
            Some(end) => {
                out.push(&xml[body_start..body_start + end]);
                cursor = body_start + end + close.len();
            }
            None => break,
        }
    }

    out
}

/// Trimmed text of the first `<tag>...</tag>` inside a block.
fn tag_text<'a>(block: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = block.find(&open)? + open.len();
    let end = block[start..].find(&close)? + start;
    Some(block[start..end].trim())
}

/// Decode the predefined XML entities. `&amp;` goes last so doubly-escaped
/// input does not re-decode.
fn decode_entities(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}
