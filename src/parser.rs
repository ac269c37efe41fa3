//! Feed parsing and candidate normalization (spec §4.1 steps 3-6).
//! Adapted from a sequential, no-dedup-cache feed-entry extractor: the
//! in-memory `seen_guids`/`seen_urls` caches are gone because uniqueness is
//! the store's job (I1), not the parser's.

use crate::dedup::simhash64;
use crate::error::{PipelineError, Result};
use crate::models::{ArticleCandidate, BlogHostType};
use chrono::{DateTime, Utc};
use feed_rs::model::Entry;
use md5::{Digest, Md5};

/// Parses a raw feed body into article candidates for one source.
pub struct FeedParser;

impl FeedParser {
    pub fn new() -> Self {
        Self
    }

    /// Parses feed bytes and converts every entry into an `ArticleCandidate`.
    /// Entries that carry neither link nor GUID nor title are skipped — they
    /// carry no stable identity to derive a `post_id` from.
    pub fn parse(&self, source_name: &str, content: &[u8]) -> Result<Vec<ArticleCandidate>> {
        let feed = feed_rs::parser::parse(content).map_err(|e| PipelineError::Parse(e.to_string()))?;

        Ok(feed
            .entries
            .into_iter()
            .filter_map(|entry| self.convert_entry(source_name, entry))
            .collect())
    }

    fn convert_entry(&self, source_name: &str, entry: Entry) -> Option<ArticleCandidate> {
        let link = entry.links.first().map(|l| l.href.clone());
        let title = entry
            .title
            .clone()
            .map(|t| t.content)
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| "Untitled".to_string());

        let html_content = richest_body(&entry);
        let content = html_content
            .as_deref()
            .map(strip_html)
            .unwrap_or_default();

        if link.is_none() && title == "Untitled" && content.is_empty() {
            return None;
        }

        let (published_on, is_fallback) = resolve_instant(&entry);

        let post_id = match &link {
            Some(url) => format!("rss_{}", md5_hex(url)),
            None => md5_hex(&format!("{}|{}|{}", source_name, title, published_on.to_rfc3339())),
        };

        let url = link.unwrap_or_else(|| format!("urn:post:{post_id}"));
        let simhash = if content.is_empty() {
            None
        } else {
            Some(simhash64(&format!("{title} {content}")))
        };

        Some(ArticleCandidate {
            post_id,
            url,
            title,
            content,
            html_content,
            blog_host: source_name.to_string(),
            blog_host_type: BlogHostType::Media,
            published_on,
            published_on_is_fallback: is_fallback,
            simhash: simhash.map(|h| format!("{h:016x}")),
        })
    }
}

impl Default for FeedParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Concatenates every available content/summary/description field and keeps
/// the richest (longest) result, per spec §4.1 step 3.
fn richest_body(entry: &Entry) -> Option<String> {
    let mut candidates = Vec::new();
    if let Some(content) = &entry.content {
        if let Some(body) = &content.body {
            candidates.push(body.clone());
        }
    }
    if let Some(summary) = &entry.summary {
        candidates.push(summary.content.clone());
    }

    candidates.into_iter().max_by_key(|c| c.len())
}

/// Strips scripts/styles and tags, collapses whitespace, retains paragraph
/// separators as blank lines (spec §4.1 step 3: "collapse whitespace,
/// retain paragraph separators").
fn strip_html(html: &str) -> String {
    let sanitized = ammonia::Builder::default()
        .tags(std::collections::HashSet::new())
        .clean(html)
        .to_string();

    sanitized
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Instant resolution order (spec §4.1 step 3): parsed `published`, then
/// `updated`, then current time flagged as a fallback.
fn resolve_instant(entry: &Entry) -> (DateTime<Utc>, bool) {
    if let Some(p) = entry.published {
        return (p, false);
    }
    if let Some(u) = entry.updated {
        return (u, false);
    }
    (Utc::now(), true)
}

fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
<channel>
  <title>Sample Source</title>
  <item>
    <title>OFAC sanctions update</title>
    <link>https://example.com/articles/1</link>
    <description>&lt;p&gt;Regulators announced new sanctions today.&lt;/p&gt;</description>
    <pubDate>Mon, 01 Jun 2026 10:00:00 GMT</pubDate>
  </item>
  <item>
    <title></title>
    <link>https://example.com/articles/2</link>
    <description>No title but has a link and body text here.</description>
  </item>
</channel>
</rss>"#;

    #[test]
    fn parses_entries_and_derives_post_id_from_link() {
        let parser = FeedParser::new();
        let candidates = parser.parse("Sample Source", SAMPLE_FEED.as_bytes()).unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].post_id, format!("rss_{}", md5_hex("https://example.com/articles/1")));
        assert!(!candidates[0].published_on_is_fallback);
    }

    #[test]
    fn missing_title_falls_back_to_untitled() {
        let parser = FeedParser::new();
        let candidates = parser.parse("Sample Source", SAMPLE_FEED.as_bytes()).unwrap();
        assert_eq!(candidates[1].title, "Untitled");
    }

    #[test]
    fn strip_html_removes_tags() {
        let cleaned = strip_html("<p>Hello <b>world</b></p><script>evil()</script>");
        assert!(!cleaned.contains('<'));
        assert!(cleaned.contains("Hello"));
        assert!(!cleaned.contains("evil"));
    }
}
