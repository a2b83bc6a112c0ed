// src/ingest/normalizer.rs
//! Feed payload → article drafts.
//!
//! Handles RSS 2.0, RSS 1.0 (RDF) and Atom. Every feed quirk stays in here:
//! a document that is not well-formed becomes `FetchError::ParseFailure`,
//! entries without a title or link (or with markup that cannot be read) are
//! skipped and counted, and bad dates fall back to the fetch time with
//! `published_fallback` set.

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use quick_xml::de::from_str;
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::Deserialize;
use time::format_description::well_known::{Rfc2822, Rfc3339};
use time::OffsetDateTime;

use super::{ensure_metrics_described, normalize_text, ArticleDraft, RawPayload, SUMMARY_MAX_CHARS};
use crate::error::FetchError;
use crate::sources::Source;

const TITLE_MAX_CHARS: usize = 300;

// ---- RSS 2.0 / RSS 1.0 ----

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}

#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(rename = "item", default)]
    items: Vec<RssItem>,
}

/// RSS 1.0 puts items next to the channel instead of inside it.
#[derive(Debug, Deserialize)]
struct Rdf {
    #[serde(rename = "item", default)]
    items: Vec<RssItem>,
}

#[derive(Debug, Deserialize)]
struct RssItem {
    title: Option<String>,
    link: Option<String>,
    guid: Option<Text>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    /// `dc:date`, the RSS 1.0 publication date.
    #[serde(rename = "date", alias = "dc:date")]
    dc_date: Option<String>,
    description: Option<String>,
    #[serde(rename = "category", default)]
    categories: Vec<Text>,
}

// ---- Atom ----

#[derive(Debug, Deserialize)]
struct AtomFeed {
    #[serde(rename = "entry", default)]
    entries: Vec<AtomEntry>,
}

#[derive(Debug, Deserialize)]
struct AtomEntry {
    title: Option<Text>,
    #[serde(rename = "link", default)]
    links: Vec<AtomLink>,
    summary: Option<Text>,
    content: Option<Text>,
    published: Option<String>,
    updated: Option<String>,
    #[serde(rename = "category", default)]
    categories: Vec<AtomCategory>,
}

#[derive(Debug, Deserialize)]
struct AtomLink {
    #[serde(rename = "@href")]
    href: Option<String>,
    #[serde(rename = "@rel")]
    rel: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AtomCategory {
    #[serde(rename = "@term")]
    term: Option<String>,
}

/// Element whose attributes we ignore and whose text we keep.
#[derive(Debug, Deserialize)]
struct Text {
    #[serde(rename = "$text", default)]
    value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FeedFormat {
    Rss,
    Rdf,
    Atom,
}

impl FeedFormat {
    fn label(self) -> &'static str {
        match self {
            FeedFormat::Rss => "rss",
            FeedFormat::Rdf => "rdf",
            FeedFormat::Atom => "atom",
        }
    }

    fn entry_tag(self) -> &'static str {
        match self {
            FeedFormat::Atom => "entry",
            FeedFormat::Rss | FeedFormat::Rdf => "item",
        }
    }
}

/// Format-independent entry, before validation.
#[derive(Debug, Default)]
struct FeedEntry {
    title: Option<String>,
    link: Option<String>,
    published: Option<String>,
    summary: Option<String>,
    tags: Vec<String>,
}

impl From<RssItem> for FeedEntry {
    fn from(it: RssItem) -> Self {
        let guid_link = it
            .guid
            .map(|g| g.value)
            .filter(|g| g.starts_with("http://") || g.starts_with("https://"));
        Self {
            title: it.title,
            link: it.link.filter(|l| !l.trim().is_empty()).or(guid_link),
            published: it.pub_date.or(it.dc_date),
            summary: it.description,
            tags: it.categories.into_iter().map(|c| c.value).collect(),
        }
    }
}

impl From<AtomEntry> for FeedEntry {
    fn from(e: AtomEntry) -> Self {
        // Prefer rel="alternate" (or no rel), then any link at all.
        let link = e
            .links
            .iter()
            .find(|l| l.rel.as_deref().map_or(true, |r| r == "alternate"))
            .or_else(|| e.links.first())
            .and_then(|l| l.href.clone());
        Self {
            title: e.title.map(|t| t.value),
            link,
            published: e.published.or(e.updated),
            summary: e.summary.or(e.content).map(|t| t.value),
            tags: e.categories.into_iter().filter_map(|c| c.term).collect(),
        }
    }
}

/// Lazy sequence of drafts for one payload, in feed order.
#[derive(Debug)]
pub struct Drafts {
    source_id: String,
    entries: std::vec::IntoIter<FeedEntry>,
    fallback_at: DateTime<Utc>,
    skipped: usize,
}

impl Drafts {
    /// Entries dropped so far: unreadable markup, or a missing title or link.
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

impl Iterator for Drafts {
    type Item = ArticleDraft;

    fn next(&mut self) -> Option<ArticleDraft> {
        for entry in self.entries.by_ref() {
            let title = entry
                .title
                .as_deref()
                .map(|t| normalize_text(t, TITLE_MAX_CHARS))
                .unwrap_or_default();
            let link = entry
                .link
                .as_deref()
                .map(str::trim)
                .unwrap_or_default()
                .to_string();
            if title.is_empty() || link.is_empty() {
                self.skipped += 1;
                counter!("ingest_skipped_total").increment(1);
                continue;
            }

            let parsed = entry.published.as_deref().and_then(parse_timestamp);
            let summary = entry
                .summary
                .as_deref()
                .map(|s| normalize_text(s, SUMMARY_MAX_CHARS))
                .unwrap_or_default();
            let raw_tags = entry
                .tags
                .iter()
                .map(|t| t.trim())
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect();

            counter!("ingest_items_total").increment(1);
            return Some(ArticleDraft {
                source_id: self.source_id.clone(),
                link,
                title,
                summary,
                published_at: parsed.unwrap_or(self.fallback_at),
                published_fallback: parsed.is_none(),
                raw_tags,
            });
        }
        None
    }
}

/// Parse a payload into drafts, keeping at most `max_items` feed entries.
pub fn normalize(
    source: &Source,
    payload: &RawPayload,
    max_items: usize,
) -> Result<Drafts, FetchError> {
    ensure_metrics_described();
    let t0 = std::time::Instant::now();

    let xml = scrub_html_entities_for_xml(payload.body.trim_start_matches('\u{feff}'));
    let format = sniff_format(&xml)?;
    let (mut entries, unreadable) = parse_entries(&xml, format)?;
    if unreadable > 0 {
        counter!("ingest_skipped_total").increment(unreadable as u64);
        tracing::warn!(
            target: "ingest",
            source = %source.id,
            unreadable,
            "feed entries with unreadable markup skipped"
        );
    }
    entries.truncate(max_items);

    histogram!("ingest_parse_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);
    Ok(Drafts {
        source_id: source.id.clone(),
        entries: entries.into_iter(),
        fallback_at: payload.fetched_at,
        skipped: unreadable,
    })
}

/// Whole-document parse first. When that fails on a well-formed document,
/// parse entry by entry so one odd entry does not cost the others; the
/// second value counts the entries that could not be read at all.
fn parse_entries(xml: &str, format: FeedFormat) -> Result<(Vec<FeedEntry>, usize), FetchError> {
    let whole: Result<Vec<FeedEntry>, _> = match format {
        FeedFormat::Rss => from_str::<Rss>(xml)
            .map(|r| r.channel.items.into_iter().map(FeedEntry::from).collect()),
        FeedFormat::Rdf => {
            from_str::<Rdf>(xml).map(|r| r.items.into_iter().map(FeedEntry::from).collect())
        }
        FeedFormat::Atom => from_str::<AtomFeed>(xml)
            .map(|f| f.entries.into_iter().map(FeedEntry::from).collect()),
    };
    let err = match whole {
        Ok(entries) => return Ok((entries, 0)),
        Err(e) => FetchError::parse(format!("{}: {e}", format.label())),
    };

    let chunks = match entry_chunks(xml, format.entry_tag()) {
        Ok(chunks) if !chunks.is_empty() => chunks,
        _ => return Err(err),
    };
    let mut entries = Vec::with_capacity(chunks.len());
    let mut unreadable = 0;
    for chunk in &chunks {
        let entry = match format {
            FeedFormat::Atom => from_str::<AtomEntry>(chunk).ok().map(FeedEntry::from),
            FeedFormat::Rss | FeedFormat::Rdf => from_str::<RssItem>(chunk)
                .ok()
                .or_else(|| flatten_rss_item(chunk).ok())
                .map(FeedEntry::from),
        };
        match entry {
            Some(e) => entries.push(e),
            None => unreadable += 1,
        }
    }
    Ok((entries, unreadable))
}

/// Raw markup of every `<tag>` element, in document order. Errors when the
/// document is not well-formed.
fn entry_chunks(xml: &str, tag: &str) -> Result<Vec<String>, quick_xml::Error> {
    let mut reader = Reader::from_str(xml);
    let mut out = Vec::new();
    loop {
        match reader.read_event()? {
            Event::Start(e) if e.local_name().as_ref() == tag.as_bytes() => {
                let span = reader.read_to_end(e.name())?;
                let inner = &xml[span.start as usize..span.end as usize];
                out.push(format!("<{tag}>{inner}</{tag}>"));
            }
            Event::Eof => return Ok(out),
            _ => {}
        }
    }
}

/// Read an RSS item as plain text per child element, flattening any markup
/// nested inside a field (`<description><p>..</p></description>`).
fn flatten_rss_item(chunk: &str) -> Result<RssItem, quick_xml::Error> {
    let mut reader = Reader::from_str(chunk);
    let mut item = RssItem {
        title: None,
        link: None,
        guid: None,
        pub_date: None,
        dc_date: None,
        description: None,
        categories: Vec::new(),
    };
    let mut depth = 0usize;
    let mut field: Option<Vec<u8>> = None;
    let mut text = String::new();
    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                depth += 1;
                if depth == 2 {
                    field = Some(e.local_name().as_ref().to_vec());
                    text.clear();
                } else if depth > 2 {
                    text.push(' ');
                }
            }
            Event::End(_) => {
                if depth == 2 {
                    if let Some(name) = field.take() {
                        let value = std::mem::take(&mut text).trim().to_string();
                        match name.as_slice() {
                            b"title" => item.title = Some(value),
                            b"link" => item.link = Some(value),
                            b"guid" => item.guid = Some(Text { value }),
                            b"pubDate" => item.pub_date = Some(value),
                            b"date" => item.dc_date = Some(value),
                            b"description" => item.description = Some(value),
                            b"category" | b"subject" => item.categories.push(Text { value }),
                            _ => {}
                        }
                    }
                }
                depth = depth.saturating_sub(1);
            }
            Event::Text(t) if depth >= 2 => text.push_str(&t.unescape()?),
            Event::CData(c) if depth >= 2 => text.push_str(&String::from_utf8_lossy(&c)),
            Event::Eof => return Ok(item),
            _ => {}
        }
    }
}

/// Identify the feed dialect from the root element.
fn sniff_format(xml: &str) -> Result<FeedFormat, FetchError> {
    let mut reader = Reader::from_str(xml);
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                let name = e.local_name();
                return match name.as_ref() {
                    b"rss" => Ok(FeedFormat::Rss),
                    b"RDF" => Ok(FeedFormat::Rdf),
                    b"feed" => Ok(FeedFormat::Atom),
                    other => Err(FetchError::parse(format!(
                        "unsupported root element <{}>",
                        String::from_utf8_lossy(other)
                    ))),
                };
            }
            Ok(Event::Eof) => return Err(FetchError::parse("empty document")),
            Ok(_) => continue,
            Err(e) => return Err(FetchError::parse(format!("xml: {e}"))),
        }
    }
}

/// RFC 2822 first (RSS), then RFC 3339 (Atom), then chrono's more lenient
/// RFC 2822 reader for feeds with odd zone names.
fn parse_timestamp(ts: &str) -> Option<DateTime<Utc>> {
    let ts = ts.trim();
    if ts.is_empty() {
        return None;
    }
    OffsetDateTime::parse(ts, &Rfc2822)
        .or_else(|_| OffsetDateTime::parse(ts, &Rfc3339))
        .ok()
        .and_then(|dt| DateTime::<Utc>::from_timestamp(dt.unix_timestamp(), dt.nanosecond()))
        .or_else(|| {
            DateTime::parse_from_rfc2822(ts)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        })
}

/// HTML entities that are not valid XML but show up in real feeds.
fn scrub_html_entities_for_xml(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&ndash;", "-")
        .replace("&mdash;", "-")
        .replace("&ldquo;", "\"")
        .replace("&rdquo;", "\"")
        .replace("&lsquo;", "'")
        .replace("&rsquo;", "'")
        .replace("&hellip;", "...")
        .replace("&copy;", "(c)")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_in_both_formats() {
        let a = parse_timestamp("Tue, 10 Jun 2025 14:30:00 +0000").unwrap();
        let b = parse_timestamp("2025-06-10T14:30:00Z").unwrap();
        assert_eq!(a, b);
        assert!(parse_timestamp("Tue, 10 Jun 2025 14:30:00 GMT").is_some());
        assert!(parse_timestamp("yesterday").is_none());
        assert!(parse_timestamp("  ").is_none());
    }

    #[test]
    fn sniffs_root_after_prolog() {
        let rss = "<?xml version=\"1.0\"?>\n<!-- c --><rss version=\"2.0\"><channel/></rss>";
        assert_eq!(sniff_format(rss).unwrap(), FeedFormat::Rss);
        let atom = "<feed xmlns=\"http://www.w3.org/2005/Atom\"></feed>";
        assert_eq!(sniff_format(atom).unwrap(), FeedFormat::Atom);
        assert!(sniff_format("<html><body/></html>").is_err());
        assert!(sniff_format("").is_err());
    }
}
