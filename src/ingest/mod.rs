// src/ingest/mod.rs
pub mod fetcher;
pub mod normalizer;
pub mod scheduler;

use chrono::{DateTime, Utc};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use once_cell::sync::OnceCell;

pub use fetcher::{FeedFetcher, HttpFetcher};
pub use normalizer::{normalize, Drafts};

/// Summaries are capped at this many characters after cleanup.
pub const SUMMARY_MAX_CHARS: usize = 1500;

/// One-time metrics registration (so series show up on /metrics).
pub(crate) fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("ingest_fetch_attempts_total", "HTTP fetch attempts, retries included.");
        describe_counter!("ingest_fetch_errors_total", "Fetches that failed after all retries.");
        describe_counter!("ingest_items_total", "Feed entries turned into drafts.");
        describe_counter!("ingest_skipped_total", "Feed entries dropped for a missing title or link.");
        describe_histogram!("ingest_parse_ms", "Feed parse time in milliseconds.");
        describe_histogram!("ingest_fetch_ms", "Successful fetch latency in milliseconds.");
        describe_gauge!("ingest_scheduler_last_tick_ts", "Unix ts of the last scheduler tick.");
    });
}

/// Undecoded feed body as returned by the fetcher.
#[derive(Debug, Clone)]
pub struct RawPayload {
    pub body: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

impl RawPayload {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            status: 200,
            content_type: None,
            fetched_at: Utc::now(),
        }
    }
}

/// One normalized feed entry. Lives only for a single processing pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ArticleDraft {
    pub source_id: String,
    pub link: String,
    pub title: String,
    pub summary: String,
    pub published_at: DateTime<Utc>,
    /// `published_at` was missing or unparseable and is the fetch time.
    pub published_fallback: bool,
    pub raw_tags: Vec<String>,
}

/// Clean feed text: decode entities, strip tags, fold typographic quotes,
/// collapse whitespace, cap at `max_chars`.
pub fn normalize_text(s: &str, max_chars: usize) -> String {
    // 1) HTML entity decode
    let mut out = html_escape::decode_html_entities(s).to_string();

    // 2) Strip HTML tags (CDATA descriptions often carry markup)
    static RE_TAGS: OnceCell<regex::Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| regex::Regex::new(r"(?is)<[^>]*>").expect("tag regex"));
    out = re_tags.replace_all(&out, " ").to_string();

    // 3) Normalize “ ” ‘ ’ « » to ASCII quotes
    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    // 4) Collapse whitespace
    static RE_WS: OnceCell<regex::Regex> = OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| regex::Regex::new(r"\s+").expect("ws regex"));
    out = re_ws.replace_all(&out, " ").trim().to_string();

    // 5) Length cap
    if out.chars().count() > max_chars {
        out = out.chars().take(max_chars).collect::<String>().trim_end().to_string();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_markup_and_entities() {
        let s = "<p>Ford&nbsp;unveils <b>“new”</b>\n\n F-150&amp;co</p>";
        assert_eq!(normalize_text(s, 1500), "Ford unveils \"new\" F-150&co");
    }

    #[test]
    fn caps_length_on_char_boundary() {
        let s = "é".repeat(40);
        assert_eq!(normalize_text(&s, 10).chars().count(), 10);
    }
}
