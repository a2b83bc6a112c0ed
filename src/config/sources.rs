// src/config/sources.rs
//! Static source seeds. Read once at startup and never written back.
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

pub const ENV_SOURCES_CONFIG_PATH: &str = "SOURCES_CONFIG_PATH";

/// A 0..=10 score given either as a number or as a label ("High", "Medium", "Low").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Score {
    Number(f64),
    Label(String),
}

impl Default for Score {
    fn default() -> Self {
        Score::Number(5.0)
    }
}

impl Score {
    pub fn value(&self) -> f64 {
        match self {
            Score::Number(n) if n.is_finite() => n.clamp(0.0, 10.0),
            Score::Number(_) => 5.0,
            Score::Label(l) => match l.trim().to_ascii_lowercase().as_str() {
                "very high" | "highest" => 9.0,
                "high" => 8.0,
                "medium" | "moderate" => 5.0,
                "low" => 3.0,
                _ => 5.0,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSeed {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub website: String,
    pub rss_feed: String,
    #[serde(default)]
    pub region: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub credibility: Score,
    #[serde(default)]
    pub automotive_focus: Score,
    #[serde(default)]
    pub specialties: Vec<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_language() -> String {
    "en".to_string()
}

fn default_true() -> bool {
    true
}

impl SourceSeed {
    /// Explicit id when given, otherwise a slug of the display name.
    pub fn stable_id(&self) -> String {
        match self.id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => slugify(&self.name),
        }
    }
}

pub fn slugify(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut dash = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            dash = false;
        } else if !dash && !out.is_empty() {
            out.push('-');
            dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

pub fn load_sources_from(path: &Path) -> Result<Vec<SourceSeed>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading sources from {}", path.display()))?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let seeds = if ext == "toml" {
        parse_toml(&content)?
    } else {
        parse_json(&content)?
    };
    Ok(clean_seeds(seeds))
}

/// Load sources using env var + fallbacks:
/// 1) $SOURCES_CONFIG_PATH
/// 2) config/sources.json
/// 3) config/sources.toml
pub fn load_sources_default() -> Result<Vec<SourceSeed>> {
    if let Ok(p) = std::env::var(ENV_SOURCES_CONFIG_PATH) {
        let pb = PathBuf::from(p);
        if pb.exists() {
            return load_sources_from(&pb);
        }
        return Err(anyhow!("{ENV_SOURCES_CONFIG_PATH} points to non-existent path"));
    }
    let json_p = PathBuf::from("config/sources.json");
    if json_p.exists() {
        return load_sources_from(&json_p);
    }
    let toml_p = PathBuf::from("config/sources.toml");
    if toml_p.exists() {
        return load_sources_from(&toml_p);
    }
    Ok(Vec::new())
}

fn parse_json(s: &str) -> Result<Vec<SourceSeed>> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum JsonSources {
        List(Vec<SourceSeed>),
        Wrapped { sources: Vec<SourceSeed> },
    }
    let v: JsonSources = serde_json::from_str(s).context("parsing sources json")?;
    Ok(match v {
        JsonSources::List(l) => l,
        JsonSources::Wrapped { sources } => sources,
    })
}

fn parse_toml(s: &str) -> Result<Vec<SourceSeed>> {
    #[derive(Deserialize)]
    struct TomlSources {
        #[serde(default)]
        sources: Vec<SourceSeed>,
    }
    let v: TomlSources = toml::from_str(s).context("parsing sources toml")?;
    Ok(v.sources)
}

/// Drops seeds without a feed URL or name, and later duplicates of an id.
fn clean_seeds(seeds: Vec<SourceSeed>) -> Vec<SourceSeed> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(seeds.len());
    for seed in seeds {
        if seed.name.trim().is_empty() || seed.rss_feed.trim().is_empty() {
            tracing::warn!(name = %seed.name, "source seed without name or feed, skipping");
            continue;
        }
        let id = seed.stable_id();
        if id.is_empty() || !seen.insert(id.clone()) {
            tracing::warn!(id = %id, "duplicate source id, keeping first");
            continue;
        }
        out.push(seed);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_and_numbers_both_parse() {
        let json = r#"[
            {"name":"Auto News","website":"https://a.example","rssFeed":"https://a.example/rss",
             "region":"US","language":"en","credibility":"High","automotiveFocus":9,
             "specialties":["EV"],"isActive":true},
            {"name":"Auto News","rssFeed":"https://dup.example/rss"},
            {"name":"","rssFeed":"https://x.example/rss"}
        ]"#;
        let seeds = clean_seeds(parse_json(json).unwrap());
        assert_eq!(seeds.len(), 1);
        assert_eq!(seeds[0].stable_id(), "auto-news");
        assert_eq!(seeds[0].credibility.value(), 8.0);
        assert_eq!(seeds[0].automotive_focus.value(), 9.0);
    }

    #[test]
    fn toml_sources_table() {
        let toml = r#"
            [[sources]]
            id = "ev-wire"
            name = "EV Wire"
            rss_feed = "https://ev.example/feed"
        "#;
        // TOML keys are camelCase too, to keep one record shape across formats.
        assert!(parse_toml(toml).is_err());
        let toml = r#"
            [[sources]]
            id = "ev-wire"
            name = "EV Wire"
            rssFeed = "https://ev.example/feed"
            credibility = 30
        "#;
        let seeds = parse_toml(toml).unwrap();
        assert_eq!(seeds[0].stable_id(), "ev-wire");
        assert_eq!(seeds[0].credibility.value(), 10.0);
        assert!(seeds[0].is_active);
    }

    #[test]
    fn slug_collapses_punctuation() {
        assert_eq!(slugify("  Motor1.com / News!! "), "motor1-com-news");
    }
}
