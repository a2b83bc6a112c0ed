// src/classify/rules.rs
//! Deterministic keyword classifier.
//!
//! Industry and category are the taxonomy buckets with the most keyword
//! hits (ties go to the earlier bucket). Sentiment is a lexicon sum with
//! negation over the three preceding tokens. Confidence blends keyword
//! strength, the industry margin and source credibility.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use super::scoring::{base_confidence, margin, strength_from_hits, ScoreInputs, Weights};
use super::{
    Category, Classification, ClassificationInput, Classifier, Industry, Sentiment, MAX_TAGS,
};
use crate::error::ClassificationError;

static DEFAULT_LEXICON: Lazy<Arc<Lexicon>> = Lazy::new(|| {
    let raw = include_str!("../../config/keywords.toml");
    Arc::new(Lexicon::from_toml(raw).expect("valid keyword lexicon"))
});

#[derive(Debug, Deserialize)]
struct RawLexicon {
    industries: BTreeMap<String, Vec<String>>,
    categories: BTreeMap<String, Vec<String>>,
    sentiment: RawSentiment,
    #[serde(default)]
    importance: RawImportance,
}

#[derive(Debug, Deserialize)]
struct RawSentiment {
    positive: Vec<String>,
    negative: Vec<String>,
    #[serde(default)]
    negators: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawImportance {
    #[serde(default)]
    major: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Lexicon {
    /// In taxonomy order so ties resolve the same way every time.
    industries: Vec<(Industry, Vec<String>)>,
    categories: Vec<(Category, Vec<String>)>,
    positive: HashSet<String>,
    negative: HashSet<String>,
    negators: HashSet<String>,
    major: Vec<String>,
}

impl Lexicon {
    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        let raw: RawLexicon = toml::from_str(s)?;

        let mut industries = Vec::new();
        for (label, words) in raw.industries {
            let industry: Industry = label.parse().map_err(anyhow::Error::msg)?;
            industries.push((industry, clean(words)));
        }
        industries.sort_by_key(|(i, _)| *i);

        let mut categories = Vec::new();
        for (label, words) in raw.categories {
            let category: Category = label.parse().map_err(anyhow::Error::msg)?;
            categories.push((category, clean(words)));
        }
        categories.sort_by_key(|(c, _)| *c);

        Ok(Self {
            industries,
            categories,
            positive: clean(raw.sentiment.positive).into_iter().collect(),
            negative: clean(raw.sentiment.negative).into_iter().collect(),
            negators: clean(raw.sentiment.negators).into_iter().collect(),
            major: clean(raw.importance.major),
        })
    }
}

fn clean(words: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = words
        .iter()
        .map(|w| tokenize(w).collect::<Vec<_>>().join(" "))
        .filter(|w| !w.is_empty())
        .collect();
    out.dedup();
    out
}

/// Alphanumeric lowercase tokens.
fn tokenize(s: &str) -> impl Iterator<Item = String> + '_ {
    s.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
}

/// Text prepared for phrase lookup: `" tok tok tok "`.
struct Prepared {
    tokens: Vec<String>,
    padded: String,
}

impl Prepared {
    fn new(text: &str) -> Self {
        let tokens: Vec<String> = tokenize(text).collect();
        let padded = format!(" {} ", tokens.join(" "));
        Self { tokens, padded }
    }

    fn contains(&self, phrase: &str) -> bool {
        self.padded.contains(&format!(" {phrase} "))
    }

    fn hits<'a>(&self, words: &'a [String]) -> Vec<&'a str> {
        words
            .iter()
            .filter(|w| self.contains(w))
            .map(String::as_str)
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct RuleClassifier {
    lexicon: Arc<Lexicon>,
    weights: Weights,
}

impl Default for RuleClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleClassifier {
    pub fn new() -> Self {
        Self {
            lexicon: DEFAULT_LEXICON.clone(),
            weights: Weights::default(),
        }
    }

    pub fn with_lexicon(lexicon: Lexicon) -> Self {
        Self {
            lexicon: Arc::new(lexicon),
            weights: Weights::default(),
        }
    }

    fn sentiment(&self, tokens: &[String]) -> Sentiment {
        let lex = &self.lexicon;
        let mut score: i32 = 0;
        for (i, tok) in tokens.iter().enumerate() {
            let base = if lex.positive.contains(tok) {
                1
            } else if lex.negative.contains(tok) {
                -1
            } else {
                continue;
            };
            let negated = (1..=3).any(|k| i >= k && lex.negators.contains(&tokens[i - k]));
            score += if negated { -base } else { base };
        }
        match score.cmp(&0) {
            std::cmp::Ordering::Greater => Sentiment::Positive,
            std::cmp::Ordering::Less => Sentiment::Negative,
            std::cmp::Ordering::Equal => Sentiment::Neutral,
        }
    }

    pub fn classify_sync(&self, input: &ClassificationInput) -> Classification {
        let lex = &self.lexicon;
        let text = format!(
            "{} {} {}",
            input.title,
            input.summary,
            input.raw_tags.join(" ")
        );
        let prepared = Prepared::new(&text);

        // Best bucket by hit count; the first one wins a tie.
        let mut industry_hits: Vec<(Industry, Vec<&str>)> = lex
            .industries
            .iter()
            .map(|(i, words)| (*i, prepared.hits(words)))
            .collect();
        industry_hits.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then(a.0.cmp(&b.0)));
        let best = industry_hits.first().map_or(0, |(_, h)| h.len());
        let second = industry_hits.get(1).map_or(0, |(_, h)| h.len());
        let mut industry = match industry_hits.first() {
            Some((i, h)) if !h.is_empty() => *i,
            _ => Industry::Unknown,
        };
        if industry == Industry::Unknown && input.source_focus >= 8.0 {
            industry = Industry::Automotive;
        }

        let mut category_hits: Vec<(Category, Vec<&str>)> = lex
            .categories
            .iter()
            .map(|(c, words)| (*c, prepared.hits(words)))
            .collect();
        category_hits.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then(a.0.cmp(&b.0)));
        let category = match category_hits.first() {
            Some((c, h)) if !h.is_empty() => *c,
            _ => Category::Other,
        };
        let category_best = category_hits.first().map_or(0, |(_, h)| h.len());

        let major = prepared.hits(&lex.major).len();
        let mut importance: u8 = 2;
        if major > 0 {
            importance += 1;
        }
        if major > 1 {
            importance += 1;
        }
        if input.source_credibility >= 8.0 {
            importance += 1;
        }

        let inputs = ScoreInputs::new(
            input.source_credibility / 10.0,
            strength_from_hits(best + category_best),
            margin(best, second),
        );
        let mut confidence = base_confidence(&inputs, &self.weights);
        if best == 0 {
            confidence *= 0.5;
        }
        let confidence = (confidence * 1000.0).round() / 1000.0;

        let mut tags: Vec<String> = Vec::new();
        let winners = industry_hits
            .first()
            .filter(|_| best > 0)
            .map(|(_, h)| h.as_slice())
            .unwrap_or_default();
        let cat_winners = category_hits
            .first()
            .filter(|_| category_best > 0)
            .map(|(_, h)| h.as_slice())
            .unwrap_or_default();
        for t in winners.iter().chain(cat_winners) {
            if !tags.iter().any(|x| x == t) {
                tags.push((*t).to_string());
            }
        }
        tags.extend(input.raw_tags.iter().cloned());
        tags.truncate(MAX_TAGS * 2);

        Classification {
            industry,
            category,
            sentiment: self.sentiment(&prepared.tokens),
            importance: importance.clamp(1, 5),
            confidence,
            tags,
        }
    }
}

#[async_trait]
impl Classifier for RuleClassifier {
    async fn classify(
        &self,
        input: &ClassificationInput,
    ) -> Result<Classification, ClassificationError> {
        self.classify_sync(input).validated()
    }

    fn name(&self) -> &'static str {
        "rules"
    }
}
