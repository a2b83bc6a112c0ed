// src/classify/openai.rs
//! External inference backend (OpenAI-compatible chat completions).
//!
//! One call, no retries here: `RetryingClassifier` owns the timeout and
//! retry discipline. Transport problems map to `ServiceUnavailable` or
//! `Timeout`; anything that is not the expected JSON is `InvalidResponse`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{Category, Classification, ClassificationInput, Classifier, Industry, Sentiment};
use crate::config::ClassifierConfig;
use crate::error::ClassificationError;

const SYSTEM_PROMPT: &str = "You are a news analyst. Classify the article and answer with ONE JSON object only, no prose:\n\
{\"industry\": one of [\"Automotive\",\"HVAC\",\"Finance\",\"Healthcare\",\"Energy\",\"Tech\",\"Unknown\"],\n\
 \"category\": one of [\"Launch\",\"Financials\",\"Competitor\",\"Regulation\",\"Research\",\"Opinion\",\"Other\"],\n\
 \"sentiment\": one of [\"positive\",\"negative\",\"neutral\"],\n\
 \"importance\": integer 1-5,\n\
 \"confidence\": number 0-1,\n\
 \"tags\": up to 10 short lowercase keywords}";

pub struct OpenAiClassifier {
    http: reqwest::Client,
    api_key: String,
    model: String,
    endpoint: String,
}

impl OpenAiClassifier {
    pub fn new(cfg: &ClassifierConfig, api_key: String) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("newsdesk/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(4))
            .timeout(cfg.timeout())
            .build()?;
        Ok(Self {
            http,
            api_key,
            model: cfg.model.clone(),
            endpoint: cfg.endpoint.clone(),
        })
    }
}

#[derive(Serialize)]
struct Msg<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct Req<'a> {
    model: &'a str,
    messages: Vec<Msg<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct Resp {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMsg,
}

#[derive(Deserialize)]
struct ChoiceMsg {
    content: String,
}

/// Model output before validation; labels are checked separately so a
/// slightly off label does not throw away the whole answer.
#[derive(Deserialize)]
struct RawClassification {
    industry: String,
    category: String,
    sentiment: String,
    importance: f64,
    confidence: f64,
    #[serde(default)]
    tags: Vec<String>,
}

/// Drop a surrounding markdown code fence, if any.
fn strip_code_fences(s: &str) -> &str {
    let t = s.trim();
    let Some(rest) = t.strip_prefix("```") else {
        return t;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Parse and validate the assistant message content.
pub fn parse_completion(content: &str) -> Result<Classification, ClassificationError> {
    let raw: RawClassification = serde_json::from_str(strip_code_fences(content))
        .map_err(|e| ClassificationError::InvalidResponse(format!("not json: {e}")))?;
    let sentiment: Sentiment = raw
        .sentiment
        .parse()
        .map_err(ClassificationError::InvalidResponse)?;
    if !raw.importance.is_finite() {
        return Err(ClassificationError::InvalidResponse("importance not a number".into()));
    }
    let importance = raw.importance.round();
    if !(1.0..=5.0).contains(&importance) {
        return Err(ClassificationError::InvalidResponse(format!(
            "importance {importance} outside 1..=5"
        )));
    }
    Classification {
        industry: raw.industry.parse().unwrap_or(Industry::Unknown),
        category: raw.category.parse().unwrap_or(Category::Other),
        sentiment,
        importance: importance as u8,
        confidence: raw.confidence,
        tags: raw.tags,
    }
    .validated()
}

fn user_prompt(input: &ClassificationInput) -> String {
    let mut s = format!(
        "Source: {} (credibility {:.0}/10)\nTitle: {}\n",
        input.source_name, input.source_credibility, input.title
    );
    if !input.summary.is_empty() {
        s.push_str("Summary: ");
        s.push_str(&input.summary);
        s.push('\n');
    }
    if !input.raw_tags.is_empty() {
        s.push_str("Feed tags: ");
        s.push_str(&input.raw_tags.join(", "));
        s.push('\n');
    }
    s
}

#[async_trait]
impl Classifier for OpenAiClassifier {
    async fn classify(
        &self,
        input: &ClassificationInput,
    ) -> Result<Classification, ClassificationError> {
        let user = user_prompt(input);
        let req = Req {
            model: &self.model,
            messages: vec![
                Msg {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                Msg {
                    role: "user",
                    content: &user,
                },
            ],
            temperature: 0.0,
            max_tokens: 300,
        };

        let resp = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ClassificationError::Timeout
                } else {
                    ClassificationError::ServiceUnavailable(e.to_string())
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ClassificationError::ServiceUnavailable(format!(
                "http status {}",
                status.as_u16()
            )));
        }
        let body: Resp = resp.json().await.map_err(|e| {
            if e.is_timeout() {
                ClassificationError::Timeout
            } else {
                ClassificationError::InvalidResponse(format!("completion body: {e}"))
            }
        })?;
        let content = body
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .unwrap_or("");
        parse_completion(content)
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fenced_json_is_accepted() {
        let content = "```json\n{\"industry\":\"automotive\",\"category\":\"Launch\",\"sentiment\":\"positive\",\"importance\":4,\"confidence\":0.82,\"tags\":[\"EV\",\"ev\",\"Ford\"]}\n```";
        let c = parse_completion(content).unwrap();
        assert_eq!(c.industry, Industry::Automotive);
        assert_eq!(c.importance, 4);
        assert_eq!(c.tags, vec!["ev".to_string(), "ford".to_string()]);
    }

    #[test]
    fn unknown_labels_degrade_but_bad_scores_fail() {
        let c = parse_completion(
            r#"{"industry":"Aerospace","category":"Rumor","sentiment":"neutral","importance":2.4,"confidence":0.3}"#,
        )
        .unwrap();
        assert_eq!(c.industry, Industry::Unknown);
        assert_eq!(c.category, Category::Other);
        assert_eq!(c.importance, 2);

        for bad in [
            "I think it's about cars",
            r#"{"industry":"Tech","category":"Other","sentiment":"meh","importance":3,"confidence":0.5}"#,
            r#"{"industry":"Tech","category":"Other","sentiment":"neutral","importance":9,"confidence":0.5}"#,
            r#"{"industry":"Tech","category":"Other","sentiment":"neutral","importance":3,"confidence":1.5}"#,
        ] {
            assert!(
                matches!(parse_completion(bad), Err(ClassificationError::InvalidResponse(_))),
                "{bad}"
            );
        }
    }
}
