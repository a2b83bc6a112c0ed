// tests/classifier_retry.rs
//
// Classifier wrappers (timeout + retry, result cache), the rule-based
// classifier on realistic headlines and the factory's env switches.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use newsdesk::classify::{
    build_classifier, CachingClassifier, Category, Classification, ClassificationInput, Classifier,
    Industry, RetryingClassifier, RuleClassifier, Sentiment,
};
use newsdesk::config::{ClassifierConfig, ClassifierKind};
use newsdesk::error::ClassificationError;
use newsdesk::retry::RetryPolicy;

fn input(title: &str, summary: &str) -> ClassificationInput {
    ClassificationInput {
        title: title.to_string(),
        summary: summary.to_string(),
        source_name: "Automotive News".to_string(),
        source_credibility: 9.0,
        source_focus: 9.0,
        raw_tags: vec![],
    }
}

/// Fails with `err` on the first `failures` calls, then answers with a
/// classification whose importance is the call number (capped at 5).
struct Scripted {
    failures: usize,
    err: ClassificationError,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Classifier for Scripted {
    async fn classify(
        &self,
        _input: &ClassificationInput,
    ) -> Result<Classification, ClassificationError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.failures {
            return Err(self.err.clone());
        }
        Ok(Classification {
            industry: Industry::Tech,
            category: Category::Research,
            sentiment: Sentiment::Neutral,
            importance: ((n + 1).min(5)) as u8,
            confidence: 0.8,
            tags: vec![],
        })
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

/// Never answers.
struct Hanging;

#[async_trait]
impl Classifier for Hanging {
    async fn classify(
        &self,
        _input: &ClassificationInput,
    ) -> Result<Classification, ClassificationError> {
        std::future::pending().await
    }

    fn name(&self) -> &'static str {
        "hanging"
    }
}

#[tokio::test]
async fn retries_transient_failures_within_budget() {
    let calls = Arc::new(AtomicUsize::new(0));
    let c = RetryingClassifier::new(
        Scripted {
            failures: 2,
            err: ClassificationError::ServiceUnavailable("503".into()),
            calls: calls.clone(),
        },
        Duration::from_secs(1),
        RetryPolicy::immediate(3),
    );
    let out = c.classify(&input("x", "y")).await.unwrap();
    assert_eq!(out.industry, Industry::Tech);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn gives_up_after_the_last_attempt() {
    let calls = Arc::new(AtomicUsize::new(0));
    let c = RetryingClassifier::new(
        Scripted {
            failures: 10,
            err: ClassificationError::InvalidResponse("not json".into()),
            calls: calls.clone(),
        },
        Duration::from_secs(1),
        RetryPolicy::immediate(2),
    );
    let err = c.classify(&input("x", "y")).await.unwrap_err();
    assert!(matches!(err, ClassificationError::InvalidResponse(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn a_hanging_backend_becomes_a_timeout() {
    let c = RetryingClassifier::new(Hanging, Duration::from_millis(200), RetryPolicy::immediate(1));
    let err = c.classify(&input("x", "y")).await.unwrap_err();
    assert_eq!(err, ClassificationError::Timeout);
}

#[tokio::test]
async fn cache_answers_identical_input_identically() {
    let calls = Arc::new(AtomicUsize::new(0));
    let c = CachingClassifier::new(Scripted {
        failures: 1,
        err: ClassificationError::Timeout,
        calls: calls.clone(),
    });
    let i = input("Nvidia unveils new chip", "");

    // Failures are not cached.
    assert!(c.classify(&i).await.is_err());
    assert!(c.is_empty());

    let first = c.classify(&i).await.unwrap();
    let second = c.classify(&i).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(c.len(), 1);

    // Any differing field is a different key.
    let mut other = i.clone();
    other.source_credibility = 3.0;
    let third = c.classify(&other).await.unwrap();
    assert_ne!(third.importance, first.importance);
    assert_eq!(c.len(), 2);
}

#[tokio::test]
async fn rules_classify_realistic_headlines() {
    let rules = RuleClassifier::new();

    let earnings = rules
        .classify(&input(
            "Ford beats earnings expectations as revenue climbs",
            "The automaker raised its full-year profit outlook.",
        ))
        .await
        .unwrap();
    assert_eq!(earnings.industry, Industry::Automotive);
    assert_eq!(earnings.category, Category::Financials);
    assert_eq!(earnings.sentiment, Sentiment::Positive);
    assert!((1..=5).contains(&earnings.importance));
    assert!((0.0..=1.0).contains(&earnings.confidence));

    let hvac = rules
        .classify(&input(
            "Carrier expands heat pump production",
            "The HVAC maker adds capacity for residential air conditioning units.",
        ))
        .await
        .unwrap();
    assert_eq!(hvac.industry, Industry::Hvac);
}

#[serial_test::serial]
#[tokio::test]
async fn factory_honours_mock_mode_and_missing_key() {
    std::env::set_var("AI_TEST_MODE", "mock");
    let c = build_classifier(&ClassifierConfig::default()).unwrap();
    assert_eq!(c.name(), "mock");
    let out = c.classify(&input("anything", "")).await.unwrap();
    assert_eq!(out.tags, vec!["mock".to_string()]);
    std::env::remove_var("AI_TEST_MODE");

    // Asking for the external backend without a key falls back to rules.
    std::env::remove_var("OPENAI_API_KEY");
    let cfg = ClassifierConfig {
        kind: ClassifierKind::Openai,
        ..ClassifierConfig::default()
    };
    let c = build_classifier(&cfg).unwrap();
    assert_eq!(c.name(), "rules");
}
