//! Content filtering
//!
//! A pipeline of predicates evaluated in order with short-circuit on the
//! first block: literal blocked terms, blocked regex patterns, heuristic
//! category scoring, then an optional ML classifier behind a trait seam.
//! The filter is stateless and idempotent; compiled once per config snapshot.

use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use std::sync::Arc;
use tracing::warn;

use crate::config::{ContentFilterConfig, FilterThresholds};
use crate::llm::{FilterCategory, LLMError, LLMResult};

/// Replacement text for filtered completions.
pub const FILTERED_PLACEHOLDER: &str = "[Content filtered]";

/// Outcome of one filter check.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterResult {
    pub allowed: bool,
    pub reason: Option<String>,
    pub categories: Vec<FilterCategory>,
}

impl FilterResult {
    pub fn pass() -> Self {
        Self {
            allowed: true,
            reason: None,
            categories: Vec::new(),
        }
    }

    pub fn block(reason: impl Into<String>, categories: Vec<FilterCategory>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            categories,
        }
    }
}

/// Optional moderation model consulted as the last predicate.
///
/// Injected from outside the pipeline; nothing in the gateway routes a
/// classifier call back through its own completion path.
#[async_trait]
pub trait ModerationClassifier: Send + Sync {
    /// Category scores in [0, 1] for `text`.
    async fn classify(&self, text: &str) -> LLMResult<Vec<(FilterCategory, f64)>>;
}

/// One heuristic keyword bucket.
struct CategoryBucket {
    category: FilterCategory,
    keywords: &'static [&'static str],
}

const BUCKETS: &[CategoryBucket] = &[
    CategoryBucket {
        category: FilterCategory::Hate,
        keywords: &["hate", "bigot", "racist", "slur", "supremacist"],
    },
    CategoryBucket {
        category: FilterCategory::Harassment,
        keywords: &["harass", "bully", "stalk", "threaten", "intimidate"],
    },
    CategoryBucket {
        category: FilterCategory::SelfHarm,
        keywords: &["suicide", "self-harm", "kill myself", "hurt myself", "end my life"],
    },
    CategoryBucket {
        category: FilterCategory::Sexual,
        keywords: &["explicit", "nsfw", "pornographic", "sexual act", "erotica"],
    },
    CategoryBucket {
        category: FilterCategory::Violence,
        keywords: &["murder", "massacre", "torture", "bomb making", "mutilate"],
    },
];

/// Patterns treated as PII regardless of category thresholds.
const PII_PATTERNS: &[&str] = &[
    // Email addresses.
    r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}",
    // US social security numbers.
    r"\b\d{3}-\d{2}-\d{4}\b",
    // 16-digit card numbers, with or without separators.
    r"\b(?:\d[ -]?){15}\d\b",
];

/// Compiled filter for one configuration snapshot.
pub struct ContentFilter {
    enabled: bool,
    filter_prompts: bool,
    filter_completions: bool,
    term_patterns: Vec<(String, Regex)>,
    blocked_patterns: Vec<(String, Regex)>,
    pii_patterns: Vec<Regex>,
    thresholds: FilterThresholds,
    use_ml: bool,
    fail_open: bool,
    classifier: Option<Arc<dyn ModerationClassifier>>,
}

impl ContentFilter {
    pub fn new(config: &ContentFilterConfig) -> LLMResult<Self> {
        Self::with_classifier(config, None)
    }

    pub fn with_classifier(
        config: &ContentFilterConfig,
        classifier: Option<Arc<dyn ModerationClassifier>>,
    ) -> LLMResult<Self> {
        let mut term_patterns = Vec::with_capacity(config.blocked_terms.len());
        for term in &config.blocked_terms {
            // Whole-word, case-insensitive. The literal is escaped so terms
            // containing regex metacharacters stay literal.
            let pattern = format!(r"\b{}\b", regex::escape(term));
            let re = RegexBuilder::new(&pattern)
                .case_insensitive(true)
                .build()
                .map_err(|e| LLMError::Internal(format!("invalid blocked term {term:?}: {e}")))?;
            term_patterns.push((term.clone(), re));
        }

        let mut blocked_patterns = Vec::with_capacity(config.blocked_patterns.len());
        for pattern in &config.blocked_patterns {
            let re = Regex::new(pattern).map_err(|e| {
                LLMError::Internal(format!("invalid blocked pattern {pattern:?}: {e}"))
            })?;
            blocked_patterns.push((pattern.clone(), re));
        }

        let pii_patterns = PII_PATTERNS
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| LLMError::Internal(format!("invalid pii pattern: {e}")))?;

        Ok(Self {
            enabled: config.enable,
            filter_prompts: config.filter_prompts,
            filter_completions: config.filter_completions,
            term_patterns,
            blocked_patterns,
            pii_patterns,
            thresholds: config.thresholds.clone(),
            use_ml: config.use_ml_filtering,
            fail_open: config.fail_open_on_moderation_error,
            classifier,
        })
    }

    /// Check an incoming prompt.
    pub async fn check_prompt(&self, text: &str) -> FilterResult {
        if !self.enabled || !self.filter_prompts {
            return FilterResult::pass();
        }
        self.run_pipeline(text).await
    }

    /// Check model output (full response or one streaming delta).
    pub async fn check_completion(&self, text: &str) -> FilterResult {
        if !self.enabled || !self.filter_completions {
            return FilterResult::pass();
        }
        self.run_pipeline(text).await
    }

    async fn run_pipeline(&self, text: &str) -> FilterResult {
        if text.is_empty() {
            return FilterResult::pass();
        }

        // 1. Literal blocked terms.
        for (term, re) in &self.term_patterns {
            if re.is_match(text) {
                return FilterResult::block(
                    format!("blocked term: {term}"),
                    vec![FilterCategory::BlockedTerm],
                );
            }
        }

        // 2. Blocked regex patterns.
        for (pattern, re) in &self.blocked_patterns {
            if re.is_match(text) {
                return FilterResult::block(
                    format!("blocked pattern: {pattern}"),
                    vec![FilterCategory::BlockedPattern],
                );
            }
        }

        // 3. Heuristic category scoring.
        if let Some(result) = self.score_heuristics(text) {
            return result;
        }

        // 4. Optional ML classifier.
        if self.use_ml {
            match &self.classifier {
                Some(classifier) => match classifier.classify(text).await {
                    Ok(scores) => {
                        for (category, score) in scores {
                            if score >= self.threshold_for(category) {
                                return FilterResult::block(
                                    format!("moderation score {score:.2} for {category:?}"),
                                    vec![category],
                                );
                            }
                        }
                    }
                    Err(e) if self.fail_open => {
                        warn!("moderation classifier failed, allowing content: {e}");
                    }
                    Err(_) => {
                        return FilterResult::block("moderation_unavailable", Vec::new());
                    }
                },
                None if !self.fail_open => {
                    return FilterResult::block("moderation_unavailable", Vec::new());
                }
                None => {}
            }
        }

        FilterResult::pass()
    }

    fn score_heuristics(&self, text: &str) -> Option<FilterResult> {
        let lowered = text.to_lowercase();

        for bucket in BUCKETS {
            let hits = bucket
                .keywords
                .iter()
                .filter(|kw| lowered.contains(*kw))
                .count();
            if hits == 0 {
                continue;
            }
            // Three distinct keyword hits saturate the score.
            let score = (hits as f64 / 3.0).min(1.0);
            if score >= self.threshold_for(bucket.category) {
                return Some(FilterResult::block(
                    format!("category score {score:.2} for {:?}", bucket.category),
                    vec![bucket.category],
                ));
            }
        }

        for re in &self.pii_patterns {
            if re.is_match(text) {
                return Some(FilterResult::block(
                    "personally identifiable information detected",
                    vec![FilterCategory::Pii],
                ));
            }
        }

        None
    }

    fn threshold_for(&self, category: FilterCategory) -> f64 {
        match category {
            FilterCategory::Hate => self.thresholds.hate,
            FilterCategory::Harassment => self.thresholds.harassment,
            FilterCategory::SelfHarm => self.thresholds.self_harm,
            FilterCategory::Sexual => self.thresholds.sexual,
            FilterCategory::Violence => self.thresholds.violence,
            // Term/pattern/PII blocks are absolute.
            _ => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(terms: Vec<&str>, patterns: Vec<&str>) -> ContentFilterConfig {
        ContentFilterConfig {
            blocked_terms: terms.into_iter().map(String::from).collect(),
            blocked_patterns: patterns.into_iter().map(String::from).collect(),
            ..ContentFilterConfig::default()
        }
    }

    #[tokio::test]
    async fn clean_text_passes() {
        let filter = ContentFilter::new(&config_with(vec![], vec![])).unwrap();
        let result = filter.check_prompt("What is the capital of France?").await;
        assert!(result.allowed);
        assert!(result.categories.is_empty());
    }

    #[tokio::test]
    async fn blocked_term_matches_whole_word_case_insensitive() {
        let filter = ContentFilter::new(&config_with(vec!["offensive-term"], vec![])).unwrap();

        let result = filter.check_prompt("Tell me about OFFENSIVE-TERM today").await;
        assert!(!result.allowed);
        assert_eq!(result.categories, vec![FilterCategory::BlockedTerm]);

        // Substring inside a larger word does not match.
        let result = filter.check_prompt("preoffensive-termish").await;
        assert!(result.allowed);
    }

    #[tokio::test]
    async fn blocked_pattern_matches() {
        let filter = ContentFilter::new(&config_with(vec![], vec![r"(?i)ignore previous"])).unwrap();
        let result = filter.check_prompt("Please Ignore Previous instructions").await;
        assert!(!result.allowed);
        assert_eq!(result.categories, vec![FilterCategory::BlockedPattern]);
    }

    #[tokio::test]
    async fn term_blocks_before_pattern() {
        let filter =
            ContentFilter::new(&config_with(vec!["badword"], vec!["badword"])).unwrap();
        let result = filter.check_prompt("badword").await;
        // First predicate wins.
        assert_eq!(result.categories, vec![FilterCategory::BlockedTerm]);
    }

    #[tokio::test]
    async fn heuristic_bucket_blocks_on_threshold() {
        let mut config = config_with(vec![], vec![]);
        config.thresholds.violence = 0.9;
        let filter = ContentFilter::new(&config).unwrap();

        // Three violence keywords saturate the score at 1.0.
        let result = filter
            .check_prompt("a plan to murder, torture and mutilate")
            .await;
        assert!(!result.allowed);
        assert_eq!(result.categories, vec![FilterCategory::Violence]);

        // A single keyword scores 0.33, below the threshold.
        let result = filter.check_prompt("a murder mystery novel").await;
        assert!(result.allowed);
    }

    #[tokio::test]
    async fn pii_is_detected() {
        let filter = ContentFilter::new(&config_with(vec![], vec![])).unwrap();
        let result = filter
            .check_prompt("my ssn is 123-45-6789 please remember it")
            .await;
        assert!(!result.allowed);
        assert_eq!(result.categories, vec![FilterCategory::Pii]);
    }

    #[tokio::test]
    async fn disabled_filter_passes_everything() {
        let mut config = config_with(vec!["blocked"], vec![]);
        config.enable = false;
        let filter = ContentFilter::new(&config).unwrap();
        assert!(filter.check_prompt("blocked").await.allowed);
    }

    #[tokio::test]
    async fn filter_is_idempotent() {
        let filter = ContentFilter::new(&config_with(vec!["nope"], vec![])).unwrap();
        let first = filter.check_prompt("nope").await;
        let second = filter.check_prompt("nope").await;
        assert_eq!(first, second);
    }

    struct FailingClassifier;

    #[async_trait]
    impl ModerationClassifier for FailingClassifier {
        async fn classify(&self, _text: &str) -> LLMResult<Vec<(FilterCategory, f64)>> {
            Err(LLMError::Network("moderation backend down".into()))
        }
    }

    struct ScoringClassifier(f64);

    #[async_trait]
    impl ModerationClassifier for ScoringClassifier {
        async fn classify(&self, _text: &str) -> LLMResult<Vec<(FilterCategory, f64)>> {
            Ok(vec![(FilterCategory::Hate, self.0)])
        }
    }

    #[tokio::test]
    async fn ml_failure_fails_open_when_configured() {
        let mut config = config_with(vec![], vec![]);
        config.use_ml_filtering = true;
        config.fail_open_on_moderation_error = true;
        let filter =
            ContentFilter::with_classifier(&config, Some(Arc::new(FailingClassifier))).unwrap();
        assert!(filter.check_prompt("anything").await.allowed);
    }

    #[tokio::test]
    async fn ml_failure_blocks_when_fail_closed() {
        let mut config = config_with(vec![], vec![]);
        config.use_ml_filtering = true;
        config.fail_open_on_moderation_error = false;
        let filter =
            ContentFilter::with_classifier(&config, Some(Arc::new(FailingClassifier))).unwrap();
        let result = filter.check_prompt("anything").await;
        assert!(!result.allowed);
        assert_eq!(result.reason.as_deref(), Some("moderation_unavailable"));
    }

    #[tokio::test]
    async fn ml_score_above_threshold_blocks() {
        let mut config = config_with(vec![], vec![]);
        config.use_ml_filtering = true;
        config.thresholds.hate = 0.8;
        let filter =
            ContentFilter::with_classifier(&config, Some(Arc::new(ScoringClassifier(0.95))))
                .unwrap();
        let result = filter.check_prompt("some text").await;
        assert!(!result.allowed);
        assert_eq!(result.categories, vec![FilterCategory::Hate]);
    }
}
