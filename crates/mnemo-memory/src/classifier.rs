//! Pair classifiers used by consolidation.
//!
//! [`RuleBasedClassifier`] is the always-available default. A remote or
//! model-backed classifier can be put in front of it with
//! [`ChainedClassifier`], which falls back only when the primary reports
//! itself unavailable.

use crate::search::tokenize;
use async_trait::async_trait;
use mnemo_types::association::AssociationType;
use mnemo_types::block::Block;
use mnemo_types::classifier::PairClassifier;
use mnemo_types::consolidation::{PairVerdict, Verdict};
use mnemo_types::error::{MnemoError, MnemoResult};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::warn;

const NEGATION_MARKERS: &[&str] = &[
    "not", "no", "never", "cannot", "without", "false", "wrong", "incorrect", "neither", "nor",
];

const CAUSAL_MARKERS: &[&str] = &[
    "because", "therefore", "caused", "causes", "due", "result", "resulted", "so", "fixed",
    "fixes", "led", "consequently", "hence",
];

/// Thresholds of the rule-based classifier.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleThresholds {
    pub duplicate_cosine: f32,
    pub duplicate_jaccard: f32,
    pub contradiction_cosine: f32,
    pub causal_cosine: f32,
    pub temporal_cosine: f32,
    pub temporal_max_gap: u64,
    pub semantic_cosine: f32,
    pub semantic_jaccard: f32,
}

impl Default for RuleThresholds {
    fn default() -> Self {
        Self {
            duplicate_cosine: 0.97,
            duplicate_jaccard: 0.9,
            contradiction_cosine: 0.75,
            causal_cosine: 0.5,
            temporal_cosine: 0.4,
            temporal_max_gap: 3,
            semantic_cosine: 0.55,
            semantic_jaccard: 0.3,
        }
    }
}

/// Heuristic classifier over embeddings, keywords, and a few lexical markers.
#[derive(Debug, Clone, Default)]
pub struct RuleBasedClassifier {
    thresholds: RuleThresholds,
}

impl RuleBasedClassifier {
    pub fn new(thresholds: RuleThresholds) -> Self {
        Self { thresholds }
    }

    /// Synchronous core, shared with callers that do not need the trait.
    pub fn evaluate(&self, a: &Block, b: &Block, cosine: f32) -> PairVerdict {
        let t = &self.thresholds;
        let ka = features(a);
        let kb = features(b);
        let jaccard = jaccard(&ka, &kb);

        if cosine >= t.duplicate_cosine
            && (normalize_content(&a.content) == normalize_content(&b.content)
                || jaccard >= t.duplicate_jaccard)
        {
            return PairVerdict {
                verdict: Verdict::Duplicate,
                connection_type: None,
                strength: cosine.clamp(0.0, 1.0),
                justification: format!("near-identical (cosine {cosine:.2}, jaccard {jaccard:.2})"),
            };
        }

        let ta = tokenize(&a.content);
        let tb = tokenize(&b.content);
        if cosine >= t.contradiction_cosine && has_marker(&ta, NEGATION_MARKERS) != has_marker(&tb, NEGATION_MARKERS) {
            return connected(
                AssociationType::Contradiction,
                cosine,
                format!("same topic with opposite polarity (cosine {cosine:.2})"),
            );
        }

        let later = if a.index > b.index { &ta } else { &tb };
        if cosine >= t.causal_cosine && has_marker(later, CAUSAL_MARKERS) {
            return connected(
                AssociationType::Causal,
                0.8 * cosine + 0.2 * jaccard,
                format!("later block states a cause or effect (cosine {cosine:.2})"),
            );
        }

        if a.root == b.root
            && a.index.abs_diff(b.index) <= t.temporal_max_gap
            && cosine >= t.temporal_cosine
        {
            return connected(
                AssociationType::Temporal,
                cosine,
                format!(
                    "adjacent in thread {} ({} apart)",
                    a.root,
                    a.index.abs_diff(b.index)
                ),
            );
        }

        if cosine >= t.semantic_cosine || jaccard >= t.semantic_jaccard {
            return connected(
                AssociationType::Semantic,
                0.7 * cosine + 0.3 * jaccard,
                format!("related topic (cosine {cosine:.2}, jaccard {jaccard:.2})"),
            );
        }

        PairVerdict::unrelated(format!(
            "no relationship found (cosine {cosine:.2}, jaccard {jaccard:.2})"
        ))
    }
}

#[async_trait]
impl PairClassifier for RuleBasedClassifier {
    async fn classify(&self, a: &Block, b: &Block, cosine: f32) -> MnemoResult<PairVerdict> {
        Ok(self.evaluate(a, b, cosine))
    }

    fn name(&self) -> &str {
        "rule_based"
    }
}

/// Try `primary`; on `ClassifierUnavailable` use `fallback`. Other errors propagate.
pub struct ChainedClassifier {
    primary: Arc<dyn PairClassifier>,
    fallback: Arc<dyn PairClassifier>,
}

impl ChainedClassifier {
    pub fn new(primary: Arc<dyn PairClassifier>, fallback: Arc<dyn PairClassifier>) -> Self {
        Self { primary, fallback }
    }

    /// `primary` backed by the rule-based default.
    pub fn with_rule_fallback(primary: Arc<dyn PairClassifier>) -> Self {
        Self::new(primary, Arc::new(RuleBasedClassifier::default()))
    }
}

#[async_trait]
impl PairClassifier for ChainedClassifier {
    async fn classify(&self, a: &Block, b: &Block, cosine: f32) -> MnemoResult<PairVerdict> {
        match self.primary.classify(a, b, cosine).await {
            Err(MnemoError::ClassifierUnavailable(reason)) => {
                warn!(
                    primary = self.primary.name(),
                    fallback = self.fallback.name(),
                    reason = %reason,
                    "Primary classifier unavailable, falling back"
                );
                self.fallback.classify(a, b, cosine).await
            }
            other => other,
        }
    }

    fn name(&self) -> &str {
        self.primary.name()
    }
}

fn connected(kind: AssociationType, strength: f32, justification: String) -> PairVerdict {
    PairVerdict {
        verdict: Verdict::Connected,
        connection_type: Some(kind),
        strength: strength.clamp(0.0, 1.0),
        justification,
    }
}

/// Keywords, or content tokens when a block has none.
fn features(block: &Block) -> BTreeSet<String> {
    if block.keywords.is_empty() {
        tokenize(&block.content)
    } else {
        block.keywords.iter().map(|k| k.to_lowercase()).collect()
    }
}

fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f32 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f32 / union as f32
}

fn has_marker(tokens: &BTreeSet<String>, markers: &[&str]) -> bool {
    markers.iter().any(|m| tokens.contains(*m))
}

fn normalize_content(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}
