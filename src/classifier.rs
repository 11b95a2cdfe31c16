//! Calibrated Classifier (§4.2).
//!
//! The primary path is a per-tenant calibrated model, opaque to this crate and not
//! bundled with it — model loading is out of scope (§1). `classify` therefore
//! always finds "no model loaded" and falls through to the deterministic fallback
//! below. The fallback is the seam a real model would plug into later: both
//! implement the same [`ClassifierModel`] trait, so wiring one in is a constructor
//! change, not a call-site change.

use crate::domain::{ReasonCode, RouterFeatures, Tier};

const WEIGHT_COMPLEXITY: f64 = 0.30;
const WEIGHT_TOKENS: f64 = 0.25;
const WEIGHT_STRICTNESS: f64 = 0.20;
const WEIGHT_NOVELTY: f64 = 0.15;
const WEIGHT_FAILURE_RATE: f64 = 0.10;

const TIER_A_BOUNDARY: f64 = 0.33;
const TIER_B_BOUNDARY: f64 = 0.66;
const TIE_EPSILON: f64 = 1e-9;

/// Model-confidence floor below which the deterministic fallback takes over (§4.2).
const MODEL_CONFIDENCE_FLOOR: f64 = 0.5;

/// Escalation-recommendation threshold on the fallback's own confidence (§4.2).
const ESCALATE_CONFIDENCE_THRESHOLD: f64 = 0.6;

/// A classification result before reason-code attribution is layered on by the
/// Early-Exit/Escalation Policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    pub tier: Tier,
    pub confidence: f64,
    pub should_escalate: bool,
}

/// Seam for a real calibrated model. The deterministic fallback below implements
/// this trait too, so `Classifier::classify` can defer to whichever is loaded
/// without callers caring which one fired.
pub trait ClassifierModel: Send + Sync {
    /// Returns `None` when no model is loaded, or when the model is loaded but its
    /// own confidence in this particular classification is below
    /// `MODEL_CONFIDENCE_FLOOR` — both cases fall through to the deterministic path.
    fn try_classify(&self, features: &RouterFeatures, tenant_id: &str) -> Option<Classification>;
}

/// No calibrated model is bundled with this implementation (§1); `classify` always
/// reaches the deterministic fallback through this no-op primary path.
pub struct NoModelLoaded;

impl ClassifierModel for NoModelLoaded {
    fn try_classify(&self, _features: &RouterFeatures, _tenant_id: &str) -> Option<Classification> {
        None
    }
}

pub struct Classifier<M: ClassifierModel = NoModelLoaded> {
    model: M,
}

impl Classifier<NoModelLoaded> {
    pub fn new() -> Self {
        Self { model: NoModelLoaded }
    }
}

impl Default for Classifier<NoModelLoaded> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: ClassifierModel> Classifier<M> {
    pub fn with_model(model: M) -> Self {
        Self { model }
    }

    /// `classify(features, tenant_id) -> (tier, confidence, should_escalate)` (§4.2).
    pub fn classify(&self, features: &RouterFeatures, tenant_id: &str) -> Classification {
        if let Some(result) = self.model.try_classify(features, tenant_id) {
            if result.confidence >= MODEL_CONFIDENCE_FLOOR {
                return result;
            }
        }
        deterministic_fallback(features)
    }
}

/// The deterministic fallback (§4.2, steps 1-5). Bit-for-bit reproducible across
/// invocations and processes for identical input features.
pub fn deterministic_fallback(features: &RouterFeatures) -> Classification {
    let score = WEIGHT_COMPLEXITY * features.request_complexity
        + WEIGHT_TOKENS * (features.token_count as f64 / 1000.0).min(1.0)
        + WEIGHT_STRICTNESS * (1.0 - features.schema_strictness)
        + WEIGHT_NOVELTY * features.novelty_score
        + WEIGHT_FAILURE_RATE * features.historical_failure_rate;

    let (tier, nearest_boundary) = tier_for_score(score);
    let confidence = (1.0 - (score - nearest_boundary).abs().min(0.5) * 2.0).clamp(0.0, 1.0);
    let should_escalate = confidence < ESCALATE_CONFIDENCE_THRESHOLD;

    Classification {
        tier,
        confidence,
        should_escalate,
    }
}

/// Maps a score to a tier per the `0.33`/`0.66` boundaries, resolving exact ties
/// toward the cheaper tier, and returns the boundary nearest the score (used for
/// the confidence computation).
fn tier_for_score(score: f64) -> (Tier, f64) {
    if (score - TIER_A_BOUNDARY).abs() < TIE_EPSILON {
        return (Tier::A, TIER_A_BOUNDARY);
    }
    if (score - TIER_B_BOUNDARY).abs() < TIE_EPSILON {
        return (Tier::B, TIER_B_BOUNDARY);
    }
    if score < TIER_A_BOUNDARY {
        (Tier::A, TIER_A_BOUNDARY)
    } else if score < TIER_B_BOUNDARY {
        (Tier::B, nearest_of(score, TIER_A_BOUNDARY, TIER_B_BOUNDARY))
    } else {
        (Tier::C, TIER_B_BOUNDARY)
    }
}

fn nearest_of(score: f64, a: f64, b: f64) -> f64 {
    if (score - a).abs() <= (score - b).abs() {
        a
    } else {
        b
    }
}

/// A feature-hash proving determinism (§4.2): identical features always yield an
/// identical hash, and by extension an identical fallback result.
pub fn feature_hash(features: &RouterFeatures) -> String {
    features.stable_hash()
}

/// Attributes a [`ReasonCode`] purely from the fallback's own signals, used when no
/// escalation-policy override applies.
pub fn reason_code_for(classification: &Classification) -> ReasonCode {
    if classification.should_escalate {
        ReasonCode::ConfidenceLow
    } else {
        ReasonCode::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::UserTier;

    fn features(request_complexity: f64, token_count: u64, schema_strictness: f64, novelty_score: f64, historical_failure_rate: f64) -> RouterFeatures {
        RouterFeatures {
            token_count,
            schema_strictness,
            domain_flags: vec![],
            novelty_score,
            historical_failure_rate,
            user_tier: UserTier::Standard,
            time_of_day: 12,
            day_of_week: 2,
            request_complexity,
        }
    }

    #[test]
    fn fallback_is_deterministic_across_calls() {
        let f = features(0.5, 200, 0.3, 0.4, 0.2);
        let a = deterministic_fallback(&f);
        let b = deterministic_fallback(&f);
        assert_eq!(a.tier, b.tier);
        assert_eq!(a.confidence, b.confidence);
        assert_eq!(a.should_escalate, b.should_escalate);
        assert_eq!(feature_hash(&f), feature_hash(&f));
    }

    #[test]
    fn low_complexity_low_everything_lands_in_tier_a() {
        let f = features(0.0, 1, 1.0, 0.0, 0.0);
        let result = deterministic_fallback(&f);
        assert_eq!(result.tier, Tier::A);
    }

    #[test]
    fn high_complexity_high_everything_lands_in_tier_c() {
        let f = features(1.0, 1000, 0.0, 1.0, 1.0);
        let result = deterministic_fallback(&f);
        assert_eq!(result.tier, Tier::C);
    }

    #[test]
    fn exact_tie_at_033_resolves_to_cheaper_tier() {
        // score == 0.33 exactly: 0.30*c + 0.25*t + 0.20*(1-s) + 0.15*n + 0.10*h = 0.33
        // Choose complexity=1.0 contributing 0.30, tokens=0, strictness=1.0 (term 0),
        // novelty=0.2 contributing 0.03, failure_rate=0 -> total 0.33.
        let f = features(1.0, 0, 1.0, 0.2, 0.0);
        let score = 0.30 * f.request_complexity
            + 0.25 * (f.token_count as f64 / 1000.0).min(1.0)
            + 0.20 * (1.0 - f.schema_strictness)
            + 0.15 * f.novelty_score
            + 0.10 * f.historical_failure_rate;
        assert!((score - 0.33).abs() < 1e-9);
        let result = deterministic_fallback(&f);
        assert_eq!(result.tier, Tier::A);
    }

    #[test]
    fn classifier_with_no_model_always_reaches_fallback() {
        let classifier = Classifier::new();
        let f = features(0.9, 900, 0.0, 0.9, 0.9);
        let via_classifier = classifier.classify(&f, "t1");
        let via_fallback = deterministic_fallback(&f);
        assert_eq!(via_classifier.tier, via_fallback.tier);
        assert_eq!(via_classifier.confidence, via_fallback.confidence);
    }
}
