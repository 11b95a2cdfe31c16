//! Early-Exit / Escalation Policy (§4.4).
//!
//! Gates trivial requests to the cheapest tier and promotes risky ones. Early-exit
//! and escalation are mutually exclusive; early-exit is evaluated first.

use crate::domain::{EscalationDecision, ReasonCode, RouterFeatures, Tier};

/// Early-exit requires `schema_strictness >= 0.90`, `request_complexity <= 0.15`,
/// and `token_count <= tenant_max_tokens_A` (default 100, §4.4).
const EARLY_EXIT_STRICTNESS_FLOOR: f64 = 0.90;
const EARLY_EXIT_COMPLEXITY_CEILING: f64 = 0.15;
pub const DEFAULT_MAX_TOKENS_A: u64 = 100;

/// Escalation triggers (§4.4).
const ESCALATE_CONFIDENCE_FLOOR: f64 = 0.6;
const ESCALATE_COMPLEXITY_FLOOR: f64 = 0.8;
const ESCALATE_FAILURE_RATE_FLOOR: f64 = 0.3;

/// Per-tenant policy knobs referenced by the gate (§4.4: "tenant policy does not
/// forbid early-exit", "explicit tenant policy" triggers escalation).
#[derive(Debug, Clone, Copy, Default)]
pub struct TenantEscalationPolicy {
    pub forbid_early_exit: bool,
    pub force_escalate: bool,
    pub max_tokens_a: Option<u64>,
}

pub struct EarlyExitEscalation;

impl EarlyExitEscalation {
    /// `decide(features, candidate_tier, confidence, tenant_id) -> EscalationDecision`
    /// (§4.4). `tenant_id` is accepted for signature fidelity with the spec
    /// contract; tenant-specific behavior is carried entirely by `policy`, which
    /// the caller resolves from tenant config before invoking this gate.
    pub fn decide(
        &self,
        features: &RouterFeatures,
        candidate_tier: Tier,
        confidence: f64,
        policy: &TenantEscalationPolicy,
    ) -> EscalationDecision {
        let max_tokens_a = policy.max_tokens_a.unwrap_or(DEFAULT_MAX_TOKENS_A);

        let early_exit_eligible = !policy.forbid_early_exit
            && features.schema_strictness >= EARLY_EXIT_STRICTNESS_FLOOR
            && features.request_complexity <= EARLY_EXIT_COMPLEXITY_CEILING
            && features.token_count <= max_tokens_a;

        if early_exit_eligible {
            return EscalationDecision {
                target_tier: Tier::A,
                should_escalate: false,
                reason_code: ReasonCode::EarlyExit,
            };
        }

        let (should_escalate, reason_code) = if policy.force_escalate {
            (true, ReasonCode::TenantPolicy)
        } else if features.historical_failure_rate >= ESCALATE_FAILURE_RATE_FLOOR {
            (true, ReasonCode::HistoricFailure)
        } else if features.request_complexity >= ESCALATE_COMPLEXITY_FLOOR {
            (true, ReasonCode::ComplexityHigh)
        } else if confidence < ESCALATE_CONFIDENCE_FLOOR {
            (true, ReasonCode::ConfidenceLow)
        } else {
            (false, ReasonCode::None)
        };

        let target_tier = if should_escalate {
            candidate_tier.escalate().unwrap_or(Tier::C)
        } else {
            candidate_tier
        };

        EscalationDecision {
            target_tier,
            should_escalate,
            reason_code,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::UserTier;

    fn features(schema_strictness: f64, request_complexity: f64, token_count: u64, historical_failure_rate: f64) -> RouterFeatures {
        RouterFeatures {
            token_count,
            schema_strictness,
            domain_flags: vec![],
            novelty_score: 0.5,
            historical_failure_rate,
            user_tier: UserTier::Standard,
            time_of_day: 9,
            day_of_week: 0,
            request_complexity,
        }
    }

    #[test]
    fn s1_early_exit_on_trivial_high_strictness_request() {
        let f = features(1.0, 0.05, 2, 0.0);
        let decision = EarlyExitEscalation.decide(&f, Tier::B, 0.95, &TenantEscalationPolicy::default());
        assert_eq!(decision.target_tier, Tier::A);
        assert!(!decision.should_escalate);
        assert_eq!(decision.reason_code, ReasonCode::EarlyExit);
    }

    #[test]
    fn early_exit_blocked_by_tenant_policy() {
        let f = features(1.0, 0.05, 2, 0.0);
        let policy = TenantEscalationPolicy {
            forbid_early_exit: true,
            ..Default::default()
        };
        let decision = EarlyExitEscalation.decide(&f, Tier::B, 0.95, &policy);
        assert_ne!(decision.reason_code, ReasonCode::EarlyExit);
    }

    #[test]
    fn high_complexity_escalates_one_tier() {
        let f = features(0.1, 0.9, 500, 0.0);
        let decision = EarlyExitEscalation.decide(&f, Tier::A, 0.9, &TenantEscalationPolicy::default());
        assert!(decision.should_escalate);
        assert_eq!(decision.target_tier, Tier::B);
        assert_eq!(decision.reason_code, ReasonCode::ComplexityHigh);
    }

    #[test]
    fn tier_c_never_escalates_further() {
        let f = features(0.1, 0.95, 500, 0.9);
        let decision = EarlyExitEscalation.decide(&f, Tier::C, 0.2, &TenantEscalationPolicy::default());
        assert_eq!(decision.target_tier, Tier::C);
    }

    #[test]
    fn low_confidence_triggers_escalation() {
        let f = features(0.2, 0.3, 100, 0.0);
        let decision = EarlyExitEscalation.decide(&f, Tier::A, 0.4, &TenantEscalationPolicy::default());
        assert!(decision.should_escalate);
        assert_eq!(decision.reason_code, ReasonCode::ConfidenceLow);
    }

    #[test]
    fn early_exit_and_escalation_are_mutually_exclusive() {
        // Would satisfy escalation thresholds on failure rate, but also clears every
        // early-exit gate: early-exit must win.
        let f = features(0.95, 0.1, 5, 0.5);
        let decision = EarlyExitEscalation.decide(&f, Tier::A, 0.9, &TenantEscalationPolicy::default());
        assert_eq!(decision.reason_code, ReasonCode::EarlyExit);
        assert!(!decision.should_escalate);
    }
}
