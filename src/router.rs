//! Router Orchestrator (§4.6) — the brain of the platform.
//!
//! Composes the Feature Extractor, Classifier, Bandit, Early-Exit/Escalation
//! Policy, and Canary Manager into a single `route(envelope) -> RoutingDecision`
//! call, then fans outcome feedback back out to the Bandit and Canary Manager via
//! `record_outcome`. Subcomponent failures never escape this boundary: anything
//! that goes wrong collapses to the fixed `Fallback` decision.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::bandit::Bandit;
use crate::canary::CanaryManager;
use crate::classifier::Classifier;
use crate::clock::Clock;
use crate::domain::{ReasonCode, RequestEnvelope, RoutingDecision, Tier};
use crate::escalation::{EarlyExitEscalation, TenantEscalationPolicy};
use crate::features::FeatureExtractor;
use crate::metrics::MetricsRegistry;

/// Overall deadline for a single `route` call (§5); exceeding it yields the
/// fallback decision rather than a slow but "correct" one.
const ROUTE_DEADLINE: Duration = Duration::from_millis(300);

/// Confidences within this margin of each other are treated as a tie, broken by
/// preferring the higher tier (§4.6 step 3).
const RECONCILE_TIE_MARGIN: f64 = 0.1;

const FALLBACK_TIER: Tier = Tier::B;
const FALLBACK_CONFIDENCE: f64 = 0.5;

/// Bounds the trailing window behind the misroute-rate and expected-vs-actual
/// drift gauges (§4.8, §10): a fixed-size ring rather than a time window, since
/// the spec only names "trailing window" without a duration, mirroring how the
/// admin traffic log is a bounded ring buffer rather than time-bounded.
const OUTCOME_WINDOW_CAPACITY: usize = 200;

/// Per-tenant rolling state feeding `router_misroute_rate`, `expected_vs_actual_cost`,
/// and `expected_vs_actual_latency` (§10). `last_*_ratio` caches the most recently
/// computed drift ratios for administrative reads between outcomes.
struct TenantOutcomeStats {
    misroutes: VecDeque<bool>,
    costs: VecDeque<f64>,
    latencies: VecDeque<f64>,
    last_cost_ratio: f64,
    last_latency_ratio: f64,
}

impl Default for TenantOutcomeStats {
    fn default() -> Self {
        Self {
            misroutes: VecDeque::new(),
            costs: VecDeque::new(),
            latencies: VecDeque::new(),
            last_cost_ratio: 1.0,
            last_latency_ratio: 1.0,
        }
    }
}

fn push_bounded<T>(window: &mut VecDeque<T>, value: T) {
    window.push_back(value);
    if window.len() > OUTCOME_WINDOW_CAPACITY {
        window.pop_front();
    }
}

fn mean(window: &VecDeque<f64>) -> Option<f64> {
    if window.is_empty() {
        None
    } else {
        Some(window.iter().sum::<f64>() / window.len() as f64)
    }
}

/// The orchestrator's own default decision (§4.6 failure semantics, §7).
fn fallback_decision(features: crate::domain::RouterFeatures) -> RoutingDecision {
    RoutingDecision {
        tier: FALLBACK_TIER,
        confidence: FALLBACK_CONFIDENCE,
        decision_time_ms: 0,
        features,
        reason_code: ReasonCode::Fallback,
        canary_info: None,
        escalation_info: None,
    }
}

/// Owns the routing subcomponents (§3 ownership rule: "the Router Orchestrator
/// exclusively owns its subcomponents").
pub struct RouterOrchestrator {
    features: FeatureExtractor,
    classifier: Classifier,
    bandit: Bandit,
    escalation: EarlyExitEscalation,
    canary: CanaryManager,
    metrics: MetricsRegistry,
    clock: Arc<dyn Clock>,
    tenant_policies: DashMap<String, TenantEscalationPolicy>,
    outcomes: DashMap<String, TenantOutcomeStats>,
}

impl RouterOrchestrator {
    pub fn new(
        features: FeatureExtractor,
        bandit: Bandit,
        canary: CanaryManager,
        metrics: MetricsRegistry,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            features,
            classifier: Classifier::new(),
            bandit,
            escalation: EarlyExitEscalation,
            canary,
            metrics,
            clock,
            tenant_policies: DashMap::new(),
            outcomes: DashMap::new(),
        }
    }

    /// Administrative override of a tenant's escalation policy; `config.rs`
    /// populates this from the live config on load and hot-reload.
    pub fn set_tenant_policy(&self, tenant_id: &str, policy: TenantEscalationPolicy) {
        self.tenant_policies.insert(tenant_id.to_string(), policy);
    }

    fn policy_for(&self, tenant_id: &str) -> TenantEscalationPolicy {
        self.tenant_policies.get(tenant_id).map(|e| *e).unwrap_or_default()
    }

    pub fn bandit(&self) -> &Bandit {
        &self.bandit
    }

    pub fn canary(&self) -> &CanaryManager {
        &self.canary
    }

    /// `(misroute_rate, expected_vs_actual_cost, expected_vs_actual_latency)` for
    /// the administrative statistics view (§9b `get_statistics`, §10). Absent any
    /// recorded outcomes for the tenant, reports `(0.0, 1.0, 1.0)`.
    pub fn outcome_stats(&self, tenant_id: &str) -> (f64, f64, f64) {
        match self.outcomes.get(tenant_id) {
            Some(entry) if !entry.misroutes.is_empty() => {
                let misroute_rate =
                    entry.misroutes.iter().filter(|m| **m).count() as f64 / entry.misroutes.len() as f64;
                (misroute_rate, entry.last_cost_ratio, entry.last_latency_ratio)
            }
            _ => (0.0, 1.0, 1.0),
        }
    }

    /// `route(envelope) -> RoutingDecision` (§4.6). Bounded by [`ROUTE_DEADLINE`];
    /// a timeout or any subcomponent failure collapses to the fallback decision.
    #[tracing::instrument(skip(self, envelope), fields(tenant_id = %envelope.tenant_id, tier = tracing::field::Empty))]
    pub async fn route(&self, envelope: &RequestEnvelope) -> RoutingDecision {
        let start_ms = self.clock.now_monotonic_ms();
        let decision = match tokio::time::timeout(ROUTE_DEADLINE, self.route_inner(envelope)).await {
            Ok(decision) => decision,
            Err(_) => {
                tracing::warn!(tenant_id = %envelope.tenant_id, "routing deadline exceeded, returning fallback decision");
                fallback_decision(crate::domain::RouterFeatures::neutral_default())
            }
        };

        let decision_time_ms = self.clock.now_monotonic_ms().saturating_sub(start_ms);
        let decision = RoutingDecision {
            decision_time_ms,
            ..decision
        };

        tracing::Span::current().record("tier", decision.tier.as_str());
        self.metrics
            .record_decision_latency(&envelope.tenant_id, decision.tier, decision_time_ms as f64);
        self.metrics.record_tier_distribution(&envelope.tenant_id, decision.tier);
        if decision.reason_code == ReasonCode::Fallback {
            self.metrics.record_fallback(&envelope.tenant_id);
        }

        decision
    }

    async fn route_inner(&self, envelope: &RequestEnvelope) -> RoutingDecision {
        // Step 1: feature extraction.
        let features = self.features.extract(envelope).await;

        // Step 2: classifier and bandit run in parallel.
        let (classification, (bandit_tier, bandit_value, _selection_info)) = tokio::join!(
            async { self.classifier.classify(&features, &envelope.tenant_id) },
            async { self.bandit.select(&features, &envelope.tenant_id) }
        );

        // Step 3: escalation policy, then reconciliation with the bandit's proposal.
        let policy = self.policy_for(&envelope.tenant_id);
        let escalation = self.escalation.decide(
            &features,
            classification.tier,
            classification.confidence,
            &policy,
        );

        let (reconciled_tier, reconciled_confidence, reason_code) = if policy.force_escalate
            || escalation.reason_code == ReasonCode::EarlyExit
        {
            // Early exit bypasses bandit exploration entirely: a high-confidence
            // trivial request routes to the cheapest tier regardless of what the
            // bandit has learned for this tenant.
            (escalation.target_tier, classification.confidence, escalation.reason_code)
        } else {
            reconcile(
                escalation.target_tier,
                classification.confidence,
                bandit_tier,
                bandit_value,
                escalation.reason_code,
            )
        };

        // Step 4: canary override.
        let canary_info = self.canary.maybe_redirect(
            &envelope.tenant_id,
            envelope.user_id.as_deref(),
            reconciled_tier,
        );
        let final_tier = if canary_info.is_canary {
            canary_info.tier
        } else {
            reconciled_tier
        };

        RoutingDecision {
            tier: final_tier,
            confidence: reconciled_confidence,
            decision_time_ms: 0,
            features,
            reason_code,
            canary_info: Some(canary_info),
            escalation_info: Some(escalation),
        }
    }

    /// `record_outcome(decision, success, latency_ms, quality, cost)` (§4.6): fans
    /// out to the Bandit and Canary Manager, then folds the outcome into the
    /// per-tenant misroute-rate and expected-vs-actual drift gauges (§10). Must
    /// be called by the caller after the decided tier actually ran.
    pub async fn record_outcome(
        &self,
        decision: &RoutingDecision,
        tenant_id: &str,
        user_id: Option<&str>,
        success: bool,
        latency_ms: u64,
        quality: f64,
        cost: f64,
    ) {
        self.bandit.update(tenant_id, decision.tier, latency_ms, cost, !success).await;
        self.canary.record_outcome(tenant_id, user_id, success, quality);

        // Misroute definition resolved in §10: success=false OR quality below the
        // tenant's quality_floor, regardless of what drove the routing decision.
        let quality_floor = self.canary.config_for(tenant_id).quality_floor;
        let is_misroute = !success || quality < quality_floor;

        let (misroute_rate, cost_ratio, latency_ratio) = {
            let mut entry = self.outcomes.entry(tenant_id.to_string()).or_default();

            push_bounded(&mut entry.misroutes, is_misroute);
            let misroute_rate =
                entry.misroutes.iter().filter(|m| **m).count() as f64 / entry.misroutes.len() as f64;

            let cost_ratio = mean(&entry.costs).map(|baseline| if baseline > 0.0 { cost / baseline } else { 1.0 }).unwrap_or(1.0);
            push_bounded(&mut entry.costs, cost);

            let latency_ratio = mean(&entry.latencies)
                .map(|baseline| if baseline > 0.0 { latency_ms as f64 / baseline } else { 1.0 })
                .unwrap_or(1.0);
            push_bounded(&mut entry.latencies, latency_ms as f64);

            entry.last_cost_ratio = cost_ratio;
            entry.last_latency_ratio = latency_ratio;
            (misroute_rate, cost_ratio, latency_ratio)
        };

        self.metrics.set_misroute_rate(tenant_id, misroute_rate);
        self.metrics.set_expected_vs_actual_cost(tenant_id, cost_ratio);
        self.metrics.set_expected_vs_actual_latency(tenant_id, latency_ratio);
    }
}

/// Reconciles the escalation-gated classifier proposal with the bandit's
/// proposal (§4.6 step 3). The bandit has no notion of "confidence" of its
/// own; its mean reward (bounded to `[0, 1]` by the reward model) stands in
/// for one here, since both are unit-interval scores the tie margin can
/// compare directly.
fn reconcile(
    classifier_tier: Tier,
    classifier_confidence: f64,
    bandit_tier: Tier,
    bandit_confidence: f64,
    classifier_reason: ReasonCode,
) -> (Tier, f64, ReasonCode) {
    if classifier_tier == bandit_tier {
        return (classifier_tier, classifier_confidence, classifier_reason);
    }

    if (classifier_confidence - bandit_confidence).abs() < RECONCILE_TIE_MARGIN {
        if classifier_tier > bandit_tier {
            (classifier_tier, classifier_confidence, classifier_reason)
        } else {
            (bandit_tier, bandit_confidence, classifier_reason)
        }
    } else if classifier_confidence > bandit_confidence {
        (classifier_tier, classifier_confidence, classifier_reason)
    } else {
        (bandit_tier, bandit_confidence, classifier_reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::kv::InMemoryKvStore;

    fn orchestrator() -> RouterOrchestrator {
        let kv: Arc<dyn crate::kv::KvStore> = Arc::new(InMemoryKvStore::new());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        RouterOrchestrator::new(
            FeatureExtractor::new(kv.clone(), clock.clone()),
            Bandit::new(kv.clone(), clock.clone()),
            CanaryManager::new(clock.clone()),
            MetricsRegistry::install().unwrap(),
            clock,
        )
    }

    fn envelope(message: &str) -> RequestEnvelope {
        RequestEnvelope {
            tenant_id: "t1".to_string(),
            user_id: Some("u1".to_string()),
            message: message.to_string(),
            metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn route_returns_a_decision_with_populated_features() {
        let orchestrator = orchestrator();
        let decision = orchestrator.route(&envelope("hello there")).await;
        assert!(decision.features.token_count > 0);
    }

    #[tokio::test]
    async fn trivial_strict_request_early_exits_to_tier_a() {
        let orchestrator = orchestrator();
        let mut env = envelope("ok");
        env.metadata.insert("schema".to_string(), serde_json::json!({}));
        env.metadata.insert("json".to_string(), serde_json::json!({}));
        env.metadata.insert("validation".to_string(), serde_json::json!({}));
        env.metadata.insert("constraints".to_string(), serde_json::json!({}));
        let decision = orchestrator.route(&env).await;
        assert_eq!(decision.tier, Tier::A);
        assert_eq!(decision.escalation_info.unwrap().reason_code, ReasonCode::EarlyExit);
    }

    #[tokio::test]
    async fn early_exit_is_not_overridden_by_a_bandit_that_favors_a_pricier_tier() {
        let orchestrator = orchestrator();
        // Train the bandit to strongly prefer tier C for this tenant.
        for _ in 0..50 {
            orchestrator.bandit().update("t1", Tier::C, 10, 0.0, false).await;
        }
        for tier in [Tier::A, Tier::B] {
            orchestrator.bandit().update("t1", tier, 5_000, 1.0, true).await;
        }

        let mut env = envelope("ok");
        env.metadata.insert("schema".to_string(), serde_json::json!({}));
        env.metadata.insert("json".to_string(), serde_json::json!({}));
        env.metadata.insert("validation".to_string(), serde_json::json!({}));
        env.metadata.insert("constraints".to_string(), serde_json::json!({}));

        let decision = orchestrator.route(&env).await;
        assert_eq!(decision.tier, Tier::A, "early exit must bypass bandit exploration entirely");
        assert_eq!(decision.reason_code, ReasonCode::EarlyExit);
    }

    #[tokio::test]
    async fn forced_tenant_escalation_overrides_reconciliation() {
        let orchestrator = orchestrator();
        orchestrator.set_tenant_policy(
            "t1",
            TenantEscalationPolicy {
                force_escalate: true,
                ..Default::default()
            },
        );
        let decision = orchestrator.route(&envelope("hello")).await;
        assert_eq!(decision.reason_code, ReasonCode::TenantPolicy);
    }

    #[tokio::test]
    async fn record_outcome_updates_bandit_stats() {
        let orchestrator = orchestrator();
        let decision = orchestrator.route(&envelope("hello")).await;
        orchestrator
            .record_outcome(&decision, "t1", Some("u1"), true, 100, 0.9, 0.01)
            .await;
        assert_eq!(orchestrator.bandit().arm_stats("t1", decision.tier).pulls, 1);
    }

    #[tokio::test]
    async fn misroute_rate_counts_failures_and_sub_floor_quality() {
        let orchestrator = orchestrator();
        let decision = orchestrator.route(&envelope("hello")).await;

        // Two clean successes, one outright failure, one low-quality "success".
        orchestrator.record_outcome(&decision, "t1", Some("u1"), true, 100, 0.95, 0.01).await;
        orchestrator.record_outcome(&decision, "t1", Some("u1"), true, 100, 0.95, 0.01).await;
        orchestrator.record_outcome(&decision, "t1", Some("u1"), false, 100, 0.95, 0.01).await;
        orchestrator.record_outcome(&decision, "t1", Some("u1"), true, 100, 0.1, 0.01).await;

        let (misroute_rate, _, _) = orchestrator.outcome_stats("t1");
        assert!((misroute_rate - 0.5).abs() < 1e-9, "2 of 4 outcomes were misroutes, got {misroute_rate}");
    }

    #[tokio::test]
    async fn expected_vs_actual_cost_reports_unity_for_a_cold_tenant() {
        let orchestrator = orchestrator();
        let decision = orchestrator.route(&envelope("hello")).await;
        orchestrator.record_outcome(&decision, "t1", Some("u1"), true, 100, 0.9, 0.02).await;
        let (_, cost_ratio, latency_ratio) = orchestrator.outcome_stats("t1");
        assert_eq!(cost_ratio, 1.0, "first outcome has no baseline to compare against");
        assert_eq!(latency_ratio, 1.0);
    }

    #[tokio::test]
    async fn expected_vs_actual_cost_tracks_deviation_from_the_rolling_baseline() {
        let orchestrator = orchestrator();
        let decision = orchestrator.route(&envelope("hello")).await;
        for _ in 0..5 {
            orchestrator.record_outcome(&decision, "t1", Some("u1"), true, 100, 0.9, 0.01).await;
        }
        // Baseline is now 0.01; this outcome costs double that.
        orchestrator.record_outcome(&decision, "t1", Some("u1"), true, 100, 0.9, 0.02).await;
        let (_, cost_ratio, _) = orchestrator.outcome_stats("t1");
        assert!((cost_ratio - 2.0).abs() < 1e-9, "expected a 2x cost ratio, got {cost_ratio}");
    }

    #[test]
    fn reconcile_picks_higher_tier_on_near_tie() {
        let (tier, _, _) = reconcile(Tier::A, 0.7, Tier::B, 0.72, ReasonCode::None);
        assert_eq!(tier, Tier::B);
    }

    #[test]
    fn reconcile_picks_higher_confidence_outside_tie_margin() {
        let (tier, _, _) = reconcile(Tier::A, 0.9, Tier::C, 0.3, ReasonCode::None);
        assert_eq!(tier, Tier::A);
    }
}
