//! Metrics Registry (§6, §9d).
//!
//! Wraps a `metrics-exporter-prometheus` recorder/exporter pair behind an
//! explicit, constructor-injected handle rather than relying on the process-global
//! recorder directly — the Router Orchestrator and Session Manager each hold a
//! clone of [`MetricsRegistry`], matching this codebase's preference for explicit
//! dependencies over implicit singletons.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::domain::Tier;

#[derive(Clone)]
pub struct MetricsRegistry {
    handle: PrometheusHandle,
}

impl MetricsRegistry {
    /// Installs the global `metrics` recorder once at startup and returns a
    /// handle for rendering `/metrics` and for injection into components. If a
    /// recorder is already installed (only possible in tests, which may
    /// construct more than one `MetricsRegistry` in the same process), falls
    /// back to a standalone handle rather than erroring.
    pub fn install() -> anyhow::Result<Self> {
        match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => Ok(Self { handle }),
            Err(_) => {
                let (_, handle) = PrometheusBuilder::new()
                    .build()
                    .map_err(|e| anyhow::anyhow!("failed to build metrics handle: {e}"))?;
                Ok(Self { handle })
            }
        }
    }

    /// Text-format render for the `/metrics` endpoint.
    pub fn render(&self) -> String {
        self.handle.render()
    }

    pub fn record_decision_latency(&self, tenant_id: &str, tier: Tier, latency_ms: f64) {
        metrics::histogram!(
            "router_decision_latency_ms",
            "tenant" => tenant_id.to_string(),
            "tier" => tier.as_str()
        )
        .record(latency_ms);
    }

    pub fn record_tier_distribution(&self, tenant_id: &str, tier: Tier) {
        metrics::counter!(
            "tier_distribution",
            "tenant" => tenant_id.to_string(),
            "tier" => tier.as_str()
        )
        .increment(1);
    }

    pub fn record_fallback(&self, tenant_id: &str) {
        metrics::counter!("router_fallbacks_total", "tenant" => tenant_id.to_string()).increment(1);
    }

    pub fn set_misroute_rate(&self, tenant_id: &str, rate: f64) {
        metrics::gauge!("router_misroute_rate", "tenant" => tenant_id.to_string()).set(rate);
    }

    pub fn set_expected_vs_actual_cost(&self, tenant_id: &str, ratio: f64) {
        metrics::gauge!("expected_vs_actual_cost", "tenant" => tenant_id.to_string()).set(ratio);
    }

    pub fn set_expected_vs_actual_latency(&self, tenant_id: &str, ratio: f64) {
        metrics::gauge!("expected_vs_actual_latency", "tenant" => tenant_id.to_string()).set(ratio);
    }

    pub fn set_active_connections(&self, tenant_id: &str, count: f64) {
        metrics::gauge!("ws_active_connections", "tenant" => tenant_id.to_string()).set(count);
    }

    pub fn record_message_sent(&self, tenant_id: &str, kind: &str) {
        metrics::counter!(
            "ws_messages_sent_total",
            "tenant" => tenant_id.to_string(),
            "kind" => kind.to_string()
        )
        .increment(1);
    }

    pub fn record_backpressure_drop(&self, tenant_id: &str, reason: &str) {
        metrics::counter!(
            "ws_backpressure_drops_total",
            "tenant" => tenant_id.to_string(),
            "reason" => reason.to_string()
        )
        .increment(1);
    }

    pub fn record_send_error(&self, tenant_id: &str) {
        metrics::counter!("ws_send_errors_total", "tenant" => tenant_id.to_string()).increment(1);
    }

    pub fn set_queue_size(&self, tenant_id: &str, connection_id: &str, size: f64) {
        metrics::gauge!(
            "ws_queue_size",
            "tenant" => tenant_id.to_string(),
            "connection" => connection_id.to_string()
        )
        .set(size);
    }
}

/// Drift-severity ladder for the administrative statistics view (§4.8). Mirrors
/// the percentage bands used elsewhere in the platform for cost/latency drift.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftSeverity {
    None,
    Warning,
    Critical,
}

const COST_WARNING_PCT: f64 = 10.0;
const COST_CRITICAL_PCT: f64 = 25.0;
const LATENCY_WARNING_PCT: f64 = 20.0;
const LATENCY_CRITICAL_PCT: f64 = 50.0;

pub fn cost_drift_severity(ratio: f64) -> DriftSeverity {
    severity_for(ratio, COST_WARNING_PCT, COST_CRITICAL_PCT)
}

pub fn latency_drift_severity(ratio: f64) -> DriftSeverity {
    severity_for(ratio, LATENCY_WARNING_PCT, LATENCY_CRITICAL_PCT)
}

fn severity_for(ratio: f64, warning_pct: f64, critical_pct: f64) -> DriftSeverity {
    let drift_pct = ((ratio - 1.0) * 100.0).abs();
    if drift_pct >= critical_pct {
        DriftSeverity::Critical
    } else if drift_pct >= warning_pct {
        DriftSeverity::Warning
    } else {
        DriftSeverity::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_drift_below_warning_is_none() {
        assert_eq!(cost_drift_severity(1.05), DriftSeverity::None);
    }

    #[test]
    fn cost_drift_at_critical_threshold() {
        assert_eq!(cost_drift_severity(1.25), DriftSeverity::Critical);
    }

    #[test]
    fn latency_drift_warning_band() {
        assert_eq!(latency_drift_severity(1.20), DriftSeverity::Warning);
        assert_eq!(latency_drift_severity(0.80), DriftSeverity::Warning);
    }
}
