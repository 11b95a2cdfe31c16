//! Configuration for the router and realtime pipeline (§9a).
//!
//! Config is loaded once at startup from a TOML file and validated before the
//! server opens any ports. Invalid configs are rejected with a clear error
//! rather than silently falling back to defaults. Every tunable named by the
//! component specs — exploration floor, backpressure thresholds, session
//! cadence, KV/HTTP timeouts — has a global default here, overridable per
//! tenant via the `[tenants.<id>]` table.
//!
//! # Example
//! ```toml
//! [gateway]
//! client_port = 8080
//! admin_port = 8081
//!
//! [queue]
//! max_queue_size = 100
//! drop_threshold = 80
//!
//! [tenants.acme]
//! force_escalate = false
//! canary_fraction = 0.1
//! canary_tier = "C"
//! ```

use std::{collections::HashMap, path::Path};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::domain::{CanaryConfig, Tier};
use crate::escalation::TenantEscalationPolicy;
use crate::queue::BackpressurePolicy;

/// Core gateway settings: ports, auth, rate limiting, and the external-collaborator
/// timeouts referenced in §6.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    /// Port for the tenant-facing API (default: 8080).
    #[serde(default = "defaults::client_port")]
    pub client_port: u16,

    /// Port for the admin API (default: 8081).
    #[serde(default = "defaults::admin_port")]
    pub admin_port: u16,

    /// Number of recent routing decisions to keep in the in-memory traffic log.
    #[serde(default = "defaults::traffic_log_capacity")]
    pub traffic_log_capacity: usize,

    /// Log level override (also controlled by `RUST_LOG`).
    #[serde(default)]
    pub log_level: Option<String>,

    /// Maximum requests per minute per client IP on the client port. Leave unset
    /// to disable rate limiting.
    #[serde(default)]
    pub rate_limit_rpm: Option<u32>,

    /// Environment variable whose value is the Bearer token required for all
    /// admin API requests. Leave unset to disable admin authentication.
    #[serde(default)]
    pub admin_token_env: Option<String>,

    /// Hard per-call timeout for KV Store operations (§5, §6).
    #[serde(default = "defaults::kv_timeout_ms")]
    pub kv_timeout_ms: u64,

    /// Hard per-call timeout for Tier Executor calls (§5).
    #[serde(default = "defaults::tier_executor_timeout_ms")]
    pub tier_executor_timeout_ms: u64,
}

/// Session Manager cadence tunables (§4.8).
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    pub pump_cadence_ms: u64,
    pub messages_per_tick: usize,
    pub heartbeat_silence_s: u64,
    pub stale_timeout_s: u64,
    pub send_deadline_s: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            pump_cadence_ms: 15,
            messages_per_tick: 10,
            heartbeat_silence_s: 30,
            stale_timeout_s: 60,
            send_deadline_s: 5,
        }
    }
}

/// Global backpressure defaults (§4.7), overridable per tenant.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueDefaults {
    pub max_queue_size: usize,
    pub drop_threshold: usize,
    pub max_memory_size: usize,
    pub max_queue_age_s: u64,
    pub slow_client_threshold_ms: u64,
}

impl Default for QueueDefaults {
    fn default() -> Self {
        Self {
            max_queue_size: crate::queue::DEFAULT_MAX_QUEUE_SIZE,
            drop_threshold: crate::queue::DEFAULT_DROP_THRESHOLD,
            max_memory_size: crate::queue::DEFAULT_MAX_MEMORY_SIZE,
            max_queue_age_s: crate::queue::DEFAULT_MAX_QUEUE_AGE.as_secs(),
            slow_client_threshold_ms: crate::queue::DEFAULT_SLOW_CLIENT_THRESHOLD_MS,
        }
    }
}

impl From<QueueDefaults> for BackpressurePolicy {
    fn from(d: QueueDefaults) -> Self {
        Self {
            max_queue_size: d.max_queue_size,
            drop_threshold: d.drop_threshold,
            max_memory_size: d.max_memory_size,
            max_queue_age: std::time::Duration::from_secs(d.max_queue_age_s),
            slow_client_threshold_ms: d.slow_client_threshold_ms,
        }
    }
}

/// Global bandit default (§4.3). `exploration_floor` is fixed as a named constant
/// on [`crate::bandit`] rather than here per SPEC_FULL §10 ("fixed in §4.1 ...
/// exposed as named constants ... not configuration") — the analogous reasoning
/// applies to the bandit's own constants, so this struct is a placeholder seam
/// for a future per-tenant override rather than a currently-read value.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct BanditDefaults {
    pub exploration_floor_override: Option<u64>,
}

/// Per-tenant overlay: escalation-policy flags, canary config, and a
/// backpressure-policy override. Absent fields fall back to the matching global
/// default (§9a).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TenantOverlay {
    pub forbid_early_exit: bool,
    pub force_escalate: bool,
    pub max_tokens_a: Option<u64>,
    pub canary_fraction: Option<f64>,
    pub canary_quality_floor: Option<f64>,
    pub canary_min_samples: Option<u64>,
    pub canary_evaluation_window_s: Option<u64>,
    pub canary_rollback_threshold: Option<f64>,
    pub canary_tier: Option<Tier>,
    pub queue: Option<QueueDefaults>,
}

impl TenantOverlay {
    pub fn escalation_policy(&self) -> TenantEscalationPolicy {
        TenantEscalationPolicy {
            forbid_early_exit: self.forbid_early_exit,
            force_escalate: self.force_escalate,
            max_tokens_a: self.max_tokens_a,
        }
    }

    /// Builds a [`CanaryConfig`] only when at least one canary field is set;
    /// tenants with no canary overlay keep the Canary Manager's own default
    /// (canary disabled) rather than this producing a spurious override.
    pub fn canary_config(&self) -> Option<CanaryConfig> {
        let any_set = self.canary_fraction.is_some()
            || self.canary_quality_floor.is_some()
            || self.canary_min_samples.is_some()
            || self.canary_evaluation_window_s.is_some()
            || self.canary_rollback_threshold.is_some()
            || self.canary_tier.is_some();
        if !any_set {
            return None;
        }
        let default = CanaryConfig::default();
        Some(CanaryConfig {
            canary_fraction: self.canary_fraction.unwrap_or(default.canary_fraction),
            quality_floor: self.canary_quality_floor.unwrap_or(default.quality_floor),
            min_samples: self.canary_min_samples.unwrap_or(default.min_samples),
            evaluation_window_s: self.canary_evaluation_window_s.unwrap_or(default.evaluation_window_s),
            rollback_threshold: self.canary_rollback_threshold.unwrap_or(default.rollback_threshold),
            canary_tier: self.canary_tier,
        })
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub queue: QueueDefaults,

    #[serde(default)]
    pub bandit: BanditDefaults,

    /// Per-tenant overlays, keyed by `tenant_id`. Unconfigured tenants run on
    /// global defaults throughout.
    #[serde(default)]
    pub tenants: HashMap<String, TenantOverlay>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            client_port: defaults::client_port(),
            admin_port: defaults::admin_port(),
            traffic_log_capacity: defaults::traffic_log_capacity(),
            log_level: None,
            rate_limit_rpm: None,
            admin_token_env: None,
            kv_timeout_ms: defaults::kv_timeout_ms(),
            tier_executor_timeout_ms: defaults::tier_executor_timeout_ms(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let config: Self = toml::from_str(&content).context("parsing config TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.gateway.client_port != self.gateway.admin_port,
            "gateway.client_port and gateway.admin_port must differ"
        );
        anyhow::ensure!(
            self.queue.drop_threshold < self.queue.max_queue_size,
            "queue.drop_threshold ({}) must be less than queue.max_queue_size ({})",
            self.queue.drop_threshold,
            self.queue.max_queue_size
        );
        anyhow::ensure!(self.queue.max_memory_size > 0, "queue.max_memory_size must be positive");

        for (tenant_id, overlay) in &self.tenants {
            if let Some(q) = &overlay.queue {
                anyhow::ensure!(
                    q.drop_threshold < q.max_queue_size,
                    "tenants.{tenant_id}.queue: drop_threshold ({}) must be less than max_queue_size ({})",
                    q.drop_threshold,
                    q.max_queue_size
                );
                anyhow::ensure!(
                    q.max_memory_size > 0,
                    "tenants.{tenant_id}.queue.max_memory_size must be positive"
                );
            }
            if let Some(fraction) = overlay.canary_fraction {
                anyhow::ensure!(
                    (0.0..=1.0).contains(&fraction),
                    "tenants.{tenant_id}.canary_fraction ({fraction}) must be within [0, 1]"
                );
            }
            if let Some(floor) = overlay.canary_quality_floor {
                anyhow::ensure!(
                    (0.0..=1.0).contains(&floor),
                    "tenants.{tenant_id}.canary_quality_floor ({floor}) must be within [0, 1]"
                );
            }
        }

        Ok(())
    }

    pub fn backpressure_policy_for(&self, tenant_id: &str) -> BackpressurePolicy {
        self.tenants
            .get(tenant_id)
            .and_then(|t| t.queue)
            .unwrap_or(self.queue)
            .into()
    }

    pub fn escalation_policy_for(&self, tenant_id: &str) -> TenantEscalationPolicy {
        self.tenants
            .get(tenant_id)
            .map(|t| t.escalation_policy())
            .unwrap_or_default()
    }

    pub fn canary_config_for(&self, tenant_id: &str) -> Option<CanaryConfig> {
        self.tenants.get(tenant_id).and_then(|t| t.canary_config())
    }
}

mod defaults {
    pub fn client_port() -> u16 {
        8080
    }
    pub fn admin_port() -> u16 {
        8081
    }
    pub fn traffic_log_capacity() -> usize {
        500
    }
    pub fn kv_timeout_ms() -> u64 {
        200
    }
    pub fn tier_executor_timeout_ms() -> u64 {
        10_000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> Config {
        toml::from_str(
            r#"
            [gateway]
            client_port = 9000
            admin_port = 9001
            "#,
        )
        .expect("minimal config should parse")
    }

    #[test]
    fn gateway_defaults_are_applied_when_section_is_absent() {
        let config: Config = toml::from_str("").expect("empty config should parse");
        assert_eq!(config.gateway.client_port, 8080);
        assert_eq!(config.gateway.admin_port, 8081);
        assert_eq!(config.queue.max_queue_size, crate::queue::DEFAULT_MAX_QUEUE_SIZE);
    }

    #[test]
    fn validation_rejects_equal_client_and_admin_ports() {
        let mut config = minimal_config();
        config.gateway.admin_port = config.gateway.client_port;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_drop_threshold_at_or_above_max_queue_size() {
        let mut config = minimal_config();
        config.queue.max_queue_size = 50;
        config.queue.drop_threshold = 50;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_out_of_range_tenant_canary_fraction() {
        let mut config = minimal_config();
        config.tenants.insert(
            "acme".into(),
            TenantOverlay {
                canary_fraction: Some(1.5),
                ..Default::default()
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn tenant_overlay_inherits_global_queue_defaults_when_unset() {
        let config = minimal_config();
        let policy = config.backpressure_policy_for("unconfigured-tenant");
        assert_eq!(policy.max_queue_size, config.queue.max_queue_size);
    }

    #[test]
    fn tenant_overlay_escalation_policy_round_trips_flags() {
        let mut config = minimal_config();
        config.tenants.insert(
            "acme".into(),
            TenantOverlay {
                force_escalate: true,
                ..Default::default()
            },
        );
        let policy = config.escalation_policy_for("acme");
        assert!(policy.force_escalate);
    }

    #[test]
    fn tenant_without_canary_fields_set_has_no_canary_override() {
        let config = minimal_config();
        assert!(config.canary_config_for("unconfigured-tenant").is_none());
    }

    #[test]
    fn tenant_canary_override_fills_unset_fields_from_canary_config_default() {
        let mut config = minimal_config();
        config.tenants.insert(
            "acme".into(),
            TenantOverlay {
                canary_fraction: Some(0.2),
                ..Default::default()
            },
        );
        let canary = config.canary_config_for("acme").unwrap();
        assert_eq!(canary.canary_fraction, 0.2);
        assert_eq!(canary.min_samples, CanaryConfig::default().min_samples);
    }
}
