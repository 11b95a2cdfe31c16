//! Canary Manager (§4.5).
//!
//! Per-tenant probability-controlled shadow/override of the chosen tier. Selection
//! is a stable hash of `(tenant_id, user_id)`, so the same user is consistently
//! in or out of canary for a given `canary_fraction`. A rolling window of outcomes
//! drives automatic rollback when quality degrades.

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use sha2::{Digest, Sha256};

use crate::clock::Clock;
use crate::domain::{CanaryConfig, CanaryInfo, Tier};

struct Outcome {
    at_ms: u64,
    is_success: bool,
}

struct TenantCanaryState {
    config: CanaryConfig,
    window: VecDeque<Outcome>,
}

impl TenantCanaryState {
    fn new(config: CanaryConfig) -> Self {
        Self {
            config,
            window: VecDeque::new(),
        }
    }
}

pub struct CanaryManager {
    state: DashMap<String, TenantCanaryState>,
    clock: Arc<dyn Clock>,
}

impl CanaryManager {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: DashMap::new(),
            clock,
        }
    }

    /// `maybe_redirect(tenant_id, user_id, baseline_tier) -> (is_canary, tier, info)`
    /// (§4.5).
    pub fn maybe_redirect(&self, tenant_id: &str, user_id: Option<&str>, baseline_tier: Tier) -> CanaryInfo {
        let entry = self
            .state
            .entry(tenant_id.to_string())
            .or_insert_with(|| TenantCanaryState::new(CanaryConfig::default()));
        let config = entry.config;

        if config.canary_fraction <= 0.0 {
            return CanaryInfo {
                is_canary: false,
                tier: baseline_tier,
            };
        }

        let roll = stable_unit_interval(tenant_id, user_id.unwrap_or(""));
        let is_canary = roll < config.canary_fraction;
        let tier = if is_canary {
            config.canary_tier.unwrap_or_else(|| baseline_tier.one_above_clamped())
        } else {
            baseline_tier
        };

        CanaryInfo { is_canary, tier }
    }

    /// `record_outcome(tenant_id, user_id, tier, success, latency_ms, quality)`
    /// (§4.5). `user_id`/`latency_ms` are accepted for contract fidelity; only
    /// `success` and `quality` (against `quality_floor`) drive the rolling window.
    pub fn record_outcome(&self, tenant_id: &str, _user_id: Option<&str>, success: bool, quality: f64) {
        let mut entry = self
            .state
            .entry(tenant_id.to_string())
            .or_insert_with(|| TenantCanaryState::new(CanaryConfig::default()));
        let quality_floor = entry.config.quality_floor;
        let is_success = success && quality >= quality_floor;
        let now = self.clock.now_monotonic_ms();
        entry.window.push_back(Outcome { at_ms: now, is_success });

        let window_start = now.saturating_sub(entry.config.evaluation_window_s * 1_000);
        while entry.window.front().is_some_and(|o| o.at_ms < window_start) {
            entry.window.pop_front();
        }

        if entry.window.len() as u64 >= entry.config.min_samples {
            let successes = entry.window.iter().filter(|o| o.is_success).count() as f64;
            let rate = successes / entry.window.len() as f64;
            if rate < entry.config.rollback_threshold {
                entry.config.canary_fraction = 0.0;
            }
        }
    }

    /// Administrative `set_canary(tenant_id, config)` (§6).
    pub fn set_config(&self, tenant_id: &str, config: CanaryConfig) {
        self.state.insert(tenant_id.to_string(), TenantCanaryState::new(config));
    }

    pub fn config_for(&self, tenant_id: &str) -> CanaryConfig {
        self.state
            .get(tenant_id)
            .map(|e| e.config)
            .unwrap_or_default()
    }
}

/// Stable hash of `(tenant_id, user_id)` mapped into `[0, 1)`, mirroring the
/// bandit's deterministic seeding approach (§4.3, §4.5).
fn stable_unit_interval(tenant_id: &str, user_id: &str) -> f64 {
    let input = format!("{tenant_id}:{user_id}");
    let digest = Sha256::digest(input.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes) as f64 / u64::MAX as f64
}
