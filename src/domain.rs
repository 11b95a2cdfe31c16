//! Shared data model (§3): the types every component passes between each other.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A request as it enters the router. Immutable once received; never mutated
/// after feature extraction.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RequestEnvelope {
    pub tenant_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    pub message: String,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

/// Service tier. Ordered `A < B < C`; A is cheapest/fastest, C most capable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Tier {
    A,
    B,
    C,
}

impl Tier {
    /// The next tier up, or `None` if already at `C`.
    pub fn escalate(self) -> Option<Tier> {
        match self {
            Tier::A => Some(Tier::B),
            Tier::B => Some(Tier::C),
            Tier::C => None,
        }
    }

    /// One tier above this one, clamped at `C` (used for canary tier defaults).
    pub fn one_above_clamped(self) -> Tier {
        self.escalate().unwrap_or(Tier::C)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::A => "A",
            Tier::B => "B",
            Tier::C => "C",
        }
    }

    pub const ALL: [Tier; 3] = [Tier::A, Tier::B, Tier::C];
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User tier, resolved from per-user config falling back to tenant default
/// falling back to "standard" (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UserTier {
    Basic,
    Standard,
    Premium,
    Enterprise,
}

impl Default for UserTier {
    fn default() -> Self {
        UserTier::Standard
    }
}

/// Fixed-shape feature record derived from a request (§3, §4.1).
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RouterFeatures {
    pub token_count: u64,
    pub schema_strictness: f64,
    pub domain_flags: Vec<String>,
    pub novelty_score: f64,
    pub historical_failure_rate: f64,
    pub user_tier: UserTier,
    pub time_of_day: u8,
    pub day_of_week: u8,
    pub request_complexity: f64,
}

impl RouterFeatures {
    /// Neutral default used when tenant-state reads fail (§4.1 failure semantics).
    pub fn neutral_default() -> Self {
        Self {
            token_count: 1,
            schema_strictness: 0.0,
            domain_flags: Vec::new(),
            novelty_score: 1.0,
            historical_failure_rate: 0.1,
            user_tier: UserTier::Standard,
            time_of_day: 0,
            day_of_week: 0,
            request_complexity: 0.0,
        }
    }

    /// Deterministic hash of the nine fields, floats rounded to 6 decimals, used to
    /// prove classifier-fallback determinism (§4.2).
    pub fn stable_hash(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut domain_flags = self.domain_flags.clone();
        domain_flags.sort();
        let canonical = format!(
            "{}|{:.6}|{}|{:.6}|{:.6}|{:?}|{}|{}|{:.6}",
            self.token_count,
            self.schema_strictness,
            domain_flags.join(","),
            self.novelty_score,
            self.historical_failure_rate,
            self.user_tier,
            self.time_of_day,
            self.day_of_week,
            self.request_complexity,
        );
        let digest = Sha256::digest(canonical.as_bytes());
        format!("{digest:x}")
    }
}

/// Why a routing decision landed where it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    EarlyExit,
    ConfidenceLow,
    ComplexityHigh,
    HistoricFailure,
    TenantPolicy,
    Fallback,
    None,
}

/// Result of the Early-Exit / Escalation Policy (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct EscalationDecision {
    pub target_tier: Tier,
    pub should_escalate: bool,
    pub reason_code: ReasonCode,
}

/// Info describing whether/why a canary redirect fired (§4.5).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CanaryInfo {
    pub is_canary: bool,
    pub tier: Tier,
}

/// Emitted exactly once per request by the Router Orchestrator (§3, §4.6).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RoutingDecision {
    pub tier: Tier,
    pub confidence: f64,
    pub decision_time_ms: u64,
    pub features: RouterFeatures,
    pub reason_code: ReasonCode,
    pub canary_info: Option<CanaryInfo>,
    pub escalation_info: Option<EscalationDecision>,
}

/// Per-tenant, per-tier bandit arm statistics (§3). Monotonically nondecreasing
/// under normal operation; reset only via an explicit administrative call.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
pub struct BanditArmStats {
    pub pulls: u64,
    pub cumulative_reward: f64,
    pub squared_reward: f64,
}

impl BanditArmStats {
    pub fn mean_reward(&self) -> f64 {
        if self.pulls == 0 {
            0.0
        } else {
            self.cumulative_reward / self.pulls as f64
        }
    }
}

/// Per-tenant canary configuration (§3). `canary_tier` defaults to baseline+1,
/// clamped at C, per the Open Question resolution in SPEC_FULL §10.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(default)]
pub struct CanaryConfig {
    pub canary_fraction: f64,
    pub quality_floor: f64,
    pub min_samples: u64,
    pub evaluation_window_s: u64,
    pub rollback_threshold: f64,
    pub canary_tier: Option<Tier>,
}

impl Default for CanaryConfig {
    fn default() -> Self {
        Self {
            canary_fraction: 0.0,
            quality_floor: 0.5,
            min_samples: 20,
            evaluation_window_s: 3600,
            rollback_threshold: 0.5,
            canary_tier: None,
        }
    }
}

/// Kind of an outbound message on the realtime pipeline (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Intermediate,
    Final,
    Heartbeat,
    Resume,
}

/// Point-in-time snapshot of one connection's queue bookkeeping (§3), exposed to
/// administrative statistics views.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionState {
    pub connection_id: String,
    pub tenant_id: String,
    /// Logical queue length: in-memory messages plus whatever has spilled to
    /// the KV store. Bounded by `max_queue_size` (§4.7).
    pub queue_size: usize,
    pub max_queue_size: usize,
    pub drop_threshold: usize,
    pub last_sent_seq: u64,
    pub last_acked_seq: u64,
    pub slow: bool,
    pub dropped_count: u64,
    pub sent_count: u64,
}

/// A message queued for delivery to one connection (§3).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutboundMessage {
    pub message_id: String,
    pub connection_id: String,
    pub tenant_id: String,
    pub kind: MessageKind,
    pub payload: Value,
    pub priority: i32,
    pub sequence_number: u64,
    pub is_final: bool,
    pub enqueued_at: DateTime<Utc>,
}
