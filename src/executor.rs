//! The Tier Executor external collaborator (§6).
//!
//! Runs the actual workload for a chosen tier. This crate never implements a real
//! executor — model inference is explicitly out of scope (§1) — but it defines the
//! contract callers depend on, and a mock used by tests and by the admin `calibrate`
//! pathway until a real executor is wired in.

use async_trait::async_trait;

use crate::domain::{RequestEnvelope, Tier};

/// Outcome of running one request against one tier.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub latency_ms: u64,
    pub quality: f64,
    pub cost: f64,
}

/// Runs a request against a chosen tier. Implementations own whatever transport
/// (HTTP, gRPC, in-process model call) is appropriate; this crate treats it as
/// opaque per §1/§6.
#[async_trait]
pub trait TierExecutor: Send + Sync {
    async fn execute(&self, tier: Tier, envelope: &RequestEnvelope) -> ExecutionOutcome;
}

/// Deterministic executor for tests: returns a canned outcome regardless of input,
/// optionally varied by tier so escalation/reconciliation paths are exercisable.
pub struct MockTierExecutor {
    pub outcome_for: fn(Tier) -> ExecutionOutcome,
}

impl MockTierExecutor {
    pub fn always_succeeds() -> Self {
        Self {
            outcome_for: |_| ExecutionOutcome {
                success: true,
                latency_ms: 50,
                quality: 0.95,
                cost: 0.01,
            },
        }
    }
}

#[async_trait]
impl TierExecutor for MockTierExecutor {
    async fn execute(&self, tier: Tier, _envelope: &RequestEnvelope) -> ExecutionOutcome {
        (self.outcome_for)(tier)
    }
}
