//! Contextual Bandit (§4.3).
//!
//! A UCB1-style policy with one arm per `(tenant_id, tier)`. Updates to the same
//! arm are serialized; different tenants (and different arms of the same tenant)
//! proceed independently, using `DashMap`'s per-shard locking the same way the
//! rate limiter in this codebase's lineage stripes per-key state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use sha2::{Digest, Sha256};

use crate::clock::Clock;
use crate::domain::{BanditArmStats, RouterFeatures, Tier};
use crate::kv::KvStore;

/// Below this many total pulls for a tenant, selection is uniform random rather
/// than UCB1-ranked (§4.3).
pub const EXPLORATION_FLOOR: u64 = 30;

/// Flush to the KV store after this many updates to an arm, whichever comes first
/// with the 5s wall-clock trigger (§4.3).
const FLUSH_EVERY_N_UPDATES: u32 = 32;
const FLUSH_INTERVAL_MS: u64 = 5_000;

/// Reward-model constants (§4.3). Fixed, not configuration.
const SUCCESS_WEIGHT: f64 = 0.6;
const LATENCY_PENALTY: f64 = 0.25;
const COST_PENALTY: f64 = 0.15;
const LATENCY_NORMALIZATION_MS: f64 = 5_000.0;
const COST_NORMALIZATION_CEILING: f64 = 1.0;

#[derive(Debug, Clone, Copy)]
pub struct SelectionInfo {
    pub total_pulls: u64,
    pub explored: bool,
}

struct ArmState {
    stats: BanditArmStats,
    updates_since_flush: u32,
    last_flush_ms: u64,
}

impl Default for ArmState {
    fn default() -> Self {
        Self {
            stats: BanditArmStats::default(),
            updates_since_flush: 0,
            last_flush_ms: 0,
        }
    }
}

pub struct Bandit {
    arms: DashMap<(String, Tier), ArmState>,
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    exploration_floor: AtomicU64,
}

impl Bandit {
    pub fn new(kv: Arc<dyn KvStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            arms: DashMap::new(),
            kv,
            clock,
            exploration_floor: AtomicU64::new(EXPLORATION_FLOOR),
        }
    }

    /// Administrative override of the exploration floor; `config.rs` applies
    /// `[bandit].exploration_floor_override` here on load and hot-reload.
    pub fn set_exploration_floor(&self, floor: u64) {
        self.exploration_floor.store(floor, Ordering::Relaxed);
    }

    /// `select(features, tenant_id) -> (tier, expected_value, info)` (§4.3).
    /// `features` is accepted for contract fidelity; this policy's arms are keyed
    /// purely by tenant and tier, not contextualized further by feature values.
    pub fn select(&self, _features: &RouterFeatures, tenant_id: &str) -> (Tier, f64, SelectionInfo) {
        let pulls: Vec<(Tier, u64, f64)> = Tier::ALL
            .iter()
            .map(|&tier| {
                let entry = self.arms.entry((tenant_id.to_string(), tier)).or_default();
                (tier, entry.stats.pulls, entry.stats.mean_reward())
            })
            .collect();

        let total_pulls: u64 = pulls.iter().map(|(_, p, _)| p).sum();

        if let Some((tier, _, mean)) = pulls.iter().find(|(_, p, _)| *p == 0) {
            return (
                *tier,
                *mean,
                SelectionInfo {
                    total_pulls,
                    explored: true,
                },
            );
        }

        if total_pulls < self.exploration_floor.load(Ordering::Relaxed) {
            let time_bucket = self.clock.now_utc().timestamp() as u64 / 10;
            let tier = seeded_uniform_pick(tenant_id, time_bucket, &Tier::ALL);
            let mean = pulls.iter().find(|(t, _, _)| *t == tier).map(|(_, _, m)| *m).unwrap_or(0.0);
            return (
                tier,
                mean,
                SelectionInfo {
                    total_pulls,
                    explored: true,
                },
            );
        }

        let (tier, _, value) = pulls
            .iter()
            .map(|(tier, p, mean)| {
                let ucb = mean + ((2.0 * (total_pulls as f64).ln()) / *p as f64).sqrt();
                (*tier, ucb, *mean)
            })
            .fold(None, |best: Option<(Tier, f64, f64)>, (tier, ucb, mean)| match best {
                None => Some((tier, ucb, mean)),
                // Cheaper tier wins ties, matching the classifier's tie-break rule.
                Some((best_tier, best_ucb, best_mean)) => {
                    if ucb > best_ucb {
                        Some((tier, ucb, mean))
                    } else if (ucb - best_ucb).abs() < 1e-12 && tier < best_tier {
                        Some((tier, ucb, mean))
                    } else {
                        Some((best_tier, best_ucb, best_mean))
                    }
                }
            })
            .expect("Tier::ALL is non-empty");

        (
            tier,
            value,
            SelectionInfo {
                total_pulls,
                explored: false,
            },
        )
    }

    /// `update(tenant_id, tier, reward, cost, failed)` (§4.3). Computes the reward
    /// from raw outcome signals per the reward model, clips to `[0,1]`, and
    /// accumulates into the arm's stats. Flushes to the KV store after
    /// `FLUSH_EVERY_N_UPDATES` updates or `FLUSH_INTERVAL_MS`, whichever is first.
    pub async fn update(&self, tenant_id: &str, tier: Tier, latency_ms: u64, cost: f64, failed: bool) {
        let reward = compute_reward(latency_ms, cost, failed);
        let should_flush = {
            let mut entry = self.arms.entry((tenant_id.to_string(), tier)).or_default();
            entry.stats.pulls += 1;
            entry.stats.cumulative_reward += reward;
            entry.stats.squared_reward += reward * reward;
            entry.updates_since_flush += 1;

            let now = self.clock.now_monotonic_ms();
            let due = entry.updates_since_flush >= FLUSH_EVERY_N_UPDATES
                || now.saturating_sub(entry.last_flush_ms) >= FLUSH_INTERVAL_MS;
            if due {
                entry.updates_since_flush = 0;
                entry.last_flush_ms = now;
            }
            due.then(|| entry.stats)
        };

        if let Some(stats) = should_flush {
            self.flush(tenant_id, tier, &stats).await;
        }
    }

    async fn flush(&self, tenant_id: &str, tier: Tier, stats: &BanditArmStats) {
        let key = format!("router:bandit:{tenant_id}:{tier}");
        let _ = self.kv.hset(&key, "pulls", stats.pulls.to_string()).await;
        let _ = self
            .kv
            .hset(&key, "reward_sum", stats.cumulative_reward.to_string())
            .await;
        let _ = self
            .kv
            .hset(&key, "reward_sq_sum", stats.squared_reward.to_string())
            .await;
    }

    /// Administrative reset: clears all arms for a tenant (§6 `reset_learning`).
    pub fn reset_tenant(&self, tenant_id: &str) {
        self.arms.retain(|(t, _), _| t != tenant_id);
    }

    pub fn arm_stats(&self, tenant_id: &str, tier: Tier) -> BanditArmStats {
        self.arms
            .get(&(tenant_id.to_string(), tier))
            .map(|e| e.stats)
            .unwrap_or_default()
    }
}

fn compute_reward(latency_ms: u64, cost: f64, failed: bool) -> f64 {
    let normalized_latency = (latency_ms as f64 / LATENCY_NORMALIZATION_MS).min(1.0);
    let normalized_cost = (cost / COST_NORMALIZATION_CEILING).min(1.0);
    let success_term = if failed { 0.0 } else { SUCCESS_WEIGHT };
    let reward = success_term - LATENCY_PENALTY * normalized_latency - COST_PENALTY * normalized_cost;
    reward.clamp(0.0, 1.0)
}

/// Deterministic uniform pick over `candidates`, seeded by SHA-256 of
/// `"{tenant_id}:{time_bucket}"` (§4.3). Stable within a 10s time bucket so
/// repeated selections for the same tenant in quick succession agree, without a
/// stateful PRNG.
fn seeded_uniform_pick(tenant_id: &str, time_bucket: u64, candidates: &[Tier]) -> Tier {
    let input = format!("{tenant_id}:{time_bucket}");
    let digest = Sha256::digest(input.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    let value = u64::from_be_bytes(bytes) as f64 / u64::MAX as f64;
    let index = ((value * candidates.len() as f64) as usize).min(candidates.len() - 1);
    candidates[index]
}

/// Duration helper kept alongside the module it governs flush cadence for.
pub fn flush_interval() -> Duration {
    Duration::from_millis(FLUSH_INTERVAL_MS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::domain::UserTier;
    use crate::kv::InMemoryKvStore;

    fn features() -> RouterFeatures {
        RouterFeatures {
            token_count: 10,
            schema_strictness: 0.5,
            domain_flags: vec![],
            novelty_score: 0.5,
            historical_failure_rate: 0.1,
            user_tier: UserTier::Standard,
            time_of_day: 10,
            day_of_week: 1,
            request_complexity: 0.3,
        }
    }

    fn bandit() -> Bandit {
        Bandit::new(Arc::new(InMemoryKvStore::new()), Arc::new(SystemClock::new()))
    }

    #[test]
    fn untried_arms_are_selected_before_ucb_ranking() {
        let b = bandit();
        let (tier, _, info) = b.select(&features(), "t1");
        assert_eq!(tier, Tier::A);
        assert!(info.explored);
    }

    #[tokio::test]
    async fn seeded_exploration_is_reproducible_within_a_time_bucket() {
        let clock = crate::clock::TestClock::new();
        let b = Bandit::new(Arc::new(InMemoryKvStore::new()), clock.clone());
        // Burn through the untried-arm phase so we reach the uniform-random branch.
        for tier in Tier::ALL {
            b.update("t1", tier, 100, 0.1, false).await;
        }
        let (first, _, _) = b.select(&features(), "t1");
        let (second, _, _) = b.select(&features(), "t1");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn concurrent_updates_to_same_arm_lose_none() {
        let b = Arc::new(bandit());
        let mut handles = Vec::new();
        for _ in 0..50 {
            let b = b.clone();
            handles.push(tokio::spawn(async move {
                b.update("t1", Tier::A, 100, 0.1, false).await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(b.arm_stats("t1", Tier::A).pulls, 50);
    }

    #[test]
    fn reward_is_clipped_to_unit_interval() {
        let reward = compute_reward(10_000, 10.0, true);
        assert!((0.0..=1.0).contains(&reward));
        assert_eq!(reward, 0.0);
    }

    #[tokio::test]
    async fn reset_tenant_clears_only_that_tenant() {
        let b = bandit();
        b.update("t1", Tier::A, 100, 0.1, false).await;
        b.update("t2", Tier::A, 100, 0.1, false).await;
        b.reset_tenant("t1");
        assert_eq!(b.arm_stats("t1", Tier::A).pulls, 0);
        assert_eq!(b.arm_stats("t2", Tier::A).pulls, 1);
    }

    #[tokio::test]
    async fn lowering_exploration_floor_ends_uniform_exploration_sooner() {
        let b = bandit();
        b.set_exploration_floor(1);
        for tier in Tier::ALL {
            b.update("t1", tier, 100, 0.1, false).await;
        }
        let (_, _, info) = b.select(&features(), "t1");
        assert!(!info.explored, "with floor=1 and every arm already pulled, selection should rank by UCB1");
    }
}
