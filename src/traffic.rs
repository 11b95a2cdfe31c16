//! In-memory routing-decision log exposed through the admin API (§9d).
//!
//! [`TrafficLog`] is a fixed-capacity ring-buffer: once full, the oldest entry
//! is evicted to make room for the newest. This gives a bounded, O(1) memory
//! footprint regardless of request volume.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::{ReasonCode, Tier};

/// Fixed-capacity ring-buffer of recent [`TrafficEntry`] records.
///
/// Safe to share across threads via `Arc<TrafficLog>`. [`push`][Self::push] uses
/// a non-blocking `try_lock` so it never delays request handling; in the
/// unlikely event of lock contention the entry is silently dropped.
pub struct TrafficLog {
    capacity: usize,
    entries: Mutex<VecDeque<TrafficEntry>>,
}

impl TrafficLog {
    /// Create a new log with the given capacity.
    ///
    /// `capacity` is the maximum number of entries retained. Older entries are
    /// silently dropped once the buffer is full.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Record a completed routing decision.
    ///
    /// This is a best-effort, non-blocking operation: if the mutex is contended
    /// the entry is dropped rather than blocking the request path.
    pub fn push(&self, entry: TrafficEntry) {
        if let Ok(mut entries) = self.entries.try_lock() {
            if entries.len() == self.capacity {
                entries.pop_front();
            }
            entries.push_back(entry);
        }
    }

    /// Return up to `limit` recent entries, newest first.
    pub async fn recent(&self, limit: usize) -> Vec<TrafficEntry> {
        let entries = self.entries.lock().await;
        entries.iter().rev().take(limit).cloned().collect()
    }

    /// Compute aggregate statistics over all buffered entries.
    pub async fn stats(&self) -> TrafficStats {
        let entries = self.entries.lock().await;
        let total = entries.len();
        let avg_decision_time_ms = if total == 0 {
            0.0
        } else {
            entries.iter().map(|e| e.decision_time_ms as f64).sum::<f64>() / total as f64
        };

        let error_count = entries.iter().filter(|e| !e.success).count();
        let canary_count = entries.iter().filter(|e| e.canary).count();

        let mut tier_counts: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
        for entry in entries.iter() {
            *tier_counts.entry(entry.tier.as_str().to_string()).or_default() += 1;
        }

        TrafficStats {
            total_requests: total,
            error_count,
            canary_count,
            avg_decision_time_ms,
            tier_counts,
        }
    }
}

/// A single routed-request record (§9d).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficEntry {
    /// Unique request ID.
    pub id: String,
    /// Timestamp of the request.
    pub timestamp: DateTime<Utc>,
    /// Tenant the request was routed for.
    pub tenant_id: String,
    /// Tier that handled this request.
    pub tier: Tier,
    /// Why the Router Orchestrator chose this tier.
    pub reason_code: ReasonCode,
    /// Whether this decision was a canary redirect.
    pub canary: bool,
    /// Time taken to produce the routing decision, in milliseconds.
    pub decision_time_ms: u64,
    /// Whether the downstream tier execution succeeded.
    pub success: bool,
    /// Error description when `success` is `false`.
    pub error: Option<String>,
}

impl TrafficEntry {
    pub fn new(tenant_id: String, tier: Tier, reason_code: ReasonCode, decision_time_ms: u64, success: bool) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            tenant_id,
            tier,
            reason_code,
            canary: false,
            decision_time_ms,
            success,
            error: None,
        }
    }

    /// Mark this entry as a canary redirect.
    pub fn mark_canary(mut self) -> Self {
        self.canary = true;
        self
    }

    /// Attach an error description for failed requests.
    pub fn with_error(mut self, err: &str) -> Self {
        self.error = Some(err.to_string());
        self
    }
}

/// Aggregate statistics derived from all buffered [`TrafficEntry`] records.
#[derive(Debug, Serialize)]
pub struct TrafficStats {
    pub total_requests: usize,
    /// Number of requests whose downstream execution failed.
    pub error_count: usize,
    /// Number of requests served by a canary redirect.
    pub canary_count: usize,
    pub avg_decision_time_ms: f64,
    pub tier_counts: std::collections::HashMap<String, usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_entry(tier: Tier, decision_time_ms: u64) -> TrafficEntry {
        TrafficEntry::new("t1".into(), tier, ReasonCode::None, decision_time_ms, true)
    }

    #[tokio::test]
    async fn push_and_retrieve_single_entry() {
        let log = TrafficLog::new(10);
        log.push(make_entry(Tier::A, 42));

        let recent = log.recent(10).await;
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].tier, Tier::A);
        assert_eq!(recent[0].decision_time_ms, 42);
    }

    #[tokio::test]
    async fn recent_returns_entries_newest_first() {
        let log = TrafficLog::new(10);
        log.push(make_entry(Tier::A, 1));
        log.push(make_entry(Tier::B, 2));
        log.push(make_entry(Tier::C, 3));

        let recent = log.recent(10).await;
        assert_eq!(recent[0].tier, Tier::C);
        assert_eq!(recent[1].tier, Tier::B);
        assert_eq!(recent[2].tier, Tier::A);
    }

    #[tokio::test]
    async fn recent_limits_result_count() {
        let log = TrafficLog::new(20);
        for i in 0..10u64 {
            log.push(make_entry(Tier::A, i));
        }
        let recent = log.recent(3).await;
        assert_eq!(recent.len(), 3);
    }

    #[tokio::test]
    async fn oldest_entry_evicted_when_capacity_exceeded() {
        let log = TrafficLog::new(3);
        log.push(make_entry(Tier::A, 1));
        log.push(make_entry(Tier::B, 2));
        log.push(make_entry(Tier::C, 3));
        log.push(make_entry(Tier::A, 4));

        let all = log.recent(100).await;
        assert_eq!(all.len(), 3);
        assert_eq!(all.iter().filter(|e| e.tier == Tier::A).count(), 1);
    }

    #[tokio::test]
    async fn stats_on_empty_log() {
        let log = TrafficLog::new(10);
        let stats = log.stats().await;
        assert_eq!(stats.total_requests, 0);
        assert_eq!(stats.avg_decision_time_ms, 0.0);
        assert!(stats.tier_counts.is_empty());
    }

    #[tokio::test]
    async fn stats_averages_decision_time_correctly() {
        let log = TrafficLog::new(10);
        log.push(make_entry(Tier::A, 100));
        log.push(make_entry(Tier::A, 200));
        log.push(make_entry(Tier::B, 300));

        let stats = log.stats().await;
        assert_eq!(stats.total_requests, 3);
        assert!((stats.avg_decision_time_ms - 200.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn stats_counts_requests_per_tier() {
        let log = TrafficLog::new(10);
        log.push(make_entry(Tier::A, 10));
        log.push(make_entry(Tier::A, 20));
        log.push(make_entry(Tier::B, 30));

        let stats = log.stats().await;
        assert_eq!(stats.tier_counts["A"], 2);
        assert_eq!(stats.tier_counts["B"], 1);
    }

    #[tokio::test]
    async fn stats_counts_canary_entries_separately_from_errors() {
        let log = TrafficLog::new(10);
        log.push(make_entry(Tier::A, 10).mark_canary());
        log.push(make_entry(Tier::A, 10));

        let stats = log.stats().await;
        assert_eq!(stats.canary_count, 1);
        assert_eq!(stats.error_count, 0);
    }

    #[test]
    fn entry_has_unique_ids() {
        let a = make_entry(Tier::A, 1);
        let b = make_entry(Tier::A, 1);
        assert_ne!(a.id, b.id, "every entry must have a unique UUID");
    }

    #[test]
    fn entry_records_success_flag() {
        let ok = TrafficEntry::new("t".into(), Tier::A, ReasonCode::None, 0, true);
        let err = TrafficEntry::new("t".into(), Tier::A, ReasonCode::None, 0, false);
        assert!(ok.success);
        assert!(!err.success);
    }
}
