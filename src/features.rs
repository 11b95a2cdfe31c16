//! Feature Extractor (§4.1).
//!
//! Deterministically derives a fixed-shape [`RouterFeatures`] from a request plus
//! bounded reads of tenant state. Pure with respect to its caller: it reads tenant
//! state but never writes it — callers that want novelty tracking to reflect this
//! message call [`FeatureExtractor::record_message`] separately, after extraction.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, Timelike};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::clock::Clock;
use crate::domain::{RequestEnvelope, RouterFeatures, UserTier};
use crate::kv::{KvError, KvStore};

/// Feature cache TTL (§4.1): "≤ 300 s".
pub const FEATURE_CACHE_TTL: Duration = Duration::from_secs(300);

/// Maximum history entries considered for novelty scoring (§4.1): "last N (≤ 50)".
const NOVELTY_HISTORY_WINDOW: isize = 50;

/// Default historical failure rate when no gauge is recorded (§4.1).
const DEFAULT_FAILURE_RATE: f64 = 0.1;

/// Keyword vocabularies for domain-flag matching (§4.1). Case-insensitive substring
/// match against the message; a message may set more than one flag.
const DOMAIN_VOCAB: &[(&str, &[&str])] = &[
    ("customer_support", &["help", "support", "issue", "problem", "trouble"]),
    ("sales", &["buy", "purchase", "order", "price", "quote"]),
    ("technical", &["api", "integration", "error", "bug", "config"]),
    ("billing", &["invoice", "payment", "charge", "refund", "subscription"]),
];

/// Fixed request-complexity weights (§4.1, resolved per SPEC_FULL §10): normalized
/// token length, metadata nesting depth, metadata field count.
const COMPLEXITY_WEIGHT_TOKENS: f64 = 0.4;
const COMPLEXITY_WEIGHT_DEPTH: f64 = 0.35;
const COMPLEXITY_WEIGHT_FIELDS: f64 = 0.25;

pub struct FeatureExtractor {
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
}

impl FeatureExtractor {
    pub fn new(kv: Arc<dyn KvStore>, clock: Arc<dyn Clock>) -> Self {
        Self { kv, clock }
    }

    /// `extract(envelope, tenant_state) -> RouterFeatures` (§4.1). Tenant state is
    /// read through the injected `KvStore`; any read failure is absorbed and a
    /// complete neutral-default record is returned instead (§4.1 failure semantics).
    pub async fn extract(&self, envelope: &RequestEnvelope) -> RouterFeatures {
        match self.try_extract(envelope).await {
            Ok(features) => features,
            Err(err) => {
                tracing::debug!(tenant_id = %envelope.tenant_id, error = %err, "feature extraction fell back to neutral defaults");
                RouterFeatures::neutral_default()
            }
        }
    }

    async fn try_extract(&self, envelope: &RequestEnvelope) -> Result<RouterFeatures, KvError> {
        let cache_key = format!("router:features:cache:{}", cache_hash(envelope));
        if let Some(cached) = self.kv.get(&cache_key).await? {
            if let Ok(features) = serde_json::from_str::<RouterFeatures>(&cached) {
                return Ok(features);
            }
        }

        let token_count = estimate_token_count(&envelope.message);
        let schema_strictness = schema_strictness(&envelope.metadata);
        let domain_flags = domain_flags(&envelope.message);
        let novelty_score = self.novelty_score(envelope).await?;
        let historical_failure_rate = self.historical_failure_rate(envelope).await?;
        let user_tier = self.user_tier(envelope).await?;
        let now = self.clock.now_utc();
        let time_of_day = now.hour() as u8;
        let day_of_week = now.weekday().num_days_from_monday() as u8;
        let request_complexity = request_complexity(token_count, &envelope.metadata);

        let features = RouterFeatures {
            token_count,
            schema_strictness,
            domain_flags,
            novelty_score,
            historical_failure_rate,
            user_tier,
            time_of_day,
            day_of_week,
            request_complexity,
        };

        if let Ok(serialized) = serde_json::to_string(&features) {
            let _ = self.kv.set(&cache_key, serialized, Some(FEATURE_CACHE_TTL)).await;
        }

        Ok(features)
    }

    /// Records this message's token set into the tenant's novelty-scoring history.
    /// Never called from inside `extract` — the extractor itself never writes
    /// tenant state (§4.1 contract).
    pub async fn record_message(&self, envelope: &RequestEnvelope) -> Result<(), KvError> {
        let key = format!("router:history:{}", envelope.tenant_id);
        let tokens = tokenize(&envelope.message).into_iter().collect::<Vec<_>>().join(" ");
        self.kv.lpush(&key, tokens).await?;
        // Trim to the novelty window; best-effort, not part of the read contract.
        while let Ok(len) = self.kv.lrange(&key, 0, -1).await.map(|v| v.len() as isize) {
            if len <= NOVELTY_HISTORY_WINDOW {
                break;
            }
            let _ = self.kv.rpop(&key).await;
        }
        Ok(())
    }

    async fn novelty_score(&self, envelope: &RequestEnvelope) -> Result<f64, KvError> {
        let key = format!("router:history:{}", envelope.tenant_id);
        let history = self.kv.lrange(&key, 0, NOVELTY_HISTORY_WINDOW - 1).await?;
        if history.is_empty() {
            return Ok(1.0);
        }
        let current: std::collections::HashSet<String> = tokenize(&envelope.message);
        let max_similarity = history
            .iter()
            .map(|entry| {
                let other: std::collections::HashSet<String> =
                    entry.split_whitespace().map(str::to_string).collect();
                jaccard(&current, &other)
            })
            .fold(0.0_f64, f64::max);
        Ok((1.0 - max_similarity).clamp(0.0, 1.0))
    }

    async fn historical_failure_rate(&self, envelope: &RequestEnvelope) -> Result<f64, KvError> {
        let key = format!("router:state:{}", envelope.tenant_id);
        if let Some(user_id) = &envelope.user_id {
            if let Some(v) = self.kv.hget(&key, &format!("failure_rate:{user_id}")).await? {
                if let Ok(rate) = v.parse() {
                    return Ok(rate);
                }
            }
        }
        if let Some(v) = self.kv.hget(&key, "failure_rate:default").await? {
            if let Ok(rate) = v.parse() {
                return Ok(rate);
            }
        }
        Ok(DEFAULT_FAILURE_RATE)
    }

    async fn user_tier(&self, envelope: &RequestEnvelope) -> Result<UserTier, KvError> {
        let key = format!("router:state:{}", envelope.tenant_id);
        if let Some(user_id) = &envelope.user_id {
            if let Some(v) = self.kv.hget(&key, &format!("user_tier:{user_id}")).await? {
                if let Some(tier) = parse_user_tier(&v) {
                    return Ok(tier);
                }
            }
        }
        if let Some(v) = self.kv.hget(&key, "user_tier:default").await? {
            if let Some(tier) = parse_user_tier(&v) {
                return Ok(tier);
            }
        }
        Ok(UserTier::Standard)
    }
}

fn parse_user_tier(s: &str) -> Option<UserTier> {
    match s {
        "basic" => Some(UserTier::Basic),
        "standard" => Some(UserTier::Standard),
        "premium" => Some(UserTier::Premium),
        "enterprise" => Some(UserTier::Enterprise),
        _ => None,
    }
}

/// `max(1, ceil(len(message)/4))` treating the message as a character sequence.
fn estimate_token_count(message: &str) -> u64 {
    let chars = message.chars().count() as u64;
    (chars.div_ceil(4)).max(1)
}

/// +0.25 per hint present among `schema`, `json`, `validation`, `constraints`.
fn schema_strictness(metadata: &HashMap<String, Value>) -> f64 {
    let mut score = 0.0;
    for key in ["schema", "json", "validation", "constraints"] {
        if metadata.contains_key(key) {
            score += 0.25;
        }
    }
    score.clamp(0.0, 1.0)
}

fn domain_flags(message: &str) -> Vec<String> {
    let lower = message.to_lowercase();
    DOMAIN_VOCAB
        .iter()
        .filter(|(_, keywords)| keywords.iter().any(|kw| lower.contains(kw)))
        .map(|(domain, _)| domain.to_string())
        .collect()
}

fn tokenize(message: &str) -> std::collections::HashSet<String> {
    message
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn jaccard(a: &std::collections::HashSet<String>, b: &std::collections::HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    if union == 0.0 {
        0.0
    } else {
        intersection / union
    }
}

/// Weighted combination of normalized token length, metadata nesting depth, and
/// metadata field count (§4.1, weights fixed in SPEC_FULL §10).
fn request_complexity(token_count: u64, metadata: &HashMap<String, Value>) -> f64 {
    let normalized_tokens = (token_count as f64 / 500.0).min(1.0);
    let depth = metadata
        .values()
        .map(|v| value_depth(v, 1))
        .max()
        .unwrap_or(0);
    let normalized_depth = (depth as f64 / 5.0).min(1.0);
    let field_count: usize = metadata.values().map(value_field_count).sum::<usize>() + metadata.len();
    let normalized_fields = (field_count as f64 / 20.0).min(1.0);

    (COMPLEXITY_WEIGHT_TOKENS * normalized_tokens
        + COMPLEXITY_WEIGHT_DEPTH * normalized_depth
        + COMPLEXITY_WEIGHT_FIELDS * normalized_fields)
        .clamp(0.0, 1.0)
}

fn value_depth(value: &Value, current: usize) -> usize {
    match value {
        Value::Object(map) => map
            .values()
            .map(|v| value_depth(v, current + 1))
            .max()
            .unwrap_or(current),
        Value::Array(items) => items
            .iter()
            .map(|v| value_depth(v, current + 1))
            .max()
            .unwrap_or(current),
        _ => current,
    }
}

fn value_field_count(value: &Value) -> usize {
    match value {
        Value::Object(map) => map.len() + map.values().map(value_field_count).sum::<usize>(),
        Value::Array(items) => items.iter().map(value_field_count).sum(),
        _ => 0,
    }
}

/// SHA-256 of the stable (sorted-key) serialization of the envelope, truncated to
/// 16 hex chars (§4.1). `serde_json` with a `BTreeMap` intermediate gives a
/// canonical key order regardless of the original `HashMap`'s iteration order.
fn cache_hash(envelope: &RequestEnvelope) -> String {
    let sorted_metadata: std::collections::BTreeMap<&String, &Value> =
        envelope.metadata.iter().collect();
    let canonical = serde_json::json!({
        "tenant_id": envelope.tenant_id,
        "user_id": envelope.user_id,
        "message": envelope.message,
        "metadata": sorted_metadata,
    });
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    format!("{digest:x}")[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::kv::InMemoryKvStore;

    fn envelope(message: &str, metadata: HashMap<String, Value>) -> RequestEnvelope {
        RequestEnvelope {
            tenant_id: "t1".to_string(),
            user_id: Some("u1".to_string()),
            message: message.to_string(),
            metadata,
        }
    }

    fn extractor() -> FeatureExtractor {
        FeatureExtractor::new(Arc::new(InMemoryKvStore::new()), Arc::new(SystemClock::new()))
    }

    #[tokio::test]
    async fn token_count_is_ceil_len_over_4_with_floor_1() {
        let e = envelope("ok", HashMap::new());
        let features = extractor().extract(&e).await;
        assert_eq!(features.token_count, 1);

        let e2 = envelope(&"x".repeat(41), HashMap::new());
        let features2 = extractor().extract(&e2).await;
        assert_eq!(features2.token_count, 11);
    }

    #[tokio::test]
    async fn schema_strictness_all_four_hints_is_exactly_one() {
        let mut md = HashMap::new();
        md.insert("schema".to_string(), Value::Null);
        md.insert("json".to_string(), Value::Null);
        md.insert("validation".to_string(), Value::Null);
        md.insert("constraints".to_string(), Value::Null);
        let e = envelope("hello", md);
        let features = extractor().extract(&e).await;
        assert_eq!(features.schema_strictness, 1.0);
    }

    #[tokio::test]
    async fn schema_strictness_no_hints_is_zero() {
        let e = envelope("hello", HashMap::new());
        let features = extractor().extract(&e).await;
        assert_eq!(features.schema_strictness, 0.0);
    }

    #[tokio::test]
    async fn domain_flags_are_non_exclusive() {
        let e = envelope("I need help with my order payment", HashMap::new());
        let features = extractor().extract(&e).await;
        assert!(features.domain_flags.contains(&"customer_support".to_string()));
        assert!(features.domain_flags.contains(&"sales".to_string()));
        assert!(features.domain_flags.contains(&"billing".to_string()));
    }

    #[tokio::test]
    async fn novelty_defaults_to_one_with_no_history() {
        let e = envelope("first message ever from this tenant", HashMap::new());
        let features = extractor().extract(&e).await;
        assert_eq!(features.novelty_score, 1.0);
    }

    #[tokio::test]
    async fn novelty_drops_for_a_repeated_message() {
        let kv = Arc::new(InMemoryKvStore::new());
        let extractor = FeatureExtractor::new(kv, Arc::new(SystemClock::new()));
        let e = envelope("the quick brown fox jumps", HashMap::new());
        extractor.record_message(&e).await.unwrap();
        let features = extractor.extract(&e).await;
        assert!(features.novelty_score < 1.0);
    }

    #[tokio::test]
    async fn historical_failure_rate_defaults_to_point_one() {
        let e = envelope("hello", HashMap::new());
        let features = extractor().extract(&e).await;
        assert_eq!(features.historical_failure_rate, 0.1);
    }

    #[tokio::test]
    async fn user_tier_defaults_to_standard() {
        let e = envelope("hello", HashMap::new());
        let features = extractor().extract(&e).await;
        assert_eq!(features.user_tier, UserTier::Standard);
    }

    #[tokio::test]
    async fn identical_envelope_yields_identical_features_cache_hit_or_miss() {
        let kv = Arc::new(InMemoryKvStore::new());
        let extractor = FeatureExtractor::new(kv, Arc::new(SystemClock::new()));
        let e = envelope("deterministic please", HashMap::new());
        let first = extractor.extract(&e).await;
        let second = extractor.extract(&e).await; // second call is a cache hit
        assert_eq!(first.token_count, second.token_count);
        assert_eq!(first.schema_strictness, second.schema_strictness);
        assert_eq!(first.domain_flags, second.domain_flags);
    }

    #[test]
    fn cache_hash_is_stable_regardless_of_metadata_insertion_order() {
        let mut md_a = HashMap::new();
        md_a.insert("b".to_string(), Value::from(2));
        md_a.insert("a".to_string(), Value::from(1));
        let mut md_b = HashMap::new();
        md_b.insert("a".to_string(), Value::from(1));
        md_b.insert("b".to_string(), Value::from(2));

        let e_a = envelope("same", md_a);
        let e_b = envelope("same", md_b);
        assert_eq!(cache_hash(&e_a), cache_hash(&e_b));
        assert_eq!(cache_hash(&e_a).len(), 16);
    }
}
