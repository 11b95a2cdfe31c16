//! The KV Store external collaborator (§6).
//!
//! Opaque key/value storage with TTLs, hashes, and lists — the only externally
//! shared mutable resource the router and realtime pipeline touch. Keys are always
//! namespaced by tenant by the caller; this trait never enforces namespacing itself.
//!
//! Any store satisfying this contract works: the in-memory implementation here is
//! used by tests and as the default for single-process deployments. A
//! Redis-backed implementation would implement the same trait and is a drop-in
//! replacement — the Router Orchestrator and Session Manager depend only on
//! `Arc<dyn KvStore>`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;

/// Hard per-call timeout for every KV operation (§5). Callers are expected to wrap
/// `KvStore` calls in `tokio::time::timeout` using this constant; it is not enforced
/// inside the trait itself since the in-memory implementation never blocks.
pub const KV_CALL_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum KvError {
    #[error("kv operation timed out")]
    Timeout,
    #[error("kv backend unavailable: {0}")]
    Unavailable(String),
}

/// Opaque key/value store with TTL, hash, and list operations (§6).
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), KvError>;
    async fn incr(&self, key: &str, by: i64) -> Result<i64, KvError>;
    async fn hset(&self, key: &str, field: &str, value: String) -> Result<(), KvError>;
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, KvError>;
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, KvError>;
    /// Pushes to the head of the list (matches the original pipeline's overflow-spill
    /// ordering, where `lpush` + `rpop` together implement FIFO across the spill
    /// boundary — see `queue.rs`).
    async fn lpush(&self, key: &str, value: String) -> Result<(), KvError>;
    /// Pushes to the tail; used when restoring a queue in original enqueue order.
    async fn rpush(&self, key: &str, value: String) -> Result<(), KvError>;
    async fn rpop(&self, key: &str) -> Result<Option<String>, KvError>;
    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, KvError>;
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), KvError>;
    async fn del(&self, key: &str) -> Result<(), KvError>;
}

#[derive(Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

enum Value {
    Scalar(String),
    Hash(HashMap<String, String>),
    List(std::collections::VecDeque<String>),
}

/// In-memory `KvStore`, namespaced by whatever key prefixes the caller chooses.
///
/// Used as the default store for single-process deployments and exclusively by
/// tests (no external service dependency required in CI).
pub struct InMemoryKvStore {
    data: Mutex<HashMap<String, Entry>>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(HashMap::new()),
        }
    }

    fn is_live(entry: &Entry) -> bool {
        match entry.expires_at {
            Some(at) => Instant::now() < at,
            None => true,
        }
    }
}

impl Default for InMemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut data = self.data.lock().unwrap();
        match data.get(key) {
            Some(entry) if Self::is_live(entry) => match &entry.value {
                Value::Scalar(s) => Ok(Some(s.clone())),
                _ => Ok(None),
            },
            Some(_) => {
                data.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), KvError> {
        let mut data = self.data.lock().unwrap();
        data.insert(
            key.to_string(),
            Entry {
                value: Value::Scalar(value),
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(())
    }

    async fn incr(&self, key: &str, by: i64) -> Result<i64, KvError> {
        let mut data = self.data.lock().unwrap();
        let entry = data.entry(key.to_string()).or_insert(Entry {
            value: Value::Scalar("0".to_string()),
            expires_at: None,
        });
        let current: i64 = match &entry.value {
            Value::Scalar(s) => s.parse().unwrap_or(0),
            _ => 0,
        };
        let next = current + by;
        entry.value = Value::Scalar(next.to_string());
        Ok(next)
    }

    async fn hset(&self, key: &str, field: &str, value: String) -> Result<(), KvError> {
        let mut data = self.data.lock().unwrap();
        let entry = data.entry(key.to_string()).or_insert(Entry {
            value: Value::Hash(HashMap::new()),
            expires_at: None,
        });
        if let Value::Hash(map) = &mut entry.value {
            map.insert(field.to_string(), value);
        } else {
            let mut map = HashMap::new();
            map.insert(field.to_string(), value);
            entry.value = Value::Hash(map);
        }
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, KvError> {
        let data = self.data.lock().unwrap();
        Ok(data.get(key).and_then(|entry| match &entry.value {
            Value::Hash(map) => map.get(field).cloned(),
            _ => None,
        }))
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, KvError> {
        let data = self.data.lock().unwrap();
        Ok(data
            .get(key)
            .and_then(|entry| match &entry.value {
                Value::Hash(map) => Some(map.clone()),
                _ => None,
            })
            .unwrap_or_default())
    }

    async fn lpush(&self, key: &str, value: String) -> Result<(), KvError> {
        let mut data = self.data.lock().unwrap();
        let entry = data.entry(key.to_string()).or_insert(Entry {
            value: Value::List(std::collections::VecDeque::new()),
            expires_at: None,
        });
        if let Value::List(list) = &mut entry.value {
            list.push_front(value);
        } else {
            let mut list = std::collections::VecDeque::new();
            list.push_front(value);
            entry.value = Value::List(list);
        }
        Ok(())
    }

    async fn rpush(&self, key: &str, value: String) -> Result<(), KvError> {
        let mut data = self.data.lock().unwrap();
        let entry = data.entry(key.to_string()).or_insert(Entry {
            value: Value::List(std::collections::VecDeque::new()),
            expires_at: None,
        });
        if let Value::List(list) = &mut entry.value {
            list.push_back(value);
        } else {
            let mut list = std::collections::VecDeque::new();
            list.push_back(value);
            entry.value = Value::List(list);
        }
        Ok(())
    }

    async fn rpop(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut data = self.data.lock().unwrap();
        Ok(data.get_mut(key).and_then(|entry| match &mut entry.value {
            Value::List(list) => list.pop_back(),
            _ => None,
        }))
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, KvError> {
        let data = self.data.lock().unwrap();
        let Some(entry) = data.get(key) else {
            return Ok(Vec::new());
        };
        let Value::List(list) = &entry.value else {
            return Ok(Vec::new());
        };
        let len = list.len() as isize;
        if len == 0 {
            return Ok(Vec::new());
        }
        let norm = |i: isize| -> isize {
            if i < 0 {
                (len + i).max(0)
            } else {
                i.min(len - 1)
            }
        };
        let start = norm(start);
        let stop = norm(stop);
        if start > stop {
            return Ok(Vec::new());
        }
        Ok(list
            .iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .cloned()
            .collect())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), KvError> {
        let mut data = self.data.lock().unwrap();
        if let Some(entry) = data.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), KvError> {
        let mut data = self.data.lock().unwrap();
        data.remove(key);
        Ok(())
    }
}
