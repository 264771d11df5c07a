use dashmap::DashMap;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct CachedValue {
    value: Value,
    stored_at: Instant,
}

/// In-memory response cache keyed by `(action, host, port, payload digest)`.
#[derive(Debug)]
pub struct ResultCache {
    entries: DashMap<String, CachedValue>,
    ttl: Duration,
}

impl ResultCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn key(action: &str, host: &str, port: u16, payload: &str) -> String {
        let digest = Sha256::digest(payload.as_bytes());
        format!("{}:{}:{}:{}", action, host, port, hex::encode(digest))
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let hit = self.entries.get(key)?;
        if hit.stored_at.elapsed() > self.ttl {
            drop(hit);
            self.entries.remove(key);
            return None;
        }
        Some(hit.value.clone())
    }

    pub fn put(&self, key: String, value: Value) {
        self.entries.insert(
            key,
            CachedValue {
                value,
                stored_at: Instant::now(),
            },
        );
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
