use crate::pool::EndpointKey;
use crate::protocol::EndpointCounters;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
struct Counters {
    success: AtomicU64,
    failed: AtomicU64,
    total: AtomicU64,
}

/// Per-endpoint request counters. Only the dispatcher writes here; every
/// recorded request bumps `total` alongside exactly one of the outcomes, so
/// `total == success + failed` holds after each request completes.
#[derive(Debug, Default)]
pub struct StatsRegistry {
    counters: DashMap<EndpointKey, Counters>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, key: &EndpointKey) {
        let entry = self.counters.entry(key.clone()).or_default();
        entry.success.fetch_add(1, Ordering::Relaxed);
        entry.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self, key: &EndpointKey) {
        let entry = self.counters.entry(key.clone()).or_default();
        entry.failed.fetch_add(1, Ordering::Relaxed);
        entry.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> BTreeMap<String, EndpointCounters> {
        self.counters
            .iter()
            .map(|entry| {
                (
                    entry.key().to_string(),
                    EndpointCounters {
                        success: entry.success.load(Ordering::Relaxed),
                        failed: entry.failed.load(Ordering::Relaxed),
                        total: entry.total.load(Ordering::Relaxed),
                    },
                )
            })
            .collect()
    }
}
