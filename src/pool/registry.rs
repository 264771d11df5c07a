use crate::pool::entry::{EndpointKey, PooledConnection};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, trace};

/// Snapshot of the registry without touching any socket.
#[derive(Debug, Clone)]
pub struct PoolSnapshot {
    pub size: usize,
    pub max_size: usize,
    pub keys: Vec<String>,
}

/// Bounded keyed registry of pooled upstream connections.
///
/// Ownership follows a checkout/checkin discipline: `checkout` removes the
/// entry from the map, giving the caller exclusive use of the socket, and
/// `checkin` returns it. At most one entry exists per endpoint, so two
/// in-flight requests to the same endpoint can never share a stream.
///
/// The map never exceeds `max_size`: a checkin against a full registry
/// evicts exactly one least-recently-used entry first.
pub struct ConnectionPool {
    entries: Mutex<HashMap<EndpointKey, PooledConnection>>,
    max_size: usize,
    idle_ttl: Duration,
}

impl ConnectionPool {
    pub fn new(max_size: usize, idle_ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_size,
            idle_ttl,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<EndpointKey, PooledConnection>> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Take the entry for `key` out of the pool for exclusive use.
    ///
    /// Returns `None` on a miss, and also when the pooled socket fails its
    /// liveness probe (the dead entry is destroyed on the spot). On a hit
    /// the entry's `last_used_at` is refreshed and `usage_count` bumped.
    pub fn checkout(&self, key: &EndpointKey) -> Option<PooledConnection> {
        let mut conn = self.lock().remove(key)?;

        if !conn.is_alive() {
            debug!(
                endpoint = %key,
                connection_id = %conn.connection_id,
                "Pooled connection failed liveness probe, discarding"
            );
            return None;
        }

        conn.touch();
        trace!(
            endpoint = %key,
            connection_id = %conn.connection_id,
            usage_count = conn.usage_count,
            "Pool hit"
        );
        Some(conn)
    }

    /// Return a connection to the pool, evicting the LRU entry first if the
    /// registry is at capacity and `key` is not already present.
    pub fn checkin(&self, key: EndpointKey, conn: PooledConnection) {
        let mut entries = self.lock();

        if !entries.contains_key(&key) && entries.len() >= self.max_size {
            if let Some(victim) = lru_key(&entries) {
                if let Some(evicted) = entries.remove(&victim) {
                    debug!(
                        endpoint = %victim,
                        connection_id = %evicted.connection_id,
                        "Pool full, evicting least-recently-used connection"
                    );
                }
            }
        }

        if let Some(replaced) = entries.insert(key.clone(), conn) {
            // A concurrent request raced a fresh connection in for the same
            // endpoint; the older one loses.
            debug!(
                endpoint = %key,
                connection_id = %replaced.connection_id,
                "Replaced pooled connection for endpoint"
            );
        }
    }

    /// Tear down the entry for `key` if present. Idempotent.
    pub fn drop_entry(&self, key: &EndpointKey) -> bool {
        match self.lock().remove(key) {
            Some(conn) => {
                debug!(
                    endpoint = %key,
                    connection_id = %conn.connection_id,
                    usage_count = conn.usage_count,
                    "Closing pooled connection"
                );
                true
            }
            None => false,
        }
    }

    /// Remove entries idle longer than the configured TTL.
    pub fn evict_expired(&self) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|key, conn| {
            let expired = conn.is_expired(self.idle_ttl);
            if expired {
                debug!(
                    endpoint = %key,
                    connection_id = %conn.connection_id,
                    idle = ?conn.last_used_at.elapsed(),
                    "Evicting idle-expired connection"
                );
            }
            !expired
        });
        before - entries.len()
    }

    /// Remove the entry with the smallest `last_used_at`.
    pub fn evict_oldest(&self) -> Option<EndpointKey> {
        let mut entries = self.lock();
        let victim = lru_key(&entries)?;
        entries.remove(&victim);
        Some(victim)
    }

    /// Drop every pooled socket. Returns how many were closed.
    pub fn close_all(&self) -> usize {
        let mut entries = self.lock();
        let count = entries.len();
        entries.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let entries = self.lock();
        let mut keys: Vec<String> = entries.keys().map(|k| k.to_string()).collect();
        keys.sort();
        PoolSnapshot {
            size: entries.len(),
            max_size: self.max_size,
            keys,
        }
    }
}

/// LRU victim by `last_used_at`; ties broken by key order so the choice is
/// deterministic.
fn lru_key(entries: &HashMap<EndpointKey, PooledConnection>) -> Option<EndpointKey> {
    entries
        .iter()
        .min_by(|(ka, a), (kb, b)| {
            a.last_used_at
                .cmp(&b.last_used_at)
                .then_with(|| ka.cmp(kb))
        })
        .map(|(key, _)| key.clone())
}
