//! Metric records and the optional external metrics store.
//!
//! Publishing is strictly best-effort: when the store is disabled or the
//! cache is unreachable, every operation degrades to a warning log and the
//! request path is never blocked.

use crate::config::Config;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

const METRICS_LIST_KEY: &str = "socket_pool:metrics";
const METRICS_LIST_MAX: isize = 1000;
const PING_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricRecord {
    pub metric_name: String,
    pub value: f64,
    pub tags: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
    pub instance_id: Uuid,
}

impl MetricRecord {
    pub fn new(instance_id: Uuid, name: impl Into<String>, value: f64) -> Self {
        Self {
            metric_name: name.into(),
            value,
            tags: BTreeMap::new(),
            timestamp: Utc::now(),
            instance_id,
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// Handle to the optional external cache used for metric snapshots.
#[derive(Clone)]
pub struct MetricsStore {
    conn: Option<ConnectionManager>,
    emission_enabled: bool,
    instance_id: Uuid,
}

impl MetricsStore {
    /// Connect to the configured cache. Connection failures disable the
    /// store rather than failing daemon startup.
    pub async fn connect(config: &Config, instance_id: Uuid) -> Self {
        let disabled = Self {
            conn: None,
            emission_enabled: config.metrics.enabled,
            instance_id,
        };

        if !config.redis.enabled {
            debug!("External metrics cache disabled by configuration");
            return disabled;
        }

        let url = config.redis.url();
        let client = match redis::Client::open(url.as_str()) {
            Ok(client) => client,
            Err(e) => {
                warn!(error = %e, "Invalid metrics cache URL, metrics store disabled");
                return disabled;
            }
        };

        match ConnectionManager::new(client).await {
            Ok(conn) => {
                info!(host = %config.redis.host, port = config.redis.port, "Connected to metrics cache");
                Self {
                    conn: Some(conn),
                    emission_enabled: config.metrics.enabled,
                    instance_id,
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to connect to metrics cache, metrics store disabled");
                disabled
            }
        }
    }

    /// Store configured (regardless of whether the cache answered at
    /// connect time).
    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub async fn ping(&self) -> bool {
        let Some(conn) = &self.conn else {
            return false;
        };

        let mut conn = conn.clone();
        match timeout(
            PING_TIMEOUT,
            redis::cmd("PING").query_async::<_, String>(&mut conn),
        )
        .await
        {
            Ok(Ok(reply)) => reply.eq_ignore_ascii_case("pong"),
            Ok(Err(e)) => {
                warn!(error = %e, "Metrics cache ping failed");
                false
            }
            Err(_) => {
                warn!("Metrics cache ping timed out");
                false
            }
        }
    }

    /// Push one record onto the shared metrics list, trimmed to the most
    /// recent 1,000 entries.
    pub async fn push_record(&self, record: &MetricRecord) {
        if !self.emission_enabled {
            return;
        }
        let Some(conn) = &self.conn else {
            return;
        };

        let json = match serde_json::to_string(record) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, metric = %record.metric_name, "Failed to encode metric record");
                return;
            }
        };

        let mut conn = conn.clone();
        let result: redis::RedisResult<()> = async {
            conn.lpush::<_, _, ()>(METRICS_LIST_KEY, json).await?;
            conn.ltrim(METRICS_LIST_KEY, 0, METRICS_LIST_MAX - 1).await
        }
        .await;

        if let Err(e) = result {
            warn!(error = %e, metric = %record.metric_name, "Failed to publish metric record");
        }
    }

    /// Publish a keyed snapshot for this instance with the given TTL.
    pub async fn publish_snapshot(&self, snapshot: &Value, ttl: Duration) {
        if !self.emission_enabled {
            return;
        }
        let Some(conn) = &self.conn else {
            return;
        };

        let json = match serde_json::to_string(snapshot) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "Failed to encode metrics snapshot");
                return;
            }
        };

        let key = format!("socket_pool:metrics:{}", self.instance_id);
        let mut conn = conn.clone();
        let result: redis::RedisResult<()> = redis::cmd("SET")
            .arg(&key)
            .arg(json)
            .arg("EX")
            .arg(ttl.as_secs())
            .query_async(&mut conn)
            .await;

        if let Err(e) = result {
            warn!(error = %e, "Failed to publish metrics snapshot");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_serialize_with_tags() {
        let record = MetricRecord::new(Uuid::new_v4(), "pool_size", 3.0)
            .tag("endpoint", "10.0.0.1:5027");

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["metric_name"], "pool_size");
        assert_eq!(json["value"], 3.0);
        assert_eq!(json["tags"]["endpoint"], "10.0.0.1:5027");
        assert!(json["timestamp"].is_string());
    }

    #[tokio::test]
    async fn disabled_store_ignores_publishes() {
        let config = Config::default();
        let store = MetricsStore::connect(&config, Uuid::new_v4()).await;

        assert!(!store.is_connected());
        assert!(!store.ping().await);

        // Neither call may error or block.
        store
            .push_record(&MetricRecord::new(store.instance_id(), "noop", 1.0))
            .await;
        store
            .publish_snapshot(&serde_json::json!({"pool_size": 0}), Duration::from_secs(300))
            .await;
    }
}
