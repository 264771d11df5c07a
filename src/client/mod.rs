//! Client library for talking to the socket pool daemon.
//!
//! Each call opens one fresh IPC connection, writes one JSON request, reads
//! one JSON response and closes. Around that round trip the client layers a
//! retry loop with linear backoff, a per-endpoint circuit breaker and an
//! optional result cache.

pub mod batch;
pub mod breaker;
pub mod cache;

pub use batch::{BatchItem, BatchOutcome, BatchSummary};
pub use breaker::{CircuitBreaker, CircuitState};
pub use cache::ResultCache;

use crate::config::{ClientSettings, Config};
use crate::pool::EndpointKey;
use crate::protocol::MAX_RESPONSE_BYTES;
use crate::utils::error::{PoolError, Result};
use dashmap::DashMap;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Per-call options for `send_gps`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendOptions {
    pub use_cache: bool,
}

impl SendOptions {
    /// Pull recognized flags out of a request's free-form `options` object.
    pub fn from_value(options: Option<&Value>) -> Self {
        let use_cache = options
            .and_then(|o| o.get("use_cache"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Self { use_cache }
    }
}

pub struct PoolClient {
    socket_path: PathBuf,
    settings: ClientSettings,
    breakers: DashMap<EndpointKey, CircuitBreaker>,
    cache: ResultCache,
}

impl PoolClient {
    pub fn new(socket_path: impl Into<PathBuf>, settings: ClientSettings) -> Self {
        let cache_ttl = Duration::from_secs(settings.cache_ttl_secs);
        Self {
            socket_path: socket_path.into(),
            settings,
            breakers: DashMap::new(),
            cache: ResultCache::new(cache_ttl),
        }
    }

    /// Client configured from defaults plus the SOCKET_POOL_* environment.
    pub fn from_env() -> Result<Self> {
        let config = Config::from_env()?;
        Ok(Self::new(config.server.socket_path, config.client))
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Send one telemetry frame through the daemon.
    ///
    /// Fails fast with `circuit_open` when the endpoint's breaker is open;
    /// otherwise retries the IPC round trip with linear backoff and updates
    /// the breaker with the call's final outcome. The returned response is
    /// the daemon's envelope with `duration_ms` merged in (its `success`
    /// field may be false).
    pub async fn send_gps(
        &self,
        host: &str,
        port: u16,
        message: &str,
        vehicle_id: &str,
        options: SendOptions,
    ) -> Result<Value> {
        if host.trim().is_empty() || port == 0 || message.is_empty() {
            return Err(PoolError::InvalidRequest(
                "host, port and message are required".to_string(),
            ));
        }

        let key = EndpointKey::new(host, port);
        self.check_breaker(&key)?;

        let cache_key = ResultCache::key("send_gps", host, port, message);
        let use_cache = options.use_cache && self.settings.cache_enabled;
        if use_cache {
            if let Some(mut hit) = self.cache.get(&cache_key) {
                debug!(endpoint = %key, "Returning cached response");
                if let Some(obj) = hit.as_object_mut() {
                    obj.insert("cached".to_string(), Value::Bool(true));
                }
                return Ok(hit);
            }
        }

        let request = json!({
            "action": "send_gps",
            "host": host,
            "port": port,
            "message": message,
            "vehicle_id": vehicle_id,
        });

        let started = Instant::now();
        let outcome = self.execute_with_retries(&request).await;

        match outcome {
            Ok(mut response) => {
                let succeeded = response
                    .get("success")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);

                self.update_breaker(&key, succeeded);
                merge_duration(&mut response, started);
                self.emit_metric("client_request", &key, succeeded, started);

                if succeeded && use_cache {
                    self.cache.put(cache_key, response.clone());
                }
                Ok(response)
            }
            Err(e) => {
                self.update_breaker(&key, false);
                self.emit_metric("client_request", &key, false, started);
                Err(e)
            }
        }
    }

    /// Ask the daemon to tear down its pooled connection for an endpoint.
    pub async fn close_connection(&self, host: &str, port: u16) -> Result<Value> {
        self.execute_with_retries(&json!({
            "action": "close_connection",
            "host": host,
            "port": port,
        }))
        .await
    }

    pub async fn get_stats(&self) -> Result<Value> {
        self.execute_with_retries(&json!({"action": "get_stats"})).await
    }

    pub async fn get_metrics(&self) -> Result<Value> {
        self.execute_with_retries(&json!({"action": "get_metrics"})).await
    }

    pub async fn health_check(&self) -> Result<Value> {
        self.execute_with_retries(&json!({"action": "health_check"})).await
    }

    pub async fn get_config(&self) -> Result<Value> {
        self.execute_with_retries(&json!({"action": "get_config"})).await
    }

    /// Current breaker state for an endpoint, for diagnostics.
    pub fn breaker_state(&self, host: &str, port: u16) -> Option<CircuitState> {
        self.breakers
            .get(&EndpointKey::new(host, port))
            .map(|b| b.state())
    }

    fn check_breaker(&self, key: &EndpointKey) -> Result<()> {
        if !self.settings.circuit_breaker_enabled {
            return Ok(());
        }

        let mut breaker = self.breakers.entry(key.clone()).or_insert_with(|| {
            CircuitBreaker::new(
                self.settings.cb_threshold,
                Duration::from_secs(self.settings.cb_timeout_secs),
            )
        });

        breaker.check().map_err(|remaining| {
            PoolError::CircuitOpen(format!(
                "{} failing, retry in {:.1}s",
                key,
                remaining.as_secs_f64()
            ))
        })
    }

    fn update_breaker(&self, key: &EndpointKey, succeeded: bool) {
        if !self.settings.circuit_breaker_enabled {
            return;
        }

        if let Some(mut breaker) = self.breakers.get_mut(key) {
            if succeeded {
                breaker.record_success();
            } else {
                breaker.record_failure();
                debug!(
                    endpoint = %key,
                    failures = breaker.failures(),
                    state = ?breaker.state(),
                    "Recorded endpoint failure"
                );
            }
        }
    }

    /// IPC round trips with linear backoff: attempt N sleeps
    /// `retry_delay_ms * N` before the next try. A response with
    /// `success: false` counts as a failed attempt but is still returned if
    /// no attempt does better.
    async fn execute_with_retries(&self, request: &Value) -> Result<Value> {
        let attempts = self.settings.retry_attempts.max(1);
        let mut last_response = None;
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.round_trip(request).await {
                Ok(response) => {
                    let succeeded = response
                        .get("success")
                        .and_then(Value::as_bool)
                        .unwrap_or(false);

                    if succeeded {
                        return Ok(response);
                    }
                    last_response = Some(response);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "IPC request attempt failed");
                    last_error = Some(e);
                }
            }

            if attempt < attempts {
                let delay = self.settings.retry_delay_ms * attempt as u64;
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
        }

        match (last_response, last_error) {
            (Some(response), _) => Ok(response),
            (None, Some(e)) => Err(e),
            (None, None) => Err(PoolError::Internal("no attempt was made".to_string())),
        }
    }

    /// One connect/write/read/close cycle against the daemon socket.
    async fn round_trip(&self, request: &Value) -> Result<Value> {
        let deadline = Duration::from_secs(self.settings.timeout_secs.max(1));

        let mut stream = match timeout(deadline, UnixStream::connect(&self.socket_path)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(PoolError::ConnectFailed(format!(
                    "daemon socket {}: {}",
                    self.socket_path.display(),
                    e
                )))
            }
            Err(_) => {
                return Err(PoolError::ConnectFailed(format!(
                    "daemon socket {}: connect timed out",
                    self.socket_path.display()
                )))
            }
        };

        let body = serde_json::to_vec(request)
            .map_err(|e| PoolError::Internal(format!("request encoding failed: {}", e)))?;

        timeout(deadline, stream.write_all(&body))
            .await
            .map_err(|_| PoolError::WriteFailed("IPC write timed out".to_string()))?
            .map_err(|e| PoolError::WriteFailed(e.to_string()))?;
        timeout(deadline, stream.shutdown())
            .await
            .map_err(|_| PoolError::WriteFailed("IPC shutdown timed out".to_string()))?
            .map_err(|e| PoolError::WriteFailed(e.to_string()))?;

        // The daemon closes after its single response, so read to EOF
        // bounded by the protocol's response cap.
        let mut raw = Vec::with_capacity(1024);
        let mut chunk = [0u8; 1024];
        loop {
            let n = timeout(deadline, stream.read(&mut chunk))
                .await
                .map_err(|_| PoolError::ReadFailed("IPC read timed out".to_string()))?
                .map_err(|e| PoolError::ReadFailed(e.to_string()))?;
            if n == 0 {
                break;
            }
            raw.extend_from_slice(&chunk[..n]);
            if raw.len() >= MAX_RESPONSE_BYTES {
                raw.truncate(MAX_RESPONSE_BYTES);
                break;
            }
        }

        if raw.is_empty() {
            return Err(PoolError::ReadFailed(
                "daemon closed without a response".to_string(),
            ));
        }

        serde_json::from_slice(&raw).map_err(|e| PoolError::InvalidJson(e.to_string()))
    }

    fn emit_metric(&self, name: &str, key: &EndpointKey, succeeded: bool, started: Instant) {
        debug!(
            target: "sockpool::client::metrics",
            metric = name,
            endpoint = %key,
            success = succeeded,
            duration_ms = started.elapsed().as_secs_f64() * 1000.0,
            "metric"
        );
    }
}

fn merge_duration(response: &mut Value, started: Instant) {
    if let Some(obj) = response.as_object_mut() {
        obj.insert(
            "duration_ms".to_string(),
            json!(started.elapsed().as_secs_f64() * 1000.0),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_settings() -> ClientSettings {
        ClientSettings {
            timeout_secs: 1,
            retry_attempts: 1,
            retry_delay_ms: 10,
            cb_threshold: 2,
            cb_timeout_secs: 1,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn invalid_arguments_fail_before_ipc() {
        let client = PoolClient::new("/tmp/nonexistent-sockpool.sock", test_settings());

        let err = client
            .send_gps("", 1, "msg", "V1", SendOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::InvalidRequest(_)));

        let err = client
            .send_gps("h", 0, "msg", "V1", SendOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn missing_daemon_surfaces_connect_failed() {
        let dir = tempfile::tempdir().unwrap();
        let client = PoolClient::new(dir.path().join("absent.sock"), test_settings());

        let err = client.get_stats().await.unwrap_err();
        assert!(matches!(err, PoolError::ConnectFailed(_)));
    }

    #[tokio::test]
    async fn repeated_failures_open_the_breaker() {
        let dir = tempfile::tempdir().unwrap();
        let client = PoolClient::new(dir.path().join("absent.sock"), test_settings());

        for _ in 0..2 {
            let err = client
                .send_gps("127.0.0.1", 19999, "x", "V1", SendOptions::default())
                .await
                .unwrap_err();
            assert!(matches!(err, PoolError::ConnectFailed(_)));
        }

        assert_eq!(
            client.breaker_state("127.0.0.1", 19999),
            Some(CircuitState::Open)
        );

        let err = client
            .send_gps("127.0.0.1", 19999, "x", "V1", SendOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::CircuitOpen(_)));
    }

    #[test]
    fn options_parse_use_cache_flag() {
        let value = serde_json::json!({"use_cache": true});
        assert!(SendOptions::from_value(Some(&value)).use_cache);
        assert!(!SendOptions::from_value(None).use_cache);
    }
}
