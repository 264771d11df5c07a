//! IPC wire protocol.
//!
//! Each IPC connection carries exactly one JSON request and one JSON
//! response, neither length-prefixed. The request is tagged by `action`;
//! the response always carries `success`, a `request_id` and the handling
//! time in milliseconds, plus an action-specific payload on success or an
//! `error` string on failure.

use crate::utils::error::{PoolError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Maximum bytes the server reads for a single request.
pub const MAX_REQUEST_BYTES: usize = 4096;
/// Maximum bytes the client reads for a single response.
pub const MAX_RESPONSE_BYTES: usize = 8192;

const KNOWN_ACTIONS: &[&str] = &[
    "send_gps",
    "get_stats",
    "get_metrics",
    "close_connection",
    "health_check",
    "get_config",
];

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Request {
    SendGps {
        host: String,
        port: u16,
        message: String,
        #[serde(default)]
        vehicle_id: String,
        #[serde(default)]
        options: Option<Value>,
    },
    GetStats,
    GetMetrics,
    CloseConnection {
        host: String,
        port: u16,
    },
    HealthCheck,
    GetConfig,
}

impl Request {
    /// Decode one raw IPC request.
    ///
    /// Unknown actions and missing fields are reported as distinct errors so
    /// the server can answer with the exact wire message the client expects.
    pub fn parse(raw: &[u8]) -> Result<Request> {
        let value: Value = serde_json::from_slice(raw)
            .map_err(|e| PoolError::InvalidJson(e.to_string()))?;

        let action = value
            .get("action")
            .and_then(Value::as_str)
            .ok_or_else(|| PoolError::InvalidRequest("missing 'action' field".to_string()))?;

        if !KNOWN_ACTIONS.contains(&action) {
            return Err(PoolError::UnknownAction(action.to_string()));
        }

        let request: Request = serde_json::from_value(value)
            .map_err(|e| PoolError::InvalidRequest(e.to_string()))?;

        request.validate()?;
        Ok(request)
    }

    fn validate(&self) -> Result<()> {
        match self {
            Request::SendGps {
                host,
                port,
                message,
                ..
            } => {
                if host.trim().is_empty() {
                    return Err(PoolError::InvalidRequest("host cannot be empty".to_string()));
                }
                if *port == 0 {
                    return Err(PoolError::InvalidRequest("port cannot be zero".to_string()));
                }
                if message.is_empty() {
                    return Err(PoolError::InvalidRequest(
                        "message cannot be empty".to_string(),
                    ));
                }
            }
            Request::CloseConnection { host, .. } => {
                if host.trim().is_empty() {
                    return Err(PoolError::InvalidRequest("host cannot be empty".to_string()));
                }
            }
            _ => {}
        }
        Ok(())
    }

    pub fn action(&self) -> &'static str {
        match self {
            Request::SendGps { .. } => "send_gps",
            Request::GetStats => "get_stats",
            Request::GetMetrics => "get_metrics",
            Request::CloseConnection { .. } => "close_connection",
            Request::HealthCheck => "health_check",
            Request::GetConfig => "get_config",
        }
    }
}

/// Response envelope written back over the IPC socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub request_id: Uuid,
    pub processing_time_ms: f64,
    #[serde(flatten)]
    pub payload: Option<Payload>,
}

impl Envelope {
    pub fn ok(request_id: Uuid, processing_time_ms: f64, payload: Payload) -> Self {
        Self {
            success: true,
            error: None,
            request_id,
            processing_time_ms,
            payload: Some(payload),
        }
    }

    pub fn failure(request_id: Uuid, processing_time_ms: f64, error: &PoolError) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            request_id,
            processing_time_ms,
            payload: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    SendGps(SendGpsReply),
    Stats(StatsReply),
    Metrics(MetricsReply),
    Closed(ClosedReply),
    Health(HealthReport),
    Config(ConfigReply),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendGpsReply {
    /// Upstream reply decoded as UTF-8 (lossy).
    pub response: String,
    /// The same reply as lowercase hex of the raw bytes.
    pub hex_response: String,
    pub bytes_sent: usize,
    pub vehicle_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointCounters {
    pub success: u64,
    pub failed: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsReply {
    pub pool_size: usize,
    pub max_pool_size: usize,
    pub connection_stats: BTreeMap<String, EndpointCounters>,
    pub active_connections: Vec<String>,
    pub instance_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsReply {
    pub pool_size: usize,
    pub max_pool_size: usize,
    pub instance_id: Uuid,
    pub uptime_s: u64,
    /// Resident set size in bytes.
    pub memory_usage: u64,
    /// Peak resident set size in bytes.
    pub peak_memory: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedReply {
    pub endpoint: String,
    /// Whether an entry was actually present and torn down.
    pub closed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthChecks {
    pub ipc_socket: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_cache: Option<bool>,
    pub active_connections: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub instance_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigReply {
    pub max_pool_size: usize,
    pub connection_timeout_secs: u64,
    pub max_retries: u32,
    pub max_reply_bytes: usize,
    pub socket_path: String,
    pub metrics_enabled: bool,
    pub redis_enabled: bool,
    pub health_check_interval_secs: u64,
}
