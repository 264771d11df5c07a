use crate::protocol::{HealthChecks, HealthReport, HealthStatus};
use crate::server::DaemonContext;
use chrono::Utc;

/// Run the daemon self check.
///
/// A missing IPC socket path makes the daemon unhealthy; an enabled but
/// unreachable external cache degrades it; otherwise it is healthy.
pub async fn check(ctx: &DaemonContext) -> HealthReport {
    let ipc_socket = ctx.socket_path.exists();

    let external_cache = if ctx.config.redis.enabled {
        Some(ctx.metrics.ping().await)
    } else {
        None
    };

    let status = if !ipc_socket {
        HealthStatus::Unhealthy
    } else if external_cache == Some(false) {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    };

    HealthReport {
        status,
        instance_id: ctx.instance_id,
        timestamp: Utc::now(),
        checks: HealthChecks {
            ipc_socket,
            external_cache,
            active_connections: ctx.pool.len(),
        },
    }
}
