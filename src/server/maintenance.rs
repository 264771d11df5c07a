//! Periodic daemon upkeep: idle eviction, metric snapshots and the health
//! self check. Each task runs on its own interval and stops when the
//! shutdown token fires; none of them ever blocks the accept loop.

use crate::metrics::MetricRecord;
use crate::protocol::HealthStatus;
use crate::server::{health, DaemonContext};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);
const METRICS_INTERVAL: Duration = Duration::from_secs(60);
const SNAPSHOT_TTL: Duration = Duration::from_secs(300);

pub fn spawn(ctx: Arc<DaemonContext>, shutdown: CancellationToken) {
    {
        let ctx = ctx.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            run_periodic(CLEANUP_INTERVAL, shutdown, move || {
                let ctx = ctx.clone();
                async move { cleanup_tick(&ctx) }
            })
            .await;
        });
    }

    {
        let ctx = ctx.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            run_periodic(METRICS_INTERVAL, shutdown, move || {
                let ctx = ctx.clone();
                async move { metrics_tick(&ctx).await }
            })
            .await;
        });
    }

    {
        let period = Duration::from_secs(ctx.config.server.health_check_interval_secs.max(1));
        tokio::spawn(async move {
            run_periodic(period, shutdown, move || {
                let ctx = ctx.clone();
                async move { health_tick(&ctx).await }
            })
            .await;
        });
    }
}

async fn run_periodic<F, Fut>(period: Duration, shutdown: CancellationToken, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick of tokio's interval fires immediately; skip it so the
    // task starts one full period after daemon start.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => tick().await,
        }
    }
}

fn cleanup_tick(ctx: &DaemonContext) {
    let evicted = ctx.pool.evict_expired();
    if evicted > 0 {
        info!(evicted, "Evicted idle-expired pooled connections");
    } else {
        debug!("Cleanup tick: no expired connections");
    }
}

async fn metrics_tick(ctx: &DaemonContext) {
    let snapshot = ctx.pool.snapshot();

    ctx.metrics
        .push_record(
            &MetricRecord::new(ctx.instance_id, "pool_size", snapshot.size as f64)
                .tag("max_pool_size", snapshot.max_size.to_string()),
        )
        .await;

    ctx.metrics
        .publish_snapshot(
            &json!({
                "instance_id": ctx.instance_id,
                "pool_size": snapshot.size,
                "max_pool_size": snapshot.max_size,
                "active_connections": snapshot.keys,
                "uptime_s": ctx.uptime_secs(),
            }),
            SNAPSHOT_TTL,
        )
        .await;
}

async fn health_tick(ctx: &DaemonContext) {
    let report = health::check(ctx).await;

    match report.status {
        HealthStatus::Healthy => debug!("Health check: healthy"),
        HealthStatus::Degraded => warn!("Health check: degraded (external cache unreachable)"),
        HealthStatus::Unhealthy => warn!(
            socket = %ctx.socket_path.display(),
            "Health check: unhealthy (IPC socket path missing)"
        ),
    }

    *ctx.last_health.write().await = Some(report);
}
