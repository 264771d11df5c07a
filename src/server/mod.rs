pub mod dispatcher;
pub mod health;
pub mod listener;
pub mod maintenance;
pub mod stats;

use crate::config::Config;
use crate::metrics::MetricsStore;
use crate::pool::ConnectionPool;
use crate::protocol::HealthReport;
use self::stats::StatsRegistry;
use std::path::PathBuf;
use std::time::Instant;
use tokio::sync::RwLock;
use uuid::Uuid;

pub use dispatcher::Dispatcher;
pub use listener::PoolServer;

/// Process-wide daemon state shared by the accept loop, the dispatcher and
/// the maintenance tasks.
pub struct DaemonContext {
    pub config: Config,
    pub pool: ConnectionPool,
    pub stats: StatsRegistry,
    pub metrics: MetricsStore,
    pub instance_id: Uuid,
    pub started_at: Instant,
    /// The path actually bound (may be the `<base>_<pid>` fallback).
    pub socket_path: PathBuf,
    /// Most recent periodic self check.
    pub last_health: RwLock<Option<HealthReport>>,
}

impl DaemonContext {
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
