use crate::config::Config;
use crate::metrics::MetricsStore;
use crate::pool::ConnectionPool;
use crate::protocol::{Envelope, Request, MAX_REQUEST_BYTES};
use crate::server::maintenance;
use crate::server::stats::StatsRegistry;
use crate::server::{DaemonContext, Dispatcher};
use crate::utils::error::{PoolError, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::RwLock;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Deadline for reading a single request from an IPC client.
const CLIENT_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// The connection-pool daemon: owns the IPC listener and the shared state.
pub struct PoolServer {
    ctx: Arc<DaemonContext>,
    listener: UnixListener,
    shutdown: CancellationToken,
}

impl PoolServer {
    pub async fn new(config: Config) -> Result<Self> {
        let instance_id = Uuid::new_v4();
        let (listener, socket_path) = bind_ipc_socket(Path::new(&config.server.socket_path))?;

        info!(
            instance_id = %instance_id,
            socket = %socket_path.display(),
            max_pool_size = config.pool.max_pool_size,
            "Socket pool daemon initialized"
        );

        let metrics = MetricsStore::connect(&config, instance_id).await;
        let pool = ConnectionPool::new(
            config.pool.max_pool_size,
            config.pool.connection_timeout(),
        );

        let ctx = Arc::new(DaemonContext {
            pool,
            stats: StatsRegistry::new(),
            metrics,
            instance_id,
            started_at: Instant::now(),
            socket_path,
            last_health: RwLock::new(None),
            config,
        });

        Ok(Self {
            ctx,
            listener,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn context(&self) -> Arc<DaemonContext> {
        self.ctx.clone()
    }

    /// Token that stops the accept loop when cancelled; hand a clone to a
    /// signal handler.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn socket_path(&self) -> &Path {
        &self.ctx.socket_path
    }

    /// Accept loop. Runs until the shutdown token fires, then drains
    /// in-flight handlers, closes every pooled socket and unlinks the IPC
    /// path.
    pub async fn run(&self) -> Result<()> {
        maintenance::spawn(self.ctx.clone(), self.shutdown.clone());

        let dispatcher = Dispatcher::new(self.ctx.clone());
        let tracker = TaskTracker::new();

        info!(socket = %self.ctx.socket_path.display(), "Accepting IPC connections");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        let dispatcher = dispatcher.clone();
                        tracker.spawn(async move {
                            handle_client(stream, dispatcher).await;
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept IPC connection");
                    }
                }
            }
        }

        info!("Shutdown requested, draining in-flight requests");
        tracker.close();
        tracker.wait().await;

        let closed = self.ctx.pool.close_all();
        info!(closed, "Closed pooled upstream connections");

        if let Err(e) = fs::remove_file(&self.ctx.socket_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    socket = %self.ctx.socket_path.display(),
                    error = %e,
                    "Failed to unlink IPC socket"
                );
            }
        }

        info!("Shutdown complete");
        Ok(())
    }
}

/// One request/response round trip per accepted client.
async fn handle_client(mut stream: UnixStream, dispatcher: Dispatcher) {
    let started = Instant::now();
    let request_id = Uuid::new_v4();

    let envelope = match read_request(&mut stream).await {
        Ok(raw) => match Request::parse(&raw) {
            Ok(request) => {
                let action = request.action();
                debug!(request_id = %request_id, action, "Handling request");
                match dispatcher.dispatch(request).await {
                    Ok(payload) => {
                        Envelope::ok(request_id, elapsed_ms(started), payload)
                    }
                    Err(e) => {
                        warn!(request_id = %request_id, action, error = %e, "Request failed");
                        Envelope::failure(request_id, elapsed_ms(started), &e)
                    }
                }
            }
            Err(e) => {
                warn!(request_id = %request_id, error = %e, "Rejected request");
                Envelope::failure(request_id, elapsed_ms(started), &e)
            }
        },
        Err(e) => {
            warn!(request_id = %request_id, error = %e, "Failed to read request");
            Envelope::failure(request_id, elapsed_ms(started), &e)
        }
    };

    let body = match serde_json::to_vec(&envelope) {
        Ok(body) => body,
        Err(e) => {
            error!(request_id = %request_id, error = %e, "Failed to encode response");
            return;
        }
    };

    // A client that hung up mid-flight just loses its response.
    if let Err(e) = stream.write_all(&body).await {
        debug!(request_id = %request_id, error = %e, "Client went away before response");
        return;
    }
    let _ = stream.shutdown().await;
}

async fn read_request(stream: &mut UnixStream) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; MAX_REQUEST_BYTES];
    let n = match timeout(CLIENT_READ_TIMEOUT, stream.read(&mut buf)).await {
        Ok(Ok(n)) => n,
        Ok(Err(e)) => return Err(PoolError::Io(e)),
        Err(_) => {
            return Err(PoolError::InvalidRequest(
                "timed out waiting for request".to_string(),
            ))
        }
    };

    if n == 0 {
        return Err(PoolError::InvalidRequest("empty request".to_string()));
    }

    buf.truncate(n);
    Ok(buf)
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

/// Bind the IPC listener, clearing a pre-existing socket file first.
///
/// An unremovable path is retried after a chmod; if it still cannot be
/// cleared the daemon falls back to `<base>_<pid>.sock` and logs the
/// substitution. The bound socket is opened up to mode 0666 so short-lived
/// sibling processes under other uids can reach it.
fn bind_ipc_socket(requested: &Path) -> Result<(UnixListener, PathBuf)> {
    let path = prepare_socket_path(requested);

    let listener = UnixListener::bind(&path).map_err(|e| {
        PoolError::Config(format!(
            "Failed to bind IPC socket {}: {}",
            path.display(),
            e
        ))
    })?;

    if let Err(e) = fs::set_permissions(&path, fs::Permissions::from_mode(0o666)) {
        warn!(socket = %path.display(), error = %e, "Failed to chmod IPC socket");
    }

    Ok((listener, path))
}

fn prepare_socket_path(requested: &Path) -> PathBuf {
    if !requested.exists() {
        return requested.to_path_buf();
    }

    if fs::remove_file(requested).is_ok() {
        debug!(socket = %requested.display(), "Removed stale IPC socket");
        return requested.to_path_buf();
    }

    let _ = fs::set_permissions(requested, fs::Permissions::from_mode(0o666));
    if fs::remove_file(requested).is_ok() {
        debug!(socket = %requested.display(), "Removed stale IPC socket after chmod");
        return requested.to_path_buf();
    }

    let fallback = pid_fallback_path(requested);
    warn!(
        requested = %requested.display(),
        fallback = %fallback.display(),
        "Cannot clear existing IPC socket path, using per-pid fallback"
    );
    fallback
}

fn pid_fallback_path(path: &Path) -> PathBuf {
    let pid = std::process::id();
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => {
            let stem = path.with_extension("");
            PathBuf::from(format!("{}_{}.{}", stem.display(), pid, ext))
        }
        None => PathBuf::from(format!("{}_{}", path.display(), pid)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_path_keeps_the_extension() {
        let fallback = pid_fallback_path(Path::new("/tmp/socket_pool_service.sock"));
        let expected = format!("/tmp/socket_pool_service_{}.sock", std::process::id());
        assert_eq!(fallback, PathBuf::from(expected));
    }

    #[test]
    fn fallback_path_without_extension_appends_pid() {
        let fallback = pid_fallback_path(Path::new("/tmp/poolsock"));
        let expected = format!("/tmp/poolsock_{}", std::process::id());
        assert_eq!(fallback, PathBuf::from(expected));
    }

    #[test]
    fn stale_socket_file_is_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.sock");
        std::fs::write(&path, b"stale").unwrap();

        let prepared = prepare_socket_path(&path);
        assert_eq!(prepared, path);
        assert!(!path.exists());
    }
}
