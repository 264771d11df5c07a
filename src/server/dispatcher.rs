use crate::pool::{connect_upstream, EndpointKey, PooledConnection};
use crate::protocol::{
    ClosedReply, ConfigReply, MetricsReply, Payload, Request, SendGpsReply, StatsReply,
};
use crate::server::{health, DaemonContext};
use crate::utils::error::{PoolError, Result};
use crate::utils::system;
use bytes::{BufMut, BytesMut};
use chrono::Utc;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Executes decoded IPC requests against the shared daemon state.
#[derive(Clone)]
pub struct Dispatcher {
    ctx: Arc<DaemonContext>,
}

impl Dispatcher {
    pub fn new(ctx: Arc<DaemonContext>) -> Self {
        Self { ctx }
    }

    pub async fn dispatch(&self, request: Request) -> Result<Payload> {
        match request {
            Request::SendGps {
                host,
                port,
                message,
                vehicle_id,
                options: _,
            } => self.handle_send_gps(host, port, message, vehicle_id).await,
            Request::GetStats => Ok(self.handle_get_stats()),
            Request::GetMetrics => Ok(self.handle_get_metrics()),
            Request::CloseConnection { host, port } => Ok(self.handle_close_connection(host, port)),
            Request::HealthCheck => Ok(Payload::Health(health::check(&self.ctx).await)),
            Request::GetConfig => Ok(self.handle_get_config()),
        }
    }

    async fn handle_send_gps(
        &self,
        host: String,
        port: u16,
        message: String,
        vehicle_id: String,
    ) -> Result<Payload> {
        let key = EndpointKey::new(host, port);

        match self.exchange(&key, message.as_bytes()).await {
            Ok((reply, bytes_sent)) => {
                self.ctx.stats.record_success(&key);
                Ok(Payload::SendGps(SendGpsReply {
                    response: String::from_utf8_lossy(&reply).into_owned(),
                    hex_response: hex::encode(&reply),
                    bytes_sent,
                    vehicle_id,
                    timestamp: Utc::now(),
                }))
            }
            Err(e) => {
                self.ctx.stats.record_failure(&key);
                Err(e)
            }
        }
    }

    /// One framed send/recv against the pooled connection for `key`.
    ///
    /// A miss (or a dead pooled socket) triggers a fresh connect. When the
    /// exchange itself fails the entry is dropped, one reconnect is made and
    /// the exchange retried exactly once; only that second failure surfaces.
    async fn exchange(&self, key: &EndpointKey, payload: &[u8]) -> Result<(Vec<u8>, usize)> {
        let settings = &self.ctx.config.pool;

        let mut conn = match self.ctx.pool.checkout(key) {
            Some(conn) => conn,
            None => PooledConnection::new(connect_upstream(key, settings).await?),
        };

        match self.send_recv(&mut conn.stream, payload).await {
            Ok(out) => {
                self.ctx.pool.checkin(key.clone(), conn);
                Ok(out)
            }
            Err(first_err) => {
                warn!(
                    endpoint = %key,
                    connection_id = %conn.connection_id,
                    error = %first_err,
                    "Upstream exchange failed, reconnecting once"
                );
                drop(conn);

                let mut fresh = PooledConnection::new(connect_upstream(key, settings).await?);
                match self.send_recv(&mut fresh.stream, payload).await {
                    Ok(out) => {
                        self.ctx.pool.checkin(key.clone(), fresh);
                        Ok(out)
                    }
                    Err(retry_err) => Err(retry_err),
                }
            }
        }
    }

    /// Write `payload` + CR, then read one reply of up to `max_reply_bytes`.
    async fn send_recv(&self, stream: &mut TcpStream, payload: &[u8]) -> Result<(Vec<u8>, usize)> {
        let io_timeout = self.ctx.config.pool.io_timeout();

        let mut frame = BytesMut::with_capacity(payload.len() + 1);
        frame.put_slice(payload);
        frame.put_u8(b'\r');

        match timeout(io_timeout, stream.write_all(&frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(PoolError::WriteFailed(e.to_string())),
            Err(_) => {
                return Err(PoolError::WriteFailed(format!(
                    "send timed out after {:?}",
                    io_timeout
                )))
            }
        }

        let mut reply = vec![0u8; self.ctx.config.pool.max_reply_bytes];
        let n = match timeout(io_timeout, stream.read(&mut reply)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(PoolError::ReadFailed(e.to_string())),
            Err(_) => {
                return Err(PoolError::ReadFailed(format!(
                    "receive timed out after {:?}",
                    io_timeout
                )))
            }
        };

        if n == 0 {
            return Err(PoolError::ReadFailed("connection closed by peer".to_string()));
        }

        reply.truncate(n);
        Ok((reply, frame.len()))
    }

    fn handle_get_stats(&self) -> Payload {
        let snapshot = self.ctx.pool.snapshot();
        Payload::Stats(StatsReply {
            pool_size: snapshot.size,
            max_pool_size: snapshot.max_size,
            connection_stats: self.ctx.stats.snapshot(),
            active_connections: snapshot.keys,
            instance_id: self.ctx.instance_id,
        })
    }

    fn handle_get_metrics(&self) -> Payload {
        let snapshot = self.ctx.pool.snapshot();
        Payload::Metrics(MetricsReply {
            pool_size: snapshot.size,
            max_pool_size: snapshot.max_size,
            instance_id: self.ctx.instance_id,
            uptime_s: self.ctx.uptime_secs(),
            memory_usage: system::memory_usage(),
            peak_memory: system::peak_memory(),
        })
    }

    fn handle_close_connection(&self, host: String, port: u16) -> Payload {
        let key = EndpointKey::new(host, port);
        let closed = self.ctx.pool.drop_entry(&key);
        debug!(endpoint = %key, closed, "close_connection");
        Payload::Closed(ClosedReply {
            endpoint: key.to_string(),
            closed,
        })
    }

    fn handle_get_config(&self) -> Payload {
        let config = &self.ctx.config;
        Payload::Config(ConfigReply {
            max_pool_size: config.pool.max_pool_size,
            connection_timeout_secs: config.pool.connection_timeout_secs,
            max_retries: config.pool.max_retries,
            max_reply_bytes: config.pool.max_reply_bytes,
            socket_path: self.ctx.socket_path.display().to_string(),
            metrics_enabled: config.metrics.enabled,
            redis_enabled: config.redis.enabled,
            health_check_interval_secs: config.server.health_check_interval_secs,
        })
    }
}
