use std::fmt;
use std::str::FromStr;
use std::time::Instant;
use tokio::net::TcpStream;
use tracing::trace;
use uuid::Uuid;

/// Index of the connection pool: one upstream `host:port` endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointKey {
    pub host: String,
    pub port: u16,
}

impl EndpointKey {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for EndpointKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("'{}' is not of the form host:port", s))?;

        if host.is_empty() {
            return Err(format!("'{}' has an empty host", s));
        }

        let port: u16 = port
            .parse()
            .map_err(|_| format!("'{}' has an invalid port", s))?;

        Ok(EndpointKey::new(host, port))
    }
}

/// A pooled upstream TCP connection plus its lifecycle metadata.
///
/// The socket is exclusively owned: while an entry is checked out of the
/// registry, no other task can touch the stream.
#[derive(Debug)]
pub struct PooledConnection {
    pub stream: TcpStream,
    pub created_at: Instant,
    pub last_used_at: Instant,
    pub usage_count: u64,
    pub connection_id: Uuid,
}

impl PooledConnection {
    pub fn new(stream: TcpStream) -> Self {
        let now = Instant::now();
        Self {
            stream,
            created_at: now,
            last_used_at: now,
            usage_count: 1,
            connection_id: Uuid::new_v4(),
        }
    }

    pub fn is_expired(&self, idle_ttl: std::time::Duration) -> bool {
        self.last_used_at.elapsed() > idle_ttl
    }

    /// Zero-timeout readiness probe.
    ///
    /// The socket counts as alive only when a non-blocking read would block:
    /// EOF means the peer closed, buffered bytes mean a stale reply is
    /// sitting on the wire and the next exchange would desynchronize, and
    /// any hard error means the handle is broken.
    pub fn is_alive(&self) -> bool {
        let mut probe = [0u8; 1];
        match self.stream.try_read(&mut probe) {
            Ok(0) => {
                trace!(connection_id = %self.connection_id, "Pooled socket closed by peer");
                false
            }
            Ok(_) => {
                trace!(
                    connection_id = %self.connection_id,
                    "Pooled socket has unread data, discarding"
                );
                false
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => true,
            Err(e) => {
                trace!(
                    connection_id = %self.connection_id,
                    error = %e,
                    "Pooled socket probe failed"
                );
                false
            }
        }
    }

    /// Refresh metadata on reuse: bump `usage_count`, touch `last_used_at`.
    pub fn touch(&mut self) {
        self.last_used_at = Instant::now();
        self.usage_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_renders_as_host_port() {
        let key = EndpointKey::new("tracker.example.com", 5027);
        assert_eq!(key.to_string(), "tracker.example.com:5027");
    }

    #[test]
    fn key_parses_from_host_port() {
        let key: EndpointKey = "10.1.2.3:8080".parse().unwrap();
        assert_eq!(key, EndpointKey::new("10.1.2.3", 8080));

        assert!("no-port".parse::<EndpointKey>().is_err());
        assert!(":1234".parse::<EndpointKey>().is_err());
        assert!("host:notaport".parse::<EndpointKey>().is_err());
    }

    #[tokio::test]
    async fn fresh_connection_is_alive() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let connect = tokio::spawn(async move { TcpStream::connect(addr).await });
        let (_server, _) = listener.accept().await.unwrap();
        let stream = connect.await.unwrap().unwrap();

        let conn = PooledConnection::new(stream);
        assert!(conn.is_alive());
        assert_eq!(conn.usage_count, 1);
    }

    #[tokio::test]
    async fn closed_connection_is_dead() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let connect = tokio::spawn(async move { TcpStream::connect(addr).await });
        let (server, _) = listener.accept().await.unwrap();
        let stream = connect.await.unwrap().unwrap();

        drop(server);
        // Give the FIN a moment to arrive.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let conn = PooledConnection::new(stream);
        assert!(!conn.is_alive());
    }

    #[tokio::test]
    async fn touch_updates_usage_metadata() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let connect = tokio::spawn(async move { TcpStream::connect(addr).await });
        let (_server, _) = listener.accept().await.unwrap();
        let stream = connect.await.unwrap().unwrap();

        let mut conn = PooledConnection::new(stream);
        let before = conn.last_used_at;
        conn.touch();
        assert_eq!(conn.usage_count, 2);
        assert!(conn.last_used_at >= before);
    }
}
