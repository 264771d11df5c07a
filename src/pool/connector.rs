use crate::config::PoolSettings;
use crate::pool::entry::EndpointKey;
use crate::utils::error::{PoolError, Result};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

const RETRY_SLEEP: Duration = Duration::from_millis(100);

/// Open a fresh upstream TCP connection for `key`.
///
/// Resolution and socket setup problems surface as `socket_create_failed`;
/// refused, timed-out or unreachable connects surface as `connect_failed`.
/// Up to `max_retries` attempts are made, 100 ms apart. The returned stream
/// has keep-alive enabled and Nagle disabled.
pub async fn connect_upstream(key: &EndpointKey, settings: &PoolSettings) -> Result<TcpStream> {
    let addr = resolve(key).await?;

    let mut last_error = None;
    for attempt in 1..=settings.max_retries {
        trace!(endpoint = %key, attempt, "Connecting upstream");

        match timeout(settings.connect_timeout(), TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                configure_stream(key, &stream);
                debug!(endpoint = %key, attempt, "Upstream connection established");
                return Ok(stream);
            }
            Ok(Err(e)) => {
                last_error = Some(format!("{}: {}", key, e));
            }
            Err(_) => {
                last_error = Some(format!(
                    "{}: connect timed out after {:?}",
                    key,
                    settings.connect_timeout()
                ));
            }
        }

        if attempt < settings.max_retries {
            tokio::time::sleep(RETRY_SLEEP).await;
        }
    }

    Err(PoolError::ConnectFailed(last_error.unwrap_or_else(|| {
        format!("{}: no connect attempt was made", key)
    })))
}

async fn resolve(key: &EndpointKey) -> Result<SocketAddr> {
    let mut addrs = lookup_host((key.host.as_str(), key.port))
        .await
        .map_err(|e| PoolError::SocketCreateFailed(format!("{}: {}", key, e)))?;

    addrs
        .next()
        .ok_or_else(|| PoolError::SocketCreateFailed(format!("{}: no addresses resolved", key)))
}

fn configure_stream(key: &EndpointKey, stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!(endpoint = %key, error = %e, "Failed to set TCP_NODELAY on upstream socket");
    }

    let sock = socket2::SockRef::from(stream);
    if let Err(e) = sock.set_keepalive(true) {
        warn!(endpoint = %key, error = %e, "Failed to enable keep-alive on upstream socket");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolSettings;

    fn fast_settings() -> PoolSettings {
        PoolSettings {
            max_retries: 2,
            connect_timeout_ms: 500,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn connects_to_listening_endpoint() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let key = EndpointKey::new("127.0.0.1", addr.port());

        let accept = tokio::spawn(async move { listener.accept().await });
        let stream = connect_upstream(&key, &fast_settings()).await.unwrap();
        assert!(stream.peer_addr().is_ok());
        accept.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn refused_endpoint_reports_connect_failed() {
        // Port 1 is essentially never listening on loopback.
        let key = EndpointKey::new("127.0.0.1", 1);
        let err = connect_upstream(&key, &fast_settings()).await.unwrap_err();
        assert!(matches!(err, PoolError::ConnectFailed(_)));
        assert!(err.to_string().starts_with("connect_failed"));
    }

    #[tokio::test]
    async fn unresolvable_host_reports_socket_create_failed() {
        let key = EndpointKey::new("definitely-not-a-real-host.invalid", 9);
        let err = connect_upstream(&key, &fast_settings()).await.unwrap_err();
        assert!(matches!(err, PoolError::SocketCreateFailed(_)));
    }
}
