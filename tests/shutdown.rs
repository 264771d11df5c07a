//! Graceful shutdown: in-flight requests drain, pooled sockets close and
//! the IPC path is unlinked.

use serde_json::{json, Value};
use sockpool::config::Config;
use sockpool::server::PoolServer;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UnixStream};

async fn raw_request(socket_path: PathBuf, body: Vec<u8>) -> Value {
    let mut stream = UnixStream::connect(&socket_path).await.unwrap();
    stream.write_all(&body).await.unwrap();
    stream.shutdown().await.unwrap();

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    serde_json::from_slice(&raw).unwrap()
}

#[tokio::test]
async fn in_flight_request_completes_before_exit() {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("pool.sock");

    let mut config = Config::default();
    config.server.socket_path = socket_path.display().to_string();
    config.pool.max_retries = 1;

    let server = PoolServer::new(config).await.unwrap();
    let token = server.shutdown_token();
    let daemon = tokio::spawn(async move { server.run().await });

    // Slow peer: answers each frame only after a delay, so the request is
    // still in flight when shutdown fires.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let _peer = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 2048];
        let n = stream.read(&mut buf).await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        stream.write_all(&buf[..n]).await.unwrap();
    });

    let body = json!({
        "action": "send_gps",
        "host": "127.0.0.1",
        "port": addr.port(),
        "message": "SLOW",
        "vehicle_id": "V1",
    })
    .to_string()
    .into_bytes();

    let request = tokio::spawn(raw_request(socket_path.clone(), body));

    // Let the request reach the upstream, then ask for shutdown.
    tokio::time::sleep(Duration::from_millis(100)).await;
    token.cancel();

    // The daemon drains the handler rather than dropping it.
    let response = request.await.unwrap();
    assert_eq!(response["success"], true, "in-flight request lost: {}", response);
    assert_eq!(response["response"], "SLOW\r");

    tokio::time::timeout(Duration::from_secs(5), daemon)
        .await
        .expect("daemon did not stop in time")
        .unwrap()
        .unwrap();

    assert!(!socket_path.exists(), "IPC socket was not unlinked");
}

#[tokio::test]
async fn idle_daemon_stops_quickly_and_unlinks_socket() {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("pool.sock");

    let mut config = Config::default();
    config.server.socket_path = socket_path.display().to_string();

    let server = PoolServer::new(config).await.unwrap();
    assert!(socket_path.exists());

    let token = server.shutdown_token();
    let daemon = tokio::spawn(async move { server.run().await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    token.cancel();

    tokio::time::timeout(Duration::from_secs(2), daemon)
        .await
        .expect("daemon did not stop in time")
        .unwrap()
        .unwrap();

    assert!(!socket_path.exists());
}
