//! Client library tests against a live daemon: retry/circuit-breaker
//! behavior, the result cache and the batch sender.

use serde_json::Value;
use sockpool::client::{CircuitState, PoolClient, SendOptions};
use sockpool::config::{ClientSettings, Config};
use sockpool::server::PoolServer;
use sockpool::PoolError;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct TestDaemon {
    socket_path: PathBuf,
    token: CancellationToken,
    handle: JoinHandle<()>,
    _dir: tempfile::TempDir,
}

async fn start_daemon() -> TestDaemon {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("pool.sock");

    let mut config = Config::default();
    config.server.socket_path = socket_path.display().to_string();
    config.pool.max_retries = 1;
    config.pool.connect_timeout_ms = 500;

    let server = PoolServer::new(config).await.unwrap();
    let token = server.shutdown_token();
    let handle = tokio::spawn(async move {
        server.run().await.unwrap();
    });

    TestDaemon {
        socket_path,
        token,
        handle,
        _dir: dir,
    }
}

impl TestDaemon {
    async fn stop(self) {
        self.token.cancel();
        self.handle.await.unwrap();
    }
}

async fn spawn_echo() -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 2048];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    (addr, handle)
}

/// Reserve a loopback port that nothing is listening on.
async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

fn fast_client(socket_path: &PathBuf, tune: impl FnOnce(&mut ClientSettings)) -> PoolClient {
    let mut settings = ClientSettings {
        timeout_secs: 2,
        retry_attempts: 1,
        retry_delay_ms: 10,
        ..Default::default()
    };
    tune(&mut settings);
    PoolClient::new(socket_path.clone(), settings)
}

#[tokio::test]
async fn send_gps_round_trip_merges_duration() {
    let daemon = start_daemon().await;
    let (addr, _echo) = spawn_echo().await;
    let client = fast_client(&daemon.socket_path, |_| {});

    let response = client
        .send_gps(
            "127.0.0.1",
            addr.port(),
            "HELLO",
            "V7",
            SendOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(response["success"], true);
    assert_eq!(response["response"], "HELLO\r");
    assert_eq!(response["vehicle_id"], "V7");
    assert!(response["duration_ms"].as_f64().unwrap() >= 0.0);

    daemon.stop().await;
}

#[tokio::test]
async fn circuit_opens_then_half_open_probe_recovers() {
    let daemon = start_daemon().await;
    let port = free_port().await;

    let client = fast_client(&daemon.socket_path, |s| {
        s.cb_threshold = 3;
        s.cb_timeout_secs = 2;
    });

    // Three calls against a dead endpoint: the daemon answers each with a
    // connect failure, which the breaker counts.
    for _ in 0..3 {
        let response = client
            .send_gps("127.0.0.1", port, "X", "V1", SendOptions::default())
            .await
            .unwrap();
        assert_eq!(response["success"], false);
        assert!(response["error"]
            .as_str()
            .unwrap()
            .starts_with("connect_failed"));
    }

    assert_eq!(
        client.breaker_state("127.0.0.1", port),
        Some(CircuitState::Open)
    );

    // The fourth call fails fast without reaching the daemon.
    let err = client
        .send_gps("127.0.0.1", port, "X", "V1", SendOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::CircuitOpen(_)));

    // Endpoint comes back; after the open window the next call is the
    // half-open probe and closes the circuit again.
    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    let _echo = tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 2048];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    tokio::time::sleep(std::time::Duration::from_millis(2100)).await;

    let probe = client
        .send_gps("127.0.0.1", port, "PROBE", "V1", SendOptions::default())
        .await
        .unwrap();
    assert_eq!(probe["success"], true);
    assert_eq!(
        client.breaker_state("127.0.0.1", port),
        Some(CircuitState::Closed)
    );

    let next = client
        .send_gps("127.0.0.1", port, "AGAIN", "V1", SendOptions::default())
        .await
        .unwrap();
    assert_eq!(next["success"], true);

    daemon.stop().await;
}

#[tokio::test]
async fn result_cache_serves_repeat_sends() {
    let daemon = start_daemon().await;
    let (addr, _echo) = spawn_echo().await;

    let client = fast_client(&daemon.socket_path, |s| {
        s.cache_enabled = true;
        s.cache_ttl_secs = 60;
    });
    let options = SendOptions { use_cache: true };

    let first = client
        .send_gps("127.0.0.1", addr.port(), "CACHEME", "V1", options)
        .await
        .unwrap();
    assert_eq!(first["success"], true);
    assert!(first.get("cached").is_none());

    let second = client
        .send_gps("127.0.0.1", addr.port(), "CACHEME", "V1", options)
        .await
        .unwrap();
    assert_eq!(second["success"], true);
    assert_eq!(second["cached"], true);

    // A different payload bypasses the cached entry.
    let third = client
        .send_gps("127.0.0.1", addr.port(), "OTHER", "V1", options)
        .await
        .unwrap();
    assert!(third.get("cached").is_none());

    daemon.stop().await;
}

#[tokio::test]
async fn batch_send_reports_mixed_outcomes() {
    let daemon = start_daemon().await;
    let (addr, _echo) = spawn_echo().await;
    let dead_port = free_port().await;

    let client = fast_client(&daemon.socket_path, |s| {
        s.circuit_breaker_enabled = false;
    });

    let items = vec![
        sockpool::client::BatchItem {
            host: "127.0.0.1".to_string(),
            port: addr.port(),
            payload: "A".to_string(),
            vehicle_id: "V1".to_string(),
            options: None,
        },
        sockpool::client::BatchItem {
            host: "127.0.0.1".to_string(),
            port: dead_port,
            payload: "B".to_string(),
            vehicle_id: "V2".to_string(),
            options: None,
        },
        sockpool::client::BatchItem {
            host: "127.0.0.1".to_string(),
            port: addr.port(),
            payload: "C".to_string(),
            vehicle_id: "V3".to_string(),
            options: None,
        },
    ];

    let outcome = client.send_batch(items, 2).await;

    assert_eq!(outcome.summary.total, 3);
    assert_eq!(outcome.summary.successful, 2);
    assert_eq!(outcome.summary.failed, 1);
    assert!(outcome.summary.duration_ms >= 0.0);

    // Order follows the input, independent of completion order.
    assert_eq!(outcome.results[0]["response"], "A\r");
    assert_eq!(outcome.results[1]["success"], false);
    assert_eq!(outcome.results[2]["response"], "C\r");

    let successes = outcome
        .results
        .iter()
        .filter(|r| r["success"] == Value::Bool(true))
        .count();
    assert_eq!(successes, 2);

    daemon.stop().await;
}
