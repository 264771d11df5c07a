//! CLI entry points. Every management command talks to a running daemon
//! over the same IPC protocol the client library uses; `start` runs the
//! daemon itself.

use crate::client::{PoolClient, SendOptions};
use crate::config::Config;
use crate::pool::EndpointKey;
use crate::server::PoolServer;
use crate::utils::pid::{read_pid_file, remove_pid_file, write_pid_file};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "sockpool")]
#[command(about = "Connection-pooling socket daemon for high-rate telemetry emission", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the daemon
    Start {
        /// Detach into the background
        #[arg(long)]
        daemon: bool,
        /// PID file path (overrides config)
        #[arg(long, value_name = "FILE")]
        pid_file: Option<PathBuf>,
    },
    /// Stop a running daemon
    Stop {
        #[arg(long, value_name = "FILE")]
        pid_file: Option<PathBuf>,
        /// SIGKILL if the daemon ignores SIGTERM
        #[arg(long)]
        force: bool,
        /// Seconds to wait for a clean exit
        #[arg(long, default_value_t = 10)]
        timeout: u64,
    },
    /// Stop then start the daemon
    Restart {
        #[arg(long)]
        daemon: bool,
        #[arg(long, value_name = "FILE")]
        pid_file: Option<PathBuf>,
    },
    /// Show whether the daemon is running
    Status {
        #[arg(long)]
        detailed: bool,
    },
    /// Show per-endpoint statistics
    Stats {
        /// Refresh every N seconds
        #[arg(long, value_name = "SECONDS")]
        watch: Option<u64>,
        #[arg(long, value_enum, default_value = "table")]
        format: OutputFormat,
    },
    /// Query daemon health
    Health {
        #[arg(long)]
        detailed: bool,
    },
    /// Inspect or manage pooled connections
    Pool {
        #[command(subcommand)]
        action: PoolCommand,
    },
    /// Send test frames through the daemon
    Test {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value_t = 7)]
        port: u16,
        #[arg(long, default_value_t = 1)]
        count: u32,
    },
    /// Show or validate configuration
    Config {
        #[command(subcommand)]
        action: ConfigCommand,
    },
    /// Continuously print pool metrics
    Monitor {
        #[arg(long, default_value_t = 5)]
        interval: u64,
    },
}

#[derive(Subcommand, Debug)]
pub enum PoolCommand {
    /// List active pooled connections
    List,
    /// Close the pooled connection for HOST:PORT (or all of them)
    Close {
        target: Option<String>,
        #[arg(long)]
        all: bool,
    },
    /// Prime a connection to HOST:PORT with a test probe
    WarmUp { target: String },
    /// Close every pooled connection
    Drain,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the daemon's effective configuration
    Show,
    /// Print a single configuration value
    Get { key: String },
    /// Check that the configuration loads and validates
    Validate,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum OutputFormat {
    Table,
    Json,
}

pub async fn run(cli: Cli, config: Config) -> Result<()> {
    match cli.command {
        Command::Start { daemon, pid_file } => {
            start(config, daemon, pid_file, cli.config.as_deref()).await
        }
        Command::Stop {
            pid_file,
            force,
            timeout,
        } => stop(&config, pid_file, force, timeout).await,
        Command::Restart { daemon, pid_file } => {
            // Best-effort stop; a daemon that is not running is fine.
            let _ = stop(&config, pid_file.clone(), false, 10).await;
            start(config, daemon, pid_file, cli.config.as_deref()).await
        }
        Command::Status { detailed } => status(&config, detailed).await,
        Command::Stats { watch, format } => stats(&config, watch, format).await,
        Command::Health { detailed } => health(&config, detailed).await,
        Command::Pool { action } => pool(&config, action).await,
        Command::Test { host, port, count } => test(&config, &host, port, count).await,
        Command::Config { action } => config_cmd(&config, cli.config.as_deref(), action).await,
        Command::Monitor { interval } => monitor(&config, interval).await,
    }
}

async fn start(
    mut config: Config,
    daemonize: bool,
    pid_file: Option<PathBuf>,
    config_file: Option<&Path>,
) -> Result<()> {
    if let Some(path) = &pid_file {
        config.server.pid_file = path.display().to_string();
    }

    if daemonize {
        return spawn_detached(&config, config_file);
    }

    let pid_path = config.server.pid_file.clone();
    let server = PoolServer::new(config).await?;
    write_pid_file(&pid_path)?;
    let token = server.shutdown_token();

    tokio::spawn(async move {
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
        let mut sigint =
            signal(SignalKind::interrupt()).expect("Failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully..."),
            _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully..."),
        }
        token.cancel();
    });

    let result = server.run().await;
    remove_pid_file(&pid_path);
    result.context("daemon terminated with an error")
}

/// Re-exec ourselves as a detached `start` child.
fn spawn_detached(config: &Config, config_file: Option<&Path>) -> Result<()> {
    let exe = std::env::current_exe().context("cannot locate own executable")?;

    let mut command = std::process::Command::new(exe);
    command
        .arg("start")
        .arg("--pid-file")
        .arg(&config.server.pid_file);
    if let Some(path) = config_file {
        command.arg("--config").arg(path);
    }

    let child = command
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .context("failed to spawn daemon process")?;

    println!("Daemon started (pid {})", child.id());
    println!("Socket: {}", config.server.socket_path);
    println!("PID file: {}", config.server.pid_file);
    Ok(())
}

async fn stop(
    config: &Config,
    pid_file: Option<PathBuf>,
    force: bool,
    timeout_secs: u64,
) -> Result<()> {
    let pid_path = pid_file.unwrap_or_else(|| PathBuf::from(&config.server.pid_file));

    let pid = read_pid_file(&pid_path)
        .with_context(|| daemon_diagnostics(config, &pid_path))?;
    let target = Pid::from_raw(pid as i32);

    if kill(target, None).is_err() {
        println!("Daemon (pid {}) is not running, removing stale PID file", pid);
        remove_pid_file(&pid_path);
        return Ok(());
    }

    kill(target, Signal::SIGTERM).with_context(|| format!("failed to signal pid {}", pid))?;
    println!("Sent SIGTERM to pid {}", pid);

    let deadline = Duration::from_secs(timeout_secs.max(1));
    let poll = Duration::from_millis(200);
    let mut waited = Duration::ZERO;
    while waited < deadline {
        if kill(target, None).is_err() {
            println!("Daemon stopped");
            return Ok(());
        }
        tokio::time::sleep(poll).await;
        waited += poll;
    }

    if force {
        kill(target, Signal::SIGKILL)
            .with_context(|| format!("failed to SIGKILL pid {}", pid))?;
        println!("Daemon killed (SIGKILL)");
        remove_pid_file(&pid_path);
        Ok(())
    } else {
        bail!(
            "daemon (pid {}) did not exit within {}s; retry with --force",
            pid,
            timeout_secs
        )
    }
}

async fn status(config: &Config, detailed: bool) -> Result<()> {
    let pid_path = Path::new(&config.server.pid_file);

    let pid = read_pid_file(pid_path).ok();
    let process_alive = pid
        .map(|p| kill(Pid::from_raw(p as i32), None).is_ok())
        .unwrap_or(false);

    let client = client_from(config);
    let report = client.health_check().await;

    match &report {
        Ok(value) => {
            println!(
                "Daemon: running (pid {})",
                pid.map(|p| p.to_string()).unwrap_or_else(|| "?".to_string())
            );
            println!("Status: {}", value["status"].as_str().unwrap_or("unknown"));
            println!(
                "Instance: {}",
                value["instance_id"].as_str().unwrap_or("unknown")
            );
            if detailed {
                println!("{}", pretty(value));
            }
            Ok(())
        }
        Err(_) if process_alive => {
            bail!(
                "daemon process is alive (pid {}) but the IPC socket is unresponsive\n{}",
                pid.unwrap_or(0),
                daemon_diagnostics(config, pid_path)
            )
        }
        Err(_) => {
            bail!("daemon is not running\n{}", daemon_diagnostics(config, pid_path))
        }
    }
}

async fn stats(config: &Config, watch: Option<u64>, format: OutputFormat) -> Result<()> {
    let client = client_from(config);

    loop {
        let value = client
            .get_stats()
            .await
            .with_context(|| daemon_diagnostics(config, Path::new(&config.server.pid_file)))?;

        match format {
            OutputFormat::Json => println!("{}", pretty(&value)),
            OutputFormat::Table => print_stats_table(&value),
        }

        match watch {
            Some(seconds) => tokio::time::sleep(Duration::from_secs(seconds.max(1))).await,
            None => break,
        }
    }
    Ok(())
}

fn print_stats_table(value: &Value) {
    println!(
        "Pool: {}/{} connections",
        value["pool_size"], value["max_pool_size"]
    );
    println!("{:<28} {:>8} {:>8} {:>8}", "ENDPOINT", "SUCCESS", "FAILED", "TOTAL");

    if let Some(stats) = value["connection_stats"].as_object() {
        for (endpoint, counters) in stats {
            println!(
                "{:<28} {:>8} {:>8} {:>8}",
                endpoint, counters["success"], counters["failed"], counters["total"]
            );
        }
    }

    if let Some(active) = value["active_connections"].as_array() {
        let keys: Vec<&str> = active.iter().filter_map(Value::as_str).collect();
        println!("Active: {}", if keys.is_empty() { "-".to_string() } else { keys.join(", ") });
    }
}

async fn health(config: &Config, detailed: bool) -> Result<()> {
    let client = client_from(config);
    let value = client
        .health_check()
        .await
        .with_context(|| daemon_diagnostics(config, Path::new(&config.server.pid_file)))?;

    let status = value["status"].as_str().unwrap_or("unknown");
    println!("Health: {}", status);
    if detailed {
        println!("{}", pretty(&value));
    }

    if status == "unhealthy" {
        bail!("daemon reports unhealthy");
    }
    Ok(())
}

async fn pool(config: &Config, action: PoolCommand) -> Result<()> {
    let client = client_from(config);

    match action {
        PoolCommand::List => {
            let value = client
                .get_stats()
                .await
                .with_context(|| daemon_diagnostics(config, Path::new(&config.server.pid_file)))?;
            match value["active_connections"].as_array() {
                Some(keys) if !keys.is_empty() => {
                    for key in keys {
                        println!("{}", key.as_str().unwrap_or("?"));
                    }
                }
                _ => println!("Pool is empty"),
            }
            Ok(())
        }
        PoolCommand::Close { target, all } => {
            if all {
                return drain(&client).await;
            }
            let target = target.context("pass HOST:PORT or --all")?;
            let key: EndpointKey = target.parse().map_err(anyhow::Error::msg)?;
            let value = client.close_connection(&key.host, key.port).await?;
            println!(
                "{} {}",
                key,
                if value["closed"].as_bool().unwrap_or(false) {
                    "closed"
                } else {
                    "was not pooled"
                }
            );
            Ok(())
        }
        PoolCommand::WarmUp { target } => {
            let key: EndpointKey = target.parse().map_err(anyhow::Error::msg)?;
            let value = client
                .send_gps(&key.host, key.port, "TEST", "warm-up", SendOptions::default())
                .await?;
            if value["success"].as_bool().unwrap_or(false) {
                println!("{} warmed up", key);
                Ok(())
            } else {
                bail!(
                    "warm-up of {} failed: {}",
                    key,
                    value["error"].as_str().unwrap_or("unknown error")
                )
            }
        }
        PoolCommand::Drain => drain(&client).await,
    }
}

async fn drain(client: &PoolClient) -> Result<()> {
    let stats = client.get_stats().await?;
    let keys: Vec<EndpointKey> = stats["active_connections"]
        .as_array()
        .map(|keys| {
            keys.iter()
                .filter_map(Value::as_str)
                .filter_map(|k| k.parse().ok())
                .collect()
        })
        .unwrap_or_default();

    if keys.is_empty() {
        println!("Pool is already empty");
        return Ok(());
    }

    for key in &keys {
        client.close_connection(&key.host, key.port).await?;
        println!("{} closed", key);
    }
    println!("Drained {} connections", keys.len());
    Ok(())
}

async fn test(config: &Config, host: &str, port: u16, count: u32) -> Result<()> {
    let client = client_from(config);
    let mut failures = 0u32;

    for i in 1..=count.max(1) {
        match client
            .send_gps(host, port, "TEST", "cli-test", SendOptions::default())
            .await
        {
            Ok(value) if value["success"].as_bool().unwrap_or(false) => {
                println!(
                    "[{}/{}] ok in {:.1} ms: {:?}",
                    i,
                    count,
                    value["duration_ms"].as_f64().unwrap_or(0.0),
                    value["response"].as_str().unwrap_or("")
                );
            }
            Ok(value) => {
                failures += 1;
                println!(
                    "[{}/{}] failed: {}",
                    i,
                    count,
                    value["error"].as_str().unwrap_or("unknown error")
                );
            }
            Err(e) => {
                failures += 1;
                println!("[{}/{}] failed: {}", i, count, e);
            }
        }
    }

    if failures > 0 {
        bail!("{}/{} test frames failed", failures, count);
    }
    Ok(())
}

async fn config_cmd(
    config: &Config,
    config_file: Option<&Path>,
    action: ConfigCommand,
) -> Result<()> {
    match action {
        ConfigCommand::Show => {
            // Prefer the running daemon's effective view; fall back to the
            // locally resolved configuration.
            let client = client_from(config);
            match client.get_config().await {
                Ok(value) => println!("{}", pretty(&value)),
                Err(_) => {
                    println!("# daemon unreachable, showing local configuration");
                    println!(
                        "{}",
                        toml::to_string_pretty(config)
                            .context("failed to render configuration")?
                    );
                }
            }
            Ok(())
        }
        ConfigCommand::Get { key } => {
            let client = client_from(config);
            let value = client
                .get_config()
                .await
                .with_context(|| daemon_diagnostics(config, Path::new(&config.server.pid_file)))?;
            match value.get(&key) {
                Some(v) => {
                    println!("{}", v);
                    Ok(())
                }
                None => bail!("unknown configuration key: {}", key),
            }
        }
        ConfigCommand::Validate => {
            let validated = match config_file {
                Some(path) => Config::from_file(path)?,
                None => Config::from_env()?,
            };
            validated.validate()?;
            println!("Configuration is valid");
            Ok(())
        }
    }
}

async fn monitor(config: &Config, interval: u64) -> Result<()> {
    let client = client_from(config);
    let period = Duration::from_secs(interval.max(1));

    loop {
        match client.get_metrics().await {
            Ok(value) => println!(
                "pool {}/{}  uptime {}s  rss {} KiB",
                value["pool_size"],
                value["max_pool_size"],
                value["uptime_s"],
                value["memory_usage"].as_u64().unwrap_or(0) / 1024
            ),
            Err(e) => println!("daemon unreachable: {}", e),
        }
        tokio::time::sleep(period).await;
    }
}

fn client_from(config: &Config) -> PoolClient {
    PoolClient::new(config.server.socket_path.clone(), config.client.clone())
}

fn daemon_diagnostics(config: &Config, pid_path: &Path) -> String {
    let pid_state = match read_pid_file(pid_path) {
        Ok(pid) => {
            if kill(Pid::from_raw(pid as i32), None).is_ok() {
                format!("{} (pid {}, process alive)", pid_path.display(), pid)
            } else {
                format!("{} (pid {}, process not found)", pid_path.display(), pid)
            }
        }
        Err(_) => format!("{} (missing or unreadable)", pid_path.display()),
    };

    let socket = Path::new(&config.server.socket_path);
    let socket_state = if socket.exists() {
        format!("{} (present)", socket.display())
    } else {
        format!("{} (missing)", socket.display())
    };

    format!("  PID file: {}\n  IPC socket: {}", pid_state, socket_state)
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
