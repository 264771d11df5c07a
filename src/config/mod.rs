use crate::utils::error::{PoolError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsSettings,
    #[serde(default)]
    pub redis: RedisSettings,
    #[serde(default)]
    pub client: ClientSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Filesystem path of the IPC listening socket.
    #[serde(default = "default_socket_path")]
    pub socket_path: String,
    #[serde(default = "default_pid_file")]
    pub pid_file: String,
    /// Interval between daemon self health checks (seconds).
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Hard cap on pooled upstream connections.
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: usize,
    /// Idle TTL for pooled connections (seconds).
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,
    /// Connect attempts before giving up on an upstream endpoint.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Per-attempt connect deadline (milliseconds).
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Send/receive deadline on upstream sockets (milliseconds).
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,
    /// Upper bound on a single upstream reply.
    #[serde(default = "default_max_reply_bytes")]
    pub max_reply_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Optional log file; stderr when unset.
    #[serde(default)]
    pub file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSettings {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_redis_host")]
    pub host: String,
    #[serde(default = "default_redis_port")]
    pub port: u16,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    /// IPC connect/read deadline (seconds).
    #[serde(default = "default_client_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Base delay for the linear retry backoff (milliseconds).
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_circuit_breaker_enabled")]
    pub circuit_breaker_enabled: bool,
    /// Consecutive failures before an endpoint's circuit opens.
    #[serde(default = "default_cb_threshold")]
    pub cb_threshold: u32,
    /// Seconds the circuit stays open before a half-open probe.
    #[serde(default = "default_cb_timeout")]
    pub cb_timeout_secs: u64,
    #[serde(default)]
    pub cache_enabled: bool,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
}

// Default values

fn default_socket_path() -> String {
    "/tmp/socket_pool_service.sock".to_string()
}

fn default_pid_file() -> String {
    "/tmp/socket_pool_service.pid".to_string()
}

fn default_health_check_interval() -> u64 {
    60
}

fn default_max_pool_size() -> usize {
    100
}

fn default_connection_timeout() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_connect_timeout_ms() -> u64 {
    2000
}

fn default_io_timeout_ms() -> u64 {
    2000
}

fn default_max_reply_bytes() -> usize {
    2048
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_redis_host() -> String {
    "127.0.0.1".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_client_timeout() -> u64 {
    5
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    100
}

fn default_circuit_breaker_enabled() -> bool {
    true
}

fn default_cb_threshold() -> u32 {
    5
}

fn default_cb_timeout() -> u64 {
    60
}

fn default_cache_ttl() -> u64 {
    60
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            pid_file: default_pid_file(),
            health_check_interval_secs: default_health_check_interval(),
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_pool_size: default_max_pool_size(),
            connection_timeout_secs: default_connection_timeout(),
            max_retries: default_max_retries(),
            connect_timeout_ms: default_connect_timeout_ms(),
            io_timeout_ms: default_io_timeout_ms(),
            max_reply_bytes: default_max_reply_bytes(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
        }
    }
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_redis_host(),
            port: default_redis_port(),
            password: None,
        }
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_client_timeout(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            circuit_breaker_enabled: default_circuit_breaker_enabled(),
            cb_threshold: default_cb_threshold(),
            cb_timeout_secs: default_cb_timeout(),
            cache_enabled: false,
            cache_ttl_secs: default_cache_ttl(),
        }
    }
}

impl PoolSettings {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

impl RedisSettings {
    /// Connection URL in the form redis://[:password@]host:port/.
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) if !password.is_empty() => {
                format!("redis://:{}@{}:{}/", password, self.host, self.port)
            }
            _ => format!("redis://{}:{}/", self.host, self.port),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then apply environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| PoolError::Config(format!("Failed to read config file: {}", e)))?;

        let mut config: Config = toml::from_str(&content)
            .map_err(|e| PoolError::Config(format!("Failed to parse config: {}", e)))?;

        config.apply_env();
        config.validate()?;

        Ok(config)
    }

    /// Build configuration from defaults plus environment overrides.
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Apply the SOCKET_POOL_* environment variables on top of current values.
    fn apply_env(&mut self) {
        env_parse("SOCKET_POOL_MAX_SIZE", &mut self.pool.max_pool_size);
        env_parse("SOCKET_POOL_TIMEOUT", &mut self.pool.connection_timeout_secs);
        env_parse("SOCKET_POOL_MAX_RETRIES", &mut self.pool.max_retries);
        env_string("SOCKET_POOL_UNIX_PATH", &mut self.server.socket_path);
        env_string("SOCKET_POOL_LOG_LEVEL", &mut self.logging.level);
        env_parse(
            "SOCKET_POOL_HEALTH_INTERVAL",
            &mut self.server.health_check_interval_secs,
        );
        env_bool("SOCKET_POOL_METRICS_ENABLED", &mut self.metrics.enabled);

        if let Ok(value) = std::env::var("SOCKET_POOL_LOG_FILE") {
            if !value.is_empty() {
                self.logging.file = Some(value);
            }
        }

        env_bool("SOCKET_POOL_REDIS_ENABLED", &mut self.redis.enabled);
        env_string("REDIS_HOST", &mut self.redis.host);
        env_parse("REDIS_PORT", &mut self.redis.port);
        if let Ok(value) = std::env::var("REDIS_PASSWORD") {
            if !value.is_empty() {
                self.redis.password = Some(value);
            }
        }

        env_parse("SOCKET_POOL_CLIENT_TIMEOUT", &mut self.client.timeout_secs);
        env_parse("SOCKET_POOL_RETRY_ATTEMPTS", &mut self.client.retry_attempts);
        env_parse("SOCKET_POOL_RETRY_DELAY", &mut self.client.retry_delay_ms);
        env_bool(
            "SOCKET_POOL_CIRCUIT_BREAKER",
            &mut self.client.circuit_breaker_enabled,
        );
        env_parse("SOCKET_POOL_CB_THRESHOLD", &mut self.client.cb_threshold);
        env_parse("SOCKET_POOL_CB_TIMEOUT", &mut self.client.cb_timeout_secs);
        env_bool("SOCKET_POOL_CACHE_ENABLED", &mut self.client.cache_enabled);
        env_parse("SOCKET_POOL_CACHE_TTL", &mut self.client.cache_ttl_secs);
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool.max_pool_size == 0 {
            return Err(PoolError::Config(
                "max_pool_size must be greater than 0".to_string(),
            ));
        }

        if self.pool.max_retries == 0 {
            return Err(PoolError::Config(
                "max_retries must be greater than 0".to_string(),
            ));
        }

        if self.pool.max_reply_bytes == 0 {
            return Err(PoolError::Config(
                "max_reply_bytes must be greater than 0".to_string(),
            ));
        }

        if self.server.socket_path.trim().is_empty() {
            return Err(PoolError::Config("socket_path cannot be empty".to_string()));
        }

        if self.client.retry_attempts == 0 {
            return Err(PoolError::Config(
                "retry_attempts must be greater than 0".to_string(),
            ));
        }

        if self.redis.enabled && self.redis.host.trim().is_empty() {
            return Err(PoolError::Config(
                "redis host cannot be empty when redis is enabled".to_string(),
            ));
        }

        Ok(())
    }
}

fn env_string(name: &str, slot: &mut String) {
    if let Ok(value) = std::env::var(name) {
        if !value.is_empty() {
            *slot = value;
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, slot: &mut T) {
    if let Ok(value) = std::env::var(name) {
        if let Ok(parsed) = value.trim().parse::<T>() {
            *slot = parsed;
        }
    }
}

fn env_bool(name: &str, slot: &mut bool) {
    if let Ok(value) = std::env::var(name) {
        match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => *slot = true,
            "0" | "false" | "no" | "off" => *slot = false,
            _ => {}
        }
    }
}
