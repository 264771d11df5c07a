use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("invalid_request: {0}")]
    InvalidRequest(String),

    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("socket_create_failed: {0}")]
    SocketCreateFailed(String),

    #[error("connect_failed: {0}")]
    ConnectFailed(String),

    #[error("write_failed: {0}")]
    WriteFailed(String),

    #[error("read_failed: {0}")]
    ReadFailed(String),

    #[error("circuit_open: {0}")]
    CircuitOpen(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal: {0}")]
    Internal(String),
}

impl PoolError {
    /// Short machine-readable code, stable on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            PoolError::InvalidJson(_) => "invalid_json",
            PoolError::InvalidRequest(_) => "invalid_request",
            PoolError::UnknownAction(_) => "unknown_action",
            PoolError::SocketCreateFailed(_) => "socket_create_failed",
            PoolError::ConnectFailed(_) => "connect_failed",
            PoolError::WriteFailed(_) => "write_failed",
            PoolError::ReadFailed(_) => "read_failed",
            PoolError::CircuitOpen(_) => "circuit_open",
            PoolError::Config(_) => "config",
            PoolError::Io(_) => "io",
            PoolError::Internal(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, PoolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_messages_carry_their_code_prefix() {
        let err = PoolError::ConnectFailed("127.0.0.1:1 refused".to_string());
        assert!(err.to_string().starts_with("connect_failed"));

        let err = PoolError::UnknownAction("frobnicate".to_string());
        assert_eq!(err.to_string(), "Unknown action: frobnicate");

        let err = PoolError::InvalidJson("expected value at line 1".to_string());
        assert!(err.to_string().starts_with("Invalid JSON"));
    }
}
