use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("SPAWN_FAILED: {0}")]
    Spawn(String),
    #[error("WORKER_NOT_RUNNING: no worker process is active")]
    NotRunning,
    #[error("WORKER_ALREADY_RUNNING: a worker process is already active")]
    AlreadyRunning,
    #[error("WRITE_FAILED: {0}")]
    Write(String),
    #[error("INVALID_COMMAND: {0}")]
    InvalidCommand(String),
    #[error("CONFIG_INVALID: {0}")]
    Config(String),
    #[error("TIMEOUT: {0}")]
    Timeout(String),
    #[error("CHANNEL_CLOSED: {0}")]
    Closed(String),
    #[error("IO_FAILURE: {0}")]
    Io(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl From<std::io::Error> for TransportError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(value: serde_json::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<serde_yaml::Error> for TransportError {
    fn from(value: serde_yaml::Error) -> Self {
        Self::Config(value.to_string())
    }
}

impl From<anyhow::Error> for TransportError {
    fn from(value: anyhow::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

pub type TransportResult<T> = Result<T, TransportError>;
