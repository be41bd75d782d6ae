pub mod bus;
pub mod channel;
pub mod config;
pub mod errors;
pub mod framing;
pub mod gateway;
pub mod protocol;
pub mod supervisor;
pub mod transport;

pub use crate::bus::{EventBus, RecordSink, Subscription};
pub use crate::channel::{CommandChannel, CommandWriter, OutcomeSubscription};
pub use crate::config::{RestartPolicy, TransportConfig, WorkerMode};
pub use crate::errors::{TransportError, TransportResult};
pub use crate::framing::{Frame, FrameDecoder};
pub use crate::gateway::{BridgeApi, ContextIsolation, Gateway};
pub use crate::protocol::{Command, CommandFamily, EventRecord, WorkerCommand, WorkerEvent};
pub use crate::supervisor::{LaunchSpec, Supervisor, WorkerExit, WorkerStatus};
pub use crate::transport::Transport;

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

fn env_filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
}

/// JSON logs into a daily-rolling `host.log` under `log_dir`.
pub fn init_tracing(log_dir: &Path) -> TransportResult<()> {
    std::fs::create_dir_all(log_dir)?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "host.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| TransportError::Internal(error.to_string()))
}

pub fn init_stderr_tracing() -> TransportResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|error| TransportError::Internal(error.to_string()))
}
