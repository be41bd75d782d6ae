use anyhow::Context;
use paperless_host_lib::{
    init_stderr_tracing, init_tracing, ContextIsolation, EventRecord, Transport, TransportConfig,
    WorkerCommand, WorkerEvent,
};
use serde_json::Value;
use tokio::time::{interval, Duration};

const PING_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = TransportConfig::from_env().context("failed to load host config")?;
    let logging = match &config.log_dir {
        Some(log_dir) => init_tracing(log_dir),
        None => init_stderr_tracing(),
    };
    logging.context("failed to initialize logging")?;

    let transport = Transport::new(config).context("failed to build worker transport")?;
    let status = transport.start().await.context("failed to start worker")?;
    tracing::info!(
        worker_pid = ?status.pid,
        session_id = ?status.session_id,
        mode = transport.mode().as_str(),
        "worker ready"
    );

    let bridge = transport.bridge(ContextIsolation::Enabled);
    let _events = transport.bus().subscribe_all(log_worker_event);
    let _synced = transport.channel().once("syncCompleted", |data: &Value| {
        tracing::info!(data = %data, "initial document sync completed");
    });
    transport.channel().send_command(&WorkerCommand::SyncDocuments);

    let mut ticker = interval(PING_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => bridge.send(WorkerCommand::Ping.name(), None),
            signal = tokio::signal::ctrl_c() => {
                if let Err(error) = signal {
                    tracing::warn!(error = %error, "failed to listen for shutdown signal");
                }
                break;
            }
        }
    }

    tracing::info!("shutting down");
    transport.shutdown().await.context("failed to stop worker")?;
    Ok(())
}

fn log_worker_event(record: &EventRecord) {
    match WorkerEvent::from_record(record) {
        WorkerEvent::Pong(pong) => tracing::debug!(message = %pong.message, "worker answered ping"),
        WorkerEvent::Error(error) => tracing::warn!(message = %error.message, "worker reported an error"),
        WorkerEvent::SyncFailure(failure)
        | WorkerEvent::LoginFailure(failure)
        | WorkerEvent::GetDocumentsFailure(failure)
        | WorkerEvent::SetMainPathFailure(failure) => {
            tracing::warn!(event = %record.event, error = %failure.error, "worker command failed");
        }
        event if event.is_unknown() => {
            tracing::debug!(event = %record.event, "unrecognized worker event");
        }
        _ => tracing::trace!(event = %record.event, "worker event"),
    }
}
