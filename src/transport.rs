use crate::bus::EventBus;
use crate::channel::CommandChannel;
use crate::config::{RestartPolicy, TransportConfig, WorkerMode};
use crate::errors::TransportResult;
use crate::gateway::{BridgeApi, ContextIsolation, Gateway};
use crate::supervisor::{Supervisor, WorkerExit, WorkerStatus};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::Duration;

const MIN_RESTART_DELAY_MS: u64 = 100;

/// Wires the supervisor, event bus and command channel into one owner.
///
/// Dropping the transport signals the worker to terminate and stops the
/// restart monitor; use [`Transport::shutdown`] to wait for the exit.
pub struct Transport {
    config: TransportConfig,
    mode: WorkerMode,
    bus: EventBus,
    supervisor: Supervisor,
    channel: CommandChannel,
    monitor: Option<JoinHandle<()>>,
}

impl Transport {
    /// Must be called inside a Tokio runtime.
    pub fn new(config: TransportConfig) -> TransportResult<Self> {
        config.validate()?;
        let mode = config.worker_mode();

        let bus = EventBus::new();
        let supervisor = Supervisor::new(
            config.worker.clone(),
            config.framing.clone(),
            Arc::new(bus.clone()),
        );
        let channel = CommandChannel::new(
            Arc::new(supervisor.clone()),
            bus.clone(),
            config.default_data.clone(),
        );

        let monitor = match config.restart {
            RestartPolicy::Never => None,
            RestartPolicy::OnFailure {
                max_attempts,
                backoff_ms,
                stable_after_ms,
            } => Some(tokio::spawn(monitor_restarts(
                supervisor.clone(),
                supervisor.subscribe_exits(),
                mode,
                RestartBudget {
                    max_attempts,
                    backoff_ms,
                    stable_after: Duration::from_millis(stable_after_ms),
                },
            ))),
        };

        Ok(Self {
            config,
            mode,
            bus,
            supervisor,
            channel,
            monitor,
        })
    }

    pub async fn start(&self) -> TransportResult<WorkerStatus> {
        self.supervisor.start(self.mode).await
    }

    pub async fn start_in(&self, mode: WorkerMode) -> TransportResult<WorkerStatus> {
        self.supervisor.start(mode).await
    }

    pub async fn restart(&self) -> TransportResult<WorkerStatus> {
        self.supervisor.restart(self.mode).await
    }

    pub async fn stop(&self) -> TransportResult<bool> {
        self.supervisor.stop().await
    }

    pub async fn status(&self) -> WorkerStatus {
        self.supervisor.status().await
    }

    /// Stops the restart monitor first, then the worker.
    pub async fn shutdown(mut self) -> TransportResult<()> {
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
        self.channel.flush().await;
        self.supervisor.stop().await?;
        tracing::info!("transport shut down");
        Ok(())
    }

    pub fn channel(&self) -> &CommandChannel {
        &self.channel
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Resolved when the transport was built; later `PAPERLESS_ENV` changes
    /// are not observed.
    pub fn mode(&self) -> WorkerMode {
        self.mode
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn bridge(&self, isolation: ContextIsolation) -> BridgeApi {
        Gateway::expose(&self.channel, isolation, self.config.bridge.boundary_capacity)
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
        self.supervisor.request_stop();
    }
}

pub(crate) fn restart_delay(backoff_ms: u64, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1);
    let multiplier: u64 = 1_u64.checked_shl(shift).unwrap_or(u64::MAX);
    Duration::from_millis(backoff_ms.saturating_mul(multiplier).max(MIN_RESTART_DELAY_MS))
}

#[derive(Debug, Clone, Copy)]
struct RestartBudget {
    max_attempts: u32,
    backoff_ms: u64,
    stable_after: Duration,
}

impl RestartBudget {
    /// Attempts already spent before restarting after `exit`. A clean exit,
    /// a requested stop, or a run that outlived `stable_after` starts over.
    fn spent(&self, attempts: u32, exit: &WorkerExit) -> u32 {
        if !exit.is_failure() || exit.uptime() >= self.stable_after {
            0
        } else {
            attempts
        }
    }
}

async fn monitor_restarts(
    supervisor: Supervisor,
    mut exits: broadcast::Receiver<WorkerExit>,
    mode: WorkerMode,
    budget: RestartBudget,
) {
    let max_attempts = budget.max_attempts;
    let mut attempts: u32 = 0;
    loop {
        let exit = match exits.recv().await {
            Ok(exit) => exit,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "restart monitor missed worker exit notifications");
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        attempts = budget.spent(attempts, &exit);
        if !exit.is_failure() {
            continue;
        }

        loop {
            if attempts >= max_attempts {
                tracing::error!(
                    generation = exit.generation,
                    attempts,
                    "worker restart attempts exhausted; leaving worker stopped"
                );
                break;
            }
            attempts += 1;

            let delay = restart_delay(budget.backoff_ms, attempts);
            tracing::warn!(
                generation = exit.generation,
                code = ?exit.code,
                attempt = attempts,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                "restarting worker after failure"
            );
            tokio::time::sleep(delay).await;

            if supervisor.is_running().await {
                break;
            }
            match supervisor.start(mode).await {
                Ok(status) => {
                    tracing::info!(generation = status.generation, attempt = attempts, "worker restarted");
                    break;
                }
                Err(error) => {
                    tracing::warn!(attempt = attempts, error = %error, "worker restart failed");
                }
            }
        }
    }
}
