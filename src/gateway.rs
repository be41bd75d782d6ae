use crate::bus::{EventBus, Subscription};
use crate::channel::CommandChannel;
use serde_json::Value;
use tokio::sync::mpsc::{self, error::TrySendError};

const MAX_COMMAND_NAME_LEN: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextIsolation {
    /// Sends cross a bounded queue served by a privileged task.
    Enabled,
    /// The sandboxed context shares the host's address space; the API is
    /// handed over directly with the same contract.
    Unavailable,
}

struct BoundaryMessage {
    command: String,
    data: Option<Value>,
}

#[derive(Clone)]
enum Route {
    Boundary(mpsc::Sender<BoundaryMessage>),
    Direct(CommandChannel),
}

/// The only worker capability handed to the sandboxed UI: `send` and
/// `on_event`. It cannot spawn, stop, or address the worker process.
#[derive(Clone)]
pub struct BridgeApi {
    route: Route,
    events: EventBus,
}

impl BridgeApi {
    pub fn send(&self, command: &str, data: Option<Value>) {
        match &self.route {
            Route::Boundary(queue) => {
                let message = BoundaryMessage {
                    command: command.to_string(),
                    data,
                };
                match queue.try_send(message) {
                    Ok(()) => {}
                    Err(TrySendError::Full(message)) => {
                        tracing::warn!(command = %message.command, "bridge queue is full; command dropped");
                    }
                    Err(TrySendError::Closed(message)) => {
                        tracing::warn!(command = %message.command, "bridge is closed; command dropped");
                    }
                }
            }
            Route::Direct(channel) => forward(channel, command, data),
        }
    }

    pub fn on_event<F>(&self, event: &str, callback: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.events.subscribe(event, callback)
    }

    #[cfg(feature = "desktop")]
    pub(crate) fn forward_all<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&crate::protocol::EventRecord) + Send + Sync + 'static,
    {
        self.events.subscribe_all(callback)
    }
}

pub struct Gateway;

impl Gateway {
    /// Builds the UI-facing API. With isolation enabled this spawns the
    /// privileged task that serves the boundary queue, so it must run inside
    /// a Tokio runtime.
    pub fn expose(channel: &CommandChannel, isolation: ContextIsolation, capacity: usize) -> BridgeApi {
        let events = channel.bus().clone();
        match isolation {
            ContextIsolation::Enabled => {
                let (queue, receiver) = mpsc::channel(capacity.max(1));
                tokio::spawn(serve_boundary(channel.clone(), receiver));
                BridgeApi {
                    route: Route::Boundary(queue),
                    events,
                }
            }
            ContextIsolation::Unavailable => {
                tracing::warn!("context isolation unavailable; exposing the worker bridge directly");
                BridgeApi {
                    route: Route::Direct(channel.clone()),
                    events,
                }
            }
        }
    }
}

async fn serve_boundary(channel: CommandChannel, mut receiver: mpsc::Receiver<BoundaryMessage>) {
    while let Some(message) = receiver.recv().await {
        forward(&channel, &message.command, message.data);
    }
    tracing::debug!("bridge boundary closed");
}

fn forward(channel: &CommandChannel, command: &str, data: Option<Value>) {
    if !is_valid_command_name(command) {
        tracing::warn!(command = %command.escape_debug(), "bridge rejected command name");
        return;
    }
    channel.send(command, data);
}

fn is_valid_command_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_COMMAND_NAME_LEN
        && name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.' | ':'))
}

#[cfg(feature = "desktop")]
pub mod desktop {
    //! Tauri plugin that puts the bridge in front of the webview.

    use super::BridgeApi;
    use crate::bus::Subscription;
    use crate::protocol::EventRecord;
    use serde_json::Value;
    use tauri::plugin::{Builder, TauriPlugin};
    use tauri::{Emitter, Manager, Runtime};

    /// Every worker record is emitted to the webview under this name; the
    /// frontend filters by `record.event`.
    pub const WORKER_EVENT: &str = "worker-event";

    struct Forwarder(#[allow(dead_code)] Subscription);

    #[tauri::command]
    fn send_command(api: tauri::State<'_, BridgeApi>, command: String, data: Option<Value>) {
        api.send(&command, data);
    }

    pub fn init<R: Runtime>(api: BridgeApi) -> TauriPlugin<R> {
        Builder::new("worker")
            .invoke_handler(tauri::generate_handler![send_command])
            .setup(move |app, _plugin| {
                let handle = app.clone();
                let forwarder = api.forward_all(move |record: &EventRecord| {
                    if let Err(error) = handle.emit(WORKER_EVENT, record) {
                        tracing::warn!(event = %record.event, error = %error, "failed to forward worker event");
                    }
                });
                app.manage(api);
                app.manage(Forwarder(forwarder));
                Ok(())
            })
            .build()
    }
}
