use crate::bus::{EventBus, Subscription};
use crate::errors::{TransportError, TransportResult};
use crate::protocol::{failure_message, Command, CommandFamily, WorkerCommand};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Duration;

pub type WriteFuture<'a> = Pin<Box<dyn Future<Output = TransportResult<()>> + Send + 'a>>;

/// Sink for encoded commands; implemented by the supervisor.
pub trait CommandWriter: Send + Sync {
    fn write<'a>(&'a self, command: &'a Command) -> WriteFuture<'a>;
}

enum Outbound {
    Command(Command),
    Flush(oneshot::Sender<()>),
}

/// UI-facing facade: fire-and-forget `send` plus name-keyed subscriptions.
///
/// Commands are written by a single background task in the order they were
/// sent. Write failures are logged there and never reach the caller.
#[derive(Clone)]
pub struct CommandChannel {
    queue: mpsc::UnboundedSender<Outbound>,
    writer: Arc<dyn CommandWriter>,
    bus: EventBus,
    default_data: Value,
}

impl CommandChannel {
    /// Must be called inside a Tokio runtime; spawns the writer task.
    pub fn new(writer: Arc<dyn CommandWriter>, bus: EventBus, default_data: Value) -> Self {
        let (queue, receiver) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(writer.clone(), receiver));
        Self {
            queue,
            writer,
            bus,
            default_data,
        }
    }

    pub fn send(&self, command: &str, data: Option<Value>) {
        let command = match self.build(command, data) {
            Ok(command) => command,
            Err(error) => {
                tracing::warn!(command = %command.escape_debug(), error = %error, "dropping invalid command");
                return;
            }
        };
        if self.queue.send(Outbound::Command(command)).is_err() {
            tracing::warn!("command writer has shut down; command dropped");
        }
    }

    pub fn send_command(&self, command: &WorkerCommand) {
        self.send(command.name(), command.payload());
    }

    /// Writes after every previously queued command and returns the result.
    pub async fn try_send(&self, command: &str, data: Option<Value>) -> TransportResult<()> {
        let command = self.build(command, data)?;
        self.flush().await;
        self.writer.write(&command).await
    }

    /// Resolves once every command queued before this call has been handed
    /// to the writer.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.queue.send(Outbound::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    pub fn on_event<F>(&self, event: &str, callback: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.bus.subscribe(event, callback)
    }

    pub fn once<F>(&self, event: &str, callback: F) -> Subscription
    where
        F: FnOnce(&Value) + Send + 'static,
    {
        self.bus.subscribe_once(event, callback)
    }

    /// Waits for the next `event` record. Subscribe before sending the command
    /// that should trigger it; any record with that name resolves the wait.
    pub async fn wait_for(&self, event: &str, limit: Duration) -> TransportResult<Value> {
        let (data_tx, data_rx) = oneshot::channel();
        let subscription = self.bus.subscribe_once(event, move |data: &Value| {
            let _ = data_tx.send(data.clone());
        });

        let result = tokio::time::timeout(limit, data_rx).await;
        subscription.unsubscribe();

        match result {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(_)) => Err(TransportError::Closed(format!(
                "listener for '{}' was dropped",
                event
            ))),
            Err(_) => Err(TransportError::Timeout(format!(
                "no '{}' event within {} ms",
                event,
                limit.as_millis()
            ))),
        }
    }

    /// Delivers both halves of a success/failure event pair to one callback.
    pub fn on_outcome<F>(&self, family: &CommandFamily, callback: F) -> OutcomeSubscription
    where
        F: Fn(Result<&Value, String>) + Send + Sync + 'static,
    {
        let callback = Arc::new(callback);
        let success = {
            let callback = callback.clone();
            self.bus
                .subscribe(family.success_event.clone(), move |data: &Value| callback(Ok(data)))
        };
        let failure = self.bus.subscribe(family.failure_event.clone(), move |data: &Value| {
            callback(Err(failure_message(data)))
        });
        OutcomeSubscription { success, failure }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn default_data(&self) -> &Value {
        &self.default_data
    }

    fn build(&self, command: &str, data: Option<Value>) -> TransportResult<Command> {
        Command::new(command, data.unwrap_or_else(|| self.default_data.clone()))
    }
}

#[derive(Debug, Clone)]
#[must_use = "keep the subscription to be able to unsubscribe"]
pub struct OutcomeSubscription {
    success: Subscription,
    failure: Subscription,
}

impl OutcomeSubscription {
    pub fn unsubscribe(&self) {
        self.success.unsubscribe();
        self.failure.unsubscribe();
    }

    pub fn is_active(&self) -> bool {
        self.success.is_active() || self.failure.is_active()
    }
}

async fn run_writer(writer: Arc<dyn CommandWriter>, mut receiver: mpsc::UnboundedReceiver<Outbound>) {
    while let Some(message) = receiver.recv().await {
        match message {
            Outbound::Command(command) => {
                if let Err(error) = writer.write(&command).await {
                    tracing::warn!(
                        command = %command.command,
                        error = %error,
                        "failed to deliver command to worker"
                    );
                }
            }
            Outbound::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CommandChannel, CommandWriter, WriteFuture};
    use crate::bus::EventBus;
    use crate::errors::TransportError;
    use crate::protocol::{Command, CommandFamily, EventRecord, WorkerCommand};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::time::Duration;

    #[derive(Default)]
    struct RecordingWriter {
        lines: Mutex<Vec<String>>,
        broken: AtomicBool,
    }

    impl RecordingWriter {
        fn lines(&self) -> Vec<String> {
            self.lines.lock().expect("lines lock").clone()
        }
    }

    impl CommandWriter for RecordingWriter {
        fn write<'a>(&'a self, command: &'a Command) -> WriteFuture<'a> {
            Box::pin(async move {
                if self.broken.load(Ordering::SeqCst) {
                    return Err(TransportError::Write("broken pipe".to_string()));
                }
                let line = command.encode_line()?;
                self.lines.lock().expect("lines lock").push(line);
                Ok(())
            })
        }
    }

    fn channel(default_data: Value) -> (CommandChannel, Arc<RecordingWriter>) {
        let writer = Arc::new(RecordingWriter::default());
        let channel = CommandChannel::new(writer.clone(), EventBus::new(), default_data);
        (channel, writer)
    }

    #[tokio::test]
    async fn ping_without_data_writes_single_compact_line() {
        let (channel, writer) = channel(json!({}));
        channel.send("ping", None);
        channel.flush().await;
        assert_eq!(writer.lines(), vec!["{\"command\":\"ping\",\"data\":{}}\n".to_string()]);
    }

    #[tokio::test]
    async fn configured_sentinel_replaces_missing_data() {
        let (channel, writer) = channel(json!("empty"));
        channel.send("ping", None);
        channel.flush().await;
        assert_eq!(writer.lines(), vec!["{\"command\":\"ping\",\"data\":\"empty\"}\n".to_string()]);
    }

    #[tokio::test]
    async fn commands_are_written_in_send_order() {
        let (channel, writer) = channel(json!({}));
        channel.send("syncDocuments", None);
        channel.send_command(&WorkerCommand::GetDocuments { document_id: Some(4) });
        channel.send("setMainPath", Some(json!({ "path": "/docs" })));
        channel.flush().await;

        assert_eq!(
            writer.lines(),
            vec![
                "{\"command\":\"syncDocuments\",\"data\":{}}\n".to_string(),
                "{\"command\":\"getDocuments\",\"data\":{\"document_id\":4}}\n".to_string(),
                "{\"command\":\"setMainPath\",\"data\":{\"path\":\"/docs\"}}\n".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn write_failures_are_swallowed_by_send() {
        let (channel, writer) = channel(json!({}));
        writer.broken.store(true, Ordering::SeqCst);
        channel.send("ping", None);
        channel.flush().await;
        assert!(writer.lines().is_empty());

        writer.broken.store(false, Ordering::SeqCst);
        channel.send("ping", None);
        channel.flush().await;
        assert_eq!(writer.lines().len(), 1);
    }

    #[tokio::test]
    async fn try_send_surfaces_errors() {
        let (channel, writer) = channel(json!({}));
        assert!(matches!(
            channel.try_send("", None).await,
            Err(TransportError::InvalidCommand(_))
        ));

        writer.broken.store(true, Ordering::SeqCst);
        assert!(matches!(channel.try_send("ping", None).await, Err(TransportError::Write(_))));
    }

    #[tokio::test]
    async fn invalid_names_are_dropped_by_send() {
        let (channel, writer) = channel(json!({}));
        channel.send("  ", None);
        channel.flush().await;
        assert!(writer.lines().is_empty());
    }

    #[tokio::test]
    async fn repeated_on_event_calls_are_independent() {
        let (channel, _) = channel(json!({}));
        let hits = Arc::new(Mutex::new(Vec::new()));
        let make = |label: &'static str| {
            let hits = hits.clone();
            move |data: &Value| hits.lock().expect("hits lock").push(format!("{label}:{data}"))
        };

        let first = channel.on_event("pong", make("first"));
        let _second = channel.on_event("pong", make("second"));
        channel.bus().publish(&EventRecord::new("pong", json!(1)));
        first.unsubscribe();
        channel.bus().publish(&EventRecord::new("pong", json!(2)));

        assert_eq!(
            *hits.lock().expect("hits lock"),
            vec!["first:1".to_string(), "second:1".to_string(), "second:2".to_string()]
        );
    }

    #[tokio::test]
    async fn wait_for_resolves_with_next_matching_record() {
        let (channel, _) = channel(json!({}));
        let bus = channel.bus().clone();
        let waiter = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.wait_for("syncCompleted", Duration::from_secs(5)).await })
        };
        while bus.listener_count("syncCompleted") == 0 {
            tokio::task::yield_now().await;
        }
        bus.publish(&EventRecord::new("syncCompleted", json!({ "success": true, "count": 3 })));

        let data = waiter.await.expect("join").expect("event");
        assert_eq!(data["count"], json!(3));
        assert_eq!(bus.listener_count("syncCompleted"), 0);
    }

    #[tokio::test]
    async fn wait_for_times_out_and_cleans_up() {
        let (channel, _) = channel(json!({}));
        let error = channel
            .wait_for("pong", Duration::from_millis(20))
            .await
            .expect_err("timeout");
        assert!(matches!(error, TransportError::Timeout(_)));
        assert_eq!(channel.bus().listener_count("pong"), 0);
    }

    #[tokio::test]
    async fn outcome_listener_receives_success_and_failure() {
        let (channel, _) = channel(json!({}));
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let subscription = {
            let outcomes = outcomes.clone();
            channel.on_outcome(&CommandFamily::new("login"), move |result: Result<&Value, String>| {
                outcomes
                    .lock()
                    .expect("outcomes lock")
                    .push(result.map(|data| data["user"].clone()));
            })
        };

        channel.bus().publish(&EventRecord::new("loginSuccess", json!({ "success": true, "user": "ana" })));
        channel.bus().publish(&EventRecord::new("loginFailure", json!({ "success": false, "error": "Faltan credenciales" })));
        subscription.unsubscribe();
        channel.bus().publish(&EventRecord::new("loginSuccess", json!({ "user": "late" })));

        assert_eq!(
            *outcomes.lock().expect("outcomes lock"),
            vec![Ok(json!("ana")), Err("Faltan credenciales".to_string())]
        );
        assert!(!subscription.is_active());
    }
}
