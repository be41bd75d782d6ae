use crate::bus::RecordSink;
use crate::channel::{CommandWriter, WriteFuture};
use crate::config::{FramingConfig, WorkerConfig, WorkerMode};
use crate::errors::{TransportError, TransportResult};
use crate::framing::{Frame, FrameDecoder};
use crate::protocol::Command;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command as ProcessCommand};
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

const STOP_GRACE_PERIOD: Duration = Duration::from_millis(1500);
const KILL_WAIT: Duration = Duration::from_secs(2);
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const EXIT_CHANNEL_CAPACITY: usize = 16;
const MAX_DIAGNOSTIC_LINE_BYTES: usize = 16 * 1024;

/// Fully resolved program invocation for a worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
        }
    }

    pub fn resolve(mode: WorkerMode, config: &WorkerConfig) -> TransportResult<Self> {
        match mode {
            WorkerMode::Development => {
                let root = match &config.project_root {
                    Some(root) => root.clone(),
                    None => std::env::current_dir()?,
                };
                let entry = root.join(&config.entry_point);
                if !entry.is_file() {
                    return Err(TransportError::Spawn(format!(
                        "worker entry point not found: {}",
                        entry.display()
                    )));
                }
                let mut args = vec![entry.to_string_lossy().to_string()];
                args.extend(config.args.iter().cloned());
                Ok(Self {
                    program: PathBuf::from(&config.interpreter),
                    args,
                    cwd: Some(root),
                    env: config.env.clone(),
                })
            }
            WorkerMode::Packaged => {
                let dir = match &config.resources_dir {
                    Some(dir) => dir.clone(),
                    None => default_resources_dir()?,
                };
                let program = dir.join(packaged_executable_name(&config.executable_name));
                if !program.is_file() {
                    return Err(TransportError::Spawn(format!(
                        "packaged worker not found: {}",
                        program.display()
                    )));
                }
                Ok(Self {
                    program,
                    args: config.args.clone(),
                    cwd: None,
                    env: config.env.clone(),
                })
            }
        }
    }
}

pub fn packaged_executable_name(name: &str) -> String {
    if cfg!(windows) {
        format!("{name}.exe")
    } else {
        name.to_string()
    }
}

fn default_resources_dir() -> TransportResult<PathBuf> {
    let exe = std::env::current_exe()?;
    exe.parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| TransportError::Spawn("cannot locate the resources directory".to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatus {
    pub running: bool,
    pub pid: Option<u32>,
    pub generation: u64,
    pub session_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerExit {
    pub generation: u64,
    pub session_id: String,
    pub code: Option<i32>,
    /// The exit was caused by `stop`/`restart`, not by the worker itself.
    pub requested: bool,
    pub started_at: DateTime<Utc>,
    pub exited_at: DateTime<Utc>,
}

impl WorkerExit {
    pub fn is_failure(&self) -> bool {
        !self.requested && self.code != Some(0)
    }

    pub fn uptime(&self) -> Duration {
        (self.exited_at - self.started_at).to_std().unwrap_or_default()
    }
}

struct ActiveWorker {
    generation: u64,
    session_id: String,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    stdin: Option<Arc<Mutex<ChildStdin>>>,
    kill_tx: Option<oneshot::Sender<()>>,
    watcher: Option<JoinHandle<()>>,
}

struct SupervisorInner {
    worker: WorkerConfig,
    framing: FramingConfig,
    sink: Arc<dyn RecordSink>,
    active: Mutex<Option<ActiveWorker>>,
    decoder: StdMutex<FrameDecoder>,
    generation: AtomicU64,
    exits: broadcast::Sender<WorkerExit>,
}

/// Owns the single worker process: spawn, stdout decoding, stderr logging,
/// exit observation and stdin writes.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

impl Supervisor {
    pub fn new(worker: WorkerConfig, framing: FramingConfig, sink: Arc<dyn RecordSink>) -> Self {
        let (exits, _) = broadcast::channel(EXIT_CHANNEL_CAPACITY);
        let decoder = FrameDecoder::new(framing.max_pending_chars);
        Self {
            inner: Arc::new(SupervisorInner {
                worker,
                framing,
                sink,
                active: Mutex::new(None),
                decoder: StdMutex::new(decoder),
                generation: AtomicU64::new(0),
                exits,
            }),
        }
    }

    pub async fn start(&self, mode: WorkerMode) -> TransportResult<WorkerStatus> {
        let spec = LaunchSpec::resolve(mode, &self.inner.worker).map_err(|error| {
            tracing::error!(mode = mode.as_str(), error = %error, "failed to resolve worker executable");
            error
        })?;
        self.spawn(spec).await
    }

    pub async fn spawn(&self, spec: LaunchSpec) -> TransportResult<WorkerStatus> {
        let mut active = self.inner.active.lock().await;
        if active.is_some() {
            return Err(TransportError::AlreadyRunning);
        }

        let mut command = ProcessCommand::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }
        for (key, value) in &spec.env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|error| {
            tracing::error!(
                program = %spec.program.display(),
                error = %error,
                "failed to spawn worker process"
            );
            TransportError::Spawn(format!("failed to spawn {}: {}", spec.program.display(), error))
        })?;

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner
            .decoder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reset();

        let session_id = Uuid::new_v4().to_string();
        let pid = child.id();
        let started_at = Utc::now();
        let stdin = child.stdin.take().map(|stdin| Arc::new(Mutex::new(stdin)));

        let stdout_task = child.stdout.take().map(|stream| {
            let supervisor = self.clone();
            tokio::spawn(async move { supervisor.pump_stdout(generation, stream).await })
        });
        let stderr_task = child.stderr.take().map(|stream| {
            let supervisor = self.clone();
            tokio::spawn(async move { supervisor.pump_stderr(generation, stream).await })
        });

        let (kill_tx, kill_rx) = oneshot::channel();
        let watcher = tokio::spawn(self.clone().watch(
            generation,
            session_id.clone(),
            started_at,
            child,
            kill_rx,
            stdout_task,
            stderr_task,
        ));

        tracing::info!(
            worker_pid = ?pid,
            generation,
            session_id = %session_id,
            program = %spec.program.display(),
            "worker process started"
        );

        let status = WorkerStatus {
            running: true,
            pid,
            generation,
            session_id: Some(session_id.clone()),
            started_at: Some(started_at),
        };
        *active = Some(ActiveWorker {
            generation,
            session_id,
            pid,
            started_at,
            stdin,
            kill_tx: Some(kill_tx),
            watcher: Some(watcher),
        });

        Ok(status)
    }

    /// Terminates the worker and waits until its exit has been processed.
    /// Returns `false` when no worker was running.
    pub async fn stop(&self) -> TransportResult<bool> {
        let worker = self.inner.active.lock().await.take();
        let Some(mut worker) = worker else {
            return Ok(false);
        };

        if let Some(kill_tx) = worker.kill_tx.take() {
            let _ = kill_tx.send(());
        }
        if let Some(stdin) = worker.stdin.take() {
            if let Ok(mut stdin) = stdin.try_lock() {
                let _ = stdin.shutdown().await;
            }
        }
        if let Some(watcher) = worker.watcher.take() {
            watcher.await.map_err(|error| {
                TransportError::Internal(format!("worker watcher task failed: {}", error))
            })?;
        }

        Ok(true)
    }

    pub async fn restart(&self, mode: WorkerMode) -> TransportResult<WorkerStatus> {
        self.stop().await?;
        self.start(mode).await
    }

    /// Signals the running worker to terminate without waiting for it.
    pub fn request_stop(&self) {
        if let Ok(mut active) = self.inner.active.try_lock() {
            if let Some(kill_tx) = active.as_mut().and_then(|worker| worker.kill_tx.take()) {
                let _ = kill_tx.send(());
            }
        }
    }

    /// Serializes `command` as one line and writes it to the worker's stdin.
    pub async fn write(&self, command: &Command) -> TransportResult<()> {
        let line = command.encode_line()?;
        let (stdin, generation) = {
            let active = self.inner.active.lock().await;
            let worker = active.as_ref().ok_or(TransportError::NotRunning)?;
            let stdin = worker.stdin.clone().ok_or(TransportError::NotRunning)?;
            (stdin, worker.generation)
        };

        let mut stdin = stdin.lock().await;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|error| TransportError::Write(format!("failed to write to worker stdin: {}", error)))?;
        stdin
            .flush()
            .await
            .map_err(|error| TransportError::Write(format!("failed to flush worker stdin: {}", error)))?;

        tracing::debug!(command = %command.command, generation, "command written to worker");
        Ok(())
    }

    pub async fn status(&self) -> WorkerStatus {
        let active = self.inner.active.lock().await;
        match active.as_ref() {
            Some(worker) => WorkerStatus {
                running: true,
                pid: worker.pid,
                generation: worker.generation,
                session_id: Some(worker.session_id.clone()),
                started_at: Some(worker.started_at),
            },
            None => WorkerStatus {
                running: false,
                pid: None,
                generation: self.inner.generation.load(Ordering::SeqCst),
                session_id: None,
                started_at: None,
            },
        }
    }

    pub async fn is_running(&self) -> bool {
        self.inner.active.lock().await.is_some()
    }

    pub fn subscribe_exits(&self) -> broadcast::Receiver<WorkerExit> {
        self.inner.exits.subscribe()
    }

    async fn pump_stdout<R: AsyncRead + Unpin>(self, generation: u64, mut stream: R) {
        let mut chunk = vec![0_u8; self.inner.framing.read_chunk_bytes];
        loop {
            match stream.read(&mut chunk).await {
                Ok(0) => break,
                Ok(size) => self.on_output(generation, &chunk[..size]),
                Err(error) => {
                    tracing::warn!(generation, error = %error, "worker stdout read failed");
                    break;
                }
            }
        }
    }

    async fn pump_stderr<R: AsyncRead + Unpin>(self, generation: u64, mut stream: R) {
        let mut chunk = vec![0_u8; self.inner.framing.read_chunk_bytes];
        let mut pending = Vec::new();
        loop {
            match stream.read(&mut chunk).await {
                Ok(0) => {
                    if let Some(line) = take_diagnostic_remainder(&mut pending) {
                        self.on_error_output(generation, &line);
                    }
                    break;
                }
                Ok(size) => {
                    for line in split_diagnostic_lines(&mut pending, &chunk[..size]) {
                        self.on_error_output(generation, &line);
                    }
                }
                Err(error) => {
                    tracing::warn!(generation, error = %error, "worker stderr read failed");
                    break;
                }
            }
        }
    }

    pub(crate) fn on_output(&self, generation: u64, chunk: &[u8]) {
        if generation != self.inner.generation.load(Ordering::SeqCst) {
            tracing::debug!(generation, "ignoring output from a previous worker generation");
            return;
        }

        let frames = self
            .inner
            .decoder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .feed_bytes(chunk);

        for frame in frames {
            match frame {
                Frame::Record(record) => {
                    tracing::debug!(generation, event = %record.event, "worker event received");
                    self.inner.sink.publish(&record);
                }
                Frame::Malformed { fragment, reason } => {
                    tracing::warn!(
                        generation,
                        fragment = %fragment,
                        reason = %reason,
                        "discarding malformed worker output line"
                    );
                }
                Frame::Overflow { discarded_chars } => {
                    tracing::warn!(
                        generation,
                        discarded_chars,
                        "unterminated worker output exceeded the buffer ceiling; buffer cleared"
                    );
                }
            }
        }
    }

    pub(crate) fn on_error_output(&self, generation: u64, line: &str) {
        tracing::warn!(target: "worker.stderr", generation, line = %line, "worker diagnostic output");
    }

    async fn watch(
        self,
        generation: u64,
        session_id: String,
        started_at: DateTime<Utc>,
        mut child: Child,
        mut kill_rx: oneshot::Receiver<()>,
        stdout_task: Option<JoinHandle<()>>,
        stderr_task: Option<JoinHandle<()>>,
    ) {
        let (status, requested) = tokio::select! {
            biased;
            Ok(()) = &mut kill_rx => {
                terminate_then_kill(&mut child).await;
                (child.wait().await, true)
            }
            status = child.wait() => (status, false),
        };

        for task in [stdout_task, stderr_task].into_iter().flatten() {
            drain_output(task).await;
        }

        let code = match status {
            Ok(status) => {
                log_signal(generation, &status);
                status.code()
            }
            Err(error) => {
                tracing::warn!(generation, error = %error, "failed to collect worker exit status");
                None
            }
        };

        self.on_exit(WorkerExit {
            generation,
            session_id,
            code,
            requested,
            started_at,
            exited_at: Utc::now(),
        })
        .await;
    }

    pub(crate) async fn on_exit(&self, exit: WorkerExit) {
        let generation = exit.generation;
        let discarded = if generation == self.inner.generation.load(Ordering::SeqCst) {
            self.inner
                .decoder
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .reset()
        } else {
            0
        };

        {
            let mut active = self.inner.active.lock().await;
            if active.as_ref().map(|worker| worker.generation) == Some(generation) {
                *active = None;
            }
        }

        if discarded > 0 {
            tracing::warn!(generation, discarded_chars = discarded, "discarded unterminated worker output on exit");
        }
        let uptime_ms = exit.uptime().as_millis() as u64;
        if exit.requested {
            tracing::info!(generation, session_id = %exit.session_id, code = ?exit.code, uptime_ms, "worker process stopped");
        } else if exit.code == Some(0) {
            tracing::info!(generation, session_id = %exit.session_id, uptime_ms, "worker process exited");
        } else {
            tracing::warn!(
                generation,
                session_id = %exit.session_id,
                code = ?exit.code,
                uptime_ms,
                "worker process exited unexpectedly"
            );
        }

        let _ = self.inner.exits.send(exit);
    }
}

impl CommandWriter for Supervisor {
    fn write<'a>(&'a self, command: &'a Command) -> WriteFuture<'a> {
        Box::pin(Supervisor::write(self, command))
    }
}

/// Moves every complete line out of `pending`. A line that grows past
/// `MAX_DIAGNOSTIC_LINE_BYTES` without a newline is emitted as is.
pub(crate) fn split_diagnostic_lines(pending: &mut Vec<u8>, chunk: &[u8]) -> Vec<String> {
    pending.extend_from_slice(chunk);
    let mut lines = Vec::new();
    while let Some(pos) = pending.iter().position(|byte| *byte == b'\n') {
        let raw: Vec<u8> = pending.drain(..=pos).collect();
        push_diagnostic_line(&mut lines, &raw);
    }
    if pending.len() > MAX_DIAGNOSTIC_LINE_BYTES {
        let raw = std::mem::take(pending);
        push_diagnostic_line(&mut lines, &raw);
    }
    lines
}

fn take_diagnostic_remainder(pending: &mut Vec<u8>) -> Option<String> {
    let mut lines = Vec::new();
    push_diagnostic_line(&mut lines, &std::mem::take(pending));
    lines.pop()
}

fn push_diagnostic_line(lines: &mut Vec<String>, raw: &[u8]) {
    let line = String::from_utf8_lossy(raw);
    let line = line.trim_end();
    if !line.is_empty() {
        lines.push(line.to_string());
    }
}

async fn drain_output(mut task: JoinHandle<()>) {
    if timeout(OUTPUT_DRAIN_TIMEOUT, &mut task).await.is_err() {
        tracing::warn!("worker output pipe still open after exit; abandoning reader");
        task.abort();
    }
}

async fn terminate_then_kill(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        if let Some(pid) = child.id() {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
        if timeout(STOP_GRACE_PERIOD, child.wait()).await.is_ok() {
            return;
        }
    }

    let _ = child.start_kill();
    let _ = timeout(KILL_WAIT, child.wait()).await;
}

fn log_signal(generation: u64, status: &ExitStatus) {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            tracing::info!(generation, signal, "worker process terminated by signal");
        }
    }
    #[cfg(not(unix))]
    let _ = (generation, status);
}
