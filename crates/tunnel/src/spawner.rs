use std::collections::HashSet;
use std::ffi::OsString;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::task::{JoinHandle, JoinSet};
use tunnel_protocol::{ErrorPayload, ExecRequest, Message, Question, DEFAULT_ERROR_STATUS};

use crate::child::ExecMode;
use crate::ipc;
use crate::transport::{Inbox, Incoming, Outbox};

/// Failure reported by a parent-side service.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct ServiceError {
    pub message: String,
    pub code: Option<String>,
    pub status: u16,
    pub data: Option<Value>,
}

impl ServiceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            status: DEFAULT_ERROR_STATUS,
            data: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(message).with_code("ENOTFOUND").with_status(404)
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    fn into_payload(self, id: String) -> ErrorPayload {
        ErrorPayload::reply_to(id, self.message)
            .with_code(self.code)
            .with_status(self.status)
    }
}

#[async_trait]
pub trait ServiceDispatcher: Send + Sync {
    async fn call(&self, path: &str, data: Value) -> Result<Value, ServiceError>;
}

#[async_trait]
pub trait Prompter: Send + Sync {
    async fn ask(&self, question: Question) -> anyhow::Result<Value>;
}

pub trait TelemetrySink: Send + Sync {
    fn record(&self, payload: Value);
}

/// Records telemetry as tracing events.
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn record(&self, payload: Value) {
        tracing::info!(target: "telemetry", %payload, "legacy telemetry");
    }
}

/// Where the child's stdout and stderr go.
pub enum OutputMode {
    Relay {
        stdout: Box<dyn AsyncWrite + Send + Unpin>,
        stderr: Box<dyn AsyncWrite + Send + Unpin>,
    },
    Log,
}

impl OutputMode {
    pub fn inherit() -> Self {
        OutputMode::Relay {
            stdout: Box::new(tokio::io::stdout()),
            stderr: Box::new(tokio::io::stderr()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("a legacy \"{key}\" process is already running")]
    Busy { key: String },

    #[error("failed to spawn {}: {source}", path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Remote(ErrorPayload),

    #[error("legacy process exited with code {code}")]
    Exited { code: i32 },

    #[error("legacy process was killed by signal {signal:?}")]
    Killed { signal: Option<i32> },
}

/// Launches the legacy bootstrap and serves its requests until it exits.
pub struct LegacySpawner {
    bootstrap: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    dispatcher: Arc<dyn ServiceDispatcher>,
    telemetry: Arc<dyn TelemetrySink>,
    active: Mutex<HashSet<String>>,
}

impl LegacySpawner {
    pub fn new(bootstrap: impl Into<PathBuf>, dispatcher: Arc<dyn ServiceDispatcher>) -> Self {
        Self {
            bootstrap: bootstrap.into(),
            args: Vec::new(),
            envs: Vec::new(),
            dispatcher,
            telemetry: Arc::new(TracingTelemetry),
            active: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Runs one legacy command to completion.
    ///
    /// Resolves with the `json` result the child sent, `None` when it exited cleanly without
    /// one, or the error it reported. Only one child runs per command and working directory.
    pub async fn run(
        &self,
        mode: ExecMode,
        request: ExecRequest,
        prompter: Option<Arc<dyn Prompter>>,
        output: OutputMode,
    ) -> Result<Option<Value>, SpawnError> {
        let _flight = self.claim(flight_key(mode, &request))?;

        let (parent_end, child_end) = ipc::socketpair()?;
        let mut cmd = Command::new(&self.bootstrap);
        cmd.args(&self.args)
            .envs(self.envs.iter().map(|(key, value)| (key, value)))
            .env("FORCE_COLOR", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &request.cwd {
            cmd.current_dir(cwd);
        }
        ipc::attach_child_end(&mut cmd, &child_end);

        let mut child = cmd.spawn().map_err(|source| SpawnError::Spawn {
            path: self.bootstrap.clone(),
            source,
        })?;
        drop(child_end);
        tracing::debug!(pid = child.id(), command = %request.command, "spawned legacy process");

        let output_tasks = forward_output(child.stdout.take(), child.stderr.take(), output);

        let (reader, writer) = parent_end.into_split();
        let outbox = Arc::new(Outbox::spawn(writer));
        let mut inbox = Inbox::new(reader);
        let mut handlers = JoinSet::new();
        let mut initial = Some(match mode {
            ExecMode::Exec => Message::Exec(request),
            ExecMode::Help => Message::Help(request),
        });
        let mut terminal: Option<Result<Value, ErrorPayload>> = None;

        while let Some(incoming) = inbox.next().await {
            let message = match incoming {
                Incoming::Message(message) => message,
                Incoming::Malformed { line, error } => {
                    tracing::debug!(%line, %error, "ignoring malformed message from legacy process");
                    continue;
                }
            };
            match message {
                Message::Ready { pid } => match initial.take() {
                    Some(payload) => {
                        tracing::debug!(pid, kind = payload.kind(), "legacy process ready");
                        send_reply(&outbox, payload);
                    }
                    None => tracing::debug!(pid, "ignoring repeated ready"),
                },
                Message::Call { id, path, data } => {
                    let dispatcher = Arc::clone(&self.dispatcher);
                    let outbox = Arc::clone(&outbox);
                    handlers.spawn(async move {
                        tracing::debug!(%path, "forwarding legacy call");
                        let reply = match dispatcher.call(&path, data).await {
                            Ok(response) => Message::Response { id, response },
                            Err(err) => Message::Error(err.into_payload(id)),
                        };
                        send_reply(&outbox, reply);
                    });
                }
                Message::Prompt { id, question } => match &prompter {
                    Some(prompter) => {
                        let prompter = Arc::clone(prompter);
                        let outbox = Arc::clone(&outbox);
                        handlers.spawn(async move {
                            let reply = match prompter.ask(question).await {
                                Ok(answer) => Message::Answer { id, answer },
                                Err(err) => Message::Error(ErrorPayload::reply_to(id, err.to_string())),
                            };
                            send_reply(&outbox, reply);
                        });
                    }
                    None => send_reply(
                        &outbox,
                        Message::Error(ErrorPayload::reply_to(id, "Prompting is not enabled")),
                    ),
                },
                Message::Log { args } => {
                    tracing::debug!(target: "legacy", "{}", format_log_args(&args));
                }
                Message::Telemetry { payload } => self.telemetry.record(payload),
                Message::Json { data } => settle(&mut terminal, Ok(data)),
                Message::Error(payload) => settle(&mut terminal, Err(payload)),
                other => tracing::debug!(kind = other.kind(), "ignoring unexpected message from legacy process"),
            }

            while let Some(finished) = handlers.try_join_next() {
                if let Err(err) = finished {
                    tracing::warn!(error = %err, "legacy request handler failed");
                }
            }
        }

        // the child is gone or has closed its end; in-flight requests have no one to answer
        handlers.shutdown().await;
        outbox.close().await;
        let status = child.wait().await?;
        for task in output_tasks {
            let _ = task.await;
        }
        finish(terminal, status)
    }

    fn claim(&self, key: String) -> Result<FlightGuard<'_>, SpawnError> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if !active.insert(key.clone()) {
            return Err(SpawnError::Busy { key });
        }
        Ok(FlightGuard {
            active: &self.active,
            key,
        })
    }
}

struct FlightGuard<'a> {
    active: &'a Mutex<HashSet<String>>,
    key: String,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        active.remove(&self.key);
    }
}

fn flight_key(mode: ExecMode, request: &ExecRequest) -> String {
    let cwd = request
        .cwd
        .as_ref()
        .map(|cwd| cwd.display().to_string())
        .unwrap_or_default();
    match mode {
        ExecMode::Exec => format!("exec:{}:{cwd}", request.command),
        ExecMode::Help => format!("help:{}:{cwd}", request.command),
    }
}

fn send_reply(outbox: &Outbox, message: Message) {
    if let Err(err) = outbox.send(message) {
        tracing::warn!(error = %err, "failed to reply to legacy process");
    }
}

fn settle(terminal: &mut Option<Result<Value, ErrorPayload>>, outcome: Result<Value, ErrorPayload>) {
    if terminal.is_some() {
        tracing::warn!("legacy process sent more than one result, ignoring");
        return;
    }
    *terminal = Some(outcome);
}

fn finish(
    terminal: Option<Result<Value, ErrorPayload>>,
    status: ExitStatus,
) -> Result<Option<Value>, SpawnError> {
    match terminal {
        Some(Ok(data)) => Ok(Some(data)),
        Some(Err(payload)) => Err(SpawnError::Remote(payload)),
        None if status.success() => {
            tracing::warn!("legacy process exited cleanly without sending a result");
            Ok(None)
        }
        None => match status.code() {
            Some(code) => Err(SpawnError::Exited { code }),
            None => Err(SpawnError::Killed {
                signal: status.signal(),
            }),
        },
    }
}

fn format_log_args(args: &[Value]) -> String {
    args.iter()
        .map(|arg| match arg {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn forward_output<O, E>(stdout: Option<O>, stderr: Option<E>, mode: OutputMode) -> Vec<JoinHandle<()>>
where
    O: AsyncRead + Send + Unpin + 'static,
    E: AsyncRead + Send + Unpin + 'static,
{
    let mut tasks = Vec::new();
    match mode {
        OutputMode::Relay {
            stdout: out_sink,
            stderr: err_sink,
        } => {
            if let Some(stdout) = stdout {
                tasks.push(tokio::spawn(relay(stdout, out_sink)));
            }
            if let Some(stderr) = stderr {
                tasks.push(tokio::spawn(relay(stderr, err_sink)));
            }
        }
        OutputMode::Log => {
            if let Some(stdout) = stdout {
                tasks.push(tokio::spawn(async move {
                    let mut lines = BufReader::new(stdout).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        tracing::info!(target: "legacy::stdout", "{line}");
                    }
                }));
            }
            if let Some(stderr) = stderr {
                tasks.push(tokio::spawn(async move {
                    let mut lines = BufReader::new(stderr).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        tracing::warn!(target: "legacy::stderr", "{line}");
                    }
                }));
            }
        }
    }
    tasks
}

async fn relay<R>(mut source: R, mut sink: Box<dyn AsyncWrite + Send + Unpin>)
where
    R: AsyncRead + Unpin,
{
    if let Err(err) = tokio::io::copy(&mut source, &mut sink).await {
        tracing::debug!(error = %err, "legacy output relay stopped");
    }
    let _ = sink.flush().await;
}
