use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch, OnceCell};
use tunnel_protocol::{ErrorPayload, ExecRequest, Message, Question};

use crate::error::TunnelError;
use crate::pending::PendingRequests;
use crate::transport::{Inbox, Incoming, Outbox};

pub const AUTH_LIST_PATH: &str = "/amplify/2.x/auth";
pub const AUTH_LOGIN_PATH: &str = "/amplify/2.x/auth/login";

#[derive(Clone, Debug, Default)]
pub struct TunnelOptions {
    /// Bound on how long a `call` may wait for its reply. Prompts are never bounded.
    pub call_timeout: Option<Duration>,
}

/// The child's end of the tunnel: requests to the parent and fire-and-forget traffic.
pub struct ChildTunnel {
    outbox: Outbox,
    pending: PendingRequests,
    options: TunnelOptions,
    account: OnceCell<Value>,
}

impl ChildTunnel {
    pub fn new<W>(writer: W, options: TunnelOptions) -> Arc<Self>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Arc::new(Self {
            outbox: Outbox::spawn(writer),
            pending: PendingRequests::new(),
            options,
            account: OnceCell::new(),
        })
    }

    /// Invokes a service on the parent and waits for its response.
    pub async fn call(&self, path: &str, data: Value) -> Result<Value, TunnelError> {
        let path = path.to_string();
        self.request(
            move |id| Message::Call { id, path, data },
            self.options.call_timeout,
        )
        .await
    }

    /// Asks the parent to prompt the user. A parent that cannot prompt answers with an error.
    pub async fn ask(&self, question: Question) -> Result<Value, TunnelError> {
        self.request(move |id| Message::Prompt { id, question }, None)
            .await
    }

    pub fn log(&self, args: Vec<Value>) {
        if self.outbox.is_connected() {
            let _ = self.outbox.send(Message::Log { args });
        }
    }

    pub fn log_line(&self, line: impl Into<String>) {
        self.log(vec![Value::String(line.into())]);
    }

    pub fn telemetry(&self, payload: Value) {
        if self.outbox.is_connected() {
            let _ = self.outbox.send(Message::Telemetry { payload });
        }
    }

    /// The active account, logging in when there is none. Cached for the life of the tunnel.
    pub async fn get_account(&self) -> Result<Value, TunnelError> {
        self.account
            .get_or_try_init(|| async {
                let accounts = self.call(AUTH_LIST_PATH, Value::Null).await?;
                let accounts = accounts.as_array().cloned().unwrap_or_default();
                let picked = accounts
                    .iter()
                    .find(|account| account.get("active").and_then(Value::as_bool) == Some(true))
                    .or_else(|| accounts.first())
                    .cloned();
                match picked {
                    Some(account) => Ok(account),
                    None => self.call(AUTH_LOGIN_PATH, Value::Null).await,
                }
            })
            .await
            .cloned()
    }

    pub fn activity(&self) -> watch::Receiver<u64> {
        self.outbox.activity()
    }

    pub fn is_connected(&self) -> bool {
        self.outbox.is_connected()
    }

    /// Flushes queued envelopes, closes the channel and rejects whatever is still pending.
    pub async fn disconnect(&self) {
        self.outbox.close().await;
        let rejected = self.pending.close().await;
        if rejected > 0 {
            tracing::debug!(rejected, "rejected pending requests on disconnect");
        }
    }

    /// Settles the pending request a reply belongs to.
    pub async fn dispatch(&self, message: Message) {
        match message {
            Message::Response { id, response } => {
                self.pending.resolve(&id, response).await;
            }
            Message::Answer { id, answer } => {
                self.pending.resolve(&id, answer).await;
            }
            Message::Error(payload) => match payload.id.clone() {
                Some(id) => {
                    self.pending.reject(&id, TunnelError::Remote(payload)).await;
                }
                None => tracing::warn!(error = %payload, "parent reported an error"),
            },
            other => tracing::debug!(kind = other.kind(), "ignoring unexpected message from parent"),
        }
    }

    async fn request(
        &self,
        build: impl FnOnce(String) -> Message,
        limit: Option<Duration>,
    ) -> Result<Value, TunnelError> {
        if !self.outbox.is_connected() {
            return Err(TunnelError::Disconnected);
        }
        let (id, rx) = self.pending.register().await?;
        let message = build(id.clone());
        let kind = message.kind();
        if let Err(err) = self.outbox.send(message) {
            self.pending.forget(&id).await;
            return Err(err);
        }

        let reply = match limit {
            Some(after) => match tokio::time::timeout(after, rx).await {
                Ok(reply) => reply,
                Err(_) => {
                    self.pending.forget(&id).await;
                    return Err(TunnelError::Timeout { kind, after });
                }
            },
            None => rx.await,
        };
        reply.unwrap_or(Err(TunnelError::Disconnected))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecMode {
    Exec,
    Help,
}

#[derive(Debug)]
pub struct ExecOutcome {
    pub result: Value,
    pub exit_code: i32,
}

#[derive(Debug)]
pub struct ExecFailure {
    pub payload: ErrorPayload,
    pub exit_code: i32,
}

impl ExecFailure {
    pub fn new(payload: ErrorPayload) -> Self {
        Self {
            payload,
            exit_code: 1,
        }
    }
}

/// Runs the command named by an `exec`/`help` envelope inside the child.
#[async_trait]
pub trait ExecHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        tunnel: Arc<ChildTunnel>,
        mode: ExecMode,
        request: ExecRequest,
    ) -> Result<ExecOutcome, ExecFailure>;
}

/// Drives the child side of the tunnel until the command finishes, returning the exit code.
///
/// Announces readiness, runs the first `exec`/`help` it receives and keeps settling replies
/// while that command runs. The result goes back as `json` and a failure as `error`, after
/// which the channel is disconnected.
pub async fn serve<R, H>(tunnel: Arc<ChildTunnel>, reader: R, handler: Arc<H>) -> i32
where
    R: AsyncRead + Unpin,
    H: ExecHandler,
{
    let mut inbox = Inbox::new(reader);
    if let Err(err) = tunnel.outbox.send(Message::Ready {
        pid: std::process::id(),
    }) {
        tracing::warn!(error = %err, "failed to announce readiness");
        return 1;
    }

    let (done_tx, mut done_rx) = mpsc::channel::<i32>(1);
    let mut started = false;

    loop {
        tokio::select! {
            incoming = inbox.next() => {
                let Some(incoming) = incoming else { break };
                let message = match incoming {
                    Incoming::Message(message) => message,
                    Incoming::Malformed { line, error } => {
                        tracing::debug!(%line, %error, "ignoring malformed message from parent");
                        continue;
                    }
                };
                match message {
                    Message::Exec(request) | Message::Help(request) if started => {
                        tracing::warn!(command = %request.command, "a command is already running, ignoring");
                    }
                    Message::Exec(request) => {
                        started = true;
                        start_job(&tunnel, &handler, ExecMode::Exec, request, done_tx.clone());
                    }
                    Message::Help(request) => {
                        started = true;
                        start_job(&tunnel, &handler, ExecMode::Help, request, done_tx.clone());
                    }
                    other => tunnel.dispatch(other).await,
                }
            }
            Some(code) = done_rx.recv() => {
                return code;
            }
        }
    }

    // the parent went away: nothing can be answered anymore
    let rejected = tunnel.pending.close().await;
    if !started {
        tracing::warn!("IPC channel closed before a command was received");
        tunnel.disconnect().await;
        return 1;
    }
    tracing::debug!(rejected, "IPC channel closed while the command is running");
    drop(done_tx);
    done_rx.recv().await.unwrap_or(1)
}

fn start_job<H: ExecHandler>(
    tunnel: &Arc<ChildTunnel>,
    handler: &Arc<H>,
    mode: ExecMode,
    request: ExecRequest,
    done: mpsc::Sender<i32>,
) {
    let job = {
        let tunnel = Arc::clone(tunnel);
        let handler = Arc::clone(handler);
        tokio::spawn(async move { handler.handle(tunnel, mode, request).await })
    };
    let tunnel = Arc::clone(tunnel);
    tokio::spawn(async move {
        let outcome = match job.await {
            Ok(outcome) => outcome,
            Err(err) => Err(ExecFailure::new(ErrorPayload::new(format!(
                "legacy command aborted: {err}"
            )))),
        };
        let code = match outcome {
            Ok(ExecOutcome { result, exit_code }) => {
                if let Err(err) = tunnel.outbox.send(Message::Json { data: result }) {
                    tracing::warn!(error = %err, "failed to send command result");
                }
                tracing::debug!("Disconnecting IPC tunnel from parent and letting process exit gracefully");
                exit_code
            }
            Err(failure) => {
                if let Err(err) = tunnel.outbox.send(Message::Error(failure.payload)) {
                    tracing::warn!(error = %err, "failed to send command error");
                }
                failure.exit_code
            }
        };
        tunnel.disconnect().await;
        let _ = done.send(code).await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    struct FakeParent {
        inbox: Inbox<ReadHalf<DuplexStream>>,
        outbox: Outbox,
    }

    impl FakeParent {
        async fn recv(&mut self) -> Message {
            loop {
                match self.inbox.next().await {
                    Some(Incoming::Message(Message::Log { .. })) => continue,
                    Some(Incoming::Message(message)) => return message,
                    Some(Incoming::Malformed { line, .. }) => panic!("malformed: {line}"),
                    None => panic!("child closed the channel"),
                }
            }
        }
    }

    fn pair(options: TunnelOptions) -> (Arc<ChildTunnel>, ReadHalf<DuplexStream>, FakeParent) {
        let (child_io, parent_io) = tokio::io::duplex(64 * 1024);
        let (child_read, child_write): (ReadHalf<DuplexStream>, WriteHalf<DuplexStream>) =
            tokio::io::split(child_io);
        let (parent_read, parent_write) = tokio::io::split(parent_io);
        let tunnel = ChildTunnel::new(child_write, options);
        let parent = FakeParent {
            inbox: Inbox::new(parent_read),
            outbox: Outbox::spawn(parent_write),
        };
        (tunnel, child_read, parent)
    }

    async fn pump(tunnel: Arc<ChildTunnel>, reader: ReadHalf<DuplexStream>) {
        let mut inbox = Inbox::new(reader);
        while let Some(Incoming::Message(message)) = inbox.next().await {
            tunnel.dispatch(message).await;
        }
        tunnel.pending.close().await;
    }

    #[tokio::test]
    async fn concurrent_requests_resolve_by_id_not_arrival_order() {
        let (tunnel, reader, mut parent) = pair(TunnelOptions::default());
        tokio::spawn(pump(Arc::clone(&tunnel), reader));

        let call = {
            let tunnel = Arc::clone(&tunnel);
            tokio::spawn(async move { tunnel.call("/sdk/find", json!({ "name": "9.0.3.GA" })).await })
        };
        let ask = {
            let tunnel = Arc::clone(&tunnel);
            tokio::spawn(async move { tunnel.ask(Question::text("username", "Username:")).await })
        };

        let mut call_id = None;
        let mut prompt_id = None;
        for _ in 0..2 {
            match parent.recv().await {
                Message::Call { id, path, .. } => {
                    assert_eq!(path, "/sdk/find");
                    call_id = Some(id);
                }
                Message::Prompt { id, question } => {
                    assert_eq!(question.name, "username");
                    prompt_id = Some(id);
                }
                other => panic!("unexpected {other:?}"),
            }
        }

        parent
            .outbox
            .send(Message::Answer {
                id: prompt_id.expect("prompt id"),
                answer: json!("bob"),
            })
            .expect("send answer");
        parent
            .outbox
            .send(Message::Response {
                id: call_id.expect("call id"),
                response: json!({ "path": "/sdks/9.0.3.GA" }),
            })
            .expect("send response");

        assert_eq!(ask.await.expect("join").expect("answer"), json!("bob"));
        assert_eq!(
            call.await.expect("join").expect("response"),
            json!({ "path": "/sdks/9.0.3.GA" })
        );
    }

    #[tokio::test]
    async fn error_reply_rejects_with_remote_payload() {
        let (tunnel, reader, mut parent) = pair(TunnelOptions::default());
        tokio::spawn(pump(Arc::clone(&tunnel), reader));

        let call = {
            let tunnel = Arc::clone(&tunnel);
            tokio::spawn(async move { tunnel.call("/sdk/find", json!({})).await })
        };
        let Message::Call { id, .. } = parent.recv().await else {
            panic!("expected call");
        };
        parent
            .outbox
            .send(Message::Error(
                ErrorPayload::reply_to(id, "SDK not found").with_code(Some("ENOTFOUND".into())),
            ))
            .expect("send error");

        let err = call.await.expect("join").expect_err("rejected");
        assert_eq!(err.code(), Some("ENOTFOUND"));
        assert!(err.to_string().contains("SDK not found"));
    }

    #[tokio::test]
    async fn closing_the_channel_rejects_every_pending_request() {
        let (tunnel, reader, parent) = pair(TunnelOptions::default());
        let pump = tokio::spawn(pump(Arc::clone(&tunnel), reader));

        let mut calls = Vec::new();
        for index in 0..4 {
            let tunnel = Arc::clone(&tunnel);
            calls.push(tokio::spawn(async move {
                tunnel.call(&format!("/svc/{index}"), Value::Null).await
            }));
        }
        while tunnel.pending.len().await < 4 {
            tokio::task::yield_now().await;
        }

        drop(parent);
        pump.await.expect("pump");
        for call in calls {
            let err = call.await.expect("join").expect_err("rejected");
            assert!(err.is_disconnect());
        }
    }

    #[tokio::test]
    async fn call_times_out_when_configured() {
        let (tunnel, _reader, _parent) = pair(TunnelOptions {
            call_timeout: Some(Duration::from_millis(50)),
        });
        let err = tunnel.call("/slow", Value::Null).await.expect_err("timeout");
        assert!(matches!(err, TunnelError::Timeout { kind: "call", .. }));
        assert!(tunnel.pending.is_empty().await);
    }

    #[tokio::test]
    async fn log_and_telemetry_are_silent_after_disconnect() {
        let (tunnel, _reader, _parent) = pair(TunnelOptions::default());
        tunnel.disconnect().await;
        tunnel.log_line("after close");
        tunnel.telemetry(json!({ "event": "x" }));
        let err = tunnel.call("/x", Value::Null).await.expect_err("closed");
        assert!(err.is_disconnect());
    }

    #[tokio::test]
    async fn get_account_prefers_active_and_caches() {
        let (tunnel, reader, mut parent) = pair(TunnelOptions::default());
        tokio::spawn(pump(Arc::clone(&tunnel), reader));

        let first = {
            let tunnel = Arc::clone(&tunnel);
            tokio::spawn(async move { tunnel.get_account().await })
        };
        let Message::Call { id, path, .. } = parent.recv().await else {
            panic!("expected call");
        };
        assert_eq!(path, AUTH_LIST_PATH);
        parent
            .outbox
            .send(Message::Response {
                id,
                response: json!([{ "name": "a" }, { "name": "b", "active": true }]),
            })
            .expect("send");

        assert_eq!(first.await.expect("join").expect("account")["name"], json!("b"));
        // served from the cache, no second round trip
        assert_eq!(tunnel.get_account().await.expect("account")["name"], json!("b"));
    }

    #[tokio::test]
    async fn get_account_logs_in_when_no_accounts() {
        let (tunnel, reader, mut parent) = pair(TunnelOptions::default());
        tokio::spawn(pump(Arc::clone(&tunnel), reader));

        let account = {
            let tunnel = Arc::clone(&tunnel);
            tokio::spawn(async move { tunnel.get_account().await })
        };
        let Message::Call { id, .. } = parent.recv().await else {
            panic!("expected list call");
        };
        parent
            .outbox
            .send(Message::Response { id, response: json!([]) })
            .expect("send");
        let Message::Call { id, path, .. } = parent.recv().await else {
            panic!("expected login call");
        };
        assert_eq!(path, AUTH_LOGIN_PATH);
        parent
            .outbox
            .send(Message::Response {
                id,
                response: json!({ "name": "fresh" }),
            })
            .expect("send");

        assert_eq!(account.await.expect("join").expect("account")["name"], json!("fresh"));
    }

    struct EchoHandler;

    #[async_trait]
    impl ExecHandler for EchoHandler {
        async fn handle(
            &self,
            tunnel: Arc<ChildTunnel>,
            mode: ExecMode,
            request: ExecRequest,
        ) -> Result<ExecOutcome, ExecFailure> {
            if request.command == "explode" {
                return Err(ExecFailure::new(ErrorPayload::new("boom").with_status(400)));
            }
            let found = tunnel
                .call("/sdk/find", json!({ "name": "9.0.3.GA" }))
                .await
                .map_err(|err| ExecFailure::new(ErrorPayload::new(err.to_string())))?;
            Ok(ExecOutcome {
                result: json!({ "mode": format!("{mode:?}"), "found": found }),
                exit_code: 0,
            })
        }
    }

    #[tokio::test]
    async fn serve_runs_exec_and_sends_json_then_disconnects() {
        let (tunnel, reader, mut parent) = pair(TunnelOptions::default());
        let served = tokio::spawn(serve(tunnel, reader, Arc::new(EchoHandler)));

        assert!(matches!(parent.recv().await, Message::Ready { .. }));
        parent
            .outbox
            .send(Message::Exec(ExecRequest {
                command: "build".to_string(),
                sdk_path: "/sdks/9.0.3.GA".into(),
                ..ExecRequest::default()
            }))
            .expect("send exec");

        let Message::Call { id, .. } = parent.recv().await else {
            panic!("expected call");
        };
        parent
            .outbox
            .send(Message::Response { id, response: json!("ok") })
            .expect("send response");

        let Message::Json { data } = parent.recv().await else {
            panic!("expected json");
        };
        assert_eq!(data, json!({ "mode": "Exec", "found": "ok" }));
        assert!(parent.inbox.next().await.is_none());
        assert_eq!(served.await.expect("join"), 0);
    }

    #[tokio::test]
    async fn serve_reports_failure_as_error_envelope() {
        let (tunnel, reader, mut parent) = pair(TunnelOptions::default());
        let served = tokio::spawn(serve(tunnel, reader, Arc::new(EchoHandler)));

        assert!(matches!(parent.recv().await, Message::Ready { .. }));
        parent
            .outbox
            .send(Message::Help(ExecRequest {
                command: "explode".to_string(),
                ..ExecRequest::default()
            }))
            .expect("send help");

        let Message::Error(payload) = parent.recv().await else {
            panic!("expected error");
        };
        assert_eq!(payload.message, "boom");
        assert_eq!(payload.status, 400);
        assert_eq!(served.await.expect("join"), 1);
    }

    #[tokio::test]
    async fn serve_exits_non_zero_when_parent_leaves_first() {
        let (tunnel, reader, parent) = pair(TunnelOptions::default());
        drop(parent);
        assert_eq!(serve(tunnel, reader, Arc::new(EchoHandler)).await, 1);
    }
}
