use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tokio_util::sync::CancellationToken;
use tunnel_protocol::{Message, MAX_MESSAGE_BYTES};

use crate::error::TunnelError;

/// Serial writer for one side of the channel.
///
/// Every envelope goes through a single task so write order matches send order. `send` never
/// blocks; once the channel is closed it fails immediately.
pub struct Outbox {
    tx: mpsc::UnboundedSender<Message>,
    connected: Arc<AtomicBool>,
    close: CancellationToken,
    writer: Mutex<Option<JoinHandle<()>>>,
    sent: AtomicU64,
    activity: watch::Sender<u64>,
}

impl Outbox {
    pub fn spawn<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(true));
        let close = CancellationToken::new();
        let handle = tokio::spawn(write_loop(writer, rx, close.clone(), Arc::clone(&connected)));
        let (activity, _) = watch::channel(0);
        Self {
            tx,
            connected,
            close,
            writer: Mutex::new(Some(handle)),
            sent: AtomicU64::new(0),
            activity,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn send(&self, message: Message) -> Result<(), TunnelError> {
        let kind = message.kind();
        if !self.is_connected() {
            return Err(TunnelError::SendClosed { kind });
        }
        self.tx
            .send(message)
            .map_err(|_| TunnelError::SendClosed { kind })?;
        let count = self.sent.fetch_add(1, Ordering::SeqCst) + 1;
        self.activity.send_replace(count);
        Ok(())
    }

    /// Ticks once per envelope sent.
    pub fn activity(&self) -> watch::Receiver<u64> {
        self.activity.subscribe()
    }

    /// Stops accepting envelopes, flushes what is queued and shuts the writer down.
    pub async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.close.cancel();
        let handle = self.writer.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn write_loop<W>(
    writer: W,
    mut rx: mpsc::UnboundedReceiver<Message>,
    close: CancellationToken,
    connected: Arc<AtomicBool>,
) where
    W: AsyncWrite + Send + Unpin + 'static,
{
    let mut sink = FramedWrite::new(writer, LinesCodec::new_with_max_length(MAX_MESSAGE_BYTES));
    loop {
        tokio::select! {
            biased;
            message = rx.recv() => {
                let Some(message) = message else { break };
                if let Err(err) = write_message(&mut sink, &message).await {
                    connected.store(false, Ordering::SeqCst);
                    tracing::warn!(error = %err, kind = message.kind(), "failed to write IPC message");
                    break;
                }
            }
            _ = close.cancelled() => {
                while let Ok(message) = rx.try_recv() {
                    if write_message(&mut sink, &message).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }
    connected.store(false, Ordering::SeqCst);
    let _ = SinkExt::<String>::close(&mut sink).await;
}

async fn write_message<W>(
    sink: &mut FramedWrite<W, LinesCodec>,
    message: &Message,
) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let line = serde_json::to_string(message)?;
    sink.send(line).await?;
    Ok(())
}

pub enum Incoming {
    Message(Message),
    Malformed { line: String, error: String },
}

/// Line-framed reader for the other side's envelopes.
pub struct Inbox<R> {
    lines: FramedRead<R, LinesCodec>,
}

impl<R> Inbox<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self {
            lines: FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_MESSAGE_BYTES)),
        }
    }

    /// Next envelope, or `None` once the channel is closed.
    pub async fn next(&mut self) -> Option<Incoming> {
        loop {
            let line = match self.lines.next().await? {
                Ok(line) => line,
                Err(err) => {
                    tracing::warn!(error = %err, "failed to read IPC message");
                    return None;
                }
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            return Some(match serde_json::from_str::<Message>(line) {
                Ok(message) => Incoming::Message(message),
                Err(err) => Incoming::Malformed {
                    line: line.to_string(),
                    error: err.to_string(),
                },
            });
        }
    }
}
