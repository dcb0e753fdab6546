//! Framed JSON-RPC transport to the generation runtime.
//!
//! One message per line over a pair of byte streams. A dispatcher task is
//! the single writer of the pending-request table; a reader task frames and
//! classifies inbound bytes; a writer task serializes all outbound frames.
//! `Transport` itself is a cheap cloneable handle.

mod hub;
mod writer;

pub use hub::{NotificationHub, NotificationStream};

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, warn};

use weft_proto::codec::{FrameBuffer, encode_frame};
use weft_proto::rpc::{IncomingMessage, ProtocolError, RpcNotification, RpcRequest};

use crate::abort::AbortToken;
use crate::config::BridgeConfig;
use crate::error::BridgeError;
use writer::{WriterHandle, spawn_writer};

const INBOUND_DEPTH: usize = 1024;
const COMMAND_DEPTH: usize = 256;

/// Per-call options.
#[derive(Debug, Default, Clone)]
pub struct RequestOptions {
    /// Overrides the transport default timeout.
    pub timeout: Option<Duration>,
    /// Cancels the call at any suspension point.
    pub abort: Option<AbortToken>,
}

impl RequestOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            abort: None,
        }
    }
}

/// Counters over the lifetime of a transport.
///
/// At any quiescent point `issued == resolved + rejected + aborted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportMetrics {
    pub issued: u64,
    pub resolved: u64,
    pub rejected: u64,
    pub aborted: u64,
    pub notifications: u64,
}

#[derive(Default)]
struct Counters {
    issued: AtomicU64,
    resolved: AtomicU64,
    rejected: AtomicU64,
    aborted: AtomicU64,
    notifications: AtomicU64,
}

struct PendingEntry {
    method: String,
    reply: oneshot::Sender<Result<Value, BridgeError>>,
}

enum Command {
    Register {
        id: u64,
        method: String,
        reply: oneshot::Sender<Result<Value, BridgeError>>,
        ack: oneshot::Sender<Result<(), BridgeError>>,
    },
    Deregister {
        id: u64,
    },
    Close,
}

enum Inbound {
    Message(IncomingMessage),
    /// Reader stopped: EOF, I/O error, or framing overflow.
    Closed(String),
}

/// Handle to a running transport.
#[derive(Clone)]
pub struct Transport {
    cmd_tx: mpsc::Sender<Command>,
    writer: WriterHandle,
    hub: Arc<NotificationHub>,
    next_id: Arc<AtomicU64>,
    counters: Arc<Counters>,
    closed_rx: watch::Receiver<bool>,
    config: Arc<BridgeConfig>,
}

impl Transport {
    /// Start a transport over an outbound sink and an inbound source.
    ///
    /// For the real runtime these are the child's stdin and stdout (see
    /// [`crate::process`]); tests hand in in-memory pipes.
    pub fn spawn<W, R>(sink: W, source: R, config: BridgeConfig) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        let config = Arc::new(config);
        let writer = spawn_writer(sink, config.write_queue_depth);
        let hub = NotificationHub::new(config.notification_buffer);
        let counters = Arc::new(Counters::default());
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_DEPTH);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_DEPTH);
        let (closed_tx, closed_rx) = watch::channel(false);

        tokio::spawn(read_loop(
            source,
            config.max_frame_bytes,
            inbound_tx,
        ));
        tokio::spawn(dispatch_loop(
            cmd_rx,
            inbound_rx,
            Arc::clone(&hub),
            writer.clone(),
            closed_tx,
            Arc::clone(&counters),
            config.max_pending,
        ));

        Self {
            cmd_tx,
            writer,
            hub,
            next_id: Arc::new(AtomicU64::new(1)),
            counters,
            closed_rx,
            config,
        }
    }

    /// Issue a correlated request and await its result.
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        opts: RequestOptions,
    ) -> Result<Value, BridgeError> {
        self.counters.issued.fetch_add(1, Ordering::Relaxed);
        let out = self.request_inner(method, params, opts).await;
        match &out {
            Ok(_) => self.counters.resolved.fetch_add(1, Ordering::Relaxed),
            Err(BridgeError::Aborted) => self.counters.aborted.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.counters.rejected.fetch_add(1, Ordering::Relaxed),
        };
        out
    }

    async fn request_inner(
        &self,
        method: &str,
        params: Value,
        opts: RequestOptions,
    ) -> Result<Value, BridgeError> {
        if *self.closed_rx.borrow() {
            return Err(BridgeError::Closed);
        }
        let timeout = opts.timeout.unwrap_or(self.config.default_timeout);
        let deadline = Instant::now() + timeout;
        let abort = opts.abort;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = encode_frame(&RpcRequest::new(id, method, params))?;

        let (reply_tx, mut reply_rx) = oneshot::channel();
        let (ack_tx, ack_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Register {
                id,
                method: method.to_owned(),
                reply: reply_tx,
                ack: ack_tx,
            })
            .await
            .map_err(|_| BridgeError::Closed)?;
        ack_rx.await.map_err(|_| BridgeError::Closed)??;

        // Phase 1: the frame must reach the wire.
        let write_done = match self.writer.enqueue(frame).await {
            Ok(rx) => rx,
            Err(e) => {
                self.deregister(id);
                return Err(e);
            }
        };
        tokio::select! {
            outcome = write_done => {
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        self.deregister(id);
                        return Err(e);
                    }
                    Err(_) => {
                        self.deregister(id);
                        return Err(BridgeError::Closed);
                    }
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                self.deregister(id);
                return Err(BridgeError::Timeout { method: method.to_owned(), after: timeout });
            }
            _ = cancelled(&abort) => {
                self.deregister(id);
                return Err(BridgeError::Aborted);
            }
        }

        // Phase 2: await the correlated response.
        tokio::select! {
            reply = &mut reply_rx => reply.map_err(|_| BridgeError::Closed)?,
            _ = tokio::time::sleep_until(deadline) => {
                self.deregister(id);
                Err(BridgeError::Timeout { method: method.to_owned(), after: timeout })
            }
            _ = cancelled(&abort) => {
                self.deregister(id);
                Err(BridgeError::Aborted)
            }
        }
    }

    /// Fire-and-forget notification; resolves when the frame is flushed.
    pub async fn notify(&self, method: &str, params: Value) -> Result<(), BridgeError> {
        if *self.closed_rx.borrow() {
            return Err(BridgeError::Closed);
        }
        let frame = encode_frame(&RpcNotification::new(method, params))?;
        self.writer.write(frame).await
    }

    /// Subscribe to a notification method. The stream unsubscribes on drop.
    pub fn on_notification(&self, method: &str) -> NotificationStream {
        self.hub.subscribe(method)
    }

    /// Close the transport: pending requests reject with `Closed`, queued
    /// writes are rejected in order, every notification stream terminates.
    pub async fn close(&self) {
        let _ = self.cmd_tx.send(Command::Close).await;
    }

    /// Resolves once the transport has fully closed (any cause).
    pub async fn closed(&self) {
        let mut rx = self.closed_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    pub fn metrics(&self) -> TransportMetrics {
        TransportMetrics {
            issued: self.counters.issued.load(Ordering::Relaxed),
            resolved: self.counters.resolved.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            aborted: self.counters.aborted.load(Ordering::Relaxed),
            notifications: self.counters.notifications.load(Ordering::Relaxed),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    fn deregister(&self, id: u64) {
        match self.cmd_tx.try_send(Command::Deregister { id }) {
            Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
            Err(mpsc::error::TrySendError::Full(cmd)) => {
                let tx = self.cmd_tx.clone();
                tokio::spawn(async move {
                    let _ = tx.send(cmd).await;
                });
            }
        }
    }
}

/// Await an optional abort token; pends forever when absent.
async fn cancelled(token: &Option<AbortToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

async fn read_loop<R>(mut source: R, max_frame_bytes: usize, inbound_tx: mpsc::Sender<Inbound>)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut frames = FrameBuffer::new(max_frame_bytes);
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        match source.read(&mut buf).await {
            Ok(0) => {
                let _ = inbound_tx.send(Inbound::Closed("eof".into())).await;
                return;
            }
            Ok(n) => match frames.push(&buf[..n]) {
                Ok(complete) => {
                    for frame in complete {
                        let parsed = serde_json::from_slice::<Value>(&frame)
                            .map_err(ProtocolError::from)
                            .and_then(IncomingMessage::from_value);
                        match parsed {
                            Ok(msg) => {
                                if inbound_tx.send(Inbound::Message(msg)).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) => warn!(error = %e, "discarding malformed inbound frame"),
                        }
                    }
                }
                Err(overflow) => {
                    error!(error = %overflow, "inbound frame overflow; closing transport");
                    let _ = inbound_tx.send(Inbound::Closed(overflow.to_string())).await;
                    return;
                }
            },
            Err(e) => {
                let _ = inbound_tx.send(Inbound::Closed(e.to_string())).await;
                return;
            }
        }
    }
}

async fn dispatch_loop(
    mut cmd_rx: mpsc::Receiver<Command>,
    mut inbound_rx: mpsc::Receiver<Inbound>,
    hub: Arc<NotificationHub>,
    writer: WriterHandle,
    closed_tx: watch::Sender<bool>,
    counters: Arc<Counters>,
    max_pending: usize,
) {
    let mut pending: std::collections::HashMap<u64, PendingEntry> =
        std::collections::HashMap::new();

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Register { id, method, reply, ack }) => {
                    if pending.len() >= max_pending {
                        let _ = ack.send(Err(BridgeError::Overloaded { max_pending }));
                    } else {
                        pending.insert(id, PendingEntry { method, reply });
                        let _ = ack.send(Ok(()));
                    }
                }
                Some(Command::Deregister { id }) => {
                    pending.remove(&id);
                }
                Some(Command::Close) | None => break,
            },
            inbound = inbound_rx.recv() => match inbound {
                Some(Inbound::Message(IncomingMessage::Response(resp))) => {
                    let Some(id) = resp.id else {
                        warn!("uncorrelatable response (null id)");
                        continue;
                    };
                    let Some(entry) = pending.remove(&id) else {
                        debug!(id, "response for unknown id (already timed out or aborted)");
                        continue;
                    };
                    let outcome = match (resp.result, resp.error) {
                        (_, Some(err)) => Err(BridgeError::Rpc(err)),
                        (Some(value), None) => Ok(value),
                        (None, None) => Ok(Value::Null),
                    };
                    let _ = entry.reply.send(outcome);
                }
                Some(Inbound::Message(IncomingMessage::Notification(note))) => {
                    counters.notifications.fetch_add(1, Ordering::Relaxed);
                    hub.publish(&note.method, note.params);
                }
                Some(Inbound::Closed(reason)) => {
                    debug!(reason, "inbound stream closed");
                    break;
                }
                None => break,
            },
        }
    }

    // Teardown in a fixed order: no new work, reject stragglers, wake
    // everything still waiting.
    closed_tx.send_replace(true);
    writer.shutdown();
    for (_, entry) in pending.drain() {
        debug!(method = %entry.method, "rejecting pending request at close");
        let _ = entry.reply.send(Err(BridgeError::Closed));
    }
    hub.close();
}
