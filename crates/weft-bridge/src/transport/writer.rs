//! FIFO write queue.
//!
//! All outbound bytes funnel through one writer task, so frames can never
//! interleave. Each job carries a completion channel; the first I/O failure
//! poisons the queue and every later job fails deterministically, in order.

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::BridgeError;

pub(crate) enum WriterMsg {
    Write(WriteJob),
    /// Reject everything still queued and everything that follows.
    Shutdown,
}

pub(crate) struct WriteJob {
    pub frame: Bytes,
    pub done: oneshot::Sender<Result<(), BridgeError>>,
}

#[derive(Clone)]
pub(crate) struct WriterHandle {
    tx: mpsc::Sender<WriterMsg>,
}

impl WriterHandle {
    /// Queue a frame; the returned channel resolves when the bytes are
    /// flushed (or with the failure that stopped them).
    pub async fn enqueue(
        &self,
        frame: Bytes,
    ) -> Result<oneshot::Receiver<Result<(), BridgeError>>, BridgeError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(WriterMsg::Write(WriteJob {
                frame,
                done: done_tx,
            }))
            .await
            .map_err(|_| BridgeError::Closed)?;
        Ok(done_rx)
    }

    /// Queue a frame and wait for its outcome.
    pub async fn write(&self, frame: Bytes) -> Result<(), BridgeError> {
        let done = self.enqueue(frame).await?;
        done.await.map_err(|_| BridgeError::Closed)?
    }

    /// Ask the writer task to reject all remaining work.
    pub fn shutdown(&self) {
        match self.tx.try_send(WriterMsg::Shutdown) {
            Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
            Err(mpsc::error::TrySendError::Full(msg)) => {
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let _ = tx.send(msg).await;
                });
            }
        }
    }
}

/// Spawn the writer task over an outbound byte sink.
pub(crate) fn spawn_writer<W>(mut sink: W, depth: usize) -> WriterHandle
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    let (tx, mut rx) = mpsc::channel(depth);
    tokio::spawn(async move {
        // Once set, every remaining job fails with this error.
        let mut poison: Option<BridgeError> = None;
        while let Some(msg) = rx.recv().await {
            match msg {
                WriterMsg::Shutdown => {
                    poison.get_or_insert(BridgeError::Closed);
                }
                WriterMsg::Write(job) => {
                    if let Some(cause) = &poison {
                        let _ = job.done.send(Err(cause.shared()));
                        continue;
                    }
                    let outcome = async {
                        sink.write_all(&job.frame).await?;
                        sink.flush().await
                    }
                    .await;
                    match outcome {
                        Ok(()) => {
                            let _ = job.done.send(Ok(()));
                        }
                        Err(e) => {
                            debug!(error = %e, "outbound write failed; poisoning queue");
                            let message = e.to_string();
                            poison = Some(BridgeError::WritePoisoned {
                                message: message.clone(),
                            });
                            let _ = job.done.send(Err(BridgeError::WriteFailed { message }));
                        }
                    }
                }
            }
        }
    });
    WriterHandle { tx }
}
