//! Ops multiplexer.
//!
//! Collapses concurrent low-latency calls (`tokenize`, `check_draft`) into
//! a single `batch_<method>` envelope held open for an adaptive window.
//! Calls carrying a custom timeout or an abort token cannot join a batch
//! and fall through to the single-call path.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

use weft_proto::methods::{self, BatchResults, TokenizeParams, TokenizeResult, batch_method_for};

use crate::config::MuxConfig;
use crate::error::BridgeError;
use crate::resilience::client::ResilientClient;
use crate::transport::RequestOptions;

/// Counter snapshot. `batched` counts calls that travelled inside an
/// envelope, `solo` those that fell through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MuxMetrics {
    pub solo: u64,
    pub batched: u64,
    pub batches_dispatched: u64,
}

#[derive(Default)]
struct Counters {
    solo: AtomicU64,
    batched: AtomicU64,
    batches_dispatched: AtomicU64,
    in_flight: AtomicUsize,
}

struct Join {
    method: String,
    params: Value,
    reply: oneshot::Sender<Result<Value, BridgeError>>,
}

struct Bucket {
    entries: Vec<Join>,
    deadline: Instant,
}

/// Handle; cheap to clone.
#[derive(Clone)]
pub struct OpsMultiplexer {
    client: ResilientClient,
    cmd_tx: mpsc::Sender<Join>,
    counters: Arc<Counters>,
    config: Arc<MuxConfig>,
}

impl OpsMultiplexer {
    pub fn new(client: ResilientClient, config: MuxConfig) -> Self {
        let config = Arc::new(config);
        let counters = Arc::new(Counters::default());
        let (cmd_tx, cmd_rx) = mpsc::channel(1024);
        tokio::spawn(batch_loop(
            cmd_rx,
            client.clone(),
            Arc::clone(&config),
            Arc::clone(&counters),
        ));
        Self {
            client,
            cmd_tx,
            counters,
            config,
        }
    }

    /// Issue a call, batching it when it qualifies.
    pub async fn call(
        &self,
        method: &str,
        params: Value,
        opts: RequestOptions,
    ) -> Result<Value, BridgeError> {
        self.counters.in_flight.fetch_add(1, Ordering::Relaxed);
        let out = self.call_inner(method, params, opts).await;
        self.counters.in_flight.fetch_sub(1, Ordering::Relaxed);
        out
    }

    async fn call_inner(
        &self,
        method: &str,
        params: Value,
        opts: RequestOptions,
    ) -> Result<Value, BridgeError> {
        let qualifies = self.config.enabled
            && self.config.max_batch_size > 1
            && batch_method_for(method).is_some()
            && opts.timeout.is_none()
            && opts.abort.is_none();

        if !qualifies {
            self.counters.solo.fetch_add(1, Ordering::Relaxed);
            return self.client.request(method, params, opts).await;
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let join = Join {
            method: method.to_owned(),
            params,
            reply: reply_tx,
        };
        if let Err(send_err) = self.cmd_tx.send(join).await {
            // Batch loop gone; degrade to a direct call.
            warn!(method, "mux loop unavailable; issuing solo call");
            self.counters.solo.fetch_add(1, Ordering::Relaxed);
            return self
                .client
                .request(method, send_err.0.params, RequestOptions::default())
                .await;
        }
        reply_rx.await.map_err(|_| BridgeError::Closed)?
    }

    /// Typed `tokenize` through the batching path.
    pub async fn tokenize(&self, params: &TokenizeParams) -> Result<TokenizeResult, BridgeError> {
        let value = self
            .call(
                methods::TOKENIZE,
                serde_json::to_value(params).map_err(weft_proto::rpc::ProtocolError::from)?,
                RequestOptions::default(),
            )
            .await?;
        serde_json::from_value(value)
            .map_err(|e| BridgeError::Protocol(weft_proto::rpc::ProtocolError::from(e)))
    }

    pub fn metrics(&self) -> MuxMetrics {
        MuxMetrics {
            solo: self.counters.solo.load(Ordering::Relaxed),
            batched: self.counters.batched.load(Ordering::Relaxed),
            batches_dispatched: self.counters.batches_dispatched.load(Ordering::Relaxed),
        }
    }
}

async fn batch_loop(
    mut cmd_rx: mpsc::Receiver<Join>,
    client: ResilientClient,
    config: Arc<MuxConfig>,
    counters: Arc<Counters>,
) {
    let mut buckets: HashMap<String, Bucket> = HashMap::new();

    loop {
        let next_deadline = buckets.values().map(|b| b.deadline).min();
        let sleep_target =
            next_deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

        tokio::select! {
            join = cmd_rx.recv() => {
                let Some(join) = join else { break };
                let method_key = join.method.clone();
                let hold = hold_window(&config, counters.in_flight.load(Ordering::Relaxed));
                let bucket = buckets
                    .entry(method_key.clone())
                    .or_insert_with(|| Bucket { entries: Vec::new(), deadline: Instant::now() + hold });
                bucket.entries.push(join);
                if bucket.entries.len() >= config.max_batch_size {
                    if let Some(bucket) = buckets.remove(&method_key) {
                        flush(&client, &config, &counters, method_key, bucket.entries);
                    }
                }
            }
            _ = tokio::time::sleep_until(sleep_target), if next_deadline.is_some() => {
                let now = Instant::now();
                let due: Vec<String> = buckets
                    .iter()
                    .filter(|(_, b)| b.deadline <= now)
                    .map(|(m, _)| m.clone())
                    .collect();
                for method in due {
                    let Some(bucket) = buckets.remove(&method) else {
                        continue;
                    };
                    flush(&client, &config, &counters, method, bucket.entries);
                }
            }
        }
    }
}

/// Adaptive hold: quiet periods stretch toward `max_hold` to gather wider
/// batches, contention tightens toward `min_hold` to cut queueing latency.
fn hold_window(config: &MuxConfig, in_flight: usize) -> Duration {
    if in_flight >= config.high_concurrency_threshold {
        return config.min_hold;
    }
    if in_flight <= config.low_concurrency_threshold {
        return config.max_hold;
    }
    let span = (config.high_concurrency_threshold - config.low_concurrency_threshold) as f64;
    let above = (in_flight - config.low_concurrency_threshold) as f64;
    let range = config.max_hold.as_secs_f64() - config.min_hold.as_secs_f64();
    Duration::from_secs_f64(config.max_hold.as_secs_f64() - range * (above / span))
}

/// Dispatch one bucket. Fewer entries than `min_batch_size` are not worth
/// an envelope and run as individual calls.
fn flush(
    client: &ResilientClient,
    config: &MuxConfig,
    counters: &Arc<Counters>,
    method: String,
    entries: Vec<Join>,
) {
    if entries.len() < config.min_batch_size {
        for entry in entries {
            counters.solo.fetch_add(1, Ordering::Relaxed);
            let client = client.clone();
            tokio::spawn(async move {
                let out = client
                    .request(&entry.method, entry.params, RequestOptions::default())
                    .await;
                let _ = entry.reply.send(out);
            });
        }
        return;
    }

    let Some(batch_method) = batch_method_for(&method) else {
        // Only batchable methods can join a bucket.
        warn!(method, "no batch envelope for method; failing entries");
        for entry in entries {
            let _ = entry.reply.send(Err(BridgeError::BatchFailed {
                code: weft_types::ErrorCode::MethodNotFound,
                message: format!("{method} has no batch form"),
            }));
        }
        return;
    };
    counters
        .batched
        .fetch_add(entries.len() as u64, Ordering::Relaxed);
    counters.batches_dispatched.fetch_add(1, Ordering::Relaxed);

    let client = client.clone();
    tokio::spawn(async move {
        let request_bodies: Vec<Value> = entries.iter().map(|e| e.params.clone()).collect();
        let envelope = json!({ "requests": request_bodies });
        debug!(method, size = entries.len(), "dispatching batch envelope");

        match client
            .request(batch_method, envelope, RequestOptions::default())
            .await
        {
            Ok(value) => match serde_json::from_value::<BatchResults>(value) {
                Ok(parsed) if parsed.results.len() == entries.len() => {
                    for (entry, outcome) in entries.into_iter().zip(parsed.results) {
                        let result = if outcome.success {
                            Ok(outcome.result.unwrap_or(Value::Null))
                        } else {
                            Err(match outcome.error {
                                Some(err) => BridgeError::Rpc(err),
                                None => BridgeError::BatchFailed {
                                    code: weft_types::ErrorCode::RuntimeError,
                                    message: "entry failed without detail".into(),
                                },
                            })
                        };
                        let _ = entry.reply.send(result);
                    }
                }
                Ok(parsed) => {
                    let mismatch = BridgeError::BatchMismatch {
                        expected: entries.len(),
                        actual: parsed.results.len(),
                    };
                    for entry in entries {
                        let _ = entry.reply.send(Err(mismatch.shared()));
                    }
                }
                Err(parse_err) => {
                    warn!(method, error = %parse_err, "malformed batch envelope");
                    for entry in entries {
                        let _ = entry.reply.send(Err(BridgeError::BatchFailed {
                            code: weft_types::ErrorCode::ParseError,
                            message: parse_err.to_string(),
                        }));
                    }
                }
            },
            Err(call_err) => {
                for entry in entries {
                    let _ = entry.reply.send(Err(call_err.shared()));
                }
            }
        }
    });
}
