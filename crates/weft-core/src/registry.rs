//! Stream registry.
//!
//! Tracks every in-flight generation. A single actor task owns the stream
//! table: registrations, chunk/stats/event routing, acknowledgements, and
//! cancellation all serialize through its command channel, so there is
//! exactly one writer. Consumers hold a [`StreamHandle`] with a chunk
//! receiver and a future resolving to the stream's settled statistics.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use weft_bridge::abort::AbortToken;
use weft_bridge::transport::Transport;
use weft_proto::notify::{
    ChunkParams, EventParams, STREAM_CHUNK, STREAM_EVENT, STREAM_STATS, StatsParams, StreamEvent,
};
use weft_types::{ErrorCode, StreamId};

use crate::chunk::{ChunkPool, TokenChunk};
use crate::error::SchedError;

/// Registry knobs.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Hard ceiling the adaptive limit can never exceed.
    pub max_concurrent_streams: usize,
    /// Starting value of the adaptive concurrency limit.
    pub initial_limit: usize,
    /// Unacked chunks at which a backpressure signal fires.
    pub backpressure_threshold: u32,
    /// Time above the threshold before the stream is flagged slow.
    pub slow_consumer_after: Duration,
    /// Cadence of the deadline / slow-consumer sweep.
    pub sweep_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_concurrent_streams: 256,
            initial_limit: 64,
            backpressure_threshold: 32,
            slow_consumer_after: Duration::from_secs(2),
            sweep_interval: Duration::from_millis(250),
        }
    }
}

/// Stream lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Registered,
    Active,
    Completing,
    Completed,
    Failed,
    Cancelled,
}

/// Settled statistics delivered when a stream terminates.
#[derive(Debug, Clone)]
pub struct StreamStats {
    pub stream_id: StreamId,
    pub tokens_generated: u64,
    pub tokens_per_second: f64,
    pub time_to_first_token_ms: Option<f64>,
    pub total_time_ms: f64,
}

/// Advisory flow-control signals; the batcher pauses dispatch on them.
#[derive(Debug, Clone)]
pub enum RegistrySignal {
    Backpressure { stream_id: StreamId },
    SlowConsumer { stream_id: StreamId },
}

/// Aggregate view over all streams the registry has seen.
#[derive(Debug, Clone)]
pub struct RegistryMetrics {
    pub timestamp: DateTime<Utc>,
    pub active_streams: usize,
    pub total_streams: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub avg_ttft_ms: f64,
    pub avg_throughput: f64,
    pub current_limit: usize,
    pub utilization: f64,
}

/// Per-registration options.
#[derive(Debug, Default)]
pub struct RegisterOptions {
    /// Fail the stream if it has not terminated by then.
    pub deadline: Option<Duration>,
    /// External cancellation.
    pub abort: Option<AbortToken>,
}

/// Consumer side of one registered stream.
#[derive(Debug)]
pub struct StreamHandle {
    pub stream_id: StreamId,
    chunks: mpsc::UnboundedReceiver<TokenChunk>,
    stats: oneshot::Receiver<Result<StreamStats, SchedError>>,
}

impl StreamHandle {
    /// Next chunk; `None` once the stream has terminated.
    pub async fn next_chunk(&mut self) -> Option<TokenChunk> {
        self.chunks.recv().await
    }

    /// Await termination and the settled statistics.
    pub async fn finished(self) -> Result<StreamStats, SchedError> {
        self.stats.await.map_err(|_| SchedError::Closed)?
    }

    /// Split into the chunk receiver and the stats future for callers that
    /// consume them from different tasks.
    pub fn into_parts(
        self,
    ) -> (
        StreamId,
        mpsc::UnboundedReceiver<TokenChunk>,
        oneshot::Receiver<Result<StreamStats, SchedError>>,
    ) {
        (self.stream_id, self.chunks, self.stats)
    }
}

struct Record {
    state: StreamState,
    created_at: Instant,
    first_token_at: Option<Instant>,
    last_activity: Instant,
    tokens: u64,
    unacked: u32,
    deadline: Option<Instant>,
    chunk_tx: mpsc::UnboundedSender<TokenChunk>,
    stats_tx: Option<oneshot::Sender<Result<StreamStats, SchedError>>>,
    runtime_stats: Option<StatsParams>,
    backpressure_since: Option<Instant>,
    slow_notified: bool,
    // Dropping this stops the abort watcher task.
    _watcher_stop: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
struct Aggregates {
    total: u64,
    completed: u64,
    failed: u64,
    cancelled: u64,
    ttft_sum_ms: f64,
    ttft_count: u64,
    throughput_sum: f64,
    throughput_count: u64,
}

enum Command {
    Register {
        stream_id: StreamId,
        opts: RegisterOptions,
        reply: oneshot::Sender<Result<StreamHandle, SchedError>>,
    },
    Chunk(ChunkParams),
    Stats(StatsParams),
    Event(EventParams),
    Ack {
        stream_id: StreamId,
        count: u32,
    },
    Cancel {
        stream_id: StreamId,
    },
    SetLimit {
        limit: usize,
    },
    Metrics {
        reply: oneshot::Sender<RegistryMetrics>,
    },
}

/// Cloneable handle to the registry actor.
#[derive(Clone)]
pub struct StreamRegistry {
    cmd_tx: mpsc::Sender<Command>,
    signal_tx: broadcast::Sender<RegistrySignal>,
}

impl StreamRegistry {
    pub fn start(config: RegistryConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(1024);
        let (signal_tx, _) = broadcast::channel(256);
        let actor_signals = signal_tx.clone();
        // The actor and its watcher tasks hold only weak senders, so the
        // loop ends once every external handle is gone.
        let weak_cmd_tx = cmd_tx.downgrade();
        tokio::spawn(run_loop(config, cmd_rx, weak_cmd_tx, actor_signals));
        Self { cmd_tx, signal_tx }
    }

    /// Admit a new stream. Rejects with [`SchedError::Overloaded`] when the
    /// current limit is reached.
    pub async fn register(
        &self,
        stream_id: StreamId,
        opts: RegisterOptions,
    ) -> Result<StreamHandle, SchedError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Register {
                stream_id,
                opts,
                reply: reply_tx,
            })
            .await
            .map_err(|_| SchedError::Closed)?;
        reply_rx.await.map_err(|_| SchedError::Closed)?
    }

    pub async fn handle_chunk(&self, params: ChunkParams) {
        let _ = self.cmd_tx.send(Command::Chunk(params)).await;
    }

    pub async fn handle_stats(&self, params: StatsParams) {
        let _ = self.cmd_tx.send(Command::Stats(params)).await;
    }

    pub async fn handle_event(&self, params: EventParams) {
        let _ = self.cmd_tx.send(Command::Event(params)).await;
    }

    /// Consumer acknowledgement of `count` processed chunks.
    pub async fn acknowledge_chunk(&self, stream_id: StreamId, count: u32) {
        let _ = self.cmd_tx.send(Command::Ack { stream_id, count }).await;
    }

    pub async fn cancel(&self, stream_id: StreamId) {
        let _ = self.cmd_tx.send(Command::Cancel { stream_id }).await;
    }

    /// Adjust the adaptive concurrency limit (clamped to the hard max).
    pub async fn set_limit(&self, limit: usize) {
        let _ = self.cmd_tx.send(Command::SetLimit { limit }).await;
    }

    pub async fn metrics(&self) -> Result<RegistryMetrics, SchedError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Metrics { reply: reply_tx })
            .await
            .map_err(|_| SchedError::Closed)?;
        reply_rx.await.map_err(|_| SchedError::Closed)
    }

    /// Subscribe to backpressure / slow-consumer signals.
    pub fn signals(&self) -> broadcast::Receiver<RegistrySignal> {
        self.signal_tx.subscribe()
    }

    /// Forward a transport's stream notifications into this registry.
    pub fn wire_notifications(&self, transport: &Transport) {
        let chunks = transport.on_notification(STREAM_CHUNK);
        let registry = self.clone();
        tokio::spawn(async move {
            while let Some(value) = chunks.recv().await {
                match serde_json::from_value::<ChunkParams>(value) {
                    Ok(params) => registry.handle_chunk(params).await,
                    Err(e) => warn!(error = %e, "malformed stream.chunk notification"),
                }
            }
        });

        let stats = transport.on_notification(STREAM_STATS);
        let registry = self.clone();
        tokio::spawn(async move {
            while let Some(value) = stats.recv().await {
                match serde_json::from_value::<StatsParams>(value) {
                    Ok(params) => registry.handle_stats(params).await,
                    Err(e) => warn!(error = %e, "malformed stream.stats notification"),
                }
            }
        });

        let events = transport.on_notification(STREAM_EVENT);
        let registry = self.clone();
        tokio::spawn(async move {
            while let Some(value) = events.recv().await {
                match serde_json::from_value::<EventParams>(value) {
                    Ok(params) => registry.handle_event(params).await,
                    Err(e) => warn!(error = %e, "malformed stream.event notification"),
                }
            }
        });
    }
}

async fn run_loop(
    config: RegistryConfig,
    mut cmd_rx: mpsc::Receiver<Command>,
    cmd_tx: mpsc::WeakSender<Command>,
    signals: broadcast::Sender<RegistrySignal>,
) {
    let pool = ChunkPool::new();
    let mut streams: HashMap<StreamId, Record> = HashMap::new();
    let mut agg = Aggregates::default();
    let mut current_limit = config.initial_limit.min(config.max_concurrent_streams);
    let mut sweep = tokio::time::interval(config.sweep_interval);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break };
                handle_command(
                    cmd,
                    &config,
                    &pool,
                    &mut streams,
                    &mut agg,
                    &mut current_limit,
                    &cmd_tx,
                    &signals,
                );
            }
            _ = sweep.tick() => {
                sweep_streams(&config, &mut streams, &mut agg, &signals);
            }
        }
    }

    // All handles dropped: settle whatever is still in flight.
    for (stream_id, mut record) in streams.drain() {
        debug!(%stream_id, "registry shut down with stream in flight");
        if let Some(tx) = record.stats_tx.take() {
            let _ = tx.send(Err(SchedError::Closed));
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn handle_command(
    cmd: Command,
    config: &RegistryConfig,
    pool: &ChunkPool,
    streams: &mut HashMap<StreamId, Record>,
    agg: &mut Aggregates,
    current_limit: &mut usize,
    cmd_tx: &mpsc::WeakSender<Command>,
    signals: &broadcast::Sender<RegistrySignal>,
) {
    match cmd {
        Command::Register {
            stream_id,
            opts,
            reply,
        } => {
            if streams.len() >= *current_limit {
                let _ = reply.send(Err(SchedError::Overloaded {
                    active: streams.len(),
                    limit: *current_limit,
                }));
                return;
            }
            if streams.contains_key(&stream_id) {
                let _ = reply.send(Err(SchedError::DuplicateStream { stream_id }));
                return;
            }

            let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
            let (stats_tx, stats_rx) = oneshot::channel();
            let now = Instant::now();

            let watcher_stop = opts.abort.map(|token| {
                let (stop_tx, stop_rx) = oneshot::channel::<()>();
                let weak_cmd_tx = cmd_tx.clone();
                let watched = stream_id.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = token.cancelled() => {
                            if let Some(tx) = weak_cmd_tx.upgrade() {
                                let _ = tx.send(Command::Cancel { stream_id: watched }).await;
                            }
                        }
                        _ = stop_rx => {}
                    }
                });
                stop_tx
            });

            streams.insert(
                stream_id.clone(),
                Record {
                    state: StreamState::Registered,
                    created_at: now,
                    first_token_at: None,
                    last_activity: now,
                    tokens: 0,
                    unacked: 0,
                    deadline: opts.deadline.map(|d| now + d),
                    chunk_tx,
                    stats_tx: Some(stats_tx),
                    runtime_stats: None,
                    backpressure_since: None,
                    slow_notified: false,
                    _watcher_stop: watcher_stop,
                },
            );
            agg.total += 1;

            let _ = reply.send(Ok(StreamHandle {
                stream_id,
                chunks: chunk_rx,
                stats: stats_rx,
            }));
        }

        Command::Chunk(params) => {
            let Some(record) = streams.get_mut(&params.stream_id) else {
                warn!(stream_id = %params.stream_id, "chunk for unknown stream");
                return;
            };
            let now = Instant::now();
            let chunk = pool.chunk_from(&params);
            record.tokens += chunk.token_count() as u64;
            record.last_activity = now;
            if record.first_token_at.is_none() {
                record.first_token_at = Some(now);
                record.state = StreamState::Active;
            }
            if chunk.is_final {
                record.state = StreamState::Completing;
            }
            let _ = record.chunk_tx.send(chunk);

            record.unacked += 1;
            if record.unacked >= config.backpressure_threshold
                && record.backpressure_since.is_none()
            {
                record.backpressure_since = Some(now);
                let _ = signals.send(RegistrySignal::Backpressure {
                    stream_id: params.stream_id.clone(),
                });
            }
        }

        Command::Stats(params) => {
            if let Some(record) = streams.get_mut(&params.stream_id) {
                record.last_activity = Instant::now();
                record.runtime_stats = Some(params);
            }
        }

        Command::Event(params) => {
            let outcome = match &params.event {
                StreamEvent::Completed => Ok(()),
                StreamEvent::Error { code, message } => Err(SchedError::Generation {
                    code: code
                        .map(ErrorCode::from_rpc_code)
                        .unwrap_or(ErrorCode::GenerationError),
                    message: message.clone(),
                }),
            };
            settle(streams, agg, &params.stream_id, outcome);
        }

        Command::Ack { stream_id, count } => {
            if let Some(record) = streams.get_mut(&stream_id) {
                record.unacked = record.unacked.saturating_sub(count);
                if record.unacked < config.backpressure_threshold {
                    record.backpressure_since = None;
                    record.slow_notified = false;
                }
            }
        }

        Command::Cancel { stream_id } => {
            if streams.contains_key(&stream_id) {
                info!(%stream_id, "stream cancelled");
                settle(streams, agg, &stream_id, Err(SchedError::Cancelled));
            } else {
                debug!(%stream_id, "cancel for unknown stream");
            }
        }

        Command::SetLimit { limit } => {
            *current_limit = limit.clamp(1, config.max_concurrent_streams);
            debug!(limit = *current_limit, "concurrency limit adjusted");
        }

        Command::Metrics { reply } => {
            let metrics = RegistryMetrics {
                timestamp: Utc::now(),
                active_streams: streams.len(),
                total_streams: agg.total,
                completed: agg.completed,
                failed: agg.failed,
                cancelled: agg.cancelled,
                avg_ttft_ms: if agg.ttft_count > 0 {
                    agg.ttft_sum_ms / agg.ttft_count as f64
                } else {
                    0.0
                },
                avg_throughput: if agg.throughput_count > 0 {
                    agg.throughput_sum / agg.throughput_count as f64
                } else {
                    0.0
                },
                current_limit: *current_limit,
                utilization: if *current_limit > 0 {
                    streams.len() as f64 / *current_limit as f64
                } else {
                    0.0
                },
            };
            let _ = reply.send(metrics);
        }
    }
}

/// Terminate a stream: resolve its stats future, fold the stream into the
/// aggregates, and drop the record (which also closes its chunk channel
/// and stops any abort watcher).
fn settle(
    streams: &mut HashMap<StreamId, Record>,
    agg: &mut Aggregates,
    stream_id: &StreamId,
    outcome: Result<(), SchedError>,
) {
    let Some(mut record) = streams.remove(stream_id) else {
        return;
    };

    let total_ms = record
        .last_activity
        .duration_since(record.created_at)
        .as_secs_f64()
        * 1_000.0;
    let ttft_ms = record
        .first_token_at
        .map(|t| t.duration_since(record.created_at).as_secs_f64() * 1_000.0);
    // Zero-duration guard: a stream that settled instantly reports zero
    // throughput rather than infinity.
    let computed_tps = if total_ms > 0.0 {
        record.tokens as f64 / (total_ms / 1_000.0)
    } else {
        0.0
    };
    let tokens_per_second = record
        .runtime_stats
        .as_ref()
        .map(|s| s.tokens_per_second)
        .unwrap_or(computed_tps);

    let stats = StreamStats {
        stream_id: stream_id.clone(),
        tokens_generated: record.tokens,
        tokens_per_second,
        time_to_first_token_ms: ttft_ms,
        total_time_ms: total_ms,
    };

    match &outcome {
        Ok(()) => {
            record.state = StreamState::Completed;
            agg.completed += 1;
            if let Some(ttft) = ttft_ms {
                agg.ttft_sum_ms += ttft;
                agg.ttft_count += 1;
            }
            agg.throughput_sum += tokens_per_second;
            agg.throughput_count += 1;
        }
        Err(SchedError::Cancelled) => {
            record.state = StreamState::Cancelled;
            agg.cancelled += 1;
        }
        Err(_) => {
            record.state = StreamState::Failed;
            agg.failed += 1;
        }
    }

    if let Some(tx) = record.stats_tx.take() {
        let _ = tx.send(outcome.map(|()| stats));
    }
}

fn sweep_streams(
    config: &RegistryConfig,
    streams: &mut HashMap<StreamId, Record>,
    agg: &mut Aggregates,
    signals: &broadcast::Sender<RegistrySignal>,
) {
    let now = Instant::now();

    let expired: Vec<StreamId> = streams
        .iter()
        .filter(|(_, r)| r.deadline.is_some_and(|d| now >= d))
        .map(|(id, _)| id.clone())
        .collect();
    for stream_id in expired {
        warn!(%stream_id, "stream deadline exceeded");
        settle(streams, agg, &stream_id, Err(SchedError::DeadlineExceeded));
    }

    for (stream_id, record) in streams.iter_mut() {
        if record.slow_notified {
            continue;
        }
        if let Some(since) = record.backpressure_since {
            if now.duration_since(since) >= config.slow_consumer_after {
                record.slow_notified = true;
                let _ = signals.send(RegistrySignal::SlowConsumer {
                    stream_id: stream_id.clone(),
                });
            }
        }
    }
}
