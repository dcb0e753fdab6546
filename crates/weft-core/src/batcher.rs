//! Generate batcher.
//!
//! Concurrent `generate` calls that share a partition key (model, draft
//! model, guidance mode) coalesce into one `batch_generate` envelope.
//! Three priority queues per partition drain urgent → default →
//! background, FIFO within each. The per-partition target batch size
//! adapts to observed dispatch duration and queue latency, and a
//! backpressure signal from the stream registry pauses dispatching.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

use weft_bridge::BridgeError;
use weft_bridge::abort::AbortToken;
use weft_bridge::resilience::client::ResilientClient;
use weft_bridge::transport::RequestOptions;
use weft_proto::methods::{BATCH_GENERATE, BatchResults, GENERATE, GenerateResult};
use weft_types::{GenerateParams, GuidanceMode, Priority, StreamId};

use crate::error::SchedError;
use crate::registry::{RegistrySignal, StreamRegistry};

// Adaptive thresholds from the dispatch-quality rules.
const QUEUE_P95_GROW: Duration = Duration::from_micros(1_500);
const QUEUE_P95_SHRINK: Duration = Duration::from_micros(4_000);
const DURATION_SHRINK_FACTOR: f64 = 1.3;
const ACTIVE_HEADROOM: f64 = 0.8;
const STATS_WINDOW: usize = 32;
const CAPACITY_RETRY: Duration = Duration::from_millis(5);

/// Batcher knobs.
#[derive(Debug, Clone)]
pub struct BatcherConfig {
    /// When false every call goes out as a solo `generate`.
    pub enabled: bool,
    pub max_batch_size: usize,
    pub min_batch_size: usize,
    /// Starting adaptive target.
    pub initial_target: usize,
    /// Hold window once the first default-priority entry arrives.
    pub hold: Duration,
    /// Hold for partitions containing only background entries.
    pub background_hold: Duration,
    /// Hard cap on total hold from first enqueue to dispatch.
    pub max_hold: Duration,
    /// Desired dispatch duration the adaptive rule steers toward.
    pub target_time: Duration,
    /// How long a registry backpressure signal pauses dispatching.
    pub pause_on_backpressure: Duration,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_batch_size: 8,
            min_batch_size: 1,
            initial_target: 4,
            hold: Duration::from_millis(2),
            background_hold: Duration::from_millis(10),
            max_hold: Duration::from_millis(20),
            target_time: Duration::from_millis(50),
            pause_on_backpressure: Duration::from_millis(25),
        }
    }
}

/// Seam to the bridge, so tests can script the runtime side.
#[async_trait]
pub trait GenerateClient: Send + Sync + 'static {
    async fn call(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
        abort: Option<AbortToken>,
    ) -> Result<Value, BridgeError>;
}

#[async_trait]
impl GenerateClient for ResilientClient {
    async fn call(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
        abort: Option<AbortToken>,
    ) -> Result<Value, BridgeError> {
        self.request(method, params, RequestOptions { timeout, abort })
            .await
    }
}

/// The multiplexer is also a valid client facade: batchable methods ride
/// its envelopes, everything else falls through to the resilient path.
#[async_trait]
impl GenerateClient for weft_bridge::OpsMultiplexer {
    async fn call(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
        abort: Option<AbortToken>,
    ) -> Result<Value, BridgeError> {
        self.call(method, params, RequestOptions { timeout, abort })
            .await
    }
}

/// Per-enqueue options.
#[derive(Debug, Default)]
pub struct EnqueueOptions {
    pub priority: Priority,
    pub timeout: Option<Duration>,
    pub abort: Option<AbortToken>,
}

/// Partition identity: requests sharing it may share an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionKey {
    pub model_id: String,
    pub draft_model: Option<String>,
    pub guidance: Option<GuidanceMode>,
}

impl PartitionKey {
    pub fn of(params: &GenerateParams) -> Self {
        Self {
            model_id: params.model_id.clone(),
            draft_model: params.draft_model.clone(),
            guidance: params.guidance.clone(),
        }
    }
}

/// Point-in-time view of one partition.
#[derive(Debug, Clone)]
pub struct PartitionSnapshot {
    pub key: PartitionKey,
    pub depth: usize,
    pub target_size: usize,
    pub batches_dispatched: u64,
    pub entries_dispatched: u64,
}

/// Batcher-wide metrics.
#[derive(Debug, Clone, Default)]
pub struct BatcherMetrics {
    pub partitions: Vec<PartitionSnapshot>,
}

struct Entry {
    params: GenerateParams,
    priority: Priority,
    enqueued_at: Instant,
    timeout: Option<Duration>,
    reply: oneshot::Sender<Result<GenerateResult, SchedError>>,
    _watcher_stop: Option<oneshot::Sender<()>>,
}

struct Partition {
    urgent: VecDeque<Entry>,
    normal: VecDeque<Entry>,
    background: VecDeque<Entry>,
    target: usize,
    next_dispatch: Option<Instant>,
    hold_started: Option<Instant>,
    durations: VecDeque<Duration>,
    queue_latency: VecDeque<Duration>,
    active_samples: VecDeque<usize>,
    batches_dispatched: u64,
    entries_dispatched: u64,
}

impl Partition {
    fn new(target: usize) -> Self {
        Self {
            urgent: VecDeque::new(),
            normal: VecDeque::new(),
            background: VecDeque::new(),
            target,
            next_dispatch: None,
            hold_started: None,
            durations: VecDeque::new(),
            queue_latency: VecDeque::new(),
            active_samples: VecDeque::new(),
            batches_dispatched: 0,
            entries_dispatched: 0,
        }
    }

    fn depth(&self) -> usize {
        self.urgent.len() + self.normal.len() + self.background.len()
    }

    fn pop_next(&mut self) -> Option<Entry> {
        self.urgent
            .pop_front()
            .or_else(|| self.normal.pop_front())
            .or_else(|| self.background.pop_front())
    }

    fn background_only(&self) -> bool {
        self.urgent.is_empty() && self.normal.is_empty() && !self.background.is_empty()
    }

    fn remove_stream(&mut self, stream_id: &StreamId) -> Option<Entry> {
        for queue in [&mut self.urgent, &mut self.normal, &mut self.background] {
            if let Some(pos) = queue.iter().position(|e| &e.params.stream_id == stream_id) {
                return queue.remove(pos);
            }
        }
        None
    }
}

enum Command {
    Enqueue {
        params: GenerateParams,
        opts: EnqueueOptions,
        reply: oneshot::Sender<Result<GenerateResult, SchedError>>,
    },
    Abort {
        stream_id: StreamId,
    },
    DispatchDone {
        key: PartitionKey,
        duration: Duration,
        active_streams: usize,
        current_limit: usize,
    },
    Metrics {
        reply: oneshot::Sender<BatcherMetrics>,
    },
}

/// Cloneable handle to the batcher actor.
#[derive(Clone)]
pub struct GenerateBatcher {
    cmd_tx: mpsc::Sender<Command>,
}

impl GenerateBatcher {
    pub fn start(
        client: Arc<dyn GenerateClient>,
        registry: Option<StreamRegistry>,
        config: BatcherConfig,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(1024);
        let weak = cmd_tx.downgrade();
        tokio::spawn(run_loop(client, registry, config, cmd_rx, weak));
        Self { cmd_tx }
    }

    /// Queue a generate call; resolves with the runtime's acknowledgement
    /// once its (possibly batched) dispatch completes.
    pub async fn enqueue(
        &self,
        params: GenerateParams,
        opts: EnqueueOptions,
    ) -> Result<GenerateResult, SchedError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Enqueue {
                params,
                opts,
                reply: reply_tx,
            })
            .await
            .map_err(|_| SchedError::Closed)?;
        reply_rx.await.map_err(|_| SchedError::Closed)?
    }

    pub async fn metrics(&self) -> Result<BatcherMetrics, SchedError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Metrics { reply: reply_tx })
            .await
            .map_err(|_| SchedError::Closed)?;
        reply_rx.await.map_err(|_| SchedError::Closed)
    }
}

async fn run_loop(
    client: Arc<dyn GenerateClient>,
    registry: Option<StreamRegistry>,
    config: BatcherConfig,
    mut cmd_rx: mpsc::Receiver<Command>,
    weak_tx: mpsc::WeakSender<Command>,
) {
    let mut partitions: HashMap<PartitionKey, Partition> = HashMap::new();
    let mut backpressure_until: Option<Instant> = None;

    // Without a registry there are no flow-control signals; park the arm
    // on a channel that never fires. `_parked_tx` keeps that channel open.
    let (idle_tx, idle_signal_rx) = broadcast::channel(1);
    let mut _parked_tx = Some(idle_tx);
    let mut signal_rx = match registry.as_ref() {
        Some(reg) => {
            _parked_tx = None;
            reg.signals()
        }
        None => idle_signal_rx,
    };

    loop {
        let next_due = partitions
            .values()
            .filter_map(|p| p.next_dispatch)
            .min();
        let sleep_target = next_due.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break };
                match cmd {
                    Command::Enqueue { params, opts, reply } => {
                        handle_enqueue(
                            &client, &config, &mut partitions, &weak_tx, params, opts, reply,
                        );
                    }
                    Command::Abort { stream_id } => {
                        let removed = partitions.values_mut().find_map(|p| {
                            let entry = p.remove_stream(&stream_id)?;
                            if p.depth() == 0 {
                                p.next_dispatch = None;
                                p.hold_started = None;
                            }
                            Some(entry)
                        });
                        if let Some(entry) = removed {
                            debug!(%stream_id, "entry aborted before dispatch");
                            let _ = entry.reply.send(Err(SchedError::Cancelled));
                            if let Some(reg) = &registry {
                                reg.cancel(stream_id).await;
                            }
                        }
                        // After dispatch, cancellation belongs to the runtime.
                    }
                    Command::DispatchDone { key, duration, active_streams, current_limit } => {
                        if let Some(partition) = partitions.get_mut(&key) {
                            adapt_target(&config, partition, duration, active_streams, current_limit);
                        }
                    }
                    Command::Metrics { reply } => {
                        let snapshot = BatcherMetrics {
                            partitions: partitions
                                .iter()
                                .map(|(key, p)| PartitionSnapshot {
                                    key: key.clone(),
                                    depth: p.depth(),
                                    target_size: p.target,
                                    batches_dispatched: p.batches_dispatched,
                                    entries_dispatched: p.entries_dispatched,
                                })
                                .collect(),
                        };
                        let _ = reply.send(snapshot);
                    }
                }
            }
            _ = tokio::time::sleep_until(sleep_target), if next_due.is_some() => {
                dispatch_due(
                    &client,
                    &registry,
                    &config,
                    &mut partitions,
                    &mut backpressure_until,
                    &weak_tx,
                )
                .await;
            }
            signal = signal_rx.recv() => {
                match signal {
                    Ok(RegistrySignal::Backpressure { stream_id })
                    | Ok(RegistrySignal::SlowConsumer { stream_id }) => {
                        debug!(%stream_id, "registry pressure; pausing dispatch");
                        backpressure_until =
                            Some(Instant::now() + config.pause_on_backpressure);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "missed registry signals");
                        backpressure_until =
                            Some(Instant::now() + config.pause_on_backpressure);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        // Registry gone; park this arm on a silent channel.
                        let (tx, rx) = broadcast::channel(1);
                        _parked_tx = Some(tx);
                        signal_rx = rx;
                    }
                }
            }
        }
    }

    // Handles gone: fail whatever is still queued.
    for (_, mut partition) in partitions.drain() {
        while let Some(entry) = partition.pop_next() {
            let _ = entry.reply.send(Err(SchedError::Closed));
        }
    }
}

fn handle_enqueue(
    client: &Arc<dyn GenerateClient>,
    config: &BatcherConfig,
    partitions: &mut HashMap<PartitionKey, Partition>,
    weak_tx: &mpsc::WeakSender<Command>,
    params: GenerateParams,
    opts: EnqueueOptions,
    reply: oneshot::Sender<Result<GenerateResult, SchedError>>,
) {
    // Batching off: straight to a solo generate call.
    if !config.enabled || config.max_batch_size <= 1 {
        let client = Arc::clone(client);
        let timeout = opts.timeout;
        let abort = opts.abort;
        tokio::spawn(async move {
            let out = solo_generate(&client, params, timeout, abort).await;
            let _ = reply.send(out);
        });
        return;
    }

    let key = PartitionKey::of(&params);
    let partition = partitions
        .entry(key)
        .or_insert_with(|| Partition::new(config.initial_target.clamp(1, config.max_batch_size)));

    let now = Instant::now();
    let watcher_stop = opts.abort.map(|token| {
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let weak = weak_tx.clone();
        let stream_id = params.stream_id.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    if let Some(tx) = weak.upgrade() {
                        let _ = tx.send(Command::Abort { stream_id }).await;
                    }
                }
                _ = stop_rx => {}
            }
        });
        stop_tx
    });

    let entry = Entry {
        params,
        priority: opts.priority,
        enqueued_at: now,
        timeout: opts.timeout,
        reply,
        _watcher_stop: watcher_stop,
    };
    match opts.priority {
        Priority::Urgent => partition.urgent.push_back(entry),
        Priority::Default => partition.normal.push_back(entry),
        Priority::Background => partition.background.push_back(entry),
    }

    // Schedule this partition's dispatch.
    let hold_started = *partition.hold_started.get_or_insert(now);
    let hold_cap = hold_started + config.max_hold;
    let proposed = if opts.priority == Priority::Urgent || partition.depth() >= config.max_batch_size
    {
        now
    } else if partition.background_only() {
        now + config.background_hold
    } else {
        now + config.hold
    };
    let proposed = proposed.min(hold_cap);
    partition.next_dispatch = Some(match partition.next_dispatch {
        Some(existing) => existing.min(proposed),
        None => proposed,
    });
}

async fn dispatch_due(
    client: &Arc<dyn GenerateClient>,
    registry: &Option<StreamRegistry>,
    config: &BatcherConfig,
    partitions: &mut HashMap<PartitionKey, Partition>,
    backpressure_until: &mut Option<Instant>,
    weak_tx: &mpsc::WeakSender<Command>,
) {
    let now = Instant::now();

    if let Some(pause) = *backpressure_until {
        if now < pause {
            // Push every due partition past the pause.
            for partition in partitions.values_mut() {
                if let Some(due) = partition.next_dispatch {
                    if due <= now {
                        partition.next_dispatch = Some(pause);
                    }
                }
            }
            return;
        }
        *backpressure_until = None;
    }

    // Available stream capacity gates how much we pull per dispatch.
    let capacity = match registry {
        Some(reg) => match reg.metrics().await {
            Ok(m) => Some(m.current_limit.saturating_sub(m.active_streams)),
            Err(_) => Some(0),
        },
        None => None,
    };

    let due_keys: Vec<PartitionKey> = partitions
        .iter()
        .filter(|(_, p)| p.next_dispatch.is_some_and(|d| d <= now))
        .map(|(k, _)| k.clone())
        .collect();

    for key in due_keys {
        let Some(partition) = partitions.get_mut(&key) else {
            continue;
        };
        if partition.depth() == 0 {
            // Everything it was holding got aborted.
            partition.next_dispatch = None;
            partition.hold_started = None;
            continue;
        }

        let mut take = partition
            .target
            .min(config.max_batch_size)
            .min(partition.depth());
        if let Some(capacity) = capacity {
            take = take.min(capacity);
        }
        if take == 0 {
            // No stream capacity right now; retry shortly.
            partition.next_dispatch = Some(now + CAPACITY_RETRY);
            continue;
        }

        let mut batch = Vec::with_capacity(take);
        for _ in 0..take {
            let Some(entry) = partition.pop_next() else {
                break;
            };
            partition
                .queue_latency
                .push_back(now.duration_since(entry.enqueued_at));
            if partition.queue_latency.len() > STATS_WINDOW {
                partition.queue_latency.pop_front();
            }
            batch.push(entry);
        }

        partition.batches_dispatched += 1;
        partition.entries_dispatched += batch.len() as u64;
        if partition.depth() > 0 {
            partition.hold_started = Some(now);
            partition.next_dispatch = Some(now + config.hold);
        } else {
            partition.hold_started = None;
            partition.next_dispatch = None;
        }

        spawn_dispatch(client, registry, key, batch, weak_tx.clone());
    }
}

/// Fire one batch (or solo) call and fan results back out.
fn spawn_dispatch(
    client: &Arc<dyn GenerateClient>,
    registry: &Option<StreamRegistry>,
    key: PartitionKey,
    mut batch: Vec<Entry>,
    weak_tx: mpsc::WeakSender<Command>,
) {
    let client = Arc::clone(client);
    let registry = registry.clone();
    tokio::spawn(async move {
        let started = Instant::now();

        if batch.len() == 1 {
            let entry = batch.remove(0);
            let out = solo_generate(&client, entry.params.clone(), entry.timeout, None).await;
            let _ = entry.reply.send(out);
        } else {
            // The envelope gets the widest member timeout.
            let timeout = batch.iter().filter_map(|e| e.timeout).max();
            let bodies: Result<Vec<Value>, _> =
                batch.iter().map(|e| serde_json::to_value(&e.params)).collect();
            let envelope = match bodies {
                Ok(bodies) => json!({ "requests": bodies }),
                Err(e) => {
                    let shared = SchedError::Bridge(BridgeError::Protocol(e.into()));
                    for entry in batch {
                        let _ = entry.reply.send(Err(shared.shared()));
                    }
                    return;
                }
            };

            match client.call(BATCH_GENERATE, envelope, timeout, None).await {
                Ok(value) => match serde_json::from_value::<BatchResults>(value) {
                    Ok(parsed) if parsed.results.len() == batch.len() => {
                        for (entry, outcome) in batch.into_iter().zip(parsed.results) {
                            let result = if outcome.success {
                                parse_generate_result(outcome.result.unwrap_or(Value::Null))
                            } else {
                                Err(match outcome.error {
                                    Some(err) => SchedError::Bridge(BridgeError::Rpc(err)),
                                    None => SchedError::Generation {
                                        code: weft_types::ErrorCode::GenerationError,
                                        message: "batch entry failed without detail".into(),
                                    },
                                })
                            };
                            let _ = entry.reply.send(result);
                        }
                    }
                    Ok(parsed) => {
                        let expected = batch.len();
                        let actual = parsed.results.len();
                        warn!(expected, actual, "batch_generate length mismatch");
                        for entry in batch {
                            let _ = entry.reply.send(Err(SchedError::Bridge(
                                BridgeError::BatchMismatch { expected, actual },
                            )));
                        }
                    }
                    Err(parse_err) => {
                        let shared =
                            SchedError::Bridge(BridgeError::Protocol(parse_err.into()));
                        for entry in batch {
                            let _ = entry.reply.send(Err(shared.shared()));
                        }
                    }
                },
                Err(call_err) => {
                    for entry in batch {
                        let _ = entry.reply.send(Err(SchedError::Bridge(call_err.shared())));
                    }
                }
            }
        }

        // Report dispatch quality for the adaptive target.
        let duration = started.elapsed();
        let (active_streams, current_limit) = match &registry {
            Some(reg) => match reg.metrics().await {
                Ok(m) => (m.active_streams, m.current_limit),
                Err(_) => (0, 0),
            },
            None => (0, 0),
        };
        if let Some(tx) = weak_tx.upgrade() {
            let _ = tx
                .send(Command::DispatchDone {
                    key,
                    duration,
                    active_streams,
                    current_limit,
                })
                .await;
        }
    });
}

async fn solo_generate(
    client: &Arc<dyn GenerateClient>,
    params: GenerateParams,
    timeout: Option<Duration>,
    abort: Option<AbortToken>,
) -> Result<GenerateResult, SchedError> {
    let body = serde_json::to_value(&params)
        .map_err(|e| SchedError::Bridge(BridgeError::Protocol(e.into())))?;
    let value = client
        .call(GENERATE, body, timeout, abort)
        .await
        .map_err(SchedError::from)?;
    parse_generate_result(value)
}

fn parse_generate_result(value: Value) -> Result<GenerateResult, SchedError> {
    serde_json::from_value(value)
        .map_err(|e| SchedError::Bridge(BridgeError::Protocol(e.into())))
}

/// Apply the grow/shrink rules after a dispatch.
fn adapt_target(
    config: &BatcherConfig,
    partition: &mut Partition,
    duration: Duration,
    active_streams: usize,
    current_limit: usize,
) {
    partition.durations.push_back(duration);
    if partition.durations.len() > STATS_WINDOW {
        partition.durations.pop_front();
    }
    partition.active_samples.push_back(active_streams);
    if partition.active_samples.len() > STATS_WINDOW {
        partition.active_samples.pop_front();
    }

    let p95_queue = percentile(&partition.queue_latency, 0.95);
    let p50_duration = percentile(&partition.durations, 0.50);
    let avg_active = if partition.active_samples.is_empty() {
        0.0
    } else {
        partition.active_samples.iter().sum::<usize>() as f64
            / partition.active_samples.len() as f64
    };
    let headroom_ok =
        current_limit == 0 || avg_active < ACTIVE_HEADROOM * current_limit as f64;

    let shrink = p95_queue > QUEUE_P95_SHRINK
        || p50_duration.as_secs_f64() > DURATION_SHRINK_FACTOR * config.target_time.as_secs_f64();
    let grow =
        p95_queue < QUEUE_P95_GROW && p50_duration < config.target_time && headroom_ok;

    if shrink {
        partition.target = (partition.target / 2).max(config.min_batch_size.max(1));
    } else if grow {
        partition.target = (partition.target + 2).min(config.max_batch_size);
    }
}

fn percentile(window: &VecDeque<Duration>, q: f64) -> Duration {
    if window.is_empty() {
        return Duration::ZERO;
    }
    let mut sorted: Vec<Duration> = window.iter().copied().collect();
    sorted.sort_unstable();
    let rank = ((sorted.len() as f64 * q).ceil() as usize).clamp(1, sorted.len());
    sorted[rank - 1]
}
