//! Worker node.
//!
//! Registers with the bus, heartbeats system metrics, and executes
//! inference requests through the bridge stack: admission gate, priority
//! queue, then the generate batcher; each request's token stream flows
//! from the stream registry back out to `response.<request_id>`.

mod admission;
mod queue;

pub use admission::{Permit, ResourceManager};
pub use queue::PriorityQueue;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use derive_builder::Builder;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use weft_bridge::abort::abort_pair;
use weft_bus::{MessageBus, publish_json};
use weft_core::batcher::{EnqueueOptions, GenerateBatcher, GenerateClient};
use weft_core::coalesce::{CoalescingRegistry, Primary};
use weft_core::error::SchedError;
use weft_core::registry::{RegisterOptions, StreamRegistry};
use weft_proto::bus::{
    DeregisterMessage, HeartbeatMessage, InferenceRequestMessage, RegisterMessage, ResponseMessage,
    WORKER_DEREGISTER, WORKER_HEARTBEAT, WORKER_REGISTER, WorkerSkills, WorkerStatus,
    inference_subject, response_subject,
};
use weft_proto::methods::{LOAD_MODEL, LoadModelParams};
use weft_types::{ErrorCode, Fingerprint, GenerateParams, Priority, RequestId, WorkerId};

use crate::error::ClusterError;

/// Lifecycle of a worker node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Connecting,
    Registering,
    Ready,
    Draining,
    Stopped,
}

/// When to announce the worker on the bus relative to model pre-warm.
///
/// With `Ready`, a pre-warm failure is fatal; with `Warming` it is logged
/// and the worker serves whatever did load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterWhen {
    Ready,
    Warming,
}

/// Worker configuration.
#[derive(Debug, Clone, Builder)]
#[builder(setter(into), default)]
pub struct WorkerConfig {
    pub worker_id: WorkerId,
    pub hostname: String,
    pub ip: String,
    pub port: u16,
    /// Models this worker advertises in its skills.
    pub models: Vec<String>,
    pub model_paths: BTreeMap<String, String>,
    pub total_size: u64,
    /// Models loaded at startup.
    pub prewarm: Vec<String>,
    pub register_when: RegisterWhen,
    pub heartbeat_interval: Duration,
    pub queue_capacity: usize,
    /// Concurrent in-flight inference ceiling (admission gate).
    pub max_concurrent: usize,
    /// Deadline applied when a request carries none.
    pub default_timeout: Duration,
    /// How long `stop` waits for in-flight requests.
    pub drain_grace: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: WorkerId::generate(),
            hostname: "localhost".into(),
            ip: "127.0.0.1".into(),
            port: 7700,
            models: Vec::new(),
            model_paths: BTreeMap::new(),
            total_size: 0,
            prewarm: Vec::new(),
            register_when: RegisterWhen::Warming,
            heartbeat_interval: Duration::from_secs(5),
            queue_capacity: 64,
            max_concurrent: 8,
            default_timeout: Duration::from_secs(120),
            drain_grace: Duration::from_secs(10),
        }
    }
}

/// One unit of a coalesced response stream.
#[derive(Debug, Clone)]
pub enum WorkerChunk {
    Token(String),
    Done {
        tokens_generated: u64,
        duration_ms: u64,
    },
}

/// The bridge-side collaborators a worker drives.
#[derive(Clone)]
pub struct WorkerHandles {
    /// Control-plane calls (`load_model`, `shutdown`, ...).
    pub control: Arc<dyn GenerateClient>,
    pub batcher: GenerateBatcher,
    pub registry: StreamRegistry,
    /// Fingerprint-keyed dedup in front of the batcher: identical
    /// concurrent requests share one upstream generation.
    pub coalescer: CoalescingRegistry<WorkerChunk>,
}

struct WorkerStats {
    active: AtomicU32,
    total_handled: AtomicU64,
    avg_latency_ms: Mutex<f64>,
    loaded_models: Mutex<Vec<String>>,
}

impl WorkerStats {
    fn observe_latency(&self, ms: f64) {
        let mut latency = self.avg_latency_ms.lock().expect("stats lock");
        *latency = if *latency == 0.0 {
            ms
        } else {
            0.8 * *latency + 0.2 * ms
        };
    }
}

struct ActiveGuard(Arc<WorkerStats>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// A running worker node.
pub struct WorkerNode {
    config: Arc<WorkerConfig>,
    bus: Arc<dyn MessageBus>,
    stats: Arc<WorkerStats>,
    queue: Arc<PriorityQueue<QueuedRequest>>,
    state_tx: watch::Sender<WorkerState>,
    shutdown_tx: watch::Sender<bool>,
}

struct QueuedRequest {
    message: InferenceRequestMessage,
    permit: Permit,
}

impl WorkerNode {
    /// Bring the worker up: connect, pre-warm, register, start the
    /// heartbeat / intake / drain loops.
    pub async fn start(
        bus: Arc<dyn MessageBus>,
        handles: WorkerHandles,
        config: WorkerConfig,
    ) -> Result<Self, ClusterError> {
        let config = Arc::new(config);
        let (state_tx, _) = watch::channel(WorkerState::Idle);
        let (shutdown_tx, _) = watch::channel(false);
        let stats = Arc::new(WorkerStats {
            active: AtomicU32::new(0),
            total_handled: AtomicU64::new(0),
            avg_latency_ms: Mutex::new(0.0),
            loaded_models: Mutex::new(Vec::new()),
        });
        let queue = Arc::new(PriorityQueue::new(config.queue_capacity));

        state_tx.send_replace(WorkerState::Connecting);
        let inference = bus
            .subscribe(&inference_subject(&config.worker_id))
            .await?;

        // Pre-warm. Under `Ready` semantics the bus stays quiet until every
        // configured model loaded, and a failure aborts startup.
        match config.register_when {
            RegisterWhen::Ready => {
                for model in &config.prewarm {
                    load_model(&handles.control, model).await?;
                    stats
                        .loaded_models
                        .lock()
                        .expect("stats lock")
                        .push(model.clone());
                    info!(model, "model pre-warmed");
                }
            }
            RegisterWhen::Warming => {
                let control = Arc::clone(&handles.control);
                let stats = Arc::clone(&stats);
                let prewarm = config.prewarm.clone();
                let mut shutdown_rx = shutdown_tx.subscribe();
                tokio::spawn(async move {
                    for model in prewarm {
                        if *shutdown_rx.borrow_and_update() {
                            debug!("pre-warm aborted by shutdown");
                            return;
                        }
                        match load_model(&control, &model).await {
                            Ok(()) => {
                                stats
                                    .loaded_models
                                    .lock()
                                    .expect("stats lock")
                                    .push(model.clone());
                                info!(model, "model pre-warmed");
                            }
                            Err(e) => warn!(model, error = %e, "pre-warm failed; continuing"),
                        }
                    }
                });
            }
        }

        state_tx.send_replace(WorkerState::Registering);
        publish_json(
            bus.as_ref(),
            WORKER_REGISTER,
            &RegisterMessage {
                worker_id: config.worker_id.clone(),
                hostname: config.hostname.clone(),
                ip: config.ip.clone(),
                port: config.port,
                skills: WorkerSkills {
                    available_models: config.models.clone(),
                    model_paths: config.model_paths.clone(),
                    total_size: config.total_size,
                },
                status: WorkerStatus::Online,
                timestamp: Utc::now(),
            },
        )
        .await?;
        info!(worker_id = %config.worker_id, "worker registered");

        let node = Self {
            config: Arc::clone(&config),
            bus: Arc::clone(&bus),
            stats: Arc::clone(&stats),
            queue: Arc::clone(&queue),
            state_tx,
            shutdown_tx,
        };

        node.spawn_heartbeat();
        node.spawn_intake(inference);
        node.spawn_drain(handles);

        node.state_tx.send_replace(WorkerState::Ready);
        Ok(node)
    }

    pub fn state(&self) -> WorkerState {
        *self.state_tx.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<WorkerState> {
        self.state_tx.subscribe()
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.config.worker_id
    }

    pub fn active_requests(&self) -> u32 {
        self.stats.active.load(Ordering::Relaxed)
    }

    /// Graceful shutdown: deregister, drain in-flight work up to the grace
    /// period, reject whatever is still queued.
    pub async fn stop(&self) {
        self.state_tx.send_replace(WorkerState::Draining);
        self.shutdown_tx.send_replace(true);

        if let Err(e) = publish_json(
            self.bus.as_ref(),
            WORKER_DEREGISTER,
            &DeregisterMessage {
                worker_id: self.config.worker_id.clone(),
                timestamp: Utc::now(),
            },
        )
        .await
        {
            warn!(error = %e, "deregister publish failed");
        }

        let deadline = Instant::now() + self.config.drain_grace;
        while self.stats.active.load(Ordering::Relaxed) > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let stragglers = self.stats.active.load(Ordering::Relaxed);
        if stragglers > 0 {
            warn!(stragglers, "drain grace elapsed with requests in flight");
        }

        while let Some(queued) = self.queue.pop() {
            publish_error(
                &self.bus,
                &queued.message.request_id,
                ErrorCode::WorkerUnavailable,
                "worker draining",
            )
            .await;
        }

        self.state_tx.send_replace(WorkerState::Stopped);
        info!(worker_id = %self.config.worker_id, "worker stopped");
    }

    fn spawn_heartbeat(&self) {
        let bus = Arc::clone(&self.bus);
        let config = Arc::clone(&self.config);
        let stats = Arc::clone(&self.stats);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut system = sysinfo::System::new();
            let mut ticker = tokio::time::interval(config.heartbeat_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_rx.changed() => return,
                }
                system.refresh_cpu_usage();
                system.refresh_memory();
                let memory_percent = if system.total_memory() > 0 {
                    system.used_memory() as f32 / system.total_memory() as f32 * 100.0
                } else {
                    0.0
                };
                let heartbeat = HeartbeatMessage {
                    worker_id: config.worker_id.clone(),
                    cpu_percent: system.global_cpu_usage(),
                    memory_percent,
                    gpu_percent: None,
                    active_requests: stats.active.load(Ordering::Relaxed),
                    total_handled: stats.total_handled.load(Ordering::Relaxed),
                    avg_latency_ms: *stats.avg_latency_ms.lock().expect("stats lock"),
                    loaded_models: stats.loaded_models.lock().expect("stats lock").clone(),
                    timestamp: Utc::now(),
                };
                if let Err(e) = publish_json(bus.as_ref(), WORKER_HEARTBEAT, &heartbeat).await {
                    warn!(error = %e, "heartbeat publish failed");
                    return;
                }
            }
        });
    }

    fn spawn_intake(&self, inference: weft_bus::BusSubscription) {
        let bus = Arc::clone(&self.bus);
        let queue = Arc::clone(&self.queue);
        let resources = ResourceManager::new(self.config.max_concurrent);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    msg = inference.recv() => msg,
                    _ = shutdown_rx.changed() => return,
                };
                let Some(msg) = msg else { return };
                let message = match serde_json::from_value::<InferenceRequestMessage>(msg.payload)
                {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(error = %e, "malformed inference request");
                        continue;
                    }
                };
                let request_id = message.request_id.clone();

                // Resource gate: reject, never block.
                let permit = match resources.try_acquire() {
                    Ok(permit) => permit,
                    Err(_) => {
                        debug!(%request_id, "resource limit exceeded");
                        publish_error(
                            &bus,
                            &request_id,
                            ErrorCode::ResourceLimitExceeded,
                            "worker at capacity",
                        )
                        .await;
                        continue;
                    }
                };

                // Queue gate.
                let priority = message.effective_priority();
                if queue
                    .push(QueuedRequest { message, permit }, priority)
                    .is_err()
                {
                    debug!(%request_id, "inference queue full");
                    publish_error(&bus, &request_id, ErrorCode::QueueFull, "queue full").await;
                }
            }
        });
    }

    fn spawn_drain(&self, handles: WorkerHandles) {
        let bus = Arc::clone(&self.bus);
        let queue = Arc::clone(&self.queue);
        let stats = Arc::clone(&self.stats);
        let config = Arc::clone(&self.config);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                let queued = tokio::select! {
                    queued = queue.wait_pop() => queued,
                    _ = shutdown_rx.changed() => return,
                };
                stats.active.fetch_add(1, Ordering::Relaxed);
                let guard = ActiveGuard(Arc::clone(&stats));
                let bus = Arc::clone(&bus);
                let handles = handles.clone();
                let stats = Arc::clone(&stats);
                let config = Arc::clone(&config);
                tokio::spawn(async move {
                    run_inference(bus, handles, stats, config, queued).await;
                    drop(guard);
                });
            }
        });
    }
}

/// Execute one inference request end to end.
///
/// Requests are deduplicated by fingerprint: the first one in flight
/// becomes the primary (stream registration + batcher dispatch), later
/// identical ones subscribe to its chunk sequence. Every subscriber
/// publishes to its own `response.<request_id>` subject.
async fn run_inference(
    bus: Arc<dyn MessageBus>,
    handles: WorkerHandles,
    stats: Arc<WorkerStats>,
    config: Arc<WorkerConfig>,
    queued: QueuedRequest,
) {
    let QueuedRequest { message, permit } = queued;
    let request_id = message.request_id.clone();
    let priority = message.effective_priority();
    let deadline = message
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(config.default_timeout);
    let started = Instant::now();

    let fingerprint = Fingerprint::of(&message.params);
    let registry = handles.registry.clone();
    let batcher = handles.batcher.clone();
    let params = message.params.clone();
    let subscriber = handles
        .coalescer
        .coalesce(fingerprint, move || {
            start_primary(registry, batcher, params, priority, deadline)
        })
        .await;

    let mut subscriber = match subscriber {
        Ok(subscriber) => subscriber,
        Err(e) => {
            error!(%request_id, error = %e, "inference setup failed");
            publish_error(&bus, &request_id, e.code(), &e.to_string()).await;
            drop(permit);
            return;
        }
    };

    let mut saw_terminal = false;
    while let Some(item) = subscriber.next().await {
        match item {
            Ok(WorkerChunk::Token(text)) => {
                let _ = publish_json(
                    bus.as_ref(),
                    &response_subject(&request_id),
                    &ResponseMessage::Token { text },
                )
                .await;
            }
            Ok(WorkerChunk::Done {
                tokens_generated, ..
            }) => {
                stats.total_handled.fetch_add(1, Ordering::Relaxed);
                stats.observe_latency(started.elapsed().as_millis() as f64);
                let _ = publish_json(
                    bus.as_ref(),
                    &response_subject(&request_id),
                    &ResponseMessage::Done {
                        tokens_generated,
                        duration_ms: started.elapsed().as_millis() as u64,
                    },
                )
                .await;
                saw_terminal = true;
                break;
            }
            Err(e) => {
                stats.total_handled.fetch_add(1, Ordering::Relaxed);
                publish_error(&bus, &request_id, e.code(), &e.to_string()).await;
                saw_terminal = true;
                break;
            }
        }
    }
    if !saw_terminal {
        publish_error(
            &bus,
            &request_id,
            ErrorCode::InternalError,
            "stream ended without a terminal event",
        )
        .await;
    }
    drop(permit);
}

/// Primary factory for one coalesced generation: register the stream,
/// dispatch through the batcher, and pump registry chunks into the
/// coalescer's primary channel. Aborting (last subscriber gone) cancels
/// the stream upstream.
async fn start_primary(
    registry: StreamRegistry,
    batcher: GenerateBatcher,
    params: GenerateParams,
    priority: Priority,
    deadline: Duration,
) -> Result<Primary<WorkerChunk>, SchedError> {
    let stream_id = params.stream_id.clone();
    let handle = registry
        .register(
            stream_id.clone(),
            RegisterOptions {
                deadline: Some(deadline),
                abort: None,
            },
        )
        .await?;
    let (stream_id, mut chunks, stats_rx) = handle.into_parts();
    let (chunk_tx, chunk_rx) = mpsc::channel(256);
    let (abort_handle, abort_token) = abort_pair();

    // Dispatch the generate call; a dispatch failure fails the primary.
    {
        let batcher = batcher.clone();
        let registry = registry.clone();
        let stream_id = stream_id.clone();
        let chunk_tx = chunk_tx.clone();
        let params = params.clone();
        tokio::spawn(async move {
            if let Err(e) = batcher
                .enqueue(
                    params,
                    EnqueueOptions {
                        priority,
                        timeout: Some(deadline),
                        abort: None,
                    },
                )
                .await
            {
                error!(%stream_id, error = %e, "generate dispatch failed");
                let _ = chunk_tx.send(Err(e)).await;
                registry.cancel(stream_id).await;
            }
        });
    }

    // Chunk pump: registry stream -> primary channel.
    tokio::spawn(async move {
        let started = Instant::now();
        loop {
            tokio::select! {
                chunk = chunks.recv() => {
                    let Some(chunk) = chunk else { break };
                    let text = chunk.text();
                    if !text.is_empty()
                        && chunk_tx.send(Ok(WorkerChunk::Token(text))).await.is_err()
                    {
                        // Coalescer gone; upstream cancel follows via abort.
                        break;
                    }
                    registry.acknowledge_chunk(stream_id.clone(), 1).await;
                }
                _ = abort_token.cancelled() => {
                    debug!(%stream_id, "all subscribers gone; cancelling upstream");
                    registry.cancel(stream_id.clone()).await;
                    return;
                }
            }
        }
        match stats_rx.await {
            Ok(Ok(stream_stats)) => {
                let _ = chunk_tx
                    .send(Ok(WorkerChunk::Done {
                        tokens_generated: stream_stats.tokens_generated,
                        duration_ms: started.elapsed().as_millis() as u64,
                    }))
                    .await;
            }
            Ok(Err(e)) => {
                let _ = chunk_tx.send(Err(e)).await;
            }
            Err(_) => {}
        }
    });

    Ok(Primary {
        stream: chunk_rx,
        abort: abort_handle,
    })
}

async fn load_model(control: &Arc<dyn GenerateClient>, model: &str) -> Result<(), ClusterError> {
    let params = serde_json::to_value(LoadModelParams::new(model))
        .map_err(|e| ClusterError::Bridge(weft_bridge::BridgeError::Protocol(e.into())))?;
    control
        .call(LOAD_MODEL, params, None, None)
        .await
        .map(|_| ())
        .map_err(ClusterError::from)
}

async fn publish_error(
    bus: &Arc<dyn MessageBus>,
    request_id: &RequestId,
    code: ErrorCode,
    message: &str,
) {
    let _ = publish_json(
        bus.as_ref(),
        &response_subject(request_id),
        &ResponseMessage::Error {
            code,
            message: message.to_owned(),
        },
    )
    .await;
}
