//! Controller: the north-facing router.
//!
//! Validates an inference request, picks an eligible worker under the
//! active routing strategy, forwards the request over the bus, and relays
//! the worker's token stream back to the caller. Failures with a
//! retryable code re-select a different worker (never one already tried
//! for this request) until the retry budget runs out. When no worker
//! advertises the model the call fails immediately rather than waiting
//! for one to appear.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use weft_bus::{MessageBus, publish_json};
use weft_proto::bus::{InferenceRequestMessage, ResponseMessage, inference_subject, response_subject};
use weft_types::{ErrorCode, Fingerprint, GenerateParams, Priority, RequestId, StreamId, WorkerId};

use crate::error::ClusterError;
use crate::registry::{WorkerRegistry, WorkerRegistryConfig, WorkerView};
use crate::routing::RoutingStrategy;

const METRICS_HISTORY: usize = 1024;

/// Per-request retry policy.
#[derive(Debug, Clone)]
pub struct RetryPolicyConfig {
    pub enabled: bool,
    pub max_retries: u32,
    pub delay: Duration,
    /// Explicit allow-list; `None` falls back to [`ErrorCode::is_retryable`].
    pub retryable_codes: Option<Vec<ErrorCode>>,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 2,
            delay: Duration::from_millis(100),
            retryable_codes: None,
        }
    }
}

impl RetryPolicyConfig {
    fn allows(&self, code: ErrorCode) -> bool {
        match &self.retryable_codes {
            Some(codes) => codes.contains(&code),
            None => code.is_retryable(),
        }
    }
}

/// Controller knobs.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub strategy: RoutingStrategy,
    /// Per-attempt deadline for buffered (non-streaming) requests.
    pub request_timeout: Duration,
    /// Per-attempt deadline for streaming requests (longer: covers the
    /// whole token stream).
    pub streaming_timeout: Duration,
    pub retry: RetryPolicyConfig,
    pub registry: WorkerRegistryConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            strategy: RoutingStrategy::LeastLoaded,
            request_timeout: Duration::from_secs(30),
            streaming_timeout: Duration::from_secs(300),
            retry: RetryPolicyConfig::default(),
            registry: WorkerRegistryConfig::default(),
        }
    }
}

/// A client inference call.
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub request_id: RequestId,
    pub model_id: String,
    pub prompt: String,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub stream: bool,
    pub priority: Option<Priority>,
}

/// Chunks relayed to the caller. `Done` and `Error` are terminal.
#[derive(Debug, Clone, PartialEq)]
pub enum InferenceChunk {
    Token { text: String },
    Done { tokens_generated: u64, duration_ms: u64 },
    Error { code: ErrorCode, message: String },
}

/// Observability record kept per request.
#[derive(Debug, Clone)]
pub struct RequestMetrics {
    pub duration_ms: u64,
    pub retry_count: u32,
    pub timeouts: u32,
    pub final_error_code: Option<ErrorCode>,
    pub worker_id: Option<WorkerId>,
}

#[derive(Default)]
struct MetricsStore {
    by_request: HashMap<RequestId, RequestMetrics>,
    order: VecDeque<RequestId>,
}

impl MetricsStore {
    fn push(&mut self, request_id: RequestId, metrics: RequestMetrics) {
        if self.by_request.insert(request_id.clone(), metrics).is_none() {
            self.order.push_back(request_id);
        }
        while self.order.len() > METRICS_HISTORY {
            if let Some(evicted) = self.order.pop_front() {
                self.by_request.remove(&evicted);
            }
        }
    }
}

/// North-facing router handle.
#[derive(Clone)]
pub struct Controller {
    bus: Arc<dyn MessageBus>,
    registry: WorkerRegistry,
    config: Arc<ControllerConfig>,
    round_robin: Arc<AtomicUsize>,
    metrics: Arc<Mutex<MetricsStore>>,
}

impl Controller {
    /// Wire a controller onto the bus and start consuming fleet updates.
    pub async fn start(
        bus: Arc<dyn MessageBus>,
        config: ControllerConfig,
    ) -> Result<Self, ClusterError> {
        let registry = WorkerRegistry::new(config.registry.clone());
        registry.attach(Arc::clone(&bus)).await?;
        Ok(Self {
            bus,
            registry,
            config: Arc::new(config),
            round_robin: Arc::new(AtomicUsize::new(0)),
            metrics: Arc::new(Mutex::new(MetricsStore::default())),
        })
    }

    pub fn worker_registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    /// Models served by at least one live worker.
    pub fn available_models(&self) -> Vec<String> {
        let mut models: Vec<String> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|w| w.status != weft_proto::bus::WorkerStatus::Offline)
            .flat_map(|w| w.skills.available_models)
            .collect();
        models.sort();
        models.dedup();
        models
    }

    pub fn request_metrics(&self, request_id: &RequestId) -> Option<RequestMetrics> {
        self.metrics
            .lock()
            .expect("metrics lock")
            .by_request
            .get(request_id)
            .cloned()
    }

    /// Route one inference request and stream its chunks back.
    ///
    /// Fails fast with [`ClusterError::NoWorkers`] when no eligible worker
    /// advertises the model.
    pub async fn handle_inference_request(
        &self,
        request: InferenceRequest,
    ) -> Result<mpsc::Receiver<InferenceChunk>, ClusterError> {
        let eligible = self.registry.eligible(&request.model_id);
        if eligible.is_empty() {
            self.record(
                request.request_id.clone(),
                RequestMetrics {
                    duration_ms: 0,
                    retry_count: 0,
                    timeouts: 0,
                    final_error_code: Some(ErrorCode::WorkerUnavailable),
                    worker_id: None,
                },
            );
            return Err(ClusterError::NoWorkers {
                model_id: request.model_id,
            });
        }

        let (out_tx, out_rx) = mpsc::channel(256);
        let controller = self.clone();
        tokio::spawn(async move {
            controller.drive_request(request, out_tx).await;
        });
        Ok(out_rx)
    }

    async fn drive_request(&self, request: InferenceRequest, out_tx: mpsc::Sender<InferenceChunk>) {
        let started = Instant::now();
        let per_attempt = if request.stream {
            self.config.streaming_timeout
        } else {
            self.config.request_timeout
        };
        let max_attempts = if self.config.retry.enabled {
            1 + self.config.retry.max_retries
        } else {
            1
        };

        let hash = {
            // Fingerprints ignore stream identity, so a throwaway id is fine.
            let params = self.build_params(&request, StreamId::new("hash"));
            Fingerprint::of(&params)
        };

        let mut tried: HashSet<WorkerId> = HashSet::new();
        let mut retry_count = 0u32;
        let mut timeouts = 0u32;
        let mut last_worker: Option<WorkerId> = None;
        let mut final_error: Option<(ErrorCode, String)> = None;

        for attempt in 1..=max_attempts {
            let candidates: Vec<WorkerView> = self
                .registry
                .eligible(&request.model_id)
                .into_iter()
                .filter(|w| !tried.contains(&w.worker_id))
                .collect();
            let Some(worker_id) =
                self.config
                    .strategy
                    .select(&candidates, &hash, &self.round_robin)
            else {
                if final_error.is_none() {
                    final_error = Some((
                        ErrorCode::WorkerUnavailable,
                        format!("no remaining workers for model {}", request.model_id),
                    ));
                }
                break;
            };
            let Some(view) = candidates.iter().find(|w| w.worker_id == worker_id) else {
                continue;
            };
            tried.insert(worker_id.clone());
            last_worker = Some(worker_id.clone());

            if view.circuit.admit().is_err() {
                final_error = Some((
                    ErrorCode::CircuitOpen,
                    format!("worker {worker_id} circuit open"),
                ));
                continue;
            }

            debug!(request_id = %request.request_id, %worker_id, attempt, "routing inference");
            match self
                .run_attempt(&request, view, per_attempt, &out_tx)
                .await
            {
                AttemptOutcome::Delivered => {
                    self.record(
                        request.request_id.clone(),
                        RequestMetrics {
                            duration_ms: started.elapsed().as_millis() as u64,
                            retry_count,
                            timeouts,
                            final_error_code: None,
                            worker_id: last_worker,
                        },
                    );
                    return;
                }
                AttemptOutcome::ConsumerGone => {
                    debug!(request_id = %request.request_id, "client went away mid-stream");
                    view.circuit.record_cancelled();
                    self.record(
                        request.request_id.clone(),
                        RequestMetrics {
                            duration_ms: started.elapsed().as_millis() as u64,
                            retry_count,
                            timeouts,
                            final_error_code: Some(ErrorCode::Aborted),
                            worker_id: last_worker,
                        },
                    );
                    return;
                }
                AttemptOutcome::Failed {
                    code,
                    message,
                    stream_started,
                } => {
                    view.circuit.record_failure();
                    if code == ErrorCode::WorkerTimeout {
                        timeouts += 1;
                    }
                    let can_retry = self.config.retry.enabled
                        && attempt < max_attempts
                        && self.config.retry.allows(code)
                        && !stream_started;
                    if can_retry {
                        retry_count += 1;
                        warn!(
                            request_id = %request.request_id, %worker_id, %code,
                            "attempt failed; re-selecting a different worker"
                        );
                        tokio::time::sleep(self.config.retry.delay).await;
                        continue;
                    }
                    final_error = Some((code, message));
                    break;
                }
            }
        }

        let (code, message) = final_error.unwrap_or((
            ErrorCode::InternalError,
            "request ended without an outcome".into(),
        ));
        info!(request_id = %request.request_id, %code, retry_count, "inference failed");
        let _ = out_tx.send(InferenceChunk::Error { code, message }).await;
        self.record(
            request.request_id.clone(),
            RequestMetrics {
                duration_ms: started.elapsed().as_millis() as u64,
                retry_count,
                timeouts,
                final_error_code: Some(code),
                worker_id: last_worker,
            },
        );
    }

    async fn run_attempt(
        &self,
        request: &InferenceRequest,
        view: &WorkerView,
        per_attempt: Duration,
        out_tx: &mpsc::Sender<InferenceChunk>,
    ) -> AttemptOutcome {
        // Subscribe before publishing so the first token cannot race past us.
        let responses = match self
            .bus
            .subscribe(&response_subject(&request.request_id))
            .await
        {
            Ok(sub) => sub,
            Err(e) => {
                return AttemptOutcome::Failed {
                    code: ErrorCode::InternalError,
                    message: e.to_string(),
                    stream_started: false,
                };
            }
        };

        let message = InferenceRequestMessage {
            request_id: request.request_id.clone(),
            params: self.build_params(request, StreamId::generate()),
            priority: request.priority,
            timeout_ms: Some(per_attempt.as_millis() as u64),
        };
        if let Err(e) = publish_json(
            self.bus.as_ref(),
            &inference_subject(&view.worker_id),
            &message,
        )
        .await
        {
            return AttemptOutcome::Failed {
                code: ErrorCode::InternalError,
                message: e.to_string(),
                stream_started: false,
            };
        }

        let deadline = Instant::now() + per_attempt;
        let mut stream_started = false;
        loop {
            tokio::select! {
                msg = responses.recv() => {
                    let Some(msg) = msg else {
                        return AttemptOutcome::Failed {
                            code: ErrorCode::InternalError,
                            message: "bus subscription closed".into(),
                            stream_started,
                        };
                    };
                    match serde_json::from_value::<ResponseMessage>(msg.payload) {
                        Ok(ResponseMessage::Token { text }) => {
                            stream_started = true;
                            if out_tx.send(InferenceChunk::Token { text }).await.is_err() {
                                return AttemptOutcome::ConsumerGone;
                            }
                        }
                        Ok(ResponseMessage::Done { tokens_generated, duration_ms }) => {
                            view.circuit.record_success();
                            let _ = out_tx
                                .send(InferenceChunk::Done { tokens_generated, duration_ms })
                                .await;
                            return AttemptOutcome::Delivered;
                        }
                        Ok(ResponseMessage::Error { code, message }) => {
                            return AttemptOutcome::Failed { code, message, stream_started };
                        }
                        Err(e) => {
                            warn!(error = %e, "malformed response message");
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    // The worker applies its own timeout; from here the
                    // attempt is dead and the worker's circuit pays for it.
                    return AttemptOutcome::Failed {
                        code: ErrorCode::WorkerTimeout,
                        message: format!("worker {} exceeded {per_attempt:?}", view.worker_id),
                        stream_started,
                    };
                }
            }
        }
    }

    fn build_params(&self, request: &InferenceRequest, stream_id: StreamId) -> GenerateParams {
        let mut params = GenerateParams::new(&request.model_id, &request.prompt, stream_id);
        params.max_tokens = request.max_tokens;
        params.temperature = request.temperature;
        params.top_p = request.top_p;
        params.streaming = request.stream;
        params
    }

    fn record(&self, request_id: RequestId, metrics: RequestMetrics) {
        self.metrics
            .lock()
            .expect("metrics lock")
            .push(request_id, metrics);
    }
}

enum AttemptOutcome {
    Delivered,
    ConsumerGone,
    Failed {
        code: ErrorCode,
        message: String,
        stream_started: bool,
    },
}
