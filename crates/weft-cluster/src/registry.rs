//! Controller-side worker registry.
//!
//! A single bus-handler task applies register / heartbeat / deregister
//! messages; everyone else reads immutable snapshots. Workers with a stale
//! heartbeat count as offline at read time, so no sweeper is needed.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use weft_bridge::resilience::circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use weft_bus::MessageBus;
use weft_proto::bus::{
    DeregisterMessage, HeartbeatMessage, RegisterMessage, WORKER_DEREGISTER, WORKER_HEARTBEAT,
    WORKER_REGISTER, WorkerSkills, WorkerStatus,
};
use weft_types::WorkerId;

/// Registry knobs.
#[derive(Debug, Clone)]
pub struct WorkerRegistryConfig {
    /// A worker whose last heartbeat is older than this is offline.
    pub offline_timeout: Duration,
    /// Capacity assumed for workers that have not reported one.
    pub default_capacity: u32,
    /// Per-worker circuit-breaker thresholds.
    pub circuit: CircuitBreakerConfig,
}

impl Default for WorkerRegistryConfig {
    fn default() -> Self {
        Self {
            offline_timeout: Duration::from_secs(15),
            default_capacity: 8,
            circuit: CircuitBreakerConfig::default(),
        }
    }
}

struct WorkerRecord {
    hostname: String,
    ip: String,
    port: u16,
    skills: WorkerSkills,
    status: WorkerStatus,
    current_load: u32,
    capacity: u32,
    avg_latency_ms: f64,
    total_handled: u64,
    circuit: Arc<CircuitBreaker>,
    last_heartbeat_at: Instant,
}

/// Immutable per-worker view handed to routing.
#[derive(Clone)]
pub struct WorkerView {
    pub worker_id: WorkerId,
    pub hostname: String,
    pub ip: String,
    pub port: u16,
    pub skills: WorkerSkills,
    pub status: WorkerStatus,
    pub current_load: u32,
    pub capacity: u32,
    pub avg_latency_ms: f64,
    pub total_handled: u64,
    pub circuit: Arc<CircuitBreaker>,
}

impl WorkerView {
    pub fn load_ratio(&self) -> f64 {
        if self.capacity == 0 {
            1.0
        } else {
            self.current_load as f64 / self.capacity as f64
        }
    }

    /// Routing eligibility for one model.
    pub fn eligible_for(&self, model_id: &str) -> bool {
        self.status != WorkerStatus::Offline
            && self.circuit.snapshot().state != CircuitState::Open
            && self
                .skills
                .available_models
                .iter()
                .any(|m| m == model_id)
    }
}

/// Shared worker table. Mutations come only from the bus-handler task
/// spawned by [`WorkerRegistry::attach`].
#[derive(Clone)]
pub struct WorkerRegistry {
    inner: Arc<RwLock<HashMap<WorkerId, WorkerRecord>>>,
    config: Arc<WorkerRegistryConfig>,
}

impl WorkerRegistry {
    pub fn new(config: WorkerRegistryConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            config: Arc::new(config),
        }
    }

    /// Subscribe to the fleet subjects and apply every update. Returns
    /// once subscriptions are in place; processing runs in the background.
    pub async fn attach(&self, bus: Arc<dyn MessageBus>) -> Result<(), weft_bus::BusError> {
        let registrations = bus.subscribe(WORKER_REGISTER).await?;
        let heartbeats = bus.subscribe(WORKER_HEARTBEAT).await?;
        let deregistrations = bus.subscribe(WORKER_DEREGISTER).await?;

        let registry = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = registrations.recv() => match msg {
                        Some(msg) => match serde_json::from_value::<RegisterMessage>(msg.payload) {
                            Ok(register) => registry.apply_register(register),
                            Err(e) => warn!(error = %e, "malformed worker.register"),
                        },
                        None => break,
                    },
                    msg = heartbeats.recv() => match msg {
                        Some(msg) => match serde_json::from_value::<HeartbeatMessage>(msg.payload) {
                            Ok(heartbeat) => registry.apply_heartbeat(heartbeat),
                            Err(e) => warn!(error = %e, "malformed worker.heartbeat"),
                        },
                        None => break,
                    },
                    msg = deregistrations.recv() => match msg {
                        Some(msg) => match serde_json::from_value::<DeregisterMessage>(msg.payload) {
                            Ok(deregister) => registry.apply_deregister(deregister),
                            Err(e) => warn!(error = %e, "malformed worker.deregister"),
                        },
                        None => break,
                    },
                }
            }
            debug!("worker-registry bus handler stopped");
        });
        Ok(())
    }

    /// Register or refresh a worker (duplicates are refreshes).
    pub fn apply_register(&self, msg: RegisterMessage) {
        let mut table = self.inner.write().expect("registry lock");
        let now = Instant::now();
        match table.get_mut(&msg.worker_id) {
            Some(record) => {
                record.skills = msg.skills;
                record.status = msg.status;
                record.hostname = msg.hostname;
                record.ip = msg.ip;
                record.port = msg.port;
                record.last_heartbeat_at = now;
            }
            None => {
                info!(worker_id = %msg.worker_id, models = msg.skills.available_models.len(), "worker registered");
                table.insert(
                    msg.worker_id,
                    WorkerRecord {
                        hostname: msg.hostname,
                        ip: msg.ip,
                        port: msg.port,
                        skills: msg.skills,
                        status: msg.status,
                        current_load: 0,
                        capacity: self.config.default_capacity,
                        avg_latency_ms: 0.0,
                        total_handled: 0,
                        circuit: Arc::new(CircuitBreaker::new(self.config.circuit.clone())),
                        last_heartbeat_at: now,
                    },
                );
            }
        }
    }

    pub fn apply_heartbeat(&self, msg: HeartbeatMessage) {
        let mut table = self.inner.write().expect("registry lock");
        if let Some(record) = table.get_mut(&msg.worker_id) {
            record.current_load = msg.active_requests;
            record.avg_latency_ms = msg.avg_latency_ms;
            record.total_handled = msg.total_handled;
            record.last_heartbeat_at = Instant::now();
            if record.status == WorkerStatus::Offline {
                record.status = WorkerStatus::Online;
            }
        } else {
            debug!(worker_id = %msg.worker_id, "heartbeat from unknown worker (waiting for register)");
        }
    }

    pub fn apply_deregister(&self, msg: DeregisterMessage) {
        let mut table = self.inner.write().expect("registry lock");
        if table.remove(&msg.worker_id).is_some() {
            info!(worker_id = %msg.worker_id, "worker deregistered");
        }
    }

    /// Snapshot of every known worker, with heartbeat-based offline
    /// detection applied.
    pub fn snapshot(&self) -> Vec<WorkerView> {
        let table = self.inner.read().expect("registry lock");
        let now = Instant::now();
        table
            .iter()
            .map(|(worker_id, record)| {
                let status = if now.duration_since(record.last_heartbeat_at)
                    > self.config.offline_timeout
                {
                    WorkerStatus::Offline
                } else {
                    record.status
                };
                WorkerView {
                    worker_id: worker_id.clone(),
                    hostname: record.hostname.clone(),
                    ip: record.ip.clone(),
                    port: record.port,
                    skills: record.skills.clone(),
                    status,
                    current_load: record.current_load,
                    capacity: record.capacity,
                    avg_latency_ms: record.avg_latency_ms,
                    total_handled: record.total_handled,
                    circuit: Arc::clone(&record.circuit),
                }
            })
            .collect()
    }

    /// Workers currently eligible to serve `model_id`.
    pub fn eligible(&self, model_id: &str) -> Vec<WorkerView> {
        let mut views: Vec<WorkerView> = self
            .snapshot()
            .into_iter()
            .filter(|v| v.eligible_for(model_id))
            .collect();
        // Stable order keeps round-robin deterministic.
        views.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        views
    }
}
