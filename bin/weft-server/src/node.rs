//! Embedded worker wiring.
//!
//! Assembles the full bridge stack over a spawned generation runtime
//! (transport, circuit breaker, retry client, ops multiplexer, stream
//! registry, batcher, coalescer) and runs a [`WorkerNode`] on the bus.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

use weft_bridge::config::{BridgeConfig, MuxConfig, RetryConfig};
use weft_bridge::mux::OpsMultiplexer;
use weft_bridge::process::{RuntimeProcess, RuntimeProcessConfig};
use weft_bridge::resilience::circuit::{CircuitBreaker, CircuitBreakerConfig};
use weft_bridge::resilience::client::ResilientClient;
use weft_bridge::transport::Transport;
use weft_bus::MessageBus;
use weft_cluster::worker::{WorkerConfigBuilder, WorkerHandles, WorkerNode};
use weft_core::batcher::{BatcherConfig, GenerateBatcher};
use weft_core::coalesce::{CoalesceConfig, CoalescingRegistry};
use weft_core::registry::{RegistryConfig, StreamRegistry};

use crate::config::Config;

/// The embedded worker and its runtime process.
pub struct EmbeddedWorker {
    pub node: WorkerNode,
    transport: Transport,
    process: RuntimeProcess,
}

impl EmbeddedWorker {
    /// Spawn the generation runtime and bring a worker node up on `bus`.
    pub async fn start(bus: Arc<dyn MessageBus>, cfg: &Config) -> anyhow::Result<Self> {
        let (transport, process) = RuntimeProcess::spawn(
            &RuntimeProcessConfig {
                command: cfg.runtime_command.clone(),
                args: cfg.runtime_args.clone(),
                envs: Vec::new(),
            },
            BridgeConfig::default(),
        )
        .with_context(|| format!("spawning generation runtime '{}'", cfg.runtime_command))?;

        let circuit = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default()));
        let client = ResilientClient::new(transport.clone(), circuit, RetryConfig::default());
        let mux = OpsMultiplexer::new(client.clone(), MuxConfig::default());

        let registry = StreamRegistry::start(RegistryConfig {
            max_concurrent_streams: cfg.worker_max_concurrent.max(1) * 4,
            initial_limit: cfg.worker_max_concurrent.max(1) * 2,
            ..RegistryConfig::default()
        });
        registry.wire_notifications(&transport);

        let batcher = GenerateBatcher::start(
            Arc::new(client.clone()),
            Some(registry.clone()),
            BatcherConfig::default(),
        );
        let coalescer = CoalescingRegistry::new(CoalesceConfig::default());

        let worker_config = WorkerConfigBuilder::default()
            .models(cfg.models.clone())
            .prewarm(cfg.prewarm.clone())
            .register_when(cfg.register_when)
            .heartbeat_interval(cfg.heartbeat_interval)
            .queue_capacity(cfg.worker_queue_capacity)
            .max_concurrent(cfg.worker_max_concurrent)
            .build()
            .context("assembling worker config")?;
        let node = WorkerNode::start(
            bus,
            WorkerHandles {
                control: Arc::new(mux),
                batcher,
                registry,
                coalescer,
            },
            worker_config,
        )
        .await
        .context("starting embedded worker")?;

        info!(worker_id = %node.worker_id(), pid = ?process.pid(), "embedded worker running");
        Ok(Self {
            node,
            transport,
            process,
        })
    }

    /// Drain the worker, ask the runtime to exit, and close the bridge.
    pub async fn shutdown(mut self) {
        self.node.stop().await;

        let polite = self
            .transport
            .request(
                weft_proto::methods::SHUTDOWN,
                serde_json::Value::Null,
                weft_bridge::transport::RequestOptions::with_timeout(Duration::from_secs(2)),
            )
            .await;
        if let Err(e) = polite {
            warn!(error = %e, "runtime shutdown rpc failed; killing the process");
        }

        self.transport.close().await;
        if let Err(e) = self.process.kill().await {
            warn!(error = %e, "runtime process kill failed (may have already exited)");
        }
    }
}
