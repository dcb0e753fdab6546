//! Fleet layer: the controller that routes client inference onto workers,
//! and the worker node that executes it through the bridge.
//!
//! Controller and workers only ever meet on the message bus: workers
//! announce themselves on `worker.register` and refresh liveness on
//! `worker.heartbeat`; the controller routes each request to one worker's
//! inference subject and consumes its `response.<request_id>` stream.

pub mod controller;
pub mod error;
pub mod registry;
pub mod routing;
pub mod worker;

pub use controller::{Controller, ControllerConfig, InferenceChunk, InferenceRequest, RequestMetrics, RetryPolicyConfig};
pub use error::ClusterError;
pub use registry::{WorkerRegistry, WorkerRegistryConfig, WorkerView};
pub use routing::RoutingStrategy;
pub use worker::{
    Permit, PriorityQueue, RegisterWhen, ResourceManager, WorkerChunk, WorkerConfig,
    WorkerConfigBuilder, WorkerHandles, WorkerNode, WorkerState,
};
