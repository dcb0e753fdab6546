//! Fleet-layer error type.

use weft_types::ErrorCode;

/// Failures surfaced by the controller and worker layers.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("no workers available for model {model_id}")]
    NoWorkers { model_id: String },

    #[error("worker {worker_id} timed out")]
    WorkerTimeout { worker_id: weft_types::WorkerId },

    #[error("inference queue full")]
    QueueFull,

    #[error("resource limit exceeded")]
    ResourceLimit,

    #[error("worker reported {code}: {message}")]
    Upstream { code: ErrorCode, message: String },

    #[error("node is shutting down")]
    Draining,

    #[error(transparent)]
    Bus(#[from] weft_bus::BusError),

    #[error(transparent)]
    Sched(#[from] weft_core::SchedError),

    #[error(transparent)]
    Bridge(#[from] weft_bridge::BridgeError),
}

impl ClusterError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NoWorkers { .. } => ErrorCode::WorkerUnavailable,
            Self::WorkerTimeout { .. } => ErrorCode::WorkerTimeout,
            Self::QueueFull => ErrorCode::QueueFull,
            Self::ResourceLimit => ErrorCode::ResourceLimitExceeded,
            Self::Upstream { code, .. } => *code,
            Self::Draining => ErrorCode::WorkerUnavailable,
            Self::Bus(_) => ErrorCode::InternalError,
            Self::Sched(e) => e.code(),
            Self::Bridge(e) => e.code(),
        }
    }
}
