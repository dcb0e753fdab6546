//! QoS monitoring: windowed SLO evaluation and bounded remediation.
//!
//! The evaluator keeps bounded sample windows per metric and judges each
//! registered SLO on an interval, de-duplicating active violations. Every
//! violation is matched against the policy store; the highest-priority
//! matching policy's remediations run through the executor, which applies
//! cooldowns, a rolling rate limit, alternation (loop) detection, and a
//! per-action-key circuit breaker. Remediation failures are logged and
//! counted, never propagated to the request path.

pub mod evaluator;
pub mod executor;
pub mod monitor;
pub mod policy;

pub use evaluator::{Evaluation, QosEvent, Severity, Slo, SloMetric};
pub use executor::{
    ActionHandler, ExecutorConfig, ExecutorEvent, RemediationExecutor, ViolationContext,
};
pub use monitor::{QosMonitor, QosMonitorConfig};
pub use policy::{Policy, PolicyStore, RemediationAction};

/// QoS-layer failures (API misuse and handler errors).
#[derive(Debug, thiserror::Error)]
pub enum QosError {
    #[error("unknown slo {0}")]
    UnknownSlo(String),

    #[error("remediation handler failed: {0}")]
    Handler(String),

    #[error("monitor shut down")]
    Closed,
}
