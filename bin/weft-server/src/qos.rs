//! QoS monitor wiring for the server node.
//!
//! The edge feeds per-request measurements into the monitor; SLOs come
//! from config. Remediations on a single node reduce to alerting, so the
//! handler logs every action at a level matching its intent.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, warn};

use weft_qos::{
    ActionHandler, Policy, PolicyStore, QosError, QosMonitor, QosMonitorConfig, RemediationAction,
    Severity, Slo, SloMetric, ViolationContext,
};

use crate::config::Config;

/// Logs remediations instead of driving external scaling APIs.
struct LoggingActionHandler;

#[async_trait]
impl ActionHandler for LoggingActionHandler {
    async fn run(
        &self,
        action: RemediationAction,
        context: &ViolationContext,
    ) -> Result<(), QosError> {
        match action {
            RemediationAction::Alert => warn!(
                slo = %context.slo_name,
                value = context.current_value,
                threshold = context.threshold,
                "slo violated"
            ),
            other => error!(
                slo = %context.slo_name,
                action = %other,
                "remediation requested; no scaling backend on a single node"
            ),
        }
        Ok(())
    }
}

/// Build the monitor with the config-declared SLOs and a default alerting
/// policy.
pub fn start(config: &Config) -> QosMonitor {
    let policies = PolicyStore::new().with(Policy {
        name: "default-alerting".into(),
        priority: 0,
        tenant_id: None,
        model_id: None,
        remediations: vec![RemediationAction::Alert],
    });
    let monitor = QosMonitor::start(
        policies,
        Arc::new(LoggingActionHandler),
        QosMonitorConfig::default(),
    );

    let monitor_for_setup = monitor.clone();
    let ttft = config.slo_ttft_ms;
    let latency = config.slo_latency_ms;
    tokio::spawn(async move {
        if let Some(threshold) = ttft {
            monitor_for_setup
                .add_slo(Slo {
                    name: "ttft-p95".into(),
                    metric: SloMetric::Ttft,
                    threshold,
                    window: Duration::from_secs(60),
                    severity: Severity::Warning,
                    tenant_id: None,
                    model_id: None,
                })
                .await;
        }
        if let Some(threshold) = latency {
            monitor_for_setup
                .add_slo(Slo {
                    name: "latency-p95".into(),
                    metric: SloMetric::LatencyP95,
                    threshold,
                    window: Duration::from_secs(60),
                    severity: Severity::Warning,
                    tenant_id: None,
                    model_id: None,
                })
                .await;
        }
    });

    monitor
}
