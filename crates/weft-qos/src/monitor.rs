//! The QoS monitor actor: evaluator + policy store + executor.
//!
//! One task owns all three, so every mutation is serialized. Violations
//! are matched against the policy store on each evaluation tick and the
//! winning policy's remediations run through the executor; the executor's
//! own gates (cooldown, rate limit, loop breaker) bound how often that
//! actually does anything.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::debug;

use crate::QosError;
use crate::evaluator::{Evaluation, QosEvent, Slo, SloEvaluator, SloMetric};
use crate::executor::{
    ActionHandler, ExecutorConfig, ExecutorEvent, RemediationExecutor, ViolationContext,
};
use crate::policy::{Policy, PolicyStore};

/// Monitor knobs.
#[derive(Debug, Clone)]
pub struct QosMonitorConfig {
    pub evaluation_interval: Duration,
    pub executor: ExecutorConfig,
}

impl Default for QosMonitorConfig {
    fn default() -> Self {
        Self {
            evaluation_interval: Duration::from_secs(5),
            executor: ExecutorConfig::default(),
        }
    }
}

enum Command {
    Record {
        metric: SloMetric,
        value: f64,
        tenant_id: Option<String>,
        model_id: Option<String>,
    },
    AddSlo(Slo),
    RemoveSlo(String),
    AddPolicy(Policy),
    ResetBreaker(String),
    ActiveViolations {
        reply: oneshot::Sender<Vec<Evaluation>>,
    },
}

/// Cloneable handle to the monitor actor.
#[derive(Clone)]
pub struct QosMonitor {
    cmd_tx: mpsc::Sender<Command>,
    qos_events: broadcast::Sender<QosEvent>,
    executor_events: broadcast::Sender<ExecutorEvent>,
}

impl QosMonitor {
    pub fn start(
        policies: PolicyStore,
        handler: Arc<dyn ActionHandler>,
        config: QosMonitorConfig,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(1024);
        let (qos_events, _) = broadcast::channel(256);
        let executor = RemediationExecutor::new(handler, config.executor.clone());
        let executor_events = executor.event_channel();

        tokio::spawn(run_loop(
            config,
            policies,
            executor,
            cmd_rx,
            qos_events.clone(),
        ));

        Self {
            cmd_tx,
            qos_events,
            executor_events,
        }
    }

    /// Feed one metric sample.
    pub async fn record(
        &self,
        metric: SloMetric,
        value: f64,
        tenant_id: Option<String>,
        model_id: Option<String>,
    ) {
        let _ = self
            .cmd_tx
            .send(Command::Record {
                metric,
                value,
                tenant_id,
                model_id,
            })
            .await;
    }

    pub async fn add_slo(&self, slo: Slo) {
        let _ = self.cmd_tx.send(Command::AddSlo(slo)).await;
    }

    pub async fn remove_slo(&self, name: impl Into<String>) {
        let _ = self.cmd_tx.send(Command::RemoveSlo(name.into())).await;
    }

    pub async fn add_policy(&self, policy: Policy) {
        let _ = self.cmd_tx.send(Command::AddPolicy(policy)).await;
    }

    /// Re-arm a tripped remediation breaker.
    pub async fn reset_breaker(&self, action_key: impl Into<String>) {
        let _ = self
            .cmd_tx
            .send(Command::ResetBreaker(action_key.into()))
            .await;
    }

    /// Violation / recovery transitions.
    pub fn events(&self) -> broadcast::Receiver<QosEvent> {
        self.qos_events.subscribe()
    }

    /// Remediation outcomes.
    pub fn executor_events(&self) -> broadcast::Receiver<ExecutorEvent> {
        self.executor_events.subscribe()
    }

    pub async fn active_violations(&self) -> Result<Vec<Evaluation>, QosError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::ActiveViolations { reply: reply_tx })
            .await
            .map_err(|_| QosError::Closed)?;
        reply_rx.await.map_err(|_| QosError::Closed)
    }
}

async fn run_loop(
    config: QosMonitorConfig,
    mut policies: PolicyStore,
    mut executor: RemediationExecutor,
    mut cmd_rx: mpsc::Receiver<Command>,
    qos_events: broadcast::Sender<QosEvent>,
) {
    let mut evaluator = SloEvaluator::new();
    let mut ticker = tokio::time::interval(config.evaluation_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break };
                match cmd {
                    Command::Record { metric, value, tenant_id, model_id } => {
                        evaluator.record(metric, value, tenant_id, model_id);
                    }
                    Command::AddSlo(slo) => evaluator.add_slo(slo),
                    Command::RemoveSlo(name) => evaluator.remove_slo(&name),
                    Command::AddPolicy(policy) => policies.add(policy),
                    Command::ResetBreaker(action_key) => executor.reset(&action_key),
                    Command::ActiveViolations { reply } => {
                        let _ = reply.send(evaluator.active_violations());
                    }
                }
            }
            _ = ticker.tick() => {
                let (events, evaluations) = evaluator.evaluate_all();
                for event in events {
                    let _ = qos_events.send(event);
                }

                // Remediate everything currently in violation; the
                // executor's gates bound the blast radius.
                for evaluation in evaluations.iter().filter(|e| e.violated) {
                    let Some(policy) = policies.select(
                        evaluation.tenant_id.as_deref(),
                        evaluation.model_id.as_deref(),
                    ) else {
                        debug!(slo = %evaluation.slo_name, "violation without a matching policy");
                        continue;
                    };
                    let context = ViolationContext {
                        slo_name: evaluation.slo_name.clone(),
                        tenant_id: evaluation.tenant_id.clone(),
                        model_id: evaluation.model_id.clone(),
                        current_value: evaluation.current_value,
                        threshold: evaluation.threshold,
                    };
                    let remediations = policy.remediations.clone();
                    for action in remediations {
                        executor.execute(action, &context).await;
                    }
                }
            }
        }
    }
    debug!("qos monitor stopped");
}
