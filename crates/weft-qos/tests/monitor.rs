//! End-to-end monitor scenario: a TTFT SLO violation triggers exactly one
//! remediation, and a repeat violation inside the cooldown is rate limited.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use weft_qos::{
    ActionHandler, ExecutorConfig, ExecutorEvent, Policy, PolicyStore, QosError, QosEvent,
    QosMonitor, QosMonitorConfig, RemediationAction, Severity, Slo, SloMetric, ViolationContext,
};

struct Recorder {
    runs: Mutex<Vec<RemediationAction>>,
}

#[async_trait]
impl ActionHandler for Recorder {
    async fn run(
        &self,
        action: RemediationAction,
        _context: &ViolationContext,
    ) -> Result<(), QosError> {
        self.runs.lock().unwrap().push(action);
        Ok(())
    }
}

fn ttft_slo() -> Slo {
    Slo {
        name: "ttft-p95".into(),
        metric: SloMetric::Ttft,
        threshold: 250.0,
        window: Duration::from_secs(5),
        severity: Severity::Critical,
        tenant_id: None,
        model_id: None,
    }
}

fn scale_up_policy() -> PolicyStore {
    PolicyStore::new().with(Policy {
        name: "default-scaling".into(),
        priority: 1,
        tenant_id: None,
        model_id: None,
        remediations: vec![RemediationAction::ScaleUp],
    })
}

#[tokio::test(start_paused = true)]
async fn violation_remediates_once_then_rate_limits() {
    let recorder = Arc::new(Recorder {
        runs: Mutex::new(Vec::new()),
    });
    let monitor = QosMonitor::start(
        scale_up_policy(),
        Arc::clone(&recorder) as Arc<dyn ActionHandler>,
        QosMonitorConfig {
            evaluation_interval: Duration::from_millis(100),
            executor: ExecutorConfig {
                cooldown: Duration::from_secs(60),
                max_executions_per_window: 10,
                execution_window: Duration::from_secs(600),
                loop_detection_window: 6,
            },
        },
    );
    let mut events = monitor.events();
    let mut exec_events = monitor.executor_events();

    monitor.add_slo(ttft_slo()).await;
    // p95 lands at ~300ms, over the 250ms threshold.
    for _ in 0..20 {
        monitor.record(SloMetric::Ttft, 300.0, None, None).await;
    }

    // Next tick: violation event plus one executed remediation.
    match events.recv().await.unwrap() {
        QosEvent::Violation(eval) => {
            assert_eq!(eval.slo_name, "ttft-p95");
            assert!(eval.current_value > 250.0);
        }
        other => panic!("expected violation, got {other:?}"),
    }
    match exec_events.recv().await.unwrap() {
        ExecutorEvent::Executed { action, .. } => {
            assert_eq!(action, RemediationAction::ScaleUp);
        }
        other => panic!("expected executed, got {other:?}"),
    }

    // The violation persists into the next tick: deduplicated on the
    // event stream, rate-limited at the executor.
    match exec_events.recv().await.unwrap() {
        ExecutorEvent::RateLimited { .. } => {}
        other => panic!("expected rate-limited, got {other:?}"),
    }
    assert_eq!(
        recorder.runs.lock().unwrap().len(),
        1,
        "exactly one execution inside the cooldown"
    );

    let active = monitor.active_violations().await.unwrap();
    assert_eq!(active.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn recovery_event_follows_once_samples_age_out() {
    let recorder = Arc::new(Recorder {
        runs: Mutex::new(Vec::new()),
    });
    let monitor = QosMonitor::start(
        scale_up_policy(),
        recorder as Arc<dyn ActionHandler>,
        QosMonitorConfig {
            evaluation_interval: Duration::from_millis(100),
            executor: ExecutorConfig::default(),
        },
    );
    let mut events = monitor.events();

    monitor.add_slo(ttft_slo()).await;
    for _ in 0..10 {
        monitor.record(SloMetric::Ttft, 400.0, None, None).await;
    }
    assert!(matches!(
        events.recv().await.unwrap(),
        QosEvent::Violation(_)
    ));

    // Samples age past the 5 s window; the SLO recovers.
    assert!(matches!(events.recv().await.unwrap(), QosEvent::Recovery(_)));
    assert!(monitor.active_violations().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn scoped_policy_outranks_the_default() {
    let recorder = Arc::new(Recorder {
        runs: Mutex::new(Vec::new()),
    });
    let policies = scale_up_policy().with(Policy {
        name: "acme-alerting".into(),
        priority: 10,
        tenant_id: Some("acme".into()),
        model_id: None,
        remediations: vec![RemediationAction::Alert],
    });
    let monitor = QosMonitor::start(
        policies,
        Arc::clone(&recorder) as Arc<dyn ActionHandler>,
        QosMonitorConfig {
            evaluation_interval: Duration::from_millis(100),
            executor: ExecutorConfig::default(),
        },
    );
    let mut exec_events = monitor.executor_events();

    let mut slo = ttft_slo();
    slo.tenant_id = Some("acme".into());
    monitor.add_slo(slo).await;
    for _ in 0..10 {
        monitor
            .record(SloMetric::Ttft, 400.0, Some("acme".into()), None)
            .await;
    }

    match exec_events.recv().await.unwrap() {
        ExecutorEvent::Executed { action, .. } => {
            // Only the winning policy's remediation ran.
            assert_eq!(action, RemediationAction::Alert);
        }
        other => panic!("expected executed, got {other:?}"),
    }
    assert_eq!(
        recorder.runs.lock().unwrap().as_slice(),
        &[RemediationAction::Alert]
    );
}
