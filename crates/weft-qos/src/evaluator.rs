//! Windowed SLO evaluation.
//!
//! Samples accumulate in bounded per-metric buffers tagged with their
//! tenant/model scope. Each evaluation pass filters a SLO's window,
//! folds latency-like metrics through an HDR histogram digest for the
//! 95th percentile, and compares against the threshold.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Per-metric sample cap; old samples fall off the back.
const MAX_SAMPLES_PER_METRIC: usize = 8192;
/// Histogram bounds: 1 ms .. 1 h, 3 significant digits.
const DIGEST_HIGH_MS: u64 = 3_600_000;
const DIGEST_SIGFIGS: u8 = 3;

/// Metric a SLO watches.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SloMetric {
    Ttft,
    LatencyP95,
    ErrorRate,
    Throughput,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// A service-level objective over a rolling window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Slo {
    pub name: String,
    pub metric: SloMetric,
    pub threshold: f64,
    #[serde(with = "duration_ms")]
    pub window: Duration,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
}

mod duration_ms {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// One evaluation outcome.
#[derive(Debug, Clone, Serialize)]
pub struct Evaluation {
    pub slo_name: String,
    pub current_value: f64,
    pub threshold: f64,
    pub violated: bool,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    pub tenant_id: Option<String>,
    pub model_id: Option<String>,
}

/// Emitted on violation state transitions (deduplicated while active).
#[derive(Debug, Clone)]
pub enum QosEvent {
    Violation(Evaluation),
    Recovery(Evaluation),
}

struct Sample {
    at: Instant,
    value: f64,
    tenant_id: Option<String>,
    model_id: Option<String>,
}

/// Sample store + SLO table. Single-owner: the monitor task mutates it.
pub struct SloEvaluator {
    samples: HashMap<SloMetric, VecDeque<Sample>>,
    slos: Vec<Slo>,
    active: HashMap<(String, Option<String>, Option<String>), Evaluation>,
}

impl Default for SloEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl SloEvaluator {
    pub fn new() -> Self {
        Self {
            samples: HashMap::new(),
            slos: Vec::new(),
            active: HashMap::new(),
        }
    }

    pub fn add_slo(&mut self, slo: Slo) {
        debug!(name = %slo.name, metric = %slo.metric, threshold = slo.threshold, "slo registered");
        self.slos.retain(|s| s.name != slo.name);
        self.slos.push(slo);
    }

    pub fn remove_slo(&mut self, name: &str) {
        self.slos.retain(|s| s.name != name);
        self.active.retain(|(slo_name, _, _), _| slo_name != name);
    }

    pub fn slos(&self) -> &[Slo] {
        &self.slos
    }

    pub fn record(
        &mut self,
        metric: SloMetric,
        value: f64,
        tenant_id: Option<String>,
        model_id: Option<String>,
    ) {
        let buffer = self.samples.entry(metric).or_default();
        buffer.push_back(Sample {
            at: Instant::now(),
            value,
            tenant_id,
            model_id,
        });
        while buffer.len() > MAX_SAMPLES_PER_METRIC {
            buffer.pop_front();
        }
    }

    /// Evaluate every registered SLO. Returns the transition events
    /// (deduplicated) and the full evaluation list, violated first.
    pub fn evaluate_all(&mut self) -> (Vec<QosEvent>, Vec<Evaluation>) {
        let now = Instant::now();
        let mut events = Vec::new();
        let mut evaluations = Vec::new();

        for slo in &self.slos {
            let evaluation = evaluate_one(&self.samples, slo, now);
            let key = (
                slo.name.clone(),
                slo.tenant_id.clone(),
                slo.model_id.clone(),
            );
            if evaluation.violated {
                if !self.active.contains_key(&key) {
                    events.push(QosEvent::Violation(evaluation.clone()));
                }
                self.active.insert(key, evaluation.clone());
            } else if self.active.remove(&key).is_some() {
                events.push(QosEvent::Recovery(evaluation.clone()));
            }
            evaluations.push(evaluation);
        }

        evaluations.sort_by_key(|e| !e.violated);
        (events, evaluations)
    }

    pub fn active_violations(&self) -> Vec<Evaluation> {
        self.active.values().cloned().collect()
    }
}

fn evaluate_one(
    samples: &HashMap<SloMetric, VecDeque<Sample>>,
    slo: &Slo,
    now: Instant,
) -> Evaluation {
    let in_window: Vec<&Sample> = samples
        .get(&slo.metric)
        .map(|buffer| {
            buffer
                .iter()
                .filter(|s| now.duration_since(s.at) <= slo.window)
                .filter(|s| scope_matches(&slo.tenant_id, &s.tenant_id))
                .filter(|s| scope_matches(&slo.model_id, &s.model_id))
                .collect()
        })
        .unwrap_or_default();

    let current_value = match slo.metric {
        SloMetric::Ttft | SloMetric::LatencyP95 => percentile_95(&in_window),
        SloMetric::ErrorRate => {
            if in_window.is_empty() {
                0.0
            } else {
                in_window.iter().filter(|s| s.value >= 1.0).count() as f64
                    / in_window.len() as f64
            }
        }
        SloMetric::Throughput => in_window.len() as f64 / slo.window.as_secs_f64().max(1e-9),
    };

    Evaluation {
        slo_name: slo.name.clone(),
        current_value,
        threshold: slo.threshold,
        violated: current_value > slo.threshold,
        severity: slo.severity,
        timestamp: Utc::now(),
        tenant_id: slo.tenant_id.clone(),
        model_id: slo.model_id.clone(),
    }
}

/// A SLO scope of `None` matches every sample; a concrete scope matches
/// samples tagged identically.
fn scope_matches(slo_scope: &Option<String>, sample_scope: &Option<String>) -> bool {
    match slo_scope {
        None => true,
        Some(want) => sample_scope.as_deref() == Some(want.as_str()),
    }
}

/// P95 through an HDR digest: percentile-accurate at bounded memory.
fn percentile_95(samples: &[&Sample]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut digest = match Histogram::<u64>::new_with_bounds(1, DIGEST_HIGH_MS, DIGEST_SIGFIGS) {
        Ok(h) => h,
        Err(e) => {
            warn!(error = %e, "digest construction failed");
            return 0.0;
        }
    };
    for sample in samples {
        let clamped = (sample.value.max(0.0) as u64).clamp(1, DIGEST_HIGH_MS);
        let _ = digest.record(clamped);
    }
    digest.value_at_quantile(0.95) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slo(name: &str, metric: SloMetric, threshold: f64) -> Slo {
        Slo {
            name: name.into(),
            metric,
            threshold,
            window: Duration::from_secs(5),
            severity: Severity::Warning,
            tenant_id: None,
            model_id: None,
        }
    }

    #[tokio::test]
    async fn p95_over_threshold_violates() {
        let mut eval = SloEvaluator::new();
        eval.add_slo(slo("ttft", SloMetric::Ttft, 250.0));
        for _ in 0..20 {
            eval.record(SloMetric::Ttft, 300.0, None, None);
        }

        let (events, evaluations) = eval.evaluate_all();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], QosEvent::Violation(_)));
        assert!(evaluations[0].violated);
        assert!(evaluations[0].current_value >= 299.0);
    }

    #[tokio::test]
    async fn active_violation_dedupes_until_recovery() {
        let mut eval = SloEvaluator::new();
        eval.add_slo(slo("err", SloMetric::ErrorRate, 0.5));
        for _ in 0..10 {
            eval.record(SloMetric::ErrorRate, 1.0, None, None);
        }

        let (first, _) = eval.evaluate_all();
        assert_eq!(first.len(), 1);
        let (second, _) = eval.evaluate_all();
        assert!(second.is_empty(), "still-active violation stays silent");
        assert_eq!(eval.active_violations().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_event_fires_once_samples_age_out() {
        let mut eval = SloEvaluator::new();
        eval.add_slo(slo("err", SloMetric::ErrorRate, 0.5));
        for _ in 0..10 {
            eval.record(SloMetric::ErrorRate, 1.0, None, None);
        }
        let _ = eval.evaluate_all();

        tokio::time::advance(Duration::from_secs(6)).await;
        let (events, _) = eval.evaluate_all();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], QosEvent::Recovery(_)));
        assert!(eval.active_violations().is_empty());
    }

    #[tokio::test]
    async fn tenant_scoped_slos_ignore_other_tenants() {
        let mut eval = SloEvaluator::new();
        let mut scoped = slo("tenant-ttft", SloMetric::Ttft, 100.0);
        scoped.tenant_id = Some("acme".into());
        eval.add_slo(scoped);

        for _ in 0..10 {
            eval.record(SloMetric::Ttft, 500.0, Some("globex".into()), None);
        }
        let (events, evaluations) = eval.evaluate_all();
        assert!(events.is_empty());
        assert_eq!(evaluations[0].current_value, 0.0);

        for _ in 0..10 {
            eval.record(SloMetric::Ttft, 500.0, Some("acme".into()), None);
        }
        let (events, _) = eval.evaluate_all();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn throughput_counts_samples_per_second() {
        let mut eval = SloEvaluator::new();
        // Violates when exceeding 2 samples/sec over a 5 s window.
        eval.add_slo(slo("tput", SloMetric::Throughput, 2.0));
        for _ in 0..20 {
            eval.record(SloMetric::Throughput, 1.0, None, None);
        }
        let (_, evaluations) = eval.evaluate_all();
        assert!((evaluations[0].current_value - 4.0).abs() < 1e-9);
        assert!(evaluations[0].violated);
    }
}
