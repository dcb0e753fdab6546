//! Remediation executor.
//!
//! Every action passes four gates, in order: the per-action-key circuit
//! breaker, loop detection (an alternation of opposing actions across the
//! recent history), the per-key cooldown, and the rolling rate limit.
//! Outcomes are broadcast as [`ExecutorEvent`]s; handler failures are
//! counted and logged, never propagated.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::QosError;
use crate::policy::RemediationAction;

/// Executor knobs.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Minimum gap between executions of the same action key.
    pub cooldown: Duration,
    /// Executions allowed per key within any rolling window.
    pub max_executions_per_window: u32,
    pub execution_window: Duration,
    /// How many recent actions the alternation detector inspects.
    pub loop_detection_window: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(60),
            max_executions_per_window: 5,
            execution_window: Duration::from_secs(600),
            loop_detection_window: 6,
        }
    }
}

/// What the handler gets to act on.
#[derive(Debug, Clone)]
pub struct ViolationContext {
    pub slo_name: String,
    pub tenant_id: Option<String>,
    pub model_id: Option<String>,
    pub current_value: f64,
    pub threshold: f64,
}

impl ViolationContext {
    fn scope_key(&self) -> String {
        format!(
            "{}:{}",
            self.tenant_id.as_deref().unwrap_or("-"),
            self.model_id.as_deref().unwrap_or("-")
        )
    }
}

/// Side-effect implementation behind the executor (scaling API, alerting
/// hook, ...). Tests plug in recorders.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn run(
        &self,
        action: RemediationAction,
        context: &ViolationContext,
    ) -> Result<(), QosError>;
}

/// Executor outcomes, broadcast to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutorEvent {
    Executed { action_key: String, action: RemediationAction },
    RateLimited { action_key: String, reason: RateLimitReason },
    LoopDetected { action_key: String },
    Denied { action_key: String },
    Failed { action_key: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitReason {
    Cooldown,
    WindowExhausted,
}

struct KeyState {
    last_executed_at: Option<Instant>,
    executions: VecDeque<Instant>,
    execution_count: u64,
}

impl KeyState {
    fn new() -> Self {
        Self {
            last_executed_at: None,
            executions: VecDeque::new(),
            execution_count: 0,
        }
    }
}

/// Bounded remediation executor. Single-owner: the monitor task drives it.
pub struct RemediationExecutor {
    config: ExecutorConfig,
    handler: Arc<dyn ActionHandler>,
    keys: HashMap<String, KeyState>,
    tripped: HashSet<String>,
    /// Recent (instant, action) pairs per scope, for alternation checks.
    history: HashMap<String, VecDeque<(Instant, RemediationAction)>>,
    events: broadcast::Sender<ExecutorEvent>,
}

impl RemediationExecutor {
    pub fn new(handler: Arc<dyn ActionHandler>, config: ExecutorConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            config,
            handler,
            keys: HashMap::new(),
            tripped: HashSet::new(),
            history: HashMap::new(),
            events,
        }
    }

    pub fn events(&self) -> broadcast::Receiver<ExecutorEvent> {
        self.events.subscribe()
    }

    /// Sender side of the event channel, for owners that need to hand out
    /// subscriptions after moving the executor into a task.
    pub fn event_channel(&self) -> broadcast::Sender<ExecutorEvent> {
        self.events.clone()
    }

    /// Re-arm a tripped action key.
    pub fn reset(&mut self, action_key: &str) {
        if self.tripped.remove(action_key) {
            info!(action_key, "remediation breaker reset");
        }
    }

    /// Attempt one remediation. Emits exactly one event describing the
    /// outcome and returns it.
    pub async fn execute(
        &mut self,
        action: RemediationAction,
        context: &ViolationContext,
    ) -> ExecutorEvent {
        let scope = context.scope_key();
        let action_key = format!("{action}:{scope}");
        let now = Instant::now();

        // Gate 1: tripped breaker.
        if self.tripped.contains(&action_key) {
            let event = ExecutorEvent::Denied {
                action_key: action_key.clone(),
            };
            let _ = self.events.send(event.clone());
            return event;
        }

        // Gate 2: alternation loop. Trips the breaker exactly once.
        if self.would_loop(&scope, action, now) {
            warn!(action_key, "remediation loop detected; tripping breaker");
            self.tripped.insert(action_key.clone());
            let event = ExecutorEvent::LoopDetected {
                action_key: action_key.clone(),
            };
            let _ = self.events.send(event.clone());
            return event;
        }

        let state = self.keys.entry(action_key.clone()).or_insert_with(KeyState::new);

        // Gate 3: cooldown.
        if let Some(last) = state.last_executed_at {
            if now.duration_since(last) < self.config.cooldown {
                let event = ExecutorEvent::RateLimited {
                    action_key: action_key.clone(),
                    reason: RateLimitReason::Cooldown,
                };
                let _ = self.events.send(event.clone());
                return event;
            }
        }

        // Gate 4: rolling rate limit.
        while let Some(front) = state.executions.front() {
            if now.duration_since(*front) > self.config.execution_window {
                state.executions.pop_front();
            } else {
                break;
            }
        }
        if state.executions.len() >= self.config.max_executions_per_window as usize {
            let event = ExecutorEvent::RateLimited {
                action_key: action_key.clone(),
                reason: RateLimitReason::WindowExhausted,
            };
            let _ = self.events.send(event.clone());
            return event;
        }

        // All gates passed: run the side effect and record it either way.
        state.last_executed_at = Some(now);
        state.executions.push_back(now);
        state.execution_count += 1;
        self.push_history(&scope, action, now);

        let event = match self.handler.run(action, context).await {
            Ok(()) => {
                info!(action_key, slo = %context.slo_name, "remediation executed");
                ExecutorEvent::Executed {
                    action_key: action_key.clone(),
                    action,
                }
            }
            Err(e) => {
                warn!(action_key, error = %e, "remediation handler failed");
                ExecutorEvent::Failed {
                    action_key: action_key.clone(),
                    message: e.to_string(),
                }
            }
        };
        let _ = self.events.send(event.clone());
        event
    }

    /// Would appending `action` complete an alternating run of an opposing
    /// pair across the inspection window?
    fn would_loop(&self, scope: &str, action: RemediationAction, now: Instant) -> bool {
        let Some(opposing) = action.opposing() else {
            return false;
        };
        let window = self.config.loop_detection_window;
        if window < 2 {
            return false;
        }
        let Some(history) = self.history.get(scope) else {
            return false;
        };

        // Walk backwards expecting opposing, action, opposing, ...
        let mut expected = opposing;
        let mut matched = 1usize; // the candidate itself
        for (at, past) in history.iter().rev() {
            if now.duration_since(*at) > self.config.execution_window {
                break;
            }
            if *past != expected {
                break;
            }
            matched += 1;
            expected = if expected == action { opposing } else { action };
            if matched >= window {
                return true;
            }
        }
        false
    }

    fn push_history(&mut self, scope: &str, action: RemediationAction, at: Instant) {
        let history = self.history.entry(scope.to_owned()).or_default();
        history.push_back((at, action));
        // Keep roughly two windows of history.
        while let Some((front, _)) = history.front() {
            if at.duration_since(*front) > self.config.execution_window * 2 {
                history.pop_front();
            } else {
                break;
            }
        }
        while history.len() > 4 * self.config.loop_detection_window.max(1) {
            history.pop_front();
        }
    }

    /// Executions recorded for one action key.
    pub fn execution_count(&self, action_key: &str) -> u64 {
        self.keys
            .get(action_key)
            .map(|s| s.execution_count)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        runs: Mutex<Vec<RemediationAction>>,
        fail: bool,
    }

    #[async_trait]
    impl ActionHandler for Recorder {
        async fn run(
            &self,
            action: RemediationAction,
            _context: &ViolationContext,
        ) -> Result<(), QosError> {
            self.runs.lock().unwrap().push(action);
            if self.fail {
                Err(QosError::Handler("boom".into()))
            } else {
                Ok(())
            }
        }
    }

    fn context() -> ViolationContext {
        ViolationContext {
            slo_name: "ttft".into(),
            tenant_id: None,
            model_id: None,
            current_value: 300.0,
            threshold: 250.0,
        }
    }

    fn executor(config: ExecutorConfig) -> (RemediationExecutor, Arc<Recorder>) {
        let recorder = Arc::new(Recorder {
            runs: Mutex::new(Vec::new()),
            fail: false,
        });
        (
            RemediationExecutor::new(Arc::clone(&recorder) as Arc<dyn ActionHandler>, config),
            recorder,
        )
    }

    #[tokio::test]
    async fn cooldown_rate_limits_repeat_executions() {
        let (mut exec, recorder) = executor(ExecutorConfig {
            cooldown: Duration::from_secs(60),
            ..ExecutorConfig::default()
        });

        let first = exec.execute(RemediationAction::Alert, &context()).await;
        assert!(matches!(first, ExecutorEvent::Executed { .. }));

        let second = exec.execute(RemediationAction::Alert, &context()).await;
        assert_eq!(
            second,
            ExecutorEvent::RateLimited {
                action_key: "alert:-:-".into(),
                reason: RateLimitReason::Cooldown,
            }
        );
        assert_eq!(recorder.runs.lock().unwrap().len(), 1);
    }

    // Exhausting the rolling window yields rate_limited without running
    // the action.
    #[tokio::test(start_paused = true)]
    async fn window_budget_exhaustion_rate_limits() {
        let (mut exec, recorder) = executor(ExecutorConfig {
            cooldown: Duration::from_millis(10),
            max_executions_per_window: 3,
            execution_window: Duration::from_secs(600),
            loop_detection_window: 6,
        });

        for _ in 0..3 {
            let event = exec.execute(RemediationAction::Alert, &context()).await;
            assert!(matches!(event, ExecutorEvent::Executed { .. }));
            tokio::time::advance(Duration::from_millis(20)).await;
        }
        let fourth = exec.execute(RemediationAction::Alert, &context()).await;
        assert_eq!(
            fourth,
            ExecutorEvent::RateLimited {
                action_key: "alert:-:-".into(),
                reason: RateLimitReason::WindowExhausted,
            }
        );
        assert_eq!(recorder.runs.lock().unwrap().len(), 3);
    }

    // Alternating scale_up / scale_down trips the breaker exactly once;
    // afterwards the key is denied until reset.
    #[tokio::test(start_paused = true)]
    async fn alternation_trips_the_breaker_once() {
        let (mut exec, recorder) = executor(ExecutorConfig {
            cooldown: Duration::from_millis(1),
            max_executions_per_window: 100,
            execution_window: Duration::from_secs(600),
            loop_detection_window: 4,
        });

        let pattern = [
            RemediationAction::ScaleUp,
            RemediationAction::ScaleDown,
            RemediationAction::ScaleUp,
        ];
        for action in pattern {
            let event = exec.execute(action, &context()).await;
            assert!(matches!(event, ExecutorEvent::Executed { .. }), "{event:?}");
            tokio::time::advance(Duration::from_millis(5)).await;
        }

        // The fourth alternation completes the loop.
        let looped = exec.execute(RemediationAction::ScaleDown, &context()).await;
        assert_eq!(
            looped,
            ExecutorEvent::LoopDetected {
                action_key: "scale_down:-:-".into(),
            }
        );
        assert_eq!(recorder.runs.lock().unwrap().len(), 3, "loop not executed");

        // Further invocations are denied, not re-detected.
        let denied = exec.execute(RemediationAction::ScaleDown, &context()).await;
        assert_eq!(
            denied,
            ExecutorEvent::Denied {
                action_key: "scale_down:-:-".into(),
            }
        );

        exec.reset("scale_down:-:-");
        tokio::time::advance(Duration::from_secs(1)).await;
        // After reset the alternation history still stands, so the next
        // opposing call is detected again rather than executed blindly.
        let redetected = exec.execute(RemediationAction::ScaleDown, &context()).await;
        assert!(matches!(redetected, ExecutorEvent::LoopDetected { .. }));
    }

    #[tokio::test]
    async fn handler_failure_is_counted_not_propagated() {
        let recorder = Arc::new(Recorder {
            runs: Mutex::new(Vec::new()),
            fail: true,
        });
        let mut exec = RemediationExecutor::new(
            Arc::clone(&recorder) as Arc<dyn ActionHandler>,
            ExecutorConfig::default(),
        );

        let event = exec.execute(RemediationAction::Restart, &context()).await;
        assert!(matches!(event, ExecutorEvent::Failed { .. }));
        assert_eq!(exec.execution_count("restart:-:-"), 1);
    }
}
