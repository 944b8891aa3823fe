//! Action executor: dispatches one plan attempt to the output sink.
//!
//! Every attempt writes exactly one audit entry and reports its outcome to
//! the safety monitor. The attempt is raced against the session's stop
//! signal and the dispatch timeout; a stop aborts it on the spot.

use cadence_config::ExecutorConfig;
use cadence_core::action::ActionPlan;
use cadence_core::session::StopReason;
use cadence_core::sink::{Outcome, OutputSink};
use cadence_safety::{AttemptOutcome, AuditEvent, AuditLog, SafetyMonitor, StopSignal};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry and timeout settings for dispatch.
#[derive(Debug, Clone)]
pub struct ExecutorPolicy {
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub dispatch_timeout: Duration,
}

impl From<&ExecutorConfig> for ExecutorPolicy {
    fn from(config: &ExecutorConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            dispatch_timeout: Duration::from_millis(config.dispatch_timeout_ms),
        }
    }
}

impl ExecutorPolicy {
    /// Backoff before retry `attempt` (2, 3, ...): linear in the attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.retry_backoff * attempt.saturating_sub(1)
    }
}

pub struct ActionExecutor {
    sink: Arc<dyn OutputSink>,
    audit: Arc<AuditLog>,
    monitor: Arc<SafetyMonitor>,
    policy: ExecutorPolicy,
}

impl ActionExecutor {
    pub fn new(
        sink: Arc<dyn OutputSink>,
        audit: Arc<AuditLog>,
        monitor: Arc<SafetyMonitor>,
        policy: ExecutorPolicy,
    ) -> Self {
        Self {
            sink,
            audit,
            monitor,
            policy,
        }
    }

    pub fn policy(&self) -> &ExecutorPolicy {
        &self.policy
    }

    /// Run one dispatch attempt. `Err` means the session was stopped while
    /// the attempt was in flight and the dispatch was abandoned.
    pub async fn execute(
        &self,
        plan: &ActionPlan,
        attempt: u32,
        stop: &mut StopSignal,
    ) -> Result<Outcome, StopReason> {
        let session = &plan.session_id;
        debug!(
            session = %session,
            plan = %plan.plan_id,
            attempt,
            sink = self.sink.name(),
            kind = %plan.candidate.kind,
            "Dispatching plan"
        );

        let timeout = self.policy.dispatch_timeout;
        let raced = tokio::select! {
            reason = stop.wait() => Err(reason),
            result = tokio::time::timeout(timeout, self.sink.execute(plan)) => Ok(result),
        };

        let (outcome, audited) = match raced {
            Err(reason) => {
                self.record(plan, attempt, AttemptOutcome::Aborted);
                return Err(reason);
            }
            Ok(Ok(outcome)) => {
                let audited = AttemptOutcome::from(&outcome);
                (outcome, audited)
            }
            Ok(Err(_)) => {
                let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                (
                    Outcome::RecoverableFailure(format!("dispatch timed out after {timeout_ms}ms")),
                    AttemptOutcome::TimedOut { timeout_ms },
                )
            }
        };

        self.record(plan, attempt, audited);
        match &outcome {
            Outcome::Success => {}
            Outcome::RecoverableFailure(detail) => {
                warn!(session = %session, plan = %plan.plan_id, attempt, detail = %detail, "Dispatch failed");
                self.monitor.record_failure(session);
            }
            Outcome::FatalFailure(detail) => {
                warn!(session = %session, plan = %plan.plan_id, detail = %detail, "Fatal dispatch failure");
                self.monitor.report_fatal(session, detail.clone());
            }
        }
        Ok(outcome)
    }

    fn record(&self, plan: &ActionPlan, attempt: u32, outcome: AttemptOutcome) {
        self.audit.record(
            &plan.session_id,
            AuditEvent::ExecutionAttempt {
                plan_id: plan.plan_id.clone(),
                attempt,
                outcome,
            },
            None,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cadence_core::action::ActionCandidate;
    use cadence_core::session::SessionId;
    use cadence_safety::SafetyPolicy;
    use std::sync::Mutex;

    /// Replays scripted outcomes, then succeeds.
    struct ScriptedSink {
        script: Mutex<Vec<Outcome>>,
        delay: Duration,
        call_count: Mutex<usize>,
    }

    impl ScriptedSink {
        fn new(script: Vec<Outcome>) -> Self {
            Self {
                script: Mutex::new(script),
                delay: Duration::ZERO,
                call_count: Mutex::new(0),
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::new(vec![])
            }
        }
    }

    #[async_trait]
    impl OutputSink for ScriptedSink {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn execute(&self, _plan: &ActionPlan) -> Outcome {
            *self.call_count.lock().unwrap() += 1;
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                Outcome::Success
            } else {
                script.remove(0)
            }
        }
    }

    struct Harness {
        executor: ActionExecutor,
        audit: Arc<AuditLog>,
        monitor: Arc<SafetyMonitor>,
        stop: StopSignal,
        plan: ActionPlan,
    }

    fn harness(sink: ScriptedSink) -> Harness {
        let audit = Arc::new(AuditLog::new());
        let monitor = Arc::new(SafetyMonitor::new(SafetyPolicy {
            failure_ceiling: 5,
            failure_window: Duration::from_secs(60),
        }));
        let session = SessionId::from("s1");
        let stop = monitor.register(&session);
        let executor = ActionExecutor::new(
            Arc::new(sink),
            audit.clone(),
            monitor.clone(),
            ExecutorPolicy {
                max_retries: 2,
                retry_backoff: Duration::from_millis(100),
                dispatch_timeout: Duration::from_millis(500),
            },
        );
        let plan = ActionPlan::new(
            session,
            ActionCandidate::new("reel", 0.9, "primary"),
            Duration::ZERO,
            0,
            false,
        );
        Harness {
            executor,
            audit,
            monitor,
            stop,
            plan,
        }
    }

    fn attempts(audit: &AuditLog) -> Vec<AttemptOutcome> {
        audit
            .entries()
            .into_iter()
            .filter_map(|e| match e.event {
                AuditEvent::ExecutionAttempt { outcome, .. } => Some(outcome),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn success_writes_one_audit_entry() {
        let mut h = harness(ScriptedSink::new(vec![]));
        let outcome = h.executor.execute(&h.plan, 1, &mut h.stop).await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(attempts(&h.audit), vec![AttemptOutcome::Success]);
    }

    #[tokio::test]
    async fn recoverable_failure_counts_toward_the_ceiling() {
        let mut h = harness(ScriptedSink::new(vec![Outcome::RecoverableFailure("busy".into())]));
        let outcome = h.executor.execute(&h.plan, 1, &mut h.stop).await.unwrap();
        assert_eq!(outcome, Outcome::RecoverableFailure("busy".into()));
        assert_eq!(h.monitor.failures_in_window(&h.plan.session_id), 1);
        assert!(!h.stop.is_stopped());
    }

    #[tokio::test]
    async fn fatal_failure_stops_the_session() {
        let mut h = harness(ScriptedSink::new(vec![Outcome::FatalFailure("target gone".into())]));
        let outcome = h.executor.execute(&h.plan, 1, &mut h.stop).await.unwrap();
        assert!(matches!(outcome, Outcome::FatalFailure(_)));
        assert_eq!(
            h.stop.reason(),
            Some(StopReason::FatalFailure {
                detail: "target gone".into()
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slow_sink_times_out_as_recoverable() {
        let mut h = harness(ScriptedSink::slow(Duration::from_secs(10)));
        let outcome = h.executor.execute(&h.plan, 1, &mut h.stop).await.unwrap();
        assert!(matches!(outcome, Outcome::RecoverableFailure(_)));
        assert_eq!(
            attempts(&h.audit),
            vec![AttemptOutcome::TimedOut { timeout_ms: 500 }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stop_aborts_an_in_flight_dispatch() {
        let mut h = harness(ScriptedSink::slow(Duration::from_secs(10)));
        let monitor = h.monitor.clone();
        let session = h.plan.session_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            monitor.stop(&session, StopReason::external("operator"));
        });

        let result = h.executor.execute(&h.plan, 1, &mut h.stop).await;
        assert_eq!(result, Err(StopReason::external("operator")));
        assert_eq!(attempts(&h.audit), vec![AttemptOutcome::Aborted]);
    }

    #[test]
    fn backoff_grows_with_attempts() {
        let policy = ExecutorPolicy {
            max_retries: 3,
            retry_backoff: Duration::from_millis(200),
            dispatch_timeout: Duration::from_secs(1),
        };
        assert_eq!(policy.backoff(1), Duration::ZERO);
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
    }
}
