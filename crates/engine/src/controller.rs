//! Session controller: the per-session state machine.
//!
//! One controller drives one session through
//! `OBSERVING → DECIDING → SCHEDULING → EXECUTING → COOLDOWN → OBSERVING`.
//! Every suspension point races the session's stop signal, so an emergency
//! stop interrupts perception waits, backend calls, dispatch delays and
//! in-flight dispatches alike.

use cadence_config::SessionConfig;
use cadence_core::action::{Decision, NoOpReason, Schedule};
use cadence_core::error::{PerceptionError, SessionError};
use cadence_core::event::{EventBus, SessionEvent};
use cadence_core::session::{LifecycleState, SessionId, SessionState, StopReason};
use cadence_core::sink::Outcome;
use cadence_core::ActionPlan;
use cadence_safety::{AuditEvent, AuditLog, SafetyMonitor, StopSignal};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::decision::DecisionEngine;
use crate::executor::ActionExecutor;
use crate::perception::ObservationStream;
use crate::scheduler::StealthScheduler;

/// Per-session pacing and ceilings.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub observation_timeout: Duration,
    /// Consecutive missed cycles tolerated; one more stops the session
    pub missed_cycle_ceiling: u32,
    /// Stop after this many cycles (0 = unbounded)
    pub max_cycles: u64,
}

impl From<&SessionConfig> for SessionSettings {
    fn from(config: &SessionConfig) -> Self {
        Self {
            observation_timeout: Duration::from_millis(config.observation_timeout_ms),
            missed_cycle_ceiling: config.missed_cycle_ceiling,
            max_cycles: config.max_cycles,
        }
    }
}

/// How one cycle ended.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// No observation arrived in time
    Missed,
    NoOp(NoOpReason),
    /// The plan was dispatched successfully
    Acted { plan_id: String, attempts: u32 },
    /// Every dispatch attempt failed recoverably
    Abandoned { plan_id: String, attempts: u32 },
    Stopped(StopReason),
}

/// Why a session's run loop returned.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionExit {
    Stopped(StopReason),
    CycleLimit,
    FeedClosed,
}

/// Everything a controller needs, assembled by the runtime.
pub struct ControllerParts {
    pub stream: ObservationStream,
    pub decision: DecisionEngine,
    pub scheduler: StealthScheduler,
    pub executor: ActionExecutor,
    pub monitor: Arc<SafetyMonitor>,
    pub audit: Arc<AuditLog>,
    pub events: Arc<EventBus>,
    pub settings: SessionSettings,
}

pub struct SessionController {
    state: SessionState,
    stream: ObservationStream,
    decision: DecisionEngine,
    scheduler: StealthScheduler,
    executor: ActionExecutor,
    monitor: Arc<SafetyMonitor>,
    audit: Arc<AuditLog>,
    events: Arc<EventBus>,
    settings: SessionSettings,
    stop: StopSignal,
}

impl SessionController {
    pub fn new(session_id: SessionId, parts: ControllerParts) -> Self {
        let stop = parts.monitor.register(&session_id);
        Self {
            state: SessionState::new(session_id),
            stream: parts.stream,
            decision: parts.decision,
            scheduler: parts.scheduler,
            executor: parts.executor,
            monitor: parts.monitor,
            audit: parts.audit,
            events: parts.events,
            settings: parts.settings,
            stop,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.state.session_id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn lifecycle(&self) -> LifecycleState {
        self.state.lifecycle
    }

    /// `IDLE → OBSERVING`.
    pub fn start(&mut self) -> Result<(), SessionError> {
        match self.state.lifecycle {
            LifecycleState::Idle => {}
            LifecycleState::EmergencyStopped => return Err(self.stopped_error()),
            _ => return Err(SessionError::AlreadyRunning(self.state.session_id.clone())),
        }
        if self.stop.is_stopped() {
            return Err(self.stopped_error());
        }

        info!(session = %self.state.session_id, "Session starting");
        self.audit(AuditEvent::SessionStarted, None);
        self.transition(LifecycleState::Observing)
    }

    /// Run cycles until the session is stopped, its feed closes, or the
    /// cycle limit is reached.
    pub async fn run(&mut self) -> Result<SessionExit, SessionError> {
        if let Some(reason) = self.stop.reason() {
            self.emergency_stop(reason.clone());
            return Ok(SessionExit::Stopped(reason));
        }
        if self.state.lifecycle == LifecycleState::Idle {
            self.start()?;
        }

        let exit = loop {
            if self.settings.max_cycles > 0 && self.state.cycle >= self.settings.max_cycles {
                break SessionExit::CycleLimit;
            }
            match self.run_cycle().await {
                Ok(CycleOutcome::Stopped(reason)) => break SessionExit::Stopped(reason),
                Ok(_) => {}
                Err(SessionError::FeedClosed(_)) => break SessionExit::FeedClosed,
                Err(e) => return Err(e),
            }
        };

        info!(
            session = %self.state.session_id,
            cycles = self.state.cycle,
            exit = ?exit,
            "Session finished"
        );
        self.audit(
            AuditEvent::SessionFinished {
                cycles: self.state.cycle,
            },
            None,
        );
        Ok(exit)
    }

    /// Drive one cycle, starting and ending in `OBSERVING`.
    pub async fn run_cycle(&mut self) -> Result<CycleOutcome, SessionError> {
        if let Some(reason) = self.stop.reason() {
            return Ok(self.emergency_stop(reason));
        }
        if self.state.lifecycle != LifecycleState::Observing {
            return Err(SessionError::InvalidTransition {
                from: self.state.lifecycle,
                to: LifecycleState::Deciding,
            });
        }

        // OBSERVING
        let timeout = self.settings.observation_timeout;
        let observed = tokio::select! {
            biased;
            reason = self.stop.wait() => return Ok(self.emergency_stop(reason)),
            observed = self.stream.next(timeout) => observed,
        };
        let observation = match observed {
            Ok(observation) => observation,
            Err(PerceptionError::Timeout { waited_ms }) => return self.missed_cycle(waited_ms),
            Err(PerceptionError::Closed) => {
                return Err(SessionError::FeedClosed(self.state.session_id.clone()));
            }
        };
        self.state.failure_counters.consecutive_missed = 0;
        self.transition(LifecycleState::Deciding)?;

        // DECIDING
        let report = tokio::select! {
            biased;
            reason = self.stop.wait() => return Ok(self.emergency_stop(reason)),
            report = self.decision.decide(&observation, &self.state) => report,
        };
        self.track_degradation(report.exhausted(), &report.attempted);

        let candidate = match report.decision {
            Decision::Act(candidate) => candidate,
            Decision::NoOp(reason) => return self.no_op(reason).await,
        };
        self.audit(
            AuditEvent::CandidateAccepted {
                kind: candidate.kind.clone(),
                confidence: candidate.confidence(),
                backend: candidate.source_backend_id.clone(),
            },
            None,
        );
        self.transition(LifecycleState::Scheduling)?;

        // SCHEDULING
        let plan = match self.scheduler.schedule(candidate, &observation, &mut self.state) {
            Schedule::Plan(plan) => plan,
            Schedule::NoOp(reason) => return self.no_op(reason).await,
        };
        self.audit(
            AuditEvent::PlanScheduled {
                plan_id: plan.plan_id.clone(),
                delay_ms: plan.delay_ms,
                jitter_ms: plan.jitter_applied_ms,
                break_applied: plan.break_applied,
            },
            None,
        );
        debug!(
            session = %self.state.session_id,
            plan = %plan.plan_id,
            delay_ms = plan.delay_ms,
            break_applied = plan.break_applied,
            "Plan scheduled"
        );
        if let Err(reason) = self.pause(plan.delay()).await {
            return Ok(self.emergency_stop(reason));
        }
        self.transition(LifecycleState::Executing)?;

        // EXECUTING
        let outcome = match self.dispatch(&plan).await {
            Ok(outcome) => outcome,
            Err(reason) => return Ok(self.emergency_stop(reason)),
        };

        // COOLDOWN
        self.cooldown(outcome).await
    }

    /// `EMERGENCY_STOPPED → IDLE`, after an explicit external request.
    pub fn reset(&mut self) -> Result<(), SessionError> {
        if self.state.lifecycle != LifecycleState::EmergencyStopped {
            return Err(SessionError::InvalidTransition {
                from: self.state.lifecycle,
                to: LifecycleState::Idle,
            });
        }
        self.monitor.reset(&self.state.session_id)?;
        self.transition(LifecycleState::Idle)?;

        self.state.failure_counters.consecutive_missed = 0;
        self.state.degraded = false;
        self.state.consecutive_actions = 0;
        self.state.break_due = false;
        self.state.set_fatigue_level(0.0);
        self.audit(AuditEvent::SessionReset, None);
        info!(session = %self.state.session_id, "Session reset");
        Ok(())
    }

    // ── Cycle stages ────────────────────────────────────────────────────

    fn missed_cycle(&mut self, waited_ms: u64) -> Result<CycleOutcome, SessionError> {
        let counters = &mut self.state.failure_counters;
        counters.consecutive_missed = counters.consecutive_missed.saturating_add(1);
        counters.missed_cycles += 1;
        let consecutive = counters.consecutive_missed;

        debug!(session = %self.state.session_id, waited_ms, consecutive, "Missed cycle");
        self.audit(
            AuditEvent::PerceptionTimeout {
                waited_ms,
                consecutive,
            },
            None,
        );
        self.scheduler
            .rest(&mut self.state, Duration::from_millis(waited_ms));
        self.state.cycle += 1;

        if consecutive > self.settings.missed_cycle_ceiling {
            self.monitor.stop(
                &self.state.session_id,
                StopReason::MissedCycles { count: consecutive },
            );
            let reason = self
                .stop
                .reason()
                .unwrap_or(StopReason::MissedCycles { count: consecutive });
            return Ok(self.emergency_stop(reason));
        }

        self.transition(LifecycleState::Observing)?;
        Ok(CycleOutcome::Missed)
    }

    fn track_degradation(&mut self, exhausted: bool, attempted: &[String]) {
        let session_id = self.state.session_id.clone();
        if exhausted {
            self.state.failure_counters.backend_exhaustions += 1;
            self.audit(
                AuditEvent::BackendsExhausted {
                    attempted: attempted.to_vec(),
                },
                None,
            );
            if !self.state.degraded {
                self.state.degraded = true;
                warn!(session = %session_id, "All backends exhausted, session degraded");
                self.audit(AuditEvent::Degraded, None);
                self.events.publish(SessionEvent::Degraded {
                    session_id,
                    timestamp: Utc::now(),
                });
            }
        } else if self.state.degraded {
            self.state.degraded = false;
            info!(session = %session_id, "Backend available again, session recovered");
            self.audit(AuditEvent::Recovered, None);
            self.events.publish(SessionEvent::Recovered {
                session_id,
                timestamp: Utc::now(),
            });
        }
    }

    async fn no_op(&mut self, reason: NoOpReason) -> Result<CycleOutcome, SessionError> {
        debug!(session = %self.state.session_id, reason = %reason, "No-op cycle");
        self.audit(
            AuditEvent::NoOp {
                reason: reason.clone(),
            },
            None,
        );
        self.cooldown(CycleOutcome::NoOp(reason)).await
    }

    /// Dispatch with bounded retries. `Err` means the session must stop.
    async fn dispatch(&mut self, plan: &ActionPlan) -> Result<CycleOutcome, StopReason> {
        let max_attempts = self.executor.policy().max_retries.saturating_add(1);
        let mut attempt = 1;
        loop {
            let outcome = self.executor.execute(plan, attempt, &mut self.stop).await?;
            match outcome {
                Outcome::Success => {
                    self.state.last_action_at = Some(Utc::now());
                    return Ok(CycleOutcome::Acted {
                        plan_id: plan.plan_id.clone(),
                        attempts: attempt,
                    });
                }
                Outcome::FatalFailure(detail) => {
                    return Err(self
                        .stop
                        .reason()
                        .unwrap_or(StopReason::FatalFailure { detail }));
                }
                Outcome::RecoverableFailure(_) => {
                    self.state.failure_counters.recoverable_failures += 1;
                    if let Some(reason) = self.stop.reason() {
                        return Err(reason);
                    }
                }
            }

            if attempt >= max_attempts {
                self.state.failure_counters.exhausted_retries += 1;
                warn!(
                    session = %self.state.session_id,
                    plan = %plan.plan_id,
                    attempts = attempt,
                    "Retries exhausted, plan abandoned"
                );
                self.audit(
                    AuditEvent::RetriesExhausted {
                        plan_id: plan.plan_id.clone(),
                        attempts: attempt,
                    },
                    None,
                );
                return Ok(CycleOutcome::Abandoned {
                    plan_id: plan.plan_id.clone(),
                    attempts: attempt,
                });
            }

            attempt += 1;
            let backoff = self.executor.policy().backoff(attempt);
            self.pause(backoff).await?;
        }
    }

    /// `→ COOLDOWN → OBSERVING`, resting for a fatigue-dependent pause.
    /// A stop during the pause replaces the cycle's outcome.
    async fn cooldown(&mut self, outcome: CycleOutcome) -> Result<CycleOutcome, SessionError> {
        self.transition(LifecycleState::Cooldown)?;
        let pause = self.scheduler.cooldown(&self.state);
        if let Err(reason) = self.pause(pause).await {
            return Ok(self.emergency_stop(reason));
        }
        self.scheduler.rest(&mut self.state, pause);
        self.state.cycle += 1;
        self.transition(LifecycleState::Observing)?;
        Ok(outcome)
    }

    /// Sleep unless the session is stopped first.
    async fn pause(&mut self, duration: Duration) -> Result<(), StopReason> {
        if duration.is_zero() {
            return self.stop.reason().map_or(Ok(()), Err);
        }
        tokio::select! {
            biased;
            reason = self.stop.wait() => Err(reason),
            () = tokio::time::sleep(duration) => Ok(()),
        }
    }

    // ── State machine plumbing ──────────────────────────────────────────

    fn transition(&mut self, to: LifecycleState) -> Result<(), SessionError> {
        let from = self.state.lifecycle;
        if !from.can_transition_to(to) {
            return Err(SessionError::InvalidTransition { from, to });
        }
        self.state.lifecycle = to;
        debug!(session = %self.state.session_id, from = %from, to = %to, "State transition");
        self.audit(AuditEvent::StateChanged { from, to }, None);
        self.events.publish(SessionEvent::StateChanged {
            session_id: self.state.session_id.clone(),
            from,
            to,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Enter `EMERGENCY_STOPPED` and write the single stop entry.
    fn emergency_stop(&mut self, reason: StopReason) -> CycleOutcome {
        if self.state.lifecycle.is_terminal() {
            return CycleOutcome::Stopped(reason);
        }
        // Valid from every non-terminal state.
        let _ = self.transition(LifecycleState::EmergencyStopped);
        error!(
            session = %self.state.session_id,
            reason = %reason,
            fault = %reason.fault(),
            "Session emergency-stopped"
        );
        self.audit(
            AuditEvent::EmergencyStop {
                reason: reason.clone(),
            },
            None,
        );
        CycleOutcome::Stopped(reason)
    }

    fn stopped_error(&self) -> SessionError {
        SessionError::Stopped {
            session: self.state.session_id.clone(),
            reason: self
                .stop
                .reason()
                .map_or_else(|| "awaiting reset".to_string(), |r| r.to_string()),
        }
    }

    fn audit(&self, event: AuditEvent, detail: Option<String>) {
        self.audit.record(&self.state.session_id, event, detail);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::DecisionPolicy;
    use crate::executor::ExecutorPolicy;
    use crate::perception::PerceptionFeed;
    use async_trait::async_trait;
    use cadence_backends::{BreakerPolicy, ModelManager};
    use cadence_config::{ConsultMode, JitterKind, SchedulerConfig};
    use cadence_core::action::ActionCandidate;
    use cadence_core::backend::{Backend, PredictContext};
    use cadence_core::error::BackendError;
    use cadence_core::sink::OutputSink;
    use cadence_core::Observation;
    use cadence_safety::{AuditEntry, SafetyPolicy};
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::time::Instant;

    /// Proposes a fixed "reel" candidate unless switched off.
    struct Switchable {
        confidence: f64,
        down: AtomicBool,
    }

    #[async_trait]
    impl Backend for Switchable {
        fn id(&self) -> &str {
            "primary"
        }

        async fn predict(
            &self,
            _observation: &Observation,
            _context: &PredictContext,
        ) -> Result<ActionCandidate, BackendError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(BackendError::Unavailable("primary".into()));
            }
            Ok(ActionCandidate::new("reel", self.confidence, "primary"))
        }
    }

    /// Replays scripted outcomes, then succeeds.
    struct Recorder {
        script: Mutex<Vec<Outcome>>,
        dispatched: AtomicUsize,
    }

    #[async_trait]
    impl OutputSink for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        async fn execute(&self, _plan: &ActionPlan) -> Outcome {
            self.dispatched.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                Outcome::Success
            } else {
                script.remove(0)
            }
        }
    }

    struct Harness {
        controller: SessionController,
        feed: PerceptionFeed,
        audit: Arc<AuditLog>,
        monitor: Arc<SafetyMonitor>,
        events: Arc<EventBus>,
        sink: Arc<Recorder>,
        backend: Arc<Switchable>,
    }

    impl Harness {
        fn observe(&self) {
            self.feed
                .submit_observation(self.session(), Observation::new(self.session().clone(), vec![0.5]))
                .unwrap();
        }

        fn session(&self) -> &SessionId {
            self.controller.session_id()
        }

        fn events_named(&self, name: &str) -> Vec<AuditEntry> {
            self.audit
                .entries()
                .into_iter()
                .filter(|e| e.event.name() == name)
                .collect()
        }
    }

    fn scheduler_config() -> SchedulerConfig {
        SchedulerConfig {
            min_delay_ms: 100,
            max_delay_ms: 100,
            jitter: JitterKind::None,
            latency_budget_ms: 60_000,
            base_cooldown_ms: 50,
            fatigue_cooldown_ms: 0,
            ..SchedulerConfig::default()
        }
    }

    fn harness(confidence: f64, script: Vec<Outcome>) -> Harness {
        let session = SessionId::from("s1");
        let events = Arc::new(EventBus::default());
        let audit = Arc::new(AuditLog::new());
        let monitor = Arc::new(SafetyMonitor::new(SafetyPolicy {
            failure_ceiling: 5,
            failure_window: Duration::from_secs(60),
        }));
        let backend = Arc::new(Switchable {
            confidence,
            down: AtomicBool::new(false),
        });
        let manager = ModelManager::new(BreakerPolicy {
            failure_threshold: 100,
            cooldown: Duration::from_secs(1),
            call_timeout: Duration::from_secs(1),
        })
        .add(backend.clone());
        let sink = Arc::new(Recorder {
            script: Mutex::new(script),
            dispatched: AtomicUsize::new(0),
        });

        let feed = PerceptionFeed::new();
        let controller = SessionController::new(
            session.clone(),
            ControllerParts {
                stream: feed.open(&session),
                decision: DecisionEngine::new(
                    Arc::new(manager),
                    DecisionPolicy {
                        acceptance_threshold: 0.6,
                        disallowed_kinds: HashSet::new(),
                        consult: ConsultMode::FirstAvailable,
                    },
                ),
                scheduler: StealthScheduler::seeded(scheduler_config(), 7),
                executor: ActionExecutor::new(
                    sink.clone(),
                    audit.clone(),
                    monitor.clone(),
                    ExecutorPolicy {
                        max_retries: 2,
                        retry_backoff: Duration::from_millis(100),
                        dispatch_timeout: Duration::from_secs(1),
                    },
                ),
                monitor: monitor.clone(),
                audit: audit.clone(),
                events: events.clone(),
                settings: SessionSettings {
                    observation_timeout: Duration::from_secs(1),
                    missed_cycle_ceiling: 2,
                    max_cycles: 0,
                },
            },
        );

        Harness {
            controller,
            feed,
            audit,
            monitor,
            events,
            sink,
            backend,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn confident_observation_is_dispatched() {
        let mut h = harness(0.9, vec![]);
        h.controller.start().unwrap();
        h.observe();

        let outcome = h.controller.run_cycle().await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Acted { attempts: 1, .. }));
        assert_eq!(h.controller.lifecycle(), LifecycleState::Observing);
        assert_eq!(h.controller.state().cycle, 1);
        assert_eq!(h.controller.state().consecutive_actions, 1);
        assert!(h.controller.state().last_action_at.is_some());
        assert_eq!(h.sink.dispatched.load(Ordering::SeqCst), 1);
        assert_eq!(h.events_named("plan_scheduled").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn low_confidence_never_reaches_the_sink() {
        let mut h = harness(0.3, vec![]);
        h.controller.start().unwrap();
        h.observe();

        let outcome = h.controller.run_cycle().await.unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::NoOp(NoOpReason::LowConfidence {
                confidence: 0.3,
                threshold: 0.6
            })
        );
        assert_eq!(h.sink.dispatched.load(Ordering::SeqCst), 0);
        assert_eq!(h.controller.lifecycle(), LifecycleState::Observing);
        assert_eq!(h.events_named("no_op").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missed_cycles_past_the_ceiling_stop_the_session() {
        let mut h = harness(0.9, vec![]);
        h.controller.start().unwrap();

        assert_eq!(h.controller.run_cycle().await.unwrap(), CycleOutcome::Missed);
        assert_eq!(h.controller.run_cycle().await.unwrap(), CycleOutcome::Missed);
        assert_eq!(
            h.controller.run_cycle().await.unwrap(),
            CycleOutcome::Stopped(StopReason::MissedCycles { count: 3 })
        );
        assert_eq!(h.controller.lifecycle(), LifecycleState::EmergencyStopped);
        assert_eq!(h.controller.state().failure_counters.missed_cycles, 3);
        assert_eq!(h.events_named("emergency_stop").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missed_cycle_counts_as_rest() {
        let mut h = harness(0.9, vec![]);
        h.controller.start().unwrap();
        h.controller.state.set_fatigue_level(0.5);
        h.controller.state.break_due = true;

        assert_eq!(h.controller.run_cycle().await.unwrap(), CycleOutcome::Missed);
        // default decay of 0.01/s over the 1s perception timeout
        assert!((h.controller.state().fatigue_level() - 0.49).abs() < 1e-9);
        assert!(h.controller.state().break_due);
    }

    #[tokio::test(start_paused = true)]
    async fn observation_resets_the_missed_streak() {
        let mut h = harness(0.9, vec![]);
        h.controller.start().unwrap();

        h.controller.run_cycle().await.unwrap();
        h.controller.run_cycle().await.unwrap();
        h.observe();
        h.controller.run_cycle().await.unwrap();
        assert_eq!(h.controller.state().failure_counters.consecutive_missed, 0);
        assert_eq!(h.controller.run_cycle().await.unwrap(), CycleOutcome::Missed);
        assert_eq!(h.controller.lifecycle(), LifecycleState::Observing);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_interrupts_a_perception_wait() {
        let mut h = harness(0.9, vec![]);
        h.controller.start().unwrap();

        let monitor = h.monitor.clone();
        let session = h.session().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            monitor.stop(&session, StopReason::external("operator"));
        });

        let started = Instant::now();
        let outcome = h.controller.run_cycle().await.unwrap();
        assert_eq!(outcome, CycleOutcome::Stopped(StopReason::external("operator")));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(h.controller.lifecycle(), LifecycleState::EmergencyStopped);

        // A second pass does not write another stop entry.
        h.controller.run_cycle().await.unwrap();
        assert_eq!(h.events_named("emergency_stop").len(), 1);
        assert_eq!(h.sink.dispatched.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn recoverable_failures_are_retried_then_abandoned() {
        let busy = || Outcome::RecoverableFailure("busy".into());
        let mut h = harness(0.9, vec![busy(), busy(), busy()]);
        h.controller.start().unwrap();
        h.observe();

        let outcome = h.controller.run_cycle().await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Abandoned { attempts: 3, .. }));
        assert_eq!(h.sink.dispatched.load(Ordering::SeqCst), 3);
        assert_eq!(h.events_named("retries_exhausted").len(), 1);
        assert_eq!(h.events_named("execution_attempt").len(), 3);

        let counters = &h.controller.state().failure_counters;
        assert_eq!(counters.recoverable_failures, 3);
        assert_eq!(counters.exhausted_retries, 1);
        assert_eq!(h.controller.lifecycle(), LifecycleState::Observing);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_succeeds_after_a_recoverable_failure() {
        let mut h = harness(0.9, vec![Outcome::RecoverableFailure("busy".into())]);
        h.controller.start().unwrap();
        h.observe();

        let outcome = h.controller.run_cycle().await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Acted { attempts: 2, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_failure_emergency_stops() {
        let mut h = harness(0.9, vec![Outcome::FatalFailure("target gone".into())]);
        h.controller.start().unwrap();
        h.observe();

        let outcome = h.controller.run_cycle().await.unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::Stopped(StopReason::FatalFailure {
                detail: "target gone".into()
            })
        );
        assert_eq!(h.controller.lifecycle(), LifecycleState::EmergencyStopped);
        assert_eq!(h.events_named("emergency_stop").len(), 1);
        assert!(matches!(
            h.controller.start(),
            Err(SessionError::Stopped { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_backends_degrade_then_recover() {
        let mut h = harness(0.9, vec![]);
        let mut events = h.events.subscribe();
        h.controller.start().unwrap();

        h.backend.down.store(true, Ordering::SeqCst);
        h.observe();
        let outcome = h.controller.run_cycle().await.unwrap();
        assert_eq!(outcome, CycleOutcome::NoOp(NoOpReason::NoBackendAvailable));
        assert!(h.controller.state().degraded);

        h.backend.down.store(false, Ordering::SeqCst);
        h.observe();
        let outcome = h.controller.run_cycle().await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Acted { .. }));
        assert!(!h.controller.state().degraded);

        let mut saw = Vec::new();
        while let Ok(event) = events.try_recv() {
            match event.as_ref() {
                SessionEvent::Degraded { .. } => saw.push("degraded"),
                SessionEvent::Recovered { .. } => saw.push("recovered"),
                _ => {}
            }
        }
        assert_eq!(saw, vec!["degraded", "recovered"]);
        assert_eq!(h.events_named("backends_exhausted").len(), 1);
        assert_eq!(h.controller.state().failure_counters.backend_exhaustions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_returns_a_stopped_session_to_idle() {
        let mut h = harness(0.9, vec![]);
        h.controller.start().unwrap();
        assert!(matches!(
            h.controller.reset(),
            Err(SessionError::InvalidTransition { .. })
        ));

        h.monitor.stop(h.session(), StopReason::external("operator"));
        h.controller.run_cycle().await.unwrap();
        assert_eq!(h.controller.lifecycle(), LifecycleState::EmergencyStopped);

        h.controller.reset().unwrap();
        assert_eq!(h.controller.lifecycle(), LifecycleState::Idle);
        assert_eq!(h.events_named("session_reset").len(), 1);

        h.controller.start().unwrap();
        h.observe();
        let outcome = h.controller.run_cycle().await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Acted { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn run_ends_at_the_cycle_limit() {
        let mut h = harness(0.9, vec![]);
        h.controller.settings.max_cycles = 2;

        let exit = h.controller.run().await.unwrap();
        assert_eq!(exit, SessionExit::CycleLimit);
        assert_eq!(h.controller.state().cycle, 2);
        assert_eq!(h.events_named("session_started").len(), 1);
        assert_eq!(h.events_named("session_finished").len(), 1);
    }

    #[tokio::test]
    async fn starting_twice_is_rejected() {
        let mut h = harness(0.9, vec![]);
        h.controller.start().unwrap();
        assert!(matches!(
            h.controller.start(),
            Err(SessionError::AlreadyRunning(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn every_transition_is_audited() {
        let mut h = harness(0.9, vec![]);
        h.controller.start().unwrap();
        h.observe();
        h.controller.run_cycle().await.unwrap();

        let path: Vec<LifecycleState> = h
            .audit
            .entries()
            .into_iter()
            .filter_map(|e| match e.event {
                AuditEvent::StateChanged { to, .. } => Some(to),
                _ => None,
            })
            .collect();
        assert_eq!(
            path,
            vec![
                LifecycleState::Observing,
                LifecycleState::Deciding,
                LifecycleState::Scheduling,
                LifecycleState::Executing,
                LifecycleState::Cooldown,
                LifecycleState::Observing,
            ]
        );
    }
}
