//! Runtime: one task per session over shared backends and safety state.
//!
//! Sessions share only the model manager (backend health), the safety
//! monitor, the audit log and the event bus. Everything else (state,
//! scheduler, random source, perception stream) belongs to one controller
//! running in its own task.

use cadence_backends::{BackendRegistry, BreakerPolicy, ModelManager, build_from_config};
use cadence_config::{AuditConfig, CadenceConfig};
use cadence_core::backend::{Backend, BackendDescriptor};
use cadence_core::error::{Error, SessionError};
use cadence_core::event::{EventBus, SessionEvent};
use cadence_core::session::{SessionId, SessionState, StopReason};
use cadence_core::sink::OutputSink;
use cadence_core::Observation;
use cadence_safety::{AuditLog, AuditSink, JsonLinesSink, SafetyMonitor, SafetyPolicy, TracingSink};
use cadence_telemetry::{RunStats, SessionReport};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::controller::{ControllerParts, SessionController, SessionExit, SessionSettings};
use crate::decision::{DecisionEngine, DecisionPolicy};
use crate::executor::{ActionExecutor, ExecutorPolicy};
use crate::perception::PerceptionFeed;
use crate::scheduler::StealthScheduler;

type SessionTask = JoinHandle<(SessionController, Result<SessionExit, SessionError>)>;

/// A live session task. The id stays reserved while `join_all` awaits it.
enum Slot {
    Running(SessionTask),
    Joining,
}

/// Final state of one session after its task ended.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub session_id: SessionId,
    pub exit: Result<SessionExit, SessionError>,
    pub state: SessionState,
}

pub struct RuntimeBuilder {
    config: CadenceConfig,
    registry: BackendRegistry,
    sink: Arc<dyn OutputSink>,
    audit_sinks: Vec<Arc<dyn AuditSink>>,
    seed: Option<u64>,
}

impl RuntimeBuilder {
    /// Register an extra backend; it is used if the fallback chain names it.
    pub fn backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.registry.register(backend);
        self
    }

    /// Forward audit entries to an extra sink.
    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit_sinks.push(sink);
        self
    }

    /// Make every session's scheduler reproducible.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn build(self) -> Result<Runtime, Error> {
        self.config
            .validate()
            .map_err(|e| Error::Config { message: e.to_string() })?;

        let events = Arc::new(EventBus::default());
        let manager = self
            .registry
            .build_manager(
                &self.config.backends.fallback_chain,
                BreakerPolicy::from(&self.config.backends),
            )?
            .with_events(events.clone());

        let stats = Arc::new(RunStats::new());
        let mut audit = audit_from_config(&self.config.audit)?.with_sink(stats.clone());
        for sink in self.audit_sinks {
            audit = audit.with_sink(sink);
        }

        let monitor = SafetyMonitor::new(SafetyPolicy::from(&self.config.safety))
            .with_events(events.clone());

        info!(
            chain = ?self.config.backends.fallback_chain,
            threshold = self.config.decision.acceptance_threshold,
            sink = self.sink.name(),
            "Runtime ready"
        );

        Ok(Runtime {
            config: self.config,
            manager: Arc::new(manager),
            feed: Arc::new(PerceptionFeed::new()),
            monitor: Arc::new(monitor),
            audit: Arc::new(audit),
            events,
            sink: self.sink,
            stats,
            seed: self.seed,
            spawned: AtomicU64::new(0),
            tasks: Mutex::new(HashMap::new()),
            parked: Mutex::new(HashMap::new()),
        })
    }
}

fn audit_from_config(config: &AuditConfig) -> Result<AuditLog, Error> {
    let mut audit = if config.retain_in_memory {
        AuditLog::new()
    } else {
        AuditLog::streaming()
    };
    if config.log_entries {
        audit = audit.with_sink(Arc::new(TracingSink));
    }
    if let Some(path) = &config.jsonl_path {
        let sink = JsonLinesSink::open(Path::new(path)).map_err(|e| Error::Config {
            message: format!("cannot open audit file {path}: {e}"),
        })?;
        audit = audit.with_sink(Arc::new(sink));
    }
    Ok(audit)
}

pub struct Runtime {
    config: CadenceConfig,
    manager: Arc<ModelManager>,
    feed: Arc<PerceptionFeed>,
    monitor: Arc<SafetyMonitor>,
    audit: Arc<AuditLog>,
    events: Arc<EventBus>,
    sink: Arc<dyn OutputSink>,
    stats: Arc<RunStats>,
    seed: Option<u64>,
    spawned: AtomicU64,
    tasks: Mutex<HashMap<SessionId, Slot>>,
    parked: Mutex<HashMap<SessionId, SessionController>>,
}

impl Runtime {
    pub fn builder(config: CadenceConfig, sink: Arc<dyn OutputSink>) -> RuntimeBuilder {
        let registry = build_from_config(&config.backends);
        RuntimeBuilder {
            config,
            registry,
            sink,
            audit_sinks: Vec::new(),
            seed: None,
        }
    }

    pub fn config(&self) -> &CadenceConfig {
        &self.config
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    pub fn monitor(&self) -> &Arc<SafetyMonitor> {
        &self.monitor
    }

    pub fn feed(&self) -> &Arc<PerceptionFeed> {
        &self.feed
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<SessionEvent>> {
        self.events.subscribe()
    }

    /// Backend health, in chain order.
    pub fn backends(&self) -> Vec<BackendDescriptor> {
        self.manager.descriptors()
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<SessionId, Slot>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn parked(&self) -> MutexGuard<'_, HashMap<SessionId, SessionController>> {
        self.parked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a session in its own task.
    pub fn spawn_session(
        &self,
        session_id: SessionId,
        disallowed_kinds: &[String],
    ) -> Result<(), SessionError> {
        let mut tasks = self.tasks();
        if tasks.contains_key(&session_id) || self.parked().contains_key(&session_id) {
            return Err(SessionError::AlreadyRunning(session_id));
        }

        let controller = self.controller(&session_id, disallowed_kinds);
        info!(session = %session_id, "Spawning session");
        tasks.insert(session_id, Slot::Running(launch(controller)));
        Ok(())
    }

    /// Spawn every session listed in the configuration, or `count`
    /// generated ones (`session-1`, `session-2`, ...) if none are listed.
    pub fn spawn_configured(&self, count: u32) -> Result<Vec<SessionId>, SessionError> {
        let specs: Vec<(SessionId, Vec<String>)> = if self.config.sessions.is_empty() {
            (1..=count)
                .map(|n| (SessionId(format!("session-{n}")), Vec::new()))
                .collect()
        } else {
            self.config
                .sessions
                .iter()
                .map(|s| (SessionId(s.id.clone()), s.disallowed_kinds.clone()))
                .collect()
        };

        let mut ids = Vec::with_capacity(specs.len());
        for (id, disallowed) in specs {
            self.spawn_session(id.clone(), &disallowed)?;
            ids.push(id);
        }
        Ok(ids)
    }

    fn controller(&self, session_id: &SessionId, disallowed_kinds: &[String]) -> SessionController {
        let index = self.spawned.fetch_add(1, Ordering::Relaxed);
        let scheduler = match self.seed {
            Some(seed) => StealthScheduler::seeded(self.config.scheduler.clone(), seed.wrapping_add(index)),
            None => StealthScheduler::new(self.config.scheduler.clone()),
        };
        let policy = DecisionPolicy::from(&self.config.decision)
            .with_disallowed(disallowed_kinds.iter().cloned());

        SessionController::new(
            session_id.clone(),
            ControllerParts {
                stream: self.feed.open(session_id),
                decision: DecisionEngine::new(self.manager.clone(), policy),
                scheduler,
                executor: ActionExecutor::new(
                    self.sink.clone(),
                    self.audit.clone(),
                    self.monitor.clone(),
                    ExecutorPolicy::from(&self.config.executor),
                ),
                monitor: self.monitor.clone(),
                audit: self.audit.clone(),
                events: self.events.clone(),
                settings: SessionSettings::from(&self.config.session),
            },
        )
    }

    /// Inject an observation for a running session.
    pub fn submit_observation(
        &self,
        session_id: &SessionId,
        observation: Observation,
    ) -> Result<(), SessionError> {
        self.feed.submit_observation(session_id, observation)
    }

    /// Raise an external stop on one session.
    pub fn stop_session(&self, session_id: &SessionId, source: &str) -> bool {
        self.monitor.stop(session_id, StopReason::external(source))
    }

    /// Raise an external stop on every session.
    pub fn stop_all(&self, source: &str) -> usize {
        let stopped = self.monitor.stop_all(StopReason::external(source));
        info!(source, stopped, "Stop requested for all sessions");
        stopped
    }

    /// Ids of sessions whose tasks are still running.
    pub fn running(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self
            .tasks()
            .iter()
            .filter(|(_, slot)| match slot {
                Slot::Running(task) => !task.is_finished(),
                Slot::Joining => true,
            })
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Wait for every session task to end.
    ///
    /// Emergency-stopped controllers are parked so they can be reset. Any
    /// other finished session is retired and its id becomes free again.
    pub async fn join_all(&self) -> Vec<SessionOutcome> {
        let tasks: Vec<(SessionId, SessionTask)> = self
            .tasks()
            .iter_mut()
            .filter_map(|(id, slot)| match std::mem::replace(slot, Slot::Joining) {
                Slot::Running(task) => Some((id.clone(), task)),
                Slot::Joining => None,
            })
            .collect();
        let mut outcomes = Vec::with_capacity(tasks.len());

        for (session_id, task) in tasks {
            let joined = task.await;
            let mut slots = self.tasks();
            match joined {
                Ok((controller, exit)) => {
                    outcomes.push(SessionOutcome {
                        session_id: session_id.clone(),
                        exit,
                        state: controller.state().clone(),
                    });
                    if controller.lifecycle().is_terminal() {
                        self.parked().insert(session_id.clone(), controller);
                    } else {
                        self.monitor.retire(&session_id);
                    }
                }
                Err(e) => {
                    error!(session = %session_id, error = %e, "Session task failed");
                    self.monitor.retire(&session_id);
                }
            }
            slots.remove(&session_id);
        }

        outcomes.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        outcomes
    }

    /// Reset an emergency-stopped session and run it again.
    pub fn reset_session(&self, session_id: &SessionId) -> Result<(), SessionError> {
        if self.tasks().contains_key(session_id) {
            return Err(SessionError::AlreadyRunning(session_id.clone()));
        }
        let mut controller = self
            .parked()
            .remove(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.clone()))?;

        if let Err(e) = controller.reset() {
            self.parked().insert(session_id.clone(), controller);
            return Err(e);
        }
        self.tasks()
            .insert(session_id.clone(), Slot::Running(launch(controller)));
        Ok(())
    }

    /// Per-session statistics gathered from the audit stream.
    pub fn reports(&self) -> Vec<SessionReport> {
        self.stats.reports()
    }
}

fn launch(mut controller: SessionController) -> SessionTask {
    tokio::spawn(async move {
        let exit = controller.run().await;
        (controller, exit)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cadence_core::action::ActionPlan;
    use cadence_core::error::BackendError;
    use cadence_core::session::LifecycleState;
    use cadence_core::sink::Outcome;
    use std::time::Duration;

    /// Counts successful dispatches per session.
    #[derive(Default)]
    struct Counting {
        dispatched: Mutex<HashMap<SessionId, usize>>,
    }

    impl Counting {
        fn count(&self, session_id: &SessionId) -> usize {
            self.dispatched
                .lock()
                .unwrap()
                .get(session_id)
                .copied()
                .unwrap_or(0)
        }
    }

    #[async_trait]
    impl OutputSink for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        async fn execute(&self, plan: &ActionPlan) -> Outcome {
            *self
                .dispatched
                .lock()
                .unwrap()
                .entry(plan.session_id.clone())
                .or_default() += 1;
            Outcome::Success
        }
    }

    fn config() -> CadenceConfig {
        let mut config = CadenceConfig::default();
        config.audit.log_entries = false;
        config.scheduler.min_delay_ms = 50;
        config.scheduler.max_delay_ms = 100;
        config.scheduler.base_cooldown_ms = 50;
        config.scheduler.fatigue_cooldown_ms = 0;
        config.session.observation_timeout_ms = 500;
        config.session.missed_cycle_ceiling = 100;
        config
    }

    fn runtime(sink: Arc<Counting>) -> Runtime {
        Runtime::builder(config(), sink).seed(42).build().unwrap()
    }

    fn sid(s: &str) -> SessionId {
        SessionId::from(s)
    }

    async fn feed(runtime: &Runtime, sessions: &[&SessionId], rounds: usize) {
        for _ in 0..rounds {
            for id in sessions {
                let observation = Observation::new((*id).clone(), vec![0.9, 0.5]);
                runtime.submit_observation(id, observation).unwrap();
            }
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_session_is_rejected() {
        let rt = runtime(Arc::new(Counting::default()));
        rt.spawn_session(sid("a"), &[]).unwrap();
        assert!(matches!(
            rt.spawn_session(sid("a"), &[]),
            Err(SessionError::AlreadyRunning(_))
        ));

        rt.stop_all("test");
        rt.join_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn session_stays_reserved_while_being_joined() {
        let rt = Arc::new(runtime(Arc::new(Counting::default())));
        let a = sid("a");
        rt.spawn_session(a.clone(), &[]).unwrap();

        let joiner = {
            let rt = rt.clone();
            tokio::spawn(async move { rt.join_all().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(rt.running(), vec![a.clone()]);
        assert!(matches!(
            rt.spawn_session(a.clone(), &[]),
            Err(SessionError::AlreadyRunning(_))
        ));
        assert!(matches!(
            rt.reset_session(&a),
            Err(SessionError::AlreadyRunning(_))
        ));

        rt.stop_all("test");
        let outcomes = joiner.await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(rt.running().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn session_at_cycle_limit_frees_its_id() {
        let sink = Arc::new(Counting::default());
        let mut config = config();
        config.session.max_cycles = 1;
        let rt = Runtime::builder(config, sink.clone()).build().unwrap();
        let a = sid("a");
        rt.spawn_session(a.clone(), &[]).unwrap();
        // a stop raised after the session ended must not leak into the next run
        tokio::time::sleep(Duration::from_millis(600)).await;
        rt.stop_all("late");

        let outcomes = rt.join_all().await;
        assert_eq!(outcomes[0].exit.as_ref().unwrap(), &SessionExit::CycleLimit);
        assert!(matches!(
            rt.reset_session(&a),
            Err(SessionError::NotFound(_))
        ));

        rt.spawn_session(a.clone(), &[]).unwrap();
        feed(&rt, &[&a], 1).await;
        assert_eq!(sink.count(&a), 1);
        let outcomes = rt.join_all().await;
        assert_eq!(outcomes[0].exit.as_ref().unwrap(), &SessionExit::CycleLimit);
    }

    #[tokio::test(start_paused = true)]
    async fn stopping_one_session_leaves_the_other_running() {
        let sink = Arc::new(Counting::default());
        let rt = runtime(sink.clone());
        let (a, b) = (sid("a"), sid("b"));
        rt.spawn_session(a.clone(), &[]).unwrap();
        rt.spawn_session(b.clone(), &[]).unwrap();

        feed(&rt, &[&a, &b], 3).await;
        assert!(sink.count(&a) > 0);
        assert!(rt.stop_session(&a, "operator"));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let a_after_stop = sink.count(&a);
        let b_before = sink.count(&b);
        feed(&rt, &[&b], 3).await;
        assert_eq!(sink.count(&a), a_after_stop);
        assert!(sink.count(&b) > b_before);
        assert_eq!(rt.running(), vec![b.clone()]);

        rt.stop_all("shutdown");
        let outcomes = rt.join_all().await;
        assert_eq!(outcomes.len(), 2);
        assert_eq!(
            outcomes[0].exit.as_ref().unwrap(),
            &SessionExit::Stopped(StopReason::external("operator"))
        );
        assert_eq!(
            outcomes[1].exit.as_ref().unwrap(),
            &SessionExit::Stopped(StopReason::external("shutdown"))
        );

        let reports = rt.reports();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[1].stats.actions as usize, sink.count(&b));
        assert!(reports[0].stats.stop_reason.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_session_can_be_reset_and_rerun() {
        let sink = Arc::new(Counting::default());
        let rt = runtime(sink.clone());
        let a = sid("a");
        rt.spawn_session(a.clone(), &[]).unwrap();

        rt.stop_session(&a, "operator");
        let outcomes = rt.join_all().await;
        assert_eq!(outcomes[0].state.lifecycle, LifecycleState::EmergencyStopped);

        rt.reset_session(&a).unwrap();
        assert!(matches!(
            rt.reset_session(&a),
            Err(SessionError::AlreadyRunning(_))
        ));
        feed(&rt, &[&a], 2).await;
        assert!(sink.count(&a) > 0);

        rt.stop_all("shutdown");
        rt.join_all().await;
        assert!(matches!(
            rt.reset_session(&sid("missing")),
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn default_audit_streams_without_retaining() {
        let rt = runtime(Arc::new(Counting::default()));
        let a = sid("a");
        rt.spawn_session(a.clone(), &[]).unwrap();
        feed(&rt, &[&a], 2).await;
        rt.stop_all("test");
        rt.join_all().await;

        assert!(rt.audit().count() > 0);
        assert!(rt.audit().entries().is_empty());
        assert!(rt.reports()[0].stats.actions > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn configured_sessions_carry_their_own_constraints() {
        let sink = Arc::new(Counting::default());
        let mut config = config();
        config.sessions = vec![
            cadence_config::SessionSpecConfig {
                id: "free".into(),
                disallowed_kinds: vec![],
            },
            cadence_config::SessionSpecConfig {
                id: "no-reel".into(),
                disallowed_kinds: vec!["reel".into()],
            },
        ];
        let rt = Runtime::builder(config, sink.clone()).build().unwrap();
        let ids = rt.spawn_configured(5).unwrap();
        assert_eq!(ids, vec![sid("free"), sid("no-reel")]);

        feed(&rt, &[&ids[0], &ids[1]], 2).await;
        assert!(sink.count(&sid("free")) > 0);
        assert_eq!(sink.count(&sid("no-reel")), 0);

        rt.stop_all("shutdown");
        rt.join_all().await;
    }

    #[tokio::test]
    async fn unknown_backend_in_chain_fails_the_build() {
        let mut config = config();
        config.backends.fallback_chain = vec!["primary".into(), "remote".into()];
        let result = Runtime::builder(config, Arc::new(Counting::default())).build();
        assert!(matches!(
            result,
            Err(Error::Backend(BackendError::UnknownBackend(id))) if id == "remote"
        ));
    }

    #[tokio::test]
    async fn observation_for_unknown_session_is_rejected() {
        let rt = runtime(Arc::new(Counting::default()));
        let result = rt.submit_observation(&sid("ghost"), Observation::new(sid("ghost"), vec![0.1]));
        assert!(matches!(result, Err(SessionError::NotFound(_))));
    }
}
