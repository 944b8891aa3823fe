//! Safety monitor: the only component allowed to force a session into
//! `EMERGENCY_STOPPED`.
//!
//! Each registered session gets a [`StopSignal`] backed by a `watch` channel.
//! Controllers race every wait against it, so a stop reaches a suspended
//! session as soon as it is raised.
//!
//! The monitor is fed by direct calls rather than by subscribing to the
//! audit stream or the event bus. The executor reports each failed attempt
//! and each fatal outcome, and the controller reports missed-cycle stops.
//! A failure therefore counts toward the ceiling before the next attempt
//! starts, and broadcast lag can never drop one.

use cadence_config::SafetyConfig;
use cadence_core::error::SessionError;
use cadence_core::event::{EventBus, SessionEvent};
use cadence_core::session::{SessionId, StopReason};
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};

/// Receiving half of a session's stop channel.
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<Option<StopReason>>,
}

impl StopSignal {
    /// A signal that never fires. Useful when driving components directly.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(None);
        Self { rx }
    }

    /// The current stop reason, if the session is stopped.
    pub fn reason(&self) -> Option<StopReason> {
        self.rx.borrow().clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Resolve once a stop is raised. Pends forever if the monitor is gone.
    pub async fn wait(&mut self) -> StopReason {
        loop {
            if let Some(reason) = self.rx.borrow_and_update().clone() {
                return reason;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Failure ceiling over a rolling window.
#[derive(Debug, Clone)]
pub struct SafetyPolicy {
    /// Failures tolerated inside the window; one more stops the session
    pub failure_ceiling: u32,
    pub failure_window: Duration,
}

impl From<&SafetyConfig> for SafetyPolicy {
    fn from(config: &SafetyConfig) -> Self {
        Self {
            failure_ceiling: config.failure_ceiling,
            failure_window: Duration::from_millis(config.failure_window_ms),
        }
    }
}

impl Default for SafetyPolicy {
    fn default() -> Self {
        Self::from(&SafetyConfig::default())
    }
}

struct Guarded {
    stop: watch::Sender<Option<StopReason>>,
    failures: VecDeque<Instant>,
}

impl Guarded {
    fn new() -> Self {
        let (stop, _) = watch::channel(None);
        Self {
            stop,
            failures: VecDeque::new(),
        }
    }
}

pub struct SafetyMonitor {
    policy: SafetyPolicy,
    sessions: Mutex<HashMap<SessionId, Guarded>>,
    events: Option<Arc<EventBus>>,
}

impl SafetyMonitor {
    pub fn new(policy: SafetyPolicy) -> Self {
        Self {
            policy,
            sessions: Mutex::new(HashMap::new()),
            events: None,
        }
    }

    /// Publish `Stopped` events on this bus.
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, Guarded>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a session (idempotent) and return its stop signal.
    pub fn register(&self, session_id: &SessionId) -> StopSignal {
        let mut sessions = self.lock();
        let guarded = sessions
            .entry(session_id.clone())
            .or_insert_with(Guarded::new);
        StopSignal {
            rx: guarded.stop.subscribe(),
        }
    }

    /// Raise a stop. The first reason wins; later calls return `false`.
    pub fn stop(&self, session_id: &SessionId, reason: StopReason) -> bool {
        let raised = {
            let sessions = self.lock();
            let Some(guarded) = sessions.get(session_id) else {
                warn!(session = %session_id, "Stop requested for unknown session");
                return false;
            };
            guarded.stop.send_if_modified(|current| {
                if current.is_some() {
                    return false;
                }
                *current = Some(reason.clone());
                true
            })
        };

        if raised {
            warn!(session = %session_id, reason = %reason, "Emergency stop raised");
            if let Some(events) = &self.events {
                events.publish(SessionEvent::Stopped {
                    session_id: session_id.clone(),
                    reason,
                    timestamp: Utc::now(),
                });
            }
        }
        raised
    }

    /// Stop every registered session. Returns how many were newly stopped.
    pub fn stop_all(&self, reason: StopReason) -> usize {
        let ids: Vec<SessionId> = self.lock().keys().cloned().collect();
        ids.into_iter()
            .filter(|id| self.stop(id, reason.clone()))
            .count()
    }

    /// A fatal sink outcome stops the session immediately.
    pub fn report_fatal(&self, session_id: &SessionId, detail: impl Into<String>) -> bool {
        self.stop(
            session_id,
            StopReason::FatalFailure {
                detail: detail.into(),
            },
        )
    }

    /// Count one failure in the rolling window; stops the session when the
    /// count goes over the ceiling.
    pub fn record_failure(&self, session_id: &SessionId) -> Option<StopReason> {
        let now = Instant::now();
        let count = {
            let mut sessions = self.lock();
            let guarded = sessions
                .entry(session_id.clone())
                .or_insert_with(Guarded::new);
            guarded.failures.push_back(now);
            while guarded
                .failures
                .front()
                .is_some_and(|t| now.duration_since(*t) > self.policy.failure_window)
            {
                guarded.failures.pop_front();
            }
            guarded.failures.len()
        };

        if count > self.policy.failure_ceiling as usize {
            let reason = StopReason::FailureCeiling {
                failures: u32::try_from(count).unwrap_or(u32::MAX),
                window_ms: u64::try_from(self.policy.failure_window.as_millis())
                    .unwrap_or(u64::MAX),
            };
            self.stop(session_id, reason.clone());
            return Some(reason);
        }
        None
    }

    /// Failures currently inside the window.
    pub fn failures_in_window(&self, session_id: &SessionId) -> usize {
        let now = Instant::now();
        self.lock().get(session_id).map_or(0, |g| {
            g.failures
                .iter()
                .filter(|t| now.duration_since(**t) <= self.policy.failure_window)
                .count()
        })
    }

    pub fn is_stopped(&self, session_id: &SessionId) -> Option<StopReason> {
        self.lock()
            .get(session_id)
            .and_then(|g| g.stop.borrow().clone())
    }

    /// Clear a stop and the failure window. Existing signals see the reset.
    /// Forget a session that ended without being stopped. A later
    /// `register` for the same id starts from a clean slate.
    pub fn retire(&self, session_id: &SessionId) -> bool {
        let removed = self.lock().remove(session_id).is_some();
        if removed {
            info!(session = %session_id, "Session retired");
        }
        removed
    }

    pub fn reset(&self, session_id: &SessionId) -> Result<(), SessionError> {
        let mut sessions = self.lock();
        let guarded = sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.clone()))?;
        guarded.failures.clear();
        guarded.stop.send_replace(None);
        info!(session = %session_id, "Safety state reset");
        Ok(())
    }
}
