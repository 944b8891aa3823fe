//! Thread-safe run statistics, fed by the audit stream.
//!
//! `RunStats` is an [`AuditSink`]: attach it to the audit log and every
//! session's counters stay current without the control loop knowing about
//! telemetry at all.

use crate::model::{SessionReport, SessionStats};
use cadence_core::session::{LifecycleState, SessionId};
use cadence_safety::{AttemptOutcome, AuditEntry, AuditEvent, AuditSink};
use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

#[derive(Debug, Default)]
pub struct RunStats {
    sessions: RwLock<BTreeMap<SessionId, SessionStats>>,
}

impl RunStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Statistics for one session.
    pub fn session(&self, session_id: &SessionId) -> Option<SessionStats> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
    }

    /// Reports for every session, ordered by session id.
    pub fn reports(&self) -> Vec<SessionReport> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, stats)| SessionReport {
                session_id: id.clone(),
                stats: stats.clone(),
            })
            .collect()
    }

    /// Totals across all sessions.
    pub fn totals(&self) -> SessionStats {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        let mut total = SessionStats::default();
        for stats in sessions.values() {
            total.cycles += stats.cycles;
            total.actions += stats.actions;
            total.plans += stats.plans;
            total.missed_cycles += stats.missed_cycles;
            total.backend_exhaustions += stats.backend_exhaustions;
            total.retries += stats.retries;
            total.failed_attempts += stats.failed_attempts;
            total.abandoned_plans += stats.abandoned_plans;
            total.breaks += stats.breaks;
            total.total_delay_ms += stats.total_delay_ms;
            for (label, n) in &stats.no_ops {
                *total.no_ops.entry(label.clone()).or_default() += n;
            }
            for (backend, n) in &stats.backend_usage {
                *total.backend_usage.entry(backend.clone()).or_default() += n;
            }
        }
        total
    }

    fn apply(stats: &mut SessionStats, event: &AuditEvent) {
        match event {
            AuditEvent::SessionStarted => {}
            AuditEvent::StateChanged { to, .. } => {
                stats.final_state = Some(*to);
                if *to == LifecycleState::Cooldown {
                    stats.cycles += 1;
                }
            }
            AuditEvent::PerceptionTimeout { .. } => {
                stats.missed_cycles += 1;
                stats.cycles += 1;
            }
            AuditEvent::CandidateAccepted { backend, .. } => {
                *stats.backend_usage.entry(backend.clone()).or_default() += 1;
            }
            AuditEvent::NoOp { reason } => {
                *stats.no_ops.entry(reason.label().to_string()).or_default() += 1;
            }
            AuditEvent::BackendsExhausted { .. } => stats.backend_exhaustions += 1,
            AuditEvent::Degraded | AuditEvent::Recovered => {}
            AuditEvent::PlanScheduled {
                delay_ms,
                break_applied,
                ..
            } => {
                stats.plans += 1;
                stats.total_delay_ms += delay_ms;
                if *break_applied {
                    stats.breaks += 1;
                }
            }
            AuditEvent::ExecutionAttempt {
                attempt, outcome, ..
            } => {
                if *attempt > 1 {
                    stats.retries += 1;
                }
                match outcome {
                    AttemptOutcome::Success => stats.actions += 1,
                    o if o.is_recoverable_failure() => stats.failed_attempts += 1,
                    _ => {}
                }
            }
            AuditEvent::RetriesExhausted { .. } => stats.abandoned_plans += 1,
            AuditEvent::EmergencyStop { reason } => {
                stats.stop_reason = Some(reason.to_string());
                stats.final_state = Some(LifecycleState::EmergencyStopped);
            }
            AuditEvent::SessionReset => {
                stats.stop_reason = None;
                stats.final_state = Some(LifecycleState::Idle);
            }
            AuditEvent::SessionFinished { cycles } => stats.cycles = *cycles,
        }
    }
}

impl AuditSink for RunStats {
    fn record(&self, entry: &AuditEntry) {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let stats = sessions.entry(entry.session_id.clone()).or_default();
        Self::apply(stats, &entry.event);
    }
}
