//! Data model for per-session run statistics.

use cadence_core::session::{LifecycleState, SessionId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ── Session statistics ──────────────────────────────────────────────────────

/// Counters for one session, derived from its audit stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionStats {
    /// Completed cycles, including no-op and missed ones.
    pub cycles: u64,
    /// Plans dispatched successfully.
    pub actions: u64,
    /// Plans handed to the executor.
    pub plans: u64,
    /// No-op cycles keyed by reason label.
    pub no_ops: BTreeMap<String, u64>,
    /// Cycles without an observation.
    pub missed_cycles: u64,
    /// Cycles where every backend was exhausted.
    pub backend_exhaustions: u64,
    /// Dispatch attempts after the first one for a plan.
    pub retries: u64,
    /// Failed dispatch attempts (recoverable or timed out).
    pub failed_attempts: u64,
    /// Plans abandoned after the retry ceiling.
    pub abandoned_plans: u64,
    /// Plans that carried a fatigue break.
    pub breaks: u64,
    /// Sum of scheduled delays, for the mean.
    pub total_delay_ms: u64,
    /// Accepted candidates keyed by source backend.
    pub backend_usage: BTreeMap<String, u64>,
    /// Last lifecycle state seen.
    pub final_state: Option<LifecycleState>,
    /// Why the session was stopped, if it was.
    pub stop_reason: Option<String>,
}

impl SessionStats {
    pub fn total_no_ops(&self) -> u64 {
        self.no_ops.values().sum()
    }

    /// Mean scheduled delay in milliseconds.
    pub fn mean_delay_ms(&self) -> Option<u64> {
        (self.plans > 0).then(|| self.total_delay_ms / self.plans)
    }

    /// Backend with the most accepted candidates; ties go to the lower id.
    pub fn top_backend(&self) -> Option<&str> {
        self.backend_usage
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(id, _)| id.as_str())
    }
}

/// A snapshot of one session's statistics, as reported at the end of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReport {
    pub session_id: SessionId,
    pub stats: SessionStats,
}
