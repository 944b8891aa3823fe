//! Session identity, lifecycle states, and per-session state.
//!
//! A session is one independent instance of the control loop, bound to one
//! external target. Its `SessionState` is owned exclusively by the session's
//! controller; nothing here is shared across sessions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CycleFault;

/// Unique identifier for a session (one per external target).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn from(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle states of the per-session state machine.
///
/// `Idle` is initial. `EmergencyStopped` is terminal until an explicit reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    Idle,
    Observing,
    Deciding,
    Scheduling,
    Executing,
    Cooldown,
    EmergencyStopped,
}

impl LifecycleState {
    pub fn is_terminal(self) -> bool {
        self == LifecycleState::EmergencyStopped
    }

    /// Whether `self -> to` is an edge of the state machine.
    ///
    /// `EmergencyStopped -> Idle` is the reset edge; callers other than the
    /// explicit reset path must never take it.
    pub fn can_transition_to(self, to: LifecycleState) -> bool {
        use LifecycleState::*;

        if to == EmergencyStopped {
            return !self.is_terminal();
        }

        matches!(
            (self, to),
            (Idle, Observing)
                | (Observing, Deciding)
                | (Observing, Observing)
                | (Deciding, Scheduling)
                | (Deciding, Cooldown)
                | (Scheduling, Executing)
                | (Scheduling, Cooldown)
                | (Executing, Cooldown)
                | (Cooldown, Observing)
                | (EmergencyStopped, Idle)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Idle => "IDLE",
            LifecycleState::Observing => "OBSERVING",
            LifecycleState::Deciding => "DECIDING",
            LifecycleState::Scheduling => "SCHEDULING",
            LifecycleState::Executing => "EXECUTING",
            LifecycleState::Cooldown => "COOLDOWN",
            LifecycleState::EmergencyStopped => "EMERGENCY_STOPPED",
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session was forced into `EMERGENCY_STOPPED`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum StopReason {
    /// The output sink reported a fatal failure.
    FatalFailure { detail: String },
    /// Too many failures inside the rolling window.
    FailureCeiling { failures: u32, window_ms: u64 },
    /// Too many consecutive cycles without an observation.
    MissedCycles { count: u32 },
    /// An operator or supervisor asked for a stop.
    External { source: String },
}

impl StopReason {
    pub fn external(source: impl Into<String>) -> Self {
        StopReason::External {
            source: source.into(),
        }
    }

    /// The fault this stop is recorded as.
    pub fn fault(&self) -> CycleFault {
        match self {
            StopReason::FatalFailure { detail } => CycleFault::ExecutorFatalFailure {
                reason: detail.clone(),
            },
            other => CycleFault::SafetyViolation {
                reason: other.to_string(),
            },
        }
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::FatalFailure { detail } => write!(f, "fatal failure: {detail}"),
            StopReason::FailureCeiling {
                failures,
                window_ms,
            } => write!(f, "{failures} failures within {window_ms}ms"),
            StopReason::MissedCycles { count } => write!(f, "{count} consecutive missed cycles"),
            StopReason::External { source } => write!(f, "external stop from {source}"),
        }
    }
}

/// Per-session failure bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureCounters {
    /// Missed cycles since the last observation arrived.
    pub consecutive_missed: u32,
    /// Missed cycles over the session lifetime.
    pub missed_cycles: u64,
    /// Cycles where every backend was exhausted.
    pub backend_exhaustions: u64,
    /// Recoverable dispatch failures (every failed attempt).
    pub recoverable_failures: u64,
    /// Plans abandoned after the retry ceiling.
    pub exhausted_retries: u64,
}

/// Mutable state of one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: SessionId,
    pub lifecycle: LifecycleState,
    fatigue_level: f64,
    pub last_action_at: Option<DateTime<Utc>>,
    pub failure_counters: FailureCounters,
    /// Completed cycles (including no-op and missed cycles).
    pub cycle: u64,
    /// Actions scheduled since the last forced break.
    pub consecutive_actions: u32,
    /// Fatigue crossed its threshold; the next plan carries a break.
    /// Decay while resting does not clear it.
    pub break_due: bool,
    /// Set while every backend is exhausted; the session keeps cycling but
    /// takes no actions.
    pub degraded: bool,
}

impl SessionState {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            lifecycle: LifecycleState::Idle,
            fatigue_level: 0.0,
            last_action_at: None,
            failure_counters: FailureCounters::default(),
            cycle: 0,
            consecutive_actions: 0,
            break_due: false,
            degraded: false,
        }
    }

    /// Current fatigue level, always in `[0, 1]`.
    pub fn fatigue_level(&self) -> f64 {
        self.fatigue_level
    }

    /// Set the fatigue level, clamped to `[0, 1]`. NaN becomes 0.
    pub fn set_fatigue_level(&mut self, level: f64) {
        self.fatigue_level = clamp_unit(level);
    }
}

/// Clamp a value to `[0, 1]`, mapping NaN to 0.
pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_edges_are_allowed() {
        use LifecycleState::*;
        let cycle = [Idle, Observing, Deciding, Scheduling, Executing, Cooldown, Observing];
        for pair in cycle.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn noop_shortcut_and_missed_cycle_edges() {
        use LifecycleState::*;
        assert!(Deciding.can_transition_to(Cooldown));
        assert!(Observing.can_transition_to(Observing));
        assert!(!Observing.can_transition_to(Executing));
        assert!(!Idle.can_transition_to(Deciding));
    }

    #[test]
    fn emergency_stop_reachable_from_every_non_terminal_state() {
        use LifecycleState::*;
        for state in [Idle, Observing, Deciding, Scheduling, Executing, Cooldown] {
            assert!(state.can_transition_to(EmergencyStopped));
        }
        assert!(!EmergencyStopped.can_transition_to(EmergencyStopped));
        assert!(!EmergencyStopped.can_transition_to(Observing));
        assert!(EmergencyStopped.can_transition_to(Idle));
    }

    #[test]
    fn fatigue_is_clamped() {
        let mut state = SessionState::new(SessionId::from("s1"));
        state.set_fatigue_level(1.7);
        assert_eq!(state.fatigue_level(), 1.0);
        state.set_fatigue_level(-0.2);
        assert_eq!(state.fatigue_level(), 0.0);
        state.set_fatigue_level(f64::NAN);
        assert_eq!(state.fatigue_level(), 0.0);
    }

    #[test]
    fn stop_reason_maps_to_fault() {
        let fatal = StopReason::FatalFailure {
            detail: "sink gone".into(),
        };
        assert!(matches!(fatal.fault(), CycleFault::ExecutorFatalFailure { .. }));
        assert!(matches!(
            StopReason::external("ctrl-c").fault(),
            CycleFault::SafetyViolation { .. }
        ));
    }

    #[test]
    fn lifecycle_serializes_screaming_case() {
        let json = serde_json::to_string(&LifecycleState::EmergencyStopped).unwrap();
        assert_eq!(json, "\"EMERGENCY_STOPPED\"");
    }
}
