//! Error types for the Cadence domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use crate::session::{LifecycleState, SessionId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The top-level error type for all Cadence operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Backend errors ---
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    // --- Session errors ---
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    // --- Perception errors ---
    #[error("Perception error: {0}")]
    Perception(#[from] PerceptionError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("Backend '{backend}' failed: {reason}")]
    Failed { backend: String, reason: String },

    #[error("Backend '{backend}' timed out after {timeout_ms}ms")]
    Timeout { backend: String, timeout_ms: u64 },

    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Backend returned an invalid candidate: {0}")]
    InvalidCandidate(String),

    #[error("Unknown backend in fallback chain: {0}")]
    UnknownBackend(String),

    #[error("Backend not configured: {0}")]
    NotConfigured(String),
}

#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("Session already running: {0}")]
    AlreadyRunning(SessionId),

    #[error("Session not found: {0}")]
    NotFound(SessionId),

    #[error("Session {session} is emergency-stopped: {reason}")]
    Stopped { session: SessionId, reason: String },

    #[error("Invalid transition {from} -> {to}")]
    InvalidTransition {
        from: LifecycleState,
        to: LifecycleState,
    },

    #[error("Observation for {observed} submitted to session {session}")]
    SessionMismatch {
        session: SessionId,
        observed: SessionId,
    },

    #[error("Perception feed closed for session {0}")]
    FeedClosed(SessionId),
}

#[derive(Debug, Clone, Error)]
pub enum PerceptionError {
    #[error("No observation within {waited_ms}ms")]
    Timeout { waited_ms: u64 },

    #[error("Perception feed closed")]
    Closed,
}

/// The cycle-level fault taxonomy.
///
/// Faults are what the control loop records and reports; they are not
/// necessarily errors returned to a caller. Only `ExecutorFatalFailure` and
/// `SafetyViolation` end a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "fault", rename_all = "snake_case")]
pub enum CycleFault {
    /// No observation arrived within the configured window.
    PerceptionTimeout { waited_ms: u64 },
    /// A single backend failed; recovered by failover.
    BackendUnavailable { backend: String, reason: String },
    /// Every backend in the chain failed or is circuit-open.
    AllBackendsExhausted,
    /// The output sink reported a failure worth retrying.
    ExecutorRecoverableFailure { reason: String },
    /// The output sink reported a failure that must stop the session.
    ExecutorFatalFailure { reason: String },
    /// A safety ceiling was breached.
    SafetyViolation { reason: String },
}

impl CycleFault {
    /// Whether this fault forces the session into `EMERGENCY_STOPPED`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CycleFault::ExecutorFatalFailure { .. } | CycleFault::SafetyViolation { .. }
        )
    }
}

impl std::fmt::Display for CycleFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CycleFault::PerceptionTimeout { waited_ms } => {
                write!(f, "perception timeout after {waited_ms}ms")
            }
            CycleFault::BackendUnavailable { backend, reason } => {
                write!(f, "backend '{backend}' unavailable: {reason}")
            }
            CycleFault::AllBackendsExhausted => write!(f, "all backends exhausted"),
            CycleFault::ExecutorRecoverableFailure { reason } => {
                write!(f, "recoverable executor failure: {reason}")
            }
            CycleFault::ExecutorFatalFailure { reason } => {
                write!(f, "fatal executor failure: {reason}")
            }
            CycleFault::SafetyViolation { reason } => write!(f, "safety violation: {reason}"),
        }
    }
}
