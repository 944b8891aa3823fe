//! Audit log: an append-only, totally ordered record of what every session did.
//!
//! Each entry gets a sequence number under the log lock and is forwarded to
//! every sink before the lock is released, so all sinks observe the same
//! order and a session's entries appear in the order they happened.

use cadence_core::action::NoOpReason;
use cadence_core::session::{LifecycleState, SessionId, StopReason};
use cadence_core::sink::Outcome;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A single audit log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Position in the log, strictly increasing across all sessions
    pub seq: u64,
    pub session_id: SessionId,
    pub stage: AuditStage,
    pub event: AuditEvent,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// The pipeline stage an entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStage {
    Session,
    Perception,
    Decision,
    Scheduler,
    Executor,
    Safety,
}

/// How one dispatch attempt ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    RecoverableFailure { detail: String },
    FatalFailure { detail: String },
    /// The sink did not answer within the dispatch timeout
    TimedOut { timeout_ms: u64 },
    /// The session was stopped while the attempt was in flight
    Aborted,
}

impl AttemptOutcome {
    /// Whether this attempt counts toward the safety failure ceiling.
    pub fn is_recoverable_failure(&self) -> bool {
        matches!(
            self,
            AttemptOutcome::RecoverableFailure { .. } | AttemptOutcome::TimedOut { .. }
        )
    }
}

impl From<&Outcome> for AttemptOutcome {
    fn from(outcome: &Outcome) -> Self {
        match outcome {
            Outcome::Success => AttemptOutcome::Success,
            Outcome::RecoverableFailure(detail) => AttemptOutcome::RecoverableFailure {
                detail: detail.clone(),
            },
            Outcome::FatalFailure(detail) => AttemptOutcome::FatalFailure {
                detail: detail.clone(),
            },
        }
    }
}

/// Auditable control-loop events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    SessionStarted,
    StateChanged {
        from: LifecycleState,
        to: LifecycleState,
    },
    PerceptionTimeout {
        waited_ms: u64,
        consecutive: u32,
    },
    CandidateAccepted {
        kind: String,
        confidence: f64,
        backend: String,
    },
    NoOp {
        reason: NoOpReason,
    },
    BackendsExhausted {
        attempted: Vec<String>,
    },
    Degraded,
    Recovered,
    PlanScheduled {
        plan_id: String,
        delay_ms: u64,
        jitter_ms: i64,
        break_applied: bool,
    },
    ExecutionAttempt {
        plan_id: String,
        attempt: u32,
        outcome: AttemptOutcome,
    },
    RetriesExhausted {
        plan_id: String,
        attempts: u32,
    },
    EmergencyStop {
        reason: StopReason,
    },
    SessionReset,
    SessionFinished {
        cycles: u64,
    },
}

impl AuditEvent {
    pub fn stage(&self) -> AuditStage {
        match self {
            AuditEvent::SessionStarted
            | AuditEvent::StateChanged { .. }
            | AuditEvent::SessionReset
            | AuditEvent::SessionFinished { .. } => AuditStage::Session,
            AuditEvent::PerceptionTimeout { .. } => AuditStage::Perception,
            AuditEvent::CandidateAccepted { .. }
            | AuditEvent::NoOp { .. }
            | AuditEvent::BackendsExhausted { .. }
            | AuditEvent::Degraded
            | AuditEvent::Recovered => AuditStage::Decision,
            AuditEvent::PlanScheduled { .. } => AuditStage::Scheduler,
            AuditEvent::ExecutionAttempt { .. } | AuditEvent::RetriesExhausted { .. } => {
                AuditStage::Executor
            }
            AuditEvent::EmergencyStop { .. } => AuditStage::Safety,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AuditEvent::SessionStarted => "session_started",
            AuditEvent::StateChanged { .. } => "state_changed",
            AuditEvent::PerceptionTimeout { .. } => "perception_timeout",
            AuditEvent::CandidateAccepted { .. } => "candidate_accepted",
            AuditEvent::NoOp { .. } => "no_op",
            AuditEvent::BackendsExhausted { .. } => "backends_exhausted",
            AuditEvent::Degraded => "degraded",
            AuditEvent::Recovered => "recovered",
            AuditEvent::PlanScheduled { .. } => "plan_scheduled",
            AuditEvent::ExecutionAttempt { .. } => "execution_attempt",
            AuditEvent::RetriesExhausted { .. } => "retries_exhausted",
            AuditEvent::EmergencyStop { .. } => "emergency_stop",
            AuditEvent::SessionReset => "session_reset",
            AuditEvent::SessionFinished { .. } => "session_finished",
        }
    }
}

/// Trait for audit log sinks (where entries are written).
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: &AuditEntry);
}

struct LogState {
    next_seq: u64,
    entries: Vec<AuditEntry>,
}

/// The audit log. Entries are kept in memory unless the log is streaming.
pub struct AuditLog {
    state: Mutex<LogState>,
    retain: bool,
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("AuditLog")
            .field("next_seq", &state.next_seq)
            .field("retained", &state.entries.len())
            .field("sink_count", &self.sinks.len())
            .finish()
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditLog {
    /// Create an in-memory audit log with no sinks.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LogState {
                next_seq: 0,
                entries: Vec::new(),
            }),
            retain: true,
            sinks: Vec::new(),
        }
    }

    /// Forward entries only to sinks; keep nothing in memory.
    pub fn streaming() -> Self {
        Self {
            retain: false,
            ..Self::new()
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an entry and forward it to every sink.
    pub fn record(&self, session_id: &SessionId, event: AuditEvent, detail: Option<String>) -> u64 {
        let mut state = self.lock();
        let seq = state.next_seq;
        state.next_seq += 1;

        let entry = AuditEntry {
            seq,
            session_id: session_id.clone(),
            stage: event.stage(),
            event,
            timestamp: Utc::now(),
            detail,
        };

        for sink in &self.sinks {
            sink.record(&entry);
        }
        if self.retain {
            state.entries.push(entry);
        }
        seq
    }

    /// All retained entries, in log order.
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.lock().entries.clone()
    }

    /// Retained entries for one session, in log order.
    pub fn entries_for(&self, session_id: &SessionId) -> Vec<AuditEntry> {
        self.lock()
            .entries
            .iter()
            .filter(|e| &e.session_id == session_id)
            .cloned()
            .collect()
    }

    /// Number of entries ever recorded, retained or not.
    pub fn count(&self) -> u64 {
        self.lock().next_seq
    }
}

/// A tracing-based audit sink that logs entries via `tracing::info!`.
pub struct TracingSink;

impl AuditSink for TracingSink {
    fn record(&self, entry: &AuditEntry) {
        tracing::info!(
            seq = entry.seq,
            session = %entry.session_id,
            stage = ?entry.stage,
            event = entry.event.name(),
            details = ?entry.detail,
            "AUDIT"
        );
    }
}

/// Appends each entry as one JSON line to a file.
pub struct JsonLinesSink {
    writer: Mutex<BufWriter<File>>,
}

impl JsonLinesSink {
    /// Open (or create) the file in append mode.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }
}

impl AuditSink for JsonLinesSink {
    fn record(&self, entry: &AuditEntry) {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = write_line(&mut *writer, entry) {
            tracing::warn!(seq = entry.seq, error = %e, "Failed to write audit entry");
        }
    }
}

fn write_line(writer: &mut impl Write, entry: &AuditEntry) -> std::io::Result<()> {
    serde_json::to_writer(&mut *writer, entry)?;
    writer.write_all(b"\n")?;
    writer.flush()
}
