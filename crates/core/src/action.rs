//! Action candidates, plans, and the decisions that produce them.
//!
//! A backend proposes an `ActionCandidate`; the decision stage accepts it or
//! turns the cycle into a no-op; the scheduler turns an accepted candidate
//! into an `ActionPlan` with a dispatch time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::session::{SessionId, clamp_unit};

/// A proposed action. Confidence is always within `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionCandidate {
    /// What to do (e.g. "reel", "cast", "wait")
    pub kind: String,

    /// Kind-specific parameters
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub parameters: serde_json::Map<String, serde_json::Value>,

    #[serde(deserialize_with = "deserialize_confidence")]
    confidence: f64,

    /// Which backend produced this candidate
    pub source_backend_id: String,

    /// Position of the source backend in the fallback chain (0 = first)
    #[serde(default)]
    pub source_rank: usize,

    pub produced_at: DateTime<Utc>,
}

fn deserialize_confidence<'de, D>(deserializer: D) -> std::result::Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    f64::deserialize(deserializer).map(clamp_unit)
}

impl ActionCandidate {
    pub fn new(kind: impl Into<String>, confidence: f64, source_backend_id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            parameters: serde_json::Map::new(),
            confidence: clamp_unit(confidence),
            source_backend_id: source_backend_id.into(),
            source_rank: 0,
            produced_at: Utc::now(),
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn set_confidence(&mut self, confidence: f64) {
        self.confidence = clamp_unit(confidence);
    }
}

/// Why a cycle produced no action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum NoOpReason {
    /// Best candidate fell below the acceptance threshold.
    LowConfidence { confidence: f64, threshold: f64 },
    /// The candidate's kind is disallowed for this session.
    DisallowedKind { kind: String },
    /// Every backend failed or is circuit-open.
    NoBackendAvailable,
    /// Dispatch would land too long after the observation.
    LatencyBudgetExceeded { latency_ms: u64, budget_ms: u64 },
}

impl NoOpReason {
    /// Short label used for counters and summaries.
    pub fn label(&self) -> &'static str {
        match self {
            NoOpReason::LowConfidence { .. } => "low_confidence",
            NoOpReason::DisallowedKind { .. } => "disallowed_kind",
            NoOpReason::NoBackendAvailable => "no_backend",
            NoOpReason::LatencyBudgetExceeded { .. } => "latency_budget",
        }
    }
}

impl std::fmt::Display for NoOpReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NoOpReason::LowConfidence {
                confidence,
                threshold,
            } => write!(f, "confidence {confidence:.2} below threshold {threshold:.2}"),
            NoOpReason::DisallowedKind { kind } => write!(f, "action kind '{kind}' is disallowed"),
            NoOpReason::NoBackendAvailable => write!(f, "no backend available"),
            NoOpReason::LatencyBudgetExceeded {
                latency_ms,
                budget_ms,
            } => write!(f, "latency {latency_ms}ms exceeds budget {budget_ms}ms"),
        }
    }
}

/// The result of the decision stage for one observation.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Act(ActionCandidate),
    NoOp(NoOpReason),
}

/// An accepted candidate with a dispatch slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionPlan {
    pub plan_id: String,
    pub session_id: SessionId,
    pub candidate: ActionCandidate,

    /// Wall-clock dispatch time
    pub scheduled_at: DateTime<Utc>,

    /// Total delay before dispatch, including any break extension
    pub delay_ms: u64,

    /// Signed offset of the sampled delay from the base delay
    pub jitter_applied_ms: i64,

    /// Whether a fatigue break extension was added
    pub break_applied: bool,
}

impl ActionPlan {
    pub fn new(
        session_id: SessionId,
        candidate: ActionCandidate,
        delay: Duration,
        jitter_applied_ms: i64,
        break_applied: bool,
    ) -> Self {
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        let offset = chrono::Duration::milliseconds(i64::try_from(delay_ms).unwrap_or(i64::MAX));
        Self {
            plan_id: Uuid::new_v4().to_string(),
            session_id,
            candidate,
            scheduled_at: Utc::now() + offset,
            delay_ms,
            jitter_applied_ms,
            break_applied,
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// The result of the scheduling stage.
#[derive(Debug, Clone, PartialEq)]
pub enum Schedule {
    Plan(ActionPlan),
    NoOp(NoOpReason),
}
