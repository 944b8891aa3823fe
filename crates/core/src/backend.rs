//! Backend trait: the abstraction over decision sources.
//!
//! A Backend looks at an observation and proposes an action. Rule tables,
//! local models and remote APIs all implement the same trait; the model
//! manager calls `predict()` without knowing which one it is talking to.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::action::ActionCandidate;
use crate::error::BackendError;
use crate::observation::Observation;
use crate::session::{SessionId, SessionState};

/// Session context handed to a backend alongside the observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictContext {
    pub session_id: SessionId,

    /// Cycle number within the session
    pub cycle: u64,

    pub fatigue_level: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_action_at: Option<DateTime<Utc>>,

    /// How long the backend has before the call is abandoned
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
}

impl PredictContext {
    pub fn from_state(state: &SessionState) -> Self {
        Self {
            session_id: state.session_id.clone(),
            cycle: state.cycle,
            fatigue_level: state.fatigue_level(),
            last_action_at: state.last_action_at,
            timeout: Duration::ZERO,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// The core Backend trait.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Stable identifier used in the fallback chain (e.g. "rules", "remote").
    fn id(&self) -> &str;

    /// Propose an action for this observation.
    async fn predict(
        &self,
        observation: &Observation,
        context: &PredictContext,
    ) -> std::result::Result<ActionCandidate, BackendError>;

    /// Health check: can the backend serve predictions right now?
    async fn health_check(&self) -> std::result::Result<bool, BackendError> {
        Ok(true)
    }
}

/// Health of a backend as tracked by the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthState {
    Healthy,
    Degraded,
    CircuitOpen,
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthState::Healthy => write!(f, "HEALTHY"),
            HealthState::Degraded => write!(f, "DEGRADED"),
            HealthState::CircuitOpen => write!(f, "CIRCUIT_OPEN"),
        }
    }
}

/// Read-only snapshot of one backend in the fallback chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendDescriptor {
    pub id: String,
    pub priority_rank: usize,
    pub health_state: HealthState,
    pub consecutive_failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_success_at: Option<DateTime<Utc>>,
}
