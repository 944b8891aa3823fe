//! Model manager: ordered fallback chain with per-backend circuit breakers.
//!
//! Backends are tried in priority order. A backend that fails
//! `failure_threshold` times in a row has its circuit opened and is skipped
//! until the cooldown elapses; then exactly one half-open probe decides
//! whether it returns to `HEALTHY` or stays `CIRCUIT_OPEN`.
//!
//! Health is shared by every session, so each chain entry keeps its breaker
//! state behind its own mutex. The lock is never held across a backend call.

use cadence_config::BackendsConfig;
use cadence_core::backend::{Backend, BackendDescriptor, HealthState, PredictContext};
use cadence_core::error::BackendError;
use cadence_core::event::{EventBus, SessionEvent};
use cadence_core::{ActionCandidate, Observation};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker and timeout settings shared by every backend in a chain.
#[derive(Debug, Clone)]
pub struct BreakerPolicy {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// Time an open circuit waits before a half-open probe
    pub cooldown: Duration,
    /// Upper bound on a single backend call
    pub call_timeout: Duration,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(30),
            call_timeout: Duration::from_secs(2),
        }
    }
}

impl From<&BackendsConfig> for BreakerPolicy {
    fn from(config: &BackendsConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            cooldown: Duration::from_millis(config.cooldown_ms),
            call_timeout: Duration::from_millis(config.call_timeout_ms),
        }
    }
}

/// Result of a failover prediction.
#[derive(Debug, Clone, PartialEq)]
pub enum Prediction {
    Candidate(ActionCandidate),
    /// Every backend failed or was circuit-open. Not an error: the caller
    /// turns this into a no-op cycle.
    NoBackendAvailable { attempted: Vec<String> },
}

/// Result of asking every available backend.
#[derive(Debug, Clone, Default)]
pub struct Consultation {
    /// Successful candidates, in chain order
    pub candidates: Vec<ActionCandidate>,
    /// Backends that were actually called
    pub attempted: Vec<String>,
}

/// Breaker state for one chain entry.
#[derive(Debug)]
struct Health {
    state: HealthState,
    consecutive_failures: u32,
    last_success_at: Option<DateTime<Utc>>,
    opened_at: Option<Instant>,
    probing: bool,
}

impl Health {
    fn new() -> Self {
        Self {
            state: HealthState::Healthy,
            consecutive_failures: 0,
            last_success_at: None,
            opened_at: None,
            probing: false,
        }
    }
}

struct ChainEntry {
    backend: Arc<dyn Backend>,
    rank: usize,
    health: Mutex<Health>,
}

impl ChainEntry {
    fn health(&self) -> MutexGuard<'_, Health> {
        self.health.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Whether a chain entry may be called right now.
enum Admission {
    Closed,
    Probe,
    Skip,
}

/// Releases a half-open probe slot if the probing call is dropped
/// (cancelled) before it reports an outcome.
struct ProbeGuard<'a> {
    entry: &'a ChainEntry,
    armed: bool,
}

impl ProbeGuard<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.entry.health().probing = false;
        }
    }
}

/// The model manager: owns the fallback chain and every breaker.
pub struct ModelManager {
    chain: Vec<ChainEntry>,
    policy: BreakerPolicy,
    events: Option<Arc<EventBus>>,
}

impl ModelManager {
    /// Create a manager with no backends.
    pub fn new(policy: BreakerPolicy) -> Self {
        Self {
            chain: Vec::new(),
            policy,
            events: None,
        }
    }

    /// Append a backend at the lowest priority.
    pub fn add(mut self, backend: Arc<dyn Backend>) -> Self {
        let rank = self.chain.len();
        self.chain.push(ChainEntry {
            backend,
            rank,
            health: Mutex::new(Health::new()),
        });
        self
    }

    /// Publish health transitions on this bus.
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn policy(&self) -> &BreakerPolicy {
        &self.policy
    }

    /// Number of backends in the chain.
    pub fn len(&self) -> usize {
        self.chain.len()
    }

    /// Whether the chain is empty.
    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    /// Priority rank of a backend id (0 = first in chain).
    pub fn rank_of(&self, backend_id: &str) -> Option<usize> {
        self.chain
            .iter()
            .find(|e| e.backend.id() == backend_id)
            .map(|e| e.rank)
    }

    /// Snapshot of every backend's health, in chain order.
    pub fn descriptors(&self) -> Vec<BackendDescriptor> {
        self.chain
            .iter()
            .map(|entry| {
                let health = entry.health();
                BackendDescriptor {
                    id: entry.backend.id().to_string(),
                    priority_rank: entry.rank,
                    health_state: health.state,
                    consecutive_failures: health.consecutive_failures,
                    last_success_at: health.last_success_at,
                }
            })
            .collect()
    }

    /// Failover prediction: the first backend that answers wins.
    pub async fn predict(&self, observation: &Observation, context: &PredictContext) -> Prediction {
        let mut attempted = Vec::new();

        for entry in &self.chain {
            let Some(result) = self.call_admitted(entry, observation, context).await else {
                continue;
            };
            attempted.push(entry.backend.id().to_string());
            if let Ok(candidate) = result {
                return Prediction::Candidate(candidate);
            }
        }

        info!(
            session = %context.session_id,
            attempted = attempted.len(),
            total = self.chain.len(),
            "No backend available"
        );
        Prediction::NoBackendAvailable { attempted }
    }

    /// Ask every admitted backend, in chain order, and keep all answers.
    pub async fn consult_all(
        &self,
        observation: &Observation,
        context: &PredictContext,
    ) -> Consultation {
        let mut consultation = Consultation::default();

        for entry in &self.chain {
            let Some(result) = self.call_admitted(entry, observation, context).await else {
                continue;
            };
            consultation.attempted.push(entry.backend.id().to_string());
            if let Ok(candidate) = result {
                consultation.candidates.push(candidate);
            }
        }

        consultation
    }

    /// Call one entry if its breaker admits it; `None` means skipped.
    async fn call_admitted(
        &self,
        entry: &ChainEntry,
        observation: &Observation,
        context: &PredictContext,
    ) -> Option<Result<ActionCandidate, BackendError>> {
        let backend_id = entry.backend.id();
        let probe = match self.admit(entry) {
            Admission::Skip => {
                debug!(backend = %backend_id, "Circuit open, skipping backend");
                return None;
            }
            Admission::Probe => {
                info!(backend = %backend_id, "Cooldown elapsed, sending half-open probe");
                true
            }
            Admission::Closed => false,
        };

        let mut guard = ProbeGuard {
            entry,
            armed: probe,
        };

        debug!(
            session = %context.session_id,
            backend = %backend_id,
            rank = entry.rank,
            "Calling backend"
        );
        let result = self.call(entry, observation, context).await;
        guard.disarm();

        match &result {
            Ok(_) => self.record_success(entry),
            Err(e) => {
                warn!(
                    session = %context.session_id,
                    backend = %backend_id,
                    error = %e,
                    "Backend failed, trying next"
                );
                self.record_failure(entry, probe);
            }
        }
        Some(result)
    }

    async fn call(
        &self,
        entry: &ChainEntry,
        observation: &Observation,
        context: &PredictContext,
    ) -> Result<ActionCandidate, BackendError> {
        let timeout = self.policy.call_timeout;
        let context = context.clone().with_timeout(timeout);

        match tokio::time::timeout(timeout, entry.backend.predict(observation, &context)).await {
            Ok(Ok(mut candidate)) => {
                candidate.source_backend_id = entry.backend.id().to_string();
                candidate.source_rank = entry.rank;
                Ok(candidate)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(BackendError::Timeout {
                backend: entry.backend.id().to_string(),
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }

    fn admit(&self, entry: &ChainEntry) -> Admission {
        let mut health = entry.health();
        if health.state != HealthState::CircuitOpen {
            return Admission::Closed;
        }
        if health.probing {
            return Admission::Skip;
        }
        let cooled = health
            .opened_at
            .is_none_or(|opened| opened.elapsed() >= self.policy.cooldown);
        if cooled {
            health.probing = true;
            Admission::Probe
        } else {
            Admission::Skip
        }
    }

    fn record_success(&self, entry: &ChainEntry) {
        let previous = {
            let mut health = entry.health();
            let previous = health.state;
            health.state = HealthState::Healthy;
            health.consecutive_failures = 0;
            health.last_success_at = Some(Utc::now());
            health.opened_at = None;
            health.probing = false;
            previous
        };
        self.announce(entry, previous, HealthState::Healthy);
    }

    fn record_failure(&self, entry: &ChainEntry, probe: bool) {
        let (previous, next) = {
            let mut health = entry.health();
            let previous = health.state;
            health.consecutive_failures = health.consecutive_failures.saturating_add(1);
            health.probing = false;

            if probe || health.consecutive_failures >= self.policy.failure_threshold {
                health.state = HealthState::CircuitOpen;
                health.opened_at = Some(Instant::now());
            } else {
                health.state = HealthState::Degraded;
            }
            (previous, health.state)
        };

        if next == HealthState::CircuitOpen {
            warn!(
                backend = %entry.backend.id(),
                cooldown_ms = self.policy.cooldown.as_millis() as u64,
                "Circuit opened"
            );
        }
        self.announce(entry, previous, next);
    }

    fn announce(&self, entry: &ChainEntry, from: HealthState, to: HealthState) {
        if from == to {
            return;
        }
        if let Some(events) = &self.events {
            events.publish(SessionEvent::BackendHealthChanged {
                backend_id: entry.backend.id().to_string(),
                from,
                to,
                timestamp: Utc::now(),
            });
        }
    }
}
