//! Simulated collaborators for `cadence run`.
//!
//! A synthetic observation generator, a backend wrapper that injects
//! outages, and an output sink that logs each plan and fails at a
//! configured rate.

use async_trait::async_trait;
use cadence_core::action::ActionPlan;
use cadence_core::backend::{Backend, PredictContext};
use cadence_core::error::{BackendError, SessionError};
use cadence_core::session::SessionId;
use cadence_core::sink::{Outcome, OutputSink};
use cadence_core::{ActionCandidate, Observation};
use cadence_engine::Runtime;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

fn rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_rng(&mut rand::rng()),
    }
}

fn lock(rng: &Mutex<StdRng>) -> MutexGuard<'_, StdRng> {
    rng.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Wraps a backend and makes it unavailable for a fraction of calls.
pub struct FlakyBackend {
    inner: Arc<dyn Backend>,
    failure_rate: f64,
    rng: Mutex<StdRng>,
}

impl FlakyBackend {
    pub fn new(inner: Arc<dyn Backend>, failure_rate: f64, seed: Option<u64>) -> Self {
        Self {
            inner,
            failure_rate: failure_rate.clamp(0.0, 1.0),
            rng: Mutex::new(rng(seed)),
        }
    }
}

#[async_trait]
impl Backend for FlakyBackend {
    fn id(&self) -> &str {
        self.inner.id()
    }

    async fn predict(
        &self,
        observation: &Observation,
        context: &PredictContext,
    ) -> Result<ActionCandidate, BackendError> {
        let outage = lock(&self.rng).random_bool(self.failure_rate);
        if outage {
            debug!(backend = self.id(), "Simulated backend outage");
            return Err(BackendError::Unavailable(format!(
                "{} (simulated outage)",
                self.id()
            )));
        }
        self.inner.predict(observation, context).await
    }
}

/// Logs every plan it receives and fails at the configured rates.
pub struct LoggingSink {
    failure_rate: f64,
    fatal_rate: f64,
    rng: Mutex<StdRng>,
}

impl LoggingSink {
    pub fn new(failure_rate: f64, fatal_rate: f64, seed: Option<u64>) -> Self {
        Self {
            failure_rate: failure_rate.clamp(0.0, 1.0),
            fatal_rate: fatal_rate.clamp(0.0, 1.0),
            rng: Mutex::new(rng(seed)),
        }
    }
}

#[async_trait]
impl OutputSink for LoggingSink {
    fn name(&self) -> &str {
        "logging"
    }

    async fn execute(&self, plan: &ActionPlan) -> Outcome {
        let (fatal, failed) = {
            let mut rng = lock(&self.rng);
            (rng.random_bool(self.fatal_rate), rng.random_bool(self.failure_rate))
        };
        if fatal {
            return Outcome::FatalFailure("simulated target loss".into());
        }
        if failed {
            return Outcome::RecoverableFailure("simulated dispatch error".into());
        }

        info!(
            session = %plan.session_id,
            plan = %plan.plan_id,
            kind = %plan.candidate.kind,
            confidence = plan.candidate.confidence(),
            backend = %plan.candidate.source_backend_id,
            delay_ms = plan.delay_ms,
            break_applied = plan.break_applied,
            "Action dispatched"
        );
        Outcome::Success
    }
}

/// A synthetic two-feature observation.
pub fn observation(session_id: &SessionId, rng: &mut StdRng) -> Observation {
    let features = vec![rng.random_range(0.0..1.0), rng.random_range(0.0..1.0)];
    Observation::new(session_id.clone(), features)
}

/// Feed every session a fresh observation on each tick, until aborted.
pub fn spawn_feeder(
    runtime: Arc<Runtime>,
    sessions: Vec<SessionId>,
    interval: Duration,
    seed: Option<u64>,
) -> JoinHandle<()> {
    let mut rng = rng(seed);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            for session_id in &sessions {
                let observation = observation(session_id, &mut rng);
                match runtime.submit_observation(session_id, observation) {
                    Ok(()) => {}
                    Err(SessionError::FeedClosed(_)) | Err(SessionError::NotFound(_)) => {
                        debug!(session = %session_id, "Feed gone, skipping");
                    }
                    Err(e) => debug!(session = %session_id, error = %e, "Observation rejected"),
                }
            }
        }
    })
}
