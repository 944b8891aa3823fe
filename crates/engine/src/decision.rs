//! Decision engine: turns an observation into at most one accepted candidate.
//!
//! Hard constraints run first (disallowed kinds), then the best remaining
//! candidate is picked by confidence with ties going to the lower priority
//! rank, and finally the acceptance threshold is applied.

use cadence_backends::{ModelManager, Prediction};
use cadence_config::{ConsultMode, DecisionConfig};
use cadence_core::action::{ActionCandidate, Decision, NoOpReason};
use cadence_core::backend::PredictContext;
use cadence_core::session::SessionState;
use cadence_core::Observation;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Acceptance rules for one session.
#[derive(Debug, Clone)]
pub struct DecisionPolicy {
    pub acceptance_threshold: f64,
    pub disallowed_kinds: HashSet<String>,
    pub consult: ConsultMode,
}

impl From<&DecisionConfig> for DecisionPolicy {
    fn from(config: &DecisionConfig) -> Self {
        Self {
            acceptance_threshold: config.acceptance_threshold,
            disallowed_kinds: config.disallowed_kinds.iter().cloned().collect(),
            consult: config.consult,
        }
    }
}

impl DecisionPolicy {
    /// Add session-specific disallowed kinds on top of the global ones.
    pub fn with_disallowed<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.disallowed_kinds.extend(kinds.into_iter().map(Into::into));
        self
    }

    fn allows(&self, kind: &str) -> bool {
        !self.disallowed_kinds.contains(kind)
    }
}

/// Result of one decision, with the backends that were consulted.
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionReport {
    pub decision: Decision,
    /// The winning backend, or every backend tried when none answered.
    /// In all-available mode, every backend called.
    pub attempted: Vec<String>,
}

impl DecisionReport {
    /// Whether every backend was unavailable.
    pub fn exhausted(&self) -> bool {
        matches!(self.decision, Decision::NoOp(NoOpReason::NoBackendAvailable))
    }
}

#[derive(Clone)]
pub struct DecisionEngine {
    manager: Arc<ModelManager>,
    policy: DecisionPolicy,
}

impl DecisionEngine {
    pub fn new(manager: Arc<ModelManager>, policy: DecisionPolicy) -> Self {
        Self { manager, policy }
    }

    pub fn policy(&self) -> &DecisionPolicy {
        &self.policy
    }

    pub async fn decide(&self, observation: &Observation, state: &SessionState) -> DecisionReport {
        let context = PredictContext::from_state(state);

        let (candidates, attempted) = match self.policy.consult {
            ConsultMode::FirstAvailable => match self.manager.predict(observation, &context).await {
                Prediction::Candidate(candidate) => {
                    let attempted = vec![candidate.source_backend_id.clone()];
                    (vec![candidate], attempted)
                }
                Prediction::NoBackendAvailable { attempted } => (Vec::new(), attempted),
            },
            ConsultMode::AllAvailable => {
                let consultation = self.manager.consult_all(observation, &context).await;
                (consultation.candidates, consultation.attempted)
            }
        };

        let decision = self.select(candidates);
        debug!(
            session = %state.session_id,
            cycle = state.cycle,
            decision = %decision_label(&decision),
            "Decision made"
        );
        DecisionReport {
            decision,
            attempted,
        }
    }

    /// Apply constraints, pick the best candidate and check the threshold.
    pub fn select(&self, candidates: Vec<ActionCandidate>) -> Decision {
        if candidates.is_empty() {
            return Decision::NoOp(NoOpReason::NoBackendAvailable);
        }

        let mut rejected_kind = None;
        let mut best: Option<ActionCandidate> = None;
        for candidate in candidates {
            if !self.policy.allows(&candidate.kind) {
                rejected_kind.get_or_insert_with(|| candidate.kind.clone());
                continue;
            }
            let better = match &best {
                None => true,
                Some(current) => rank_order(&candidate, current) == Ordering::Greater,
            };
            if better {
                best = Some(candidate);
            }
        }

        let Some(best) = best else {
            return Decision::NoOp(NoOpReason::DisallowedKind {
                kind: rejected_kind.unwrap_or_default(),
            });
        };

        if best.confidence() < self.policy.acceptance_threshold {
            return Decision::NoOp(NoOpReason::LowConfidence {
                confidence: best.confidence(),
                threshold: self.policy.acceptance_threshold,
            });
        }
        Decision::Act(best)
    }
}

/// Higher confidence wins; equal confidence goes to the lower rank.
fn rank_order(a: &ActionCandidate, b: &ActionCandidate) -> Ordering {
    a.confidence()
        .total_cmp(&b.confidence())
        .then_with(|| b.source_rank.cmp(&a.source_rank))
}

fn decision_label(decision: &Decision) -> &str {
    match decision {
        Decision::Act(candidate) => &candidate.kind,
        Decision::NoOp(reason) => reason.label(),
    }
}
