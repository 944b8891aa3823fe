//! Rule table backend: a deterministic, offline decision source.
//!
//! Rules are evaluated top to bottom against the observation's feature
//! vector; the first match proposes its action. When nothing matches the
//! table proposes its fallback kind with zero confidence, which the decision
//! engine will reject as low confidence.

use async_trait::async_trait;
use cadence_config::{RuleConfig, RuleTableConfig};
use cadence_core::backend::{Backend, PredictContext};
use cadence_core::error::BackendError;
use cadence_core::{ActionCandidate, Observation};
use tracing::trace;

pub struct RuleTableBackend {
    id: String,
    rules: Vec<RuleConfig>,
    fallback_kind: String,
}

impl RuleTableBackend {
    pub fn new(id: impl Into<String>, rules: Vec<RuleConfig>, fallback_kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            rules,
            fallback_kind: fallback_kind.into(),
        }
    }

    pub fn from_config(config: &RuleTableConfig) -> Self {
        Self::new(&config.id, config.rules.clone(), &config.fallback_kind)
    }

    fn matching_rule(&self, features: &[f64]) -> Option<(usize, &RuleConfig)> {
        self.rules.iter().enumerate().find(|(_, rule)| {
            features
                .get(rule.feature)
                .is_some_and(|value| rule.op.evaluate(*value, rule.threshold))
        })
    }
}

#[async_trait]
impl Backend for RuleTableBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn predict(
        &self,
        observation: &Observation,
        _context: &PredictContext,
    ) -> Result<ActionCandidate, BackendError> {
        if observation.features.is_empty() {
            return Err(BackendError::Failed {
                backend: self.id.clone(),
                reason: "observation has no features".into(),
            });
        }

        let Some((index, rule)) = self.matching_rule(&observation.features) else {
            trace!(backend = %self.id, "No rule matched");
            return Ok(ActionCandidate::new(&self.fallback_kind, 0.0, &self.id));
        };

        trace!(backend = %self.id, rule = index, kind = %rule.kind, "Rule matched");
        let mut candidate = ActionCandidate::new(&rule.kind, rule.confidence, &self.id);
        for (key, value) in &rule.parameters {
            candidate = candidate.with_parameter(key, value.clone());
        }
        Ok(candidate)
    }
}
