//! Output sink trait: where accepted plans are dispatched.
//!
//! A sink may be simulated, logged, or drive a real target. It reports one
//! of three outcomes; it never panics the control loop.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::action::ActionPlan;

/// Result of dispatching one plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum Outcome {
    Success,
    /// Worth retrying the same plan.
    RecoverableFailure(String),
    /// The session must stop.
    FatalFailure(String),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::RecoverableFailure(_) => "recoverable_failure",
            Outcome::FatalFailure(_) => "fatal_failure",
        }
    }
}

#[async_trait]
pub trait OutputSink: Send + Sync {
    /// A human-readable name for this sink.
    fn name(&self) -> &str;

    /// Dispatch the plan to the target.
    async fn execute(&self, plan: &ActionPlan) -> Outcome;
}
