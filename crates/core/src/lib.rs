//! # Cadence Core
//!
//! Domain types, traits, and error definitions for the Cadence control loop
//! runtime. This crate has no runtime logic of its own: it defines the model
//! that every other crate implements against.
//!
//! Every external collaborator is a trait here (`Backend`, `OutputSink`).
//! Implementations live in their respective crates or in the embedding
//! application, which keeps them swappable and easy to stub in tests.

pub mod action;
pub mod backend;
pub mod error;
pub mod event;
pub mod observation;
pub mod session;
pub mod sink;

// Re-export key types at crate root for ergonomics
pub use action::{ActionCandidate, ActionPlan, Decision, NoOpReason, Schedule};
pub use backend::{Backend, BackendDescriptor, HealthState, PredictContext};
pub use error::{BackendError, CycleFault, Error, PerceptionError, Result, SessionError};
pub use event::{EventBus, SessionEvent};
pub use observation::Observation;
pub use session::{FailureCounters, LifecycleState, SessionId, SessionState, StopReason};
pub use sink::{Outcome, OutputSink};
