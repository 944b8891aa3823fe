//! # Cadence Engine
//!
//! The control loop itself: perception feed, decision engine, stealth
//! scheduler, action executor and the per-session controller that ties them
//! together. [`Runtime`] runs many sessions concurrently over shared
//! backends, safety monitor and audit log.

pub mod controller;
pub mod decision;
pub mod executor;
pub mod perception;
pub mod runtime;
pub mod scheduler;

pub use controller::{ControllerParts, CycleOutcome, SessionController, SessionExit, SessionSettings};
pub use decision::{DecisionEngine, DecisionPolicy, DecisionReport};
pub use executor::{ActionExecutor, ExecutorPolicy};
pub use perception::{ObservationStream, PerceptionFeed};
pub use runtime::{Runtime, RuntimeBuilder, SessionOutcome};
pub use scheduler::{FatigueModel, StealthScheduler};
