//! # Cadence Backends
//!
//! The model manager (ordered fallback chain with circuit breakers), the
//! backend registry, and the built-in rule table backend.

pub mod manager;
pub mod registry;
pub mod rule_table;

pub use manager::{BreakerPolicy, Consultation, ModelManager, Prediction};
pub use registry::{BackendRegistry, build_from_config};
pub use rule_table::RuleTableBackend;
