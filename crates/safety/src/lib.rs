//! # Cadence Safety
//!
//! Audit logging, the safety monitor that owns every emergency stop, and the
//! file-based estop marker used by the CLI.

pub mod audit;
pub mod estop;
pub mod monitor;

pub use audit::{AttemptOutcome, AuditEntry, AuditEvent, AuditLog, AuditSink, AuditStage, JsonLinesSink, TracingSink};
pub use estop::EstopMarker;
pub use monitor::{SafetyMonitor, SafetyPolicy, StopSignal};
