//! Run statistics and end-of-run reporting for Cadence.
//!
//! Statistics are derived from the audit stream: attach a [`RunStats`] to
//! the audit log and render the result with [`SummaryTable`] when the run
//! ends.

pub mod model;
pub mod stats;
pub mod summary;

pub use model::{SessionReport, SessionStats};
pub use stats::RunStats;
pub use summary::SummaryTable;
