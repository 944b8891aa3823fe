//! Observation: an immutable snapshot of the external target's state.
//!
//! Observations are produced by a perception collaborator outside this
//! workspace and consumed read-only by the decision stage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::session::SessionId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// When the snapshot was taken
    pub timestamp: DateTime<Utc>,

    /// Opaque numeric features; backends decide what they mean
    pub features: Vec<f64>,

    /// The session (target) this snapshot belongs to
    pub session_id: SessionId,
}

impl Observation {
    /// Snapshot taken now.
    pub fn new(session_id: SessionId, features: Vec<f64>) -> Self {
        Self {
            timestamp: Utc::now(),
            features,
            session_id,
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Feature by index, if present.
    pub fn feature(&self, index: usize) -> Option<f64> {
        self.features.get(index).copied()
    }

    /// How old this observation is at `now`. Never negative.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.timestamp).to_std().unwrap_or(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feature_lookup() {
        let obs = Observation::new(SessionId::from("s1"), vec![0.2, 0.9]);
        assert_eq!(obs.feature(1), Some(0.9));
        assert_eq!(obs.feature(5), None);
    }

    #[test]
    fn age_of_future_timestamp_is_zero() {
        let now = Utc::now();
        let obs = Observation::new(SessionId::from("s1"), vec![])
            .with_timestamp(now + chrono::Duration::seconds(5));
        assert_eq!(obs.age(now), Duration::ZERO);
    }

    #[test]
    fn age_is_measured_from_timestamp() {
        let now = Utc::now();
        let obs = Observation::new(SessionId::from("s1"), vec![])
            .with_timestamp(now - chrono::Duration::milliseconds(1500));
        assert_eq!(obs.age(now), Duration::from_millis(1500));
    }
}
