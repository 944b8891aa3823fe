//! Perception feed: the injection point for observations.
//!
//! Each session has its own `watch` channel. A newer observation replaces an
//! unread older one, so a session that falls behind always decides on the
//! freshest snapshot instead of working through a backlog.

use cadence_core::Observation;
use cadence_core::error::{PerceptionError, SessionError};
use cadence_core::session::SessionId;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::trace;

#[derive(Default)]
pub struct PerceptionFeed {
    senders: Mutex<HashMap<SessionId, watch::Sender<Option<Observation>>>>,
}

impl PerceptionFeed {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, watch::Sender<Option<Observation>>>> {
        self.senders.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open (or reattach to) a session's consumption point. Anything already
    /// submitted counts as seen.
    pub fn open(&self, session_id: &SessionId) -> ObservationStream {
        let mut senders = self.lock();
        let sender = senders
            .entry(session_id.clone())
            .or_insert_with(|| watch::channel(None).0);
        ObservationStream {
            session_id: session_id.clone(),
            rx: sender.subscribe(),
        }
    }

    /// Inject an observation for one session.
    pub fn submit_observation(
        &self,
        session_id: &SessionId,
        observation: Observation,
    ) -> Result<(), SessionError> {
        if &observation.session_id != session_id {
            return Err(SessionError::SessionMismatch {
                session: session_id.clone(),
                observed: observation.session_id,
            });
        }

        let senders = self.lock();
        let sender = senders
            .get(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.clone()))?;
        if sender.is_closed() {
            return Err(SessionError::FeedClosed(session_id.clone()));
        }
        trace!(session = %session_id, features = observation.features.len(), "Observation submitted");
        sender.send_replace(Some(observation));
        Ok(())
    }

    /// Drop a session's feed; its stream reports `Closed`.
    pub fn close(&self, session_id: &SessionId) -> bool {
        self.lock().remove(session_id).is_some()
    }

    pub fn sessions(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// A session's consumption point.
pub struct ObservationStream {
    session_id: SessionId,
    rx: watch::Receiver<Option<Observation>>,
}

impl ObservationStream {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Wait up to `timeout` for an observation newer than the last one read.
    pub async fn next(&mut self, timeout: Duration) -> Result<Observation, PerceptionError> {
        loop {
            match tokio::time::timeout(timeout, self.rx.changed()).await {
                Err(_) => {
                    return Err(PerceptionError::Timeout {
                        waited_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    });
                }
                Ok(Err(_)) => return Err(PerceptionError::Closed),
                Ok(Ok(())) => {
                    if let Some(observation) = self.rx.borrow_and_update().clone() {
                        return Ok(observation);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(s: &str) -> SessionId {
        SessionId::from(s)
    }

    fn obs(session: &str, x: f64) -> Observation {
        Observation::new(sid(session), vec![x])
    }

    #[tokio::test]
    async fn submitted_observation_is_delivered() {
        let feed = PerceptionFeed::new();
        let mut stream = feed.open(&sid("a"));
        feed.submit_observation(&sid("a"), obs("a", 0.5)).unwrap();

        let got = stream.next(Duration::from_millis(100)).await.unwrap();
        assert_eq!(got.features, vec![0.5]);
    }

    #[tokio::test]
    async fn newest_observation_wins() {
        let feed = PerceptionFeed::new();
        let mut stream = feed.open(&sid("a"));
        feed.submit_observation(&sid("a"), obs("a", 0.1)).unwrap();
        feed.submit_observation(&sid("a"), obs("a", 0.2)).unwrap();

        let got = stream.next(Duration::from_millis(100)).await.unwrap();
        assert_eq!(got.features, vec![0.2]);
    }

    #[tokio::test(start_paused = true)]
    async fn nothing_submitted_times_out() {
        let feed = PerceptionFeed::new();
        let mut stream = feed.open(&sid("a"));
        feed.submit_observation(&sid("a"), obs("a", 0.1)).unwrap();
        stream.next(Duration::from_millis(100)).await.unwrap();

        // Already read: the same observation is never delivered twice.
        let err = stream.next(Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, PerceptionError::Timeout { waited_ms: 100 }));
    }

    #[tokio::test]
    async fn observations_are_routed_per_session() {
        let feed = PerceptionFeed::new();
        let mut a = feed.open(&sid("a"));
        let _b = feed.open(&sid("b"));

        let err = feed.submit_observation(&sid("a"), obs("b", 0.3)).unwrap_err();
        assert!(matches!(err, SessionError::SessionMismatch { .. }));

        let err = feed.submit_observation(&sid("c"), obs("c", 0.3)).unwrap_err();
        assert!(matches!(err, SessionError::NotFound(_)));

        feed.submit_observation(&sid("b"), obs("b", 0.3)).unwrap();
        assert!(a.next(Duration::from_millis(20)).await.is_err());
        assert_eq!(feed.sessions(), vec![sid("a"), sid("b")]);
    }

    #[tokio::test]
    async fn closing_the_feed_ends_the_stream() {
        let feed = PerceptionFeed::new();
        let mut stream = feed.open(&sid("a"));
        assert!(feed.close(&sid("a")));

        let err = stream.next(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, PerceptionError::Closed));
    }

    #[tokio::test]
    async fn submitting_without_a_reader_reports_closed_feed() {
        let feed = PerceptionFeed::new();
        drop(feed.open(&sid("a")));
        let err = feed.submit_observation(&sid("a"), obs("a", 0.1)).unwrap_err();
        assert!(matches!(err, SessionError::FeedClosed(_)));
    }
}
