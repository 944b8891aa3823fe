//! Session event system: decoupled notification of lifecycle changes.
//!
//! Controllers and the model manager publish events; supervisors and the
//! CLI subscribe to react without tight coupling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::backend::HealthState;
use crate::session::{LifecycleState, SessionId, StopReason};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SessionEvent {
    /// A session moved between lifecycle states
    StateChanged {
        session_id: SessionId,
        from: LifecycleState,
        to: LifecycleState,
        timestamp: DateTime<Utc>,
    },

    /// Every backend is exhausted; the session keeps cycling without acting
    Degraded {
        session_id: SessionId,
        timestamp: DateTime<Utc>,
    },

    /// A backend answered again after a degraded stretch
    Recovered {
        session_id: SessionId,
        timestamp: DateTime<Utc>,
    },

    /// The session entered EMERGENCY_STOPPED
    Stopped {
        session_id: SessionId,
        reason: StopReason,
        timestamp: DateTime<Utc>,
    },

    /// The circuit breaker moved a backend between health states
    BackendHealthChanged {
        backend_id: String,
        from: HealthState,
        to: HealthState,
        timestamp: DateTime<Utc>,
    },
}

/// A broadcast-based event bus for session events.
pub struct EventBus {
    sender: broadcast::Sender<Arc<SessionEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<SessionEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
