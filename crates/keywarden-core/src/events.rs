//! Typed agent event bus.
//!
//! Subsystems publish [`AgentEvent`]s here instead of holding nullable
//! callbacks into each other. The daemon subscribes once and maps events to
//! actions (for example `KeyRotated` -> supervisor restart). Publishing never
//! blocks and never fails: a bus with no subscribers simply drops the event.

use tokio::sync::broadcast;

use crate::binder::BindSource;
use crate::degraded::DegradedReason;
use crate::supervisor::ChildStatus;

/// Events published by agent subsystems.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    /// The managed key value changed after a successful bind.
    KeyRotated {
        /// Name of the managed key that rotated.
        key_name: String,
        /// Which detection path triggered the bind.
        source: BindSource,
    },
    /// The stored credential was replaced outside the normal bind path
    /// (reprovision claim or manual import).
    CredentialsUpdated,
    /// The agent entered degraded mode.
    DegradedEntered {
        /// Why the authority rejected the credential.
        reason: DegradedReason,
    },
    /// Degraded mode was cleared by a successful reprovision.
    DegradedCleared,
    /// The supervised child changed state.
    ChildStateChanged {
        /// The new child status.
        status: ChildStatus,
    },
    /// The push channel connected (or reconnected).
    ChannelConnected,
    /// The push channel disconnected.
    ChannelDisconnected,
}

/// Broadcast bus for [`AgentEvent`]s.
///
/// Cheap to clone; all clones share the same channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AgentEvent>,
}

impl EventBus {
    /// Creates a bus with the given buffer capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publishes an event to all current subscribers.
    pub fn publish(&self, event: AgentEvent) {
        if self.tx.send(event.clone()).is_err() {
            tracing::trace!(?event, "event published with no subscribers");
        }
    }

    /// Creates a new subscription starting from the next published event.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}
