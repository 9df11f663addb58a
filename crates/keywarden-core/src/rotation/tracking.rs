//! In-memory rotation tracking.
//!
//! Process-lifetime record of what the agent has observed about rotations:
//! never serialized, reconstructed fresh on start. `ws_event_received` is the
//! flag shared between the push-event path and the safety rails: a rail that
//! detects a rotation while the flag is still false has caught a rotation the
//! push channel missed.

use chrono::{DateTime, Utc};

/// What the agent has observed about the current rotation cycle.
#[derive(Debug, Clone, Default)]
pub struct RotationTracking {
    /// Last push-channel rotation event.
    pub last_ws_event_at: Option<DateTime<Utc>>,

    /// Last bind attempt, any source.
    pub last_poll_at: Option<DateTime<Utc>>,

    /// When the authority said the next rotation would happen.
    pub expected_rotation_at: Option<DateTime<Utc>>,

    /// End of the current grace window.
    pub grace_expires_at: Option<DateTime<Utc>>,

    /// Whether a push rotation event has been observed this cycle.
    ///
    /// Reset to false exactly once per cycle, immediately after the
    /// successful refresh attributed to that cycle.
    pub ws_event_received: bool,

    /// Rotations detected only by a safety rail, never by the push channel.
    pub missed_rotations: u64,
}

impl RotationTracking {
    /// Records a push rotation event.
    pub fn record_ws_event(&mut self, at: DateTime<Utc>) {
        self.last_ws_event_at = Some(at);
        self.ws_event_received = true;
    }
}
