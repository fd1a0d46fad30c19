//! Per-role connection tracking.
//!
//! The tracker only remembers whether the last observation was a connected
//! one; the endpoint is always asked for its live status. What the relay
//! must do about an observation is returned as a [`Transition`].

use mediarelay_transport::{ConnectionStatus, Role};
use tracing::trace;

/// Action the relay takes after observing a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The endpoint listens and a peer is waiting
    Accept,
    /// The connection is gone
    Lost {
        /// Whether it had been seen connected
        was_connected: bool,
    },
    /// First connected observation
    Connected,
    /// Nothing to do
    Idle,
}

/// Connection tracker for one side of the relay.
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    role: Role,
    connected: bool,
}

impl ConnectionTracker {
    /// Tracker for `role`, initially disconnected.
    #[must_use]
    pub fn new(role: Role) -> Self {
        Self {
            role,
            connected: false,
        }
    }

    /// Whether the last observation was connected
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Feed a freshly queried status.
    pub fn observe(&mut self, status: ConnectionStatus) -> Transition {
        let transition = match status {
            ConnectionStatus::Listening => Transition::Accept,
            status if status.is_lost() => {
                let was_connected = self.connected;
                self.connected = false;
                Transition::Lost { was_connected }
            }
            ConnectionStatus::Connected if !self.connected => {
                self.connected = true;
                Transition::Connected
            }
            _ => Transition::Idle,
        };
        trace!("{}: {:?} -> {:?}", self.role, status, transition);
        transition
    }

    /// Record a connection established outside `observe` (accept).
    pub fn mark_connected(&mut self) {
        self.connected = true;
    }

    /// Forget the connection, for an endpoint that was dropped.
    pub fn reset(&mut self) {
        self.connected = false;
    }
}
