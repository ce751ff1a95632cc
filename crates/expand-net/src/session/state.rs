//! Session lifecycle states and the transitions allowed between them.
//!
//! ```text
//! client:  Idle ──► HandshakeSent ──► Established
//!           ▲             │
//!           └─────────────┘  (timeout / rejection)
//!
//! server:  Idle ──► Established
//!            └────► Rejected ──► Established   (a later request is accepted)
//!
//! any state ──► Closed
//! ```

use std::fmt;

/// Which end of the handshake this session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// Sends the Handshake and waits for the ack.
    Client,
    /// Evaluates Handshake requests and answers them.
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    HandshakeSent,
    Established,
    Rejected,
    Closed,
}

impl SessionState {
    /// Returns `true` if `self → next` is a legal move for `role`.
    pub fn can_transition_to(self, next: SessionState, role: SessionRole) -> bool {
        use SessionState::*;
        match (role, self, next) {
            (_, Closed, _) => false,
            (_, _, Closed) => true,
            (SessionRole::Client, Idle, HandshakeSent) => true,
            (SessionRole::Client, HandshakeSent, Established | Idle) => true,
            (SessionRole::Server, Idle | Rejected, Established | Rejected) => true,
            _ => false,
        }
    }

    pub fn is_closed(self) -> bool {
        self == SessionState::Closed
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
