//! Server-side decision hook for inbound handshake requests.

use expand_core::protocol::payloads::HandshakeMessage;

/// Verdict on one handshake request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeDecision {
    Accept,
    /// Reject with the reason sent back in the ack's `errorMessage`.
    Reject(String),
}

/// Decides whether a peer may open a session.
///
/// Called from the read loop, so implementations must not block.
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
pub trait HandshakePolicy: Send + Sync {
    fn evaluate(&self, request: &HandshakeMessage) -> HandshakeDecision;
}

/// Accepts every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl HandshakePolicy for AcceptAll {
    fn evaluate(&self, _request: &HandshakeMessage) -> HandshakeDecision {
        HandshakeDecision::Accept
    }
}

/// Accepts only clients whose `clientVersion` shares the server's major
/// version.
#[derive(Debug, Clone)]
pub struct MajorVersionPolicy {
    server_version: String,
}

impl MajorVersionPolicy {
    pub fn new(server_version: impl Into<String>) -> Self {
        Self {
            server_version: server_version.into(),
        }
    }
}

fn major(version: &str) -> &str {
    version.split('.').next().unwrap_or(version).trim()
}

impl HandshakePolicy for MajorVersionPolicy {
    fn evaluate(&self, request: &HandshakeMessage) -> HandshakeDecision {
        if major(&request.client_version) == major(&self.server_version) {
            HandshakeDecision::Accept
        } else {
            HandshakeDecision::Reject(format!(
                "client version {} is incompatible with server version {}",
                request.client_version, self.server_version
            ))
        }
    }
}
