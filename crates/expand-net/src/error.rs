//! Error type for the transport layer.

use std::time::Duration;

use expand_core::fec::FecError;
use expand_core::ProtocolError;
use thiserror::Error;

use crate::config::ConfigError;
use crate::session::SessionState;

/// Errors surfaced by [`Sender`](crate::Sender), [`Receiver`](crate::Receiver)
/// and [`Session`](crate::Session).
#[derive(Debug, Error)]
pub enum TransportError {
    /// A message or payload could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// FEC encoding failed.
    #[error("FEC error: {0}")]
    Fec(#[from] FecError),

    /// The session configuration is invalid.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// An I/O error occurred on the stream.
    #[error("connection I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the stream.
    #[error("connection closed")]
    ConnectionClosed,

    /// The send queue no longer accepts messages (session shutting down).
    #[error("send queue is closed")]
    QueueClosed,

    /// The server answered the handshake with `accepted = false`.
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    /// No HandshakeAck arrived in time.
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// The operation is not allowed in the current session state.
    #[error("cannot {operation} in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    /// An outbound payload does not fit the 32-bit length field.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },
}
