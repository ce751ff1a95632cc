//! # expand-net
//!
//! Async transport for ExpandScreen over any reliable byte stream
//! (`AsyncRead + AsyncWrite`): a USB-forwarded TCP socket in production,
//! `tokio::io::duplex` in tests.
//!
//! # Module overview
//!
//! - [`config`] – TOML-loadable [`SessionConfig`].
//! - [`sender`] – drop-oldest outbound queues and the drain loop.
//! - [`receiver`] – the read loop, gap detection, receive statistics.
//! - [`session`] – handshake/heartbeat state machine tying the two together
//!   with FEC and adaptive bitrate.
//!
//! The wire format and the pure algorithms live in `expand-core`.

pub mod config;
pub mod error;
pub mod receiver;
pub mod sender;
pub mod session;

pub use config::{ConfigError, SessionConfig};
pub use error::TransportError;
pub use receiver::{InboundHandler, Receiver, ReceiverEvent, ReceiverStats};
pub use sender::{Sender, SenderStats};
pub use session::{
    HandshakeDecision, HandshakePolicy, Session, SessionEvent, SessionRole, SessionState,
    SessionStats,
};
