//! A session over one connected byte stream.
//!
//! # How a session works (for beginners)
//!
//! [`Session::attach`] splits the stream into its read and write halves and
//! starts three background tasks:
//!
//! 1. the **drain loop** ([`Sender::run_drain`]) which owns the write half,
//! 2. the **read loop** ([`Receiver::run`]) which owns the read half and
//!    calls back into the session for every inbound message,
//! 3. the **heartbeat loop** which ticks once the session is established.
//!
//! Everything the application needs to know arrives on a single
//! [`SessionEvent`] channel, in the order it happened.
//!
//! Session-control messages (Handshake, HandshakeAck, Heartbeat,
//! HeartbeatAck) are consumed here and never forwarded.  Every other
//! message is forwarded unmodified as [`SessionEvent::Message`]; some are
//! also acted on:
//!
//! | Inbound            | Extra action                                       |
//! |--------------------|----------------------------------------------------|
//! | ProtocolFeedback   | bitrate controller step, BitrateControl on change  |
//! | FecConfig          | (re)configures the receive-side FEC assembler      |
//! | FecGroupMetadata   | fed to the assembler                               |
//! | FecShard           | fed to the assembler                               |
//! | VideoFrame / Audio | fed to the assembler                               |
//!
//! A FEC group that cannot be rebuilt triggers a KeyFrameRequest so the
//! encoder can resynchronise the stream.

mod heartbeat;
pub mod policy;
pub mod state;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use expand_core::domain::bitrate::{BitrateController, BitrateDecision, BitrateFeedback};
use expand_core::domain::rtt::RttEstimator;
use expand_core::fec::{AssemblyOutcome, FecError, FecGroupCodec, GroupAssembler, RecoveredFrame};
use expand_core::protocol::payloads::{
    BitrateControlMessage, FecConfigMessage, FecGroupMetadata, FecShardMessage,
    HandshakeAckMessage, HandshakeMessage, HeartbeatAckMessage, HeartbeatMessage,
    KeyFrameRequestMessage, ProtocolFeedbackMessage,
};
use expand_core::protocol::{clock, Message, MessageType, SequenceGap, WirePayload};
use expand_core::ProtocolError;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::{ConfigError, FecConfig, SessionConfig};
use crate::error::TransportError;
use crate::receiver::{InboundHandler, Receiver, ReceiverEvent, ReceiverStats};
use crate::sender::{Sender, SenderStats};

pub use policy::{AcceptAll, HandshakeDecision, HandshakePolicy, MajorVersionPolicy};
#[cfg(any(test, feature = "mock"))]
pub use policy::MockHandshakePolicy;
pub use state::{SessionRole, SessionState};

/// Capacity of the event channel handed to the application.
const EVENT_CHANNEL_CAPACITY: usize = 256;

// ── Events and statistics ─────────────────────────────────────────────────────

/// Everything a session reports to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A non-control message from the peer, unmodified.
    Message(Message),
    /// A peer asked to open a session and no policy is installed; answer
    /// with [`Session::respond_to_handshake`].
    HandshakeRequested(HandshakeMessage),
    Established { session_id: String },
    SequenceGap(SequenceGap),
    /// Frames rebuilt from FEC parity.  Never includes a frame that arrived.
    FramesRecovered(Vec<RecoveredFrame>),
    RecoveryFailed { group_id: u32, error: FecError },
    BitrateChanged(BitrateDecision),
    /// No heartbeat traffic within the configured timeout.  The heartbeat
    /// loop has stopped.
    HeartbeatTimeout,
    /// The inbound stream was undecodable; the read loop has stopped.
    ReceiveFailed(ProtocolError),
    /// The stream is gone.  Always the last event of a session.
    ConnectionClosed,
}

/// Snapshot returned by [`Session::stats`].
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStats {
    pub state: SessionState,
    pub session_id: Option<String>,
    pub rtt: RttEstimator,
    pub sender: SenderStats,
    pub receiver: ReceiverStats,
    /// `None` when the bitrate controller is disabled.
    pub current_bitrate_bps: Option<u64>,
    pub pending_fec_groups: usize,
}

// ── Shared session state ──────────────────────────────────────────────────────

#[derive(Debug)]
struct FecState {
    /// Outbound encoder; `None` while FEC is disabled locally.
    codec: Option<FecGroupCodec>,
    /// Inbound bookkeeping; created on demand.
    assembler: Option<GroupAssembler>,
    next_group_id: u32,
}

impl FecState {
    fn from_config(config: &FecConfig) -> Result<Self, FecError> {
        let (codec, assembler) = if config.enabled {
            let codec =
                FecGroupCodec::new(config.data_shards as usize, config.parity_shards as usize)?;
            let assembler = GroupAssembler::new(codec.clone(), config.max_pending_groups);
            (Some(codec), Some(assembler))
        } else {
            (None, None)
        };
        Ok(Self {
            codec,
            assembler,
            next_group_id: 0,
        })
    }

    /// Returns the assembler, creating one for `(k, m)` if none exists yet.
    fn assembler(
        &mut self,
        data_shards: u8,
        parity_shards: u8,
        max_pending_groups: usize,
    ) -> Option<&mut GroupAssembler> {
        if self.assembler.is_none() {
            match FecGroupCodec::new(data_shards as usize, parity_shards as usize) {
                Ok(codec) => {
                    debug!("creating FEC assembler for k={data_shards} m={parity_shards}");
                    self.assembler = Some(GroupAssembler::new(codec, max_pending_groups));
                }
                Err(e) => {
                    warn!("peer announced unusable FEC parameters: {e}");
                    return None;
                }
            }
        }
        self.assembler.as_mut()
    }
}

struct SessionInner {
    role: SessionRole,
    config: SessionConfig,
    policy: Option<Arc<dyn HandshakePolicy>>,
    sender: Sender,
    receiver: Receiver,
    cancel: CancellationToken,
    events: mpsc::Sender<SessionEvent>,
    state: Mutex<SessionState>,
    session_id: Mutex<Option<String>>,
    rtt: Mutex<RttEstimator>,
    bitrate: Mutex<Option<BitrateController>>,
    fec: Mutex<FecState>,
    pending_ack: Mutex<Option<oneshot::Sender<HandshakeAckMessage>>>,
    /// Monotonic ms of the last heartbeat-related traffic.
    last_activity_ms: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SessionInner {
    fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    fn session_id(&self) -> Option<String> {
        lock(&self.session_id).clone()
    }

    fn rtt(&self) -> RttEstimator {
        *lock(&self.rtt)
    }

    fn last_activity_ms(&self) -> u64 {
        self.last_activity_ms.load(Ordering::Relaxed)
    }

    fn touch(&self) {
        self.last_activity_ms
            .store(clock::monotonic_ms(), Ordering::Relaxed);
    }

    /// Moves to `next` if the state machine allows it.
    fn transition(
        &self,
        next: SessionState,
        operation: &'static str,
    ) -> Result<SessionState, TransportError> {
        let mut state = lock(&self.state);
        let current = *state;
        if !current.can_transition_to(next, self.role) {
            return Err(TransportError::InvalidState {
                operation,
                state: current,
            });
        }
        *state = next;
        debug!("session state {current} -> {next}");
        Ok(current)
    }

    async fn emit(&self, event: SessionEvent) {
        tokio::select! {
            biased;
            sent = self.events.send(event) => {
                if sent.is_err() {
                    trace!("session event dropped: no listener");
                }
            }
            _ = self.cancel.cancelled() => {}
        }
    }

    fn send_or_log<T: WirePayload>(&self, payload: &T) {
        if let Err(e) = self.sender.send_payload(payload) {
            debug!("could not queue {}: {e}", T::MESSAGE_TYPE);
        }
    }

    /// Marks the session closed and tells everyone once.
    async fn connection_lost(&self, reason: &str) {
        let previous = std::mem::replace(&mut *lock(&self.state), SessionState::Closed);
        if previous.is_closed() {
            return;
        }
        info!("session closed: {reason}");
        lock(&self.pending_ack).take();
        self.sender.close();
        self.emit(SessionEvent::ConnectionClosed).await;
        self.cancel.cancel();
    }

    // ── Handshake ─────────────────────────────────────────────────────────────

    async fn respond(
        &self,
        request: &HandshakeMessage,
        accept: bool,
        error: Option<String>,
    ) -> Result<Option<String>, TransportError> {
        let server_version = self.config.handshake.server_version.clone();

        if !accept {
            self.transition(SessionState::Rejected, "reject handshake")?;
            let reason = error.unwrap_or_else(|| "handshake rejected".to_string());
            info!(
                "rejected handshake from {} ({}): {reason}",
                request.device_name, request.device_id
            );
            self.sender.send_payload(&HandshakeAckMessage {
                session_id: String::new(),
                server_version,
                accepted: false,
                error_message: Some(reason),
            })?;
            return Ok(None);
        }

        self.transition(SessionState::Established, "accept handshake")?;
        let session_id = Uuid::new_v4().to_string();
        *lock(&self.session_id) = Some(session_id.clone());
        self.touch();
        self.sender.send_payload(&HandshakeAckMessage {
            session_id: session_id.clone(),
            server_version,
            accepted: true,
            error_message: None,
        })?;
        info!(
            "accepted handshake from {} ({}), session {session_id}",
            request.device_name, request.device_id
        );
        self.emit(SessionEvent::Established {
            session_id: session_id.clone(),
        })
        .await;
        Ok(Some(session_id))
    }

    async fn on_handshake(&self, request: HandshakeMessage) {
        if self.role != SessionRole::Server {
            debug!("ignoring Handshake received by a client session");
            return;
        }

        if self.state() == SessionState::Established {
            warn!("rejecting repeated handshake from {}", request.device_id);
            self.send_or_log(&HandshakeAckMessage {
                session_id: self.session_id().unwrap_or_default(),
                server_version: self.config.handshake.server_version.clone(),
                accepted: false,
                error_message: Some("session already established".to_string()),
            });
            return;
        }

        let Some(policy) = self.policy.as_ref() else {
            self.emit(SessionEvent::HandshakeRequested(request)).await;
            return;
        };
        let (accept, error) = match policy.evaluate(&request) {
            HandshakeDecision::Accept => (true, None),
            HandshakeDecision::Reject(reason) => (false, Some(reason)),
        };
        if let Err(e) = self.respond(&request, accept, error).await {
            warn!("failed to answer handshake from {}: {e}", request.device_id);
        }
    }

    fn on_handshake_ack(&self, ack: HandshakeAckMessage) {
        match lock(&self.pending_ack).take() {
            Some(waiter) => {
                if waiter.send(ack).is_err() {
                    debug!("handshake ack arrived after the caller gave up");
                }
            }
            None => debug!("unsolicited HandshakeAck for session {}", ack.session_id),
        }
    }

    // ── Heartbeat ─────────────────────────────────────────────────────────────

    fn on_heartbeat(&self, heartbeat: HeartbeatMessage) {
        self.touch();
        self.send_or_log(&HeartbeatAckMessage {
            original_timestamp: heartbeat.timestamp,
            response_timestamp: clock::monotonic_ms(),
        });
    }

    fn on_heartbeat_ack(&self, ack: HeartbeatAckMessage) {
        self.touch();
        let sample = lock(&self.rtt).record_echo(ack.original_timestamp, clock::monotonic_ms());
        trace!("rtt sample {sample} ms");
    }

    // ── Everything else ───────────────────────────────────────────────────────

    async fn on_message(&self, message: Message) {
        let message_type = message.message_type();
        match message_type {
            MessageType::Handshake => {
                if let Some(request) = decode_or_log::<HandshakeMessage>(&message) {
                    self.on_handshake(request).await;
                }
            }
            MessageType::HandshakeAck => {
                if let Some(ack) = decode_or_log::<HandshakeAckMessage>(&message) {
                    self.on_handshake_ack(ack);
                }
            }
            MessageType::Heartbeat => {
                if let Some(heartbeat) = decode_or_log::<HeartbeatMessage>(&message) {
                    self.on_heartbeat(heartbeat);
                }
            }
            MessageType::HeartbeatAck => {
                if let Some(ack) = decode_or_log::<HeartbeatAckMessage>(&message) {
                    self.on_heartbeat_ack(ack);
                }
            }
            _ => self.on_application_message(message).await,
        }
    }

    async fn on_application_message(&self, message: Message) {
        let message_type = message.message_type();
        let outcomes = self.feed_fec(&message);
        let decision = if message_type == MessageType::ProtocolFeedback {
            decode_or_log::<ProtocolFeedbackMessage>(&message)
                .and_then(|feedback| self.run_bitrate_controller(&feedback))
        } else {
            None
        };

        self.emit(SessionEvent::Message(message)).await;

        for outcome in outcomes {
            self.on_assembly_outcome(outcome).await;
        }
        if let Some(decision) = decision {
            info!(
                "bitrate {} -> {} bps ({})",
                decision.previous_bitrate_bps, decision.target_bitrate_bps, decision.reason
            );
            self.send_or_log(&BitrateControlMessage {
                timestamp: clock::monotonic_ms(),
                target_bitrate_bps: decision.target_bitrate_bps,
                reason: decision.reason.clone(),
            });
            self.emit(SessionEvent::BitrateChanged(decision)).await;
        }
    }

    fn feed_fec(&self, message: &Message) -> Vec<AssemblyOutcome> {
        let message_type = message.message_type();
        let max_pending_groups = self.config.fec.max_pending_groups;
        let mut fec = lock(&self.fec);

        match message_type {
            t if t.is_frame() => match fec.assembler.as_mut() {
                Some(assembler) => {
                    assembler.on_frame(t, message.sequence_number(), &message.payload)
                }
                None => Vec::new(),
            },
            MessageType::FecGroupMetadata => {
                let Some(metadata) = decode_or_log::<FecGroupMetadata>(message) else {
                    return Vec::new();
                };
                fec.assembler(metadata.data_shards, metadata.parity_shards, max_pending_groups)
                    .map(|a| vec![a.on_metadata(metadata)])
                    .unwrap_or_default()
            }
            MessageType::FecShard => {
                let Some(shard) = decode_or_log::<FecShardMessage>(message) else {
                    return Vec::new();
                };
                fec.assembler(shard.data_shards, shard.parity_shards, max_pending_groups)
                    .map(|a| vec![a.on_parity(shard)])
                    .unwrap_or_default()
            }
            MessageType::FecConfig => {
                if let Some(announced) = decode_or_log::<FecConfigMessage>(message) {
                    if announced.enabled {
                        fec.assembler = None;
                        let (k, m) = (announced.data_shards, announced.parity_shards);
                        if fec.assembler(k, m, max_pending_groups).is_some() {
                            info!("peer enabled FEC with k={k} m={m}");
                        }
                    } else {
                        fec.assembler = None;
                        info!("peer disabled FEC");
                    }
                }
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    async fn on_assembly_outcome(&self, outcome: AssemblyOutcome) {
        match outcome {
            AssemblyOutcome::Pending => {}
            AssemblyOutcome::Complete { group_id } => trace!("FEC group {group_id} complete"),
            AssemblyOutcome::Recovered(frames) => {
                info!("recovered {} frame(s) from FEC parity", frames.len());
                self.emit(SessionEvent::FramesRecovered(frames)).await;
            }
            AssemblyOutcome::Failed { group_id, error } => {
                warn!("FEC group {group_id} unrecoverable: {error}");
                if self.config.request_key_frame_on_loss {
                    self.send_or_log(&KeyFrameRequestMessage {
                        timestamp: clock::monotonic_ms(),
                        reason: format!("FEC group {group_id} unrecoverable"),
                    });
                }
                self.emit(SessionEvent::RecoveryFailed { group_id, error })
                    .await;
            }
        }
    }

    fn run_bitrate_controller(
        &self,
        feedback: &ProtocolFeedbackMessage,
    ) -> Option<BitrateDecision> {
        let mut bitrate = lock(&self.bitrate);
        let controller = bitrate.as_mut()?;
        let decision = controller.on_feedback(&BitrateFeedback::from(feedback));
        decision.changed.then_some(decision)
    }
}

fn decode_or_log<T: WirePayload>(message: &Message) -> Option<T> {
    match message.decode_payload::<T>() {
        Ok(payload) => Some(payload),
        Err(e) => {
            warn!(
                "ignoring malformed {} seq={}: {e}",
                message.message_type(),
                message.sequence_number()
            );
            None
        }
    }
}

#[async_trait]
impl InboundHandler for SessionInner {
    async fn on_event(&self, event: ReceiverEvent) {
        match event {
            ReceiverEvent::Message(message) => self.on_message(message).await,
            ReceiverEvent::Gap(gap) => self.emit(SessionEvent::SequenceGap(gap)).await,
            ReceiverEvent::Failed(error) => {
                self.emit(SessionEvent::ReceiveFailed(error)).await;
                self.connection_lost("undecodable inbound stream").await;
            }
            ReceiverEvent::Closed => self.connection_lost("peer closed the stream").await,
        }
    }
}

// ── Session ───────────────────────────────────────────────────────────────────

/// One side of an ExpandScreen connection.
///
/// Dropping a session cancels its background tasks; prefer
/// [`shutdown`](Self::shutdown), which also waits for them.
pub struct Session {
    inner: Arc<SessionInner>,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl Session {
    /// Starts a session over `stream`.  Must be called inside a tokio
    /// runtime.
    ///
    /// `policy` only matters for [`SessionRole::Server`]; without one, inbound
    /// requests are surfaced as [`SessionEvent::HandshakeRequested`].
    ///
    /// # Errors
    ///
    /// [`TransportError::Config`] or [`TransportError::Fec`] if `config` is
    /// invalid.
    pub fn attach<S>(
        stream: S,
        role: SessionRole,
        config: SessionConfig,
        policy: Option<Arc<dyn HandshakePolicy>>,
    ) -> Result<(Self, mpsc::Receiver<SessionEvent>), TransportError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::attach_split(reader, writer, role, config, policy)
    }

    /// Like [`attach`](Self::attach) for a stream that is already split.
    pub fn attach_split<R, W>(
        reader: R,
        writer: W,
        role: SessionRole,
        config: SessionConfig,
        policy: Option<Arc<dyn HandshakePolicy>>,
    ) -> Result<(Self, mpsc::Receiver<SessionEvent>), TransportError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        config.validate()?;
        let bitrate = if config.bitrate.enabled {
            let controller = BitrateController::new(config.bitrate.controller.clone())
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
            Some(controller)
        } else {
            None
        };
        let fec = FecState::from_config(&config.fec)?;

        let (events, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let inner = Arc::new(SessionInner {
            role,
            sender: Sender::new(config.sender.clone()),
            receiver: Receiver::new(config.receiver.clone()),
            config,
            policy,
            cancel: CancellationToken::new(),
            events,
            state: Mutex::new(SessionState::Idle),
            session_id: Mutex::new(None),
            rtt: Mutex::new(RttEstimator::new()),
            bitrate: Mutex::new(bitrate),
            fec: Mutex::new(fec),
            pending_ack: Mutex::new(None),
            last_activity_ms: AtomicU64::new(clock::monotonic_ms()),
        });

        let drain = {
            let inner = Arc::clone(&inner);
            tokio::spawn(async move {
                if let Err(e) = inner.sender.run_drain(writer, inner.cancel.clone()).await {
                    inner.connection_lost(&format!("write failed: {e}")).await;
                }
            })
        };
        let read = {
            let inner = Arc::clone(&inner);
            tokio::spawn(async move {
                if let Err(e) = inner.receiver.run(reader, &*inner, inner.cancel.clone()).await {
                    debug!("read loop stopped: {e}");
                }
            })
        };
        let heartbeat = tokio::spawn(heartbeat::run(Arc::clone(&inner)));

        info!("session attached as {role:?}");
        let session = Self {
            inner,
            tasks: Mutex::new(vec![("drain", drain), ("read", read), ("heartbeat", heartbeat)]),
        };
        Ok((session, events_rx))
    }

    /// Client side: sends `request` and waits up to `timeout` for the ack.
    ///
    /// On timeout or rejection the session returns to `Idle` and the
    /// handshake may be retried.
    ///
    /// # Errors
    ///
    /// - [`TransportError::HandshakeRejected`] with the server's reason.
    /// - [`TransportError::HandshakeTimeout`] if no ack arrived in time.
    /// - [`TransportError::InvalidState`] unless this is an idle client.
    /// - [`TransportError::ConnectionClosed`] if the stream closed meanwhile.
    pub async fn perform_handshake(
        &self,
        request: HandshakeMessage,
        timeout: Duration,
    ) -> Result<HandshakeAckMessage, TransportError> {
        let inner = &self.inner;
        if inner.role != SessionRole::Client {
            return Err(TransportError::InvalidState {
                operation: "perform handshake",
                state: inner.state(),
            });
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        inner.transition(SessionState::HandshakeSent, "perform handshake")?;
        *lock(&inner.pending_ack) = Some(ack_tx);
        if let Err(e) = inner.sender.send_payload(&request) {
            lock(&inner.pending_ack).take();
            let _ = inner.transition(SessionState::Idle, "abandon handshake");
            return Err(e);
        }
        info!("handshake sent for device {}", request.device_id);

        match time::timeout(timeout, ack_rx).await {
            Ok(Ok(ack)) if ack.accepted => {
                inner.transition(SessionState::Established, "complete handshake")?;
                *lock(&inner.session_id) = Some(ack.session_id.clone());
                inner.touch();
                info!(
                    "session {} established with server {}",
                    ack.session_id, ack.server_version
                );
                inner
                    .emit(SessionEvent::Established {
                        session_id: ack.session_id.clone(),
                    })
                    .await;
                Ok(ack)
            }
            Ok(Ok(ack)) => {
                let reason = ack
                    .error_message
                    .unwrap_or_else(|| "no reason given".to_string());
                warn!("handshake rejected: {reason}");
                let _ = inner.transition(SessionState::Idle, "abandon handshake");
                Err(TransportError::HandshakeRejected(reason))
            }
            Ok(Err(_)) => Err(TransportError::ConnectionClosed),
            Err(_) => {
                lock(&inner.pending_ack).take();
                warn!("no handshake ack within {timeout:?}");
                let _ = inner.transition(SessionState::Idle, "abandon handshake");
                Err(TransportError::HandshakeTimeout(timeout))
            }
        }
    }

    /// [`perform_handshake`](Self::perform_handshake) with the configured
    /// timeout.
    pub async fn handshake(
        &self,
        request: HandshakeMessage,
    ) -> Result<HandshakeAckMessage, TransportError> {
        let timeout = self.inner.config.handshake.timeout();
        self.perform_handshake(request, timeout).await
    }

    /// Server side: answers a request surfaced as
    /// [`SessionEvent::HandshakeRequested`].
    ///
    /// Returns the fresh session id on acceptance.
    ///
    /// # Errors
    ///
    /// [`TransportError::InvalidState`] unless this is a server session that
    /// has not yet been established.
    pub async fn respond_to_handshake(
        &self,
        request: &HandshakeMessage,
        accept: bool,
        error: Option<String>,
    ) -> Result<Option<String>, TransportError> {
        if self.inner.role != SessionRole::Server {
            return Err(TransportError::InvalidState {
                operation: "respond to handshake",
                state: self.inner.state(),
            });
        }
        self.inner.respond(request, accept, error).await
    }

    /// Queues a message.  Never waits for the network.
    ///
    /// # Errors
    ///
    /// [`TransportError::QueueClosed`] after shutdown or connection loss, and
    /// [`TransportError::PayloadTooLarge`] for payloads over 4 GiB.
    pub fn send(&self, message_type: MessageType, payload: Vec<u8>) -> Result<u32, TransportError> {
        self.inner.sender.send(message_type, payload)
    }

    /// Serializes and queues a typed payload.
    pub fn send_payload<T: WirePayload>(&self, payload: &T) -> Result<u32, TransportError> {
        self.inner.sender.send_payload(payload)
    }

    /// Sends `k` frames under consecutive sequence numbers, followed by the
    /// group metadata and `m` parity shards.
    ///
    /// # Errors
    ///
    /// [`TransportError::Fec`] if FEC is disabled, `message_type` is not a
    /// frame type, or the number of frames is not `k`.
    pub fn send_protected_frames(
        &self,
        message_type: MessageType,
        frames: Vec<Vec<u8>>,
    ) -> Result<FecGroupMetadata, TransportError> {
        if !message_type.is_frame() {
            return Err(FecError::InvalidParameters(format!(
                "{message_type} cannot be FEC-protected"
            ))
            .into());
        }

        let (codec, group_id) = {
            let mut fec = lock(&self.inner.fec);
            let Some(codec) = fec.codec.clone() else {
                return Err(FecError::InvalidParameters("FEC is disabled".to_string()).into());
            };
            let group_id = fec.next_group_id;
            fec.next_group_id = group_id.wrapping_add(1);
            (codec, group_id)
        };

        // The first sequence number is only known once the frames are queued.
        let (mut metadata, parity) = codec.encode_parity(&frames, message_type, 0, group_id)?;
        metadata.first_sequence = self.inner.sender.send_batch(message_type, frames)?;

        self.inner.sender.send_payload(&metadata)?;
        for shard in &parity {
            self.inner.sender.send_payload(shard)?;
        }
        debug!(
            "FEC group {group_id}: {} frames from seq {} plus {} parity shards",
            metadata.data_shards,
            metadata.first_sequence,
            parity.len()
        );
        Ok(metadata)
    }

    /// Tells the peer which `(k, m)` this side will use.
    pub fn announce_fec_config(&self) -> Result<u32, TransportError> {
        let fec = &self.inner.config.fec;
        let enabled = lock(&self.inner.fec).codec.is_some();
        self.send_payload(&FecConfigMessage {
            enabled,
            data_shards: fec.data_shards,
            parity_shards: fec.parity_shards,
        })
    }

    pub fn role(&self) -> SessionRole {
        self.inner.role
    }

    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Established
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.session_id()
    }

    pub fn rtt(&self) -> RttEstimator {
        self.inner.rtt()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            state: self.state(),
            session_id: self.session_id(),
            rtt: self.rtt(),
            sender: self.inner.sender.stats(),
            receiver: self.inner.receiver.stats(),
            current_bitrate_bps: lock(&self.inner.bitrate)
                .as_ref()
                .map(BitrateController::current_bitrate_bps),
            pending_fec_groups: lock(&self.inner.fec)
                .assembler
                .as_ref()
                .map_or(0, GroupAssembler::pending_groups),
        }
    }

    /// Stops all background tasks and waits for each up to the configured
    /// shutdown timeout.  Tasks still running after that are aborted.
    ///
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        let previous = std::mem::replace(&mut *lock(&self.inner.state), SessionState::Closed);
        if !previous.is_closed() {
            info!("shutting down session");
        }
        lock(&self.inner.pending_ack).take();
        self.inner.sender.close();
        self.inner.cancel.cancel();

        let tasks = std::mem::take(&mut *lock(&self.tasks));
        let bound = self.inner.config.shutdown_timeout();
        for (name, mut handle) in tasks {
            match time::timeout(bound, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("{name} loop ended abnormally: {e}"),
                Err(_) => {
                    warn!("{name} loop did not stop within {bound:?}; aborting");
                    handle.abort();
                }
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.inner.sender.close();
        self.inner.cancel.cancel();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.inner.role)
            .field("state", &self.state())
            .field("session_id", &self.session_id())
            .finish_non_exhaustive()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
