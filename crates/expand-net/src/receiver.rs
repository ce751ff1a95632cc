//! Inbound direction: the read loop and its statistics.
//!
//! The loop reads one 24-byte header, validates it, reads exactly
//! `payload_length` bytes and hands the message to an [`InboundHandler`].
//! Continuity is tracked separately for the critical and media sequence
//! spaces; a forward jump is reported as a gap before the message that
//! revealed it.
//!
//! A malformed header or an oversized payload ends the loop: after either,
//! the byte stream can no longer be trusted to be aligned on message
//! boundaries.

use std::io::ErrorKind;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use expand_core::protocol::{
    check_payload_length, decode_header, Message, SequenceGap, SequenceObservation,
    SequenceTracker, HEADER_SIZE,
};
use expand_core::ProtocolError;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::ReceiverConfig;
use crate::error::TransportError;

/// Something the read loop observed.
#[derive(Debug, Clone, PartialEq)]
pub enum ReceiverEvent {
    /// A complete message.
    Message(Message),
    /// Sequence numbers were skipped in one sequence space.
    Gap(SequenceGap),
    /// The stream carried something undecodable; the loop has stopped.
    Failed(ProtocolError),
    /// The peer closed the stream or the stream failed; the loop has stopped.
    Closed,
}

/// Consumer of [`ReceiverEvent`]s, called from the read loop.
///
/// The loop awaits each call, so a slow handler slows reading down rather
/// than buffering without bound.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn on_event(&self, event: ReceiverEvent);
}

/// Forwards every event into a channel.  Events are discarded once the
/// channel's receiving end is gone.
#[async_trait]
impl InboundHandler for mpsc::Sender<ReceiverEvent> {
    async fn on_event(&self, event: ReceiverEvent) {
        if self.send(event).await.is_err() {
            trace!("receiver event dropped: channel closed");
        }
    }
}

/// Point-in-time view of the receiver's counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReceiverStats {
    pub bytes_received: u64,
    pub messages_received: u64,
    /// Last in-order media sequence number.
    pub last_sequence_number: Option<u32>,
    /// Last in-order critical sequence number.
    pub last_critical_sequence_number: Option<u32>,
    /// Messages inferred lost from sequence gaps, both classes.
    pub dropped_messages: u64,
    /// Duplicate or out-of-order sequence numbers.
    pub stale_messages: u64,
    /// `bytes_received * 8 / elapsed` since the loop started.
    pub receive_rate_bps: f64,
    pub elapsed: Duration,
}

#[derive(Debug, Default)]
struct Trackers {
    media: SequenceTracker,
    critical: SequenceTracker,
}

#[derive(Debug)]
struct Shared {
    config: ReceiverConfig,
    started_at: OnceLock<Instant>,
    bytes_received: AtomicU64,
    messages_received: AtomicU64,
    trackers: Mutex<Trackers>,
}

/// Read side of a connection.  Clones share statistics.
#[derive(Debug, Clone)]
pub struct Receiver {
    shared: Arc<Shared>,
}

impl Receiver {
    pub fn new(config: ReceiverConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                started_at: OnceLock::new(),
                bytes_received: AtomicU64::new(0),
                messages_received: AtomicU64::new(0),
                trackers: Mutex::new(Trackers::default()),
            }),
        }
    }

    pub fn stats(&self) -> ReceiverStats {
        let bytes_received = self.shared.bytes_received.load(Ordering::Relaxed);
        let elapsed = self
            .shared
            .started_at
            .get()
            .map(Instant::elapsed)
            .unwrap_or_default();
        let receive_rate_bps = if elapsed.is_zero() {
            0.0
        } else {
            (bytes_received * 8) as f64 / elapsed.as_secs_f64()
        };

        let trackers = self.lock_trackers();
        ReceiverStats {
            bytes_received,
            messages_received: self.shared.messages_received.load(Ordering::Relaxed),
            last_sequence_number: trackers.media.last(),
            last_critical_sequence_number: trackers.critical.last(),
            dropped_messages: trackers.media.dropped() + trackers.critical.dropped(),
            stale_messages: trackers.media.stale() + trackers.critical.stale(),
            receive_rate_bps,
            elapsed,
        }
    }

    /// Spawns [`run`](Self::run) on the current runtime.
    pub fn spawn<R, H>(
        &self,
        reader: R,
        handler: H,
        cancel: CancellationToken,
    ) -> JoinHandle<Result<(), TransportError>>
    where
        R: AsyncRead + Unpin + Send + 'static,
        H: InboundHandler + 'static,
    {
        let receiver = self.clone();
        tokio::spawn(async move { receiver.run(reader, &handler, cancel).await })
    }

    /// Reads messages until cancellation, end of stream or a fatal error.
    ///
    /// The handler always learns why the loop stopped, except on
    /// cancellation.
    ///
    /// # Errors
    ///
    /// [`TransportError::Protocol`] for a malformed header or an oversized
    /// payload.  End of stream and I/O failures are reported to the handler as
    /// [`ReceiverEvent::Closed`] and return `Ok`.
    pub async fn run<R, H>(
        &self,
        mut reader: R,
        handler: &H,
        cancel: CancellationToken,
    ) -> Result<(), TransportError>
    where
        R: AsyncRead + Unpin,
        H: InboundHandler + ?Sized,
    {
        let config = &self.shared.config;
        self.shared.started_at.get_or_init(Instant::now);

        loop {
            let mut header_buf = [0u8; HEADER_SIZE];
            match read_full(&mut reader, &mut header_buf, config, &cancel).await {
                Ok(true) => {}
                Ok(false) => return Ok(()),
                Err(e) => {
                    debug!("read loop ending: {e}");
                    handler.on_event(ReceiverEvent::Closed).await;
                    return Ok(());
                }
            }

            let header = match decode_header(&header_buf)
                .and_then(|h| check_payload_length(&h, config.max_payload_size).map(|_| h))
            {
                Ok(h) => h,
                Err(e) => {
                    warn!("stopping read loop: {e}");
                    handler.on_event(ReceiverEvent::Failed(e.clone())).await;
                    return Err(TransportError::Protocol(e));
                }
            };

            let mut payload = vec![0u8; header.payload_length as usize];
            match read_full(&mut reader, &mut payload, config, &cancel).await {
                Ok(true) => {}
                Ok(false) => return Ok(()),
                Err(e) => {
                    debug!("stream ended inside a {} payload: {e}", header.message_type);
                    handler.on_event(ReceiverEvent::Closed).await;
                    return Ok(());
                }
            }

            self.shared
                .bytes_received
                .fetch_add((HEADER_SIZE + payload.len()) as u64, Ordering::Relaxed);
            self.shared.messages_received.fetch_add(1, Ordering::Relaxed);

            let observation = {
                let mut trackers = self.lock_trackers();
                let tracker = if header.message_type.is_critical() {
                    &mut trackers.critical
                } else {
                    &mut trackers.media
                };
                tracker.observe(header.sequence_number)
            };
            match observation {
                SequenceObservation::Gap(gap) => {
                    debug!(
                        "sequence gap: expected {} got {} ({} missing)",
                        gap.expected, gap.received, gap.missing
                    );
                    handler.on_event(ReceiverEvent::Gap(gap)).await;
                }
                SequenceObservation::Stale { last, received } => {
                    trace!("stale sequence number {received} (last {last})");
                }
                SequenceObservation::First | SequenceObservation::InOrder => {}
            }

            handler
                .on_event(ReceiverEvent::Message(Message { header, payload }))
                .await;
        }
    }

    fn lock_trackers(&self) -> MutexGuard<'_, Trackers> {
        self.shared
            .trackers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Fills `buf` completely, keeping what was already read across transient
/// errors so the stream stays aligned on message boundaries.
///
/// Returns `Ok(false)` if cancelled first.  End of stream is reported as
/// [`ErrorKind::UnexpectedEof`].
async fn read_full<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
    config: &ReceiverConfig,
    cancel: &CancellationToken,
) -> std::io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let read = tokio::select! {
            _ = cancel.cancelled() => return Ok(false),
            r = reader.read(&mut buf[filled..]) => r,
        };
        match read {
            Ok(0) => {
                return Err(std::io::Error::new(
                    ErrorKind::UnexpectedEof,
                    format!("stream closed after {filled} of {} bytes", buf.len()),
                ))
            }
            Ok(n) => filled += n,
            Err(e) if is_transient_read_error(e.kind()) => {
                warn!("transient read error: {e}; retrying in {:?}", config.retry_delay());
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(false),
                    _ = time::sleep(config.retry_delay()) => {}
                }
            }
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

fn is_transient_read_error(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut
    )
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use expand_core::protocol::{encode_header, MessageHeader, PROTOCOL_MAGIC};
    use expand_core::{encode_message, MessageType};

    fn config(max_payload_size: usize) -> ReceiverConfig {
        ReceiverConfig {
            max_payload_size,
            retry_delay_ms: 1,
        }
    }

    fn frame(seq: u32, payload: &[u8]) -> Vec<u8> {
        encode_message(&Message::new(MessageType::VideoFrame, seq, 0, payload.to_vec()))
    }

    fn collect(rx: &mut mpsc::Receiver<ReceiverEvent>) -> Vec<ReceiverEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_gap_of_one_reported_after_message_four() {
        // Arrange
        let mut wire = Vec::new();
        for seq in [1, 2, 4, 5] {
            wire.extend(frame(seq, &[seq as u8]));
        }
        let reader = tokio_test::io::Builder::new().read(&wire).build();
        let receiver = Receiver::new(config(1024));
        let (tx, mut rx) = mpsc::channel(32);

        // Act
        receiver
            .run(reader, &tx, CancellationToken::new())
            .await
            .unwrap();

        // Assert
        let events = collect(&mut rx);
        let seqs_and_gaps: Vec<String> = events
            .iter()
            .map(|e| match e {
                ReceiverEvent::Message(m) => format!("m{}", m.sequence_number()),
                ReceiverEvent::Gap(g) => format!("gap{}", g.missing),
                ReceiverEvent::Failed(_) => "failed".to_string(),
                ReceiverEvent::Closed => "closed".to_string(),
            })
            .collect();
        assert_eq!(seqs_and_gaps, vec!["m1", "m2", "gap1", "m4", "m5", "closed"]);

        let stats = receiver.stats();
        assert_eq!(stats.dropped_messages, 1);
        assert_eq!(stats.messages_received, 4);
        assert_eq!(stats.last_sequence_number, Some(5));
        assert_eq!(stats.bytes_received, wire.len() as u64);
    }

    #[tokio::test]
    async fn test_critical_and_media_sequences_are_tracked_separately() {
        let mut wire = Vec::new();
        wire.extend(frame(0, b"a"));
        wire.extend(encode_message(&Message::new(MessageType::Heartbeat, 0, 0, b"{}".to_vec())));
        wire.extend(frame(1, b"b"));
        wire.extend(encode_message(&Message::new(MessageType::Heartbeat, 1, 0, b"{}".to_vec())));
        let reader = tokio_test::io::Builder::new().read(&wire).build();
        let receiver = Receiver::new(config(1024));
        let (tx, mut rx) = mpsc::channel(32);

        receiver.run(reader, &tx, CancellationToken::new()).await.unwrap();

        let events = collect(&mut rx);
        assert!(!events.iter().any(|e| matches!(e, ReceiverEvent::Gap(_))));
        let stats = receiver.stats();
        assert_eq!(stats.last_sequence_number, Some(1));
        assert_eq!(stats.last_critical_sequence_number, Some(1));
        assert_eq!(stats.dropped_messages, 0);
    }

    #[tokio::test]
    async fn test_duplicate_sequence_is_stale_not_dropped() {
        let mut wire = Vec::new();
        for seq in [3, 4, 4, 5] {
            wire.extend(frame(seq, b"x"));
        }
        let reader = tokio_test::io::Builder::new().read(&wire).build();
        let receiver = Receiver::new(config(1024));
        let (tx, _rx) = mpsc::channel(32);

        receiver.run(reader, &tx, CancellationToken::new()).await.unwrap();

        let stats = receiver.stats();
        assert_eq!(stats.dropped_messages, 0);
        assert_eq!(stats.stale_messages, 1);
        assert_eq!(stats.messages_received, 4);
    }

    #[tokio::test]
    async fn test_oversized_payload_stops_loop() {
        // Arrange – header announces 1000 bytes, limit is 100
        let header = MessageHeader::new(MessageType::VideoFrame, 0, 1000, 0);
        let reader = tokio_test::io::Builder::new()
            .read(&encode_header(&header))
            .build();
        let receiver = Receiver::new(config(100));
        let (tx, mut rx) = mpsc::channel(8);

        // Act
        let result = receiver.run(reader, &tx, CancellationToken::new()).await;

        // Assert
        let expected = ProtocolError::PayloadTooLarge { size: 1000, max: 100 };
        assert!(matches!(result, Err(TransportError::Protocol(ref e)) if *e == expected));
        assert_eq!(collect(&mut rx), vec![ReceiverEvent::Failed(expected)]);
        assert_eq!(receiver.stats().messages_received, 0);
    }

    #[tokio::test]
    async fn test_bad_magic_is_malformed_header() {
        let mut bytes = encode_header(&MessageHeader::new(MessageType::VideoFrame, 0, 0, 0));
        bytes[..4].copy_from_slice(&(PROTOCOL_MAGIC ^ 1).to_be_bytes());
        let reader = tokio_test::io::Builder::new().read(&bytes).build();
        let receiver = Receiver::new(config(100));
        let (tx, mut rx) = mpsc::channel(8);

        let result = receiver.run(reader, &tx, CancellationToken::new()).await;

        assert!(matches!(
            result,
            Err(TransportError::Protocol(ProtocolError::MalformedHeader(_)))
        ));
        assert!(matches!(
            collect(&mut rx).as_slice(),
            [ReceiverEvent::Failed(ProtocolError::MalformedHeader(_))]
        ));
    }

    #[tokio::test]
    async fn test_eof_inside_payload_is_closed() {
        let full = frame(0, &[7; 32]);
        let reader = tokio_test::io::Builder::new()
            .read(&full[..HEADER_SIZE + 10])
            .build();
        let receiver = Receiver::new(config(1024));
        let (tx, mut rx) = mpsc::channel(8);

        let result = receiver.run(reader, &tx, CancellationToken::new()).await;

        assert!(result.is_ok());
        assert_eq!(collect(&mut rx), vec![ReceiverEvent::Closed]);
    }

    #[tokio::test]
    async fn test_transient_error_mid_header_keeps_framing() {
        // Arrange – the stream stalls ten bytes into the header
        let wire = frame(0, b"intact");
        let reader = tokio_test::io::Builder::new()
            .read(&wire[..10])
            .read_error(std::io::Error::new(ErrorKind::TimedOut, "stalled"))
            .read(&wire[10..])
            .build();
        let receiver = Receiver::new(config(1024));
        let (tx, mut rx) = mpsc::channel(8);

        // Act
        let result = receiver.run(reader, &tx, CancellationToken::new()).await;

        // Assert
        assert!(result.is_ok());
        let events = collect(&mut rx);
        assert_eq!(events.len(), 2);
        let ReceiverEvent::Message(message) = &events[0] else {
            panic!("expected the message first, got {:?}", events[0]);
        };
        assert_eq!(message.sequence_number(), 0);
        assert_eq!(message.payload, b"intact");
        assert_eq!(events[1], ReceiverEvent::Closed);
    }

    #[tokio::test]
    async fn test_transient_error_mid_payload_keeps_framing() {
        let mut wire = frame(0, &[1; 40]);
        wire.extend(frame(1, &[2; 8]));
        let split = HEADER_SIZE + 15;
        let reader = tokio_test::io::Builder::new()
            .read(&wire[..split])
            .read_error(std::io::Error::new(ErrorKind::WouldBlock, "not ready"))
            .read(&wire[split..])
            .build();
        let receiver = Receiver::new(config(1024));
        let (tx, mut rx) = mpsc::channel(8);

        receiver.run(reader, &tx, CancellationToken::new()).await.unwrap();

        let payloads: Vec<Vec<u8>> = collect(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                ReceiverEvent::Message(m) => Some(m.payload),
                _ => None,
            })
            .collect();
        assert_eq!(payloads, vec![vec![1; 40], vec![2; 8]]);
        assert_eq!(receiver.stats().dropped_messages, 0);
    }

    #[tokio::test]
    async fn test_cancel_stops_idle_loop_without_event() {
        let (_client, server) = tokio::io::duplex(64);
        let receiver = Receiver::new(config(1024));
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let handle = receiver.spawn(server, tx, cancel.clone());

        cancel.cancel();

        let result = time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop must stop promptly")
            .expect("task must not panic");
        assert!(result.is_ok());
        assert!(rx.recv().await.is_none(), "no event expected on cancel");
    }

    #[tokio::test]
    async fn test_receive_rate_is_positive_after_traffic() {
        let wire = frame(0, &[0; 1000]);
        let reader = tokio_test::io::Builder::new()
            .read(&wire)
            .wait(Duration::from_millis(20))
            .build();
        let receiver = Receiver::new(config(4096));
        let (tx, _rx) = mpsc::channel(8);

        receiver.run(reader, &tx, CancellationToken::new()).await.unwrap();

        let stats = receiver.stats();
        assert!(stats.elapsed >= Duration::from_millis(20));
        assert!(stats.receive_rate_bps > 0.0);
        assert!(stats.receive_rate_bps <= (wire.len() * 8) as f64 / 0.020);
    }
}
