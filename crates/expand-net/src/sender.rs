//! Outbound direction: bounded drop-oldest queues and the drain loop.
//!
//! # Flow control (for beginners)
//!
//! A live video stream must never make the encoder wait.  [`Sender::send`]
//! therefore only appends to an in-memory queue and returns; a background
//! task (the *drain loop*) writes queued messages to the stream one at a
//! time.  When the network is slower than the encoder the queue fills up,
//! and the **oldest** entry is thrown away to make room: a stale frame is
//! worth less than a fresh one.
//!
//! Handshake and heartbeat messages travel on a separate, smaller *critical*
//! queue that is always drained first and has its own sequence space, so a
//! burst of video can never evict them.
//!
//! Sequence numbers are assigned while the queue lock is held, which makes
//! enqueue order and number order identical even with many producers.

use std::collections::VecDeque;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use expand_core::protocol::{
    clock, encode_header, Message, MessageType, SequenceCounter, WirePayload, HEADER_SIZE,
};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::SenderConfig;
use crate::error::TransportError;

/// A message waiting in the queue.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub message: Message,
    pub enqueued_at: Instant,
}

/// Point-in-time view of the sender's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SenderStats {
    pub queued_messages: usize,
    pub queued_bytes: usize,
    /// Next sequence number of the media (non-critical) class.
    pub media_sequence: u32,
    /// Next sequence number of the critical class.
    pub critical_sequence: u32,
    pub dropped_media_messages: u64,
    pub dropped_critical_messages: u64,
    pub sent_messages: u64,
    pub sent_bytes: u64,
    pub write_failures: u64,
}

#[derive(Debug, Default)]
struct Queues {
    critical: VecDeque<QueuedMessage>,
    media: VecDeque<QueuedMessage>,
    queued_bytes: usize,
    closed: bool,
}

impl Queues {
    fn pop(&mut self) -> Option<QueuedMessage> {
        let next = self
            .critical
            .pop_front()
            .or_else(|| self.media.pop_front())?;
        self.queued_bytes -= wire_len(&next.message);
        Some(next)
    }
}

#[derive(Debug)]
struct Shared {
    config: SenderConfig,
    queues: Mutex<Queues>,
    notify: Notify,
    media_sequence: SequenceCounter,
    critical_sequence: SequenceCounter,
    dropped_media: AtomicU64,
    dropped_critical: AtomicU64,
    sent_messages: AtomicU64,
    sent_bytes: AtomicU64,
    write_failures: AtomicU64,
}

/// Cheap-to-clone handle to the outbound queue.
#[derive(Debug, Clone)]
pub struct Sender {
    shared: Arc<Shared>,
}

impl Sender {
    pub fn new(config: SenderConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                queues: Mutex::new(Queues::default()),
                notify: Notify::new(),
                media_sequence: SequenceCounter::new(),
                critical_sequence: SequenceCounter::new(),
                dropped_media: AtomicU64::new(0),
                dropped_critical: AtomicU64::new(0),
                sent_messages: AtomicU64::new(0),
                sent_bytes: AtomicU64::new(0),
                write_failures: AtomicU64::new(0),
            }),
        }
    }

    /// Enqueues one message and returns its sequence number.
    ///
    /// Never blocks and never waits for the network.
    ///
    /// # Errors
    ///
    /// - [`TransportError::PayloadTooLarge`] if the payload does not fit the
    ///   32-bit length field.
    /// - [`TransportError::QueueClosed`] after [`close`](Self::close).
    pub fn send(&self, message_type: MessageType, payload: Vec<u8>) -> Result<u32, TransportError> {
        self.send_batch(message_type, vec![payload])
    }

    /// Serializes `payload` and enqueues it under its own message type.
    ///
    /// # Errors
    ///
    /// As [`send`](Self::send), plus [`TransportError::Protocol`] if the
    /// payload cannot be serialized.
    pub fn send_payload<T: WirePayload>(&self, payload: &T) -> Result<u32, TransportError> {
        self.send(T::MESSAGE_TYPE, payload.to_message_payload()?)
    }

    /// Enqueues several messages of one type under consecutive sequence
    /// numbers and returns the first.
    ///
    /// No other producer can take a number inside the block, which FEC
    /// groups rely on.
    ///
    /// # Errors
    ///
    /// As [`send`](Self::send).  Nothing is enqueued on error.
    pub fn send_batch(
        &self,
        message_type: MessageType,
        payloads: Vec<Vec<u8>>,
    ) -> Result<u32, TransportError> {
        if let Some(p) = payloads.iter().find(|p| p.len() > u32::MAX as usize) {
            return Err(TransportError::PayloadTooLarge {
                size: p.len(),
                max: u32::MAX as usize,
            });
        }

        let critical = message_type.is_critical();
        let timestamp = clock::monotonic_ms();
        let now = Instant::now();

        let mut queues = self.lock_queues();
        if queues.closed {
            return Err(TransportError::QueueClosed);
        }

        let counter = if critical {
            &self.shared.critical_sequence
        } else {
            &self.shared.media_sequence
        };
        let first = counter.reserve(payloads.len() as u32);

        for (offset, payload) in payloads.into_iter().enumerate() {
            let sequence_number = first.wrapping_add(offset as u32);
            let message = Message::new(message_type, sequence_number, timestamp, payload);
            self.enqueue_locked(
                &mut queues,
                critical,
                QueuedMessage {
                    message,
                    enqueued_at: now,
                },
            );
        }
        drop(queues);

        self.shared.notify.notify_one();
        Ok(first)
    }

    /// Stops accepting new messages.  Already queued messages are still
    /// written by the drain loop, which then exits.
    pub fn close(&self) {
        self.lock_queues().closed = true;
        self.shared.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.lock_queues().closed
    }

    pub fn stats(&self) -> SenderStats {
        let queues = self.lock_queues();
        SenderStats {
            queued_messages: queues.critical.len() + queues.media.len(),
            queued_bytes: queues.queued_bytes,
            media_sequence: self.shared.media_sequence.current(),
            critical_sequence: self.shared.critical_sequence.current(),
            dropped_media_messages: self.shared.dropped_media.load(Ordering::Relaxed),
            dropped_critical_messages: self.shared.dropped_critical.load(Ordering::Relaxed),
            sent_messages: self.shared.sent_messages.load(Ordering::Relaxed),
            sent_bytes: self.shared.sent_bytes.load(Ordering::Relaxed),
            write_failures: self.shared.write_failures.load(Ordering::Relaxed),
        }
    }

    /// Spawns [`run_drain`](Self::run_drain) on the current runtime.
    pub fn spawn_drain<W>(
        &self,
        writer: W,
        cancel: CancellationToken,
    ) -> JoinHandle<Result<(), TransportError>>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let sender = self.clone();
        tokio::spawn(async move { sender.run_drain(writer, cancel).await })
    }

    /// Writes queued messages to `writer` until cancelled or until the queue
    /// is closed and empty.
    ///
    /// Critical messages go first; within a class the order is FIFO.
    ///
    /// # Errors
    ///
    /// Returns the error that made the stream unusable: a fatal I/O error
    /// kind, a failure after part of a message was written, or too many
    /// consecutive failed writes.  The queue is closed in
    /// that case.
    pub async fn run_drain<W>(
        &self,
        mut writer: W,
        cancel: CancellationToken,
    ) -> Result<(), TransportError>
    where
        W: AsyncWrite + Unpin,
    {
        let config = &self.shared.config;
        let mut consecutive_failures = 0u32;

        loop {
            let next = {
                let mut queues = self.lock_queues();
                match queues.pop() {
                    Some(entry) => Some(entry),
                    None if queues.closed => {
                        debug!("send queue closed and drained");
                        return Ok(());
                    }
                    None => None,
                }
            };

            let Some(entry) = next else {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = self.shared.notify.notified() => {}
                }
                continue;
            };

            let message = &entry.message;
            let mut written = 0usize;
            let result = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                r = time::timeout(
                    config.write_timeout(),
                    write_message(&mut writer, message, &mut written),
                ) => r,
            };

            let error = match result {
                Ok(Ok(())) => {
                    consecutive_failures = 0;
                    self.shared.sent_messages.fetch_add(1, Ordering::Relaxed);
                    self.shared
                        .sent_bytes
                        .fetch_add(wire_len(message) as u64, Ordering::Relaxed);
                    trace!(
                        "wrote {} seq={} after {:?} in queue",
                        message.message_type(),
                        message.sequence_number(),
                        entry.enqueued_at.elapsed()
                    );
                    continue;
                }
                Ok(Err(e)) => e,
                Err(_) => std::io::Error::new(
                    ErrorKind::TimedOut,
                    format!("write did not complete within {:?}", config.write_timeout()),
                ),
            };

            self.shared.write_failures.fetch_add(1, Ordering::Relaxed);
            consecutive_failures += 1;

            // A partly written frame leaves the peer mid-message; nothing
            // written after it could be framed correctly.
            let torn = written > 0 && written < wire_len(message);
            if torn {
                warn!(
                    "write of {} seq={} failed after {written} of {} bytes: {error}",
                    message.message_type(),
                    message.sequence_number(),
                    wire_len(message)
                );
            }
            if torn
                || is_fatal_write_error(error.kind())
                || consecutive_failures >= config.max_consecutive_write_failures
            {
                warn!(
                    "drain loop giving up after {consecutive_failures} failed write(s): {error}"
                );
                self.close();
                return Err(TransportError::Io(error));
            }

            warn!(
                "failed to write {} seq={}: {error}; retrying in {:?}",
                message.message_type(),
                message.sequence_number(),
                config.retry_delay()
            );
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = time::sleep(config.retry_delay()) => {}
            }
        }
    }

    fn enqueue_locked(&self, queues: &mut Queues, critical: bool, entry: QueuedMessage) {
        let (queue, bound, dropped) = if critical {
            (
                &mut queues.critical,
                self.shared.config.max_critical_queue_depth,
                &self.shared.dropped_critical,
            )
        } else {
            (
                &mut queues.media,
                self.shared.config.max_queue_depth,
                &self.shared.dropped_media,
            )
        };

        let mut freed = 0;
        while queue.len() >= bound.max(1) {
            let Some(evicted) = queue.pop_front() else {
                break;
            };
            freed += wire_len(&evicted.message);
            dropped.fetch_add(1, Ordering::Relaxed);
            debug!(
                "queue full, dropped oldest {} seq={}",
                evicted.message.message_type(),
                evicted.message.sequence_number()
            );
        }

        let added = wire_len(&entry.message);
        queue.push_back(entry);
        queues.queued_bytes = queues.queued_bytes - freed + added;
    }

    fn lock_queues(&self) -> MutexGuard<'_, Queues> {
        self.shared
            .queues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Header plus payload, written back to back.
///
/// `written` counts the bytes accepted by `writer` so far and stays valid if
/// the future is dropped part way.
async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
    written: &mut usize,
) -> std::io::Result<()> {
    let mut header = message.header;
    header.payload_length = message.payload.len() as u32;
    let header = encode_header(&header);
    let total = wire_len(message);

    while *written < total {
        let chunk = if *written < HEADER_SIZE {
            &header[*written..]
        } else {
            &message.payload[*written - HEADER_SIZE..]
        };
        let n = writer.write(chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                ErrorKind::WriteZero,
                "stream accepted no bytes",
            ));
        }
        *written += n;
    }
    writer.flush().await
}

fn wire_len(message: &Message) -> usize {
    HEADER_SIZE + message.payload.len()
}

fn is_fatal_write_error(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::WriteZero
            | ErrorKind::UnexpectedEof
    )
}

// ── Tests ─────────────────────────────────────────────────────────────────────
