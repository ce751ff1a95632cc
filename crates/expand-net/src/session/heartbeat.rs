//! Periodic heartbeat and receiver feedback.
//!
//! Once the session is established, every tick sends a Heartbeat carrying
//! the local clock, and, when feedback is enabled, a ProtocolFeedback
//! describing what this side has received since the previous tick.
//!
//! Inbound Heartbeat and HeartbeatAck traffic refreshes the session's
//! activity timestamp.  When that timestamp falls further behind than the
//! configured timeout the loop reports [`SessionEvent::HeartbeatTimeout`]
//! and stops; reconnecting is the application's decision.

use std::sync::Arc;

use expand_core::protocol::clock;
use expand_core::protocol::payloads::{HeartbeatMessage, ProtocolFeedbackMessage};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, trace, warn};

use super::{SessionEvent, SessionInner, SessionState};
use crate::receiver::ReceiverStats;

pub(super) async fn run(inner: Arc<SessionInner>) {
    let heartbeat = &inner.config.heartbeat;
    let mut ticker = time::interval(heartbeat.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    let mut feedback = FeedbackWindow::default();

    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => {
                debug!("heartbeat loop cancelled");
                return;
            }
            _ = ticker.tick() => {}
        }

        if inner.state() != SessionState::Established {
            continue;
        }

        let now = clock::monotonic_ms();
        let silent_for = now.saturating_sub(inner.last_activity_ms());
        if silent_for > heartbeat.timeout_ms {
            warn!("no heartbeat traffic for {silent_for} ms; stopping heartbeat loop");
            inner.emit(SessionEvent::HeartbeatTimeout).await;
            return;
        }

        if let Err(e) = inner.sender.send_payload(&HeartbeatMessage { timestamp: now }) {
            debug!("heartbeat loop stopping: {e}");
            return;
        }
        trace!("heartbeat sent at {now}");

        if inner.config.feedback.enabled {
            let report = feedback.next(now, &inner.receiver.stats(), inner.rtt().mean_ms());
            if let Err(e) = inner.sender.send_payload(&report) {
                debug!("heartbeat loop stopping: {e}");
                return;
            }
        }
    }
}

/// Remembers the totals reported last time so each report can carry deltas.
#[derive(Debug, Default)]
pub(crate) struct FeedbackWindow {
    total_messages: u64,
    dropped_messages: u64,
}

impl FeedbackWindow {
    pub(crate) fn next(
        &mut self,
        timestamp: u64,
        stats: &ReceiverStats,
        average_rtt_ms: f64,
    ) -> ProtocolFeedbackMessage {
        let report = ProtocolFeedbackMessage {
            timestamp,
            average_rtt_ms,
            total_messages: stats.messages_received,
            dropped_messages: stats.dropped_messages,
            total_messages_delta: stats.messages_received.saturating_sub(self.total_messages),
            dropped_messages_delta: stats.dropped_messages.saturating_sub(self.dropped_messages),
            receive_rate_bps: stats.receive_rate_bps,
        };
        self.total_messages = stats.messages_received;
        self.dropped_messages = stats.dropped_messages;
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(messages: u64, dropped: u64) -> ReceiverStats {
        ReceiverStats {
            messages_received: messages,
            dropped_messages: dropped,
            receive_rate_bps: 4_000_000.0,
            ..ReceiverStats::default()
        }
    }

    #[test]
    fn test_first_report_deltas_equal_totals() {
        let mut window = FeedbackWindow::default();

        let report = window.next(10, &stats(100, 3), 25.0);

        assert_eq!(report.total_messages, 100);
        assert_eq!(report.total_messages_delta, 100);
        assert_eq!(report.dropped_messages_delta, 3);
        assert_eq!(report.average_rtt_ms, 25.0);
        assert_eq!(report.receive_rate_bps, 4_000_000.0);
    }

    #[test]
    fn test_later_reports_carry_only_new_counts() {
        let mut window = FeedbackWindow::default();
        window.next(10, &stats(100, 3), 0.0);

        let report = window.next(20, &stats(160, 5), 0.0);

        assert_eq!(report.total_messages_delta, 60);
        assert_eq!(report.dropped_messages_delta, 2);
        assert_eq!(report.dropped_messages, 5);
    }
}
