//! AIMD adaptive bitrate controller.
//!
//! Additive increase, multiplicative decrease: one lossy feedback sample
//! backs the target off by a constant factor straight away, while a clean
//! sample only nudges it up by a fixed step.  The control law lives in the
//! pure function [`update`]; [`BitrateController`] is a thin owner for
//! callers that do not want to thread the state themselves.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::payloads::ProtocolFeedbackMessage;

// ── Configuration ─────────────────────────────────────────────────────────────

fn default_initial_bitrate() -> u64 {
    8_000_000
}
fn default_min_bitrate() -> u64 {
    1_000_000
}
fn default_max_bitrate() -> u64 {
    20_000_000
}
fn default_increase_step() -> u64 {
    500_000
}
fn default_decrease_factor() -> f64 {
    0.85
}
fn default_loss_threshold() -> f64 {
    0.02
}
fn default_smoothing_alpha() -> f64 {
    1.0
}
fn default_receive_rate_headroom() -> f64 {
    1.5
}

/// Tuning parameters for the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BitrateConfig {
    #[serde(default = "default_initial_bitrate")]
    pub initial_bitrate_bps: u64,
    #[serde(default = "default_min_bitrate")]
    pub min_bitrate_bps: u64,
    #[serde(default = "default_max_bitrate")]
    pub max_bitrate_bps: u64,
    /// Added to the target on every low-loss sample.
    #[serde(default = "default_increase_step")]
    pub increase_step_bps: u64,
    /// Multiplier applied on a lossy sample, in `(0, 1)`.
    #[serde(default = "default_decrease_factor")]
    pub decrease_factor: f64,
    /// Loss ratio above which the target is decreased.
    #[serde(default = "default_loss_threshold")]
    pub loss_decrease_threshold: f64,
    /// Weight of the new target in `(0, 1]`; 1.0 disables smoothing.
    #[serde(default = "default_smoothing_alpha")]
    pub smoothing_alpha: f64,
    /// Increases never exceed `receive_rate × headroom` when the receiver
    /// reports a rate.
    #[serde(default = "default_receive_rate_headroom")]
    pub receive_rate_headroom: f64,
}

impl Default for BitrateConfig {
    fn default() -> Self {
        Self {
            initial_bitrate_bps: default_initial_bitrate(),
            min_bitrate_bps: default_min_bitrate(),
            max_bitrate_bps: default_max_bitrate(),
            increase_step_bps: default_increase_step(),
            decrease_factor: default_decrease_factor(),
            loss_decrease_threshold: default_loss_threshold(),
            smoothing_alpha: default_smoothing_alpha(),
            receive_rate_headroom: default_receive_rate_headroom(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum BitrateConfigError {
    #[error("bitrate range is empty: min {min} > max {max}")]
    EmptyRange { min: u64, max: u64 },

    #[error("decrease factor must be in (0, 1), got {0}")]
    DecreaseFactor(f64),

    #[error("smoothing alpha must be in (0, 1], got {0}")]
    SmoothingAlpha(f64),

    #[error("loss threshold must be in [0, 1), got {0}")]
    LossThreshold(f64),

    #[error("receive rate headroom must be >= 1, got {0}")]
    Headroom(f64),
}

impl BitrateConfig {
    /// # Errors
    ///
    /// Returns the first [`BitrateConfigError`] found.
    pub fn validate(&self) -> Result<(), BitrateConfigError> {
        if self.min_bitrate_bps > self.max_bitrate_bps {
            return Err(BitrateConfigError::EmptyRange {
                min: self.min_bitrate_bps,
                max: self.max_bitrate_bps,
            });
        }
        if !(self.decrease_factor > 0.0 && self.decrease_factor < 1.0) {
            return Err(BitrateConfigError::DecreaseFactor(self.decrease_factor));
        }
        if !(self.smoothing_alpha > 0.0 && self.smoothing_alpha <= 1.0) {
            return Err(BitrateConfigError::SmoothingAlpha(self.smoothing_alpha));
        }
        if !(0.0..1.0).contains(&self.loss_decrease_threshold) {
            return Err(BitrateConfigError::LossThreshold(self.loss_decrease_threshold));
        }
        if !(self.receive_rate_headroom >= 1.0) {
            return Err(BitrateConfigError::Headroom(self.receive_rate_headroom));
        }
        Ok(())
    }

    fn clamp(&self, bps: u64) -> u64 {
        bps.clamp(self.min_bitrate_bps, self.max_bitrate_bps)
    }
}

// ── Inputs and outputs ────────────────────────────────────────────────────────

/// One feedback sample, as reported by the receiving peer.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BitrateFeedback {
    pub average_rtt_ms: f64,
    pub total_messages_delta: u64,
    pub dropped_messages_delta: u64,
    pub receive_rate_bps: f64,
}

impl From<&ProtocolFeedbackMessage> for BitrateFeedback {
    fn from(msg: &ProtocolFeedbackMessage) -> Self {
        Self {
            average_rtt_ms: msg.average_rtt_ms,
            total_messages_delta: msg.total_messages_delta,
            dropped_messages_delta: msg.dropped_messages_delta,
            receive_rate_bps: msg.receive_rate_bps,
        }
    }
}

impl BitrateFeedback {
    /// `dropped / max(1, total)`.
    pub fn loss_ratio(&self) -> f64 {
        self.dropped_messages_delta as f64 / self.total_messages_delta.max(1) as f64
    }
}

/// State carried between calls to [`update`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BitrateState {
    pub current_bitrate_bps: u64,
    pub smoothed_rtt_ms: f64,
    pub smoothed_loss: f64,
    pub samples: u64,
}

impl BitrateState {
    pub fn initial(config: &BitrateConfig) -> Self {
        Self {
            current_bitrate_bps: config.clamp(config.initial_bitrate_bps),
            smoothed_rtt_ms: 0.0,
            smoothed_loss: 0.0,
            samples: 0,
        }
    }
}

/// Output of one controller step.
#[derive(Debug, Clone, PartialEq)]
pub struct BitrateDecision {
    pub target_bitrate_bps: u64,
    pub previous_bitrate_bps: u64,
    pub loss_ratio: f64,
    /// Only emit a bitrate-control message when this is set.
    pub changed: bool,
    pub reason: String,
}

// ── Control law ───────────────────────────────────────────────────────────────

/// Runs one controller step.  Pure: same inputs, same outputs.
pub fn update(
    config: &BitrateConfig,
    state: &BitrateState,
    feedback: &BitrateFeedback,
) -> (BitrateState, BitrateDecision) {
    let alpha = config.smoothing_alpha;
    let loss_ratio = feedback.loss_ratio();
    let (smoothed_loss, smoothed_rtt_ms) = if state.samples == 0 {
        (loss_ratio, feedback.average_rtt_ms)
    } else {
        (
            ewma(state.smoothed_loss, loss_ratio, alpha),
            ewma(state.smoothed_rtt_ms, feedback.average_rtt_ms, alpha),
        )
    };

    let current = state.current_bitrate_bps;
    let (raw_target, reason) = if loss_ratio > config.loss_decrease_threshold {
        (
            (current as f64 * config.decrease_factor) as u64,
            format!(
                "loss {:.1}% above {:.1}%: multiplicative decrease",
                loss_ratio * 100.0,
                config.loss_decrease_threshold * 100.0
            ),
        )
    } else {
        let increased = current.saturating_add(config.increase_step_bps);
        if feedback.receive_rate_bps > 0.0 {
            let ceiling = (feedback.receive_rate_bps * config.receive_rate_headroom) as u64;
            let cap = ceiling.max(current);
            if increased > cap {
                (
                    cap,
                    format!(
                        "increase capped by receive rate {:.0} bps",
                        feedback.receive_rate_bps
                    ),
                )
            } else {
                (increased, "stable: additive increase".to_string())
            }
        } else {
            (increased, "stable: additive increase".to_string())
        }
    };

    let target = config.clamp(raw_target);
    let smoothed = current as f64 + alpha * (target as f64 - current as f64);
    let smoothed = if target < current {
        smoothed.floor()
    } else {
        smoothed.ceil()
    };
    let new_bitrate = config.clamp(smoothed.max(0.0) as u64);

    let next = BitrateState {
        current_bitrate_bps: new_bitrate,
        smoothed_rtt_ms,
        smoothed_loss,
        samples: state.samples + 1,
    };
    let decision = BitrateDecision {
        target_bitrate_bps: new_bitrate,
        previous_bitrate_bps: current,
        loss_ratio,
        changed: new_bitrate != current,
        reason,
    };
    (next, decision)
}

fn ewma(previous: f64, sample: f64, alpha: f64) -> f64 {
    previous + alpha * (sample - previous)
}

// ── Owner ─────────────────────────────────────────────────────────────────────

/// Holds a validated config and the running state.
#[derive(Debug, Clone)]
pub struct BitrateController {
    config: BitrateConfig,
    state: BitrateState,
}

impl BitrateController {
    /// # Errors
    ///
    /// Returns [`BitrateConfigError`] if `config` fails validation.
    pub fn new(config: BitrateConfig) -> Result<Self, BitrateConfigError> {
        config.validate()?;
        let state = BitrateState::initial(&config);
        Ok(Self { config, state })
    }

    pub fn on_feedback(&mut self, feedback: &BitrateFeedback) -> BitrateDecision {
        let (state, decision) = update(&self.config, &self.state, feedback);
        self.state = state;
        decision
    }

    pub fn current_bitrate_bps(&self) -> u64 {
        self.state.current_bitrate_bps
    }

    pub fn state(&self) -> &BitrateState {
        &self.state
    }

    pub fn config(&self) -> &BitrateConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lossy() -> BitrateFeedback {
        BitrateFeedback {
            average_rtt_ms: 80.0,
            total_messages_delta: 100,
            dropped_messages_delta: 10,
            receive_rate_bps: 0.0,
        }
    }

    fn clean() -> BitrateFeedback {
        BitrateFeedback {
            average_rtt_ms: 5.0,
            total_messages_delta: 100,
            dropped_messages_delta: 0,
            receive_rate_bps: 0.0,
        }
    }

    #[test]
    fn test_lossy_sample_strictly_decreases() {
        // Arrange
        let config = BitrateConfig::default();
        let state = BitrateState::initial(&config);

        // Act
        let (next, decision) = update(&config, &state, &lossy());

        // Assert
        assert!(decision.changed);
        assert_eq!(decision.target_bitrate_bps, 6_800_000);
        assert!(next.current_bitrate_bps < state.current_bitrate_bps);
        assert!((decision.loss_ratio - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_clean_sample_never_decreases() {
        let config = BitrateConfig::default();
        let state = BitrateState::initial(&config);

        let (next, decision) = update(&config, &state, &clean());

        assert_eq!(next.current_bitrate_bps, 8_500_000);
        assert!(decision.changed);
        assert!(decision.target_bitrate_bps >= decision.previous_bitrate_bps);
    }

    #[test]
    fn test_decrease_stays_strict_with_heavy_smoothing() {
        let config = BitrateConfig {
            smoothing_alpha: 0.01,
            ..BitrateConfig::default()
        };
        let state = BitrateState::initial(&config);

        let (next, _) = update(&config, &state, &lossy());

        assert!(next.current_bitrate_bps < 8_000_000);
        assert!(next.current_bitrate_bps > 6_800_000);
    }

    #[test]
    fn test_clamped_at_bounds_reports_unchanged() {
        let config = BitrateConfig {
            initial_bitrate_bps: 20_000_000,
            ..BitrateConfig::default()
        };
        let state = BitrateState::initial(&config);

        let (next, decision) = update(&config, &state, &clean());

        assert_eq!(next.current_bitrate_bps, 20_000_000);
        assert!(!decision.changed);
    }

    #[test]
    fn test_floor_is_respected_under_sustained_loss() {
        let mut controller = BitrateController::new(BitrateConfig::default()).unwrap();
        for _ in 0..100 {
            controller.on_feedback(&lossy());
        }
        assert_eq!(controller.current_bitrate_bps(), 1_000_000);
    }

    #[test]
    fn test_increase_capped_by_receive_rate_headroom() {
        // Arrange – receiver only sees 5 Mbps; 1.5x headroom = 7.5 Mbps < 8 Mbps current
        let config = BitrateConfig::default();
        let state = BitrateState::initial(&config);
        let feedback = BitrateFeedback {
            receive_rate_bps: 5_000_000.0,
            ..clean()
        };

        // Act
        let (next, decision) = update(&config, &state, &feedback);

        // Assert – no increase, but no decrease either
        assert_eq!(next.current_bitrate_bps, 8_000_000);
        assert!(!decision.changed);
        assert!(decision.reason.contains("receive rate"));
    }

    #[test]
    fn test_zero_total_delta_does_not_divide_by_zero() {
        let feedback = BitrateFeedback {
            total_messages_delta: 0,
            dropped_messages_delta: 0,
            ..clean()
        };
        assert_eq!(feedback.loss_ratio(), 0.0);
    }

    #[test]
    fn test_smoothed_loss_and_rtt_track_samples() {
        let config = BitrateConfig {
            smoothing_alpha: 0.5,
            ..BitrateConfig::default()
        };
        let state = BitrateState::initial(&config);

        let (s1, _) = update(&config, &state, &lossy());
        let (s2, _) = update(&config, &s1, &clean());

        assert!((s1.smoothed_loss - 0.1).abs() < 1e-9);
        assert!((s2.smoothed_loss - 0.05).abs() < 1e-9);
        assert!((s2.smoothed_rtt_ms - 42.5).abs() < 1e-9);
        assert_eq!(s2.samples, 2);
    }

    #[test]
    fn test_invalid_configs_are_rejected() {
        let bad_range = BitrateConfig {
            min_bitrate_bps: 10,
            max_bitrate_bps: 5,
            ..BitrateConfig::default()
        };
        assert!(matches!(
            BitrateController::new(bad_range),
            Err(BitrateConfigError::EmptyRange { .. })
        ));

        let bad_factor = BitrateConfig {
            decrease_factor: 1.0,
            ..BitrateConfig::default()
        };
        assert_eq!(bad_factor.validate(), Err(BitrateConfigError::DecreaseFactor(1.0)));

        let bad_alpha = BitrateConfig {
            smoothing_alpha: 0.0,
            ..BitrateConfig::default()
        };
        assert_eq!(bad_alpha.validate(), Err(BitrateConfigError::SmoothingAlpha(0.0)));
    }

    #[test]
    fn test_feedback_from_protocol_message() {
        let msg = ProtocolFeedbackMessage {
            timestamp: 1,
            average_rtt_ms: 12.5,
            total_messages: 1000,
            dropped_messages: 4,
            total_messages_delta: 50,
            dropped_messages_delta: 2,
            receive_rate_bps: 3.0e6,
        };
        let fb = BitrateFeedback::from(&msg);
        assert!((fb.loss_ratio() - 0.04).abs() < 1e-9);
        assert_eq!(fb.receive_rate_bps, 3.0e6);
    }
}
