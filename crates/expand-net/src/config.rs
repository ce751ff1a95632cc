//! Session configuration, loadable from TOML.
//!
//! Every field has a serde default, so a partial document (or an empty one)
//! produces a working configuration.  Example:
//!
//! ```toml
//! shutdown_timeout_ms = 2000
//!
//! [sender]
//! max_queue_depth = 64
//!
//! [heartbeat]
//! interval_ms = 1000
//! timeout_ms = 5000
//!
//! [fec]
//! enabled = true
//! data_shards = 8
//! parity_shards = 2
//!
//! [bitrate]
//! initial_bitrate_bps = 8000000
//! decrease_factor = 0.85
//! ```
//!
//! Durations are stored as integer milliseconds and read back through the
//! `Duration`-returning accessors.

use std::path::{Path, PathBuf};
use std::time::Duration;

use expand_core::domain::bitrate::BitrateConfig;
use expand_core::protocol::DEFAULT_MAX_PAYLOAD_SIZE;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// The values parse but cannot work together.
    #[error("invalid config: {0}")]
    Invalid(String),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level configuration for one [`Session`](crate::Session).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    #[serde(default)]
    pub sender: SenderConfig,
    #[serde(default)]
    pub receiver: ReceiverConfig,
    #[serde(default)]
    pub handshake: HandshakeConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub fec: FecConfig,
    #[serde(default)]
    pub bitrate: BitrateSettings,
    #[serde(default)]
    pub feedback: FeedbackConfig,
    /// Upper bound on how long teardown waits for each background loop.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    /// Send a KeyFrameRequest when a FEC group cannot be recovered.
    #[serde(default = "default_true")]
    pub request_key_frame_on_loss: bool,
}

/// Outbound queue and drain loop settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SenderConfig {
    /// Bound of the media queue; the oldest entry is evicted on overflow.
    #[serde(default = "default_max_queue_depth")]
    pub max_queue_depth: usize,
    /// Bound of the separate queue for handshake and heartbeat traffic.
    #[serde(default = "default_max_critical_queue_depth")]
    pub max_critical_queue_depth: usize,
    /// A single write that takes longer than this counts as a failure.
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    /// Pause after a transient write failure before the next attempt.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Consecutive failed writes after which the connection is given up.
    #[serde(default = "default_max_consecutive_write_failures")]
    pub max_consecutive_write_failures: u32,
}

/// Inbound read loop settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReceiverConfig {
    /// Headers announcing a larger payload end the read loop.
    #[serde(default = "default_max_payload_size")]
    pub max_payload_size: usize,
    /// Pause after a transient read error.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HandshakeConfig {
    /// Default wait for a HandshakeAck.
    #[serde(default = "default_handshake_timeout_ms")]
    pub timeout_ms: u64,
    /// Reported to clients in HandshakeAck.
    #[serde(default = "default_server_version")]
    pub server_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatConfig {
    #[serde(default = "default_heartbeat_interval_ms")]
    pub interval_ms: u64,
    /// Silence (no Heartbeat or HeartbeatAck) longer than this is a timeout.
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub timeout_ms: u64,
}

/// Forward error correction for outbound frame groups.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FecConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_data_shards")]
    pub data_shards: u8,
    #[serde(default = "default_parity_shards")]
    pub parity_shards: u8,
    /// Groups awaiting metadata or parity before the oldest is dropped.
    #[serde(default = "default_max_pending_groups")]
    pub max_pending_groups: usize,
}

/// Adaptive bitrate controller settings plus an on/off switch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BitrateSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(flatten)]
    pub controller: BitrateConfig,
}

/// Periodic ProtocolFeedback emission from the receiving side.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FeedbackConfig {
    #[serde(default)]
    pub enabled: bool,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_true() -> bool {
    true
}
fn default_shutdown_timeout_ms() -> u64 {
    2_000
}
fn default_max_queue_depth() -> usize {
    64
}
fn default_max_critical_queue_depth() -> usize {
    32
}
fn default_write_timeout_ms() -> u64 {
    5_000
}
fn default_retry_delay_ms() -> u64 {
    20
}
fn default_max_consecutive_write_failures() -> u32 {
    3
}
fn default_max_payload_size() -> usize {
    DEFAULT_MAX_PAYLOAD_SIZE
}
fn default_handshake_timeout_ms() -> u64 {
    5_000
}
fn default_server_version() -> String {
    "1.0.0".to_string()
}
fn default_heartbeat_interval_ms() -> u64 {
    1_000
}
fn default_heartbeat_timeout_ms() -> u64 {
    5_000
}
fn default_data_shards() -> u8 {
    8
}
fn default_parity_shards() -> u8 {
    2
}
fn default_max_pending_groups() -> usize {
    16
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sender: SenderConfig::default(),
            receiver: ReceiverConfig::default(),
            handshake: HandshakeConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            fec: FecConfig::default(),
            bitrate: BitrateSettings::default(),
            feedback: FeedbackConfig::default(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            request_key_frame_on_loss: default_true(),
        }
    }
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            max_queue_depth: default_max_queue_depth(),
            max_critical_queue_depth: default_max_critical_queue_depth(),
            write_timeout_ms: default_write_timeout_ms(),
            retry_delay_ms: default_retry_delay_ms(),
            max_consecutive_write_failures: default_max_consecutive_write_failures(),
        }
    }
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            max_payload_size: default_max_payload_size(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_handshake_timeout_ms(),
            server_version: default_server_version(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval_ms(),
            timeout_ms: default_heartbeat_timeout_ms(),
        }
    }
}

impl Default for FecConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            data_shards: default_data_shards(),
            parity_shards: default_parity_shards(),
            max_pending_groups: default_max_pending_groups(),
        }
    }
}

impl Default for BitrateSettings {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            controller: BitrateConfig::default(),
        }
    }
}

// ── Duration accessors ────────────────────────────────────────────────────────

impl SessionConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl SenderConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl ReceiverConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl HandshakeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

// ── Loading and validation ────────────────────────────────────────────────────

impl SessionConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] for malformed TOML, [`ConfigError::Invalid`] for
    /// values that fail [`validate`](Self::validate).
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: SessionConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates the TOML file at `path`.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Io`] when the file cannot be read, otherwise as
    /// [`from_toml_str`](Self::from_toml_str).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::Serialize`] if serialization fails.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Checks that the values can work together.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sender.max_queue_depth == 0 || self.sender.max_critical_queue_depth == 0 {
            return Err(ConfigError::Invalid(
                "sender queue depths must be at least 1".to_string(),
            ));
        }
        if self.sender.max_consecutive_write_failures == 0 {
            return Err(ConfigError::Invalid(
                "max_consecutive_write_failures must be at least 1".to_string(),
            ));
        }
        if self.receiver.max_payload_size > u32::MAX as usize {
            return Err(ConfigError::Invalid(format!(
                "max_payload_size {} exceeds the 32-bit length field",
                self.receiver.max_payload_size
            )));
        }
        if self.heartbeat.interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat interval must be non-zero".to_string(),
            ));
        }
        if self.heartbeat.timeout_ms <= self.heartbeat.interval_ms {
            return Err(ConfigError::Invalid(format!(
                "heartbeat timeout {}ms must exceed the interval {}ms",
                self.heartbeat.timeout_ms, self.heartbeat.interval_ms
            )));
        }
        let shards = self.fec.data_shards as usize + self.fec.parity_shards as usize;
        if self.fec.data_shards == 0 || self.fec.parity_shards == 0 || shards > 256 {
            return Err(ConfigError::Invalid(format!(
                "FEC needs 1 <= k, 1 <= m, k + m <= 256 (got k={}, m={})",
                self.fec.data_shards, self.fec.parity_shards
            )));
        }
        self.bitrate
            .controller
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_matches_documented_values() {
        // Arrange / Act
        let cfg = SessionConfig::default();

        // Assert
        assert_eq!(cfg.sender.max_queue_depth, 64);
        assert_eq!(cfg.sender.max_critical_queue_depth, 32);
        assert_eq!(cfg.receiver.max_payload_size, 16 * 1024 * 1024);
        assert_eq!(cfg.heartbeat.interval(), Duration::from_secs(1));
        assert_eq!(cfg.heartbeat.timeout(), Duration::from_secs(5));
        assert_eq!(cfg.handshake.timeout(), Duration::from_secs(5));
        assert!(!cfg.fec.enabled);
        assert_eq!((cfg.fec.data_shards, cfg.fec.parity_shards), (8, 2));
        assert!(cfg.bitrate.enabled);
        assert_eq!(cfg.bitrate.controller.initial_bitrate_bps, 8_000_000);
        assert!(!cfg.feedback.enabled);
        assert_eq!(cfg.shutdown_timeout(), Duration::from_secs(2));
        assert!(cfg.request_key_frame_on_loss);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_empty_toml_yields_defaults() {
        let cfg = SessionConfig::from_toml_str("").expect("empty document");
        assert_eq!(cfg, SessionConfig::default());
    }

    #[test]
    fn test_partial_sections_override_only_named_fields() {
        // Arrange
        let toml_str = r#"
shutdown_timeout_ms = 500

[sender]
max_queue_depth = 8

[fec]
enabled = true
parity_shards = 3

[bitrate]
enabled = false
decrease_factor = 0.5
"#;

        // Act
        let cfg = SessionConfig::from_toml_str(toml_str).expect("deserialize partial");

        // Assert
        assert_eq!(cfg.shutdown_timeout_ms, 500);
        assert_eq!(cfg.sender.max_queue_depth, 8);
        assert_eq!(cfg.sender.max_critical_queue_depth, 32);
        assert!(cfg.fec.enabled);
        assert_eq!(cfg.fec.data_shards, 8);
        assert_eq!(cfg.fec.parity_shards, 3);
        assert!(!cfg.bitrate.enabled);
        assert_eq!(cfg.bitrate.controller.decrease_factor, 0.5);
        assert_eq!(cfg.bitrate.controller.min_bitrate_bps, 1_000_000);
    }

    #[test]
    fn test_toml_round_trip() {
        let mut cfg = SessionConfig::default();
        cfg.heartbeat.interval_ms = 250;
        cfg.feedback.enabled = true;
        cfg.handshake.server_version = "2.1.0".to_string();

        let text = cfg.to_toml_string().expect("serialize");
        let restored = SessionConfig::from_toml_str(&text).expect("deserialize");

        assert_eq!(cfg, restored);
    }

    #[test]
    fn test_invalid_toml_is_a_parse_error() {
        let err = SessionConfig::from_toml_str("[[[ not valid toml").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_validation_rejects_heartbeat_timeout_not_above_interval() {
        let toml_str = "[heartbeat]\ninterval_ms = 1000\ntimeout_ms = 1000\n";
        let err = SessionConfig::from_toml_str(toml_str).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(ref m) if m.contains("heartbeat")));
    }

    #[test]
    fn test_validation_rejects_zero_parity() {
        let mut cfg = SessionConfig::default();
        cfg.fec.parity_shards = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validation_rejects_bad_bitrate_controller() {
        let mut cfg = SessionConfig::default();
        cfg.bitrate.controller.smoothing_alpha = 2.0;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(ref m)) if m.contains("alpha")));
    }

    #[test]
    fn test_load_reports_missing_file_with_path() {
        let path = PathBuf::from("/nonexistent/path/that/cannot/exist/session.toml");
        let err = SessionConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Io { path: ref p, .. } if *p == path));
    }

    #[test]
    fn test_load_reads_file_from_disk() {
        // Arrange
        let dir = std::env::temp_dir().join(format!("expand_test_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("session.toml");
        std::fs::write(&path, "[receiver]\nmax_payload_size = 4096\n").unwrap();

        // Act
        let cfg = SessionConfig::load(&path).expect("load");

        // Assert
        assert_eq!(cfg.receiver.max_payload_size, 4096);

        // Cleanup
        std::fs::remove_dir_all(&dir).ok();
    }
}
