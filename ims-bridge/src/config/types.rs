//! Configuration types for ims-bridge
//!
//! This module defines all configuration structures used by the bridge.
//! Configuration is loaded from JSON files and validated at startup. Every
//! section has defaults, so an empty object is a valid configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::control::CONTROL_HEADER_LEN;
use crate::error::ConfigError;
use crate::packet::ENVELOPE_LEN;

/// Largest block an envelope can describe
const MAX_BLOCK_SIZE: usize = u16::MAX as usize;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Block channels to the CP
    #[serde(default)]
    pub transport: TransportConfig,

    /// Data channel fragmentation
    #[serde(default)]
    pub codec: CodecConfig,

    /// Flow table sizing
    #[serde(default)]
    pub flows: FlowsConfig,

    /// Bridge behavior
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// IPC configuration
    #[serde(default)]
    pub ipc: IpcConfig,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.transport.validate()?;

        let capacity = self.transport.data.block_size - ENVELOPE_LEN;
        if self.codec.frag_size > capacity {
            return Err(ConfigError::ValidationError(format!(
                "codec.frag_size {} exceeds data block payload capacity {}",
                self.codec.frag_size, capacity
            )));
        }

        self.flows.validate()?;
        self.bridge.validate()?;
        self.ipc.validate()?;

        Ok(())
    }

    /// Create a default configuration
    #[must_use]
    pub fn default_config() -> Self {
        Self::default()
    }
}

/// One block channel
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChannelConfig {
    /// Local datagram socket
    pub socket_path: PathBuf,

    /// Peer datagram socket
    pub peer_path: PathBuf,

    /// Block size in bytes
    pub block_size: usize,

    /// Blocks in flight per direction
    pub block_count: usize,
}

impl ChannelConfig {
    fn validate(&self, name: &str, header_len: usize) -> Result<(), ConfigError> {
        if self.socket_path.as_os_str().is_empty() || self.peer_path.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "{name} channel socket paths cannot be empty"
            )));
        }
        if self.block_size <= header_len || self.block_size > MAX_BLOCK_SIZE {
            return Err(ConfigError::ValidationError(format!(
                "{name} block_size must be in {}..={MAX_BLOCK_SIZE}",
                header_len + 1
            )));
        }
        if self.block_count == 0 {
            return Err(ConfigError::ValidationError(format!(
                "{name} block_count must be greater than 0"
            )));
        }
        Ok(())
    }
}

/// Block channel configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    /// Control channel
    #[serde(default = "default_control_channel")]
    pub control: ChannelConfig,

    /// Data channel
    #[serde(default = "default_data_channel")]
    pub data: ChannelConfig,

    /// Pause after a receive error, in milliseconds
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Interval between peer reachability probes, in milliseconds
    #[serde(default = "default_peer_poll_ms")]
    pub peer_poll_ms: u64,
}

impl TransportConfig {
    /// Validate both channels
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.control.validate("control", CONTROL_HEADER_LEN)?;
        self.data.validate("data", ENVELOPE_LEN)?;
        if self.peer_poll_ms == 0 {
            return Err(ConfigError::ValidationError(
                "peer_poll_ms must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// Receive error backoff
    #[must_use]
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Peer probe interval
    #[must_use]
    pub fn peer_poll(&self) -> Duration {
        Duration::from_millis(self.peer_poll_ms)
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            control: default_control_channel(),
            data: default_data_channel(),
            retry_backoff_ms: default_retry_backoff_ms(),
            peer_poll_ms: default_peer_poll_ms(),
        }
    }
}

/// Data channel fragmentation
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CodecConfig {
    /// Largest chunk per data block; 0 uses the full block payload
    #[serde(default)]
    pub frag_size: usize,
}

/// Flow table sizing
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FlowsConfig {
    /// Hash buckets
    #[serde(default = "default_buckets")]
    pub buckets: usize,

    /// Maximum number of flow entries
    #[serde(default = "default_pool_capacity")]
    pub pool_capacity: usize,

    /// How long an add waits for a free entry, in milliseconds
    ///
    /// The wait parks the calling thread, which may be a runtime worker,
    /// so it is capped at [`MAX_POOL_WAIT_MS`].
    #[serde(default = "default_pool_wait_ms")]
    pub pool_wait_ms: u64,
}

/// Upper bound for `flows.pool_wait_ms`
pub const MAX_POOL_WAIT_MS: u64 = 200;

impl FlowsConfig {
    /// Validate sizing
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buckets == 0 {
            return Err(ConfigError::ValidationError(
                "flows.buckets must be greater than 0".into(),
            ));
        }
        if self.pool_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "flows.pool_capacity must be greater than 0".into(),
            ));
        }
        if self.pool_wait_ms > MAX_POOL_WAIT_MS {
            return Err(ConfigError::ValidationError(format!(
                "flows.pool_wait_ms must be at most {MAX_POOL_WAIT_MS}"
            )));
        }
        Ok(())
    }

    /// Pool wait as a duration
    #[must_use]
    pub fn pool_wait(&self) -> Duration {
        Duration::from_millis(self.pool_wait_ms)
    }
}

impl Default for FlowsConfig {
    fn default() -> Self {
        Self {
            buckets: default_buckets(),
            pool_capacity: default_pool_capacity(),
            pool_wait_ms: default_pool_wait_ms(),
        }
    }
}

/// Bridge behavior
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BridgeConfig {
    /// Number of SIM cards
    #[serde(default = "default_sim_count")]
    pub sim_count: u32,

    /// Firewall mark for packets injected into the input path
    #[serde(default)]
    pub vowifi_in_mark: u32,

    /// Value announced with `ltevideo-apsk` when the peer comes up
    #[serde(default = "default_volte_video_apsk")]
    pub volte_video_apsk: u32,
}

impl BridgeConfig {
    /// Validate bridge settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Tuple records carry the SIM index in one byte
        if self.sim_count == 0 || self.sim_count > u32::from(u8::MAX) {
            return Err(ConfigError::ValidationError(
                "bridge.sim_count must be in 1..=255".into(),
            ));
        }
        Ok(())
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            sim_count: default_sim_count(),
            vowifi_in_mark: 0,
            volte_video_apsk: default_volte_video_apsk(),
        }
    }
}

/// IPC configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IpcConfig {
    /// Path to Unix socket
    #[serde(default = "default_ipc_socket")]
    pub socket_path: PathBuf,

    /// Socket file mode (octal, e.g., 0o660)
    #[serde(default = "default_socket_mode")]
    pub socket_mode: u32,

    /// Enable IPC server
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum message size in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

impl IpcConfig {
    /// Validate IPC configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled && self.socket_path.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "IPC socket path cannot be empty when IPC is enabled".into(),
            ));
        }

        if self.max_message_size == 0 {
            return Err(ConfigError::ValidationError(
                "max_message_size must be greater than 0".into(),
            ));
        }

        Ok(())
    }
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            socket_path: default_ipc_socket(),
            socket_mode: default_socket_mode(),
            enabled: true,
            max_message_size: default_max_message_size(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Include timestamps
    #[serde(default = "default_true")]
    pub timestamps: bool,

    /// Include target (module path)
    #[serde(default = "default_true")]
    pub target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            timestamps: true,
            target: true,
        }
    }
}

fn default_control_channel() -> ChannelConfig {
    ChannelConfig {
        socket_path: PathBuf::from("/var/run/ims-bridge/control.sock"),
        peer_path: PathBuf::from("/var/run/ims-bridge/control-peer.sock"),
        block_size: 256,
        block_count: 64,
    }
}

fn default_data_channel() -> ChannelConfig {
    ChannelConfig {
        socket_path: PathBuf::from("/var/run/ims-bridge/data.sock"),
        peer_path: PathBuf::from("/var/run/ims-bridge/data-peer.sock"),
        block_size: 1600,
        block_count: 128,
    }
}

const fn default_retry_backoff_ms() -> u64 {
    20
}

const fn default_peer_poll_ms() -> u64 {
    100
}

const fn default_buckets() -> usize {
    512
}

const fn default_pool_capacity() -> usize {
    256
}

const fn default_pool_wait_ms() -> u64 {
    50
}

const fn default_sim_count() -> u32 {
    2
}

const fn default_volte_video_apsk() -> u32 {
    1
}

const fn default_true() -> bool {
    true
}

fn default_ipc_socket() -> PathBuf {
    PathBuf::from("/var/run/ims-bridge.sock")
}

const fn default_socket_mode() -> u32 {
    0o660
}

const fn default_max_message_size() -> usize {
    1024 * 1024
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "json".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let config = Config::default_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.flows.buckets, 512);
        assert_eq!(config.bridge.sim_count, 2);
        assert_eq!(config.transport.retry_backoff(), Duration::from_millis(20));
    }

    #[test]
    fn test_empty_json_uses_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.transport.control.block_size, 256);
        assert_eq!(config.transport.data.block_size, 1600);
        assert_eq!(config.bridge.volte_video_apsk, 1);
        assert!(config.ipc.enabled);
    }

    #[test]
    fn test_channel_validation() {
        let mut config = Config::default_config();
        config.transport.control.block_size = CONTROL_HEADER_LEN;
        assert!(config.validate().is_err());

        let mut config = Config::default_config();
        config.transport.data.block_count = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default_config();
        config.transport.data.block_size = 70_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_frag_size_validation() {
        let mut config = Config::default_config();
        config.codec.frag_size = config.transport.data.block_size - ENVELOPE_LEN;
        assert!(config.validate().is_ok());
        config.codec.frag_size += 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sim_count_validation() {
        let mut config = Config::default_config();
        config.bridge.sim_count = 0;
        assert!(config.validate().is_err());
        config.bridge.sim_count = 256;
        assert!(config.validate().is_err());
        config.bridge.sim_count = 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_pool_wait_is_capped() {
        let mut config = Config::default_config();
        config.flows.pool_wait_ms = MAX_POOL_WAIT_MS;
        assert!(config.validate().is_ok());
        config.flows.pool_wait_ms = MAX_POOL_WAIT_MS + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ipc_config_validation() {
        let mut ipc = IpcConfig::default();
        assert!(ipc.validate().is_ok());
        ipc.socket_path = PathBuf::new();
        assert!(ipc.validate().is_err());
        ipc.enabled = false;
        assert!(ipc.validate().is_ok());
        ipc.max_message_size = 0;
        assert!(ipc.validate().is_err());
    }
}
