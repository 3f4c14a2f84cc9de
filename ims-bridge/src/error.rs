//! Error types for ims-bridge
//!
//! This module defines the error hierarchy for the packet bridge.
//! Errors are grouped by subsystem and carry recovery hints. Most data-path
//! failures never surface as errors at all: they are counted in
//! [`crate::stats::BridgeStats`] and the packet is dropped.

use std::io;

use thiserror::Error;

/// Top-level error type for ims-bridge
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Block channel errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Wire format violations on the control or data channel
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Flow table errors
    #[error("Flow error: {0}")]
    Flow(#[from] FlowError),

    /// Rejected management requests
    #[error("API error: {0}")]
    Api(#[from] ApiError),

    /// IPC communication errors
    #[error("IPC error: {0}")]
    Ipc(#[from] IpcError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl BridgeError {
    /// Check if this error is recoverable (can retry operation)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) | Self::Api(_) => false,
            Self::Transport(e) => e.is_recoverable(),
            Self::Protocol(_) => false,
            Self::Flow(e) => e.is_recoverable(),
            Self::Ipc(e) => e.is_recoverable(),
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, inconsistent sizes)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

/// Block channel errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// No free transmit block is available right now
    #[error("No free block on {channel} channel")]
    NoBlock { channel: String },

    /// Payload does not fit in a block
    #[error("Payload of {len} bytes exceeds {channel} block capacity {capacity}")]
    BlockOverflow {
        channel: String,
        len: usize,
        capacity: usize,
    },

    /// Handing a block to the peer failed
    #[error("Send on {channel} channel failed: {reason}")]
    SendFailed { channel: String, reason: String },

    /// Receiving a block failed
    #[error("Receive on {channel} channel failed: {reason}")]
    ReceiveFailed { channel: String, reason: String },

    /// The peer end is gone
    #[error("{channel} channel closed")]
    Closed { channel: String },

    /// Underlying socket error
    #[error("Channel I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::NoBlock { .. } | Self::SendFailed { .. } | Self::ReceiveFailed { .. }
        )
    }

    /// Create a send failure
    pub fn send_failed(channel: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SendFailed {
            channel: channel.into(),
            reason: reason.into(),
        }
    }

    /// Create a receive failure
    pub fn receive_failed(channel: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ReceiveFailed {
            channel: channel.into(),
            reason: reason.into(),
        }
    }
}

/// Wire format violations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Header version does not match ours
    #[error("Version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u16, actual: u16 },

    /// Declared payload length disagrees with the block length
    #[error("Length mismatch: header says {declared} bytes, block carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    /// Buffer shorter than the structure being decoded
    #[error("Truncated {what}: {len} bytes, need {need}")]
    Truncated {
        what: &'static str,
        len: usize,
        need: usize,
    },

    /// Payload larger than the channel allows
    #[error("Payload of {len} bytes exceeds maximum {max}")]
    PayloadTooLarge { len: usize, max: usize },

    /// Command name does not fit the fixed header field
    #[error("Command name '{0}' is too long")]
    CommandTooLong(String),

    /// Command name is not valid text
    #[error("Command name is not valid UTF-8")]
    InvalidCommand,

    /// Fragment extends past the declared packet length
    #[error("Fragment at offset {offset} with {len} bytes exceeds total length {total}")]
    FragmentOutOfRange { offset: usize, len: usize, total: usize },

    /// Fragment arrived without a preceding offset-0 fragment
    #[error("Fragment at offset {offset} has no reassembly context")]
    OrphanFragment { offset: usize },

    /// Fragment offset does not continue the current context
    #[error("Fragment offset {actual} does not follow {expected} bytes received")]
    NonMonotonicOffset { expected: usize, actual: usize },

    /// Fragment declares a different total than the context it continues
    #[error("Fragment total length {actual} differs from context total {expected}")]
    TotalLengthMismatch { expected: usize, actual: usize },

    /// A field holds a value outside its enumeration
    #[error("Invalid {field} value {value}")]
    InvalidField { field: &'static str, value: u32 },
}

/// Flow table errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FlowError {
    /// No entry could be taken from the flow pool in time
    #[error("Flow pool exhausted ({capacity} entries)")]
    PoolExhausted { capacity: usize },
}

impl FlowError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::PoolExhausted { .. })
    }
}

/// Rejected management requests
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ApiError {
    /// SIM index beyond the configured SIM count
    #[error("Invalid SIM card {sim} (have {count})")]
    InvalidSimCard { sim: u32, count: u32 },

    /// Tuple record failed validation
    #[error("Invalid tuple: {0}")]
    InvalidTuple(String),

    /// Call state outside the known set
    #[error("Invalid call state: {0}")]
    InvalidCallState(String),

    /// Low-power state outside the known set
    #[error("Invalid low-power state: {0}")]
    InvalidLowPowerState(String),

    /// SPI of zero is reserved
    #[error("Invalid SPI 0x{0:08x}")]
    InvalidSpi(u32),

    /// SPI already tracked
    #[error("SPI 0x{0:08x} already exists")]
    SpiExists(u32),

    /// SPI not tracked
    #[error("SPI 0x{0:08x} not found")]
    SpiNotFound(u32),

    /// All ESP slots are in use
    #[error("ESP table full ({0} slots)")]
    EspTableFull(usize),
}

/// IPC-related errors
#[derive(Debug, Error)]
pub enum IpcError {
    /// Failed to create Unix socket
    #[error("Failed to create IPC socket at {path}: {reason}")]
    SocketCreation { path: String, reason: String },

    /// Failed to bind Unix socket
    #[error("Failed to bind IPC socket to {path}: {reason}")]
    BindError { path: String, reason: String },

    /// Connection error
    #[error("IPC connection error: {0}")]
    ConnectionError(String),

    /// Protocol error (invalid message format)
    #[error("IPC protocol error: {0}")]
    ProtocolError(String),

    /// Serialization error
    #[error("IPC serialization error: {0}")]
    SerializationError(String),

    /// I/O error
    #[error("IPC I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl IpcError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::SocketCreation { .. } | Self::BindError { .. } => false,
            Self::ConnectionError(_) | Self::ProtocolError(_) => true,
            Self::SerializationError(_) => false,
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
            ),
        }
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::ProtocolError(msg.into())
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::SerializationError(msg.into())
    }
}

/// Result type alias using `BridgeError`
pub type Result<T> = std::result::Result<T, BridgeError>;
