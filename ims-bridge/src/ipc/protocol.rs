//! IPC protocol definitions
//!
//! Commands and responses exchanged over the management socket, serialized
//! as internally tagged JSON (`{"type": "add_spi", "spi": 4660}`).

use serde::{Deserialize, Serialize};

use crate::bridge::LowPowerState;
use crate::flow::{FlowInfo, TupleRecord};
use crate::handover::{CallState, HandoverState};
use crate::stats::StatsSnapshot;

/// IPC command types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcCommand {
    /// Health check
    Ping,

    /// Report a call state change on a SIM
    SetCallState {
        /// `end`, `vowifi` or `volte`
        call_state: CallState,
        /// SIM card index
        sim: u32,
    },

    /// Register an AP flow
    AddTuple {
        /// Flow registration
        record: TupleRecord,
    },

    /// Remove an AP flow
    DelTuple {
        /// Flow registration to remove
        record: TupleRecord,
    },

    /// Remove every AP flow on a SIM
    ResetTuples {
        /// SIM card index
        sim: u32,
    },

    /// Push the local MAC address to the CP
    LocalMac {
        /// `aa:bb:cc:dd:ee:ff`
        mac: String,
    },

    /// Push the gateway MAC address to the CP
    RemoteMac {
        /// `aa:bb:cc:dd:ee:ff`
        mac: String,
    },

    /// Enter or leave low power
    SetLowPower {
        /// `start` or `end`
        state: LowPowerState,
    },

    /// Start tracking an ESP SPI
    AddSpi {
        /// Security parameter index
        spi: u32,
    },

    /// Stop tracking an ESP SPI
    DelSpi {
        /// Security parameter index
        spi: u32,
    },

    /// Send a liveness probe over the control channel
    EchoPing {
        /// Text echoed back by the CP
        #[serde(default)]
        text: String,
    },

    /// List registered flows
    ListFlows,

    /// Get counters and per-SIM state
    GetStats,
}

impl IpcCommand {
    /// Wire name of the command, as in the `type` tag
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::SetCallState { .. } => "set_call_state",
            Self::AddTuple { .. } => "add_tuple",
            Self::DelTuple { .. } => "del_tuple",
            Self::ResetTuples { .. } => "reset_tuples",
            Self::LocalMac { .. } => "local_mac",
            Self::RemoteMac { .. } => "remote_mac",
            Self::SetLowPower { .. } => "set_low_power",
            Self::AddSpi { .. } => "add_spi",
            Self::DelSpi { .. } => "del_spi",
            Self::EchoPing { .. } => "echo_ping",
            Self::ListFlows => "list_flows",
            Self::GetStats => "get_stats",
        }
    }
}

/// IPC response types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcResponse {
    /// Pong response to ping
    Pong,

    /// Operation completed
    Success {
        /// Optional detail
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// Handover state after a call state change
    Handover {
        /// Resulting handover state for the SIM
        state: HandoverState,
    },

    /// Registered flows
    Flows {
        /// Flows in table order
        flows: Vec<FlowInfo>,
    },

    /// Counters and per-SIM state
    Stats(StatsSnapshot),

    /// Error response
    Error(IpcError),
}

impl IpcResponse {
    /// Create a success response
    pub fn success() -> Self {
        Self::Success { message: None }
    }

    /// Create a success response with message
    pub fn success_with_message(message: impl Into<String>) -> Self {
        Self::Success {
            message: Some(message.into()),
        }
    }

    /// Create an error response
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error(IpcError {
            code,
            message: message.into(),
        })
    }

    /// Check if this is an error response
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

/// IPC error details
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcError {
    /// Error code
    pub code: ErrorCode,
    /// Error message
    pub message: String,
}

impl std::fmt::Display for IpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for IpcError {}

/// Error codes for IPC responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Invalid command
    InvalidCommand,
    /// Invalid parameters
    InvalidParameters,
    /// Resource not found
    NotFound,
    /// Resource already exists
    AlreadyExists,
    /// Operation failed
    OperationFailed,
    /// No room left (flow pool or ESP table)
    ResourceExhausted,
    /// Internal error
    InternalError,
}

/// Message framing for IPC
///
/// Messages are length-prefixed:
/// - 4 bytes: message length (big-endian u32)
/// - N bytes: JSON message
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024; // 1 MB
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Encode a message with length prefix
///
/// # Errors
///
/// Returns the serializer error if `msg` cannot be encoded.
#[allow(clippy::cast_possible_truncation)]
pub fn encode_message<T: Serialize>(msg: &T) -> Result<Vec<u8>, serde_json::Error> {
    let json = serde_json::to_vec(msg)?;
    let len = json.len() as u32;

    let mut buf = Vec::with_capacity(LENGTH_PREFIX_SIZE + json.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&json);

    Ok(buf)
}

/// Decode the JSON body of a length-prefixed message
///
/// # Errors
///
/// Returns the deserializer error if `data` is not a valid message.
pub fn decode_message<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, serde_json::Error> {
    serde_json::from_slice(data)
}
