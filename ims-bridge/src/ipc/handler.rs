//! IPC command handler
//!
//! This module processes IPC commands and generates responses.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::protocol::{ErrorCode, IpcCommand, IpcResponse};
use crate::bridge::ImsBridge;
use crate::error::{ApiError, BridgeError};

/// IPC command handler
pub struct IpcHandler {
    /// The bridge every command is applied to
    bridge: Arc<ImsBridge>,
}

impl IpcHandler {
    /// Create a new IPC handler
    pub fn new(bridge: Arc<ImsBridge>) -> Self {
        Self { bridge }
    }

    /// Handle an IPC command and return a response
    pub async fn handle(&self, command: IpcCommand) -> IpcResponse {
        debug!("Handling IPC command: {:?}", command);

        match command {
            IpcCommand::Ping => IpcResponse::Pong,

            IpcCommand::SetCallState { call_state, sim } => {
                match self.bridge.set_call_state(call_state, sim) {
                    Ok(state) => IpcResponse::Handover { state },
                    Err(e) => error_response(&e),
                }
            }

            IpcCommand::AddTuple { record } => match self.bridge.add_tuple(&record) {
                Ok(()) => IpcResponse::success(),
                Err(e) => error_response(&e),
            },

            IpcCommand::DelTuple { record } => match self.bridge.del_tuple(&record) {
                Ok(true) => IpcResponse::success(),
                Ok(false) => IpcResponse::success_with_message("no matching flow"),
                Err(e) => error_response(&e),
            },

            IpcCommand::ResetTuples { sim } => match self.bridge.reset_tuples(sim) {
                Ok(removed) => IpcResponse::success_with_message(format!("{removed} flows removed")),
                Err(e) => error_response(&e),
            },

            IpcCommand::LocalMac { mac } => self.handle_mac(&mac, true),

            IpcCommand::RemoteMac { mac } => self.handle_mac(&mac, false),

            IpcCommand::SetLowPower { state } => match self.bridge.set_low_power(state) {
                Ok(()) => IpcResponse::success(),
                Err(e) => error_response(&e),
            },

            IpcCommand::AddSpi { spi } => match self.bridge.add_spi(spi) {
                Ok(()) => IpcResponse::success(),
                Err(e) => error_response(&e),
            },

            IpcCommand::DelSpi { spi } => match self.bridge.del_spi(spi) {
                Ok(()) => IpcResponse::success(),
                Err(e) => error_response(&e),
            },

            IpcCommand::EchoPing { text } => match self.bridge.echo_ping(&text) {
                Ok(()) => IpcResponse::success(),
                Err(e) => error_response(&e),
            },

            IpcCommand::ListFlows => IpcResponse::Flows {
                flows: self.bridge.flows(),
            },

            IpcCommand::GetStats => IpcResponse::Stats(self.bridge.stats()),
        }
    }

    fn handle_mac(&self, mac: &str, local: bool) -> IpcResponse {
        let Some(addr) = parse_mac(mac) else {
            return IpcResponse::error(
                ErrorCode::InvalidParameters,
                format!("Invalid MAC address '{mac}'"),
            );
        };

        let result = if local {
            self.bridge.send_local_mac(addr)
        } else {
            self.bridge.send_remote_mac(addr)
        };

        match result {
            Ok(()) => {
                info!(mac, local, "MAC address pushed to CP");
                IpcResponse::success()
            }
            Err(e) => error_response(&e),
        }
    }
}

/// Map a bridge error onto the IPC error code a client can act on
fn error_code(err: &BridgeError) -> ErrorCode {
    match err {
        BridgeError::Api(api) => match api {
            ApiError::SpiExists(_) => ErrorCode::AlreadyExists,
            ApiError::SpiNotFound(_) => ErrorCode::NotFound,
            ApiError::EspTableFull(_) => ErrorCode::ResourceExhausted,
            ApiError::InvalidSimCard { .. }
            | ApiError::InvalidTuple(_)
            | ApiError::InvalidCallState(_)
            | ApiError::InvalidLowPowerState(_)
            | ApiError::InvalidSpi(_) => ErrorCode::InvalidParameters,
        },
        BridgeError::Flow(_) => ErrorCode::ResourceExhausted,
        BridgeError::Protocol(_) => ErrorCode::InvalidParameters,
        BridgeError::Transport(_) => ErrorCode::OperationFailed,
        BridgeError::Config(_) | BridgeError::Ipc(_) | BridgeError::Io(_) => {
            ErrorCode::InternalError
        }
    }
}

fn error_response(err: &BridgeError) -> IpcResponse {
    let code = error_code(err);
    if code == ErrorCode::OperationFailed {
        warn!("IPC command failed: {}", err);
    }
    IpcResponse::error(code, err.to_string())
}

/// Parse `aa:bb:cc:dd:ee:ff` (or `-` separated)
fn parse_mac(s: &str) -> Option<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut parts = s.split(|c| c == ':' || c == '-');
    for byte in &mut mac {
        let part = parts.next()?;
        if part.len() != 2 {
            return None;
        }
        *byte = u8::from_str_radix(part, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(mac)
}
