//! IPC (Inter-Process Communication) module
//!
//! This module provides a Unix socket-based IPC server through which the
//! local control plane drives the bridge: call state, AP flows, MAC
//! addresses, low power and ESP tracking.
//!
//! # Protocol
//!
//! Messages are length-prefixed JSON:
//! - 4 bytes: message length (big-endian u32)
//! - N bytes: JSON-encoded command or response
//!
//! # Example
//!
//! ```no_run
//! use ims_bridge::handover::CallState;
//! use ims_bridge::ipc::{IpcClient, IpcCommand, IpcResponse};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = IpcClient::new("/var/run/ims-bridge.sock");
//!
//! // Check if server is alive
//! if client.ping().await? {
//!     println!("Bridge is alive!");
//! }
//!
//! let response = client
//!     .send(IpcCommand::SetCallState {
//!         call_state: CallState::VoWifi,
//!         sim: 0,
//!     })
//!     .await?;
//! if let IpcResponse::Handover { state } = response {
//!     println!("Handover state: {state:?}");
//! }
//! # Ok(())
//! # }
//! ```

mod handler;
mod protocol;
mod server;

pub use handler::IpcHandler;
pub use protocol::{
    decode_message, encode_message, ErrorCode, IpcCommand, IpcError, IpcResponse,
    LENGTH_PREFIX_SIZE, MAX_MESSAGE_SIZE,
};
pub use server::{IpcClient, IpcServer};
