//! ims-bridge: In-device IMS packet bridge
//!
//! This crate moves IMS traffic (SIP, RTP/RTCP, IKE/ESP) between the
//! application processor (AP) network stack and the cellular processor (CP)
//! over two block channels, deciding per packet whether the flow belongs to
//! the other side and following call handover between Wi-Fi and LTE.
//!
//! # Features
//!
//! - **Flow registry**: lock-free 5-tuple matching with wildcard ports
//! - **Fragmentation**: packets larger than a data block are split and
//!   reassembled transparently
//! - **Control protocol**: named command messages in both directions
//! - **Handover tracking**: per-SIM call legs decide which side owns a flow
//! - **IPC Control**: Unix socket-based runtime control
//!
//! # Architecture
//!
//! ```text
//! host ingress/egress ──► Router ──► PacketCodec ──► data channel ──► CP
//!                           ▲                                          │
//! host stack ◄── Router ◄── PacketCodec ◄────────── data channel ◄─────┘
//!
//! IPC ──► ImsBridge ──► ControlSender ──► control channel ──► CP
//!                        ControlDispatcher ◄── control channel ◄── CP
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use ims_bridge::config::load_config;
//! use ims_bridge::channel::UnixBlockChannel;
//! use ims_bridge::router::ChannelHostStack;
//! use ims_bridge::ImsBridge;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("/etc/ims-bridge/config.json")?;
//! let t = &config.transport;
//!
//! let control = UnixBlockChannel::bind(
//!     "control",
//!     &t.control.socket_path,
//!     &t.control.peer_path,
//!     t.control.block_size,
//!     t.control.block_count,
//!     t.peer_poll(),
//! )?;
//! let data = UnixBlockChannel::bind(
//!     "data",
//!     &t.data.socket_path,
//!     &t.data.peer_path,
//!     t.data.block_size,
//!     t.data.block_count,
//!     t.peer_poll(),
//! )?;
//! let (host, _deliveries) = ChannelHostStack::new();
//!
//! let bridge = ImsBridge::new(&config, Arc::new(control), Arc::new(data), Arc::new(host));
//! bridge.start();
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`bridge`]: Orchestration and the management API
//! - [`channel`]: Block channels to the CP
//! - [`config`]: Configuration types and loading
//! - [`control`]: Control message codec and dispatch
//! - [`error`]: Error types
//! - [`esp`]: ESP sequence number tracking
//! - [`flow`]: Flow tuples and the flow table
//! - [`handover`]: Call state and handover tracking
//! - [`ipc`]: IPC server and protocol
//! - [`packet`]: Data envelope, fragmentation and packet parsing
//! - [`router`]: Per-packet routing decisions
//! - [`stats`]: Counters

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod bridge;
pub mod channel;
pub mod config;
pub mod control;
pub mod error;
pub mod esp;
pub mod flow;
pub mod handover;
pub mod ipc;
pub mod packet;
pub mod ratelimit;
pub mod router;
pub mod stats;

// Re-export commonly used types at the crate root
pub use bridge::{BridgeState, ImsBridge, LowPowerState};
pub use channel::{BlockChannel, MemoryChannel, UnixBlockChannel};
pub use config::Config;
pub use error::{
    ApiError, BridgeError, ConfigError, FlowError, IpcError, ProtocolError, TransportError,
};
pub use flow::{FlowTable, FlowType, Tuple, TupleRecord};
pub use handover::{CallState, HandoverState};
pub use ipc::{IpcClient, IpcCommand, IpcResponse, IpcServer};
pub use router::{HostStack, Router, Verdict};
pub use stats::{BridgeStats, StatsSnapshot};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
