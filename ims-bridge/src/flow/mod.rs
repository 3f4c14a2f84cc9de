//! Flow registry
//!
//! This module holds the tuple types, the bounded flow pool and the
//! concurrent [`FlowTable`] consulted for every intercepted packet.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use ims_bridge::flow::{
//!     ip_proto, FlowMeta, FlowTable, FlowType, LinkType, MediaType, SocketType, Tuple,
//! };
//! use ims_bridge::stats::BridgeStats;
//!
//! let table = FlowTable::new(512, 64, Duration::from_millis(10), Arc::new(BridgeStats::new()));
//! let tuple = Tuple::new(
//!     ip_proto::UDP,
//!     "10.0.0.5".parse().unwrap(),
//!     5060,
//!     "1.2.3.4".parse().unwrap(),
//!     0,
//! );
//! let meta = FlowMeta {
//!     media_type: MediaType::Sip,
//!     link_type: LinkType::Cp,
//!     socket_type: SocketType::Cp,
//!     sim_card: 0,
//! };
//! table.add(tuple, FlowType::Cp, meta).unwrap();
//!
//! let mut packet = tuple;
//! packet.dst_port = 5061;
//! assert!(table.find(&packet).is_some());
//! ```

mod pool;
mod table;
mod tuple;

pub use pool::{FlowPool, PoolSlot, DEFAULT_POOL_CAPACITY};
pub use table::{AddOutcome, Flow, FlowInfo, FlowTable, DEFAULT_BUCKETS};
pub use tuple::{
    ip_proto, AddressFamily, FlowMeta, FlowType, LinkType, MediaType, SocketType, Tuple,
    TupleRecord, TUPLE_RECORD_LEN,
};
