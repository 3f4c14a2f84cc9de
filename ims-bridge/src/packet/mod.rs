//! Packets and the data channel wire format
//!
//! - [`Packet`]: an intercepted IP packet plus what the host already knows about it
//! - [`envelope`]: the 8-byte header in front of every data block
//! - [`PacketCodec`]: fragmentation on send and reassembly on receive
//! - [`parse`]: raw header inspection for tuple resolution and ESP probing

pub mod envelope;
pub mod parse;

mod codec;

use bytes::{Bytes, BytesMut};

use crate::flow::Tuple;

pub use codec::{PacketCodec, HUGE_PACKET_LEN};
pub use envelope::{Envelope, ENVELOPE_LEN, PACKET_VERSION};

/// Interception point a packet was seen at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Arriving at the AP stack
    Ingress,
    /// Leaving the AP stack
    Egress,
}

/// An intercepted IP packet
#[derive(Debug, Clone)]
pub struct Packet {
    data: BytesMut,
    conntrack: Option<Tuple>,
    checksum_partial: bool,
}

impl Packet {
    /// Wrap raw IP bytes
    #[must_use]
    pub fn new(data: impl Into<BytesMut>) -> Self {
        Self {
            data: data.into(),
            conntrack: None,
            checksum_partial: false,
        }
    }

    /// Attach the connection-tracking tuple for this packet's direction
    #[must_use]
    pub fn with_conntrack(mut self, tuple: Tuple) -> Self {
        self.conntrack = Some(tuple);
        self
    }

    /// Mark the transport checksum as not yet computed (offload pending)
    #[must_use]
    pub fn with_checksum_partial(mut self) -> Self {
        self.checksum_partial = true;
        self
    }

    /// Raw bytes
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Tuple supplied by connection tracking, if any
    #[must_use]
    pub fn conntrack(&self) -> Option<&Tuple> {
        self.conntrack.as_ref()
    }

    /// Whether the checksum still has to be filled in
    #[must_use]
    pub fn checksum_partial(&self) -> bool {
        self.checksum_partial
    }

    /// Compute a pending transport checksum
    pub fn finalize_checksum(&mut self) {
        if self.checksum_partial {
            parse::finalize_l4_checksum(&mut self.data);
            self.checksum_partial = false;
        }
    }

    /// Length in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the packet is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Consume into frozen bytes
    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        self.data.freeze()
    }
}
