//! Data channel envelope
//!
//! Every data block starts with an 8-byte envelope:
//!
//! ```text
//! version:u8  reserved:u8  reserved:u16
//! total_len:u16le  offset:u16le
//! ```
//!
//! `total_len` is the length of the whole packet and `offset` is where this
//! block's chunk belongs in it.

use bytes::{BufMut, BytesMut};

use crate::error::ProtocolError;

/// Envelope version spoken by this bridge
pub const PACKET_VERSION: u8 = 1;

/// Encoded envelope length
pub const ENVELOPE_LEN: usize = 8;

/// Decoded envelope header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    pub version: u8,
    pub total_len: u16,
    pub offset: u16,
}

impl Envelope {
    /// Envelope of the current version
    #[must_use]
    pub const fn new(total_len: u16, offset: u16) -> Self {
        Self {
            version: PACKET_VERSION,
            total_len,
            offset,
        }
    }

    /// Append the encoded envelope to `buf`
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.version);
        buf.put_u8(0);
        buf.put_u16_le(0);
        buf.put_u16_le(self.total_len);
        buf.put_u16_le(self.offset);
    }

    /// Split a block into its envelope and chunk
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::Truncated` if the block is shorter than an envelope.
    pub fn decode(block: &[u8]) -> Result<(Self, &[u8]), ProtocolError> {
        if block.len() < ENVELOPE_LEN {
            return Err(ProtocolError::Truncated {
                what: "packet envelope",
                len: block.len(),
                need: ENVELOPE_LEN,
            });
        }
        let envelope = Self {
            version: block[0],
            total_len: u16::from_le_bytes([block[4], block[5]]),
            offset: u16::from_le_bytes([block[6], block[7]]),
        };
        Ok((envelope, &block[ENVELOPE_LEN..]))
    }

    /// Check version and bounds for a chunk of `chunk_len` bytes
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError` on version mismatch, an empty chunk, or a chunk
    /// extending past `total_len`.
    pub fn validate(&self, chunk_len: usize) -> Result<(), ProtocolError> {
        if self.version != PACKET_VERSION {
            return Err(ProtocolError::VersionMismatch {
                expected: u16::from(PACKET_VERSION),
                actual: u16::from(self.version),
            });
        }
        if chunk_len == 0 {
            return Err(ProtocolError::Truncated {
                what: "packet chunk",
                len: 0,
                need: 1,
            });
        }
        let offset = usize::from(self.offset);
        let total = usize::from(self.total_len);
        if offset + chunk_len > total {
            return Err(ProtocolError::FragmentOutOfRange {
                offset,
                len: chunk_len,
                total,
            });
        }
        Ok(())
    }
}
