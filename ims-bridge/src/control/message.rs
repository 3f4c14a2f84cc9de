//! Control message framing
//!
//! ```text
//! version:u16le  payload_len:u16le  command:[u8; 20] (NUL padded)
//! payload: [u8; payload_len]
//! ```
//!
//! A message fills exactly one control block, so `payload_len` must equal
//! the block length minus the 24-byte header.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// Header version spoken by this bridge
pub const CONTROL_VERSION: u16 = 0;

/// Width of the command name field, terminator included
pub const COMMAND_SIZE: usize = 20;

/// Encoded header length
pub const CONTROL_HEADER_LEN: usize = 4 + COMMAND_SIZE;

/// A decoded control message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    pub command: String,
    pub payload: Bytes,
}

impl ControlMessage {
    /// Append the encoded message to `buf`
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError` if the command name does not fit its field or
    /// the payload exceeds `max_payload`.
    pub fn encode(
        command: &str,
        payload: &[u8],
        max_payload: usize,
        buf: &mut BytesMut,
    ) -> Result<(), ProtocolError> {
        // One byte is always left for the terminator
        if command.len() >= COMMAND_SIZE {
            return Err(ProtocolError::CommandTooLong(command.to_string()));
        }
        if payload.len() > max_payload {
            return Err(ProtocolError::PayloadTooLarge {
                len: payload.len(),
                max: max_payload,
            });
        }
        let payload_len = u16::try_from(payload.len()).map_err(|_| ProtocolError::PayloadTooLarge {
            len: payload.len(),
            max: usize::from(u16::MAX),
        })?;

        let mut name = [0u8; COMMAND_SIZE];
        name[..command.len()].copy_from_slice(command.as_bytes());

        buf.reserve(CONTROL_HEADER_LEN + payload.len());
        buf.put_u16_le(CONTROL_VERSION);
        buf.put_u16_le(payload_len);
        buf.put_slice(&name);
        buf.put_slice(payload);
        Ok(())
    }

    /// Decode a whole control block
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError` if the block is shorter than the header, the
    /// version differs, the declared payload length disagrees with the block
    /// length, or the command name is not UTF-8.
    pub fn decode(block: &Bytes) -> Result<Self, ProtocolError> {
        if block.len() < CONTROL_HEADER_LEN {
            return Err(ProtocolError::Truncated {
                what: "control header",
                len: block.len(),
                need: CONTROL_HEADER_LEN,
            });
        }

        let version = u16::from_le_bytes([block[0], block[1]]);
        if version != CONTROL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                expected: CONTROL_VERSION,
                actual: version,
            });
        }

        let declared = usize::from(u16::from_le_bytes([block[2], block[3]]));
        let actual = block.len() - CONTROL_HEADER_LEN;
        if declared != actual {
            return Err(ProtocolError::LengthMismatch { declared, actual });
        }

        let name = &block[4..CONTROL_HEADER_LEN];
        let end = name.iter().position(|&b| b == 0).unwrap_or(COMMAND_SIZE);
        let command = std::str::from_utf8(&name[..end])
            .map_err(|_| ProtocolError::InvalidCommand)?
            .to_string();

        Ok(Self {
            command,
            payload: block.slice(CONTROL_HEADER_LEN..),
        })
    }
}

/// Read a little-endian u32 from the start of a payload, zero if absent
#[must_use]
pub fn read_u32(payload: &[u8]) -> u32 {
    payload
        .get(..4)
        .map_or(0, |b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}
