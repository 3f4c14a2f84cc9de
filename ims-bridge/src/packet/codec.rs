//! Fragmentation and reassembly over the data channel
//!
//! Outbound packets larger than the fragment size are cut into consecutive
//! chunks that all carry the packet's total length. Inbound chunks are
//! stitched back together in a single reassembly context guarded by a mutex:
//! only one oversized transfer can be in flight on the data channel at a time.
//!
//! Offsets must arrive strictly in order. Each non-zero offset has to equal
//! the number of bytes already collected; anything else drops the context.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::envelope::{Envelope, ENVELOPE_LEN};
use crate::channel::BlockChannel;
use crate::error::{BridgeError, ProtocolError};
use crate::ratelimit::LogLimiter;
use crate::stats::{BridgeStats, Counter};

/// Reassembled packets at least this large are logged
pub const HUGE_PACKET_LEN: usize = 8192;

#[derive(Debug)]
struct Reassembly {
    buf: BytesMut,
    total: usize,
}

/// Data channel packet codec
pub struct PacketCodec {
    channel: Arc<dyn BlockChannel>,
    frag_size: usize,
    reassembly: Mutex<Option<Reassembly>>,
    stats: Arc<BridgeStats>,
    error_log: LogLimiter,
}

impl PacketCodec {
    /// Create a codec on `channel`
    ///
    /// A `frag_size` of 0, or one larger than the block payload capacity,
    /// selects the full capacity.
    #[must_use]
    pub fn new(channel: Arc<dyn BlockChannel>, frag_size: usize, stats: Arc<BridgeStats>) -> Self {
        let capacity = channel.block_size().saturating_sub(ENVELOPE_LEN).max(1);
        let frag_size = if frag_size == 0 || frag_size > capacity {
            capacity
        } else {
            frag_size
        };

        Self {
            channel,
            frag_size,
            reassembly: Mutex::new(None),
            stats,
            error_log: LogLimiter::default(),
        }
    }

    /// Largest chunk carried by one block
    #[must_use]
    pub fn frag_size(&self) -> usize {
        self.frag_size
    }

    /// Whether a partially reassembled packet is pending
    #[must_use]
    pub fn reassembly_pending(&self) -> bool {
        self.reassembly.lock().is_some()
    }

    /// Relay `packet` to the peer, fragmenting if needed
    ///
    /// The packet is consumed whatever the outcome. A failure part-way
    /// through abandons the remaining chunks.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError` if the packet is too large for the envelope or a
    /// block could not be obtained or sent.
    pub fn send(&self, packet: Bytes) -> Result<(), BridgeError> {
        let total = u16::try_from(packet.len()).map_err(|_| {
            self.stats.inc(Counter::FragFail);
            ProtocolError::PayloadTooLarge {
                len: packet.len(),
                max: usize::from(u16::MAX),
            }
        })?;

        if packet.len() <= self.frag_size {
            return self.send_chunk(total, 0, &packet);
        }

        self.stats.inc(Counter::FragCreate);
        for (index, chunk) in packet.chunks(self.frag_size).enumerate() {
            // Bounded by `total`, which fits in u16
            let offset = (index * self.frag_size) as u16;
            if let Err(e) = self.send_chunk(total, offset, chunk) {
                self.stats.inc(Counter::FragFail);
                if self.error_log.allow() {
                    warn!(len = packet.len(), offset, "Fragmentation aborted: {}", e);
                }
                return Err(e);
            }
        }
        self.stats.inc(Counter::FragOk);
        Ok(())
    }

    fn send_chunk(&self, total: u16, offset: u16, chunk: &[u8]) -> Result<(), BridgeError> {
        let mut block = self.channel.get().map_err(|e| {
            self.stats.inc(Counter::TransportGetFail);
            e
        })?;
        let buf = block.buf_mut();
        Envelope::new(total, offset).encode(buf);
        buf.extend_from_slice(chunk);

        self.channel.send(block).map_err(|e| {
            self.stats.inc(Counter::TransportSendFail);
            BridgeError::from(e)
        })
    }

    /// Feed one received data block
    ///
    /// Returns the complete packet when this block finishes one. Malformed
    /// blocks are counted and dropped.
    pub fn accept(&self, block: &Bytes) -> Option<Bytes> {
        match self.reassemble(block) {
            Ok(packet) => packet,
            Err(e) => {
                self.stats.inc(Counter::ReasmFail);
                if self.error_log.allow() {
                    warn!(len = block.len(), "Dropping data block: {}", e);
                }
                None
            }
        }
    }

    fn reassemble(&self, block: &Bytes) -> Result<Option<Bytes>, ProtocolError> {
        let (envelope, chunk) = Envelope::decode(block)?;
        let total = usize::from(envelope.total_len);
        let offset = usize::from(envelope.offset);

        if let Err(e) = envelope.validate(chunk.len()) {
            *self.reassembly.lock() = None;
            return Err(e);
        }

        if offset == 0 && chunk.len() == total {
            return Ok(Some(block.slice(ENVELOPE_LEN..)));
        }

        let mut context = self.reassembly.lock();

        if offset == 0 {
            if let Some(stale) = context.take() {
                debug!(
                    received = stale.buf.len(),
                    total = stale.total,
                    "Discarding unfinished reassembly"
                );
            }
            self.stats.inc(Counter::ReasmRequest);
            if total >= HUGE_PACKET_LEN {
                info!(total, "Reassembling huge packet");
            }
            let mut buf = BytesMut::with_capacity(total);
            buf.extend_from_slice(chunk);
            *context = Some(Reassembly { buf, total });
            return Ok(None);
        }

        let Some(current) = context.as_mut() else {
            return Err(ProtocolError::OrphanFragment { offset });
        };
        if current.total != total {
            let expected = current.total;
            *context = None;
            return Err(ProtocolError::TotalLengthMismatch {
                expected,
                actual: total,
            });
        }
        if offset != current.buf.len() {
            let expected = current.buf.len();
            *context = None;
            return Err(ProtocolError::NonMonotonicOffset {
                expected,
                actual: offset,
            });
        }

        current.buf.extend_from_slice(chunk);
        if current.buf.len() < total {
            return Ok(None);
        }

        let done = context.take().map(|r| r.buf.freeze());
        self.stats.inc(Counter::ReasmOk);
        Ok(done)
    }
}

impl std::fmt::Debug for PacketCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketCodec")
            .field("channel", &self.channel.name())
            .field("frag_size", &self.frag_size)
            .finish()
    }
}
