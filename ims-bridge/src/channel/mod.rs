//! Block channels between AP and CP
//!
//! The bridge talks to the CP over two independent channels, "control" and
//! "data". Each moves fixed-size blocks: the sender takes a free block with
//! [`BlockChannel::get`], fills it and hands it over with
//! [`BlockChannel::send`]; the receiver gets blocks from
//! [`BlockChannel::receive`] and releases them by dropping the [`RxBlock`].
//!
//! Returning an unsent block ("put") is simply dropping the [`TxBlock`]. A
//! block's slot is accounted by a [`BlockTicket`] and becomes available to
//! `get` again when the ticket is dropped, so a channel never has more than
//! its configured number of blocks in flight.
//!
//! # Adapters
//!
//! - [`MemoryChannel`]: in-process pair, used by tests and benches
//! - [`UnixBlockChannel`]: Unix datagram sockets, one datagram per block

mod memory;
mod unix;
mod worker;

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};

use crate::error::TransportError;

pub use memory::MemoryChannel;
pub use unix::UnixBlockChannel;
pub use worker::{BlockHandler, ChannelWorker};

/// Fixed-size block exchange with a peer
#[async_trait]
pub trait BlockChannel: Send + Sync {
    /// Channel name used in logs
    fn name(&self) -> &str;

    /// Size of one block in bytes
    fn block_size(&self) -> usize;

    /// Take a free transmit block
    ///
    /// Never blocks.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::NoBlock` when every block is in flight.
    fn get(&self) -> Result<TxBlock, TransportError>;

    /// Hand a filled block to the peer
    ///
    /// Never blocks.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if the block is overfull or the peer cannot
    /// take it. The block is released either way.
    fn send(&self, block: TxBlock) -> Result<(), TransportError>;

    /// Wait for the next block from the peer
    ///
    /// # Errors
    ///
    /// Returns `TransportError` on transient receive failure or if the peer
    /// is gone.
    async fn receive(&self) -> Result<RxBlock, TransportError>;

    /// Resolve once the peer has announced itself
    async fn wait_peer_up(&self);
}

/// Counting allocator for a channel's blocks
pub struct BlockSlots {
    free: AtomicUsize,
    total: usize,
}

impl BlockSlots {
    /// Create `total` slots
    #[must_use]
    pub fn new(total: usize) -> Arc<Self> {
        Arc::new(Self {
            free: AtomicUsize::new(total),
            total,
        })
    }

    /// Take a slot if one is free
    #[must_use]
    pub fn try_take(self: &Arc<Self>) -> Option<BlockTicket> {
        let mut current = self.free.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return None;
            }
            match self.free.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(BlockTicket {
                        slots: Arc::clone(self),
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Free slots
    #[must_use]
    pub fn available(&self) -> usize {
        self.free.load(Ordering::Acquire)
    }

    /// Total slots
    #[must_use]
    pub fn total(&self) -> usize {
        self.total
    }
}

/// Ownership of one block slot; released on drop
pub struct BlockTicket {
    slots: Arc<BlockSlots>,
}

impl Drop for BlockTicket {
    fn drop(&mut self) {
        self.slots.free.fetch_add(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for BlockTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BlockTicket")
    }
}

/// A block being filled for transmission
#[derive(Debug)]
pub struct TxBlock {
    buf: BytesMut,
    capacity: usize,
    ticket: BlockTicket,
}

impl TxBlock {
    /// Create a block of `capacity` bytes backed by `ticket`
    #[must_use]
    pub fn new(capacity: usize, ticket: BlockTicket) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            capacity,
            ticket,
        }
    }

    /// Block size
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes written so far
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing was written yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Bytes still free in the block
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.capacity.saturating_sub(self.buf.len())
    }

    /// Writable contents
    pub fn buf_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Split into the frozen contents and the slot ticket
    #[must_use]
    pub fn into_parts(self) -> (Bytes, BlockTicket) {
        (self.buf.freeze(), self.ticket)
    }
}

/// A received block; dropping it releases the block
#[derive(Debug)]
pub struct RxBlock {
    data: Bytes,
    _ticket: Option<BlockTicket>,
}

impl RxBlock {
    /// Wrap received bytes, optionally holding the sender's slot until release
    #[must_use]
    pub fn new(data: Bytes, ticket: Option<BlockTicket>) -> Self {
        Self {
            data,
            _ticket: ticket,
        }
    }

    /// Contents as shared bytes
    #[must_use]
    pub fn bytes(&self) -> &Bytes {
        &self.data
    }
}

impl Deref for RxBlock {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

/// Check a block against its channel's size before sending
pub(crate) fn check_fits(
    channel: &str,
    block: &TxBlock,
    block_size: usize,
) -> Result<(), TransportError> {
    if block.len() > block_size {
        return Err(TransportError::BlockOverflow {
            channel: channel.to_string(),
            len: block.len(),
            capacity: block_size,
        });
    }
    Ok(())
}
