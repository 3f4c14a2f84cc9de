//! In-process block channel pair
//!
//! A sent block keeps its slot until the receiving end drops the [`RxBlock`],
//! which mirrors shared-memory semantics: the sender runs out of blocks when
//! the peer stops consuming.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, watch, Mutex};

use super::{check_fits, BlockChannel, BlockSlots, BlockTicket, RxBlock, TxBlock};
use crate::error::TransportError;

type InFlight = (Bytes, BlockTicket);

/// One end of an in-process channel
pub struct MemoryChannel {
    name: String,
    block_size: usize,
    slots: Arc<BlockSlots>,
    tx: mpsc::UnboundedSender<InFlight>,
    rx: Mutex<mpsc::UnboundedReceiver<InFlight>>,
    announce_tx: watch::Sender<bool>,
    peer_up_rx: watch::Receiver<bool>,
}

impl MemoryChannel {
    /// Create two connected ends that already see each other as up
    ///
    /// Each direction has its own `block_count` blocks of `block_size` bytes.
    #[must_use]
    pub fn pair(name: &str, block_size: usize, block_count: usize) -> (Self, Self) {
        let (a, b) = Self::pair_unannounced(name, block_size, block_count);
        a.announce();
        b.announce();
        (a, b)
    }

    /// Create two connected ends that have not announced themselves yet
    #[must_use]
    pub fn pair_unannounced(name: &str, block_size: usize, block_count: usize) -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        let (a_announce, b_peer_up) = watch::channel(false);
        let (b_announce, a_peer_up) = watch::channel(false);

        let a = Self {
            name: name.to_string(),
            block_size,
            slots: BlockSlots::new(block_count),
            tx: a_tx,
            rx: Mutex::new(a_rx),
            announce_tx: a_announce,
            peer_up_rx: a_peer_up,
        };
        let b = Self {
            name: name.to_string(),
            block_size,
            slots: BlockSlots::new(block_count),
            tx: b_tx,
            rx: Mutex::new(b_rx),
            announce_tx: b_announce,
            peer_up_rx: b_peer_up,
        };
        (a, b)
    }

    /// Tell the other end that this end is up
    pub fn announce(&self) {
        self.announce_tx.send_replace(true);
    }

    /// Free transmit blocks on this end
    #[must_use]
    pub fn available_blocks(&self) -> usize {
        self.slots.available()
    }

    /// Copy `data` into a fresh block and send it
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if no block is free, `data` does not fit, or
    /// the peer is gone.
    pub fn send_bytes(&self, data: &[u8]) -> Result<(), TransportError> {
        let mut block = self.get()?;
        block.buf_mut().extend_from_slice(data);
        self.send(block)
    }
}

#[async_trait]
impl BlockChannel for MemoryChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn get(&self) -> Result<TxBlock, TransportError> {
        self.slots
            .try_take()
            .map(|ticket| TxBlock::new(self.block_size, ticket))
            .ok_or_else(|| TransportError::NoBlock {
                channel: self.name.clone(),
            })
    }

    fn send(&self, block: TxBlock) -> Result<(), TransportError> {
        check_fits(&self.name, &block, self.block_size)?;
        self.tx
            .send(block.into_parts())
            .map_err(|_| TransportError::Closed {
                channel: self.name.clone(),
            })
    }

    async fn receive(&self) -> Result<RxBlock, TransportError> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some((data, ticket)) => Ok(RxBlock::new(data, Some(ticket))),
            None => Err(TransportError::Closed {
                channel: self.name.clone(),
            }),
        }
    }

    async fn wait_peer_up(&self) {
        let mut rx = self.peer_up_rx.clone();
        if rx.wait_for(|up| *up).await.is_err() {
            // Peer dropped before announcing; never up
            std::future::pending::<()>().await;
        }
    }
}

impl fmt::Debug for MemoryChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryChannel")
            .field("name", &self.name)
            .field("block_size", &self.block_size)
            .field("available", &self.slots.available())
            .finish()
    }
}
