//! Unix datagram block channel
//!
//! Each block travels as one datagram from our bound socket to the peer's
//! path. The socket is bound once and held twice: a non-blocking std handle
//! that sends synchronously, and a Tokio handle registered with the reactor
//! for async receives. A full peer queue surfaces as a send failure rather
//! than stalling the caller. The peer counts as up once its socket path
//! accepts a connect.

use std::fmt;
use std::os::unix::net::UnixDatagram as StdUnixDatagram;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::net::UnixDatagram;
use tracing::debug;

use super::{check_fits, BlockChannel, BlockSlots, RxBlock, TxBlock};
use crate::error::TransportError;

/// Block channel over a pair of Unix datagram sockets
pub struct UnixBlockChannel {
    name: String,
    tx: StdUnixDatagram,
    rx: UnixDatagram,
    local: PathBuf,
    peer: PathBuf,
    block_size: usize,
    slots: Arc<BlockSlots>,
    peer_poll: Duration,
}

impl UnixBlockChannel {
    /// Bind `local` and address blocks to `peer`
    ///
    /// A stale socket file at `local` is removed first. Must be called from
    /// within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Io` if the socket cannot be bound or
    /// registered with the runtime.
    pub fn bind(
        name: &str,
        local: impl AsRef<Path>,
        peer: impl AsRef<Path>,
        block_size: usize,
        block_count: usize,
        peer_poll: Duration,
    ) -> Result<Self, TransportError> {
        let local = local.as_ref().to_path_buf();
        if local.exists() {
            std::fs::remove_file(&local)?;
        }
        if let Some(parent) = local.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let tx = StdUnixDatagram::bind(&local)?;
        tx.set_nonblocking(true)?;
        let rx = UnixDatagram::from_std(tx.try_clone()?)?;
        debug!(channel = name, local = ?local, "Block channel socket bound");

        Ok(Self {
            name: name.to_string(),
            tx,
            rx,
            local,
            peer: peer.as_ref().to_path_buf(),
            block_size,
            slots: BlockSlots::new(block_count),
            peer_poll,
        })
    }

    /// Local socket path
    #[must_use]
    pub fn local_path(&self) -> &Path {
        &self.local
    }

    fn peer_reachable(&self) -> bool {
        StdUnixDatagram::unbound()
            .and_then(|probe| probe.connect(&self.peer))
            .is_ok()
    }
}

#[async_trait]
impl BlockChannel for UnixBlockChannel {
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
        // The kernel copies the datagram, so the slot is free once this returns
        let (data, _ticket) = block.into_parts();
        match self.tx.send_to(&data, &self.peer) {
            Ok(sent) if sent == data.len() => Ok(()),
            Ok(sent) => Err(TransportError::send_failed(
                &self.name,
                format!("short send: {sent} of {} bytes", data.len()),
            )),
            Err(e) => Err(TransportError::send_failed(&self.name, e.to_string())),
        }
    }

    async fn receive(&self) -> Result<RxBlock, TransportError> {
        // One spare byte so oversized datagrams are detectable
        let mut buf = vec![0u8; self.block_size + 1];
        let len = self
            .rx
            .recv(&mut buf)
            .await
            .map_err(|e| TransportError::receive_failed(&self.name, e.to_string()))?;
        buf.truncate(len);
        Ok(RxBlock::new(Bytes::from(buf), None))
    }

    async fn wait_peer_up(&self) {
        while !self.peer_reachable() {
            tokio::time::sleep(self.peer_poll).await;
        }
    }
}

impl Drop for UnixBlockChannel {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.local);
    }
}

impl fmt::Debug for UnixBlockChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnixBlockChannel")
            .field("name", &self.name)
            .field("local", &self.local)
            .field("peer", &self.peer)
            .field("block_size", &self.block_size)
            .finish()
    }
}
