//! Channel receive loop
//!
//! One [`ChannelWorker`] task runs per channel:
//!
//! ```text
//! wait_peer_up ─► on_peer_up (pre-hook) ─► loop { receive ─► size check ─► handle }
//!                                                  │
//!                                                  └─ error: count, back off, retry
//! ```
//!
//! A shutdown broadcast interrupts every wait.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{BlockChannel, RxBlock};
use crate::error::BridgeError;
use crate::ratelimit::LogLimiter;
use crate::stats::{BridgeStats, Counter};

/// Consumer of the blocks arriving on one channel
#[async_trait]
pub trait BlockHandler: Send + Sync {
    /// Shortest block worth dispatching
    fn header_len(&self) -> usize;

    /// Process one block; dropping it releases the block
    fn handle(&self, block: RxBlock);

    /// Runs once after the peer is up, before the first receive
    ///
    /// # Errors
    ///
    /// An error stops the worker.
    async fn on_peer_up(&self) -> Result<(), BridgeError> {
        Ok(())
    }
}

/// Receive loop for one channel
pub struct ChannelWorker {
    channel: Arc<dyn BlockChannel>,
    handler: Arc<dyn BlockHandler>,
    stats: Arc<BridgeStats>,
    backoff: Duration,
    error_log: LogLimiter,
}

impl ChannelWorker {
    /// Create a worker; `backoff` is the pause after a receive error
    #[must_use]
    pub fn new(
        channel: Arc<dyn BlockChannel>,
        handler: Arc<dyn BlockHandler>,
        stats: Arc<BridgeStats>,
        backoff: Duration,
    ) -> Self {
        Self {
            channel,
            handler,
            stats,
            backoff,
            error_log: LogLimiter::default(),
        }
    }

    /// Spawn the loop on the current runtime
    pub fn spawn(self, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let name = self.channel.name().to_string();

        tokio::select! {
            _ = shutdown.recv() => {
                debug!(channel = %name, "Stopped before peer came up");
                return;
            }
            () = self.channel.wait_peer_up() => {}
        }
        info!(channel = %name, "Peer is up");

        if let Err(e) = self.handler.on_peer_up().await {
            error!(channel = %name, "Peer-up hook failed, receive loop not started: {}", e);
            return;
        }

        let block_size = self.channel.block_size();
        let header_len = self.handler.header_len();

        loop {
            let received = tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                received = self.channel.receive() => received,
            };

            match received {
                Ok(block) => {
                    if block.len() < header_len || block.len() > block_size {
                        error!(
                            channel = %name,
                            len = block.len(),
                            min = header_len,
                            max = block_size,
                            "Dropping block with invalid length"
                        );
                        continue;
                    }
                    self.handler.handle(block);
                }
                Err(e) => {
                    self.stats.inc(Counter::TransportReceiveFail);
                    if self.error_log.allow() {
                        warn!(channel = %name, "Receive failed: {}", e);
                    }
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        () = tokio::time::sleep(self.backoff) => {}
                    }
                }
            }
        }

        debug!(channel = %name, "Receive loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryChannel;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        blocks: Mutex<Vec<Vec<u8>>>,
        hooked: Mutex<bool>,
    }

    #[async_trait]
    impl BlockHandler for Recorder {
        fn header_len(&self) -> usize {
            2
        }

        fn handle(&self, block: RxBlock) {
            self.blocks.lock().push(block.to_vec());
        }

        async fn on_peer_up(&self) -> Result<(), BridgeError> {
            *self.hooked.lock() = true;
            Ok(())
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    #[tokio::test]
    async fn test_worker_dispatches_and_filters() {
        let (ap, cp) = MemoryChannel::pair("data", 8, 8);
        let recorder = Arc::new(Recorder::default());
        let stats = Arc::new(BridgeStats::new());
        let (shutdown_tx, _) = broadcast::channel(1);

        let worker = ChannelWorker::new(
            Arc::new(ap),
            Arc::clone(&recorder) as Arc<dyn BlockHandler>,
            Arc::clone(&stats),
            Duration::from_millis(1),
        );
        let handle = worker.spawn(shutdown_tx.subscribe());

        cp.send_bytes(b"ok").unwrap();
        cp.send_bytes(b"x").unwrap();
        cp.send_bytes(b"fine").unwrap();
        settle().await;

        assert!(*recorder.hooked.lock());
        assert_eq!(
            *recorder.blocks.lock(),
            vec![b"ok".to_vec(), b"fine".to_vec()]
        );

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_backs_off_on_receive_error() {
        let (ap, cp) = MemoryChannel::pair("data", 8, 8);
        drop(cp);
        let stats = Arc::new(BridgeStats::new());
        let (shutdown_tx, _) = broadcast::channel(1);

        let worker = ChannelWorker::new(
            Arc::new(ap),
            Arc::new(Recorder::default()),
            Arc::clone(&stats),
            Duration::from_millis(5),
        );
        let handle = worker.spawn(shutdown_tx.subscribe());
        settle().await;

        let failures = stats.get(Counter::TransportReceiveFail);
        assert!(failures >= 1);
        // Backoff keeps the retry rate bounded
        assert!(failures < 30);

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_stops_before_peer_up() {
        let (ap, _cp) = MemoryChannel::pair_unannounced("ctrl", 8, 8);
        let recorder = Arc::new(Recorder::default());
        let (shutdown_tx, _) = broadcast::channel(1);

        let handle = ChannelWorker::new(
            Arc::new(ap),
            Arc::clone(&recorder) as Arc<dyn BlockHandler>,
            Arc::new(BridgeStats::new()),
            Duration::from_millis(1),
        )
        .spawn(shutdown_tx.subscribe());

        settle().await;
        assert!(!*recorder.hooked.lock());
        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
