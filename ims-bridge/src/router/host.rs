//! Host stack boundary
//!
//! The bridge never touches the host's network stack directly. Packets that
//! came from the CP are handed to a [`HostStack`], which either injects them
//! into the local input path or sends them out.

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

/// Where packets from the CP re-enter the host
pub trait HostStack: Send + Sync {
    /// Inject into the local input path with firewall mark `mark`
    fn deliver_input(&self, packet: Bytes, mark: u32);

    /// Send out through the output path
    fn deliver_output(&self, packet: Bytes);
}

/// A packet handed to the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostDelivery {
    Input { packet: Bytes, mark: u32 },
    Output { packet: Bytes },
}

/// [`HostStack`] that forwards deliveries to an async consumer
#[derive(Debug, Clone)]
pub struct ChannelHostStack {
    tx: mpsc::UnboundedSender<HostDelivery>,
}

impl ChannelHostStack {
    /// Create the stack and the receiver its deliveries arrive on
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<HostDelivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn push(&self, delivery: HostDelivery) {
        if self.tx.send(delivery).is_err() {
            debug!("Host delivery receiver gone, dropping packet");
        }
    }
}

impl HostStack for ChannelHostStack {
    fn deliver_input(&self, packet: Bytes, mark: u32) {
        self.push(HostDelivery::Input { packet, mark });
    }

    fn deliver_output(&self, packet: Bytes) {
        self.push(HostDelivery::Output { packet });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deliveries_arrive_in_order() {
        let (host, mut rx) = ChannelHostStack::new();
        host.deliver_input(Bytes::from_static(b"in"), 7);
        host.deliver_output(Bytes::from_static(b"out"));

        assert_eq!(
            rx.try_recv().unwrap(),
            HostDelivery::Input {
                packet: Bytes::from_static(b"in"),
                mark: 7
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            HostDelivery::Output {
                packet: Bytes::from_static(b"out")
            }
        );
    }

    #[test]
    fn test_closed_receiver_is_harmless() {
        let (host, rx) = ChannelHostStack::new();
        drop(rx);
        host.deliver_output(Bytes::from_static(b"lost"));
    }
}
