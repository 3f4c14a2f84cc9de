//! Integration tests for ims-bridge
//!
//! Every test drives a whole [`ImsBridge`] over in-memory block channels and
//! plays the CP side by hand.
//!
//! # Test Organization
//!
//! - `relay`: packets crossing the data channel in both directions
//! - `control_plane`: commands arriving from the CP and their effects
//! - `handover`: call legs moving between Wi-Fi and LTE
//!
//! # Running Tests
//!
//! ```bash
//! cargo test --test integration_tests
//!
//! # Run specific test module
//! cargo test --test integration_tests handover
//! ```

pub mod control_plane;
pub mod handover;
pub mod relay;

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::sync::mpsc;

use ims_bridge::channel::{BlockChannel, MemoryChannel};
use ims_bridge::config::Config;
use ims_bridge::control::ControlMessage;
use ims_bridge::flow::{ip_proto, LinkType, MediaType, SocketType, TupleRecord};
use ims_bridge::packet::{Envelope, Packet};
use ims_bridge::router::{ChannelHostStack, HostDelivery};
use ims_bridge::ImsBridge;

pub const CONTROL_BLOCK: usize = 256;
pub const DATA_BLOCK: usize = 1600;

/// A bridge plus the CP ends of its channels
pub struct Testbed {
    pub bridge: ImsBridge,
    pub control_cp: MemoryChannel,
    pub data_cp: MemoryChannel,
    pub host_rx: mpsc::UnboundedReceiver<HostDelivery>,
}

impl Testbed {
    pub fn new() -> Self {
        Self::with_config(&Config::default_config())
    }

    pub fn with_config(config: &Config) -> Self {
        let (control, control_cp) = MemoryChannel::pair("control", CONTROL_BLOCK, 64);
        let (data, data_cp) = MemoryChannel::pair("data", DATA_BLOCK, 128);
        let (host, host_rx) = ChannelHostStack::new();
        let bridge = ImsBridge::new(config, Arc::new(control), Arc::new(data), Arc::new(host));
        Self {
            bridge,
            control_cp,
            data_cp,
            host_rx,
        }
    }

    /// Start the bridge and consume the peer-up announcement
    pub async fn start(&self) {
        self.bridge.start();
        let first = self.next_control().await;
        assert_eq!(first.command, "ltevideo-apsk");
    }

    /// Send a control message from the CP
    pub fn cp_command(&self, command: &str, payload: &[u8]) {
        let mut buf = BytesMut::new();
        ControlMessage::encode(command, payload, CONTROL_BLOCK, &mut buf).unwrap();
        self.control_cp.send_bytes(&buf).unwrap();
    }

    /// Next control message the bridge sent to the CP
    pub async fn next_control(&self) -> ControlMessage {
        let block = tokio::time::timeout(Duration::from_secs(1), self.control_cp.receive())
            .await
            .expect("no control message within 1s")
            .unwrap();
        ControlMessage::decode(block.bytes()).unwrap()
    }

    /// Send a whole packet from the CP in one data block
    pub fn cp_packet(&self, packet: &[u8]) {
        let mut buf = BytesMut::new();
        Envelope::new(packet.len() as u16, 0).encode(&mut buf);
        buf.extend_from_slice(packet);
        self.data_cp.send_bytes(&buf).unwrap();
    }

    /// Next data block the bridge sent to the CP, split into envelope and chunk
    pub async fn next_data(&self) -> (Envelope, Vec<u8>) {
        let block = tokio::time::timeout(Duration::from_secs(1), self.data_cp.receive())
            .await
            .expect("no data block within 1s")
            .unwrap();
        let (envelope, chunk) = Envelope::decode(block.bytes()).unwrap();
        (envelope, chunk.to_vec())
    }

    /// Next packet the bridge handed to the host
    pub async fn next_delivery(&mut self) -> HostDelivery {
        tokio::time::timeout(Duration::from_secs(1), self.host_rx.recv())
            .await
            .expect("no host delivery within 1s")
            .unwrap()
    }
}

/// Poll `cond` until it holds or a second passes
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// Build an IPv4 UDP packet
pub fn udp4(src: [u8; 4], src_port: u16, dst: [u8; 4], dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let total = 28 + payload.len();
    let mut p = vec![0u8; total];
    p[0] = 0x45;
    p[2..4].copy_from_slice(&(total as u16).to_be_bytes());
    p[8] = 64;
    p[9] = ip_proto::UDP;
    p[12..16].copy_from_slice(&src);
    p[16..20].copy_from_slice(&dst);
    p[20..22].copy_from_slice(&src_port.to_be_bytes());
    p[22..24].copy_from_slice(&dst_port.to_be_bytes());
    p[24..26].copy_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
    p[28..].copy_from_slice(payload);
    p
}

pub const UE: [u8; 4] = [10, 0, 0, 5];
pub const PCSCF: [u8; 4] = [1, 2, 3, 4];

/// Uplink packet of the test flow
pub fn uplink(payload: &[u8]) -> Packet {
    Packet::new(&udp4(UE, 5000, PCSCF, 6000, payload)[..])
}

/// Downlink packet of the test flow
pub fn downlink(payload: &[u8]) -> Packet {
    Packet::new(&udp4(PCSCF, 6000, UE, 5000, payload)[..])
}

/// Registration for the test flow
pub fn flow(media_type: MediaType, link_type: LinkType, socket_type: SocketType) -> TupleRecord {
    TupleRecord {
        local_addr: UE.into(),
        local_port: 5000,
        peer_addr: PCSCF.into(),
        peer_port: 6000,
        protocol: ip_proto::UDP,
        media_type,
        link_type,
        socket_type,
        sim_card: 0,
    }
}
