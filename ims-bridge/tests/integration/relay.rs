//! Data path tests
//!
//! Packets intercepted on the AP are relayed to the CP, and packets from the
//! CP come back out through the host stack.

use ims_bridge::bridge::LowPowerState;
use ims_bridge::config::Config;
use ims_bridge::flow::{LinkType, MediaType, SocketType};
use ims_bridge::router::{HostDelivery, PacketInterceptor, Verdict};
use ims_bridge::stats::Counter;

use super::{downlink, eventually, flow, udp4, uplink, Testbed, PCSCF, UE};

#[tokio::test]
async fn test_cp_socket_flow_is_relayed_on_ingress() {
    let tb = Testbed::new();
    tb.start().await;

    let record = flow(MediaType::Sip, LinkType::Cp, SocketType::Cp);
    tb.cp_command("cptuple-add", &record.encode());
    assert!(eventually(|| tb.bridge.flows().len() == 2).await);

    let packet = downlink(b"INVITE");
    let expected = packet.data().to_vec();
    assert!(tb.bridge.router().ingress(packet).is_stolen());

    let (envelope, chunk) = tb.next_data().await;
    assert_eq!(envelope.offset, 0);
    assert_eq!(usize::from(envelope.total_len), expected.len());
    assert_eq!(chunk, expected);
    assert_eq!(tb.bridge.stats().get(Counter::PktsToCp), 1);

    tb.bridge.shutdown().await;
}

#[tokio::test]
async fn test_unrelated_traffic_is_left_alone() {
    let tb = Testbed::new();
    tb.start().await;

    tb.bridge
        .add_tuple(&flow(MediaType::Sip, LinkType::Cp, SocketType::Cp))
        .unwrap();

    let dns = ims_bridge::packet::Packet::new(&udp4(UE, 5001, [8, 8, 8, 8], 53, b"q")[..]);
    match tb.bridge.router().egress(dns) {
        Verdict::Accept(packet) => assert_eq!(packet.len(), 29),
        Verdict::Stolen => panic!("unrelated packet was stolen"),
    }
    assert_eq!(tb.bridge.stats().get(Counter::PktsToCp), 0);

    tb.bridge.shutdown().await;
}

#[tokio::test]
async fn test_packets_from_cp_reach_the_host() {
    let mut config = Config::default_config();
    config.bridge.vowifi_in_mark = 0x1f;
    let mut tb = Testbed::with_config(&config);
    tb.start().await;

    tb.bridge
        .add_tuple(&flow(MediaType::Sip, LinkType::Ap, SocketType::Cp))
        .unwrap();
    assert_eq!(tb.next_control().await.command, "aptuple-add");

    // Generated by the CP's own socket: leaves through the output path
    let outbound = udp4(UE, 5000, PCSCF, 6000, b"REGISTER");
    tb.cp_packet(&outbound);
    match tb.next_delivery().await {
        HostDelivery::Output { packet } => assert_eq!(&packet[..], &outbound[..]),
        other => panic!("expected output delivery, got {other:?}"),
    }

    // Anything else is injected locally with the configured mark
    let inbound = udp4(PCSCF, 7000, UE, 7001, b"rtp");
    tb.cp_packet(&inbound);
    match tb.next_delivery().await {
        HostDelivery::Input { packet, mark } => {
            assert_eq!(&packet[..], &inbound[..]);
            assert_eq!(mark, 0x1f);
        }
        other => panic!("expected input delivery, got {other:?}"),
    }
    assert_eq!(tb.bridge.stats().get(Counter::PktsFromCp), 2);

    tb.bridge.shutdown().await;
}

#[tokio::test]
async fn test_large_packet_is_fragmented_and_reassembled() {
    let mut config = Config::default_config();
    config.codec.frag_size = 500;
    let mut tb = Testbed::with_config(&config);
    tb.start().await;

    tb.bridge
        .add_tuple(&flow(MediaType::RtpVideo, LinkType::Cp, SocketType::Ap))
        .unwrap();

    let payload: Vec<u8> = (0..1200u32).map(|i| (i % 251) as u8).collect();
    let packet = uplink(&payload);
    let whole = packet.data().to_vec();
    assert!(tb.bridge.router().egress(packet).is_stolen());

    let mut offsets = Vec::new();
    let mut chunks = Vec::new();
    let mut received = 0;
    while received < whole.len() {
        let (envelope, chunk) = tb.next_data().await;
        assert_eq!(usize::from(envelope.total_len), whole.len());
        assert!(chunk.len() <= 500);
        offsets.push(envelope.offset);
        received += chunk.len();
        chunks.push(chunk);
    }
    assert_eq!(offsets, vec![0, 500, 1000]);
    assert_eq!(chunks.concat(), whole);
    assert_eq!(tb.bridge.stats().get(Counter::FragOk), 1);

    // The CP answers with the same fragments; the host sees one packet
    let mut offset = 0u16;
    for chunk in &chunks {
        let mut block = bytes::BytesMut::new();
        ims_bridge::packet::Envelope::new(whole.len() as u16, offset).encode(&mut block);
        block.extend_from_slice(chunk);
        tb.data_cp.send_bytes(&block).unwrap();
        offset += chunk.len() as u16;
    }
    match tb.next_delivery().await {
        HostDelivery::Output { packet } => assert_eq!(&packet[..], &whole[..]),
        HostDelivery::Input { packet, .. } => assert_eq!(&packet[..], &whole[..]),
    }
    assert_eq!(tb.bridge.stats().get(Counter::ReasmOk), 1);

    tb.bridge.shutdown().await;
}

#[tokio::test]
async fn test_low_power_takes_every_egress_packet() {
    let tb = Testbed::new();
    tb.start().await;

    // Keep the table non-empty with an unrelated flow
    let mut other = flow(MediaType::Sip, LinkType::Ap, SocketType::Ap);
    other.local_port = 9000;
    tb.bridge.add_tuple(&other).unwrap();

    let stray = || ims_bridge::packet::Packet::new(&udp4(UE, 4500, [9, 9, 9, 9], 4500, b"x")[..]);
    assert!(!tb.bridge.router().egress(stray()).is_stolen());

    tb.bridge.set_low_power(LowPowerState::Start).unwrap();
    assert!(tb.bridge.state().is_low_power());
    assert!(tb.bridge.router().egress(stray()).is_stolen());
    let (_, chunk) = tb.next_data().await;
    assert_eq!(chunk.len(), 29);

    // Ingress is never affected by low power
    assert!(!tb.bridge.router().ingress(downlink(b"x")).is_stolen());

    tb.bridge.set_low_power(LowPowerState::End).unwrap();
    assert!(!tb.bridge.router().egress(stray()).is_stolen());

    tb.bridge.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_drops_every_flow() {
    let tb = Testbed::new();
    tb.start().await;

    tb.cp_command(
        "cptuple-add",
        &flow(MediaType::Sip, LinkType::Cp, SocketType::Cp).encode(),
    );
    tb.bridge
        .add_tuple(&flow(MediaType::RtpAudio, LinkType::Ap, SocketType::Ap))
        .unwrap();
    assert!(eventually(|| tb.bridge.flows().len() == 4).await);

    tb.bridge.shutdown().await;
    assert!(tb.bridge.flows().is_empty());
    assert!(!tb.bridge.router().ingress(downlink(b"late")).is_stolen());
}
