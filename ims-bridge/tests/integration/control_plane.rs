//! Control channel tests
//!
//! The CP side sends commands by hand and checks what the bridge does and
//! answers.

use ims_bridge::bridge::LowPowerState;
use ims_bridge::config::Config;
use ims_bridge::control::read_u32;
use ims_bridge::esp::{decode_records, encode_records, EspRecord};
use ims_bridge::flow::{FlowType, LinkType, MediaType, SocketType};
use ims_bridge::stats::Counter;

use super::{eventually, flow, Testbed};

#[tokio::test]
async fn test_peer_up_announces_video_apsk() {
    let mut config = Config::default_config();
    config.bridge.volte_video_apsk = 7;
    let tb = Testbed::with_config(&config);
    tb.bridge.start();

    let message = tb.next_control().await;
    assert_eq!(message.command, "ltevideo-apsk");
    assert_eq!(read_u32(&message.payload), 7);

    // A CP restart asks for it again
    tb.cp_command("cp-reset", &[]);
    let message = tb.next_control().await;
    assert_eq!(message.command, "ltevideo-apsk");
    assert_eq!(read_u32(&message.payload), 7);

    tb.bridge.shutdown().await;
}

#[tokio::test]
async fn test_echo_round_trip() {
    let tb = Testbed::new();
    tb.start().await;

    tb.cp_command("echo-ping", b"hello\0");
    let message = tb.next_control().await;
    assert_eq!(message.command, "echo-pong");
    assert_eq!(&message.payload[..], b"hello\0");

    tb.bridge.echo_ping("are you there").unwrap();
    let message = tb.next_control().await;
    assert_eq!(message.command, "echo-ping");
    assert_eq!(&message.payload[..], b"are you there\0");

    tb.bridge.shutdown().await;
}

#[tokio::test]
async fn test_bad_messages_are_counted_and_skipped() {
    let tb = Testbed::new();
    tb.start().await;

    tb.cp_command("no-such-command", &[1, 2, 3]);
    // Version 9 header
    let mut bogus = vec![9, 0, 0, 0];
    bogus.extend_from_slice(&[0u8; 20]);
    tb.control_cp.send_bytes(&bogus).unwrap();
    // Still alive afterwards
    tb.cp_command("echo-ping", b"ok\0");

    assert_eq!(tb.next_control().await.command, "echo-pong");
    let stats = tb.bridge.stats();
    assert_eq!(stats.get(Counter::ControlUnknown), 1);
    assert_eq!(stats.get(Counter::ControlInvalid), 1);
    assert_eq!(stats.get(Counter::ControlRx), 3);

    tb.bridge.shutdown().await;
}

#[tokio::test]
async fn test_cp_tuples_add_delete_and_reset() {
    let tb = Testbed::new();
    tb.start().await;

    let sip = flow(MediaType::Sip, LinkType::Cp, SocketType::Cp);
    let mut rtp = flow(MediaType::RtpAudio, LinkType::Cp, SocketType::Ap);
    rtp.local_port = 40000;
    rtp.peer_port = 40002;
    let mut second_sim = sip;
    second_sim.sim_card = 1;
    second_sim.local_port = 5062;

    tb.cp_command("cptuple-add", &sip.encode());
    tb.cp_command("cptuple-add", &rtp.encode());
    tb.cp_command("cptuple-add", &second_sim.encode());
    assert!(eventually(|| tb.bridge.flows().len() == 6).await);

    tb.cp_command("cptuple-del", &rtp.encode());
    assert!(eventually(|| tb.bridge.flows().len() == 4).await);

    // An AP flow on SIM 0 survives a CP reset of SIM 0
    let mut ap = flow(MediaType::Sip, LinkType::Ap, SocketType::Ap);
    ap.local_port = 5070;
    tb.bridge.add_tuple(&ap).unwrap();
    assert_eq!(tb.next_control().await.command, "aptuple-add");

    tb.cp_command("cptuple-reset", &0u32.to_le_bytes());
    assert!(eventually(|| tb.bridge.flows().len() == 4).await);
    let flows = tb.bridge.flows();
    assert_eq!(flows.iter().filter(|f| f.kind == "aptuple").count(), 2);
    assert!(flows
        .iter()
        .filter(|f| f.kind == "cptuple")
        .all(|f| f.sim_card == 1));

    tb.bridge.shutdown().await;
}

#[tokio::test]
async fn test_malformed_cp_tuple_is_ignored() {
    let tb = Testbed::new();
    tb.start().await;

    let mut bad = flow(MediaType::Sip, LinkType::Cp, SocketType::Cp);
    bad.sim_card = 5;
    tb.cp_command("cptuple-add", &bad.encode());
    // Too short to hold a record; zero-extended and rejected
    tb.cp_command("cptuple-add", &[1, 2, 3]);
    tb.cp_command("echo-ping", b"\0");

    assert_eq!(tb.next_control().await.command, "echo-pong");
    assert!(tb.bridge.flows().is_empty());

    tb.bridge.shutdown().await;
}

#[tokio::test]
async fn test_esp_sequence_sync_both_ways() {
    let tb = Testbed::new();
    tb.start().await;

    tb.bridge.add_spi(0xc0ffee).unwrap();
    tb.bridge.add_spi(0xbeef).unwrap();
    assert_eq!(tb.next_control().await.command, "spi-add");
    assert_eq!(tb.next_control().await.command, "spi-add");

    let update = [
        EspRecord { spi: 0xc0ffee, seq: 77 },
        EspRecord { spi: 0x1, seq: 5 },
    ];
    tb.cp_command("cp-sync-esp", &encode_records(&update));
    assert!(
        eventually(|| tb
            .bridge
            .state()
            .esp()
            .records()
            .contains(&EspRecord { spi: 0xc0ffee, seq: 77 }))
        .await
    );

    tb.bridge.set_low_power(LowPowerState::Start).unwrap();
    let sync = tb.next_control().await;
    assert_eq!(sync.command, "ap-sync-esp");
    let mut records = decode_records(&sync.payload);
    records.sort_by_key(|r| r.spi);
    assert_eq!(
        records,
        vec![
            EspRecord { spi: 0xbeef, seq: 0 },
            EspRecord { spi: 0xc0ffee, seq: 77 },
        ]
    );
    let lp = tb.next_control().await;
    assert_eq!(lp.command, "lp-state");
    assert_eq!(read_u32(&lp.payload), LowPowerState::Start.wire_value());

    tb.bridge.del_spi(0xbeef).unwrap();
    assert_eq!(tb.next_control().await.command, "spi-del");

    tb.bridge.shutdown().await;
}

#[tokio::test]
async fn test_mac_addresses_are_forwarded() {
    let tb = Testbed::new();
    tb.start().await;

    tb.bridge.send_local_mac([2, 0, 0, 0, 0, 1]).unwrap();
    tb.bridge.send_remote_mac([2, 0, 0, 0, 0, 2]).unwrap();

    let local = tb.next_control().await;
    assert_eq!(local.command, "local-mac");
    assert_eq!(&local.payload[..], &[2, 0, 0, 0, 0, 1]);
    let remote = tb.next_control().await;
    assert_eq!(remote.command, "remote-mac");
    assert_eq!(&remote.payload[..], &[2, 0, 0, 0, 0, 2]);

    tb.bridge.shutdown().await;
}

#[tokio::test]
async fn test_ap_tuple_reset_only_touches_ap_flows() {
    let tb = Testbed::new();
    tb.start().await;

    tb.cp_command(
        "cptuple-add",
        &flow(MediaType::Sip, LinkType::Cp, SocketType::Cp).encode(),
    );
    tb.bridge
        .add_tuple(&flow(MediaType::Sip, LinkType::Ap, SocketType::Ap))
        .unwrap();
    assert!(eventually(|| tb.bridge.flows().len() == 4).await);

    assert_eq!(tb.bridge.reset_tuples(0).unwrap(), 2);
    let flows = tb.bridge.flows();
    assert_eq!(flows.len(), 2);
    assert!(flows.iter().all(|f| f.kind == FlowType::Cp.label()));

    tb.bridge.shutdown().await;
}
