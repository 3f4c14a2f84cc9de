//! Handover tests
//!
//! Call legs reported through the management API drive both the triggers
//! sent to the CP and which side egress traffic leaves from.

use ims_bridge::control::read_u32;
use ims_bridge::flow::{LinkType, MediaType, SocketType};
use ims_bridge::handover::{CallState, HandoverState};
use ims_bridge::router::PacketInterceptor;

use super::{flow, uplink, Testbed};

#[tokio::test]
async fn test_lte_to_wifi_and_back() {
    let tb = Testbed::new();
    tb.start().await;

    // Media bearer owned by the CP
    tb.bridge
        .add_tuple(&flow(MediaType::RtpAudio, LinkType::Cp, SocketType::Ap))
        .unwrap();
    assert_eq!(tb.next_control().await.command, "aptuple-add");

    assert_eq!(
        tb.bridge.set_call_state(CallState::VoLte, 0).unwrap(),
        HandoverState::Finish
    );
    let message = tb.next_control().await;
    assert_eq!(message.command, "volte-call");
    assert_eq!(read_u32(&message.payload), 0);
    assert!(tb.bridge.router().egress(uplink(b"a")).is_stolen());
    tb.next_data().await;

    assert_eq!(
        tb.bridge.set_call_state(CallState::VoWifi, 0).unwrap(),
        HandoverState::Lte2Wifi
    );
    assert_eq!(tb.next_control().await.command, "ho-lte2wifi");
    assert!(tb.bridge.state().handover().in_lte2wifi(0));
    // The call is moving to Wi-Fi: the AP sends it now
    assert!(!tb.bridge.router().egress(uplink(b"b")).is_stolen());

    assert_eq!(
        tb.bridge.set_call_state(CallState::VoLte, 0).unwrap(),
        HandoverState::Finish
    );
    assert_eq!(tb.next_control().await.command, "ho-finish");
    assert!(tb.bridge.router().egress(uplink(b"c")).is_stolen());
    tb.next_data().await;

    assert_eq!(
        tb.bridge.set_call_state(CallState::End, 0).unwrap(),
        HandoverState::Finish
    );
    assert_eq!(tb.next_control().await.command, "call-end");

    tb.bridge.shutdown().await;
}

#[tokio::test]
async fn test_wifi_to_lte_moves_ap_bearer_to_cp() {
    let tb = Testbed::new();
    tb.start().await;

    tb.bridge
        .add_tuple(&flow(MediaType::RtpAudio, LinkType::Ap, SocketType::Ap))
        .unwrap();
    assert_eq!(tb.next_control().await.command, "aptuple-add");

    tb.bridge.set_call_state(CallState::VoWifi, 0).unwrap();
    assert_eq!(tb.next_control().await.command, "vowifi-call");
    assert!(!tb.bridge.router().egress(uplink(b"a")).is_stolen());

    assert_eq!(
        tb.bridge.set_call_state(CallState::VoLte, 0).unwrap(),
        HandoverState::Wifi2Lte
    );
    let message = tb.next_control().await;
    assert_eq!(message.command, "ho-wifi2lte");
    assert_eq!(read_u32(&message.payload), 0);
    assert!(tb.bridge.state().handover().in_wifi2lte(0));

    assert!(tb.bridge.router().egress(uplink(b"b")).is_stolen());
    let (_, chunk) = tb.next_data().await;
    assert!(chunk.ends_with(b"b"));

    tb.bridge.shutdown().await;
}

#[tokio::test]
async fn test_sims_are_independent() {
    let tb = Testbed::new();
    tb.start().await;

    tb.bridge.set_call_state(CallState::VoLte, 0).unwrap();
    tb.bridge.set_call_state(CallState::VoWifi, 1).unwrap();
    tb.bridge.set_call_state(CallState::VoWifi, 0).unwrap();

    let mut commands = Vec::new();
    for _ in 0..3 {
        let message = tb.next_control().await;
        commands.push((message.command, read_u32(&message.payload)));
    }
    assert_eq!(
        commands,
        vec![
            ("volte-call".to_string(), 0),
            ("vowifi-call".to_string(), 1),
            ("ho-lte2wifi".to_string(), 0),
        ]
    );

    let sims = tb.bridge.stats().sims;
    assert_eq!(sims.len(), 2);
    assert_eq!(sims[0].handover, HandoverState::Lte2Wifi);
    assert_eq!(sims[1].handover, HandoverState::Finish);
    assert_eq!(sims[1].init_call, CallState::VoWifi);

    tb.bridge.shutdown().await;
}

#[tokio::test]
async fn test_out_of_range_sim_is_rejected_without_messages() {
    let tb = Testbed::new();
    tb.start().await;

    assert!(tb.bridge.set_call_state(CallState::VoLte, 2).is_err());
    tb.bridge.echo_ping("marker").unwrap();
    assert_eq!(tb.next_control().await.command, "echo-ping");

    tb.bridge.shutdown().await;
}
