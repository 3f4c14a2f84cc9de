//! Inbound control command dispatch
//!
//! Commands are looked up by exact name in a static table. Each entry names
//! its handler, a fixed argument passed to the handler, and the payload
//! length the handler expects. Shorter payloads are zero-extended to that
//! length before dispatch, so older peers that send only a prefix of newer
//! fields keep working.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tracing::{debug, error, info, warn};

use super::message::{read_u32, ControlMessage, CONTROL_HEADER_LEN};
use super::commands;
use crate::bridge::BridgeState;
use crate::channel::{BlockHandler, RxBlock};
use crate::error::BridgeError;
use crate::esp::{decode_records, EspRecord};
use crate::flow::{FlowType, TupleRecord, TUPLE_RECORD_LEN};
use crate::ratelimit::LogLimiter;
use crate::stats::Counter;

/// Attempts at announcing `ltevideo-apsk` once the peer is up
const APSK_ATTEMPTS: usize = 10;

/// Pause between announcement attempts
const APSK_RETRY: Duration = Duration::from_millis(10);

type Handler = fn(&BridgeState, &[u8], u32);

struct CommandEntry {
    name: &'static str,
    handler: Handler,
    arg: u32,
    min_len: usize,
}

static COMMANDS: &[CommandEntry] = &[
    CommandEntry {
        name: commands::CPTUPLE_ADD,
        handler: handle_cptuple,
        arg: 1,
        min_len: TUPLE_RECORD_LEN,
    },
    CommandEntry {
        name: commands::CPTUPLE_DEL,
        handler: handle_cptuple,
        arg: 0,
        min_len: TUPLE_RECORD_LEN,
    },
    CommandEntry {
        name: commands::CPTUPLE_RESET,
        handler: handle_cptuple_reset,
        arg: 0,
        min_len: 4,
    },
    CommandEntry {
        name: commands::CP_RESET,
        handler: handle_cp_reset,
        arg: 0,
        min_len: 0,
    },
    CommandEntry {
        name: commands::ECHO_PING,
        handler: handle_echo_ping,
        arg: 0,
        min_len: 0,
    },
    CommandEntry {
        name: commands::ECHO_PONG,
        handler: handle_echo_pong,
        arg: 0,
        min_len: 0,
    },
    CommandEntry {
        name: commands::CP_SYNC_ESP,
        handler: handle_cp_sync_esp,
        arg: 0,
        min_len: 4,
    },
];

fn lookup(name: &str) -> Option<&'static CommandEntry> {
    COMMANDS.iter().find(|entry| entry.name == name)
}

fn handle_cptuple(state: &BridgeState, payload: &[u8], add: u32) {
    let record = match TupleRecord::decode(payload) {
        Ok(record) => record,
        Err(e) => {
            warn!("Ignoring malformed CP tuple: {}", e);
            return;
        }
    };

    let result = if add != 0 {
        state.register(&record, FlowType::Cp)
    } else {
        state
            .unregister(&record, FlowType::Cp)
            .map(|_| ())
            .map_err(BridgeError::from)
    };
    match result {
        Ok(()) => debug!(tuple = %record.tuple(), add = add != 0, "CP tuple applied"),
        Err(e) => warn!(tuple = %record.tuple(), "CP tuple rejected: {}", e),
    }
}

fn handle_cptuple_reset(state: &BridgeState, payload: &[u8], _: u32) {
    let sim = read_u32(payload);
    if let Err(e) = state.reset(FlowType::Cp, sim, false) {
        warn!("CP tuple reset rejected: {}", e);
    }
}

fn handle_cp_reset(state: &BridgeState, _: &[u8], _: u32) {
    info!("CP was reset, announcing video APSK again");
    state
        .control()
        .notify_u32(commands::LTEVIDEO_APSK, state.settings().volte_video_apsk);
}

fn handle_echo_ping(state: &BridgeState, payload: &[u8], _: u32) {
    let text = payload.split(|&b| b == 0).next().unwrap_or_default();
    // Leave room for the terminator
    let keep = text.len().min(state.control().max_payload().saturating_sub(1));
    let mut reply = Vec::with_capacity(keep + 1);
    reply.extend_from_slice(&text[..keep]);
    reply.push(0);

    debug!(text = %String::from_utf8_lossy(&reply[..keep]), "echo-ping");
    state.control().notify(commands::ECHO_PONG, &reply);
}

fn handle_echo_pong(_: &BridgeState, payload: &[u8], _: u32) {
    let text = payload.split(|&b| b == 0).next().unwrap_or_default();
    info!(text = %String::from_utf8_lossy(text), "echo-pong");
}

fn handle_cp_sync_esp(state: &BridgeState, payload: &[u8], _: u32) {
    let records: Vec<EspRecord> = decode_records(payload);
    let applied = state.esp().sync_from_peer(&records);
    info!(received = records.len(), applied, "ESP sequence numbers synced from CP");
}

/// Receives and dispatches control blocks
pub struct ControlDispatcher {
    state: Arc<BridgeState>,
    error_log: LogLimiter,
}

impl ControlDispatcher {
    #[must_use]
    pub fn new(state: Arc<BridgeState>) -> Self {
        Self {
            state,
            error_log: LogLimiter::default(),
        }
    }

    /// Decode and dispatch one control block
    pub fn dispatch(&self, block: &RxBlock) {
        let stats = self.state.stats();
        stats.inc(Counter::ControlRx);

        let message = match ControlMessage::decode(block.bytes()) {
            Ok(message) => message,
            Err(e) => {
                stats.inc(Counter::ControlInvalid);
                if self.error_log.allow() {
                    warn!(len = block.len(), "Dropping invalid control message: {}", e);
                }
                return;
            }
        };

        let Some(entry) = lookup(&message.command) else {
            stats.inc(Counter::ControlUnknown);
            warn!(command = %message.command, "Unknown control command");
            return;
        };

        debug!(command = entry.name, len = message.payload.len(), "Control command");
        if message.payload.len() < entry.min_len {
            let mut padded = BytesMut::zeroed(entry.min_len);
            padded[..message.payload.len()].copy_from_slice(&message.payload);
            (entry.handler)(&self.state, &padded, entry.arg);
        } else {
            (entry.handler)(&self.state, &message.payload, entry.arg);
        }
    }
}

#[async_trait]
impl BlockHandler for ControlDispatcher {
    fn header_len(&self) -> usize {
        CONTROL_HEADER_LEN
    }

    fn handle(&self, block: RxBlock) {
        self.dispatch(&block);
    }

    async fn on_peer_up(&self) -> Result<(), BridgeError> {
        let value = self.state.settings().volte_video_apsk;
        let mut attempt = 1;
        loop {
            match self.state.control().send_u32(commands::LTEVIDEO_APSK, value) {
                Ok(()) => {
                    info!(value, attempt, "Announced video APSK");
                    return Ok(());
                }
                Err(e) if attempt >= APSK_ATTEMPTS => {
                    error!("Giving up announcing video APSK after {} attempts: {}", attempt, e);
                    return Err(e);
                }
                Err(e) => {
                    debug!(attempt, "Video APSK announcement failed: {}", e);
                    attempt += 1;
                    tokio::time::sleep(APSK_RETRY).await;
                }
            }
        }
    }
}

impl std::fmt::Debug for ControlDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlDispatcher").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{BlockChannel, MemoryChannel};
    use crate::config::Config;
    use crate::flow::{ip_proto, LinkType, MediaType, SocketType};
    use crate::stats::BridgeStats;

    struct Harness {
        dispatcher: ControlDispatcher,
        state: Arc<BridgeState>,
        cp: MemoryChannel,
    }

    fn harness() -> Harness {
        let (ap, cp) = MemoryChannel::pair("control", 128, 8);
        let state = Arc::new(BridgeState::new(
            &Config::default_config(),
            Arc::new(ap),
            Arc::new(BridgeStats::new()),
        ));
        Harness {
            dispatcher: ControlDispatcher::new(Arc::clone(&state)),
            state,
            cp,
        }
    }

    fn block(command: &str, payload: &[u8]) -> RxBlock {
        let mut buf = BytesMut::new();
        ControlMessage::encode(command, payload, 1024, &mut buf).unwrap();
        RxBlock::new(buf.freeze(), None)
    }

    fn record() -> TupleRecord {
        TupleRecord {
            local_addr: "10.0.0.5".parse().unwrap(),
            local_port: 5000,
            peer_addr: "1.2.3.4".parse().unwrap(),
            peer_port: 6000,
            protocol: ip_proto::UDP,
            media_type: MediaType::Sip,
            link_type: LinkType::Cp,
            socket_type: SocketType::Cp,
            sim_card: 0,
        }
    }

    #[test]
    fn test_registry_names_are_unique() {
        let names: std::collections::HashSet<_> = COMMANDS.iter().map(|e| e.name).collect();
        assert_eq!(names.len(), COMMANDS.len());
        assert!(lookup("cptuple-add").is_some());
        assert!(lookup("cptuple").is_none());
    }

    #[test]
    fn test_cptuple_add_and_del() {
        let h = harness();
        h.dispatcher.dispatch(&block("cptuple-add", &record().encode()));
        assert_eq!(h.state.flows().len(), 2);

        h.dispatcher.dispatch(&block("cptuple-del", &record().encode()));
        assert!(h.state.flows().is_empty());
        assert_eq!(h.state.stats().get(Counter::ControlRx), 2);
    }

    #[test]
    fn test_short_payload_is_zero_extended() {
        let h = harness();
        // Missing sim_card byte; zero-extension supplies SIM 0
        let encoded = record().encode();
        h.dispatcher
            .dispatch(&block("cptuple-add", &encoded[..TUPLE_RECORD_LEN - 1]));
        assert_eq!(h.state.flows().len(), 2);

        // An empty reset payload resets SIM 0
        h.dispatcher.dispatch(&block("cptuple-reset", &[]));
        assert!(h.state.flows().is_empty());
    }

    #[test]
    fn test_invalid_and_unknown_counted() {
        let h = harness();
        h.dispatcher
            .dispatch(&RxBlock::new(bytes::Bytes::from_static(&[1u8; 30]), None));
        h.dispatcher.dispatch(&block("no-such-command", &[]));

        let stats = h.state.stats();
        assert_eq!(stats.get(Counter::ControlRx), 2);
        assert_eq!(stats.get(Counter::ControlInvalid), 1);
        assert_eq!(stats.get(Counter::ControlUnknown), 1);
    }

    #[test]
    fn test_invalid_record_ignored() {
        let h = harness();
        let mut bad = record();
        bad.sim_card = 9;
        h.dispatcher.dispatch(&block("cptuple-add", &bad.encode()));
        assert!(h.state.flows().is_empty());
    }

    #[tokio::test]
    async fn test_echo_ping_replies_pong() {
        let h = harness();
        h.dispatcher.dispatch(&block("echo-ping", b"hello\0"));

        let reply = h.cp.receive().await.unwrap();
        let message = ControlMessage::decode(reply.bytes()).unwrap();
        assert_eq!(message.command, "echo-pong");
        assert_eq!(&message.payload[..], b"hello\0");
    }

    #[tokio::test]
    async fn test_echo_ping_reply_is_capped() {
        let h = harness();
        let long = vec![b'a'; 200];
        h.dispatcher.dispatch(&block("echo-ping", &long));

        let reply = h.cp.receive().await.unwrap();
        let message = ControlMessage::decode(reply.bytes()).unwrap();
        assert_eq!(message.payload.len(), 128 - CONTROL_HEADER_LEN);
        assert_eq!(message.payload.last(), Some(&0));
    }

    #[tokio::test]
    async fn test_cp_reset_reannounces_apsk() {
        let h = harness();
        h.dispatcher.dispatch(&block("cp-reset", &[]));

        let reply = h.cp.receive().await.unwrap();
        let message = ControlMessage::decode(reply.bytes()).unwrap();
        assert_eq!(message.command, "ltevideo-apsk");
        assert_eq!(read_u32(&message.payload), 1);
    }

    #[test]
    fn test_cp_sync_esp() {
        let h = harness();
        h.state.esp().add(0x10).unwrap();
        let payload = crate::esp::encode_records(&[EspRecord { spi: 0x10, seq: 42 }]);
        h.dispatcher.dispatch(&block("cp-sync-esp", &payload));
        assert_eq!(h.state.esp().records(), vec![EspRecord { spi: 0x10, seq: 42 }]);
    }

    #[tokio::test]
    async fn test_peer_up_announces_apsk() {
        let h = harness();
        h.dispatcher.on_peer_up().await.unwrap();
        let block = h.cp.receive().await.unwrap();
        let message = ControlMessage::decode(block.bytes()).unwrap();
        assert_eq!(message.command, "ltevideo-apsk");
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_up_gives_up() {
        let (ap, cp) = MemoryChannel::pair("control", 128, 1);
        let state = Arc::new(BridgeState::new(
            &Config::default_config(),
            Arc::new(ap),
            Arc::new(BridgeStats::new()),
        ));
        // Exhaust the only block
        state.control().send_u32("lp-state", 1).unwrap();
        let dispatcher = ControlDispatcher::new(state);
        assert!(dispatcher.on_peer_up().await.is_err());
        drop(cp);
    }
}
