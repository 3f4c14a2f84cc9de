//! Packet interception and relay decisions
//!
//! The host calls [`PacketInterceptor::ingress`] for every packet arriving
//! at the AP stack and [`PacketInterceptor::egress`] for every packet
//! leaving it. The router either hands the packet back ([`Verdict::Accept`])
//! or takes it and relays it to the CP over the data channel
//! ([`Verdict::Stolen`]).
//!
//! # Architecture
//!
//! ```text
//! ingress/egress ─► tuple (conntrack or parse) ─► ESP seq tracking
//!                        │
//!                        ▼
//!                  FlowTable match ─► decision ─► PacketCodec ─► data channel
//!
//! data channel ─► PacketCodec ─► deliver_from_cp ─► HostStack input/output
//! ```
//!
//! Ingress relays a matched flow whose socket lives on the CP. Egress relays
//! a matched flow whose bearer is currently owned by the CP, taking handover
//! state into account, and relays everything while the AP is in low power.
//! IKE always stays on the AP. Nothing on these paths ever fails the caller:
//! a packet that cannot be relayed after being taken is counted and dropped.

mod host;

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use crate::bridge::BridgeState;
use crate::flow::{FlowMeta, LinkType, MediaType, SocketType, Tuple};
use crate::packet::parse::{esp_in_udp, parse_tuple};
use crate::packet::{Direction, Packet, PacketCodec};
use crate::ratelimit::LogLimiter;
use crate::stats::Counter;

pub use host::{ChannelHostStack, HostDelivery, HostStack};

/// Outcome of intercepting a packet
#[derive(Debug)]
pub enum Verdict {
    /// Hand the packet back to the host stack unchanged
    Accept(Packet),
    /// The bridge consumed the packet
    Stolen,
}

impl Verdict {
    #[must_use]
    pub fn is_stolen(&self) -> bool {
        matches!(self, Self::Stolen)
    }
}

/// The two interception points
pub trait PacketInterceptor: Send + Sync {
    /// A packet arriving at the local stack
    fn ingress(&self, packet: Packet) -> Verdict;

    /// A packet leaving the local stack
    fn egress(&self, packet: Packet) -> Verdict;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Pass,
    Relay,
    /// No flow decided; low-power state decides on egress
    Undecided,
}

/// Routes intercepted packets between the host stack and the CP
pub struct Router {
    state: Arc<BridgeState>,
    codec: Arc<PacketCodec>,
    host: Arc<dyn HostStack>,
    ingress_log: LogLimiter,
    egress_log: LogLimiter,
    from_cp_log: LogLimiter,
}

impl Router {
    #[must_use]
    pub fn new(state: Arc<BridgeState>, codec: Arc<PacketCodec>, host: Arc<dyn HostStack>) -> Self {
        Self {
            state,
            codec,
            host,
            ingress_log: LogLimiter::default(),
            egress_log: LogLimiter::default(),
            from_cp_log: LogLimiter::default(),
        }
    }

    fn resolve(&self, packet: &Packet) -> Option<Tuple> {
        if let Some(tuple) = packet.conntrack() {
            return Some(*tuple);
        }
        let stats = self.state.stats();
        let tuple = parse_tuple(packet.data());
        if tuple.is_some() {
            stats.inc(Counter::ConntrackSlowPath);
        } else {
            stats.inc(Counter::ConntrackGetFail);
        }
        tuple
    }

    fn track_esp(&self, packet: &Packet, direction: Direction) {
        let Some((spi, seq)) = esp_in_udp(packet.data(), direction == Direction::Ingress) else {
            return;
        };
        if self.state.esp().observe(spi, seq) {
            trace!(?direction, spi = format_args!("{spi:#010x}"), seq, "ESP sequence observed");
        }
    }

    fn ingress_route(meta: &FlowMeta) -> Route {
        if meta.media_type == MediaType::Ike {
            return Route::Pass;
        }
        if meta.socket_type == SocketType::Cp {
            Route::Relay
        } else {
            Route::Pass
        }
    }

    fn egress_route(&self, meta: &FlowMeta) -> Route {
        if meta.media_type == MediaType::Ike {
            return Route::Pass;
        }
        // Already produced by the CP socket and relayed back
        if meta.socket_type == SocketType::Cp {
            return Route::Pass;
        }

        // Wi-Fi terminates on the AP and LTE on the CP
        let handover = self.state.handover();
        let cp_owns_bearer = match meta.link_type {
            LinkType::Cp => !handover.in_lte2wifi(meta.sim_card),
            LinkType::Ap => handover.in_wifi2lte(meta.sim_card),
            LinkType::Unspec => false,
        };
        if cp_owns_bearer {
            Route::Relay
        } else {
            Route::Undecided
        }
    }

    fn relay(&self, mut packet: Packet, direction: Direction) -> Verdict {
        if direction == Direction::Egress {
            packet.finalize_checksum();
        }

        let len = packet.len();
        let stats = self.state.stats();
        let log = match direction {
            Direction::Ingress => &self.ingress_log,
            Direction::Egress => &self.egress_log,
        };

        match self.codec.send(packet.into_bytes()) {
            Ok(()) => {
                stats.inc(Counter::PktsToCp);
                if log.allow() {
                    debug!(?direction, len, "Relayed packet to CP");
                }
            }
            Err(e) => {
                stats.inc(Counter::RelayFail);
                if log.allow() {
                    warn!(?direction, len, "Relay to CP failed, packet dropped: {}", e);
                }
            }
        }
        Verdict::Stolen
    }

    /// Hand a packet received from the CP to the host stack
    ///
    /// A packet belonging to a flow whose socket is on the CP leaves the
    /// device through the output path. Everything else, including packets
    /// whose tuple cannot be parsed, enters the input path with the
    /// configured firewall mark.
    pub fn deliver_from_cp(&self, packet: Bytes) {
        self.state.stats().inc(Counter::PktsFromCp);

        let to_output = parse_tuple(&packet).is_some_and(|tuple| {
            self.state
                .flows()
                .with_match(&tuple, |flow| flow.meta().socket_type == SocketType::Cp)
                .unwrap_or(false)
        });

        if self.from_cp_log.allow() {
            debug!(len = packet.len(), output = to_output, "Packet from CP");
        }
        if to_output {
            self.host.deliver_output(packet);
        } else {
            self.host
                .deliver_input(packet, self.state.settings().vowifi_in_mark);
        }
    }

    /// Shared state the router decides on
    #[must_use]
    pub fn state(&self) -> &Arc<BridgeState> {
        &self.state
    }
}

impl PacketInterceptor for Router {
    fn ingress(&self, packet: Packet) -> Verdict {
        if self.state.flows().is_empty() {
            return Verdict::Accept(packet);
        }
        let Some(tuple) = self.resolve(&packet) else {
            return Verdict::Accept(packet);
        };
        self.track_esp(&packet, Direction::Ingress);

        match self
            .state
            .flows()
            .with_match(&tuple, |flow| Self::ingress_route(flow.meta()))
        {
            Some(Route::Relay) => self.relay(packet, Direction::Ingress),
            _ => Verdict::Accept(packet),
        }
    }

    fn egress(&self, packet: Packet) -> Verdict {
        if self.state.flows().is_empty() {
            return Verdict::Accept(packet);
        }
        let Some(tuple) = self.resolve(&packet) else {
            return Verdict::Accept(packet);
        };
        self.track_esp(&packet, Direction::Egress);

        let route = self
            .state
            .flows()
            .with_match(&tuple, |flow| self.egress_route(flow.meta()))
            .unwrap_or(Route::Undecided);

        match route {
            Route::Relay => self.relay(packet, Direction::Egress),
            Route::Undecided if self.state.is_low_power() => {
                if self.egress_log.allow() {
                    info!(%tuple, "Low power, relaying egress packet to CP");
                }
                self.relay(packet, Direction::Egress)
            }
            Route::Pass | Route::Undecided => Verdict::Accept(packet),
        }
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("codec", &self.codec)
            .finish_non_exhaustive()
    }
}
