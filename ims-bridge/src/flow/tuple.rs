//! Flow tuples and their wire record
//!
//! A [`Tuple`] is the 5-tuple the bridge routes on. Registration happens
//! through a [`TupleRecord`], the fixed 42-byte structure exchanged with the
//! CP and accepted from the local control surface.
//!
//! # Record layout
//!
//! ```text
//! local_addr[16] peer_addr[16]
//! local_port:be16 peer_port:be16
//! l3proto:u8 l4proto:u8 media_type:u8 link_type:u8 socket_type:u8 sim_card:u8
//! ```
//!
//! IPv4 addresses occupy the first four bytes of their 16-byte field. New
//! fields may only be appended.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ProtocolError};

/// IP protocol numbers the bridge inspects
pub mod ip_proto {
    /// ICMP
    pub const ICMP: u8 = 1;
    /// TCP
    pub const TCP: u8 = 6;
    /// UDP
    pub const UDP: u8 = 17;
    /// IPsec ESP
    pub const ESP: u8 = 50;
    /// ICMPv6
    pub const ICMPV6: u8 = 58;
}

/// Size of an encoded [`TupleRecord`]
pub const TUPLE_RECORD_LEN: usize = 42;

/// Address family of a tuple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    /// Family of an address
    #[must_use]
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Self::Ipv4,
            IpAddr::V6(_) => Self::Ipv6,
        }
    }

    /// `l3proto` value used in the wire record
    #[must_use]
    pub const fn wire_value(self) -> u8 {
        match self {
            Self::Ipv4 => 4,
            Self::Ipv6 => 6,
        }
    }
}

/// A directional 5-tuple as seen on a packet
///
/// A port of 0 in a stored tuple is a wildcard for that side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tuple {
    /// Transport protocol number
    pub protocol: u8,
    /// Source address
    pub src: IpAddr,
    /// Source port (0 = any when stored)
    pub src_port: u16,
    /// Destination address
    pub dst: IpAddr,
    /// Destination port (0 = any when stored)
    pub dst_port: u16,
}

impl Tuple {
    /// Create a tuple
    #[must_use]
    pub const fn new(protocol: u8, src: IpAddr, src_port: u16, dst: IpAddr, dst_port: u16) -> Self {
        Self {
            protocol,
            src,
            src_port,
            dst,
            dst_port,
        }
    }

    /// Address family of the tuple
    #[must_use]
    pub fn family(&self) -> AddressFamily {
        AddressFamily::of(&self.src)
    }

    /// The same flow seen from the other direction
    #[must_use]
    pub const fn inverted(&self) -> Self {
        Self {
            protocol: self.protocol,
            src: self.dst,
            src_port: self.dst_port,
            dst: self.src,
            dst_port: self.src_port,
        }
    }

    /// Whether `self`, as a stored tuple, matches the packet tuple `packet`
    ///
    /// Addresses and protocol must be equal; a stored port of 0 matches any port.
    #[inline]
    #[must_use]
    pub fn matches(&self, packet: &Self) -> bool {
        self.protocol == packet.protocol
            && self.src == packet.src
            && self.dst == packet.dst
            && (self.src_port == 0 || self.src_port == packet.src_port)
            && (self.dst_port == 0 || self.dst_port == packet.dst_port)
    }

    /// The part of the tuple that selects a hash bucket
    ///
    /// Ports are excluded so that wildcard entries share a bucket with the
    /// concrete tuples they match.
    #[must_use]
    pub fn bucket_key(&self) -> (IpAddr, IpAddr, u8) {
        (self.src, self.dst, self.protocol)
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let proto = match self.protocol {
            ip_proto::TCP => "tcp".to_string(),
            ip_proto::UDP => "udp".to_string(),
            ip_proto::ICMP => "icmp".to_string(),
            ip_proto::ICMPV6 => "icmpv6".to_string(),
            ip_proto::ESP => "esp".to_string(),
            other => format!("proto{other}"),
        };
        match self.family() {
            AddressFamily::Ipv4 => write!(
                f,
                "{proto} {}:{} -> {}:{}",
                self.src, self.src_port, self.dst, self.dst_port
            ),
            AddressFamily::Ipv6 => write!(
                f,
                "{proto} [{}]:{} -> [{}]:{}",
                self.src, self.src_port, self.dst, self.dst_port
            ),
        }
    }
}

macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $field:literal { $($(#[$vmeta:meta])* $variant:ident = $value:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        #[repr(u8)]
        pub enum $name {
            $($(#[$vmeta])* $variant = $value),+
        }

        impl $name {
            /// Decode from the wire value
            ///
            /// # Errors
            ///
            /// Returns `ProtocolError::InvalidField` for values outside the enumeration.
            pub fn from_wire(value: u8) -> Result<Self, ProtocolError> {
                match value {
                    $($value => Ok(Self::$variant),)+
                    other => Err(ProtocolError::InvalidField {
                        field: $field,
                        value: u32::from(other),
                    }),
                }
            }

            /// Wire value
            #[must_use]
            pub const fn wire_value(self) -> u8 {
                self as u8
            }
        }
    };
}

wire_enum! {
    /// Kind of traffic a flow carries
    MediaType, "media_type" {
        Unspec = 0,
        Sip = 1,
        RtpAudio = 2,
        RtpVideo = 3,
        RtcpAudio = 4,
        RtcpVideo = 5,
        /// IKE is never relayed
        Ike = 6,
    }
}

wire_enum! {
    /// Which processor currently owns the radio bearer for a flow
    LinkType, "link_type" {
        Unspec = 0,
        Ap = 1,
        Cp = 2,
    }
}

wire_enum! {
    /// Which processor terminates the flow's socket
    SocketType, "socket_type" {
        Unspec = 0,
        Ap = 1,
        Cp = 2,
    }
}

/// Which side registered a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowType {
    /// Declared by the CP over the control channel
    Cp,
    /// Declared locally through the control API
    Ap,
}

impl FlowType {
    /// Label used in flow dumps
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Cp => "cptuple",
            Self::Ap => "aptuple",
        }
    }
}

/// Routing metadata attached to a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowMeta {
    pub media_type: MediaType,
    pub link_type: LinkType,
    pub socket_type: SocketType,
    pub sim_card: u8,
}

/// A flow registration as exchanged on the wire and through the control API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TupleRecord {
    pub local_addr: IpAddr,
    pub local_port: u16,
    pub peer_addr: IpAddr,
    pub peer_port: u16,
    /// Transport protocol number
    pub protocol: u8,
    pub media_type: MediaType,
    pub link_type: LinkType,
    pub socket_type: SocketType,
    pub sim_card: u8,
}

impl TupleRecord {
    /// Decode a record from the start of `buf`
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError` if `buf` is shorter than [`TUPLE_RECORD_LEN`] or
    /// a field is out of range.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < TUPLE_RECORD_LEN {
            return Err(ProtocolError::Truncated {
                what: "tuple record",
                len: buf.len(),
                need: TUPLE_RECORD_LEN,
            });
        }

        let l3proto = buf[36];
        let read_addr = |raw: &[u8]| -> Result<IpAddr, ProtocolError> {
            match l3proto {
                4 => Ok(IpAddr::V4(Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]))),
                6 => {
                    let mut octets = [0u8; 16];
                    octets.copy_from_slice(&raw[..16]);
                    Ok(IpAddr::V6(Ipv6Addr::from(octets)))
                }
                other => Err(ProtocolError::InvalidField {
                    field: "l3proto",
                    value: u32::from(other),
                }),
            }
        };

        Ok(Self {
            local_addr: read_addr(&buf[0..16])?,
            peer_addr: read_addr(&buf[16..32])?,
            local_port: u16::from_be_bytes([buf[32], buf[33]]),
            peer_port: u16::from_be_bytes([buf[34], buf[35]]),
            protocol: buf[37],
            media_type: MediaType::from_wire(buf[38])?,
            link_type: LinkType::from_wire(buf[39])?,
            socket_type: SocketType::from_wire(buf[40])?,
            sim_card: buf[41],
        })
    }

    /// Encode the record
    #[must_use]
    pub fn encode(&self) -> [u8; TUPLE_RECORD_LEN] {
        let mut out = [0u8; TUPLE_RECORD_LEN];
        write_addr(&mut out[0..16], &self.local_addr);
        write_addr(&mut out[16..32], &self.peer_addr);
        out[32..34].copy_from_slice(&self.local_port.to_be_bytes());
        out[34..36].copy_from_slice(&self.peer_port.to_be_bytes());
        out[36] = AddressFamily::of(&self.local_addr).wire_value();
        out[37] = self.protocol;
        out[38] = self.media_type.wire_value();
        out[39] = self.link_type.wire_value();
        out[40] = self.socket_type.wire_value();
        out[41] = self.sim_card;
        out
    }

    /// Check that the record can be registered
    ///
    /// # Errors
    ///
    /// Returns `ApiError` if the SIM index is out of range, any type field is
    /// unspecified, or the two addresses belong to different families.
    pub fn validate(&self, sim_count: u32) -> Result<(), ApiError> {
        if u32::from(self.sim_card) >= sim_count {
            return Err(ApiError::InvalidSimCard {
                sim: u32::from(self.sim_card),
                count: sim_count,
            });
        }
        if self.media_type == MediaType::Unspec {
            return Err(ApiError::InvalidTuple("media_type is unspecified".into()));
        }
        if self.link_type == LinkType::Unspec {
            return Err(ApiError::InvalidTuple("link_type is unspecified".into()));
        }
        if self.socket_type == SocketType::Unspec {
            return Err(ApiError::InvalidTuple("socket_type is unspecified".into()));
        }
        if AddressFamily::of(&self.local_addr) != AddressFamily::of(&self.peer_addr) {
            return Err(ApiError::InvalidTuple(format!(
                "address family mismatch: {} vs {}",
                self.local_addr, self.peer_addr
            )));
        }
        Ok(())
    }

    /// Tuple of packets travelling from the local end to the peer
    #[must_use]
    pub const fn tuple(&self) -> Tuple {
        Tuple::new(
            self.protocol,
            self.local_addr,
            self.local_port,
            self.peer_addr,
            self.peer_port,
        )
    }

    /// Routing metadata of the record
    #[must_use]
    pub const fn meta(&self) -> FlowMeta {
        FlowMeta {
            media_type: self.media_type,
            link_type: self.link_type,
            socket_type: self.socket_type,
            sim_card: self.sim_card,
        }
    }
}

fn write_addr(out: &mut [u8], addr: &IpAddr) {
    match addr {
        IpAddr::V4(v4) => out[..4].copy_from_slice(&v4.octets()),
        IpAddr::V6(v6) => out.copy_from_slice(&v6.octets()),
    }
}
