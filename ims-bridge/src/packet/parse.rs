//! Raw IP header inspection
//!
//! Used when the interception point has no connection-tracking entry for a
//! packet. Parsing works directly on `&[u8]` and never allocates.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::flow::{ip_proto, Tuple};

/// UDP port used for ESP-in-UDP (NAT traversal)
pub const NAT_T_PORT: u16 = 4500;

const IPV4_MIN_HEADER: usize = 20;
const IPV6_HEADER: usize = 40;
const ICMP_HEADER: usize = 8;
const UDP_HEADER: usize = 8;

/// Network-layer facts about a packet
#[derive(Debug, Clone, Copy)]
struct L3 {
    src: IpAddr,
    dst: IpAddr,
    protocol: u8,
    l4_offset: usize,
    /// Length of the L3 payload according to the header
    l4_len: usize,
}

fn parse_l3(packet: &[u8]) -> Option<L3> {
    match packet.first()? >> 4 {
        4 => parse_ipv4(packet),
        6 => parse_ipv6(packet),
        _ => None,
    }
}

fn parse_ipv4(packet: &[u8]) -> Option<L3> {
    if packet.len() < IPV4_MIN_HEADER {
        return None;
    }
    let ihl = usize::from(packet[0] & 0x0f) * 4;
    if ihl < IPV4_MIN_HEADER || packet.len() < ihl {
        return None;
    }
    // Later fragments carry no transport header
    let frag_offset = u16::from_be_bytes([packet[6], packet[7]]) & 0x1fff;
    if frag_offset != 0 {
        return None;
    }
    let total = usize::from(u16::from_be_bytes([packet[2], packet[3]]));
    let end = total.clamp(ihl, packet.len());

    Some(L3 {
        src: IpAddr::V4(Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15])),
        dst: IpAddr::V4(Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19])),
        protocol: packet[9],
        l4_offset: ihl,
        l4_len: end - ihl,
    })
}

fn parse_ipv6(packet: &[u8]) -> Option<L3> {
    if packet.len() < IPV6_HEADER {
        return None;
    }
    let mut src = [0u8; 16];
    let mut dst = [0u8; 16];
    src.copy_from_slice(&packet[8..24]);
    dst.copy_from_slice(&packet[24..40]);
    let payload_len = usize::from(u16::from_be_bytes([packet[4], packet[5]]));
    let end = (IPV6_HEADER + payload_len).min(packet.len());

    let mut next = packet[6];
    let mut offset = IPV6_HEADER;
    // Hop-by-hop, routing, fragment and destination options
    for _ in 0..8 {
        match next {
            0 | 43 | 60 => {
                let ext = packet.get(offset..offset + 2)?;
                next = ext[0];
                offset += (usize::from(ext[1]) + 1) * 8;
            }
            44 => {
                let ext = packet.get(offset..offset + 8)?;
                if u16::from_be_bytes([ext[2], ext[3]]) >> 3 != 0 {
                    return None;
                }
                next = ext[0];
                offset += 8;
            }
            _ => break,
        }
    }
    if offset > end {
        return None;
    }

    Some(L3 {
        src: IpAddr::V6(Ipv6Addr::from(src)),
        dst: IpAddr::V6(Ipv6Addr::from(dst)),
        protocol: next,
        l4_offset: offset,
        l4_len: end - offset,
    })
}

/// Port pair of a transport header
///
/// ICMP has no ports; echo messages report their identifier as the source
/// port and every ICMP message reports `type << 8 | code` as the destination
/// port. Other protocols report zero ports.
fn ports(protocol: u8, l4: &[u8]) -> Option<(u16, u16)> {
    match protocol {
        ip_proto::TCP | ip_proto::UDP => {
            let h = l4.get(..4)?;
            Some((
                u16::from_be_bytes([h[0], h[1]]),
                u16::from_be_bytes([h[2], h[3]]),
            ))
        }
        ip_proto::ICMP | ip_proto::ICMPV6 => {
            let h = l4.get(..2)?;
            let is_echo = matches!((protocol, h[0]), (ip_proto::ICMP, 0 | 8) | (ip_proto::ICMPV6, 128 | 129));
            let id = if is_echo {
                l4.get(4..6).map_or(0, |id| u16::from_be_bytes([id[0], id[1]]))
            } else {
                0
            };
            Some((id, u16::from_be_bytes([h[0], h[1]])))
        }
        _ => Some((0, 0)),
    }
}

fn is_icmp_error(protocol: u8, l4: &[u8]) -> bool {
    match (protocol, l4.first()) {
        (ip_proto::ICMP, Some(t)) => matches!(t, 3 | 4 | 5 | 11 | 12),
        (ip_proto::ICMPV6, Some(t)) => matches!(t, 1..=4),
        _ => false,
    }
}

fn parse_plain(packet: &[u8]) -> Option<(Tuple, L3)> {
    let l3 = parse_l3(packet)?;
    let l4 = &packet[l3.l4_offset..];
    let (src_port, dst_port) = ports(l3.protocol, l4)?;
    Some((
        Tuple::new(l3.protocol, l3.src, src_port, l3.dst, dst_port),
        l3,
    ))
}

/// Resolve the 5-tuple of a raw IP packet
///
/// ICMP error messages resolve to the inverted tuple of the packet they
/// quote, so they follow the flow that triggered them. If the quoted packet
/// cannot be parsed the outer tuple is used.
#[must_use]
pub fn parse_tuple(packet: &[u8]) -> Option<Tuple> {
    let (outer, l3) = parse_plain(packet)?;
    let l4 = &packet[l3.l4_offset..];

    if is_icmp_error(l3.protocol, l4) {
        if let Some((inner, _)) = l4.get(ICMP_HEADER..).and_then(parse_plain) {
            if inner.family() == outer.family() {
                return Some(inner.inverted());
            }
        }
    }
    Some(outer)
}

/// SPI and sequence number of an ESP-in-UDP packet on the NAT-T port
///
/// With `check_source_port` the source port must be 4500 (packets arriving),
/// otherwise the destination port (packets leaving). Only IPv4 is inspected.
/// Non-ESP markers (SPI 0) and keepalives yield `None`.
#[must_use]
pub fn esp_in_udp(packet: &[u8], check_source_port: bool) -> Option<(u32, u32)> {
    if packet.first()? >> 4 != 4 {
        return None;
    }
    let l3 = parse_ipv4(packet)?;
    if l3.protocol != ip_proto::UDP {
        return None;
    }
    let udp = &packet[l3.l4_offset..];
    let (src_port, dst_port) = ports(ip_proto::UDP, udp)?;
    let port = if check_source_port { src_port } else { dst_port };
    if port != NAT_T_PORT {
        return None;
    }

    let esp = udp.get(UDP_HEADER..UDP_HEADER + 8)?;
    let spi = u32::from_be_bytes([esp[0], esp[1], esp[2], esp[3]]);
    if spi == 0 {
        return None;
    }
    let seq = u32::from_be_bytes([esp[4], esp[5], esp[6], esp[7]]);
    Some((spi, seq))
}

/// Compute and store the TCP or UDP checksum of a packet in place
///
/// Returns `false` if the packet is not TCP/UDP or is malformed.
pub fn finalize_l4_checksum(packet: &mut [u8]) -> bool {
    let Some(l3) = parse_l3(packet) else {
        return false;
    };
    let field = match l3.protocol {
        ip_proto::TCP => 16,
        ip_proto::UDP => 6,
        _ => return false,
    };
    let start = l3.l4_offset;
    let end = start + l3.l4_len;
    if end > packet.len() || l3.l4_len < field + 2 {
        return false;
    }

    packet[start + field] = 0;
    packet[start + field + 1] = 0;

    let mut sum = pseudo_header_sum(&l3);
    sum += ones_complement_sum(&packet[start..end]);
    let mut checksum = !fold(sum);
    if checksum == 0 && l3.protocol == ip_proto::UDP {
        checksum = 0xffff;
    }
    packet[start + field..start + field + 2].copy_from_slice(&checksum.to_be_bytes());
    true
}

fn pseudo_header_sum(l3: &L3) -> u64 {
    let mut sum = 0u64;
    match (l3.src, l3.dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            sum += ones_complement_sum(&s.octets());
            sum += ones_complement_sum(&d.octets());
        }
        (IpAddr::V6(s), IpAddr::V6(d)) => {
            sum += ones_complement_sum(&s.octets());
            sum += ones_complement_sum(&d.octets());
        }
        _ => {}
    }
    sum += u64::from(l3.protocol);
    sum += l3.l4_len as u64;
    sum
}

fn ones_complement_sum(data: &[u8]) -> u64 {
    let mut chunks = data.chunks_exact(2);
    let mut sum: u64 = chunks
        .by_ref()
        .map(|w| u64::from(u16::from_be_bytes([w[0], w[1]])))
        .sum();
    if let [last] = chunks.remainder() {
        sum += u64::from(*last) << 8;
    }
    sum
}

fn fold(mut sum: u64) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum as u16
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build an IPv4 packet with a UDP or TCP header and payload
    pub(crate) fn ipv4(
        protocol: u8,
        src: [u8; 4],
        src_port: u16,
        dst: [u8; 4],
        dst_port: u16,
        payload: &[u8],
    ) -> Vec<u8> {
        let l4_len = if protocol == ip_proto::TCP { 20 } else { 8 };
        let total = 20 + l4_len + payload.len();
        let mut p = vec![0u8; total];
        p[0] = 0x45;
        p[2..4].copy_from_slice(&(total as u16).to_be_bytes());
        p[8] = 64;
        p[9] = protocol;
        p[12..16].copy_from_slice(&src);
        p[16..20].copy_from_slice(&dst);
        p[20..22].copy_from_slice(&src_port.to_be_bytes());
        p[22..24].copy_from_slice(&dst_port.to_be_bytes());
        if protocol == ip_proto::UDP {
            p[24..26].copy_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
        } else if protocol == ip_proto::TCP {
            p[32] = 0x50;
        }
        p[20 + l4_len..].copy_from_slice(payload);
        p
    }

    /// Build an IPv6 UDP packet
    pub(crate) fn ipv6_udp(src: Ipv6Addr, src_port: u16, dst: Ipv6Addr, dst_port: u16) -> Vec<u8> {
        let mut p = vec![0u8; 48];
        p[0] = 0x60;
        p[4..6].copy_from_slice(&8u16.to_be_bytes());
        p[6] = ip_proto::UDP;
        p[7] = 64;
        p[8..24].copy_from_slice(&src.octets());
        p[24..40].copy_from_slice(&dst.octets());
        p[40..42].copy_from_slice(&src_port.to_be_bytes());
        p[42..44].copy_from_slice(&dst_port.to_be_bytes());
        p[44..46].copy_from_slice(&8u16.to_be_bytes());
        p
    }

    fn icmp_error_quoting(quoted: &[u8]) -> Vec<u8> {
        let total = 20 + ICMP_HEADER + quoted.len();
        let mut p = vec![0u8; total];
        p[0] = 0x45;
        p[2..4].copy_from_slice(&(total as u16).to_be_bytes());
        p[9] = ip_proto::ICMP;
        // Router 192.0.2.1 tells 10.0.0.5 the destination is unreachable
        p[12..16].copy_from_slice(&[192, 0, 2, 1]);
        p[16..20].copy_from_slice(&[10, 0, 0, 5]);
        p[20] = 3;
        p[21] = 1;
        p[28..].copy_from_slice(quoted);
        p
    }

    #[test]
    fn test_parse_ipv4_udp() {
        let p = ipv4(ip_proto::UDP, [10, 0, 0, 5], 5000, [1, 2, 3, 4], 6000, b"hi");
        let t = parse_tuple(&p).unwrap();
        assert_eq!(t.to_string(), "udp 10.0.0.5:5000 -> 1.2.3.4:6000");
    }

    #[test]
    fn test_parse_ipv4_tcp() {
        let p = ipv4(ip_proto::TCP, [10, 0, 0, 5], 443, [1, 2, 3, 4], 51000, b"");
        let t = parse_tuple(&p).unwrap();
        assert_eq!(t.protocol, ip_proto::TCP);
        assert_eq!((t.src_port, t.dst_port), (443, 51000));
    }

    #[test]
    fn test_parse_ipv6_udp() {
        let src: Ipv6Addr = "2001:db8::5".parse().unwrap();
        let dst: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let t = parse_tuple(&ipv6_udp(src, 5060, dst, 5062)).unwrap();
        assert_eq!(t.src, IpAddr::V6(src));
        assert_eq!(t.dst_port, 5062);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_tuple(&[]).is_none());
        assert!(parse_tuple(&[0x45, 0, 0]).is_none());
        assert!(parse_tuple(&[0x10; 40]).is_none());

        let mut later_fragment = ipv4(ip_proto::UDP, [10, 0, 0, 5], 1, [1, 2, 3, 4], 2, b"");
        later_fragment[7] = 0x10;
        assert!(parse_tuple(&later_fragment).is_none());
    }

    #[test]
    fn test_icmp_error_uses_inverted_inner_tuple() {
        // 10.0.0.5:5000 -> 1.2.3.4:6000 bounced back
        let quoted = ipv4(ip_proto::UDP, [10, 0, 0, 5], 5000, [1, 2, 3, 4], 6000, b"");
        let t = parse_tuple(&icmp_error_quoting(&quoted)).unwrap();
        assert_eq!(t.to_string(), "udp 1.2.3.4:6000 -> 10.0.0.5:5000");
    }

    #[test]
    fn test_icmp_error_falls_back_to_outer() {
        let t = parse_tuple(&icmp_error_quoting(&[0xff, 0, 0])).unwrap();
        assert_eq!(t.protocol, ip_proto::ICMP);
        assert_eq!(t.dst_port, 0x0301);
    }

    #[test]
    fn test_esp_in_udp_detection() {
        let mut esp = vec![0u8; 12];
        esp[0..4].copy_from_slice(&0x1122_3344u32.to_be_bytes());
        esp[4..8].copy_from_slice(&7u32.to_be_bytes());
        let inbound = ipv4(ip_proto::UDP, [1, 2, 3, 4], NAT_T_PORT, [10, 0, 0, 5], 4500, &esp);
        assert_eq!(esp_in_udp(&inbound, true), Some((0x1122_3344, 7)));

        let wrong_port = ipv4(ip_proto::UDP, [1, 2, 3, 4], 500, [10, 0, 0, 5], 4501, &esp);
        assert_eq!(esp_in_udp(&wrong_port, true), None);
        assert_eq!(esp_in_udp(&wrong_port, false), None);

        let ike = ipv4(ip_proto::UDP, [1, 2, 3, 4], NAT_T_PORT, [10, 0, 0, 5], 4500, &[0u8; 12]);
        assert_eq!(esp_in_udp(&ike, true), None);
    }

    #[test]
    fn test_udp_checksum_finalize() {
        let mut p = ipv4(ip_proto::UDP, [10, 0, 0, 5], 5000, [1, 2, 3, 4], 6000, b"payload!");
        assert!(finalize_l4_checksum(&mut p));
        let l3 = parse_l3(&p).unwrap();
        let total = pseudo_header_sum(&l3) + ones_complement_sum(&p[20..]);
        assert_eq!(fold(total), 0xffff);
        assert_ne!(&p[26..28], &[0, 0]);
    }

    #[test]
    fn test_checksum_skips_other_protocols() {
        let mut p = ipv4(ip_proto::ESP, [10, 0, 0, 5], 0, [1, 2, 3, 4], 0, b"");
        assert!(!finalize_l4_checksum(&mut p));
    }
}
