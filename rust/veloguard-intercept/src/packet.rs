//! Captured IP packet view built with smoltcp wire types

use crate::error::{InterceptError, Result};
use bytes::Bytes;
use smoltcp::wire::{IpProtocol, Ipv4Packet, Ipv6Packet, TcpPacket, UdpPacket};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;
pub const PROTO_ICMPV6: u8 = 58;

/// Owner reported for TCP/UDP flows when the capture layer has no uid
pub const SYSTEM_UID: i32 = 2000;
pub const UNKNOWN_UID: i32 = -1;

/// Owner uid the capture layer assumes when none was reported
pub fn resolve_uid(protocol: u8) -> i32 {
    match protocol {
        PROTO_TCP | PROTO_UDP => SYSTEM_UID,
        _ => UNKNOWN_UID,
    }
}

/// Protocols the classifier may admit
pub fn is_supported_protocol(protocol: u8) -> bool {
    matches!(protocol, PROTO_ICMP | PROTO_ICMPV6 | PROTO_TCP | PROTO_UDP)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpVersion {
    V4,
    V6,
}

/// Flow identity: protocol plus both socket addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub protocol: u8,
    pub src: SocketAddr,
    pub dst: SocketAddr,
}

impl FlowKey {
    pub fn new(protocol: u8, src: SocketAddr, dst: SocketAddr) -> Self {
        Self { protocol, src, dst }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {} (proto {})", self.src, self.dst, self.protocol)
    }
}

/// One IP datagram as it left the device
#[derive(Clone)]
pub struct CapturedPacket {
    pub version: IpVersion,
    pub protocol: u8,
    pub uid: i32,
    /// Port is 0 for protocols without ports
    pub src: SocketAddr,
    pub dst: SocketAddr,
    raw: Bytes,
    payload_offset: usize,
}

impl CapturedPacket {
    pub fn new(
        version: IpVersion,
        protocol: u8,
        uid: i32,
        src: SocketAddr,
        dst: SocketAddr,
        raw: Bytes,
    ) -> Self {
        Self {
            version,
            protocol,
            uid,
            src,
            dst,
            payload_offset: raw.len(),
            raw,
        }
    }

    /// Parse a raw IPv4 or IPv6 datagram owned by `uid`
    pub fn parse(uid: i32, raw: Bytes) -> Result<Self> {
        let first = *raw.first().ok_or(InterceptError::PacketTooShort {
            expected: 1,
            actual: 0,
        })?;
        match first >> 4 {
            4 => Self::parse_ipv4(uid, raw),
            6 => Self::parse_ipv6(uid, raw),
            v => Err(InterceptError::InvalidIpVersion(v)),
        }
    }

    fn parse_ipv4(uid: i32, raw: Bytes) -> Result<Self> {
        let pkt = Ipv4Packet::new_checked(raw.as_ref())
            .map_err(|e| InterceptError::InvalidPacket(format!("IPv4: {}", e)))?;
        let header_len = pkt.header_len() as usize;
        let src = IpAddr::V4(pkt.src_addr());
        let dst = IpAddr::V4(pkt.dst_addr());
        let protocol = pkt.next_header();
        let (src_port, dst_port, transport_len) = parse_transport(protocol, pkt.payload())?;

        Ok(Self {
            version: IpVersion::V4,
            protocol: protocol.into(),
            uid,
            src: SocketAddr::new(src, src_port),
            dst: SocketAddr::new(dst, dst_port),
            payload_offset: header_len + transport_len,
            raw,
        })
    }

    fn parse_ipv6(uid: i32, raw: Bytes) -> Result<Self> {
        let pkt = Ipv6Packet::new_checked(raw.as_ref())
            .map_err(|e| InterceptError::InvalidPacket(format!("IPv6: {}", e)))?;
        let src = IpAddr::V6(pkt.src_addr());
        let dst = IpAddr::V6(pkt.dst_addr());
        let protocol = pkt.next_header();
        let (src_port, dst_port, transport_len) = parse_transport(protocol, pkt.payload())?;

        Ok(Self {
            version: IpVersion::V6,
            protocol: protocol.into(),
            uid,
            src: SocketAddr::new(src, src_port),
            dst: SocketAddr::new(dst, dst_port),
            payload_offset: 40 + transport_len,
            raw,
        })
    }

    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    /// Transport payload; empty for packets built with [`CapturedPacket::new`]
    pub fn payload(&self) -> &[u8] {
        self.raw.get(self.payload_offset..).unwrap_or(&[])
    }

    pub fn flow_key(&self) -> FlowKey {
        FlowKey::new(self.protocol, self.src, self.dst)
    }

    pub fn is_tcp(&self) -> bool {
        self.protocol == PROTO_TCP
    }

    pub fn is_udp(&self) -> bool {
        self.protocol == PROTO_UDP
    }

    pub fn is_icmp(&self) -> bool {
        self.protocol == PROTO_ICMP || self.protocol == PROTO_ICMPV6
    }

    pub fn is_dns(&self) -> bool {
        self.is_udp() && self.dst.port() == 53
    }
}

impl fmt::Debug for CapturedPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapturedPacket")
            .field("version", &self.version)
            .field("protocol", &self.protocol)
            .field("uid", &self.uid)
            .field("src", &self.src)
            .field("dst", &self.dst)
            .field("len", &self.raw.len())
            .finish()
    }
}

/// Ports and header length of the transport layer, zeros for portless protocols
fn parse_transport(protocol: IpProtocol, payload: &[u8]) -> Result<(u16, u16, usize)> {
    match protocol {
        IpProtocol::Tcp => {
            let tcp = TcpPacket::new_checked(payload)
                .map_err(|e| InterceptError::InvalidPacket(format!("TCP: {}", e)))?;
            Ok((tcp.src_port(), tcp.dst_port(), tcp.header_len() as usize))
        }
        IpProtocol::Udp => {
            let udp = UdpPacket::new_checked(payload)
                .map_err(|e| InterceptError::InvalidPacket(format!("UDP: {}", e)))?;
            Ok((udp.src_port(), udp.dst_port(), 8))
        }
        _ => Ok((0, 0, 0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{ipv4_packet, ipv6_packet, tcp_segment, udp_datagram};
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_parse_ipv4_udp() {
        let raw = ipv4_packet(
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(8, 8, 8, 8),
            PROTO_UDP,
            &udp_datagram(40000, 53, b"query"),
        );
        let pkt = CapturedPacket::parse(10123, Bytes::from(raw)).unwrap();
        assert_eq!(pkt.version, IpVersion::V4);
        assert_eq!(pkt.protocol, PROTO_UDP);
        assert_eq!(pkt.uid, 10123);
        assert_eq!(pkt.src, "10.0.0.2:40000".parse().unwrap());
        assert_eq!(pkt.dst, "8.8.8.8:53".parse().unwrap());
        assert_eq!(pkt.payload(), b"query");
        assert!(pkt.is_dns());
    }

    #[test]
    fn test_parse_ipv4_tcp() {
        let raw = ipv4_packet(
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(1, 1, 1, 1),
            PROTO_TCP,
            &tcp_segment(50000, 443),
        );
        let pkt = CapturedPacket::parse(0, Bytes::from(raw)).unwrap();
        assert!(pkt.is_tcp());
        assert_eq!(pkt.dst.port(), 443);
        assert!(pkt.payload().is_empty());
    }

    #[test]
    fn test_parse_ipv6_and_icmp() {
        let raw = ipv6_packet(
            Ipv6Addr::LOCALHOST,
            "2001:db8::1".parse().unwrap(),
            PROTO_UDP,
            &udp_datagram(1000, 443, b"x"),
        );
        let pkt = CapturedPacket::parse(0, Bytes::from(raw)).unwrap();
        assert_eq!(pkt.version, IpVersion::V6);
        assert_eq!(pkt.dst.port(), 443);

        let raw = ipv4_packet(
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(1, 1, 1, 1),
            PROTO_ICMP,
            &[8, 0, 0, 0, 0, 1, 0, 1],
        );
        let pkt = CapturedPacket::parse(0, Bytes::from(raw)).unwrap();
        assert!(pkt.is_icmp());
        assert_eq!(pkt.src.port(), 0);
    }

    #[test]
    fn test_malformed() {
        assert!(CapturedPacket::parse(0, Bytes::new()).is_err());
        assert!(matches!(
            CapturedPacket::parse(0, Bytes::from_static(&[0x50, 0, 0])),
            Err(InterceptError::InvalidIpVersion(5))
        ));
        assert!(CapturedPacket::parse(0, Bytes::from_static(&[0x45, 0, 0, 20])).is_err());
    }

    #[test]
    fn test_resolve_uid() {
        assert_eq!(resolve_uid(PROTO_TCP), 2000);
        assert_eq!(resolve_uid(PROTO_UDP), 2000);
        assert_eq!(resolve_uid(PROTO_ICMP), -1);
        assert!(is_supported_protocol(PROTO_ICMPV6));
        assert!(!is_supported_protocol(47));
    }
}
