//! Property-based tests for packet parsing and flow classification
//!
//! - Arbitrary capture frames never panic the parser
//! - The decision table holds for every owner and port

use super::{ipv4_packet, ipv6_packet, tcp_segment, udp_datagram};
use crate::classifier::Classifier;
use crate::config::InterceptConfig;
use crate::decision::AllowedDecision;
use crate::error::Result;
use crate::hooks::TcpInterceptStarter;
use crate::packet::{CapturedPacket, PROTO_TCP, PROTO_UDP};
use crate::udp_relay::RelayHooks;
use bytes::Bytes;
use proptest::prelude::*;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

struct ListenerTcp;

#[async_trait::async_trait]
impl TcpInterceptStarter for ListenerTcp {
    async fn start_tcp_intercept(&self, _: &CapturedPacket, _: Duration) -> Result<SocketAddr> {
        Ok(SocketAddr::from(([127, 0, 0, 1], 20443)))
    }
}

fn decide(packet: &CapturedPacket) -> AllowedDecision {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    runtime.block_on(async {
        let classifier = Classifier::new(
            &InterceptConfig::default(),
            RelayHooks::default(),
            Arc::new(ListenerTcp),
        );
        let decision = classifier.decide(packet).await;
        classifier.stop_all();
        decision
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_parse_never_panics(data in prop::collection::vec(any::<u8>(), 0..1500), uid in any::<i32>()) {
        let _ = CapturedPacket::parse(uid, Bytes::from(data));
    }

    #[test]
    fn prop_parse_keeps_addresses(
        src in any::<[u8; 4]>(),
        dst in any::<[u8; 4]>(),
        sport in 1u16..,
        dport in 1u16..,
        payload in prop::collection::vec(any::<u8>(), 0..512),
    ) {
        let raw = ipv4_packet(src.into(), dst.into(), PROTO_UDP, &udp_datagram(sport, dport, &payload));
        let packet = CapturedPacket::parse(0, Bytes::from(raw)).unwrap();
        prop_assert_eq!(packet.src, SocketAddr::from((src, sport)));
        prop_assert_eq!(packet.dst, SocketAddr::from((dst, dport)));
        prop_assert_eq!(packet.payload(), payload.as_slice());
    }

    #[test]
    fn prop_foreign_owner_is_blocked(uid in 2001i32.., dport in any::<u16>()) {
        let raw = ipv4_packet(
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(1, 1, 1, 1),
            PROTO_TCP,
            &tcp_segment(50000, dport),
        );
        let packet = CapturedPacket::parse(uid, Bytes::from(raw)).unwrap();
        prop_assert_eq!(decide(&packet), AllowedDecision::Block);
    }

    #[test]
    fn prop_ipv6_is_blocked(uid in ..=2000i32, tcp in any::<bool>(), dport in any::<u16>()) {
        let (proto, transport) = if tcp {
            (PROTO_TCP, tcp_segment(50000, dport))
        } else {
            (PROTO_UDP, udp_datagram(50000, dport, b"x"))
        };
        let raw = ipv6_packet(Ipv6Addr::LOCALHOST, Ipv6Addr::LOCALHOST, proto, &transport);
        let packet = CapturedPacket::parse(uid, Bytes::from(raw)).unwrap();
        prop_assert_eq!(decide(&packet), AllowedDecision::Block);
    }

    #[test]
    fn prop_ipv4_tcp_is_redirected(uid in ..=2000i32, dport in any::<u16>()) {
        let raw = ipv4_packet(
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(1, 1, 1, 1),
            PROTO_TCP,
            &tcp_segment(50000, dport),
        );
        let packet = CapturedPacket::parse(uid, Bytes::from(raw)).unwrap();
        prop_assert_eq!(
            decide(&packet),
            AllowedDecision::redirect(SocketAddr::from(([127, 0, 0, 1], 20443)))
        );
    }
}
