//! Packet builders and fakes shared by the unit and property tests

mod property_tests;

use crate::hooks::{QuicHandshake, QuicInterceptStarter};
use crate::side_channel::{write_string, MSG_HELLO, MSG_QUERY_APPLICATIONS};
use bytes::{BufMut, BytesMut};
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RecordType};
use parking_lot::Mutex;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::AsyncWrite;
use tokio::net::UdpSocket;
use veloguard_sniff::quic::{apply_header_protection, Frame, InitialSecrets, QuicVersion};

/// IPv4 header (no options) around `transport`
pub(crate) fn ipv4_packet(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, transport: &[u8]) -> Vec<u8> {
    let total = 20 + transport.len();
    let mut out = vec![0x45, 0x00];
    out.extend_from_slice(&(total as u16).to_be_bytes());
    out.extend_from_slice(&[0x00, 0x01, 0x40, 0x00, 64, protocol, 0x00, 0x00]);
    out.extend_from_slice(&src.octets());
    out.extend_from_slice(&dst.octets());

    let mut sum: u32 = out
        .chunks(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]) as u32)
        .sum();
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    out[10..12].copy_from_slice(&(!(sum as u16)).to_be_bytes());

    out.extend_from_slice(transport);
    out
}

/// IPv6 fixed header around `transport`
pub(crate) fn ipv6_packet(src: Ipv6Addr, dst: Ipv6Addr, next_header: u8, transport: &[u8]) -> Vec<u8> {
    let mut out = vec![0x60, 0x00, 0x00, 0x00];
    out.extend_from_slice(&(transport.len() as u16).to_be_bytes());
    out.push(next_header);
    out.push(64);
    out.extend_from_slice(&src.octets());
    out.extend_from_slice(&dst.octets());
    out.extend_from_slice(transport);
    out
}

/// Bare SYN with no options
pub(crate) fn tcp_segment(src_port: u16, dst_port: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(20);
    out.extend_from_slice(&src_port.to_be_bytes());
    out.extend_from_slice(&dst_port.to_be_bytes());
    out.extend_from_slice(&1u32.to_be_bytes());
    out.extend_from_slice(&0u32.to_be_bytes());
    out.extend_from_slice(&[0x50, 0x02, 0xff, 0xff, 0x00, 0x00, 0x00, 0x00]);
    out
}

pub(crate) fn udp_datagram(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + payload.len());
    out.extend_from_slice(&src_port.to_be_bytes());
    out.extend_from_slice(&dst_port.to_be_bytes());
    out.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
    out.extend_from_slice(&[0x00, 0x00]);
    out.extend_from_slice(payload);
    out
}

/// Wire bytes of a recursive A query for `domain`
pub(crate) fn dns_query(domain: &str, id: u16) -> Vec<u8> {
    let mut message = Message::new();
    message
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true);
    message.add_query(Query::query(Name::from_str(domain).unwrap(), RecordType::A));
    message.to_vec().unwrap()
}

fn push_u16_prefixed(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(&(data.len() as u16).to_be_bytes());
    out.extend_from_slice(data);
}

fn client_hello(server_name: &str, alpn: &[&str]) -> Vec<u8> {
    let mut body = vec![0x03, 0x03];
    body.extend_from_slice(&[0x2a; 32]);
    body.push(0);
    push_u16_prefixed(&mut body, &[0x13, 0x01]);
    body.extend_from_slice(&[0x01, 0x00]);

    let mut exts = Vec::new();
    let mut entry = vec![0x00];
    push_u16_prefixed(&mut entry, server_name.as_bytes());
    let mut sni = Vec::new();
    push_u16_prefixed(&mut sni, &entry);
    exts.extend_from_slice(&0u16.to_be_bytes());
    push_u16_prefixed(&mut exts, &sni);

    if !alpn.is_empty() {
        let mut list = Vec::new();
        for proto in alpn {
            list.push(proto.len() as u8);
            list.extend_from_slice(proto.as_bytes());
        }
        let mut ext = Vec::new();
        push_u16_prefixed(&mut ext, &list);
        exts.extend_from_slice(&16u16.to_be_bytes());
        push_u16_prefixed(&mut exts, &ext);
    }
    push_u16_prefixed(&mut body, &exts);

    let mut msg = vec![0x01];
    msg.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    msg.extend_from_slice(&body);
    msg
}

/// Protected QUIC v1 client Initial carrying a ClientHello, padded to 1200 bytes
pub(crate) fn client_initial(server_name: &str, alpn: &[&str]) -> Vec<u8> {
    let dcid = [0x83, 0x94, 0xc8, 0xf0, 0x3e, 0x51, 0x57, 0x08];
    let packet_number = 0u32;
    let secrets = InitialSecrets::derive(QuicVersion::V1, &dcid).unwrap();
    let keys = secrets.client();

    let mut payload = Vec::new();
    Frame::Crypto {
        offset: 0,
        data: client_hello(server_name, alpn).into(),
    }
    .encode(&mut payload);

    let pn_offset = 1 + 4 + 1 + dcid.len() + 1 + 1 + 2;
    let total = pn_offset + 4 + payload.len() + 16;
    if total < 1200 {
        Frame::Padding(1200 - total).encode(&mut payload);
    }
    let length = 4 + payload.len() + 16;

    let mut packet = vec![0xc3];
    packet.extend_from_slice(&QuicVersion::V1.wire().to_be_bytes());
    packet.push(dcid.len() as u8);
    packet.extend_from_slice(&dcid);
    packet.extend_from_slice(&[0x00, 0x00]);
    packet.extend_from_slice(&(0x4000 | length as u16).to_be_bytes());
    packet.extend_from_slice(&packet_number.to_be_bytes());

    let sealed = keys.seal(packet_number as u64, &packet, &payload).unwrap();
    packet.extend_from_slice(&sealed);
    apply_header_protection(&mut packet, pn_offset, 4, keys.hp_key()).unwrap();
    packet
}

/// Length-prefixed capture frame
pub(crate) fn frame(packet: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + packet.len());
    push_u16_prefixed(&mut out, packet);
    out
}

/// Split a device byte stream back into frames
pub(crate) fn split_frames(mut stream: &[u8]) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    while stream.len() >= 2 {
        let len = u16::from_be_bytes([stream[0], stream[1]]) as usize;
        frames.push(stream[2..2 + len].to_vec());
        stream = &stream[2 + len..];
    }
    frames
}

/// Records every detected QUIC handshake
#[derive(Default)]
pub(crate) struct CollectQuic {
    pub(crate) seen: Mutex<Vec<QuicHandshake>>,
}

impl QuicInterceptStarter for CollectQuic {
    fn on_client_hello(&self, handshake: QuicHandshake) {
        self.seen.lock().push(handshake);
    }
}

/// Device writer whose first `failures` writes fail
pub(crate) struct FlakyWriter {
    failures_left: usize,
    out: Arc<Mutex<Vec<u8>>>,
}

impl FlakyWriter {
    pub(crate) fn new(failures: usize) -> (Self, Arc<Mutex<Vec<u8>>>) {
        let out = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                failures_left: failures,
                out: out.clone(),
            },
            out,
        )
    }
}

impl AsyncWrite for FlakyWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.failures_left > 0 {
            self.failures_left -= 1;
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "device busy")));
        }
        self.out.lock().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Fake device side channel answering hello and every owner query with `apps`
pub(crate) async fn fake_device(apps: Vec<&'static str>) -> SocketAddr {
    let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = sock.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 64];
        loop {
            let Ok((n, from)) = sock.recv_from(&mut buf).await else {
                return;
            };
            match buf[0] {
                MSG_HELLO if n == 1 => {
                    sock.send_to(&[MSG_HELLO], from).await.unwrap();
                }
                MSG_QUERY_APPLICATIONS => {
                    let mut reply = BytesMut::new();
                    reply.put_slice(&buf[..5]);
                    reply.put_u8(apps.len() as u8);
                    for app in &apps {
                        write_string(&mut reply, app).unwrap();
                    }
                    sock.send_to(&reply, from).await.unwrap();
                }
                _ => {}
            }
        }
    });
    addr
}
