//! Shared builders for unit and property tests


use crate::quic::{apply_header_protection, Frame, InitialSecrets, QuicVersion};
use bytes::Bytes;

pub(crate) const MIN_INITIAL_DATAGRAM: usize = 1200;

pub(crate) fn hex(s: &str) -> Vec<u8> {
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
        .collect()
}

fn push_vec_u16(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(&(data.len() as u16).to_be_bytes());
    out.extend_from_slice(data);
}

fn push_extension(out: &mut Vec<u8>, ext_type: u16, data: &[u8]) {
    out.extend_from_slice(&ext_type.to_be_bytes());
    push_vec_u16(out, data);
}

/// Minimal TLS 1.3 ClientHello with SNI, optional ALPN and supported_versions
pub(crate) fn client_hello_bytes(server_name: &str, alpn: &[&str]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&[0x03, 0x03]);
    body.extend_from_slice(&[0x11; 32]);
    body.push(0); // session id
    push_vec_u16(&mut body, &[0x13, 0x01, 0x13, 0x02]);
    body.extend_from_slice(&[0x01, 0x00]);

    let mut exts = Vec::new();

    let mut sni_entry = vec![0x00];
    push_vec_u16(&mut sni_entry, server_name.as_bytes());
    let mut sni = Vec::new();
    push_vec_u16(&mut sni, &sni_entry);
    push_extension(&mut exts, 0, &sni);

    if !alpn.is_empty() {
        let mut list = Vec::new();
        for proto in alpn {
            list.push(proto.len() as u8);
            list.extend_from_slice(proto.as_bytes());
        }
        let mut ext = Vec::new();
        push_vec_u16(&mut ext, &list);
        push_extension(&mut exts, 16, &ext);
    }

    push_extension(&mut exts, 43, &[0x02, 0x03, 0x04]);
    push_vec_u16(&mut body, &exts);

    let mut msg = vec![0x01];
    msg.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    msg.extend_from_slice(&body);
    msg
}

/// Builds a protected client Initial packet the way a QUIC client would
pub(crate) struct InitialBuilder {
    dcid: Vec<u8>,
    packet_number: u32,
    frames: Vec<Frame>,
}

impl InitialBuilder {
    pub(crate) fn new(dcid: &[u8]) -> Self {
        Self {
            dcid: dcid.to_vec(),
            packet_number: 2,
            frames: Vec::new(),
        }
    }

    pub(crate) fn frame(mut self, frame: Frame) -> Self {
        self.frames.push(frame);
        self
    }

    pub(crate) fn crypto(self, offset: u64, data: &[u8]) -> Self {
        self.frame(Frame::Crypto {
            offset,
            data: Bytes::copy_from_slice(data),
        })
    }

    pub(crate) fn build(self) -> Vec<u8> {
        let secrets = InitialSecrets::derive(QuicVersion::V1, &self.dcid).unwrap();
        let keys = secrets.client();

        let mut payload = Vec::new();
        for frame in &self.frames {
            frame.encode(&mut payload);
        }

        // first byte, version, dcid, scid, token, two byte length
        let pn_offset = 1 + 4 + 1 + self.dcid.len() + 1 + 1 + 2;
        let total = pn_offset + 4 + payload.len() + 16;
        if total < MIN_INITIAL_DATAGRAM {
            Frame::Padding(MIN_INITIAL_DATAGRAM - total).encode(&mut payload);
        }
        let length = 4 + payload.len() + 16;

        let mut packet = vec![0xc3];
        packet.extend_from_slice(&QuicVersion::V1.wire().to_be_bytes());
        packet.push(self.dcid.len() as u8);
        packet.extend_from_slice(&self.dcid);
        packet.push(0);
        packet.push(0);
        packet.extend_from_slice(&(0x4000 | length as u16).to_be_bytes());
        packet.extend_from_slice(&self.packet_number.to_be_bytes());
        assert_eq!(packet.len(), pn_offset + 4);

        let ciphertext = keys
            .seal(self.packet_number as u64, &packet, &payload)
            .unwrap();
        packet.extend_from_slice(&ciphertext);
        apply_header_protection(&mut packet, pn_offset, 4, keys.hp_key()).unwrap();
        packet
    }
}

/// Single-CRYPTO-frame Initial carrying `client_hello`
pub(crate) fn seal_client_initial(dcid: &[u8], client_hello: &[u8]) -> Vec<u8> {
    InitialBuilder::new(dcid).crypto(0, client_hello).build()
}
