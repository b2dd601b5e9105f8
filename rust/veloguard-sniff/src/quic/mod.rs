//! Passive QUIC Initial inspection
//!
//! Removes Initial packet protection with keys derived from the public
//! destination connection id and recovers the TLS ClientHello carried in
//! the CRYPTO frames. Nothing here mutates the datagram being inspected.

pub mod frame;
pub mod header;
pub mod keys;
pub mod packet;
pub mod version;

pub use frame::{crypto_stream, parse_frames, Frame};
pub use header::{
    apply_header_protection, decode_packet_number, header_mask, remove_header_protection,
};
pub use keys::{DirectionalKeys, InitialSecrets, Role};
pub use packet::{parse_initial_header, InitialHeader};
pub use version::QuicVersion;

use crate::error::{Result, SniffError};
use crate::tls::ClientHello;
use bytes::Bytes;
use tracing::{debug, trace};

/// A decrypted Initial packet
#[derive(Debug, Clone)]
pub struct InitialPacket {
    pub header: InitialHeader,
    pub packet_number: u64,
    pub frames: Vec<Frame>,
}

/// Open the first Initial packet in `datagram`.
///
/// `role` is the side the caller impersonates; packets are opened with the
/// keys of the opposite side, so a sniffer sitting in front of the server
/// passes [`Role::Server`] to read what the client sent.
pub fn open_initial(datagram: &[u8], role: Role) -> Result<InitialPacket> {
    let header = parse_initial_header(datagram)?;
    let secrets = InitialSecrets::derive(header.version, &header.dcid)?;
    let keys = secrets.peer(role);

    let mut packet = datagram[..header.packet_end()].to_vec();
    let (pn_len, truncated) =
        remove_header_protection(&mut packet, header.pn_offset, keys.hp_key())?;
    let packet_number = decode_packet_number(None, truncated, (pn_len * 8) as u32);

    let payload_start = header.pn_offset + pn_len;
    let (aad, ciphertext) = packet.split_at(payload_start);
    let plaintext = keys.open(packet_number, aad, ciphertext)?;

    let frames = parse_frames(&plaintext)?;
    Ok(InitialPacket {
        header,
        packet_number,
        frames,
    })
}

/// ClientHello recovered from a client's Initial packet
#[derive(Debug, Clone)]
pub struct QuicInitialSniff {
    pub version: QuicVersion,
    pub dcid: Bytes,
    pub scid: Bytes,
    pub packet_number: u64,
    pub client_hello: ClientHello,
}

impl QuicInitialSniff {
    pub fn server_name(&self) -> Option<&str> {
        self.client_hello.server_name()
    }

    pub fn application_protocol(&self) -> Option<&str> {
        self.client_hello.application_protocol()
    }
}

fn sniff(datagram: &[u8]) -> Result<QuicInitialSniff> {
    let header = parse_initial_header(datagram)?;
    if !header.version.is_decryptable() {
        debug!(
            "QUIC {} Initial recognized, not decrypting (dcid {} bytes)",
            header.version,
            header.dcid.len()
        );
        return Err(SniffError::UnsupportedVersion(header.version.wire()));
    }

    let packet = open_initial(datagram, Role::Server)?;
    match packet.frames.first() {
        Some(Frame::Crypto { .. }) => {}
        Some(other) => {
            return Err(SniffError::Frame(format!(
                "first Initial frame is not CRYPTO: {:?}",
                other
            )))
        }
        None => return Err(SniffError::Frame("empty Initial payload".into())),
    }

    let stream = crypto_stream(&packet.frames)
        .ok_or_else(|| SniffError::Frame("CRYPTO stream does not start at offset 0".into()))?;
    let client_hello = ClientHello::parse(&stream)?;

    Ok(QuicInitialSniff {
        version: packet.header.version,
        dcid: packet.header.dcid,
        scid: packet.header.scid,
        packet_number: packet.packet_number,
        client_hello,
    })
}

/// Detect a TLS ClientHello inside a client QUIC Initial datagram.
///
/// Returns `None` for anything that is not a decryptable v1 Initial whose
/// first frame is CRYPTO carrying a complete ClientHello.
pub fn detect_client_hello(datagram: &[u8]) -> Option<QuicInitialSniff> {
    match sniff(datagram) {
        Ok(found) => {
            debug!(
                "QUIC ClientHello detected: sni={:?} alpn={:?}",
                found.server_name(),
                found.application_protocol()
            );
            Some(found)
        }
        Err(e) => {
            trace!("no QUIC ClientHello: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{client_hello_bytes, hex, seal_client_initial, InitialBuilder};

    const DCID: &str = "8394c8f03e515708";

    #[test]
    fn test_detects_sealed_client_hello() {
        let hello = client_hello_bytes("example.com", &["h3"]);
        let datagram = seal_client_initial(&hex(DCID), &hello);
        assert!(datagram.len() >= 1200);

        let found = detect_client_hello(&datagram).expect("ClientHello detected");
        assert_eq!(found.version, QuicVersion::V1);
        assert_eq!(found.dcid.as_ref(), hex(DCID).as_slice());
        assert_eq!(found.client_hello.raw().as_ref(), hello.as_slice());
        assert_eq!(found.server_name(), Some("example.com"));
        assert_eq!(found.application_protocol(), Some("h3"));
    }

    #[test]
    fn test_open_initial_with_wrong_role_fails() {
        let datagram = seal_client_initial(&hex(DCID), &client_hello_bytes("a.test", &[]));
        assert!(open_initial(&datagram, Role::Server).is_ok());
        assert!(matches!(
            open_initial(&datagram, Role::Client),
            Err(SniffError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_leading_ping_is_not_detected() {
        let hello = client_hello_bytes("example.com", &["h3"]);
        let datagram = InitialBuilder::new(&hex(DCID))
            .frame(Frame::Ping)
            .crypto(0, &hello)
            .build();
        assert!(open_initial(&datagram, Role::Server).is_ok());
        assert!(detect_client_hello(&datagram).is_none());
    }

    #[test]
    fn test_split_crypto_frames_are_reassembled() {
        let hello = client_hello_bytes("split.example", &["h3"]);
        let (head, tail) = hello.split_at(40);
        let datagram = InitialBuilder::new(&hex(DCID))
            .crypto(0, head)
            .crypto(40, tail)
            .build();
        let found = detect_client_hello(&datagram).unwrap();
        assert_eq!(found.client_hello.raw().as_ref(), hello.as_slice());
    }

    #[test]
    fn test_partial_client_hello_is_not_detected() {
        let hello = client_hello_bytes("example.com", &["h3"]);
        let datagram = InitialBuilder::new(&hex(DCID))
            .crypto(0, &hello[..hello.len() / 2])
            .build();
        assert!(detect_client_hello(&datagram).is_none());
    }

    #[test]
    fn test_tampered_ciphertext_is_not_detected() {
        let mut datagram = seal_client_initial(&hex(DCID), &client_hello_bytes("a.test", &[]));
        let last = datagram.len() - 1;
        datagram[last] ^= 0x01;
        assert!(detect_client_hello(&datagram).is_none());
    }

    #[test]
    fn test_v2_is_recognized_but_not_decrypted() {
        let mut datagram = seal_client_initial(&hex(DCID), &client_hello_bytes("a.test", &[]));
        // Rewrite version and set the v2 Initial type bits; the protected
        // first byte keeps its low nibble.
        datagram[0] = (datagram[0] & 0x0f) | 0xd0;
        datagram[1..5].copy_from_slice(&0x6b33_43cfu32.to_be_bytes());
        assert_eq!(
            parse_initial_header(&datagram).unwrap().version,
            QuicVersion::V2
        );
        assert!(detect_client_hello(&datagram).is_none());
    }
}
