//! TLS ClientHello parsing (RFC 8446 section 4.1.2)

use crate::error::{Result, SniffError};
use crate::reader::Reader;
use bytes::Bytes;

pub const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;

pub const EXT_SERVER_NAME: u16 = 0;
pub const EXT_ALPN: u16 = 16;
pub const EXT_SUPPORTED_VERSIONS: u16 = 43;

const SNI_HOST_NAME: u8 = 0;

/// A parsed ClientHello together with the bytes it came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    raw: Bytes,
    legacy_version: u16,
    random: [u8; 32],
    session_id: Bytes,
    cipher_suites: Vec<u16>,
    extension_types: Vec<u16>,
    server_name: Option<String>,
    alpn: Vec<String>,
    supported_versions: Vec<u16>,
}

fn handshake_err(msg: &str) -> SniffError {
    SniffError::Handshake(msg.to_string())
}

impl ClientHello {
    /// Parse a handshake stream that starts with a ClientHello message.
    /// The whole declared message must be present.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data);
        let msg_type = r.u8()?;
        if msg_type != HANDSHAKE_CLIENT_HELLO {
            return Err(SniffError::Handshake(format!(
                "expected ClientHello, got handshake type {}",
                msg_type
            )));
        }
        let len = r.u24()? as usize;
        let mut body = Reader::new(r.bytes(len)?);

        let legacy_version = body.u16()?;
        let mut random = [0u8; 32];
        random.copy_from_slice(body.bytes(32)?);

        let session_id = body.vec_u8()?;
        if session_id.len() > 32 {
            return Err(handshake_err("session id longer than 32 bytes"));
        }

        let suites = body.vec_u16()?;
        if suites.is_empty() || suites.len() % 2 != 0 {
            return Err(handshake_err("malformed cipher suite list"));
        }
        let cipher_suites = suites
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();

        if body.vec_u8()?.is_empty() {
            return Err(handshake_err("empty compression method list"));
        }

        let mut hello = ClientHello {
            raw: Bytes::copy_from_slice(data),
            legacy_version,
            random,
            session_id: Bytes::copy_from_slice(session_id),
            cipher_suites,
            extension_types: Vec::new(),
            server_name: None,
            alpn: Vec::new(),
            supported_versions: Vec::new(),
        };

        if body.is_empty() {
            return Ok(hello);
        }
        let mut exts = Reader::new(body.vec_u16()?);
        if !body.is_empty() {
            return Err(handshake_err("trailing bytes after extensions"));
        }
        while !exts.is_empty() {
            let ext_type = exts.u16()?;
            let ext_data = exts.vec_u16()?;
            if hello.extension_types.contains(&ext_type) {
                return Err(SniffError::Handshake(format!(
                    "duplicate extension {}",
                    ext_type
                )));
            }
            hello.extension_types.push(ext_type);
            match ext_type {
                EXT_SERVER_NAME => hello.server_name = parse_server_name(ext_data)?,
                EXT_ALPN => hello.alpn = parse_alpn(ext_data)?,
                EXT_SUPPORTED_VERSIONS => {
                    hello.supported_versions = parse_supported_versions(ext_data)?
                }
                _ => {}
            }
        }
        Ok(hello)
    }

    /// The CRYPTO stream bytes this message was parsed from
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    pub fn legacy_version(&self) -> u16 {
        self.legacy_version
    }

    pub fn random(&self) -> &[u8; 32] {
        &self.random
    }

    pub fn session_id(&self) -> &[u8] {
        &self.session_id
    }

    pub fn cipher_suites(&self) -> &[u16] {
        &self.cipher_suites
    }

    /// Extension types in the order they were offered
    pub fn extension_types(&self) -> &[u16] {
        &self.extension_types
    }

    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }

    pub fn alpn_protocols(&self) -> &[String] {
        &self.alpn
    }

    /// First offered ALPN protocol
    pub fn application_protocol(&self) -> Option<&str> {
        self.alpn.first().map(String::as_str)
    }

    pub fn supported_versions(&self) -> &[u16] {
        &self.supported_versions
    }
}

fn parse_server_name(data: &[u8]) -> Result<Option<String>> {
    let mut outer = Reader::new(data);
    let mut list = Reader::new(outer.vec_u16()?);
    while !list.is_empty() {
        let name_type = list.u8()?;
        let name = list.vec_u16()?;
        if name_type == SNI_HOST_NAME {
            let host = std::str::from_utf8(name)
                .map_err(|_| handshake_err("server name is not UTF-8"))?;
            return Ok(Some(host.to_string()));
        }
    }
    Ok(None)
}

fn parse_alpn(data: &[u8]) -> Result<Vec<String>> {
    let mut outer = Reader::new(data);
    let mut list = Reader::new(outer.vec_u16()?);
    let mut protocols = Vec::new();
    while !list.is_empty() {
        let proto = list.vec_u8()?;
        if proto.is_empty() {
            return Err(handshake_err("empty ALPN protocol name"));
        }
        protocols.push(String::from_utf8_lossy(proto).into_owned());
    }
    Ok(protocols)
}

fn parse_supported_versions(data: &[u8]) -> Result<Vec<u16>> {
    let mut outer = Reader::new(data);
    let list = outer.vec_u8()?;
    if list.len() % 2 != 0 {
        return Err(handshake_err("odd supported_versions length"));
    }
    Ok(list
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect())
}
