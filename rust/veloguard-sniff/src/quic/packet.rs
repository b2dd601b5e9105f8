//! Long-header Initial packet layout (RFC 9000 section 17.2.2)

use super::version::QuicVersion;
use crate::error::{Result, SniffError};
use crate::reader::Reader;
use bytes::Bytes;

/// Smallest datagram worth inspecting
pub const MIN_DATAGRAM_LEN: usize = 32;
pub const MAX_CID_LEN: usize = 20;

pub const FORM_BIT: u8 = 0x80;
pub const FIXED_BIT: u8 = 0x40;

/// Cleartext fields of an Initial packet header
#[derive(Debug, Clone)]
pub struct InitialHeader {
    /// First byte as received, still header-protected
    pub first_byte: u8,
    pub version: QuicVersion,
    pub dcid: Bytes,
    pub scid: Bytes,
    pub token: Bytes,
    /// Packet number plus protected payload, from the Length field
    pub length: usize,
    pub pn_offset: usize,
}

impl InitialHeader {
    /// Offset one past the end of this packet inside the datagram.
    /// Coalesced packets may follow.
    pub fn packet_end(&self) -> usize {
        self.pn_offset + self.length
    }
}

fn read_cid(r: &mut Reader<'_>) -> Result<Bytes> {
    let len = r.u8()? as usize;
    if len > MAX_CID_LEN {
        return Err(SniffError::ConnectionIdTooLong(len));
    }
    Ok(Bytes::copy_from_slice(r.bytes(len)?))
}

/// Parse the unprotected part of the first packet in `datagram`
pub fn parse_initial_header(datagram: &[u8]) -> Result<InitialHeader> {
    if datagram.len() < MIN_DATAGRAM_LEN {
        return Err(SniffError::Truncated {
            expected: MIN_DATAGRAM_LEN,
            actual: datagram.len(),
        });
    }

    let mut r = Reader::new(datagram);
    let first_byte = r.u8()?;
    if first_byte & FIXED_BIT == 0 {
        return Err(SniffError::NotQuic(first_byte));
    }
    if first_byte & FORM_BIT == 0 {
        return Err(SniffError::ShortHeader);
    }

    let wire_version = r.u32()?;
    let version =
        QuicVersion::from_wire(wire_version).ok_or(SniffError::UnsupportedVersion(wire_version))?;

    let dcid = read_cid(&mut r)?;
    let scid = read_cid(&mut r)?;

    let packet_type = (first_byte >> 4) & 0x03;
    if packet_type != version.initial_type() {
        return Err(SniffError::NotInitial(packet_type));
    }

    let token_len = r.varint()? as usize;
    let token = Bytes::copy_from_slice(r.bytes(token_len)?);

    let length = r.varint()? as usize;
    let pn_offset = r.position();
    if r.remaining() < length {
        return Err(SniffError::Truncated {
            expected: pn_offset + length,
            actual: datagram.len(),
        });
    }

    Ok(InitialHeader {
        first_byte,
        version,
        dcid,
        scid,
        token,
        length,
        pn_offset,
    })
}
