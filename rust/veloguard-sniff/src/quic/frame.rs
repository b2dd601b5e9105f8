//! Frames allowed in Initial packets

use crate::error::{Result, SniffError};
use crate::reader::{encode_varint, Reader};
use bytes::Bytes;

pub const FRAME_PADDING: u64 = 0x00;
pub const FRAME_PING: u64 = 0x01;
pub const FRAME_ACK: u64 = 0x02;
pub const FRAME_ACK_ECN: u64 = 0x03;
pub const FRAME_CRYPTO: u64 = 0x06;
pub const FRAME_CONNECTION_CLOSE: u64 = 0x1c;
pub const FRAME_CONNECTION_CLOSE_APP: u64 = 0x1d;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Run of consecutive PADDING bytes
    Padding(usize),
    Ping,
    Ack {
        largest: u64,
        delay: u64,
        first_range: u64,
        /// (gap, range length) pairs
        ranges: Vec<(u64, u64)>,
        /// ECT0, ECT1, ECN-CE counts
        ecn: Option<(u64, u64, u64)>,
    },
    Crypto {
        offset: u64,
        data: Bytes,
    },
    ConnectionClose {
        error_code: u64,
        frame_type: Option<u64>,
        reason: Bytes,
    },
}

impl Frame {
    pub fn is_crypto(&self) -> bool {
        matches!(self, Frame::Crypto { .. })
    }

    /// Append the wire encoding of this frame
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Frame::Padding(n) => out.extend(std::iter::repeat(0u8).take(*n)),
            Frame::Ping => out.push(FRAME_PING as u8),
            Frame::Ack {
                largest,
                delay,
                first_range,
                ranges,
                ecn,
            } => {
                let ty = if ecn.is_some() { FRAME_ACK_ECN } else { FRAME_ACK };
                encode_varint(ty, out);
                encode_varint(*largest, out);
                encode_varint(*delay, out);
                encode_varint(ranges.len() as u64, out);
                encode_varint(*first_range, out);
                for (gap, len) in ranges {
                    encode_varint(*gap, out);
                    encode_varint(*len, out);
                }
                if let Some((ect0, ect1, ce)) = ecn {
                    encode_varint(*ect0, out);
                    encode_varint(*ect1, out);
                    encode_varint(*ce, out);
                }
            }
            Frame::Crypto { offset, data } => {
                encode_varint(FRAME_CRYPTO, out);
                encode_varint(*offset, out);
                encode_varint(data.len() as u64, out);
                out.extend_from_slice(data);
            }
            Frame::ConnectionClose {
                error_code,
                frame_type,
                reason,
            } => {
                match frame_type {
                    Some(ft) => {
                        encode_varint(FRAME_CONNECTION_CLOSE, out);
                        encode_varint(*error_code, out);
                        encode_varint(*ft, out);
                    }
                    None => {
                        encode_varint(FRAME_CONNECTION_CLOSE_APP, out);
                        encode_varint(*error_code, out);
                    }
                }
                encode_varint(reason.len() as u64, out);
                out.extend_from_slice(reason);
            }
        }
    }
}

fn parse_frame(r: &mut Reader<'_>) -> Result<Frame> {
    let ty = r.varint()?;
    let frame = match ty {
        FRAME_PADDING => {
            let mut run = 1;
            while r.rest().first() == Some(&0) {
                r.skip(1)?;
                run += 1;
            }
            Frame::Padding(run)
        }
        FRAME_PING => Frame::Ping,
        FRAME_ACK | FRAME_ACK_ECN => {
            let largest = r.varint()?;
            let delay = r.varint()?;
            let count = r.varint()?;
            let first_range = r.varint()?;
            let mut ranges = Vec::new();
            for _ in 0..count {
                // Each range needs at least two bytes
                if r.remaining() < 2 {
                    return Err(SniffError::Frame("ACK range count exceeds frame".into()));
                }
                ranges.push((r.varint()?, r.varint()?));
            }
            let ecn = if ty == FRAME_ACK_ECN {
                Some((r.varint()?, r.varint()?, r.varint()?))
            } else {
                None
            };
            Frame::Ack {
                largest,
                delay,
                first_range,
                ranges,
                ecn,
            }
        }
        FRAME_CRYPTO => {
            let offset = r.varint()?;
            let len = r.varint()? as usize;
            Frame::Crypto {
                offset,
                data: Bytes::copy_from_slice(r.bytes(len)?),
            }
        }
        FRAME_CONNECTION_CLOSE | FRAME_CONNECTION_CLOSE_APP => {
            let error_code = r.varint()?;
            let frame_type = if ty == FRAME_CONNECTION_CLOSE {
                Some(r.varint()?)
            } else {
                None
            };
            let len = r.varint()? as usize;
            Frame::ConnectionClose {
                error_code,
                frame_type,
                reason: Bytes::copy_from_slice(r.bytes(len)?),
            }
        }
        other => {
            return Err(SniffError::Frame(format!(
                "frame type 0x{:02x} not allowed in Initial",
                other
            )))
        }
    };
    Ok(frame)
}

/// Parse a decrypted Initial payload into frames
pub fn parse_frames(plaintext: &[u8]) -> Result<Vec<Frame>> {
    let mut r = Reader::new(plaintext);
    let mut frames = Vec::new();
    while !r.is_empty() {
        frames.push(parse_frame(&mut r)?);
    }
    Ok(frames)
}

/// Reassemble the CRYPTO stream prefix starting at offset 0.
///
/// Frames may arrive out of order within a packet; bytes after the first
/// gap are not returned.
pub fn crypto_stream(frames: &[Frame]) -> Option<Vec<u8>> {
    let mut chunks: Vec<(u64, &Bytes)> = frames
        .iter()
        .filter_map(|f| match f {
            Frame::Crypto { offset, data } => Some((*offset, data)),
            _ => None,
        })
        .collect();
    chunks.sort_by_key(|(offset, _)| *offset);

    let mut stream: Vec<u8> = Vec::new();
    for (offset, data) in chunks {
        let offset = offset as usize;
        if offset > stream.len() {
            break;
        }
        let end = offset + data.len();
        if end > stream.len() {
            stream.extend_from_slice(&data[stream.len() - offset..]);
        }
    }
    if stream.is_empty() {
        None
    } else {
        Some(stream)
    }
}
