//! Header protection (RFC 9001 section 5.4) and packet number decoding

use crate::error::{Result, SniffError};
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;

pub const SAMPLE_LEN: usize = 16;
/// Sample offset assumes the longest packet number encoding
pub const MAX_PN_LEN: usize = 4;

/// First five bytes of AES-128-ECB(hp_key, sample)
pub fn header_mask(hp_key: &[u8], sample: &[u8]) -> Result<[u8; 5]> {
    if sample.len() < SAMPLE_LEN {
        return Err(SniffError::Truncated {
            expected: SAMPLE_LEN,
            actual: sample.len(),
        });
    }
    let cipher = Aes128::new_from_slice(hp_key)
        .map_err(|_| SniffError::Crypto("invalid header protection key".into()))?;

    let mut block = aes::Block::clone_from_slice(&sample[..SAMPLE_LEN]);
    cipher.encrypt_block(&mut block);

    let mut mask = [0u8; 5];
    mask.copy_from_slice(&block[..5]);
    Ok(mask)
}

#[inline]
fn first_byte_mask(first: u8) -> u8 {
    if first & 0x80 != 0 {
        0x0f
    } else {
        0x1f
    }
}

fn sample_range(packet: &[u8], pn_offset: usize) -> Result<std::ops::Range<usize>> {
    let start = pn_offset + MAX_PN_LEN;
    let end = start + SAMPLE_LEN;
    if packet.len() < end {
        return Err(SniffError::Truncated {
            expected: end,
            actual: packet.len(),
        });
    }
    Ok(start..end)
}

/// Unmask the first byte and packet number in place.
///
/// Returns the packet number length and the truncated packet number.
pub fn remove_header_protection(
    packet: &mut [u8],
    pn_offset: usize,
    hp_key: &[u8],
) -> Result<(usize, u64)> {
    let range = sample_range(packet, pn_offset)?;
    let mask = header_mask(hp_key, &packet[range])?;

    packet[0] ^= mask[0] & first_byte_mask(packet[0]);
    let pn_len = (packet[0] & 0x03) as usize + 1;

    let mut truncated = 0u64;
    for i in 0..pn_len {
        packet[pn_offset + i] ^= mask[1 + i];
        truncated = (truncated << 8) | packet[pn_offset + i] as u64;
    }
    Ok((pn_len, truncated))
}

/// Mask the first byte and the `pn_len` packet number bytes in place
pub fn apply_header_protection(
    packet: &mut [u8],
    pn_offset: usize,
    pn_len: usize,
    hp_key: &[u8],
) -> Result<()> {
    if !(1..=MAX_PN_LEN).contains(&pn_len) {
        return Err(SniffError::Crypto(format!("invalid packet number length {}", pn_len)));
    }
    let range = sample_range(packet, pn_offset)?;
    let mask = header_mask(hp_key, &packet[range])?;

    packet[0] ^= mask[0] & first_byte_mask(packet[0]);
    for i in 0..pn_len {
        packet[pn_offset + i] ^= mask[1 + i];
    }
    Ok(())
}

/// Recover a full packet number (RFC 9000 appendix A.3).
///
/// `largest` is the largest packet number processed so far in the space,
/// `None` before any packet was received.
pub fn decode_packet_number(largest: Option<u64>, truncated: u64, pn_nbits: u32) -> u64 {
    let expected = largest.map_or(0, |pn| pn + 1);
    let win = 1u64 << pn_nbits;
    let hwin = win / 2;
    let mask = win - 1;
    let candidate = (expected & !mask) | truncated;

    if candidate + hwin <= expected && candidate < (1u64 << 62) - win {
        candidate + win
    } else if candidate > expected + hwin && candidate >= win {
        candidate - win
    } else {
        candidate
    }
}
