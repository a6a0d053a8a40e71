//! Variable-length integer encoding (RFC 9000 Section 16)
//!
//! The two most significant bits of the first byte select a 1, 2, 4 or
//! 8 byte encoding; the remaining bits hold the value in network byte
//! order.

use super::error::{Error, Result};
use bytes::{Buf, BufMut};

/// Largest value representable as a varint (2^62 - 1)
pub const MAX_VARINT: u64 = (1 << 62) - 1;

/// Largest value for each length class
const MAX_1: u64 = 63;
const MAX_2: u64 = 16_383;
const MAX_4: u64 = 1_073_741_823;

/// Number of bytes needed to encode `value`
pub fn encoded_len(value: u64) -> usize {
    if value <= MAX_1 {
        1
    } else if value <= MAX_2 {
        2
    } else if value <= MAX_4 {
        4
    } else {
        8
    }
}

/// Number of bytes of the varint starting with `first`
pub fn len_from_first_byte(first: u8) -> usize {
    1 << (first >> 6)
}

/// Append `value` to `buf` using the shortest encoding
pub fn put_varint<B: BufMut>(buf: &mut B, value: u64) -> Result<()> {
    match encoded_len(value) {
        1 => buf.put_u8(value as u8),
        2 => buf.put_u16(0x4000 | value as u16),
        4 => buf.put_u32(0x8000_0000 | value as u32),
        _ => {
            if value > MAX_VARINT {
                return Err(Error::VarintOverflow(value));
            }
            buf.put_u64(0xC000_0000_0000_0000 | value);
        }
    }
    Ok(())
}

/// Append `value` using exactly `len` bytes (used for fixed-width length fields)
pub fn put_varint_with_len<B: BufMut>(buf: &mut B, value: u64, len: usize) -> Result<()> {
    if len < encoded_len(value) {
        return Err(Error::VarintOverflow(value));
    }
    match len {
        1 => buf.put_u8(value as u8),
        2 => buf.put_u16(0x4000 | value as u16),
        4 => buf.put_u32(0x8000_0000 | value as u32),
        8 => buf.put_u64(0xC000_0000_0000_0000 | value),
        _ => return Err(Error::InvalidPacket(format!("invalid varint length {}", len))),
    }
    Ok(())
}

/// Encode `value` into a fresh vector
pub fn encode(value: u64) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(encoded_len(value));
    put_varint(&mut out, value)?;
    Ok(out)
}

/// Decode a varint from the start of `data`
///
/// Returns the value and the number of bytes consumed.
pub fn decode(data: &[u8]) -> Result<(u64, usize)> {
    let first = *data
        .first()
        .ok_or_else(|| Error::Truncated("varint".to_string()))?;
    let len = len_from_first_byte(first);
    if data.len() < len {
        return Err(Error::Truncated(format!(
            "varint needs {} bytes, have {}",
            len,
            data.len()
        )));
    }

    let mut value = (first & 0x3F) as u64;
    for byte in &data[1..len] {
        value = (value << 8) | *byte as u64;
    }
    Ok((value, len))
}

/// Read a varint from a `Buf`, advancing it
pub fn get_varint<B: Buf>(buf: &mut B) -> Result<u64> {
    if !buf.has_remaining() {
        return Err(Error::Truncated("varint".to_string()));
    }
    let len = len_from_first_byte(buf.chunk()[0]);
    if buf.remaining() < len {
        return Err(Error::Truncated(format!(
            "varint needs {} bytes, have {}",
            len,
            buf.remaining()
        )));
    }
    let value = match len {
        1 => (buf.get_u8() & 0x3F) as u64,
        2 => (buf.get_u16() & 0x3FFF) as u64,
        4 => (buf.get_u32() & 0x3FFF_FFFF) as u64,
        _ => buf.get_u64() & 0x3FFF_FFFF_FFFF_FFFF,
    };
    Ok(value)
}
