//! QPACK header compression (RFC 9204)
//!
//! QPACK compresses HTTP fields against a 99-entry static table and an
//! optional dynamic table whose inserts travel on a dedicated encoder
//! stream. Because request streams and the encoder stream are delivered
//! independently, a field section can reference entries the decoder has
//! not seen yet; such sections are reported as blocked and decoded once
//! the missing inserts arrive.
//!
//! This module holds the primitive codecs shared by [`Encoder`] and
//! [`Decoder`]: prefixed integers (Section 4.1.1) and string literals
//! (Section 4.1.2). Huffman-coded literals are decoded with the HPACK
//! Huffman code; the encoder always emits raw literals.

pub mod decoder;
pub mod encoder;
pub mod table;

pub use decoder::Decoder;
pub use encoder::Encoder;
pub use table::{DynamicTable, HeaderField, Match, StaticTable, ENTRY_OVERHEAD};

use hpack::huffman::HuffmanDecoder;

/// QPACK errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QpackError {
    /// Input ended inside a representation
    #[error("Truncated QPACK input")]
    Truncated,

    /// Prefixed integer does not fit in 62 bits
    #[error("QPACK integer overflow")]
    IntegerOverflow,

    /// Huffman-coded literal is invalid
    #[error("Huffman decode error")]
    Huffman,

    /// Static table index out of range
    #[error("Invalid static table index: {0}")]
    InvalidStaticIndex(u64),

    /// Dynamic table reference to a missing or evicted entry
    #[error("Invalid dynamic table index: {0}")]
    InvalidDynamicIndex(u64),

    /// Entry larger than the whole table capacity
    #[error("Entry of {size} bytes exceeds table capacity {capacity}")]
    EntryTooLarge { size: usize, capacity: usize },

    /// Capacity above the negotiated maximum
    #[error("Table capacity {requested} exceeds maximum {max}")]
    CapacityExceeded { requested: u64, max: u64 },

    /// Field section prefix is inconsistent
    #[error("Invalid required insert count: {0}")]
    InvalidRequiredInsertCount(u64),

    /// More streams would be blocked than allowed
    #[error("Too many blocked streams (limit {0})")]
    TooManyBlockedStreams(u64),

    /// Decoded field section exceeds the advertised limit
    #[error("Field section of {size} bytes exceeds limit {max}")]
    FieldSectionTooLarge { size: u64, max: u64 },

    /// Malformed encoder stream instruction
    #[error("Encoder stream error: {0}")]
    EncoderStream(String),

    /// Malformed decoder stream instruction
    #[error("Decoder stream error: {0}")]
    DecoderStream(String),
}

impl QpackError {
    /// HTTP/3 error code reported for this error
    pub fn code(&self) -> super::error::H3ErrorCode {
        use super::error::H3ErrorCode;
        match self {
            QpackError::EncoderStream(_) => H3ErrorCode::QpackEncoderStreamError,
            QpackError::DecoderStream(_) => H3ErrorCode::QpackDecoderStreamError,
            _ => H3ErrorCode::QpackDecompressionFailed,
        }
    }
}

/// Result type for QPACK operations
pub type QpackResult<T> = std::result::Result<T, QpackError>;

/// Largest integer a prefixed integer may carry
const MAX_INTEGER: u64 = (1 << 62) - 1;

/// Decode a prefixed integer (RFC 9204 Section 4.1.1)
///
/// Returns the value and the number of bytes consumed. The bits above the
/// prefix in the first byte are ignored.
pub fn decode_integer(buf: &[u8], prefix_bits: u8) -> QpackResult<(u64, usize)> {
    let first = *buf.first().ok_or(QpackError::Truncated)?;
    let mask = if prefix_bits >= 8 { 0xff } else { (1u8 << prefix_bits) - 1 };
    let mut value = (first & mask) as u64;
    if value < mask as u64 {
        return Ok((value, 1));
    }

    let mut shift = 0u32;
    for (i, byte) in buf.iter().enumerate().skip(1) {
        let add = ((byte & 0x7f) as u64)
            .checked_shl(shift)
            .filter(|v| v >> shift == (byte & 0x7f) as u64)
            .ok_or(QpackError::IntegerOverflow)?;
        value = value.checked_add(add).ok_or(QpackError::IntegerOverflow)?;
        if value > MAX_INTEGER {
            return Err(QpackError::IntegerOverflow);
        }
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
        shift += 7;
        if shift > 62 {
            return Err(QpackError::IntegerOverflow);
        }
    }
    Err(QpackError::Truncated)
}

/// Encode a prefixed integer (RFC 9204 Section 4.1.1)
///
/// `flags` supplies the bits above the prefix in the first byte.
pub fn encode_integer(buf: &mut Vec<u8>, value: u64, prefix_bits: u8, flags: u8) {
    let mask = if prefix_bits >= 8 { 0xff } else { (1u8 << prefix_bits) - 1 };
    if value < mask as u64 {
        buf.push(flags | value as u8);
        return;
    }
    buf.push(flags | mask);
    let mut rest = value - mask as u64;
    while rest >= 0x80 {
        buf.push(0x80 | (rest & 0x7f) as u8);
        rest >>= 7;
    }
    buf.push(rest as u8);
}

/// Decode a string literal whose length uses a `prefix_bits` prefix
///
/// The Huffman flag is the bit just above the prefix.
pub fn decode_string(buf: &[u8], prefix_bits: u8) -> QpackResult<(Vec<u8>, usize)> {
    let first = *buf.first().ok_or(QpackError::Truncated)?;
    let huffman = first & (1 << prefix_bits) != 0;
    let (len, used) = decode_integer(buf, prefix_bits)?;
    let end = used.checked_add(len as usize).ok_or(QpackError::IntegerOverflow)?;
    let raw = buf.get(used..end).ok_or(QpackError::Truncated)?;
    let value = if huffman {
        HuffmanDecoder::new().decode(raw).map_err(|_| QpackError::Huffman)?
    } else {
        raw.to_vec()
    };
    Ok((value, end))
}

/// Encode a raw (non-Huffman) string literal
pub fn encode_string(buf: &mut Vec<u8>, value: &[u8], prefix_bits: u8, flags: u8) {
    encode_integer(buf, value.len() as u64, prefix_bits, flags);
    buf.extend_from_slice(value);
}
