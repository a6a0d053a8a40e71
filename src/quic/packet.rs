//! QUIC packet headers (RFC 9000 Section 17)
//!
//! Long headers (Initial, 0-RTT, Handshake, Retry), short headers,
//! Version Negotiation, connection IDs and packet number
//! truncation/reconstruction.
//!
//! Incoming packets are parsed in two steps: `PartialHeader::parse` reads
//! the fields that header protection leaves in the clear, then the caller
//! removes protection (see `crypto::unprotect_header`) and reconstructs
//! the full packet number with `decode_packet_number`.

use super::crypto::{self, EncryptionLevel, TAG_LEN};
use super::error::{Error, Result};
use super::varint;
use bytes::{BufMut, Bytes};
use std::fmt;

/// QUIC version 1
pub const VERSION_1: u32 = 0x0000_0001;

/// Maximum connection ID length
pub const MAX_CID_LEN: usize = 20;

/// Default length of locally generated connection IDs
pub const DEFAULT_CID_LEN: usize = 8;

/// Minimum size of a datagram carrying a client Initial packet
pub const MIN_INITIAL_SIZE: usize = 1200;

const HEADER_FORM_LONG: u8 = 0x80;
const FIXED_BIT: u8 = 0x40;
const SPIN_BIT: u8 = 0x20;
pub const KEY_PHASE_BIT: u8 = 0x04;

/// Connection ID (0-20 bytes)
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ConnectionId {
    bytes: [u8; MAX_CID_LEN],
    len: u8,
}

impl ConnectionId {
    /// Create from raw bytes
    pub fn new(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_CID_LEN {
            return Err(Error::InvalidPacket(format!(
                "connection ID length {} exceeds {}",
                bytes.len(),
                MAX_CID_LEN
            )));
        }
        let mut cid = ConnectionId {
            bytes: [0u8; MAX_CID_LEN],
            len: bytes.len() as u8,
        };
        cid.bytes[..bytes.len()].copy_from_slice(bytes);
        Ok(cid)
    }

    /// Generate a random connection ID of `len` bytes
    pub fn random(len: usize) -> Result<Self> {
        let len = len.min(MAX_CID_LEN);
        let mut bytes = [0u8; MAX_CID_LEN];
        crypto::random_bytes(&mut bytes[..len])?;
        Ok(ConnectionId { bytes, len: len as u8 })
    }

    /// Zero-length connection ID
    pub fn empty() -> Self {
        ConnectionId::default()
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Whether this is a zero-length ID
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({})", self)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.as_bytes() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Packet number space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SpaceId {
    Initial = 0,
    Handshake = 1,
    Data = 2,
}

impl SpaceId {
    /// All spaces in handshake order
    pub const ALL: [SpaceId; 3] = [SpaceId::Initial, SpaceId::Handshake, SpaceId::Data];

    /// Index for per-space arrays
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Packet type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// Initial (long header type 0x0)
    Initial,
    /// 0-RTT (long header type 0x1)
    ZeroRtt,
    /// Handshake (long header type 0x2)
    Handshake,
    /// Retry (long header type 0x3)
    Retry,
    /// Version Negotiation (long header, version 0)
    VersionNegotiation,
    /// 1-RTT short header
    Short,
}

impl PacketType {
    /// Long header type bits (0x30 of the first byte)
    pub fn long_type_bits(self) -> Option<u8> {
        match self {
            PacketType::Initial => Some(0x00),
            PacketType::ZeroRtt => Some(0x10),
            PacketType::Handshake => Some(0x20),
            PacketType::Retry => Some(0x30),
            _ => None,
        }
    }

    fn from_long_type_bits(first: u8) -> Self {
        match first & 0x30 {
            0x00 => PacketType::Initial,
            0x10 => PacketType::ZeroRtt,
            0x20 => PacketType::Handshake,
            _ => PacketType::Retry,
        }
    }

    /// Encryption level protecting this packet type
    pub fn encryption_level(self) -> Option<EncryptionLevel> {
        match self {
            PacketType::Initial => Some(EncryptionLevel::Initial),
            PacketType::ZeroRtt => Some(EncryptionLevel::ZeroRtt),
            PacketType::Handshake => Some(EncryptionLevel::Handshake),
            PacketType::Short => Some(EncryptionLevel::OneRtt),
            PacketType::Retry | PacketType::VersionNegotiation => None,
        }
    }

    /// Packet type used at an encryption level
    pub fn for_level(level: EncryptionLevel) -> Self {
        match level {
            EncryptionLevel::Initial => PacketType::Initial,
            EncryptionLevel::ZeroRtt => PacketType::ZeroRtt,
            EncryptionLevel::Handshake => PacketType::Handshake,
            EncryptionLevel::OneRtt => PacketType::Short,
        }
    }

    /// Get packet type name
    pub fn name(&self) -> &'static str {
        match self {
            PacketType::Initial => "Initial",
            PacketType::ZeroRtt => "0-RTT",
            PacketType::Handshake => "Handshake",
            PacketType::Retry => "Retry",
            PacketType::VersionNegotiation => "VersionNegotiation",
            PacketType::Short => "1-RTT",
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Header of an outgoing protected packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Header {
    /// Initial, 0-RTT or Handshake
    Long {
        packet_type: PacketType,
        version: u32,
        dcid: ConnectionId,
        scid: ConnectionId,
        /// Token (Initial packets only)
        token: Bytes,
        packet_number: u64,
        pn_len: usize,
    },
    /// 1-RTT
    Short {
        dcid: ConnectionId,
        spin: bool,
        key_phase: bool,
        packet_number: u64,
        pn_len: usize,
    },
}

impl Header {
    /// Packet type
    pub fn packet_type(&self) -> PacketType {
        match self {
            Header::Long { packet_type, .. } => *packet_type,
            Header::Short { .. } => PacketType::Short,
        }
    }

    /// Packet number carried by this header
    pub fn packet_number(&self) -> u64 {
        match self {
            Header::Long { packet_number, .. } | Header::Short { packet_number, .. } => *packet_number,
        }
    }

    /// Encode the header, with the length field covering `payload_len`
    /// bytes of plaintext plus the AEAD tag
    ///
    /// Returns the offset of the packet number within `buf`'s new bytes.
    pub fn encode(&self, buf: &mut Vec<u8>, payload_len: usize) -> Result<usize> {
        let start = buf.len();
        match self {
            Header::Long {
                packet_type,
                version,
                dcid,
                scid,
                token,
                packet_number,
                pn_len,
            } => {
                let type_bits = packet_type.long_type_bits().ok_or_else(|| {
                    Error::InvalidPacket(format!("{} has no protected long header", packet_type))
                })?;
                if *packet_type == PacketType::Retry {
                    return Err(Error::InvalidPacket("use RetryPacket to build Retry".to_string()));
                }
                check_pn_len(*pn_len)?;

                buf.put_u8(HEADER_FORM_LONG | FIXED_BIT | type_bits | (*pn_len as u8 - 1));
                buf.put_u32(*version);
                buf.put_u8(dcid.len() as u8);
                buf.put_slice(dcid.as_bytes());
                buf.put_u8(scid.len() as u8);
                buf.put_slice(scid.as_bytes());
                if *packet_type == PacketType::Initial {
                    varint::put_varint(buf, token.len() as u64)?;
                    buf.put_slice(token);
                }
                let length = (*pn_len + payload_len + TAG_LEN) as u64;
                // Fixed two-byte length keeps packet sizing predictable
                if length <= 16_383 {
                    varint::put_varint_with_len(buf, length, 2)?;
                } else {
                    varint::put_varint(buf, length)?;
                }
                let pn_offset = buf.len() - start;
                encode_packet_number(buf, *packet_number, *pn_len);
                Ok(pn_offset)
            }
            Header::Short {
                dcid,
                spin,
                key_phase,
                packet_number,
                pn_len,
            } => {
                check_pn_len(*pn_len)?;
                let mut first = FIXED_BIT | (*pn_len as u8 - 1);
                if *spin {
                    first |= SPIN_BIT;
                }
                if *key_phase {
                    first |= KEY_PHASE_BIT;
                }
                buf.put_u8(first);
                buf.put_slice(dcid.as_bytes());
                let pn_offset = buf.len() - start;
                encode_packet_number(buf, *packet_number, *pn_len);
                Ok(pn_offset)
            }
        }
    }
}

fn check_pn_len(pn_len: usize) -> Result<()> {
    if !(1..=4).contains(&pn_len) {
        return Err(Error::InvalidPacket(format!("packet number length {}", pn_len)));
    }
    Ok(())
}

/// Header fields readable before header protection is removed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialHeader {
    /// Packet type
    pub packet_type: PacketType,
    /// Version (0 for short headers)
    pub version: u32,
    /// Destination connection ID
    pub dcid: ConnectionId,
    /// Source connection ID (empty for short headers)
    pub scid: ConnectionId,
    /// Initial or Retry token
    pub token: Bytes,
    /// Offset of the (protected) packet number
    pub pn_offset: usize,
    /// Total length of this packet within the datagram
    pub len: usize,
}

impl PartialHeader {
    /// Parse the unprotected part of the first packet in `data`
    ///
    /// `local_cid_len` is the length of connection IDs we issued, needed
    /// to find the end of a short header's destination connection ID.
    pub fn parse(data: &[u8], local_cid_len: usize) -> Result<Self> {
        let first = *data
            .first()
            .ok_or_else(|| Error::Truncated("empty packet".to_string()))?;

        if first & HEADER_FORM_LONG == 0 {
            if first & FIXED_BIT == 0 {
                return Err(Error::InvalidPacket("fixed bit not set".to_string()));
            }
            let pn_offset = 1 + local_cid_len;
            if data.len() < pn_offset {
                return Err(Error::Truncated("short header".to_string()));
            }
            return Ok(PartialHeader {
                packet_type: PacketType::Short,
                version: 0,
                dcid: ConnectionId::new(&data[1..pn_offset])?,
                scid: ConnectionId::empty(),
                token: Bytes::new(),
                pn_offset,
                len: data.len(),
            });
        }

        let mut reader = Reader::new(data);
        reader.skip(1)?;
        let version = reader.read_u32()?;
        let dcid = reader.read_cid()?;
        let scid = reader.read_cid()?;

        if version == 0 {
            return Ok(PartialHeader {
                packet_type: PacketType::VersionNegotiation,
                version,
                dcid,
                scid,
                token: Bytes::new(),
                pn_offset: reader.pos,
                len: data.len(),
            });
        }
        if first & FIXED_BIT == 0 {
            return Err(Error::InvalidPacket("fixed bit not set".to_string()));
        }
        if version != VERSION_1 {
            return Err(Error::UnsupportedVersion(version));
        }

        let packet_type = PacketType::from_long_type_bits(first);
        match packet_type {
            PacketType::Retry => {
                if data.len() < reader.pos + TAG_LEN {
                    return Err(Error::Truncated("retry integrity tag".to_string()));
                }
                let token = Bytes::copy_from_slice(&data[reader.pos..data.len() - TAG_LEN]);
                Ok(PartialHeader {
                    packet_type,
                    version,
                    dcid,
                    scid,
                    token,
                    pn_offset: data.len() - TAG_LEN,
                    len: data.len(),
                })
            }
            _ => {
                let token = if packet_type == PacketType::Initial {
                    let token_len = reader.read_varint()? as usize;
                    Bytes::copy_from_slice(reader.take(token_len)?)
                } else {
                    Bytes::new()
                };
                let length = reader.read_varint()? as usize;
                let pn_offset = reader.pos;
                let len = pn_offset
                    .checked_add(length)
                    .filter(|len| *len <= data.len())
                    .ok_or_else(|| Error::Truncated(format!("packet length {}", length)))?;
                Ok(PartialHeader {
                    packet_type,
                    version,
                    dcid,
                    scid,
                    token,
                    pn_offset,
                    len,
                })
            }
        }
    }

    /// Whether the first byte carried a long header
    pub fn is_long(&self) -> bool {
        self.packet_type != PacketType::Short
    }
}

/// Version Negotiation packet (RFC 9000 Section 17.2.1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionNegotiation {
    pub dcid: ConnectionId,
    pub scid: ConnectionId,
    pub versions: Vec<u32>,
}

impl VersionNegotiation {
    /// Encode; `dcid`/`scid` mirror the client's SCID/DCID
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(7 + self.dcid.len() + self.scid.len() + 4 * self.versions.len());
        buf.put_u8(HEADER_FORM_LONG | FIXED_BIT);
        buf.put_u32(0);
        buf.put_u8(self.dcid.len() as u8);
        buf.put_slice(self.dcid.as_bytes());
        buf.put_u8(self.scid.len() as u8);
        buf.put_slice(self.scid.as_bytes());
        for version in &self.versions {
            buf.put_u32(*version);
        }
        buf
    }

    /// Decode a full Version Negotiation packet
    pub fn decode(data: &[u8]) -> Result<Self> {
        let header = PartialHeader::parse(data, 0)?;
        if header.packet_type != PacketType::VersionNegotiation {
            return Err(Error::InvalidPacket("not a version negotiation packet".to_string()));
        }
        let list = &data[header.pn_offset..];
        if list.is_empty() || list.len() % 4 != 0 {
            return Err(Error::InvalidPacket("malformed version list".to_string()));
        }
        let versions = list
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(VersionNegotiation {
            dcid: header.dcid,
            scid: header.scid,
            versions,
        })
    }
}

/// Retry packet (RFC 9000 Section 17.2.5)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPacket {
    pub dcid: ConnectionId,
    pub scid: ConnectionId,
    pub token: Bytes,
}

impl RetryPacket {
    /// Encode with the integrity tag computed over `original_dcid`
    pub fn encode(&self, original_dcid: &ConnectionId) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(7 + self.dcid.len() + self.scid.len() + self.token.len() + TAG_LEN);
        buf.put_u8(HEADER_FORM_LONG | FIXED_BIT | 0x30);
        buf.put_u32(VERSION_1);
        buf.put_u8(self.dcid.len() as u8);
        buf.put_slice(self.dcid.as_bytes());
        buf.put_u8(self.scid.len() as u8);
        buf.put_slice(self.scid.as_bytes());
        buf.put_slice(&self.token);
        let tag = crypto::retry_integrity_tag(original_dcid.as_bytes(), &buf)?;
        buf.put_slice(&tag);
        Ok(buf)
    }

    /// Decode and verify the integrity tag against `original_dcid`
    pub fn decode(data: &[u8], original_dcid: &ConnectionId) -> Result<Self> {
        let header = PartialHeader::parse(data, 0)?;
        if header.packet_type != PacketType::Retry {
            return Err(Error::InvalidPacket("not a retry packet".to_string()));
        }
        let (body, tag) = data.split_at(data.len() - TAG_LEN);
        let expected = crypto::retry_integrity_tag(original_dcid.as_bytes(), body)?;
        if !openssl::memcmp::eq(&expected, tag) {
            return Err(Error::InvalidPacket("retry integrity check failed".to_string()));
        }
        Ok(RetryPacket {
            dcid: header.dcid,
            scid: header.scid,
            token: header.token,
        })
    }
}

/// Number of bytes needed to encode `packet_number` so the peer can
/// reconstruct it given `largest_acked` (RFC 9000 Appendix A.2)
pub fn packet_number_len(packet_number: u64, largest_acked: Option<u64>) -> usize {
    let unacked = match largest_acked {
        Some(largest) => packet_number.saturating_sub(largest),
        None => packet_number + 1,
    };
    if unacked < 1 << 7 {
        1
    } else if unacked < 1 << 15 {
        2
    } else if unacked < 1 << 23 {
        3
    } else {
        4
    }
}

/// Write the low `pn_len` bytes of `packet_number`
pub fn encode_packet_number<B: BufMut>(buf: &mut B, packet_number: u64, pn_len: usize) {
    let bytes = packet_number.to_be_bytes();
    buf.put_slice(&bytes[8 - pn_len..]);
}

/// Reconstruct a full packet number (RFC 9000 Appendix A.3)
///
/// `largest` is the largest packet number processed so far in the space.
pub fn decode_packet_number(largest: Option<u64>, truncated: u64, pn_len: usize) -> u64 {
    let expected = largest.map_or(0, |l| l + 1);
    let win = 1u64 << (pn_len * 8);
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

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Reader { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.data.len() - self.pos < n {
            return Err(Error::Truncated(format!("need {} bytes at offset {}", n, self.pos)));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }

    fn read_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_cid(&mut self) -> Result<ConnectionId> {
        let len = self.take(1)?[0] as usize;
        ConnectionId::new(self.take(len)?)
    }

    fn read_varint(&mut self) -> Result<u64> {
        let (value, n) = varint::decode(&self.data[self.pos..])?;
        self.pos += n;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cid(bytes: &[u8]) -> ConnectionId {
        ConnectionId::new(bytes).unwrap()
    }

    #[test]
    fn test_connection_id() {
        let id = cid(&[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(id.len(), 4);
        assert_eq!(id.to_string(), "deadbeef");
        assert!(ConnectionId::new(&[0u8; 21]).is_err());
        assert!(ConnectionId::empty().is_empty());
        assert_eq!(ConnectionId::random(8).unwrap().len(), 8);
    }

    #[test]
    fn test_packet_number_decode_rfc_example() {
        // RFC 9000 Appendix A.3
        assert_eq!(decode_packet_number(Some(0xa82f30ea), 0x9b32, 2), 0xa82f9b32);
    }

    #[test]
    fn test_packet_number_decode_window_edges() {
        assert_eq!(decode_packet_number(None, 0, 1), 0);
        assert_eq!(decode_packet_number(Some(0), 1, 1), 1);
        // Wraps forward past the 1-byte window
        assert_eq!(decode_packet_number(Some(255), 0, 1), 256);
        // Stays behind when the truncated value is slightly older
        assert_eq!(decode_packet_number(Some(300), 0x2a, 1), 298);
        // Never goes negative
        assert_eq!(decode_packet_number(Some(10), 0xff, 1), 0xff);
    }

    #[test]
    fn test_packet_number_len() {
        assert_eq!(packet_number_len(0, None), 1);
        assert_eq!(packet_number_len(0xac5c02, Some(0xabe8b3)), 2);
        assert_eq!(packet_number_len(0xace8fe, Some(0xabe8b3)), 3);
        assert_eq!(packet_number_len(1 << 30, Some(0)), 4);
    }

    #[test]
    fn test_long_header_roundtrip() {
        let header = Header::Long {
            packet_type: PacketType::Initial,
            version: VERSION_1,
            dcid: cid(&[1, 2, 3, 4, 5, 6, 7, 8]),
            scid: cid(&[9, 9]),
            token: Bytes::from_static(b"tok"),
            packet_number: 2,
            pn_len: 2,
        };
        let mut buf = Vec::new();
        let pn_offset = header.encode(&mut buf, 30).unwrap();
        buf.extend_from_slice(&[0u8; 30 + TAG_LEN]);

        assert_eq!(buf[0], 0xC1);
        let parsed = PartialHeader::parse(&buf, 0).unwrap();
        assert_eq!(parsed.packet_type, PacketType::Initial);
        assert_eq!(parsed.dcid, cid(&[1, 2, 3, 4, 5, 6, 7, 8]));
        assert_eq!(parsed.scid, cid(&[9, 9]));
        assert_eq!(&parsed.token[..], b"tok");
        assert_eq!(parsed.pn_offset, pn_offset);
        assert_eq!(parsed.len, buf.len());
        assert_eq!(&buf[pn_offset..pn_offset + 2], &[0, 2]);
    }

    #[test]
    fn test_short_header_bits() {
        let header = Header::Short {
            dcid: cid(&[7; 8]),
            spin: true,
            key_phase: true,
            packet_number: 0x1234,
            pn_len: 2,
        };
        let mut buf = Vec::new();
        let pn_offset = header.encode(&mut buf, 0).unwrap();
        assert_eq!(buf[0], 0x40 | 0x20 | 0x04 | 0x01);
        assert_eq!(pn_offset, 9);
        assert_eq!(&buf[9..], &[0x12, 0x34]);

        let parsed = PartialHeader::parse(&buf, 8).unwrap();
        assert_eq!(parsed.packet_type, PacketType::Short);
        assert_eq!(parsed.dcid, cid(&[7; 8]));
    }

    #[test]
    fn test_parse_rejects_missing_fixed_bit() {
        let data = [0x00u8, 1, 2, 3, 4, 5, 6, 7, 8, 9];
        assert!(matches!(PartialHeader::parse(&data, 8), Err(Error::InvalidPacket(_))));
    }

    #[test]
    fn test_parse_rejects_unknown_version() {
        let mut data = vec![0xC0, 0xff, 0, 0, 0x1d, 0, 0];
        data.extend_from_slice(&[0u8; 8]);
        assert!(matches!(PartialHeader::parse(&data, 0), Err(Error::UnsupportedVersion(0xff00001d))));
    }

    #[test]
    fn test_parse_truncated_length() {
        let header = Header::Long {
            packet_type: PacketType::Handshake,
            version: VERSION_1,
            dcid: cid(&[1; 4]),
            scid: cid(&[2; 4]),
            token: Bytes::new(),
            packet_number: 0,
            pn_len: 1,
        };
        let mut buf = Vec::new();
        header.encode(&mut buf, 100).unwrap();
        assert!(matches!(PartialHeader::parse(&buf, 0), Err(Error::Truncated(_))));
    }

    #[test]
    fn test_version_negotiation_roundtrip() {
        let vn = VersionNegotiation {
            dcid: cid(&[1, 2]),
            scid: cid(&[3, 4, 5]),
            versions: vec![VERSION_1, 0xff00_001d],
        };
        let encoded = vn.encode();
        assert_eq!(&encoded[1..5], &[0, 0, 0, 0]);
        assert_eq!(VersionNegotiation::decode(&encoded).unwrap(), vn);
    }

    #[test]
    fn test_retry_packet_integrity() {
        let odcid = cid(&[0x83, 0x94, 0xc8, 0xf0, 0x3e, 0x51, 0x57, 0x08]);
        let retry = RetryPacket {
            dcid: ConnectionId::empty(),
            scid: cid(&[0xf0, 0x67, 0xa5, 0x50, 0x2a, 0x42, 0x62, 0xb5]),
            token: Bytes::from_static(b"token"),
        };
        let encoded = retry.encode(&odcid).unwrap();
        let decoded = RetryPacket::decode(&encoded, &odcid).unwrap();
        assert_eq!(decoded, retry);

        let other = cid(&[1, 2, 3, 4]);
        assert!(RetryPacket::decode(&encoded, &other).is_err());
    }
}
