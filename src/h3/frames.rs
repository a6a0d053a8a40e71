//! HTTP/3 frame types and utilities
//!
//! This module defines the frame types specified in RFC 9114 Section 7.2.
//! Every frame is `[type varint][length varint][payload]`; unknown types
//! are decoded as [`H3Frame::Unknown`] so callers can skip them.

use super::error::{Error, Result};
use super::settings::Settings;
use crate::quic::varint;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// Largest frame payload accepted from the peer
pub const MAX_FRAME_PAYLOAD: u64 = 16 * 1024 * 1024;

/// HTTP/3 frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum FrameType {
    /// DATA frame (0x00) - Request or response body bytes
    Data = 0x00,
    /// HEADERS frame (0x01) - QPACK-encoded field section
    Headers = 0x01,
    /// CANCEL_PUSH frame (0x03)
    CancelPush = 0x03,
    /// SETTINGS frame (0x04) - Connection configuration, control stream only
    Settings = 0x04,
    /// PUSH_PROMISE frame (0x05)
    PushPromise = 0x05,
    /// GOAWAY frame (0x07) - Graceful shutdown
    GoAway = 0x07,
    /// MAX_PUSH_ID frame (0x0d)
    MaxPushId = 0x0d,
}

impl FrameType {
    /// Convert frame type to u64
    pub fn as_u64(self) -> u64 {
        self as u64
    }

    /// Create frame type from u64
    pub fn from_u64(value: u64) -> Option<Self> {
        match value {
            0x00 => Some(FrameType::Data),
            0x01 => Some(FrameType::Headers),
            0x03 => Some(FrameType::CancelPush),
            0x04 => Some(FrameType::Settings),
            0x05 => Some(FrameType::PushPromise),
            0x07 => Some(FrameType::GoAway),
            0x0d => Some(FrameType::MaxPushId),
            _ => None,
        }
    }

    /// Get frame type name
    pub fn name(&self) -> &'static str {
        match self {
            FrameType::Data => "DATA",
            FrameType::Headers => "HEADERS",
            FrameType::CancelPush => "CANCEL_PUSH",
            FrameType::Settings => "SETTINGS",
            FrameType::PushPromise => "PUSH_PROMISE",
            FrameType::GoAway => "GOAWAY",
            FrameType::MaxPushId => "MAX_PUSH_ID",
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u64())
    }
}

/// HTTP/2 frame types that have no HTTP/3 meaning (RFC 9114 Section 7.2.8)
fn is_reserved_h2_frame(frame_type: u64) -> bool {
    matches!(frame_type, 0x02 | 0x06 | 0x08 | 0x09)
}

/// HTTP/3 frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum H3Frame {
    Data(Bytes),
    /// Encoded field section
    Headers(Bytes),
    CancelPush(u64),
    Settings(Settings),
    PushPromise { push_id: u64, field_section: Bytes },
    /// Largest stream (or push) ID the sender may still process
    GoAway(u64),
    MaxPushId(u64),
    /// Frame of an unknown or extension type, skipped by the receiver
    Unknown { frame_type: u64, payload: Bytes },
}

impl H3Frame {
    /// Wire type code
    pub fn type_code(&self) -> u64 {
        match self {
            H3Frame::Data(_) => FrameType::Data.as_u64(),
            H3Frame::Headers(_) => FrameType::Headers.as_u64(),
            H3Frame::CancelPush(_) => FrameType::CancelPush.as_u64(),
            H3Frame::Settings(_) => FrameType::Settings.as_u64(),
            H3Frame::PushPromise { .. } => FrameType::PushPromise.as_u64(),
            H3Frame::GoAway(_) => FrameType::GoAway.as_u64(),
            H3Frame::MaxPushId(_) => FrameType::MaxPushId.as_u64(),
            H3Frame::Unknown { frame_type, .. } => *frame_type,
        }
    }

    /// Frame name for logging
    pub fn name(&self) -> &'static str {
        FrameType::from_u64(self.type_code()).map_or("UNKNOWN", |t| t.name())
    }

    /// Encode the frame with its type and length
    pub fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        let mut payload = Vec::new();
        match self {
            H3Frame::Data(data) | H3Frame::Headers(data) => payload.extend_from_slice(data),
            H3Frame::CancelPush(id) | H3Frame::GoAway(id) | H3Frame::MaxPushId(id) => {
                varint::put_varint(&mut payload, *id)?;
            }
            H3Frame::Settings(settings) => settings.encode(&mut payload)?,
            H3Frame::PushPromise { push_id, field_section } => {
                varint::put_varint(&mut payload, *push_id)?;
                payload.extend_from_slice(field_section);
            }
            H3Frame::Unknown { payload: data, .. } => payload.extend_from_slice(data),
        }
        varint::put_varint(buf, self.type_code())?;
        varint::put_varint(buf, payload.len() as u64)?;
        buf.put_slice(&payload);
        Ok(())
    }

    /// Encode into a fresh buffer
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode one frame from the front of `data`
    ///
    /// Returns `Ok(None)` when `data` does not yet hold a complete frame,
    /// otherwise the frame and the number of bytes consumed.
    pub fn decode(data: &[u8]) -> Result<Option<(H3Frame, usize)>> {
        let Some((frame_type, type_len)) = try_varint(data) else {
            return Ok(None);
        };
        let Some((length, length_len)) = try_varint(&data[type_len..]) else {
            return Ok(None);
        };
        if length > MAX_FRAME_PAYLOAD {
            return Err(Error::Frame(format!("frame payload of {} bytes", length)));
        }
        let start = type_len + length_len;
        let end = start + length as usize;
        if data.len() < end {
            return Ok(None);
        }
        let mut payload = Bytes::copy_from_slice(&data[start..end]);
        let frame = Self::decode_payload(frame_type, &mut payload)?;
        Ok(Some((frame, end)))
    }

    fn decode_payload(frame_type: u64, payload: &mut Bytes) -> Result<H3Frame> {
        if is_reserved_h2_frame(frame_type) {
            return Err(Error::FrameUnexpected(format!("HTTP/2 frame type 0x{:x}", frame_type)));
        }
        let Some(known) = FrameType::from_u64(frame_type) else {
            return Ok(H3Frame::Unknown {
                frame_type,
                payload: payload.split_off(0),
            });
        };
        let frame = match known {
            FrameType::Data => H3Frame::Data(payload.split_off(0)),
            FrameType::Headers => H3Frame::Headers(payload.split_off(0)),
            FrameType::Settings => H3Frame::Settings(Settings::decode(payload)?),
            FrameType::CancelPush => H3Frame::CancelPush(single_varint(known, payload)?),
            FrameType::GoAway => H3Frame::GoAway(single_varint(known, payload)?),
            FrameType::MaxPushId => H3Frame::MaxPushId(single_varint(known, payload)?),
            FrameType::PushPromise => {
                let push_id = varint::get_varint(payload).map_err(|e| Error::Frame(format!("PUSH_PROMISE: {}", e)))?;
                H3Frame::PushPromise {
                    push_id,
                    field_section: payload.split_off(0),
                }
            }
        };
        Ok(frame)
    }
}

fn try_varint(data: &[u8]) -> Option<(u64, usize)> {
    let first = *data.first()?;
    if data.len() < varint::len_from_first_byte(first) {
        return None;
    }
    varint::decode(data).ok()
}

/// Payload made of exactly one varint
fn single_varint(frame_type: FrameType, payload: &mut Bytes) -> Result<u64> {
    let value = varint::get_varint(payload).map_err(|e| Error::Frame(format!("{}: {}", frame_type.name(), e)))?;
    if payload.has_remaining() {
        return Err(Error::Frame(format!("{} has trailing bytes", frame_type.name())));
    }
    Ok(value)
}

/// Incremental frame parser for one stream
#[derive(Debug, Default)]
pub struct FrameReader {
    buf: BytesMut,
}

impl FrameReader {
    /// Create an empty reader
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the stream
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Next complete frame, if any
    pub fn next_frame(&mut self) -> Result<Option<H3Frame>> {
        match H3Frame::decode(&self.buf)? {
            Some((frame, consumed)) => {
                self.buf.advance(consumed);
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }

    /// Bytes buffered but not yet framed
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Take the raw buffered bytes
    pub fn take_buffered(&mut self) -> Bytes {
        self.buf.split().freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::h3::settings::SettingsBuilder;

    #[test]
    fn test_frame_type_conversion() {
        assert_eq!(FrameType::GoAway.as_u64(), 0x07);
        assert_eq!(FrameType::from_u64(0x0d), Some(FrameType::MaxPushId));
        assert_eq!(FrameType::from_u64(0x21), None);
        assert_eq!(FrameType::Settings.to_string(), "SETTINGS (0x4)");
    }

    #[test]
    fn test_data_frame_bytes() {
        let frame = H3Frame::Data(Bytes::from_static(b"hi"));
        assert_eq!(&frame.to_bytes().unwrap()[..], &[0x00, 0x02, b'h', b'i']);
    }

    #[test]
    fn test_goaway_decode() {
        let (frame, used) = H3Frame::decode(&[0x07, 0x01, 0x04, 0xff]).unwrap().unwrap();
        assert_eq!(frame, H3Frame::GoAway(4));
        assert_eq!(used, 3);
    }

    #[test]
    fn test_incomplete_frame() {
        assert!(H3Frame::decode(&[]).unwrap().is_none());
        assert!(H3Frame::decode(&[0x01]).unwrap().is_none());
        assert!(H3Frame::decode(&[0x01, 0x05, 0x00]).unwrap().is_none());
    }

    #[test]
    fn test_unknown_frame_skipped_by_length() {
        let data = [0x21, 0x03, 1, 2, 3, 0x00, 0x00];
        let (frame, used) = H3Frame::decode(&data).unwrap().unwrap();
        assert_eq!(used, 5);
        assert!(matches!(frame, H3Frame::Unknown { frame_type: 0x21, .. }));
        let (frame, _) = H3Frame::decode(&data[used..]).unwrap().unwrap();
        assert_eq!(frame, H3Frame::Data(Bytes::new()));
    }

    #[test]
    fn test_reserved_h2_frame_rejected() {
        assert!(matches!(
            H3Frame::decode(&[0x06, 0x00]),
            Err(Error::FrameUnexpected(_))
        ));
    }

    #[test]
    fn test_settings_frame() {
        let settings = SettingsBuilder::new().qpack_max_table_capacity(4096).build().unwrap();
        let bytes = H3Frame::Settings(settings.clone()).to_bytes().unwrap();
        let (frame, _) = H3Frame::decode(&bytes).unwrap().unwrap();
        assert_eq!(frame, H3Frame::Settings(settings));
    }

    #[test]
    fn test_trailing_bytes_in_goaway() {
        assert!(H3Frame::decode(&[0x07, 0x02, 0x04, 0x00]).is_err());
    }

    #[test]
    fn test_frame_reader() {
        let mut reader = FrameReader::new();
        let bytes = H3Frame::Headers(Bytes::from_static(b"abc")).to_bytes().unwrap();
        reader.push(&bytes[..2]);
        assert!(reader.next_frame().unwrap().is_none());
        reader.push(&bytes[2..]);
        assert_eq!(
            reader.next_frame().unwrap(),
            Some(H3Frame::Headers(Bytes::from_static(b"abc")))
        );
        assert_eq!(reader.buffered(), 0);
    }
}
