//! QUIC transport frames (RFC 9000 Section 19)
//!
//! Frames are a closed sum type with one variant per wire type. Encoding
//! writes through `bytes::BufMut`; decoding consumes a `Bytes` payload so
//! data-carrying frames share the packet buffer instead of copying it.

use super::crypto::EncryptionLevel;
use super::error::{Error, Result};
use super::packet::ConnectionId;
use super::stream::StreamId;
use super::varint::{self, get_varint, put_varint};
use bytes::{Buf, BufMut, Bytes};
use std::fmt;

/// Transport frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Padding,
    Ping,
    Ack,
    AckEcn,
    ResetStream,
    StopSending,
    Crypto,
    NewToken,
    /// STREAM (0x08-0x0f); the low three bits are OFF/LEN/FIN
    Stream(u8),
    MaxData,
    MaxStreamData,
    MaxStreamsBidi,
    MaxStreamsUni,
    DataBlocked,
    StreamDataBlocked,
    StreamsBlockedBidi,
    StreamsBlockedUni,
    NewConnectionId,
    RetireConnectionId,
    PathChallenge,
    PathResponse,
    ConnectionCloseTransport,
    ConnectionCloseApplication,
    HandshakeDone,
    /// DATAGRAM (0x30/0x31); bit 0 is LEN
    Datagram(bool),
}

impl FrameType {
    /// Convert frame type to its wire code
    pub fn as_u64(self) -> u64 {
        match self {
            FrameType::Padding => 0x00,
            FrameType::Ping => 0x01,
            FrameType::Ack => 0x02,
            FrameType::AckEcn => 0x03,
            FrameType::ResetStream => 0x04,
            FrameType::StopSending => 0x05,
            FrameType::Crypto => 0x06,
            FrameType::NewToken => 0x07,
            FrameType::Stream(flags) => 0x08 | (flags & 0x07) as u64,
            FrameType::MaxData => 0x10,
            FrameType::MaxStreamData => 0x11,
            FrameType::MaxStreamsBidi => 0x12,
            FrameType::MaxStreamsUni => 0x13,
            FrameType::DataBlocked => 0x14,
            FrameType::StreamDataBlocked => 0x15,
            FrameType::StreamsBlockedBidi => 0x16,
            FrameType::StreamsBlockedUni => 0x17,
            FrameType::NewConnectionId => 0x18,
            FrameType::RetireConnectionId => 0x19,
            FrameType::PathChallenge => 0x1a,
            FrameType::PathResponse => 0x1b,
            FrameType::ConnectionCloseTransport => 0x1c,
            FrameType::ConnectionCloseApplication => 0x1d,
            FrameType::HandshakeDone => 0x1e,
            FrameType::Datagram(with_len) => 0x30 | with_len as u64,
        }
    }

    /// Create frame type from its wire code
    pub fn from_u64(code: u64) -> Option<Self> {
        match code {
            0x00 => Some(FrameType::Padding),
            0x01 => Some(FrameType::Ping),
            0x02 => Some(FrameType::Ack),
            0x03 => Some(FrameType::AckEcn),
            0x04 => Some(FrameType::ResetStream),
            0x05 => Some(FrameType::StopSending),
            0x06 => Some(FrameType::Crypto),
            0x07 => Some(FrameType::NewToken),
            0x08..=0x0f => Some(FrameType::Stream((code & 0x07) as u8)),
            0x10 => Some(FrameType::MaxData),
            0x11 => Some(FrameType::MaxStreamData),
            0x12 => Some(FrameType::MaxStreamsBidi),
            0x13 => Some(FrameType::MaxStreamsUni),
            0x14 => Some(FrameType::DataBlocked),
            0x15 => Some(FrameType::StreamDataBlocked),
            0x16 => Some(FrameType::StreamsBlockedBidi),
            0x17 => Some(FrameType::StreamsBlockedUni),
            0x18 => Some(FrameType::NewConnectionId),
            0x19 => Some(FrameType::RetireConnectionId),
            0x1a => Some(FrameType::PathChallenge),
            0x1b => Some(FrameType::PathResponse),
            0x1c => Some(FrameType::ConnectionCloseTransport),
            0x1d => Some(FrameType::ConnectionCloseApplication),
            0x1e => Some(FrameType::HandshakeDone),
            0x30 => Some(FrameType::Datagram(false)),
            0x31 => Some(FrameType::Datagram(true)),
            _ => None,
        }
    }

    /// Get frame type name
    pub fn name(&self) -> &'static str {
        match self {
            FrameType::Padding => "PADDING",
            FrameType::Ping => "PING",
            FrameType::Ack | FrameType::AckEcn => "ACK",
            FrameType::ResetStream => "RESET_STREAM",
            FrameType::StopSending => "STOP_SENDING",
            FrameType::Crypto => "CRYPTO",
            FrameType::NewToken => "NEW_TOKEN",
            FrameType::Stream(_) => "STREAM",
            FrameType::MaxData => "MAX_DATA",
            FrameType::MaxStreamData => "MAX_STREAM_DATA",
            FrameType::MaxStreamsBidi | FrameType::MaxStreamsUni => "MAX_STREAMS",
            FrameType::DataBlocked => "DATA_BLOCKED",
            FrameType::StreamDataBlocked => "STREAM_DATA_BLOCKED",
            FrameType::StreamsBlockedBidi | FrameType::StreamsBlockedUni => "STREAMS_BLOCKED",
            FrameType::NewConnectionId => "NEW_CONNECTION_ID",
            FrameType::RetireConnectionId => "RETIRE_CONNECTION_ID",
            FrameType::PathChallenge => "PATH_CHALLENGE",
            FrameType::PathResponse => "PATH_RESPONSE",
            FrameType::ConnectionCloseTransport | FrameType::ConnectionCloseApplication => {
                "CONNECTION_CLOSE"
            }
            FrameType::HandshakeDone => "HANDSHAKE_DONE",
            FrameType::Datagram(_) => "DATAGRAM",
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u64())
    }
}

/// STREAM frame flag bits
pub const STREAM_FLAG_OFF: u8 = 0x04;
pub const STREAM_FLAG_LEN: u8 = 0x02;
pub const STREAM_FLAG_FIN: u8 = 0x01;

/// ECN counts carried by ACK (0x03)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EcnCounts {
    pub ect0: u64,
    pub ect1: u64,
    pub ce: u64,
}

/// ACK frame
///
/// `ranges` holds inclusive `(smallest, largest)` pairs in descending
/// order; the first range contains the largest acknowledged number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckFrame {
    pub ranges: Vec<(u64, u64)>,
    /// Encoded ack delay (scaled by the ack_delay_exponent)
    pub delay: u64,
    pub ecn: Option<EcnCounts>,
}

impl AckFrame {
    /// Largest acknowledged packet number
    pub fn largest(&self) -> u64 {
        self.ranges.first().map_or(0, |r| r.1)
    }

    /// Whether `pn` is covered by any range
    pub fn contains(&self, pn: u64) -> bool {
        self.ranges.iter().any(|(lo, hi)| *lo <= pn && pn <= *hi)
    }

    /// Iterate over every acknowledged packet number, largest first
    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.ranges.iter().flat_map(|(lo, hi)| (*lo..=*hi).rev())
    }

    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        let (first_lo, first_hi) = *self
            .ranges
            .first()
            .ok_or_else(|| Error::FrameEncoding("ACK without ranges".to_string()))?;
        put_varint(buf, first_hi)?;
        put_varint(buf, self.delay)?;
        put_varint(buf, (self.ranges.len() - 1) as u64)?;
        put_varint(buf, first_hi - first_lo)?;

        let mut prev_lo = first_lo;
        for (lo, hi) in &self.ranges[1..] {
            if *hi + 2 > prev_lo {
                return Err(Error::FrameEncoding("ACK ranges overlap or touch".to_string()));
            }
            put_varint(buf, prev_lo - hi - 2)?;
            put_varint(buf, hi - lo)?;
            prev_lo = *lo;
        }

        if let Some(ecn) = &self.ecn {
            put_varint(buf, ecn.ect0)?;
            put_varint(buf, ecn.ect1)?;
            put_varint(buf, ecn.ce)?;
        }
        Ok(())
    }

    fn decode(buf: &mut Bytes, with_ecn: bool) -> Result<Self> {
        let largest = get_varint(buf)?;
        let delay = get_varint(buf)?;
        let count = get_varint(buf)?;
        let first_len = get_varint(buf)?;

        let mut smallest = largest
            .checked_sub(first_len)
            .ok_or_else(|| Error::FrameEncoding("ACK first range underflow".to_string()))?;
        let mut ranges = vec![(smallest, largest)];

        for _ in 0..count {
            let gap = get_varint(buf)?;
            let len = get_varint(buf)?;
            let hi = smallest
                .checked_sub(gap + 2)
                .ok_or_else(|| Error::FrameEncoding("ACK gap underflow".to_string()))?;
            let lo = hi
                .checked_sub(len)
                .ok_or_else(|| Error::FrameEncoding("ACK range underflow".to_string()))?;
            ranges.push((lo, hi));
            smallest = lo;
        }

        let ecn = if with_ecn {
            Some(EcnCounts {
                ect0: get_varint(buf)?,
                ect1: get_varint(buf)?,
                ce: get_varint(buf)?,
            })
        } else {
            None
        };

        Ok(AckFrame { ranges, delay, ecn })
    }
}

/// STREAM frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    pub stream_id: StreamId,
    pub offset: u64,
    pub data: Bytes,
    pub fin: bool,
}

impl StreamFrame {
    /// Create a new STREAM frame
    pub fn new(stream_id: StreamId, offset: u64, data: Bytes, fin: bool) -> Self {
        StreamFrame {
            stream_id,
            offset,
            data,
            fin,
        }
    }

    /// Worst-case encoding overhead for a frame with explicit offset and length
    pub fn max_overhead(stream_id: StreamId, offset: u64) -> usize {
        1 + varint::encoded_len(stream_id.as_u64()) + varint::encoded_len(offset) + 4
    }
}

/// CONNECTION_CLOSE frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionClose {
    pub error_code: u64,
    /// Offending frame type for transport closes; `None` for application closes
    pub frame_type: Option<u64>,
    pub reason: Bytes,
    pub application: bool,
}

impl ConnectionClose {
    /// Transport-level close (0x1c)
    pub fn transport(error_code: u64, frame_type: u64, reason: &str) -> Self {
        ConnectionClose {
            error_code,
            frame_type: Some(frame_type),
            reason: Bytes::copy_from_slice(reason.as_bytes()),
            application: false,
        }
    }

    /// Application-level close (0x1d)
    pub fn application(error_code: u64, reason: &str) -> Self {
        ConnectionClose {
            error_code,
            frame_type: None,
            reason: Bytes::copy_from_slice(reason.as_bytes()),
            application: true,
        }
    }

    /// Reason phrase, lossily decoded
    pub fn reason_str(&self) -> String {
        String::from_utf8_lossy(&self.reason).into_owned()
    }
}

/// QUIC transport frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// One or more consecutive PADDING bytes
    Padding(usize),
    Ping,
    Ack(AckFrame),
    ResetStream {
        stream_id: StreamId,
        error_code: u64,
        final_size: u64,
    },
    StopSending {
        stream_id: StreamId,
        error_code: u64,
    },
    Crypto {
        offset: u64,
        data: Bytes,
    },
    NewToken(Bytes),
    Stream(StreamFrame),
    MaxData(u64),
    MaxStreamData {
        stream_id: StreamId,
        max: u64,
    },
    MaxStreams {
        bidi: bool,
        max: u64,
    },
    DataBlocked(u64),
    StreamDataBlocked {
        stream_id: StreamId,
        limit: u64,
    },
    StreamsBlocked {
        bidi: bool,
        limit: u64,
    },
    NewConnectionId {
        sequence: u64,
        retire_prior_to: u64,
        cid: ConnectionId,
        reset_token: [u8; 16],
    },
    RetireConnectionId(u64),
    PathChallenge([u8; 8]),
    PathResponse([u8; 8]),
    ConnectionClose(ConnectionClose),
    HandshakeDone,
    Datagram(Bytes),
}

impl Frame {
    /// Wire type of this frame
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Padding(_) => FrameType::Padding,
            Frame::Ping => FrameType::Ping,
            Frame::Ack(ack) => {
                if ack.ecn.is_some() {
                    FrameType::AckEcn
                } else {
                    FrameType::Ack
                }
            }
            Frame::ResetStream { .. } => FrameType::ResetStream,
            Frame::StopSending { .. } => FrameType::StopSending,
            Frame::Crypto { .. } => FrameType::Crypto,
            Frame::NewToken(_) => FrameType::NewToken,
            Frame::Stream(frame) => {
                let mut flags = STREAM_FLAG_LEN;
                if frame.offset > 0 {
                    flags |= STREAM_FLAG_OFF;
                }
                if frame.fin {
                    flags |= STREAM_FLAG_FIN;
                }
                FrameType::Stream(flags)
            }
            Frame::MaxData(_) => FrameType::MaxData,
            Frame::MaxStreamData { .. } => FrameType::MaxStreamData,
            Frame::MaxStreams { bidi: true, .. } => FrameType::MaxStreamsBidi,
            Frame::MaxStreams { bidi: false, .. } => FrameType::MaxStreamsUni,
            Frame::DataBlocked(_) => FrameType::DataBlocked,
            Frame::StreamDataBlocked { .. } => FrameType::StreamDataBlocked,
            Frame::StreamsBlocked { bidi: true, .. } => FrameType::StreamsBlockedBidi,
            Frame::StreamsBlocked { bidi: false, .. } => FrameType::StreamsBlockedUni,
            Frame::NewConnectionId { .. } => FrameType::NewConnectionId,
            Frame::RetireConnectionId(_) => FrameType::RetireConnectionId,
            Frame::PathChallenge(_) => FrameType::PathChallenge,
            Frame::PathResponse(_) => FrameType::PathResponse,
            Frame::ConnectionClose(close) => {
                if close.application {
                    FrameType::ConnectionCloseApplication
                } else {
                    FrameType::ConnectionCloseTransport
                }
            }
            Frame::HandshakeDone => FrameType::HandshakeDone,
            Frame::Datagram(_) => FrameType::Datagram(true),
        }
    }

    /// Whether receiving this frame obliges the peer to acknowledge it
    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(self, Frame::Padding(_) | Frame::Ack(_) | Frame::ConnectionClose(_))
    }

    /// Whether this frame may appear in a packet at `level` (RFC 9000 Table 3)
    pub fn allowed_at(&self, level: EncryptionLevel) -> bool {
        match level {
            EncryptionLevel::Initial | EncryptionLevel::Handshake => match self {
                Frame::Padding(_) | Frame::Ping | Frame::Ack(_) | Frame::Crypto { .. } => true,
                Frame::ConnectionClose(close) => !close.application,
                _ => false,
            },
            EncryptionLevel::ZeroRtt => !matches!(
                self,
                Frame::Ack(_)
                    | Frame::Crypto { .. }
                    | Frame::NewToken(_)
                    | Frame::PathResponse(_)
                    | Frame::RetireConnectionId(_)
                    | Frame::HandshakeDone
            ),
            EncryptionLevel::OneRtt => true,
        }
    }

    /// Encode this frame
    pub fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        if let Frame::Padding(len) = self {
            buf.put_bytes(0, *len);
            return Ok(());
        }

        put_varint(buf, self.frame_type().as_u64())?;
        match self {
            Frame::Padding(_) | Frame::Ping | Frame::HandshakeDone => {}
            Frame::Ack(ack) => ack.encode(buf)?,
            Frame::ResetStream {
                stream_id,
                error_code,
                final_size,
            } => {
                put_varint(buf, stream_id.as_u64())?;
                put_varint(buf, *error_code)?;
                put_varint(buf, *final_size)?;
            }
            Frame::StopSending { stream_id, error_code } => {
                put_varint(buf, stream_id.as_u64())?;
                put_varint(buf, *error_code)?;
            }
            Frame::Crypto { offset, data } => {
                put_varint(buf, *offset)?;
                put_varint(buf, data.len() as u64)?;
                buf.put_slice(data);
            }
            Frame::NewToken(token) => {
                put_varint(buf, token.len() as u64)?;
                buf.put_slice(token);
            }
            Frame::Stream(frame) => {
                put_varint(buf, frame.stream_id.as_u64())?;
                if frame.offset > 0 {
                    put_varint(buf, frame.offset)?;
                }
                put_varint(buf, frame.data.len() as u64)?;
                buf.put_slice(&frame.data);
            }
            Frame::MaxData(max) | Frame::DataBlocked(max) | Frame::RetireConnectionId(max) => {
                put_varint(buf, *max)?;
            }
            Frame::MaxStreamData { stream_id, max } => {
                put_varint(buf, stream_id.as_u64())?;
                put_varint(buf, *max)?;
            }
            Frame::StreamDataBlocked { stream_id, limit } => {
                put_varint(buf, stream_id.as_u64())?;
                put_varint(buf, *limit)?;
            }
            Frame::MaxStreams { max, .. } => put_varint(buf, *max)?,
            Frame::StreamsBlocked { limit, .. } => put_varint(buf, *limit)?,
            Frame::NewConnectionId {
                sequence,
                retire_prior_to,
                cid,
                reset_token,
            } => {
                put_varint(buf, *sequence)?;
                put_varint(buf, *retire_prior_to)?;
                buf.put_u8(cid.len() as u8);
                buf.put_slice(cid.as_bytes());
                buf.put_slice(reset_token);
            }
            Frame::PathChallenge(data) | Frame::PathResponse(data) => buf.put_slice(data),
            Frame::ConnectionClose(close) => {
                put_varint(buf, close.error_code)?;
                if !close.application {
                    put_varint(buf, close.frame_type.unwrap_or(0))?;
                }
                put_varint(buf, close.reason.len() as u64)?;
                buf.put_slice(&close.reason);
            }
            Frame::Datagram(data) => {
                put_varint(buf, data.len() as u64)?;
                buf.put_slice(data);
            }
        }
        Ok(())
    }

    /// Encode into a fresh vector
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.encode(&mut out)?;
        Ok(out)
    }

    /// Decode one frame from the front of `buf`
    pub fn decode(buf: &mut Bytes) -> Result<Frame> {
        let code = get_varint(buf)?;
        let frame_type = FrameType::from_u64(code).ok_or(Error::UnknownFrameType(code))?;

        let frame = match frame_type {
            FrameType::Padding => {
                let mut len = 1;
                while buf.first() == Some(&0) {
                    buf.advance(1);
                    len += 1;
                }
                Frame::Padding(len)
            }
            FrameType::Ping => Frame::Ping,
            FrameType::Ack => Frame::Ack(AckFrame::decode(buf, false)?),
            FrameType::AckEcn => Frame::Ack(AckFrame::decode(buf, true)?),
            FrameType::ResetStream => Frame::ResetStream {
                stream_id: StreamId::new(get_varint(buf)?),
                error_code: get_varint(buf)?,
                final_size: get_varint(buf)?,
            },
            FrameType::StopSending => Frame::StopSending {
                stream_id: StreamId::new(get_varint(buf)?),
                error_code: get_varint(buf)?,
            },
            FrameType::Crypto => {
                let offset = get_varint(buf)?;
                let len = get_varint(buf)?;
                Frame::Crypto {
                    offset,
                    data: take(buf, len)?,
                }
            }
            FrameType::NewToken => {
                let len = get_varint(buf)?;
                if len == 0 {
                    return Err(Error::FrameEncoding("empty NEW_TOKEN".to_string()));
                }
                Frame::NewToken(take(buf, len)?)
            }
            FrameType::Stream(flags) => {
                let stream_id = StreamId::new(get_varint(buf)?);
                let offset = if flags & STREAM_FLAG_OFF != 0 {
                    get_varint(buf)?
                } else {
                    0
                };
                let data = if flags & STREAM_FLAG_LEN != 0 {
                    let len = get_varint(buf)?;
                    take(buf, len)?
                } else {
                    buf.split_to(buf.len())
                };
                if offset + data.len() as u64 > varint::MAX_VARINT {
                    return Err(Error::FrameEncoding("stream offset overflow".to_string()));
                }
                Frame::Stream(StreamFrame {
                    stream_id,
                    offset,
                    data,
                    fin: flags & STREAM_FLAG_FIN != 0,
                })
            }
            FrameType::MaxData => Frame::MaxData(get_varint(buf)?),
            FrameType::MaxStreamData => Frame::MaxStreamData {
                stream_id: StreamId::new(get_varint(buf)?),
                max: get_varint(buf)?,
            },
            FrameType::MaxStreamsBidi | FrameType::MaxStreamsUni => Frame::MaxStreams {
                bidi: frame_type == FrameType::MaxStreamsBidi,
                max: check_stream_count(get_varint(buf)?)?,
            },
            FrameType::DataBlocked => Frame::DataBlocked(get_varint(buf)?),
            FrameType::StreamDataBlocked => Frame::StreamDataBlocked {
                stream_id: StreamId::new(get_varint(buf)?),
                limit: get_varint(buf)?,
            },
            FrameType::StreamsBlockedBidi | FrameType::StreamsBlockedUni => Frame::StreamsBlocked {
                bidi: frame_type == FrameType::StreamsBlockedBidi,
                limit: check_stream_count(get_varint(buf)?)?,
            },
            FrameType::NewConnectionId => {
                let sequence = get_varint(buf)?;
                let retire_prior_to = get_varint(buf)?;
                if retire_prior_to > sequence {
                    return Err(Error::FrameEncoding(
                        "retire_prior_to greater than sequence".to_string(),
                    ));
                }
                if !buf.has_remaining() {
                    return Err(Error::Truncated("NEW_CONNECTION_ID length".to_string()));
                }
                let len = buf.get_u8() as usize;
                if len == 0 {
                    return Err(Error::FrameEncoding("zero-length connection ID".to_string()));
                }
                let cid = ConnectionId::new(&take(buf, len as u64)?)
                    .map_err(|e| Error::FrameEncoding(e.to_string()))?;
                let mut reset_token = [0u8; 16];
                reset_token.copy_from_slice(&take(buf, 16)?);
                Frame::NewConnectionId {
                    sequence,
                    retire_prior_to,
                    cid,
                    reset_token,
                }
            }
            FrameType::RetireConnectionId => Frame::RetireConnectionId(get_varint(buf)?),
            FrameType::PathChallenge | FrameType::PathResponse => {
                let mut data = [0u8; 8];
                data.copy_from_slice(&take(buf, 8)?);
                if frame_type == FrameType::PathChallenge {
                    Frame::PathChallenge(data)
                } else {
                    Frame::PathResponse(data)
                }
            }
            FrameType::ConnectionCloseTransport | FrameType::ConnectionCloseApplication => {
                let application = frame_type == FrameType::ConnectionCloseApplication;
                let error_code = get_varint(buf)?;
                let offending = if application {
                    None
                } else {
                    Some(get_varint(buf)?)
                };
                let len = get_varint(buf)?;
                Frame::ConnectionClose(ConnectionClose {
                    error_code,
                    frame_type: offending,
                    reason: take(buf, len)?,
                    application,
                })
            }
            FrameType::HandshakeDone => Frame::HandshakeDone,
            FrameType::Datagram(with_len) => {
                let data = if with_len {
                    let len = get_varint(buf)?;
                    take(buf, len)?
                } else {
                    buf.split_to(buf.len())
                };
                Frame::Datagram(data)
            }
        };
        Ok(frame)
    }
}

fn take(buf: &mut Bytes, len: u64) -> Result<Bytes> {
    if (buf.len() as u64) < len {
        return Err(Error::Truncated(format!(
            "frame field needs {} bytes, have {}",
            len,
            buf.len()
        )));
    }
    Ok(buf.split_to(len as usize))
}

fn check_stream_count(count: u64) -> Result<u64> {
    if count > 1 << 60 {
        return Err(Error::FrameEncoding(format!("stream count {} exceeds 2^60", count)));
    }
    Ok(count)
}

/// Iterator over the frames of a decrypted packet payload
///
/// Yields frames until the payload is exhausted; after the first decode
/// error it yields that error once and then stops.
pub struct FrameIter {
    payload: Bytes,
    failed: bool,
}

impl FrameIter {
    /// Create an iterator over `payload`
    pub fn new(payload: Bytes) -> Self {
        FrameIter {
            payload,
            failed: false,
        }
    }
}

impl Iterator for FrameIter {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.payload.is_empty() {
            return None;
        }
        match Frame::decode(&mut self.payload) {
            Ok(frame) => Some(Ok(frame)),
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: Frame) -> Frame {
        let encoded = frame.to_vec().unwrap();
        let mut bytes = Bytes::from(encoded);
        let decoded = Frame::decode(&mut bytes).unwrap();
        assert!(bytes.is_empty(), "trailing bytes after {:?}", frame);
        decoded
    }

    #[test]
    fn test_frame_type_codes() {
        assert_eq!(FrameType::from_u64(0x0b), Some(FrameType::Stream(0x03)));
        assert_eq!(FrameType::Stream(0x07).as_u64(), 0x0f);
        assert_eq!(FrameType::from_u64(0x1d), Some(FrameType::ConnectionCloseApplication));
        assert_eq!(FrameType::from_u64(0x31), Some(FrameType::Datagram(true)));
        assert_eq!(FrameType::from_u64(0x20), None);
        assert_eq!(FrameType::HandshakeDone.to_string(), "HANDSHAKE_DONE (0x1e)");
    }

    #[test]
    fn test_ack_frame_ranges() {
        let ack = AckFrame {
            ranges: vec![(8, 10), (3, 5), (0, 0)],
            delay: 25,
            ecn: None,
        };
        let encoded = Frame::Ack(ack.clone()).to_vec().unwrap();
        // type, largest=10, delay=25, count=2, first=2, gap=1, len=2, gap=1, len=0
        assert_eq!(encoded, vec![0x02, 10, 25, 2, 2, 1, 2, 1, 0]);

        let decoded = roundtrip(Frame::Ack(ack));
        match decoded {
            Frame::Ack(ack) => {
                assert_eq!(ack.largest(), 10);
                assert!(ack.contains(4));
                assert!(!ack.contains(6));
                assert_eq!(ack.iter().collect::<Vec<_>>(), vec![10, 9, 8, 5, 4, 3, 0]);
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_ack_ecn_roundtrip() {
        let ack = AckFrame {
            ranges: vec![(0, 3)],
            delay: 0,
            ecn: Some(EcnCounts { ect0: 1, ect1: 2, ce: 3 }),
        };
        let encoded = Frame::Ack(ack.clone()).to_vec().unwrap();
        assert_eq!(encoded[0], 0x03);
        assert_eq!(roundtrip(Frame::Ack(ack.clone())), Frame::Ack(ack));
    }

    #[test]
    fn test_ack_underflow_rejected() {
        // largest=2, first range length 5
        let mut bytes = Bytes::from_static(&[0x02, 2, 0, 0, 5]);
        assert!(matches!(Frame::decode(&mut bytes), Err(Error::FrameEncoding(_))));
    }

    #[test]
    fn test_stream_frame_flags() {
        let frame = Frame::Stream(StreamFrame::new(
            StreamId::new(4),
            100,
            Bytes::from_static(b"hello"),
            true,
        ));
        let encoded = frame.to_vec().unwrap();
        assert_eq!(encoded[0], 0x08 | STREAM_FLAG_OFF | STREAM_FLAG_LEN | STREAM_FLAG_FIN);
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn test_stream_frame_without_length_takes_rest() {
        // STREAM with OFF, no LEN: id=1, offset=2, rest is data
        let mut bytes = Bytes::from_static(&[0x0c, 0x01, 0x02, b'a', b'b', b'c']);
        match Frame::decode(&mut bytes).unwrap() {
            Frame::Stream(frame) => {
                assert_eq!(frame.stream_id, StreamId::new(1));
                assert_eq!(frame.offset, 2);
                assert_eq!(&frame.data[..], b"abc");
                assert!(!frame.fin);
            }
            other => panic!("unexpected frame {:?}", other),
        }
        assert!(bytes.is_empty());
    }

    #[test]
    fn test_padding_collapses() {
        let mut bytes = Bytes::from_static(&[0, 0, 0, 0x01]);
        assert_eq!(Frame::decode(&mut bytes).unwrap(), Frame::Padding(3));
        assert_eq!(Frame::decode(&mut bytes).unwrap(), Frame::Ping);
    }

    #[test]
    fn test_control_frames_roundtrip() {
        let frames = vec![
            Frame::ResetStream {
                stream_id: StreamId::new(8),
                error_code: 0x10c,
                final_size: 1000,
            },
            Frame::StopSending {
                stream_id: StreamId::new(8),
                error_code: 0x10c,
            },
            Frame::Crypto {
                offset: 7,
                data: Bytes::from_static(b"client hello"),
            },
            Frame::NewToken(Bytes::from_static(b"token")),
            Frame::MaxData(1 << 20),
            Frame::MaxStreamData {
                stream_id: StreamId::new(0),
                max: 65536,
            },
            Frame::MaxStreams { bidi: true, max: 100 },
            Frame::MaxStreams { bidi: false, max: 3 },
            Frame::DataBlocked(500),
            Frame::StreamDataBlocked {
                stream_id: StreamId::new(4),
                limit: 10,
            },
            Frame::StreamsBlocked { bidi: false, limit: 3 },
            Frame::NewConnectionId {
                sequence: 1,
                retire_prior_to: 0,
                cid: ConnectionId::new(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap(),
                reset_token: [9u8; 16],
            },
            Frame::RetireConnectionId(1),
            Frame::PathChallenge([1, 2, 3, 4, 5, 6, 7, 8]),
            Frame::PathResponse([8, 7, 6, 5, 4, 3, 2, 1]),
            Frame::ConnectionClose(ConnectionClose::transport(0xa, 0x08, "bad stream")),
            Frame::ConnectionClose(ConnectionClose::application(0x100, "bye")),
            Frame::HandshakeDone,
            Frame::Datagram(Bytes::from_static(b"unreliable")),
        ];
        for frame in frames {
            assert_eq!(roundtrip(frame.clone()), frame);
        }
    }

    #[test]
    fn test_connection_close_encoding() {
        let encoded = Frame::ConnectionClose(ConnectionClose::transport(0x0a, 0x06, "x"))
            .to_vec()
            .unwrap();
        assert_eq!(encoded, vec![0x1c, 0x0a, 0x06, 0x01, b'x']);
    }

    #[test]
    fn test_frame_iter_stops_on_error() {
        // PING, unknown type 0x21, PING
        let payload = Bytes::from_static(&[0x01, 0x21, 0x01]);
        let frames: Vec<_> = FrameIter::new(payload).collect();
        assert_eq!(frames.len(), 2);
        assert!(matches!(frames[0], Ok(Frame::Ping)));
        assert!(matches!(frames[1], Err(Error::UnknownFrameType(0x21))));
    }

    #[test]
    fn test_frame_truncated() {
        let mut bytes = Bytes::from_static(&[0x06, 0x00, 0x05, b'a']);
        assert!(matches!(Frame::decode(&mut bytes), Err(Error::Truncated(_))));
    }

    #[test]
    fn test_frame_level_rules() {
        let stream = Frame::Stream(StreamFrame::new(StreamId::new(0), 0, Bytes::new(), false));
        assert!(!stream.allowed_at(EncryptionLevel::Initial));
        assert!(stream.allowed_at(EncryptionLevel::ZeroRtt));
        assert!(Frame::Ping.allowed_at(EncryptionLevel::Handshake));
        assert!(!Frame::HandshakeDone.allowed_at(EncryptionLevel::ZeroRtt));
        let app_close = Frame::ConnectionClose(ConnectionClose::application(0, ""));
        assert!(!app_close.allowed_at(EncryptionLevel::Initial));
        assert!(!Frame::Padding(1).is_ack_eliciting());
        assert!(Frame::Ping.is_ack_eliciting());
    }
}
