//! QUIC stream management
//!
//! This module implements the stream state machines of RFC 9000
//! Section 3, the out-of-order receive buffer and the retransmission-aware
//! send buffer.
//!
//! Streams are owned by `StreamManager` and addressed by `StreamId`;
//! connection-wide services (connection flow control) are passed into the
//! operations that need them.

use super::error::{Error, Result};
use super::flow_control::{FlowControlConfig, FlowControlWindow, RecvCredit, SendCredit};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use tracing::{debug, trace};

/// Endpoint role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    /// Whether this is the client
    pub fn is_client(self) -> bool {
        self == Side::Client
    }

    /// The other endpoint
    pub fn peer(self) -> Side {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }
}

/// Stream directionality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dir {
    Bidi,
    Uni,
}

/// Stream identifier
///
/// Bit 0 is the initiator (0 = client), bit 1 the direction (0 = bidi).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(u64);

impl StreamId {
    /// Wrap a raw stream ID
    pub fn new(id: u64) -> Self {
        StreamId(id)
    }

    /// Build the `index`-th stream of the given initiator and direction
    pub fn from_parts(initiator: Side, dir: Dir, index: u64) -> Self {
        let mut id = index << 2;
        if initiator == Side::Server {
            id |= 0x1;
        }
        if dir == Dir::Uni {
            id |= 0x2;
        }
        StreamId(id)
    }

    /// Raw value
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Endpoint that opened the stream
    pub fn initiator(self) -> Side {
        if self.0 & 0x1 == 0 {
            Side::Client
        } else {
            Side::Server
        }
    }

    /// Stream direction
    pub fn dir(self) -> Dir {
        if self.0 & 0x2 == 0 {
            Dir::Bidi
        } else {
            Dir::Uni
        }
    }

    /// Sequence number among streams of the same type
    pub fn index(self) -> u64 {
        self.0 >> 2
    }
}

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamId({})", self.0)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Send half state (RFC 9000 Section 3.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    /// Created, nothing sent yet
    Ready,
    /// Sending data
    Send,
    /// FIN sent, waiting for acknowledgements
    DataSent,
    /// All data acknowledged
    DataRecvd,
    /// RESET_STREAM sent
    ResetSent,
    /// RESET_STREAM acknowledged
    ResetRecvd,
}

impl SendState {
    /// Check if the application may still write
    pub fn can_write(&self) -> bool {
        matches!(self, SendState::Ready | SendState::Send)
    }

    /// Check if the half reached a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, SendState::DataRecvd | SendState::ResetRecvd)
    }
}

/// Receive half state (RFC 9000 Section 3.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvState {
    /// Receiving data
    Recv,
    /// FIN received, final size known
    SizeKnown,
    /// All data up to the final size received
    DataRecvd,
    /// All data delivered to the application
    DataRead,
    /// RESET_STREAM received
    ResetRecvd,
    /// Reset delivered to the application
    ResetRead,
}

impl RecvState {
    /// Check if the half reached a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, RecvState::DataRead | RecvState::ResetRead)
    }
}

/// Out-of-order receive buffer
///
/// Segments are kept non-overlapping and keyed by offset; only the
/// contiguous prefix starting at the read offset is exposed.
#[derive(Debug, Default)]
pub struct RecvBuffer {
    segments: BTreeMap<u64, Bytes>,
    read_offset: u64,
    max_offset: u64,
    final_size: Option<u64>,
}

impl RecvBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Offset of the next byte to deliver
    pub fn read_offset(&self) -> u64 {
        self.read_offset
    }

    /// Highest offset seen
    pub fn max_offset(&self) -> u64 {
        self.max_offset
    }

    /// Final size, once known
    pub fn final_size(&self) -> Option<u64> {
        self.final_size
    }

    /// Insert data received at `offset`
    ///
    /// Duplicate and overlapping ranges are merged idempotently. Returns the
    /// increase of the highest received offset, which is what flow control
    /// charges for.
    pub fn insert(&mut self, offset: u64, data: Bytes, fin: bool) -> Result<u64> {
        let end = offset + data.len() as u64;

        if let Some(final_size) = self.final_size {
            if end > final_size || (fin && end != final_size) {
                return Err(Error::FinalSize(format!(
                    "data ends at {} but final size is {}",
                    end, final_size
                )));
            }
        }
        if fin {
            if end < self.max_offset {
                return Err(Error::FinalSize(format!(
                    "final size {} below received offset {}",
                    end, self.max_offset
                )));
            }
            self.final_size = Some(end);
        }

        let growth = end.saturating_sub(self.max_offset);
        self.max_offset = self.max_offset.max(end);

        let mut start = offset.max(self.read_offset);
        while start < end {
            // Skip over a segment that already covers `start`
            if let Some((&seg_off, seg)) = self.segments.range(..=start).next_back() {
                let seg_end = seg_off + seg.len() as u64;
                if seg_end > start {
                    start = seg_end;
                    continue;
                }
            }
            let piece_end = self
                .segments
                .range(start..)
                .next()
                .map_or(end, |(&next_off, _)| next_off.min(end));
            let from = (start - offset) as usize;
            let to = (piece_end - offset) as usize;
            self.segments.insert(start, data.slice(from..to));
            start = piece_end;
        }

        Ok(growth)
    }

    /// Number of contiguous bytes ready to read
    pub fn readable(&self) -> u64 {
        let mut next = self.read_offset;
        for (&off, seg) in self.segments.range(self.read_offset..) {
            if off != next {
                break;
            }
            next += seg.len() as u64;
        }
        next - self.read_offset
    }

    /// Read up to `max` contiguous bytes
    pub fn read(&mut self, max: usize) -> Option<Bytes> {
        let mut entry = self.segments.first_entry()?;
        if *entry.key() != self.read_offset {
            return None;
        }
        let seg = entry.get_mut();
        let chunk = if seg.len() > max {
            let chunk = seg.split_to(max);
            let rest = seg.clone();
            entry.remove();
            self.segments.insert(self.read_offset + chunk.len() as u64, rest);
            chunk
        } else {
            entry.remove()
        };
        self.read_offset += chunk.len() as u64;
        Some(chunk)
    }

    /// Whether every byte up to the final size has arrived
    pub fn is_complete(&self) -> bool {
        match self.final_size {
            Some(final_size) => self.read_offset + self.readable() == final_size,
            None => false,
        }
    }

    /// Whether every byte up to the final size has been read
    pub fn is_finished(&self) -> bool {
        self.final_size == Some(self.read_offset)
    }

    /// Drop all buffered data
    pub fn clear(&mut self) {
        self.segments.clear();
    }
}

/// Send buffer with retransmission tracking
#[derive(Debug, Default)]
pub struct SendBuffer {
    /// Data written but not yet sent
    pending: VecDeque<(u64, Bytes)>,
    /// Lost data waiting for retransmission, sent before new data
    retransmit: VecDeque<(u64, Bytes)>,
    /// Data sent and not yet acknowledged, keyed by offset
    unacked: BTreeMap<u64, Bytes>,
    write_offset: u64,
    fin: bool,
    fin_sent: bool,
    fin_acked: bool,
}

/// A chunk of stream data selected for transmission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendChunk {
    pub offset: u64,
    pub data: Bytes,
    pub fin: bool,
    /// Whether this chunk extends the highest offset sent (new data)
    pub fresh: bool,
}

impl SendBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Total bytes written by the application
    pub fn write_offset(&self) -> u64 {
        self.write_offset
    }

    /// Queue data for sending
    pub fn write(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        let len = data.len() as u64;
        self.pending.push_back((self.write_offset, data));
        self.write_offset += len;
    }

    /// Mark the end of the stream
    pub fn finish(&mut self) {
        self.fin = true;
    }

    /// Whether FIN was requested
    pub fn is_finished(&self) -> bool {
        self.fin
    }

    /// Whether there is anything to transmit
    pub fn has_pending(&self) -> bool {
        !self.retransmit.is_empty() || !self.pending.is_empty() || (self.fin && !self.fin_sent)
    }

    /// Length of the next fresh (never sent) chunk
    pub fn pending_fresh(&self) -> u64 {
        self.pending.iter().map(|(_, d)| d.len() as u64).sum()
    }

    /// Take the next chunk of at most `max_len` bytes
    ///
    /// `fresh_allowance` caps how many never-sent bytes may be taken
    /// (flow control credit); retransmissions are not limited by it.
    pub fn next_chunk(&mut self, max_len: usize, fresh_allowance: u64) -> Option<SendChunk> {
        if let Some((offset, mut data)) = self.retransmit.pop_front() {
            if data.len() > max_len {
                let rest = data.split_off(max_len);
                self.retransmit.push_front((offset + max_len as u64, rest));
            }
            let end = offset + data.len() as u64;
            let fin = self.fin && end == self.write_offset && self.pending.is_empty();
            self.unacked.insert(offset, data.clone());
            return Some(SendChunk {
                offset,
                data,
                fin,
                fresh: false,
            });
        }

        let allowance = (fresh_allowance.min(max_len as u64)) as usize;
        if let Some((offset, mut data)) = self.pending.pop_front() {
            if allowance == 0 {
                self.pending.push_front((offset, data));
                return None;
            }
            if data.len() > allowance {
                let rest = data.split_off(allowance);
                self.pending.push_front((offset + allowance as u64, rest));
            }
            let fin = self.fin && self.pending.is_empty();
            if fin {
                self.fin_sent = true;
            }
            self.unacked.insert(offset, data.clone());
            return Some(SendChunk {
                offset,
                data,
                fin,
                fresh: true,
            });
        }

        if self.fin && !self.fin_sent {
            self.fin_sent = true;
            return Some(SendChunk {
                offset: self.write_offset,
                data: Bytes::new(),
                fin: true,
                fresh: false,
            });
        }
        None
    }

    /// Acknowledge a previously sent chunk
    pub fn on_ack(&mut self, offset: u64, len: usize, fin: bool) {
        if self.unacked.get(&offset).map(|d| d.len()) == Some(len) {
            self.unacked.remove(&offset);
        }
        self.retransmit.retain(|(off, d)| !(*off == offset && d.len() == len));
        if fin {
            self.fin_acked = true;
        }
    }

    /// Requeue a lost chunk for retransmission
    pub fn on_lost(&mut self, offset: u64, len: usize, fin: bool) {
        if let Some(data) = self.unacked.remove(&offset) {
            if data.len() == len {
                self.retransmit.push_back((offset, data));
            } else {
                self.unacked.insert(offset, data);
            }
        }
        if fin && !self.fin_acked && len == 0 {
            self.fin_sent = false;
        }
    }

    /// Whether everything written, including FIN, is acknowledged
    pub fn is_fully_acked(&self) -> bool {
        self.pending.is_empty()
            && self.retransmit.is_empty()
            && self.unacked.is_empty()
            && (!self.fin || self.fin_acked)
    }

    /// Drop all buffered data
    pub fn clear(&mut self) {
        self.pending.clear();
        self.retransmit.clear();
        self.unacked.clear();
    }
}

/// Sending half of a stream
#[derive(Debug)]
pub struct SendHalf {
    pub state: SendState,
    pub buffer: SendBuffer,
    pub credit: SendCredit,
    /// Highest offset ever sent, charged against connection credit
    pub max_sent: u64,
    pub reset_code: Option<u64>,
    /// Error code from a STOP_SENDING received from the peer
    pub stop_code: Option<u64>,
}

/// Receiving half of a stream
#[derive(Debug)]
pub struct RecvHalf {
    pub state: RecvState,
    pub buffer: RecvBuffer,
    pub credit: RecvCredit,
    pub reset_code: Option<u64>,
    /// STOP_SENDING requested locally and not yet sent
    pub stop_sending: Option<u64>,
}

/// A QUIC stream
#[derive(Debug)]
pub struct QuicStream {
    id: StreamId,
    send: Option<SendHalf>,
    recv: Option<RecvHalf>,
}

impl QuicStream {
    /// Create a stream as seen from `local`
    ///
    /// Unidirectional streams only have the half matching the local role.
    pub fn new(id: StreamId, local: Side, window: FlowControlWindow) -> Self {
        let has_send = id.dir() == Dir::Bidi || id.initiator() == local;
        let has_recv = id.dir() == Dir::Bidi || id.initiator() != local;
        QuicStream {
            id,
            send: has_send.then(|| SendHalf {
                state: SendState::Ready,
                buffer: SendBuffer::new(),
                credit: window.send.clone(),
                max_sent: 0,
                reset_code: None,
                stop_code: None,
            }),
            recv: has_recv.then(|| RecvHalf {
                state: RecvState::Recv,
                buffer: RecvBuffer::new(),
                credit: window.recv,
                reset_code: None,
                stop_sending: None,
            }),
        }
    }

    /// Get stream ID
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Sending half, if this stream has one
    pub fn send_half(&self) -> Option<&SendHalf> {
        self.send.as_ref()
    }

    /// Mutable sending half
    pub fn send_half_mut(&mut self) -> Option<&mut SendHalf> {
        self.send.as_mut()
    }

    /// Receiving half, if this stream has one
    pub fn recv_half(&self) -> Option<&RecvHalf> {
        self.recv.as_ref()
    }

    /// Mutable receiving half
    pub fn recv_half_mut(&mut self) -> Option<&mut RecvHalf> {
        self.recv.as_mut()
    }

    fn send_mut(&mut self) -> Result<&mut SendHalf> {
        let id = self.id;
        self.send
            .as_mut()
            .ok_or_else(|| Error::StreamState(format!("stream {} has no send side", id)))
    }

    fn recv_mut(&mut self) -> Result<&mut RecvHalf> {
        let id = self.id;
        self.recv
            .as_mut()
            .ok_or_else(|| Error::StreamState(format!("stream {} has no receive side", id)))
    }

    /// Queue application data
    pub fn write(&mut self, data: Bytes) -> Result<()> {
        let id = self.id;
        let send = self.send_mut()?;
        if let Some(code) = send.stop_code {
            return Err(Error::StreamStopped {
                stream: id.as_u64(),
                code,
            });
        }
        if !send.state.can_write() || send.buffer.is_finished() {
            return Err(Error::StreamState(format!("stream {} closed for writing", id)));
        }
        send.buffer.write(data);
        send.state = SendState::Send;
        Ok(())
    }

    /// Close the send side; no further data may be written
    pub fn finish(&mut self) -> Result<()> {
        let id = self.id;
        let send = self.send_mut()?;
        if !send.state.can_write() {
            return Err(Error::StreamState(format!("stream {} already closed", id)));
        }
        send.buffer.finish();
        send.state = SendState::Send;
        Ok(())
    }

    /// Abruptly terminate the send side
    ///
    /// Returns the final size to put in RESET_STREAM, or `None` when the
    /// stream is already in a terminal or reset state.
    pub fn reset(&mut self, code: u64) -> Result<Option<u64>> {
        let send = self.send_mut()?;
        if matches!(
            send.state,
            SendState::DataRecvd | SendState::ResetSent | SendState::ResetRecvd
        ) {
            return Ok(None);
        }
        send.state = SendState::ResetSent;
        send.reset_code = Some(code);
        send.buffer.clear();
        Ok(Some(send.max_sent))
    }

    /// Handle an incoming STREAM frame
    ///
    /// Returns the growth of the highest received offset.
    pub fn on_stream_frame(&mut self, offset: u64, data: Bytes, fin: bool) -> Result<u64> {
        let recv = self.recv_mut()?;
        if matches!(recv.state, RecvState::ResetRecvd | RecvState::ResetRead) {
            return Ok(0);
        }
        let end = offset + data.len() as u64;
        if end > recv.credit.limit() {
            return Err(Error::FlowControl(format!(
                "stream data ends at {} beyond limit {}",
                end,
                recv.credit.limit()
            )));
        }

        let growth = recv.buffer.insert(offset, data, fin)?;
        recv.credit.record_received(growth)?;

        if recv.state == RecvState::Recv && recv.buffer.final_size().is_some() {
            recv.state = RecvState::SizeKnown;
        }
        if recv.state == RecvState::SizeKnown && recv.buffer.is_complete() {
            recv.state = RecvState::DataRecvd;
        }
        Ok(growth)
    }

    /// Handle RESET_STREAM from the peer
    ///
    /// Returns the flow control growth implied by the final size.
    pub fn on_reset(&mut self, code: u64, final_size: u64) -> Result<u64> {
        let id = self.id;
        let recv = self.recv_mut()?;
        if let Some(known) = recv.buffer.final_size() {
            if known != final_size {
                return Err(Error::FinalSize(format!(
                    "reset final size {} differs from {}",
                    final_size, known
                )));
            }
        }
        if final_size < recv.buffer.max_offset() {
            return Err(Error::FinalSize(format!(
                "reset final size {} below received offset {}",
                final_size,
                recv.buffer.max_offset()
            )));
        }
        if matches!(
            recv.state,
            RecvState::DataRead | RecvState::ResetRecvd | RecvState::ResetRead
        ) {
            return Ok(0);
        }
        let growth = final_size - recv.buffer.max_offset();
        recv.credit.record_received(growth)?;
        recv.state = RecvState::ResetRecvd;
        recv.reset_code = Some(code);
        recv.buffer.clear();
        debug!(stream = %id, code, "stream reset by peer");
        Ok(growth)
    }

    /// Handle STOP_SENDING from the peer
    pub fn on_stop_sending(&mut self, code: u64) -> Result<()> {
        let send = self.send_mut()?;
        send.stop_code = Some(code);
        Ok(())
    }

    /// Read contiguous data
    ///
    /// Returns `Ok(None)` when nothing is available yet, and an empty chunk
    /// with `fin = true` once all data has been read.
    pub fn read(&mut self, max: usize) -> Result<Option<(Bytes, bool)>> {
        let id = self.id;
        let recv = self.recv_mut()?;
        if let Some(code) = recv.reset_code {
            recv.state = RecvState::ResetRead;
            return Err(Error::StreamReset {
                stream: id.as_u64(),
                code,
            });
        }
        match recv.buffer.read(max) {
            Some(chunk) => {
                recv.credit.record_consumed(chunk.len() as u64);
                let fin = recv.buffer.is_finished();
                if fin {
                    recv.state = RecvState::DataRead;
                }
                Ok(Some((chunk, fin)))
            }
            None if recv.buffer.is_finished() => {
                recv.state = RecvState::DataRead;
                Ok(Some((Bytes::new(), true)))
            }
            None => Ok(None),
        }
    }

    /// Request that the peer stop sending
    pub fn stop_sending(&mut self, code: u64) -> Result<()> {
        let recv = self.recv_mut()?;
        if recv.state == RecvState::Recv || recv.state == RecvState::SizeKnown {
            recv.stop_sending = Some(code);
        }
        Ok(())
    }

    /// Bookkeeping after the peer acknowledged stream data
    pub fn on_data_acked(&mut self, offset: u64, len: usize, fin: bool) {
        if let Some(send) = self.send.as_mut() {
            send.buffer.on_ack(offset, len, fin);
            if fin && send.state == SendState::Send {
                send.state = SendState::DataSent;
            }
            if send.buffer.is_finished() && send.buffer.is_fully_acked() && send.state != SendState::ResetSent {
                send.state = SendState::DataRecvd;
            }
        }
    }

    /// Bookkeeping after RESET_STREAM was acknowledged
    pub fn on_reset_acked(&mut self) {
        if let Some(send) = self.send.as_mut() {
            if send.state == SendState::ResetSent {
                send.state = SendState::ResetRecvd;
            }
        }
    }

    /// Whether both halves are terminal and the stream can be dropped
    pub fn is_closed(&self) -> bool {
        self.send.as_ref().map_or(true, |s| s.state.is_terminal())
            && self.recv.as_ref().map_or(true, |r| r.state.is_terminal())
    }
}

/// Stream limits negotiated for one direction
#[derive(Debug, Clone, Copy)]
struct StreamLimits {
    /// Streams we may open (peer's MAX_STREAMS)
    local_max: u64,
    /// Streams we opened
    local_opened: u64,
    /// Streams the peer may open (our MAX_STREAMS)
    remote_max: u64,
    /// Highest peer stream index opened + 1
    remote_opened: u64,
    /// Peer streams fully closed, used to extend `remote_max`
    remote_closed: u64,
    /// Initial remote limit (window for MAX_STREAMS credit)
    remote_window: u64,
}

/// Per-stream window parameters
#[derive(Debug, Clone, Copy)]
pub struct StreamWindows {
    /// Our receive window for locally initiated bidi streams
    pub local_bidi_local: u64,
    /// Our receive window for peer-initiated bidi streams
    pub local_bidi_remote: u64,
    /// Our receive window for peer-initiated uni streams
    pub local_uni: u64,
    /// Peer's limit for streams we opened (bidi)
    pub peer_bidi_remote: u64,
    /// Peer's limit for streams it opened (bidi)
    pub peer_bidi_local: u64,
    /// Peer's limit for uni streams we opened
    pub peer_uni: u64,
}

/// Stream manager owning every stream of a connection
#[derive(Debug)]
pub struct StreamManager {
    side: Side,
    streams: HashMap<StreamId, QuicStream>,
    bidi: StreamLimits,
    uni: StreamLimits,
    windows: StreamWindows,
    config: FlowControlConfig,
    /// Peer-opened streams not yet returned by `accept`
    incoming: VecDeque<StreamId>,
    /// MAX_STREAMS updates waiting to be sent (bidi, uni)
    pending_max_streams: [bool; 2],
}

impl StreamManager {
    /// Create a new stream manager
    pub fn new(
        side: Side,
        local_max_bidi: u64,
        local_max_uni: u64,
        windows: StreamWindows,
        config: FlowControlConfig,
    ) -> Self {
        let limits = |remote_max| StreamLimits {
            local_max: 0,
            local_opened: 0,
            remote_max,
            remote_opened: 0,
            remote_closed: 0,
            remote_window: remote_max,
        };
        StreamManager {
            side,
            streams: HashMap::new(),
            bidi: limits(local_max_bidi),
            uni: limits(local_max_uni),
            windows,
            config,
            incoming: VecDeque::new(),
            pending_max_streams: [false, false],
        }
    }

    /// Apply the peer's transport parameters
    pub fn set_peer_limits(&mut self, max_bidi: u64, max_uni: u64, windows: StreamWindows) {
        self.bidi.local_max = self.bidi.local_max.max(max_bidi);
        self.uni.local_max = self.uni.local_max.max(max_uni);
        self.windows.peer_bidi_remote = windows.peer_bidi_remote;
        self.windows.peer_bidi_local = windows.peer_bidi_local;
        self.windows.peer_uni = windows.peer_uni;
        for stream in self.streams.values_mut() {
            let limit = match (stream.id.dir(), stream.id.initiator() == self.side) {
                (Dir::Bidi, true) => windows.peer_bidi_remote,
                (Dir::Bidi, false) => windows.peer_bidi_local,
                (Dir::Uni, _) => windows.peer_uni,
            };
            if let Some(send) = stream.send.as_mut() {
                send.credit.record_limit_update(limit);
            }
        }
    }

    fn limits_mut(&mut self, dir: Dir) -> &mut StreamLimits {
        match dir {
            Dir::Bidi => &mut self.bidi,
            Dir::Uni => &mut self.uni,
        }
    }

    fn window_for(&self, id: StreamId) -> FlowControlWindow {
        let local = id.initiator() == self.side;
        let (peer_limit, local_window) = match (id.dir(), local) {
            (Dir::Bidi, true) => (self.windows.peer_bidi_remote, self.windows.local_bidi_local),
            (Dir::Bidi, false) => (self.windows.peer_bidi_local, self.windows.local_bidi_remote),
            (Dir::Uni, true) => (self.windows.peer_uni, 0),
            (Dir::Uni, false) => (0, self.windows.local_uni),
        };
        FlowControlWindow::new(peer_limit, local_window, &self.config)
    }

    /// Open a new locally initiated stream
    pub fn open(&mut self, dir: Dir) -> Result<StreamId> {
        let side = self.side;
        let limits = self.limits_mut(dir);
        if limits.local_opened >= limits.local_max {
            return Err(Error::StreamLimit(format!(
                "{:?} stream limit {} reached",
                dir, limits.local_max
            )));
        }
        let id = StreamId::from_parts(side, dir, limits.local_opened);
        limits.local_opened += 1;
        let window = self.window_for(id);
        self.streams.insert(id, QuicStream::new(id, side, window));
        trace!(stream = %id, "opened stream");
        Ok(id)
    }

    /// Limit on streams we may open in `dir`
    pub fn local_limit(&self, dir: Dir) -> u64 {
        match dir {
            Dir::Bidi => self.bidi.local_max,
            Dir::Uni => self.uni.local_max,
        }
    }

    /// Number of streams we opened in `dir`
    pub fn local_opened(&self, dir: Dir) -> u64 {
        match dir {
            Dir::Bidi => self.bidi.local_opened,
            Dir::Uni => self.uni.local_opened,
        }
    }

    /// Apply MAX_STREAMS from the peer; stale values are ignored
    pub fn on_max_streams(&mut self, dir: Dir, max: u64) {
        let limits = self.limits_mut(dir);
        if max > limits.local_max {
            limits.local_max = max;
        }
    }

    /// Look up a stream referenced by an incoming frame
    ///
    /// Peer-initiated streams are created lazily, together with every
    /// lower-numbered stream of the same type. Returns `Ok(None)` for
    /// streams that were already closed and reaped.
    pub fn get_or_create_remote(&mut self, id: StreamId) -> Result<Option<&mut QuicStream>> {
        if id.initiator() == self.side {
            let opened = self.local_opened(id.dir());
            if id.index() >= opened {
                return Err(Error::StreamState(format!("stream {} not opened locally", id)));
            }
            return Ok(self.streams.get_mut(&id));
        }

        let side = self.side;
        let limits = *match id.dir() {
            Dir::Bidi => &self.bidi,
            Dir::Uni => &self.uni,
        };
        if id.index() >= limits.remote_max {
            return Err(Error::StreamLimit(format!(
                "peer opened stream {} beyond limit {}",
                id, limits.remote_max
            )));
        }
        if id.index() >= limits.remote_opened {
            for index in limits.remote_opened..=id.index() {
                let new_id = StreamId::from_parts(side.peer(), id.dir(), index);
                let window = self.window_for(new_id);
                self.streams.insert(new_id, QuicStream::new(new_id, side, window));
                self.incoming.push_back(new_id);
            }
            self.limits_mut(id.dir()).remote_opened = id.index() + 1;
        }
        Ok(self.streams.get_mut(&id))
    }

    /// Get a stream
    pub fn get(&self, id: StreamId) -> Option<&QuicStream> {
        self.streams.get(&id)
    }

    /// Get a mutable stream
    pub fn get_mut(&mut self, id: StreamId) -> Option<&mut QuicStream> {
        self.streams.get_mut(&id)
    }

    /// Next peer-initiated stream not yet accepted
    pub fn accept(&mut self) -> Option<StreamId> {
        self.incoming.pop_front()
    }

    /// Iterate over all streams
    pub fn iter(&self) -> impl Iterator<Item = (&StreamId, &QuicStream)> {
        self.streams.iter()
    }

    /// Iterate mutably over all streams
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&StreamId, &mut QuicStream)> {
        self.streams.iter_mut()
    }

    /// Number of live streams
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    /// Whether there are no live streams
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Remove streams whose halves are all terminal
    ///
    /// Closing peer streams extends the peer's stream credit.
    pub fn cleanup_closed_streams(&mut self) -> Vec<StreamId> {
        let closed: Vec<StreamId> = self
            .streams
            .iter()
            .filter(|(_, s)| s.is_closed())
            .map(|(id, _)| *id)
            .collect();
        for id in &closed {
            self.streams.remove(id);
            if id.initiator() != self.side {
                let slot = match id.dir() {
                    Dir::Bidi => 0,
                    Dir::Uni => 1,
                };
                let limits = self.limits_mut(id.dir());
                limits.remote_closed += 1;
                if limits.remote_closed + limits.remote_window > limits.remote_max
                    && limits.remote_closed * 2 >= limits.remote_window.max(1)
                {
                    limits.remote_max = limits.remote_closed + limits.remote_window;
                    self.pending_max_streams[slot] = true;
                }
            }
        }
        closed
    }

    /// MAX_STREAMS values to send, as (bidi, limit) pairs
    pub fn take_max_streams_updates(&mut self) -> Vec<(bool, u64)> {
        let mut updates = Vec::new();
        if std::mem::take(&mut self.pending_max_streams[0]) {
            updates.push((true, self.bidi.remote_max));
        }
        if std::mem::take(&mut self.pending_max_streams[1]) {
            updates.push((false, self.uni.remote_max));
        }
        updates
    }

    /// Release every stream buffer
    pub fn clear(&mut self) {
        self.streams.clear();
        self.incoming.clear();
    }
}
