//! HTTP/3 connection
//!
//! [`H3Connection`] layers HTTP/3 (RFC 9114) over a QUIC [`Connection`].
//! It owns the transport connection: the caller keeps feeding datagrams
//! and timers through [`connection_mut`](H3Connection::connection_mut),
//! then calls [`process`](H3Connection::process) to turn transport events
//! into [`H3Event`]s.
//!
//! Once the handshake allows it each side opens three unidirectional
//! streams: control (SETTINGS first), QPACK encoder and QPACK decoder.
//! Requests and responses travel on client-initiated bidirectional
//! streams as one HEADERS frame, DATA frames and an optional trailing
//! HEADERS frame.

use super::error::{Error, H3ErrorCode, Result};
use super::frames::{FrameReader, H3Frame};
use super::qpack::{Decoder, Encoder, HeaderField};
use super::settings::Settings;
use super::{STREAM_TYPE_CONTROL, STREAM_TYPE_DECODER, STREAM_TYPE_ENCODER, STREAM_TYPE_PUSH};
use crate::quic::{self, varint, Connection, Dir, EarlyDataStatus, Event, Side, StreamId};
use bytes::{Buf, Bytes};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Instant;
use tracing::{debug, trace, warn};

/// Largest chunk pulled from a stream per read
const READ_CHUNK: usize = 16 * 1024;

/// HTTP/3 connection configuration
#[derive(Debug, Clone)]
pub struct H3Config {
    /// Settings we advertise
    pub settings: Settings,
    /// Dynamic table capacity our encoder uses when the peer allows it
    pub encoder_table_capacity: usize,
    /// Largest payload of one DATA frame when splitting bodies
    pub max_data_frame: usize,
}

impl Default for H3Config {
    fn default() -> Self {
        H3Config {
            settings: Settings::default(),
            encoder_table_capacity: 0,
            max_data_frame: 16 * 1024,
        }
    }
}

/// Events produced by [`H3Connection::process`]
#[derive(Debug)]
pub enum H3Event {
    /// Peer SETTINGS received and applied
    Settings(Settings),
    /// A header section arrived; `trailers` marks the one after the body
    Headers {
        stream: StreamId,
        headers: Vec<HeaderField>,
        trailers: bool,
    },
    /// Body bytes from a DATA frame
    Data { stream: StreamId, data: Bytes },
    /// Peer finished its side of the stream
    Finished(StreamId),
    /// Peer reset its side of the stream
    Reset { stream: StreamId, code: u64 },
    /// Peer asked us to stop sending on the stream
    Stopped { stream: StreamId, code: u64 },
    /// Peer will not process streams at or above this ID
    GoAway(u64),
    /// Transport event this layer does not consume
    Transport(Event),
}

/// Kind of a peer-initiated unidirectional stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UniKind {
    Control,
    Encoder,
    Decoder,
    /// Unknown or reserved type, read and dropped
    Ignored,
}

/// State of one request stream
#[derive(Debug, Default)]
struct RequestState {
    reader: FrameReader,
    headers_received: bool,
    trailers_received: bool,
    /// Header block waiting on QPACK inserts
    blocked: Option<Bytes>,
    fin_received: bool,
    finished: bool,
    headers_sent: bool,
    local_done: bool,
}

/// Bytes waiting for stream credit
#[derive(Debug, Default)]
struct OutQueue {
    data: VecDeque<Bytes>,
    fin: bool,
}

/// HTTP/3 connection
pub struct H3Connection {
    conn: Connection,
    config: H3Config,
    peer_settings: Option<Settings>,
    started: bool,
    control: Option<StreamId>,
    encoder_stream: Option<StreamId>,
    decoder_stream: Option<StreamId>,
    peer_uni: HashMap<StreamId, UniKind>,
    /// Peer uni streams whose type has not fully arrived
    pending_uni: HashMap<StreamId, Vec<u8>>,
    control_reader: FrameReader,
    requests: HashMap<StreamId, RequestState>,
    rejected: HashSet<StreamId>,
    outgoing: HashMap<StreamId, OutQueue>,
    encoder: Encoder,
    decoder: Decoder,
    events: VecDeque<H3Event>,
    next_request: u64,
    last_peer_request: Option<u64>,
    goaway_sent: Option<u64>,
    goaway_received: Option<u64>,
}

impl H3Connection {
    /// Wrap a QUIC connection
    pub fn new(conn: Connection, config: H3Config) -> Result<Self> {
        config.settings.validate()?;
        let mut decoder = Decoder::new(
            config.settings.get_qpack_max_table_capacity(),
            config.settings.get_qpack_blocked_streams(),
        );
        decoder.set_max_field_section_size(config.settings.get_max_field_section_size());
        let encoder = if config.encoder_table_capacity > 0 {
            Encoder::with_dynamic_table(config.encoder_table_capacity)
        } else {
            Encoder::new()
        };

        let mut h3 = H3Connection {
            conn,
            config,
            peer_settings: None,
            started: false,
            control: None,
            encoder_stream: None,
            decoder_stream: None,
            peer_uni: HashMap::new(),
            pending_uni: HashMap::new(),
            control_reader: FrameReader::new(),
            requests: HashMap::new(),
            rejected: HashSet::new(),
            outgoing: HashMap::new(),
            encoder,
            decoder,
            events: VecDeque::new(),
            next_request: 0,
            last_peer_request: None,
            goaway_sent: None,
            goaway_received: None,
        };
        h3.maybe_start()?;
        Ok(h3)
    }

    /// The transport connection
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// The transport connection, for feeding datagrams and timers
    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Settings we advertise
    pub fn local_settings(&self) -> &Settings {
        &self.config.settings
    }

    /// Settings the peer advertised, once received
    pub fn peer_settings(&self) -> Option<&Settings> {
        self.peer_settings.as_ref()
    }

    /// ID from the last GOAWAY we received
    pub fn goaway_received(&self) -> Option<u64> {
        self.goaway_received
    }

    /// ID from the last GOAWAY we sent
    pub fn goaway_sent(&self) -> Option<u64> {
        self.goaway_sent
    }

    /// Our control stream, once opened
    pub fn control_stream(&self) -> Option<StreamId> {
        self.control
    }

    /// Next pending event
    pub fn poll_event(&mut self) -> Option<H3Event> {
        self.events.pop_front()
    }

    fn side(&self) -> Side {
        self.conn.side()
    }

    /// Open our control and QPACK streams once the transport allows
    fn maybe_start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        let early = self.side().is_client() && self.conn.early_data_status() == EarlyDataStatus::Pending;
        if !self.conn.is_handshake_complete() && !early {
            return Ok(());
        }
        self.started = true;

        let control = self.conn.open_stream(Dir::Uni)?;
        let mut preface = Vec::new();
        varint::put_varint(&mut preface, STREAM_TYPE_CONTROL)?;
        H3Frame::Settings(self.config.settings.clone()).encode(&mut preface)?;
        self.control = Some(control);
        self.write(control, Bytes::from(preface))?;

        let encoder = self.conn.open_stream(Dir::Uni)?;
        self.encoder_stream = Some(encoder);
        self.write(encoder, stream_type(STREAM_TYPE_ENCODER)?)?;

        let decoder = self.conn.open_stream(Dir::Uni)?;
        self.decoder_stream = Some(decoder);
        self.write(decoder, stream_type(STREAM_TYPE_DECODER)?)?;

        debug!(%control, %encoder, %decoder, "HTTP/3 streams opened");
        Ok(())
    }

    // ----- sending -----

    /// Send a request and return its stream
    ///
    /// The pseudo-headers are built from the arguments; `headers` follow
    /// them in order.
    pub fn send_request(
        &mut self,
        method: &str,
        scheme: &str,
        authority: &str,
        path: &str,
        headers: &[HeaderField],
    ) -> Result<StreamId> {
        if !self.side().is_client() {
            return Err(Error::StreamCreation("servers do not send requests".to_string()));
        }
        if let Some(limit) = self.goaway_received {
            if self.next_request >= limit {
                return Err(Error::GoingAway);
            }
        }
        self.maybe_start()?;
        if !self.started {
            return Err(Error::Internal("handshake not complete".to_string()));
        }

        let id = self.conn.open_stream(Dir::Bidi)?;
        self.next_request = id.as_u64() + 4;
        self.requests.insert(id, RequestState::default());

        let fields = request_fields(method, scheme, authority, path, headers);
        self.send_field_section(id, &fields)?;
        trace!(stream = %id, method, path, "request sent");
        Ok(id)
    }

    /// Send the response header section on a request stream
    pub fn send_response(&mut self, stream: StreamId, status: u16, headers: &[HeaderField]) -> Result<()> {
        if self.side().is_client() {
            return Err(Error::Message("clients do not send responses".to_string()));
        }
        self.send_field_section(stream, &response_fields(status, headers))
    }

    /// Send trailers after the body
    pub fn send_trailers(&mut self, stream: StreamId, headers: &[HeaderField]) -> Result<()> {
        let state = self.requests.get(&stream).ok_or(Error::StreamNotFound(stream.as_u64()))?;
        if !state.headers_sent {
            return Err(Error::Message("trailers before headers".to_string()));
        }
        self.send_field_section(stream, headers)?;
        self.finish(stream)
    }

    fn send_field_section(&mut self, stream: StreamId, fields: &[HeaderField]) -> Result<()> {
        let state = self.requests.get(&stream).ok_or(Error::StreamNotFound(stream.as_u64()))?;
        if state.local_done {
            return Err(Error::Message(format!("stream {} already finished", stream)));
        }
        if let Some(max) = self.peer_settings.as_ref().and_then(Settings::get_max_field_section_size) {
            let size: u64 = fields.iter().map(|f| f.size() as u64).sum();
            if size > max {
                return Err(Error::Message(format!(
                    "field section of {} bytes exceeds peer limit {}",
                    size, max
                )));
            }
        }

        let block = self.encoder.encode(stream.as_u64(), fields)?;
        // Inserts first so the peer is less likely to block
        self.flush_qpack()?;
        self.write(stream, H3Frame::Headers(block).to_bytes()?)?;
        if let Some(state) = self.requests.get_mut(&stream) {
            state.headers_sent = true;
        }
        Ok(())
    }

    /// Send body bytes, split into DATA frames
    pub fn send_body(&mut self, stream: StreamId, data: &[u8]) -> Result<()> {
        let state = self.requests.get(&stream).ok_or(Error::StreamNotFound(stream.as_u64()))?;
        if !state.headers_sent {
            return Err(Error::Message("DATA before HEADERS".to_string()));
        }
        if state.local_done {
            return Err(Error::Message(format!("stream {} already finished", stream)));
        }
        let max = self.config.max_data_frame.max(1);
        for chunk in data.chunks(max) {
            let frame = H3Frame::Data(Bytes::copy_from_slice(chunk)).to_bytes()?;
            self.write(stream, frame)?;
        }
        Ok(())
    }

    /// Close our side of a request stream
    pub fn finish(&mut self, stream: StreamId) -> Result<()> {
        let state = self
            .requests
            .get_mut(&stream)
            .ok_or(Error::StreamNotFound(stream.as_u64()))?;
        state.local_done = true;
        self.outgoing.entry(stream).or_default().fin = true;
        self.flush_stream(stream)?;
        self.forget_if_done(stream);
        Ok(())
    }

    /// Abandon a request stream in both directions
    pub fn cancel(&mut self, stream: StreamId, code: H3ErrorCode) -> Result<()> {
        self.requests.remove(&stream);
        self.outgoing.remove(&stream);
        self.decoder.cancel_stream(stream.as_u64());
        self.conn.reset_stream(stream, code.as_u64())?;
        self.conn.stop_sending(stream, code.as_u64())?;
        Ok(())
    }

    /// Announce a graceful shutdown
    ///
    /// A server names the first request stream it will not process; a
    /// client sends push ID 0 since it never allows pushes. The ID never
    /// grows across repeated calls.
    pub fn send_goaway(&mut self) -> Result<u64> {
        let control = self
            .control
            .ok_or_else(|| Error::Internal("control stream not open".to_string()))?;
        let mut id = if self.side().is_client() {
            0
        } else {
            self.last_peer_request.map_or(0, |last| last + 4)
        };
        if let Some(previous) = self.goaway_sent {
            id = id.min(previous);
        }
        self.goaway_sent = Some(id);
        self.write(control, H3Frame::GoAway(id).to_bytes()?)?;
        debug!(id, "GOAWAY sent");
        Ok(id)
    }

    /// Close the connection with an HTTP/3 error code
    pub fn close(&mut self, now: Instant, code: H3ErrorCode, reason: &str) {
        self.conn.close(now, code.as_u64(), reason);
    }

    fn write(&mut self, stream: StreamId, data: Bytes) -> Result<()> {
        self.outgoing.entry(stream).or_default().data.push_back(data);
        self.flush_stream(stream)
    }

    fn flush_stream(&mut self, stream: StreamId) -> Result<()> {
        let Some(queue) = self.outgoing.get_mut(&stream) else {
            return Ok(());
        };
        while let Some(front) = queue.data.front_mut() {
            match self.conn.stream_send(stream, front) {
                Ok(n) if n == front.len() => {
                    queue.data.pop_front();
                }
                Ok(n) => {
                    front.advance(n);
                    return Ok(());
                }
                Err(quic::Error::Blocked) => return Ok(()),
                Err(err) => return Err(err.into()),
            }
        }
        if queue.fin {
            self.conn.stream_finish(stream)?;
        }
        self.outgoing.remove(&stream);
        Ok(())
    }

    fn flush_all(&mut self) -> Result<()> {
        let mut streams: Vec<StreamId> = self.outgoing.keys().copied().collect();
        streams.sort();
        for stream in streams {
            self.flush_stream(stream)?;
        }
        Ok(())
    }

    fn flush_qpack(&mut self) -> Result<()> {
        if let Some(stream) = self.encoder_stream {
            if let Some(data) = self.encoder.take_instructions() {
                self.write(stream, data)?;
            }
        }
        if let Some(stream) = self.decoder_stream {
            if let Some(data) = self.decoder.take_instructions() {
                self.write(stream, data)?;
            }
        }
        Ok(())
    }

    fn forget_if_done(&mut self, stream: StreamId) {
        let done = self
            .requests
            .get(&stream)
            .map_or(false, |s| s.local_done && s.finished);
        if done {
            self.requests.remove(&stream);
        }
    }

    // ----- receiving -----

    /// Consume pending transport events
    ///
    /// A protocol error closes the connection with the matching HTTP/3
    /// code and is returned.
    pub fn process(&mut self, now: Instant) -> Result<()> {
        match self.process_events() {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(error = %err, code = %err.code(), "closing HTTP/3 connection");
                self.conn.close(now, err.code().as_u64(), &err.to_string());
                Err(err)
            }
        }
    }

    fn process_events(&mut self) -> Result<()> {
        self.maybe_start()?;
        while let Some(event) = self.conn.poll_event() {
            match event {
                Event::StreamOpened(id) | Event::StreamReadable(id) => self.on_readable(id)?,
                Event::StreamReset { id, code } => self.on_stream_reset(id, code)?,
                Event::StreamStopped { id, code } => self.on_stream_stopped(id, code)?,
                Event::HandshakeCompleted => {
                    self.maybe_start()?;
                    self.events.push_back(H3Event::Transport(Event::HandshakeCompleted));
                }
                other => self.events.push_back(H3Event::Transport(other)),
            }
        }
        self.flush_qpack()?;
        self.flush_all()
    }

    /// Read from a stream, treating a vanished or reset stream as empty
    fn recv(&mut self, stream: StreamId) -> Result<Option<(Bytes, bool)>> {
        match self.conn.stream_recv(stream, READ_CHUNK) {
            Ok(chunk) => Ok(chunk),
            Err(quic::Error::StreamNotFound(_)) | Err(quic::Error::StreamReset { .. }) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn on_readable(&mut self, stream: StreamId) -> Result<()> {
        match stream.dir() {
            Dir::Uni if stream.initiator() == self.side() => Ok(()),
            Dir::Uni => self.read_uni(stream),
            Dir::Bidi => self.read_request(stream),
        }
    }

    fn read_uni(&mut self, stream: StreamId) -> Result<()> {
        while let Some((mut data, fin)) = self.recv(stream)? {
            if !self.peer_uni.contains_key(&stream) {
                let pending = self.pending_uni.entry(stream).or_default();
                pending.extend_from_slice(&data);
                match varint::decode(pending) {
                    Ok((stream_type, used)) => {
                        data = Bytes::copy_from_slice(&pending[used..]);
                        self.pending_uni.remove(&stream);
                        self.register_uni(stream, stream_type)?;
                    }
                    Err(_) => {
                        if fin {
                            self.pending_uni.remove(&stream);
                            return Ok(());
                        }
                        continue;
                    }
                }
            }
            let kind = self.peer_uni.get(&stream).copied().unwrap_or(UniKind::Ignored);
            self.on_uni_data(stream, kind, &data, fin)?;
            if fin {
                break;
            }
        }
        Ok(())
    }

    fn register_uni(&mut self, stream: StreamId, stream_type: u64) -> Result<()> {
        let kind = match stream_type {
            STREAM_TYPE_CONTROL => UniKind::Control,
            STREAM_TYPE_ENCODER => UniKind::Encoder,
            STREAM_TYPE_DECODER => UniKind::Decoder,
            STREAM_TYPE_PUSH if self.side().is_client() => {
                return Err(Error::Id("push stream without MAX_PUSH_ID".to_string()));
            }
            STREAM_TYPE_PUSH => {
                return Err(Error::StreamCreation("client opened a push stream".to_string()));
            }
            other => {
                trace!(%stream, stream_type = other, "ignoring unknown stream type");
                if let Err(err) = self.conn.stop_sending(stream, H3ErrorCode::StreamCreationError.as_u64()) {
                    debug!(%stream, error = %err, "stop_sending on unknown stream failed");
                }
                UniKind::Ignored
            }
        };
        if kind != UniKind::Ignored && self.peer_uni.values().any(|k| *k == kind) {
            return Err(Error::StreamCreation(format!("second {:?} stream", kind)));
        }
        debug!(%stream, ?kind, "peer stream registered");
        self.peer_uni.insert(stream, kind);
        Ok(())
    }

    fn on_uni_data(&mut self, stream: StreamId, kind: UniKind, data: &[u8], fin: bool) -> Result<()> {
        match kind {
            UniKind::Control => {
                self.control_reader.push(data);
                while let Some(frame) = self.control_reader.next_frame()? {
                    self.on_control_frame(frame)?;
                }
            }
            UniKind::Encoder => {
                self.decoder.on_encoder_instructions(data)?;
                self.retry_blocked()?;
            }
            UniKind::Decoder => self.encoder.on_decoder_instructions(data)?,
            UniKind::Ignored => return Ok(()),
        }
        if fin {
            return Err(Error::ClosedCriticalStream(format!("{:?} stream {} finished", kind, stream)));
        }
        Ok(())
    }

    fn on_control_frame(&mut self, frame: H3Frame) -> Result<()> {
        if self.peer_settings.is_none() {
            return match frame {
                H3Frame::Settings(settings) => self.apply_peer_settings(settings),
                _ => Err(Error::MissingSettings),
            };
        }
        match frame {
            H3Frame::GoAway(id) => self.on_goaway(id),
            H3Frame::MaxPushId(_) if self.side().is_client() => {
                Err(Error::FrameUnexpected("MAX_PUSH_ID from server".to_string()))
            }
            H3Frame::MaxPushId(_) | H3Frame::CancelPush(_) | H3Frame::Unknown { .. } => Ok(()),
            other => Err(Error::FrameUnexpected(format!("{} on control stream", other.name()))),
        }
    }

    fn apply_peer_settings(&mut self, settings: Settings) -> Result<()> {
        debug!(?settings, "peer SETTINGS");
        self.encoder.apply_peer_settings(
            settings.get_qpack_max_table_capacity(),
            settings.get_qpack_blocked_streams(),
        )?;
        self.peer_settings = Some(settings.clone());
        self.events.push_back(H3Event::Settings(settings));
        Ok(())
    }

    fn on_goaway(&mut self, id: u64) -> Result<()> {
        // Sent by a server it names a request stream; by a client, a push ID
        let target = StreamId::new(id);
        if self.side().is_client() && (target.dir() != Dir::Bidi || target.initiator() != Side::Client) {
            return Err(Error::Id(format!("GOAWAY with non-request stream {}", id)));
        }
        if let Some(previous) = self.goaway_received {
            if id > previous {
                return Err(Error::Id(format!("GOAWAY grew from {} to {}", previous, id)));
            }
        }
        debug!(id, "GOAWAY received");
        self.goaway_received = Some(id);
        self.events.push_back(H3Event::GoAway(id));
        Ok(())
    }

    fn read_request(&mut self, stream: StreamId) -> Result<()> {
        if self.rejected.contains(&stream) {
            while let Some((_, fin)) = self.recv(stream)? {
                if fin {
                    break;
                }
            }
            return Ok(());
        }
        if !self.requests.contains_key(&stream) {
            if stream.initiator() == self.side() {
                return Ok(());
            }
            if self.side().is_client() {
                return Err(Error::StreamCreation(format!("server opened bidirectional stream {}", stream)));
            }
            if self.goaway_sent.map_or(false, |limit| stream.as_u64() >= limit) {
                return self.reject(stream);
            }
            self.last_peer_request = Some(self.last_peer_request.map_or(stream.as_u64(), |l| l.max(stream.as_u64())));
            self.requests.insert(stream, RequestState::default());
        }

        while let Some((data, fin)) = self.recv(stream)? {
            let Some(state) = self.requests.get_mut(&stream) else {
                break;
            };
            state.reader.push(&data);
            if fin {
                state.fin_received = true;
                break;
            }
        }
        self.drain_request(stream)
    }

    fn reject(&mut self, stream: StreamId) -> Result<()> {
        debug!(%stream, "rejecting request after GOAWAY");
        let code = H3ErrorCode::RequestRejected.as_u64();
        if let Err(err) = self.conn.stop_sending(stream, code) {
            debug!(%stream, error = %err, "stop_sending failed");
        }
        if let Err(err) = self.conn.reset_stream(stream, code) {
            debug!(%stream, error = %err, "reset_stream failed");
        }
        self.rejected.insert(stream);
        Ok(())
    }

    fn drain_request(&mut self, stream: StreamId) -> Result<()> {
        loop {
            let Some(state) = self.requests.get_mut(&stream) else {
                return Ok(());
            };
            if state.blocked.is_some() {
                return Ok(());
            }
            let next = state.reader.next_frame()?;
            match next {
                Some(frame) => self.on_request_frame(stream, frame)?,
                None => break,
            }
        }

        let Some(state) = self.requests.get_mut(&stream) else {
            return Ok(());
        };
        if state.fin_received && !state.finished {
            if state.reader.buffered() > 0 {
                return Err(Error::Frame(format!("stream {} ended inside a frame", stream)));
            }
            state.finished = true;
            self.events.push_back(H3Event::Finished(stream));
            self.forget_if_done(stream);
        }
        Ok(())
    }

    fn on_request_frame(&mut self, stream: StreamId, frame: H3Frame) -> Result<()> {
        let client = self.side().is_client();
        let state = self
            .requests
            .get_mut(&stream)
            .ok_or(Error::StreamNotFound(stream.as_u64()))?;
        match frame {
            H3Frame::Headers(block) => {
                if state.trailers_received {
                    return Err(Error::FrameUnexpected("HEADERS after trailers".to_string()));
                }
                self.decode_headers(stream, block)
            }
            H3Frame::Data(data) => {
                if !state.headers_received || state.trailers_received {
                    return Err(Error::FrameUnexpected("DATA outside the message body".to_string()));
                }
                self.events.push_back(H3Event::Data { stream, data });
                Ok(())
            }
            H3Frame::PushPromise { .. } if client => {
                Err(Error::Id("PUSH_PROMISE without MAX_PUSH_ID".to_string()))
            }
            H3Frame::Unknown { .. } => Ok(()),
            other => Err(Error::FrameUnexpected(format!("{} on request stream", other.name()))),
        }
    }

    fn decode_headers(&mut self, stream: StreamId, block: Bytes) -> Result<()> {
        match self.decoder.decode_section(stream.as_u64(), &block)? {
            Some(headers) => self.deliver_headers(stream, headers),
            None => {
                if let Some(state) = self.requests.get_mut(&stream) {
                    state.blocked = Some(block);
                }
                Ok(())
            }
        }
    }

    fn deliver_headers(&mut self, stream: StreamId, headers: Vec<HeaderField>) -> Result<()> {
        let state = self
            .requests
            .get_mut(&stream)
            .ok_or(Error::StreamNotFound(stream.as_u64()))?;
        let trailers = state.headers_received;
        if trailers {
            state.trailers_received = true;
        } else {
            state.headers_received = true;
        }
        self.events.push_back(H3Event::Headers {
            stream,
            headers,
            trailers,
        });
        Ok(())
    }

    /// Decode header blocks that were waiting on encoder stream inserts
    fn retry_blocked(&mut self) -> Result<()> {
        let mut waiting: Vec<StreamId> = self
            .requests
            .iter()
            .filter(|(_, s)| s.blocked.is_some())
            .map(|(id, _)| *id)
            .collect();
        waiting.sort();
        for stream in waiting {
            let Some(block) = self.requests.get_mut(&stream).and_then(|s| s.blocked.take()) else {
                continue;
            };
            match self.decoder.decode_section(stream.as_u64(), &block)? {
                Some(headers) => {
                    self.deliver_headers(stream, headers)?;
                    self.drain_request(stream)?;
                }
                None => {
                    if let Some(state) = self.requests.get_mut(&stream) {
                        state.blocked = Some(block);
                    }
                }
            }
        }
        Ok(())
    }

    fn is_critical(&self, stream: StreamId) -> bool {
        self.peer_uni
            .get(&stream)
            .map_or(false, |kind| *kind != UniKind::Ignored)
            || Some(stream) == self.control
            || Some(stream) == self.encoder_stream
            || Some(stream) == self.decoder_stream
    }

    fn on_stream_reset(&mut self, stream: StreamId, code: u64) -> Result<()> {
        if self.is_critical(stream) {
            return Err(Error::ClosedCriticalStream(format!("stream {} reset", stream)));
        }
        self.peer_uni.remove(&stream);
        self.pending_uni.remove(&stream);
        if self.requests.remove(&stream).is_some() {
            self.decoder.cancel_stream(stream.as_u64());
            self.events.push_back(H3Event::Reset { stream, code });
        }
        Ok(())
    }

    fn on_stream_stopped(&mut self, stream: StreamId, code: u64) -> Result<()> {
        if self.is_critical(stream) {
            return Err(Error::ClosedCriticalStream(format!("stream {} stopped", stream)));
        }
        self.outgoing.remove(&stream);
        if let Some(state) = self.requests.get_mut(&stream) {
            state.local_done = true;
        }
        self.events.push_back(H3Event::Stopped { stream, code });
        self.forget_if_done(stream);
        Ok(())
    }
}

/// Encoded stream type prefix of a unidirectional stream
fn stream_type(kind: u64) -> Result<Bytes> {
    Ok(Bytes::from(varint::encode(kind)?))
}

/// Request header section: pseudo-headers, then `headers`
pub fn request_fields(
    method: &str,
    scheme: &str,
    authority: &str,
    path: &str,
    headers: &[HeaderField],
) -> Vec<HeaderField> {
    let mut fields = Vec::with_capacity(headers.len() + 4);
    fields.push(HeaderField::new(":method", method));
    fields.push(HeaderField::new(":scheme", scheme));
    fields.push(HeaderField::new(":authority", authority));
    fields.push(HeaderField::new(":path", path));
    fields.extend_from_slice(headers);
    fields
}

/// Response header section: `:status`, then `headers`
pub fn response_fields(status: u16, headers: &[HeaderField]) -> Vec<HeaderField> {
    let mut fields = Vec::with_capacity(headers.len() + 1);
    fields.push(HeaderField::new(":status", status.to_string()));
    fields.extend_from_slice(headers);
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_fields_order() {
        let fields = request_fields(
            "GET",
            "https",
            "example.com",
            "/",
            &[HeaderField::new("accept", "*/*")],
        );
        let names: Vec<&[u8]> = fields.iter().map(|f| f.name.as_slice()).collect();
        assert_eq!(
            names,
            vec![&b":method"[..], b":scheme", b":authority", b":path", b"accept"]
        );
        assert!(fields[..4].iter().all(HeaderField::is_pseudo));
    }

    #[test]
    fn test_response_fields() {
        let fields = response_fields(404, &[HeaderField::new("content-length", "0")]);
        assert_eq!(fields[0], HeaderField::new(":status", "404"));
        assert_eq!(fields.len(), 2);
    }

    #[test]
    fn test_stream_type_prefix() {
        assert_eq!(stream_type(STREAM_TYPE_CONTROL).unwrap().as_ref(), &[0x00]);
        assert_eq!(stream_type(STREAM_TYPE_DECODER).unwrap().as_ref(), &[0x03]);
    }

    #[test]
    fn test_config_default() {
        let config = H3Config::default();
        assert_eq!(config.encoder_table_capacity, 0);
        assert_eq!(config.max_data_frame, 16 * 1024);
        assert_eq!(config.settings, Settings::default());
    }
}
