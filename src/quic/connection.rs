//! QUIC connection state machine
//!
//! A [`Connection`] is sans-I/O: datagrams go in through
//! [`Connection::handle_datagram`], datagrams to send come out of
//! [`Connection::poll_transmit`], and time only advances through the
//! `now` arguments and [`Connection::on_timeout`]. The application learns
//! about progress by draining [`Connection::poll_event`].
//!
//! Lifecycle: `Initial` until the first packet is exchanged, `Handshaking`
//! until TLS completes, `Active`, then `Closing` (local close or error) or
//! `Draining` (peer close), and finally `Closed` after three probe
//! timeouts. Stream buffers are released as soon as closing starts.

use super::congestion::{CongestionConfig, CongestionStats, NewReno};
use super::crypto::{
    open_payload, protect_packet, unprotect_header, CryptoKeys, DirectionalKeys, EncryptionLevel, TAG_LEN,
};
use super::error::{Error, Result, TransportErrorCode};
use super::flow_control::{FlowControlConfig, FlowControlWindow};
use super::frames::{AckFrame, ConnectionClose, Frame, FrameIter, StreamFrame};
use super::loss::{LossDetector, LossTimeout, SentPacket};
use super::packet::{
    decode_packet_number, packet_number_len, ConnectionId, Header, PacketType, PartialHeader, RetryPacket,
    SpaceId, VersionNegotiation, DEFAULT_CID_LEN, KEY_PHASE_BIT, MAX_CID_LEN, MIN_INITIAL_SIZE, VERSION_1,
};
use super::path::{ConnectionIdPool, PathManager, PathProbe};
use super::stream::{Dir, RecvBuffer, SendBuffer, Side, StreamId, StreamManager, StreamWindows};
use super::tls::{ResumptionTicket, Secrets, TlsSession};
use super::transport_params::TransportParameters;
use super::varint;
use super::zero_rtt::{AntiReplayWindow, EarlyData, EarlyDataStatus, SessionCache, SessionTicket, ZeroRttConfig};
use super::{CLOSE_PTO_MULTIPLIER, DEFAULT_MAX_DATAGRAM_SIZE};
use bytes::Bytes;
use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Largest number of ACK ranges remembered per packet number space
const MAX_ACK_RANGES: usize = 64;

/// Worst-case CRYPTO frame header
const CRYPTO_FRAME_OVERHEAD: usize = 16;

/// Smallest room worth starting another packet for
const MIN_PACKET_ROOM: usize = 48;

/// Most out-of-order CRYPTO data buffered per level
const MAX_CRYPTO_BUFFER: u64 = 64 * 1024;

/// Amplification factor before the client address is validated
const AMPLIFICATION_FACTOR: u64 = 3;

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Initial,
    Handshaking,
    Active,
    Closing,
    Draining,
    Closed,
}

impl ConnectionState {
    /// State name
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Initial => "INITIAL",
            ConnectionState::Handshaking => "HANDSHAKING",
            ConnectionState::Active => "ACTIVE",
            ConnectionState::Closing => "CLOSING",
            ConnectionState::Draining => "DRAINING",
            ConnectionState::Closed => "CLOSED",
        }
    }

    /// Whether the connection is shutting down or gone
    pub fn is_closing(&self) -> bool {
        matches!(
            self,
            ConnectionState::Closing | ConnectionState::Draining | ConnectionState::Closed
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Connection configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Local transport parameters
    pub transport: TransportParameters,
    pub congestion: CongestionConfig,
    pub flow_control: FlowControlConfig,
    pub zero_rtt: ZeroRttConfig,
    /// Length of the connection IDs we issue
    pub cid_len: usize,
    /// Largest UDP payload we send
    pub max_datagram_size: usize,
    /// Server name, used as the session cache key (client)
    pub server_name: Option<String>,
    /// Session tickets for 0-RTT (client)
    pub session_cache: Option<Arc<SessionCache>>,
    /// Replay protection shared by all connections of a server
    pub anti_replay: Option<Arc<AntiReplayWindow>>,
}

impl ConnectionConfig {
    /// Validate every section of the configuration
    pub fn validate(&self) -> Result<()> {
        self.transport.validate()?;
        self.congestion.validate()?;
        self.flow_control.validate()?;
        self.zero_rtt.validate()?;
        if self.cid_len > MAX_CID_LEN {
            return Err(Error::InvalidState(format!(
                "connection ID length {} exceeds {}",
                self.cid_len, MAX_CID_LEN
            )));
        }
        if self.max_datagram_size < DEFAULT_MAX_DATAGRAM_SIZE {
            return Err(Error::InvalidState(format!(
                "max datagram size {} below {}",
                self.max_datagram_size, DEFAULT_MAX_DATAGRAM_SIZE
            )));
        }
        Ok(())
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            transport: TransportParameters::default(),
            congestion: CongestionConfig::default(),
            flow_control: FlowControlConfig::default(),
            zero_rtt: ZeroRttConfig::default(),
            cid_len: DEFAULT_CID_LEN,
            max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
            server_name: None,
            session_cache: None,
            anti_replay: None,
        }
    }
}

/// Builder for connection configuration
#[derive(Debug, Default)]
pub struct ConnectionConfigBuilder {
    config: ConnectionConfig,
}

impl ConnectionConfigBuilder {
    /// Create a builder with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Local transport parameters
    pub fn transport_parameters(mut self, params: TransportParameters) -> Self {
        self.config.transport = params;
        self
    }

    /// Congestion control tuning
    pub fn congestion(mut self, congestion: CongestionConfig) -> Self {
        self.config.congestion = congestion;
        self
    }

    /// Flow control tuning
    pub fn flow_control(mut self, flow_control: FlowControlConfig) -> Self {
        self.config.flow_control = flow_control;
        self
    }

    /// 0-RTT settings
    pub fn zero_rtt(mut self, zero_rtt: ZeroRttConfig) -> Self {
        self.config.zero_rtt = zero_rtt;
        self
    }

    /// Length of issued connection IDs
    pub fn cid_len(mut self, len: usize) -> Self {
        self.config.cid_len = len;
        self
    }

    /// Largest datagram to send
    pub fn max_datagram_size(mut self, size: usize) -> Self {
        self.config.max_datagram_size = size;
        self
    }

    /// Idle timeout advertised to the peer
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.transport.max_idle_timeout = timeout.as_millis() as u64;
        self
    }

    /// Server name for session resumption
    pub fn server_name(mut self, name: &str) -> Self {
        self.config.server_name = Some(name.to_string());
        self
    }

    /// Shared session ticket cache
    pub fn session_cache(mut self, cache: Arc<SessionCache>) -> Self {
        self.config.session_cache = Some(cache);
        self
    }

    /// Shared anti-replay window
    pub fn anti_replay(mut self, window: Arc<AntiReplayWindow>) -> Self {
        self.config.anti_replay = Some(window);
        self
    }

    /// Validate and build
    pub fn build(self) -> Result<ConnectionConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Something the application should know about
#[derive(Debug)]
pub enum Event {
    /// TLS handshake finished and peer parameters applied
    HandshakeCompleted,
    /// Peer opened a stream
    StreamOpened(StreamId),
    /// New data or FIN is available on a stream
    StreamReadable(StreamId),
    /// Peer reset its sending side
    StreamReset { id: StreamId, code: u64 },
    /// Peer asked us to stop sending; the stream was reset
    StreamStopped { id: StreamId, code: u64 },
    DatagramReceived(Bytes),
    /// A new path was validated and became primary
    PathValidated(SocketAddr),
    /// Validation of a candidate path timed out
    PathFailed(SocketAddr),
    EarlyDataAccepted,
    EarlyDataRejected(Error),
    /// Resumption ticket received (client)
    SessionTicket(SessionTicket),
    /// Connection is closing; `by_peer` tells who started it
    ConnectionClosed { code: u64, reason: String, by_peer: bool },
    /// All state released
    Closed,
}

/// A datagram to put on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmit {
    pub destination: SocketAddr,
    /// Local address to send from
    pub source: SocketAddr,
    pub contents: Vec<u8>,
}

/// Connection counters
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ConnectionStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_dropped: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_lost: u64,
    pub probe_timeouts: u64,
    pub key_updates: u64,
    pub smoothed_rtt: Duration,
    pub min_rtt: Duration,
    pub congestion_window: u64,
    pub bytes_in_flight: u64,
    pub pacing_rate: u64,
    pub congestion: CongestionStats,
}

/// Per packet-number-space state
#[derive(Debug)]
struct PacketSpace {
    keys: Option<CryptoKeys>,
    next_pn: u64,
    largest_received: Option<u64>,
    largest_received_time: Option<Instant>,
    /// Received packet numbers as descending inclusive ranges
    received: Vec<(u64, u64)>,
    ack_pending: bool,
    crypto_recv: RecvBuffer,
    crypto_send: SendBuffer,
    /// Probe packets still owed after a PTO
    probes: u8,
    discarded: bool,
}

impl PacketSpace {
    fn new() -> Self {
        PacketSpace {
            keys: None,
            next_pn: 0,
            largest_received: None,
            largest_received_time: None,
            received: Vec::new(),
            ack_pending: false,
            crypto_recv: RecvBuffer::new(),
            crypto_send: SendBuffer::new(),
            probes: 0,
            discarded: false,
        }
    }

    fn is_duplicate(&self, pn: u64) -> bool {
        if self.received.iter().any(|(lo, hi)| *lo <= pn && pn <= *hi) {
            return true;
        }
        // Below everything we still remember
        self.received.len() >= MAX_ACK_RANGES && self.received.last().map_or(false, |(lo, _)| pn < *lo)
    }

    fn on_packet_received(&mut self, pn: u64, ack_eliciting: bool, now: Instant) {
        insert_ack_range(&mut self.received, pn);
        if self.largest_received.map_or(true, |l| pn > l) {
            self.largest_received = Some(pn);
            self.largest_received_time = Some(now);
        }
        if ack_eliciting {
            self.ack_pending = true;
        }
    }

    fn ack_frame(&self, now: Instant, exponent: u64) -> Option<AckFrame> {
        if self.received.is_empty() {
            return None;
        }
        let delay = self
            .largest_received_time
            .map_or(0, |t| now.saturating_duration_since(t).as_micros() as u64 >> exponent);
        Some(AckFrame {
            ranges: self.received.clone(),
            delay,
            ecn: None,
        })
    }
}

fn insert_ack_range(ranges: &mut Vec<(u64, u64)>, pn: u64) {
    let i = ranges.iter().position(|(lo, _)| *lo <= pn).unwrap_or(ranges.len());
    if i < ranges.len() && ranges[i].1 >= pn {
        return;
    }
    let joins_below = i < ranges.len() && ranges[i].1 + 1 == pn;
    let joins_above = i > 0 && ranges[i - 1].0 == pn + 1;
    match (joins_above, joins_below) {
        (true, true) => {
            ranges[i - 1].0 = ranges[i].0;
            ranges.remove(i);
        }
        (true, false) => ranges[i - 1].0 = pn,
        (false, true) => ranges[i].1 = pn,
        (false, false) => ranges.insert(i, (pn, pn)),
    }
    ranges.truncate(MAX_ACK_RANGES);
}

fn frame_len(frame: &Frame) -> Result<usize> {
    Ok(frame.to_vec()?.len())
}

fn frames_len(frames: &[Frame]) -> Result<usize> {
    frames.iter().map(frame_len).sum()
}

fn dir_of(bidi: bool) -> Dir {
    if bidi {
        Dir::Bidi
    } else {
        Dir::Uni
    }
}

/// Remove header and packet protection with one set of keys
fn open_with(
    keys: &DirectionalKeys,
    buf: &mut [u8],
    pn_offset: usize,
    largest: Option<u64>,
) -> Option<(u64, Vec<u8>)> {
    let (truncated, pn_len) = unprotect_header(&keys.header, buf, pn_offset).ok()?;
    let pn = decode_packet_number(largest, truncated, pn_len);
    let payload = open_payload(&keys.packet, buf, pn_offset + pn_len, pn).ok()?;
    Some((pn, payload))
}

fn negotiate_idle(local: Option<Duration>, peer: Option<Duration>) -> Option<Duration> {
    match (local, peer) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Build the Version Negotiation reply for a datagram carrying an
/// unsupported version, or `None` when no reply is due
pub fn negotiate_version(datagram: &[u8]) -> Result<Option<Vec<u8>>> {
    match PartialHeader::parse(datagram, 0) {
        Err(Error::UnsupportedVersion(version)) => {
            // Parse failed past the version: pull the CIDs out by hand
            if datagram.len() < MIN_INITIAL_SIZE {
                return Ok(None);
            }
            let dcid_len = *datagram.get(5).ok_or_else(|| Error::Truncated("dcid length".to_string()))? as usize;
            let dcid = ConnectionId::new(
                datagram
                    .get(6..6 + dcid_len)
                    .ok_or_else(|| Error::Truncated("dcid".to_string()))?,
            )?;
            let scid_len = *datagram
                .get(6 + dcid_len)
                .ok_or_else(|| Error::Truncated("scid length".to_string()))? as usize;
            let scid_start = 7 + dcid_len;
            let scid = ConnectionId::new(
                datagram
                    .get(scid_start..scid_start + scid_len)
                    .ok_or_else(|| Error::Truncated("scid".to_string()))?,
            )?;
            debug!(version, "answering with version negotiation");
            let reply = VersionNegotiation {
                dcid: scid,
                scid: dcid,
                versions: vec![VERSION_1],
            };
            Ok(Some(reply.encode()))
        }
        Err(err) => Err(err),
        Ok(_) => Ok(None),
    }
}

/// A QUIC connection
pub struct Connection {
    side: Side,
    state: ConnectionState,
    config: ConnectionConfig,
    tls: Box<dyn TlsSession>,
    spaces: [PacketSpace; 3],
    /// 0-RTT keys: sealing on the client, opening on the server
    zero_rtt_keys: Option<DirectionalKeys>,
    early: EarlyData,
    key_phase: bool,
    /// Previous-phase opening keys, for reordered packets
    prev_remote: Option<DirectionalKeys>,
    /// First packet number received in the current key phase
    recv_phase_start: Option<u64>,
    /// First packet number sent in the current key phase
    key_update_pn: Option<u64>,
    key_update_acked: bool,
    /// Destination CID of the client's first Initial
    original_dcid: ConnectionId,
    /// Source CID the peer used in its first long header
    peer_initial_scid: Option<ConnectionId>,
    peer_seen: bool,
    retry_token: Bytes,
    retry_scid: Option<ConnectionId>,
    new_token: Option<Bytes>,
    cids: ConnectionIdPool,
    paths: PathManager,
    pending_probes: VecDeque<PathProbe>,
    peer_params: Option<TransportParameters>,
    streams: StreamManager,
    conn_flow: FlowControlWindow,
    cc: NewReno,
    loss: LossDetector,
    handshake_complete: bool,
    handshake_confirmed: bool,
    /// Data-space control frames waiting for a 1-RTT packet
    control: VecDeque<Frame>,
    datagrams: VecDeque<Bytes>,
    events: VecDeque<Event>,
    close_frame: Option<ConnectionClose>,
    close_pending: bool,
    peer_closed: bool,
    close_deadline: Option<Instant>,
    idle_timeout: Option<Duration>,
    last_activity: Instant,
    address_validated: bool,
    unvalidated_received: u64,
    unvalidated_sent: u64,
    stats: ConnectionStats,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("side", &self.side)
            .field("state", &self.state)
            .field("local_cid", &self.cids.initial_local())
            .field("remote_cid", &self.cids.remote_cid())
            .field("streams", &self.streams.len())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Start a client connection towards `remote`
    pub fn client(
        config: ConnectionConfig,
        mut tls: Box<dyn TlsSession>,
        local: SocketAddr,
        remote: SocketAddr,
        now: Instant,
    ) -> Result<Self> {
        config.validate()?;
        let dcid = ConnectionId::random(DEFAULT_CID_LEN)?;
        let scid = ConnectionId::random(config.cid_len)?;

        let mut params = config.transport.clone();
        params.original_destination_connection_id = None;
        params.stateless_reset_token = None;
        params.retry_source_connection_id = None;
        params.initial_source_connection_id = Some(scid);
        tls.set_transport_parameters(&params.encode()?);

        let mut conn = Self::new(Side::Client, config, tls, scid, dcid, dcid, local, remote, now)?;
        conn.spaces[SpaceId::Initial.index()].keys = Some(CryptoKeys::initial(dcid.as_bytes(), true)?);
        conn.address_validated = true;
        conn.try_resume(now)?;
        conn.drive_tls(now)?;
        debug!(%remote, scid = %scid, dcid = %dcid, "client connection created");
        Ok(conn)
    }

    /// Create the server side of a connection whose client chose
    /// `initial_dcid` as the destination of its first Initial packet
    pub fn server(
        config: ConnectionConfig,
        mut tls: Box<dyn TlsSession>,
        local: SocketAddr,
        remote: SocketAddr,
        initial_dcid: ConnectionId,
        now: Instant,
    ) -> Result<Self> {
        config.validate()?;
        let scid = ConnectionId::random(config.cid_len)?;
        let mut reset_token = [0u8; 16];
        super::crypto::random_bytes(&mut reset_token)?;

        let mut params = config.transport.clone();
        params.original_destination_connection_id = Some(initial_dcid);
        params.initial_source_connection_id = Some(scid);
        params.stateless_reset_token = Some(reset_token);
        tls.set_transport_parameters(&params.encode()?);

        let mut conn = Self::new(
            Side::Server,
            config,
            tls,
            scid,
            ConnectionId::empty(),
            initial_dcid,
            local,
            remote,
            now,
        )?;
        conn.spaces[SpaceId::Initial.index()].keys = Some(CryptoKeys::initial(initial_dcid.as_bytes(), false)?);
        debug!(%remote, scid = %scid, odcid = %initial_dcid, "server connection created");
        Ok(conn)
    }

    /// Create a server connection from the client's first datagram and
    /// process that datagram
    pub fn accept(
        config: ConnectionConfig,
        tls: Box<dyn TlsSession>,
        local: SocketAddr,
        remote: SocketAddr,
        datagram: &[u8],
        now: Instant,
    ) -> Result<Self> {
        let header = PartialHeader::parse(datagram, 0)?;
        if header.packet_type != PacketType::Initial {
            return Err(Error::InvalidPacket(format!(
                "first packet is {}, expected Initial",
                header.packet_type
            )));
        }
        if datagram.len() < MIN_INITIAL_SIZE {
            return Err(Error::InvalidPacket(format!(
                "client Initial datagram of {} bytes is below {}",
                datagram.len(),
                MIN_INITIAL_SIZE
            )));
        }
        let mut conn = Self::server(config, tls, local, remote, header.dcid, now)?;
        conn.handle_datagram(now, remote, datagram);
        Ok(conn)
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        side: Side,
        config: ConnectionConfig,
        tls: Box<dyn TlsSession>,
        local_cid: ConnectionId,
        remote_cid: ConnectionId,
        original_dcid: ConnectionId,
        local: SocketAddr,
        remote: SocketAddr,
        now: Instant,
    ) -> Result<Self> {
        let transport = &config.transport;
        let windows = StreamWindows {
            local_bidi_local: transport.initial_max_stream_data_bidi_local,
            local_bidi_remote: transport.initial_max_stream_data_bidi_remote,
            local_uni: transport.initial_max_stream_data_uni,
            peer_bidi_remote: 0,
            peer_bidi_local: 0,
            peer_uni: 0,
        };
        let streams = StreamManager::new(
            side,
            transport.initial_max_streams_bidi,
            transport.initial_max_streams_uni,
            windows,
            config.flow_control,
        );
        let conn_flow = FlowControlWindow::new(0, transport.initial_max_data, &config.flow_control);
        let cc = NewReno::new(config.congestion, TransportParameters::absent().max_ack_delay_duration());
        let loss = LossDetector::new(config.congestion.persistent_congestion_threshold);
        let idle_timeout = transport.idle_timeout();

        let mut paths = PathManager::new(local, remote);
        paths.set_migration_enabled(!transport.disable_active_migration);

        Ok(Connection {
            side,
            state: ConnectionState::Initial,
            tls,
            spaces: [PacketSpace::new(), PacketSpace::new(), PacketSpace::new()],
            zero_rtt_keys: None,
            early: EarlyData::disabled(),
            key_phase: false,
            prev_remote: None,
            recv_phase_start: None,
            key_update_pn: None,
            key_update_acked: false,
            original_dcid,
            peer_initial_scid: None,
            peer_seen: false,
            retry_token: Bytes::new(),
            retry_scid: None,
            new_token: None,
            cids: ConnectionIdPool::new(local_cid, remote_cid),
            paths,
            pending_probes: VecDeque::new(),
            peer_params: None,
            streams,
            conn_flow,
            cc,
            loss,
            handshake_complete: false,
            handshake_confirmed: false,
            control: VecDeque::new(),
            datagrams: VecDeque::new(),
            events: VecDeque::new(),
            close_frame: None,
            close_pending: false,
            peer_closed: false,
            close_deadline: None,
            idle_timeout,
            last_activity: now,
            address_validated: false,
            unvalidated_received: 0,
            unvalidated_sent: 0,
            stats: ConnectionStats::default(),
            config,
        })
    }

    /// Endpoint role
    pub fn side(&self) -> Side {
        self.side
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether all state has been released
    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    /// Whether the TLS handshake has completed
    pub fn is_handshake_complete(&self) -> bool {
        self.handshake_complete
    }

    /// Whether the handshake is confirmed (RFC 9001 Section 4.1.2)
    pub fn is_handshake_confirmed(&self) -> bool {
        self.handshake_confirmed
    }

    /// Our handshake connection ID
    pub fn local_cid(&self) -> ConnectionId {
        self.cids.initial_local()
    }

    /// Connection ID we currently address the peer with
    pub fn remote_cid(&self) -> ConnectionId {
        self.cids.remote_cid()
    }

    /// Peer address of the primary path
    pub fn remote_address(&self) -> SocketAddr {
        self.paths.current().remote
    }

    /// Local address of the primary path
    pub fn local_address(&self) -> SocketAddr {
        self.paths.current().local
    }

    /// Transport parameters received from the peer
    pub fn peer_transport_parameters(&self) -> Option<&TransportParameters> {
        self.peer_params.as_ref()
    }

    /// Early data outcome
    pub fn early_data_status(&self) -> EarlyDataStatus {
        self.early.status()
    }

    /// Current 1-RTT key phase bit
    pub fn key_phase(&self) -> bool {
        self.key_phase
    }

    /// Address validation token received via NEW_TOKEN (client)
    pub fn new_token(&self) -> Option<&Bytes> {
        self.new_token.as_ref()
    }

    /// Congestion controller, for inspection
    pub fn congestion(&self) -> &NewReno {
        &self.cc
    }

    /// Connection counters
    pub fn stats(&self) -> ConnectionStats {
        let rtt = self.cc.rtt();
        ConnectionStats {
            packets_lost: self.loss.lost_total(),
            probe_timeouts: self.loss.pto_total(),
            smoothed_rtt: rtt.smoothed(),
            min_rtt: rtt.min(),
            congestion_window: self.cc.window(),
            bytes_in_flight: self.cc.bytes_in_flight(),
            pacing_rate: self.cc.pacing_rate(),
            congestion: self.cc.stats(),
            ..self.stats
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!(side = ?self.side, from = %self.state, to = %state, "connection state change");
            self.state = state;
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state.is_closing() {
            let (code, reason) = self
                .close_frame
                .as_ref()
                .map_or((0, String::new()), |c| (c.error_code, c.reason_str()));
            return Err(Error::ConnectionClosed { code, reason });
        }
        Ok(())
    }

    // ----- TLS -----

    fn try_resume(&mut self, now: Instant) -> Result<()> {
        if !self.config.zero_rtt.enabled {
            return Ok(());
        }
        let (cache, name) = match (&self.config.session_cache, &self.config.server_name) {
            (Some(cache), Some(name)) => (cache.clone(), name.clone()),
            _ => return Ok(()),
        };
        let ticket = match cache.get(&name, now) {
            Ok(ticket) => ticket,
            Err(err) => {
                debug!(server_name = %name, %err, "no 0-RTT ticket");
                return Ok(());
            }
        };
        self.zero_rtt_keys = Some(DirectionalKeys::from_secret(ticket.suite, &ticket.early_secret)?);
        self.apply_peer_limits(&ticket.transport_params);
        self.tls.resume(&ticket.ticket);
        self.early = EarlyData::from_ticket(&ticket);
        debug!(server_name = %name, max_early_data = ticket.max_early_data, "attempting 0-RTT");
        Ok(())
    }

    /// Exchange pending data with the TLS engine
    fn drive_tls(&mut self, now: Instant) -> Result<()> {
        while let Some(secrets) = self.tls.take_secrets() {
            self.install_secrets(secrets)?;
        }
        while let Some((level, data)) = self.tls.write_handshake() {
            let space = &mut self.spaces[level.space().index()];
            if space.discarded {
                warn!(level = ?level, "TLS wrote at a discarded level");
                continue;
            }
            space.crypto_send.write(Bytes::from(data));
        }
        if !self.handshake_complete && self.tls.is_handshake_complete() {
            self.on_handshake_complete()?;
        }
        if self.handshake_complete {
            while let Some(ticket) = self.tls.take_resumption_ticket() {
                self.on_resumption_ticket(ticket, now);
            }
        }
        Ok(())
    }

    fn install_secrets(&mut self, secrets: Secrets) -> Result<()> {
        let is_client = self.side.is_client();
        match secrets.level {
            EncryptionLevel::Initial => return Ok(()),
            EncryptionLevel::ZeroRtt => return self.install_early_keys(&secrets),
            level => {
                let keys =
                    CryptoKeys::from_secrets(secrets.suite, secrets.local(is_client), secrets.remote(is_client))?;
                self.spaces[level.space().index()].keys = Some(keys);
            }
        }
        debug!(level = ?secrets.level, suite = %secrets.suite, "installed packet protection keys");
        Ok(())
    }

    fn install_early_keys(&mut self, secrets: &Secrets) -> Result<()> {
        if !self.config.zero_rtt.enabled {
            self.tls.reject_early_data();
            return Ok(());
        }
        if self.side.is_client() {
            self.zero_rtt_keys = Some(DirectionalKeys::from_secret(secrets.suite, &secrets.client)?);
            return Ok(());
        }

        let replay = match (&self.config.anti_replay, self.tls.client_hello_random()) {
            (Some(window), Some(random)) => window.check_and_insert(random).err(),
            _ => None,
        };
        self.early = EarlyData::offered();
        if let Some(err) = replay {
            warn!(remote = %self.paths.current().remote, "refusing 0-RTT from replayed ClientHello");
            self.tls.reject_early_data();
            self.early.reject();
            self.events.push_back(Event::EarlyDataRejected(err));
            return Ok(());
        }
        self.zero_rtt_keys = Some(DirectionalKeys::from_secret(secrets.suite, &secrets.client)?);
        self.early.accept();
        self.events.push_back(Event::EarlyDataAccepted);
        debug!("accepted 0-RTT keys");
        Ok(())
    }

    fn on_handshake_complete(&mut self) -> Result<()> {
        self.handshake_complete = true;
        let raw = self
            .tls
            .peer_transport_parameters()
            .map(<[u8]>::to_vec)
            .ok_or_else(|| Error::TransportParameter("peer sent no transport parameters".to_string()))?;
        let params = TransportParameters::decode(&raw, self.side.peer())?;
        self.authenticate_cids(&params)?;

        self.apply_peer_limits(&params);
        if let Some(token) = params.stateless_reset_token {
            self.cids.set_initial_reset_token(token);
        }
        self.cc.rtt_mut().set_max_ack_delay(params.max_ack_delay_duration());
        self.idle_timeout = negotiate_idle(self.config.transport.idle_timeout(), params.idle_timeout());
        if self.side.is_client() {
            self.paths.set_migration_enabled(!params.disable_active_migration);
        }
        self.cids.issue(params.active_connection_id_limit)?;
        self.peer_params = Some(params);

        if self.side.is_client() {
            self.resolve_early_data();
        } else {
            self.handshake_confirmed = true;
            self.address_validated = true;
            self.control.push_back(Frame::HandshakeDone);
            self.discard_space(SpaceId::Handshake);
            if self.early.status() == EarlyDataStatus::Pending {
                self.early.reject();
            }
        }
        self.zero_rtt_keys = None;
        self.set_state(ConnectionState::Active);
        self.events.push_back(Event::HandshakeCompleted);
        Ok(())
    }

    /// Check the connection IDs echoed in the peer's transport parameters
    /// (RFC 9000 Section 7.3)
    fn authenticate_cids(&self, params: &TransportParameters) -> Result<()> {
        if params.initial_source_connection_id != self.peer_initial_scid {
            return Err(Error::TransportParameter(
                "initial_source_connection_id does not match".to_string(),
            ));
        }
        if self.side.is_client() {
            if params.original_destination_connection_id != Some(self.original_dcid) {
                return Err(Error::TransportParameter(
                    "original_destination_connection_id does not match".to_string(),
                ));
            }
            if params.retry_source_connection_id != self.retry_scid {
                return Err(Error::TransportParameter(
                    "retry_source_connection_id does not match".to_string(),
                ));
            }
        }
        Ok(())
    }

    fn apply_peer_limits(&mut self, params: &TransportParameters) {
        self.conn_flow.send.record_limit_update(params.initial_max_data);
        let local = &self.config.transport;
        let windows = StreamWindows {
            local_bidi_local: local.initial_max_stream_data_bidi_local,
            local_bidi_remote: local.initial_max_stream_data_bidi_remote,
            local_uni: local.initial_max_stream_data_uni,
            peer_bidi_remote: params.initial_max_stream_data_bidi_remote,
            peer_bidi_local: params.initial_max_stream_data_bidi_local,
            peer_uni: params.initial_max_stream_data_uni,
        };
        self.streams
            .set_peer_limits(params.initial_max_streams_bidi, params.initial_max_streams_uni, windows);
    }

    fn resolve_early_data(&mut self) {
        if self.early.status() != EarlyDataStatus::Pending {
            return;
        }
        if self.tls.early_data_accepted() == Some(true) {
            self.early.accept();
            self.events.push_back(Event::EarlyDataAccepted);
            debug!(sent = self.early.sent(), "0-RTT accepted");
            return;
        }

        self.early.reject();
        // Everything sent in 0-RTT goes out again under 1-RTT keys
        for packet in self.loss.drain_space(SpaceId::Data) {
            if packet.in_flight {
                self.cc.on_packets_discarded(packet.size as u64);
            }
            for frame in packet.frames {
                self.requeue_frame(SpaceId::Data, frame);
            }
        }
        if let (Some(cache), Some(name)) = (&self.config.session_cache, &self.config.server_name) {
            cache.remove(name);
        }
        debug!(sent = self.early.sent(), "0-RTT rejected");
        self.events.push_back(Event::EarlyDataRejected(Error::EarlyDataRejected));
    }

    fn on_resumption_ticket(&mut self, ticket: ResumptionTicket, now: Instant) {
        if !self.side.is_client() {
            return;
        }
        let (Some(server_name), Some(params)) = (self.config.server_name.clone(), self.peer_params.clone()) else {
            debug!("ignoring session ticket without server name");
            return;
        };
        let ticket = SessionTicket {
            ticket: ticket.ticket,
            suite: ticket.suite,
            early_secret: ticket.early_secret,
            transport_params: params,
            server_name,
            received_at: now,
            max_early_data: ticket.max_early_data,
        };
        if let Some(cache) = &self.config.session_cache {
            cache.put(ticket.clone());
        }
        self.events.push_back(Event::SessionTicket(ticket));
    }

    fn discard_space(&mut self, space: SpaceId) {
        let state = &mut self.spaces[space.index()];
        if state.discarded {
            return;
        }
        state.discarded = true;
        state.keys = None;
        state.ack_pending = false;
        state.probes = 0;
        state.crypto_send.clear();
        state.crypto_recv.clear();
        let bytes = self.loss.discard_space(space);
        self.cc.on_packets_discarded(bytes);
        debug!(space = ?space, "discarded keys");
    }

    // ----- receiving -----

    /// Process one UDP datagram received from `from`
    ///
    /// Undecryptable packets are dropped; protocol errors close the
    /// connection.
    pub fn handle_datagram(&mut self, now: Instant, from: SocketAddr, data: &[u8]) {
        match self.state {
            ConnectionState::Closed | ConnectionState::Draining => {
                trace!(len = data.len(), "datagram ignored while draining");
                return;
            }
            ConnectionState::Closing => {
                if !self.peer_closed {
                    self.close_pending = true;
                }
                return;
            }
            _ => {}
        }
        self.stats.bytes_received += data.len() as u64;
        if !self.address_validated {
            self.unvalidated_received += data.len() as u64;
        }

        let mut offset = 0;
        let mut processed = false;
        while offset < data.len() {
            let remaining = &data[offset..];
            let header = match PartialHeader::parse(remaining, self.cids.cid_len()) {
                Ok(header) => header,
                Err(err) => {
                    debug!(%err, "dropping unparseable packet");
                    self.stats.packets_dropped += 1;
                    break;
                }
            };
            let len = header.len;
            match self.handle_packet(now, from, &remaining[..len], header) {
                Ok(true) => processed = true,
                Ok(false) => {}
                Err(err) => {
                    self.close_with_error(now, err);
                    return;
                }
            }
            if self.state.is_closing() {
                return;
            }
            offset += len;
        }

        if !processed && data.len() >= 21 && self.cids.is_reset_token(&data[data.len() - 16..]) {
            debug!("stateless reset received");
            self.events.push_back(Event::ConnectionClosed {
                code: TransportErrorCode::NoError.as_u64(),
                reason: "stateless reset".to_string(),
                by_peer: true,
            });
            self.release_resources();
            self.close_deadline = Some(now + self.close_period());
            self.set_state(ConnectionState::Draining);
        }
    }

    fn drop_packet(&mut self, level: EncryptionLevel, reason: &str) {
        self.stats.packets_dropped += 1;
        debug!(level = ?level, reason, "dropped packet");
    }

    fn accepts_dcid(&self, header: &PartialHeader) -> bool {
        if self.cids.is_local(&header.dcid) {
            return true;
        }
        // Client Initial and 0-RTT keep the original DCID until the
        // server's SCID is known
        !self.side.is_client() && header.is_long() && header.dcid == self.original_dcid
    }

    fn handle_packet(&mut self, now: Instant, from: SocketAddr, packet: &[u8], header: PartialHeader) -> Result<bool> {
        match header.packet_type {
            PacketType::VersionNegotiation => {
                self.on_version_negotiation(now, packet);
                return Ok(false);
            }
            PacketType::Retry => {
                self.on_retry(packet)?;
                return Ok(false);
            }
            _ => {}
        }
        let Some(level) = header.packet_type.encryption_level() else {
            return Ok(false);
        };
        if !self.accepts_dcid(&header) {
            self.drop_packet(level, "unknown destination connection ID");
            return Ok(false);
        }

        let space = level.space();
        let idx = space.index();
        let largest = self.spaces[idx].largest_received;
        let mut buf = packet.to_vec();
        let opened = match level {
            EncryptionLevel::OneRtt => self.open_one_rtt(&mut buf, header.pn_offset),
            EncryptionLevel::ZeroRtt if !self.side.is_client() => match self.zero_rtt_keys.as_ref() {
                Some(keys) => open_with(keys, &mut buf, header.pn_offset, largest),
                None => None,
            },
            EncryptionLevel::ZeroRtt => None,
            _ => match self.spaces[idx].keys.as_ref() {
                Some(keys) => open_with(&keys.remote, &mut buf, header.pn_offset, largest),
                None => None,
            },
        };
        let Some((pn, payload)) = opened else {
            self.drop_packet(level, "keys unavailable or decryption failed");
            return Ok(false);
        };

        let reserved = if header.is_long() { buf[0] & 0x0c } else { buf[0] & 0x18 };
        if reserved != 0 {
            return Err(Error::Protocol("reserved header bits set".to_string()));
        }
        if self.spaces[idx].is_duplicate(pn) {
            self.drop_packet(level, "duplicate packet number");
            return Ok(false);
        }

        if !self.peer_seen && header.is_long() {
            self.cids.set_initial_remote(header.scid);
            self.peer_initial_scid = Some(header.scid);
            self.peer_seen = true;
        }
        if level == EncryptionLevel::Handshake && !self.side.is_client() && !self.address_validated {
            self.address_validated = true;
            self.discard_space(SpaceId::Initial);
        }
        if self.state == ConnectionState::Initial {
            self.set_state(ConnectionState::Handshaking);
        }
        self.last_activity = now;
        self.stats.packets_received += 1;
        trace!(level = ?level, pn, len = packet.len(), "packet received");

        let ack_eliciting = self.process_frames(now, from, level, Bytes::from(payload))?;
        if !self.spaces[idx].discarded {
            self.spaces[idx].on_packet_received(pn, ack_eliciting, now);
        }
        if level == EncryptionLevel::OneRtt && largest.map_or(true, |l| pn > l) {
            self.check_path_change(now, from)?;
        }
        Ok(true)
    }

    fn open_one_rtt(&mut self, buf: &mut [u8], pn_offset: usize) -> Option<(u64, Vec<u8>)> {
        let data = SpaceId::Data.index();
        let largest = self.spaces[data].largest_received;
        let keys = self.spaces[data].keys.as_ref()?;
        let (truncated, pn_len) = unprotect_header(&keys.remote.header, buf, pn_offset).ok()?;
        let pn = decode_packet_number(largest, truncated, pn_len);
        let header_len = pn_offset + pn_len;
        let phase = buf[0] & KEY_PHASE_BIT != 0;

        if phase == self.key_phase {
            let payload = open_payload(&keys.remote.packet, buf, header_len, pn).ok()?;
            if self.recv_phase_start.is_none() {
                self.recv_phase_start = Some(pn);
            }
            return Some((pn, payload));
        }

        let reordered = self.recv_phase_start.map_or(true, |start| pn < start);
        if reordered {
            if let Some(prev) = self.prev_remote.as_ref() {
                return open_payload(&prev.packet, buf, header_len, pn).ok().map(|p| (pn, p));
            }
        }

        // Peer moved to the next key phase
        let next = keys.next_generation().ok()?;
        let payload = open_payload(&next.remote.packet, buf, header_len, pn).ok()?;
        let old = self.spaces[data].keys.replace(next);
        self.prev_remote = old.map(|k| k.remote);
        self.key_phase = phase;
        self.recv_phase_start = Some(pn);
        self.key_update_pn = Some(self.spaces[data].next_pn);
        self.key_update_acked = false;
        self.stats.key_updates += 1;
        debug!(pn, "peer initiated key update");
        Some((pn, payload))
    }

    fn on_version_negotiation(&mut self, now: Instant, packet: &[u8]) {
        if !self.side.is_client() || self.peer_seen {
            return;
        }
        let vn = match VersionNegotiation::decode(packet) {
            Ok(vn) => vn,
            Err(err) => {
                debug!(%err, "dropping malformed version negotiation");
                return;
            }
        };
        if vn.versions.contains(&VERSION_1) {
            // Must not list the version we offered; ignore as spoofed
            return;
        }
        warn!(versions = ?vn.versions, "server supports no compatible version");
        self.events.push_back(Event::ConnectionClosed {
            code: TransportErrorCode::NoError.as_u64(),
            reason: "no compatible QUIC version".to_string(),
            by_peer: true,
        });
        self.release_resources();
        self.close_deadline = Some(now);
        self.set_state(ConnectionState::Draining);
    }

    fn on_retry(&mut self, packet: &[u8]) -> Result<()> {
        if !self.side.is_client() || self.peer_seen || self.retry_scid.is_some() {
            return Ok(());
        }
        let retry = match RetryPacket::decode(packet, &self.original_dcid) {
            Ok(retry) => retry,
            Err(err) => {
                debug!(%err, "dropping invalid retry");
                return Ok(());
            }
        };
        if retry.token.is_empty() {
            return Ok(());
        }

        self.retry_scid = Some(retry.scid);
        self.retry_token = retry.token;
        self.cids.set_initial_remote(retry.scid);
        self.spaces[SpaceId::Initial.index()].keys = Some(CryptoKeys::initial(retry.scid.as_bytes(), true)?);

        for space in [SpaceId::Initial, SpaceId::Data] {
            for packet in self.loss.drain_space(space) {
                if packet.in_flight {
                    self.cc.on_packets_discarded(packet.size as u64);
                }
                for frame in packet.frames {
                    self.requeue_frame(space, frame);
                }
            }
        }
        debug!(scid = %retry.scid, "processed retry");
        Ok(())
    }

    fn check_path_change(&mut self, now: Instant, from: SocketAddr) -> Result<()> {
        let local = self.paths.current().local;
        if self.side.is_client() || !self.paths.is_path_change(local, from) {
            return Ok(());
        }
        if !self.paths.migration_enabled() {
            debug!(%from, "ignoring peer address change, migration disabled");
            return Ok(());
        }
        let timeout = self.path_validation_timeout();
        self.paths.start_validation(local, from, now, timeout)?;
        Ok(())
    }

    fn process_frames(&mut self, now: Instant, from: SocketAddr, level: EncryptionLevel, payload: Bytes) -> Result<bool> {
        let mut ack_eliciting = false;
        for frame in FrameIter::new(payload) {
            let frame = frame?;
            if !frame.allowed_at(level) {
                return Err(Error::Protocol(format!(
                    "{} frame not allowed in {} packet",
                    frame.frame_type().name(),
                    level
                )));
            }
            ack_eliciting |= frame.is_ack_eliciting();
            self.process_frame(now, from, level, frame)?;
            if self.state.is_closing() {
                break;
            }
        }
        Ok(ack_eliciting)
    }

    fn process_frame(&mut self, now: Instant, from: SocketAddr, level: EncryptionLevel, frame: Frame) -> Result<()> {
        match frame {
            Frame::Padding(_) | Frame::Ping => {}
            Frame::Ack(ack) => self.on_ack_frame(now, level.space(), &ack)?,
            Frame::Crypto { offset, data } => self.on_crypto_frame(now, level, offset, data)?,
            Frame::Stream(frame) => self.on_stream_frame(frame)?,
            Frame::ResetStream {
                stream_id,
                error_code,
                final_size,
            } => {
                if let Some(stream) = self.streams.get_or_create_remote(stream_id)? {
                    let growth = stream.on_reset(error_code, final_size)?;
                    self.conn_flow.recv.record_received(growth)?;
                    self.events.push_back(Event::StreamReset {
                        id: stream_id,
                        code: error_code,
                    });
                }
                self.drain_incoming();
            }
            Frame::StopSending { stream_id, error_code } => {
                if let Some(stream) = self.streams.get_or_create_remote(stream_id)? {
                    stream.on_stop_sending(error_code)?;
                    if let Some(final_size) = stream.reset(error_code)? {
                        self.control.push_back(Frame::ResetStream {
                            stream_id,
                            error_code,
                            final_size,
                        });
                    }
                    self.events.push_back(Event::StreamStopped {
                        id: stream_id,
                        code: error_code,
                    });
                }
                self.drain_incoming();
            }
            Frame::NewToken(token) => {
                if !self.side.is_client() {
                    return Err(Error::Protocol("client sent NEW_TOKEN".to_string()));
                }
                self.new_token = Some(token);
            }
            Frame::MaxData(max) => {
                self.conn_flow.send.record_limit_update(max);
            }
            Frame::MaxStreamData { stream_id, max } => {
                if let Some(stream) = self.streams.get_or_create_remote(stream_id)? {
                    let send = stream.send_half_mut().ok_or_else(|| {
                        Error::StreamState(format!("MAX_STREAM_DATA for receive-only stream {}", stream_id))
                    })?;
                    send.credit.record_limit_update(max);
                }
                self.drain_incoming();
            }
            Frame::MaxStreams { bidi, max } => self.streams.on_max_streams(dir_of(bidi), max),
            Frame::DataBlocked(limit) => trace!(limit, "peer blocked on connection credit"),
            Frame::StreamDataBlocked { stream_id, limit } => {
                trace!(stream = %stream_id, limit, "peer blocked on stream credit")
            }
            Frame::StreamsBlocked { bidi, limit } => trace!(bidi, limit, "peer blocked on stream count"),
            Frame::NewConnectionId {
                sequence,
                retire_prior_to,
                cid,
                reset_token,
            } => {
                if self.cids.remote_cid().is_empty() {
                    return Err(Error::Protocol(
                        "NEW_CONNECTION_ID sent to a zero-length connection ID".to_string(),
                    ));
                }
                let limit = self.config.transport.active_connection_id_limit;
                self.cids
                    .on_new_connection_id(sequence, retire_prior_to, cid, reset_token, limit)?;
            }
            Frame::RetireConnectionId(sequence) => {
                self.cids.on_retire(sequence)?;
                let limit = self.peer_params.as_ref().map_or(2, |p| p.active_connection_id_limit);
                self.cids.issue(limit)?;
            }
            Frame::PathChallenge(data) => {
                let local = self.paths.current().local;
                self.paths.on_path_challenge(local, from, data);
            }
            Frame::PathResponse(data) => {
                if let Some(remote) = self.paths.on_path_response(data, now) {
                    self.events.push_back(Event::PathValidated(remote));
                }
            }
            Frame::ConnectionClose(close) => self.on_peer_close(now, close),
            Frame::HandshakeDone => {
                if !self.side.is_client() {
                    return Err(Error::Protocol("client sent HANDSHAKE_DONE".to_string()));
                }
                if !self.handshake_confirmed {
                    self.handshake_confirmed = true;
                    self.discard_space(SpaceId::Handshake);
                    debug!("handshake confirmed");
                }
            }
            Frame::Datagram(data) => {
                if self.config.transport.max_datagram_frame_size == 0 {
                    return Err(Error::Protocol("DATAGRAM frame without negotiated support".to_string()));
                }
                self.events.push_back(Event::DatagramReceived(data));
            }
        }
        Ok(())
    }

    fn drain_incoming(&mut self) {
        while let Some(id) = self.streams.accept() {
            self.events.push_back(Event::StreamOpened(id));
        }
    }

    fn on_stream_frame(&mut self, frame: StreamFrame) -> Result<()> {
        let id = frame.stream_id;
        let notify = !frame.data.is_empty() || frame.fin;
        let growth = match self.streams.get_or_create_remote(id)? {
            Some(stream) => stream.on_stream_frame(frame.offset, frame.data, frame.fin)?,
            None => return Ok(()),
        };
        self.conn_flow.recv.record_received(growth)?;
        self.drain_incoming();
        if notify {
            self.events.push_back(Event::StreamReadable(id));
        }
        Ok(())
    }

    fn on_crypto_frame(&mut self, now: Instant, level: EncryptionLevel, offset: u64, data: Bytes) -> Result<()> {
        let space = &mut self.spaces[level.space().index()];
        if space.discarded {
            return Ok(());
        }
        let end = offset + data.len() as u64;
        if end > space.crypto_recv.read_offset() + MAX_CRYPTO_BUFFER {
            return Err(Error::ConnectionClosed {
                code: TransportErrorCode::CryptoBufferExceeded.as_u64(),
                reason: format!("CRYPTO data at {} beyond buffer", end),
            });
        }
        space.crypto_recv.insert(offset, data, false)?;
        let mut contiguous = Vec::new();
        while let Some(chunk) = space.crypto_recv.read(usize::MAX) {
            contiguous.extend_from_slice(&chunk);
        }
        if contiguous.is_empty() {
            return Ok(());
        }
        trace!(level = ?level, len = contiguous.len(), "handshake data to TLS");
        self.tls.read_handshake(level, &contiguous)?;
        self.drive_tls(now)
    }

    fn on_ack_frame(&mut self, now: Instant, space: SpaceId, ack: &AckFrame) -> Result<()> {
        if ack.largest() >= self.spaces[space.index()].next_pn {
            return Err(Error::Protocol(format!(
                "ACK of unsent packet {} in {:?} space",
                ack.largest(),
                space
            )));
        }
        let ack_delay = if space == SpaceId::Data {
            let exponent = self.peer_params.as_ref().map_or(3, |p| p.ack_delay_exponent).min(20);
            Duration::from_micros(ack.delay.saturating_mul(1 << exponent))
        } else {
            Duration::ZERO
        };

        let outcome = self.loss.on_ack_received(
            space,
            ack,
            ack_delay,
            now,
            self.cc.rtt_mut(),
            self.handshake_confirmed,
        );
        for packet in &outcome.newly_acked {
            if packet.in_flight {
                self.cc.on_packet_acked(packet.size as u64, packet.time_sent);
            }
            if space == SpaceId::Data && self.key_update_pn.map_or(false, |first| packet.packet_number >= first) {
                self.key_update_acked = true;
            }
            for frame in &packet.frames {
                self.on_frame_acked(space, frame);
            }
        }
        if !outcome.newly_lost.is_empty() {
            self.on_packets_lost(now, space, outcome.newly_lost, outcome.persistent_congestion);
        }
        self.streams.cleanup_closed_streams();
        Ok(())
    }

    fn on_frame_acked(&mut self, space: SpaceId, frame: &Frame) {
        match frame {
            Frame::Crypto { offset, data } => {
                self.spaces[space.index()].crypto_send.on_ack(*offset, data.len(), false);
            }
            Frame::Stream(frame) => {
                if let Some(stream) = self.streams.get_mut(frame.stream_id) {
                    stream.on_data_acked(frame.offset, frame.data.len(), frame.fin);
                }
            }
            Frame::ResetStream { stream_id, .. } => {
                if let Some(stream) = self.streams.get_mut(*stream_id) {
                    stream.on_reset_acked();
                }
            }
            _ => {}
        }
    }

    fn on_packets_lost(&mut self, now: Instant, space: SpaceId, packets: Vec<SentPacket>, persistent: bool) {
        let lost_bytes: u64 = packets.iter().filter(|p| p.in_flight).map(|p| p.size as u64).sum();
        if let Some(largest_sent) = packets.iter().map(|p| p.time_sent).max() {
            if lost_bytes > 0 {
                self.cc
                    .on_packets_lost(lost_bytes, packets.len() as u64, largest_sent, now);
            }
        }
        if persistent {
            self.cc.on_persistent_congestion();
        }
        for packet in packets {
            trace!(space = ?space, pn = packet.packet_number, "packet lost");
            for frame in packet.frames {
                self.requeue_frame(space, frame);
            }
        }
    }

    /// Schedule the content of a lost frame for retransmission
    fn requeue_frame(&mut self, space: SpaceId, frame: Frame) {
        match frame {
            Frame::Crypto { offset, data } => {
                self.spaces[space.index()].crypto_send.on_lost(offset, data.len(), false);
            }
            Frame::Stream(frame) => {
                if let Some(send) = self.streams.get_mut(frame.stream_id).and_then(|s| s.send_half_mut()) {
                    send.buffer.on_lost(frame.offset, frame.data.len(), frame.fin);
                }
            }
            Frame::MaxData(_) => {
                self.control.push_back(Frame::MaxData(self.conn_flow.recv.limit()));
            }
            Frame::MaxStreamData { stream_id, .. } => {
                if let Some(recv) = self.streams.get(stream_id).and_then(|s| s.recv_half()) {
                    self.control.push_back(Frame::MaxStreamData {
                        stream_id,
                        max: recv.credit.limit(),
                    });
                }
            }
            Frame::ResetStream { .. }
            | Frame::StopSending { .. }
            | Frame::MaxStreams { .. }
            | Frame::DataBlocked(_)
            | Frame::StreamDataBlocked { .. }
            | Frame::StreamsBlocked { .. }
            | Frame::NewConnectionId { .. }
            | Frame::RetireConnectionId(_)
            | Frame::NewToken(_)
            | Frame::HandshakeDone => self.control.push_back(frame),
            Frame::Padding(_)
            | Frame::Ping
            | Frame::Ack(_)
            | Frame::PathChallenge(_)
            | Frame::PathResponse(_)
            | Frame::ConnectionClose(_)
            | Frame::Datagram(_) => {}
        }
    }

    fn on_peer_close(&mut self, now: Instant, close: ConnectionClose) {
        let reason = close.reason_str();
        debug!(code = close.error_code, %reason, application = close.application, "peer closed connection");
        self.events.push_back(Event::ConnectionClosed {
            code: close.error_code,
            reason,
            by_peer: true,
        });
        self.peer_closed = true;
        self.enter_closing(
            now,
            ConnectionClose::transport(TransportErrorCode::NoError.as_u64(), 0, ""),
        );
    }

    // ----- timers -----

    fn pto(&self) -> Duration {
        let rtt = self.cc.rtt();
        rtt.pto_base() + rtt.max_ack_delay()
    }

    fn close_period(&self) -> Duration {
        self.pto() * CLOSE_PTO_MULTIPLIER
    }

    fn path_validation_timeout(&self) -> Duration {
        self.pto() * CLOSE_PTO_MULTIPLIER
    }

    fn idle_deadline(&self) -> Option<Instant> {
        let timeout = self.idle_timeout?;
        Some(self.last_activity + timeout.max(self.pto() * CLOSE_PTO_MULTIPLIER))
    }

    /// Earliest instant at which [`Connection::on_timeout`] has work to do
    pub fn next_timeout(&self) -> Option<Instant> {
        match self.state {
            ConnectionState::Closed => None,
            ConnectionState::Closing | ConnectionState::Draining => self.close_deadline,
            _ => [
                self.loss.next_timeout(self.cc.rtt(), self.handshake_confirmed),
                self.idle_deadline(),
                self.paths.next_timeout(),
            ]
            .into_iter()
            .flatten()
            .min(),
        }
    }

    /// Run expired timers
    pub fn on_timeout(&mut self, now: Instant) {
        match self.state {
            ConnectionState::Closed => return,
            ConnectionState::Closing | ConnectionState::Draining => {
                if self.close_deadline.map_or(true, |deadline| deadline <= now) {
                    self.finish_close();
                }
                return;
            }
            _ => {}
        }

        if self.idle_deadline().map_or(false, |deadline| deadline <= now) {
            debug!(side = ?self.side, "idle timeout");
            self.events.push_back(Event::ConnectionClosed {
                code: TransportErrorCode::NoError.as_u64(),
                reason: "idle timeout".to_string(),
                by_peer: false,
            });
            self.finish_close();
            return;
        }

        for path in self.paths.check_timeouts(now) {
            self.events.push_back(Event::PathFailed(path.remote));
        }

        match self.loss.on_timeout(now, self.cc.rtt(), self.handshake_confirmed) {
            Some(LossTimeout::Lost {
                space,
                packets,
                persistent_congestion,
            }) => self.on_packets_lost(now, space, packets, persistent_congestion),
            Some(LossTimeout::Probe { space, .. }) => self.on_probe_timeout(space),
            None => {}
        }
    }

    fn on_probe_timeout(&mut self, space: SpaceId) {
        let idx = space.index();
        if self.spaces[idx].discarded {
            return;
        }
        self.spaces[idx].probes = 2;
        for frame in self.loss.unacked_frames(space) {
            match frame {
                Frame::Crypto { offset, data } => {
                    self.spaces[idx].crypto_send.on_lost(offset, data.len(), false);
                }
                Frame::Stream(frame) => {
                    if let Some(send) = self.streams.get_mut(frame.stream_id).and_then(|s| s.send_half_mut()) {
                        send.buffer.on_lost(frame.offset, frame.data.len(), frame.fin);
                    }
                }
                _ => {}
            }
        }
    }

    // ----- closing -----

    /// Close the connection with an application error code
    ///
    /// Stream buffers are released immediately; CONNECTION_CLOSE is sent
    /// by the next `poll_transmit` and repeated while closing.
    pub fn close(&mut self, now: Instant, code: u64, reason: &str) {
        debug!(code, reason, "closing connection");
        self.enter_closing(now, ConnectionClose::application(code, reason));
    }

    fn close_with_error(&mut self, now: Instant, err: Error) {
        let code = err.transport_code();
        let reason = err.to_string();
        warn!(side = ?self.side, %reason, code, "closing connection on error");
        self.events.push_back(Event::ConnectionClosed {
            code,
            reason: reason.clone(),
            by_peer: false,
        });
        self.enter_closing(now, ConnectionClose::transport(code, 0, &reason));
    }

    fn enter_closing(&mut self, now: Instant, frame: ConnectionClose) {
        if self.state.is_closing() {
            return;
        }
        self.close_frame = Some(frame);
        self.close_pending = true;
        self.close_deadline = Some(now + self.close_period());
        self.release_resources();
        self.set_state(ConnectionState::Closing);
    }

    fn release_resources(&mut self) {
        self.streams.clear();
        self.loss.clear();
        self.paths.clear();
        self.pending_probes.clear();
        self.control.clear();
        self.datagrams.clear();
        for space in &mut self.spaces {
            space.crypto_send.clear();
            space.crypto_recv.clear();
            space.ack_pending = false;
            space.probes = 0;
        }
    }

    fn finish_close(&mut self) {
        self.release_resources();
        for space in &mut self.spaces {
            space.keys = None;
        }
        self.zero_rtt_keys = None;
        self.prev_remote = None;
        self.set_state(ConnectionState::Closed);
        self.events.push_back(Event::Closed);
    }

    // ----- application API -----

    /// Next pending event
    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Open a locally initiated stream
    pub fn open_stream(&mut self, dir: Dir) -> Result<StreamId> {
        self.ensure_open()?;
        if !self.handshake_complete && self.early.status() != EarlyDataStatus::Pending {
            return Err(Error::InvalidState("handshake not complete".to_string()));
        }
        match self.streams.open(dir) {
            Ok(id) => Ok(id),
            Err(err) => {
                self.control.push_back(Frame::StreamsBlocked {
                    bidi: dir == Dir::Bidi,
                    limit: self.streams.local_limit(dir),
                });
                Err(err)
            }
        }
    }

    /// Queue data on a stream
    ///
    /// Returns how many bytes were accepted, limited by the stream and
    /// connection send credit; `Error::Blocked` when none fit.
    pub fn stream_send(&mut self, id: StreamId, data: &[u8]) -> Result<usize> {
        self.ensure_open()?;
        let buffered: u64 = self
            .streams
            .iter()
            .filter_map(|(_, s)| s.send_half())
            .map(|s| s.buffer.pending_fresh())
            .sum();
        let conn_room = self.conn_flow.send.available().saturating_sub(buffered);

        let stream = self.streams.get_mut(id).ok_or(Error::StreamNotFound(id.as_u64()))?;
        let send = stream
            .send_half()
            .ok_or_else(|| Error::StreamState(format!("stream {} has no send side", id)))?;
        let stream_room = send.credit.available().saturating_sub(send.buffer.pending_fresh());

        let n = data.len().min(stream_room.min(conn_room) as usize);
        if n == 0 && !data.is_empty() {
            trace!(stream = %id, stream_room, conn_room, "stream send blocked");
            return Err(Error::Blocked);
        }
        stream.write(Bytes::copy_from_slice(&data[..n]))?;
        Ok(n)
    }

    /// Read up to `max` contiguous bytes from a stream
    ///
    /// `Ok(None)` means no data yet; an empty chunk with `fin` marks the
    /// end of the stream.
    pub fn stream_recv(&mut self, id: StreamId, max: usize) -> Result<Option<(Bytes, bool)>> {
        self.ensure_open()?;
        let stream = self.streams.get_mut(id).ok_or(Error::StreamNotFound(id.as_u64()))?;
        let result = stream.read(max);
        if let Ok(Some((chunk, _))) = &result {
            self.conn_flow.recv.record_consumed(chunk.len() as u64);
        }
        self.streams.cleanup_closed_streams();
        result
    }

    /// Finish the send side of a stream
    pub fn stream_finish(&mut self, id: StreamId) -> Result<()> {
        self.ensure_open()?;
        self.streams
            .get_mut(id)
            .ok_or(Error::StreamNotFound(id.as_u64()))?
            .finish()
    }

    /// Abandon the send side of a stream with RESET_STREAM
    pub fn reset_stream(&mut self, id: StreamId, code: u64) -> Result<()> {
        self.ensure_open()?;
        let stream = self.streams.get_mut(id).ok_or(Error::StreamNotFound(id.as_u64()))?;
        if let Some(final_size) = stream.reset(code)? {
            self.control.push_back(Frame::ResetStream {
                stream_id: id,
                error_code: code,
                final_size,
            });
        }
        Ok(())
    }

    /// Ask the peer to stop sending on a stream
    pub fn stop_sending(&mut self, id: StreamId, code: u64) -> Result<()> {
        self.ensure_open()?;
        self.streams
            .get_mut(id)
            .ok_or(Error::StreamNotFound(id.as_u64()))?
            .stop_sending(code)
    }

    /// Queue an unreliable DATAGRAM frame
    pub fn send_datagram(&mut self, data: Bytes) -> Result<()> {
        self.ensure_open()?;
        let peer_max = self.peer_params.as_ref().map_or(0, |p| p.max_datagram_frame_size);
        if peer_max == 0 {
            return Err(Error::InvalidState("peer does not accept DATAGRAM frames".to_string()));
        }
        let frame_size = 1 + varint::encoded_len(data.len() as u64) + data.len();
        let room = self.max_datagram_size() - self.header_overhead(EncryptionLevel::OneRtt) - TAG_LEN;
        if frame_size as u64 > peer_max || frame_size > room {
            return Err(Error::InvalidState(format!("datagram of {} bytes too large", data.len())));
        }
        self.datagrams.push_back(data);
        Ok(())
    }

    /// Move the connection to a new local address (client)
    ///
    /// Switches to a spare peer connection ID when one is available and
    /// starts validating the new path; the path becomes primary when the
    /// peer's PATH_RESPONSE arrives.
    pub fn migrate(&mut self, now: Instant, new_local: SocketAddr) -> Result<()> {
        self.ensure_open()?;
        if !self.side.is_client() {
            return Err(Error::InvalidState("only clients initiate migration".to_string()));
        }
        if self.state != ConnectionState::Active {
            return Err(Error::InvalidState(format!("cannot migrate in state {}", self.state)));
        }
        let remote = self.paths.current().remote;
        let timeout = self.path_validation_timeout();
        self.paths.start_validation(new_local, remote, now, timeout)?;
        if !self.cids.rotate() {
            debug!("no spare connection ID, migrating with the current one");
        }
        Ok(())
    }

    /// Start a 1-RTT key update (RFC 9001 Section 6)
    pub fn initiate_key_update(&mut self) -> Result<()> {
        self.ensure_open()?;
        if !self.handshake_confirmed {
            return Err(Error::InvalidState("key update before handshake confirmation".to_string()));
        }
        if self.key_update_pn.is_some() && !self.key_update_acked {
            return Err(Error::InvalidState(
                "previous key update not yet acknowledged".to_string(),
            ));
        }
        let data = SpaceId::Data.index();
        let keys = self.spaces[data]
            .keys
            .as_ref()
            .ok_or_else(|| Error::KeysUnavailable("1-RTT".to_string()))?;
        let next = keys.next_generation()?;
        let old = self.spaces[data].keys.replace(next);
        self.prev_remote = old.map(|k| k.remote);
        self.key_phase = !self.key_phase;
        self.recv_phase_start = None;
        self.key_update_pn = Some(self.spaces[data].next_pn);
        self.key_update_acked = false;
        self.stats.key_updates += 1;
        debug!(key_phase = self.key_phase, "initiated key update");
        Ok(())
    }

    // ----- sending -----

    fn max_datagram_size(&self) -> usize {
        let peer = self
            .peer_params
            .as_ref()
            .map_or(u64::MAX, |p| p.max_udp_payload_size);
        self.config.max_datagram_size.min(peer.min(usize::MAX as u64) as usize)
    }

    fn amplification_allowance(&self) -> Option<usize> {
        if self.side.is_client() || self.address_validated {
            return None;
        }
        Some((self.unvalidated_received * AMPLIFICATION_FACTOR).saturating_sub(self.unvalidated_sent) as usize)
    }

    fn send_level(&self, space: SpaceId) -> Option<EncryptionLevel> {
        let has_keys = self.spaces[space.index()].keys.is_some();
        match space {
            SpaceId::Initial => has_keys.then_some(EncryptionLevel::Initial),
            SpaceId::Handshake => has_keys.then_some(EncryptionLevel::Handshake),
            SpaceId::Data if has_keys => Some(EncryptionLevel::OneRtt),
            SpaceId::Data => (self.side.is_client()
                && self.zero_rtt_keys.is_some()
                && self.early.status() == EarlyDataStatus::Pending)
                .then_some(EncryptionLevel::ZeroRtt),
        }
    }

    fn header_overhead(&self, level: EncryptionLevel) -> usize {
        let dcid = self.cids.remote_cid().len();
        match level {
            EncryptionLevel::OneRtt => 1 + dcid + 4,
            _ => {
                let token = if level == EncryptionLevel::Initial {
                    varint::encoded_len(self.retry_token.len() as u64) + self.retry_token.len()
                } else {
                    0
                };
                1 + 4 + 1 + dcid + 1 + self.cids.initial_local().len() + token + 2 + 4
            }
        }
    }

    fn packet_header(&self, level: EncryptionLevel, pn: u64, pn_len: usize) -> Header {
        match level {
            EncryptionLevel::OneRtt => Header::Short {
                dcid: self.cids.remote_cid(),
                spin: false,
                key_phase: self.key_phase,
                packet_number: pn,
                pn_len,
            },
            _ => Header::Long {
                packet_type: PacketType::for_level(level),
                version: VERSION_1,
                dcid: self.cids.remote_cid(),
                scid: self.cids.initial_local(),
                token: if level == EncryptionLevel::Initial && self.side.is_client() {
                    self.retry_token.clone()
                } else {
                    Bytes::new()
                },
                packet_number: pn,
                pn_len,
            },
        }
    }

    /// Next datagram to send, if any
    pub fn poll_transmit(&mut self, now: Instant) -> Option<Transmit> {
        match self.state {
            ConnectionState::Draining | ConnectionState::Closed => return None,
            ConnectionState::Closing => return self.transmit_close(now),
            _ => {}
        }
        let result = match self.transmit_probe(now) {
            Ok(Some(transmit)) => return Some(transmit),
            Ok(None) => self.transmit_datagram(now),
            Err(err) => Err(err),
        };
        match result {
            Ok(transmit) => transmit,
            Err(err) => {
                self.close_with_error(now, err);
                self.transmit_close(now)
            }
        }
    }

    fn transmit_probe(&mut self, now: Instant) -> Result<Option<Transmit>> {
        if self.spaces[SpaceId::Data.index()].keys.is_none() {
            return Ok(None);
        }
        self.pending_probes.extend(self.paths.take_probes());
        let Some(probe) = self.pending_probes.pop_front() else {
            return Ok(None);
        };
        let frame = if probe.response {
            Frame::PathResponse(probe.data)
        } else {
            Frame::PathChallenge(probe.data)
        };
        let mut datagram = Vec::with_capacity(MIN_INITIAL_SIZE);
        let target = MIN_INITIAL_SIZE.min(self.max_datagram_size());
        self.write_packet(now, EncryptionLevel::OneRtt, vec![frame], &mut datagram, Some(target))?;
        if let Some(path) = self.paths.find_mut(probe.local, probe.remote) {
            path.record_sent(datagram.len());
        }
        self.stats.bytes_sent += datagram.len() as u64;
        trace!(remote = %probe.remote, response = probe.response, "path probe sent");
        Ok(Some(Transmit {
            destination: probe.remote,
            source: probe.local,
            contents: datagram,
        }))
    }

    fn transmit_close(&mut self, now: Instant) -> Option<Transmit> {
        if !self.close_pending {
            return None;
        }
        self.close_pending = false;
        let mut frame = self.close_frame.clone()?;

        let level = if self.spaces[SpaceId::Data.index()].keys.is_some() {
            EncryptionLevel::OneRtt
        } else if self.spaces[SpaceId::Handshake.index()].keys.is_some() {
            EncryptionLevel::Handshake
        } else if self.spaces[SpaceId::Initial.index()].keys.is_some() {
            EncryptionLevel::Initial
        } else {
            return None;
        };
        if frame.application && level != EncryptionLevel::OneRtt {
            // Application closes are not allowed before 1-RTT
            frame = ConnectionClose::transport(TransportErrorCode::ApplicationError.as_u64(), 0, "");
        }
        let pad_to = (level == EncryptionLevel::Initial && self.side.is_client()).then_some(MIN_INITIAL_SIZE);

        let mut datagram = Vec::new();
        if let Err(err) = self.write_packet(now, level, vec![Frame::ConnectionClose(frame)], &mut datagram, pad_to) {
            warn!(%err, "failed to build CONNECTION_CLOSE");
            return None;
        }
        if self.peer_closed {
            self.set_state(ConnectionState::Draining);
        }
        self.stats.bytes_sent += datagram.len() as u64;
        let path = self.paths.current();
        Some(Transmit {
            destination: path.remote,
            source: path.local,
            contents: datagram,
        })
    }

    fn transmit_datagram(&mut self, now: Instant) -> Result<Option<Transmit>> {
        let mut limit = self.max_datagram_size();
        if let Some(allowance) = self.amplification_allowance() {
            limit = limit.min(allowance);
        }
        if limit < MIN_PACKET_ROOM {
            return Ok(None);
        }
        if self.spaces[SpaceId::Data.index()].keys.is_some() {
            self.queue_flow_updates(now);
        }

        let mut planned: Vec<(EncryptionLevel, Vec<Frame>)> = Vec::new();
        let mut used = 0;
        for space in SpaceId::ALL {
            let Some(level) = self.send_level(space) else {
                continue;
            };
            let overhead = self.header_overhead(level) + TAG_LEN;
            if used + overhead + MIN_PACKET_ROOM > limit {
                break;
            }
            let frames = self.collect_frames(now, space, level, limit - used - overhead)?;
            if frames.is_empty() {
                continue;
            }
            used += overhead + frames_len(&frames)?;
            planned.push((level, frames));
        }
        if planned.is_empty() {
            return Ok(None);
        }

        // Datagrams carrying ack-eliciting Initial packets are padded
        // (RFC 9000 Section 14.1)
        let pad = planned
            .iter()
            .any(|(level, frames)| *level == EncryptionLevel::Initial && frames.iter().any(Frame::is_ack_eliciting));
        let count = planned.len();
        let mut datagram = Vec::with_capacity(limit);
        let mut sent_handshake = false;
        for (i, (level, frames)) in planned.into_iter().enumerate() {
            let pad_to = (pad && i + 1 == count).then_some(MIN_INITIAL_SIZE.min(limit));
            sent_handshake |= level == EncryptionLevel::Handshake;
            self.write_packet(now, level, frames, &mut datagram, pad_to)?;
        }

        if self.state == ConnectionState::Initial {
            self.set_state(ConnectionState::Handshaking);
        }
        if self.side.is_client() && sent_handshake {
            self.discard_space(SpaceId::Initial);
        }
        if !self.address_validated {
            self.unvalidated_sent += datagram.len() as u64;
        }
        self.stats.bytes_sent += datagram.len() as u64;
        let path = self.paths.current_mut();
        path.record_sent(datagram.len());
        Ok(Some(Transmit {
            destination: path.remote,
            source: path.local,
            contents: datagram,
        }))
    }

    /// Queue MAX_* credit, STOP_SENDING and connection ID frames
    fn queue_flow_updates(&mut self, now: Instant) {
        let rtt = self.cc.rtt().smoothed();
        if let Some(max) = self.conn_flow.recv.should_update(now, rtt) {
            self.control.push_back(Frame::MaxData(max));
        }
        let mut ids: Vec<StreamId> = self.streams.iter().map(|(id, _)| *id).collect();
        ids.sort();
        for id in ids {
            let Some(recv) = self.streams.get_mut(id).and_then(|s| s.recv_half_mut()) else {
                continue;
            };
            if let Some(code) = recv.stop_sending.take() {
                self.control.push_back(Frame::StopSending {
                    stream_id: id,
                    error_code: code,
                });
            }
            if recv.buffer.final_size().is_none() {
                if let Some(max) = recv.credit.should_update(now, rtt) {
                    self.control.push_back(Frame::MaxStreamData { stream_id: id, max });
                }
            }
        }
        for (bidi, max) in self.streams.take_max_streams_updates() {
            self.control.push_back(Frame::MaxStreams { bidi, max });
        }
        for issued in self.cids.take_new() {
            self.control.push_back(Frame::NewConnectionId {
                sequence: issued.sequence,
                retire_prior_to: 0,
                cid: issued.cid,
                reset_token: issued.reset_token,
            });
        }
        for sequence in self.cids.take_retired() {
            self.control.push_back(Frame::RetireConnectionId(sequence));
        }
    }

    fn collect_frames(&mut self, now: Instant, space: SpaceId, level: EncryptionLevel, budget: usize) -> Result<Vec<Frame>> {
        let idx = space.index();
        let mut frames = Vec::new();
        let mut remaining = budget;
        let probing = self.spaces[idx].probes > 0;

        if level != EncryptionLevel::ZeroRtt && self.spaces[idx].ack_pending {
            let exponent = if space == SpaceId::Data {
                self.config.transport.ack_delay_exponent
            } else {
                0
            };
            if let Some(ack) = self.spaces[idx].ack_frame(now, exponent) {
                let frame = Frame::Ack(ack);
                let len = frame_len(&frame)?;
                if len <= remaining {
                    remaining -= len;
                    frames.push(frame);
                    self.spaces[idx].ack_pending = false;
                }
            }
        }

        if !probing && self.cc.available() == 0 {
            return Ok(frames);
        }

        if level != EncryptionLevel::ZeroRtt {
            while remaining > CRYPTO_FRAME_OVERHEAD {
                let Some(chunk) = self.spaces[idx]
                    .crypto_send
                    .next_chunk(remaining - CRYPTO_FRAME_OVERHEAD, u64::MAX)
                else {
                    break;
                };
                let frame = Frame::Crypto {
                    offset: chunk.offset,
                    data: chunk.data,
                };
                remaining = remaining.saturating_sub(frame_len(&frame)?);
                frames.push(frame);
            }
        }

        if space == SpaceId::Data {
            if level == EncryptionLevel::OneRtt {
                while let Some(frame) = self.control.front() {
                    let len = frame_len(frame)?;
                    if len > remaining {
                        break;
                    }
                    remaining -= len;
                    frames.extend(self.control.pop_front());
                }
            }
            while let Some(data) = self.datagrams.front() {
                let frame = Frame::Datagram(data.clone());
                let len = frame_len(&frame)?;
                if len > remaining {
                    break;
                }
                remaining -= len;
                self.datagrams.pop_front();
                frames.push(frame);
            }
            self.collect_stream_frames(level, &mut frames, &mut remaining)?;
        }

        if probing {
            if !frames.iter().any(Frame::is_ack_eliciting) && remaining > 0 {
                frames.push(Frame::Ping);
            }
            self.spaces[idx].probes -= 1;
        }
        Ok(frames)
    }

    fn collect_stream_frames(&mut self, level: EncryptionLevel, frames: &mut Vec<Frame>, remaining: &mut usize) -> Result<()> {
        let mut ids: Vec<StreamId> = self
            .streams
            .iter()
            .filter(|(_, s)| s.send_half().map_or(false, |h| h.buffer.has_pending()))
            .map(|(id, _)| *id)
            .collect();
        ids.sort();

        for id in ids {
            loop {
                let Some(send) = self.streams.get_mut(id).and_then(|s| s.send_half_mut()) else {
                    break;
                };
                let overhead = StreamFrame::max_overhead(id, send.buffer.write_offset());
                if *remaining <= overhead {
                    return Ok(());
                }
                let mut allowance = send.credit.available().min(self.conn_flow.send.available());
                if level == EncryptionLevel::ZeroRtt {
                    allowance = allowance.min(self.early.remaining());
                }
                let Some(chunk) = send.buffer.next_chunk(*remaining - overhead, allowance) else {
                    if let Some(limit) = send.credit.take_blocked() {
                        self.control.push_back(Frame::StreamDataBlocked { stream_id: id, limit });
                    }
                    break;
                };
                let len = chunk.data.len() as u64;
                if chunk.fresh {
                    send.credit.record_sent(len)?;
                    send.max_sent = send.max_sent.max(chunk.offset + len);
                    self.conn_flow.send.record_sent(len)?;
                    if level == EncryptionLevel::ZeroRtt {
                        self.early.record_sent(len);
                    }
                }
                let frame = Frame::Stream(StreamFrame::new(id, chunk.offset, chunk.data, chunk.fin));
                *remaining = remaining.saturating_sub(frame_len(&frame)?);
                frames.push(frame);
            }
        }
        if let Some(limit) = self.conn_flow.send.take_blocked() {
            self.control.push_back(Frame::DataBlocked(limit));
        }
        Ok(())
    }

    /// Protect one packet and append it to `datagram`
    ///
    /// With `pad_to`, PADDING grows the datagram to that many bytes.
    fn write_packet(
        &mut self,
        now: Instant,
        level: EncryptionLevel,
        mut frames: Vec<Frame>,
        datagram: &mut Vec<u8>,
        pad_to: Option<usize>,
    ) -> Result<()> {
        let space = level.space();
        let idx = space.index();
        let pn = self.spaces[idx].next_pn;
        let pn_len = packet_number_len(pn, self.loss.largest_acked(space));
        let header = self.packet_header(level, pn, pn_len);

        let mut payload = Vec::new();
        for frame in &frames {
            frame.encode(&mut payload)?;
        }
        // Header protection samples 4 bytes past the packet number
        if pn_len + payload.len() < 4 {
            let n = 4 - pn_len - payload.len();
            payload.resize(payload.len() + n, 0);
        }
        if let Some(target) = pad_to {
            let mut scratch = Vec::new();
            let header_len = header.encode(&mut scratch, payload.len())? + pn_len;
            let size = datagram.len() + header_len + payload.len() + TAG_LEN;
            if size < target {
                payload.resize(payload.len() + target - size, 0);
            }
        }

        let mut packet = Vec::with_capacity(64 + payload.len());
        let pn_offset = header.encode(&mut packet, payload.len())?;
        packet.extend_from_slice(&payload);

        let keys = match level {
            EncryptionLevel::ZeroRtt => self.zero_rtt_keys.as_ref(),
            _ => self.spaces[idx].keys.as_ref().map(|k| &k.local),
        }
        .ok_or_else(|| Error::KeysUnavailable(format!("{} write keys", level)))?;
        let protected = protect_packet(keys, &packet, pn_offset, pn)?;
        let size = protected.len();
        datagram.extend_from_slice(&protected);
        self.spaces[idx].next_pn += 1;
        self.stats.packets_sent += 1;

        let ack_eliciting = frames.iter().any(Frame::is_ack_eliciting);
        if ack_eliciting && !self.state.is_closing() {
            self.cc.on_packet_sent(size as u64);
            frames.retain(|f| !matches!(f, Frame::Padding(_)));
            self.loss.on_packet_sent(
                space,
                SentPacket {
                    packet_number: pn,
                    time_sent: now,
                    size,
                    ack_eliciting,
                    in_flight: true,
                    frames,
                },
            );
        }
        trace!(level = ?level, pn, size, ack_eliciting, "packet sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_ack_range_merges() {
        let mut ranges = Vec::new();
        for pn in [0, 1, 2, 5, 7, 6] {
            insert_ack_range(&mut ranges, pn);
        }
        assert_eq!(ranges, vec![(5, 7), (0, 2)]);

        insert_ack_range(&mut ranges, 4);
        insert_ack_range(&mut ranges, 3);
        assert_eq!(ranges, vec![(0, 7)]);

        insert_ack_range(&mut ranges, 3);
        assert_eq!(ranges, vec![(0, 7)]);
    }

    #[test]
    fn test_insert_ack_range_out_of_order() {
        let mut ranges = Vec::new();
        for pn in [10, 2, 6] {
            insert_ack_range(&mut ranges, pn);
        }
        assert_eq!(ranges, vec![(10, 10), (6, 6), (2, 2)]);
    }

    #[test]
    fn test_ack_range_limit() {
        let mut ranges = Vec::new();
        for pn in (0..200).step_by(2) {
            insert_ack_range(&mut ranges, pn);
        }
        assert_eq!(ranges.len(), MAX_ACK_RANGES);
        assert_eq!(ranges[0], (198, 198));
    }

    #[test]
    fn test_packet_space_duplicates() {
        let now = Instant::now();
        let mut space = PacketSpace::new();
        space.on_packet_received(3, true, now);
        assert!(space.is_duplicate(3));
        assert!(!space.is_duplicate(4));
        assert!(space.ack_pending);

        let ack = space.ack_frame(now, 3).unwrap();
        assert_eq!(ack.largest(), 3);
        assert_eq!(ack.delay, 0);
    }

    #[test]
    fn test_negotiate_idle() {
        let a = Some(Duration::from_secs(30));
        let b = Some(Duration::from_secs(10));
        assert_eq!(negotiate_idle(a, b), b);
        assert_eq!(negotiate_idle(a, None), a);
        assert_eq!(negotiate_idle(None, None), None);
    }

    #[test]
    fn test_config_builder_validates() {
        assert!(ConnectionConfigBuilder::new().cid_len(21).build().is_err());
        assert!(ConnectionConfigBuilder::new().max_datagram_size(1000).build().is_err());

        let config = ConnectionConfigBuilder::new()
            .idle_timeout(Duration::from_secs(5))
            .server_name("example.com")
            .build()
            .unwrap();
        assert_eq!(config.transport.max_idle_timeout, 5000);
        assert_eq!(config.server_name.as_deref(), Some("example.com"));
    }

    #[test]
    fn test_version_negotiation_reply() {
        let mut datagram = vec![0xc0, 0x0a, 0x0a, 0x0a, 0x0a, 4, 1, 2, 3, 4, 2, 9, 9];
        datagram.resize(MIN_INITIAL_SIZE, 0);
        let reply = negotiate_version(&datagram).unwrap().unwrap();
        let vn = VersionNegotiation::decode(&reply).unwrap();
        assert_eq!(vn.dcid.as_bytes(), &[9, 9]);
        assert_eq!(vn.scid.as_bytes(), &[1, 2, 3, 4]);
        assert_eq!(vn.versions, vec![VERSION_1]);
    }

    #[test]
    fn test_state_names() {
        assert_eq!(ConnectionState::Draining.to_string(), "DRAINING");
        assert!(ConnectionState::Closing.is_closing());
        assert!(!ConnectionState::Active.is_closing());
    }
}
