//! Network paths, path validation and connection ID management
//!
//! RFC 9000 Section 9 (migration) and Section 5.1 (connection IDs).
//!
//! A path is only ever promoted to primary after a PATH_RESPONSE echoing
//! our PATH_CHALLENGE arrives; an address change alone creates a
//! candidate and nothing more.

use super::crypto::random_bytes;
use super::error::{Error, Result};
use super::packet::ConnectionId;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Path validation state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathState {
    Unknown,
    Validating,
    Validated,
    Failed,
}

impl PathState {
    pub fn name(&self) -> &'static str {
        match self {
            PathState::Unknown => "Unknown",
            PathState::Validating => "Validating",
            PathState::Validated => "Validated",
            PathState::Failed => "Failed",
        }
    }
}

impl fmt::Display for PathState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A local/remote address pair
#[derive(Debug, Clone)]
pub struct NetworkPath {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub state: PathState,
    challenge: Option<[u8; 8]>,
    challenge_sent: Option<Instant>,
    deadline: Option<Instant>,
    /// Challenge waiting to be put in a packet
    challenge_pending: bool,
    pub rtt: Option<Duration>,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub validated_at: Option<Instant>,
}

impl NetworkPath {
    /// Create a path in the given state
    pub fn new(local: SocketAddr, remote: SocketAddr, state: PathState) -> Self {
        NetworkPath {
            local,
            remote,
            state,
            challenge: None,
            challenge_sent: None,
            deadline: None,
            challenge_pending: false,
            rtt: None,
            packets_sent: 0,
            packets_received: 0,
            bytes_sent: 0,
            bytes_received: 0,
            validated_at: None,
        }
    }

    /// Whether this path matches an address pair
    pub fn matches(&self, local: SocketAddr, remote: SocketAddr) -> bool {
        self.local == local && self.remote == remote
    }

    /// Record an outgoing datagram
    pub fn record_sent(&mut self, bytes: usize) {
        self.packets_sent += 1;
        self.bytes_sent += bytes as u64;
    }

    /// Record an incoming datagram
    pub fn record_received(&mut self, bytes: usize) {
        self.packets_received += 1;
        self.bytes_received += bytes as u64;
    }

    /// Challenge data in flight, if validating
    pub fn challenge(&self) -> Option<[u8; 8]> {
        self.challenge
    }
}

/// PATH_CHALLENGE or PATH_RESPONSE waiting to be sent on a path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathProbe {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub data: [u8; 8],
    pub response: bool,
}

/// Tracks the primary path and validation of candidates
#[derive(Debug)]
pub struct PathManager {
    current: NetworkPath,
    candidates: Vec<NetworkPath>,
    responses: VecDeque<PathProbe>,
    migration_enabled: bool,
}

impl PathManager {
    /// Create with an initial path
    ///
    /// The path the handshake runs over counts as validated.
    pub fn new(local: SocketAddr, remote: SocketAddr) -> Self {
        PathManager {
            current: NetworkPath::new(local, remote, PathState::Validated),
            candidates: Vec::new(),
            responses: VecDeque::new(),
            migration_enabled: true,
        }
    }

    /// Enable or disable migration
    pub fn set_migration_enabled(&mut self, enabled: bool) {
        self.migration_enabled = enabled;
    }

    /// Whether migration is enabled
    pub fn migration_enabled(&self) -> bool {
        self.migration_enabled
    }

    /// Primary path
    pub fn current(&self) -> &NetworkPath {
        &self.current
    }

    /// Mutable primary path
    pub fn current_mut(&mut self) -> &mut NetworkPath {
        &mut self.current
    }

    /// Candidate paths
    pub fn candidates(&self) -> &[NetworkPath] {
        &self.candidates
    }

    /// Whether a datagram from `remote` arrived off the primary path
    pub fn is_path_change(&self, local: SocketAddr, remote: SocketAddr) -> bool {
        !self.current.matches(local, remote)
    }

    /// Find a path by address pair
    pub fn find_mut(&mut self, local: SocketAddr, remote: SocketAddr) -> Option<&mut NetworkPath> {
        if self.current.matches(local, remote) {
            return Some(&mut self.current);
        }
        self.candidates.iter_mut().find(|p| p.matches(local, remote))
    }

    /// Start validating `local`/`remote`
    ///
    /// Returns the challenge data; an existing validation on the same pair
    /// is reused.
    pub fn start_validation(
        &mut self,
        local: SocketAddr,
        remote: SocketAddr,
        now: Instant,
        timeout: Duration,
    ) -> Result<[u8; 8]> {
        if !self.migration_enabled {
            return Err(Error::InvalidState("connection migration is disabled".to_string()));
        }
        if let Some(path) = self.candidates.iter().find(|p| p.matches(local, remote)) {
            if path.state == PathState::Validating {
                if let Some(challenge) = path.challenge {
                    return Ok(challenge);
                }
            }
        }

        let mut challenge = [0u8; 8];
        random_bytes(&mut challenge)?;

        self.candidates.retain(|p| !p.matches(local, remote));
        let mut path = NetworkPath::new(local, remote, PathState::Validating);
        path.challenge = Some(challenge);
        path.challenge_sent = Some(now);
        path.deadline = Some(now + timeout);
        path.challenge_pending = true;
        self.candidates.push(path);
        debug!(%local, %remote, "path validation started");
        Ok(challenge)
    }

    /// Queue a PATH_RESPONSE echoing `data` on the path it arrived on
    pub fn on_path_challenge(&mut self, local: SocketAddr, remote: SocketAddr, data: [u8; 8]) {
        self.responses.push_back(PathProbe {
            local,
            remote,
            data,
            response: true,
        });
    }

    /// Handle PATH_RESPONSE
    ///
    /// A match validates the candidate and promotes it to primary. Returns
    /// the new primary remote address on promotion.
    pub fn on_path_response(&mut self, data: [u8; 8], now: Instant) -> Option<SocketAddr> {
        let index = self
            .candidates
            .iter()
            .position(|p| p.state == PathState::Validating && p.challenge == Some(data))?;
        let mut path = self.candidates.remove(index);
        path.state = PathState::Validated;
        path.validated_at = Some(now);
        path.rtt = path.challenge_sent.map(|sent| now.saturating_duration_since(sent));
        path.challenge = None;
        path.deadline = None;
        path.challenge_pending = false;

        let remote = path.remote;
        let old = std::mem::replace(&mut self.current, path);
        debug!(local = %self.current.local, %remote, "path validated and promoted");
        self.candidates.push(old);
        Some(remote)
    }

    /// Probes to put on the wire
    pub fn take_probes(&mut self) -> Vec<PathProbe> {
        let mut probes: Vec<PathProbe> = self.responses.drain(..).collect();
        for path in &mut self.candidates {
            if path.challenge_pending {
                if let Some(data) = path.challenge {
                    path.challenge_pending = false;
                    probes.push(PathProbe {
                        local: path.local,
                        remote: path.remote,
                        data,
                        response: false,
                    });
                }
            }
        }
        probes
    }

    /// Whether any probe is waiting to be sent
    pub fn has_pending_probes(&self) -> bool {
        !self.responses.is_empty() || self.candidates.iter().any(|p| p.challenge_pending)
    }

    /// Earliest validation deadline
    pub fn next_timeout(&self) -> Option<Instant> {
        self.candidates.iter().filter_map(|p| p.deadline).min()
    }

    /// Fail candidates whose validation deadline passed
    pub fn check_timeouts(&mut self, now: Instant) -> Vec<NetworkPath> {
        let mut failed = Vec::new();
        let mut index = 0;
        while index < self.candidates.len() {
            let expired = self.candidates[index]
                .deadline
                .map_or(false, |deadline| deadline <= now);
            if expired {
                let mut path = self.candidates.remove(index);
                path.state = PathState::Failed;
                path.deadline = None;
                warn!(remote = %path.remote, "path validation failed");
                failed.push(path);
            } else {
                index += 1;
            }
        }
        failed
    }

    /// Drop every candidate
    pub fn clear(&mut self) {
        self.candidates.clear();
        self.responses.clear();
    }
}

/// A connection ID with its sequence number and reset token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IssuedConnectionId {
    pub sequence: u64,
    pub cid: ConnectionId,
    pub reset_token: [u8; 16],
}

/// Local and peer connection IDs
#[derive(Debug)]
pub struct ConnectionIdPool {
    cid_len: usize,
    /// IDs we issued that the peer may use to reach us
    local: Vec<IssuedConnectionId>,
    next_local_sequence: u64,
    /// IDs the peer issued for us to use, keyed by sequence
    remote: BTreeMap<u64, IssuedConnectionId>,
    active_remote: u64,
    retire_prior_to: u64,
    /// RETIRE_CONNECTION_ID frames to send
    pending_retire: VecDeque<u64>,
    /// NEW_CONNECTION_ID frames to send
    pending_new: VecDeque<IssuedConnectionId>,
}

impl ConnectionIdPool {
    /// Create with the handshake connection IDs (sequence 0 on both sides)
    pub fn new(local_cid: ConnectionId, remote_cid: ConnectionId) -> Self {
        let mut remote = BTreeMap::new();
        remote.insert(
            0,
            IssuedConnectionId {
                sequence: 0,
                cid: remote_cid,
                reset_token: [0; 16],
            },
        );
        ConnectionIdPool {
            cid_len: local_cid.len(),
            local: vec![IssuedConnectionId {
                sequence: 0,
                cid: local_cid,
                reset_token: [0; 16],
            }],
            next_local_sequence: 1,
            remote,
            active_remote: 0,
            retire_prior_to: 0,
            pending_retire: VecDeque::new(),
            pending_new: VecDeque::new(),
        }
    }

    /// Connection ID to put in outgoing packets
    pub fn remote_cid(&self) -> ConnectionId {
        self.remote
            .get(&self.active_remote)
            .map(|c| c.cid)
            .unwrap_or_default()
    }

    /// Replace the peer's handshake connection ID (server SCID, Retry)
    pub fn set_initial_remote(&mut self, cid: ConnectionId) {
        if let Some(entry) = self.remote.get_mut(&0) {
            entry.cid = cid;
        }
    }

    /// Whether `cid` is one of ours
    pub fn is_local(&self, cid: &ConnectionId) -> bool {
        self.local.iter().any(|c| &c.cid == cid)
    }

    /// Our handshake connection ID
    pub fn initial_local(&self) -> ConnectionId {
        self.local
            .iter()
            .find(|c| c.sequence == 0)
            .map_or_else(ConnectionId::empty, |c| c.cid)
    }

    /// Local connection ID length
    pub fn cid_len(&self) -> usize {
        self.cid_len
    }

    /// Issue new local IDs until the peer's limit is reached
    pub fn issue(&mut self, peer_limit: u64) -> Result<()> {
        if self.cid_len == 0 {
            return Ok(());
        }
        while (self.local.len() as u64) < peer_limit.min(8) {
            let cid = ConnectionId::random(self.cid_len)?;
            let mut reset_token = [0u8; 16];
            random_bytes(&mut reset_token)?;
            let issued = IssuedConnectionId {
                sequence: self.next_local_sequence,
                cid,
                reset_token,
            };
            self.next_local_sequence += 1;
            self.local.push(issued);
            self.pending_new.push_back(issued);
        }
        Ok(())
    }

    /// NEW_CONNECTION_ID frames to send
    pub fn take_new(&mut self) -> Vec<IssuedConnectionId> {
        self.pending_new.drain(..).collect()
    }

    /// RETIRE_CONNECTION_ID sequence numbers to send
    pub fn take_retired(&mut self) -> Vec<u64> {
        self.pending_retire.drain(..).collect()
    }

    /// Handle RETIRE_CONNECTION_ID from the peer
    pub fn on_retire(&mut self, sequence: u64) -> Result<()> {
        if sequence >= self.next_local_sequence {
            return Err(Error::Protocol(format!(
                "retired connection ID {} was never issued",
                sequence
            )));
        }
        self.local.retain(|c| c.sequence != sequence);
        Ok(())
    }

    /// Handle NEW_CONNECTION_ID from the peer
    pub fn on_new_connection_id(
        &mut self,
        sequence: u64,
        retire_prior_to: u64,
        cid: ConnectionId,
        reset_token: [u8; 16],
        active_limit: u64,
    ) -> Result<()> {
        if retire_prior_to > sequence {
            return Err(Error::FrameEncoding(format!(
                "retire_prior_to {} above sequence {}",
                retire_prior_to, sequence
            )));
        }
        if let Some(existing) = self.remote.get(&sequence) {
            if existing.cid != cid {
                return Err(Error::Protocol(format!(
                    "connection ID sequence {} reused with a different ID",
                    sequence
                )));
            }
            return Ok(());
        }
        if sequence < self.retire_prior_to {
            self.pending_retire.push_back(sequence);
            return Ok(());
        }

        self.remote.insert(
            sequence,
            IssuedConnectionId {
                sequence,
                cid,
                reset_token,
            },
        );

        if retire_prior_to > self.retire_prior_to {
            self.retire_prior_to = retire_prior_to;
            let retired: Vec<u64> = self.remote.range(..retire_prior_to).map(|(&s, _)| s).collect();
            for seq in retired {
                self.remote.remove(&seq);
                self.pending_retire.push_back(seq);
            }
            if self.active_remote < retire_prior_to {
                self.active_remote = self.remote.keys().next().copied().unwrap_or(sequence);
            }
        }

        if self.remote.len() as u64 > active_limit {
            return Err(Error::ConnectionIdLimit(format!(
                "peer provided {} connection IDs, limit {}",
                self.remote.len(),
                active_limit
            )));
        }
        Ok(())
    }

    /// Switch to an unused peer connection ID, retiring the current one
    ///
    /// Returns false when no spare ID is available.
    pub fn rotate(&mut self) -> bool {
        let next = self
            .remote
            .range(self.active_remote + 1..)
            .next()
            .map(|(&s, _)| s);
        match next {
            Some(seq) => {
                let old = self.active_remote;
                self.remote.remove(&old);
                self.pending_retire.push_back(old);
                self.active_remote = seq;
                debug!(sequence = seq, "rotated peer connection ID");
                true
            }
            None => false,
        }
    }

    /// Number of spare peer connection IDs
    pub fn spare_remote(&self) -> usize {
        self.remote.len().saturating_sub(1)
    }

    /// Whether `token` is a stateless reset token of the peer
    pub fn is_reset_token(&self, token: &[u8]) -> bool {
        if token.len() != 16 {
            return false;
        }
        self.remote
            .values()
            .any(|c| c.reset_token != [0; 16] && openssl::memcmp::eq(&c.reset_token, token))
    }

    /// Reset token the peer sent for sequence 0 in its transport parameters
    pub fn set_initial_reset_token(&mut self, token: [u8; 16]) {
        if let Some(entry) = self.remote.get_mut(&0) {
            entry.reset_token = token;
        }
    }
}
