//! 0-RTT resumption support
//!
//! Session tickets are cached per server name by `SessionCache`, shared
//! across connections behind a `parking_lot` lock. Servers guard early
//! data with an `AntiReplayWindow` of recently seen ClientHello randoms.

use super::crypto::CipherSuite;
use super::error::{Error, Result};
use super::transport_params::TransportParameters;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Default number of ClientHello randoms remembered for replay detection
pub const DEFAULT_ANTI_REPLAY_WINDOW: usize = 1000;

/// Default session ticket retention
pub const DEFAULT_TICKET_LIFETIME: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Default session cache capacity
pub const DEFAULT_SESSION_CACHE_SIZE: usize = 100;

/// 0-RTT configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZeroRttConfig {
    /// Attempt (client) or accept (server) early data
    pub enabled: bool,
    pub anti_replay_window: usize,
    pub ticket_lifetime: Duration,
    pub session_cache_size: usize,
}

impl ZeroRttConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.anti_replay_window == 0 {
            return Err(Error::InvalidState("anti-replay window must be non-zero".to_string()));
        }
        if self.session_cache_size == 0 {
            return Err(Error::InvalidState("session cache size must be non-zero".to_string()));
        }
        Ok(())
    }
}

impl Default for ZeroRttConfig {
    fn default() -> Self {
        ZeroRttConfig {
            enabled: true,
            anti_replay_window: DEFAULT_ANTI_REPLAY_WINDOW,
            ticket_lifetime: DEFAULT_TICKET_LIFETIME,
            session_cache_size: DEFAULT_SESSION_CACHE_SIZE,
        }
    }
}

/// Resumption state saved from a previous connection
#[derive(Debug, Clone)]
pub struct SessionTicket {
    /// Opaque ticket from the TLS engine
    pub ticket: Vec<u8>,
    pub suite: CipherSuite,
    /// Client early traffic secret
    pub early_secret: Vec<u8>,
    /// Server transport parameters remembered for 0-RTT limits
    pub transport_params: TransportParameters,
    pub server_name: String,
    pub received_at: Instant,
    /// 0 means the ticket does not allow early data
    pub max_early_data: u32,
}

impl SessionTicket {
    /// Whether the ticket is older than `lifetime`
    pub fn is_expired(&self, now: Instant, lifetime: Duration) -> bool {
        now.saturating_duration_since(self.received_at) > lifetime
    }
}

#[derive(Debug, Default)]
struct CacheInner {
    tickets: HashMap<String, SessionTicket>,
    /// Insertion order for FIFO eviction
    order: VecDeque<String>,
}

/// Bounded FIFO cache of session tickets keyed by server name
#[derive(Debug)]
pub struct SessionCache {
    inner: RwLock<CacheInner>,
    capacity: usize,
    lifetime: Duration,
}

impl SessionCache {
    /// Create a cache
    pub fn new(capacity: usize, lifetime: Duration) -> Self {
        SessionCache {
            inner: RwLock::new(CacheInner::default()),
            capacity: capacity.max(1),
            lifetime,
        }
    }

    /// Create a cache from 0-RTT configuration
    pub fn from_config(config: &ZeroRttConfig) -> Self {
        Self::new(config.session_cache_size, config.ticket_lifetime)
    }

    /// Store a ticket, evicting the oldest entry when full
    pub fn put(&self, ticket: SessionTicket) {
        let mut inner = self.inner.write();
        let name = ticket.server_name.clone();
        if inner.tickets.contains_key(&name) {
            inner.order.retain(|n| n != &name);
        } else if inner.tickets.len() >= self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.tickets.remove(&oldest);
                debug!(server = %oldest, "evicted session ticket");
            }
        }
        inner.order.push_back(name.clone());
        inner.tickets.insert(name, ticket);
    }

    /// Fetch a usable ticket for `server_name`
    ///
    /// Expired tickets and tickets that do not allow early data are
    /// reported as missing.
    pub fn get(&self, server_name: &str, now: Instant) -> Result<SessionTicket> {
        let inner = self.inner.read();
        let ticket = inner.tickets.get(server_name).ok_or(Error::NoSessionTicket)?;
        if ticket.is_expired(now, self.lifetime) || ticket.max_early_data == 0 {
            return Err(Error::NoSessionTicket);
        }
        Ok(ticket.clone())
    }

    /// Remove a ticket (e.g. after the server rejected early data)
    pub fn remove(&self, server_name: &str) {
        let mut inner = self.inner.write();
        if inner.tickets.remove(server_name).is_some() {
            inner.order.retain(|n| n != server_name);
        }
    }

    /// Drop expired tickets
    pub fn purge_expired(&self, now: Instant) -> usize {
        let mut inner = self.inner.write();
        let lifetime = self.lifetime;
        let expired: Vec<String> = inner
            .tickets
            .iter()
            .filter(|(_, t)| t.is_expired(now, lifetime))
            .map(|(n, _)| n.clone())
            .collect();
        for name in &expired {
            inner.tickets.remove(name);
        }
        inner.order.retain(|n| !expired.contains(n));
        expired.len()
    }

    /// Number of cached tickets
    pub fn len(&self) -> usize {
        self.inner.read().tickets.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionCache {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_CACHE_SIZE, DEFAULT_TICKET_LIFETIME)
    }
}

#[derive(Debug, Default)]
struct ReplayInner {
    seen: HashSet<Vec<u8>>,
    order: VecDeque<Vec<u8>>,
}

/// Fixed-size window of ClientHello randoms that carried early data
#[derive(Debug)]
pub struct AntiReplayWindow {
    inner: Mutex<ReplayInner>,
    capacity: usize,
}

impl AntiReplayWindow {
    /// Create a window remembering `capacity` identifiers
    pub fn new(capacity: usize) -> Self {
        AntiReplayWindow {
            inner: Mutex::new(ReplayInner::default()),
            capacity: capacity.max(1),
        }
    }

    /// Whether `random` was already seen
    pub fn contains(&self, random: &[u8]) -> bool {
        self.inner.lock().seen.contains(random)
    }

    /// Record `random`, failing if it is a replay
    pub fn check_and_insert(&self, random: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.seen.contains(random) {
            warn!("replayed ClientHello with early data");
            return Err(Error::ReplayDetected);
        }
        if inner.order.len() >= self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.seen.remove(&oldest);
            }
        }
        inner.seen.insert(random.to_vec());
        inner.order.push_back(random.to_vec());
        Ok(())
    }

    /// Number of remembered identifiers
    pub fn len(&self) -> usize {
        self.inner.lock().order.len()
    }

    /// Whether nothing is remembered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AntiReplayWindow {
    fn default() -> Self {
        Self::new(DEFAULT_ANTI_REPLAY_WINDOW)
    }
}

/// Early data progress of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EarlyDataStatus {
    /// No 0-RTT attempted
    None,
    /// Early data being sent, outcome unknown
    Pending,
    Accepted,
    Rejected,
}

/// Per-connection early data bookkeeping
#[derive(Debug)]
pub struct EarlyData {
    status: EarlyDataStatus,
    sent: u64,
    limit: u64,
}

impl EarlyData {
    /// No early data
    pub fn disabled() -> Self {
        EarlyData {
            status: EarlyDataStatus::None,
            sent: 0,
            limit: 0,
        }
    }

    /// Early data allowed up to the ticket's limit
    pub fn from_ticket(ticket: &SessionTicket) -> Self {
        EarlyData {
            status: EarlyDataStatus::Pending,
            sent: 0,
            limit: ticket.max_early_data as u64,
        }
    }

    /// Early data offered by a client, as seen by the server
    pub fn offered() -> Self {
        EarlyData {
            status: EarlyDataStatus::Pending,
            sent: 0,
            limit: u64::MAX,
        }
    }

    /// Current status
    pub fn status(&self) -> EarlyDataStatus {
        self.status
    }

    /// Whether `n` more bytes of early data may be sent
    pub fn can_send(&self, n: u64) -> bool {
        self.status == EarlyDataStatus::Pending && self.sent + n <= self.limit
    }

    /// Account for early data sent
    pub fn record_sent(&mut self, n: u64) {
        self.sent += n;
    }

    /// Bytes of early data sent
    pub fn sent(&self) -> u64 {
        self.sent
    }

    /// Early data bytes still allowed
    pub fn remaining(&self) -> u64 {
        if self.status == EarlyDataStatus::Pending {
            self.limit.saturating_sub(self.sent)
        } else {
            0
        }
    }

    /// Server accepted early data
    pub fn accept(&mut self) {
        if self.status == EarlyDataStatus::Pending {
            self.status = EarlyDataStatus::Accepted;
        }
    }

    /// Server rejected early data; it must be resent as 1-RTT
    pub fn reject(&mut self) {
        if self.status == EarlyDataStatus::Pending {
            self.status = EarlyDataStatus::Rejected;
        }
    }
}
