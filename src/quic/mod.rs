//! QUIC transport (RFC 9000, RFC 9001, RFC 9002)
//!
//! This module implements a sans-I/O QUIC connection: a [`Connection`]
//! consumes UDP datagrams and timer expiries and produces datagrams to
//! send plus application [`Event`]s. Socket handling lives in
//! [`session`], the TLS 1.3 handshake behind the [`TlsSession`] trait.
//!
//! Building blocks, bottom up:
//!
//! - [`varint`]: variable-length integer codec
//! - [`packet`]: long/short headers, packet number encoding, Retry and
//!   Version Negotiation
//! - [`crypto`]: Initial secrets, packet and header protection, key update
//! - [`frames`]: the transport frame set
//! - [`transport_params`]: transport parameter negotiation
//! - [`stream`]: stream state machines and reassembly buffers
//! - [`flow_control`]: connection and stream credit
//! - [`congestion`]: NewReno and RTT estimation
//! - [`loss`]: loss detection and probe timeouts
//! - [`path`]: path validation and connection ID management
//! - [`zero_rtt`]: session tickets, anti-replay and early data tracking
//!
//! # Example
//!
//! ```no_run
//! use quicwire::quic::{Connection, ConnectionConfig, Dir, TlsSession};
//! use std::time::Instant;
//!
//! fn run(tls: Box<dyn TlsSession>) -> quicwire::quic::Result<()> {
//!     let local = "0.0.0.0:0".parse().unwrap();
//!     let remote = "192.0.2.1:443".parse().unwrap();
//!     let mut conn = Connection::client(ConnectionConfig::default(), tls, local, remote, Instant::now())?;
//!
//!     while let Some(transmit) = conn.poll_transmit(Instant::now()) {
//!         // send transmit.contents to transmit.destination
//!         let _ = transmit;
//!     }
//!
//!     // once the handshake completes:
//!     let id = conn.open_stream(Dir::Bidi)?;
//!     conn.stream_send(id, b"hello")?;
//!     conn.stream_finish(id)?;
//!     Ok(())
//! }
//! ```

pub mod congestion;
pub mod connection;
pub mod crypto;
pub mod error;
pub mod flow_control;
pub mod frames;
pub mod loss;
pub mod packet;
pub mod path;
pub mod session;
pub mod stream;
pub mod tls;
pub mod transport_params;
pub mod varint;
pub mod zero_rtt;

pub use congestion::{CongestionConfig, CongestionStats, NewReno, RttEstimator};
pub use connection::{
    Connection, ConnectionConfig, ConnectionConfigBuilder, ConnectionState, ConnectionStats, Event, Transmit,
};
pub use crypto::{CipherSuite, EncryptionLevel};
pub use error::{Error, Result, TransportErrorCode};
pub use flow_control::FlowControlConfig;
pub use frames::Frame;
pub use packet::{ConnectionId, SpaceId, VERSION_1};
pub use path::{PathManager, PathState};
pub use session::{DatagramOps, DatagramSession, UdpDatagramOps};
pub use stream::{Dir, Side, StreamId};
pub use tls::{ResumptionTicket, Secrets, TlsSession};
pub use transport_params::{TransportParameters, TransportParametersBuilder};
pub use zero_rtt::{AntiReplayWindow, EarlyDataStatus, SessionCache, SessionTicket, ZeroRttConfig};

use std::time::Duration;

/// Default per-stream receive window
pub const DEFAULT_MAX_STREAM_DATA: u64 = 1024 * 1024;

/// Default connection receive window
pub const DEFAULT_MAX_DATA: u64 = 10 * 1024 * 1024;

/// Default concurrent stream limits
pub const DEFAULT_MAX_STREAMS_BIDI: u64 = 100;
pub const DEFAULT_MAX_STREAMS_UNI: u64 = 100;

/// Default idle timeout
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Smallest datagram every path must carry
pub const DEFAULT_MAX_DATAGRAM_SIZE: usize = 1200;

/// Number of PTOs the closing and draining states last
pub const CLOSE_PTO_MULTIPLIER: u32 = 3;
