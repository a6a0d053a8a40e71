//! Interface to the TLS 1.3 handshake engine
//!
//! The transport never parses TLS messages. It hands the engine the bytes
//! of each CRYPTO stream, collects the bytes the engine wants to send at
//! each encryption level, and installs the traffic secrets the engine
//! derives. Any engine that exposes a QUIC-style interface can sit behind
//! [`TlsSession`].

use super::crypto::{CipherSuite, EncryptionLevel};
use super::error::Result;
use std::fmt;

/// Traffic secrets for one encryption level
///
/// Secrets are named by the side that writes with them, so the same value
/// serves both endpoints. For 0-RTT only `client` is meaningful.
#[derive(Clone)]
pub struct Secrets {
    pub level: EncryptionLevel,
    pub suite: CipherSuite,
    pub client: Vec<u8>,
    pub server: Vec<u8>,
}

impl Secrets {
    /// Secrets for `level` written by both sides
    pub fn new(level: EncryptionLevel, suite: CipherSuite, client: Vec<u8>, server: Vec<u8>) -> Self {
        Secrets {
            level,
            suite,
            client,
            server,
        }
    }

    /// Secret this endpoint encrypts with
    pub fn local(&self, is_client: bool) -> &[u8] {
        if is_client {
            &self.client
        } else {
            &self.server
        }
    }

    /// Secret this endpoint decrypts with
    pub fn remote(&self, is_client: bool) -> &[u8] {
        self.local(!is_client)
    }
}

impl fmt::Debug for Secrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secrets")
            .field("level", &self.level)
            .field("suite", &self.suite)
            .finish_non_exhaustive()
    }
}

/// Resumption state handed out by the engine after a full handshake
#[derive(Clone)]
pub struct ResumptionTicket {
    /// Opaque ticket to present on the next connection
    pub ticket: Vec<u8>,
    pub suite: CipherSuite,
    /// Client early traffic secret for 0-RTT on resumption
    pub early_secret: Vec<u8>,
    /// Early data limit advertised by the server; 0 disables 0-RTT
    pub max_early_data: u32,
}

impl fmt::Debug for ResumptionTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResumptionTicket")
            .field("ticket_len", &self.ticket.len())
            .field("suite", &self.suite)
            .field("max_early_data", &self.max_early_data)
            .finish()
    }
}

/// A TLS 1.3 handshake driven over QUIC CRYPTO streams
pub trait TlsSession: Send {
    /// Feed handshake bytes received at `level`, in stream order
    fn read_handshake(&mut self, level: EncryptionLevel, data: &[u8]) -> Result<()>;

    /// Take the next batch of handshake bytes to send, with their level
    fn write_handshake(&mut self) -> Option<(EncryptionLevel, Vec<u8>)>;

    /// Take newly derived secrets, lowest level first
    fn take_secrets(&mut self) -> Option<Secrets>;

    /// Whether both Finished messages have been processed
    fn is_handshake_complete(&self) -> bool;

    /// Set the encoded transport parameters to carry in the handshake
    fn set_transport_parameters(&mut self, encoded: &[u8]);

    /// Encoded transport parameters received from the peer
    fn peer_transport_parameters(&self) -> Option<&[u8]>;

    /// Random field of the ClientHello, once known
    fn client_hello_random(&self) -> Option<&[u8]>;

    /// Whether the server accepted early data; `None` until known
    fn early_data_accepted(&self) -> Option<bool>;

    /// Offer a stored ticket for resumption, before the first write
    fn resume(&mut self, _ticket: &[u8]) {}

    /// Refuse early data offered by the client
    fn reject_early_data(&mut self) {}

    /// Take a ticket received after the handshake
    fn take_resumption_ticket(&mut self) -> Option<ResumptionTicket> {
        None
    }
}
