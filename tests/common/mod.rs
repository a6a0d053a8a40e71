//! Shared fixtures for the integration tests
//!
//! `MockTls` plays a scripted TLS 1.3 exchange with the same flight
//! structure as the real protocol (ClientHello, ServerHello,
//! EncryptedExtensions + Finished, client Finished, NewSessionTicket) so
//! the transport can be driven end to end without certificates. Secrets
//! are derived from the ClientHello random, so both ends agree on them.

#![allow(dead_code)]

use openssl::sha::sha256;
use quicwire::h3::H3Connection;
use quicwire::quic::{
    CipherSuite, Connection, ConnectionConfig, EncryptionLevel, Error, ResumptionTicket, Result, Secrets, Side,
    TlsSession,
};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

const CLIENT_HELLO: u8 = 1;
const SERVER_HELLO: u8 = 2;
const NEW_SESSION_TICKET: u8 = 4;
const ENCRYPTED_EXTENSIONS: u8 = 8;
const FINISHED: u8 = 20;

/// Install a test subscriber once; `RUST_LOG` picks the level
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn client_addr() -> SocketAddr {
    "127.0.0.1:50000".parse().unwrap()
}

pub fn server_addr() -> SocketAddr {
    "127.0.0.1:4433".parse().unwrap()
}

fn derive(seed: &[u8], label: &[u8]) -> Vec<u8> {
    let mut input = label.to_vec();
    input.extend_from_slice(seed);
    sha256(&input).to_vec()
}

fn level_index(level: EncryptionLevel) -> usize {
    match level {
        EncryptionLevel::Initial => 0,
        EncryptionLevel::ZeroRtt => 1,
        EncryptionLevel::Handshake => 2,
        EncryptionLevel::OneRtt => 3,
    }
}

fn message(kind: u8, body: &[u8]) -> Vec<u8> {
    let mut out = vec![kind];
    out.extend_from_slice(&(body.len() as u16).to_be_bytes());
    out.extend_from_slice(body);
    out
}

/// Scripted TLS engine
pub struct MockTls {
    side: Side,
    random: Option<[u8; 32]>,
    local_params: Vec<u8>,
    peer_params: Option<Vec<u8>>,
    ticket: Option<Vec<u8>>,
    early_accepted: Option<bool>,
    early_rejected: bool,
    hello_sent: bool,
    server_flight_pending: bool,
    issue_tickets: bool,
    complete: bool,
    recv: [Vec<u8>; 4],
    out: VecDeque<(EncryptionLevel, Vec<u8>)>,
    secrets: VecDeque<Secrets>,
    tickets: VecDeque<ResumptionTicket>,
}

impl MockTls {
    fn new(side: Side, random: Option<[u8; 32]>) -> Self {
        MockTls {
            side,
            random,
            local_params: Vec::new(),
            peer_params: None,
            ticket: None,
            early_accepted: None,
            early_rejected: false,
            hello_sent: false,
            server_flight_pending: false,
            issue_tickets: true,
            complete: false,
            recv: Default::default(),
            out: VecDeque::new(),
            secrets: VecDeque::new(),
            tickets: VecDeque::new(),
        }
    }

    /// Client engine with a fresh random
    pub fn client() -> Box<dyn TlsSession> {
        let mut random = [0u8; 32];
        openssl::rand::rand_bytes(&mut random).unwrap();
        Box::new(Self::new(Side::Client, Some(random)))
    }

    /// Client engine with a fixed random, for replay tests
    pub fn client_with_random(random: [u8; 32]) -> Box<dyn TlsSession> {
        Box::new(Self::new(Side::Client, Some(random)))
    }

    /// Server engine that hands out a session ticket after the handshake
    pub fn server() -> Box<dyn TlsSession> {
        Box::new(Self::new(Side::Server, None))
    }

    fn handshake_random(&self) -> Result<[u8; 32]> {
        self.random
            .ok_or_else(|| Error::Protocol("handshake message before ClientHello".to_string()))
    }

    fn push_secrets(&mut self, level: EncryptionLevel, label: &[u8]) -> Result<()> {
        let random = self.handshake_random()?;
        let mut client_label = b"c ".to_vec();
        client_label.extend_from_slice(label);
        let mut server_label = b"s ".to_vec();
        server_label.extend_from_slice(label);
        self.secrets.push_back(Secrets::new(
            level,
            CipherSuite::Aes128GcmSha256,
            derive(&random, &client_label),
            derive(&random, &server_label),
        ));
        Ok(())
    }

    fn client_hello(&self) -> Result<Vec<u8>> {
        let random = self.handshake_random()?;
        let ticket = self.ticket.clone().unwrap_or_default();
        let mut body = random.to_vec();
        body.extend_from_slice(&(ticket.len() as u16).to_be_bytes());
        body.extend_from_slice(&ticket);
        body.extend_from_slice(&self.local_params);
        Ok(message(CLIENT_HELLO, &body))
    }

    fn on_message(&mut self, kind: u8, body: &[u8]) -> Result<()> {
        match (self.side, kind) {
            (Side::Server, CLIENT_HELLO) => {
                if body.len() < 34 {
                    return Err(Error::Protocol("short ClientHello".to_string()));
                }
                let mut random = [0u8; 32];
                random.copy_from_slice(&body[..32]);
                self.random = Some(random);
                let ticket_len = u16::from_be_bytes([body[32], body[33]]) as usize;
                let ticket = body
                    .get(34..34 + ticket_len)
                    .ok_or_else(|| Error::Protocol("short ticket".to_string()))?
                    .to_vec();
                self.peer_params = Some(body[34 + ticket_len..].to_vec());
                if !ticket.is_empty() {
                    self.secrets.push_back(Secrets::new(
                        EncryptionLevel::ZeroRtt,
                        CipherSuite::Aes128GcmSha256,
                        derive(&ticket, b"early"),
                        Vec::new(),
                    ));
                    self.ticket = Some(ticket);
                }
                self.push_secrets(EncryptionLevel::Handshake, b"hs")?;
                self.push_secrets(EncryptionLevel::OneRtt, b"ap")?;
                self.server_flight_pending = true;
            }
            (Side::Client, SERVER_HELLO) => {
                let accepted = body.first().copied().unwrap_or(0) == 1;
                self.early_accepted = Some(self.ticket.is_some() && accepted);
                self.push_secrets(EncryptionLevel::Handshake, b"hs")?;
            }
            (Side::Client, ENCRYPTED_EXTENSIONS) => {
                self.peer_params = Some(body.to_vec());
            }
            (Side::Client, FINISHED) => {
                self.push_secrets(EncryptionLevel::OneRtt, b"ap")?;
                self.out
                    .push_back((EncryptionLevel::Handshake, message(FINISHED, b"client")));
                self.complete = true;
            }
            (Side::Server, FINISHED) => {
                self.complete = true;
                if self.issue_tickets {
                    let random = self.handshake_random()?;
                    let mut ticket = b"ticket-".to_vec();
                    ticket.extend_from_slice(&random[..8]);
                    self.out
                        .push_back((EncryptionLevel::OneRtt, message(NEW_SESSION_TICKET, &ticket)));
                }
            }
            (Side::Client, NEW_SESSION_TICKET) => {
                self.tickets.push_back(ResumptionTicket {
                    ticket: body.to_vec(),
                    suite: CipherSuite::Aes128GcmSha256,
                    early_secret: derive(body, b"early"),
                    max_early_data: u32::MAX,
                });
            }
            (side, kind) => {
                return Err(Error::Protocol(format!("unexpected handshake message {} on {:?}", kind, side)));
            }
        }
        Ok(())
    }
}

impl TlsSession for MockTls {
    fn read_handshake(&mut self, level: EncryptionLevel, data: &[u8]) -> Result<()> {
        let index = level_index(level);
        self.recv[index].extend_from_slice(data);
        loop {
            let buf = &self.recv[index];
            if buf.len() < 3 {
                return Ok(());
            }
            let len = u16::from_be_bytes([buf[1], buf[2]]) as usize;
            if buf.len() < 3 + len {
                return Ok(());
            }
            let kind = buf[0];
            let body: Vec<u8> = self.recv[index].drain(..3 + len).skip(3).collect();
            self.on_message(kind, &body)?;
        }
    }

    fn write_handshake(&mut self) -> Option<(EncryptionLevel, Vec<u8>)> {
        if self.side == Side::Client && !self.hello_sent {
            self.hello_sent = true;
            if let Ok(hello) = self.client_hello() {
                return Some((EncryptionLevel::Initial, hello));
            }
        }
        if self.server_flight_pending {
            self.server_flight_pending = false;
            let accepted = self.ticket.is_some() && !self.early_rejected;
            self.early_accepted = Some(accepted);
            self.out
                .push_back((EncryptionLevel::Initial, message(SERVER_HELLO, &[accepted as u8])));
            let mut flight = message(ENCRYPTED_EXTENSIONS, &self.local_params);
            flight.extend_from_slice(&message(FINISHED, b"server"));
            self.out.push_back((EncryptionLevel::Handshake, flight));
        }
        self.out.pop_front()
    }

    fn take_secrets(&mut self) -> Option<Secrets> {
        self.secrets.pop_front()
    }

    fn is_handshake_complete(&self) -> bool {
        self.complete
    }

    fn set_transport_parameters(&mut self, encoded: &[u8]) {
        self.local_params = encoded.to_vec();
    }

    fn peer_transport_parameters(&self) -> Option<&[u8]> {
        self.peer_params.as_deref()
    }

    fn client_hello_random(&self) -> Option<&[u8]> {
        self.random.as_ref().map(|r| &r[..])
    }

    fn early_data_accepted(&self) -> Option<bool> {
        self.early_accepted
    }

    fn resume(&mut self, ticket: &[u8]) {
        self.ticket = Some(ticket.to_vec());
    }

    fn reject_early_data(&mut self) {
        self.early_rejected = true;
    }

    fn take_resumption_ticket(&mut self) -> Option<ResumptionTicket> {
        self.tickets.pop_front()
    }
}

/// Move every pending datagram between the two endpoints until both
/// go quiet, one millisecond per round; returns the final time
pub fn pump(client: &mut Connection, server: &mut Connection, mut now: Instant) -> Instant {
    for _ in 0..200 {
        let moved = exchange(client, server, now);
        if moved == 0 {
            break;
        }
        now += Duration::from_millis(1);
    }
    now
}

/// One round of delivery in both directions
pub fn exchange(client: &mut Connection, server: &mut Connection, now: Instant) -> usize {
    let mut moved = 0;
    while let Some(transmit) = client.poll_transmit(now) {
        server.handle_datagram(now, transmit.source, &transmit.contents);
        moved += 1;
    }
    while let Some(transmit) = server.poll_transmit(now) {
        client.handle_datagram(now, transmit.source, &transmit.contents);
        moved += 1;
    }
    moved
}

/// Deliver datagrams and fire due timers, advancing `step` per round,
/// until `done` holds; returns the final time
pub fn run_until(
    client: &mut Connection,
    server: &mut Connection,
    mut now: Instant,
    step: Duration,
    mut done: impl FnMut(&mut Connection, &mut Connection) -> bool,
) -> Instant {
    for _ in 0..5000 {
        if done(client, server) {
            return now;
        }
        for conn in [&mut *client, &mut *server] {
            if conn.next_timeout().map_or(false, |at| at <= now) {
                conn.on_timeout(now);
            }
        }
        exchange(client, server, now);
        now += step;
    }
    panic!("condition not reached");
}

/// Start a client and accept it on a server with the given configs,
/// without running the handshake past the first flight
pub fn start(
    client_config: ConnectionConfig,
    client_tls: Box<dyn TlsSession>,
    server_config: ConnectionConfig,
    now: Instant,
) -> (Connection, Connection) {
    let mut client = Connection::client(client_config, client_tls, client_addr(), server_addr(), now).unwrap();
    let first = client.poll_transmit(now).expect("client Initial");
    assert!(first.contents.len() >= 1200);
    let server = Connection::accept(
        server_config,
        MockTls::server(),
        server_addr(),
        first.source,
        &first.contents,
        now,
    )
    .unwrap();
    (client, server)
}

/// A pair of connections with the handshake completed
pub fn connected(
    client_config: ConnectionConfig,
    server_config: ConnectionConfig,
    now: Instant,
) -> (Connection, Connection, Instant) {
    let (mut client, mut server) = start(client_config, MockTls::client(), server_config, now);
    let now = pump(&mut client, &mut server, now);
    assert!(client.is_handshake_complete());
    assert!(server.is_handshake_complete());
    (client, server, now)
}

/// Drive two HTTP/3 endpoints until no datagrams move
///
/// Endpoints that are shutting down only exchange datagrams.
pub fn pump_h3(client: &mut H3Connection, server: &mut H3Connection, mut now: Instant) -> Instant {
    let step = |h3: &mut H3Connection, now: Instant| {
        if !h3.connection().state().is_closing() {
            h3.process(now).unwrap();
        }
    };
    let mut idle_rounds = 0;
    for _ in 0..200 {
        step(client, now);
        step(server, now);
        if exchange(client.connection_mut(), server.connection_mut(), now) == 0 {
            idle_rounds += 1;
            if idle_rounds == 2 {
                break;
            }
        } else {
            idle_rounds = 0;
        }
        now += Duration::from_millis(1);
    }
    now
}
