//! Two in-memory endpoints driven through the handshake and beyond

mod common;

use bytes::Bytes;
use common::{client_addr, connected, exchange, init_tracing, pump, run_until, server_addr, start, MockTls};
use quicwire::quic::{
    AntiReplayWindow, Connection, ConnectionConfig, ConnectionConfigBuilder, ConnectionState, Dir, EarlyDataStatus,
    Error, Event, SessionCache, StreamId, TransportParametersBuilder,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn drain_events(conn: &mut Connection) -> Vec<Event> {
    std::iter::from_fn(|| conn.poll_event()).collect()
}

/// Read everything currently available; the flag reports FIN
fn read_all(conn: &mut Connection, id: StreamId) -> (Vec<u8>, bool) {
    let mut out = Vec::new();
    loop {
        match conn.stream_recv(id, usize::MAX) {
            Ok(Some((chunk, fin))) => {
                out.extend_from_slice(&chunk);
                if fin {
                    return (out, true);
                }
            }
            Ok(None) => return (out, false),
            Err(Error::StreamNotFound(_)) => return (out, true),
            Err(err) => panic!("stream read failed: {}", err),
        }
    }
}

fn resuming_config(cache: &Arc<SessionCache>) -> ConnectionConfig {
    ConnectionConfigBuilder::new()
        .server_name("example.com")
        .session_cache(cache.clone())
        .build()
        .unwrap()
}

fn replay_guarded_config(window: &Arc<AntiReplayWindow>) -> ConnectionConfig {
    ConnectionConfigBuilder::new().anti_replay(window.clone()).build().unwrap()
}

#[test]
fn test_handshake_completes() {
    init_tracing();
    let now = Instant::now();
    let (mut client, mut server, _) = connected(ConnectionConfig::default(), ConnectionConfig::default(), now);

    assert_eq!(client.state(), ConnectionState::Active);
    assert_eq!(server.state(), ConnectionState::Active);
    assert!(client.is_handshake_confirmed());
    assert!(server.is_handshake_confirmed());
    assert_eq!(client.remote_cid(), server.local_cid());
    assert_eq!(server.remote_cid(), client.local_cid());
    assert_eq!(server.remote_address(), client_addr());

    let params = client.peer_transport_parameters().unwrap();
    assert_eq!(params.initial_source_connection_id, Some(server.local_cid()));

    assert!(drain_events(&mut client)
        .iter()
        .any(|e| matches!(e, Event::HandshakeCompleted)));
    assert!(drain_events(&mut server)
        .iter()
        .any(|e| matches!(e, Event::HandshakeCompleted)));
    assert!(client.stats().packets_received > 0);
}

#[test]
fn test_stream_before_handshake_rejected() {
    let now = Instant::now();
    let mut client = Connection::client(
        ConnectionConfig::default(),
        MockTls::client(),
        client_addr(),
        server_addr(),
        now,
    )
    .unwrap();
    assert!(matches!(client.open_stream(Dir::Bidi), Err(Error::InvalidState(_))));
}

#[test]
fn test_accept_rejects_short_initial() {
    let now = Instant::now();
    let mut client = Connection::client(
        ConnectionConfig::default(),
        MockTls::client(),
        client_addr(),
        server_addr(),
        now,
    )
    .unwrap();
    let first = client.poll_transmit(now).unwrap();
    let truncated = &first.contents[..600];
    let result = Connection::accept(
        ConnectionConfig::default(),
        MockTls::server(),
        server_addr(),
        client_addr(),
        truncated,
        now,
    );
    assert!(result.is_err());
}

#[test]
fn test_bidirectional_stream_exchange() {
    init_tracing();
    let now = Instant::now();
    let (mut client, mut server, now) = connected(ConnectionConfig::default(), ConnectionConfig::default(), now);
    drain_events(&mut server);

    let id = client.open_stream(Dir::Bidi).unwrap();
    assert_eq!(id.as_u64(), 0);
    assert_eq!(client.stream_send(id, b"GET /index").unwrap(), 10);
    client.stream_finish(id).unwrap();
    let now = pump(&mut client, &mut server, now);

    assert!(drain_events(&mut server)
        .iter()
        .any(|e| matches!(e, Event::StreamOpened(s) if *s == id)));
    let (request, fin) = read_all(&mut server, id);
    assert_eq!(request, b"GET /index");
    assert!(fin);

    server.stream_send(id, b"hello back").unwrap();
    server.stream_finish(id).unwrap();
    pump(&mut client, &mut server, now);
    let (response, fin) = read_all(&mut client, id);
    assert_eq!(response, b"hello back");
    assert!(fin);
}

#[test]
fn test_large_transfer_is_reassembled() {
    let now = Instant::now();
    let (mut client, mut server, now) = connected(ConnectionConfig::default(), ConnectionConfig::default(), now);
    let body: Vec<u8> = (0..200_000u32).map(|i| (i % 253) as u8).collect();

    let id = client.open_stream(Dir::Uni).unwrap();
    let mut written = 0;
    while written < body.len() {
        written += client.stream_send(id, &body[written..]).unwrap();
    }
    client.stream_finish(id).unwrap();
    pump(&mut client, &mut server, now);

    let (received, fin) = read_all(&mut server, id);
    assert!(fin);
    assert_eq!(received.len(), body.len());
    assert_eq!(received, body);
    assert_eq!(client.stats().bytes_in_flight, 0);
}

/// Read whatever is available into `out`, remembering FIN in `fin`
fn collect(conn: &mut Connection, id: StreamId, out: &mut Vec<u8>, fin: &mut bool) -> bool {
    while !*fin {
        match conn.stream_recv(id, usize::MAX) {
            Ok(Some((chunk, done))) => {
                out.extend_from_slice(&chunk);
                *fin = done;
            }
            // Not readable yet, or not yet opened by the first frame
            Ok(None) | Err(_) => break,
        }
    }
    *fin
}

#[test]
fn test_dropped_stream_datagram_is_retransmitted() {
    init_tracing();
    let now = Instant::now();
    let (mut client, mut server, now) = connected(ConnectionConfig::default(), ConnectionConfig::default(), now);
    let body: Vec<u8> = (0..6000u32).map(|i| (i % 241) as u8).collect();

    let id = client.open_stream(Dir::Uni).unwrap();
    assert_eq!(client.stream_send(id, &body).unwrap(), body.len());
    client.stream_finish(id).unwrap();

    // Lose the first datagram, deliver the rest
    let dropped = client.poll_transmit(now).unwrap();
    assert!(dropped.contents.len() > 1000);
    let mut delivered = 0;
    while let Some(transmit) = client.poll_transmit(now) {
        server.handle_datagram(now, transmit.source, &transmit.contents);
        delivered += 1;
    }
    assert!(delivered >= 4);

    let mut received = Vec::new();
    let mut fin = false;
    run_until(&mut client, &mut server, now, Duration::from_millis(5), |_, s| {
        collect(s, id, &mut received, &mut fin)
    });
    assert_eq!(received, body);
    assert!(client.stats().packets_lost >= 1);
    assert_eq!(client.state(), ConnectionState::Active);
}

#[test]
fn test_lost_tail_is_resent_after_pto() {
    let now = Instant::now();
    let (mut client, mut server, now) = connected(ConnectionConfig::default(), ConnectionConfig::default(), now);

    let id = client.open_stream(Dir::Uni).unwrap();
    client.stream_send(id, b"tail").unwrap();
    client.stream_finish(id).unwrap();
    // Nothing follows the lost packet, so no ack can reveal the loss
    assert!(client.poll_transmit(now).is_some());
    assert!(client.poll_transmit(now).is_none());
    assert_eq!(client.stats().probe_timeouts, 0);

    let mut received = Vec::new();
    let mut fin = false;
    run_until(&mut client, &mut server, now, Duration::from_millis(5), |_, s| {
        collect(s, id, &mut received, &mut fin)
    });
    assert_eq!(received, b"tail");
    assert!(client.stats().probe_timeouts >= 1);
}

#[test]
fn test_dropped_handshake_flight_recovers() {
    init_tracing();
    let now = Instant::now();
    let (mut client, mut server) = start(
        ConnectionConfig::default(),
        MockTls::client(),
        ConnectionConfig::default(),
        now,
    );
    // The server's first flight carries its CRYPTO data
    let dropped = server.poll_transmit(now).unwrap();
    assert!(!dropped.contents.is_empty());

    run_until(&mut client, &mut server, now, Duration::from_millis(10), |c, s| {
        c.is_handshake_confirmed() && s.is_handshake_confirmed()
    });
    assert_eq!(client.state(), ConnectionState::Active);
    assert_eq!(server.state(), ConnectionState::Active);
    assert!(client.stats().probe_timeouts + server.stats().probe_timeouts >= 1);
}

#[test]
fn test_stream_credit_limits_send() {
    let now = Instant::now();
    let server_config = ConnectionConfigBuilder::new()
        .transport_parameters(
            TransportParametersBuilder::new()
                .initial_max_stream_data(1000)
                .build()
                .unwrap(),
        )
        .build()
        .unwrap();
    let (mut client, mut server, now) = connected(ConnectionConfig::default(), server_config, now);

    let id = client.open_stream(Dir::Bidi).unwrap();
    let data = vec![7u8; 5000];
    assert_eq!(client.stream_send(id, &data).unwrap(), 1000);
    assert!(matches!(client.stream_send(id, &data[1000..]), Err(Error::Blocked)));

    // Reading on the server returns credit
    let now = pump(&mut client, &mut server, now);
    let (first, _) = read_all(&mut server, id);
    assert_eq!(first.len(), 1000);
    pump(&mut client, &mut server, now);
    assert!(client.stream_send(id, &data[1000..]).unwrap() > 0);
}

#[test]
fn test_reset_and_stop_sending() {
    let now = Instant::now();
    let (mut client, mut server, now) = connected(ConnectionConfig::default(), ConnectionConfig::default(), now);
    drain_events(&mut client);
    drain_events(&mut server);

    let id = client.open_stream(Dir::Bidi).unwrap();
    client.stream_send(id, b"partial").unwrap();
    let now = pump(&mut client, &mut server, now);
    let (data, _) = read_all(&mut server, id);
    assert_eq!(data, b"partial");

    server.stop_sending(id, 9).unwrap();
    pump(&mut client, &mut server, now);
    assert!(drain_events(&mut client)
        .iter()
        .any(|e| matches!(e, Event::StreamStopped { id: s, code: 9 } if *s == id)));
    // The sender answers STOP_SENDING with RESET_STREAM
    assert!(drain_events(&mut server)
        .iter()
        .any(|e| matches!(e, Event::StreamReset { id: s, code: 9 } if *s == id)));

    // Other streams are unaffected
    let other = client.open_stream(Dir::Bidi).unwrap();
    assert!(client.stream_send(other, b"still fine").is_ok());
}

#[test]
fn test_unreliable_datagrams() {
    let now = Instant::now();
    let config = || {
        ConnectionConfigBuilder::new()
            .transport_parameters(
                TransportParametersBuilder::new()
                    .max_datagram_frame_size(1200)
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap()
    };
    let (mut client, mut server, now) = connected(config(), config(), now);
    drain_events(&mut server);

    client.send_datagram(Bytes::from_static(b"ping")).unwrap();
    assert!(client.send_datagram(Bytes::from(vec![0u8; 2000])).is_err());
    pump(&mut client, &mut server, now);
    let received: Vec<Bytes> = drain_events(&mut server)
        .into_iter()
        .filter_map(|e| match e {
            Event::DatagramReceived(data) => Some(data),
            _ => None,
        })
        .collect();
    assert_eq!(received, vec![Bytes::from_static(b"ping")]);
}

#[test]
fn test_datagrams_need_peer_support() {
    let now = Instant::now();
    let (mut client, _server, _) = connected(ConnectionConfig::default(), ConnectionConfig::default(), now);
    assert!(client.send_datagram(Bytes::from_static(b"ping")).is_err());
}

#[test]
fn test_application_close() {
    let now = Instant::now();
    let (mut client, mut server, now) = connected(ConnectionConfig::default(), ConnectionConfig::default(), now);
    drain_events(&mut server);

    client.close(now, 0x100, "done");
    assert_eq!(client.state(), ConnectionState::Closing);
    pump(&mut client, &mut server, now);

    let events = drain_events(&mut server);
    assert!(events.iter().any(|e| matches!(
        e,
        Event::ConnectionClosed { code: 0x100, by_peer: true, reason } if reason == "done"
    )));
    assert_eq!(server.state(), ConnectionState::Draining);

    // Both sides release everything after three probe timeouts
    let later = now + Duration::from_secs(10);
    client.on_timeout(later);
    server.on_timeout(later);
    assert!(client.is_closed());
    assert!(server.is_closed());
    assert!(client.next_timeout().is_none());
}

#[test]
fn test_idle_timeout_closes_silently() {
    let now = Instant::now();
    let config = || ConnectionConfigBuilder::new().idle_timeout(Duration::from_secs(5)).build().unwrap();
    let (mut client, _server, now) = connected(config(), config(), now);
    drain_events(&mut client);

    let deadline = client.next_timeout().unwrap();
    assert!(deadline > now);
    client.on_timeout(now + Duration::from_secs(60));
    assert!(client.is_closed());
    assert!(drain_events(&mut client).iter().any(|e| matches!(
        e,
        Event::ConnectionClosed { by_peer: false, .. }
    )));
    assert!(client.poll_transmit(now + Duration::from_secs(60)).is_none());
}

#[test]
fn test_key_update() {
    init_tracing();
    let now = Instant::now();
    let (mut client, mut server, now) = connected(ConnectionConfig::default(), ConnectionConfig::default(), now);
    assert!(!client.key_phase());

    client.initiate_key_update().unwrap();
    assert!(client.key_phase());
    // A second update waits for the first to be acknowledged
    assert!(client.initiate_key_update().is_err());

    let id = client.open_stream(Dir::Uni).unwrap();
    client.stream_send(id, b"after update").unwrap();
    client.stream_finish(id).unwrap();
    let now = pump(&mut client, &mut server, now);

    assert!(server.key_phase());
    assert_eq!(server.stats().key_updates, 1);
    let (data, fin) = read_all(&mut server, id);
    assert_eq!(data, b"after update");
    assert!(fin);

    // Acknowledged, so the next update is allowed
    client.initiate_key_update().unwrap();
    let id = client.open_stream(Dir::Uni).unwrap();
    client.stream_send(id, b"again").unwrap();
    pump(&mut client, &mut server, now);
    assert!(!server.key_phase());
    assert_eq!(client.stats().key_updates, 2);
}

#[test]
fn test_client_migration() {
    init_tracing();
    let now = Instant::now();
    let (mut client, mut server, now) = connected(ConnectionConfig::default(), ConnectionConfig::default(), now);
    drain_events(&mut client);
    drain_events(&mut server);

    let new_local: SocketAddr = "127.0.0.1:50001".parse().unwrap();
    client.migrate(now, new_local).unwrap();
    let now = pump(&mut client, &mut server, now);

    assert!(drain_events(&mut client)
        .iter()
        .any(|e| matches!(e, Event::PathValidated(addr) if *addr == server_addr())));
    assert_eq!(client.local_address(), new_local);
    assert_eq!(server.remote_address(), new_local);

    // Traffic keeps flowing on the new path
    let id = client.open_stream(Dir::Uni).unwrap();
    client.stream_send(id, b"moved").unwrap();
    client.stream_finish(id).unwrap();
    pump(&mut client, &mut server, now);
    let (data, _) = read_all(&mut server, id);
    assert_eq!(data, b"moved");
}

#[test]
fn test_server_cannot_migrate() {
    let now = Instant::now();
    let (_client, mut server, now) = connected(ConnectionConfig::default(), ConnectionConfig::default(), now);
    let addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();
    assert!(server.migrate(now, addr).is_err());
}

/// Full handshake that leaves a ticket for "example.com" in `cache`
fn prime_cache(cache: &Arc<SessionCache>, now: Instant) -> Instant {
    let (mut client, _server, now) = connected(resuming_config(cache), ConnectionConfig::default(), now);
    assert_eq!(client.early_data_status(), EarlyDataStatus::None);
    assert!(drain_events(&mut client)
        .iter()
        .any(|e| matches!(e, Event::SessionTicket(t) if t.server_name == "example.com")));
    assert_eq!(cache.len(), 1);
    now
}

/// Start a resumed connection that sends `payload` as 0-RTT data
fn start_with_early_data(
    client_config: ConnectionConfig,
    tls: Box<dyn quicwire::quic::TlsSession>,
    server_config: ConnectionConfig,
    payload: &[u8],
    now: Instant,
) -> (Connection, Connection, StreamId) {
    let mut client = Connection::client(client_config, tls, client_addr(), server_addr(), now).unwrap();
    assert_eq!(client.early_data_status(), EarlyDataStatus::Pending);
    let id = client.open_stream(Dir::Bidi).unwrap();
    client.stream_send(id, payload).unwrap();
    client.stream_finish(id).unwrap();

    let first = client.poll_transmit(now).unwrap();
    let mut server = Connection::accept(
        server_config,
        MockTls::server(),
        server_addr(),
        first.source,
        &first.contents,
        now,
    )
    .unwrap();
    exchange(&mut client, &mut server, now);
    (client, server, id)
}

#[test]
fn test_zero_rtt_resumption() {
    init_tracing();
    let cache = Arc::new(SessionCache::default());
    let now = prime_cache(&cache, Instant::now());

    let (mut client, mut server, id) = start_with_early_data(
        resuming_config(&cache),
        MockTls::client(),
        ConnectionConfig::default(),
        b"early request",
        now,
    );
    assert!(drain_events(&mut server)
        .iter()
        .any(|e| matches!(e, Event::EarlyDataAccepted)));
    assert_eq!(server.early_data_status(), EarlyDataStatus::Accepted);

    pump(&mut client, &mut server, now);
    assert_eq!(client.early_data_status(), EarlyDataStatus::Accepted);
    assert!(drain_events(&mut client)
        .iter()
        .any(|e| matches!(e, Event::EarlyDataAccepted)));
    let (data, fin) = read_all(&mut server, id);
    assert_eq!(data, b"early request");
    assert!(fin);
}

#[test]
fn test_replayed_client_hello_loses_early_data() {
    init_tracing();
    let cache = Arc::new(SessionCache::default());
    let window = Arc::new(AntiReplayWindow::new(16));
    let mut now = prime_cache(&cache, Instant::now());
    let random = [0x5a; 32];

    let (mut client, mut server, _) = start_with_early_data(
        resuming_config(&cache),
        MockTls::client_with_random(random),
        replay_guarded_config(&window),
        b"first",
        now,
    );
    now = pump(&mut client, &mut server, now);
    assert_eq!(server.early_data_status(), EarlyDataStatus::Accepted);
    assert_eq!(client.early_data_status(), EarlyDataStatus::Accepted);

    // Same ClientHello random again
    let (mut client, mut server, id) = start_with_early_data(
        resuming_config(&cache),
        MockTls::client_with_random(random),
        replay_guarded_config(&window),
        b"replayed",
        now,
    );
    assert!(drain_events(&mut server)
        .iter()
        .any(|e| matches!(e, Event::EarlyDataRejected(_))));
    assert_eq!(server.early_data_status(), EarlyDataStatus::Rejected);

    pump(&mut client, &mut server, now);
    assert!(client.is_handshake_complete());
    assert_eq!(client.early_data_status(), EarlyDataStatus::Rejected);
    assert!(drain_events(&mut client)
        .iter()
        .any(|e| matches!(e, Event::EarlyDataRejected(_))));

    // The data still arrives, resent under 1-RTT keys
    let (data, fin) = read_all(&mut server, id);
    assert_eq!(data, b"replayed");
    assert!(fin);
}

#[test]
fn test_zero_rtt_disabled_on_server() {
    let cache = Arc::new(SessionCache::default());
    let now = prime_cache(&cache, Instant::now());
    let mut server_config = ConnectionConfig::default();
    server_config.zero_rtt.enabled = false;

    let (mut client, mut server, id) =
        start_with_early_data(resuming_config(&cache), MockTls::client(), server_config, b"hi", now);
    pump(&mut client, &mut server, now);

    assert_eq!(client.early_data_status(), EarlyDataStatus::Rejected);
    let (data, _) = read_all(&mut server, id);
    assert_eq!(data, b"hi");
}
