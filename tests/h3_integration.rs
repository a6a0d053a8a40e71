//! HTTP/3 request/response exchange over in-memory QUIC connections

mod common;

use bytes::Bytes;
use common::{connected, init_tracing, pump_h3};
use quicwire::h3::{H3Config, H3Connection, H3ErrorCode, H3Event, HeaderField, SettingsBuilder};
use quicwire::quic::{ConnectionConfig, StreamId};
use std::time::Instant;

/// Collected view of what one side received
#[derive(Debug, Default)]
struct Received {
    settings: bool,
    headers: Vec<(StreamId, Vec<HeaderField>, bool)>,
    body: Vec<(StreamId, Bytes)>,
    finished: Vec<StreamId>,
    resets: Vec<(StreamId, u64)>,
    goaway: Option<u64>,
}

impl Received {
    fn drain(h3: &mut H3Connection) -> Self {
        let mut out = Received::default();
        while let Some(event) = h3.poll_event() {
            match event {
                H3Event::Settings(_) => out.settings = true,
                H3Event::Headers {
                    stream,
                    headers,
                    trailers,
                } => out.headers.push((stream, headers, trailers)),
                H3Event::Data { stream, data } => out.body.push((stream, data)),
                H3Event::Finished(stream) => out.finished.push(stream),
                H3Event::Reset { stream, code } => out.resets.push((stream, code)),
                H3Event::GoAway(id) => out.goaway = Some(id),
                H3Event::Stopped { .. } | H3Event::Transport(_) => {}
            }
        }
        out
    }

    fn body_of(&self, stream: StreamId) -> Vec<u8> {
        self.body
            .iter()
            .filter(|(s, _)| *s == stream)
            .flat_map(|(_, data)| data.iter().copied())
            .collect()
    }
}

fn h3_pair(client_config: H3Config, server_config: H3Config) -> (H3Connection, H3Connection, Instant) {
    init_tracing();
    let (client, server, now) = connected(ConnectionConfig::default(), ConnectionConfig::default(), Instant::now());
    let mut client = H3Connection::new(client, client_config).unwrap();
    let mut server = H3Connection::new(server, server_config).unwrap();
    let now = pump_h3(&mut client, &mut server, now);
    (client, server, now)
}

fn dynamic_config() -> H3Config {
    H3Config {
        settings: SettingsBuilder::new()
            .qpack_max_table_capacity(4096)
            .qpack_blocked_streams(16)
            .build()
            .unwrap(),
        encoder_table_capacity: 4096,
        ..H3Config::default()
    }
}

fn field(name: &str, value: &str) -> HeaderField {
    HeaderField::new(name, value)
}

#[test]
fn test_settings_exchanged() {
    let (mut client, mut server, _) = h3_pair(H3Config::default(), H3Config::default());
    assert!(Received::drain(&mut client).settings);
    assert!(Received::drain(&mut server).settings);
    assert!(client.peer_settings().is_some());
    assert!(server.peer_settings().is_some());
}

#[test]
fn test_get_request_and_response() {
    let (mut client, mut server, now) = h3_pair(H3Config::default(), H3Config::default());
    Received::drain(&mut client);
    Received::drain(&mut server);

    let stream = client
        .send_request("GET", "https", "example.com", "/index.html", &[field("user-agent", "quicwire-test")])
        .unwrap();
    client.finish(stream).unwrap();
    let now = pump_h3(&mut client, &mut server, now);

    let request = Received::drain(&mut server);
    assert_eq!(request.headers.len(), 1);
    let (id, headers, trailers) = &request.headers[0];
    assert_eq!(*id, stream);
    assert!(!trailers);
    assert_eq!(
        headers,
        &vec![
            field(":method", "GET"),
            field(":scheme", "https"),
            field(":authority", "example.com"),
            field(":path", "/index.html"),
            field("user-agent", "quicwire-test"),
        ]
    );
    assert_eq!(request.finished, vec![stream]);

    server
        .send_response(stream, 200, &[field("content-type", "text/plain")])
        .unwrap();
    server.send_body(stream, b"hello, world").unwrap();
    server.finish(stream).unwrap();
    pump_h3(&mut client, &mut server, now);

    let response = Received::drain(&mut client);
    assert_eq!(
        response.headers[0].1,
        vec![field(":status", "200"), field("content-type", "text/plain")]
    );
    assert_eq!(response.body_of(stream), b"hello, world");
    assert_eq!(response.finished, vec![stream]);
}

#[test]
fn test_post_with_large_body_and_trailers() {
    let config = H3Config {
        max_data_frame: 1000,
        ..H3Config::default()
    };
    let (mut client, mut server, now) = h3_pair(config.clone(), config);
    Received::drain(&mut server);

    let body: Vec<u8> = (0..20_000u32).map(|i| (i % 97) as u8).collect();
    let stream = client.send_request("POST", "https", "example.com", "/upload", &[]).unwrap();
    client.send_body(stream, &body).unwrap();
    client.send_trailers(stream, &[field("x-checksum", "abc")]).unwrap();
    pump_h3(&mut client, &mut server, now);

    let request = Received::drain(&mut server);
    assert_eq!(request.body_of(stream), body);
    assert!(request.body.len() >= 20);
    assert_eq!(request.headers.len(), 2);
    assert!(request.headers[1].2);
    assert_eq!(request.headers[1].1, vec![field("x-checksum", "abc")]);
    assert_eq!(request.finished, vec![stream]);
}

/// A frame of a reserved type (0x1f * N + 0x21) with a short payload
fn reserved_frame() -> Vec<u8> {
    let mut frame = vec![0x21, 0x04];
    frame.extend_from_slice(b"skip");
    frame
}

#[test]
fn test_reserved_frames_are_skipped() {
    let (mut client, mut server, now) = h3_pair(H3Config::default(), H3Config::default());
    Received::drain(&mut server);

    let control = client.control_stream().unwrap();
    client.connection_mut().stream_send(control, &reserved_frame()).unwrap();

    let stream = client.send_request("POST", "https", "example.com", "/grease", &[]).unwrap();
    client.connection_mut().stream_send(stream, &reserved_frame()).unwrap();
    client.send_body(stream, b"payload").unwrap();
    client.connection_mut().stream_send(stream, &reserved_frame()).unwrap();
    client.finish(stream).unwrap();
    let now = pump_h3(&mut client, &mut server, now);

    let request = Received::drain(&mut server);
    assert_eq!(request.headers.len(), 1);
    assert_eq!(request.body_of(stream), b"payload");
    assert_eq!(request.finished, vec![stream]);
    assert!(!server.connection().state().is_closing());

    server.send_response(stream, 200, &[]).unwrap();
    server.finish(stream).unwrap();
    pump_h3(&mut client, &mut server, now);
    let response = Received::drain(&mut client);
    assert_eq!(response.headers[0].1, vec![field(":status", "200")]);
    assert_eq!(response.finished, vec![stream]);
}

#[test]
fn test_body_before_headers_rejected() {
    let (mut client, _server, _) = h3_pair(H3Config::default(), H3Config::default());
    let stream = client.send_request("GET", "https", "example.com", "/", &[]).unwrap();
    client.finish(stream).unwrap();
    assert!(client.send_body(stream, b"late").is_err());
}

#[test]
fn test_server_cannot_send_requests() {
    let (_client, mut server, _) = h3_pair(H3Config::default(), H3Config::default());
    assert!(server.send_request("GET", "https", "example.com", "/", &[]).is_err());
}

#[test]
fn test_dynamic_table_requests() {
    let (mut client, mut server, mut now) = h3_pair(dynamic_config(), dynamic_config());
    Received::drain(&mut server);

    let custom = vec![
        field("x-session", "0123456789abcdef0123456789abcdef"),
        field("accept-language", "en-GB"),
        field("x-trace", "a"),
        field("x-trace", "a"),
    ];
    let mut streams = Vec::new();
    for path in ["/first", "/second", "/third"] {
        let stream = client.send_request("GET", "https", "example.com", path, &custom).unwrap();
        client.finish(stream).unwrap();
        streams.push((stream, path));
        now = pump_h3(&mut client, &mut server, now);
    }

    let requests = Received::drain(&mut server);
    assert_eq!(requests.headers.len(), 3);
    for ((stream, path), (id, headers, _)) in streams.iter().zip(&requests.headers) {
        assert_eq!(id, stream);
        let mut expected = vec![
            field(":method", "GET"),
            field(":scheme", "https"),
            field(":authority", "example.com"),
            field(":path", path),
        ];
        expected.extend(custom.iter().cloned());
        assert_eq!(headers, &expected);
    }

    // Responses reuse the server's own table
    for (stream, _) in &streams {
        server
            .send_response(*stream, 200, &[field("x-server", "quicwire"), field("cache-control", "private")])
            .unwrap();
        server.finish(*stream).unwrap();
    }
    pump_h3(&mut client, &mut server, now);
    let responses = Received::drain(&mut client);
    assert_eq!(responses.headers.len(), 3);
    for (_, headers, _) in &responses.headers {
        assert_eq!(headers[0], field(":status", "200"));
        assert_eq!(headers[1], field("x-server", "quicwire"));
    }
}

#[test]
fn test_oversized_field_fits_no_table() {
    let (mut client, mut server, now) = h3_pair(dynamic_config(), dynamic_config());
    Received::drain(&mut server);

    let huge = "v".repeat(8000);
    let stream = client
        .send_request("GET", "https", "example.com", "/", &[field("x-huge", &huge)])
        .unwrap();
    client.finish(stream).unwrap();
    pump_h3(&mut client, &mut server, now);

    let request = Received::drain(&mut server);
    assert_eq!(request.headers[0].1.last(), Some(&field("x-huge", &huge)));
}

#[test]
fn test_goaway_stops_new_requests() {
    let (mut client, mut server, now) = h3_pair(H3Config::default(), H3Config::default());
    let first = client.send_request("GET", "https", "example.com", "/", &[]).unwrap();
    client.finish(first).unwrap();
    let now = pump_h3(&mut client, &mut server, now);

    let id = server.send_goaway().unwrap();
    assert_eq!(id, first.as_u64() + 4);
    pump_h3(&mut client, &mut server, now);

    let events = Received::drain(&mut client);
    assert_eq!(events.goaway, Some(id));
    assert_eq!(client.goaway_received(), Some(id));
    assert!(client.send_request("GET", "https", "example.com", "/more", &[]).is_err());

    // The accepted request can still be answered
    server.send_response(first, 204, &[]).unwrap();
    server.finish(first).unwrap();
    // A second GOAWAY may only lower the ID
    assert_eq!(server.send_goaway().unwrap(), id);
}

#[test]
fn test_cancelled_request() {
    let (mut client, mut server, now) = h3_pair(H3Config::default(), H3Config::default());
    let stream = client.send_request("GET", "https", "example.com", "/slow", &[]).unwrap();
    client.finish(stream).unwrap();
    let now = pump_h3(&mut client, &mut server, now);
    Received::drain(&mut server);

    server.cancel(stream, H3ErrorCode::RequestCancelled).unwrap();
    pump_h3(&mut client, &mut server, now);

    let events = Received::drain(&mut client);
    assert!(events
        .resets
        .contains(&(stream, H3ErrorCode::RequestCancelled.as_u64())));
    // The connection itself stays usable
    assert!(client.send_request("GET", "https", "example.com", "/next", &[]).is_ok());
}

#[test]
fn test_close_with_h3_code() {
    let (mut client, mut server, now) = h3_pair(H3Config::default(), H3Config::default());
    Received::drain(&mut server);
    client.close(now, H3ErrorCode::NoError, "bye");
    pump_h3(&mut client, &mut server, now);

    let mut closed = None;
    while let Some(event) = server.connection_mut().poll_event() {
        if let quicwire::quic::Event::ConnectionClosed { code, .. } = event {
            closed = Some(code);
        }
    }
    assert_eq!(closed, Some(H3ErrorCode::NoError.as_u64()));
    assert!(server.connection().state().is_closing());
}
