//! End-to-end checks of the transport building blocks

mod common;

use bytes::Bytes;
use common::{client_addr, init_tracing, start, MockTls};
use quicwire::h3::qpack::{Decoder, Encoder};
use quicwire::h3::HeaderField;
use quicwire::quic::congestion::CongestionPhase;
use quicwire::quic::crypto::{open_payload, protect_packet, unprotect_header, CryptoKeys};
use quicwire::quic::frames::{Frame, FrameIter};
use quicwire::quic::packet::{ConnectionId, Header, PacketType, PartialHeader, VERSION_1};
use quicwire::quic::stream::RecvBuffer;
use quicwire::quic::{varint, CongestionConfig, ConnectionConfig, ConnectionState, Event, NewReno};
use std::time::{Duration, Instant};

#[test]
fn test_varint_300_uses_two_bytes() {
    let encoded = varint::encode(300).unwrap();
    assert_eq!(encoded.len(), 2);
    assert_eq!(encoded[0] >> 6, 0b01);
    assert_eq!(encoded, vec![0x41, 0x2c]);
    assert_eq!(varint::decode(&encoded).unwrap(), (300, 2));
}

#[test]
fn test_padded_initial_packet_seal_and_open() {
    let dcid = ConnectionId::new(&[0x83, 0x94, 0xc8, 0xf0, 0x3e, 0x51, 0x57, 0x08]).unwrap();
    let client_keys = CryptoKeys::initial(dcid.as_bytes(), true).unwrap();
    let server_keys = CryptoKeys::initial(dcid.as_bytes(), false).unwrap();

    let header = Header::Long {
        packet_type: PacketType::Initial,
        version: VERSION_1,
        dcid,
        scid: ConnectionId::new(&[1, 2, 3, 4]).unwrap(),
        token: Bytes::new(),
        packet_number: 0,
        pn_len: 4,
    };
    // Nothing but PADDING, sized so the datagram reaches 1200 bytes
    let payload = vec![0u8; 1158];
    let mut packet = Vec::new();
    let pn_offset = header.encode(&mut packet, payload.len()).unwrap();
    packet.extend_from_slice(&payload);

    let sealed = protect_packet(&client_keys.local, &packet, pn_offset, 0).unwrap();
    assert_eq!(sealed.len(), 1200);

    let parsed = PartialHeader::parse(&sealed, 0).unwrap();
    assert_eq!(parsed.packet_type, PacketType::Initial);
    assert_eq!(parsed.dcid, dcid);
    assert_eq!(parsed.pn_offset, pn_offset);
    assert_eq!(parsed.len, sealed.len());

    let mut buf = sealed.clone();
    let (truncated, pn_len) = unprotect_header(&server_keys.remote.header, &mut buf, parsed.pn_offset).unwrap();
    assert_eq!((truncated, pn_len), (0, 4));
    let opened = open_payload(&server_keys.remote.packet, &buf, pn_offset + pn_len, 0).unwrap();
    assert_eq!(opened, payload);

    for frame in FrameIter::new(Bytes::from(opened)) {
        assert!(matches!(frame.unwrap(), Frame::Padding(_)));
    }

    // The client's own opening keys are the server's, so they must fail
    let mut wrong = sealed;
    let (_, pn_len) = unprotect_header(&client_keys.remote.header, &mut wrong, pn_offset).unwrap_or((0, 4));
    assert!(open_payload(&client_keys.remote.packet, &wrong, pn_offset + pn_len, 0).is_err());
}

#[test]
fn test_static_only_field_section() {
    let fields = vec![HeaderField::new(":method", "GET"), HeaderField::new(":path", "/")];
    let mut encoder = Encoder::new();
    let block = encoder.encode(0, &fields).unwrap();
    assert!(encoder.take_instructions().is_none());
    assert_eq!(encoder.table().insert_count(), 0);

    let mut decoder = Decoder::new(0, 0);
    let decoded = decoder.decode_section(0, &block).unwrap().unwrap();
    assert_eq!(decoded, fields);
    assert_eq!(decoder.table().insert_count(), 0);
    assert!(decoder.take_instructions().is_none());
}

#[test]
fn test_slow_start_then_loss_enters_recovery() {
    let config = CongestionConfig::default();
    let mut cc = NewReno::new(config, Duration::from_millis(25));
    let start = Instant::now();
    let size = config.max_datagram_size;

    let mut previous = cc.window();
    for i in 0..10 {
        let sent = start + Duration::from_millis(i);
        cc.on_packet_sent(size);
        cc.on_packet_acked(size, sent);
        assert!(cc.window() > previous, "window did not grow on ack {}", i);
        assert_eq!(cc.phase(), CongestionPhase::SlowStart);
        previous = cc.window();
    }

    cc.on_packet_sent(size);
    let lost_sent = start + Duration::from_millis(20);
    cc.on_packets_lost(size, 1, lost_sent, start + Duration::from_millis(30));
    assert_eq!(cc.window(), previous / 2);
    assert_eq!(cc.phase(), CongestionPhase::Recovery);
    assert!(cc.window() >= config.minimum_window());
}

#[test]
fn test_out_of_order_stream_data_with_fin() {
    let data: Vec<u8> = (0..1200u32).map(|i| (i % 251) as u8).collect();
    let data = Bytes::from(data);
    let mut buf = RecvBuffer::new();

    buf.insert(600, data.slice(600..), true).unwrap();
    assert_eq!(buf.readable(), 0);
    assert!(!buf.is_complete());
    assert!(buf.read(usize::MAX).is_none());
    assert_eq!(buf.final_size(), Some(1200));

    buf.insert(0, data.slice(..600), false).unwrap();
    assert!(buf.is_complete());
    assert_eq!(buf.readable(), 1200);

    let mut out = Vec::new();
    while let Some(chunk) = buf.read(usize::MAX) {
        out.extend_from_slice(&chunk);
    }
    assert_eq!(out.len(), 1200);
    assert_eq!(Bytes::from(out), data);
    assert!(buf.is_finished());
}

#[test]
fn test_close_during_handshake() {
    init_tracing();
    let now = Instant::now();
    let (mut client, mut server) = start(
        ConnectionConfig::default(),
        MockTls::client(),
        ConnectionConfig::default(),
        now,
    );
    while server.poll_event().is_some() {}
    assert!(!server.is_handshake_complete());

    client.close(now, 0x10, "giving up");
    assert_eq!(client.state(), ConnectionState::Closing);
    let close = client.poll_transmit(now).expect("CONNECTION_CLOSE datagram");
    assert!(client.poll_transmit(now).is_none());

    server.handle_datagram(now, client_addr(), &close.contents);
    assert_eq!(server.state(), ConnectionState::Closing);
    match server.poll_event() {
        Some(Event::ConnectionClosed { by_peer, .. }) => assert!(by_peer),
        other => panic!("expected close event, got {:?}", other),
    }
    assert!(server.open_stream(quicwire::quic::Dir::Bidi).is_err());

    // Same connection ID again: nothing new surfaces
    server.handle_datagram(now, client_addr(), &close.contents);
    assert!(server.poll_event().is_none());
    assert!(server.state().is_closing());
}
