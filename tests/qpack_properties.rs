//! Property tests for QPACK field section round trips

use proptest::prelude::*;
use quicwire::h3::qpack::{Decoder, Encoder, HeaderField};

const TABLE_CAPACITY: u64 = 256;

fn header_field() -> impl Strategy<Value = HeaderField> {
    let name = prop_oneof![
        prop::sample::select(vec![":path", "content-type", "accept", "x-request-id", "cookie"]).prop_map(String::from),
        "[a-z][a-z0-9-]{0,15}",
    ];
    // Long values do not fit the dynamic table on their own
    let value = prop_oneof!["[ -~]{0,24}", "[a-z]{250,320}"];
    (name, value).prop_map(|(n, v)| HeaderField::new(n, v))
}

fn sections() -> impl Strategy<Value = Vec<Vec<HeaderField>>> {
    prop::collection::vec(prop::collection::vec(header_field(), 0..12), 1..8)
}

/// Pass every section through an encoder/decoder pair, exchanging
/// stream instructions between sections
fn round_trip(sections: &[Vec<HeaderField>], blocked_streams: u64) -> Vec<Vec<HeaderField>> {
    let mut encoder = Encoder::with_dynamic_table(TABLE_CAPACITY as usize);
    encoder.apply_peer_settings(TABLE_CAPACITY, blocked_streams).unwrap();
    let mut decoder = Decoder::new(TABLE_CAPACITY, blocked_streams);

    let mut decoded = Vec::new();
    for (i, fields) in sections.iter().enumerate() {
        let stream_id = i as u64 * 4;
        let block = encoder.encode(stream_id, fields).unwrap();
        if let Some(instructions) = encoder.take_instructions() {
            decoder.on_encoder_instructions(&instructions).unwrap();
        }
        let section = decoder
            .decode_section(stream_id, &block)
            .unwrap()
            .expect("inserts were delivered before the section");
        decoded.push(section);
        if let Some(instructions) = decoder.take_instructions() {
            encoder.on_decoder_instructions(&instructions).unwrap();
        }
        assert!(encoder.table().size() <= TABLE_CAPACITY as usize);
        assert_eq!(encoder.table().insert_count(), decoder.table().insert_count());
    }
    decoded
}

proptest! {
    #[test]
    fn prop_sections_round_trip(sections in sections()) {
        prop_assert_eq!(round_trip(&sections, 16), sections);
    }

    #[test]
    fn prop_sections_round_trip_without_blocking(sections in sections()) {
        prop_assert_eq!(round_trip(&sections, 0), sections);
    }

    #[test]
    fn prop_static_only_round_trip(fields in prop::collection::vec(header_field(), 0..16)) {
        let mut encoder = Encoder::new();
        let block = encoder.encode(0, &fields).unwrap();
        prop_assert!(encoder.take_instructions().is_none());
        let mut decoder = Decoder::new(0, 0);
        let decoded = decoder.decode_section(0, &block).unwrap();
        prop_assert_eq!(decoded, Some(fields));
    }
}

#[test]
fn test_repeated_pairs_keep_order() {
    let fields = vec![
        HeaderField::new("set-cookie", "a=1"),
        HeaderField::new("set-cookie", "b=2"),
        HeaderField::new("set-cookie", "a=1"),
        HeaderField::new(":status", "200"),
    ];
    let decoded = round_trip(&[fields.clone(), fields.clone()], 4);
    assert_eq!(decoded, vec![fields.clone(), fields]);
}
