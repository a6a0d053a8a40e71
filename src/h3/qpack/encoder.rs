//! QPACK encoder
//!
//! Without a dynamic table every field is encoded against the static table
//! or as a literal, so sections never block. With
//! [`Encoder::with_dynamic_table`] the encoder inserts fields it has not
//! seen, writes the inserts to its encoder stream buffer and references
//! them once the peer may see them: immediately when the stream is allowed
//! to block, otherwise only after the decoder acknowledges the insert.

use super::table::{DynamicTable, HeaderField, Match, StaticTable};
use super::{decode_integer, encode_integer, encode_string, QpackError, QpackResult, ENTRY_OVERHEAD};
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, trace};

/// Dynamic table references held by one unacknowledged field section
#[derive(Debug, Clone, Copy)]
struct SectionRefs {
    required_insert_count: u64,
    min_index: u64,
}

/// QPACK encoder
#[derive(Debug)]
pub struct Encoder {
    table: DynamicTable,
    /// Capacity we want once the peer allows it
    desired_capacity: usize,
    /// Peer's SETTINGS_QPACK_BLOCKED_STREAMS
    max_blocked_streams: u64,
    known_received_count: u64,
    pending: HashMap<u64, VecDeque<SectionRefs>>,
    /// Bytes for the encoder stream
    instructions: Vec<u8>,
    /// Partial decoder stream instruction
    decoder_buf: Vec<u8>,
}

impl Encoder {
    /// Create an encoder that only uses the static table
    pub fn new() -> Self {
        Encoder {
            table: DynamicTable::new(0),
            desired_capacity: 0,
            max_blocked_streams: 0,
            known_received_count: 0,
            pending: HashMap::new(),
            instructions: Vec::new(),
            decoder_buf: Vec::new(),
        }
    }

    /// Create an encoder that uses up to `capacity` bytes of dynamic table
    ///
    /// The table stays empty until [`apply_peer_settings`](Self::apply_peer_settings)
    /// reports how much the peer allows.
    pub fn with_dynamic_table(capacity: usize) -> Self {
        Encoder {
            desired_capacity: capacity,
            ..Encoder::new()
        }
    }

    /// Apply the peer decoder's limits
    ///
    /// Emits a Set Dynamic Table Capacity instruction when the dynamic
    /// table becomes usable.
    pub fn apply_peer_settings(&mut self, max_table_capacity: u64, max_blocked_streams: u64) -> QpackResult<()> {
        if self.table.insert_count() > 0 {
            return Err(QpackError::EncoderStream("peer limits changed after inserts".to_string()));
        }
        let max = usize::try_from(max_table_capacity).unwrap_or(usize::MAX);
        self.table = DynamicTable::new(max);
        self.max_blocked_streams = max_blocked_streams;

        let capacity = self.desired_capacity.min(max);
        if capacity > 0 {
            self.set_capacity(capacity)?;
        }
        Ok(())
    }

    /// Change the dynamic table capacity
    pub fn set_capacity(&mut self, capacity: usize) -> QpackResult<()> {
        let pinned = self.table.size() - self.table.size_below(self.eviction_floor());
        if capacity < pinned {
            return Err(QpackError::EncoderStream(format!(
                "cannot shrink table to {} with referenced entries",
                capacity
            )));
        }
        self.table.set_capacity(capacity)?;
        encode_integer(&mut self.instructions, capacity as u64, 5, 0x20);
        debug!(capacity, "QPACK dynamic table capacity set");
        Ok(())
    }

    /// The encoder's copy of the dynamic table
    pub fn table(&self) -> &DynamicTable {
        &self.table
    }

    /// Inserts the decoder has acknowledged
    pub fn known_received_count(&self) -> u64 {
        self.known_received_count
    }

    /// Streams with sections that may currently be blocked at the decoder
    pub fn blocked_streams(&self) -> usize {
        self.pending
            .values()
            .filter(|sections| {
                sections
                    .iter()
                    .any(|s| s.required_insert_count > self.known_received_count)
            })
            .count()
    }

    /// Take the bytes queued for the encoder stream
    pub fn take_instructions(&mut self) -> Option<Bytes> {
        if self.instructions.is_empty() {
            return None;
        }
        Some(Bytes::from(std::mem::take(&mut self.instructions)))
    }

    fn can_block(&self, stream_id: u64) -> bool {
        let blocking = |sections: &VecDeque<SectionRefs>| {
            sections
                .iter()
                .any(|s| s.required_insert_count > self.known_received_count)
        };
        if self.pending.get(&stream_id).map_or(false, blocking) {
            return true;
        }
        (self.blocked_streams() as u64) < self.max_blocked_streams
    }

    /// Entries below this absolute index may be evicted
    fn eviction_floor(&self) -> u64 {
        self.pending
            .values()
            .flatten()
            .map(|s| s.min_index)
            .fold(self.known_received_count, u64::min)
    }

    /// Encode a field section for `stream_id`
    pub fn encode(&mut self, stream_id: u64, fields: &[HeaderField]) -> QpackResult<Bytes> {
        let base = self.table.insert_count();
        let can_block = self.can_block(stream_id);
        let mut section = Section {
            base,
            floor: self.eviction_floor(),
            required: 0,
            min_index: u64::MAX,
            body: Vec::with_capacity(fields.len() * 16),
        };

        for field in fields {
            self.encode_field(field, can_block, &mut section)?;
        }

        let mut out = Vec::with_capacity(section.body.len() + 4);
        if section.required == 0 {
            out.extend_from_slice(&[0, 0]);
        } else {
            let max_entries = (self.table.max_capacity() / ENTRY_OVERHEAD) as u64;
            let encoded = section.required % (2 * max_entries) + 1;
            encode_integer(&mut out, encoded, 8, 0);
            if base >= section.required {
                encode_integer(&mut out, base - section.required, 7, 0);
            } else {
                encode_integer(&mut out, section.required - base - 1, 7, 0x80);
            }
            self.pending.entry(stream_id).or_default().push_back(SectionRefs {
                required_insert_count: section.required,
                min_index: section.min_index,
            });
        }
        out.extend_from_slice(&section.body);
        trace!(stream_id, fields = fields.len(), required = section.required, len = out.len(), "encoded field section");
        Ok(Bytes::from(out))
    }

    fn encode_field(&mut self, field: &HeaderField, can_block: bool, section: &mut Section) -> QpackResult<()> {
        let static_match = StaticTable::lookup(&field.name, &field.value);
        if let Some(Match::Exact(index)) = static_match {
            encode_integer(&mut section.body, index, 6, 0xc0);
            return Ok(());
        }

        let usable = |absolute: u64, known: u64| absolute < known || can_block;
        let dynamic_match = self.table.lookup(&field.name, &field.value, self.table.first_index());
        if let Some(Match::Exact(absolute)) = dynamic_match {
            if usable(absolute, self.known_received_count) {
                section.indexed(absolute);
                return Ok(());
            }
        } else if self.table.capacity() > 0 && self.table.can_insert(field.size(), section.floor) {
            self.write_insert(field, static_match);
            let absolute = self.table.insert(field.clone())?;
            if can_block {
                section.indexed(absolute);
                return Ok(());
            }
        }

        match (static_match, dynamic_match) {
            (Some(Match::Name(index)), _) => {
                encode_integer(&mut section.body, index, 4, 0x50);
                encode_string(&mut section.body, &field.value, 7, 0);
            }
            (_, Some(Match::Name(absolute)))
                if absolute >= self.table.first_index() && usable(absolute, self.known_received_count) =>
            {
                section.name_ref(absolute, &field.value);
            }
            _ => {
                encode_string(&mut section.body, &field.name, 3, 0x20);
                encode_string(&mut section.body, &field.value, 7, 0);
            }
        }
        Ok(())
    }

    fn write_insert(&mut self, field: &HeaderField, static_match: Option<Match>) {
        match static_match {
            Some(Match::Name(index)) => {
                encode_integer(&mut self.instructions, index, 6, 0xc0);
            }
            _ => {
                encode_string(&mut self.instructions, &field.name, 5, 0x40);
            }
        }
        encode_string(&mut self.instructions, &field.value, 7, 0);
        trace!(?field, "QPACK insert");
    }

    /// Process bytes received on the peer's decoder stream
    pub fn on_decoder_instructions(&mut self, data: &[u8]) -> QpackResult<()> {
        self.decoder_buf.extend_from_slice(data);
        let mut pos = 0;
        while pos < self.decoder_buf.len() {
            match self.parse_decoder_instruction(pos) {
                Ok(used) => pos += used,
                Err(QpackError::Truncated) => break,
                Err(QpackError::DecoderStream(msg)) => return Err(QpackError::DecoderStream(msg)),
                Err(err) => return Err(QpackError::DecoderStream(err.to_string())),
            }
        }
        self.decoder_buf.drain(..pos);
        Ok(())
    }

    fn parse_decoder_instruction(&mut self, pos: usize) -> QpackResult<usize> {
        let buf = &self.decoder_buf[pos..];
        let first = buf[0];
        if first & 0x80 != 0 {
            let (stream_id, used) = decode_integer(buf, 7)?;
            let section = self
                .pending
                .get_mut(&stream_id)
                .and_then(|sections| sections.pop_front())
                .ok_or_else(|| QpackError::DecoderStream(format!("no section to acknowledge on stream {}", stream_id)))?;
            if self.pending.get(&stream_id).map_or(false, |s| s.is_empty()) {
                self.pending.remove(&stream_id);
            }
            self.known_received_count = self.known_received_count.max(section.required_insert_count);
            trace!(stream_id, "QPACK section acknowledged");
            Ok(used)
        } else if first & 0x40 != 0 {
            let (stream_id, used) = decode_integer(buf, 6)?;
            self.pending.remove(&stream_id);
            trace!(stream_id, "QPACK stream cancelled");
            Ok(used)
        } else {
            let (increment, used) = decode_integer(buf, 6)?;
            let known = self.known_received_count + increment;
            if increment == 0 || known > self.table.insert_count() {
                return Err(QpackError::DecoderStream(format!("invalid insert count increment {}", increment)));
            }
            self.known_received_count = known;
            Ok(used)
        }
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

/// A field section being encoded
struct Section {
    base: u64,
    floor: u64,
    required: u64,
    min_index: u64,
    body: Vec<u8>,
}

impl Section {
    fn reference(&mut self, absolute: u64) {
        self.required = self.required.max(absolute + 1);
        self.min_index = self.min_index.min(absolute);
        self.floor = self.floor.min(absolute);
    }

    fn indexed(&mut self, absolute: u64) {
        self.reference(absolute);
        if absolute < self.base {
            encode_integer(&mut self.body, self.base - 1 - absolute, 6, 0x80);
        } else {
            encode_integer(&mut self.body, absolute - self.base, 4, 0x10);
        }
    }

    fn name_ref(&mut self, absolute: u64, value: &[u8]) {
        self.reference(absolute);
        if absolute < self.base {
            encode_integer(&mut self.body, self.base - 1 - absolute, 4, 0x40);
        } else {
            encode_integer(&mut self.body, absolute - self.base, 3, 0x00);
        }
        encode_string(&mut self.body, value, 7, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> Vec<HeaderField> {
        pairs.iter().map(|&(n, v)| HeaderField::new(n, v)).collect()
    }

    #[test]
    fn test_static_only_encoding() {
        let mut encoder = Encoder::new();
        let block = encoder
            .encode(0, &fields(&[(":method", "GET"), (":path", "/index.html"), ("x-custom", "v")]))
            .unwrap();

        assert_eq!(&block[..2], &[0, 0]);
        // Indexed static 17
        assert_eq!(block[2], 0xc0 | 17);
        // Literal with static name ref 1
        assert_eq!(block[3], 0x50 | 1);
        assert!(encoder.take_instructions().is_none());
    }

    #[test]
    fn test_dynamic_table_requires_peer_settings() {
        let mut encoder = Encoder::with_dynamic_table(4096);
        encoder.encode(0, &fields(&[("x-custom", "v")])).unwrap();
        assert!(encoder.take_instructions().is_none());

        encoder.apply_peer_settings(1024, 0).unwrap();
        assert_eq!(encoder.table().capacity(), 1024);
        // Set Dynamic Table Capacity 1024
        assert_eq!(encoder.take_instructions().unwrap()[0], 0x3f);
    }

    #[test]
    fn test_unblockable_inserts_are_not_referenced() {
        let mut encoder = Encoder::with_dynamic_table(4096);
        encoder.apply_peer_settings(4096, 0).unwrap();
        encoder.take_instructions();

        let block = encoder.encode(0, &fields(&[("x-custom", "v")])).unwrap();
        assert_eq!(&block[..2], &[0, 0]);
        assert_eq!(encoder.table().insert_count(), 1);
        assert!(encoder.take_instructions().is_some());

        // Second use still waits for the acknowledgement
        let block = encoder.encode(4, &fields(&[("x-custom", "v")])).unwrap();
        assert_eq!(&block[..2], &[0, 0]);
        assert_eq!(encoder.table().insert_count(), 1);

        // Insert Count Increment 1
        encoder.on_decoder_instructions(&[0x01]).unwrap();
        let block = encoder.encode(8, &fields(&[("x-custom", "v")])).unwrap();
        assert_eq!(block[0], 2);
        assert_eq!(encoder.blocked_streams(), 0);
    }

    #[test]
    fn test_blocking_reference_and_ack() {
        let mut encoder = Encoder::with_dynamic_table(4096);
        encoder.apply_peer_settings(4096, 1).unwrap();

        let block = encoder.encode(0, &fields(&[("x-custom", "v")])).unwrap();
        // Required Insert Count 1, base 0 so delta base is negative
        assert_eq!(block[0], 2);
        assert_eq!(block[1], 0x80);
        assert_eq!(block[2], 0x10);
        assert_eq!(encoder.blocked_streams(), 1);

        // Limit reached: another stream may not block
        let block = encoder.encode(4, &fields(&[("x-other", "w")])).unwrap();
        assert_eq!(&block[..2], &[0, 0]);

        // Section Acknowledgement for stream 0
        encoder.on_decoder_instructions(&[0x80]).unwrap();
        assert_eq!(encoder.known_received_count(), 1);
        assert_eq!(encoder.blocked_streams(), 0);
    }

    #[test]
    fn test_decoder_stream_errors() {
        let mut encoder = Encoder::new();
        assert!(matches!(
            encoder.on_decoder_instructions(&[0x80]),
            Err(QpackError::DecoderStream(_))
        ));

        let mut encoder = Encoder::new();
        assert!(matches!(
            encoder.on_decoder_instructions(&[0x00]),
            Err(QpackError::DecoderStream(_))
        ));
    }

    #[test]
    fn test_partial_decoder_instruction() {
        let mut encoder = Encoder::with_dynamic_table(4096);
        encoder.apply_peer_settings(4096, 0).unwrap();
        encoder.encode(0, &fields(&[("x-custom", "v")])).unwrap();

        // Stream Cancellation with a multi-byte stream id, split in two
        encoder.on_decoder_instructions(&[0x7f]).unwrap();
        encoder.on_decoder_instructions(&[0x01]).unwrap();
        encoder.on_decoder_instructions(&[0x01]).unwrap();
        assert_eq!(encoder.known_received_count(), 1);
    }

    #[test]
    fn test_referenced_entries_not_evicted() {
        let mut encoder = Encoder::with_dynamic_table(100);
        encoder.apply_peer_settings(100, 4).unwrap();

        // 8 + 30 + 32 = 70 bytes: only one fits
        let first = HeaderField::new("x-first_", vec![b'a'; 30]);
        let second = HeaderField::new("x-second", vec![b'b'; 30]);
        encoder.encode(0, &[first]).unwrap();
        let block = encoder.encode(4, &[second]).unwrap();

        // First entry is still referenced, so the second is sent as a literal
        assert_eq!(encoder.table().insert_count(), 1);
        assert_eq!(&block[..2], &[0, 0]);
    }
}
