//! QPACK decoder
//!
//! Applies the peer's encoder stream to a local copy of the dynamic table
//! and decodes field sections against it. A section whose Required Insert
//! Count is ahead of the table is reported as blocked; the caller keeps it
//! and retries after more encoder stream data arrives.

use super::table::{DynamicTable, HeaderField, StaticTable};
use super::{decode_integer, decode_string, encode_integer, QpackError, QpackResult, ENTRY_OVERHEAD};
use bytes::Bytes;
use std::collections::HashSet;
use tracing::{debug, trace};

/// QPACK decoder
#[derive(Debug)]
pub struct Decoder {
    table: DynamicTable,
    /// Our SETTINGS_QPACK_BLOCKED_STREAMS
    max_blocked_streams: u64,
    /// Our SETTINGS_MAX_FIELD_SECTION_SIZE
    max_field_section_size: Option<u64>,
    blocked: HashSet<u64>,
    /// Inserts already reported to the encoder
    acknowledged: u64,
    /// Partial encoder stream instruction
    encoder_buf: Vec<u8>,
    /// Bytes for the decoder stream
    instructions: Vec<u8>,
}

impl Decoder {
    /// Create a decoder advertising the given limits
    pub fn new(max_table_capacity: u64, max_blocked_streams: u64) -> Self {
        Decoder {
            table: DynamicTable::new(usize::try_from(max_table_capacity).unwrap_or(usize::MAX)),
            max_blocked_streams,
            max_field_section_size: None,
            blocked: HashSet::new(),
            acknowledged: 0,
            encoder_buf: Vec::new(),
            instructions: Vec::new(),
        }
    }

    /// Limit the decoded size of a field section
    pub fn set_max_field_section_size(&mut self, size: Option<u64>) {
        self.max_field_section_size = size;
    }

    /// The decoder's copy of the dynamic table
    pub fn table(&self) -> &DynamicTable {
        &self.table
    }

    /// Number of streams waiting on inserts
    pub fn blocked_streams(&self) -> usize {
        self.blocked.len()
    }

    /// Take the bytes queued for the decoder stream
    pub fn take_instructions(&mut self) -> Option<Bytes> {
        if self.instructions.is_empty() {
            return None;
        }
        Some(Bytes::from(std::mem::take(&mut self.instructions)))
    }

    /// Process bytes received on the peer's encoder stream
    pub fn on_encoder_instructions(&mut self, data: &[u8]) -> QpackResult<()> {
        self.encoder_buf.extend_from_slice(data);
        let mut pos = 0;
        while pos < self.encoder_buf.len() {
            match self.parse_encoder_instruction(pos) {
                Ok(used) => pos += used,
                Err(QpackError::Truncated) => break,
                Err(QpackError::EncoderStream(msg)) => return Err(QpackError::EncoderStream(msg)),
                Err(err) => return Err(QpackError::EncoderStream(err.to_string())),
            }
        }
        self.encoder_buf.drain(..pos);

        let inserted = self.table.insert_count();
        if inserted > self.acknowledged {
            encode_integer(&mut self.instructions, inserted - self.acknowledged, 6, 0x00);
            self.acknowledged = inserted;
        }
        Ok(())
    }

    fn parse_encoder_instruction(&mut self, pos: usize) -> QpackResult<usize> {
        let buf = &self.encoder_buf[pos..];
        let first = buf[0];
        if first & 0x80 != 0 {
            // Insert With Name Reference
            let (index, mut used) = decode_integer(buf, 6)?;
            let (value, n) = decode_string(&buf[used..], 7)?;
            used += n;
            let name = if first & 0x40 != 0 {
                StaticTable::get(index)?.0.to_vec()
            } else {
                self.table.get_relative(index)?.name.clone()
            };
            self.insert(HeaderField { name, value })?;
            Ok(used)
        } else if first & 0x40 != 0 {
            // Insert With Literal Name
            let (name, mut used) = decode_string(buf, 5)?;
            let (value, n) = decode_string(&buf[used..], 7)?;
            used += n;
            self.insert(HeaderField { name, value })?;
            Ok(used)
        } else if first & 0x20 != 0 {
            let (capacity, used) = decode_integer(buf, 5)?;
            self.table.set_capacity(usize::try_from(capacity).unwrap_or(usize::MAX))?;
            debug!(capacity, "peer set QPACK table capacity");
            Ok(used)
        } else {
            let (relative, used) = decode_integer(buf, 5)?;
            let absolute = self
                .table
                .insert_count()
                .checked_sub(relative + 1)
                .ok_or(QpackError::InvalidDynamicIndex(relative))?;
            self.table.duplicate(absolute)?;
            Ok(used)
        }
    }

    fn insert(&mut self, field: HeaderField) -> QpackResult<()> {
        trace!(?field, "peer QPACK insert");
        self.table.insert(field)?;
        Ok(())
    }

    fn required_insert_count(&self, encoded: u64) -> QpackResult<u64> {
        if encoded == 0 {
            return Ok(0);
        }
        let max_entries = (self.table.max_capacity() / ENTRY_OVERHEAD) as u64;
        let full_range = 2 * max_entries;
        if encoded > full_range {
            return Err(QpackError::InvalidRequiredInsertCount(encoded));
        }
        let max_value = self.table.insert_count() + max_entries;
        let max_wrapped = (max_value / full_range) * full_range;
        let mut required = max_wrapped + encoded - 1;
        if required > max_value {
            if required <= full_range {
                return Err(QpackError::InvalidRequiredInsertCount(encoded));
            }
            required -= full_range;
        }
        if required == 0 {
            return Err(QpackError::InvalidRequiredInsertCount(encoded));
        }
        Ok(required)
    }

    /// Decode a field section received on `stream_id`
    ///
    /// Returns `Ok(None)` when the section waits on inserts not yet
    /// received; call again with the same bytes later.
    pub fn decode_section(&mut self, stream_id: u64, block: &[u8]) -> QpackResult<Option<Vec<HeaderField>>> {
        let (encoded, mut pos) = decode_integer(block, 8)?;
        let required = self.required_insert_count(encoded)?;
        let sign = *block.get(pos).ok_or(QpackError::Truncated)? & 0x80 != 0;
        let (delta, used) = decode_integer(&block[pos..], 7)?;
        pos += used;
        let base = if sign {
            required.checked_sub(delta + 1)
        } else {
            required.checked_add(delta)
        }
        .ok_or(QpackError::InvalidRequiredInsertCount(encoded))?;

        if required > self.table.insert_count() {
            if !self.blocked.contains(&stream_id) {
                if self.blocked.len() as u64 >= self.max_blocked_streams {
                    return Err(QpackError::TooManyBlockedStreams(self.max_blocked_streams));
                }
                self.blocked.insert(stream_id);
            }
            trace!(stream_id, required, "field section blocked");
            return Ok(None);
        }
        self.blocked.remove(&stream_id);

        let section = SectionReader {
            table: &self.table,
            required,
            base,
        };
        let mut fields = Vec::new();
        let mut total = 0u64;
        while pos < block.len() {
            let (field, used) = section.field_line(&block[pos..])?;
            pos += used;
            total += field.size() as u64;
            if let Some(max) = self.max_field_section_size {
                if total > max {
                    return Err(QpackError::FieldSectionTooLarge { size: total, max });
                }
            }
            fields.push(field);
        }

        if required > 0 {
            encode_integer(&mut self.instructions, stream_id, 7, 0x80);
            self.acknowledged = self.acknowledged.max(required);
        }
        Ok(Some(fields))
    }

    /// Forget a stream that was reset or abandoned
    ///
    /// Emits a Stream Cancellation when a dynamic table is in use.
    pub fn cancel_stream(&mut self, stream_id: u64) {
        self.blocked.remove(&stream_id);
        if self.table.max_capacity() > 0 {
            encode_integer(&mut self.instructions, stream_id, 6, 0x40);
        }
    }
}

/// Field line parsing against a fixed Required Insert Count and Base
struct SectionReader<'a> {
    table: &'a DynamicTable,
    required: u64,
    base: u64,
}

impl SectionReader<'_> {
    fn dynamic(&self, absolute: Option<u64>, raw: u64) -> QpackResult<&HeaderField> {
        match absolute {
            Some(absolute) if absolute < self.required => self.table.get(absolute),
            _ => Err(QpackError::InvalidDynamicIndex(raw)),
        }
    }

    fn relative(&self, index: u64) -> QpackResult<&HeaderField> {
        self.dynamic(self.base.checked_sub(index + 1), index)
    }

    fn post_base(&self, index: u64) -> QpackResult<&HeaderField> {
        self.dynamic(self.base.checked_add(index), index)
    }

    fn field_line(&self, buf: &[u8]) -> QpackResult<(HeaderField, usize)> {
        let first = buf[0];
        if first & 0x80 != 0 {
            // Indexed Field Line
            let (index, used) = decode_integer(buf, 6)?;
            let field = if first & 0x40 != 0 {
                let (name, value) = StaticTable::get(index)?;
                HeaderField::new(name, value)
            } else {
                self.relative(index)?.clone()
            };
            Ok((field, used))
        } else if first & 0x40 != 0 {
            // Literal Field Line With Name Reference
            let (index, used) = decode_integer(buf, 4)?;
            let name = if first & 0x10 != 0 {
                StaticTable::get(index)?.0.to_vec()
            } else {
                self.relative(index)?.name.clone()
            };
            let (value, n) = decode_string(&buf[used..], 7)?;
            Ok((HeaderField { name, value }, used + n))
        } else if first & 0x20 != 0 {
            // Literal Field Line With Literal Name
            let (name, used) = decode_string(buf, 3)?;
            let (value, n) = decode_string(&buf[used..], 7)?;
            Ok((HeaderField { name, value }, used + n))
        } else if first & 0x10 != 0 {
            // Indexed Field Line With Post-Base Index
            let (index, used) = decode_integer(buf, 4)?;
            Ok((self.post_base(index)?.clone(), used))
        } else {
            // Literal Field Line With Post-Base Name Reference
            let (index, used) = decode_integer(buf, 3)?;
            let name = self.post_base(index)?.name.clone();
            let (value, n) = decode_string(&buf[used..], 7)?;
            Ok((HeaderField { name, value }, used + n))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::h3::qpack::Encoder;

    fn fields(pairs: &[(&str, &str)]) -> Vec<HeaderField> {
        pairs.iter().map(|&(n, v)| HeaderField::new(n, v)).collect()
    }

    #[test]
    fn test_static_roundtrip() {
        let mut encoder = Encoder::new();
        let mut decoder = Decoder::new(0, 0);
        let list = fields(&[
            (":method", "POST"),
            (":scheme", "https"),
            (":path", "/upload"),
            ("content-type", "application/octet-stream"),
            ("x-trace", "abc"),
        ]);
        let block = encoder.encode(0, &list).unwrap();
        assert_eq!(decoder.decode_section(0, &block).unwrap().unwrap(), list);
        assert!(decoder.take_instructions().is_none());
    }

    #[test]
    fn test_decode_rfc_literal() {
        // Literal with static name ref ":path" = "/index.html" (RFC 9204 B.1)
        let block = [
            0x00, 0x00, 0x51, 0x0b, 0x2f, 0x69, 0x6e, 0x64, 0x65, 0x78, 0x2e, 0x68, 0x74, 0x6d, 0x6c,
        ];
        let mut decoder = Decoder::new(0, 0);
        let list = decoder.decode_section(0, &block).unwrap().unwrap();
        assert_eq!(list, vec![HeaderField::new(":path", "/index.html")]);
    }

    #[test]
    fn test_dynamic_roundtrip_with_blocking() {
        let mut encoder = Encoder::with_dynamic_table(4096);
        let mut decoder = Decoder::new(4096, 16);
        encoder.apply_peer_settings(4096, 16).unwrap();

        let list = fields(&[(":authority", "example.com"), ("x-session", "42")]);
        let block = encoder.encode(0, &list).unwrap();

        // Section arrives before the inserts
        assert_eq!(decoder.decode_section(0, &block).unwrap(), None);
        assert_eq!(decoder.blocked_streams(), 1);

        decoder
            .on_encoder_instructions(&encoder.take_instructions().unwrap())
            .unwrap();
        assert_eq!(decoder.decode_section(0, &block).unwrap().unwrap(), list);
        assert_eq!(decoder.blocked_streams(), 0);

        // Insert Count Increment and Section Acknowledgement
        encoder
            .on_decoder_instructions(&decoder.take_instructions().unwrap())
            .unwrap();
        assert_eq!(encoder.known_received_count(), 2);
        assert_eq!(encoder.blocked_streams(), 0);

        // Later sections reuse the entries by relative index
        let again = encoder.encode(4, &list).unwrap();
        assert!(again.len() < block.len());
        assert!(encoder.take_instructions().is_none());
        assert_eq!(decoder.decode_section(4, &again).unwrap().unwrap(), list);
    }

    #[test]
    fn test_too_many_blocked_streams() {
        let mut encoder = Encoder::with_dynamic_table(4096);
        encoder.apply_peer_settings(4096, 2).unwrap();
        let mut decoder = Decoder::new(4096, 1);

        let a = encoder.encode(0, &fields(&[("x-a", "1")])).unwrap();
        let b = encoder.encode(4, &fields(&[("x-b", "2")])).unwrap();
        assert_eq!(decoder.decode_section(0, &a).unwrap(), None);
        assert_eq!(
            decoder.decode_section(4, &b),
            Err(QpackError::TooManyBlockedStreams(1))
        );
    }

    #[test]
    fn test_invalid_references() {
        let mut decoder = Decoder::new(0, 0);
        // Static index 99 is out of range
        assert_eq!(
            decoder.decode_section(0, &[0x00, 0x00, 0xff, 0x24]),
            Err(QpackError::InvalidStaticIndex(99))
        );
        // Required Insert Count with no dynamic table
        assert!(matches!(
            decoder.decode_section(0, &[0x02, 0x00]),
            Err(QpackError::InvalidRequiredInsertCount(_))
        ));
        assert_eq!(decoder.decode_section(0, &[0x00]), Err(QpackError::Truncated));
    }

    #[test]
    fn test_field_section_size_limit() {
        let mut encoder = Encoder::new();
        let mut decoder = Decoder::new(0, 0);
        decoder.set_max_field_section_size(Some(64));
        let block = encoder
            .encode(0, &fields(&[("x-long", "v".repeat(40).as_str())]))
            .unwrap();
        assert!(matches!(
            decoder.decode_section(0, &block),
            Err(QpackError::FieldSectionTooLarge { .. })
        ));
    }

    #[test]
    fn test_encoder_stream_errors() {
        let mut decoder = Decoder::new(100, 0);
        // Capacity above our maximum
        assert!(matches!(
            decoder.on_encoder_instructions(&[0x3f, 0x62]),
            Err(QpackError::EncoderStream(_))
        ));

        // Duplicate of an entry that does not exist
        let mut decoder = Decoder::new(100, 0);
        assert!(matches!(
            decoder.on_encoder_instructions(&[0x00]),
            Err(QpackError::EncoderStream(_))
        ));
    }

    #[test]
    fn test_split_encoder_instruction() {
        let mut decoder = Decoder::new(100, 0);
        // Set capacity 100, then Insert With Literal Name "ab" = "c" in pieces
        decoder.on_encoder_instructions(&[0x3f, 0x45, 0x42, b'a']).unwrap();
        assert_eq!(decoder.table().insert_count(), 0);
        decoder.on_encoder_instructions(&[b'b', 0x01, b'c']).unwrap();
        assert_eq!(decoder.table().insert_count(), 1);
        assert_eq!(decoder.table().get(0).unwrap(), &HeaderField::new("ab", "c"));
        assert_eq!(decoder.take_instructions().unwrap().as_ref(), &[0x01]);
    }

    #[test]
    fn test_cancel_stream() {
        let mut decoder = Decoder::new(0, 0);
        decoder.cancel_stream(4);
        assert!(decoder.take_instructions().is_none());

        let mut decoder = Decoder::new(4096, 0);
        decoder.cancel_stream(4);
        assert_eq!(decoder.take_instructions().unwrap().as_ref(), &[0x44]);
    }
}
