//! QPACK static and dynamic tables (RFC 9204 Section 3)

use super::{QpackError, QpackResult};
use std::collections::VecDeque;
use std::fmt;

/// Per-entry overhead counted against the table capacity
pub const ENTRY_OVERHEAD: usize = 32;

/// A header field as a name/value pair of octets
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct HeaderField {
    pub name: Vec<u8>,
    pub value: Vec<u8>,
}

impl HeaderField {
    pub fn new(name: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        HeaderField {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Size counted against a dynamic table
    pub fn size(&self) -> usize {
        self.name.len() + self.value.len() + ENTRY_OVERHEAD
    }

    /// Whether this is a pseudo-header (`:method`, `:status`, ...)
    pub fn is_pseudo(&self) -> bool {
        self.name.first() == Some(&b':')
    }
}

impl fmt::Debug for HeaderField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}",
            String::from_utf8_lossy(&self.name),
            String::from_utf8_lossy(&self.value)
        )
    }
}

impl<N: AsRef<[u8]>, V: AsRef<[u8]>> From<(N, V)> for HeaderField {
    fn from((name, value): (N, V)) -> Self {
        HeaderField::new(name.as_ref(), value.as_ref())
    }
}

/// Result of a table lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Match {
    /// Name and value match
    Exact(u64),
    /// Only the name matches
    Name(u64),
}

/// RFC 9204 Appendix A
const STATIC_ENTRIES: [(&[u8], &[u8]); 99] = [
    /*  0 */ (b":authority", b""),
    /*  1 */ (b":path", b"/"),
    /*  2 */ (b"age", b"0"),
    /*  3 */ (b"content-disposition", b""),
    /*  4 */ (b"content-length", b"0"),
    /*  5 */ (b"cookie", b""),
    /*  6 */ (b"date", b""),
    /*  7 */ (b"etag", b""),
    /*  8 */ (b"if-modified-since", b""),
    /*  9 */ (b"if-none-match", b""),
    /* 10 */ (b"last-modified", b""),
    /* 11 */ (b"link", b""),
    /* 12 */ (b"location", b""),
    /* 13 */ (b"referer", b""),
    /* 14 */ (b"set-cookie", b""),
    /* 15 */ (b":method", b"CONNECT"),
    /* 16 */ (b":method", b"DELETE"),
    /* 17 */ (b":method", b"GET"),
    /* 18 */ (b":method", b"HEAD"),
    /* 19 */ (b":method", b"OPTIONS"),
    /* 20 */ (b":method", b"POST"),
    /* 21 */ (b":method", b"PUT"),
    /* 22 */ (b":scheme", b"http"),
    /* 23 */ (b":scheme", b"https"),
    /* 24 */ (b":status", b"103"),
    /* 25 */ (b":status", b"200"),
    /* 26 */ (b":status", b"304"),
    /* 27 */ (b":status", b"404"),
    /* 28 */ (b":status", b"503"),
    /* 29 */ (b"accept", b"*/*"),
    /* 30 */ (b"accept", b"application/dns-message"),
    /* 31 */ (b"accept-encoding", b"gzip, deflate, br"),
    /* 32 */ (b"accept-ranges", b"bytes"),
    /* 33 */ (b"access-control-allow-headers", b"cache-control"),
    /* 34 */ (b"access-control-allow-headers", b"content-type"),
    /* 35 */ (b"access-control-allow-origin", b"*"),
    /* 36 */ (b"cache-control", b"max-age=0"),
    /* 37 */ (b"cache-control", b"max-age=2592000"),
    /* 38 */ (b"cache-control", b"max-age=604800"),
    /* 39 */ (b"cache-control", b"no-cache"),
    /* 40 */ (b"cache-control", b"no-store"),
    /* 41 */ (b"cache-control", b"public, max-age=31536000"),
    /* 42 */ (b"content-encoding", b"br"),
    /* 43 */ (b"content-encoding", b"gzip"),
    /* 44 */ (b"content-type", b"application/dns-message"),
    /* 45 */ (b"content-type", b"application/javascript"),
    /* 46 */ (b"content-type", b"application/json"),
    /* 47 */ (b"content-type", b"application/x-www-form-urlencoded"),
    /* 48 */ (b"content-type", b"image/gif"),
    /* 49 */ (b"content-type", b"image/jpeg"),
    /* 50 */ (b"content-type", b"image/png"),
    /* 51 */ (b"content-type", b"text/css"),
    /* 52 */ (b"content-type", b"text/html; charset=utf-8"),
    /* 53 */ (b"content-type", b"text/plain"),
    /* 54 */ (b"content-type", b"text/plain;charset=utf-8"),
    /* 55 */ (b"range", b"bytes=0-"),
    /* 56 */ (b"strict-transport-security", b"max-age=31536000"),
    /* 57 */ (b"strict-transport-security", b"max-age=31536000; includesubdomains"),
    /* 58 */ (b"strict-transport-security", b"max-age=31536000; includesubdomains; preload"),
    /* 59 */ (b"vary", b"accept-encoding"),
    /* 60 */ (b"vary", b"origin"),
    /* 61 */ (b"x-content-type-options", b"nosniff"),
    /* 62 */ (b"x-xss-protection", b"1; mode=block"),
    /* 63 */ (b":status", b"100"),
    /* 64 */ (b":status", b"204"),
    /* 65 */ (b":status", b"206"),
    /* 66 */ (b":status", b"302"),
    /* 67 */ (b":status", b"400"),
    /* 68 */ (b":status", b"403"),
    /* 69 */ (b":status", b"421"),
    /* 70 */ (b":status", b"425"),
    /* 71 */ (b":status", b"500"),
    /* 72 */ (b"accept-language", b""),
    /* 73 */ (b"access-control-allow-credentials", b"FALSE"),
    /* 74 */ (b"access-control-allow-credentials", b"TRUE"),
    /* 75 */ (b"access-control-allow-headers", b"*"),
    /* 76 */ (b"access-control-allow-methods", b"get"),
    /* 77 */ (b"access-control-allow-methods", b"get, post, options"),
    /* 78 */ (b"access-control-allow-methods", b"options"),
    /* 79 */ (b"access-control-expose-headers", b"content-length"),
    /* 80 */ (b"access-control-request-headers", b"content-type"),
    /* 81 */ (b"access-control-request-method", b"get"),
    /* 82 */ (b"access-control-request-method", b"post"),
    /* 83 */ (b"alt-svc", b"clear"),
    /* 84 */ (b"authorization", b""),
    /* 85 */ (b"content-security-policy", b"script-src 'none'; object-src 'none'; base-uri 'none'"),
    /* 86 */ (b"early-data", b"1"),
    /* 87 */ (b"expect-ct", b""),
    /* 88 */ (b"forwarded", b""),
    /* 89 */ (b"if-range", b""),
    /* 90 */ (b"origin", b""),
    /* 91 */ (b"purpose", b"prefetch"),
    /* 92 */ (b"server", b""),
    /* 93 */ (b"timing-allow-origin", b"*"),
    /* 94 */ (b"upgrade-insecure-requests", b"1"),
    /* 95 */ (b"user-agent", b""),
    /* 96 */ (b"x-forwarded-for", b""),
    /* 97 */ (b"x-frame-options", b"deny"),
    /* 98 */ (b"x-frame-options", b"sameorigin"),
];

/// The QPACK static table
pub struct StaticTable;

impl StaticTable {
    pub const LEN: usize = STATIC_ENTRIES.len();

    /// Entry at `index`
    pub fn get(index: u64) -> QpackResult<(&'static [u8], &'static [u8])> {
        STATIC_ENTRIES
            .get(index as usize)
            .copied()
            .ok_or(QpackError::InvalidStaticIndex(index))
    }

    /// Best match for a field, preferring an exact match
    pub fn lookup(name: &[u8], value: &[u8]) -> Option<Match> {
        let mut name_match = None;
        for (i, (n, v)) in STATIC_ENTRIES.iter().enumerate() {
            if *n != name {
                continue;
            }
            if *v == value {
                return Some(Match::Exact(i as u64));
            }
            name_match.get_or_insert(Match::Name(i as u64));
        }
        name_match
    }
}

/// The QPACK dynamic table
///
/// Entries are addressed by absolute index: the first entry ever inserted
/// is 0 and indices are never reused. Eviction drops the oldest entries.
#[derive(Debug)]
pub struct DynamicTable {
    /// Oldest entry at the front
    entries: VecDeque<HeaderField>,
    /// Absolute index of the front entry
    dropped: u64,
    size: usize,
    capacity: usize,
    max_capacity: usize,
}

impl DynamicTable {
    /// Create an empty table that may grow to `max_capacity`
    pub fn new(max_capacity: usize) -> Self {
        DynamicTable {
            entries: VecDeque::new(),
            dropped: 0,
            size: 0,
            capacity: 0,
            max_capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current size in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    /// Total number of inserts since creation
    pub fn insert_count(&self) -> u64 {
        self.dropped + self.entries.len() as u64
    }

    /// Absolute index of the oldest entry still present
    pub fn first_index(&self) -> u64 {
        self.dropped
    }

    /// Entry by absolute index
    pub fn get(&self, index: u64) -> QpackResult<&HeaderField> {
        index
            .checked_sub(self.dropped)
            .and_then(|i| self.entries.get(i as usize))
            .ok_or(QpackError::InvalidDynamicIndex(index))
    }

    /// Entry by index relative to the most recent insert
    pub fn get_relative(&self, relative: u64) -> QpackResult<&HeaderField> {
        let absolute = self
            .insert_count()
            .checked_sub(relative + 1)
            .ok_or(QpackError::InvalidDynamicIndex(relative))?;
        self.get(absolute)
    }

    /// Best match among entries with absolute index in `min..`, newest first
    pub fn lookup(&self, name: &[u8], value: &[u8], min: u64) -> Option<Match> {
        let mut name_match = None;
        for (i, field) in self.entries.iter().enumerate().rev() {
            let absolute = self.dropped + i as u64;
            if absolute < min {
                break;
            }
            if field.name != name {
                continue;
            }
            if field.value == value {
                return Some(Match::Exact(absolute));
            }
            name_match.get_or_insert(Match::Name(absolute));
        }
        name_match
    }

    /// Change the capacity, evicting as needed
    pub fn set_capacity(&mut self, capacity: usize) -> QpackResult<()> {
        if capacity > self.max_capacity {
            return Err(QpackError::CapacityExceeded {
                requested: capacity as u64,
                max: self.max_capacity as u64,
            });
        }
        self.capacity = capacity;
        self.evict_to(capacity);
        Ok(())
    }

    /// Whether `size` more bytes fit after evicting only entries below `floor`
    pub fn can_insert(&self, size: usize, floor: u64) -> bool {
        if size > self.capacity {
            return false;
        }
        let mut available = self.capacity - self.size;
        let mut absolute = self.dropped;
        for entry in &self.entries {
            if available >= size {
                break;
            }
            if absolute >= floor {
                return false;
            }
            available += entry.size();
            absolute += 1;
        }
        available >= size
    }

    /// Bytes held by entries with absolute index below `floor`
    pub fn size_below(&self, floor: u64) -> usize {
        let count = floor.saturating_sub(self.dropped) as usize;
        self.entries.iter().take(count).map(HeaderField::size).sum()
    }

    /// Insert an entry, evicting the oldest ones to make room
    ///
    /// Returns the absolute index of the new entry. An entry larger than
    /// the capacity is rejected and the table is left untouched.
    pub fn insert(&mut self, field: HeaderField) -> QpackResult<u64> {
        let size = field.size();
        if size > self.capacity {
            return Err(QpackError::EntryTooLarge {
                size,
                capacity: self.capacity,
            });
        }
        self.evict_to(self.capacity - size);
        self.size += size;
        self.entries.push_back(field);
        Ok(self.insert_count() - 1)
    }

    /// Insert a copy of an existing entry
    pub fn duplicate(&mut self, index: u64) -> QpackResult<u64> {
        let field = self.get(index)?.clone();
        self.insert(field)
    }

    fn evict_to(&mut self, target: usize) {
        while self.size > target {
            match self.entries.pop_front() {
                Some(entry) => {
                    self.size -= entry.size();
                    self.dropped += 1;
                }
                None => break,
            }
        }
    }
}
