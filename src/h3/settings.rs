//! HTTP/3 settings management
//!
//! This module implements the SETTINGS frame payload and parameters
//! defined in RFC 9114 Section 7.2.4, RFC 9204 Section 5 and RFC 9297.

use super::error::{Error, Result};
use crate::quic::varint;
use bytes::{Buf, BufMut};
use std::collections::HashSet;
use std::fmt;

/// Largest dynamic table capacity we agree to configure
pub const MAX_TABLE_CAPACITY: u64 = 1 << 30;

/// HTTP/3 settings parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum SettingsParameter {
    /// SETTINGS_QPACK_MAX_TABLE_CAPACITY (0x01)
    /// Largest dynamic table the decoder lets the encoder use
    QpackMaxTableCapacity = 0x01,

    /// SETTINGS_MAX_FIELD_SECTION_SIZE (0x06)
    /// Largest uncompressed field section the sender accepts
    MaxFieldSectionSize = 0x06,

    /// SETTINGS_QPACK_BLOCKED_STREAMS (0x07)
    /// Streams that may wait on dynamic table inserts
    QpackBlockedStreams = 0x07,

    /// SETTINGS_H3_DATAGRAM (0x33)
    H3Datagram = 0x33,
}

impl SettingsParameter {
    /// Convert to u64
    pub fn as_u64(self) -> u64 {
        self as u64
    }

    /// Create from u64
    pub fn from_u64(value: u64) -> Option<Self> {
        match value {
            0x01 => Some(SettingsParameter::QpackMaxTableCapacity),
            0x06 => Some(SettingsParameter::MaxFieldSectionSize),
            0x07 => Some(SettingsParameter::QpackBlockedStreams),
            0x33 => Some(SettingsParameter::H3Datagram),
            _ => None,
        }
    }

    /// Get parameter name
    pub fn name(&self) -> &'static str {
        match self {
            SettingsParameter::QpackMaxTableCapacity => "QPACK_MAX_TABLE_CAPACITY",
            SettingsParameter::MaxFieldSectionSize => "MAX_FIELD_SECTION_SIZE",
            SettingsParameter::QpackBlockedStreams => "QPACK_BLOCKED_STREAMS",
            SettingsParameter::H3Datagram => "H3_DATAGRAM",
        }
    }
}

impl fmt::Display for SettingsParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u64())
    }
}

/// HTTP/2 setting identifiers that must not appear in HTTP/3
fn is_reserved_h2_setting(id: u64) -> bool {
    matches!(id, 0x00 | 0x02 | 0x03 | 0x04 | 0x05)
}

/// HTTP/3 settings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    /// QPACK dynamic table capacity (default: 0)
    pub qpack_max_table_capacity: Option<u64>,

    /// Maximum field section size (default: unlimited)
    pub max_field_section_size: Option<u64>,

    /// QPACK blocked streams (default: 0)
    pub qpack_blocked_streams: Option<u64>,

    /// HTTP/3 datagram support (default: false)
    pub h3_datagram: Option<bool>,
}

impl Settings {
    /// Create empty settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Get QPACK max table capacity (with default)
    pub fn get_qpack_max_table_capacity(&self) -> u64 {
        self.qpack_max_table_capacity.unwrap_or(0)
    }

    /// Get max field section size (None = unlimited)
    pub fn get_max_field_section_size(&self) -> Option<u64> {
        self.max_field_section_size
    }

    /// Get QPACK blocked streams (with default)
    pub fn get_qpack_blocked_streams(&self) -> u64 {
        self.qpack_blocked_streams.unwrap_or(0)
    }

    /// Get datagram support (with default)
    pub fn get_h3_datagram(&self) -> bool {
        self.h3_datagram.unwrap_or(false)
    }

    /// Validate settings values
    pub fn validate(&self) -> Result<()> {
        if let Some(capacity) = self.qpack_max_table_capacity {
            if capacity > MAX_TABLE_CAPACITY {
                return Err(Error::Settings(format!(
                    "QPACK table capacity {} exceeds {}",
                    capacity, MAX_TABLE_CAPACITY
                )));
            }
        }
        Ok(())
    }

    /// Encode as a SETTINGS frame payload
    pub fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        let values = [
            (SettingsParameter::QpackMaxTableCapacity, self.qpack_max_table_capacity),
            (SettingsParameter::MaxFieldSectionSize, self.max_field_section_size),
            (SettingsParameter::QpackBlockedStreams, self.qpack_blocked_streams),
            (SettingsParameter::H3Datagram, self.h3_datagram.map(u64::from)),
        ];
        for (param, value) in values {
            if let Some(value) = value {
                varint::put_varint(buf, param.as_u64())?;
                varint::put_varint(buf, value)?;
            }
        }
        Ok(())
    }

    /// Size of the encoded payload
    pub fn encoded_len(&self) -> usize {
        let mut buf = Vec::new();
        match self.encode(&mut buf) {
            Ok(()) => buf.len(),
            Err(_) => 0,
        }
    }

    /// Decode a SETTINGS frame payload
    ///
    /// Unknown identifiers are ignored; duplicates and HTTP/2-only
    /// identifiers are errors.
    pub fn decode<B: Buf>(payload: &mut B) -> Result<Settings> {
        let mut settings = Settings::new();
        let mut seen = HashSet::new();
        while payload.has_remaining() {
            let id = varint::get_varint(payload).map_err(|e| Error::Frame(format!("SETTINGS identifier: {}", e)))?;
            let value = varint::get_varint(payload).map_err(|e| Error::Frame(format!("SETTINGS value: {}", e)))?;
            if !seen.insert(id) {
                return Err(Error::Settings(format!("duplicate setting 0x{:x}", id)));
            }
            if is_reserved_h2_setting(id) {
                return Err(Error::Settings(format!("HTTP/2 setting 0x{:x} in HTTP/3", id)));
            }
            match SettingsParameter::from_u64(id) {
                Some(SettingsParameter::QpackMaxTableCapacity) => settings.qpack_max_table_capacity = Some(value),
                Some(SettingsParameter::MaxFieldSectionSize) => settings.max_field_section_size = Some(value),
                Some(SettingsParameter::QpackBlockedStreams) => settings.qpack_blocked_streams = Some(value),
                Some(SettingsParameter::H3Datagram) => {
                    if value > 1 {
                        return Err(Error::Settings(format!("H3_DATAGRAM value {}", value)));
                    }
                    settings.h3_datagram = Some(value == 1);
                }
                None => {}
            }
        }
        Ok(settings)
    }

    /// Merge settings from another Settings object
    /// (values in `other` override values in `self`)
    pub fn merge(&mut self, other: &Settings) {
        if other.qpack_max_table_capacity.is_some() {
            self.qpack_max_table_capacity = other.qpack_max_table_capacity;
        }
        if other.max_field_section_size.is_some() {
            self.max_field_section_size = other.max_field_section_size;
        }
        if other.qpack_blocked_streams.is_some() {
            self.qpack_blocked_streams = other.qpack_blocked_streams;
        }
        if other.h3_datagram.is_some() {
            self.h3_datagram = other.h3_datagram;
        }
    }
}

/// Builder for HTTP/3 settings
#[derive(Debug, Default)]
pub struct SettingsBuilder {
    settings: Settings,
}

impl SettingsBuilder {
    /// Create a new settings builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set QPACK max table capacity
    pub fn qpack_max_table_capacity(mut self, capacity: u64) -> Self {
        self.settings.qpack_max_table_capacity = Some(capacity);
        self
    }

    /// Set max field section size
    pub fn max_field_section_size(mut self, size: u64) -> Self {
        self.settings.max_field_section_size = Some(size);
        self
    }

    /// Set QPACK blocked streams
    pub fn qpack_blocked_streams(mut self, streams: u64) -> Self {
        self.settings.qpack_blocked_streams = Some(streams);
        self
    }

    /// Enable or disable HTTP/3 datagrams
    pub fn h3_datagram(mut self, enable: bool) -> Self {
        self.settings.h3_datagram = Some(enable);
        self
    }

    /// Build the settings
    pub fn build(self) -> Result<Settings> {
        self.settings.validate()?;
        Ok(self.settings)
    }
}
