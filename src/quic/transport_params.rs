//! QUIC transport parameters
//!
//! This module implements the transport parameter extension as defined in
//! RFC 9000 Section 18. The TLS engine carries the encoded bytes; the
//! connection decodes the peer's copy once the handshake delivers it.

use super::error::{Error, Result};
use super::packet::ConnectionId;
use super::stream::Side;
use super::varint::{encoded_len, get_varint, put_varint};
use bytes::{Buf, Bytes};
use std::fmt;
use std::time::Duration;

/// Transport parameter identifiers (RFC 9000 Section 18.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum TransportParameterId {
    OriginalDestinationConnectionId = 0x00,
    MaxIdleTimeout = 0x01,
    StatelessResetToken = 0x02,
    MaxUdpPayloadSize = 0x03,
    InitialMaxData = 0x04,
    InitialMaxStreamDataBidiLocal = 0x05,
    InitialMaxStreamDataBidiRemote = 0x06,
    InitialMaxStreamDataUni = 0x07,
    InitialMaxStreamsBidi = 0x08,
    InitialMaxStreamsUni = 0x09,
    AckDelayExponent = 0x0a,
    MaxAckDelay = 0x0b,
    DisableActiveMigration = 0x0c,
    ActiveConnectionIdLimit = 0x0e,
    InitialSourceConnectionId = 0x0f,
    RetrySourceConnectionId = 0x10,
    /// RFC 9221
    MaxDatagramFrameSize = 0x20,
}

impl TransportParameterId {
    /// Convert to u64
    pub fn as_u64(self) -> u64 {
        self as u64
    }

    /// Create from u64
    pub fn from_u64(value: u64) -> Option<Self> {
        use TransportParameterId::*;
        Some(match value {
            0x00 => OriginalDestinationConnectionId,
            0x01 => MaxIdleTimeout,
            0x02 => StatelessResetToken,
            0x03 => MaxUdpPayloadSize,
            0x04 => InitialMaxData,
            0x05 => InitialMaxStreamDataBidiLocal,
            0x06 => InitialMaxStreamDataBidiRemote,
            0x07 => InitialMaxStreamDataUni,
            0x08 => InitialMaxStreamsBidi,
            0x09 => InitialMaxStreamsUni,
            0x0a => AckDelayExponent,
            0x0b => MaxAckDelay,
            0x0c => DisableActiveMigration,
            0x0e => ActiveConnectionIdLimit,
            0x0f => InitialSourceConnectionId,
            0x10 => RetrySourceConnectionId,
            0x20 => MaxDatagramFrameSize,
            _ => return None,
        })
    }

    /// Get parameter name
    pub fn name(&self) -> &'static str {
        use TransportParameterId::*;
        match self {
            OriginalDestinationConnectionId => "original_destination_connection_id",
            MaxIdleTimeout => "max_idle_timeout",
            StatelessResetToken => "stateless_reset_token",
            MaxUdpPayloadSize => "max_udp_payload_size",
            InitialMaxData => "initial_max_data",
            InitialMaxStreamDataBidiLocal => "initial_max_stream_data_bidi_local",
            InitialMaxStreamDataBidiRemote => "initial_max_stream_data_bidi_remote",
            InitialMaxStreamDataUni => "initial_max_stream_data_uni",
            InitialMaxStreamsBidi => "initial_max_streams_bidi",
            InitialMaxStreamsUni => "initial_max_streams_uni",
            AckDelayExponent => "ack_delay_exponent",
            MaxAckDelay => "max_ack_delay",
            DisableActiveMigration => "disable_active_migration",
            ActiveConnectionIdLimit => "active_connection_id_limit",
            InitialSourceConnectionId => "initial_source_connection_id",
            RetrySourceConnectionId => "retry_source_connection_id",
            MaxDatagramFrameSize => "max_datagram_frame_size",
        }
    }

    /// Whether only a server may send this parameter
    pub fn is_server_only(self) -> bool {
        matches!(
            self,
            TransportParameterId::OriginalDestinationConnectionId
                | TransportParameterId::StatelessResetToken
                | TransportParameterId::RetrySourceConnectionId
        )
    }
}

impl fmt::Display for TransportParameterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u64())
    }
}

/// Largest stream count a peer may advertise (2^60)
pub const MAX_STREAM_COUNT: u64 = 1 << 60;

/// Transport parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportParameters {
    pub original_destination_connection_id: Option<ConnectionId>,
    /// Milliseconds; 0 disables the idle timeout
    pub max_idle_timeout: u64,
    pub stateless_reset_token: Option<[u8; 16]>,
    pub max_udp_payload_size: u64,
    pub initial_max_data: u64,
    pub initial_max_stream_data_bidi_local: u64,
    pub initial_max_stream_data_bidi_remote: u64,
    pub initial_max_stream_data_uni: u64,
    pub initial_max_streams_bidi: u64,
    pub initial_max_streams_uni: u64,
    pub ack_delay_exponent: u64,
    /// Milliseconds
    pub max_ack_delay: u64,
    pub disable_active_migration: bool,
    pub active_connection_id_limit: u64,
    pub initial_source_connection_id: Option<ConnectionId>,
    pub retry_source_connection_id: Option<ConnectionId>,
    /// 0 means DATAGRAM frames are not supported
    pub max_datagram_frame_size: u64,
}

impl TransportParameters {
    /// Values implied when a parameter is absent from the wire
    pub fn absent() -> Self {
        TransportParameters {
            original_destination_connection_id: None,
            max_idle_timeout: 0,
            stateless_reset_token: None,
            max_udp_payload_size: 65527,
            initial_max_data: 0,
            initial_max_stream_data_bidi_local: 0,
            initial_max_stream_data_bidi_remote: 0,
            initial_max_stream_data_uni: 0,
            initial_max_streams_bidi: 0,
            initial_max_streams_uni: 0,
            ack_delay_exponent: 3,
            max_ack_delay: 25,
            disable_active_migration: false,
            active_connection_id_limit: 2,
            initial_source_connection_id: None,
            retry_source_connection_id: None,
            max_datagram_frame_size: 0,
        }
    }

    /// Idle timeout, `None` when disabled
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.max_idle_timeout > 0).then(|| Duration::from_millis(self.max_idle_timeout))
    }

    /// Maximum ACK delay
    pub fn max_ack_delay_duration(&self) -> Duration {
        Duration::from_millis(self.max_ack_delay)
    }

    /// Validate value ranges
    pub fn validate(&self) -> Result<()> {
        if self.max_udp_payload_size < 1200 {
            return Err(Error::TransportParameter(format!(
                "max_udp_payload_size {} below 1200",
                self.max_udp_payload_size
            )));
        }
        if self.ack_delay_exponent > 20 {
            return Err(Error::TransportParameter(format!(
                "ack_delay_exponent {} above 20",
                self.ack_delay_exponent
            )));
        }
        if self.max_ack_delay >= 1 << 14 {
            return Err(Error::TransportParameter(format!(
                "max_ack_delay {} too large",
                self.max_ack_delay
            )));
        }
        if self.active_connection_id_limit < 2 {
            return Err(Error::TransportParameter(format!(
                "active_connection_id_limit {} below 2",
                self.active_connection_id_limit
            )));
        }
        if self.initial_max_streams_bidi > MAX_STREAM_COUNT || self.initial_max_streams_uni > MAX_STREAM_COUNT {
            return Err(Error::TransportParameter("stream limit above 2^60".to_string()));
        }
        Ok(())
    }

    /// Encode as a sequence of `{id}{length}{value}` entries
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(128);
        use TransportParameterId::*;

        if let Some(cid) = &self.original_destination_connection_id {
            put_bytes(&mut buf, OriginalDestinationConnectionId, cid.as_bytes())?;
        }
        put_int(&mut buf, MaxIdleTimeout, self.max_idle_timeout)?;
        if let Some(token) = &self.stateless_reset_token {
            put_bytes(&mut buf, StatelessResetToken, token)?;
        }
        put_int(&mut buf, MaxUdpPayloadSize, self.max_udp_payload_size)?;
        put_int(&mut buf, InitialMaxData, self.initial_max_data)?;
        put_int(&mut buf, InitialMaxStreamDataBidiLocal, self.initial_max_stream_data_bidi_local)?;
        put_int(&mut buf, InitialMaxStreamDataBidiRemote, self.initial_max_stream_data_bidi_remote)?;
        put_int(&mut buf, InitialMaxStreamDataUni, self.initial_max_stream_data_uni)?;
        put_int(&mut buf, InitialMaxStreamsBidi, self.initial_max_streams_bidi)?;
        put_int(&mut buf, InitialMaxStreamsUni, self.initial_max_streams_uni)?;
        put_int(&mut buf, AckDelayExponent, self.ack_delay_exponent)?;
        put_int(&mut buf, MaxAckDelay, self.max_ack_delay)?;
        if self.disable_active_migration {
            put_bytes(&mut buf, DisableActiveMigration, &[])?;
        }
        put_int(&mut buf, ActiveConnectionIdLimit, self.active_connection_id_limit)?;
        if let Some(cid) = &self.initial_source_connection_id {
            put_bytes(&mut buf, InitialSourceConnectionId, cid.as_bytes())?;
        }
        if let Some(cid) = &self.retry_source_connection_id {
            put_bytes(&mut buf, RetrySourceConnectionId, cid.as_bytes())?;
        }
        if self.max_datagram_frame_size > 0 {
            put_int(&mut buf, MaxDatagramFrameSize, self.max_datagram_frame_size)?;
        }
        Ok(buf)
    }

    /// Decode parameters sent by `sender`
    ///
    /// Unknown identifiers are skipped; duplicates, server-only parameters
    /// from a client and out-of-range values are errors.
    pub fn decode(data: &[u8], sender: Side) -> Result<Self> {
        let mut buf = Bytes::copy_from_slice(data);
        let mut params = TransportParameters::absent();
        let mut seen = std::collections::HashSet::new();

        while buf.has_remaining() {
            let id = get_varint(&mut buf)?;
            let len = get_varint(&mut buf)? as usize;
            if buf.remaining() < len {
                return Err(Error::TransportParameter(format!(
                    "parameter 0x{:x} truncated",
                    id
                )));
            }
            let mut value = buf.split_to(len);

            if !seen.insert(id) {
                return Err(Error::TransportParameter(format!("duplicate parameter 0x{:x}", id)));
            }
            let Some(param) = TransportParameterId::from_u64(id) else {
                continue;
            };
            if param.is_server_only() && sender == Side::Client {
                return Err(Error::TransportParameter(format!("client sent {}", param)));
            }

            use TransportParameterId::*;
            match param {
                OriginalDestinationConnectionId => {
                    params.original_destination_connection_id = Some(ConnectionId::new(&value)?)
                }
                InitialSourceConnectionId => params.initial_source_connection_id = Some(ConnectionId::new(&value)?),
                RetrySourceConnectionId => params.retry_source_connection_id = Some(ConnectionId::new(&value)?),
                StatelessResetToken => {
                    let token: [u8; 16] = value[..].try_into().map_err(|_| {
                        Error::TransportParameter(format!("reset token of {} bytes", value.len()))
                    })?;
                    params.stateless_reset_token = Some(token);
                }
                DisableActiveMigration => {
                    if !value.is_empty() {
                        return Err(Error::TransportParameter(
                            "disable_active_migration carries a value".to_string(),
                        ));
                    }
                    params.disable_active_migration = true;
                }
                _ => {
                    let v = get_varint(&mut value)?;
                    if value.has_remaining() {
                        return Err(Error::TransportParameter(format!("trailing bytes in {}", param)));
                    }
                    match param {
                        MaxIdleTimeout => params.max_idle_timeout = v,
                        MaxUdpPayloadSize => params.max_udp_payload_size = v,
                        InitialMaxData => params.initial_max_data = v,
                        InitialMaxStreamDataBidiLocal => params.initial_max_stream_data_bidi_local = v,
                        InitialMaxStreamDataBidiRemote => params.initial_max_stream_data_bidi_remote = v,
                        InitialMaxStreamDataUni => params.initial_max_stream_data_uni = v,
                        InitialMaxStreamsBidi => params.initial_max_streams_bidi = v,
                        InitialMaxStreamsUni => params.initial_max_streams_uni = v,
                        AckDelayExponent => params.ack_delay_exponent = v,
                        MaxAckDelay => params.max_ack_delay = v,
                        ActiveConnectionIdLimit => params.active_connection_id_limit = v,
                        MaxDatagramFrameSize => params.max_datagram_frame_size = v,
                        _ => {}
                    }
                }
            }
        }

        params.validate()?;
        Ok(params)
    }
}

impl Default for TransportParameters {
    fn default() -> Self {
        TransportParameters {
            max_idle_timeout: 30_000,
            max_udp_payload_size: 1200,
            initial_max_data: super::DEFAULT_MAX_DATA,
            initial_max_stream_data_bidi_local: super::DEFAULT_MAX_STREAM_DATA,
            initial_max_stream_data_bidi_remote: super::DEFAULT_MAX_STREAM_DATA,
            initial_max_stream_data_uni: super::DEFAULT_MAX_STREAM_DATA,
            initial_max_streams_bidi: super::DEFAULT_MAX_STREAMS_BIDI,
            initial_max_streams_uni: super::DEFAULT_MAX_STREAMS_UNI,
            ..TransportParameters::absent()
        }
    }
}

fn put_int(buf: &mut Vec<u8>, id: TransportParameterId, value: u64) -> Result<()> {
    put_varint(buf, id.as_u64())?;
    put_varint(buf, encoded_len(value) as u64)?;
    put_varint(buf, value)
}

fn put_bytes(buf: &mut Vec<u8>, id: TransportParameterId, value: &[u8]) -> Result<()> {
    put_varint(buf, id.as_u64())?;
    put_varint(buf, value.len() as u64)?;
    buf.extend_from_slice(value);
    Ok(())
}

/// Builder for transport parameters
pub struct TransportParametersBuilder {
    params: TransportParameters,
}

impl TransportParametersBuilder {
    /// Start from the crate defaults
    pub fn new() -> Self {
        TransportParametersBuilder {
            params: TransportParameters::default(),
        }
    }

    /// Set idle timeout
    pub fn max_idle_timeout(mut self, timeout: Duration) -> Self {
        self.params.max_idle_timeout = timeout.as_millis() as u64;
        self
    }

    /// Set max UDP payload size
    pub fn max_udp_payload_size(mut self, size: u64) -> Self {
        self.params.max_udp_payload_size = size;
        self
    }

    /// Set connection-level receive window
    pub fn initial_max_data(mut self, max: u64) -> Self {
        self.params.initial_max_data = max;
        self
    }

    /// Set every per-stream receive window
    pub fn initial_max_stream_data(mut self, max: u64) -> Self {
        self.params.initial_max_stream_data_bidi_local = max;
        self.params.initial_max_stream_data_bidi_remote = max;
        self.params.initial_max_stream_data_uni = max;
        self
    }

    /// Set peer bidirectional stream limit
    pub fn initial_max_streams_bidi(mut self, max: u64) -> Self {
        self.params.initial_max_streams_bidi = max;
        self
    }

    /// Set peer unidirectional stream limit
    pub fn initial_max_streams_uni(mut self, max: u64) -> Self {
        self.params.initial_max_streams_uni = max;
        self
    }

    /// Set ack delay exponent
    pub fn ack_delay_exponent(mut self, exponent: u64) -> Self {
        self.params.ack_delay_exponent = exponent;
        self
    }

    /// Set max ack delay
    pub fn max_ack_delay(mut self, delay: Duration) -> Self {
        self.params.max_ack_delay = delay.as_millis() as u64;
        self
    }

    /// Disable active migration
    pub fn disable_active_migration(mut self, disable: bool) -> Self {
        self.params.disable_active_migration = disable;
        self
    }

    /// Set active connection ID limit
    pub fn active_connection_id_limit(mut self, limit: u64) -> Self {
        self.params.active_connection_id_limit = limit;
        self
    }

    /// Enable DATAGRAM frames up to `size` bytes
    pub fn max_datagram_frame_size(mut self, size: u64) -> Self {
        self.params.max_datagram_frame_size = size;
        self
    }

    /// Build the parameters
    pub fn build(self) -> Result<TransportParameters> {
        self.params.validate()?;
        Ok(self.params)
    }
}

impl Default for TransportParametersBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let params = TransportParameters::default();
        assert_eq!(params.max_idle_timeout, 30_000);
        assert_eq!(params.max_udp_payload_size, 1200);
        assert_eq!(params.initial_max_data, 10 * 1024 * 1024);
        assert_eq!(params.initial_max_stream_data_bidi_local, 1024 * 1024);
        assert_eq!(params.initial_max_streams_bidi, 100);
        assert_eq!(params.ack_delay_exponent, 3);
        assert_eq!(params.max_ack_delay, 25);
        assert_eq!(params.active_connection_id_limit, 2);
        assert_eq!(params.idle_timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_encode_decode() {
        let mut params = TransportParametersBuilder::new()
            .initial_max_streams_bidi(8)
            .max_datagram_frame_size(1200)
            .disable_active_migration(true)
            .build()
            .unwrap();
        params.initial_source_connection_id = Some(ConnectionId::new(&[1, 2, 3, 4]).unwrap());
        params.original_destination_connection_id = Some(ConnectionId::new(&[9; 8]).unwrap());
        params.stateless_reset_token = Some([7; 16]);

        let encoded = params.encode().unwrap();
        let decoded = TransportParameters::decode(&encoded, Side::Server).unwrap();
        assert_eq!(decoded, params);
    }

    #[test]
    fn test_absent_values() {
        let decoded = TransportParameters::decode(&[], Side::Client).unwrap();
        assert_eq!(decoded, TransportParameters::absent());
        assert_eq!(decoded.idle_timeout(), None);
    }

    #[test]
    fn test_unknown_parameter_skipped() {
        let mut data = vec![0x40, 0x99, 0x02, 0xaa, 0xbb];
        data.extend_from_slice(&[0x04, 0x02, 0x44, 0x00]);
        let decoded = TransportParameters::decode(&data, Side::Client).unwrap();
        assert_eq!(decoded.initial_max_data, 0x400);
    }

    #[test]
    fn test_duplicate_rejected() {
        let data = [0x04, 0x01, 0x10, 0x04, 0x01, 0x20];
        assert!(matches!(
            TransportParameters::decode(&data, Side::Client),
            Err(Error::TransportParameter(_))
        ));
    }

    #[test]
    fn test_server_only_from_client_rejected() {
        let mut data = vec![0x02, 0x10];
        data.extend_from_slice(&[0u8; 16]);
        assert!(TransportParameters::decode(&data, Side::Client).is_err());
        assert!(TransportParameters::decode(&data, Side::Server).is_ok());
    }

    #[test]
    fn test_invalid_values_rejected() {
        // max_udp_payload_size = 1000
        let data = [0x03, 0x02, 0x43, 0xe8];
        assert!(TransportParameters::decode(&data, Side::Client).is_err());
        // ack_delay_exponent = 21
        let data = [0x0a, 0x01, 0x15];
        assert!(TransportParameters::decode(&data, Side::Client).is_err());
        // truncated value
        let data = [0x04, 0x04, 0x01];
        assert!(TransportParameters::decode(&data, Side::Client).is_err());
    }

    #[test]
    fn test_builder_validation() {
        assert!(TransportParametersBuilder::new().active_connection_id_limit(1).build().is_err());
        assert!(TransportParametersBuilder::new().max_udp_payload_size(1500).build().is_ok());
    }

    #[test]
    fn test_parameter_names() {
        assert_eq!(TransportParameterId::MaxAckDelay.to_string(), "max_ack_delay (0xb)");
        assert_eq!(TransportParameterId::from_u64(0x0d), None);
        assert!(TransportParameterId::StatelessResetToken.is_server_only());
    }
}
