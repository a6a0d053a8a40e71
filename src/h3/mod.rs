//! HTTP/3 over QUIC (RFC 9114) with QPACK header compression (RFC 9204)
//!
//! # Architecture
//!
//! - [`frames`]: the HTTP/3 frame envelope and an incremental reader
//! - [`settings`]: SETTINGS parameters and their builder
//! - [`qpack`]: static/dynamic tables, field section encoder and decoder
//! - [`connection`]: stream roles, SETTINGS exchange, request/response
//!   exchange and GOAWAY on top of [`crate::quic::Connection`]
//!
//! Checking that a received request carries the mandatory pseudo-headers
//! is left to the application; this layer only frames and compresses.
//!
//! # Example
//!
//! ```no_run
//! use quicwire::h3::{H3Config, H3Connection, H3Event};
//! use quicwire::quic::Connection;
//! use std::time::Instant;
//!
//! fn fetch(conn: Connection) -> quicwire::h3::Result<()> {
//!     let mut h3 = H3Connection::new(conn, H3Config::default())?;
//!     let stream = h3.send_request("GET", "https", "example.com", "/", &[])?;
//!     h3.finish(stream)?;
//!
//!     // after datagrams have been exchanged on h3.connection_mut():
//!     h3.process(Instant::now())?;
//!     while let Some(event) = h3.poll_event() {
//!         if let H3Event::Headers { headers, .. } = event {
//!             println!("{:?}", headers);
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod connection;
pub mod error;
pub mod frames;
pub mod qpack;
pub mod settings;

pub use connection::{H3Config, H3Connection, H3Event};
pub use error::{Error, H3ErrorCode, Result};
pub use frames::{FrameReader, FrameType, H3Frame};
pub use qpack::{HeaderField, QpackError};
pub use settings::{Settings, SettingsBuilder, SettingsParameter};

/// ALPN protocol identifier
pub const ALPN: &[u8] = b"h3";

/// Unidirectional stream types (RFC 9114 Section 6.2, RFC 9204 Section 4.2)
pub const STREAM_TYPE_CONTROL: u64 = 0x00;
pub const STREAM_TYPE_PUSH: u64 = 0x01;
pub const STREAM_TYPE_ENCODER: u64 = 0x02;
pub const STREAM_TYPE_DECODER: u64 = 0x03;
