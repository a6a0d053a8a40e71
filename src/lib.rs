//! quicwire - QUIC transport and HTTP/3 framing
//!
//! This crate provides a sans-I/O QUIC transport (packet protection,
//! streams, flow control, NewReno congestion control, loss recovery,
//! path migration and 0-RTT resumption) together with the QPACK header
//! codec and the HTTP/3 framing layer that rides on top of it.

pub mod h3;
pub mod quic;
