//! QUIC flow control
//!
//! This module implements credit-based flow control as defined in
//! RFC 9000 Section 4.
//!
//! Unlike HTTP/2 windows, QUIC limits are absolute byte offsets: the
//! sender tracks how many bytes it has committed against the peer's
//! advertised limit, and the receiver raises its advertised limit as the
//! application consumes data. Limits only ever grow.

use super::error::{Error, Result};
use super::DEFAULT_MAX_STREAM_DATA;
use std::time::{Duration, Instant};

/// Default fraction of the window that must be consumed before an update
pub const DEFAULT_UPDATE_THRESHOLD: f64 = 0.5;

/// Auto-tuning never grows a window beyond this multiple of its initial size
pub const MAX_WINDOW_MULTIPLIER: u64 = 16;

/// Flow control tuning knobs
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlowControlConfig {
    /// Fraction (0.1-0.9) of the window consumed before a window update is due
    pub update_threshold: f64,
    /// Grow receive windows when the peer drains them within two RTTs
    pub autotune: bool,
    /// Upper bound for auto-tuned windows, as a multiple of the initial window
    pub max_window_multiplier: u64,
}

impl FlowControlConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !(0.1..=0.9).contains(&self.update_threshold) {
            return Err(Error::FlowControl(format!(
                "update threshold {} outside 0.1-0.9",
                self.update_threshold
            )));
        }
        if self.max_window_multiplier == 0 {
            return Err(Error::FlowControl("window multiplier must be non-zero".to_string()));
        }
        Ok(())
    }
}

impl Default for FlowControlConfig {
    fn default() -> Self {
        FlowControlConfig {
            update_threshold: DEFAULT_UPDATE_THRESHOLD,
            autotune: true,
            max_window_multiplier: MAX_WINDOW_MULTIPLIER,
        }
    }
}

/// Send-side credit granted by the peer
///
/// `consumed` never exceeds the highest `limit` ever applied.
#[derive(Debug, Clone)]
pub struct SendCredit {
    limit: u64,
    consumed: u64,
    /// Limit at which we last reported being blocked
    blocked_at: Option<u64>,
}

impl SendCredit {
    /// Create with the peer's initial limit
    pub fn new(limit: u64) -> Self {
        SendCredit {
            limit,
            consumed: 0,
            blocked_at: None,
        }
    }

    /// Current limit
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Bytes committed so far
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Remaining credit
    pub fn available(&self) -> u64 {
        self.limit - self.consumed
    }

    /// Check whether `n` more bytes fit under the limit
    pub fn can_send(&self, n: u64) -> bool {
        self.consumed
            .checked_add(n)
            .map_or(false, |total| total <= self.limit)
    }

    /// Commit `n` bytes that were actually sent
    pub fn record_sent(&mut self, n: u64) -> Result<()> {
        if !self.can_send(n) {
            return Err(Error::FlowControl(format!(
                "sending {} bytes exceeds limit {} (consumed {})",
                n, self.limit, self.consumed
            )));
        }
        self.consumed += n;
        Ok(())
    }

    /// Apply a MAX_DATA / MAX_STREAM_DATA update
    ///
    /// Returns true when the limit grew; stale updates are ignored.
    pub fn record_limit_update(&mut self, new_limit: u64) -> bool {
        if new_limit > self.limit {
            self.limit = new_limit;
            true
        } else {
            false
        }
    }

    /// Whether all credit is used up
    pub fn is_blocked(&self) -> bool {
        self.consumed >= self.limit
    }

    /// Limit to report in a *_BLOCKED frame, at most once per limit value
    pub fn take_blocked(&mut self) -> Option<u64> {
        if self.is_blocked() && self.blocked_at != Some(self.limit) {
            self.blocked_at = Some(self.limit);
            Some(self.limit)
        } else {
            None
        }
    }
}

/// Receive-side credit we advertise to the peer
#[derive(Debug, Clone)]
pub struct RecvCredit {
    /// Limit advertised to the peer
    limit: u64,
    /// Highest offset received (stream) or sum of highest offsets (connection)
    received: u64,
    /// Bytes handed to the application
    consumed: u64,
    /// Window size used for updates
    window: u64,
    max_window: u64,
    threshold: f64,
    autotune: bool,
    last_update: Option<Instant>,
}

impl RecvCredit {
    /// Create with our initial window
    pub fn new(window: u64, config: &FlowControlConfig) -> Self {
        RecvCredit {
            limit: window,
            received: 0,
            consumed: 0,
            window,
            max_window: window.saturating_mul(config.max_window_multiplier),
            threshold: config.update_threshold,
            autotune: config.autotune,
            last_update: None,
        }
    }

    /// Advertised limit
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Bytes received so far
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Bytes consumed by the application
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Current window size
    pub fn window(&self) -> u64 {
        self.window
    }

    /// Account for newly received bytes
    pub fn record_received(&mut self, n: u64) -> Result<()> {
        let total = self.received.saturating_add(n);
        if total > self.limit {
            return Err(Error::FlowControl(format!(
                "peer sent {} bytes, limit is {}",
                total, self.limit
            )));
        }
        self.received = total;
        Ok(())
    }

    /// Account for bytes the application has read
    pub fn record_consumed(&mut self, n: u64) {
        self.consumed = (self.consumed + n).min(self.received);
    }

    /// New limit to advertise, if consumption crossed the update threshold
    ///
    /// Grows the window when the previous update was consumed within
    /// two round trips.
    pub fn should_update(&mut self, now: Instant, rtt: Duration) -> Option<u64> {
        let remaining = self.limit - self.consumed;
        if (remaining as f64) > (self.window as f64) * (1.0 - self.threshold) {
            return None;
        }

        if self.autotune {
            if let Some(last) = self.last_update {
                if now.saturating_duration_since(last) < rtt * 2 && self.window < self.max_window {
                    self.window = (self.window * 2).min(self.max_window);
                    tracing::trace!(window = self.window, "receive window auto-tuned");
                }
            }
        }
        self.last_update = Some(now);

        let new_limit = self.consumed + self.window;
        if new_limit > self.limit {
            self.limit = new_limit;
            Some(new_limit)
        } else {
            None
        }
    }
}

/// Send and receive credit for one scope (the connection or a stream)
#[derive(Debug, Clone)]
pub struct FlowControlWindow {
    pub send: SendCredit,
    pub recv: RecvCredit,
}

impl FlowControlWindow {
    /// Create from the peer's limit and our receive window
    pub fn new(peer_limit: u64, local_window: u64, config: &FlowControlConfig) -> Self {
        FlowControlWindow {
            send: SendCredit::new(peer_limit),
            recv: RecvCredit::new(local_window, config),
        }
    }

    /// Check if `n` bytes can be sent
    pub fn can_send(&self, n: u64) -> bool {
        self.send.can_send(n)
    }
}

impl Default for FlowControlWindow {
    fn default() -> Self {
        Self::new(
            DEFAULT_MAX_STREAM_DATA,
            DEFAULT_MAX_STREAM_DATA,
            &FlowControlConfig::default(),
        )
    }
}
