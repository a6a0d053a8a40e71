//! NewReno congestion control and RTT estimation
//!
//! Implements RFC 9002 Section 7 (NewReno) and Section 5 (RTT estimation).
//! The controller is driven by the batches returned from the loss detector;
//! it never calls back into it.

use super::error::{Error, Result};
use super::loss::TIMER_GRANULARITY;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Maximum datagram size assumed for window arithmetic
pub const MAX_DATAGRAM_SIZE: u64 = 1200;

/// Initial congestion window (10 datagrams)
pub const INITIAL_WINDOW: u64 = 10 * MAX_DATAGRAM_SIZE;

/// Minimum congestion window (2 datagrams)
pub const MINIMUM_WINDOW: u64 = 2 * MAX_DATAGRAM_SIZE;

/// Window reduction applied on a congestion event
pub const LOSS_REDUCTION_FACTOR: f64 = 0.5;

/// Persistent congestion threshold, in probe timeout periods
pub const PERSISTENT_CONGESTION_THRESHOLD: u32 = 3;

/// RTT assumed before the first sample
pub const INITIAL_RTT: Duration = Duration::from_millis(333);

/// Default maximum ACK delay
pub const DEFAULT_MAX_ACK_DELAY: Duration = Duration::from_millis(25);

/// Round-trip time estimator (RFC 9002 Section 5)
#[derive(Debug, Clone)]
pub struct RttEstimator {
    latest: Duration,
    smoothed: Duration,
    var: Duration,
    min: Duration,
    has_sample: bool,
    max_ack_delay: Duration,
}

impl RttEstimator {
    /// Create an estimator seeded with `initial_rtt`
    pub fn new(initial_rtt: Duration, max_ack_delay: Duration) -> Self {
        RttEstimator {
            latest: initial_rtt,
            smoothed: initial_rtt,
            var: initial_rtt / 2,
            min: initial_rtt,
            has_sample: false,
            max_ack_delay,
        }
    }

    /// Feed one RTT sample
    ///
    /// After the handshake is confirmed the peer's reported ack delay is
    /// clamped to the negotiated maximum.
    pub fn update(&mut self, sample: Duration, ack_delay: Duration, handshake_confirmed: bool) {
        self.latest = sample;
        if !self.has_sample {
            self.has_sample = true;
            self.min = sample;
            self.smoothed = sample;
            self.var = sample / 2;
            return;
        }

        self.min = self.min.min(sample);
        let ack_delay = if handshake_confirmed {
            ack_delay.min(self.max_ack_delay)
        } else {
            ack_delay
        };
        let adjusted = if sample >= self.min + ack_delay {
            sample - ack_delay
        } else {
            sample
        };

        let diff = if self.smoothed > adjusted {
            self.smoothed - adjusted
        } else {
            adjusted - self.smoothed
        };
        self.var = (self.var * 3 + diff) / 4;
        self.smoothed = (self.smoothed * 7 + adjusted) / 8;
    }

    /// Most recent sample
    pub fn latest(&self) -> Duration {
        self.latest
    }

    /// Smoothed RTT
    pub fn smoothed(&self) -> Duration {
        self.smoothed
    }

    /// RTT variance
    pub fn var(&self) -> Duration {
        self.var
    }

    /// Minimum RTT seen
    pub fn min(&self) -> Duration {
        self.min
    }

    /// Whether at least one sample was taken
    pub fn has_sample(&self) -> bool {
        self.has_sample
    }

    /// Negotiated maximum ACK delay
    pub fn max_ack_delay(&self) -> Duration {
        self.max_ack_delay
    }

    /// Update the peer's maximum ACK delay
    pub fn set_max_ack_delay(&mut self, max_ack_delay: Duration) {
        self.max_ack_delay = max_ack_delay;
    }

    /// Probe timeout base: srtt + max(4 * rttvar, granularity)
    pub fn pto_base(&self) -> Duration {
        self.smoothed + (self.var * 4).max(TIMER_GRANULARITY)
    }
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new(INITIAL_RTT, DEFAULT_MAX_ACK_DELAY)
    }
}

/// Congestion controller phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CongestionPhase {
    SlowStart,
    CongestionAvoidance,
    Recovery,
}

impl CongestionPhase {
    pub fn name(&self) -> &'static str {
        match self {
            CongestionPhase::SlowStart => "SlowStart",
            CongestionPhase::CongestionAvoidance => "CongestionAvoidance",
            CongestionPhase::Recovery => "Recovery",
        }
    }
}

impl fmt::Display for CongestionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Congestion controller configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CongestionConfig {
    pub max_datagram_size: u64,
    /// Initial window in datagrams
    pub initial_window_packets: u64,
    /// Minimum window in datagrams
    pub minimum_window_packets: u64,
    pub loss_reduction_factor: f64,
    pub persistent_congestion_threshold: u32,
    pub initial_rtt: Duration,
}

impl CongestionConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_datagram_size < 1200 {
            return Err(Error::InvalidState(format!(
                "max datagram size {} below 1200",
                self.max_datagram_size
            )));
        }
        if self.minimum_window_packets < 2 || self.initial_window_packets < self.minimum_window_packets {
            return Err(Error::InvalidState(format!(
                "invalid window sizes: initial {} minimum {}",
                self.initial_window_packets, self.minimum_window_packets
            )));
        }
        if !(0.0..1.0).contains(&self.loss_reduction_factor) || self.loss_reduction_factor == 0.0 {
            return Err(Error::InvalidState(format!(
                "loss reduction factor {} outside (0, 1)",
                self.loss_reduction_factor
            )));
        }
        if self.persistent_congestion_threshold == 0 {
            return Err(Error::InvalidState(
                "persistent congestion threshold must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Initial window in bytes
    pub fn initial_window(&self) -> u64 {
        self.initial_window_packets * self.max_datagram_size
    }

    /// Minimum window in bytes
    pub fn minimum_window(&self) -> u64 {
        self.minimum_window_packets * self.max_datagram_size
    }
}

impl Default for CongestionConfig {
    fn default() -> Self {
        CongestionConfig {
            max_datagram_size: MAX_DATAGRAM_SIZE,
            initial_window_packets: 10,
            minimum_window_packets: 2,
            loss_reduction_factor: LOSS_REDUCTION_FACTOR,
            persistent_congestion_threshold: PERSISTENT_CONGESTION_THRESHOLD,
            initial_rtt: INITIAL_RTT,
        }
    }
}

/// Counters kept by the congestion controller
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CongestionStats {
    pub packets_sent: u64,
    pub packets_acked: u64,
    pub packets_lost: u64,
    pub bytes_acked: u64,
    pub bytes_lost: u64,
    pub congestion_events: u64,
    pub persistent_congestion_events: u64,
}

impl CongestionStats {
    /// Fraction of sent packets declared lost
    pub fn loss_rate(&self) -> f64 {
        if self.packets_sent == 0 {
            0.0
        } else {
            self.packets_lost as f64 / self.packets_sent as f64
        }
    }
}

/// NewReno congestion controller
#[derive(Debug, Clone)]
pub struct NewReno {
    config: CongestionConfig,
    window: u64,
    ssthresh: u64,
    bytes_in_flight: u64,
    phase: CongestionPhase,
    /// When the current recovery period began. An ack for a packet sent
    /// after this instant ends Recovery, and losses of packets sent before
    /// it do not reduce the window again.
    recovery_start: Option<Instant>,
    /// Bytes acked in congestion avoidance not yet turned into growth
    avoidance_credit: u64,
    rtt: RttEstimator,
    stats: CongestionStats,
}

impl NewReno {
    /// Create a controller
    pub fn new(config: CongestionConfig, max_ack_delay: Duration) -> Self {
        NewReno {
            window: config.initial_window(),
            ssthresh: u64::MAX,
            bytes_in_flight: 0,
            phase: CongestionPhase::SlowStart,
            recovery_start: None,
            avoidance_credit: 0,
            rtt: RttEstimator::new(config.initial_rtt, max_ack_delay),
            stats: CongestionStats::default(),
            config,
        }
    }

    /// Whether `n` more bytes fit in the window
    #[inline]
    pub fn can_send(&self, n: u64) -> bool {
        self.bytes_in_flight.saturating_add(n) <= self.window
    }

    /// Window bytes still available
    pub fn available(&self) -> u64 {
        self.window.saturating_sub(self.bytes_in_flight)
    }

    /// Current congestion window
    pub fn window(&self) -> u64 {
        self.window
    }

    /// Slow start threshold
    pub fn ssthresh(&self) -> u64 {
        self.ssthresh
    }

    /// Bytes in flight
    pub fn bytes_in_flight(&self) -> u64 {
        self.bytes_in_flight
    }

    /// Current phase
    pub fn phase(&self) -> CongestionPhase {
        self.phase
    }

    /// RTT estimator
    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    /// Mutable RTT estimator
    pub fn rtt_mut(&mut self) -> &mut RttEstimator {
        &mut self.rtt
    }

    /// Counters
    pub fn stats(&self) -> CongestionStats {
        self.stats
    }

    /// Pacing rate in bytes per second: 5/4 of the window per smoothed RTT
    pub fn pacing_rate(&self) -> u64 {
        let srtt = self.rtt.smoothed().as_secs_f64();
        if srtt <= 0.0 {
            return u64::MAX;
        }
        ((self.window as f64 * 1.25) / srtt) as u64
    }

    /// Interval between packets of `size` bytes at the pacing rate
    pub fn pacing_interval(&self, size: u64) -> Duration {
        match self.pacing_rate() {
            0 => Duration::ZERO,
            u64::MAX => Duration::ZERO,
            rate => Duration::from_secs_f64(size as f64 / rate as f64),
        }
    }

    /// Account for a packet counted in flight
    pub fn on_packet_sent(&mut self, size: u64) {
        self.bytes_in_flight += size;
        self.stats.packets_sent += 1;
    }

    /// Account for an acknowledged in-flight packet
    pub fn on_packet_acked(&mut self, size: u64, time_sent: Instant) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(size);
        self.stats.packets_acked += 1;
        self.stats.bytes_acked += size;

        if let Some(start) = self.recovery_start {
            if time_sent <= start {
                return;
            }
            if self.phase == CongestionPhase::Recovery {
                self.phase = CongestionPhase::CongestionAvoidance;
                debug!(cwnd = self.window, "exited recovery");
            }
        }

        match self.phase {
            CongestionPhase::SlowStart => {
                self.window += size;
                if self.window >= self.ssthresh {
                    self.phase = CongestionPhase::CongestionAvoidance;
                    debug!(cwnd = self.window, "slow start finished");
                }
            }
            CongestionPhase::CongestionAvoidance => {
                // One datagram per window acknowledged
                self.avoidance_credit += size;
                while self.avoidance_credit >= self.window {
                    self.avoidance_credit -= self.window;
                    self.window += self.config.max_datagram_size;
                }
            }
            CongestionPhase::Recovery => {}
        }
        trace!(cwnd = self.window, inflight = self.bytes_in_flight, "packet acked");
    }

    /// Account for lost in-flight packets
    ///
    /// `largest_lost_sent` is the send time of the newest lost packet; a new
    /// recovery period starts only when it was sent after the current one
    /// began, so one window is reduced once per round trip.
    pub fn on_packets_lost(&mut self, lost_bytes: u64, lost_packets: u64, largest_lost_sent: Instant, now: Instant) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(lost_bytes);
        self.stats.packets_lost += lost_packets;
        self.stats.bytes_lost += lost_bytes;

        if let Some(start) = self.recovery_start {
            if largest_lost_sent <= start {
                return;
            }
        }

        self.recovery_start = Some(now);
        self.stats.congestion_events += 1;
        let reduced = (self.window as f64 * self.config.loss_reduction_factor) as u64;
        self.ssthresh = reduced.max(self.config.minimum_window());
        self.window = self.ssthresh;
        self.avoidance_credit = 0;
        self.phase = CongestionPhase::Recovery;
        debug!(cwnd = self.window, ssthresh = self.ssthresh, "entered recovery");
    }

    /// Collapse the window after persistent congestion
    pub fn on_persistent_congestion(&mut self) {
        self.window = self.config.minimum_window();
        self.ssthresh = self.window;
        self.recovery_start = None;
        self.avoidance_credit = 0;
        self.phase = CongestionPhase::SlowStart;
        self.stats.persistent_congestion_events += 1;
        debug!(cwnd = self.window, "persistent congestion");
    }

    /// Remove bytes of discarded packets without treating them as lost
    pub fn on_packets_discarded(&mut self, bytes: u64) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(bytes);
    }

    /// Persistent congestion duration for the current RTT estimate
    pub fn persistent_congestion_duration(&self) -> Duration {
        (self.rtt.pto_base() + self.rtt.max_ack_delay()) * self.config.persistent_congestion_threshold
    }
}

impl Default for NewReno {
    fn default() -> Self {
        Self::new(CongestionConfig::default(), DEFAULT_MAX_ACK_DELAY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_initial_state() {
        let cc = NewReno::default();
        assert_eq!(cc.window(), INITIAL_WINDOW);
        assert_eq!(cc.phase(), CongestionPhase::SlowStart);
        assert_eq!(cc.bytes_in_flight(), 0);
        assert_eq!(cc.rtt().smoothed(), Duration::from_millis(333));
        assert_eq!(cc.rtt().var(), Duration::from_millis(166) + Duration::from_micros(500));
    }

    #[test]
    fn test_can_send() {
        let mut cc = NewReno::default();
        assert!(cc.can_send(INITIAL_WINDOW));
        assert!(!cc.can_send(INITIAL_WINDOW + 1));
        cc.on_packet_sent(INITIAL_WINDOW - 100);
        assert!(cc.can_send(100));
        assert!(!cc.can_send(101));
    }

    #[test]
    fn test_slow_start_growth_then_loss() {
        let mut cc = NewReno::default();
        let start = Instant::now();
        let mut previous = cc.window();
        for i in 0..10 {
            let sent = start + Duration::from_millis(i);
            cc.on_packet_sent(MAX_DATAGRAM_SIZE);
            cc.on_packet_acked(MAX_DATAGRAM_SIZE, sent);
            assert!(cc.window() > previous);
            assert_eq!(cc.phase(), CongestionPhase::SlowStart);
            previous = cc.window();
        }

        cc.on_packet_sent(MAX_DATAGRAM_SIZE);
        let now = start + Duration::from_millis(100);
        cc.on_packets_lost(MAX_DATAGRAM_SIZE, 1, start + Duration::from_millis(50), now);
        assert_eq!(cc.window(), previous / 2);
        assert_eq!(cc.phase(), CongestionPhase::Recovery);
        assert_eq!(cc.stats().congestion_events, 1);
    }

    #[test]
    fn test_recovery_single_reduction() {
        let mut cc = NewReno::default();
        let start = Instant::now();
        let now = start + Duration::from_millis(100);
        cc.on_packets_lost(1200, 1, start, now);
        let window = cc.window();
        // Packet sent before recovery began: no further reduction
        cc.on_packets_lost(1200, 1, start + Duration::from_millis(10), now + Duration::from_millis(5));
        assert_eq!(cc.window(), window);
        assert_eq!(cc.stats().congestion_events, 1);
    }

    #[test]
    fn test_recovery_exit() {
        let mut cc = NewReno::default();
        let start = Instant::now();
        let recovery = start + Duration::from_millis(100);
        cc.on_packets_lost(1200, 1, start, recovery);
        let window = cc.window();

        cc.on_packet_sent(1200);
        cc.on_packet_acked(1200, start + Duration::from_millis(50));
        assert_eq!(cc.phase(), CongestionPhase::Recovery);
        assert_eq!(cc.window(), window);

        cc.on_packet_sent(1200);
        cc.on_packet_acked(1200, recovery + Duration::from_millis(1));
        assert_eq!(cc.phase(), CongestionPhase::CongestionAvoidance);
        assert_eq!(cc.window(), window);
    }

    #[test]
    fn test_congestion_avoidance_linear() {
        let mut cc = NewReno::default();
        let start = Instant::now();
        cc.on_packets_lost(0, 1, start, start);
        cc.on_packet_acked(0, start + Duration::from_millis(1));
        let window = cc.window();
        let acks = window / MAX_DATAGRAM_SIZE;
        for i in 0..acks {
            cc.on_packet_sent(MAX_DATAGRAM_SIZE);
            cc.on_packet_acked(MAX_DATAGRAM_SIZE, start + Duration::from_millis(2 + i));
        }
        // One datagram of growth per window
        assert_eq!(cc.window(), window + MAX_DATAGRAM_SIZE);
    }

    #[test]
    fn test_persistent_congestion() {
        let mut cc = NewReno::default();
        cc.on_persistent_congestion();
        assert_eq!(cc.window(), MINIMUM_WINDOW);
        assert_eq!(cc.phase(), CongestionPhase::SlowStart);
    }

    #[test]
    fn test_rtt_estimator() {
        let mut rtt = RttEstimator::default();
        rtt.update(Duration::from_millis(100), Duration::ZERO, false);
        assert_eq!(rtt.smoothed(), Duration::from_millis(100));
        assert_eq!(rtt.var(), Duration::from_millis(50));
        assert_eq!(rtt.min(), Duration::from_millis(100));

        rtt.update(Duration::from_millis(200), Duration::ZERO, false);
        assert_eq!(rtt.latest(), Duration::from_millis(200));
        assert_eq!(rtt.smoothed(), Duration::from_micros(112_500));
        assert_eq!(rtt.var(), Duration::from_millis(62) + Duration::from_micros(500));
    }

    #[test]
    fn test_rtt_ack_delay_clamped() {
        let mut rtt = RttEstimator::new(INITIAL_RTT, Duration::from_millis(25));
        rtt.update(Duration::from_millis(100), Duration::ZERO, true);
        // Reported delay 80ms clamped to 25ms: adjusted sample 175ms
        rtt.update(Duration::from_millis(200), Duration::from_millis(80), true);
        assert_eq!(rtt.smoothed(), (Duration::from_millis(100) * 7 + Duration::from_millis(175)) / 8);
    }

    #[test]
    fn test_pacing_rate() {
        let mut cc = NewReno::default();
        cc.rtt_mut().update(Duration::from_millis(100), Duration::ZERO, false);
        // 12000 * 1.25 / 0.1s
        assert_eq!(cc.pacing_rate(), 150_000);
        let interval = cc.pacing_interval(1500);
        assert!(interval >= Duration::from_micros(9_999) && interval <= Duration::from_micros(10_001));
    }

    #[test]
    fn test_config_validation() {
        assert!(CongestionConfig::default().validate().is_ok());
        let bad = CongestionConfig {
            minimum_window_packets: 1,
            ..CongestionConfig::default()
        };
        assert!(bad.validate().is_err());
    }

    proptest! {
        #[test]
        fn prop_window_never_below_minimum(events in proptest::collection::vec((0u8..3, 1u64..5000), 1..300)) {
            let mut cc = NewReno::default();
            let start = Instant::now();
            for (i, (kind, size)) in events.into_iter().enumerate() {
                let t = start + Duration::from_millis(i as u64);
                match kind {
                    0 => {
                        cc.on_packet_sent(size);
                        cc.on_packet_acked(size, t);
                    }
                    1 => cc.on_packets_lost(size, 1, t, t),
                    _ => cc.on_persistent_congestion(),
                }
                prop_assert!(cc.window() >= MINIMUM_WINDOW);
            }
        }
    }
}
