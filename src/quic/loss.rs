//! Loss detection and probe timeouts (RFC 9002 Section 6)
//!
//! `LossDetector` keeps one record per sent packet in each packet number
//! space. Instead of notifying listeners, every operation returns the
//! packets it acknowledged or declared lost, and the connection feeds
//! those batches to congestion control and retransmission.

use super::congestion::RttEstimator;
use super::frames::{AckFrame, Frame};
use super::packet::SpaceId;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Reordering threshold in packets
pub const PACKET_THRESHOLD: u64 = 3;

/// Time threshold numerator and denominator (9/8)
pub const TIME_THRESHOLD_NUM: u32 = 9;
pub const TIME_THRESHOLD_DEN: u32 = 8;

/// Timer granularity
pub const TIMER_GRANULARITY: Duration = Duration::from_millis(1);

/// Exponent cap for PTO backoff
pub const MAX_PTO_BACKOFF: u32 = 10;

/// Record of one sent packet
#[derive(Debug, Clone)]
pub struct SentPacket {
    pub packet_number: u64,
    pub time_sent: Instant,
    pub size: usize,
    pub ack_eliciting: bool,
    pub in_flight: bool,
    /// Frames to retransmit or acknowledge when the fate is known
    pub frames: Vec<Frame>,
}

/// Result of processing one ACK frame
#[derive(Debug, Default)]
pub struct AckOutcome {
    pub newly_acked: Vec<SentPacket>,
    pub newly_lost: Vec<SentPacket>,
    /// RTT sample taken from the largest acknowledged packet
    pub rtt_sample: Option<Duration>,
    pub persistent_congestion: bool,
}

impl AckOutcome {
    /// Bytes in flight that were acknowledged
    pub fn acked_bytes(&self) -> u64 {
        in_flight_bytes(&self.newly_acked)
    }

    /// Bytes in flight that were lost
    pub fn lost_bytes(&self) -> u64 {
        in_flight_bytes(&self.newly_lost)
    }
}

/// Result of a loss detection timer expiry
#[derive(Debug)]
pub enum LossTimeout {
    /// Time threshold loss in a space
    Lost {
        space: SpaceId,
        packets: Vec<SentPacket>,
        persistent_congestion: bool,
    },
    /// Probe timeout: send up to two ack-eliciting probes in `space`
    Probe { space: SpaceId, pto_count: u32 },
}

fn in_flight_bytes(packets: &[SentPacket]) -> u64 {
    packets
        .iter()
        .filter(|p| p.in_flight)
        .map(|p| p.size as u64)
        .sum()
}

#[derive(Debug, Default)]
struct SpaceState {
    sent: BTreeMap<u64, SentPacket>,
    largest_acked: Option<u64>,
    loss_time: Option<Instant>,
    last_ack_eliciting: Option<Instant>,
    ack_eliciting_in_flight: usize,
}

impl SpaceState {
    fn remove(&mut self, pn: u64) -> Option<SentPacket> {
        let packet = self.sent.remove(&pn)?;
        if packet.ack_eliciting && packet.in_flight {
            self.ack_eliciting_in_flight -= 1;
        }
        Some(packet)
    }
}

/// Loss detector for all packet number spaces of a connection
#[derive(Debug)]
pub struct LossDetector {
    spaces: [SpaceState; 3],
    pto_count: u32,
    persistent_congestion_threshold: u32,
    lost_total: u64,
    pto_total: u64,
}

impl LossDetector {
    /// Create a detector
    pub fn new(persistent_congestion_threshold: u32) -> Self {
        LossDetector {
            spaces: Default::default(),
            pto_count: 0,
            persistent_congestion_threshold,
            lost_total: 0,
            pto_total: 0,
        }
    }

    /// Record a sent packet
    pub fn on_packet_sent(&mut self, space: SpaceId, packet: SentPacket) {
        let state = &mut self.spaces[space.index()];
        if packet.ack_eliciting && packet.in_flight {
            state.last_ack_eliciting = Some(packet.time_sent);
            state.ack_eliciting_in_flight += 1;
        }
        trace!(space = ?space, pn = packet.packet_number, size = packet.size, "packet sent");
        state.sent.insert(packet.packet_number, packet);
    }

    /// Largest acknowledged packet number in `space`
    pub fn largest_acked(&self, space: SpaceId) -> Option<u64> {
        self.spaces[space.index()].largest_acked
    }

    /// Number of unacknowledged packets tracked in `space`
    pub fn outstanding(&self, space: SpaceId) -> usize {
        self.spaces[space.index()].sent.len()
    }

    /// Whether any ack-eliciting packet is in flight in any space
    pub fn has_ack_eliciting_in_flight(&self) -> bool {
        self.spaces.iter().any(|s| s.ack_eliciting_in_flight > 0)
    }

    /// Current PTO backoff exponent
    pub fn pto_count(&self) -> u32 {
        self.pto_count
    }

    /// Total packets declared lost
    pub fn lost_total(&self) -> u64 {
        self.lost_total
    }

    /// Total probe timeouts fired
    pub fn pto_total(&self) -> u64 {
        self.pto_total
    }

    /// Process an ACK frame received in `space`
    ///
    /// Updates `rtt` when the largest acknowledged packet is newly acked and
    /// ack-eliciting, then runs loss detection for the space.
    pub fn on_ack_received(
        &mut self,
        space: SpaceId,
        ack: &AckFrame,
        ack_delay: Duration,
        now: Instant,
        rtt: &mut RttEstimator,
        handshake_confirmed: bool,
    ) -> AckOutcome {
        let mut outcome = AckOutcome::default();
        let state = &mut self.spaces[space.index()];
        let largest = ack.largest();
        state.largest_acked = Some(state.largest_acked.map_or(largest, |l| l.max(largest)));

        for &(lo, hi) in &ack.ranges {
            let pns: Vec<u64> = state.sent.range(lo..=hi).map(|(&pn, _)| pn).collect();
            for pn in pns {
                if let Some(packet) = state.remove(pn) {
                    outcome.newly_acked.push(packet);
                }
            }
        }

        if outcome.newly_acked.is_empty() {
            return outcome;
        }
        outcome.newly_acked.sort_by_key(|p| p.packet_number);

        if let Some(last) = outcome.newly_acked.last() {
            if last.packet_number == largest && outcome.newly_acked.iter().any(|p| p.ack_eliciting) {
                let sample = now.saturating_duration_since(last.time_sent);
                rtt.update(sample, ack_delay, handshake_confirmed);
                outcome.rtt_sample = Some(sample);
            }
        }

        let (lost, persistent) = self.detect_lost_packets(space, now, rtt);
        outcome.newly_lost = lost;
        outcome.persistent_congestion = persistent;

        // Peer is making progress: reset the backoff. A client keeps it
        // during the handshake only until Initial/Handshake is acked.
        self.pto_count = 0;
        outcome
    }

    /// Declare packets lost by packet or time threshold
    ///
    /// Each packet is removed when declared lost, so it is reported at most
    /// once whichever threshold triggered.
    pub fn detect_lost_packets(
        &mut self,
        space: SpaceId,
        now: Instant,
        rtt: &RttEstimator,
    ) -> (Vec<SentPacket>, bool) {
        let loss_delay = {
            let base = rtt.latest().max(rtt.smoothed());
            (base * TIME_THRESHOLD_NUM / TIME_THRESHOLD_DEN).max(TIMER_GRANULARITY)
        };
        let persistent_duration =
            (rtt.pto_base() + rtt.max_ack_delay()) * self.persistent_congestion_threshold;

        let state = &mut self.spaces[space.index()];
        state.loss_time = None;
        let Some(largest_acked) = state.largest_acked else {
            return (Vec::new(), false);
        };

        let lost_send_time = now.checked_sub(loss_delay);
        let mut lost_pns = Vec::new();
        for (&pn, packet) in state.sent.range(..largest_acked) {
            let by_time = lost_send_time.map_or(false, |t| packet.time_sent <= t);
            let by_count = largest_acked > pn + PACKET_THRESHOLD;
            if by_time || by_count {
                lost_pns.push(pn);
            } else {
                let deadline = packet.time_sent + loss_delay;
                state.loss_time = Some(state.loss_time.map_or(deadline, |t| t.min(deadline)));
            }
        }

        let lost: Vec<SentPacket> = lost_pns.into_iter().filter_map(|pn| state.remove(pn)).collect();
        if lost.is_empty() {
            return (lost, false);
        }
        self.lost_total += lost.len() as u64;
        debug!(space = ?space, count = lost.len(), first = lost[0].packet_number, "packets lost");

        let persistent = rtt.has_sample() && Self::spans_persistent_congestion(&lost, persistent_duration);
        (lost, persistent)
    }

    /// Whether ack-eliciting losses cover more than `duration`
    fn spans_persistent_congestion(lost: &[SentPacket], duration: Duration) -> bool {
        let mut eliciting = lost.iter().filter(|p| p.ack_eliciting);
        let Some(first) = eliciting.next() else {
            return false;
        };
        let (earliest, latest) = eliciting.fold((first.time_sent, first.time_sent), |(lo, hi), p| {
            (lo.min(p.time_sent), hi.max(p.time_sent))
        });
        latest.saturating_duration_since(earliest) > duration
    }

    /// Probe timeout period for `space`, including backoff
    pub fn pto_period(&self, space: SpaceId, rtt: &RttEstimator) -> Duration {
        let mut period = rtt.pto_base();
        if space == SpaceId::Data {
            period += rtt.max_ack_delay();
        }
        period * (1u32 << self.pto_count.min(MAX_PTO_BACKOFF))
    }

    /// Earliest time-threshold deadline and its space
    fn earliest_loss_time(&self) -> Option<(Instant, SpaceId)> {
        SpaceId::ALL
            .iter()
            .filter_map(|&space| self.spaces[space.index()].loss_time.map(|t| (t, space)))
            .min_by_key(|(t, _)| *t)
    }

    /// Earliest probe timeout deadline and its space
    fn pto_time(&self, rtt: &RttEstimator, handshake_confirmed: bool) -> Option<(Instant, SpaceId)> {
        SpaceId::ALL
            .iter()
            .filter(|&&space| space != SpaceId::Data || handshake_confirmed)
            .filter_map(|&space| {
                let state = &self.spaces[space.index()];
                if state.ack_eliciting_in_flight == 0 {
                    return None;
                }
                state
                    .last_ack_eliciting
                    .map(|t| (t + self.pto_period(space, rtt), space))
            })
            .min_by_key(|(t, _)| *t)
    }

    /// Deadline of the loss detection timer, if armed
    pub fn next_timeout(&self, rtt: &RttEstimator, handshake_confirmed: bool) -> Option<Instant> {
        self.earliest_loss_time()
            .or_else(|| self.pto_time(rtt, handshake_confirmed))
            .map(|(t, _)| t)
    }

    /// Handle expiry of the loss detection timer
    pub fn on_timeout(&mut self, now: Instant, rtt: &RttEstimator, handshake_confirmed: bool) -> Option<LossTimeout> {
        if let Some((deadline, space)) = self.earliest_loss_time() {
            if deadline > now {
                return None;
            }
            let (packets, persistent_congestion) = self.detect_lost_packets(space, now, rtt);
            return Some(LossTimeout::Lost {
                space,
                packets,
                persistent_congestion,
            });
        }

        let (deadline, space) = self.pto_time(rtt, handshake_confirmed)?;
        if deadline > now {
            return None;
        }
        self.pto_count = (self.pto_count + 1).min(MAX_PTO_BACKOFF);
        self.pto_total += 1;
        debug!(space = ?space, pto_count = self.pto_count, "probe timeout");
        Some(LossTimeout::Probe {
            space,
            pto_count: self.pto_count,
        })
    }

    /// Drop all state for a space whose keys were discarded
    ///
    /// Returns the in-flight bytes removed.
    pub fn discard_space(&mut self, space: SpaceId) -> u64 {
        let state = std::mem::take(&mut self.spaces[space.index()]);
        self.pto_count = 0;
        state
            .sent
            .values()
            .filter(|p| p.in_flight)
            .map(|p| p.size as u64)
            .sum()
    }

    /// Remove and return every outstanding packet in `space`
    ///
    /// Used when the packets can never be acknowledged, after a Retry or
    /// when 0-RTT is rejected; the caller requeues their frames.
    pub fn drain_space(&mut self, space: SpaceId) -> Vec<SentPacket> {
        let state = std::mem::take(&mut self.spaces[space.index()]);
        self.spaces[space.index()].largest_acked = state.largest_acked;
        state.sent.into_values().collect()
    }

    /// Frames carried by unacknowledged ack-eliciting packets in `space`,
    /// oldest first
    pub fn unacked_frames(&self, space: SpaceId) -> Vec<Frame> {
        self.spaces[space.index()]
            .sent
            .values()
            .filter(|p| p.ack_eliciting)
            .flat_map(|p| p.frames.iter().cloned())
            .collect()
    }

    /// Forget everything, for connection teardown
    pub fn clear(&mut self) {
        self.spaces = Default::default();
        self.pto_count = 0;
    }
}

impl Default for LossDetector {
    fn default() -> Self {
        Self::new(super::congestion::PERSISTENT_CONGESTION_THRESHOLD)
    }
}
