// Copyright (c) 2024 The QuicRecovery Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Loss detection and acknowledgment tracking engine for QUIC-like
//! transports.
//!
//! The crate provides the two public-facing components of the recovery
//! machinery described in RFC 9002:
//!
//! * [`SentPacketHandler`] records outgoing packets, processes incoming ACK
//!   frames, detects lost packets, drives the congestion controller and the
//!   pacer, and computes the loss detection timeout.
//! * [`ReceivedPacketHandler`] records incoming packets, answers duplicate
//!   queries, and builds the ACK frames to be sent to the peer.
//!
//! The engine performs no I/O and owns no timers. All deadlines are exposed
//! as plain values and every mutating operation takes the current time as an
//! argument, so the caller's event loop schedules re-entry and tests run on
//! a logical clock.

use std::cmp;
use std::time::Duration;

use crate::congestion_control::CongestionControlAlgorithm;

/// The RECOMMENDED value of the timer granularity is 1 millisecond.
/// See RFC 9002 Section 6.1
pub const TIMER_GRANULARITY: Duration = Duration::from_millis(1);

/// When no previous RTT is available, the initial RTT SHOULD be set to
/// 333 milliseconds. This results in handshakes starting with a PTO of
/// 1 second, as recommended for TCP's initial RTO.
/// See RFC 9002 Section 6.2.2
const INITIAL_RTT: Duration = Duration::from_millis(333);

/// An endpoint MUST limit the amount of data it sends to the unvalidated
/// address to three times the amount of data received from that address.
/// See RFC 9000 Section 8.1
const ANTI_AMPLIFICATION_FACTOR: usize = 3;

/// Ensure the ACK frame can fit in a single minimum-MTU packet.
const MAX_ACK_RANGES: usize = 68;

/// Default outgoing udp datagram payloads size.
const DEFAULT_SEND_UDP_PAYLOAD_SIZE: usize = 1200;

/// Default maximum amount of time by which a receiver delays acknowledgments
/// for ack-eliciting 1-RTT packets.
const DEFAULT_MAX_ACK_DELAY: Duration = Duration::from_millis(25);

/// The number of ack-eliciting packets received since the last ACK was sent
/// after which an ACK is sent immediately.
const ACK_ELICITING_THRESHOLD: usize = 2;

/// Default linear factor for calculating the probe timeout.
const DEFAULT_PTO_LINEAR_FACTOR: u64 = 0;

/// Default upper limit of probe timeout.
const MAX_PTO: Duration = Duration::MAX;

/// Result type for recovery operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Configuration for loss recovery, congestion control and pacing.
///
/// The numeric constants of the loss detection algorithm are policy rather
/// than correctness; they are exposed here with the RFC 9002 recommended
/// defaults.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// The maximum size of outgoing UDP payloads.
    pub max_datagram_size: usize,

    /// The maximum amount of time the endpoint intends to delay
    /// acknowledgments for ack-eliciting packets in the 1-RTT packet number
    /// space. It is used both for ACK generation and for PTO calculation.
    pub max_ack_delay: Duration,

    /// The congestion control algorithm used for the connection.
    pub congestion_control_algorithm: CongestionControlAlgorithm,

    /// The minimal congestion window in packets.
    /// The RECOMMENDED value is 2 * max_datagram_size.
    /// See RFC 9002 Section 7.2
    pub min_congestion_window: u64,

    /// The initial congestion window in packets.
    /// Endpoints SHOULD use an initial congestion window of ten times the
    /// maximum datagram size.
    /// See RFC 9002 Section 7.2
    pub initial_congestion_window: u64,

    /// The initial rtt, used before an RTT sample is taken.
    pub initial_rtt: Duration,

    /// Maximum reordering in packets before packet threshold loss detection
    /// considers a packet lost.
    pub packet_threshold: u64,

    /// Maximum reordering in time before time threshold loss detection
    /// considers a packet lost. Specified as an RTT multiplier.
    pub time_threshold: f64,

    /// Enable pacing to smooth the flow of packets sent onto the network.
    pub enable_pacing: bool,

    /// Clock granularity used by the pacer.
    pub pacing_granularity: Duration,

    /// The endpoint does not back off the first `pto_linear_factor`
    /// consecutive probe timeouts.
    pub pto_linear_factor: u64,

    /// Upper limit of probe timeout.
    pub max_pto: Duration,

    /// Limit on the ratio between sent and received bytes before the peer
    /// address is validated.
    pub anti_amplification_factor: usize,
}

impl RecoveryConfig {
    /// Set the initial RTT in milliseconds. The value is clamped from below
    /// by the timer granularity.
    pub fn set_initial_rtt(&mut self, millis: u64) -> &mut Self {
        self.initial_rtt = cmp::max(Duration::from_millis(millis), TIMER_GRANULARITY);
        self
    }

    /// Set the `max_ack_delay` in milliseconds.
    pub fn set_max_ack_delay(&mut self, millis: u64) -> &mut Self {
        self.max_ack_delay = Duration::from_millis(millis);
        self
    }

    /// Set the congestion control algorithm.
    pub fn set_congestion_control_algorithm(
        &mut self,
        algorithm: CongestionControlAlgorithm,
    ) -> &mut Self {
        self.congestion_control_algorithm = algorithm;
        self
    }

    /// Set the upper limit of the probe timeout in milliseconds. The value is
    /// clamped from below by the timer granularity.
    pub fn set_max_pto(&mut self, millis: u64) -> &mut Self {
        self.max_pto = cmp::max(Duration::from_millis(millis), TIMER_GRANULARITY);
        self
    }

    /// Set the anti-amplification factor. Values below the RFC 9000 limit of
    /// 3 are rejected.
    pub fn set_anti_amplification_factor(&mut self, factor: usize) -> &mut Self {
        self.anti_amplification_factor = cmp::max(factor, ANTI_AMPLIFICATION_FACTOR);
        self
    }
}

impl Default for RecoveryConfig {
    fn default() -> RecoveryConfig {
        RecoveryConfig {
            max_datagram_size: DEFAULT_SEND_UDP_PAYLOAD_SIZE,
            max_ack_delay: DEFAULT_MAX_ACK_DELAY,
            congestion_control_algorithm: CongestionControlAlgorithm::Cubic,
            min_congestion_window: 2_u64,
            initial_congestion_window: 10_u64,
            initial_rtt: INITIAL_RTT,
            packet_threshold: crate::recovery::INITIAL_PACKET_THRESHOLD,
            time_threshold: crate::recovery::INITIAL_TIME_THRESHOLD,
            enable_pacing: true,
            pacing_granularity: TIMER_GRANULARITY,
            pto_linear_factor: DEFAULT_PTO_LINEAR_FACTOR,
            max_pto: MAX_PTO,
            anti_amplification_factor: ANTI_AMPLIFICATION_FACTOR,
        }
    }
}

/// Aggregate statistics of the recovery engine, exposed for observability
/// and tracing consumers.
#[derive(Debug, Default, Clone)]
pub struct RecoveryStats {
    /// Total number of sent packets.
    pub sent_count: u64,

    /// Total number of sent bytes.
    pub sent_bytes: u64,

    /// Total number of received packets.
    pub recv_count: u64,

    /// Total number of received bytes.
    pub recv_bytes: u64,

    /// Total number of packets acked.
    pub acked_count: u64,

    /// Total number of bytes acked.
    pub acked_bytes: u64,

    /// Total number of packets declared lost.
    pub lost_count: u64,

    /// Total number of bytes declared lost.
    pub lost_bytes: u64,

    /// The minimum RTT observed, in microseconds.
    pub min_rtt: u64,

    /// The smoothed RTT, in microseconds.
    pub srtt: u64,

    /// The RTT variance, in microseconds.
    pub rttvar: u64,

    /// The current congestion window in bytes.
    pub cwnd: u64,

    /// Whether the congestion controller is in slow start.
    pub in_slow_start: bool,

    /// The current pacing rate in bytes per second, if the congestion
    /// controller estimates one.
    pub pacing_rate: u64,
}

pub use crate::congestion_control::CongestionController;
pub use crate::congestion_control::CongestionStats;
pub use crate::error::Error;
pub use crate::frame::AckFrame;
pub use crate::frame::Frame;
pub use crate::ranges::RangeSet;
pub use crate::received::ReceivedPacketHandler;
pub use crate::recovery::AckOutcome;
pub use crate::recovery::SendMode;
pub use crate::recovery::SentPacketHandler;
pub use crate::rtt::RttEstimator;
pub use crate::space::AckedPacket;
pub use crate::space::Level;
pub use crate::space::SentPacket;

#[path = "congestion_control/congestion_control.rs"]
pub mod congestion_control;

pub mod error;
pub mod frame;
mod ranges;
mod received;
mod recovery;
mod rtt;
mod space;
mod window;

#[cfg(test)]
mod tests {
    use super::*;

    #[ctor::ctor]
    fn init() {
        env_logger::builder()
            .filter_level(log::LevelFilter::Trace)
            .format_timestamp_millis()
            .is_test(true)
            .init();
    }

    #[test]
    fn initial_rtt_clamping() {
        let mut config = RecoveryConfig::default();

        config.set_initial_rtt(0);
        assert_eq!(config.initial_rtt, TIMER_GRANULARITY);

        config.set_initial_rtt(100);
        assert_eq!(config.initial_rtt, Duration::from_millis(100));
    }

    #[test]
    fn max_pto_clamping() {
        let mut config = RecoveryConfig::default();
        assert_eq!(config.max_pto, MAX_PTO);

        config.set_max_pto(0);
        assert_eq!(config.max_pto, TIMER_GRANULARITY);

        config.set_max_pto(60_000);
        assert_eq!(config.max_pto, Duration::from_secs(60));
    }

    #[test]
    fn amplification_factor_lower_bound() {
        let mut config = RecoveryConfig::default();
        config.set_anti_amplification_factor(1);
        assert_eq!(config.anti_amplification_factor, ANTI_AMPLIFICATION_FACTOR);

        config.set_anti_amplification_factor(5);
        assert_eq!(config.anti_amplification_factor, 5);
    }

    fn one_rtt_pkt(pkt_num: u64, frames: &[Frame], time_sent: std::time::Instant) -> SentPacket {
        SentPacket {
            pkt_num,
            frames: frames.iter().cloned().collect(),
            time_sent,
            ack_eliciting: true,
            in_flight: true,
            sent_size: 1200,
            ..SentPacket::default()
        }
    }

    #[test]
    fn ack_round_trip() {
        let t0 = std::time::Instant::now();
        let conf = RecoveryConfig::default();
        let mut sender = SentPacketHandler::new(&conf, false, t0);
        sender.set_handshake_complete(t0);
        let mut receiver = ReceivedPacketHandler::new(&conf);

        // Three packets go out and arrive in order.
        for _ in 0..3 {
            let pn = sender.pop_packet_number(Level::OneRtt).unwrap();
            sender
                .on_packet_sent(one_rtt_pkt(pn, &[Frame::Ping], t0), Level::OneRtt, t0)
                .unwrap();
        }
        let t1 = t0 + Duration::from_millis(30);
        for pn in 0..3 {
            receiver
                .received_packet(pn, Level::OneRtt, true, t1)
                .unwrap();
        }

        // The ACK built by the receiver acknowledges exactly what was sent
        // and reports how long the acknowledgment was held back.
        let t2 = t1 + Duration::from_millis(10);
        let ack = receiver.get_ack_frame(Level::OneRtt, true, t2).unwrap();
        assert_eq!(ack.largest_acked(), Some(2));
        assert_eq!(ack.ack_delay, Duration::from_millis(10));

        let out = sender
            .on_ack_received(&ack, Level::OneRtt, t2 + Duration::from_millis(30))
            .unwrap();
        assert_eq!(out.acked.len(), 3);
        assert!(out.lost_frames.is_empty());
        assert_eq!(sender.bytes_in_flight(), 0);
    }

    #[test]
    fn confirmed_ack_ages_receive_ranges() {
        let t0 = std::time::Instant::now();
        let conf = RecoveryConfig::default();
        let mut sender = SentPacketHandler::new(&conf, false, t0);
        sender.set_handshake_complete(t0);
        let mut receiver = ReceivedPacketHandler::new(&conf);

        for pn in 0..6 {
            receiver
                .received_packet(pn, Level::OneRtt, true, t0)
                .unwrap();
        }

        // Our packet carrying ACK(largest=5) is itself acknowledged; the
        // peer has provably seen those ranges acknowledged.
        let pn = sender.pop_packet_number(Level::OneRtt).unwrap();
        let mut pkt = one_rtt_pkt(pn, &[Frame::Ack { largest_acked: 5 }, Frame::Ping], t0);
        pkt.largest_acked = Some(5);
        sender.on_packet_sent(pkt, Level::OneRtt, t0).unwrap();

        let mut ranges = RangeSet::default();
        ranges.add_elem(pn);
        let ack = AckFrame {
            ack_delay: Duration::ZERO,
            ranges,
        };
        let out = sender
            .on_ack_received(&ack, Level::OneRtt, t0 + Duration::from_millis(20))
            .unwrap();
        assert_eq!(out.peer_confirmed_acked, Some(5));

        // Everything at or below the confirmed number ages out of future
        // ACK frames.
        receiver.ignore_below(Level::OneRtt, 5 + 1);
        assert!(receiver
            .get_ack_frame(Level::OneRtt, false, t0)
            .is_none());

        receiver
            .received_packet(6, Level::OneRtt, true, t0)
            .unwrap();
        let ack = receiver.get_ack_frame(Level::OneRtt, false, t0).unwrap();
        assert_eq!(ack.ranges.min(), Some(6));
    }

    #[test]
    fn config_setters() {
        let mut config = RecoveryConfig::default();
        config
            .set_max_ack_delay(40)
            .set_congestion_control_algorithm(CongestionControlAlgorithm::Reno);
        assert_eq!(config.max_ack_delay, Duration::from_millis(40));
        assert_eq!(
            config.congestion_control_algorithm,
            CongestionControlAlgorithm::Reno
        );
    }
}
