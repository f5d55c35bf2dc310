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

#![allow(unused_variables)]

use core::str::FromStr;
use std::fmt;
use std::time::Instant;

use crate::rtt::RttEstimator;
use crate::space::SentPacket;
use crate::Error;
use crate::RecoveryConfig;
use crate::Result;
pub use cubic::Cubic;
pub use cubic::CubicConfig;
pub use pacing::Pacer;
pub use reno::Reno;
pub use reno::RenoConfig;

/// Available congestion control algorithms.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Default)]
pub enum CongestionControlAlgorithm {
    /// CUBIC uses a cubic function instead of a linear window increase
    /// function to improve scalability and stability under fast and
    /// long-distance networks.
    #[default]
    Cubic,

    /// A NewReno-like algorithm: window grows by acked bytes in slow start
    /// and additively in congestion avoidance, and is multiplicatively
    /// reduced once per loss recovery epoch.
    Reno,
}

impl FromStr for CongestionControlAlgorithm {
    type Err = Error;

    fn from_str(algor: &str) -> Result<CongestionControlAlgorithm> {
        if algor.eq_ignore_ascii_case("cubic") {
            Ok(CongestionControlAlgorithm::Cubic)
        } else if algor.eq_ignore_ascii_case("reno") {
            Ok(CongestionControlAlgorithm::Reno)
        } else {
            Err(Error::InvalidConfig("unknown".into()))
        }
    }
}

/// Congestion control statistics.
#[derive(Debug, Default, Clone)]
pub struct CongestionStats {
    /// Bytes in flight.
    pub bytes_in_flight: u64,

    /// Total bytes sent.
    pub bytes_sent_in_total: u64,

    /// Total bytes acked.
    pub bytes_acked_in_total: u64,

    /// Total bytes lost.
    pub bytes_lost_in_total: u64,

    /// Total bytes acked in slow start.
    pub bytes_acked_in_slow_start: u64,
}

/// Congestion control interfaces shared by different algorithms.
///
/// The loss detector drives implementations through sent/acked/lost events
/// and reads back a congestion window; it stays ignorant of which concrete
/// algorithm is plugged in.
pub trait CongestionController {
    /// Name of the congestion control algorithm.
    fn name(&self) -> &str;

    /// Callback after a packet was sent out.
    fn on_sent(&mut self, now: Instant, packet: &SentPacket, bytes_in_flight: u64);

    /// Callback before the packets of an ACK frame are processed.
    fn begin_ack(&mut self, now: Instant, bytes_in_flight: u64) {}

    /// Callback for processing each newly acked packet.
    fn on_ack(
        &mut self,
        packet: &SentPacket,
        now: Instant,
        rtt: &RttEstimator,
        bytes_in_flight: u64,
    ) {
    }

    /// Callback after all packets of an ACK frame are processed.
    fn end_ack(&mut self) {}

    /// Congestion event, reported at most once per loss detection pass with
    /// the latest lost packet. Packets sent before the start of the current
    /// recovery epoch do not shrink the window again.
    fn on_congestion_event(
        &mut self,
        now: Instant,
        packet: &SentPacket,
        lost_bytes: u64,
        bytes_in_flight: u64,
    ) {
    }

    /// Check if in slow start.
    fn in_slow_start(&self) -> bool {
        false
    }

    /// Check whether a packet sent at `sent_time` falls into the current
    /// recovery epoch.
    fn in_recovery(&self, sent_time: Instant) -> bool {
        false
    }

    /// Current congestion window.
    fn congestion_window(&self) -> u64;

    /// Whether another packet may be sent with the given bytes in flight.
    fn can_send(&self, bytes_in_flight: u64) -> bool {
        bytes_in_flight < self.congestion_window()
    }

    /// Current pacing rate in bytes per second, if the algorithm estimates
    /// one.
    fn pacing_rate(&self) -> Option<u64> {
        None
    }

    /// Initial congestion window.
    fn initial_window(&self) -> u64;

    /// Minimal congestion window.
    fn minimal_window(&self) -> u64;

    /// Congestion stats.
    fn stats(&self) -> &CongestionStats;
}

impl fmt::Debug for dyn CongestionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "congestion controller {}", self.name())
    }
}

/// Build a congestion controller.
pub fn build_congestion_controller(conf: &RecoveryConfig) -> Box<dyn CongestionController> {
    match conf.congestion_control_algorithm {
        CongestionControlAlgorithm::Cubic => Box::new(Cubic::new(CubicConfig::from(conf))),
        CongestionControlAlgorithm::Reno => Box::new(Reno::new(RenoConfig::from(conf))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn congestion_control_name() {
        let cases = [
            ("cubic", Ok(CongestionControlAlgorithm::Cubic)),
            ("Cubic", Ok(CongestionControlAlgorithm::Cubic)),
            ("CUBIC", Ok(CongestionControlAlgorithm::Cubic)),
            ("reno", Ok(CongestionControlAlgorithm::Reno)),
            ("Reno", Ok(CongestionControlAlgorithm::Reno)),
            ("RENO", Ok(CongestionControlAlgorithm::Reno)),
            ("newreno", Err(Error::InvalidConfig("unknown".into()))),
        ];

        for (name, algor) in cases {
            assert_eq!(CongestionControlAlgorithm::from_str(name), algor);
        }
    }

    #[test]
    fn build_controller() {
        let mut conf = RecoveryConfig::default();
        let cc = build_congestion_controller(&conf);
        assert_eq!(cc.name(), "CUBIC");

        conf.congestion_control_algorithm = CongestionControlAlgorithm::Reno;
        let cc = build_congestion_controller(&conf);
        assert_eq!(cc.name(), "RENO");
        assert_eq!(cc.congestion_window(), cc.initial_window());
        assert!(cc.in_slow_start());
        assert!(cc.can_send(cc.congestion_window() - 1));
        assert!(!cc.can_send(cc.congestion_window()));
    }
}

mod cubic;
mod pacing;
mod reno;
