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

use std::time::Duration;
use std::time::Instant;

use log::*;

use super::CongestionController;
use super::CongestionStats;
use crate::rtt::RttEstimator;
use crate::space::SentPacket;
use crate::RecoveryConfig;

/// Multiplicative decrease factor applied to the window on a congestion
/// event.
/// See RFC 9002 Section 7.3.1
const LOSS_REDUCTION_FACTOR: f64 = 0.5;

/// Reno configuration.
#[derive(Debug)]
pub struct RenoConfig {
    /// Minimal congestion window in bytes.
    min_congestion_window: u64,

    /// Initial congestion window in bytes.
    initial_congestion_window: u64,

    /// Max datagram size in bytes.
    max_datagram_size: u64,

    /// Initial rtt.
    initial_rtt: Duration,
}

impl RenoConfig {
    pub fn from(conf: &RecoveryConfig) -> Self {
        let max_datagram_size = conf.max_datagram_size as u64;
        Self {
            min_congestion_window: conf.min_congestion_window.saturating_mul(max_datagram_size),
            initial_congestion_window: conf
                .initial_congestion_window
                .saturating_mul(max_datagram_size),
            max_datagram_size,
            initial_rtt: conf.initial_rtt,
        }
    }
}

impl Default for RenoConfig {
    fn default() -> Self {
        RenoConfig::from(&RecoveryConfig::default())
    }
}

/// A NewReno-like congestion control algorithm.
///
/// See RFC 9002 Section 7 and RFC 6582.
#[derive(Debug)]
pub struct Reno {
    /// Configuration.
    config: RenoConfig,

    /// Congestion window in bytes.
    cwnd: u64,

    /// Slow start threshold in bytes.
    ssthresh: u64,

    /// Bytes acked since the last full-window increase during congestion
    /// avoidance.
    bytes_acked_in_avoidance: u64,

    /// Time the current recovery epoch started, if any. Only packets sent
    /// after this instant can trigger another window reduction.
    recovery_epoch_start: Option<Instant>,

    /// Pacing rate in bytes per second.
    pacing_rate: u64,

    /// Congestion statistics.
    stats: CongestionStats,
}

impl Reno {
    pub fn new(config: RenoConfig) -> Self {
        let initial_cwnd = config.initial_congestion_window;
        let initial_rtt = std::cmp::max(config.initial_rtt, Duration::from_micros(1));
        let pacing_rate = (initial_cwnd as f64 / initial_rtt.as_secs_f64()) as u64;
        Self {
            config,
            cwnd: initial_cwnd,
            ssthresh: u64::MAX,
            bytes_acked_in_avoidance: 0,
            recovery_epoch_start: None,
            pacing_rate,
            stats: Default::default(),
        }
    }

    fn update_pacing_rate(&mut self, rtt: &RttEstimator) {
        let srtt = rtt.smoothed_rtt();
        if !srtt.is_zero() {
            self.pacing_rate = (self.cwnd as f64 / srtt.as_secs_f64()) as u64;
        }
    }
}

impl CongestionController for Reno {
    fn name(&self) -> &str {
        "RENO"
    }

    fn on_sent(&mut self, now: Instant, packet: &SentPacket, bytes_in_flight: u64) {
        self.stats.bytes_in_flight = bytes_in_flight;
        self.stats.bytes_sent_in_total = self
            .stats
            .bytes_sent_in_total
            .saturating_add(packet.sent_size as u64);
    }

    fn on_ack(
        &mut self,
        packet: &SentPacket,
        now: Instant,
        rtt: &RttEstimator,
        bytes_in_flight: u64,
    ) {
        let acked_bytes = packet.sent_size as u64;
        self.stats.bytes_in_flight = bytes_in_flight;
        self.stats.bytes_acked_in_total =
            self.stats.bytes_acked_in_total.saturating_add(acked_bytes);

        // Packets sent before the current recovery epoch do not grow the
        // window.
        if self.in_recovery(packet.time_sent) {
            return;
        }

        if self.in_slow_start() {
            // Window grows by the number of acked bytes.
            self.cwnd = self.cwnd.saturating_add(acked_bytes);
            self.stats.bytes_acked_in_slow_start = self
                .stats
                .bytes_acked_in_slow_start
                .saturating_add(acked_bytes);
        } else {
            // Additive increase: one datagram per window of acked bytes.
            self.bytes_acked_in_avoidance += acked_bytes;
            while self.bytes_acked_in_avoidance >= self.cwnd {
                self.bytes_acked_in_avoidance -= self.cwnd;
                self.cwnd = self.cwnd.saturating_add(self.config.max_datagram_size);
            }
        }

        self.update_pacing_rate(rtt);
    }

    fn on_congestion_event(
        &mut self,
        now: Instant,
        packet: &SentPacket,
        lost_bytes: u64,
        bytes_in_flight: u64,
    ) {
        self.stats.bytes_in_flight = bytes_in_flight;
        self.stats.bytes_lost_in_total = self.stats.bytes_lost_in_total.saturating_add(lost_bytes);

        // The window is reduced at most once per round trip; losses of
        // packets sent before the current epoch started are ignored.
        if self.in_recovery(packet.time_sent) {
            return;
        }
        self.recovery_epoch_start = Some(now);

        self.cwnd = std::cmp::max(
            (self.cwnd as f64 * LOSS_REDUCTION_FACTOR) as u64,
            self.config.min_congestion_window,
        );
        self.ssthresh = self.cwnd;
        self.bytes_acked_in_avoidance = 0;

        trace!(
            "{} congestion event, cwnd reduced to {}",
            self.name(),
            self.cwnd
        );
    }

    fn in_slow_start(&self) -> bool {
        self.cwnd < self.ssthresh
    }

    fn in_recovery(&self, sent_time: Instant) -> bool {
        match self.recovery_epoch_start {
            Some(epoch) => sent_time <= epoch,
            None => false,
        }
    }

    fn congestion_window(&self) -> u64 {
        self.cwnd
    }

    fn pacing_rate(&self) -> Option<u64> {
        Some(self.pacing_rate)
    }

    fn initial_window(&self) -> u64 {
        self.config.initial_congestion_window
    }

    fn minimal_window(&self) -> u64 {
        self.config.min_congestion_window
    }

    fn stats(&self) -> &CongestionStats {
        &self.stats
    }
}
