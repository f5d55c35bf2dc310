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

/// Cubic constant C, determining the aggressiveness of window growth.
///
/// See <https://www.rfc-editor.org/rfc/rfc9438.html#name-constants-of-interest>.
const C: f64 = 0.4;

/// CUBIC multiplicative decrease factor.
///
/// See <https://www.rfc-editor.org/rfc/rfc9438.html#name-constants-of-interest>.
const BETA: f64 = 0.7;

/// CUBIC additive increase factor used in the Reno-friendly region.
///
/// See <https://www.rfc-editor.org/rfc/rfc9438.html#Reno-friendly>.
const ALPHA: f64 = 3.0 * (1.0 - BETA) / (1.0 + BETA);

/// Cubic configuration.
#[derive(Debug)]
pub struct CubicConfig {
    /// Constant C.
    c: f64,

    /// Beta.
    beta: f64,

    /// Minimal congestion window in bytes.
    min_congestion_window: u64,

    /// Initial congestion window in bytes.
    initial_congestion_window: u64,

    /// Max datagram size in bytes.
    max_datagram_size: u64,

    /// Enable fast convergence, default to true.
    fast_convergence_enabled: bool,

    /// Initial rtt.
    initial_rtt: Duration,
}

impl CubicConfig {
    pub fn from(conf: &RecoveryConfig) -> Self {
        let max_datagram_size = conf.max_datagram_size as u64;
        Self {
            c: C,
            beta: BETA,
            min_congestion_window: conf.min_congestion_window.saturating_mul(max_datagram_size),
            initial_congestion_window: conf
                .initial_congestion_window
                .saturating_mul(max_datagram_size),
            max_datagram_size,
            fast_convergence_enabled: true,
            initial_rtt: conf.initial_rtt,
        }
    }
}

impl Default for CubicConfig {
    fn default() -> Self {
        CubicConfig::from(&RecoveryConfig::default())
    }
}

/// Cubic congestion control algorithm.
///
/// See <https://www.rfc-editor.org/rfc/rfc9438.html>.
#[derive(Debug)]
pub struct Cubic {
    /// Configuration.
    config: CubicConfig,

    /// Congestion window in bytes.
    cwnd: u64,

    /// Slow start threshold in bytes.
    ssthresh: u64,

    /// The window size just before the last multiplicative reduction.
    w_max: f64,

    /// The period W_cubic takes to grow the window back to w_max absent
    /// further congestion events.
    k: f64,

    /// Additive increase factor for the Reno-friendly region.
    alpha: f64,

    /// Estimated Reno-equivalent window.
    w_est: f64,

    /// Window increment accumulated during congestion avoidance.
    cwnd_inc: u64,

    /// Time the current recovery epoch started, if any.
    recovery_epoch_start: Option<Instant>,

    /// Pacing rate in bytes per second.
    pacing_rate: u64,

    /// Congestion statistics.
    stats: CongestionStats,
}

impl Cubic {
    pub fn new(config: CubicConfig) -> Self {
        let initial_cwnd = config.initial_congestion_window;
        let initial_rtt = std::cmp::max(config.initial_rtt, Duration::from_micros(1));
        let pacing_rate = (initial_cwnd as f64 / initial_rtt.as_secs_f64()) as u64;
        Self {
            config,
            cwnd: initial_cwnd,
            ssthresh: u64::MAX,
            w_max: 0_f64,
            k: 0_f64,
            alpha: ALPHA,
            w_est: 0_f64,
            cwnd_inc: 0,
            recovery_epoch_start: None,
            pacing_rate,
            stats: Default::default(),
        }
    }

    /// The cubic window increase function.
    ///
    /// See <https://www.rfc-editor.org/rfc/rfc9438.html#name-window-increase-function>.
    fn w_cubic(&self, t: Duration) -> f64 {
        // W_cubic(t) = C*(t-K)^3 + W_max
        self.config.c * (t.as_secs_f64() - self.k).powi(3) * self.config.max_datagram_size as f64
            + self.w_max
    }

    /// Parameter K of the window increase function.
    fn cubic_k(&self, cwnd: u64) -> f64 {
        // K = cubic_root((W_max - cwnd_epoch)/C)
        if self.w_max > cwnd as f64 {
            ((self.w_max - cwnd as f64) / self.config.max_datagram_size as f64 / self.config.c)
                .cbrt()
        } else {
            0.0
        }
    }

    fn update_pacing_rate(&mut self, rtt: &RttEstimator) {
        let srtt = rtt.smoothed_rtt();
        if !srtt.is_zero() {
            self.pacing_rate = (self.cwnd as f64 / srtt.as_secs_f64()) as u64;
        }
    }
}

impl CongestionController for Cubic {
    fn name(&self) -> &str {
        "CUBIC"
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

        if self.in_recovery(packet.time_sent) {
            return;
        }

        if self.in_slow_start() {
            self.cwnd = self.cwnd.saturating_add(acked_bytes);
            self.stats.bytes_acked_in_slow_start = self
                .stats
                .bytes_acked_in_slow_start
                .saturating_add(acked_bytes);
        } else {
            // Congestion avoidance.
            let t = match self.recovery_epoch_start {
                Some(epoch) => now.saturating_duration_since(epoch),
                None => {
                    // No congestion event so far; start the cubic epoch here.
                    self.recovery_epoch_start = Some(now);
                    self.w_max = self.cwnd as f64;
                    self.k = 0_f64;
                    self.w_est = self.cwnd as f64;
                    self.alpha = ALPHA;
                    Duration::ZERO
                }
            };

            // target = W_cubic(t+RTT), clamped to [cwnd, 1.5*cwnd].
            let target = self
                .w_cubic(t.saturating_add(rtt.smoothed_rtt()))
                .clamp(self.cwnd as f64, 1.5 * self.cwnd as f64);

            // Reno-friendly region estimate.
            self.w_est += self.alpha * acked_bytes as f64 / self.cwnd as f64
                * self.config.max_datagram_size as f64;
            if self.w_est >= self.w_max {
                self.alpha = 1.0_f64;
            }

            let mut cwnd = self.cwnd;
            if self.w_cubic(t) < self.w_est {
                // Reno-friendly region: follow the Reno estimate.
                cwnd = cwnd.max(self.w_est as u64);
            } else {
                // Concave or convex region: approach the target.
                let cubic_inc =
                    (target - cwnd as f64) / cwnd as f64 * self.config.max_datagram_size as f64;
                cwnd += cubic_inc as u64;
            }

            // Grow in whole datagrams.
            self.cwnd_inc += cwnd - self.cwnd;
            self.cwnd +=
                self.cwnd_inc / self.config.max_datagram_size * self.config.max_datagram_size;
            self.cwnd_inc %= self.config.max_datagram_size;
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

        if self.in_recovery(packet.time_sent) {
            return;
        }
        self.recovery_epoch_start = Some(now);

        // Fast convergence: release bandwidth faster when losses repeat
        // below the previous saturation point.
        // See <https://www.rfc-editor.org/rfc/rfc9438.html#name-fast-convergence>.
        self.w_max = if self.config.fast_convergence_enabled && (self.cwnd as f64) < self.w_max {
            self.cwnd as f64 * (1.0 + self.config.beta) / 2.0
        } else {
            self.cwnd as f64
        };

        self.cwnd = std::cmp::max(
            (self.cwnd as f64 * self.config.beta) as u64,
            self.config.min_congestion_window,
        );
        self.ssthresh = self.cwnd;
        self.k = self.cubic_k(self.cwnd);
        self.w_est = self.cwnd as f64;
        self.alpha = ALPHA;
        self.cwnd_inc = 0;

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

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_packet(pkt_num: u64, sent_size: usize, time_sent: Instant) -> SentPacket {
        SentPacket {
            pkt_num,
            time_sent,
            ack_eliciting: true,
            in_flight: true,
            sent_size,
            ..SentPacket::default()
        }
    }

    #[test]
    fn cubic_init() {
        let c = Cubic::new(CubicConfig::default());
        assert_eq!(c.name(), "CUBIC");
        assert_eq!(c.congestion_window(), 12000);
        assert_eq!(c.initial_window(), 12000);
        assert_eq!(c.minimal_window(), 2400);
        assert!(c.in_slow_start());
        assert!(!c.in_recovery(Instant::now()));
    }

    #[test]
    fn cubic_slow_start() {
        let mut c = Cubic::new(CubicConfig::default());
        let rtt = RttEstimator::new(Duration::from_millis(100));
        let now = Instant::now();

        let pkt = test_packet(0, 1200, now);
        c.on_sent(now, &pkt, 1200);
        c.on_ack(&pkt, now + Duration::from_millis(100), &rtt, 0);
        assert_eq!(c.congestion_window(), 13200);
        assert!(c.in_slow_start());
    }

    #[test]
    fn cubic_single_reduction_per_epoch() {
        let mut c = Cubic::new(CubicConfig::default());
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_millis(10);

        c.on_congestion_event(t1, &test_packet(0, 1200, t0), 1200, 2400);
        let reduced = c.congestion_window();
        assert_eq!(reduced, (12000.0 * BETA) as u64);
        assert!(!c.in_slow_start());

        c.on_congestion_event(t1, &test_packet(1, 1200, t0), 1200, 1200);
        assert_eq!(c.congestion_window(), reduced);
    }

    #[test]
    fn cubic_avoidance_growth() {
        let mut c = Cubic::new(CubicConfig::default());
        let rtt = RttEstimator::new(Duration::from_millis(50));
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_millis(10);

        c.on_congestion_event(t1, &test_packet(0, 1200, t0), 1200, 0);
        let reduced = c.congestion_window();

        // Keep acking packets over several RTTs; the window must recover
        // monotonically above the reduced value without entering slow start.
        let mut now = t1;
        let mut pn = 1;
        for _ in 0..50 {
            now += Duration::from_millis(50);
            c.on_ack(&test_packet(pn, 1200, now - Duration::from_millis(50)), now, &rtt, 0);
            pn += 1;
        }
        assert!(c.congestion_window() >= reduced);
        assert!(!c.in_slow_start());
    }
}
