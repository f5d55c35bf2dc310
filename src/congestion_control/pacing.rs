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

use crate::RecoveryConfig;

/// The lower bound of burst packet number.
///
/// A lower bound is necessary to avoid an extremely small bucket that would
/// stall the sender below the timer granularity.
const MIN_BURST_PACKET_NUM: u64 = 10;

/// The upper bound of burst packet number; an extremely large bucket is
/// meaningless.
const MAX_BURST_PACKET_NUM: u64 = 128;

/// A token-bucket pacer.
///
/// The bucket holds the bytes that may burst within one pacing granularity;
/// tokens refill at the congestion controller's pacing rate. If the computed
/// inter-packet interval is smaller than the granularity, several packets
/// are released in one scheduling quantum instead of spinning.
/// See RFC 9002 Section 7.7
#[derive(Debug)]
pub struct Pacer {
    /// Enable pacing or not.
    enabled: bool,

    /// Bucket capacity in bytes: what may burst during one granularity.
    capacity: u64,

    /// Available tokens in bytes.
    tokens: u64,

    /// The congestion window the capacity was computed for.
    last_cwnd: u64,

    /// Last schedule time.
    last_sched_time: Instant,

    /// Pacing granularity.
    granularity: Duration,
}

impl Pacer {
    pub fn new(
        enabled: bool,
        srtt: Duration,
        cwnd: u64,
        mtu: u64,
        now: Instant,
        granularity: Duration,
    ) -> Self {
        let mut pacer = Pacer {
            enabled,
            capacity: 0,
            tokens: 0,
            last_cwnd: cwnd,
            last_sched_time: now,
            granularity,
        };
        pacer.update_capacity(cwnd, srtt, mtu);
        pacer.tokens = pacer.capacity;
        pacer
    }

    /// Build a pacer from the recovery configuration.
    pub fn build(conf: &RecoveryConfig, now: Instant) -> Self {
        Pacer::new(
            conf.enable_pacing,
            conf.initial_rtt,
            conf.initial_congestion_window
                .saturating_mul(conf.max_datagram_size as u64),
            conf.max_datagram_size as u64,
            now,
            conf.pacing_granularity,
        )
    }

    /// Check whether pacing is enabled.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Return the bytes that may be sent immediately without waiting for a
    /// refill.
    pub fn burst_budget(&self) -> u64 {
        self.tokens
    }

    /// Consume tokens after a packet is actually sent.
    pub fn on_sent(&mut self, bytes_sent: u64) {
        if self.enabled {
            self.tokens = self.tokens.saturating_sub(bytes_sent)
        }
    }

    /// Schedule the next send of `bytes_to_send` bytes.
    ///
    /// Return None if the packet can be sent immediately, or the instant at
    /// which enough tokens will have accumulated.
    pub fn schedule(
        &mut self,
        bytes_to_send: u64,
        pacing_rate: u64,
        srtt: Duration,
        cwnd: u64,
        mtu: u64,
        now: Instant,
    ) -> Option<Instant> {
        if !self.enabled || srtt.is_zero() || cwnd == 0 || pacing_rate == 0 {
            return None;
        }

        if cwnd != self.last_cwnd {
            self.update_capacity(cwnd, srtt, mtu);
            self.tokens = self.capacity.min(self.tokens);
            self.last_cwnd = cwnd;
        }

        if self.tokens >= bytes_to_send {
            return None;
        }

        // Refill at the pacing rate since the last schedule.
        let elapsed = now.saturating_duration_since(self.last_sched_time);
        self.tokens = self
            .tokens
            .saturating_add((pacing_rate as u128 * elapsed.as_nanos() / 1_000_000_000) as u64)
            .min(self.capacity);
        self.last_sched_time = now;

        if bytes_to_send <= self.tokens {
            return None;
        }

        let time_to_wait =
            bytes_to_send.saturating_sub(self.tokens) * 1_000_000_000 / pacing_rate.max(1);
        Some(self.last_sched_time + Duration::from_nanos(time_to_wait))
    }

    fn update_capacity(&mut self, cwnd: u64, srtt: Duration, mtu: u64) {
        // The clamp bounds the average burst to
        //   [MIN_BURST_PACKET_NUM * mtu, MAX_BURST_PACKET_NUM * mtu].
        let capacity =
            (cwnd as u128 * self.granularity.as_nanos() / srtt.as_nanos().max(1_000_000)) as u64;
        self.capacity = capacity.clamp(MIN_BURST_PACKET_NUM * mtu, MAX_BURST_PACKET_NUM * mtu)
    }
}
