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

use std::cmp;
use std::time::Duration;

use crate::TIMER_GRANULARITY;

/// RTT estimation for a network path.
/// See RFC 9002 Section 5
pub struct RttEstimator {
    /// The most recent RTT sample.
    latest_rtt: Duration,

    /// The smoothed RTT of the path, an exponentially weighted moving
    /// average of the RTT samples. None until the first sample is taken.
    smoothed_rtt: Option<Duration>,

    /// The RTT variance, estimating the variation in the samples using a
    /// mean variation.
    rttvar: Duration,

    /// The minimum RTT observed on the path, ignoring ack delay.
    /// It is used to reject implausibly small ack-delay adjustments.
    min_rtt: Duration,

    /// The maximum RTT observed on the path, ignoring ack delay.
    max_rtt: Duration,
}

impl RttEstimator {
    pub fn new(initial_rtt: Duration) -> Self {
        Self {
            latest_rtt: initial_rtt,
            smoothed_rtt: None,
            rttvar: initial_rtt / 2,
            min_rtt: initial_rtt,
            max_rtt: initial_rtt,
        }
    }

    /// Return the current best RTT estimation.
    pub fn smoothed_rtt(&self) -> Duration {
        self.smoothed_rtt.unwrap_or(self.latest_rtt)
    }

    /// Return the latest RTT sample.
    pub fn latest_rtt(&self) -> Duration {
        self.latest_rtt
    }

    /// Return the minimum RTT observed so far.
    pub fn min_rtt(&self) -> Duration {
        self.min_rtt
    }

    /// Return the maximum RTT observed so far.
    pub fn max_rtt(&self) -> Duration {
        self.max_rtt
    }

    /// Return the variation in the RTT samples.
    pub fn rttvar(&self) -> Duration {
        self.rttvar
    }

    /// Return the base PTO as described in RFC 9002 Section 6.2.1, without
    /// the max_ack_delay component.
    pub fn pto_base(&self) -> Duration {
        self.smoothed_rtt() + cmp::max(4 * self.rttvar, TIMER_GRANULARITY)
    }

    /// Override the initial RTT, e.g. with a value remembered from a
    /// previous connection to the same peer. Only allowed before the first
    /// sample is taken; returns whether the override happened.
    pub fn try_set_init_rtt(&mut self, initial_rtt: Duration) -> bool {
        if self.smoothed_rtt.is_some() {
            return false;
        }
        self.latest_rtt = initial_rtt;
        self.rttvar = initial_rtt / 2;
        self.min_rtt = initial_rtt;
        self.max_rtt = initial_rtt;
        true
    }

    /// Update the estimator with a new RTT sample.
    ///
    /// `ack_delay` is the delay reported by the peer in the ACK frame that
    /// produced the sample.
    pub fn update(&mut self, ack_delay: Duration, rtt: Duration) {
        self.latest_rtt = rtt;

        if let Some(smoothed_rtt) = self.smoothed_rtt {
            self.min_rtt = cmp::min(self.min_rtt, rtt);
            self.max_rtt = cmp::max(self.max_rtt, rtt);

            // The ack delay MUST NOT be subtracted if doing so would push
            // the sample below min_rtt.
            // See RFC 9002 Section 5.3
            let adjusted_rtt = if self.min_rtt + ack_delay <= rtt {
                rtt - ack_delay
            } else {
                rtt
            };

            let var_sample = if smoothed_rtt > adjusted_rtt {
                smoothed_rtt - adjusted_rtt
            } else {
                adjusted_rtt - smoothed_rtt
            };
            self.rttvar = (3 * self.rttvar + var_sample) / 4;
            self.smoothed_rtt = Some((7 * smoothed_rtt + adjusted_rtt) / 8);
        } else {
            // First sample resets the whole estimator.
            self.smoothed_rtt = Some(rtt);
            self.rttvar = rtt / 2;
            self.min_rtt = rtt;
            self.max_rtt = rtt;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial() {
        let initial_rtt = Duration::from_millis(200);
        let r = RttEstimator::new(initial_rtt);
        assert_eq!(r.latest_rtt(), initial_rtt);
        assert_eq!(r.min_rtt(), initial_rtt);
        assert_eq!(r.max_rtt(), initial_rtt);
        assert_eq!(r.rttvar(), initial_rtt / 2);
        assert_eq!(r.smoothed_rtt(), initial_rtt);
        assert_eq!(r.pto_base(), initial_rtt * 3);
    }

    #[test]
    fn sample_sequence() {
        let mut r = RttEstimator::new(Duration::from_millis(200));

        // First sample overrides the initial values.
        let ack_delay = Duration::from_millis(100);
        r.update(ack_delay, Duration::from_millis(400));
        assert_eq!(r.latest_rtt(), Duration::from_millis(400));
        assert_eq!(r.min_rtt(), Duration::from_millis(400));
        assert_eq!(r.max_rtt(), Duration::from_millis(400));
        assert_eq!(r.rttvar(), Duration::from_millis(200));
        assert_eq!(r.smoothed_rtt(), Duration::from_millis(400));
        assert_eq!(r.pto_base(), Duration::from_millis(1200));

        // Second sample; the ack delay is subtracted.
        r.update(ack_delay, Duration::from_millis(700));
        assert_eq!(r.latest_rtt(), Duration::from_millis(700));
        assert_eq!(r.min_rtt(), Duration::from_millis(400));
        assert_eq!(r.max_rtt(), Duration::from_millis(700));
        assert_eq!(r.rttvar(), Duration::from_millis(200));
        assert_eq!(r.smoothed_rtt(), Duration::from_millis(425));

        // Third sample is below min_rtt + ack_delay, so the delay is kept.
        r.update(ack_delay, Duration::from_millis(225));
        assert_eq!(r.latest_rtt(), Duration::from_millis(225));
        assert_eq!(r.min_rtt(), Duration::from_millis(225));
        assert_eq!(r.max_rtt(), Duration::from_millis(700));
        assert_eq!(r.rttvar(), Duration::from_millis(200));
        assert_eq!(r.smoothed_rtt(), Duration::from_millis(400));
    }

    #[test]
    fn init_rtt_override() {
        let mut r = RttEstimator::new(Duration::from_millis(333));
        assert!(r.try_set_init_rtt(Duration::from_millis(50)));
        assert_eq!(r.smoothed_rtt(), Duration::from_millis(50));
        assert_eq!(r.rttvar(), Duration::from_millis(25));

        // Once a sample is taken the override is rejected.
        r.update(Duration::ZERO, Duration::from_millis(80));
        assert!(!r.try_set_init_rtt(Duration::from_millis(10)));
        assert_eq!(r.smoothed_rtt(), Duration::from_millis(80));
    }

    #[test]
    fn min_rtt_monotonic() {
        let mut r = RttEstimator::new(Duration::from_millis(100));
        r.update(Duration::ZERO, Duration::from_millis(80));
        r.update(Duration::ZERO, Duration::from_millis(120));
        r.update(Duration::ZERO, Duration::from_millis(60));
        r.update(Duration::ZERO, Duration::from_millis(200));
        assert_eq!(r.min_rtt(), Duration::from_millis(60));
    }
}
