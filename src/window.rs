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

/// A sliding packet number window for duplicate and replay detection.
/// See RFC 4303 Section 3.4.3 for a similar algorithm.
#[derive(Clone, Copy, Default)]
pub struct SeqNumWindow {
    /// The lowest packet number covered by the window.
    lower: u64,

    /// A contiguous bitfield, where each bit corresponds to a packet number.
    window: u128,
}

impl SeqNumWindow {
    /// Record `seq` as seen, sliding the window forward if needed.
    pub fn insert(&mut self, seq: u64) {
        // Packet number fell off the left end of the window.
        if seq < self.lower {
            return;
        }

        // Slide the window right to cover the new packet number.
        if seq > self.upper() {
            let diff = seq - self.upper();
            self.lower += diff;
            self.window = self.window.checked_shl(diff as u32).unwrap_or(0);
        }

        self.window |= 1_u128 << (self.upper() - seq);
    }

    /// Check whether `seq` has been seen before. Packet numbers below the
    /// window are reported as seen.
    pub fn contains(&self, seq: u64) -> bool {
        if seq > self.upper() {
            return false;
        }
        if seq < self.lower {
            return true;
        }
        self.window & (1_u128 << (self.upper() - seq)) != 0
    }

    /// Check whether `seq` has fallen below the window, i.e. its seen/unseen
    /// status can no longer be determined.
    pub fn is_below(&self, seq: u64) -> bool {
        seq < self.lower
    }

    /// Return the largest packet number covered by the window.
    fn upper(&self) -> u64 {
        self.lower.saturating_add(u128::BITS as u64) - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_default() {
        let win = SeqNumWindow::default();
        assert!(!win.contains(0));
        assert!(!win.contains(1));
        assert!(!win.is_below(0));
    }

    #[test]
    fn window_insert() {
        let mut win = SeqNumWindow::default();
        win.insert(0);
        assert!(win.contains(0));
        assert!(!win.contains(1));

        win.insert(3);
        assert!(win.contains(0));
        assert!(!win.contains(1));
        assert!(!win.contains(2));
        assert!(win.contains(3));
        assert!(!win.contains(500));
    }

    #[test]
    fn window_slide() {
        let mut win = SeqNumWindow::default();
        win.insert(10);
        assert!(!win.contains(0));
        assert!(win.contains(10));
        assert!(!win.is_below(0));

        win.insert(150);
        assert!(win.contains(150));
        assert!(!win.contains(149));
        // Everything below the slid window reads as seen.
        assert!(win.contains(10));
        assert!(win.contains(0));
        assert!(win.is_below(0));
        assert!(win.is_below(22));
        assert!(!win.is_below(23));
    }

    #[test]
    fn window_near_max() {
        let mut win = SeqNumWindow::default();
        let max_seq = u64::MAX - 1;
        win.insert(max_seq);
        assert!(win.contains(max_seq));
        assert!(!win.contains(max_seq - 1));
        assert!(win.contains(max_seq - 128));
        assert!(win.contains(0));
    }
}
