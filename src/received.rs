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
use std::time::Instant;

use log::*;

use crate::frame::AckFrame;
use crate::ranges::RangeSet;
use crate::space::Level;
use crate::space::LEVEL_COUNT;
use crate::window::SeqNumWindow;
use crate::Error;
use crate::RecoveryConfig;
use crate::Result;
use crate::ACK_ELICITING_THRESHOLD;
use crate::MAX_ACK_RANGES;

/// Receive state of one encryption level.
struct PacketRecvTracker {
    /// Packet numbers received and not yet aged out, reported in outgoing
    /// ACK frames.
    recv: RangeSet,

    /// Sliding window for duplicate and replay detection.
    window: SeqNumWindow,

    /// The largest packet number received so far and its arrival time, used
    /// to fill in the ack delay.
    largest_recv_pkt_num: Option<u64>,
    largest_recv_time: Option<Instant>,

    /// Packet numbers below this value are no longer reported; the peer has
    /// proven it saw them acknowledged.
    ignore_below: u64,

    /// Ack-eliciting packets received since the last ACK was sent.
    ack_eliciting_since_last_ack: usize,

    /// Whether an ACK must be sent at the next opportunity.
    ack_queued: bool,

    /// Deadline for sending a delayed ACK, if armed.
    ack_alarm: Option<Instant>,
}

impl PacketRecvTracker {
    fn new() -> Self {
        PacketRecvTracker {
            recv: RangeSet::new(MAX_ACK_RANGES),
            window: SeqNumWindow::default(),
            largest_recv_pkt_num: None,
            largest_recv_time: None,
            ignore_below: 0,
            ack_eliciting_since_last_ack: 0,
            ack_queued: false,
            ack_alarm: None,
        }
    }
}

/// Tracking of incoming packets and generation of outgoing ACK frames for
/// the receiving side of a connection.
///
/// Duplicates are detected per encryption level; acknowledgments for
/// ack-eliciting packets are delayed by at most `max_ack_delay`, or sent
/// immediately on reordering, on every handshake packet, and once enough
/// ack-eliciting packets have accumulated.
/// See RFC 9000 Section 13.2
pub struct ReceivedPacketHandler {
    /// Receive trackers of all encryption levels.
    trackers: [Option<PacketRecvTracker>; LEVEL_COUNT],

    /// The maximum time acknowledgments may be delayed.
    max_ack_delay: Duration,
}

impl ReceivedPacketHandler {
    pub fn new(conf: &RecoveryConfig) -> Self {
        ReceivedPacketHandler {
            trackers: [
                Some(PacketRecvTracker::new()),
                Some(PacketRecvTracker::new()),
                Some(PacketRecvTracker::new()),
                Some(PacketRecvTracker::new()),
            ],
            max_ack_delay: conf.max_ack_delay,
        }
    }

    /// Record an incoming packet.
    ///
    /// Duplicates are no-ops. A packet number that has fallen below the
    /// replay window cannot be told apart from a replayed one and is
    /// rejected as a protocol violation.
    pub fn received_packet(
        &mut self,
        pkt_num: u64,
        level: Level,
        ack_eliciting: bool,
        now: Instant,
    ) -> Result<()> {
        let tracker = self.trackers[level as usize]
            .as_mut()
            .ok_or_else(|| Error::InvalidState("receive tracker dropped".into()))?;

        if pkt_num < tracker.ignore_below {
            return Ok(());
        }
        if tracker.window.is_below(pkt_num) {
            return Err(Error::ProtocolViolation);
        }
        if tracker.window.contains(pkt_num) {
            trace!("duplicate packet {} on {:?}", pkt_num, level);
            return Ok(());
        }

        tracker.window.insert(pkt_num);
        tracker.recv.add_elem(pkt_num);

        let prev_largest = tracker.largest_recv_pkt_num;
        if prev_largest.map_or(true, |largest| pkt_num > largest) {
            tracker.largest_recv_pkt_num = Some(pkt_num);
            tracker.largest_recv_time = Some(now);
        }

        if !ack_eliciting {
            return Ok(());
        }
        tracker.ack_eliciting_since_last_ack += 1;

        if !level.is_app_data() {
            // Handshake packets are acknowledged immediately to keep the
            // handshake moving.
            tracker.ack_queued = true;
            return Ok(());
        }

        let out_of_order = match prev_largest {
            Some(largest) => pkt_num != largest + 1,
            None => pkt_num != 0,
        };
        if out_of_order || tracker.ack_eliciting_since_last_ack >= ACK_ELICITING_THRESHOLD {
            tracker.ack_queued = true;
            tracker.ack_alarm = None;
        } else if tracker.ack_alarm.is_none() {
            tracker.ack_alarm = Some(now + self.max_ack_delay);
        }
        Ok(())
    }

    /// Check whether an incoming packet number is a duplicate that can be
    /// discarded before decryption. Packet numbers below the replay window
    /// count as duplicates.
    pub fn is_potentially_duplicate(&self, pkt_num: u64, level: Level) -> bool {
        match self.trackers[level as usize].as_ref() {
            Some(tracker) => {
                pkt_num < tracker.ignore_below || tracker.window.contains(pkt_num)
            }
            None => false,
        }
    }

    /// Build an ACK frame for the given encryption level.
    ///
    /// With `only_if_queued` set, a frame is only produced when an ACK is
    /// due: either queued for immediate sending or its delay alarm expired.
    /// Returns None when there is nothing to acknowledge.
    pub fn get_ack_frame(
        &mut self,
        level: Level,
        only_if_queued: bool,
        now: Instant,
    ) -> Option<AckFrame> {
        let tracker = self.trackers[level as usize].as_mut()?;
        if tracker.recv.is_empty() {
            return None;
        }
        if only_if_queued {
            let alarm_expired = tracker.ack_alarm.map_or(false, |alarm| alarm <= now);
            if !tracker.ack_queued && !alarm_expired {
                return None;
            }
        }

        let ack_delay = tracker
            .largest_recv_time
            .map_or(Duration::ZERO, |t| now.saturating_duration_since(t));

        tracker.ack_queued = false;
        tracker.ack_alarm = None;
        tracker.ack_eliciting_since_last_ack = 0;

        debug!("sending ack on {:?}, ranges {:?}", level, tracker.recv);
        Some(AckFrame {
            ack_delay,
            ranges: tracker.recv.clone(),
        })
    }

    /// The earliest delayed-ack deadline across all levels, if any. The
    /// caller should build and send the due ACK frames when it expires.
    pub fn ack_alarm_timeout(&self) -> Option<Instant> {
        let mut earliest = None;
        for tracker in self.trackers.iter().flatten() {
            if let Some(alarm) = tracker.ack_alarm {
                earliest = Some(match earliest {
                    Some(t) => cmp::min(t, alarm),
                    None => alarm,
                });
            }
        }
        earliest
    }

    /// Stop reporting packet numbers below `pkt_num` at `level`. Called
    /// once the peer has provably seen them acknowledged, so ACK frames
    /// stay small.
    pub fn ignore_below(&mut self, level: Level, pkt_num: u64) {
        let tracker = match self.trackers[level as usize].as_mut() {
            Some(t) => t,
            None => return,
        };
        if pkt_num <= tracker.ignore_below || pkt_num == 0 {
            return;
        }
        tracker.ignore_below = pkt_num;
        tracker.recv.remove_until(pkt_num - 1);
    }

    /// Discard the receive tracker of `level`. The 1-RTT tracker lives as
    /// long as the connection and cannot be dropped.
    pub fn drop_packets(&mut self, level: Level) -> Result<()> {
        if level == Level::OneRtt {
            return Err(Error::InvalidState("cannot drop the 1-RTT space".into()));
        }
        if self.trackers[level as usize].take().is_some() {
            debug!("dropped receive tracker {:?}", level);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler() -> ReceivedPacketHandler {
        ReceivedPacketHandler::new(&RecoveryConfig::default())
    }

    #[test]
    fn ack_ranges_out_of_order() {
        let now = Instant::now();
        let mut h = handler();

        h.received_packet(7, Level::OneRtt, true, now).unwrap();
        h.received_packet(5, Level::OneRtt, true, now).unwrap();
        h.received_packet(6, Level::OneRtt, true, now).unwrap();

        let ack = h.get_ack_frame(Level::OneRtt, false, now).unwrap();
        assert_eq!(ack.ranges.flatten().collect::<Vec<u64>>(), vec![5, 6, 7]);
        assert_eq!(ack.largest_acked(), Some(7));
    }

    #[test]
    fn duplicates_are_noops() {
        let now = Instant::now();
        let mut h = handler();

        h.received_packet(5, Level::OneRtt, true, now).unwrap();
        assert!(h.is_potentially_duplicate(5, Level::OneRtt));
        assert!(!h.is_potentially_duplicate(6, Level::OneRtt));

        h.received_packet(5, Level::OneRtt, true, now).unwrap();
        let ack = h.get_ack_frame(Level::OneRtt, false, now).unwrap();
        assert_eq!(ack.ranges.flatten().collect::<Vec<u64>>(), vec![5]);
    }

    #[test]
    fn replayed_packet_below_window() {
        let now = Instant::now();
        let mut h = handler();

        h.received_packet(200, Level::OneRtt, true, now).unwrap();
        // Packet 10 fell below the 128-wide replay window.
        assert!(matches!(
            h.received_packet(10, Level::OneRtt, true, now),
            Err(Error::ProtocolViolation)
        ));
        assert!(h.is_potentially_duplicate(10, Level::OneRtt));
    }

    #[test]
    fn ack_eliciting_threshold() {
        let t0 = Instant::now();
        let mut h = handler();

        // The first ack-eliciting packet only arms the delay alarm.
        h.received_packet(0, Level::OneRtt, true, t0).unwrap();
        assert!(h.get_ack_frame(Level::OneRtt, true, t0).is_none());
        assert_eq!(h.ack_alarm_timeout(), Some(t0 + Duration::from_millis(25)));

        // The second one queues an immediate ACK.
        h.received_packet(1, Level::OneRtt, true, t0).unwrap();
        let ack = h.get_ack_frame(Level::OneRtt, true, t0).unwrap();
        assert_eq!(ack.largest_acked(), Some(1));
        assert!(h.ack_alarm_timeout().is_none());
    }

    #[test]
    fn ack_alarm_expiry() {
        let t0 = Instant::now();
        let mut h = handler();

        h.received_packet(0, Level::OneRtt, true, t0).unwrap();
        let alarm = h.ack_alarm_timeout().unwrap();
        assert!(h.get_ack_frame(Level::OneRtt, true, t0).is_none());

        let ack = h.get_ack_frame(Level::OneRtt, true, alarm).unwrap();
        assert_eq!(ack.largest_acked(), Some(0));
        assert_eq!(ack.ack_delay, Duration::from_millis(25));
        assert!(h.ack_alarm_timeout().is_none());
    }

    #[test]
    fn reordering_acks_immediately() {
        let t0 = Instant::now();
        let mut h = handler();

        h.received_packet(1, Level::OneRtt, true, t0).unwrap();
        // Packet 1 before packet 0 is out of order.
        let ack = h.get_ack_frame(Level::OneRtt, true, t0).unwrap();
        assert_eq!(ack.largest_acked(), Some(1));

        // A gap ahead of the largest is out of order too.
        h.received_packet(5, Level::OneRtt, true, t0).unwrap();
        assert!(h.get_ack_frame(Level::OneRtt, true, t0).is_some());
    }

    #[test]
    fn handshake_packets_acked_immediately() {
        let t0 = Instant::now();
        let mut h = handler();

        h.received_packet(0, Level::Initial, true, t0).unwrap();
        let ack = h.get_ack_frame(Level::Initial, true, t0).unwrap();
        assert_eq!(ack.largest_acked(), Some(0));

        h.received_packet(0, Level::Handshake, true, t0).unwrap();
        assert!(h.get_ack_frame(Level::Handshake, true, t0).is_some());
    }

    #[test]
    fn non_ack_eliciting_never_due() {
        let t0 = Instant::now();
        let mut h = handler();

        h.received_packet(0, Level::OneRtt, false, t0).unwrap();
        h.received_packet(1, Level::OneRtt, false, t0).unwrap();
        assert!(h.ack_alarm_timeout().is_none());
        assert!(h.get_ack_frame(Level::OneRtt, true, t0).is_none());

        // The received packets are still reported once an ACK goes out.
        let ack = h.get_ack_frame(Level::OneRtt, false, t0).unwrap();
        assert_eq!(ack.ranges.flatten().collect::<Vec<u64>>(), vec![0, 1]);
    }

    #[test]
    fn ignore_below_ages_ranges() {
        let t0 = Instant::now();
        let mut h = handler();
        for pn in 0..6 {
            h.received_packet(pn, Level::OneRtt, true, t0).unwrap();
        }

        h.ignore_below(Level::OneRtt, 3);
        let ack = h.get_ack_frame(Level::OneRtt, false, t0).unwrap();
        assert_eq!(ack.ranges.flatten().collect::<Vec<u64>>(), vec![3, 4, 5]);

        // An aged-out packet arriving late is silently discarded.
        h.received_packet(2, Level::OneRtt, true, t0).unwrap();
        let ack = h.get_ack_frame(Level::OneRtt, false, t0).unwrap();
        assert_eq!(ack.ranges.min(), Some(3));
        assert!(h.is_potentially_duplicate(2, Level::OneRtt));
    }

    #[test]
    fn drop_tracker() {
        let t0 = Instant::now();
        let mut h = handler();
        h.received_packet(0, Level::Initial, true, t0).unwrap();

        h.drop_packets(Level::Initial).unwrap();
        assert!(h.get_ack_frame(Level::Initial, false, t0).is_none());
        assert!(!h.is_potentially_duplicate(0, Level::Initial));
        assert!(matches!(
            h.received_packet(1, Level::Initial, true, t0),
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(
            h.drop_packets(Level::OneRtt),
            Err(Error::InvalidState(_))
        ));
    }
}
