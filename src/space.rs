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

use std::collections::VecDeque;
use std::time::Duration;
use std::time::Instant;

use smallvec::SmallVec;

use crate::frame::Frame;

/// Encryption levels of a connection, each owning an independent packet
/// number space.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(usize)]
pub enum Level {
    /// Initial keys, used before any handshake keys are derived.
    Initial = 0,

    /// Handshake keys.
    Handshake = 1,

    /// 0-RTT keys, usable by a client before the handshake completes.
    ZeroRtt = 2,

    /// 1-RTT keys, used once the handshake completes.
    OneRtt = 3,
}

/// The number of encryption levels.
pub const LEVEL_COUNT: usize = 4;

const LEVELS: [Level; LEVEL_COUNT] = [
    Level::Initial,
    Level::Handshake,
    Level::ZeroRtt,
    Level::OneRtt,
];

impl Level {
    /// Return an iterator over all levels, in handshake order.
    pub fn iter() -> impl Iterator<Item = Level> {
        LEVELS.iter().copied()
    }

    /// Whether the level carries application data. The PTO timer for
    /// application data levels includes the peer's max_ack_delay and is not
    /// armed until the handshake completes.
    pub fn is_app_data(self) -> bool {
        matches!(self, Level::ZeroRtt | Level::OneRtt)
    }
}

/// Metadata of a sent packet, owned by the per-level ledger from creation
/// until the packet is acked, declared lost and evicted, or dropped with its
/// level.
#[derive(Clone)]
pub struct SentPacket {
    /// The packet number of the sent packet.
    pub pkt_num: u64,

    /// The frames carried by the sent packet.
    pub frames: SmallVec<[Frame; 4]>,

    /// The largest packet number acknowledged by an ACK frame carried in
    /// this packet, if any.
    pub largest_acked: Option<u64>,

    /// The time the packet was sent.
    pub time_sent: Instant,

    /// The time the packet was acknowledged, if any.
    pub time_acked: Option<Instant>,

    /// The time the packet was declared lost, if any.
    pub time_lost: Option<Instant>,

    /// Whether an acknowledgment is expected for this packet.
    pub ack_eliciting: bool,

    /// Whether the packet counts toward bytes in flight.
    pub in_flight: bool,

    /// Whether the packet carries retransmittable data (CRYPTO or STREAM).
    pub has_data: bool,

    /// The number of bytes sent in the packet, not including UDP or IP
    /// overhead, but including QUIC framing overhead.
    pub sent_size: usize,
}

impl Default for SentPacket {
    fn default() -> Self {
        SentPacket {
            pkt_num: 0,
            frames: SmallVec::new(),
            largest_acked: None,
            time_sent: Instant::now(),
            time_acked: None,
            time_lost: None,
            ack_eliciting: false,
            in_flight: false,
            has_data: false,
            sent_size: 0,
        }
    }
}

impl std::fmt::Debug for SentPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "pn={:?}", self.pkt_num)?;
        write!(f, " frames={:?}", self.frames)?;
        write!(f, " sent_size={}", self.sent_size)?;
        Ok(())
    }
}

/// Metadata of an acknowledged packet.
#[derive(Debug)]
pub struct AckedPacket {
    /// The packet number of the sent packet.
    pub pkt_num: u64,

    /// The time the packet was sent.
    pub time_sent: Instant,

    /// The duration between the time the packet was sent and acknowledged.
    pub rtt: Duration,
}

/// The sent-packet ledger and loss detection state of one encryption level.
pub(crate) struct PacketNumSpace {
    /// The encryption level owning this space.
    pub level: Level,

    /// The packet number of the next packet that will be sent.
    pub next_pkt_num: u64,

    /// Sent packets metadata for loss recovery and congestion control, in
    /// strictly increasing packet number order.
    /// See RFC 9002 Section 9.1
    pub sent: VecDeque<SentPacket>,

    /// The largest packet number acknowledged in this space so far.
    pub largest_acked_pkt: Option<u64>,

    /// The time the most recent ack-eliciting packet was sent.
    pub time_of_last_sent_ack_eliciting_pkt: Option<Instant>,

    /// The time at which the next packet in this space can be considered
    /// lost based on exceeding the reordering window in time.
    pub loss_time: Option<Instant>,

    /// The number of probe packets to be sent after a PTO expired.
    pub loss_probes: usize,

    /// The sum of the sizes of all in-flight packets in this space.
    pub bytes_in_flight: usize,

    /// Number of ack-eliciting packets in flight in this space.
    pub ack_eliciting_in_flight: u64,

    /// Frames of packets declared lost or probed, queued for retransmission.
    pub lost: Vec<Frame>,

    /// Frames of acknowledged packets.
    pub acked: Vec<Frame>,
}

impl PacketNumSpace {
    pub fn new(level: Level) -> Self {
        PacketNumSpace {
            level,
            next_pkt_num: 0,
            sent: VecDeque::new(),
            largest_acked_pkt: None,
            time_of_last_sent_ack_eliciting_pkt: None,
            loss_time: None,
            loss_probes: 0,
            bytes_in_flight: 0,
            ack_eliciting_in_flight: 0,
            lost: Vec::new(),
            acked: Vec::new(),
        }
    }
}

/// All packet number spaces of a connection, held by index in a fixed-size
/// array. A dropped level leaves an empty slot; its state is gone for good.
pub(crate) struct PacketNumSpaceSet {
    spaces: [Option<PacketNumSpace>; LEVEL_COUNT],
}

impl PacketNumSpaceSet {
    pub fn new() -> Self {
        PacketNumSpaceSet {
            spaces: [
                Some(PacketNumSpace::new(Level::Initial)),
                Some(PacketNumSpace::new(Level::Handshake)),
                Some(PacketNumSpace::new(Level::ZeroRtt)),
                Some(PacketNumSpace::new(Level::OneRtt)),
            ],
        }
    }

    /// Get an immutable reference to the space of the given level.
    pub fn get(&self, level: Level) -> Option<&PacketNumSpace> {
        self.spaces[level as usize].as_ref()
    }

    /// Get a mutable reference to the space of the given level.
    pub fn get_mut(&mut self, level: Level) -> Option<&mut PacketNumSpace> {
        self.spaces[level as usize].as_mut()
    }

    /// Drop the space of the given level, discarding all its state.
    pub fn drop(&mut self, level: Level) -> Option<PacketNumSpace> {
        self.spaces[level as usize].take()
    }

    /// Replace the space of the given level with a fresh one, preserving the
    /// next packet number so numbers are never reused.
    pub fn reset(&mut self, level: Level) -> Option<PacketNumSpace> {
        let next_pkt_num = self.get(level)?.next_pkt_num;
        let mut space = PacketNumSpace::new(level);
        space.next_pkt_num = next_pkt_num;
        self.spaces[level as usize].replace(space)
    }

    /// Return an iterator over all live spaces.
    pub fn iter(&self) -> impl Iterator<Item = &PacketNumSpace> {
        self.spaces.iter().filter_map(|s| s.as_ref())
    }
}

impl Default for PacketNumSpaceSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_spaces() {
        let spaces = PacketNumSpaceSet::default();
        assert_eq!(spaces.iter().count(), LEVEL_COUNT);
        for level in Level::iter() {
            assert_eq!(spaces.get(level).unwrap().level, level);
        }
    }

    #[test]
    fn drop_space() {
        let mut spaces = PacketNumSpaceSet::new();
        assert!(spaces.drop(Level::Initial).is_some());
        assert!(spaces.get(Level::Initial).is_none());
        assert!(spaces.get_mut(Level::Initial).is_none());
        assert_eq!(spaces.iter().count(), LEVEL_COUNT - 1);

        // Dropping twice is a no-op.
        assert!(spaces.drop(Level::Initial).is_none());
    }

    #[test]
    fn reset_keeps_pkt_num() {
        let mut spaces = PacketNumSpaceSet::new();
        let space = spaces.get_mut(Level::Initial).unwrap();
        space.next_pkt_num = 7;
        space.bytes_in_flight = 1200;

        spaces.reset(Level::Initial);
        let space = spaces.get(Level::Initial).unwrap();
        assert_eq!(space.next_pkt_num, 7);
        assert_eq!(space.bytes_in_flight, 0);
        assert!(space.sent.is_empty());
    }

    #[test]
    fn level_kinds() {
        assert!(!Level::Initial.is_app_data());
        assert!(!Level::Handshake.is_app_data());
        assert!(Level::ZeroRtt.is_app_data());
        assert!(Level::OneRtt.is_app_data());
    }

    #[test]
    fn sent_packet_debug() {
        let pkt = SentPacket {
            pkt_num: 9,
            frames: smallvec::smallvec![Frame::Ping, Frame::Paddings { len: 200 }],
            ack_eliciting: true,
            in_flight: true,
            sent_size: 240,
            ..SentPacket::default()
        };
        assert_eq!(
            format!("{:?}", pkt),
            "pn=9 frames=[PING, PADDINGS len=200] sent_size=240"
        );
    }
}
