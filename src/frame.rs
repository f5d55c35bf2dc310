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

//! Frame values exchanged with the neighboring frame codec.
//!
//! The engine neither encodes nor decodes frames; it consumes and produces
//! the typed values below and leaves the wire format to an external codec.

use std::time::Duration;

use crate::ranges::RangeSet;

/// An ACK frame value: the set of packet numbers the peer reports as
/// received, plus the delay between receiving the largest of them and
/// sending the frame.
///
/// The ranges are disjoint; iterating them in reverse yields the
/// largest-first order used on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AckFrame {
    /// The acknowledgment delay reported by the frame sender.
    pub ack_delay: Duration,

    /// The acknowledged packet number ranges.
    pub ranges: RangeSet,
}

impl AckFrame {
    /// Return the largest packet number acknowledged by this frame.
    pub fn largest_acked(&self) -> Option<u64> {
        self.ranges.max()
    }
}

/// Metadata of a frame carried by a sent packet.
#[derive(Clone, PartialEq, Eq)]
pub enum Frame {
    /// One or more PADDING frames, coalesced.
    Paddings { len: usize },

    /// PING frame, used to elicit an ACK from the peer.
    Ping,

    /// ACK frame; only the largest acknowledged number matters for the
    /// ledger, the full range set lives in the packet payload.
    Ack { largest_acked: u64 },

    /// CRYPTO frame carrying handshake data.
    Crypto { offset: u64, length: u64 },

    /// STREAM frame carrying application data.
    Stream {
        stream_id: u64,
        offset: u64,
        length: u64,
        fin: bool,
    },
}

impl Frame {
    /// Return whether the frame requires the peer to eventually send an
    /// acknowledgment.
    /// See RFC 9002 Section 2
    pub fn ack_eliciting(&self) -> bool {
        !matches!(self, Frame::Paddings { .. } | Frame::Ack { .. })
    }

    /// Return whether the frame carries retransmittable data, i.e. whether
    /// it is worth re-queueing when its packet is declared lost or probed.
    pub fn has_data(&self) -> bool {
        matches!(self, Frame::Crypto { .. } | Frame::Stream { .. })
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Frame::Paddings { len } => write!(f, "PADDINGS len={}", len),
            Frame::Ping => write!(f, "PING"),
            Frame::Ack { largest_acked } => write!(f, "ACK largest={}", largest_acked),
            Frame::Crypto { offset, length } => {
                write!(f, "CRYPTO off={} len={}", offset, length)
            }
            Frame::Stream {
                stream_id,
                offset,
                length,
                fin,
            } => write!(
                f,
                "STREAM id={} off={} len={} fin={}",
                stream_id, offset, length, fin
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_ack_eliciting() {
        assert!(!Frame::Paddings { len: 100 }.ack_eliciting());
        assert!(!Frame::Ack { largest_acked: 5 }.ack_eliciting());
        assert!(Frame::Ping.ack_eliciting());
        assert!(Frame::Crypto {
            offset: 0,
            length: 100
        }
        .ack_eliciting());
        assert!(Frame::Stream {
            stream_id: 4,
            offset: 0,
            length: 100,
            fin: false
        }
        .ack_eliciting());
    }

    #[test]
    fn frame_has_data() {
        assert!(!Frame::Ping.has_data());
        assert!(!Frame::Paddings { len: 10 }.has_data());
        assert!(Frame::Crypto {
            offset: 10,
            length: 20
        }
        .has_data());
    }

    #[test]
    fn frame_debug() {
        let frame = Frame::Stream {
            stream_id: 0,
            offset: 64,
            length: 128,
            fin: true,
        };
        assert_eq!(format!("{:?}", frame), "STREAM id=0 off=64 len=128 fin=true");
        assert_eq!(format!("{:?}", Frame::Ping), "PING");
    }

    #[test]
    fn ack_frame_largest() {
        let mut ranges = RangeSet::default();
        assert_eq!(
            AckFrame {
                ack_delay: Duration::ZERO,
                ranges: ranges.clone()
            }
            .largest_acked(),
            None
        );

        ranges.insert(0..3);
        ranges.insert(5..8);
        let ack = AckFrame {
            ack_delay: Duration::from_millis(10),
            ranges,
        };
        assert_eq!(ack.largest_acked(), Some(7));
    }
}
