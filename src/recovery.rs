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

use crate::congestion_control;
use crate::congestion_control::CongestionController;
use crate::congestion_control::Pacer;
use crate::frame::AckFrame;
use crate::frame::Frame;
use crate::rtt::RttEstimator;
use crate::space::AckedPacket;
use crate::space::Level;
use crate::space::PacketNumSpace;
use crate::space::PacketNumSpaceSet;
use crate::space::SentPacket;
use crate::Error;
use crate::RecoveryConfig;
use crate::RecoveryStats;
use crate::Result;
use crate::TIMER_GRANULARITY;

/// Packet reordering threshold before the packet-based loss detection
/// considers a packet lost. The RECOMMENDED initial value is 3.
/// See RFC 9002 Section 6.1.1
pub(crate) const INITIAL_PACKET_THRESHOLD: u64 = 3;

/// Time reordering threshold, as a multiplier applied to the RTT estimate.
/// The RECOMMENDED value is 9/8.
/// See RFC 9002 Section 6.1.2
pub(crate) const INITIAL_TIME_THRESHOLD: f64 = 9.0 / 8.0;

/// When a PTO timer expires, the sender sends one or two probe packets.
/// See RFC 9002 Section 6.2.4
const MAX_PTO_PROBES_COUNT: usize = 2;

/// What kind of packet, if any, the sender is currently allowed to send.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SendMode {
    /// Nothing may be sent. The peer address is unvalidated and the
    /// anti-amplification limit is exhausted.
    None,

    /// Only non-congestion-controlled packets (an ACK, possibly with
    /// padding) may be sent; the congestion window is full.
    AckOnly,

    /// A probe packet at the Initial encryption level must be sent.
    PtoInitial,

    /// A probe packet at the Handshake encryption level must be sent.
    PtoHandshake,

    /// A probe packet at an application data encryption level must be sent.
    PtoOneRtt,

    /// Any packet may be sent.
    Normal,
}

/// The result of processing one incoming ACK frame.
#[derive(Debug, Default)]
pub struct AckOutcome {
    /// Packets newly acknowledged by the frame, with their sampled RTT.
    pub acked: Vec<AckedPacket>,

    /// The frames carried by the newly acknowledged packets.
    pub acked_frames: Vec<Frame>,

    /// Frames of packets declared lost by this ACK, to be retransmitted.
    pub lost_frames: Vec<Frame>,

    /// The largest packet number for which the peer has seen an
    /// acknowledgment from us, proven by an ACK of one of our ACK-carrying
    /// packets. Received ranges at or below it no longer need to be
    /// reported and can be aged out of the receive tracker.
    pub peer_confirmed_acked: Option<u64>,
}

/// Loss recovery and congestion control for the sending side of a
/// connection.
///
/// The handler keeps an independent sent-packet ledger per encryption
/// level, feeds ACK and loss events into the congestion controller and the
/// RTT estimator, and maintains a single loss detection deadline covering
/// both the time-threshold alarm and the probe timeout.
/// See RFC 9002 Section 6
pub struct SentPacketHandler {
    /// Packet number spaces of all encryption levels.
    spaces: PacketNumSpaceSet,

    /// RTT estimation of the network path.
    rtt: RttEstimator,

    /// The congestion controller of the path.
    cc: Box<dyn CongestionController>,

    /// The pacer of the path.
    pacer: Pacer,

    /// Whether the endpoint is a server. Only servers are subject to the
    /// anti-amplification limit.
    is_server: bool,

    /// Whether the handshake is complete. Completion validates the peer
    /// address and arms the PTO timer for application data levels.
    handshake_complete: bool,

    /// Whether the connection is being closed. A closing endpoint sends
    /// nothing but its closing frame and stops all recovery timers.
    closing: bool,

    /// The sum of the sizes of all in-flight packets, across all levels.
    bytes_in_flight: u64,

    /// Bytes sent to the unvalidated peer address.
    bytes_sent: u64,

    /// Bytes received from the unvalidated peer address.
    bytes_recv: u64,

    /// The number of times a PTO has fired without receiving an ack.
    pto_count: u64,

    /// The unified loss detection deadline, if armed.
    loss_detection_timer: Option<Instant>,

    /// The maximum size of outgoing UDP payloads.
    max_datagram_size: usize,

    /// The maximum time the peer may delay acknowledgments of 1-RTT
    /// packets.
    max_ack_delay: Duration,

    /// Reordering threshold in packets.
    pkt_thresh: u64,

    /// Reordering threshold in time, as an RTT multiplier.
    time_thresh: f64,

    /// The number of consecutive PTOs that do not back off.
    pto_linear_factor: u64,

    /// Upper limit of the probe timeout.
    max_pto: Duration,

    /// Limit on the ratio between sent and received bytes before the peer
    /// address is validated.
    anti_amplification_factor: usize,

    /// Aggregate statistics.
    stats: RecoveryStats,
}

impl SentPacketHandler {
    pub fn new(conf: &RecoveryConfig, is_server: bool, now: Instant) -> Self {
        SentPacketHandler {
            spaces: PacketNumSpaceSet::new(),
            rtt: RttEstimator::new(conf.initial_rtt),
            cc: congestion_control::build_congestion_controller(conf),
            pacer: Pacer::build(conf, now),
            is_server,
            handshake_complete: false,
            closing: false,
            bytes_in_flight: 0,
            bytes_sent: 0,
            bytes_recv: 0,
            pto_count: 0,
            loss_detection_timer: None,
            max_datagram_size: conf.max_datagram_size,
            max_ack_delay: conf.max_ack_delay,
            pkt_thresh: conf.packet_threshold,
            time_thresh: conf.time_threshold,
            pto_linear_factor: conf.pto_linear_factor,
            max_pto: conf.max_pto,
            anti_amplification_factor: conf.anti_amplification_factor,
            stats: RecoveryStats::default(),
        }
    }

    /// Return the packet number the next sent packet at `level` will carry.
    pub fn peek_packet_number(&self, level: Level) -> Result<u64> {
        let space = self
            .spaces
            .get(level)
            .ok_or_else(|| Error::InvalidState("packet number space dropped".into()))?;
        Ok(space.next_pkt_num)
    }

    /// Take the next packet number at `level`. Numbers are handed out in
    /// strictly increasing order and never reused.
    pub fn pop_packet_number(&mut self, level: Level) -> Result<u64> {
        let space = self
            .spaces
            .get_mut(level)
            .ok_or_else(|| Error::InvalidState("packet number space dropped".into()))?;
        let pkt_num = space.next_pkt_num;
        space.next_pkt_num += 1;
        Ok(pkt_num)
    }

    /// Record a sent packet into the ledger of its encryption level and
    /// update the congestion controller, the pacer and the loss detection
    /// timer.
    pub fn on_packet_sent(&mut self, packet: SentPacket, level: Level, now: Instant) -> Result<()> {
        let space = self
            .spaces
            .get_mut(level)
            .ok_or_else(|| Error::InvalidState("packet number space dropped".into()))?;
        if let Some(last) = space.sent.back() {
            if packet.pkt_num <= last.pkt_num {
                return Err(Error::InternalError);
            }
        }
        space.next_pkt_num = cmp::max(space.next_pkt_num, packet.pkt_num + 1);

        if packet.ack_eliciting {
            space.time_of_last_sent_ack_eliciting_pkt = Some(now);
            space.ack_eliciting_in_flight += 1;
        }
        space.loss_probes = space.loss_probes.saturating_sub(1);
        if packet.in_flight {
            space.bytes_in_flight += packet.sent_size;
        }

        let sent_size = packet.sent_size as u64;
        if packet.in_flight {
            self.bytes_in_flight += sent_size;
            self.cc.on_sent(now, &packet, self.bytes_in_flight);
        }
        self.pacer.on_sent(sent_size);
        if self.is_server {
            self.bytes_sent += sent_size;
        }
        self.stats.sent_count += 1;
        self.stats.sent_bytes += sent_size;

        trace!("sent packet {:?} on {:?}", packet, level);
        if let Some(space) = self.spaces.get_mut(level) {
            space.sent.push_back(packet);
        }
        self.set_loss_detection_timer(now);
        Ok(())
    }

    /// Process an incoming ACK frame for the given encryption level.
    ///
    /// Acknowledging a packet that was never sent is a protocol violation.
    /// An ACK for a dropped level, or one that acknowledges nothing new, is
    /// a no-op.
    pub fn on_ack_received(
        &mut self,
        ack: &AckFrame,
        level: Level,
        now: Instant,
    ) -> Result<AckOutcome> {
        let mut outcome = AckOutcome::default();
        let largest_acked = match ack.largest_acked() {
            Some(v) => v,
            None => return Ok(outcome),
        };
        let space = match self.spaces.get_mut(level) {
            Some(s) => s,
            None => return Ok(outcome),
        };
        if largest_acked >= space.next_pkt_num {
            return Err(Error::ProtocolViolation);
        }

        // Mark the newly acked packets and collect the in-flight ones for
        // the congestion controller.
        let mut newly_acked: Vec<AckedPacket> = Vec::new();
        let mut cc_acked: Vec<SentPacket> = Vec::new();
        let mut largest_newly_acked: Option<(u64, Instant, bool)> = None;
        for pkt in space.sent.iter_mut() {
            if pkt.pkt_num > largest_acked {
                break;
            }
            if pkt.time_acked.is_some() || pkt.time_lost.is_some() {
                continue;
            }
            if !ack.ranges.contains(pkt.pkt_num) {
                continue;
            }

            pkt.time_acked = Some(now);
            if pkt.ack_eliciting {
                space.ack_eliciting_in_flight = space.ack_eliciting_in_flight.saturating_sub(1);
            }
            if pkt.in_flight {
                space.bytes_in_flight = space.bytes_in_flight.saturating_sub(pkt.sent_size);
                cc_acked.push(pkt.clone());
            }
            space.acked.extend(pkt.frames.iter().cloned());
            outcome.peer_confirmed_acked =
                cmp::max(outcome.peer_confirmed_acked, pkt.largest_acked);
            newly_acked.push(AckedPacket {
                pkt_num: pkt.pkt_num,
                time_sent: pkt.time_sent,
                rtt: now.saturating_duration_since(pkt.time_sent),
            });
            largest_newly_acked = Some((pkt.pkt_num, pkt.time_sent, pkt.ack_eliciting));
        }
        if newly_acked.is_empty() {
            return Ok(outcome);
        }

        space.largest_acked_pkt =
            Some(cmp::max(space.largest_acked_pkt.unwrap_or(0), largest_acked));
        space.loss_probes = 0;
        Self::drain_sent(space);

        // An RTT sample may only be taken if the largest acked packet is
        // newly acked and it was ack-eliciting.
        // See RFC 9002 Section 5.1
        if let Some((pkt_num, time_sent, ack_eliciting)) = largest_newly_acked {
            if pkt_num == largest_acked && ack_eliciting {
                let ack_delay = if level == Level::OneRtt {
                    cmp::min(ack.ack_delay, self.max_ack_delay)
                } else {
                    Duration::ZERO
                };
                self.rtt
                    .update(ack_delay, now.saturating_duration_since(time_sent));
            }
        }

        self.cc.begin_ack(now, self.bytes_in_flight);
        for pkt in &cc_acked {
            self.bytes_in_flight = self.bytes_in_flight.saturating_sub(pkt.sent_size as u64);
            self.cc.on_ack(pkt, now, &self.rtt, self.bytes_in_flight);
            self.stats.acked_bytes += pkt.sent_size as u64;
        }
        self.cc.end_ack();
        self.stats.acked_count += newly_acked.len() as u64;

        self.detect_lost_packets(level, now);
        self.pto_count = 0;

        if let Some(space) = self.spaces.get_mut(level) {
            outcome.acked_frames = std::mem::take(&mut space.acked);
            outcome.lost_frames = std::mem::take(&mut space.lost);
        }
        outcome.acked = newly_acked;

        debug!(
            "processed ack on {:?}, {} newly acked, {} frames lost",
            level,
            outcome.acked.len(),
            outcome.lost_frames.len()
        );
        self.set_loss_detection_timer(now);
        Ok(outcome)
    }

    /// Record bytes received from the peer, crediting the
    /// anti-amplification window.
    pub fn on_bytes_received(&mut self, bytes: u64, now: Instant) {
        self.bytes_recv += bytes;
        self.stats.recv_count += 1;
        self.stats.recv_bytes += bytes;
        // Receiving credit may unblock a timer suppressed by the
        // amplification limit.
        self.set_loss_detection_timer(now);
    }

    /// Discard the packet number space of `level`. All its state is gone
    /// for good; its in-flight bytes are removed without a congestion
    /// event. The 1-RTT space lives as long as the connection and cannot be
    /// dropped.
    /// See RFC 9002 Section 6.4
    pub fn drop_packets(&mut self, level: Level, now: Instant) -> Result<()> {
        if level == Level::OneRtt {
            return Err(Error::InvalidState("cannot drop the 1-RTT space".into()));
        }
        if let Some(space) = self.spaces.drop(level) {
            self.bytes_in_flight = self
                .bytes_in_flight
                .saturating_sub(space.bytes_in_flight as u64);
            debug!("dropped packet number space {:?}", level);
        }
        self.pto_count = 0;
        self.set_loss_detection_timer(now);
        Ok(())
    }

    /// Reset the handler after the client received a Retry packet.
    ///
    /// All Initial and 0-RTT packets must be sent again. Their
    /// retransmittable frames are returned, packet numbers are not reused,
    /// and the round trip proven by the Retry is fed to the RTT estimator.
    /// A Retry is only valid before any packet has been acknowledged.
    pub fn reset_for_retry(&mut self, now: Instant) -> Result<Vec<Frame>> {
        if self.is_server {
            return Err(Error::InvalidState("server received a retry".into()));
        }
        let initial_acked = self
            .spaces
            .get(Level::Initial)
            .map_or(false, |s| s.largest_acked_pkt.is_some());
        let handshake_used = self
            .spaces
            .get(Level::Handshake)
            .map_or(false, |s| !s.sent.is_empty() || s.largest_acked_pkt.is_some());
        if initial_acked || handshake_used || self.handshake_complete {
            return Err(Error::InvalidState("retry after handshake progress".into()));
        }

        if let Some(space) = self.spaces.get(Level::Initial) {
            if let Some(pkt) = space
                .sent
                .iter()
                .find(|p| p.time_acked.is_none() && p.time_lost.is_none() && p.ack_eliciting)
            {
                self.rtt
                    .update(Duration::ZERO, now.saturating_duration_since(pkt.time_sent));
            }
        }

        let mut frames = Vec::new();
        for level in [Level::Initial, Level::ZeroRtt] {
            if let Some(space) = self.spaces.get_mut(level) {
                for pkt in space.sent.iter() {
                    if pkt.time_acked.is_none() && pkt.time_lost.is_none() {
                        frames.extend(pkt.frames.iter().filter(|f| f.has_data()).cloned());
                    }
                }
                self.bytes_in_flight = self
                    .bytes_in_flight
                    .saturating_sub(space.bytes_in_flight as u64);
            }
            self.spaces.reset(level);
        }
        self.pto_count = 0;
        self.loss_detection_timer = None;
        Ok(frames)
    }

    /// Mark the handshake as complete. The peer address is validated and
    /// the PTO timer starts covering application data levels.
    pub fn set_handshake_complete(&mut self, now: Instant) {
        self.handshake_complete = true;
        self.set_loss_detection_timer(now);
    }

    /// Enter the closing state. Loss recovery stops; nothing but the
    /// closing frame will be sent again.
    pub fn on_closing(&mut self) {
        self.closing = true;
        self.loss_detection_timer = None;
    }

    /// What the sender is currently allowed to send.
    pub fn send_mode(&self) -> SendMode {
        if self.closing || self.amplification_window() == 0 {
            return SendMode::None;
        }
        for space in self.spaces.iter() {
            if space.loss_probes == 0 {
                continue;
            }
            return match space.level {
                Level::Initial => SendMode::PtoInitial,
                Level::Handshake => SendMode::PtoHandshake,
                Level::ZeroRtt | Level::OneRtt => SendMode::PtoOneRtt,
            };
        }
        if !self.cc.can_send(self.bytes_in_flight) {
            return SendMode::AckOnly;
        }
        SendMode::Normal
    }

    /// The number of bytes that may still be sent before the peer address
    /// is validated.
    /// See RFC 9000 Section 8.1
    pub fn amplification_window(&self) -> u64 {
        if !self.is_server || self.handshake_complete {
            return u64::MAX;
        }
        (self.anti_amplification_factor as u64)
            .saturating_mul(self.bytes_recv)
            .saturating_sub(self.bytes_sent)
    }

    /// When the next full-sized datagram may be sent, according to the
    /// pacer. None means immediately.
    pub fn time_until_send(&mut self, now: Instant) -> Option<Instant> {
        let pacing_rate = self.cc.pacing_rate().unwrap_or(0);
        self.pacer.schedule(
            self.max_datagram_size as u64,
            pacing_rate,
            self.rtt.smoothed_rtt(),
            self.cc.congestion_window(),
            self.max_datagram_size as u64,
            now,
        )
    }

    /// How many packets may be sent back to back when the pacing interval
    /// is shorter than the scheduling quantum. Always at least one.
    pub fn should_send_num_packets(&self) -> u64 {
        if !self.pacer.enabled() {
            return 1;
        }
        cmp::max(1, self.pacer.burst_budget() / self.max_datagram_size as u64)
    }

    /// Give up waiting for an acknowledgment of the oldest outstanding
    /// packet of `level` and return its retransmittable frames, so they can
    /// be carried by a probe packet. Returns no frames when nothing is
    /// outstanding; the probe then carries a PING.
    pub fn queue_probe_packet(&mut self, level: Level, now: Instant) -> Result<Vec<Frame>> {
        let space = self
            .spaces
            .get_mut(level)
            .ok_or_else(|| Error::InvalidState("packet number space dropped".into()))?;

        let mut found = None;
        for (i, pkt) in space.sent.iter().enumerate() {
            if pkt.time_acked.is_none() && pkt.time_lost.is_none() && pkt.has_data {
                found = Some(i);
                break;
            }
        }
        let i = match found {
            Some(i) => i,
            None => return Ok(Vec::new()),
        };

        let mut ack_eliciting = false;
        let mut in_flight_size = None;
        let mut frames = Vec::new();
        if let Some(pkt) = space.sent.get_mut(i) {
            pkt.time_lost = Some(now);
            ack_eliciting = pkt.ack_eliciting;
            if pkt.in_flight {
                in_flight_size = Some(pkt.sent_size);
            }
            frames = pkt.frames.iter().filter(|f| f.has_data()).cloned().collect();
        }
        if ack_eliciting {
            space.ack_eliciting_in_flight = space.ack_eliciting_in_flight.saturating_sub(1);
        }
        if let Some(size) = in_flight_size {
            space.bytes_in_flight = space.bytes_in_flight.saturating_sub(size);
            self.bytes_in_flight = self.bytes_in_flight.saturating_sub(size as u64);
        }
        if let Some(space) = self.spaces.get_mut(level) {
            Self::drain_sent(space);
        }
        Ok(frames)
    }

    /// The deadline of the unified loss detection timer, if armed. The
    /// caller must invoke [`Self::on_loss_detection_timeout`] when it
    /// expires.
    pub fn loss_detection_timeout(&self) -> Option<Instant> {
        self.loss_detection_timer
    }

    /// Handle the expiry of the loss detection timer.
    ///
    /// If a time-threshold loss deadline has passed, the overdue packets
    /// are declared lost and their retransmittable frames returned.
    /// Otherwise a PTO fired: probe packets are requested via
    /// [`Self::send_mode`] and the backoff doubles.
    pub fn on_loss_detection_timeout(&mut self, now: Instant) -> Result<Vec<Frame>> {
        if let Some((loss_time, level)) = self.earliest_loss_time() {
            if loss_time <= now {
                self.detect_lost_packets(level, now);
                let frames = match self.spaces.get_mut(level) {
                    Some(space) => std::mem::take(&mut space.lost),
                    None => Vec::new(),
                };
                self.set_loss_detection_timer(now);
                return Ok(frames);
            }
        }

        let level = match self.earliest_pto_time() {
            Some((_, level)) => Some(level),
            None if !self.is_server && !self.handshake_complete => {
                // The client deadlocks if all its Initial data is lost and
                // it stops sending; it probes with whatever keys it has.
                if self.spaces.get(Level::Initial).is_some() {
                    Some(Level::Initial)
                } else if self.spaces.get(Level::Handshake).is_some() {
                    Some(Level::Handshake)
                } else {
                    None
                }
            }
            None => None,
        };
        if let Some(level) = level {
            if let Some(space) = self.spaces.get_mut(level) {
                space.loss_probes = MAX_PTO_PROBES_COUNT;
            }
            self.pto_count += 1;
            debug!("pto fired on {:?}, pto_count={}", level, self.pto_count);
        }
        self.set_loss_detection_timer(now);
        Ok(Vec::new())
    }

    /// Return a snapshot of the aggregate recovery statistics.
    pub fn stats(&self) -> RecoveryStats {
        let mut stats = self.stats.clone();
        stats.min_rtt = self.rtt.min_rtt().as_micros() as u64;
        stats.srtt = self.rtt.smoothed_rtt().as_micros() as u64;
        stats.rttvar = self.rtt.rttvar().as_micros() as u64;
        stats.cwnd = self.cc.congestion_window();
        stats.in_slow_start = self.cc.in_slow_start();
        stats.pacing_rate = self.cc.pacing_rate().unwrap_or(0);
        stats
    }

    /// Return the RTT estimation of the path.
    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    /// Return the sum of the sizes of all in-flight packets.
    pub fn bytes_in_flight(&self) -> u64 {
        self.bytes_in_flight
    }

    /// Declare overdue packets of `level` lost, queue their retransmittable
    /// frames and report the congestion event.
    /// See RFC 9002 Section 6.1
    fn detect_lost_packets(&mut self, level: Level, now: Instant) -> (u64, u64) {
        let loss_delay = cmp::max(
            cmp::max(self.rtt.latest_rtt(), self.rtt.smoothed_rtt()).mul_f64(self.time_thresh),
            TIMER_GRANULARITY,
        );
        let pkt_thresh = self.pkt_thresh;

        let space = match self.spaces.get_mut(level) {
            Some(s) => s,
            None => return (0, 0),
        };
        let largest_acked = match space.largest_acked_pkt {
            Some(v) => v,
            None => return (0, 0),
        };
        space.loss_time = None;

        let mut lost_pkts: u64 = 0;
        let mut lost_bytes: u64 = 0;
        let mut latest_lost: Option<SentPacket> = None;
        for pkt in space.sent.iter_mut() {
            if pkt.pkt_num > largest_acked {
                break;
            }
            if pkt.time_acked.is_some() || pkt.time_lost.is_some() {
                continue;
            }

            if pkt.time_sent + loss_delay <= now || largest_acked >= pkt.pkt_num + pkt_thresh {
                pkt.time_lost = Some(now);
                space
                    .lost
                    .extend(pkt.frames.iter().filter(|f| f.has_data()).cloned());
                if pkt.ack_eliciting {
                    space.ack_eliciting_in_flight = space.ack_eliciting_in_flight.saturating_sub(1);
                }
                if pkt.in_flight {
                    space.bytes_in_flight = space.bytes_in_flight.saturating_sub(pkt.sent_size);
                    lost_bytes += pkt.sent_size as u64;
                    lost_pkts += 1;
                    latest_lost = Some(pkt.clone());
                }
                trace!("declared packet lost {:?} on {:?}", pkt, level);
            } else {
                let deadline = pkt.time_sent + loss_delay;
                space.loss_time = Some(match space.loss_time {
                    Some(t) => cmp::min(t, deadline),
                    None => deadline,
                });
            }
        }
        Self::drain_sent(space);

        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(lost_bytes);
        if let Some(pkt) = latest_lost {
            // One congestion event per loss detection pass; further losses
            // of the same flight are folded into the recovery epoch.
            self.cc
                .on_congestion_event(now, &pkt, lost_bytes, self.bytes_in_flight);
        }
        self.stats.lost_count += lost_pkts;
        self.stats.lost_bytes += lost_bytes;
        (lost_pkts, lost_bytes)
    }

    /// Remove leading ledger entries that are acked or lost. Entries behind
    /// an outstanding packet are kept so packet-threshold comparisons keep
    /// seeing them.
    fn drain_sent(space: &mut PacketNumSpace) {
        while let Some(pkt) = space.sent.front() {
            if pkt.time_acked.is_none() && pkt.time_lost.is_none() {
                break;
            }
            space.sent.pop_front();
        }
    }

    /// The earliest time-threshold loss deadline across all levels.
    fn earliest_loss_time(&self) -> Option<(Instant, Level)> {
        let mut earliest = None;
        for space in self.spaces.iter() {
            if let Some(t) = space.loss_time {
                match earliest {
                    Some((et, _)) if et <= t => (),
                    _ => earliest = Some((t, space.level)),
                }
            }
        }
        earliest
    }

    /// The earliest PTO expiry across all levels with ack-eliciting packets
    /// in flight. Application data levels only participate once the
    /// handshake completes, since their max_ack_delay is unknown before.
    fn earliest_pto_time(&self) -> Option<(Instant, Level)> {
        let mut earliest = None;
        for space in self.spaces.iter() {
            if space.ack_eliciting_in_flight == 0 {
                continue;
            }
            if space.level.is_app_data() && !self.handshake_complete {
                continue;
            }
            let base = match space.time_of_last_sent_ack_eliciting_pkt {
                Some(t) => t,
                None => continue,
            };
            let t = base + self.pto(space.level);
            match earliest {
                Some((et, _)) if et <= t => (),
                _ => earliest = Some((t, space.level)),
            }
        }
        earliest
    }

    /// The probe timeout for `level`, backed off by the number of
    /// consecutive unanswered PTOs.
    /// See RFC 9002 Section 6.2.1
    fn pto(&self, level: Level) -> Duration {
        let mut t = self.rtt.pto_base();
        if level.is_app_data() {
            t = t.saturating_add(self.max_ack_delay);
        }
        let exp = self
            .pto_count
            .saturating_sub(self.pto_linear_factor)
            .min(30) as u32;
        cmp::min(t.saturating_mul(1 << exp), self.max_pto)
    }

    /// Re-arm or disarm the unified loss detection timer.
    /// See RFC 9002 Section 6.2.2
    fn set_loss_detection_timer(&mut self, now: Instant) {
        if self.closing {
            self.loss_detection_timer = None;
            return;
        }
        if let Some((loss_time, _)) = self.earliest_loss_time() {
            self.loss_detection_timer = Some(loss_time);
            return;
        }

        // A server blocked by the amplification limit cannot send probes;
        // the timer is re-armed when credit arrives.
        if self.is_server && !self.handshake_complete && self.amplification_window() == 0 {
            self.loss_detection_timer = None;
            return;
        }

        if let Some((pto_time, _)) = self.earliest_pto_time() {
            self.loss_detection_timer = Some(pto_time);
            return;
        }

        // Nothing ack-eliciting is in flight. A client that has not
        // finished the handshake keeps the timer running to avoid a
        // deadlock when all its Initial data was declared lost.
        if !self.is_server && !self.handshake_complete {
            let level = if self.spaces.get(Level::Initial).is_some() {
                Level::Initial
            } else {
                Level::Handshake
            };
            self.loss_detection_timer = Some(now + self.pto(level));
            return;
        }
        self.loss_detection_timer = None;
    }
}
