//! Scheduler plug-in contract (spec §4.7). A scheduler consumes RTP packets
//! from the packetizer and delivers them to the session; concrete variants
//! (SCREAM-style, NADA, ACK-based pacers) manage pacing and rate adaptation
//! internally and are chosen by an application-level scheduler id. This crate
//! supplies the contract plus a pass-through reference implementation.

use rtp::RtpPacket;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Instant;

/// An optional capability a codec exposes so a scheduler can request bitrate
/// changes (`rtp++`'s `ICooperativeCodec`).
pub trait CooperativeCodec: Send {
    fn set_bitrate(&mut self, kbps: u32);
    fn target_bitrate(&self) -> Option<u32>;
}

/// A congestion-control feedback block (SCREAM/NADA/GOOG-REMB). Opaque to the
/// core; schedulers interpret their own format.
#[derive(Debug, Clone)]
pub struct CongestionFeedback(pub Vec<u8>);

/// Spec §4.7's scheduler contract.
pub trait Scheduler: Send {
    fn schedule_rtp_packets(&mut self, packets: Vec<RtpPacket>);
    fn schedule_rtx_packet(&mut self, packet: RtpPacket);

    fn on_incoming_rtp(
        &mut self,
        packet: &RtpPacket,
        remote: SocketAddr,
        ssrc_valid: bool,
        rtcp_synchronised: bool,
        pts: Instant,
    );

    fn on_incoming_rtcp(&mut self, compound: &[u8], remote: SocketAddr);

    fn process_feedback(&mut self, feedback: &CongestionFeedback, remote: SocketAddr);

    /// Congestion-control reports to append to the next outgoing compound.
    fn retrieve_feedback(&mut self) -> Vec<CongestionFeedback>;

    fn shutdown(&mut self);

    /// Attach a codec the scheduler may ask to change bitrate. Default no-op
    /// for schedulers without rate adaptation (e.g. the base pass-through).
    fn set_cooperative_codec(&mut self, _codec: Option<Box<dyn CooperativeCodec>>) {}

    /// Pop the next packet ready to hand to a `NetworkInterface`, or `None` if
    /// nothing is due to send yet (pacers gate this on `now`).
    fn poll_outgoing(&mut self, now: Instant) -> Option<RtpPacket>;
}

/// Pass-through reference scheduler: no pacing, no congestion control: RTP
/// and RTX packets are handed to the network interface in the order they
/// were scheduled.
#[derive(Default)]
pub struct BaseScheduler {
    outgoing: VecDeque<RtpPacket>,
}

impl BaseScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain packets ready to hand to a `NetworkInterface`.
    pub fn take_outgoing(&mut self) -> Vec<RtpPacket> {
        self.outgoing.drain(..).collect()
    }
}

impl Scheduler for BaseScheduler {
    fn schedule_rtp_packets(&mut self, packets: Vec<RtpPacket>) {
        self.outgoing.extend(packets);
    }

    fn schedule_rtx_packet(&mut self, packet: RtpPacket) {
        self.outgoing.push_back(packet);
    }

    fn on_incoming_rtp(
        &mut self,
        _packet: &RtpPacket,
        _remote: SocketAddr,
        _ssrc_valid: bool,
        _rtcp_synchronised: bool,
        _pts: Instant,
    ) {
    }

    fn on_incoming_rtcp(&mut self, _compound: &[u8], _remote: SocketAddr) {}

    fn process_feedback(&mut self, _feedback: &CongestionFeedback, _remote: SocketAddr) {}

    fn retrieve_feedback(&mut self) -> Vec<CongestionFeedback> {
        Vec::new()
    }

    fn shutdown(&mut self) {
        self.outgoing.clear();
    }

    fn poll_outgoing(&mut self, _now: Instant) -> Option<RtpPacket> {
        self.outgoing.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rtp::{RtpHeader, RtpTimestamp, Ssrc};

    fn packet(sn: u16) -> RtpPacket {
        RtpPacket::new(
            RtpHeader::new(96, rtp::SequenceNumber(sn), RtpTimestamp(0), Ssrc(1)),
            Bytes::new(),
        )
    }

    #[test]
    fn pass_through_preserves_schedule_order() {
        let mut sched = BaseScheduler::new();
        sched.schedule_rtp_packets(vec![packet(1), packet(2)]);
        sched.schedule_rtx_packet(packet(3));

        let out = sched.take_outgoing();
        let sns: Vec<_> = out.iter().map(|p| p.header.sequence_number.0).collect();
        assert_eq!(sns, vec![1, 2, 3]);
        assert!(sched.take_outgoing().is_empty());
    }
}
