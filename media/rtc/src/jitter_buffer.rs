//! The "V2" playout-time jitter buffer (spec §4.2): anchors its clock on the
//! first packet's arrival, presentation time and RTP timestamp, then derives
//! every later packet's playout time from that anchor, compensating for an
//! RTCP-sync event part-way through the session.

use rtp::{RtpPacket, RtpTimestamp, SequenceNumber};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Size of the ring of recently-played groups used to classify a late
/// arrival as "late but recoverable" vs. simply unknown.
const RECENT_HISTORY_CAPACITY: usize = 150;

/// All RTP packets sharing one RTP timestamp.
#[derive(Debug, Clone)]
pub struct RtpPacketGroup {
    pub rtp_timestamp: RtpTimestamp,
    pub presentation_time: Instant,
    pub rtcp_synchronised: bool,
    pub playout_time: Instant,
    packets: Vec<RtpPacket>,
}

impl RtpPacketGroup {
    fn new(
        packet: RtpPacket,
        presentation_time: Instant,
        rtcp_synchronised: bool,
        playout_time: Instant,
    ) -> Self {
        Self {
            rtp_timestamp: packet.header.timestamp,
            presentation_time,
            rtcp_synchronised,
            playout_time,
            packets: vec![packet],
        }
    }

    /// Insert a packet into this group. Returns `false` (refused) if a
    /// packet with the same sequence number is already present.
    pub fn insert(&mut self, packet: RtpPacket) -> bool {
        let sn = packet.header.sequence_number;
        if self.packets.iter().any(|p| p.header.sequence_number == sn) {
            return false;
        }
        self.packets.push(packet);
        true
    }

    pub fn packets(&self) -> &[RtpPacket] {
        &self.packets
    }

    pub fn into_packets(self) -> Vec<RtpPacket> {
        self.packets
    }

    fn contains_sn(&self, sn: SequenceNumber) -> bool {
        self.packets.iter().any(|p| p.header.sequence_number == sn)
    }
}

/// Outcome of [`JitterBufferV2::add_packet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddPacketResult {
    pub accepted: bool,
    pub late_ms: Option<u64>,
    pub duplicate: bool,
}

/// Playout-time scheduling jitter buffer, spec §4.2's preferred "V2"
/// implementation.
pub struct JitterBufferV2 {
    buf_lat: Duration,
    clock_rate: u32,

    /// (T0, P0, R0): arrival, presentation time and RTP timestamp of the very
    /// first packet seen.
    anchor: Option<(Instant, Instant, RtpTimestamp)>,

    rtcp_sync: bool,
    first_synced_pts: Option<Instant>,
    rtp_diff_ms: i64,

    /// Ordered ascending by `presentation_time`.
    playout_list: VecDeque<RtpPacketGroup>,
    /// Ring buffer of recently-played groups, most recent at the back.
    recent_history: VecDeque<RtpPacketGroup>,

    pub total_packets: u64,
    pub total_late_packets: u64,
    pub total_duplicates: u64,
}

impl JitterBufferV2 {
    pub fn new(buf_lat: Duration, clock_rate: u32) -> Self {
        Self {
            buf_lat,
            clock_rate,
            anchor: None,
            rtcp_sync: false,
            first_synced_pts: None,
            rtp_diff_ms: 0,
            playout_list: VecDeque::new(),
            recent_history: VecDeque::with_capacity(RECENT_HISTORY_CAPACITY),
            total_packets: 0,
            total_late_packets: 0,
            total_duplicates: 0,
        }
    }

    fn calculate_playout_time(
        &mut self,
        packet: &RtpPacket,
        presentation_time: Instant,
        rtcp_synchronised: bool,
    ) -> Instant {
        if !self.rtcp_sync && rtcp_synchronised {
            self.rtcp_sync = true;
            self.first_synced_pts = Some(presentation_time);

            let first_ts = self
                .anchor
                .map(|(_, _, r0)| r0)
                .unwrap_or(packet.header.timestamp);

            let delta_ticks = packet.header.timestamp.0.wrapping_sub(first_ts.0) as i64;
            self.rtp_diff_ms = delta_ticks * 1000 / i64::from(self.clock_rate);
        }

        match self.anchor {
            None => unreachable!("calculate_playout_time is only called once the anchor is set"),
            Some((t0, _p0, _r0)) => match self.first_synced_pts {
                None => {
                    let duration = presentation_time.saturating_duration_since(_p0);
                    t0 + duration + self.buf_lat
                }
                Some(p_sync) => {
                    let duration = presentation_time.saturating_duration_since(p_sync);
                    let offset = checked_duration_from_millis(self.rtp_diff_ms);
                    t0 + duration + self.buf_lat + offset
                }
            },
        }
    }

    /// `add_packet(pkt, pts, rtcp_sync)`. `now` is threaded explicitly so
    /// tests can drive the buffer with a synthetic clock (spec §10.4).
    pub fn add_packet(
        &mut self,
        packet: RtpPacket,
        presentation_time: Instant,
        rtcp_synchronised: bool,
        now: Instant,
    ) -> AddPacketResult {
        self.total_packets += 1;

        if self.anchor.is_none() {
            self.anchor = Some((now, presentation_time, packet.header.timestamp));
            let playout_time = now + self.buf_lat;
            self.insert_according_to_pts(packet, presentation_time, rtcp_synchronised, playout_time);
            return AddPacketResult {
                accepted: true,
                late_ms: None,
                duplicate: false,
            };
        }

        let playout_time = self.calculate_playout_time(&packet, presentation_time, rtcp_synchronised);

        let rtp_ts = packet.header.timestamp;
        let sn = packet.header.sequence_number;

        if let Some(group) = self
            .playout_list
            .iter_mut()
            .find(|g| g.rtp_timestamp == rtp_ts)
        {
            let duplicate = group.contains_sn(sn);
            let inserted = group.insert(packet);
            if !inserted {
                self.total_duplicates += 1;
            }
            return AddPacketResult {
                accepted: false,
                late_ms: None,
                duplicate: duplicate || !inserted,
            };
        }

        if let Some(group) = self
            .recent_history
            .iter_mut()
            .rev()
            .find(|g| g.rtp_timestamp == rtp_ts)
        {
            let late_ms = now.saturating_duration_since(playout_time).as_millis() as u64;
            let duplicate = group.contains_sn(sn);
            let inserted = group.insert(packet);
            if !inserted {
                self.total_duplicates += 1;
            }
            self.total_late_packets += 1;

            log::warn!(
                "jitter buffer: late but not in history-free path, sn={:?} pts={:?} playout={:?} now={:?}",
                sn,
                presentation_time,
                playout_time,
                now
            );

            return AddPacketResult {
                accepted: false,
                late_ms: Some(late_ms),
                duplicate: duplicate || !inserted,
            };
        }

        if playout_time < now {
            let late_ms = now.saturating_duration_since(playout_time).as_millis() as u64;
            self.total_late_packets += 1;

            log::warn!(
                "jitter buffer: late discard, sn={:?} pts={:?} playout={:?} now={:?}",
                sn,
                presentation_time,
                playout_time,
                now
            );

            return AddPacketResult {
                accepted: false,
                late_ms: Some(late_ms),
                duplicate: false,
            };
        }

        self.insert_according_to_pts(packet, presentation_time, rtcp_synchronised, playout_time);

        AddPacketResult {
            accepted: true,
            late_ms: None,
            duplicate: false,
        }
    }

    fn insert_according_to_pts(
        &mut self,
        packet: RtpPacket,
        presentation_time: Instant,
        rtcp_synchronised: bool,
        playout_time: Instant,
    ) {
        let group = RtpPacketGroup::new(packet, presentation_time, rtcp_synchronised, playout_time);

        let insert_at = self
            .playout_list
            .iter()
            .rposition(|g| g.presentation_time < presentation_time)
            .map(|idx| idx + 1)
            .unwrap_or(0);

        self.playout_list.insert(insert_at, group);
    }

    /// Pop the next group whose playout time has arrived, adding it to the
    /// recent-history ring.
    pub fn next_playout_group(&mut self, now: Instant) -> Option<RtpPacketGroup> {
        if self.playout_list.front()?.playout_time > now {
            return None;
        }

        let group = self.playout_list.pop_front()?;

        if self.recent_history.len() == RECENT_HISTORY_CAPACITY {
            self.recent_history.pop_front();
        }
        self.recent_history.push_back(group.clone());

        Some(group)
    }

    pub fn is_empty(&self) -> bool {
        self.playout_list.is_empty()
    }
}

fn checked_duration_from_millis(ms: i64) -> Duration {
    Duration::from_millis(ms.max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rtp::{RtpHeader, SequenceNumber, Ssrc};

    fn packet(sn: u16, ts: u32) -> RtpPacket {
        RtpPacket::new(
            RtpHeader::new(96, SequenceNumber(sn), RtpTimestamp(ts), Ssrc(1)),
            Bytes::new(),
        )
    }

    #[test]
    fn reorders_by_presentation_time() {
        let mut jb = JitterBufferV2::new(Duration::from_millis(100), 1000);
        let t0 = Instant::now();

        // (SN=1, PTS=0ms), (SN=3, PTS=66ms), (SN=2, PTS=33ms)
        let r1 = jb.add_packet(packet(1, 0), t0, false, t0);
        assert!(r1.accepted);

        let r3 = jb.add_packet(packet(3, 66), t0 + Duration::from_millis(66), false, t0 + Duration::from_millis(66));
        assert!(r3.accepted);

        let r2 = jb.add_packet(packet(2, 33), t0 + Duration::from_millis(33), false, t0 + Duration::from_millis(33));
        assert!(r2.accepted);

        let now = t0 + Duration::from_secs(1);
        let g1 = jb.next_playout_group(now).unwrap();
        assert_eq!(g1.rtp_timestamp, RtpTimestamp(0));

        let g2 = jb.next_playout_group(now).unwrap();
        assert_eq!(g2.rtp_timestamp, RtpTimestamp(33));

        let g3 = jb.next_playout_group(now).unwrap();
        assert_eq!(g3.rtp_timestamp, RtpTimestamp(66));
    }

    #[test]
    fn duplicate_sn_within_group_is_refused() {
        let mut jb = JitterBufferV2::new(Duration::from_millis(100), 1000);
        let t0 = Instant::now();

        let r1 = jb.add_packet(packet(1, 0), t0, false, t0);
        assert!(r1.accepted);

        let r1_again = jb.add_packet(packet(1, 0), t0, false, t0);
        assert!(!r1_again.accepted);
        assert!(r1_again.duplicate);
    }

    #[test]
    fn playout_times_are_non_decreasing_without_resync() {
        let mut jb = JitterBufferV2::new(Duration::from_millis(50), 1000);
        let t0 = Instant::now();

        for i in 0..5u32 {
            let pts = t0 + Duration::from_millis((i * 20) as u64);
            jb.add_packet(packet(i as u16 + 1, i * 20), pts, false, pts);
        }

        let now = t0 + Duration::from_secs(1);
        let mut last = None;
        while let Some(group) = jb.next_playout_group(now) {
            if let Some(last) = last {
                assert!(group.playout_time >= last);
            }
            last = Some(group.playout_time);
        }
    }
}
