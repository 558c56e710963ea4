//! Per-SSRC receiver state per RFC 3550 appendix A.1 (`update_seq`) and A.3
//! (jitter, loss fraction). Owned exclusively by the [`RtpSession`](crate::RtpSession)
//! that created it.

use rtp::{NtpTimestamp, SequenceNumber, MAX_DROPOUT, MAX_MISORDER, MIN_SEQUENTIAL, RTP_SEQ_MOD};
use std::collections::HashMap;
use std::time::Instant;

/// RFC 3550 appendix A.3 per-member receiver state.
#[derive(Debug, Clone)]
pub struct MemberEntry {
    base_seq: u32,
    max_seq: u16,
    bad_seq: u32,
    cycles: u32,
    received: u64,
    expected_prior: u64,
    received_prior: u64,
    /// Packets remaining before the source is no longer on probation, or
    /// `None` once accepted. Mirrors RFC 3550's `probation` field.
    probation: Option<u32>,

    /// RFC 3550 A.8 interarrival jitter estimate, in timestamp units.
    jitter: f64,
    /// Relative transit time of the previous packet (arrival − RTP ts),
    /// used to compute `jitter`.
    transit: Option<i64>,

    last_sr: Option<NtpTimestamp>,
    last_sr_arrival: Option<Instant>,
}

const PROBATION_PACKETS: u32 = MIN_SEQUENTIAL;

impl MemberEntry {
    /// Begin tracking a new source, per RFC 3550 A.1 `init_seq`.
    fn init(seq: SequenceNumber) -> Self {
        Self {
            base_seq: u32::from(seq.0),
            max_seq: seq.0,
            bad_seq: RTP_SEQ_MOD + 1,
            cycles: 0,
            received: 0,
            expected_prior: 0,
            received_prior: 0,
            probation: None,
            jitter: 0.0,
            transit: None,
            last_sr: None,
            last_sr_arrival: None,
        }
    }

    /// RFC 3550 A.1 `update_seq`. Returns `true` if the packet should be
    /// accepted (i.e. isn't a wild jump still on probation).
    fn update_seq(&mut self, seq: SequenceNumber) -> bool {
        let udelta = u32::from(seq.0).wrapping_sub(self.max_seq as u32) & 0xFFFF;

        if let Some(probation) = self.probation {
            // Source is not valid until MIN_SEQUENTIAL packets with
            // sequential sequence numbers have been received.
            if seq.0 == self.max_seq.wrapping_add(1) {
                self.probation = probation.checked_sub(1).filter(|p| *p > 0);
                self.max_seq = seq.0;
                if self.probation.is_none() {
                    self.received += 1;
                    return true;
                }
                return false;
            } else {
                self.probation = Some(PROBATION_PACKETS - 1);
                self.max_seq = seq.0;
                return false;
            }
        }

        if udelta < MAX_DROPOUT {
            // In order, with permissible gap.
            if seq.0 < self.max_seq {
                self.cycles += 1;
            }
            self.max_seq = seq.0;
        } else if udelta <= RTP_SEQ_MOD - MAX_MISORDER {
            // Sequence number jumped backward or far forward: possible
            // restart of the source.
            if u32::from(seq.0) == self.bad_seq {
                // Two sequential packets: assume restart.
                *self = Self::init(seq);
                self.probation = Some(PROBATION_PACKETS - 1);
            } else {
                self.bad_seq = (u32::from(seq.0).wrapping_add(1)) & (RTP_SEQ_MOD - 1);
                return false;
            }
        } else {
            // Duplicate or reordered packet within tolerance; accept.
        }

        self.received += 1;
        true
    }

    /// RFC 3550 A.8 jitter update given the current transit time
    /// (`arrival − rtp_timestamp`, both in timestamp units).
    fn update_jitter(&mut self, transit: i64) {
        if let Some(prev) = self.transit {
            let d = (transit - prev).unsigned_abs() as f64;
            self.jitter += (d - self.jitter) / 16.0;
        }
        self.transit = Some(transit);
    }

    pub fn extended_max(&self) -> u32 {
        (self.cycles << 16) | u32::from(self.max_seq)
    }

    pub fn expected(&self) -> u64 {
        u64::from(self.extended_max()) - u64::from(self.base_seq) + 1
    }

    pub fn lost(&self) -> i64 {
        self.expected() as i64 - self.received as i64
    }

    /// Fraction lost since the previous report (RFC 3550 6.4.1).
    pub fn fraction_lost(&mut self) -> u8 {
        let expected = self.expected();
        let expected_interval = expected.saturating_sub(self.expected_prior);
        self.expected_prior = expected;

        let received_interval = self.received.saturating_sub(self.received_prior);
        self.received_prior = self.received;

        let lost_interval = expected_interval.saturating_sub(received_interval);

        if expected_interval == 0 || lost_interval == 0 {
            0
        } else {
            ((lost_interval << 8) / expected_interval).min(255) as u8
        }
    }

    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    pub fn record_sender_report(&mut self, ntp: NtpTimestamp, arrival: Instant) {
        self.last_sr = Some(ntp);
        self.last_sr_arrival = Some(arrival);
    }

    pub fn last_sr(&self) -> Option<(NtpTimestamp, Instant)> {
        self.last_sr.zip(self.last_sr_arrival)
    }

    pub fn is_probationary(&self) -> bool {
        self.probation.is_some()
    }
}

/// Per-SSRC receiver tracking table owned by one [`RtpSession`](crate::RtpSession).
#[derive(Debug, Default)]
pub struct SessionDatabase {
    members: HashMap<rtp::Ssrc, MemberEntry>,
}

impl SessionDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a received packet's sequence number for `ssrc`, creating the
    /// member entry (on probation) if this is the first packet seen from it.
    /// Returns `true` if the packet should be accepted into the reception
    /// pipeline (i.e. the source is no longer on probation after this call).
    pub fn on_packet_arrival(
        &mut self,
        ssrc: rtp::Ssrc,
        seq: SequenceNumber,
        arrival: Instant,
        rtp_timestamp: rtp::RtpTimestamp,
        clock_rate: u32,
    ) -> bool {
        let entry = self.members.entry(ssrc).or_insert_with(|| {
            let mut m = MemberEntry::init(seq);
            m.probation = Some(PROBATION_PACKETS);
            m
        });

        let accepted = entry.update_seq(seq);

        if accepted {
            let arrival_ticks =
                (crate::clock::ntp_now(arrival).as_seconds_f64() * f64::from(clock_rate)) as i64;
            let transit = arrival_ticks - i64::from(rtp_timestamp.0);
            entry.update_jitter(transit);
        }

        accepted
    }

    pub fn member(&self, ssrc: rtp::Ssrc) -> Option<&MemberEntry> {
        self.members.get(&ssrc)
    }

    pub fn member_mut(&mut self, ssrc: rtp::Ssrc) -> Option<&mut MemberEntry> {
        self.members.get_mut(&ssrc)
    }

    pub fn remove(&mut self, ssrc: rtp::Ssrc) -> Option<MemberEntry> {
        self.members.remove(&ssrc)
    }

    pub fn ssrcs(&self) -> impl Iterator<Item = rtp::Ssrc> + '_ {
        self.members.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_packets_pass_probation_after_min_sequential() {
        let mut db = SessionDatabase::new();
        let ssrc = rtp::Ssrc(1);
        let now = Instant::now();

        assert!(!db.on_packet_arrival(ssrc, SequenceNumber(100), now, rtp::RtpTimestamp(0), 8000));
        assert!(db.on_packet_arrival(ssrc, SequenceNumber(101), now, rtp::RtpTimestamp(0), 8000));
        assert!(!db.member(ssrc).unwrap().is_probationary());
    }

    #[test]
    fn wild_jump_resets_probation() {
        let mut db = SessionDatabase::new();
        let ssrc = rtp::Ssrc(1);
        let now = Instant::now();

        db.on_packet_arrival(ssrc, SequenceNumber(100), now, rtp::RtpTimestamp(0), 8000);
        db.on_packet_arrival(ssrc, SequenceNumber(101), now, rtp::RtpTimestamp(0), 8000);
        assert!(!db.member(ssrc).unwrap().is_probationary());

        // A huge jump forward looks like a restart; two sequential packets confirm it.
        assert!(!db.on_packet_arrival(ssrc, SequenceNumber(40000), now, rtp::RtpTimestamp(0), 8000));
        assert!(db.on_packet_arrival(ssrc, SequenceNumber(40001), now, rtp::RtpTimestamp(0), 8000));
    }

    #[test]
    fn expected_and_lost_track_extended_sequence() {
        let mut db = SessionDatabase::new();
        let ssrc = rtp::Ssrc(1);
        let now = Instant::now();

        db.on_packet_arrival(ssrc, SequenceNumber(1), now, rtp::RtpTimestamp(0), 8000);
        db.on_packet_arrival(ssrc, SequenceNumber(2), now, rtp::RtpTimestamp(0), 8000);
        db.on_packet_arrival(ssrc, SequenceNumber(4), now, rtp::RtpTimestamp(0), 8000);

        let member = db.member(ssrc).unwrap();
        assert_eq!(member.expected(), 4);
        assert_eq!(member.lost(), 1);
    }
}
