//! RTCP report scheduling (spec §4.1/§5): RFC 3550 §6.2 interval timing
//! (reduced-min for RFC 4585 profiles), MTU-budgeted compound building in the
//! same style as the teacher's `ReportsQueue`, and the RFC3550RtcpValidator-
//! style compound validity predicate from spec §11.

use crate::Mtu;
use rand::Rng;
use rtp::{
    Ssrc,
    rtcp_types::{
        Bye, CompoundBuilder, Fir, NackBuilder, PayloadFeedback, Pli, ReceiverReport, ReportBlock,
        ReportBlockBuilder, RtcpPacketWriter, SenderReport, SenderReportBuilder, TransportFeedback,
    },
};
use std::cmp;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Minimum RTCP interval for RFC 4585 (AVPF) "reduced minimum" mode, i.e.
/// `T_rr_interval`.
pub const DEFAULT_T_RR_INTERVAL: Duration = Duration::from_millis(1000);
const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Collection of RTCP content pending transmission; budgeted into one
/// compound packet per `make_report` call under an MTU.
pub struct ReportsQueue {
    sender_reports: VecDeque<SenderReportBuilder>,
    report_blocks: VecDeque<ReportBlockBuilder>,
    nacks: VecDeque<NackBuilder>,
    nack_pli: Vec<Ssrc>,
    ccm_fir: Vec<(Ssrc, u8)>,
    sources_to_bye: Vec<Ssrc>,
    /// Opaque congestion-controller reports (SCREAM/NADA/GOOG-REMB), appended
    /// to the compound as RFC 3550 §6.7 APP packets once a report fires.
    congestion: VecDeque<Vec<u8>>,
    rtcp_rsize: bool,
}

/// Name field (RFC 3550 §6.7) for the APP packets carrying opaque
/// congestion-controller feedback blobs.
const CONGESTION_APP_NAME: [u8; 4] = *b"MCCF";

impl ReportsQueue {
    pub fn new(rtcp_rsize: bool) -> Self {
        Self {
            sender_reports: VecDeque::new(),
            report_blocks: VecDeque::new(),
            nacks: VecDeque::new(),
            nack_pli: Vec::new(),
            ccm_fir: Vec::new(),
            sources_to_bye: Vec::new(),
            congestion: VecDeque::new(),
            rtcp_rsize,
        }
    }

    pub fn rtcp_rsize(&self) -> bool {
        self.rtcp_rsize
    }

    pub fn is_empty(&self) -> bool {
        self.sender_reports.is_empty()
            && self.report_blocks.is_empty()
            && self.nacks.is_empty()
            && self.nack_pli.is_empty()
            && self.ccm_fir.is_empty()
            && self.sources_to_bye.is_empty()
    }

    pub fn has_feedback(&self) -> bool {
        !self.nacks.is_empty() || !self.nack_pli.is_empty() || !self.ccm_fir.is_empty()
    }

    pub fn add_sender_report(&mut self, sr: SenderReportBuilder) {
        self.sender_reports.push_back(sr);
    }

    pub fn add_report_block(&mut self, rb: ReportBlockBuilder) {
        self.report_blocks.push_back(rb);
    }

    /// Generic-NACK, carrying up to 30 SNs per spec §4.4/§8 — the caller
    /// (`FeedbackManager`) is responsible for the cap; we just queue it.
    pub fn add_generic_nack(&mut self, nack: NackBuilder) {
        self.nacks.push_back(nack);
    }

    pub fn add_nack_pli(&mut self, ssrc: Ssrc) {
        self.nack_pli.push(ssrc);
    }

    pub fn add_ccm_fir(&mut self, ssrc: Ssrc, seq: u8) {
        self.ccm_fir.push((ssrc, seq));
    }

    pub fn add_bye(&mut self, ssrc: Ssrc) {
        self.sources_to_bye.push(ssrc);
    }

    /// Queue an opaque congestion-controller report to ride along on the next
    /// compound that actually fires (spec §4.5's "congestion-controller
    /// reports... appended to the next outgoing compound"). Doesn't itself
    /// make the queue non-empty — a pure congestion report never forces a
    /// report out ahead of its RTCP interval.
    pub fn add_congestion_feedback(&mut self, blob: Vec<u8>) {
        self.congestion.push_back(blob);
    }

    pub fn make_report(&mut self, fallback_sender_ssrc: Ssrc, mtu: Mtu) -> Option<Vec<u8>> {
        let compound = self.make_report_compound(fallback_sender_ssrc, mtu)?;
        let mut buf = vec![0u8; compound.calculate_size().unwrap()];
        let len = compound.write_into_unchecked(&mut buf);
        buf.truncate(len);

        for blob in self.congestion.drain(..) {
            buf.extend(encode_app_packet(fallback_sender_ssrc.0, &CONGESTION_APP_NAME, &blob));
        }

        Some(buf)
    }

    fn make_report_compound(
        &mut self,
        fallback_sender_ssrc: Ssrc,
        mtu: Mtu,
    ) -> Option<CompoundBuilder<'static>> {
        if self.is_empty() {
            return None;
        }

        let mut compound = CompoundBuilder::default();
        let mtu = mtu.for_rtcp_packets();

        let mtu = if !self.sender_reports.is_empty() {
            mtu.saturating_sub(SenderReport::MIN_PACKET_LEN)
        } else if !self.report_blocks.is_empty() {
            mtu.saturating_sub(ReceiverReport::MIN_PACKET_LEN)
        } else if self.rtcp_rsize {
            mtu
        } else {
            return None;
        };

        let (mtu, num_nack) = calculate_num_of_packet_type(
            mtu,
            0,
            TransportFeedback::MIN_PACKET_LEN,
            self.nacks.len(),
            usize::MAX,
        );

        let (mtu, num_pli) = calculate_num_of_packet_type(
            mtu,
            0,
            PayloadFeedback::MIN_PACKET_LEN,
            self.nack_pli.len(),
            usize::MAX,
        );

        let (mtu, num_fir) = calculate_num_of_packet_type(
            mtu,
            PayloadFeedback::MIN_PACKET_LEN,
            8,
            self.ccm_fir.len(),
            usize::from(u16::MAX) / 2 - 2,
        );

        let (mtu, num_bye) = calculate_num_of_packet_type(
            mtu,
            Bye::MIN_PACKET_LEN,
            4,
            self.sources_to_bye.len(),
            usize::from(Bye::MAX_COUNT),
        );

        let (_mtu, num_report_blocks) = calculate_num_of_packet_type(
            mtu,
            0,
            ReportBlock::EXPECTED_SIZE,
            self.report_blocks.len(),
            usize::from(SenderReport::MAX_COUNT),
        );

        if let Some(mut sr) = self.sender_reports.pop_front() {
            for report_block in self.report_blocks.drain(..num_report_blocks) {
                sr = sr.add_report_block(report_block);
            }
            compound = compound.add_packet(sr);
        } else if num_report_blocks > 0 {
            let mut rr = ReceiverReport::builder(fallback_sender_ssrc.0);
            for report_block in self.report_blocks.drain(..num_report_blocks) {
                rr = rr.add_report_block(report_block);
            }
            compound = compound.add_packet(rr);
        }

        for nack in self.nacks.drain(..num_nack) {
            compound = compound.add_packet(
                TransportFeedback::builder_owned(nack)
                    .sender_ssrc(fallback_sender_ssrc.0)
                    .media_ssrc(fallback_sender_ssrc.0),
            );
        }

        for media_ssrc in self.nack_pli.drain(0..num_pli) {
            compound = compound.add_packet(
                PayloadFeedback::builder_owned(Pli::builder())
                    .sender_ssrc(fallback_sender_ssrc.0)
                    .media_ssrc(media_ssrc.0),
            );
        }

        if num_fir > 0 {
            let mut fir = Fir::builder();
            for (ssrc, sequence) in self.ccm_fir.drain(0..num_fir) {
                fir = fir.add_ssrc(ssrc.0, sequence);
            }
            compound = compound.add_packet(
                PayloadFeedback::builder_owned(fir)
                    .sender_ssrc(fallback_sender_ssrc.0)
                    .media_ssrc(0),
            );
        }

        if num_bye > 0 {
            let mut bye = Bye::builder();
            for ssrc in self.sources_to_bye.drain(0..num_bye) {
                bye = bye.add_source(ssrc.0);
            }
            compound = compound.add_packet(bye);
        }

        Some(compound)
    }
}

fn calculate_num_of_packet_type(
    mtu: usize,
    base_packet_len: usize,
    len_per_entry: usize,
    num_entries: usize,
    max_entries: usize,
) -> (usize, usize) {
    let num = mtu.saturating_sub(base_packet_len) / len_per_entry;
    let num = cmp::min(num, max_entries);
    let num = cmp::min(num, num_entries);

    let mtu = if num == 0 {
        mtu
    } else {
        mtu.saturating_sub(base_packet_len + num * len_per_entry)
    };

    (mtu, num)
}

/// Drives one session's (or one MPRTP flow's) RTCP interval per RFC 3550
/// §6.2, with the RFC 4585 reduced-minimum interval applied when AVPF
/// feedback is pending.
pub struct RtcpReportManager {
    queue: ReportsQueue,
    mtu: Mtu,
    ssrc: Ssrc,
    report_interval: Duration,
    t_rr_interval: Duration,
    next_report_at: Instant,
    bye_pending: bool,
    bye_sent: bool,
}

impl RtcpReportManager {
    pub fn new(ssrc: Ssrc, mtu: Mtu, rtcp_rsize: bool, now: Instant) -> Self {
        Self {
            queue: ReportsQueue::new(rtcp_rsize),
            mtu,
            ssrc,
            report_interval: DEFAULT_REPORT_INTERVAL,
            t_rr_interval: DEFAULT_T_RR_INTERVAL,
            next_report_at: now + DEFAULT_REPORT_INTERVAL,
            bye_pending: false,
            bye_sent: false,
        }
    }

    pub fn queue_mut(&mut self) -> &mut ReportsQueue {
        &mut self.queue
    }

    pub fn bye_sent(&self) -> bool {
        self.bye_sent
    }

    /// Schedule a final compound containing a BYE; fires on the next `poll`.
    pub fn schedule_bye(&mut self, now: Instant) {
        self.queue.add_bye(self.ssrc);
        self.bye_pending = true;
        self.next_report_at = now;
    }

    /// Next wakeup instant, honoring `T_rr_interval` when feedback is queued.
    pub fn next_deadline(&self, now: Instant) -> Instant {
        if self.queue.has_feedback() {
            cmp::min(self.next_report_at, now + self.t_rr_interval)
        } else {
            self.next_report_at
        }
    }

    /// Fire the interval timer if due, producing a compound and rearming.
    pub fn poll(&mut self, now: Instant, rng: &mut impl Rng) -> Option<Vec<u8>> {
        if now < self.next_deadline(now) {
            return None;
        }

        let report = self.queue.make_report(self.ssrc, self.mtu);

        if self.bye_pending && report.is_some() {
            self.bye_sent = true;
            self.bye_pending = false;
        }

        // RFC 3550 §6.2: randomize within [0.5, 1.5) x interval to avoid sync.
        let jitter = rng.random_range(0.5..1.5);
        self.next_report_at = now + self.report_interval.mul_f64(jitter);

        report
    }
}

/// Hand-rolled RFC 3550 §6.7 APP packet encoder. There's no `rtcp-types`
/// builder for APP (only the parse-side `RtcpPacket::App` variant exists),
/// so congestion-feedback blobs — already opaque to this crate — are framed
/// the same way `is_valid_compound` below reads RTCP headers: directly off
/// the wire format rather than through a packet builder.
fn encode_app_packet(ssrc: u32, name: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    const APP: u8 = 204;

    let mut data = payload.to_vec();
    while data.len() % 4 != 0 {
        data.push(0);
    }

    let length_words = (8 + data.len()) / 4 - 1;
    let mut out = Vec::with_capacity(8 + data.len());
    out.push(0x80); // V=2, P=0, subtype=0
    out.push(APP);
    out.extend_from_slice(&(length_words as u16).to_be_bytes());
    out.extend_from_slice(&ssrc.to_be_bytes());
    out.extend_from_slice(name);
    out.extend_from_slice(&data);
    out
}

/// `Rfc3550RtcpValidator`-style predicate (spec §11): version 2 throughout,
/// first packet is SR or RR, padding only set on the last packet.
pub fn is_valid_compound(data: &[u8]) -> bool {
    const SR: u8 = 200;
    const RR: u8 = 201;

    if data.is_empty() {
        return false;
    }

    let mut offset = 0;
    let mut first = true;

    while offset < data.len() {
        if data.len() - offset < 4 {
            return false;
        }

        let b0 = data[offset];
        let version = b0 >> 6;
        let padding = b0 & 0x20 != 0;
        let packet_type = data[offset + 1];
        let length_words = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
        let packet_len = (length_words + 1) * 4;

        if version != 2 || offset + packet_len > data.len() {
            return false;
        }

        if first {
            if packet_type != SR && packet_type != RR {
                return false;
            }
            first = false;
        }

        let is_last = offset + packet_len == data.len();
        if padding && !is_last {
            return false;
        }

        offset += packet_len;
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn single_sr_report_round_trips() {
        let mut reports = ReportsQueue::new(false);
        assert!(reports.make_report(Ssrc(0), Mtu::new(1200)).is_none());

        reports.add_sender_report(SenderReport::builder(0));
        let report = reports.make_report(Ssrc(0), Mtu::new(1200)).unwrap();
        assert!(report.len() <= 1200);
        assert!(is_valid_compound(&report));
        assert!(reports.is_empty());
    }

    #[test]
    fn bye_gating_waits_for_scheduled_bye_to_be_emitted() {
        let mut rng = StdRng::seed_from_u64(42);
        let t0 = Instant::now();
        let mut mgr = RtcpReportManager::new(Ssrc(1), Mtu::new(1200), false, t0);

        assert!(!mgr.bye_sent());
        mgr.schedule_bye(t0);

        let report = mgr.poll(t0, &mut rng).unwrap();
        assert!(is_valid_compound(&report));
        assert!(mgr.bye_sent());
    }

    #[test]
    fn report_does_not_fire_before_its_deadline() {
        let mut rng = StdRng::seed_from_u64(7);
        let t0 = Instant::now();
        let mut mgr = RtcpReportManager::new(Ssrc(1), Mtu::new(1200), false, t0);
        mgr.queue_mut().add_sender_report(SenderReport::builder(1));

        assert!(mgr.poll(t0 + Duration::from_millis(10), &mut rng).is_none());
    }

    #[test]
    fn congestion_feedback_rides_on_next_fired_report() {
        let mut reports = ReportsQueue::new(false);
        reports.add_congestion_feedback(vec![0xAA, 0xBB, 0xCC]);
        // congestion alone doesn't make the queue non-empty
        assert!(reports.make_report(Ssrc(1), Mtu::new(1200)).is_none());

        reports.add_congestion_feedback(vec![0xAA, 0xBB, 0xCC]);
        reports.add_sender_report(SenderReport::builder(1));
        let report = reports.make_report(Ssrc(1), Mtu::new(1200)).unwrap();
        assert!(is_valid_compound(&report));
        // SR + padded APP packet
        assert!(report.len() > SenderReport::MIN_PACKET_LEN);
    }

    #[test]
    fn validator_rejects_non_rtcp_start_and_misplaced_padding() {
        assert!(!is_valid_compound(&[]));
        // version bits zeroed: invalid
        assert!(!is_valid_compound(&[0x00, 200, 0x00, 0x00]));
    }
}
