//! Transmission manager (spec §4.4): a bounded store of recently sent RTP
//! packets, serviced by NACK/ACK feedback and able to synthesize/unwrap RFC
//! 4588 retransmissions.

use rtp::{MprtpSubflowHeader, RtpPacket, RtxUnwrapError, SequenceNumber, unwrap_rtx_payload, wrap_rtx_payload};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Eviction policy for sent packets held for possible retransmission.
#[derive(Debug, Clone, Copy)]
pub enum TxBufferManagementMode {
    /// Fixed capacity; oldest SN evicted on overflow.
    Circular { capacity: usize },
    /// Entries evicted `rtx_time` after being sent (SDP `a=rtx-time`).
    NackTimed { rtx_time: Duration },
    /// Entries evicted on receipt of a generic-ACK covering their SN.
    Ack,
}

#[derive(Debug, Clone)]
pub struct TxBufferEntry {
    pub rtp_packet: RtpPacket,
    pub sent_at: Instant,
    pub flow_id: Option<u16>,
    pub nack_count: u32,
    pub acknowledged: bool,
    /// Set while a wrapped RTX packet for this SN is outstanding; cleared on
    /// eviction, acknowledgement, or explicit cancellation.
    pub rtx_pending: bool,
}

/// Per-SN bookkeeping enumerated from `RetransmissionInfo.cpp`, feeding the
/// teardown `SessionStatistics` report (spec §11).
#[derive(Debug, Default, Clone, Copy)]
pub struct RtxLedger {
    pub lost: u64,
    pub false_positives: u64,
    pub received_rtx: u64,
    pub late_rtx: u64,
    pub redundant_rtx: u64,
    pub cancelled_rtx: u64,
}

pub struct TransmissionManager {
    mode: TxBufferManagementMode,
    rtx_payload_type: u8,
    entries: HashMap<u16, TxBufferEntry>,
    /// Insertion order, oldest first; used by the circular eviction policy.
    insertion_order: VecDeque<u16>,
    /// `(flow_id, fssn) -> original sn`, populated on `store` for MPRTP
    /// packets; feeds `lookup_sequence_number` for extended NACKs.
    flow_fssn_to_sn: HashMap<(u16, u16), SequenceNumber>,
    /// Ring of recently-received SNs (from the remote side), feeding
    /// `get_last_n_received_sns` for outgoing generic-ACK reports.
    recently_received: VecDeque<u16>,
    pub ledger: RtxLedger,
}

const RECEIVED_RING_CAPACITY: usize = 128;

impl TransmissionManager {
    pub fn new(mode: TxBufferManagementMode, rtx_payload_type: u8) -> Self {
        Self {
            mode,
            rtx_payload_type,
            entries: HashMap::new(),
            insertion_order: VecDeque::new(),
            flow_fssn_to_sn: HashMap::new(),
            recently_received: VecDeque::with_capacity(RECEIVED_RING_CAPACITY),
            ledger: RtxLedger::default(),
        }
    }

    pub fn store(&mut self, packet: RtpPacket, sent_at: Instant) {
        let sn = packet.header.sequence_number;

        if let Some(subflow) = packet.mprtp_subflow_header {
            self.flow_fssn_to_sn
                .insert((subflow.flow_id, subflow.fssn), sn);
        }

        self.entries.insert(
            sn.0,
            TxBufferEntry {
                flow_id: packet.flow_id,
                rtp_packet: packet,
                sent_at,
                nack_count: 0,
                acknowledged: false,
                rtx_pending: false,
            },
        );
        self.insertion_order.push_back(sn.0);

        if let TxBufferManagementMode::Circular { capacity } = self.mode {
            while self.entries.len() > capacity {
                if let Some(oldest) = self.insertion_order.pop_front() {
                    self.entries.remove(&oldest);
                }
            }
        }
    }

    /// Drop entries older than `rtx_time` under `NackTimed` mode. A no-op
    /// under the other modes.
    pub fn evict_expired(&mut self, now: Instant) {
        if let TxBufferManagementMode::NackTimed { rtx_time } = self.mode {
            self.entries
                .retain(|_, entry| now.saturating_duration_since(entry.sent_at) < rtx_time);
        }
    }

    pub fn nack(&mut self, sns: &[SequenceNumber]) {
        for sn in sns {
            if let Some(entry) = self.entries.get_mut(&sn.0) {
                entry.nack_count += 1;
            }
        }
    }

    /// Marks SNs acknowledged; under `Ack` mode this also evicts them.
    pub fn ack(&mut self, sns: &[SequenceNumber]) {
        for sn in sns {
            match self.mode {
                TxBufferManagementMode::Ack => {
                    self.entries.remove(&sn.0);
                }
                _ => {
                    if let Some(entry) = self.entries.get_mut(&sn.0) {
                        entry.acknowledged = true;
                        entry.rtx_pending = false;
                    }
                }
            }
        }
    }

    /// Records an SN received from the remote side, for `get_last_n_received_sns`.
    pub fn record_received(&mut self, sn: SequenceNumber) {
        if self.recently_received.len() == RECEIVED_RING_CAPACITY {
            self.recently_received.pop_front();
        }
        self.recently_received.push_back(sn.0);
    }

    /// Most recently received SNs, most recent last. Callers cap this at 17
    /// per spec §4.4/§8 before placing them in a generic-ACK report.
    pub fn get_last_n_received_sns(&self, n: usize) -> Vec<u16> {
        self.recently_received
            .iter()
            .rev()
            .take(n)
            .rev()
            .copied()
            .collect()
    }

    pub fn lookup_sequence_number(&self, flow_id: u16, fssn: u16) -> Option<SequenceNumber> {
        self.flow_fssn_to_sn.get(&(flow_id, fssn)).copied()
    }

    /// Wraps the stored packet for `sn` into an RFC 4588 retransmission at
    /// `new_sn`. Returns `None` if the SN isn't held, or if a wrapper is
    /// already outstanding for it (at-most-once-concurrent-RTX-per-SN).
    pub fn generate_retransmission_packet(
        &mut self,
        sn: SequenceNumber,
        new_sn: SequenceNumber,
        subflow: Option<MprtpSubflowHeader>,
    ) -> Option<RtpPacket> {
        let entry = self.entries.get_mut(&sn.0)?;
        if entry.rtx_pending {
            return None;
        }
        entry.rtx_pending = true;

        let original = &entry.rtp_packet;
        let rtx_payload = wrap_rtx_payload(sn.0, &original.payload);

        let mut header = original.header.clone();
        header.payload_type = self.rtx_payload_type;
        header.sequence_number = new_sn;

        let mut rtx_packet = RtpPacket::new(header, rtx_payload);
        rtx_packet.flow_id = subflow.map(|s| s.flow_id).or(original.flow_id);
        rtx_packet.mprtp_subflow_header = subflow;

        Some(rtx_packet)
    }

    /// Inverse of `generate_retransmission_packet`: unwraps an incoming RTX
    /// packet back into the original packet, at `original_payload_type`.
    pub fn process_retransmission(
        &mut self,
        rtx_packet: &RtpPacket,
        original_payload_type: u8,
    ) -> Result<RtpPacket, RtxUnwrapError> {
        let (original_sn, original_payload) = unwrap_rtx_payload(&rtx_packet.payload)?;

        let mut header = rtx_packet.header.clone();
        header.payload_type = original_payload_type;
        header.sequence_number = SequenceNumber(original_sn);

        let mut original = RtpPacket::new(header, original_payload);
        original.flow_id = rtx_packet.flow_id;

        match self.entries.get_mut(&original_sn) {
            Some(entry) if entry.acknowledged => self.ledger.redundant_rtx += 1,
            Some(entry) => {
                entry.acknowledged = true;
                entry.rtx_pending = false;
                self.ledger.received_rtx += 1;
            }
            None => self.ledger.late_rtx += 1,
        }

        Ok(original)
    }

    /// Cancel an outstanding RTX wrapper, e.g. because a false-positive
    /// arrived for its SN before the wrapper went out.
    pub fn cancel_pending_rtx(&mut self, sn: SequenceNumber) {
        if let Some(entry) = self.entries.get_mut(&sn.0) {
            if entry.rtx_pending {
                entry.rtx_pending = false;
                self.ledger.cancelled_rtx += 1;
            }
        }
    }

    pub fn record_lost(&mut self, _sn: SequenceNumber) {
        self.ledger.lost += 1;
    }

    pub fn record_false_positive(&mut self, _sn: SequenceNumber) {
        self.ledger.false_positives += 1;
    }

    pub fn entry(&self, sn: SequenceNumber) -> Option<&TxBufferEntry> {
        self.entries.get(&sn.0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rtp::{RtpHeader, RtpTimestamp, Ssrc};

    fn packet(sn: u16, payload: &[u8]) -> RtpPacket {
        RtpPacket::new(
            RtpHeader::new(96, SequenceNumber(sn), RtpTimestamp(0), Ssrc(1)),
            Bytes::copy_from_slice(payload),
        )
    }

    #[test]
    fn rtx_round_trips_sn_pt_and_payload() {
        let mut tx = TransmissionManager::new(TxBufferManagementMode::Circular { capacity: 16 }, 97);
        let now = Instant::now();
        tx.store(packet(7000, &[0xDE, 0xAD]), now);

        let rtx = tx
            .generate_retransmission_packet(SequenceNumber(7000), SequenceNumber(500), None)
            .unwrap();
        assert_eq!(rtx.header.payload_type, 97);
        assert_eq!(rtx.header.sequence_number, SequenceNumber(500));
        assert_eq!(&rtx.payload[..], &[0x1B, 0x58, 0xDE, 0xAD]);

        let original = tx.process_retransmission(&rtx, 96).unwrap();
        assert_eq!(original.header.sequence_number, SequenceNumber(7000));
        assert_eq!(original.header.payload_type, 96);
        assert_eq!(&original.payload[..], &[0xDE, 0xAD]);
    }

    #[test]
    fn at_most_one_concurrent_rtx_per_sn() {
        let mut tx = TransmissionManager::new(TxBufferManagementMode::Circular { capacity: 16 }, 97);
        let now = Instant::now();
        tx.store(packet(1, &[1]), now);

        assert!(tx
            .generate_retransmission_packet(SequenceNumber(1), SequenceNumber(100), None)
            .is_some());
        assert!(tx
            .generate_retransmission_packet(SequenceNumber(1), SequenceNumber(101), None)
            .is_none());

        tx.ack(&[SequenceNumber(1)]);
        // clearing rtx_pending via ack (non-Ack mode) allows a fresh wrapper
        assert!(tx
            .generate_retransmission_packet(SequenceNumber(1), SequenceNumber(102), None)
            .is_some());
    }

    #[test]
    fn circular_mode_evicts_oldest_on_overflow() {
        let mut tx = TransmissionManager::new(TxBufferManagementMode::Circular { capacity: 2 }, 97);
        let now = Instant::now();
        tx.store(packet(1, &[1]), now);
        tx.store(packet(2, &[2]), now);
        tx.store(packet(3, &[3]), now);

        assert!(tx.entry(SequenceNumber(1)).is_none());
        assert!(tx.entry(SequenceNumber(2)).is_some());
        assert!(tx.entry(SequenceNumber(3)).is_some());
    }

    #[test]
    fn ack_mode_evicts_immediately() {
        let mut tx = TransmissionManager::new(TxBufferManagementMode::Ack, 97);
        let now = Instant::now();
        tx.store(packet(1, &[1]), now);
        tx.ack(&[SequenceNumber(1)]);
        assert!(tx.entry(SequenceNumber(1)).is_none());
    }

    #[test]
    fn last_n_received_sns_caps_to_requested_count() {
        let mut tx = TransmissionManager::new(TxBufferManagementMode::Circular { capacity: 16 }, 97);
        for sn in 1..=20u16 {
            tx.record_received(SequenceNumber(sn));
        }
        let last = tx.get_last_n_received_sns(17);
        assert_eq!(last.len(), 17);
        assert_eq!(*last.last().unwrap(), 20);
    }
}
