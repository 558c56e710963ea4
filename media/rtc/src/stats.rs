//! Teardown session statistics (spec §11), assembled from the transmission
//! ledger and per-member receiver state on `stop()`.

use crate::session_database::SessionDatabase;
use crate::transmission::TransmissionManager;

/// Snapshot of one session's lifetime counters, produced once when the
/// session transitions out of `Started`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionStatistics {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_received: u64,
    pub bytes_received: u64,

    pub rtx_sent: u64,
    pub rtx_received: u64,
    pub nacks_sent: u64,

    pub assumed_lost: u64,
    pub false_positives: u64,
    pub late_rtx: u64,
    pub redundant_rtx: u64,
    pub cancelled_rtx: u64,

    /// Mean of the per-member RFC 3550 A.8 jitter estimates, in timestamp units.
    pub mean_jitter: f64,
    /// Mean of the per-member cumulative loss ratios (`lost / expected`), 0.0..=1.0.
    pub mean_loss_ratio: f64,
}

/// Running counters fed by the send/receive path; folded into a
/// [`SessionStatistics`] on teardown.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrafficCounters {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_received: u64,
    pub bytes_received: u64,
    pub nacks_sent: u64,
}

impl TrafficCounters {
    pub fn on_packet_sent(&mut self, payload_len: usize) {
        self.packets_sent += 1;
        self.bytes_sent += payload_len as u64;
    }

    pub fn on_packet_received(&mut self, payload_len: usize) {
        self.packets_received += 1;
        self.bytes_received += payload_len as u64;
    }

    pub fn on_nack_sent(&mut self, count: u64) {
        self.nacks_sent += count;
    }
}

/// Build the teardown report from the transmission ledger, traffic counters
/// and per-member receiver state. Called once, from `RtpSession::stop`.
pub fn build_session_statistics(
    traffic: &TrafficCounters,
    tx: &TransmissionManager,
    db: &SessionDatabase,
) -> SessionStatistics {
    let ledger = tx.ledger;

    let members: Vec<_> = db.ssrcs().filter_map(|ssrc| db.member(ssrc)).collect();
    let member_count = members.len().max(1) as f64;
    let mean_jitter = members.iter().map(|m| m.jitter()).sum::<f64>() / member_count;

    let loss_ratio_sum: f64 = members
        .iter()
        .map(|m| {
            let expected = m.expected() as f64;
            if expected <= 0.0 {
                0.0
            } else {
                (m.lost() as f64 / expected).clamp(0.0, 1.0)
            }
        })
        .sum();
    let mean_loss_ratio = loss_ratio_sum / member_count;

    SessionStatistics {
        packets_sent: traffic.packets_sent,
        bytes_sent: traffic.bytes_sent,
        packets_received: traffic.packets_received,
        bytes_received: traffic.bytes_received,

        rtx_sent: 0,
        rtx_received: ledger.received_rtx,
        nacks_sent: traffic.nacks_sent,

        assumed_lost: ledger.lost,
        false_positives: ledger.false_positives,
        late_rtx: ledger.late_rtx,
        redundant_rtx: ledger.redundant_rtx,
        cancelled_rtx: ledger.cancelled_rtx,

        mean_jitter,
        mean_loss_ratio,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transmission::TxBufferManagementMode;

    #[test]
    fn traffic_counters_accumulate_bytes_and_packets() {
        let mut traffic = TrafficCounters::default();
        traffic.on_packet_sent(100);
        traffic.on_packet_sent(50);
        traffic.on_packet_received(80);
        traffic.on_nack_sent(3);

        assert_eq!(traffic.packets_sent, 2);
        assert_eq!(traffic.bytes_sent, 150);
        assert_eq!(traffic.packets_received, 1);
        assert_eq!(traffic.bytes_received, 80);
        assert_eq!(traffic.nacks_sent, 3);
    }

    #[test]
    fn empty_session_reports_zeroed_stats() {
        let traffic = TrafficCounters::default();
        let tx = TransmissionManager::new(TxBufferManagementMode::Circular { capacity: 16 }, 97);
        let db = SessionDatabase::new();

        let stats = build_session_statistics(&traffic, &tx, &db);
        assert_eq!(stats.packets_sent, 0);
        assert_eq!(stats.assumed_lost, 0);
        assert_eq!(stats.mean_jitter, 0.0);
    }

    #[test]
    fn ledger_counters_flow_through_to_stats() {
        let traffic = TrafficCounters::default();
        let mut tx = TransmissionManager::new(TxBufferManagementMode::Circular { capacity: 16 }, 97);
        tx.record_lost(rtp::SequenceNumber(5));
        tx.record_lost(rtp::SequenceNumber(6));
        tx.record_false_positive(rtp::SequenceNumber(6));
        let db = SessionDatabase::new();

        let stats = build_session_statistics(&traffic, &tx, &db);
        assert_eq!(stats.assumed_lost, 2);
        assert_eq!(stats.false_positives, 1);
    }
}
