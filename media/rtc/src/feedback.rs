//! Feedback manager (spec §4.5): merges per-flow NACK/ACK/congestion reports
//! into compound RTCP on the report-manager's interval, plus an early
//! feedback fast path gated by RFC 4585's `T_rr_interval`.

use crate::scheduler::CongestionFeedback;
use crate::transmission::TransmissionManager;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Cap on SNs in one generic-NACK report (spec §4.4/§8); more than this
/// triggers a FIR instead.
pub const GENERIC_NACK_CAP: usize = 30;
/// Cap on SNs in one generic-ACK report (spec §4.4/§8).
pub const GENERIC_ACK_CAP: usize = 17;

/// One flow's pending generic-NACK, or the single-path report (`flow_id = None`).
#[derive(Debug, Clone)]
pub struct GenericNack {
    pub flow_id: Option<u16>,
    pub sns: Vec<u16>,
}

#[derive(Debug, Clone, Default)]
pub struct FeedbackReport {
    pub nacks: Vec<GenericNack>,
    /// Set when a flow had more lost SNs pending than `GENERIC_NACK_CAP`.
    pub fir_requested: bool,
    pub acked_sns: Vec<u16>,
    /// Congestion-controller reports (SCREAM/NADA/GOOG-REMB), passed through
    /// from the scheduler's `retrieve_feedback` unchanged — opaque to this
    /// manager, just carried to the next outgoing compound.
    pub congestion: Vec<CongestionFeedback>,
}

pub struct FeedbackManager {
    t_rr_interval: Duration,
    pending_lost: HashMap<Option<u16>, Vec<u16>>,
    newest_received: Option<u16>,
    last_acked_newest: Option<u16>,
    last_feedback_at: Option<Instant>,
}

impl FeedbackManager {
    pub fn new(t_rr_interval: Duration) -> Self {
        Self {
            t_rr_interval,
            pending_lost: HashMap::new(),
            newest_received: None,
            last_acked_newest: None,
            last_feedback_at: None,
        }
    }

    /// Record a loss-detector `on_lost` event, optionally scoped to an MPRTP flow.
    pub fn report_lost(&mut self, flow_id: Option<u16>, sn: u16) {
        self.pending_lost.entry(flow_id).or_default().push(sn);
    }

    /// Record that `sn` was received, for generic-ACK change detection.
    pub fn report_received(&mut self, sn: u16) {
        self.newest_received = Some(sn);
    }

    /// RTCP-interval fire: drains pending NACK state, consults `tx` for the
    /// generic-ACK SN list, and appends `congestion` (the scheduler's
    /// `retrieve_feedback` output) to the report unchanged.
    pub fn on_feedback_generation(
        &mut self,
        tx: &TransmissionManager,
        congestion: Vec<CongestionFeedback>,
    ) -> FeedbackReport {
        let mut nacks = Vec::new();
        let mut fir_requested = false;

        for (flow_id, sns) in self.pending_lost.drain() {
            if sns.is_empty() {
                continue;
            }
            if sns.len() > GENERIC_NACK_CAP {
                fir_requested = true;
            } else {
                nacks.push(GenericNack { flow_id, sns });
            }
        }

        let acked_sns = if self.newest_received != self.last_acked_newest {
            self.last_acked_newest = self.newest_received;
            tx.get_last_n_received_sns(GENERIC_ACK_CAP)
        } else {
            Vec::new()
        };

        FeedbackReport {
            nacks,
            fir_requested,
            acked_sns,
            congestion,
        }
    }

    /// `try_schedule_early_feedback`: gated by RFC 4585's `T_rr_interval`.
    /// Returns `(scheduled_at, delay_ms)` or `None` if the interval hasn't
    /// elapsed since the last (early or regular) feedback.
    pub fn try_schedule_early_feedback(&mut self, now: Instant) -> Option<(Instant, u64)> {
        if let Some(last) = self.last_feedback_at {
            if now.saturating_duration_since(last) < self.t_rr_interval {
                return None;
            }
        }
        self.last_feedback_at = Some(now);
        Some((now, 0))
    }

    /// Record that a regular (interval-fired) compound was just sent, so
    /// early feedback is gated against it too.
    pub fn note_feedback_sent(&mut self, now: Instant) {
        self.last_feedback_at = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transmission::TxBufferManagementMode;

    #[test]
    fn nack_cap_triggers_fir_instead() {
        let mut fb = FeedbackManager::new(Duration::from_millis(0));
        let tx = TransmissionManager::new(TxBufferManagementMode::Circular { capacity: 16 }, 97);

        for sn in 0..31u16 {
            fb.report_lost(None, sn);
        }

        let report = fb.on_feedback_generation(&tx, Vec::new());
        assert!(report.fir_requested);
        assert!(report.nacks.is_empty());
    }

    #[test]
    fn nack_within_cap_is_reported() {
        let mut fb = FeedbackManager::new(Duration::from_millis(0));
        let tx = TransmissionManager::new(TxBufferManagementMode::Circular { capacity: 16 }, 97);

        for sn in 0..5u16 {
            fb.report_lost(None, sn);
        }

        let report = fb.on_feedback_generation(&tx, Vec::new());
        assert!(!report.fir_requested);
        assert_eq!(report.nacks.len(), 1);
        assert_eq!(report.nacks[0].sns.len(), 5);
    }

    #[test]
    fn ack_only_reported_when_newest_received_changed() {
        let mut fb = FeedbackManager::new(Duration::from_millis(0));
        let mut tx = TransmissionManager::new(TxBufferManagementMode::Circular { capacity: 16 }, 97);
        tx.record_received(rtp::SequenceNumber(1));

        fb.report_received(1);
        let report = fb.on_feedback_generation(&tx, Vec::new());
        assert_eq!(report.acked_sns, vec![1]);

        let report = fb.on_feedback_generation(&tx, Vec::new());
        assert!(report.acked_sns.is_empty());
    }

    #[test]
    fn congestion_feedback_passes_through_unchanged() {
        let mut fb = FeedbackManager::new(Duration::from_millis(0));
        let tx = TransmissionManager::new(TxBufferManagementMode::Circular { capacity: 16 }, 97);

        let report = fb.on_feedback_generation(&tx, vec![CongestionFeedback(vec![1, 2, 3])]);
        assert_eq!(report.congestion.len(), 1);
        assert_eq!(report.congestion[0].0, vec![1, 2, 3]);
    }

    #[test]
    fn early_feedback_is_rate_limited_by_t_rr_interval() {
        let mut fb = FeedbackManager::new(Duration::from_millis(100));
        let t0 = Instant::now();

        assert!(fb.try_schedule_early_feedback(t0).is_some());
        assert!(fb.try_schedule_early_feedback(t0 + Duration::from_millis(50)).is_none());
        assert!(fb.try_schedule_early_feedback(t0 + Duration::from_millis(150)).is_some());
    }
}
