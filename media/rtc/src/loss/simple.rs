//! Gap-based loss detector (spec §4.3, "Simple").

use super::{LossDetector, LossEvent};
use rtp::{MAX_DROPOUT, MAX_MISORDER, RTP_SEQ_MOD, SequenceNumber};
use std::collections::BTreeSet;
use std::time::Instant;

/// Fires `on_lost` synchronously for every SN skipped by a forward gap, and
/// `on_lost`'s inverse — a false positive — when a previously-assumed-lost SN
/// turns out to have arrived late.
#[derive(Debug, Default)]
pub struct SimpleDetector {
    last_sn: Option<SequenceNumber>,
    assumed_lost: BTreeSet<u16>,
}

impl SimpleDetector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LossDetector for SimpleDetector {
    fn on_packet_arrival(&mut self, _now: Instant, sn: SequenceNumber) -> Vec<LossEvent> {
        let mut events = Vec::new();

        if self.assumed_lost.remove(&sn.0) {
            events.push(LossEvent::FalsePositive(sn));
        }

        match self.last_sn {
            None => self.last_sn = Some(sn),
            Some(last) => {
                let delta = u32::from(sn.0.wrapping_sub(last.0));

                if delta == 0 {
                    // duplicate of the most recent SN
                } else if delta < MAX_DROPOUT {
                    for step in 1..delta {
                        let missing = SequenceNumber(last.0.wrapping_add(step as u16));
                        self.assumed_lost.insert(missing.0);
                        events.push(LossEvent::Lost(missing));
                    }
                    self.last_sn = Some(sn);
                } else if delta <= RTP_SEQ_MOD - MAX_MISORDER {
                    // Large forward jump: possible restart, reset tracking.
                    self.last_sn = Some(sn);
                    self.assumed_lost.clear();
                } else {
                    // Small backward step: reordered/duplicate, within tolerance.
                }
            }
        }

        events
    }

    fn on_rtx_requested(&mut self, _now: Instant, _sn: SequenceNumber) {}

    fn on_rtx_packet_arrival(&mut self, now: Instant, sn: SequenceNumber) {
        self.on_packet_arrival(now, sn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gap_emits_lost_for_each_missing_sn() {
        let mut det = SimpleDetector::new();
        let t0 = Instant::now();

        assert!(det.on_packet_arrival(t0, SequenceNumber(1)).is_empty());

        let events = det.on_packet_arrival(t0, SequenceNumber(3));
        assert_eq!(events, vec![LossEvent::Lost(SequenceNumber(2))]);
    }

    #[test]
    fn late_arrival_of_lost_sn_is_a_false_positive_exactly_once() {
        let mut det = SimpleDetector::new();
        let t0 = Instant::now();

        det.on_packet_arrival(t0, SequenceNumber(1));
        det.on_packet_arrival(t0, SequenceNumber(3));

        let events = det.on_packet_arrival(t0, SequenceNumber(2));
        assert_eq!(events, vec![LossEvent::FalsePositive(SequenceNumber(2))]);

        // a second sighting of SN=2 must not fire a second false positive
        let events = det.on_packet_arrival(t0, SequenceNumber(2));
        assert!(events.is_empty());
    }

    #[test]
    fn wild_forward_jump_resets_without_backfilling_lost_events() {
        let mut det = SimpleDetector::new();
        let t0 = Instant::now();

        det.on_packet_arrival(t0, SequenceNumber(1));
        let events = det.on_packet_arrival(t0, SequenceNumber(40_000));
        assert!(events.is_empty());
        assert!(det.assumed_lost.is_empty());
    }
}
