//! Loss detection / RTO estimation (spec §4.3): three pluggable predictors
//! sharing one interface, each producing `on_lost` (and, for the simple
//! predictor, false-positive) events as packets arrive or fail to.

mod ar2;
mod moving_average;
mod simple;

pub use ar2::{Ar2Config, Ar2Detector};
pub use moving_average::{MovingAverageConfig, MovingAverageDetector};
pub use simple::SimpleDetector;

use rtp::SequenceNumber;
use std::time::Instant;

/// A loss or recovery signal produced by a detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossEvent {
    /// `sn` is assumed lost.
    Lost(SequenceNumber),
    /// `sn` was assumed lost but has now arrived.
    FalsePositive(SequenceNumber),
}

/// Common predictor interface (spec §4.3). `poll` drives the timing-based
/// predictors (moving-average, AR2); the gap-based simple predictor fires
/// everything synchronously from `on_packet_arrival` and has a no-op `poll`.
pub trait LossDetector {
    fn on_packet_arrival(&mut self, now: Instant, sn: SequenceNumber) -> Vec<LossEvent>;

    fn on_rtx_requested(&mut self, now: Instant, sn: SequenceNumber);

    fn on_rtx_packet_arrival(&mut self, now: Instant, sn: SequenceNumber);

    /// Check timing-based deadlines. Gap-based detectors can leave this empty.
    fn poll(&mut self, now: Instant) -> Vec<LossEvent> {
        let _ = now;
        Vec::new()
    }
}

/// Selects which of the three predictors a session uses, so the choice can be
/// made once in `SessionParameters` and then boxed up behind one type.
pub enum AnyLossDetector {
    Simple(SimpleDetector),
    MovingAverage(MovingAverageDetector),
    Ar2(Ar2Detector),
}

impl LossDetector for AnyLossDetector {
    fn on_packet_arrival(&mut self, now: Instant, sn: SequenceNumber) -> Vec<LossEvent> {
        match self {
            Self::Simple(d) => d.on_packet_arrival(now, sn),
            Self::MovingAverage(d) => d.on_packet_arrival(now, sn),
            Self::Ar2(d) => d.on_packet_arrival(now, sn),
        }
    }

    fn on_rtx_requested(&mut self, now: Instant, sn: SequenceNumber) {
        match self {
            Self::Simple(d) => d.on_rtx_requested(now, sn),
            Self::MovingAverage(d) => d.on_rtx_requested(now, sn),
            Self::Ar2(d) => d.on_rtx_requested(now, sn),
        }
    }

    fn on_rtx_packet_arrival(&mut self, now: Instant, sn: SequenceNumber) {
        match self {
            Self::Simple(d) => d.on_rtx_packet_arrival(now, sn),
            Self::MovingAverage(d) => d.on_rtx_packet_arrival(now, sn),
            Self::Ar2(d) => d.on_rtx_packet_arrival(now, sn),
        }
    }

    fn poll(&mut self, now: Instant) -> Vec<LossEvent> {
        match self {
            Self::Simple(d) => d.poll(now),
            Self::MovingAverage(d) => d.poll(now),
            Self::Ar2(d) => d.poll(now),
        }
    }
}

/// Which predictor to instantiate for each flow of a session.
#[derive(Debug, Clone, Copy, Default)]
pub enum LossDetectorChoice {
    #[default]
    Simple,
    MovingAverage,
    Ar2,
}

impl LossDetectorChoice {
    pub fn build(self) -> AnyLossDetector {
        match self {
            Self::Simple => AnyLossDetector::Simple(SimpleDetector::default()),
            Self::MovingAverage => {
                AnyLossDetector::MovingAverage(MovingAverageDetector::new(MovingAverageConfig::default()))
            }
            Self::Ar2 => AnyLossDetector::Ar2(Ar2Detector::new(Ar2Config::default())),
        }
    }
}

/// One estimator per MPRTP flow; losses map back to the owning flow's FSSN.
pub struct MultipathLossDetector<D> {
    per_flow: std::collections::HashMap<u16, D>,
    factory: Box<dyn Fn() -> D + Send>,
}

impl<D: LossDetector> MultipathLossDetector<D> {
    pub fn new(factory: impl Fn() -> D + Send + 'static) -> Self {
        Self {
            per_flow: std::collections::HashMap::new(),
            factory: Box::new(factory),
        }
    }

    fn detector(&mut self, flow_id: u16) -> &mut D {
        self.per_flow.entry(flow_id).or_insert_with(|| (self.factory)())
    }

    /// Reports losses as `(flow_id, fssn)` per spec §4.3.
    pub fn on_packet_arrival(
        &mut self,
        now: Instant,
        flow_id: u16,
        fssn: SequenceNumber,
    ) -> Vec<(u16, LossEvent)> {
        self.detector(flow_id)
            .on_packet_arrival(now, fssn)
            .into_iter()
            .map(|ev| (flow_id, ev))
            .collect()
    }

    pub fn poll(&mut self, now: Instant) -> Vec<(u16, LossEvent)> {
        let mut out = Vec::new();
        for (&flow_id, detector) in self.per_flow.iter_mut() {
            out.extend(detector.poll(now).into_iter().map(|ev| (flow_id, ev)));
        }
        out
    }

    pub fn on_rtx_requested(&mut self, now: Instant, flow_id: u16, sn: SequenceNumber) {
        self.detector(flow_id).on_rtx_requested(now, sn);
    }

    pub fn on_rtx_packet_arrival(&mut self, now: Instant, flow_id: u16, sn: SequenceNumber) {
        self.detector(flow_id).on_rtx_packet_arrival(now, sn);
    }
}
