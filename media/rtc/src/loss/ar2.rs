//! Second-order autoregressive loss predictor (spec §4.3, "AR2").

use super::{LossDetector, LossEvent};
use rtp::SequenceNumber;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

const HISTORY_LEN: usize = 32;

#[derive(Debug, Clone, Copy)]
pub struct Ar2Config {
    /// Added atop the AR2-predicted inter-arrival interval before arming the
    /// deadline, to absorb short-term prediction error.
    pub margin: Duration,
}

impl Default for Ar2Config {
    fn default() -> Self {
        Self {
            margin: Duration::from_millis(0),
        }
    }
}

/// Predicts the next inter-arrival interval as `a1*x_{t-1} + a2*x_{t-2}`,
/// re-fitting `(a1, a2)` by least squares over the recent interval history on
/// every arrival, same framing as [`super::MovingAverageDetector`] but with
/// an AR(2) predictor in place of mean + k·σ.
pub struct Ar2Detector {
    config: Ar2Config,
    intervals: VecDeque<f64>,
    last_arrival: Option<Instant>,
    expected_sn: Option<SequenceNumber>,
    deadline: Option<Instant>,
}

impl Ar2Detector {
    pub fn new(config: Ar2Config) -> Self {
        Self {
            config,
            intervals: VecDeque::with_capacity(HISTORY_LEN),
            last_arrival: None,
            expected_sn: None,
            deadline: None,
        }
    }

    /// Least-squares fit of `x_t ≈ a1*x_{t-1} + a2*x_{t-2}` over the history,
    /// falling back to `(1.0, 0.0)` (repeat the last interval) when there
    /// isn't enough history or the normal equations are near-singular.
    fn fit_coefficients(&self) -> (f64, f64) {
        let samples: Vec<f64> = self.intervals.iter().copied().collect();
        if samples.len() < 3 {
            return (1.0, 0.0);
        }

        let mut s11 = 0.0;
        let mut s12 = 0.0;
        let mut s22 = 0.0;
        let mut b1 = 0.0;
        let mut b2 = 0.0;

        for window in samples.windows(3) {
            let (x_t2, x_t1, x_t) = (window[0], window[1], window[2]);
            s11 += x_t1 * x_t1;
            s12 += x_t1 * x_t2;
            s22 += x_t2 * x_t2;
            b1 += x_t1 * x_t;
            b2 += x_t2 * x_t;
        }

        let det = s11 * s22 - s12 * s12;
        if det.abs() < 1e-12 {
            return (1.0, 0.0);
        }

        let a1 = (b1 * s22 - b2 * s12) / det;
        let a2 = (s11 * b2 - s12 * b1) / det;
        (a1, a2)
    }

    fn predicted_interval(&self) -> f64 {
        let n = self.intervals.len();
        if n == 0 {
            return 0.0;
        }
        if n == 1 {
            return self.intervals[n - 1];
        }

        let (a1, a2) = self.fit_coefficients();
        let x_t1 = self.intervals[n - 1];
        let x_t2 = self.intervals[n - 2];
        (a1 * x_t1 + a2 * x_t2).max(0.0)
    }
}

impl LossDetector for Ar2Detector {
    fn on_packet_arrival(&mut self, now: Instant, sn: SequenceNumber) -> Vec<LossEvent> {
        if let Some(last) = self.last_arrival {
            if self.intervals.len() == HISTORY_LEN {
                self.intervals.pop_front();
            }
            self.intervals
                .push_back(now.saturating_duration_since(last).as_secs_f64());
        }
        self.last_arrival = Some(now);

        self.expected_sn = Some(SequenceNumber(sn.0.wrapping_add(1)));
        let predicted = self.predicted_interval();
        self.deadline = Some(now + Duration::from_secs_f64(predicted) + self.config.margin);

        Vec::new()
    }

    fn on_rtx_requested(&mut self, _now: Instant, _sn: SequenceNumber) {}

    fn on_rtx_packet_arrival(&mut self, now: Instant, sn: SequenceNumber) {
        self.on_packet_arrival(now, sn);
    }

    fn poll(&mut self, now: Instant) -> Vec<LossEvent> {
        match (self.deadline, self.expected_sn) {
            (Some(deadline), Some(expected)) if now >= deadline => {
                self.deadline = None;
                vec![LossEvent::Lost(expected)]
            }
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regular_arrivals_predict_a_similar_interval() {
        let mut det = Ar2Detector::new(Ar2Config::default());
        let t0 = Instant::now();

        for i in 0..10u32 {
            det.on_packet_arrival(
                t0 + Duration::from_millis(u64::from(i) * 20),
                SequenceNumber(i as u16 + 1),
            );
        }

        assert!(det.poll(t0 + Duration::from_millis(195)).is_empty());
        let events = det.poll(t0 + Duration::from_secs(5));
        assert_eq!(events, vec![LossEvent::Lost(SequenceNumber(11))]);
    }

    #[test]
    fn on_time_arrival_clears_deadline() {
        let mut det = Ar2Detector::new(Ar2Config::default());
        let t0 = Instant::now();

        for i in 0..5u32 {
            det.on_packet_arrival(
                t0 + Duration::from_millis(u64::from(i) * 20),
                SequenceNumber(i as u16 + 1),
            );
        }

        det.on_packet_arrival(t0 + Duration::from_millis(100), SequenceNumber(6));
        assert!(det.poll(t0 + Duration::from_millis(105)).is_empty());
    }
}
