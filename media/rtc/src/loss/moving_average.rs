//! Windowed-inter-arrival loss predictor (spec §4.3, "MovingAverage").

use super::{LossDetector, LossEvent};
use rtp::SequenceNumber;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// `pto` (premature-timeout probability) and `mavg_hist` (window size) knobs,
/// named after `ApplicationParameters.cpp`'s fields of the same purpose.
#[derive(Debug, Clone, Copy)]
pub struct MovingAverageConfig {
    pub mavg_hist: usize,
    pub pto: f64,
}

impl Default for MovingAverageConfig {
    fn default() -> Self {
        Self {
            mavg_hist: 20,
            pto: 0.05,
        }
    }
}

/// Predicts the next arrival as `last_arrival + mean + k·σ` over a window of
/// the last `mavg_hist` inter-arrival intervals, where `k` is chosen so that
/// `P(premature_timeout) <= pto` under a Gaussian assumption. The timer is
/// rearmed to that predicted instant on every arrival.
pub struct MovingAverageDetector {
    config: MovingAverageConfig,
    k: f64,
    intervals: VecDeque<Duration>,
    last_arrival: Option<Instant>,
    expected_sn: Option<SequenceNumber>,
    deadline: Option<Instant>,
}

impl MovingAverageDetector {
    pub fn new(config: MovingAverageConfig) -> Self {
        let k = standard_normal_quantile(1.0 - config.pto).max(0.0);
        Self {
            config,
            k,
            intervals: VecDeque::with_capacity(config.mavg_hist),
            last_arrival: None,
            expected_sn: None,
            deadline: None,
        }
    }

    fn mean_and_std(&self) -> (f64, f64) {
        if self.intervals.is_empty() {
            return (0.0, 0.0);
        }
        let n = self.intervals.len() as f64;
        let mean = self.intervals.iter().map(Duration::as_secs_f64).sum::<f64>() / n;
        let variance = self
            .intervals
            .iter()
            .map(|d| {
                let diff = d.as_secs_f64() - mean;
                diff * diff
            })
            .sum::<f64>()
            / n;
        (mean, variance.sqrt())
    }
}

impl LossDetector for MovingAverageDetector {
    fn on_packet_arrival(&mut self, now: Instant, sn: SequenceNumber) -> Vec<LossEvent> {
        if let Some(last) = self.last_arrival {
            if self.intervals.len() == self.config.mavg_hist {
                self.intervals.pop_front();
            }
            self.intervals.push_back(now.saturating_duration_since(last));
        }
        self.last_arrival = Some(now);

        self.expected_sn = Some(SequenceNumber(sn.0.wrapping_add(1)));
        let (mean, std) = self.mean_and_std();
        let predicted_secs = (mean + self.k * std).max(0.0);
        self.deadline = Some(now + Duration::from_secs_f64(predicted_secs));

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

/// Peter Acklam's rational approximation of the inverse standard normal CDF.
fn standard_normal_quantile(p: f64) -> f64 {
    if !(0.0..1.0).contains(&p) {
        return 0.0;
    }

    const A: [f64; 6] = [
        -3.969_683_028_665_376e+01,
        2.209_460_984_245_205e+02,
        -2.759_285_104_469_687e+02,
        1.383_577_518_672_690e+02,
        -3.066_479_806_614_716e+01,
        2.506_628_277_459_239e+00,
    ];
    const B: [f64; 5] = [
        -5.447_609_879_822_406e+01,
        1.615_858_368_580_409e+02,
        -1.556_989_798_598_866e+02,
        6.680_131_188_771_972e+01,
        -1.328_068_155_288_572e+01,
    ];
    const C: [f64; 6] = [
        -7.784_894_002_430_293e-03,
        -3.223_964_580_411_365e-01,
        -2.400_758_277_161_838e+00,
        -2.549_732_539_343_734e+00,
        4.374_664_141_464_968e+00,
        2.938_163_982_698_783e+00,
    ];
    const D: [f64; 4] = [
        7.784_695_709_041_462e-03,
        3.224_671_290_700_398e-01,
        2.445_134_137_142_996e+00,
        3.754_408_661_907_416e+00,
    ];

    const P_LOW: f64 = 0.02425;
    let p_high = 1.0 - P_LOW;

    if p < P_LOW {
        let q = (-2.0 * p.ln()).sqrt();
        (((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    } else if p <= p_high {
        let q = p - 0.5;
        let r = q * q;
        (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q
            / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0)
    } else {
        let q = (-2.0 * (1.0 - p).ln()).sqrt();
        -(((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantile_of_p95_is_about_1_645() {
        let k = standard_normal_quantile(0.95);
        assert!((k - 1.645).abs() < 0.01, "k={k}");
    }

    #[test]
    fn fires_lost_once_deadline_passes_without_arrival() {
        let mut det = MovingAverageDetector::new(MovingAverageConfig::default());
        let t0 = Instant::now();

        det.on_packet_arrival(t0, SequenceNumber(1));
        det.on_packet_arrival(t0 + Duration::from_millis(20), SequenceNumber(2));
        det.on_packet_arrival(t0 + Duration::from_millis(40), SequenceNumber(3));

        assert!(det.poll(t0 + Duration::from_millis(45)).is_empty());

        let events = det.poll(t0 + Duration::from_secs(5));
        assert_eq!(events, vec![LossEvent::Lost(SequenceNumber(4))]);

        // one-shot: polling again without a new arrival fires nothing more
        assert!(det.poll(t0 + Duration::from_secs(10)).is_empty());
    }
}
