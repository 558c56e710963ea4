//! Maps between wall-clock [`Instant`]s, RTP timestamps and NTP timestamps
//! for one stream's clock rate.

use rtp::{ExtendedRtpTimestamp, NtpTimestamp};
use std::time::Instant;
use time::ext::InstantExt;

/// Anchors a stream's RTP timestamp space to wall-clock time, so that any
/// later `Instant` can be mapped back and forth to an `ExtendedRtpTimestamp`.
#[derive(Debug, Clone, Copy)]
pub struct RtpClock {
    clock_rate: f64,
    anchor: Option<(Instant, ExtendedRtpTimestamp)>,
}

impl RtpClock {
    pub fn new(clock_rate: u32) -> Self {
        Self {
            clock_rate: f64::from(clock_rate),
            anchor: None,
        }
    }

    pub fn clock_rate(&self) -> f64 {
        self.clock_rate
    }

    /// Anchor the clock to `(instant, ts)` if it hasn't been anchored yet.
    pub fn anchor_if_unset(&mut self, instant: Instant, ts: ExtendedRtpTimestamp) {
        self.anchor.get_or_insert((instant, ts));
    }

    pub fn is_anchored(&self) -> bool {
        self.anchor.is_some()
    }

    /// Extend `ts`, which was observed at `instant`, against the anchor (or
    /// become the anchor, if none is set yet).
    pub fn extend(&mut self, instant: Instant, ts: rtp::RtpTimestamp) -> ExtendedRtpTimestamp {
        match self.anchor {
            Some((anchor_instant, anchor_ts)) => {
                let guess = self.instant_to_rtp_timestamp(instant);
                let reference = guess.unwrap_or(anchor_ts);
                reference.guess_extended(ts)
            }
            None => {
                let extended = ExtendedRtpTimestamp(u64::from(ts.0));
                self.anchor = Some((instant, extended));
                extended
            }
        }
    }

    /// Project `instant` onto the RTP timestamp line using the anchor.
    pub fn instant_to_rtp_timestamp(&self, instant: Instant) -> Option<ExtendedRtpTimestamp> {
        let (anchor_instant, anchor_ts) = self.anchor?;

        let delta_ts = instant.signed_duration_since(anchor_instant).as_seconds_f64() * self.clock_rate;

        let v = anchor_ts.0.cast_signed() + delta_ts as i64;
        Some(ExtendedRtpTimestamp(v.cast_unsigned()))
    }

    /// Project an RTP timestamp back onto wall-clock time using the anchor.
    pub fn rtp_timestamp_to_instant(&self, ts: ExtendedRtpTimestamp) -> Option<Instant> {
        let (anchor_instant, anchor_ts) = self.anchor?;

        let delta_ticks = ts.0.cast_signed() - anchor_ts.0.cast_signed();
        let delta_seconds = delta_ticks as f64 / self.clock_rate;

        if delta_seconds >= 0.0 {
            anchor_instant.checked_add(time::Duration::seconds_f64(delta_seconds).try_into().ok()?)
        } else {
            anchor_instant.checked_sub(time::Duration::seconds_f64(-delta_seconds).try_into().ok()?)
        }
    }
}

/// NTP timestamp for `instant`, via [`NtpTimestamp::from_instant`].
pub fn ntp_now(instant: Instant) -> NtpTimestamp {
    NtpTimestamp::from_instant(instant)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn anchors_on_first_extend() {
        let mut clock = RtpClock::new(90_000);
        let now = Instant::now();
        let ts = clock.extend(now, rtp::RtpTimestamp(1000));
        assert_eq!(ts, ExtendedRtpTimestamp(1000));
        assert!(clock.is_anchored());
    }

    #[test]
    fn projects_forward_and_back() {
        let mut clock = RtpClock::new(1000);
        let now = Instant::now();
        clock.extend(now, rtp::RtpTimestamp(1000));

        let later = now + Duration::from_millis(500);
        let projected = clock.instant_to_rtp_timestamp(later).unwrap();
        assert_eq!(projected, ExtendedRtpTimestamp(1500));

        let back = clock.rtp_timestamp_to_instant(projected).unwrap();
        let diff: Duration = back.signed_duration_since(later).abs().try_into().unwrap();
        assert!(diff < Duration::from_millis(1));
    }
}
