//! NTP 64-bit timestamp used both by RTCP SR/RR and the RFC 6051 rapid-sync
//! RTP header extension (MSW‖LSW of the same fixed-point format).

use std::{
    ops::Sub,
    sync::LazyLock,
    time::{Duration, Instant, SystemTime},
};
use time::ext::InstantExt;

static SYSTEM_TIME_TO_INSTANT: LazyLock<(SystemTime, Instant)> =
    LazyLock::new(|| (SystemTime::now(), Instant::now()));

/// NTP timestamp: duration since 1900-01-01 UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NtpTimestamp {
    // Duration since 01.01.1900
    inner: time::Duration,
}

impl NtpTimestamp {
    pub const ZERO: Self = Self {
        inner: time::Duration::ZERO,
    };

    fn epoch() -> time::OffsetDateTime {
        let date = time::Date::from_calendar_date(1900, time::Month::January, 1)
            .expect("1900-01-01 is a valid calendar date");
        time::OffsetDateTime::new_utc(date, time::Time::MIDNIGHT)
    }

    /// NTP timestamp for the current wall-clock time.
    pub fn now() -> Self {
        Self {
            inner: time::OffsetDateTime::now_utc() - Self::epoch(),
        }
    }

    /// NTP timestamp corresponding to a monotonic [`Instant`], anchored via a
    /// single `SystemTime`/`Instant` pair captured at first use.
    pub fn from_instant(now: Instant) -> Self {
        let (ref_time, ref_instant) = &*SYSTEM_TIME_TO_INSTANT;
        let system_time = *ref_time + now.signed_duration_since(*ref_instant);

        Self {
            inner: system_time - Self::epoch(),
        }
    }

    pub fn as_seconds_f64(self) -> f64 {
        self.inner.as_seconds_f64()
    }

    pub fn is_zero(self) -> bool {
        self.inner.is_zero()
    }

    /// Full 64-bit fixed-point NTP timestamp (32.32), as carried by RTCP SR
    /// and the rapid-sync extension (MSW‖LSW).
    pub fn to_fixed_u64(self) -> u64 {
        let seconds = self.inner.whole_seconds() as u64;
        let subseconds =
            (self.inner.subsec_nanoseconds() as f64 / 1_000_000_000.) * u32::MAX as f64;
        let subseconds = subseconds as u64;

        (seconds << 32) | subseconds
    }

    pub fn from_fixed_u64(fixed: u64) -> Self {
        let seconds = (fixed >> 32) as i64;
        let subseconds = (fixed & u64::from(u32::MAX)) as u32;
        let subseconds = subseconds as f64 / (u32::MAX as f64);

        Self {
            inner: time::Duration::new(seconds, (subseconds * 1_000_000_000.) as i32),
        }
    }

    /// Middle 32 bits of [`to_fixed_u64`](Self::to_fixed_u64), as carried in
    /// the "last SR" field of a receiver report.
    pub fn to_fixed_u32(self) -> u32 {
        ((self.to_fixed_u64() >> 16) & u64::from(u32::MAX)) as u32
    }

    pub fn from_fixed_u32(fixed: u32) -> Self {
        let seconds = (fixed >> 16) as i64;
        let subseconds = (fixed & u32::from(u16::MAX)) as u16;
        let subseconds = subseconds as f64 / (u16::MAX as f64);

        Self {
            inner: time::Duration::new(seconds, (subseconds * 1_000_000_000.) as i32),
        }
    }

    pub fn to_std_duration(self) -> Option<Duration> {
        self.inner.try_into().ok()
    }
}

impl Sub for NtpTimestamp {
    type Output = time::Duration;

    fn sub(self, rhs: Self) -> Self::Output {
        self.inner - rhs.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_u64_round_trip_is_close() {
        let a = NtpTimestamp::now();
        let fixed = a.to_fixed_u64();
        let b = NtpTimestamp::from_fixed_u64(fixed);

        let delta = (a.as_seconds_f64() - b.as_seconds_f64()).abs();
        assert!(delta < 0.000_001, "delta={delta}");
    }

    #[test]
    fn zero_is_zero() {
        assert!(NtpTimestamp::ZERO.is_zero());
        assert_eq!(NtpTimestamp::ZERO.to_fixed_u64(), 0);
    }
}
