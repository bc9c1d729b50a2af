use std::fmt;
use std::str::FromStr;

use crate::error::SourceError;

pub const NSEC_PER_SEC: u64 = 1_000_000_000;

/// Timestamp of a recorded message: whole seconds plus nanoseconds.
///
/// `nsec` is always in `[0, 1e9)` for values built through the constructors.
/// Ordering is chronological (seconds first, then nanoseconds).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize,
    serde::Deserialize,
)]
pub struct Time {
    pub sec: u32,
    pub nsec: u32,
}

impl Time {
    pub const ZERO: Time = Time { sec: 0, nsec: 0 };
    pub const MAX: Time = Time { sec: u32::MAX, nsec: 999_999_999 };

    /// Build a time, carrying nanosecond overflow into seconds.
    pub fn new(sec: u32, nsec: u32) -> Self {
        Self::from_nanos(sec as u64 * NSEC_PER_SEC + nsec as u64)
    }

    /// Saturates at [`Time::MAX`].
    pub fn from_nanos(nanos: u64) -> Self {
        let sec = nanos / NSEC_PER_SEC;
        if sec > u32::MAX as u64 {
            return Self::MAX;
        }
        Self {
            sec: sec as u32,
            nsec: (nanos % NSEC_PER_SEC) as u32,
        }
    }

    pub fn from_millis(millis: u64) -> Self {
        Self::from_nanos(millis.saturating_mul(1_000_000))
    }

    pub fn as_nanos(self) -> u64 {
        self.sec as u64 * NSEC_PER_SEC + self.nsec as u64
    }

    pub fn add_nanos(self, nanos: u64) -> Self {
        Self::from_nanos(self.as_nanos().saturating_add(nanos))
    }

    pub fn sub_nanos(self, nanos: u64) -> Self {
        Self::from_nanos(self.as_nanos().saturating_sub(nanos))
    }

    /// Nanoseconds elapsed since `earlier`; zero if `earlier` is later.
    pub fn nanos_since(self, earlier: Time) -> u64 {
        self.as_nanos().saturating_sub(earlier.as_nanos())
    }

    /// Position of `self` within `[start, end]` as a fraction in `[0, 1]`.
    pub fn fraction_of(self, start: Time, end: Time) -> f64 {
        let span = end.nanos_since(start);
        if span == 0 {
            return if self >= end { 1.0 } else { 0.0 };
        }
        let offset = self.clamp(start, end).nanos_since(start);
        offset as f64 / span as f64
    }

    /// Inverse of [`Time::fraction_of`].
    pub fn at_fraction(start: Time, end: Time, fraction: f64) -> Time {
        let span = end.nanos_since(start) as f64;
        start.add_nanos((span * fraction.clamp(0.0, 1.0)).round() as u64)
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.sec, self.nsec)
    }
}

impl FromStr for Time {
    type Err = SourceError;

    /// Parses `"sec"` or `"sec.fraction"` (up to nine fractional digits).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || SourceError::config(format!("invalid time '{s}', expected sec[.nsec]"));
        let (sec_str, frac_str) = match s.split_once('.') {
            Some((sec, frac)) => (sec, frac),
            None => (s, ""),
        };
        let sec: u32 = sec_str.parse().map_err(|_| bad())?;
        if frac_str.len() > 9 || !frac_str.chars().all(|c| c.is_ascii_digit()) {
            return Err(bad());
        }
        let nsec = if frac_str.is_empty() {
            0
        } else {
            let padded = format!("{frac_str:0<9}");
            padded.parse::<u32>().map_err(|_| bad())?
        };
        Ok(Time { sec, nsec })
    }
}
