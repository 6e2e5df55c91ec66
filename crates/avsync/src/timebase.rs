//! Stream timebases.
//!
//! Every elementary stream stamps its packets with integer ticks in a stream-local
//! rational unit. [`Timebase`] converts those ticks to seconds.

use std::fmt;

/// Rational tick duration: one tick lasts `num / den` seconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Timebase {
    num: i32,
    den: i32,
}

impl Timebase {
    /// One tick per millisecond.
    pub const MILLIS: Timebase = Timebase { num: 1, den: 1_000 };

    /// The 90 kHz clock used by most video containers.
    pub const MPEG: Timebase = Timebase { num: 1, den: 90_000 };

    /// Build a timebase.
    ///
    /// # Panics
    /// Panics when `den <= 0`; a stream without a valid timebase is a programming error
    /// upstream, not a runtime condition.
    pub fn new(num: i32, den: i32) -> Self {
        assert!(den > 0, "timebase denominator must be positive, got {num}/{den}");
        Self { num, den }
    }

    /// Timebase whose tick is one sample at `rate_hz`.
    pub fn from_rate(rate_hz: u32) -> Self {
        let den = i32::try_from(rate_hz.max(1)).unwrap_or(i32::MAX);
        Self::new(1, den)
    }

    pub fn num(&self) -> i32 {
        self.num
    }

    pub fn den(&self) -> i32 {
        self.den
    }

    /// Convert ticks to seconds.
    ///
    /// The product is formed in 128-bit integer space and split into a whole part and a
    /// remainder so that large timestamps neither overflow nor lose monotonicity.
    pub fn to_seconds(&self, ticks: i64) -> f64 {
        let product = ticks as i128 * self.num as i128;
        let den = self.den as i128;
        let whole = product / den;
        let rem = product % den;
        whole as f64 + rem as f64 / den as f64
    }

    /// Convert seconds to the nearest tick.
    pub fn from_seconds(&self, seconds: f64) -> i64 {
        if self.num == 0 || !seconds.is_finite() {
            return 0;
        }
        (seconds * self.den as f64 / self.num as f64).round() as i64
    }
}

impl Default for Timebase {
    fn default() -> Self {
        Self::MILLIS
    }
}

impl fmt::Display for Timebase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_common_timebases() {
        assert_eq!(Timebase::MILLIS.to_seconds(1_500), 1.5);
        assert_eq!(Timebase::MPEG.to_seconds(90_000), 1.0);
        assert_eq!(Timebase::from_rate(48_000).to_seconds(24_000), 0.5);
        assert!((Timebase::new(1001, 30_000).to_seconds(30) - 1.001).abs() < 1e-12);
    }

    #[test]
    fn conversion_is_linear() {
        let tb = Timebase::new(1001, 24_000);
        for (a, b) in [(0i64, 7i64), (13, 999), (-40, 40), (1 << 20, 12_345)] {
            let lhs = tb.to_seconds(a + b);
            let rhs = tb.to_seconds(a) + tb.to_seconds(b);
            assert!((lhs - rhs).abs() < 1e-9, "{a} + {b}: {lhs} vs {rhs}");
        }
    }

    #[test]
    fn conversion_is_monotonic_over_48_hours() {
        let tb = Timebase::MPEG;
        let end = 48 * 3600 * 90_000i64;
        let step = end / 10_000;
        let mut prev = f64::NEG_INFINITY;
        let mut ticks = 0;
        while ticks <= end {
            let secs = tb.to_seconds(ticks);
            assert!(secs >= prev);
            prev = secs;
            ticks += step;
        }
        assert_eq!(tb.to_seconds(end), 48.0 * 3600.0);
    }

    #[test]
    fn huge_timestamps_do_not_overflow() {
        let tb = Timebase::new(i32::MAX, 3);
        let secs = tb.to_seconds(i64::MAX / 2);
        assert!(secs.is_finite());
        assert!(secs > 0.0);
    }

    #[test]
    fn from_seconds_rounds_to_nearest_tick() {
        assert_eq!(Timebase::MPEG.from_seconds(10.0), 900_000);
        assert_eq!(Timebase::MILLIS.from_seconds(0.0004), 0);
        assert_eq!(Timebase::MILLIS.from_seconds(f64::NAN), 0);
    }

    #[test]
    #[should_panic(expected = "denominator")]
    fn zero_denominator_is_rejected() {
        let _ = Timebase::new(1, 0);
    }

    #[test]
    #[should_panic(expected = "denominator")]
    fn negative_denominator_is_rejected() {
        let _ = Timebase::new(1, -25);
    }
}
