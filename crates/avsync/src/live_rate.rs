//! Adaptive playback rate for live sources.
//!
//! Instead of seeking to the live edge, playback speeds up slightly while too much is
//! buffered and slows down while too little is, returning to 1.0 once the buffered-ahead
//! time is back at the target.

use crate::config::LiveRateConfig;

#[derive(Clone, Debug)]
pub struct LiveRatePolicy {
    config: LiveRateConfig,
    rate: f64,
}

impl LiveRatePolicy {
    pub fn new(config: LiveRateConfig) -> Self {
        Self { config, rate: 1.0 }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn reset(&mut self) {
        self.rate = 1.0;
    }

    /// Feed the buffered-ahead time; returns the new rate when it changes.
    pub fn update(&mut self, buffered: f64) -> Option<f64> {
        if !self.config.enabled || !buffered.is_finite() {
            return None;
        }
        let target = self.config.target_buffer;
        let delta = self.config.max_rate_delta;
        let next = if self.rate > 1.0 {
            if buffered <= target { 1.0 } else { self.rate }
        } else if self.rate < 1.0 {
            if buffered >= target { 1.0 } else { self.rate }
        } else if buffered > target * self.config.high_water {
            1.0 + delta
        } else if buffered < target * self.config.low_water {
            1.0 - delta
        } else {
            1.0
        };

        if (next - self.rate).abs() < f64::EPSILON {
            return None;
        }
        tracing::debug!(buffered, from = self.rate, to = next, "live rate adjusted");
        self.rate = next;
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> LiveRatePolicy {
        LiveRatePolicy::new(LiveRateConfig::default())
    }

    #[test]
    fn holds_inside_the_band() {
        let mut p = policy();
        assert_eq!(p.update(3.0), None);
        assert_eq!(p.update(4.4), None);
        assert_eq!(p.update(1.6), None);
        assert_eq!(p.rate(), 1.0);
    }

    #[test]
    fn speeds_up_until_back_at_target() {
        let mut p = policy();
        assert!(p.update(5.0).is_some_and(|r| (r - 1.03).abs() < 1e-9));
        assert_eq!(p.update(4.0), None);
        assert_eq!(p.update(3.0), Some(1.0));
    }

    #[test]
    fn slows_down_until_recovered() {
        let mut p = policy();
        assert!(p.update(1.0).is_some_and(|r| (r - 0.97).abs() < 1e-9));
        assert_eq!(p.update(2.5), None);
        assert_eq!(p.update(3.2), Some(1.0));
    }

    #[test]
    fn rate_stays_within_bounds() {
        let mut p = policy();
        for buffered in [0.0, 100.0, 0.1, 50.0, f64::NAN, 3.0, 9.0] {
            p.update(buffered);
            assert!((p.rate() - 1.0).abs() <= 0.03 + 1e-12);
        }
    }

    #[test]
    fn disabled_policy_never_adjusts() {
        let mut p = LiveRatePolicy::new(LiveRateConfig {
            enabled: false,
            ..LiveRateConfig::default()
        });
        assert_eq!(p.update(100.0), None);
        assert_eq!(p.rate(), 1.0);
    }
}
