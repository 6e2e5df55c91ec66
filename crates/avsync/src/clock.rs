//! Playback clock.
//!
//! The clock is anchored to a media time at a wall-clock instant and extrapolates at the
//! playback rate. Whoever owns the master stream re-anchors it whenever it learns the
//! actual presented time.

use std::time::Instant;

#[derive(Clone, Debug)]
pub struct MediaClock {
    anchor_time: f64,
    anchor: Instant,
    rate: f64,
    paused: bool,
}

impl Default for MediaClock {
    fn default() -> Self {
        Self::new(0.0)
    }
}

impl MediaClock {
    /// A paused clock at `time`.
    pub fn new(time: f64) -> Self {
        Self {
            anchor_time: time,
            anchor: Instant::now(),
            rate: 1.0,
            paused: true,
        }
    }

    pub fn time(&self) -> f64 {
        self.time_at(Instant::now())
    }

    pub fn time_at(&self, at: Instant) -> f64 {
        if self.paused {
            return self.anchor_time;
        }
        let elapsed = at.saturating_duration_since(self.anchor).as_secs_f64();
        self.anchor_time + elapsed * self.rate
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Re-anchor to `time` as of now.
    pub fn set(&mut self, time: f64) {
        self.set_at(time, Instant::now());
    }

    pub fn set_at(&mut self, time: f64, at: Instant) {
        self.anchor_time = time;
        self.anchor = at;
    }

    /// Change the rate without a jump in the reported time.
    pub fn set_rate(&mut self, rate: f64) {
        let now = Instant::now();
        self.set_at(self.time_at(now), now);
        self.rate = rate;
    }

    pub fn pause(&mut self) {
        if !self.paused {
            let now = Instant::now();
            self.set_at(self.time_at(now), now);
            self.paused = true;
        }
    }

    pub fn resume(&mut self) {
        if self.paused {
            self.anchor = Instant::now();
            self.paused = false;
        }
    }
}
