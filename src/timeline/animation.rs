//! Marker motion: eased position transition with a blur fade

use std::time::{Duration, Instant};

/// Remote marker transition length
pub const MARKER_TRANSITION_MS: u64 = 200;
/// Blur at the start of a transition, in pixels
pub const BLUR_START_PX: f32 = 5.0;

/// Quadratic ease-in-out function
pub fn ease_in_out(t: f32) -> f32 {
    if t < 0.5 {
        2.0 * t * t
    } else {
        1.0 - (-2.0 * t + 2.0).powi(2) / 2.0
    }
}

/// One in-flight (or finished) transition between two positions
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarkerMotion {
    from: f64,
    to: f64,
    started: Instant,
    duration: Duration,
}

impl MarkerMotion {
    /// A marker appearing at `position`: no travel, blur fades out.
    pub fn appear(position: f64, now: Instant, duration: Duration) -> Self {
        Self {
            from: position,
            to: position,
            started: now,
            duration,
        }
    }

    pub fn target(&self) -> f64 {
        self.to
    }

    /// Start moving to `to`. A transition still in flight is finished first,
    /// so the new one starts from the previous target.
    pub fn retarget(&mut self, to: f64, now: Instant) {
        self.from = self.to;
        self.to = to;
        self.started = now;
    }

    fn progress(&self, now: Instant) -> f32 {
        if self.duration.is_zero() {
            return 1.0;
        }
        let elapsed = now.saturating_duration_since(self.started);
        (elapsed.as_secs_f32() / self.duration.as_secs_f32()).min(1.0)
    }

    /// Returns (position, blur_px) at `now`.
    pub fn sample(&self, now: Instant) -> (f64, f32) {
        let eased = ease_in_out(self.progress(now));
        let position = self.from + (self.to - self.from) * f64::from(eased);
        (position, BLUR_START_PX * (1.0 - eased))
    }

    pub fn is_settled(&self, now: Instant) -> bool {
        self.progress(now) >= 1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const D: Duration = Duration::from_millis(MARKER_TRANSITION_MS);

    #[test]
    fn test_ease_in_out() {
        assert_eq!(ease_in_out(0.0), 0.0);
        assert_eq!(ease_in_out(1.0), 1.0);
        assert!((ease_in_out(0.5) - 0.5).abs() < 0.01);
        assert!(ease_in_out(0.25) < 0.25);
        assert!(ease_in_out(0.75) > 0.75);
    }

    #[test]
    fn transition_eases_and_unblurs() {
        let t0 = Instant::now();
        let mut motion = MarkerMotion::appear(10.0, t0, D);
        motion.retarget(50.0, t0);

        assert_eq!(motion.sample(t0), (10.0, BLUR_START_PX));

        let (mid, blur) = motion.sample(t0 + D / 2);
        assert!((mid - 30.0).abs() < 0.01);
        assert!((blur - BLUR_START_PX / 2.0).abs() < 0.01);

        assert_eq!(motion.sample(t0 + D), (50.0, 0.0));
        assert_eq!(motion.sample(t0 + D * 10), (50.0, 0.0));
        assert!(motion.is_settled(t0 + D));
    }

    #[test]
    fn retarget_mid_flight_starts_from_previous_target() {
        let t0 = Instant::now();
        let mut motion = MarkerMotion::appear(0.0, t0, D);
        motion.retarget(40.0, t0);
        motion.retarget(80.0, t0 + D / 4);

        let (start, _) = motion.sample(t0 + D / 4);
        assert_eq!(start, 40.0);
        assert_eq!(motion.target(), 80.0);
    }

    #[test]
    fn zero_duration_is_settled_without_blur() {
        let t0 = Instant::now();
        let motion = MarkerMotion::appear(33.0, t0, Duration::ZERO);
        assert_eq!(motion.sample(t0), (33.0, 0.0));
        assert!(motion.is_settled(t0));
    }
}
