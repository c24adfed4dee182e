//! Rate gate for periodic work.
//!
//! A `FrequencyController` belongs to exactly one loop; it is not shared and
//! needs no synchronisation.

use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct FrequencyController {
    target_hz: f64,
    interval: Duration,
    last_fire: Option<Instant>,
}

impl FrequencyController {
    /// `hz <= 0` (or NaN) disables throttling.
    pub fn new(hz: f64) -> Self {
        Self {
            target_hz: hz,
            interval: interval_for(hz),
            last_fire: None,
        }
    }

    /// Returns true when at least one interval has elapsed since the last
    /// fire, and records `now` as the new fire time. Returns false without
    /// side effects otherwise.
    pub fn should_fire(&mut self, now: Instant) -> bool {
        if self.interval.is_zero() {
            self.last_fire = Some(now);
            return true;
        }

        let due = match self.last_fire {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.interval,
        };
        if due {
            self.last_fire = Some(now);
        }
        due
    }

    /// Forces the next `should_fire` to return true.
    pub fn reset(&mut self) {
        self.last_fire = None;
    }

    /// Changes the target rate and resets the gate.
    pub fn set_frequency(&mut self, hz: f64) {
        self.target_hz = hz;
        self.interval = interval_for(hz);
        self.reset();
    }

    pub fn frequency(&self) -> f64 {
        self.target_hz
    }

    /// Zero when unthrottled.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Time left until the gate opens, measured from `now`.
    pub fn remaining(&self, now: Instant) -> Duration {
        match self.last_fire {
            Some(last) => self
                .interval
                .saturating_sub(now.saturating_duration_since(last)),
            None => Duration::ZERO,
        }
    }
}

fn interval_for(hz: f64) -> Duration {
    if hz > 0.0 && hz.is_finite() {
        Duration::try_from_secs_f64(1.0 / hz).unwrap_or(Duration::ZERO)
    } else {
        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_hz_gate() {
        let mut ctrl = FrequencyController::new(2.0);
        let start = Instant::now();

        assert!(ctrl.should_fire(start));
        assert!(!ctrl.should_fire(start + Duration::from_millis(400)));
        assert!(ctrl.should_fire(start + Duration::from_millis(500)));
        assert!(!ctrl.should_fire(start + Duration::from_millis(900)));
    }

    #[test]
    fn test_false_has_no_side_effects() {
        let mut ctrl = FrequencyController::new(2.0);
        let start = Instant::now();

        assert!(ctrl.should_fire(start));
        for ms in [100, 200, 300, 499] {
            assert!(!ctrl.should_fire(start + Duration::from_millis(ms)));
        }
        // Still measured from the first fire, not from the rejected calls.
        assert!(ctrl.should_fire(start + Duration::from_millis(500)));
    }

    #[test]
    fn test_unthrottled_always_fires() {
        for hz in [0.0, -5.0, f64::NAN] {
            let mut ctrl = FrequencyController::new(hz);
            let now = Instant::now();
            assert!(ctrl.should_fire(now));
            assert!(ctrl.should_fire(now));
            assert_eq!(ctrl.interval(), Duration::ZERO);
        }
    }

    #[test]
    fn test_reset_forces_fire() {
        let mut ctrl = FrequencyController::new(1.0);
        let now = Instant::now();
        assert!(ctrl.should_fire(now));
        assert!(!ctrl.should_fire(now));

        ctrl.reset();
        assert!(ctrl.should_fire(now));
    }

    #[test]
    fn test_set_frequency_recomputes_and_resets() {
        let mut ctrl = FrequencyController::new(1.0);
        let now = Instant::now();
        assert!(ctrl.should_fire(now));

        ctrl.set_frequency(10.0);
        assert_eq!(ctrl.interval(), Duration::from_millis(100));
        assert!(ctrl.should_fire(now));
        assert!(ctrl.should_fire(now + Duration::from_millis(100)));
    }

    #[test]
    fn test_remaining() {
        let mut ctrl = FrequencyController::new(4.0);
        let now = Instant::now();
        assert_eq!(ctrl.remaining(now), Duration::ZERO);
        ctrl.should_fire(now);
        assert_eq!(
            ctrl.remaining(now + Duration::from_millis(100)),
            Duration::from_millis(150)
        );
    }
}
