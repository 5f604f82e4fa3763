//! Exponential backoff for dashboard overload
//!
//! Shared policy for every dashboard-facing poller (config loader and both
//! command clients): consecutive 503/429 responses push the next allowed
//! attempt out exponentially (30 s, 60 s, 120 s, … capped at 600 s). Any
//! success resets the streak. Backoff is driven purely by the failure streak
//! - no timer state survives a restart.

#[derive(Debug, Clone)]
pub struct Backoff {
    base_secs: f64,
    cap_secs: f64,
    consecutive_errors: u32,
    until: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(30.0, 600.0)
    }
}

impl Backoff {
    pub fn new(base_secs: f64, cap_secs: f64) -> Self {
        Self {
            base_secs,
            cap_secs,
            consecutive_errors: 0,
            until: 0.0,
        }
    }

    /// Whether requests are currently held back.
    pub fn is_active(&self, now: f64) -> bool {
        now < self.until
    }

    /// Seconds until the next attempt is allowed (0 when not backing off).
    pub fn remaining_secs(&self, now: f64) -> f64 {
        (self.until - now).max(0.0)
    }

    /// Record an overload response (503/429) and return the wait applied.
    pub fn record_overload(&mut self, now: f64) -> f64 {
        self.consecutive_errors += 1;
        let exponent = self.consecutive_errors.saturating_sub(1).min(30);
        let wait = (self.base_secs * f64::from(1u32 << exponent)).min(self.cap_secs);
        self.until = now + wait;
        wait
    }

    /// Record a successful request; clears the streak.
    pub fn record_success(&mut self) {
        self.consecutive_errors = 0;
        self.until = 0.0;
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut b = Backoff::default();
        assert_eq!(b.record_overload(0.0), 30.0);
        assert_eq!(b.record_overload(0.0), 60.0);
        assert_eq!(b.record_overload(0.0), 120.0);
        assert_eq!(b.record_overload(0.0), 240.0);
        assert_eq!(b.record_overload(0.0), 480.0);
        // Capped from here on
        assert_eq!(b.record_overload(0.0), 600.0);
        assert_eq!(b.record_overload(0.0), 600.0);
        assert_eq!(b.consecutive_errors(), 7);
    }

    #[test]
    fn test_active_window_and_reset() {
        let mut b = Backoff::default();
        b.record_overload(100.0);
        assert!(b.is_active(100.0));
        assert!(b.is_active(129.0));
        assert!(!b.is_active(130.0));
        assert_eq!(b.remaining_secs(110.0), 20.0);

        b.record_success();
        assert_eq!(b.consecutive_errors(), 0);
        assert!(!b.is_active(100.0));
    }

    #[test]
    fn test_large_streak_does_not_overflow() {
        let mut b = Backoff::default();
        for _ in 0..100 {
            b.record_overload(0.0);
        }
        assert_eq!(b.record_overload(0.0), 600.0);
    }
}
