//! Exponential backoff with jitter for part retries

use std::time::Duration;

use rand::Rng;

/// Retry delay schedule: `min(base * factor^attempt, max)`, scaled by `1 ± jitter`
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    factor: f64,
    jitter: f64,
    attempt: u32,
}

impl Backoff {
    #[must_use]
    pub const fn new(base: Duration, max: Duration, factor: f64, jitter: f64) -> Self {
        Self {
            base,
            max,
            factor,
            jitter,
            attempt: 0,
        }
    }

    /// Delay before the next retry; advances the attempt counter
    #[must_use]
    pub fn next_delay(&mut self) -> Duration {
        let exponent = i32::try_from(self.attempt).unwrap_or(i32::MAX);
        let delay = self.base.mul_f64(self.factor.powi(exponent).min(1e9)).min(self.max);
        self.attempt = self.attempt.saturating_add(1);

        if self.jitter <= 0.0 {
            return delay;
        }
        let factor = rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        delay.mul_f64(factor)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Default for Backoff {
    /// 200ms doubling to 30s, ±10%
    fn default() -> Self {
        Self::new(Duration::from_millis(200), Duration::from_secs(30), 2.0, 0.1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_until_capped() {
        let mut backoff = Backoff::new(
            Duration::from_millis(100),
            Duration::from_millis(500),
            2.0,
            0.0,
        );

        let delays: Vec<_> = (0..5).map(|_| backoff.next_delay()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(500),
                Duration::from_millis(500),
            ]
        );
    }

    #[test]
    fn jitter_stays_in_band() {
        for _ in 0..50 {
            let mut backoff =
                Backoff::new(Duration::from_millis(1000), Duration::from_secs(30), 2.0, 0.2);
            let d = backoff.next_delay();
            assert!(d >= Duration::from_millis(800));
            assert!(d <= Duration::from_millis(1200));
        }
    }

    #[test]
    fn reset_restarts_schedule() {
        let mut backoff = Backoff::new(Duration::from_millis(10), Duration::from_secs(1), 3.0, 0.0);
        let _ = backoff.next_delay();
        let _ = backoff.next_delay();
        assert_eq!(backoff.attempt(), 2);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
    }

    #[test]
    fn huge_attempt_counts_do_not_overflow() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60), 2.0, 0.0);
        for _ in 0..200 {
            let _ = backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), Duration::from_secs(60));
    }
}
