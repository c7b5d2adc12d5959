use std::time::Duration;

use serde::Deserialize;

/// Capped exponential backoff.
///
/// The n-th delay (zero based) is `initial_interval * multiplier^n`, capped at
/// `max_interval`. Used by the relay between failed forwarding cycles and by the
/// retry middleware between handler attempts.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct Backoff {
    #[serde(rename = "initial_interval_ms", with = "crate::config::millis")]
    pub initial_interval: Duration,
    pub multiplier: f64,
    #[serde(rename = "max_interval_ms", with = "crate::config::millis")]
    pub max_interval: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(100),
            multiplier: 2.0,
            max_interval: Duration::from_secs(10),
        }
    }
}

impl Backoff {
    pub fn new(initial_interval: Duration, multiplier: f64, max_interval: Duration) -> Self {
        Self {
            initial_interval,
            multiplier,
            max_interval,
        }
    }

    /// Delay to wait after the given number of consecutive failures (zero based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(i32::MAX as u32) as i32);
        let nanos = (self.initial_interval.as_nanos() as f64 * factor).round();
        if !nanos.is_finite() || nanos >= self.max_interval.as_nanos() as f64 {
            return self.max_interval;
        }
        Duration::from_nanos(nanos as u64)
    }

    /// Stateful iterator over successive delays.
    pub fn iter(&self) -> BackoffIter {
        BackoffIter {
            backoff: *self,
            attempt: 0,
        }
    }
}

/// Successive delays of a [`Backoff`]; never ends, stays at the cap.
#[derive(Debug, Clone)]
pub struct BackoffIter {
    backoff: Backoff,
    attempt: u32,
}

impl BackoffIter {
    /// Forget accumulated failures.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Iterator for BackoffIter {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let delay = self.backoff.delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        Some(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_until_the_cap() {
        let backoff = Backoff::new(Duration::from_millis(100), 2.0, Duration::from_secs(1));
        let delays: Vec<_> = backoff.iter().take(6).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
                Duration::from_secs(1),
                Duration::from_secs(1),
            ]
        );
    }

    #[test]
    fn reset_starts_over() {
        let mut delays = Backoff::default().iter();
        delays.next();
        delays.next();
        delays.reset();
        assert_eq!(delays.next(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn huge_attempt_counts_stay_capped() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay(u32::MAX), backoff.max_interval);
    }
}
