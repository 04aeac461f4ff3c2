use std::time::Duration;

use rand::Rng;

use crate::config::MAX_BACKOFF;

/// Exponential retry delay with jitter, capped at `max`.
///
/// Each delay doubles the previous one; the value returned is jittered into `[d/2, d]` so many
/// reflectors failing together do not retry in lockstep.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Option<Duration>,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.clamp(Duration::from_millis(1), MAX_BACKOFF);
        Self { initial, max: max.clamp(initial, MAX_BACKOFF), current: None, attempt: 0 }
    }

    pub fn next_delay(&mut self) -> Duration {
        let base = match self.current {
            None => self.initial,
            Some(d) => d.saturating_mul(2).min(self.max),
        };
        self.current = Some(base);
        self.attempt = self.attempt.saturating_add(1);
        base.mul_f64(rand::thread_rng().gen_range(0.5..=1.0))
    }

    /// Failures since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.current = None;
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_and_caps() {
        let mut b = Backoff::new(Duration::from_millis(100), Duration::from_millis(350));
        let d1 = b.next_delay();
        assert!(d1 >= Duration::from_millis(50) && d1 <= Duration::from_millis(100));
        let d2 = b.next_delay();
        assert!(d2 >= Duration::from_millis(100) && d2 <= Duration::from_millis(200));
        for _ in 0..10 {
            assert!(b.next_delay() <= Duration::from_millis(350));
        }
        assert_eq!(b.attempt(), 12);
    }

    #[test]
    fn reset_starts_over() {
        let mut b = Backoff::new(Duration::from_millis(10), Duration::from_secs(1));
        for _ in 0..5 {
            b.next_delay();
        }
        b.reset();
        assert_eq!(b.attempt(), 0);
        assert!(b.next_delay() <= Duration::from_millis(10));
    }

    #[test]
    fn huge_bounds_are_capped() {
        let mut b = Backoff::new(Duration::MAX, Duration::MAX);
        for _ in 0..70 {
            assert!(b.next_delay() <= MAX_BACKOFF);
        }
    }
}
