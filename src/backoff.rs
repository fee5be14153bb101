use std::time::Duration;

use rand::Rng;

/// Exponential backoff between retry attempts: the nth pause is
/// `min * factor^n` capped at `max`, with optional jitter adding up to one
/// extra pause length. State is explicit so callers decide when a sequence of
/// failures ends (`reset`) and how the pause is slept.
#[derive(Debug, Clone)]
pub struct Backoff {
    pub min: Duration,
    pub max: Duration,
    pub factor: f64,
    pub jitter: bool,
    attempts: u32,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration, factor: f64, jitter: bool) -> Self {
        Self {
            min,
            max,
            factor,
            jitter,
            attempts: 0,
        }
    }

    /// The backoff used for talking to the log: 1s..30s, doubling, jittered.
    pub fn for_log_requests() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30), 2.0, true)
    }

    /// Returns the next pause and advances the attempt counter.
    pub fn duration(&mut self) -> Duration {
        let exp = self.factor.powi(self.attempts as i32);
        let mut base = self.min.mul_f64(exp);
        if base > self.max {
            base = self.max;
        }
        self.attempts = self.attempts.saturating_add(1);
        if self.jitter && !base.is_zero() {
            base + rand::thread_rng().gen_range(Duration::ZERO..base)
        } else {
            base
        }
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain() -> Backoff {
        Backoff::new(Duration::from_secs(1), Duration::from_secs(30), 2.0, false)
    }

    #[test]
    fn doubles_until_capped() {
        let mut bo = plain();
        assert_eq!(bo.duration(), Duration::from_secs(1));
        assert_eq!(bo.duration(), Duration::from_secs(2));
        assert_eq!(bo.duration(), Duration::from_secs(4));
        assert_eq!(bo.duration(), Duration::from_secs(8));
        assert_eq!(bo.duration(), Duration::from_secs(16));
        assert_eq!(bo.duration(), Duration::from_secs(30));
        assert_eq!(bo.duration(), Duration::from_secs(30));
    }

    #[test]
    fn reset_restarts_the_sequence() {
        let mut bo = plain();
        bo.duration();
        bo.duration();
        bo.reset();
        assert_eq!(bo.duration(), Duration::from_secs(1));
    }

    #[test]
    fn jitter_stays_within_one_extra_pause() {
        let mut bo = Backoff::new(Duration::from_secs(1), Duration::from_secs(30), 2.0, true);
        for expected_base in [1u64, 2, 4] {
            let d = bo.duration();
            let base = Duration::from_secs(expected_base);
            assert!(d >= base, "{d:?} below base {base:?}");
            assert!(d < base * 2, "{d:?} exceeds jitter bound for {base:?}");
        }
    }
}
