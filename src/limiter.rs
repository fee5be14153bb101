use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Capability to pace an operation. The Logger waits on its limiter before
/// every add-chain call; implementations are injected at construction.
#[async_trait]
pub trait Limiter: Send + Sync {
    /// Returns once the caller may proceed.
    async fn wait(&self);
}

/// A limiter that never delays. For tests and unthrottled runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpLimiter;

#[async_trait]
impl Limiter for NoOpLimiter {
    async fn wait(&self) {}
}

/// Token bucket handing out slots in FIFO order: sustained rate `qps`, with
/// up to `burst` slots accumulated while idle. Waiters are sequenced through
/// a single mutex-held schedule, so a slow waiter cannot be starved by later
/// arrivals.
pub struct TokenBucket {
    interval: Duration,
    burst: u32,
    next: Mutex<Option<Instant>>,
}

impl TokenBucket {
    /// Panics if `qps` is not positive or `burst` is zero.
    pub fn new(qps: f64, burst: u32) -> Self {
        assert!(qps > 0.0, "qps must be positive");
        assert!(burst > 0, "burst must be at least 1");
        Self {
            interval: Duration::from_secs_f64(1.0 / qps),
            burst,
            next: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Limiter for TokenBucket {
    async fn wait(&self) {
        let at = {
            let mut next = self.next.lock().await;
            let now = Instant::now();
            // The schedule may lag `now` by at most the burst window; any
            // older credit has already been spent or expired.
            let burst_window = self.interval * (self.burst - 1);
            let floor = now.checked_sub(burst_window).unwrap_or(now);
            let at = next.map_or(floor, |n| n.max(floor));
            *next = Some(at + self.interval);
            at
        };
        tokio::time::sleep_until(at).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_is_immediate() {
        NoOpLimiter.wait().await;
    }

    #[tokio::test(start_paused = true)]
    async fn paces_to_configured_rate() {
        let limiter = TokenBucket::new(10.0, 1);
        let start = Instant::now();
        for _ in 0..4 {
            limiter.wait().await;
        }
        // First slot is free, the remaining three cost 100ms each.
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn burst_allows_immediate_slots() {
        let limiter = TokenBucket::new(10.0, 3);
        let start = Instant::now();
        for _ in 0..3 {
            limiter.wait().await;
        }
        assert!(start.elapsed() < Duration::from_millis(100));

        limiter.wait().await;
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_time_refills_burst() {
        let limiter = TokenBucket::new(10.0, 2);
        limiter.wait().await;
        limiter.wait().await;

        tokio::time::sleep(Duration::from_secs(5)).await;

        let start = Instant::now();
        limiter.wait().await;
        limiter.wait().await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }
}
