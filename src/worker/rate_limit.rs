//! Shared limiter for outbound embedding calls.
//!
//! A token bucket of capacity one: callers are admitted at most
//! `calls_per_second` times per second, one at a time, in arrival order.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

pub struct RateLimiter {
    interval: Duration,
    next_slot: Mutex<Instant>,
}

impl RateLimiter {
    /// `calls_per_second` is clamped to at least one.
    pub fn per_second(calls_per_second: u32) -> Self {
        let calls = calls_per_second.max(1);
        Self {
            interval: Duration::from_secs(1) / calls,
            next_slot: Mutex::new(Instant::now()),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait until the next slot opens.
    pub async fn acquire(&self) {
        // Holding the lock while sleeping keeps admission strictly ordered.
        let mut next = self.next_slot.lock().await;
        let now = Instant::now();
        if *next > now {
            tokio::time::sleep_until(*next).await;
        }
        *next = Instant::now().max(*next) + self.interval;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_acquire_spaces_calls() {
        let limiter = RateLimiter::per_second(4);
        assert_eq!(limiter.interval(), Duration::from_millis(250));

        let start = Instant::now();
        for _ in 0..5 {
            limiter.acquire().await;
        }
        // First call is immediate, the next four wait one interval each.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(1000), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(1010), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_the_budget() {
        let limiter = Arc::new(RateLimiter::per_second(10));
        let start = Instant::now();
        let tasks: Vec<_> = (0..3)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.acquire().await })
            })
            .collect();
        for t in tasks {
            t.await.unwrap();
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(200), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(210), "{elapsed:?}");
    }

    #[test]
    fn test_zero_rate_is_clamped() {
        assert_eq!(RateLimiter::per_second(0).interval(), Duration::from_secs(1));
    }
}
