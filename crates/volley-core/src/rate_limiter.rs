//! Sliding-window send rate limiter

use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::time::{sleep_until, Duration, Instant};

/// Limits transport sends to at most `limit` per rolling second.
///
/// Timestamps of recent sends are kept in a window; `acquire` waits
/// until the oldest entry falls out of the window before admitting a
/// new send. Built on tokio's clock so tests can drive it with a
/// paused runtime.
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    entries: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(per_second: usize) -> Self {
        Self {
            limit: per_second.max(1),
            window: Duration::from_secs(1),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    /// Wait until a send slot is available, then take it
    pub async fn acquire(&self) {
        loop {
            let wait_until = {
                let mut entries = self.entries.lock().unwrap();
                let now = Instant::now();

                while let Some(&front) = entries.front() {
                    if now.duration_since(front) >= self.window {
                        entries.pop_front();
                    } else {
                        break;
                    }
                }

                if entries.len() < self.limit {
                    entries.push_back(now);
                    return;
                }

                *entries.front().unwrap() + self.window
            };

            sleep_until(wait_until).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_burst_within_limit_is_not_delayed() {
        let limiter = RateLimiter::new(10);
        let start = Instant::now();
        for _ in 0..10 {
            limiter.acquire().await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hundred_sends_at_ten_per_second_take_at_least_nine_seconds() {
        let limiter = RateLimiter::new(10);
        let start = Instant::now();
        for _ in 0..100 {
            limiter.acquire().await;
        }
        // 10 slots per window: the 100th send cannot start before the
        // 90th slot has aged out, 9 full windows in
        assert!(start.elapsed() >= Duration::from_secs(9));
        assert!(start.elapsed() < Duration::from_secs(11));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_refills_after_idle() {
        let limiter = RateLimiter::new(2);
        limiter.acquire().await;
        limiter.acquire().await;

        tokio::time::advance(Duration::from_secs(2)).await;

        let start = Instant::now();
        limiter.acquire().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
