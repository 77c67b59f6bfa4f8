//! Process-wide gate in front of the remote service.
//!
//! Each granted token comes back exactly one window after it was handed out,
//! so no rolling window ever sees more than `capacity` grants. Waiters queue
//! on a fair mutex, which keeps waiting bounded.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::config::RateLimitConfig;
use crate::error::GenerationError;

/// Token bucket shared by reference between every worker of every batch using it.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: usize,
    window: Duration,
    grants: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// Creates a limiter; the config is expected to be validated.
    pub fn new(config: &RateLimitConfig) -> Self {
        let capacity = config.capacity.max(1) as usize;
        Self {
            capacity,
            window: config.window,
            grants: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Blocks until a token is available or `timeout` elapses.
    pub async fn acquire(&self, timeout: Duration) -> Result<(), GenerationError> {
        tokio::time::timeout(timeout, self.wait_for_token())
            .await
            .map_err(|_| GenerationError::RateLimitTimeout(timeout))
    }

    /// Tokens that could be granted right now without waiting.
    pub async fn available(&self) -> usize {
        let mut grants = self.grants.lock().await;
        self.expire(&mut grants, Instant::now());
        self.capacity - grants.len()
    }

    async fn wait_for_token(&self) {
        // Held across the sleep: the next token belongs to whoever is first in line.
        let mut grants = self.grants.lock().await;
        loop {
            let now = Instant::now();
            self.expire(&mut grants, now);
            if grants.len() < self.capacity {
                grants.push_back(now);
                return;
            }
            if let Some(oldest) = grants.front().copied() {
                let ready_at = oldest + self.window;
                debug!(
                    "Rate limit reached, waiting {:?} for next token",
                    ready_at.saturating_duration_since(now)
                );
                tokio::time::sleep_until(ready_at).await;
            }
        }
    }

    fn expire(&self, grants: &mut VecDeque<Instant>, now: Instant) {
        while let Some(oldest) = grants.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                grants.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn limiter(capacity: u32, window: Duration) -> Arc<RateLimiter> {
        Arc::new(RateLimiter::new(&RateLimitConfig { capacity, window }))
    }

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_capacity_in_a_rolling_window() {
        let window = Duration::from_secs(1);
        let limiter = limiter(3, window);

        let mut handles = Vec::new();
        for _ in 0..10 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                limiter
                    .acquire(Duration::from_secs(60))
                    .await
                    .expect("token");
                Instant::now()
            }));
        }

        let mut granted = Vec::new();
        for handle in handles {
            granted.push(handle.await.expect("task"));
        }
        granted.sort();

        assert_eq!(granted.len(), 10);
        for pair in granted.windows(4) {
            assert!(pair[3].duration_since(pair[0]) >= window);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_when_bucket_stays_empty() {
        let limiter = limiter(1, Duration::from_secs(60));
        limiter
            .acquire(Duration::from_millis(10))
            .await
            .expect("first token");

        let result = limiter.acquire(Duration::from_millis(100)).await;
        assert_eq!(
            result,
            Err(GenerationError::RateLimitTimeout(Duration::from_millis(100)))
        );
        assert_eq!(limiter.available().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn tokens_return_after_the_window() {
        let limiter = limiter(2, Duration::from_secs(5));
        limiter.acquire(Duration::from_secs(1)).await.expect("token");
        limiter.acquire(Duration::from_secs(1)).await.expect("token");
        assert_eq!(limiter.available().await, 0);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(limiter.available().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_caller_gets_the_token_once_it_refills() {
        let limiter = limiter(1, Duration::from_secs(2));
        limiter.acquire(Duration::from_secs(1)).await.expect("token");

        let started = Instant::now();
        limiter
            .acquire(Duration::from_secs(3))
            .await
            .expect("refilled token");
        assert!(started.elapsed() >= Duration::from_secs(2));
    }
}
