//! Token-bucket rate limiting keyed by source IP.
//!
//! The backend is pluggable so the in-memory map can be swapped for a shared
//! cache; local state is lock-free per entry (`dashmap`).

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Pluggable rate-limit backend.
pub trait RateLimitBackend: Send + Sync + 'static {
    /// Try to take one token for `key`. `true` = allowed.
    fn try_acquire(&self, key: &str, max: u64, window: Duration) -> bool;
}

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

/// In-memory token-bucket backend; each key gets its own bucket.
#[derive(Default)]
pub struct InMemoryRateLimiter {
    buckets: DashMap<String, TokenBucket>,
}

impl RateLimitBackend for InMemoryRateLimiter {
    fn try_acquire(&self, key: &str, max: u64, window: Duration) -> bool {
        let max_tokens = max as f64;
        let mut entry = self
            .buckets
            .entry(key.to_owned())
            .or_insert_with(|| TokenBucket {
                tokens: max_tokens,
                last_refill: Instant::now(),
            });
        let bucket = entry.value_mut();

        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill);
        let refill = (elapsed.as_secs_f64() / window.as_secs_f64()) * max_tokens;
        bucket.tokens = (bucket.tokens + refill).min(max_tokens);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Clonable handle to whichever backend is configured.
#[derive(Clone)]
pub struct RateLimiter {
    backend: Arc<dyn RateLimitBackend>,
    max: u64,
    window: Duration,
}

impl RateLimiter {
    pub fn new(backend: impl RateLimitBackend, max: u64, window: Duration) -> Self {
        RateLimiter {
            backend: Arc::new(backend),
            max,
            window,
        }
    }

    pub fn in_memory(max: u64, window: Duration) -> Self {
        Self::new(InMemoryRateLimiter::default(), max, window)
    }

    pub fn try_acquire(&self, key: &str) -> bool {
        self.backend.try_acquire(key, self.max, self.window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_is_capped_at_max() {
        let limiter = RateLimiter::in_memory(3, Duration::from_secs(60));
        assert!(limiter.try_acquire("10.0.0.1"));
        assert!(limiter.try_acquire("10.0.0.1"));
        assert!(limiter.try_acquire("10.0.0.1"));
        assert!(!limiter.try_acquire("10.0.0.1"));
    }

    #[test]
    fn keys_have_independent_buckets() {
        let limiter = RateLimiter::in_memory(1, Duration::from_secs(60));
        assert!(limiter.try_acquire("10.0.0.1"));
        assert!(!limiter.try_acquire("10.0.0.1"));
        assert!(limiter.try_acquire("10.0.0.2"));
    }

    #[test]
    fn tokens_refill_over_time() {
        let limiter = RateLimiter::in_memory(10, Duration::from_millis(50));
        for _ in 0..10 {
            assert!(limiter.try_acquire("k"));
        }
        assert!(!limiter.try_acquire("k"));
        std::thread::sleep(Duration::from_millis(60));
        assert!(limiter.try_acquire("k"));
    }
}
