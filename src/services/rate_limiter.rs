//! Fixed-window rate limiting per (identity, endpoint).
//!
//! Each key owns a `{count, window_start}` pair. A call at or after
//! `window_start + window` starts a fresh window with the count at zero; a call that finds
//! the count at quota is rejected without incrementing. Bursts at window boundaries are
//! admitted.
//!
//! Counters live behind [`RateLimitStore`]. The in-process implementation keys a
//! `DashMap`, so an increment-and-compare only locks the shard holding that key. The
//! limiter fails open: when the store errors the request is allowed and the error logged.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::store::StoreError;

/// Quota of `requests` per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub requests: u32,
    pub window: Duration,
}

impl RateLimit {
    pub const fn new(requests: u32, window: Duration) -> Self {
        Self { requests, window }
    }

    pub const fn per_minute(requests: u32) -> Self {
        Self::new(requests, Duration::from_secs(60))
    }

    pub const fn per_hour(requests: u32) -> Self {
        Self::new(requests, Duration::from_secs(60 * 60))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed { limit: u32, remaining: u32 },
    Limited { limit: u32, retry_after_secs: u64 },
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allowed { .. })
    }
}

/// Backing store for window counters.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Reset the key's window if it has elapsed, then count this call against it unless
    /// it is already at quota. Must be atomic per key.
    async fn hit(
        &self,
        key: &str,
        limit: RateLimit,
        now: Instant,
    ) -> Result<RateLimitDecision, StoreError>;

    /// Drop windows that have elapsed. Returns how many were removed.
    async fn purge_expired(&self, now: Instant) -> usize;
}

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    started_at: Instant,
    length: Duration,
}

impl Window {
    fn fresh(now: Instant, length: Duration) -> Self {
        Self {
            count: 0,
            started_at: now,
            length,
        }
    }

    fn has_elapsed(&self, now: Instant) -> bool {
        now >= self.started_at + self.length
    }
}

/// Process-local window counters.
#[derive(Debug, Default)]
pub struct MemoryRateLimitStore {
    windows: DashMap<String, Window>,
}

impl MemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

#[async_trait]
impl RateLimitStore for MemoryRateLimitStore {
    async fn hit(
        &self,
        key: &str,
        limit: RateLimit,
        now: Instant,
    ) -> Result<RateLimitDecision, StoreError> {
        let mut window = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| Window::fresh(now, limit.window));

        if window.has_elapsed(now) {
            *window = Window::fresh(now, limit.window);
        }
        // A changed policy takes effect from the current window on
        window.length = limit.window;

        if window.count >= limit.requests {
            let reset_at = window.started_at + window.length;
            let remaining = reset_at.saturating_duration_since(now);
            return Ok(RateLimitDecision::Limited {
                limit: limit.requests,
                retry_after_secs: ceil_secs(remaining),
            });
        }

        window.count += 1;
        Ok(RateLimitDecision::Allowed {
            limit: limit.requests,
            remaining: limit.requests - window.count,
        })
    }

    async fn purge_expired(&self, now: Instant) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, window| !window.has_elapsed(now));
        before.saturating_sub(self.windows.len())
    }
}

fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

/// Rate limiter used by the gateway.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>) -> Self {
        Self { store }
    }

    pub async fn check(&self, identity: &str, endpoint: &str, limit: RateLimit) -> RateLimitDecision {
        self.check_at(identity, endpoint, limit, Instant::now()).await
    }

    pub async fn check_at(
        &self,
        identity: &str,
        endpoint: &str,
        limit: RateLimit,
        now: Instant,
    ) -> RateLimitDecision {
        let key = format!("{identity}:{endpoint}");

        match self.store.hit(&key, limit, now).await {
            Ok(decision) => decision,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    identity,
                    endpoint,
                    "Rate limit store failed, allowing request"
                );
                RateLimitDecision::Allowed {
                    limit: limit.requests,
                    remaining: limit.requests,
                }
            }
        }
    }

    pub async fn purge_expired(&self) -> usize {
        self.store.purge_expired(Instant::now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> (Arc<MemoryRateLimitStore>, RateLimiter) {
        let store = Arc::new(MemoryRateLimitStore::new());
        (store.clone(), RateLimiter::new(store))
    }

    #[tokio::test]
    async fn third_call_in_window_is_limited() {
        let (_, limiter) = limiter();
        let limit = RateLimit::new(2, Duration::from_millis(1000));
        let start = Instant::now();

        let first = limiter.check_at("u1", "/api/datasets", limit, start).await;
        let second = limiter
            .check_at("u1", "/api/datasets", limit, start + Duration::from_millis(10))
            .await;
        let third = limiter
            .check_at("u1", "/api/datasets", limit, start + Duration::from_millis(20))
            .await;

        assert_eq!(first, RateLimitDecision::Allowed { limit: 2, remaining: 1 });
        assert_eq!(second, RateLimitDecision::Allowed { limit: 2, remaining: 0 });
        assert_eq!(
            third,
            RateLimitDecision::Limited {
                limit: 2,
                retry_after_secs: 1
            }
        );
    }

    #[tokio::test]
    async fn window_reset_starts_a_fresh_count() {
        let (_, limiter) = limiter();
        let limit = RateLimit::new(2, Duration::from_secs(1));
        let start = Instant::now();

        for offset in [0, 100, 200, 300] {
            limiter
                .check_at("u1", "/e", limit, start + Duration::from_millis(offset))
                .await;
        }

        // Exactly at the boundary the window has elapsed
        let after = limiter
            .check_at("u1", "/e", limit, start + Duration::from_secs(1))
            .await;
        assert_eq!(after, RateLimitDecision::Allowed { limit: 2, remaining: 1 });
    }

    #[tokio::test]
    async fn rejected_calls_do_not_extend_the_count() {
        let (_, limiter) = limiter();
        let limit = RateLimit::new(1, Duration::from_secs(10));
        let start = Instant::now();

        limiter.check_at("u1", "/e", limit, start).await;
        for _ in 0..5 {
            assert!(!limiter.check_at("u1", "/e", limit, start).await.is_allowed());
        }

        let retry = limiter
            .check_at("u1", "/e", limit, start + Duration::from_millis(7500))
            .await;
        assert_eq!(
            retry,
            RateLimitDecision::Limited {
                limit: 1,
                retry_after_secs: 3
            }
        );
    }

    #[tokio::test]
    async fn endpoints_and_identities_are_isolated() {
        let (_, limiter) = limiter();
        let limit = RateLimit::new(1, Duration::from_secs(60));
        let now = Instant::now();

        assert!(limiter.check_at("u1", "/a", limit, now).await.is_allowed());
        assert!(!limiter.check_at("u1", "/a", limit, now).await.is_allowed());
        assert!(limiter.check_at("u1", "/b", limit, now).await.is_allowed());
        assert!(limiter.check_at("u2", "/a", limit, now).await.is_allowed());
    }

    #[tokio::test]
    async fn purge_drops_only_elapsed_windows() {
        let (store, limiter) = limiter();
        let now = Instant::now();

        limiter
            .check_at("u1", "/short", RateLimit::new(5, Duration::from_millis(10)), now)
            .await;
        limiter
            .check_at("u1", "/long", RateLimit::per_hour(5), now)
            .await;

        let removed = store.purge_expired(now + Duration::from_secs(1)).await;
        assert_eq!(removed, 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_hits_never_exceed_quota() {
        let (_, limiter) = limiter();
        let limit = RateLimit::per_minute(10);

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.check("u1", "/e", limit).await })
            })
            .collect();

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap().is_allowed() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 10);
    }
}
