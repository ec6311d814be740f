//! Fixed-window request counting per `(provider, client address)`

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

/// Requests allowed per window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub max_requests: u32,
    pub window: Duration,
}

impl RateLimit {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: u32 },
    Limited { retry_after: Duration },
}

/// Shared request counter. Every call counts, allowed or not.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn check(&self, provider: &str, client: &str, limit: RateLimit) -> RateDecision;
}

#[derive(Debug)]
struct Window {
    started: Instant,
    count: u32,
}

/// In-process limiter; the DashMap entry lock makes each
/// check-and-increment atomic per key.
#[derive(Debug, Default)]
pub struct InMemoryRateLimiter {
    windows: DashMap<(String, String), Window>,
}

impl InMemoryRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop windows that ended more than `older_than` ago.
    pub fn purge(&self, older_than: Duration) {
        let now = Instant::now();
        self.windows
            .retain(|_, w| now.duration_since(w.started) < older_than);
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows
            .len()
    }

    fn check_now(&self, provider: &str, client: &str, limit: RateLimit) -> RateDecision {
        let now = Instant::now();
        let mut window = self
            .windows
            .entry((provider.to_string(), client.to_string()))
            .or_insert(Window {
                started: now,
                count: 0,
            });
        if now.duration_since(window.started) >= limit.window {
            window.started = now;
            window.count = 0;
        }
        window.count = window
            .count
            .saturating_add(1);
        if window.count > limit.max_requests {
            let elapsed = now.duration_since(window.started);
            RateDecision::Limited {
                retry_after: limit
                    .window
                    .saturating_sub(elapsed),
            }
        } else {
            RateDecision::Allowed {
                remaining: limit.max_requests - window.count,
            }
        }
    }
}

#[async_trait]
impl RateLimiter for InMemoryRateLimiter {
    async fn check(&self, provider: &str, client: &str, limit: RateLimit) -> RateDecision {
        self.check_now(provider, client, limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn n_plus_one_rejected_other_client_unaffected() {
        let limiter = InMemoryRateLimiter::new();
        let limit = RateLimit::new(3, Duration::from_secs(60));
        for expected in [2, 1, 0] {
            assert_eq!(
                limiter
                    .check("zadarma", "10.0.0.1", limit)
                    .await,
                RateDecision::Allowed {
                    remaining: expected
                }
            );
        }
        assert!(matches!(
            limiter
                .check("zadarma", "10.0.0.1", limit)
                .await,
            RateDecision::Limited { .. }
        ));
        assert!(matches!(
            limiter
                .check("zadarma", "10.0.0.2", limit)
                .await,
            RateDecision::Allowed { remaining: 2 }
        ));
        // Same address, other provider: separate bucket
        assert!(matches!(
            limiter
                .check("onlinepbx", "10.0.0.1", limit)
                .await,
            RateDecision::Allowed { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn window_resets() {
        let limiter = InMemoryRateLimiter::new();
        let limit = RateLimit::new(1, Duration::from_secs(60));
        limiter
            .check("p", "a", limit)
            .await;
        match limiter
            .check("p", "a", limit)
            .await
        {
            RateDecision::Limited { retry_after } => assert_eq!(retry_after, Duration::from_secs(60)),
            other => panic!("expected limited, got {:?}", other),
        }
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(matches!(
            limiter
                .check("p", "a", limit)
                .await,
            RateDecision::Allowed { remaining: 0 }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn purge_drops_old_windows() {
        let limiter = InMemoryRateLimiter::new();
        let limit = RateLimit::new(5, Duration::from_secs(60));
        limiter
            .check("p", "a", limit)
            .await;
        tokio::time::advance(Duration::from_secs(120)).await;
        limiter
            .check("p", "b", limit)
            .await;
        limiter.purge(Duration::from_secs(60));
        assert_eq!(limiter.tracked_keys(), 1);
    }
}
