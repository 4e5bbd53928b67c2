//! Named fixed-window rate limiting.
//!
//! Counters live in Redis (`INCR` + `EXPIRE` on the first hit of a
//! window) so limits hold across processes. When Redis is down or not
//! configured, a per-process in-memory window takes over; the limiter
//! never blocks traffic because its own backend failed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

const KEY_PREFIX: &str = "kindred:rl:";

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Serialize)]
pub struct RateDecision {
    pub allowed: bool,
    /// Requests left in the current window (0 when denied)
    pub remaining: u32,
    /// Seconds until the window resets. Only meaningful when denied.
    pub retry_after_secs: u64,
}

/// Limiter counters for health reporting.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RateLimiterStats {
    pub name: String,
    pub allowed: u64,
    pub denied: u64,
}

struct LocalWindow {
    count: u32,
    started_at: Instant,
}

/// A named fixed-window rate limiter keyed by caller identity.
pub struct RateLimiter {
    name: String,
    max_requests: u32,
    window: Duration,
    redis: Option<redis::Client>,
    local: Mutex<HashMap<String, LocalWindow>>,
    allowed: AtomicU64,
    denied: AtomicU64,
}

impl RateLimiter {
    /// Limiter backed by Redis.
    pub fn new(
        name: &str,
        max_requests: u32,
        window: Duration,
        redis_url: &str,
    ) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            name: name.to_string(),
            max_requests,
            window,
            redis: Some(client),
            local: Mutex::new(HashMap::new()),
            allowed: AtomicU64::new(0),
            denied: AtomicU64::new(0),
        })
    }

    /// In-process limiter (no Redis configured).
    #[must_use]
    pub fn in_memory(name: &str, max_requests: u32, window: Duration) -> Self {
        Self {
            name: name.to_string(),
            max_requests,
            window,
            redis: None,
            local: Mutex::new(HashMap::new()),
            allowed: AtomicU64::new(0),
            denied: AtomicU64::new(0),
        }
    }

    fn key(&self, id: &str) -> String {
        format!("{}{}:{}", KEY_PREFIX, self.name, id)
    }

    /// Count one request for `id` and decide whether it may proceed.
    pub async fn check(&self, id: &str) -> RateDecision {
        let decision = match self.check_redis(id).await {
            Some(decision) => decision,
            None => self.check_local(id),
        };
        if decision.allowed {
            self.allowed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.denied.fetch_add(1, Ordering::Relaxed);
            debug!(
                limiter = %self.name,
                id = %id,
                retry_after_secs = decision.retry_after_secs,
                "Rate limit exceeded"
            );
        }
        decision
    }

    async fn check_redis(&self, id: &str) -> Option<RateDecision> {
        let client = self.redis.as_ref()?;
        let mut conn = match client.get_multiplexed_async_connection().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(limiter = %self.name, error = %e, "Redis unavailable, using local window");
                return None;
            }
        };
        let key = self.key(id);

        let count: i64 = match redis::cmd("INCR").arg(&key).query_async(&mut conn).await {
            Ok(count) => count,
            Err(e) => {
                warn!(limiter = %self.name, error = %e, "Redis INCR failed, using local window");
                return None;
            }
        };

        // The window starts with the first request
        if count == 1 {
            let result: Result<(), _> = redis::cmd("EXPIRE")
                .arg(&key)
                .arg(self.window.as_secs())
                .query_async(&mut conn)
                .await;
            if let Err(e) = result {
                warn!(limiter = %self.name, error = %e, "Redis EXPIRE failed");
            }
        }

        if count <= i64::from(self.max_requests) {
            return Some(RateDecision {
                allowed: true,
                remaining: self.max_requests - count as u32,
                retry_after_secs: 0,
            });
        }

        let ttl: i64 = redis::cmd("TTL")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .unwrap_or(-1);
        let retry_after = if ttl > 0 {
            ttl as u64
        } else {
            self.window.as_secs()
        };
        Some(RateDecision {
            allowed: false,
            remaining: 0,
            retry_after_secs: retry_after,
        })
    }

    fn check_local(&self, id: &str) -> RateDecision {
        let mut local = self.local.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();

        let window = local.entry(id.to_string()).or_insert(LocalWindow {
            count: 0,
            started_at: now,
        });
        if now.duration_since(window.started_at) >= self.window {
            window.count = 0;
            window.started_at = now;
        }
        window.count += 1;

        if window.count <= self.max_requests {
            RateDecision {
                allowed: true,
                remaining: self.max_requests - window.count,
                retry_after_secs: 0,
            }
        } else {
            let elapsed = now.duration_since(window.started_at);
            let retry_after = self.window.saturating_sub(elapsed).as_secs().max(1);
            RateDecision {
                allowed: false,
                remaining: 0,
                retry_after_secs: retry_after,
            }
        }
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            name: self.name.clone(),
            allowed: self.allowed.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_allows_up_to_limit_then_denies() {
        let limiter = RateLimiter::in_memory("chat", 5, Duration::from_secs(60));

        for i in 0..5 {
            let decision = limiter.check("user-1").await;
            assert!(decision.allowed, "request {i} should pass");
            assert_eq!(decision.remaining, 4 - i);
        }

        let denied = limiter.check("user-1").await;
        assert!(!denied.allowed);
        assert!(denied.retry_after_secs > 0 && denied.retry_after_secs <= 60);

        let stats = limiter.stats();
        assert_eq!(stats.allowed, 5);
        assert_eq!(stats.denied, 1);
    }

    #[tokio::test]
    async fn test_identities_are_independent() {
        let limiter = RateLimiter::in_memory("chat", 1, Duration::from_secs(60));

        assert!(limiter.check("user-1").await.allowed);
        assert!(!limiter.check("user-1").await.allowed);
        assert!(limiter.check("user-2").await.allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_resets() {
        let limiter = RateLimiter::in_memory("chat", 1, Duration::from_secs(60));

        assert!(limiter.check("user-1").await.allowed);
        assert!(!limiter.check("user-1").await.allowed);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(limiter.check("user-1").await.allowed);
    }
}
