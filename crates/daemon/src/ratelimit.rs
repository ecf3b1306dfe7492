//! Rate limiting for inbound discovery traffic
//!
//! Authentication alone does not bound CPU: decryption has to be gated.
//! Every UDP listener passes datagrams through a per-source token bucket
//! and a global per-second counter before any crypto runs. Listeners that
//! spawn a task per datagram additionally take a permit from a bounded
//! handler pool.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

/// Rate-limiter tuning.
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Per-source refill rate, tokens per second.
    pub max_messages_per_ip: f64,
    /// Per-source bucket capacity.
    pub burst_size: f64,
    /// Bound on tracked source buckets.
    pub ip_cache_size: usize,
    /// Datagrams admitted to decryption per wall-clock second, globally.
    pub max_global_messages_per_second: u64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_messages_per_ip: 10.0,
            burst_size: 20.0,
            ip_cache_size: 1000,
            max_global_messages_per_second: 1000,
        }
    }
}

/// Interval for dropping idle source buckets.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_used: Instant,
}

struct GlobalWindow {
    window_start: Instant,
    count: u64,
}

/// Per-source token buckets plus a global admission counter.
pub struct RateLimiter {
    config: RateLimiterConfig,
    buckets: Mutex<HashMap<IpAddr, Bucket>>,
    global: Mutex<GlobalWindow>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
            global: Mutex::new(GlobalWindow {
                window_start: Instant::now(),
                count: 0,
            }),
        }
    }

    /// Admit or silently drop a datagram from `src`.
    pub fn allow(&self, src: IpAddr) -> bool {
        self.allow_at(src, Instant::now())
    }

    pub fn allow_at(&self, src: IpAddr, now: Instant) -> bool {
        if !self.allow_global_at(now) {
            debug!(%src, "global rate limit exceeded, dropping datagram");
            return false;
        }

        let mut buckets = self.buckets.lock();
        if !buckets.contains_key(&src) {
            if buckets.len() >= self.config.ip_cache_size {
                evict_lru(&mut buckets);
            }
            buckets.insert(
                src,
                Bucket {
                    tokens: self.config.burst_size,
                    last_refill: now,
                    last_used: now,
                },
            );
        }
        let Some(bucket) = buckets.get_mut(&src) else {
            return false;
        };

        let elapsed = now.saturating_duration_since(bucket.last_refill);
        bucket.tokens = (bucket.tokens
            + elapsed.as_secs_f64() * self.config.max_messages_per_ip)
            .min(self.config.burst_size);
        bucket.last_refill = now;
        bucket.last_used = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            debug!(%src, "rate limited, dropping datagram");
            false
        }
    }

    fn allow_global_at(&self, now: Instant) -> bool {
        let mut global = self.global.lock();
        if now.saturating_duration_since(global.window_start) >= Duration::from_secs(1) {
            global.window_start = now;
            global.count = 0;
        }
        if global.count >= self.config.max_global_messages_per_second {
            return false;
        }
        global.count += 1;
        true
    }

    /// Drop buckets idle past the cleanup interval.
    pub fn cleanup(&self) {
        self.cleanup_at(Instant::now())
    }

    pub fn cleanup_at(&self, now: Instant) {
        self.buckets
            .lock()
            .retain(|_, b| now.saturating_duration_since(b.last_used) < CLEANUP_INTERVAL);
    }

    pub fn tracked_sources(&self) -> usize {
        self.buckets.lock().len()
    }
}

fn evict_lru(buckets: &mut HashMap<IpAddr, Bucket>) {
    if let Some(oldest) = buckets
        .iter()
        .min_by_key(|(_, b)| b.last_used)
        .map(|(ip, _)| *ip)
    {
        buckets.remove(&oldest);
    }
}

/// Fixed-size permit pool bounding per-datagram handler tasks.
#[derive(Clone)]
pub struct HandlerPool {
    semaphore: Arc<Semaphore>,
}

impl HandlerPool {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
        }
    }

    /// Take a permit, or report the pool exhausted. The caller drops the
    /// datagram in that case.
    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => Some(permit),
            Err(_) => {
                warn!("handler pool exhausted, dropping datagram");
                None
            }
        }
    }
}

impl Default for HandlerPool {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(n: u8) -> IpAddr {
        format!("203.0.113.{n}").parse().unwrap()
    }

    #[test]
    fn test_burst_then_reject() {
        let limiter = RateLimiter::new(RateLimiterConfig::default());
        let now = Instant::now();
        for _ in 0..20 {
            assert!(limiter.allow_at(ip(1), now));
        }
        assert!(!limiter.allow_at(ip(1), now));
        // Other sources are unaffected.
        assert!(limiter.allow_at(ip(2), now));
    }

    #[test]
    fn test_refill_over_time() {
        let limiter = RateLimiter::new(RateLimiterConfig::default());
        let now = Instant::now();
        for _ in 0..20 {
            limiter.allow_at(ip(1), now);
        }
        assert!(!limiter.allow_at(ip(1), now));
        // 10 tokens/second: one second restores ten sends.
        let later = now + Duration::from_secs(1);
        for _ in 0..10 {
            assert!(limiter.allow_at(ip(1), later));
        }
        assert!(!limiter.allow_at(ip(1), later));
    }

    #[test]
    fn test_global_limit() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            max_global_messages_per_second: 5,
            ..Default::default()
        });
        let now = Instant::now();
        for n in 0..5 {
            assert!(limiter.allow_at(ip(n), now));
        }
        assert!(!limiter.allow_at(ip(200), now));
        // Next second the window resets.
        assert!(limiter.allow_at(ip(200), now + Duration::from_secs(1)));
    }

    #[test]
    fn test_bucket_table_is_bounded() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            ip_cache_size: 10,
            ..Default::default()
        });
        let now = Instant::now();
        for n in 0..50u8 {
            limiter.allow_at(ip(n), now + Duration::from_millis(n as u64));
        }
        assert!(limiter.tracked_sources() <= 10);
    }

    #[test]
    fn test_cleanup_drops_idle_buckets() {
        let limiter = RateLimiter::new(RateLimiterConfig::default());
        let now = Instant::now();
        limiter.allow_at(ip(1), now);
        limiter.cleanup_at(now + CLEANUP_INTERVAL + Duration::from_secs(1));
        assert_eq!(limiter.tracked_sources(), 0);
    }

    #[test]
    fn test_handler_pool_bounds_concurrency() {
        let pool = HandlerPool::new(2);
        let a = pool.try_acquire().unwrap();
        let _b = pool.try_acquire().unwrap();
        assert!(pool.try_acquire().is_none());
        drop(a);
        assert!(pool.try_acquire().is_some());
    }
}
