//! Per-client token bucket limiting for the `Snowflake` RPC.
//!
//! Each peer IP gets a bucket holding up to `burst` tokens that refills at
//! `per_second` tokens per second. A call takes one token; a call that finds
//! the bucket empty is refused with the time until the next token arrives.
//! Buckets that have refilled completely carry no state worth keeping and
//! are dropped once the table grows past [`MAX_TRACKED_CLIENTS`].

use parking_lot::Mutex;
use std::{collections::HashMap, net::IpAddr, time::Instant};

/// Table size above which full buckets are evicted.
pub const MAX_TRACKED_CLIENTS: usize = 10_000;

/// Tokens are kept in thousandths for sub-token refill precision.
const SCALE: u64 = 1_000;

/// Burst size and sustained rate of each client's bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitConfig {
    pub burst: u64,
    pub per_second: f64,
}

#[derive(Debug)]
struct TokenBucket {
    tokens: u64,
    last_refill: Instant,
}

impl TokenBucket {
    fn refill(&mut self, config: &RateLimitConfig, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        let added = (elapsed.as_secs_f64() * config.per_second * SCALE as f64) as u64;
        if added > 0 {
            self.tokens = self.tokens.saturating_add(added).min(config.burst * SCALE);
            self.last_refill = now;
        }
    }

    fn is_full(&self, config: &RateLimitConfig) -> bool {
        self.tokens >= config.burst * SCALE
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: Mutex<HashMap<IpAddr, TokenBucket>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: Mutex::default(),
        }
    }

    /// Takes a token for `client`, or returns the milliseconds until one is
    /// available.
    pub fn check(&self, client: IpAddr) -> Result<(), u64> {
        self.check_at(client, Instant::now())
    }

    fn check_at(&self, client: IpAddr, now: Instant) -> Result<(), u64> {
        let config = &self.config;
        let mut buckets = self.buckets.lock();
        if buckets.len() >= MAX_TRACKED_CLIENTS && !buckets.contains_key(&client) {
            buckets.retain(|_, bucket| {
                bucket.refill(config, now);
                !bucket.is_full(config)
            });
        }

        let bucket = buckets.entry(client).or_insert_with(|| TokenBucket {
            tokens: config.burst * SCALE,
            last_refill: now,
        });
        bucket.refill(config, now);
        if bucket.tokens >= SCALE {
            bucket.tokens -= SCALE;
            return Ok(());
        }

        let missing = (SCALE - bucket.tokens) as f64;
        let retry_after_ms = (missing * 1_000.0 / (config.per_second * SCALE as f64)).ceil();
        Err((retry_after_ms as u64).max(1))
    }

    pub fn tracked_clients(&self) -> usize {
        self.buckets.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::time::Duration;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    fn limiter(burst: u64, per_second: f64) -> RateLimiter {
        RateLimiter::new(RateLimitConfig { burst, per_second })
    }

    #[test]
    fn burst_then_refuses_with_retry_hint() {
        let limiter = limiter(3, 10.0);
        let now = Instant::now();
        for _ in 0..3 {
            assert_eq!(limiter.check_at(ip(1), now), Ok(()));
        }
        assert_eq!(limiter.check_at(ip(1), now), Err(100));
    }

    #[test]
    fn tokens_come_back_at_the_sustained_rate() {
        let limiter = limiter(1, 10.0);
        let start = Instant::now();
        assert_eq!(limiter.check_at(ip(1), start), Ok(()));
        assert!(limiter.check_at(ip(1), start + Duration::from_millis(50)).is_err());
        assert_eq!(limiter.check_at(ip(1), start + Duration::from_millis(150)), Ok(()));
    }

    #[test]
    fn clients_have_separate_buckets() {
        let limiter = limiter(1, 1.0);
        let now = Instant::now();
        assert_eq!(limiter.check_at(ip(1), now), Ok(()));
        assert!(limiter.check_at(ip(1), now).is_err());
        assert_eq!(limiter.check_at(ip(2), now), Ok(()));
    }

    #[test]
    fn full_buckets_are_evicted_when_the_table_is_full() {
        let limiter = limiter(1, 1_000.0);
        let start = Instant::now();
        for n in 0..MAX_TRACKED_CLIENTS as u32 {
            let client = IpAddr::V4(Ipv4Addr::from(n));
            limiter.check_at(client, start).unwrap();
        }
        assert_eq!(limiter.tracked_clients(), MAX_TRACKED_CLIENTS);

        // Every bucket has refilled by now, so all of them go.
        limiter.check_at(ip(200), start + Duration::from_secs(1)).unwrap();
        assert_eq!(limiter.tracked_clients(), 1);
    }
}
